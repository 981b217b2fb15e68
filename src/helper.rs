//! Helper utilities for Tetherd
//!
//! This module provides common utility functions used throughout the application.

use rand::distributions::Alphanumeric;
use rand::Rng;

/// Default connection timeout in seconds
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Random alphanumeric secret of `len` characters
pub fn random_secret(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Split `host:port`, accepting bracketed IPv6 literals (`[::1]:80`).
pub fn split_host_port(addr: &str) -> Option<(String, u16)> {
    let (host, port) = addr.rsplit_once(':')?;
    let port = port.parse::<u16>().ok()?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() || (host.contains(':') && !addr.starts_with('[')) {
        return None;
    }
    Some((host.to_string(), port))
}

/// Local host name, used as the default agent identity
pub fn default_client_id() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "tetherd-agent".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_secret() {
        let a = random_secret(32);
        let b = random_secret(32);
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
        assert!(random_secret(0).is_empty());
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(
            split_host_port("example.com:80"),
            Some(("example.com".to_string(), 80))
        );
        assert_eq!(
            split_host_port("10.0.0.1:22"),
            Some(("10.0.0.1".to_string(), 22))
        );
        assert_eq!(split_host_port("[::1]:443"), Some(("::1".to_string(), 443)));
        assert_eq!(split_host_port("example.com"), None);
        assert_eq!(split_host_port(":80"), None);
        assert_eq!(split_host_port("example.com:http"), None);
        assert_eq!(split_host_port("::1:443"), None);
    }

    #[test]
    fn test_default_client_id_not_empty() {
        assert!(!default_client_id().is_empty());
    }
}
