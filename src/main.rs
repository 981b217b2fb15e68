//! Tetherd - Peer-to-peer Tunnel Agent
//!
//! This is the main entry point for the Tetherd application.

use anyhow::{bail, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tetherd::config::{load_config, write_template, Config, TetherConfig};
use tetherd::helper::default_client_id;
use tetherd::{Router, TetherError};
use tracing::{error, info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Tetherd - tunnel agent multiplexing SOCKS5 and TCP relay traffic over tethers
#[derive(Parser, Debug)]
#[command(name = "tetherd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (TOML, or JSON with a .json extension)
    #[arg(short, long, default_value = "tetherd.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Enable JSON logging format
    #[arg(long)]
    json_log: bool,

    /// Write a template configuration and exit
    #[arg(long)]
    init: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    setup_logging(&args.log_level, args.json_log)?;

    if args.init || !args.config.exists() {
        return init_config(&args.config, args.init);
    }

    let config = load_config(&args.config)?;

    info!("Tetherd v{}", tetherd::VERSION);
    info!("Configuration loaded from: {:?}", args.config);
    info!("Client id: {}", config.agent.client_id);

    let router = Router::new(&config);

    for tether in config.effective_tethers() {
        let pool_size = tether.effective_pool_size(config.agent.pool_size);
        spawn_tether(router.clone(), tether, pool_size, &config);
    }

    let mut bound = 0;
    for listener in config.listeners.iter().cloned() {
        let label = listener.label();
        match router.serve(listener).await {
            Ok(_) => bound += 1,
            Err(e) => error!("Listener '{}' failed to start: {:#}", label, e),
        }
    }
    if !config.listeners.is_empty() && bound == 0 {
        router.shutdown();
        bail!("None of the {} listeners could bind", config.listeners.len());
    }

    wait_for_signals(&router, &args.config).await?;
    router.shutdown();
    Ok(())
}

/// Connect a tether, retrying in the background until it comes up
fn spawn_tether(router: Arc<Router>, tether: TetherConfig, pool_size: usize, config: &Config) {
    let policy = backoff::ExponentialBackoff {
        max_elapsed_time: None,
        ..config.pool.reconnect_backoff()
    };
    tokio::spawn(async move {
        let name = tether.name.clone();
        let result = backoff::future::retry(policy, || {
            let router = router.clone();
            let tether = tether.clone();
            async move {
                router
                    .connect_tether(&tether, pool_size)
                    .await
                    .map_err(|e| match e {
                        TetherError::Config(_) | TetherError::SessionClosed => {
                            backoff::Error::permanent(e)
                        }
                        e => {
                            warn!("Tether '{}' not connected, retrying: {}", tether.name, e);
                            backoff::Error::transient(e)
                        }
                    })
            }
        })
        .await;
        if let Err(e) = result {
            error!("Tether '{}' gave up: {}", name, e);
        }
    });
}

/// Block until a termination signal; SIGHUP reloads routing and credentials
async fn wait_for_signals(router: &Router, config_path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received Ctrl+C, shutting down...");
                    return Ok(());
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    return Ok(());
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP, reloading {:?}", config_path);
                    match load_config(config_path) {
                        Ok(config) => router.reconfigure(&config),
                        Err(e) => error!("Reload failed, keeping current configuration: {:#}", e),
                    }
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = (router, config_path);
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
        Ok(())
    }
}

/// Write a template configuration
fn init_config(path: &Path, explicit: bool) -> Result<()> {
    if explicit && path.exists() {
        bail!("{:?} already exists; refusing to overwrite", path);
    }
    write_template(path, &default_client_id())?;
    info!("Wrote template configuration to {:?}", path);
    info!("Review the generated secrets and tether addresses, then start tetherd again");
    Ok(())
}

/// Setup logging based on configuration
fn setup_logging(level: &str, json: bool) -> Result<()> {
    let level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string().to_lowercase()));

    if json {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    Ok(())
}
