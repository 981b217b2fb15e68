//! Pooled session structure
//!
//! Represents a single multiplex session in a tether pool with metadata.

use crate::mux::Session;
use std::time::Instant;

/// A pooled session with metadata
#[derive(Debug, Clone)]
pub struct PooledSession {
    /// The underlying session
    pub(crate) session: Session,
    /// When a stream was last opened on the session
    pub(crate) last_used: Instant,
}

impl PooledSession {
    /// Wrap a freshly established session
    pub fn new(session: Session) -> Self {
        PooledSession {
            session,
            last_used: Instant::now(),
        }
    }

    /// False once the link under the session died
    pub fn is_alive(&self) -> bool {
        !self.session.is_dead()
    }

    /// Mark the session as used
    pub fn touch(&mut self) {
        self.last_used = Instant::now();
    }
}
