//! Retrying access to the daemon's control socket.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::ViciError;
use crate::vici::{Connector, Session};

/// How persistently to open a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total connection attempts, at least one.
    pub attempts: u32,
    /// Pause between attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// `attempts` tries with no pause in between.
    #[must_use]
    pub fn immediate(attempts: u32) -> Self {
        Self {
            attempts,
            delay: Duration::ZERO,
        }
    }
}

/// Opens sessions to charon, retrying transient failures.
#[derive(Clone)]
pub struct ConnectionClient {
    connector: Arc<dyn Connector>,
    retry: RetryPolicy,
}

impl std::fmt::Debug for ConnectionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionClient")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl ConnectionClient {
    /// Creates a client with the default retry policy.
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            retry: RetryPolicy::default(),
        }
    }

    /// Replaces the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// The retry policy in use.
    pub fn retry(&self) -> RetryPolicy {
        self.retry
    }

    /// Opens a session, blocking between attempts.
    ///
    /// The returned guard closes the session when dropped.
    pub fn session(&self) -> Result<SessionGuard, ViciError> {
        let attempts = self.retry.attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.connector.connect() {
                Ok(session) => {
                    if attempt > 1 {
                        debug!(attempt, "connected to charon after retry");
                    }
                    return Ok(SessionGuard { inner: session });
                }
                Err(e) if attempt < attempts => {
                    if attempt > 1 {
                        warn!(attempt, error = %e, "failed to connect to charon");
                    }
                    attempt += 1;
                    if !self.retry.delay.is_zero() {
                        std::thread::sleep(self.retry.delay);
                    }
                }
                Err(e) => {
                    warn!(attempt, error = %e, "giving up connecting to charon");
                    return Err(e);
                }
            }
        }
    }

    /// Checks that the daemon answers a `list-conns` request.
    pub fn probe(&self) -> Result<(), ViciError> {
        let mut session = self.session()?;
        session.list_conns(None).map(|_| ())
    }
}

/// An open session that is closed on drop.
pub struct SessionGuard {
    inner: Box<dyn Session>,
}

impl Deref for SessionGuard {
    type Target = dyn Session;

    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl DerefMut for SessionGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.inner.as_mut()
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.inner.close();
    }
}
