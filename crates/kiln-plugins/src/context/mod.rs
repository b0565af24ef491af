//! Deadlines and cancellation for plugin calls.
//!
//! Every call carries a [`CallContext`]. It is built from a timeout, so a
//! call without a bound cannot be expressed. An optional
//! [`CancellationToken`] lets another thread abandon the wait early.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::error::{PluginError, TimedOperation};

/// Stand-in deadline for timeouts too large to add to [`Instant::now`].
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// Shared flag a caller flips to abandon in-flight calls.
///
/// Clones share the flag.
///
/// # Example
///
/// ```
/// use kiln_plugins::CancellationToken;
///
/// let token = CancellationToken::new();
/// let observer = token.clone();
/// token.cancel();
/// assert!(observer.is_cancelled());
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Creates a token that has not been cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Deadline and cancellation state for one call.
#[derive(Debug, Clone)]
pub struct CallContext {
    deadline: Instant,
    timeout: Duration,
    token: Option<CancellationToken>,
}

impl CallContext {
    /// Creates a context expiring `timeout` from now.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        let now = Instant::now();
        Self {
            deadline: now
                .checked_add(timeout)
                .unwrap_or_else(|| now + FAR_FUTURE),
            timeout,
            token: None,
        }
    }

    /// Attaches a cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.token = Some(token);
        self
    }

    /// The instant the call must finish by.
    #[must_use]
    pub const fn deadline(&self) -> Instant {
        self.deadline
    }

    /// The budget the context was created with.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Time left before the deadline, zero once it has passed.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Whether the deadline has passed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Whether the attached token was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }

    /// Fails if the call was cancelled or has run out of time. Cancellation
    /// wins when both apply.
    pub(crate) fn check(&self, id: &str, operation: TimedOperation) -> Result<(), PluginError> {
        if self.is_cancelled() {
            return Err(PluginError::Cancelled {
                id: id.to_owned(),
                operation,
            });
        }
        if self.is_expired() {
            return Err(PluginError::Timeout {
                id: id.to_owned(),
                operation,
                timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests;
