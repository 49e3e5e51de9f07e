//! Reconnect backoff and timeout utilities.
//!
//! The helpers in this module are transport-agnostic. The stream transport
//! uses [`BackoffPolicy`] to space out reconnect attempts and
//! [`with_timeout`] to bound how long opening a connection may take.

use std::future::Future;
use std::time::Duration;

/// Policy controlling reconnect attempts and exponential backoff growth.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Maximum number of reconnect attempts before giving up.
    pub max_attempts: u32,
    /// Delay used before the first reconnect attempt.
    pub initial_backoff: Duration,
    /// Upper bound for exponential backoff delay growth.
    pub max_backoff: Duration,
}

impl BackoffPolicy {
    /// Creates a policy from its three parameters.
    pub fn new(max_attempts: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts,
            initial_backoff,
            max_backoff,
        }
    }

    /// Computes the delay to wait before the next reconnect.
    ///
    /// `attempts` is the number of reconnects already scheduled for the
    /// current failure streak, so the sequence is `d, 2d, 4d, ...` capped at
    /// `max_backoff`.
    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        let mut delay = std::cmp::min(self.initial_backoff, self.max_backoff);
        for _ in 0..attempts {
            if delay >= self.max_backoff {
                break;
            }
            delay = std::cmp::min(delay.saturating_mul(2), self.max_backoff);
        }
        delay
    }

    /// Returns true once `attempts` has reached the attempt ceiling.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(1_000),
            max_backoff: Duration::from_millis(10_000),
        }
    }
}

/// Applies a timeout to an async computation.
pub async fn with_timeout<T, Fut>(
    timeout: Duration,
    future: Fut,
) -> Result<T, tokio::time::error::Elapsed>
where
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, future).await
}
