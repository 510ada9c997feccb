//! Bounded retry for connections to listeners that are still starting up

use crate::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, trace};

/// Fixed-delay retry bounded by an attempt count.
///
/// Only errors for which [`Error::is_transient`] holds are retried. After the
/// last attempt the last error is returned unchanged, so `max_attempts * delay`
/// is the effective timeout of the operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 400,
            delay: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out
    pub async fn retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if self.max_attempts == 0 {
            return Err(Error::Config(format!(
                "retry policy for {} needs at least one attempt",
                what
            )));
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("{} succeeded after {} attempts", what, attempt);
                    }
                    return Ok(value);
                }
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    trace!("{} not ready (attempt {}): {}", what, attempt, e);
                    tokio::time::sleep(self.delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
