//! Fibonacci backoff for transient cluster errors.
//!
//! The sequence grows more slowly than exponential backoff, which suits
//! API calls that usually recover within a few seconds. Sequence with
//! the defaults: 1s, 1s, 2s, 3s, 5s, 8s, 13s, 21s, 30s (max).

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::GatewayError;

/// Default cap on a single backoff interval.
pub const MAX_BACKOFF_SECS: u64 = 30;

/// Fibonacci backoff calculator.
///
/// Each backoff is the sum of the previous two, capped at a maximum.
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    min_secs: u64,
    prev_secs: u64,
    current_secs: u64,
    max_secs: u64,
}

impl FibonacciBackoff {
    #[must_use]
    pub fn new(min_secs: u64, max_secs: u64) -> Self {
        Self {
            min_secs,
            prev_secs: 0,
            current_secs: min_secs,
            max_secs,
        }
    }

    /// Get the next backoff duration and advance the sequence.
    pub fn next_backoff(&mut self) -> Duration {
        let result = Duration::from_secs(self.current_secs);
        let next = self.prev_secs + self.current_secs;
        self.prev_secs = self.current_secs;
        self.current_secs = std::cmp::min(next, self.max_secs);
        result
    }

    /// Reset the backoff to the initial state.
    pub fn reset(&mut self) {
        self.prev_secs = 0;
        self.current_secs = self.min_secs;
    }
}

impl Default for FibonacciBackoff {
    fn default() -> Self {
        Self::new(1, MAX_BACKOFF_SECS)
    }
}

/// Runs `f`, retrying transient failures up to `attempts` times with
/// Fibonacci backoff. Non-transient errors are returned immediately.
pub async fn with_retries<T, F, Fut>(op: &str, attempts: u32, f: F) -> Result<T, GatewayError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, GatewayError>>,
{
    let mut backoff = FibonacciBackoff::default();
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt + 1 < attempts => {
                attempt += 1;
                let delay = backoff.next_backoff();
                warn!(
                    "{op} failed ({e}), retrying in {}s (attempt {attempt}/{attempts})",
                    delay.as_secs()
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
