//! Bounded exponential-backoff retry for transient failures

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::error::Result;

/// Base delay for exponential backoff
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(500);

/// Upper bound for a single backoff delay
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(10);

/// Retry policy applied beneath the circuit breaker
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: bool,
}

impl RetryPolicy {
    /// Create a policy allowing `max_retries` retries after the first attempt
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            jitter: true,
        }
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Disable random jitter (deterministic delays)
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Backoff before retry number `attempt` (0-based): `base * 2^attempt`, capped
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        // Up to 10% random variation
        let spread = delay.as_millis() as u64 / 10;
        let extra = rand::thread_rng().gen_range(0..=spread);
        (delay + Duration::from_millis(extra)).min(self.max_delay)
    }

    /// Run `op`, retrying retryable errors until attempts are exhausted.
    ///
    /// The final error is returned unchanged, so an exhausted sequence is a
    /// single failure to whoever wraps this call.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;

        loop {
            match op().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(operation = label, attempt, "Succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if err.is_retryable() && attempt < self.max_retries => {
                    let delay = self.jittered(self.delay_for(attempt));
                    warn!(
                        operation = label,
                        attempt = attempt + 1,
                        wait_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient failure, retrying after backoff"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}
