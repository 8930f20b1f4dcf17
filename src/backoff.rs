//! Exponential backoff for transient broker and channel errors.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::Result;

/// Backoff schedule: `initial * multiplier^attempt`, capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Total attempts including the first. 0 is treated as 1.
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(5),
            max_attempts: 5,
        }
    }
}

/// Delay before retry number `attempt` (0-based).
pub fn calculate_backoff(config: &BackoffConfig, attempt: u32) -> Duration {
    let factor = config.multiplier.max(1.0).powi(attempt.min(32) as i32);
    let delay = config.initial_delay.as_secs_f64() * factor;
    Duration::from_secs_f64(delay.min(config.max_delay.as_secs_f64()))
}

/// Run `op` until it succeeds, fails permanently, or attempts run out.
/// Only errors where [`crate::error::Error::is_transient`] holds are retried.
pub async fn retry_transient<T, F, Fut>(config: &BackoffConfig, operation: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt + 1 < max_attempts => {
                let delay = calculate_backoff(config, attempt);
                warn!(
                    operation,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "transient error: {e}, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
