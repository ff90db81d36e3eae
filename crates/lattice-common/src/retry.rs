//! Bounded retries for writes that must not be lost
//!
//! Once a backend snapshot has been cut, the controller retries its status
//! and content writes a fixed number of times before giving up and letting
//! the queue take over.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

/// How many times to try and how long to wait in between
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryConfig {
    /// Total attempts including the first; at least one is always made
    pub attempts: u32,
    /// Pause between attempts
    pub interval: Duration,
}

impl RetryConfig {
    /// `attempts` tries with `interval` between each
    pub fn fixed(attempts: u32, interval: Duration) -> Self {
        Self { attempts, interval }
    }
}

/// `base` stretched by a random factor in `[1.0, 1.2)`
///
/// Spreads out replicas that would otherwise poll in lockstep.
pub fn jittered(base: Duration) -> Duration {
    base.mul_f64(rand::thread_rng().gen_range(1.0..1.2))
}

/// Run `operation` until it succeeds or the attempts run out
///
/// Returns the last error when every attempt failed.
pub async fn with_retries<F, Fut, T, E>(
    config: &RetryConfig,
    what: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let attempts = config.attempts.max(1);
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation = what, attempt, "succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if attempt >= attempts => {
                warn!(operation = what, attempts, error = %e, "giving up");
                return Err(e);
            }
            Err(e) => {
                let delay = config.interval;
                debug!(
                    operation = what,
                    attempt,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "attempt failed"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
