//! Conflict retry with exponential backoff and jitter
//!
//! Saves against the backing ConfigMap use optimistic concurrency: a write
//! that loses the race comes back as a 409 and is retried after a jittered,
//! exponentially growing delay. Any other error returns immediately.

use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::{Error, Result};

/// Backoff parameters for conflict retries
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Total number of attempts (first try included)
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Multiplier applied to the delay after each attempt
    pub backoff_factor: f64,
    /// Relative jitter applied to each delay (0.1 = plus or minus 10%)
    pub jitter: f64,
}

impl RetryConfig {
    /// Create a config with the standard backoff shape (factor 1.5, jitter 0.1)
    pub fn new(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            backoff_factor: 1.5,
            jitter: 0.1,
        }
    }
}

/// Whether an error is an optimistic-concurrency conflict worth retrying
pub fn is_conflict(err: &Error) -> bool {
    matches!(err, Error::Kube(kube::Error::Api(ae)) if ae.code == 409)
}

/// Run `operation` until it succeeds, fails with a non-conflict error, or
/// the attempt budget is exhausted
///
/// Exhaustion surfaces as [`Error::Conflict`] so callers can tell a lost
/// race apart from a permanent API failure.
pub async fn retry_on_conflict<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut delay = config.initial_delay;

    for attempt in 1..=config.max_attempts {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if is_conflict(&e) => {
                if attempt == config.max_attempts {
                    warn!(
                        operation = %operation_name,
                        attempts = attempt,
                        "conflict persisted through every retry"
                    );
                    return Err(Error::Conflict(attempt));
                }

                let jittered = jittered(delay, config.jitter);
                debug!(
                    operation = %operation_name,
                    attempt = attempt,
                    delay_ms = jittered.as_millis() as u64,
                    "conflict, retrying"
                );
                tokio::time::sleep(jittered).await;
                delay = Duration::from_secs_f64(delay.as_secs_f64() * config.backoff_factor);
            }
            Err(e) => return Err(e),
        }
    }

    Err(Error::Conflict(config.max_attempts))
}

fn jittered(delay: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return delay;
    }
    let factor = 1.0 + rand::thread_rng().gen_range(-jitter..jitter);
    Duration::from_secs_f64(delay.as_secs_f64() * factor)
}
