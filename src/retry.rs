//! Retry policy
//!
//! Bounds how many model calls a stage may make and how long to wait between
//! them. The pipeline's default is two attempts (one retry) with a short
//! fixed pause.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use nutriwealth_pipeline::retry::{retry_if, RetryPolicy};
//!
//! let policy = RetryPolicy::fixed(2, Duration::from_millis(100));
//! let response = retry_if(&policy, || worker.invoke(&request), |e| e.is_transport()).await?;
//! ```

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry policy configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Never below 1.
    pub max_attempts: u32,
    /// Pause between attempts.
    pub strategy: RetryStrategy,
}

/// Retry backoff strategy
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    /// Fixed delay between retries
    Fixed(Duration),
    /// Exponential backoff (delay doubles each time)
    Exponential {
        /// Delay before the first retry.
        initial_delay: Duration,
        /// Cap on any single delay.
        max_delay: Duration,
    },
}

impl RetryPolicy {
    /// Create policy with fixed delay
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            strategy: RetryStrategy::Fixed(delay),
        }
    }

    /// Create policy with exponential backoff capped at 10 s
    pub fn exponential(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            strategy: RetryStrategy::Exponential {
                initial_delay,
                max_delay: Duration::from_secs(10),
            },
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        match &self.strategy {
            RetryStrategy::Fixed(delay) => *delay,
            RetryStrategy::Exponential {
                initial_delay,
                max_delay,
            } => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                initial_delay.saturating_mul(factor).min(*max_delay)
            }
        }
    }

    /// Whether another attempt is allowed after `attempts_made`.
    pub fn allows_another(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(2, Duration::from_millis(100))
    }
}

/// Conditional retry: only retry while `should_retry` accepts the error.
///
/// Returns the first success, the first non-retryable error, or the last
/// error once `policy.max_attempts` calls have been made.
pub async fn retry_if<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    mut f: F,
    mut should_retry: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: FnMut(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempt = 0;

    loop {
        attempt += 1;

        match f().await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(attempt, "retry: operation succeeded after retries");
                }
                return Ok(result);
            }
            Err(e) => {
                if !should_retry(&e) {
                    debug!(error = %e, "retry: error is not retryable");
                    return Err(e);
                }

                if !policy.allows_another(attempt) {
                    warn!(attempts = attempt, error = %e, "retry: all attempts exhausted");
                    return Err(e);
                }

                let delay = with_jitter(policy.calculate_delay(attempt));
                warn!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "retry: retrying");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Add up to 25% random jitter to a delay.
pub fn with_jitter(duration: Duration) -> Duration {
    let quarter = duration.as_millis() / 4;
    if quarter == 0 {
        return duration;
    }
    let jitter = rand::thread_rng().gen_range(0..quarter);
    duration + Duration::from_millis(jitter as u64)
}
