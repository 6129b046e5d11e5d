//! Bounded exponential backoff with jitter.
//!
//! Every call the core makes against a contended or external resource
//! (lock acquisition, versioned-store reference races, collaborator APIs)
//! goes through [`retry`] rather than hand-rolled loops.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Terminal failure after the attempt budget is spent.
///
/// Never retried further by this layer; the last underlying error rides
/// along for diagnosis.
#[derive(Debug, Error)]
#[error("operation '{operation}' exhausted {attempts} retry attempts: {source}")]
pub struct RetryExhaustedError<E: std::error::Error + Send + Sync + 'static> {
    pub operation: String,
    pub attempts: u32,
    #[source]
    pub source: E,
}

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retrying attempt `attempt` (1-based), without jitter.
    ///
    /// `base * 2^(attempt-1)`, saturating, capped at `max_delay`. Kept pure
    /// so the schedule is unit-testable without sleeping.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63);
        let factor = 1u64.checked_shl(exp).unwrap_or(u64::MAX);
        let raw = self
            .base_delay
            .as_millis()
            .saturating_mul(u128::from(factor));
        let capped = raw.min(self.max_delay.as_millis());
        Duration::from_millis(capped as u64)
    }

    /// Full delay including random jitter in `[0, base_delay)`.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let jitter_ms = if self.base_delay.as_millis() > 0 {
            rand::rng().random_range(0..self.base_delay.as_millis() as u64)
        } else {
            0
        };
        (self.delay_for_attempt(attempt) + Duration::from_millis(jitter_ms)).min(self.max_delay)
    }
}

/// Run `operation` up to `policy.max_attempts` times with exponential
/// backoff between failures.
///
/// The caller decides what is retryable by what it passes in here: code
/// that must not be blindly retried (integrity violations, open circuits)
/// belongs outside this wrapper, not inside it.
pub async fn retry<T, E, F, Fut>(
    policy: &BackoffPolicy,
    operation: &str,
    mut f: F,
) -> Result<T, RetryExhaustedError<E>>
where
    E: std::error::Error + Send + Sync + 'static,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 1u32;
    loop {
        match f().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation, attempt, "operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if attempt >= policy.max_attempts => {
                warn!(operation, attempt, error = %err, "retry budget exhausted");
                return Err(RetryExhaustedError {
                    operation: operation.to_string(),
                    attempts: attempt,
                    source: err,
                });
            }
            Err(err) => {
                let delay = policy.jittered_delay(attempt);
                debug!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "attempt failed, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
