use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;
use tracing::{error, warn};

/// Tuning for bounded retry with exponential backoff.
///
/// `initial_delay` is applied before the very first attempt as a rate-shaping
/// measure; it can be set to zero to disable that behavior.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Terminal outcome of a retried operation that never succeeded.
#[derive(Debug, Error)]
pub enum RetryError {
    #[error("Rate limit exceeded after {attempts} attempts: {last_error}")]
    RateLimited { attempts: u32, last_error: String },

    #[error("Non-retryable error after {attempts} attempt(s): {last_error}")]
    NonRetryable { attempts: u32, last_error: String },
}

impl RetryError {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::RateLimited { attempts, .. } => *attempts,
            RetryError::NonRetryable { attempts, .. } => *attempts,
        }
    }

    pub fn last_error(&self) -> &str {
        match self {
            RetryError::RateLimited { last_error, .. } => last_error,
            RetryError::NonRetryable { last_error, .. } => last_error,
        }
    }
}

/// Heuristic classification of upstream rate-limit errors by message text.
pub fn is_rate_limit_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    message.contains("429")
        || lower.contains("quota")
        || lower.contains("rate")
        || lower.contains("too many requests")
        || lower.contains("rate limit")
}

/// Bounded-retry executor shared by every external-API call site.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Delay to sleep before the given zero-based attempt.
    ///
    /// Attempt 0 gets the flat `initial_delay`; later attempts back off
    /// exponentially with optional uniform jitter in [0, 1) seconds, capped
    /// at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return self.config.initial_delay;
        }
        let mut secs = self.config.base_delay.as_secs_f64()
            * self.config.backoff_multiplier.powi(attempt as i32);
        if self.config.jitter {
            secs += rand::random::<f64>();
        }
        Duration::from_secs_f64(secs.min(self.config.max_delay.as_secs_f64()))
    }

    /// Run `operation` up to `max_attempts` times.
    ///
    /// Failures are classified by `is_retryable` over the rendered error
    /// text: retryable failures consume the remaining budget, anything else
    /// short-circuits immediately. The returned `RetryError` carries the
    /// attempt count and last error so callers can shape their own failure
    /// payloads.
    pub async fn execute<T, F, Fut, C>(
        &self,
        mut operation: F,
        is_retryable: C,
        context: &str,
    ) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
        C: Fn(&str) -> bool,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 0..max_attempts {
            let delay = self.delay_for(attempt);
            if attempt > 0 {
                warn!(
                    context,
                    attempt = attempt + 1,
                    max_attempts,
                    delay_secs = delay.as_secs_f64(),
                    "rate limit hit, backing off before retry"
                );
            }
            if !delay.is_zero() {
                sleep(delay).await;
            }

            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    last_error = format!("{err:#}");
                    if is_retryable(&last_error) {
                        if attempt + 1 < max_attempts {
                            continue;
                        }
                        error!(context, attempts = max_attempts, "retry budget exhausted");
                        return Err(RetryError::RateLimited {
                            attempts: max_attempts,
                            last_error,
                        });
                    }
                    error!(context, error = %last_error, "non-retryable error");
                    return Err(RetryError::NonRetryable {
                        attempts: attempt + 1,
                        last_error,
                    });
                }
            }
        }

        Err(RetryError::RateLimited {
            attempts: max_attempts,
            last_error,
        })
    }
}

/// User-facing apology for an exhausted rate-limit budget.
pub fn rate_limit_message(attempts: u32) -> String {
    format!(
        "Rate limit exceeded after {attempts} attempts. Please wait a few minutes before trying again."
    )
}

pub const RATE_LIMIT_SUGGESTION: &str =
    "Consider processing requests in smaller batches or with longer intervals between requests.";

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn no_delay_config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::ZERO,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn delay_schedule_with_jitter_disabled() {
        let policy = RetryPolicy::new(RetryConfig {
            max_attempts: 4,
            initial_delay: Duration::from_secs(1),
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: false,
        });

        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(4));
        assert_eq!(policy.delay_for(2), Duration::from_secs(8));
        // 2 * 2^3 = 16, capped at max_delay
        assert_eq!(policy.delay_for(3), Duration::from_secs(10));
    }

    #[test]
    fn rate_limit_classification() {
        for retryable in [
            "HTTP 429 from provider",
            "Quota exceeded for project",
            "rate limiting in effect",
            "Too Many Requests",
            "hit the RATE LIMIT",
        ] {
            assert!(is_rate_limit_error(retryable), "{retryable}");
        }
        for fatal in ["500 internal error", "invalid json", "timeout"] {
            assert!(!is_rate_limit_error(fatal), "{fatal}");
        }
    }

    #[tokio::test]
    async fn returns_first_success_without_further_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(no_delay_config(3));

        let counter = calls.clone();
        let result = policy
            .execute(
                move || {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, anyhow::Error>("ok")
                    }
                },
                is_rate_limit_error,
                "test",
            )
            .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhaustion_invokes_operation_exactly_max_attempts_times() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(no_delay_config(2));

        let counter = calls.clone();
        let result: Result<(), _> = policy
            .execute(
                move || {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Err(anyhow::anyhow!("429 too many requests"))
                    }
                },
                is_rate_limit_error,
                "test",
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        match result {
            Err(RetryError::RateLimited { attempts, .. }) => assert_eq!(attempts, 2),
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_retryable_error_short_circuits_after_one_call() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(no_delay_config(3));

        let counter = calls.clone();
        let result: Result<(), _> = policy
            .execute(
                move || {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Err(anyhow::anyhow!("invalid json in response"))
                    }
                },
                is_rate_limit_error,
                "test",
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        match result {
            Err(RetryError::NonRetryable { attempts, .. }) => assert_eq!(attempts, 1),
            other => panic!("expected NonRetryable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn recovers_when_a_later_attempt_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(no_delay_config(3));

        let counter = calls.clone();
        let result = policy
            .execute(
                move || {
                    let counter = counter.clone();
                    async move {
                        if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                            Err(anyhow::anyhow!("quota exhausted, retry later"))
                        } else {
                            Ok(42)
                        }
                    }
                },
                is_rate_limit_error,
                "test",
            )
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
