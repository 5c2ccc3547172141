//! Bounded retries with exponential backoff and jitter
//!
//! Only failures classified as retryable (lock contention) are retried.
//! Everything else returns after the first attempt so the fallback layer
//! can decide what to do with it.
use super::classification::{ErrorClassification, ErrorClassifier};
use crate::{StorageError, StorageResult};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Upper bound of the jitter added to each delay (fraction of the delay)
const JITTER_FACTOR: f64 = 0.25;

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,

    /// Delay before the first retry
    #[serde(with = "duration_ms")]
    pub base_delay: Duration,

    /// Maximum delay cap
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,

    /// Add random jitter to each delay
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Configuration that never retries
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Backoff schedule for this configuration
    pub fn backoff(&self) -> ExponentialBackoff {
        let backoff = ExponentialBackoff::new(self.base_delay, self.max_delay);
        if self.jitter {
            backoff.with_jitter(JITTER_FACTOR)
        } else {
            backoff
        }
    }
}

/// Exponential backoff: delay = base * 2^attempt, capped at max_delay
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base_delay: Duration,
    max_delay: Duration,

    /// Jitter factor (0.0 - 1.0) - extra random fraction added to the delay
    jitter_factor: f64,
}

impl ExponentialBackoff {
    /// Create new exponential backoff without jitter
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            jitter_factor: 0.0,
        }
    }

    /// Create with custom jitter factor
    pub fn with_jitter(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry number `attempt` (0-based)
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let multiplier = 2_u128.checked_pow(attempt).unwrap_or(u128::MAX);
        let exponential_ms = self.base_delay.as_millis().saturating_mul(multiplier);
        let max_ms = self.max_delay.as_millis();
        let capped_ms = exponential_ms.min(max_ms);

        let jitter = capped_ms as f64 * self.jitter_factor * rand::random::<f64>();
        let final_ms = (capped_ms as f64 + jitter).min(max_ms as f64).max(0.0);

        Duration::from_millis(final_ms as u64)
    }
}

/// Result of running an operation through the retry executor
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub success: bool,
    pub value: Option<T>,

    /// Number of times the operation was invoked
    pub attempts: u32,

    /// Message of every failed attempt, in order
    pub errors: Vec<String>,

    pub last_error: Option<StorageError>,
    pub last_classification: Option<ErrorClassification>,
}

impl<T> RetryOutcome<T> {
    fn succeeded(value: T, attempts: u32, errors: Vec<String>) -> Self {
        Self {
            success: true,
            value: Some(value),
            attempts,
            errors,
            last_error: None,
            last_classification: None,
        }
    }
}

/// Run `operation`, retrying retryable failures with exponential backoff
pub async fn execute_with_retry<T, F, Fut>(mut operation: F, config: &RetryConfig) -> RetryOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StorageResult<T>>,
{
    let classifier = ErrorClassifier::new();
    let backoff = config.backoff();
    let mut errors = Vec::new();
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;

        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(attempt, "Storage operation succeeded after retry");
                }
                return RetryOutcome::succeeded(value, attempt, errors);
            }
            Err(error) => {
                let classification = classifier.classify_storage_error(&error);
                errors.push(error.to_string());

                let retries_used = attempt - 1;
                if !classification.retryable || retries_used >= config.max_retries {
                    if classification.retryable {
                        tracing::warn!(
                            attempt,
                            max_retries = config.max_retries,
                            error = %error,
                            "Max retry attempts reached"
                        );
                    } else {
                        tracing::debug!(
                            attempt,
                            category = %classification.category,
                            error = %error,
                            "Non-retryable storage failure"
                        );
                    }

                    return RetryOutcome {
                        success: false,
                        value: None,
                        attempts: attempt,
                        errors,
                        last_error: Some(error),
                        last_classification: Some(classification),
                    };
                }

                let delay = backoff.next_delay(retries_used);
                tracing::info!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    remaining = config.max_retries - retries_used,
                    error = %error,
                    "Retrying after delay"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Serde helper storing durations as integer milliseconds
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::classification::ErrorCategory;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_config(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter: false,
        }
    }

    #[test]
    fn test_exponential_backoff_delays() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(10));

        assert_eq!(backoff.next_delay(0).as_millis(), 100);
        assert_eq!(backoff.next_delay(1).as_millis(), 200);
        assert_eq!(backoff.next_delay(2).as_millis(), 400);
    }

    #[test]
    fn test_exponential_backoff_max_delay() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(1));

        // Should cap at max_delay (1000ms)
        assert_eq!(backoff.next_delay(10).as_millis(), 1000);
        assert_eq!(backoff.next_delay(200).as_millis(), 1000);
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(10))
            .with_jitter(0.5);

        for _ in 0..50 {
            let delay = backoff.next_delay(1).as_millis();
            assert!((200..=300).contains(&delay), "delay {} out of range", delay);
        }
    }

    #[test]
    fn test_jitter_never_exceeds_cap() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_millis(150))
            .with_jitter(1.0);

        for _ in 0..50 {
            assert!(backoff.next_delay(3).as_millis() <= 150);
        }
    }

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.base_delay, Duration::from_millis(100));
        assert_eq!(config.max_delay, Duration::from_secs(2));
        assert!(config.jitter);
    }

    #[test]
    fn test_retry_config_serializes_millis() {
        let json = serde_json::to_value(fast_config(2)).unwrap();
        assert_eq!(json["base_delay"], 1);
        assert_eq!(json["max_delay"], 5);

        let parsed: RetryConfig = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, fast_config(2));
    }

    #[tokio::test]
    async fn test_succeeds_first_try() {
        let outcome = execute_with_retry(|| async { Ok::<_, StorageError>(7) }, &fast_config(3)).await;

        assert!(outcome.success);
        assert_eq!(outcome.value, Some(7));
        assert_eq!(outcome.attempts, 1);
        assert!(outcome.errors.is_empty());
    }

    #[tokio::test]
    async fn test_retries_busy_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let outcome = execute_with_retry(
            || {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(StorageError::other("SQLITE_BUSY: database is locked"))
                    } else {
                        Ok("done")
                    }
                }
            },
            &fast_config(2),
        )
        .await;

        assert!(outcome.success);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.errors.len(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let outcome = execute_with_retry(
            || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(StorageError::other("database is locked")) }
            },
            &fast_config(2),
        )
        .await;

        assert!(!outcome.success);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            outcome.last_classification.map(|c| c.category),
            Some(ErrorCategory::Busy)
        );
    }

    #[tokio::test]
    async fn test_non_retryable_fails_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let outcome = execute_with_retry(
            || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(StorageError::other("database or disk is full")) }
            },
            &fast_config(5),
        )
        .await;

        assert!(!outcome.success);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(outcome.last_error.is_some());
        assert_eq!(outcome.errors, vec!["database or disk is full".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_errors_are_not_retried() {
        let outcome = execute_with_retry(
            || async { Err::<(), _>(StorageError::other("something odd")) },
            &fast_config(5),
        )
        .await;

        assert_eq!(outcome.attempts, 1);
        assert_eq!(
            outcome.last_classification.map(|c| c.category),
            Some(ErrorCategory::Unknown)
        );
    }
}
