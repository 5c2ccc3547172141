//! Fallback coordinator - composes retry, classification and a fallback op
//!
//! The coordinator is the single place that decides retry vs. fallback vs.
//! fail. It never returns an error: every path ends in a [`FallbackOutcome`]
//! and callers react to the fields.
use super::classification::ErrorClassification;
use super::retry::{execute_with_retry, RetryConfig};
use crate::StorageResult;
use std::future::{self, Future};

/// Why the fallback operation is being invoked
#[derive(Debug, Clone)]
pub struct FallbackCause {
    pub classification: ErrorClassification,

    /// Message of the terminal primary failure
    pub error: String,
}

/// Uniform result envelope for a coordinated storage operation
#[derive(Debug)]
pub struct FallbackOutcome<T> {
    pub value: Option<T>,
    pub used_fallback: bool,

    /// Attempts spent on the primary operation
    pub attempts: u32,

    pub errors: Vec<String>,
    pub fallback_reason: Option<String>,
    pub failed: bool,

    /// Classification of the terminal primary failure, if there was one
    pub classification: Option<ErrorClassification>,
}

impl<T> FallbackOutcome<T> {
    /// True when a value was produced by either path
    pub fn is_success(&self) -> bool {
        !self.failed
    }

    /// Last recorded error message
    pub fn last_error(&self) -> Option<&str> {
        self.errors.last().map(String::as_str)
    }
}

/// Runs storage operations with retry and optional fallback
#[derive(Debug, Clone, Default)]
pub struct FallbackCoordinator {
    retry_config: RetryConfig,
}

impl FallbackCoordinator {
    /// Create a coordinator with the given retry configuration
    pub fn new(retry_config: RetryConfig) -> Self {
        Self { retry_config }
    }

    /// Retry configuration applied to primary operations
    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry_config
    }

    /// Run `primary` with retries; on a fallback-worthy failure run `fallback`
    pub async fn run<T, F, Fut, G, GFut>(&self, primary: F, fallback: Option<G>) -> FallbackOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StorageResult<T>>,
        G: FnOnce(FallbackCause) -> GFut,
        GFut: Future<Output = StorageResult<T>>,
    {
        self.run_with_config(primary, fallback, &self.retry_config).await
    }

    /// Run `primary` with retries and no fallback
    pub async fn run_without_fallback<T, F, Fut>(&self, primary: F) -> FallbackOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StorageResult<T>>,
    {
        let no_fallback: Option<fn(FallbackCause) -> future::Ready<StorageResult<T>>> = None;
        self.run(primary, no_fallback).await
    }

    /// Same as [`run`](Self::run) with a per-call retry configuration
    pub async fn run_with_config<T, F, Fut, G, GFut>(
        &self,
        primary: F,
        fallback: Option<G>,
        retry_config: &RetryConfig,
    ) -> FallbackOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StorageResult<T>>,
        G: FnOnce(FallbackCause) -> GFut,
        GFut: Future<Output = StorageResult<T>>,
    {
        let retry = execute_with_retry(primary, retry_config).await;

        if retry.success {
            return FallbackOutcome {
                value: retry.value,
                used_fallback: false,
                attempts: retry.attempts,
                errors: retry.errors,
                fallback_reason: None,
                failed: false,
                classification: None,
            };
        }

        let mut errors = retry.errors;
        let classification = retry.last_classification;
        let primary_error = retry
            .last_error
            .map(|e| e.to_string())
            .or_else(|| errors.last().cloned())
            .unwrap_or_default();

        let fallback = match (&classification, fallback) {
            (Some(c), Some(op)) if c.triggers_fallback => Some((c.clone(), op)),
            _ => None,
        };

        let Some((classification, op)) = fallback else {
            tracing::error!(
                attempts = retry.attempts,
                category = ?classification.as_ref().map(|c| c.category),
                error = %primary_error,
                "Storage operation failed without fallback"
            );
            return FallbackOutcome {
                value: None,
                used_fallback: false,
                attempts: retry.attempts,
                errors,
                fallback_reason: None,
                failed: true,
                classification,
            };
        };

        let reason = format!("{}: {}", classification.category, classification.description);
        tracing::warn!(
            category = %classification.category,
            error = %primary_error,
            "Primary storage failed, using fallback"
        );

        let cause = FallbackCause {
            classification: classification.clone(),
            error: primary_error,
        };

        match op(cause).await {
            Ok(value) => FallbackOutcome {
                value: Some(value),
                used_fallback: true,
                attempts: retry.attempts,
                errors,
                fallback_reason: Some(reason),
                failed: false,
                classification: Some(classification),
            },
            Err(fallback_error) => {
                tracing::error!(
                    error = %fallback_error,
                    "Fallback storage operation failed as well"
                );
                errors.push(format!("fallback failed: {}", fallback_error));
                FallbackOutcome {
                    value: None,
                    used_fallback: true,
                    attempts: retry.attempts,
                    errors,
                    fallback_reason: Some(reason),
                    failed: true,
                    classification: Some(classification),
                }
            }
        }
    }
}
