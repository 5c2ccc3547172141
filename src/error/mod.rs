//! Failure handling for ticket storage
//!
//! This module turns raw storage failures into explicit decisions:
//! - Error classification (busy / full / permission / corruption / unknown)
//! - Bounded retries with exponential backoff and jitter
//! - Fallback coordination with a uniform outcome envelope
//! - Incident tickets for failures a human has to look at
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │   Fallback Coordinator (outcome envelope) │
//! └────────────────┬─────────────────────────┘
//!                  │
//!      ┌───────────┴───────────┐
//!      ↓                       ↓
//! ┌──────────────┐      ┌──────────────┐
//! │Retry Executor│      │  Classifier   │
//! └──────────────┘      └──────┬───────┘
//!                              ↓
//!                     ┌──────────────────┐
//!                     │ Error Ticket      │
//!                     │ Factory           │
//!                     └──────────────────┘
//! ```
//!
//! # Usage Example
//!
//! ```rust,ignore
//! use ticketvault::error::{FallbackCoordinator, RetryConfig};
//!
//! let coordinator = FallbackCoordinator::new(RetryConfig::default());
//! let outcome = coordinator
//!     .run(
//!         || async { durable.insert(&ticket) },
//!         Some(|cause| async move { memory.insert(&ticket) }),
//!     )
//!     .await;
//!
//! if outcome.used_fallback && !outcome.failed {
//!     println!("Stored in memory: {:?}", outcome.fallback_reason);
//! }
//! ```

pub mod classification;
pub mod fallback;
pub mod retry;
pub mod tickets;

// Re-export main types for convenience
pub use classification::{
    classify, classify_message, classify_storage_error, ErrorCategory, ErrorClassification,
    ErrorClassifier,
};
pub use fallback::{FallbackCause, FallbackCoordinator, FallbackOutcome};
pub use retry::{execute_with_retry, ExponentialBackoff, RetryConfig, RetryOutcome};
pub use tickets::{ErrorTicket, ErrorTicketFactory, TicketStatus, BUSY_TICKET_THRESHOLD};
