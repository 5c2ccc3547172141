//! Error classification system for retry/fallback selection
//!
//! Every storage failure is mapped to one of five categories that decide
//! whether it is retried, whether it moves the store into fallback mode,
//! and what the operator is told to do about it.
use crate::StorageError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Category of a storage failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    /// Lock contention - retry with backoff
    Busy,

    /// Disk or quota exhausted - fall back to memory
    Full,

    /// Access control - fall back to memory
    Permission,

    /// Data integrity - fall back to memory, never auto-restore
    Corruption,

    /// Anything we do not recognise - fail the operation
    Unknown,
}

impl ErrorCategory {
    /// All categories in matching priority order
    pub const ALL: [ErrorCategory; 5] = [
        ErrorCategory::Busy,
        ErrorCategory::Full,
        ErrorCategory::Permission,
        ErrorCategory::Corruption,
        ErrorCategory::Unknown,
    ];

    /// Get human-readable description of the category
    pub fn description(&self) -> &'static str {
        match self {
            ErrorCategory::Busy => "The ticket database is locked by another process",
            ErrorCategory::Full => "The disk holding the ticket database is full",
            ErrorCategory::Permission => "The ticket database location is not writable",
            ErrorCategory::Corruption => "The ticket database file is corrupted",
            ErrorCategory::Unknown => "An unrecognised storage error occurred",
        }
    }

    /// Short operator-facing advice
    pub fn suggested_action(&self) -> &'static str {
        match self {
            ErrorCategory::Busy => "Wait for the other process to release the lock; the operation is retried automatically",
            ErrorCategory::Full => "Free disk space; tickets are kept in memory until the disk is writable again",
            ErrorCategory::Permission => "Check ownership and permissions of the ticket directory; tickets are kept in memory meanwhile",
            ErrorCategory::Corruption => "Rebuild the database from the recovery snapshot; automatic restore is disabled",
            ErrorCategory::Unknown => "Inspect the error message and logs; the operation was not retried",
        }
    }

    /// Check if this category allows retries
    pub fn allows_retry(&self) -> bool {
        matches!(self, ErrorCategory::Busy)
    }

    /// Check if this category moves the store into fallback mode
    pub fn triggers_fallback(&self) -> bool {
        matches!(
            self,
            ErrorCategory::Full | ErrorCategory::Permission | ErrorCategory::Corruption
        )
    }

    /// Lowercase identifier used in logs and serialized records
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Busy => "busy",
            ErrorCategory::Full => "full",
            ErrorCategory::Permission => "permission",
            ErrorCategory::Corruption => "corruption",
            ErrorCategory::Unknown => "unknown",
        }
    }

    fn signatures(&self) -> &'static [&'static str] {
        match self {
            ErrorCategory::Busy => BUSY_SIGNATURES,
            ErrorCategory::Full => FULL_SIGNATURES,
            ErrorCategory::Permission => PERMISSION_SIGNATURES,
            ErrorCategory::Corruption => CORRUPTION_SIGNATURES,
            ErrorCategory::Unknown => &[],
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// Signatures are matched lowercase, as substrings of the error message.
const BUSY_SIGNATURES: &[&str] = &[
    "sqlite_busy",
    "sqlite_locked",
    "database is locked",
    "database table is locked",
    "device or resource busy",
    "resource busy",
    "resource temporarily unavailable",
    "ebusy",
    "lock timeout",
];

const FULL_SIGNATURES: &[&str] = &[
    "sqlite_full",
    "database or disk is full",
    "disk is full",
    "disk full",
    "no space left",
    "not enough space",
    "enospc",
    "quota exceeded",
    "edquot",
    "file too large",
];

const PERMISSION_SIGNATURES: &[&str] = &[
    "sqlite_readonly",
    "sqlite_cantopen",
    "sqlite_perm",
    "permission denied",
    "access denied",
    "access is denied",
    "operation not permitted",
    "eacces",
    "eperm",
    "read-only file system",
    "readonly database",
    "attempt to write a readonly",
    "erofs",
    "unable to open database",
];

const CORRUPTION_SIGNATURES: &[&str] = &[
    "sqlite_corrupt",
    "sqlite_notadb",
    "malformed",
    "file is encrypted or is not a database",
    "not a database",
    "corrupt",
];

/// Structured classification of a storage failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorClassification {
    pub category: ErrorCategory,
    pub retryable: bool,
    pub triggers_fallback: bool,
    pub description: String,
    pub suggested_action: String,
}

impl ErrorClassification {
    /// Build the classification record for a category
    pub fn for_category(category: ErrorCategory) -> Self {
        Self {
            category,
            retryable: category.allows_retry(),
            triggers_fallback: category.triggers_fallback(),
            description: category.description().to_string(),
            suggested_action: category.suggested_action().to_string(),
        }
    }
}

impl fmt::Display for ErrorClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (retryable: {}, fallback: {})",
            self.category, self.retryable, self.triggers_fallback
        )
    }
}

/// Error classifier - maps raw failures to a category
///
/// Stateless; kept as a type so callers can hold one next to their retry
/// configuration the same way they hold other collaborators.
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    /// Create a new error classifier
    pub fn new() -> Self {
        Self
    }

    /// Classify any displayable error by its message
    pub fn classify<E: fmt::Display + ?Sized>(&self, error: &E) -> ErrorClassification {
        self.classify_message(&error.to_string())
    }

    /// Classify a raw error message
    pub fn classify_message(&self, message: &str) -> ErrorClassification {
        ErrorClassification::for_category(Self::category_for_message(message))
    }

    /// Classify a storage error, preferring structured codes over the message
    pub fn classify_storage_error(&self, error: &StorageError) -> ErrorClassification {
        let category = Self::structured_category(error)
            .unwrap_or_else(|| Self::category_for_message(&error.to_string()));
        ErrorClassification::for_category(category)
    }

    /// Determine the category by priority-ordered substring search
    fn category_for_message(message: &str) -> ErrorCategory {
        let lowered = message.to_lowercase();

        ErrorCategory::ALL
            .iter()
            .copied()
            .find(|category| {
                category
                    .signatures()
                    .iter()
                    .any(|signature| lowered.contains(signature))
            })
            .unwrap_or(ErrorCategory::Unknown)
    }

    /// Categories that can be read from error codes without looking at text
    fn structured_category(error: &StorageError) -> Option<ErrorCategory> {
        use rusqlite::ErrorCode;

        match error {
            StorageError::Database(rusqlite::Error::SqliteFailure(err, _)) => match err.code {
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => Some(ErrorCategory::Busy),
                ErrorCode::DiskFull => Some(ErrorCategory::Full),
                ErrorCode::ReadOnly | ErrorCode::CannotOpen | ErrorCode::PermissionDenied => {
                    Some(ErrorCategory::Permission)
                }
                ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase => {
                    Some(ErrorCategory::Corruption)
                }
                _ => None,
            },

            StorageError::Io(io_err) => match io_err.kind() {
                std::io::ErrorKind::PermissionDenied => Some(ErrorCategory::Permission),
                std::io::ErrorKind::WouldBlock => Some(ErrorCategory::Busy),
                _ => None,
            },

            _ => None,
        }
    }
}

/// Classify any displayable error
pub fn classify<E: fmt::Display + ?Sized>(error: &E) -> ErrorClassification {
    ErrorClassifier::new().classify(error)
}

/// Classify a raw error message
pub fn classify_message(message: &str) -> ErrorClassification {
    ErrorClassifier::new().classify_message(message)
}

/// Classify a storage error
pub fn classify_storage_error(error: &StorageError) -> ErrorClassification {
    ErrorClassifier::new().classify_storage_error(error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use test_case::test_case;

    #[test]
    fn test_category_allows_retry() {
        assert!(ErrorCategory::Busy.allows_retry());
        assert!(!ErrorCategory::Full.allows_retry());
        assert!(!ErrorCategory::Permission.allows_retry());
        assert!(!ErrorCategory::Corruption.allows_retry());
        assert!(!ErrorCategory::Unknown.allows_retry());
    }

    #[test]
    fn test_category_triggers_fallback() {
        assert!(!ErrorCategory::Busy.triggers_fallback());
        assert!(ErrorCategory::Full.triggers_fallback());
        assert!(ErrorCategory::Permission.triggers_fallback());
        assert!(ErrorCategory::Corruption.triggers_fallback());
        assert!(!ErrorCategory::Unknown.triggers_fallback());
    }

    #[test_case("SQLITE_BUSY: database is locked", ErrorCategory::Busy)]
    #[test_case("database table is locked", ErrorCategory::Busy)]
    #[test_case("EBUSY: resource busy or locked", ErrorCategory::Busy)]
    #[test_case("SQLITE_FULL: database or disk is full", ErrorCategory::Full)]
    #[test_case("No space left on device (os error 28)", ErrorCategory::Full)]
    #[test_case("ENOSPC: no space left on device, write", ErrorCategory::Full)]
    #[test_case("Permission denied (os error 13)", ErrorCategory::Permission)]
    #[test_case("EACCES: permission denied, open '/x/tickets.db'", ErrorCategory::Permission)]
    #[test_case("attempt to write a readonly database", ErrorCategory::Permission)]
    #[test_case("Read-only file system (os error 30)", ErrorCategory::Permission)]
    #[test_case("unable to open database file", ErrorCategory::Permission)]
    #[test_case("database disk image is malformed", ErrorCategory::Corruption)]
    #[test_case("file is not a database", ErrorCategory::Corruption)]
    #[test_case("SQLITE_CORRUPT", ErrorCategory::Corruption)]
    #[test_case("connection reset by peer", ErrorCategory::Unknown)]
    #[test_case("", ErrorCategory::Unknown)]
    fn test_classify_message(message: &str, expected: ErrorCategory) {
        assert_eq!(classify_message(message).category, expected);
    }

    #[test]
    fn test_busy_wins_over_later_categories() {
        // Lock contention is checked first even when other signatures appear
        let classification = classify_message("database is locked; disk full");
        assert_eq!(classification.category, ErrorCategory::Busy);
        assert!(classification.retryable);
        assert!(!classification.triggers_fallback);
    }

    #[test]
    fn test_full_wins_over_permission() {
        let classification = classify_message("no space left on device: permission denied");
        assert_eq!(classification.category, ErrorCategory::Full);
    }

    #[test]
    fn test_matching_is_case_insensitive() {
        assert_eq!(
            classify_message("DATABASE IS LOCKED").category,
            ErrorCategory::Busy
        );
        assert_eq!(
            classify_message("Not A Database").category,
            ErrorCategory::Corruption
        );
    }

    #[test]
    fn test_classification_carries_description_and_action() {
        let classification = classify_message("database or disk is full");
        assert_eq!(classification.description, ErrorCategory::Full.description());
        assert!(classification.suggested_action.contains("Free disk space"));
    }

    #[test]
    fn test_classify_arbitrary_display_values() {
        assert_eq!(classify(&42).category, ErrorCategory::Unknown);
        assert_eq!(classify("ENOSPC").category, ErrorCategory::Full);

        let io_err = std::io::Error::new(std::io::ErrorKind::Other, "disk quota exceeded");
        assert_eq!(classify(&io_err).category, ErrorCategory::Full);
    }

    #[test]
    fn test_classify_storage_error_sqlite_codes() {
        let busy = StorageError::Database(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        ));
        assert_eq!(classify_storage_error(&busy).category, ErrorCategory::Busy);

        let full = StorageError::Database(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_FULL),
            None,
        ));
        assert_eq!(classify_storage_error(&full).category, ErrorCategory::Full);

        let readonly = StorageError::Database(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_READONLY),
            None,
        ));
        assert_eq!(
            classify_storage_error(&readonly).category,
            ErrorCategory::Permission
        );

        let notadb = StorageError::Database(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_NOTADB),
            None,
        ));
        assert_eq!(
            classify_storage_error(&notadb).category,
            ErrorCategory::Corruption
        );
    }

    #[test]
    fn test_classify_storage_error_io_kind() {
        let err = StorageError::Io(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "nope",
        ));
        assert_eq!(
            classify_storage_error(&err).category,
            ErrorCategory::Permission
        );
    }

    #[test]
    fn test_classify_storage_error_falls_back_to_message() {
        let err = StorageError::other("database or disk is full");
        assert_eq!(classify_storage_error(&err).category, ErrorCategory::Full);

        let err = StorageError::InvalidRecord("missing id".to_string());
        assert_eq!(classify_storage_error(&err).category, ErrorCategory::Unknown);
    }

    fn noise() -> impl Strategy<Value = String> {
        // Letters and spaces that cannot assemble into another signature
        "[xyz ]{0,16}"
    }

    proptest! {
        #[test]
        fn prop_lock_messages_are_busy(
            prefix in noise(),
            suffix in noise(),
            idx in 0..BUSY_SIGNATURES.len(),
        ) {
            let message = format!("{}{}{}", prefix, BUSY_SIGNATURES[idx].to_uppercase(), suffix);
            let classification = classify_message(&message);
            prop_assert_eq!(classification.category, ErrorCategory::Busy);
            prop_assert!(classification.retryable);
            prop_assert!(!classification.triggers_fallback);
        }

        #[test]
        fn prop_full_messages_are_full(
            prefix in noise(),
            suffix in noise(),
            idx in 0..FULL_SIGNATURES.len(),
        ) {
            let message = format!("{}{}{}", prefix, FULL_SIGNATURES[idx], suffix);
            let classification = classify_message(&message);
            prop_assert_eq!(classification.category, ErrorCategory::Full);
            prop_assert!(!classification.retryable);
            prop_assert!(classification.triggers_fallback);
        }

        #[test]
        fn prop_classify_never_panics(message in ".*") {
            let classification = classify_message(&message);
            prop_assert_eq!(classification.retryable, classification.category.allows_retry());
        }
    }
}
