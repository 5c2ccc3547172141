// Tests for the crate-level error type
//
// Tests cover: display formatting, conversions from the wrapped error types,
// and the anyhow bridge used by application code.

use super::*;

#[test]
fn test_storage_error_io_display() {
    let err = StorageError::Io(std::io::Error::new(
        std::io::ErrorKind::PermissionDenied,
        "permission denied",
    ));
    assert!(err.to_string().contains("I/O error"));
    assert!(err.to_string().contains("permission denied"));
}

#[test]
fn test_storage_error_from_io() {
    let io_err = std::io::Error::new(std::io::ErrorKind::Other, "No space left on device");
    let err: StorageError = io_err.into();
    assert!(matches!(err, StorageError::Io(_)));
}

#[test]
fn test_storage_error_from_serde() {
    let parse_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
    let err: StorageError = parse_err.into();
    assert!(matches!(err, StorageError::Serialization(_)));
    assert!(err.to_string().starts_with("Serialization error"));
}

#[test]
fn test_storage_error_from_anyhow_keeps_context_chain() {
    let err = anyhow::anyhow!("database is locked").context("Failed to insert ticket");
    let storage: StorageError = err.into();
    let message = storage.to_string();
    assert!(message.contains("Failed to insert ticket"));
    assert!(message.contains("database is locked"));
}

#[test]
fn test_storage_error_other_is_bare_message() {
    let err = StorageError::other("database or disk is full");
    assert_eq!(err.to_string(), "database or disk is full");
}

#[test]
fn test_invalid_record_display() {
    let err = StorageError::InvalidRecord("missing id".to_string());
    assert_eq!(err.to_string(), "Invalid ticket record: missing id");
}
