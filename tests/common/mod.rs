/// Common test utilities for integration tests
///
/// This module provides:
/// - A SQLite-backed store with a switchable "disk full" fault
/// - Workspace fixtures with fast retry and restore timings
/// - Ticket document builders

pub mod faulty_store;
pub mod test_helpers;
