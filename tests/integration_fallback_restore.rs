/// Integration tests for the disk-full fallback and restore cycle
///
/// Drives a real SQLite database through a switchable disk-full fault.

mod common;

use common::faulty_store::FaultSwitch;
use common::test_helpers::{fast_config, full_ticket, ticket, wait_for, TEST_RESTORE_MIN_AGE};
use std::time::Duration;
use tempfile::TempDir;
use ticketvault::error::ErrorCategory;
use ticketvault::recovery::read_snapshot;
use ticketvault::{
    Health, OperatingMode, ResilientTicketStore, SqliteTicketStore, TicketStore,
};

#[tokio::test]
async fn test_disk_full_fallback_and_restore() {
    let dir = TempDir::new().unwrap();
    let config = fast_config(dir.path());
    let primary = config.primary_path();
    let switch = FaultSwitch::new();

    let store = ResilientTicketStore::open_with(config, switch.opener())
        .await
        .unwrap();
    assert_eq!(store.status().mode, OperatingMode::Primary);
    assert_eq!(store.status().backing_location.as_deref(), Some(primary.as_path()));

    let report = store.insert_ticket(&ticket("T-1", "before")).await.unwrap();
    assert!(!report.used_fallback);
    assert_eq!(report.location.as_deref(), Some(primary.as_path()));

    // Disk fills up
    switch.fill_disk();
    let report = store.insert_ticket(&ticket("T-2", "during")).await.unwrap();
    assert!(report.used_fallback);
    assert_eq!(report.mode, OperatingMode::Fallback);
    assert!(report.location.is_none());
    assert!(report.incident_id.is_some());
    assert!(!report.degraded.is_empty());

    let status = store.status();
    assert_eq!(status.mode, OperatingMode::Fallback);
    assert_eq!(status.health, Health::Degraded);
    assert_eq!(status.transition_count, 1);
    assert!(status.is_fallback);
    assert!(status.backing_location.is_none());
    assert!(status.last_error.unwrap().contains("disk is full"));

    let incidents = store.incidents();
    assert_eq!(incidents.len(), 1);
    assert_eq!(incidents[0].priority, 1);
    assert_eq!(incidents[0].category, ErrorCategory::Full);

    let trigger = store.fallback_trigger().unwrap();
    assert_eq!(trigger.category, ErrorCategory::Full);
    assert_eq!(trigger.previous_mode, OperatingMode::Primary);

    // Both the database ticket and the memory ticket stay readable
    assert!(store.get_ticket("T-1").await.unwrap().is_some());
    assert!(store.get_ticket("T-2").await.unwrap().is_some());
    assert_eq!(store.list_tickets().await.unwrap().len(), 2);
    assert_eq!(store.pending_count(), 1);

    assert_eq!(store.save_snapshot().unwrap(), 1);
    assert!(store.recovery_stats().snapshot_exists);

    // Disk is freed
    switch.clear_fault();
    tokio::time::sleep(TEST_RESTORE_MIN_AGE + Duration::from_millis(30)).await;

    let check = store.check_restore();
    assert!(check.can_restore, "{}", check.reason);
    assert_eq!(check.target_path.as_deref(), Some(primary.as_path()));

    let pending = store.pending_count();
    let result = store.try_restore().await;
    assert!(result.success, "{:?}", result.errors);
    assert_eq!(result.items_migrated, pending);
    assert!(result.failed_ids.is_empty());
    assert_eq!(result.target_path.as_deref(), Some(primary.as_path()));

    let status = store.status();
    assert_eq!(status.mode, OperatingMode::Primary);
    assert_eq!(status.health, Health::Healthy);
    assert_eq!(status.transition_count, 2);
    assert_eq!(status.backing_location.as_deref(), Some(primary.as_path()));

    assert_eq!(store.pending_count(), 0);
    assert!(store.fallback_trigger().is_none());
    assert!(!store.recovery_stats().snapshot_exists);

    // Migrated ticket got the durable defaults
    let migrated = store.get_ticket("T-2").await.unwrap().unwrap();
    assert_eq!(migrated["status"], "open");
    assert_eq!(migrated["version"], 1);
    assert!(migrated["created_at"].is_string());
    assert_eq!(store.list_tickets().await.unwrap().len(), 2);

    // Writes are durable again
    let report = store.insert_ticket(&ticket("T-3", "after")).await.unwrap();
    assert!(!report.used_fallback);
    assert_eq!(report.mode, OperatingMode::Primary);

    // The restore reused the open database
    assert_eq!(switch.opened(), 1);
}

#[tokio::test]
async fn test_restore_waits_for_minimum_fallback_age() {
    let dir = TempDir::new().unwrap();
    let mut config = fast_config(dir.path());
    config.restore_min_age = Duration::from_secs(3600);
    let switch = FaultSwitch::new();

    let store = ResilientTicketStore::open_with(config, switch.opener())
        .await
        .unwrap();

    switch.fill_disk();
    store.insert_ticket(&ticket("T-1", "held")).await.unwrap();
    switch.clear_fault();

    let result = store.try_restore().await;
    assert!(!result.success);
    assert_eq!(result.items_migrated, 0);
    assert!(result.errors[0].contains("restore not attempted"));
    assert_eq!(store.status().mode, OperatingMode::Fallback);
    assert_eq!(store.pending_count(), 1);

    // A forced restore ignores the age
    let forced = store.force_restore().await;
    assert!(forced.success, "{:?}", forced.errors);
    assert_eq!(forced.items_migrated, 1);
    assert_eq!(store.status().mode, OperatingMode::Primary);
    assert_eq!(store.pending_count(), 0);
}

#[tokio::test]
async fn test_restore_keeps_existing_fields() {
    let dir = TempDir::new().unwrap();
    let switch = FaultSwitch::new();
    let store = ResilientTicketStore::open_with(fast_config(dir.path()), switch.opener())
        .await
        .unwrap();

    switch.fill_disk();
    store
        .insert_ticket(&full_ticket("T-9", "complete"))
        .await
        .unwrap();
    switch.clear_fault();

    let result = store.force_restore().await;
    assert!(result.success, "{:?}", result.errors);

    let restored = store.get_ticket("T-9").await.unwrap().unwrap();
    assert_eq!(restored["status"], "in-progress");
    assert_eq!(restored["version"], 3);
    assert_eq!(restored["created_at"], "2026-01-01T00:00:00.000Z");
}

#[tokio::test]
async fn test_failed_restore_keeps_tickets_in_memory() {
    let dir = TempDir::new().unwrap();
    let switch = FaultSwitch::new();
    let store = ResilientTicketStore::open_with(fast_config(dir.path()), switch.opener())
        .await
        .unwrap();

    switch.fill_disk();
    store.insert_ticket(&ticket("T-1", "one")).await.unwrap();
    store.insert_ticket(&ticket("T-2", "two")).await.unwrap();

    // Location probes as writable, but the database still rejects writes
    let result = store.force_restore().await;
    assert!(!result.success);
    assert_eq!(result.items_migrated, 0);
    assert_eq!(result.failed_ids.len(), 2);
    assert!(result.errors.iter().all(|e| e.contains("disk is full")));

    let status = store.status();
    assert_eq!(status.mode, OperatingMode::Fallback);
    assert_eq!(status.transition_count, 1);
    assert_eq!(store.pending_count(), 2);
    assert!(store.recovery_stats().snapshot_exists);
    assert!(store.fallback_trigger().is_some());

    switch.clear_fault();
    let retry = store.force_restore().await;
    assert!(retry.success, "{:?}", retry.errors);
    assert_eq!(retry.items_migrated, 2);
    assert_eq!(store.pending_count(), 0);
}

#[tokio::test]
async fn test_background_restore_returns_to_primary() {
    let dir = TempDir::new().unwrap();
    let switch = FaultSwitch::new();
    let store = ResilientTicketStore::open_with(fast_config(dir.path()), switch.opener())
        .await
        .unwrap();
    store.start_background_tasks();

    switch.fill_disk();
    store.insert_ticket(&ticket("T-1", "queued")).await.unwrap();
    assert_eq!(store.status().mode, OperatingMode::Fallback);

    switch.clear_fault();
    let restored = wait_for(Duration::from_secs(5), || {
        store.status().mode == OperatingMode::Primary
    })
    .await;
    assert!(restored, "store did not return to primary: {:?}", store.status());
    assert_eq!(store.pending_count(), 0);
    assert!(store.get_ticket("T-1").await.unwrap().is_some());

    store.shutdown();
}

#[tokio::test]
async fn test_status_listener_sees_both_transitions() {
    let dir = TempDir::new().unwrap();
    let switch = FaultSwitch::new();
    let store = ResilientTicketStore::open_with(fast_config(dir.path()), switch.opener())
        .await
        .unwrap();

    let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = seen.clone();
    let _subscription = store.status_manager().on_status_change(move |status| {
        sink.lock().unwrap().push(status.mode);
        Ok(())
    });

    switch.fill_disk();
    store.insert_ticket(&ticket("T-1", "x")).await.unwrap();
    switch.clear_fault();
    assert!(store.force_restore().await.success);

    assert_eq!(
        *seen.lock().unwrap(),
        vec![OperatingMode::Fallback, OperatingMode::Primary]
    );
}

#[tokio::test]
async fn test_removal_during_fallback() {
    let dir = TempDir::new().unwrap();
    let switch = FaultSwitch::new();
    let store = ResilientTicketStore::open_with(fast_config(dir.path()), switch.opener())
        .await
        .unwrap();

    store.insert_ticket(&ticket("T-1", "durable")).await.unwrap();
    switch.fill_disk();
    store.insert_ticket(&ticket("T-2", "memory")).await.unwrap();

    let report = store.remove_ticket("T-2").await.unwrap();
    assert!(report.changed);
    assert_eq!(store.pending_count(), 0);

    // The database rejects the delete; the ticket is hidden until restore
    let report = store.remove_ticket("T-1").await.unwrap();
    assert!(report.changed);
    assert!(switch.rejected_writes() >= 2);
    assert!(store.get_ticket("T-1").await.unwrap().is_none());
    assert!(store.list_tickets().await.unwrap().is_empty());
    assert_eq!(store.pending_deletions(), vec!["T-1".to_string()]);

    let recovery_path = store.config().recovery_path();
    store.save_snapshot().unwrap();
    assert_eq!(
        read_snapshot(&recovery_path).unwrap().deleted_ids,
        vec!["T-1".to_string()]
    );

    // Unknown ids are not recorded
    assert!(!store.remove_ticket("T-404").await.unwrap().changed);
    assert_eq!(store.pending_deletions().len(), 1);

    switch.clear_fault();
    let result = store.force_restore().await;
    assert!(result.success, "{:?}", result.errors);
    assert_eq!(store.status().mode, OperatingMode::Primary);
    assert!(store.pending_deletions().is_empty());
    assert!(store.get_ticket("T-1").await.unwrap().is_none());

    let database = SqliteTicketStore::open(store.config().primary_path()).unwrap();
    assert!(database.get("T-1").unwrap().is_none());
}

#[tokio::test]
async fn test_recreated_ticket_survives_pending_delete() {
    let dir = TempDir::new().unwrap();
    let switch = FaultSwitch::new();
    let store = ResilientTicketStore::open_with(fast_config(dir.path()), switch.opener())
        .await
        .unwrap();

    store.insert_ticket(&ticket("T-1", "original")).await.unwrap();
    switch.fill_disk();
    store.insert_ticket(&ticket("T-2", "memory")).await.unwrap();
    assert!(store.remove_ticket("T-1").await.unwrap().changed);

    store.insert_ticket(&ticket("T-1", "recreated")).await.unwrap();
    assert!(store.pending_deletions().is_empty());
    assert_eq!(store.get_ticket("T-1").await.unwrap().unwrap()["title"], "recreated");

    switch.clear_fault();
    assert!(store.force_restore().await.success);
    assert_eq!(store.get_ticket("T-1").await.unwrap().unwrap()["title"], "recreated");
}
