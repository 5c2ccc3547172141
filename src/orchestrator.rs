//! Resilient ticket store
//!
//! Wires the resolver, fallback coordinator, status manager, recovery
//! manager, restore monitor and incident factory into one store:
//!
//! 1. `open` resolves a backing path and opens the database, starting in
//!    fallback when that is impossible, and reloads a usable recovery
//!    snapshot.
//! 2. Writes go to the database through the fallback coordinator; a
//!    full/permission/corruption failure switches writes to memory.
//! 3. While in memory the recovery manager snapshots tickets and the
//!    restore monitor watches for a writable location.
//! 4. `try_restore` migrates memory back to the database and returns to
//!    primary.
use crate::config::ResilienceConfig;
use crate::error::{
    classify_message, ErrorCategory, ErrorTicket, ErrorTicketFactory, FallbackCause,
    FallbackCoordinator, FallbackOutcome,
};
use crate::recovery::{PendingState, RecoveryManager, RecoveryStats};
use crate::restore::{
    describe_target, execute_migration, prepare_for_migration, should_attempt_restore,
    FallbackTrigger, RestoreCheck, RestoreMonitor, RestoreResult,
};
use crate::status::degradation::degradation_messages;
use crate::status::{lock, OperatingMode, OperatingStatus, StatusManager};
use crate::storage::{
    record_id, resolve_backing_path, BackingMode, MemoryTicketStore, SqliteTicketStore,
    TicketRecord, TicketStore,
};
use crate::{StorageError, StorageResult};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use uuid::Uuid;

/// Opens the durable store at a path
pub type StoreOpener =
    Arc<dyn Fn(&Path) -> StorageResult<Box<dyn TicketStore>> + Send + Sync>;

/// Opener for the SQLite backend
pub fn sqlite_opener() -> StoreOpener {
    Arc::new(|path: &Path| {
        let store = SqliteTicketStore::open(path)?;
        Ok(Box::new(store) as Box<dyn TicketStore>)
    })
}

/// Category for a location that failed the startup write check.
///
/// The check reports raw io errors; anything that would not switch to
/// memory on its own is treated as a permission problem.
fn startup_failure_category(reason: &str) -> ErrorCategory {
    let category = classify_message(reason).category;
    if category.triggers_fallback() {
        category
    } else {
        ErrorCategory::Permission
    }
}

fn collect_pending(
    memory: &Mutex<MemoryTicketStore>,
    tombstones: &Mutex<BTreeSet<String>>,
    trigger: &Mutex<Option<FallbackTrigger>>,
) -> PendingState {
    PendingState {
        tickets: lock(memory).snapshot(),
        deleted_ids: lock(tombstones).iter().cloned().collect(),
        trigger: lock(trigger).clone(),
    }
}

/// What happened to a write
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteReport {
    /// Mode after the write
    pub mode: OperatingMode,

    /// Where the ticket was written, `None` for memory
    pub location: Option<PathBuf>,
    pub used_fallback: bool,
    pub attempts: u32,

    /// For removals: whether the ticket existed
    pub changed: bool,

    /// Reduced-functionality messages for the current mode
    pub degraded: Vec<String>,

    /// Incident raised by this write
    pub incident_id: Option<u64>,
}

/// What `open` would find, gathered without opening anything
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreInspection {
    /// Status the store would start in
    pub status: OperatingStatus,
    pub durable: bool,
    pub degradations: Vec<String>,
    pub recovery: RecoveryStats,
    pub pending_tickets: usize,
    pub pending_deletions: usize,

    /// Failure that keeps the snapshot in memory at the next open
    pub held_by: Option<FallbackTrigger>,
}

/// Predict the startup status and snapshot handling for `config`.
///
/// Runs the same write checks as `open` but never opens the database,
/// loads tickets or touches the recovery snapshot.
pub fn inspect(config: &ResilienceConfig) -> StoreInspection {
    let resolved = resolve_backing_path(&config.primary_path(), &config.alternate_paths());
    let mode = match resolved.mode {
        BackingMode::Primary => OperatingMode::Primary,
        BackingMode::Alternate(_) | BackingMode::Memory => OperatingMode::Fallback,
    };
    let status = OperatingStatus::initial(mode, resolved.path.clone(), resolved.reason.clone());

    let recovery = RecoveryManager::new(config.recovery_config());
    let snapshot = recovery.load_usable();
    let held_by = snapshot
        .as_ref()
        .and_then(|snapshot| snapshot.trigger.clone())
        .filter(|trigger| !should_attempt_restore(trigger, config.restore_config().max_age));

    StoreInspection {
        durable: resolved.is_durable(),
        degradations: degradation_messages(&status),
        recovery: recovery.stats(),
        pending_tickets: snapshot.as_ref().map_or(0, |s| s.ticket_count),
        pending_deletions: snapshot.as_ref().map_or(0, |s| s.deleted_ids.len()),
        held_by,
        status,
    }
}

struct Inner {
    session_id: Uuid,
    config: ResilienceConfig,
    status: Arc<StatusManager>,
    coordinator: FallbackCoordinator,
    opener: StoreOpener,

    durable: Mutex<Option<Box<dyn TicketStore>>>,
    memory: Arc<Mutex<MemoryTicketStore>>,

    /// Database tickets deleted while the database refused the delete
    tombstones: Arc<Mutex<BTreeSet<String>>>,

    recovery: RecoveryManager,
    monitor: RestoreMonitor,
    ticket_factory: ErrorTicketFactory,
    incidents: Mutex<Vec<ErrorTicket>>,
    trigger: Arc<Mutex<Option<FallbackTrigger>>>,

    /// One restore at a time; held across the migration
    restore_lock: tokio::sync::Mutex<()>,
    background: AtomicBool,
    weak_self: Weak<Inner>,
}

/// Ticket store that survives an unusable database
pub struct ResilientTicketStore {
    inner: Arc<Inner>,
}

impl ResilientTicketStore {
    /// Open the store with the SQLite backend
    pub async fn open(config: ResilienceConfig) -> StorageResult<Self> {
        Self::open_with(config, sqlite_opener()).await
    }

    /// Open the store with a custom durable backend
    pub async fn open_with(config: ResilienceConfig, opener: StoreOpener) -> StorageResult<Self> {
        let session_id = Uuid::new_v4();
        let coordinator = FallbackCoordinator::new(config.retry.clone());
        let ticket_factory = ErrorTicketFactory::new();
        let mut incidents = Vec::new();

        let primary = config.primary_path();
        let resolved = resolve_backing_path(&primary, &config.alternate_paths());

        let mut durable = None;
        let mut trigger = None;
        let mut last_error = None;

        let durable_path = resolved.path.clone().filter(|_| resolved.is_durable());
        let (mode, location, reason) = match durable_path {
            None => {
                let error = resolved
                    .probes
                    .first()
                    .and_then(|p| p.reason.clone())
                    .unwrap_or_else(|| resolved.reason.clone());
                let category = startup_failure_category(&error);
                incidents.push(ticket_factory.create_ticket(
                    &error,
                    category,
                    Some("no writable ticket database location at startup"),
                ));
                trigger = Some(FallbackTrigger::new(&error, category, 0, OperatingMode::Primary));
                last_error = Some(error);
                (OperatingMode::Fallback, None, resolved.reason.clone())
            }
            Some(path) => {
                let mut cause_slot: Option<FallbackCause> = None;
                let outcome = coordinator
                    .run(
                        || {
                            let opened = (opener)(&path).map(Some);
                            async move { opened }
                        },
                        Some(|cause: FallbackCause| {
                            cause_slot = Some(cause);
                            async { Ok::<_, StorageError>(None) }
                        }),
                    )
                    .await;

                if outcome.failed {
                    let message = outcome
                        .last_error()
                        .unwrap_or("failed to open ticket database")
                        .to_string();
                    tracing::error!(
                        path = %path.display(),
                        error = %message,
                        "Cannot open ticket database"
                    );
                    return Err(StorageError::Unavailable(message));
                }

                match (outcome.value.flatten(), cause_slot) {
                    (Some(store), _) => {
                        durable = Some(store);
                        match resolved.mode {
                            BackingMode::Primary => {
                                (OperatingMode::Primary, Some(path), resolved.reason.clone())
                            }
                            _ => {
                                let error = resolved
                                    .probes
                                    .first()
                                    .and_then(|p| p.reason.clone())
                                    .unwrap_or_else(|| resolved.reason.clone());
                                trigger = Some(FallbackTrigger::new(
                                    &error,
                                    startup_failure_category(&error),
                                    0,
                                    OperatingMode::Primary,
                                ));
                                last_error = Some(error);
                                (OperatingMode::Fallback, Some(path), resolved.reason.clone())
                            }
                        }
                    }
                    (None, cause) => {
                        let (error, category) = match cause {
                            Some(cause) => (cause.error, cause.classification.category),
                            None => (
                                "ticket database unavailable".to_string(),
                                ErrorCategory::Unknown,
                            ),
                        };
                        incidents.push(ticket_factory.create_ticket(
                            &error,
                            category,
                            Some(format!("opening {}", path.display()).as_str()),
                        ));
                        trigger = Some(FallbackTrigger::new(
                            &error,
                            category,
                            0,
                            OperatingMode::Primary,
                        ));
                        last_error = Some(error);
                        (
                            OperatingMode::Fallback,
                            None,
                            format!("{}: database could not be opened", category),
                        )
                    }
                }
            }
        };

        let mut initial = OperatingStatus::initial(mode, location, reason);
        initial.last_error = last_error;
        let status = Arc::new(StatusManager::with_status(initial));

        let inner = Arc::new_cyclic(|weak_self| Inner {
            session_id,
            recovery: RecoveryManager::new(config.recovery_config()),
            monitor: RestoreMonitor::new(config.restore_config()),
            config,
            status,
            coordinator,
            opener,
            durable: Mutex::new(durable),
            memory: Arc::new(Mutex::new(MemoryTicketStore::new())),
            tombstones: Arc::new(Mutex::new(BTreeSet::new())),
            ticket_factory,
            incidents: Mutex::new(incidents),
            trigger: Arc::new(Mutex::new(trigger)),
            restore_lock: tokio::sync::Mutex::new(()),
            background: AtomicBool::new(false),
            weak_self: weak_self.clone(),
        });

        tracing::info!(
            session = %session_id,
            mode = %inner.status.mode(),
            location = %describe_target(inner.status.get_status().backing_location.as_deref()),
            "Ticket store opened"
        );

        inner.reload_snapshot().await;

        Ok(Self { inner })
    }

    pub fn session_id(&self) -> Uuid {
        self.inner.session_id
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.inner.config
    }

    /// Owned copy of the operating status
    pub fn status(&self) -> OperatingStatus {
        self.inner.status.get_status()
    }

    /// Shared status manager, for subscriptions
    pub fn status_manager(&self) -> Arc<StatusManager> {
        Arc::clone(&self.inner.status)
    }

    /// Reduced-functionality messages for the current mode
    pub fn degradation_messages(&self) -> Vec<String> {
        self.inner.status.degradation_messages()
    }

    pub async fn insert_ticket(&self, record: &TicketRecord) -> StorageResult<WriteReport> {
        self.inner.insert_ticket(record).await
    }

    pub async fn get_ticket(&self, id: &str) -> StorageResult<Option<TicketRecord>> {
        self.inner.get_ticket(id).await
    }

    pub async fn list_tickets(&self) -> StorageResult<Vec<TicketRecord>> {
        self.inner.list_tickets().await
    }

    pub async fn remove_ticket(&self, id: &str) -> StorageResult<WriteReport> {
        self.inner.remove_ticket(id).await
    }

    /// Tickets currently held only in memory
    pub fn pending_count(&self) -> usize {
        lock(&self.inner.memory).len()
    }

    /// Database tickets whose delete waits for the next restore
    pub fn pending_deletions(&self) -> Vec<String> {
        lock(&self.inner.tombstones).iter().cloned().collect()
    }

    /// Incidents raised so far
    pub fn incidents(&self) -> Vec<ErrorTicket> {
        lock(&self.inner.incidents).clone()
    }

    /// Drain raised incidents, e.g. to hand them to a tracker
    pub fn take_incidents(&self) -> Vec<ErrorTicket> {
        std::mem::take(&mut *lock(&self.inner.incidents))
    }

    /// Most recent fallback event, if the store is not on primary storage
    pub fn fallback_trigger(&self) -> Option<FallbackTrigger> {
        lock(&self.inner.trigger).clone()
    }

    /// Eligibility check without migrating
    pub fn check_restore(&self) -> RestoreCheck {
        self.inner.monitor.check_now()
    }

    /// Restore if the restore policy allows it
    pub async fn try_restore(&self) -> RestoreResult {
        self.inner.restore(false).await
    }

    /// Restore regardless of fallback age and category
    pub async fn force_restore(&self) -> RestoreResult {
        self.inner.restore(true).await
    }

    /// Snapshot memory tickets and pending deletions now
    pub fn save_snapshot(&self) -> StorageResult<usize> {
        self.inner.recovery.save_pending(self.inner.pending_state())
    }

    pub fn recovery_stats(&self) -> RecoveryStats {
        self.inner.recovery.stats()
    }

    /// Start autosave and, while in fallback, restore polling
    pub fn start_background_tasks(&self) {
        self.inner.background.store(true, Ordering::SeqCst);

        let memory = Arc::clone(&self.inner.memory);
        let tombstones = Arc::clone(&self.inner.tombstones);
        let trigger = Arc::clone(&self.inner.trigger);
        self.inner.recovery.start(Arc::new(move || {
            collect_pending(&memory, &tombstones, &trigger)
        }));

        if self.inner.status.is_fallback() {
            self.inner.start_monitor();
        }
    }

    /// Stop background tasks and bring the recovery snapshot up to date
    pub fn shutdown(&self) {
        self.inner.background.store(false, Ordering::SeqCst);
        self.inner.monitor.stop();
        self.inner.recovery.stop();

        if let Err(e) = self.inner.recovery.sync(self.inner.pending_state()) {
            tracing::error!(error = %e, "Final recovery snapshot failed");
        }

        tracing::info!(session = %self.inner.session_id, "Ticket store shut down");
    }
}

impl Inner {
    /// Writes go to the database only when a location is recorded and open
    fn writes_durable(&self) -> bool {
        self.status.get_status().backing_location.is_some() && lock(&self.durable).is_some()
    }

    fn with_durable<R>(
        &self,
        f: impl FnOnce(&mut dyn TicketStore) -> StorageResult<R>,
    ) -> StorageResult<R> {
        let mut durable = lock(&self.durable);
        match durable.as_mut() {
            Some(store) => f(&mut **store),
            None => Err(StorageError::Unavailable(
                "no durable ticket store is open".to_string(),
            )),
        }
    }

    fn with_memory<R>(&self, f: impl FnOnce(&mut MemoryTicketStore) -> R) -> R {
        f(&mut lock(&self.memory))
    }

    fn pending_state(&self) -> PendingState {
        collect_pending(&self.memory, &self.tombstones, &self.trigger)
    }

    fn is_tombstoned(&self, id: &str) -> bool {
        lock(&self.tombstones).contains(id)
    }

    /// Store in memory; a re-created ticket is no longer pending deletion
    fn memory_insert(&self, record: &TicketRecord) -> StorageResult<()> {
        self.with_memory(|memory| memory.insert(record))?;
        if let Ok(id) = record_id(record) {
            lock(&self.tombstones).remove(id);
        }
        Ok(())
    }

    /// Remove while writes go to memory.
    ///
    /// A database ticket whose delete is refused gets a tombstone: it is
    /// hidden from reads and deleted by the next restore.
    fn memory_remove(&self, id: &str) -> StorageResult<bool> {
        let in_memory = self.with_memory(|memory| memory.remove(id))?;

        let in_durable = match self.with_durable(|store| store.remove(id)) {
            Ok(existed) => existed,
            Err(e) => {
                let has_store = lock(&self.durable).is_some();
                // An unreadable database may still hold the ticket
                let stored = has_store
                    && self
                        .durable_read(|store| store.get(id))
                        .map_or(true, |found| found.is_some());
                if stored {
                    tracing::info!(ticket = %id, error = %e, "Database delete deferred until restore");
                    lock(&self.tombstones).insert(id.to_string());
                }
                stored
            }
        };

        Ok(in_memory || in_durable)
    }

    fn incident_count(&self) -> usize {
        lock(&self.incidents).len()
    }

    fn incident_since(&self, count_before: usize) -> Option<u64> {
        lock(&self.incidents)
            .get(count_before..)
            .and_then(|raised| raised.last())
            .map(|ticket| ticket.id)
    }

    fn raise_incident(&self, error: &str, category: ErrorCategory, context: &str) {
        let ticket = self
            .ticket_factory
            .create_ticket(error, category, Some(context));
        lock(&self.incidents).push(ticket);
    }

    /// Switch writes to memory after a fallback-worthy failure
    fn enter_fallback(&self, cause: &FallbackCause, context: &str) {
        let category = cause.classification.category;
        let previous_mode = self.status.mode();
        let pending = lock(&self.memory).len();

        *lock(&self.trigger) = Some(FallbackTrigger::new(
            cause.error.clone(),
            category,
            pending,
            previous_mode,
        ));

        self.status.transition_to(
            OperatingMode::Fallback,
            format!("{}: {}", category, cause.classification.description),
            None,
            Some(cause.error.clone()),
        );

        if crate::error::tickets::should_create_ticket(category, 0) {
            self.raise_incident(&cause.error, category, context);
        }

        if self.background.load(Ordering::SeqCst) {
            self.start_monitor();
        }
    }

    /// Turn a failed outcome into an error, raising an incident if warranted
    fn fail<T>(&self, outcome: &FallbackOutcome<T>, context: &str) -> StorageError {
        let message = outcome
            .last_error()
            .unwrap_or("ticket storage operation failed")
            .to_string();

        // A failed fallback already raised an incident for the primary failure
        if !outcome.used_fallback {
            if let Some(classification) = &outcome.classification {
                let retries = outcome.attempts.saturating_sub(1);
                if crate::error::tickets::should_create_ticket(classification.category, retries) {
                    self.raise_incident(&message, classification.category, context);
                }
            }
        }

        StorageError::other(message)
    }

    fn report(
        &self,
        used_fallback: bool,
        attempts: u32,
        changed: bool,
        incidents_before: usize,
    ) -> WriteReport {
        let status = self.status.get_status();
        let location = if used_fallback {
            None
        } else {
            status.backing_location.clone()
        };
        WriteReport {
            mode: status.mode,
            location,
            used_fallback,
            attempts,
            changed,
            degraded: degradation_messages(&status),
            incident_id: self.incident_since(incidents_before),
        }
    }

    async fn insert_ticket(&self, record: &TicketRecord) -> StorageResult<WriteReport> {
        let id = record_id(record)?.to_string();
        let before = self.incident_count();

        if !self.writes_durable() {
            self.memory_insert(record)?;
            tracing::debug!(ticket = %id, "Ticket stored in memory");
            return Ok(self.report(false, 1, true, before));
        }

        let context = format!("insert ticket {}", id);
        let outcome = self
            .coordinator
            .run(
                move || async move { self.with_durable(|store| store.insert(record)) },
                Some(|cause: FallbackCause| async move {
                    self.enter_fallback(&cause, &context);
                    self.memory_insert(record)
                }),
            )
            .await;

        if outcome.failed {
            return Err(self.fail(&outcome, &format!("insert ticket {}", id)));
        }
        Ok(self.report(outcome.used_fallback, outcome.attempts, true, before))
    }

    async fn get_ticket(&self, id: &str) -> StorageResult<Option<TicketRecord>> {
        if !self.writes_durable() {
            if let Some(found) = self.with_memory(|memory| memory.get(id))? {
                return Ok(Some(found));
            }
            if self.is_tombstoned(id) {
                return Ok(None);
            }
            return Ok(self.durable_read(|store| store.get(id)).flatten());
        }

        let context = format!("get ticket {}", id);
        let outcome = self
            .coordinator
            .run(
                move || async move { self.with_durable(|store| store.get(id)) },
                Some(|cause: FallbackCause| async move {
                    self.enter_fallback(&cause, &context);
                    self.with_memory(|memory| memory.get(id))
                }),
            )
            .await;

        if outcome.failed {
            return Err(self.fail(&outcome, &format!("get ticket {}", id)));
        }
        Ok(outcome.value.flatten())
    }

    async fn list_tickets(&self) -> StorageResult<Vec<TicketRecord>> {
        if !self.writes_durable() {
            return Ok(self.merged_listing());
        }

        let outcome = self
            .coordinator
            .run(
                move || async move { self.with_durable(|store| store.list()) },
                Some(|cause: FallbackCause| async move {
                    self.enter_fallback(&cause, "list tickets");
                    Ok(self.merged_listing())
                }),
            )
            .await;

        if outcome.failed {
            return Err(self.fail(&outcome, "list tickets"));
        }
        Ok(outcome.value.unwrap_or_default())
    }

    async fn remove_ticket(&self, id: &str) -> StorageResult<WriteReport> {
        let before = self.incident_count();

        if !self.writes_durable() {
            let changed = self.memory_remove(id)?;
            return Ok(self.report(false, 1, changed, before));
        }

        let context = format!("remove ticket {}", id);
        let outcome = self
            .coordinator
            .run(
                move || async move { self.with_durable(|store| store.remove(id)) },
                Some(|cause: FallbackCause| async move {
                    self.enter_fallback(&cause, &context);
                    self.memory_remove(id)
                }),
            )
            .await;

        if outcome.failed {
            return Err(self.fail(&outcome, &format!("remove ticket {}", id)));
        }
        let changed = outcome.value.unwrap_or(false);
        Ok(self.report(outcome.used_fallback, outcome.attempts, changed, before))
    }

    /// Read from the database while in fallback, ignoring failures
    fn durable_read<R>(&self, f: impl FnOnce(&dyn TicketStore) -> StorageResult<R>) -> Option<R> {
        let durable = lock(&self.durable);
        let store = durable.as_ref()?;
        match f(&**store) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::debug!(error = %e, "Database read skipped in fallback");
                None
            }
        }
    }

    /// Database tickets overlaid with newer in-memory tickets
    fn merged_listing(&self) -> Vec<TicketRecord> {
        let mut merged: BTreeMap<String, TicketRecord> = BTreeMap::new();

        let tombstones = lock(&self.tombstones).clone();
        for ticket in self.durable_read(|store| store.list()).unwrap_or_default() {
            if let Ok(id) = record_id(&ticket) {
                if !tombstones.contains(id) {
                    merged.insert(id.to_string(), ticket.clone());
                }
            }
        }
        for ticket in lock(&self.memory).snapshot() {
            if let Ok(id) = record_id(&ticket) {
                merged.insert(id.to_string(), ticket.clone());
            }
        }

        merged.into_values().collect()
    }

    /// Reload a usable recovery snapshot into memory at startup
    async fn reload_snapshot(&self) {
        let Some(snapshot) = self.recovery.load_usable() else {
            return;
        };
        self.recovery.adopt();

        let resolved_mode = self.status.mode();
        let location = self.status.get_status().backing_location;

        self.status.transition_to(
            OperatingMode::Recovering,
            format!("reloading {} tickets from recovery snapshot", snapshot.ticket_count),
            location.as_deref(),
            None,
        );

        let loaded = self.with_memory(|memory| {
            let mut loaded = 0;
            for ticket in &snapshot.tickets {
                match memory.insert(ticket) {
                    Ok(()) => loaded += 1,
                    Err(e) => tracing::warn!(error = %e, "Skipping unusable ticket in snapshot"),
                }
            }
            loaded
        });
        lock(&self.tombstones).extend(snapshot.deleted_ids.iter().cloned());

        // The failure that produced the snapshot still decides when to migrate
        let held = snapshot
            .trigger
            .filter(|trigger| !should_attempt_restore(trigger, self.monitor.config().max_age));
        if let Some(trigger) = held {
            tracing::warn!(
                category = %trigger.category,
                triggered_at = %trigger.triggered_at.to_rfc3339(),
                tickets = loaded,
                deletions = snapshot.deleted_ids.len(),
                "Recovered tickets held in memory until restore is allowed"
            );
            self.status.transition_to(
                OperatingMode::Fallback,
                format!("holding {} recovered tickets after {} failure", loaded, trigger.category),
                None,
                Some(trigger.error.clone()),
            );
            *lock(&self.trigger) = Some(trigger);
            return;
        }

        self.status.transition_to(
            resolved_mode,
            format!("recovered {} tickets from snapshot", loaded),
            location.as_deref(),
            None,
        );

        if lock(&self.durable).is_some() {
            let result = self.restore(true).await;
            if !result.success {
                tracing::warn!(
                    errors = ?result.errors,
                    "Recovered tickets remain in memory"
                );
            }
        }
    }

    fn start_monitor(&self) {
        let weak = self.weak_self.clone();
        self.monitor.start(Arc::new(move |check: RestoreCheck| {
            tracing::info!(
                target_path = %describe_target(check.target_path.as_deref()),
                "Restore possible, scheduling migration"
            );
            tokio::spawn(restore_when_due(weak.clone()));
        }));
    }

    /// Time until the restore policy allows an automatic restore.
    ///
    /// `None` when no automatic restore will happen.
    fn restore_delay(&self) -> Option<Duration> {
        if !self.status.is_fallback() {
            return None;
        }

        let trigger = lock(&self.trigger).clone();
        let Some(trigger) = trigger else {
            return Some(Duration::ZERO);
        };

        match trigger.category {
            ErrorCategory::Full | ErrorCategory::Permission => {
                let age = trigger.age_at(chrono::Utc::now());
                Some(self.monitor.config().max_age.saturating_sub(age))
            }
            category => {
                tracing::warn!(
                    category = %category,
                    "Automatic restore disabled for this failure, operator action required"
                );
                None
            }
        }
    }

    async fn restore(&self, force: bool) -> RestoreResult {
        let _restoring = self.restore_lock.lock().await;

        let status = self.status.get_status();
        let pending: Vec<TicketRecord> = lock(&self.memory).snapshot();
        let deletions: Vec<String> = lock(&self.tombstones).iter().cloned().collect();
        let nothing_pending = pending.is_empty() && deletions.is_empty();
        let trigger = lock(&self.trigger).clone();
        let policy = self.monitor.config();

        if status.mode == OperatingMode::Primary && nothing_pending {
            return RestoreResult::refused(
                status.backing_location,
                "already running on primary storage",
            );
        }

        if !force {
            if let Some(trigger) = &trigger {
                if !should_attempt_restore(trigger, policy.max_age) {
                    return RestoreResult::refused(
                        None,
                        format!(
                            "restore not attempted for {} failure from {}",
                            trigger.category,
                            trigger.triggered_at.to_rfc3339()
                        ),
                    );
                }
            }
        }

        let check = self.monitor.check_now();
        let target = match (check.can_restore, check.target_path.clone()) {
            (true, Some(target)) => target,
            _ => return RestoreResult::refused(None, check.reason),
        };

        let current_location = status.backing_location.clone();
        if current_location.as_deref() == Some(target.as_path()) && nothing_pending {
            return RestoreResult::refused(
                current_location,
                "no better location available",
            );
        }

        // Reuse the open store when it already points at the target
        let reuse = lock(&self.durable)
            .as_ref()
            .map(|store| store.location().as_deref() == Some(target.as_path()))
            .unwrap_or(false);

        let mut store: Box<dyn TicketStore> = if reuse {
            match lock(&self.durable).take() {
                Some(store) => store,
                None => return RestoreResult::refused(Some(target), "database closed during restore"),
            }
        } else {
            match (self.opener)(&target) {
                Ok(store) => store,
                Err(e) => {
                    tracing::warn!(path = %target.display(), error = %e, "Cannot open restore target");
                    self.postpone_restore();
                    return RestoreResult::refused(Some(target), e.to_string());
                }
            }
        };

        if trigger.as_ref().map(|t| t.category) == Some(ErrorCategory::Corruption) {
            if let Err(e) = store.verify() {
                tracing::error!(path = %target.display(), error = %e, "Restore target failed verification");
                if reuse {
                    *lock(&self.durable) = Some(store);
                }
                return RestoreResult::refused(Some(target), format!("integrity check failed: {}", e));
            }
        }

        let mut failed_deletions = Vec::new();
        for id in &deletions {
            match store.remove(id) {
                Ok(_) => {
                    lock(&self.tombstones).remove(id);
                }
                Err(e) => {
                    tracing::warn!(ticket = %id, error = %e, "Failed to apply deferred delete");
                    failed_deletions.push((id.clone(), e.to_string()));
                }
            }
        }

        // Tickets on a previous alternate move along with the memory ones
        let mut originals = pending;
        if !reuse {
            if let Some(previous) = self.durable_read(|old| old.list()) {
                let in_memory: Vec<String> = originals
                    .iter()
                    .filter_map(|t| record_id(t).ok().map(str::to_string))
                    .collect();
                originals.extend(previous.into_iter().filter(|t| {
                    record_id(t)
                        .map(|id| !in_memory.iter().any(|m| m == id) && !deletions.iter().any(|d| d == id))
                        .unwrap_or(false)
                }));
            }
        }

        let prepared = prepare_for_migration(originals.clone());
        tracing::info!(
            tickets = prepared.len(),
            path = %target.display(),
            "Migrating tickets to durable storage"
        );

        let mut result = execute_migration(
            &prepared,
            |ticket| {
                let inserted = store.insert(&ticket);
                async move { inserted }
            },
            policy.batch_size,
        )
        .await
        .with_target(&target);

        for (id, error) in failed_deletions {
            result.errors.push(format!("{}: {}", id, error));
            result.failed_ids.push(id);
            result.success = false;
        }

        // Drop migrated tickets from memory unless they changed meanwhile.
        // Tickets written during the migration are moved in the same pass.
        {
            let mut memory = lock(&self.memory);
            for original in &originals {
                let Ok(id) = record_id(original) else { continue };
                if result.failed_ids.iter().any(|failed| failed == id) {
                    continue;
                }
                if memory.get(id).ok().flatten().as_ref() == Some(original) {
                    let _ = memory.remove(id);
                }
            }

            for late in prepare_for_migration(memory.snapshot()) {
                let Ok(id) = record_id(&late).map(str::to_string) else { continue };
                if result.failed_ids.contains(&id) {
                    continue;
                }
                match store.insert(&late) {
                    Ok(()) => {
                        let _ = memory.remove(&id);
                        result.items_migrated += 1;
                    }
                    Err(e) => {
                        result.errors.push(format!("{}: {}", id, e));
                        result.failed_ids.push(id);
                        result.success = false;
                    }
                }
            }
        }

        *lock(&self.durable) = Some(store);

        if result.success {
            let mode = if target == self.config.primary_path() {
                OperatingMode::Primary
            } else {
                OperatingMode::Fallback
            };
            self.status.transition_to(
                mode,
                format!("restored {} tickets to {}", result.items_migrated, target.display()),
                Some(target.as_path()),
                None,
            );

            if mode == OperatingMode::Primary {
                *lock(&self.trigger) = None;
                self.monitor.stop();
            }

            if let Err(e) = self.recovery.clear() {
                tracing::warn!(error = %e, "Failed to clear recovery snapshot after restore");
            }
        } else {
            let first_error = result.errors.first().cloned().unwrap_or_default();
            let category = classify_message(&first_error).category;

            self.status.transition_to(
                OperatingMode::Fallback,
                format!(
                    "restore incomplete: {} tickets could not be migrated",
                    result.failed_ids.len()
                ),
                None,
                Some(first_error.clone()),
            );

            {
                let mut trigger = lock(&self.trigger);
                match trigger.as_mut() {
                    Some(existing) => existing.triggered_at = chrono::Utc::now(),
                    None => {
                        *trigger = Some(FallbackTrigger::new(
                            first_error,
                            category,
                            result.failed_ids.len(),
                            OperatingMode::Primary,
                        ))
                    }
                }
            }

            if let Err(e) = self.recovery.save_pending(self.pending_state()) {
                tracing::error!(error = %e, "Failed to snapshot tickets left in memory");
            }
            self.postpone_restore();
        }

        result
    }

    /// Restart polling so the next writable check schedules another attempt
    fn postpone_restore(&self) {
        if self.background.load(Ordering::SeqCst) {
            self.monitor.stop();
            self.start_monitor();
        }
    }
}

/// Wait until the restore policy allows it, then restore
async fn restore_when_due(weak: Weak<Inner>) {
    loop {
        let delay = match weak.upgrade() {
            Some(inner) => inner.restore_delay(),
            None => return,
        };

        match delay {
            None => return,
            Some(delay) if delay.is_zero() => {
                if let Some(inner) = weak.upgrade() {
                    let result = inner.restore(false).await;
                    if result.success {
                        tracing::info!(
                            migrated = result.items_migrated,
                            duration_ms = result.duration_ms,
                            "Automatic restore finished"
                        );
                    } else {
                        tracing::warn!(errors = ?result.errors, "Automatic restore did not complete");
                    }
                }
                return;
            }
            Some(delay) => {
                tracing::info!(
                    wait = %humantime::format_duration(delay),
                    "Waiting before automatic restore"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

impl Drop for ResilientTicketStore {
    fn drop(&mut self) {
        if self.inner.background.load(Ordering::SeqCst) {
            self.shutdown();
        }
    }
}

impl std::fmt::Debug for ResilientTicketStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientTicketStore")
            .field("session_id", &self.inner.session_id)
            .field("status", &self.inner.status.get_status())
            .finish()
    }
}
