//! SQLite-backed durable ticket store
//!
//! Tickets are stored as JSON documents in a single table keyed by id.
//! WAL journaling keeps readers unblocked while a write is in flight.
use super::{record_id, TicketRecord, TicketStore};
use crate::{StorageError, StorageResult};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How long SQLite waits on a locked database before reporting SQLITE_BUSY
const BUSY_TIMEOUT: Duration = Duration::from_millis(250);

pub struct SqliteTicketStore {
    conn: Connection,
    path: PathBuf,
}

impl SqliteTicketStore {
    /// Open or create the ticket database at `path`
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        // WAL for concurrent readers and crash resilience
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        let store = Self { conn, path };
        store.initialize_schema()?;

        tracing::debug!(path = %store.path.display(), "Opened ticket database");
        Ok(store)
    }

    fn initialize_schema(&self) -> StorageResult<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS tickets (
                id TEXT PRIMARY KEY NOT NULL,
                document TEXT NOT NULL,
                stored_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_tickets_stored ON tickets(stored_at);
            "#,
        )?;
        Ok(())
    }

    /// Database file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run SQLite's integrity check; returns the problems found
    pub fn integrity_check(&self) -> StorageResult<Vec<String>> {
        let mut stmt = self.conn.prepare("PRAGMA integrity_check")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut problems = Vec::new();
        for row in rows {
            let line = row?;
            if line != "ok" {
                problems.push(line);
            }
        }
        Ok(problems)
    }
}

impl TicketStore for SqliteTicketStore {
    fn insert(&mut self, record: &TicketRecord) -> StorageResult<()> {
        let id = record_id(record)?;
        let document = serde_json::to_string(record)?;

        let tx = self.conn.transaction()?;
        tx.execute(
            r#"
            INSERT INTO tickets (id, document, stored_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(id) DO UPDATE SET
                document = excluded.document,
                stored_at = excluded.stored_at
            "#,
            params![id, document, Utc::now().to_rfc3339()],
        )?;
        tx.commit()?;

        Ok(())
    }

    fn get(&self, id: &str) -> StorageResult<Option<TicketRecord>> {
        let document: Option<String> = self
            .conn
            .query_row(
                "SELECT document FROM tickets WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;

        match document {
            Some(document) => Ok(Some(serde_json::from_str(&document)?)),
            None => Ok(None),
        }
    }

    fn list(&self) -> StorageResult<Vec<TicketRecord>> {
        let mut stmt = self
            .conn
            .prepare("SELECT document FROM tickets ORDER BY id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut tickets = Vec::new();
        for row in rows {
            tickets.push(serde_json::from_str(&row?)?);
        }
        Ok(tickets)
    }

    fn remove(&mut self, id: &str) -> StorageResult<bool> {
        let deleted = self
            .conn
            .execute("DELETE FROM tickets WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    fn count(&self) -> StorageResult<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM tickets", [], |row| row.get(0))?;
        Ok(count.max(0) as usize)
    }

    fn location(&self) -> Option<PathBuf> {
        Some(self.path.clone())
    }

    fn verify(&self) -> StorageResult<()> {
        let problems = self.integrity_check()?;
        if problems.is_empty() {
            return Ok(());
        }

        tracing::error!(
            path = %self.path.display(),
            problems = problems.len(),
            first = %problems[0],
            "Ticket database failed its integrity check"
        );
        Err(StorageError::other(format!(
            "database disk image is malformed: {}",
            problems.join("; ")
        )))
    }
}

impl std::fmt::Debug for SqliteTicketStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteTicketStore")
            .field("path", &self.path)
            .finish()
    }
}
