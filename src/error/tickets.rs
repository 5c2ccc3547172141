//! Incident tickets for storage failures
//!
//! Turns a classified failure into a structured, priority-ranked ticket with
//! remediation steps. Transient lock contention only raises a ticket once it
//! has survived several retries.
use super::classification::ErrorCategory;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

/// Retry count from which a `busy` failure is worth a ticket
pub const BUSY_TICKET_THRESHOLD: u32 = 3;

/// Creator recorded on every system-raised ticket
pub const SYSTEM_CREATOR: &str = "system";

/// Ticket lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TicketStatus {
    Open,
    InProgress,
    Closed,
}

/// Incident record handed to the ticket-management collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorTicket {
    /// Process-local, strictly increasing
    pub id: u64,
    pub title: String,
    pub description: String,
    pub status: TicketStatus,

    /// 1 (highest) to 5 (lowest)
    pub priority: u8,
    pub creator: String,
    pub category: ErrorCategory,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Title used for tickets of a category
pub fn ticket_title(category: ErrorCategory) -> &'static str {
    match category {
        ErrorCategory::Busy => "Ticket database repeatedly locked",
        ErrorCategory::Full => "Disk full: ticket database cannot be written",
        ErrorCategory::Permission => "Permission denied writing ticket database",
        ErrorCategory::Corruption => "Ticket database corrupted",
        ErrorCategory::Unknown => "Unexpected ticket storage error",
    }
}

/// Priority for tickets of a category (1 = highest)
pub fn ticket_priority(category: ErrorCategory) -> u8 {
    match category {
        ErrorCategory::Corruption => 1,
        ErrorCategory::Full => 1,
        ErrorCategory::Permission => 2,
        ErrorCategory::Unknown => 2,
        ErrorCategory::Busy => 3,
    }
}

/// Ordered remediation steps for a category
pub fn remediation_steps(category: ErrorCategory) -> &'static [&'static str] {
    match category {
        ErrorCategory::Busy => &[
            "Check for other processes holding the ticket database open",
            "Close duplicate editor windows using the same workspace",
            "Remove stale lock files once no process uses the database",
        ],
        ErrorCategory::Full => &[
            "Free disk space on the volume holding the ticket database",
            "Check the disk quota for the current user",
            "Keep the application running; tickets are held in memory and snapshotted",
            "Wait for the automatic restore once the disk is writable again",
        ],
        ErrorCategory::Permission => &[
            "Check ownership of the ticket directory",
            "Ensure the current user has write permission on the directory and database file",
            "Check whether the volume is mounted read-only",
            "Wait for the automatic restore once permissions are fixed",
        ],
        ErrorCategory::Corruption => &[
            "Stop writing to the damaged database file and keep a copy of it",
            "Rebuild the database from the recovery snapshot",
            "Restore is not attempted automatically for corrupted databases",
        ],
        ErrorCategory::Unknown => &[
            "Inspect the error message and the application log",
            "Retry the operation manually",
            "Report the error if it keeps happening",
        ],
    }
}

/// Factory for incident tickets
#[derive(Debug)]
pub struct ErrorTicketFactory {
    next_id: AtomicU64,
}

impl ErrorTicketFactory {
    /// Create a factory whose first ticket has id 1
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Create a factory with a custom first id
    pub fn starting_at(first_id: u64) -> Self {
        Self {
            next_id: AtomicU64::new(first_id),
        }
    }

    /// Decide whether a failure deserves a ticket
    pub fn should_create_ticket(&self, category: ErrorCategory, retry_count: u32) -> bool {
        should_create_ticket(category, retry_count)
    }

    /// Create a ticket for a classified failure
    pub fn create_ticket(
        &self,
        error: &str,
        category: ErrorCategory,
        context: Option<&str>,
    ) -> ErrorTicket {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let now = Utc::now();

        let ticket = ErrorTicket {
            id,
            title: ticket_title(category).to_string(),
            description: build_description(error, category, context, now),
            status: TicketStatus::Open,
            priority: ticket_priority(category),
            creator: SYSTEM_CREATOR.to_string(),
            category,
            created_at: now,
            updated_at: now,
        };

        tracing::warn!(
            ticket_id = ticket.id,
            category = %category,
            priority = ticket.priority,
            "Raised storage incident ticket"
        );

        ticket
    }
}

impl Default for ErrorTicketFactory {
    fn default() -> Self {
        Self::new()
    }
}

/// Ticket-worthiness policy
pub fn should_create_ticket(category: ErrorCategory, retry_count: u32) -> bool {
    match category {
        ErrorCategory::Busy => retry_count >= BUSY_TICKET_THRESHOLD,
        ErrorCategory::Full
        | ErrorCategory::Permission
        | ErrorCategory::Corruption
        | ErrorCategory::Unknown => true,
    }
}

fn build_description(
    error: &str,
    category: ErrorCategory,
    context: Option<&str>,
    timestamp: DateTime<Utc>,
) -> String {
    let mut description = String::new();

    let _ = writeln!(description, "## Error\n\n```\n{}\n```\n", error);
    let _ = writeln!(
        description,
        "## Category\n\n{} - {}\n",
        category,
        category.description()
    );
    let _ = writeln!(description, "## Timestamp\n\n{}\n", timestamp.to_rfc3339());

    if let Some(context) = context.filter(|c| !c.trim().is_empty()) {
        let _ = writeln!(description, "## Context\n\n{}\n", context);
    }

    let _ = writeln!(description, "## Suggested remediation\n");
    for (index, step) in remediation_steps(category).iter().enumerate() {
        let _ = writeln!(description, "{}. {}", index + 1, step);
    }

    description
}
