use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod logging;
pub mod phone;

// ============================================================================
// Record Status
// ============================================================================

/// Dispatch status of a contact record.
///
/// Stored in the record store as a stable string label. Parsing is
/// whitespace-tolerant because operator-edited cells routinely carry
/// trailing spaces or non-breaking spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DispatchStatus {
    /// Queued by an operator, awaiting dispatch
    Pending,
    /// Claimed by a running cycle; written before any network call
    InProgress,
    /// Gateway accepted the message
    Sent,
    /// Send failed (render, gateway, or re-check failure)
    Failed,
    /// Suppressed by the dedup window
    DuplicateSkipped,
}

impl DispatchStatus {
    /// Stable label written to the status cell.
    pub fn label(&self) -> &'static str {
        match self {
            DispatchStatus::Pending => "PENDING",
            DispatchStatus::InProgress => "IN_PROGRESS",
            DispatchStatus::Sent => "SENT",
            DispatchStatus::Failed => "FAILED",
            DispatchStatus::DuplicateSkipped => "DUPLICATE",
        }
    }

    /// Parse a status cell. Unknown or blank labels yield `None`; such
    /// records are never eligible for dispatch.
    pub fn from_label(label: &str) -> Option<Self> {
        let cleaned: String = label
            .trim()
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        match cleaned.to_uppercase().as_str() {
            "PENDING" => Some(DispatchStatus::Pending),
            "IN_PROGRESS" => Some(DispatchStatus::InProgress),
            "SENT" => Some(DispatchStatus::Sent),
            "FAILED" => Some(DispatchStatus::Failed),
            "DUPLICATE" => Some(DispatchStatus::DuplicateSkipped),
            _ => None,
        }
    }

    /// Terminal for the current cycle (a later external reset may still
    /// return the record to `Pending`).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DispatchStatus::Sent | DispatchStatus::Failed | DispatchStatus::DuplicateSkipped
        )
    }
}

impl std::fmt::Display for DispatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Outcome of the directory (address book) side channel, written to the
/// directory-flag cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DirectoryFlag {
    Synced,
    Error,
}

impl DirectoryFlag {
    pub fn label(&self) -> &'static str {
        match self {
            DirectoryFlag::Synced => "SYNCED",
            DirectoryFlag::Error => "ERROR",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_uppercase().as_str() {
            "SYNCED" => Some(DirectoryFlag::Synced),
            "ERROR" => Some(DirectoryFlag::Error),
            _ => None,
        }
    }
}

// ============================================================================
// Contact Record
// ============================================================================

/// One queued contact/job awaiting a notification.
///
/// The row index is the record's position in the backing store and is the
/// handle used for all cell writes. The phone number is kept as entered;
/// normalization happens at the policy/gateway boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactRecord {
    pub row: usize,
    pub name: String,
    pub surname: String,
    pub phone: String,
    /// Call timestamp as entered by the operator (free-form)
    pub call_date: String,
    pub outcome: String,
    /// Point-of-sale tag
    pub pos: String,
    pub operator: String,
    /// Template selector; empty means the default template
    pub template_id: String,
    /// `None` for blank or unrecognized status cells
    pub status: Option<DispatchStatus>,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub directory_flag: Option<DirectoryFlag>,
}

impl ContactRecord {
    pub fn full_name(&self) -> String {
        let full = format!("{} {}", self.name.trim(), self.surname.trim());
        full.trim().to_string()
    }
}

// ============================================================================
// Column Schema
// ============================================================================

/// Declarative mapping from record fields to column positions in the
/// backing tabular store.
///
/// The column layout is an external contract owned by the operators; it is
/// configuration, never a hardcoded offset. The defaults match the
/// historical sheet layout, including the blank column at index 3.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnSchema {
    pub name: usize,
    pub surname: usize,
    pub phone: usize,
    pub call_date: usize,
    pub outcome: usize,
    pub pos: usize,
    pub operator: usize,
    pub template_id: usize,
    pub status: usize,
    pub dispatched_at: usize,
    pub directory_flag: usize,
}

impl Default for ColumnSchema {
    fn default() -> Self {
        Self {
            name: 0,
            surname: 1,
            phone: 2,
            // index 3 is a blank column in the historical layout
            call_date: 4,
            outcome: 5,
            pos: 6,
            operator: 7,
            template_id: 8,
            status: 9,
            dispatched_at: 10,
            directory_flag: 11,
        }
    }
}

impl ColumnSchema {
    /// Number of columns a row must have to cover every mapped field.
    pub fn width(&self) -> usize {
        [
            self.name,
            self.surname,
            self.phone,
            self.call_date,
            self.outcome,
            self.pos,
            self.operator,
            self.template_id,
            self.status,
            self.dispatched_at,
            self.directory_flag,
        ]
        .into_iter()
        .max()
        .unwrap_or(0)
            + 1
    }
}

// ============================================================================
// Templates
// ============================================================================

/// A message template, owned and edited externally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    pub name: String,
    /// Body text containing `[placeholder]` tokens
    pub body: String,
    pub media_url: Option<String>,
}

// ============================================================================
// Log Entries
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogCategory {
    Info,
    Warning,
    Error,
}

impl LogCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogCategory::Info => "INFO",
            LogCategory::Warning => "WARNING",
            LogCategory::Error => "ERROR",
        }
    }
}

/// Append-only log entry, consumed by external reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub at: DateTime<Utc>,
    pub category: LogCategory,
    pub message: String,
    pub phone: Option<String>,
    pub detail: Option<String>,
}

impl LogEntry {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            category: LogCategory::Info,
            message: message.into(),
            phone: None,
            detail: None,
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            category: LogCategory::Warning,
            message: message.into(),
            phone: None,
            detail: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            category: LogCategory::Error,
            message: message.into(),
            phone: None,
            detail: None,
        }
    }

    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = Some(phone.into());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Missing store, missing template source — fatal to the whole cycle
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(#[from] anyhow::Error),

    /// Network/timeout/non-2xx from the gateway
    #[error("Transport error: {0}")]
    Transport(String),

    /// Gateway explicitly rejected the message
    #[error("Gateway rejected message: {0}")]
    Rejected(String),

    #[error("Directory error: {0}")]
    Directory(String),
}

pub type Result<T> = std::result::Result<T, RelayError>;
