//! Record Store Adapter
//!
//! Defines the interface to the tabular store holding contact records,
//! templates and the append-only dispatch log. The store is sheet-like:
//! rows are addressed by index, cells by column position, and the column
//! layout is a [`ColumnSchema`] supplied by configuration.
//!
//! The store offers no atomic compare-and-swap; callers serialize access
//! through the dispatch cycle lock and use single-cell re-reads as
//! advisory checks.

use async_trait::async_trait;
use anyhow::Result;
use chrono::{DateTime, Utc};
use cr_common::{
    ColumnSchema, ContactRecord, DirectoryFlag, DispatchStatus, LogEntry, Template,
};

pub mod memory;
pub mod sqlite;

pub use memory::{MemoryLogSink, MemoryRecordStore, MemoryTemplateSource};
pub use sqlite::SqliteRecordStore;

/// Cell format for dispatch timestamps.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339()
}

/// Parse a dispatch-timestamp cell. Blank or malformed cells yield `None`.
pub fn parse_timestamp(cell: &str) -> Option<DateTime<Utc>> {
    let cell = cell.trim();
    if cell.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc3339(cell)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Build a [`ContactRecord`] from a raw row of cells.
///
/// Missing trailing cells read as empty strings; nothing here fails, bad
/// cells simply produce an ineligible record.
pub fn parse_record(row: usize, cells: &[String], schema: &ColumnSchema) -> ContactRecord {
    let cell = |idx: usize| cells.get(idx).map(String::as_str).unwrap_or("").to_string();

    ContactRecord {
        row,
        name: cell(schema.name),
        surname: cell(schema.surname),
        phone: cell(schema.phone),
        call_date: cell(schema.call_date),
        outcome: cell(schema.outcome),
        pos: cell(schema.pos),
        operator: cell(schema.operator),
        template_id: cell(schema.template_id).trim().to_string(),
        status: DispatchStatus::from_label(&cell(schema.status)),
        dispatched_at: parse_timestamp(&cell(schema.dispatched_at)),
        directory_flag: DirectoryFlag::from_label(&cell(schema.directory_flag)),
    }
}

/// Interface to the tabular contact store.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Read every record in stored order.
    async fn read_all(&self) -> Result<Vec<ContactRecord>>;

    /// Read a single cell. Used for live status re-checks.
    async fn read_cell(&self, row: usize, col: usize) -> Result<String>;

    /// Write a single cell.
    async fn write_cell(&self, row: usize, col: usize, value: &str) -> Result<()>;

    /// Append a new row, returning its index.
    async fn append_row(&self, values: Vec<String>) -> Result<usize>;

    /// The column layout this store was configured with.
    fn schema(&self) -> &ColumnSchema;
}

/// Typed helpers over the raw cell interface.
#[async_trait]
pub trait RecordStoreExt: RecordStore {
    /// Re-read the live status of a single record, bypassing any snapshot.
    async fn read_status(&self, row: usize) -> Result<Option<DispatchStatus>> {
        let cell = self.read_cell(row, self.schema().status).await?;
        Ok(DispatchStatus::from_label(&cell))
    }

    /// Write just the status cell.
    async fn mark_status(&self, row: usize, status: DispatchStatus) -> Result<()> {
        self.write_cell(row, self.schema().status, status.label())
            .await
    }

    /// Write status and dispatch timestamp together.
    async fn mark_status_at(
        &self,
        row: usize,
        status: DispatchStatus,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.write_cell(row, self.schema().status, status.label())
            .await?;
        self.write_cell(row, self.schema().dispatched_at, &format_timestamp(at))
            .await
    }

    /// Record the directory side-channel outcome.
    async fn mark_directory_flag(&self, row: usize, flag: DirectoryFlag) -> Result<()> {
        self.write_cell(row, self.schema().directory_flag, flag.label())
            .await
    }
}

// Blanket implementation
impl<T: RecordStore + ?Sized> RecordStoreExt for T {}

/// Source of message templates. Absence of the template source is a
/// configuration error; absence of a single template is not.
#[async_trait]
pub trait TemplateSource: Send + Sync {
    async fn read_templates(&self) -> Result<Vec<Template>>;
}

/// Append-only log sink, consumed by external reporting.
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn append(&self, entry: LogEntry) -> Result<()>;
}
