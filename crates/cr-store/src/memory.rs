//! In-memory store implementations.
//!
//! A row grid behind a mutex, mirroring the semantics of the real tabular
//! store. Used by the dispatch controller tests and by local development.

use async_trait::async_trait;
use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use cr_common::{ColumnSchema, ContactRecord, LogEntry, Template};

use crate::{parse_record, LogSink, RecordStore, TemplateSource};

/// Sheet-like record store backed by a `Vec` of rows.
pub struct MemoryRecordStore {
    rows: Mutex<Vec<Vec<String>>>,
    schema: ColumnSchema,
}

impl MemoryRecordStore {
    pub fn new(schema: ColumnSchema) -> Self {
        Self {
            rows: Mutex::new(Vec::new()),
            schema,
        }
    }

    /// Push a raw row, padding it to the schema width.
    pub fn push_row(&self, mut values: Vec<String>) -> usize {
        let mut rows = self.rows.lock();
        if values.len() < self.schema.width() {
            values.resize(self.schema.width(), String::new());
        }
        rows.push(values);
        rows.len() - 1
    }

    /// Snapshot of the raw grid, for assertions.
    pub fn raw_rows(&self) -> Vec<Vec<String>> {
        self.rows.lock().clone()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn read_all(&self) -> Result<Vec<ContactRecord>> {
        let rows = self.rows.lock();
        Ok(rows
            .iter()
            .enumerate()
            .map(|(idx, cells)| parse_record(idx, cells, &self.schema))
            .collect())
    }

    async fn read_cell(&self, row: usize, col: usize) -> Result<String> {
        let rows = self.rows.lock();
        let cells = rows
            .get(row)
            .ok_or_else(|| anyhow!("row {} out of range", row))?;
        Ok(cells.get(col).cloned().unwrap_or_default())
    }

    async fn write_cell(&self, row: usize, col: usize, value: &str) -> Result<()> {
        let mut rows = self.rows.lock();
        let cells = rows
            .get_mut(row)
            .ok_or_else(|| anyhow!("row {} out of range", row))?;
        if cells.len() <= col {
            cells.resize(col + 1, String::new());
        }
        cells[col] = value.to_string();
        Ok(())
    }

    async fn append_row(&self, values: Vec<String>) -> Result<usize> {
        Ok(self.push_row(values))
    }

    fn schema(&self) -> &ColumnSchema {
        &self.schema
    }
}

/// Fixed template catalog for tests and local runs.
pub struct MemoryTemplateSource {
    templates: Vec<Template>,
}

impl MemoryTemplateSource {
    pub fn new(templates: Vec<Template>) -> Self {
        Self { templates }
    }
}

#[async_trait]
impl TemplateSource for MemoryTemplateSource {
    async fn read_templates(&self) -> Result<Vec<Template>> {
        Ok(self.templates.clone())
    }
}

/// Log sink collecting entries in memory.
#[derive(Default)]
pub struct MemoryLogSink {
    entries: Mutex<Vec<LogEntry>>,
}

impl MemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().clone()
    }
}

#[async_trait]
impl LogSink for MemoryLogSink {
    async fn append(&self, entry: LogEntry) -> Result<()> {
        self.entries.lock().push(entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RecordStoreExt;
    use cr_common::DispatchStatus;

    #[tokio::test]
    async fn cell_writes_are_visible_to_reads() {
        let store = MemoryRecordStore::new(ColumnSchema::default());
        let schema = store.schema().clone();
        let row = store.push_row(vec!["Ana".to_string()]);

        store
            .write_cell(row, schema.status, DispatchStatus::Pending.label())
            .await
            .unwrap();

        assert_eq!(
            store.read_status(row).await.unwrap(),
            Some(DispatchStatus::Pending)
        );
        let records = store.read_all().await.unwrap();
        assert_eq!(records[row].status, Some(DispatchStatus::Pending));
    }

    #[tokio::test]
    async fn out_of_range_rows_error() {
        let store = MemoryRecordStore::new(ColumnSchema::default());
        assert!(store.read_cell(3, 0).await.is_err());
        assert!(store.write_cell(3, 0, "x").await.is_err());
    }
}
