//! SQLite Record Store Implementation
//!
//! Persists the contact grid, template catalog and dispatch log in SQLite.
//! Rows keep the sheet shape: each row is a JSON array of cell strings and
//! the [`ColumnSchema`] decides what the positions mean, so the column
//! contract stays configuration rather than schema.

use async_trait::async_trait;
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use cr_common::{ColumnSchema, ContactRecord, LogCategory, LogEntry, Template};

use crate::{parse_record, LogSink, RecordStore, TemplateSource};

/// SQLite implementation of the record store, template source and log sink.
pub struct SqliteRecordStore {
    pool: SqlitePool,
    schema: ColumnSchema,
}

impl SqliteRecordStore {
    pub fn new(pool: SqlitePool, schema: ColumnSchema) -> Self {
        Self { pool, schema }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create tables if they do not exist.
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS contacts (
                row_idx INTEGER PRIMARY KEY,
                cells TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS templates (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL DEFAULT '',
                body TEXT NOT NULL,
                media_url TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS dispatch_log (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                at INTEGER NOT NULL,
                category TEXT NOT NULL,
                message TEXT NOT NULL,
                phone TEXT,
                detail TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Initialized SQLite record store schema");
        Ok(())
    }

    async fn fetch_cells(&self, row: usize) -> Result<Vec<String>> {
        let record = sqlx::query("SELECT cells FROM contacts WHERE row_idx = ?")
            .bind(row as i64)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| anyhow!("row {} not found", row))?;
        let cells: Vec<String> = serde_json::from_str(record.get("cells"))?;
        Ok(cells)
    }

    /// Read recent log entries, newest first. Exposed for reporting.
    pub async fn read_log(&self, limit: u32) -> Result<Vec<LogEntry>> {
        let rows = sqlx::query(
            "SELECT at, category, message, phone, detail FROM dispatch_log \
             ORDER BY seq DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let at_ms: i64 = row.get("at");
            let at = DateTime::from_timestamp_millis(at_ms)
                .ok_or_else(|| anyhow!("invalid log timestamp"))?;
            let category = match row.get::<String, _>("category").as_str() {
                "ERROR" => LogCategory::Error,
                "WARNING" => LogCategory::Warning,
                _ => LogCategory::Info,
            };
            entries.push(LogEntry {
                at,
                category,
                message: row.get("message"),
                phone: row.try_get::<Option<String>, _>("phone").ok().flatten(),
                detail: row.try_get::<Option<String>, _>("detail").ok().flatten(),
            });
        }
        Ok(entries)
    }

    /// Delete log entries older than the cutoff, returning the count removed.
    pub async fn prune_log(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM dispatch_log WHERE at < ?")
            .bind(older_than.timestamp_millis())
            .execute(&self.pool)
            .await?;
        let removed = result.rows_affected();
        if removed > 0 {
            info!(removed, "Pruned old dispatch log entries");
        }
        Ok(removed)
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn read_all(&self) -> Result<Vec<ContactRecord>> {
        let rows = sqlx::query("SELECT row_idx, cells FROM contacts ORDER BY row_idx ASC")
            .fetch_all(&self.pool)
            .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let idx: i64 = row.get("row_idx");
            let cells: Vec<String> = serde_json::from_str(row.get("cells"))?;
            records.push(parse_record(idx as usize, &cells, &self.schema));
        }

        debug!(count = records.len(), "Read contact records");
        Ok(records)
    }

    async fn read_cell(&self, row: usize, col: usize) -> Result<String> {
        let cells = self.fetch_cells(row).await?;
        Ok(cells.get(col).cloned().unwrap_or_default())
    }

    async fn write_cell(&self, row: usize, col: usize, value: &str) -> Result<()> {
        let mut cells = self.fetch_cells(row).await?;
        if cells.len() <= col {
            cells.resize(col + 1, String::new());
        }
        cells[col] = value.to_string();

        sqlx::query("UPDATE contacts SET cells = ? WHERE row_idx = ?")
            .bind(serde_json::to_string(&cells)?)
            .bind(row as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn append_row(&self, mut values: Vec<String>) -> Result<usize> {
        if values.len() < self.schema.width() {
            values.resize(self.schema.width(), String::new());
        }

        let mut tx = self.pool.begin().await?;
        let next: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(row_idx), -1) + 1 FROM contacts")
            .fetch_one(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO contacts (row_idx, cells) VALUES (?, ?)")
            .bind(next)
            .bind(serde_json::to_string(&values)?)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(next as usize)
    }

    fn schema(&self) -> &ColumnSchema {
        &self.schema
    }
}

#[async_trait]
impl TemplateSource for SqliteRecordStore {
    async fn read_templates(&self) -> Result<Vec<Template>> {
        let rows = sqlx::query("SELECT id, name, body, media_url FROM templates ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| Template {
                id: row.get("id"),
                name: row.get("name"),
                body: row.get("body"),
                media_url: row
                    .try_get::<Option<String>, _>("media_url")
                    .ok()
                    .flatten(),
            })
            .collect())
    }
}

#[async_trait]
impl LogSink for SqliteRecordStore {
    async fn append(&self, entry: LogEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO dispatch_log (at, category, message, phone, detail) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(entry.at.timestamp_millis())
        .bind(entry.category.as_str())
        .bind(&entry.message)
        .bind(&entry.phone)
        .bind(&entry.detail)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
