//! Dispatch Controller
//!
//! Owns one dispatch cycle: claim the cycle lock, repair stale claims,
//! apply window and cap policy, then walk the pending records in stored
//! order sending at most the session budget. Record-level failures are
//! contained; only configuration problems abort a cycle, and those abort
//! before any record is touched.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use chrono_tz::Tz;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use cr_common::{
    phone, DirectoryFlag, DispatchStatus, LogEntry, RelayError, Result,
};
use cr_store::{LogSink, RecordStore, RecordStoreExt, TemplateSource};

use crate::directory::DirectoryService;
use crate::gateway::{MessageGateway, SendError};
use crate::policy;
use crate::template::{render, TemplateCatalog};

/// Dispatch cycle configuration
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub timezone: Tz,
    pub start_hour: u32,
    pub end_hour: u32,
    pub daily_cap: Option<u32>,
    pub session_cap: u32,
    pub send_delay: Duration,
    pub dedup_window: chrono::Duration,
    pub stale_threshold: chrono::Duration,
    pub lock_wait: Duration,
    pub default_country_prefix: String,
    pub directory_settle_delay: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            timezone: chrono_tz::Europe::Rome,
            start_hour: 9,
            end_hour: 19,
            daily_cap: None,
            session_cap: 20,
            send_delay: Duration::from_secs(30),
            dedup_window: chrono::Duration::minutes(30),
            stale_threshold: chrono::Duration::minutes(15),
            lock_wait: Duration::from_secs(10),
            default_country_prefix: "+39".to_string(),
            directory_settle_delay: Duration::from_secs(2),
        }
    }
}

/// Why a cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The pending scan ran to completion or exhausted the budget.
    Completed,
    /// Another cycle held the lock past the bounded wait.
    LockBusy,
    /// Outside the operating window.
    OutsideWindow,
    /// The daily cap left no budget.
    DailyCapReached,
}

/// Counters for one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub outcome: CycleOutcome,
    /// Stale in-progress claims reset to pending.
    pub recovered: u32,
    pub sent: u32,
    pub failed: u32,
    pub duplicates: u32,
}

impl CycleReport {
    fn ended(outcome: CycleOutcome, recovered: u32) -> Self {
        Self {
            outcome,
            recovered,
            sent: 0,
            failed: 0,
            duplicates: 0,
        }
    }
}

/// Record counts by status, for reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub pending: u32,
    pub in_progress: u32,
    pub sent: u32,
    pub failed: u32,
    pub duplicates: u32,
    pub unmarked: u32,
    /// Sends whose timestamp falls on the current civil date.
    pub sent_today: u32,
}

/// Serialized dispatcher over a shared record store.
pub struct DispatchController {
    store: Arc<dyn RecordStore>,
    templates: Arc<dyn TemplateSource>,
    gateway: Arc<dyn MessageGateway>,
    directory: Option<Arc<dyn DirectoryService>>,
    log: Arc<dyn LogSink>,
    cycle_lock: Mutex<()>,
    config: ControllerConfig,
}

impl DispatchController {
    pub fn new(
        store: Arc<dyn RecordStore>,
        templates: Arc<dyn TemplateSource>,
        gateway: Arc<dyn MessageGateway>,
        directory: Option<Arc<dyn DirectoryService>>,
        log: Arc<dyn LogSink>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            store,
            templates,
            gateway,
            directory,
            log,
            cycle_lock: Mutex::new(()),
            config,
        }
    }

    /// Run one dispatch cycle.
    ///
    /// Waits a bounded time for the cycle lock; a concurrent cycle makes
    /// this one a silent no-op rather than an error. Configuration
    /// problems (an unreadable template source) abort before any record
    /// mutation.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let _guard = match tokio::time::timeout(self.config.lock_wait, self.cycle_lock.lock()).await
        {
            Ok(guard) => guard,
            Err(_) => {
                debug!("Dispatch cycle already running, skipping");
                return Ok(CycleReport::ended(CycleOutcome::LockBusy, 0));
            }
        };

        // Template source failures are configuration errors and must abort
        // before anything is written
        let catalog = TemplateCatalog::new(
            self.templates
                .read_templates()
                .await
                .map_err(|e| RelayError::Config(format!("cannot load templates: {}", e)))?,
        );

        let mut records = self.store.read_all().await?;
        let now = Utc::now();

        // Repair claims abandoned by an interrupted cycle
        let mut recovered = 0u32;
        for record in records.iter_mut() {
            if record.status != Some(DispatchStatus::InProgress) {
                continue;
            }
            let stale = match record.dispatched_at {
                Some(at) => now - at >= self.config.stale_threshold,
                None => true,
            };
            if stale {
                warn!(row = record.row, "Resetting stale in-progress record");
                self.store
                    .mark_status(record.row, DispatchStatus::Pending)
                    .await?;
                self.append_log(
                    LogEntry::warning(format!(
                        "Reset stale in-progress record at row {}",
                        record.row
                    ))
                    .with_phone(record.phone.clone()),
                )
                .await;
                record.status = Some(DispatchStatus::Pending);
                recovered += 1;
            }
        }

        if !policy::within_operating_window(
            now,
            self.config.timezone,
            self.config.start_hour,
            self.config.end_hour,
        ) {
            debug!("Outside operating window, nothing to do");
            return Ok(CycleReport::ended(CycleOutcome::OutsideWindow, recovered));
        }

        let sent_today = policy::sent_today(&records, now, self.config.timezone);
        let budget = policy::session_budget(self.config.session_cap, self.config.daily_cap, sent_today);
        if budget == 0 {
            info!(sent_today, "Daily cap reached, skipping cycle");
            return Ok(CycleReport::ended(CycleOutcome::DailyCapReached, recovered));
        }

        let mut report = CycleReport::ended(CycleOutcome::Completed, recovered);
        for idx in 0..records.len() {
            if report.sent >= budget {
                break;
            }
            if records[idx].status != Some(DispatchStatus::Pending) {
                continue;
            }
            let record = records[idx].clone();

            // Blank phones are operator work in progress, not failures
            if record.phone.trim().is_empty() {
                continue;
            }

            let normalized =
                match phone::normalize(&record.phone, &self.config.default_country_prefix) {
                    Some(p) => p,
                    None => {
                        warn!(row = record.row, phone = %record.phone, "Unusable phone number");
                        if let Err(e) = self
                            .store
                            .mark_status(record.row, DispatchStatus::Failed)
                            .await
                        {
                            error!(row = record.row, "Failed to mark record: {}", e);
                        }
                        self.append_log(
                            LogEntry::error(format!(
                                "Invalid phone number at row {}",
                                record.row
                            ))
                            .with_detail(record.phone.clone()),
                        )
                        .await;
                        report.failed += 1;
                        continue;
                    }
                };

            if policy::is_duplicate(
                &records,
                &normalized,
                &self.config.default_country_prefix,
                now,
                self.config.dedup_window,
            ) {
                info!(row = record.row, "Skipping duplicate send");
                if let Err(e) = self
                    .store
                    .mark_status(record.row, DispatchStatus::DuplicateSkipped)
                    .await
                {
                    error!(row = record.row, "Failed to mark duplicate: {}", e);
                    continue;
                }
                records[idx].status = Some(DispatchStatus::DuplicateSkipped);
                self.append_log(
                    LogEntry::info(format!("Duplicate send suppressed at row {}", record.row))
                        .with_phone(normalized.clone()),
                )
                .await;
                report.duplicates += 1;
                continue;
            }

            // Someone else may have touched the row since the snapshot
            match self.store.read_status(record.row).await {
                Ok(Some(DispatchStatus::Pending)) => {}
                Ok(_) => {
                    debug!(row = record.row, "Record changed since snapshot, skipping");
                    continue;
                }
                Err(e) => {
                    error!(row = record.row, "Status re-check failed: {}", e);
                    if let Err(mark_err) = self
                        .store
                        .mark_status_at(record.row, DispatchStatus::Failed, Utc::now())
                        .await
                    {
                        error!(row = record.row, "Failed to mark record: {}", mark_err);
                    }
                    self.append_log(
                        LogEntry::error(format!(
                            "Status re-check failed at row {}",
                            record.row
                        ))
                        .with_phone(normalized.clone())
                        .with_detail(e.to_string()),
                    )
                    .await;
                    report.failed += 1;
                    continue;
                }
            }

            // Claim before any network traffic
            if let Err(e) = self
                .store
                .mark_status_at(record.row, DispatchStatus::InProgress, Utc::now())
                .await
            {
                error!(row = record.row, "Failed to claim record: {}", e);
                continue;
            }

            self.sync_directory(&record, &normalized).await;

            let resolved = catalog.resolve(&record.template_id);
            if resolved.fell_back {
                self.append_log(
                    LogEntry::warning(format!(
                        "Template '{}' not found for row {}, used fallback",
                        resolved.template.id, record.row
                    ))
                    .with_phone(normalized.clone()),
                )
                .await;
            }
            let body = render(&resolved.template.body, &record, Utc::now(), self.config.timezone);

            match self
                .gateway
                .send(&normalized, &body, resolved.template.media_url.as_deref())
                .await
            {
                Ok(()) => {
                    let at = Utc::now();
                    if let Err(e) = self
                        .store
                        .mark_status_at(record.row, DispatchStatus::Sent, at)
                        .await
                    {
                        // The message is out; the record just lost its mark
                        error!(row = record.row, "Failed to mark record sent: {}", e);
                    }
                    records[idx].status = Some(DispatchStatus::Sent);
                    records[idx].dispatched_at = Some(at);
                    self.append_log(
                        LogEntry::info(format!("Message sent for row {}", record.row))
                            .with_phone(normalized.clone()),
                    )
                    .await;
                    report.sent += 1;

                    // No point holding the lock for the delay when nothing
                    // is left to send
                    let more_pending = records[idx + 1..]
                        .iter()
                        .any(|r| r.status == Some(DispatchStatus::Pending));
                    if report.sent < budget && more_pending {
                        tokio::time::sleep(self.config.send_delay).await;
                    }
                }
                Err(send_err) => {
                    warn!(row = record.row, "Send failed: {}", send_err);
                    if let Err(e) = self
                        .store
                        .mark_status_at(record.row, DispatchStatus::Failed, Utc::now())
                        .await
                    {
                        error!(row = record.row, "Failed to mark record failed: {}", e);
                    }
                    records[idx].status = Some(DispatchStatus::Failed);
                    let category = match send_err {
                        SendError::Rejected(_) => "rejected",
                        SendError::Transport(_) => "transport",
                    };
                    self.append_log(
                        LogEntry::error(format!(
                            "Send failed for row {} ({})",
                            record.row, category
                        ))
                        .with_phone(normalized.clone())
                        .with_detail(send_err.to_string()),
                    )
                    .await;
                    report.failed += 1;
                }
            }
        }

        info!(
            sent = report.sent,
            failed = report.failed,
            duplicates = report.duplicates,
            recovered = report.recovered,
            "Dispatch cycle complete"
        );
        Ok(report)
    }

    /// Reset failed and duplicate-skipped records to pending so the next
    /// cycle retries them. Returns the number of records reset.
    pub async fn reset_for_retry(&self) -> Result<u32> {
        let _guard = self.cycle_lock.lock().await;
        let records = self.store.read_all().await?;

        let mut reset = 0u32;
        for record in &records {
            if matches!(
                record.status,
                Some(DispatchStatus::Failed) | Some(DispatchStatus::DuplicateSkipped)
            ) {
                self.store
                    .mark_status(record.row, DispatchStatus::Pending)
                    .await?;
                reset += 1;
            }
        }

        if reset > 0 {
            info!(reset, "Reset records for retry");
            self.append_log(LogEntry::info(format!(
                "Reset {} records for retry",
                reset
            )))
            .await;
        }
        Ok(reset)
    }

    /// Current record counts by status.
    pub async fn stats(&self) -> Result<DispatchStats> {
        let records = self.store.read_all().await?;
        let mut stats = DispatchStats::default();
        for record in &records {
            match record.status {
                Some(DispatchStatus::Pending) => stats.pending += 1,
                Some(DispatchStatus::InProgress) => stats.in_progress += 1,
                Some(DispatchStatus::Sent) => stats.sent += 1,
                Some(DispatchStatus::Failed) => stats.failed += 1,
                Some(DispatchStatus::DuplicateSkipped) => stats.duplicates += 1,
                None => stats.unmarked += 1,
            }
        }
        stats.sent_today = policy::sent_today(&records, Utc::now(), self.config.timezone);
        Ok(stats)
    }

    /// Best-effort directory upsert. Never blocks the send.
    async fn sync_directory(&self, record: &cr_common::ContactRecord, phone: &str) {
        let Some(directory) = &self.directory else {
            return;
        };
        if record.directory_flag == Some(DirectoryFlag::Synced) {
            return;
        }

        match directory.ensure_contact(record, phone).await {
            Ok(outcome) => {
                debug!(row = record.row, ?outcome, "Directory contact ensured");
                if let Err(e) = self
                    .store
                    .mark_directory_flag(record.row, DirectoryFlag::Synced)
                    .await
                {
                    error!(row = record.row, "Failed to mark directory flag: {}", e);
                }
                // Give the provider time to pick up the new contact
                tokio::time::sleep(self.config.directory_settle_delay).await;
            }
            Err(e) => {
                warn!(row = record.row, "Directory upsert failed: {}", e);
                if let Err(mark_err) = self
                    .store
                    .mark_directory_flag(record.row, DirectoryFlag::Error)
                    .await
                {
                    error!(row = record.row, "Failed to mark directory flag: {}", mark_err);
                }
                self.append_log(
                    LogEntry::warning(format!("Directory upsert failed for row {}", record.row))
                        .with_phone(phone.to_string())
                        .with_detail(e.to_string()),
                )
                .await;
            }
        }
    }

    async fn append_log(&self, entry: LogEntry) {
        if let Err(e) = self.log.append(entry).await {
            error!("Failed to append dispatch log entry: {}", e);
        }
    }
}
