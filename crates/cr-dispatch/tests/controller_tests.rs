//! End-to-end dispatch cycle tests over the in-memory store.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use cr_common::{ColumnSchema, ContactRecord, DispatchStatus, LogCategory, Template};
use cr_dispatch::{
    ControllerConfig, CycleOutcome, DispatchController, MessageGateway, SendError, DEFAULT_BODY,
};
use cr_store::{
    format_timestamp, MemoryLogSink, MemoryRecordStore, MemoryTemplateSource, RecordStore,
    TemplateSource,
};

/// Gateway double recording every call.
#[derive(Default)]
struct ScriptedGateway {
    calls: Mutex<Vec<(String, String, Option<String>)>>,
    fail_phones: Mutex<HashSet<String>>,
    delay: Option<Duration>,
}

impl ScriptedGateway {
    fn failing_for(phone: &str) -> Self {
        let gateway = Self::default();
        gateway.fail_phones.lock().insert(phone.to_string());
        gateway
    }

    fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    fn calls(&self) -> Vec<(String, String, Option<String>)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl MessageGateway for ScriptedGateway {
    async fn send(
        &self,
        phone: &str,
        body: &str,
        media_url: Option<&str>,
    ) -> Result<(), SendError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.calls.lock().push((
            phone.to_string(),
            body.to_string(),
            media_url.map(str::to_string),
        ));
        if self.fail_phones.lock().contains(phone) {
            return Err(SendError::Transport("connection reset".to_string()));
        }
        Ok(())
    }
}

/// Template source that always errors, for configuration-failure tests.
struct BrokenTemplates;

#[async_trait]
impl TemplateSource for BrokenTemplates {
    async fn read_templates(&self) -> anyhow::Result<Vec<Template>> {
        Err(anyhow!("template sheet unavailable"))
    }
}

struct Harness {
    store: Arc<MemoryRecordStore>,
    gateway: Arc<ScriptedGateway>,
    log: Arc<MemoryLogSink>,
    controller: Arc<DispatchController>,
}

fn test_config() -> ControllerConfig {
    ControllerConfig {
        start_hour: 0,
        end_hour: 24,
        send_delay: Duration::ZERO,
        directory_settle_delay: Duration::ZERO,
        lock_wait: Duration::from_millis(100),
        ..Default::default()
    }
}

fn harness_with(config: ControllerConfig, gateway: ScriptedGateway) -> Harness {
    let store = Arc::new(MemoryRecordStore::new(ColumnSchema::default()));
    let gateway = Arc::new(gateway);
    let log = Arc::new(MemoryLogSink::new());
    let templates = Arc::new(MemoryTemplateSource::new(vec![Template {
        id: "1".to_string(),
        name: "Recall".to_string(),
        body: "Hi [nome], see you at [pdv]".to_string(),
        media_url: None,
    }]));
    let controller = Arc::new(DispatchController::new(
        store.clone(),
        templates,
        gateway.clone(),
        None,
        log.clone(),
        config,
    ));
    Harness {
        store,
        gateway,
        log,
        controller,
    }
}

fn harness() -> Harness {
    harness_with(test_config(), ScriptedGateway::default())
}

fn contact_row(
    name: &str,
    phone: &str,
    template_id: &str,
    status: &str,
    dispatched_at: &str,
) -> Vec<String> {
    let schema = ColumnSchema::default();
    let mut cells = vec![String::new(); schema.width()];
    cells[schema.name] = name.to_string();
    cells[schema.surname] = "Rossi".to_string();
    cells[schema.phone] = phone.to_string();
    cells[schema.pos] = "Store1".to_string();
    cells[schema.template_id] = template_id.to_string();
    cells[schema.status] = status.to_string();
    cells[schema.dispatched_at] = dispatched_at.to_string();
    cells
}

async fn record_at(store: &MemoryRecordStore, row: usize) -> ContactRecord {
    store.read_all().await.unwrap()[row].clone()
}

#[tokio::test]
async fn pending_record_is_sent_with_rendered_body() {
    let h = harness();
    h.store
        .push_row(contact_row("Ana", "3401234567", "1", "PENDING", ""));

    let report = h.controller.run_cycle().await.unwrap();

    assert_eq!(report.outcome, CycleOutcome::Completed);
    assert_eq!(report.sent, 1);
    assert_eq!(report.failed, 0);

    let calls = h.gateway.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "+393401234567");
    assert_eq!(calls[0].1, "Hi Ana, see you at Store1");

    let record = record_at(&h.store, 0).await;
    assert_eq!(record.status, Some(DispatchStatus::Sent));
    assert!(record.dispatched_at.is_some());

    let entries = h.log.entries();
    assert!(entries
        .iter()
        .any(|e| e.category == LogCategory::Info && e.message.contains("sent")));
}

#[tokio::test]
async fn cycle_with_no_pending_records_mutates_nothing() {
    let h = harness();
    h.store.push_row(contact_row(
        "Ana",
        "3401234567",
        "1",
        "SENT",
        &format_timestamp(Utc::now()),
    ));
    h.store
        .push_row(contact_row("Bea", "3407654321", "1", "FAILED", ""));
    let before = h.store.raw_rows();

    let report = h.controller.run_cycle().await.unwrap();

    assert_eq!(report.outcome, CycleOutcome::Completed);
    assert_eq!(report.sent + report.failed + report.duplicates, 0);
    assert_eq!(h.store.raw_rows(), before);
    assert!(h.gateway.calls().is_empty());
    assert!(h.log.entries().is_empty());
}

#[tokio::test]
async fn recent_send_to_same_phone_is_skipped_as_duplicate() {
    let h = harness();
    let five_min_ago = Utc::now() - chrono::Duration::minutes(5);
    h.store.push_row(contact_row(
        "Ana",
        "+39 340 1234567",
        "1",
        "SENT",
        &format_timestamp(five_min_ago),
    ));
    h.store
        .push_row(contact_row("Ana", "3401234567", "1", "PENDING", ""));

    let report = h.controller.run_cycle().await.unwrap();

    assert_eq!(report.duplicates, 1);
    assert_eq!(report.sent, 0);
    assert!(h.gateway.calls().is_empty());

    let record = record_at(&h.store, 1).await;
    assert_eq!(record.status, Some(DispatchStatus::DuplicateSkipped));
    // A skipped record never gets a dispatch timestamp
    assert_eq!(record.dispatched_at, None);

    assert!(h
        .log
        .entries()
        .iter()
        .any(|e| e.category == LogCategory::Info && e.message.contains("Duplicate")));
}

#[tokio::test]
async fn send_outside_dedup_window_is_allowed() {
    let h = harness();
    let long_ago = Utc::now() - chrono::Duration::minutes(45);
    h.store.push_row(contact_row(
        "Ana",
        "3401234567",
        "1",
        "SENT",
        &format_timestamp(long_ago),
    ));
    h.store
        .push_row(contact_row("Ana", "3401234567", "1", "PENDING", ""));

    let report = h.controller.run_cycle().await.unwrap();

    assert_eq!(report.sent, 1);
    assert_eq!(report.duplicates, 0);
}

#[tokio::test]
async fn outside_window_touches_nothing() {
    let config = ControllerConfig {
        start_hour: 0,
        end_hour: 0,
        ..test_config()
    };
    let h = harness_with(config, ScriptedGateway::default());
    h.store
        .push_row(contact_row("Ana", "3401234567", "1", "PENDING", ""));
    let before = h.store.raw_rows();

    let report = h.controller.run_cycle().await.unwrap();

    assert_eq!(report.outcome, CycleOutcome::OutsideWindow);
    assert_eq!(h.store.raw_rows(), before);
    assert!(h.gateway.calls().is_empty());
}

#[tokio::test]
async fn daily_cap_blocks_further_sends() {
    let config = ControllerConfig {
        daily_cap: Some(5),
        ..test_config()
    };
    let h = harness_with(config, ScriptedGateway::default());
    let now = format_timestamp(Utc::now());
    for i in 0..5 {
        h.store
            .push_row(contact_row("Ana", &format!("340000000{}", i), "1", "SENT", &now));
    }
    h.store
        .push_row(contact_row("Bea", "3401234567", "1", "PENDING", ""));

    let report = h.controller.run_cycle().await.unwrap();

    assert_eq!(report.outcome, CycleOutcome::DailyCapReached);
    assert!(h.gateway.calls().is_empty());
    assert_eq!(
        record_at(&h.store, 5).await.status,
        Some(DispatchStatus::Pending)
    );
}

#[tokio::test]
async fn remaining_daily_budget_limits_the_session() {
    let config = ControllerConfig {
        daily_cap: Some(6),
        ..test_config()
    };
    let h = harness_with(config, ScriptedGateway::default());
    let now = format_timestamp(Utc::now());
    for i in 0..5 {
        h.store
            .push_row(contact_row("Ana", &format!("340000000{}", i), "1", "SENT", &now));
    }
    // Dedup must not interfere, so distinct numbers
    h.store
        .push_row(contact_row("Bea", "3401111111", "1", "PENDING", ""));
    h.store
        .push_row(contact_row("Cla", "3402222222", "1", "PENDING", ""));

    let report = h.controller.run_cycle().await.unwrap();

    assert_eq!(report.sent, 1);
    assert_eq!(
        record_at(&h.store, 6).await.status,
        Some(DispatchStatus::Pending)
    );
}

#[tokio::test]
async fn stale_in_progress_record_is_recovered_and_sent() {
    let h = harness();
    let stale = Utc::now() - chrono::Duration::hours(1);
    h.store.push_row(contact_row(
        "Ana",
        "3401234567",
        "1",
        "IN_PROGRESS",
        &format_timestamp(stale),
    ));

    let report = h.controller.run_cycle().await.unwrap();

    assert_eq!(report.recovered, 1);
    assert_eq!(report.sent, 1);
    assert_eq!(
        record_at(&h.store, 0).await.status,
        Some(DispatchStatus::Sent)
    );
    assert!(h
        .log
        .entries()
        .iter()
        .any(|e| e.category == LogCategory::Warning && e.message.contains("stale")));
}

#[tokio::test]
async fn fresh_in_progress_record_is_left_alone() {
    let h = harness();
    let just_now = Utc::now() - chrono::Duration::minutes(1);
    h.store.push_row(contact_row(
        "Ana",
        "3401234567",
        "1",
        "IN_PROGRESS",
        &format_timestamp(just_now),
    ));

    let report = h.controller.run_cycle().await.unwrap();

    assert_eq!(report.recovered, 0);
    assert_eq!(report.sent, 0);
    assert_eq!(
        record_at(&h.store, 0).await.status,
        Some(DispatchStatus::InProgress)
    );
}

#[tokio::test]
async fn unknown_template_falls_back_to_default_body() {
    let h = harness();
    h.store
        .push_row(contact_row("Ana", "3401234567", "9", "PENDING", ""));

    let report = h.controller.run_cycle().await.unwrap();

    assert_eq!(report.sent, 1);
    let calls = h.gateway.calls();
    let expected = DEFAULT_BODY.replace("[nome]", "Ana");
    assert_eq!(calls[0].1, expected);
    assert!(h
        .log
        .entries()
        .iter()
        .any(|e| e.category == LogCategory::Warning && e.message.contains("fallback")));
}

#[tokio::test]
async fn one_failed_send_does_not_stop_the_cycle() {
    let h = harness_with(test_config(), ScriptedGateway::failing_for("+393401111111"));
    h.store
        .push_row(contact_row("Ana", "3401111111", "1", "PENDING", ""));
    h.store
        .push_row(contact_row("Bea", "3402222222", "1", "PENDING", ""));

    let report = h.controller.run_cycle().await.unwrap();

    assert_eq!(report.failed, 1);
    assert_eq!(report.sent, 1);
    assert_eq!(
        record_at(&h.store, 0).await.status,
        Some(DispatchStatus::Failed)
    );
    assert!(record_at(&h.store, 0).await.dispatched_at.is_some());
    assert_eq!(
        record_at(&h.store, 1).await.status,
        Some(DispatchStatus::Sent)
    );

    let entries = h.log.entries();
    let failure = entries
        .iter()
        .find(|e| e.category == LogCategory::Error)
        .unwrap();
    assert!(failure.detail.as_deref().unwrap().contains("connection reset"));
}

#[tokio::test]
async fn invalid_phone_is_marked_failed() {
    let h = harness();
    h.store
        .push_row(contact_row("Ana", "n/a", "1", "PENDING", ""));

    let report = h.controller.run_cycle().await.unwrap();

    assert_eq!(report.failed, 1);
    assert!(h.gateway.calls().is_empty());
    assert_eq!(
        record_at(&h.store, 0).await.status,
        Some(DispatchStatus::Failed)
    );
}

#[tokio::test]
async fn no_delay_after_the_last_pending_record() {
    let config = ControllerConfig {
        send_delay: Duration::from_millis(500),
        ..test_config()
    };
    let h = harness_with(config, ScriptedGateway::default());
    h.store.push_row(contact_row(
        "Ana",
        "3400000001",
        "1",
        "SENT",
        &format_timestamp(Utc::now() - chrono::Duration::hours(2)),
    ));
    h.store
        .push_row(contact_row("Bea", "3401234567", "1", "PENDING", ""));

    let started = std::time::Instant::now();
    let report = h.controller.run_cycle().await.unwrap();

    assert_eq!(report.sent, 1);
    // Budget remains, but with no further pending rows the cycle must not
    // sit out the inter-send delay
    assert!(started.elapsed() < Duration::from_millis(400));
}

#[tokio::test]
async fn blank_phone_is_left_untouched() {
    let h = harness();
    h.store.push_row(contact_row("Ana", "", "1", "PENDING", ""));
    let before = h.store.raw_rows();

    let report = h.controller.run_cycle().await.unwrap();

    assert_eq!(report.sent + report.failed, 0);
    assert_eq!(h.store.raw_rows(), before);
}

#[tokio::test]
async fn session_cap_bounds_sends_per_cycle() {
    let config = ControllerConfig {
        session_cap: 2,
        ..test_config()
    };
    let h = harness_with(config, ScriptedGateway::default());
    for i in 0..4 {
        h.store
            .push_row(contact_row("Ana", &format!("340111111{}", i), "1", "PENDING", ""));
    }

    let report = h.controller.run_cycle().await.unwrap();

    assert_eq!(report.sent, 2);
    assert_eq!(
        record_at(&h.store, 2).await.status,
        Some(DispatchStatus::Pending)
    );
    assert_eq!(
        record_at(&h.store, 3).await.status,
        Some(DispatchStatus::Pending)
    );
}

#[tokio::test]
async fn concurrent_cycle_skips_when_lock_is_held() {
    let config = ControllerConfig {
        lock_wait: Duration::from_millis(20),
        ..test_config()
    };
    let h = harness_with(config, ScriptedGateway::slow(Duration::from_millis(300)));
    h.store
        .push_row(contact_row("Ana", "3401234567", "1", "PENDING", ""));

    let first = {
        let controller = h.controller.clone();
        tokio::spawn(async move { controller.run_cycle().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let second = h.controller.run_cycle().await.unwrap();
    assert_eq!(second.outcome, CycleOutcome::LockBusy);

    let first = first.await.unwrap().unwrap();
    assert_eq!(first.outcome, CycleOutcome::Completed);
    assert_eq!(first.sent, 1);
    assert_eq!(h.gateway.calls().len(), 1);
}

#[tokio::test]
async fn broken_template_source_aborts_before_any_mutation() {
    let store = Arc::new(MemoryRecordStore::new(ColumnSchema::default()));
    let gateway = Arc::new(ScriptedGateway::default());
    let log = Arc::new(MemoryLogSink::new());
    let controller = DispatchController::new(
        store.clone(),
        Arc::new(BrokenTemplates),
        gateway.clone(),
        None,
        log.clone(),
        test_config(),
    );
    store.push_row(contact_row("Ana", "3401234567", "1", "PENDING", ""));
    let before = store.raw_rows();

    let err = controller.run_cycle().await.unwrap_err();
    assert!(err.to_string().contains("templates"));
    assert_eq!(store.raw_rows(), before);
    assert!(gateway.calls().is_empty());
}

#[tokio::test]
async fn reset_for_retry_requeues_failed_and_duplicates() {
    let h = harness();
    h.store
        .push_row(contact_row("Ana", "3401111111", "1", "FAILED", ""));
    h.store
        .push_row(contact_row("Bea", "3402222222", "1", "DUPLICATE", ""));
    h.store.push_row(contact_row(
        "Cla",
        "3403333333",
        "1",
        "SENT",
        &format_timestamp(Utc::now()),
    ));

    let reset = h.controller.reset_for_retry().await.unwrap();

    assert_eq!(reset, 2);
    assert_eq!(
        record_at(&h.store, 0).await.status,
        Some(DispatchStatus::Pending)
    );
    assert_eq!(
        record_at(&h.store, 1).await.status,
        Some(DispatchStatus::Pending)
    );
    assert_eq!(
        record_at(&h.store, 2).await.status,
        Some(DispatchStatus::Sent)
    );
}

struct StubDirectory {
    fail: bool,
    calls: Mutex<Vec<String>>,
}

#[async_trait]
impl cr_dispatch::DirectoryService for StubDirectory {
    async fn ensure_contact(
        &self,
        _record: &ContactRecord,
        phone: &str,
    ) -> anyhow::Result<cr_dispatch::DirectoryOutcome> {
        self.calls.lock().push(phone.to_string());
        if self.fail {
            Err(anyhow!("directory unavailable"))
        } else {
            Ok(cr_dispatch::DirectoryOutcome::Created)
        }
    }
}

fn harness_with_directory(fail: bool) -> (Harness, Arc<StubDirectory>) {
    let store = Arc::new(MemoryRecordStore::new(ColumnSchema::default()));
    let gateway = Arc::new(ScriptedGateway::default());
    let log = Arc::new(MemoryLogSink::new());
    let directory = Arc::new(StubDirectory {
        fail,
        calls: Mutex::new(Vec::new()),
    });
    let templates = Arc::new(MemoryTemplateSource::new(vec![Template {
        id: "1".to_string(),
        name: "Recall".to_string(),
        body: "Hi [nome]".to_string(),
        media_url: None,
    }]));
    let controller = Arc::new(DispatchController::new(
        store.clone(),
        templates,
        gateway.clone(),
        Some(directory.clone()),
        log.clone(),
        test_config(),
    ));
    (
        Harness {
            store,
            gateway,
            log,
            controller,
        },
        directory,
    )
}

#[tokio::test]
async fn directory_upsert_marks_record_synced() {
    let (h, directory) = harness_with_directory(false);
    h.store
        .push_row(contact_row("Ana", "3401234567", "1", "PENDING", ""));

    let report = h.controller.run_cycle().await.unwrap();

    assert_eq!(report.sent, 1);
    assert_eq!(directory.calls.lock().as_slice(), ["+393401234567"]);
    assert_eq!(
        record_at(&h.store, 0).await.directory_flag,
        Some(cr_common::DirectoryFlag::Synced)
    );
}

#[tokio::test]
async fn directory_failure_does_not_block_the_send() {
    let (h, _directory) = harness_with_directory(true);
    h.store
        .push_row(contact_row("Ana", "3401234567", "1", "PENDING", ""));

    let report = h.controller.run_cycle().await.unwrap();

    assert_eq!(report.sent, 1);
    assert_eq!(h.gateway.calls().len(), 1);
    assert_eq!(
        record_at(&h.store, 0).await.directory_flag,
        Some(cr_common::DirectoryFlag::Error)
    );
    assert!(h
        .log
        .entries()
        .iter()
        .any(|e| e.category == LogCategory::Warning && e.message.contains("Directory")));
}

#[tokio::test]
async fn already_synced_contact_skips_the_directory() {
    let (h, directory) = harness_with_directory(false);
    let schema = ColumnSchema::default();
    let mut cells = contact_row("Ana", "3401234567", "1", "PENDING", "");
    cells[schema.directory_flag] = "SYNCED".to_string();
    h.store.push_row(cells);

    h.controller.run_cycle().await.unwrap();

    assert!(directory.calls.lock().is_empty());
}

#[tokio::test]
async fn stats_counts_by_status() {
    let h = harness();
    h.store
        .push_row(contact_row("Ana", "1", "1", "PENDING", ""));
    h.store
        .push_row(contact_row("Bea", "2", "1", "SENT", ""));
    h.store
        .push_row(contact_row("Cla", "3", "1", "FAILED", ""));
    h.store.push_row(contact_row("Dea", "4", "1", "", ""));

    let stats = h.controller.stats().await.unwrap();
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.sent, 1);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.unmarked, 1);
    // The sent record carries no timestamp, so it does not count for today
    assert_eq!(stats.sent_today, 0);
}
