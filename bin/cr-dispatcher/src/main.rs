//! ContactRelay Dispatcher
//!
//! Timer-driven daemon that runs dispatch cycles against the contact store
//! and sends queued notifications through the WhatsApp gateway.
//!
//! ## Usage
//!
//! ```text
//! cr-dispatcher                  run the dispatch loop
//! cr-dispatcher reset-failed     requeue failed and duplicate-skipped records
//! cr-dispatcher stats            print record counts by status
//! cr-dispatcher prune-log [days] delete log entries older than N days (default 30)
//! cr-dispatcher example-config   print an annotated config.toml
//! ```
//!
//! Configuration comes from `config.toml` (see `ConfigLoader` for search
//! paths) with `CONTACTRELAY_*` environment overrides.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono_tz::Tz;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use cr_config::AppConfig;
use cr_dispatch::{
    ControllerConfig, CycleOutcome, DispatchController, HttpDirectory, HttpDirectoryConfig,
    HttpGateway, HttpGatewayConfig,
};
use cr_store::SqliteRecordStore;
use sqlx::sqlite::SqlitePoolOptions;

#[tokio::main]
async fn main() -> Result<()> {
    cr_common::logging::init_logging("cr-dispatcher");

    let command = std::env::args().nth(1).unwrap_or_default();
    if command == "example-config" {
        print!("{}", AppConfig::example_toml());
        return Ok(());
    }

    let config = AppConfig::load().context("failed to load configuration")?;

    if command == "prune-log" {
        let days: i64 = std::env::args()
            .nth(2)
            .map(|v| v.parse())
            .transpose()
            .context("invalid day count")?
            .unwrap_or(30);
        let store = build_store(&config).await?;
        let cutoff = chrono::Utc::now() - chrono::Duration::days(days);
        let removed = store.prune_log(cutoff).await?;
        info!(removed, days, "Pruned dispatch log");
        return Ok(());
    }

    let controller = build_controller(&config).await?;

    match command.as_str() {
        "" | "run" => run_loop(config, controller).await,
        "reset-failed" => {
            let reset = controller.reset_for_retry().await?;
            info!(reset, "Requeued records for retry");
            Ok(())
        }
        "stats" => {
            let stats = controller.stats().await?;
            println!(
                "pending={} in_progress={} sent={} failed={} duplicates={} unmarked={} sent_today={}",
                stats.pending,
                stats.in_progress,
                stats.sent,
                stats.failed,
                stats.duplicates,
                stats.unmarked,
                stats.sent_today
            );
            Ok(())
        }
        other => anyhow::bail!(
            "unknown command '{}'. Use run, reset-failed, stats, prune-log or example-config",
            other
        ),
    }
}

async fn build_store(config: &AppConfig) -> Result<Arc<SqliteRecordStore>> {
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&config.store.db_url)
        .await
        .with_context(|| format!("cannot open store at {}", config.store.db_url))?;
    let store = Arc::new(SqliteRecordStore::new(pool, config.store.columns.clone()));
    store.init_schema().await?;
    info!("Record store ready at {}", config.store.db_url);
    Ok(store)
}

async fn build_controller(config: &AppConfig) -> Result<Arc<DispatchController>> {
    let timezone: Tz = config
        .window
        .timezone
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid timezone '{}': {}", config.window.timezone, e))?;

    let store = build_store(config).await?;

    let gateway = Arc::new(HttpGateway::new(HttpGatewayConfig {
        api_url: config.gateway.api_url.clone(),
        api_key: config.gateway.api_key.clone(),
        connect_timeout: Duration::from_secs(config.gateway.connect_timeout_secs),
        request_timeout: Duration::from_secs(config.gateway.request_timeout_secs),
    })?);

    let directory = if config.directory.enabled {
        let service = HttpDirectory::new(HttpDirectoryConfig {
            base_url: config.directory.base_url.clone(),
            api_token: config.directory.api_token.clone(),
            ..Default::default()
        })?;
        info!("Directory sync enabled: {}", config.directory.base_url);
        Some(Arc::new(service) as Arc<dyn cr_dispatch::DirectoryService>)
    } else {
        None
    };

    let controller_config = ControllerConfig {
        timezone,
        start_hour: config.window.start_hour,
        end_hour: config.window.end_hour,
        daily_cap: config.limits.daily_cap,
        session_cap: config.limits.session_cap,
        send_delay: Duration::from_secs(config.limits.send_delay_secs),
        dedup_window: chrono::Duration::minutes(config.limits.dedup_window_minutes),
        stale_threshold: chrono::Duration::minutes(config.limits.stale_threshold_minutes),
        lock_wait: Duration::from_millis(config.limits.lock_wait_ms),
        default_country_prefix: config.gateway.default_country_prefix.clone(),
        directory_settle_delay: Duration::from_secs(config.directory.settle_delay_secs),
    };

    Ok(Arc::new(DispatchController::new(
        store.clone(),
        store.clone(),
        gateway,
        directory,
        store,
        controller_config,
    )))
}

async fn run_loop(config: AppConfig, controller: Arc<DispatchController>) -> Result<()> {
    info!("Starting ContactRelay dispatcher");

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let dispatch_handle = if config.dispatch.enabled {
        let controller = Arc::clone(&controller);
        let poll_interval = Duration::from_secs(config.dispatch.poll_interval_secs);
        let mut shutdown_rx = shutdown_tx.subscribe();
        info!("Dispatch loop running every {:?}", poll_interval);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match controller.run_cycle().await {
                            Ok(report) => {
                                if report.outcome == CycleOutcome::Completed {
                                    info!(
                                        sent = report.sent,
                                        failed = report.failed,
                                        duplicates = report.duplicates,
                                        "Cycle finished"
                                    );
                                }
                            }
                            Err(e) => error!("Dispatch cycle failed: {}", e),
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Dispatch loop shutting down");
                        break;
                    }
                }
            }
        }))
    } else {
        warn!("Dispatch loop disabled by configuration");
        None
    };

    // Health server
    let health_addr = SocketAddr::from(([0, 0, 0, 0], config.dispatch.health_port));
    let app = axum::Router::new()
        .route("/health", axum::routing::get(health_handler))
        .route(
            "/stats",
            axum::routing::get({
                let controller = Arc::clone(&controller);
                move || stats_handler(controller)
            }),
        );
    let listener = tokio::net::TcpListener::bind(health_addr).await?;
    info!("Health server listening on http://{}/health", health_addr);

    let health_handle = {
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.recv().await;
                })
                .await
                .ok();
        })
    };

    shutdown_signal().await;
    info!("Shutdown signal received...");
    let _ = shutdown_tx.send(());

    let _ = tokio::time::timeout(Duration::from_secs(30), async {
        if let Some(handle) = dispatch_handle {
            let _ = handle.await;
        }
        let _ = health_handle.await;
    })
    .await;

    info!("ContactRelay dispatcher shutdown complete");
    Ok(())
}

async fn health_handler() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "UP",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn stats_handler(
    controller: Arc<DispatchController>,
) -> axum::Json<serde_json::Value> {
    match controller.stats().await {
        Ok(stats) => axum::Json(serde_json::json!({
            "pending": stats.pending,
            "in_progress": stats.in_progress,
            "sent": stats.sent,
            "failed": stats.failed,
            "duplicates": stats.duplicates,
            "unmarked": stats.unmarked,
            "sent_today": stats.sent_today,
        })),
        Err(e) => axum::Json(serde_json::json!({ "error": e.to_string() })),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
