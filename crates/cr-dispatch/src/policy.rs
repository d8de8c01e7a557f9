//! Rate/Window Policy
//!
//! Pure predicates over current time and the record snapshot. Every
//! time-of-day decision is taken in the store's fixed civil timezone,
//! never in the host zone: the operators and the store live in one
//! timezone regardless of where the process runs.

use chrono::{DateTime, Duration, Timelike, Utc};
use chrono_tz::Tz;
use cr_common::{phone, ContactRecord, DispatchStatus};

/// Whether `now` falls inside the operating window.
/// Inclusive of `start_hour`, exclusive of `end_hour`.
pub fn within_operating_window(
    now: DateTime<Utc>,
    tz: Tz,
    start_hour: u32,
    end_hour: u32,
) -> bool {
    let hour = now.with_timezone(&tz).hour();
    hour >= start_hour && hour < end_hour
}

/// Count records sent on the same civil date as `now`.
pub fn sent_today(records: &[ContactRecord], now: DateTime<Utc>, tz: Tz) -> u32 {
    let today = now.with_timezone(&tz).date_naive();
    records
        .iter()
        .filter(|r| r.status == Some(DispatchStatus::Sent))
        .filter(|r| {
            r.dispatched_at
                .map(|at| at.with_timezone(&tz).date_naive() == today)
                .unwrap_or(false)
        })
        .count() as u32
}

/// Whether a send to `normalized_phone` would repeat a recent send.
///
/// True iff some record with the same normalized phone is `Sent` with a
/// dispatch timestamp inside the window before `now`. Records whose phones
/// cannot be normalized never participate.
pub fn is_duplicate(
    records: &[ContactRecord],
    normalized_phone: &str,
    default_prefix: &str,
    now: DateTime<Utc>,
    window: Duration,
) -> bool {
    let cutoff = now - window;
    records
        .iter()
        .filter(|r| r.status == Some(DispatchStatus::Sent))
        .filter(|r| r.dispatched_at.map(|at| at >= cutoff).unwrap_or(false))
        .any(|r| phone::normalize(&r.phone, default_prefix).as_deref() == Some(normalized_phone))
}

/// Sends allowed in this cycle.
///
/// `daily_cap = None` means unlimited and is matched explicitly; the cap
/// arithmetic never runs without a configured cap.
pub fn session_budget(session_cap: u32, daily_cap: Option<u32>, sent_today: u32) -> u32 {
    match daily_cap {
        None => session_cap,
        Some(cap) => session_cap.min(cap.saturating_sub(sent_today)),
    }
}
