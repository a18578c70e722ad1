//! Gating decisions for periodic triggers and per-account collection.
//!
//! Everything here is pure apart from logging and the stale-progress reset in
//! [`check_delta`]; the current time is always passed in.

use crate::core::{AccountDescriptor, ProgressRecord, Timestamp, format_timestamp};
use chrono::Duration;
use tracing::{Level, event};

/// Whether a periodic trigger whose progress is `record` may fire at `now`.
///
/// A trigger that never ran may always fire; otherwise it waits until its
/// scheduled `next_start_time`, inclusive.
pub fn can_run_periodic_trigger(record: &ProgressRecord, now: Timestamp) -> bool {
    match record.next_start_time {
        Some(next) if now < next => {
            event!(
                Level::INFO,
                updated_by = record.updated_by.as_deref().unwrap_or("unknown"),
                next_start_time = %format_timestamp(&next),
                "periodic trigger already processed, waiting for next slot"
            );
            false
        }
        _ => true,
    }
}

/// Whether the account's previous collection window is still open.
pub fn check_overflow(record: &ProgressRecord, now: Timestamp, interval: Duration) -> bool {
    let Some(start) = record.next_start_time else {
        return false;
    };
    let end = start + interval;
    if now < end {
        event!(
            Level::INFO,
            now = %format_timestamp(&now),
            start_time = %format_timestamp(&start),
            end_time = %format_timestamp(&end),
            "overflow detected"
        );
        return true;
    }
    false
}

/// Whether the account lags more than two windows behind `now` and needs a
/// catch-up chain.
///
/// If the saved cursor predates the account's latest enable time the backlog
/// is obsolete: the cursor is reset to `None` so the next collection starts
/// fresh, and no correction is requested.
pub fn check_delta(
    record: &mut ProgressRecord,
    account: &AccountDescriptor,
    now: Timestamp,
    interval: Duration,
) -> bool {
    let Some(start) = record.next_start_time else {
        return false;
    };
    if let Some(enabled_at) = account.enabled_at {
        if start < enabled_at {
            event!(
                Level::INFO,
                account_id = %account.account_id,
                enabled_at = %format_timestamp(&enabled_at),
                start_time = %format_timestamp(&start),
                "collection re-enabled since last run, discarding stale progress"
            );
            record.next_start_time = None;
            return false;
        }
    }
    start < now - interval * 2
}

/// What the collect cycle should do for one account this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountAction {
    /// More than two windows behind: chain catch-up runs.
    CorrectDelta,
    /// Previous window still open: leave the account alone.
    Overflow,
    /// Submit one collection task from the current cursor.
    Collect,
}

/// Combines [`check_delta`] and [`check_overflow`] in the order the collect
/// cycle applies them.
pub fn evaluate_account(
    record: &mut ProgressRecord,
    account: &AccountDescriptor,
    now: Timestamp,
    interval: Duration,
) -> AccountAction {
    if check_delta(record, account, now, interval) {
        AccountAction::CorrectDelta
    } else if check_overflow(record, now, interval) {
        AccountAction::Overflow
    } else {
        AccountAction::Collect
    }
}
