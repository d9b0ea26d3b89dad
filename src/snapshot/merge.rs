//! Day-cutoff merge of retained history with a fresh fetch.
//!
//! Upstream is asked for everything since midnight of the newest retained
//! day. Retained records from before that midnight are kept as they are, the
//! rest are replaced wholesale by the fresh fetch, so a re-delivered record is
//! never counted twice.

use chrono::{Duration, NaiveDateTime};

use super::{start_of_day, Snapshot};
use crate::task::TaskRecord;

/// The `since` timestamp for the next fetch.
///
/// Midnight of the newest retained record, or midnight `lookback_days` before
/// `now` when nothing is retained yet. A lookback reaching past the earliest
/// representable date saturates there.
pub fn fetch_since(prev: &Snapshot, lookback_days: u32, now: NaiveDateTime) -> NaiveDateTime {
    prev.cutoff().unwrap_or_else(|| {
        let lookback = now
            .checked_sub_signed(Duration::days(i64::from(lookback_days)))
            .unwrap_or(NaiveDateTime::MIN);
        start_of_day(lookback)
    })
}

/// Combine `prev` with `fresh`.
///
/// Returns `None` when `fresh` is empty, meaning the previous snapshot stays
/// published unchanged. Otherwise the retained records older than `since`
/// come first, followed by all of `fresh`, both in arrival order. The load
/// aggregate is not recomputed here.
pub fn merge(
    prev: &Snapshot,
    fresh: Vec<TaskRecord>,
    since: NaiveDateTime,
) -> Option<Vec<TaskRecord>> {
    if fresh.is_empty() {
        return None;
    }

    let retained = prev.records().iter().filter(|r| r.created_at < since);
    let mut merged = Vec::with_capacity(prev.len() + fresh.len());
    merged.extend(retained.cloned());
    merged.extend(fresh);
    Some(merged)
}
