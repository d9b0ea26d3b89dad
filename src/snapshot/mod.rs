//! Published dataset and the single shared slot holding it.

pub mod merge;

use std::mem;
use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use parking_lot::Mutex;

use crate::load;
use crate::task::TaskRecord;

/// Immutable, fully derived set of task records.
///
/// Only [`Snapshot::aggregate`] builds a non-empty snapshot, so every record
/// a reader sees carries its load aggregate.
#[derive(Debug, Default)]
pub struct Snapshot {
    records: Vec<TaskRecord>,
    refreshed_at: Option<NaiveDateTime>,
}

impl Snapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Recompute the load aggregate over `records` and freeze the result.
    pub fn aggregate(mut records: Vec<TaskRecord>, refreshed_at: NaiveDateTime) -> Self {
        load::apply(&mut records);
        Self {
            records,
            refreshed_at: Some(refreshed_at),
        }
    }

    pub fn records(&self) -> &[TaskRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// When the cycle that built this snapshot ran. `None` before the first
    /// successful refresh.
    pub fn refreshed_at(&self) -> Option<NaiveDateTime> {
        self.refreshed_at
    }

    pub fn latest_created_at(&self) -> Option<NaiveDateTime> {
        self.records.iter().map(|r| r.created_at).max()
    }

    /// Midnight of the day of the most recent record.
    pub fn cutoff(&self) -> Option<NaiveDateTime> {
        self.latest_created_at().map(start_of_day)
    }

    /// Earliest and latest creation dates.
    pub fn date_bounds(&self) -> Option<(NaiveDate, NaiveDate)> {
        let mut iter = self.records.iter().map(|r| r.created_at.date());
        let first = iter.next()?;
        Some(iter.fold((first, first), |(lo, hi), d| (lo.min(d), hi.max(d))))
    }

    /// Records created within `[from, to]`, in snapshot order.
    pub fn in_range(
        &self,
        from: NaiveDateTime,
        to: NaiveDateTime,
    ) -> impl Iterator<Item = &TaskRecord> + '_ {
        self.records
            .iter()
            .filter(move |r| r.created_at >= from && r.created_at <= to)
    }

    /// The whole calendar day of the most recent record.
    pub fn default_day_range(&self) -> Option<(NaiveDateTime, NaiveDateTime)> {
        self.latest_created_at().map(|t| day_range(t.date()))
    }
}

pub fn start_of_day(t: NaiveDateTime) -> NaiveDateTime {
    t.date().and_time(NaiveTime::MIN)
}

/// `00:00:00` through `23:59:59` of `day`.
pub fn day_range(day: NaiveDate) -> (NaiveDateTime, NaiveDateTime) {
    let end = NaiveTime::from_hms_opt(23, 59, 59).unwrap_or(NaiveTime::MIN);
    (day.and_time(NaiveTime::MIN), day.and_time(end))
}

/// The one mutable cell shared between the refresh loop and readers.
///
/// The lock is held only to clone or swap the `Arc`.
#[derive(Debug)]
pub struct SnapshotSlot {
    current: Mutex<Arc<Snapshot>>,
}

impl SnapshotSlot {
    pub fn new(initial: Snapshot) -> Self {
        Self {
            current: Mutex::new(Arc::new(initial)),
        }
    }

    pub fn load(&self) -> Arc<Snapshot> {
        self.current.lock().clone()
    }

    /// Publish `next` and hand back the previous snapshot, so the caller
    /// drops it outside the lock.
    pub fn store(&self, next: Arc<Snapshot>) -> Arc<Snapshot> {
        mem::replace(&mut *self.current.lock(), next)
    }
}

impl Default for SnapshotSlot {
    fn default() -> Self {
        Self::new(Snapshot::empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load::tests::{record, t0};

    #[test]
    fn test_empty_snapshot() {
        let snap = Snapshot::empty();
        assert!(snap.is_empty());
        assert_eq!(snap.refreshed_at(), None);
        assert_eq!(snap.cutoff(), None);
        assert_eq!(snap.date_bounds(), None);
        assert_eq!(snap.default_day_range(), None);
    }

    #[test]
    fn test_aggregate_fills_loads() {
        let snap = Snapshot::aggregate(
            vec![
                record(0, Some(10), 5, 1.0),
                record(5, Some(20), 3, 2.0),
                record(15, None, 2, 0.5),
            ],
            t0(),
        );
        let lines: Vec<_> = snap.records().iter().map(|r| r.active_line_load).collect();
        assert_eq!(lines, vec![5, 8, 5]);
        assert_eq!(snap.refreshed_at(), Some(t0()));
    }

    #[test]
    fn test_cutoff_and_ranges() {
        // 08:00 on day one, 09:00 on day three.
        let snap = Snapshot::aggregate(
            vec![record(0, None, 1, 0.0), record(2 * 24 * 60 + 60, None, 1, 0.0)],
            t0(),
        );
        let day_three = NaiveDate::from_ymd_opt(2024, 3, 3).expect("valid date");

        assert_eq!(snap.cutoff(), Some(day_three.and_time(NaiveTime::MIN)));
        assert_eq!(snap.date_bounds(), Some((t0().date(), day_three)));

        let (from, to) = snap.default_day_range().expect("non-empty");
        assert_eq!(from, day_three.and_time(NaiveTime::MIN));
        assert_eq!(to.date(), day_three);
        assert_eq!(snap.in_range(from, to).count(), 1);
        assert_eq!(snap.in_range(t0(), to).count(), 2);
    }

    #[test]
    fn test_slot_swap_returns_previous() {
        let slot = SnapshotSlot::default();
        let before = slot.load();
        assert!(before.is_empty());

        let next = Arc::new(Snapshot::aggregate(vec![record(0, None, 1, 0.0)], t0()));
        let old = slot.store(Arc::clone(&next));

        assert!(Arc::ptr_eq(&old, &before));
        assert!(Arc::ptr_eq(&slot.load(), &next));
        // Readers holding the old snapshot keep it alive.
        assert!(before.is_empty());
    }
}
