//! Overlap workload aggregate.
//!
//! For every task, the total line count and volume of all tasks that were in
//! flight at the moment that task was created (itself included). A task is in
//! flight at `t` when it was created at or before `t` and either has no
//! completion time or completed at or after `t`.
//!
//! Computed as a sweep over sorted creation and completion times with prefix
//! sums, so a refresh over the whole retained window stays O(n log n).

use chrono::NaiveDateTime;

use crate::task::TaskRecord;

/// Load observed at one task's creation instant.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ActiveLoad {
    pub lines: u64,
    pub volume: f64,
}

/// Prefix sums over timestamps sorted ascending.
struct Timeline {
    at: Vec<NaiveDateTime>,
    lines: Vec<u64>,
    volume: Vec<f64>,
}

impl Timeline {
    fn build(mut points: Vec<(NaiveDateTime, u32, f64)>) -> Self {
        points.sort_unstable_by_key(|p| p.0);

        let mut at = Vec::with_capacity(points.len());
        let mut lines = Vec::with_capacity(points.len() + 1);
        let mut volume = Vec::with_capacity(points.len() + 1);
        lines.push(0);
        volume.push(0.0);

        let (mut l, mut v) = (0u64, 0.0f64);
        for (t, line_count, vol) in points {
            l += u64::from(line_count);
            v += vol;
            at.push(t);
            lines.push(l);
            volume.push(v);
        }

        Self { at, lines, volume }
    }

    /// Sums over all points at or before `t`.
    fn upto_inclusive(&self, t: NaiveDateTime) -> (u64, f64) {
        let idx = self.at.partition_point(|&p| p <= t);
        (self.lines[idx], self.volume[idx])
    }

    /// Sums over all points strictly before `t`.
    fn upto_exclusive(&self, t: NaiveDateTime) -> (u64, f64) {
        let idx = self.at.partition_point(|&p| p < t);
        (self.lines[idx], self.volume[idx])
    }
}

/// Compute the active load at each record's creation, in input order.
pub fn active_loads(records: &[TaskRecord]) -> Vec<ActiveLoad> {
    // A record completed before it was created can never be in flight, so it
    // is left out of both timelines.
    let contributing = records.iter().filter(|r| {
        r.execution_completed_at
            .map_or(true, |done| done >= r.created_at)
    });

    let mut opens = Vec::with_capacity(records.len());
    let mut closes = Vec::new();
    for r in contributing {
        opens.push((r.created_at, r.line_count, r.volume));
        if let Some(done) = r.execution_completed_at {
            closes.push((done, r.line_count, r.volume));
        }
    }

    let opens = Timeline::build(opens);
    let closes = Timeline::build(closes);

    records
        .iter()
        .map(|r| {
            let t = r.created_at;
            let (opened_lines, opened_volume) = opens.upto_inclusive(t);
            let (closed_lines, closed_volume) = closes.upto_exclusive(t);
            // Lines are exact. Volume matches the pairwise sum up to f64
            // rounding of the prefix sums; the clamp drops negative residue.
            ActiveLoad {
                lines: opened_lines - closed_lines,
                volume: (opened_volume - closed_volume).max(0.0),
            }
        })
        .collect()
}

/// Fill `active_line_load` / `active_volume_load` on every record.
pub fn apply(records: &mut [TaskRecord]) {
    let loads = active_loads(records);
    for (record, load) in records.iter_mut().zip(loads) {
        record.active_line_load = load.lines;
        record.active_volume_load = load.volume;
    }
}

/// Pairwise reference definition, quadratic. Used to check the sweep.
#[cfg(test)]
pub(crate) fn active_loads_pairwise(records: &[TaskRecord]) -> Vec<ActiveLoad> {
    records
        .iter()
        .map(|i| {
            records
                .iter()
                .filter(|j| j.is_active_at(i.created_at))
                .fold(ActiveLoad::default(), |acc, j| ActiveLoad {
                    lines: acc.lines + u64::from(j.line_count),
                    volume: acc.volume + j.volume,
                })
        })
        .collect()
}
