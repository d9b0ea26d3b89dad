//! Periodic refresh loop.
//!
//! Each cycle fetches everything since the retained cutoff, preprocesses and
//! merges it with the retained history, recomputes the load aggregate and
//! publishes the result. All of that runs against a private working copy; the
//! shared slot is only touched to read the previous snapshot and to swap in
//! the new one.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use chrono::{Local, NaiveDateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RefreshConfig;
use crate::export::health::HealthMetrics;
use crate::snapshot::merge::{fetch_since, merge};
use crate::snapshot::{Snapshot, SnapshotSlot};
use crate::task::parse::{preprocess, Preprocessed};
use crate::upstream::{fetch_or_empty, RawRecord, TaskSource};

/// Clock used for `since` and live durations. Naive local time, matching
/// the upstream timestamps.
pub type NowFn = Arc<dyn Fn() -> NaiveDateTime + Send + Sync>;

/// Observable loop state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Idle = 0,
    Refreshing = 1,
}

impl WorkerState {
    fn from_u8(v: u8) -> Self {
        if v == Self::Refreshing as u8 {
            Self::Refreshing
        } else {
            Self::Idle
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Refreshing => f.write_str("refreshing"),
        }
    }
}

/// What a completed cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// A new snapshot was published.
    Published {
        records: usize,
        fetched: usize,
        skipped: usize,
    },
    /// Nothing usable was fetched; the previous snapshot stays.
    Unchanged { fetched: usize, skipped: usize },
}

impl CycleOutcome {
    fn label(&self) -> &'static str {
        match self {
            Self::Published { .. } => "published",
            Self::Unchanged { .. } => "unchanged",
        }
    }
}

/// Everything one cycle needs, cheap to clone into a spawned task.
struct Cycle<S> {
    source: Arc<S>,
    slot: Arc<SnapshotSlot>,
    state: Arc<AtomicU8>,
    health: Option<Arc<HealthMetrics>>,
    now: NowFn,
    lookback_days: u32,
}

impl<S> Clone for Cycle<S> {
    fn clone(&self) -> Self {
        Self {
            source: Arc::clone(&self.source),
            slot: Arc::clone(&self.slot),
            state: Arc::clone(&self.state),
            health: self.health.clone(),
            now: Arc::clone(&self.now),
            lookback_days: self.lookback_days,
        }
    }
}

/// Background data worker owning the refresh loop and the snapshot slot.
pub struct DataWorker<S> {
    cycle: Cycle<S>,
    interval: Duration,
    cancel: CancellationToken,
    handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl<S: TaskSource + 'static> DataWorker<S> {
    pub fn new(source: S, cfg: &RefreshConfig) -> Self {
        Self {
            cycle: Cycle {
                source: Arc::new(source),
                slot: Arc::new(SnapshotSlot::default()),
                state: Arc::new(AtomicU8::new(WorkerState::Idle as u8)),
                health: None,
                now: Arc::new(|| Local::now().naive_local()),
                lookback_days: cfg.lookback_days,
            },
            interval: cfg.interval,
            cancel: CancellationToken::new(),
            handle: parking_lot::Mutex::new(None),
        }
    }

    /// Report cycle metrics to `health`.
    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> Self {
        self.cycle.health = Some(health);
        self
    }

    /// Replace the wall clock.
    pub fn with_clock(mut self, now: NowFn) -> Self {
        self.cycle.now = now;
        self
    }

    /// The shared slot, for readers that outlive a borrow of the worker.
    pub fn snapshots(&self) -> Arc<SnapshotSlot> {
        Arc::clone(&self.cycle.slot)
    }

    /// The currently published snapshot. Empty before the first cycle.
    pub fn current_snapshot(&self) -> Arc<Snapshot> {
        self.cycle.slot.load()
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.cycle.state.load(Ordering::Acquire))
    }

    /// Run one cycle to completion.
    ///
    /// Errors and panics inside the cycle are caught here; the previous
    /// snapshot stays published and the worker returns to `Idle`.
    ///
    /// While the loop from [`DataWorker::start`] runs it is the only writer of
    /// the slot, and this fails without fetching.
    pub async fn refresh_once(&self) -> Result<CycleOutcome> {
        if self.handle.lock().is_some() {
            bail!("refresh loop is running");
        }
        refresh(&self.cycle).await
    }

    /// Spawn the refresh loop. The first cycle runs immediately. A second
    /// call while the loop is running does nothing.
    pub fn start(&self) {
        let mut running = self.handle.lock();
        if running.is_some() {
            warn!("data worker already started");
            return;
        }

        let cycle = self.cycle.clone();
        let cancel = self.cancel.clone();
        let interval = self.interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        // Already logged and counted.
                        let _ = refresh(&cycle).await;
                    }
                }
            }
        });

        *running = Some(handle);
        drop(running);

        info!(interval = ?self.interval, "data worker started");
    }

    /// Stop the loop, waiting for an in-flight cycle to finish.
    pub async fn stop(&self) -> Result<()> {
        self.cancel.cancel();

        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            handle.await.context("joining refresh loop")?;
        }

        info!("data worker stopped");

        Ok(())
    }
}

async fn refresh<S: TaskSource + 'static>(cycle: &Cycle<S>) -> Result<CycleOutcome> {
    cycle
        .state
        .store(WorkerState::Refreshing as u8, Ordering::Release);
    if let Some(health) = &cycle.health {
        health.worker_refreshing.set(1.0);
    }

    let start = Instant::now();
    let result = match tokio::spawn(run_cycle(cycle.clone())).await {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(anyhow!("refresh cycle panicked")),
        Err(e) => Err(anyhow::Error::new(e).context("joining refresh cycle")),
    };
    let elapsed = start.elapsed();

    cycle.state.store(WorkerState::Idle as u8, Ordering::Release);

    match &result {
        Ok(outcome) => {
            match outcome {
                CycleOutcome::Published {
                    records,
                    fetched,
                    skipped,
                } => info!(
                    records,
                    fetched,
                    skipped,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "snapshot published",
                ),
                CycleOutcome::Unchanged { fetched, skipped } => debug!(
                    fetched,
                    skipped,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "nothing fetched, snapshot unchanged",
                ),
            }
            if let Some(health) = &cycle.health {
                record_outcome(health, outcome, &cycle.slot);
            }
        }
        Err(e) => {
            error!(error = %format!("{e:#}"), "refresh cycle failed");
            if let Some(health) = &cycle.health {
                health.refresh_cycles.with_label_values(&["failed"]).inc();
            }
        }
    }

    if let Some(health) = &cycle.health {
        health.refresh_duration.observe(elapsed.as_secs_f64());
        health.worker_refreshing.set(0.0);
    }

    result
}

async fn run_cycle<S: TaskSource>(cycle: Cycle<S>) -> Result<CycleOutcome> {
    let now = (cycle.now)();
    let prev = cycle.slot.load();
    let since = fetch_since(&prev, cycle.lookback_days, now);

    let raw = fetch_or_empty(cycle.source.as_ref(), since).await;
    let fetched = raw.len();
    if fetched == 0 {
        return Ok(CycleOutcome::Unchanged {
            fetched: 0,
            skipped: 0,
        });
    }

    let (next, skipped) =
        tokio::task::spawn_blocking(move || build_snapshot(&prev, raw, since, now))
            .await
            .context("building snapshot")?;

    let Some(next) = next else {
        return Ok(CycleOutcome::Unchanged { fetched, skipped });
    };

    let records = next.len();
    let previous = cycle.slot.store(Arc::new(next));
    drop(previous);

    Ok(CycleOutcome::Published {
        records,
        fetched,
        skipped,
    })
}

/// CPU-bound part of a cycle: preprocess, merge and aggregate.
fn build_snapshot(
    prev: &Snapshot,
    raw: Vec<RawRecord>,
    since: NaiveDateTime,
    now: NaiveDateTime,
) -> (Option<Snapshot>, usize) {
    let Preprocessed { records, skipped } = preprocess(raw, now);
    let next = merge(prev, records, since).map(|merged| Snapshot::aggregate(merged, now));
    (next, skipped)
}

fn record_outcome(health: &HealthMetrics, outcome: &CycleOutcome, slot: &SnapshotSlot) {
    health
        .refresh_cycles
        .with_label_values(&[outcome.label()])
        .inc();

    let (fetched, skipped) = match *outcome {
        CycleOutcome::Published {
            fetched, skipped, ..
        } => (fetched, skipped),
        CycleOutcome::Unchanged { fetched, skipped } => (fetched, skipped),
    };
    health.records_fetched.inc_by(fetched as f64);
    health.records_skipped.inc_by(skipped as f64);

    if let CycleOutcome::Published { records, .. } = *outcome {
        health.snapshot_records.set(records as f64);
        health
            .last_refresh_timestamp
            .set(Utc::now().timestamp() as f64);
    } else {
        health.snapshot_records.set(slot.load().len() as f64);
    }
}
