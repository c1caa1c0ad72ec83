//! Aggregate progress counters shared by every task of an engine, and a reporter that turns
//! engine events into human-readable progress lines.

use crate::types::{EntryId, Event, TaskState};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::MissedTickBehavior;

/// Per-file progress is reported each time a download crosses another multiple of this
const PERCENT_STEP: u64 = 25;

/// Point-in-time view of engine progress
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    /// Bytes written across all tasks and attempts
    pub total_bytes: u64,
    /// Tasks received but not yet started
    pub pending: usize,
    /// Tasks currently transferring
    pub in_flight: usize,
    /// Tasks waiting out a backoff delay
    pub retrying: usize,
    /// Tasks finished successfully
    pub succeeded: usize,
    /// Tasks finished with a failure
    pub failed: usize,
    /// Highest `in_flight` value observed
    pub peak_in_flight: usize,
}

/// Lock-free progress counters
///
/// Tasks move between per-state counters through [`transition`](Self::transition); readers
/// call [`snapshot`](Self::snapshot) at any time, including while a batch is running.
/// `total_bytes` only ever grows: bytes written by an attempt that is later retried stay
/// counted.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    total_bytes: AtomicU64,
    pending: AtomicUsize,
    in_flight: AtomicUsize,
    retrying: AtomicUsize,
    succeeded: AtomicUsize,
    failed: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl ProgressTracker {
    /// Create a tracker with all counters at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Current counter values
    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            pending: self.pending.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
            retrying: self.retrying.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            peak_in_flight: self.peak_in_flight.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn add_pending(&self, count: usize) {
        self.pending.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn add_bytes(&self, bytes: u64) {
        self.total_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Move one task from `from` to `to`
    pub(crate) fn transition(&self, from: TaskState, to: TaskState) {
        if from == to {
            return;
        }
        // Saturating so a task that was never registered as pending cannot wrap the counter
        let _ = self
            .counter(from)
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(1))
            });
        let now = self.counter(to).fetch_add(1, Ordering::Relaxed) + 1;
        if to == TaskState::InFlight {
            self.peak_in_flight.fetch_max(now, Ordering::Relaxed);
        }
    }

    fn counter(&self, state: TaskState) -> &AtomicUsize {
        match state {
            TaskState::Pending => &self.pending,
            TaskState::InFlight => &self.in_flight,
            TaskState::Retrying => &self.retrying,
            TaskState::Succeeded => &self.succeeded,
            TaskState::Failed => &self.failed,
        }
    }
}

impl std::fmt::Display for ProgressSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} downloading, {} retrying, {} queued, {} done, {} failed, {} written",
            self.in_flight,
            self.retrying,
            self.pending,
            self.succeeded,
            self.failed,
            format_bytes(self.total_bytes)
        )
    }
}

/// Human-readable byte count (`512 B`, `1.5 KiB`, `2.0 GiB`)
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

/// Report the progress of one batch until it completes
///
/// Each line goes to `sink`: downloads starting, per-file progress in 25% steps when the size
/// is known, retries, completions and failures, plus an aggregate snapshot of `tracker` every
/// `interval` while work is outstanding. Returns after the batch's `BatchComplete` event, or
/// when the event channel closes. Subscribe before the batch starts so no event is missed.
pub async fn watch_progress<F>(
    mut events: broadcast::Receiver<Event>,
    tracker: Arc<ProgressTracker>,
    interval: Duration,
    mut sink: F,
) where
    F: FnMut(String),
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    let mut reported: HashMap<EntryId, u64> = HashMap::new();
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = ticker.tick() => {
                let snapshot = tracker.snapshot();
                if snapshot.in_flight + snapshot.retrying + snapshot.pending > 0 {
                    sink(snapshot.to_string());
                }
                continue;
            }
        };

        let event = match event {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "Progress reporter lagged behind events");
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        match event {
            Event::DownloadStarted { id, destination } => {
                sink(format!("[{id}] downloading to {}", destination.display()));
            }
            Event::Progress {
                id,
                bytes_written,
                total_bytes: Some(total),
            } if total > 0 => {
                let percent = bytes_written.saturating_mul(100) / total;
                let step = percent / PERCENT_STEP * PERCENT_STEP;
                let last = reported.entry(id).or_default();
                if step > *last && step < 100 {
                    *last = step;
                    sink(format!(
                        "[{id}] {step}% ({} of {})",
                        format_bytes(bytes_written),
                        format_bytes(total)
                    ));
                }
            }
            Event::Retrying {
                id,
                attempt,
                delay_ms,
                error,
            } => {
                reported.remove(&id);
                sink(format!(
                    "[{id}] attempt {attempt} failed ({error}), retrying in {delay_ms} ms"
                ));
            }
            Event::DownloadComplete { id, path, bytes } => {
                reported.remove(&id);
                sink(format!(
                    "[{id}] done: {} ({})",
                    path.display(),
                    format_bytes(bytes)
                ));
            }
            Event::DownloadFailed { id, error, code } => {
                reported.remove(&id);
                sink(format!("[{id}] failed ({code}): {error}"));
            }
            Event::ResolutionFailed { id, failure } => {
                sink(format!("[{id}] could not resolve: {failure}"));
            }
            Event::BatchComplete { summary } => {
                sink(format!(
                    "batch complete: {} downloaded ({}), {} unresolved, {} failed",
                    summary.succeeded,
                    format_bytes(summary.bytes),
                    summary.resolution_failed,
                    summary.download_failed
                ));
                break;
            }
            Event::Resolved { .. } | Event::Progress { .. } => {}
        }
    }
}
