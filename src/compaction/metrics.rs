//! Compaction-policy observability counters and summaries.

use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of the policy counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionMetricsSnapshot {
    /// Merge jobs handed to the engine.
    pub scheduled: u64,
    /// Triggered levels skipped because the concurrency cap was reached.
    pub skipped_saturated: u64,
    /// Merge jobs that finished successfully.
    pub completed: u64,
    /// Merge jobs that failed with an I/O-class error.
    pub failed_io: u64,
    /// Merge jobs that failed with any other error.
    pub failed_other: u64,
    /// Re-evaluations run from the trigger queue.
    pub reevaluations: u64,
    /// Re-evaluation requests dropped because the queue was full or closed.
    pub queue_drops: u64,
    /// Files released by operator recovery.
    pub recovered_files: u64,
}

/// Atomic counters shared by the scheduler, completion callbacks and the queue.
#[derive(Debug, Default)]
pub(crate) struct CompactionMetrics {
    scheduled: AtomicU64,
    skipped_saturated: AtomicU64,
    completed: AtomicU64,
    failed_io: AtomicU64,
    failed_other: AtomicU64,
    reevaluations: AtomicU64,
    queue_drops: AtomicU64,
    recovered_files: AtomicU64,
}

impl CompactionMetrics {
    pub(crate) fn record_scheduled(&self) {
        self.scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_skipped_saturated(&self) {
        self.skipped_saturated.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self, io: bool) {
        if io {
            self.failed_io.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_other.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_reevaluation(&self) {
        self.reevaluations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_queue_drop(&self) {
        self.queue_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_recovered_files(&self, files: usize) {
        self.recovered_files
            .fetch_add(files as u64, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> CompactionMetricsSnapshot {
        CompactionMetricsSnapshot {
            scheduled: self.scheduled.load(Ordering::Relaxed),
            skipped_saturated: self.skipped_saturated.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed_io: self.failed_io.load(Ordering::Relaxed),
            failed_other: self.failed_other.load(Ordering::Relaxed),
            reevaluations: self.reevaluations.load(Ordering::Relaxed),
            queue_drops: self.queue_drops.load(Ordering::Relaxed),
            recovered_files: self.recovered_files.load(Ordering::Relaxed),
        }
    }
}
