//! Dispatch of picked merges to the engine under a concurrency cap.

use std::sync::{Arc, Mutex, PoisonError};

use ulid::Ulid;

use crate::{
    compaction::{
        level::{FileState, LazyLevels, Run},
        metrics::CompactionMetrics,
        picker::LevelPick,
        state::ColumnFamilyState,
        trigger::CompactionTrigger,
        CompactionError,
    },
    engine::{EngineError, MergeJob, MergeOutput, StorageEngine},
    logging::{fluid_log, LogContext},
    option::FluidOption,
};

/// A merge handed to the engine by one evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledCompaction {
    /// Identifier of the merge job.
    pub job_id: Ulid,
    /// Lazy level the inputs were taken from.
    pub origin_level: usize,
    /// Lazy level the output belongs to.
    pub target_level: usize,
    /// Physical level the engine writes the output to.
    pub output_level: usize,
    /// Input file names.
    pub input_files: Vec<String>,
    /// Total size of the inputs.
    pub input_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FinishOutcome {
    Succeeded,
    FailedIo,
    Failed,
}

/// Outcome of a merge, recorded by its completion callback and applied by the
/// next evaluation of the same column family.
#[derive(Debug, Clone)]
pub(crate) struct FinishedCompaction {
    pub(crate) column_family: String,
    pub(crate) job_id: Ulid,
    pub(crate) input_files: Vec<String>,
    pub(crate) outcome: FinishOutcome,
}

#[derive(Debug, Default)]
struct SlotsInner {
    running: usize,
    finished: Vec<FinishedCompaction>,
}

/// Running-merge counter, guarded by its own lock.
///
/// Never held across an engine call and never taken before the structure lock.
#[derive(Debug)]
pub(crate) struct CompactionSlots {
    cap: usize,
    inner: Mutex<SlotsInner>,
}

impl CompactionSlots {
    pub(crate) fn new(cap: usize) -> Self {
        Self {
            cap,
            inner: Mutex::new(SlotsInner::default()),
        }
    }

    /// Take a slot if fewer than `cap` merges are running.
    pub(crate) fn try_acquire(&self) -> Result<bool, CompactionError> {
        let mut guard = self.inner.lock().map_err(|_| CompactionError::Poisoned)?;
        if guard.running >= self.cap {
            return Ok(false);
        }
        guard.running += 1;
        Ok(true)
    }

    /// Give a slot back and record how the merge ended.
    ///
    /// Runs on engine threads, so a poisoned lock is recovered rather than reported.
    pub(crate) fn release(&self, finished: FinishedCompaction) {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        guard.running = guard.running.saturating_sub(1);
        guard.finished.push(finished);
    }

    pub(crate) fn running(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .running
    }

    /// Remove and return the recorded outcomes of `column_family`.
    pub(crate) fn take_finished(
        &self,
        column_family: &str,
    ) -> Result<Vec<FinishedCompaction>, CompactionError> {
        let mut guard = self.inner.lock().map_err(|_| CompactionError::Poisoned)?;
        let (taken, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut guard.finished)
            .into_iter()
            .partition(|finished| finished.column_family == column_family);
        guard.finished = kept;
        Ok(taken)
    }
}

/// Physical level a merge from lazy level `origin` into lazy level `target` writes to.
///
/// Defaults to the deepest slot of the target's reserved range. A merge crossing
/// into a deeper lazy level takes the deepest slot whose run is still empty.
pub(crate) fn output_level(
    levels: &LazyLevels,
    origin: usize,
    target: usize,
    option: &FluidOption,
) -> usize {
    let k = option.smaller_lvl_runs_count;
    let deepest = option.deepest_slot(target);
    if target > origin {
        if let Some(level) = levels.level(target) {
            for depth in 0..=k {
                if level.runs().get(k - depth).is_some_and(Run::is_empty) {
                    return deepest - depth;
                }
            }
        }
    }
    deepest
}

/// Hands picked merges to the engine and wires their completion back.
pub(crate) struct CompactionScheduler<E: StorageEngine> {
    engine: Arc<E>,
    option: Arc<FluidOption>,
    slots: Arc<CompactionSlots>,
    trigger: CompactionTrigger,
    metrics: Arc<CompactionMetrics>,
}

impl<E: StorageEngine> CompactionScheduler<E> {
    pub(crate) fn new(
        engine: Arc<E>,
        option: Arc<FluidOption>,
        slots: Arc<CompactionSlots>,
        trigger: CompactionTrigger,
        metrics: Arc<CompactionMetrics>,
    ) -> Self {
        Self {
            engine,
            option,
            slots,
            trigger,
            metrics,
        }
    }

    /// Dispatch `pick`, or return `None` when the concurrency cap is reached.
    ///
    /// A skipped pick is not retried; the next flush or merge completion
    /// re-evaluates the column family from scratch.
    pub(crate) fn schedule(
        &self,
        column_family: &str,
        levels: &mut LazyLevels,
        state: &mut ColumnFamilyState,
        pick: LevelPick,
    ) -> Result<Option<ScheduledCompaction>, CompactionError> {
        let ctx = LogContext::column_family(column_family);
        if !self.slots.try_acquire()? {
            self.metrics.record_skipped_saturated();
            fluid_log!(
                log::Level::Debug,
                ctx: ctx,
                "compaction_deferred",
                "origin={} files={} running={} live_runs={}",
                pick.origin_level,
                pick.input_files.len(),
                self.slots.running(),
                levels
                    .level(pick.origin_level)
                    .map(|level| level.live_runs())
                    .unwrap_or_default()
            );
            return Ok(None);
        }

        let max_level = self.option.num_levels - 1;
        let output_level =
            output_level(levels, pick.origin_level, pick.target_level, &self.option).min(max_level);
        let target_level = pick.target_level.min(max_level);

        let job_id = Ulid::new();
        levels.mark_files(pick.origin_level, &pick.input_files, FileState::Compacting);
        state.mark_compacting(job_id, &pick.input_files);

        let scheduled = ScheduledCompaction {
            job_id,
            origin_level: pick.origin_level,
            target_level,
            output_level,
            input_files: pick.input_files,
            input_bytes: pick.input_bytes,
        };
        self.metrics.record_scheduled();
        fluid_log!(
            log::Level::Info,
            ctx: ctx,
            "compaction_scheduled",
            "job={} origin={} target={} output_level={} files={} bytes={}",
            job_id,
            scheduled.origin_level,
            scheduled.target_level,
            scheduled.output_level,
            scheduled.input_files.len(),
            scheduled.input_bytes
        );

        let job = MergeJob {
            job_id,
            column_family: column_family.to_string(),
            input_files: scheduled.input_files.clone(),
            output_level,
            output_file_size_limit: self.option.file_size,
        };
        let mut guard = CompletionGuard {
            pending: Some(PendingCompletion {
                finished: FinishedCompaction {
                    column_family: column_family.to_string(),
                    job_id,
                    input_files: scheduled.input_files.clone(),
                    outcome: FinishOutcome::Failed,
                },
                slots: Arc::clone(&self.slots),
                trigger: self.trigger.clone(),
                metrics: Arc::clone(&self.metrics),
            }),
        };
        self.engine
            .submit_merge(job, Box::new(move |result| guard.complete(result)));

        Ok(Some(scheduled))
    }
}

struct PendingCompletion {
    finished: FinishedCompaction,
    slots: Arc<CompactionSlots>,
    trigger: CompactionTrigger,
    metrics: Arc<CompactionMetrics>,
}

impl PendingCompletion {
    fn finish(mut self, outcome: FinishOutcome) {
        self.finished.outcome = outcome;
        let column_family = self.finished.column_family.clone();
        // waiters must not see zero running merges and zero requests in between
        let _hold = self.trigger.hold();
        self.slots.release(self.finished);
        if outcome != FinishOutcome::FailedIo {
            self.trigger.reevaluate(&column_family);
        }
    }
}

/// Owned by the merge callback; releases the slot exactly once, even if the
/// engine drops the callback without calling it.
struct CompletionGuard {
    pending: Option<PendingCompletion>,
}

impl CompletionGuard {
    fn complete(&mut self, result: Result<MergeOutput, EngineError>) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        let ctx = LogContext::column_family(&pending.finished.column_family);
        let outcome = match &result {
            Ok(output) => {
                pending.metrics.record_completed();
                fluid_log!(
                    log::Level::Info,
                    ctx: ctx,
                    "compaction_finished",
                    "job={} inputs={} outputs={}",
                    pending.finished.job_id,
                    pending.finished.input_files.len(),
                    output.output_files.len()
                );
                FinishOutcome::Succeeded
            }
            Err(err) => {
                pending.metrics.record_failed(err.is_io());
                fluid_log!(
                    log::Level::Warn,
                    ctx: ctx,
                    "compaction_failed",
                    "job={} io={} error={}",
                    pending.finished.job_id,
                    err.is_io(),
                    err
                );
                if err.is_io() {
                    FinishOutcome::FailedIo
                } else {
                    FinishOutcome::Failed
                }
            }
        };
        pending.finish(outcome);
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.take() {
            fluid_log!(
                log::Level::Warn,
                ctx: LogContext::column_family(&pending.finished.column_family),
                "compaction_failed",
                "job={} error=callback dropped without completion",
                pending.finished.job_id
            );
            pending.metrics.record_failed(false);
            pending.finish(FinishOutcome::Failed);
        }
    }
}
