use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, Weak},
    time::Duration,
};

use flume::Receiver;
use futures_util::future::{AbortHandle, Abortable};

use crate::{
    compaction::{
        level::LazyLevels,
        metrics::{CompactionMetrics, CompactionMetricsSnapshot},
        picker,
        scheduler::{CompactionScheduler, CompactionSlots, ScheduledCompaction},
        trigger::{CompactionEvent, CompactionTrigger, CompactionWorker},
        ColumnFamilyState, CompactionError,
    },
    engine::{FlushJobInfo, FlushListener, StorageEngine},
    executor::Executor,
    logging::{fluid_log, LogContext},
    option::FluidOption,
};

/// Lazy-leveling compaction policy attached to one storage engine.
///
/// Every evaluation of a column family runs under one lock covering the rebuild
/// of the lazy-level view, the threshold scan and the dispatch of merges, so two
/// concurrent triggers never select the same files.
pub struct FluidLsm<E: StorageEngine> {
    engine: Arc<E>,
    option: Arc<FluidOption>,
    families: Mutex<HashMap<String, ColumnFamilyState>>,
    scheduler: CompactionScheduler<E>,
    slots: Arc<CompactionSlots>,
    trigger: CompactionTrigger,
    triggers: Receiver<CompactionEvent>,
    metrics: Arc<CompactionMetrics>,
}

impl<E: StorageEngine> FluidLsm<E> {
    /// Build a policy for `engine`. Flush notifications are not wired up; see
    /// [`FluidLsm::install`].
    pub fn new(engine: Arc<E>, option: FluidOption) -> Result<Self, CompactionError> {
        option.validate()?;
        let option = Arc::new(option);
        let metrics = Arc::new(CompactionMetrics::default());
        let slots = Arc::new(CompactionSlots::new(option.concurrency_cap));
        let (trigger, triggers) =
            CompactionTrigger::bounded(option.trigger_queue_capacity, Arc::clone(&metrics));
        let scheduler = CompactionScheduler::new(
            Arc::clone(&engine),
            Arc::clone(&option),
            Arc::clone(&slots),
            trigger.clone(),
            Arc::clone(&metrics),
        );
        Ok(Self {
            engine,
            option,
            families: Mutex::new(HashMap::new()),
            scheduler,
            slots,
            trigger,
            triggers,
            metrics,
        })
    }

    /// Build a policy and register it as a flush listener of `engine`.
    pub fn install(engine: Arc<E>, option: FluidOption) -> Result<Arc<Self>, CompactionError> {
        let policy = Arc::new(Self::new(Arc::clone(&engine), option)?);
        let listener = Arc::downgrade(&policy);
        engine.register_flush_listener(listener);
        Ok(policy)
    }

    /// Configuration in use.
    pub fn option(&self) -> &FluidOption {
        &self.option
    }

    fn lock_families(
        &self,
    ) -> Result<MutexGuard<'_, HashMap<String, ColumnFamilyState>>, CompactionError> {
        self.families.lock().map_err(|_| CompactionError::Poisoned)
    }

    fn apply_finished(
        &self,
        column_family: &str,
        state: &mut ColumnFamilyState,
    ) -> Result<(), CompactionError> {
        for finished in self.slots.take_finished(column_family)? {
            state.apply_finished(&finished);
        }
        Ok(())
    }

    /// Replace the published view with one built from a fresh metadata snapshot.
    fn rebuild(
        &self,
        column_family: &str,
        state: &mut ColumnFamilyState,
    ) -> Result<(), CompactionError> {
        self.apply_finished(column_family, state)?;
        let meta = self.engine.column_family_metadata(column_family)?;
        let levels = LazyLevels::build(&meta, &self.option, |file| state.state_of(file))?;
        state.prune(&meta);
        if self.option.debug {
            fluid_log!(
                log::Level::Info,
                ctx: LogContext::column_family(column_family),
                "lazy_levels",
                "\n{}",
                levels
            );
        }
        state.levels = Some(levels);
        Ok(())
    }

    /// Rebuild the lazy-level view of `column_family` and return a copy of it.
    ///
    /// On error the previously published view is kept.
    pub fn build_structure(&self, column_family: &str) -> Result<LazyLevels, CompactionError> {
        let mut families = self.lock_families()?;
        let state = families.entry(column_family.to_string()).or_default();
        self.rebuild(column_family, state)?;
        Ok(state.levels.clone().unwrap_or_default())
    }

    /// Evaluate `column_family` and dispatch a merge for every over-full lazy level.
    ///
    /// Levels are scanned from the deepest occupied one up to level 0. Returns the
    /// merges that were dispatched; a level skipped because of the concurrency cap
    /// does not appear.
    pub fn pick_compaction(
        &self,
        column_family: &str,
    ) -> Result<Vec<ScheduledCompaction>, CompactionError> {
        let mut families = self.lock_families()?;
        let state = families.entry(column_family.to_string()).or_default();
        self.rebuild(column_family, state)?;

        let Some(mut levels) = state.levels.take() else {
            return Ok(Vec::new());
        };
        let largest = levels.largest_occupied_level();
        let mut scheduled = Vec::new();
        let mut outcome = Ok(());
        for index in (0..=largest).rev() {
            let Some(pick) = picker::pick_level(&levels, index, largest, &self.option) else {
                continue;
            };
            match self.scheduler.schedule(column_family, &mut levels, state, pick) {
                Ok(Some(compaction)) => scheduled.push(compaction),
                Ok(None) => {}
                Err(err) => {
                    outcome = Err(err);
                    break;
                }
            }
        }
        state.levels = Some(levels);
        outcome.map(|()| scheduled)
    }

    /// Flush hook: evaluate the flushed column family.
    ///
    /// Failures are logged; the next flush or completion evaluates again.
    pub fn on_flush_completed(&self, info: &FlushJobInfo) {
        if let Err(err) = self.pick_compaction(&info.column_family) {
            fluid_log!(
                log::Level::Warn,
                ctx: LogContext::column_family(&info.column_family),
                "flush_evaluation_failed",
                "file={} error={}",
                info.file.name,
                err
            );
        }
    }

    /// Release the files left marked by merges that failed with an I/O error,
    /// then evaluate the column family again.
    ///
    /// Such files are never released automatically. Returns how many files were
    /// released.
    pub fn recover_stuck_files(&self, column_family: &str) -> Result<usize, CompactionError> {
        let released = {
            let mut families = self.lock_families()?;
            match families.get_mut(column_family) {
                Some(state) => {
                    self.apply_finished(column_family, state)?;
                    state.release_stuck()
                }
                None => 0,
            }
        };
        self.metrics.record_recovered_files(released);
        fluid_log!(
            log::Level::Info,
            ctx: LogContext::column_family(column_family),
            "stuck_files_recovered",
            "files={}",
            released
        );
        self.pick_compaction(column_family)?;
        Ok(released)
    }

    /// Files of `column_family` held back by merges that failed with an I/O error.
    pub fn stuck_files(&self, column_family: &str) -> Result<usize, CompactionError> {
        let mut families = self.lock_families()?;
        let Some(state) = families.get_mut(column_family) else {
            return Ok(0);
        };
        self.apply_finished(column_family, state)?;
        Ok(state.stuck_files())
    }

    /// Last published view of `column_family`, if it was ever evaluated.
    pub fn snapshot(&self, column_family: &str) -> Option<LazyLevels> {
        self.lock_families()
            .ok()?
            .get(column_family)
            .and_then(|state| state.levels.clone())
    }

    fn handle_event(&self, event: CompactionEvent) {
        match event {
            CompactionEvent::Reevaluate { column_family } => {
                self.metrics.record_reevaluation();
                if let Err(err) = self.pick_compaction(&column_family) {
                    fluid_log!(
                        log::Level::Warn,
                        ctx: LogContext::column_family(&column_family),
                        "reevaluate_failed",
                        "error={}",
                        err
                    );
                }
                self.trigger.handled();
            }
        }
    }

    /// Drain the re-evaluation queue on the calling thread, including requests
    /// posted while draining. Returns how many requests were handled.
    pub fn process_pending(&self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.triggers.try_recv() {
            self.handle_event(event);
            handled += 1;
        }
        handled
    }

    /// Drain the re-evaluation queue in the background on `executor`.
    ///
    /// Evaluations run inline on the executor's threads while holding the policy
    /// lock, so the engine's metadata reads and merge submissions must not block
    /// for long. The worker stops when the returned handle is dropped or once the
    /// policy itself is gone.
    pub fn spawn_worker<X: Executor>(self: &Arc<Self>, executor: &X) -> CompactionWorker {
        let (abort, registration) = AbortHandle::new_pair();
        let policy = Arc::downgrade(self);
        let triggers = self.triggers.clone();
        executor.spawn(async move {
            let _ = Abortable::new(trigger_loop(policy, triggers), registration).await;
        });
        CompactionWorker::new(abort)
    }

    /// Merges currently running in the engine.
    pub fn running_compactions(&self) -> usize {
        self.slots.running()
    }

    /// Re-evaluation requests waiting in the queue.
    pub fn pending_triggers(&self) -> usize {
        self.triggers.len()
    }

    /// Snapshot of the policy counters.
    pub fn metrics(&self) -> CompactionMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Wait until no merge runs and no re-evaluation is queued or in progress,
    /// checking every `poll`.
    ///
    /// Needs a consumer of the queue, such as a worker from
    /// [`FluidLsm::spawn_worker`], to make progress.
    pub async fn wait_for_compactions(&self, poll: Duration) {
        while self.running_compactions() > 0 || self.trigger.outstanding() > 0 {
            tokio::time::sleep(poll).await;
        }
    }
}

impl<E: StorageEngine> FlushListener for FluidLsm<E> {
    fn on_flush_completed(&self, info: &FlushJobInfo) {
        FluidLsm::on_flush_completed(self, info)
    }
}

async fn trigger_loop<E: StorageEngine>(
    policy: Weak<FluidLsm<E>>,
    triggers: Receiver<CompactionEvent>,
) {
    while let Ok(event) = triggers.recv_async().await {
        let Some(policy) = policy.upgrade() else {
            break;
        };
        policy.handle_event(event);
    }
}
