//! In-process engine that keeps only file metadata.
//!
//! Flushes append a file to physical level 0 and notify listeners; merges replace
//! their inputs with output files at the requested level. Merges either complete
//! inside `submit_merge` or wait until the caller drives them, which makes the
//! interleaving of flushes and completions fully deterministic.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    io,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use crate::engine::{
    ColumnFamilyMetadata, EngineError, FlushJobInfo, FlushListener, LevelMetadata, MergeCallback,
    MergeJob, MergeOutput, SstFileMetadata, StorageEngine,
};

/// When submitted merges run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionMode {
    /// Merges wait in a queue until [`InMemoryEngine::complete_next`] or
    /// [`InMemoryEngine::fail_next`] is called.
    Manual,
    /// Merges run and report inside `submit_merge`, on the submitting thread.
    Immediate,
}

struct PendingMerge {
    job: MergeJob,
    callback: MergeCallback,
}

#[derive(Default)]
struct EngineState {
    families: HashMap<String, Vec<Vec<SstFileMetadata>>>,
    pending: VecDeque<PendingMerge>,
    submitted: Vec<MergeJob>,
    injected_failures: VecDeque<EngineError>,
    metadata_failure: Option<io::ErrorKind>,
    next_file: u64,
}

impl EngineState {
    fn next_name(&mut self) -> (u64, String) {
        self.next_file += 1;
        (self.next_file, format!("{:06}.sst", self.next_file))
    }

    fn levels_mut(
        &mut self,
        column_family: &str,
    ) -> Result<&mut Vec<Vec<SstFileMetadata>>, EngineError> {
        self.families
            .get_mut(column_family)
            .ok_or_else(|| EngineError::UnknownColumnFamily(column_family.to_string()))
    }

    fn set_being_compacted(&mut self, job: &MergeJob, value: bool) {
        let names: HashSet<&str> = job.input_files.iter().map(String::as_str).collect();
        if let Some(levels) = self.families.get_mut(&job.column_family) {
            for file in levels.iter_mut().flatten() {
                if names.contains(file.name.as_str()) {
                    file.being_compacted = value;
                }
            }
        }
    }

    /// Replace the inputs of `job` with its outputs.
    fn run_merge(&mut self, job: &MergeJob) -> Result<MergeOutput, EngineError> {
        let names: HashSet<&str> = job.input_files.iter().map(String::as_str).collect();
        let levels = self.levels_mut(&job.column_family)?;
        if job.output_level >= levels.len() {
            return Err(EngineError::Aborted(format!(
                "output level {} out of range",
                job.output_level
            )));
        }
        let found = levels
            .iter()
            .flatten()
            .filter(|file| names.contains(file.name.as_str()))
            .count();
        if found != names.len() {
            return Err(EngineError::Aborted(format!(
                "{} of {} inputs no longer exist",
                names.len() - found,
                names.len()
            )));
        }

        let mut inputs = Vec::with_capacity(found);
        for level in levels.iter_mut() {
            let (taken, kept): (Vec<_>, Vec<_>) = std::mem::take(level)
                .into_iter()
                .partition(|file| names.contains(file.name.as_str()));
            *level = kept;
            inputs.extend(taken);
        }

        let total: u64 = inputs.iter().map(|file| file.size).sum();
        let smallest = inputs
            .iter()
            .map(|file| file.smallest_key.clone())
            .min()
            .unwrap_or_default();
        let largest = inputs
            .iter()
            .map(|file| file.largest_key.clone())
            .max()
            .unwrap_or_default();

        let mut sizes = Vec::new();
        let limit = job.output_file_size_limit;
        let mut remaining = total;
        while limit > 0 && remaining > limit {
            sizes.push(limit);
            remaining -= limit;
        }
        sizes.push(remaining);

        let mut outputs = Vec::with_capacity(sizes.len());
        for size in sizes {
            let (_, name) = self.next_name();
            outputs.push(SstFileMetadata::new(
                name,
                size,
                smallest.clone(),
                largest.clone(),
            ));
        }
        let output_files = outputs.iter().map(|file| file.name.clone()).collect();
        self.levels_mut(&job.column_family)?[job.output_level].extend(outputs);
        Ok(MergeOutput { output_files })
    }
}

/// Metadata-only storage engine for tests and policy simulation.
pub struct InMemoryEngine {
    num_levels: usize,
    mode: CompletionMode,
    state: Mutex<EngineState>,
    listeners: Mutex<Vec<Weak<dyn FlushListener>>>,
}

impl InMemoryEngine {
    /// Engine with `num_levels` physical levels whose merges wait to be driven.
    pub fn new(num_levels: usize) -> Self {
        Self::with_completion(num_levels, CompletionMode::Manual)
    }

    /// Engine with an explicit completion mode.
    pub fn with_completion(num_levels: usize, mode: CompletionMode) -> Self {
        Self {
            num_levels,
            mode,
            state: Mutex::new(EngineState::default()),
            listeners: Mutex::new(Vec::new()),
        }
    }

    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create an empty column family; existing ones are left untouched.
    pub fn create_column_family(&self, column_family: &str) {
        self.state()
            .families
            .entry(column_family.to_string())
            .or_insert_with(|| vec![Vec::new(); self.num_levels]);
    }

    /// Place an existing file at a physical level without notifying listeners.
    pub fn ingest(
        &self,
        column_family: &str,
        level: usize,
        file: SstFileMetadata,
    ) -> Result<(), EngineError> {
        let mut state = self.state();
        let levels = state.levels_mut(column_family)?;
        let slot = levels
            .get_mut(level)
            .ok_or_else(|| EngineError::Aborted(format!("level {level} out of range")))?;
        slot.push(file);
        Ok(())
    }

    /// Persist a write buffer of `size` bytes as a new level-0 file and notify
    /// flush listeners.
    pub fn flush(&self, column_family: &str, size: u64) -> Result<SstFileMetadata, EngineError> {
        let file = {
            let mut state = self.state();
            let (id, name) = state.next_name();
            let key = format!("k{id:06}");
            let file = SstFileMetadata::new(name, size, key.clone(), key);
            state.levels_mut(column_family)?[0].push(file.clone());
            file
        };

        let listeners: Vec<Arc<dyn FlushListener>> = {
            let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
            listeners.retain(|listener| listener.strong_count() > 0);
            listeners.iter().filter_map(Weak::upgrade).collect()
        };
        let info = FlushJobInfo {
            column_family: column_family.to_string(),
            file: file.clone(),
        };
        for listener in listeners {
            listener.on_flush_completed(&info);
        }
        Ok(file)
    }

    /// Run the oldest waiting merge and report it to its callback.
    ///
    /// Returns `None` when no merge is waiting. An error queued through
    /// [`InMemoryEngine::inject_merge_failure`] takes precedence over running it.
    pub fn complete_next(&self) -> Option<Result<MergeOutput, EngineError>> {
        let (callback, result, report) = {
            let mut state = self.state();
            let PendingMerge { job, callback } = state.pending.pop_front()?;
            let result = Self::execute(&mut state, &job);
            let report = Self::report(&result);
            (callback, result, report)
        };
        callback(result);
        Some(report)
    }

    /// Fail the oldest waiting merge with `error`. Returns `false` when none waits.
    pub fn fail_next(&self, error: EngineError) -> bool {
        let callback = {
            let mut state = self.state();
            let Some(PendingMerge { job, callback }) = state.pending.pop_front() else {
                return false;
            };
            state.set_being_compacted(&job, false);
            callback
        };
        callback(Err(error));
        true
    }

    /// Make the next merge to run fail with `error` instead.
    pub fn inject_merge_failure(&self, error: EngineError) {
        self.state().injected_failures.push_back(error);
    }

    /// Make metadata reads fail with an I/O error of `kind` until cleared with `None`.
    pub fn fail_metadata(&self, kind: Option<io::ErrorKind>) {
        self.state().metadata_failure = kind;
    }

    /// Number of merges waiting to be driven.
    pub fn pending_merges(&self) -> usize {
        self.state().pending.len()
    }

    /// Every merge job submitted so far, in submission order.
    pub fn submitted(&self) -> Vec<MergeJob> {
        self.state().submitted.clone()
    }

    /// Files currently stored at a physical level.
    pub fn level_files(&self, column_family: &str, level: usize) -> Vec<SstFileMetadata> {
        self.state()
            .families
            .get(column_family)
            .and_then(|levels| levels.get(level))
            .cloned()
            .unwrap_or_default()
    }

    fn execute(state: &mut EngineState, job: &MergeJob) -> Result<MergeOutput, EngineError> {
        if let Some(error) = state.injected_failures.pop_front() {
            state.set_being_compacted(job, false);
            return Err(error);
        }
        let result = state.run_merge(job);
        if result.is_err() {
            state.set_being_compacted(job, false);
        }
        result
    }

    // `EngineError` is not `Clone`; hand the caller an equivalent copy.
    fn report(result: &Result<MergeOutput, EngineError>) -> Result<MergeOutput, EngineError> {
        match result {
            Ok(output) => Ok(output.clone()),
            Err(EngineError::Io(err)) => Err(EngineError::Io(io::Error::new(
                err.kind(),
                err.to_string(),
            ))),
            Err(EngineError::UnknownColumnFamily(name)) => {
                Err(EngineError::UnknownColumnFamily(name.clone()))
            }
            Err(EngineError::Aborted(reason)) => Err(EngineError::Aborted(reason.clone())),
        }
    }
}

impl StorageEngine for InMemoryEngine {
    fn column_family_metadata(
        &self,
        column_family: &str,
    ) -> Result<ColumnFamilyMetadata, EngineError> {
        let state = self.state();
        if let Some(kind) = state.metadata_failure {
            return Err(EngineError::Io(io::Error::new(kind, "metadata unavailable")));
        }
        let levels = state
            .families
            .get(column_family)
            .ok_or_else(|| EngineError::UnknownColumnFamily(column_family.to_string()))?;
        Ok(ColumnFamilyMetadata {
            levels: levels
                .iter()
                .map(|files| LevelMetadata {
                    files: files.clone(),
                })
                .collect(),
        })
    }

    fn submit_merge(&self, job: MergeJob, on_complete: MergeCallback) {
        let immediate = {
            let mut state = self.state();
            state.submitted.push(job.clone());
            state.set_being_compacted(&job, true);
            match self.mode {
                CompletionMode::Manual => {
                    state.pending.push_back(PendingMerge {
                        job,
                        callback: on_complete,
                    });
                    None
                }
                CompletionMode::Immediate => {
                    let result = Self::execute(&mut state, &job);
                    Some((on_complete, result))
                }
            }
        };
        if let Some((callback, result)) = immediate {
            callback(result);
        }
    }

    fn register_flush_listener(&self, listener: Weak<dyn FlushListener>) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }
}
