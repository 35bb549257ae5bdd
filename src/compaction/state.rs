use std::collections::{HashMap, HashSet};

use ulid::Ulid;

use crate::{
    compaction::{
        level::{FileState, LazyLevels},
        scheduler::{FinishOutcome, FinishedCompaction},
    },
    engine::{ColumnFamilyMetadata, SstFileMetadata},
};

/// A file this policy has handed to a merge job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TrackedFile {
    state: FileState,
    job_id: Ulid,
}

/// Policy-side state of one column family, only touched under the structure lock.
///
/// The lazy-level view is rebuilt from scratch on every evaluation; the file
/// registry outlives rebuilds so that a file marked by a dispatch stays excluded
/// until the engine stops reporting it, even if the engine's own metadata has not
/// caught up with the merge yet.
#[derive(Debug, Default)]
pub(crate) struct ColumnFamilyState {
    pub(crate) levels: Option<LazyLevels>,
    files: HashMap<String, TrackedFile>,
    stuck_jobs: HashSet<Ulid>,
}

impl ColumnFamilyState {
    /// Policy state of a file reported by the engine.
    pub(crate) fn state_of(&self, file: &SstFileMetadata) -> FileState {
        match self.files.get(&file.name) {
            Some(tracked) => tracked.state,
            None if file.being_compacted => FileState::Compacting,
            None => FileState::Idle,
        }
    }

    pub(crate) fn mark_compacting(&mut self, job_id: Ulid, names: &[String]) {
        for name in names {
            self.files.insert(
                name.clone(),
                TrackedFile {
                    state: FileState::Compacting,
                    job_id,
                },
            );
        }
    }

    /// Fold a merge outcome recorded by a completion callback into the registry.
    pub(crate) fn apply_finished(&mut self, finished: &FinishedCompaction) {
        match finished.outcome {
            FinishOutcome::Succeeded => {
                for name in &finished.input_files {
                    if let Some(tracked) = self.files.get_mut(name) {
                        if tracked.job_id == finished.job_id {
                            tracked.state = FileState::Obsolete;
                        }
                    }
                }
            }
            // inputs keep their Compacting mark until an operator recovers them
            FinishOutcome::FailedIo => {
                self.stuck_jobs.insert(finished.job_id);
            }
            FinishOutcome::Failed => {
                self.files.retain(|_, tracked| tracked.job_id != finished.job_id);
            }
        }
    }

    /// Forget files the engine no longer reports.
    pub(crate) fn prune(&mut self, meta: &ColumnFamilyMetadata) {
        let reported: HashSet<&str> = meta
            .levels
            .iter()
            .flat_map(|level| level.files.iter())
            .map(|file| file.name.as_str())
            .collect();
        self.files.retain(|name, _| reported.contains(name.as_str()));
        let files = &self.files;
        self.stuck_jobs.retain(|job_id| files.values().any(|tracked| tracked.job_id == *job_id));
    }

    /// Release every file still marked by a merge that failed with an I/O error.
    pub(crate) fn release_stuck(&mut self) -> usize {
        let stuck = std::mem::take(&mut self.stuck_jobs);
        let before = self.files.len();
        self.files.retain(|_, tracked| !stuck.contains(&tracked.job_id));
        before - self.files.len()
    }

    pub(crate) fn stuck_files(&self) -> usize {
        self.files
            .values()
            .filter(|tracked| self.stuck_jobs.contains(&tracked.job_id))
            .count()
    }
}
