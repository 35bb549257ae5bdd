//! Logical lazy-level view rebuilt from physical engine metadata.
//!
//! Physical level 0 and 1 are folded into lazy level 0: every level-0 file is its
//! own run, level 1 is one run, and empty placeholder runs pad the level up to K
//! runs. Physical level `p >= 2` is one run of lazy level `ceil((p - 1) / (K + 1))`,
//! so lazy level `t >= 1` owns the reserved physical range
//! `(t - 1) * (K + 1) + 2 ..= t * (K + 1) + 1`, one run per slot, oldest slot last.

use std::{collections::HashSet, fmt};

use crate::{
    compaction::CompactionError,
    engine::{ColumnFamilyMetadata, SstFileMetadata},
    option::FluidOption,
};

/// Lifecycle of a file as seen by the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileState {
    /// Eligible as merge input; counts towards live runs.
    Idle,
    /// Selected as input of a merge that has not been confirmed yet.
    Compacting,
    /// Consumed by a finished merge; waiting for the engine to stop reporting it.
    Obsolete,
}

/// One engine file placed in the lazy-level view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    name: String,
    size: u64,
    min_key: Vec<u8>,
    max_key: Vec<u8>,
    physical_level: usize,
    state: FileState,
}

impl FileDescriptor {
    pub(crate) fn new(meta: &SstFileMetadata, physical_level: usize, state: FileState) -> Self {
        Self {
            name: meta.name.clone(),
            size: meta.size,
            min_key: meta.smallest_key.clone(),
            max_key: meta.largest_key.clone(),
            physical_level,
            state,
        }
    }

    /// Engine file name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Smallest key.
    pub fn min_key(&self) -> &[u8] {
        &self.min_key
    }

    /// Largest key.
    pub fn max_key(&self) -> &[u8] {
        &self.max_key
    }

    /// Physical level the file was reported at.
    pub fn physical_level(&self) -> usize {
        self.physical_level
    }

    /// Current policy state.
    pub fn state(&self) -> FileState {
        self.state
    }

    /// `true` unless the file is [`FileState::Idle`].
    pub fn is_being_compacted(&self) -> bool {
        self.state != FileState::Idle
    }
}

/// A sorted run: files that together form one non-overlapping key space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Run {
    physical_level: usize,
    files: Vec<FileDescriptor>,
}

impl Run {
    fn new(physical_level: usize, files: Vec<FileDescriptor>) -> Self {
        Self {
            physical_level,
            files,
        }
    }

    fn placeholder() -> Self {
        Self::new(0, Vec::new())
    }

    /// Physical level the run was read from.
    pub fn physical_level(&self) -> usize {
        self.physical_level
    }

    /// Files of the run.
    pub fn files(&self) -> &[FileDescriptor] {
        &self.files
    }

    /// `true` for placeholders and empty physical levels.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Non-empty and no file is being compacted.
    pub fn is_live(&self) -> bool {
        !self.files.is_empty() && self.files.iter().all(|file| !file.is_being_compacted())
    }

    /// Total size of the run's files.
    pub fn size_in_bytes(&self) -> u64 {
        self.files.iter().map(FileDescriptor::size).sum()
    }
}

/// Runs that together emulate one level of a size-ratio-T hierarchy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LazyLevel {
    runs: Vec<Run>,
}

impl LazyLevel {
    /// Runs, oldest first for levels above zero.
    pub fn runs(&self) -> &[Run] {
        &self.runs
    }

    /// Number of live runs.
    pub fn live_runs(&self) -> usize {
        self.runs.iter().filter(|run| run.is_live()).count()
    }

    /// Total size of every file in the level, whatever its state.
    pub fn size_in_bytes(&self) -> u64 {
        self.runs.iter().map(Run::size_in_bytes).sum()
    }

    /// `true` if at least one run holds a file.
    pub fn is_occupied(&self) -> bool {
        self.runs.iter().any(|run| !run.is_empty())
    }

    /// Every idle file across all runs, in run order.
    pub fn idle_files(&self) -> impl Iterator<Item = &FileDescriptor> {
        self.runs
            .iter()
            .flat_map(|run| run.files.iter())
            .filter(|file| file.state == FileState::Idle)
    }

    fn files_mut(&mut self) -> impl Iterator<Item = &mut FileDescriptor> {
        self.runs.iter_mut().flat_map(|run| run.files.iter_mut())
    }
}

/// The complete lazy-level view of one column family.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LazyLevels {
    levels: Vec<LazyLevel>,
}

impl LazyLevels {
    /// Build the view from one metadata snapshot.
    ///
    /// `state_of` resolves the policy state of each reported file. Nothing is
    /// published on error; callers keep whatever view they had before.
    pub(crate) fn build<F>(
        meta: &ColumnFamilyMetadata,
        option: &FluidOption,
        mut state_of: F,
    ) -> Result<Self, CompactionError>
    where
        F: FnMut(&SstFileMetadata) -> FileState,
    {
        let num_levels = option.num_levels;
        if let Some(level) = meta
            .levels
            .iter()
            .enumerate()
            .skip(num_levels)
            .find_map(|(level, files)| (!files.files.is_empty()).then_some(level))
        {
            return Err(CompactionError::LevelOutOfRange { level, num_levels });
        }

        let mut describe = |files: &[SstFileMetadata], physical_level: usize| {
            files
                .iter()
                .map(|file| FileDescriptor::new(file, physical_level, state_of(file)))
                .collect::<Vec<_>>()
        };

        let mut levels = vec![LazyLevel::default(); num_levels];
        let level0 = meta.level_files(0);
        let level1 = meta.level_files(1);
        let real_runs = level0.len() + usize::from(!level1.is_empty());

        let lazy0 = &mut levels[0].runs;
        for _ in real_runs..option.smaller_lvl_runs_count {
            lazy0.push(Run::placeholder());
        }
        for file in level0 {
            lazy0.push(Run::new(0, describe(std::slice::from_ref(file), 0)));
        }
        lazy0.push(Run::new(1, describe(level1, 1)));

        for (physical_level, level) in meta.levels.iter().enumerate().take(num_levels).skip(2) {
            let run = Run::new(physical_level, describe(&level.files, physical_level));
            levels[option.lazy_level_of(physical_level)].runs.push(run);
        }

        Ok(Self { levels })
    }

    /// Lazy levels, index 0 first.
    pub fn levels(&self) -> &[LazyLevel] {
        &self.levels
    }

    /// Lazy level `level`, if configured.
    pub fn level(&self, level: usize) -> Option<&LazyLevel> {
        self.levels.get(level)
    }

    /// Number of lazy levels.
    pub fn len(&self) -> usize {
        self.levels.len()
    }

    /// `true` if no lazy level exists.
    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    /// Deepest lazy level holding at least one file, 0 when everything is empty.
    pub fn largest_occupied_level(&self) -> usize {
        self.levels
            .iter()
            .rposition(LazyLevel::is_occupied)
            .unwrap_or(0)
    }

    /// Move the named files of `level` to `state`, returning how many matched.
    pub(crate) fn mark_files(&mut self, level: usize, names: &[String], state: FileState) -> usize {
        let names: HashSet<&str> = names.iter().map(String::as_str).collect();
        let Some(level) = self.levels.get_mut(level) else {
            return 0;
        };
        let mut marked = 0;
        for file in level.files_mut() {
            if names.contains(file.name.as_str()) {
                file.state = state;
                marked += 1;
            }
        }
        marked
    }
}

impl fmt::Display for LazyLevels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, level) in self
            .levels
            .iter()
            .enumerate()
            .take(self.largest_occupied_level() + 1)
        {
            writeln!(f, "lvl: {index}")?;
            for (position, run) in level.runs.iter().enumerate() {
                if run.is_empty() {
                    continue;
                }
                writeln!(
                    f,
                    "\t run: {position}   (physical: {})",
                    run.physical_level
                )?;
                for file in &run.files {
                    write!(
                        f,
                        "\t\t {}\t {}-{} \t {}",
                        file.size,
                        String::from_utf8_lossy(&file.min_key),
                        String::from_utf8_lossy(&file.max_key),
                        file.name
                    )?;
                    match file.state {
                        FileState::Idle => writeln!(f)?,
                        FileState::Compacting => writeln!(f, " \t being compacted")?,
                        FileState::Obsolete => writeln!(f, " \t obsolete")?,
                    }
                }
            }
        }
        Ok(())
    }
}
