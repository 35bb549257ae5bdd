use crate::compaction::CompactionError;

/// Tuning knobs of the lazy-leveling policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FluidOption {
    pub(crate) size_ratio: usize,
    pub(crate) smaller_lvl_runs_count: usize,
    pub(crate) larger_lvl_runs_count: usize,
    pub(crate) file_size: u64,
    pub(crate) write_buffer_size: u64,
    pub(crate) concurrency_cap: usize,
    pub(crate) num_levels: usize,
    pub(crate) trigger_queue_capacity: usize,
    pub(crate) debug: bool,
}

impl Default for FluidOption {
    fn default() -> Self {
        // 128 pages of 64 entries of 64 bytes
        let write_buffer_size = 128 * 64 * 64;
        FluidOption {
            size_ratio: 4,
            smaller_lvl_runs_count: 3,
            larger_lvl_runs_count: 1,
            file_size: write_buffer_size,
            write_buffer_size,
            concurrency_cap: 1,
            num_levels: 10,
            trigger_queue_capacity: 64,
            debug: false,
        }
    }
}

impl FluidOption {
    /// Ratio T between the capacities of successive lazy levels.
    pub fn size_ratio(self, size_ratio: usize) -> Self {
        FluidOption { size_ratio, ..self }
    }

    /// Live-run threshold K of every lazy level below the largest occupied one.
    pub fn smaller_lvl_runs_count(self, smaller_lvl_runs_count: usize) -> Self {
        FluidOption {
            smaller_lvl_runs_count,
            ..self
        }
    }

    /// Live-run threshold Z of the largest occupied lazy level.
    pub fn larger_lvl_runs_count(self, larger_lvl_runs_count: usize) -> Self {
        FluidOption {
            larger_lvl_runs_count,
            ..self
        }
    }

    /// Output size limit handed to every merge job.
    pub fn file_size(self, file_size: u64) -> Self {
        FluidOption { file_size, ..self }
    }

    /// Write-buffer size the capacity model is based on.
    pub fn write_buffer_size(self, write_buffer_size: u64) -> Self {
        FluidOption {
            write_buffer_size,
            ..self
        }
    }

    /// Maximum number of merge jobs in flight at once.
    pub fn concurrency_cap(self, concurrency_cap: usize) -> Self {
        FluidOption {
            concurrency_cap,
            ..self
        }
    }

    /// Number of physical levels the engine is configured with.
    pub fn num_levels(self, num_levels: usize) -> Self {
        FluidOption { num_levels, ..self }
    }

    /// Bound of the re-evaluation queue fed by merge completions.
    pub fn trigger_queue_capacity(self, trigger_queue_capacity: usize) -> Self {
        FluidOption {
            trigger_queue_capacity,
            ..self
        }
    }

    /// Dump the lazy-level structure on every evaluation.
    pub fn debug(self, debug: bool) -> Self {
        FluidOption { debug, ..self }
    }
}

impl FluidOption {
    /// Size ratio T.
    pub fn get_size_ratio(&self) -> usize {
        self.size_ratio
    }

    /// Threshold K.
    pub fn get_smaller_lvl_runs_count(&self) -> usize {
        self.smaller_lvl_runs_count
    }

    /// Threshold Z.
    pub fn get_larger_lvl_runs_count(&self) -> usize {
        self.larger_lvl_runs_count
    }

    /// Number of physical levels.
    pub fn get_num_levels(&self) -> usize {
        self.num_levels
    }

    /// Output size limit of merge jobs.
    pub fn get_file_size(&self) -> u64 {
        self.file_size
    }

    /// Write-buffer size W.
    pub fn get_write_buffer_size(&self) -> u64 {
        self.write_buffer_size
    }

    /// Maximum number of merges in flight.
    pub fn get_concurrency_cap(&self) -> usize {
        self.concurrency_cap
    }

    /// Bound of the re-evaluation queue.
    pub fn get_trigger_queue_capacity(&self) -> usize {
        self.trigger_queue_capacity
    }

    /// Whether every evaluation dumps the structure.
    pub fn get_debug(&self) -> bool {
        self.debug
    }

    pub(crate) fn validate(&self) -> Result<(), CompactionError> {
        if self.size_ratio < 2 {
            return Err(CompactionError::InvalidOption("size_ratio must be at least 2"));
        }
        if self.smaller_lvl_runs_count == 0 {
            return Err(CompactionError::InvalidOption(
                "smaller_lvl_runs_count must be positive",
            ));
        }
        if self.larger_lvl_runs_count == 0 {
            return Err(CompactionError::InvalidOption(
                "larger_lvl_runs_count must be positive",
            ));
        }
        if self.concurrency_cap == 0 {
            return Err(CompactionError::InvalidOption(
                "concurrency_cap must be positive",
            ));
        }
        if self.num_levels < 2 {
            return Err(CompactionError::InvalidOption("num_levels must be at least 2"));
        }
        if self.trigger_queue_capacity == 0 {
            return Err(CompactionError::InvalidOption(
                "trigger_queue_capacity must be positive",
            ));
        }
        Ok(())
    }

    /// Physical level where the reserved range of lazy level `lazy_level` ends.
    pub(crate) fn deepest_slot(&self, lazy_level: usize) -> usize {
        1 + lazy_level * (self.smaller_lvl_runs_count + 1)
    }

    /// Lazy level a physical level at depth two or more belongs to.
    pub(crate) fn lazy_level_of(&self, physical_level: usize) -> usize {
        let width = self.smaller_lvl_runs_count + 1;
        (physical_level - 1).div_ceil(width)
    }
}
