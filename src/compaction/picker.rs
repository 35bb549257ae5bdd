//! Threshold checks and the capacity model deciding where a merge result goes.

use crate::{
    compaction::level::{FileDescriptor, LazyLevel, LazyLevels},
    option::FluidOption,
};

/// Merge candidate selected from one lazy level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LevelPick {
    pub(crate) origin_level: usize,
    pub(crate) target_level: usize,
    pub(crate) input_files: Vec<String>,
    pub(crate) input_bytes: u64,
}

/// Live-run threshold of lazy level `level` when `largest` is the deepest occupied one.
pub(crate) fn run_threshold(level: usize, largest: usize, option: &FluidOption) -> usize {
    if level == largest {
        option.larger_lvl_runs_count
    } else {
        option.smaller_lvl_runs_count
    }
}

/// `true` once the live runs of `level` strictly exceed its threshold.
pub(crate) fn exceeds_threshold(
    level: &LazyLevel,
    index: usize,
    largest: usize,
    option: &FluidOption,
) -> bool {
    level.live_runs() > run_threshold(index, largest, option)
}

/// Bytes lazy level `origin` may hold before a merge out of it spills one level down.
///
/// `W * T^(o+1) * (T-1) / T`, evaluated as `W * T^o * (T-1)` so it stays exact.
pub fn origin_capacity(origin: usize, option: &FluidOption) -> u64 {
    let ratio = option.size_ratio as u64;
    let exponent = u32::try_from(origin).unwrap_or(u32::MAX);
    option
        .write_buffer_size
        .saturating_mul(ratio.saturating_pow(exponent))
        .saturating_mul(ratio.saturating_sub(1))
}

/// Lazy level receiving a merge of `batch_size` bytes out of `origin`.
pub fn compaction_target_level(origin: usize, batch_size: u64, option: &FluidOption) -> usize {
    if batch_size > origin_capacity(origin, option) {
        origin + 1
    } else {
        origin
    }
}

/// Select every idle file of lazy level `index` if it is over its threshold.
pub(crate) fn pick_level(
    levels: &LazyLevels,
    index: usize,
    largest: usize,
    option: &FluidOption,
) -> Option<LevelPick> {
    let level = levels.level(index)?;
    if !exceeds_threshold(level, index, largest, option) {
        return None;
    }
    let inputs: Vec<&FileDescriptor> = level.idle_files().collect();
    if inputs.is_empty() {
        return None;
    }
    let input_bytes = inputs.iter().map(|file| file.size()).sum();
    Some(LevelPick {
        origin_level: index,
        target_level: compaction_target_level(index, input_bytes, option),
        input_files: inputs.iter().map(|file| file.name().to_string()).collect(),
        input_bytes,
    })
}
