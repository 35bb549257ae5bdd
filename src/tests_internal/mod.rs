#![cfg(test)]

use std::sync::Arc;

use crate::{
    compaction::level::LazyLevels,
    engine::mem::{CompletionMode, InMemoryEngine},
    fluid::FluidLsm,
    option::FluidOption,
};

pub mod failure_e2e;
pub mod lazy_leveling_e2e;

pub(crate) const CF: &str = "default";

/// T=4, W=1000, K=2, Z=1 over eight physical levels: lazy 1 owns physical 2..=4
/// and lazy 2 owns 5..=7.
pub(crate) fn option() -> FluidOption {
    FluidOption::default()
        .size_ratio(4)
        .write_buffer_size(1000)
        .file_size(1 << 20)
        .smaller_lvl_runs_count(2)
        .larger_lvl_runs_count(1)
        .num_levels(8)
}

pub(crate) fn setup(
    option: FluidOption,
    mode: CompletionMode,
) -> (Arc<InMemoryEngine>, Arc<FluidLsm<InMemoryEngine>>) {
    let engine = Arc::new(InMemoryEngine::with_completion(option.num_levels, mode));
    engine.create_column_family(CF);
    let policy = FluidLsm::install(Arc::clone(&engine), option).expect("install");
    (engine, policy)
}

pub(crate) fn live_runs(levels: &LazyLevels, level: usize) -> usize {
    levels.level(level).map(|level| level.live_runs()).unwrap_or_default()
}

/// Every lazy level is within its threshold.
pub(crate) fn assert_converged(levels: &LazyLevels, option: &FluidOption) {
    let largest = levels.largest_occupied_level();
    for index in 0..=largest {
        let threshold = if index == largest {
            option.get_larger_lvl_runs_count()
        } else {
            option.get_smaller_lvl_runs_count()
        };
        assert!(
            live_runs(levels, index) <= threshold,
            "lazy level {index} has {} live runs, threshold {threshold}\n{levels}",
            live_runs(levels, index)
        );
    }
}
