#![deny(missing_docs)]
//! Lazy-leveling compaction for LSM storage engines.
//!
//! `fluidlsm` decides when and what to merge; the storage engine owns the files
//! and performs the merges. The engine is reached through the [`StorageEngine`]
//! trait: the policy reads per-column-family metadata, submits merge jobs with
//! a completion callback and listens for flushes.
//!
//! Physical levels are grouped into lazy levels. Every lazy level but the last
//! may hold up to `K` sorted runs, the last up to `Z`. When a level holds more
//! live runs than that, its idle files are merged into the next level, or deeper
//! when the batch is larger than what the next level was sized for.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use fluidlsm::{engine::mem::InMemoryEngine, FluidLsm, FluidOption};
//!
//! let engine = Arc::new(InMemoryEngine::new(10));
//! engine.create_column_family("default");
//! let policy = FluidLsm::install(Arc::clone(&engine), FluidOption::default()).unwrap();
//! engine.flush("default", 4 << 20).unwrap();
//! policy.process_pending();
//! ```

/// Lazy-level view, threshold checks and merge dispatch.
pub mod compaction;
/// Boundary to the storage engine plus an in-memory implementation.
pub mod engine;
/// Spawning abstraction for background work.
pub mod executor;
mod fluid;
mod logging;
/// Policy configuration.
pub mod option;

#[cfg(test)]
mod tests_internal;

pub use crate::{
    compaction::{
        level::{FileDescriptor, FileState, LazyLevel, LazyLevels, Run},
        metrics::CompactionMetricsSnapshot,
        picker::{compaction_target_level, origin_capacity},
        scheduler::ScheduledCompaction,
        trigger::CompactionWorker,
        CompactionError,
    },
    engine::{
        ColumnFamilyMetadata, EngineError, FlushJobInfo, FlushListener, LevelMetadata,
        MergeCallback, MergeJob, MergeOutput, SstFileMetadata, StorageEngine,
    },
    executor::Executor,
    fluid::FluidLsm,
    option::FluidOption,
};
