//! Lazy-leveling compaction policy.
//!
//! The policy reacts to flushes: it rebuilds a logical view of lazy levels from
//! the engine's physical levels, checks each lazy level against its live-run
//! threshold, and hands over-full levels to the engine as background merges. Merge
//! completions post a re-evaluation request so that one flush can cascade through
//! several levels.

/// Policy errors.
mod error;
/// Lazy-level view of the engine's physical levels.
pub mod level;
/// Compaction observability counters.
pub mod metrics;
/// Threshold checks and the capacity model.
pub mod picker;
/// Merge dispatch under the concurrency cap.
pub mod scheduler;
/// Per-column-family file registry.
mod state;
/// Re-evaluation queue and worker handle.
pub mod trigger;

pub use error::CompactionError;
pub(crate) use state::ColumnFamilyState;
