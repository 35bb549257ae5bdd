use thiserror::Error;

use crate::engine::EngineError;

/// Failures surfaced by a policy evaluation.
///
/// Merge-job failures never appear here: they are reported to the completion
/// callback, logged, and folded into the file registry by the next evaluation.
#[derive(Debug, Error)]
pub enum CompactionError {
    /// The engine could not produce level metadata for the column family.
    #[error("compaction metadata error: {0}")]
    Metadata(#[from] EngineError),
    /// The engine reported a physical level the policy was not configured for.
    #[error("physical level {level} is outside the configured {num_levels} levels")]
    LevelOutOfRange {
        /// Offending physical level.
        level: usize,
        /// Configured number of physical levels.
        num_levels: usize,
    },
    /// A configuration value failed validation.
    #[error("invalid compaction option: {0}")]
    InvalidOption(&'static str),
    /// A policy lock was poisoned by a panicking holder.
    #[error("compaction state lock poisoned")]
    Poisoned,
}
