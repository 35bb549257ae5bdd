//! Boundary between the compaction policy and the storage engine it drives.
//!
//! The policy never touches storage directly. It reads per-level file metadata,
//! asks the engine to merge a set of files into a physical level, and reacts to
//! flush notifications. Everything else (read path, memtables, WAL, file format)
//! stays on the engine side of this trait.

/// Deterministic in-process engine implementing the boundary.
pub mod mem;

use std::{io, sync::Weak};

use thiserror::Error;
use ulid::Ulid;

/// Errors reported by a storage engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// I/O-class failure. A merge failing this way stops the cascade.
    #[error("engine io error: {0}")]
    Io(#[from] io::Error),
    /// The engine does not know the requested column family.
    #[error("unknown column family: {0}")]
    UnknownColumnFamily(String),
    /// Any other failure, e.g. a merge rejected because an input disappeared.
    #[error("engine operation aborted: {0}")]
    Aborted(String),
}

impl EngineError {
    /// Returns `true` for I/O-class failures.
    pub fn is_io(&self) -> bool {
        matches!(self, EngineError::Io(_))
    }
}

/// Metadata of one immutable file as reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SstFileMetadata {
    /// Engine-unique file name.
    pub name: String,
    /// Size in bytes.
    pub size: u64,
    /// Smallest user key stored in the file.
    pub smallest_key: Vec<u8>,
    /// Largest user key stored in the file.
    pub largest_key: Vec<u8>,
    /// Whether the engine itself currently has the file in a running merge.
    pub being_compacted: bool,
}

impl SstFileMetadata {
    /// File metadata that is not part of any running merge.
    pub fn new(
        name: impl Into<String>,
        size: u64,
        smallest_key: impl Into<Vec<u8>>,
        largest_key: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            name: name.into(),
            size,
            smallest_key: smallest_key.into(),
            largest_key: largest_key.into(),
            being_compacted: false,
        }
    }
}

/// Files of one physical level.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LevelMetadata {
    /// Files in engine order. For physical level 0 this is arrival order, oldest first.
    pub files: Vec<SstFileMetadata>,
}

/// Point-in-time snapshot of every physical level of a column family.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnFamilyMetadata {
    /// Physical levels; the vector index is the physical level number.
    pub levels: Vec<LevelMetadata>,
}

impl ColumnFamilyMetadata {
    /// Files of physical level `level`, empty when the level is absent.
    pub fn level_files(&self, level: usize) -> &[SstFileMetadata] {
        self.levels
            .get(level)
            .map(|level| level.files.as_slice())
            .unwrap_or(&[])
    }
}

/// A merge the policy asks the engine to run in the background.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeJob {
    /// Identifier assigned by the policy; echoed in logs.
    pub job_id: Ulid,
    /// Column family owning the inputs.
    pub column_family: String,
    /// Names of the files to merge.
    pub input_files: Vec<String>,
    /// Physical level receiving the merged output.
    pub output_level: usize,
    /// Upper bound for each output file, in bytes.
    pub output_file_size_limit: u64,
}

/// Result of a successful merge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutput {
    /// Names of the files produced by the merge.
    pub output_files: Vec<String>,
}

/// Completion callback handed to [`StorageEngine::submit_merge`].
///
/// Invoked exactly once, from whichever thread finishes the merge.
pub type MergeCallback = Box<dyn FnOnce(Result<MergeOutput, EngineError>) + Send + 'static>;

/// Information passed to flush listeners.
#[derive(Debug, Clone)]
pub struct FlushJobInfo {
    /// Column family that was flushed.
    pub column_family: String,
    /// The file the flush produced at physical level 0.
    pub file: SstFileMetadata,
}

/// Receiver of flush-completion notifications.
pub trait FlushListener: Send + Sync {
    /// Called once per completed flush.
    fn on_flush_completed(&self, info: &FlushJobInfo);
}

/// Operations the policy requires from a leveled storage engine.
pub trait StorageEngine: Send + Sync + 'static {
    /// One consistent snapshot of the per-level file metadata of `column_family`.
    ///
    /// Called under the policy lock, possibly from an async worker; keep it cheap.
    fn column_family_metadata(
        &self,
        column_family: &str,
    ) -> Result<ColumnFamilyMetadata, EngineError>;

    /// Run `job` in the background and report through `on_complete`.
    ///
    /// Must not block on the merge. The callback may run on any thread, including
    /// the caller's.
    fn submit_merge(&self, job: MergeJob, on_complete: MergeCallback);

    /// Register a listener for flush completions.
    ///
    /// The engine holds the listener weakly; dead listeners are skipped.
    fn register_flush_listener(&self, listener: Weak<dyn FlushListener>);
}
