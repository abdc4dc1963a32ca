//! Local filesystem port (driven/secondary port)
//!
//! Interface for the local mirror directory: content I/O, fingerprinting,
//! enumeration, and the staging primitives used for resumable downloads.
//!
//! ## Design Notes
//!
//! - Uses `anyhow::Result` because filesystem errors are adapter-specific.
//! - All paths are [`MirrorPath`]s relative to the mirror root; the adapter
//!   owns the root and refuses to step outside it.
//! - Writes are atomic: content lands in a staging file and is renamed into
//!   place, so a crash never leaves a half-written visible file.
//! - Staging files persist across restarts, which is what lets interrupted
//!   chunked downloads resume instead of starting over.

use chrono::{DateTime, Utc};

use crate::domain::newtypes::{Fingerprint, MirrorPath};

// ============================================================================
// FsEntry
// ============================================================================

/// Snapshot of one entry in the mirror directory
#[derive(Debug, Clone, PartialEq)]
pub struct FsEntry {
    pub path: MirrorPath,
    /// Content fingerprint; `None` for directories
    pub fingerprint: Option<Fingerprint>,
    pub is_directory: bool,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

// ============================================================================
// ILocalFileSystem trait
// ============================================================================

/// Port trait for local mirror operations
#[async_trait::async_trait]
pub trait ILocalFileSystem: Send + Sync {
    /// Read the entire contents of a file
    async fn read(&self, path: &MirrorPath) -> anyhow::Result<Vec<u8>>;

    /// Atomically replace the file at `path` with `data`
    ///
    /// Parent directories are created as needed.
    async fn write_atomic(&self, path: &MirrorPath, data: &[u8]) -> anyhow::Result<()>;

    /// Append `data` to the staging file for `path` at `offset`
    ///
    /// # Errors
    /// Returns an error if `offset` does not equal the staging file's
    /// current length (a gap would corrupt the resumed download).
    async fn write_staged(&self, path: &MirrorPath, offset: u64, data: &[u8])
        -> anyhow::Result<()>;

    /// Current length of the staging file for `path` (0 if absent)
    async fn staged_len(&self, path: &MirrorPath) -> anyhow::Result<u64>;

    /// Fingerprint of the staging file for `path`
    async fn staged_fingerprint(&self, path: &MirrorPath) -> anyhow::Result<Fingerprint>;

    /// Atomically move the staging file into place at `path`
    async fn commit_staged(&self, path: &MirrorPath) -> anyhow::Result<()>;

    /// Remove the staging file for `path`, if any
    async fn discard_staged(&self, path: &MirrorPath) -> anyhow::Result<()>;

    /// Delete a file, or a directory and its contents
    async fn delete(&self, path: &MirrorPath) -> anyhow::Result<()>;

    /// Rename an entry within the mirror root
    ///
    /// Parent directories of `to` are created as needed.
    async fn rename(&self, from: &MirrorPath, to: &MirrorPath) -> anyhow::Result<()>;

    /// Create a directory and all missing parents
    async fn create_dir_all(&self, path: &MirrorPath) -> anyhow::Result<()>;

    /// Compute the content fingerprint of a file
    async fn fingerprint(&self, path: &MirrorPath) -> anyhow::Result<Fingerprint>;

    /// Stat one entry; `None` if it does not exist
    async fn entry(&self, path: &MirrorPath) -> anyhow::Result<Option<FsEntry>>;

    /// Recursively enumerate every entry under the mirror root
    ///
    /// Staging files are skipped. Order is unspecified.
    async fn enumerate(&self) -> anyhow::Result<Vec<FsEntry>>;
}
