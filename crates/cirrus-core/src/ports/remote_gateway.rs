//! Remote storage gateway port (driven/secondary port)
//!
//! Interface to the cloud provider: change feed, metadata lookup, and the
//! content transfer primitives the queue executes.
//!
//! ## Design Notes
//!
//! - Uses `anyhow::Result` because transport errors are adapter-specific;
//!   adapters embed [`EngineError`](crate::engine_error::EngineError)
//!   values so the engine can classify failures without knowing the
//!   transport.
//! - `list_changes(None)` performs a full enumeration (first run, or after
//!   the provider reports a stale cursor) and still yields a fresh cursor.
//! - DTOs carry raw strings; the collector maps them into validated domain
//!   types and drops entries it cannot represent.

use chrono::{DateTime, Utc};

use crate::domain::newtypes::{Cursor, MirrorPath, RemoteId};

// ============================================================================
// RemoteChange DTO
// ============================================================================

/// One entry from the provider's change feed or metadata lookup
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteChange {
    /// Provider-assigned stable identifier
    pub id: String,
    /// Path relative to the synced root, forward-slash separated.
    /// Absent for deletions when the provider no longer reports it.
    pub path: Option<String>,
    /// Display name (last path component)
    pub name: String,
    /// Content revision token; absent for directories
    pub fingerprint: Option<String>,
    /// Whether the entry was deleted (or moved to trash)
    pub is_deleted: bool,
    pub is_directory: bool,
    /// Provider-native document with no downloadable byte stream
    pub is_native_document: bool,
    pub modified: Option<DateTime<Utc>>,
    pub size: Option<u64>,
}

/// One page of the change feed plus the cursor for the next poll
#[derive(Debug, Clone)]
pub struct ChangePage {
    pub changes: Vec<RemoteChange>,
    pub next_cursor: Cursor,
    /// True when this page came from a full enumeration rather than an
    /// incremental delta
    pub full_enumeration: bool,
}

// ============================================================================
// IRemoteGateway trait
// ============================================================================

/// Port trait for the cloud storage provider
#[async_trait::async_trait]
pub trait IRemoteGateway: Send + Sync {
    /// Fetch changes since `cursor`, or enumerate everything for `None`
    ///
    /// # Errors
    /// `EngineError::StaleCursor` when the provider rejects the cursor;
    /// transport failures otherwise.
    async fn list_changes(&self, cursor: Option<&Cursor>) -> anyhow::Result<ChangePage>;

    /// Current metadata for a single item
    async fn get_metadata(&self, id: &RemoteId) -> anyhow::Result<RemoteChange>;

    /// Download the full content of an item
    async fn download(&self, id: &RemoteId) -> anyhow::Result<Vec<u8>>;

    /// Download a byte range of an item
    ///
    /// Only called when [`supports_ranges`](Self::supports_ranges) is true.
    /// May return fewer bytes than `len` at end of content.
    async fn download_range(&self, id: &RemoteId, offset: u64, len: u64)
        -> anyhow::Result<Vec<u8>>;

    /// Whether the provider serves byte-range downloads
    fn supports_ranges(&self) -> bool;

    /// Create or replace the item at `path` with `data`
    ///
    /// Parent directories are created implicitly by the provider.
    /// Returns the resulting metadata (id and new revision).
    async fn upload(&self, path: &MirrorPath, data: &[u8]) -> anyhow::Result<RemoteChange>;

    /// Create a directory at `path`
    async fn create_directory(&self, path: &MirrorPath) -> anyhow::Result<RemoteChange>;

    /// Delete the item
    async fn delete(&self, id: &RemoteId) -> anyhow::Result<()>;

    /// Move/rename the item to `new_path`
    async fn rename(&self, id: &RemoteId, new_path: &MirrorPath)
        -> anyhow::Result<RemoteChange>;
}
