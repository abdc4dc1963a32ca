//! Cirrus Sync - Bidirectional synchronization engine
//!
//! Provides:
//! - Local change detection via filesystem watching with debounce
//! - Remote change detection via cursor-based polling
//! - Three-way reconciliation against the stored baseline
//! - A durable, retrying transfer queue
//!
//! ## Modules
//!
//! - [`watcher`] - notify-based file watching and the debounced queue
//! - [`filesystem`] - Local mirror adapter (atomic writes, SHA-256 fingerprints)
//! - [`collector`] - Merges local and remote changes into settled batches
//! - [`reconciler`] - Pure three-way decision core
//! - [`queue`] - Transfer queue executor (bounded workers, backoff, resume)
//! - [`resolve`] - Conflict resolution executor
//! - [`engine`] - The `SyncEngine` façade

pub mod collector;
pub mod engine;
pub mod filesystem;
pub mod queue;
pub mod reconciler;
pub mod resolve;
pub mod watcher;

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur during synchronization operations
#[derive(Debug, Error)]
pub enum SyncError {
    /// An I/O error occurred during file operations
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// The path lies outside the mirror root
    #[error("Path outside mirror root: {0}")]
    OutsideRoot(PathBuf),

    /// The specified path does not exist
    #[error("Path not found: {0}")]
    PathNotFound(PathBuf),

    /// A staged download would be written out of order
    #[error("Staging offset mismatch for {path}: expected {expected}, got {actual}")]
    StagingOffsetMismatch {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    /// A domain-level error propagated from cirrus-core
    #[error("Domain error: {0}")]
    DomainError(#[from] cirrus_core::domain::errors::DomainError),
}
