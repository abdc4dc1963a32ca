//! Durable transfer queue operations
//!
//! A [`SyncOperation`] is one unit of remote or local work decided by the
//! reconciler. Operations are persisted before execution and survive
//! restarts; the expected fingerprints are re-validated at execution time
//! so a stale decision is discarded instead of clobbering newer content.

use serde::{Deserialize, Serialize};

use super::errors::DomainError;
use super::item::ItemKey;
use super::newtypes::{Fingerprint, MirrorPath};

// ============================================================================
// OperationKind
// ============================================================================

/// The work an operation performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Upload,
    Download,
    DeleteLocal,
    DeleteRemote,
    RenameLocal,
    RenameRemote,
    FlagConflict,
}

impl OperationKind {
    /// Stable string form used for persistence
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::Download => "download",
            Self::DeleteLocal => "delete_local",
            Self::DeleteRemote => "delete_remote",
            Self::RenameLocal => "rename_local",
            Self::RenameRemote => "rename_remote",
            Self::FlagConflict => "flag_conflict",
        }
    }

    /// Parse the persisted string form
    ///
    /// # Errors
    /// Returns error for unknown kinds
    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "upload" => Ok(Self::Upload),
            "download" => Ok(Self::Download),
            "delete_local" => Ok(Self::DeleteLocal),
            "delete_remote" => Ok(Self::DeleteRemote),
            "rename_local" => Ok(Self::RenameLocal),
            "rename_remote" => Ok(Self::RenameRemote),
            "flag_conflict" => Ok(Self::FlagConflict),
            other => Err(DomainError::ValidationFailed(format!(
                "Unknown operation kind: {other}"
            ))),
        }
    }

    /// Whether this operation mutates the remote side
    #[must_use]
    pub fn touches_remote(&self) -> bool {
        matches!(
            self,
            Self::Upload | Self::DeleteRemote | Self::RenameRemote
        )
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// OperationState
// ============================================================================

/// Execution state of a queued operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    Pending,
    Running,
    Done,
    Failed,
}

impl OperationState {
    /// Stable string form used for persistence
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    /// Parse the persisted string form
    ///
    /// # Errors
    /// Returns error for unknown states
    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            other => Err(DomainError::ValidationFailed(format!(
                "Unknown operation state: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for OperationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// SyncOperation
// ============================================================================

/// One queued transfer or metadata operation
///
/// `id` is the queue row id; zero until the operation is persisted.
/// `expected_local` / `expected_remote` are the fingerprints the decision
/// was based on and act as execution preconditions. `target_path` carries
/// the destination for renames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOperation {
    pub id: i64,
    pub kind: OperationKind,
    pub key: ItemKey,
    pub expected_local: Option<Fingerprint>,
    pub expected_remote: Option<Fingerprint>,
    pub target_path: Option<MirrorPath>,
    pub attempts: u32,
    pub state: OperationState,
}

impl SyncOperation {
    fn new(kind: OperationKind, key: ItemKey) -> Self {
        Self {
            id: 0,
            kind,
            key,
            expected_local: None,
            expected_remote: None,
            target_path: None,
            attempts: 0,
            state: OperationState::Pending,
        }
    }

    /// Push local content to the remote
    #[must_use]
    pub fn upload(key: ItemKey, expected_local: Option<Fingerprint>) -> Self {
        Self {
            expected_local,
            ..Self::new(OperationKind::Upload, key)
        }
    }

    /// Pull remote content to the local mirror
    #[must_use]
    pub fn download(key: ItemKey, expected_remote: Option<Fingerprint>) -> Self {
        Self {
            expected_remote,
            ..Self::new(OperationKind::Download, key)
        }
    }

    /// Remove the local copy of a remotely-deleted item
    #[must_use]
    pub fn delete_local(key: ItemKey) -> Self {
        Self::new(OperationKind::DeleteLocal, key)
    }

    /// Remove the remote copy of a locally-deleted item
    #[must_use]
    pub fn delete_remote(key: ItemKey, expected_remote: Option<Fingerprint>) -> Self {
        Self {
            expected_remote,
            ..Self::new(OperationKind::DeleteRemote, key)
        }
    }

    /// Apply a remote rename to the local mirror
    #[must_use]
    pub fn rename_local(key: ItemKey, target: MirrorPath) -> Self {
        Self {
            target_path: Some(target),
            ..Self::new(OperationKind::RenameLocal, key)
        }
    }

    /// Apply a local rename to the remote
    #[must_use]
    pub fn rename_remote(key: ItemKey, target: MirrorPath) -> Self {
        Self {
            target_path: Some(target),
            ..Self::new(OperationKind::RenameRemote, key)
        }
    }

    /// Record a detected conflict (applied immediately, never transferred)
    #[must_use]
    pub fn flag_conflict(key: ItemKey) -> Self {
        Self::new(OperationKind::FlagConflict, key)
    }
}

// ============================================================================
// Tests
// ============================================================================
