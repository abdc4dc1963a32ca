//! Tracked item entity and its synchronization state machine
//!
//! An [`Item`] is one file or directory the engine mirrors. It carries the
//! last agreed baseline (the fingerprints both sides had when last in sync),
//! which is what turns two-way comparison into three-way reconciliation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::DomainError;
use super::newtypes::{Fingerprint, MirrorPath, RemoteId};

// ============================================================================
// SyncState
// ============================================================================

/// Synchronization state of a tracked item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// Both sides agree with the recorded baseline
    Synced,
    /// A local change is waiting to be pushed to the remote
    PendingPush,
    /// A remote change is waiting to be pulled to the local mirror
    PendingPull,
    /// Both sides diverged; waiting for an explicit resolution
    Conflicted,
}

impl SyncState {
    /// Stable string form used for persistence
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Synced => "synced",
            Self::PendingPush => "pending_push",
            Self::PendingPull => "pending_pull",
            Self::Conflicted => "conflicted",
        }
    }

    /// Parse the persisted string form
    ///
    /// # Errors
    /// Returns error for unknown state names
    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "synced" => Ok(Self::Synced),
            "pending_push" => Ok(Self::PendingPush),
            "pending_pull" => Ok(Self::PendingPull),
            "conflicted" => Ok(Self::Conflicted),
            other => Err(DomainError::ValidationFailed(format!(
                "Unknown sync state: {other}"
            ))),
        }
    }

    /// Whether a transfer is outstanding for this state
    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::PendingPush | Self::PendingPull)
    }
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// ItemKey
// ============================================================================

/// Reconciliation key for a tracked item
///
/// Items known to the remote are keyed by their stable [`RemoteId`]; items
/// that only exist locally (not yet uploaded) are keyed by path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ItemKey {
    Remote(RemoteId),
    Path(MirrorPath),
}

impl ItemKey {
    /// Stable token form used for persistence (`r:<id>` / `p:<path>`)
    #[must_use]
    pub fn to_token(&self) -> String {
        match self {
            Self::Remote(id) => format!("r:{id}"),
            Self::Path(path) => format!("p:{path}"),
        }
    }

    /// Parse the persisted token form
    ///
    /// # Errors
    /// Returns error if the prefix is unknown or the payload is invalid
    pub fn from_token(token: &str) -> Result<Self, DomainError> {
        match token.split_once(':') {
            Some(("r", id)) => Ok(Self::Remote(RemoteId::new(id.to_string())?)),
            Some(("p", path)) => Ok(Self::Path(MirrorPath::new(path.to_string())?)),
            _ => Err(DomainError::InvalidId(format!(
                "Unknown item key token: {token}"
            ))),
        }
    }
}

impl std::fmt::Display for ItemKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_token())
    }
}

// ============================================================================
// Item
// ============================================================================

/// A file or directory tracked by the engine
///
/// At most one item may exist per `remote_id` and at most one per
/// `local_path`; the metadata store enforces both. Directories carry no
/// content fingerprint, only presence and path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    remote_id: Option<RemoteId>,
    local_path: Option<MirrorPath>,
    local_fingerprint: Option<Fingerprint>,
    remote_fingerprint: Option<Fingerprint>,
    is_directory: bool,
    tombstoned: bool,
    sync_state: SyncState,
    last_synced: Option<DateTime<Utc>>,
}

impl Item {
    /// Create an item first seen on the local side (not yet uploaded)
    #[must_use]
    pub fn new_local(
        path: MirrorPath,
        fingerprint: Option<Fingerprint>,
        is_directory: bool,
    ) -> Self {
        Self {
            remote_id: None,
            local_path: Some(path),
            local_fingerprint: fingerprint,
            remote_fingerprint: None,
            is_directory,
            tombstoned: false,
            sync_state: SyncState::PendingPush,
            last_synced: None,
        }
    }

    /// Create an item first seen on the remote side (not yet downloaded)
    #[must_use]
    pub fn new_remote(
        remote_id: RemoteId,
        path: MirrorPath,
        fingerprint: Option<Fingerprint>,
        is_directory: bool,
    ) -> Self {
        Self {
            remote_id: Some(remote_id),
            local_path: Some(path),
            local_fingerprint: None,
            remote_fingerprint: fingerprint,
            is_directory,
            tombstoned: false,
            sync_state: SyncState::PendingPull,
            last_synced: None,
        }
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    #[must_use]
    pub fn remote_id(&self) -> Option<&RemoteId> {
        self.remote_id.as_ref()
    }

    #[must_use]
    pub fn local_path(&self) -> Option<&MirrorPath> {
        self.local_path.as_ref()
    }

    #[must_use]
    pub fn local_fingerprint(&self) -> Option<&Fingerprint> {
        self.local_fingerprint.as_ref()
    }

    #[must_use]
    pub fn remote_fingerprint(&self) -> Option<&Fingerprint> {
        self.remote_fingerprint.as_ref()
    }

    #[must_use]
    pub fn is_directory(&self) -> bool {
        self.is_directory
    }

    #[must_use]
    pub fn is_tombstoned(&self) -> bool {
        self.tombstoned
    }

    #[must_use]
    pub fn sync_state(&self) -> SyncState {
        self.sync_state
    }

    #[must_use]
    pub fn last_synced(&self) -> Option<DateTime<Utc>> {
        self.last_synced
    }

    /// Reconciliation key: remote id where known, path otherwise
    ///
    /// # Panics
    /// Never panics: an item always has a remote id or a local path.
    #[must_use]
    pub fn key(&self) -> ItemKey {
        match (&self.remote_id, &self.local_path) {
            (Some(id), _) => ItemKey::Remote(id.clone()),
            (None, Some(path)) => ItemKey::Path(path.clone()),
            (None, None) => unreachable!("item without remote id or local path"),
        }
    }

    // ------------------------------------------------------------------
    // Mutators
    // ------------------------------------------------------------------

    pub fn set_remote_id(&mut self, id: RemoteId) {
        self.remote_id = Some(id);
    }

    pub fn set_local_path(&mut self, path: MirrorPath) {
        self.local_path = Some(path);
    }

    pub fn set_local_fingerprint(&mut self, fingerprint: Option<Fingerprint>) {
        self.local_fingerprint = fingerprint;
    }

    pub fn set_remote_fingerprint(&mut self, fingerprint: Option<Fingerprint>) {
        self.remote_fingerprint = fingerprint;
    }

    pub fn set_tombstoned(&mut self, tombstoned: bool) {
        self.tombstoned = tombstoned;
    }

    // ------------------------------------------------------------------
    // State machine
    // ------------------------------------------------------------------

    /// Whether a transition to `target` is allowed
    ///
    /// `Conflicted` can only be left through [`Item::resolve_to`]; every
    /// other transition is permitted (including self-transitions).
    #[must_use]
    pub fn can_transition_to(&self, target: SyncState) -> bool {
        self.sync_state != SyncState::Conflicted || target == SyncState::Conflicted
    }

    /// Transition to a new state
    ///
    /// # Errors
    /// Returns `DomainError::InvalidStateTransition` when attempting to
    /// leave `Conflicted` without an explicit resolution.
    pub fn transition_to(&mut self, target: SyncState) -> Result<(), DomainError> {
        if !self.can_transition_to(target) {
            return Err(DomainError::InvalidStateTransition {
                from: self.sync_state.as_str().to_string(),
                to: target.as_str().to_string(),
            });
        }
        self.sync_state = target;
        Ok(())
    }

    /// Leave `Conflicted` after an explicit user resolution
    ///
    /// # Errors
    /// Returns error if the item is not conflicted
    pub fn resolve_to(&mut self, target: SyncState) -> Result<(), DomainError> {
        if self.sync_state != SyncState::Conflicted {
            return Err(DomainError::InvalidStateTransition {
                from: self.sync_state.as_str().to_string(),
                to: target.as_str().to_string(),
            });
        }
        self.sync_state = target;
        Ok(())
    }

    /// Record a completed transfer: both sides now agree
    pub fn mark_synced(&mut self, at: DateTime<Utc>) -> Result<(), DomainError> {
        self.transition_to(SyncState::Synced)?;
        self.last_synced = Some(at);
        Ok(())
    }

    /// Restore a persisted item without re-running transition checks
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn from_parts(
        remote_id: Option<RemoteId>,
        local_path: Option<MirrorPath>,
        local_fingerprint: Option<Fingerprint>,
        remote_fingerprint: Option<Fingerprint>,
        is_directory: bool,
        tombstoned: bool,
        sync_state: SyncState,
        last_synced: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            remote_id,
            local_path,
            local_fingerprint,
            remote_fingerprint,
            is_directory,
            tombstoned,
            sync_state,
            last_synced,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
