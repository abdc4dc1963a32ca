//! Change events flowing from both sides of the mirror
//!
//! The change collector normalizes raw watcher notifications and remote
//! change pages into [`ChangeEvent`]s. Events are immutable once emitted;
//! coalescing happens in the collector, never by mutating an event.

use serde::{Deserialize, Serialize};

use super::item::ItemKey;
use super::newtypes::{Fingerprint, MirrorPath, RemoteId};

/// Which side of the mirror produced an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Local,
    Remote,
}

/// What happened to the item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
    Renamed,
}

/// One observed change on either side of the mirror
///
/// `path` is the item's path after the change (absent for deletions when
/// only the key is known); `old_path` is set for renames only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub origin: Origin,
    pub kind: ChangeKind,
    pub key: ItemKey,
    pub path: Option<MirrorPath>,
    pub old_path: Option<MirrorPath>,
    pub fingerprint: Option<Fingerprint>,
    pub is_directory: bool,
}

impl ChangeEvent {
    /// A file or directory appeared locally
    #[must_use]
    pub fn local_created(
        path: MirrorPath,
        fingerprint: Option<Fingerprint>,
        is_directory: bool,
    ) -> Self {
        Self {
            origin: Origin::Local,
            kind: ChangeKind::Created,
            key: ItemKey::Path(path.clone()),
            path: Some(path),
            old_path: None,
            fingerprint,
            is_directory,
        }
    }

    /// A local file's content changed
    #[must_use]
    pub fn local_modified(path: MirrorPath, fingerprint: Option<Fingerprint>) -> Self {
        Self {
            origin: Origin::Local,
            kind: ChangeKind::Modified,
            key: ItemKey::Path(path.clone()),
            path: Some(path),
            old_path: None,
            fingerprint,
            is_directory: false,
        }
    }

    /// A local file or directory disappeared
    #[must_use]
    pub fn local_deleted(path: MirrorPath, is_directory: bool) -> Self {
        Self {
            origin: Origin::Local,
            kind: ChangeKind::Deleted,
            key: ItemKey::Path(path.clone()),
            path: Some(path),
            old_path: None,
            fingerprint: None,
            is_directory,
        }
    }

    /// A local file or directory moved within the mirror root
    #[must_use]
    pub fn local_renamed(
        from: MirrorPath,
        to: MirrorPath,
        fingerprint: Option<Fingerprint>,
        is_directory: bool,
    ) -> Self {
        Self {
            origin: Origin::Local,
            kind: ChangeKind::Renamed,
            key: ItemKey::Path(from.clone()),
            path: Some(to),
            old_path: Some(from),
            fingerprint,
            is_directory,
        }
    }

    /// A change reported by the remote change feed
    #[must_use]
    pub fn remote(
        kind: ChangeKind,
        remote_id: RemoteId,
        path: Option<MirrorPath>,
        fingerprint: Option<Fingerprint>,
        is_directory: bool,
    ) -> Self {
        Self {
            origin: Origin::Remote,
            kind,
            key: ItemKey::Remote(remote_id),
            path,
            old_path: None,
            fingerprint,
            is_directory,
        }
    }

    /// The path the event applies to after it took effect
    #[must_use]
    pub fn effective_path(&self) -> Option<&MirrorPath> {
        self.path.as_ref()
    }

    #[must_use]
    pub fn is_deletion(&self) -> bool {
        self.kind == ChangeKind::Deleted
    }
}
