//! Conflict records and resolution choices
//!
//! A conflict is recorded whenever both sides of the mirror diverged from
//! the shared baseline in incompatible ways. Conflicted items are frozen
//! (no transfers) until the user picks a [`Resolution`].

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::errors::DomainError;
use super::item::ItemKey;
use super::newtypes::{ConflictId, Fingerprint, MirrorPath};

// ============================================================================
// ConflictReason
// ============================================================================

/// Why the item was flagged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictReason {
    /// Both sides edited the content since the last baseline
    BothEdited,
    /// One side edited while the other deleted
    EditDelete,
    /// A remote item maps to a local path already owned by another item
    NameCollision,
}

impl ConflictReason {
    /// Stable string form used for persistence
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BothEdited => "both_edited",
            Self::EditDelete => "edit_delete",
            Self::NameCollision => "name_collision",
        }
    }

    /// Parse the persisted string form
    ///
    /// # Errors
    /// Returns error for unknown reasons
    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "both_edited" => Ok(Self::BothEdited),
            "edit_delete" => Ok(Self::EditDelete),
            "name_collision" => Ok(Self::NameCollision),
            other => Err(DomainError::ValidationFailed(format!(
                "Unknown conflict reason: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Resolution
// ============================================================================

/// User's choice for resolving a conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Keep the local version; push it to the remote
    KeepLocal,
    /// Keep the remote version; pull it over the local copy
    KeepRemote,
    /// Keep both: the local copy is renamed to a conflicted-copy name
    KeepBothRenamed,
}

impl Resolution {
    /// Stable string form used for persistence
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::KeepLocal => "keep_local",
            Self::KeepRemote => "keep_remote",
            Self::KeepBothRenamed => "keep_both_renamed",
        }
    }

    /// Parse the persisted string form
    ///
    /// # Errors
    /// Returns error for unknown resolutions
    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "keep_local" => Ok(Self::KeepLocal),
            "keep_remote" => Ok(Self::KeepRemote),
            "keep_both_renamed" => Ok(Self::KeepBothRenamed),
            other => Err(DomainError::ValidationFailed(format!(
                "Unknown resolution: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Conflict
// ============================================================================

/// One side's version at the moment the conflict was detected
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct VersionInfo {
    pub fingerprint: Option<Fingerprint>,
    pub modified_at: Option<DateTime<Utc>>,
}

/// A recorded divergence awaiting user resolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub id: ConflictId,
    pub key: ItemKey,
    pub path: Option<MirrorPath>,
    pub reason: ConflictReason,
    pub detected_at: DateTime<Utc>,
    pub local: VersionInfo,
    pub remote: VersionInfo,
    pub resolution: Option<Resolution>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Conflict {
    /// Record a newly-detected conflict
    #[must_use]
    pub fn new(
        key: ItemKey,
        path: Option<MirrorPath>,
        reason: ConflictReason,
        local: VersionInfo,
        remote: VersionInfo,
    ) -> Self {
        Self {
            id: ConflictId::new(),
            key,
            path,
            reason,
            detected_at: Utc::now(),
            local,
            remote,
            resolution: None,
            resolved_at: None,
        }
    }

    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }

    /// Mark the conflict resolved with the given choice
    pub fn resolve(&mut self, resolution: Resolution, at: DateTime<Utc>) {
        self.resolution = Some(resolution);
        self.resolved_at = Some(at);
    }
}

// ============================================================================
// Conflicted-copy naming
// ============================================================================

/// Build the conflicted-copy name for a path
///
/// `report.txt` becomes `report (conflicted copy 2026-08-23 1a2b3c4d).txt`;
/// extensionless names get the marker appended. The tag keeps repeated
/// conflicts on the same day from colliding.
///
/// # Errors
/// Returns error if the resulting name is not a valid path component
pub fn conflict_copy_path(
    path: &MirrorPath,
    date: NaiveDate,
    tag: &str,
) -> Result<MirrorPath, DomainError> {
    let name = path.file_name();
    let marker = format!("(conflicted copy {} {tag})", date.format("%Y-%m-%d"));

    let new_name = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem} {marker}.{ext}"),
        _ => format!("{name} {marker}"),
    };

    path.with_file_name(&new_name)
}

/// Short random tag for conflicted-copy names
#[must_use]
pub fn conflict_copy_tag() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

// ============================================================================
// Tests
// ============================================================================
