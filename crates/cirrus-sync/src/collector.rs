//! Change collector
//!
//! Normalizes both inputs of the reconciler:
//!
//! - Raw watcher events are debounced, checked for write stability, and
//!   enriched with fingerprints before they become [`ChangeEvent`]s.
//! - Remote change pages are fetched with the stored cursor, filtered, and
//!   mapped into [`ChangeEvent`]s. A cursor the provider no longer accepts
//!   triggers a full re-enumeration, flagged so the engine can log the
//!   degraded poll.
//!
//! The collector never touches the metadata store; it only observes.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use cirrus_core::domain::{ChangeEvent, ChangeKind, Cursor, Fingerprint, MirrorPath, RemoteId};
use cirrus_core::engine_error::{self, EngineError};
use cirrus_core::ports::{ChangePage, ILocalFileSystem, IRemoteGateway, RemoteChange};
use tracing::{debug, info, warn};

use crate::filesystem::is_staging_name;
use crate::watcher::{is_file_stable, DebouncedChangeQueue, FsEvent};

/// Interval between the two size reads of the write-stability check
const STABILITY_CHECK_MS: u64 = 100;

// ============================================================================
// PollBackoff
// ============================================================================

/// Adaptive interval between remote polls
///
/// Quiet polls stretch the interval by the golden ratio up to a ceiling;
/// any activity (or a push signal from the engine) resets it to the base.
#[derive(Debug, Clone)]
pub struct PollBackoff {
    base: Duration,
    cap: Duration,
    current: Duration,
}

impl PollBackoff {
    const GROWTH: f64 = 1.618;

    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            current: base,
        }
    }

    /// The interval to wait before the next poll
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Record a poll that returned no changes; stretches the interval
    pub fn idle(&mut self) {
        let stretched = self.current.mul_f64(Self::GROWTH);
        self.current = stretched.min(self.cap);
    }

    /// Record activity; snaps the interval back to the base
    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

impl Default for PollBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(60))
    }
}

// ============================================================================
// RemoteBatch
// ============================================================================

/// Result of one remote poll
#[derive(Debug, Clone)]
pub struct RemoteBatch {
    pub changes: Vec<ChangeEvent>,
    pub next_cursor: Cursor,
    /// True when the page came from a full enumeration
    pub full_enumeration: bool,
    /// True when the stored cursor was rejected and the poll fell back to
    /// a full enumeration
    pub degraded: bool,
}

// ============================================================================
// ChangeCollector
// ============================================================================

/// Collects and normalizes changes from both sides of the mirror
pub struct ChangeCollector {
    root: PathBuf,
    fs: Arc<dyn ILocalFileSystem>,
    gateway: Arc<dyn IRemoteGateway>,
    queue: DebouncedChangeQueue,
}

impl ChangeCollector {
    pub fn new(
        root: impl Into<PathBuf>,
        fs: Arc<dyn ILocalFileSystem>,
        gateway: Arc<dyn IRemoteGateway>,
        debounce_delay: Duration,
    ) -> Self {
        Self {
            root: root.into(),
            fs,
            gateway,
            queue: DebouncedChangeQueue::new(debounce_delay),
        }
    }

    /// Number of watcher events still inside the debounce window
    pub fn pending_local(&self) -> usize {
        self.queue.pending_count()
    }

    // ------------------------------------------------------------------
    // Local side
    // ------------------------------------------------------------------

    /// Feed one raw watcher event into the debounce queue
    ///
    /// Staging files and paths outside the mirror root are dropped here so
    /// they never reach the reconciler.
    pub fn ingest(&mut self, event: FsEvent) {
        if self.is_ignored(event.path()) {
            debug!(path = %event.path().display(), "ignoring watcher event");
            return;
        }
        self.queue.push(event);
    }

    /// Drain settled watcher events into domain change events
    ///
    /// Created/modified files are checked for write stability first; a
    /// file that is still growing goes back into the debounce queue and
    /// will be retried on the next drain.
    pub async fn drain_settled(&mut self) -> Vec<ChangeEvent> {
        let settled = self.queue.poll();
        let mut changes = Vec::new();

        for event in settled {
            match self.map_local_event(&event).await {
                Ok(Some(change)) => changes.push(change),
                Ok(None) => {}
                Err(Unsettled) => {
                    debug!(path = %event.path().display(), "file still changing, re-queueing");
                    self.queue.push(event);
                }
            }
        }

        if !changes.is_empty() {
            debug!(count = changes.len(), "local changes collected");
        }
        changes
    }

    async fn map_local_event(&self, event: &FsEvent) -> Result<Option<ChangeEvent>, Unsettled> {
        match event {
            FsEvent::Created(path) => self.map_upsert(path, ChangeKind::Created).await,
            FsEvent::Modified(path) => self.map_upsert(path, ChangeKind::Modified).await,

            FsEvent::Deleted(path) => {
                let Some(mirror) = self.relativize(path) else {
                    return Ok(None);
                };
                // Whether the entry was a directory is no longer observable;
                // the reconciler resolves that from the stored baseline.
                Ok(Some(ChangeEvent::local_deleted(mirror, false)))
            }

            FsEvent::Renamed { old, new } => {
                let from = self.relativize(old);
                let to = self.relativize(new);
                match (from, to) {
                    (Some(from), Some(to)) => {
                        let (fingerprint, is_directory) = self.inspect(&to).await?;
                        Ok(Some(ChangeEvent::local_renamed(
                            from,
                            to,
                            fingerprint,
                            is_directory,
                        )))
                    }
                    // Moved out of the mirror: looks like a deletion.
                    (Some(from), None) => Ok(Some(ChangeEvent::local_deleted(from, false))),
                    // Moved into the mirror: looks like a creation.
                    (None, Some(to)) => {
                        let (fingerprint, is_directory) = self.inspect(&to).await?;
                        Ok(Some(ChangeEvent::local_created(to, fingerprint, is_directory)))
                    }
                    (None, None) => Ok(None),
                }
            }
        }
    }

    async fn map_upsert(
        &self,
        path: &Path,
        kind: ChangeKind,
    ) -> Result<Option<ChangeEvent>, Unsettled> {
        let Some(mirror) = self.relativize(path) else {
            return Ok(None);
        };

        let (fingerprint, is_directory) = self.inspect(&mirror).await?;

        if !is_directory && !is_file_stable(path, STABILITY_CHECK_MS).await {
            return Err(Unsettled);
        }

        let change = match kind {
            ChangeKind::Created => ChangeEvent::local_created(mirror, fingerprint, is_directory),
            _ => {
                if is_directory {
                    // Directory modifications carry no content of their own.
                    return Ok(None);
                }
                ChangeEvent::local_modified(mirror, fingerprint)
            }
        };
        Ok(Some(change))
    }

    /// Stat + fingerprint one mirror entry
    ///
    /// An entry that disappeared between the event and the drain is
    /// treated as unsettled; the watcher will have emitted (or will emit)
    /// the matching deletion.
    async fn inspect(&self, path: &MirrorPath) -> Result<(Option<Fingerprint>, bool), Unsettled> {
        match self.fs.entry(path).await {
            Ok(Some(entry)) => Ok((entry.fingerprint, entry.is_directory)),
            Ok(None) => Err(Unsettled),
            Err(err) => {
                warn!(path = %path, error = %err, "failed to inspect entry");
                Err(Unsettled)
            }
        }
    }

    fn is_ignored(&self, path: &Path) -> bool {
        path.file_name()
            .map(|n| is_staging_name(&n.to_string_lossy()))
            .unwrap_or(false)
    }

    fn relativize(&self, path: &Path) -> Option<MirrorPath> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let joined = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        MirrorPath::new(joined).ok()
    }

    // ------------------------------------------------------------------
    // Remote side
    // ------------------------------------------------------------------

    /// Fetch one page of remote changes
    ///
    /// When the provider rejects the stored cursor, the poll falls back to
    /// a full enumeration with a fresh cursor and marks the batch as
    /// degraded.
    pub async fn poll_remote(&self, cursor: Option<&Cursor>) -> Result<RemoteBatch> {
        let (page, degraded) = match self.gateway.list_changes(cursor).await {
            Ok(page) => (page, false),
            Err(err) if matches!(engine_error::classify(&err), Some(EngineError::StaleCursor)) => {
                warn!("remote cursor rejected, falling back to full enumeration");
                let page = self.gateway.list_changes(None).await?;
                (page, true)
            }
            Err(err) => return Err(err),
        };

        Ok(self.map_remote_page(page, degraded))
    }

    fn map_remote_page(&self, page: ChangePage, degraded: bool) -> RemoteBatch {
        let mut changes = Vec::with_capacity(page.changes.len());
        for raw in page.changes {
            if let Some(change) = map_remote_change(&raw) {
                changes.push(change);
            }
        }

        if degraded || page.full_enumeration {
            info!(
                count = changes.len(),
                degraded, "remote full enumeration mapped"
            );
        }

        RemoteBatch {
            changes,
            next_cursor: page.next_cursor,
            full_enumeration: page.full_enumeration,
            degraded,
        }
    }
}

/// Marker for events that must go back into the debounce queue
struct Unsettled;

/// Map one provider change feed entry into a domain change event
///
/// Drops entries the mirror cannot represent: native documents with no
/// byte stream, malformed identifiers, and paths that fail validation.
fn map_remote_change(raw: &RemoteChange) -> Option<ChangeEvent> {
    if raw.is_native_document {
        debug!(id = %raw.id, name = %raw.name, "skipping provider-native document");
        return None;
    }

    let remote_id = match RemoteId::new(raw.id.clone()) {
        Ok(id) => id,
        Err(err) => {
            warn!(id = %raw.id, error = %err, "dropping change with invalid remote id");
            return None;
        }
    };

    let path = match &raw.path {
        Some(p) => match MirrorPath::new(p.clone()) {
            Ok(mp) => Some(mp),
            Err(err) => {
                warn!(id = %raw.id, path = %p, error = %err, "dropping change with invalid path");
                return None;
            }
        },
        None => None,
    };

    let fingerprint = match &raw.fingerprint {
        Some(f) => match Fingerprint::new(f.clone()) {
            Ok(fp) => Some(fp),
            Err(err) => {
                warn!(id = %raw.id, error = %err, "dropping change with invalid fingerprint");
                return None;
            }
        },
        None => None,
    };

    let kind = if raw.is_deleted {
        ChangeKind::Deleted
    } else {
        // The change feed does not distinguish created from modified; the
        // reconciler treats both as "remote upsert" against the baseline.
        ChangeKind::Modified
    };

    Some(ChangeEvent::remote(
        kind,
        remote_id,
        path,
        fingerprint,
        raw.is_directory,
    ))
}

// ============================================================================
// Unit tests
// ============================================================================
