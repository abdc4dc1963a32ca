//! Local change detection
//!
//! [`FileWatcher`] subscribes to the OS notification facility (inotify on
//! Linux) for the mirror root and emits [`FsEvent`]s over a channel. The
//! engine's own staging artifacts are filtered out right in the watcher
//! callback, so the atomic-write traffic of a download never masquerades
//! as a user edit downstream.
//!
//! Raw events are noisy: editors save through temp files, large copies
//! produce long modify bursts. [`DebouncedChangeQueue`] absorbs that by
//! holding each path until it has been quiet for a configured window, and
//! [`is_file_stable`] catches writers that are still mid-stream when the
//! window expires.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Context, Result};
use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::filesystem::is_staging_name;

// ============================================================================
// FsEvent
// ============================================================================

/// A filesystem change observed under the mirror root
///
/// Paths are absolute at this stage; the change collector relativizes
/// settled events against the root when it turns them into domain
/// [`ChangeEvent`](cirrus_core::domain::ChangeEvent)s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsEvent {
    /// An entry appeared
    Created(PathBuf),
    /// An existing file's content or metadata changed
    Modified(PathBuf),
    /// An entry disappeared
    Deleted(PathBuf),
    /// An entry moved, with both endpoints observed
    Renamed { old: PathBuf, new: PathBuf },
}

impl FsEvent {
    /// The path this event settles on (the destination, for renames)
    pub fn path(&self) -> &Path {
        match self {
            FsEvent::Created(p) | FsEvent::Modified(p) | FsEvent::Deleted(p) => p,
            FsEvent::Renamed { new, .. } => new,
        }
    }

    /// Distill a raw notify event into at most one [`FsEvent`]
    ///
    /// Access events and pathless events carry no change and map to
    /// `None`. Every modify flavor other than a complete rename collapses
    /// to `Modified`: the collector re-stats the path anyway, so the
    /// distinction between data and metadata writes buys nothing here.
    fn from_notify(event: notify::Event) -> Option<FsEvent> {
        let mut paths = event.paths.into_iter();
        let first = paths.next()?;

        match event.kind {
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => match paths.next() {
                Some(second) => Some(FsEvent::Renamed {
                    old: first,
                    new: second,
                }),
                // Half of a rename pair; the stat at collection time
                // determines whether anything is still there.
                None => Some(FsEvent::Modified(first)),
            },
            EventKind::Create(_) => Some(FsEvent::Created(first)),
            EventKind::Remove(_) => Some(FsEvent::Deleted(first)),
            EventKind::Modify(_) => Some(FsEvent::Modified(first)),
            _ => None,
        }
    }
}

/// Reinterpret an event so the engine's staging traffic disappears
///
/// Atomic writes land as rename(staging → final): the final path did
/// change, the staging side is plumbing. Events that touch only staging
/// artifacts are dropped outright.
fn without_staging(event: FsEvent) -> Option<FsEvent> {
    match event {
        FsEvent::Renamed { old, new } => match (is_staging_path(&old), is_staging_path(&new)) {
            (false, false) => Some(FsEvent::Renamed { old, new }),
            (true, false) => Some(FsEvent::Modified(new)),
            (false, true) => Some(FsEvent::Deleted(old)),
            (true, true) => None,
        },
        other if is_staging_path(other.path()) => None,
        other => Some(other),
    }
}

fn is_staging_path(path: &Path) -> bool {
    path.file_name()
        .map(|name| is_staging_name(&name.to_string_lossy()))
        .unwrap_or(false)
}

// ============================================================================
// FileWatcher
// ============================================================================

/// OS-level watcher for the mirror root
///
/// Must stay alive for as long as events are wanted; dropping it tears
/// down the subscription and closes the channel.
pub struct FileWatcher {
    inner: RecommendedWatcher,
}

impl FileWatcher {
    /// Create the watcher and the channel its events arrive on
    ///
    /// Mapping and staging filtering run inside the notify callback, so
    /// only events worth debouncing cross the channel.
    ///
    /// # Errors
    /// Returns an error if the OS notification facility is unavailable.
    pub fn new() -> Result<(Self, mpsc::Receiver<FsEvent>)> {
        let (tx, rx) = mpsc::channel::<FsEvent>(1024);

        let inner = notify::recommended_watcher(move |outcome: notify::Result<notify::Event>| {
            let raw = match outcome {
                Ok(raw) => raw,
                Err(err) => {
                    error!(error = %err, "file watcher error");
                    return;
                }
            };
            let Some(event) = FsEvent::from_notify(raw).and_then(without_staging) else {
                return;
            };
            if tx.blocking_send(event).is_err() {
                warn!("watcher receiver dropped, discarding event");
            }
        })
        .context("failed to create file watcher")?;

        Ok((Self { inner }, rx))
    }

    /// Watch `root` and everything under it
    ///
    /// # Errors
    /// Returns an error if the path cannot be watched (missing directory,
    /// permissions, or the inotify watch limit).
    pub fn watch(&mut self, root: &Path) -> Result<()> {
        info!(root = %root.display(), "watching mirror root");
        self.inner
            .watch(root, RecursiveMode::Recursive)
            .with_context(|| format!("failed to watch {}", root.display()))
    }
}

// ============================================================================
// Write-stability check
// ============================================================================

/// Whether a file held still between two stat snapshots `quiet_ms` apart
///
/// Fingerprinting a file another process is still writing would record a
/// torn state, so the collector calls this before hashing. Any movement in
/// size or mtime, or a failed stat, counts as unstable and the event goes
/// back into the debounce queue.
pub async fn is_file_stable(path: &Path, quiet_ms: u64) -> bool {
    let Some(before) = stat_snapshot(path).await else {
        debug!(path = %path.display(), "stat failed during stability check");
        return false;
    };

    tokio::time::sleep(Duration::from_millis(quiet_ms)).await;

    match stat_snapshot(path).await {
        Some(after) if after == before => true,
        Some(_) => {
            debug!(path = %path.display(), "file changed between snapshots");
            false
        }
        None => {
            debug!(path = %path.display(), "file vanished during stability check");
            false
        }
    }
}

async fn stat_snapshot(path: &Path) -> Option<(u64, Option<SystemTime>)> {
    let meta = tokio::fs::metadata(path).await.ok()?;
    Some((meta.len(), meta.modified().ok()))
}

// ============================================================================
// DebouncedChangeQueue
// ============================================================================

/// Holds events until their path has been quiet for the debounce window
///
/// One slot per path: a newer event supersedes the pending one and pushes
/// the settle point out, so a burst of writes to the same file surfaces as
/// a single event carrying the final state.
pub struct DebouncedChangeQueue {
    window: Duration,
    pending: HashMap<PathBuf, PendingChange>,
}

struct PendingChange {
    event: FsEvent,
    settles_at: Instant,
}

impl DebouncedChangeQueue {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashMap::new(),
        }
    }

    /// Record an event, superseding any pending event for the same path
    pub fn push(&mut self, event: FsEvent) {
        let key = event.path().to_path_buf();
        debug!(path = %key.display(), event = ?event, "debouncing change");
        self.pending.insert(
            key,
            PendingChange {
                event,
                settles_at: Instant::now() + self.window,
            },
        );
    }

    /// Remove and return every event whose settle point has passed
    pub fn poll(&mut self) -> Vec<FsEvent> {
        let now = Instant::now();
        let mut settled = Vec::new();

        self.pending.retain(|_, change| {
            if change.settles_at <= now {
                settled.push(change.event.clone());
                false
            } else {
                true
            }
        });

        if !settled.is_empty() {
            debug!(count = settled.len(), "change events settled");
        }
        settled
    }

    /// Events still inside their debounce window
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

// ============================================================================
// Unit tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(kind: EventKind, paths: &[&str]) -> notify::Event {
        notify::Event {
            kind,
            paths: paths.iter().map(PathBuf::from).collect(),
            attrs: Default::default(),
        }
    }

    mod mapping_tests {
        use super::*;
        use notify::event::{AccessKind, CreateKind, DataChange, MetadataKind, RemoveKind};

        #[test]
        fn test_create_maps_to_created() {
            let event = raw(EventKind::Create(CreateKind::File), &["/m/a.txt"]);
            assert_eq!(
                FsEvent::from_notify(event),
                Some(FsEvent::Created(PathBuf::from("/m/a.txt")))
            );
        }

        #[test]
        fn test_remove_maps_to_deleted() {
            let event = raw(EventKind::Remove(RemoveKind::File), &["/m/a.txt"]);
            assert_eq!(
                FsEvent::from_notify(event),
                Some(FsEvent::Deleted(PathBuf::from("/m/a.txt")))
            );
        }

        #[test]
        fn test_modify_flavors_collapse_to_modified() {
            let data = raw(
                EventKind::Modify(ModifyKind::Data(DataChange::Content)),
                &["/m/a.txt"],
            );
            let metadata = raw(
                EventKind::Modify(ModifyKind::Metadata(MetadataKind::Permissions)),
                &["/m/a.txt"],
            );
            let expected = Some(FsEvent::Modified(PathBuf::from("/m/a.txt")));
            assert_eq!(FsEvent::from_notify(data), expected);
            assert_eq!(FsEvent::from_notify(metadata), expected);
        }

        #[test]
        fn test_two_path_rename_keeps_both_endpoints() {
            let event = raw(
                EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
                &["/m/old.txt", "/m/new.txt"],
            );
            assert_eq!(
                FsEvent::from_notify(event),
                Some(FsEvent::Renamed {
                    old: PathBuf::from("/m/old.txt"),
                    new: PathBuf::from("/m/new.txt"),
                })
            );
        }

        #[test]
        fn test_one_path_rename_degrades_to_modified() {
            let event = raw(
                EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
                &["/m/only.txt"],
            );
            assert_eq!(
                FsEvent::from_notify(event),
                Some(FsEvent::Modified(PathBuf::from("/m/only.txt")))
            );
        }

        #[test]
        fn test_access_and_pathless_events_dropped() {
            let access = raw(EventKind::Access(AccessKind::Read), &["/m/a.txt"]);
            let pathless = raw(EventKind::Create(CreateKind::File), &[]);
            assert_eq!(FsEvent::from_notify(access), None);
            assert_eq!(FsEvent::from_notify(pathless), None);
        }

        #[test]
        fn test_rename_path_is_destination() {
            let event = FsEvent::Renamed {
                old: PathBuf::from("/m/old.txt"),
                new: PathBuf::from("/m/new.txt"),
            };
            assert_eq!(event.path(), Path::new("/m/new.txt"));
        }
    }

    mod staging_filter_tests {
        use super::*;

        #[test]
        fn test_staging_only_events_dropped() {
            let event = FsEvent::Modified(PathBuf::from("/m/.cirrus-tmp-a.txt"));
            assert_eq!(without_staging(event), None);
        }

        #[test]
        fn test_atomic_write_landing_becomes_modified() {
            let event = FsEvent::Renamed {
                old: PathBuf::from("/m/.cirrus-tmp-a.txt"),
                new: PathBuf::from("/m/a.txt"),
            };
            assert_eq!(
                without_staging(event),
                Some(FsEvent::Modified(PathBuf::from("/m/a.txt")))
            );
        }

        #[test]
        fn test_move_into_staging_becomes_deleted() {
            let event = FsEvent::Renamed {
                old: PathBuf::from("/m/a.txt"),
                new: PathBuf::from("/m/.cirrus-tmp-a.txt"),
            };
            assert_eq!(
                without_staging(event),
                Some(FsEvent::Deleted(PathBuf::from("/m/a.txt")))
            );
        }

        #[test]
        fn test_ordinary_events_pass_through() {
            let rename = FsEvent::Renamed {
                old: PathBuf::from("/m/old.txt"),
                new: PathBuf::from("/m/new.txt"),
            };
            assert_eq!(without_staging(rename.clone()), Some(rename));

            let created = FsEvent::Created(PathBuf::from("/m/a.txt"));
            assert_eq!(without_staging(created.clone()), Some(created));
        }
    }

    mod debounce_tests {
        use super::*;

        #[test]
        fn test_event_held_inside_window() {
            let mut queue = DebouncedChangeQueue::new(Duration::from_secs(60));
            queue.push(FsEvent::Created(PathBuf::from("/a.txt")));

            assert!(queue.poll().is_empty());
            assert_eq!(queue.pending_count(), 1);
        }

        #[test]
        fn test_settled_event_emitted_once() {
            let mut queue = DebouncedChangeQueue::new(Duration::from_millis(0));
            queue.push(FsEvent::Modified(PathBuf::from("/a.txt")));

            std::thread::sleep(Duration::from_millis(10));
            assert_eq!(queue.poll().len(), 1);
            assert!(queue.poll().is_empty());
            assert!(queue.is_empty());
        }

        #[test]
        fn test_newest_event_wins_per_path() {
            let mut queue = DebouncedChangeQueue::new(Duration::from_millis(0));
            queue.push(FsEvent::Created(PathBuf::from("/a.txt")));
            queue.push(FsEvent::Modified(PathBuf::from("/a.txt")));
            queue.push(FsEvent::Deleted(PathBuf::from("/a.txt")));
            assert_eq!(queue.pending_count(), 1);

            std::thread::sleep(Duration::from_millis(10));
            let settled = queue.poll();
            assert_eq!(settled, vec![FsEvent::Deleted(PathBuf::from("/a.txt"))]);
        }

        #[test]
        fn test_distinct_paths_settle_independently() {
            let mut queue = DebouncedChangeQueue::new(Duration::from_millis(50));

            queue.push(FsEvent::Created(PathBuf::from("/old.txt")));
            std::thread::sleep(Duration::from_millis(60));
            queue.push(FsEvent::Created(PathBuf::from("/new.txt")));

            let settled = queue.poll();
            assert_eq!(settled, vec![FsEvent::Created(PathBuf::from("/old.txt"))]);
            assert_eq!(queue.pending_count(), 1);
        }

        #[test]
        fn test_superseding_event_extends_window() {
            let mut queue = DebouncedChangeQueue::new(Duration::from_millis(50));

            queue.push(FsEvent::Created(PathBuf::from("/a.txt")));
            std::thread::sleep(Duration::from_millis(30));
            queue.push(FsEvent::Modified(PathBuf::from("/a.txt")));

            std::thread::sleep(Duration::from_millis(30));
            assert!(queue.poll().is_empty());

            std::thread::sleep(Duration::from_millis(30));
            let settled = queue.poll();
            assert_eq!(settled, vec![FsEvent::Modified(PathBuf::from("/a.txt"))]);
        }
    }

    mod stability_tests {
        use super::*;

        #[tokio::test]
        async fn test_quiet_file_is_stable() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("quiet.txt");
            std::fs::write(&path, b"settled").unwrap();

            assert!(is_file_stable(&path, 10).await);
        }

        #[tokio::test]
        async fn test_growing_file_is_unstable() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("growing.txt");
            std::fs::write(&path, b"start").unwrap();

            let writer = {
                let path = path.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    std::fs::write(&path, b"start plus more").unwrap();
                })
            };

            assert!(!is_file_stable(&path, 60).await);
            writer.await.unwrap();
        }

        #[tokio::test]
        async fn test_missing_file_is_unstable() {
            let dir = tempfile::tempdir().unwrap();
            assert!(!is_file_stable(&dir.path().join("absent.txt"), 5).await);
        }
    }
}
