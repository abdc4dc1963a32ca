//! The synchronization engine façade
//!
//! [`SyncEngine`] wires the collector, reconciler, transfer queue, and
//! conflict resolver together and runs them as one background task:
//!
//! - watcher events are ingested continuously and debounced;
//! - remote polls run on an adaptive interval that stretches while the
//!   feed is quiet and snaps back on activity or an explicit
//!   connectivity signal;
//! - reconciliation cycles never overlap, and each cycle persists its
//!   decisions before the queue executes them;
//! - the remote cursor is saved only after a cycle's output has been
//!   applied, so a crash replays the page instead of dropping it.
//!
//! `stop()` cancels via a [`CancellationToken`]; in-flight transfers stop
//! at their next safe checkpoint and resume from the durable queue on the
//! next start.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use cirrus_core::config::Config;
use cirrus_core::domain::{ChangeEvent, ItemKey, OperationKind, Resolution};
use cirrus_core::ports::{ILocalFileSystem, IRemoteGateway, IStateStore};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::collector::{ChangeCollector, PollBackoff};
use crate::queue::{KeyLocks, TransferQueue};
use crate::reconciler::{reconcile, ReconcileOutcome};
use crate::resolve::ConflictResolver;
use crate::watcher::FileWatcher;

/// How often the debounce queue is polled for settled events
const TICK_INTERVAL: Duration = Duration::from_secs(1);

// ============================================================================
// EngineStatus
// ============================================================================

/// Snapshot of engine health for the surrounding application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStatus {
    pub running: bool,
    pub pending_operations: u64,
    pub failed_operations: u64,
    pub unresolved_conflicts: u64,
    /// True when the last remote poll fell back to a full re-enumeration
    pub degraded: bool,
    pub last_cycle: Option<DateTime<Utc>>,
}

// ============================================================================
// SyncEngine
// ============================================================================

/// Owns the background synchronization task
pub struct SyncEngine {
    inner: Arc<EngineInner>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    poke_tx: mpsc::Sender<()>,
    poke_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

struct EngineInner {
    store: Arc<dyn IStateStore>,
    gateway: Arc<dyn IRemoteGateway>,
    fs: Arc<dyn ILocalFileSystem>,
    config: Config,
    queue: TransferQueue,
    resolver: ConflictResolver,
    locks: KeyLocks,
    /// Serializes reconciliation cycles
    cycle_lock: Mutex<()>,
    degraded: AtomicBool,
    last_cycle: Mutex<Option<DateTime<Utc>>>,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn IStateStore>,
        gateway: Arc<dyn IRemoteGateway>,
        fs: Arc<dyn ILocalFileSystem>,
        config: Config,
    ) -> Self {
        let cancel = CancellationToken::new();
        let locks = KeyLocks::new();
        let queue = TransferQueue::new(
            Arc::clone(&store),
            Arc::clone(&gateway),
            Arc::clone(&fs),
            config.transfer.clone(),
            locks.clone(),
            cancel.clone(),
        );
        let resolver = ConflictResolver::new(Arc::clone(&store), Arc::clone(&fs), locks.clone());
        let (poke_tx, poke_rx) = mpsc::channel(8);

        Self {
            inner: Arc::new(EngineInner {
                store,
                gateway,
                fs,
                config,
                queue,
                resolver,
                locks,
                cycle_lock: Mutex::new(()),
                degraded: AtomicBool::new(false),
                last_cycle: Mutex::new(None),
            }),
            cancel,
            task: Mutex::new(None),
            poke_tx,
            poke_rx: Mutex::new(Some(poke_rx)),
        }
    }

    /// Start the background synchronization task
    ///
    /// Recovers operations interrupted by a previous crash, starts the
    /// file watcher on the mirror root, and spawns the engine loop.
    ///
    /// # Errors
    /// Returns an error if the watcher cannot be created or the engine is
    /// already running.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<()> {
        let mut task_slot = self.task.lock().await;
        if task_slot.is_some() {
            anyhow::bail!("engine is already running");
        }

        let requeued = self.inner.store.requeue_interrupted().await?;
        if requeued > 0 {
            info!(requeued, "recovered interrupted operations");
        }

        let root: PathBuf = self.inner.config.sync.root.clone();
        let (mut watcher, watcher_rx) = FileWatcher::new()?;
        watcher.watch(&root).context("failed to watch mirror root")?;

        let poke_rx = self
            .poke_rx
            .lock()
            .await
            .take()
            .context("engine cannot be restarted after stop")?;

        let inner = Arc::clone(&self.inner);
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            // The watcher must outlive the loop or events stop flowing.
            let _watcher = watcher;
            run_loop(inner, watcher_rx, poke_rx, cancel).await;
        });
        *task_slot = Some(handle);

        info!(root = %root.display(), "sync engine started");
        Ok(())
    }

    /// Stop the engine, letting in-flight work reach a safe checkpoint
    #[instrument(skip(self))]
    pub async fn stop(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.task.lock().await.take() {
            if let Err(err) = handle.await {
                error!(error = %err, "engine task ended abnormally");
            }
        }
        info!("sync engine stopped");
    }

    /// Report pending work, failures, and conflict counts
    pub async fn status(&self) -> Result<EngineStatus> {
        let running = self.task.lock().await.is_some() && !self.cancel.is_cancelled();
        Ok(EngineStatus {
            running,
            pending_operations: self.inner.store.pending_count().await?,
            failed_operations: self.inner.store.failed_operations().await?.len() as u64,
            unresolved_conflicts: self.inner.store.unresolved_conflicts().await?.len() as u64,
            degraded: self.inner.degraded.load(Ordering::Relaxed),
            last_cycle: *self.inner.last_cycle.lock().await,
        })
    }

    /// Apply a user's conflict resolution and execute the resulting work
    #[instrument(skip(self), fields(key = %key))]
    pub async fn resolve_conflict(&self, key: &ItemKey, choice: Resolution) -> Result<()> {
        self.inner.resolver.resolve(key, choice).await?;
        self.inner.queue.drain().await?;
        Ok(())
    }

    /// Signal that connectivity returned; snaps the poll interval back
    pub async fn notify_connectivity(&self) {
        if self.poke_tx.send(()).await.is_err() {
            debug!("connectivity signal dropped (engine not running)");
        }
    }

    /// Run one reconciliation cycle immediately
    ///
    /// Performs a full local rescan rather than waiting on watcher events,
    /// so changes made while the engine was not watching are picked up.
    /// Exposed for the surrounding application and for tests; startup uses
    /// the same path.
    pub async fn run_cycle_now(&self) -> Result<()> {
        let local = local_rescan(&self.inner.store, &self.inner.fs).await?;
        run_cycle(&self.inner, local, true).await
    }
}

/// Enumerate the mirror and present the result as one local change batch
///
/// Unchanged entries reconcile to nothing against the stored baseline, so
/// presenting everything as created is safe; tracked items whose local
/// copy is missing become deletion events. Items still waiting on their
/// first download are not treated as deleted.
async fn local_rescan(
    store: &Arc<dyn IStateStore>,
    fs: &Arc<dyn ILocalFileSystem>,
) -> Result<Vec<ChangeEvent>> {
    let entries = fs.enumerate().await?;
    let present: std::collections::HashSet<_> = entries.iter().map(|e| e.path.clone()).collect();

    let mut events: Vec<ChangeEvent> = entries
        .into_iter()
        .map(|e| ChangeEvent::local_created(e.path, e.fingerprint, e.is_directory))
        .collect();

    for item in store.scan().await? {
        let Some(path) = item.local_path() else {
            continue;
        };
        if present.contains(path) {
            continue;
        }
        let existed_locally = matches!(
            item.sync_state(),
            cirrus_core::domain::SyncState::Synced | cirrus_core::domain::SyncState::PendingPush
        );
        if existed_locally {
            events.push(ChangeEvent::local_deleted(path.clone(), item.is_directory()));
        }
    }

    debug!(events = events.len(), "local rescan complete");
    Ok(events)
}

// ============================================================================
// Engine loop
// ============================================================================

async fn run_loop(
    inner: Arc<EngineInner>,
    mut watcher_rx: mpsc::Receiver<crate::watcher::FsEvent>,
    mut poke_rx: mpsc::Receiver<()>,
    cancel: CancellationToken,
) {
    let mut collector = ChangeCollector::new(
        inner.config.sync.root.clone(),
        Arc::clone(&inner.fs),
        Arc::clone(&inner.gateway),
        Duration::from_secs(inner.config.sync.debounce_delay),
    );
    // Polls stretch while the feed is quiet; the configured interval is
    // the ceiling, activity snaps back to the base.
    let mut backoff = PollBackoff::new(
        Duration::from_secs(5),
        Duration::from_secs(inner.config.sync.poll_interval.max(5)),
    );
    let mut watcher_alive = true;

    // Startup rescan catches changes made while the engine was down.
    let rescan = match local_rescan(&inner.store, &inner.fs).await {
        Ok(events) => events,
        Err(err) => {
            error!(error = %err, "startup rescan failed");
            Vec::new()
        }
    };
    if let Err(err) = run_cycle(&inner, rescan, true).await {
        error!(error = %err, "startup cycle failed");
    }
    let mut next_poll = Instant::now() + backoff.current();

    let mut tick = tokio::time::interval(TICK_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                info!("engine loop shutting down");
                break;
            }

            maybe_event = watcher_rx.recv(), if watcher_alive => {
                match maybe_event {
                    Some(event) => collector.ingest(event),
                    None => {
                        warn!("watcher channel closed");
                        watcher_alive = false;
                    }
                }
            }

            Some(()) = poke_rx.recv() => {
                debug!("connectivity signal received");
                backoff.reset();
                next_poll = Instant::now();
            }

            _ = tick.tick() => {
                let poll_due = Instant::now() >= next_poll;
                let local = collector.drain_settled().await;

                if local.is_empty() && !poll_due {
                    continue;
                }

                match run_cycle_collecting(&inner, &mut collector, local, poll_due).await {
                    Ok(remote_activity) => {
                        if poll_due {
                            if remote_activity {
                                backoff.reset();
                            } else {
                                backoff.idle();
                            }
                            next_poll = Instant::now() + backoff.current();
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "cycle failed, backing off");
                        backoff.idle();
                        next_poll = Instant::now() + backoff.current();
                    }
                }
            }
        }
    }
}

/// Run one cycle through the collector; returns whether the remote feed
/// had any changes
async fn run_cycle_collecting(
    inner: &Arc<EngineInner>,
    collector: &mut ChangeCollector,
    local: Vec<ChangeEvent>,
    poll_remote: bool,
) -> Result<bool> {
    let _cycle = inner.cycle_lock.lock().await;

    let remote_batch = if poll_remote {
        let cursor = inner.store.load_cursor().await?;
        let batch = collector.poll_remote(cursor.as_ref()).await?;
        inner.degraded.store(batch.degraded, Ordering::Relaxed);
        Some(batch)
    } else {
        None
    };

    let remote_activity = remote_batch
        .as_ref()
        .is_some_and(|b| !b.changes.is_empty());

    let snapshot = inner.store.scan().await?;
    let remote_events = remote_batch
        .as_ref()
        .map(|b| b.changes.clone())
        .unwrap_or_default();

    let outcome = reconcile(&snapshot, &local, &remote_events, Utc::now());
    apply_outcome(inner, &outcome).await?;

    // Persist the cursor only after the page's effects are durable.
    if let Some(batch) = remote_batch {
        inner.store.save_cursor(&batch.next_cursor).await?;
    }

    inner.queue.drain().await?;
    *inner.last_cycle.lock().await = Some(Utc::now());
    Ok(remote_activity)
}

/// Cycle entry point without a live collector (bootstrap and tests)
async fn run_cycle(inner: &Arc<EngineInner>, local: Vec<ChangeEvent>, poll_remote: bool) -> Result<()> {
    let mut collector = ChangeCollector::new(
        inner.config.sync.root.clone(),
        Arc::clone(&inner.fs),
        Arc::clone(&inner.gateway),
        Duration::from_secs(inner.config.sync.debounce_delay),
    );
    run_cycle_collecting(inner, &mut collector, local, poll_remote).await?;
    Ok(())
}

/// Persist one cycle's decisions
///
/// Operations are enqueued before item updates commit: if the process
/// dies in between, the next cycle re-emits the decision and the
/// duplicate operation completes as already-applied. The reverse order
/// could lose work.
async fn apply_outcome(inner: &Arc<EngineInner>, outcome: &ReconcileOutcome) -> Result<()> {
    if outcome.is_empty() {
        return Ok(());
    }

    debug!(
        operations = outcome.operations.len(),
        items = outcome.item_updates.len(),
        conflicts = outcome.conflicts.len(),
        removals = outcome.removals.len(),
        "applying cycle outcome"
    );

    for op in &outcome.operations {
        // Conflict markers are recorded below, never executed.
        if op.kind == OperationKind::FlagConflict {
            continue;
        }
        inner.store.enqueue_operation(op).await?;
    }

    for item in &outcome.item_updates {
        let _guard = inner.locks.lock(&item.key()).await;
        inner.store.put_item(item).await?;
    }

    for conflict in &outcome.conflicts {
        inner.store.put_conflict(conflict).await?;
    }

    for key in &outcome.removals {
        let _guard = inner.locks.lock(key).await;
        inner.store.delete_item(key).await?;
    }

    Ok(())
}
