//! Transfer queue executor
//!
//! Drains the durable operation queue: a bounded worker pool executes
//! operations against the gateway and the local mirror, re-validating each
//! operation's precondition first so a decision made against stale
//! fingerprints is discarded instead of clobbering newer content.
//!
//! ## Execution discipline
//!
//! - The store hands out at most one operation per item key and skips keys
//!   with a running operation; a per-key lock additionally serializes the
//!   queue against the engine's own item mutations.
//! - Transient failures retry in-worker with exponential backoff (1s base,
//!   doubling); `RateLimited` honors the provider's delay, `QuotaExceeded`
//!   waits out a fixed cooldown. Terminal failures park the operation.
//! - Every gateway call carries a timeout; expiry counts as transient.
//! - Downloads go through the staging file and are renamed into place only
//!   after the fingerprint verifies; a mismatch gets one silent retry.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use cirrus_core::config::TransferConfig;
use cirrus_core::domain::{Fingerprint, Item, ItemKey, MirrorPath, OperationKind, SyncOperation};
use cirrus_core::engine_error::{classify, is_transient, EngineError};
use cirrus_core::ports::{ILocalFileSystem, IRemoteGateway, IStateStore, RemoteChange};
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::filesystem::sha256_hex;

/// Base delay of the retry backoff schedule
const RETRY_BASE: Duration = Duration::from_secs(1);

/// Ceiling for a single backoff sleep
const RETRY_CAP: Duration = Duration::from_secs(60);

/// Cooldown before retrying after the provider reports a full quota
const QUOTA_COOLDOWN: Duration = Duration::from_secs(30);

// ============================================================================
// KeyLocks
// ============================================================================

/// Per-item-key async locks
///
/// Shared between the queue workers and the engine so completing a
/// transfer and applying a reconciliation update can never race on the
/// same item.
#[derive(Clone, Default)]
pub struct KeyLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl KeyLocks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for one item key
    pub async fn lock(&self, key: &ItemKey) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(key.to_token())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }
}

// ============================================================================
// Drain statistics
// ============================================================================

/// Tally of one [`TransferQueue::drain`] call
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainStats {
    pub completed: u64,
    pub failed: u64,
    pub discarded: u64,
    /// Operations left pending (shutdown or retry budget deferred)
    pub deferred: u64,
}

impl DrainStats {
    fn absorb(&mut self, outcome: OpOutcome) {
        match outcome {
            OpOutcome::Completed => self.completed += 1,
            OpOutcome::Failed => self.failed += 1,
            OpOutcome::Discarded => self.discarded += 1,
            OpOutcome::Deferred => self.deferred += 1,
        }
    }

    fn merge(&mut self, other: DrainStats) {
        self.completed += other.completed;
        self.failed += other.failed;
        self.discarded += other.discarded;
        self.deferred += other.deferred;
    }

    /// A batch made progress if at least one key can yield a follow-up
    fn settled_any(&self) -> bool {
        self.completed > 0 || self.discarded > 0
    }
}

/// How one operation's execution ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpOutcome {
    Completed,
    Failed,
    Discarded,
    Deferred,
}

/// Result of the pre-execution fingerprint check
enum Precondition {
    /// Safe to execute
    Ok(Item),
    /// The world moved since the decision; discard and re-reconcile
    Stale,
    /// A previous attempt already did the work; just commit the result
    AlreadyApplied(Completion),
    /// The item itself is gone
    Gone,
}

/// What a successful execution produced
enum Completion {
    Item(Item),
    Removed,
}

// ============================================================================
// TransferQueue
// ============================================================================

/// Executes durable operations with bounded concurrency
#[derive(Clone)]
pub struct TransferQueue {
    store: Arc<dyn IStateStore>,
    gateway: Arc<dyn IRemoteGateway>,
    fs: Arc<dyn ILocalFileSystem>,
    config: TransferConfig,
    semaphore: Arc<Semaphore>,
    locks: KeyLocks,
    cancel: CancellationToken,
}

impl TransferQueue {
    pub fn new(
        store: Arc<dyn IStateStore>,
        gateway: Arc<dyn IRemoteGateway>,
        fs: Arc<dyn ILocalFileSystem>,
        config: TransferConfig,
        locks: KeyLocks,
        cancel: CancellationToken,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.concurrency.max(1) as usize));
        Self {
            store,
            gateway,
            fs,
            config,
            semaphore,
            locks,
            cancel,
        }
    }

    /// Execute queued operations until the queue is empty or shutdown
    ///
    /// Operations on different keys run concurrently up to the configured
    /// worker count; repeated batches pick up follow-up operations for
    /// keys whose first operation just completed (rename then upload).
    #[instrument(skip(self))]
    pub async fn drain(&self) -> Result<DrainStats> {
        let mut stats = DrainStats::default();

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let batch = self.store.next_operations(self.config.concurrency).await?;
            if batch.is_empty() {
                break;
            }
            debug!(batch = batch.len(), "executing operation batch");

            let mut join_set = JoinSet::new();
            for op in batch {
                let queue = self.clone();
                join_set.spawn(async move {
                    let op_id = op.id;
                    match queue.execute(op).await {
                        Ok(outcome) => outcome,
                        Err(err) => {
                            warn!(op_id, error = %err, "operation execution errored");
                            OpOutcome::Deferred
                        }
                    }
                });
            }

            let mut batch_stats = DrainStats::default();
            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok(outcome) => batch_stats.absorb(outcome),
                    Err(err) => warn!(error = %err, "transfer worker panicked"),
                }
            }

            // Deferred and parked operations stay pending for a later
            // drain; if this batch settled nothing, the next batch would
            // hand back the same operations and spin.
            let progressed = batch_stats.settled_any();
            stats.merge(batch_stats);
            if !progressed {
                break;
            }
        }

        info!(
            completed = stats.completed,
            failed = stats.failed,
            discarded = stats.discarded,
            deferred = stats.deferred,
            "queue drain finished"
        );
        Ok(stats)
    }

    // ------------------------------------------------------------------
    // Single-operation execution
    // ------------------------------------------------------------------

    #[instrument(skip(self, op), fields(op_id = op.id, kind = %op.kind, key = %op.key))]
    async fn execute(&self, op: SyncOperation) -> Result<OpOutcome> {
        let _key_guard = self.locks.lock(&op.key).await;
        let _permit = self.semaphore.clone().acquire_owned().await?;

        if self.cancel.is_cancelled() {
            return Ok(OpOutcome::Deferred);
        }

        self.store.mark_running(op.id).await?;

        match self.check_precondition(&op).await {
            Ok(Precondition::Ok(item)) => self.execute_with_retry(&op, item).await,
            Ok(Precondition::AlreadyApplied(completion)) => {
                debug!("operation already applied, committing");
                match completion {
                    Completion::Item(item) => {
                        self.store.complete_operation(op.id, &item).await?;
                    }
                    Completion::Removed => {
                        self.store
                            .complete_operation_removing(op.id, &op.key)
                            .await?;
                    }
                }
                Ok(OpOutcome::Completed)
            }
            Ok(Precondition::Stale) => {
                info!("precondition stale, discarding operation");
                self.store.discard_operation(op.id).await?;
                Ok(OpOutcome::Discarded)
            }
            Ok(Precondition::Gone) => {
                info!("item no longer tracked, discarding operation");
                self.store.discard_operation(op.id).await?;
                Ok(OpOutcome::Discarded)
            }
            Err(err) => {
                // Cannot tell whether it is safe to run. The attempt still
                // counts against the budget so a precondition that never
                // becomes checkable parks instead of deferring forever.
                let attempts = op.attempts + 1;
                if attempts >= self.config.max_attempts {
                    warn!(error = %err, attempts, "precondition check failed, parking operation");
                    self.store.fail_operation(op.id, attempts, true).await?;
                    Ok(OpOutcome::Failed)
                } else {
                    warn!(error = %err, attempts, "precondition check failed, leaving pending");
                    self.store.fail_operation(op.id, attempts, false).await?;
                    Ok(OpOutcome::Deferred)
                }
            }
        }
    }

    /// Re-validate the fingerprints the reconciler decided on
    async fn check_precondition(&self, op: &SyncOperation) -> Result<Precondition> {
        let Some(item) = self.store.get_item(&op.key).await? else {
            return Ok(Precondition::Gone);
        };

        match op.kind {
            OperationKind::Upload => {
                let Some(path) = item.local_path().cloned() else {
                    return Ok(Precondition::Gone);
                };
                let Some(entry) = self.fs.entry(&path).await? else {
                    // The file vanished after the decision.
                    return Ok(Precondition::Stale);
                };
                if !item.is_directory() && entry.fingerprint.as_ref() != op.expected_local.as_ref()
                {
                    return Ok(Precondition::Stale);
                }
                // Crash recovery: the upload may have finished before the
                // completion transaction committed.
                if item.remote_id().is_some()
                    && op.expected_local.is_some()
                    && item.remote_fingerprint() == op.expected_local.as_ref()
                {
                    let mut updated = item.clone();
                    updated.mark_synced(chrono::Utc::now())?;
                    return Ok(Precondition::AlreadyApplied(Completion::Item(updated)));
                }
                Ok(Precondition::Ok(item))
            }

            OperationKind::Download => {
                let ItemKey::Remote(id) = &op.key else {
                    return Ok(Precondition::Stale);
                };
                if !item.is_directory() {
                    let metadata = self
                        .with_timeout(self.gateway.get_metadata(id))
                        .await?;
                    if remote_fingerprint(&metadata) != op.expected_remote {
                        return Ok(Precondition::Stale);
                    }
                    if let Some(path) = item.local_path() {
                        if let Some(entry) = self.fs.entry(path).await? {
                            if entry.fingerprint == op.expected_remote {
                                let mut updated = item.clone();
                                updated.set_local_fingerprint(op.expected_remote.clone());
                                updated.mark_synced(chrono::Utc::now())?;
                                return Ok(Precondition::AlreadyApplied(Completion::Item(
                                    updated,
                                )));
                            }
                        }
                    }
                }
                Ok(Precondition::Ok(item))
            }

            OperationKind::DeleteRemote => {
                let ItemKey::Remote(id) = &op.key else {
                    return Ok(Precondition::Gone);
                };
                match self.with_timeout(self.gateway.get_metadata(id)).await {
                    Ok(metadata) => {
                        if metadata.is_deleted {
                            return Ok(Precondition::AlreadyApplied(Completion::Removed));
                        }
                        if remote_fingerprint(&metadata) != op.expected_remote {
                            // Remote edited after the local delete; never
                            // propagate the deletion over the edit.
                            return Ok(Precondition::Stale);
                        }
                        Ok(Precondition::Ok(item))
                    }
                    Err(err) if is_transient(&err) => Err(err),
                    // Lookup failed terminally: the item is already gone.
                    Err(_) => Ok(Precondition::AlreadyApplied(Completion::Removed)),
                }
            }

            OperationKind::DeleteLocal => {
                let Some(path) = item.local_path() else {
                    return Ok(Precondition::AlreadyApplied(Completion::Removed));
                };
                match self.fs.entry(path).await? {
                    None => Ok(Precondition::AlreadyApplied(Completion::Removed)),
                    Some(entry) => {
                        if !item.is_directory()
                            && entry.fingerprint.as_ref() != item.local_fingerprint()
                        {
                            // Edited locally since the decision.
                            return Ok(Precondition::Stale);
                        }
                        Ok(Precondition::Ok(item))
                    }
                }
            }

            OperationKind::RenameLocal | OperationKind::RenameRemote => Ok(Precondition::Ok(item)),

            // Conflicts are recorded when the cycle output is applied,
            // never executed from the queue.
            OperationKind::FlagConflict => Ok(Precondition::Stale),
        }
    }

    async fn execute_with_retry(&self, op: &SyncOperation, item: Item) -> Result<OpOutcome> {
        let mut attempts = op.attempts;
        let mut integrity_retry_used = false;

        loop {
            attempts += 1;

            match self.perform(op, item.clone()).await {
                Ok(Completion::Item(updated)) => {
                    self.store.complete_operation(op.id, &updated).await?;
                    debug!(attempts, "operation completed");
                    return Ok(OpOutcome::Completed);
                }
                Ok(Completion::Removed) => {
                    self.store
                        .complete_operation_removing(op.id, &op.key)
                        .await?;
                    debug!(attempts, "operation completed, item removed");
                    return Ok(OpOutcome::Completed);
                }
                Err(err) => {
                    if let Some(EngineError::IntegrityMismatch { .. }) = classify(&err) {
                        if !integrity_retry_used {
                            warn!(error = %err, "integrity mismatch, retrying once");
                            integrity_retry_used = true;
                            continue;
                        }
                        warn!(error = %err, "integrity mismatch persisted, parking operation");
                        self.store.fail_operation(op.id, attempts, true).await?;
                        return Ok(OpOutcome::Failed);
                    }

                    if !is_transient(&err) {
                        warn!(error = %err, attempts, "terminal failure, parking operation");
                        self.store.fail_operation(op.id, attempts, true).await?;
                        return Ok(OpOutcome::Failed);
                    }

                    if attempts >= self.config.max_attempts {
                        warn!(error = %err, attempts, "retry budget exhausted, parking operation");
                        self.store.fail_operation(op.id, attempts, true).await?;
                        return Ok(OpOutcome::Failed);
                    }

                    let delay = retry_delay(&err, attempts);
                    debug!(error = %err, attempts, delay_ms = delay.as_millis() as u64, "transient failure, backing off");

                    tokio::select! {
                        () = self.cancel.cancelled() => {
                            self.store.fail_operation(op.id, attempts, false).await?;
                            return Ok(OpOutcome::Deferred);
                        }
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // The transfers themselves
    // ------------------------------------------------------------------

    async fn perform(&self, op: &SyncOperation, mut item: Item) -> Result<Completion> {
        let now = chrono::Utc::now();

        match op.kind {
            OperationKind::Upload => {
                let Some(path) = item.local_path().cloned() else {
                    anyhow::bail!("upload without a local path");
                };

                let result = if item.is_directory() {
                    self.with_timeout(self.gateway.create_directory(&path))
                        .await?
                } else {
                    let data = self.fs.read(&path).await?;
                    self.with_timeout(self.gateway.upload(&path, &data)).await?
                };

                item.set_remote_id(cirrus_core::domain::RemoteId::new(result.id.clone())?);
                item.set_remote_fingerprint(remote_fingerprint(&result));
                if !item.is_directory() {
                    item.set_local_fingerprint(op.expected_local.clone());
                }
                item.mark_synced(now)?;
                Ok(Completion::Item(item))
            }

            OperationKind::Download => {
                let ItemKey::Remote(id) = &op.key else {
                    anyhow::bail!("download without a remote id");
                };
                let Some(path) = item.local_path().cloned() else {
                    anyhow::bail!("download without a local path");
                };

                if item.is_directory() {
                    self.fs.create_dir_all(&path).await?;
                } else {
                    let fp = self
                        .download_file(id, &path, op.expected_remote.as_ref())
                        .await?;
                    item.set_local_fingerprint(Some(fp));
                    item.set_remote_fingerprint(op.expected_remote.clone());
                }
                item.mark_synced(now)?;
                Ok(Completion::Item(item))
            }

            OperationKind::DeleteLocal => {
                if let Some(path) = item.local_path() {
                    if self.fs.entry(path).await?.is_some() {
                        self.fs.delete(path).await?;
                    }
                }
                Ok(Completion::Removed)
            }

            OperationKind::DeleteRemote => {
                let ItemKey::Remote(id) = &op.key else {
                    anyhow::bail!("remote delete without a remote id");
                };
                self.with_timeout(self.gateway.delete(id)).await?;
                Ok(Completion::Removed)
            }

            OperationKind::RenameLocal => {
                let Some(target) = op.target_path.clone() else {
                    anyhow::bail!("rename without a target path");
                };
                let Some(from) = item.local_path().cloned() else {
                    anyhow::bail!("rename without a source path");
                };

                if from != target {
                    self.fs.rename(&from, &target).await?;
                }
                item.set_local_path(target);
                settle_after_rename(&mut item, now)?;
                Ok(Completion::Item(item))
            }

            OperationKind::RenameRemote => {
                let ItemKey::Remote(id) = &op.key else {
                    anyhow::bail!("remote rename without a remote id");
                };
                let Some(target) = op.target_path.clone() else {
                    anyhow::bail!("rename without a target path");
                };

                self.with_timeout(self.gateway.rename(id, &target)).await?;
                item.set_local_path(target);
                settle_after_rename(&mut item, now)?;
                Ok(Completion::Item(item))
            }

            OperationKind::FlagConflict => {
                anyhow::bail!("conflict markers are not executable")
            }
        }
    }

    /// Download one file, resuming from the staging file when possible
    async fn download_file(
        &self,
        id: &cirrus_core::domain::RemoteId,
        path: &MirrorPath,
        expected: Option<&Fingerprint>,
    ) -> Result<Fingerprint> {
        if self.gateway.supports_ranges() {
            let chunk_len = self.config.chunk_size_mb.max(1) * 1024 * 1024;
            let mut offset = self.fs.staged_len(path).await?;
            if offset > 0 {
                debug!(offset, "resuming chunked download");
            }

            loop {
                let bytes = self
                    .with_timeout(self.gateway.download_range(id, offset, chunk_len))
                    .await?;
                self.fs.write_staged(path, offset, &bytes).await?;
                offset += bytes.len() as u64;

                if (bytes.len() as u64) < chunk_len {
                    break;
                }
                if self.cancel.is_cancelled() {
                    // Safe checkpoint: the staged bytes survive for the
                    // next run to resume from.
                    anyhow::bail!(EngineError::TransientIo(
                        "download interrupted by shutdown".to_string()
                    ));
                }
            }

            let actual = self.fs.staged_fingerprint(path).await?;
            if let Some(expected) = expected {
                if &actual != expected {
                    self.fs.discard_staged(path).await?;
                    anyhow::bail!(EngineError::IntegrityMismatch {
                        expected: expected.clone(),
                        actual,
                    });
                }
            }
            self.fs.commit_staged(path).await?;
            Ok(actual)
        } else {
            let data = self.with_timeout(self.gateway.download(id)).await?;
            let actual = Fingerprint::new(sha256_hex(&data))?;
            if let Some(expected) = expected {
                if &actual != expected {
                    anyhow::bail!(EngineError::IntegrityMismatch {
                        expected: expected.clone(),
                        actual,
                    });
                }
            }
            self.fs.write_atomic(path, &data).await?;
            Ok(actual)
        }
    }

    /// Bound one gateway call by the configured request timeout
    async fn with_timeout<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        let limit = Duration::from_secs(self.config.request_timeout.max(1));
        match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(anyhow::Error::new(EngineError::TransientIo(format!(
                "request timed out after {}s",
                limit.as_secs()
            )))),
        }
    }
}

/// A rename leaves the item synced only when no content transfer is still
/// outstanding for it
fn settle_after_rename(item: &mut Item, now: chrono::DateTime<chrono::Utc>) -> Result<()> {
    if item.local_fingerprint() == item.remote_fingerprint() {
        item.mark_synced(now)?;
    }
    Ok(())
}

fn remote_fingerprint(change: &RemoteChange) -> Option<Fingerprint> {
    change
        .fingerprint
        .as_ref()
        .and_then(|f| Fingerprint::new(f.clone()).ok())
}

/// Backoff delay for the next retry
///
/// Provider hints win; quota exhaustion waits out a fixed cooldown; plain
/// transient failures double from the base.
fn retry_delay(err: &anyhow::Error, attempts: u32) -> Duration {
    match classify(err) {
        Some(EngineError::RateLimited {
            retry_after: Some(delay),
            ..
        }) => *delay,
        Some(EngineError::QuotaExceeded(_)) => QUOTA_COOLDOWN,
        _ => {
            let exp = attempts.saturating_sub(1).min(16);
            RETRY_BASE
                .saturating_mul(2u32.saturating_pow(exp))
                .min(RETRY_CAP)
        }
    }
}

// ============================================================================
// Unit tests
// ============================================================================
