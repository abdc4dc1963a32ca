//! Conflict resolution executor
//!
//! Turns a user's [`Resolution`] choice into ordinary pipeline work: the
//! frozen item leaves `Conflicted` through its explicit resolution
//! transition and the winning side's content re-enters the transfer queue
//! as a plain upload or download. Keep-both first moves the local copy to
//! a conflicted-copy name so the remote version can land on the original
//! path.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use cirrus_core::domain::{
    conflict_copy_path, conflict_copy_tag, Conflict, Item, ItemKey, Resolution, SyncOperation,
    SyncState,
};
use cirrus_core::ports::{ILocalFileSystem, IStateStore};
use tracing::{info, instrument, warn};

use crate::queue::KeyLocks;

/// Applies conflict resolutions chosen outside the engine
pub struct ConflictResolver {
    store: Arc<dyn IStateStore>,
    fs: Arc<dyn ILocalFileSystem>,
    locks: KeyLocks,
}

impl ConflictResolver {
    pub fn new(
        store: Arc<dyn IStateStore>,
        fs: Arc<dyn ILocalFileSystem>,
        locks: KeyLocks,
    ) -> Self {
        Self { store, fs, locks }
    }

    /// Resolve the unresolved conflict recorded for `key`
    ///
    /// # Errors
    /// Returns an error when no unresolved conflict exists for the key or
    /// when the filesystem work for keep-both fails.
    #[instrument(skip(self), fields(key = %key, choice = %choice))]
    pub async fn resolve(&self, key: &ItemKey, choice: Resolution) -> Result<()> {
        let _guard = self.locks.lock(key).await;

        let conflict = self
            .store
            .conflict_for_key(key)
            .await?
            .with_context(|| format!("no unresolved conflict for {key}"))?;

        let item = self
            .store
            .get_item(key)
            .await?
            .with_context(|| format!("conflicted item {key} is no longer tracked"))?;

        info!(reason = %conflict.reason, "applying conflict resolution");

        match choice {
            Resolution::KeepLocal => self.keep_local(key, item).await?,
            Resolution::KeepRemote => self.keep_remote(key, item, &conflict).await?,
            Resolution::KeepBothRenamed => self.keep_both(key, item, &conflict).await?,
        }

        self.store
            .resolve_conflict_record(&conflict.id, choice)
            .await?;
        Ok(())
    }

    /// The local version wins; push it over the remote one
    async fn keep_local(&self, key: &ItemKey, mut item: Item) -> Result<()> {
        let Some(path) = item.local_path().cloned() else {
            // A flagged duplicate-name occupant has no local copy to keep;
            // keeping "local" means keeping the current path owner and
            // dropping this item from tracking.
            warn!(key = %key, "keep-local on an item without a local copy, untracking");
            self.store.delete_item(key).await?;
            return Ok(());
        };

        // Re-fingerprint: the file may have changed while conflicted.
        let fingerprint = match self.fs.entry(&path).await? {
            Some(entry) => entry.fingerprint,
            None => anyhow::bail!("local copy of {key} disappeared at {path}"),
        };

        item.set_local_fingerprint(fingerprint.clone());
        item.resolve_to(SyncState::PendingPush)?;
        self.store.put_item(&item).await?;
        self.store
            .enqueue_operation(&SyncOperation::upload(key.clone(), fingerprint))
            .await?;
        Ok(())
    }

    /// The remote version wins; pull it over the local copy
    async fn keep_remote(&self, key: &ItemKey, mut item: Item, conflict: &Conflict) -> Result<()> {
        if item.local_path().is_none() {
            // Duplicate-name occupant: the contested path stays with its
            // owner, so the remote copy lands under a conflicted-copy name.
            let landing = self.conflicted_copy_target(conflict)?;
            item.set_local_path(landing);
        }

        let expected = item.remote_fingerprint().cloned();
        item.resolve_to(SyncState::PendingPull)?;
        self.store.put_item(&item).await?;
        self.store
            .enqueue_operation(&SyncOperation::download(key.clone(), expected))
            .await?;
        Ok(())
    }

    /// Keep both: move the local copy aside, then pull the remote version
    async fn keep_both(&self, key: &ItemKey, mut item: Item, conflict: &Conflict) -> Result<()> {
        let Some(path) = item.local_path().cloned() else {
            // Without a local copy there is nothing to preserve; this
            // degenerates to keep-remote under a conflicted-copy name.
            return self.keep_remote(key, item, conflict).await;
        };

        let copy_path = conflict_copy_path(&path, Utc::now().date_naive(), &conflict_copy_tag())?;
        info!(from = %path, to = %copy_path, "preserving local copy");
        self.fs.rename(&path, &copy_path).await?;

        // The preserved copy becomes an ordinary new local item.
        let copy_fingerprint = item.local_fingerprint().cloned();
        let copy = Item::new_local(copy_path.clone(), copy_fingerprint.clone(), item.is_directory());
        self.store.put_item(&copy).await?;
        self.store
            .enqueue_operation(&SyncOperation::upload(
                ItemKey::Path(copy_path),
                copy_fingerprint,
            ))
            .await?;

        // The original path takes the remote version.
        let expected = item.remote_fingerprint().cloned();
        item.set_local_fingerprint(None);
        item.resolve_to(SyncState::PendingPull)?;
        self.store.put_item(&item).await?;
        self.store
            .enqueue_operation(&SyncOperation::download(key.clone(), expected))
            .await?;
        Ok(())
    }

    /// Landing path for a remote copy that lost a name collision
    fn conflicted_copy_target(&self, conflict: &Conflict) -> Result<cirrus_core::domain::MirrorPath> {
        let contested = conflict
            .path
            .as_ref()
            .context("conflict record has no path to derive a landing name from")?;
        Ok(conflict_copy_path(
            contested,
            Utc::now().date_naive(),
            &conflict_copy_tag(),
        )?)
    }
}
