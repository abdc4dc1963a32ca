//! Three-way reconciliation
//!
//! [`reconcile`] is the decision core: a pure function of the metadata
//! snapshot plus one settled batch per origin, producing the operations,
//! item updates, and conflict records needed to converge both sides. It
//! performs no I/O, which is what makes every decision-table row unit
//! testable.
//!
//! ## Algorithm
//!
//! 1. Pair local disappear/appear events with equal fingerprints into
//!    renames, so moved files are not re-transferred.
//! 2. Resolve every event to its canonical key (`remote_id` where known,
//!    path otherwise) and build one view per key and origin.
//! 3. For each touched key, compare the observed fingerprints against the
//!    stored baseline: a side changed iff its observation differs from
//!    what the store last recorded for that side.
//! 4. Apply the decision table; divergence on both sides becomes a
//!    conflict record, never a transfer.
//! 5. Order the output: renames first, then creations parents-first, then
//!    deletions children-first.
//!
//! Untouched keys produce nothing, so a quiet cycle is zero work.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use cirrus_core::domain::{
    ChangeEvent, ChangeKind, Conflict, ConflictReason, Fingerprint, Item, ItemKey, MirrorPath,
    OperationKind, Origin, SyncOperation, SyncState, VersionInfo,
};
use tracing::{debug, warn};

// ============================================================================
// ReconcileOutcome
// ============================================================================

/// Everything one reconciliation cycle decided
///
/// `item_updates` are persisted before `operations` are enqueued so a
/// crash between the two leaves items in a pending state that the next
/// cycle re-evaluates. `removals` are items both sides confirmed deleted.
#[derive(Debug, Default)]
pub struct ReconcileOutcome {
    pub operations: Vec<SyncOperation>,
    pub item_updates: Vec<Item>,
    pub conflicts: Vec<Conflict>,
    pub removals: Vec<ItemKey>,
}

impl ReconcileOutcome {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
            && self.item_updates.is_empty()
            && self.conflicts.is_empty()
            && self.removals.is_empty()
    }

    /// Count of operations of one kind, for status reporting and tests
    #[must_use]
    pub fn count_kind(&self, kind: OperationKind) -> usize {
        self.operations.iter().filter(|op| op.kind == kind).count()
    }
}

// ============================================================================
// Per-origin views
// ============================================================================

/// What the local batch says about one key
#[derive(Debug, Clone)]
struct LocalView {
    present: bool,
    fingerprint: Option<Fingerprint>,
    /// Path after the event took effect
    path: Option<MirrorPath>,
    is_directory: bool,
}

/// What the remote batch says about one key
#[derive(Debug, Clone)]
struct RemoteView {
    present: bool,
    fingerprint: Option<Fingerprint>,
    path: Option<MirrorPath>,
    is_directory: bool,
}

// ============================================================================
// reconcile
// ============================================================================

/// Compute the work needed to converge both sides of the mirror
///
/// Pure: the only inputs are the snapshot, the two settled batches, and
/// the cycle timestamp.
#[must_use]
pub fn reconcile(
    snapshot: &[Item],
    local_batch: &[ChangeEvent],
    remote_batch: &[ChangeEvent],
    now: DateTime<Utc>,
) -> ReconcileOutcome {
    let mut cycle = Cycle::new(snapshot, now);
    cycle.run(local_batch, remote_batch);
    cycle.finish()
}

/// Working state of one reconciliation cycle
struct Cycle<'a> {
    now: DateTime<Utc>,
    by_key: HashMap<ItemKey, &'a Item>,
    by_path: HashMap<&'a MirrorPath, &'a Item>,
    /// Which key currently owns each local path; the collision guard
    occupancy: HashMap<MirrorPath, ItemKey>,
    /// Operations paired with the path depth used for final ordering
    ops: Vec<(SyncOperation, usize)>,
    item_updates: Vec<Item>,
    conflicts: Vec<Conflict>,
    removals: Vec<ItemKey>,
}

impl<'a> Cycle<'a> {
    fn new(snapshot: &'a [Item], now: DateTime<Utc>) -> Self {
        let mut by_key = HashMap::new();
        let mut by_path = HashMap::new();
        let mut occupancy = HashMap::new();

        for item in snapshot {
            by_key.insert(item.key(), item);
            if let Some(path) = item.local_path() {
                if !item.is_tombstoned() {
                    by_path.insert(path, item);
                    occupancy.insert(path.clone(), item.key());
                }
            }
        }

        Self {
            now,
            by_key,
            by_path,
            occupancy,
            ops: Vec::new(),
            item_updates: Vec::new(),
            conflicts: Vec::new(),
            removals: Vec::new(),
        }
    }

    fn run(&mut self, local_batch: &[ChangeEvent], remote_batch: &[ChangeEvent]) {
        let local_batch = self.pair_local_renames(local_batch);

        let mut local_views: HashMap<ItemKey, LocalView> = HashMap::new();
        for event in &local_batch {
            let (key, view) = self.local_view(event);
            local_views.insert(key, view);
        }

        let mut remote_views: HashMap<ItemKey, RemoteView> = HashMap::new();
        for event in remote_batch {
            if event.origin != Origin::Remote {
                continue;
            }
            remote_views.insert(
                event.key.clone(),
                RemoteView {
                    present: !event.is_deletion(),
                    fingerprint: event.fingerprint.clone(),
                    path: event.path.clone(),
                    is_directory: event.is_directory,
                },
            );
        }

        // Deterministic processing order.
        let mut keys: Vec<ItemKey> = local_views
            .keys()
            .chain(remote_views.keys())
            .cloned()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        keys.sort_by_key(ItemKey::to_token);

        // Reserve local creations that pair with an untracked remote item
        // at the same path, so the remote side's handler adopts them
        // instead of each side spawning its own item.
        let mut consumed_local: HashSet<ItemKey> = HashSet::new();
        for (key, view) in &remote_views {
            if !view.present || self.by_key.contains_key(key) {
                continue;
            }
            if let Some(path) = &view.path {
                let path_key = ItemKey::Path(path.clone());
                if local_views.contains_key(&path_key) && !self.by_key.contains_key(&path_key) {
                    consumed_local.insert(path_key);
                }
            }
        }

        for key in keys {
            if consumed_local.contains(&key) {
                continue;
            }

            let baseline = self.by_key.get(&key).copied();
            let local = local_views.get(&key).cloned();
            let remote = remote_views.get(&key).cloned();

            match baseline {
                Some(item) => self.decide_tracked(&key, item, local, remote),
                None => {
                    self.decide_untracked(&key, local, remote, &local_views, &mut consumed_local)
                }
            }
        }
    }

    fn finish(self) -> ReconcileOutcome {
        let mut ops = self.ops;
        ops.sort_by(|(a, da), (b, db)| {
            let ka = (op_class(a.kind), depth_rank(a.kind, *da), a.key.to_token());
            let kb = (op_class(b.kind), depth_rank(b.kind, *db), b.key.to_token());
            ka.cmp(&kb)
        });

        ReconcileOutcome {
            operations: ops.into_iter().map(|(op, _)| op).collect(),
            item_updates: self.item_updates,
            conflicts: self.conflicts,
            removals: self.removals,
        }
    }

    // ------------------------------------------------------------------
    // Event normalization
    // ------------------------------------------------------------------

    /// Turn same-batch disappear/appear pairs with matching fingerprints
    /// into rename events, so a moved file is not deleted and re-uploaded
    fn pair_local_renames(&self, events: &[ChangeEvent]) -> Vec<ChangeEvent> {
        let mut deletions: Vec<(usize, MirrorPath, Option<Fingerprint>, bool)> = Vec::new();
        for (idx, event) in events.iter().enumerate() {
            if event.kind == ChangeKind::Deleted {
                if let Some(path) = &event.path {
                    let baseline = self.by_path.get(path);
                    deletions.push((
                        idx,
                        path.clone(),
                        baseline.and_then(|i| i.local_fingerprint().cloned()),
                        baseline.map(|i| i.is_directory()).unwrap_or(false),
                    ));
                }
            }
        }

        let mut paired_deletions: HashSet<usize> = HashSet::new();
        let mut result = Vec::with_capacity(events.len());

        for event in events {
            if event.kind == ChangeKind::Created {
                if let (Some(to), Some(fp)) = (&event.path, &event.fingerprint) {
                    let matched = deletions.iter().find(|(idx, _, del_fp, del_dir)| {
                        !paired_deletions.contains(idx)
                            && del_fp.as_ref() == Some(fp)
                            && *del_dir == event.is_directory
                    });
                    if let Some((idx, from, _, _)) = matched {
                        debug!(from = %from, to = %to, "paired local delete+create into rename");
                        paired_deletions.insert(*idx);
                        result.push(ChangeEvent::local_renamed(
                            from.clone(),
                            to.clone(),
                            Some(fp.clone()),
                            event.is_directory,
                        ));
                        continue;
                    }
                }
            }
            result.push(event.clone());
        }

        // Drop the deletion halves of paired renames, preserving order.
        let mut out = Vec::with_capacity(result.len());
        for (idx, event) in result.into_iter().enumerate() {
            if event.kind == ChangeKind::Deleted && paired_deletions.contains(&idx) {
                continue;
            }
            out.push(event);
        }
        out
    }

    /// Resolve a local event to its canonical key and view
    fn local_view(&self, event: &ChangeEvent) -> (ItemKey, LocalView) {
        // Local events are path-keyed; map them onto the tracked item's
        // key when the path is already known to the store.
        let lookup_path = event.old_path.as_ref().or(event.path.as_ref());
        let key = lookup_path
            .and_then(|p| self.by_path.get(p))
            .map(|item| item.key())
            .unwrap_or_else(|| event.key.clone());

        let view = match event.kind {
            ChangeKind::Deleted => LocalView {
                present: false,
                fingerprint: None,
                path: event.path.clone(),
                is_directory: event.is_directory,
            },
            _ => LocalView {
                present: true,
                fingerprint: event.fingerprint.clone(),
                path: event.path.clone(),
                is_directory: event.is_directory,
            },
        };
        (key, view)
    }

    // ------------------------------------------------------------------
    // Decision table: tracked items
    // ------------------------------------------------------------------

    fn decide_tracked(
        &mut self,
        key: &ItemKey,
        baseline: &Item,
        local: Option<LocalView>,
        remote: Option<RemoteView>,
    ) {
        // Conflicted items are frozen until explicitly resolved.
        if baseline.sync_state() == SyncState::Conflicted {
            debug!(key = %key, "skipping conflicted item");
            return;
        }

        let local_deleted = local.as_ref().is_some_and(|v| !v.present);
        let remote_deleted = remote.as_ref().is_some_and(|v| !v.present);

        let observed_local = match &local {
            Some(v) if v.present => v.fingerprint.clone(),
            Some(_) => None,
            None => baseline.local_fingerprint().cloned(),
        };
        let observed_remote = match &remote {
            Some(v) if v.present => v.fingerprint.clone(),
            Some(_) => None,
            None => baseline.remote_fingerprint().cloned(),
        };

        let local_changed = local.as_ref().is_some_and(|v| {
            v.present && v.fingerprint.as_ref() != baseline.local_fingerprint()
        });
        let remote_changed = remote.as_ref().is_some_and(|v| {
            v.present && v.fingerprint.as_ref() != baseline.remote_fingerprint()
        });

        let local_rename_target = local.as_ref().and_then(|v| {
            (v.present && v.path.is_some() && v.path.as_ref() != baseline.local_path())
                .then(|| v.path.clone())
                .flatten()
        });
        let remote_rename_target = remote.as_ref().and_then(|v| {
            (v.present && v.path.is_some() && v.path.as_ref() != baseline.local_path())
                .then(|| v.path.clone())
                .flatten()
        });

        // --- Deletions -------------------------------------------------

        if local_deleted && remote_deleted {
            debug!(key = %key, "deleted on both sides, dropping tombstone");
            self.release_path(baseline.local_path());
            self.removals.push(key.clone());
            return;
        }

        if local_deleted {
            // A deletion racing an unseen or in-flight remote edit must
            // not propagate; the edit wins by surfacing as a conflict.
            if remote_changed
                || remote_rename_target.is_some()
                || baseline.sync_state() == SyncState::PendingPull
            {
                self.flag_conflict(
                    key,
                    Some(baseline),
                    ConflictReason::EditDelete,
                    None,
                    observed_remote,
                );
                return;
            }

            self.release_path(baseline.local_path());
            let mut item = baseline.clone();
            item.set_tombstoned(true);
            item.set_local_fingerprint(None);

            if baseline.remote_id().is_some() {
                if self.transition(&mut item, SyncState::PendingPush).is_err() {
                    return;
                }
                let depth = path_depth(baseline.local_path());
                self.item_updates.push(item);
                self.ops.push((
                    SyncOperation::delete_remote(
                        key.clone(),
                        baseline.remote_fingerprint().cloned(),
                    ),
                    depth,
                ));
            } else {
                // Never uploaded; nothing to delete remotely.
                self.removals.push(key.clone());
            }
            return;
        }

        if remote_deleted {
            if local_changed
                || local_rename_target.is_some()
                || baseline.sync_state() == SyncState::PendingPush
            {
                self.flag_conflict(
                    key,
                    Some(baseline),
                    ConflictReason::EditDelete,
                    observed_local,
                    None,
                );
                return;
            }

            let mut item = baseline.clone();
            item.set_tombstoned(true);
            item.set_remote_fingerprint(None);
            if self.transition(&mut item, SyncState::PendingPull).is_err() {
                return;
            }
            let depth = path_depth(baseline.local_path());
            self.item_updates.push(item);
            self.ops
                .push((SyncOperation::delete_local(key.clone()), depth));
            return;
        }

        // --- Renames ---------------------------------------------------

        let mut item = baseline.clone();
        let mut dirty = false;

        if let Some(target) = &remote_rename_target {
            if let Some(occupant) = self.occupancy.get(target) {
                if occupant != key {
                    self.flag_conflict(
                        key,
                        Some(baseline),
                        ConflictReason::NameCollision,
                        observed_local,
                        observed_remote,
                    );
                    return;
                }
            }
            if self.transition(&mut item, SyncState::PendingPull).is_err() {
                return;
            }
            dirty = true;
            self.release_path(baseline.local_path());
            self.occupancy.insert(target.clone(), key.clone());
            self.ops.push((
                SyncOperation::rename_local(key.clone(), target.clone()),
                target.depth(),
            ));
        } else if let Some(target) = &local_rename_target {
            self.release_path(baseline.local_path());
            self.occupancy.insert(target.clone(), key.clone());
            item.set_local_path(target.clone());
            dirty = true;

            if baseline.remote_id().is_some() {
                if self.transition(&mut item, SyncState::PendingPush).is_err() {
                    return;
                }
                self.ops.push((
                    SyncOperation::rename_remote(key.clone(), target.clone()),
                    target.depth(),
                ));
            }
        }

        // --- Content ---------------------------------------------------

        match (local_changed, remote_changed) {
            (false, false) => {
                if dirty {
                    self.item_updates.push(item);
                }
            }

            (true, false) => {
                // An unpulled remote revision is still pending; a local
                // edit on top of it diverges both sides.
                if baseline.sync_state() == SyncState::PendingPull {
                    self.flag_conflict(
                        key,
                        Some(baseline),
                        ConflictReason::BothEdited,
                        observed_local,
                        observed_remote,
                    );
                    return;
                }
                item.set_local_fingerprint(observed_local.clone());
                if self.transition(&mut item, SyncState::PendingPush).is_err() {
                    return;
                }
                let depth = path_depth(item.local_path());
                self.item_updates.push(item);
                self.ops
                    .push((SyncOperation::upload(key.clone(), observed_local), depth));
            }

            (false, true) => {
                if baseline.sync_state() == SyncState::PendingPush {
                    self.flag_conflict(
                        key,
                        Some(baseline),
                        ConflictReason::BothEdited,
                        observed_local,
                        observed_remote,
                    );
                    return;
                }
                item.set_remote_fingerprint(observed_remote.clone());
                if self.transition(&mut item, SyncState::PendingPull).is_err() {
                    return;
                }
                let depth = path_depth(item.local_path());
                self.item_updates.push(item);
                self.ops
                    .push((SyncOperation::download(key.clone(), observed_remote), depth));
            }

            (true, true) => {
                if observed_local == observed_remote {
                    // Same content arrived both ways; nothing to transfer.
                    item.set_local_fingerprint(observed_local);
                    item.set_remote_fingerprint(observed_remote);
                    if item.mark_synced(self.now).is_err() {
                        return;
                    }
                    self.item_updates.push(item);
                } else {
                    self.flag_conflict(
                        key,
                        Some(baseline),
                        ConflictReason::BothEdited,
                        observed_local,
                        observed_remote,
                    );
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Decision table: untracked keys
    // ------------------------------------------------------------------

    fn decide_untracked(
        &mut self,
        key: &ItemKey,
        local: Option<LocalView>,
        remote: Option<RemoteView>,
        local_views: &HashMap<ItemKey, LocalView>,
        consumed_local: &mut HashSet<ItemKey>,
    ) {
        if let Some(rv) = remote {
            if !rv.present {
                // Deletion of an item we never tracked.
                debug!(key = %key, "ignoring deletion of untracked remote item");
                return;
            }
            let Some(path) = rv.path.clone() else {
                warn!(key = %key, "remote item without a path, skipping");
                return;
            };

            // Adoption: a local counterpart with identical content means
            // both sides already agree and no bytes need to move.
            let local_candidate = local_views
                .get(&ItemKey::Path(path.clone()))
                .filter(|v| v.present)
                .map(|v| (ItemKey::Path(path.clone()), v.fingerprint.clone()))
                .or_else(|| {
                    self.by_path
                        .get(&path)
                        .filter(|item| item.remote_id().is_none())
                        .map(|item| (item.key(), item.local_fingerprint().cloned()))
                });

            let ItemKey::Remote(remote_id) = key else {
                warn!(key = %key, "remote view under a path key, skipping");
                return;
            };

            if let Some((local_key, local_fp)) = local_candidate {
                consumed_local.insert(local_key);
                if local_fp == rv.fingerprint {
                    debug!(key = %key, path = %path, "adopting identical local and remote item");
                    let mut item = Item::new_remote(
                        remote_id.clone(),
                        path.clone(),
                        rv.fingerprint.clone(),
                        rv.is_directory,
                    );
                    item.set_local_fingerprint(local_fp);
                    if item.mark_synced(self.now).is_err() {
                        return;
                    }
                    self.occupancy.insert(path, key.clone());
                    self.item_updates.push(item);
                } else {
                    // Both sides created the same path with different
                    // content; there is no baseline to prefer.
                    let mut item = Item::new_remote(
                        remote_id.clone(),
                        path.clone(),
                        rv.fingerprint.clone(),
                        rv.is_directory,
                    );
                    item.set_local_fingerprint(local_fp.clone());
                    self.conflict_record(
                        key,
                        Some(path.clone()),
                        ConflictReason::BothEdited,
                        local_fp,
                        rv.fingerprint,
                    );
                    if self.transition(&mut item, SyncState::Conflicted).is_err() {
                        return;
                    }
                    self.occupancy.insert(path, key.clone());
                    self.item_updates.push(item);
                }
                return;
            }

            // Collision guard: the path is already owned by a different
            // item (duplicate remote names). Flag, never overwrite.
            if let Some(occupant) = self.occupancy.get(&path) {
                if occupant != key {
                    warn!(key = %key, path = %path, occupant = %occupant, "local path already occupied");
                    let mut item = Item::from_parts(
                        Some(remote_id.clone()),
                        None,
                        None,
                        rv.fingerprint.clone(),
                        rv.is_directory,
                        false,
                        SyncState::PendingPull,
                        None,
                    );
                    self.conflict_record(
                        key,
                        Some(path),
                        ConflictReason::NameCollision,
                        None,
                        rv.fingerprint,
                    );
                    if self.transition(&mut item, SyncState::Conflicted).is_err() {
                        return;
                    }
                    self.item_updates.push(item);
                    return;
                }
            }

            let item = Item::new_remote(
                remote_id.clone(),
                path.clone(),
                rv.fingerprint.clone(),
                rv.is_directory,
            );
            self.occupancy.insert(path.clone(), key.clone());
            self.item_updates.push(item);
            self.ops.push((
                SyncOperation::download(key.clone(), rv.fingerprint),
                path.depth(),
            ));
            return;
        }

        if let Some(lv) = local {
            if !lv.present {
                debug!(key = %key, "ignoring deletion of untracked local path");
                return;
            }
            let Some(path) = lv.path.clone() else {
                return;
            };

            let item = Item::new_local(path.clone(), lv.fingerprint.clone(), lv.is_directory);
            self.occupancy.insert(path.clone(), ItemKey::Path(path.clone()));
            self.item_updates.push(item);
            self.ops.push((
                SyncOperation::upload(ItemKey::Path(path.clone()), lv.fingerprint),
                path.depth(),
            ));
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    /// Emit a conflict: the record, the frozen item, and the marker op
    fn flag_conflict(
        &mut self,
        key: &ItemKey,
        baseline: Option<&Item>,
        reason: ConflictReason,
        local_fp: Option<Fingerprint>,
        remote_fp: Option<Fingerprint>,
    ) {
        let path = baseline.and_then(|i| i.local_path().cloned());
        self.conflict_record(key, path, reason, local_fp.clone(), remote_fp.clone());

        if let Some(baseline) = baseline {
            let mut item = baseline.clone();
            item.set_local_fingerprint(local_fp);
            item.set_remote_fingerprint(remote_fp);
            if self.transition(&mut item, SyncState::Conflicted).is_err() {
                return;
            }
            self.item_updates.push(item);
        }
    }

    fn conflict_record(
        &mut self,
        key: &ItemKey,
        path: Option<MirrorPath>,
        reason: ConflictReason,
        local_fp: Option<Fingerprint>,
        remote_fp: Option<Fingerprint>,
    ) {
        warn!(key = %key, reason = %reason, "conflict detected");
        self.conflicts.push(Conflict::new(
            key.clone(),
            path,
            reason,
            VersionInfo {
                fingerprint: local_fp,
                modified_at: None,
            },
            VersionInfo {
                fingerprint: remote_fp,
                modified_at: None,
            },
        ));
        self.ops
            .push((SyncOperation::flag_conflict(key.clone()), 0));
    }

    fn transition(&self, item: &mut Item, target: SyncState) -> Result<(), ()> {
        match item.transition_to(target) {
            Ok(()) => Ok(()),
            Err(err) => {
                // Conflicted items were filtered at entry, so this only
                // fires on a logic regression.
                warn!(key = %item.key(), error = %err, "rejected state transition");
                Err(())
            }
        }
    }

    fn release_path(&mut self, path: Option<&MirrorPath>) {
        if let Some(path) = path {
            self.occupancy.remove(path);
        }
    }
}

/// Ordering group: renames, then creations, then deletions, conflicts last
fn op_class(kind: OperationKind) -> u8 {
    match kind {
        OperationKind::RenameLocal | OperationKind::RenameRemote => 0,
        OperationKind::Upload | OperationKind::Download => 1,
        OperationKind::DeleteLocal | OperationKind::DeleteRemote => 2,
        OperationKind::FlagConflict => 3,
    }
}

/// Depth rank inside a class: creations parents-first, deletions
/// children-first
fn depth_rank(kind: OperationKind, depth: usize) -> i64 {
    match kind {
        OperationKind::DeleteLocal | OperationKind::DeleteRemote => -(depth as i64),
        _ => depth as i64,
    }
}

fn path_depth(path: Option<&MirrorPath>) -> usize {
    path.map(MirrorPath::depth).unwrap_or(0)
}

// ============================================================================
// Unit tests
// ============================================================================
