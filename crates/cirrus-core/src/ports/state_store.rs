//! Metadata store port (driven/secondary port)
//!
//! Durable state behind the engine: tracked items (the reconciliation
//! baseline), the remote change cursor, the transfer queue, and conflict
//! records.
//!
//! ## Design Notes
//!
//! - Uses `anyhow::Result` because storage errors are adapter-specific.
//! - The store enforces both uniqueness invariants: at most one item per
//!   `remote_id` and at most one per `local_path`.
//! - [`complete_operation`](IStateStore::complete_operation) commits the
//!   queue row and the item baseline in a single transaction, so a crash
//!   between the two can never record a transfer without its baseline (or
//!   the reverse).
//! - [`next_operations`](IStateStore::next_operations) is FIFO per item
//!   key: it returns at most one operation per key and skips keys that
//!   already have a running operation.

use crate::domain::conflict::{Conflict, Resolution};
use crate::domain::item::{Item, ItemKey};
use crate::domain::newtypes::{ConflictId, Cursor, MirrorPath, RemoteId};
use crate::domain::operation::SyncOperation;

/// Port trait for the durable metadata store
#[async_trait::async_trait]
pub trait IStateStore: Send + Sync {
    // ------------------------------------------------------------------
    // Items
    // ------------------------------------------------------------------

    /// Look up an item by its remote identifier
    async fn get_by_remote_id(&self, id: &RemoteId) -> anyhow::Result<Option<Item>>;

    /// Look up an item by its local path
    async fn get_by_path(&self, path: &MirrorPath) -> anyhow::Result<Option<Item>>;

    /// Look up an item by reconciliation key
    async fn get_item(&self, key: &ItemKey) -> anyhow::Result<Option<Item>> {
        match key {
            ItemKey::Remote(id) => self.get_by_remote_id(id).await,
            ItemKey::Path(path) => self.get_by_path(path).await,
        }
    }

    /// Insert or update an item
    ///
    /// Matches an existing row by `remote_id` when present, else by
    /// `local_path`. Violating either uniqueness invariant is an error.
    async fn put_item(&self, item: &Item) -> anyhow::Result<()>;

    /// Remove an item from tracking
    async fn delete_item(&self, key: &ItemKey) -> anyhow::Result<()>;

    /// All tracked items
    async fn scan(&self) -> anyhow::Result<Vec<Item>>;

    // ------------------------------------------------------------------
    // Cursor
    // ------------------------------------------------------------------

    /// Last persisted remote change cursor, if any
    async fn load_cursor(&self) -> anyhow::Result<Option<Cursor>>;

    /// Persist the remote change cursor
    async fn save_cursor(&self, cursor: &Cursor) -> anyhow::Result<()>;

    // ------------------------------------------------------------------
    // Transfer queue
    // ------------------------------------------------------------------

    /// Append an operation to the durable queue; returns its id
    async fn enqueue_operation(&self, op: &SyncOperation) -> anyhow::Result<i64>;

    /// Next executable operations, oldest first
    ///
    /// At most one operation per item key, skipping keys with a running
    /// operation. Returns at most `limit` operations.
    async fn next_operations(&self, limit: u32) -> anyhow::Result<Vec<SyncOperation>>;

    /// Mark an operation as running
    async fn mark_running(&self, op_id: i64) -> anyhow::Result<()>;

    /// Commit a completed operation together with the updated item
    async fn complete_operation(&self, op_id: i64, updated_item: &Item) -> anyhow::Result<()>;

    /// Commit a completed operation that removed the item from tracking
    async fn complete_operation_removing(&self, op_id: i64, key: &ItemKey) -> anyhow::Result<()>;

    /// Record a failed attempt
    ///
    /// Non-terminal failures return the operation to `pending` with the
    /// updated attempt count; terminal failures park it as `failed`.
    async fn fail_operation(&self, op_id: i64, attempts: u32, terminal: bool)
        -> anyhow::Result<()>;

    /// Drop an operation whose precondition went stale
    async fn discard_operation(&self, op_id: i64) -> anyhow::Result<()>;

    /// Reset any `running` operations back to `pending`
    ///
    /// Called once at startup: operations interrupted by a crash must run
    /// again.
    async fn requeue_interrupted(&self) -> anyhow::Result<u64>;

    /// Number of pending operations
    async fn pending_count(&self) -> anyhow::Result<u64>;

    /// Operations parked as terminally failed
    async fn failed_operations(&self) -> anyhow::Result<Vec<SyncOperation>>;

    // ------------------------------------------------------------------
    // Conflicts
    // ------------------------------------------------------------------

    /// Record a detected conflict
    async fn put_conflict(&self, conflict: &Conflict) -> anyhow::Result<()>;

    /// All conflicts awaiting resolution
    async fn unresolved_conflicts(&self) -> anyhow::Result<Vec<Conflict>>;

    /// Look up the unresolved conflict for an item, if any
    async fn conflict_for_key(&self, key: &ItemKey) -> anyhow::Result<Option<Conflict>>;

    /// Mark a conflict resolved with the user's choice
    async fn resolve_conflict_record(
        &self,
        id: &ConflictId,
        resolution: Resolution,
    ) -> anyhow::Result<()>;
}
