//! SQLite implementation of IStateStore
//!
//! Concrete SQLite-based implementation of the metadata store port defined
//! in cirrus-core. Handles all domain type serialization/deserialization
//! and SQL query construction.
//!
//! ## Type Mapping
//!
//! | Domain Type     | SQL Type | Strategy                                  |
//! |-----------------|----------|-------------------------------------------|
//! | RemoteId        | TEXT     | String via `.as_str()` / `RemoteId::new()`|
//! | MirrorPath      | TEXT     | String via `.as_str()` / `MirrorPath::new()` |
//! | Fingerprint     | TEXT     | String via `.as_str()` / `Fingerprint::new()` |
//! | Cursor          | TEXT     | String via `.as_str()` / `Cursor::new()`  |
//! | ItemKey         | TEXT     | Token form via `to_token()` / `from_token()` |
//! | SyncState       | TEXT     | `as_str()` / `parse()`                    |
//! | OperationKind   | TEXT     | `as_str()` / `parse()`                    |
//! | ConflictReason  | TEXT     | `as_str()` / `parse()`                    |
//! | VersionInfo     | TEXT     | serde_json serialization                  |
//! | DateTime<Utc>   | TEXT     | ISO 8601 via `to_rfc3339()`               |

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};

use cirrus_core::domain::{
    Conflict, ConflictId, ConflictReason, Cursor, Fingerprint, Item, ItemKey, MirrorPath,
    OperationKind, OperationState, RemoteId, Resolution, SyncOperation, SyncState, VersionInfo,
};
use cirrus_core::ports::IStateStore;

use crate::StoreError;

/// SQLite-based implementation of the metadata store port
///
/// Provides persistent storage for tracked items, the remote cursor, the
/// transfer queue, and conflict records. All operations go through a
/// connection pool for concurrency.
pub struct SqliteStateStore {
    pool: SqlitePool,
}

impl SqliteStateStore {
    /// Creates a new store instance with the given connection pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

// ============================================================================
// Helper functions for type conversion
// ============================================================================

/// Parse a DateTime<Utc> from an ISO 8601 string
fn parse_datetime(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            // SQLite default format has no timezone
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                .or_else(|_| chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S"))
                .map(|ndt| ndt.and_utc())
        })
        .map_err(|e| {
            StoreError::SerializationError(format!("Failed to parse datetime '{}': {}", s, e))
        })
}

/// Parse an optional DateTime<Utc> from an optional string
fn parse_optional_datetime(s: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    match s {
        Some(ref val) if !val.is_empty() => parse_datetime(val).map(Some),
        _ => Ok(None),
    }
}

fn parse_optional_fingerprint(s: Option<String>) -> Result<Option<Fingerprint>, StoreError> {
    match s {
        Some(val) => Fingerprint::new(val)
            .map(Some)
            .map_err(|e| StoreError::SerializationError(e.to_string())),
        None => Ok(None),
    }
}

fn parse_optional_path(s: Option<String>) -> Result<Option<MirrorPath>, StoreError> {
    match s {
        Some(val) => MirrorPath::new(val)
            .map(Some)
            .map_err(|e| StoreError::SerializationError(e.to_string())),
        None => Ok(None),
    }
}

/// Map a sqlx error, surfacing UNIQUE index violations distinctly
fn map_write_error(e: sqlx::Error) -> StoreError {
    let message = e.to_string();
    if message.contains("UNIQUE constraint failed") {
        StoreError::UniquenessViolation(message)
    } else {
        StoreError::QueryFailed(message)
    }
}

// ============================================================================
// Row mapping functions
// ============================================================================

/// Reconstruct an Item from a database row
fn item_from_row(row: &SqliteRow) -> Result<Item, StoreError> {
    let remote_id_str: Option<String> = row.get("remote_id");
    let local_path_str: Option<String> = row.get("local_path");
    let local_fp_str: Option<String> = row.get("local_fingerprint");
    let remote_fp_str: Option<String> = row.get("remote_fingerprint");
    let is_directory: i64 = row.get("is_directory");
    let tombstoned: i64 = row.get("tombstoned");
    let state_str: String = row.get("sync_state");
    let last_synced_str: Option<String> = row.get("last_synced");

    let remote_id = match remote_id_str {
        Some(id) => Some(
            RemoteId::new(id).map_err(|e| StoreError::SerializationError(e.to_string()))?,
        ),
        None => None,
    };

    Ok(Item::from_parts(
        remote_id,
        parse_optional_path(local_path_str)?,
        parse_optional_fingerprint(local_fp_str)?,
        parse_optional_fingerprint(remote_fp_str)?,
        is_directory != 0,
        tombstoned != 0,
        SyncState::parse(&state_str)
            .map_err(|e| StoreError::SerializationError(e.to_string()))?,
        parse_optional_datetime(last_synced_str)?,
    ))
}

/// Reconstruct a SyncOperation from a database row
fn operation_from_row(row: &SqliteRow) -> Result<SyncOperation, StoreError> {
    let id: i64 = row.get("id");
    let key_str: String = row.get("item_key");
    let kind_str: String = row.get("kind");
    let state_str: String = row.get("state");
    let expected_local: Option<String> = row.get("expected_local");
    let expected_remote: Option<String> = row.get("expected_remote");
    let target_path: Option<String> = row.get("target_path");
    let attempts: i64 = row.get("attempts");

    Ok(SyncOperation {
        id,
        kind: OperationKind::parse(&kind_str)
            .map_err(|e| StoreError::SerializationError(e.to_string()))?,
        key: ItemKey::from_token(&key_str)
            .map_err(|e| StoreError::SerializationError(e.to_string()))?,
        expected_local: parse_optional_fingerprint(expected_local)?,
        expected_remote: parse_optional_fingerprint(expected_remote)?,
        target_path: parse_optional_path(target_path)?,
        attempts: attempts as u32,
        state: OperationState::parse(&state_str)
            .map_err(|e| StoreError::SerializationError(e.to_string()))?,
    })
}

/// Reconstruct a Conflict from a database row
fn conflict_from_row(row: &SqliteRow) -> Result<Conflict, StoreError> {
    let id_str: String = row.get("id");
    let key_str: String = row.get("item_key");
    let path_str: Option<String> = row.get("path");
    let reason_str: String = row.get("reason");
    let detected_at_str: String = row.get("detected_at");
    let local_version: String = row.get("local_version");
    let remote_version: String = row.get("remote_version");
    let resolution_str: Option<String> = row.get("resolution");
    let resolved_at_str: Option<String> = row.get("resolved_at");

    let id: ConflictId = id_str
        .parse()
        .map_err(|e: cirrus_core::domain::DomainError| {
            StoreError::SerializationError(e.to_string())
        })?;

    let local: VersionInfo = serde_json::from_str(&local_version)
        .map_err(|e| StoreError::SerializationError(format!("Invalid local version: {}", e)))?;
    let remote: VersionInfo = serde_json::from_str(&remote_version)
        .map_err(|e| StoreError::SerializationError(format!("Invalid remote version: {}", e)))?;

    let resolution = match resolution_str {
        Some(ref s) => Some(
            Resolution::parse(s).map_err(|e| StoreError::SerializationError(e.to_string()))?,
        ),
        None => None,
    };

    Ok(Conflict {
        id,
        key: ItemKey::from_token(&key_str)
            .map_err(|e| StoreError::SerializationError(e.to_string()))?,
        path: parse_optional_path(path_str)?,
        reason: ConflictReason::parse(&reason_str)
            .map_err(|e| StoreError::SerializationError(e.to_string()))?,
        detected_at: parse_datetime(&detected_at_str)?,
        local,
        remote,
        resolution,
        resolved_at: parse_optional_datetime(resolved_at_str)?,
    })
}

// ============================================================================
// Item upsert (shared between put_item and transactional completion)
// ============================================================================

/// Insert or update an item on the given connection
///
/// Matches an existing row by `remote_id` first, then by `local_path`, so
/// a local-only item adopted by the remote (remote_id newly assigned)
/// updates its existing row instead of violating the path index.
async fn upsert_item(conn: &mut SqliteConnection, item: &Item) -> Result<(), StoreError> {
    let remote_id = item.remote_id().map(|id| id.as_str().to_string());
    let local_path = item.local_path().map(|p| p.as_str().to_string());
    let local_fp = item.local_fingerprint().map(|f| f.as_str().to_string());
    let remote_fp = item.remote_fingerprint().map(|f| f.as_str().to_string());
    let last_synced = item.last_synced().map(|dt| dt.to_rfc3339());

    let mut existing: Option<i64> = None;
    if let Some(ref id) = remote_id {
        existing = sqlx::query_scalar("SELECT rowid_pk FROM items WHERE remote_id = ?")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;
    }
    if existing.is_none() {
        if let Some(ref path) = local_path {
            existing = sqlx::query_scalar("SELECT rowid_pk FROM items WHERE local_path = ?")
                .bind(path)
                .fetch_optional(&mut *conn)
                .await?;
        }
    }

    match existing {
        Some(rowid) => {
            sqlx::query(
                "UPDATE items SET remote_id = ?, local_path = ?, local_fingerprint = ?, \
                 remote_fingerprint = ?, is_directory = ?, tombstoned = ?, sync_state = ?, \
                 last_synced = ? WHERE rowid_pk = ?",
            )
            .bind(&remote_id)
            .bind(&local_path)
            .bind(&local_fp)
            .bind(&remote_fp)
            .bind(item.is_directory() as i64)
            .bind(item.is_tombstoned() as i64)
            .bind(item.sync_state().as_str())
            .bind(&last_synced)
            .bind(rowid)
            .execute(&mut *conn)
            .await
            .map_err(map_write_error)?;
        }
        None => {
            sqlx::query(
                "INSERT INTO items (remote_id, local_path, local_fingerprint, \
                 remote_fingerprint, is_directory, tombstoned, sync_state, last_synced) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&remote_id)
            .bind(&local_path)
            .bind(&local_fp)
            .bind(&remote_fp)
            .bind(item.is_directory() as i64)
            .bind(item.is_tombstoned() as i64)
            .bind(item.sync_state().as_str())
            .bind(&last_synced)
            .execute(&mut *conn)
            .await
            .map_err(map_write_error)?;
        }
    }

    Ok(())
}

async fn delete_item_on(conn: &mut SqliteConnection, key: &ItemKey) -> Result<(), StoreError> {
    match key {
        ItemKey::Remote(id) => {
            sqlx::query("DELETE FROM items WHERE remote_id = ?")
                .bind(id.as_str())
                .execute(conn)
                .await?;
        }
        ItemKey::Path(path) => {
            sqlx::query("DELETE FROM items WHERE local_path = ?")
                .bind(path.as_str())
                .execute(conn)
                .await?;
        }
    }
    Ok(())
}

// ============================================================================
// IStateStore implementation
// ============================================================================

#[async_trait::async_trait]
impl IStateStore for SqliteStateStore {
    // ------------------------------------------------------------------
    // Items
    // ------------------------------------------------------------------

    async fn get_by_remote_id(&self, id: &RemoteId) -> anyhow::Result<Option<Item>> {
        let row = sqlx::query("SELECT * FROM items WHERE remote_id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::from)?;

        row.as_ref().map(item_from_row).transpose().map_err(Into::into)
    }

    async fn get_by_path(&self, path: &MirrorPath) -> anyhow::Result<Option<Item>> {
        let row = sqlx::query("SELECT * FROM items WHERE local_path = ?")
            .bind(path.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::from)?;

        row.as_ref().map(item_from_row).transpose().map_err(Into::into)
    }

    async fn put_item(&self, item: &Item) -> anyhow::Result<()> {
        let mut conn = self.pool.acquire().await.map_err(StoreError::from)?;
        upsert_item(&mut *conn, item).await?;
        Ok(())
    }

    async fn delete_item(&self, key: &ItemKey) -> anyhow::Result<()> {
        let mut conn = self.pool.acquire().await.map_err(StoreError::from)?;
        delete_item_on(&mut *conn, key).await?;
        Ok(())
    }

    async fn scan(&self) -> anyhow::Result<Vec<Item>> {
        let rows = sqlx::query("SELECT * FROM items ORDER BY rowid_pk")
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::from)?;

        rows.iter()
            .map(item_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    // ------------------------------------------------------------------
    // Cursor
    // ------------------------------------------------------------------

    async fn load_cursor(&self) -> anyhow::Result<Option<Cursor>> {
        let token: Option<String> = sqlx::query_scalar("SELECT token FROM cursor WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::from)?;

        match token {
            Some(t) => Ok(Some(
                Cursor::new(t).map_err(|e| StoreError::SerializationError(e.to_string()))?,
            )),
            None => Ok(None),
        }
    }

    async fn save_cursor(&self, cursor: &Cursor) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO cursor (id, token, saved_at) VALUES (1, ?, ?) \
             ON CONFLICT (id) DO UPDATE SET token = excluded.token, saved_at = excluded.saved_at",
        )
        .bind(cursor.as_str())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Transfer queue
    // ------------------------------------------------------------------

    async fn enqueue_operation(&self, op: &SyncOperation) -> anyhow::Result<i64> {
        let result = sqlx::query(
            "INSERT INTO operations (item_key, kind, state, expected_local, expected_remote, \
             target_path, attempts) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(op.key.to_token())
        .bind(op.kind.as_str())
        .bind(OperationState::Pending.as_str())
        .bind(op.expected_local.as_ref().map(|f| f.as_str().to_string()))
        .bind(op.expected_remote.as_ref().map(|f| f.as_str().to_string()))
        .bind(op.target_path.as_ref().map(|p| p.as_str().to_string()))
        .bind(op.attempts as i64)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;

        Ok(result.last_insert_rowid())
    }

    async fn next_operations(&self, limit: u32) -> anyhow::Result<Vec<SyncOperation>> {
        // Oldest pending operation per key, skipping keys that already
        // have something running. This is what makes the queue strictly
        // FIFO per item while still allowing cross-item parallelism.
        let rows = sqlx::query(
            "SELECT * FROM operations o \
             WHERE o.state = 'pending' \
               AND o.id = (SELECT MIN(id) FROM operations \
                           WHERE item_key = o.item_key AND state = 'pending') \
               AND NOT EXISTS (SELECT 1 FROM operations \
                               WHERE item_key = o.item_key AND state = 'running') \
             ORDER BY o.id \
             LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::from)?;

        rows.iter()
            .map(operation_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    async fn mark_running(&self, op_id: i64) -> anyhow::Result<()> {
        sqlx::query("UPDATE operations SET state = 'running' WHERE id = ?")
            .bind(op_id)
            .execute(&self.pool)
            .await
            .map_err(StoreError::from)?;
        Ok(())
    }

    async fn complete_operation(&self, op_id: i64, updated_item: &Item) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await.map_err(StoreError::from)?;

        sqlx::query("DELETE FROM operations WHERE id = ?")
            .bind(op_id)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::from)?;

        upsert_item(&mut *tx, updated_item).await?;

        tx.commit().await.map_err(StoreError::from)?;
        Ok(())
    }

    async fn complete_operation_removing(&self, op_id: i64, key: &ItemKey) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await.map_err(StoreError::from)?;

        sqlx::query("DELETE FROM operations WHERE id = ?")
            .bind(op_id)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::from)?;

        delete_item_on(&mut *tx, key).await?;

        tx.commit().await.map_err(StoreError::from)?;
        Ok(())
    }

    async fn fail_operation(
        &self,
        op_id: i64,
        attempts: u32,
        terminal: bool,
    ) -> anyhow::Result<()> {
        let state = if terminal {
            OperationState::Failed
        } else {
            OperationState::Pending
        };

        sqlx::query("UPDATE operations SET state = ?, attempts = ? WHERE id = ?")
            .bind(state.as_str())
            .bind(attempts as i64)
            .bind(op_id)
            .execute(&self.pool)
            .await
            .map_err(StoreError::from)?;
        Ok(())
    }

    async fn discard_operation(&self, op_id: i64) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM operations WHERE id = ?")
            .bind(op_id)
            .execute(&self.pool)
            .await
            .map_err(StoreError::from)?;
        Ok(())
    }

    async fn requeue_interrupted(&self) -> anyhow::Result<u64> {
        let result = sqlx::query("UPDATE operations SET state = 'pending' WHERE state = 'running'")
            .execute(&self.pool)
            .await
            .map_err(StoreError::from)?;
        Ok(result.rows_affected())
    }

    async fn pending_count(&self) -> anyhow::Result<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM operations WHERE state = 'pending'")
                .fetch_one(&self.pool)
                .await
                .map_err(StoreError::from)?;
        Ok(count as u64)
    }

    async fn failed_operations(&self) -> anyhow::Result<Vec<SyncOperation>> {
        let rows = sqlx::query("SELECT * FROM operations WHERE state = 'failed' ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::from)?;

        rows.iter()
            .map(operation_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    // ------------------------------------------------------------------
    // Conflicts
    // ------------------------------------------------------------------

    async fn put_conflict(&self, conflict: &Conflict) -> anyhow::Result<()> {
        let local_version = serde_json::to_string(&conflict.local)
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        let remote_version = serde_json::to_string(&conflict.remote)
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;

        sqlx::query(
            "INSERT OR REPLACE INTO conflicts \
             (id, item_key, path, reason, detected_at, local_version, remote_version, \
              resolution, resolved_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(conflict.id.to_string())
        .bind(conflict.key.to_token())
        .bind(conflict.path.as_ref().map(|p| p.as_str().to_string()))
        .bind(conflict.reason.as_str())
        .bind(conflict.detected_at.to_rfc3339())
        .bind(local_version)
        .bind(remote_version)
        .bind(conflict.resolution.map(|r| r.as_str().to_string()))
        .bind(conflict.resolved_at.map(|dt| dt.to_rfc3339()))
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(())
    }

    async fn unresolved_conflicts(&self) -> anyhow::Result<Vec<Conflict>> {
        let rows =
            sqlx::query("SELECT * FROM conflicts WHERE resolution IS NULL ORDER BY detected_at")
                .fetch_all(&self.pool)
                .await
                .map_err(StoreError::from)?;

        rows.iter()
            .map(conflict_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    async fn conflict_for_key(&self, key: &ItemKey) -> anyhow::Result<Option<Conflict>> {
        let row = sqlx::query(
            "SELECT * FROM conflicts WHERE item_key = ? AND resolution IS NULL \
             ORDER BY detected_at DESC LIMIT 1",
        )
        .bind(key.to_token())
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::from)?;

        row.as_ref()
            .map(conflict_from_row)
            .transpose()
            .map_err(Into::into)
    }

    async fn resolve_conflict_record(
        &self,
        id: &ConflictId,
        resolution: Resolution,
    ) -> anyhow::Result<()> {
        sqlx::query("UPDATE conflicts SET resolution = ?, resolved_at = ? WHERE id = ?")
            .bind(resolution.as_str())
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(StoreError::from)?;
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DatabasePool;

    fn path(s: &str) -> MirrorPath {
        MirrorPath::new(s.to_string()).unwrap()
    }

    fn fp(s: &str) -> Fingerprint {
        Fingerprint::new(s.to_string()).unwrap()
    }

    fn rid(s: &str) -> RemoteId {
        RemoteId::new(s.to_string()).unwrap()
    }

    async fn store() -> SqliteStateStore {
        let pool = DatabasePool::in_memory().await.unwrap();
        SqliteStateStore::new(pool.pool().clone())
    }

    mod item_tests {
        use super::*;

        #[tokio::test]
        async fn test_put_and_get_roundtrip() {
            let store = store().await;
            let mut item = Item::new_remote(rid("R1"), path("docs/a.txt"), Some(fp("rev1")), false);
            item.set_local_fingerprint(Some(fp("aabb")));
            item.mark_synced(Utc::now()).unwrap();

            store.put_item(&item).await.unwrap();

            let by_id = store.get_by_remote_id(&rid("R1")).await.unwrap().unwrap();
            assert_eq!(by_id.local_fingerprint(), Some(&fp("aabb")));
            assert_eq!(by_id.sync_state(), SyncState::Synced);
            assert!(by_id.last_synced().is_some());

            let by_path = store.get_by_path(&path("docs/a.txt")).await.unwrap().unwrap();
            assert_eq!(by_path.remote_id(), Some(&rid("R1")));
        }

        #[tokio::test]
        async fn test_put_updates_existing_row() {
            let store = store().await;
            let mut item = Item::new_remote(rid("R1"), path("a.txt"), Some(fp("rev1")), false);
            store.put_item(&item).await.unwrap();

            item.set_remote_fingerprint(Some(fp("rev2")));
            item.transition_to(SyncState::PendingPull).unwrap();
            store.put_item(&item).await.unwrap();

            let items = store.scan().await.unwrap();
            assert_eq!(items.len(), 1);
            assert_eq!(items[0].remote_fingerprint(), Some(&fp("rev2")));
        }

        #[tokio::test]
        async fn test_adoption_reuses_local_only_row() {
            // A local-only item later adopted by the remote must update in
            // place, not insert a second row for the same path.
            let store = store().await;
            let local = Item::new_local(path("a.txt"), Some(fp("h1")), false);
            store.put_item(&local).await.unwrap();

            let mut adopted = local.clone();
            adopted.set_remote_id(rid("R1"));
            adopted.set_remote_fingerprint(Some(fp("rev1")));
            store.put_item(&adopted).await.unwrap();

            let items = store.scan().await.unwrap();
            assert_eq!(items.len(), 1);
            assert_eq!(items[0].remote_id(), Some(&rid("R1")));
        }

        #[tokio::test]
        async fn test_duplicate_path_rejected() {
            let store = store().await;
            store
                .put_item(&Item::new_remote(rid("R1"), path("a.txt"), Some(fp("r1")), false))
                .await
                .unwrap();

            // Different remote id claiming the same local path
            let result = store
                .put_item(&Item::new_remote(rid("R2"), path("a.txt"), Some(fp("r2")), false))
                .await;
            assert!(result.is_err());
        }

        #[tokio::test]
        async fn test_delete_item_by_key() {
            let store = store().await;
            store
                .put_item(&Item::new_local(path("a.txt"), Some(fp("h1")), false))
                .await
                .unwrap();

            store
                .delete_item(&ItemKey::Path(path("a.txt")))
                .await
                .unwrap();
            assert!(store.scan().await.unwrap().is_empty());
        }
    }

    mod cursor_tests {
        use super::*;

        #[tokio::test]
        async fn test_cursor_roundtrip() {
            let store = store().await;
            assert!(store.load_cursor().await.unwrap().is_none());

            let cursor = Cursor::new("token-1".to_string()).unwrap();
            store.save_cursor(&cursor).await.unwrap();
            assert_eq!(store.load_cursor().await.unwrap(), Some(cursor));

            let newer = Cursor::new("token-2".to_string()).unwrap();
            store.save_cursor(&newer).await.unwrap();
            assert_eq!(store.load_cursor().await.unwrap(), Some(newer));
        }
    }

    mod queue_tests {
        use super::*;

        #[tokio::test]
        async fn test_enqueue_and_fetch_fifo() {
            let store = store().await;
            let first = SyncOperation::upload(ItemKey::Path(path("a.txt")), Some(fp("h1")));
            let second = SyncOperation::download(ItemKey::Remote(rid("R1")), Some(fp("r1")));

            let id1 = store.enqueue_operation(&first).await.unwrap();
            let id2 = store.enqueue_operation(&second).await.unwrap();
            assert!(id1 < id2);

            let batch = store.next_operations(10).await.unwrap();
            assert_eq!(batch.len(), 2);
            assert_eq!(batch[0].id, id1);
            assert_eq!(batch[0].kind, OperationKind::Upload);
            assert_eq!(batch[1].id, id2);
        }

        #[tokio::test]
        async fn test_one_operation_per_key() {
            let store = store().await;
            let key = ItemKey::Remote(rid("R1"));
            store
                .enqueue_operation(&SyncOperation::download(key.clone(), Some(fp("r1"))))
                .await
                .unwrap();
            store
                .enqueue_operation(&SyncOperation::rename_local(key.clone(), path("b.txt")))
                .await
                .unwrap();

            let batch = store.next_operations(10).await.unwrap();
            assert_eq!(batch.len(), 1);
            assert_eq!(batch[0].kind, OperationKind::Download);
        }

        #[tokio::test]
        async fn test_running_key_is_skipped() {
            let store = store().await;
            let key = ItemKey::Remote(rid("R1"));
            let id1 = store
                .enqueue_operation(&SyncOperation::download(key.clone(), Some(fp("r1"))))
                .await
                .unwrap();
            store
                .enqueue_operation(&SyncOperation::rename_local(key.clone(), path("b.txt")))
                .await
                .unwrap();
            let other = store
                .enqueue_operation(&SyncOperation::upload(
                    ItemKey::Path(path("c.txt")),
                    Some(fp("h2")),
                ))
                .await
                .unwrap();

            store.mark_running(id1).await.unwrap();

            let batch = store.next_operations(10).await.unwrap();
            assert_eq!(batch.len(), 1);
            assert_eq!(batch[0].id, other);
        }

        #[tokio::test]
        async fn test_complete_commits_op_and_item_together() {
            let store = store().await;
            let key = ItemKey::Path(path("a.txt"));
            let op_id = store
                .enqueue_operation(&SyncOperation::upload(key, Some(fp("h1"))))
                .await
                .unwrap();

            let mut item = Item::new_local(path("a.txt"), Some(fp("h1")), false);
            item.set_remote_id(rid("R1"));
            item.set_remote_fingerprint(Some(fp("rev1")));
            item.mark_synced(Utc::now()).unwrap();

            store.complete_operation(op_id, &item).await.unwrap();

            assert_eq!(store.pending_count().await.unwrap(), 0);
            let saved = store.get_by_remote_id(&rid("R1")).await.unwrap().unwrap();
            assert_eq!(saved.sync_state(), SyncState::Synced);
        }

        #[tokio::test]
        async fn test_complete_removing_drops_item() {
            let store = store().await;
            let item = Item::new_remote(rid("R1"), path("a.txt"), Some(fp("r1")), false);
            store.put_item(&item).await.unwrap();

            let key = ItemKey::Remote(rid("R1"));
            let op_id = store
                .enqueue_operation(&SyncOperation::delete_local(key.clone()))
                .await
                .unwrap();

            store.complete_operation_removing(op_id, &key).await.unwrap();
            assert!(store.scan().await.unwrap().is_empty());
            assert_eq!(store.pending_count().await.unwrap(), 0);
        }

        #[tokio::test]
        async fn test_fail_operation_retry_and_terminal() {
            let store = store().await;
            let op_id = store
                .enqueue_operation(&SyncOperation::upload(
                    ItemKey::Path(path("a.txt")),
                    Some(fp("h1")),
                ))
                .await
                .unwrap();

            store.fail_operation(op_id, 1, false).await.unwrap();
            let batch = store.next_operations(10).await.unwrap();
            assert_eq!(batch.len(), 1);
            assert_eq!(batch[0].attempts, 1);

            store.fail_operation(op_id, 5, true).await.unwrap();
            assert!(store.next_operations(10).await.unwrap().is_empty());
            let failed = store.failed_operations().await.unwrap();
            assert_eq!(failed.len(), 1);
            assert_eq!(failed[0].attempts, 5);
        }

        #[tokio::test]
        async fn test_requeue_interrupted() {
            let store = store().await;
            let op_id = store
                .enqueue_operation(&SyncOperation::download(
                    ItemKey::Remote(rid("R1")),
                    Some(fp("r1")),
                ))
                .await
                .unwrap();
            store.mark_running(op_id).await.unwrap();
            assert!(store.next_operations(10).await.unwrap().is_empty());

            let requeued = store.requeue_interrupted().await.unwrap();
            assert_eq!(requeued, 1);
            assert_eq!(store.next_operations(10).await.unwrap().len(), 1);
        }
    }

    mod conflict_tests {
        use super::*;
        use cirrus_core::domain::{Conflict, ConflictReason, Resolution, VersionInfo};

        fn sample_conflict() -> Conflict {
            Conflict::new(
                ItemKey::Remote(rid("R1")),
                Some(path("notes.txt")),
                ConflictReason::BothEdited,
                VersionInfo {
                    fingerprint: Some(fp("local-h")),
                    modified_at: Some(Utc::now()),
                },
                VersionInfo {
                    fingerprint: Some(fp("remote-h")),
                    modified_at: None,
                },
            )
        }

        #[tokio::test]
        async fn test_conflict_roundtrip() {
            let store = store().await;
            let conflict = sample_conflict();
            store.put_conflict(&conflict).await.unwrap();

            let unresolved = store.unresolved_conflicts().await.unwrap();
            assert_eq!(unresolved.len(), 1);
            assert_eq!(unresolved[0].id, conflict.id);
            assert_eq!(unresolved[0].reason, ConflictReason::BothEdited);
            assert_eq!(unresolved[0].local.fingerprint, Some(fp("local-h")));

            let by_key = store
                .conflict_for_key(&ItemKey::Remote(rid("R1")))
                .await
                .unwrap();
            assert!(by_key.is_some());
        }

        #[tokio::test]
        async fn test_resolution_clears_unresolved() {
            let store = store().await;
            let conflict = sample_conflict();
            store.put_conflict(&conflict).await.unwrap();

            store
                .resolve_conflict_record(&conflict.id, Resolution::KeepLocal)
                .await
                .unwrap();

            assert!(store.unresolved_conflicts().await.unwrap().is_empty());
            assert!(store
                .conflict_for_key(&ItemKey::Remote(rid("R1")))
                .await
                .unwrap()
                .is_none());
        }
    }
}
