//! Shared test harness: an in-memory provider plus a real temp-dir mirror
//! and a real SQLite store.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::Result;
use cirrus_core::config::Config;
use cirrus_core::domain::{Cursor, Fingerprint, ItemKey, MirrorPath, RemoteId};
use cirrus_core::engine_error::EngineError;
use cirrus_core::ports::{
    ChangePage, ILocalFileSystem, IRemoteGateway, IStateStore, RemoteChange,
};
use cirrus_store::{DatabasePool, SqliteStateStore};
use cirrus_sync::engine::SyncEngine;
use cirrus_sync::filesystem::{sha256_hex, LocalFileSystemAdapter};
use cirrus_sync::queue::{KeyLocks, TransferQueue};
use tempfile::TempDir;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

// ============================================================================
// MockGateway
// ============================================================================

#[derive(Debug, Clone)]
struct RemoteFile {
    path: Option<String>,
    data: Vec<u8>,
    is_directory: bool,
    deleted: bool,
}

#[derive(Default)]
struct GatewayState {
    files: HashMap<String, RemoteFile>,
    /// Ids in change order; the cursor is an index into this log
    log: Vec<String>,
    next_id: u32,
}

/// In-memory provider with scripted failure injection
#[derive(Default)]
pub struct MockGateway {
    state: Mutex<GatewayState>,
    ranges: AtomicBool,
    /// Next N uploads fail with a transient error
    pub fail_uploads: AtomicU32,
    /// Next N downloads fail with a transient error
    pub fail_downloads: AtomicU32,
    /// Next N whole-file downloads return corrupted bytes
    pub corrupt_downloads: AtomicU32,
    /// Next N metadata lookups fail with a transient error
    pub fail_metadata: AtomicU32,
    /// The next incremental poll rejects its cursor
    pub stale_cursor_once: AtomicBool,
    pub upload_calls: AtomicU32,
    pub download_calls: AtomicU32,
    pub range_calls: AtomicU32,
    pub list_calls: AtomicU32,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ranges() -> Self {
        let gw = Self::default();
        gw.ranges.store(true, Ordering::Relaxed);
        gw
    }

    fn change_for(id: &str, file: &RemoteFile) -> RemoteChange {
        let name = file
            .path
            .as_deref()
            .and_then(|p| p.rsplit('/').next())
            .unwrap_or("")
            .to_string();
        RemoteChange {
            id: id.to_string(),
            path: file.path.clone(),
            name,
            fingerprint: if file.is_directory || file.deleted {
                None
            } else {
                Some(sha256_hex(&file.data))
            },
            is_deleted: file.deleted,
            is_directory: file.is_directory,
            is_native_document: false,
            modified: Some(chrono::Utc::now()),
            size: Some(file.data.len() as u64),
        }
    }

    /// Put a file on the remote side and record it in the change log
    pub async fn seed_file(&self, path: &str, data: &[u8]) -> RemoteId {
        let mut state = self.state.lock().await;
        let existing = state
            .files
            .iter()
            .find(|(_, f)| f.path.as_deref() == Some(path) && !f.deleted)
            .map(|(id, _)| id.clone());

        let id = existing.unwrap_or_else(|| {
            state.next_id += 1;
            format!("R{}", state.next_id)
        });
        state.files.insert(
            id.clone(),
            RemoteFile {
                path: Some(path.to_string()),
                data: data.to_vec(),
                is_directory: false,
                deleted: false,
            },
        );
        state.log.push(id.clone());
        RemoteId::new(id).unwrap()
    }

    /// Mark a remote file deleted and record it in the change log
    pub async fn delete_path(&self, path: &str) {
        let mut state = self.state.lock().await;
        let id = state
            .files
            .iter()
            .find(|(_, f)| f.path.as_deref() == Some(path) && !f.deleted)
            .map(|(id, _)| id.clone())
            .expect("no remote file at path");
        state.files.get_mut(&id).unwrap().deleted = true;
        state.log.push(id);
    }

    /// Current content of the live remote file at `path`
    pub async fn data_at(&self, path: &str) -> Option<Vec<u8>> {
        let state = self.state.lock().await;
        state
            .files
            .values()
            .find(|f| f.path.as_deref() == Some(path) && !f.deleted)
            .map(|f| f.data.clone())
    }

    /// Paths of all live remote files
    pub async fn live_paths(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut paths: Vec<String> = state
            .files
            .values()
            .filter(|f| !f.deleted)
            .filter_map(|f| f.path.clone())
            .collect();
        paths.sort();
        paths
    }

    fn take_one(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait::async_trait]
impl IRemoteGateway for MockGateway {
    async fn list_changes(&self, cursor: Option<&Cursor>) -> Result<ChangePage> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().await;

        let next_cursor = Cursor::new(format!("c{}", state.log.len()))?;

        match cursor {
            None => {
                let changes = state
                    .files
                    .iter()
                    .filter(|(_, f)| !f.deleted)
                    .map(|(id, f)| Self::change_for(id, f))
                    .collect();
                Ok(ChangePage {
                    changes,
                    next_cursor,
                    full_enumeration: true,
                })
            }
            Some(cursor) => {
                if self.stale_cursor_once.swap(false, Ordering::SeqCst) {
                    anyhow::bail!(EngineError::StaleCursor);
                }
                let start: usize = cursor
                    .as_str()
                    .trim_start_matches('c')
                    .parse()
                    .map_err(|_| anyhow::anyhow!("bad cursor token"))?;
                let changes = state.log[start.min(state.log.len())..]
                    .iter()
                    .map(|id| Self::change_for(id, &state.files[id]))
                    .collect();
                Ok(ChangePage {
                    changes,
                    next_cursor,
                    full_enumeration: false,
                })
            }
        }
    }

    async fn get_metadata(&self, id: &RemoteId) -> Result<RemoteChange> {
        if Self::take_one(&self.fail_metadata) {
            anyhow::bail!(EngineError::TransientIo("injected metadata failure".into()));
        }
        let state = self.state.lock().await;
        let file = state
            .files
            .get(id.as_str())
            .ok_or_else(|| anyhow::anyhow!("unknown remote id {id}"))?;
        Ok(Self::change_for(id.as_str(), file))
    }

    async fn download(&self, id: &RemoteId) -> Result<Vec<u8>> {
        self.download_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_one(&self.fail_downloads) {
            anyhow::bail!(EngineError::TransientIo("injected download failure".into()));
        }
        let state = self.state.lock().await;
        let file = state
            .files
            .get(id.as_str())
            .ok_or_else(|| anyhow::anyhow!("unknown remote id {id}"))?;
        let mut data = file.data.clone();
        if Self::take_one(&self.corrupt_downloads) {
            if let Some(byte) = data.first_mut() {
                *byte ^= 0xff;
            }
        }
        Ok(data)
    }

    async fn download_range(&self, id: &RemoteId, offset: u64, len: u64) -> Result<Vec<u8>> {
        self.range_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_one(&self.fail_downloads) {
            anyhow::bail!(EngineError::TransientIo("injected download failure".into()));
        }
        let state = self.state.lock().await;
        let file = state
            .files
            .get(id.as_str())
            .ok_or_else(|| anyhow::anyhow!("unknown remote id {id}"))?;
        let start = (offset as usize).min(file.data.len());
        let end = (start + len as usize).min(file.data.len());
        Ok(file.data[start..end].to_vec())
    }

    fn supports_ranges(&self) -> bool {
        self.ranges.load(Ordering::Relaxed)
    }

    async fn upload(&self, path: &MirrorPath, data: &[u8]) -> Result<RemoteChange> {
        self.upload_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_one(&self.fail_uploads) {
            anyhow::bail!(EngineError::TransientIo("injected upload failure".into()));
        }
        let id = self.seed_file(path.as_str(), data).await;
        let state = self.state.lock().await;
        Ok(Self::change_for(id.as_str(), &state.files[id.as_str()]))
    }

    async fn create_directory(&self, path: &MirrorPath) -> Result<RemoteChange> {
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let id = format!("R{}", state.next_id);
        state.files.insert(
            id.clone(),
            RemoteFile {
                path: Some(path.as_str().to_string()),
                data: Vec::new(),
                is_directory: true,
                deleted: false,
            },
        );
        state.log.push(id.clone());
        let file = state.files[&id].clone();
        Ok(Self::change_for(&id, &file))
    }

    async fn delete(&self, id: &RemoteId) -> Result<()> {
        let mut state = self.state.lock().await;
        let file = state
            .files
            .get_mut(id.as_str())
            .ok_or_else(|| anyhow::anyhow!("unknown remote id {id}"))?;
        file.deleted = true;
        let id = id.as_str().to_string();
        state.log.push(id);
        Ok(())
    }

    async fn rename(&self, id: &RemoteId, new_path: &MirrorPath) -> Result<RemoteChange> {
        let mut state = self.state.lock().await;
        let file = state
            .files
            .get_mut(id.as_str())
            .ok_or_else(|| anyhow::anyhow!("unknown remote id {id}"))?;
        file.path = Some(new_path.as_str().to_string());
        let change = Self::change_for(id.as_str(), file);
        let id = id.as_str().to_string();
        state.log.push(id);
        Ok(change)
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub store: Arc<SqliteStateStore>,
    pub gateway: Arc<MockGateway>,
    pub fs: Arc<LocalFileSystemAdapter>,
    pub config: Config,
    root: TempDir,
    _db: DatabasePool,
}

static TRACING: std::sync::Once = std::sync::Once::new();

fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_gateway(MockGateway::new()).await
    }

    pub async fn with_gateway(gateway: MockGateway) -> Self {
        init_tracing();
        let root = tempfile::tempdir().unwrap();
        let mirror = root.path().join("mirror");

        let db = DatabasePool::in_memory().await.unwrap();
        let store = Arc::new(SqliteStateStore::new(db.pool().clone()));
        let fs = Arc::new(LocalFileSystemAdapter::new(&mirror).await.unwrap());

        let mut config = Config::default();
        config.sync.root = mirror;
        config.sync.debounce_delay = 0;
        config.transfer.request_timeout = 5;
        config.transfer.max_attempts = 3;
        config.transfer.chunk_size_mb = 1;

        Self {
            store,
            gateway: Arc::new(gateway),
            fs,
            config,
            root,
            _db: db,
        }
    }

    pub fn engine(&self) -> SyncEngine {
        SyncEngine::new(
            self.store.clone() as Arc<dyn IStateStore>,
            self.gateway.clone() as Arc<dyn IRemoteGateway>,
            self.fs.clone() as Arc<dyn ILocalFileSystem>,
            self.config.clone(),
        )
    }

    pub fn queue(&self) -> TransferQueue {
        TransferQueue::new(
            self.store.clone() as Arc<dyn IStateStore>,
            self.gateway.clone() as Arc<dyn IRemoteGateway>,
            self.fs.clone() as Arc<dyn ILocalFileSystem>,
            self.config.transfer.clone(),
            KeyLocks::new(),
            CancellationToken::new(),
        )
    }

    /// Write a file into the mirror through std fs, as a user would
    pub fn write_local(&self, rel: &str, data: &[u8]) {
        let path = self.config.sync.root.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, data).unwrap();
    }

    pub fn read_local(&self, rel: &str) -> Vec<u8> {
        std::fs::read(self.config.sync.root.join(rel)).unwrap()
    }

    pub fn local_exists(&self, rel: &str) -> bool {
        self.config.sync.root.join(rel).exists()
    }

    pub fn delete_local(&self, rel: &str) {
        std::fs::remove_file(self.config.sync.root.join(rel)).unwrap();
    }

    /// Names of visible entries directly under the mirror root
    pub fn local_names(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(&self.config.sync.root)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }
}

pub fn mpath(s: &str) -> MirrorPath {
    MirrorPath::new(s.to_string()).unwrap()
}

pub fn fp_of(data: &[u8]) -> Fingerprint {
    Fingerprint::new(sha256_hex(data)).unwrap()
}

pub fn rkey(id: &RemoteId) -> ItemKey {
    ItemKey::Remote(id.clone())
}
