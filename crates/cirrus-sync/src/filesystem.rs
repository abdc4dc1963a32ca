//! Local mirror adapter (secondary/driven adapter)
//!
//! Implements [`ILocalFileSystem`] against a single mirror root directory
//! using `tokio::fs`.
//!
//! ## Design Decisions
//!
//! - **Root confinement**: every operation takes a [`MirrorPath`] relative
//!   to the mirror root; the adapter owns the root and resolves paths
//!   under it, so callers can never escape the mirror.
//! - **Atomic writes**: content lands in a staging file next to the target
//!   and is renamed into place, so a crash never leaves a half-written
//!   visible file.
//! - **Persistent staging**: staging files use a recognizable name prefix
//!   and survive restarts, which is what lets interrupted chunked
//!   downloads resume instead of starting over.
//! - **SHA-256 fingerprints**: content hashes are hex-encoded SHA-256,
//!   computed on a blocking thread for large files.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use cirrus_core::domain::newtypes::{Fingerprint, MirrorPath};
use cirrus_core::ports::local_filesystem::{FsEntry, ILocalFileSystem};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument, warn};

use crate::SyncError;

/// Name prefix for staging files
///
/// Files with this prefix are invisible to [`enumerate`] and must be
/// ignored by the change collector; they are transfer scratch space, not
/// synced content.
pub const STAGING_PREFIX: &str = ".cirrus-tmp-";

/// Returns true if the file name marks a staging file
pub fn is_staging_name(name: &str) -> bool {
    name.starts_with(STAGING_PREFIX)
}

// ============================================================================
// LocalFileSystemAdapter
// ============================================================================

/// Adapter that bridges the [`ILocalFileSystem`] port to a mirror root
/// directory on the real filesystem.
#[derive(Debug, Clone)]
pub struct LocalFileSystemAdapter {
    /// Absolute path of the mirror root
    root: PathBuf,
}

impl LocalFileSystemAdapter {
    /// Create a new adapter rooted at `root`
    ///
    /// The directory is created if it does not exist.
    pub async fn new(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// The mirror root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a mirror path to its absolute location under the root
    fn resolve(&self, path: &MirrorPath) -> PathBuf {
        self.root.join(path.to_relative_path_buf())
    }

    /// Absolute location of the staging file for `path`
    ///
    /// The staging file lives in the same directory as the target so the
    /// final rename stays on one filesystem.
    fn staging_path(&self, path: &MirrorPath) -> PathBuf {
        let target = self.resolve(path);
        let file_name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        target.with_file_name(format!("{STAGING_PREFIX}{file_name}"))
    }

    /// Convert an absolute path back into a [`MirrorPath`], if it lies
    /// under the root
    pub fn to_mirror_path(&self, absolute: &Path) -> Result<MirrorPath, SyncError> {
        let relative = absolute
            .strip_prefix(&self.root)
            .map_err(|_| SyncError::OutsideRoot(absolute.to_path_buf()))?;

        let joined = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        MirrorPath::new(joined).map_err(SyncError::DomainError)
    }
}

fn hex_encode(digest: &[u8]) -> String {
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        use std::fmt::Write;
        // Writing to a String cannot fail
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Hex-encoded SHA-256 of an in-memory buffer
///
/// Used by the transfer queue to verify downloaded content against the
/// expected fingerprint without touching the disk twice.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex_encode(&hasher.finalize())
}

/// Fingerprint a file's content on a blocking thread
async fn fingerprint_file(path: PathBuf) -> anyhow::Result<Fingerprint> {
    let hex = tokio::task::spawn_blocking(move || -> anyhow::Result<String> {
        use std::io::Read;
        let mut file = std::fs::File::open(&path)?;
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hex_encode(&hasher.finalize()))
    })
    .await??;

    Ok(Fingerprint::new(hex)?)
}

fn system_time_to_utc(time: std::time::SystemTime) -> Option<DateTime<Utc>> {
    time.duration_since(std::time::UNIX_EPOCH)
        .ok()
        .and_then(|dur| DateTime::from_timestamp(dur.as_secs() as i64, dur.subsec_nanos()))
}

// ============================================================================
// ILocalFileSystem implementation
// ============================================================================

#[async_trait::async_trait]
impl ILocalFileSystem for LocalFileSystemAdapter {
    #[instrument(skip(self), fields(path = %path))]
    async fn read(&self, path: &MirrorPath) -> anyhow::Result<Vec<u8>> {
        debug!("reading file");
        let data = tokio::fs::read(self.resolve(path)).await?;
        debug!(bytes = data.len(), "file read complete");
        Ok(data)
    }

    #[instrument(skip(self, data), fields(path = %path, bytes = data.len()))]
    async fn write_atomic(&self, path: &MirrorPath, data: &[u8]) -> anyhow::Result<()> {
        let target = self.resolve(path);

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Staging file in the same directory so the rename is atomic
        // (same filesystem).
        let staging = self.staging_path(path);

        debug!(staging = %staging.display(), "writing to staging file");
        tokio::fs::write(&staging, data).await?;

        debug!("renaming staging file into place");
        tokio::fs::rename(&staging, &target).await?;

        debug!("write complete");
        Ok(())
    }

    #[instrument(skip(self, data), fields(path = %path, offset, bytes = data.len()))]
    async fn write_staged(
        &self,
        path: &MirrorPath,
        offset: u64,
        data: &[u8],
    ) -> anyhow::Result<()> {
        let staging = self.staging_path(path);

        if let Some(parent) = staging.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let current_len = match tokio::fs::metadata(&staging).await {
            Ok(m) => m.len(),
            Err(e) if e.kind() == ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };

        if offset != current_len {
            return Err(SyncError::StagingOffsetMismatch {
                path: staging,
                expected: current_len,
                actual: offset,
            }
            .into());
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&staging)
            .await?;
        file.write_all(data).await?;
        file.flush().await?;

        debug!(new_len = current_len + data.len() as u64, "chunk appended");
        Ok(())
    }

    #[instrument(skip(self), fields(path = %path))]
    async fn staged_len(&self, path: &MirrorPath) -> anyhow::Result<u64> {
        match tokio::fs::metadata(self.staging_path(path)).await {
            Ok(m) => Ok(m.len()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self), fields(path = %path))]
    async fn staged_fingerprint(&self, path: &MirrorPath) -> anyhow::Result<Fingerprint> {
        fingerprint_file(self.staging_path(path)).await
    }

    #[instrument(skip(self), fields(path = %path))]
    async fn commit_staged(&self, path: &MirrorPath) -> anyhow::Result<()> {
        let staging = self.staging_path(path);
        let target = self.resolve(path);

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        debug!("committing staged content");
        tokio::fs::rename(&staging, &target).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(path = %path))]
    async fn discard_staged(&self, path: &MirrorPath) -> anyhow::Result<()> {
        let staging = self.staging_path(path);
        match tokio::fs::remove_file(&staging).await {
            Ok(()) => {
                debug!("staging file discarded");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self), fields(path = %path))]
    async fn delete(&self, path: &MirrorPath) -> anyhow::Result<()> {
        let target = self.resolve(path);
        let metadata = tokio::fs::metadata(&target).await?;

        if metadata.is_dir() {
            debug!("removing directory recursively");
            tokio::fs::remove_dir_all(&target).await?;
        } else {
            debug!("removing file");
            tokio::fs::remove_file(&target).await?;
        }

        debug!("delete complete");
        Ok(())
    }

    #[instrument(skip(self), fields(from = %from, to = %to))]
    async fn rename(&self, from: &MirrorPath, to: &MirrorPath) -> anyhow::Result<()> {
        let source = self.resolve(from);
        let target = self.resolve(to);

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        debug!("renaming entry");
        tokio::fs::rename(&source, &target).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(path = %path))]
    async fn create_dir_all(&self, path: &MirrorPath) -> anyhow::Result<()> {
        debug!("creating directory");
        tokio::fs::create_dir_all(self.resolve(path)).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(path = %path))]
    async fn fingerprint(&self, path: &MirrorPath) -> anyhow::Result<Fingerprint> {
        fingerprint_file(self.resolve(path)).await
    }

    #[instrument(skip(self), fields(path = %path))]
    async fn entry(&self, path: &MirrorPath) -> anyhow::Result<Option<FsEntry>> {
        let target = self.resolve(path);

        let metadata = match tokio::fs::metadata(&target).await {
            Ok(m) => m,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("entry not found");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let is_directory = metadata.is_dir();
        let fingerprint = if is_directory {
            None
        } else {
            Some(fingerprint_file(target.clone()).await?)
        };

        Ok(Some(FsEntry {
            path: path.clone(),
            fingerprint,
            is_directory,
            size: metadata.len(),
            modified: metadata.modified().ok().and_then(system_time_to_utc),
        }))
    }

    #[instrument(skip(self))]
    async fn enumerate(&self) -> anyhow::Result<Vec<FsEntry>> {
        let mut entries = Vec::new();
        let mut stack = vec![self.root.clone()];

        while let Some(dir) = stack.pop() {
            let mut read_dir = tokio::fs::read_dir(&dir).await?;
            while let Some(dir_entry) = read_dir.next_entry().await? {
                let absolute = dir_entry.path();
                let name = dir_entry.file_name().to_string_lossy().into_owned();

                if is_staging_name(&name) {
                    debug!(path = %absolute.display(), "skipping staging file");
                    continue;
                }

                let mirror_path = match self.to_mirror_path(&absolute) {
                    Ok(p) => p,
                    Err(err) => {
                        warn!(path = %absolute.display(), error = %err, "skipping unrepresentable path");
                        continue;
                    }
                };

                let metadata = dir_entry.metadata().await?;
                let is_directory = metadata.is_dir();

                let fingerprint = if is_directory {
                    stack.push(absolute);
                    None
                } else {
                    Some(fingerprint_file(absolute).await?)
                };

                entries.push(FsEntry {
                    path: mirror_path,
                    fingerprint,
                    is_directory,
                    size: metadata.len(),
                    modified: metadata.modified().ok().and_then(system_time_to_utc),
                });
            }
        }

        debug!(count = entries.len(), "enumeration complete");
        Ok(entries)
    }
}

// ============================================================================
// Unit tests
// ============================================================================
