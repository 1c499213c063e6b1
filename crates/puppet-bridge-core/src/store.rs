//! Out-of-band store for large transfers.
//!
//! Holds a byte stream under a random UUID for a bounded time. Each entry is
//! one file in a per-instance directory:
//!
//! ```text
//! <temp>/puppet-bridge-<pid>/store-<random>/<uuid>
//! ```
//!
//! # Linearization
//!
//! `resolve` and the expiry timer both start by removing the entry from the
//! registry under one lock. Whichever removes it first owns the cleanup; the
//! other sees "not found".

use crate::config::StoreConfig;
use crate::{BridgeError, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWriteExt, ReadBuf};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
enum WriteState {
    Pending,
    Done,
    Failed(String),
}

struct Entry {
    path: PathBuf,
    created_at: DateTime<Utc>,
    ready: watch::Receiver<WriteState>,
    writer: Option<JoinHandle<()>>,
    expiry: Option<JoinHandle<()>>,
}

impl Entry {
    fn cancel_tasks(&mut self) {
        if let Some(handle) = self.expiry.take() {
            handle.abort();
        }
        if let Some(handle) = self.writer.take() {
            handle.abort();
        }
    }
}

struct StoreInner {
    dir: PathBuf,
    ttl: Duration,
    entries: Mutex<HashMap<Uuid, Entry>>,
    destroyed: AtomicBool,
}

impl StoreInner {
    fn entries(&self) -> MutexGuard<'_, HashMap<Uuid, Entry>> {
        // A panic while holding the lock cannot leave the map half-updated.
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn expire(&self, uuid: Uuid) {
        let removed = self.entries().remove(&uuid);
        if let Some(entry) = removed {
            info!(
                "Out-of-band entry {} expired (registered {})",
                uuid,
                entry.created_at.to_rfc3339()
            );
            remove_backing_file(&entry.path);
        }
    }
}

/// Temporary UUID-addressed staging area.
///
/// Cheap to clone; clones share the same registry.
#[derive(Clone)]
pub struct OutOfBandStore {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for OutOfBandStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutOfBandStore")
            .field("dir", &self.inner.dir)
            .field("ttl", &self.inner.ttl)
            .finish()
    }
}

impl OutOfBandStore {
    /// Create a store under the process temporary root with the default TTL.
    pub fn new() -> Result<Self> {
        Self::with_ttl(StoreConfig::DEFAULT_TTL)
    }

    /// Create a store under the process temporary root.
    pub fn with_ttl(ttl: Duration) -> Result<Self> {
        let root = std::env::temp_dir().join(format!(
            "{}-{}",
            StoreConfig::ROOT_DIR_PREFIX,
            std::process::id()
        ));
        Self::in_dir(&root, ttl)
    }

    /// Create a store as a fresh subdirectory of `root`.
    pub fn in_dir(root: &Path, ttl: Duration) -> Result<Self> {
        let dir = root.join(format!(
            "{}{}",
            StoreConfig::STORE_DIR_PREFIX,
            Uuid::new_v4().simple()
        ));
        std::fs::create_dir_all(&dir).map_err(|e| BridgeError::io_with_path(e, &dir))?;
        debug!("Out-of-band store at {} (ttl {:?})", dir.display(), ttl);

        Ok(Self {
            inner: Arc::new(StoreInner {
                dir,
                ttl,
                entries: Mutex::new(HashMap::new()),
                destroyed: AtomicBool::new(false),
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    pub fn ttl(&self) -> Duration {
        self.inner.ttl
    }

    /// Number of unresolved entries.
    pub fn len(&self) -> usize {
        self.inner.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, uuid: &Uuid) -> bool {
        self.inner.entries().contains_key(uuid)
    }

    /// Wait until the backing write of `uuid` has finished.
    ///
    /// Does not consume the entry. Fails when the write failed, or when the
    /// entry is gone (resolved, expired or destroyed) before completing.
    pub async fn written(&self, uuid: &Uuid) -> Result<()> {
        let mut ready = self
            .inner
            .entries()
            .get(uuid)
            .map(|entry| entry.ready.clone())
            .ok_or_else(|| BridgeError::not_found(uuid))?;

        let state = ready
            .wait_for(|state| *state != WriteState::Pending)
            .await
            .map(|state| state.clone())
            .map_err(|_| BridgeError::stream(format!("write of {} was abandoned", uuid)))?;

        match state {
            WriteState::Failed(message) => Err(BridgeError::stream(format!(
                "write of {} failed: {}",
                uuid, message
            ))),
            _ => Ok(()),
        }
    }

    /// Stage a stream and return its identifier.
    ///
    /// Returns as soon as the entry is registered; the backing write runs in
    /// the background and the expiry timer is armed once it completes.
    pub fn register<R>(&self, reader: R) -> Result<Uuid>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return Err(BridgeError::Other("out-of-band store destroyed".to_string()));
        }

        let uuid = Uuid::new_v4();
        let path = self.inner.dir.join(uuid.to_string());
        let (ready_tx, ready_rx) = watch::channel(WriteState::Pending);

        self.inner.entries().insert(
            uuid,
            Entry {
                path: path.clone(),
                created_at: Utc::now(),
                ready: ready_rx,
                writer: None,
                expiry: None,
            },
        );

        let weak = Arc::downgrade(&self.inner);
        let writer = tokio::spawn(async move {
            match write_backing_file(&path, reader).await {
                Ok(bytes) => {
                    debug!("Out-of-band entry {} written ({} bytes)", uuid, bytes);
                    let _ = ready_tx.send(WriteState::Done);
                    if let Some(inner) = weak.upgrade() {
                        arm_expiry(&inner, uuid);
                    }
                }
                Err(e) => {
                    warn!("Out-of-band entry {} failed to write: {}", uuid, e);
                    let _ = ready_tx.send(WriteState::Failed(e.to_string()));
                    if let Some(inner) = weak.upgrade() {
                        inner.entries().remove(&uuid);
                    }
                    remove_backing_file(&path);
                }
            }
        });

        if let Some(entry) = self.inner.entries().get_mut(&uuid) {
            entry.writer = Some(writer);
        }

        Ok(uuid)
    }

    /// Take the stream registered under `uuid`.
    ///
    /// Succeeds at most once per identifier. The backing file is deleted when
    /// the returned reader is dropped.
    pub async fn resolve(&self, uuid: &Uuid) -> Result<ResolvedFile> {
        let mut entry = self
            .inner
            .entries()
            .remove(uuid)
            .ok_or_else(|| BridgeError::not_found(uuid))?;

        if let Some(handle) = entry.expiry.take() {
            handle.abort();
        }
        // The writer must finish; only drop our handle to it.
        entry.writer.take();

        let state = entry
            .ready
            .wait_for(|state| *state != WriteState::Pending)
            .await
            .map(|state| state.clone())
            .map_err(|_| BridgeError::stream(format!("write of {} was abandoned", uuid)))?;

        if let WriteState::Failed(message) = state {
            return Err(BridgeError::stream(format!(
                "write of {} failed: {}",
                uuid, message
            )));
        }

        let file = tokio::fs::File::open(&entry.path)
            .await
            .map_err(|e| BridgeError::io_with_path(e, &entry.path))?;

        debug!("Out-of-band entry {} resolved", uuid);

        Ok(ResolvedFile {
            file: Some(file),
            path: entry.path,
        })
    }

    /// Cancel every timer and remove all backing content.
    ///
    /// Meant for the owner's shutdown sequence. Later `register` calls fail.
    pub async fn destroy(&self) -> Result<()> {
        self.inner.destroyed.store(true, Ordering::SeqCst);

        let drained: Vec<(Uuid, Entry)> = self.inner.entries().drain().collect();
        for (_, mut entry) in drained {
            entry.cancel_tasks();
        }

        match tokio::fs::remove_dir_all(&self.inner.dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(BridgeError::io_with_path(e, &self.inner.dir)),
        }

        info!("Out-of-band store {} destroyed", self.inner.dir.display());
        Ok(())
    }
}

fn arm_expiry(inner: &Arc<StoreInner>, uuid: Uuid) {
    let mut entries = inner.entries();
    // Already resolved while the write was in flight.
    let Some(entry) = entries.get_mut(&uuid) else {
        return;
    };

    let weak: Weak<StoreInner> = Arc::downgrade(inner);
    let ttl = inner.ttl;
    entry.writer = None;
    entry.expiry = Some(tokio::spawn(async move {
        tokio::time::sleep(ttl).await;
        if let Some(inner) = weak.upgrade() {
            inner.expire(uuid);
        }
    }));
}

async fn write_backing_file<R>(path: &Path, mut reader: R) -> Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(|e| BridgeError::io_with_path(e, path))?;
    let bytes = tokio::io::copy(&mut reader, &mut file)
        .await
        .map_err(crate::chunk::unwrap_io_error)?;
    file.flush().await?;
    Ok(bytes)
}

fn remove_backing_file(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove {}: {}", path.display(), e);
        }
    }
}

/// Reader over a resolved entry. Deletes the backing file on drop.
#[derive(Debug)]
pub struct ResolvedFile {
    file: Option<tokio::fs::File>,
    path: PathBuf,
}

impl AsyncRead for ResolvedFile {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.file.as_mut() {
            Some(file) => Pin::new(file).poll_read(cx, buf),
            None => Poll::Ready(Ok(())),
        }
    }
}

impl Drop for ResolvedFile {
    fn drop(&mut self) {
        // Close before unlinking so this also works where open files are locked.
        drop(self.file.take());
        remove_backing_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    async fn read_all(mut file: ResolvedFile) -> Vec<u8> {
        let mut out = Vec::new();
        file.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_register_then_resolve_returns_bytes() {
        let tmp = TempDir::new().unwrap();
        let store = OutOfBandStore::in_dir(tmp.path(), Duration::from_secs(60)).unwrap();

        let uuid = store.register(std::io::Cursor::new(b"hello store".to_vec())).unwrap();
        assert!(store.contains(&uuid));

        let file = store.resolve(&uuid).await.unwrap();
        assert_eq!(read_all(file).await, b"hello store");
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_written_waits_without_consuming() {
        let tmp = TempDir::new().unwrap();
        let store = OutOfBandStore::in_dir(tmp.path(), Duration::from_secs(60)).unwrap();

        let uuid = store.register(std::io::Cursor::new(vec![7; 256])).unwrap();
        store.written(&uuid).await.unwrap();
        assert!(store.contains(&uuid));
        assert!(store.dir().join(uuid.to_string()).exists());

        let file = store.resolve(&uuid).await.unwrap();
        assert_eq!(read_all(file).await, vec![7; 256]);
    }

    #[tokio::test]
    async fn test_second_resolve_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let store = OutOfBandStore::in_dir(tmp.path(), Duration::from_secs(60)).unwrap();

        let uuid = store.register(std::io::Cursor::new(vec![1, 2, 3])).unwrap();
        let _first = store.resolve(&uuid).await.unwrap();

        match store.resolve(&uuid).await {
            Err(BridgeError::NotFound { uuid: got }) => assert_eq!(got, uuid.to_string()),
            other => panic!("Expected NotFound, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_uuid_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let store = OutOfBandStore::in_dir(tmp.path(), Duration::from_secs(60)).unwrap();
        assert!(matches!(
            store.resolve(&Uuid::new_v4()).await,
            Err(BridgeError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_backing_file_removed_after_read() {
        let tmp = TempDir::new().unwrap();
        let store = OutOfBandStore::in_dir(tmp.path(), Duration::from_secs(60)).unwrap();

        let uuid = store.register(std::io::Cursor::new(vec![9; 1024])).unwrap();
        let file = store.resolve(&uuid).await.unwrap();
        let path = store.dir().join(uuid.to_string());
        assert!(path.exists());

        read_all(file).await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_entry_expires_after_ttl() {
        let tmp = TempDir::new().unwrap();
        let store = OutOfBandStore::in_dir(tmp.path(), Duration::from_millis(100)).unwrap();

        let uuid = store.register(std::io::Cursor::new(vec![0; 16])).unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;

        assert!(matches!(
            store.resolve(&uuid).await,
            Err(BridgeError::NotFound { .. })
        ));
        assert!(!store.dir().join(uuid.to_string()).exists());
    }

    #[tokio::test]
    async fn test_resolve_before_ttl_succeeds() {
        let tmp = TempDir::new().unwrap();
        let store = OutOfBandStore::in_dir(tmp.path(), Duration::from_secs(5)).unwrap();

        let uuid = store.register(std::io::Cursor::new(vec![4; 16])).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let file = store.resolve(&uuid).await.unwrap();
        assert_eq!(read_all(file).await, vec![4; 16]);
    }

    #[tokio::test]
    async fn test_default_ttl_is_thirty_minutes_not_scaled() {
        let store = OutOfBandStore::new().unwrap();
        assert_eq!(store.ttl(), Duration::from_secs(30 * 60));
        store.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_resolves_have_one_winner() {
        let tmp = TempDir::new().unwrap();
        let store = OutOfBandStore::in_dir(tmp.path(), Duration::from_secs(60)).unwrap();
        let uuid = store.register(std::io::Cursor::new(vec![5; 64])).unwrap();

        let (a, b) = tokio::join!(store.resolve(&uuid), store.resolve(&uuid));
        assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
    }

    #[tokio::test]
    async fn test_destroy_removes_everything() {
        let tmp = TempDir::new().unwrap();
        let store = OutOfBandStore::in_dir(tmp.path(), Duration::from_secs(60)).unwrap();
        let uuid = store.register(std::io::Cursor::new(vec![1; 8])).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        store.destroy().await.unwrap();

        assert!(!store.dir().exists());
        assert!(store.is_empty());
        assert!(matches!(
            store.resolve(&uuid).await,
            Err(BridgeError::NotFound { .. })
        ));
        assert!(store.register(std::io::Cursor::new(vec![1])).is_err());
    }
}
