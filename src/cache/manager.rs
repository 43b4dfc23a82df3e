//! The cache handle: locked reads, create-only atomic publish, and the
//! blocking wrappers.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use fred::clients::Pool;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cache::index;
use crate::config::CacheConfig;
use crate::coordination::keys::{self, KeySpace};
use crate::coordination::locks;
use crate::coordination::redis;
use crate::coordination::scripts::ScriptManager;
use crate::error::{CacheError, Result};

/// Default retry interval for the blocking wrappers.
pub const DEFAULT_BACKOFF: Duration = Duration::from_millis(10);

// ---------------------------------------------------------------------------
// FileCache
// ---------------------------------------------------------------------------

/// A shared on-disk content cache handle.
///
/// Entries are immutable byte blobs, one regular file per key under
/// `cache_dir`. Any number of processes on any number of hosts may share
/// the directory: mutual exclusion between readers, writers, and the
/// evictor runs through leased locks in a Redis-compatible server, never
/// through the filesystem. A single handle is meant to be owned by one
/// task; give each concurrent task its own handle.
pub struct FileCache {
    pub(crate) pool: Pool,
    pub(crate) scripts: Arc<ScriptManager>,
    pub(crate) keyspace: KeySpace,
    pub(crate) cache_dir: PathBuf,
    pub(crate) lock_ttl_ms: u64,
    pub(crate) max_bytes: u64,
    pub(crate) purge_mutex_ttl_ms: u64,
    pub(crate) purge_factor: f64,
}

impl FileCache {
    /// Connect to the coordination service, pre-load the lock scripts, and
    /// ensure the cache directory exists.
    pub async fn new(config: CacheConfig) -> Result<Self> {
        crate::config::validate_config(&config)?;

        tokio::fs::create_dir_all(&config.cache_dir).await?;

        let pool = redis::create_pool(&config.coordination).await?;
        let scripts = Arc::new(ScriptManager::load(pool.clone()).await?);

        debug!(
            cache_dir = %config.cache_dir.display(),
            namespace = %config.namespace,
            max_bytes = config.max_bytes,
            "cache handle ready"
        );

        Ok(Self {
            pool,
            scripts,
            keyspace: KeySpace::new(&config.namespace),
            cache_dir: config.cache_dir,
            lock_ttl_ms: config.lock_ttl_ms,
            max_bytes: config.max_bytes,
            purge_mutex_ttl_ms: config.purge_mutex_ttl_ms,
            purge_factor: config.purge_factor,
        })
    }

    /// Namespace prefix for this handle's coordination keys.
    pub fn namespace(&self) -> &str {
        self.keyspace.namespace()
    }

    /// Directory holding the published entry files.
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// On-disk path for a validated key.
    pub(crate) fn path_for(&self, key: &str) -> PathBuf {
        self.cache_dir.join(key)
    }

    // -----------------------------------------------------------------------
    // Non-blocking operations
    // -----------------------------------------------------------------------

    /// Whether a published file for `key` is currently present.
    ///
    /// Takes no locks; the answer can be stale the moment it returns
    /// (eviction may race it), so it is informational only.
    pub fn exists(&self, key: &str) -> Result<bool> {
        keys::validate_key(key)?;
        Ok(self.path_for(key).is_file())
    }

    /// Read the full payload of `key` under a shared read lock.
    ///
    /// Fails with [`CacheError::Busy`] while a writer holds the entry and
    /// with [`CacheError::NotFound`] if no file has been published under
    /// this key. The read lock is released on every exit path; a
    /// successful read refreshes the entry's LRU timestamp.
    pub async fn read(&self, key: &str) -> Result<Vec<u8>> {
        keys::validate_key(key)?;
        let path = self.path_for(key);

        let guard =
            locks::acquire_read(&self.scripts, &self.keyspace, key, self.lock_ttl_ms).await?;

        let bytes = match read_all(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                guard.release().await;
                return Err(CacheError::NotFound(key.to_string()));
            }
            Err(e) => {
                guard.release().await;
                return Err(e.into());
            }
        };
        guard.release().await;

        index::touch(&self.pool, &self.keyspace, key, index::now_ms()).await?;
        Ok(bytes)
    }

    /// Publish `data` under `key`. Create-only: an existing entry is never
    /// replaced, and entries are immutable once published.
    ///
    /// The payload becomes visible atomically: it is staged to a scratch
    /// file in the cache directory, fsynced, and renamed into place while
    /// the entry's exclusive write lock is held. Observers either see no
    /// file at all or the complete payload. After a successful publish the
    /// size, total-bytes, key-set, and LRU indices are updated, and the
    /// capacity bound (if configured) is enforced best-effort.
    pub async fn create(&self, key: &str, data: &[u8]) -> Result<()> {
        keys::validate_key(key)?;
        let path = self.path_for(key);

        if path.is_file() {
            return Err(CacheError::AlreadyExists(key.to_string()));
        }

        let guard =
            locks::acquire_write(&self.scripts, &self.keyspace, key, self.lock_ttl_ms).await?;

        // Stage + fsync + re-check + rename. Failures in here drop the
        // scratch file, and the lock is released before the error surfaces.
        match publish(&self.cache_dir, key, &path, data) {
            Ok(()) => {}
            Err(PublishError::Exists) => {
                guard.release().await;
                return Err(CacheError::AlreadyExists(key.to_string()));
            }
            Err(PublishError::Io(e)) => {
                guard.release().await;
                return Err(e.into());
            }
        }
        guard.release().await;

        // Index updates after a successful publish are individual commands;
        // a failure here only creates drift the purger knows how to repair.
        let ts = index::now_ms();
        if let Err(e) =
            index::add_on_publish(&self.pool, &self.keyspace, key, data.len() as i64, ts).await
        {
            warn!(%key, error = %e, "index update failed after publish; eviction will reconcile");
        }

        if self.max_bytes > 0 {
            self.ensure_capacity().await;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Blocking wrappers
    // -----------------------------------------------------------------------

    /// Blocking [`read`](Self::read): retries `Busy` (a writer is active)
    /// and `NotFound` (the entry may not be published yet) until `timeout`
    /// elapses, sleeping `backoff` between attempts. Returns `None` on
    /// timeout. The deadline is checked only after a failed attempt, so at
    /// least one attempt always runs.
    pub async fn read_blocking(
        &self,
        key: &str,
        timeout: Duration,
        backoff: Duration,
    ) -> Result<Option<Vec<u8>>> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.read(key).await {
                Ok(bytes) => return Ok(Some(bytes)),
                Err(CacheError::Busy { .. }) | Err(CacheError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
            if Instant::now() >= deadline {
                debug!(%key, ?timeout, "read_blocking timed out");
                return Ok(None);
            }
            tokio::time::sleep(backoff).await;
        }
    }

    /// Blocking [`create`](Self::create): retries while the entry is locked
    /// by readers or another writer. [`CacheError::AlreadyExists`] is
    /// permanent and surfaces immediately. Returns `false` on timeout.
    pub async fn create_blocking(
        &self,
        key: &str,
        data: &[u8],
        timeout: Duration,
        backoff: Duration,
    ) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.create(key, data).await {
                Ok(()) => return Ok(true),
                Err(CacheError::Busy { .. }) => {}
                Err(e) => return Err(e),
            }
            if Instant::now() >= deadline {
                debug!(%key, ?timeout, "create_blocking timed out");
                return Ok(false);
            }
            tokio::time::sleep(backoff).await;
        }
    }

    // -----------------------------------------------------------------------
    // Discovery
    // -----------------------------------------------------------------------

    /// All currently-published keys, per the coordination-side key set.
    pub async fn keys(&self) -> Result<Vec<String>> {
        index::all_keys(&self.pool, &self.keyspace).await
    }

    /// Total published bytes per the coordination-side counter. May drift
    /// briefly after a crashed publish; eviction re-derives it from the
    /// size index.
    pub async fn total_bytes(&self) -> Result<i64> {
        index::total_bytes(&self.pool, &self.keyspace).await
    }
}

// ---------------------------------------------------------------------------
// File helpers
// ---------------------------------------------------------------------------

fn read_all(path: &Path) -> std::io::Result<Vec<u8>> {
    let mut file = std::fs::File::open(path)?;
    let mut out = match file.metadata() {
        Ok(meta) => Vec::with_capacity(meta.len() as usize),
        Err(_) => Vec::new(),
    };
    file.read_to_end(&mut out)?;
    Ok(out)
}

#[derive(Debug)]
enum PublishError {
    /// The target appeared between the fast-path check and the rename.
    Exists,
    Io(std::io::Error),
}

impl From<std::io::Error> for PublishError {
    fn from(e: std::io::Error) -> Self {
        PublishError::Io(e)
    }
}

/// Write `data` to a scratch file `.{key}.XXXXXX` in `dir`, fsync it, and
/// atomically rename it over `target`.
///
/// The scratch file lives in the cache directory itself so the rename stays
/// on one filesystem. Early returns drop the scratch handle, which unlinks
/// the partial file. The write lock already excludes concurrent creates
/// through this crate; the re-check before the rename guards against
/// external writers to the directory.
fn publish(
    dir: &Path,
    key: &str,
    target: &Path,
    data: &[u8],
) -> std::result::Result<(), PublishError> {
    let mut scratch = tempfile::Builder::new()
        .prefix(&format!(".{key}."))
        .tempfile_in(dir)?;

    scratch.write_all(data)?;
    scratch.flush()?;
    scratch.as_file().sync_all()?;

    if target.is_file() {
        return Err(PublishError::Exists);
    }

    scratch
        .persist(target)
        .map_err(|e| PublishError::Io(e.error))?;
    Ok(())
}
