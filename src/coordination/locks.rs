//! Per-entry distributed reader/writer locks, the eviction fence, and the
//! purge mutex.
//!
//! Every transition is a single atomic script (see
//! [`crate::coordination::scripts`]) and every lock carries a lease, so a
//! crashed process cannot wedge an entry for longer than the configured TTL.
//! Release is best-effort: failures are logged and left to the lease,
//! never surfaced to callers.

use std::sync::Arc;

use fred::clients::Pool;
use fred::interfaces::KeysInterface;
use fred::types::{Expiration, SetOptions};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::coordination::keys::KeySpace;
use crate::coordination::scripts::{Script, ScriptManager};
use crate::error::{CacheError, Result};

/// Lease on the eviction fence. Long enough to unlink one file and clean
/// four index entries; short enough that a purger crash mid-eviction only
/// briefly leaves the entry looking busy.
pub const EVICT_FENCE_TTL_MS: u64 = 1_500;

/// Write-lock token: 128 bits from the OS entropy pool as 32 hex chars.
/// Two processes must never collide, and a token must not be guessable
/// from another process's tokens.
fn fresh_token() -> String {
    Uuid::new_v4().simple().to_string()
}

// ---------------------------------------------------------------------------
// Read lock
// ---------------------------------------------------------------------------

/// Shared read lock on one entry.
///
/// Call [`ReadGuard::release`] once the file handle is closed. A guard that
/// is dropped without an explicit release spawns a best-effort release task;
/// either way the counter's lease bounds how long a lost decrement lingers.
pub struct ReadGuard {
    scripts: Arc<ScriptManager>,
    readers_key: String,
    released: bool,
}

impl ReadGuard {
    /// Decrement the reader counter. Infallible from the caller's view.
    pub async fn release(mut self) {
        self.released = true;
        release_readers(&self.scripts, &self.readers_key).await;
    }
}

impl Drop for ReadGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let scripts = Arc::clone(&self.scripts);
        let readers_key = std::mem::take(&mut self.readers_key);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move { release_readers(&scripts, &readers_key).await });
        }
    }
}

async fn release_readers(scripts: &ScriptManager, readers_key: &str) {
    if let Err(e) = scripts
        .eval_i64(Script::ReadRelease, vec![readers_key.to_string()], vec![])
        .await
    {
        warn!(key = %readers_key, error = %e, "read lock release failed; lease will expire it");
    }
}

/// Take a shared read lock on `key`, failing fast with `Busy` while a
/// writer holds the entry. The reader counter's expiry is refreshed to the
/// full TTL on every acquire.
pub async fn acquire_read(
    scripts: &Arc<ScriptManager>,
    keyspace: &KeySpace,
    key: &str,
    ttl_ms: u64,
) -> Result<ReadGuard> {
    let res = scripts
        .eval_i64(
            Script::ReadAcquire,
            vec![keyspace.write_lock(key), keyspace.readers(key)],
            vec![ttl_ms.to_string()],
        )
        .await?;
    if res != 1 {
        debug!(%key, "read lock blocked by writer");
        return Err(CacheError::Busy {
            key: key.to_string(),
            reason: "write lock held",
        });
    }
    Ok(ReadGuard {
        scripts: Arc::clone(scripts),
        readers_key: keyspace.readers(key),
        released: false,
    })
}

// ---------------------------------------------------------------------------
// Write lock
// ---------------------------------------------------------------------------

/// Exclusive write lock on one entry, identified by its token.
pub struct WriteGuard {
    scripts: Arc<ScriptManager>,
    write_key: String,
    token: String,
    released: bool,
}

impl WriteGuard {
    /// Delete the write-lock key, but only if it still holds this guard's
    /// token. Infallible from the caller's view.
    pub async fn release(mut self) {
        self.released = true;
        release_writer(&self.scripts, &self.write_key, &self.token).await;
    }

    /// The 128-bit token identifying this acquisition.
    pub fn token(&self) -> &str {
        &self.token
    }
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let scripts = Arc::clone(&self.scripts);
        let write_key = std::mem::take(&mut self.write_key);
        let token = std::mem::take(&mut self.token);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move { release_writer(&scripts, &write_key, &token).await });
        }
    }
}

async fn release_writer(scripts: &ScriptManager, write_key: &str, token: &str) {
    match scripts
        .eval_i64(
            Script::WriteRelease,
            vec![write_key.to_string()],
            vec![token.to_string()],
        )
        .await
    {
        Ok(1) => {}
        Ok(_) => {
            // Lease expired and someone else may own the key now; the
            // token check protected them from us.
            debug!(key = %write_key, "write lock already expired or re-acquired");
        }
        Err(e) => {
            warn!(key = %write_key, error = %e, "write lock release failed; lease will expire it");
        }
    }
}

/// Take the exclusive write lock on `key` with a fresh token.
///
/// Fails with `Busy` when another writer holds the entry or when the reader
/// counter is non-zero; the two cases carry distinct descriptive text. The
/// reader count is never promoted to a write lock: a waiting writer backs
/// off and retries (see the blocking wrappers).
pub async fn acquire_write(
    scripts: &Arc<ScriptManager>,
    keyspace: &KeySpace,
    key: &str,
    ttl_ms: u64,
) -> Result<WriteGuard> {
    let token = fresh_token();
    let res = scripts
        .eval_i64(
            Script::WriteAcquire,
            vec![keyspace.write_lock(key), keyspace.readers(key)],
            vec![token.clone(), ttl_ms.to_string()],
        )
        .await?;
    match res {
        1 => Ok(WriteGuard {
            scripts: Arc::clone(scripts),
            write_key: keyspace.write_lock(key),
            token,
            released: false,
        }),
        -1 => {
            debug!(%key, "write lock blocked by readers");
            Err(CacheError::Busy {
                key: key.to_string(),
                reason: "readers present",
            })
        }
        _ => {
            debug!(%key, "write lock held by another writer");
            Err(CacheError::Busy {
                key: key.to_string(),
                reason: "write lock held by another writer",
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Eviction fence and purge mutex
// ---------------------------------------------------------------------------

/// Atomically verify that no writer and no readers hold `key`, and plant
/// the eviction fence. `true` means it is currently safe to unlink the
/// entry's file; the fence is never released and expires on its own.
pub async fn try_acquire_evict_fence(
    scripts: &Arc<ScriptManager>,
    keyspace: &KeySpace,
    key: &str,
) -> Result<bool> {
    let res = scripts
        .eval_i64(
            Script::EvictFence,
            vec![
                keyspace.write_lock(key),
                keyspace.readers(key),
                keyspace.evict_fence(key),
            ],
            vec![EVICT_FENCE_TTL_MS.to_string()],
        )
        .await?;
    Ok(res == 1)
}

/// Try to become the purger via `SET NX PX` on the namespace-wide mutex.
///
/// The mutex is never released on success; its TTL bounds how often any
/// process can purge, acting as a rate limiter across the fleet.
pub async fn try_acquire_purge_mutex(
    pool: &Pool,
    keyspace: &KeySpace,
    ttl_ms: u64,
) -> Result<bool> {
    let result: Option<String> = pool
        .set(
            keyspace.purge_mutex(),
            "1",
            Some(Expiration::PX(ttl_ms as i64)),
            Some(SetOptions::NX),
            false,
        )
        .await?;
    // SET … NX returns "OK" when the key was set, nil otherwise.
    Ok(result.is_some())
}
