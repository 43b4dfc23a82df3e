//! LRU, size, total-bytes, and key-set bookkeeping in the coordination
//! store.
//!
//! Publish and eviction each touch four structures: the size hash, the
//! total-bytes counter, the key set, and the LRU sorted set. The updates
//! are individual commands, not a transaction; a crash between them leaves
//! drift that the eviction engine tolerates and repairs.

use std::collections::HashMap;

use fred::clients::Pool;
use fred::interfaces::{HashesInterface, KeysInterface, SetsInterface, SortedSetsInterface};
use tracing::trace;

use crate::coordination::keys::KeySpace;
use crate::error::Result;

/// Milliseconds since the Unix epoch. Only ordering matters for LRU scores.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Refresh `key`'s last-access score in the LRU index.
pub async fn touch(pool: &Pool, ks: &KeySpace, key: &str, ts_ms: i64) -> Result<()> {
    let _: () = pool
        .zadd(ks.lru_index(), None, None, false, false, vec![(ts_ms as f64, key)])
        .await?;
    Ok(())
}

/// Record a freshly published entry: size, running total, key-set
/// membership, and an initial LRU score.
pub async fn add_on_publish(
    pool: &Pool,
    ks: &KeySpace,
    key: &str,
    size: i64,
    ts_ms: i64,
) -> Result<()> {
    let _: () = pool
        .hset(ks.size_index(), vec![(key.to_string(), size.to_string())])
        .await?;
    let _: () = pool.incr_by(ks.total_bytes(), size).await?;
    let _: () = pool.sadd(ks.key_set(), key).await?;
    touch(pool, ks, key, ts_ms).await?;
    trace!(%key, size, "index entries added on publish");
    Ok(())
}

/// Drop every index entry for an evicted key and subtract its recorded
/// size from the running total.
pub async fn remove_on_delete(pool: &Pool, ks: &KeySpace, key: &str, size: i64) -> Result<()> {
    let _: () = pool.hdel(ks.size_index(), key).await?;
    let _: () = pool.incr_by(ks.total_bytes(), -size).await?;
    let _: () = pool.zrem(ks.lru_index(), key).await?;
    let _: () = pool.srem(ks.key_set(), key).await?;
    trace!(%key, size, "index entries removed on delete");
    Ok(())
}

/// Recorded byte size for `key`, if the size hash still knows it.
pub async fn size_of(pool: &Pool, ks: &KeySpace, key: &str) -> Result<Option<i64>> {
    let size: Option<String> = pool.hget(ks.size_index(), key).await?;
    Ok(size.and_then(|s| s.parse().ok()))
}

/// Current value of the total-bytes counter. An absent key reads as zero.
pub async fn total_bytes(pool: &Pool, ks: &KeySpace) -> Result<i64> {
    let total: Option<String> = pool.get(ks.total_bytes()).await?;
    Ok(total.and_then(|s| s.parse().ok()).unwrap_or(0))
}

/// All published keys, per the key set.
pub async fn all_keys(pool: &Pool, ks: &KeySpace) -> Result<Vec<String>> {
    Ok(pool.smembers(ks.key_set()).await?)
}

/// Rebuild the total-bytes counter from the size hash.
///
/// Called by the purger when it observes the counter out of step with an
/// empty LRU index, the one place drift is directly visible. Returns the
/// rebuilt total.
pub async fn reset_total_from_sizes(pool: &Pool, ks: &KeySpace) -> Result<i64> {
    let sizes: HashMap<String, String> = pool.hgetall(ks.size_index()).await?;
    let total: i64 = sizes.values().filter_map(|v| v.parse::<i64>().ok()).sum();
    let _: () = pool.set(ks.total_bytes(), total, None, None, false).await?;
    Ok(total)
}
