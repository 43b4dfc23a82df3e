//! Capacity enforcement: single-purger election, LRU victim selection, and
//! fenced removal.

use fred::interfaces::{SetsInterface, SortedSetsInterface};
use tracing::{debug, info, warn};

use crate::cache::index;
use crate::cache::manager::FileCache;
use crate::coordination::locks;
use crate::error::Result;

/// How many LRU-head candidates one eviction attempt will probe before
/// giving up. Probing more than one keeps a hot head entry from starving
/// eviction: each busy victim has its LRU score pushed forward, which would
/// otherwise make it the head again on the very next pass.
const EVICT_PROBE_LIMIT: usize = 8;

impl FileCache {
    /// Best-effort capacity enforcement, called after every publish when a
    /// capacity bound is configured.
    ///
    /// At most one process purges at a time: whoever wins the purge mutex
    /// evicts LRU victims until usage drops below the hysteresis target.
    /// The mutex is deliberately never released; its TTL is the minimum
    /// interval between purges, so losing the election just means another
    /// process purged recently. All errors are swallowed here because the
    /// purger is best-effort and the next publish will try again.
    pub(crate) async fn ensure_capacity(&self) {
        if self.max_bytes == 0 {
            return;
        }
        match locks::try_acquire_purge_mutex(&self.pool, &self.keyspace, self.purge_mutex_ttl_ms)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!("purge mutex held; another process purged recently");
                return;
            }
            Err(e) => {
                warn!(error = %e, "purge mutex acquisition failed");
                return;
            }
        }
        if let Err(e) = self.purge_loop().await {
            warn!(error = %e, "eviction pass aborted");
        }
    }

    async fn purge_loop(&self) -> Result<()> {
        let max = self.max_bytes as i64;
        if index::total_bytes(&self.pool, &self.keyspace).await? <= max {
            return Ok(());
        }

        // Hysteresis: once over the cap, shrink below it by purge_factor so
        // the very next publish does not re-trigger a purge.
        let target = ((1.0 - self.purge_factor) * max as f64) as i64;
        let mut evicted: usize = 0;
        let mut freed_bytes: i64 = 0;

        while index::total_bytes(&self.pool, &self.keyspace).await? > target {
            match self.try_evict_one().await? {
                Some((victim, freed)) => {
                    evicted += 1;
                    freed_bytes += freed;
                    debug!(%victim, freed, "evicted entry");
                }
                None => break,
            }
        }

        info!(evicted, freed_bytes, "eviction pass finished");
        Ok(())
    }

    /// One eviction attempt: pick the globally least-recently-used entry
    /// that nothing is reading or writing, unlink it, and clean its index
    /// entries. Returns the victim key and its freed bytes, or `None` when
    /// no candidate could be evicted this pass.
    pub(crate) async fn try_evict_one(&self) -> Result<Option<(String, i64)>> {
        let heads: Vec<String> = self
            .pool
            .zrange(
                self.keyspace.lru_index(),
                0,
                EVICT_PROBE_LIMIT as i64 - 1,
                None,
                false,
                None,
                false,
            )
            .await?;

        if heads.is_empty() {
            // Nothing is indexed. If the counter still claims bytes, a
            // crashed publish left it behind; rebuild it from the size hash.
            let total = index::total_bytes(&self.pool, &self.keyspace).await?;
            if total != 0 {
                let rebuilt = index::reset_total_from_sizes(&self.pool, &self.keyspace).await?;
                warn!(stale = total, rebuilt, "total-bytes counter drifted; reset from size index");
            }
            return Ok(None);
        }

        for key in heads {
            let size = match index::size_of(&self.pool, &self.keyspace, &key).await? {
                Some(size) => size,
                None => {
                    // Size record lost: the entry cannot be accounted for.
                    // Drop it from the ordering indices and move on.
                    let _: () = self.pool.zrem(self.keyspace.lru_index(), key.as_str()).await?;
                    let _: () = self.pool.srem(self.keyspace.key_set(), key.as_str()).await?;
                    debug!(%key, "cleaned drifted LRU entry with no size record");
                    continue;
                }
            };

            if !locks::try_acquire_evict_fence(&self.scripts, &self.keyspace, &key).await? {
                // Entry is being read or written right now. Push it toward
                // the warm end so the next probe does not re-select it.
                index::touch(&self.pool, &self.keyspace, &key, index::now_ms()).await?;
                debug!(%key, "victim busy; LRU score refreshed");
                continue;
            }

            match std::fs::remove_file(self.path_for(&key)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(%key, "victim already gone from disk; cleaning indices");
                }
                Err(e) => {
                    // The file is still there; cleaning the indices now
                    // would leak it from capacity accounting.
                    warn!(%key, error = %e, "unlink failed; leaving entry for a later pass");
                    return Ok(None);
                }
            }

            index::remove_on_delete(&self.pool, &self.keyspace, &key, size).await?;
            return Ok(Some((key, size)));
        }

        Ok(None)
    }
}
