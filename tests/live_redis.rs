//! Integration tests against a live Redis-compatible server.
//!
//! Ignored by default; run them with a local server via
//! `cargo test -- --ignored`. The endpoint comes from `REDIS_HOST`,
//! `REDIS_PORT`, and `REDIS_DB` (defaults `127.0.0.1:6379` db 0). Every
//! test uses a fresh namespace and a fresh scratch directory so parallel
//! runs cannot interfere, and deletes its coordination keys on the way out.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use fred::clients::Pool;
use fred::interfaces::{ClientLike, HashesInterface, KeysInterface, SetsInterface, SortedSetsInterface};
use fred::types::{CustomCommand, Expiration, SetOptions};

use blobcache::coordination::keys::KeySpace;
use blobcache::coordination::locks;
use blobcache::coordination::redis::create_pool;
use blobcache::coordination::scripts::{Script, ScriptManager};
use blobcache::{CacheConfig, CacheError, CoordinationConfig, FileCache, DEFAULT_BACKOFF};

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

fn coordination_from_env() -> CoordinationConfig {
    CoordinationConfig {
        host: std::env::var("REDIS_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
        port: std::env::var("REDIS_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(6379),
        db: std::env::var("REDIS_DB")
            .ok()
            .and_then(|d| d.parse().ok())
            .unwrap_or(0),
    }
}

struct Harness {
    cache: FileCache,
    /// Direct server access, for injecting external lock state and
    /// inspecting the indices.
    pool: Pool,
    ks: KeySpace,
    // Held for its Drop: removes the scratch directory.
    dir: tempfile::TempDir,
}

async fn harness(configure: impl FnOnce(&mut CacheConfig)) -> Result<Harness> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let dir = tempfile::tempdir()?;
    let ns = format!("blobcache-test-{}", uuid::Uuid::new_v4().simple());

    let mut config = CacheConfig::new(dir.path());
    config.coordination = coordination_from_env();
    config.namespace = ns.clone();
    configure(&mut config);

    let cache = FileCache::new(config).await?;
    let pool = create_pool(&coordination_from_env()).await?;

    Ok(Harness {
        cache,
        pool,
        ks: KeySpace::new(ns),
        dir,
    })
}

impl Harness {
    /// Delete every coordination key under this test's namespace.
    async fn cleanup(&self) -> Result<()> {
        let pattern = format!("{}:*", self.ks.namespace());
        let keys: Vec<String> = self
            .pool
            .custom(CustomCommand::new_static("KEYS", None::<u16>, false), vec![pattern])
            .await?;
        if !keys.is_empty() {
            let _: i64 = self.pool.del(keys).await?;
        }
        Ok(())
    }

    /// Plant an external write lock on `key`, as another process would.
    async fn inject_write_lock(&self, key: &str, ttl_ms: i64) -> Result<()> {
        let result: Option<String> = self
            .pool
            .set(
                self.ks.write_lock(key),
                "external-holder",
                Some(Expiration::PX(ttl_ms)),
                Some(SetOptions::NX),
                false,
            )
            .await?;
        anyhow::ensure!(result.is_some(), "external lock injection raced something");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// S1 / S2: round trip and create-only semantics
// ---------------------------------------------------------------------------

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn create_then_read_round_trips_and_indexes() -> Result<()> {
    let h = harness(|_| {}).await?;

    h.cache.create("k-00.bin", b"hello world").await?;
    let bytes = h.cache.read("k-00.bin").await?;
    assert_eq!(bytes, b"hello world");

    // Index invariants: size entry, running total, key-set membership, and
    // an LRU score must all exist for a published key.
    let size: Option<String> = h.pool.hget(h.ks.size_index(), "k-00.bin").await?;
    assert_eq!(size.as_deref(), Some("11"));
    assert_eq!(h.cache.total_bytes().await?, 11);
    let member: bool = h.pool.sismember(h.ks.key_set(), "k-00.bin").await?;
    assert!(member);
    let score: Option<f64> = h.pool.zscore(h.ks.lru_index(), "k-00.bin").await?;
    assert!(score.is_some());

    assert_eq!(h.cache.keys().await?, vec!["k-00.bin".to_string()]);

    h.cleanup().await
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn second_create_fails_and_preserves_payload() -> Result<()> {
    let h = harness(|_| {}).await?;

    h.cache.create("k-00.bin", b"hello world").await?;
    let err = h.cache.create("k-00.bin", b"xyz").await.unwrap_err();
    assert!(matches!(err, CacheError::AlreadyExists(_)));

    assert_eq!(h.cache.read("k-00.bin").await?, b"hello world");
    h.cleanup().await
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn binary_payloads_round_trip_byte_equal() -> Result<()> {
    let h = harness(|_| {}).await?;

    let payload: Vec<u8> = (0..=255u8).cycle().take(300_000).collect();
    h.cache.create("blob.bin", &payload).await?;
    assert_eq!(h.cache.read("blob.bin").await?, payload);

    h.cleanup().await
}

// ---------------------------------------------------------------------------
// S3: external write lock blocks readers until its lease expires
// ---------------------------------------------------------------------------

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn external_write_lock_blocks_reads_until_ttl() -> Result<()> {
    let h = harness(|_| {}).await?;

    h.cache.create("k.bin", b"payload").await?;
    h.inject_write_lock("k.bin", 3_000).await?;

    let err = h.cache.read("k.bin").await.unwrap_err();
    assert!(matches!(err, CacheError::Busy { .. }));

    // The holder crashed, so nobody releases the lock; the lease does.
    tokio::time::sleep(Duration::from_millis(3_200)).await;
    assert_eq!(h.cache.read("k.bin").await?, b"payload");

    h.cleanup().await
}

// ---------------------------------------------------------------------------
// S4 / S5: blocking wrappers against a leased external lock
// ---------------------------------------------------------------------------

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn create_blocking_times_out_then_succeeds_after_ttl() -> Result<()> {
    let h = harness(|_| {}).await?;

    h.inject_write_lock("k.bin", 1_000).await?;

    // Deadline shorter than the lease: must give up, and the file must not
    // appear.
    let created = h
        .cache
        .create_blocking(
            "k.bin",
            b"data",
            Duration::from_millis(500),
            Duration::from_millis(20),
        )
        .await?;
    assert!(!created);
    assert!(!h.cache.exists("k.bin")?);

    // Deadline past the lease: the retry loop wins once the lock expires.
    let created = h
        .cache
        .create_blocking(
            "k.bin",
            b"data",
            Duration::from_millis(1_500),
            Duration::from_millis(20),
        )
        .await?;
    assert!(created);
    assert!(h.cache.exists("k.bin")?);

    h.cleanup().await
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn read_blocking_times_out_then_returns_payload() -> Result<()> {
    let h = harness(|_| {}).await?;

    h.cache.create("k.bin", b"payload").await?;
    h.inject_write_lock("k.bin", 1_000).await?;

    let out = h
        .cache
        .read_blocking("k.bin", Duration::from_millis(500), Duration::from_millis(20))
        .await?;
    assert!(out.is_none());

    let out = h
        .cache
        .read_blocking("k.bin", Duration::from_millis(1_500), Duration::from_millis(20))
        .await?;
    assert_eq!(out.as_deref(), Some(b"payload".as_slice()));

    h.cleanup().await
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn read_blocking_retries_not_yet_published_entries() -> Result<()> {
    let h = harness(|_| {}).await?;

    // Nothing published: the wrapper keeps retrying NotFound to its
    // deadline instead of failing fast.
    let start = tokio::time::Instant::now();
    let out = h
        .cache
        .read_blocking("late.bin", Duration::from_millis(200), DEFAULT_BACKOFF)
        .await?;
    assert!(out.is_none());
    assert!(start.elapsed() >= Duration::from_millis(200));

    h.cleanup().await
}

// ---------------------------------------------------------------------------
// S6: capacity enforcement evicts in LRU order
// ---------------------------------------------------------------------------

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn capacity_bound_evicts_oldest_entries() -> Result<()> {
    // Tiny purge-mutex TTL so consecutive publishes can each win the
    // purger election inside one test run.
    let h = harness(|c| {
        c.max_bytes = 8_192;
        c.purge_mutex_ttl_ms = 10;
    })
    .await?;

    let payload = vec![0xA5u8; 4_096];
    for i in 0..6 {
        h.cache.create(&format!("k-{i:02}.bin"), &payload).await?;
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tokio::time::sleep(Duration::from_millis(80)).await;

    // The purger is best-effort and only runs on publish; one more small
    // publish drives the final pass now that the mutex TTL has expired.
    h.cache.create("k-settle.bin", b"x").await?;

    assert!(h.cache.total_bytes().await? <= 8_192);

    let mut evicted_old = 0;
    for i in 0..3 {
        let key = format!("k-{i:02}.bin");
        let on_disk = h.cache.exists(&key)?;
        let size: Option<String> = h.pool.hget(h.ks.size_index(), key.as_str()).await?;
        if !on_disk {
            assert!(size.is_none(), "{key} evicted from disk but not from the size index");
            evicted_old += 1;
        }
    }
    assert!(evicted_old >= 1, "expected at least one of the oldest three entries to be evicted");

    h.cleanup().await
}

// ---------------------------------------------------------------------------
// Lock protocol invariants
// ---------------------------------------------------------------------------

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn stale_token_cannot_release_the_write_lock() -> Result<()> {
    let h = harness(|_| {}).await?;
    let scripts = Arc::new(ScriptManager::load(h.pool.clone()).await?);

    let guard = locks::acquire_write(&scripts, &h.ks, "k.bin", 60_000).await?;

    // A caller whose lease expired must not be able to delete the current
    // holder's lock with its old token.
    let released = scripts
        .eval_i64(
            Script::WriteRelease,
            vec![h.ks.write_lock("k.bin")],
            vec!["0123456789abcdef0123456789abcdef".to_string()],
        )
        .await?;
    assert_eq!(released, 0);
    let held: bool = h.pool.exists(h.ks.write_lock("k.bin")).await?;
    assert!(held);

    guard.release().await;
    let held: bool = h.pool.exists(h.ks.write_lock("k.bin")).await?;
    assert!(!held);

    h.cleanup().await
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn readers_block_writers_until_released() -> Result<()> {
    let h = harness(|_| {}).await?;
    let scripts = Arc::new(ScriptManager::load(h.pool.clone()).await?);

    let guard = locks::acquire_read(&scripts, &h.ks, "k.bin", 60_000).await?;

    let err = h.cache.create("k.bin", b"data").await.unwrap_err();
    match err {
        CacheError::Busy { reason, .. } => assert!(reason.contains("readers")),
        other => panic!("expected Busy, got {other:?}"),
    }

    guard.release().await;
    h.cache.create("k.bin", b"data").await?;

    h.cleanup().await
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn writers_block_readers_and_other_writers() -> Result<()> {
    let h = harness(|_| {}).await?;
    let scripts = Arc::new(ScriptManager::load(h.pool.clone()).await?);

    let guard = locks::acquire_write(&scripts, &h.ks, "k.bin", 60_000).await?;

    assert!(matches!(
        locks::acquire_read(&scripts, &h.ks, "k.bin", 60_000).await,
        Err(CacheError::Busy { .. })
    ));
    assert!(matches!(
        locks::acquire_write(&scripts, &h.ks, "k.bin", 60_000).await,
        Err(CacheError::Busy { .. })
    ));

    guard.release().await;
    h.cleanup().await
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn releasing_an_absent_lock_is_a_quiet_noop() -> Result<()> {
    let h = harness(|_| {}).await?;
    let scripts = Arc::new(ScriptManager::load(h.pool.clone()).await?);

    // Release of an expired or never-acquired lock must not error; the
    // script deletes the counter it just drove negative.
    for _ in 0..2 {
        let res = scripts
            .eval_i64(Script::ReadRelease, vec![h.ks.readers("ghost.bin")], vec![])
            .await?;
        assert_eq!(res, 1);
        let lingering: bool = h.pool.exists(h.ks.readers("ghost.bin")).await?;
        assert!(!lingering);
    }

    let res = scripts
        .eval_i64(
            Script::WriteRelease,
            vec![h.ks.write_lock("ghost.bin")],
            vec!["0123456789abcdef0123456789abcdef".to_string()],
        )
        .await?;
    assert_eq!(res, 0);

    h.cleanup().await
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn invalid_keys_fail_before_any_io() -> Result<()> {
    let h = harness(|_| {}).await?;

    for key in ["", ".hidden", "a/b"] {
        assert!(matches!(h.cache.exists(key), Err(CacheError::InvalidKey(_))));
        assert!(matches!(
            h.cache.read(key).await,
            Err(CacheError::InvalidKey(_))
        ));
        assert!(matches!(
            h.cache.create(key, b"x").await,
            Err(CacheError::InvalidKey(_))
        ));
    }
    // Nothing may have been written to the cache directory.
    assert_eq!(std::fs::read_dir(h.dir.path())?.count(), 0);

    h.cleanup().await
}
