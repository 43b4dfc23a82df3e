//! Shared on-disk content cache coordinated through a Redis-compatible
//! server.
//!
//! `blobcache` stores opaque byte blobs as one file per key in a local
//! directory and keeps every cross-process concern in the coordination
//! server: single-writer / multi-reader locks with leases, LRU ordering,
//! capacity accounting, and single-purger election. Any number of
//! processes on any number of hosts can share the same directory safely;
//! a crashed process never wedges an entry for longer than the lock TTL.
//!
//! Entries are created once and never mutated. Publication is atomic
//! (scratch file + fsync + rename), so a reader sees either nothing or the
//! complete payload.
//!
//! ```no_run
//! use blobcache::{CacheConfig, FileCache};
//!
//! # async fn demo() -> blobcache::Result<()> {
//! let cache = FileCache::new(CacheConfig::new("/var/cache/blobs")).await?;
//! cache.create("report.bin", b"payload").await?;
//! let bytes = cache.read("report.bin").await?;
//! assert_eq!(bytes, b"payload");
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod coordination;
pub mod error;

pub use cache::{FileCache, DEFAULT_BACKOFF};
pub use config::{load_config, CacheConfig, CoordinationConfig};
pub use error::{CacheError, Result};
