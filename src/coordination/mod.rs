//! Distributed coordination layer backed by a Redis-compatible server.
//!
//! Provides the per-entry reader/writer locks, the eviction fence, the
//! purge mutex, and the key schema they all share. All coordination state
//! lives in the server so that cache processes on any number of hosts can
//! cooperate without a shared filesystem protocol.

pub mod keys;
pub mod locks;
pub mod redis;
pub mod scripts;
