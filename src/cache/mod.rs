//! The on-disk cache: public handle, index bookkeeping, and the eviction
//! engine.

pub(crate) mod index;
pub mod manager;

mod eviction;

pub use manager::{FileCache, DEFAULT_BACKOFF};
