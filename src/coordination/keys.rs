//! Entry-key validation and the coordination-key schema.
//!
//! Every coordination key this crate touches is derived deterministically
//! from `(namespace, entry key)` so that independent processes agree on the
//! names without any handshake.

use crate::error::{CacheError, Result};

/// Check that `key` can name a cache entry.
///
/// Keys become filenames directly, so they must be non-empty, must not start
/// with `.` (reserved for scratch files), and must not contain `/`. Rejected
/// keys fail before any I/O or coordination call happens.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.starts_with('.') || key.contains('/') {
        return Err(CacheError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Derives coordination-key names under one namespace prefix.
#[derive(Debug, Clone)]
pub struct KeySpace {
    ns: String,
}

impl KeySpace {
    pub fn new<S: Into<String>>(namespace: S) -> Self {
        Self {
            ns: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.ns
    }

    /// Exclusive writer lease for one entry. Holds the writer's token.
    pub fn write_lock(&self, key: &str) -> String {
        format!("{}:lock:write:{key}", self.ns)
    }

    /// Shared reader counter for one entry.
    pub fn readers(&self, key: &str) -> String {
        format!("{}:lock:readers:{key}", self.ns)
    }

    /// Short-lived marker set while an entry is being removed.
    pub fn evict_fence(&self, key: &str) -> String {
        format!("{}:lock:evict:{key}", self.ns)
    }

    /// Single-purger election key, one per namespace.
    pub fn purge_mutex(&self) -> String {
        format!("{}:purge:mutex", self.ns)
    }

    /// Sorted set: entry key to last-access timestamp (ms), ascending.
    pub fn lru_index(&self) -> String {
        format!("{}:idx:lru", self.ns)
    }

    /// Hash: entry key to byte size.
    pub fn size_index(&self) -> String {
        format!("{}:idx:size", self.ns)
    }

    /// Set of all published keys, kept for discovery and tests.
    pub fn key_set(&self) -> String {
        format!("{}:keys:set", self.ns)
    }

    /// Integer counter: sum of all size-index values.
    pub fn total_bytes(&self) -> String {
        format!("{}:idx:total", self.ns)
    }
}
