//! Error kinds surfaced by cache operations.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CacheError>;

/// Everything a cache operation can fail with.
///
/// Lock release paths never produce errors: release is best-effort and the
/// lock lease guarantees eventual cleanup, so failures there are logged and
/// swallowed.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The key is empty, starts with `.` (reserved for scratch files), or
    /// contains `/`. Raised before any I/O or coordination call.
    #[error("invalid key {0:?}: keys must be simple filenames without '/' or a leading '.'")]
    InvalidKey(String),

    /// No published file exists for the key at read time.
    #[error("entry {0:?} not found")]
    NotFound(String),

    /// A published file already exists for the key at create time. Entries
    /// are immutable once published, so this is permanent.
    #[error("entry {0:?} already exists")]
    AlreadyExists(String),

    /// A coordination lock could not be acquired non-blockingly.
    #[error("entry {key:?} is busy: {reason}")]
    Busy { key: String, reason: &'static str },

    /// Filesystem failure other than the cases above (permissions, disk
    /// full, failed fsync or rename).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Coordination-service protocol failure (connection loss, unexpected
    /// reply type, unrecoverable script error).
    #[error("coordination error: {0}")]
    Coordination(#[from] fred::error::Error),

    /// The configuration could not be loaded or failed validation.
    #[error("config error: {0}")]
    Config(String),
}
