use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{CacheError, Result};

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Constructor inputs for a [`crate::FileCache`] handle.
///
/// All fields except `cache_dir` have defaults, so a YAML file containing
/// only `cache_dir: /var/cache/blobs` is a valid configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Local directory holding one file per published entry. Created on
    /// handle construction if absent.
    pub cache_dir: PathBuf,
    /// Coordination service endpoint.
    #[serde(default)]
    pub coordination: CoordinationConfig,
    /// Lease length (milliseconds) for read and write locks. A crashed
    /// process cannot wedge an entry for longer than this.
    #[serde(default = "default_lock_ttl_ms")]
    pub lock_ttl_ms: u64,
    /// Prefix for every coordination key this handle touches.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Capacity bound in bytes. `0` disables eviction entirely.
    #[serde(default)]
    pub max_bytes: u64,
    /// TTL (milliseconds) of the purge mutex. The mutex is never released,
    /// so this doubles as the minimum interval between eviction passes.
    #[serde(default = "default_purge_mutex_ttl_ms")]
    pub purge_mutex_ttl_ms: u64,
    /// Once usage exceeds `max_bytes`, eviction shrinks the cache to
    /// `(1 - purge_factor) * max_bytes`. Must be within `[0.0, 1.0]`.
    #[serde(default = "default_purge_factor")]
    pub purge_factor: f64,
}

impl CacheConfig {
    /// A configuration with every field at its default except `cache_dir`.
    pub fn new<P: Into<PathBuf>>(cache_dir: P) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            coordination: CoordinationConfig::default(),
            lock_ttl_ms: default_lock_ttl_ms(),
            namespace: default_namespace(),
            max_bytes: 0,
            purge_mutex_ttl_ms: default_purge_mutex_ttl_ms(),
            purge_factor: default_purge_factor(),
        }
    }
}

fn default_lock_ttl_ms() -> u64 {
    60_000
}

fn default_namespace() -> String {
    "poc-cache".to_string()
}

fn default_purge_mutex_ttl_ms() -> u64 {
    2_000
}

fn default_purge_factor() -> f64 {
    0.2
}

// ---------------------------------------------------------------------------
// Coordination endpoint
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct CoordinationConfig {
    /// Hostname or address of the coordination server.
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Logical database id, selected at connect time.
    #[serde(default)]
    pub db: u8,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            db: 0,
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    6379
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`CacheConfig`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<CacheConfig> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path).map_err(|e| {
        CacheError::Config(format!("failed to read config file {}: {e}", path.display()))
    })?;
    let config: CacheConfig = serde_yaml::from_str(&contents).map_err(|e| {
        CacheError::Config(format!("failed to parse config file {}: {e}", path.display()))
    })?;
    validate_config(&config)?;
    Ok(config)
}

/// Sanity checks that cannot be expressed purely with serde.
pub(crate) fn validate_config(config: &CacheConfig) -> Result<()> {
    if config.cache_dir.as_os_str().is_empty() {
        return Err(CacheError::Config("cache_dir must not be empty".to_string()));
    }
    if config.namespace.is_empty() {
        return Err(CacheError::Config("namespace must not be empty".to_string()));
    }
    if config.lock_ttl_ms == 0 {
        return Err(CacheError::Config("lock_ttl_ms must be positive".to_string()));
    }
    if config.purge_mutex_ttl_ms == 0 {
        return Err(CacheError::Config(
            "purge_mutex_ttl_ms must be positive".to_string(),
        ));
    }
    if !(0.0..=1.0).contains(&config.purge_factor) {
        return Err(CacheError::Config(format!(
            "purge_factor must be in [0.0, 1.0], got {}",
            config.purge_factor
        )));
    }
    Ok(())
}
