//! Coordination client pool creation.
//!
//! Builds a [`fred::clients::Pool`] for the Redis-compatible server named in
//! [`crate::config::CoordinationConfig`]. The pool is initialised (connected
//! and PING-verified) before it is handed to the rest of the crate.

use fred::clients::Pool;
use fred::interfaces::ClientLike;
use fred::types::config::{Config as FredConfig, ReconnectPolicy, ServerConfig};
use fred::types::Builder;

use crate::config::CoordinationConfig;
use crate::error::Result;

/// Connection count per handle. One connection carries the synchronous
/// command stream; the spare services best-effort lock releases spawned by
/// dropped guards.
const POOL_SIZE: usize = 2;

/// Create a connection pool from the coordination endpoint configuration.
///
/// Selects the configured logical database at connect time and installs an
/// exponential reconnect policy, so a bounced server does not permanently
/// kill the handle.
pub async fn create_pool(config: &CoordinationConfig) -> Result<Pool> {
    let server = ServerConfig::new_centralized(config.host.as_str(), config.port);

    let fred_config = FredConfig {
        server,
        database: Some(config.db),
        ..FredConfig::default()
    };

    let mut builder = Builder::from_config(fred_config);
    // Exponential reconnect: initial 0ms, base 100ms, max 30s, factor 2.
    builder.set_policy(ReconnectPolicy::new_exponential(0, 100, 30_000, 2));

    let pool = builder.build_pool(POOL_SIZE)?;
    pool.init().await?;

    // Verify connectivity before anyone relies on the pool.
    let _: String = pool.ping(None).await?;

    tracing::debug!(
        host = %config.host,
        port = config.port,
        db = config.db,
        "coordination pool created and verified"
    );

    Ok(pool)
}
