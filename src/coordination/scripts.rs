//! Lua scripts for the lock protocol, pre-loaded by content hash.
//!
//! Each lock transition is one script evaluated atomically on the server,
//! which is what makes the protocol correct without any client-side
//! critical section. Scripts are registered once per handle via
//! `SCRIPT LOAD`; if the server later evicts its script cache (reported as
//! a NOSCRIPT error), the script is re-registered and the call retried
//! exactly once.

use std::collections::HashMap;
use std::sync::Mutex;

use fred::clients::Pool;
use fred::interfaces::LuaInterface;
use tracing::{debug, warn};

use crate::error::Result;

// ---------------------------------------------------------------------------
// Script bodies
// ---------------------------------------------------------------------------

// KEYS[1] = write lock, KEYS[2] = reader counter. ARGV[1] = ttl_ms.
// The counter's expiry is refreshed on every acquire so a dead reader
// cannot pin it past the lease.
const READ_ACQUIRE: &str = r#"
local wl = KEYS[1]
local rd = KEYS[2]
local ttl = tonumber(ARGV[1])
if redis.call('EXISTS', wl) == 1 then return 0 end
redis.call('INCR', rd)
redis.call('PEXPIRE', rd, ttl)
return 1
"#;

// KEYS[1] = reader counter.
const READ_RELEASE: &str = r#"
local rd = KEYS[1]
local c = redis.call('DECR', rd)
if c <= 0 then redis.call('DEL', rd) end
return 1
"#;

// KEYS[1] = write lock, KEYS[2] = reader counter.
// ARGV[1] = token, ARGV[2] = ttl_ms.
// Returns 1 on success, 0 when another writer holds the lock, -1 when
// readers are present.
const WRITE_ACQUIRE: &str = r#"
local wl = KEYS[1]
local rd = KEYS[2]
local token = ARGV[1]
local ttl = tonumber(ARGV[2])
if redis.call('EXISTS', wl) == 1 then return 0 end
local rc = tonumber(redis.call('GET', rd) or "0")
if rc > 0 then return -1 end
local ok = redis.call('SET', wl, token, 'NX', 'PX', ttl)
if ok then return 1 else return 0 end
"#;

// KEYS[1] = write lock. ARGV[1] = token.
// Deletes only when the stored token matches, so a caller whose lease
// expired cannot release the next holder's lock.
const WRITE_RELEASE: &str = r#"
local wl = KEYS[1]
local token = ARGV[1]
local cur = redis.call('GET', wl)
if cur and cur == token then
    redis.call('DEL', wl)
    return 1
end
return 0
"#;

// KEYS[1] = write lock, KEYS[2] = reader counter, KEYS[3] = fence.
// ARGV[1] = fence ttl_ms. Success means neither a writer nor a reader
// holds the entry and the fence is now planted: it is safe to unlink.
const EVICT_FENCE: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then return 0 end
local rc = tonumber(redis.call('GET', KEYS[2]) or "0")
if rc > 0 then return 0 end
local ok = redis.call('SET', KEYS[3], '1', 'NX', 'PX', tonumber(ARGV[1]))
if ok then return 1 else return 0 end
"#;

/// Names for the pre-loaded lock scripts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Script {
    ReadAcquire,
    ReadRelease,
    WriteAcquire,
    WriteRelease,
    EvictFence,
}

impl Script {
    pub const ALL: [Script; 5] = [
        Script::ReadAcquire,
        Script::ReadRelease,
        Script::WriteAcquire,
        Script::WriteRelease,
        Script::EvictFence,
    ];

    pub fn body(self) -> &'static str {
        match self {
            Script::ReadAcquire => READ_ACQUIRE,
            Script::ReadRelease => READ_RELEASE,
            Script::WriteAcquire => WRITE_ACQUIRE,
            Script::WriteRelease => WRITE_RELEASE,
            Script::EvictFence => EVICT_FENCE,
        }
    }
}

// ---------------------------------------------------------------------------
// Script manager
// ---------------------------------------------------------------------------

/// Tracks the server-side identifier (SHA1) of every registered script.
pub struct ScriptManager {
    pool: Pool,
    shas: Mutex<HashMap<Script, String>>,
}

impl ScriptManager {
    /// Register every script with the server and remember its hash.
    pub async fn load(pool: Pool) -> Result<Self> {
        let mut shas = HashMap::new();
        for script in Script::ALL {
            let sha: String = pool.script_load(script.body()).await?;
            shas.insert(script, sha);
        }
        debug!(count = Script::ALL.len(), "lock scripts loaded");
        Ok(Self {
            pool,
            shas: Mutex::new(shas),
        })
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// EVALSHA returning an integer reply.
    ///
    /// A NOSCRIPT error means the server dropped its script cache (restart,
    /// `SCRIPT FLUSH`); the body is re-registered and the call retried once.
    /// Any other error surfaces as [`crate::CacheError::Coordination`].
    pub async fn eval_i64(
        &self,
        script: Script,
        keys: Vec<String>,
        args: Vec<String>,
    ) -> Result<i64> {
        let sha = self.current_sha(script);
        match self
            .pool
            .evalsha::<i64, _, _, _>(sha, keys.clone(), args.clone())
            .await
        {
            Ok(value) => Ok(value),
            Err(e) if e.to_string().contains("NOSCRIPT") => {
                warn!(?script, "script evicted from server cache, reloading");
                let sha: String = self.pool.script_load(script.body()).await?;
                self.set_sha(script, sha.clone());
                Ok(self.pool.evalsha(sha, keys, args).await?)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn current_sha(&self, script: Script) -> String {
        self.shas
            .lock()
            .expect("script table mutex poisoned")
            .get(&script)
            .cloned()
            .expect("script registered at load time")
    }

    fn set_sha(&self, script: Script, sha: String) {
        self.shas
            .lock()
            .expect("script table mutex poisoned")
            .insert(script, sha);
    }
}
