//! Multi-process `StateStore`: `SET key value NX EX ttl`
//! for locking, an atomic compare-and-delete on release (a Lua script
//! against real Redis; an equivalent compare-and-swap against the fake),
//! and the shared exponential-backoff retry loop from `state::mod` for
//! acquisition. Grounded on a `FacilitatorClient`-style retry shape
//! in `x402/facilitator.rs` — same doubling/jitter policy, applied here to
//! lock acquisition instead of HTTP calls.

use super::{retry_with_backoff, LockGuard, StateStore};
use crate::error::{PaymcpError, PaymcpResult};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// The handful of Redis primitives PayMCP actually needs, abstracted so
/// `RedisLikeStore` can be exercised in tests without a live server.
#[async_trait]
pub trait RedisBackend: Send + Sync {
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> PaymcpResult<()>;
    async fn get(&self, key: &str) -> PaymcpResult<Option<String>>;
    async fn del(&self, key: &str) -> PaymcpResult<()>;
    /// `SET key value NX EX ttl`. `Ok(true)` iff the key was previously
    /// absent and is now set.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> PaymcpResult<bool>;
    /// Atomic "delete key iff its current value equals `expected`".
    async fn compare_and_delete(&self, key: &str, expected: &str) -> PaymcpResult<bool>;
}

const DEFAULT_PREFIX: &str = "paymcp:";

pub struct RedisLikeStore {
    backend: Arc<dyn RedisBackend>,
    prefix: String,
}

impl RedisLikeStore {
    pub fn new(backend: Arc<dyn RedisBackend>) -> Self {
        Self { backend, prefix: DEFAULT_PREFIX.to_string() }
    }

    pub fn with_prefix(backend: Arc<dyn RedisBackend>, prefix: impl Into<String>) -> Self {
        Self { backend, prefix: prefix.into() }
    }

    #[cfg(feature = "redis")]
    pub fn connect(client: redis::Client) -> Self {
        Self::new(Arc::new(RealRedisBackend { client }))
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

#[async_trait]
impl StateStore for RedisLikeStore {
    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> PaymcpResult<()> {
        let serialized = value.to_string();
        let key = self.key(key);
        match ttl {
            Some(ttl) => self.backend.set_ex(&key, &serialized, ttl).await,
            None => self.backend.set_ex(&key, &serialized, Duration::from_secs(365 * 24 * 3600)).await,
        }
    }

    async fn get(&self, key: &str) -> PaymcpResult<Option<Value>> {
        let key = self.key(key);
        match self.backend.get(&key).await? {
            // Corrupt JSON is logged and treated as a miss, never thrown,
            // since a malformed record must not wedge the calling flow.
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(value) => Ok(Some(value)),
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "corrupt JSON in state store entry");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> PaymcpResult<()> {
        self.backend.del(&self.key(key)).await
    }

    async fn lock(&self, key: &str, ttl: Duration) -> PaymcpResult<LockGuard> {
        let lock_key = format!("{}lock:{}", self.prefix, key);
        let token = retry_with_backoff(|| {
            let token = Uuid::new_v4().to_string();
            let lock_key = lock_key.clone();
            async move {
                match self.backend.set_nx_ex(&lock_key, &token, ttl).await {
                    Ok(true) => Some(token),
                    _ => None,
                }
            }
        })
        .await?;
        Ok(LockGuard { token, key: lock_key })
    }

    async fn unlock(&self, guard: LockGuard) -> PaymcpResult<()> {
        self.backend.compare_and_delete(&guard.key, &guard.token).await.map(|_| ())
    }
}

#[cfg(feature = "redis")]
struct RealRedisBackend {
    client: redis::Client,
}

#[cfg(feature = "redis")]
#[async_trait]
impl RedisBackend for RealRedisBackend {
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> PaymcpResult<()> {
        use redis::AsyncCommands;
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| PaymcpError::provider(e.to_string()))?;
        conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
            .await
            .map_err(|e| PaymcpError::provider(e.to_string()))
    }

    async fn get(&self, key: &str) -> PaymcpResult<Option<String>> {
        use redis::AsyncCommands;
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| PaymcpError::provider(e.to_string()))?;
        conn.get(key).await.map_err(|e| PaymcpError::provider(e.to_string()))
    }

    async fn del(&self, key: &str) -> PaymcpResult<()> {
        use redis::AsyncCommands;
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| PaymcpError::provider(e.to_string()))?;
        conn.del::<_, ()>(key).await.map_err(|e| PaymcpError::provider(e.to_string()))
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> PaymcpResult<bool> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| PaymcpError::provider(e.to_string()))?;
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async::<_, Option<String>>(&mut conn)
            .await
            .map(|reply| reply.is_some())
            .map_err(|e| PaymcpError::provider(e.to_string()))
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> PaymcpResult<bool> {
        const SCRIPT: &str = r#"
            if redis.call("GET", KEYS[1]) == ARGV[1] then
                return redis.call("DEL", KEYS[1])
            else
                return 0
            end
        "#;
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| PaymcpError::provider(e.to_string()))?;
        redis::Script::new(SCRIPT)
            .key(key)
            .arg(expected)
            .invoke_async::<_, i32>(&mut conn)
            .await
            .map(|deleted| deleted == 1)
            .map_err(|e| PaymcpError::provider(e.to_string()))
    }
}

/// An in-process stand-in for a real Redis server, used by tests and by
/// hosts that want `RedisLikeStore`'s lock semantics without an external
/// dependency. Not exposed to multiple processes, unlike its namesake.
pub struct FakeRedisBackend {
    inner: dashmap::DashMap<String, (String, std::time::Instant)>,
}

impl FakeRedisBackend {
    pub fn new() -> Self {
        Self { inner: dashmap::DashMap::new() }
    }

    fn is_live(entry: &(String, std::time::Instant)) -> bool {
        std::time::Instant::now() < entry.1
    }
}

impl Default for FakeRedisBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RedisBackend for FakeRedisBackend {
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> PaymcpResult<()> {
        self.inner.insert(key.to_string(), (value.to_string(), std::time::Instant::now() + ttl));
        Ok(())
    }

    async fn get(&self, key: &str) -> PaymcpResult<Option<String>> {
        match self.inner.get(key) {
            Some(entry) if Self::is_live(&entry) => Ok(Some(entry.0.clone())),
            Some(_) => {
                self.inner.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn del(&self, key: &str) -> PaymcpResult<()> {
        self.inner.remove(key);
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> PaymcpResult<bool> {
        let mut set = false;
        self.inner
            .entry(key.to_string())
            .and_modify(|existing| {
                if !Self::is_live(existing) {
                    *existing = (value.to_string(), std::time::Instant::now() + ttl);
                    set = true;
                }
            })
            .or_insert_with(|| {
                set = true;
                (value.to_string(), std::time::Instant::now() + ttl)
            });
        Ok(set)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> PaymcpResult<bool> {
        let matched = matches!(self.inner.get(key), Some(entry) if entry.0 == expected);
        if matched {
            self.inner.remove(key);
        }
        Ok(matched)
    }
}
