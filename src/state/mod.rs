//! State Store: where flows persist payment records and locks.
//!
//! PayMCP's flows are stateless between JSON-RPC calls — everything a flow
//! needs to remember about an in-flight payment (its provider id, price,
//! the tool call it is gating, retry counters) lives behind the
//! `StateStore` trait. Two implementations ship: `memory::InMemoryStore`
//! for single-process hosts (grounded on the `RpcCache`
//! `DashMap`+`Instant` TTL pattern in `cache.rs`) and `redis::RedisLikeStore`
//! for multi-process hosts that need the `lock` primitive to actually mean
//! something across processes.

pub mod memory;
pub mod redis;

pub use memory::InMemoryStore;
pub use redis::{FakeRedisBackend, RedisBackend, RedisLikeStore};

use crate::error::PaymcpResult;
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::time::Duration;

/// A held lock. Dropping it without calling `release` leaves the lock to
/// expire on its own TTL — callers that panic mid-critical-section do not
/// wedge the store forever.
pub struct LockGuard {
    pub(crate) token: String,
    pub(crate) key: String,
}

/// Key-value store with TTL and a best-effort distributed lock.
/// Implementations must tolerate being shared across clones/tasks;
/// `Send + Sync` bound reflects that every flow holds a `dyn StateStore`
/// behind an `Arc`.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> PaymcpResult<()>;

    async fn get(&self, key: &str) -> PaymcpResult<Option<Value>>;

    async fn delete(&self, key: &str) -> PaymcpResult<()>;

    /// Attempts to acquire a named lock, retrying with exponential
    /// backoff (100ms base, doubling, capped at 2s, 10 attempts) before
    /// giving up with `LockAcquisitionFailed`.
    async fn lock(&self, key: &str, ttl: Duration) -> PaymcpResult<LockGuard>;

    /// Releases a lock previously returned by `lock`. A no-op if the lock
    /// already expired or was stolen (the guard's token no longer matches).
    async fn unlock(&self, guard: LockGuard) -> PaymcpResult<()>;
}

/// Convenience helpers built on top of the raw `Value` API, so flow code
/// isn't sprinkled with `serde_json::to_value`/`from_value` calls.
#[async_trait]
pub trait StateStoreExt: StateStore {
    async fn set_typed<T: Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> PaymcpResult<()> {
        let value = serde_json::to_value(value)
            .map_err(|e| crate::error::PaymcpError::validation(e.to_string()))?;
        self.set(key, value, ttl).await
    }

    async fn get_typed<T: DeserializeOwned>(&self, key: &str) -> PaymcpResult<Option<T>> {
        match self.get(key).await? {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| crate::error::PaymcpError::validation(e.to_string())),
            None => Ok(None),
        }
    }
}

impl<T: StateStore + ?Sized> StateStoreExt for T {}

pub(crate) const LOCK_BASE_DELAY: Duration = Duration::from_millis(100);
pub(crate) const LOCK_MAX_DELAY: Duration = Duration::from_secs(2);
pub(crate) const LOCK_MAX_ATTEMPTS: u32 = 10;

/// Shared backoff loop used by both the in-memory and redis-like stores: try
/// `attempt`, and on failure sleep `min(base * 2^n, max)` plus up to 50ms of
/// jitter (grounded on the `FacilitatorClient` retry loop in
/// `x402/facilitator.rs`, which uses the same doubling-plus-jitter shape for
/// HTTP retries).
pub(crate) async fn retry_with_backoff<F, Fut, T>(mut attempt: F) -> PaymcpResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Option<T>>,
{
    let mut delay = LOCK_BASE_DELAY;
    for n in 0..LOCK_MAX_ATTEMPTS {
        if let Some(value) = attempt().await {
            return Ok(value);
        }
        if n + 1 == LOCK_MAX_ATTEMPTS {
            break;
        }
        let jitter = Duration::from_millis(rand::random::<u64>() % 50);
        tokio::time::sleep(delay + jitter).await;
        delay = (delay * 2).min(LOCK_MAX_DELAY);
    }
    Err(crate::error::PaymcpError::LockAcquisitionFailed { attempts: LOCK_MAX_ATTEMPTS })
}
