//! Single-process `StateStore`, grounded on an `RpcCache`-style
//! (`src/cache.rs`) shape: a `DashMap` keyed on the store key, entries carrying
//! an `Instant`-based expiry checked lazily on read.

use super::{retry_with_backoff, LockGuard, StateStore};
use crate::error::PaymcpResult;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        matches!(self.expires_at, Some(at) if Instant::now() > at)
    }
}

/// In-process lock state: holder token plus expiry, so a crashed holder's
/// lock self-heals once its TTL elapses instead of wedging the store.
struct LockEntry {
    token: String,
    expires_at: Instant,
}

#[derive(Default)]
pub struct InMemoryStore {
    data: Arc<DashMap<String, Entry>>,
    locks: Arc<DashMap<String, LockEntry>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn try_acquire(&self, key: &str, ttl: Duration) -> Option<String> {
        let now = Instant::now();
        let token = Uuid::new_v4().to_string();

        let mut acquired = None;
        self.locks
            .entry(key.to_string())
            .and_modify(|existing| {
                if now > existing.expires_at {
                    existing.token = token.clone();
                    existing.expires_at = now + ttl;
                    acquired = Some(token.clone());
                }
            })
            .or_insert_with(|| {
                acquired = Some(token.clone());
                LockEntry { token: token.clone(), expires_at: now + ttl }
            });

        acquired
    }
}

#[async_trait]
impl StateStore for InMemoryStore {
    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> PaymcpResult<()> {
        self.data.insert(
            key.to_string(),
            Entry { value, expires_at: ttl.map(|d| Instant::now() + d) },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> PaymcpResult<Option<Value>> {
        if let Some(entry) = self.data.get(key) {
            if entry.is_expired() {
                drop(entry);
                self.data.remove(key);
                return Ok(None);
            }
            return Ok(Some(entry.value.clone()));
        }
        Ok(None)
    }

    async fn delete(&self, key: &str) -> PaymcpResult<()> {
        self.data.remove(key);
        Ok(())
    }

    async fn lock(&self, key: &str, ttl: Duration) -> PaymcpResult<LockGuard> {
        let key = key.to_string();
        let token = retry_with_backoff(|| {
            let acquired = self.try_acquire(&key, ttl);
            async move { acquired }
        })
        .await?;
        Ok(LockGuard { token, key })
    }

    async fn unlock(&self, guard: LockGuard) -> PaymcpResult<()> {
        if let Some(entry) = self.locks.get(&guard.key) {
            if entry.token == guard.token {
                drop(entry);
                self.locks.remove(&guard.key);
            }
        }
        Ok(())
    }
}
