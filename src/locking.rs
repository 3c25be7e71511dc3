//! Distributed refresh locking
//!
//! Refreshes for the same connection must be serialized across broker
//! instances. The lock is a key-value entry with a TTL and an owner token:
//! acquisition is a set-if-absent loop, release deletes only when the owner
//! token still matches, so an expired lease taken over by another contender
//! is never released by the original holder.
//!
//! The [`KvStore`] trait abstracts the backing store. The in-memory store
//! serializes within a single process; the Redis store (behind the
//! `redis-lock` feature) extends that across instances.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use uuid::Uuid;

use crate::config::LockConfig;
use crate::error::BrokerError;

/// Minimal key-value operations needed for leases.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Set `key` to `value` with a TTL, only if absent. Returns whether the
    /// write happened.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, BrokerError>;

    async fn get(&self, key: &str) -> Result<Option<String>, BrokerError>;

    /// Delete `key` only if it still holds `value`.
    async fn delete_if_value(&self, key: &str, value: &str) -> Result<(), BrokerError>;
}

/// Process-local store backed by a mutex-guarded map with lazy expiry.
#[derive(Default)]
pub struct InMemoryKvStore {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn purge_expired(entries: &mut HashMap<String, (String, Instant)>, key: &str) {
        if let Some((_, deadline)) = entries.get(key)
            && *deadline <= Instant::now()
        {
            entries.remove(key);
        }
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, BrokerError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| BrokerError::Internal(anyhow::anyhow!("lock store poisoned")))?;
        Self::purge_expired(&mut entries, key);
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BrokerError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| BrokerError::Internal(anyhow::anyhow!("lock store poisoned")))?;
        Self::purge_expired(&mut entries, key);
        Ok(entries.get(key).map(|(value, _)| value.clone()))
    }

    async fn delete_if_value(&self, key: &str, value: &str) -> Result<(), BrokerError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| BrokerError::Internal(anyhow::anyhow!("lock store poisoned")))?;
        if entries.get(key).is_some_and(|(held, _)| held == value) {
            entries.remove(key);
        }
        Ok(())
    }
}

/// Redis-backed store for multi-instance deployments.
#[cfg(feature = "redis-lock")]
pub struct RedisKvStore {
    client: redis::Client,
}

#[cfg(feature = "redis-lock")]
impl RedisKvStore {
    pub fn new(url: &str) -> Result<Self, BrokerError> {
        let client = redis::Client::open(url)
            .map_err(|e| BrokerError::Internal(anyhow::anyhow!("invalid redis url: {e}")))?;
        Ok(Self { client })
    }
}

#[cfg(feature = "redis-lock")]
#[async_trait]
impl KvStore for RedisKvStore {
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, BrokerError> {
        let mut conn = self
            .client
            .get_async_connection()
            .await
            .map_err(|e| BrokerError::Internal(anyhow::anyhow!("redis connect: {e}")))?;
        let result: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(|e| BrokerError::Internal(anyhow::anyhow!("redis set: {e}")))?;
        Ok(result.is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BrokerError> {
        let mut conn = self
            .client
            .get_async_connection()
            .await
            .map_err(|e| BrokerError::Internal(anyhow::anyhow!("redis connect: {e}")))?;
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| BrokerError::Internal(anyhow::anyhow!("redis get: {e}")))
    }

    async fn delete_if_value(&self, key: &str, value: &str) -> Result<(), BrokerError> {
        const SCRIPT: &str = r#"
            if redis.call('GET', KEYS[1]) == ARGV[1] then
                return redis.call('DEL', KEYS[1])
            end
            return 0
        "#;
        let mut conn = self
            .client
            .get_async_connection()
            .await
            .map_err(|e| BrokerError::Internal(anyhow::anyhow!("redis connect: {e}")))?;
        redis::Script::new(SCRIPT)
            .key(key)
            .arg(value)
            .invoke_async::<_, i64>(&mut conn)
            .await
            .map_err(|e| BrokerError::Internal(anyhow::anyhow!("redis del: {e}")))?;
        Ok(())
    }
}

/// Outcome of a lock acquisition attempt.
#[derive(Debug)]
pub enum AcquireOutcome {
    /// Lock acquired; the owner token must be passed back to `release`.
    Acquired { owner: String },
    /// Another holder kept the lock for the whole acquisition window.
    TimedOut,
}

/// Lease-based lock for refresh coordination.
pub struct RefreshLock<S: KvStore + ?Sized> {
    store: std::sync::Arc<S>,
    config: LockConfig,
}

impl<S: KvStore + ?Sized> RefreshLock<S> {
    pub fn new(store: std::sync::Arc<S>, config: LockConfig) -> Self {
        Self { store, config }
    }

    /// Lock key for a connection's refresh.
    pub fn key(environment_id: Uuid, provider_config_key: &str, connection_id: &str) -> String {
        format!("lock:refresh:{environment_id}:{provider_config_key}:{connection_id}")
    }

    /// Try to acquire the lock, polling until the acquisition window closes.
    pub async fn acquire(&self, key: &str) -> Result<AcquireOutcome, BrokerError> {
        let owner = Uuid::new_v4().to_string();
        let ttl = Duration::from_millis(self.config.ttl_ms);
        let deadline = Instant::now() + Duration::from_millis(self.config.acquisition_timeout_ms);

        loop {
            if self.store.set_nx(key, &owner, ttl).await? {
                return Ok(AcquireOutcome::Acquired { owner });
            }
            if Instant::now() >= deadline {
                return Ok(AcquireOutcome::TimedOut);
            }
            tokio::time::sleep(Duration::from_millis(self.config.poll_interval_ms)).await;
        }
    }

    /// Release the lock if we still own it.
    pub async fn release(&self, key: &str, owner: &str) -> Result<(), BrokerError> {
        self.store.delete_if_value(key, owner).await
    }
}
