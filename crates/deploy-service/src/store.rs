//! Key-value storage with expiry
//!
//! The deploy service keeps all of its state (the tracked deployment and the
//! mutable settings) behind [`KvStore`], so the same tracker runs against Redis
//! in production and an in-process map in tests and single-node setups.

use async_trait::async_trait;
use deploy_hooks_common::{Error, Result};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// String key-value store with optional per-key expiry.
///
/// Each call is atomic on its own; there is no multi-key transaction.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Get a live value, `None` if never set or expired
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Replace a value, resetting its expiry
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Remove a value, returning whether it existed
    async fn delete(&self, key: &str) -> Result<bool>;
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |exp| now < exp)
    }
}

/// In-process store, expired entries are dropped lazily on access
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    data: Arc<RwLock<HashMap<String, Entry>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        {
            let data = self.data.read().await;
            match data.get(key) {
                Some(entry) if entry.is_live(now) => return Ok(Some(entry.value.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }

        let mut data = self.data.write().await;
        if data.get(key).is_some_and(|entry| !entry.is_live(now)) {
            data.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut data = self.data.write().await;
        data.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut data = self.data.write().await;
        let now = Instant::now();
        Ok(data.remove(key).is_some_and(|entry| entry.is_live(now)))
    }
}

/// Redis-backed store
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connect to Redis
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| Error::Storage(format!("Failed to create Redis client: {}", e)))?;

        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| Error::Storage(format!("Failed to connect to Redis: {}", e)))?;

        info!("Connected to Redis at {}", redis_url);

        Ok(Self { conn })
    }
}

fn redis_error(e: redis::RedisError) -> Error {
    Error::Storage(e.to_string())
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        conn.get(key).await.map_err(redis_error)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn.clone();

        match ttl {
            // SET .. EX keeps value and expiry in one command
            Some(ttl) => {
                let secs = ttl.as_secs().max(1);
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("EX")
                    .arg(secs)
                    .query_async::<_, ()>(&mut conn)
                    .await
                    .map_err(redis_error)?;
            }
            None => {
                conn.set::<_, _, ()>(key, value).await.map_err(redis_error)?;
            }
        }

        debug!("Stored key: {}", key);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: usize = conn.del(key).await.map_err(redis_error)?;
        Ok(removed > 0)
    }
}
