//! Cache contract used for the Cached Grading State
//!
//! A hash-map-like store with multi-field set, multi-field get, delete and
//! list append. `RedisCache` is the production backend; `MemoryCache` keeps
//! the same semantics in-process for local runs and tests.

use async_trait::async_trait;
use ::redis::aio::ConnectionManager;
use ::redis::AsyncCommands;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache operation failed: {0}")]
    Backend(#[from] ::redis::RedisError),

    #[error("missing cached data for {key}")]
    Missing { key: String },

    #[error("corrupt cached field '{field}' in {key}: {reason}")]
    Corrupt {
        key: String,
        field: String,
        reason: String,
    },

    #[error("run {run_id} was superseded by a newer grading run")]
    Superseded { run_id: String },
}

#[async_trait]
pub trait CacheStore: Send + Sync {
    /// HSET with several fields at once
    async fn hset(&self, key: &str, fields: &[(&str, String)]) -> Result<(), CacheError>;

    /// HMGET; one slot per requested field, `None` where absent
    async fn hmget(&self, key: &str, fields: &[&str]) -> Result<Vec<Option<String>>, CacheError>;

    async fn del(&self, key: &str) -> Result<(), CacheError>;

    async fn rpush(&self, key: &str, values: &[String]) -> Result<(), CacheError>;

    async fn lrange(&self, key: &str) -> Result<Vec<String>, CacheError>;
}

/// Redis-backed cache sharing one auto-reconnecting connection
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
}

impl RedisCache {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl CacheStore for RedisCache {
    async fn hset(&self, key: &str, fields: &[(&str, String)]) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        conn.hset_multiple::<_, _, _, ()>(key, fields).await?;
        Ok(())
    }

    async fn hmget(&self, key: &str, fields: &[&str]) -> Result<Vec<Option<String>>, CacheError> {
        let mut conn = self.conn.clone();
        let values: Vec<Option<String>> = ::redis::cmd("HMGET")
            .arg(key)
            .arg(fields)
            .query_async(&mut conn)
            .await?;
        Ok(values)
    }

    async fn del(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn rpush(&self, key: &str, values: &[String]) -> Result<(), CacheError> {
        if values.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        conn.rpush::<_, _, ()>(key, values).await?;
        Ok(())
    }

    async fn lrange(&self, key: &str) -> Result<Vec<String>, CacheError> {
        let mut conn = self.conn.clone();
        let values: Vec<String> = conn.lrange(key, 0, -1).await?;
        Ok(values)
    }
}

#[derive(Debug, Clone)]
enum Entry {
    Hash(HashMap<String, String>),
    List(Vec<String>),
}

/// In-process cache with Redis-like semantics
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn wrong_type(key: &str) -> CacheError {
        CacheError::Corrupt {
            key: key.to_string(),
            field: String::new(),
            reason: "operation against a key holding the wrong kind of value".to_string(),
        }
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn hset(&self, key: &str, fields: &[(&str, String)]) -> Result<(), CacheError> {
        let mut entries = self.entries.lock().await;
        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::Hash(HashMap::new()));
        match entry {
            Entry::Hash(hash) => {
                for (field, value) in fields {
                    hash.insert(field.to_string(), value.clone());
                }
                Ok(())
            }
            Entry::List(_) => Err(Self::wrong_type(key)),
        }
    }

    async fn hmget(&self, key: &str, fields: &[&str]) -> Result<Vec<Option<String>>, CacheError> {
        let entries = self.entries.lock().await;
        match entries.get(key) {
            None => Ok(vec![None; fields.len()]),
            Some(Entry::Hash(hash)) => Ok(fields.iter().map(|f| hash.get(*f).cloned()).collect()),
            Some(Entry::List(_)) => Err(Self::wrong_type(key)),
        }
    }

    async fn del(&self, key: &str) -> Result<(), CacheError> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn rpush(&self, key: &str, values: &[String]) -> Result<(), CacheError> {
        let mut entries = self.entries.lock().await;
        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::List(Vec::new()));
        match entry {
            Entry::List(list) => {
                list.extend(values.iter().cloned());
                Ok(())
            }
            Entry::Hash(_) => Err(Self::wrong_type(key)),
        }
    }

    async fn lrange(&self, key: &str) -> Result<Vec<String>, CacheError> {
        let entries = self.entries.lock().await;
        match entries.get(key) {
            None => Ok(Vec::new()),
            Some(Entry::List(list)) => Ok(list.clone()),
            Some(Entry::Hash(_)) => Err(Self::wrong_type(key)),
        }
    }
}
