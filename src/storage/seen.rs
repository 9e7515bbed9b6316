use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::{aio::MultiplexedConnection, Client};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::cli::config::{StorageBackend, StorageSettings};

/// Remembers which listings each subscription has already reported.
///
/// Calls are idempotent and accept duplicate ids.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SeenStore: Send + Sync {
    /// The ids not yet seen for `subscription_id`, in input order
    async fn filter_new(&self, subscription_id: &str, listing_ids: &[String]) -> Result<Vec<String>>;

    async fn mark_seen(&self, subscription_id: &str, listing_ids: &[String]) -> Result<()>;

    /// Whether a baseline was recorded for the subscription
    async fn is_initialized(&self, subscription_id: &str) -> Result<bool>;

    async fn mark_initialized(&self, subscription_id: &str) -> Result<()>;
}

/// Build the store selected in the settings
pub async fn open_seen_store(settings: &StorageSettings) -> Result<Arc<dyn SeenStore>> {
    match settings.backend {
        StorageBackend::Memory => Ok(Arc::new(MemorySeenStore::default())),
        StorageBackend::Redis => Ok(Arc::new(RedisSeenStore::new(settings).await?)),
    }
}

fn dedup(ids: &[String]) -> Vec<String> {
    let mut unique = HashSet::new();
    ids.iter().filter(|id| unique.insert(id.as_str())).cloned().collect()
}

/// Process-local store; state is lost on restart
#[derive(Default)]
pub struct MemorySeenStore {
    seen: Mutex<HashMap<String, HashSet<String>>>,
    initialized: Mutex<HashSet<String>>,
}

#[async_trait]
impl SeenStore for MemorySeenStore {
    async fn filter_new(&self, subscription_id: &str, listing_ids: &[String]) -> Result<Vec<String>> {
        let seen = self.seen.lock().await;
        let known = seen.get(subscription_id);

        Ok(dedup(listing_ids)
            .into_iter()
            .filter(|id| known.map_or(true, |k| !k.contains(id)))
            .collect())
    }

    async fn mark_seen(&self, subscription_id: &str, listing_ids: &[String]) -> Result<()> {
        self.seen
            .lock()
            .await
            .entry(subscription_id.to_string())
            .or_default()
            .extend(listing_ids.iter().cloned());
        Ok(())
    }

    async fn is_initialized(&self, subscription_id: &str) -> Result<bool> {
        Ok(self.initialized.lock().await.contains(subscription_id))
    }

    async fn mark_initialized(&self, subscription_id: &str) -> Result<()> {
        self.initialized.lock().await.insert(subscription_id.to_string());
        Ok(())
    }
}

/// Redis-backed store: one set per subscription
pub struct RedisSeenStore {
    key_prefix: String,
    conn: Arc<Mutex<MultiplexedConnection>>,
}

impl RedisSeenStore {
    pub async fn new(settings: &StorageSettings) -> Result<Self> {
        let client = Client::open(settings.redis_url.clone())
            .context(format!("Failed to connect to Redis at {}", settings.redis_url))?;

        let conn = client
            .get_multiplexed_async_connection()
            .await
            .context("Failed to get Redis connection")?;

        Ok(Self {
            key_prefix: settings.key_prefix.clone(),
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn seen_key(&self, subscription_id: &str) -> String {
        format!("{}:seen:{}", self.key_prefix, subscription_id)
    }

    fn initialized_key(&self, subscription_id: &str) -> String {
        format!("{}:initialized:{}", self.key_prefix, subscription_id)
    }
}

#[async_trait]
impl SeenStore for RedisSeenStore {
    async fn filter_new(&self, subscription_id: &str, listing_ids: &[String]) -> Result<Vec<String>> {
        let ids = dedup(listing_ids);
        if ids.is_empty() {
            return Ok(ids);
        }

        let key = self.seen_key(subscription_id);
        let mut pipe = redis::pipe();
        for id in &ids {
            pipe.cmd("SISMEMBER").arg(&key).arg(id);
        }

        let mut conn = self.conn.lock().await;
        let known: Vec<bool> = pipe
            .query_async(&mut *conn)
            .await
            .context("Failed to check seen listings in Redis")?;

        Ok(ids
            .into_iter()
            .zip(known)
            .filter_map(|(id, seen)| (!seen).then_some(id))
            .collect())
    }

    async fn mark_seen(&self, subscription_id: &str, listing_ids: &[String]) -> Result<()> {
        if listing_ids.is_empty() {
            return Ok(());
        }

        let key = self.seen_key(subscription_id);
        let mut conn = self.conn.lock().await;
        redis::cmd("SADD")
            .arg(&key)
            .arg(listing_ids)
            .query_async::<_, ()>(&mut *conn)
            .await
            .context("Failed to mark listings as seen in Redis")?;

        debug!("Marked {} listings seen for {}", listing_ids.len(), subscription_id);
        Ok(())
    }

    async fn is_initialized(&self, subscription_id: &str) -> Result<bool> {
        let mut conn = self.conn.lock().await;
        let exists: bool = redis::cmd("EXISTS")
            .arg(self.initialized_key(subscription_id))
            .query_async(&mut *conn)
            .await
            .context("Failed to read initialization marker from Redis")?;
        Ok(exists)
    }

    async fn mark_initialized(&self, subscription_id: &str) -> Result<()> {
        let mut conn = self.conn.lock().await;
        redis::cmd("SET")
            .arg(self.initialized_key(subscription_id))
            .arg(chrono::Utc::now().to_rfc3339())
            .query_async::<_, ()>(&mut *conn)
            .await
            .context("Failed to write initialization marker to Redis")?;
        Ok(())
    }
}
