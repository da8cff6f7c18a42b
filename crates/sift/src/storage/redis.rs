//! Redis adapters for the STM list store and the staging store
//!
//! Shared-nothing deployments point both stores at the same Redis; the key
//! schemas (`memory:stm:…`, `memory:judged:…`, `staging:…`) keep them apart.
//! All commands go through a [`ConnectionManager`], which reconnects
//! transparently.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::error::{Result, SiftError};
use crate::storage::cosine_similarity;
use crate::storage::staging::{
    bump_entry, entry_id, new_entry, StagingStore, SEMANTIC_DEDUP_THRESHOLD,
};
use crate::storage::ListStore;
use crate::types::{JudgeResult, StagingEntry, StagingStatus};

fn store_err(e: redis::RedisError) -> SiftError {
    SiftError::Store(format!("redis: {e}"))
}

/// Redis-backed STM list store
#[derive(Clone)]
pub struct RedisListStore {
    manager: ConnectionManager,
}

impl RedisListStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(store_err)?;
        let manager = ConnectionManager::new(client).await.map_err(store_err)?;
        Ok(Self { manager })
    }

    pub fn from_manager(manager: ConnectionManager) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl ListStore for RedisListStore {
    async fn rpush_with_expire(&self, key: &str, expiration_days: i64, value: &str) -> Result<()> {
        let mut con = self.manager.clone();
        let mut pipe = redis::pipe();
        pipe.atomic().rpush(key, value).ignore();
        if expiration_days > 0 {
            pipe.expire(key, expiration_days * 24 * 3600).ignore();
        }
        let _: () = pipe.query_async(&mut con).await.map_err(store_err)?;
        Ok(())
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        let mut con = self.manager.clone();
        con.lrange(key, start as isize, stop as isize)
            .await
            .map_err(store_err)
    }

    async fn lrem(&self, key: &str, value: &str) -> Result<()> {
        let mut con = self.manager.clone();
        con.lrem::<_, _, ()>(key, 1, value).await.map_err(store_err)
    }

    async fn del(&self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut con = self.manager.clone();
        con.del::<_, ()>(keys).await.map_err(store_err)
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut con = self.manager.clone();
        let mut keys = Vec::new();
        let mut iter: redis::AsyncIter<'_, String> =
            con.scan_match(pattern).await.map_err(store_err)?;
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        Ok(keys)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        let mut con = self.manager.clone();
        con.sadd::<_, _, ()>(key, member).await.map_err(store_err)
    }

    async fn sis_member(&self, key: &str, member: &str) -> Result<bool> {
        let mut con = self.manager.clone();
        con.sismember(key, member).await.map_err(store_err)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut con = self.manager.clone();
        con.expire::<_, ()>(key, ttl.num_seconds())
            .await
            .map_err(store_err)
    }
}

/// Redis-backed staging store. Entries are JSON values with a TTL; the
/// semantic-dedup scan walks the user's key prefix.
#[derive(Clone)]
pub struct RedisStagingStore {
    manager: ConnectionManager,
    ttl: Duration,
}

impl RedisStagingStore {
    pub async fn connect(url: &str, ttl_days: i64) -> Result<Self> {
        let client = redis::Client::open(url).map_err(store_err)?;
        let manager = ConnectionManager::new(client).await.map_err(store_err)?;
        Ok(Self {
            manager,
            ttl: Duration::days(ttl_days.max(1)),
        })
    }

    async fn scan_prefix(&self, pattern: &str) -> Result<Vec<String>> {
        let mut con = self.manager.clone();
        let mut keys = Vec::new();
        let mut iter: redis::AsyncIter<'_, String> =
            con.scan_match(pattern).await.map_err(store_err)?;
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        Ok(keys)
    }

    async fn load(&self, key: &str) -> Result<Option<StagingEntry>> {
        let mut con = self.manager.clone();
        let raw: Option<String> = con.get(key).await.map_err(store_err)?;
        match raw {
            Some(json) => Ok(serde_json::from_str(&json).ok()),
            None => Ok(None),
        }
    }

    async fn store(&self, entry: &StagingEntry) -> Result<()> {
        let mut con = self.manager.clone();
        let json = serde_json::to_string(entry)?;
        con.set_ex::<_, _, ()>(&entry.id, json, self.ttl.num_seconds() as u64)
            .await
            .map_err(store_err)
    }
}

#[async_trait]
impl StagingStore for RedisStagingStore {
    async fn add_or_increment(
        &self,
        user_id: &str,
        session_id: &str,
        content: &str,
        judgment: &JudgeResult,
        embedding: Option<Vec<f32>>,
    ) -> Result<()> {
        if let Some(vector) = embedding.as_deref() {
            if let Some(mut similar) = self
                .search_similar(user_id, vector, SEMANTIC_DEDUP_THRESHOLD)
                .await?
            {
                bump_entry(&mut similar, session_id, judgment);
                return self.store(&similar).await;
            }
        }

        let id = entry_id(user_id, content);
        match self.load(&id).await? {
            Some(mut entry) => {
                bump_entry(&mut entry, session_id, judgment);
                self.store(&entry).await
            }
            None => {
                let entry = new_entry(user_id, session_id, content, judgment, embedding);
                self.store(&entry).await
            }
        }
    }

    async fn search_similar(
        &self,
        user_id: &str,
        vector: &[f32],
        threshold: f64,
    ) -> Result<Option<StagingEntry>> {
        let keys = self.scan_prefix(&format!("staging:{user_id}:*")).await?;

        let mut best: Option<(f64, StagingEntry)> = None;
        for key in keys {
            let Some(entry) = self.load(&key).await? else {
                continue;
            };
            if entry.embedding.is_empty() {
                continue;
            }
            let similarity = cosine_similarity(vector, &entry.embedding);
            if similarity > threshold
                && best.as_ref().map(|(s, _)| similarity > *s).unwrap_or(true)
            {
                best = Some((similarity, entry));
            }
        }

        Ok(best.map(|(_, e)| e))
    }

    async fn get_pending(
        &self,
        min_occurrences: u32,
        min_wait_hours: i64,
    ) -> Result<Vec<StagingEntry>> {
        let keys = self.scan_prefix("staging:*").await?;
        let now = Utc::now();

        let mut out = Vec::new();
        for key in keys {
            let Some(entry) = self.load(&key).await? else {
                continue;
            };
            if entry.status != StagingStatus::Pending {
                continue;
            }
            if entry.occurrence_count < min_occurrences {
                continue;
            }
            if now - entry.first_seen_at < Duration::hours(min_wait_hours) {
                continue;
            }
            out.push(entry);
        }
        Ok(out)
    }

    async fn get_all_by_user(&self, user_id: &str) -> Result<Vec<StagingEntry>> {
        let keys = self.scan_prefix(&format!("staging:{user_id}:*")).await?;
        let mut out = Vec::new();
        for key in keys {
            if let Some(entry) = self.load(&key).await? {
                out.push(entry);
            }
        }
        Ok(out)
    }

    async fn get_by_session(&self, user_id: &str, session_id: &str) -> Result<Vec<StagingEntry>> {
        let all = self.get_all_by_user(user_id).await?;
        Ok(all
            .into_iter()
            .filter(|e| e.session_ids.iter().any(|s| s == session_id))
            .collect())
    }

    async fn get(&self, id: &str) -> Result<Option<StagingEntry>> {
        self.load(id).await
    }

    async fn update(&self, entry: &StagingEntry) -> Result<()> {
        self.store(entry).await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let mut con = self.manager.clone();
        con.del::<_, ()>(id).await.map_err(store_err)
    }

    async fn delete_batch(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut con = self.manager.clone();
        con.del::<_, ()>(ids).await.map_err(store_err)
    }
}
