//! The memory engine
//!
//! Owns the store ports and the judge, and exposes the whole funnel:
//! write path (`add`), read path (`retrieve`), the background passes
//! (judge-and-stage, promotion, decay eviction, dedup in [`funnel`]),
//! plus the admin operations the HTTP façade proxies to.

pub mod cache;
pub mod decay;
pub mod funnel;
pub mod schedulers;

pub use cache::JudgeCache;
pub use decay::{refresh_access, DecayCalculator};

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::config::Config;
use crate::embedding::Embedder;
use crate::error::{Result, SiftError};
use crate::judge::Judge;
use crate::metrics::MetricsCollector;
use crate::storage::{EndUserStore, ListStore, StagingStore, VectorStore};
use crate::types::{EndUser, LtmMetadata, MemoryRecord, StagingEntry, StagingStatus};

/// Similarity threshold for retrieval hits
const RETRIEVAL_SCORE_THRESHOLD: f32 = 0.7;

/// STM list key for a (user, session) pair
pub fn stm_key(user_id: &str, session_id: &str) -> String {
    format!("memory:stm:{user_id}:{session_id}")
}

/// Judged-turn set key for a (user, session) pair
pub fn judged_key(user_id: &str, session_id: &str) -> String {
    format!("memory:judged:{user_id}:{session_id}")
}

/// Filter for the admin listing
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub user_id: Option<String>,
    /// "short_term", "long_term" or "all"
    pub kind: Option<String>,
    pub limit: usize,
    pub page: usize,
}

/// Orchestrator for the tiered memory funnel
pub struct MemoryEngine {
    pub(crate) config: Config,
    pub(crate) vector_store: Arc<dyn VectorStore>,
    pub(crate) list_store: Arc<dyn ListStore>,
    pub(crate) staging: Arc<dyn StagingStore>,
    pub(crate) embedder: Arc<dyn Embedder>,
    pub(crate) judge: Judge,
    pub(crate) end_users: Option<Arc<dyn EndUserStore>>,
    pub(crate) judge_cache: JudgeCache,
    pub(crate) metrics: Arc<MetricsCollector>,
    pub(crate) decay: DecayCalculator,
}

impl MemoryEngine {
    pub fn new(
        config: Config,
        vector_store: Arc<dyn VectorStore>,
        list_store: Arc<dyn ListStore>,
        staging: Arc<dyn StagingStore>,
        embedder: Arc<dyn Embedder>,
        judge: Judge,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        let decay = DecayCalculator::new(config.decay.half_life_days, config.decay.min_score);
        Self {
            config,
            vector_store,
            list_store,
            staging,
            embedder,
            judge,
            end_users: None,
            judge_cache: JudgeCache::new(),
            metrics,
            decay,
        }
    }

    /// Attach end-user activity tracking
    pub fn with_end_user_store(mut self, store: Arc<dyn EndUserStore>) -> Self {
        self.end_users = Some(store);
        self
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn staging_store(&self) -> &Arc<dyn StagingStore> {
        &self.staging
    }

    /// Store one user↔assistant exchange in short-term memory.
    ///
    /// Storage errors surface to the caller; nothing is partially committed.
    pub async fn add(
        &self,
        user_id: &str,
        session_id: &str,
        input: &str,
        output: &str,
        metadata: Map<String, Value>,
    ) -> Result<()> {
        if user_id.is_empty() || session_id.is_empty() {
            return Err(SiftError::Validation(
                "user_id and session_id are required".to_string(),
            ));
        }

        let record = MemoryRecord::short_term(user_id, session_id, input, output, metadata);
        let data = serde_json::to_string(&record)?;

        self.list_store
            .rpush_with_expire(
                &stm_key(user_id, session_id),
                self.config.stm.expiration_days,
                &data,
            )
            .await?;

        if let Some(end_users) = &self.end_users {
            if let Err(e) = end_users.upsert_user(user_id).await {
                warn!(user_id, error = %e, "end-user upsert failed");
            }
        }

        Ok(())
    }

    /// Fuse the recent STM tail with a semantic LTM search.
    ///
    /// Degraded reads: a failure on either source still returns the other.
    /// STM turns always precede LTM hits and order is not renormalized.
    pub async fn retrieve(
        &self,
        user_id: &str,
        session_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>> {
        let mut records = Vec::new();

        match self
            .list_store
            .lrange(&stm_key(user_id, session_id), 0, -1)
            .await
        {
            Ok(raw) => {
                let skip = raw.len().saturating_sub(self.config.retrieval.context_window);
                for data in raw.into_iter().skip(skip) {
                    match serde_json::from_str::<MemoryRecord>(&data) {
                        Ok(rec) => records.push(rec),
                        Err(e) => debug!(error = %e, "skipping unparseable STM record"),
                    }
                }
            }
            Err(e) => warn!(user_id, session_id, error = %e, "STM read failed, degrading"),
        }

        let max_recent = self.config.retrieval.max_recent_memories;
        let mut k = limit;
        if max_recent > 0 && k > max_recent {
            k = max_recent;
        }

        match self.embedder.embed_query(query).await {
            Ok(vector) => {
                let mut filters = Map::new();
                filters.insert("user_id".into(), Value::String(user_id.to_string()));
                match self
                    .vector_store
                    .search(&vector, k, RETRIEVAL_SCORE_THRESHOLD, &filters)
                    .await
                {
                    Ok(hits) => {
                        for hit in &hits {
                            self.touch_record(hit).await;
                        }
                        records.extend(hits);
                    }
                    Err(e) => warn!(user_id, error = %e, "LTM search failed, degrading"),
                }
            }
            Err(e) => warn!(user_id, error = %e, "query embedding failed, STM tail only"),
        }

        if max_recent > 0 && records.len() > max_recent {
            records.truncate(max_recent);
        }

        Ok(records)
    }

    /// Best-effort access refresh for a returned LTM hit
    async fn touch_record(&self, record: &MemoryRecord) {
        let mut updated = record.clone();
        let mut meta = LtmMetadata::from_map(&updated.metadata);
        refresh_access(&mut meta);
        meta.apply_to(&mut updated.metadata);
        if let Err(e) = self.vector_store.update(updated).await {
            debug!(id = %record.id, error = %e, "access refresh skipped");
        }
    }

    /// Admin listing over both tiers
    pub async fn list(&self, filter: ListFilter) -> Result<Vec<MemoryRecord>> {
        let limit = if filter.limit == 0 { 50 } else { filter.limit };
        let page = filter.page.max(1);
        let offset = (page - 1) * limit;
        let kind = filter.kind.as_deref().unwrap_or("all");

        let mut records = Vec::new();

        if kind == "short_term" || kind == "all" {
            let pattern = match &filter.user_id {
                Some(user) => format!("memory:stm:{user}:*"),
                None => "memory:stm:*".to_string(),
            };
            if let Ok(keys) = self.list_store.scan_keys(&pattern).await {
                for key in keys {
                    let items = self.list_store.lrange(&key, 0, -1).await.unwrap_or_default();
                    for data in items {
                        if let Ok(rec) = serde_json::from_str::<MemoryRecord>(&data) {
                            if let Some(user) = &filter.user_id {
                                if rec.meta_str("user_id") != Some(user.as_str()) {
                                    continue;
                                }
                            }
                            records.push(rec);
                        }
                    }
                }
            }
        }

        if kind == "long_term" || kind == "all" {
            let mut filters = Map::new();
            if let Some(user) = &filter.user_id {
                filters.insert("user_id".into(), Value::String(user.clone()));
            }
            if kind == "long_term" {
                // Store-level pagination is exact when only one tier is read
                return self.vector_store.list(&filters, limit, offset).await;
            }
            if let Ok(ltm) = self.vector_store.list(&filters, limit + offset, 0).await {
                records.extend(ltm);
            }
        }

        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        if offset >= records.len() {
            return Ok(Vec::new());
        }
        records.truncate((offset + limit).min(records.len()));
        Ok(records.split_off(offset))
    }

    /// Rewrite a long-term record and re-embed its content
    pub async fn update(&self, id: &str, new_content: &str) -> Result<()> {
        let mut record = self.vector_store.get(id).await?;
        let vector = self.embedder.embed_query(new_content).await?;
        record.content = new_content.to_string();
        record.embedding = vector;
        self.vector_store.update(record).await
    }

    /// Remove a long-term record
    pub async fn delete(&self, id: &str) -> Result<()> {
        self.vector_store.delete(&[id.to_string()]).await
    }

    /// Drop a session's short-term memory (and its judged set)
    pub async fn clear(&self, user_id: &str, session_id: &str) -> Result<()> {
        self.list_store
            .del(&[
                stm_key(user_id, session_id),
                judged_key(user_id, session_id),
            ])
            .await
    }

    /// End users enriched with live session and LTM counts
    pub async fn get_users(&self) -> Result<Vec<EndUser>> {
        let Some(end_users) = &self.end_users else {
            return Err(SiftError::Config("end user store not configured".to_string()));
        };

        let mut users = end_users.list_users().await?;
        for user in &mut users {
            let pattern = format!("memory:stm:{}:*", user.user_identifier);
            user.session_count = self
                .list_store
                .scan_keys(&pattern)
                .await
                .map(|k| k.len())
                .unwrap_or(0);

            let mut filters = Map::new();
            filters.insert(
                "user_id".into(),
                Value::String(user.user_identifier.clone()),
            );
            user.ltm_count = self.vector_store.count(&filters).await.unwrap_or(0);
        }
        Ok(users)
    }

    /// Basic health of the two memory tiers
    pub async fn system_status(&self) -> HashMap<String, String> {
        let mut status = HashMap::new();
        status.insert(
            "short_term_memory".to_string(),
            match self.list_store.scan_keys("memory:stm:*").await {
                Ok(_) => "online".to_string(),
                Err(_) => "down".to_string(),
            },
        );
        status.insert(
            "long_term_memory".to_string(),
            match self.vector_store.list(&Map::new(), 1, 0).await {
                Ok(_) => "online".to_string(),
                Err(_) => "down".to_string(),
            },
        );
        status
    }

    // ---- staging admin operations ----

    /// Staging entries for a user, or every pending entry when no user given
    pub async fn staging_entries(&self, user_id: Option<&str>) -> Result<Vec<StagingEntry>> {
        match user_id {
            Some(user) => self.staging.get_all_by_user(user).await,
            None => self.staging.get_pending(1, 0).await,
        }
    }

    /// Reviewer-confirmed promotion of one staging entry
    pub async fn confirm_staging_entry(&self, entry_id: &str) -> Result<()> {
        let mut entry = self
            .staging
            .get(entry_id)
            .await?
            .ok_or_else(|| SiftError::NotFound(format!("staging entry {entry_id}")))?;

        entry.status = StagingStatus::Confirmed;
        entry.confirmed_by = "user".to_string();
        self.staging.update(&entry).await?;

        self.promote_entry(&entry).await?;
        self.staging.delete(entry_id).await
    }

    /// Reviewer rejection: the entry is simply dropped
    pub async fn reject_staging_entry(&self, entry_id: &str) -> Result<()> {
        self.staging.delete(entry_id).await
    }

    /// Confidence-band statistics over the pending queue
    pub async fn staging_stats(&self) -> Result<Value> {
        let entries = self.staging.get_pending(1, 0).await?;

        let mut high = 0;
        let mut medium = 0;
        let mut low = 0;
        let mut awaiting = 0;
        let now = chrono::Utc::now();

        for entry in &entries {
            if entry.confidence_score >= self.config.staging.confidence_high {
                high += 1;
            } else if entry.confidence_score >= self.config.staging.confidence_low {
                medium += 1;
            } else {
                low += 1;
            }

            let waited = now - entry.first_seen_at;
            if entry.occurrence_count >= self.config.staging.min_occurrences
                && waited >= chrono::Duration::hours(self.config.staging.min_wait_hours)
            {
                awaiting += 1;
            }
        }

        Ok(serde_json::json!({
            "total_pending": entries.len(),
            "high_confidence": high,
            "medium_confidence": medium,
            "low_confidence": low,
            "awaiting_promotion": awaiting,
        }))
    }

    /// Current pending-queue length, sampled for metrics
    pub async fn queue_length(&self) -> usize {
        self.staging
            .get_pending(1, 0)
            .await
            .map(|e| e.len())
            .unwrap_or(0)
    }
}
