//! The funnel passes: judge-and-stage, promotion, decay eviction, dedup
//!
//! Every pass is background-safe: per-item failures are logged and counted,
//! never propagated, so the next tick retries whatever is left over.

use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::engine::{judged_key, stm_key, MemoryEngine};
use crate::error::Result;
use crate::storage::cosine_similarity;
use crate::types::{
    JudgeResult, LtmMetadata, MemoryCategory, MemoryKind, MemoryRecord, MergeStrategy,
    StagingEntry,
};
use uuid::Uuid;

/// Similarity above which a promoted summary is a duplicate of an existing
/// long-term record
const LTM_DEDUP_THRESHOLD: f32 = 0.95;

/// Page size for the decay and dedup scans
const SCAN_PAGE_SIZE: usize = 500;

/// Everything the promotion correlator needs to write one fact
pub struct PromotionInput {
    pub user_id: String,
    pub summary: String,
    pub category: MemoryCategory,
    pub confidence: f64,
    pub tags: Vec<String>,
    pub entities: BTreeMap<String, String>,
    /// staging / fast-track / manual
    pub source_type: String,
    /// Reuse an existing embedding instead of re-embedding the summary
    pub embedding: Option<Vec<f32>>,
    pub timestamp: DateTime<Utc>,
}

impl PromotionInput {
    pub fn from_staging(entry: &StagingEntry) -> Self {
        Self {
            user_id: entry.user_id.clone(),
            summary: entry.content.clone(),
            category: entry.category,
            confidence: entry.confidence_score,
            tags: entry.extracted_tags.clone(),
            entities: entry.extracted_entities.clone(),
            source_type: "staging".to_string(),
            embedding: if entry.embedding.is_empty() {
                None
            } else {
                Some(entry.embedding.clone())
            },
            timestamp: entry.last_seen_at,
        }
    }

    pub fn fast_track(user_id: &str, summary: &str, judgment: &JudgeResult) -> Self {
        Self {
            user_id: user_id.to_string(),
            summary: summary.to_string(),
            category: judgment.category,
            confidence: judgment.confidence_score,
            tags: judgment.tags.clone(),
            entities: judgment.entities.clone(),
            source_type: "fast-track".to_string(),
            embedding: None,
            timestamp: Utc::now(),
        }
    }
}

impl MemoryEngine {
    /// STM → Staging: judge unseen turns for one (user, session).
    ///
    /// A pass is a no-op until either enough unjudged turns pile up or the
    /// oldest one has waited too long. Judged turns are physically removed
    /// from STM; the judged set is written as a crash guard so a failed
    /// removal cannot cause double-judging within the cache epoch.
    pub async fn judge_and_stage(&self, user_id: &str, session_id: &str) -> Result<()> {
        let key = stm_key(user_id, session_id);
        let judged_set = judged_key(user_id, session_id);

        let raw = self.list_store.lrange(&key, 0, -1).await?;
        if raw.is_empty() {
            return Ok(());
        }

        let mut to_judge: Vec<(String, MemoryRecord)> = Vec::new();
        for data in raw {
            let Ok(record) = serde_json::from_str::<MemoryRecord>(&data) else {
                continue;
            };
            if self
                .list_store
                .sis_member(&judged_set, &record.id)
                .await
                .unwrap_or(false)
            {
                continue;
            }
            to_judge.push((data, record));
        }

        if to_judge.is_empty() {
            return Ok(());
        }

        let oldest_wait = Utc::now() - to_judge[0].1.timestamp;
        let triggered = to_judge.len() >= self.config.stm.judge_min_messages
            || oldest_wait >= Duration::minutes(self.config.stm.judge_max_wait_minutes);
        if !triggered {
            return Ok(());
        }

        info!(
            user_id,
            session_id,
            unjudged = to_judge.len(),
            "judge pass starting"
        );

        for chunk in to_judge.chunks(self.config.stm.batch_judge_size.max(1)) {
            let mut results: Vec<Option<JudgeResult>> = vec![None; chunk.len()];
            let mut miss_indices = Vec::new();
            let mut miss_contents = Vec::new();

            for (i, (_, record)) in chunk.iter().enumerate() {
                match self.judge_cache.get(&record.content) {
                    Some(cached) => {
                        self.metrics.record_cache_hit();
                        results[i] = Some(cached);
                    }
                    None => {
                        self.metrics.record_cache_miss();
                        miss_indices.push(i);
                        miss_contents.push(record.content.clone());
                    }
                }
            }

            if !miss_contents.is_empty() {
                match self.judge.judge_batch(&miss_contents).await {
                    Ok(batch_results) => {
                        for (slot, result) in miss_indices.iter().zip(batch_results) {
                            self.judge_cache.put(&chunk[*slot].1.content, &result);
                            results[*slot] = Some(result);
                        }
                    }
                    Err(e) => {
                        // Whole batch skipped; these turns stay in STM for
                        // the next pass.
                        warn!(error = %e, "batch judgment failed, skipping batch");
                        continue;
                    }
                }
            }

            for (i, result) in results.iter().enumerate() {
                let Some(result) = result else { continue };
                let (data, record) = &chunk[i];

                let keep = result.is_critical
                    || (result.should_stage
                        && result.value_score >= self.config.staging.value_threshold);
                if keep {
                    let summary = match self
                        .judge
                        .summarize_and_restructure(&record.content, result.category)
                        .await
                    {
                        Ok(s) => s,
                        Err(e) => {
                            warn!(error = %e, "restatement failed, using raw content");
                            record.content.clone()
                        }
                    };

                    if result.is_critical {
                        let input = PromotionInput::fast_track(user_id, &summary, result);
                        if let Err(e) = self.promote_to_ltm(input).await {
                            warn!(error = %e, "fast-track failed, falling back to staging");
                            self.stage_summary(user_id, session_id, &summary, result).await;
                        }
                    } else {
                        self.stage_summary(user_id, session_id, &summary, result).await;
                    }
                }

                // Judged either way: the verdict is recorded, so the turn
                // leaves STM. Removal tolerates the value being absent.
                if let Err(e) = self.list_store.sadd(&judged_set, &record.id).await {
                    warn!(error = %e, "judged-set write failed");
                }
                if let Err(e) = self.list_store.lrem(&key, data).await {
                    warn!(error = %e, "STM removal failed");
                }
            }
        }

        if self.config.stm.expiration_days > 0 {
            let ttl = Duration::days(self.config.stm.expiration_days);
            if let Err(e) = self.list_store.expire(&judged_set, ttl).await {
                debug!(error = %e, "judged-set expire failed");
            }
        }

        Ok(())
    }

    /// Write one summary into staging, embedding it first when possible
    async fn stage_summary(
        &self,
        user_id: &str,
        session_id: &str,
        summary: &str,
        judgment: &JudgeResult,
    ) {
        // An embedding failure downgrades dedup to fingerprint identity
        let embedding = match self.embedder.embed_query(summary).await {
            Ok(v) => Some(v),
            Err(e) => {
                debug!(error = %e, "staging embedding failed, fingerprint dedup only");
                None
            }
        };

        if let Err(e) = self
            .staging
            .add_or_increment(user_id, session_id, summary, judgment, embedding)
            .await
        {
            warn!(error = %e, "staging write failed");
        }
    }

    /// Staging → LTM: promote, park or drop every eligible pending entry
    pub async fn promote_staging(&self) -> Result<()> {
        let entries = self
            .staging
            .get_pending(
                self.config.staging.min_occurrences,
                self.config.staging.min_wait_hours,
            )
            .await?;

        for entry in entries {
            if entry.confidence_score >= self.config.staging.confidence_high {
                if let Err(e) = self.promote_entry(&entry).await {
                    warn!(entry_id = %entry.id, error = %e, "auto promotion failed");
                    continue;
                }
                if let Err(e) = self.staging.delete(&entry.id).await {
                    warn!(entry_id = %entry.id, error = %e, "staging delete failed");
                }
            } else if entry.confidence_score >= self.config.staging.confidence_low {
                // Mid band waits for a reviewer; no state change
                debug!(
                    entry_id = %entry.id,
                    confidence = entry.confidence_score,
                    "holding for review"
                );
            } else {
                self.staging.delete(&entry.id).await.ok();
                self.metrics
                    .record_promotion(entry.category.as_str(), false);
            }
        }

        Ok(())
    }

    /// Promote one staging entry through the correlator
    pub async fn promote_entry(&self, entry: &StagingEntry) -> Result<()> {
        self.promote_to_ltm(PromotionInput::from_staging(entry)).await
    }

    /// The promotion correlator: dedup against LTM, then merge or create.
    ///
    /// Best-effort per step: an embedding failure aborts the write (the
    /// caller's staging entry survives for the next tick); a merge-decision
    /// failure degrades to keeping both.
    pub async fn promote_to_ltm(&self, input: PromotionInput) -> Result<()> {
        let vector = match &input.embedding {
            Some(v) => v.clone(),
            None => self.embedder.embed_query(&input.summary).await?,
        };

        let mut filters = Map::new();
        filters.insert("user_id".into(), Value::String(input.user_id.clone()));

        let similar = self
            .vector_store
            .search(&vector, 1, LTM_DEDUP_THRESHOLD, &filters)
            .await
            .unwrap_or_default();

        if let Some(existing) = similar.into_iter().next() {
            let (strategy, merged_content) = match self
                .judge
                .decide_merge_strategy(&existing.content, &input.summary)
                .await
            {
                Ok(decision) => decision,
                Err(e) => {
                    warn!(error = %e, "merge decision failed, keeping both");
                    (MergeStrategy::KeepBoth, None)
                }
            };

            match strategy {
                MergeStrategy::UpdateExisting => {
                    let mut record = existing;
                    let mut meta = LtmMetadata::from_map(&record.metadata);
                    meta.access_count += 1;
                    meta.decay_score = 1.0;
                    meta.last_access_at = Utc::now();
                    meta.apply_to(&mut record.metadata);
                    self.vector_store.update(record).await?;
                    self.metrics.record_promotion(input.category.as_str(), true);
                    return Ok(());
                }
                MergeStrategy::Merge => {
                    let mut record = existing;
                    let merged = merged_content.unwrap_or_else(|| input.summary.clone());
                    record.content = merged.clone();
                    match self.embedder.embed_query(&merged).await {
                        Ok(v) => record.embedding = v,
                        Err(e) => debug!(error = %e, "merge re-embedding failed, keeping vector"),
                    }
                    let mut meta = LtmMetadata::from_map(&record.metadata);
                    meta.access_count += 1;
                    meta.decay_score = 1.0;
                    meta.apply_to(&mut record.metadata);
                    self.vector_store.update(record).await?;
                    self.metrics.record_promotion(input.category.as_str(), true);
                    return Ok(());
                }
                MergeStrategy::KeepNewer => {
                    self.vector_store.delete(&[existing.id]).await?;
                    // fall through to create
                }
                MergeStrategy::KeepBoth => {
                    // fall through to create
                }
            }
        }

        // No duplicate (or it was superseded): create a fresh record.
        let (tags, entities) = match self
            .judge
            .extract_structured_tags(&input.summary, input.category)
            .await
        {
            Ok(extracted) => extracted,
            Err(e) => {
                debug!(error = %e, "tag extraction failed, reusing staged tags");
                (input.tags.clone(), input.entities.clone())
            }
        };

        let now = Utc::now();
        let metadata = LtmMetadata {
            user_id: input.user_id.clone(),
            created_at: now,
            tags,
            entities,
            category: input.category,
            last_access_at: now,
            access_count: 0,
            decay_score: 1.0,
            source_type: input.source_type.clone(),
            confidence_origin: input.confidence,
        };

        let record = MemoryRecord {
            id: Uuid::new_v4().to_string(),
            content: input.summary.clone(),
            embedding: vector,
            timestamp: input.timestamp,
            metadata: metadata.to_map(),
            kind: MemoryKind::LongTerm,
        };

        self.vector_store.add(vec![record]).await?;
        self.metrics.record_promotion(input.category.as_str(), true);
        info!(
            user_id = %input.user_id,
            category = %input.category,
            source = %input.source_type,
            "memory promoted"
        );
        Ok(())
    }

    /// Daily pass: recompute decay scores, evict what fell below threshold
    pub async fn scan_and_evict_decayed(&self) -> Result<()> {
        let mut to_delete = Vec::new();
        let mut to_update = Vec::new();
        let mut offset = 0;

        loop {
            let page = self
                .vector_store
                .list(&Map::new(), SCAN_PAGE_SIZE, offset)
                .await?;
            if page.is_empty() {
                break;
            }
            offset += page.len();

            for mut record in page {
                let mut meta = LtmMetadata::from_map(&record.metadata);
                self.decay.update(&mut meta);

                if self.decay.should_evict(meta.decay_score) {
                    debug!(id = %record.id, score = meta.decay_score, "evicting decayed memory");
                    to_delete.push(record.id);
                } else {
                    meta.apply_to(&mut record.metadata);
                    to_update.push(record);
                }
            }
        }

        if !to_delete.is_empty() {
            if let Err(e) = self.vector_store.delete(&to_delete).await {
                warn!(error = %e, "decay batch delete failed");
            } else {
                self.metrics.record_forgotten(to_delete.len() as i64);
            }
        }
        for record in to_update {
            if let Err(e) = self.vector_store.update(record).await {
                warn!(error = %e, "decay score update failed");
            }
        }

        info!(
            deleted = to_delete.len(),
            "decay scan completed"
        );
        Ok(())
    }

    /// Weekly pass: coalesce near-duplicate long-term records per user
    pub async fn deduplicate_ltm(&self) -> Result<()> {
        let mut offset = 0;
        let mut merged = 0;

        loop {
            let page = self
                .vector_store
                .list(&Map::new(), SCAN_PAGE_SIZE, offset)
                .await?;
            if page.is_empty() {
                break;
            }
            offset += page.len();

            let mut gone: Vec<String> = Vec::new();
            for i in 0..page.len() {
                for j in (i + 1)..page.len() {
                    let (a, b) = (&page[i], &page[j]);
                    if gone.contains(&a.id) || gone.contains(&b.id) {
                        continue;
                    }
                    // Cross-user pairs are never merged
                    if a.meta_str("user_id") != b.meta_str("user_id")
                        || a.meta_str("user_id").is_none()
                    {
                        continue;
                    }
                    if a.embedding.is_empty() || b.embedding.is_empty() {
                        continue;
                    }
                    if cosine_similarity(&a.embedding, &b.embedding) <= LTM_DEDUP_THRESHOLD as f64 {
                        continue;
                    }

                    let (strategy, merged_content) =
                        match self.judge.decide_merge_strategy(&a.content, &b.content).await {
                            Ok(d) => d,
                            Err(e) => {
                                warn!(error = %e, "merge decision failed, skipping pair");
                                continue;
                            }
                        };

                    match self
                        .merge_pair(a.clone(), b.clone(), strategy, merged_content)
                        .await
                    {
                        Ok(Some(removed)) => {
                            gone.push(removed);
                            merged += 1;
                        }
                        Ok(None) => {}
                        Err(e) => warn!(error = %e, "merge execution failed"),
                    }
                }
            }
        }

        info!(merged, "long-term dedup completed");
        Ok(())
    }

    /// Apply a merge strategy to a duplicate pair; returns the removed id
    async fn merge_pair(
        &self,
        a: MemoryRecord,
        b: MemoryRecord,
        strategy: MergeStrategy,
        merged_content: Option<String>,
    ) -> Result<Option<String>> {
        let meta_a = LtmMetadata::from_map(&a.metadata);
        let meta_b = LtmMetadata::from_map(&b.metadata);

        match strategy {
            MergeStrategy::KeepNewer => {
                let loser = if a.timestamp >= b.timestamp { b } else { a };
                self.vector_store.delete(&[loser.id.clone()]).await?;
                Ok(Some(loser.id))
            }
            MergeStrategy::UpdateExisting | MergeStrategy::Merge => {
                // The higher-traffic record wins and absorbs the counts
                let (mut winner, loser) = if meta_a.access_count >= meta_b.access_count {
                    (a, b)
                } else {
                    (b, a)
                };
                let mut meta = LtmMetadata::from_map(&winner.metadata);
                meta.access_count = meta_a.access_count + meta_b.access_count;
                meta.decay_score = 1.0;

                if strategy == MergeStrategy::Merge {
                    if let Some(content) = merged_content {
                        match self.embedder.embed_query(&content).await {
                            Ok(v) => {
                                winner.content = content;
                                winner.embedding = v;
                            }
                            Err(e) => {
                                debug!(error = %e, "merge re-embedding failed, keeping content")
                            }
                        }
                    }
                }

                meta.apply_to(&mut winner.metadata);
                self.vector_store.update(winner).await?;
                self.vector_store.delete(&[loser.id.clone()]).await?;
                Ok(Some(loser.id))
            }
            MergeStrategy::KeepBoth => Ok(None),
        }
    }
}
