//! Staging store: the observation buffer between judge and long-term memory
//!
//! Entries are keyed `staging:<user>:<fingerprint>` with a TTL refreshed on
//! every write. Semantic dedup runs before the fingerprint lookup: a new
//! observation that embeds within 0.95 of an existing entry bumps that entry
//! instead of creating a sibling.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::error::{Result, SiftError};
use crate::storage::cosine_similarity;
use crate::types::{JudgeResult, StagingEntry, StagingStatus};

/// Similarity above which two staged observations are the same fact
pub const SEMANTIC_DEDUP_THRESHOLD: f64 = 0.95;

/// First 16 hex chars of the md5 of the content; short but unique enough
/// for a per-user namespace
pub fn fingerprint(content: &str) -> String {
    let digest = format!("{:x}", md5::compute(content.as_bytes()));
    digest[..16].to_string()
}

/// Stable entry id for a user/content pair
pub fn entry_id(user_id: &str, content: &str) -> String {
    format!("staging:{user_id}:{}", fingerprint(content))
}

/// Observation buffer port
#[async_trait]
pub trait StagingStore: Send + Sync {
    /// Record one judged observation: bump the semantically-nearest entry,
    /// else bump the fingerprint-identical entry, else create a fresh one.
    async fn add_or_increment(
        &self,
        user_id: &str,
        session_id: &str,
        content: &str,
        judgment: &JudgeResult,
        embedding: Option<Vec<f32>>,
    ) -> Result<()>;

    /// Most similar entry for this user above the threshold, if any
    async fn search_similar(
        &self,
        user_id: &str,
        vector: &[f32],
        threshold: f64,
    ) -> Result<Option<StagingEntry>>;

    /// All pending entries observed at least `min_occurrences` times whose
    /// first sighting is at least `min_wait_hours` old
    async fn get_pending(&self, min_occurrences: u32, min_wait_hours: i64)
        -> Result<Vec<StagingEntry>>;

    /// Every live entry for a user
    async fn get_all_by_user(&self, user_id: &str) -> Result<Vec<StagingEntry>>;

    /// Entries witnessed by a particular session
    async fn get_by_session(&self, user_id: &str, session_id: &str) -> Result<Vec<StagingEntry>>;

    /// Fetch one entry by id
    async fn get(&self, id: &str) -> Result<Option<StagingEntry>>;

    /// Write an entry back, refreshing its TTL
    async fn update(&self, entry: &StagingEntry) -> Result<()>;

    /// Remove one entry
    async fn delete(&self, id: &str) -> Result<()>;

    /// Remove several entries
    async fn delete_batch(&self, ids: &[String]) -> Result<()>;
}

/// Apply a repeat observation to an existing entry
pub(crate) fn bump_entry(entry: &mut StagingEntry, session_id: &str, judgment: &JudgeResult) {
    entry.occurrence_count += 1;
    entry.last_seen_at = Utc::now();
    entry.absorb_judgment(judgment);
    entry.note_session(session_id);
}

/// Build a fresh entry for a first observation
pub(crate) fn new_entry(
    user_id: &str,
    session_id: &str,
    content: &str,
    judgment: &JudgeResult,
    embedding: Option<Vec<f32>>,
) -> StagingEntry {
    let now = Utc::now();
    let session_ids = if session_id.is_empty() {
        Vec::new()
    } else {
        vec![session_id.to_string()]
    };
    StagingEntry {
        id: entry_id(user_id, content),
        content: content.to_string(),
        embedding: embedding.unwrap_or_default(),
        user_id: user_id.to_string(),
        session_ids,
        first_seen_at: now,
        last_seen_at: now,
        occurrence_count: 1,
        value_score: judgment.value_score,
        confidence_score: judgment.confidence_score,
        category: judgment.category,
        extracted_tags: judgment.tags.clone(),
        extracted_entities: judgment.entities.clone(),
        status: StagingStatus::Pending,
        confirmed_by: String::new(),
    }
}

struct Stored {
    entry: StagingEntry,
    expires_at: DateTime<Utc>,
}

/// In-memory staging store; the default backend and the test harness
pub struct InMemoryStagingStore {
    entries: Mutex<HashMap<String, Stored>>,
    ttl: Duration,
}

impl InMemoryStagingStore {
    pub fn new(ttl_days: i64) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl: Duration::days(ttl_days.max(1)),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Stored>>> {
        self.entries
            .lock()
            .map_err(|_| SiftError::Store("staging store poisoned".to_string()))
    }
}

impl Default for InMemoryStagingStore {
    fn default() -> Self {
        Self::new(30)
    }
}

#[async_trait]
impl StagingStore for InMemoryStagingStore {
    async fn add_or_increment(
        &self,
        user_id: &str,
        session_id: &str,
        content: &str,
        judgment: &JudgeResult,
        embedding: Option<Vec<f32>>,
    ) -> Result<()> {
        // Semantic dedup first: an existing near-duplicate absorbs this
        // observation regardless of its fingerprint.
        if let Some(vector) = embedding.as_deref() {
            if let Some(similar) = self
                .search_similar(user_id, vector, SEMANTIC_DEDUP_THRESHOLD)
                .await?
            {
                let mut entries = self.lock()?;
                if let Some(stored) = entries.get_mut(&similar.id) {
                    bump_entry(&mut stored.entry, session_id, judgment);
                    stored.expires_at = Utc::now() + self.ttl;
                    return Ok(());
                }
            }
        }

        let id = entry_id(user_id, content);
        let mut entries = self.lock()?;
        let now = Utc::now();
        match entries.get_mut(&id).filter(|s| s.expires_at > now) {
            Some(stored) => {
                bump_entry(&mut stored.entry, session_id, judgment);
                stored.expires_at = now + self.ttl;
            }
            None => {
                let entry = new_entry(user_id, session_id, content, judgment, embedding);
                entries.insert(
                    id,
                    Stored {
                        entry,
                        expires_at: now + self.ttl,
                    },
                );
            }
        }
        Ok(())
    }

    async fn search_similar(
        &self,
        user_id: &str,
        vector: &[f32],
        threshold: f64,
    ) -> Result<Option<StagingEntry>> {
        let entries = self.lock()?;
        let prefix = format!("staging:{user_id}:");
        let now = Utc::now();

        let mut best: Option<(f64, &StagingEntry)> = None;
        for (id, stored) in entries.iter() {
            if !id.starts_with(&prefix) || stored.expires_at <= now {
                continue;
            }
            if stored.entry.embedding.is_empty() {
                continue;
            }
            let similarity = cosine_similarity(vector, &stored.entry.embedding);
            if similarity > threshold && best.map(|(s, _)| similarity > s).unwrap_or(true) {
                best = Some((similarity, &stored.entry));
            }
        }

        Ok(best.map(|(_, e)| e.clone()))
    }

    async fn get_pending(
        &self,
        min_occurrences: u32,
        min_wait_hours: i64,
    ) -> Result<Vec<StagingEntry>> {
        let entries = self.lock()?;
        let now = Utc::now();
        Ok(entries
            .values()
            .filter(|s| s.expires_at > now)
            .map(|s| &s.entry)
            .filter(|e| {
                e.status == StagingStatus::Pending
                    && e.occurrence_count >= min_occurrences
                    && now - e.first_seen_at >= Duration::hours(min_wait_hours)
            })
            .cloned()
            .collect())
    }

    async fn get_all_by_user(&self, user_id: &str) -> Result<Vec<StagingEntry>> {
        let entries = self.lock()?;
        let prefix = format!("staging:{user_id}:");
        let now = Utc::now();
        Ok(entries
            .iter()
            .filter(|(id, s)| id.starts_with(&prefix) && s.expires_at > now)
            .map(|(_, s)| s.entry.clone())
            .collect())
    }

    async fn get_by_session(&self, user_id: &str, session_id: &str) -> Result<Vec<StagingEntry>> {
        let all = self.get_all_by_user(user_id).await?;
        Ok(all
            .into_iter()
            .filter(|e| e.session_ids.iter().any(|s| s == session_id))
            .collect())
    }

    async fn get(&self, id: &str) -> Result<Option<StagingEntry>> {
        let entries = self.lock()?;
        let now = Utc::now();
        Ok(entries
            .get(id)
            .filter(|s| s.expires_at > now)
            .map(|s| s.entry.clone()))
    }

    async fn update(&self, entry: &StagingEntry) -> Result<()> {
        let mut entries = self.lock()?;
        entries.insert(
            entry.id.clone(),
            Stored {
                entry: entry.clone(),
                expires_at: Utc::now() + self.ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let mut entries = self.lock()?;
        entries.remove(id);
        Ok(())
    }

    async fn delete_batch(&self, ids: &[String]) -> Result<()> {
        let mut entries = self.lock()?;
        for id in ids {
            entries.remove(id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use crate::types::MemoryCategory;

    fn judgment(value: f64, confidence: f64) -> JudgeResult {
        JudgeResult {
            value_score: value,
            confidence_score: confidence,
            category: MemoryCategory::Preference,
            reason: String::new(),
            tags: vec!["python".to_string()],
            entities: BTreeMap::new(),
            should_stage: true,
            is_critical: false,
        }
    }

    #[test]
    fn test_fingerprint_stable_and_short() {
        let a = fingerprint("The user prefers Python.");
        let b = fingerprint("The user prefers Python.");
        let c = fingerprint("The user prefers Rust.");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn test_occurrence_counting_same_content() {
        let store = InMemoryStagingStore::new(30);
        for _ in 0..3 {
            store
                .add_or_increment("u", "s", "The user prefers Python.", &judgment(0.8, 0.7), None)
                .await
                .unwrap();
        }

        let all = store.get_all_by_user("u").await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].occurrence_count, 3);
        assert_eq!(all[0].session_ids, vec!["s"]);
        assert_eq!(all[0].status, StagingStatus::Pending);
    }

    #[tokio::test]
    async fn test_first_seen_immutable_last_seen_moves() {
        let store = InMemoryStagingStore::new(30);
        store
            .add_or_increment("u", "s1", "fact", &judgment(0.8, 0.7), None)
            .await
            .unwrap();
        let first = store.get_all_by_user("u").await.unwrap()[0].clone();

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store
            .add_or_increment("u", "s2", "fact", &judgment(0.9, 0.8), None)
            .await
            .unwrap();
        let second = store.get_all_by_user("u").await.unwrap()[0].clone();

        assert_eq!(second.first_seen_at, first.first_seen_at);
        assert!(second.last_seen_at > first.last_seen_at);
        assert_eq!(second.session_ids, vec!["s1", "s2"]);
        // Newest judgment wins
        assert!((second.value_score - 0.9).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_semantic_dedup_beats_fingerprint() {
        let store = InMemoryStagingStore::new(30);
        store
            .add_or_increment(
                "u",
                "s",
                "The user prefers Python.",
                &judgment(0.8, 0.7),
                Some(vec![1.0, 0.0, 0.0]),
            )
            .await
            .unwrap();

        // Different content, nearly identical vector: must bump, not create
        store
            .add_or_increment(
                "u",
                "s",
                "The user loves Python.",
                &judgment(0.85, 0.75),
                Some(vec![0.999, 0.01, 0.0]),
            )
            .await
            .unwrap();

        let all = store.get_all_by_user("u").await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].occurrence_count, 2);
        assert_eq!(all[0].content, "The user prefers Python.");
    }

    #[tokio::test]
    async fn test_semantic_dedup_is_user_scoped() {
        let store = InMemoryStagingStore::new(30);
        store
            .add_or_increment("u1", "s", "fact", &judgment(0.8, 0.7), Some(vec![1.0, 0.0]))
            .await
            .unwrap();
        store
            .add_or_increment("u2", "s", "fact", &judgment(0.8, 0.7), Some(vec![1.0, 0.0]))
            .await
            .unwrap();

        assert_eq!(store.get_all_by_user("u1").await.unwrap().len(), 1);
        assert_eq!(store.get_all_by_user("u2").await.unwrap().len(), 1);
        assert_eq!(store.get_all_by_user("u1").await.unwrap()[0].occurrence_count, 1);
    }

    #[tokio::test]
    async fn test_get_pending_filters() {
        let store = InMemoryStagingStore::new(30);
        store
            .add_or_increment("u", "s", "seen once", &judgment(0.8, 0.7), None)
            .await
            .unwrap();
        for _ in 0..3 {
            store
                .add_or_increment("u", "s", "seen thrice", &judgment(0.8, 0.7), None)
                .await
                .unwrap();
        }

        let pending = store.get_pending(3, 0).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].content, "seen thrice");

        // Wait constraint excludes fresh entries
        assert!(store.get_pending(1, 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_get_by_session() {
        let store = InMemoryStagingStore::new(30);
        store
            .add_or_increment("u", "s1", "a", &judgment(0.8, 0.7), None)
            .await
            .unwrap();
        store
            .add_or_increment("u", "s2", "b", &judgment(0.8, 0.7), None)
            .await
            .unwrap();

        let s1 = store.get_by_session("u", "s1").await.unwrap();
        assert_eq!(s1.len(), 1);
        assert_eq!(s1[0].content, "a");
    }

    #[tokio::test]
    async fn test_delete_batch() {
        let store = InMemoryStagingStore::new(30);
        store
            .add_or_increment("u", "s", "a", &judgment(0.8, 0.7), None)
            .await
            .unwrap();
        store
            .add_or_increment("u", "s", "b", &judgment(0.8, 0.7), None)
            .await
            .unwrap();

        let ids: Vec<String> = store
            .get_all_by_user("u")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        store.delete_batch(&ids).await.unwrap();
        assert!(store.get_all_by_user("u").await.unwrap().is_empty());
    }
}
