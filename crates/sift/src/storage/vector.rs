//! Long-term vector store
//!
//! A user-filtered vector index with payload. This adapter is the only
//! place aware of payload-nesting differences between backends: filter keys
//! are accepted both flat (`user_id`) and namespaced (`metadata.user_id`).

use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::{Result, SiftError};
use crate::storage::cosine_similarity;
use crate::types::MemoryRecord;

/// Vector index port used by the long-term tier
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Upsert records by id. Embedding dimensionality must match the
    /// collection.
    async fn add(&self, records: Vec<MemoryRecord>) -> Result<()>;

    /// Top-k by cosine similarity at or above the threshold, restricted to
    /// records whose payload matches `filters`
    async fn search(
        &self,
        vector: &[f32],
        limit: usize,
        score_threshold: f32,
        filters: &Map<String, Value>,
    ) -> Result<Vec<MemoryRecord>>;

    /// Page through records matching `filters`, newest first
    async fn list(
        &self,
        filters: &Map<String, Value>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<MemoryRecord>>;

    /// Replace a record in place
    async fn update(&self, record: MemoryRecord) -> Result<()>;

    /// Remove records by id
    async fn delete(&self, ids: &[String]) -> Result<()>;

    /// Fetch one record
    async fn get(&self, id: &str) -> Result<MemoryRecord>;

    /// Count records matching `filters`
    async fn count(&self, filters: &Map<String, Value>) -> Result<i64>;
}

#[derive(Debug, Default)]
struct Inner {
    records: Vec<MemoryRecord>,
    dimension: Option<usize>,
}

/// Thread-safe in-memory vector index
#[derive(Debug, Default)]
pub struct InMemoryVectorStore {
    inner: RwLock<Inner>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Inner>> {
        self.inner
            .read()
            .map_err(|_| SiftError::Store("vector store poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Inner>> {
        self.inner
            .write()
            .map_err(|_| SiftError::Store("vector store poisoned".to_string()))
    }
}

/// Match a record's payload against filters, tolerating both flat and
/// `metadata.`-prefixed keys
fn matches_filters(record: &MemoryRecord, filters: &Map<String, Value>) -> bool {
    filters.iter().all(|(key, expected)| {
        let key = key.strip_prefix("metadata.").unwrap_or(key);
        if key == "type" {
            return serde_json::to_value(record.kind)
                .map(|v| v == *expected)
                .unwrap_or(false);
        }
        record.metadata.get(key) == Some(expected)
    })
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn add(&self, records: Vec<MemoryRecord>) -> Result<()> {
        let mut inner = self.write()?;
        for record in records {
            if !record.embedding.is_empty() {
                match inner.dimension {
                    None => inner.dimension = Some(record.embedding.len()),
                    Some(dim) if dim != record.embedding.len() => {
                        return Err(SiftError::Validation(format!(
                            "embedding dimension {} does not match collection dimension {dim}",
                            record.embedding.len()
                        )));
                    }
                    _ => {}
                }
            }

            if let Some(existing) = inner.records.iter_mut().find(|r| r.id == record.id) {
                *existing = record;
            } else {
                inner.records.push(record);
            }
        }
        Ok(())
    }

    async fn search(
        &self,
        vector: &[f32],
        limit: usize,
        score_threshold: f32,
        filters: &Map<String, Value>,
    ) -> Result<Vec<MemoryRecord>> {
        let inner = self.read()?;
        let mut scored: Vec<(f64, &MemoryRecord)> = inner
            .records
            .iter()
            .filter(|r| !r.embedding.is_empty() && matches_filters(r, filters))
            .map(|r| (cosine_similarity(vector, &r.embedding), r))
            .filter(|(score, _)| *score >= score_threshold as f64)
            .collect();

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        Ok(scored
            .into_iter()
            .take(limit)
            .map(|(_, r)| r.clone())
            .collect())
    }

    async fn list(
        &self,
        filters: &Map<String, Value>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<MemoryRecord>> {
        let inner = self.read()?;
        let mut matched: Vec<&MemoryRecord> = inner
            .records
            .iter()
            .filter(|r| matches_filters(r, filters))
            .collect();
        matched.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        Ok(matched
            .into_iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn update(&self, record: MemoryRecord) -> Result<()> {
        let mut inner = self.write()?;
        match inner.records.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => {
                *existing = record;
                Ok(())
            }
            None => Err(SiftError::NotFound(format!("record {}", record.id))),
        }
    }

    async fn delete(&self, ids: &[String]) -> Result<()> {
        let mut inner = self.write()?;
        inner.records.retain(|r| !ids.contains(&r.id));
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<MemoryRecord> {
        let inner = self.read()?;
        inner
            .records
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or_else(|| SiftError::NotFound(format!("record {id}")))
    }

    async fn count(&self, filters: &Map<String, Value>) -> Result<i64> {
        let inner = self.read()?;
        Ok(inner
            .records
            .iter()
            .filter(|r| matches_filters(r, filters))
            .count() as i64)
    }
}
