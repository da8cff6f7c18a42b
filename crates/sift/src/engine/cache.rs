//! Judge-result cache
//!
//! Keyed on the exact turn content: the judge is not assumed deterministic,
//! so only an identical input may reuse a verdict. Entries expire after 24
//! hours, which also bounds how long a crash-induced re-judgement can be
//! suppressed.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

use crate::types::JudgeResult;

const CACHE_TTL_HOURS: i64 = 24;

/// Content-keyed verdict cache with per-entry expiry
#[derive(Debug)]
pub struct JudgeCache {
    entries: Mutex<HashMap<String, (JudgeResult, DateTime<Utc>)>>,
    ttl: Duration,
}

impl JudgeCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl: Duration::hours(CACHE_TTL_HOURS),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Look up a verdict; expired entries are evicted on access
    pub fn get(&self, content: &str) -> Option<JudgeResult> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(content) {
            Some((_, stored_at)) if Utc::now() - *stored_at > self.ttl => {
                entries.remove(content);
                None
            }
            Some((result, _)) => Some(result.clone()),
            None => None,
        }
    }

    pub fn put(&self, content: &str, result: &JudgeResult) {
        self.entries
            .lock()
            .unwrap()
            .insert(content.to_string(), (result.clone(), Utc::now()));
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for JudgeCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MemoryCategory;

    fn result() -> JudgeResult {
        JudgeResult {
            value_score: 0.8,
            confidence_score: 0.7,
            category: MemoryCategory::Fact,
            reason: String::new(),
            tags: Vec::new(),
            entities: Default::default(),
            should_stage: true,
            is_critical: false,
        }
    }

    #[test]
    fn test_hit_and_miss() {
        let cache = JudgeCache::new();
        assert!(cache.get("x").is_none());

        cache.put("x", &result());
        let hit = cache.get("x").unwrap();
        assert!((hit.value_score - 0.8).abs() < f64::EPSILON);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_expired_entry_is_evicted() {
        let cache = JudgeCache::with_ttl(Duration::seconds(-1));
        cache.put("x", &result());
        assert!(cache.get("x").is_none());
        assert!(cache.is_empty());
    }
}
