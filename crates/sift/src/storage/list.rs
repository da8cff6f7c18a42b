//! Short-term memory list store
//!
//! Redis-list semantics behind a trait: per-key ordered lists with TTL,
//! plus small sets used to track already-judged turn ids. Keys follow
//! `memory:stm:<user>:<session>` / `memory:judged:<user>:<session>`.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::error::{Result, SiftError};

/// STM list port. Per key, insertion order is preserved; writers to the
/// same key are serialized by the implementation.
#[async_trait]
pub trait ListStore: Send + Sync {
    /// Append a value and refresh the key TTL atomically
    async fn rpush_with_expire(&self, key: &str, expiration_days: i64, value: &str) -> Result<()>;

    /// Range with redis index semantics (negative indices from the end,
    /// inclusive stop). `lrange(key, 0, -1)` returns the whole list.
    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>>;

    /// Remove the first element equal to `value`; absent values are fine
    async fn lrem(&self, key: &str, value: &str) -> Result<()>;

    /// Delete keys outright
    async fn del(&self, keys: &[String]) -> Result<()>;

    /// Enumerate live keys matching a `*` glob; may be eventually consistent
    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>>;

    /// Add a member to a set key
    async fn sadd(&self, key: &str, member: &str) -> Result<()>;

    /// Membership test on a set key
    async fn sis_member(&self, key: &str, member: &str) -> Result<bool>;

    /// Refresh a key's TTL
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;
}

#[derive(Debug, Default)]
struct Expiring<T> {
    value: T,
    expires_at: Option<DateTime<Utc>>,
}

impl<T> Expiring<T> {
    fn live(&self) -> bool {
        self.expires_at.map(|t| t > Utc::now()).unwrap_or(true)
    }
}

/// In-memory list store; the default backend and the test harness
#[derive(Debug, Default)]
pub struct InMemoryListStore {
    lists: Mutex<HashMap<String, Expiring<Vec<String>>>>,
    sets: Mutex<HashMap<String, Expiring<HashSet<String>>>>,
}

impl InMemoryListStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_lists(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Expiring<Vec<String>>>>> {
        self.lists
            .lock()
            .map_err(|_| SiftError::Store("list store poisoned".to_string()))
    }

    fn lock_sets(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Expiring<HashSet<String>>>>> {
        self.sets
            .lock()
            .map_err(|_| SiftError::Store("list store poisoned".to_string()))
    }
}

#[async_trait]
impl ListStore for InMemoryListStore {
    async fn rpush_with_expire(&self, key: &str, expiration_days: i64, value: &str) -> Result<()> {
        let mut lists = self.lock_lists()?;
        let entry = lists.entry(key.to_string()).or_default();
        if !entry.live() {
            entry.value.clear();
        }
        entry.value.push(value.to_string());
        entry.expires_at = if expiration_days > 0 {
            Some(Utc::now() + Duration::days(expiration_days))
        } else {
            None
        };
        Ok(())
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        let lists = self.lock_lists()?;
        let Some(entry) = lists.get(key).filter(|e| e.live()) else {
            return Ok(Vec::new());
        };
        let len = entry.value.len() as i64;

        let start = if start < 0 { (len + start).max(0) } else { start };
        let mut stop = if stop < 0 { len + stop } else { stop };
        if stop >= len {
            stop = len - 1;
        }
        if start > stop || len == 0 {
            return Ok(Vec::new());
        }

        Ok(entry.value[start as usize..=stop as usize].to_vec())
    }

    async fn lrem(&self, key: &str, value: &str) -> Result<()> {
        let mut lists = self.lock_lists()?;
        if let Some(entry) = lists.get_mut(key).filter(|e| e.live()) {
            if let Some(pos) = entry.value.iter().position(|v| v == value) {
                entry.value.remove(pos);
            }
        }
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> Result<()> {
        let mut lists = self.lock_lists()?;
        let mut sets = self.lock_sets()?;
        for key in keys {
            lists.remove(key);
            sets.remove(key);
        }
        Ok(())
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let lists = self.lock_lists()?;
        Ok(lists
            .iter()
            .filter(|(k, e)| e.live() && glob_match(pattern, k))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        let mut sets = self.lock_sets()?;
        let entry = sets.entry(key.to_string()).or_default();
        if !entry.live() {
            entry.value.clear();
            entry.expires_at = None;
        }
        entry.value.insert(member.to_string());
        Ok(())
    }

    async fn sis_member(&self, key: &str, member: &str) -> Result<bool> {
        let sets = self.lock_sets()?;
        Ok(sets
            .get(key)
            .filter(|e| e.live())
            .map(|e| e.value.contains(member))
            .unwrap_or(false))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let deadline = Utc::now() + ttl;
        let mut lists = self.lock_lists()?;
        if let Some(entry) = lists.get_mut(key) {
            entry.expires_at = Some(deadline);
        }
        drop(lists);
        let mut sets = self.lock_sets()?;
        if let Some(entry) = sets.get_mut(key) {
            entry.expires_at = Some(deadline);
        }
        Ok(())
    }
}

/// Minimal `*`-only glob matcher, enough for redis-style key patterns
pub(crate) fn glob_match(pattern: &str, text: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == text;
    }

    let mut rest = text;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            match rest.strip_prefix(part) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == parts.len() - 1 {
            return rest.ends_with(part);
        } else {
            match rest.find(part) {
                Some(pos) => rest = &rest[pos + part.len()..],
                None => return false,
            }
        }
    }
    true
}
