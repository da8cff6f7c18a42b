//! Core record types shared across the memory tiers
//!
//! A [`MemoryRecord`] is the unit that moves through the funnel: it is born
//! short-term, and a distilled restatement of it may later be written to the
//! long-term store with structured [`LtmMetadata`]. [`StagingEntry`] is the
//! intermediate observation-buffer form, and [`JudgeResult`] is the ephemeral
//! verdict produced by the LLM judge.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Storage tier a record belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    ShortTerm,
    LongTerm,
}

/// Semantic category assigned by the judge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryCategory {
    /// Objective facts (places, dates, names, tech stacks)
    Fact,
    /// User preferences and habits
    Preference,
    /// Long-running goals and intentions
    Goal,
    /// Nothing worth keeping
    Noise,
}

impl MemoryCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryCategory::Fact => "fact",
            MemoryCategory::Preference => "preference",
            MemoryCategory::Goal => "goal",
            MemoryCategory::Noise => "noise",
        }
    }
}

impl std::fmt::Display for MemoryCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a staging entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StagingStatus {
    /// Awaiting promotion
    Pending,
    /// Confirmed by a reviewer, promoted
    Confirmed,
    /// Rejected by a reviewer
    Rejected,
}

/// Strategy chosen by the judge when two memories are near-duplicates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Keep the existing record, just refresh its counters
    UpdateExisting,
    /// Rewrite the existing record with merged content
    Merge,
    /// The newer statement supersedes the older one
    KeepNewer,
    /// Genuinely distinct, keep both
    KeepBoth,
}

impl MergeStrategy {
    /// Lenient parse of the judge's strategy string
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "update_existing" => Some(MergeStrategy::UpdateExisting),
            "merge" => Some(MergeStrategy::Merge),
            "keep_newer" => Some(MergeStrategy::KeepNewer),
            "keep_both" => Some(MergeStrategy::KeepBoth),
            _ => None,
        }
    }
}

/// A single unit of memory, in either tier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    pub content: String,
    /// Lives in the vector index, never serialized with the payload
    #[serde(skip)]
    pub embedding: Vec<f32>,
    pub timestamp: DateTime<Utc>,
    pub metadata: Map<String, Value>,
    #[serde(rename = "type")]
    pub kind: MemoryKind,
}

impl MemoryRecord {
    /// Build a short-term record from one user↔assistant exchange
    pub fn short_term(
        user_id: &str,
        session_id: &str,
        input: &str,
        output: &str,
        mut metadata: Map<String, Value>,
    ) -> Self {
        metadata.insert("user_id".to_string(), Value::String(user_id.to_string()));
        metadata.insert(
            "session_id".to_string(),
            Value::String(session_id.to_string()),
        );
        Self {
            id: Uuid::new_v4().to_string(),
            content: format!("User: {input}\nAI: {output}"),
            embedding: Vec::new(),
            timestamp: Utc::now(),
            metadata,
            kind: MemoryKind::ShortTerm,
        }
    }

    /// Convenience accessor for a string metadata field
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }
}

/// Typed view over the metadata of a long-term record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LtmMetadata {
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub tags: Vec<String>,
    pub entities: BTreeMap<String, String>,
    pub category: MemoryCategory,
    pub last_access_at: DateTime<Utc>,
    pub access_count: i64,
    pub decay_score: f64,
    /// staging / fast-track / manual
    pub source_type: String,
    /// Confidence score at write time
    pub confidence_origin: f64,
}

impl LtmMetadata {
    /// Read the typed view out of a record's metadata map.
    ///
    /// Lenient: records written by older builds may miss lifecycle fields, in
    /// which case `last_access_at` defaults to 30 days ago and `decay_score`
    /// to 1.0 so the decay scan still produces sane results.
    pub fn from_map(map: &Map<String, Value>) -> Self {
        let parse_time = |key: &str| {
            map.get(key)
                .and_then(Value::as_str)
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|t| t.with_timezone(&Utc))
        };

        Self {
            user_id: map
                .get("user_id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            created_at: parse_time("created_at").unwrap_or_else(Utc::now),
            tags: map
                .get("tags")
                .and_then(Value::as_array)
                .map(|arr| {
                    arr.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            entities: map
                .get("entities")
                .and_then(Value::as_object)
                .map(|obj| {
                    obj.iter()
                        .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                        .collect()
                })
                .unwrap_or_default(),
            category: map
                .get("category")
                .and_then(Value::as_str)
                .and_then(|s| serde_json::from_value(Value::String(s.to_string())).ok())
                .unwrap_or(MemoryCategory::Fact),
            last_access_at: parse_time("last_access_at")
                .unwrap_or_else(|| Utc::now() - Duration::days(30)),
            access_count: map
                .get("access_count")
                .and_then(Value::as_i64)
                .unwrap_or(0),
            decay_score: map
                .get("decay_score")
                .and_then(Value::as_f64)
                .unwrap_or(1.0),
            source_type: map
                .get("source_type")
                .and_then(Value::as_str)
                .unwrap_or("staging")
                .to_string(),
            confidence_origin: map
                .get("confidence_origin")
                .and_then(Value::as_f64)
                .unwrap_or(0.0),
        }
    }

    /// Write the typed view back into a metadata map
    pub fn apply_to(&self, map: &mut Map<String, Value>) {
        map.insert("user_id".into(), Value::String(self.user_id.clone()));
        map.insert(
            "created_at".into(),
            Value::String(self.created_at.to_rfc3339()),
        );
        map.insert(
            "tags".into(),
            Value::Array(self.tags.iter().cloned().map(Value::String).collect()),
        );
        map.insert(
            "entities".into(),
            Value::Object(
                self.entities
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                    .collect(),
            ),
        );
        map.insert(
            "category".into(),
            Value::String(self.category.as_str().to_string()),
        );
        map.insert(
            "last_access_at".into(),
            Value::String(self.last_access_at.to_rfc3339()),
        );
        map.insert("access_count".into(), Value::from(self.access_count));
        map.insert("decay_score".into(), Value::from(self.decay_score));
        map.insert(
            "source_type".into(),
            Value::String(self.source_type.clone()),
        );
        map.insert(
            "confidence_origin".into(),
            Value::from(self.confidence_origin),
        );
    }

    /// Produce a fresh metadata map from this view
    pub fn to_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        self.apply_to(&mut map);
        map
    }
}

/// A candidate fact in the observation buffer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingEntry {
    pub id: String,
    /// LLM-distilled restatement, not the raw exchange
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub embedding: Vec<f32>,
    pub user_id: String,
    /// Every session that has witnessed this fact
    pub session_ids: Vec<String>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub occurrence_count: u32,
    pub value_score: f64,
    pub confidence_score: f64,
    pub category: MemoryCategory,
    #[serde(default)]
    pub extracted_tags: Vec<String>,
    #[serde(default)]
    pub extracted_entities: BTreeMap<String, String>,
    pub status: StagingStatus,
    /// auto / user
    #[serde(default)]
    pub confirmed_by: String,
}

impl StagingEntry {
    /// Record that a session witnessed this fact (dedup-append)
    pub fn note_session(&mut self, session_id: &str) {
        if !session_id.is_empty() && !self.session_ids.iter().any(|s| s == session_id) {
            self.session_ids.push(session_id.to_string());
        }
    }

    /// Overwrite the scores with a newer judgment
    pub fn absorb_judgment(&mut self, judgment: &JudgeResult) {
        self.value_score = judgment.value_score;
        self.confidence_score = judgment.confidence_score;
        self.category = judgment.category;
        self.extracted_tags = judgment.tags.clone();
        self.extracted_entities = judgment.entities.clone();
    }
}

/// Verdict the judge produces for a single turn
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeResult {
    pub value_score: f64,
    pub confidence_score: f64,
    pub category: MemoryCategory,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub entities: BTreeMap<String, String>,
    pub should_stage: bool,
    /// Key fact or strong intent: promotes straight to LTM
    #[serde(default)]
    pub is_critical: bool,
}

/// A person interacting with the agent, tracked for the admin surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndUser {
    pub id: i64,
    pub user_identifier: String,
    pub last_active: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    /// Live STM session count, filled in by the engine (not persisted)
    #[serde(default)]
    pub session_count: usize,
    /// Long-term record count, filled in by the engine (not persisted)
    #[serde(default)]
    pub ltm_count: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_term_record_fields() {
        let rec = MemoryRecord::short_term("u1", "s1", "hello", "hi there", Map::new());
        assert_eq!(rec.content, "User: hello\nAI: hi there");
        assert_eq!(rec.kind, MemoryKind::ShortTerm);
        assert_eq!(rec.meta_str("user_id"), Some("u1"));
        assert_eq!(rec.meta_str("session_id"), Some("s1"));
    }

    #[test]
    fn test_record_serialization_skips_embedding() {
        let mut rec = MemoryRecord::short_term("u", "s", "a", "b", Map::new());
        rec.embedding = vec![0.1, 0.2];

        let json = serde_json::to_string(&rec).unwrap();
        assert!(!json.contains("embedding"));
        assert!(json.contains("\"type\":\"short_term\""));

        let back: MemoryRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, rec.id);
        assert!(back.embedding.is_empty());
    }

    #[test]
    fn test_ltm_metadata_map_roundtrip() {
        let meta = LtmMetadata {
            user_id: "u1".into(),
            created_at: Utc::now(),
            tags: vec!["rust".into(), "preference".into()],
            entities: BTreeMap::from([("language".to_string(), "Rust".to_string())]),
            category: MemoryCategory::Preference,
            last_access_at: Utc::now(),
            access_count: 3,
            decay_score: 0.7,
            source_type: "staging".into(),
            confidence_origin: 0.85,
        };

        let map = meta.to_map();
        let back = LtmMetadata::from_map(&map);
        assert_eq!(back.user_id, "u1");
        assert_eq!(back.tags, meta.tags);
        assert_eq!(back.entities, meta.entities);
        assert_eq!(back.category, MemoryCategory::Preference);
        assert_eq!(back.access_count, 3);
        assert!((back.decay_score - 0.7).abs() < f64::EPSILON);
        assert_eq!(back.source_type, "staging");
    }

    #[test]
    fn test_ltm_metadata_lenient_defaults() {
        let mut map = Map::new();
        map.insert("user_id".into(), Value::String("u2".into()));

        let meta = LtmMetadata::from_map(&map);
        assert_eq!(meta.user_id, "u2");
        assert_eq!(meta.access_count, 0);
        assert!((meta.decay_score - 1.0).abs() < f64::EPSILON);
        // Unknown last access defaults far enough in the past to decay
        assert!(meta.last_access_at < Utc::now() - Duration::days(29));
    }

    #[test]
    fn test_staging_entry_note_session_dedups() {
        let mut entry = StagingEntry {
            id: "staging:u:abc".into(),
            content: "The user prefers Rust.".into(),
            embedding: Vec::new(),
            user_id: "u".into(),
            session_ids: vec!["s1".into()],
            first_seen_at: Utc::now(),
            last_seen_at: Utc::now(),
            occurrence_count: 1,
            value_score: 0.8,
            confidence_score: 0.7,
            category: MemoryCategory::Preference,
            extracted_tags: Vec::new(),
            extracted_entities: BTreeMap::new(),
            status: StagingStatus::Pending,
            confirmed_by: String::new(),
        };

        entry.note_session("s1");
        entry.note_session("s2");
        entry.note_session("");
        assert_eq!(entry.session_ids, vec!["s1", "s2"]);
    }

    #[test]
    fn test_judge_result_parses_without_optional_fields() {
        let json = r#"{
            "value_score": 0.8,
            "confidence_score": 0.7,
            "category": "preference",
            "should_stage": true
        }"#;
        let result: JudgeResult = serde_json::from_str(json).unwrap();
        assert!(result.should_stage);
        assert!(!result.is_critical);
        assert!(result.tags.is_empty());
    }

    #[test]
    fn test_merge_strategy_parse() {
        assert_eq!(
            MergeStrategy::parse("update_existing"),
            Some(MergeStrategy::UpdateExisting)
        );
        assert_eq!(MergeStrategy::parse(" merge "), Some(MergeStrategy::Merge));
        assert_eq!(MergeStrategy::parse("bogus"), None);
    }
}
