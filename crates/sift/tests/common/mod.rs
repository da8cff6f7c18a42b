//! Shared harness for integration tests: an engine wired to in-memory
//! stores, a scripted LLM and a deterministic embedder.
#![allow(dead_code)]

use std::sync::Arc;

use sift::config::Config;
use sift::embedding::Embedder;
use sift::engine::MemoryEngine;
use sift::judge::Judge;
use sift::llm::LlmClient;
use sift::metrics::MetricsCollector;
use sift::storage::{InMemoryListStore, InMemoryStagingStore, InMemoryVectorStore};
use sift::testing::{MockEmbedder, MockLlm};

pub struct Harness {
    pub engine: Arc<MemoryEngine>,
    pub llm: Arc<MockLlm>,
    pub embedder: Arc<MockEmbedder>,
    pub list: Arc<InMemoryListStore>,
    pub staging: Arc<InMemoryStagingStore>,
    pub vector: Arc<InMemoryVectorStore>,
    pub metrics: Arc<MetricsCollector>,
}

/// A config tuned so a single add triggers judging immediately
pub fn funnel_config() -> Config {
    let mut config = Config::default();
    config.stm.judge_min_messages = 1;
    config.stm.batch_judge_size = 10;
    config.staging.value_threshold = 0.5;
    config.staging.min_occurrences = 1;
    config.staging.min_wait_hours = 0;
    config.staging.confidence_high = 0.9;
    config.staging.confidence_low = 0.5;
    config
}

pub fn build(config: Config, llm: MockLlm) -> Harness {
    build_with_embedder(config, llm, Arc::new(MockEmbedder::new()))
}

pub fn build_with_embedder(config: Config, llm: MockLlm, embedder: Arc<MockEmbedder>) -> Harness {
    let llm = Arc::new(llm);
    let list = Arc::new(InMemoryListStore::new());
    let staging = Arc::new(InMemoryStagingStore::new(config.staging.ttl_days));
    let vector = Arc::new(InMemoryVectorStore::new());
    let metrics = Arc::new(MetricsCollector::new());

    let judge = Judge::new(
        llm.clone() as Arc<dyn LlmClient>,
        "judge-model",
        "extract-model",
    );

    let engine = Arc::new(MemoryEngine::new(
        config,
        vector.clone(),
        list.clone(),
        staging.clone(),
        embedder.clone() as Arc<dyn Embedder>,
        judge,
        metrics.clone(),
    ));

    Harness {
        engine,
        llm,
        embedder,
        list,
        staging,
        vector,
        metrics,
    }
}

/// One-entry batch verdict for a stageable preference
pub fn preference_verdict(value: f64, confidence: f64) -> String {
    format!(
        r#"[{{"value_score":{value},"confidence_score":{confidence},"category":"preference","reason":"states a preference","tags":["python"],"entities":{{"language":"Python"}},"should_stage":true,"is_critical":false}}]"#
    )
}

/// One-entry batch verdict flagged critical
pub fn critical_verdict() -> String {
    r#"[{"value_score":0.95,"confidence_score":0.95,"category":"fact","reason":"key fact","tags":["allergy"],"entities":{"allergen":"penicillin"},"should_stage":true,"is_critical":true}]"#.to_string()
}

/// Tag-extraction response used by the promotion create path
pub fn tag_extraction() -> String {
    r#"{"tags":["python","preference"],"entities":{"language":"Python"}}"#.to_string()
}
