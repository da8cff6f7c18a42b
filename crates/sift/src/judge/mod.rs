//! LLM judge: value scoring, restatement, tag extraction, merge decisions
//!
//! The judge is a thin wrapper over an [`LlmClient`] with strict JSON
//! contracts. Determinism is not assumed; callers cache results keyed on
//! exact input content. Responses wrapped in markdown code fences are
//! tolerated everywhere.

mod prompts;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;

use crate::error::{Result, SiftError};
use crate::llm::LlmClient;
use crate::types::{JudgeResult, MemoryCategory, MergeStrategy};

/// Judge engine: scores turns, restates facts, decides merges
pub struct Judge {
    llm: Arc<dyn LlmClient>,
    judge_model: String,
    extract_model: String,
}

#[derive(Debug, Deserialize)]
struct TagExtraction {
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    entities: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct MergeDecision {
    strategy: String,
    #[serde(default)]
    #[allow(dead_code)]
    reason: String,
    #[serde(default)]
    merged_content: Option<String>,
}

impl Judge {
    pub fn new(llm: Arc<dyn LlmClient>, judge_model: &str, extract_model: &str) -> Self {
        Self {
            llm,
            judge_model: judge_model.to_string(),
            extract_model: extract_model.to_string(),
        }
    }

    /// Judge a single turn
    pub async fn judge_value(&self, content: &str) -> Result<JudgeResult> {
        let prompt = prompts::JUDGE_PROMPT.replace("{content}", content);
        let response = self.llm.generate(&self.judge_model, &prompt).await?;
        let cleaned = strip_fences(&response);
        serde_json::from_str(cleaned)
            .map_err(|e| SiftError::Llm(format!("unparseable judgment: {e}; raw: {cleaned}")))
    }

    /// Judge a batch of turns in one call.
    ///
    /// The result is positionally aligned with the input; a length mismatch
    /// fails the whole batch.
    pub async fn judge_batch(&self, contents: &[String]) -> Result<Vec<JudgeResult>> {
        if contents.is_empty() {
            return Ok(Vec::new());
        }

        let mut items = String::new();
        for (i, content) in contents.iter().enumerate() {
            items.push_str(&format!("[Memory {}]\n{}\n\n", i + 1, content));
        }

        let prompt = prompts::JUDGE_BATCH_PROMPT
            .replace("{count}", &contents.len().to_string())
            .replace("{items}", &items);

        let response = self.llm.generate(&self.judge_model, &prompt).await?;
        let cleaned = strip_fences(&response);
        let results: Vec<JudgeResult> = serde_json::from_str(cleaned)
            .map_err(|e| SiftError::Llm(format!("unparseable batch judgment: {e}")))?;

        if results.len() != contents.len() {
            return Err(SiftError::Llm(format!(
                "batch judgment length mismatch: expected {}, got {}",
                contents.len(),
                results.len()
            )));
        }

        Ok(results)
    }

    /// Restate a raw exchange as a context-free third-person fact.
    ///
    /// Callers fall back to the raw content on error.
    pub async fn summarize_and_restructure(
        &self,
        content: &str,
        category: MemoryCategory,
    ) -> Result<String> {
        let prompt = prompts::SUMMARIZE_PROMPT
            .replace("{content}", content)
            .replace("{category}", category.as_str());
        let response = self.llm.generate(&self.judge_model, &prompt).await?;
        let summary = response.trim().trim_matches('"').to_string();
        if summary.is_empty() {
            return Err(SiftError::Llm("empty restatement".to_string()));
        }
        Ok(summary)
    }

    /// Extract tags and entities with the stronger model.
    ///
    /// Callers fall back to the tags the judge emitted earlier.
    pub async fn extract_structured_tags(
        &self,
        content: &str,
        category: MemoryCategory,
    ) -> Result<(Vec<String>, BTreeMap<String, String>)> {
        let prompt = prompts::EXTRACT_TAGS_PROMPT
            .replace("{content}", content)
            .replace("{category}", category.as_str());
        let response = self.llm.generate(&self.extract_model, &prompt).await?;
        let cleaned = strip_fences(&response);
        let extracted: TagExtraction = serde_json::from_str(cleaned)
            .map_err(|e| SiftError::Llm(format!("unparseable tag extraction: {e}")))?;
        Ok((extracted.tags, extracted.entities))
    }

    /// Decide how to reconcile two near-duplicate memories.
    ///
    /// Returns the strategy plus the merged content when the strategy is
    /// `merge`. An unrecognized strategy string degrades to `keep_both`.
    pub async fn decide_merge_strategy(
        &self,
        existing: &str,
        candidate: &str,
    ) -> Result<(MergeStrategy, Option<String>)> {
        let prompt = prompts::MERGE_STRATEGY_PROMPT
            .replace("{existing}", existing)
            .replace("{candidate}", candidate);
        let response = self.llm.generate(&self.judge_model, &prompt).await?;
        let cleaned = strip_fences(&response);
        let decision: MergeDecision = serde_json::from_str(cleaned)
            .map_err(|e| SiftError::Llm(format!("unparseable merge decision: {e}")))?;

        let strategy = match MergeStrategy::parse(&decision.strategy) {
            Some(s) => s,
            None => {
                debug!(raw = %decision.strategy, "unknown merge strategy, keeping both");
                MergeStrategy::KeepBoth
            }
        };

        Ok((strategy, decision.merged_content))
    }
}

/// Strip optional markdown code fences around a JSON payload
fn strip_fences(response: &str) -> &str {
    let mut s = response.trim();
    if let Some(stripped) = s.strip_prefix("```json") {
        s = stripped;
    } else if let Some(stripped) = s.strip_prefix("```") {
        s = stripped;
    }
    if let Some(stripped) = s.strip_suffix("```") {
        s = stripped;
    }
    s.trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockLlm;

    fn judge_with(responses: &[&str]) -> Judge {
        Judge::new(Arc::new(MockLlm::scripted(responses)), "judge-m", "extract-m")
    }

    #[test]
    fn test_strip_fences() {
        assert_eq!(strip_fences("{\"a\":1}"), "{\"a\":1}");
        assert_eq!(strip_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_fences("```\n[1,2]\n```"), "[1,2]");
        assert_eq!(strip_fences("  ```json\n{}\n```  "), "{}");
    }

    #[tokio::test]
    async fn test_judge_batch_aligned() {
        let judge = judge_with(&[r#"```json
[
 {"value_score":0.8,"confidence_score":0.7,"category":"preference","reason":"","tags":[],"entities":{},"should_stage":true,"is_critical":false},
 {"value_score":0.1,"confidence_score":0.9,"category":"noise","reason":"","tags":[],"entities":{},"should_stage":false,"is_critical":false}
]
```"#]);

        let results = judge
            .judge_batch(&["I prefer Python".to_string(), "hi".to_string()])
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].category, MemoryCategory::Preference);
        assert!(!results[1].should_stage);
    }

    #[tokio::test]
    async fn test_judge_batch_length_mismatch_fails() {
        let judge = judge_with(
            &[r#"[{"value_score":0.8,"confidence_score":0.7,"category":"fact","should_stage":true}]"#],
        );
        let err = judge
            .judge_batch(&["a".to_string(), "b".to_string()])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("length mismatch"));
    }

    #[tokio::test]
    async fn test_decide_merge_strategy_unknown_degrades() {
        let judge = judge_with(&[r#"{"strategy":"something_else","reason":"?"}"#]);
        let (strategy, merged) = judge.decide_merge_strategy("a", "b").await.unwrap();
        assert_eq!(strategy, MergeStrategy::KeepBoth);
        assert!(merged.is_none());
    }

    #[tokio::test]
    async fn test_decide_merge_strategy_merge_carries_content() {
        let judge = judge_with(
            &[r#"{"strategy":"merge","reason":"both add detail","merged_content":"The user prefers and actively uses Python."}"#],
        );
        let (strategy, merged) = judge.decide_merge_strategy("a", "b").await.unwrap();
        assert_eq!(strategy, MergeStrategy::Merge);
        assert_eq!(
            merged.as_deref(),
            Some("The user prefers and actively uses Python.")
        );
    }

    #[tokio::test]
    async fn test_summarize_trims_quotes() {
        let judge = judge_with(&["\"The user prefers Python.\"\n"]);
        let summary = judge
            .summarize_and_restructure("User: I like Python\nAI: noted", MemoryCategory::Preference)
            .await
            .unwrap();
        assert_eq!(summary, "The user prefers Python.");
    }
}
