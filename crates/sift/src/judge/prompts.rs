//! Prompt templates for the judge
//!
//! Every template demands bare JSON; responses wrapped in markdown code
//! fences are tolerated by the parser, not by the prompt.

/// Single-turn value judgment. Placeholder: {content}
pub const JUDGE_PROMPT: &str = r#"You are a memory value assessor. Analyze the following conversation excerpt and decide whether it contains information worth remembering long-term.

Conversation:
{content}

Scoring dimensions (total 1.0):
1. Factuality (0.4): objective facts such as places, dates, names, tech stacks
2. Preference (0.3): user likes, habits, style
3. Goals (0.3): long-term plans and intentions

Mark is_critical true only for key facts or strongly stated intent that must never be lost.

Output strict JSON, no extra text:
{
  "value_score": 0.0-1.0,
  "confidence_score": 0.0-1.0,
  "category": "fact|preference|goal|noise",
  "reason": "short reason",
  "tags": ["tag1", "tag2"],
  "entities": {"entity type": "entity value"},
  "should_stage": true/false,
  "is_critical": true/false
}"#;

/// Batched value judgment. Placeholders: {count}, {items}
pub const JUDGE_BATCH_PROMPT: &str = r#"You are a memory value assessor. Analyze the following {count} conversation excerpts and decide for each whether it contains information worth remembering long-term.

{items}

Scoring dimensions (total 1.0):
1. Factuality (0.4): objective facts
2. Preference (0.3): user preferences
3. Goals (0.3): long-term goals

Mark is_critical true only for key facts or strongly stated intent.

Output a strict JSON array with exactly {count} items, in input order, no extra text:
[
  {
    "value_score": 0.0-1.0,
    "confidence_score": 0.0-1.0,
    "category": "fact|preference|goal|noise",
    "reason": "short reason",
    "tags": ["tag1"],
    "entities": {"type": "value"},
    "should_stage": true/false,
    "is_critical": true/false
  }
]"#;

/// Context-free restatement. Placeholders: {content}, {category}
pub const SUMMARIZE_PROMPT: &str = r#"Rewrite the following conversation excerpt as a single context-free factual statement in the third person. Drop greetings, filler and anything session-specific. Keep every concrete detail.

Category: {category}

Excerpt:
{content}

Output only the restatement, no quotes, no extra text."#;

/// Structured tag extraction. Placeholders: {content}, {category}
pub const EXTRACT_TAGS_PROMPT: &str = r#"Extract structured information from the following memory.

Memory:
{content}

Category: {category}

Extract:
1. Key tags (2-5 short tags)
2. Entity map (key entities with their types)

Output strict JSON, no extra text:
{
  "tags": ["tag1", "tag2"],
  "entities": {"entity type": "entity value"}
}"#;

/// Merge-strategy decision. Placeholders: {existing}, {candidate}
pub const MERGE_STRATEGY_PROMPT: &str = r#"Two memories about the same user look semantically similar. Decide how to reconcile them.

Existing memory:
{existing}

New memory:
{candidate}

Strategies:
- "update_existing": the new memory adds nothing, keep the existing one
- "merge": both carry detail, combine them into one statement
- "keep_newer": the new memory supersedes the existing one
- "keep_both": they describe different facts, keep both

Output strict JSON, no extra text:
{
  "strategy": "update_existing|merge|keep_newer|keep_both",
  "reason": "short reason",
  "merged_content": "only when strategy is merge"
}"#;
