use std::path::Path;

use serde::Deserialize;

use crate::error::{Result, SiftError};

/// Main configuration structure for sift
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Short-term memory capture
    #[serde(default)]
    pub stm: StmConfig,
    /// Observation buffer between judge and long-term store
    #[serde(default)]
    pub staging: StagingConfig,
    /// Long-term decay and eviction
    #[serde(default)]
    pub decay: DecayConfig,
    /// Retrieval fusion
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    /// Judge / merge LLM endpoint
    #[serde(default)]
    pub llm: LlmConfig,
    /// Embedding endpoint
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    /// Backing store selection
    #[serde(default)]
    pub storage: StorageConfig,
    /// Relational persistence (metrics, alerts, end users)
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Metrics collection and persistence
    #[serde(default)]
    pub metrics: MetricsConfig,
    /// Alert engine and notification
    #[serde(default)]
    pub alerts: AlertsConfig,
    /// Admin HTTP server
    #[serde(default)]
    pub server: ServerConfig,
    /// Log file handling
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SiftError::Config(format!("cannot read {}: {e}", path.display())))?;
        toml::from_str(&raw).map_err(|e| SiftError::Config(format!("invalid config: {e}")))
    }
}

/// Short-term memory configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StmConfig {
    /// Sliding window size per session
    #[serde(default = "default_stm_window_size")]
    pub window_size: usize,
    /// Days before an untouched STM key expires
    #[serde(default = "default_stm_expiration_days")]
    pub expiration_days: i64,
    /// Turns per judge batch
    #[serde(default = "default_stm_batch_judge_size")]
    pub batch_judge_size: usize,
    /// Unjudged turns needed to trigger a judge pass
    #[serde(default = "default_stm_judge_min_messages")]
    pub judge_min_messages: usize,
    /// Oldest-unjudged-turn age that also triggers a pass
    #[serde(default = "default_stm_judge_max_wait_minutes")]
    pub judge_max_wait_minutes: i64,
}

impl Default for StmConfig {
    fn default() -> Self {
        Self {
            window_size: default_stm_window_size(),
            expiration_days: default_stm_expiration_days(),
            batch_judge_size: default_stm_batch_judge_size(),
            judge_min_messages: default_stm_judge_min_messages(),
            judge_max_wait_minutes: default_stm_judge_max_wait_minutes(),
        }
    }
}

fn default_stm_window_size() -> usize {
    100
}

fn default_stm_expiration_days() -> i64 {
    7
}

fn default_stm_batch_judge_size() -> usize {
    10
}

fn default_stm_judge_min_messages() -> usize {
    5
}

fn default_stm_judge_max_wait_minutes() -> i64 {
    30
}

/// Staging buffer configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StagingConfig {
    /// Occurrences needed before an entry is eligible for promotion
    #[serde(default = "default_staging_min_occurrences")]
    pub min_occurrences: u32,
    /// Hours an entry must have been observed before promotion
    #[serde(default = "default_staging_min_wait_hours")]
    pub min_wait_hours: i64,
    /// Judge value score required to enter staging at all
    #[serde(default = "default_staging_value_threshold")]
    pub value_threshold: f64,
    /// Confidence at or above which entries auto-promote
    #[serde(default = "default_staging_confidence_high")]
    pub confidence_high: f64,
    /// Confidence at or above which entries wait for review
    #[serde(default = "default_staging_confidence_low")]
    pub confidence_low: f64,
    /// Entry TTL in days
    #[serde(default = "default_staging_ttl_days")]
    pub ttl_days: i64,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            min_occurrences: default_staging_min_occurrences(),
            min_wait_hours: default_staging_min_wait_hours(),
            value_threshold: default_staging_value_threshold(),
            confidence_high: default_staging_confidence_high(),
            confidence_low: default_staging_confidence_low(),
            ttl_days: default_staging_ttl_days(),
        }
    }
}

fn default_staging_min_occurrences() -> u32 {
    2
}

fn default_staging_min_wait_hours() -> i64 {
    48
}

fn default_staging_value_threshold() -> f64 {
    0.6
}

fn default_staging_confidence_high() -> f64 {
    0.8
}

fn default_staging_confidence_low() -> f64 {
    0.5
}

fn default_staging_ttl_days() -> i64 {
    30
}

/// Long-term decay configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DecayConfig {
    /// Half-life of the time-decay term, in days
    #[serde(default = "default_decay_half_life_days")]
    pub half_life_days: i64,
    /// Records below this decay score are evicted
    #[serde(default = "default_decay_min_score")]
    pub min_score: f64,
}

impl Default for DecayConfig {
    fn default() -> Self {
        Self {
            half_life_days: default_decay_half_life_days(),
            min_score: default_decay_min_score(),
        }
    }
}

fn default_decay_half_life_days() -> i64 {
    90
}

fn default_decay_min_score() -> f64 {
    0.3
}

/// Retrieval configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RetrievalConfig {
    /// STM turns prepended to every retrieval
    #[serde(default = "default_context_window")]
    pub context_window: usize,
    /// Hard cap on the fused result set (0 = unlimited)
    #[serde(default = "default_max_recent_memories")]
    pub max_recent_memories: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            context_window: default_context_window(),
            max_recent_memories: default_max_recent_memories(),
        }
    }
}

fn default_context_window() -> usize {
    10
}

fn default_max_recent_memories() -> usize {
    100
}

/// LLM endpoint configuration (judge, restatement, merge decisions)
#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    /// OpenAI-compatible base URL
    #[serde(default = "default_llm_api_url")]
    pub api_url: String,
    /// Environment variable holding the API key
    #[serde(default = "default_llm_api_key_env")]
    pub api_key_env: String,
    /// Model used for value judgment and restatement
    #[serde(default = "default_llm_judge_model")]
    pub judge_model: String,
    /// Stronger model used for structured tag extraction
    #[serde(default = "default_llm_extract_model")]
    pub extract_model: String,
    /// Request timeout in seconds
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_url: default_llm_api_url(),
            api_key_env: default_llm_api_key_env(),
            judge_model: default_llm_judge_model(),
            extract_model: default_llm_extract_model(),
            timeout_secs: default_llm_timeout_secs(),
        }
    }
}

fn default_llm_api_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_llm_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_llm_judge_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_llm_extract_model() -> String {
    "gpt-4o".to_string()
}

fn default_llm_timeout_secs() -> u64 {
    30
}

/// Embedding endpoint configuration
#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingConfig {
    /// OpenAI-compatible base URL
    #[serde(default = "default_llm_api_url")]
    pub api_url: String,
    /// Environment variable holding the API key
    #[serde(default = "default_llm_api_key_env")]
    pub api_key_env: String,
    /// Embedding model identifier
    #[serde(default = "default_embedding_model")]
    pub model: String,
    /// Expected vector dimensionality
    #[serde(default = "default_embedding_dimension")]
    pub dimension: usize,
    /// Request timeout in seconds
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            api_url: default_llm_api_url(),
            api_key_env: default_llm_api_key_env(),
            model: default_embedding_model(),
            dimension: default_embedding_dimension(),
            timeout_secs: default_llm_timeout_secs(),
        }
    }
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_embedding_dimension() -> usize {
    1536
}

/// Backing store selection
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// "memory" or "redis"
    #[serde(default = "default_storage_backend")]
    pub backend: String,
    /// Redis connection URL when backend = "redis"
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            redis_url: default_redis_url(),
        }
    }
}

fn default_storage_backend() -> String {
    "memory".to_string()
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/".to_string()
}

/// Relational database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite URL
    #[serde(default = "default_database_url")]
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
        }
    }
}

fn default_database_url() -> String {
    "sqlite://sift.db?mode=rwc".to_string()
}

/// Metrics collection configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Minutes between persistence flushes
    #[serde(default = "default_metrics_persist_interval_minutes")]
    pub persist_interval_minutes: i64,
    /// Hours of time-series reloaded at startup
    #[serde(default = "default_metrics_history_load_hours")]
    pub history_load_hours: i64,
    /// Hours of points kept in memory after a flush
    #[serde(default = "default_metrics_memory_retention_hours")]
    pub memory_retention_hours: i64,
    /// Days of persisted time-series kept before cleanup
    #[serde(default = "default_metrics_retention_days")]
    pub retention_days: i64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            persist_interval_minutes: default_metrics_persist_interval_minutes(),
            history_load_hours: default_metrics_history_load_hours(),
            memory_retention_hours: default_metrics_memory_retention_hours(),
            retention_days: default_metrics_retention_days(),
        }
    }
}

fn default_metrics_persist_interval_minutes() -> i64 {
    1
}

fn default_metrics_history_load_hours() -> i64 {
    24
}

fn default_metrics_memory_retention_hours() -> i64 {
    1
}

fn default_metrics_retention_days() -> i64 {
    30
}

/// Alert engine configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AlertsConfig {
    /// Minutes between rule evaluation passes
    #[serde(default = "default_alert_check_interval_minutes")]
    pub check_interval_minutes: i64,
    /// queue_backlog: pending staging entries above this fire a warning
    #[serde(default = "default_alert_queue_backlog_threshold")]
    pub queue_backlog_threshold: usize,
    #[serde(default = "default_alert_queue_backlog_cooldown_minutes")]
    pub queue_backlog_cooldown_minutes: i64,
    /// low_success_rate: promotion success percentage threshold
    #[serde(default = "default_alert_success_rate_threshold")]
    pub success_rate_threshold: f64,
    #[serde(default = "default_alert_success_rate_cooldown_minutes")]
    pub success_rate_cooldown_minutes: i64,
    #[serde(default = "default_alert_cache_cooldown_minutes")]
    pub cache_cooldown_minutes: i64,
    /// decay_spike: forgotten-count threshold
    #[serde(default = "default_alert_decay_spike_threshold")]
    pub decay_spike_threshold: i64,
    #[serde(default = "default_alert_decay_spike_cooldown_minutes")]
    pub decay_spike_cooldown_minutes: i64,
    /// In-memory alert ring size
    #[serde(default = "default_alert_history_max_size")]
    pub history_max_size: usize,
    /// cache_anomaly: statistics window in minutes
    #[serde(default = "default_alert_cache_window_minutes")]
    pub cache_window_minutes: i64,
    /// cache_anomaly: minimum accesses before the rule may fire
    #[serde(default = "default_alert_cache_min_samples")]
    pub cache_min_samples: i64,
    /// cache_anomaly: hit-rate percentage below which a WARNING fires
    #[serde(default = "default_alert_cache_warn_threshold")]
    pub cache_warn_threshold: f64,
    /// cache_anomaly: hit-rate percentage below which an ERROR fires
    #[serde(default = "default_alert_cache_error_threshold")]
    pub cache_error_threshold: f64,
    /// cache_anomaly: samples considered for trend-drop detection
    #[serde(default = "default_alert_cache_trend_periods")]
    pub cache_trend_periods: usize,
    /// Notification delivery
    #[serde(default)]
    pub notify: NotifyConfig,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            check_interval_minutes: default_alert_check_interval_minutes(),
            queue_backlog_threshold: default_alert_queue_backlog_threshold(),
            queue_backlog_cooldown_minutes: default_alert_queue_backlog_cooldown_minutes(),
            success_rate_threshold: default_alert_success_rate_threshold(),
            success_rate_cooldown_minutes: default_alert_success_rate_cooldown_minutes(),
            cache_cooldown_minutes: default_alert_cache_cooldown_minutes(),
            decay_spike_threshold: default_alert_decay_spike_threshold(),
            decay_spike_cooldown_minutes: default_alert_decay_spike_cooldown_minutes(),
            history_max_size: default_alert_history_max_size(),
            cache_window_minutes: default_alert_cache_window_minutes(),
            cache_min_samples: default_alert_cache_min_samples(),
            cache_warn_threshold: default_alert_cache_warn_threshold(),
            cache_error_threshold: default_alert_cache_error_threshold(),
            cache_trend_periods: default_alert_cache_trend_periods(),
            notify: NotifyConfig::default(),
        }
    }
}

fn default_alert_check_interval_minutes() -> i64 {
    1
}

fn default_alert_queue_backlog_threshold() -> usize {
    100
}

fn default_alert_queue_backlog_cooldown_minutes() -> i64 {
    10
}

fn default_alert_success_rate_threshold() -> f64 {
    60.0
}

fn default_alert_success_rate_cooldown_minutes() -> i64 {
    30
}

fn default_alert_cache_cooldown_minutes() -> i64 {
    15
}

fn default_alert_decay_spike_threshold() -> i64 {
    1000
}

fn default_alert_decay_spike_cooldown_minutes() -> i64 {
    60
}

fn default_alert_history_max_size() -> usize {
    100
}

fn default_alert_cache_window_minutes() -> i64 {
    60
}

fn default_alert_cache_min_samples() -> i64 {
    20
}

fn default_alert_cache_warn_threshold() -> f64 {
    40.0
}

fn default_alert_cache_error_threshold() -> f64 {
    20.0
}

fn default_alert_cache_trend_periods() -> usize {
    5
}

/// Notification delivery configuration
#[derive(Debug, Clone, Deserialize)]
pub struct NotifyConfig {
    #[serde(default)]
    pub webhook_enabled: bool,
    #[serde(default)]
    pub webhook_url: String,
    #[serde(default = "default_webhook_timeout_secs")]
    pub webhook_timeout_secs: u64,
    #[serde(default)]
    pub email_enabled: bool,
    #[serde(default = "default_smtp_host")]
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default)]
    pub smtp_username: String,
    #[serde(default)]
    pub smtp_password: String,
    #[serde(default = "default_email_from")]
    pub email_from: String,
    #[serde(default)]
    pub email_to: Vec<String>,
    #[serde(default = "default_smtp_use_tls")]
    pub smtp_use_tls: bool,
    /// Subset of INFO / WARNING / ERROR that gets delivered
    #[serde(default = "default_notify_levels")]
    pub levels: Vec<String>,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            webhook_enabled: false,
            webhook_url: String::new(),
            webhook_timeout_secs: default_webhook_timeout_secs(),
            email_enabled: false,
            smtp_host: default_smtp_host(),
            smtp_port: default_smtp_port(),
            smtp_username: String::new(),
            smtp_password: String::new(),
            email_from: default_email_from(),
            email_to: Vec::new(),
            smtp_use_tls: default_smtp_use_tls(),
            levels: default_notify_levels(),
        }
    }
}

fn default_webhook_timeout_secs() -> u64 {
    5
}

fn default_smtp_host() -> String {
    "smtp.example.com".to_string()
}

fn default_smtp_port() -> u16 {
    587
}

fn default_email_from() -> String {
    "sift alerts <alerts@example.com>".to_string()
}

fn default_smtp_use_tls() -> bool {
    true
}

fn default_notify_levels() -> Vec<String> {
    vec!["ERROR".to_string(), "WARNING".to_string()]
}

/// Admin HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> String {
    "127.0.0.1:8450".to_string()
}

/// Log file configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// Directory for daily-rotated log files
    #[serde(default = "default_log_dir")]
    pub dir: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            dir: default_log_dir(),
        }
    }
}

fn default_log_dir() -> String {
    "log".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.stm.expiration_days, 7);
        assert_eq!(config.stm.batch_judge_size, 10);
        assert_eq!(config.stm.judge_min_messages, 5);
        assert_eq!(config.staging.min_occurrences, 2);
        assert_eq!(config.staging.min_wait_hours, 48);
        assert!((config.staging.value_threshold - 0.6).abs() < f64::EPSILON);
        assert_eq!(config.decay.half_life_days, 90);
        assert!((config.decay.min_score - 0.3).abs() < f64::EPSILON);
        assert_eq!(config.retrieval.context_window, 10);
        assert_eq!(config.retrieval.max_recent_memories, 100);
        assert_eq!(config.metrics.persist_interval_minutes, 1);
        assert_eq!(config.alerts.check_interval_minutes, 1);
        assert_eq!(config.alerts.cache_min_samples, 20);
        assert_eq!(config.alerts.notify.levels, vec!["ERROR", "WARNING"]);
        assert_eq!(config.storage.backend, "memory");
    }

    #[test]
    fn test_toml_partial_deserialization() {
        let toml_str = r#"
[stm]
judge_min_messages = 1
judge_max_wait_minutes = 5

[staging]
min_occurrences = 3
min_wait_hours = 0
value_threshold = 0.5

[alerts]
queue_backlog_threshold = 1

[alerts.notify]
webhook_enabled = true
webhook_url = "https://hooks.example.com/alerts"
"#;

        let config: Config = toml::from_str(toml_str).expect("Failed to parse TOML");
        assert_eq!(config.stm.judge_min_messages, 1);
        assert_eq!(config.stm.judge_max_wait_minutes, 5);
        assert_eq!(config.staging.min_occurrences, 3);
        assert_eq!(config.staging.min_wait_hours, 0);
        assert_eq!(config.alerts.queue_backlog_threshold, 1);
        assert!(config.alerts.notify.webhook_enabled);
        // Untouched sections keep their defaults
        assert_eq!(config.stm.batch_judge_size, 10);
        assert_eq!(config.decay.half_life_days, 90);
        assert_eq!(config.alerts.notify.smtp_port, 587);
    }

    #[test]
    fn test_storage_backend_from_toml() {
        let toml_str = r#"
[storage]
backend = "redis"
redis_url = "redis://cache:6379/2"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.storage.backend, "redis");
        assert_eq!(config.storage.redis_url, "redis://cache:6379/2");
    }
}
