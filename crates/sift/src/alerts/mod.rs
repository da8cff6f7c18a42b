//! Rule-based alert engine
//!
//! A fixed rule list is evaluated on a timer against a per-tick context
//! (metrics snapshot, staging queue length, DB-backed rule configs). Rules
//! are synchronous and hold no locks while the engine does I/O. Firing
//! aggregates, persists, caches and notifies.

pub mod notifier;
pub mod repository;
pub mod rules;
pub mod stats;

pub use notifier::AlertNotifier;
pub use repository::{
    AlertRepository, RuleConfigRow, RuleConfigStore, SqliteAlertRepository, SqliteRuleConfigStore,
};
pub use stats::{aggregated_alerts, AggregatedAlert, AlertStatsSync, EngineStats, StatsCache};

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use chrono::{DateTime, Duration, DurationRound, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::AlertsConfig;
use crate::error::{Result, SiftError};
use crate::metrics::{MetricsCollector, MetricsSnapshot};
use crate::storage::StagingStore;

/// Alert severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlertLevel {
    #[serde(rename = "INFO")]
    Info,
    #[serde(rename = "WARNING")]
    Warning,
    #[serde(rename = "ERROR")]
    Error,
}

impl AlertLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Info => "INFO",
            AlertLevel::Warning => "WARNING",
            AlertLevel::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "INFO" => Some(AlertLevel::Info),
            "WARNING" => Some(AlertLevel::Warning),
            "ERROR" => Some(AlertLevel::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One alert event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub level: AlertLevel,
    pub rule: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// Everything a rule may look at during one evaluation pass
pub struct RuleContext {
    /// Pending staging entries; `None` when the store was unreachable
    pub queue_length: Option<usize>,
    pub metrics: MetricsSnapshot,
    /// DB-backed rule configs, reloaded at check time
    pub configs: HashMap<String, RuleConfigRow>,
}

impl RuleContext {
    /// Numeric field from a rule's config JSON, when present
    pub fn config_number(&self, rule_id: &str, field: &str) -> Option<f64> {
        let row = self.configs.get(rule_id)?;
        if row.config_json.is_empty() {
            return None;
        }
        let parsed: Value = serde_json::from_str(&row.config_json).ok()?;
        parsed.get(field)?.as_f64()
    }
}

type CheckFn = Box<dyn Fn(&RuleContext) -> Option<Alert> + Send + Sync>;

struct RuleState {
    enabled: bool,
    cooldown: Duration,
    last_fired: Option<DateTime<Utc>>,
}

/// One alert rule with mutex-guarded firing state
pub struct AlertRule {
    pub id: String,
    pub name: String,
    pub description: String,
    check: CheckFn,
    state: Mutex<RuleState>,
}

impl AlertRule {
    pub fn new(
        id: &str,
        name: &str,
        description: &str,
        cooldown: Duration,
        check: CheckFn,
    ) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            check,
            state: Mutex::new(RuleState {
                enabled: true,
                cooldown,
                last_fired: None,
            }),
        }
    }

    fn enabled(&self) -> bool {
        self.state.lock().unwrap().enabled
    }

    fn set_enabled(&self, enabled: bool) {
        self.state.lock().unwrap().enabled = enabled;
    }

    fn cooldown(&self) -> Duration {
        self.state.lock().unwrap().cooldown
    }

    fn set_cooldown(&self, cooldown: Duration) {
        self.state.lock().unwrap().cooldown = cooldown;
    }

    /// Outside the cooldown window?
    fn should_fire(&self) -> bool {
        let state = self.state.lock().unwrap();
        match state.last_fired {
            Some(at) => Utc::now() - at >= state.cooldown,
            None => true,
        }
    }

    fn mark_fired(&self) {
        self.state.lock().unwrap().last_fired = Some(Utc::now());
    }
}

/// The alert engine
pub struct AlertEngine {
    rules: RwLock<Vec<Arc<AlertRule>>>,
    recent: Mutex<VecDeque<Alert>>,
    max_recent: usize,
    check_interval: Duration,
    repository: Arc<dyn AlertRepository>,
    rule_configs: Arc<dyn RuleConfigStore>,
    staging: Arc<dyn StagingStore>,
    metrics: Arc<MetricsCollector>,
    notifier: Option<Arc<AlertNotifier>>,
    stats: Arc<EngineStats>,
    stats_cache: StatsCache,
    stats_sync: Arc<AlertStatsSync>,
}

impl AlertEngine {
    pub fn new(
        config: &AlertsConfig,
        repository: Arc<dyn AlertRepository>,
        rule_configs: Arc<dyn RuleConfigStore>,
        staging: Arc<dyn StagingStore>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        let stats = Arc::new(EngineStats::new());
        let engine = Self {
            rules: RwLock::new(Vec::new()),
            recent: Mutex::new(VecDeque::with_capacity(config.history_max_size)),
            max_recent: config.history_max_size,
            check_interval: Duration::minutes(config.check_interval_minutes.max(1)),
            repository,
            rule_configs,
            staging,
            metrics,
            notifier: None,
            stats: stats.clone(),
            stats_cache: StatsCache::new(Duration::seconds(30)),
            stats_sync: Arc::new(AlertStatsSync::new(stats)),
        };

        for rule in rules::default_rules(config) {
            engine.add_rule(rule);
        }
        engine
    }

    pub fn with_notifier(mut self, notifier: Arc<AlertNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn stats_sync(&self) -> Arc<AlertStatsSync> {
        self.stats_sync.clone()
    }

    pub fn add_rule(&self, rule: AlertRule) {
        self.rules.write().unwrap().push(Arc::new(rule));
    }

    /// Seed DB rule configs for every registered rule (idempotent)
    pub async fn init_rule_configs(&self, defaults: &AlertsConfig) -> Result<()> {
        let rules: Vec<Arc<AlertRule>> = self.rules.read().unwrap().clone();
        for rule in rules {
            let threshold = match rule.id.as_str() {
                "queue_backlog" => json!({"threshold": defaults.queue_backlog_threshold}),
                "low_success_rate" => json!({"threshold": defaults.success_rate_threshold}),
                "cache_anomaly" => json!({
                    "min_samples": defaults.cache_min_samples,
                    "warn_threshold": defaults.cache_warn_threshold,
                    "error_threshold": defaults.cache_error_threshold,
                    "trend_periods": defaults.cache_trend_periods,
                }),
                "decay_spike" => json!({"threshold": defaults.decay_spike_threshold}),
                _ => json!({}),
            };
            self.rule_configs
                .seed(&RuleConfigRow {
                    id: rule.id.clone(),
                    name: rule.name.clone(),
                    description: rule.description.clone(),
                    enabled: true,
                    cooldown_seconds: rule.cooldown().num_seconds(),
                    config_json: threshold.to_string(),
                    updated_at: Utc::now(),
                })
                .await?;
        }
        Ok(())
    }

    /// Evaluate every enabled rule once
    pub async fn check_all_rules(&self) {
        let configs = match self.rule_configs.load_all().await {
            Ok(configs) => configs,
            Err(e) => {
                warn!(error = %e, "rule config reload failed, using in-memory state");
                HashMap::new()
            }
        };

        let queue_length = match self.staging.get_pending(1, 0).await {
            Ok(entries) => Some(entries.len()),
            Err(e) => {
                warn!(error = %e, "staging unavailable for rule checks");
                None
            }
        };

        let ctx = RuleContext {
            queue_length,
            metrics: self.metrics.snapshot(),
            configs,
        };

        let rules: Vec<Arc<AlertRule>> = self.rules.read().unwrap().clone();
        for rule in rules {
            if !rule.enabled() {
                continue;
            }
            if !rule.should_fire() {
                continue;
            }

            let started = Instant::now();
            let alert = (rule.check)(&ctx);
            self.stats.record_check(&rule.id, started.elapsed());
            self.stats_sync.record_check();

            if let Some(alert) = alert {
                self.fire_alert(alert).await;
                self.stats.record_fire(&rule.id);
                rule.mark_fired();
            }
        }

        stats::clean_old_aggregations();
    }

    /// Aggregate, buffer, persist and notify one alert
    pub async fn fire_alert(&self, alert: Alert) {
        stats::aggregate_alert(&alert);

        {
            let mut recent = self.recent.lock().unwrap();
            recent.push_back(alert.clone());
            while recent.len() > self.max_recent {
                recent.pop_front();
            }
        }

        warn!(
            id = %alert.id,
            level = %alert.level,
            rule = %alert.rule,
            message = %alert.message,
            "alert fired"
        );

        match self.repository.save(&alert).await {
            Ok(()) => {
                self.stats_cache.invalidate();
            }
            Err(e) => {
                error!(error = %e, "alert persistence failed");
                self.stats.record_notify(false);
                self.stats_sync.record_notify(false);
            }
        }

        if let Some(notifier) = &self.notifier {
            let notifier = notifier.clone();
            let stats = self.stats.clone();
            let sync = self.stats_sync.clone();
            let alert = alert.clone();
            tokio::spawn(async move {
                let outcome = std::panic::AssertUnwindSafe(notifier.notify(&alert))
                    .catch_unwind()
                    .await;
                let success = matches!(outcome, Ok(Ok(())));
                if !success {
                    error!(rule = %alert.rule, "alert notification failed");
                }
                stats.record_notify(success);
                sync.record_notify(success);
            });
        }
    }

    /// Manually create an alert (admin surface)
    pub async fn create_alert(&self, mut alert: Alert) -> Result<()> {
        if alert.id.is_empty() {
            alert.id = rules::alert_id(&alert.rule);
        }
        if self.repository.count_by_id(&alert.id).await? > 0 {
            return Err(SiftError::Conflict(format!("alert {}", alert.id)));
        }
        self.fire_alert(alert).await;
        Ok(())
    }

    /// Newest-first view of the in-memory ring
    pub fn recent_alerts(&self, limit: usize) -> Vec<Alert> {
        let recent = self.recent.lock().unwrap();
        let take = if limit == 0 || limit > recent.len() {
            recent.len()
        } else {
            limit
        };
        recent.iter().rev().take(take).cloned().collect()
    }

    /// Filtered query against the repository
    pub async fn query_alerts(
        &self,
        level: Option<&str>,
        rule: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<Alert>, i64)> {
        self.repository.query_filtered(level, rule, limit, offset).await
    }

    /// Delete one alert from the repository and the ring
    pub async fn delete_alert(&self, id: &str) -> Result<()> {
        self.repository.delete(id).await?;
        self.recent.lock().unwrap().retain(|a| a.id != id);
        Ok(())
    }

    /// Rules joined with their DB configs and live stats
    pub async fn rule_infos(&self) -> Result<Vec<Value>> {
        let configs = self.rule_configs.load_all().await?;
        let rules = self.rules.read().unwrap().clone();

        let mut out = Vec::new();
        for rule in rules {
            let config = configs.get(&rule.id);
            out.push(json!({
                "id": rule.id,
                "name": config.map(|c| c.name.clone()).unwrap_or_else(|| rule.name.clone()),
                "description": config
                    .map(|c| c.description.clone())
                    .unwrap_or_else(|| rule.description.clone()),
                "enabled": config.map(|c| c.enabled).unwrap_or_else(|| rule.enabled()),
                "cooldown_seconds": config
                    .map(|c| c.cooldown_seconds)
                    .unwrap_or_else(|| rule.cooldown().num_seconds()),
                "config_json": config.map(|c| c.config_json.clone()).unwrap_or_default(),
                "stats": self.stats.rule_snapshot(&rule.id),
            }));
        }
        Ok(out)
    }

    /// Enable or disable a rule, persisting the change
    pub async fn toggle_rule(&self, rule_id: &str, enabled: bool) -> Result<()> {
        let rule = self
            .find_rule(rule_id)
            .ok_or_else(|| SiftError::NotFound(format!("rule {rule_id}")))?;
        rule.set_enabled(enabled);
        if let Err(e) = self.rule_configs.update_enabled(rule_id, enabled).await {
            warn!(rule_id, error = %e, "rule toggle persistence failed");
        }
        Ok(())
    }

    /// Change a rule's cooldown, persisting the change
    pub async fn update_rule_cooldown(&self, rule_id: &str, cooldown_seconds: i64) -> Result<()> {
        let rule = self
            .find_rule(rule_id)
            .ok_or_else(|| SiftError::NotFound(format!("rule {rule_id}")))?;
        rule.set_cooldown(Duration::seconds(cooldown_seconds));
        if let Err(e) = self
            .rule_configs
            .update_cooldown(rule_id, cooldown_seconds)
            .await
        {
            warn!(rule_id, error = %e, "rule cooldown persistence failed");
        }
        Ok(())
    }

    /// Replace a rule's threshold config JSON
    pub async fn update_rule_config(&self, rule_id: &str, config_json: &str) -> Result<()> {
        if self.find_rule(rule_id).is_none() {
            return Err(SiftError::NotFound(format!("rule {rule_id}")));
        }
        serde_json::from_str::<Value>(config_json)
            .map_err(|e| SiftError::Validation(format!("config_json is not valid JSON: {e}")))?;
        self.rule_configs.update_config(rule_id, config_json).await
    }

    fn find_rule(&self, rule_id: &str) -> Option<Arc<AlertRule>> {
        self.rules
            .read()
            .unwrap()
            .iter()
            .find(|r| r.id == rule_id)
            .cloned()
    }

    /// Engine statistics, cached for 30 seconds
    pub async fn get_stats(&self) -> Result<Value> {
        if let Some(cached) = self.stats_cache.get() {
            return Ok(cached);
        }
        let mut snapshot = self.stats.snapshot();
        let by_level = self.counts_by_level().await?;
        snapshot["alerts_by_level"] = json!({
            "ERROR": by_level.get(&AlertLevel::Error).copied().unwrap_or(0),
            "WARNING": by_level.get(&AlertLevel::Warning).copied().unwrap_or(0),
            "INFO": by_level.get(&AlertLevel::Info).copied().unwrap_or(0),
        });
        self.stats_cache.put(snapshot.clone());
        Ok(snapshot)
    }

    /// Persisted alert counts per level
    pub async fn counts_by_level(&self) -> Result<HashMap<AlertLevel, i64>> {
        let mut counts = HashMap::new();
        for level in [AlertLevel::Error, AlertLevel::Warning, AlertLevel::Info] {
            let count = self.repository.count(Some(level.as_str()), None).await?;
            counts.insert(level, count);
        }
        Ok(counts)
    }

    /// Hourly alert counts per level over the last `hours`
    pub async fn alert_trend(&self, hours: i64) -> Result<Value> {
        let hours = hours.max(1);
        let alerts = self.repository.query_recent((hours * 100) as usize).await?;

        let now = Utc::now();
        let start = now
            .duration_trunc(Duration::hours(1))
            .unwrap_or(now)
            .checked_sub_signed(Duration::hours(hours))
            .unwrap_or(now);

        let slots = (hours + 1) as usize;
        let mut timestamps = Vec::with_capacity(slots);
        let mut errors = vec![0i64; slots];
        let mut warnings = vec![0i64; slots];
        let mut infos = vec![0i64; slots];

        for i in 0..slots {
            let t = start + Duration::hours(i as i64);
            timestamps.push(t.format("%Y-%m-%d %H:00").to_string());
        }

        for alert in alerts {
            if alert.timestamp < start || alert.timestamp > now {
                continue;
            }
            let index = ((alert.timestamp - start).num_hours() as usize).min(slots - 1);
            match alert.level {
                AlertLevel::Error => errors[index] += 1,
                AlertLevel::Warning => warnings[index] += 1,
                AlertLevel::Info => infos[index] += 1,
            }
        }

        Ok(json!({
            "timestamps": timestamps,
            "error": errors,
            "warning": warnings,
            "info": infos,
        }))
    }

    /// Number of times the stats cache was invalidated (firing path)
    pub fn stats_cache_invalidations(&self) -> i64 {
        self.stats_cache.invalidations()
    }

    /// Run the evaluation loop until shutdown
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        let interval = self
            .check_interval
            .to_std()
            .unwrap_or(std::time::Duration::from_secs(60));

        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            timer.tick().await;

            info!(
                interval_secs = interval.as_secs(),
                rules = self.rules.read().unwrap().len(),
                "alert engine started"
            );

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        self.check_all_rules().await;
                        if let Err(e) = self.stats_sync.flush().await {
                            warn!(error = %e, "alert stats flush failed");
                        }
                    }
                    _ = shutdown.changed() => {
                        if let Err(e) = self.stats_sync.flush().await {
                            warn!(error = %e, "final alert stats flush failed");
                        }
                        info!("alert engine stopped");
                        return;
                    }
                }
            }
        })
    }
}
