//! Default alert rules
//!
//! Thresholds come from the DB-backed rule configs when present, falling
//! back to the values the engine booted with. The smart cache detector
//! keeps its rate history inside the closure.

use std::sync::Mutex;

use chrono::{Duration, Utc};
use serde_json::{json, Map};
use uuid::Uuid;

use crate::alerts::{Alert, AlertLevel, AlertRule, RuleContext};
use crate::config::AlertsConfig;

/// Minimum promotion attempts before the success-rate rule may fire
const SUCCESS_RATE_MIN_ATTEMPTS: i64 = 10;

/// Absolute hit-rate drop versus the trailing mean that counts as a plunge
const TREND_DROP_POINTS: f64 = 20.0;

/// Unique id for a fired alert
pub fn alert_id(rule: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{rule}_{}", &suffix[..8])
}

fn metadata(pairs: &[(&str, serde_json::Value)]) -> Map<String, serde_json::Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

/// The four built-in rules
pub fn default_rules(config: &AlertsConfig) -> Vec<AlertRule> {
    vec![
        queue_backlog(config),
        low_success_rate(config),
        cache_anomaly(config),
        decay_spike(config),
    ]
}

/// WARNING when the pending staging queue exceeds the threshold
fn queue_backlog(config: &AlertsConfig) -> AlertRule {
    let default_threshold = config.queue_backlog_threshold;
    AlertRule::new(
        "queue_backlog",
        "Staging queue backlog",
        "Pending staging entries exceed the threshold",
        Duration::minutes(config.queue_backlog_cooldown_minutes),
        Box::new(move |ctx: &RuleContext| {
            let threshold = ctx
                .config_number("queue_backlog", "threshold")
                .map(|t| t as usize)
                .unwrap_or(default_threshold);

            let queue_length = ctx.queue_length?;
            if queue_length <= threshold {
                return None;
            }

            Some(Alert {
                id: alert_id("queue_backlog"),
                level: AlertLevel::Warning,
                rule: "queue_backlog".to_string(),
                message: "Staging queue is backing up; check the promotion pass".to_string(),
                timestamp: Utc::now(),
                metadata: metadata(&[
                    ("queue_length", json!(queue_length)),
                    ("threshold", json!(threshold)),
                ]),
            })
        }),
    )
}

/// WARNING when promotion success drops below the threshold
fn low_success_rate(config: &AlertsConfig) -> AlertRule {
    let default_threshold = config.success_rate_threshold;
    AlertRule::new(
        "low_success_rate",
        "Low promotion success rate",
        "Promotion success rate fell below the threshold",
        Duration::minutes(config.success_rate_cooldown_minutes),
        Box::new(move |ctx: &RuleContext| {
            let threshold = ctx
                .config_number("low_success_rate", "threshold")
                .unwrap_or(default_threshold);

            let attempts = ctx.metrics.total_promotions + ctx.metrics.total_rejections;
            if attempts < SUCCESS_RATE_MIN_ATTEMPTS {
                return None;
            }

            let success_rate = ctx.metrics.success_rate();
            if success_rate >= threshold {
                return None;
            }

            Some(Alert {
                id: alert_id("low_success_rate"),
                level: AlertLevel::Warning,
                rule: "low_success_rate".to_string(),
                message: "Promotion success rate is low; the judge may be too strict".to_string(),
                timestamp: Utc::now(),
                metadata: metadata(&[
                    ("success_rate", json!(success_rate)),
                    ("threshold", json!(threshold)),
                    ("attempts", json!(attempts)),
                ]),
            })
        }),
    )
}

/// Smart cache detector: banded thresholds plus trend-drop detection.
///
/// Needs `min_samples` accesses before it fires at all; fires ERROR below
/// the error band, WARNING below the warn band, and WARNING on a drop of
/// 20+ points against the mean of the previous samples.
fn cache_anomaly(config: &AlertsConfig) -> AlertRule {
    let default_min_samples = config.cache_min_samples;
    let default_warn = config.cache_warn_threshold;
    let default_error = config.cache_error_threshold;
    let default_trend_periods = config.cache_trend_periods;

    let history: Mutex<Vec<f64>> = Mutex::new(Vec::new());

    AlertRule::new(
        "cache_anomaly",
        "Judge cache anomaly",
        "Cache hit rate is abnormally low or dropped sharply",
        Duration::minutes(config.cache_cooldown_minutes),
        Box::new(move |ctx: &RuleContext| {
            let min_samples = ctx
                .config_number("cache_anomaly", "min_samples")
                .map(|v| v as i64)
                .unwrap_or(default_min_samples);
            let warn_threshold = ctx
                .config_number("cache_anomaly", "warn_threshold")
                .unwrap_or(default_warn);
            let error_threshold = ctx
                .config_number("cache_anomaly", "error_threshold")
                .unwrap_or(default_error);
            let trend_periods = ctx
                .config_number("cache_anomaly", "trend_periods")
                .map(|v| v as usize)
                .unwrap_or(default_trend_periods);

            let total_access = ctx.metrics.cache_hits + ctx.metrics.cache_misses;
            if total_access < min_samples {
                return None;
            }

            let current_rate = ctx.metrics.cache_hit_rate();

            let mut level = None;
            if current_rate < error_threshold {
                level = Some(AlertLevel::Error);
            } else if current_rate < warn_threshold {
                level = Some(AlertLevel::Warning);
            }

            // Trend detection over the last `trend_periods` samples
            let mut trend_drop = false;
            {
                let mut rates = history.lock().unwrap();
                rates.push(current_rate);
                if rates.len() > trend_periods {
                    rates.remove(0);
                }
                if rates.len() >= trend_periods && trend_periods > 1 {
                    let prior = &rates[..rates.len() - 1];
                    let mean: f64 = prior.iter().sum::<f64>() / prior.len() as f64;
                    if mean - current_rate > TREND_DROP_POINTS {
                        trend_drop = true;
                        level.get_or_insert(AlertLevel::Warning);
                    }
                }
            }

            let level = level?;
            let message = if trend_drop {
                "Cache hit rate dropped sharply; the judge pipeline may be misbehaving"
            } else {
                "Cache hit rate is abnormally low"
            };

            Some(Alert {
                id: alert_id("cache_anomaly"),
                level,
                rule: "cache_anomaly".to_string(),
                message: message.to_string(),
                timestamp: Utc::now(),
                metadata: metadata(&[
                    ("hit_rate", json!(current_rate)),
                    ("warn_threshold", json!(warn_threshold)),
                    ("error_threshold", json!(error_threshold)),
                    ("total_access", json!(total_access)),
                    ("trend_detected", json!(trend_drop)),
                ]),
            })
        }),
    )
}

/// INFO when the forgotten-records counter climbs past the threshold
fn decay_spike(config: &AlertsConfig) -> AlertRule {
    let default_threshold = config.decay_spike_threshold;
    AlertRule::new(
        "decay_spike",
        "Decay spike",
        "Forgotten record count is unusually high",
        Duration::minutes(config.decay_spike_cooldown_minutes),
        Box::new(move |ctx: &RuleContext| {
            let threshold = ctx
                .config_number("decay_spike", "threshold")
                .map(|v| v as i64)
                .unwrap_or(default_threshold);

            if ctx.metrics.total_forgotten <= threshold {
                return None;
            }

            Some(Alert {
                id: alert_id("decay_spike"),
                level: AlertLevel::Info,
                rule: "decay_spike".to_string(),
                message: "Many records were forgotten; likely normal decay".to_string(),
                timestamp: Utc::now(),
                metadata: metadata(&[
                    ("forgotten", json!(ctx.metrics.total_forgotten)),
                    ("threshold", json!(threshold)),
                ]),
            })
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::metrics::MetricsSnapshot;

    fn ctx(queue: Option<usize>, metrics: MetricsSnapshot) -> RuleContext {
        RuleContext {
            queue_length: queue,
            metrics,
            configs: HashMap::new(),
        }
    }

    fn run(rule: &AlertRule, ctx: &RuleContext) -> Option<Alert> {
        (rule.check)(ctx)
    }

    fn test_config() -> AlertsConfig {
        AlertsConfig {
            queue_backlog_threshold: 5,
            success_rate_threshold: 60.0,
            cache_min_samples: 10,
            cache_warn_threshold: 40.0,
            cache_error_threshold: 20.0,
            cache_trend_periods: 3,
            decay_spike_threshold: 100,
            ..AlertsConfig::default()
        }
    }

    #[test]
    fn test_queue_backlog_fires_above_threshold() {
        let rule = queue_backlog(&test_config());
        assert!(run(&rule, &ctx(Some(5), MetricsSnapshot::default())).is_none());

        let alert = run(&rule, &ctx(Some(6), MetricsSnapshot::default())).unwrap();
        assert_eq!(alert.level, AlertLevel::Warning);
        assert_eq!(alert.rule, "queue_backlog");
        assert_eq!(alert.metadata["queue_length"], json!(6));
    }

    #[test]
    fn test_queue_backlog_silent_when_staging_down() {
        let rule = queue_backlog(&test_config());
        assert!(run(&rule, &ctx(None, MetricsSnapshot::default())).is_none());
    }

    #[test]
    fn test_queue_backlog_reads_db_threshold() {
        let rule = queue_backlog(&test_config());
        let mut context = ctx(Some(3), MetricsSnapshot::default());
        context.configs.insert(
            "queue_backlog".to_string(),
            crate::alerts::RuleConfigRow {
                id: "queue_backlog".into(),
                name: "q".into(),
                description: String::new(),
                enabled: true,
                cooldown_seconds: 600,
                config_json: r#"{"threshold": 1}"#.into(),
                updated_at: Utc::now(),
            },
        );
        assert!(run(&rule, &context).is_some());
    }

    #[test]
    fn test_low_success_rate_needs_samples() {
        let rule = low_success_rate(&test_config());
        // 4 promotions + 5 rejections = 9 attempts: too few
        let snap = MetricsSnapshot {
            total_promotions: 4,
            total_rejections: 5,
            ..Default::default()
        };
        assert!(run(&rule, &ctx(None, snap)).is_none());

        let snap = MetricsSnapshot {
            total_promotions: 4,
            total_rejections: 6,
            ..Default::default()
        };
        let alert = run(&rule, &ctx(None, snap)).unwrap();
        assert_eq!(alert.level, AlertLevel::Warning);
    }

    #[test]
    fn test_cache_anomaly_needs_min_samples() {
        let rule = cache_anomaly(&test_config());
        let snap = MetricsSnapshot {
            cache_hits: 1,
            cache_misses: 5,
            ..Default::default()
        };
        assert!(run(&rule, &ctx(None, snap)).is_none());
    }

    #[test]
    fn test_cache_anomaly_bands() {
        let config = test_config();

        // 30% sits between error (20) and warn (40): WARNING
        let rule = cache_anomaly(&config);
        let snap = MetricsSnapshot {
            cache_hits: 3,
            cache_misses: 7,
            ..Default::default()
        };
        assert_eq!(run(&rule, &ctx(None, snap)).unwrap().level, AlertLevel::Warning);

        // 10% is below the error band: ERROR
        let rule = cache_anomaly(&config);
        let snap = MetricsSnapshot {
            cache_hits: 1,
            cache_misses: 9,
            ..Default::default()
        };
        assert_eq!(run(&rule, &ctx(None, snap)).unwrap().level, AlertLevel::Error);

        // 90% is healthy
        let rule = cache_anomaly(&config);
        let snap = MetricsSnapshot {
            cache_hits: 9,
            cache_misses: 1,
            ..Default::default()
        };
        assert!(run(&rule, &ctx(None, snap)).is_none());
    }

    #[test]
    fn test_cache_anomaly_trend_drop() {
        let rule = cache_anomaly(&test_config());

        // Two healthy samples at 90%
        for _ in 0..2 {
            let snap = MetricsSnapshot {
                cache_hits: 90,
                cache_misses: 10,
                ..Default::default()
            };
            assert!(run(&rule, &ctx(None, snap)).is_none());
        }

        // Still above the warn band at 65%, but 25 points below the mean
        let snap = MetricsSnapshot {
            cache_hits: 65,
            cache_misses: 35,
            ..Default::default()
        };
        let alert = run(&rule, &ctx(None, snap)).unwrap();
        assert_eq!(alert.level, AlertLevel::Warning);
        assert_eq!(alert.metadata["trend_detected"], json!(true));
    }

    #[test]
    fn test_decay_spike_is_info() {
        let rule = decay_spike(&test_config());
        let snap = MetricsSnapshot {
            total_forgotten: 101,
            ..Default::default()
        };
        let alert = run(&rule, &ctx(None, snap)).unwrap();
        assert_eq!(alert.level, AlertLevel::Info);
    }

    #[test]
    fn test_alert_id_shape() {
        let id = alert_id("queue_backlog");
        assert!(id.starts_with("queue_backlog_"));
        assert_eq!(id.len(), "queue_backlog_".len() + 8);
    }
}
