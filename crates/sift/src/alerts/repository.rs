//! Alert persistence: events and rule configurations

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

use crate::alerts::{Alert, AlertLevel};
use crate::error::{Result, SiftError};

/// Alert event repository port
#[async_trait]
pub trait AlertRepository: Send + Sync {
    /// Persist one alert; a duplicate id is a conflict
    async fn save(&self, alert: &Alert) -> Result<()>;

    /// Newest alerts first
    async fn query_recent(&self, limit: usize) -> Result<Vec<Alert>>;

    /// Filtered page plus the total match count
    async fn query_filtered(
        &self,
        level: Option<&str>,
        rule: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<Alert>, i64)>;

    async fn delete(&self, id: &str) -> Result<()>;

    async fn count(&self, level: Option<&str>, rule: Option<&str>) -> Result<i64>;

    /// 1 when the id exists, 0 otherwise
    async fn count_by_id(&self, id: &str) -> Result<i64>;
}

/// One row of `alert_rule_configs`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfigRow {
    pub id: String,
    pub name: String,
    pub description: String,
    pub enabled: bool,
    pub cooldown_seconds: i64,
    pub config_json: String,
    pub updated_at: DateTime<Utc>,
}

/// Rule configuration persistence port
#[async_trait]
pub trait RuleConfigStore: Send + Sync {
    /// Insert the row unless it already exists
    async fn seed(&self, row: &RuleConfigRow) -> Result<()>;

    async fn load_all(&self) -> Result<HashMap<String, RuleConfigRow>>;

    async fn update_enabled(&self, rule_id: &str, enabled: bool) -> Result<()>;

    async fn update_cooldown(&self, rule_id: &str, cooldown_seconds: i64) -> Result<()>;

    async fn update_config(&self, rule_id: &str, config_json: &str) -> Result<()>;
}

/// SQLite alert repository
pub struct SqliteAlertRepository {
    pool: SqlitePool,
}

impl SqliteAlertRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_alert(row: sqlx::sqlite::SqliteRow) -> Alert {
        let level: String = row.get("level");
        let metadata: Option<String> = row.get("metadata");
        Alert {
            id: row.get("id"),
            level: AlertLevel::parse(&level).unwrap_or(AlertLevel::Info),
            rule: row.get("rule"),
            message: row.get("message"),
            timestamp: row.get::<DateTime<Utc>, _>("timestamp"),
            metadata: metadata
                .and_then(|m| serde_json::from_str(&m).ok())
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl AlertRepository for SqliteAlertRepository {
    async fn save(&self, alert: &Alert) -> Result<()> {
        let metadata = serde_json::to_string(&alert.metadata)?;
        let result = sqlx::query(
            "INSERT INTO alerts (id, level, rule, message, timestamp, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(&alert.id)
        .bind(alert.level.as_str())
        .bind(&alert.rule)
        .bind(&alert.message)
        .bind(alert.timestamp)
        .bind(metadata)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("UNIQUE") => {
                Err(SiftError::Conflict(format!("alert {}", alert.id)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn query_recent(&self, limit: usize) -> Result<Vec<Alert>> {
        let rows = sqlx::query(
            "SELECT id, level, rule, message, timestamp, metadata FROM alerts
             ORDER BY timestamp DESC LIMIT ?1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Self::row_to_alert).collect())
    }

    async fn query_filtered(
        &self,
        level: Option<&str>,
        rule: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<Alert>, i64)> {
        let level = level.unwrap_or("");
        let rule = rule.unwrap_or("");

        let rows = sqlx::query(
            "SELECT id, level, rule, message, timestamp, metadata FROM alerts
             WHERE (?1 = '' OR level = ?1) AND (?2 = '' OR rule = ?2)
             ORDER BY timestamp DESC LIMIT ?3 OFFSET ?4",
        )
        .bind(level)
        .bind(rule)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;

        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM alerts
             WHERE (?1 = '' OR level = ?1) AND (?2 = '' OR rule = ?2)",
        )
        .bind(level)
        .bind(rule)
        .fetch_one(&self.pool)
        .await?;

        Ok((rows.into_iter().map(Self::row_to_alert).collect(), total))
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM alerts WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(SiftError::NotFound(format!("alert {id}")));
        }
        Ok(())
    }

    async fn count(&self, level: Option<&str>, rule: Option<&str>) -> Result<i64> {
        let level = level.unwrap_or("");
        let rule = rule.unwrap_or("");
        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM alerts
             WHERE (?1 = '' OR level = ?1) AND (?2 = '' OR rule = ?2)",
        )
        .bind(level)
        .bind(rule)
        .fetch_one(&self.pool)
        .await?;
        Ok(total)
    }

    async fn count_by_id(&self, id: &str) -> Result<i64> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM alerts WHERE id = ?1")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        Ok(total)
    }
}

/// SQLite rule config store
pub struct SqliteRuleConfigStore {
    pool: SqlitePool,
}

impl SqliteRuleConfigStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RuleConfigStore for SqliteRuleConfigStore {
    async fn seed(&self, row: &RuleConfigRow) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO alert_rule_configs
                (id, name, description, enabled, cooldown_seconds, config_json, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(&row.id)
        .bind(&row.name)
        .bind(&row.description)
        .bind(row.enabled)
        .bind(row.cooldown_seconds)
        .bind(&row.config_json)
        .bind(row.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_all(&self) -> Result<HashMap<String, RuleConfigRow>> {
        let rows = sqlx::query(
            "SELECT id, name, description, enabled, cooldown_seconds, config_json, updated_at
             FROM alert_rule_configs",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let config = RuleConfigRow {
                    id: row.get("id"),
                    name: row.get("name"),
                    description: row.get("description"),
                    enabled: row.get("enabled"),
                    cooldown_seconds: row.get("cooldown_seconds"),
                    config_json: row.get("config_json"),
                    updated_at: row.get::<DateTime<Utc>, _>("updated_at"),
                };
                (config.id.clone(), config)
            })
            .collect())
    }

    async fn update_enabled(&self, rule_id: &str, enabled: bool) -> Result<()> {
        sqlx::query("UPDATE alert_rule_configs SET enabled = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(enabled)
            .bind(Utc::now())
            .bind(rule_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_cooldown(&self, rule_id: &str, cooldown_seconds: i64) -> Result<()> {
        sqlx::query(
            "UPDATE alert_rule_configs SET cooldown_seconds = ?1, updated_at = ?2 WHERE id = ?3",
        )
        .bind(cooldown_seconds)
        .bind(Utc::now())
        .bind(rule_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_config(&self, rule_id: &str, config_json: &str) -> Result<()> {
        sqlx::query(
            "UPDATE alert_rule_configs SET config_json = ?1, updated_at = ?2 WHERE id = ?3",
        )
        .bind(config_json)
        .bind(Utc::now())
        .bind(rule_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
