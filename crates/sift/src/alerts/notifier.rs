//! Alert delivery: webhook and SMTP
//!
//! Both channels run off the engine's firing path with explicit timeouts.
//! Delivery is restricted to the configured level subset.

use std::collections::HashSet;
use std::time::Duration;

use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use reqwest::Client;
use serde_json::json;
use tracing::{info, warn};

use crate::alerts::{Alert, AlertLevel};
use crate::config::NotifyConfig;
use crate::error::{Result, SiftError};

/// Webhook + SMTP notifier
pub struct AlertNotifier {
    config: NotifyConfig,
    levels: HashSet<AlertLevel>,
    http: Client,
}

impl AlertNotifier {
    pub fn new(config: NotifyConfig) -> Result<Self> {
        let levels = config
            .levels
            .iter()
            .filter_map(|s| AlertLevel::parse(s))
            .collect();

        let http = Client::builder()
            .timeout(Duration::from_secs(config.webhook_timeout_secs))
            .build()
            .map_err(|e| SiftError::Config(format!("webhook client: {e}")))?;

        Ok(Self {
            config,
            levels,
            http,
        })
    }

    /// Deliver one alert over every enabled channel.
    ///
    /// Returns the first channel error; the engine counts it as a failed
    /// notification and moves on.
    pub async fn notify(&self, alert: &Alert) -> Result<()> {
        if !self.levels.contains(&alert.level) {
            return Ok(());
        }

        let mut first_error = None;

        if self.config.webhook_enabled && !self.config.webhook_url.is_empty() {
            if let Err(e) = self.send_webhook(alert).await {
                warn!(error = %e, "webhook delivery failed");
                first_error.get_or_insert(e);
            }
        }

        if self.config.email_enabled && !self.config.email_to.is_empty() {
            if let Err(e) = self.send_email(alert).await {
                warn!(error = %e, "email delivery failed");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// JSON POST with a markdown body
    async fn send_webhook(&self, alert: &Alert) -> Result<()> {
        let payload = json!({
            "msgtype": "markdown",
            "markdown": {"content": format_markdown(alert)},
        });

        let response = self
            .http
            .post(&self.config.webhook_url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| SiftError::Store(format!("webhook: {e}")))?;

        if !response.status().is_success() {
            return Err(SiftError::Store(format!(
                "webhook returned {}",
                response.status()
            )));
        }

        info!(rule = %alert.rule, level = %alert.level, "webhook notification sent");
        Ok(())
    }

    /// Plain-text email over SMTP, TLS or cleartext per config
    async fn send_email(&self, alert: &Alert) -> Result<()> {
        let from = self
            .config
            .email_from
            .parse()
            .map_err(|e| SiftError::Config(format!("email_from: {e}")))?;

        let mut builder = Message::builder()
            .from(from)
            .subject(format!("[{} alert] {}", alert.level, alert.rule))
            .header(ContentType::TEXT_PLAIN);
        for to in &self.config.email_to {
            builder = builder.to(to
                .parse()
                .map_err(|e| SiftError::Config(format!("email_to: {e}")))?);
        }
        let message = builder
            .body(format_email_body(alert))
            .map_err(|e| SiftError::Store(format!("email build: {e}")))?;

        let mut transport = if self.config.smtp_use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&self.config.smtp_host)
                .map_err(|e| SiftError::Store(format!("smtp: {e}")))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&self.config.smtp_host)
        }
        .port(self.config.smtp_port)
        .timeout(Some(Duration::from_secs(10)));

        if !self.config.smtp_username.is_empty() {
            transport = transport.credentials(Credentials::new(
                self.config.smtp_username.clone(),
                self.config.smtp_password.clone(),
            ));
        }

        transport
            .build()
            .send(message)
            .await
            .map_err(|e| SiftError::Store(format!("smtp send: {e}")))?;

        info!(rule = %alert.rule, "email notification sent");
        Ok(())
    }
}

fn level_emoji(level: AlertLevel) -> &'static str {
    match level {
        AlertLevel::Error => "🔴",
        AlertLevel::Warning => "🟡",
        AlertLevel::Info => "🔵",
    }
}

fn format_markdown(alert: &Alert) -> String {
    let mut details = String::new();
    if !alert.metadata.is_empty() {
        details.push_str("\n\n**Details**:\n");
        for (key, value) in &alert.metadata {
            details.push_str(&format!("- {key}: {value}\n"));
        }
    }

    format!(
        "## {} sift alert\n\n**Level**: {}\n**Rule**: {}\n**Message**: {}\n**Time**: {}{}",
        level_emoji(alert.level),
        alert.level,
        alert.rule,
        alert.message,
        alert.timestamp.format("%Y-%m-%d %H:%M:%S"),
        details,
    )
}

fn format_email_body(alert: &Alert) -> String {
    let mut details = String::new();
    if !alert.metadata.is_empty() {
        details.push_str("\nDetails:\n");
        for (key, value) in &alert.metadata {
            details.push_str(&format!("  {key}: {value}\n"));
        }
    }

    format!(
        "sift monitoring alert\n\n\
         Level: {}\nRule: {}\nMessage: {}\nTime: {}\n{}\n---\n\
         This message was sent automatically by the sift monitor.\n",
        alert.level,
        alert.rule,
        alert.message,
        alert.timestamp.format("%Y-%m-%d %H:%M:%S"),
        details,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::Map;
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn alert(level: AlertLevel) -> Alert {
        let mut metadata = Map::new();
        metadata.insert("queue_length".into(), json!(12));
        Alert {
            id: "queue_backlog_abcd1234".into(),
            level,
            rule: "queue_backlog".into(),
            message: "queue is backing up".into(),
            timestamp: Utc::now(),
            metadata,
        }
    }

    fn webhook_config(url: &str) -> NotifyConfig {
        NotifyConfig {
            webhook_enabled: true,
            webhook_url: url.to_string(),
            levels: vec!["ERROR".into(), "WARNING".into()],
            ..NotifyConfig::default()
        }
    }

    #[tokio::test]
    async fn test_webhook_posts_markdown() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"msgtype": "markdown"})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = AlertNotifier::new(webhook_config(&server.uri())).unwrap();
        notifier.notify(&alert(AlertLevel::Warning)).await.unwrap();
    }

    #[tokio::test]
    async fn test_levels_filter_suppresses_info() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let notifier = AlertNotifier::new(webhook_config(&server.uri())).unwrap();
        notifier.notify(&alert(AlertLevel::Info)).await.unwrap();
    }

    #[tokio::test]
    async fn test_webhook_failure_surfaces() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let notifier = AlertNotifier::new(webhook_config(&server.uri())).unwrap();
        let err = notifier.notify(&alert(AlertLevel::Error)).await.unwrap_err();
        assert!(err.to_string().contains("webhook"));
    }

    #[test]
    fn test_markdown_format_includes_metadata() {
        let text = format_markdown(&alert(AlertLevel::Warning));
        assert!(text.contains("**Rule**: queue_backlog"));
        assert!(text.contains("queue_length: 12"));
        assert!(text.contains("🟡"));
    }
}
