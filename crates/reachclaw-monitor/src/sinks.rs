//! Alert delivery — Telegram Bot API, HTTP webhook, tracing log and the
//! datastore alert log.

use async_trait::async_trait;
use reachclaw_core::config::NotifyConfig;
use reachclaw_core::error::{ReachClawError, Result};
use reachclaw_core::traits::NotifySink;
use reachclaw_core::types::{Alert, Severity};
use reachclaw_db::FleetDb;
use std::sync::Arc;
use std::time::Duration;

/// Per-request ceiling; the alert loop applies its own outer timeout too.
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

fn severity_emoji(severity: Severity) -> &'static str {
    match severity {
        Severity::Critical => "🚨",
        Severity::Warning => "⚠️",
        Severity::Info => "ℹ️",
    }
}

/// Escape Telegram MarkdownV1 special characters.
fn escape_markdown(s: &str) -> String {
    s.replace('_', "\\_")
        .replace('*', "\\*")
        .replace('[', "\\[")
        .replace('`', "\\`")
}

/// Operator chat via Telegram `sendMessage`.
pub struct TelegramSink {
    client: reqwest::Client,
    bot_token: String,
    chat_id: String,
}

impl TelegramSink {
    pub fn new(bot_token: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            bot_token: bot_token.into(),
            chat_id: chat_id.into(),
        }
    }

    fn render(alert: &Alert) -> String {
        let scope = alert
            .tenant_id
            .as_ref()
            .map(|t| format!(" • tenant {t}"))
            .unwrap_or_default();
        format!(
            "{} *{}*\n\n{}\n\n_{}{} • {}_",
            severity_emoji(alert.severity),
            escape_markdown(&alert.rule_name),
            escape_markdown(&alert.message),
            alert.severity.as_str(),
            escape_markdown(&scope),
            alert.fired_at.format("%H:%M:%S UTC")
        )
    }
}

#[async_trait]
impl NotifySink for TelegramSink {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn deliver(&self, alert: &Alert) -> Result<()> {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.bot_token);
        let resp = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "chat_id": self.chat_id,
                "text": Self::render(alert),
                "parse_mode": "Markdown"
            }))
            .timeout(HTTP_TIMEOUT)
            .send()
            .await
            .map_err(|e| ReachClawError::Notify(format!("Telegram send failed: {e}")))?;

        if resp.status().is_success() {
            tracing::debug!("✅ Telegram alert sent: {}", alert.rule_name);
            Ok(())
        } else {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            Err(ReachClawError::Notify(format!("Telegram API error {status}: {body}")))
        }
    }
}

/// JSON POST to an operator webhook.
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
    headers: Vec<(String, String)>,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>, headers: Vec<(String, String)>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            headers,
        }
    }
}

#[async_trait]
impl NotifySink for WebhookSink {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn deliver(&self, alert: &Alert) -> Result<()> {
        let mut req = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({
                "rule_id": alert.rule_id,
                "rule_name": alert.rule_name,
                "message": alert.message,
                "severity": alert.severity,
                "tenant_id": alert.tenant_id,
                "fired_at": alert.fired_at.to_rfc3339(),
            }))
            .timeout(HTTP_TIMEOUT);
        for (key, value) in &self.headers {
            req = req.header(key.as_str(), value.as_str());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| ReachClawError::Notify(format!("Webhook send failed: {e}")))?;
        if resp.status().is_success() {
            tracing::debug!("✅ Webhook alert sent to {}: {}", self.url, alert.rule_name);
            Ok(())
        } else {
            Err(ReachClawError::Notify(format!("Webhook error {}", resp.status())))
        }
    }
}

/// Writes alerts to the process log only.
pub struct LogSink;

#[async_trait]
impl NotifySink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, alert: &Alert) -> Result<()> {
        match alert.severity {
            Severity::Critical | Severity::Warning => {
                tracing::warn!(rule = %alert.rule_id, "{} {}", severity_emoji(alert.severity), alert.message)
            }
            Severity::Info => tracing::info!(rule = %alert.rule_id, "{} {}", severity_emoji(alert.severity), alert.message),
        }
        Ok(())
    }
}

/// Appends alerts to the datastore history table.
pub struct DbAlertLog {
    db: Arc<FleetDb>,
}

impl DbAlertLog {
    pub fn new(db: Arc<FleetDb>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl NotifySink for DbAlertLog {
    fn name(&self) -> &str {
        "db"
    }

    async fn deliver(&self, alert: &Alert) -> Result<()> {
        self.db.append_alert(alert)
    }
}

/// Sinks configured under `[notify]`, plus the log and datastore sinks which
/// are always present.
pub fn sinks_from_config(config: &NotifyConfig, db: Arc<FleetDb>) -> Vec<Arc<dyn NotifySink>> {
    let mut sinks: Vec<Arc<dyn NotifySink>> = vec![Arc::new(DbAlertLog::new(db)), Arc::new(LogSink)];

    if let Some(tg) = &config.telegram {
        if !tg.bot_token.is_empty() && !tg.chat_id.is_empty() {
            sinks.push(Arc::new(TelegramSink::new(&tg.bot_token, &tg.chat_id)));
        }
    }
    if let Some(wh) = &config.webhook {
        if !wh.url.is_empty() {
            sinks.push(Arc::new(WebhookSink::new(&wh.url, wh.headers.clone())));
        }
    }

    sinks
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use reachclaw_core::config::{TelegramNotifyConfig, WebhookNotifyConfig};
    use reachclaw_core::types::{Scope, TenantId};

    fn alert() -> Alert {
        Alert {
            rule_id: "r1".into(),
            rule_name: "flood_wait_spike".into(),
            fired_at: Utc::now(),
            message: "5 accounts *rate limited*".into(),
            severity: Severity::Critical,
            tenant_id: Some(TenantId::new("t1")),
        }
    }

    #[test]
    fn test_telegram_render_escapes() {
        let text = TelegramSink::render(&alert());
        assert!(text.starts_with("🚨 *flood\\_wait\\_spike*"));
        assert!(text.contains("\\*rate limited\\*"));
        assert!(text.contains("tenant t1"));
    }

    #[test]
    fn test_sinks_from_config() {
        let db = Arc::new(FleetDb::open_in_memory(false).unwrap());
        let empty = sinks_from_config(&NotifyConfig::default(), db.clone());
        assert_eq!(empty.iter().map(|s| s.name()).collect::<Vec<_>>(), vec!["db", "log"]);

        let config = NotifyConfig {
            telegram: Some(TelegramNotifyConfig {
                bot_token: "123:abc".into(),
                chat_id: "".into(),
            }),
            webhook: Some(WebhookNotifyConfig {
                url: "https://ops.example.com/hook".into(),
                headers: vec![],
            }),
        };
        let names: Vec<String> = sinks_from_config(&config, db)
            .iter()
            .map(|s| s.name().to_string())
            .collect();
        assert_eq!(names, vec!["db", "log", "webhook"]);
    }

    #[tokio::test]
    async fn test_db_alert_log_persists() {
        let db = Arc::new(FleetDb::open_in_memory(false).unwrap());
        let sink = DbAlertLog::new(db.clone());
        sink.deliver(&alert()).await.unwrap();
        LogSink.deliver(&alert()).await.unwrap();
        let stored = db.recent_alerts(&Scope::tenant("t1"), 10).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].rule_name, "flood_wait_spike");
    }
}
