//! ReachClaw configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ReachClawError, Result};

/// Time a finished send gets to record its outcome before the claim is
/// considered lost.
pub const STALE_REPORT_MARGIN_SECS: u64 = 30;

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReachClawConfig {
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub connect: ConnectConfig,
    #[serde(default)]
    pub warmup: WarmupConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
    #[serde(default)]
    pub keywords: KeywordsConfig,
    #[serde(default)]
    pub tenancy: TenancyConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub bridge: Option<BridgeConfig>,
}

impl ReachClawConfig {
    /// Load config from the default path (~/.reachclaw/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            tracing::debug!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ReachClawError::Config(format!("Failed to read config: {e}")))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| ReachClawError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the dispatcher cannot run with.
    pub fn validate(&self) -> Result<()> {
        let d = &self.dispatch;
        if d.max_concurrent_connections == 0 {
            return Err(ReachClawError::Config(
                "dispatch.max_concurrent_connections must be at least 1".into(),
            ));
        }
        if d.max_attempts == 0 {
            return Err(ReachClawError::Config("dispatch.max_attempts must be at least 1".into()));
        }
        if d.max_backoff_secs < d.default_backoff_secs {
            return Err(ReachClawError::Config(format!(
                "dispatch.max_backoff_secs ({}) is below default_backoff_secs ({})",
                d.max_backoff_secs, d.default_backoff_secs
            )));
        }
        if d.stale_sending_secs < d.send_timeout_secs.saturating_add(STALE_REPORT_MARGIN_SECS) {
            return Err(ReachClawError::Config(format!(
                "dispatch.stale_sending_secs ({}) must exceed send_timeout_secs ({}) by at least {STALE_REPORT_MARGIN_SECS}s",
                d.stale_sending_secs, d.send_timeout_secs
            )));
        }
        if d.tick_interval_ms == 0 {
            return Err(ReachClawError::Config("dispatch.tick_interval_ms must be positive".into()));
        }
        if self.alerts.alert_history_capacity == 0 {
            return Err(ReachClawError::Config(
                "alerts.alert_history_capacity must be at least 1".into(),
            ));
        }
        if self.alerts.evaluation_interval_secs == 0 {
            return Err(ReachClawError::Config(
                "alerts.evaluation_interval_secs must be positive".into(),
            ));
        }
        if self.connect.defer_round_secs == 0 {
            return Err(ReachClawError::Config("connect.defer_round_secs must be positive".into()));
        }
        if self.warmup.enabled && (self.warmup.daily_limits.is_empty() || self.warmup.days_per_stage == 0) {
            return Err(ReachClawError::Config(
                "warmup needs at least one daily limit and days_per_stage >= 1".into(),
            ));
        }
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the ReachClaw home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".reachclaw")
    }
}

/// Dispatch queue and dispatcher loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Global cap on accounts connecting or sending at once.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_connections: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff")]
    pub default_backoff_secs: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,
    /// Claims older than this are treated as crashed sends.
    #[serde(default = "default_stale_sending")]
    pub stale_sending_secs: u64,
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_send_timeout")]
    pub send_timeout_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_max_per_minute")]
    pub max_messages_per_minute: u32,
    #[serde(default = "default_max_per_hour")]
    pub max_messages_per_hour: u32,
    /// How long a spam-restricted account rests.
    #[serde(default = "default_restricted_cooldown")]
    pub restricted_cooldown_secs: u64,
}

fn default_max_concurrent() -> usize { 8 }
fn default_max_attempts() -> u32 { 5 }
fn default_backoff() -> u64 { 30 }
fn default_max_backoff() -> u64 { 3600 }
fn default_stale_sending() -> u64 { 300 }
fn default_tick_interval() -> u64 { 1000 }
fn default_send_timeout() -> u64 { 30 }
fn default_connect_timeout() -> u64 { 30 }
fn default_max_per_minute() -> u32 { 20 }
fn default_max_per_hour() -> u32 { 200 }
fn default_restricted_cooldown() -> u64 { 86_400 }

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent_connections: default_max_concurrent(),
            max_attempts: default_max_attempts(),
            default_backoff_secs: default_backoff(),
            max_backoff_secs: default_max_backoff(),
            stale_sending_secs: default_stale_sending(),
            tick_interval_ms: default_tick_interval(),
            send_timeout_secs: default_send_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            max_messages_per_minute: default_max_per_minute(),
            max_messages_per_hour: default_max_per_hour(),
            restricted_cooldown_secs: default_restricted_cooldown(),
        }
    }
}

impl DispatchConfig {
    pub fn default_backoff(&self) -> Duration {
        Duration::from_secs(self.default_backoff_secs)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Staggered connection schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectConfig {
    /// Added to every account's derived delay.
    #[serde(default)]
    pub base_offset_secs: u64,
    #[serde(default = "default_max_jitter")]
    pub max_jitter_secs: u64,
    /// Length of one concurrency-gate round.
    #[serde(default = "default_defer_round")]
    pub defer_round_secs: u64,
}

fn default_max_jitter() -> u64 { 600 }
fn default_defer_round() -> u64 { 900 }

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            base_offset_secs: 0,
            max_jitter_secs: default_max_jitter(),
            defer_round_secs: default_defer_round(),
        }
    }
}

/// Warm-up ramp for freshly registered accounts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarmupConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    /// Daily send limit per stage; stage 1 is the first entry.
    #[serde(default = "default_daily_limits")]
    pub daily_limits: Vec<u32>,
    #[serde(default = "default_days_per_stage")]
    pub days_per_stage: u32,
}

fn bool_true() -> bool { true }
fn default_daily_limits() -> Vec<u32> { vec![5, 15, 40] }
fn default_days_per_stage() -> u32 { 3 }

impl Default for WarmupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            daily_limits: default_daily_limits(),
            days_per_stage: default_days_per_stage(),
        }
    }
}

/// Trigger & alert engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertsConfig {
    #[serde(default = "default_history_capacity")]
    pub alert_history_capacity: usize,
    #[serde(default = "default_eval_interval")]
    pub evaluation_interval_secs: u64,
    /// Cool-down for rules that do not set their own.
    #[serde(default = "default_cooldown_window")]
    pub default_cooldown_secs: u64,
    #[serde(default = "default_notify_timeout")]
    pub notify_timeout_secs: u64,
}

fn default_history_capacity() -> usize { 100 }
fn default_eval_interval() -> u64 { 10 }
fn default_cooldown_window() -> u64 { 60 }
fn default_notify_timeout() -> u64 { 10 }

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            alert_history_capacity: default_history_capacity(),
            evaluation_interval_secs: default_eval_interval(),
            default_cooldown_secs: default_cooldown_window(),
            notify_timeout_secs: default_notify_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeywordsConfig {
    /// Entries in the match memo before it is cleared.
    #[serde(default = "default_cache_capacity")]
    pub match_cache_capacity: usize,
}

fn default_cache_capacity() -> usize { 4096 }

impl Default for KeywordsConfig {
    fn default() -> Self {
        Self {
            match_cache_capacity: default_cache_capacity(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TenancyConfig {
    /// Single-installation mode: tenant isolation is switched off.
    #[serde(default)]
    pub single_tenant: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,
}

fn default_db_path() -> String { "~/.reachclaw/reachclaw.db".into() }
fn default_busy_timeout() -> u64 { 5000 }

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout(),
        }
    }
}

impl DatabaseConfig {
    /// Path with `~` expanded.
    pub fn resolved_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.path).to_string())
    }
}

/// Alert notification targets.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifyConfig {
    #[serde(default)]
    pub telegram: Option<TelegramNotifyConfig>,
    #[serde(default)]
    pub webhook: Option<WebhookNotifyConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramNotifyConfig {
    pub bot_token: String,
    pub chat_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookNotifyConfig {
    pub url: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
}

/// HTTP bridge to the chat-protocol sidecar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub base_url: String,
    #[serde(default)]
    pub api_token: String,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Bound on every sidecar request, update polls included.
    #[serde(default = "default_bridge_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_poll_interval() -> u64 { 2000 }
fn default_bridge_request_timeout() -> u64 { 10 }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ReachClawConfig::default();
        assert_eq!(config.dispatch.max_concurrent_connections, 8);
        assert_eq!(config.dispatch.max_attempts, 5);
        assert_eq!(config.alerts.alert_history_capacity, 100);
        assert!(!config.tenancy.single_tenant);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            [dispatch]
            max_concurrent_connections = 3
            max_attempts = 7
            default_backoff_secs = 10

            [alerts]
            alert_history_capacity = 20

            [tenancy]
            single_tenant = true

            [notify.webhook]
            url = "https://ops.example.com/hook"
        "#;

        let config = ReachClawConfig::from_toml(toml_str).unwrap();
        assert_eq!(config.dispatch.max_concurrent_connections, 3);
        assert_eq!(config.dispatch.max_attempts, 7);
        assert_eq!(config.dispatch.default_backoff(), Duration::from_secs(10));
        assert_eq!(config.dispatch.max_backoff_secs, 3600);
        assert_eq!(config.alerts.alert_history_capacity, 20);
        assert!(config.tenancy.single_tenant);
        assert!(config.notify.webhook.is_some());
    }

    #[test]
    fn test_config_missing_fields_use_defaults() {
        let config = ReachClawConfig::from_toml("").unwrap();
        assert_eq!(config.dispatch.tick_interval_ms, 1000);
        assert_eq!(config.warmup.daily_limits, vec![5, 15, 40]);
        assert!(config.bridge.is_none());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(ReachClawConfig::from_toml("[dispatch]\nmax_concurrent_connections = 0").is_err());
        assert!(ReachClawConfig::from_toml("[alerts]\nalert_history_capacity = 0").is_err());
        assert!(
            ReachClawConfig::from_toml("[dispatch]\ndefault_backoff_secs = 100\nmax_backoff_secs = 50")
                .is_err()
        );
    }

    #[test]
    fn test_stale_threshold_must_outlast_send_timeout() {
        let err = ReachClawConfig::from_toml("[dispatch]\nsend_timeout_secs = 600\nstale_sending_secs = 300");
        assert!(matches!(err, Err(ReachClawError::Config(msg)) if msg.contains("stale_sending_secs")));
        assert!(ReachClawConfig::from_toml("[dispatch]\nsend_timeout_secs = 60\nstale_sending_secs = 80").is_err());
        assert!(ReachClawConfig::from_toml("[dispatch]\nsend_timeout_secs = 60\nstale_sending_secs = 90").is_ok());
    }

    #[test]
    fn test_home_dir() {
        let home = ReachClawConfig::home_dir();
        assert!(home.to_string_lossy().contains("reachclaw"));
    }
}
