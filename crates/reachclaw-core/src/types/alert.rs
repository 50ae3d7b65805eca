//! Trigger rules and the alerts they fire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::{TenantId, UnknownVariant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

impl FromStr for Severity {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Severity::Info),
            "warning" => Ok(Severity::Warning),
            "critical" => Ok(Severity::Critical),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Comparison operator for threshold checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparison {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
}

impl Comparison {
    pub fn holds(&self, actual: f64, threshold: f64) -> bool {
        match self {
            Comparison::Gt => actual > threshold,
            Comparison::Ge => actual >= threshold,
            Comparison::Lt => actual < threshold,
            Comparison::Le => actual <= threshold,
            Comparison::Eq => (actual - threshold).abs() < f64::EPSILON,
            Comparison::Ne => (actual - threshold).abs() >= f64::EPSILON,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Comparison::Gt => ">",
            Comparison::Ge => ">=",
            Comparison::Lt => "<",
            Comparison::Le => "<=",
            Comparison::Eq => "==",
            Comparison::Ne => "!=",
        }
    }
}

/// The predicate a rule evaluates each cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleCheck {
    /// A named metric compared against a constant.
    Threshold {
        metric: String,
        operator: Comparison,
        value: f64,
    },
    /// Keyword hits observed since the previous cycle. `set: None` counts
    /// hits from every set.
    KeywordHit {
        #[serde(default)]
        set: Option<String>,
        #[serde(default = "default_min_hits")]
        min_hits: u32,
    },
    /// A predicate registered by name with the alert engine.
    Custom { name: String },
}

fn default_min_hits() -> u32 {
    1
}

/// A declarative alerting rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerRule {
    pub id: String,
    pub name: String,
    /// Limits keyword-hit checks to one tenant; `None` is installation-wide.
    #[serde(default)]
    pub tenant_id: Option<TenantId>,
    pub check: RuleCheck,
    pub severity: Severity,
    /// Minimum seconds between two firings; the engine default when unset.
    #[serde(default)]
    pub cooldown_secs: Option<u64>,
    /// Alert text. `{{rule}}`, `{{metric}}` and `{{value}}` are substituted.
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

fn default_enabled() -> bool {
    true
}

impl TriggerRule {
    pub fn new(id: impl Into<String>, name: impl Into<String>, check: RuleCheck, severity: Severity, cooldown_secs: u64) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            tenant_id: None,
            check,
            severity,
            cooldown_secs: Some(cooldown_secs),
            message: None,
            enabled: true,
            created_at: Utc::now(),
        }
    }
}

/// One firing of a rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub rule_id: String,
    pub rule_name: String,
    pub fired_at: DateTime<Utc>,
    pub message: String,
    pub severity: Severity,
    #[serde(default)]
    pub tenant_id: Option<TenantId>,
}
