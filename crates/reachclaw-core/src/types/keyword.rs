//! Tenant keyword sets fed into the keyword index.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::TenantId;

/// One literal or regex entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keyword {
    pub id: i64,
    pub pattern: String,
    #[serde(default)]
    pub is_regex: bool,
}

impl Keyword {
    pub fn literal(pattern: impl Into<String>) -> Self {
        Self {
            id: 0,
            pattern: pattern.into(),
            is_regex: false,
        }
    }

    pub fn regex(pattern: impl Into<String>) -> Self {
        Self {
            id: 0,
            pattern: pattern.into(),
            is_regex: true,
        }
    }
}

/// A named, tenant-scoped collection of keywords.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeywordSet {
    pub id: i64,
    pub tenant_id: TenantId,
    pub name: String,
    pub keywords: Vec<Keyword>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Reply sent to a contact whose lead turns hot on a hit from this set.
    #[serde(default)]
    pub reply_template: Option<String>,
    pub created_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

impl KeywordSet {
    pub fn new(tenant_id: TenantId, name: impl Into<String>, keywords: Vec<Keyword>) -> Self {
        Self {
            id: 0,
            tenant_id,
            name: name.into(),
            keywords,
            enabled: true,
            reply_template: None,
            created_at: Utc::now(),
        }
    }
}
