//! Domain types shared across ReachClaw crates.

pub mod account;
pub mod alert;
pub mod keyword;
pub mod lead;
pub mod message;

pub use account::{Account, AccountId, AccountRole, AccountStatus};
pub use alert::{Alert, Comparison, RuleCheck, Severity, TriggerRule};
pub use keyword::{Keyword, KeywordSet};
pub use lead::{ContactSignals, Lead, LeadStage, ScoreBreakdown};
pub use message::{ErrorClass, MessageState, NewMessage, Payload, Priority, QueuedMessage};

use serde::{Deserialize, Serialize};

/// Owning customer of accounts, messages, keyword sets and leads.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Visibility of a datastore read.
///
/// `Installation` sees every tenant and is only honoured when the store runs
/// in single-tenant mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    Tenant(TenantId),
    Installation,
}

impl Scope {
    pub fn tenant(id: impl Into<String>) -> Self {
        Self::Tenant(TenantId::new(id))
    }

    /// Tenant filter value, `None` for installation-wide reads.
    pub fn tenant_id(&self) -> Option<&TenantId> {
        match self {
            Scope::Tenant(t) => Some(t),
            Scope::Installation => None,
        }
    }

    /// Whether an entity owned by `owner` is visible in this scope.
    pub fn admits(&self, owner: &TenantId) -> bool {
        match self {
            Scope::Tenant(t) => t == owner,
            Scope::Installation => true,
        }
    }
}

/// Parse helper for enums persisted as lowercase text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant(pub String);

impl std::fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown variant '{}'", self.0)
    }
}

impl std::error::Error for UnknownVariant {}
