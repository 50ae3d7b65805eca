//! Chat-platform accounts operated on behalf of a tenant.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::{TenantId, UnknownVariant};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(pub String);

impl AccountId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AccountId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle status of an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    /// No session credential yet.
    Unregistered,
    WarmingUp,
    Active,
    /// Provider asked us to back off; see `Account::rate_limited_until`.
    RateLimited,
    Disabled,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Unregistered => "unregistered",
            AccountStatus::WarmingUp => "warming_up",
            AccountStatus::Active => "active",
            AccountStatus::RateLimited => "rate_limited",
            AccountStatus::Disabled => "disabled",
        }
    }
}

impl std::fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccountStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unregistered" => Ok(AccountStatus::Unregistered),
            "warming_up" => Ok(AccountStatus::WarmingUp),
            "active" => Ok(AccountStatus::Active),
            "rate_limited" => Ok(AccountStatus::RateLimited),
            "disabled" => Ok(AccountStatus::Disabled),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// What an account is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountRole {
    /// Monitors groups and chats, never sends outreach.
    Listener,
    Sender,
}

impl AccountRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountRole::Listener => "listener",
            AccountRole::Sender => "sender",
        }
    }
}

impl FromStr for AccountRole {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "listener" => Ok(AccountRole::Listener),
            "sender" => Ok(AccountRole::Sender),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// A third-party chat account owned by one tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub tenant_id: TenantId,
    /// Phone number or handle.
    pub handle: String,
    /// Opaque session string handed to the platform on connect.
    #[serde(skip_serializing)]
    pub session_credential: Option<String>,
    /// Egress proxy URL.
    pub proxy: Option<String>,
    pub role: AccountRole,
    pub status: AccountStatus,
    /// Human-readable reason for `Disabled` / `RateLimited`.
    pub status_reason: Option<String>,
    pub warmup_day: u32,
    /// Current warm-up stage, 0 once graduated.
    pub warmup_stage: u8,
    pub warmup_advanced_on: Option<NaiveDate>,
    pub last_connect_at: Option<DateTime<Utc>>,
    pub rate_limited_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Account {
    /// Onboard an account. With a credential it enters warm-up, without one
    /// it stays unregistered until a session is attached.
    pub fn new(
        tenant_id: TenantId,
        id: impl Into<String>,
        handle: impl Into<String>,
        role: AccountRole,
        session_credential: Option<String>,
    ) -> Self {
        let status = if session_credential.is_some() {
            AccountStatus::WarmingUp
        } else {
            AccountStatus::Unregistered
        };
        Self {
            id: AccountId::new(id),
            tenant_id,
            handle: handle.into(),
            session_credential,
            proxy: None,
            role,
            status,
            status_reason: None,
            warmup_day: 0,
            warmup_stage: 1,
            warmup_advanced_on: None,
            last_connect_at: None,
            rate_limited_until: None,
            created_at: Utc::now(),
        }
    }

    /// Whether the dispatcher may open a session for this account at `now`.
    pub fn is_connectable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            AccountStatus::WarmingUp | AccountStatus::Active => true,
            AccountStatus::RateLimited => self.rate_limit_elapsed(now),
            AccountStatus::Unregistered | AccountStatus::Disabled => false,
        }
    }

    pub fn rate_limit_elapsed(&self, now: DateTime<Utc>) -> bool {
        self.rate_limited_until.is_none_or(|until| until <= now)
    }

    /// Status to return to once a rate limit has elapsed. Stage 0 means the
    /// account graduated from warm-up.
    pub fn working_status(&self) -> AccountStatus {
        if self.warmup_stage > 0 {
            AccountStatus::WarmingUp
        } else {
            AccountStatus::Active
        }
    }

    pub fn is_warming_up(&self) -> bool {
        self.warmup_stage > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_account_status_depends_on_credential() {
        let t = TenantId::new("t1");
        let a = Account::new(t.clone(), "a1", "+84900000001", AccountRole::Sender, Some("s".into()));
        assert_eq!(a.status, AccountStatus::WarmingUp);
        let b = Account::new(t, "a2", "+84900000002", AccountRole::Listener, None);
        assert_eq!(b.status, AccountStatus::Unregistered);
        assert!(!b.is_connectable(Utc::now()));
    }

    #[test]
    fn test_status_roundtrip() {
        for s in [
            AccountStatus::Unregistered,
            AccountStatus::WarmingUp,
            AccountStatus::Active,
            AccountStatus::RateLimited,
            AccountStatus::Disabled,
        ] {
            assert_eq!(s.as_str().parse::<AccountStatus>().unwrap(), s);
        }
        assert!("zombie".parse::<AccountStatus>().is_err());
    }

    #[test]
    fn test_rate_limited_connectable_after_expiry() {
        let now = Utc::now();
        let mut a = Account::new(TenantId::new("t"), "a", "h", AccountRole::Sender, Some("s".into()));
        a.status = AccountStatus::RateLimited;
        a.rate_limited_until = Some(now + chrono::Duration::seconds(30));
        assert!(!a.is_connectable(now));
        assert!(a.is_connectable(now + chrono::Duration::seconds(30)));
    }
}
