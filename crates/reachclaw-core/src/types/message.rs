//! Outbound messages waiting in an account's dispatch lane.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::{AccountId, TenantId, UnknownVariant};

/// Priority tier. Lower rank is sent first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Urgent,
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    pub fn rank(&self) -> u8 {
        match self {
            Priority::Urgent => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
        }
    }

    pub fn from_rank(rank: u8) -> Self {
        match rank {
            0 => Priority::Urgent,
            1 => Priority::High,
            2 => Priority::Normal,
            _ => Priority::Low,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Urgent => "urgent",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

impl FromStr for Priority {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "urgent" => Ok(Priority::Urgent),
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Message lifecycle. `Sent`, `Failed` and `Expired` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageState {
    Pending,
    Sending,
    Sent,
    Failed,
    Retrying,
    Expired,
}

impl MessageState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MessageState::Sent | MessageState::Failed | MessageState::Expired
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageState::Pending => "pending",
            MessageState::Sending => "sending",
            MessageState::Sent => "sent",
            MessageState::Failed => "failed",
            MessageState::Retrying => "retrying",
            MessageState::Expired => "expired",
        }
    }

    pub const ALL: [MessageState; 6] = [
        MessageState::Pending,
        MessageState::Sending,
        MessageState::Sent,
        MessageState::Failed,
        MessageState::Retrying,
        MessageState::Expired,
    ];
}

impl std::fmt::Display for MessageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageState {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MessageState::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| UnknownVariant(s.to_string()))
    }
}

/// Failure taxonomy recorded on a message after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Flood / rate signal with a provider-specified wait.
    TransientProvider,
    /// Invalid target, ban, revoked session.
    PermanentProvider,
    /// Unrecognised provider error shape.
    ClassifierUnknown,
    /// Datastore or network trouble on our side.
    LocalResource,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::TransientProvider => "transient_provider",
            ErrorClass::PermanentProvider => "permanent_provider",
            ErrorClass::ClassifierUnknown => "classifier_unknown",
            ErrorClass::LocalResource => "local_resource",
        }
    }
}

impl FromStr for ErrorClass {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transient_provider" => Ok(ErrorClass::TransientProvider),
            "permanent_provider" => Ok(ErrorClass::PermanentProvider),
            "classifier_unknown" => Ok(ErrorClass::ClassifierUnknown),
            "local_resource" => Ok(ErrorClass::LocalResource),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// What to send: literal text or a template rendered against a context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    Text {
        text: String,
    },
    Template {
        template: String,
        #[serde(default)]
        context: serde_json::Value,
    },
}

impl Payload {
    pub fn text(text: impl Into<String>) -> Self {
        Payload::Text { text: text.into() }
    }

    /// Render to the final text. Template variables are `{{name}}` keys of
    /// the context object; missing keys render empty. Substituted values are
    /// inserted verbatim and never scanned for further variables.
    pub fn render(&self) -> String {
        match self {
            Payload::Text { text } => text.clone(),
            Payload::Template { template, context } => render_template(template, context),
        }
    }
}

fn render_template(template: &str, context: &serde_json::Value) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        let Some(len) = rest[start + 2..].find("}}") else {
            break;
        };
        out.push_str(&rest[..start]);
        let key = rest[start + 2..start + 2 + len].trim();
        match context.get(key) {
            Some(serde_json::Value::String(s)) => out.push_str(s),
            Some(serde_json::Value::Null) | None => {}
            Some(other) => out.push_str(&other.to_string()),
        }
        rest = &rest[start + 2 + len + 2..];
    }
    out.push_str(rest);
    out
}

/// Enqueue request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessage {
    pub tenant_id: TenantId,
    pub account_id: AccountId,
    /// Target user id, username or phone.
    pub target: String,
    pub payload: Payload,
    #[serde(default)]
    pub priority: Priority,
    /// Do not send before this time.
    #[serde(default)]
    pub not_before: Option<DateTime<Utc>>,
    /// Expire instead of sending after this time.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl NewMessage {
    pub fn text(
        tenant_id: TenantId,
        account_id: AccountId,
        target: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id,
            account_id,
            target: target.into(),
            payload: Payload::text(text),
            priority: Priority::Normal,
            not_before: None,
            expires_at: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// A message owned by the dispatch queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub id: i64,
    pub tenant_id: TenantId,
    pub account_id: AccountId,
    pub target: String,
    pub payload: Payload,
    pub priority: Priority,
    pub state: MessageState,
    /// Provider-facing attempts consumed.
    pub attempts: u32,
    /// Retries caused by local resource failures; not charged to `attempts`.
    pub local_retries: u32,
    pub next_eligible_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub last_error_class: Option<ErrorClass>,
    /// Human-readable reason for the last failure or terminal state.
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}
