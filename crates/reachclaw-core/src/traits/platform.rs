//! Chat-platform session contract.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_stream::Stream;

use crate::error::Result;
use crate::types::{Account, AccountId, TenantId};

/// An open session for one account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    pub account_id: AccountId,
    pub tenant_id: TenantId,
    /// Platform-side session identifier.
    pub session_id: String,
    pub connected_at: DateTime<Utc>,
}

/// Error reported by the chat provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderError {
    /// Numeric code when the provider has one (HTTP-like status or RPC code).
    #[serde(default)]
    pub code: Option<i64>,
    /// Provider error text, e.g. `FLOOD_WAIT_30` or `PEER_ID_INVALID`.
    pub message: String,
    /// Explicit wait demanded by the provider.
    #[serde(default, with = "opt_secs")]
    pub retry_after: Option<Duration>,
}

impl ProviderError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn with_code(mut self, code: i64) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_retry_after(mut self, wait: Duration) -> Self {
        self.retry_after = Some(wait);
        self
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "[{code}] {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

mod opt_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(v: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_secs))
    }
}

/// Why a platform call did not succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformFailure {
    /// The provider answered with an error.
    Provider(ProviderError),
    /// We never got a provider answer: transport error, timeout, proxy down.
    Local(String),
}

impl std::fmt::Display for PlatformFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlatformFailure::Provider(e) => write!(f, "provider: {e}"),
            PlatformFailure::Local(e) => write!(f, "local: {e}"),
        }
    }
}

/// Result of one send attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Sent { provider_message_id: Option<String> },
    Provider(ProviderError),
    Local(String),
}

impl SendOutcome {
    pub fn sent() -> Self {
        SendOutcome::Sent {
            provider_message_id: None,
        }
    }
}

impl From<PlatformFailure> for SendOutcome {
    fn from(f: PlatformFailure) -> Self {
        match f {
            PlatformFailure::Provider(e) => SendOutcome::Provider(e),
            PlatformFailure::Local(e) => SendOutcome::Local(e),
        }
    }
}

/// A message received by one of our accounts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub account_id: AccountId,
    pub tenant_id: TenantId,
    /// Sender identity on the platform.
    pub sender: String,
    pub chat_id: String,
    pub text: String,
    pub received_at: DateTime<Utc>,
}

pub type InboundStream = Box<dyn Stream<Item = InboundMessage> + Send + Unpin>;

/// A third-party chat platform the dispatcher drives.
#[async_trait]
pub trait ChatPlatform: Send + Sync {
    fn name(&self) -> &str;

    /// Open a session for `account` through its assigned proxy.
    async fn connect(&self, account: &Account) -> std::result::Result<SessionHandle, PlatformFailure>;

    async fn send(&self, session: &SessionHandle, target: &str, text: &str) -> SendOutcome;

    /// Inbound messages for the session. Ends when the session drops; callers
    /// reconnect and call `receive` again.
    async fn receive(&self, session: &SessionHandle) -> Result<InboundStream>;

    async fn disconnect(&self, _session: &SessionHandle) -> Result<()> {
        Ok(())
    }
}
