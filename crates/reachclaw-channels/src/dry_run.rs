//! Dry-run platform: every connect and send succeeds, nothing leaves the process.

use async_trait::async_trait;
use chrono::Utc;
use reachclaw_core::error::Result;
use reachclaw_core::traits::{ChatPlatform, InboundStream, PlatformFailure, SendOutcome, SessionHandle};
use reachclaw_core::types::Account;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct DryRunPlatform {
    sent: AtomicU64,
}

impl DryRunPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ChatPlatform for DryRunPlatform {
    fn name(&self) -> &str {
        "dry-run"
    }

    async fn connect(&self, account: &Account) -> std::result::Result<SessionHandle, PlatformFailure> {
        tracing::info!(account = %account.id, proxy = ?account.proxy, "🧪 [dry-run] connect");
        Ok(SessionHandle {
            account_id: account.id.clone(),
            tenant_id: account.tenant_id.clone(),
            session_id: format!("dry-{}", uuid::Uuid::new_v4()),
            connected_at: Utc::now(),
        })
    }

    async fn send(&self, session: &SessionHandle, target: &str, text: &str) -> SendOutcome {
        self.sent.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            account = %session.account_id,
            target,
            chars = text.chars().count(),
            "🧪 [dry-run] send"
        );
        SendOutcome::Sent {
            provider_message_id: Some(uuid::Uuid::new_v4().to_string()),
        }
    }

    /// Never yields; the session stays up until shutdown.
    async fn receive(&self, _session: &SessionHandle) -> Result<InboundStream> {
        Ok(Box::new(tokio_stream::pending()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reachclaw_core::types::{AccountRole, TenantId};

    #[tokio::test]
    async fn test_dry_run_accepts_everything() {
        let platform = DryRunPlatform::new();
        let account = Account::new(TenantId::new("t1"), "a1", "+84", AccountRole::Sender, Some("s".into()));
        let session = platform.connect(&account).await.unwrap();
        assert_eq!(session.account_id, account.id);
        assert!(session.session_id.starts_with("dry-"));

        let outcome = platform.send(&session, "@lan", "hi").await;
        assert!(matches!(outcome, SendOutcome::Sent { provider_message_id: Some(_) }));
        assert_eq!(platform.sent_count(), 1);
        platform.disconnect(&session).await.unwrap();
    }
}
