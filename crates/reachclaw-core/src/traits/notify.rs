//! Outbound alert notification seam.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::Alert;

/// Somewhere alerts get delivered: an operator chat, a webhook, a log.
#[async_trait]
pub trait NotifySink: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, alert: &Alert) -> Result<()>;
}
