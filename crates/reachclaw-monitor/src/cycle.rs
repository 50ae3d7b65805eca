//! Background evaluation cycle.

use reachclaw_core::traits::NotifySink;
use reachclaw_core::types::Alert;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::engine::AlertEngine;

/// Deliver one alert to every sink. Failures and timeouts are logged and
/// reported back, never retried.
pub async fn deliver_all(alert: &Alert, sinks: &[Arc<dyn NotifySink>], timeout: Duration) -> Vec<(String, bool)> {
    let mut results = Vec::with_capacity(sinks.len());
    for sink in sinks {
        let ok = match tokio::time::timeout(timeout, sink.deliver(alert)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::warn!(sink = sink.name(), rule = %alert.rule_id, "⚠️ Alert delivery failed: {e}");
                false
            }
            Err(_) => {
                tracing::warn!(sink = sink.name(), rule = %alert.rule_id, "⚠️ Alert delivery timed out after {timeout:?}");
                false
            }
        };
        results.push((sink.name().to_string(), ok));
    }
    results
}

/// Evaluate rules every `interval` and forward new alerts to `sinks` until
/// `cancel` fires.
pub fn spawn_alert_loop(
    engine: Arc<AlertEngine>,
    sinks: Vec<Arc<dyn NotifySink>>,
    interval: Duration,
    notify_timeout: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!("🔔 Alert loop started (every {interval:?}, {} sinks)", sinks.len());
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for alert in engine.evaluate() {
                        deliver_all(&alert, &sinks, notify_timeout).await;
                    }
                }
                _ = cancel.cancelled() => {
                    tracing::info!("alert loop shutting down");
                    break;
                }
            }
        }
    })
}
