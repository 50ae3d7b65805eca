//! # ReachClaw Monitor
//!
//! Trigger & alert engine. Declarative rules (metric thresholds, keyword
//! hits, named custom checks) are evaluated on a fixed cycle; each rule fires
//! at most once per cooldown window. Alerts land in a bounded in-memory
//! history and are forwarded to notification sinks.

pub mod checks;
pub mod cycle;
pub mod engine;
pub mod history;
pub mod sinks;

pub use checks::{CheckRegistry, CustomCheck, EvalContext, HitCounts, KeywordHitTally, Metrics, MetricsSource};
pub use cycle::{deliver_all, spawn_alert_loop};
pub use engine::AlertEngine;
pub use history::AlertHistory;
pub use sinks::{DbAlertLog, LogSink, TelegramSink, WebhookSink, sinks_from_config};
