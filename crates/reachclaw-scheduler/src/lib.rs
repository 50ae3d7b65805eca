//! # ReachClaw Scheduler
//!
//! Drives a fleet of chat accounts without tripping platform anti-abuse
//! heuristics.
//!
//! ## Architecture
//! ```text
//! Dispatcher (tokio interval)
//!   ├── ConnectionScheduler: hash(account) → hour bucket + jitter, probabilistic gate
//!   ├── LaneBoard: one connect/send per account, global semaphore ceiling
//!   ├── DispatchQueue: pending → sending → sent | retrying | failed | expired
//!   │     ├── WarmupPolicy: daily caps for new accounts
//!   │     └── FailureClassifier: provider error → wait | permanent | unknown
//!   └── inbound stream → InboundPipeline
//!                          ├── KeywordIndex matches → hit tally (alert rules)
//!                          └── LeadTracker → hot lead → reply queued
//! ```

pub mod connect;
pub mod dispatcher;
pub mod failure;
pub mod inbound;
pub mod lanes;
pub mod queue;
pub mod warmup;

pub use connect::{ConnectionScheduler, PlannedConnect, account_hash, should_defer_in_round};
pub use dispatcher::Dispatcher;
pub use failure::{AccountEffect, Decision, FailureClassifier};
pub use inbound::{InboundPipeline, InboundReport};
pub use lanes::{LaneBoard, LanePhase, LaneStats};
pub use queue::DispatchQueue;
pub use warmup::WarmupPolicy;
