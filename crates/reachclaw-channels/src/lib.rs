//! # ReachClaw Channels
//! Chat platform adapters the dispatcher drives.
//!
//! - [`HttpBridgePlatform`]: talks to a protocol sidecar over HTTP; the
//!   sidecar holds the actual MTProto sessions and egress proxies.
//! - [`DryRunPlatform`]: accepts everything and only logs, for rehearsals.

pub mod bridge;
pub mod dry_run;

pub use bridge::HttpBridgePlatform;
pub use dry_run::DryRunPlatform;
