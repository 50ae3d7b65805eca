//! # ReachClaw Core
//!
//! Shared vocabulary for the ReachClaw dispatcher: error type, configuration,
//! domain entities and the traits external collaborators implement.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::ReachClawConfig;
pub use error::{ReachClawError, Result};
pub use traits::{ChatPlatform, NotifySink};
pub use types::{AccountId, Scope, TenantId};
