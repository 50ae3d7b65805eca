//! ReachClaw error types.

use thiserror::Error;

/// Errors shared by every ReachClaw crate.
#[derive(Debug, Error)]
pub enum ReachClawError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    /// A read tried to cross the tenant boundary.
    #[error("Tenant isolation violated: {0}")]
    TenantIsolation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// A state transition that the entity's lifecycle does not allow.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Platform error: {0}")]
    Platform(String),

    #[error("Notification error: {0}")]
    Notify(String),

    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Rule evaluation failed: {0}")]
    RuleEvaluation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl ReachClawError {
    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    pub fn platform(msg: impl Into<String>) -> Self {
        Self::Platform(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, ReachClawError>;
