//! Failure Classifier — provider errors to retry decisions.
//!
//! Pure mapping; the queue applies the decision. Provider messages are
//! tokenised on anything that is not `[A-Z0-9_]`, so `INPUT_USER_DEACTIVATED`
//! never reads as the account-level `USER_DEACTIVATED`.

use rand::Rng;
use reachclaw_core::config::DispatchConfig;
use reachclaw_core::traits::ProviderError;
use reachclaw_core::types::ErrorClass;
use std::time::Duration;

/// Our own account is gone: never send from it again.
const ACCOUNT_DISABLING: &[&str] = &[
    "USER_DEACTIVATED_BAN",
    "PHONE_NUMBER_BANNED",
    "AUTH_KEY_UNREGISTERED",
    "SESSION_REVOKED",
    "USER_DEACTIVATED",
];

/// The target cannot receive this message.
const TARGET_INVALID: &[&str] = &[
    "PEER_ID_INVALID",
    "USERNAME_INVALID",
    "USERNAME_NOT_OCCUPIED",
    "INPUT_USER_DEACTIVATED",
    "USER_IS_BLOCKED",
    "USER_PRIVACY_RESTRICTED",
    "CHAT_WRITE_FORBIDDEN",
];

/// Spam restriction on our account.
const PEER_FLOOD: &str = "PEER_FLOOD";

/// Waits scoped to the whole account.
const ACCOUNT_WAIT_PREFIXES: &[&str] = &["FLOOD_WAIT_", "FLOOD_PREMIUM_WAIT_"];
/// Waits scoped to one chat.
const CHAT_WAIT_PREFIX: &str = "SLOWMODE_WAIT_";

const HTTP_TOO_MANY_REQUESTS: i64 = 429;
const JITTER: f64 = 0.2;

/// What happens to the sending account on a permanent failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountEffect {
    None,
    /// Rest the account for this long.
    Restrict(Duration),
    Disable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Retry after exactly `wait`. `account_wide` waits also rate-limit the
    /// account, chat-scoped ones (slow mode) only delay the message.
    TransientWait {
        wait: Duration,
        account_wide: bool,
        reason: String,
    },
    Permanent { effect: AccountEffect, reason: String },
    UnknownRetry { backoff: Duration, reason: String },
}

impl Decision {
    pub fn error_class(&self) -> ErrorClass {
        match self {
            Decision::TransientWait { .. } => ErrorClass::TransientProvider,
            Decision::Permanent { .. } => ErrorClass::PermanentProvider,
            Decision::UnknownRetry { .. } => ErrorClass::ClassifierUnknown,
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            Decision::TransientWait { reason, .. }
            | Decision::Permanent { reason, .. }
            | Decision::UnknownRetry { reason, .. } => reason,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FailureClassifier {
    default_backoff: Duration,
    max_backoff: Duration,
    restricted_cooldown: Duration,
}

impl FailureClassifier {
    pub fn new(config: &DispatchConfig) -> Self {
        Self {
            default_backoff: config.default_backoff(),
            max_backoff: config.max_backoff(),
            restricted_cooldown: Duration::from_secs(config.restricted_cooldown_secs),
        }
    }

    pub fn default_backoff(&self) -> Duration {
        self.default_backoff
    }

    /// Classify `err` for the message's `attempt`-th provider attempt.
    pub fn classify(&self, err: &ProviderError, attempt: u32) -> Decision {
        self.classify_with(err, attempt, &mut rand::thread_rng())
    }

    pub fn classify_with<R: Rng>(&self, err: &ProviderError, attempt: u32, rng: &mut R) -> Decision {
        let reason = err.to_string();
        if let Some(wait) = err.retry_after {
            return Decision::TransientWait {
                wait,
                account_wide: true,
                reason,
            };
        }

        let upper = err.message.to_ascii_uppercase();
        let tokens: Vec<&str> = upper
            .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .filter(|t| !t.is_empty())
            .collect();

        for token in &tokens {
            for prefix in ACCOUNT_WAIT_PREFIXES {
                if let Some(secs) = token.strip_prefix(prefix).and_then(|n| n.parse::<u64>().ok()) {
                    return Decision::TransientWait {
                        wait: Duration::from_secs(secs),
                        account_wide: true,
                        reason,
                    };
                }
            }
            if let Some(secs) = token.strip_prefix(CHAT_WAIT_PREFIX).and_then(|n| n.parse::<u64>().ok()) {
                return Decision::TransientWait {
                    wait: Duration::from_secs(secs),
                    account_wide: false,
                    reason,
                };
            }
        }
        if let Some(secs) = wait_in_prose(&upper) {
            return Decision::TransientWait {
                wait: Duration::from_secs(secs),
                account_wide: true,
                reason,
            };
        }

        if tokens.contains(&PEER_FLOOD) {
            return Decision::Permanent {
                effect: AccountEffect::Restrict(self.restricted_cooldown),
                reason,
            };
        }
        if tokens.iter().any(|t| ACCOUNT_DISABLING.contains(t)) {
            return Decision::Permanent {
                effect: AccountEffect::Disable,
                reason,
            };
        }
        if tokens.iter().any(|t| TARGET_INVALID.contains(t)) {
            return Decision::Permanent {
                effect: AccountEffect::None,
                reason,
            };
        }

        // A bare 429 names no wait; fall back to the configured default.
        if err.code == Some(HTTP_TOO_MANY_REQUESTS) {
            return Decision::TransientWait {
                wait: self.default_backoff,
                account_wide: true,
                reason,
            };
        }

        let backoff = self.unknown_backoff(attempt, rng);
        tracing::warn!(attempt, backoff = ?backoff, "❓ Unrecognised provider error: {reason}");
        Decision::UnknownRetry { backoff, reason }
    }

    /// `min(default * 2^(attempt-1), max)` with ±20 % jitter, never above max.
    pub fn unknown_backoff<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let exp = attempt.max(1).saturating_sub(1).min(31);
        let base = self
            .default_backoff
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff);
        let factor = rng.gen_range((1.0 - JITTER)..=(1.0 + JITTER));
        base.mul_f64(factor).min(self.max_backoff)
    }
}

/// "retry after 12", "retry-after: 12", "a wait of 12 seconds".
fn wait_in_prose(upper: &str) -> Option<u64> {
    for marker in ["RETRY AFTER", "RETRY-AFTER", "WAIT OF"] {
        if let Some(pos) = upper.find(marker) {
            let rest = upper[pos + marker.len()..].trim_start_matches([' ', ':', '=']);
            let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
            if let Ok(n) = digits.parse() {
                return Some(n);
            }
        }
    }
    None
}
