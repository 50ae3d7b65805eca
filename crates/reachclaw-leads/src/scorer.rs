//! Five-dimension lead scoring.
//!
//! | Dimension    | Max | Reads |
//! |--------------|-----|-------|
//! | completeness | 20  | name, username, photo, bio, phone |
//! | engagement   | 25  | messages received, replies, reactions |
//! | intent       | 30  | intent keyword hits, buying phrases |
//! | quality      | 15  | account age, premium, verified; zero for bot/scam/fake |
//! | recency      | 10  | days since last activity |

use reachclaw_core::types::{ContactSignals, LeadStage, ScoreBreakdown};
use serde::Serialize;

/// Scores one dimension. The result is clamped to the dimension maximum,
/// so a swapped-in function cannot push the composite past 100.
pub type DimensionFn = fn(&ContactSignals) -> f64;

/// Output of [`LeadScorer::score`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LeadScore {
    pub composite: f64,
    pub stage: LeadStage,
    pub breakdown: ScoreBreakdown,
}

#[derive(Clone, Copy)]
pub struct LeadScorer {
    completeness: DimensionFn,
    engagement: DimensionFn,
    intent: DimensionFn,
    quality: DimensionFn,
    recency: DimensionFn,
}

impl Default for LeadScorer {
    fn default() -> Self {
        Self {
            completeness,
            engagement,
            intent,
            quality,
            recency,
        }
    }
}

impl std::fmt::Debug for LeadScorer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeadScorer").finish_non_exhaustive()
    }
}

impl LeadScorer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_completeness(mut self, f: DimensionFn) -> Self {
        self.completeness = f;
        self
    }

    pub fn with_engagement(mut self, f: DimensionFn) -> Self {
        self.engagement = f;
        self
    }

    pub fn with_intent(mut self, f: DimensionFn) -> Self {
        self.intent = f;
        self
    }

    pub fn with_quality(mut self, f: DimensionFn) -> Self {
        self.quality = f;
        self
    }

    pub fn with_recency(mut self, f: DimensionFn) -> Self {
        self.recency = f;
        self
    }

    /// Pure in `signals`: no clock, no randomness.
    pub fn score(&self, signals: &ContactSignals) -> LeadScore {
        let breakdown = ScoreBreakdown::new(
            (self.completeness)(signals),
            (self.engagement)(signals),
            (self.intent)(signals),
            (self.quality)(signals),
            (self.recency)(signals),
        );
        LeadScore {
            composite: breakdown.composite(),
            stage: breakdown.stage(),
            breakdown,
        }
    }
}

fn points(flag: bool, pts: f64) -> f64 {
    if flag { pts } else { 0.0 }
}

fn capped(count: u32, cap: u32, each: f64) -> f64 {
    f64::from(count.min(cap)) * each
}

/// Profile completeness, max 20.
pub fn completeness(s: &ContactSignals) -> f64 {
    points(s.has_first_name, 4.0)
        + points(s.has_last_name, 3.0)
        + points(s.has_username, 4.0)
        + points(s.has_photo, 4.0)
        + points(s.has_bio, 3.0)
        + points(s.has_phone, 2.0)
}

/// Engagement, max 25.
pub fn engagement(s: &ContactSignals) -> f64 {
    capped(s.messages_received, 5, 3.0) + capped(s.replies_sent, 3, 2.0) + capped(s.reactions, 4, 1.0)
}

/// Intent signal, max 30.
pub fn intent(s: &ContactSignals) -> f64 {
    capped(s.intent_keyword_hits, 4, 5.0) + capped(s.buying_phrases, 2, 5.0)
}

/// Account quality, max 15.
pub fn quality(s: &ContactSignals) -> f64 {
    if s.is_bot || s.is_scam || s.is_fake {
        return 0.0;
    }
    let age = match s.account_age_days {
        Some(d) if d >= 365 => 6.0,
        Some(d) if d >= 90 => 4.0,
        Some(d) if d >= 30 => 2.0,
        Some(_) => 0.0,
        // Unknown age is neither rewarded nor punished much.
        None => 2.0,
    };
    age + points(s.is_premium, 4.0) + points(s.is_verified, 5.0)
}

/// Recency, max 10. No activity on record scores zero.
pub fn recency(s: &ContactSignals) -> f64 {
    match s.days_since_last_activity {
        Some(0) => 10.0,
        Some(1) => 8.0,
        Some(2..=3) => 6.0,
        Some(4..=7) => 4.0,
        Some(8..=30) => 2.0,
        _ => 0.0,
    }
}
