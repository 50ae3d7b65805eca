//! Contacts tracked as sales leads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::{Priority, TenantId, UnknownVariant};

/// Funnel stage derived from the composite score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadStage {
    Cold,
    Neutral,
    Warm,
    Hot,
}

impl LeadStage {
    /// hot > 75, warm 50..=75, neutral 25..50, cold < 25.
    pub fn from_score(score: f64) -> Self {
        if score > 75.0 {
            LeadStage::Hot
        } else if score >= 50.0 {
            LeadStage::Warm
        } else if score >= 25.0 {
            LeadStage::Neutral
        } else {
            LeadStage::Cold
        }
    }

    /// Dispatch priority for messages addressed to a lead in this stage.
    pub fn dispatch_priority(&self) -> Priority {
        match self {
            LeadStage::Hot => Priority::High,
            LeadStage::Warm => Priority::Normal,
            LeadStage::Neutral | LeadStage::Cold => Priority::Low,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LeadStage::Cold => "cold",
            LeadStage::Neutral => "neutral",
            LeadStage::Warm => "warm",
            LeadStage::Hot => "hot",
        }
    }
}

impl std::fmt::Display for LeadStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LeadStage {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cold" => Ok(LeadStage::Cold),
            "neutral" => Ok(LeadStage::Neutral),
            "warm" => Ok(LeadStage::Warm),
            "hot" => Ok(LeadStage::Hot),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Raw signals about a contact. Everything the scorer reads lives here,
/// including recency, so scoring never consults the clock.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContactSignals {
    pub has_first_name: bool,
    pub has_last_name: bool,
    pub has_username: bool,
    pub has_photo: bool,
    pub has_bio: bool,
    pub has_phone: bool,
    pub messages_received: u32,
    pub replies_sent: u32,
    pub reactions: u32,
    pub intent_keyword_hits: u32,
    pub buying_phrases: u32,
    pub account_age_days: Option<u32>,
    pub is_premium: bool,
    pub is_verified: bool,
    pub is_bot: bool,
    pub is_scam: bool,
    pub is_fake: bool,
    pub days_since_last_activity: Option<u32>,
}

/// Per-dimension sub-scores.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    /// Profile completeness, max 20.
    pub completeness: f64,
    /// Engagement, max 25.
    pub engagement: f64,
    /// Intent signal, max 30.
    pub intent: f64,
    /// Account quality, max 15.
    pub quality: f64,
    /// Recency, max 10.
    pub recency: f64,
}

impl ScoreBreakdown {
    pub const MAX_COMPLETENESS: f64 = 20.0;
    pub const MAX_ENGAGEMENT: f64 = 25.0;
    pub const MAX_INTENT: f64 = 30.0;
    pub const MAX_QUALITY: f64 = 15.0;
    pub const MAX_RECENCY: f64 = 10.0;

    /// Build from raw parts, clamping each to its dimension maximum.
    pub fn new(completeness: f64, engagement: f64, intent: f64, quality: f64, recency: f64) -> Self {
        Self {
            completeness: clamp(completeness, Self::MAX_COMPLETENESS),
            engagement: clamp(engagement, Self::MAX_ENGAGEMENT),
            intent: clamp(intent, Self::MAX_INTENT),
            quality: clamp(quality, Self::MAX_QUALITY),
            recency: clamp(recency, Self::MAX_RECENCY),
        }
    }

    /// Sum of the dimensions, clamped to 0..=100.
    pub fn composite(&self) -> f64 {
        let sum = self.completeness + self.engagement + self.intent + self.quality + self.recency;
        sum.clamp(0.0, 100.0)
    }

    pub fn stage(&self) -> LeadStage {
        LeadStage::from_score(self.composite())
    }
}

fn clamp(v: f64, max: f64) -> f64 {
    if v.is_nan() { 0.0 } else { v.clamp(0.0, max) }
}

/// A scored contact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lead {
    pub tenant_id: TenantId,
    /// Contact identity on the chat platform.
    pub contact: String,
    pub signals: ContactSignals,
    pub breakdown: ScoreBreakdown,
    pub score: f64,
    pub stage: LeadStage,
    /// Last inbound activity; recency is aged from this on every rescore.
    #[serde(default)]
    pub last_activity_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Lead {
    /// Whole days between the last activity and `now`, never negative.
    pub fn days_idle(&self, now: DateTime<Utc>) -> Option<u32> {
        self.last_activity_at
            .map(|at| (now - at).num_days().clamp(0, i64::from(u32::MAX)) as u32)
    }

    pub fn new(tenant_id: TenantId, contact: impl Into<String>) -> Self {
        Self {
            tenant_id,
            contact: contact.into(),
            signals: ContactSignals::default(),
            breakdown: ScoreBreakdown::default(),
            score: 0.0,
            stage: LeadStage::Cold,
            last_activity_at: None,
            updated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_composite_and_stage() {
        let hot = ScoreBreakdown::new(18.0, 20.0, 25.0, 10.0, 8.0);
        assert_eq!(hot.composite(), 81.0);
        assert_eq!(hot.stage(), LeadStage::Hot);

        let neutral = ScoreBreakdown::new(10.0, 10.0, 10.0, 5.0, 5.0);
        assert_eq!(neutral.composite(), 40.0);
        assert_eq!(neutral.stage(), LeadStage::Neutral);
    }

    #[test]
    fn test_stage_boundaries() {
        assert_eq!(LeadStage::from_score(75.0), LeadStage::Warm);
        assert_eq!(LeadStage::from_score(75.5), LeadStage::Hot);
        assert_eq!(LeadStage::from_score(50.0), LeadStage::Warm);
        assert_eq!(LeadStage::from_score(49.9), LeadStage::Neutral);
        assert_eq!(LeadStage::from_score(25.0), LeadStage::Neutral);
        assert_eq!(LeadStage::from_score(24.9), LeadStage::Cold);
    }

    #[test]
    fn test_days_idle() {
        let now = Utc::now();
        let mut lead = Lead::new(TenantId::new("t1"), "@lan");
        assert_eq!(lead.days_idle(now), None);
        lead.last_activity_at = Some(now - chrono::Duration::hours(47));
        assert_eq!(lead.days_idle(now), Some(1));
        lead.last_activity_at = Some(now + chrono::Duration::hours(5));
        assert_eq!(lead.days_idle(now), Some(0));
    }

    #[test]
    fn test_breakdown_clamps_each_dimension() {
        let b = ScoreBreakdown::new(50.0, -3.0, 99.0, f64::NAN, 10.0);
        assert_eq!(b.completeness, 20.0);
        assert_eq!(b.engagement, 0.0);
        assert_eq!(b.intent, 30.0);
        assert_eq!(b.quality, 0.0);
        assert_eq!(b.composite(), 60.0);
    }
}
