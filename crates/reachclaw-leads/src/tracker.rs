//! Signal updates, rescoring and persistence of leads.

use chrono::{DateTime, Utc};
use reachclaw_core::error::Result;
use reachclaw_core::types::{ContactSignals, Lead, LeadStage, TenantId};
use reachclaw_db::FleetDb;
use std::sync::Arc;

use crate::scorer::LeadScorer;

/// Result of one observation.
#[derive(Debug, Clone)]
pub struct LeadChange {
    pub lead: Lead,
    /// Stage before this observation, `None` for a contact seen first.
    pub previous: Option<LeadStage>,
}

impl LeadChange {
    pub fn stage_changed(&self) -> bool {
        self.previous != Some(self.lead.stage)
    }

    /// True when this observation moved the lead into `stage`.
    pub fn entered(&self, stage: LeadStage) -> bool {
        self.lead.stage == stage && self.previous != Some(stage)
    }
}

/// Keeps stored leads in step with their signals.
pub struct LeadTracker {
    db: Arc<FleetDb>,
    scorer: LeadScorer,
}

impl LeadTracker {
    pub fn new(db: Arc<FleetDb>, scorer: LeadScorer) -> Self {
        Self { db, scorer }
    }

    pub fn scorer(&self) -> &LeadScorer {
        &self.scorer
    }

    /// Apply `update` to the contact's signals, rescore as of `now` and
    /// persist. Recency ages from the stored last activity.
    pub fn observe(
        &self,
        tenant: &TenantId,
        contact: &str,
        now: DateTime<Utc>,
        update: impl FnOnce(&mut ContactSignals),
    ) -> Result<LeadChange> {
        self.apply(tenant, contact, now, None, update)
    }

    /// Like [`observe`](Self::observe) for something the contact did at
    /// `at`, which becomes the lead's last activity.
    pub fn record_activity(
        &self,
        tenant: &TenantId,
        contact: &str,
        at: DateTime<Utc>,
        update: impl FnOnce(&mut ContactSignals),
    ) -> Result<LeadChange> {
        self.apply(tenant, contact, at, Some(at), update)
    }

    fn apply(
        &self,
        tenant: &TenantId,
        contact: &str,
        now: DateTime<Utc>,
        activity: Option<DateTime<Utc>>,
        update: impl FnOnce(&mut ContactSignals),
    ) -> Result<LeadChange> {
        let existing = self.db.lead(tenant, contact)?;
        let previous = existing.as_ref().map(|l| l.stage);
        let mut lead = existing.unwrap_or_else(|| Lead::new(tenant.clone(), contact));
        update(&mut lead.signals);
        if let Some(at) = activity {
            lead.last_activity_at = Some(lead.last_activity_at.map_or(at, |prev| prev.max(at)));
        }
        rescore(&self.scorer, &mut lead, now);
        self.db.upsert_lead(&lead)?;

        let change = LeadChange { lead, previous };
        if change.stage_changed() {
            tracing::info!(
                tenant = %tenant,
                contact,
                score = change.lead.score,
                "🎯 Lead stage {} → {}",
                previous.map(|s| s.as_str()).unwrap_or("new"),
                change.lead.stage
            );
        }
        Ok(change)
    }
}

/// Recompute score, stage and breakdown from the lead's signals as of
/// `now`. A lead with recorded activity gets its idle days refreshed first;
/// one without keeps whatever recency its signals carry.
pub fn rescore(scorer: &LeadScorer, lead: &mut Lead, now: DateTime<Utc>) {
    if let Some(days) = lead.days_idle(now) {
        lead.signals.days_since_last_activity = Some(days);
    }
    let score = scorer.score(&lead.signals);
    lead.breakdown = score.breakdown;
    lead.score = score.composite;
    lead.stage = score.stage;
    lead.updated_at = now;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn test_observe_persists_and_reports_transition() {
        let db = Arc::new(FleetDb::open_in_memory(false).unwrap());
        let tracker = LeadTracker::new(db.clone(), LeadScorer::new());
        let tenant = TenantId::new("t1");
        let now = Utc::now();

        let first = tracker
            .record_activity(&tenant, "@lan", now, |s| s.messages_received += 1)
            .unwrap();
        assert_eq!(first.previous, None);
        assert!(first.stage_changed());
        // 3 engagement + 2 unknown-age quality + 10 recency.
        assert_eq!(first.lead.score, 15.0);
        assert_eq!(first.lead.stage, LeadStage::Cold);

        let second = tracker
            .observe(&tenant, "@lan", now, |s| {
                s.has_first_name = true;
                s.has_username = true;
                s.has_photo = true;
                s.intent_keyword_hits += 4;
                s.buying_phrases += 2;
                s.messages_received += 4;
            })
            .unwrap();
        // 12 + 15 + 30 + 2 + 10
        assert_eq!(second.lead.score, 69.0);
        assert!(second.entered(LeadStage::Warm));
        assert_eq!(second.previous, Some(LeadStage::Cold));

        let stored = db.lead(&tenant, "@lan").unwrap().unwrap();
        assert_eq!(stored.score, 69.0);
        assert_eq!(stored.signals.messages_received, 5);

        let same = tracker.observe(&tenant, "@lan", now, |_| {}).unwrap();
        assert!(!same.stage_changed());
        assert!(!same.entered(LeadStage::Warm));
    }

    #[test]
    fn test_recency_decays_between_activities() {
        let db = Arc::new(FleetDb::open_in_memory(false).unwrap());
        let tracker = LeadTracker::new(db.clone(), LeadScorer::new());
        let tenant = TenantId::new("t1");
        let day0 = Utc.with_ymd_and_hms(2026, 10, 1, 9, 0, 0).unwrap();

        let fresh = tracker
            .record_activity(&tenant, "@lan", day0, |s| s.messages_received += 1)
            .unwrap();
        assert_eq!(fresh.lead.breakdown.recency, 10.0);
        assert_eq!(fresh.lead.last_activity_at, Some(day0));

        let week = tracker
            .observe(&tenant, "@lan", day0 + Duration::days(5), |s| s.has_photo = true)
            .unwrap();
        assert_eq!(week.lead.signals.days_since_last_activity, Some(5));
        assert_eq!(week.lead.breakdown.recency, 4.0);

        let stale = tracker
            .observe(&tenant, "@lan", day0 + Duration::days(90), |s| s.has_bio = true)
            .unwrap();
        assert_eq!(stale.lead.breakdown.recency, 0.0);
        assert_eq!(stale.lead.last_activity_at, Some(day0));

        let back = tracker
            .record_activity(&tenant, "@lan", day0 + Duration::days(91), |s| s.messages_received += 1)
            .unwrap();
        assert_eq!(back.lead.breakdown.recency, 10.0);
    }
}
