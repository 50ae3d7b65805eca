//! Inbound pipeline: keyword hits, lead updates and hot-lead replies.

use reachclaw_core::error::Result;
use reachclaw_core::traits::InboundMessage;
use reachclaw_core::types::{
    AccountRole, AccountStatus, KeywordSet, LeadStage, NewMessage, Payload, Scope,
};
use reachclaw_keywords::{KeywordIndex, KeywordMatch};
use reachclaw_leads::{LeadScorer, LeadTracker};
use reachclaw_monitor::KeywordHitTally;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::queue::DispatchQueue;

/// What one inbound message caused.
#[derive(Debug, Clone, Serialize)]
pub struct InboundReport {
    pub matches: Vec<KeywordMatch>,
    pub score: f64,
    pub stage: LeadStage,
    pub stage_changed: bool,
    /// Id of the reply queued for a lead that just turned hot.
    pub reply_id: Option<i64>,
}

pub struct InboundPipeline {
    index: Arc<KeywordIndex>,
    tally: Arc<KeywordHitTally>,
    leads: LeadTracker,
    queue: Arc<DispatchQueue>,
}

impl InboundPipeline {
    pub fn new(
        index: Arc<KeywordIndex>,
        tally: Arc<KeywordHitTally>,
        scorer: LeadScorer,
        queue: Arc<DispatchQueue>,
    ) -> Self {
        Self {
            index,
            tally,
            leads: LeadTracker::new(queue.db().clone(), scorer),
            queue,
        }
    }

    pub fn handle(&self, msg: &InboundMessage) -> Result<InboundReport> {
        let matches = self.index.matches_for(&msg.tenant_id, &msg.text);

        let mut per_set: BTreeMap<&str, u32> = BTreeMap::new();
        for m in &matches {
            *per_set.entry(m.set_name.as_ref()).or_default() += 1;
        }
        for (set, hits) in &per_set {
            self.tally.record(&msg.tenant_id, set, *hits);
        }
        if !matches.is_empty() {
            tracing::debug!(
                tenant = %msg.tenant_id,
                sender = %msg.sender,
                hits = matches.len(),
                "🔎 Keyword hits in inbound message"
            );
        }

        let hits = matches.len() as u32;
        let change = self.leads.record_activity(&msg.tenant_id, &msg.sender, msg.received_at, |s| {
            s.messages_received = s.messages_received.saturating_add(1);
            s.intent_keyword_hits = s.intent_keyword_hits.saturating_add(hits);
        })?;

        let reply_id = if change.entered(LeadStage::Hot) {
            self.reply_to_hot_lead(msg, &matches, change.lead.score)?
        } else {
            None
        };

        Ok(InboundReport {
            score: change.lead.score,
            stage: change.lead.stage,
            stage_changed: change.stage_changed(),
            matches,
            reply_id,
        })
    }

    /// Queue the tenant's reply template for a lead that just turned hot.
    fn reply_to_hot_lead(&self, msg: &InboundMessage, matches: &[KeywordMatch], score: f64) -> Result<Option<i64>> {
        let db = self.queue.db();
        let sets = db.list_keyword_sets(&Scope::Tenant(msg.tenant_id.clone()))?;
        let Some(set) = pick_reply_set(&sets, matches) else {
            return Ok(None);
        };
        let Some(template) = set.reply_template.clone() else {
            return Ok(None);
        };

        // Prefer the account the contact wrote to.
        let receiver = db
            .account(&msg.account_id)?
            .filter(|a| a.role == AccountRole::Sender)
            .filter(|a| matches!(a.status, AccountStatus::WarmingUp | AccountStatus::Active));
        let account = match receiver {
            Some(a) => a,
            None => match db.sender_accounts(&msg.tenant_id)?.into_iter().next() {
                Some(a) => a,
                None => {
                    tracing::warn!(tenant = %msg.tenant_id, "🔥 Hot lead {} but no sender account", msg.sender);
                    return Ok(None);
                }
            },
        };

        let mut reply = NewMessage::text(msg.tenant_id.clone(), account.id, msg.sender.clone(), "");
        reply.payload = Payload::Template {
            template,
            context: serde_json::json!({
                "contact": msg.sender,
                "text": msg.text,
                "set": set.name,
                "score": score,
            }),
        };
        reply.priority = LeadStage::Hot.dispatch_priority();
        let queued = self.queue.enqueue_at(reply, msg.received_at)?;
        tracing::info!(
            tenant = %msg.tenant_id,
            contact = %msg.sender,
            id = queued.id,
            "🔥 Hot lead, reply queued"
        );
        Ok(Some(queued.id))
    }
}

/// The first matched set with a reply template, else any enabled set with one.
fn pick_reply_set<'a>(sets: &'a [KeywordSet], matches: &[KeywordMatch]) -> Option<&'a KeywordSet> {
    let usable = |s: &&KeywordSet| s.enabled && s.reply_template.is_some();
    matches
        .iter()
        .find_map(|m| sets.iter().filter(usable).find(|s| s.id == m.set_id))
        .or_else(|| sets.iter().find(usable))
}
