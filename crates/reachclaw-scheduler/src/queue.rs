//! Dispatch Queue — per-account, priority-ordered outbound queue.
//!
//! State machine:
//!
//! ```text
//! pending ──next()──▶ sending ──sent──────────────▶ sent
//!    │                  │  ├──transient/unknown──▶ retrying ──next()──▶ sending
//!    │                  │  ├──permanent/ceiling──▶ failed
//!    │                  │  └──local failure──────▶ retrying (no attempt charged)
//!    └──cancel/expiry──▶ expired ◀──cancel/expiry── retrying
//! ```
//!
//! Every transition is one datastore transaction; the policy deciding it
//! lives here and runs inside that transaction as a closure.

use chrono::{DateTime, Utc};
use reachclaw_core::config::ReachClawConfig;
use reachclaw_core::error::{ReachClawError, Result};
use reachclaw_core::traits::SendOutcome;
use reachclaw_core::types::{
    AccountId, AccountStatus, ErrorClass, MessageState, NewMessage, QueuedMessage, Scope,
};
use reachclaw_db::{AccountUpdate, Admission, FleetDb, LaneSnapshot, QueueCounts};
use reachclaw_monitor::{Metrics, MetricsSource};
use std::sync::Arc;
use std::time::Duration;

use crate::failure::{AccountEffect, Decision, FailureClassifier};
use crate::warmup::WarmupPolicy;

/// Longest wait we schedule; keeps timestamps in a sane range.
const MAX_SCHEDULE_AHEAD: Duration = Duration::from_secs(365 * 86_400);

/// `now + wait`, saturating at a year ahead.
pub(crate) fn after(now: DateTime<Utc>, wait: Duration) -> DateTime<Utc> {
    let wait = wait.min(MAX_SCHEDULE_AHEAD);
    chrono::Duration::from_std(wait)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(now)
}

pub struct DispatchQueue {
    db: Arc<FleetDb>,
    classifier: FailureClassifier,
    warmup: WarmupPolicy,
    max_attempts: u32,
    max_per_minute: u32,
    max_per_hour: u32,
    stale_after: Duration,
}

impl DispatchQueue {
    pub fn new(db: Arc<FleetDb>, config: &ReachClawConfig) -> Self {
        Self {
            db,
            classifier: FailureClassifier::new(&config.dispatch),
            warmup: WarmupPolicy::new(&config.warmup),
            max_attempts: config.dispatch.max_attempts.max(1),
            max_per_minute: config.dispatch.max_messages_per_minute,
            max_per_hour: config.dispatch.max_messages_per_hour,
            stale_after: Duration::from_secs(config.dispatch.stale_sending_secs),
        }
    }

    pub fn db(&self) -> &Arc<FleetDb> {
        &self.db
    }

    pub fn classifier(&self) -> &FailureClassifier {
        &self.classifier
    }

    pub fn warmup(&self) -> &WarmupPolicy {
        &self.warmup
    }

    /// Admit a message in `pending`.
    pub fn enqueue(&self, msg: NewMessage) -> Result<QueuedMessage> {
        self.enqueue_at(msg, Utc::now())
    }

    pub fn enqueue_at(&self, msg: NewMessage, now: DateTime<Utc>) -> Result<QueuedMessage> {
        if msg.target.trim().is_empty() {
            return Err(ReachClawError::InvalidState("message target is empty".into()));
        }
        let queued = self.db.insert_message(&msg, now)?;
        tracing::debug!(
            id = queued.id,
            account = %queued.account_id,
            priority = queued.priority.as_str(),
            "📥 Message queued"
        );
        Ok(queued)
    }

    /// Claim the next eligible message for `account`, or `None` when the
    /// lane is empty, busy or out of budget.
    pub fn next(&self, account: &AccountId) -> Result<Option<QueuedMessage>> {
        self.next_at(account, Utc::now())
    }

    pub fn next_at(&self, account: &AccountId, now: DateTime<Utc>) -> Result<Option<QueuedMessage>> {
        let claimed = self.db.claim_next(account, now, |lane| self.admit(lane))?;
        if let Some(msg) = &claimed {
            tracing::debug!(id = msg.id, account = %account, attempt = msg.attempts + 1, "📤 Message claimed");
        }
        Ok(claimed)
    }

    /// Lane budget: account status, one send in flight, per-minute and
    /// per-hour caps, warm-up daily limit.
    fn admit(&self, lane: &LaneSnapshot<'_>) -> Admission {
        let account = lane.account;
        let restore = match account.status {
            AccountStatus::WarmingUp | AccountStatus::Active => None,
            AccountStatus::RateLimited if account.rate_limit_elapsed(lane.now) => Some(account.working_status()),
            AccountStatus::RateLimited => return Admission::Skip("rate limited"),
            AccountStatus::Unregistered => return Admission::Skip("unregistered"),
            AccountStatus::Disabled => return Admission::Skip("disabled"),
        };
        if lane.in_flight > 0 {
            return Admission::Skip("send in flight");
        }
        if lane.sent_last_minute >= self.max_per_minute {
            return Admission::Skip("minute budget spent");
        }
        if lane.sent_last_hour >= self.max_per_hour {
            return Admission::Skip("hour budget spent");
        }
        if let Some(limit) = self.warmup.daily_limit(account) {
            if lane.sent_today >= limit {
                return Admission::Skip("warm-up daily limit");
            }
        }
        if let Some(status) = restore {
            tracing::info!(account = %account.id, "🔓 Rate limit elapsed, back to {status}");
        }
        Admission::Claim { restore }
    }

    /// Record the outcome of a send. A no-op on terminal messages.
    ///
    /// A `Sent` report arriving after stale recovery gave up on the claim
    /// still lands as long as the message has not been claimed again: the
    /// text went out, so sending it a second time would be wrong.
    pub fn report_result(&self, id: i64, outcome: &SendOutcome) -> Result<QueuedMessage> {
        self.report_result_at(id, outcome, Utc::now())
    }

    pub fn report_result_at(&self, id: i64, outcome: &SendOutcome, now: DateTime<Utc>) -> Result<QueuedMessage> {
        let mut unclaimed = None;
        let mut decision = None;
        let msg = self.db.update_message(id, |msg| {
            if msg.state.is_terminal() {
                return None;
            }
            let recovered_claim = msg.state == MessageState::Retrying && msg.claimed_at.is_some();
            let late_sent = recovered_claim && matches!(outcome, SendOutcome::Sent { .. });
            if msg.state != MessageState::Sending && !late_sent {
                unclaimed = Some(msg.state);
                return None;
            }
            msg.updated_at = now;
            if !matches!(outcome, SendOutcome::Sent { .. }) {
                // Only stale recovery leaves a claim stamp on a retrying message.
                msg.claimed_at = None;
            }
            match outcome {
                SendOutcome::Sent { .. } => {
                    if late_sent {
                        tracing::info!(id = msg.id, account = %msg.account_id, "📬 Late delivery report after stale recovery");
                    }
                    msg.state = MessageState::Sent;
                    msg.sent_at = Some(now);
                    msg.last_error = None;
                    None
                }
                SendOutcome::Local(reason) => {
                    msg.state = MessageState::Retrying;
                    msg.local_retries += 1;
                    msg.next_eligible_at = after(now, self.classifier.default_backoff());
                    msg.last_error_class = Some(ErrorClass::LocalResource);
                    msg.last_error = Some(reason.clone());
                    None
                }
                SendOutcome::Provider(err) => {
                    msg.attempts += 1;
                    let d = self.classifier.classify(err, msg.attempts);
                    let update = self.apply(msg, &d, now);
                    decision = Some(d);
                    update
                }
            }
        })?;

        if let Some(state) = unclaimed {
            return Err(ReachClawError::InvalidState(format!(
                "message {id} is {state}, not sending"
            )));
        }
        self.log_outcome(&msg, outcome, decision.as_ref());
        Ok(msg)
    }

    /// Apply a provider failure decision; returns the account change.
    fn apply(&self, msg: &mut QueuedMessage, decision: &Decision, now: DateTime<Utc>) -> Option<AccountUpdate> {
        msg.last_error_class = Some(decision.error_class());
        msg.last_error = Some(decision.reason().to_string());
        let exhausted = msg.attempts >= self.max_attempts;

        let retry_at = match decision {
            Decision::Permanent { .. } => None,
            Decision::TransientWait { wait, .. } => Some(after(now, *wait)),
            Decision::UnknownRetry { backoff, .. } => Some(after(now, *backoff)),
        };
        match retry_at {
            Some(at) if !exhausted => {
                msg.state = MessageState::Retrying;
                msg.next_eligible_at = at;
            }
            Some(_) => {
                msg.state = MessageState::Failed;
                msg.last_error = Some(format!(
                    "{} (gave up after {} attempts)",
                    decision.reason(),
                    msg.attempts
                ));
            }
            None => msg.state = MessageState::Failed,
        }

        match decision {
            Decision::TransientWait {
                wait,
                account_wide: true,
                reason,
            } => Some(AccountUpdate::rate_limited(after(now, *wait), reason.clone())),
            Decision::Permanent {
                effect: AccountEffect::Restrict(rest),
                reason,
            } => Some(AccountUpdate::rate_limited(after(now, *rest), reason.clone())),
            Decision::Permanent {
                effect: AccountEffect::Disable,
                reason,
            } => Some(AccountUpdate::disabled(reason.clone())),
            _ => None,
        }
    }

    fn log_outcome(&self, msg: &QueuedMessage, outcome: &SendOutcome, decision: Option<&Decision>) {
        match (msg.state, outcome) {
            (MessageState::Sent, SendOutcome::Sent { .. }) => {
                tracing::info!(id = msg.id, account = %msg.account_id, "✅ Message sent")
            }
            (MessageState::Retrying, SendOutcome::Local(e)) => tracing::warn!(
                id = msg.id,
                account = %msg.account_id,
                local_retries = msg.local_retries,
                "🔌 Local failure, retrying at {}: {e}",
                msg.next_eligible_at
            ),
            (MessageState::Retrying, _) => tracing::info!(
                id = msg.id,
                account = %msg.account_id,
                attempts = msg.attempts,
                "⏳ Retrying at {}: {}",
                msg.next_eligible_at,
                msg.last_error.as_deref().unwrap_or_default()
            ),
            (MessageState::Failed, _) => tracing::warn!(
                id = msg.id,
                account = %msg.account_id,
                attempts = msg.attempts,
                "❌ Message failed: {}",
                msg.last_error.as_deref().unwrap_or_default()
            ),
            _ => {}
        }
        match decision {
            Some(Decision::Permanent {
                effect: AccountEffect::Disable,
                reason,
            }) => tracing::warn!(account = %msg.account_id, "⛔ Account disabled: {reason}"),
            Some(Decision::Permanent {
                effect: AccountEffect::Restrict(rest),
                reason,
            }) => tracing::warn!(account = %msg.account_id, "🧊 Account restricted for {rest:?}: {reason}"),
            Some(Decision::TransientWait {
                wait,
                account_wide: true,
                ..
            }) => tracing::info!(account = %msg.account_id, "🌊 Account rate limited for {wait:?}"),
            _ => {}
        }
    }

    /// Cancel a message that is not in flight. Terminal messages are
    /// returned unchanged; `sending` cannot be cancelled.
    pub fn cancel(&self, scope: &Scope, id: i64) -> Result<QueuedMessage> {
        self.cancel_at(scope, id, Utc::now())
    }

    pub fn cancel_at(&self, scope: &Scope, id: i64, now: DateTime<Utc>) -> Result<QueuedMessage> {
        self.db.get_message(scope, id)?;
        let mut in_flight = false;
        let mut cancelled = false;
        let msg = self.db.update_message(id, |msg| {
            match msg.state {
                MessageState::Pending | MessageState::Retrying => {
                    msg.state = MessageState::Expired;
                    msg.last_error = Some("cancelled".into());
                    msg.updated_at = now;
                    cancelled = true;
                }
                MessageState::Sending => in_flight = true,
                _ => {}
            }
            None
        })?;
        if in_flight {
            return Err(ReachClawError::InvalidState(format!(
                "message {id} is being sent and cannot be cancelled"
            )));
        }
        if cancelled {
            tracing::info!(id, account = %msg.account_id, "🚫 Message cancelled");
        }
        Ok(msg)
    }

    /// Treat claims older than the staleness threshold as transient
    /// failures: one attempt charged, eligible again right away.
    pub fn recover_stale(&self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now - chrono::Duration::from_std(self.stale_after).unwrap_or(chrono::Duration::zero());
        let mut recovered = 0;
        for id in self.db.stale_sending(cutoff)? {
            let msg = self.db.update_message(id, |msg| {
                if msg.state != MessageState::Sending {
                    return None;
                }
                msg.attempts += 1;
                msg.updated_at = now;
                msg.last_error_class = Some(ErrorClass::TransientProvider);
                if msg.attempts >= self.max_attempts {
                    msg.state = MessageState::Failed;
                    msg.last_error = Some(format!("send outcome lost (gave up after {} attempts)", msg.attempts));
                } else {
                    msg.state = MessageState::Retrying;
                    msg.next_eligible_at = now;
                    msg.last_error = Some("send outcome lost, retrying".into());
                }
                None
            })?;
            tracing::warn!(id, account = %msg.account_id, state = %msg.state, "♻️ Recovered stale send");
            recovered += 1;
        }
        Ok(recovered)
    }

    pub fn stats(&self, scope: &Scope) -> Result<QueueCounts> {
        self.db.count_by_state(scope)
    }

    pub fn list(&self, scope: &Scope, state: Option<MessageState>, limit: usize) -> Result<Vec<QueuedMessage>> {
        self.db.list_messages(scope, state, limit)
    }

    pub fn get(&self, scope: &Scope, id: i64) -> Result<QueuedMessage> {
        self.db.get_message(scope, id)
    }
}

impl MetricsSource for DispatchQueue {
    fn metrics(&self, now: DateTime<Utc>) -> Result<Metrics> {
        let c = self.db.fleet_counts(now - chrono::Duration::hours(1))?;
        let gauges = [
            ("queue.pending", c.queue.pending),
            ("queue.retrying", c.queue.retrying),
            ("queue.sending", c.queue.sending),
            ("queue.failed_1h", c.failed_since),
            ("queue.sent_1h", c.sent_since),
            ("accounts.active", c.accounts_active),
            ("accounts.warming_up", c.accounts_warming_up),
            ("accounts.rate_limited", c.accounts_rate_limited),
            ("accounts.disabled", c.accounts_disabled),
        ];
        Ok(gauges.into_iter().map(|(k, v)| (k.to_string(), v as f64)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use reachclaw_core::traits::ProviderError;
    use reachclaw_core::types::{Account, AccountRole, Priority, TenantId};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).unwrap()
    }

    fn secs(n: i64) -> chrono::Duration {
        chrono::Duration::seconds(n)
    }

    fn setup_with(config: ReachClawConfig) -> (DispatchQueue, AccountId) {
        let db = Arc::new(FleetDb::open_in_memory(false).unwrap());
        let mut a = Account::new(TenantId::new("t1"), "a1", "+8490", AccountRole::Sender, Some("s".into()));
        a.status = AccountStatus::Active;
        a.warmup_stage = 0;
        db.insert_account(&a).unwrap();
        (DispatchQueue::new(db, &config), a.id)
    }

    fn setup() -> (DispatchQueue, AccountId) {
        setup_with(ReachClawConfig::default())
    }

    fn msg(text: &str) -> NewMessage {
        NewMessage::text(TenantId::new("t1"), AccountId::new("a1"), "@lan", text)
    }

    fn flood(n: u64) -> SendOutcome {
        SendOutcome::Provider(ProviderError::new(format!("FLOOD_WAIT_{n}")))
    }

    #[test]
    fn test_round_trip() {
        let (q, a) = setup();
        let m = q.enqueue_at(msg("hello"), t0()).unwrap();
        let claimed = q.next_at(&a, t0()).unwrap().unwrap();
        assert_eq!(claimed.id, m.id);
        assert_eq!(claimed.state, MessageState::Sending);

        let done = q.report_result_at(m.id, &SendOutcome::sent(), t0()).unwrap();
        assert_eq!(done.state, MessageState::Sent);
        assert_eq!(done.sent_at, Some(t0()));
        assert!(q.next_at(&a, t0() + secs(3600)).unwrap().is_none());
    }

    #[test]
    fn test_transient_wait_is_exact() {
        let (q, a) = setup();
        let m = q.enqueue_at(msg("x"), t0()).unwrap();
        q.next_at(&a, t0()).unwrap().unwrap();
        let out = q.report_result_at(m.id, &flood(30), t0()).unwrap();

        assert_eq!(out.state, MessageState::Retrying);
        assert_eq!(out.attempts, 1);
        assert_eq!(out.next_eligible_at, t0() + secs(30));
        assert_eq!(out.last_error_class, Some(ErrorClass::TransientProvider));

        let account = q.db().account(&a).unwrap().unwrap();
        assert_eq!(account.status, AccountStatus::RateLimited);
        assert_eq!(account.rate_limited_until, Some(t0() + secs(30)));

        assert!(q.next_at(&a, t0() + secs(29)).unwrap().is_none());
        let again = q.next_at(&a, t0() + secs(30)).unwrap().unwrap();
        assert_eq!(again.id, m.id);
        assert_eq!(q.db().account(&a).unwrap().unwrap().status, AccountStatus::Active);
    }

    #[test]
    fn test_report_twice_is_noop() {
        let (q, a) = setup();
        let m = q.enqueue_at(msg("x"), t0()).unwrap();
        q.next_at(&a, t0()).unwrap();
        let first = q.report_result_at(m.id, &SendOutcome::sent(), t0()).unwrap();
        let second = q.report_result_at(m.id, &SendOutcome::sent(), t0() + secs(5)).unwrap();
        assert_eq!(first, second);

        let late_failure = q.report_result_at(m.id, &flood(10), t0() + secs(6)).unwrap();
        assert_eq!(late_failure, first);
    }

    #[test]
    fn test_report_on_unclaimed_message_rejected() {
        let (q, _) = setup();
        let m = q.enqueue_at(msg("x"), t0()).unwrap();
        assert!(matches!(
            q.report_result_at(m.id, &SendOutcome::sent(), t0()),
            Err(ReachClawError::InvalidState(_))
        ));
        assert_eq!(q.get(&Scope::tenant("t1"), m.id).unwrap().state, MessageState::Pending);
    }

    #[test]
    fn test_attempt_ceiling_fails_message() {
        let mut config = ReachClawConfig::default();
        config.dispatch.max_attempts = 2;
        let (q, a) = setup_with(config);
        let m = q.enqueue_at(msg("x"), t0()).unwrap();
        let slowmode = SendOutcome::Provider(ProviderError::new("SLOWMODE_WAIT_5"));

        q.next_at(&a, t0()).unwrap().unwrap();
        assert_eq!(q.report_result_at(m.id, &slowmode, t0()).unwrap().state, MessageState::Retrying);
        q.next_at(&a, t0() + secs(5)).unwrap().unwrap();
        let out = q.report_result_at(m.id, &slowmode, t0() + secs(5)).unwrap();
        assert_eq!(out.state, MessageState::Failed);
        assert_eq!(out.attempts, 2);
        assert!(out.last_error.unwrap().contains("gave up after 2 attempts"));
    }

    #[test]
    fn test_unknown_error_backs_off_within_bounds() {
        let (q, a) = setup();
        let m = q.enqueue_at(msg("x"), t0()).unwrap();
        q.next_at(&a, t0()).unwrap();
        let out = q
            .report_result_at(m.id, &SendOutcome::Provider(ProviderError::new("RPC_MCGET_FAIL")), t0())
            .unwrap();
        assert_eq!(out.state, MessageState::Retrying);
        assert_eq!(out.last_error_class, Some(ErrorClass::ClassifierUnknown));
        let wait = out.next_eligible_at - t0();
        assert!(wait >= secs(24) && wait <= secs(36), "{wait}");
        assert_eq!(q.db().account(&a).unwrap().unwrap().status, AccountStatus::Active);
    }

    #[test]
    fn test_local_failure_does_not_charge_attempts() {
        let (q, a) = setup();
        let m = q.enqueue_at(msg("x"), t0()).unwrap();
        q.next_at(&a, t0()).unwrap();
        let out = q
            .report_result_at(m.id, &SendOutcome::Local("proxy refused".into()), t0())
            .unwrap();
        assert_eq!(out.state, MessageState::Retrying);
        assert_eq!(out.attempts, 0);
        assert_eq!(out.local_retries, 1);
        assert_eq!(out.next_eligible_at, t0() + secs(30));
        assert_eq!(out.last_error_class, Some(ErrorClass::LocalResource));
    }

    #[test]
    fn test_permanent_errors_and_account_effects() {
        let (q, a) = setup();
        let first = q.enqueue_at(msg("1"), t0()).unwrap();
        let second = q.enqueue_at(msg("2"), t0()).unwrap();

        q.next_at(&a, t0()).unwrap();
        let out = q
            .report_result_at(first.id, &SendOutcome::Provider(ProviderError::new("USER_PRIVACY_RESTRICTED")), t0())
            .unwrap();
        assert_eq!(out.state, MessageState::Failed);
        assert_eq!(q.db().account(&a).unwrap().unwrap().status, AccountStatus::Active);

        q.next_at(&a, t0()).unwrap();
        q.report_result_at(second.id, &SendOutcome::Provider(ProviderError::new("PEER_FLOOD")), t0())
            .unwrap();
        let account = q.db().account(&a).unwrap().unwrap();
        assert_eq!(account.status, AccountStatus::RateLimited);
        assert_eq!(account.rate_limited_until, Some(t0() + secs(86_400)));

        let third = q.enqueue_at(msg("3"), t0()).unwrap();
        assert!(q.next_at(&a, t0() + secs(3600)).unwrap().is_none());
        q.next_at(&a, t0() + secs(86_400)).unwrap().unwrap();
        q.report_result_at(third.id, &SendOutcome::Provider(ProviderError::new("AUTH_KEY_UNREGISTERED")), t0())
            .unwrap();
        let account = q.db().account(&a).unwrap().unwrap();
        assert_eq!(account.status, AccountStatus::Disabled);
        assert_eq!(account.status_reason.as_deref(), Some("AUTH_KEY_UNREGISTERED"));
    }

    #[test]
    fn test_one_send_in_flight_per_lane() {
        let (q, a) = setup();
        q.enqueue_at(msg("1"), t0()).unwrap();
        q.enqueue_at(msg("2"), t0()).unwrap();
        assert!(q.next_at(&a, t0()).unwrap().is_some());
        assert!(q.next_at(&a, t0()).unwrap().is_none());
    }

    #[test]
    fn test_fifo_within_priority() {
        let (q, a) = setup();
        let n1 = q.enqueue_at(msg("n1"), t0()).unwrap();
        let n2 = q.enqueue_at(msg("n2"), t0()).unwrap();
        let high = q.enqueue_at(msg("h").with_priority(Priority::High), t0() + secs(1)).unwrap();

        let mut order = Vec::new();
        let mut now = t0() + secs(1);
        while let Some(m) = q.next_at(&a, now).unwrap() {
            order.push(m.id);
            q.report_result_at(m.id, &SendOutcome::sent(), now).unwrap();
            now += secs(10);
        }
        assert_eq!(order, vec![high.id, n1.id, n2.id]);
    }

    #[test]
    fn test_minute_budget() {
        let mut config = ReachClawConfig::default();
        config.dispatch.max_messages_per_minute = 2;
        let (q, a) = setup_with(config);
        for i in 0..3 {
            q.enqueue_at(msg(&i.to_string()), t0()).unwrap();
        }
        for _ in 0..2 {
            let m = q.next_at(&a, t0()).unwrap().unwrap();
            q.report_result_at(m.id, &SendOutcome::sent(), t0()).unwrap();
        }
        assert!(q.next_at(&a, t0() + secs(30)).unwrap().is_none());
        assert!(q.next_at(&a, t0() + secs(61)).unwrap().is_some());
    }

    #[test]
    fn test_warmup_daily_limit() {
        let db = Arc::new(FleetDb::open_in_memory(false).unwrap());
        let a = Account::new(TenantId::new("t1"), "a1", "+8490", AccountRole::Sender, Some("s".into()));
        db.insert_account(&a).unwrap();
        let mut config = ReachClawConfig::default();
        config.warmup.daily_limits = vec![1, 5];
        let q = DispatchQueue::new(db, &config);

        q.enqueue_at(msg("1"), t0()).unwrap();
        q.enqueue_at(msg("2"), t0()).unwrap();
        let m = q.next_at(&a.id, t0()).unwrap().unwrap();
        q.report_result_at(m.id, &SendOutcome::sent(), t0()).unwrap();
        assert!(q.next_at(&a.id, t0() + secs(7200)).unwrap().is_none());
        // Budget resets at 00:00 UTC.
        assert!(q.next_at(&a.id, t0() + secs(15 * 3600)).unwrap().is_some());
    }

    #[test]
    fn test_cancel() {
        let (q, a) = setup();
        let scope = Scope::tenant("t1");
        let pending = q.enqueue_at(msg("p"), t0()).unwrap();
        let out = q.cancel_at(&scope, pending.id, t0()).unwrap();
        assert_eq!(out.state, MessageState::Expired);
        assert_eq!(out.last_error.as_deref(), Some("cancelled"));
        // Terminal: unchanged.
        assert_eq!(q.cancel_at(&scope, pending.id, t0() + secs(1)).unwrap(), out);

        let inflight = q.enqueue_at(msg("s"), t0()).unwrap();
        q.next_at(&a, t0()).unwrap().unwrap();
        assert!(matches!(q.cancel_at(&scope, inflight.id, t0()), Err(ReachClawError::InvalidState(_))));

        q.report_result_at(inflight.id, &flood(60), t0()).unwrap();
        assert_eq!(q.cancel_at(&scope, inflight.id, t0()).unwrap().state, MessageState::Expired);

        assert!(matches!(
            q.cancel(&Scope::tenant("t2"), inflight.id),
            Err(ReachClawError::NotFound(_))
        ));
    }

    #[test]
    fn test_recover_stale_claims() {
        let (q, a) = setup();
        let m = q.enqueue_at(msg("x"), t0()).unwrap();
        q.next_at(&a, t0()).unwrap().unwrap();

        assert_eq!(q.recover_stale(t0() + secs(60)).unwrap(), 0);
        let later = t0() + secs(301);
        assert_eq!(q.recover_stale(later).unwrap(), 1);
        let out = q.get(&Scope::tenant("t1"), m.id).unwrap();
        assert_eq!(out.state, MessageState::Retrying);
        assert_eq!(out.attempts, 1);
        assert_eq!(out.next_eligible_at, later);
        assert_eq!(q.next_at(&a, later).unwrap().unwrap().id, m.id);
    }

    #[test]
    fn test_late_sent_after_stale_recovery_is_kept() {
        let (q, a) = setup();
        let m = q.enqueue_at(msg("x"), t0()).unwrap();
        q.next_at(&a, t0()).unwrap().unwrap();
        assert_eq!(q.recover_stale(t0() + secs(301)).unwrap(), 1);

        let done = q.report_result_at(m.id, &SendOutcome::sent(), t0() + secs(400)).unwrap();
        assert_eq!(done.state, MessageState::Sent);
        assert_eq!(done.sent_at, Some(t0() + secs(400)));
        // Nothing left to claim: the message goes out once.
        assert!(q.next_at(&a, t0() + secs(401)).unwrap().is_none());
    }

    #[test]
    fn test_late_failure_after_stale_recovery_is_rejected() {
        let (q, a) = setup();
        let m = q.enqueue_at(msg("x"), t0()).unwrap();
        q.next_at(&a, t0()).unwrap().unwrap();
        q.recover_stale(t0() + secs(301)).unwrap();

        assert!(matches!(
            q.report_result_at(m.id, &flood(10), t0() + secs(400)),
            Err(ReachClawError::InvalidState(_))
        ));
        let out = q.get(&Scope::tenant("t1"), m.id).unwrap();
        assert_eq!(out.state, MessageState::Retrying);
        assert_eq!(out.attempts, 1);
    }

    #[test]
    fn test_sent_report_rejected_for_ordinary_retry() {
        let (q, a) = setup();
        let m = q.enqueue_at(msg("x"), t0()).unwrap();
        q.next_at(&a, t0()).unwrap().unwrap();
        let out = q.report_result_at(m.id, &SendOutcome::Local("db busy".into()), t0()).unwrap();
        assert_eq!(out.claimed_at, None);
        assert!(matches!(
            q.report_result_at(m.id, &SendOutcome::sent(), t0() + secs(1)),
            Err(ReachClawError::InvalidState(_))
        ));
    }

    #[test]
    fn test_enqueue_validation() {
        let (q, _) = setup();
        let mut empty = msg("x");
        empty.target = "  ".into();
        assert!(matches!(q.enqueue(empty), Err(ReachClawError::InvalidState(_))));
        let mut ghost = msg("x");
        ghost.account_id = AccountId::new("nope");
        assert!(matches!(q.enqueue(ghost), Err(ReachClawError::NotFound(_))));
    }

    #[test]
    fn test_metrics_gauges() {
        let (q, a) = setup();
        let now = Utc::now();
        let m = q.enqueue_at(msg("1"), now).unwrap();
        q.enqueue_at(msg("2"), now).unwrap();
        q.next_at(&a, now).unwrap();
        q.report_result_at(m.id, &SendOutcome::Provider(ProviderError::new("PEER_ID_INVALID")), now)
            .unwrap();

        let g = q.metrics(now).unwrap();
        assert_eq!(g["queue.pending"], 1.0);
        assert_eq!(g["queue.failed_1h"], 1.0);
        assert_eq!(g["queue.sent_1h"], 0.0);
        assert_eq!(g["accounts.active"], 1.0);
        assert_eq!(q.stats(&Scope::tenant("t1")).unwrap().failed, 1);
        assert_eq!(q.list(&Scope::tenant("t1"), None, 10).unwrap().len(), 2);
    }
}
