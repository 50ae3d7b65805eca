//! The dispatcher tick loop driving connects, sends and inbound streams.
//!
//! Per tick:
//! 1. recover stale `sending` claims,
//! 2. advance warm-up once per UTC day,
//! 3. connect accounts whose slot (service start + `delay_for`) has arrived
//!    and that the concurrency gate admits,
//! 4. run one claim → send → report cycle per idle connected lane.
//!
//! Connects and sends hold a permit of the global ceiling and run on their
//! own tasks; every platform call is bounded by a timeout.

use chrono::{DateTime, NaiveDate, Utc};
use reachclaw_core::config::ReachClawConfig;
use reachclaw_core::error::Result;
use reachclaw_core::traits::{ChatPlatform, InboundStream, PlatformFailure, SendOutcome, SessionHandle};
use reachclaw_core::types::{Account, AccountId, AccountStatus, MessageState};
use reachclaw_db::{AccountUpdate, FleetDb};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OwnedSemaphorePermit;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::connect::ConnectionScheduler;
use crate::failure::{AccountEffect, Decision};
use crate::inbound::InboundPipeline;
use crate::lanes::LaneBoard;
use crate::queue::{DispatchQueue, after};

pub struct Dispatcher {
    db: Arc<FleetDb>,
    queue: Arc<DispatchQueue>,
    platform: Arc<dyn ChatPlatform>,
    inbound: Arc<InboundPipeline>,
    connect: ConnectionScheduler,
    lanes: Arc<LaneBoard>,
    started_at: DateTime<Utc>,
    tick_interval: Duration,
    connect_timeout: Duration,
    send_timeout: Duration,
    reconnect_backoff: Duration,
    warmed_on: Mutex<Option<NaiveDate>>,
    tasks: TaskTracker,
}

impl Dispatcher {
    pub fn new(
        config: &ReachClawConfig,
        queue: Arc<DispatchQueue>,
        platform: Arc<dyn ChatPlatform>,
        inbound: Arc<InboundPipeline>,
    ) -> Self {
        Self {
            db: queue.db().clone(),
            queue,
            platform,
            inbound,
            connect: ConnectionScheduler::new(&config.connect),
            lanes: Arc::new(LaneBoard::new(config.dispatch.max_concurrent_connections)),
            started_at: Utc::now(),
            tick_interval: Duration::from_millis(config.dispatch.tick_interval_ms.max(1)),
            connect_timeout: config.dispatch.connect_timeout(),
            send_timeout: config.dispatch.send_timeout(),
            reconnect_backoff: config.dispatch.default_backoff(),
            warmed_on: Mutex::new(None),
            tasks: TaskTracker::new(),
        }
    }

    /// Anchor connection slots at `at` instead of now.
    pub fn with_started_at(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = at;
        self
    }

    pub fn lanes(&self) -> &Arc<LaneBoard> {
        &self.lanes
    }

    pub fn connect_scheduler(&self) -> &ConnectionScheduler {
        &self.connect
    }

    /// Tick until `cancel` fires, then let in-flight sends finish (bounded by
    /// the send timeout) and close every session.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(
            "🚀 Dispatcher started on {} (tick {:?}, ceiling {})",
            self.platform.name(),
            self.tick_interval,
            self.lanes.max_concurrent()
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick(Utc::now(), &cancel).await {
                        tracing::error!("Dispatcher tick failed: {e}");
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
        self.shutdown().await;
    }

    async fn shutdown(&self) {
        tracing::info!("🛑 Dispatcher stopping, waiting for in-flight sends");
        self.tasks.close();
        let grace = self.send_timeout + self.connect_timeout;
        if tokio::time::timeout(grace, self.tasks.wait()).await.is_err() {
            tracing::warn!("In-flight tasks still running after {grace:?}; their claims recover as stale");
        }
        for session in self.lanes.take_sessions().await {
            match tokio::time::timeout(self.connect_timeout, self.platform.disconnect(&session)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(account = %session.account_id, "Disconnect failed: {e}"),
                Err(_) => tracing::warn!(account = %session.account_id, "Disconnect timed out"),
            }
        }
    }

    /// One pass of the loop. Public for tests and single-shot runs.
    pub async fn tick(self: &Arc<Self>, now: DateTime<Utc>, cancel: &CancellationToken) -> Result<()> {
        let recovered = self.queue.recover_stale(now)?;
        if recovered > 0 {
            tracing::info!(recovered, "♻️ Stale claims recovered");
        }
        self.advance_warmup(now.date_naive())?;

        let accounts = self.db.dispatch_accounts()?;
        self.drop_unusable_sessions(&accounts, now).await;
        self.admit_connects(&accounts, now, cancel).await;
        self.start_sends(now).await?;
        Ok(())
    }

    fn advance_warmup(&self, today: NaiveDate) -> Result<()> {
        let advanced = once_per_day(&self.warmed_on, today, || {
            let policy = self.queue.warmup();
            let mut advanced = 0;
            for mut account in self.db.dispatch_accounts()? {
                if policy.advance(&mut account, today) {
                    self.db.record_warmup(&account)?;
                    advanced += 1;
                }
            }
            Ok(advanced)
        })?;
        if let Some(advanced) = advanced {
            tracing::debug!(advanced, %today, "🌱 Warm-up counters advanced");
        }
        Ok(())
    }

    /// Close sessions of accounts that were disabled meanwhile.
    async fn drop_unusable_sessions(&self, accounts: &[Account], now: DateTime<Utc>) {
        for account in accounts.iter().filter(|a| a.status == AccountStatus::Disabled) {
            if let Some(session) = self.lanes.disconnected(&account.id, now).await {
                tracing::info!(account = %account.id, "⛔ Closing session of disabled account");
                match tokio::time::timeout(self.connect_timeout, self.platform.disconnect(&session)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::warn!(account = %account.id, "Disconnect failed: {e}"),
                    Err(_) => tracing::warn!(account = %account.id, "Disconnect timed out"),
                }
            }
        }
    }

    async fn admit_connects(self: &Arc<Self>, accounts: &[Account], now: DateTime<Utc>, cancel: &CancellationToken) {
        let connectable: Vec<&Account> = accounts.iter().filter(|a| a.is_connectable(now)).collect();
        self.connect.set_pool_size(connectable.len());
        let ceiling = self.lanes.max_concurrent();

        for account in connectable {
            let slot = after(self.started_at, self.connect.delay_for(&account.id));
            if now < slot || !self.lanes.may_connect(&account.id, now).await {
                continue;
            }
            if self.connect.should_defer_at(&account.id, ceiling, now) {
                tracing::trace!(account = %account.id, "connect deferred this round");
                continue;
            }
            let Some(permit) = self.lanes.try_permit() else {
                break;
            };
            if !self.lanes.begin_connect(&account.id, now).await {
                continue;
            }
            let this = Arc::clone(self);
            let account = account.clone();
            let cancel = cancel.clone();
            self.tasks.spawn(async move { this.connect_lane(account, permit, cancel).await });
        }
    }

    async fn connect_lane(self: Arc<Self>, account: Account, permit: OwnedSemaphorePermit, cancel: CancellationToken) {
        let result = match tokio::time::timeout(self.connect_timeout, self.platform.connect(&account)).await {
            Ok(r) => r,
            Err(_) => Err(PlatformFailure::Local(format!("connect timed out after {:?}", self.connect_timeout))),
        };
        drop(permit);

        let session = match result {
            Ok(session) => session,
            Err(failure) => {
                self.connect_failed(&account, failure).await;
                return;
            }
        };
        if let Err(e) = self.db.record_connect(&account.id, session.connected_at) {
            tracing::warn!(account = %account.id, "Could not record connect: {e}");
        }
        tracing::info!(account = %account.id, session = %session.session_id, "🔗 Connected");
        self.lanes.connected(session.clone()).await;

        let stream = match tokio::time::timeout(self.connect_timeout, self.platform.receive(&session)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                tracing::warn!(account = %account.id, "Inbound stream unavailable: {e}");
                return;
            }
            Err(_) => {
                tracing::warn!(account = %account.id, "Inbound stream open timed out");
                return;
            }
        };
        let this = Arc::clone(&self);
        self.tasks.spawn(async move { this.consume_inbound(session, stream, cancel).await });
    }

    async fn connect_failed(&self, account: &Account, failure: PlatformFailure) {
        let now = Utc::now();
        let mut retry_at = after(now, self.reconnect_backoff);
        if let PlatformFailure::Provider(err) = &failure {
            let update = match self.queue.classifier().classify(err, 1) {
                Decision::Permanent {
                    effect: AccountEffect::Disable,
                    reason,
                } => Some(AccountUpdate::disabled(reason)),
                Decision::Permanent {
                    effect: AccountEffect::Restrict(rest),
                    reason,
                } => Some(AccountUpdate::rate_limited(after(now, rest), reason)),
                Decision::TransientWait { wait, reason, .. } => {
                    retry_at = after(now, wait);
                    Some(AccountUpdate::rate_limited(retry_at, reason))
                }
                _ => None,
            };
            if let Some(update) = update {
                if let Err(e) = self.db.update_account_status(&account.id, &update) {
                    tracing::warn!(account = %account.id, "Could not record connect failure: {e}");
                }
            }
        }
        tracing::warn!(account = %account.id, "🔌 Connect failed, retry at {retry_at}: {failure}");
        self.lanes.disconnected(&account.id, retry_at).await;
    }

    async fn consume_inbound(
        self: Arc<Self>,
        session: SessionHandle,
        mut stream: InboundStream,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                next = stream.next() => match next {
                    Some(msg) => {
                        if let Err(e) = self.inbound.handle(&msg) {
                            tracing::warn!(account = %session.account_id, "Inbound message dropped: {e}");
                        }
                    }
                    None => break,
                },
                _ = cancel.cancelled() => return,
            }
        }
        tracing::info!(account = %session.account_id, "📴 Inbound stream ended, session dropped");
        // The account reconnects on a later tick.
        let retry_at = after(Utc::now(), self.reconnect_backoff);
        self.lanes.disconnected(&session.account_id, retry_at).await;
    }

    async fn start_sends(self: &Arc<Self>, now: DateTime<Utc>) -> Result<()> {
        let idle = self.lanes.idle_connected().await;
        if idle.is_empty() {
            return Ok(());
        }
        let with_work: HashSet<AccountId> = self.db.accounts_with_work(now)?.into_iter().collect();
        for id in idle.into_iter().filter(|id| with_work.contains(id)) {
            let Some(permit) = self.lanes.try_permit() else {
                break;
            };
            let Some(session) = self.lanes.begin_send(&id).await else {
                continue;
            };
            let this = Arc::clone(self);
            self.tasks.spawn(async move { this.send_cycle(session, permit).await });
        }
        Ok(())
    }

    /// claim → send → report for one lane.
    async fn send_cycle(self: Arc<Self>, session: SessionHandle, permit: OwnedSemaphorePermit) {
        let account = session.account_id.clone();
        let sent = match self.queue.next(&account) {
            Ok(Some(msg)) => {
                let text = msg.payload.render();
                let outcome = match tokio::time::timeout(
                    self.send_timeout,
                    self.platform.send(&session, &msg.target, &text),
                )
                .await
                {
                    Ok(outcome) => outcome,
                    Err(_) => SendOutcome::Local(format!("send timed out after {:?}", self.send_timeout)),
                };
                match self.queue.report_result(msg.id, &outcome) {
                    Ok(done) => Some(done.state == MessageState::Sent),
                    Err(e) => {
                        // Left in `sending`; recovered as stale later.
                        tracing::error!(id = msg.id, account = %account, "Could not record send result: {e}");
                        Some(false)
                    }
                }
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(account = %account, "Claim failed: {e}");
                None
            }
        };
        drop(permit);
        self.lanes.end_send(&account, sent).await;
    }
}

/// Run `f` unless it already succeeded for `today`. The day is stamped only
/// after success, so a failed run is retried on the next tick.
fn once_per_day<T>(
    latch: &Mutex<Option<NaiveDate>>,
    today: NaiveDate,
    f: impl FnOnce() -> Result<T>,
) -> Result<Option<T>> {
    if latch.lock().map(|last| *last == Some(today)).unwrap_or(true) {
        return Ok(None);
    }
    let out = f()?;
    if let Ok(mut last) = latch.lock() {
        *last = Some(today);
    }
    Ok(Some(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use reachclaw_core::error::ReachClawError;

    #[test]
    fn test_daily_run_retried_after_failure() {
        let latch = Mutex::new(None);
        let day = NaiveDate::from_ymd_opt(2026, 10, 19).unwrap();

        let failed: Result<Option<()>> = once_per_day(&latch, day, || Err(ReachClawError::database("busy")));
        assert!(failed.is_err());
        assert_eq!(*latch.lock().unwrap(), None);

        assert_eq!(once_per_day(&latch, day, || Ok(3)).unwrap(), Some(3));
        assert_eq!(once_per_day(&latch, day, || Ok(4)).unwrap(), None);

        let next = day.succ_opt().unwrap();
        assert_eq!(once_per_day(&latch, next, || Ok(5)).unwrap(), Some(5));
    }
}
