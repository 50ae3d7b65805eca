//! Account lanes: per-account session state plus the global ceiling.
//!
//! Each account is one lane: at most one connect or send in progress at a
//! time. Across lanes a semaphore of `max_concurrent_connections` permits
//! bounds how many accounts connect or send at once.

use chrono::{DateTime, Utc};
use reachclaw_core::traits::SessionHandle;
use reachclaw_core::types::AccountId;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

/// Where a lane stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LanePhase {
    /// No session; may connect once `reconnect_at` has passed.
    Disconnected,
    Connecting,
    /// Session open, no send running.
    Connected,
    Sending,
}

struct LaneState {
    phase: LanePhase,
    session: Option<SessionHandle>,
    reconnect_at: Option<DateTime<Utc>>,
    total_sent: u64,
    total_failed: u64,
}

impl LaneState {
    fn new() -> Self {
        Self {
            phase: LanePhase::Disconnected,
            session: None,
            reconnect_at: None,
            total_sent: 0,
            total_failed: 0,
        }
    }

    fn may_connect(&self, now: DateTime<Utc>) -> bool {
        self.phase == LanePhase::Disconnected && self.reconnect_at.is_none_or(|at| at <= now)
    }
}

/// Snapshot of one lane.
#[derive(Debug, Clone, Serialize)]
pub struct LaneStats {
    pub account_id: AccountId,
    pub phase: LanePhase,
    pub reconnect_at: Option<DateTime<Utc>>,
    pub total_sent: u64,
    pub total_failed: u64,
}

pub struct LaneBoard {
    lanes: Mutex<HashMap<AccountId, LaneState>>,
    permits: Arc<Semaphore>,
    max_concurrent: usize,
}

impl LaneBoard {
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            lanes: Mutex::new(HashMap::new()),
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Take one slot of the global ceiling, if free.
    pub fn try_permit(&self) -> Option<OwnedSemaphorePermit> {
        self.permits.clone().try_acquire_owned().ok()
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Move a lane to `Connecting` if it may connect at `now`.
    pub async fn begin_connect(&self, id: &AccountId, now: DateTime<Utc>) -> bool {
        let mut lanes = self.lanes.lock().await;
        let lane = lanes.entry(id.clone()).or_insert_with(LaneState::new);
        if !lane.may_connect(now) {
            return false;
        }
        lane.phase = LanePhase::Connecting;
        true
    }

    pub async fn may_connect(&self, id: &AccountId, now: DateTime<Utc>) -> bool {
        let lanes = self.lanes.lock().await;
        lanes.get(id).is_none_or(|lane| lane.may_connect(now))
    }

    pub async fn connected(&self, session: SessionHandle) {
        let mut lanes = self.lanes.lock().await;
        let lane = lanes.entry(session.account_id.clone()).or_insert_with(LaneState::new);
        lane.phase = LanePhase::Connected;
        lane.reconnect_at = None;
        lane.session = Some(session);
    }

    /// Drop the session and hold off reconnecting until `retry_at`. Returns
    /// the session that was open, if any.
    pub async fn disconnected(&self, id: &AccountId, retry_at: DateTime<Utc>) -> Option<SessionHandle> {
        let mut lanes = self.lanes.lock().await;
        let lane = lanes.entry(id.clone()).or_insert_with(LaneState::new);
        lane.phase = LanePhase::Disconnected;
        lane.reconnect_at = Some(retry_at);
        lane.session.take()
    }

    /// Start a send on a connected, idle lane.
    pub async fn begin_send(&self, id: &AccountId) -> Option<SessionHandle> {
        let mut lanes = self.lanes.lock().await;
        let lane = lanes.get_mut(id)?;
        if lane.phase != LanePhase::Connected {
            return None;
        }
        let session = lane.session.clone()?;
        lane.phase = LanePhase::Sending;
        Some(session)
    }

    /// Finish a send. `sent` is `None` when nothing was claimed.
    pub async fn end_send(&self, id: &AccountId, sent: Option<bool>) {
        let mut lanes = self.lanes.lock().await;
        if let Some(lane) = lanes.get_mut(id) {
            if lane.phase == LanePhase::Sending {
                lane.phase = LanePhase::Connected;
            }
            match sent {
                Some(true) => lane.total_sent += 1,
                Some(false) => lane.total_failed += 1,
                None => {}
            }
        }
    }

    /// Accounts with an open session and no send running.
    pub async fn idle_connected(&self) -> Vec<AccountId> {
        let lanes = self.lanes.lock().await;
        let mut ids: Vec<AccountId> = lanes
            .iter()
            .filter(|(_, l)| l.phase == LanePhase::Connected)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Every open session, for shutdown.
    pub async fn take_sessions(&self) -> Vec<SessionHandle> {
        let mut lanes = self.lanes.lock().await;
        lanes
            .values_mut()
            .filter_map(|lane| {
                lane.phase = LanePhase::Disconnected;
                lane.session.take()
            })
            .collect()
    }

    pub async fn phase(&self, id: &AccountId) -> Option<LanePhase> {
        self.lanes.lock().await.get(id).map(|l| l.phase)
    }

    pub async fn stats(&self) -> Vec<LaneStats> {
        let lanes = self.lanes.lock().await;
        let mut out: Vec<LaneStats> = lanes
            .iter()
            .map(|(id, l)| LaneStats {
                account_id: id.clone(),
                phase: l.phase,
                reconnect_at: l.reconnect_at,
                total_sent: l.total_sent,
                total_failed: l.total_failed,
            })
            .collect();
        out.sort_by(|a, b| a.account_id.cmp(&b.account_id));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reachclaw_core::types::TenantId;

    fn session(id: &str) -> SessionHandle {
        SessionHandle {
            account_id: AccountId::new(id),
            tenant_id: TenantId::new("t1"),
            session_id: format!("s-{id}"),
            connected_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_lane_lifecycle() {
        let board = LaneBoard::new(2);
        let a = AccountId::new("a");
        let now = Utc::now();

        assert!(board.begin_connect(&a, now).await);
        assert!(!board.begin_connect(&a, now).await, "already connecting");
        assert!(board.begin_send(&a).await.is_none());

        board.connected(session("a")).await;
        assert_eq!(board.idle_connected().await, vec![a.clone()]);
        let s = board.begin_send(&a).await.unwrap();
        assert_eq!(s.session_id, "s-a");
        assert!(board.begin_send(&a).await.is_none(), "one send per lane");
        assert!(board.idle_connected().await.is_empty());

        board.end_send(&a, Some(true)).await;
        assert_eq!(board.phase(&a).await, Some(LanePhase::Connected));
        assert_eq!(board.stats().await[0].total_sent, 1);
    }

    #[tokio::test]
    async fn test_reconnect_backoff() {
        let board = LaneBoard::new(1);
        let a = AccountId::new("a");
        let now = Utc::now();
        board.connected(session("a")).await;
        let dropped = board.disconnected(&a, now + chrono::Duration::seconds(30)).await;
        assert!(dropped.is_some());
        assert!(!board.may_connect(&a, now).await);
        assert!(board.may_connect(&a, now + chrono::Duration::seconds(30)).await);
        assert!(board.may_connect(&AccountId::new("unseen"), now).await);
    }

    #[tokio::test]
    async fn test_global_ceiling() {
        let board = LaneBoard::new(2);
        let p1 = board.try_permit().unwrap();
        let _p2 = board.try_permit().unwrap();
        assert!(board.try_permit().is_none());
        drop(p1);
        assert_eq!(board.available_permits(), 1);
        assert!(board.try_permit().is_some());
    }

    #[tokio::test]
    async fn test_take_sessions() {
        let board = LaneBoard::new(2);
        board.connected(session("a")).await;
        board.connected(session("b")).await;
        assert_eq!(board.take_sessions().await.len(), 2);
        assert!(board.idle_connected().await.is_empty());
    }
}
