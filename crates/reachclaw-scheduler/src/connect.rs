//! Connection Scheduler — spreads account connects across the day.
//!
//! Every account gets a stable connect offset derived from a hash of its id:
//! an hour-of-day bucket plus a minute/second offset and jitter drawn from an
//! RNG seeded with the same hash. Re-deriving the offset for the same account
//! always yields the same value, so restarts do not reshuffle the fleet.
//!
//! `should_defer` is a probabilistic concurrency gate: per round, each account
//! lands in a hash bucket and only `max_concurrent / pool_size` of the buckets
//! are admitted. It approximates a cap without shared state; the dispatcher
//! still enforces the hard ceiling with a semaphore.

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use reachclaw_core::config::ConnectConfig;
use reachclaw_core::types::AccountId;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

const HOUR_SECS: u64 = 3600;

/// Stable 64-bit hash of an account id.
pub fn account_hash(id: &AccountId) -> u64 {
    let digest = Sha256::digest(id.as_str().as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head)
}

/// SplitMix64 finaliser; decorrelates the per-round bucket from the hour bucket.
fn mix(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// One row of a connection plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedConnect {
    pub account_id: AccountId,
    pub hour: u64,
    pub delay_secs: u64,
}

#[derive(Debug)]
pub struct ConnectionScheduler {
    base_offset: Duration,
    max_jitter: Duration,
    defer_round: Duration,
    pool_size: AtomicUsize,
}

impl ConnectionScheduler {
    pub fn new(config: &ConnectConfig) -> Self {
        Self {
            base_offset: Duration::from_secs(config.base_offset_secs),
            max_jitter: Duration::from_secs(config.max_jitter_secs),
            defer_round: Duration::from_secs(config.defer_round_secs.max(1)),
            pool_size: AtomicUsize::new(0),
        }
    }

    pub fn max_jitter(&self) -> Duration {
        self.max_jitter
    }

    /// Connect delay for `id`, measured from service start.
    ///
    /// Always within `[base_offset, base_offset + 24h + max_jitter]`.
    pub fn delay_for(&self, id: &AccountId) -> Duration {
        let hash = account_hash(id);
        let mut rng = StdRng::seed_from_u64(hash);
        let hour = hash % 24;
        let minute = rng.gen_range(0..60u64);
        let second = rng.gen_range(0..60u64);
        let jitter = rng.gen_range(0..=self.max_jitter.as_secs());
        self.base_offset + Duration::from_secs(hour * HOUR_SECS + minute * 60 + second + jitter)
    }

    /// Hour-of-day bucket of `id`.
    pub fn hour_bucket(id: &AccountId) -> u64 {
        account_hash(id) % 24
    }

    /// Number of accounts competing for connections; feeds the gate.
    pub fn set_pool_size(&self, n: usize) {
        self.pool_size.store(n, Ordering::Relaxed);
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size.load(Ordering::Relaxed)
    }

    /// Whether `id` should hold off connecting in the current round.
    pub fn should_defer(&self, id: &AccountId, max_concurrent: usize) -> bool {
        self.should_defer_at(id, max_concurrent, Utc::now())
    }

    pub fn should_defer_at(&self, id: &AccountId, max_concurrent: usize, now: DateTime<Utc>) -> bool {
        let round = now.timestamp().max(0) as u64 / self.defer_round.as_secs();
        should_defer_in_round(id, max_concurrent, self.pool_size(), round)
    }

    /// Connection plan for `accounts`, earliest first.
    pub fn plan(&self, accounts: &[AccountId]) -> Vec<PlannedConnect> {
        let mut plan: Vec<PlannedConnect> = accounts
            .iter()
            .map(|id| PlannedConnect {
                account_id: id.clone(),
                hour: Self::hour_bucket(id),
                delay_secs: self.delay_for(id).as_secs(),
            })
            .collect();
        plan.sort_by(|a, b| a.delay_secs.cmp(&b.delay_secs).then_with(|| a.account_id.cmp(&b.account_id)));
        plan
    }
}

/// Pure gate: admit roughly `max_concurrent` of `pool_size` accounts in
/// `round`. Never defers when the pool fits under the cap.
pub fn should_defer_in_round(id: &AccountId, max_concurrent: usize, pool_size: usize, round: u64) -> bool {
    if pool_size <= max_concurrent {
        return false;
    }
    let bucket = mix(account_hash(id) ^ round) % pool_size as u64;
    bucket >= max_concurrent as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn scheduler(base: u64, jitter: u64) -> ConnectionScheduler {
        ConnectionScheduler::new(&ConnectConfig {
            base_offset_secs: base,
            max_jitter_secs: jitter,
            defer_round_secs: 900,
        })
    }

    #[test]
    fn test_delay_is_stable_across_instances() {
        let a = scheduler(0, 600);
        let b = scheduler(0, 600);
        let id = AccountId::new("+84901234567");
        assert_eq!(a.delay_for(&id), a.delay_for(&id));
        assert_eq!(a.delay_for(&id), b.delay_for(&id));
    }

    #[test]
    fn test_base_offset_is_added() {
        let id = AccountId::new("acc-7");
        let plain = scheduler(0, 600).delay_for(&id);
        let shifted = scheduler(120, 600).delay_for(&id);
        assert_eq!(shifted - plain, Duration::from_secs(120));
    }

    #[test]
    fn test_accounts_spread_over_the_day() {
        let s = scheduler(0, 600);
        let ids: Vec<AccountId> = (0..500).map(|i| AccountId::new(format!("acc-{i}"))).collect();
        let delays: HashSet<u64> = ids.iter().map(|id| s.delay_for(id).as_secs()).collect();
        let hours: HashSet<u64> = ids.iter().map(ConnectionScheduler::hour_bucket).collect();
        assert!(delays.len() > 490, "too many collisions: {}", delays.len());
        assert_eq!(hours.len(), 24);
    }

    #[test]
    fn test_plan_sorted() {
        let s = scheduler(0, 0);
        let ids: Vec<AccountId> = (0..20).map(|i| AccountId::new(format!("a{i}"))).collect();
        let plan = s.plan(&ids);
        assert_eq!(plan.len(), 20);
        assert!(plan.windows(2).all(|w| w[0].delay_secs <= w[1].delay_secs));
        assert!(plan.iter().all(|p| p.delay_secs / HOUR_SECS == p.hour));
    }

    #[test]
    fn test_gate_never_defers_small_pool() {
        let id = AccountId::new("solo");
        for round in 0..50 {
            assert!(!should_defer_in_round(&id, 8, 8, round));
            assert!(!should_defer_in_round(&id, 8, 3, round));
        }
    }

    #[test]
    fn test_gate_admits_about_max_concurrent() {
        let ids: Vec<AccountId> = (0..1000).map(|i| AccountId::new(format!("acc-{i}"))).collect();
        for round in [0u64, 1, 17, 20_000] {
            let admitted = ids.iter().filter(|id| !should_defer_in_round(id, 100, 1000, round)).count();
            assert!((60..=140).contains(&admitted), "round {round}: {admitted} admitted");
        }
    }

    #[test]
    fn test_gate_rotates_between_rounds() {
        let ids: Vec<AccountId> = (0..200).map(|i| AccountId::new(format!("acc-{i}"))).collect();
        let admitted = |round| -> HashSet<&AccountId> {
            ids.iter().filter(|id| !should_defer_in_round(id, 20, 200, round)).collect()
        };
        assert_ne!(admitted(1), admitted(2));
    }

    #[test]
    fn test_should_defer_uses_pool_size() {
        let s = scheduler(0, 0);
        let id = AccountId::new("x");
        assert!(!s.should_defer(&id, 4));
        s.set_pool_size(4);
        assert!(!s.should_defer(&id, 4));
    }

    proptest! {
        #[test]
        fn prop_delay_deterministic_and_bounded(id in "[a-z0-9+@_-]{1,32}", jitter in 0u64..7200) {
            let s = scheduler(0, jitter);
            let id = AccountId::new(id);
            let d = s.delay_for(&id);
            prop_assert_eq!(d, s.delay_for(&id));
            prop_assert!(d <= Duration::from_secs(24 * HOUR_SECS + jitter));
        }
    }
}
