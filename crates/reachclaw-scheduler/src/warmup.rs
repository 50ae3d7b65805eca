//! Warm-up ramp for new accounts.

use chrono::NaiveDate;
use reachclaw_core::config::WarmupConfig;
use reachclaw_core::types::{Account, AccountStatus};

/// Stage table and daily limits.
#[derive(Debug, Clone)]
pub struct WarmupPolicy {
    enabled: bool,
    daily_limits: Vec<u32>,
    days_per_stage: u32,
}

impl WarmupPolicy {
    pub fn new(config: &WarmupConfig) -> Self {
        Self {
            enabled: config.enabled,
            daily_limits: config.daily_limits.clone(),
            days_per_stage: config.days_per_stage.max(1),
        }
    }

    /// Stage reached on `day`, 0 once past the last stage.
    pub fn stage_for_day(&self, day: u32) -> u8 {
        if !self.enabled {
            return 0;
        }
        let stage = day / self.days_per_stage + 1;
        if stage as usize > self.daily_limits.len() {
            0
        } else {
            stage as u8
        }
    }

    /// Send limit for today, `None` when the account is not warming up.
    pub fn daily_limit(&self, account: &Account) -> Option<u32> {
        if !self.enabled || account.warmup_stage == 0 {
            return None;
        }
        let idx = account.warmup_stage as usize - 1;
        self.daily_limits.get(idx).or(self.daily_limits.last()).copied()
    }

    /// Move the account's day counter forward to `today`. Returns whether the
    /// account changed and needs saving.
    ///
    /// The first call only stamps the start date. Graduating accounts leave
    /// `warming_up` for `active`; a rate-limited account keeps its status and
    /// returns to `active` when the limit lapses.
    pub fn advance(&self, account: &mut Account, today: NaiveDate) -> bool {
        if account.warmup_stage == 0 {
            return false;
        }
        if matches!(account.status, AccountStatus::Disabled | AccountStatus::Unregistered) {
            return false;
        }
        let Some(last) = account.warmup_advanced_on else {
            account.warmup_advanced_on = Some(today);
            account.warmup_stage = self.stage_for_day(account.warmup_day);
            self.graduate_if_done(account);
            return true;
        };
        let elapsed = (today - last).num_days();
        if elapsed <= 0 {
            return false;
        }
        account.warmup_day = account.warmup_day.saturating_add(elapsed as u32);
        account.warmup_advanced_on = Some(today);
        let before = account.warmup_stage;
        account.warmup_stage = self.stage_for_day(account.warmup_day);
        if account.warmup_stage != before {
            tracing::info!(
                account = %account.id,
                day = account.warmup_day,
                "🌱 Warm-up stage {before} → {}",
                account.warmup_stage
            );
        }
        self.graduate_if_done(account);
        true
    }

    fn graduate_if_done(&self, account: &mut Account) {
        if account.warmup_stage == 0 && account.status == AccountStatus::WarmingUp {
            account.status = AccountStatus::Active;
            tracing::info!(account = %account.id, "🎓 Account graduated from warm-up");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reachclaw_core::types::{AccountRole, TenantId};

    fn policy() -> WarmupPolicy {
        WarmupPolicy::new(&WarmupConfig {
            enabled: true,
            daily_limits: vec![5, 15, 40],
            days_per_stage: 3,
        })
    }

    fn fresh() -> Account {
        Account::new(TenantId::new("t1"), "a1", "+8490", AccountRole::Sender, Some("s".into()))
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 1).unwrap() + chrono::Duration::days(d as i64)
    }

    #[test]
    fn test_stage_table() {
        let p = policy();
        assert_eq!(p.stage_for_day(0), 1);
        assert_eq!(p.stage_for_day(2), 1);
        assert_eq!(p.stage_for_day(3), 2);
        assert_eq!(p.stage_for_day(8), 3);
        assert_eq!(p.stage_for_day(9), 0);
    }

    #[test]
    fn test_ramp_to_graduation() {
        let p = policy();
        let mut a = fresh();
        assert!(p.advance(&mut a, day(0)));
        assert_eq!(p.daily_limit(&a), Some(5));
        assert!(!p.advance(&mut a, day(0)), "same day is a no-op");

        assert!(p.advance(&mut a, day(4)));
        assert_eq!(a.warmup_day, 4);
        assert_eq!(a.warmup_stage, 2);
        assert_eq!(p.daily_limit(&a), Some(15));

        assert!(p.advance(&mut a, day(9)));
        assert_eq!(a.warmup_stage, 0);
        assert_eq!(a.status, AccountStatus::Active);
        assert_eq!(p.daily_limit(&a), None);
        assert!(!p.advance(&mut a, day(10)));
    }

    #[test]
    fn test_rate_limited_account_keeps_status_on_graduation() {
        let p = policy();
        let mut a = fresh();
        p.advance(&mut a, day(0));
        a.status = AccountStatus::RateLimited;
        p.advance(&mut a, day(20));
        assert_eq!(a.warmup_stage, 0);
        assert_eq!(a.status, AccountStatus::RateLimited);
        assert_eq!(a.working_status(), AccountStatus::Active);
    }

    #[test]
    fn test_disabled_warmup_graduates_immediately() {
        let p = WarmupPolicy::new(&WarmupConfig {
            enabled: false,
            ..WarmupConfig::default()
        });
        let mut a = fresh();
        assert!(p.advance(&mut a, day(0)));
        assert_eq!(a.status, AccountStatus::Active);
        assert_eq!(p.daily_limit(&a), None);
    }

    #[test]
    fn test_disabled_accounts_are_left_alone() {
        let p = policy();
        let mut a = fresh();
        a.status = AccountStatus::Disabled;
        assert!(!p.advance(&mut a, day(3)));
        assert_eq!(a.warmup_advanced_on, None);
    }
}
