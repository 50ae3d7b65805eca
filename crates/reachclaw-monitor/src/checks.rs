//! Inputs to rule evaluation and the registry of named predicates.

use chrono::{DateTime, Utc};
use reachclaw_core::error::{ReachClawError, Result};
use reachclaw_core::types::TenantId;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

/// Gauge name → value, e.g. `queue.failed_1h`.
pub type Metrics = BTreeMap<String, f64>;

/// Supplies the current gauges each cycle.
pub trait MetricsSource: Send + Sync {
    fn metrics(&self, now: DateTime<Utc>) -> Result<Metrics>;
}

/// Fixed gauges, for tests and one-off evaluations.
impl MetricsSource for Metrics {
    fn metrics(&self, _now: DateTime<Utc>) -> Result<Metrics> {
        Ok(self.clone())
    }
}

/// Keyword hits per (tenant, set name) since the last drain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HitCounts(HashMap<(TenantId, String), u32>);

impl HitCounts {
    /// Hits matching the optional tenant and set filters.
    pub fn total(&self, tenant: Option<&TenantId>, set: Option<&str>) -> u32 {
        self.0
            .iter()
            .filter(|((t, s), _)| tenant.is_none_or(|want| want == t) && set.is_none_or(|want| want == s))
            .map(|(_, n)| *n)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Accumulates keyword hits from the inbound pipeline between cycles.
#[derive(Debug, Default)]
pub struct KeywordHitTally {
    hits: Mutex<HashMap<(TenantId, String), u32>>,
}

impl KeywordHitTally {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, tenant: &TenantId, set_name: &str, count: u32) {
        if count == 0 {
            return;
        }
        if let Ok(mut hits) = self.hits.lock() {
            *hits.entry((tenant.clone(), set_name.to_string())).or_default() += count;
        }
    }

    /// Take everything recorded so far.
    pub fn drain(&self) -> HitCounts {
        self.hits
            .lock()
            .map(|mut h| HitCounts(std::mem::take(&mut *h)))
            .unwrap_or_default()
    }
}

/// What a check sees during one cycle.
#[derive(Debug)]
pub struct EvalContext<'a> {
    pub now: DateTime<Utc>,
    pub metrics: &'a Metrics,
    pub hits: &'a HitCounts,
}

/// A predicate registered under a name for `RuleCheck::Custom`.
pub type CustomCheck = Arc<dyn Fn(&EvalContext<'_>) -> Result<bool> + Send + Sync>;

/// Named custom predicates.
#[derive(Clone, Default)]
pub struct CheckRegistry {
    checks: HashMap<String, CustomCheck>,
}

impl CheckRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, check: F)
    where
        F: Fn(&EvalContext<'_>) -> Result<bool> + Send + Sync + 'static,
    {
        self.checks.insert(name.into(), Arc::new(check));
    }

    pub fn get(&self, name: &str) -> Result<&CustomCheck> {
        self.checks
            .get(name)
            .ok_or_else(|| ReachClawError::RuleEvaluation(format!("no check registered as '{name}'")))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.checks.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for CheckRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckRegistry").field("checks", &self.names()).finish()
    }
}
