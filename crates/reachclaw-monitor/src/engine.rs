//! Alert engine — evaluates trigger rules once per cycle.
//!
//! ## Per-rule state
//! ```text
//! idle ──(check true)──▶ fired, cooldown_until = now + cooldown
//!   ▲                        │ (check true again → suppressed)
//!   └──(cooldown elapsed)────┘
//! ```
//! A failing or panicking check is logged and skipped; other rules in the
//! same cycle still run.

use chrono::{DateTime, Duration, Utc};
use reachclaw_core::error::{ReachClawError, Result};
use reachclaw_core::types::{Alert, RuleCheck, TriggerRule};
use reachclaw_db::FleetDb;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};

use crate::checks::{CheckRegistry, EvalContext, HitCounts, KeywordHitTally, Metrics, MetricsSource};
use crate::history::AlertHistory;

struct RuleState {
    rule: TriggerRule,
    cooldown_until: Option<DateTime<Utc>>,
}

impl RuleState {
    fn cooling_down(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.is_some_and(|until| now < until)
    }
}

/// Outcome of one rule's check.
struct Verdict {
    fired: bool,
    /// Value substituted for `{{value}}`.
    value: f64,
    /// Name substituted for `{{metric}}`.
    metric: String,
}

pub struct AlertEngine {
    rules: Mutex<Vec<RuleState>>,
    registry: CheckRegistry,
    metrics: Arc<dyn MetricsSource>,
    tally: Arc<KeywordHitTally>,
    history: Arc<AlertHistory>,
    default_cooldown: Duration,
}

/// Cool-down for rules stored without one.
const DEFAULT_COOLDOWN_SECS: i64 = 60;

impl AlertEngine {
    pub fn new(
        registry: CheckRegistry,
        metrics: Arc<dyn MetricsSource>,
        tally: Arc<KeywordHitTally>,
        history: Arc<AlertHistory>,
    ) -> Self {
        Self {
            rules: Mutex::new(Vec::new()),
            registry,
            metrics,
            tally,
            history,
            default_cooldown: Duration::seconds(DEFAULT_COOLDOWN_SECS),
        }
    }

    pub fn with_default_cooldown(mut self, secs: u64) -> Self {
        self.default_cooldown = Duration::seconds(secs.min(i64::MAX as u64) as i64);
        self
    }

    /// Add or replace a rule. Replacing keeps its cooldown.
    pub fn register(&self, rule: TriggerRule) -> Result<()> {
        let mut rules = self.lock_rules()?;
        match rules.iter_mut().find(|s| s.rule.id == rule.id) {
            Some(state) => state.rule = rule,
            None => {
                tracing::info!("🔔 Rule registered: '{}' ({})", rule.name, rule.id);
                rules.push(RuleState {
                    rule,
                    cooldown_until: None,
                });
            }
        }
        Ok(())
    }

    pub fn remove(&self, rule_id: &str) -> Result<bool> {
        let mut rules = self.lock_rules()?;
        let before = rules.len();
        rules.retain(|s| s.rule.id != rule_id);
        Ok(rules.len() < before)
    }

    /// Replace the rule set with what the datastore holds, keeping cooldowns
    /// of rules that survive.
    pub fn reload(&self, db: &FleetDb) -> Result<usize> {
        let loaded = db.load_rules()?;
        let mut rules = self.lock_rules()?;
        let mut next = Vec::with_capacity(loaded.len());
        for rule in loaded {
            let cooldown_until = rules
                .iter()
                .find(|s| s.rule.id == rule.id)
                .and_then(|s| s.cooldown_until);
            next.push(RuleState { rule, cooldown_until });
        }
        *rules = next;
        tracing::debug!("🔄 Alert engine reloaded: {} rules", rules.len());
        Ok(rules.len())
    }

    pub fn rules(&self) -> Vec<TriggerRule> {
        self.lock_rules()
            .map(|rules| rules.iter().map(|s| s.rule.clone()).collect())
            .unwrap_or_default()
    }

    pub fn history(&self) -> &Arc<AlertHistory> {
        &self.history
    }

    pub fn tally(&self) -> &Arc<KeywordHitTally> {
        &self.tally
    }

    /// Run every enabled rule once against current metrics and the keyword
    /// hits recorded since the previous cycle.
    pub fn evaluate(&self) -> Vec<Alert> {
        self.evaluate_at(Utc::now())
    }

    pub fn evaluate_at(&self, now: DateTime<Utc>) -> Vec<Alert> {
        let metrics = match self.metrics.metrics(now) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("⚠️ Metrics unavailable this cycle: {e}");
                Metrics::new()
            }
        };
        let hits = self.tally.drain();
        self.evaluate_with(now, &metrics, &hits)
    }

    /// Evaluate against explicit inputs.
    pub fn evaluate_with(&self, now: DateTime<Utc>, metrics: &Metrics, hits: &HitCounts) -> Vec<Alert> {
        let ctx = EvalContext { now, metrics, hits };
        let mut fired = Vec::new();
        let Ok(mut rules) = self.lock_rules() else {
            return fired;
        };

        for state in rules.iter_mut() {
            if !state.rule.enabled || state.cooling_down(now) {
                continue;
            }
            let verdict = match catch_unwind(AssertUnwindSafe(|| self.check(&state.rule, &ctx))) {
                Ok(Ok(v)) => v,
                Ok(Err(e)) => {
                    tracing::warn!(rule = %state.rule.id, "⚠️ Rule check failed: {e}");
                    continue;
                }
                Err(panic) => {
                    tracing::warn!(rule = %state.rule.id, "⚠️ Rule check panicked: {}", panic_message(&*panic));
                    continue;
                }
            };
            if !verdict.fired {
                continue;
            }

            let cooldown = match state.rule.cooldown_secs {
                Some(secs) => Duration::seconds(secs.min(i64::MAX as u64) as i64),
                None => self.default_cooldown,
            };
            state.cooldown_until = now.checked_add_signed(cooldown);
            let alert = Alert {
                rule_id: state.rule.id.clone(),
                rule_name: state.rule.name.clone(),
                fired_at: now,
                message: render_message(&state.rule, &verdict),
                severity: state.rule.severity,
                tenant_id: state.rule.tenant_id.clone(),
            };
            tracing::info!(rule = %alert.rule_id, severity = alert.severity.as_str(), "🚨 Alert: {}", alert.message);
            fired.push(alert);
        }
        drop(rules);

        self.history.extend(fired.iter().cloned());
        fired
    }

    fn check(&self, rule: &TriggerRule, ctx: &EvalContext<'_>) -> Result<Verdict> {
        match &rule.check {
            RuleCheck::Threshold { metric, operator, value } => {
                let actual = *ctx
                    .metrics
                    .get(metric)
                    .ok_or_else(|| ReachClawError::RuleEvaluation(format!("unknown metric '{metric}'")))?;
                Ok(Verdict {
                    fired: operator.holds(actual, *value),
                    value: actual,
                    metric: metric.clone(),
                })
            }
            RuleCheck::KeywordHit { set, min_hits } => {
                let total = ctx.hits.total(rule.tenant_id.as_ref(), set.as_deref());
                Ok(Verdict {
                    fired: total >= (*min_hits).max(1),
                    value: f64::from(total),
                    metric: set.clone().unwrap_or_else(|| "keyword_hits".into()),
                })
            }
            RuleCheck::Custom { name } => {
                let check = self.registry.get(name)?;
                Ok(Verdict {
                    fired: check(ctx)?,
                    value: 1.0,
                    metric: name.clone(),
                })
            }
        }
    }

    fn lock_rules(&self) -> Result<std::sync::MutexGuard<'_, Vec<RuleState>>> {
        self.rules
            .lock()
            .map_err(|_| ReachClawError::Other("alert rule state poisoned".into()))
    }
}

fn render_message(rule: &TriggerRule, verdict: &Verdict) -> String {
    let value = format_value(verdict.value);
    match &rule.message {
        Some(template) => template
            .replace("{{rule}}", &rule.name)
            .replace("{{metric}}", &verdict.metric)
            .replace("{{value}}", &value),
        None => match &rule.check {
            RuleCheck::Threshold { operator, value: threshold, .. } => format!(
                "{}: {} = {} ({} {})",
                rule.name,
                verdict.metric,
                value,
                operator.symbol(),
                format_value(*threshold)
            ),
            RuleCheck::KeywordHit { set, .. } => match set {
                Some(set) => format!("{}: {} keyword hit(s) in '{}'", rule.name, value, set),
                None => format!("{}: {} keyword hit(s)", rule.name, value),
            },
            RuleCheck::Custom { name } => format!("{}: check '{}' triggered", rule.name, name),
        },
    }
}

fn format_value(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{v:.2}")
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".into()
    }
}
