//! Trigger rules and the durable alert log.

use reachclaw_core::error::{ReachClawError, Result};
use reachclaw_core::types::{Alert, Scope, Severity, TenantId, TriggerRule};
use rusqlite::params;

use crate::{FleetDb, parse_col, parse_json, parse_ts, to_json, ts};

impl FleetDb {
    // ─── Trigger Rules ────────────────────────────────────────

    /// Insert or replace a rule.
    pub fn save_rule(&self, rule: &TriggerRule) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO trigger_rules
                    (id, name, tenant_id, check_config, severity, cooldown_secs, message, enabled, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    rule.id,
                    rule.name,
                    rule.tenant_id.as_ref().map(|t| t.0.clone()),
                    to_json(&rule.check)?,
                    rule.severity.as_str(),
                    rule.cooldown_secs.map(|c| c.min(i64::MAX as u64) as i64),
                    rule.message,
                    rule.enabled,
                    ts(rule.created_at),
                ],
            )?;
            Ok(())
        })
    }

    /// All rules, for the alert engine.
    pub fn load_rules(&self) -> Result<Vec<TriggerRule>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, tenant_id, check_config, severity, cooldown_secs, message, enabled, created_at
                 FROM trigger_rules ORDER BY created_at, id",
            )?;
            let rows = stmt.query_map([], |row| {
                let check: String = row.get(3)?;
                let severity: String = row.get(4)?;
                let cooldown: Option<i64> = row.get(5)?;
                let created: String = row.get(8)?;
                Ok(TriggerRule {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    tenant_id: row.get::<_, Option<String>>(2)?.map(TenantId),
                    check: parse_json(3, &check)?,
                    severity: parse_col::<Severity>(4, &severity)?,
                    cooldown_secs: cooldown.map(|c| c.max(0) as u64),
                    message: row.get(6)?,
                    enabled: row.get(7)?,
                    created_at: parse_ts(8, &created)?,
                })
            })?;
            rows.collect()
        })
    }

    pub fn delete_rule(&self, id: &str) -> Result<()> {
        let n = self.with_conn(|conn| conn.execute("DELETE FROM trigger_rules WHERE id = ?1", params![id]))?;
        if n == 0 {
            return Err(ReachClawError::not_found(format!("rule {id}")));
        }
        Ok(())
    }

    // ─── Alert History ────────────────────────────────────────

    pub fn append_alert(&self, alert: &Alert) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO alerts (rule_id, rule_name, tenant_id, severity, message, fired_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    alert.rule_id,
                    alert.rule_name,
                    alert.tenant_id.as_ref().map(|t| t.0.clone()),
                    alert.severity.as_str(),
                    alert.message,
                    ts(alert.fired_at),
                ],
            )?;
            Ok(())
        })
    }

    /// Most recent alerts first. A tenant scope sees its own alerts plus
    /// installation-wide ones.
    pub fn recent_alerts(&self, scope: &Scope, limit: usize) -> Result<Vec<Alert>> {
        let tenant = self.tenant_filter(scope)?;
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT rule_id, rule_name, tenant_id, severity, message, fired_at FROM alerts
                 WHERE (?1 IS NULL OR tenant_id IS NULL OR tenant_id = ?1)
                 ORDER BY id DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![tenant, limit as i64], |row| {
                let severity: String = row.get(3)?;
                let fired: String = row.get(5)?;
                Ok(Alert {
                    rule_id: row.get(0)?,
                    rule_name: row.get(1)?,
                    tenant_id: row.get::<_, Option<String>>(2)?.map(TenantId),
                    severity: parse_col::<Severity>(3, &severity)?,
                    message: row.get(4)?,
                    fired_at: parse_ts(5, &fired)?,
                })
            })?;
            rows.collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use reachclaw_core::types::{Comparison, RuleCheck};

    #[test]
    fn test_rule_roundtrip() {
        let db = FleetDb::open_in_memory(false).unwrap();
        let mut rule = TriggerRule::new(
            "failed-burst",
            "Failed burst",
            RuleCheck::Threshold {
                metric: "queue.failed_1h".into(),
                operator: Comparison::Ge,
                value: 10.0,
            },
            Severity::Critical,
            300,
        );
        rule.message = Some("{{metric}} = {{value}}".into());
        db.save_rule(&rule).unwrap();
        rule.enabled = false;
        db.save_rule(&rule).unwrap();

        let rules = db.load_rules().unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].check, rule.check);
        assert!(!rules[0].enabled);
        db.delete_rule("failed-burst").unwrap();
        assert!(db.delete_rule("failed-burst").is_err());
    }

    #[test]
    fn test_alert_log_scoping() {
        let db = FleetDb::open_in_memory(false).unwrap();
        let base = Alert {
            rule_id: "r".into(),
            rule_name: "R".into(),
            fired_at: Utc::now(),
            message: "m".into(),
            severity: Severity::Warning,
            tenant_id: None,
        };
        db.append_alert(&base).unwrap();
        db.append_alert(&Alert {
            tenant_id: Some(TenantId::new("t1")),
            ..base.clone()
        })
        .unwrap();
        db.append_alert(&Alert {
            tenant_id: Some(TenantId::new("t2")),
            ..base
        })
        .unwrap();

        let t1 = db.recent_alerts(&Scope::tenant("t1"), 10).unwrap();
        assert_eq!(t1.len(), 2);
        assert!(t1.iter().all(|a| a.tenant_id.as_ref().is_none_or(|t| t.as_str() == "t1")));
        assert!(matches!(
            db.recent_alerts(&Scope::Installation, 10),
            Err(ReachClawError::TenantIsolation(_))
        ));
    }
}
