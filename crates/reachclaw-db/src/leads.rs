//! Scored leads.

use reachclaw_core::error::{ReachClawError, Result};
use reachclaw_core::types::{Lead, LeadStage, Scope, ScoreBreakdown, TenantId};
use rusqlite::{OptionalExtension, Row, params};

use crate::{FleetDb, opt_ts, parse_col, parse_json, parse_opt_ts, parse_ts, to_json, ts};

const LEAD_COLUMNS: &str =
    "tenant_id, contact, signals, completeness, engagement, intent, quality, recency, score, stage, updated_at, last_activity_at";

fn row_to_lead(row: &Row<'_>) -> rusqlite::Result<Lead> {
    let signals: String = row.get(2)?;
    let stage: String = row.get(9)?;
    let updated: String = row.get(10)?;
    Ok(Lead {
        tenant_id: TenantId(row.get(0)?),
        contact: row.get(1)?,
        signals: parse_json(2, &signals)?,
        breakdown: ScoreBreakdown {
            completeness: row.get(3)?,
            engagement: row.get(4)?,
            intent: row.get(5)?,
            quality: row.get(6)?,
            recency: row.get(7)?,
        },
        score: row.get(8)?,
        stage: parse_col::<LeadStage>(9, &stage)?,
        updated_at: parse_ts(10, &updated)?,
        last_activity_at: parse_opt_ts(11, row.get(11)?)?,
    })
}

impl FleetDb {
    // ─── Leads ────────────────────────────────────────────────

    pub fn upsert_lead(&self, lead: &Lead) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO leads ({LEAD_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                     ON CONFLICT (tenant_id, contact) DO UPDATE SET
                        signals = excluded.signals, completeness = excluded.completeness,
                        engagement = excluded.engagement, intent = excluded.intent, quality = excluded.quality,
                        recency = excluded.recency, score = excluded.score, stage = excluded.stage,
                        updated_at = excluded.updated_at, last_activity_at = excluded.last_activity_at"
                ),
                params![
                    lead.tenant_id.0,
                    lead.contact,
                    to_json(&lead.signals)?,
                    lead.breakdown.completeness,
                    lead.breakdown.engagement,
                    lead.breakdown.intent,
                    lead.breakdown.quality,
                    lead.breakdown.recency,
                    lead.score,
                    lead.stage.as_str(),
                    ts(lead.updated_at),
                    opt_ts(lead.last_activity_at),
                ],
            )?;
            Ok(())
        })
    }

    /// A tenant's lead for `contact`, if scored before.
    pub fn lead(&self, tenant: &TenantId, contact: &str) -> Result<Option<Lead>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {LEAD_COLUMNS} FROM leads WHERE tenant_id = ?1 AND contact = ?2"),
                params![tenant.0, contact],
                row_to_lead,
            )
            .optional()
        })
    }

    pub fn get_lead(&self, scope: &Scope, tenant: &TenantId, contact: &str) -> Result<Lead> {
        self.check_owner(scope, tenant, &format!("lead {contact}"))?;
        self.lead(tenant, contact)?
            .ok_or_else(|| ReachClawError::not_found(format!("lead {contact}")))
    }

    /// Highest score first, optionally one stage only.
    pub fn list_leads(&self, scope: &Scope, stage: Option<LeadStage>, limit: usize) -> Result<Vec<Lead>> {
        let tenant = self.tenant_filter(scope)?;
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {LEAD_COLUMNS} FROM leads
                 WHERE (?1 IS NULL OR tenant_id = ?1) AND (?2 IS NULL OR stage = ?2)
                 ORDER BY score DESC, contact LIMIT ?3"
            ))?;
            let rows = stmt.query_map(params![tenant, stage.map(|s| s.as_str()), limit as i64], row_to_lead)?;
            rows.collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_lead_upsert_and_list() {
        let db = FleetDb::open_in_memory(false).unwrap();
        let t1 = TenantId::new("t1");
        let mut lead = Lead::new(t1.clone(), "@lan");
        lead.signals.messages_received = 3;
        lead.breakdown = ScoreBreakdown::new(18.0, 20.0, 25.0, 10.0, 8.0);
        lead.score = lead.breakdown.composite();
        lead.stage = lead.breakdown.stage();
        db.upsert_lead(&lead).unwrap();

        lead.signals.messages_received = 4;
        let seen = Utc::now();
        lead.last_activity_at = Some(seen);
        db.upsert_lead(&lead).unwrap();

        let back = db.get_lead(&Scope::tenant("t1"), &t1, "@lan").unwrap();
        assert_eq!(back.signals.messages_received, 4);
        assert_eq!(back.stage, LeadStage::Hot);
        assert_eq!(back.score, 81.0);
        assert_eq!(back.last_activity_at.map(|t| t.timestamp_millis()), Some(seen.timestamp_millis()));

        assert_eq!(db.list_leads(&Scope::tenant("t1"), Some(LeadStage::Hot), 10).unwrap().len(), 1);
        assert!(db.list_leads(&Scope::tenant("t1"), Some(LeadStage::Cold), 10).unwrap().is_empty());
        assert!(db.get_lead(&Scope::tenant("t2"), &t1, "@lan").is_err());
    }
}
