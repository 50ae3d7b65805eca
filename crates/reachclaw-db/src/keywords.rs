//! Keyword sets and their entries.

use reachclaw_core::error::{ReachClawError, Result};
use reachclaw_core::types::{Keyword, KeywordSet, Scope, TenantId};
use rusqlite::{Connection, params};
use std::collections::HashMap;

use crate::{FleetDb, parse_ts, ts};

fn load_sets(conn: &Connection, tenant: Option<&str>) -> rusqlite::Result<Vec<KeywordSet>> {
    let mut stmt = conn.prepare(
        "SELECT id, tenant_id, name, enabled, reply_template, created_at FROM keyword_sets
         WHERE (?1 IS NULL OR tenant_id = ?1) ORDER BY id",
    )?;
    let mut sets: Vec<KeywordSet> = stmt
        .query_map(params![tenant], |row| {
            let created: String = row.get(5)?;
            Ok(KeywordSet {
                id: row.get(0)?,
                tenant_id: TenantId(row.get(1)?),
                name: row.get(2)?,
                keywords: Vec::new(),
                enabled: row.get(3)?,
                reply_template: row.get(4)?,
                created_at: parse_ts(5, &created)?,
            })
        })?
        .collect::<rusqlite::Result<_>>()?;

    let mut stmt = conn.prepare(
        "SELECT k.set_id, k.id, k.pattern, k.is_regex FROM keywords k
         JOIN keyword_sets s ON s.id = k.set_id
         WHERE (?1 IS NULL OR s.tenant_id = ?1) ORDER BY k.id",
    )?;
    let mut by_set: HashMap<i64, Vec<Keyword>> = HashMap::new();
    let rows = stmt.query_map(params![tenant], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            Keyword {
                id: row.get(1)?,
                pattern: row.get(2)?,
                is_regex: row.get(3)?,
            },
        ))
    })?;
    for row in rows {
        let (set_id, kw) = row?;
        by_set.entry(set_id).or_default().push(kw);
    }
    for set in &mut sets {
        set.keywords = by_set.remove(&set.id).unwrap_or_default();
    }
    Ok(sets)
}

impl FleetDb {
    // ─── Keyword Sets ─────────────────────────────────────────

    /// Store a set with its keywords; returns the new set id.
    pub fn insert_keyword_set(&self, set: &KeywordSet) -> Result<i64> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO keyword_sets (tenant_id, name, enabled, reply_template, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![set.tenant_id.0, set.name, set.enabled, set.reply_template, ts(set.created_at)],
            )?;
            let set_id = tx.last_insert_rowid();
            {
                let mut stmt = tx.prepare("INSERT INTO keywords (set_id, pattern, is_regex) VALUES (?1, ?2, ?3)")?;
                for kw in &set.keywords {
                    stmt.execute(params![set_id, kw.pattern, kw.is_regex])?;
                }
            }
            tx.commit()?;
            Ok(set_id)
        })
    }

    /// Sets visible in `scope`, keywords included.
    pub fn list_keyword_sets(&self, scope: &Scope) -> Result<Vec<KeywordSet>> {
        let tenant = self.tenant_filter(scope)?;
        self.with_conn(|conn| load_sets(conn, tenant.as_deref()))
    }

    /// Every set of every tenant, for compiling the keyword index.
    pub fn all_keyword_sets(&self) -> Result<Vec<KeywordSet>> {
        self.with_conn(|conn| load_sets(conn, None))
    }

    pub fn set_keyword_set_enabled(&self, scope: &Scope, id: i64, enabled: bool) -> Result<()> {
        let tenant = self.tenant_filter(scope)?;
        let n = self.with_conn(|conn| {
            conn.execute(
                "UPDATE keyword_sets SET enabled = ?3 WHERE id = ?1 AND (?2 IS NULL OR tenant_id = ?2)",
                params![id, tenant, enabled],
            )
        })?;
        if n == 0 {
            return Err(ReachClawError::not_found(format!("keyword set {id}")));
        }
        Ok(())
    }

    /// Remove a set and its keywords.
    pub fn delete_keyword_set(&self, scope: &Scope, id: i64) -> Result<()> {
        let tenant = self.tenant_filter(scope)?;
        let n = self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM keyword_sets WHERE id = ?1 AND (?2 IS NULL OR tenant_id = ?2)",
                params![id, tenant],
            )
        })?;
        if n == 0 {
            return Err(ReachClawError::not_found(format!("keyword set {id}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyword_set_roundtrip_and_cascade() {
        let db = FleetDb::open_in_memory(false).unwrap();
        let mut set = KeywordSet::new(
            TenantId::new("t1"),
            "pricing",
            vec![Keyword::literal("giá bao nhiêu"), Keyword::regex(r"\bmua\s+\d+")],
        );
        set.reply_template = Some("Chào {{name}}!".into());
        let id = db.insert_keyword_set(&set).unwrap();
        db.insert_keyword_set(&KeywordSet::new(TenantId::new("t2"), "other", vec![Keyword::literal("x")]))
            .unwrap();

        let sets = db.list_keyword_sets(&Scope::tenant("t1")).unwrap();
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].keywords.len(), 2);
        assert!(sets[0].keywords[1].is_regex);
        assert_eq!(sets[0].reply_template.as_deref(), Some("Chào {{name}}!"));
        assert_eq!(db.all_keyword_sets().unwrap().len(), 2);

        // Cross-tenant delete is a miss.
        assert!(db.delete_keyword_set(&Scope::tenant("t2"), id).is_err());
        db.delete_keyword_set(&Scope::tenant("t1"), id).unwrap();
        let left: i64 = db
            .with_conn(|c| c.query_row("SELECT COUNT(*) FROM keywords WHERE set_id = ?1", params![id], |r| r.get(0)))
            .unwrap();
        assert_eq!(left, 0);
    }

    #[test]
    fn test_duplicate_name_per_tenant_rejected() {
        let db = FleetDb::open_in_memory(false).unwrap();
        let set = KeywordSet::new(TenantId::new("t1"), "dup", vec![]);
        db.insert_keyword_set(&set).unwrap();
        assert!(db.insert_keyword_set(&set).is_err());
        db.insert_keyword_set(&KeywordSet::new(TenantId::new("t2"), "dup", vec![])).unwrap();
    }
}
