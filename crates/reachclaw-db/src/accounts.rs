//! Account rows.

use chrono::{DateTime, NaiveDate, Utc};
use reachclaw_core::error::{ReachClawError, Result};
use reachclaw_core::types::{Account, AccountId, AccountRole, AccountStatus, Scope, TenantId};
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::{FleetDb, opt_ts, parse_col, parse_opt_ts, parse_ts, ts};

/// A status change applied to an account alongside a message transition.
#[derive(Debug, Clone, PartialEq)]
pub struct AccountUpdate {
    pub status: AccountStatus,
    pub reason: Option<String>,
    pub rate_limited_until: Option<DateTime<Utc>>,
}

impl AccountUpdate {
    pub fn rate_limited(until: DateTime<Utc>, reason: impl Into<String>) -> Self {
        Self {
            status: AccountStatus::RateLimited,
            reason: Some(reason.into()),
            rate_limited_until: Some(until),
        }
    }

    pub fn disabled(reason: impl Into<String>) -> Self {
        Self {
            status: AccountStatus::Disabled,
            reason: Some(reason.into()),
            rate_limited_until: None,
        }
    }

    pub fn restored(status: AccountStatus) -> Self {
        Self {
            status,
            reason: None,
            rate_limited_until: None,
        }
    }
}

pub(crate) const ACCOUNT_COLUMNS: &str = "id, tenant_id, handle, session_credential, proxy, role, status, status_reason,
     warmup_day, warmup_stage, warmup_advanced_on, last_connect_at, rate_limited_until, created_at";

pub(crate) fn row_to_account(row: &Row<'_>) -> rusqlite::Result<Account> {
    let role: String = row.get(5)?;
    let status: String = row.get(6)?;
    let advanced: Option<String> = row.get(10)?;
    let created: String = row.get(13)?;
    Ok(Account {
        id: AccountId(row.get(0)?),
        tenant_id: TenantId(row.get(1)?),
        handle: row.get(2)?,
        session_credential: row.get(3)?,
        proxy: row.get(4)?,
        role: parse_col::<AccountRole>(5, &role)?,
        status: parse_col::<AccountStatus>(6, &status)?,
        status_reason: row.get(7)?,
        warmup_day: row.get(8)?,
        warmup_stage: row.get(9)?,
        warmup_advanced_on: advanced
            .map(|d| parse_col::<NaiveDate>(10, &d))
            .transpose()?,
        last_connect_at: parse_opt_ts(11, row.get(11)?)?,
        rate_limited_until: parse_opt_ts(12, row.get(12)?)?,
        created_at: parse_ts(13, &created)?,
    })
}

pub(crate) fn load_account(conn: &Connection, id: &AccountId) -> rusqlite::Result<Option<Account>> {
    conn.query_row(
        &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?1"),
        params![id.0],
        row_to_account,
    )
    .optional()
}

pub(crate) fn write_account_update(
    conn: &Connection,
    id: &AccountId,
    update: &AccountUpdate,
) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE accounts SET status = ?2, status_reason = ?3, rate_limited_until = ?4 WHERE id = ?1",
        params![
            id.0,
            update.status.as_str(),
            update.reason,
            opt_ts(update.rate_limited_until)
        ],
    )?;
    Ok(())
}

impl FleetDb {
    // ─── Accounts ─────────────────────────────────────────────

    /// Register a new account.
    pub fn insert_account(&self, account: &Account) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                &format!("INSERT INTO accounts ({ACCOUNT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"),
                params![
                    account.id.0,
                    account.tenant_id.0,
                    account.handle,
                    account.session_credential,
                    account.proxy,
                    account.role.as_str(),
                    account.status.as_str(),
                    account.status_reason,
                    account.warmup_day,
                    account.warmup_stage,
                    account.warmup_advanced_on.map(|d| d.to_string()),
                    opt_ts(account.last_connect_at),
                    opt_ts(account.rate_limited_until),
                    ts(account.created_at),
                ],
            )?;
            Ok(())
        })
    }

    /// Persist every mutable field of an account.
    pub fn save_account(&self, account: &Account) -> Result<()> {
        let changed = self.with_conn(|conn| {
            conn.execute(
                "UPDATE accounts SET handle = ?2, session_credential = ?3, proxy = ?4, role = ?5, status = ?6,
                     status_reason = ?7, warmup_day = ?8, warmup_stage = ?9, warmup_advanced_on = ?10,
                     last_connect_at = ?11, rate_limited_until = ?12
                 WHERE id = ?1",
                params![
                    account.id.0,
                    account.handle,
                    account.session_credential,
                    account.proxy,
                    account.role.as_str(),
                    account.status.as_str(),
                    account.status_reason,
                    account.warmup_day,
                    account.warmup_stage,
                    account.warmup_advanced_on.map(|d| d.to_string()),
                    opt_ts(account.last_connect_at),
                    opt_ts(account.rate_limited_until),
                ],
            )
        })?;
        if changed == 0 {
            return Err(ReachClawError::not_found(format!("account {}", account.id)));
        }
        Ok(())
    }

    /// Fetch an account visible in `scope`.
    pub fn get_account(&self, scope: &Scope, id: &AccountId) -> Result<Account> {
        let account = self
            .account(id)?
            .ok_or_else(|| ReachClawError::not_found(format!("account {id}")))?;
        self.check_owner(scope, &account.tenant_id, &format!("account {id}"))?;
        Ok(account)
    }

    /// Unscoped lookup for engine operations keyed by account id.
    pub fn account(&self, id: &AccountId) -> Result<Option<Account>> {
        self.with_conn(|conn| load_account(conn, id))
    }

    /// Accounts visible in `scope`, oldest first.
    pub fn list_accounts(&self, scope: &Scope) -> Result<Vec<Account>> {
        let tenant = self.tenant_filter(scope)?;
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE (?1 IS NULL OR tenant_id = ?1) ORDER BY created_at, id"
            ))?;
            let rows = stmt.query_map(params![tenant], row_to_account)?;
            rows.collect()
        })
    }

    /// Every account, for the dispatcher. Not a tenant read.
    pub fn dispatch_accounts(&self) -> Result<Vec<Account>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("SELECT {ACCOUNT_COLUMNS} FROM accounts ORDER BY id"))?;
            let rows = stmt.query_map([], row_to_account)?;
            rows.collect()
        })
    }

    /// Sender accounts of a tenant able to send right now, least recently
    /// connected last.
    pub fn sender_accounts(&self, tenant: &TenantId) -> Result<Vec<Account>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ACCOUNT_COLUMNS} FROM accounts
                 WHERE tenant_id = ?1 AND role = 'sender' AND status IN ('warming_up', 'active')
                 ORDER BY last_connect_at DESC, id"
            ))?;
            let rows = stmt.query_map(params![tenant.0], row_to_account)?;
            rows.collect()
        })
    }

    /// Apply a status change.
    pub fn update_account_status(&self, id: &AccountId, update: &AccountUpdate) -> Result<()> {
        self.with_conn(|conn| write_account_update(conn, id, update))
    }

    /// Persist warm-up counters. Graduation (stage 0) flips `warming_up` to
    /// `active` in the same statement so a concurrent status change wins.
    pub fn record_warmup(&self, account: &Account) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE accounts SET warmup_day = ?2, warmup_stage = ?3, warmup_advanced_on = ?4,
                     status = CASE WHEN ?3 = 0 AND status = 'warming_up' THEN 'active' ELSE status END
                 WHERE id = ?1",
                params![
                    account.id.0,
                    account.warmup_day,
                    account.warmup_stage,
                    account.warmup_advanced_on.map(|d| d.to_string()),
                ],
            )?;
            Ok(())
        })
    }

    pub fn record_connect(&self, id: &AccountId, at: DateTime<Utc>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE accounts SET last_connect_at = ?2 WHERE id = ?1",
                params![id.0, ts(at)],
            )?;
            Ok(())
        })
    }

    /// Delete an account. Refused while any of its messages is not terminal.
    pub fn delete_account(&self, scope: &Scope, id: &AccountId) -> Result<()> {
        self.get_account(scope, id)?;
        let open: i64 = self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM queued_messages
                 WHERE account_id = ?1 AND state IN ('pending', 'sending', 'retrying')",
                params![id.0],
                |r| r.get(0),
            )
        })?;
        if open > 0 {
            return Err(ReachClawError::InvalidState(format!(
                "account {id} still has {open} queued message(s)"
            )));
        }
        // Terminal rows are retained for audit, so the account row stays
        // referenced; disable instead of deleting in that case.
        let audited: i64 = self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM queued_messages WHERE account_id = ?1",
                params![id.0],
                |r| r.get(0),
            )
        })?;
        if audited > 0 {
            return self.update_account_status(id, &AccountUpdate::disabled("removed by operator"));
        }
        self.with_conn(|conn| {
            conn.execute("DELETE FROM accounts WHERE id = ?1", params![id.0])?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender(tenant: &str, id: &str) -> Account {
        Account::new(TenantId::new(tenant), id, format!("+84{id}"), AccountRole::Sender, Some("sess".into()))
    }

    #[test]
    fn test_account_crud_and_scope() {
        let db = FleetDb::open_in_memory(false).unwrap();
        db.insert_account(&sender("t1", "a1")).unwrap();
        db.insert_account(&sender("t2", "b1")).unwrap();

        let a = db.get_account(&Scope::tenant("t1"), &AccountId::new("a1")).unwrap();
        assert_eq!(a.status, AccountStatus::WarmingUp);
        assert_eq!(a.session_credential.as_deref(), Some("sess"));

        // Other tenant sees nothing.
        assert!(matches!(
            db.get_account(&Scope::tenant("t2"), &AccountId::new("a1")),
            Err(ReachClawError::NotFound(_))
        ));
        assert_eq!(db.list_accounts(&Scope::tenant("t2")).unwrap().len(), 1);
        assert!(db.list_accounts(&Scope::Installation).is_err());
        assert_eq!(db.dispatch_accounts().unwrap().len(), 2);
    }

    #[test]
    fn test_status_update_roundtrip() {
        let db = FleetDb::open_in_memory(true).unwrap();
        db.insert_account(&sender("t1", "a1")).unwrap();
        let until = Utc::now() + chrono::Duration::seconds(30);
        db.update_account_status(&AccountId::new("a1"), &AccountUpdate::rate_limited(until, "FLOOD_WAIT_30"))
            .unwrap();
        let a = db.account(&AccountId::new("a1")).unwrap().unwrap();
        assert_eq!(a.status, AccountStatus::RateLimited);
        assert_eq!(a.rate_limited_until.map(|t| t.timestamp_millis()), Some(until.timestamp_millis()));
        assert_eq!(a.status_reason.as_deref(), Some("FLOOD_WAIT_30"));
        assert!(db.sender_accounts(&TenantId::new("t1")).unwrap().is_empty());
    }

    #[test]
    fn test_save_account_warmup_fields() {
        let db = FleetDb::open_in_memory(true).unwrap();
        let mut a = sender("t1", "a1");
        db.insert_account(&a).unwrap();
        a.warmup_day = 4;
        a.warmup_stage = 2;
        a.warmup_advanced_on = NaiveDate::from_ymd_opt(2026, 10, 19);
        db.save_account(&a).unwrap();
        let back = db.get_account(&Scope::Installation, &a.id).unwrap();
        assert_eq!(back.warmup_day, 4);
        assert_eq!(back.warmup_stage, 2);
        assert_eq!(back.warmup_advanced_on, NaiveDate::from_ymd_opt(2026, 10, 19));
    }

    #[test]
    fn test_record_warmup_graduation_respects_current_status() {
        let db = FleetDb::open_in_memory(true).unwrap();
        let mut a = sender("t1", "a1");
        db.insert_account(&a).unwrap();
        db.update_account_status(
            &a.id,
            &AccountUpdate::rate_limited(Utc::now() + chrono::Duration::seconds(60), "FLOOD_WAIT_60"),
        )
        .unwrap();

        a.warmup_day = 12;
        a.warmup_stage = 0;
        db.record_warmup(&a).unwrap();
        let back = db.account(&a.id).unwrap().unwrap();
        assert_eq!(back.warmup_stage, 0);
        assert_eq!(back.status, AccountStatus::RateLimited);

        let b = sender("t1", "b1");
        db.insert_account(&b).unwrap();
        let mut b2 = b.clone();
        b2.warmup_stage = 0;
        db.record_warmup(&b2).unwrap();
        assert_eq!(db.account(&b.id).unwrap().unwrap().status, AccountStatus::Active);
    }
}
