//! Dispatch queue rows.
//!
//! The datastore owns atomicity; the policy deciding *which* transition to
//! make lives with the caller and is passed in as a closure that runs inside
//! the transaction.

use chrono::{DateTime, Duration, Utc};
use reachclaw_core::error::{ReachClawError, Result};
use reachclaw_core::types::{
    Account, AccountId, AccountStatus, ErrorClass, MessageState, NewMessage, Priority, QueuedMessage, Scope, TenantId,
};
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::accounts::{AccountUpdate, load_account, write_account_update};
use crate::{FleetDb, opt_ts, parse_col, parse_json, parse_opt_ts, parse_ts, to_json, ts};

/// What the claim policy sees about a lane before a message is handed out.
#[derive(Debug)]
pub struct LaneSnapshot<'a> {
    pub account: &'a Account,
    pub now: DateTime<Utc>,
    /// Messages of this account currently in `sending`.
    pub in_flight: u32,
    pub sent_last_minute: u32,
    pub sent_last_hour: u32,
    /// Sent since 00:00 UTC.
    pub sent_today: u32,
}

/// Claim policy verdict.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Skip(&'static str),
    /// Hand out the next eligible message, optionally restoring the account
    /// to a working status first (expired rate limit).
    Claim { restore: Option<AccountStatus> },
}

/// Message count per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueCounts {
    pub pending: u64,
    pub sending: u64,
    pub sent: u64,
    pub failed: u64,
    pub retrying: u64,
    pub expired: u64,
}

impl QueueCounts {
    pub fn get(&self, state: MessageState) -> u64 {
        match state {
            MessageState::Pending => self.pending,
            MessageState::Sending => self.sending,
            MessageState::Sent => self.sent,
            MessageState::Failed => self.failed,
            MessageState::Retrying => self.retrying,
            MessageState::Expired => self.expired,
        }
    }

    fn slot(&mut self, state: MessageState) -> &mut u64 {
        match state {
            MessageState::Pending => &mut self.pending,
            MessageState::Sending => &mut self.sending,
            MessageState::Sent => &mut self.sent,
            MessageState::Failed => &mut self.failed,
            MessageState::Retrying => &mut self.retrying,
            MessageState::Expired => &mut self.expired,
        }
    }
}

/// Installation-wide gauges read by the alert engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FleetCounts {
    pub queue: QueueCounts,
    pub failed_since: u64,
    pub sent_since: u64,
    pub accounts_active: u64,
    pub accounts_warming_up: u64,
    pub accounts_rate_limited: u64,
    pub accounts_disabled: u64,
}

const MESSAGE_COLUMNS: &str = "id, tenant_id, account_id, target, payload, priority, state, attempts, local_retries,
     next_eligible_at, expires_at, claimed_at, last_error_class, last_error, created_at, updated_at, sent_at";

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<QueuedMessage> {
    let payload: String = row.get(4)?;
    let priority: u8 = row.get(5)?;
    let state: String = row.get(6)?;
    let next_eligible: String = row.get(9)?;
    let class: Option<String> = row.get(12)?;
    let created: String = row.get(14)?;
    let updated: String = row.get(15)?;
    Ok(QueuedMessage {
        id: row.get(0)?,
        tenant_id: TenantId(row.get(1)?),
        account_id: AccountId(row.get(2)?),
        target: row.get(3)?,
        payload: parse_json(4, &payload)?,
        priority: Priority::from_rank(priority),
        state: parse_col::<MessageState>(6, &state)?,
        attempts: row.get(7)?,
        local_retries: row.get(8)?,
        next_eligible_at: parse_ts(9, &next_eligible)?,
        expires_at: parse_opt_ts(10, row.get(10)?)?,
        claimed_at: parse_opt_ts(11, row.get(11)?)?,
        last_error_class: class.map(|c| parse_col::<ErrorClass>(12, &c)).transpose()?,
        last_error: row.get(13)?,
        created_at: parse_ts(14, &created)?,
        updated_at: parse_ts(15, &updated)?,
        sent_at: parse_opt_ts(16, row.get(16)?)?,
    })
}

fn load_message(conn: &Connection, id: i64) -> rusqlite::Result<Option<QueuedMessage>> {
    conn.query_row(
        &format!("SELECT {MESSAGE_COLUMNS} FROM queued_messages WHERE id = ?1"),
        params![id],
        row_to_message,
    )
    .optional()
}

fn write_message(conn: &Connection, m: &QueuedMessage) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE queued_messages SET priority = ?2, state = ?3, attempts = ?4, local_retries = ?5,
             next_eligible_at = ?6, expires_at = ?7, claimed_at = ?8, last_error_class = ?9, last_error = ?10,
             updated_at = ?11, sent_at = ?12
         WHERE id = ?1",
        params![
            m.id,
            m.priority.rank(),
            m.state.as_str(),
            m.attempts,
            m.local_retries,
            ts(m.next_eligible_at),
            opt_ts(m.expires_at),
            opt_ts(m.claimed_at),
            m.last_error_class.map(|c| c.as_str()),
            m.last_error,
            ts(m.updated_at),
            opt_ts(m.sent_at),
        ],
    )?;
    Ok(())
}

fn count(conn: &Connection, sql: &str, p: impl rusqlite::Params) -> rusqlite::Result<u32> {
    conn.query_row(sql, p, |r| r.get::<_, u32>(0))
}

fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|d| d.and_utc())
        .unwrap_or(now)
}

impl FleetDb {
    // ─── Queue ────────────────────────────────────────────────

    /// Insert a message in `pending`. The account must exist and belong to
    /// the message's tenant.
    pub fn insert_message(&self, msg: &NewMessage, now: DateTime<Utc>) -> Result<QueuedMessage> {
        let account = self
            .account(&msg.account_id)?
            .ok_or_else(|| ReachClawError::not_found(format!("account {}", msg.account_id)))?;
        if account.tenant_id != msg.tenant_id {
            return Err(ReachClawError::TenantIsolation(format!(
                "account {} is not owned by tenant {}",
                msg.account_id, msg.tenant_id
            )));
        }
        let next_eligible = msg.not_before.unwrap_or(now);
        let id = self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO queued_messages
                    (tenant_id, account_id, target, payload, priority, state, attempts, local_retries,
                     next_eligible_at, expires_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'pending', 0, 0, ?6, ?7, ?8, ?8)",
                params![
                    msg.tenant_id.0,
                    msg.account_id.0,
                    msg.target,
                    to_json(&msg.payload)?,
                    msg.priority.rank(),
                    ts(next_eligible),
                    opt_ts(msg.expires_at),
                    ts(now),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        self.message(id)?
            .ok_or_else(|| ReachClawError::database(format!("message {id} vanished after insert")))
    }

    /// Claim the next eligible message of an account.
    ///
    /// In one transaction: expire overdue messages, build the lane snapshot,
    /// ask `admit`, then select by (priority, next_eligible_at, id) and move
    /// the winner to `sending`.
    pub fn claim_next<F>(&self, account_id: &AccountId, now: DateTime<Utc>, admit: F) -> Result<Option<QueuedMessage>>
    where
        F: FnOnce(&LaneSnapshot<'_>) -> Admission,
    {
        let now_s = ts(now);
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let Some(account) = load_account(&tx, account_id)? else {
                return Ok(None);
            };

            let expired = tx.execute(
                "UPDATE queued_messages
                 SET state = 'expired', last_error = 'expired before delivery', updated_at = ?2
                 WHERE account_id = ?1 AND state IN ('pending', 'retrying')
                   AND expires_at IS NOT NULL AND expires_at <= ?2",
                params![account_id.0, now_s],
            )?;
            if expired > 0 {
                tracing::info!(account = %account_id, expired, "⌛ Expired undelivered messages");
            }

            let sent_since = |since: DateTime<Utc>| {
                count(
                    &tx,
                    "SELECT COUNT(*) FROM queued_messages WHERE account_id = ?1 AND state = 'sent' AND sent_at >= ?2",
                    params![account_id.0, ts(since)],
                )
            };
            let snapshot = LaneSnapshot {
                account: &account,
                now,
                in_flight: count(
                    &tx,
                    "SELECT COUNT(*) FROM queued_messages WHERE account_id = ?1 AND state = 'sending'",
                    params![account_id.0],
                )?,
                sent_last_minute: sent_since(now - Duration::seconds(60))?,
                sent_last_hour: sent_since(now - Duration::seconds(3600))?,
                sent_today: sent_since(start_of_day(now))?,
            };

            let restore = match admit(&snapshot) {
                Admission::Skip(reason) => {
                    tracing::trace!(account = %account_id, reason, "lane skipped");
                    tx.commit()?;
                    return Ok(None);
                }
                Admission::Claim { restore } => restore,
            };
            if let Some(status) = restore {
                write_account_update(&tx, account_id, &AccountUpdate::restored(status))?;
            }

            let next = tx
                .query_row(
                    &format!(
                        "SELECT {MESSAGE_COLUMNS} FROM queued_messages
                         WHERE account_id = ?1 AND state IN ('pending', 'retrying') AND next_eligible_at <= ?2
                         ORDER BY priority ASC, next_eligible_at ASC, id ASC
                         LIMIT 1"
                    ),
                    params![account_id.0, now_s],
                    row_to_message,
                )
                .optional()?;
            let Some(mut msg) = next else {
                tx.commit()?;
                return Ok(None);
            };

            msg.state = MessageState::Sending;
            msg.claimed_at = Some(now);
            msg.updated_at = now;
            write_message(&tx, &msg)?;
            tx.commit()?;
            Ok(Some(msg))
        })
    }

    /// Read-modify-write one message in a transaction.
    ///
    /// `f` mutates the message in place and may return an account status
    /// change that is committed together with it. Nothing is written when
    /// `f` leaves the message unchanged and returns `None`.
    pub fn update_message<F>(&self, id: i64, f: F) -> Result<QueuedMessage>
    where
        F: FnOnce(&mut QueuedMessage) -> Option<AccountUpdate>,
    {
        let out = self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let Some(before) = load_message(&tx, id)? else {
                return Ok(None);
            };
            let mut after = before.clone();
            let account_update = f(&mut after);
            if after != before {
                write_message(&tx, &after)?;
            }
            if let Some(update) = &account_update {
                write_account_update(&tx, &after.account_id, update)?;
            }
            tx.commit()?;
            Ok(Some(after))
        })?;
        out.ok_or_else(|| ReachClawError::not_found(format!("message {id}")))
    }

    /// Unscoped lookup for engine operations.
    pub fn message(&self, id: i64) -> Result<Option<QueuedMessage>> {
        self.with_conn(|conn| load_message(conn, id))
    }

    /// Fetch a message visible in `scope`.
    pub fn get_message(&self, scope: &Scope, id: i64) -> Result<QueuedMessage> {
        let msg = self
            .message(id)?
            .ok_or_else(|| ReachClawError::not_found(format!("message {id}")))?;
        self.check_owner(scope, &msg.tenant_id, &format!("message {id}"))?;
        Ok(msg)
    }

    /// Newest messages first, optionally filtered by state.
    pub fn list_messages(&self, scope: &Scope, state: Option<MessageState>, limit: usize) -> Result<Vec<QueuedMessage>> {
        let tenant = self.tenant_filter(scope)?;
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM queued_messages
                 WHERE (?1 IS NULL OR tenant_id = ?1) AND (?2 IS NULL OR state = ?2)
                 ORDER BY id DESC LIMIT ?3"
            ))?;
            let rows = stmt.query_map(
                params![tenant, state.map(|s| s.as_str()), limit as i64],
                row_to_message,
            )?;
            rows.collect()
        })
    }

    pub fn count_by_state(&self, scope: &Scope) -> Result<QueueCounts> {
        let tenant = self.tenant_filter(scope)?;
        self.with_conn(|conn| queue_counts(conn, tenant.as_deref()))
    }

    /// Ids of messages claimed before `before` and still in `sending`.
    pub fn stale_sending(&self, before: DateTime<Utc>) -> Result<Vec<i64>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM queued_messages
                 WHERE state = 'sending' AND (claimed_at IS NULL OR claimed_at <= ?1)
                 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![ts(before)], |r| r.get(0))?;
            rows.collect()
        })
    }

    /// Accounts with at least one message eligible at `now`.
    pub fn accounts_with_work(&self, now: DateTime<Utc>) -> Result<Vec<AccountId>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT account_id FROM queued_messages
                 WHERE state IN ('pending', 'retrying') AND next_eligible_at <= ?1
                 ORDER BY account_id",
            )?;
            let rows = stmt.query_map(params![ts(now)], |r| Ok(AccountId(r.get(0)?)))?;
            rows.collect()
        })
    }

    /// Installation-wide gauges. Internal to the engine, not a tenant read.
    pub fn fleet_counts(&self, since: DateTime<Utc>) -> Result<FleetCounts> {
        let since = ts(since);
        self.with_conn(|conn| {
            let conn: &Connection = conn;
            let queue = queue_counts(conn, None)?;
            let failed_since = count(
                conn,
                "SELECT COUNT(*) FROM queued_messages WHERE state = 'failed' AND updated_at >= ?1",
                params![since],
            )?;
            let sent_since = count(
                conn,
                "SELECT COUNT(*) FROM queued_messages WHERE state = 'sent' AND sent_at >= ?1",
                params![since],
            )?;
            let by_status = |status: AccountStatus| {
                count(conn, "SELECT COUNT(*) FROM accounts WHERE status = ?1", params![status.as_str()])
            };
            Ok(FleetCounts {
                queue,
                failed_since: failed_since.into(),
                sent_since: sent_since.into(),
                accounts_active: by_status(AccountStatus::Active)?.into(),
                accounts_warming_up: by_status(AccountStatus::WarmingUp)?.into(),
                accounts_rate_limited: by_status(AccountStatus::RateLimited)?.into(),
                accounts_disabled: by_status(AccountStatus::Disabled)?.into(),
            })
        })
    }
}

fn queue_counts(conn: &Connection, tenant: Option<&str>) -> rusqlite::Result<QueueCounts> {
    let mut stmt = conn.prepare(
        "SELECT state, COUNT(*) FROM queued_messages WHERE (?1 IS NULL OR tenant_id = ?1) GROUP BY state",
    )?;
    let mut rows = stmt.query(params![tenant])?;
    let mut counts = QueueCounts::default();
    while let Some(row) = rows.next()? {
        let state: String = row.get(0)?;
        let n: i64 = row.get(1)?;
        *counts.slot(parse_col::<MessageState>(0, &state)?) = n.max(0) as u64;
    }
    Ok(counts)
}
