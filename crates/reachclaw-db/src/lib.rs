//! # ReachClaw Datastore
//!
//! SQLite-backed source of truth for accounts, the dispatch queue, keyword
//! sets, trigger rules, alert history and leads.
//!
//! One connection behind a mutex; every multi-row mutation runs in a single
//! transaction so a crash never leaves a message half-transitioned. Every
//! read exposed to tenants takes a [`Scope`] and is filtered by owner unless
//! the store runs in single-tenant mode.

pub mod accounts;
pub mod keywords;
pub mod leads;
pub mod queue;
pub mod rules;

pub use accounts::AccountUpdate;
pub use queue::{Admission, FleetCounts, LaneSnapshot, QueueCounts};

use chrono::{DateTime, SecondsFormat, Utc};
use reachclaw_core::error::{ReachClawError, Result};
use reachclaw_core::types::{Scope, TenantId};
use rusqlite::Connection;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// The ReachClaw datastore.
pub struct FleetDb {
    conn: Mutex<Connection>,
    single_tenant: bool,
}

impl FleetDb {
    /// Open or create the database file.
    pub fn open(path: &Path, busy_timeout: Duration, single_tenant: bool) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(|e| ReachClawError::database(format!("DB open: {e}")))?;
        conn.busy_timeout(busy_timeout).map_err(db_err)?;
        conn.pragma_update(None, "journal_mode", "WAL").map_err(db_err)?;
        Self::init(conn, single_tenant)
    }

    /// In-memory database, used by tests and dry runs.
    pub fn open_in_memory(single_tenant: bool) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::init(conn, single_tenant)
    }

    fn init(conn: Connection, single_tenant: bool) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON").map_err(db_err)?;
        let db = Self {
            conn: Mutex::new(conn),
            single_tenant,
        };
        db.migrate()?;
        Ok(db)
    }

    pub fn is_single_tenant(&self) -> bool {
        self.single_tenant
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "
            -- Chat accounts operated for tenants
            CREATE TABLE IF NOT EXISTS accounts (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                handle TEXT NOT NULL,
                session_credential TEXT,
                proxy TEXT,
                role TEXT NOT NULL,               -- 'listener', 'sender'
                status TEXT NOT NULL,             -- 'unregistered', 'warming_up', 'active', 'rate_limited', 'disabled'
                status_reason TEXT,
                warmup_day INTEGER NOT NULL DEFAULT 0,
                warmup_stage INTEGER NOT NULL DEFAULT 1,
                warmup_advanced_on TEXT,
                last_connect_at TEXT,
                rate_limited_until TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_accounts_tenant ON accounts(tenant_id);

            -- Outbound dispatch queue
            CREATE TABLE IF NOT EXISTS queued_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tenant_id TEXT NOT NULL,
                account_id TEXT NOT NULL REFERENCES accounts(id) ON DELETE RESTRICT,
                target TEXT NOT NULL,
                payload TEXT NOT NULL,            -- JSON Payload
                priority INTEGER NOT NULL DEFAULT 2,
                state TEXT NOT NULL DEFAULT 'pending',
                attempts INTEGER NOT NULL DEFAULT 0,
                local_retries INTEGER NOT NULL DEFAULT 0,
                next_eligible_at TEXT NOT NULL,
                expires_at TEXT,
                claimed_at TEXT,
                last_error_class TEXT,
                last_error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                sent_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_queue_lane
                ON queued_messages(account_id, state, priority, next_eligible_at, id);
            CREATE INDEX IF NOT EXISTS idx_queue_sent ON queued_messages(account_id, sent_at);
            CREATE INDEX IF NOT EXISTS idx_queue_tenant ON queued_messages(tenant_id, state);

            -- Keyword sets
            CREATE TABLE IF NOT EXISTS keyword_sets (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tenant_id TEXT NOT NULL,
                name TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                reply_template TEXT,
                created_at TEXT NOT NULL,
                UNIQUE (tenant_id, name)
            );
            CREATE TABLE IF NOT EXISTS keywords (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                set_id INTEGER NOT NULL REFERENCES keyword_sets(id) ON DELETE CASCADE,
                pattern TEXT NOT NULL,
                is_regex INTEGER NOT NULL DEFAULT 0
            );

            -- Trigger rules
            CREATE TABLE IF NOT EXISTS trigger_rules (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                tenant_id TEXT,
                check_config TEXT NOT NULL,       -- JSON RuleCheck
                severity TEXT NOT NULL,
                cooldown_secs INTEGER,
                message TEXT,
                enabled INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL
            );

            -- Alert history
            CREATE TABLE IF NOT EXISTS alerts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                rule_id TEXT NOT NULL,
                rule_name TEXT NOT NULL,
                tenant_id TEXT,
                severity TEXT NOT NULL,
                message TEXT NOT NULL,
                fired_at TEXT NOT NULL
            );

            -- Scored leads
            CREATE TABLE IF NOT EXISTS leads (
                tenant_id TEXT NOT NULL,
                contact TEXT NOT NULL,
                signals TEXT NOT NULL,            -- JSON ContactSignals
                completeness REAL NOT NULL,
                engagement REAL NOT NULL,
                intent REAL NOT NULL,
                quality REAL NOT NULL,
                recency REAL NOT NULL,
                score REAL NOT NULL,
                stage TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                last_activity_at TEXT,
                PRIMARY KEY (tenant_id, contact)
            );
         ",
            )
        })
        .map_err(|e| ReachClawError::database(format!("Migration: {e}")))
    }

    /// Run `f` with the connection locked.
    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let mut conn = self.lock()?;
        f(&mut conn).map_err(db_err)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| ReachClawError::database("connection mutex poisoned"))
    }

    /// Tenant filter for a read, or an isolation error when an
    /// installation-wide read is attempted in multi-tenant mode.
    pub(crate) fn tenant_filter(&self, scope: &Scope) -> Result<Option<String>> {
        match scope {
            Scope::Tenant(t) => Ok(Some(t.0.clone())),
            Scope::Installation if self.single_tenant => Ok(None),
            Scope::Installation => Err(ReachClawError::TenantIsolation(
                "installation-wide read requires single-tenant mode".into(),
            )),
        }
    }

    /// Reject entities that the caller's scope cannot see.
    pub(crate) fn check_owner(&self, scope: &Scope, owner: &TenantId, what: &str) -> Result<()> {
        self.tenant_filter(scope)?;
        if scope.admits(owner) {
            Ok(())
        } else {
            // Same answer as a missing row: existence must not leak across tenants.
            Err(ReachClawError::not_found(what.to_string()))
        }
    }
}

pub(crate) fn db_err(e: rusqlite::Error) -> ReachClawError {
    match e {
        rusqlite::Error::QueryReturnedNoRows => ReachClawError::not_found("no matching row"),
        other => ReachClawError::Database(other.to_string()),
    }
}

/// Timestamps are stored as fixed-width RFC 3339 UTC text, which sorts
/// chronologically.
pub(crate) fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn opt_ts(dt: Option<DateTime<Utc>>) -> Option<String> {
    dt.map(ts)
}

pub(crate) fn parse_ts(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

pub(crate) fn parse_opt_ts(idx: usize, s: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    s.map(|s| parse_ts(idx, &s)).transpose()
}

pub(crate) fn parse_col<T>(idx: usize, s: &str) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    s.parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

pub(crate) fn parse_json<T: serde::de::DeserializeOwned>(idx: usize, s: &str) -> rusqlite::Result<T> {
    serde_json::from_str(s)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

pub(crate) fn to_json<T: serde::Serialize>(v: &T) -> rusqlite::Result<String> {
    serde_json::to_string(v).map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}
