//! Credit Ledger
//! Mission: Atomic per-user credit balances backing session admission
//!
//! One credit buys one model invocation. Reserve happens exactly once per
//! admitted session; refunds only compensate for work that never started.

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS credit_accounts (
    user_id TEXT PRIMARY KEY,
    balance INTEGER NOT NULL,
    total_spent INTEGER NOT NULL DEFAULT 0,
    updated_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS credit_activity (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    delta INTEGER NOT NULL,
    reason TEXT NOT NULL,
    ts INTEGER NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_credit_activity_user_ts
    ON credit_activity(user_id, ts DESC);
"#;

/// Outcome of an atomic reserve attempt. Insufficient balances leave the
/// account untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReserveOutcome {
    Reserved,
    Insufficient { available: i64, required: i64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditBalance {
    pub balance: i64,
    pub total_spent: i64,
}

/// SQLite-backed credit ledger. The connection mutex serializes every
/// balance mutation, so check-and-decrement is atomic under concurrent
/// admissions.
pub struct CreditLedger {
    conn: Arc<Mutex<Connection>>,
    starting_credits: i64,
}

impl CreditLedger {
    pub fn new(db_path: &str, starting_credits: i64) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open credits database at {}", db_path))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize credits schema")?;

        info!("💳 Credit ledger initialized at: {}", db_path);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            starting_credits,
        })
    }

    /// Atomically check balance >= amount and decrement, bumping total_spent.
    /// First sight of a user seeds their account with the starting balance.
    pub fn reserve(&self, user_id: &str, amount: i64, reason: &str) -> Result<ReserveOutcome> {
        if amount <= 0 {
            anyhow::bail!("reserve amount must be positive, got {}", amount);
        }

        let now = Utc::now().timestamp();
        let conn = self.conn.lock();
        ensure_account(&conn, user_id, self.starting_credits, now)?;

        let changes = conn.execute(
            "UPDATE credit_accounts
             SET balance = balance - ?2, total_spent = total_spent + ?2, updated_at = ?3
             WHERE user_id = ?1 AND balance >= ?2",
            params![user_id, amount, now],
        )?;

        if changes == 0 {
            let available: i64 = conn.query_row(
                "SELECT balance FROM credit_accounts WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )?;
            return Ok(ReserveOutcome::Insufficient {
                available,
                required: amount,
            });
        }

        log_activity(&conn, user_id, -amount, reason, now);
        Ok(ReserveOutcome::Reserved)
    }

    /// Compensating refund for credits charged against work that never ran.
    pub fn refund(&self, user_id: &str, amount: i64, reason: &str) -> Result<()> {
        if amount <= 0 {
            anyhow::bail!("refund amount must be positive, got {}", amount);
        }

        let now = Utc::now().timestamp();
        let conn = self.conn.lock();
        ensure_account(&conn, user_id, self.starting_credits, now)?;

        conn.execute(
            "UPDATE credit_accounts
             SET balance = balance + ?2, total_spent = MAX(total_spent - ?2, 0), updated_at = ?3
             WHERE user_id = ?1",
            params![user_id, amount, now],
        )?;
        log_activity(&conn, user_id, amount, reason, now);

        warn!(user_id, amount, reason, "💸 Credits refunded");
        Ok(())
    }

    pub fn balance(&self, user_id: &str) -> Result<CreditBalance> {
        let now = Utc::now().timestamp();
        let conn = self.conn.lock();
        ensure_account(&conn, user_id, self.starting_credits, now)?;

        let (balance, total_spent) = conn.query_row(
            "SELECT balance, total_spent FROM credit_accounts WHERE user_id = ?1",
            params![user_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        Ok(CreditBalance {
            balance,
            total_spent,
        })
    }
}

fn ensure_account(conn: &Connection, user_id: &str, starting: i64, now: i64) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO credit_accounts (user_id, balance, total_spent, updated_at)
         VALUES (?1, ?2, 0, ?3)",
        params![user_id, starting, now],
    )
    .context("Failed to seed credit account")?;
    Ok(())
}

fn log_activity(conn: &Connection, user_id: &str, delta: i64, reason: &str, ts: i64) {
    // Activity log is best-effort history; a failed insert never blocks the
    // balance mutation that already committed.
    let _ = conn.execute(
        "INSERT INTO credit_activity (id, user_id, delta, reason, ts)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![Uuid::new_v4().to_string(), user_id, delta, reason, ts],
    );
}
