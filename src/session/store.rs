//! Session Store
//! Mission: Durable session records with per-key atomic updates
//!
//! Every mutation runs under the connection lock with a status guard in the
//! SQL, so concurrent model completions and status transitions cannot lose
//! updates, and nothing ever writes over a terminal session.

use crate::models::{ModelOutcome, PredictionSession, SessionStatus};
use crate::session::progress::{evaluate_transition, TransitionOutcome};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    market_id TEXT NOT NULL,
    selected_models TEXT NOT NULL,
    status TEXT NOT NULL,
    step TEXT,
    error TEXT,
    results_json TEXT NOT NULL DEFAULT '{}',
    created_at INTEGER NOT NULL,
    completed_at INTEGER
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_sessions_user_created
    ON sessions(user_id, created_at DESC);

CREATE INDEX IF NOT EXISTS idx_sessions_status_created
    ON sessions(status, created_at);
"#;

pub struct SessionStore {
    conn: Arc<Mutex<Connection>>,
}

impl SessionStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open sessions database at {}", db_path))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize sessions schema")?;

        info!("🗂️  Session store initialized at: {}", db_path);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn create(&self, session: &PredictionSession) -> Result<()> {
        // Pre-serialize outside the lock
        let models_json = serde_json::to_string(&session.selected_models)?;
        let results_json = serde_json::to_string(&session.results)?;

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sessions
             (id, user_id, market_id, selected_models, status, step, error, results_json, created_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                session.id,
                session.user_id,
                session.market_id,
                models_json,
                session.status.as_str(),
                session.step,
                session.error,
                results_json,
                session.created_at.timestamp(),
                session.completed_at.map(|t| t.timestamp()),
            ],
        )
        .context("Failed to insert session")?;

        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<PredictionSession>> {
        let conn = self.conn.lock();
        let raw = conn
            .query_row(
                "SELECT id, user_id, market_id, selected_models, status, step, error,
                        results_json, created_at, completed_at
                 FROM sessions WHERE id = ?1",
                params![id],
                RawSessionRow::from_row,
            )
            .optional()?;

        raw.map(RawSessionRow::into_session).transpose()
    }

    pub fn list_for_user(&self, user_id: &str, limit: usize) -> Result<Vec<PredictionSession>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, market_id, selected_models, status, step, error,
                    results_json, created_at, completed_at
             FROM sessions WHERE user_id = ?1
             ORDER BY created_at DESC LIMIT ?2",
        )?;

        let rows = stmt
            .query_map(params![user_id, limit as i64], RawSessionRow::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter().map(RawSessionRow::into_session).collect()
    }

    /// Atomic status transition, rejected if the stored status is terminal or
    /// the pair is not in the legal table. `step` replaces the phase label
    /// when given, otherwise the existing label is kept.
    pub fn transition(
        &self,
        id: &str,
        to: SessionStatus,
        step: Option<&str>,
    ) -> Result<TransitionOutcome> {
        self.apply_transition(id, to, step, None)
    }

    /// Force the session into ERROR with a message. A no-op (reported via the
    /// outcome) when the session already reached a terminal state.
    pub fn mark_error(&self, id: &str, error: &str) -> Result<TransitionOutcome> {
        self.apply_transition(id, SessionStatus::Error, None, Some(error))
    }

    fn apply_transition(
        &self,
        id: &str,
        to: SessionStatus,
        step: Option<&str>,
        error: Option<&str>,
    ) -> Result<TransitionOutcome> {
        let conn = self.conn.lock();
        let current = current_status(&conn, id)?;

        let outcome = evaluate_transition(current, to);
        if outcome != TransitionOutcome::Applied {
            debug!(
                session_id = id,
                from = current.as_str(),
                to = to.as_str(),
                "Transition rejected"
            );
            return Ok(outcome);
        }

        let completed_at = to.is_terminal().then(|| Utc::now().timestamp());
        // Guard repeated in SQL so the row can never leave a terminal state
        // even if another writer won the race since the read above.
        conn.execute(
            "UPDATE sessions
             SET status = ?2,
                 step = COALESCE(?3, step),
                 error = COALESCE(?4, error),
                 completed_at = COALESCE(?5, completed_at)
             WHERE id = ?1 AND status NOT IN ('finished', 'error')",
            params![id, to.as_str(), step, error, completed_at],
        )?;

        debug!(
            session_id = id,
            from = current.as_str(),
            to = to.as_str(),
            "Session transitioned"
        );
        Ok(TransitionOutcome::Applied)
    }

    /// Append one model outcome. Returns false (without writing) when the
    /// session is terminal or the outcome is already recorded, so recovery
    /// re-dispatch stays idempotent. An outcome for a model the session never
    /// selected is an invariant violation and errors out.
    pub fn append_result(&self, id: &str, outcome: &ModelOutcome) -> Result<bool> {
        let conn = self.conn.lock();

        let (status_str, models_json, results_json): (String, String, String) = conn
            .query_row(
                "SELECT status, selected_models, results_json FROM sessions WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?
            .ok_or_else(|| anyhow!("session {} not found", id))?;

        let status = parse_status(&status_str)?;
        if status.is_terminal() {
            debug!(session_id = id, model = %outcome.model_id, "Result dropped: session terminal");
            return Ok(false);
        }

        let selected: Vec<String> = serde_json::from_str(&models_json)?;
        if !selected.iter().any(|m| m == &outcome.model_id) {
            return Err(anyhow!(
                "model {} was never selected for session {}",
                outcome.model_id,
                id
            ));
        }

        let mut results: HashMap<String, ModelOutcome> = serde_json::from_str(&results_json)?;
        if results.contains_key(&outcome.model_id) {
            debug!(session_id = id, model = %outcome.model_id, "Result dropped: already recorded");
            return Ok(false);
        }
        results.insert(outcome.model_id.clone(), outcome.clone());

        let step = format!("{}/{} models complete", results.len(), selected.len());
        conn.execute(
            "UPDATE sessions SET results_json = ?2, step = ?3
             WHERE id = ?1 AND status NOT IN ('finished', 'error')",
            params![id, serde_json::to_string(&results)?, step],
        )?;

        Ok(true)
    }

    /// Non-terminal sessions created more than `older_than_secs` ago,
    /// oldest first. These are the recovery monitor's candidates.
    pub fn find_stale(&self, older_than_secs: i64) -> Result<Vec<String>> {
        let cutoff = Utc::now().timestamp() - older_than_secs;
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id FROM sessions
             WHERE status NOT IN ('finished', 'error') AND created_at < ?1
             ORDER BY created_at ASC",
        )?;

        let ids = stmt
            .query_map(params![cutoff], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    pub fn delete(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let changes = conn.execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
        Ok(changes > 0)
    }

    #[cfg(test)]
    pub(crate) fn backdate_created_at(&self, id: &str, secs_ago: i64) {
        let ts = Utc::now().timestamp() - secs_ago;
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE sessions SET created_at = ?2 WHERE id = ?1",
            params![id, ts],
        )
        .unwrap();
    }
}

fn current_status(conn: &Connection, id: &str) -> Result<SessionStatus> {
    let status_str: String = conn
        .query_row(
            "SELECT status FROM sessions WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| anyhow!("session {} not found", id))?;
    parse_status(&status_str)
}

fn parse_status(s: &str) -> Result<SessionStatus> {
    SessionStatus::parse(s).ok_or_else(|| anyhow!("unknown session status in store: {}", s))
}

struct RawSessionRow {
    id: String,
    user_id: String,
    market_id: String,
    models_json: String,
    status: String,
    step: Option<String>,
    error: Option<String>,
    results_json: String,
    created_at: i64,
    completed_at: Option<i64>,
}

impl RawSessionRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            market_id: row.get(2)?,
            models_json: row.get(3)?,
            status: row.get(4)?,
            step: row.get(5)?,
            error: row.get(6)?,
            results_json: row.get(7)?,
            created_at: row.get(8)?,
            completed_at: row.get(9)?,
        })
    }

    fn into_session(self) -> Result<PredictionSession> {
        Ok(PredictionSession {
            id: self.id,
            user_id: self.user_id,
            market_id: self.market_id,
            selected_models: serde_json::from_str(&self.models_json)?,
            status: parse_status(&self.status)?,
            step: self.step,
            error: self.error,
            results: serde_json::from_str(&self.results_json)?,
            created_at: timestamp_to_utc(self.created_at)?,
            completed_at: self.completed_at.map(timestamp_to_utc).transpose()?,
        })
    }
}

fn timestamp_to_utc(secs: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0).ok_or_else(|| anyhow!("invalid timestamp {}", secs))
}
