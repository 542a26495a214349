//! Shared Domain Types
//! Mission: One place for the session record, model outcomes, and app config

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Maximum number of models a single session may select.
pub const MAX_MODELS_PER_SESSION: usize = 5;

/// Session lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Initializing,
    Queued,
    Researching,
    Generating,
    Finished,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Initializing => "initializing",
            SessionStatus::Queued => "queued",
            SessionStatus::Researching => "researching",
            SessionStatus::Generating => "generating",
            SessionStatus::Finished => "finished",
            SessionStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "initializing" => Some(SessionStatus::Initializing),
            "queued" => Some(SessionStatus::Queued),
            "researching" => Some(SessionStatus::Researching),
            "generating" => Some(SessionStatus::Generating),
            "finished" => Some(SessionStatus::Finished),
            "error" => Some(SessionStatus::Error),
            _ => None,
        }
    }

    /// FINISHED and ERROR are terminal; nothing transitions out of them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Finished | SessionStatus::Error)
    }
}

/// Result of one model invocation within a session.
/// Exactly one of `payload` / `error_message` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelOutcome {
    pub model_id: String,
    pub succeeded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub completed_at: DateTime<Utc>,
}

impl ModelOutcome {
    pub fn success(model_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            model_id: model_id.into(),
            succeeded: true,
            payload: Some(payload),
            error_message: None,
            completed_at: Utc::now(),
        }
    }

    pub fn failure(model_id: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            succeeded: false,
            payload: None,
            error_message: Some(error_message.into()),
            completed_at: Utc::now(),
        }
    }
}

/// One user-initiated request to run 1-5 models against a market.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionSession {
    pub id: String,
    pub user_id: String,
    pub market_id: String,
    pub selected_models: Vec<String>,
    pub status: SessionStatus,
    pub step: Option<String>,
    pub error: Option<String>,
    pub results: HashMap<String, ModelOutcome>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl PredictionSession {
    pub fn new(
        user_id: impl Into<String>,
        market_id: impl Into<String>,
        selected_models: Vec<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            market_id: market_id.into(),
            selected_models,
            status: SessionStatus::Initializing,
            step: None,
            error: None,
            results: HashMap::new(),
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Selected models without a recorded outcome yet, in selection order.
    /// Recovery re-dispatch retries exactly these.
    pub fn outstanding_models(&self) -> Vec<String> {
        self.selected_models
            .iter()
            .filter(|m| !self.results.contains_key(m.as_str()))
            .cloned()
            .collect()
    }

    /// Snapshot shape shared by the REST status endpoint and every SSE event.
    pub fn snapshot(&self) -> SessionSnapshot {
        let results: Vec<ModelOutcome> = self
            .selected_models
            .iter()
            .filter_map(|m| self.results.get(m.as_str()).cloned())
            .collect();

        SessionSnapshot {
            session_id: self.id.clone(),
            market_id: self.market_id.clone(),
            status: self.status,
            step: self.step.clone(),
            completed_models: results.len(),
            total_models: self.selected_models.len(),
            results,
            error: self.error.clone(),
            created_at: self.created_at,
            completed_at: self.completed_at,
        }
    }
}

/// Read-only view of a session, in selection order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub market_id: String,
    pub status: SessionStatus,
    pub step: Option<String>,
    pub completed_models: usize,
    pub total_models: usize,
    pub results: Vec<ModelOutcome>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub sessions_db_path: String,
    pub credits_db_path: String,
    pub jwt_secret: String,
    pub starting_credits: i64,
    pub dispatch_workers: usize,
    pub provider_concurrency: usize,
    pub provider_timeout_secs: u64,
    pub sse_poll_ms: u64,
    pub stuck_threshold_secs: i64,
    pub recovery_poll_secs: u64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let port = std::env::var("FORESIGHT_PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .unwrap_or(3000);

        let sessions_db_path = std::env::var("SESSIONS_DB_PATH")
            .unwrap_or_else(|_| "./foresight_sessions.db".to_string());

        let credits_db_path = std::env::var("CREDITS_DB_PATH")
            .unwrap_or_else(|_| "./foresight_credits.db".to_string());

        let jwt_secret = std::env::var("JWT_SECRET")
            .unwrap_or_else(|_| "dev-secret-change-in-production-minimum-32-characters".to_string());

        let starting_credits = env_i64("STARTING_CREDITS", 20);
        let dispatch_workers = env_u64("DISPATCH_WORKERS", 2).max(1) as usize;
        let provider_concurrency = env_u64("PROVIDER_CONCURRENCY", 4).max(1) as usize;
        let provider_timeout_secs = env_u64("PROVIDER_TIMEOUT_SECS", 30);
        let sse_poll_ms = env_u64("SSE_POLL_MS", 1000).max(100);

        // Heuristic: sessions older than this without a terminal status are
        // presumed abandoned. Tune upward if legitimately slow models trip it.
        let stuck_threshold_secs = env_i64("STUCK_SESSION_THRESHOLD_SECS", 300);
        let recovery_poll_secs = env_u64("RECOVERY_POLL_SECS", 60).max(5);

        Ok(Self {
            port,
            sessions_db_path,
            credits_db_path,
            jwt_secret,
            starting_credits,
            dispatch_workers,
            provider_concurrency,
            provider_timeout_secs,
            sse_poll_ms,
            stuck_threshold_secs,
            recovery_poll_secs,
        })
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_i64(name: &str, default: i64) -> i64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<i64>().ok())
        .filter(|v| *v >= 0)
        .unwrap_or(default)
}
