//! API Routes
//! Mission: Owner-scoped session CRUD and credit queries behind JWT auth

use axum::{
    extract::{Path, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Extension, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::{auth_middleware, Claims, JwtHandler};
use crate::credits::{CreditBalance, CreditLedger};
use crate::models::{PredictionSession, SessionSnapshot};
use crate::registry::ModelRegistry;
use crate::session::{
    AdmissionController, AdmissionError, RecoveryMonitor, RecoveryOutcome, SessionStore,
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<SessionStore>,
    pub ledger: Arc<CreditLedger>,
    pub registry: Arc<ModelRegistry>,
    pub admission: AdmissionController,
    pub recovery: Arc<RecoveryMonitor>,
    pub sse_poll: Duration,
}

/// Create the API router
pub fn create_router(state: AppState, jwt_handler: Arc<JwtHandler>) -> Router {
    let protected = Router::new()
        .route("/api/sessions", post(create_session).get(list_sessions))
        .route(
            "/api/sessions/:id",
            get(get_session).delete(delete_session),
        )
        .route("/api/sessions/:id/stream", get(crate::api::stream::stream_session))
        .route("/api/sessions/:id/recover", post(recover_session))
        .route("/api/models", get(get_models))
        .route("/api/credits", get(get_credits))
        .route_layer(middleware::from_fn_with_state(jwt_handler, auth_middleware))
        .with_state(state.clone());

    let public = Router::new()
        .route("/health", get(health_check))
        .with_state(state);

    Router::new().merge(public).merge(protected)
}

// ===== Route Handlers =====

/// Health check endpoint
async fn health_check() -> &'static str {
    "🔮 Foresight Operational - Session Orchestration ACTIVE"
}

/// Admit a new prediction session
async fn create_session(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<CreateSessionResponse>), ApiError> {
    let session_id =
        state
            .admission
            .start_session(claims.user_id(), &req.market_id, req.selected_models)?;

    Ok((
        StatusCode::CREATED,
        Json(CreateSessionResponse { session_id }),
    ))
}

/// Current snapshot of one session (owner-scoped)
async fn get_session(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<String>,
) -> Result<Json<SessionSnapshot>, ApiError> {
    let session = load_owned(&state.store, &claims, &id)?;
    Ok(Json(session.snapshot()))
}

/// Recent sessions for the caller, newest first
async fn list_sessions(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<SessionListResponse>, ApiError> {
    let sessions = state.store.list_for_user(claims.user_id(), 50)?;
    let sessions: Vec<SessionSnapshot> = sessions.iter().map(PredictionSession::snapshot).collect();

    Ok(Json(SessionListResponse {
        count: sessions.len(),
        sessions,
    }))
}

/// Owner-scoped delete
async fn delete_session(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    load_owned(&state.store, &claims, &id)?;
    state.store.delete(&id)?;
    Ok(Json(json!({ "deleted": true })))
}

/// Manual recovery trigger for one session
async fn recover_session(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<String>,
    Json(req): Json<RecoverSessionRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    load_owned(&state.store, &claims, &id)?;

    let reason = req
        .reason
        .filter(|r| !r.trim().is_empty())
        .unwrap_or_else(|| "manual".to_string());
    let outcome = state.recovery.recover_session(&id, &reason)?;

    match outcome {
        RecoveryOutcome::Requeued => Ok(Json(json!({ "requeued": true }))),
        RecoveryOutcome::AlreadyTerminal => Ok(Json(json!({ "requeued": false }))),
        // load_owned already 404'd unknown ids; a delete racing us lands here.
        RecoveryOutcome::NotFound => {
            Err(ApiError::NotFound(format!("Session {} not found", id)))
        }
    }
}

/// Models available for session selection
async fn get_models(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "models": state.registry.available() }))
}

/// Credit balance for the caller
async fn get_credits(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<CreditBalance>, ApiError> {
    let balance = state.ledger.balance(claims.user_id())?;
    Ok(Json(balance))
}

/// Load a session and enforce owner scope. 404 before 403 so a caller
/// cannot probe which session ids exist.
pub(crate) fn load_owned(
    store: &SessionStore,
    claims: &Claims,
    id: &str,
) -> Result<PredictionSession, ApiError> {
    let session = store
        .get(id)?
        .ok_or_else(|| ApiError::NotFound(format!("Session {} not found", id)))?;

    if session.user_id != claims.user_id() {
        return Err(ApiError::Forbidden);
    }
    Ok(session)
}

// ===== Request/Response Types =====

#[derive(Deserialize)]
struct CreateSessionRequest {
    market_id: String,
    selected_models: Vec<String>,
}

#[derive(Serialize)]
struct CreateSessionResponse {
    session_id: String,
}

#[derive(Serialize)]
struct SessionListResponse {
    count: usize,
    sessions: Vec<SessionSnapshot>,
}

#[derive(Deserialize)]
struct RecoverSessionRequest {
    #[serde(default)]
    reason: Option<String>,
}

// ===== Error Handling =====

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    PaymentRequired { available: i64, required: i64 },
    Forbidden,
    NotFound(String),
    Internal(anyhow::Error),
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err)
    }
}

impl From<AdmissionError> for ApiError {
    fn from(err: AdmissionError) -> Self {
        match err {
            AdmissionError::Validation(msg) => ApiError::BadRequest(msg),
            AdmissionError::InsufficientCredits {
                available,
                required,
            } => ApiError::PaymentRequired {
                available,
                required,
            },
            AdmissionError::Infrastructure(e) => ApiError::Internal(e),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            ApiError::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                json!({ "error": msg }),
            ),
            ApiError::PaymentRequired {
                available,
                required,
            } => (
                StatusCode::PAYMENT_REQUIRED,
                json!({
                    "error": "insufficient credits",
                    "available": available,
                    "required": required,
                }),
            ),
            ApiError::Forbidden => (
                StatusCode::FORBIDDEN,
                json!({ "error": "Not your session" }),
            ),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, json!({ "error": msg })),
            ApiError::Internal(err) => {
                tracing::error!("Internal error: {err:#}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "Internal server error" }),
                )
            }
        };

        (status, Json(body)).into_response()
    }
}
