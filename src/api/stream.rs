//! Streaming Gateway
//! Mission: Push live session progress to the dashboard over SSE
//!
//! The gateway is a read-only observer: it polls the session store and
//! never writes state. Ownership is checked once before the stream opens;
//! after that, store failures surface as a terminal `error` event rather
//! than a broken connection with no explanation.

use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
    Extension,
};
use futures_util::stream::{Stream, StreamExt};
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

use crate::api::routes::{load_owned, ApiError, AppState};
use crate::auth::Claims;
use crate::session::SessionStore;

/// GET /api/sessions/:id/stream
///
/// Emits `connected` once, then `progress` events until the session reaches
/// a terminal state, which is delivered as a final `complete` event. A
/// client that connects after the session already finished gets `connected`
/// followed immediately by `complete`.
pub async fn stream_session(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let session = load_owned(&state.store, &claims, &id)?;
    debug!(session_id = %session.id, "SSE client connected");

    let events = session_events(state.store.clone(), session.id, state.sse_poll)
        .map(|(name, data)| Ok(Event::default().event(name).data(data)));

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

/// Poll loop behind the SSE endpoint, yielding (event name, JSON payload)
/// pairs. Reads the store before every sleep so terminal states are
/// delivered without waiting out a poll interval.
fn session_events(
    store: Arc<SessionStore>,
    session_id: String,
    poll: Duration,
) -> impl Stream<Item = (&'static str, String)> {
    async_stream::stream! {
        yield (
            "connected",
            json!({ "session_id": session_id }).to_string(),
        );

        loop {
            match store.get(&session_id) {
                Ok(Some(session)) => {
                    let snapshot = session.snapshot();
                    let payload = match serde_json::to_string(&snapshot) {
                        Ok(p) => p,
                        Err(e) => {
                            error!(session_id, "Failed to serialize snapshot: {e:#}");
                            yield ("error", json!({ "error": "internal error" }).to_string());
                            break;
                        }
                    };

                    if session.status.is_terminal() {
                        yield ("complete", payload);
                        break;
                    }
                    yield ("progress", payload);
                }
                Ok(None) => {
                    // Deleted mid-stream; tell the client instead of
                    // polling a ghost forever.
                    yield ("error", json!({ "error": "session no longer exists" }).to_string());
                    break;
                }
                Err(e) => {
                    error!(session_id, "SSE store read failed: {e:#}");
                    yield ("error", json!({ "error": "internal error" }).to_string());
                    break;
                }
            }

            tokio::time::sleep(poll).await;
        }

        debug!(session_id, "SSE stream closed");
    }
}
