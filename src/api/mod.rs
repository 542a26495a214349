//! HTTP API
//! Mission: REST surface plus the SSE progress stream

pub mod routes;
pub mod stream;

pub use routes::{create_router, ApiError, AppState};
