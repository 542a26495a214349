//! Foresight Backend
//! Mission: Orchestrate multi-model prediction sessions for the dashboard
//!
//! A session is one user request to have several AI models analyze one
//! prediction market. Admission charges credits up front, a worker pool
//! fans the model calls out concurrently, progress is tracked through an
//! explicit state machine, and the dashboard watches it all over SSE.

pub mod api;
pub mod auth;
pub mod credits;
pub mod models;
pub mod provider;
pub mod registry;
pub mod session;
