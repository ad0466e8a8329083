// src/routes/health.rs
//! API health check endpoint for the pinlink backend.
//!
//! This module defines the `/health` route used by container orchestrators
//! and CI pipelines to verify that the service is running and able to respond
//! to HTTP requests. It follows the same layout as its sibling route modules:
//! - Internal to this file: endpoint handler(s) and related types
//! - Exports to the gateway (`mod.rs`): a subrouter containing the `/health` route

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use super::AppState;

/// JSON response body for the `/health` endpoint.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    /// Selected repository backend, `memory` or `postgres`.
    backend: &'static str,
}

/// Handle `GET /health`.
///
/// Returns a static JSON object indicating the API is reachable. It does not
/// touch the database or any external provider.
async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        backend: state.contexts.repos().backend_name,
    })
}

/// Create a subrouter containing the `/health` route.
pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health))
}
