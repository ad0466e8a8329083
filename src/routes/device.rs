//! Device-facing endpoints: framed sessions and out-of-band WiFi location.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, info};

use super::AppState;
use crate::error::AppError;
use crate::framing::WifiScanEntry;
use crate::models::{LocationSource, MAX_WIFI_NETWORKS};
use crate::session::SessionReply;

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new()
        .route("/api/dev/handle", post(handle))
        .route("/api/dev/update-status", post(update_status))
        .route("/api/dev/{deviceId}/wifi-location", post(wifi_location))
}

fn framed(reply: SessionReply) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/octet-stream")],
        reply.body,
    )
        .into_response()
}

async fn handle(State(state): State<AppState>, body: Bytes) -> Result<Response, AppError> {
    // ---
    debug!("POST /api/dev/handle - {} bytes", body.len());
    let reply = state.pipeline.handle_assistant(body).await?;
    Ok(framed(reply))
}

async fn update_status(State(state): State<AppState>, body: Bytes) -> Result<Response, AppError> {
    // ---
    debug!("POST /api/dev/update-status - {} bytes", body.len());
    let reply = state.pipeline.handle_status(body).await?;
    Ok(framed(reply))
}

#[derive(Debug, Deserialize)]
struct WifiLocationBody {
    networks: Vec<WifiScanEntry>,
}

async fn wifi_location(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Json(body): Json<WifiLocationBody>,
) -> Result<StatusCode, AppError> {
    // ---
    if body.networks.is_empty() {
        return Err(AppError::Validation("networks must not be empty".to_string()));
    }
    if !state.contexts.repos().documents.device_exists(&device_id).await? {
        return Err(AppError::NotFound(format!("device '{device_id}' not found")));
    }

    let mut networks = body.networks;
    networks.sort_by(|a, b| b.rssi.cmp(&a.rssi));
    networks.truncate(MAX_WIFI_NETWORKS);

    let fix = state.pipeline.services().maps.geolocate_wifi(&networks).await?;
    let taken = state
        .contexts
        .offer_location(&device_id, fix, LocationSource::Wifi, Utc::now())
        .await?;

    info!(
        "WiFi location for {} (±{} m) {}",
        device_id,
        fix.accuracy,
        if taken { "accepted" } else { "kept previous" }
    );
    Ok(StatusCode::NO_CONTENT)
}
