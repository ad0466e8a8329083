//! Dashboard content endpoints: paginated listing and explicit deletion of
//! messages, notes and captures.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get},
    Json, Router,
};
use serde_json::Value;
use tracing::{debug, info};

use super::AppState;
use crate::error::AppError;
use crate::models::{ContentKind, Page, Paginated};
use crate::sync::SyncEvent;

// ---

/// Largest page a dashboard may request.
const MAX_PAGE_LIMIT: usize = 100;

pub fn router() -> Router<AppState> {
    // ---
    Router::new()
        .route("/api/dash/devices/{deviceId}/{kind}", get(list))
        .route("/api/dash/devices/{deviceId}/{kind}/{entryId}", delete(remove))
}

fn parse_kind(kind: &str) -> Result<ContentKind, AppError> {
    kind.parse().map_err(AppError::NotFound)
}

async fn require_device(state: &AppState, device_id: &str) -> Result<(), AppError> {
    // ---
    if state.contexts.repos().documents.device_exists(device_id).await? {
        Ok(())
    } else {
        Err(AppError::NotFound(format!("device '{device_id}' not found")))
    }
}

async fn list(
    State(state): State<AppState>,
    Path((device_id, kind)): Path<(String, String)>,
    Query(page): Query<Page>,
) -> Result<Json<Paginated<Value>>, AppError> {
    // ---
    let kind = parse_kind(&kind)?;
    if page.limit == 0 || page.limit > MAX_PAGE_LIMIT {
        return Err(AppError::Validation(format!(
            "limit must be between 1 and {MAX_PAGE_LIMIT}"
        )));
    }
    require_device(&state, &device_id).await?;

    debug!("GET /api/dash/devices/{}/{} - {:?}", device_id, kind.as_str(), page);
    let page = state.contexts.repos().content.list(&device_id, kind, page).await?;
    Ok(Json(page))
}

async fn remove(
    State(state): State<AppState>,
    Path((device_id, kind, entry_id)): Path<(String, String, String)>,
) -> Result<StatusCode, AppError> {
    // ---
    let kind = parse_kind(&kind)?;
    require_device(&state, &device_id).await?;

    state.contexts.repos().content.remove(&device_id, kind, &entry_id).await?;
    info!("Deleted {} entry {} for {}", kind.as_str(), entry_id, device_id);

    // Dashboards refetch the collection on an empty update
    state.contexts.sync().publish(SyncEvent::ContentUpdate {
        device_id,
        kind,
        entries: Vec::new(),
        next_start_after: None,
    });
    Ok(StatusCode::NO_CONTENT)
}
