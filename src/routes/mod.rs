//! Routes gateway: merges the per-area subrouters over one shared state.

use std::sync::Arc;

use axum::Router;

use crate::context::ContextManager;
use crate::session::SessionPipeline;

mod content;
mod device;
mod firmware;
mod health;

// ---

/// Shared handles for every handler.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<SessionPipeline>,
    pub contexts: ContextManager,
}

impl AppState {
    pub fn new(pipeline: Arc<SessionPipeline>) -> Self {
        let contexts = pipeline.contexts().clone();
        Self { pipeline, contexts }
    }
}

pub fn router(state: AppState) -> Router {
    // ---
    Router::new()
        .merge(device::router())
        .merge(firmware::router())
        .merge(content::router())
        .merge(health::router())
        .with_state(state)
}
