//! HTTP-facing error taxonomy.
//!
//! Every failure that reaches a handler is turned into a JSON body of the
//! form `{"error": {"message": ...}}` so the device always gets a reply.

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::audio::AudioError;
use crate::framing::FrameError;
use crate::repository::RepoError;
use crate::services::ProviderError;

// ---

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("requested range is not satisfiable for {0} bytes")]
    RangeNotSatisfiable(u64),

    #[error("audio processing failed: {0}")]
    Audio(#[from] AudioError),

    #[error("provider failed: {0}")]
    Provider(#[from] ProviderError),

    #[error("storage failed: {0}")]
    Repository(#[from] RepoError),

    #[error("media access failed: {0}")]
    Media(#[from] std::io::Error),

    #[error("response encoding failed: {0}")]
    Encoding(String),
}

impl From<FrameError> for AppError {
    fn from(err: FrameError) -> Self {
        // ---
        match err {
            FrameError::Oversized(_) => AppError::Encoding(err.to_string()),
            _ => AppError::Validation(err.to_string()),
        }
    }
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        // ---
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::RangeNotSatisfiable(_) => StatusCode::RANGE_NOT_SATISFIABLE,
            AppError::Audio(_)
            | AppError::Provider(_)
            | AppError::Repository(_)
            | AppError::Media(_)
            | AppError::Encoding(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        // ---
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        } else {
            tracing::debug!("Request rejected ({}): {}", status, self);
        }

        let mut response = (status, Json(json!({"error": {"message": self.to_string()}}))).into_response();
        if let AppError::RangeNotSatisfiable(len) = self {
            if let Ok(value) = format!("bytes */{len}").parse() {
                response.headers_mut().insert(header::CONTENT_RANGE, value);
            }
        }
        response
    }
}
