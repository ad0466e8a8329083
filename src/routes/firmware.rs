//! Firmware download with byte-range support.
//!
//! Devices fetch large images in pieces. The queued update is consumed once a
//! response reaches the final byte of the file.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tracing::{debug, error};

use super::AppState;
use crate::error::AppError;

// ---

pub fn router() -> Router<AppState> {
    Router::new().route("/api/dev/{deviceId}/firmware", get(handler))
}

/// Inclusive byte range within a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ByteRange {
    start: u64,
    end: u64,
}

/// Parse a single `bytes=` range against a file of `len` bytes.
///
/// `Ok(None)` means no usable Range header, so the whole file is served.
fn parse_range(value: &str, len: u64) -> Result<Option<ByteRange>, AppError> {
    // ---
    let Some(spec) = value.trim().strip_prefix("bytes=") else {
        return Ok(None);
    };
    // Multipart ranges are not supported; serve the whole file
    if spec.contains(',') {
        return Ok(None);
    }
    let Some((start, end)) = spec.split_once('-') else {
        return Ok(None);
    };

    let unsatisfiable = || AppError::RangeNotSatisfiable(len);
    let parse = |s: &str| s.trim().parse::<u64>().map_err(|_| unsatisfiable());

    let range = match (start.trim().is_empty(), end.trim().is_empty()) {
        // bytes=-N: the last N bytes
        (true, false) => {
            let suffix = parse(end)?;
            if suffix == 0 || len == 0 {
                return Err(unsatisfiable());
            }
            ByteRange {
                start: len.saturating_sub(suffix),
                end: len - 1,
            }
        }
        (false, true) => ByteRange {
            start: parse(start)?,
            end: len.saturating_sub(1),
        },
        (false, false) => ByteRange {
            start: parse(start)?,
            end: parse(end)?.min(len.saturating_sub(1)),
        },
        (true, true) => return Ok(None),
    };

    if len == 0 || range.start >= len || range.start > range.end {
        return Err(unsatisfiable());
    }
    Ok(Some(range))
}

async fn handler(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    // ---
    let ctx = state.contexts.load(&device_id).await?;
    let file = match (&ctx.settings.firmware_update_file, ctx.settings.do_firmware_update.is_armed()) {
        (Some(file), true) => file.clone(),
        _ => return Err(AppError::NotFound(format!("no firmware update queued for '{device_id}'"))),
    };

    let image = state.contexts.media().load(&file).await?;
    let len = image.len() as u64;

    let range = match headers.get(header::RANGE).and_then(|v| v.to_str().ok()) {
        Some(value) => parse_range(value, len)?,
        None => None,
    };

    let (status, body, reaches_end, content_range) = match range {
        Some(r) => (
            StatusCode::PARTIAL_CONTENT,
            image.slice(r.start as usize..=r.end as usize),
            r.end + 1 == len,
            Some(format!("bytes {}-{}/{}", r.start, r.end, len)),
        ),
        None => (StatusCode::OK, image, true, None),
    };
    debug!(
        "GET /api/dev/{}/firmware - {} of {} bytes ({})",
        device_id,
        body.len(),
        len,
        file
    );

    if reaches_end {
        if let Err(e) = state.contexts.consume_firmware_update(&device_id).await {
            error!("Failed to clear firmware update for {}: {}", device_id, e);
        }
    }

    Ok(firmware_response(status, body, content_range))
}

fn firmware_response(status: StatusCode, body: Bytes, content_range: Option<String>) -> Response {
    // ---
    let mut response = (
        status,
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::ACCEPT_RANGES, "bytes".to_string()),
        ],
        body,
    )
        .into_response();

    if let Some(value) = content_range.and_then(|v| v.parse().ok()) {
        response.headers_mut().insert(header::CONTENT_RANGE, value);
    }
    response
}
