//! Location fusion: whether a newly observed location supersedes the stored one.

use chrono::{DateTime, Utc};

use crate::models::{DeviceData, LocationSource};

// ---

/// After this long, a less accurate candidate still replaces the stored
/// location so that a degraded fix keeps getting refreshed.
pub const LOCATION_STALE_AFTER_MS: i64 = 10 * 60 * 1000;

/// Accuracy assumed for a GNSS fix that did not report one, in meters.
pub const DEFAULT_GNSS_ACCURACY_M: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocationCandidate {
    pub latitude: f64,
    pub longitude: f64,
    /// Meters; lower is better.
    pub accuracy: f64,
    pub source: LocationSource,
}

/// Whether `candidate_accuracy` should replace the stored location.
pub fn should_replace(
    stored_accuracy: Option<f64>,
    stored_at: Option<DateTime<Utc>>,
    candidate_accuracy: f64,
    now: DateTime<Utc>,
) -> bool {
    // ---
    let Some(stored_accuracy) = stored_accuracy else {
        return true;
    };
    if candidate_accuracy < stored_accuracy {
        return true;
    }
    match stored_at {
        Some(at) => (now - at).num_milliseconds() >= LOCATION_STALE_AFTER_MS,
        None => true,
    }
}

/// Offer `candidate` to `data`; returns whether it was taken.
pub fn fuse(data: &mut DeviceData, candidate: LocationCandidate, now: DateTime<Utc>) -> bool {
    // ---
    if !should_replace(
        data.location_accuracy,
        data.latest_location_update,
        candidate.accuracy,
        now,
    ) {
        return false;
    }

    data.latitude = candidate.latitude;
    data.longitude = candidate.longitude;
    data.location_accuracy = Some(candidate.accuracy);
    data.location_source = Some(candidate.source);
    data.latest_location_update = Some(now);
    true
}
