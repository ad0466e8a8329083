//! Binary request/response framing for device sessions.
//!
//! Request body layout:
//! - `[0, 512)`: NUL-terminated JSON metadata
//! - `[512, 512 + imageSize)`: optional image bytes
//! - `[512 + imageSize, 512 + imageSize + audioSize)`: audio bytes
//!
//! Response body layout: exactly 512 bytes of NUL-terminated, zero-padded
//! JSON control metadata followed by the audio payload.

use axum::body::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---

/// Fixed size of the metadata region in both directions.
pub const METADATA_SIZE: usize = 512;

pub const DEFAULT_AUDIO_FORMAT: &str = "gsm";
pub const DEFAULT_AUDIO_BITRATE: &str = "16k";

/// Poll intervals in milliseconds, indexed by the `updateFreq` settings.
pub const UPDATE_FREQ_TIMES: [u64; 7] = [
    10 * 1000,           // 10s
    30 * 1000,           // 30s
    60 * 1000,           // 1m
    5 * 60 * 1000,       // 5m
    10 * 60 * 1000,      // 10m
    60 * 60 * 1000,      // 1h
    u32::MAX as u64,     // never
];

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("request body is {0} bytes, smaller than the {METADATA_SIZE} byte metadata region")]
    Undersized(usize),

    #[error("metadata is not valid UTF-8")]
    Encoding,

    #[error("metadata failed validation: {0}")]
    Schema(#[from] serde_json::Error),

    #[error("metadata field '{field}' is invalid: {reason}")]
    Field { field: &'static str, reason: String },

    #[error("declared payload of {declared} bytes exceeds the {available} bytes received")]
    Truncated { declared: usize, available: usize },

    #[error("control frame of {0} bytes does not fit the {METADATA_SIZE} byte metadata region")]
    Oversized(usize),
}

/// A visible WiFi access point, as reported by the device for geolocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WifiScanEntry {
    pub bssid: String,
    pub rssi: i32,
    pub channel: u32,
}

/// Device-supplied metadata at the head of every request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestMetadata {
    // ---
    pub device_id: String,
    pub audio_size: usize,
    pub image_size: usize,
    #[serde(default = "default_audio_format")]
    pub audio_format: String,
    #[serde(default = "default_audio_bitrate")]
    pub audio_bitrate: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    /// Reported GNSS accuracy in meters, when the fix carries one.
    pub accuracy: Option<f64>,
    /// Charge fraction; absent when the device did not report it.
    pub battery: Option<f64>,
    #[serde(default)]
    pub did_wifi_disconnect: bool,
    #[serde(default)]
    pub wifi_scan: Vec<WifiScanEntry>,
}

fn default_audio_format() -> String {
    DEFAULT_AUDIO_FORMAT.to_string()
}

fn default_audio_bitrate() -> String {
    DEFAULT_AUDIO_BITRATE.to_string()
}

impl RequestMetadata {
    /// Field checks that serde's type mapping does not cover.
    fn validate(&self) -> Result<(), FrameError> {
        // ---
        if self.device_id.is_empty() {
            return Err(FrameError::Field {
                field: "deviceId",
                reason: "must not be empty".to_string(),
            });
        }
        if let Some(battery) = self.battery {
            if !(0.0..=1.0).contains(&battery) {
                return Err(FrameError::Field {
                    field: "battery",
                    reason: format!("{battery} is outside [0, 1]"),
                });
            }
        }
        if !is_bitrate(&self.audio_bitrate) {
            return Err(FrameError::Field {
                field: "audioBitrate",
                reason: format!("'{}' does not look like '16k'", self.audio_bitrate),
            });
        }
        if self.audio_format.is_empty() || !self.audio_format.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(FrameError::Field {
                field: "audioFormat",
                reason: format!("'{}' is not a format name", self.audio_format),
            });
        }
        Ok(())
    }
}

fn is_bitrate(s: &str) -> bool {
    // ---
    match s.strip_suffix('k') {
        Some(digits) => !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()),
        None => false,
    }
}

/// A request split into its three regions.
#[derive(Debug, Clone)]
pub struct DecodedRequest {
    pub metadata: RequestMetadata,
    pub image: Option<Bytes>,
    pub audio: Bytes,
}

/// Split a raw request body per the fixed-offset layout.
///
/// Nothing is mutated on failure; callers reject the request with a client
/// error.
pub fn decode_request(body: Bytes) -> Result<DecodedRequest, FrameError> {
    // ---
    if body.len() < METADATA_SIZE {
        return Err(FrameError::Undersized(body.len()));
    }

    let region = &body[..METADATA_SIZE];
    let json_end = region.iter().position(|b| *b == 0).unwrap_or(METADATA_SIZE);
    let json = std::str::from_utf8(&region[..json_end]).map_err(|_| FrameError::Encoding)?;

    let metadata: RequestMetadata = serde_json::from_str(json)?;
    metadata.validate()?;

    let image_end = METADATA_SIZE.checked_add(metadata.image_size);
    let audio_end = image_end.and_then(|end| end.checked_add(metadata.audio_size));

    let (image_end, audio_end) = match (image_end, audio_end) {
        (Some(image_end), Some(audio_end)) if audio_end <= body.len() => (image_end, audio_end),
        _ => {
            return Err(FrameError::Truncated {
                declared: metadata.image_size.saturating_add(metadata.audio_size),
                available: body.len() - METADATA_SIZE,
            })
        }
    };

    let image = (metadata.image_size > 0).then(|| body.slice(METADATA_SIZE..image_end));
    let audio = body.slice(image_end..audio_end);

    Ok(DecodedRequest {
        metadata,
        image,
        audio,
    })
}

// ---

/// Control metadata sent back to the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlFrame {
    pub next_update: u32,
    pub disabled: bool,
    pub do_update: bool,
    pub take_pic: bool,
    pub wifi: bool,
    pub bt: bool,
    pub gnss: bool,
    pub spk_vol: f64,
    #[serde(rename = "lLevel")]
    pub l_level: f64,
}

/// Choose the next poll interval from [`UPDATE_FREQ_TIMES`].
///
/// Below the low-battery threshold the `low_batt_idx` entry is used instead
/// of `idx`. Out-of-range indexes mean "never".
pub fn next_poll_interval(idx: usize, low_batt_idx: usize, battery: f64, low_battery: f64) -> u32 {
    // ---
    let idx = if battery < low_battery { low_batt_idx } else { idx };
    let millis = UPDATE_FREQ_TIMES.get(idx).copied().unwrap_or(u32::MAX as u64);
    millis.min(u32::MAX as u64) as u32
}

/// Serialize the control frame into exactly [`METADATA_SIZE`] bytes.
///
/// The JSON must leave room for at least one NUL terminator.
pub fn encode_control_frame(frame: &ControlFrame) -> Result<[u8; METADATA_SIZE], FrameError> {
    // ---
    let json = serde_json::to_vec(frame)?;
    if json.len() >= METADATA_SIZE {
        return Err(FrameError::Oversized(json.len() + 1));
    }

    let mut out = [0u8; METADATA_SIZE];
    out[..json.len()].copy_from_slice(&json);
    Ok(out)
}

/// Frame followed by the audio payload.
pub fn encode_response(frame: &ControlFrame, audio: &[u8]) -> Result<Vec<u8>, FrameError> {
    // ---
    let mut body = Vec::with_capacity(METADATA_SIZE + audio.len());
    body.extend_from_slice(&encode_control_frame(frame)?);
    body.extend_from_slice(audio);
    Ok(body)
}

#[cfg(test)]
pub(crate) fn build_request(metadata: &serde_json::Value, image: &[u8], audio: &[u8]) -> Bytes {
    // ---
    let json = serde_json::to_vec(metadata).unwrap();
    let mut body = vec![0u8; METADATA_SIZE];
    body[..json.len()].copy_from_slice(&json);
    body.extend_from_slice(image);
    body.extend_from_slice(audio);
    Bytes::from(body)
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use serde_json::json;

    fn sample_frame() -> ControlFrame {
        ControlFrame {
            next_update: 60_000,
            disabled: false,
            do_update: true,
            take_pic: false,
            wifi: true,
            bt: false,
            gnss: true,
            spk_vol: 0.8,
            l_level: 0.5,
        }
    }

    #[test]
    fn decodes_declared_regions_exactly() {
        // ---
        let image = vec![7u8; 33];
        let audio = vec![9u8; 100];
        let body = build_request(
            &json!({"deviceId": "d1", "imageSize": 33, "audioSize": 100}),
            &image,
            &audio,
        );

        let decoded = decode_request(body).unwrap();
        assert_eq!(decoded.image.as_deref(), Some(&image[..]));
        assert_eq!(decoded.audio.len(), 100);
        assert_eq!(&decoded.audio[..], &audio[..]);
        assert_eq!(decoded.metadata.audio_format, "gsm");
        assert_eq!(decoded.metadata.audio_bitrate, "16k");
        assert_eq!(decoded.metadata.battery, None);
    }

    #[test]
    fn trailing_bytes_beyond_declared_audio_are_ignored() {
        // ---
        let body = build_request(
            &json!({"deviceId": "d1", "imageSize": 0, "audioSize": 4}),
            &[],
            &[1, 2, 3, 4, 5, 6],
        );
        let decoded = decode_request(body).unwrap();
        assert!(decoded.image.is_none());
        assert_eq!(&decoded.audio[..], &[1, 2, 3, 4]);
    }

    #[test]
    fn rejects_sizes_larger_than_body() {
        // ---
        let body = build_request(
            &json!({"deviceId": "d1", "imageSize": 10, "audioSize": 10}),
            &[0; 10],
            &[0; 5],
        );
        assert!(matches!(
            decode_request(body),
            Err(FrameError::Truncated { declared: 20, available: 15 })
        ));
    }

    #[test]
    fn rejects_schema_violations() {
        // ---
        let missing_id = build_request(&json!({"imageSize": 0, "audioSize": 0}), &[], &[]);
        assert!(matches!(decode_request(missing_id), Err(FrameError::Schema(_))));

        let negative = build_request(
            &json!({"deviceId": "d1", "imageSize": -1, "audioSize": 0}),
            &[],
            &[],
        );
        assert!(matches!(decode_request(negative), Err(FrameError::Schema(_))));

        let battery = build_request(
            &json!({"deviceId": "d1", "imageSize": 0, "audioSize": 0, "battery": 1.5}),
            &[],
            &[],
        );
        assert!(matches!(
            decode_request(battery),
            Err(FrameError::Field { field: "battery", .. })
        ));

        let bitrate = build_request(
            &json!({"deviceId": "d1", "imageSize": 0, "audioSize": 0, "audioBitrate": "fast"}),
            &[],
            &[],
        );
        assert!(matches!(
            decode_request(bitrate),
            Err(FrameError::Field { field: "audioBitrate", .. })
        ));
    }

    #[test]
    fn rejects_undersized_body() {
        // ---
        let body = Bytes::from_static(b"{\"deviceId\":\"d1\"}\0");
        assert!(matches!(decode_request(body), Err(FrameError::Undersized(18))));
    }

    #[test]
    fn control_frame_is_fixed_size_and_parseable() {
        // ---
        let frame = sample_frame();
        let body = encode_response(&frame, b"AUDIO").unwrap();

        assert_eq!(body.len(), METADATA_SIZE + 5);
        assert_eq!(&body[METADATA_SIZE..], b"AUDIO");

        let nul = body.iter().position(|b| *b == 0).unwrap();
        assert!(nul < METADATA_SIZE);
        let parsed: ControlFrame = serde_json::from_slice(&body[..nul]).unwrap();
        assert_eq!(parsed, frame);
        assert!(body[nul..METADATA_SIZE].iter().all(|b| *b == 0));

        let raw: serde_json::Value = serde_json::from_slice(&body[..nul]).unwrap();
        assert!(raw.get("lLevel").is_some());
        assert!(raw.get("spkVol").is_some());
        assert!(raw.get("takePic").is_some());
    }

    #[test]
    fn poll_interval_switches_table_entry_on_low_battery() {
        // ---
        assert_eq!(next_poll_interval(2, 4, 0.9, 0.2), 60_000);
        assert_eq!(next_poll_interval(2, 4, 0.1, 0.2), 600_000);
        // Exactly at the threshold is not low
        assert_eq!(next_poll_interval(2, 4, 0.2, 0.2), 60_000);
        assert_eq!(next_poll_interval(6, 4, 0.9, 0.2), u32::MAX);
        assert_eq!(next_poll_interval(99, 4, 0.9, 0.2), u32::MAX);
    }
}
