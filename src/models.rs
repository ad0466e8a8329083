//! Per-device data model: telemetry, settings and content entries.
//!
//! Data and Settings are singleton documents per device. Content entries
//! (messages, notes, captures) live in append-only, date-ordered stores and
//! are wrapped in [`Entry`] once the store has assigned an id and date.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---

/// Upper bound on stored WiFi credentials.
pub const MAX_WIFI_NETWORKS: usize = 10;

pub const DEFAULT_TEXT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_VISION_MODEL: &str = "gpt-4o";

pub const DEFAULT_ASSISTANT_PROMPT: &str = "UTC time: {utc_time}, local time: {local_time}, timezone: {timezone}.
Device battery charge: {battery}.

You are the user's assistant running from a wearable pin, and your name is Davis. Keep your responses concise and informal.
You are holding a conversation with the user, so your responses should be helpful but not wordy; they should be speakable in about 5-10 seconds.
Don't ask the user any follow-up questions. Respond with plain English text without special symbols beyond basic punctuation.

When asked to change the state of WiFi, call the corresponding function once, then say exactly \"WiFi turned [state]\".
When asked to play music, call the corresponding function, then say \"Playing [song name] by [artist]\".
When asked for directions, respond with the first couple of steps only.
If the user asks about the weather, UV, wind, temperature or sunrise/sunset, call the weather function; you do not need to look up the location first.

The user's notes, addressed by slug:
{notes}";

/// Where a stored location came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocationSource {
    Gnss,
    Wifi,
    Cell,
    Tower,
}

/// Mutable per-device telemetry.
///
/// Location fields are written only by [`crate::location::fuse`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceData {
    // ---
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_connected: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_accuracy: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_source: Option<LocationSource>,
    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub latest_location_update: Option<DateTime<Utc>>,
    pub battery: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_image: Option<String>,
    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub latest_image_captured: Option<DateTime<Utc>>,
}

impl Default for DeviceData {
    fn default() -> Self {
        // ---
        Self {
            last_connected: DateTime::<Utc>::UNIX_EPOCH,
            latitude: 0.0,
            longitude: 0.0,
            location_accuracy: None,
            location_source: None,
            latest_location_update: None,
            battery: 0.0,
            latest_image: None,
            latest_image_captured: None,
        }
    }
}

/// A boolean setting that is observed once and then cleared.
///
/// The only transition available inside the crate is armed → cleared, through
/// [`OneShot::consume`]. Arming happens outside the session pipeline (the
/// dashboard writes the stored document).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OneShot(bool);

impl OneShot {
    // ---
    pub const fn armed() -> Self {
        Self(true)
    }

    pub const fn is_armed(self) -> bool {
        self.0
    }

    /// Clear the flag, returning whether it was armed.
    pub(crate) fn consume(&mut self) -> bool {
        std::mem::replace(&mut self.0, false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WifiNetwork {
    pub ssid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// Mutable per-device configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSettings {
    // ---
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub device_disabled: bool,

    pub llm_name: String,
    pub vision_llm_name: String,
    pub llm_prompt: String,
    pub vision_llm_prompt: String,
    /// Number of past exchanges kept in the message store and sent as context.
    pub messages_to_keep: usize,
    pub voice_name: String,

    pub clear_messages: OneShot,
    pub capture_image: OneShot,
    pub do_firmware_update: OneShot,

    /// Index into [`crate::framing::UPDATE_FREQ_TIMES`].
    pub update_freq: usize,
    pub low_batt_update_freq: usize,
    pub speaker_vol: f64,
    pub light_level: f64,

    pub enable_wifi: bool,
    pub enable_bluetooth: bool,
    pub enable_gnss: bool,
    pub wifi_networks: Vec<WifiNetwork>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware_update_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hologram_id: Option<String>,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        // ---
        Self {
            display_name: None,
            device_disabled: false,
            llm_name: DEFAULT_TEXT_MODEL.to_string(),
            vision_llm_name: DEFAULT_VISION_MODEL.to_string(),
            llm_prompt: DEFAULT_ASSISTANT_PROMPT.to_string(),
            vision_llm_prompt: DEFAULT_ASSISTANT_PROMPT.to_string(),
            messages_to_keep: 20,
            voice_name: "davis".to_string(),
            clear_messages: OneShot::default(),
            capture_image: OneShot::default(),
            do_firmware_update: OneShot::default(),
            update_freq: 2,
            low_batt_update_freq: 3,
            speaker_vol: 0.8,
            light_level: 0.0,
            enable_wifi: false,
            enable_bluetooth: false,
            enable_gnss: true,
            wifi_networks: Vec::new(),
            firmware_update_file: None,
            hologram_id: None,
        }
    }
}

// ---

/// The three per-device content collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Messages,
    Notes,
    Captures,
}

impl ContentKind {
    // ---
    pub fn as_str(self) -> &'static str {
        match self {
            ContentKind::Messages => "messages",
            ContentKind::Notes => "notes",
            ContentKind::Captures => "captures",
        }
    }
}

impl std::str::FromStr for ContentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // ---
        match s {
            "messages" => Ok(ContentKind::Messages),
            "notes" => Ok(ContentKind::Notes),
            "captures" => Ok(ContentKind::Captures),
            other => Err(format!("unknown content kind '{other}'")),
        }
    }
}

/// Body types that can live in a content store.
pub trait ContentBody: Serialize + serde::de::DeserializeOwned + Send + Sync + 'static {
    const KIND: ContentKind;
}

/// One assistant exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceMessage {
    pub user_msg: String,
    pub assistant_msg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_img_id: Option<String>,
}

impl ContentBody for DeviceMessage {
    const KIND: ContentKind = ContentKind::Messages;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceNote {
    pub title: String,
    pub content: String,
}

impl ContentBody for DeviceNote {
    const KIND: ContentKind = ContentKind::Notes;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceCapture {
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
}

impl ContentBody for DeviceCapture {
    const KIND: ContentKind = ContentKind::Captures;
}

/// A stored content entry: server-assigned id and creation date plus body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry<T> {
    pub id: String,
    pub date: DateTime<Utc>,
    #[serde(flatten)]
    pub body: T,
}

/// Page request for a content store; entries come back newest first.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    pub start_after: Option<DateTime<Utc>>,
    #[serde(default = "default_page_limit")]
    pub limit: usize,
}

fn default_page_limit() -> usize {
    10
}

impl Default for Page {
    fn default() -> Self {
        Self {
            start_after: None,
            limit: default_page_limit(),
        }
    }
}

impl Page {
    pub fn first(limit: usize) -> Self {
        Self {
            start_after: None,
            limit,
        }
    }
}

/// One page of a content store.
///
/// `next_start_after` is `None` once the store is exhausted.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Paginated<T> {
    pub entries: Vec<Entry<T>>,
    pub next_start_after: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use serde_json::json;

    #[test]
    fn one_shot_only_clears() {
        // ---
        let mut flag = OneShot::armed();
        assert!(flag.consume());
        assert!(!flag.is_armed());

        // A second observation is a no-op
        assert!(!flag.consume());
        assert!(!flag.is_armed());
    }

    #[test]
    fn one_shot_serializes_as_plain_bool() {
        // ---
        let settings = DeviceSettings {
            capture_image: OneShot::armed(),
            ..DeviceSettings::default()
        };
        let value = serde_json::to_value(&settings).unwrap();
        assert_eq!(value["captureImage"], json!(true));
        assert_eq!(value["clearMessages"], json!(false));
    }

    #[test]
    fn device_data_uses_millisecond_timestamps() {
        // ---
        let data: DeviceData = serde_json::from_value(json!({
            "lastConnected": 1_700_000_000_000i64,
            "latitude": 1.5,
            "longitude": -2.5,
            "battery": 0.5,
            "locationSource": "tower",
        }))
        .unwrap();

        assert_eq!(data.last_connected.timestamp(), 1_700_000_000);
        assert_eq!(data.location_source, Some(LocationSource::Tower));
        assert_eq!(data.location_accuracy, None);
    }

    #[test]
    fn entry_flattens_body() {
        // ---
        let entry = Entry {
            id: "abc".to_string(),
            date: DateTime::<Utc>::UNIX_EPOCH,
            body: DeviceNote {
                title: "Groceries".to_string(),
                content: "milk".to_string(),
            },
        };
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["title"], json!("Groceries"));
        assert_eq!(value["id"], json!("abc"));
    }

    #[test]
    fn content_kind_parses_route_segments() {
        // ---
        assert_eq!("notes".parse::<ContentKind>(), Ok(ContentKind::Notes));
        assert!("photos".parse::<ContentKind>().is_err());
    }
}
