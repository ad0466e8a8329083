//! Google Maps Platform: timezone, geocoding, places, directions and WiFi
//! geolocation.

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{key, GeoFix, ProviderError, ProviderResult};
use crate::framing::WifiScanEntry;

// ---

const MAPS_API: &str = "https://maps.googleapis.com/maps/api";
const GEOLOCATE_API: &str = "https://www.googleapis.com/geolocation/v1/geolocate";

/// Wall-clock time at the device.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalTime {
    pub utc: DateTime<Utc>,
    pub local: DateTime<FixedOffset>,
    pub timezone_name: String,
}

impl LocalTime {
    /// Zero-offset time used when the timezone lookup fails.
    pub fn utc_fallback(now: DateTime<Utc>) -> Self {
        Self {
            utc: now,
            local: now.fixed_offset(),
            timezone_name: "UTC".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Place {
    pub address: String,
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NearbyPlace {
    pub name: String,
    pub address: Option<String>,
    pub open_now: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Waypoint {
    Address(String),
    Coordinates { latitude: f64, longitude: f64 },
}

impl Waypoint {
    fn as_param(&self) -> String {
        match self {
            Waypoint::Address(address) => address.clone(),
            Waypoint::Coordinates {
                latitude,
                longitude,
            } => format!("{latitude},{longitude}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectionStep {
    pub maneuver: String,
    pub distance: String,
    pub duration: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Directions {
    pub travel_time: String,
    pub distance: String,
    pub instructions: Vec<DirectionStep>,
}

#[async_trait]
pub trait Maps: Send + Sync {
    async fn local_time(&self, latitude: f64, longitude: f64, now: DateTime<Utc>) -> ProviderResult<LocalTime>;

    async fn geocode(&self, address: &str) -> ProviderResult<Place>;

    async fn reverse_geocode(&self, latitude: f64, longitude: f64) -> ProviderResult<Place>;

    async fn nearby_places(
        &self,
        query: &str,
        latitude: f64,
        longitude: f64,
        radius_m: u32,
    ) -> ProviderResult<Vec<NearbyPlace>>;

    /// Walking directions.
    async fn directions(&self, origin: Waypoint, destination: &str) -> ProviderResult<Directions>;

    async fn geolocate_wifi(&self, access_points: &[WifiScanEntry]) -> ProviderResult<GeoFix>;
}

// ---

pub struct GoogleMaps {
    http: reqwest::Client,
    api_key: Option<String>,
}

impl GoogleMaps {
    // ---
    pub fn new(http: reqwest::Client, api_key: Option<String>) -> Self {
        Self { http, api_key }
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> ProviderResult<T> {
        // ---
        let api_key = key(&self.api_key, "maps", "GOOGLE_KEY")?;
        let response = self
            .http
            .get(format!("{MAPS_API}/{path}/json"))
            .query(params)
            .query(&[("key", api_key)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response)
    }
}

fn check_status(service: &str, status: &str) -> ProviderResult<()> {
    match status {
        "OK" => Ok(()),
        other => Err(ProviderError::Unavailable(format!("{service} lookup returned {other}"))),
    }
}

// --- Wire types

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TimezoneResponse {
    status: String,
    #[serde(default)]
    dst_offset: i32,
    #[serde(default)]
    raw_offset: i32,
    #[serde(default)]
    time_zone_name: String,
}

#[derive(Deserialize)]
struct LatLng {
    lat: f64,
    lng: f64,
}

#[derive(Deserialize)]
struct Geometry {
    location: LatLng,
}

#[derive(Deserialize)]
struct GeocodeResult {
    formatted_address: String,
    geometry: Geometry,
}

#[derive(Deserialize)]
struct GeocodeResponse {
    status: String,
    #[serde(default)]
    results: Vec<GeocodeResult>,
}

#[derive(Deserialize)]
struct OpeningHours {
    open_now: Option<bool>,
}

#[derive(Deserialize)]
struct PlaceResult {
    name: String,
    formatted_address: Option<String>,
    opening_hours: Option<OpeningHours>,
}

#[derive(Deserialize)]
struct PlacesResponse {
    status: String,
    #[serde(default)]
    results: Vec<PlaceResult>,
}

#[derive(Deserialize)]
struct TextValue {
    text: String,
}

#[derive(Deserialize)]
struct Step {
    html_instructions: String,
    distance: TextValue,
    duration: TextValue,
}

#[derive(Deserialize)]
struct Leg {
    distance: TextValue,
    duration: TextValue,
    steps: Vec<Step>,
}

#[derive(Deserialize)]
struct Route {
    legs: Vec<Leg>,
}

#[derive(Deserialize)]
struct DirectionsResponse {
    status: String,
    #[serde(default)]
    routes: Vec<Route>,
}

#[derive(Deserialize)]
struct GeolocateResponse {
    location: LatLng,
    accuracy: f64,
}

fn first_place(response: GeocodeResponse) -> ProviderResult<Place> {
    // ---
    check_status("geocoding", &response.status)?;
    let top = response
        .results
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::Unavailable("no geocoding results".to_string()))?;

    Ok(Place {
        address: top.formatted_address,
        latitude: top.geometry.location.lat,
        longitude: top.geometry.location.lng,
    })
}

/// Drop the markup Google embeds in step instructions.
fn strip_html(html: &str) -> String {
    // ---
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => {
                in_tag = true;
                out.push(' ');
            }
            '>' => in_tag = false,
            c if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[async_trait]
impl Maps for GoogleMaps {
    async fn local_time(&self, latitude: f64, longitude: f64, now: DateTime<Utc>) -> ProviderResult<LocalTime> {
        // ---
        let response: TimezoneResponse = self
            .get(
                "timezone",
                &[
                    ("location", format!("{latitude},{longitude}")),
                    ("timestamp", now.timestamp().to_string()),
                ],
            )
            .await?;
        check_status("timezone", &response.status)?;

        let offset = FixedOffset::east_opt(response.dst_offset + response.raw_offset)
            .ok_or_else(|| ProviderError::Unavailable("timezone offset out of range".to_string()))?;

        Ok(LocalTime {
            utc: now,
            local: now.with_timezone(&offset),
            timezone_name: response.time_zone_name,
        })
    }

    async fn geocode(&self, address: &str) -> ProviderResult<Place> {
        let response = self.get("geocode", &[("address", address.to_string())]).await?;
        first_place(response)
    }

    async fn reverse_geocode(&self, latitude: f64, longitude: f64) -> ProviderResult<Place> {
        let response = self
            .get("geocode", &[("latlng", format!("{latitude},{longitude}"))])
            .await?;
        first_place(response)
    }

    async fn nearby_places(
        &self,
        query: &str,
        latitude: f64,
        longitude: f64,
        radius_m: u32,
    ) -> ProviderResult<Vec<NearbyPlace>> {
        // ---
        let response: PlacesResponse = self
            .get(
                "place/textsearch",
                &[
                    ("query", query.to_string()),
                    ("location", format!("{latitude},{longitude}")),
                    ("radius", radius_m.to_string()),
                ],
            )
            .await?;

        if response.status == "ZERO_RESULTS" {
            return Ok(Vec::new());
        }
        check_status("places", &response.status)?;

        Ok(response
            .results
            .into_iter()
            .map(|p| NearbyPlace {
                name: p.name,
                address: p.formatted_address,
                open_now: p.opening_hours.and_then(|h| h.open_now),
            })
            .collect())
    }

    async fn directions(&self, origin: Waypoint, destination: &str) -> ProviderResult<Directions> {
        // ---
        let response: DirectionsResponse = self
            .get(
                "directions",
                &[
                    ("origin", origin.as_param()),
                    ("destination", destination.to_string()),
                    ("mode", "walking".to_string()),
                    ("units", "imperial".to_string()),
                ],
            )
            .await?;
        check_status("directions", &response.status)?;

        let leg = response
            .routes
            .into_iter()
            .next()
            .and_then(|r| r.legs.into_iter().next())
            .ok_or_else(|| ProviderError::Unavailable("no route from origin to destination".to_string()))?;

        Ok(Directions {
            travel_time: leg.duration.text,
            distance: leg.distance.text,
            instructions: leg
                .steps
                .into_iter()
                .map(|s| DirectionStep {
                    maneuver: strip_html(&s.html_instructions),
                    distance: s.distance.text,
                    duration: s.duration.text,
                })
                .collect(),
        })
    }

    async fn geolocate_wifi(&self, access_points: &[WifiScanEntry]) -> ProviderResult<GeoFix> {
        // ---
        let api_key = key(&self.api_key, "maps", "GOOGLE_KEY")?;
        let access_points: Vec<_> = access_points
            .iter()
            .map(|ap| {
                json!({
                    "macAddress": ap.bssid,
                    "signalStrength": ap.rssi,
                    "channel": ap.channel,
                })
            })
            .collect();

        let response: GeolocateResponse = self
            .http
            .post(GEOLOCATE_API)
            .query(&[("key", api_key)])
            .json(&json!({"considerIp": false, "wifiAccessPoints": access_points}))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(GeoFix {
            latitude: response.location.lat,
            longitude: response.location.lng,
            accuracy: response.accuracy,
        })
    }
}
