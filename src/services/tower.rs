//! Cell-tower location from the cellular provider's last session record.

use async_trait::async_trait;
use serde::Deserialize;

use super::{key, GeoFix, ProviderError, ProviderResult};

// ---

const HOLOGRAM_API: &str = "https://dashboard.hologram.io/api/1";

#[async_trait]
pub trait CellTowerLocator: Send + Sync {
    async fn locate(&self, modem_id: &str) -> ProviderResult<GeoFix>;
}

pub struct Hologram {
    http: reqwest::Client,
    api_key: Option<String>,
}

impl Hologram {
    pub fn new(http: reqwest::Client, api_key: Option<String>) -> Self {
        Self { http, api_key }
    }
}

#[derive(Deserialize)]
struct LastSession {
    latitude: f64,
    longitude: f64,
    /// Tower range in meters.
    range: f64,
}

#[derive(Deserialize)]
struct DeviceRecord {
    lastsession: Option<LastSession>,
}

#[derive(Deserialize)]
struct DeviceResponse {
    data: DeviceRecord,
}

#[async_trait]
impl CellTowerLocator for Hologram {
    async fn locate(&self, modem_id: &str) -> ProviderResult<GeoFix> {
        // ---
        let api_key = key(&self.api_key, "cell tower location", "HOLOGRAM_KEY")?;

        let response: DeviceResponse = self
            .http
            .get(format!("{HOLOGRAM_API}/devices/{modem_id}"))
            .basic_auth("apikey", Some(api_key))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let session = response
            .data
            .lastsession
            .ok_or_else(|| ProviderError::Unavailable(format!("location of modem '{modem_id}' is unknown")))?;

        Ok(GeoFix {
            latitude: session.latitude,
            longitude: session.longitude,
            accuracy: session.range,
        })
    }
}
