//! Device context manager: loads, reconciles and persists per-device state
//! for one session.
//!
//! State is read once when a session starts and written back once when it
//! ends. There is no per-device lock; concurrent sessions for the same device
//! race and the last writer wins.

use std::sync::Arc;

use axum::body::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};

use crate::error::AppError;
use crate::framing::{next_poll_interval, ControlFrame, RequestMetadata};
use crate::location::{fuse, LocationCandidate, DEFAULT_GNSS_ACCURACY_M};
use crate::media::{gen_file_name, MediaStore};
use crate::models::{
    DeviceCapture, DeviceData, DeviceSettings, LocationSource, MAX_WIFI_NETWORKS,
};
use crate::repository::{DocumentKind, RepoError, RepoResult, Repositories};
use crate::services::{GeoFix, Services};
use crate::sync::{SyncEvent, SyncPublisher};

// ---

/// Device state for the duration of one session.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceContext {
    pub device_id: String,
    pub data: DeviceData,
    pub settings: DeviceSettings,
}

#[derive(Clone)]
pub struct ContextManager {
    repos: Repositories,
    media: Arc<dyn MediaStore>,
    services: Services,
    sync: Arc<dyn SyncPublisher>,
    low_battery_threshold: f64,
}

impl ContextManager {
    // ---
    pub fn new(
        repos: Repositories,
        media: Arc<dyn MediaStore>,
        services: Services,
        sync: Arc<dyn SyncPublisher>,
        low_battery_threshold: f64,
    ) -> Self {
        Self {
            repos,
            media,
            services,
            sync,
            low_battery_threshold,
        }
    }

    pub fn repos(&self) -> &Repositories {
        &self.repos
    }

    pub fn media(&self) -> &Arc<dyn MediaStore> {
        &self.media
    }

    pub fn sync(&self) -> &dyn SyncPublisher {
        self.sync.as_ref()
    }

    /// Stored Data and Settings merged over defaults.
    pub async fn load(&self, device_id: &str) -> Result<DeviceContext, AppError> {
        // ---
        if !self.repos.documents.device_exists(device_id).await? {
            return Err(AppError::NotFound(format!("device '{device_id}' not found")));
        }

        let data: DeviceData = self.load_document(device_id, DocumentKind::Data).await?;
        let mut settings: DeviceSettings = self.load_document(device_id, DocumentKind::Settings).await?;

        if settings.wifi_networks.len() > MAX_WIFI_NETWORKS {
            tracing::warn!(
                "Device {} has {} stored WiFi networks, keeping the first {}",
                device_id,
                settings.wifi_networks.len(),
                MAX_WIFI_NETWORKS
            );
            settings.wifi_networks.truncate(MAX_WIFI_NETWORKS);
        }

        Ok(DeviceContext {
            device_id: device_id.to_string(),
            data,
            settings,
        })
    }

    async fn load_document<T>(&self, device_id: &str, kind: DocumentKind) -> RepoResult<T>
    where
        T: Serialize + DeserializeOwned + Default,
    {
        // ---
        let mut merged = serde_json::to_value(T::default())?;
        if let Some(stored) = self.repos.documents.get(device_id, kind).await? {
            merge_over_defaults(&mut merged, stored);
        }
        serde_json::from_value(merged).map_err(RepoError::from)
    }

    /// Fold the request metadata and optional image into the context.
    pub async fn reconcile(
        &self,
        ctx: &mut DeviceContext,
        metadata: &RequestMetadata,
        image: Option<Bytes>,
        now: DateTime<Utc>,
    ) {
        // ---
        ctx.data.last_connected = now;

        if let Some(image) = image {
            self.store_image(ctx, image, now).await;
        }

        if let Some(battery) = metadata.battery {
            ctx.data.battery = battery.clamp(0.0, 1.0);
        }

        if let Some(candidate) = self.locate(ctx, metadata).await {
            if fuse(&mut ctx.data, candidate, now) {
                tracing::debug!(
                    "Device {} location updated from {:?} (±{} m)",
                    ctx.device_id,
                    candidate.source,
                    candidate.accuracy
                );
            }
        }

        if metadata.did_wifi_disconnect && ctx.settings.enable_wifi {
            ctx.settings.enable_wifi = false;
            self.publish_settings(&ctx.device_id, json!({"enableWifi": false}));
        }

        if ctx.settings.clear_messages.is_armed() {
            match self.repos.messages().clear(&ctx.device_id).await {
                Ok(()) => {
                    ctx.settings.clear_messages.consume();
                    self.publish_settings(&ctx.device_id, json!({"clearMessages": false}));
                    self.sync.publish(SyncEvent::ContentUpdate {
                        device_id: ctx.device_id.clone(),
                        kind: crate::models::ContentKind::Messages,
                        entries: Vec::new(),
                        next_start_after: None,
                    });
                }
                // Flag stays armed so the next session retries
                Err(e) => tracing::error!("Failed to clear messages for {}: {}", ctx.device_id, e),
            }
        }
    }

    async fn store_image(&self, ctx: &mut DeviceContext, image: Bytes, now: DateTime<Utc>) {
        // ---
        let name = gen_file_name(&ctx.device_id, "jpeg");
        let stored = match self.media.save(&name, image).await {
            Ok(stored) => stored,
            Err(e) => {
                tracing::warn!("Failed to store image from {}: {}", ctx.device_id, e);
                return;
            }
        };

        ctx.data.latest_image = Some(stored.clone());
        ctx.data.latest_image_captured = Some(now);

        let capture = DeviceCapture {
            image: stored,
            caption: None,
        };
        match self.repos.captures().add(&ctx.device_id, &capture, None).await {
            Ok(entry) => self.sync.publish(SyncEvent::content(
                &ctx.device_id,
                crate::models::ContentKind::Captures,
                &[entry],
            )),
            Err(e) => tracing::warn!("Failed to record capture for {}: {}", ctx.device_id, e),
        }
    }

    /// First location candidate obtainable, in order GNSS, WiFi, cell tower.
    async fn locate(&self, ctx: &DeviceContext, metadata: &RequestMetadata) -> Option<LocationCandidate> {
        // ---
        if let (Some(latitude), Some(longitude)) = (metadata.latitude, metadata.longitude) {
            return Some(LocationCandidate {
                latitude,
                longitude,
                accuracy: metadata.accuracy.unwrap_or(DEFAULT_GNSS_ACCURACY_M),
                source: LocationSource::Gnss,
            });
        }

        if !metadata.wifi_scan.is_empty() {
            match self.services.maps.geolocate_wifi(&metadata.wifi_scan).await {
                Ok(fix) => return Some(candidate(fix, LocationSource::Wifi)),
                Err(e) => tracing::warn!("WiFi geolocation failed for {}: {}", ctx.device_id, e),
            }
        }

        if let Some(modem_id) = &ctx.settings.hologram_id {
            match self.services.towers.locate(modem_id).await {
                Ok(fix) => return Some(candidate(fix, LocationSource::Tower)),
                Err(e) => tracing::debug!("No tower location for {}: {}", ctx.device_id, e),
            }
        }

        None
    }

    /// Control metadata for the reply. Observing `captureImage` consumes it.
    pub fn control_frame(&self, ctx: &mut DeviceContext) -> ControlFrame {
        // ---
        let settings = &ctx.settings;
        let frame = ControlFrame {
            next_update: next_poll_interval(
                settings.update_freq,
                settings.low_batt_update_freq,
                ctx.data.battery,
                self.low_battery_threshold,
            ),
            disabled: settings.device_disabled,
            do_update: settings.do_firmware_update.is_armed(),
            take_pic: settings.capture_image.is_armed(),
            wifi: settings.enable_wifi,
            bt: settings.enable_bluetooth,
            gnss: settings.enable_gnss,
            spk_vol: settings.speaker_vol,
            l_level: settings.light_level,
        };

        if ctx.settings.capture_image.consume() {
            self.publish_settings(&ctx.device_id, json!({"captureImage": false}));
        }
        frame
    }

    /// Write Data and Settings back.
    pub async fn persist(&self, ctx: &DeviceContext) -> RepoResult<()> {
        // ---
        let data = serde_json::to_value(&ctx.data)?;
        let settings = serde_json::to_value(&ctx.settings)?;

        self.repos
            .documents
            .update(&ctx.device_id, DocumentKind::Data, data.clone())
            .await?;
        self.repos
            .documents
            .update(&ctx.device_id, DocumentKind::Settings, settings)
            .await?;

        self.sync.publish(SyncEvent::DataUpdate {
            device_id: ctx.device_id.clone(),
            data,
        });
        Ok(())
    }

    /// Persist after the response has gone out; failures are logged.
    pub fn persist_in_background(&self, ctx: DeviceContext) {
        // ---
        let manager = self.clone();
        tokio::spawn(async move {
            match manager.persist(&ctx).await {
                Ok(()) => tracing::debug!("Persisted state for device {}", ctx.device_id),
                Err(e) => tracing::error!("Failed to persist state for device {}: {}", ctx.device_id, e),
            }
        });
    }

    /// Clear the firmware queue once the device has the whole image.
    pub async fn consume_firmware_update(&self, device_id: &str) -> Result<(), AppError> {
        // ---
        let mut ctx = self.load(device_id).await?;
        let was_armed = ctx.settings.do_firmware_update.consume();
        if !was_armed && ctx.settings.firmware_update_file.is_none() {
            return Ok(());
        }

        let patch = json!({"doFirmwareUpdate": false, "firmwareUpdateFile": null});
        self.repos
            .documents
            .update(device_id, DocumentKind::Settings, patch.clone())
            .await?;
        self.publish_settings(device_id, patch);
        tracing::info!("Firmware update delivered to device {}", device_id);
        Ok(())
    }

    /// Offer an out-of-band location fix; returns whether it was taken.
    pub async fn offer_location(
        &self,
        device_id: &str,
        fix: GeoFix,
        source: LocationSource,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        // ---
        let mut ctx = self.load(device_id).await?;
        if !fuse(&mut ctx.data, candidate(fix, source), now) {
            return Ok(false);
        }

        let data = serde_json::to_value(&ctx.data).map_err(RepoError::from)?;
        self.repos
            .documents
            .update(device_id, DocumentKind::Data, data.clone())
            .await?;
        self.sync.publish(SyncEvent::DataUpdate {
            device_id: device_id.to_string(),
            data,
        });
        Ok(true)
    }

    fn publish_settings(&self, device_id: &str, settings: Value) {
        self.sync.publish(SyncEvent::SettingsUpdate {
            device_id: device_id.to_string(),
            settings,
        });
    }
}

fn candidate(fix: GeoFix, source: LocationSource) -> LocationCandidate {
    LocationCandidate {
        latitude: fix.latitude,
        longitude: fix.longitude,
        accuracy: fix.accuracy,
        source,
    }
}

/// Deep-merge `stored` over `defaults`; stored values win, nulls are ignored.
fn merge_over_defaults(defaults: &mut Value, stored: Value) {
    // ---
    match (defaults, stored) {
        (Value::Object(defaults), Value::Object(stored)) => {
            for (key, value) in stored {
                if value.is_null() {
                    continue;
                }
                match defaults.get_mut(&key) {
                    Some(slot) => merge_over_defaults(slot, value),
                    None => {
                        defaults.insert(key, value);
                    }
                }
            }
        }
        (_, Value::Null) => {}
        (slot, value) => *slot = value,
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::framing::decode_request;
    use crate::media::FsMediaStore;
    use crate::models::{DeviceMessage, OneShot, Page};
    use crate::sync::BroadcastSync;
    use crate::testing::{offline_services, FixedTower};
    use chrono::Duration;

    struct Harness {
        manager: ContextManager,
        sync: BroadcastSync,
        _media: tempfile::TempDir,
    }

    async fn harness(services: Services) -> Harness {
        // ---
        let repos = Repositories::in_memory();
        repos.documents.register_device("d1").await.unwrap();
        let media = tempfile::tempdir().unwrap();
        let sync = BroadcastSync::new(64);
        let manager = ContextManager::new(
            repos,
            Arc::new(FsMediaStore::new(media.path())),
            services,
            Arc::new(sync.clone()),
            0.2,
        );
        Harness {
            manager,
            sync,
            _media: media,
        }
    }

    fn metadata(value: Value) -> RequestMetadata {
        decode_request(crate::framing::build_request(&value, &[], &[]))
            .unwrap()
            .metadata
    }

    #[tokio::test]
    async fn unknown_device_is_not_found() {
        // ---
        let h = harness(offline_services()).await;
        assert!(matches!(h.manager.load("ghost").await, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn load_merges_stored_fields_over_defaults() {
        // ---
        let h = harness(offline_services()).await;
        h.manager
            .repos()
            .documents
            .update(
                "d1",
                DocumentKind::Settings,
                json!({"updateFreq": 5, "displayName": null, "voiceName": "jenny"}),
            )
            .await
            .unwrap();

        let ctx = h.manager.load("d1").await.unwrap();
        assert_eq!(ctx.settings.update_freq, 5);
        assert_eq!(ctx.settings.voice_name, "jenny");
        assert_eq!(ctx.settings.low_batt_update_freq, DeviceSettings::default().low_batt_update_freq);
        assert_eq!(ctx.settings.display_name, None);
        assert_eq!(ctx.data, DeviceData::default());
    }

    #[tokio::test]
    async fn oversized_wifi_list_is_truncated() {
        // ---
        let h = harness(offline_services()).await;
        let networks: Vec<Value> = (0..14).map(|i| json!({"ssid": format!("net{i}")})).collect();
        h.manager
            .repos()
            .documents
            .update("d1", DocumentKind::Settings, json!({"wifiNetworks": networks}))
            .await
            .unwrap();

        let ctx = h.manager.load("d1").await.unwrap();
        assert_eq!(ctx.settings.wifi_networks.len(), MAX_WIFI_NETWORKS);
        assert_eq!(ctx.settings.wifi_networks[9].ssid, "net9");
    }

    #[tokio::test]
    async fn clear_messages_fires_once() {
        // ---
        let h = harness(offline_services()).await;
        let messages = h.manager.repos().messages();
        let msg = DeviceMessage {
            user_msg: "hi".to_string(),
            assistant_msg: "hello".to_string(),
            user_img_id: None,
        };
        messages.add("d1", &msg, None).await.unwrap();

        let mut ctx = h.manager.load("d1").await.unwrap();
        ctx.settings.clear_messages = OneShot::armed();
        h.manager.persist(&ctx).await.unwrap();

        // Session 1 observes the flag and clears the store
        let mut ctx = h.manager.load("d1").await.unwrap();
        let meta = metadata(json!({"deviceId": "d1", "audioSize": 0, "imageSize": 0}));
        h.manager.reconcile(&mut ctx, &meta, None, Utc::now()).await;
        assert!(!ctx.settings.clear_messages.is_armed());
        h.manager.persist(&ctx).await.unwrap();
        assert!(messages.list("d1", Page::first(10)).await.unwrap().entries.is_empty());

        // Session 2 must not clear again
        messages.add("d1", &msg, None).await.unwrap();
        let mut ctx = h.manager.load("d1").await.unwrap();
        h.manager.reconcile(&mut ctx, &meta, None, Utc::now()).await;
        assert_eq!(messages.list("d1", Page::first(10)).await.unwrap().entries.len(), 1);
    }

    #[tokio::test]
    async fn capture_image_is_consumed_by_the_frame() {
        // ---
        let h = harness(offline_services()).await;
        let mut rx = h.sync.subscribe();

        let mut ctx = h.manager.load("d1").await.unwrap();
        ctx.settings.capture_image = OneShot::armed();

        let first = h.manager.control_frame(&mut ctx);
        assert!(first.take_pic);
        assert!(!ctx.settings.capture_image.is_armed());

        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            SyncEvent::SettingsUpdate {
                device_id: "d1".to_string(),
                settings: json!({"captureImage": false}),
            }
        );

        let second = h.manager.control_frame(&mut ctx);
        assert!(!second.take_pic);
    }

    #[tokio::test]
    async fn unreported_battery_keeps_the_stored_charge() {
        // ---
        let h = harness(offline_services()).await;

        let mut ctx = h.manager.load("d1").await.unwrap();
        let low = metadata(json!({"deviceId": "d1", "audioSize": 0, "imageSize": 0, "battery": 0.1}));
        h.manager.reconcile(&mut ctx, &low, None, Utc::now()).await;
        assert_eq!(h.manager.control_frame(&mut ctx).next_update, 300_000);
        h.manager.persist(&ctx).await.unwrap();

        // Next status omits the field entirely
        let mut ctx = h.manager.load("d1").await.unwrap();
        let silent = metadata(json!({"deviceId": "d1", "audioSize": 0, "imageSize": 0}));
        h.manager.reconcile(&mut ctx, &silent, None, Utc::now()).await;
        assert_eq!(ctx.data.battery, 0.1);
        assert_eq!(h.manager.control_frame(&mut ctx).next_update, 300_000);
        h.manager.persist(&ctx).await.unwrap();

        let stored = h.manager.load("d1").await.unwrap();
        assert_eq!(stored.data.battery, 0.1);
    }

    #[tokio::test]
    async fn wifi_disconnect_turns_wifi_off() {
        // ---
        let h = harness(offline_services()).await;
        let mut ctx = h.manager.load("d1").await.unwrap();
        ctx.settings.enable_wifi = true;
        let meta = metadata(json!({
            "deviceId": "d1", "audioSize": 0, "imageSize": 0, "didWifiDisconnect": true
        }));
        h.manager.reconcile(&mut ctx, &meta, None, Utc::now()).await;
        assert!(!ctx.settings.enable_wifi);
        assert!(!h.manager.control_frame(&mut ctx).wifi);
    }

    #[tokio::test]
    async fn gnss_fix_wins_over_tower() {
        // ---
        let tower = GeoFix {
            latitude: 5.0,
            longitude: 6.0,
            accuracy: 900.0,
        };
        let services = Services {
            towers: Arc::new(FixedTower(tower)),
            ..offline_services()
        };
        let h = harness(services).await;
        let now = Utc::now();

        let mut ctx = h.manager.load("d1").await.unwrap();
        ctx.settings.hologram_id = Some("modem-1".to_string());

        // No GNSS: tower is the only candidate
        let meta = metadata(json!({"deviceId": "d1", "audioSize": 0, "imageSize": 0, "battery": 0.5}));
        h.manager.reconcile(&mut ctx, &meta, None, now).await;
        assert_eq!(ctx.data.location_source, Some(LocationSource::Tower));
        assert_eq!(ctx.data.battery, 0.5);

        let meta = metadata(json!({
            "deviceId": "d1", "audioSize": 0, "imageSize": 0,
            "latitude": 1.0, "longitude": 2.0, "accuracy": 8.0
        }));
        h.manager.reconcile(&mut ctx, &meta, None, now + Duration::seconds(5)).await;
        assert_eq!(ctx.data.location_source, Some(LocationSource::Gnss));
        assert_eq!(ctx.data.latitude, 1.0);
        assert_eq!(ctx.data.location_accuracy, Some(8.0));
    }

    #[tokio::test]
    async fn uploaded_image_becomes_latest_capture() {
        // ---
        let h = harness(offline_services()).await;
        let mut ctx = h.manager.load("d1").await.unwrap();
        let meta = metadata(json!({"deviceId": "d1", "audioSize": 0, "imageSize": 0}));
        let now = Utc::now();

        h.manager
            .reconcile(&mut ctx, &meta, Some(Bytes::from_static(b"jpeg")), now)
            .await;

        let name = ctx.data.latest_image.clone().unwrap();
        assert_eq!(ctx.data.latest_image_captured, Some(now));
        assert_eq!(h.manager.media().load(&name).await.unwrap(), Bytes::from_static(b"jpeg"));

        let captures = h.manager.repos().captures().list("d1", Page::first(5)).await.unwrap();
        assert_eq!(captures.entries[0].body.image, name);
    }

    #[tokio::test]
    async fn last_writer_wins_across_sessions() {
        // ---
        let h = harness(offline_services()).await;

        let mut a = h.manager.load("d1").await.unwrap();
        let mut b = h.manager.load("d1").await.unwrap();
        a.settings.display_name = Some("from A".to_string());
        b.settings.display_name = Some("from B".to_string());

        h.manager.persist(&a).await.unwrap();
        h.manager.persist(&b).await.unwrap();

        let stored = h.manager.load("d1").await.unwrap();
        assert_eq!(stored.settings.display_name.as_deref(), Some("from B"));
    }

    #[tokio::test]
    async fn firmware_flag_is_consumed_once() {
        // ---
        let h = harness(offline_services()).await;
        let mut ctx = h.manager.load("d1").await.unwrap();
        ctx.settings.do_firmware_update = OneShot::armed();
        ctx.settings.firmware_update_file = Some("fw/v2.bin".to_string());
        h.manager.persist(&ctx).await.unwrap();

        h.manager.consume_firmware_update("d1").await.unwrap();
        let ctx = h.manager.load("d1").await.unwrap();
        assert!(!ctx.settings.do_firmware_update.is_armed());
        assert_eq!(ctx.settings.firmware_update_file, None);
    }

    #[test]
    fn merge_ignores_nulls_and_recurses() {
        // ---
        let mut defaults = json!({"a": 1, "b": {"c": 2, "d": 3}, "e": [1, 2]});
        merge_over_defaults(&mut defaults, json!({"a": null, "b": {"d": 4}, "e": [9], "f": true}));
        assert_eq!(defaults, json!({"a": 1, "b": {"c": 2, "d": 4}, "e": [9], "f": true}));
    }
}
