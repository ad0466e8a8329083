//! Where the device is and how to get places from there.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::{NoArgs, Tool, ToolContext, ToolError, ToolOutput};
use crate::services::completion::ToolDefinition;
use crate::services::maps::Waypoint;

// ---

/// Radius searched around the device for nearby places, in meters.
pub const NEARBY_RADIUS_M: u32 = 1600;

pub struct GetLocation;

#[async_trait]
impl Tool for GetLocation {
    type Args = NoArgs;

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "get_location",
            description: "Get the street address of the user's current location.",
            parameters: json!({"type": "object", "properties": {}}),
        }
    }

    async fn run(&self, _: NoArgs, ctx: &ToolContext<'_>) -> Result<ToolOutput, ToolError> {
        // ---
        let place = ctx
            .services
            .maps
            .reverse_geocode(ctx.data.latitude, ctx.data.longitude)
            .await?;
        Ok(ToolOutput::text(json!({"address": place.address}).to_string()))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectionsArgs {
    pub from_address: Option<String>,
    pub to_address: String,
}

pub struct GetDirections;

#[async_trait]
impl Tool for GetDirections {
    type Args = DirectionsArgs;

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "get_directions",
            description: "Get walking directions to a destination. Starts from the user's \
                          current location unless a starting address is given.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "fromAddress": {"type": "string", "description": "Optional starting address"},
                    "toAddress": {"type": "string", "description": "Destination address or place name"}
                },
                "required": ["toAddress"]
            }),
        }
    }

    async fn run(&self, args: DirectionsArgs, ctx: &ToolContext<'_>) -> Result<ToolOutput, ToolError> {
        // ---
        let origin = match args.from_address.filter(|a| !a.trim().is_empty()) {
            Some(address) => Waypoint::Address(address),
            None => Waypoint::Coordinates {
                latitude: ctx.data.latitude,
                longitude: ctx.data.longitude,
            },
        };

        let directions = ctx.services.maps.directions(origin, &args.to_address).await?;
        ToolOutput::json(&directions)
    }
}

#[derive(Debug, Deserialize)]
pub struct QueryArgs {
    pub query: String,
}

pub struct SearchNearbyPlaces;

#[async_trait]
impl Tool for SearchNearbyPlaces {
    type Args = QueryArgs;

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "search_nearby_places",
            description: "Search for places such as restaurants or shops near the user.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "What to look for, e.g. 'coffee'"}
                },
                "required": ["query"]
            }),
        }
    }

    async fn run(&self, args: QueryArgs, ctx: &ToolContext<'_>) -> Result<ToolOutput, ToolError> {
        // ---
        let places = ctx
            .services
            .maps
            .nearby_places(&args.query, ctx.data.latitude, ctx.data.longitude, NEARBY_RADIUS_M)
            .await?;

        if places.is_empty() {
            return Err(ToolError::Execution(format!("No places found for '{}'.", args.query)));
        }
        ToolOutput::json(&places)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};

    use super::*;
    use crate::engine::tools::test_support::Fixture;
    use crate::framing::WifiScanEntry;
    use crate::services::maps::{Directions, LocalTime, Maps, NearbyPlace, Place};
    use crate::services::{GeoFix, ProviderError, ProviderResult, Services};
    use crate::testing::offline_services;

    /// Records the origin of every directions request.
    #[derive(Default)]
    struct RecordingMaps {
        origins: Mutex<Vec<Waypoint>>,
    }

    #[async_trait]
    impl Maps for RecordingMaps {
        async fn local_time(&self, _: f64, _: f64, now: DateTime<Utc>) -> ProviderResult<LocalTime> {
            Ok(LocalTime::utc_fallback(now))
        }
        async fn geocode(&self, _: &str) -> ProviderResult<Place> {
            Err(ProviderError::Unavailable("unused".to_string()))
        }
        async fn reverse_geocode(&self, latitude: f64, longitude: f64) -> ProviderResult<Place> {
            Ok(Place {
                address: "1 Main St".to_string(),
                latitude,
                longitude,
            })
        }
        async fn nearby_places(&self, _: &str, _: f64, _: f64, radius_m: u32) -> ProviderResult<Vec<NearbyPlace>> {
            assert_eq!(radius_m, NEARBY_RADIUS_M);
            Ok(Vec::new())
        }
        async fn directions(&self, origin: Waypoint, _: &str) -> ProviderResult<Directions> {
            self.origins.lock().unwrap().push(origin);
            Ok(Directions {
                travel_time: "5 mins".to_string(),
                distance: "0.3 mi".to_string(),
                instructions: Vec::new(),
            })
        }
        async fn geolocate_wifi(&self, _: &[WifiScanEntry]) -> ProviderResult<GeoFix> {
            Err(ProviderError::Unavailable("unused".to_string()))
        }
    }

    fn fixture(maps: Arc<RecordingMaps>) -> Fixture {
        Fixture::new(Services {
            maps,
            ..offline_services()
        })
    }

    #[tokio::test]
    async fn directions_default_to_the_device_location() {
        // ---
        let maps = Arc::new(RecordingMaps::default());
        let fixture = fixture(maps.clone());

        GetDirections
            .run(
                DirectionsArgs {
                    from_address: None,
                    to_address: "Central Park".to_string(),
                },
                &fixture.ctx(),
            )
            .await
            .unwrap();
        GetDirections
            .run(
                DirectionsArgs {
                    from_address: Some("5th Ave".to_string()),
                    to_address: "Central Park".to_string(),
                },
                &fixture.ctx(),
            )
            .await
            .unwrap();

        let origins = maps.origins.lock().unwrap().clone();
        assert_eq!(
            origins,
            vec![
                Waypoint::Coordinates {
                    latitude: 40.7,
                    longitude: -74.0
                },
                Waypoint::Address("5th Ave".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn location_reports_the_address() {
        // ---
        let fixture = fixture(Arc::new(RecordingMaps::default()));
        let out = GetLocation.run(NoArgs {}, &fixture.ctx()).await.unwrap();
        assert_eq!(out.result, r#"{"address":"1 Main St"}"#);
    }

    #[tokio::test]
    async fn no_nearby_results_is_an_execution_error() {
        // ---
        let fixture = fixture(Arc::new(RecordingMaps::default()));
        let err = SearchNearbyPlaces
            .run(
                QueryArgs {
                    query: "ramen".to_string(),
                },
                &fixture.ctx(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Execution(_)));
    }
}
