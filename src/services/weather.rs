//! Current conditions and today's forecast.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{key, ProviderError, ProviderResult};

// ---

const ONECALL_API: &str = "https://api.openweathermap.org/data/3.0/onecall";

/// Imperial units throughout (°F, mph).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WeatherReport {
    pub low: f64,
    pub high: f64,
    pub prob_of_precip: f64,
    pub sunrise: DateTime<Utc>,
    pub sunset: DateTime<Utc>,
    pub current_temp: f64,
    pub current_humidity: f64,
    pub current_uvi: f64,
    pub current_wind_speed: f64,
    pub current_conditions: Option<String>,
}

#[async_trait]
pub trait Weather: Send + Sync {
    async fn report(&self, latitude: f64, longitude: f64) -> ProviderResult<WeatherReport>;
}

pub struct OpenWeather {
    http: reqwest::Client,
    api_key: Option<String>,
}

impl OpenWeather {
    pub fn new(http: reqwest::Client, api_key: Option<String>) -> Self {
        Self { http, api_key }
    }
}

// --- Wire types

#[derive(Deserialize)]
struct Condition {
    main: String,
}

#[derive(Deserialize)]
struct Current {
    temp: f64,
    humidity: f64,
    uvi: f64,
    wind_speed: f64,
    #[serde(default)]
    weather: Vec<Condition>,
}

#[derive(Deserialize)]
struct DailyTemp {
    min: f64,
    max: f64,
}

#[derive(Deserialize)]
struct Daily {
    #[serde(with = "chrono::serde::ts_seconds")]
    sunrise: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_seconds")]
    sunset: DateTime<Utc>,
    temp: DailyTemp,
    pop: f64,
}

#[derive(Deserialize)]
struct OneCall {
    current: Current,
    daily: Vec<Daily>,
}

fn into_report(onecall: OneCall) -> ProviderResult<WeatherReport> {
    // ---
    let today = onecall
        .daily
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::Unavailable("no daily forecast".to_string()))?;

    Ok(WeatherReport {
        low: today.temp.min,
        high: today.temp.max,
        prob_of_precip: today.pop,
        sunrise: today.sunrise,
        sunset: today.sunset,
        current_temp: onecall.current.temp,
        current_humidity: onecall.current.humidity,
        current_uvi: onecall.current.uvi,
        current_wind_speed: onecall.current.wind_speed,
        current_conditions: onecall.current.weather.into_iter().next().map(|c| c.main),
    })
}

#[async_trait]
impl Weather for OpenWeather {
    async fn report(&self, latitude: f64, longitude: f64) -> ProviderResult<WeatherReport> {
        // ---
        let api_key = key(&self.api_key, "weather", "OPEN_WEATHER_KEY")?;

        let onecall: OneCall = self
            .http
            .get(ONECALL_API)
            .query(&[
                ("lat", latitude.to_string()),
                ("lon", longitude.to_string()),
                ("units", "imperial".to_string()),
                ("exclude", "minutely,hourly,alerts".to_string()),
                ("appid", api_key.to_string()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        into_report(onecall)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use serde_json::json;

    #[test]
    fn report_uses_first_day() {
        // ---
        let onecall: OneCall = serde_json::from_value(json!({
            "current": {"temp": 71.2, "humidity": 40, "uvi": 3.1, "wind_speed": 5.5,
                        "weather": [{"id": 800, "main": "Clear"}]},
            "daily": [
                {"sunrise": 1_700_000_000, "sunset": 1_700_040_000, "temp": {"min": 60, "max": 75}, "pop": 0.1},
                {"sunrise": 1_700_086_400, "sunset": 1_700_126_400, "temp": {"min": 50, "max": 65}, "pop": 0.9}
            ]
        }))
        .unwrap();

        let report = into_report(onecall).unwrap();
        assert_eq!(report.high, 75.0);
        assert_eq!(report.sunrise.timestamp(), 1_700_000_000);
        assert_eq!(report.current_conditions.as_deref(), Some("Clear"));
    }
}
