//! Configuration loader for the `pinlink-backend` service.
//!
//! This module centralizes all runtime configuration values and their defaults,
//! loading from environment variables (with optional `.env` file support
//! provided by the caller). Provider API keys are optional: a missing key
//! makes that provider fail when called, which the session pipeline contains.
//!
use std::env;

use anyhow::{anyhow, bail, Result};

/// Parse an optional integer environment variable with a default value.
macro_rules! parse_env_u32 {
    ($var_name:expr, $default:expr) => {
        env::var($var_name)
            .ok()
            .map(|v| v.parse::<u32>())
            .transpose()
            .map_err(|e| anyhow!("Invalid {}: {}", $var_name, e))?
            .unwrap_or($default)
    };
}

/// Parse an optional float environment variable with a default value.
macro_rules! parse_env_f64 {
    ($var_name:expr, $default:expr) => {
        env::var($var_name)
            .ok()
            .map(|v| v.parse::<f64>())
            .transpose()
            .map_err(|e| anyhow!("Invalid {}: {}", $var_name, e))?
            .unwrap_or($default)
    };
}

/// Parse a required string environment variable.
macro_rules! require_env {
    ($var_name:expr) => {
        env::var($var_name)
            .map_err(|_| anyhow!("{} must be set in .env or environment", $var_name))?
    };
}

/// Optional string environment variable; empty counts as unset.
fn optional_env(var_name: &str) -> Option<String> {
    env::var(var_name).ok().filter(|v| !v.trim().is_empty())
}

fn env_or(var_name: &str, default: &str) -> String {
    optional_env(var_name).unwrap_or_else(|| default.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbBackend {
    Memory,
    Postgres,
}

/// API keys for the external services. Never logged.
#[derive(Clone, Default)]
pub struct ProviderKeys {
    pub openai: Option<String>,
    pub groq: Option<String>,
    pub speech: Option<String>,
    pub google: Option<String>,
    pub hologram: Option<String>,
    pub open_weather: Option<String>,
    pub brave: Option<String>,
    pub finnhub: Option<String>,
}

impl ProviderKeys {
    fn entries(&self) -> [(&'static str, bool); 8] {
        [
            ("OPENAI_KEY", self.openai.is_some()),
            ("GROQ_KEY", self.groq.is_some()),
            ("SPEECH_KEY", self.speech.is_some()),
            ("GOOGLE_KEY", self.google.is_some()),
            ("HOLOGRAM_KEY", self.hologram.is_some()),
            ("OPEN_WEATHER_KEY", self.open_weather.is_some()),
            ("BRAVE_KEY", self.brave.is_some()),
            ("FINNHUB_KEY", self.finnhub.is_some()),
        ]
    }
}

impl std::fmt::Debug for ProviderKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for (name, set) in self.entries() {
            map.entry(&name, &if set { "****" } else { "<unset>" });
        }
        map.finish()
    }
}

/// Strongly typed application configuration.
///
/// All fields are immutable after loading, ensuring a consistent configuration
/// snapshot for the lifetime of the application.
#[derive(Debug, Clone)]
pub struct Config {
    // ---
    pub db_backend: DbBackend,

    /// PostgreSQL connection string, required for the postgres backend.
    pub db_url: Option<String>,

    /// Maximum number of database connections in the pool.
    pub db_pool_max: u32,

    pub port: u16,

    /// Root directory for uploaded images and firmware files.
    pub media_dir: String,

    pub ffmpeg_path: String,

    /// Recordings whose peak stays below this level (dBFS) count as silence.
    pub speech_floor_db: f64,

    /// Battery fraction below which the low-battery poll interval applies.
    pub low_battery_threshold: f64,

    /// Completion calls allowed per assistant turn.
    pub completion_max_calls: u32,

    /// Device ids registered at startup.
    pub seed_devices: Vec<String>,

    pub speech_region: String,

    pub keys: ProviderKeys,
}

/// Load configuration from environment variables with defaults.
///
/// Required:
/// - `DATABASE_URL` – PostgreSQL connection string, when `DB_BACKEND=postgres`
///
/// Optional:
/// - `DB_BACKEND` – `memory` or `postgres` (default: memory)
/// - `DB_POOL_MAX` – max DB connections (default: 5)
/// - `PORT` – listen port (default: 8080)
/// - `MEDIA_DIR` – media root (default: ./media)
/// - `FFMPEG_PATH` – ffmpeg executable (default: ffmpeg)
/// - `SPEECH_FLOOR_DB` – speech presence floor (default: -40)
/// - `LOW_BATTERY_THRESHOLD` – (default: 0.2)
/// - `COMPLETION_MAX_CALLS` – (default: 5)
/// - `SEED_DEVICES` – comma separated device ids
/// - `SPEECH_REGION` – speech synthesis region (default: eastus)
/// - provider keys: `OPENAI_KEY`, `GROQ_KEY`, `SPEECH_KEY`, `GOOGLE_KEY`,
///   `HOLOGRAM_KEY`, `OPEN_WEATHER_KEY`, `BRAVE_KEY`, `FINNHUB_KEY`
///
/// Returns an error if any required variable is missing or invalid.
pub fn load_from_env() -> Result<Config> {
    // ---
    let db_backend = match env_or("DB_BACKEND", "memory").to_ascii_lowercase().as_str() {
        "memory" => DbBackend::Memory,
        "postgres" => DbBackend::Postgres,
        other => bail!("Invalid DB_BACKEND: '{}' (expected memory or postgres)", other),
    };
    let db_url = match db_backend {
        DbBackend::Postgres => Some(require_env!("DATABASE_URL")),
        DbBackend::Memory => optional_env("DATABASE_URL"),
    };
    let db_pool_max = parse_env_u32!("DB_POOL_MAX", 5);

    let port = parse_env_u32!("PORT", 8080);
    let port = u16::try_from(port).map_err(|_| anyhow!("Invalid PORT: {}", port))?;

    let low_battery_threshold = parse_env_f64!("LOW_BATTERY_THRESHOLD", 0.2);
    if !(0.0..=1.0).contains(&low_battery_threshold) {
        bail!("Invalid LOW_BATTERY_THRESHOLD: {} is outside [0, 1]", low_battery_threshold);
    }

    let completion_max_calls = parse_env_u32!("COMPLETION_MAX_CALLS", 5);
    if completion_max_calls == 0 {
        bail!("Invalid COMPLETION_MAX_CALLS: must be at least 1");
    }

    let seed_devices = optional_env("SEED_DEVICES")
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();

    Ok(Config {
        db_backend,
        db_url,
        db_pool_max,
        port,
        media_dir: env_or("MEDIA_DIR", "./media"),
        ffmpeg_path: env_or("FFMPEG_PATH", "ffmpeg"),
        speech_floor_db: parse_env_f64!("SPEECH_FLOOR_DB", -40.0),
        low_battery_threshold,
        completion_max_calls,
        seed_devices,
        speech_region: env_or("SPEECH_REGION", "eastus"),
        keys: ProviderKeys {
            openai: optional_env("OPENAI_KEY"),
            groq: optional_env("GROQ_KEY"),
            speech: optional_env("SPEECH_KEY"),
            google: optional_env("GOOGLE_KEY"),
            hologram: optional_env("HOLOGRAM_KEY"),
            open_weather: optional_env("OPEN_WEATHER_KEY"),
            brave: optional_env("BRAVE_KEY"),
            finnhub: optional_env("FINNHUB_KEY"),
        },
    })
}

/// Mask the password in a database URL.
fn mask_db_url(db_url: &str) -> String {
    // ---
    if let Some(at_pos) = db_url.rfind('@') {
        if let Some(colon_pos) = db_url[..at_pos].rfind(':') {
            // "postgres://user@host" has its only colon in the scheme
            if !db_url[colon_pos..].starts_with("://") {
                return format!("{}:****{}", &db_url[..colon_pos], &db_url[at_pos..]);
            }
        }
    }
    db_url.to_string()
}

impl Config {
    /// Log the loaded configuration for debugging purposes.
    ///
    /// Masks the database password and never prints provider keys, only
    /// whether each one is set.
    pub fn log_config(&self) {
        // ---
        tracing::info!("Configuration loaded:");
        tracing::info!("  DB_BACKEND            : {:?}", self.db_backend);
        if let Some(db_url) = &self.db_url {
            tracing::info!("  DATABASE_URL          : {}", mask_db_url(db_url));
        }
        tracing::info!("  DB_POOL_MAX           : {}", self.db_pool_max);
        tracing::info!("  PORT                  : {}", self.port);
        tracing::info!("  MEDIA_DIR             : {}", self.media_dir);
        tracing::info!("  FFMPEG_PATH           : {}", self.ffmpeg_path);
        tracing::info!("  SPEECH_FLOOR_DB       : {}", self.speech_floor_db);
        tracing::info!("  LOW_BATTERY_THRESHOLD : {}", self.low_battery_threshold);
        tracing::info!("  COMPLETION_MAX_CALLS  : {}", self.completion_max_calls);
        tracing::info!("  SEED_DEVICES          : {}", self.seed_devices.len());
        tracing::info!("  SPEECH_REGION         : {}", self.speech_region);
        for (name, set) in self.keys.entries() {
            tracing::info!("  {:<22}: {}", name, if set { "****" } else { "<unset>" });
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn masks_database_password() {
        // ---
        assert_eq!(
            mask_db_url("postgres://pin:hunter2@db:5432/pinlink"),
            "postgres://pin:****@db:5432/pinlink"
        );
        assert_eq!(mask_db_url("postgres://pin@db/pinlink"), "postgres://pin@db/pinlink");
    }

    #[test]
    fn provider_keys_debug_hides_values() {
        // ---
        let keys = ProviderKeys {
            openai: Some("sk-secret".to_string()),
            ..ProviderKeys::default()
        };
        let shown = format!("{keys:?}");
        assert!(!shown.contains("sk-secret"));
        assert!(shown.contains("OPENAI_KEY"));
    }
}
