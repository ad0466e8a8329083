//! External service collaborators.
//!
//! Each concern is a trait so that the session pipeline and the assistant
//! tools depend only on the contract; the HTTP clients here are the default
//! implementations wired up by [`Services::from_config`].

use std::sync::Arc;

use thiserror::Error;

use crate::Config;

pub mod completion;
pub mod maps;
pub mod markets;
pub mod music;
pub mod search;
pub mod speech;
pub mod tower;
pub mod weather;

pub use completion::{CompletionProvider, OpenAiCompletions};
pub use maps::{GoogleMaps, Maps};
pub use markets::{Finnhub, Markets};
pub use music::{ITunesPreviews, Music};
pub use search::{BraveSearch, Encyclopedia, WebSearch, Wikipedia};
pub use speech::{AzureSynthesizer, SpeechRecognizer, SpeechSynthesizer, WhisperRecognizer};
pub use tower::{CellTowerLocator, Hologram};
pub use weather::{OpenWeather, Weather};

// ---

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{service} is not configured ({key} missing)")]
    NotConfigured { service: &'static str, key: &'static str },

    #[error("{0}")]
    Unavailable(String),
}

pub type ProviderResult<T> = Result<T, ProviderError>;

/// A position estimate with its accuracy radius in meters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoFix {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: f64,
}

/// Require a configured API key.
pub(crate) fn key<'a>(
    value: &'a Option<String>,
    service: &'static str,
    name: &'static str,
) -> ProviderResult<&'a str> {
    value
        .as_deref()
        .ok_or(ProviderError::NotConfigured { service, key: name })
}

/// All collaborators the pipeline and tools call out to.
#[derive(Clone)]
pub struct Services {
    pub completions: Arc<dyn CompletionProvider>,
    pub recognizer: Arc<dyn SpeechRecognizer>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub maps: Arc<dyn Maps>,
    pub towers: Arc<dyn CellTowerLocator>,
    pub weather: Arc<dyn Weather>,
    pub markets: Arc<dyn Markets>,
    pub web: Arc<dyn WebSearch>,
    pub encyclopedia: Arc<dyn Encyclopedia>,
    pub music: Arc<dyn Music>,
}

impl Services {
    /// HTTP-backed services sharing one connection pool.
    pub fn from_config(cfg: &Config) -> Self {
        // ---
        let http = reqwest::Client::builder()
            .user_agent(concat!("pinlink-backend/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();

        Self {
            completions: Arc::new(OpenAiCompletions::new(http.clone(), cfg.keys.clone())),
            recognizer: Arc::new(WhisperRecognizer::new(http.clone(), cfg.keys.groq.clone())),
            synthesizer: Arc::new(AzureSynthesizer::new(
                http.clone(),
                cfg.keys.speech.clone(),
                cfg.speech_region.clone(),
            )),
            maps: Arc::new(GoogleMaps::new(http.clone(), cfg.keys.google.clone())),
            towers: Arc::new(Hologram::new(http.clone(), cfg.keys.hologram.clone())),
            weather: Arc::new(OpenWeather::new(http.clone(), cfg.keys.open_weather.clone())),
            markets: Arc::new(Finnhub::new(http.clone(), cfg.keys.finnhub.clone())),
            web: Arc::new(BraveSearch::new(http.clone(), cfg.keys.brave.clone())),
            encyclopedia: Arc::new(Wikipedia::new(http.clone())),
            music: Arc::new(ITunesPreviews::new(http)),
        }
    }
}
