//! In-process fakes for the external services, shared by unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Bytes;
use chrono::{DateTime, Utc};

use crate::framing::WifiScanEntry;
use crate::services::completion::{AssistantReply, CompletionMessage, ModelSpec, ToolCall, ToolDefinition};
use crate::services::maps::{Directions, LocalTime, NearbyPlace, Place, Waypoint};
use crate::services::markets::StockQuote;
use crate::services::music::SongPreview;
use crate::services::search::{ArticleSummary, SearchResult};
use crate::services::weather::WeatherReport;
use crate::services::*;

// ---

fn offline<T>() -> ProviderResult<T> {
    Err(ProviderError::Unavailable("offline".to_string()))
}

/// Every service unreachable.
pub struct Offline;

#[async_trait]
impl CompletionProvider for Offline {
    async fn complete(&self, _: &ModelSpec, _: &[CompletionMessage], _: &[ToolDefinition]) -> ProviderResult<AssistantReply> {
        offline()
    }
}

#[async_trait]
impl SpeechRecognizer for Offline {
    async fn transcribe(&self, _: Bytes) -> ProviderResult<String> {
        offline()
    }
}

#[async_trait]
impl SpeechSynthesizer for Offline {
    async fn synthesize(&self, _: &str, _: &str) -> ProviderResult<Bytes> {
        offline()
    }
}

#[async_trait]
impl Maps for Offline {
    async fn local_time(&self, _: f64, _: f64, _: DateTime<Utc>) -> ProviderResult<LocalTime> {
        offline()
    }
    async fn geocode(&self, _: &str) -> ProviderResult<Place> {
        offline()
    }
    async fn reverse_geocode(&self, _: f64, _: f64) -> ProviderResult<Place> {
        offline()
    }
    async fn nearby_places(&self, _: &str, _: f64, _: f64, _: u32) -> ProviderResult<Vec<NearbyPlace>> {
        offline()
    }
    async fn directions(&self, _: Waypoint, _: &str) -> ProviderResult<Directions> {
        offline()
    }
    async fn geolocate_wifi(&self, _: &[WifiScanEntry]) -> ProviderResult<GeoFix> {
        offline()
    }
}

#[async_trait]
impl CellTowerLocator for Offline {
    async fn locate(&self, _: &str) -> ProviderResult<GeoFix> {
        offline()
    }
}

#[async_trait]
impl Weather for Offline {
    async fn report(&self, _: f64, _: f64) -> ProviderResult<WeatherReport> {
        offline()
    }
}

#[async_trait]
impl Markets for Offline {
    async fn quote(&self, _: &str) -> ProviderResult<StockQuote> {
        offline()
    }
}

#[async_trait]
impl WebSearch for Offline {
    async fn search(&self, _: &str) -> ProviderResult<Vec<SearchResult>> {
        offline()
    }
}

#[async_trait]
impl Encyclopedia for Offline {
    async fn lookup(&self, _: &str) -> ProviderResult<Vec<ArticleSummary>> {
        offline()
    }
}

#[async_trait]
impl Music for Offline {
    async fn preview(&self, _: &str) -> ProviderResult<SongPreview> {
        offline()
    }
}

/// All services offline.
pub fn offline_services() -> Services {
    // ---
    let offline = Arc::new(Offline);
    Services {
        completions: offline.clone(),
        recognizer: offline.clone(),
        synthesizer: offline.clone(),
        maps: offline.clone(),
        towers: offline.clone(),
        weather: offline.clone(),
        markets: offline.clone(),
        web: offline.clone(),
        encyclopedia: offline.clone(),
        music: offline,
    }
}

// ---

/// One recorded completion call.
#[derive(Debug, Clone)]
pub struct SeenCall {
    pub model: &'static str,
    pub messages: Vec<CompletionMessage>,
    pub tools: Vec<&'static str>,
}

/// Completion provider replaying a script; the last reply repeats.
pub struct ScriptedCompletions {
    script: Mutex<VecDeque<AssistantReply>>,
    calls: AtomicUsize,
    seen: Mutex<Vec<SeenCall>>,
}

impl ScriptedCompletions {
    // ---
    pub fn new(script: Vec<AssistantReply>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<SeenCall> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionProvider for ScriptedCompletions {
    async fn complete(
        &self,
        model: &ModelSpec,
        messages: &[CompletionMessage],
        tools: &[ToolDefinition],
    ) -> ProviderResult<AssistantReply> {
        // ---
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(SeenCall {
            model: model.key,
            messages: messages.to_vec(),
            tools: tools.iter().map(|t| t.name).collect(),
        });

        let mut script = self.script.lock().unwrap();
        let reply = if script.len() > 1 {
            script.pop_front()
        } else {
            script.front().cloned()
        };
        reply.ok_or_else(|| ProviderError::Unavailable("script is empty".to_string()))
    }
}

pub fn answer(text: &str) -> AssistantReply {
    AssistantReply {
        content: Some(text.to_string()),
        tool_calls: Vec::new(),
    }
}

/// A reply calling `calls` as (name, raw arguments) pairs.
pub fn call_tools(calls: &[(&str, &str)]) -> AssistantReply {
    AssistantReply {
        content: None,
        tool_calls: calls
            .iter()
            .enumerate()
            .map(|(i, (name, args))| ToolCall {
                id: format!("call_{i}_{name}"),
                name: name.to_string(),
                arguments: args.to_string(),
            })
            .collect(),
    }
}

// ---

pub struct FixedRecognizer(pub &'static str);

#[async_trait]
impl SpeechRecognizer for FixedRecognizer {
    async fn transcribe(&self, _: Bytes) -> ProviderResult<String> {
        Ok(self.0.to_string())
    }
}

/// Synthesizer that "speaks" the text bytes themselves.
pub struct EchoSynthesizer;

#[async_trait]
impl SpeechSynthesizer for EchoSynthesizer {
    async fn synthesize(&self, text: &str, _: &str) -> ProviderResult<Bytes> {
        Ok(Bytes::from(text.to_string()))
    }
}

pub struct FixedTower(pub GeoFix);

#[async_trait]
impl CellTowerLocator for FixedTower {
    async fn locate(&self, _: &str) -> ProviderResult<GeoFix> {
        Ok(self.0)
    }
}

pub struct FixedQuote;

#[async_trait]
impl Markets for FixedQuote {
    async fn quote(&self, _: &str) -> ProviderResult<StockQuote> {
        Ok(StockQuote {
            current: 189.5,
            change: Some(1.2),
            percent_change: Some(0.64),
            high: 190.0,
            low: 187.1,
            open: 188.0,
            previous_close: 188.3,
        })
    }
}

pub struct FixedSong;

#[async_trait]
impl Music for FixedSong {
    async fn preview(&self, _: &str) -> ProviderResult<SongPreview> {
        Ok(SongPreview {
            name: "Dancing Queen".to_string(),
            artist: "ABBA".to_string(),
            audio: Bytes::from_static(b"m4a-bytes"),
            format: "m4a",
        })
    }
}
