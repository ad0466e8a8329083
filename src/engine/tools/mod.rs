//! Assistant tool catalogue.
//!
//! Each tool declares a typed argument struct; the raw JSON the model sends is
//! deserialized into it before the handler runs, and a mismatch comes back to
//! the model as an argument error instead of reaching the handler.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

use crate::audio::AudioComponent;
use crate::models::{DeviceData, DeviceNote, DeviceSettings, Entry};
use crate::repository::{RepoError, Repositories};
use crate::services::completion::ToolDefinition;
use crate::services::{ProviderError, Services};
use crate::sync::SyncPublisher;

pub mod device;
pub mod info;
pub mod location;
pub mod notes;

// ---

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    Argument(String),

    #[error("{0}")]
    Execution(String),

    #[error("no tool named '{0}' is available")]
    Unknown(String),
}

impl From<ProviderError> for ToolError {
    fn from(err: ProviderError) -> Self {
        ToolError::Execution(err.to_string())
    }
}

impl From<RepoError> for ToolError {
    fn from(err: RepoError) -> Self {
        ToolError::Execution(err.to_string())
    }
}

impl ToolError {
    /// Tool result text fed back to the model.
    pub fn to_result(&self) -> String {
        json!({"error": self.to_string()}).to_string()
    }
}

/// Settings a tool asks to change; applied once every call has been joined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsChange {
    EnableWifi(bool),
}

impl SettingsChange {
    pub fn apply(self, settings: &mut DeviceSettings) -> serde_json::Value {
        // ---
        match self {
            SettingsChange::EnableWifi(on) => {
                settings.enable_wifi = on;
                json!({"enableWifi": on})
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolOutput {
    /// Result text for the model, usually JSON.
    pub result: String,
    /// Audio played after the spoken answer.
    pub effects: Vec<AudioComponent>,
    pub settings: Option<SettingsChange>,
}

impl ToolOutput {
    pub fn text(result: impl Into<String>) -> Self {
        Self {
            result: result.into(),
            ..Self::default()
        }
    }

    pub fn json<T: serde::Serialize>(value: &T) -> Result<Self, ToolError> {
        serde_json::to_string(value)
            .map(Self::text)
            .map_err(|e| ToolError::Execution(e.to_string()))
    }
}

/// Read-only view of the session handed to every tool call.
pub struct ToolContext<'a> {
    pub device_id: &'a str,
    pub data: &'a DeviceData,
    pub settings: &'a DeviceSettings,
    pub notes: &'a [Entry<DeviceNote>],
    pub services: &'a Services,
    pub repos: &'a Repositories,
    pub sync: &'a dyn SyncPublisher,
}

/// Arguments of a tool that takes none.
#[derive(Debug, Default, Deserialize)]
pub struct NoArgs {}

#[async_trait]
pub trait Tool: Send + Sync {
    type Args: DeserializeOwned + Send;

    fn definition(&self) -> ToolDefinition;

    /// Withdrawn from the catalogue after its first successful call.
    fn available_once(&self) -> bool {
        false
    }

    async fn run(&self, args: Self::Args, ctx: &ToolContext<'_>) -> Result<ToolOutput, ToolError>;
}

/// Object-safe face of [`Tool`] taking raw model arguments.
#[async_trait]
pub trait DynTool: Send + Sync {
    fn definition(&self) -> ToolDefinition;

    fn available_once(&self) -> bool;

    async fn call(&self, raw_args: &str, ctx: &ToolContext<'_>) -> Result<ToolOutput, ToolError>;
}

#[async_trait]
impl<T: Tool> DynTool for T {
    fn definition(&self) -> ToolDefinition {
        Tool::definition(self)
    }

    fn available_once(&self) -> bool {
        Tool::available_once(self)
    }

    async fn call(&self, raw_args: &str, ctx: &ToolContext<'_>) -> Result<ToolOutput, ToolError> {
        // ---
        let args = parse_args::<T::Args>(raw_args)?;
        self.run(args, ctx).await
    }
}

fn parse_args<A: DeserializeOwned>(raw: &str) -> Result<A, ToolError> {
    // ---
    let raw = if raw.trim().is_empty() { "{}" } else { raw };
    serde_json::from_str(raw).map_err(|e| ToolError::Argument(e.to_string()))
}

/// Fixed name → tool table.
pub struct ToolRegistry {
    tools: HashMap<&'static str, Box<dyn DynTool>>,
    order: Vec<&'static str>,
}

impl ToolRegistry {
    // ---
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            order: Vec::new(),
        }
    }

    pub fn register<T: Tool + 'static>(mut self, tool: T) -> Self {
        // ---
        let name = Tool::definition(&tool).name;
        if self.tools.insert(name, Box::new(tool)).is_none() {
            self.order.push(name);
        }
        self
    }

    /// Every tool the assistant can call.
    pub fn catalogue() -> Self {
        Self::new()
            .register(location::GetLocation)
            .register(location::GetDirections)
            .register(location::SearchNearbyPlaces)
            .register(info::GetWeather)
            .register(info::StockQuoteTool)
            .register(info::SearchWeb)
            .register(info::SearchWikipedia)
            .register(notes::UpsertNote)
            .register(device::ToggleWifi)
            .register(device::PlayMusic)
    }

    pub fn get(&self, name: &str) -> Option<&dyn DynTool> {
        self.tools.get(name).map(|t| t.as_ref())
    }

    /// Names in registration order.
    pub fn names(&self) -> &[&'static str] {
        &self.order
    }

    pub fn definitions<'a>(&'a self, names: &'a [&'static str]) -> impl Iterator<Item = ToolDefinition> + 'a {
        names.iter().filter_map(|name| self.get(name)).map(|t| t.definition())
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::catalogue()
    }
}
