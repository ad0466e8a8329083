//! Tools acting on the device itself.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::location::QueryArgs;
use super::{SettingsChange, Tool, ToolContext, ToolError, ToolOutput};
use crate::audio::{AudioComponent, EFFECT_VOLUME};
use crate::services::completion::ToolDefinition;

// ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transformation {
    On,
    Off,
    Toggle,
}

impl Transformation {
    pub fn apply(self, current: bool) -> bool {
        match self {
            Transformation::On => true,
            Transformation::Off => false,
            Transformation::Toggle => !current,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ToggleArgs {
    pub transformation: Transformation,
}

pub struct ToggleWifi;

#[async_trait]
impl Tool for ToggleWifi {
    type Args = ToggleArgs;

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "toggle_wifi",
            description: "Turn the device's WiFi on or off, or toggle it.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "transformation": {"type": "string", "enum": ["on", "off", "toggle"]}
                },
                "required": ["transformation"]
            }),
        }
    }

    fn available_once(&self) -> bool {
        true
    }

    async fn run(&self, args: ToggleArgs, ctx: &ToolContext<'_>) -> Result<ToolOutput, ToolError> {
        // ---
        let on = args.transformation.apply(ctx.settings.enable_wifi);
        let state = if on { "on" } else { "off" };
        Ok(ToolOutput {
            result: json!({"result": format!("WiFi turned {state}")}).to_string(),
            effects: Vec::new(),
            settings: Some(SettingsChange::EnableWifi(on)),
        })
    }
}

pub struct PlayMusic;

#[async_trait]
impl Tool for PlayMusic {
    type Args = QueryArgs;

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "play_music",
            description: "Find a song and play a preview of it after your reply.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "Song name and optionally the artist"}
                },
                "required": ["query"]
            }),
        }
    }

    fn available_once(&self) -> bool {
        true
    }

    async fn run(&self, args: QueryArgs, ctx: &ToolContext<'_>) -> Result<ToolOutput, ToolError> {
        // ---
        let song = ctx.services.music.preview(&args.query).await?;
        tracing::debug!("Playing '{}' by {} on {}", song.name, song.artist, ctx.device_id);

        Ok(ToolOutput {
            result: json!({
                "action": "play-start",
                "songName": song.name,
                "songArtist": song.artist,
            })
            .to_string(),
            effects: vec![AudioComponent::effect(
                song.audio,
                song.format,
                Some(format!("volume={EFFECT_VOLUME}")),
            )],
            settings: None,
        })
    }
}
