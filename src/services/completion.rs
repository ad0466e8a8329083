//! Chat-completion provider: message model, model catalogue and an
//! OpenAI-compatible HTTP client.

use async_trait::async_trait;
use axum::body::Bytes;
use data_encoding::BASE64;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{key, ProviderError, ProviderResult};
use crate::config::ProviderKeys;
use crate::models::{DEFAULT_TEXT_MODEL, DEFAULT_VISION_MODEL};

// ---

/// One message of the ephemeral completion context. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionMessage {
    System { content: String },
    User { content: String, image: Option<Bytes> },
    Assistant { content: Option<String>, tool_calls: Vec<ToolCall> },
    Tool { call_id: String, content: String },
}

impl CompletionMessage {
    pub fn system(content: impl Into<String>) -> Self {
        CompletionMessage::System {
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        CompletionMessage::User {
            content: content.into(),
            image: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        CompletionMessage::Assistant {
            content: Some(content.into()),
            tool_calls: Vec::new(),
        }
    }
}

/// A model-issued invocation; `arguments` is the raw JSON text.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// Tool advertised to the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDefinition {
    pub name: &'static str,
    pub description: &'static str,
    /// JSON schema of the argument object.
    pub parameters: Value,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssistantReply {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
}

// ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiKey {
    OpenAi,
    Groq,
}

/// A selectable language model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelSpec {
    /// Name stored in device settings.
    pub key: &'static str,
    pub endpoint: &'static str,
    /// Name sent to the provider.
    pub model: &'static str,
    pub supports_tools: bool,
    pub supports_vision: bool,
    pub api_key: ApiKey,
}

const OPENAI_CHAT: &str = "https://api.openai.com/v1/chat/completions";
const GROQ_CHAT: &str = "https://api.groq.com/openai/v1/chat/completions";

pub const MODELS: &[ModelSpec] = &[
    ModelSpec {
        key: "gpt-4o-mini",
        endpoint: OPENAI_CHAT,
        model: "gpt-4o-mini",
        supports_tools: true,
        supports_vision: true,
        api_key: ApiKey::OpenAi,
    },
    ModelSpec {
        key: "gpt-4o",
        endpoint: OPENAI_CHAT,
        model: "gpt-4o",
        supports_tools: true,
        supports_vision: true,
        api_key: ApiKey::OpenAi,
    },
    ModelSpec {
        key: "llama-3.3-70b",
        endpoint: GROQ_CHAT,
        model: "llama-3.3-70b-versatile",
        supports_tools: true,
        supports_vision: false,
        api_key: ApiKey::Groq,
    },
    ModelSpec {
        key: "llama-3.1-8b",
        endpoint: GROQ_CHAT,
        model: "llama-3.1-8b-instant",
        supports_tools: false,
        supports_vision: false,
        api_key: ApiKey::Groq,
    },
];

fn find_model(name: &str) -> Option<&'static ModelSpec> {
    MODELS.iter().find(|m| m.key == name)
}

/// Resolve a configured model name for the given modality.
///
/// Unknown names, and text-only models asked to look at an image, fall back
/// to the default model for that modality.
pub fn resolve_model(name: &str, vision: bool) -> &'static ModelSpec {
    // ---
    let default = if vision { DEFAULT_VISION_MODEL } else { DEFAULT_TEXT_MODEL };

    match find_model(name) {
        Some(spec) if !vision || spec.supports_vision => spec,
        _ => {
            tracing::warn!("Model '{}' unusable (vision: {}), using '{}'", name, vision, default);
            find_model(default).unwrap_or(&MODELS[0])
        }
    }
}

// ---

#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// One completion call. Models without tool support are sent no tools.
    async fn complete(
        &self,
        model: &ModelSpec,
        messages: &[CompletionMessage],
        tools: &[ToolDefinition],
    ) -> ProviderResult<AssistantReply>;
}

pub struct OpenAiCompletions {
    http: reqwest::Client,
    keys: ProviderKeys,
}

impl OpenAiCompletions {
    pub fn new(http: reqwest::Client, keys: ProviderKeys) -> Self {
        Self { http, keys }
    }
}

#[async_trait]
impl CompletionProvider for OpenAiCompletions {
    async fn complete(
        &self,
        model: &ModelSpec,
        messages: &[CompletionMessage],
        tools: &[ToolDefinition],
    ) -> ProviderResult<AssistantReply> {
        // ---
        let api_key = match model.api_key {
            ApiKey::OpenAi => key(&self.keys.openai, "completions", "OPENAI_KEY")?,
            ApiKey::Groq => key(&self.keys.groq, "completions", "GROQ_KEY")?,
        };

        let body = request_body(model, messages, tools);
        tracing::debug!("Completion request to {} ({} messages)", model.model, messages.len());

        let response: ChatResponse = self
            .http
            .post(model.endpoint)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        parse_response(response)
    }
}

fn request_body(model: &ModelSpec, messages: &[CompletionMessage], tools: &[ToolDefinition]) -> Value {
    // ---
    let messages: Vec<Value> = messages.iter().map(wire_message).collect();
    let mut body = json!({
        "model": model.model,
        "messages": messages,
    });

    if model.supports_tools && !tools.is_empty() {
        body["tools"] = tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect();
    }
    body
}

fn wire_message(msg: &CompletionMessage) -> Value {
    // ---
    match msg {
        CompletionMessage::System { content } => json!({"role": "system", "content": content}),
        CompletionMessage::User { content, image: None } => {
            json!({"role": "user", "content": content})
        }
        CompletionMessage::User {
            content,
            image: Some(image),
        } => json!({
            "role": "user",
            "content": [
                {"type": "text", "text": content},
                {
                    "type": "image_url",
                    "image_url": {"url": format!("data:image/jpeg;base64,{}", BASE64.encode(image))}
                },
            ]
        }),
        CompletionMessage::Assistant { content, tool_calls } => {
            let mut value = json!({"role": "assistant", "content": content});
            if !tool_calls.is_empty() {
                value["tool_calls"] = tool_calls
                    .iter()
                    .map(|c| {
                        json!({
                            "id": c.id,
                            "type": "function",
                            "function": {"name": c.name, "arguments": c.arguments},
                        })
                    })
                    .collect();
            }
            value
        }
        CompletionMessage::Tool { call_id, content } => json!({
            "role": "tool",
            "tool_call_id": call_id,
            "content": content,
        }),
    }
}

// --- Wire response

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

fn parse_response(response: ChatResponse) -> ProviderResult<AssistantReply> {
    // ---
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::Unavailable("no completion received from model".to_string()))?;

    Ok(AssistantReply {
        content: choice.message.content,
        tool_calls: choice
            .message
            .tool_calls
            .into_iter()
            .map(|c| ToolCall {
                id: c.id,
                name: c.function.name,
                arguments: c.function.arguments,
            })
            .collect(),
    })
}
