//! Speech recognition (Whisper-compatible) and synthesis (SSML REST).

use async_trait::async_trait;
use axum::body::Bytes;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;

use super::{key, ProviderResult};

// ---

const WHISPER_ENDPOINT: &str = "https://api.groq.com/openai/v1/audio/transcriptions";
const WHISPER_MODEL: &str = "whisper-large-v3-turbo";

/// Container format returned by [`SpeechSynthesizer::synthesize`].
pub const SYNTHESIS_FORMAT: &str = "mp3";
const SYNTHESIS_OUTPUT: &str = "audio-16khz-32kbitrate-mono-mp3";
const SYNTHESIS_LANGUAGE: &str = "en-US";

/// Assistant voices selectable through the `voiceName` setting.
const VOICES: &[(&str, &str)] = &[
    ("davis", "en-US-DavisNeural"),
    ("andrew", "en-US-AndrewNeural"),
    ("derek", "en-US-DerekNeural"),
    ("nancy", "en-US-NancyNeural"),
    ("jenny", "en-US-JennyNeural"),
];

/// Provider voice for a settings voice name; unknown names get the first voice.
pub fn provider_voice(name: &str) -> &'static str {
    VOICES
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, voice)| *voice)
        .unwrap_or(VOICES[0].1)
}

#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    /// Transcribe a WAV buffer.
    async fn transcribe(&self, wav: Bytes) -> ProviderResult<String>;
}

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Speak `text` with the named settings voice, returning
    /// [`SYNTHESIS_FORMAT`] audio.
    async fn synthesize(&self, text: &str, voice_name: &str) -> ProviderResult<Bytes>;
}

// ---

pub struct WhisperRecognizer {
    http: reqwest::Client,
    api_key: Option<String>,
}

impl WhisperRecognizer {
    pub fn new(http: reqwest::Client, api_key: Option<String>) -> Self {
        Self { http, api_key }
    }
}

#[derive(Deserialize)]
struct Transcription {
    text: String,
}

#[async_trait]
impl SpeechRecognizer for WhisperRecognizer {
    async fn transcribe(&self, wav: Bytes) -> ProviderResult<String> {
        // ---
        let api_key = key(&self.api_key, "speech recognition", "GROQ_KEY")?;

        let file = Part::bytes(wav.to_vec())
            .file_name("audio.wav")
            .mime_str("audio/wav")?;
        let form = Form::new()
            .part("file", file)
            .text("model", WHISPER_MODEL);

        let transcription: Transcription = self
            .http
            .post(WHISPER_ENDPOINT)
            .bearer_auth(api_key)
            .multipart(form)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(transcription.text.trim().to_string())
    }
}

pub struct AzureSynthesizer {
    http: reqwest::Client,
    api_key: Option<String>,
    region: String,
}

impl AzureSynthesizer {
    pub fn new(http: reqwest::Client, api_key: Option<String>, region: String) -> Self {
        Self {
            http,
            api_key,
            region,
        }
    }
}

#[async_trait]
impl SpeechSynthesizer for AzureSynthesizer {
    async fn synthesize(&self, text: &str, voice_name: &str) -> ProviderResult<Bytes> {
        // ---
        let api_key = key(&self.api_key, "speech synthesis", "SPEECH_KEY")?;
        let url = format!(
            "https://{}.tts.speech.microsoft.com/cognitiveservices/v1",
            self.region
        );

        let audio = self
            .http
            .post(url)
            .header("Ocp-Apim-Subscription-Key", api_key)
            .header("Content-Type", "application/ssml+xml")
            .header("X-Microsoft-OutputFormat", SYNTHESIS_OUTPUT)
            .body(ssml(text, provider_voice(voice_name)))
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;

        Ok(audio)
    }
}

fn ssml(text: &str, voice: &str) -> String {
    format!(
        r#"<speak version="1.0" xmlns="http://www.w3.org/2001/10/synthesis" xml:lang="{SYNTHESIS_LANGUAGE}"><voice name="{voice}">{}</voice></speak>"#,
        escape_xml(text)
    )
}

fn escape_xml(text: &str) -> String {
    // ---
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}
