//! Device session pipeline.
//!
//! One request is one session: decode the frame, load and reconcile the
//! device context, run the assistant when there is something to answer, then
//! encode the control frame and reply audio. Data and Settings are persisted
//! after the reply has been produced.

use std::sync::Arc;

use axum::body::Bytes;
use chrono::Utc;
use rand::seq::SliceRandom;

use crate::audio::{
    detect_speech_presence, AssembleOptions, AudioComponent, AudioPipeline, SpeechPresence, COMPONENT_SPACING_S,
};
use crate::context::{ContextManager, DeviceContext};
use crate::engine::{Engine, EngineOutcome, Terminal, UserTurn};
use crate::error::AppError;
use crate::framing::{decode_request, encode_response, ControlFrame};
use crate::models::{ContentKind, DeviceMessage};
use crate::services::speech::SYNTHESIS_FORMAT;
use crate::services::Services;
use crate::sync::{SyncEvent, SyncPublisher};

// ---

/// Replies used when the recording holds no speech.
pub const NO_SPEECH_MESSAGES: &[&str] = &[
    "Sorry, I couldn't hear you. Can you repeat that?",
    "I didn't hear anything. Could you repeat that?",
];

fn no_speech_message() -> &'static str {
    NO_SPEECH_MESSAGES
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(NO_SPEECH_MESSAGES[0])
}

/// Encoded reply plus the frame it starts with.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionReply {
    pub frame: ControlFrame,
    pub body: Vec<u8>,
}

/// What the assistant said and the clips to play, before assembly.
#[derive(Debug, Clone, PartialEq)]
pub struct Conversation {
    pub answer: String,
    pub components: Vec<AudioComponent>,
    /// `None` when no speech was heard and the engine never ran.
    pub outcome: Option<EngineOutcome>,
}

pub struct SessionPipeline {
    contexts: ContextManager,
    engine: Engine,
    audio: AudioPipeline,
    services: Services,
    sync: Arc<dyn SyncPublisher>,
    speech_floor_db: f64,
}

impl SessionPipeline {
    // ---
    pub fn new(
        contexts: ContextManager,
        engine: Engine,
        audio: AudioPipeline,
        services: Services,
        sync: Arc<dyn SyncPublisher>,
        speech_floor_db: f64,
    ) -> Self {
        Self {
            contexts,
            engine,
            audio,
            services,
            sync,
            speech_floor_db,
        }
    }

    pub fn contexts(&self) -> &ContextManager {
        &self.contexts
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Full assistant session: audio in, spoken answer out.
    pub async fn handle_assistant(&self, body: Bytes) -> Result<SessionReply, AppError> {
        // ---
        let request = decode_request(body)?;
        let metadata = request.metadata;
        tracing::info!(
            "Assistant session for {} ({} bytes {}, image: {})",
            metadata.device_id,
            request.audio.len(),
            metadata.audio_format,
            request.image.is_some()
        );

        let mut ctx = self.contexts.load(&metadata.device_id).await?;
        self.contexts
            .reconcile(&mut ctx, &metadata, request.image.clone(), Utc::now())
            .await;

        let wav = self.audio.transcode(request.audio, &metadata.audio_format).await?;
        let conversation = self.converse(&mut ctx, wav, request.image).await?;

        let audio = self
            .audio
            .assemble(
                &conversation.components,
                &AssembleOptions {
                    bitrate: metadata.audio_bitrate.clone(),
                    spacing: COMPONENT_SPACING_S,
                },
            )
            .await?;

        self.finish(ctx, &audio)
    }

    /// Telemetry-only session: reconcile and reply with a bare frame.
    pub async fn handle_status(&self, body: Bytes) -> Result<SessionReply, AppError> {
        // ---
        let request = decode_request(body)?;
        let metadata = request.metadata;
        tracing::info!("Status update from {}", metadata.device_id);

        let mut ctx = self.contexts.load(&metadata.device_id).await?;
        self.contexts
            .reconcile(&mut ctx, &metadata, request.image, Utc::now())
            .await;

        self.finish(ctx, &[])
    }

    /// Recognize, answer, record and voice one turn from canonical WAV.
    pub async fn converse(
        &self,
        ctx: &mut DeviceContext,
        wav: Bytes,
        image: Option<Bytes>,
    ) -> Result<Conversation, AppError> {
        // ---
        let transcript = match detect_speech_presence(&wav, self.speech_floor_db)? {
            SpeechPresence::Silence { peak_db } => {
                tracing::debug!("No speech from {} (peak {:.1} dBFS)", ctx.device_id, peak_db);
                None
            }
            SpeechPresence::Speech { .. } => {
                let text = self.services.recognizer.transcribe(wav).await?;
                Some(text).filter(|t| !t.trim().is_empty())
            }
        };

        let Some(transcript) = transcript else {
            let answer = no_speech_message().to_string();
            let components = self.respond_to_speech(ctx, &answer, Vec::new()).await?;
            return Ok(Conversation {
                answer,
                components,
                outcome: None,
            });
        };
        tracing::debug!("Device {} said: {}", ctx.device_id, transcript);

        let outcome = self
            .engine
            .run(
                ctx,
                UserTurn {
                    text: transcript.clone(),
                    image: image.clone(),
                },
            )
            .await?;
        tracing::info!(
            "Answered {} in {} completion calls (tools: {:?})",
            ctx.device_id,
            outcome.completion_calls,
            outcome.tools_called
        );

        if outcome.terminal == Terminal::Answered {
            self.record_exchange(ctx, transcript, &outcome.answer, image.is_some())
                .await;
        }

        let components = self
            .respond_to_speech(ctx, &outcome.answer, outcome.effects.clone())
            .await?;
        Ok(Conversation {
            answer: outcome.answer.clone(),
            components,
            outcome: Some(outcome),
        })
    }

    /// Spoken answer first, then any effects.
    async fn respond_to_speech(
        &self,
        ctx: &DeviceContext,
        answer: &str,
        effects: Vec<AudioComponent>,
    ) -> Result<Vec<AudioComponent>, AppError> {
        // ---
        let speech = self
            .services
            .synthesizer
            .synthesize(answer, &ctx.settings.voice_name)
            .await?;

        let mut components = Vec::with_capacity(effects.len() + 1);
        components.push(AudioComponent::speech(speech, SYNTHESIS_FORMAT));
        components.extend(effects);
        Ok(components)
    }

    /// Append the exchange to the message store; failures are logged.
    async fn record_exchange(&self, ctx: &DeviceContext, user_msg: String, answer: &str, with_image: bool) {
        // ---
        let message = DeviceMessage {
            user_msg,
            assistant_msg: answer.to_string(),
            user_img_id: ctx.data.latest_image.clone().filter(|_| with_image),
        };

        let keep = ctx.settings.messages_to_keep;
        match self.contexts.repos().messages().add(&ctx.device_id, &message, Some(keep)).await {
            Ok(entry) => self.sync.publish(SyncEvent::content(
                &ctx.device_id,
                ContentKind::Messages,
                std::slice::from_ref(&entry),
            )),
            Err(e) => tracing::error!("Failed to store message for {}: {}", ctx.device_id, e),
        }
    }

    /// Encode the reply and persist in the background.
    fn finish(&self, mut ctx: DeviceContext, audio: &[u8]) -> Result<SessionReply, AppError> {
        // ---
        let frame = self.contexts.control_frame(&mut ctx);
        let body = encode_response(&frame, audio)?;
        self.contexts.persist_in_background(ctx);
        Ok(SessionReply { frame, body })
    }
}
