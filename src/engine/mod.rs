//! Assistant orchestration: a bounded tool-calling loop over the completion
//! provider.
//!
//! The loop is an explicit state machine:
//!
//! ```text
//! Init → ContextAssembled → AwaitingCompletion ⇄ ToolDispatch
//!                                  ↓                  ↓
//!                              Answered           Exhausted
//! ```
//!
//! Every completion call counts against `max_calls`. Tool calls issued by the
//! last permitted completion still run before the loop gives up, so their side
//! effects are not lost.

use std::sync::Arc;

use axum::body::Bytes;
use chrono::Utc;
use futures::future::join_all;

use crate::audio::AudioComponent;
use crate::context::DeviceContext;
use crate::models::{DeviceMessage, DeviceNote, Entry, Page};
use crate::repository::Repositories;
use crate::services::completion::{resolve_model, CompletionMessage, ModelSpec, ToolCall};
use crate::services::maps::LocalTime;
use crate::services::{ProviderResult, Services};
use crate::sync::{SyncEvent, SyncPublisher};

pub mod prompt;
pub mod tools;

use tools::{SettingsChange, ToolContext, ToolError, ToolOutput, ToolRegistry};

// ---

/// Most notes interpolated into the system prompt.
const PROMPT_NOTES: usize = 50;

/// Spoken when the model answers with nothing.
pub const EMPTY_ANSWER: &str = "No response from Davis, please try again.";

/// What the user said, plus the picture they took with it.
#[derive(Debug, Clone, PartialEq)]
pub struct UserTurn {
    pub text: String,
    pub image: Option<Bytes>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminal {
    Answered,
    Exhausted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineOutcome {
    pub answer: String,
    pub terminal: Terminal,
    pub completion_calls: u32,
    /// Names of tools that ran successfully, in completion order.
    pub tools_called: Vec<String>,
    /// Audio contributed by tools, played after the answer.
    pub effects: Vec<AudioComponent>,
}

enum State {
    Init,
    ContextAssembled {
        messages: Vec<CompletionMessage>,
    },
    AwaitingCompletion {
        messages: Vec<CompletionMessage>,
    },
    ToolDispatch {
        messages: Vec<CompletionMessage>,
        content: Option<String>,
        calls: Vec<ToolCall>,
    },
    Answered(String),
    Exhausted,
}

/// Everything `Init` fetches before the prompt can be built.
struct Gathered {
    time: LocalTime,
    notes: Vec<Entry<DeviceNote>>,
    history: Vec<Entry<DeviceMessage>>,
}

pub struct Engine {
    services: Services,
    repos: Repositories,
    sync: Arc<dyn SyncPublisher>,
    tools: ToolRegistry,
    max_calls: u32,
}

impl Engine {
    // ---
    pub fn new(services: Services, repos: Repositories, sync: Arc<dyn SyncPublisher>, max_calls: u32) -> Self {
        Self {
            services,
            repos,
            sync,
            tools: ToolRegistry::catalogue(),
            max_calls: max_calls.max(1),
        }
    }

    /// Answer one user turn.
    ///
    /// Only a completion-provider failure is an error; every other failure is
    /// degraded or contained. Settings changed by tools are applied to
    /// `ctx.settings` and published.
    pub async fn run(&self, ctx: &mut DeviceContext, turn: UserTurn) -> ProviderResult<EngineOutcome> {
        // ---
        let model = self.model_for(ctx, turn.image.is_some());
        let mut available: Vec<&'static str> = self.tools.names().to_vec();
        let mut notes = Vec::new();

        let mut completion_calls = 0u32;
        let mut tools_called = Vec::new();
        let mut effects = Vec::new();
        let mut state = State::Init;

        let answer = loop {
            state = match state {
                State::Init => {
                    let gathered = self.gather(ctx).await;
                    let messages = self.assemble(ctx, &gathered, &turn);
                    notes = gathered.notes;
                    State::ContextAssembled { messages }
                }

                State::ContextAssembled { messages } => State::AwaitingCompletion { messages },

                State::AwaitingCompletion { messages } => {
                    let definitions: Vec<_> = self.tools.definitions(&available).collect();
                    completion_calls += 1;
                    tracing::debug!(
                        "Completion call {}/{} for {} with {} tools",
                        completion_calls,
                        self.max_calls,
                        model.key,
                        definitions.len()
                    );

                    let reply = self.services.completions.complete(model, &messages, &definitions).await?;
                    if reply.tool_calls.is_empty() {
                        State::Answered(reply.content.unwrap_or_default())
                    } else {
                        State::ToolDispatch {
                            messages,
                            content: reply.content,
                            calls: reply.tool_calls,
                        }
                    }
                }

                State::ToolDispatch {
                    mut messages,
                    content,
                    calls,
                } => {
                    let results = self.dispatch(ctx, &notes, &calls, &available).await;

                    messages.push(CompletionMessage::Assistant {
                        content,
                        tool_calls: calls.clone(),
                    });

                    let mut changes = Vec::new();
                    for (call, result) in calls.iter().zip(results) {
                        let text = match result {
                            Ok(output) => {
                                tools_called.push(call.name.clone());
                                effects.extend(output.effects);
                                changes.extend(output.settings);
                                let once = self.tools.get(&call.name).is_some_and(|t| t.available_once());
                                if once {
                                    available.retain(|name| *name != call.name);
                                }
                                output.result
                            }
                            Err(err) => {
                                tracing::warn!("Tool '{}' failed for {}: {}", call.name, ctx.device_id, err);
                                err.to_result()
                            }
                        };
                        messages.push(CompletionMessage::Tool {
                            call_id: call.id.clone(),
                            content: text,
                        });
                    }
                    self.apply_settings(ctx, changes);

                    if completion_calls >= self.max_calls {
                        State::Exhausted
                    } else {
                        State::AwaitingCompletion { messages }
                    }
                }

                State::Answered(answer) => break (answer, Terminal::Answered),

                State::Exhausted => {
                    tracing::warn!(
                        "No answer for {} after {} completion calls",
                        ctx.device_id,
                        completion_calls
                    );
                    break (exhausted_message(self.max_calls), Terminal::Exhausted);
                }
            };
        };

        let (answer, terminal) = answer;
        let answer = if answer.trim().is_empty() {
            EMPTY_ANSWER.to_string()
        } else {
            answer.trim().to_string()
        };

        Ok(EngineOutcome {
            answer,
            terminal,
            completion_calls,
            tools_called,
            effects,
        })
    }

    fn model_for(&self, ctx: &DeviceContext, vision: bool) -> &'static ModelSpec {
        let name = if vision {
            &ctx.settings.vision_llm_name
        } else {
            &ctx.settings.llm_name
        };
        resolve_model(name, vision)
    }

    /// Local time, notes and history, each with an empty fallback.
    async fn gather(&self, ctx: &DeviceContext) -> Gathered {
        // ---
        let now = Utc::now();
        let notes_repo = self.repos.notes();
        let messages_repo = self.repos.messages();
        let (time, notes, history) = tokio::join!(
            self.services.maps.local_time(ctx.data.latitude, ctx.data.longitude, now),
            notes_repo.list(&ctx.device_id, Page::first(PROMPT_NOTES)),
            messages_repo.list(&ctx.device_id, Page::first(ctx.settings.messages_to_keep)),
        );

        let time = time.unwrap_or_else(|e| {
            tracing::warn!("Local time lookup failed for {}: {}", ctx.device_id, e);
            LocalTime::utc_fallback(now)
        });
        let notes = notes.map(|p| p.entries).unwrap_or_else(|e| {
            tracing::warn!("Failed to load notes for {}: {}", ctx.device_id, e);
            Vec::new()
        });
        let history = history.map(|p| p.entries).unwrap_or_else(|e| {
            tracing::warn!("Failed to load history for {}: {}", ctx.device_id, e);
            Vec::new()
        });

        Gathered { time, notes, history }
    }

    /// System prompt, history, then the current turn.
    fn assemble(&self, ctx: &DeviceContext, gathered: &Gathered, turn: &UserTurn) -> Vec<CompletionMessage> {
        // ---
        let template = if turn.image.is_some() {
            &ctx.settings.vision_llm_prompt
        } else {
            &ctx.settings.llm_prompt
        };

        let mut messages = vec![CompletionMessage::system(prompt::interpolate(
            template,
            &gathered.time,
            ctx.data.battery,
            &gathered.notes,
        ))];
        messages.extend(prompt::history(&gathered.history));
        messages.push(CompletionMessage::User {
            content: turn.text.clone(),
            image: turn.image.clone(),
        });
        messages
    }

    /// Run every call concurrently; results line up with `calls`.
    async fn dispatch(
        &self,
        ctx: &DeviceContext,
        notes: &[Entry<DeviceNote>],
        calls: &[ToolCall],
        available: &[&'static str],
    ) -> Vec<Result<ToolOutput, ToolError>> {
        // ---
        let tool_ctx = ToolContext {
            device_id: &ctx.device_id,
            data: &ctx.data,
            settings: &ctx.settings,
            notes,
            services: &self.services,
            repos: &self.repos,
            sync: self.sync.as_ref(),
        };
        let tool_ctx = &tool_ctx;

        let futures = calls.iter().enumerate().map(|(i, call)| async move {
            let tool = available
                .contains(&call.name.as_str())
                .then(|| self.tools.get(&call.name))
                .flatten()
                .ok_or_else(|| ToolError::Unknown(call.name.clone()))?;

            // A withdrawable tool runs at most once per batch
            if tool.available_once() && calls[..i].iter().any(|c| c.name == call.name) {
                return Err(ToolError::Execution(format!("'{}' was already called", call.name)));
            }

            tracing::debug!("Calling tool '{}' for {}", call.name, tool_ctx.device_id);
            tool.call(&call.arguments, tool_ctx).await
        });

        join_all(futures).await
    }

    fn apply_settings(&self, ctx: &mut DeviceContext, changes: Vec<SettingsChange>) {
        // ---
        for change in changes {
            let patch = change.apply(&mut ctx.settings);
            self.sync.publish(SyncEvent::SettingsUpdate {
                device_id: ctx.device_id.clone(),
                settings: patch,
            });
        }
    }
}

pub fn exhausted_message(max_calls: u32) -> String {
    format!("Failed to get a response in {max_calls} calls.")
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::models::{DeviceData, DeviceSettings};
    use crate::services::completion::AssistantReply;
    use crate::sync::BroadcastSync;
    use crate::testing::{answer, call_tools, offline_services, FixedQuote, FixedSong, ScriptedCompletions};

    fn context() -> DeviceContext {
        DeviceContext {
            device_id: "d1".to_string(),
            data: DeviceData {
                battery: 0.5,
                ..DeviceData::default()
            },
            settings: DeviceSettings::default(),
        }
    }

    fn engine(script: Vec<AssistantReply>, services: Services) -> (Engine, Arc<ScriptedCompletions>) {
        // ---
        let completions = ScriptedCompletions::new(script);
        let services = Services {
            completions: completions.clone(),
            ..services
        };
        let engine = Engine::new(services, Repositories::in_memory(), Arc::new(BroadcastSync::new(16)), 5);
        (engine, completions)
    }

    fn turn(text: &str) -> UserTurn {
        UserTurn {
            text: text.to_string(),
            image: None,
        }
    }

    #[tokio::test]
    async fn direct_answer_takes_one_call() {
        // ---
        let (engine, completions) = engine(vec![answer("It's sunny.")], offline_services());
        let mut ctx = context();

        let outcome = engine.run(&mut ctx, turn("weather?")).await.unwrap();
        assert_eq!(outcome.terminal, Terminal::Answered);
        assert_eq!(outcome.answer, "It's sunny.");
        assert_eq!(outcome.completion_calls, 1);
        assert_eq!(completions.calls(), 1);

        // Offline maps fall back to UTC; the prompt is still built
        let seen = completions.seen();
        let CompletionMessage::System { content } = &seen[0].messages[0] else {
            panic!("first message must be the system prompt");
        };
        assert!(content.contains("timezone: UTC"));
        assert!(content.contains("battery charge: 50%"));
        assert_eq!(seen[0].messages.last(), Some(&CompletionMessage::user("weather?")));
        assert_eq!(seen[0].model, "gpt-4o-mini");
    }

    #[tokio::test]
    async fn exhausts_after_five_calls_but_runs_the_last_tools() {
        // ---
        let (engine, completions) = engine(
            vec![call_tools(&[("stock_quote", r#"{"symbol": "AAPL"}"#)])],
            Services {
                markets: Arc::new(FixedQuote),
                ..offline_services()
            },
        );
        let mut ctx = context();

        let outcome = engine.run(&mut ctx, turn("apple stock")).await.unwrap();
        assert_eq!(outcome.terminal, Terminal::Exhausted);
        assert_eq!(outcome.completion_calls, 5);
        assert_eq!(completions.calls(), 5);
        assert_eq!(outcome.tools_called.len(), 5);
        assert_eq!(outcome.answer, "Failed to get a response in 5 calls.");
    }

    #[tokio::test]
    async fn failing_tool_does_not_sink_its_sibling() {
        // ---
        let (engine, completions) = engine(
            vec![
                call_tools(&[
                    ("get_weather", "{}"),
                    ("stock_quote", r#"{"symbol": "AAPL"}"#),
                ]),
                answer("Apple is at 189.5."),
            ],
            Services {
                markets: Arc::new(FixedQuote),
                ..offline_services()
            },
        );
        let mut ctx = context();

        let outcome = engine.run(&mut ctx, turn("weather and apple")).await.unwrap();
        assert_eq!(outcome.terminal, Terminal::Answered);
        assert_eq!(outcome.completion_calls, 2);
        assert_eq!(outcome.tools_called, vec!["stock_quote".to_string()]);

        // Second call sees the assistant turn plus one result per call
        let second = &completions.seen()[1].messages;
        let results: Vec<_> = second
            .iter()
            .filter_map(|m| match m {
                CompletionMessage::Tool { call_id, content } => Some((call_id.as_str(), content.as_str())),
                _ => None,
            })
            .collect();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, "call_0_get_weather");
        assert!(results[0].1.contains("error"));
        assert!(results[1].1.contains("189.5"));
    }

    /// Providers that only return once both have been entered.
    struct Rendezvous(Arc<tokio::sync::Barrier>);

    impl Rendezvous {
        async fn meet(&self) -> ProviderResult<()> {
            // ---
            tokio::time::timeout(std::time::Duration::from_secs(2), self.0.wait())
                .await
                .map(|_| ())
                .map_err(|_| crate::services::ProviderError::Unavailable("other call never started".to_string()))
        }
    }

    #[async_trait::async_trait]
    impl crate::services::weather::Weather for Rendezvous {
        async fn report(&self, _: f64, _: f64) -> ProviderResult<crate::services::weather::WeatherReport> {
            // ---
            self.meet().await?;
            Ok(crate::services::weather::WeatherReport {
                low: 50.0,
                high: 68.0,
                prob_of_precip: 0.1,
                sunrise: chrono::DateTime::<Utc>::UNIX_EPOCH,
                sunset: chrono::DateTime::<Utc>::UNIX_EPOCH,
                current_temp: 61.0,
                current_humidity: 40.0,
                current_uvi: 3.0,
                current_wind_speed: 5.0,
                current_conditions: Some("clear sky".to_string()),
            })
        }
    }

    #[async_trait::async_trait]
    impl crate::services::markets::Markets for Rendezvous {
        async fn quote(&self, symbol: &str) -> ProviderResult<crate::services::markets::StockQuote> {
            // ---
            self.meet().await?;
            crate::services::markets::Markets::quote(&FixedQuote, symbol).await
        }
    }

    #[tokio::test]
    async fn tool_calls_in_one_batch_run_concurrently() {
        // ---
        let barrier = Arc::new(tokio::sync::Barrier::new(2));
        let (engine, completions) = engine(
            vec![
                call_tools(&[
                    ("get_weather", "{}"),
                    ("stock_quote", r#"{"symbol": "AAPL"}"#),
                ]),
                answer("Clear and 61, Apple at 189.5."),
            ],
            Services {
                weather: Arc::new(Rendezvous(barrier.clone())),
                markets: Arc::new(Rendezvous(barrier)),
                ..offline_services()
            },
        );
        let mut ctx = context();

        let outcome = engine.run(&mut ctx, turn("weather and apple")).await.unwrap();
        assert_eq!(
            outcome.tools_called,
            vec!["get_weather".to_string(), "stock_quote".to_string()]
        );

        // Run one after the other, the first call would time out at the barrier
        let second = &completions.seen()[1].messages;
        let results: Vec<&str> = second
            .iter()
            .filter_map(|m| match m {
                CompletionMessage::Tool { content, .. } => Some(content.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| !r.contains("error")), "{results:?}");
        assert!(results[0].contains("clear sky"));
        assert!(results[1].contains("189.5"));
    }

    #[tokio::test]
    async fn bad_arguments_and_unknown_tools_are_fed_back() {
        // ---
        let (engine, completions) = engine(
            vec![
                call_tools(&[("stock_quote", r#"{"sym": 1}"#), ("launch_rocket", "{}")]),
                answer("Sorry."),
            ],
            offline_services(),
        );
        let mut ctx = context();

        let outcome = engine.run(&mut ctx, turn("do things")).await.unwrap();
        assert_eq!(outcome.answer, "Sorry.");
        assert!(outcome.tools_called.is_empty());

        let second = &completions.seen()[1].messages;
        let errors: Vec<_> = second
            .iter()
            .filter_map(|m| match m {
                CompletionMessage::Tool { content, .. } => Some(content.clone()),
                _ => None,
            })
            .collect();
        assert!(errors[0].contains("invalid arguments"));
        assert!(errors[1].contains("launch_rocket"));
    }

    #[tokio::test]
    async fn once_only_tools_are_withdrawn_after_success() {
        // ---
        let (engine, completions) = engine(
            vec![
                call_tools(&[
                    ("play_music", r#"{"query": "abba"}"#),
                    ("play_music", r#"{"query": "queen"}"#),
                ]),
                answer("Playing Dancing Queen by ABBA"),
            ],
            Services {
                music: Arc::new(FixedSong),
                ..offline_services()
            },
        );
        let mut ctx = context();

        let outcome = engine.run(&mut ctx, turn("play abba")).await.unwrap();
        assert_eq!(outcome.tools_called, vec!["play_music".to_string()]);
        assert_eq!(outcome.effects.len(), 1);

        let seen = completions.seen();
        assert!(seen[0].tools.contains(&"play_music"));
        assert!(!seen[1].tools.contains(&"play_music"));
        assert_eq!(seen[1].tools.len(), seen[0].tools.len() - 1);
    }

    #[tokio::test]
    async fn toggle_wifi_updates_the_session_settings() {
        // ---
        let (engine, _) = engine(
            vec![
                call_tools(&[("toggle_wifi", r#"{"transformation": "off"}"#)]),
                answer("WiFi turned off"),
            ],
            offline_services(),
        );
        let mut ctx = context();
        ctx.settings.enable_wifi = true;

        engine.run(&mut ctx, turn("turn off wifi")).await.unwrap();
        assert!(!ctx.settings.enable_wifi);
    }

    #[tokio::test]
    async fn vision_turn_uses_the_vision_model_and_prompt() {
        // ---
        let (engine, completions) = engine(vec![answer("A cat.")], offline_services());
        let mut ctx = context();
        ctx.settings.llm_name = "llama-3.3-70b".to_string();
        ctx.settings.vision_llm_name = "llama-3.3-70b".to_string();
        ctx.settings.vision_llm_prompt = "Describe what you see.".to_string();

        engine
            .run(
                &mut ctx,
                UserTurn {
                    text: "what is this".to_string(),
                    image: Some(Bytes::from_static(b"jpeg")),
                },
            )
            .await
            .unwrap();

        // The configured model cannot see, so the default vision model is used
        let seen = completions.seen();
        assert_eq!(seen[0].model, "gpt-4o");
        assert_eq!(seen[0].messages[0], CompletionMessage::system("Describe what you see."));
    }

    #[tokio::test]
    async fn empty_answer_gets_a_canned_reply() {
        // ---
        let (engine, _) = engine(vec![answer("  ")], offline_services());
        let outcome = engine.run(&mut context(), turn("hello")).await.unwrap();
        assert_eq!(outcome.answer, EMPTY_ANSWER);
    }

    #[tokio::test]
    async fn completion_failure_aborts() {
        // ---
        let engine = Engine::new(
            offline_services(),
            Repositories::in_memory(),
            Arc::new(BroadcastSync::new(4)),
            5,
        );
        assert!(engine.run(&mut context(), turn("hello")).await.is_err());
    }
}
