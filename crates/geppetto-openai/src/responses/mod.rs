//! The Responses API engine (`openai-responses`).
//!
//! Same connection settings as the Chat Completions engine, different
//! endpoint (`POST /responses`) and wire format. Reasoning models return
//! `reasoning` output items, which are kept as [`BlockKind::Reasoning`]
//! blocks carrying the encrypted content so later turns can replay them
//! without server-side state.
//!
//! [`BlockKind::Reasoning`]: geppetto::turns::BlockKind::Reasoning

mod convert;
mod stream;
mod types;

use std::sync::Arc;
use std::time::Instant;

use geppetto::engine::{Engine, InferenceConfig, StepSettings};
use geppetto::events::{Event, EventDispatcher, EventMetadata, EventSink, StepMetadata};
use geppetto::turns::{Payload, Turn, turn_meta};
use geppetto::{GeppettoError, InferenceContext};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::client::{HttpClient, StreamEnd, read_frames};
use crate::config::OpenAiConfig;
use crate::engine::elapsed_ms;
use stream::{ResponsesStreamState, ResponsesUpdate};

/// Streams Turns through `POST /responses`.
///
/// Publishes the same events as [`OpenAiEngine`](crate::OpenAiEngine),
/// plus `info` events marking reasoning and output items
/// (`thinking-started`, `thinking-ended`, `output-started`,
/// `output-ended`).
#[derive(Debug)]
pub struct OpenAiResponsesEngine {
    http: HttpClient,
    settings: StepSettings,
    defaults: Option<InferenceConfig>,
    dispatcher: EventDispatcher,
}

impl OpenAiResponsesEngine {
    /// An engine for `config`; request defaults come from `settings`.
    pub fn new(config: OpenAiConfig, settings: StepSettings) -> Result<Self, GeppettoError> {
        Ok(Self {
            http: HttpClient::new(config)?,
            settings,
            defaults: None,
            dispatcher: EventDispatcher::default(),
        })
    }

    /// Resolves the connection from `settings` and builds the engine.
    pub fn from_settings(settings: &StepSettings) -> Result<Self, GeppettoError> {
        Self::new(OpenAiConfig::from_settings(settings)?, settings.clone())
    }

    /// Adds a configured event sink.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.dispatcher.add_sink(sink);
        self
    }

    /// Engine-level inference defaults, applied beneath per-turn
    /// overrides.
    #[must_use]
    pub fn with_inference_defaults(mut self, defaults: InferenceConfig) -> Self {
        self.defaults = Some(defaults);
        self
    }

    /// The configured model.
    pub fn model(&self) -> &str {
        &self.http.config.model
    }

    fn publish(&self, ctx: &InferenceContext, event: Event) {
        self.dispatcher
            .publish(ctx, &event.with_step(StepMetadata::chat("openai-responses")));
    }
}

impl Engine for OpenAiResponsesEngine {
    #[instrument(skip_all, fields(model = %self.http.config.model))]
    async fn run_inference(
        &self,
        ctx: &InferenceContext,
        mut turn: Turn,
    ) -> Result<Turn, GeppettoError> {
        let started = Instant::now();
        let request = convert::build_request(
            &turn,
            self.model(),
            &self.settings,
            self.defaults.as_ref(),
        )?;
        debug!(
            input_items = request.input.len(),
            tools = request.tools.len(),
            include = request.include.len(),
            "responses request"
        );

        let mut meta = EventMetadata::for_turn(&turn);
        meta.engine = Some(self.model().to_string());
        meta.temperature = request.temperature;
        meta.top_p = request.top_p;
        meta.max_tokens = request.max_output_tokens;
        meta.extra
            .insert("settings".into(), Value::Object(self.settings.metadata()));
        self.publish(ctx, Event::start(meta.fresh()));

        let response = match self.http.post("responses", &request).await {
            Ok(response) => response,
            Err(e) => {
                meta.duration_ms = Some(elapsed_ms(started));
                self.publish(ctx, Event::error(&e, meta.fresh()));
                return Err(e);
            }
        };

        let mut state = ResponsesStreamState::default();
        let outcome = read_frames(ctx, response, |frame| {
            if frame.is_done() {
                return Ok(false);
            }
            let Some(name) = frame.event.as_deref() else {
                return Ok(true);
            };
            match state.absorb(name, &frame.data)? {
                Some(ResponsesUpdate::TextDelta(delta)) => {
                    self.publish(ctx, Event::partial(delta, state.text.clone(), meta.fresh()));
                }
                Some(ResponsesUpdate::Info(message)) => {
                    self.publish(ctx, Event::info(message, Payload::new(), meta.fresh()));
                }
                Some(ResponsesUpdate::ToolCall(call)) => {
                    self.publish(ctx, Event::tool_call(call, meta.fresh()));
                }
                None => {}
            }
            Ok(!state.completed)
        })
        .await;

        meta.duration_ms = Some(elapsed_ms(started));
        meta.usage = state.usage;
        meta.stop_reason.clone_from(&state.stop_reason);
        if let Some(tokens) = state.reasoning_tokens {
            meta.extra.insert("reasoning_tokens".into(), tokens.into());
        }

        match outcome {
            Err(e) => {
                self.publish(ctx, Event::error(&e, meta.fresh()));
                Err(e)
            }
            Ok(StreamEnd::Cancelled) => {
                self.publish(ctx, Event::interrupt(state.text.clone(), meta.fresh()));
                Err(GeppettoError::Cancelled)
            }
            Ok(StreamEnd::Completed) => {
                state.finish_blocks();
                debug!(blocks = state.blocks.len(), "responses stream finished");
                turn.append_blocks(std::mem::take(&mut state.blocks));

                turn.set_metadata(turn_meta::PROVIDER, "openai-responses");
                turn.set_metadata(
                    turn_meta::MODEL,
                    state.model.clone().unwrap_or_else(|| self.model().to_string()),
                );
                if let Some(reason) = &state.stop_reason {
                    turn.set_metadata(turn_meta::STOP_REASON, reason.clone());
                }
                if let Some(usage) = &state.usage {
                    turn.set_metadata(turn_meta::USAGE, serde_json::to_value(usage).unwrap_or_default());
                }

                self.publish(ctx, Event::final_text(state.text, meta.fresh()));
                Ok(turn)
            }
        }
    }
}
