//! The Gemini engine.

use std::sync::Arc;
use std::time::Instant;

use geppetto::engine::{Engine, InferenceConfig, StepSettings};
use geppetto::events::{
    Event, EventDispatcher, EventMetadata, EventSink, StepMetadata, ToolCallPayload,
};
use geppetto::turns::{Block, Turn, turn_meta};
use geppetto::{GeppettoError, InferenceContext};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::client::{HttpClient, StreamEnd, read_frames};
use crate::config::GeminiConfig;
use crate::convert;
use crate::stream::GeminiStreamState;
use crate::types::StreamFrame;

/// Streams Turns through `models/{model}:streamGenerateContent`.
///
/// Publishes `start`, a `partial_completion` per text chunk, a
/// `tool_call` as soon as each function call arrives, and `final`.
/// Cancellation publishes `interrupt` with the text received so far.
///
/// ```rust,no_run
/// use geppetto::{Block, Engine, InferenceContext, Turn};
/// use geppetto::engine::StepSettings;
/// use geppetto_gemini::{GeminiConfig, GeminiEngine};
///
/// # async fn example() -> Result<(), geppetto::GeppettoError> {
/// let engine = GeminiEngine::new(
///     GeminiConfig {
///         api_key: std::env::var("GEMINI_API_KEY").unwrap_or_default(),
///         ..Default::default()
///     },
///     StepSettings::default(),
/// )?;
///
/// let turn = Turn::with_blocks([Block::user_text("Hello!")]);
/// let turn = engine.run_inference(&InferenceContext::new(), turn).await?;
/// println!("{}", turn.assistant_text());
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct GeminiEngine {
    http: HttpClient,
    settings: StepSettings,
    defaults: Option<InferenceConfig>,
    dispatcher: EventDispatcher,
}

impl GeminiEngine {
    /// An engine for `config`; sampling defaults come from `settings`.
    pub fn new(config: GeminiConfig, settings: StepSettings) -> Result<Self, GeppettoError> {
        Ok(Self {
            http: HttpClient::new(config)?,
            settings,
            defaults: None,
            dispatcher: EventDispatcher::default(),
        })
    }

    /// Resolves the connection from `settings` and builds the engine.
    pub fn from_settings(settings: &StepSettings) -> Result<Self, GeppettoError> {
        Self::new(GeminiConfig::from_settings(settings)?, settings.clone())
    }

    /// Adds a configured event sink.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.dispatcher.add_sink(sink);
        self
    }

    /// Engine-level inference defaults.
    #[must_use]
    pub fn with_inference_defaults(mut self, defaults: InferenceConfig) -> Self {
        self.defaults = Some(defaults);
        self
    }

    /// The configured model, without the `models/` prefix.
    pub fn model(&self) -> &str {
        self.http.config.model_name()
    }

    fn publish(&self, ctx: &InferenceContext, event: Event) {
        self.dispatcher
            .publish(ctx, &event.with_step(StepMetadata::chat("gemini-generate")));
    }
}

impl Engine for GeminiEngine {
    #[instrument(skip_all, fields(model = %self.model()))]
    async fn run_inference(
        &self,
        ctx: &InferenceContext,
        mut turn: Turn,
    ) -> Result<Turn, GeppettoError> {
        let started = Instant::now();
        let request = convert::build_request(&turn, &self.settings, self.defaults.as_ref())?;
        debug!(
            contents = request.contents.len(),
            tools = request.tools.first().map_or(0, |t| t.function_declarations.len()),
            "generateContent request"
        );

        let mut meta = EventMetadata::for_turn(&turn);
        meta.engine = Some(self.model().to_string());
        meta.temperature = request.generation_config.temperature;
        meta.top_p = request.generation_config.top_p;
        meta.max_tokens = request.generation_config.max_output_tokens;
        meta.extra
            .insert("settings".into(), Value::Object(self.settings.metadata()));
        self.publish(ctx, Event::start(meta.fresh()));

        let response = match self.http.post_stream(&request).await {
            Ok(response) => response,
            Err(e) => {
                meta.duration_ms = Some(elapsed_ms(started));
                self.publish(ctx, Event::error(&e, meta.fresh()));
                return Err(e);
            }
        };

        let mut state = GeminiStreamState::default();
        let outcome = read_frames(ctx, response, |frame| {
            if frame.is_done() || frame.data.trim().is_empty() {
                return Ok(());
            }
            let parsed: StreamFrame =
                serde_json::from_str(&frame.data).map_err(|e| GeppettoError::ResponseFormat {
                    message: format!("Failed to parse Gemini stream chunk: {e}"),
                    raw: frame.data.clone(),
                })?;
            let chunk = match parsed {
                StreamFrame::Chunk(chunk) => chunk,
                StreamFrame::Error { error } => {
                    return Err(GeppettoError::Provider {
                        retryable: error.is_retryable(),
                        code: if error.status.is_empty() {
                            error.code.to_string()
                        } else {
                            error.status
                        },
                        message: error.message,
                    });
                }
            };

            let update = state.absorb(chunk);
            if let Some(delta) = update.delta {
                self.publish(ctx, Event::partial(delta, state.text.clone(), meta.fresh()));
            }
            for call in update.calls {
                self.publish(
                    ctx,
                    Event::tool_call(
                        ToolCallPayload {
                            id: call.id,
                            name: call.name,
                            input: call.args.to_string(),
                        },
                        meta.fresh(),
                    ),
                );
            }
            Ok(())
        })
        .await;

        meta.duration_ms = Some(elapsed_ms(started));
        meta.usage = state.usage;
        meta.stop_reason.clone_from(&state.stop_reason);

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
                debug!(chunks = state.chunks, tool_calls = state.tool_calls.len(), "stream finished");
                if !state.text.is_empty() {
                    turn.append_block(Block::assistant_text(state.text.clone()));
                }
                turn.append_blocks(
                    state
                        .tool_calls
                        .drain(..)
                        .map(|call| Block::tool_call(call.id, call.name, call.args)),
                );

                turn.set_metadata(turn_meta::PROVIDER, "gemini");
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

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
