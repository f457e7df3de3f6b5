//! The Chat Completions engine.

use std::sync::Arc;
use std::time::Instant;

use geppetto::engine::{Engine, InferenceConfig, StepSettings};
use geppetto::events::{
    Event, EventDispatcher, EventMetadata, EventSink, StepMetadata, ToolCallPayload,
};
use geppetto::turns::{Block, Turn, turn_meta};
use geppetto::{GeppettoError, InferenceContext};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::client::{HttpClient, StreamEnd, read_frames};
use crate::config::OpenAiConfig;
use crate::convert;
use crate::stream::{ChatStreamState, MergedToolCall};
use crate::types::StreamChunk;

/// Streams Turns through `POST /chat/completions`.
///
/// Serves `openai` and the OpenAI-compatible API types (`anyscale`,
/// `fireworks`). Every inference publishes `start`, one
/// `partial_completion` per text delta, a `tool_call` per assembled
/// call and `final`; a cancelled context yields `interrupt`.
///
/// ```rust,no_run
/// use geppetto::{Block, Engine, InferenceContext, Turn};
/// use geppetto::engine::StepSettings;
/// use geppetto_openai::{OpenAiConfig, OpenAiEngine};
///
/// # async fn example() -> Result<(), geppetto::GeppettoError> {
/// let engine = OpenAiEngine::new(
///     OpenAiConfig {
///         api_key: std::env::var("OPENAI_API_KEY").unwrap_or_default(),
///         model: "gpt-4o-mini".into(),
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
pub struct OpenAiEngine {
    http: HttpClient,
    settings: StepSettings,
    defaults: Option<InferenceConfig>,
    dispatcher: EventDispatcher,
}

impl OpenAiEngine {
    /// An engine for `config`; sampling defaults come from `settings`.
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
            .publish(ctx, &event.with_step(StepMetadata::chat("openai-chat")));
    }
}

impl Engine for OpenAiEngine {
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

        let unanswered = convert::unanswered_tool_calls(&request.messages);
        if !unanswered.is_empty() {
            warn!(?unanswered, "sending tool calls without matching results");
        }
        debug!(
            messages = request.messages.len(),
            tools = request.tools.len(),
            "chat completions request"
        );

        let mut meta = EventMetadata::for_turn(&turn);
        meta.engine = Some(self.model().to_string());
        meta.temperature = request.temperature;
        meta.top_p = request.top_p;
        meta.max_tokens = request.max_tokens.or(request.max_completion_tokens);
        meta.extra
            .insert("settings".into(), Value::Object(self.settings.metadata()));
        self.publish(ctx, Event::start(meta.fresh()));

        let response = match self.http.post("chat/completions", &request).await {
            Ok(response) => response,
            Err(e) => {
                meta.duration_ms = Some(elapsed_ms(started));
                self.publish(ctx, Event::error(&e, meta.fresh()));
                return Err(e);
            }
        };

        let mut state = ChatStreamState::default();
        let outcome = read_frames(ctx, response, |frame| {
            if frame.is_done() {
                return Ok(false);
            }
            let chunk: StreamChunk =
                serde_json::from_str(&frame.data).map_err(|e| GeppettoError::ResponseFormat {
                    message: format!("Failed to parse OpenAI stream chunk: {e}"),
                    raw: frame.data.clone(),
                })?;
            if let Some(delta) = state.absorb(chunk)? {
                self.publish(ctx, Event::partial(delta, state.text.clone(), meta.fresh()));
            }
            Ok(true)
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
                let calls: Vec<Block> = state
                    .tool_calls
                    .tool_calls()
                    .into_iter()
                    .map(tool_call_block)
                    .collect();
                for call in &calls {
                    self.publish(
                        ctx,
                        Event::tool_call(
                            ToolCallPayload {
                                id: call.call_id().unwrap_or_default().to_string(),
                                name: call.tool_name().unwrap_or_default().to_string(),
                                input: call.args_json(),
                            },
                            meta.fresh(),
                        ),
                    );
                }

                if !state.text.is_empty() {
                    turn.append_block(Block::assistant_text(state.text.clone()));
                }
                turn.append_blocks(calls);

                turn.set_metadata(turn_meta::PROVIDER, "openai");
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

/// A `tool_call` block for `call`. Argument text that is not valid JSON
/// is kept verbatim as a string; a call without an id gets a generated
/// one so results can still be correlated.
fn tool_call_block(call: MergedToolCall) -> Block {
    let id = if call.id.is_empty() {
        format!("call_{}", uuid::Uuid::new_v4().simple())
    } else {
        call.id
    };
    let args = if call.arguments.trim().is_empty() {
        Value::Object(serde_json::Map::new())
    } else {
        serde_json::from_str(&call.arguments).unwrap_or(Value::String(call.arguments))
    };
    Block::tool_call(id, call.name, args)
}

pub(crate) fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
