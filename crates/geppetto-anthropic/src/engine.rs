//! The Messages engine.

use std::sync::Arc;
use std::time::Instant;

use geppetto::engine::{Engine, InferenceConfig, StepSettings};
use geppetto::events::{Event, EventDispatcher, EventMetadata, EventSink, StepMetadata};
use geppetto::turns::{Block, Turn, keys, meta, turn_meta};
use geppetto::{GeppettoError, InferenceContext};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::client::{HttpClient, StreamEnd, read_frames};
use crate::config::AnthropicConfig;
use crate::convert;
use crate::merger::ContentBlockMerger;
use crate::types::{Content, MessageResponse, StreamEvent};

/// Streams Turns through `POST /v1/messages`.
///
/// Serves the `claude` API type. Every inference publishes exactly one
/// `start`, a `partial_completion` per text delta, a `tool_call` per
/// `tool_use` block and `final`; a cancelled context yields `interrupt`.
/// A response that mixes tool calls with text or thinking keeps the
/// provider's content array on the output block so the next request can
/// replay it verbatim.
///
/// ```rust,no_run
/// use geppetto::{Block, Engine, InferenceContext, Turn};
/// use geppetto::engine::StepSettings;
/// use geppetto_anthropic::{AnthropicConfig, AnthropicEngine};
///
/// # async fn example() -> Result<(), geppetto::GeppettoError> {
/// let engine = AnthropicEngine::new(
///     AnthropicConfig {
///         api_key: std::env::var("ANTHROPIC_API_KEY").unwrap_or_default(),
///         model: "claude-3-5-haiku-latest".into(),
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
pub struct AnthropicEngine {
    http: HttpClient,
    settings: StepSettings,
    defaults: Option<InferenceConfig>,
    dispatcher: EventDispatcher,
    tool_argument_deltas: bool,
}

impl AnthropicEngine {
    /// An engine for `config`; sampling defaults come from `settings`.
    pub fn new(config: AnthropicConfig, settings: StepSettings) -> Result<Self, GeppettoError> {
        Ok(Self {
            http: HttpClient::new(config)?,
            settings,
            defaults: None,
            dispatcher: EventDispatcher::default(),
            tool_argument_deltas: false,
        })
    }

    /// Resolves the connection from `settings` and builds the engine.
    pub fn from_settings(settings: &StepSettings) -> Result<Self, GeppettoError> {
        Self::new(AnthropicConfig::from_settings(settings)?, settings.clone())
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

    /// Publish `info` events for tool-argument fragments while they
    /// stream. Off by default.
    #[must_use]
    pub fn with_tool_argument_deltas(mut self, enabled: bool) -> Self {
        self.tool_argument_deltas = enabled;
        self
    }

    /// The configured model.
    pub fn model(&self) -> &str {
        &self.http.config.model
    }

    fn publish(&self, ctx: &InferenceContext, event: Event) {
        self.dispatcher
            .publish(ctx, &event.with_step(StepMetadata::chat("claude-messages")));
    }

    /// Publishes `error` (after a fallback `start` when the stream never
    /// got that far) and returns `err`.
    fn fail(
        &self,
        ctx: &InferenceContext,
        merger: &ContentBlockMerger,
        started: Instant,
        err: GeppettoError,
    ) -> Result<Turn, GeppettoError> {
        let mut meta = merger.metadata().fresh();
        meta.duration_ms = Some(elapsed_ms(started));
        if !merger.has_started() {
            self.publish(ctx, Event::start(meta.fresh()));
        }
        self.publish(ctx, Event::error(&err, meta));
        Err(err)
    }
}

impl Engine for AnthropicEngine {
    #[instrument(skip_all, fields(model = %self.http.config.model))]
    async fn run_inference(
        &self,
        ctx: &InferenceContext,
        mut turn: Turn,
    ) -> Result<Turn, GeppettoError> {
        let started = Instant::now();
        let request = convert::build_request(
            &turn,
            &self.http.config,
            &self.settings,
            self.defaults.as_ref(),
        )?;
        debug!(
            messages = request.messages.len(),
            tools = request.tools.len(),
            system = request.system.is_some(),
            "messages request"
        );

        let mut meta = EventMetadata::for_turn(&turn);
        meta.engine = Some(self.model().to_string());
        meta.temperature = request.temperature;
        meta.top_p = request.top_p;
        meta.max_tokens = Some(request.max_tokens);
        meta.extra
            .insert("settings".into(), Value::Object(self.settings.metadata()));
        let mut merger =
            ContentBlockMerger::new(meta).with_tool_argument_deltas(self.tool_argument_deltas);

        let response = match self.http.post_messages(&request).await {
            Ok(response) => response,
            Err(e) => return self.fail(ctx, &merger, started, e),
        };

        let outcome = read_frames(ctx, response, |frame| {
            if frame.is_done() {
                return Ok(false);
            }
            if frame.data.trim().is_empty() {
                return Ok(true);
            }
            let event: StreamEvent =
                serde_json::from_str(&frame.data).map_err(|e| GeppettoError::ResponseFormat {
                    message: format!("Failed to parse Anthropic stream event: {e}"),
                    raw: frame.data.clone(),
                })?;
            for event in merger.add(event)? {
                self.publish(ctx, event);
            }
            Ok(!merger.is_finished())
        })
        .await;

        match outcome {
            Err(e) => self.fail(ctx, &merger, started, e),
            Ok(StreamEnd::Cancelled) => {
                let mut meta = merger.metadata().fresh();
                meta.duration_ms = Some(elapsed_ms(started));
                if !merger.has_started() {
                    self.publish(ctx, Event::start(meta.fresh()));
                }
                self.publish(ctx, Event::interrupt(merger.text(), meta));
                Err(GeppettoError::Cancelled)
            }
            Ok(StreamEnd::Completed) => {
                if let Some(error) = merger.error() {
                    // The merger already published the error event.
                    return Err(GeppettoError::Provider {
                        code: error.error_type.clone(),
                        message: error.message.clone(),
                        retryable: error.error_type == "overloaded_error",
                    });
                }
                if !merger.is_finished() {
                    match merger.finish_truncated() {
                        Ok(event) => self.publish(ctx, event),
                        Err(e) => return self.fail(ctx, &merger, started, e),
                    }
                }

                let response = merger.response();
                debug!(
                    blocks = response.content.len(),
                    stop_reason = ?response.stop_reason,
                    "stream finished"
                );
                turn.append_blocks(output_blocks(&response)?);

                turn.set_metadata(turn_meta::PROVIDER, "claude");
                turn.set_metadata(
                    turn_meta::MODEL,
                    if response.model.is_empty() {
                        self.model().to_string()
                    } else {
                        response.model.clone()
                    },
                );
                if let Some(reason) = &response.stop_reason {
                    turn.set_metadata(turn_meta::STOP_REASON, reason.clone());
                }
                if let Some(usage) = &merger.metadata().usage {
                    turn.set_metadata(turn_meta::USAGE, serde_json::to_value(usage).unwrap_or_default());
                }
                Ok(turn)
            }
        }
    }
}

/// The blocks for a finished response, in content order: the assistant
/// text at the position of its first part, and one `tool_call` per
/// `tool_use`.
///
/// Consecutive thinking parts fold into one reasoning block placed right
/// before the block that follows them. Reasoning with nothing after it
/// folds in ahead of the last output block.
///
/// Mixed responses carry the full content array under
/// `claude_original_content` on the text block, or on the first block
/// when there is no text.
fn output_blocks(response: &MessageResponse) -> Result<Vec<Block>, GeppettoError> {
    let text = response.full_text();
    let mut text_block = (!text.is_empty()).then(|| Block::assistant_text(text));
    let has_text = text_block.is_some();

    let mut blocks: Vec<Block> = Vec::new();
    let mut pending: Option<Block> = None;
    for content in &response.content {
        let (thought, encrypted) = match content {
            Content::Thinking(thinking) => (thinking.thinking.as_str(), thinking.signature.as_str()),
            Content::RedactedThinking(redacted) => ("", redacted.data.as_str()),
            Content::Text(_) => {
                if let Some(block) = text_block.take() {
                    blocks.extend(pending.take());
                    blocks.push(block);
                }
                continue;
            }
            Content::ToolUse(call) => {
                blocks.extend(pending.take());
                blocks.push(Block::tool_call(call.id.clone(), call.name.clone(), call.input.clone()));
                continue;
            }
            Content::Image(_) | Content::ToolResult(_) => continue,
        };
        let block = pending.get_or_insert_with(|| Block::reasoning(response.id.clone(), None));
        fold_thinking(block, thought, encrypted);
    }

    if let Some(trailing) = pending {
        match blocks.len().checked_sub(1) {
            Some(last) if last > 0 && blocks[last - 1].kind == geppetto::BlockKind::Reasoning => {
                let earlier = &mut blocks[last - 1];
                let thought = trailing.text().unwrap_or_default();
                let encrypted = trailing.payload_str(keys::ENCRYPTED_CONTENT).unwrap_or_default();
                fold_thinking(earlier, thought, encrypted);
            }
            Some(last) => blocks.insert(last, trailing),
            None => blocks.push(trailing),
        }
    }

    if response.has_mixed_content() {
        let original = serde_json::to_value(&response.content).map_err(|e| {
            GeppettoError::ResponseFormat {
                message: format!("failed to serialize content: {e}"),
                raw: String::new(),
            }
        })?;
        let target = if has_text {
            blocks.iter_mut().find(|b| b.kind == geppetto::BlockKind::LlmText)
        } else {
            blocks.first_mut()
        };
        match target {
            Some(block) => block.set_metadata(meta::CLAUDE_ORIGINAL_CONTENT, original),
            None => warn!("mixed content without an output block"),
        }
    }
    Ok(blocks)
}

/// Appends one thinking part to a reasoning block. The latest signature
/// wins.
fn fold_thinking(block: &mut Block, thought: &str, encrypted: &str) {
    if !thought.is_empty() {
        let text = match block.text() {
            Some(prev) if !prev.is_empty() => format!("{prev}\n{thought}"),
            _ => thought.to_string(),
        };
        block.payload.insert(keys::TEXT.into(), Value::String(text));
    }
    if !encrypted.is_empty() {
        block
            .payload
            .insert(keys::ENCRYPTED_CONTENT.into(), Value::String(encrypted.to_string()));
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
