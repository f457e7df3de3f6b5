//! Messages stream reduction.
//!
//! [`ContentBlockMerger`] consumes decoded stream events in order and
//! turns them into normalized [`Event`]s while rebuilding the complete
//! [`MessageResponse`]. It owns the `start` and `final` events of a
//! well-formed stream; everything out of protocol order is a
//! [`GeppettoError::ProtocolViolation`].

use std::collections::BTreeMap;
use std::time::Instant;

use geppetto::GeppettoError;
use geppetto::events::{Event, EventMetadata, ToolCallPayload, Usage};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::types::{
    ApiError, Content, MessageResponse, MessageUsage, RedactedThinkingContent, StreamContentBlock,
    StreamDelta, StreamEvent, TextContent, ThinkingContent, ToolUseContent,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MergerState {
    Idle,
    MessageOpen,
    Finished,
}

/// A content block under construction.
#[derive(Debug)]
enum Slot {
    Text(String),
    ToolUse { id: String, name: String, input: String },
    Thinking { thinking: String, signature: String },
    RedactedThinking(String),
}

impl Slot {
    fn open(block: &StreamContentBlock) -> Result<Self, GeppettoError> {
        match block.block_type.as_str() {
            "text" => Ok(Self::Text(block.text.clone().unwrap_or_default())),
            "tool_use" => {
                let id = block.id.clone().filter(|id| !id.is_empty()).ok_or_else(|| {
                    GeppettoError::ProtocolViolation("tool_use block without an id".into())
                })?;
                Ok(Self::ToolUse {
                    id,
                    name: block.name.clone().unwrap_or_default(),
                    input: String::new(),
                })
            }
            "thinking" => Ok(Self::Thinking {
                thinking: block.thinking.clone().unwrap_or_default(),
                signature: String::new(),
            }),
            "redacted_thinking" => Ok(Self::RedactedThinking(block.data.clone().unwrap_or_default())),
            other => Err(GeppettoError::UnknownContentType(other.to_string())),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::ToolUse { .. } => "tool_use",
            Self::Thinking { .. } => "thinking",
            Self::RedactedThinking(_) => "redacted_thinking",
        }
    }

    fn to_content(&self) -> Content {
        match self {
            Self::Text(text) => Content::Text(TextContent { text: text.clone() }),
            Self::ToolUse { id, name, input } => Content::ToolUse(ToolUseContent {
                id: id.clone(),
                name: name.clone(),
                input: parse_input(input),
            }),
            Self::Thinking { thinking, signature } => Content::Thinking(ThinkingContent {
                thinking: thinking.clone(),
                signature: signature.clone(),
            }),
            Self::RedactedThinking(data) => {
                Content::RedactedThinking(RedactedThinkingContent { data: data.clone() })
            }
        }
    }
}

/// Accumulated tool input as a JSON value. Empty input is `{}`; input
/// that does not parse is kept as a string.
fn parse_input(input: &str) -> Value {
    if input.trim().is_empty() {
        return Value::Object(serde_json::Map::new());
    }
    serde_json::from_str(input).unwrap_or_else(|_| Value::String(input.to_string()))
}

#[derive(Debug)]
struct IndexedSlot {
    slot: Slot,
    closed: bool,
}

/// Reassembles a streamed Messages response and emits events for it.
///
/// Event order for a well-formed stream is `start`, then
/// `partial_completion` for every text delta (plus one with an empty
/// delta when a text block or the message delta arrives), a
/// `tool_call` per closed `tool_use` block, and `final` on
/// `message_stop`. The `final` text is the concatenation of all text
/// blocks in index order, and equals the concatenation of the deltas.
///
/// ```rust
/// use geppetto::events::EventMetadata;
/// use geppetto_anthropic::{ContentBlockMerger, StreamEvent};
/// use serde_json::json;
///
/// let mut merger = ContentBlockMerger::new(EventMetadata::default());
/// let events = [
///     json!({"type": "message_start", "message": {"id": "msg_1", "model": "claude", "usage": {"input_tokens": 10}}}),
///     json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}}),
///     json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "Hi"}}),
///     json!({"type": "content_block_stop", "index": 0}),
///     json!({"type": "message_stop"}),
/// ];
/// for raw in events {
///     let event: StreamEvent = serde_json::from_value(raw).unwrap();
///     merger.add(event).unwrap();
/// }
/// assert!(merger.is_finished());
/// assert_eq!(merger.text(), "Hi");
/// assert_eq!(merger.metadata().usage.unwrap().input_tokens, 10);
/// ```
#[derive(Debug)]
pub struct ContentBlockMerger {
    meta: EventMetadata,
    state: MergerState,
    response: MessageResponse,
    slots: BTreeMap<u32, IndexedSlot>,
    latched_input_tokens: u64,
    error: Option<ApiError>,
    emit_tool_argument_deltas: bool,
    started: Instant,
}

impl ContentBlockMerger {
    /// A merger that stamps its events with copies of `meta`.
    pub fn new(meta: EventMetadata) -> Self {
        Self {
            meta,
            state: MergerState::Idle,
            response: MessageResponse::default(),
            slots: BTreeMap::new(),
            latched_input_tokens: 0,
            error: None,
            emit_tool_argument_deltas: false,
            started: Instant::now(),
        }
    }

    /// Also emit an `info` event (`tool-arguments-delta`) for every
    /// tool-argument fragment.
    #[must_use]
    pub fn with_tool_argument_deltas(mut self, enabled: bool) -> Self {
        self.emit_tool_argument_deltas = enabled;
        self
    }

    /// Absorbs one stream event and returns the events it produced.
    ///
    /// # Errors
    ///
    /// [`GeppettoError::ProtocolViolation`] for events out of order,
    /// unknown event types, duplicate or unknown block indices, and
    /// deltas that do not match their block;
    /// [`GeppettoError::UnknownContentType`] for an unknown block type.
    pub fn add(&mut self, mut event: StreamEvent) -> Result<Vec<Event>, GeppettoError> {
        let kind = std::mem::take(&mut event.event_type);
        match kind.as_str() {
            "ping" => Ok(Vec::new()),
            "message_start" => self.message_start(event),
            "message_delta" => self.message_delta(event),
            "message_stop" => self.message_stop(),
            "content_block_start" => self.block_start(event),
            "content_block_delta" => self.block_delta(event),
            "content_block_stop" => self.block_stop(event),
            "error" => Ok(self.stream_error(event)),
            other => Err(GeppettoError::ProtocolViolation(format!(
                "unknown stream event type {other:?}"
            ))),
        }
    }

    /// Text of all text blocks so far, in index order.
    pub fn text(&self) -> String {
        self.slots
            .values()
            .filter_map(|s| match &s.slot {
                Slot::Text(text) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    /// The message as rebuilt so far: envelope fields from the message
    /// events plus every closed content block in index order.
    pub fn response(&self) -> MessageResponse {
        let mut response = self.response.clone();
        response.content = self
            .slots
            .values()
            .filter(|s| s.closed)
            .map(|s| s.slot.to_content())
            .collect();
        response
    }

    /// The in-stream error, if one arrived.
    pub fn error(&self) -> Option<&ApiError> {
        self.error.as_ref()
    }

    /// The running metadata (usage, stop reason, duration, extras).
    pub fn metadata(&self) -> &EventMetadata {
        &self.meta
    }

    /// Whether `message_start` has been seen.
    pub fn has_started(&self) -> bool {
        self.state != MergerState::Idle
    }

    /// Whether `message_stop` or an error ended the stream.
    pub fn is_finished(&self) -> bool {
        self.state == MergerState::Finished
    }

    /// Closes the stream without `message_stop` and returns the `final`
    /// event, provided `message_start` was seen.
    ///
    /// # Errors
    ///
    /// [`GeppettoError::ProtocolViolation`] when the stream never
    /// started.
    pub fn finish_truncated(&mut self) -> Result<Event, GeppettoError> {
        if self.state == MergerState::Idle {
            return Err(GeppettoError::ProtocolViolation(
                "stream ended before message_start".into(),
            ));
        }
        warn!("stream ended without message_stop");
        Ok(self.message_stop_unchecked())
    }

    fn require_open(&self, event: &str) -> Result<(), GeppettoError> {
        match self.state {
            MergerState::MessageOpen => Ok(()),
            MergerState::Idle => Err(GeppettoError::ProtocolViolation(format!(
                "{event} before message_start"
            ))),
            MergerState::Finished => Err(GeppettoError::ProtocolViolation(format!(
                "{event} after the message finished"
            ))),
        }
    }

    fn message_start(&mut self, event: StreamEvent) -> Result<Vec<Event>, GeppettoError> {
        if self.state != MergerState::Idle {
            return Err(GeppettoError::ProtocolViolation("duplicate message_start".into()));
        }
        let message = event.message.ok_or_else(|| {
            GeppettoError::ProtocolViolation("message_start without a message".into())
        })?;

        self.meta.extra.insert("claude_model".into(), message.model.clone().into());
        self.meta.extra.insert("claude_message_id".into(), message.id.clone().into());
        self.meta.extra.insert("claude_role".into(), message.role.clone().into());
        self.response = MessageResponse {
            content: Vec::new(),
            ..message
        };
        self.update_usage(self.response.usage);
        self.state = MergerState::MessageOpen;
        debug!(message_id = %self.response.id, "message started");
        Ok(vec![Event::start(self.meta.fresh())])
    }

    fn message_delta(&mut self, event: StreamEvent) -> Result<Vec<Event>, GeppettoError> {
        self.require_open("message_delta")?;
        let delta = event.delta.ok_or_else(|| {
            GeppettoError::ProtocolViolation("message_delta without a delta".into())
        })?;

        if let Some(reason) = delta.stop_reason {
            self.meta.extra.insert("claude_stop_reason".into(), reason.clone().into());
            self.meta.stop_reason = Some(reason.clone());
            self.response.stop_reason = Some(reason);
        }
        if let Some(sequence) = delta.stop_sequence {
            self.meta
                .extra
                .insert("claude_stop_sequence".into(), sequence.clone().into());
            self.response.stop_sequence = Some(sequence);
        }
        if let Some(usage) = event.usage {
            self.update_usage(usage);
        }
        Ok(vec![Event::partial("", self.text(), self.meta.fresh())])
    }

    fn message_stop(&mut self) -> Result<Vec<Event>, GeppettoError> {
        self.require_open("message_stop")?;
        Ok(vec![self.message_stop_unchecked()])
    }

    fn message_stop_unchecked(&mut self) -> Event {
        let open: Vec<u32> = self
            .slots
            .iter()
            .filter(|(_, s)| !s.closed)
            .map(|(i, _)| *i)
            .collect();
        if !open.is_empty() {
            warn!(?open, "message finished with unclosed content blocks");
        }
        self.state = MergerState::Finished;
        self.meta.duration_ms = Some(self.elapsed_ms());
        Event::final_text(self.text(), self.meta.fresh())
    }

    fn block_start(&mut self, event: StreamEvent) -> Result<Vec<Event>, GeppettoError> {
        self.require_open("content_block_start")?;
        let index = require_index(&event, "content_block_start")?;
        if self.slots.contains_key(&index) {
            return Err(GeppettoError::ProtocolViolation(format!(
                "duplicate content block index {index}"
            )));
        }
        let block = event.content_block.ok_or_else(|| {
            GeppettoError::ProtocolViolation(
                "content_block_start without a content_block".into(),
            )
        })?;
        let slot = Slot::open(&block)?;

        let initial = match &slot {
            Slot::Text(text) if !text.is_empty() => Some(text.clone()),
            _ => None,
        };
        self.slots.insert(index, IndexedSlot { slot, closed: false });

        Ok(initial
            .map(|text| Event::partial(text, self.text(), self.meta.fresh()))
            .into_iter()
            .collect())
    }

    fn block_delta(&mut self, event: StreamEvent) -> Result<Vec<Event>, GeppettoError> {
        self.require_open("content_block_delta")?;
        let index = require_index(&event, "content_block_delta")?;
        let delta = event.delta.ok_or_else(|| {
            GeppettoError::ProtocolViolation("content_block_delta without a delta".into())
        })?;
        let emit_args = self.emit_tool_argument_deltas;
        let entry = self.open_slot(index)?;

        match (&mut entry.slot, delta.delta_type.as_deref()) {
            (Slot::Text(text), Some("text_delta")) => {
                let fragment = delta.text.unwrap_or_default();
                text.push_str(&fragment);
                Ok(vec![Event::partial(fragment, self.text(), self.meta.fresh())])
            }
            (Slot::ToolUse { id, name, input }, Some("input_json_delta")) => {
                let fragment = delta.partial_json.unwrap_or_default();
                input.push_str(&fragment);
                if !emit_args {
                    return Ok(Vec::new());
                }
                let data = json!({
                    "index": index,
                    "id": id,
                    "name": name,
                    "delta": fragment,
                });
                let Value::Object(data) = data else {
                    return Ok(Vec::new());
                };
                Ok(vec![Event::info("tool-arguments-delta", data, self.meta.fresh())])
            }
            (Slot::Thinking { thinking, .. }, Some("thinking_delta")) => {
                thinking.push_str(delta.thinking.as_deref().unwrap_or_default());
                Ok(Vec::new())
            }
            (Slot::Thinking { signature, .. }, Some("signature_delta")) => {
                signature.push_str(delta.signature.as_deref().unwrap_or_default());
                Ok(Vec::new())
            }
            (slot, kind) => Err(mismatched_delta(index, slot, kind, &delta)),
        }
    }

    fn block_stop(&mut self, event: StreamEvent) -> Result<Vec<Event>, GeppettoError> {
        self.require_open("content_block_stop")?;
        let index = require_index(&event, "content_block_stop")?;
        let entry = self.open_slot(index)?;
        entry.closed = true;

        match &entry.slot {
            Slot::Text(_) => Ok(vec![Event::partial("", self.text(), self.meta.fresh())]),
            Slot::ToolUse { id, name, input } => {
                let input = if input.trim().is_empty() {
                    "{}".to_string()
                } else {
                    input.clone()
                };
                Ok(vec![Event::tool_call(
                    ToolCallPayload {
                        id: id.clone(),
                        name: name.clone(),
                        input,
                    },
                    self.meta.fresh(),
                )])
            }
            Slot::Thinking { .. } | Slot::RedactedThinking(_) => Ok(Vec::new()),
        }
    }

    fn stream_error(&mut self, event: StreamEvent) -> Vec<Event> {
        let error = event.error.unwrap_or_else(|| ApiError {
            error_type: "error".into(),
            message: "stream error without details".into(),
        });
        warn!(error_type = %error.error_type, message = %error.message, "error event in stream");
        self.meta.duration_ms = Some(self.elapsed_ms());
        self.state = MergerState::Finished;
        let event = Event::error(
            format!("{}: {}", error.error_type, error.message),
            self.meta.fresh(),
        );
        self.error = Some(error);
        vec![event]
    }

    fn open_slot(&mut self, index: u32) -> Result<&mut IndexedSlot, GeppettoError> {
        match self.slots.get_mut(&index) {
            Some(entry) if !entry.closed => Ok(entry),
            Some(_) => Err(GeppettoError::ProtocolViolation(format!(
                "content block {index} is already closed"
            ))),
            None => Err(GeppettoError::ProtocolViolation(format!(
                "unknown content block index {index}"
            ))),
        }
    }

    /// `message_delta` usually reports `input_tokens: 0`; the first
    /// non-zero input count is kept for the rest of the stream.
    fn update_usage(&mut self, usage: MessageUsage) {
        if self.latched_input_tokens == 0 && usage.input_tokens > 0 {
            self.latched_input_tokens = usage.input_tokens;
        }
        let previous = self.response.usage;
        let merged = MessageUsage {
            input_tokens: if usage.input_tokens > 0 {
                usage.input_tokens
            } else {
                self.latched_input_tokens
            },
            output_tokens: usage.output_tokens,
            cache_creation_input_tokens: usage
                .cache_creation_input_tokens
                .or(previous.cache_creation_input_tokens),
            cache_read_input_tokens: usage
                .cache_read_input_tokens
                .or(previous.cache_read_input_tokens),
        };
        self.response.usage = merged;
        self.meta.usage = Some(Usage {
            input_tokens: merged.input_tokens,
            output_tokens: merged.output_tokens,
            cached_tokens: None,
            cache_creation_input_tokens: merged.cache_creation_input_tokens,
            cache_read_input_tokens: merged.cache_read_input_tokens,
        });
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

fn require_index(event: &StreamEvent, name: &str) -> Result<u32, GeppettoError> {
    event
        .index
        .ok_or_else(|| GeppettoError::ProtocolViolation(format!("{name} without an index")))
}

fn mismatched_delta(
    index: u32,
    slot: &Slot,
    kind: Option<&str>,
    delta: &StreamDelta,
) -> GeppettoError {
    debug!(?delta, "rejected delta");
    GeppettoError::ProtocolViolation(format!(
        "delta {} does not apply to {} block {index}",
        kind.unwrap_or("<missing type>"),
        slot.kind()
    ))
}
