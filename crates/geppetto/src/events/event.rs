//! Normalized inference events and their metadata envelope.

use serde::de::{self, Deserializer};
use serde::ser::{self, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::turns::{Payload, Turn, turn_meta};

// ── Metadata ────────────────────────────────────────────────────────

/// Token counts reported by a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Prompt tokens.
    pub input_tokens: u64,
    /// Completion tokens.
    pub output_tokens: u64,
    /// Prompt tokens served from the provider cache (OpenAI).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_tokens: Option<u64>,
    /// Tokens written to the prompt cache (Anthropic).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_creation_input_tokens: Option<u64>,
    /// Tokens read from the prompt cache (Anthropic).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_input_tokens: Option<u64>,
}

/// Provider-independent envelope attached to every event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Unique event/message id.
    pub id: Uuid,
    /// Run (session) id.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub run_id: String,
    /// Turn id.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub turn_id: String,
    /// Block the event belongs to, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_block_id: Option<String>,
    /// Model / engine name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<String>,
    /// Sampling temperature sent upstream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Nucleus sampling sent upstream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    /// Output token cap sent upstream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Provider stop reason, once known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    /// Token usage, once known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    /// Wall-clock duration of the inference so far.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Provider-specific extras (`claude_message_id`, ...).
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Payload,
}

impl Default for EventMetadata {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id: String::new(),
            turn_id: String::new(),
            parent_block_id: None,
            engine: None,
            temperature: None,
            top_p: None,
            max_tokens: None,
            stop_reason: None,
            usage: None,
            duration_ms: None,
            extra: Payload::new(),
        }
    }
}

impl EventMetadata {
    /// A copy of this metadata with a fresh event id.
    ///
    /// Engines keep one running metadata value per inference and stamp
    /// each outgoing event with a new id.
    #[must_use]
    pub fn fresh(&self) -> Self {
        Self {
            id: Uuid::new_v4(),
            ..self.clone()
        }
    }

    /// Metadata correlated with `turn`: run and turn ids, plus the
    /// session and inference ids from the turn metadata when present.
    pub fn for_turn(turn: &Turn) -> Self {
        let mut meta = Self {
            run_id: turn.run_id.clone(),
            turn_id: turn.id.clone(),
            ..Self::default()
        };
        for key in [turn_meta::SESSION_ID, turn_meta::INFERENCE_ID] {
            if let Some(value) = turn.metadata.get(key) {
                meta.extra.insert(key.into(), value.clone());
            }
        }
        meta
    }
}

/// Identity of the step that produced an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepMetadata {
    /// Opaque step id.
    pub step_id: Uuid,
    /// Step type, e.g. `openai-chat`.
    #[serde(default)]
    pub step_type: String,
    /// Input type tag.
    #[serde(default)]
    pub input_type: String,
    /// Output type tag.
    #[serde(default)]
    pub output_type: String,
    /// Settings echo.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Payload,
}

impl Default for StepMetadata {
    fn default() -> Self {
        Self {
            step_id: Uuid::new_v4(),
            step_type: String::new(),
            input_type: String::new(),
            output_type: String::new(),
            metadata: Payload::new(),
        }
    }
}

impl StepMetadata {
    /// Metadata for a chat-completion step.
    pub fn chat(step_type: impl Into<String>) -> Self {
        Self {
            step_type: step_type.into(),
            input_type: "turn".into(),
            output_type: "turn".into(),
            ..Self::default()
        }
    }
}

// ── Payloads ────────────────────────────────────────────────────────

/// A fully assembled tool call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallPayload {
    /// Correlation id.
    pub id: String,
    /// Tool name.
    pub name: String,
    /// Argument JSON as a string.
    pub input: String,
}

/// The result of a tool execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResultPayload {
    /// Correlation id.
    pub id: String,
    /// Rendered result.
    pub result: String,
}

/// The event variants. Serialized with a `type` tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// Inference started.
    Start,
    /// A text delta plus the running completion.
    PartialCompletion {
        /// New text since the previous event.
        delta: String,
        /// All text so far.
        completion: String,
    },
    /// Inference finished with the full text.
    Final {
        /// Complete text.
        text: String,
    },
    /// The model requested a tool call.
    ToolCall {
        /// The assembled call.
        tool_call: ToolCallPayload,
    },
    /// A tool result was produced.
    ToolResult {
        /// The result.
        tool_result: ToolResultPayload,
    },
    /// The tool loop is about to execute a call.
    ToolCallExecute {
        /// The call being executed.
        tool_call: ToolCallPayload,
    },
    /// The tool loop finished executing a call.
    ToolCallExecutionResult {
        /// The execution result.
        tool_result: ToolResultPayload,
    },
    /// Inference was cancelled; carries the partial text.
    Interrupt {
        /// Text produced before cancellation.
        text: String,
    },
    /// Inference failed.
    Error {
        /// Error message.
        error_string: String,
    },
    /// A log line routed through the event bus.
    Log {
        /// Level name (`debug`, `info`, ...).
        level: String,
        /// Message.
        message: String,
        /// Structured fields.
        #[serde(default, skip_serializing_if = "Map::is_empty")]
        fields: Payload,
    },
    /// An informational notice.
    Info {
        /// Message.
        message: String,
        /// Attached data.
        #[serde(default, skip_serializing_if = "Map::is_empty")]
        data: Payload,
    },
    /// An event whose type this crate does not know.
    #[serde(skip)]
    Unknown {
        /// The `type` tag as received.
        event_type: String,
        /// All remaining fields.
        payload: Payload,
    },
}

const KNOWN_TYPES: &[&str] = &[
    "start",
    "partial_completion",
    "final",
    "tool_call",
    "tool_result",
    "tool_call_execute",
    "tool_call_execution_result",
    "interrupt",
    "error",
    "log",
    "info",
];

impl EventPayload {
    /// The wire `type` tag.
    pub fn event_type(&self) -> &str {
        match self {
            Self::Start => "start",
            Self::PartialCompletion { .. } => "partial_completion",
            Self::Final { .. } => "final",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResult { .. } => "tool_result",
            Self::ToolCallExecute { .. } => "tool_call_execute",
            Self::ToolCallExecutionResult { .. } => "tool_call_execution_result",
            Self::Interrupt { .. } => "interrupt",
            Self::Error { .. } => "error",
            Self::Log { .. } => "log",
            Self::Info { .. } => "info",
            Self::Unknown { event_type, .. } => event_type,
        }
    }
}

// ── Event ───────────────────────────────────────────────────────────

/// A normalized, provider-independent record emitted during inference.
///
/// Events serialize to a flat JSON object with a `type` tag, the
/// variant's fields, and `meta`/`step` envelopes:
///
/// ```rust
/// use geppetto::events::{Event, EventMetadata};
///
/// let event = Event::partial("lo", "Hello", EventMetadata::default());
/// let json = serde_json::to_value(&event).unwrap();
/// assert_eq!(json["type"], "partial_completion");
/// assert_eq!(json["completion"], "Hello");
///
/// let back: Event = serde_json::from_value(json).unwrap();
/// assert_eq!(back, event);
/// ```
///
/// Unknown `type` tags deserialize into [`EventPayload::Unknown`]
/// instead of failing.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Variant and its fields.
    pub payload: EventPayload,
    /// Envelope metadata.
    pub meta: EventMetadata,
    /// Producing step.
    pub step: StepMetadata,
}

impl Event {
    /// An event with default step metadata.
    pub fn new(payload: EventPayload, meta: EventMetadata) -> Self {
        Self {
            payload,
            meta,
            step: StepMetadata::default(),
        }
    }

    /// `start`.
    pub fn start(meta: EventMetadata) -> Self {
        Self::new(EventPayload::Start, meta)
    }

    /// `partial_completion`.
    pub fn partial(
        delta: impl Into<String>,
        completion: impl Into<String>,
        meta: EventMetadata,
    ) -> Self {
        Self::new(
            EventPayload::PartialCompletion {
                delta: delta.into(),
                completion: completion.into(),
            },
            meta,
        )
    }

    /// `final`.
    pub fn final_text(text: impl Into<String>, meta: EventMetadata) -> Self {
        Self::new(EventPayload::Final { text: text.into() }, meta)
    }

    /// `tool_call`.
    pub fn tool_call(tool_call: ToolCallPayload, meta: EventMetadata) -> Self {
        Self::new(EventPayload::ToolCall { tool_call }, meta)
    }

    /// `tool_result`.
    pub fn tool_result(tool_result: ToolResultPayload, meta: EventMetadata) -> Self {
        Self::new(EventPayload::ToolResult { tool_result }, meta)
    }

    /// `tool_call_execute`.
    pub fn tool_call_execute(tool_call: ToolCallPayload, meta: EventMetadata) -> Self {
        Self::new(EventPayload::ToolCallExecute { tool_call }, meta)
    }

    /// `tool_call_execution_result`.
    pub fn tool_call_execution_result(tool_result: ToolResultPayload, meta: EventMetadata) -> Self {
        Self::new(EventPayload::ToolCallExecutionResult { tool_result }, meta)
    }

    /// `interrupt`.
    pub fn interrupt(text: impl Into<String>, meta: EventMetadata) -> Self {
        Self::new(EventPayload::Interrupt { text: text.into() }, meta)
    }

    /// `error`.
    pub fn error(error: impl std::fmt::Display, meta: EventMetadata) -> Self {
        Self::new(
            EventPayload::Error {
                error_string: error.to_string(),
            },
            meta,
        )
    }

    /// `log`.
    pub fn log(level: impl Into<String>, message: impl Into<String>, fields: Payload, meta: EventMetadata) -> Self {
        Self::new(
            EventPayload::Log {
                level: level.into(),
                message: message.into(),
                fields,
            },
            meta,
        )
    }

    /// `info`.
    pub fn info(message: impl Into<String>, data: Payload, meta: EventMetadata) -> Self {
        Self::new(
            EventPayload::Info {
                message: message.into(),
                data,
            },
            meta,
        )
    }

    /// Replaces the step metadata.
    #[must_use]
    pub fn with_step(mut self, step: StepMetadata) -> Self {
        self.step = step;
        self
    }

    /// The wire `type` tag.
    pub fn event_type(&self) -> &str {
        self.payload.event_type()
    }
}

impl Serialize for Event {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = match &self.payload {
            EventPayload::Unknown {
                event_type,
                payload,
            } => {
                let mut map = payload.clone();
                map.insert("type".into(), Value::String(event_type.clone()));
                map
            }
            known => match serde_json::to_value(known).map_err(ser::Error::custom)? {
                Value::Object(map) => map,
                other => {
                    return Err(ser::Error::custom(format!(
                        "event payload serialized to non-object {other}"
                    )));
                }
            },
        };
        map.insert(
            "meta".into(),
            serde_json::to_value(&self.meta).map_err(ser::Error::custom)?,
        );
        map.insert(
            "step".into(),
            serde_json::to_value(&self.step).map_err(ser::Error::custom)?,
        );
        map.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Event {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let mut map = Map::<String, Value>::deserialize(deserializer)?;

        let meta = match map.remove("meta") {
            Some(v) => serde_json::from_value(v).map_err(de::Error::custom)?,
            None => EventMetadata::default(),
        };
        let step = match map.remove("step") {
            Some(v) => serde_json::from_value(v).map_err(de::Error::custom)?,
            None => StepMetadata::default(),
        };
        let event_type = map
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| de::Error::missing_field("type"))?
            .to_string();

        let payload = if KNOWN_TYPES.contains(&event_type.as_str()) {
            serde_json::from_value(Value::Object(map)).map_err(de::Error::custom)?
        } else {
            map.remove("type");
            EventPayload::Unknown {
                event_type,
                payload: map,
            }
        };
        Ok(Self {
            payload,
            meta,
            step,
        })
    }
}
