//! Anthropic Messages API wire types.
//!
//! Content arrays are heterogeneous: each element carries a `type`
//! discriminator. [`Content::from_value`] dispatches on it and rejects
//! unknown discriminators with [`GeppettoError::UnknownContentType`];
//! the [`Deserialize`] impl goes through the same path, so whole
//! messages and responses parse with the same rules.

use geppetto::GeppettoError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

// ── Content ────────────────────────────────────────────────────────

/// One element of a message's `content` array.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Content {
    /// Plain text.
    Text(TextContent),
    /// An image, inline (`base64`) or by `url`.
    Image(ImageContent),
    /// A tool invocation, in assistant messages.
    ToolUse(ToolUseContent),
    /// A tool result, in user messages.
    ToolResult(ToolResultContent),
    /// Extended thinking, in assistant messages.
    Thinking(ThinkingContent),
    /// Thinking the provider returned encrypted.
    RedactedThinking(RedactedThinkingContent),
}

/// `{"type": "text", "text": ...}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextContent {
    /// The text.
    pub text: String,
}

/// `{"type": "image", "source": {...}}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageContent {
    /// Where the image bytes come from.
    pub source: ImageSource,
}

/// Image source: `base64` with `media_type` and `data`, or `url`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageSource {
    /// `base64` or `url`.
    #[serde(rename = "type")]
    pub source_type: String,
    /// MIME type of inline data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// Base64 payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    /// External URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// `{"type": "tool_use", "id", "name", "input"}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUseContent {
    /// Provider-assigned call id (`toolu_...`).
    pub id: String,
    /// Tool name.
    pub name: String,
    /// Arguments object.
    #[serde(default)]
    pub input: Value,
}

/// `{"type": "tool_result", "tool_use_id", "content", "is_error"?}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultContent {
    /// The `tool_use` this answers.
    pub tool_use_id: String,
    /// Rendered result.
    #[serde(default)]
    pub content: String,
    /// Whether the tool failed.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

/// `{"type": "thinking", "thinking", "signature"}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThinkingContent {
    /// Reasoning text.
    #[serde(default)]
    pub thinking: String,
    /// Signature the provider verifies when the block is replayed.
    #[serde(default)]
    pub signature: String,
}

/// `{"type": "redacted_thinking", "data"}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedactedThinkingContent {
    /// Encrypted reasoning.
    pub data: String,
}

impl Content {
    /// Text content.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(TextContent { text: text.into() })
    }

    /// Inline base64 image content.
    pub fn image_base64(media_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self::Image(ImageContent {
            source: ImageSource {
                source_type: "base64".into(),
                media_type: Some(media_type.into()),
                data: Some(data.into()),
                url: None,
            },
        })
    }

    /// Image content referenced by URL.
    pub fn image_url(url: impl Into<String>) -> Self {
        Self::Image(ImageContent {
            source: ImageSource {
                source_type: "url".into(),
                media_type: None,
                data: None,
                url: Some(url.into()),
            },
        })
    }

    /// A `tool_use` element.
    pub fn tool_use(id: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        Self::ToolUse(ToolUseContent {
            id: id.into(),
            name: name.into(),
            input,
        })
    }

    /// A `tool_result` element.
    pub fn tool_result(
        tool_use_id: impl Into<String>,
        content: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self::ToolResult(ToolResultContent {
            tool_use_id: tool_use_id.into(),
            content: content.into(),
            is_error,
        })
    }

    /// The wire discriminator.
    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Image(_) => "image",
            Self::ToolUse(_) => "tool_use",
            Self::ToolResult(_) => "tool_result",
            Self::Thinking(_) => "thinking",
            Self::RedactedThinking(_) => "redacted_thinking",
        }
    }

    /// Parses one element, dispatching on its `type`.
    ///
    /// # Errors
    ///
    /// [`GeppettoError::UnknownContentType`] for a missing or unknown
    /// discriminator; [`GeppettoError::ResponseFormat`] when the element
    /// does not match its variant's shape.
    pub fn from_value(value: &Value) -> Result<Self, GeppettoError> {
        let kind = value.get("type").and_then(Value::as_str).unwrap_or_default();
        let parsed = match kind {
            "text" => parse(value).map(Self::Text),
            "image" => parse(value).map(Self::Image),
            "tool_use" => parse(value).map(Self::ToolUse),
            "tool_result" => parse(value).map(Self::ToolResult),
            "thinking" => parse(value).map(Self::Thinking),
            "redacted_thinking" => parse(value).map(Self::RedactedThinking),
            "" => return Err(GeppettoError::UnknownContentType("<missing type>".into())),
            other => return Err(GeppettoError::UnknownContentType(other.into())),
        };
        parsed.map_err(|e| GeppettoError::ResponseFormat {
            message: format!("invalid {kind} content: {e}"),
            raw: value.to_string(),
        })
    }

    /// Parses a whole content array.
    ///
    /// # Errors
    ///
    /// As [`from_value`](Self::from_value), for the first bad element;
    /// [`GeppettoError::ResponseFormat`] when `value` is not an array.
    pub fn parse_array(value: &Value) -> Result<Vec<Self>, GeppettoError> {
        let Some(items) = value.as_array() else {
            return Err(GeppettoError::ResponseFormat {
                message: "content must be an array".into(),
                raw: value.to_string(),
            });
        };
        items.iter().map(Self::from_value).collect()
    }
}

impl<'de> Deserialize<'de> for Content {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(&value).map_err(serde::de::Error::custom)
    }
}

fn parse<T: DeserializeOwned>(value: &Value) -> Result<T, serde_json::Error> {
    T::deserialize(value)
}

// ── Messages ───────────────────────────────────────────────────────

/// One conversation message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// `user` or `assistant`.
    pub role: String,
    /// Content elements.
    pub content: Vec<Content>,
}

impl Message {
    pub(crate) fn new(role: &str, content: Vec<Content>) -> Self {
        Self {
            role: role.to_string(),
            content,
        }
    }
}

/// A complete (or reassembled) Messages API response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageResponse {
    /// Message id (`msg_...`).
    #[serde(default)]
    pub id: String,
    /// Always `assistant`.
    #[serde(default)]
    pub role: String,
    /// Model that produced the message.
    #[serde(default)]
    pub model: String,
    /// Content elements, in completion order.
    #[serde(default)]
    pub content: Vec<Content>,
    /// Why generation stopped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    /// The stop sequence that matched, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_sequence: Option<String>,
    /// Token accounting.
    #[serde(default)]
    pub usage: MessageUsage,
}

impl MessageResponse {
    /// Concatenated text elements.
    pub fn full_text(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| match c {
                Content::Text(t) => Some(t.text.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Whether the message mixes tool calls with text or thinking.
    pub fn has_mixed_content(&self) -> bool {
        let has_tool = self.content.iter().any(|c| matches!(c, Content::ToolUse(_)));
        has_tool && self.content.iter().any(|c| !matches!(c, Content::ToolUse(_)))
    }
}

/// Token usage as reported on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::struct_field_names)]
pub struct MessageUsage {
    /// Prompt tokens. `message_delta` events usually report 0.
    #[serde(default)]
    pub input_tokens: u64,
    /// Completion tokens.
    #[serde(default)]
    pub output_tokens: u64,
    /// Tokens written to the prompt cache.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_creation_input_tokens: Option<u64>,
    /// Tokens read from the prompt cache.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_input_tokens: Option<u64>,
}

// ── Request ────────────────────────────────────────────────────────

/// Request body for `POST /v1/messages`.
#[derive(Debug, Serialize)]
pub(crate) struct Request {
    pub model: String,
    pub messages: Vec<Message>,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<RequestMetadata>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stop_sequences: Vec<String>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoiceParam>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<ThinkingConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_format: Option<OutputFormat>,
}

#[derive(Debug, Serialize)]
pub(crate) struct RequestMetadata {
    pub user_id: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct ToolChoiceParam {
    #[serde(rename = "type")]
    pub choice_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disable_parallel_tool_use: Option<bool>,
}

#[derive(Debug, Serialize)]
pub(crate) struct ThinkingConfig {
    #[serde(rename = "type")]
    pub thinking_type: &'static str,
    pub budget_tokens: u32,
}

#[derive(Debug, Serialize)]
pub(crate) struct OutputFormat {
    #[serde(rename = "type")]
    pub format_type: &'static str,
    pub schema: Value,
}

// ── Streaming ──────────────────────────────────────────────────────

/// One SSE event envelope from the streaming endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamEvent {
    /// `message_start`, `content_block_delta`, ...
    #[serde(rename = "type")]
    pub event_type: String,
    /// Skeleton message (`message_start`).
    #[serde(default)]
    pub message: Option<MessageResponse>,
    /// Content block index (`content_block_*`).
    #[serde(default)]
    pub index: Option<u32>,
    /// Opened block (`content_block_start`).
    #[serde(default)]
    pub content_block: Option<StreamContentBlock>,
    /// Block or message delta.
    #[serde(default)]
    pub delta: Option<StreamDelta>,
    /// Cumulative usage (`message_delta`).
    #[serde(default)]
    pub usage: Option<MessageUsage>,
    /// In-stream error (`error`).
    #[serde(default)]
    pub error: Option<ApiError>,
}

/// The block announced by `content_block_start`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamContentBlock {
    /// `text`, `tool_use`, `thinking`, ...
    #[serde(rename = "type")]
    pub block_type: String,
    /// Tool call id.
    #[serde(default)]
    pub id: Option<String>,
    /// Tool name.
    #[serde(default)]
    pub name: Option<String>,
    /// Initial text.
    #[serde(default)]
    pub text: Option<String>,
    /// Initial thinking.
    #[serde(default)]
    pub thinking: Option<String>,
    /// Redacted thinking payload.
    #[serde(default)]
    pub data: Option<String>,
}

/// A `content_block_delta` or `message_delta` body.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamDelta {
    /// `text_delta`, `input_json_delta`, `thinking_delta`,
    /// `signature_delta`; absent on `message_delta`.
    #[serde(rename = "type", default)]
    pub delta_type: Option<String>,
    /// Text fragment.
    #[serde(default)]
    pub text: Option<String>,
    /// Tool-argument JSON fragment.
    #[serde(default)]
    pub partial_json: Option<String>,
    /// Thinking fragment.
    #[serde(default)]
    pub thinking: Option<String>,
    /// Thinking signature.
    #[serde(default)]
    pub signature: Option<String>,
    /// Stop reason (`message_delta`).
    #[serde(default)]
    pub stop_reason: Option<String>,
    /// Matched stop sequence (`message_delta`).
    #[serde(default)]
    pub stop_sequence: Option<String>,
}

/// Error body, both in-stream and in HTTP error responses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ApiError {
    /// `overloaded_error`, `invalid_request_error`, ...
    #[serde(rename = "type", default)]
    pub error_type: String,
    /// Human-readable description.
    #[serde(default)]
    pub message: String,
}
