//! Blocks: the atomic unit of a conversation.

use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Key/value map used for block payloads and metadata.
pub type Payload = Map<String, Value>;

/// Well-known payload keys.
pub mod keys {
    /// Text content of user, assistant, system and reasoning blocks.
    pub const TEXT: &str = "text";
    /// Tool name on `tool_call` blocks.
    pub const NAME: &str = "name";
    /// Tool-call correlation id on `tool_call` and `tool_use` blocks.
    pub const ID: &str = "id";
    /// Tool-call arguments (JSON object or JSON string).
    pub const ARGS: &str = "args";
    /// Tool execution output on `tool_use` blocks.
    pub const RESULT: &str = "result";
    /// Tool execution error on `tool_use` blocks.
    pub const ERROR: &str = "error";
    /// Images attached to a chat block.
    pub const IMAGES: &str = "images";
    /// Opaque provider reasoning blob.
    pub const ENCRYPTED_CONTENT: &str = "encrypted_content";
    /// Provider-native output item id (e.g. `fc_...`, `rs_...`).
    pub const ITEM_ID: &str = "item_id";
}

/// Well-known block metadata keys.
pub mod meta {
    /// Provider-native content array preserved for exact replay.
    pub const CLAUDE_ORIGINAL_CONTENT: &str = "claude_original_content";
    /// Name of the middleware that produced or rewrote the block.
    pub const MIDDLEWARE: &str = "middleware";
}

/// Conventional role strings.
pub mod role {
    /// End-user input.
    pub const USER: &str = "user";
    /// Model output.
    pub const ASSISTANT: &str = "assistant";
    /// System instructions.
    pub const SYSTEM: &str = "system";
    /// Tool output.
    pub const TOOL: &str = "tool";
}

/// Discriminates what a [`Block`] represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    /// User input text (optionally with images).
    User,
    /// Assistant output text.
    LlmText,
    /// A tool invocation requested by the model.
    ToolCall,
    /// The result of executing a tool call.
    ToolUse,
    /// System instructions.
    System,
    /// Provider reasoning (opaque, possibly encrypted).
    Reasoning,
    /// Anything else; unknown kinds deserialize to this.
    #[serde(other)]
    Other,
}

impl BlockKind {
    /// The wire name of the kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::LlmText => "llm_text",
            Self::ToolCall => "tool_call",
            Self::ToolUse => "tool_use",
            Self::System => "system",
            Self::Reasoning => "reasoning",
            Self::Other => "other",
        }
    }

    /// Whether the kind belongs to the tool family (`tool_call`, `tool_use`).
    pub fn is_tool(self) -> bool {
        matches!(self, Self::ToolCall | Self::ToolUse)
    }
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed message fragment inside a [`Turn`](super::Turn).
///
/// Blocks carry a kind discriminator and an untyped payload map rather
/// than a type hierarchy. Use the constructors for the common shapes:
///
/// ```rust
/// use geppetto::turns::{Block, BlockKind};
/// use serde_json::json;
///
/// let call = Block::tool_call("call_1", "calculator", json!({"a": 5, "b": 3}));
/// assert_eq!(call.kind, BlockKind::ToolCall);
/// assert_eq!(call.call_id(), Some("call_1"));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    /// Opaque identifier; assigned on append when empty.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    /// Id of the turn the block was appended to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<String>,
    /// What the block represents.
    pub kind: BlockKind,
    /// Conversational role (`user`, `assistant`, `system`, `tool`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Kind-specific content, keyed by [`keys`].
    #[serde(default)]
    pub payload: Payload,
    /// Block-scoped annotations (markers, provider echoes).
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Payload,
}

impl Block {
    /// An empty block of the given kind.
    pub fn new(kind: BlockKind) -> Self {
        Self {
            id: String::new(),
            turn_id: None,
            kind,
            role: None,
            payload: Payload::new(),
            metadata: Payload::new(),
        }
    }

    fn text_block(kind: BlockKind, role: &str, text: impl Into<String>) -> Self {
        let mut block = Self::new(kind);
        block.role = Some(role.to_string());
        block
            .payload
            .insert(keys::TEXT.into(), Value::String(text.into()));
        block
    }

    /// A user text block.
    pub fn user_text(text: impl Into<String>) -> Self {
        Self::text_block(BlockKind::User, role::USER, text)
    }

    /// A user text block with attached images.
    pub fn user_text_with_images(text: impl Into<String>, images: &[ImageContent]) -> Self {
        let mut block = Self::user_text(text);
        let images = images
            .iter()
            .filter_map(|img| serde_json::to_value(img).ok())
            .collect();
        block.payload.insert(keys::IMAGES.into(), Value::Array(images));
        block
    }

    /// An assistant text block.
    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self::text_block(BlockKind::LlmText, role::ASSISTANT, text)
    }

    /// A system instruction block.
    pub fn system_text(text: impl Into<String>) -> Self {
        Self::text_block(BlockKind::System, role::SYSTEM, text)
    }

    /// A tool invocation requested by the model.
    pub fn tool_call(id: impl Into<String>, name: impl Into<String>, args: Value) -> Self {
        let mut block = Self::new(BlockKind::ToolCall);
        block.payload.insert(keys::ID.into(), Value::String(id.into()));
        block
            .payload
            .insert(keys::NAME.into(), Value::String(name.into()));
        block.payload.insert(keys::ARGS.into(), args);
        block
    }

    /// The result of a tool invocation.
    pub fn tool_use(id: impl Into<String>, result: Value) -> Self {
        let mut block = Self::new(BlockKind::ToolUse);
        block.payload.insert(keys::ID.into(), Value::String(id.into()));
        block.payload.insert(keys::RESULT.into(), result);
        block
    }

    /// A reasoning block carrying an opaque provider blob.
    pub fn reasoning(item_id: impl Into<String>, encrypted_content: Option<String>) -> Self {
        let mut block = Self::new(BlockKind::Reasoning);
        block.role = Some(role::ASSISTANT.into());
        block
            .payload
            .insert(keys::ITEM_ID.into(), Value::String(item_id.into()));
        if let Some(content) = encrypted_content {
            block
                .payload
                .insert(keys::ENCRYPTED_CONTENT.into(), Value::String(content));
        }
        block
    }

    /// Sets the block id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Inserts a payload entry.
    #[must_use]
    pub fn with_payload(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// Inserts a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Inserts or replaces a metadata entry in place.
    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.metadata.insert(key.into(), value.into());
    }

    /// Returns a payload entry as a string slice.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    /// The `text` payload, if any.
    pub fn text(&self) -> Option<&str> {
        self.payload_str(keys::TEXT)
    }

    /// The tool-call correlation id (payload `id`).
    pub fn call_id(&self) -> Option<&str> {
        self.payload_str(keys::ID)
    }

    /// The tool name (payload `name`).
    pub fn tool_name(&self) -> Option<&str> {
        self.payload_str(keys::NAME)
    }

    /// Images attached to the block. Malformed entries are skipped.
    pub fn images(&self) -> Vec<ImageContent> {
        match self.payload.get(keys::IMAGES) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|item| serde_json::from_value(item.clone()).ok())
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Tool-call arguments rendered as a JSON string.
    ///
    /// String arguments pass through unchanged, other values are
    /// serialized, and missing or empty arguments become `"{}"`.
    pub fn args_json(&self) -> String {
        match self.payload.get(keys::ARGS) {
            Some(Value::String(s)) if !s.trim().is_empty() => s.clone(),
            Some(Value::String(_) | Value::Null) | None => "{}".into(),
            Some(other) => other.to_string(),
        }
    }

    /// Tool-call arguments as a JSON value.
    ///
    /// String arguments are parsed; unparseable strings are wrapped as
    /// a JSON string so no information is lost.
    pub fn args_value(&self) -> Value {
        match self.payload.get(keys::ARGS) {
            Some(Value::String(s)) if s.trim().is_empty() => Value::Object(Map::new()),
            Some(Value::String(s)) => {
                serde_json::from_str(s).unwrap_or_else(|_| Value::String(s.clone()))
            }
            Some(Value::Null) | None => Value::Object(Map::new()),
            Some(other) => other.clone(),
        }
    }

    /// A tool result rendered as provider-facing text.
    ///
    /// When the payload carries an `error`, the result is wrapped as
    /// `{"error": ..., "result": ...}`.
    pub fn result_string(&self) -> String {
        let result = self.payload.get(keys::RESULT);
        if let Some(error) = self.payload.get(keys::ERROR).filter(|e| !e.is_null()) {
            let wrapped = serde_json::json!({
                "error": error,
                "result": result.cloned().unwrap_or(Value::Null),
            });
            return wrapped.to_string();
        }
        match result {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        }
    }
}

// ── Images ──────────────────────────────────────────────────────────

/// Inline image bytes: either raw bytes or an already base64-encoded string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ImageData {
    /// Already base64-encoded content.
    Base64(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
}

/// An image attached to a chat block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageContent {
    /// MIME type, e.g. `image/png`.
    pub media_type: String,
    /// External URL; takes precedence over inline content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Inline content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<ImageData>,
}

impl ImageContent {
    /// An image referenced by URL.
    pub fn from_url(media_type: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            media_type: media_type.into(),
            url: Some(url.into()),
            content: None,
        }
    }

    /// An inline image from raw bytes.
    pub fn from_bytes(media_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            media_type: media_type.into(),
            url: None,
            content: Some(ImageData::Bytes(bytes)),
        }
    }

    /// The inline content as base64, if present.
    pub fn base64_data(&self) -> Option<String> {
        match &self.content {
            Some(ImageData::Base64(s)) => Some(s.clone()),
            Some(ImageData::Bytes(bytes)) => Some(BASE64.encode(bytes)),
            None => None,
        }
    }

    /// The URL to send upstream: the external URL if set, otherwise a
    /// `data:<media_type>;base64,...` URL built from the inline content.
    pub fn data_url(&self) -> Option<String> {
        if let Some(url) = self.url.as_deref().filter(|u| !u.is_empty()) {
            return Some(url.to_string());
        }
        self.base64_data()
            .map(|data| format!("data:{};base64,{data}", self.media_type))
    }
}
