//! The Turn/Block conversation model.
//!
//! A [`Turn`] is one ordered sequence of [`Block`]s plus turn-scoped
//! typed [`TurnData`] (tool inventory, inference overrides) and free-form
//! metadata (provider and settings echoes). Engines take a Turn, append
//! the model's output blocks, and hand it back.
//!
//! Block order is the semantic order of the conversation and is never
//! changed implicitly. Two invariants are checked at snapshot time by
//! [`ConversationState`](crate::conversation::ConversationState):
//!
//! - every `tool_use` block references an earlier `tool_call` by `id`;
//! - a `reasoning` block is immediately followed by `llm_text` or
//!   `tool_call`.
//!
//! ```rust
//! use geppetto::turns::{Block, BlockKind, Turn};
//!
//! let mut turn = Turn::new();
//! turn.append_block(Block::system_text("Be terse."));
//! turn.append_block(Block::user_text("Hi"));
//!
//! assert_eq!(turn.blocks.len(), 2);
//! assert!(!turn.blocks[0].id.is_empty());
//! assert_eq!(turn.blocks_by_kind(&[BlockKind::User]).len(), 1);
//! ```

mod block;
mod tree;

pub use block::{Block, BlockKind, ImageContent, ImageData, Payload, keys, meta, role};
pub use tree::ConversationTree;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::{
    ClaudeInferenceConfig, InferenceConfig, OpenAiInferenceConfig, StructuredOutputConfig,
};
use crate::tool::{ToolConfig, ToolDefinition};

/// Well-known turn metadata keys written by engines.
pub mod turn_meta {
    /// Provider name (`openai`, `claude`, `gemini`, ...).
    pub const PROVIDER: &str = "provider";
    /// Model identifier used for the inference.
    pub const MODEL: &str = "model";
    /// Provider stop reason of the last inference.
    pub const STOP_REASON: &str = "stop_reason";
    /// Token usage of the last inference.
    pub const USAGE: &str = "usage";
    /// Caller-supplied session id.
    pub const SESSION_ID: &str = "session_id";
    /// Caller-supplied inference id.
    pub const INFERENCE_ID: &str = "inference_id";
}

/// Typed per-turn state consumed by engines and the tool loop.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnData {
    /// Tools advertised to the model for this turn.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
    /// Tool-calling policy for this turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_config: Option<ToolConfig>,
    /// Provider-neutral sampling overrides.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inference_config: Option<InferenceConfig>,
    /// OpenAI-only overrides.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub openai_inference_config: Option<OpenAiInferenceConfig>,
    /// Claude-only overrides.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claude_inference_config: Option<ClaudeInferenceConfig>,
    /// Structured-output override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_output: Option<StructuredOutputConfig>,
    /// Application data.
    #[serde(flatten)]
    pub extra: Payload,
}

impl TurnData {
    /// The tools an engine should send, with the policy that selected
    /// them. Empty when tool calling is disabled for the turn.
    pub fn advertised_tools(&self) -> (Vec<ToolDefinition>, ToolConfig) {
        let config = self.tool_config.clone().unwrap_or_default();
        if !config.enabled {
            return (Vec::new(), config);
        }
        (config.filter_tools(&self.tools), config)
    }
}

/// One inference unit: ordered blocks plus scoped data and metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Turn {
    /// Turn identifier.
    #[serde(default)]
    pub id: String,
    /// Identifier of the run (session) the turn belongs to.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub run_id: String,
    /// Conversation blocks in semantic order.
    #[serde(default)]
    pub blocks: Vec<Block>,
    /// Provider and settings echoes.
    #[serde(default)]
    pub metadata: Payload,
    /// Typed per-turn state.
    #[serde(default)]
    pub data: TurnData,
}

impl Turn {
    /// An empty turn with a fresh id.
    pub fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            ..Default::default()
        }
    }

    /// A turn seeded with the given blocks (ids assigned as needed).
    pub fn with_blocks(blocks: impl IntoIterator<Item = Block>) -> Self {
        let mut turn = Self::new();
        turn.append_blocks(blocks);
        turn
    }

    fn stamp(&self, mut block: Block) -> Block {
        if block.id.is_empty() {
            block.id = uuid::Uuid::new_v4().to_string();
        }
        if block.turn_id.is_none() && !self.id.is_empty() {
            block.turn_id = Some(self.id.clone());
        }
        block
    }

    /// Appends a block, assigning a fresh id if it has none.
    pub fn append_block(&mut self, block: Block) {
        let block = self.stamp(block);
        self.blocks.push(block);
    }

    /// Appends several blocks in order.
    pub fn append_blocks(&mut self, blocks: impl IntoIterator<Item = Block>) {
        for block in blocks {
            self.append_block(block);
        }
    }

    /// Inserts a block at position 0.
    pub fn prepend_block(&mut self, block: Block) {
        let block = self.stamp(block);
        self.blocks.insert(0, block);
    }

    /// All blocks whose kind is in `kinds`, in turn order.
    pub fn blocks_by_kind(&self, kinds: &[BlockKind]) -> Vec<&Block> {
        self.blocks
            .iter()
            .filter(|b| kinds.contains(&b.kind))
            .collect()
    }

    /// The last block of the given kind.
    pub fn last_block_of_kind(&self, kind: BlockKind) -> Option<&Block> {
        self.blocks.iter().rev().find(|b| b.kind == kind)
    }

    /// Inserts or replaces a turn metadata entry.
    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.metadata.insert(key.into(), value.into());
    }

    /// Concatenated text of all assistant blocks.
    pub fn assistant_text(&self) -> String {
        self.blocks
            .iter()
            .filter(|b| b.kind == BlockKind::LlmText)
            .filter_map(Block::text)
            .collect()
    }
}
