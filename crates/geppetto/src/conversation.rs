//! Mutable conversation state with versioned mutations and validated
//! snapshots.
//!
//! [`ConversationState`] is where callers build up a conversation before
//! handing it to an engine. Every change goes through a tagged
//! [`Mutation`]; each successfully applied mutation bumps
//! [`version`](ConversationState::version) by one. A failing mutation
//! leaves both the blocks and the version untouched.
//!
//! [`ConversationState::snapshot`] is the boundary where provider
//! requests are built: it deep-copies the blocks into a fresh
//! [`Turn`], optionally filtering, reordering and validating them.
//!
//! ```rust
//! use geppetto::conversation::{ConversationState, Mutation, SnapshotConfig};
//!
//! let mut state = ConversationState::new("run-1");
//! state
//!     .apply_all([
//!         Mutation::ensure_system_prompt("Be terse.", "prompt", "main"),
//!         Mutation::user_text("What is 5+3?"),
//!     ])
//!     .unwrap();
//!
//! assert_eq!(state.version, 2);
//! let turn = state.snapshot(&SnapshotConfig::default()).unwrap();
//! assert_eq!(turn.blocks.len(), 2);
//! ```

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::error::GeppettoError;
use crate::turns::{Block, BlockKind, Payload, Turn, TurnData, role};

/// A deterministic reordering applied to snapshot blocks.
pub type OrderingStrategy =
    Arc<dyn Fn(Vec<Block>) -> Result<Vec<Block>, GeppettoError> + Send + Sync>;

/// A tagged change to a [`ConversationState`].
#[derive(Debug, Clone)]
pub enum Mutation {
    /// Append one block, assigning an id when empty.
    AppendBlock(Block),
    /// Append several blocks in order.
    AppendBlocks(Vec<Block>),
    /// Append trimmed user or assistant text.
    AppendText {
        /// `user` or `assistant`.
        role: String,
        /// Text; must be non-empty after trimming.
        text: String,
    },
    /// Append a `tool_call` block.
    AppendToolCall {
        /// Correlation id; must be non-empty.
        id: String,
        /// Tool name; must be non-empty.
        name: String,
        /// Arguments (object or JSON string).
        args: Value,
    },
    /// Append a `tool_use` block.
    AppendToolResult {
        /// Correlation id; must be non-empty.
        id: String,
        /// Tool output.
        result: Value,
    },
    /// Replace any system block carrying the same marker with a fresh
    /// system block at position 0.
    EnsureSystemPrompt {
        /// Prompt text; must be non-empty after trimming.
        text: String,
        /// Marker metadata key.
        metadata_key: String,
        /// Marker metadata value.
        metadata_value: String,
    },
}

impl Mutation {
    /// `AppendText` for the user role.
    pub fn user_text(text: impl Into<String>) -> Self {
        Self::AppendText {
            role: role::USER.into(),
            text: text.into(),
        }
    }

    /// `AppendText` for the assistant role.
    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self::AppendText {
            role: role::ASSISTANT.into(),
            text: text.into(),
        }
    }

    /// `AppendToolCall`.
    pub fn tool_call(id: impl Into<String>, name: impl Into<String>, args: Value) -> Self {
        Self::AppendToolCall {
            id: id.into(),
            name: name.into(),
            args,
        }
    }

    /// `AppendToolResult`.
    pub fn tool_result(id: impl Into<String>, result: Value) -> Self {
        Self::AppendToolResult {
            id: id.into(),
            result,
        }
    }

    /// `EnsureSystemPrompt`.
    pub fn ensure_system_prompt(
        text: impl Into<String>,
        metadata_key: impl Into<String>,
        metadata_value: impl Into<String>,
    ) -> Self {
        Self::EnsureSystemPrompt {
            text: text.into(),
            metadata_key: metadata_key.into(),
            metadata_value: metadata_value.into(),
        }
    }

    /// The mutation tag.
    pub fn name(&self) -> &'static str {
        match self {
            Self::AppendBlock(_) => "append_block",
            Self::AppendBlocks(_) => "append_blocks",
            Self::AppendText { .. } => "append_text",
            Self::AppendToolCall { .. } => "append_tool_call",
            Self::AppendToolResult { .. } => "append_tool_result",
            Self::EnsureSystemPrompt { .. } => "ensure_system_prompt",
        }
    }

    fn apply_to(self, blocks: &mut Vec<Block>) -> Result<(), String> {
        match self {
            Self::AppendBlock(block) => blocks.push(ensure_id(block)),
            Self::AppendBlocks(new) => blocks.extend(new.into_iter().map(ensure_id)),
            Self::AppendText { role: r, text } => {
                let text = text.trim();
                if text.is_empty() {
                    return Err("text is empty".into());
                }
                let block = match r.as_str() {
                    role::USER => Block::user_text(text),
                    role::ASSISTANT => Block::assistant_text(text),
                    other => return Err(format!("unsupported role {other:?}")),
                };
                blocks.push(ensure_id(block));
            }
            Self::AppendToolCall { id, name, args } => {
                if id.trim().is_empty() {
                    return Err("tool_call id is empty".into());
                }
                if name.trim().is_empty() {
                    return Err("tool_call name is empty".into());
                }
                blocks.push(ensure_id(Block::tool_call(id, name, args)));
            }
            Self::AppendToolResult { id, result } => {
                if id.trim().is_empty() {
                    return Err("tool_result id is empty".into());
                }
                blocks.push(ensure_id(Block::tool_use(id, result)));
            }
            Self::EnsureSystemPrompt {
                text,
                metadata_key,
                metadata_value,
            } => {
                let text = text.trim();
                if text.is_empty() {
                    return Err("system prompt text is empty".into());
                }
                if metadata_key.is_empty() || metadata_value.is_empty() {
                    return Err("system prompt metadata key/value required for idempotency".into());
                }
                blocks.retain(|b| {
                    b.metadata.get(&metadata_key).and_then(Value::as_str)
                        != Some(metadata_value.as_str())
                });
                let block = Block::system_text(text).with_metadata(metadata_key, metadata_value);
                blocks.insert(0, ensure_id(block));
            }
        }
        Ok(())
    }
}

fn ensure_id(mut block: Block) -> Block {
    if block.id.is_empty() {
        block.id = uuid::Uuid::new_v4().to_string();
    }
    block
}

/// Filters, ordering and validation applied by [`ConversationState::snapshot`].
#[derive(Clone)]
pub struct SnapshotConfig {
    /// Keep `system` blocks.
    pub include_system: bool,
    /// Keep `tool_call` and `tool_use` blocks.
    pub include_tool_blocks: bool,
    /// Keep `reasoning` blocks.
    pub include_reasoning: bool,
    /// Run [`ordering_strategy`](Self::ordering_strategy) over the kept blocks.
    pub normalize_ordering: bool,
    /// Required when `normalize_ordering` is set.
    pub ordering_strategy: Option<OrderingStrategy>,
    /// Every reasoning block must be followed by `llm_text` or `tool_call`.
    pub enforce_responses_adj: bool,
    /// Every `tool_use` must reference an earlier `tool_call` id.
    pub enforce_tool_pairing: bool,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            include_system: true,
            include_tool_blocks: true,
            include_reasoning: true,
            normalize_ordering: false,
            ordering_strategy: None,
            enforce_responses_adj: false,
            enforce_tool_pairing: false,
        }
    }
}

impl fmt::Debug for SnapshotConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotConfig")
            .field("include_system", &self.include_system)
            .field("include_tool_blocks", &self.include_tool_blocks)
            .field("include_reasoning", &self.include_reasoning)
            .field("normalize_ordering", &self.normalize_ordering)
            .field("ordering_strategy", &self.ordering_strategy.is_some())
            .field("enforce_responses_adj", &self.enforce_responses_adj)
            .field("enforce_tool_pairing", &self.enforce_tool_pairing)
            .finish()
    }
}

impl SnapshotConfig {
    /// The default config with both invariant checks turned on.
    pub fn strict() -> Self {
        Self {
            enforce_responses_adj: true,
            enforce_tool_pairing: true,
            ..Self::default()
        }
    }

    fn includes(&self, block: &Block) -> bool {
        // All three filters off means "no filtering".
        if !self.include_system && !self.include_tool_blocks && !self.include_reasoning {
            return true;
        }
        match block.kind {
            BlockKind::System => self.include_system,
            BlockKind::ToolCall | BlockKind::ToolUse => self.include_tool_blocks,
            BlockKind::Reasoning => self.include_reasoning,
            BlockKind::User | BlockKind::LlmText | BlockKind::Other => true,
        }
    }
}

/// Mutable container for turn-building.
#[derive(Debug, Clone, Default)]
pub struct ConversationState {
    /// State identifier; becomes the snapshot turn id.
    pub id: String,
    /// Run identifier.
    pub run_id: String,
    /// Blocks in conversation order.
    pub blocks: Vec<Block>,
    /// Typed data copied into snapshots.
    pub data: TurnData,
    /// Metadata copied into snapshots.
    pub metadata: Payload,
    /// Number of successfully applied mutations.
    pub version: u64,
}

impl ConversationState {
    /// An empty state with a fresh id.
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: run_id.into(),
            ..Default::default()
        }
    }

    /// Applies one mutation and bumps the version.
    ///
    /// Fails with [`GeppettoError::InvariantViolation`] when a required
    /// field is empty; the state is left unchanged in that case.
    pub fn apply(&mut self, mutation: Mutation) -> Result<(), GeppettoError> {
        let name = mutation.name();
        mutation
            .apply_to(&mut self.blocks)
            .map_err(|msg| GeppettoError::invariant(format!("mutation {name} failed: {msg}")))?;
        self.version += 1;
        Ok(())
    }

    /// Applies mutations in order, stopping at the first failure.
    pub fn apply_all(
        &mut self,
        mutations: impl IntoIterator<Item = Mutation>,
    ) -> Result<(), GeppettoError> {
        for mutation in mutations {
            self.apply(mutation)?;
        }
        Ok(())
    }

    /// Produces an immutable turn from the current blocks.
    pub fn snapshot(&self, cfg: &SnapshotConfig) -> Result<Turn, GeppettoError> {
        let blocks = self.snapshot_blocks(cfg)?;
        let id = if self.id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            self.id.clone()
        };
        Ok(Turn {
            id,
            run_id: self.run_id.clone(),
            blocks,
            metadata: self.metadata.clone(),
            data: self.data.clone(),
        })
    }

    /// Runs the snapshot checks without producing a turn.
    pub fn validate(&self, cfg: &SnapshotConfig) -> Result<(), GeppettoError> {
        self.snapshot_blocks(cfg).map(|_| ())
    }

    fn snapshot_blocks(&self, cfg: &SnapshotConfig) -> Result<Vec<Block>, GeppettoError> {
        let mut blocks: Vec<Block> = self
            .blocks
            .iter()
            .filter(|b| cfg.includes(b))
            .cloned()
            .collect();

        if cfg.normalize_ordering {
            let strategy = cfg.ordering_strategy.as_ref().ok_or_else(|| {
                GeppettoError::invariant("normalize ordering requires ordering strategy")
            })?;
            blocks = strategy(blocks)?;
        }

        if cfg.enforce_responses_adj {
            validate_reasoning_adjacency(&blocks)?;
        }
        if cfg.enforce_tool_pairing {
            validate_tool_pairing(&blocks)?;
        }
        Ok(blocks)
    }
}

fn block_label(block: &Block) -> &str {
    if !block.id.is_empty() {
        return &block.id;
    }
    block.call_id().filter(|id| !id.is_empty()).unwrap_or("<unknown>")
}

/// Checks that each reasoning block is immediately followed by
/// `llm_text` or `tool_call`.
pub fn validate_reasoning_adjacency(blocks: &[Block]) -> Result<(), GeppettoError> {
    for (i, block) in blocks.iter().enumerate() {
        if block.kind != BlockKind::Reasoning {
            continue;
        }
        match blocks.get(i + 1) {
            None => {
                return Err(GeppettoError::invariant(format!(
                    "reasoning block {:?} missing immediate follower",
                    block_label(block)
                )));
            }
            Some(next) if !matches!(next.kind, BlockKind::LlmText | BlockKind::ToolCall) => {
                return Err(GeppettoError::invariant(format!(
                    "reasoning block {:?} followed by {}",
                    block_label(block),
                    next.kind
                )));
            }
            Some(_) => {}
        }
    }
    Ok(())
}

/// Checks that each `tool_use` references an earlier `tool_call` id.
pub fn validate_tool_pairing(blocks: &[Block]) -> Result<(), GeppettoError> {
    let mut seen = HashSet::new();
    for block in blocks {
        match block.kind {
            BlockKind::ToolCall => {
                let id = block.call_id().filter(|id| !id.is_empty()).ok_or_else(|| {
                    GeppettoError::invariant("tool_call block missing id")
                })?;
                seen.insert(id);
            }
            BlockKind::ToolUse => {
                let id = block.call_id().filter(|id| !id.is_empty()).ok_or_else(|| {
                    GeppettoError::invariant("tool_use block missing id")
                })?;
                if !seen.contains(id) {
                    return Err(GeppettoError::invariant(format!(
                        "tool_use for unknown id {id:?}"
                    )));
                }
            }
            _ => {}
        }
    }
    Ok(())
}
