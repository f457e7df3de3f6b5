//! Composable middleware around engine inference.
//!
//! Middlewares form a chain around an engine. Each receives the Turn and
//! a [`Next`] handle and may:
//! - pass through with `next.run(ctx, turn).await`
//! - rewrite the Turn before or after the inner call
//! - short-circuit and return without calling `next`
//! - call `next` several times (the tool loop does this)
//!
//! ```text
//! EngineWithMiddleware::new(engine)
//!     .with(TurnLoggingMiddleware)          // outermost: sees the Turn first
//!     .with(SystemPromptMiddleware::new(..))
//!     .with(ToolMiddleware::new(..))        // innermost: wraps the engine
//! ```

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::{DynEngine, Engine, InferenceFuture};
use crate::context::InferenceContext;
use crate::error::GeppettoError;
use crate::turns::{Block, BlockKind, Turn, meta, turn_meta};

/// Wraps inference.
pub trait Middleware: Send + Sync {
    /// Handles one inference; call `next.run(ctx, turn)` to continue.
    fn handle<'a>(&'a self, ctx: &'a InferenceContext, turn: Turn, next: Next<'a>) -> InferenceFuture<'a>;
}

/// Handle to the rest of the chain (or the engine itself).
///
/// `Next` is `Copy`, so a middleware may run the remainder of the chain
/// any number of times.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    middlewares: &'a [Arc<dyn Middleware>],
    engine: &'a dyn DynEngine,
}

impl<'a> Next<'a> {
    /// A chain handle over `middlewares` ending at `engine`.
    pub fn new(middlewares: &'a [Arc<dyn Middleware>], engine: &'a dyn DynEngine) -> Self {
        Self {
            middlewares,
            engine,
        }
    }

    /// Runs the remaining chain.
    pub async fn run(self, ctx: &'a InferenceContext, turn: Turn) -> Result<Turn, GeppettoError> {
        if let Some((first, rest)) = self.middlewares.split_first() {
            let next = Next {
                middlewares: rest,
                engine: self.engine,
            };
            first.handle(ctx, turn, next).await
        } else {
            self.engine.run_inference_boxed(ctx, turn).await
        }
    }
}

/// An engine with a middleware chain in front of it.
///
/// Middlewares run in the order they are added: first added is
/// outermost.
#[derive(Clone)]
pub struct EngineWithMiddleware {
    engine: Arc<dyn DynEngine>,
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl std::fmt::Debug for EngineWithMiddleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineWithMiddleware")
            .field("middlewares", &self.middlewares.len())
            .finish_non_exhaustive()
    }
}

impl EngineWithMiddleware {
    /// Wraps `engine` with an empty chain.
    pub fn new(engine: Arc<dyn DynEngine>) -> Self {
        Self {
            engine,
            middlewares: Vec::new(),
        }
    }

    /// Appends a middleware (innermost so far).
    #[must_use]
    pub fn with<M: Middleware + 'static>(mut self, middleware: M) -> Self {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    /// Appends a shared middleware.
    #[must_use]
    pub fn with_shared(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    /// Number of middlewares.
    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    /// Whether the chain is empty.
    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }
}

impl Engine for EngineWithMiddleware {
    async fn run_inference(&self, ctx: &InferenceContext, turn: Turn) -> Result<Turn, GeppettoError> {
        Next::new(&self.middlewares, self.engine.as_ref())
            .run(ctx, turn)
            .await
    }
}

// ── Turn logging ───────────────────────────────────────────────────

/// Logs the start and outcome of each inference with block counts.
#[derive(Debug, Clone, Copy, Default)]
pub struct TurnLoggingMiddleware;

fn kind_counts(turn: &Turn) -> HashMap<BlockKind, usize> {
    let mut counts = HashMap::new();
    for block in &turn.blocks {
        *counts.entry(block.kind).or_insert(0) += 1;
    }
    counts
}

impl Middleware for TurnLoggingMiddleware {
    fn handle<'a>(&'a self, ctx: &'a InferenceContext, turn: Turn, next: Next<'a>) -> InferenceFuture<'a> {
        Box::pin(async move {
            let run_id = turn.run_id.clone();
            let turn_id = turn.id.clone();
            info!(
                run_id = %run_id,
                turn_id = %turn_id,
                block_count = turn.blocks.len(),
                "turn: starting inference"
            );

            match next.run(ctx, turn).await {
                Ok(result) => {
                    let counts = kind_counts(&result);
                    let count = |k| counts.get(&k).copied().unwrap_or(0);
                    info!(
                        run_id = %run_id,
                        turn_id = %turn_id,
                        result_block_count = result.blocks.len(),
                        user_blocks = count(BlockKind::User),
                        llm_text_blocks = count(BlockKind::LlmText),
                        tool_call_blocks = count(BlockKind::ToolCall),
                        tool_use_blocks = count(BlockKind::ToolUse),
                        system_blocks = count(BlockKind::System),
                        other_blocks = count(BlockKind::Other),
                        "turn: inference completed"
                    );
                    Ok(result)
                }
                Err(e) => {
                    error!(run_id = %run_id, turn_id = %turn_id, error = %e, "turn: inference failed");
                    Err(e)
                }
            }
        })
    }
}

// ── System prompt ──────────────────────────────────────────────────

/// Makes sure the Turn starts with the configured system prompt.
///
/// The first system block has its text replaced; without one, a new
/// system block is inserted at position 0. Either way the block is
/// tagged `middleware = "systemprompt"`. An empty prompt is a no-op.
#[derive(Debug, Clone)]
pub struct SystemPromptMiddleware {
    prompt: String,
}

impl SystemPromptMiddleware {
    /// Marker value written to block metadata.
    pub const MARKER: &'static str = "systemprompt";

    /// A middleware enforcing `prompt`.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
        }
    }

    fn apply(&self, turn: &mut Turn) {
        if self.prompt.is_empty() {
            return;
        }
        let session_id = turn
            .metadata
            .get(turn_meta::SESSION_ID)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        debug!(
            session_id = %session_id,
            turn_id = %turn.id,
            prompt_len = self.prompt.len(),
            "systemprompt: middleware start"
        );

        if let Some(idx) = turn.blocks.iter().position(|b| b.kind == BlockKind::System) {
            let block = &mut turn.blocks[idx];
            if block.text() == Some(self.prompt.as_str()) {
                debug!(system_idx = idx, "systemprompt: prompt already set on existing system block");
                return;
            }
            block
                .payload
                .insert(crate::turns::keys::TEXT.into(), self.prompt.clone().into());
            block.set_metadata(meta::MIDDLEWARE, Self::MARKER);
            debug!(system_idx = idx, "systemprompt: replaced text on existing system block");
        } else {
            turn.prepend_block(
                Block::system_text(self.prompt.clone()).with_metadata(meta::MIDDLEWARE, Self::MARKER),
            );
            debug!(turn_id = %turn.id, "systemprompt: inserted new system block at beginning");
        }
    }
}

impl Middleware for SystemPromptMiddleware {
    fn handle<'a>(&'a self, ctx: &'a InferenceContext, mut turn: Turn, next: Next<'a>) -> InferenceFuture<'a> {
        Box::pin(async move {
            self.apply(&mut turn);
            next.run(ctx, turn).await
        })
    }
}

// ── Tool result reordering ─────────────────────────────────────────

/// Moves `tool_use` blocks directly after the run of `tool_call` blocks
/// that spawned them, in call order.
///
/// Providers reject conversations where other messages sit between a
/// tool call and its result. Blocks are never dropped; if the rewrite
/// would change the block count the original order is kept.
#[derive(Debug, Clone, Copy, Default)]
pub struct ToolResultReorderMiddleware;

impl ToolResultReorderMiddleware {
    /// The reordered block list.
    pub fn reorder(blocks: &[Block]) -> Vec<Block> {
        let mut moved: HashSet<usize> = HashSet::new();
        let mut out = Vec::with_capacity(blocks.len());
        let mut i = 0;

        while i < blocks.len() {
            if moved.contains(&i) {
                i += 1;
                continue;
            }
            if blocks[i].kind != BlockKind::ToolCall {
                out.push(blocks[i].clone());
                i += 1;
                continue;
            }

            let run_start = i;
            let mut call_ids = Vec::new();
            while i < blocks.len() && blocks[i].kind == BlockKind::ToolCall {
                out.push(blocks[i].clone());
                if let Some(id) = blocks[i].call_id().filter(|id| !id.is_empty()) {
                    call_ids.push(id.to_string());
                }
                i += 1;
            }

            let mut moved_for_run = 0;
            for id in &call_ids {
                for (j, candidate) in blocks.iter().enumerate().skip(run_start + 1) {
                    if candidate.kind == BlockKind::ToolUse
                        && !moved.contains(&j)
                        && candidate.call_id() == Some(id.as_str())
                    {
                        out.push(candidate.clone());
                        moved.insert(j);
                        moved_for_run += 1;
                    }
                }
            }
            if moved_for_run > 0 {
                debug!(moved_tool_use = moved_for_run, start = run_start, "tool-reorder: grouped tool_use after tool_call run");
            }
        }

        if out.len() != blocks.len() {
            warn!(old = blocks.len(), new = out.len(), "tool-reorder: block count changed after reorder; keeping original order");
            return blocks.to_vec();
        }
        out
    }
}

impl Middleware for ToolResultReorderMiddleware {
    fn handle<'a>(&'a self, ctx: &'a InferenceContext, mut turn: Turn, next: Next<'a>) -> InferenceFuture<'a> {
        Box::pin(async move {
            if !turn.blocks.is_empty() {
                let reordered = Self::reorder(&turn.blocks);
                let changed = reordered
                    .iter()
                    .zip(&turn.blocks)
                    .any(|(a, b)| a.id != b.id);
                if changed {
                    debug!("tool-reorder: applied block reordering to satisfy tool adjacency");
                    turn.blocks = reordered;
                }
            }
            next.run(ctx, turn).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockEngine;
    use serde_json::json;

    #[tokio::test]
    async fn test_chain_order_outermost_first() {
        let engine = Arc::new(MockEngine::new());
        engine.push_text("ok");
        let chained = EngineWithMiddleware::new(engine.clone())
            .with(SystemPromptMiddleware::new("first"))
            .with(SystemPromptMiddleware::new("second"));

        let turn = Turn::with_blocks([Block::user_text("hi")]);
        let out = chained
            .run_inference(&InferenceContext::new(), turn)
            .await
            .unwrap();

        // The inner middleware overwrote the outer one's text before the engine ran.
        let seen = &engine.recorded_turns()[0];
        assert_eq!(seen.blocks[0].text(), Some("second"));
        assert_eq!(out.blocks.last().and_then(Block::text), Some("ok"));
    }

    #[tokio::test]
    async fn test_system_prompt_inserts_and_tags() {
        let engine = Arc::new(MockEngine::new());
        engine.push_text("ok");
        let chained = EngineWithMiddleware::new(engine.clone()).with(SystemPromptMiddleware::new("be nice"));
        let out = chained
            .run_inference(&InferenceContext::new(), Turn::with_blocks([Block::user_text("hi")]))
            .await
            .unwrap();
        assert_eq!(out.blocks[0].kind, BlockKind::System);
        assert_eq!(out.blocks[0].metadata[meta::MIDDLEWARE], "systemprompt");
        assert_eq!(out.blocks[1].text(), Some("hi"));
    }

    #[tokio::test]
    async fn test_system_prompt_replaces_first_system_block() {
        let engine = Arc::new(MockEngine::new());
        engine.push_text("ok");
        let chained = EngineWithMiddleware::new(engine).with(SystemPromptMiddleware::new("new"));
        let turn = Turn::with_blocks([
            Block::user_text("hi"),
            Block::system_text("old"),
            Block::system_text("other"),
        ]);
        let out = chained.run_inference(&InferenceContext::new(), turn).await.unwrap();
        assert_eq!(out.blocks[1].text(), Some("new"));
        assert_eq!(out.blocks[2].text(), Some("other"));
        assert_eq!(out.blocks.len(), 4);
    }

    #[test]
    fn test_reorder_groups_results_after_calls() {
        let blocks = vec![
            Block::user_text("q").with_id("u"),
            Block::tool_call("c1", "a", json!({})).with_id("tc1"),
            Block::tool_call("c2", "b", json!({})).with_id("tc2"),
            Block::assistant_text("interleaved").with_id("t"),
            Block::tool_use("c2", json!("r2")).with_id("tu2"),
            Block::tool_use("c1", json!("r1")).with_id("tu1"),
        ];
        let ids: Vec<_> = ToolResultReorderMiddleware::reorder(&blocks)
            .into_iter()
            .map(|b| b.id)
            .collect();
        assert_eq!(ids, vec!["u", "tc1", "tc2", "tu1", "tu2", "t"]);
    }

    #[test]
    fn test_reorder_leaves_orphans_in_place() {
        let blocks = vec![
            Block::tool_use("zz", json!("r")).with_id("orphan"),
            Block::user_text("q").with_id("u"),
        ];
        let ids: Vec<_> = ToolResultReorderMiddleware::reorder(&blocks)
            .into_iter()
            .map(|b| b.id)
            .collect();
        assert_eq!(ids, vec!["orphan", "u"]);
    }

    #[tokio::test]
    async fn test_logging_middleware_passes_errors_through() {
        crate::test_helpers::init_tracing();
        let engine = Arc::new(MockEngine::new());
        engine.push_error(GeppettoError::Auth("bad".into()));
        let chained = EngineWithMiddleware::new(engine).with(TurnLoggingMiddleware);
        let err = chained
            .run_inference(&InferenceContext::new(), Turn::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GeppettoError::Auth(_)));
    }
}
