//! Queue-based fakes for testing code built on engines and toolboxes.
//!
//! [`MockEngine`] replays queued replies without touching the network
//! and records every Turn it was given. [`MockToolbox`] runs closures
//! registered by name.
//!
//! ```rust
//! use std::sync::Arc;
//! use geppetto::mock::MockEngine;
//! use geppetto::{Engine, InferenceContext, Turn};
//!
//! # async fn example() {
//! let engine = MockEngine::new();
//! engine.push_text("Hello!");
//!
//! let turn = engine.run_inference(&InferenceContext::new(), Turn::new()).await.unwrap();
//! assert_eq!(turn.assistant_text(), "Hello!");
//! assert_eq!(engine.call_count(), 1);
//! # }
//! ```

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;

use crate::context::InferenceContext;
use crate::engine::Engine;
use crate::error::GeppettoError;
use crate::events::{Event, EventMetadata, ToolCallPayload};
use crate::tool::{ToolDefinition, ToolError, ToolFuture, ToolHandler, Toolbox, tool_fn};
use crate::turns::{Block, BlockKind, Turn};

enum Reply {
    Blocks(Vec<Block>),
    Error(GeppettoError),
}

/// A queue-based fake engine.
///
/// Each inference pops the next queued reply: blocks are appended to
/// the Turn (publishing `start`, `tool_call` and `final` events like a
/// real engine), errors are returned.
///
/// # Panics
///
/// Inference panics when the queue is empty.
#[derive(Default)]
pub struct MockEngine {
    replies: Mutex<VecDeque<Reply>>,
    calls: Mutex<Vec<Turn>>,
}

impl fmt::Debug for MockEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockEngine")
            .field("queued", &self.replies.lock().unwrap_or_else(PoisonError::into_inner).len())
            .field("calls", &self.call_count())
            .finish()
    }
}

impl MockEngine {
    /// An engine with an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a reply that appends the given blocks.
    pub fn push_blocks(&self, blocks: Vec<Block>) -> &Self {
        self.push(Reply::Blocks(blocks))
    }

    /// Queues a plain assistant text reply.
    pub fn push_text(&self, text: impl Into<String>) -> &Self {
        self.push_blocks(vec![Block::assistant_text(text)])
    }

    /// Queues a reply consisting of one tool call.
    pub fn push_tool_call(&self, id: impl Into<String>, name: impl Into<String>, args: Value) -> &Self {
        self.push_blocks(vec![Block::tool_call(id, name, args)])
    }

    /// Queues an error.
    pub fn push_error(&self, error: GeppettoError) -> &Self {
        self.push(Reply::Error(error))
    }

    /// Every Turn passed to the engine, in call order.
    pub fn recorded_turns(&self) -> Vec<Turn> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Number of inferences run.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn push(&self, reply: Reply) -> &Self {
        self.replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(reply);
        self
    }
}

impl Engine for MockEngine {
    async fn run_inference(&self, ctx: &InferenceContext, mut turn: Turn) -> Result<Turn, GeppettoError> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(turn.clone());
        let reply = self
            .replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .expect("MockEngine: no queued replies remaining");

        let blocks = match reply {
            Reply::Blocks(blocks) => blocks,
            Reply::Error(e) => {
                ctx.publish_event(&Event::error(&e, EventMetadata::default()));
                return Err(e);
            }
        };

        let meta = EventMetadata {
            engine: Some("mock".into()),
            run_id: turn.run_id.clone(),
            turn_id: turn.id.clone(),
            ..EventMetadata::default()
        };
        ctx.publish_event(&Event::start(meta.fresh()));
        for block in &blocks {
            if block.kind == BlockKind::ToolCall {
                ctx.publish_event(&Event::tool_call(
                    ToolCallPayload {
                        id: block.call_id().unwrap_or_default().to_string(),
                        name: block.tool_name().unwrap_or_default().to_string(),
                        input: block.args_json(),
                    },
                    meta.fresh(),
                ));
            }
        }
        turn.append_blocks(blocks);
        ctx.publish_event(&Event::final_text(turn.assistant_text(), meta.fresh()));
        Ok(turn)
    }
}

/// A toolbox backed by closures, for tests.
///
/// Registration takes `&self`, so a shared toolbox can gain tools after
/// it was handed to a middleware. Every execution is recorded.
#[derive(Default)]
pub struct MockToolbox {
    tools: Mutex<HashMap<String, Arc<dyn ToolHandler>>>,
    executions: Mutex<Vec<(String, Value)>>,
}

impl fmt::Debug for MockToolbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockToolbox")
            .field("tools", &self.tool_definitions().len())
            .finish_non_exhaustive()
    }
}

impl MockToolbox {
    /// An empty toolbox.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a synchronous tool.
    pub fn register_tool<F>(&self, name: &str, description: &str, parameters: Value, f: F)
    where
        F: Fn(Value) -> Result<Value, ToolError> + Send + Sync + 'static,
    {
        self.register_async_tool(name, description, parameters, move |args| {
            std::future::ready(f(args))
        });
    }

    /// Registers an async tool.
    pub fn register_async_tool<F, Fut>(&self, name: &str, description: &str, parameters: Value, f: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
    {
        let definition = ToolDefinition::new(name, description).with_parameters(parameters);
        self.tools
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), Arc::new(tool_fn(definition, f)));
    }

    /// Every `(tool name, arguments)` executed, in start order.
    pub fn executions(&self) -> Vec<(String, Value)> {
        self.executions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Toolbox for MockToolbox {
    fn execute_tool<'a>(
        &'a self,
        ctx: &'a InferenceContext,
        name: &'a str,
        arguments: Value,
    ) -> ToolFuture<'a> {
        self.executions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((name.to_string(), arguments.clone()));
        let handler = self
            .tools
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned();
        Box::pin(async move {
            match handler {
                Some(handler) => handler.execute(ctx, arguments).await,
                None => Err(ToolError::NotFound(name.to_string())),
            }
        })
    }

    fn tool_definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<_> = self
            .tools
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|h| h.definition())
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::events::{CollectingSink, EventSink};

    #[tokio::test]
    async fn test_replies_in_order() {
        let engine = MockEngine::new();
        engine.push_text("first").push_error(GeppettoError::Auth("bad key".into()));

        let ctx = InferenceContext::new();
        let turn = engine.run_inference(&ctx, Turn::new()).await.unwrap();
        assert_eq!(turn.assistant_text(), "first");
        let err = engine.run_inference(&ctx, Turn::new()).await.unwrap_err();
        assert!(matches!(err, GeppettoError::Auth(_)));
        assert_eq!(engine.call_count(), 2);
    }

    #[tokio::test]
    async fn test_publishes_events() {
        let engine = MockEngine::new();
        engine.push_tool_call("c1", "search", json!({"q": "x"}));
        let sink = Arc::new(CollectingSink::new());
        let ctx = InferenceContext::new().with_event_sinks([sink.clone() as Arc<dyn EventSink>]);
        engine.run_inference(&ctx, Turn::new()).await.unwrap();
        assert_eq!(sink.event_types(), vec!["start", "tool_call", "final"]);
    }

    #[tokio::test]
    async fn test_mock_toolbox_records_executions() {
        let toolbox = MockToolbox::new();
        toolbox.register_tool("echo", "Echo", json!({}), Ok);
        let ctx = InferenceContext::new();
        let out = toolbox.execute_tool(&ctx, "echo", json!({"v": 1})).await.unwrap();
        assert_eq!(out, json!({"v": 1}));
        let missing = toolbox.execute_tool(&ctx, "nope", json!({})).await.unwrap_err();
        assert_eq!(missing, ToolError::NotFound("nope".into()));
        assert_eq!(toolbox.executions().len(), 2);
    }
}
