//! The tool-calling loop.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use super::config::{ToolConfig, ToolErrorHandling};
use super::execution::execute_tool_calls;
use super::{ToolCall, Toolbox, extract_tool_calls};
use crate::context::InferenceContext;
use crate::engine::{InferenceFuture, Middleware, Next};
use crate::error::GeppettoError;
use crate::events::{EventDispatcher, EventMetadata, EventSink};
use crate::turns::{Block, Turn};

/// Runs the engine, executes the tool calls it emits, feeds the results
/// back and repeats until the model answers without tool calls.
///
/// Per iteration:
///
/// 1. run the rest of the chain;
/// 2. extract tool calls from the blocks it appended;
/// 3. drop calls rejected by the allow-list (they get no result block);
/// 4. execute the rest under the per-call timeout, at most
///    `max_parallel_tools` at a time;
/// 5. append one `tool_use` block per executed call, in call order.
///
/// Tool failures become `Error: <message>` results unless the policy is
/// [`ToolErrorHandling::Abort`]. After `max_iterations` engine calls
/// that all produced tool calls the loop fails with
/// [`GeppettoError::ToolLoopExceeded`].
///
/// The policy comes from the Turn's `tool_config` when present, else
/// from the middleware's own config. When the Turn advertises no tools,
/// the toolbox's (allow-listed) definitions are attached.
///
/// `tool_call_execute` and `tool_call_execution_result` go to the sinks
/// added with [`ToolMiddleware::with_event_sink`] and to the context's
/// sinks. An engine's own sinks do not see them.
///
/// ```rust,ignore
/// let engine = EngineWithMiddleware::new(engine)
///     .with(ToolMiddleware::new(Arc::new(registry), ToolConfig::default()));
/// let turn = engine.run_inference(&ctx, turn).await?;
/// ```
pub struct ToolMiddleware {
    toolbox: Arc<dyn Toolbox>,
    config: ToolConfig,
    dispatcher: EventDispatcher,
}

impl std::fmt::Debug for ToolMiddleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolMiddleware")
            .field("config", &self.config)
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

impl ToolMiddleware {
    /// A loop over `toolbox` with a default policy.
    pub fn new(toolbox: Arc<dyn Toolbox>, config: ToolConfig) -> Self {
        Self {
            toolbox,
            config,
            dispatcher: EventDispatcher::default(),
        }
    }

    /// Adds a sink for the loop's execution events.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.dispatcher.add_sink(sink);
        self
    }

    /// The default policy.
    pub fn config(&self) -> &ToolConfig {
        &self.config
    }

    async fn run_loop<'a>(
        &'a self,
        ctx: &'a InferenceContext,
        mut turn: Turn,
        next: Next<'a>,
    ) -> Result<Turn, GeppettoError> {
        let config = turn
            .data
            .tool_config
            .clone()
            .unwrap_or_else(|| self.config.clone());

        if !config.enabled {
            debug!("tools disabled, single inference");
            return next.run(ctx, turn).await;
        }
        if turn.data.tools.is_empty() {
            turn.data.tools = config.filter_tools(&self.toolbox.tool_definitions());
        }
        if turn.data.tool_config.is_none() {
            turn.data.tool_config = Some(config.clone());
        }

        let meta = EventMetadata {
            run_id: turn.run_id.clone(),
            turn_id: turn.id.clone(),
            ..EventMetadata::default()
        };

        for iteration in 1..=config.max_iterations {
            if ctx.is_cancelled() {
                return Err(GeppettoError::Cancelled);
            }
            debug!(iteration, max_iterations = config.max_iterations, "tool loop iteration");

            let seen = turn.blocks.len();
            turn = next.run(ctx, turn).await?;
            let calls = extract_tool_calls(turn.blocks.get(seen..).unwrap_or_default());
            if calls.is_empty() {
                debug!(iteration, "no tool calls, loop complete");
                return Ok(turn);
            }

            let (allowed, blocked): (Vec<ToolCall>, Vec<ToolCall>) = calls
                .into_iter()
                .partition(|call| config.is_tool_allowed(&call.name));
            if !blocked.is_empty() {
                let names: Vec<_> = blocked.iter().map(|c| c.name.as_str()).collect();
                warn!(tools = ?names, "dropping tool calls outside the allow-list");
            }
            if allowed.is_empty() {
                continue;
            }

            info!(iteration, calls = allowed.len(), "executing tool calls");
            let outcomes = execute_tool_calls(
                self.toolbox.as_ref(),
                ctx,
                allowed,
                &config,
                &meta,
                &self.dispatcher,
            )
            .await;

            if config.tool_error_handling == ToolErrorHandling::Abort {
                if let Some((call, err)) = outcomes
                    .iter()
                    .find_map(|o| o.result.as_ref().err().map(|e| (&o.call, e)))
                {
                    return Err(GeppettoError::ToolAborted {
                        tool_name: call.name.clone(),
                        message: err.to_string(),
                    });
                }
            }

            for outcome in outcomes {
                let text = outcome.result_text();
                turn.append_block(Block::tool_use(outcome.call.id, Value::String(text)));
            }
        }

        warn!(max_iterations = config.max_iterations, "tool loop exceeded its iteration cap");
        Err(GeppettoError::ToolLoopExceeded {
            max_iterations: config.max_iterations,
        })
    }
}

impl Middleware for ToolMiddleware {
    fn handle<'a>(&'a self, ctx: &'a InferenceContext, turn: Turn, next: Next<'a>) -> InferenceFuture<'a> {
        Box::pin(self.run_loop(ctx, turn, next))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::engine::{Engine, EngineWithMiddleware};
    use crate::events::CollectingSink;
    use crate::mock::{MockEngine, MockToolbox};
    use crate::test_helpers::collecting_context;
    use crate::turns::BlockKind;

    fn toolbox() -> Arc<MockToolbox> {
        let toolbox = MockToolbox::new();
        toolbox.register_tool("calculator", "Adds two numbers", json!({}), |args| {
            let a = args["a"].as_i64().unwrap_or(0);
            let b = args["b"].as_i64().unwrap_or(0);
            Ok(json!(a + b))
        });
        toolbox.register_tool("fails", "Always fails", json!({}), |_| {
            Err(crate::tool::ToolError::new("kaput"))
        });
        Arc::new(toolbox)
    }

    fn chain(engine: &Arc<MockEngine>, config: ToolConfig) -> EngineWithMiddleware {
        EngineWithMiddleware::new(engine.clone()).with(ToolMiddleware::new(toolbox(), config))
    }

    #[tokio::test]
    async fn test_single_round_trip() {
        let engine = Arc::new(MockEngine::new());
        engine.push_tool_call("call_1", "calculator", json!({"a": 5, "b": 3}));
        engine.push_text("The result is 8");

        let out = chain(&engine, ToolConfig::default())
            .run_inference(&InferenceContext::new(), Turn::with_blocks([Block::user_text("5+3?")]))
            .await
            .unwrap();

        let kinds: Vec<_> = out.blocks.iter().map(|b| b.kind).collect();
        assert_eq!(
            kinds,
            vec![BlockKind::User, BlockKind::ToolCall, BlockKind::ToolUse, BlockKind::LlmText]
        );
        assert_eq!(out.blocks[2].call_id(), Some("call_1"));
        assert_eq!(out.blocks[2].result_string(), "8");
        assert_eq!(engine.call_count(), 2);
    }

    #[tokio::test]
    async fn test_tools_attached_when_missing() {
        let engine = Arc::new(MockEngine::new());
        engine.push_text("no tools needed");
        chain(&engine, ToolConfig::default())
            .run_inference(&InferenceContext::new(), Turn::new())
            .await
            .unwrap();
        let seen = &engine.recorded_turns()[0];
        let names: Vec<_> = seen.data.tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["calculator", "fails"]);
        assert!(seen.data.tool_config.is_some());
    }

    #[tokio::test]
    async fn test_iteration_cap() {
        let engine = Arc::new(MockEngine::new());
        for i in 0..5 {
            engine.push_tool_call(format!("c{i}"), "calculator", json!({}));
        }
        let err = chain(&engine, ToolConfig::default().with_max_iterations(3))
            .run_inference(&InferenceContext::new(), Turn::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GeppettoError::ToolLoopExceeded { max_iterations: 3 }));
        assert_eq!(engine.call_count(), 3);
    }

    #[tokio::test]
    async fn test_blocked_call_is_not_executed() {
        let engine = Arc::new(MockEngine::new());
        engine.push_tool_call("c1", "fails", json!({}));
        engine.push_text("ok then");
        let out = chain(&engine, ToolConfig::default().with_allowed_tools(["calculator"]))
            .run_inference(&InferenceContext::new(), Turn::new())
            .await
            .unwrap();
        assert!(out.blocks_by_kind(&[BlockKind::ToolUse]).is_empty());
        assert_eq!(engine.call_count(), 2);
    }

    #[tokio::test]
    async fn test_tool_error_becomes_result_text() {
        let engine = Arc::new(MockEngine::new());
        engine.push_tool_call("c1", "fails", json!({}));
        engine.push_tool_call("c2", "unknown_tool", json!({}));
        engine.push_text("sorry");
        let out = chain(&engine, ToolConfig::default())
            .run_inference(&InferenceContext::new(), Turn::new())
            .await
            .unwrap();
        let results: Vec<_> = out
            .blocks_by_kind(&[BlockKind::ToolUse])
            .into_iter()
            .map(Block::result_string)
            .collect();
        assert_eq!(results, vec!["Error: kaput", "Error: tool not found"]);
    }

    #[tokio::test]
    async fn test_abort_policy_surfaces_tool_error() {
        let engine = Arc::new(MockEngine::new());
        engine.push_tool_call("c1", "fails", json!({}));
        let config = ToolConfig::default().with_tool_error_handling(ToolErrorHandling::Abort);
        let err = chain(&engine, config)
            .run_inference(&InferenceContext::new(), Turn::new())
            .await
            .unwrap_err();
        match err {
            GeppettoError::ToolAborted { tool_name, message } => {
                assert_eq!(tool_name, "fails");
                assert_eq!(message, "kaput");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_turn_tool_config_overrides_default() {
        let engine = Arc::new(MockEngine::new());
        engine.push_tool_call("c1", "calculator", json!({}));
        engine.push_tool_call("c2", "calculator", json!({}));
        let mut turn = Turn::new();
        turn.data.tool_config = Some(ToolConfig::default().with_max_iterations(1));
        let err = chain(&engine, ToolConfig::default())
            .run_inference(&InferenceContext::new(), turn)
            .await
            .unwrap_err();
        assert!(matches!(err, GeppettoError::ToolLoopExceeded { max_iterations: 1 }));
        assert_eq!(engine.call_count(), 1);
    }

    #[tokio::test]
    async fn test_disabled_runs_once() {
        let engine = Arc::new(MockEngine::new());
        engine.push_tool_call("c1", "calculator", json!({}));
        let out = chain(&engine, ToolConfig::default().with_enabled(false))
            .run_inference(&InferenceContext::new(), Turn::new())
            .await
            .unwrap();
        assert_eq!(out.blocks.len(), 1);
        assert!(out.data.tools.is_empty());
    }

    #[tokio::test]
    async fn test_configured_sink_sees_execution_events() {
        let engine = Arc::new(MockEngine::new());
        engine.push_tool_call("c1", "calculator", json!({"a": 1, "b": 2}));
        engine.push_text("3");
        let configured = Arc::new(CollectingSink::new());
        let (ctx, ambient) = collecting_context();

        EngineWithMiddleware::new(engine.clone())
            .with(
                ToolMiddleware::new(toolbox(), ToolConfig::default())
                    .with_event_sink(configured.clone()),
            )
            .run_inference(&ctx, Turn::new())
            .await
            .unwrap();

        assert_eq!(
            configured.event_types(),
            vec!["tool_call_execute", "tool_call_execution_result"]
        );
        let ambient = ambient.event_types();
        assert!(ambient.iter().any(|t| t == "tool_call_execute"));
        assert!(ambient.iter().any(|t| t == "tool_call_execution_result"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_tool_times_out() {
        let engine = Arc::new(MockEngine::new());
        engine.push_tool_call("c1", "sleepy", json!({}));
        engine.push_text("done");
        let toolbox = MockToolbox::new();
        toolbox.register_async_tool("sleepy", "", json!({}), |_| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, crate::tool::ToolError>(json!("late"))
        });
        let config = ToolConfig::default().with_execution_timeout(Duration::from_secs(1));
        let out = EngineWithMiddleware::new(engine.clone())
            .with(ToolMiddleware::new(Arc::new(toolbox), config))
            .run_inference(&InferenceContext::new(), Turn::new())
            .await
            .unwrap();
        let result = out.blocks_by_kind(&[BlockKind::ToolUse])[0].result_string();
        assert_eq!(result, "Error: context deadline exceeded");
    }
}
