//! Tool execution: timeouts, retries and bounded concurrency.

use std::time::{Duration, Instant};

use futures::{StreamExt, stream};
use rand::Rng;
use serde_json::Value;
use tracing::{debug, warn};

use super::config::{RetryConfig, ToolConfig, ToolErrorHandling};
use super::{ToolCall, ToolError, Toolbox};
use crate::context::InferenceContext;
use crate::events::{Event, EventDispatcher, EventMetadata, ToolCallPayload, ToolResultPayload};

/// Lower bound of the jitter factor applied to retry delays.
const MIN_JITTER_FACTOR: f64 = 0.5;

/// One executed call and its result.
#[derive(Debug)]
pub(crate) struct ToolOutcome {
    pub call: ToolCall,
    pub result: Result<Value, ToolError>,
}

impl ToolOutcome {
    /// The text placed in the `tool_use` block.
    pub fn result_text(&self) -> String {
        render_result(&self.result)
    }
}

/// Renders a tool result for the model: strings pass through, other
/// values are serialized, errors become `Error: <message>`.
pub(crate) fn render_result(result: &Result<Value, ToolError>) -> String {
    match result {
        Ok(Value::String(s)) => s.clone(),
        Ok(other) => other.to_string(),
        Err(e) => e.result_text(),
    }
}

/// Executes `calls`, at most `max_parallel_tools` at a time.
///
/// Outcomes are returned in call order regardless of completion order.
/// Execution events go to `events` and the context sinks.
pub(crate) async fn execute_tool_calls(
    toolbox: &dyn Toolbox,
    ctx: &InferenceContext,
    calls: Vec<ToolCall>,
    config: &ToolConfig,
    meta: &EventMetadata,
    events: &EventDispatcher,
) -> Vec<ToolOutcome> {
    if calls.is_empty() {
        return Vec::new();
    }
    let parallelism = config.effective_parallelism(calls.len());
    debug!(calls = calls.len(), parallelism, "executing tool calls");

    stream::iter(calls)
        .map(|call| execute_one(toolbox, ctx, call, config, meta, events))
        .buffered(parallelism)
        .collect()
        .await
}

async fn execute_one(
    toolbox: &dyn Toolbox,
    ctx: &InferenceContext,
    call: ToolCall,
    config: &ToolConfig,
    meta: &EventMetadata,
    events: &EventDispatcher,
) -> ToolOutcome {
    events.publish(ctx, &Event::tool_call_execute(
        ToolCallPayload {
            id: call.id.clone(),
            name: call.name.clone(),
            input: call.arguments.to_string(),
        },
        meta.fresh(),
    ));

    let start = Instant::now();
    let result = match config.tool_error_handling {
        ToolErrorHandling::Retry => {
            execute_with_retry(toolbox, ctx, &call, config.execution_timeout, &config.retry_config)
                .await
        }
        ToolErrorHandling::Continue | ToolErrorHandling::Abort => {
            execute_once(toolbox, ctx, &call, config.execution_timeout).await
        }
    };
    debug!(
        tool = %call.name,
        call_id = %call.id,
        ok = result.is_ok(),
        elapsed_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
        "tool call finished"
    );

    events.publish(ctx, &Event::tool_call_execution_result(
        ToolResultPayload {
            id: call.id.clone(),
            result: render_result(&result),
        },
        meta.fresh(),
    ));

    ToolOutcome { call, result }
}

/// One attempt under a derived context that is cancelled on timeout.
async fn execute_once(
    toolbox: &dyn Toolbox,
    ctx: &InferenceContext,
    call: &ToolCall,
    timeout: Duration,
) -> Result<Value, ToolError> {
    let child = ctx.child();
    let result = tokio::select! {
        res = tokio::time::timeout(timeout, toolbox.execute_tool(&child, &call.name, call.arguments.clone())) => {
            res.unwrap_or(Err(ToolError::Timeout))
        }
        () = ctx.cancelled() => Err(ToolError::Cancelled),
    };
    child.cancel();
    result
}

async fn execute_with_retry(
    toolbox: &dyn Toolbox,
    ctx: &InferenceContext,
    call: &ToolCall,
    timeout: Duration,
    retry: &RetryConfig,
) -> Result<Value, ToolError> {
    let mut attempt = 0;
    loop {
        match execute_once(toolbox, ctx, call, timeout).await {
            Err(e) if e.is_retryable() && attempt < retry.max_retries => {
                let delay = compute_backoff(retry, attempt);
                warn!(
                    tool = %call.name,
                    attempt = attempt + 1,
                    max_retries = retry.max_retries,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %e,
                    "tool failed, retrying"
                );
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = ctx.cancelled() => return Err(ToolError::Cancelled),
                }
                attempt += 1;
            }
            other => return other,
        }
    }
}

fn compute_backoff(config: &RetryConfig, attempt: u32) -> Duration {
    #[allow(clippy::cast_possible_wrap)]
    let base = config.backoff_base.as_secs_f64() * config.backoff_factor.powi(attempt as i32);
    let jitter = rand::rng().random_range(MIN_JITTER_FACTOR..=1.0);
    Duration::try_from_secs_f64(base * jitter).unwrap_or(Duration::MAX)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::events::{CollectingSink, EventSink};
    use crate::tool::{ToolDefinition, ToolRegistry, tool_fn};

    fn call(id: &str, name: &str) -> ToolCall {
        ToolCall {
            id: id.into(),
            name: name.into(),
            arguments: json!({}),
        }
    }

    fn slow_registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry
            .register(tool_fn(ToolDefinition::new("slow", ""), |_: Value| async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok::<_, ToolError>(json!("slow done"))
            }))
            .register(tool_fn(ToolDefinition::new("fast", ""), |_: Value| async move {
                Ok::<_, ToolError>(json!({"n": 1}))
            }))
            .register(tool_fn(ToolDefinition::new("hang", ""), |_: Value| async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<_, ToolError>(json!(null))
            }));
        registry
    }

    #[tokio::test]
    async fn test_results_keep_call_order() {
        let registry = slow_registry();
        let ctx = InferenceContext::new();
        let calls = vec![call("1", "slow"), call("2", "fast"), call("3", "missing")];
        let outcomes = execute_tool_calls(
            &registry,
            &ctx,
            calls,
            &ToolConfig::default(),
            &EventMetadata::default(),
            &EventDispatcher::default(),
        )
        .await;

        let ids: Vec<_> = outcomes.iter().map(|o| o.call.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
        assert_eq!(outcomes[0].result_text(), "slow done");
        assert_eq!(outcomes[1].result_text(), r#"{"n":1}"#);
        assert_eq!(outcomes[2].result_text(), "Error: tool not found");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_reports_deadline_exceeded() {
        let registry = slow_registry();
        let ctx = InferenceContext::new();
        let config = ToolConfig::default().with_execution_timeout(Duration::from_millis(100));
        let outcomes = execute_tool_calls(
            &registry,
            &ctx,
            vec![call("1", "hang")],
            &config,
            &EventMetadata::default(),
            &EventDispatcher::default(),
        )
        .await;
        assert_eq!(outcomes[0].result, Err(ToolError::Timeout));
        assert_eq!(outcomes[0].result_text(), "Error: context deadline exceeded");
    }

    #[tokio::test]
    async fn test_cancelled_context() {
        let registry = slow_registry();
        let ctx = InferenceContext::new();
        ctx.cancel();
        let outcomes = execute_tool_calls(
            &registry,
            &ctx,
            vec![call("1", "hang")],
            &ToolConfig::default(),
            &EventMetadata::default(),
            &EventDispatcher::default(),
        )
        .await;
        assert_eq!(outcomes[0].result, Err(ToolError::Cancelled));
    }

    #[tokio::test]
    async fn test_execution_events_published() {
        let registry = slow_registry();
        let sink = Arc::new(CollectingSink::new());
        let ctx = InferenceContext::new().with_event_sinks([sink.clone() as Arc<dyn EventSink>]);
        execute_tool_calls(
            &registry,
            &ctx,
            vec![call("1", "fast")],
            &ToolConfig::default(),
            &EventMetadata::default(),
            &EventDispatcher::default(),
        )
        .await;
        assert_eq!(
            sink.event_types(),
            vec!["tool_call_execute", "tool_call_execution_result"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_success() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let mut registry = ToolRegistry::new();
        registry.register(tool_fn(ToolDefinition::new("flaky", ""), move |_: Value| {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ToolError::new("transient"))
                } else {
                    Ok(json!("ok"))
                }
            }
        }));
        let config = ToolConfig::default().with_tool_error_handling(ToolErrorHandling::Retry);
        let outcomes = execute_tool_calls(
            &registry,
            &InferenceContext::new(),
            vec![call("1", "flaky")],
            &config,
            &EventMetadata::default(),
            &EventDispatcher::default(),
        )
        .await;
        assert_eq!(outcomes[0].result_text(), "ok");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up_after_max_retries() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let mut registry = ToolRegistry::new();
        registry.register(tool_fn(ToolDefinition::new("broken", ""), move |_: Value| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Err::<Value, _>(ToolError::new("still broken")) }
        }));
        let config = ToolConfig::default().with_tool_error_handling(ToolErrorHandling::Retry);
        let outcomes = execute_tool_calls(
            &registry,
            &InferenceContext::new(),
            vec![call("1", "broken")],
            &config,
            &EventMetadata::default(),
            &EventDispatcher::default(),
        )
        .await;
        assert_eq!(outcomes[0].result_text(), "Error: still broken");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_backoff_grows_with_jitter_bounds() {
        let config = RetryConfig::default();
        for attempt in 0..3 {
            let delay = compute_backoff(&config, attempt).as_secs_f64();
            let full = 2f64.powi(i32::try_from(attempt).unwrap());
            assert!(delay <= full && delay >= full * MIN_JITTER_FACTOR);
        }
    }
}
