//! Engine behavior against a local mock of the Anthropic API.

use std::sync::Arc;

use geppetto::engine::{EngineWithMiddleware, StepSettings};
use geppetto::events::EventPayload;
use geppetto::test_helpers::{collecting_context, sse_event_body};
use geppetto::tool::{ToolError, ToolMiddleware, tool_fn};
use geppetto::turns::{BlockKind, meta, turn_meta};
use geppetto::{Block, Engine, GeppettoError, ToolConfig, ToolDefinition, ToolRegistry, Turn};
use geppetto_anthropic::{AnthropicConfig, AnthropicEngine};
use serde_json::{Value, json};
use wiremock::matchers::{body_partial_json, body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const MODEL: &str = "claude-3-5-haiku-latest";

fn config(server: &MockServer) -> AnthropicConfig {
    AnthropicConfig {
        api_key: "sk-ant-test".into(),
        model: MODEL.into(),
        base_url: server.uri(),
        ..Default::default()
    }
}

fn engine(server: &MockServer) -> AnthropicEngine {
    AnthropicEngine::new(config(server), StepSettings::default()).unwrap()
}

/// An SSE response naming each event after its `type`.
fn stream(events: &[Value]) -> ResponseTemplate {
    let named: Vec<(&str, Value)> = events
        .iter()
        .map(|e| (e["type"].as_str().unwrap_or_default(), e.clone()))
        .collect();
    ResponseTemplate::new(200).set_body_raw(sse_event_body(&named), "text/event-stream")
}

fn message_start() -> Value {
    json!({
        "type": "message_start",
        "message": {
            "id": "msg_1", "type": "message", "role": "assistant", "model": MODEL,
            "content": [], "stop_reason": null,
            "usage": {"input_tokens": 30, "output_tokens": 1}
        }
    })
}

fn text_block(index: u32, fragments: &[&str]) -> Vec<Value> {
    let mut out = vec![json!({
        "type": "content_block_start", "index": index,
        "content_block": {"type": "text", "text": ""}
    })];
    out.extend(fragments.iter().map(|f| {
        json!({
            "type": "content_block_delta", "index": index,
            "delta": {"type": "text_delta", "text": f}
        })
    }));
    out.push(json!({"type": "content_block_stop", "index": index}));
    out
}

fn tool_block(index: u32, id: &str, name: &str, fragments: &[&str]) -> Vec<Value> {
    let mut out = vec![json!({
        "type": "content_block_start", "index": index,
        "content_block": {"type": "tool_use", "id": id, "name": name, "input": {}}
    })];
    out.extend(fragments.iter().map(|f| {
        json!({
            "type": "content_block_delta", "index": index,
            "delta": {"type": "input_json_delta", "partial_json": f}
        })
    }));
    out.push(json!({"type": "content_block_stop", "index": index}));
    out
}

fn message_end(stop_reason: &str) -> Vec<Value> {
    vec![
        json!({
            "type": "message_delta",
            "delta": {"stop_reason": stop_reason, "stop_sequence": null},
            "usage": {"output_tokens": 12}
        }),
        json!({"type": "message_stop"}),
    ]
}

#[tokio::test]
async fn test_text_tool_text_stream() {
    let server = MockServer::start().await;
    let mut events = vec![message_start(), json!({"type": "ping"})];
    events.extend(text_block(0, &["Here's ", "the result: "]));
    events.extend(tool_block(1, "tool_1", "calculator", &["{\"a\": 2,", " \"b\": 3}"]));
    events.extend(text_block(2, &[" is the sum."]));
    events.extend(message_end("tool_use"));

    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("x-api-key", "sk-ant-test"))
        .and(header("anthropic-version", "2023-06-01"))
        .and(body_partial_json(json!({"model": MODEL, "stream": true, "max_tokens": 1024})))
        .respond_with(stream(&events))
        .expect(1)
        .mount(&server)
        .await;

    let (ctx, sink) = collecting_context();
    let turn = engine(&server)
        .run_inference(&ctx, Turn::with_blocks([Block::user_text("Add 2 and 3")]))
        .await
        .unwrap();

    let types = sink.event_types();
    assert_eq!(types.first().map(String::as_str), Some("start"));
    assert_eq!(types.last().map(String::as_str), Some("final"));
    assert_eq!(types.iter().filter(|t| *t == "start").count(), 1);
    assert_eq!(types.iter().filter(|t| *t == "tool_call").count(), 1);

    let events = sink.events();
    let final_event = events.last().unwrap();
    assert_eq!(
        final_event.payload,
        EventPayload::Final { text: "Here's the result:  is the sum.".into() }
    );
    let usage = final_event.meta.usage.unwrap();
    assert_eq!((usage.input_tokens, usage.output_tokens), (30, 12));
    assert_eq!(final_event.meta.stop_reason.as_deref(), Some("tool_use"));
    assert_eq!(final_event.step.step_type, "claude-messages");

    let tool_call = events
        .iter()
        .find_map(|e| match &e.payload {
            EventPayload::ToolCall { tool_call } => Some(tool_call.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(tool_call.id, "tool_1");
    assert_eq!(tool_call.name, "calculator");

    let kinds: Vec<_> = turn.blocks.iter().map(|b| b.kind).collect();
    assert_eq!(kinds, vec![BlockKind::User, BlockKind::LlmText, BlockKind::ToolCall]);
    assert_eq!(turn.blocks[1].text(), Some("Here's the result:  is the sum."));
    let original = &turn.blocks[1].metadata[meta::CLAUDE_ORIGINAL_CONTENT];
    assert_eq!(original.as_array().map(Vec::len), Some(3));
    assert_eq!(turn.blocks[2].args_value(), json!({"a": 2, "b": 3}));
    assert_eq!(turn.metadata[turn_meta::PROVIDER], "claude");
    assert_eq!(turn.metadata[turn_meta::MODEL], MODEL);
    assert_eq!(turn.metadata[turn_meta::STOP_REASON], "tool_use");
}

#[tokio::test]
async fn test_system_prompt_is_top_level() {
    let server = MockServer::start().await;
    let mut events = vec![message_start()];
    events.extend(text_block(0, &["Arr."]));
    events.extend(message_end("end_turn"));

    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(body_partial_json(json!({
            "system": "You are a pirate.",
            "messages": [{"role": "user", "content": [{"type": "text", "text": "Who are you?"}]}]
        })))
        .respond_with(stream(&events))
        .expect(1)
        .mount(&server)
        .await;

    let turn = engine(&server)
        .run_inference(
            &geppetto::InferenceContext::new(),
            Turn::with_blocks([
                Block::system_text("You are a pirate."),
                Block::user_text("Who are you?"),
            ]),
        )
        .await
        .unwrap();
    assert_eq!(turn.assistant_text(), "Arr.");
}

#[tokio::test]
async fn test_tool_loop_round_trip() {
    let server = MockServer::start().await;

    let mut answer = vec![message_start()];
    answer.extend(text_block(0, &["The result is 8"]));
    answer.extend(message_end("end_turn"));
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(body_string_contains("\"tool_use_id\":\"toolu_1\""))
        .respond_with(stream(&answer))
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;

    let mut call = vec![message_start()];
    call.extend(tool_block(0, "toolu_1", "calculator", &["{\"a\":5,", "\"b\":3}"]));
    call.extend(message_end("tool_use"));
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(body_partial_json(json!({
            "tools": [{"name": "calculator"}],
            "tool_choice": {"type": "auto"}
        })))
        .respond_with(stream(&call))
        .with_priority(2)
        .expect(1)
        .mount(&server)
        .await;

    let mut tools = ToolRegistry::new();
    tools.register(tool_fn(
        ToolDefinition::new("calculator", "Adds a and b").with_parameters(json!({
            "type": "object",
            "properties": {"a": {"type": "number"}, "b": {"type": "number"}},
            "required": ["a", "b"]
        })),
        |args: Value| async move {
            let sum = args["a"].as_i64().unwrap_or(0) + args["b"].as_i64().unwrap_or(0);
            Ok::<_, ToolError>(json!(sum))
        },
    ));

    let engine = EngineWithMiddleware::new(Arc::new(engine(&server)))
        .with(ToolMiddleware::new(Arc::new(tools), ToolConfig::default()));
    let (ctx, sink) = collecting_context();
    let turn = engine
        .run_inference(&ctx, Turn::with_blocks([Block::user_text("What is 5+3?")]))
        .await
        .unwrap();

    let kinds: Vec<_> = turn.blocks.iter().map(|b| b.kind).collect();
    assert_eq!(
        kinds,
        vec![BlockKind::User, BlockKind::ToolCall, BlockKind::ToolUse, BlockKind::LlmText]
    );
    assert_eq!(turn.blocks[1].call_id(), Some("toolu_1"));
    assert_eq!(turn.blocks[2].result_string(), "8");
    assert_eq!(turn.assistant_text(), "The result is 8");
    assert!(sink.event_types().contains(&"tool_call_execution_result".to_string()));
}

#[tokio::test]
async fn test_http_error_publishes_start_and_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "type": "error",
            "error": {"type": "authentication_error", "message": "invalid x-api-key"}
        })))
        .mount(&server)
        .await;

    let (ctx, sink) = collecting_context();
    let err = engine(&server)
        .run_inference(&ctx, Turn::with_blocks([Block::user_text("hi")]))
        .await
        .unwrap_err();

    assert!(matches!(err, GeppettoError::Auth(ref m) if m == "invalid x-api-key"));
    assert_eq!(sink.event_types(), vec!["start", "error"]);
}

#[tokio::test]
async fn test_in_stream_error_is_provider_error() {
    let server = MockServer::start().await;
    let mut events = vec![message_start()];
    events.extend(text_block(0, &["Partial"]));
    events.push(json!({
        "type": "error",
        "error": {"type": "overloaded_error", "message": "Overloaded"}
    }));
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(stream(&events))
        .mount(&server)
        .await;

    let (ctx, sink) = collecting_context();
    let err = engine(&server)
        .run_inference(&ctx, Turn::with_blocks([Block::user_text("hi")]))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        GeppettoError::Provider { ref code, retryable: true, .. } if code == "overloaded_error"
    ));
    let types = sink.event_types();
    assert_eq!(types.first().map(String::as_str), Some("start"));
    assert_eq!(types.last().map(String::as_str), Some("error"));
    assert_eq!(types.iter().filter(|t| *t == "error").count(), 1);
}

#[tokio::test]
async fn test_duplicate_block_index_is_protocol_violation() {
    let server = MockServer::start().await;
    let events = vec![
        message_start(),
        json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}}),
        json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}}),
    ];
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(stream(&events))
        .mount(&server)
        .await;

    let (ctx, sink) = collecting_context();
    let err = engine(&server)
        .run_inference(&ctx, Turn::with_blocks([Block::user_text("hi")]))
        .await
        .unwrap_err();

    assert!(matches!(err, GeppettoError::ProtocolViolation(_)));
    assert_eq!(sink.event_types(), vec!["start", "error"]);
}

#[tokio::test]
async fn test_stream_without_message_start_fails() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(stream(&[json!({"type": "ping"})]))
        .mount(&server)
        .await;

    let (ctx, sink) = collecting_context();
    let err = engine(&server)
        .run_inference(&ctx, Turn::with_blocks([Block::user_text("hi")]))
        .await
        .unwrap_err();

    assert!(matches!(err, GeppettoError::ProtocolViolation(_)));
    assert_eq!(sink.event_types(), vec!["start", "error"]);
}

#[tokio::test]
async fn test_cancelled_context_interrupts() {
    let server = MockServer::start().await;
    let mut events = vec![message_start()];
    events.extend(text_block(0, &["never seen"]));
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(stream(&events))
        .mount(&server)
        .await;

    let (ctx, sink) = collecting_context();
    ctx.cancel();
    let err = engine(&server)
        .run_inference(&ctx, Turn::with_blocks([Block::user_text("hi")]))
        .await
        .unwrap_err();

    assert!(matches!(err, GeppettoError::Cancelled));
    assert_eq!(sink.event_types(), vec!["start", "interrupt"]);
}
