//! Engine behavior against a local mock of the `OpenAI` API.

use std::sync::Arc;

use geppetto::engine::{EngineWithMiddleware, StepSettings};
use geppetto::events::EventPayload;
use geppetto::test_helpers::{collecting_context, sse_data_body, sse_event_body};
use geppetto::tool::{ToolError, ToolMiddleware, tool_fn};
use geppetto::turns::{BlockKind, keys, turn_meta};
use geppetto::{Block, Engine, GeppettoError, ToolConfig, ToolDefinition, ToolRegistry, Turn};
use geppetto_openai::{OpenAiConfig, OpenAiEngine, OpenAiResponsesEngine};
use serde_json::{Value, json};
use wiremock::matchers::{body_partial_json, body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config(server: &MockServer) -> OpenAiConfig {
    OpenAiConfig {
        api_key: "sk-test".into(),
        model: "gpt-4o-mini".into(),
        base_url: server.uri(),
        ..Default::default()
    }
}

fn sse(body: String) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(body, "text/event-stream")
}

fn text_chunk(text: &str) -> Value {
    json!({"model": "gpt-4o-mini", "choices": [{"index": 0, "delta": {"content": text}}]})
}

#[tokio::test]
async fn test_streaming_text_events_and_turn() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .and(body_partial_json(json!({"model": "gpt-4o-mini", "stream": true})))
        .respond_with(sse(sse_data_body(&[
            text_chunk("Hel"),
            text_chunk("lo"),
            json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}]}),
            json!({"choices": [], "usage": {"prompt_tokens": 9, "completion_tokens": 2}}),
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let engine = OpenAiEngine::new(config(&server), StepSettings::default()).unwrap();
    let (ctx, sink) = collecting_context();
    let turn = engine
        .run_inference(&ctx, Turn::with_blocks([Block::user_text("Say hello")]))
        .await
        .unwrap();

    assert_eq!(
        sink.event_types(),
        vec!["start", "partial_completion", "partial_completion", "final"]
    );
    let events = sink.events();
    assert_eq!(
        events[1].payload,
        EventPayload::PartialCompletion { delta: "Hel".into(), completion: "Hel".into() }
    );
    assert_eq!(
        events[2].payload,
        EventPayload::PartialCompletion { delta: "lo".into(), completion: "Hello".into() }
    );
    assert_eq!(events[3].payload, EventPayload::Final { text: "Hello".into() });
    assert_eq!(events[3].meta.usage.unwrap().input_tokens, 9);
    assert_eq!(events[3].meta.stop_reason.as_deref(), Some("stop"));
    assert_eq!(events[0].meta.turn_id, turn.id);

    assert_eq!(turn.blocks.len(), 2);
    assert_eq!(turn.blocks[1].kind, BlockKind::LlmText);
    assert_eq!(turn.blocks[1].text(), Some("Hello"));
    assert_eq!(turn.metadata[turn_meta::PROVIDER], "openai");
    assert_eq!(turn.metadata[turn_meta::STOP_REASON], "stop");
}

#[tokio::test]
async fn test_tool_loop_round_trip() {
    let server = MockServer::start().await;

    // Second request carries the tool result.
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_string_contains("\"tool_call_id\":\"call_1\""))
        .respond_with(sse(sse_data_body(&[
            text_chunk("The result is 8"),
            json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}]}),
        ])))
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({"tools": [{"type": "function", "function": {"name": "calculator"}}]})))
        .respond_with(sse(sse_data_body(&[
            json!({"choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "id": "call_1", "type": "function",
                 "function": {"name": "calculator", "arguments": ""}}
            ]}}]}),
            json!({"choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": "{\"a\":5,"}}
            ]}}]}),
            json!({"choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": "\"b\":3}"}}
            ]}}]}),
            json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "tool_calls"}]}),
        ])))
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

    let engine = OpenAiEngine::new(config(&server), StepSettings::default()).unwrap();
    let engine = EngineWithMiddleware::new(Arc::new(engine))
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
    assert_eq!(turn.blocks[1].args_value(), json!({"a": 5, "b": 3}));
    assert_eq!(turn.blocks[2].call_id(), Some("call_1"));
    assert_eq!(turn.blocks[2].result_string(), "8");
    assert_eq!(turn.assistant_text(), "The result is 8");

    let types = sink.event_types();
    assert!(types.contains(&"tool_call".to_string()));
    assert!(types.contains(&"tool_call_execution_result".to_string()));
}

#[tokio::test]
async fn test_http_error_publishes_error_event() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(401)
                .set_body_json(json!({"error": {"message": "Incorrect API key provided"}})),
        )
        .mount(&server)
        .await;

    let engine = OpenAiEngine::new(config(&server), StepSettings::default()).unwrap();
    let (ctx, sink) = collecting_context();
    let err = engine
        .run_inference(&ctx, Turn::with_blocks([Block::user_text("hi")]))
        .await
        .unwrap_err();

    assert!(matches!(err, GeppettoError::Auth(ref m) if m.contains("Incorrect API key")));
    assert_eq!(sink.event_types(), vec!["start", "error"]);
}

#[tokio::test]
async fn test_cancelled_context_interrupts() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(sse(sse_data_body(&[text_chunk("never seen")])))
        .mount(&server)
        .await;

    let engine = OpenAiEngine::new(config(&server), StepSettings::default()).unwrap();
    let (ctx, sink) = collecting_context();
    ctx.cancel();
    let err = engine
        .run_inference(&ctx, Turn::with_blocks([Block::user_text("hi")]))
        .await
        .unwrap_err();

    assert!(matches!(err, GeppettoError::Cancelled));
    assert_eq!(sink.event_types(), vec!["start", "interrupt"]);
}

#[tokio::test]
async fn test_malformed_chunk_is_response_format_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(sse("data: {not json}\n\n".into()))
        .mount(&server)
        .await;

    let engine = OpenAiEngine::new(config(&server), StepSettings::default()).unwrap();
    let (ctx, sink) = collecting_context();
    let err = engine
        .run_inference(&ctx, Turn::with_blocks([Block::user_text("hi")]))
        .await
        .unwrap_err();

    assert!(matches!(err, GeppettoError::ResponseFormat { ref raw, .. } if raw == "{not json}"));
    assert_eq!(sink.event_types(), vec!["start", "error"]);
}

#[tokio::test]
async fn test_responses_engine_streams_reasoning_and_text() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/responses"))
        .and(body_partial_json(json!({"model": "o3-mini", "include": ["reasoning.encrypted_content"]})))
        .respond_with(sse(sse_event_body(&[
            ("response.created", json!({"response": {"model": "o3-mini", "status": "in_progress"}})),
            ("response.output_item.added", json!({"item": {"type": "reasoning", "id": "rs_1"}})),
            (
                "response.output_item.done",
                json!({"item": {"type": "reasoning", "id": "rs_1", "encrypted_content": "opaque"}}),
            ),
            ("response.output_item.added", json!({"item": {"type": "message", "id": "msg_1"}})),
            ("response.output_text.delta", json!({"delta": "4"})),
            ("response.output_text.delta", json!({"text": {"delta": "2"}})),
            (
                "response.output_item.done",
                json!({"item": {"type": "message", "id": "msg_1",
                                "content": [{"type": "output_text", "text": "42"}]}}),
            ),
            (
                "response.completed",
                json!({"response": {"status": "completed",
                                    "usage": {"input_tokens": 5, "output_tokens": 40}}}),
            ),
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let engine = OpenAiResponsesEngine::new(
        OpenAiConfig {
            model: "o3-mini".into(),
            ..config(&server)
        },
        StepSettings::default(),
    )
    .unwrap();
    let (ctx, sink) = collecting_context();
    let turn = engine
        .run_inference(&ctx, Turn::with_blocks([Block::user_text("6*7?")]))
        .await
        .unwrap();

    let kinds: Vec<_> = turn.blocks.iter().map(|b| b.kind).collect();
    assert_eq!(kinds, vec![BlockKind::User, BlockKind::Reasoning, BlockKind::LlmText]);
    assert_eq!(turn.blocks[1].payload_str(keys::ENCRYPTED_CONTENT), Some("opaque"));
    assert_eq!(turn.blocks[2].text(), Some("42"));
    assert_eq!(turn.blocks[2].payload_str(keys::ITEM_ID), Some("msg_1"));
    assert_eq!(turn.metadata[turn_meta::PROVIDER], "openai-responses");

    let types = sink.event_types();
    assert_eq!(types.first().map(String::as_str), Some("start"));
    assert_eq!(types.last().map(String::as_str), Some("final"));
    assert_eq!(types.iter().filter(|t| *t == "partial_completion").count(), 2);
    assert_eq!(types.iter().filter(|t| *t == "info").count(), 4);
}
