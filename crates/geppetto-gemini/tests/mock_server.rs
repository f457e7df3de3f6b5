//! Engine behavior against a local mock of the Gemini API.

use std::sync::Arc;

use geppetto::engine::{EngineWithMiddleware, StepSettings};
use geppetto::events::EventPayload;
use geppetto::test_helpers::{collecting_context, sse_data_body};
use geppetto::tool::{ToolError, ToolMiddleware, tool_fn};
use geppetto::turns::{BlockKind, turn_meta};
use geppetto::{
    Block, Engine, GeppettoError, InferenceContext, ToolConfig, ToolDefinition, ToolRegistry, Turn,
};
use geppetto_gemini::{GeminiConfig, GeminiEngine};
use serde_json::{Value, json};
use wiremock::matchers::{body_partial_json, body_string_contains, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const MODEL: &str = "gemini-2.0-flash";
const STREAM_PATH: &str = "/v1beta/models/gemini-2.0-flash:streamGenerateContent";

fn engine(server: &MockServer) -> GeminiEngine {
    GeminiEngine::new(
        GeminiConfig {
            api_key: "AIza-test".into(),
            model: MODEL.into(),
            base_url: server.uri(),
            ..Default::default()
        },
        StepSettings::default(),
    )
    .unwrap()
}

fn stream(chunks: &[Value]) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(sse_data_body(chunks), "text/event-stream")
}

fn text_chunk(text: &str) -> Value {
    json!({"candidates": [{"content": {"role": "model", "parts": [{"text": text}]}, "index": 0}]})
}

fn finish_chunk(reason: &str) -> Value {
    json!({
        "candidates": [{"content": {"role": "model", "parts": []}, "finishReason": reason, "index": 0}],
        "usageMetadata": {"promptTokenCount": 9, "candidatesTokenCount": 4, "totalTokenCount": 13},
        "modelVersion": "gemini-2.0-flash-001"
    })
}

#[tokio::test]
async fn test_text_stream() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(STREAM_PATH))
        .and(query_param("alt", "sse"))
        .and(header("x-goog-api-key", "AIza-test"))
        .and(body_partial_json(json!({
            "systemInstruction": {"parts": [{"text": "Be brief."}]},
            "contents": [{"role": "user", "parts": [{"text": "Hi"}]}]
        })))
        .respond_with(stream(&[text_chunk("Hel"), text_chunk("lo!"), finish_chunk("STOP")]))
        .expect(1)
        .mount(&server)
        .await;

    let (ctx, sink) = collecting_context();
    let turn = engine(&server)
        .run_inference(
            &ctx,
            Turn::with_blocks([Block::system_text("Be brief."), Block::user_text("Hi")]),
        )
        .await
        .unwrap();

    assert_eq!(
        sink.event_types(),
        vec!["start", "partial_completion", "partial_completion", "final"]
    );
    let events = sink.events();
    assert_eq!(
        events[2].payload,
        EventPayload::PartialCompletion { delta: "lo!".into(), completion: "Hello!".into() }
    );
    let final_event = events.last().unwrap();
    assert_eq!(final_event.payload, EventPayload::Final { text: "Hello!".into() });
    assert_eq!(final_event.meta.stop_reason.as_deref(), Some("STOP"));
    let usage = final_event.meta.usage.unwrap();
    assert_eq!((usage.input_tokens, usage.output_tokens), (9, 4));
    assert_eq!(final_event.step.step_type, "gemini-generate");

    assert_eq!(turn.assistant_text(), "Hello!");
    assert_eq!(turn.metadata[turn_meta::PROVIDER], "gemini");
    assert_eq!(turn.metadata[turn_meta::MODEL], "gemini-2.0-flash-001");
    assert_eq!(turn.metadata[turn_meta::STOP_REASON], "STOP");
}

#[tokio::test]
async fn test_tool_loop_round_trip() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(STREAM_PATH))
        .and(body_string_contains("functionResponse"))
        .respond_with(stream(&[text_chunk("The result is 8"), finish_chunk("STOP")]))
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path(STREAM_PATH))
        .and(body_partial_json(json!({
            "tools": [{"functionDeclarations": [{"name": "calculator"}]}],
            "toolConfig": {"functionCallingConfig": {"mode": "AUTO"}}
        })))
        .respond_with(stream(&[
            json!({"candidates": [{"content": {"role": "model", "parts": [
                {"functionCall": {"id": "fc_1", "name": "calculator", "args": {"a": 5, "b": 3}}}
            ]}, "index": 0}]}),
            finish_chunk("STOP"),
        ]))
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
    assert_eq!(turn.blocks[1].call_id(), Some("fc_1"));
    assert_eq!(turn.blocks[2].result_string(), "8");
    assert_eq!(turn.assistant_text(), "The result is 8");

    let tool_call = sink
        .events()
        .iter()
        .find_map(|e| match &e.payload {
            EventPayload::ToolCall { tool_call } => Some(tool_call.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(tool_call.name, "calculator");
    assert_eq!(serde_json::from_str::<Value>(&tool_call.input).unwrap(), json!({"a": 5, "b": 3}));
}

#[tokio::test]
async fn test_http_error_publishes_start_and_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(STREAM_PATH))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": {"code": 400, "message": "API key not valid.", "status": "INVALID_ARGUMENT"}
        })))
        .mount(&server)
        .await;

    let (ctx, sink) = collecting_context();
    let err = engine(&server)
        .run_inference(&ctx, Turn::with_blocks([Block::user_text("hi")]))
        .await
        .unwrap_err();

    assert!(matches!(err, GeppettoError::InvalidRequest(ref m) if m == "API key not valid."));
    assert_eq!(sink.event_types(), vec!["start", "error"]);
}

#[tokio::test]
async fn test_in_stream_error_is_provider_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(STREAM_PATH))
        .respond_with(stream(&[
            text_chunk("Partial"),
            json!({"error": {"code": 503, "message": "The model is overloaded.", "status": "UNAVAILABLE"}}),
        ]))
        .mount(&server)
        .await;

    let (ctx, sink) = collecting_context();
    let err = engine(&server)
        .run_inference(&ctx, Turn::with_blocks([Block::user_text("hi")]))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        GeppettoError::Provider { ref code, retryable: true, .. } if code == "UNAVAILABLE"
    ));
    assert_eq!(sink.event_types(), vec!["start", "partial_completion", "error"]);
}

#[tokio::test]
async fn test_malformed_chunk_is_response_format_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(STREAM_PATH))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw("data: {not json\n\n", "text/event-stream"),
        )
        .mount(&server)
        .await;

    let err = engine(&server)
        .run_inference(&InferenceContext::new(), Turn::with_blocks([Block::user_text("hi")]))
        .await
        .unwrap_err();
    assert!(matches!(err, GeppettoError::ResponseFormat { ref raw, .. } if raw == "{not json"));
}

#[tokio::test]
async fn test_cancelled_context_interrupts() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(STREAM_PATH))
        .respond_with(stream(&[text_chunk("never seen")]))
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
