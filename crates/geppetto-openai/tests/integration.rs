//! Integration tests against the live `OpenAI` API.
//!
//! These tests require a valid `OPENAI_API_KEY` environment variable.
//! They are skipped (not failed) when the key is not present.
//!
//! Run with:
//! ```sh
//! OPENAI_API_KEY=sk-... cargo test -p geppetto-openai --test integration
//! ```

use std::sync::Arc;

use geppetto::engine::{EngineWithMiddleware, StepSettings};
use geppetto::test_helpers::collecting_context;
use geppetto::tool::{ToolError, ToolMiddleware, tool_fn};
use geppetto::{
    Block, BlockKind, Engine, InferenceContext, ToolConfig, ToolDefinition, ToolRegistry, Turn,
};
use geppetto_openai::{OpenAiConfig, OpenAiEngine, OpenAiResponsesEngine};
use serde_json::{Value, json};

/// Helper: settings and config for integration tests.
/// Returns `None` (and the test is skipped) if no API key is set.
fn test_config() -> Option<(OpenAiConfig, StepSettings)> {
    let api_key = std::env::var("OPENAI_API_KEY").ok()?;
    if api_key.is_empty() {
        return None;
    }
    let mut settings = StepSettings::default();
    settings.chat.max_response_tokens = Some(128);
    Some((
        OpenAiConfig {
            api_key,
            // Use gpt-4o-mini for fast, cheap integration tests
            model: "gpt-4o-mini".into(),
            ..Default::default()
        },
        settings,
    ))
}

fn test_provider() -> Option<OpenAiEngine> {
    let (config, settings) = test_config()?;
    OpenAiEngine::new(config, settings).ok()
}

macro_rules! skip_without_key {
    ($make:expr) => {
        match $make {
            Some(p) => p,
            None => {
                eprintln!("OPENAI_API_KEY not set, skipping integration test");
                return;
            }
        }
    };
    () => {
        skip_without_key!(test_provider())
    };
}

#[tokio::test]
async fn test_simple_inference() {
    let engine = skip_without_key!();

    let (ctx, sink) = collecting_context();
    let turn = engine
        .run_inference(
            &ctx,
            Turn::with_blocks([Block::user_text("What is 2+2? Reply with just the number.")]),
        )
        .await
        .unwrap();

    let text = turn.assistant_text();
    assert!(text.contains('4'), "Expected '4' in response: {text}");
    let types = sink.event_types();
    assert_eq!(types.first().map(String::as_str), Some("start"));
    assert_eq!(types.last().map(String::as_str), Some("final"));
    assert!(sink.events().last().unwrap().meta.usage.is_some());
}

#[tokio::test]
async fn test_system_prompt() {
    let engine = skip_without_key!();

    let turn = engine
        .run_inference(
            &InferenceContext::new(),
            Turn::with_blocks([
                Block::system_text("You are a helpful pirate. Always respond in pirate speak."),
                Block::user_text("What are you?"),
            ]),
        )
        .await
        .unwrap();
    assert!(!turn.assistant_text().is_empty());
}

#[tokio::test]
async fn test_tool_loop() {
    let engine = skip_without_key!();

    let mut tools = ToolRegistry::new();
    tools.register(tool_fn(
        ToolDefinition::new("get_weather", "Get the current weather for a city").with_parameters(json!({
            "type": "object",
            "properties": {"city": {"type": "string"}},
            "required": ["city"]
        })),
        |_args: Value| async move { Ok::<_, ToolError>(json!({"temperature_c": 21, "sky": "clear"})) },
    ));

    let engine = EngineWithMiddleware::new(Arc::new(engine))
        .with(ToolMiddleware::new(Arc::new(tools), ToolConfig::default()));
    let turn = engine
        .run_inference(
            &InferenceContext::new(),
            Turn::with_blocks([Block::user_text(
                "What's the weather in Paris? Use the get_weather tool.",
            )]),
        )
        .await
        .unwrap();

    assert!(!turn.blocks_by_kind(&[BlockKind::ToolCall]).is_empty());
    assert!(!turn.blocks_by_kind(&[BlockKind::ToolUse]).is_empty());
    assert!(!turn.assistant_text().is_empty());
}

#[tokio::test]
async fn test_responses_engine() {
    let engine = skip_without_key!(
        test_config().and_then(|(config, settings)| OpenAiResponsesEngine::new(config, settings).ok())
    );

    let turn = engine
        .run_inference(
            &InferenceContext::new(),
            Turn::with_blocks([Block::user_text("Reply with the single word: pong")]),
        )
        .await
        .unwrap();
    assert!(turn.assistant_text().to_lowercase().contains("pong"));
}
