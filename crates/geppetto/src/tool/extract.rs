//! Pulls pending tool calls out of the blocks an engine appended.

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::turns::{Block, BlockKind};

/// Metadata key carrying OpenAI-style tool calls on an assistant block.
pub const TOOL_CALLS_METADATA_KEY: &str = "tool_calls";

/// A tool call requested by the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    /// Correlation id echoed in the result block.
    pub id: String,
    /// Tool name.
    pub name: String,
    /// Parsed arguments. Unparseable or empty arguments become `{}`.
    pub arguments: Value,
}

#[derive(Deserialize)]
struct WireToolCall {
    #[serde(default)]
    id: String,
    #[serde(default)]
    function: WireFunction,
}

#[derive(Deserialize, Default)]
struct WireFunction {
    #[serde(default)]
    name: String,
    #[serde(default)]
    arguments: Value,
}

/// Tool calls in `blocks`, in block order.
///
/// Two shapes are recognized:
///
/// - a `tool_call` block (`id`, `name`, `args`);
/// - an assistant `llm_text` block whose metadata holds a `tool_calls`
///   array of `{id, function: {name, arguments}}`, `arguments` being a
///   JSON string.
pub fn extract_tool_calls(blocks: &[Block]) -> Vec<ToolCall> {
    let mut calls = Vec::new();
    for block in blocks {
        match block.kind {
            BlockKind::ToolCall => calls.push(ToolCall {
                id: block.call_id().unwrap_or_default().to_string(),
                name: block.tool_name().unwrap_or_default().to_string(),
                arguments: object_or_empty(block.args_value()),
            }),
            BlockKind::LlmText => {
                let Some(raw) = block.metadata.get(TOOL_CALLS_METADATA_KEY) else {
                    continue;
                };
                let Ok(wire) = serde_json::from_value::<Vec<WireToolCall>>(raw.clone()) else {
                    continue;
                };
                calls.extend(wire.into_iter().map(|c| ToolCall {
                    id: c.id,
                    name: c.function.name,
                    arguments: parse_arguments(&c.function.arguments),
                }));
            }
            _ => {}
        }
    }
    calls
}

fn parse_arguments(raw: &Value) -> Value {
    match raw {
        Value::String(s) => object_or_empty(serde_json::from_str(s).unwrap_or(Value::Null)),
        other => object_or_empty(other.clone()),
    }
}

fn object_or_empty(value: Value) -> Value {
    match value {
        Value::Object(_) => value,
        _ => Value::Object(Map::new()),
    }
}
