//! Turn → `generateContent` request conversion.
//!
//! System blocks go to `systemInstruction`. User text, images and tool
//! results are `user` content; assistant text and tool calls are
//! `model` content. Consecutive parts with the same role share one
//! content entry.

use std::collections::HashMap;

use geppetto::GeppettoError;
use geppetto::engine::{InferenceConfig, StepSettings, StructuredOutputConfig};
use geppetto::tool::{GeminiToolAdapter, ToolAdapter, ToolChoice};
use geppetto::turns::{Block, BlockKind, Turn};
use serde_json::{Map, Value, json};
use tracing::warn;

use crate::types::{
    Blob, Content, FileData, FunctionCall, FunctionCallingConfig, FunctionResponse,
    GenerationConfig, Part, Request, Tool, ToolConfigParam,
};

const USER: &str = "user";
const MODEL: &str = "model";

/// JSON Schema keywords the function-declaration schema dialect rejects.
const UNSUPPORTED_SCHEMA_KEYS: &[&str] = &["$schema", "additionalProperties", "$id"];

pub(crate) fn build_request(
    turn: &Turn,
    settings: &StepSettings,
    defaults: Option<&InferenceConfig>,
) -> Result<Request, GeppettoError> {
    let chat = &settings.chat;
    let infer = InferenceConfig::resolve(turn, defaults).unwrap_or_default();

    let (system, contents) = build_contents(&turn.blocks);
    let mut generation_config = GenerationConfig {
        temperature: infer.temperature.or(chat.temperature),
        top_p: infer.top_p.or(chat.top_p),
        top_k: settings.gemini.top_k,
        max_output_tokens: infer.max_response_tokens.or(chat.max_response_tokens),
        candidate_count: settings.gemini.candidate_count,
        stop_sequences: infer.apply_stop(&chat.stop),
        ..GenerationConfig::default()
    };

    let structured = StructuredOutputConfig::resolve(
        chat.structured_output_config()?,
        turn.data.structured_output.as_ref(),
    );
    if let Some(cfg) = StructuredOutputConfig::effective(structured.as_ref())? {
        generation_config.response_mime_type = Some("application/json");
        generation_config.response_json_schema = Some(Value::Object(cfg.schema.clone()));
    }

    let mut request = Request {
        contents,
        system_instruction: system,
        generation_config,
        tools: Vec::new(),
        tool_config: None,
    };

    let (tools, tool_config) = turn.data.advertised_tools();
    if !tools.is_empty() {
        let mut declarations = GeminiToolAdapter.prepare(&tools)?;
        for declaration in &mut declarations {
            if let Some(parameters) = declaration.get_mut("parameters") {
                strip_unsupported_keys(parameters);
            }
        }
        request.tools = vec![Tool {
            function_declarations: declarations,
        }];
        request.tool_config = Some(ToolConfigParam {
            function_calling_config: FunctionCallingConfig {
                mode: match tool_config.tool_choice {
                    ToolChoice::Auto => "AUTO",
                    ToolChoice::None => "NONE",
                    ToolChoice::Required => "ANY",
                },
            },
        });
    }

    Ok(request)
}

/// Removes schema keywords Gemini rejects, recursively.
fn strip_unsupported_keys(schema: &mut Value) {
    match schema {
        Value::Object(map) => {
            for key in UNSUPPORTED_SCHEMA_KEYS {
                map.remove(*key);
            }
            for value in map.values_mut() {
                strip_unsupported_keys(value);
            }
        }
        Value::Array(items) => items.iter_mut().for_each(strip_unsupported_keys),
        _ => {}
    }
}

/// Converts blocks to the system instruction and the content list.
pub(crate) fn build_contents(blocks: &[Block]) -> (Option<Content>, Vec<Content>) {
    let names: HashMap<&str, &str> = blocks
        .iter()
        .filter(|b| b.kind == BlockKind::ToolCall)
        .filter_map(|b| Some((b.call_id()?, b.tool_name()?)))
        .collect();

    let mut system = Vec::new();
    let mut contents: Vec<Content> = Vec::new();
    let mut push = |role: &str, part: Part| match contents.last_mut() {
        Some(last) if last.role.as_deref() == Some(role) => last.parts.push(part),
        _ => contents.push(Content::new(role, vec![part])),
    };

    for block in blocks {
        match block.kind {
            BlockKind::System => {
                if let Some(text) = block.text().filter(|t| !t.trim().is_empty()) {
                    system.push(Part::text(text));
                }
            }
            BlockKind::User => {
                if let Some(text) = block.text().filter(|t| !t.is_empty()) {
                    push(USER, Part::text(text));
                }
                for part in image_parts(block) {
                    push(USER, part);
                }
            }
            BlockKind::LlmText | BlockKind::Other => {
                if let Some(text) = block.text().filter(|t| !t.is_empty()) {
                    push(MODEL, Part::text(text));
                }
            }
            BlockKind::Reasoning => {}
            BlockKind::ToolCall => {
                let mut args = block.args_value();
                if !args.is_object() {
                    warn!(call_id = ?block.call_id(), "functionCall args are not an object; sending {{}}");
                    args = Value::Object(Map::new());
                }
                push(
                    MODEL,
                    Part {
                        function_call: Some(FunctionCall {
                            id: None,
                            name: block.tool_name().unwrap_or_default().to_string(),
                            args,
                        }),
                        ..Part::default()
                    },
                );
            }
            BlockKind::ToolUse => {
                let name = block
                    .call_id()
                    .and_then(|id| names.get(id).copied())
                    .unwrap_or("result");
                push(
                    USER,
                    Part {
                        function_response: Some(FunctionResponse {
                            id: None,
                            name: name.to_string(),
                            response: response_object(block),
                        }),
                        ..Part::default()
                    },
                );
            }
        }
    }

    let system = (!system.is_empty()).then(|| Content {
        role: None,
        parts: system,
    });
    (system, contents)
}

/// A tool result as the object `functionResponse.response` requires.
/// Objects pass through; anything else is wrapped as `{"result": ...}`.
fn response_object(block: &Block) -> Value {
    let rendered = block.result_string();
    match serde_json::from_str::<Value>(&rendered) {
        Ok(Value::Object(map)) => Value::Object(map),
        Ok(other) => json!({ "result": other }),
        Err(_) => json!({ "result": rendered }),
    }
}

fn image_parts(block: &Block) -> Vec<Part> {
    block
        .images()
        .into_iter()
        .filter_map(|img| {
            if let Some(url) = img.url.as_deref().filter(|u| !u.is_empty()) {
                return Some(Part {
                    file_data: Some(FileData {
                        mime_type: img.media_type.clone(),
                        file_uri: url.to_string(),
                    }),
                    ..Part::default()
                });
            }
            img.base64_data().map(|data| Part {
                inline_data: Some(Blob {
                    mime_type: img.media_type.clone(),
                    data,
                }),
                ..Part::default()
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use geppetto::engine::ApiType;
    use geppetto::tool::{ToolConfig, ToolDefinition};
    use geppetto::turns::ImageContent;

    use super::*;

    fn settings() -> StepSettings {
        let mut s = StepSettings::default();
        s.chat.api_type = Some(ApiType::Gemini);
        s.chat.engine = Some("gemini-2.0-flash".into());
        s
    }

    fn body(turn: &Turn, s: &StepSettings) -> Value {
        serde_json::to_value(build_request(turn, s, None).unwrap()).unwrap()
    }

    #[test]
    fn test_roles_and_system_instruction() {
        let turn = Turn::with_blocks([
            Block::system_text("Be brief."),
            Block::user_text("Hi"),
            Block::assistant_text("Hello!"),
            Block::user_text("Bye"),
        ]);
        let json = body(&turn, &settings());
        assert_eq!(json["systemInstruction"], json!({"parts": [{"text": "Be brief."}]}));
        assert_eq!(
            json["contents"],
            json!([
                {"role": "user", "parts": [{"text": "Hi"}]},
                {"role": "model", "parts": [{"text": "Hello!"}]},
                {"role": "user", "parts": [{"text": "Bye"}]}
            ])
        );
        assert!(json.get("generationConfig").is_none());
    }

    #[test]
    fn test_function_call_and_response() {
        let (_, contents) = build_contents(&[
            Block::user_text("Weather?"),
            Block::tool_call("call_1", "get_weather", json!({"city": "Paris"})),
            Block::tool_use("call_1", json!({"temp": 21})),
            Block::tool_call("call_2", "get_time", json!({})),
            Block::tool_use("call_2", json!("noon")),
        ]);
        let json = serde_json::to_value(&contents).unwrap();
        assert_eq!(json[1]["role"], "model");
        assert_eq!(
            json[1]["parts"][0],
            json!({"functionCall": {"name": "get_weather", "args": {"city": "Paris"}}})
        );
        assert_eq!(
            json[2]["parts"][0],
            json!({"functionResponse": {"name": "get_weather", "response": {"temp": 21}}})
        );
        assert_eq!(
            json[4]["parts"][0]["functionResponse"],
            json!({"name": "get_time", "response": {"result": "noon"}})
        );
    }

    #[test]
    fn test_orphan_tool_result_uses_placeholder_name() {
        let (_, contents) = build_contents(&[Block::tool_use("missing", json!(1))]);
        let response = contents[0].parts[0].function_response.as_ref().unwrap();
        assert_eq!(response.name, "result");
        assert_eq!(response.response, json!({"result": 1}));
    }

    #[test]
    fn test_images() {
        let (_, contents) = build_contents(&[Block::user_text_with_images(
            "What is this?",
            &[
                ImageContent::from_bytes("image/png", vec![1, 2, 3]),
                ImageContent::from_url("image/jpeg", "gs://bucket/cat.jpg"),
            ],
        )]);
        let parts = &contents[0].parts;
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[1].inline_data.as_ref().unwrap().data, "AQID");
        assert_eq!(parts[2].file_data.as_ref().unwrap().file_uri, "gs://bucket/cat.jpg");
    }

    #[test]
    fn test_generation_config() {
        let mut s = settings();
        s.chat.temperature = Some(0.2);
        s.chat.max_response_tokens = Some(256);
        s.chat.stop = vec!["END".into()];
        s.gemini.top_k = Some(40);
        s.gemini.candidate_count = Some(1);
        let mut turn = Turn::with_blocks([Block::user_text("Hi")]);
        turn.data.inference_config = Some(InferenceConfig {
            top_p: Some(0.8),
            ..InferenceConfig::default()
        });

        let json = body(&turn, &s);
        assert_eq!(
            json["generationConfig"],
            json!({
                "temperature": 0.2,
                "topP": 0.8,
                "topK": 40,
                "maxOutputTokens": 256,
                "candidateCount": 1,
                "stopSequences": ["END"]
            })
        );
    }

    #[test]
    fn test_tools_are_sanitized() {
        let mut turn = Turn::with_blocks([Block::user_text("Weather?")]);
        turn.data.tools = vec![ToolDefinition::new("get_weather", "Weather").with_parameters(json!({
            "$schema": "http://json-schema.org/draft-07/schema#",
            "type": "object",
            "additionalProperties": false,
            "properties": {"city": {"type": "string"}}
        }))];
        turn.data.tool_config = Some(ToolConfig::default().with_tool_choice(ToolChoice::Required));

        let json = body(&turn, &settings());
        let declaration = &json["tools"][0]["functionDeclarations"][0];
        assert_eq!(declaration["name"], "get_weather");
        assert!(declaration["parameters"].get("$schema").is_none());
        assert!(declaration["parameters"].get("additionalProperties").is_none());
        assert_eq!(declaration["parameters"]["properties"]["city"]["type"], "string");
        assert_eq!(json["toolConfig"], json!({"functionCallingConfig": {"mode": "ANY"}}));
    }
}
