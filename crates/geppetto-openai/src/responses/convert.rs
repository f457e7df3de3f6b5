//! Turn → Responses request conversion.
//!
//! Reasoning items are only valid when immediately followed by the
//! output they justify (an assistant message or a function call). Only
//! the latest reasoning block is replayed, and only when its follower
//! is such an item; the follower message is then sent as an item with
//! its original id.

use geppetto::GeppettoError;
use geppetto::engine::{InferenceConfig, StepSettings, StructuredOutputConfig};
use geppetto::tool::{OpenAiResponsesToolAdapter, ToolAdapter};
use geppetto::turns::{Block, BlockKind, Turn, keys};
use serde_json::Value;

use super::types::{InputItem, InputPart, ReasoningParam, ResponsesRequest, TextConfig, TextFormat};
use crate::convert::is_reasoning_model;

/// Normalizes a reasoning effort to `low`, `medium` or `high`; anything
/// unrecognized means `medium`.
pub(crate) fn map_effort(effort: &str) -> &'static str {
    match effort.trim().to_lowercase().as_str() {
        "low" => "low",
        "high" => "high",
        _ => "medium",
    }
}

/// Builds the streaming request for `turn`.
pub(crate) fn build_request(
    turn: &Turn,
    model: &str,
    settings: &StepSettings,
    defaults: Option<&InferenceConfig>,
) -> Result<ResponsesRequest, GeppettoError> {
    let chat = &settings.chat;
    let infer = InferenceConfig::resolve(turn, defaults).unwrap_or_default();
    let openai = turn.data.openai_inference_config.clone().unwrap_or_default();
    let sampling = !is_reasoning_model(model);

    let effort = infer
        .reasoning_effort
        .as_deref()
        .or(settings.openai.reasoning_effort.as_deref())
        .map(map_effort);
    let summary = infer
        .reasoning_summary
        .clone()
        .or_else(|| settings.openai.reasoning_summary.clone())
        .filter(|s| !s.trim().is_empty());
    let reasoning = (effort.is_some() || summary.is_some()).then_some(ReasoningParam { effort, summary });

    let mut include = Vec::new();
    if settings.openai.include_reasoning_encrypted || is_reasoning_model(model) {
        include.push("reasoning.encrypted_content");
    }

    let mut request = ResponsesRequest {
        model: model.to_string(),
        input: build_input(&turn.blocks),
        text: None,
        max_output_tokens: infer.max_response_tokens.or(chat.max_response_tokens),
        temperature: infer.temperature.or(chat.temperature).filter(|_| sampling),
        top_p: infer.top_p.or(chat.top_p).filter(|_| sampling),
        reasoning,
        stream: true,
        include,
        tools: Vec::new(),
        tool_choice: None,
        parallel_tool_calls: None,
        store: openai.store.or(settings.openai.store),
        service_tier: openai
            .service_tier
            .clone()
            .or_else(|| settings.openai.service_tier.clone()),
    };

    let structured = StructuredOutputConfig::resolve(
        chat.structured_output_config()?,
        turn.data.structured_output.as_ref(),
    );
    if let Some(cfg) = StructuredOutputConfig::effective(structured.as_ref())? {
        request.text = Some(TextConfig {
            format: TextFormat {
                format_type: "json_schema",
                name: cfg.name.clone(),
                description: cfg.description.clone(),
                schema: Value::Object(cfg.schema.clone()),
                strict: cfg.strict_or_default(),
            },
        });
    }

    let (tools, tool_config) = turn.data.advertised_tools();
    if !tools.is_empty() {
        request.tools = OpenAiResponsesToolAdapter.prepare(&tools)?;
        request.tool_choice = Some(tool_config.tool_choice.as_str());
        request.parallel_tool_calls = match tool_config.max_parallel_tools {
            0 => None,
            1 => Some(false),
            _ => Some(true),
        };
    }

    Ok(request)
}

/// Converts blocks to `input` items.
pub(crate) fn build_input(blocks: &[Block]) -> Vec<InputItem> {
    let latest_reasoning = blocks.iter().rposition(|b| b.kind == BlockKind::Reasoning);
    let replayed = latest_reasoning.filter(|&i| {
        blocks.get(i + 1).is_some_and(|next| match next.kind {
            BlockKind::LlmText => next.text().is_some_and(|t| !t.trim().is_empty()),
            BlockKind::ToolCall => true,
            _ => false,
        })
    });

    let mut items = Vec::new();
    for (i, block) in blocks.iter().enumerate() {
        match block.kind {
            BlockKind::Reasoning => {
                if Some(i) == replayed {
                    items.push(reasoning_item(block));
                }
            }
            BlockKind::ToolCall => {
                let (Some(call_id), Some(name)) = (block.call_id(), block.tool_name()) else {
                    continue;
                };
                if call_id.is_empty() || name.is_empty() {
                    continue;
                }
                items.push(InputItem::FunctionCall {
                    id: item_id(block),
                    call_id: call_id.to_string(),
                    name: name.to_string(),
                    arguments: block.args_json(),
                });
            }
            BlockKind::ToolUse => {
                if let Some(call_id) = block.call_id().filter(|id| !id.is_empty()) {
                    items.push(InputItem::FunctionCallOutput {
                        call_id: call_id.to_string(),
                        output: block.result_string(),
                    });
                }
            }
            BlockKind::LlmText if replayed.is_some_and(|r| r + 1 == i) => {
                if let Some(text) = block.text() {
                    items.push(InputItem::Message {
                        id: item_id(block),
                        role: "assistant",
                        content: vec![InputPart::OutputText { text: text.to_string() }],
                    });
                }
            }
            BlockKind::User | BlockKind::System | BlockKind::LlmText | BlockKind::Other => {
                if let Some(item) = message_item(block) {
                    items.push(item);
                }
            }
        }
    }
    items
}

fn message_item(block: &Block) -> Option<InputItem> {
    let text = block.text().filter(|t| !t.trim().is_empty())?;
    let (role, part) = match block.kind {
        BlockKind::System => ("system", InputPart::InputText { text: text.to_string() }),
        BlockKind::User => ("user", InputPart::InputText { text: text.to_string() }),
        _ => ("assistant", InputPart::OutputText { text: text.to_string() }),
    };
    Some(InputItem::Message {
        id: None,
        role,
        content: vec![part],
    })
}

fn reasoning_item(block: &Block) -> InputItem {
    InputItem::Reasoning {
        id: item_id(block).unwrap_or_else(|| block.id.clone()),
        summary: Vec::new(),
        encrypted_content: block
            .payload_str(keys::ENCRYPTED_CONTENT)
            .filter(|c| !c.is_empty())
            .map(str::to_string),
    }
}

fn item_id(block: &Block) -> Option<String> {
    block
        .payload_str(keys::ITEM_ID)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}
