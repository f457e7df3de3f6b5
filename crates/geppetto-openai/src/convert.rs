//! Turn → Chat Completions request conversion.
//!
//! Chat Completions requires every assistant message carrying
//! `tool_calls` to be followed directly by one `tool` message per call.
//! Turns do not guarantee that layout (a user or system block may sit
//! between a `tool_call` and its `tool_use`), so chat messages seen
//! while a tool-call group is open are held back and emitted once the
//! group's results are in.

use std::collections::HashSet;

use geppetto::GeppettoError;
use geppetto::engine::{InferenceConfig, StepSettings, StructuredOutputConfig};
use geppetto::tool::{OpenAiToolAdapter, ToolAdapter};
use geppetto::turns::{Block, BlockKind, Turn, keys};
use serde_json::Value;
use tracing::debug;

use crate::types::{
    ContentPart, FunctionCallRequest, ImageUrl, JsonSchemaFormat, Message, MessageContent, Request,
    ResponseFormat, StreamOptions, ToolCallRequest,
};

/// Whether `model` belongs to a reasoning family (`o1`, `o3`, `o4`,
/// `gpt-5`). Those take `max_completion_tokens` and reject sampling
/// parameters.
pub(crate) fn is_reasoning_model(model: &str) -> bool {
    let m = model.trim().to_lowercase();
    ["o1", "o3", "o4", "gpt-5"].iter().any(|p| m.starts_with(p))
}

/// Builds the streaming request for `turn`.
///
/// Sampling values resolve turn override → `defaults` → settings.
pub(crate) fn build_request(
    turn: &Turn,
    model: &str,
    settings: &StepSettings,
    defaults: Option<&InferenceConfig>,
) -> Result<Request, GeppettoError> {
    let chat = &settings.chat;
    let infer = InferenceConfig::resolve(turn, defaults).unwrap_or_default();
    let openai = turn.data.openai_inference_config.clone().unwrap_or_default();

    let mut request = Request {
        model: model.to_string(),
        messages: build_messages(&turn.blocks),
        max_tokens: infer.max_response_tokens.or(chat.max_response_tokens),
        max_completion_tokens: None,
        temperature: infer.temperature.or(chat.temperature),
        top_p: infer.top_p.or(chat.top_p),
        n: openai.n.or(settings.openai.n),
        presence_penalty: openai.presence_penalty.or(settings.openai.presence_penalty),
        frequency_penalty: openai.frequency_penalty.or(settings.openai.frequency_penalty),
        seed: infer.seed,
        stop: infer.apply_stop(&chat.stop),
        stream: true,
        stream_options: (!model.to_lowercase().contains("mistral"))
            .then_some(StreamOptions { include_usage: true }),
        tools: Vec::new(),
        tool_choice: None,
        parallel_tool_calls: None,
        response_format: None,
    };

    if is_reasoning_model(model) {
        request.max_completion_tokens = request.max_tokens.take();
        request.temperature = None;
        request.top_p = None;
        request.presence_penalty = None;
        request.frequency_penalty = None;
        request.n = None;
    }

    let structured = StructuredOutputConfig::resolve(
        chat.structured_output_config()?,
        turn.data.structured_output.as_ref(),
    );
    if let Some(cfg) = StructuredOutputConfig::effective(structured.as_ref())? {
        request.response_format = Some(ResponseFormat {
            format_type: "json_schema",
            json_schema: JsonSchemaFormat {
                name: cfg.name.clone(),
                description: cfg.description.clone(),
                schema: Value::Object(cfg.schema.clone()),
                strict: cfg.strict_or_default(),
            },
        });
    }

    let (tools, tool_config) = turn.data.advertised_tools();
    if !tools.is_empty() {
        request.tools = OpenAiToolAdapter.prepare(&tools)?;
        request.tool_choice = Some(tool_config.tool_choice.as_str());
        request.parallel_tool_calls = match tool_config.max_parallel_tools {
            0 => None,
            1 => Some(false),
            _ => Some(true),
        };
    }

    Ok(request)
}

/// Converts blocks to messages, keeping tool results adjacent to the
/// assistant message that requested them.
pub(crate) fn build_messages(blocks: &[Block]) -> Vec<Message> {
    let mut out = MessageAssembler::default();
    for block in blocks {
        match block.kind {
            BlockKind::Reasoning => continue,
            BlockKind::User | BlockKind::LlmText | BlockKind::System | BlockKind::Other => {
                let text = block_text(block);
                if text.is_empty() {
                    debug!(kind = %block.kind, "skipping empty text block");
                } else {
                    let role = match block.kind {
                        BlockKind::User => "user",
                        BlockKind::System => "system",
                        _ => "assistant",
                    };
                    out.push_chat(chat_message(role, block, text));
                }
            }
            BlockKind::ToolCall => out.push_tool_call(ToolCallRequest {
                id: block.call_id().unwrap_or_default().to_string(),
                call_type: "function",
                function: FunctionCallRequest {
                    name: block.tool_name().unwrap_or_default().to_string(),
                    arguments: block.args_json(),
                },
            }),
            BlockKind::ToolUse => {
                out.push_tool_result(block.call_id().unwrap_or_default(), block.result_string());
            }
        }
        out.after_block(block.kind);
    }
    out.finish()
}

/// Tool-call ids whose assistant message is not answered by the
/// `tool` messages that directly follow.
pub(crate) fn unanswered_tool_calls(messages: &[Message]) -> Vec<String> {
    let mut missing = Vec::new();
    for (i, message) in messages.iter().enumerate() {
        let Some(calls) = &message.tool_calls else {
            continue;
        };
        let answered: HashSet<&str> = messages[i + 1..]
            .iter()
            .take_while(|m| m.role == "tool")
            .filter_map(|m| m.tool_call_id.as_deref())
            .collect();
        missing.extend(
            calls
                .iter()
                .filter(|c| !c.id.is_empty() && !answered.contains(c.id.as_str()))
                .map(|c| c.id.clone()),
        );
    }
    missing
}

/// Trimmed `text` payload; non-string values are JSON-rendered.
fn block_text(block: &Block) -> String {
    match block.payload.get(keys::TEXT) {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string().trim().to_string(),
    }
}

/// A plain message, or text plus `image_url` parts when the block
/// carries images.
fn chat_message(role: &'static str, block: &Block, text: String) -> Message {
    let images = block.images();
    if images.is_empty() {
        return Message::text(role, text);
    }
    let mut parts = vec![ContentPart::Text { text }];
    parts.extend(images.iter().filter_map(|img| {
        Some(ContentPart::ImageUrl {
            image_url: ImageUrl {
                url: img.data_url()?,
                detail: "auto",
            },
        })
    }));
    Message {
        role,
        content: Some(MessageContent::Parts(parts)),
        tool_calls: None,
        tool_call_id: None,
    }
}

/// Ordering state for [`build_messages`].
#[derive(Default)]
struct MessageAssembler {
    out: Vec<Message>,
    delayed: Vec<Message>,
    pending_calls: Vec<ToolCallRequest>,
    in_tool_phase: bool,
    expected: HashSet<String>,
    remaining: usize,
}

impl MessageAssembler {
    fn push_chat(&mut self, message: Message) {
        if self.in_tool_phase || !self.pending_calls.is_empty() {
            self.delayed.push(message);
        } else {
            self.out.push(message);
        }
    }

    fn push_tool_call(&mut self, call: ToolCallRequest) {
        self.pending_calls.push(call);
    }

    fn push_tool_result(&mut self, call_id: &str, content: String) {
        self.flush_tool_calls();
        self.out.push(Message::tool_result(call_id, content));
        if self.in_tool_phase {
            if self.expected.remove(call_id) {
                self.remaining = self.remaining.saturating_sub(1);
            }
            if self.remaining == 0 {
                self.end_tool_phase();
            }
        }
    }

    fn after_block(&mut self, kind: BlockKind) {
        if self.in_tool_phase
            && kind != BlockKind::ToolUse
            && self.pending_calls.is_empty()
            && self.remaining == 0
        {
            self.end_tool_phase();
        }
    }

    fn flush_tool_calls(&mut self) {
        if self.pending_calls.is_empty() {
            return;
        }
        let calls = std::mem::take(&mut self.pending_calls);
        self.expected = calls
            .iter()
            .filter(|c| !c.id.is_empty())
            .map(|c| c.id.clone())
            .collect();
        self.remaining = calls.len();
        self.in_tool_phase = true;
        self.out.push(Message::assistant_tool_calls(calls));
    }

    fn end_tool_phase(&mut self) {
        if !self.in_tool_phase {
            return;
        }
        self.in_tool_phase = false;
        self.expected.clear();
        self.remaining = 0;
        self.out.append(&mut self.delayed);
    }

    fn finish(mut self) -> Vec<Message> {
        self.flush_tool_calls();
        self.end_tool_phase();
        self.out.append(&mut self.delayed);
        self.out
    }
}
