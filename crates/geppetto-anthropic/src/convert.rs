//! Turn → Messages API request conversion.
//!
//! The first system block (and any system blocks directly after it)
//! becomes the top-level `system` string; later system blocks are sent
//! as user text. Tool calls go out as assistant `tool_use` content and
//! tool results as user `tool_result` content. Chat messages seen while
//! calls are still unanswered are held back until the last result is
//! in, and consecutive messages with the same role are merged, so every
//! `tool_use` is answered by the user message that directly follows it.

use std::collections::HashSet;

use geppetto::GeppettoError;
use geppetto::engine::{InferenceConfig, StepSettings, StructuredOutputConfig};
use geppetto::tool::{ClaudeToolAdapter, ToolAdapter, ToolChoice};
use geppetto::turns::{Block, BlockKind, Turn, keys, meta, role};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::AnthropicConfig;
use crate::types::{
    Content, Message, OutputFormat, Request, RequestMetadata, ThinkingConfig, ToolChoiceParam,
};

/// Provider default for both `temperature` and `top_p`.
const DEFAULT_SAMPLING: f64 = 1.0;

/// Builds the streaming request for `turn`.
///
/// Sampling values resolve turn override → `defaults` → settings.
/// Values equal to the provider default are omitted.
///
/// # Errors
///
/// [`GeppettoError::InvalidRequest`] when both `temperature` and
/// `top_p` end up away from their defaults; content and tool errors
/// from the conversion.
pub(crate) fn build_request(
    turn: &Turn,
    config: &AnthropicConfig,
    settings: &StepSettings,
    defaults: Option<&InferenceConfig>,
) -> Result<Request, GeppettoError> {
    let chat = &settings.chat;
    let infer = InferenceConfig::resolve(turn, defaults).unwrap_or_default();
    let claude = turn.data.claude_inference_config.clone().unwrap_or_default();

    let temperature = non_default(infer.temperature.or(chat.temperature));
    let top_p = non_default(infer.top_p.or(chat.top_p));
    if temperature.is_some() && top_p.is_some() {
        return Err(GeppettoError::InvalidRequest(
            "both temperature and top_p are set to non-default values; \
             Claude models accept only one of them"
                .into(),
        ));
    }

    let (system, messages) = build_messages(&turn.blocks)?;
    let mut request = Request {
        model: config.model.clone(),
        messages,
        max_tokens: infer
            .max_response_tokens
            .or(chat.max_response_tokens)
            .filter(|t| *t > 0)
            .unwrap_or(config.max_tokens),
        system,
        metadata: claude
            .user_id
            .or_else(|| settings.claude.user_id.clone())
            .filter(|u| !u.is_empty())
            .map(|user_id| RequestMetadata { user_id }),
        stop_sequences: infer.apply_stop(&chat.stop),
        stream: true,
        temperature,
        top_p,
        top_k: claude.top_k.or(settings.claude.top_k),
        tools: Vec::new(),
        tool_choice: None,
        thinking: infer
            .thinking_budget
            .or(settings.claude.thinking_budget)
            .filter(|b| *b > 0)
            .map(|budget_tokens| ThinkingConfig {
                thinking_type: "enabled",
                budget_tokens,
            }),
        output_format: None,
    };

    if let Some(thinking) = &request.thinking
        && thinking.budget_tokens >= request.max_tokens
    {
        warn!(
            budget = thinking.budget_tokens,
            max_tokens = request.max_tokens,
            "thinking budget must be below max_tokens"
        );
    }

    let structured = StructuredOutputConfig::resolve(
        chat.structured_output_config()?,
        turn.data.structured_output.as_ref(),
    );
    if let Some(cfg) = StructuredOutputConfig::effective(structured.as_ref())? {
        request.output_format = Some(OutputFormat {
            format_type: "json_schema",
            schema: Value::Object(cfg.schema.clone()),
        });
    }

    let (tools, tool_config) = turn.data.advertised_tools();
    if !tools.is_empty() {
        request.tools = ClaudeToolAdapter.prepare(&tools)?;
        let choice_type = match tool_config.tool_choice {
            ToolChoice::Auto => "auto",
            ToolChoice::None => "none",
            ToolChoice::Required => "any",
        };
        request.tool_choice = Some(ToolChoiceParam {
            choice_type,
            disable_parallel_tool_use: (tool_config.max_parallel_tools == 1
                && tool_config.tool_choice != ToolChoice::None)
                .then_some(true),
        });
    }

    Ok(request)
}

fn non_default(value: Option<f64>) -> Option<f64> {
    value.filter(|v| (v - DEFAULT_SAMPLING).abs() > 1e-9)
}

/// Where the system prompt run stands while walking the blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SystemRun {
    NotStarted,
    Open,
    Closed,
}

/// Converts blocks to the `system` string and the message list.
///
/// # Errors
///
/// [`GeppettoError::UnknownContentType`] or
/// [`GeppettoError::ResponseFormat`] when a block's preserved
/// `claude_original_content` cannot be parsed.
pub(crate) fn build_messages(
    blocks: &[Block],
) -> Result<(Option<String>, Vec<Message>), GeppettoError> {
    let mut out = MessageAssembler::default();
    let mut system = Vec::new();
    let mut run = SystemRun::NotStarted;

    for block in blocks {
        if block.kind == BlockKind::System {
            let text = block_text(block);
            match run {
                SystemRun::NotStarted | SystemRun::Open => {
                    run = SystemRun::Open;
                    if !text.is_empty() {
                        system.push(text);
                    }
                }
                SystemRun::Closed if !text.is_empty() => {
                    out.push_chat(Message::new(role::USER, vec![Content::text(text)]));
                }
                SystemRun::Closed => {}
            }
            continue;
        }
        if run == SystemRun::Open {
            run = SystemRun::Closed;
        }

        match block.kind {
            BlockKind::User => {
                if let Some(content) = original_content(block)? {
                    out.push_original(role::USER, content);
                    continue;
                }
                let mut parts = Vec::new();
                let text = block_text(block);
                if !text.is_empty() {
                    parts.push(Content::text(text));
                }
                parts.extend(image_parts(block));
                if parts.is_empty() {
                    debug!("skipping empty user block");
                } else {
                    out.push_chat(Message::new(role::USER, parts));
                }
            }
            BlockKind::LlmText | BlockKind::Other | BlockKind::Reasoning => {
                if let Some(content) = original_content(block)? {
                    out.push_original(role::ASSISTANT, content);
                    continue;
                }
                if block.kind == BlockKind::Reasoning {
                    continue;
                }
                let text = block_text(block);
                if !text.is_empty() {
                    out.push_chat(Message::new(role::ASSISTANT, vec![Content::text(text)]));
                }
            }
            BlockKind::System => {}
            BlockKind::ToolCall => {
                let id = block.call_id().unwrap_or_default().to_string();
                let mut input = block.args_value();
                if !input.is_object() {
                    warn!(call_id = %id, "tool_use input is not a JSON object; sending {{}}");
                    input = Value::Object(serde_json::Map::new());
                }
                out.push_tool_use(Content::tool_use(
                    id,
                    block.tool_name().unwrap_or_default(),
                    input,
                ));
            }
            BlockKind::ToolUse => {
                let is_error = block
                    .payload
                    .get(keys::ERROR)
                    .is_some_and(|e| !e.is_null() && e.as_str() != Some(""));
                out.push_tool_result(Content::tool_result(
                    block.call_id().unwrap_or_default(),
                    block.result_string(),
                    is_error,
                ));
            }
        }
    }

    let system = (!system.is_empty()).then(|| system.join("\n\n"));
    Ok((system, out.finish()))
}

/// Trimmed `text` payload; non-string values are JSON-rendered.
fn block_text(block: &Block) -> String {
    match block.payload.get(keys::TEXT) {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

/// The provider content preserved on a block by an earlier inference.
fn original_content(block: &Block) -> Result<Option<Vec<Content>>, GeppettoError> {
    match block.metadata.get(meta::CLAUDE_ORIGINAL_CONTENT) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => {
            let content = Content::parse_array(value)?;
            Ok((!content.is_empty()).then_some(content))
        }
    }
}

fn image_parts(block: &Block) -> Vec<Content> {
    block
        .images()
        .iter()
        .filter_map(|img| {
            if let Some(url) = img.url.as_deref().filter(|u| !u.is_empty()) {
                return Some(Content::image_url(url));
            }
            img.base64_data()
                .map(|data| Content::image_base64(img.media_type.clone(), data))
        })
        .collect()
}

/// Ordering state for [`build_messages`].
#[derive(Default)]
struct MessageAssembler {
    out: Vec<Message>,
    delayed: Vec<Message>,
    unanswered: HashSet<String>,
    replayed: HashSet<String>,
}

impl MessageAssembler {
    fn push_chat(&mut self, message: Message) {
        if self.unanswered.is_empty() {
            self.push(message);
        } else {
            self.delayed.push(message);
        }
    }

    /// Preserved content goes out as-is; its `tool_use` ids are not
    /// sent again by the `tool_call` blocks that follow.
    fn push_original(&mut self, role: &str, content: Vec<Content>) {
        let mut has_calls = false;
        for c in &content {
            if let Content::ToolUse(call) = c {
                self.replayed.insert(call.id.clone());
                self.unanswered.insert(call.id.clone());
                has_calls = true;
            }
        }
        let message = Message::new(role, content);
        if has_calls {
            self.push(message);
        } else {
            self.push_chat(message);
        }
    }

    fn push_tool_use(&mut self, content: Content) {
        if let Content::ToolUse(call) = &content {
            if self.replayed.contains(&call.id) {
                return;
            }
            self.unanswered.insert(call.id.clone());
        }
        self.push(Message::new(role::ASSISTANT, vec![content]));
    }

    fn push_tool_result(&mut self, content: Content) {
        if let Content::ToolResult(result) = &content {
            self.unanswered.remove(&result.tool_use_id);
        }
        self.push(Message::new(role::USER, vec![content]));
        if self.unanswered.is_empty() {
            self.flush_delayed();
        }
    }

    fn flush_delayed(&mut self) {
        for message in std::mem::take(&mut self.delayed) {
            self.push(message);
        }
    }

    /// Appends `message`, merging it into the previous one when the
    /// roles match.
    fn push(&mut self, message: Message) {
        match self.out.last_mut() {
            Some(last) if last.role == message.role => last.content.extend(message.content),
            _ => self.out.push(message),
        }
    }

    fn finish(mut self) -> Vec<Message> {
        self.flush_delayed();
        self.out
    }
}
