//! Responses stream reduction.
//!
//! The Responses API streams named events. Text arrives as
//! `response.output_text.delta`, function-call arguments as
//! `response.function_call_arguments.delta` keyed by output item id, and
//! finished output items (`reasoning`, `message`, `function_call`) as
//! `response.output_item.done`. Blocks are collected in output order so
//! a reasoning block stays directly in front of the output it produced.

use std::collections::HashMap;

use geppetto::GeppettoError;
use geppetto::events::{ToolCallPayload, Usage};
use geppetto::turns::{Block, keys};
use serde_json::Value;
use tracing::{debug, trace};

use super::types::{OutputItem, ResponseEnvelope, StreamEventData};
use crate::types::ErrorDetail;

/// Something the engine publishes while the stream runs.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ResponsesUpdate {
    /// New assistant text.
    TextDelta(String),
    /// A lifecycle notice (`thinking-started`, `output-ended`, ...).
    Info(&'static str),
    /// A completed function call.
    ToolCall(ToolCallPayload),
}

#[derive(Debug, Default)]
struct PendingCall {
    call_id: String,
    name: String,
    arguments: String,
}

/// Running state of one Responses stream.
#[derive(Debug, Default)]
pub(crate) struct ResponsesStreamState {
    /// All assistant text so far.
    pub text: String,
    /// Output blocks in output order.
    pub blocks: Vec<Block>,
    pub usage: Option<Usage>,
    pub reasoning_tokens: Option<u64>,
    pub stop_reason: Option<String>,
    pub model: Option<String>,
    pub completed: bool,
    message_text: String,
    summary_text: String,
    calls: HashMap<String, PendingCall>,
}

impl ResponsesStreamState {
    /// Folds one named event in.
    ///
    /// # Errors
    ///
    /// [`GeppettoError::ResponseFormat`] for unparseable data and
    /// [`GeppettoError::Provider`] for `error` / `response.failed`.
    pub fn absorb(&mut self, event: &str, data: &str) -> Result<Option<ResponsesUpdate>, GeppettoError> {
        let parsed: StreamEventData =
            serde_json::from_str(data).map_err(|e| GeppettoError::ResponseFormat {
                message: format!("Failed to parse Responses event {event}: {e}"),
                raw: data.to_string(),
            })?;
        trace!(event, "responses event");

        match event {
            "response.created" | "response.in_progress" => {
                if let Some(model) = parsed.response.and_then(|r| r.model) {
                    self.model = Some(model);
                }
                Ok(None)
            }
            "response.output_text.delta" => Ok(text_delta(&parsed).map(|d| self.push_text(d))),
            "response.reasoning_summary_text.delta" => {
                if let Some(Value::String(d)) = &parsed.delta {
                    self.summary_text.push_str(d);
                }
                Ok(None)
            }
            "response.output_item.added" => Ok(parsed.item.and_then(|item| self.item_added(item))),
            "response.function_call_arguments.delta" => {
                if let (Some(id), Some(Value::String(d))) = (&parsed.item_id, &parsed.delta) {
                    self.calls.entry(id.clone()).or_default().arguments.push_str(d);
                }
                Ok(None)
            }
            "response.function_call_arguments.done" => {
                if let (Some(id), Some(args)) = (&parsed.item_id, parsed.arguments) {
                    if !args.is_empty() {
                        self.calls.entry(id.clone()).or_default().arguments = args;
                    }
                }
                Ok(None)
            }
            "response.output_item.done" => Ok(parsed.item.and_then(|item| self.item_done(item))),
            "response.completed" | "response.incomplete" => {
                if let Some(response) = parsed.response {
                    self.finish(response);
                }
                self.completed = true;
                Ok(None)
            }
            "response.failed" => {
                let error = parsed.response.and_then(|r| r.error);
                Err(provider_error(error, "responses failed"))
            }
            "error" => {
                let error = parsed.error.or(Some(ErrorDetail {
                    message: parsed.message.unwrap_or_default(),
                    error_type: None,
                    code: parsed.code,
                }));
                Err(provider_error(error, "responses stream error"))
            }
            _ => Ok(None),
        }
    }

    /// Flushes text that never arrived in a `message` item.
    pub fn finish_blocks(&mut self) {
        if !self.message_text.is_empty() {
            let text = std::mem::take(&mut self.message_text);
            self.blocks.push(Block::assistant_text(text));
        }
    }

    fn push_text(&mut self, delta: String) -> ResponsesUpdate {
        self.text.push_str(&delta);
        self.message_text.push_str(&delta);
        ResponsesUpdate::TextDelta(delta)
    }

    fn item_added(&mut self, item: OutputItem) -> Option<ResponsesUpdate> {
        match item.item_type.as_str() {
            "reasoning" => Some(ResponsesUpdate::Info("thinking-started")),
            "message" => Some(ResponsesUpdate::Info("output-started")),
            "function_call" => {
                let id = item.id.unwrap_or_default();
                let pending = self.calls.entry(id).or_default();
                pending.call_id = item.call_id.unwrap_or_default();
                pending.name = item.name.unwrap_or_default();
                None
            }
            _ => None,
        }
    }

    fn item_done(&mut self, item: OutputItem) -> Option<ResponsesUpdate> {
        match item.item_type.as_str() {
            "reasoning" => {
                let item_id = item.id.unwrap_or_default();
                let mut block = Block::reasoning(
                    item_id.clone(),
                    item.encrypted_content.filter(|c| !c.is_empty()),
                )
                .with_id(item_id);
                let mut summary = std::mem::take(&mut self.summary_text);
                if summary.is_empty() {
                    summary = item.summary.into_iter().filter_map(|s| s.text).collect();
                }
                if !summary.is_empty() {
                    block = block.with_payload(keys::TEXT, summary);
                }
                self.blocks.push(block);
                Some(ResponsesUpdate::Info("thinking-ended"))
            }
            "message" => {
                let mut text: String = item
                    .content
                    .into_iter()
                    .filter(|c| matches!(c.content_type.as_str(), "output_text" | "text"))
                    .filter_map(|c| c.text)
                    .collect();
                let streamed = std::mem::take(&mut self.message_text);
                if text.is_empty() {
                    text = streamed;
                }
                if !text.is_empty() {
                    let mut block = Block::assistant_text(text);
                    if let Some(id) = item.id.filter(|id| !id.is_empty()) {
                        block = block.with_payload(keys::ITEM_ID, id);
                    }
                    self.blocks.push(block);
                }
                Some(ResponsesUpdate::Info("output-ended"))
            }
            "function_call" => {
                let item_id = item.id.unwrap_or_default();
                let pending = self.calls.remove(&item_id).unwrap_or_default();
                let call_id = item.call_id.filter(|c| !c.is_empty()).unwrap_or(pending.call_id);
                let name = item.name.filter(|n| !n.is_empty()).unwrap_or(pending.name);
                let arguments = item
                    .arguments
                    .filter(|a| !a.is_empty())
                    .unwrap_or(pending.arguments);
                if call_id.is_empty() || name.is_empty() {
                    debug!(item_id, "dropping function call without id or name");
                    return None;
                }

                let args = if arguments.trim().is_empty() {
                    Value::Object(serde_json::Map::new())
                } else {
                    serde_json::from_str(&arguments).unwrap_or_else(|_| Value::String(arguments.clone()))
                };
                let mut block = Block::tool_call(call_id.clone(), name.clone(), args);
                if !item_id.is_empty() {
                    block = block.with_payload(keys::ITEM_ID, item_id);
                }
                self.blocks.push(block);
                Some(ResponsesUpdate::ToolCall(ToolCallPayload {
                    id: call_id,
                    name,
                    input: arguments,
                }))
            }
            _ => None,
        }
    }

    fn finish(&mut self, response: ResponseEnvelope) {
        if let Some(model) = response.model {
            self.model = Some(model);
        }
        if let Some(usage) = response.usage {
            self.reasoning_tokens = usage.output_tokens_details.and_then(|d| d.reasoning_tokens);
            self.usage = Some(Usage {
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
                cached_tokens: usage
                    .input_tokens_details
                    .and_then(|d| d.cached_tokens)
                    .filter(|n| *n > 0),
                ..Usage::default()
            });
        }
        self.stop_reason = response
            .stop_reason
            .or_else(|| response.incomplete_details.and_then(|d| d.reason))
            .or(response.status)
            .filter(|s| !s.is_empty());
    }
}

fn text_delta(data: &StreamEventData) -> Option<String> {
    let delta = match (&data.delta, &data.text) {
        (Some(Value::String(d)), _) => d.clone(),
        (_, Some(Value::Object(text))) => text.get("delta")?.as_str()?.to_string(),
        _ => return None,
    };
    (!delta.is_empty()).then_some(delta)
}

fn provider_error(error: Option<ErrorDetail>, fallback: &str) -> GeppettoError {
    let Some(error) = error else {
        return GeppettoError::Provider {
            code: "stream_error".into(),
            message: fallback.into(),
            retryable: false,
        };
    };
    let code = error
        .code
        .as_ref()
        .and_then(|c| c.as_str().map(str::to_string))
        .or(error.error_type)
        .unwrap_or_else(|| "stream_error".into());
    let message = if error.message.is_empty() {
        fallback.to_string()
    } else {
        error.message
    };
    GeppettoError::Provider {
        code,
        message,
        retryable: false,
    }
}

#[cfg(test)]
mod tests {
    use geppetto::turns::BlockKind;
    use serde_json::json;

    use super::*;

    fn feed(state: &mut ResponsesStreamState, event: &str, data: Value) -> Option<ResponsesUpdate> {
        state.absorb(event, &data.to_string()).unwrap()
    }

    #[test]
    fn test_text_delta_both_shapes() {
        let mut state = ResponsesStreamState::default();
        let a = feed(&mut state, "response.output_text.delta", json!({"delta": "Hel"}));
        let b = feed(&mut state, "response.output_text.delta", json!({"text": {"delta": "lo"}}));
        let c = feed(&mut state, "response.output_text.delta", json!({"delta": ""}));
        assert_eq!(a, Some(ResponsesUpdate::TextDelta("Hel".into())));
        assert_eq!(b, Some(ResponsesUpdate::TextDelta("lo".into())));
        assert!(c.is_none());
        assert_eq!(state.text, "Hello");

        state.finish_blocks();
        assert_eq!(state.blocks.len(), 1);
        assert_eq!(state.blocks[0].text(), Some("Hello"));
    }

    #[test]
    fn test_function_call_arguments_accumulate_by_item() {
        let mut state = ResponsesStreamState::default();
        feed(
            &mut state,
            "response.output_item.added",
            json!({"item": {"type": "function_call", "id": "fc_1", "call_id": "call_1", "name": "search"}}),
        );
        feed(&mut state, "response.function_call_arguments.delta", json!({"item_id": "fc_1", "delta": "{\"q\":"}));
        feed(&mut state, "response.function_call_arguments.delta", json!({"item_id": "fc_1", "delta": "\"rust\"}"}));
        let update = feed(
            &mut state,
            "response.output_item.done",
            json!({"item": {"type": "function_call", "id": "fc_1"}}),
        );

        assert_eq!(
            update,
            Some(ResponsesUpdate::ToolCall(ToolCallPayload {
                id: "call_1".into(),
                name: "search".into(),
                input: "{\"q\":\"rust\"}".into(),
            }))
        );
        let block = &state.blocks[0];
        assert_eq!(block.kind, BlockKind::ToolCall);
        assert_eq!(block.args_value(), json!({"q": "rust"}));
        assert_eq!(block.payload_str(keys::ITEM_ID), Some("fc_1"));
    }

    #[test]
    fn test_reasoning_then_message_keeps_order() {
        let mut state = ResponsesStreamState::default();
        let started = feed(&mut state, "response.output_item.added", json!({"item": {"type": "reasoning", "id": "rs_1"}}));
        assert_eq!(started, Some(ResponsesUpdate::Info("thinking-started")));
        feed(&mut state, "response.reasoning_summary_text.delta", json!({"delta": "Thinking"}));
        feed(
            &mut state,
            "response.output_item.done",
            json!({"item": {"type": "reasoning", "id": "rs_1", "encrypted_content": "blob"}}),
        );
        feed(&mut state, "response.output_text.delta", json!({"delta": "42"}));
        feed(
            &mut state,
            "response.output_item.done",
            json!({"item": {"type": "message", "id": "msg_1", "content": [{"type": "output_text", "text": "42"}]}}),
        );
        state.finish_blocks();

        assert_eq!(state.blocks.len(), 2);
        let reasoning = &state.blocks[0];
        assert_eq!(reasoning.kind, BlockKind::Reasoning);
        assert_eq!(reasoning.id, "rs_1");
        assert_eq!(reasoning.payload_str(keys::ENCRYPTED_CONTENT), Some("blob"));
        assert_eq!(reasoning.text(), Some("Thinking"));
        let message = &state.blocks[1];
        assert_eq!(message.text(), Some("42"));
        assert_eq!(message.payload_str(keys::ITEM_ID), Some("msg_1"));
    }

    #[test]
    fn test_completed_usage_and_status() {
        let mut state = ResponsesStreamState::default();
        feed(
            &mut state,
            "response.completed",
            json!({"response": {
                "model": "o3-mini",
                "status": "completed",
                "usage": {
                    "input_tokens": 12, "output_tokens": 30,
                    "input_tokens_details": {"cached_tokens": 0},
                    "output_tokens_details": {"reasoning_tokens": 20}
                }
            }}),
        );
        assert!(state.completed);
        let usage = state.usage.unwrap();
        assert_eq!(usage.input_tokens, 12);
        assert_eq!(usage.output_tokens, 30);
        assert_eq!(usage.cached_tokens, None);
        assert_eq!(state.reasoning_tokens, Some(20));
        assert_eq!(state.stop_reason.as_deref(), Some("completed"));
        assert_eq!(state.model.as_deref(), Some("o3-mini"));
    }

    #[test]
    fn test_error_events() {
        let mut state = ResponsesStreamState::default();
        let err = state
            .absorb("error", &json!({"message": "rate limited", "code": "rate_limit_exceeded"}).to_string())
            .unwrap_err();
        assert!(matches!(err, GeppettoError::Provider { ref code, .. } if code == "rate_limit_exceeded"));

        let err = state
            .absorb("response.failed", &json!({"response": {"status": "failed"}}).to_string())
            .unwrap_err();
        assert!(err.to_string().contains("responses failed"));
    }

    #[test]
    fn test_unknown_event_ignored() {
        let mut state = ResponsesStreamState::default();
        assert!(feed(&mut state, "response.web_search_call.searching", json!({"item_id": "ws_1"})).is_none());
    }

    #[test]
    fn test_bad_json_is_response_format_error() {
        let mut state = ResponsesStreamState::default();
        let err = state.absorb("response.output_text.delta", "{oops").unwrap_err();
        assert!(matches!(err, GeppettoError::ResponseFormat { .. }));
    }
}
