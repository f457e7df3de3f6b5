//! Chat Completions stream reduction.
//!
//! [`ToolCallMerger`] assembles tool calls from indexed fragments;
//! [`ChatStreamState`] folds whole chunks (text, tool fragments, usage,
//! finish reason) into the state the engine publishes from.

use std::collections::HashMap;

use geppetto::GeppettoError;
use geppetto::events::Usage;

use crate::types::{StreamChunk, ToolCallDelta};

/// One fully assembled tool call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergedToolCall {
    /// Position within the reply.
    pub index: u32,
    /// Provider call id. May be empty: the stream is not required to
    /// send one.
    pub id: String,
    /// Function name.
    pub name: String,
    /// Concatenated argument JSON.
    pub arguments: String,
}

/// Assembles streamed tool-call fragments keyed by `index`.
///
/// A fragment without an index belongs to slot 0. Name and argument
/// fragments always append; the id is taken from the first fragment
/// that carries one.
///
/// ```rust
/// use geppetto_openai::{FunctionDelta, ToolCallDelta, ToolCallMerger};
///
/// let mut merger = ToolCallMerger::new();
/// merger.add(&[ToolCallDelta {
///     index: Some(0),
///     id: Some("call_1".into()),
///     function: Some(FunctionDelta { name: Some("calculator".into()), arguments: None }),
/// }]);
/// merger.add(&[ToolCallDelta {
///     index: Some(0),
///     id: None,
///     function: Some(FunctionDelta { name: None, arguments: Some("{\"a\":5}".into()) }),
/// }]);
///
/// let calls = merger.tool_calls();
/// assert_eq!(calls[0].name, "calculator");
/// assert_eq!(calls[0].arguments, "{\"a\":5}");
/// ```
#[derive(Debug, Default)]
pub struct ToolCallMerger {
    calls: HashMap<u32, MergedToolCall>,
}

impl ToolCallMerger {
    /// An empty merger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Absorbs one chunk's fragments.
    pub fn add(&mut self, deltas: &[ToolCallDelta]) {
        for delta in deltas {
            let index = delta.index.unwrap_or(0);
            let slot = self.calls.entry(index).or_insert_with(|| MergedToolCall {
                index,
                ..MergedToolCall::default()
            });
            if slot.id.is_empty() {
                if let Some(id) = delta.id.as_deref() {
                    slot.id = id.to_string();
                }
            }
            if let Some(function) = &delta.function {
                if let Some(name) = &function.name {
                    slot.name.push_str(name);
                }
                if let Some(args) = &function.arguments {
                    slot.arguments.push_str(args);
                }
            }
        }
    }

    /// Whether no fragment was seen.
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Number of distinct calls.
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    /// The assembled calls, sorted by index.
    pub fn tool_calls(&self) -> Vec<MergedToolCall> {
        let mut calls: Vec<_> = self.calls.values().cloned().collect();
        calls.sort_by_key(|c| c.index);
        calls
    }
}

/// Running state of one Chat Completions stream.
#[derive(Debug, Default)]
pub(crate) struct ChatStreamState {
    pub text: String,
    pub tool_calls: ToolCallMerger,
    pub usage: Option<Usage>,
    pub stop_reason: Option<String>,
    pub model: Option<String>,
    pub chunks: usize,
}

impl ChatStreamState {
    /// Folds one chunk in and returns its non-empty text delta.
    ///
    /// # Errors
    ///
    /// [`GeppettoError::Provider`] when the chunk is an in-stream error.
    pub fn absorb(&mut self, chunk: StreamChunk) -> Result<Option<String>, GeppettoError> {
        self.chunks += 1;
        if let Some(error) = chunk.error {
            let code = error
                .code
                .as_ref()
                .map(|c| c.as_str().map_or_else(|| c.to_string(), str::to_string))
                .or(error.error_type)
                .unwrap_or_else(|| "stream_error".into());
            return Err(GeppettoError::Provider {
                code,
                message: error.message,
                retryable: false,
            });
        }
        if self.model.is_none() {
            self.model = chunk.model;
        }

        if let Some(usage) = chunk.usage {
            self.usage = Some(Usage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
                cached_tokens: usage
                    .prompt_tokens_details
                    .and_then(|d| d.cached_tokens)
                    .filter(|n| *n > 0),
                ..Usage::default()
            });
        }

        let Some(choice) = chunk.choices.into_iter().next() else {
            return Ok(None);
        };
        if let Some(calls) = &choice.delta.tool_calls {
            self.tool_calls.add(calls);
        }
        if let Some(reason) = choice.finish_reason.filter(|r| !r.is_empty()) {
            self.stop_reason = Some(reason);
        }
        match choice.delta.content {
            Some(delta) if !delta.is_empty() => {
                self.text.push_str(&delta);
                Ok(Some(delta))
            }
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::types::FunctionDelta;

    fn delta(index: Option<u32>, id: Option<&str>, name: Option<&str>, args: Option<&str>) -> ToolCallDelta {
        ToolCallDelta {
            index,
            id: id.map(str::to_string),
            function: Some(FunctionDelta {
                name: name.map(str::to_string),
                arguments: args.map(str::to_string),
            }),
        }
    }

    fn chunk(v: serde_json::Value) -> StreamChunk {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn test_interleaved_fragments_merge_per_index() {
        let mut merger = ToolCallMerger::new();
        merger.add(&[delta(Some(1), Some("call_b"), Some("sea"), None)]);
        merger.add(&[delta(Some(0), Some("call_a"), Some("calc"), Some("{\"a\""))]);
        merger.add(&[
            delta(Some(1), None, Some("rch"), Some("{\"q\":")),
            delta(Some(0), None, Some("ulator"), Some(":5}")),
        ]);
        merger.add(&[delta(Some(1), None, None, Some("\"rust\"}"))]);

        let calls = merger.tool_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(
            calls[0],
            MergedToolCall {
                index: 0,
                id: "call_a".into(),
                name: "calculator".into(),
                arguments: "{\"a\":5}".into(),
            }
        );
        assert_eq!(calls[1].name, "search");
        assert_eq!(calls[1].arguments, "{\"q\":\"rust\"}");
    }

    #[test]
    fn test_missing_index_is_slot_zero() {
        let mut merger = ToolCallMerger::new();
        merger.add(&[delta(None, Some("call_x"), Some("t"), None)]);
        merger.add(&[delta(Some(0), None, None, Some("{}"))]);
        assert_eq!(merger.len(), 1);
        assert_eq!(merger.tool_calls()[0].arguments, "{}");
    }

    #[test]
    fn test_id_only_delta_establishes_slot() {
        let mut merger = ToolCallMerger::new();
        merger.add(&[ToolCallDelta {
            index: Some(2),
            id: Some("call_z".into()),
            function: None,
        }]);
        assert!(!merger.is_empty());
        let calls = merger.tool_calls();
        assert_eq!(calls[0].id, "call_z");
        assert!(calls[0].name.is_empty());
    }

    #[test]
    fn test_later_id_does_not_overwrite() {
        let mut merger = ToolCallMerger::new();
        merger.add(&[delta(Some(0), Some("first"), None, None)]);
        merger.add(&[delta(Some(0), Some("second"), None, None)]);
        assert_eq!(merger.tool_calls()[0].id, "first");
    }

    #[test]
    fn test_state_accumulates_text_and_usage() {
        let mut state = ChatStreamState::default();
        let d = state
            .absorb(chunk(json!({"model": "gpt-4o", "choices": [{"delta": {"content": "Hel"}}]})))
            .unwrap();
        assert_eq!(d.as_deref(), Some("Hel"));
        state
            .absorb(chunk(json!({"choices": [{"delta": {"content": "lo"}, "finish_reason": "stop"}]})))
            .unwrap();
        let d = state
            .absorb(chunk(json!({
                "choices": [],
                "usage": {"prompt_tokens": 10, "completion_tokens": 2,
                          "prompt_tokens_details": {"cached_tokens": 4}}
            })))
            .unwrap();
        assert!(d.is_none());

        assert_eq!(state.text, "Hello");
        assert_eq!(state.stop_reason.as_deref(), Some("stop"));
        assert_eq!(state.model.as_deref(), Some("gpt-4o"));
        let usage = state.usage.unwrap();
        assert_eq!(usage.input_tokens, 10);
        assert_eq!(usage.output_tokens, 2);
        assert_eq!(usage.cached_tokens, Some(4));
    }

    #[test]
    fn test_empty_content_is_not_a_delta() {
        let mut state = ChatStreamState::default();
        let d = state
            .absorb(chunk(json!({"choices": [{"delta": {"role": "assistant", "content": ""}}]})))
            .unwrap();
        assert!(d.is_none());
    }

    #[test]
    fn test_in_stream_error() {
        let mut state = ChatStreamState::default();
        let err = state
            .absorb(chunk(json!({"error": {"message": "overloaded", "type": "server_error"}})))
            .unwrap_err();
        assert!(matches!(err, GeppettoError::Provider { ref code, .. } if code == "server_error"));
    }
}
