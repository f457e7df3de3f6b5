//! `streamGenerateContent` chunk reduction.
//!
//! Gemini streams whole parts rather than fragments: text parts are
//! deltas to append, and every `functionCall` part is already complete.
//! [`GeminiStreamState`] folds chunks into the text, calls, usage and
//! stop reason the engine publishes from.

use geppetto::events::Usage;
use serde_json::{Map, Value};

use crate::types::{GenerateContentResponse, UsageMetadata};

/// Finish reason Gemini sends before the real one is known.
const UNSPECIFIED: &str = "FINISH_REASON_UNSPECIFIED";

/// A complete function call from the stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamedCall {
    /// Provider id, or a generated `call_` id when the model sent none.
    pub id: String,
    /// Function name.
    pub name: String,
    /// Arguments object.
    pub args: Value,
}

/// What one chunk contributed.
#[derive(Debug, Default)]
pub struct ChunkUpdate {
    /// Text appended by this chunk.
    pub delta: Option<String>,
    /// Calls first seen in this chunk.
    pub calls: Vec<StreamedCall>,
}

/// Accumulated state of one streamed reply.
#[derive(Debug, Default)]
pub struct GeminiStreamState {
    /// All text so far, across candidates.
    pub text: String,
    /// Calls in arrival order.
    pub tool_calls: Vec<StreamedCall>,
    /// Latest non-zero usage.
    pub usage: Option<Usage>,
    /// Last concrete finish reason, or the prompt block reason.
    pub stop_reason: Option<String>,
    /// `modelVersion` reported by the server.
    pub model: Option<String>,
    /// Chunks absorbed.
    pub chunks: usize,
}

impl GeminiStreamState {
    /// Folds one chunk into the state.
    pub fn absorb(&mut self, chunk: GenerateContentResponse) -> ChunkUpdate {
        self.chunks += 1;
        let mut update = ChunkUpdate::default();

        if let Some(model) = chunk.model_version.filter(|m| !m.is_empty()) {
            self.model = Some(model);
        }
        if let Some(usage) = chunk.usage_metadata.and_then(to_usage) {
            self.usage = Some(usage);
        }
        if let Some(reason) = chunk.prompt_feedback.and_then(|f| f.block_reason) {
            self.stop_reason = Some(reason);
        }

        let mut delta = String::new();
        for candidate in chunk.candidates {
            for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
                if let Some(text) = part.text.filter(|t| !t.is_empty()) {
                    delta.push_str(&text);
                }
                if let Some(call) = part.function_call {
                    let args = match call.args {
                        Value::Null => Value::Object(Map::new()),
                        args => args,
                    };
                    let call = StreamedCall {
                        id: call
                            .id
                            .filter(|id| !id.is_empty())
                            .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple())),
                        name: call.name,
                        args,
                    };
                    self.tool_calls.push(call.clone());
                    update.calls.push(call);
                }
            }
            if let Some(reason) = candidate.finish_reason.filter(|r| r != UNSPECIFIED) {
                self.stop_reason = Some(reason);
            }
        }

        if !delta.is_empty() {
            self.text.push_str(&delta);
            update.delta = Some(delta);
        }
        update
    }
}

fn to_usage(meta: UsageMetadata) -> Option<Usage> {
    let cached = meta.cached_content_token_count.unwrap_or(0);
    if meta.prompt_token_count == 0 && meta.candidates_token_count == 0 && cached == 0 {
        return None;
    }
    Some(Usage {
        input_tokens: meta.prompt_token_count,
        output_tokens: meta.candidates_token_count,
        cached_tokens: (cached > 0).then_some(cached),
        ..Usage::default()
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn chunk(value: Value) -> GenerateContentResponse {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_text_deltas_accumulate() {
        let mut state = GeminiStreamState::default();
        let first = state.absorb(chunk(json!({
            "candidates": [{"content": {"role": "model", "parts": [{"text": "Hel"}]}}]
        })));
        let second = state.absorb(chunk(json!({
            "candidates": [{"content": {"role": "model", "parts": [{"text": "lo"}]}, "finishReason": "STOP"}],
            "usageMetadata": {"promptTokenCount": 3, "candidatesTokenCount": 2, "totalTokenCount": 5},
            "modelVersion": "gemini-2.0-flash-001"
        })));

        assert_eq!(first.delta.as_deref(), Some("Hel"));
        assert_eq!(second.delta.as_deref(), Some("lo"));
        assert_eq!(state.text, "Hello");
        assert_eq!(state.stop_reason.as_deref(), Some("STOP"));
        assert_eq!(state.model.as_deref(), Some("gemini-2.0-flash-001"));
        assert_eq!(state.chunks, 2);
        let usage = state.usage.unwrap();
        assert_eq!((usage.input_tokens, usage.output_tokens), (3, 2));
        assert_eq!(usage.cached_tokens, None);
    }

    #[test]
    fn test_function_calls_are_reported_once() {
        let mut state = GeminiStreamState::default();
        let update = state.absorb(chunk(json!({
            "candidates": [{"content": {"role": "model", "parts": [
                {"functionCall": {"id": "fc_1", "name": "get_weather", "args": {"city": "Paris"}}},
                {"functionCall": {"name": "get_time"}}
            ]}}]
        })));
        assert!(update.delta.is_none());
        assert_eq!(update.calls.len(), 2);
        assert_eq!(update.calls[0].id, "fc_1");
        assert_eq!(update.calls[0].args, json!({"city": "Paris"}));
        assert!(update.calls[1].id.starts_with("call_"));
        assert_eq!(update.calls[1].args, json!({}));

        let next = state.absorb(chunk(json!({
            "candidates": [{"content": {"parts": [{"text": "done"}]}}]
        })));
        assert!(next.calls.is_empty());
        assert_eq!(state.tool_calls.len(), 2);
    }

    #[test]
    fn test_zero_usage_is_ignored() {
        let mut state = GeminiStreamState::default();
        state.absorb(chunk(json!({
            "usageMetadata": {"promptTokenCount": 0, "candidatesTokenCount": 0}
        })));
        assert!(state.usage.is_none());

        state.absorb(chunk(json!({
            "usageMetadata": {"promptTokenCount": 10, "candidatesTokenCount": 1, "cachedContentTokenCount": 8}
        })));
        assert_eq!(state.usage.unwrap().cached_tokens, Some(8));
    }

    #[test]
    fn test_unspecified_finish_reason_is_skipped() {
        let mut state = GeminiStreamState::default();
        state.absorb(chunk(json!({"candidates": [{"finishReason": "MAX_TOKENS"}]})));
        state.absorb(chunk(json!({"candidates": [{"finishReason": "FINISH_REASON_UNSPECIFIED"}]})));
        assert_eq!(state.stop_reason.as_deref(), Some("MAX_TOKENS"));
    }

    #[test]
    fn test_blocked_prompt_sets_stop_reason() {
        let mut state = GeminiStreamState::default();
        state.absorb(chunk(json!({"promptFeedback": {"blockReason": "SAFETY"}})));
        assert_eq!(state.stop_reason.as_deref(), Some("SAFETY"));
        assert!(state.text.is_empty());
    }
}
