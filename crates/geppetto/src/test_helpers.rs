//! Pre-built helpers for testing code built on geppetto.
//!
//! Available when the `test-utils` feature is enabled, so provider
//! crates can reuse them in their own test suites. Also compiled during
//! `#[cfg(test)]` for this crate's own tests.

use std::sync::Arc;

use serde_json::Value;

use crate::context::InferenceContext;
use crate::events::{CollectingSink, EventSink, Usage};
use crate::mock::MockEngine;
use crate::turns::{Block, Turn};

/// A [`Usage`] with 100 input / 50 output tokens.
pub fn sample_usage() -> Usage {
    Usage {
        input_tokens: 100,
        output_tokens: 50,
        ..Usage::default()
    }
}

/// A Turn holding a single user block.
pub fn user_turn(text: &str) -> Turn {
    Turn::with_blocks([Block::user_text(text)])
}

/// A context carrying a fresh [`CollectingSink`], returned alongside it.
pub fn collecting_context() -> (InferenceContext, Arc<CollectingSink>) {
    let sink = Arc::new(CollectingSink::new());
    let ctx = InferenceContext::new().with_event_sinks([sink.clone() as Arc<dyn EventSink>]);
    (ctx, sink)
}

/// A [`MockEngine`] with the given text replies queued in order.
pub fn mock_with_text(replies: &[&str]) -> Arc<MockEngine> {
    let engine = Arc::new(MockEngine::new());
    for reply in replies {
        engine.push_text(*reply);
    }
    engine
}

/// An SSE body of `data:` lines, one per JSON chunk, ending with
/// `data: [DONE]`.
pub fn sse_data_body(chunks: &[Value]) -> String {
    let mut body = String::new();
    for chunk in chunks {
        body.push_str("data: ");
        body.push_str(&chunk.to_string());
        body.push_str("\n\n");
    }
    body.push_str("data: [DONE]\n\n");
    body
}

/// An SSE body of named events (`event:` + `data:` pairs).
pub fn sse_event_body(events: &[(&str, Value)]) -> String {
    let mut body = String::new();
    for (name, data) in events {
        body.push_str("event: ");
        body.push_str(name);
        body.push_str("\ndata: ");
        body.push_str(&data.to_string());
        body.push_str("\n\n");
    }
    body
}

/// Installs a test-writer subscriber filtered by `RUST_LOG`. Later calls
/// are no-ops.
#[cfg(test)]
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
