//! Tool definitions, execution and the tool-calling loop.
//!
//! The pieces, from the outside in:
//!
//! - [`ToolDefinition`]: what a tool looks like to the model.
//! - [`ToolAdapter`]: converts definitions to one provider's wire shape
//!   and enforces that provider's [`ProviderLimits`].
//! - [`Toolbox`]: runs tools by name. [`ToolRegistry`] is the standard
//!   implementation, holding [`ToolHandler`]s (closures via [`tool_fn`]).
//! - [`ToolMiddleware`]: the loop that runs the engine, executes the
//!   calls it emits under a [`ToolConfig`] policy and re-invokes it.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use geppetto::engine::{Engine, EngineWithMiddleware};
//! use geppetto::tool::{ToolConfig, ToolDefinition, ToolError, ToolMiddleware, ToolRegistry, tool_fn};
//! use geppetto::{Block, DynEngine, InferenceContext, Turn};
//! use serde_json::{Value, json};
//!
//! # async fn example(engine: Arc<dyn DynEngine>) -> Result<(), geppetto::GeppettoError> {
//! let mut registry = ToolRegistry::new();
//! registry.register(tool_fn(
//!     ToolDefinition::new("add", "Add two numbers").with_parameters(json!({
//!         "type": "object",
//!         "properties": { "a": { "type": "number" }, "b": { "type": "number" } },
//!         "required": ["a", "b"]
//!     })),
//!     |input: Value| async move {
//!         Ok::<_, ToolError>(json!(input["a"].as_f64().unwrap_or(0.0) + input["b"].as_f64().unwrap_or(0.0)))
//!     },
//! ));
//!
//! let engine = EngineWithMiddleware::new(engine)
//!     .with(ToolMiddleware::new(Arc::new(registry), ToolConfig::default()));
//! let turn = engine
//!     .run_inference(&InferenceContext::new(), Turn::with_blocks([Block::user_text("2+2?")]))
//!     .await?;
//! println!("{}", turn.assistant_text());
//! # Ok(())
//! # }
//! ```

mod adapter;
mod config;
mod definition;
mod error;
mod execution;
mod extract;
mod handler;
mod middleware;

pub use adapter::{
    ClaudeToolAdapter, GeminiToolAdapter, OpenAiResponsesToolAdapter, OpenAiToolAdapter,
    ProviderLimits, ToolAdapter,
};
pub use config::{RetryConfig, ToolChoice, ToolConfig, ToolErrorHandling};
pub use definition::ToolDefinition;
pub use error::ToolError;
pub use extract::{TOOL_CALLS_METADATA_KEY, ToolCall, extract_tool_calls};
pub use handler::{FnToolHandler, ToolFuture, ToolHandler, ToolRegistry, Toolbox, tool_fn};
pub use middleware::ToolMiddleware;
