//! # geppetto
//!
//! Provider-agnostic inference core for large language models.
//!
//! A conversation is a [`Turn`]: an ordered list of typed [`Block`]s.
//! An [`Engine`] takes a Turn, streams one inference from its provider,
//! publishes normalized [`events`] along the way and appends the
//! model's blocks. Everything around that is composable: middleware
//! (tool calling, system prompts, logging), caching, and a registry
//! that builds engines from resolved settings.
//!
//! This crate contains no provider code. Provider engines live in
//! sibling crates:
//!
//! | Crate | Provider | API types |
//! |-------|----------|-----------|
//! | `geppetto-openai` | OpenAI and compatible | `openai`, `anyscale`, `fireworks`, `openai-responses` |
//! | `geppetto-anthropic` | Anthropic Claude | `claude` |
//! | `geppetto-gemini` | Google Gemini | `gemini` |
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────────────┐ ┌────────────────────┐ ┌─────────────────┐
//!  │ geppetto-openai  │ │ geppetto-anthropic │ │ geppetto-gemini │
//!  └────────┬─────────┘ └─────────┬──────────┘ └────────┬────────┘
//!           └──────────────┬──────┴─────────────────────┘
//!                          ▼
//!        ┌──────────────────────────────────────────┐
//!        │                 geppetto                 │
//!        │ Turn/Block · events · Engine · tool loop │
//!        │          · cache · EngineRegistry        │
//!        └──────────────────────────────────────────┘
//! ```
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use geppetto::engine::{EngineRegistry, EngineWithMiddleware, StepSettings};
//! use geppetto::tool::{ToolConfig, ToolDefinition, ToolMiddleware, ToolRegistry, tool_fn};
//! use geppetto::{Block, Engine, InferenceContext, Turn};
//! use serde_json::{Value, json};
//!
//! # async fn example(settings: StepSettings) -> Result<(), geppetto::GeppettoError> {
//! let engine = EngineRegistry::global().build(&settings)?;
//!
//! let mut tools = ToolRegistry::new();
//! tools.register(tool_fn(
//!     ToolDefinition::new("add", "Adds a and b"),
//!     |args: Value| async move {
//!         Ok::<_, geppetto::tool::ToolError>(json!(args["a"].as_f64().unwrap_or(0.0) + args["b"].as_f64().unwrap_or(0.0)))
//!     },
//! ));
//!
//! let engine = EngineWithMiddleware::new(Arc::from(engine))
//!     .with(ToolMiddleware::new(Arc::new(tools), ToolConfig::default()));
//!
//! let turn = Turn::with_blocks([Block::user_text("What is 2 + 3?")]);
//! let turn = engine.run_inference(&InferenceContext::new(), turn).await?;
//! println!("{}", turn.assistant_text());
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`turns`] | Turn and Block model, branch index |
//! | [`conversation`] | Versioned conversation state, mutations, validated snapshots |
//! | [`events`] | Normalized events, sinks and the in-process bus |
//! | [`context`] | Cancellation plus context-carried sinks |
//! | [`engine`] | Engine traits, settings, per-turn overrides, middleware, registry |
//! | [`tool`] | Tool definitions, provider adapters, registry and the tool loop |
//! | [`cache`] | Memory and disk inference caches |
//! | [`sse`] | Incremental Server-Sent Events decoding for provider crates |
//! | [`error`] | Unified [`GeppettoError`] |

#![warn(missing_docs)]

mod serde_util;

pub mod cache;
pub mod context;
pub mod conversation;
pub mod engine;
pub mod error;
pub mod events;
pub mod sse;
pub mod tool;
pub mod turns;

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_helpers;

// Only the types nearly every program touches live at the root:
//
//   geppetto::engine::*   settings, overrides, middleware, registry
//   geppetto::events::*   event variants, sinks, publishers
//   geppetto::tool::*     definitions, adapters, tool loop
//   geppetto::cache::*    caches and CachingEngine

pub use context::InferenceContext;
pub use conversation::{ConversationState, Mutation, SnapshotConfig};
pub use engine::{DynEngine, Engine, EngineRegistry, EngineWithMiddleware, Middleware, StepSettings};
pub use error::GeppettoError;
pub use events::{Event, EventSink};
pub use tool::{ToolConfig, ToolDefinition, ToolRegistry};
pub use turns::{Block, BlockKind, Turn};
