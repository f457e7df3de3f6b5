//! Anthropic Messages engine for geppetto.
//!
//! [`AnthropicEngine`] serves the `claude` API type over
//! `POST /v1/messages` with streaming. The stream is folded by
//! [`ContentBlockMerger`], which rebuilds the content blocks
//! (text, `tool_use`, thinking) and publishes normalized events as
//! they complete.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use geppetto::{Block, Engine, InferenceContext, Turn};
//! use geppetto::engine::StepSettings;
//! use geppetto_anthropic::{AnthropicConfig, AnthropicEngine};
//!
//! # async fn example() -> Result<(), geppetto::GeppettoError> {
//! let engine = AnthropicEngine::new(
//!     AnthropicConfig {
//!         api_key: std::env::var("ANTHROPIC_API_KEY").unwrap_or_default(),
//!         ..Default::default()
//!     },
//!     StepSettings::default(),
//! )?;
//!
//! let turn = Turn::with_blocks([
//!     Block::system_text("Answer in one sentence."),
//!     Block::user_text("Why is the sky blue?"),
//! ]);
//! let turn = engine.run_inference(&InferenceContext::new(), turn).await?;
//! println!("{}", turn.assistant_text());
//! # Ok(())
//! # }
//! ```
//!
//! Settings-driven construction goes through the registry after
//! [`register_global`].

#![warn(missing_docs)]

mod client;
mod config;
mod convert;
mod engine;
mod factory;
mod merger;
mod types;

pub use config::AnthropicConfig;
pub use engine::AnthropicEngine;
pub use factory::{AnthropicFactory, register, register_global};
pub use merger::ContentBlockMerger;
pub use types::{
    ApiError, Content, ImageContent, ImageSource, Message, MessageResponse, MessageUsage,
    RedactedThinkingContent, StreamContentBlock, StreamDelta, StreamEvent, TextContent,
    ThinkingContent, ToolResultContent, ToolUseContent,
};
