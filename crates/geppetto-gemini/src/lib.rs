//! Google Gemini engine for geppetto.
//!
//! [`GeminiEngine`] serves the `gemini` API type through the REST
//! `streamGenerateContent` endpoint (`alt=sse`). Text chunks become
//! `partial_completion` events; each `functionCall` part is complete
//! on arrival and is published as a `tool_call` immediately.
//!
//! ```rust,no_run
//! use geppetto::engine::{ApiSettings, ApiType, EngineRegistry, StepSettings};
//! use geppetto::{Block, Engine, InferenceContext, Turn};
//!
//! # async fn example() -> Result<(), geppetto::GeppettoError> {
//! geppetto_gemini::register_global();
//!
//! let mut settings = StepSettings::default();
//! settings.chat.api_type = Some(ApiType::Gemini);
//! settings.chat.engine = Some("gemini-2.0-flash".into());
//! settings.api = ApiSettings::default()
//!     .with_api_key(ApiType::Gemini, std::env::var("GEMINI_API_KEY").unwrap_or_default());
//!
//! let engine = EngineRegistry::global().build(&settings)?;
//! let turn = Turn::with_blocks([Block::user_text("Hello!")]);
//! let turn = engine.run_inference(&InferenceContext::new(), turn).await?;
//! println!("{}", turn.assistant_text());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

mod client;
mod config;
mod convert;
mod engine;
mod factory;
mod stream;
mod types;

pub use config::GeminiConfig;
pub use engine::GeminiEngine;
pub use factory::{GeminiFactory, register, register_global};
pub use stream::{ChunkUpdate, GeminiStreamState, StreamedCall};
pub use types::{
    ApiError, Blob, Candidate, Content, FileData, FunctionCall, FunctionResponse,
    GenerateContentResponse, Part, PromptFeedback, UsageMetadata,
};
