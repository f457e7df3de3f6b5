//! `OpenAI` engines for geppetto.
//!
//! Two engines share one connection config:
//!
//! | Engine | Endpoint | API types |
//! |--------|----------|-----------|
//! | [`OpenAiEngine`] | `POST /chat/completions` | `openai`, `anyscale`, `fireworks` |
//! | [`OpenAiResponsesEngine`] | `POST /responses` | `openai-responses` |
//!
//! Both stream over SSE, publish normalized events while the stream
//! runs and append the model's output to the Turn as blocks.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use geppetto::{Block, Engine, InferenceContext, Turn};
//! use geppetto::engine::StepSettings;
//! use geppetto_openai::{OpenAiConfig, OpenAiEngine};
//!
//! # async fn example() -> Result<(), geppetto::GeppettoError> {
//! let engine = OpenAiEngine::new(
//!     OpenAiConfig {
//!         api_key: std::env::var("OPENAI_API_KEY").unwrap_or_default(),
//!         model: "gpt-4o-mini".into(),
//!         ..Default::default()
//!     },
//!     StepSettings::default(),
//! )?;
//!
//! let turn = Turn::with_blocks([Block::user_text("Hello!")]);
//! let turn = engine.run_inference(&InferenceContext::new(), turn).await?;
//! println!("{}", turn.assistant_text());
//! # Ok(())
//! # }
//! ```
//!
//! With settings-driven construction, register the factories once and
//! build through the registry:
//!
//! ```rust,no_run
//! # fn example(settings: geppetto::engine::StepSettings) -> Result<(), geppetto::GeppettoError> {
//! geppetto_openai::register_global();
//! let engine = geppetto::EngineRegistry::global().build(&settings)?;
//! # let _ = engine;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

mod client;
mod config;
mod convert;
mod engine;
mod factory;
mod responses;
mod stream;
mod types;

pub use config::OpenAiConfig;
pub use engine::OpenAiEngine;
pub use factory::{OpenAiFactory, OpenAiResponsesFactory, register, register_global};
pub use responses::OpenAiResponsesEngine;
pub use stream::{MergedToolCall, ToolCallMerger};
pub use types::{FunctionDelta, ToolCallDelta};
