//! The engine abstraction and its configuration.
//!
//! - **[`Engine`]** is what every provider adapter implements. It uses
//!   native async-fn-in-traits, so implementations are plain `async fn`s.
//!
//! - **[`DynEngine`]** is the object-safe mirror using boxed futures. A
//!   blanket `impl<T: Engine> DynEngine for T` bridges the two, so any
//!   engine can be stored as `Arc<dyn DynEngine>`.
//!
//! | Situation | Use |
//! |-----------|-----|
//! | Generic code that knows the concrete engine | `Engine` |
//! | Engines chosen from settings at runtime | `DynEngine` via [`EngineRegistry`] |
//! | Cross-cutting behavior around inference | [`Middleware`] + [`EngineWithMiddleware`] |
//!
//! An engine takes the [`Turn`] by value, appends the blocks the model
//! produced and hands it back. On error no Turn is returned; partial
//! output is observable only through the event stream.

mod inference_config;
pub mod middleware;
mod registry;
mod settings;
mod structured_output;

pub use inference_config::{ClaudeInferenceConfig, InferenceConfig, OpenAiInferenceConfig};
pub use middleware::{
    EngineWithMiddleware, Middleware, Next, SystemPromptMiddleware, ToolResultReorderMiddleware,
    TurnLoggingMiddleware,
};
pub use registry::{EngineFactory, EngineRegistry};
pub use settings::{
    ApiSettings, ApiType, CacheType, ChatSettings, ClaudeSettings, ClientSettings, GeminiSettings,
    OpenAiSettings, StepSettings,
};
pub use structured_output::{StructuredOutputConfig, StructuredOutputMode};

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::context::InferenceContext;
use crate::error::GeppettoError;
use crate::turns::Turn;

/// A boxed, sendable inference future.
pub type InferenceFuture<'a> = Pin<Box<dyn Future<Output = Result<Turn, GeppettoError>> + Send + 'a>>;

/// A provider adapter: runs one inference over a Turn.
///
/// # Object safety
///
/// `Engine` is not object-safe because it returns `impl Future`. Use
/// [`DynEngine`] for dynamic dispatch; every `Engine` implements it.
pub trait Engine: Send + Sync {
    /// Runs one inference and returns the Turn with the model's blocks
    /// appended.
    fn run_inference(
        &self,
        ctx: &InferenceContext,
        turn: Turn,
    ) -> impl Future<Output = Result<Turn, GeppettoError>> + Send;
}

/// Object-safe counterpart of [`Engine`].
///
/// ```rust
/// use std::sync::Arc;
/// use geppetto::{Block, DynEngine, Engine, GeppettoError, InferenceContext, Turn};
///
/// struct Echo;
///
/// impl Engine for Echo {
///     async fn run_inference(&self, _ctx: &InferenceContext, mut turn: Turn) -> Result<Turn, GeppettoError> {
///         let text = turn.blocks.last().and_then(Block::text).unwrap_or_default().to_string();
///         turn.append_block(Block::assistant_text(text));
///         Ok(turn)
///     }
/// }
///
/// let engine: Arc<dyn DynEngine> = Arc::new(Echo);
/// # let _ = engine;
/// ```
pub trait DynEngine: Send + Sync {
    /// Boxed-future version of [`Engine::run_inference`].
    fn run_inference_boxed<'a>(&'a self, ctx: &'a InferenceContext, turn: Turn) -> InferenceFuture<'a>;
}

impl<T: Engine> DynEngine for T {
    fn run_inference_boxed<'a>(&'a self, ctx: &'a InferenceContext, turn: Turn) -> InferenceFuture<'a> {
        Box::pin(self.run_inference(ctx, turn))
    }
}

impl Engine for Arc<dyn DynEngine> {
    async fn run_inference(&self, ctx: &InferenceContext, turn: Turn) -> Result<Turn, GeppettoError> {
        (**self).run_inference_boxed(ctx, turn).await
    }
}

impl Engine for Box<dyn DynEngine> {
    async fn run_inference(&self, ctx: &InferenceContext, turn: Turn) -> Result<Turn, GeppettoError> {
        (**self).run_inference_boxed(ctx, turn).await
    }
}
