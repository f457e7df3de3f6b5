//! Factory for building Gemini engines from settings.

use geppetto::engine::{ApiType, EngineFactory, EngineRegistry, StepSettings};
use geppetto::{DynEngine, GeppettoError};

use crate::GeminiEngine;

/// Builds [`GeminiEngine`]s for the `gemini` API type.
///
/// Requires `chat.engine` and `api.api_keys["gemini-api-key"]`;
/// `gemini.top_k` and `gemini.candidate_count` feed the generation
/// config.
#[derive(Debug, Clone, Copy, Default)]
pub struct GeminiFactory;

impl EngineFactory for GeminiFactory {
    fn name(&self) -> &str {
        ApiType::Gemini.as_str()
    }

    fn build(&self, settings: &StepSettings) -> Result<Box<dyn DynEngine>, GeppettoError> {
        Ok(Box::new(GeminiEngine::from_settings(settings)?))
    }
}

/// Registers the Gemini factory with `registry`.
pub fn register(registry: &EngineRegistry) {
    registry.register(Box::new(GeminiFactory));
}

/// Registers the Gemini factory with the global registry.
pub fn register_global() {
    register(EngineRegistry::global());
}
