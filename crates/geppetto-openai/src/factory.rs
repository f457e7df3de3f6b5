//! Factories for building `OpenAI` engines from settings.

use geppetto::engine::{ApiType, EngineFactory, EngineRegistry, StepSettings};
use geppetto::{DynEngine, GeppettoError};

use crate::{OpenAiEngine, OpenAiResponsesEngine};

/// Builds [`OpenAiEngine`]s for one OpenAI-compatible API type.
///
/// ```rust
/// use geppetto::engine::EngineRegistry;
/// use geppetto_openai::OpenAiFactory;
///
/// let registry = EngineRegistry::new();
/// registry.register(Box::new(OpenAiFactory::new(geppetto::engine::ApiType::Fireworks)));
/// assert!(registry.contains("fireworks"));
/// ```
///
/// # Settings
///
/// | Entry | Required | Description |
/// |-------|----------|-------------|
/// | `chat.engine` | Yes | Model identifier |
/// | `api.api_keys["<type>-api-key"]` | Yes | Credential |
/// | `api.base_urls["<type>-base-url"]` | `anyscale`, `fireworks` | Endpoint |
/// | `client.organization` | No | `OpenAI-Organization` header |
/// | `client.timeout` | No | Request timeout |
#[derive(Debug, Clone, Copy)]
pub struct OpenAiFactory {
    api_type: ApiType,
}

impl OpenAiFactory {
    /// A factory serving `api_type`, which must be OpenAI-compatible.
    ///
    /// # Panics
    ///
    /// Panics in debug builds when `api_type` is not OpenAI-compatible.
    pub fn new(api_type: ApiType) -> Self {
        debug_assert!(api_type.is_openai_compatible(), "{api_type} is not OpenAI-compatible");
        Self { api_type }
    }
}

impl Default for OpenAiFactory {
    fn default() -> Self {
        Self::new(ApiType::OpenAi)
    }
}

impl EngineFactory for OpenAiFactory {
    fn name(&self) -> &str {
        self.api_type.as_str()
    }

    fn build(&self, settings: &StepSettings) -> Result<Box<dyn DynEngine>, GeppettoError> {
        Ok(Box::new(OpenAiEngine::from_settings(settings)?))
    }
}

/// Builds [`OpenAiResponsesEngine`]s for `openai-responses`.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenAiResponsesFactory;

impl EngineFactory for OpenAiResponsesFactory {
    fn name(&self) -> &str {
        ApiType::OpenAiResponses.as_str()
    }

    fn build(&self, settings: &StepSettings) -> Result<Box<dyn DynEngine>, GeppettoError> {
        Ok(Box::new(OpenAiResponsesEngine::from_settings(settings)?))
    }
}

/// Registers every `OpenAI` factory with `registry`.
pub fn register(registry: &EngineRegistry) {
    for api_type in [ApiType::OpenAi, ApiType::AnyScale, ApiType::Fireworks] {
        registry.register(Box::new(OpenAiFactory::new(api_type)));
    }
    registry.register(Box::new(OpenAiResponsesFactory));
}

/// Registers every `OpenAI` factory with the global registry.
///
/// Call this once at application startup to enable settings-driven
/// engine creation for `openai`, `anyscale`, `fireworks` and
/// `openai-responses`.
pub fn register_global() {
    register(EngineRegistry::global());
}

#[cfg(test)]
mod tests {
    use geppetto::engine::ApiSettings;

    use super::*;

    #[test]
    fn test_register_all_api_types() {
        let registry = EngineRegistry::new();
        register(&registry);
        assert_eq!(
            registry.providers(),
            vec!["anyscale", "fireworks", "openai", "openai-responses"]
        );
    }

    #[test]
    fn test_build_from_registry() {
        let registry = EngineRegistry::new();
        register(&registry);

        let mut settings = StepSettings::default();
        settings.chat.engine = Some("gpt-4o-mini".into());
        settings.api = ApiSettings::default().with_api_key(ApiType::OpenAi, "sk-test");
        assert!(registry.build(&settings).is_ok());

        settings.chat.api_type = Some(ApiType::OpenAiResponses);
        assert!(registry.build(&settings).is_ok());
    }

    #[test]
    fn test_fireworks_requires_base_url() {
        let registry = EngineRegistry::new();
        register(&registry);

        let mut settings = StepSettings::default();
        settings.chat.api_type = Some(ApiType::Fireworks);
        settings.chat.engine = Some("llama".into());
        settings.api = ApiSettings::default().with_api_key(ApiType::Fireworks, "fw");
        let err = registry.build(&settings).err().expect("expected build error");
        assert!(err.to_string().contains("fireworks-base-url"));
    }
}
