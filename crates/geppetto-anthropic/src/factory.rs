//! Factory for building Anthropic engines from settings.

use geppetto::engine::{ApiType, EngineFactory, EngineRegistry, StepSettings};
use geppetto::{DynEngine, GeppettoError};

use crate::AnthropicEngine;

/// Builds [`AnthropicEngine`]s for the `claude` API type.
///
/// # Settings
///
/// | Entry | Required | Description |
/// |-------|----------|-------------|
/// | `chat.engine` | Yes | Model identifier |
/// | `api.api_keys["claude-api-key"]` | Yes | Credential |
/// | `api.base_urls["claude-base-url"]` | No | Endpoint override |
/// | `claude.user_id` / `claude.top_k` | No | Request defaults |
/// | `claude.thinking_budget` | No | Extended thinking budget |
/// | `client.timeout` | No | Request timeout |
#[derive(Debug, Clone, Copy, Default)]
pub struct AnthropicFactory;

impl EngineFactory for AnthropicFactory {
    fn name(&self) -> &str {
        ApiType::Claude.as_str()
    }

    fn build(&self, settings: &StepSettings) -> Result<Box<dyn DynEngine>, GeppettoError> {
        Ok(Box::new(AnthropicEngine::from_settings(settings)?))
    }
}

/// Registers the Anthropic factory with `registry`.
pub fn register(registry: &EngineRegistry) {
    registry.register(Box::new(AnthropicFactory));
}

/// Registers the Anthropic factory with the global registry.
pub fn register_global() {
    register(EngineRegistry::global());
}

#[cfg(test)]
mod tests {
    use geppetto::engine::ApiSettings;

    use super::*;

    #[test]
    fn test_register() {
        let registry = EngineRegistry::new();
        register(&registry);
        assert_eq!(registry.providers(), vec!["claude"]);
    }

    #[test]
    fn test_build_from_registry() {
        let registry = EngineRegistry::new();
        register(&registry);

        let mut settings = StepSettings::default();
        settings.chat.api_type = Some(ApiType::Claude);
        settings.chat.engine = Some("claude-3-5-haiku-latest".into());
        assert!(registry.build(&settings).is_err());

        settings.api = ApiSettings::default().with_api_key(ApiType::Claude, "sk-ant-test");
        assert!(registry.build(&settings).is_ok());
    }
}
