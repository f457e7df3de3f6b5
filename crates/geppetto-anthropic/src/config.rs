//! Anthropic engine configuration.

use std::time::Duration;

use geppetto::GeppettoError;
use geppetto::engine::{ApiType, StepSettings};

/// Connection settings for the Anthropic Messages API.
///
/// Use struct update syntax with [`Default`] for ad-hoc construction, or
/// [`from_settings`](Self::from_settings) to resolve it from
/// [`StepSettings`]:
///
/// ```rust
/// use geppetto_anthropic::AnthropicConfig;
///
/// let config = AnthropicConfig {
///     api_key: "sk-ant-...".into(),
///     model: "claude-sonnet-4-20250514".into(),
///     ..Default::default()
/// };
/// assert_eq!(config.api_version, "2023-06-01");
/// ```
#[derive(Clone)]
pub struct AnthropicConfig {
    /// Anthropic API key. Required.
    pub api_key: String,
    /// Model identifier (e.g. `"claude-sonnet-4-20250514"`).
    pub model: String,
    /// Base URL for the API. Override for proxies or testing.
    pub base_url: String,
    /// `max_tokens` when neither the turn nor the settings set one.
    pub max_tokens: u32,
    /// `anthropic-version` header.
    pub api_version: String,
    /// Request timeout. `None` uses reqwest's default.
    pub timeout: Option<Duration>,
    /// `User-Agent` override.
    pub user_agent: Option<String>,
    /// Pre-configured HTTP client for connection pooling.
    /// When `None`, a new client is created.
    pub client: Option<reqwest::Client>,
}

impl std::fmt::Debug for AnthropicConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicConfig")
            .field("api_key", &"[REDACTED]")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("max_tokens", &self.max_tokens)
            .field("api_version", &self.api_version)
            .field("timeout", &self.timeout)
            .field("user_agent", &self.user_agent)
            .field("client", &self.client.as_ref().map(|_| "..."))
            .finish()
    }
}

impl Default for AnthropicConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: "claude-sonnet-4-20250514".into(),
            base_url: "https://api.anthropic.com".into(),
            max_tokens: 1024,
            api_version: "2023-06-01".into(),
            timeout: None,
            user_agent: None,
            client: None,
        }
    }
}

impl AnthropicConfig {
    /// Resolves the config from `claude-api-key` and the optional
    /// `claude-base-url`.
    ///
    /// # Errors
    ///
    /// [`GeppettoError::InvalidRequest`] when the API type is not
    /// `claude`, or the key or model is missing.
    pub fn from_settings(settings: &StepSettings) -> Result<Self, GeppettoError> {
        let api_type = settings.api_type();
        if api_type != ApiType::Claude {
            return Err(GeppettoError::InvalidRequest(format!(
                "{api_type} is not served by the Anthropic engine"
            )));
        }
        settings.validate()?;

        let api_key = settings
            .api
            .api_key(ApiType::Claude)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                GeppettoError::InvalidRequest(format!(
                    "missing API key {}",
                    ApiType::Claude.api_key_name()
                ))
            })?
            .to_string();

        let mut config = Self {
            api_key,
            model: settings.engine()?.to_string(),
            timeout: settings.client.timeout,
            user_agent: settings.client.user_agent.clone(),
            ..Default::default()
        };
        if let Some(url) = settings.api.base_url(ApiType::Claude).filter(|u| !u.is_empty()) {
            config.base_url = url.to_string();
        }
        Ok(config)
    }

    /// The `/v1/messages` URL, tolerating a trailing slash or a base URL
    /// that already ends in `/v1`.
    pub(crate) fn messages_url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        let base = base.strip_suffix("/v1").unwrap_or(base);
        format!("{base}/v1/messages")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geppetto::engine::ApiSettings;

    fn settings() -> StepSettings {
        let mut s = StepSettings::default();
        s.chat.api_type = Some(ApiType::Claude);
        s.chat.engine = Some("claude-3-5-haiku-latest".into());
        s
    }

    #[test]
    fn test_default_config() {
        let config = AnthropicConfig::default();
        assert_eq!(config.base_url, "https://api.anthropic.com");
        assert_eq!(config.max_tokens, 1024);
        assert_eq!(config.api_version, "2023-06-01");
        assert!(config.api_key.is_empty());
        assert!(config.client.is_none());
    }

    #[test]
    fn test_debug_redacts_api_key() {
        let config = AnthropicConfig {
            api_key: "sk-ant-super-secret".into(),
            ..Default::default()
        };
        let debug_output = format!("{config:?}");
        assert!(!debug_output.contains("sk-ant-super-secret"));
        assert!(debug_output.contains("[REDACTED]"));
    }

    #[test]
    fn test_from_settings() {
        let mut s = settings();
        s.api = ApiSettings::default()
            .with_api_key(ApiType::Claude, "sk-ant")
            .with_base_url(ApiType::Claude, "https://proxy.example.com/");

        let config = AnthropicConfig::from_settings(&s).unwrap();
        assert_eq!(config.api_key, "sk-ant");
        assert_eq!(config.model, "claude-3-5-haiku-latest");
        assert_eq!(config.messages_url(), "https://proxy.example.com/v1/messages");
    }

    #[test]
    fn test_from_settings_missing_key() {
        let err = AnthropicConfig::from_settings(&settings()).unwrap_err();
        assert!(err.to_string().contains("claude-api-key"));
    }

    #[test]
    fn test_from_settings_rejects_openai() {
        let mut s = settings();
        s.chat.api_type = Some(ApiType::OpenAi);
        s.api = ApiSettings::default().with_api_key(ApiType::OpenAi, "sk");
        assert!(matches!(
            AnthropicConfig::from_settings(&s),
            Err(GeppettoError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_messages_url_accepts_v1_suffix() {
        let config = AnthropicConfig {
            base_url: "http://localhost:8080/v1".into(),
            ..Default::default()
        };
        assert_eq!(config.messages_url(), "http://localhost:8080/v1/messages");
    }
}
