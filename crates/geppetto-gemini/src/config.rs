//! Gemini engine configuration.

use std::time::Duration;

use geppetto::GeppettoError;
use geppetto::engine::{ApiType, StepSettings};

/// Connection settings for the Gemini `generateContent` REST API.
///
/// ```rust
/// use geppetto_gemini::GeminiConfig;
///
/// let config = GeminiConfig {
///     api_key: "AIza...".into(),
///     model: "gemini-2.0-flash".into(),
///     ..Default::default()
/// };
/// assert_eq!(config.api_version, "v1beta");
/// ```
#[derive(Clone)]
pub struct GeminiConfig {
    /// API key, sent as `x-goog-api-key`. Required.
    pub api_key: String,
    /// Model identifier, with or without the `models/` prefix.
    pub model: String,
    /// Base URL. Override for proxies or testing.
    pub base_url: String,
    /// API version path segment, used unless `base_url` already ends in one.
    pub api_version: String,
    /// Request timeout. `None` uses reqwest's default.
    pub timeout: Option<Duration>,
    /// `User-Agent` override.
    pub user_agent: Option<String>,
    /// Pre-configured HTTP client for connection pooling.
    /// When `None`, a new client is created.
    pub client: Option<reqwest::Client>,
}

impl std::fmt::Debug for GeminiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiConfig")
            .field("api_key", &"[REDACTED]")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("api_version", &self.api_version)
            .field("timeout", &self.timeout)
            .field("user_agent", &self.user_agent)
            .field("client", &self.client.as_ref().map(|_| "..."))
            .finish()
    }
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: "gemini-2.0-flash".into(),
            base_url: "https://generativelanguage.googleapis.com".into(),
            api_version: "v1beta".into(),
            timeout: None,
            user_agent: None,
            client: None,
        }
    }
}

impl GeminiConfig {
    /// Resolves the config from `gemini-api-key` and the optional
    /// `gemini-base-url`.
    ///
    /// # Errors
    ///
    /// [`GeppettoError::InvalidRequest`] when the API type is not
    /// `gemini`, or the key or model is missing.
    pub fn from_settings(settings: &StepSettings) -> Result<Self, GeppettoError> {
        let api_type = settings.api_type();
        if api_type != ApiType::Gemini {
            return Err(GeppettoError::InvalidRequest(format!(
                "{api_type} is not served by the Gemini engine"
            )));
        }
        settings.validate()?;

        let api_key = settings
            .api
            .api_key(ApiType::Gemini)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                GeppettoError::InvalidRequest(format!(
                    "missing API key {}",
                    ApiType::Gemini.api_key_name()
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
        if let Some(url) = settings.api.base_url(ApiType::Gemini).filter(|u| !u.is_empty()) {
            config.base_url = url.to_string();
        }
        Ok(config)
    }

    /// The model name without a `models/` prefix.
    pub(crate) fn model_name(&self) -> &str {
        self.model.strip_prefix("models/").unwrap_or(&self.model)
    }

    /// The streaming endpoint for the configured model.
    pub(crate) fn stream_url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        let versioned = ["/v1", "/v1beta", "/v1alpha"]
            .iter()
            .any(|suffix| base.ends_with(suffix));
        let root = if versioned {
            base.to_string()
        } else {
            format!("{base}/{}", self.api_version)
        };
        format!("{root}/models/{}:streamGenerateContent?alt=sse", self.model_name())
    }
}
