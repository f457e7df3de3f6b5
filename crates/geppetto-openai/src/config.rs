//! `OpenAI` engine configuration.

use std::time::Duration;

use geppetto::GeppettoError;
use geppetto::engine::{ApiType, StepSettings};

/// Connection settings shared by the Chat Completions and Responses
/// engines.
///
/// Use struct update syntax with [`Default`] for ad-hoc construction, or
/// [`from_settings`](Self::from_settings) to resolve it from
/// [`StepSettings`]:
///
/// ```rust
/// use geppetto_openai::OpenAiConfig;
///
/// let config = OpenAiConfig {
///     api_key: "sk-...".into(),
///     model: "gpt-4o-mini".into(),
///     ..Default::default()
/// };
/// assert_eq!(config.base_url, "https://api.openai.com/v1");
/// ```
#[derive(Clone)]
pub struct OpenAiConfig {
    /// API key. Required.
    pub api_key: String,
    /// Model identifier (e.g. `"gpt-4o"`).
    pub model: String,
    /// Base URL. Override for proxies and OpenAI-compatible providers.
    pub base_url: String,
    /// Optional `OpenAI-Organization` header.
    pub organization: Option<String>,
    /// Request timeout. `None` uses reqwest's default.
    pub timeout: Option<Duration>,
    /// `User-Agent` override.
    pub user_agent: Option<String>,
    /// Pre-configured HTTP client for connection pooling.
    /// When `None`, a new client is created.
    pub client: Option<reqwest::Client>,
}

impl std::fmt::Debug for OpenAiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiConfig")
            .field("api_key", &"[REDACTED]")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("organization", &self.organization)
            .field("timeout", &self.timeout)
            .field("user_agent", &self.user_agent)
            .field("client", &self.client.as_ref().map(|_| "..."))
            .finish()
    }
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: "gpt-4o".into(),
            base_url: "https://api.openai.com/v1".into(),
            organization: None,
            timeout: None,
            user_agent: None,
            client: None,
        }
    }
}

impl OpenAiConfig {
    /// Resolves the config for the settings' API type.
    ///
    /// `openai-responses` shares the `openai-api-key` / `openai-base-url`
    /// entries; `anyscale` and `fireworks` use their own and must carry a
    /// base URL.
    ///
    /// # Errors
    ///
    /// [`GeppettoError::InvalidRequest`] when the API type is not an
    /// `OpenAI` one, or the key, model or required base URL is missing.
    pub fn from_settings(settings: &StepSettings) -> Result<Self, GeppettoError> {
        let api_type = settings.api_type();
        let credentials = match api_type {
            ApiType::OpenAiResponses => ApiType::OpenAi,
            t if t.is_openai_compatible() => t,
            other => {
                return Err(GeppettoError::InvalidRequest(format!(
                    "{other} is not served by the OpenAI engines"
                )));
            }
        };
        settings.validate()?;

        let api_key = settings
            .api
            .api_key(credentials)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                GeppettoError::InvalidRequest(format!(
                    "missing API key {}",
                    credentials.api_key_name()
                ))
            })?
            .to_string();

        let mut config = Self {
            api_key,
            model: settings.engine()?.to_string(),
            organization: settings
                .client
                .organization
                .clone()
                .filter(|o| !o.is_empty()),
            timeout: settings.client.timeout,
            user_agent: settings.client.user_agent.clone(),
            ..Default::default()
        };
        if let Some(url) = settings.api.base_url(credentials) {
            config.base_url = url.to_string();
        }
        Ok(config)
    }

    /// `base_url` joined with `path`, tolerating a trailing slash.
    pub(crate) fn endpoint(&self, path: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        format!("{base}/{path}")
    }
}
