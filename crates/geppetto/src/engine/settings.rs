//! Fully-resolved step settings handed to engine factories.
//!
//! Loading these from files, flags or profiles is the caller's job; the
//! core only consumes the resolved value. Credentials and endpoints are
//! looked up by provider name: `<provider>-api-key` in
//! [`ApiSettings::api_keys`] and `<provider>-base-url` in
//! [`ApiSettings::base_urls`].

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::StructuredOutputConfig;
use super::structured_output::StructuredOutputMode;
use crate::error::GeppettoError;
use crate::turns::Payload;

/// The upstream API family an engine talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApiType {
    /// OpenAI Chat Completions.
    #[default]
    #[serde(rename = "openai")]
    OpenAi,
    /// Anyscale (OpenAI-compatible).
    #[serde(rename = "anyscale")]
    AnyScale,
    /// Fireworks (OpenAI-compatible).
    Fireworks,
    /// OpenAI Responses API.
    #[serde(rename = "openai-responses")]
    OpenAiResponses,
    /// Anthropic Messages API.
    #[serde(alias = "anthropic")]
    Claude,
    /// Google Gemini.
    Gemini,
}

impl ApiType {
    /// All API types, in registry order.
    pub const ALL: [ApiType; 6] = [
        ApiType::OpenAi,
        ApiType::AnyScale,
        ApiType::Fireworks,
        ApiType::OpenAiResponses,
        ApiType::Claude,
        ApiType::Gemini,
    ];

    /// The canonical lowercase name, also the credential key prefix.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::AnyScale => "anyscale",
            Self::Fireworks => "fireworks",
            Self::OpenAiResponses => "openai-responses",
            Self::Claude => "claude",
            Self::Gemini => "gemini",
        }
    }

    /// Whether this provider speaks the Chat Completions wire format.
    pub fn is_openai_compatible(self) -> bool {
        matches!(self, Self::OpenAi | Self::AnyScale | Self::Fireworks)
    }

    /// Key under which the API key is stored.
    pub fn api_key_name(self) -> String {
        format!("{}-api-key", self.as_str())
    }

    /// Key under which the base URL is stored.
    pub fn base_url_name(self) -> String {
        format!("{}-base-url", self.as_str())
    }
}

impl fmt::Display for ApiType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApiType {
    type Err = GeppettoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "anyscale" => Ok(Self::AnyScale),
            "fireworks" => Ok(Self::Fireworks),
            "openai-responses" => Ok(Self::OpenAiResponses),
            "claude" | "anthropic" => Ok(Self::Claude),
            "gemini" => Ok(Self::Gemini),
            other => Err(GeppettoError::InvalidRequest(format!(
                "unsupported provider {other}"
            ))),
        }
    }
}

/// Credentials and endpoints keyed by `<provider>-api-key` /
/// `<provider>-base-url`.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct ApiSettings {
    /// API keys.
    #[serde(default)]
    pub api_keys: HashMap<String, String>,
    /// Base URLs.
    #[serde(default)]
    pub base_urls: HashMap<String, String>,
}

impl fmt::Debug for ApiSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.api_keys.keys().collect();
        keys.sort();
        f.debug_struct("ApiSettings")
            .field("api_keys", &keys)
            .field("base_urls", &self.base_urls)
            .finish()
    }
}

impl ApiSettings {
    /// The API key for `api_type`, if configured.
    pub fn api_key(&self, api_type: ApiType) -> Option<&str> {
        self.api_keys
            .get(&api_type.api_key_name())
            .map(String::as_str)
    }

    /// The base URL for `api_type`, if configured.
    pub fn base_url(&self, api_type: ApiType) -> Option<&str> {
        self.base_urls
            .get(&api_type.base_url_name())
            .map(String::as_str)
    }

    /// Sets the API key for `api_type`.
    #[must_use]
    pub fn with_api_key(mut self, api_type: ApiType, key: impl Into<String>) -> Self {
        self.api_keys.insert(api_type.api_key_name(), key.into());
        self
    }

    /// Sets the base URL for `api_type`.
    #[must_use]
    pub fn with_base_url(mut self, api_type: ApiType, url: impl Into<String>) -> Self {
        self.base_urls.insert(api_type.base_url_name(), url.into());
        self
    }
}

/// Which cache wraps the engine, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheType {
    /// No caching.
    #[default]
    None,
    /// In-memory LRU.
    Memory,
    /// On-disk LRU.
    Disk,
}

/// Provider-neutral chat settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatSettings {
    /// Model name.
    pub engine: Option<String>,
    /// API family; `openai` when unset.
    pub api_type: Option<ApiType>,
    /// Output token cap.
    pub max_response_tokens: Option<u32>,
    /// Nucleus sampling.
    pub top_p: Option<f64>,
    /// Sampling temperature.
    pub temperature: Option<f64>,
    /// Stop sequences.
    pub stop: Vec<String>,
    /// Stream responses. Engines always stream; kept for settings echo.
    pub stream: bool,

    /// Cache back-end.
    pub cache_type: CacheType,
    /// Disk cache byte budget.
    pub cache_max_size: Option<u64>,
    /// Cache entry budget.
    pub cache_max_entries: Option<usize>,
    /// Disk cache directory.
    pub cache_directory: Option<std::path::PathBuf>,

    /// Structured-output mode.
    pub structured_output_mode: StructuredOutputMode,
    /// Schema name.
    pub structured_output_name: String,
    /// Schema description.
    pub structured_output_description: String,
    /// Schema as raw JSON text.
    pub structured_output_schema: String,
    /// Strict schema adherence.
    pub structured_output_strict: bool,
    /// Fail the request when the schema cannot be used.
    pub structured_output_require_valid: bool,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            engine: None,
            api_type: None,
            max_response_tokens: None,
            top_p: None,
            temperature: None,
            stop: Vec::new(),
            stream: true,
            cache_type: CacheType::None,
            cache_max_size: None,
            cache_max_entries: None,
            cache_directory: None,
            structured_output_mode: StructuredOutputMode::Off,
            structured_output_name: String::new(),
            structured_output_description: String::new(),
            structured_output_schema: String::new(),
            structured_output_strict: true,
            structured_output_require_valid: false,
        }
    }
}

impl ChatSettings {
    /// Whether JSON-schema structured output is configured.
    pub fn is_structured_output_enabled(&self) -> bool {
        self.structured_output_mode == StructuredOutputMode::JsonSchema
    }

    /// Parses the raw schema text. Blank text is `None`.
    pub fn parse_structured_output_schema(&self) -> Result<Option<Payload>, GeppettoError> {
        let raw = self.structured_output_schema.trim();
        if raw.is_empty() {
            return Ok(None);
        }
        serde_json::from_str::<Payload>(raw).map(Some).map_err(|e| {
            GeppettoError::StructuredOutput(format!(
                "invalid ai-structured-output-schema JSON: {e}"
            ))
        })
    }

    /// The chat-level structured-output config, if enabled.
    ///
    /// An unparseable schema is an error only when
    /// `structured_output_require_valid` is set; otherwise structured
    /// output is silently dropped.
    pub fn structured_output_config(&self) -> Result<Option<StructuredOutputConfig>, GeppettoError> {
        if !self.is_structured_output_enabled() {
            return Ok(None);
        }
        let schema = match self.parse_structured_output_schema() {
            Ok(Some(schema)) => schema,
            Ok(None) if !self.structured_output_require_valid => return Ok(None),
            Err(_) if !self.structured_output_require_valid => return Ok(None),
            Ok(None) => {
                return Err(GeppettoError::StructuredOutput(
                    "structured output requires a non-empty JSON schema".into(),
                ));
            }
            Err(e) => return Err(e),
        };
        Ok(Some(StructuredOutputConfig {
            mode: StructuredOutputMode::JsonSchema,
            name: self.structured_output_name.clone(),
            description: self.structured_output_description.clone(),
            schema,
            strict: Some(self.structured_output_strict),
            require_valid: self.structured_output_require_valid,
        }))
    }
}

/// OpenAI-specific defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenAiSettings {
    /// Number of choices.
    pub n: Option<u32>,
    /// Presence penalty.
    pub presence_penalty: Option<f64>,
    /// Frequency penalty.
    pub frequency_penalty: Option<f64>,
    /// Responses API reasoning effort (`low` / `medium` / `high`).
    pub reasoning_effort: Option<String>,
    /// Responses API reasoning summary (`auto` / `concise` / `detailed`).
    pub reasoning_summary: Option<String>,
    /// Ask the Responses API for encrypted reasoning content.
    pub include_reasoning_encrypted: bool,
    /// Responses API `store`.
    pub store: Option<bool>,
    /// Responses API `service_tier`.
    pub service_tier: Option<String>,
}

/// Anthropic-specific defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClaudeSettings {
    /// `metadata.user_id`.
    pub user_id: Option<String>,
    /// Top-k sampling.
    pub top_k: Option<u32>,
    /// Extended thinking token budget.
    pub thinking_budget: Option<u32>,
}

/// Gemini-specific defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GeminiSettings {
    /// Top-k sampling.
    pub top_k: Option<u32>,
    /// Number of candidates.
    pub candidate_count: Option<u32>,
}

/// HTTP client knobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    /// Request timeout.
    #[serde(with = "crate::serde_util::option_duration_secs")]
    pub timeout: Option<Duration>,
    /// OpenAI organization header.
    pub organization: Option<String>,
    /// `User-Agent` override.
    pub user_agent: Option<String>,
}

/// Everything an engine factory needs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StepSettings {
    /// Credentials and endpoints.
    pub api: ApiSettings,
    /// Provider-neutral chat settings.
    pub chat: ChatSettings,
    /// OpenAI extras.
    pub openai: OpenAiSettings,
    /// Anthropic extras.
    pub claude: ClaudeSettings,
    /// Gemini extras.
    pub gemini: GeminiSettings,
    /// HTTP client.
    pub client: ClientSettings,
}

impl StepSettings {
    /// The configured API type, `openai` when unset.
    pub fn api_type(&self) -> ApiType {
        self.chat.api_type.unwrap_or_default()
    }

    /// The configured model, or an error naming the API type.
    pub fn engine(&self) -> Result<&str, GeppettoError> {
        self.chat
            .engine
            .as_deref()
            .filter(|e| !e.trim().is_empty())
            .ok_or_else(|| {
                GeppettoError::InvalidRequest(format!("no engine specified for {}", self.api_type()))
            })
    }

    /// Checks that credentials for the configured API type are present.
    ///
    /// OpenAI-compatible providers other than `openai` itself must also
    /// carry a base URL.
    pub fn validate(&self) -> Result<(), GeppettoError> {
        let api_type = self.api_type();
        let key_name = match api_type {
            // The Responses API shares the OpenAI credential.
            ApiType::OpenAiResponses => ApiType::OpenAi.api_key_name(),
            other => other.api_key_name(),
        };
        if !self.api.api_keys.contains_key(&key_name) {
            return Err(GeppettoError::InvalidRequest(format!(
                "missing API key {key_name}"
            )));
        }
        if api_type.is_openai_compatible()
            && api_type != ApiType::OpenAi
            && self.api.base_url(api_type).is_none()
        {
            return Err(GeppettoError::InvalidRequest(format!(
                "missing base URL {} for provider {api_type}",
                api_type.base_url_name()
            )));
        }
        Ok(())
    }

    /// Non-default settings as a flat map, for turn and step metadata.
    pub fn metadata(&self) -> Payload {
        let mut out = Payload::new();
        if let Some(engine) = &self.chat.engine {
            out.insert("ai-engine".into(), engine.clone().into());
        }
        if let Some(api_type) = self.chat.api_type {
            out.insert("ai-api-type".into(), api_type.as_str().into());
            if let Some(url) = self.api.base_url(api_type) {
                out.insert("ai-base-url".into(), url.into());
            }
        }
        if let Some(max) = self.chat.max_response_tokens {
            out.insert("ai-max-response-tokens".into(), max.into());
        }
        if let Some(top_p) = self.chat.top_p.filter(|v| (*v - 1.0).abs() > f64::EPSILON) {
            out.insert("ai-top-p".into(), top_p.into());
        }
        if let Some(t) = self.chat.temperature {
            out.insert("ai-temperature".into(), t.into());
        }
        if !self.chat.stop.is_empty() {
            out.insert("ai-stop".into(), self.chat.stop.clone().into());
        }
        out.insert("ai-stream".into(), self.chat.stream.into());

        if let Some(n) = self.openai.n.filter(|n| *n != 1) {
            out.insert("openai-n".into(), n.into());
        }
        if let Some(p) = self.openai.presence_penalty.filter(|p| *p != 0.0) {
            out.insert("openai-presence-penalty".into(), p.into());
        }
        if let Some(p) = self.openai.frequency_penalty.filter(|p| *p != 0.0) {
            out.insert("openai-frequency-penalty".into(), p.into());
        }
        if let Some(timeout) = self.client.timeout {
            out.insert("timeout".into(), Value::from(timeout.as_secs()));
        }
        if let Some(org) = self.client.organization.as_ref().filter(|o| !o.is_empty()) {
            out.insert("organization".into(), org.clone().into());
        }
        if let Some(ua) = &self.client.user_agent {
            out.insert("user-agent".into(), ua.clone().into());
        }
        if let Some(k) = self.claude.top_k.filter(|k| *k != 1) {
            out.insert("claude-top-k".into(), k.into());
        }
        if let Some(user) = self.claude.user_id.as_ref().filter(|u| !u.is_empty()) {
            out.insert("claude-user-id".into(), user.clone().into());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(api_type: ApiType) -> StepSettings {
        let mut s = StepSettings::default();
        s.chat.api_type = Some(api_type);
        s.chat.engine = Some("model".into());
        s
    }

    #[test]
    fn test_api_type_parse_and_alias() {
        assert_eq!("anthropic".parse::<ApiType>().unwrap(), ApiType::Claude);
        assert_eq!("OpenAI".parse::<ApiType>().unwrap(), ApiType::OpenAi);
        assert!("cohere".parse::<ApiType>().is_err());

        let t: ApiType = serde_json::from_str("\"anthropic\"").unwrap();
        assert_eq!(t, ApiType::Claude);
        let t: ApiType = serde_json::from_str("\"openai-responses\"").unwrap();
        assert_eq!(t, ApiType::OpenAiResponses);
        assert_eq!(serde_json::to_string(&ApiType::OpenAi).unwrap(), "\"openai\"");
    }

    #[test]
    fn test_validate_missing_key() {
        let s = settings(ApiType::Claude);
        let err = s.validate().unwrap_err();
        assert!(err.to_string().contains("claude-api-key"));
    }

    #[test]
    fn test_validate_compatible_provider_needs_base_url() {
        let mut s = settings(ApiType::Fireworks);
        s.api = ApiSettings::default().with_api_key(ApiType::Fireworks, "k");
        let err = s.validate().unwrap_err();
        assert!(err.to_string().contains("fireworks-base-url"));

        s.api = s
            .api
            .clone()
            .with_base_url(ApiType::Fireworks, "https://fw.example");
        s.validate().unwrap();
    }

    #[test]
    fn test_validate_openai_without_base_url() {
        let mut s = settings(ApiType::OpenAi);
        s.api = ApiSettings::default().with_api_key(ApiType::OpenAi, "k");
        s.validate().unwrap();
    }

    #[test]
    fn test_responses_uses_openai_key() {
        let mut s = settings(ApiType::OpenAiResponses);
        s.api = ApiSettings::default().with_api_key(ApiType::OpenAi, "k");
        s.validate().unwrap();
    }

    #[test]
    fn test_api_settings_debug_hides_keys() {
        let api = ApiSettings::default().with_api_key(ApiType::OpenAi, "sk-secret");
        let debug = format!("{api:?}");
        assert!(!debug.contains("sk-secret"));
        assert!(debug.contains("openai-api-key"));
    }

    #[test]
    fn test_structured_output_config_policy() {
        let mut chat = ChatSettings {
            structured_output_mode: StructuredOutputMode::JsonSchema,
            structured_output_name: "person".into(),
            structured_output_schema: "{not json".into(),
            ..Default::default()
        };
        assert!(chat.structured_output_config().unwrap().is_none());

        chat.structured_output_require_valid = true;
        assert!(matches!(
            chat.structured_output_config(),
            Err(GeppettoError::StructuredOutput(_))
        ));

        chat.structured_output_schema = r#"{"type":"object"}"#.into();
        let cfg = chat.structured_output_config().unwrap().unwrap();
        assert_eq!(cfg.name, "person");
        assert!(cfg.strict_or_default());
    }

    #[test]
    fn test_metadata_skips_defaults() {
        let mut s = settings(ApiType::OpenAi);
        s.chat.top_p = Some(1.0);
        s.chat.temperature = Some(0.2);
        s.openai.n = Some(1);
        let meta = s.metadata();
        assert_eq!(meta["ai-engine"], "model");
        assert_eq!(meta["ai-temperature"], 0.2);
        assert!(!meta.contains_key("ai-top-p"));
        assert!(!meta.contains_key("openai-n"));
    }

    #[test]
    fn test_settings_deserialize_with_defaults() {
        let s: StepSettings = serde_json::from_value(serde_json::json!({
            "chat": {"engine": "gpt-4o", "api_type": "openai"},
            "client": {"timeout": 30}
        }))
        .unwrap();
        assert_eq!(s.engine().unwrap(), "gpt-4o");
        assert!(s.chat.stream);
        assert_eq!(s.client.timeout, Some(Duration::from_secs(30)));
    }
}
