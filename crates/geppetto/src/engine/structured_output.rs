use serde::{Deserialize, Serialize};

use crate::error::GeppettoError;
use crate::turns::Payload;

/// Whether responses are constrained by a JSON schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StructuredOutputMode {
    /// Free-form output.
    #[default]
    Off,
    /// JSON-schema constrained output.
    JsonSchema,
}

/// A JSON-schema response format request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructuredOutputConfig {
    /// Mode.
    #[serde(default)]
    pub mode: StructuredOutputMode,
    /// Schema name (required by every provider).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Schema description.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// The JSON schema object.
    #[serde(default, skip_serializing_if = "Payload::is_empty")]
    pub schema: Payload,
    /// Strict adherence; `true` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strict: Option<bool>,
    /// Fail the build instead of dropping an unusable format.
    #[serde(default)]
    pub require_valid: bool,
}

impl StructuredOutputConfig {
    /// A JSON-schema config.
    pub fn json_schema(name: impl Into<String>, schema: Payload) -> Self {
        Self {
            mode: StructuredOutputMode::JsonSchema,
            name: name.into(),
            schema,
            ..Self::default()
        }
    }

    /// Whether the config asks for JSON-schema output.
    pub fn is_enabled(&self) -> bool {
        self.mode == StructuredOutputMode::JsonSchema
    }

    /// `strict`, defaulting to `true`.
    pub fn strict_or_default(&self) -> bool {
        self.strict.unwrap_or(true)
    }

    /// An enabled config must name its schema and carry one.
    pub fn validate(&self) -> Result<(), GeppettoError> {
        if !self.is_enabled() {
            return Ok(());
        }
        if self.name.trim().is_empty() {
            return Err(GeppettoError::StructuredOutput(
                "structured output mode \"json_schema\" requires a non-empty schema name".into(),
            ));
        }
        if self.schema.is_empty() {
            return Err(GeppettoError::StructuredOutput(
                "structured output mode \"json_schema\" requires a non-empty JSON schema".into(),
            ));
        }
        Ok(())
    }

    /// The turn override wins when present.
    pub fn resolve(default: Option<Self>, turn_override: Option<&Self>) -> Option<Self> {
        turn_override.cloned().or(default)
    }

    /// The config a request builder should attach, applying the
    /// validity policy: an invalid config fails the build when
    /// `require_valid` is set and is dropped otherwise.
    pub fn effective(config: Option<&Self>) -> Result<Option<&Self>, GeppettoError> {
        let Some(cfg) = config.filter(|c| c.is_enabled()) else {
            return Ok(None);
        };
        match cfg.validate() {
            Ok(()) => Ok(Some(cfg)),
            Err(e) if cfg.require_valid => Err(e),
            Err(e) => {
                tracing::warn!(error = %e, "ignoring invalid structured output config");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> Payload {
        json!({"type": "object"}).as_object().unwrap().clone()
    }

    #[test]
    fn test_validate_requires_name_and_schema() {
        let mut cfg = StructuredOutputConfig::json_schema("", schema());
        assert!(cfg.validate().is_err());
        cfg.name = "x".into();
        cfg.validate().unwrap();
        cfg.schema.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_effective_policy() {
        let mut cfg = StructuredOutputConfig::json_schema("", schema());
        assert!(StructuredOutputConfig::effective(Some(&cfg)).unwrap().is_none());
        cfg.require_valid = true;
        assert!(StructuredOutputConfig::effective(Some(&cfg)).is_err());

        let off = StructuredOutputConfig::default();
        assert!(StructuredOutputConfig::effective(Some(&off)).unwrap().is_none());
    }

    #[test]
    fn test_resolve_prefers_turn() {
        let default = StructuredOutputConfig::json_schema("a", schema());
        let turn = StructuredOutputConfig::json_schema("b", schema());
        let got = StructuredOutputConfig::resolve(Some(default.clone()), Some(&turn)).unwrap();
        assert_eq!(got.name, "b");
        let got = StructuredOutputConfig::resolve(Some(default), None).unwrap();
        assert_eq!(got.name, "a");
    }
}
