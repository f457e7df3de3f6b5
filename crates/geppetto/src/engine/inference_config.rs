//! Per-turn inference overrides.
//!
//! Resolution order is turn data, then engine defaults, then chat
//! settings. `None` always means "not set, fall through".

use serde::{Deserialize, Serialize};

use crate::turns::Turn;

/// Provider-neutral sampling and reasoning overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InferenceConfig {
    /// Reasoning/thinking token budget.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_budget: Option<u32>,
    /// Reasoning depth: `low`, `medium`, `high`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
    /// Reasoning summary: `auto`, `concise`, `detailed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_summary: Option<String>,
    /// Sampling temperature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Nucleus sampling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    /// Output token cap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_response_tokens: Option<u32>,
    /// Stop sequences. `Some(vec![])` clears the engine's stop list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    /// Sampling seed (Chat Completions).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
}

impl InferenceConfig {
    /// Field-by-field merge where `self` (the turn) wins over `defaults`.
    #[must_use]
    pub fn merged_over(&self, defaults: &Self) -> Self {
        Self {
            thinking_budget: self.thinking_budget.or(defaults.thinking_budget),
            reasoning_effort: self
                .reasoning_effort
                .clone()
                .or_else(|| defaults.reasoning_effort.clone()),
            reasoning_summary: self
                .reasoning_summary
                .clone()
                .or_else(|| defaults.reasoning_summary.clone()),
            temperature: self.temperature.or(defaults.temperature),
            top_p: self.top_p.or(defaults.top_p),
            max_response_tokens: self.max_response_tokens.or(defaults.max_response_tokens),
            stop: self.stop.clone().or_else(|| defaults.stop.clone()),
            seed: self.seed.or(defaults.seed),
        }
    }

    /// Merges optional turn and engine configs.
    pub fn merge(turn: Option<&Self>, defaults: Option<&Self>) -> Option<Self> {
        match (turn, defaults) {
            (None, None) => None,
            (Some(t), None) => Some(t.clone()),
            (None, Some(d)) => Some(d.clone()),
            (Some(t), Some(d)) => Some(t.merged_over(d)),
        }
    }

    /// The effective config for `turn` over an engine default.
    pub fn resolve(turn: &Turn, defaults: Option<&Self>) -> Option<Self> {
        Self::merge(turn.data.inference_config.as_ref(), defaults)
    }

    /// Applies stop overrides to a settings-level stop list.
    pub fn apply_stop(&self, base: &[String]) -> Vec<String> {
        match &self.stop {
            Some(stop) => stop.clone(),
            None => base.to_vec(),
        }
    }
}

/// OpenAI-only per-turn overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OpenAiInferenceConfig {
    /// Number of choices.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<u32>,
    /// Presence penalty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
    /// Frequency penalty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    /// Responses API `store`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store: Option<bool>,
    /// Responses API `service_tier`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_tier: Option<String>,
}

/// Claude-only per-turn overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaudeInferenceConfig {
    /// `metadata.user_id`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Top-k sampling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_turn_fields_win() {
        let turn = InferenceConfig {
            temperature: Some(0.1),
            ..Default::default()
        };
        let defaults = InferenceConfig {
            temperature: Some(0.9),
            top_p: Some(0.5),
            ..Default::default()
        };
        let merged = InferenceConfig::merge(Some(&turn), Some(&defaults)).unwrap();
        assert_eq!(merged.temperature, Some(0.1));
        assert_eq!(merged.top_p, Some(0.5));
    }

    #[test]
    fn test_empty_stop_clears() {
        let turn = InferenceConfig {
            stop: Some(vec![]),
            ..Default::default()
        };
        let base = vec!["END".to_string()];
        assert!(turn.apply_stop(&base).is_empty());
        assert_eq!(InferenceConfig::default().apply_stop(&base), base);
    }

    #[test]
    fn test_merge_none() {
        assert!(InferenceConfig::merge(None, None).is_none());
    }

    #[test]
    fn test_resolve_from_turn_data() {
        let mut turn = Turn::new();
        turn.data.inference_config = Some(InferenceConfig {
            seed: Some(7),
            ..Default::default()
        });
        let got = InferenceConfig::resolve(&turn, None).unwrap();
        assert_eq!(got.seed, Some(7));
    }
}
