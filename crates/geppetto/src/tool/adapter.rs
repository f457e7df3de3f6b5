//! Per-provider tool conversion and limits.
//!
//! Each provider engine owns one adapter. Before a request is sent the
//! engine calls [`ToolAdapter::prepare`], which validates the whole tool
//! set against the provider's [`ProviderLimits`] and converts every
//! definition to the provider's JSON shape.

use serde_json::{Value, json};

use super::ToolDefinition;
use crate::error::GeppettoError;

const COMMON_PARAMETER_TYPES: &[&str] = &[
    "string", "number", "integer", "boolean", "object", "array", "null",
];

/// What a provider accepts in one request. Zero means unlimited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderLimits {
    /// Tools per request.
    pub max_tools_per_request: usize,
    /// Characters per tool name.
    pub max_tool_name_length: usize,
    /// Serialized size of all converted tools together.
    pub max_total_size_bytes: usize,
    /// JSON Schema `type` values the provider understands.
    pub supported_parameter_types: &'static [&'static str],
}

/// Converts tool definitions into one provider's wire format.
pub trait ToolAdapter: Send + Sync {
    /// Provider name used in error messages.
    fn provider(&self) -> &'static str;

    /// The provider's limits.
    fn limits(&self) -> ProviderLimits;

    /// Converts one definition, without validation.
    fn convert(&self, tool: &ToolDefinition) -> Value;

    /// Checks one definition against the per-tool limits.
    ///
    /// # Errors
    ///
    /// [`GeppettoError::ToolCapacityExceeded`] naming the violated limit.
    fn validate(&self, tool: &ToolDefinition) -> Result<(), GeppettoError> {
        let limits = self.limits();
        if tool.name.is_empty() {
            return Err(GeppettoError::InvalidRequest("tool name must not be empty".into()));
        }
        let name_len = tool.name.chars().count();
        if limits.max_tool_name_length > 0 && name_len > limits.max_tool_name_length {
            return Err(GeppettoError::ToolCapacityExceeded(format!(
                "{}: tool name too long: {name_len} > {}",
                self.provider(),
                limits.max_tool_name_length
            )));
        }
        if let Some(bad) = tool
            .parameter_types()
            .into_iter()
            .find(|t| !limits.supported_parameter_types.contains(&t.as_str()))
        {
            return Err(GeppettoError::ToolCapacityExceeded(format!(
                "{}: tool {} uses unsupported parameter type {bad}",
                self.provider(),
                tool.name
            )));
        }
        Ok(())
    }

    /// Validates the whole set and converts it, preserving order.
    ///
    /// # Errors
    ///
    /// [`GeppettoError::ToolCapacityExceeded`] when the set exceeds the
    /// provider's count or size limits or any tool fails
    /// [`validate`](Self::validate).
    fn prepare(&self, tools: &[ToolDefinition]) -> Result<Vec<Value>, GeppettoError> {
        let limits = self.limits();
        if limits.max_tools_per_request > 0 && tools.len() > limits.max_tools_per_request {
            return Err(GeppettoError::ToolCapacityExceeded(format!(
                "{}: {} tools exceed the limit of {}",
                self.provider(),
                tools.len(),
                limits.max_tools_per_request
            )));
        }
        let mut converted = Vec::with_capacity(tools.len());
        let mut total = 0usize;
        for tool in tools {
            self.validate(tool)?;
            let value = self.convert(tool);
            total += value.to_string().len();
            converted.push(value);
        }
        if limits.max_total_size_bytes > 0 && total > limits.max_total_size_bytes {
            return Err(GeppettoError::ToolCapacityExceeded(format!(
                "{}: tool definitions total {total} bytes, limit is {}",
                self.provider(),
                limits.max_total_size_bytes
            )));
        }
        Ok(converted)
    }
}

/// OpenAI Chat Completions: `{type: "function", function: {...}}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenAiToolAdapter;

impl ToolAdapter for OpenAiToolAdapter {
    fn provider(&self) -> &'static str {
        "openai"
    }

    fn limits(&self) -> ProviderLimits {
        ProviderLimits {
            max_tools_per_request: 64,
            max_tool_name_length: 64,
            max_total_size_bytes: 0,
            supported_parameter_types: COMMON_PARAMETER_TYPES,
        }
    }

    fn convert(&self, tool: &ToolDefinition) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": tool.name,
                "description": tool.description,
                "parameters": tool.parameters,
            }
        })
    }
}

/// OpenAI Responses API: the function fields are flattened.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenAiResponsesToolAdapter;

impl ToolAdapter for OpenAiResponsesToolAdapter {
    fn provider(&self) -> &'static str {
        "openai-responses"
    }

    fn limits(&self) -> ProviderLimits {
        OpenAiToolAdapter.limits()
    }

    fn convert(&self, tool: &ToolDefinition) -> Value {
        json!({
            "type": "function",
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        })
    }
}

/// Anthropic Messages: `{name, description, input_schema}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClaudeToolAdapter;

impl ToolAdapter for ClaudeToolAdapter {
    fn provider(&self) -> &'static str {
        "claude"
    }

    fn limits(&self) -> ProviderLimits {
        ProviderLimits {
            max_tools_per_request: 20,
            max_tool_name_length: 0,
            max_total_size_bytes: 51_200,
            supported_parameter_types: COMMON_PARAMETER_TYPES,
        }
    }

    fn convert(&self, tool: &ToolDefinition) -> Value {
        json!({
            "name": tool.name,
            "description": tool.description,
            "input_schema": tool.parameters,
        })
    }
}

/// Gemini function declarations: `{name, description, parameters}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct GeminiToolAdapter;

impl ToolAdapter for GeminiToolAdapter {
    fn provider(&self) -> &'static str {
        "gemini"
    }

    fn limits(&self) -> ProviderLimits {
        ProviderLimits {
            max_tools_per_request: 50,
            max_tool_name_length: 100,
            max_total_size_bytes: 0,
            supported_parameter_types: COMMON_PARAMETER_TYPES,
        }
    }

    fn convert(&self, tool: &ToolDefinition) -> Value {
        json!({
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        })
    }
}
