//! Provider-neutral tool descriptions.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// A tool the model can invoke during inference.
///
/// Provider engines translate this into their native format through a
/// [`ToolAdapter`](super::ToolAdapter).
///
/// ```rust
/// use geppetto::tool::ToolDefinition;
/// use serde_json::json;
///
/// let calc = ToolDefinition::new("calculator", "Adds two numbers").with_parameters(json!({
///     "type": "object",
///     "properties": { "a": { "type": "number" }, "b": { "type": "number" } },
///     "required": ["a", "b"]
/// }));
/// assert_eq!(calc.parameter_names(), vec!["a", "b"]);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// The tool's name, matched exactly against tool calls.
    pub name: String,
    /// Shown to the model so it knows when to use the tool.
    #[serde(default)]
    pub description: String,
    /// JSON Schema of the tool's arguments.
    #[serde(default = "empty_object_schema")]
    pub parameters: Value,
}

fn empty_object_schema() -> Value {
    json!({ "type": "object", "properties": {} })
}

impl ToolDefinition {
    /// A tool that takes no arguments.
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: empty_object_schema(),
        }
    }

    /// Replaces the parameter schema.
    #[must_use]
    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    /// A tool whose parameters are derived from a Rust type.
    ///
    /// Requires the `schema` feature.
    ///
    /// # Errors
    ///
    /// Fails if the generated schema cannot be serialized.
    #[cfg(feature = "schema")]
    pub fn for_type<T: schemars::JsonSchema>(
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Result<Self, serde_json::Error> {
        let schema = serde_json::to_value(schemars::schema_for!(T))?;
        Ok(Self::new(name, description).with_parameters(schema))
    }

    /// Top-level property names, in schema order.
    pub fn parameter_names(&self) -> Vec<&str> {
        self.parameters
            .get("properties")
            .and_then(Value::as_object)
            .map(|props| props.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Checks `arguments` against the parameter schema.
    ///
    /// Requires the `schema` feature.
    ///
    /// # Errors
    ///
    /// [`ToolError::Invocation`](super::ToolError::Invocation) listing
    /// every violation, or naming the schema as malformed.
    #[cfg(feature = "schema")]
    pub fn validate_arguments(&self, arguments: &Value) -> Result<(), super::ToolError> {
        let validator = jsonschema::validator_for(&self.parameters).map_err(|e| {
            super::ToolError::new(format!("invalid parameter schema for '{}': {e}", self.name))
        })?;
        let errors: Vec<String> = validator.iter_errors(arguments).map(|e| e.to_string()).collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(super::ToolError::new(format!(
                "invalid arguments for tool '{}': {}",
                self.name,
                errors.join("; ")
            )))
        }
    }

    /// Every `type` keyword used anywhere in the parameter schema.
    pub(crate) fn parameter_types(&self) -> Vec<String> {
        let mut types = Vec::new();
        collect_types(&self.parameters, &mut types);
        types
    }
}

fn collect_types(schema: &Value, out: &mut Vec<String>) {
    match schema {
        Value::Object(map) => {
            for (key, value) in map {
                match (key.as_str(), value) {
                    ("type", Value::String(t)) => out.push(t.clone()),
                    ("type", Value::Array(ts)) => {
                        out.extend(ts.iter().filter_map(Value::as_str).map(str::to_owned));
                    }
                    _ => collect_types(value, out),
                }
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_types(v, out)),
        _ => {}
    }
}
