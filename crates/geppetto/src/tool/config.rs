//! Tool-loop policy.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ToolDefinition;
use crate::serde_util::duration_secs;

/// How the model may choose tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolChoice {
    /// The model decides.
    #[default]
    Auto,
    /// The model must not call tools.
    None,
    /// The model must call at least one tool.
    Required,
}

impl ToolChoice {
    /// The wire value shared by every provider that supports it.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::None => "none",
            Self::Required => "required",
        }
    }
}

/// What the tool loop does when a tool fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolErrorHandling {
    /// Record `Error: <message>` as the result and keep going.
    #[default]
    Continue,
    /// Stop the loop with [`GeppettoError::ToolAborted`](crate::GeppettoError::ToolAborted).
    Abort,
    /// Retry with exponential backoff, then behave like `Continue`.
    Retry,
}

/// Backoff schedule for [`ToolErrorHandling::Retry`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    #[serde(with = "duration_secs")]
    pub backoff_base: Duration,
    /// Multiplier applied per retry.
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff_base: Duration::from_secs(1),
            backoff_factor: 2.0,
        }
    }
}

/// Tool-calling policy for a turn.
///
/// ```rust
/// use std::time::Duration;
/// use geppetto::tool::ToolConfig;
///
/// let config = ToolConfig::default()
///     .with_max_iterations(3)
///     .with_execution_timeout(Duration::from_secs(5))
///     .with_allowed_tools(["search"]);
///
/// assert!(config.is_tool_allowed("search"));
/// assert!(!config.is_tool_allowed("delete_everything"));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    /// Whether tools are advertised at all.
    pub enabled: bool,
    /// Tool choice forwarded to the provider.
    pub tool_choice: ToolChoice,
    /// Cap on engine invocations within one loop.
    pub max_iterations: usize,
    /// Bound on each individual tool execution.
    #[serde(with = "duration_secs")]
    pub execution_timeout: Duration,
    /// Tools executed concurrently within one iteration.
    pub max_parallel_tools: usize,
    /// Allow-list of tool names. `None` or empty allows every tool.
    pub allowed_tools: Option<Vec<String>>,
    /// Failure policy.
    pub tool_error_handling: ToolErrorHandling,
    /// Backoff schedule used in retry mode.
    pub retry_config: RetryConfig,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tool_choice: ToolChoice::Auto,
            max_iterations: 5,
            execution_timeout: Duration::from_secs(30),
            max_parallel_tools: 3,
            allowed_tools: None,
            tool_error_handling: ToolErrorHandling::Continue,
            retry_config: RetryConfig::default(),
        }
    }
}

impl ToolConfig {
    /// Sets `enabled`.
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Sets the tool choice.
    #[must_use]
    pub fn with_tool_choice(mut self, choice: ToolChoice) -> Self {
        self.tool_choice = choice;
        self
    }

    /// Sets the iteration cap.
    #[must_use]
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Sets the per-call timeout.
    #[must_use]
    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = timeout;
        self
    }

    /// Sets the per-iteration concurrency.
    #[must_use]
    pub fn with_max_parallel_tools(mut self, max_parallel: usize) -> Self {
        self.max_parallel_tools = max_parallel;
        self
    }

    /// Restricts execution to the named tools.
    #[must_use]
    pub fn with_allowed_tools<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_tools = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Sets the failure policy.
    #[must_use]
    pub fn with_tool_error_handling(mut self, handling: ToolErrorHandling) -> Self {
        self.tool_error_handling = handling;
        self
    }

    /// Sets the retry schedule.
    #[must_use]
    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry_config = retry;
        self
    }

    /// Whether `name` passes the allow-list.
    pub fn is_tool_allowed(&self, name: &str) -> bool {
        match &self.allowed_tools {
            Some(allowed) if !allowed.is_empty() => allowed.iter().any(|a| a == name),
            _ => true,
        }
    }

    /// The subset of `tools` that passes the allow-list, in order.
    pub fn filter_tools(&self, tools: &[ToolDefinition]) -> Vec<ToolDefinition> {
        tools
            .iter()
            .filter(|t| self.is_tool_allowed(&t.name))
            .cloned()
            .collect()
    }

    /// Concurrency actually used: zero means unbounded.
    pub(crate) fn effective_parallelism(&self, calls: usize) -> usize {
        match self.max_parallel_tools {
            0 => calls.max(1),
            n => n,
        }
    }
}
