//! Tool error types.

/// Error returned by a single tool execution.
///
/// Tool errors never escape the tool loop (unless it is configured to
/// abort): they are rendered into the tool-result block as
/// `Error: <message>` so the model can react.
///
/// ```rust
/// use geppetto::tool::ToolError;
///
/// assert_eq!(ToolError::Timeout.to_string(), "context deadline exceeded");
/// assert_eq!(ToolError::Timeout.result_text(), "Error: context deadline exceeded");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolError {
    /// No tool with the requested name is available.
    #[error("tool not found")]
    NotFound(String),

    /// The tool ran and failed.
    #[error("{0}")]
    Invocation(String),

    /// The per-call execution timeout elapsed.
    #[error("context deadline exceeded")]
    Timeout,

    /// The surrounding inference was cancelled.
    #[error("context canceled")]
    Cancelled,
}

impl ToolError {
    /// Creates an invocation error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self::Invocation(message.into())
    }

    /// The text placed in the tool-result block.
    pub fn result_text(&self) -> String {
        format!("Error: {self}")
    }

    /// Whether a retry may succeed. Missing tools and cancellation are
    /// final.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Invocation(_) | Self::Timeout)
    }
}

impl From<serde_json::Error> for ToolError {
    fn from(e: serde_json::Error) -> Self {
        Self::Invocation(format!("invalid arguments: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(ToolError::NotFound("x".into()).to_string(), "tool not found");
        assert_eq!(ToolError::new("boom").to_string(), "boom");
        assert_eq!(ToolError::Cancelled.result_text(), "Error: context canceled");
    }

    #[test]
    fn test_retryable() {
        assert!(ToolError::Timeout.is_retryable());
        assert!(ToolError::new("x").is_retryable());
        assert!(!ToolError::NotFound("x".into()).is_retryable());
        assert!(!ToolError::Cancelled.is_retryable());
    }
}
