//! Unified error type for inference, tool-loop and cache operations.
//!
//! Every engine maps its provider's native failures into
//! [`GeppettoError`], so callers match on one type no matter which
//! backend produced the error. The variants follow a small taxonomy:
//!
//! | Kind | Variants | Typical source |
//! |------|----------|---------------|
//! | Local contract broken | [`InvariantViolation`](GeppettoError::InvariantViolation) | empty required field, bad snapshot config |
//! | Stream shape broken | [`ProtocolViolation`](GeppettoError::ProtocolViolation) | duplicate content-block index |
//! | Deserialization | [`UnknownContentType`](GeppettoError::UnknownContentType) | unrecognized discriminator |
//! | Provider | `Http`, `Auth`, `InvalidRequest`, `Provider`, `ResponseFormat`, `Timeout` | non-2xx, SSE `error` event |
//! | Cancellation | [`Cancelled`](GeppettoError::Cancelled) | context cancelled mid-stream |
//! | Tool loop | `ToolLoopExceeded`, `ToolCapacityExceeded` | iteration cap, provider tool limits |
//! | Cache | [`CacheWrite`](GeppettoError::CacheWrite) | disk cache could not persist |
//!
//! Tool execution failures are *not* represented here: they are
//! recovered by the tool loop and turned into `Error: ...` result
//! content (see [`ToolError`](crate::tool::ToolError)).
//!
//! # Retryability
//!
//! The core never retries upstream calls. Provider variants carry a
//! `retryable` flag so callers can decide for themselves:
//!
//! ```rust
//! use geppetto::GeppettoError;
//!
//! fn should_retry(err: &GeppettoError) -> bool {
//!     match err {
//!         GeppettoError::Http { retryable, .. } => *retryable,
//!         GeppettoError::Provider { retryable, .. } => *retryable,
//!         GeppettoError::Timeout { .. } => true,
//!         _ => false,
//!     }
//! }
//! ```

/// The unified error type returned by all geppetto operations.
///
/// Variants are `#[non_exhaustive]`: new kinds may be added in minor
/// releases, so always include a wildcard arm when matching.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum GeppettoError {
    /// A local programming contract was broken (empty required field,
    /// missing ordering strategy, reasoning/tool pairing violated).
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// The provider stream broke its expected shape.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Deserialization hit an unrecognized type discriminator.
    #[error("unknown content type: {0}")]
    UnknownContentType(String),

    /// An HTTP-level failure (transport error, unexpected status code).
    ///
    /// `status` is `None` when the request never received a response.
    #[error("HTTP error (status={status:?}): {message}")]
    Http {
        /// The HTTP status code, if one was received.
        status: Option<http::StatusCode>,
        /// A human-readable description of the failure.
        message: String,
        /// Whether the caller may retry this request.
        retryable: bool,
    },

    /// The API key was rejected or is missing.
    #[error("authentication error: {0}")]
    Auth(String),

    /// The request was malformed or the settings are incomplete.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A provider-reported error, e.g. an SSE `error` event.
    #[error("provider error ({code}): {message}")]
    Provider {
        /// Provider-defined error code (e.g. `"overloaded_error"`).
        code: String,
        /// Human-readable error description.
        message: String,
        /// Whether the caller may retry this request.
        retryable: bool,
    },

    /// A response body or stream chunk could not be parsed.
    #[error("response format error: {message}")]
    ResponseFormat {
        /// What went wrong during parsing.
        message: String,
        /// The raw payload, for diagnostics.
        raw: String,
    },

    /// The request exceeded the client timeout.
    #[error("operation timed out after {elapsed_ms}ms")]
    Timeout {
        /// Milliseconds elapsed before the timeout fired.
        elapsed_ms: u64,
    },

    /// The inference context was cancelled.
    #[error("inference cancelled")]
    Cancelled,

    /// The tool loop reached its iteration cap without a terminal answer.
    #[error("tool calling exceeded maximum iterations ({max_iterations})")]
    ToolLoopExceeded {
        /// The configured cap.
        max_iterations: usize,
    },

    /// The tool set violates the provider's limits.
    #[error("tool capacity exceeded: {0}")]
    ToolCapacityExceeded(String),

    /// A tool failed and the loop is configured to abort on tool errors.
    #[error("tool {tool_name} failed: {message}")]
    ToolAborted {
        /// Name of the failing tool.
        tool_name: String,
        /// Rendered tool error.
        message: String,
    },

    /// The disk cache could not persist an entry.
    #[error("cache write failed: {0}")]
    CacheWrite(String),

    /// Structured-output configuration was rejected.
    #[error("structured output: {0}")]
    StructuredOutput(String),

    /// A filesystem operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GeppettoError {
    /// Returns `true` if the error is transient and a retry may succeed.
    ///
    /// ```rust
    /// use geppetto::GeppettoError;
    ///
    /// assert!(GeppettoError::Timeout { elapsed_ms: 5000 }.is_retryable());
    /// assert!(!GeppettoError::Auth("bad key".into()).is_retryable());
    /// ```
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http { retryable, .. } | Self::Provider { retryable, .. } => *retryable,
            Self::Timeout { .. } => true,
            _ => false,
        }
    }

    /// Returns `true` for errors that originate from the upstream provider.
    pub fn is_provider_error(&self) -> bool {
        matches!(
            self,
            Self::Http { .. }
                | Self::Auth(_)
                | Self::InvalidRequest(_)
                | Self::Provider { .. }
                | Self::ResponseFormat { .. }
                | Self::Timeout { .. }
        )
    }

    /// Maps a non-2xx provider response to an error.
    ///
    /// The message is `error.message` from the JSON body when present,
    /// otherwise the raw body. 401/403 become [`Auth`](Self::Auth), 400
    /// [`InvalidRequest`](Self::InvalidRequest); everything else is
    /// [`Http`](Self::Http), retryable for 429, 500, 502, 503 and 529.
    ///
    /// ```rust
    /// use geppetto::GeppettoError;
    ///
    /// let err = GeppettoError::from_http_status(
    ///     http::StatusCode::TOO_MANY_REQUESTS,
    ///     r#"{"error":{"message":"slow down"}}"#,
    /// );
    /// assert!(err.is_retryable());
    /// assert!(err.to_string().contains("slow down"));
    /// ```
    pub fn from_http_status(status: http::StatusCode, body: &str) -> Self {
        let message = serde_json::from_str::<serde_json::Value>(body)
            .ok()
            .and_then(|v| v.pointer("/error/message").and_then(|m| m.as_str()).map(str::to_string))
            .unwrap_or_else(|| body.to_string());

        match status.as_u16() {
            401 | 403 => Self::Auth(message),
            400 => Self::InvalidRequest(message),
            code => Self::Http {
                status: Some(status),
                message,
                retryable: matches!(code, 429 | 500 | 502 | 503 | 529),
            },
        }
    }

    pub(crate) fn invariant(message: impl Into<String>) -> Self {
        Self::InvariantViolation(message.into())
    }
}

impl From<serde_json::Error> for GeppettoError {
    fn from(err: serde_json::Error) -> Self {
        Self::ResponseFormat {
            message: err.to_string(),
            raw: String::new(),
        }
    }
}
