//! HTTP plumbing shared by both `OpenAI` engines.

use futures::StreamExt;
use geppetto::GeppettoError;
use geppetto::InferenceContext;
use geppetto::sse::{SseDecoder, SseFrame};
use reqwest::header::{HeaderMap, HeaderValue};
use serde::Serialize;
use tracing::debug;

use crate::config::OpenAiConfig;

/// How a streaming read ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamEnd {
    Completed,
    Cancelled,
}

/// An authenticated client bound to one [`OpenAiConfig`].
#[derive(Debug)]
pub(crate) struct HttpClient {
    pub config: OpenAiConfig,
    client: reqwest::Client,
}

impl HttpClient {
    /// Reuses `config.client` when set, otherwise builds one with the
    /// configured timeout and user agent.
    pub fn new(config: OpenAiConfig) -> Result<Self, GeppettoError> {
        let client = match config.client.clone() {
            Some(client) => client,
            None => {
                let mut builder = reqwest::Client::builder();
                if let Some(timeout) = config.timeout {
                    builder = builder.timeout(timeout);
                }
                if let Some(ua) = &config.user_agent {
                    builder = builder.user_agent(ua.clone());
                }
                builder.build().map_err(|e| {
                    GeppettoError::InvalidRequest(format!("failed to build HTTP client: {e}"))
                })?
            }
        };
        Ok(Self { config, client })
    }

    pub fn default_headers(&self) -> Result<HeaderMap, GeppettoError> {
        let mut headers = HeaderMap::new();

        let auth_value = format!("Bearer {}", self.config.api_key);
        headers.insert(
            "authorization",
            HeaderValue::from_str(&auth_value).map_err(|_| {
                GeppettoError::Auth("API key contains invalid header characters".into())
            })?,
        );
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        headers.insert("accept", HeaderValue::from_static("text/event-stream"));

        if let Some(org) = &self.config.organization {
            headers.insert(
                "openai-organization",
                HeaderValue::from_str(org).map_err(|_| {
                    GeppettoError::InvalidRequest(
                        "Organization ID contains invalid header characters".into(),
                    )
                })?,
            );
        }

        Ok(headers)
    }

    /// POSTs `body` to `path` and returns the response once a 2xx status
    /// arrived.
    pub async fn post<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<reqwest::Response, GeppettoError> {
        let response = self
            .client
            .post(self.config.endpoint(path))
            .headers(self.default_headers()?)
            .json(body)
            .send()
            .await
            .map_err(|e| self.map_transport_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let http_status = http::StatusCode::from_u16(status.as_u16())
                .unwrap_or(http::StatusCode::INTERNAL_SERVER_ERROR);
            return Err(GeppettoError::from_http_status(http_status, &body));
        }

        Ok(response)
    }

    fn map_transport_error(&self, e: &reqwest::Error) -> GeppettoError {
        if e.is_timeout() {
            GeppettoError::Timeout {
                elapsed_ms: self
                    .config
                    .timeout
                    .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            }
        } else {
            GeppettoError::Http {
                status: e.status().map(|s| {
                    http::StatusCode::from_u16(s.as_u16())
                        .unwrap_or(http::StatusCode::INTERNAL_SERVER_ERROR)
                }),
                message: e.to_string(),
                retryable: e.is_connect() || e.is_timeout(),
            }
        }
    }
}

/// Reads SSE frames from `response` until the body ends, `on_frame`
/// returns `false`, or `ctx` is cancelled.
///
/// Cancellation wins over pending body chunks.
pub(crate) async fn read_frames<F>(
    ctx: &InferenceContext,
    response: reqwest::Response,
    mut on_frame: F,
) -> Result<StreamEnd, GeppettoError>
where
    F: FnMut(SseFrame) -> Result<bool, GeppettoError>,
{
    let mut body = response.bytes_stream();
    let mut decoder = SseDecoder::new();
    let mut chunks = 0usize;

    loop {
        let next = tokio::select! {
            biased;
            () = ctx.cancelled() => {
                debug!(chunks, "stream cancelled by context");
                return Ok(StreamEnd::Cancelled);
            }
            next = body.next() => next,
        };

        let Some(chunk) = next else {
            if let Some(frame) = decoder.finish() {
                on_frame(frame)?;
            }
            debug!(chunks, "stream completed");
            return Ok(StreamEnd::Completed);
        };

        let bytes = chunk.map_err(|e| GeppettoError::Http {
            status: None,
            message: format!("Stream read error: {e}"),
            retryable: true,
        })?;
        chunks += 1;

        for frame in decoder.push(&bytes)? {
            if !on_frame(frame)? {
                debug!(chunks, "stream finished by sentinel");
                return Ok(StreamEnd::Completed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_default_headers() {
        let client = HttpClient::new(OpenAiConfig {
            api_key: "sk-test123".into(),
            ..Default::default()
        })
        .unwrap();
        let headers = client.default_headers().unwrap();

        assert_eq!(headers.get("authorization").unwrap(), "Bearer sk-test123");
        assert_eq!(headers.get("content-type").unwrap(), "application/json");
        assert!(headers.get("openai-organization").is_none());
    }

    #[test]
    fn test_default_headers_with_org() {
        let client = HttpClient::new(OpenAiConfig {
            api_key: "sk-test123".into(),
            organization: Some("org-abc".into()),
            ..Default::default()
        })
        .unwrap();
        let headers = client.default_headers().unwrap();

        assert_eq!(headers.get("openai-organization").unwrap(), "org-abc");
    }

    #[test]
    fn test_default_headers_invalid_key() {
        let client = HttpClient::new(OpenAiConfig {
            api_key: "invalid\nkey".into(),
            ..Default::default()
        })
        .unwrap();
        let err = client.default_headers().unwrap_err();
        assert!(matches!(err, GeppettoError::Auth(_)));
    }

    #[test]
    fn test_new_with_custom_client_and_timeout() {
        let custom = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap();
        assert!(
            HttpClient::new(OpenAiConfig {
                client: Some(custom),
                ..Default::default()
            })
            .is_ok()
        );
        assert!(
            HttpClient::new(OpenAiConfig {
                timeout: Some(Duration::from_secs(30)),
                user_agent: Some("geppetto-test".into()),
                ..Default::default()
            })
            .is_ok()
        );
    }
}
