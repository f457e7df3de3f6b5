//! HTTP plumbing for the Messages endpoint.

use futures::StreamExt;
use geppetto::sse::{SseDecoder, SseFrame};
use geppetto::{GeppettoError, InferenceContext};
use reqwest::header::{HeaderMap, HeaderValue};
use serde::Serialize;
use tracing::debug;

use crate::config::AnthropicConfig;

/// How a streaming read ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamEnd {
    Completed,
    Cancelled,
}

/// An authenticated client bound to one [`AnthropicConfig`].
#[derive(Debug)]
pub(crate) struct HttpClient {
    pub config: AnthropicConfig,
    client: reqwest::Client,
}

impl HttpClient {
    pub fn new(config: AnthropicConfig) -> Result<Self, GeppettoError> {
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
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(&self.config.api_key).map_err(|_| {
                GeppettoError::Auth("API key contains invalid header characters".into())
            })?,
        );
        headers.insert(
            "anthropic-version",
            HeaderValue::from_str(&self.config.api_version).map_err(|_| {
                GeppettoError::InvalidRequest(
                    "API version contains invalid header characters".into(),
                )
            })?,
        );
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        headers.insert("accept", HeaderValue::from_static("text/event-stream"));
        Ok(headers)
    }

    /// POSTs `body` to `/v1/messages` and returns the response once a 2xx
    /// status arrived.
    pub async fn post_messages<B: Serialize + ?Sized>(
        &self,
        body: &B,
    ) -> Result<reqwest::Response, GeppettoError> {
        let response = self
            .client
            .post(self.config.messages_url())
            .headers(self.default_headers()?)
            .json(body)
            .send()
            .await
            .map_err(|e| {
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
                        retryable: e.is_connect(),
                    }
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let http_status = http::StatusCode::from_u16(status.as_u16())
                .unwrap_or(http::StatusCode::INTERNAL_SERVER_ERROR);
            return Err(GeppettoError::from_http_status(http_status, &body));
        }

        Ok(response)
    }
}

/// Reads SSE frames until the body ends, `on_frame` returns `false`, or
/// `ctx` is cancelled. Cancellation wins over pending body chunks.
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

    loop {
        let next = tokio::select! {
            biased;
            () = ctx.cancelled() => return Ok(StreamEnd::Cancelled),
            next = body.next() => next,
        };

        let Some(chunk) = next else {
            if let Some(frame) = decoder.finish() {
                on_frame(frame)?;
            }
            return Ok(StreamEnd::Completed);
        };

        let bytes = chunk.map_err(|e| GeppettoError::Http {
            status: None,
            message: format!("Stream read error: {e}"),
            retryable: true,
        })?;

        for frame in decoder.push(&bytes)? {
            if !on_frame(frame)? {
                debug!("stream finished by message_stop or error");
                return Ok(StreamEnd::Completed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_headers() {
        let client = HttpClient::new(AnthropicConfig {
            api_key: "sk-ant-test".into(),
            ..Default::default()
        })
        .unwrap();
        let headers = client.default_headers().unwrap();

        assert_eq!(headers.get("x-api-key").unwrap(), "sk-ant-test");
        assert_eq!(headers.get("anthropic-version").unwrap(), "2023-06-01");
        assert_eq!(headers.get("content-type").unwrap(), "application/json");
        assert!(headers.get("authorization").is_none());
    }

    #[test]
    fn test_default_headers_invalid_key() {
        let client = HttpClient::new(AnthropicConfig {
            api_key: "bad\nkey".into(),
            ..Default::default()
        })
        .unwrap();
        assert!(matches!(
            client.default_headers(),
            Err(GeppettoError::Auth(_))
        ));
    }
}
