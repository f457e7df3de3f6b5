//! HTTP plumbing for the streaming `generateContent` endpoint.

use futures::StreamExt;
use geppetto::sse::{SseDecoder, SseFrame};
use geppetto::{GeppettoError, InferenceContext};
use reqwest::header::{HeaderMap, HeaderValue};
use serde::Serialize;

use crate::config::GeminiConfig;

/// How a streaming read ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamEnd {
    Completed,
    Cancelled,
}

#[derive(Debug)]
pub(crate) struct HttpClient {
    pub config: GeminiConfig,
    client: reqwest::Client,
}

impl HttpClient {
    pub fn new(config: GeminiConfig) -> Result<Self, GeppettoError> {
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
            "x-goog-api-key",
            HeaderValue::from_str(&self.config.api_key).map_err(|_| {
                GeppettoError::Auth("API key contains invalid header characters".into())
            })?,
        );
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        headers.insert("accept", HeaderValue::from_static("text/event-stream"));
        Ok(headers)
    }

    pub async fn post_stream<B: Serialize + ?Sized>(
        &self,
        body: &B,
    ) -> Result<reqwest::Response, GeppettoError> {
        let response = self
            .client
            .post(self.config.stream_url())
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
                        status: None,
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

/// Reads SSE frames until the body ends or `ctx` is cancelled.
pub(crate) async fn read_frames<F>(
    ctx: &InferenceContext,
    response: reqwest::Response,
    mut on_frame: F,
) -> Result<StreamEnd, GeppettoError>
where
    F: FnMut(SseFrame) -> Result<(), GeppettoError>,
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
            on_frame(frame)?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_headers() {
        let client = HttpClient::new(GeminiConfig {
            api_key: "AIza-test".into(),
            ..Default::default()
        })
        .unwrap();
        let headers = client.default_headers().unwrap();
        assert_eq!(headers.get("x-goog-api-key").unwrap(), "AIza-test");
        assert!(headers.get("authorization").is_none());
    }
}
