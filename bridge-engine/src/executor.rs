//! Real network calls

use crate::config::EngineConfig;
use bridge_common::{BridgeError, HeaderList};
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

/// A request that passed policy and injection
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub method: String,
    pub url: Url,
    pub headers: HeaderList,
    pub body: Option<Vec<u8>>,
}

/// Fully read upstream response
#[derive(Debug, Clone)]
pub struct BufferedResponse {
    pub status: u16,
    pub status_text: String,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl BufferedResponse {
    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("content-type").map(String::as_str)
    }
}

/// Response headers as a lowercase map; repeated headers are joined with `, `
pub fn header_map(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut map: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        map.entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }
    map
}

pub fn status_text(status: reqwest::StatusCode) -> String {
    status.canonical_reason().unwrap_or("").to_string()
}

fn map_reqwest_error(err: reqwest::Error, timeout: Duration) -> BridgeError {
    if err.is_timeout() {
        BridgeError::timeout("upstream request", timeout.as_millis() as u64)
    } else {
        BridgeError::upstream(err.status().map(|s| s.as_u16()), err.to_string())
    }
}

/// reqwest client bound to the engine configuration
#[derive(Debug, Clone)]
pub struct HttpExecutor {
    client: reqwest::Client,
    config: EngineConfig,
}

impl HttpExecutor {
    pub fn new(config: EngineConfig) -> Result<Self, BridgeError> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| BridgeError::invalid_state(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn build(&self, request: &PreparedRequest) -> Result<reqwest::RequestBuilder, BridgeError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| BridgeError::invalid_request(format!("invalid method '{}'", request.method)))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| BridgeError::invalid_request(format!("invalid header name '{}'", name)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| BridgeError::invalid_request(format!("invalid value for header '{}'", name)))?;
            headers.append(name, value);
        }

        let mut builder = self.client.request(method, request.url.clone()).headers(headers);
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }
        Ok(builder)
    }

    /// Send and wait for response headers
    pub async fn send(
        &self,
        request: &PreparedRequest,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<reqwest::Response, BridgeError> {
        let builder = self.build(request)?;
        debug!("{} {}", request.method, request.url);

        tokio::select! {
            _ = cancel.cancelled() => Err(BridgeError::Aborted),
            result = tokio::time::timeout(timeout, builder.send()) => match result {
                Err(_) => Err(BridgeError::timeout("upstream request", timeout.as_millis() as u64)),
                Ok(Err(e)) => Err(map_reqwest_error(e, timeout)),
                Ok(Ok(response)) => Ok(response),
            },
        }
    }

    /// Read a whole body, failing once it grows past `limit`
    pub async fn read_body(
        response: reqwest::Response,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, BridgeError> {
        if let Some(length) = response.content_length() {
            if length as usize > limit {
                return Err(BridgeError::BodyTooLarge {
                    size: length as usize,
                    limit,
                });
            }
        }

        let mut body = Vec::new();
        let mut chunks = response.bytes_stream();
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Err(BridgeError::Aborted),
                next = chunks.next() => next,
            };
            match next {
                None => break,
                Some(Err(e)) => return Err(BridgeError::upstream(None, format!("body read failed: {}", e))),
                Some(Ok(chunk)) => {
                    if body.len() + chunk.len() > limit {
                        return Err(BridgeError::BodyTooLarge {
                            size: body.len() + chunk.len(),
                            limit,
                        });
                    }
                    body.extend_from_slice(&chunk);
                }
            }
        }
        Ok(body)
    }

    /// Send and buffer the response, all under the configured fetch deadline
    pub async fn execute(
        &self,
        request: &PreparedRequest,
        cancel: &CancellationToken,
    ) -> Result<BufferedResponse, BridgeError> {
        let timeout = self.config.fetch_timeout();
        let limit = self.config.max_body_bytes;

        let work = async {
            let response = self.send(request, cancel, timeout).await?;
            let status = response.status();
            let headers = header_map(response.headers());
            let body = Self::read_body(response, limit, cancel).await?;
            Ok::<_, BridgeError>(BufferedResponse {
                status: status.as_u16(),
                status_text: status_text(status),
                headers,
                body,
            })
        };

        match tokio::time::timeout(timeout, work).await {
            Ok(result) => result,
            Err(_) => Err(BridgeError::timeout("upstream request", timeout.as_millis() as u64)),
        }
    }
}
