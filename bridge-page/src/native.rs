//! Direct networking, used when the bridge is off or falls back

use crate::config::PageConfig;
use crate::hooks::{FetchApi, PageGlobals, RequestApi, WebSocketApi};
use crate::normalize::normalize_request;
use crate::request::{FetchInput, PageRequest, RequestInit};
use crate::response::{Response, ResponseStream};
use crate::signal::wait_aborted;
use crate::socket::BridgeWebSocket;
use async_trait::async_trait;
use bridge_common::codec::decode_body;
use bridge_common::BridgeError;
use futures::{StreamExt, TryStreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;
use url::Url;

fn header_map(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        map.entry(name.as_str().to_string())
            .and_modify(|existing: &mut String| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }
    map
}

/// Plain fetch with the page's own reach
pub struct NativeFetch {
    client: reqwest::Client,
    config: PageConfig,
}

impl NativeFetch {
    pub fn new(config: PageConfig) -> Result<Self, BridgeError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| BridgeError::invalid_state(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl FetchApi for NativeFetch {
    async fn fetch(&self, input: FetchInput, init: RequestInit) -> Result<Response, BridgeError> {
        let call = normalize_request(&input, &init, &self.config.location, self.config.max_body_bytes).await?;
        let request = &call.request;
        debug!("native {} {}", request.method(), call.url);

        let method = reqwest::Method::from_bytes(request.method().as_bytes())
            .map_err(|_| BridgeError::invalid_request(format!("invalid method '{}'", request.method())))?;
        let mut headers = HeaderMap::new();
        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| BridgeError::invalid_request(format!("invalid header name '{}'", name)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| BridgeError::invalid_request(format!("invalid value for header '{}'", name)))?;
            headers.append(name, value);
        }
        let mut builder = self.client.request(method, call.url.clone()).headers(headers);
        if let Some(body) = &request.body {
            builder = builder.body(decode_body(body, self.config.max_body_bytes)?);
        }

        let signal = call.signal.as_ref();
        let response = tokio::select! {
            _ = wait_aborted(signal) => return Err(BridgeError::Aborted),
            sent = builder.send() => sent.map_err(|e| BridgeError::upstream(None, e.to_string()))?,
        };

        let status = response.status();
        let status_text = status.canonical_reason().unwrap_or("").to_string();
        let headers = header_map(response.headers());
        let url = response.url().to_string();

        if request.wants_stream() {
            let body = response
                .bytes_stream()
                .map_err(|e| BridgeError::upstream(None, format!("stream read failed: {}", e)))
                .boxed();
            return Ok(Response::streaming(status.as_u16(), status_text, headers, url, ResponseStream::new(body, None)));
        }

        let body = tokio::select! {
            _ = wait_aborted(signal) => return Err(BridgeError::Aborted),
            body = response.bytes() => body.map_err(|e| BridgeError::upstream(Some(status.as_u16()), e.to_string()))?,
        };
        Ok(Response::buffered(status.as_u16(), status_text, headers, url, body))
    }
}

/// Plain `Request` constructor
pub struct NativeRequestFactory {
    location: Url,
}

impl NativeRequestFactory {
    pub fn new(location: Url) -> Self {
        Self { location }
    }
}

impl RequestApi for NativeRequestFactory {
    fn construct(&self, input: FetchInput, init: &RequestInit) -> Result<PageRequest, BridgeError> {
        PageRequest::construct(input, init, &self.location)
    }
}

/// Plain `WebSocket` constructor
pub struct NativeWebSocketFactory;

#[async_trait]
impl WebSocketApi for NativeWebSocketFactory {
    async fn open(&self, url: &str, protocols: Vec<String>) -> Result<BridgeWebSocket, BridgeError> {
        Ok(BridgeWebSocket::native(url.to_string(), protocols))
    }
}

impl PageGlobals {
    /// Globals holding the real networking of a page at `config.location`
    pub fn native(config: &PageConfig) -> Result<Self, BridgeError> {
        Ok(Self::new(
            Arc::new(NativeFetch::new(config.clone())?),
            Arc::new(NativeRequestFactory::new(config.location.clone())),
            Arc::new(NativeWebSocketFactory),
        ))
    }
}
