//! `Response`-compatible result of a page fetch

use crate::stream::StreamAborter;
use bridge_common::codec::decode_response_body;
use bridge_common::{BridgeError, ResponseRecord};
use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

enum Body {
    Buffered(Bytes),
    Stream(ResponseStream),
}

pub struct Response {
    pub status: u16,
    pub status_text: String,
    /// Lowercased header names
    pub headers: BTreeMap<String, String>,
    pub url: String,
    pub ok: bool,
    body: Body,
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("url", &self.url)
            .field("streaming", &matches!(self.body, Body::Stream(_)))
            .finish()
    }
}

impl Response {
    pub fn buffered(
        status: u16,
        status_text: impl Into<String>,
        headers: BTreeMap<String, String>,
        url: impl Into<String>,
        body: Bytes,
    ) -> Self {
        Self {
            status,
            status_text: status_text.into(),
            headers,
            url: url.into(),
            ok: (200..300).contains(&status),
            body: Body::Buffered(body),
        }
    }

    pub(crate) fn streaming(
        status: u16,
        status_text: String,
        headers: BTreeMap<String, String>,
        url: String,
        body: ResponseStream,
    ) -> Self {
        Self {
            status,
            status_text,
            headers,
            url,
            ok: (200..300).contains(&status),
            body: Body::Stream(body),
        }
    }

    /// Rebuild a buffered response from an engine record
    pub fn from_record(record: ResponseRecord, url: impl Into<String>, limit: usize) -> Result<Self, BridgeError> {
        let bytes = decode_response_body(&record.body, limit)?;
        let mut response = Self::buffered(record.status, record.status_text, record.headers, url, Bytes::from(bytes));
        response.ok = record.ok;
        Ok(response)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.body, Body::Stream(_))
    }

    /// Read the whole body
    pub async fn bytes(self) -> Result<Bytes, BridgeError> {
        match self.body {
            Body::Buffered(bytes) => Ok(bytes),
            Body::Stream(mut stream) => {
                let mut buffer = BytesMut::new();
                while let Some(chunk) = stream.next().await {
                    buffer.extend_from_slice(&chunk?);
                }
                Ok(buffer.freeze())
            }
        }
    }

    pub async fn text(self) -> Result<String, BridgeError> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub async fn json<T: DeserializeOwned>(self) -> Result<T, BridgeError> {
        let bytes = self.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| BridgeError::codec(format!("invalid JSON body: {}", e)))
    }

    /// Progressive body reader; a buffered body yields one chunk
    pub fn into_stream(self) -> ResponseStream {
        match self.body {
            Body::Stream(stream) => stream,
            Body::Buffered(bytes) => ResponseStream::new(stream::iter([Ok(bytes)]).boxed(), None),
        }
    }
}

/// Readable body of a streamed response
///
/// Cancelling, or dropping it before the end, sends one abort notice
/// upstream.
pub struct ResponseStream {
    inner: BoxStream<'static, Result<Bytes, BridgeError>>,
    aborter: Option<Arc<StreamAborter>>,
    finished: bool,
    cancelled: bool,
}

impl ResponseStream {
    pub(crate) fn new(inner: BoxStream<'static, Result<Bytes, BridgeError>>, aborter: Option<Arc<StreamAborter>>) -> Self {
        Self {
            inner,
            aborter,
            finished: false,
            cancelled: false,
        }
    }

    pub fn cancel(&mut self) {
        if self.finished {
            return;
        }
        self.cancelled = true;
        if let Some(aborter) = &self.aborter {
            aborter.abort();
        }
    }
}

impl Stream for ResponseStream {
    type Item = Result<Bytes, BridgeError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        if self.cancelled {
            self.finished = true;
            return Poll::Ready(Some(Err(BridgeError::Aborted)));
        }
        let next = self.inner.poll_next_unpin(cx);
        if let Poll::Ready(None | Some(Err(_))) = &next {
            self.finished = true;
        }
        next
    }
}

impl Drop for ResponseStream {
    fn drop(&mut self) {
        if !self.finished {
            if let Some(aborter) = &self.aborter {
                aborter.abort();
            }
        }
    }
}
