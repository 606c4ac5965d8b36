//! Body codec
//!
//! Converts request/response bodies to and from their wire form. Text stays
//! text when the content type is textual and the bytes are valid UTF-8;
//! everything else travels as a base64 [`BinaryEnvelope`]. Every path enforces
//! the byte ceiling and rejects instead of truncating.

use crate::error::BridgeError;
use crate::types::{BinaryEnvelope, ResponseBody, WireBody};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Async byte stream used as a request body
pub type BodyStream = BoxStream<'static, Result<Bytes, BridgeError>>;

/// A field of a multipart form body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormField {
    pub name: String,
    pub value: FormValue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormValue {
    Text(String),
    File {
        filename: String,
        mime: Option<String>,
        bytes: Bytes,
    },
}

/// Every body shape a page call may carry
#[derive(Clone)]
pub enum BodySource {
    Text(String),
    UrlEncoded(Vec<(String, String)>),
    Blob { bytes: Bytes, mime: Option<String> },
    Bytes(Bytes),
    FormData(Vec<FormField>),
    /// Readable stream; can be consumed once
    Stream(Arc<Mutex<Option<BodyStream>>>),
}

impl BodySource {
    pub fn stream(stream: BodyStream) -> Self {
        BodySource::Stream(Arc::new(Mutex::new(Some(stream))))
    }
}

impl fmt::Debug for BodySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BodySource::Text(text) => f.debug_tuple("Text").field(&text.len()).finish(),
            BodySource::UrlEncoded(pairs) => f.debug_tuple("UrlEncoded").field(pairs).finish(),
            BodySource::Blob { bytes, mime } => f
                .debug_struct("Blob")
                .field("len", &bytes.len())
                .field("mime", mime)
                .finish(),
            BodySource::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            BodySource::FormData(fields) => f.debug_tuple("FormData").field(&fields.len()).finish(),
            BodySource::Stream(_) => f.write_str("Stream"),
        }
    }
}

impl From<&str> for BodySource {
    fn from(text: &str) -> Self {
        BodySource::Text(text.to_string())
    }
}

impl From<String> for BodySource {
    fn from(text: String) -> Self {
        BodySource::Text(text)
    }
}

impl From<Vec<u8>> for BodySource {
    fn from(bytes: Vec<u8>) -> Self {
        BodySource::Bytes(Bytes::from(bytes))
    }
}

/// Result of encoding a [`BodySource`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedBody {
    pub body: WireBody,
    /// Content type implied by the source; set only if the request has none
    pub implied_content_type: Option<String>,
}

/// Whether a content type denotes text that may travel unencoded
pub fn is_textual_content_type(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();

    essence.starts_with("text/")
        || essence.ends_with("/json")
        || essence.ends_with("+json")
        || essence.ends_with("/xml")
        || essence.ends_with("+xml")
        || essence == "application/x-www-form-urlencoded"
        || essence == "application/javascript"
}

fn check_size(size: usize, limit: usize) -> Result<(), BridgeError> {
    if size > limit {
        return Err(BridgeError::BodyTooLarge { size, limit });
    }
    Ok(())
}

pub fn to_envelope(bytes: &[u8]) -> BinaryEnvelope {
    BinaryEnvelope {
        base64: STANDARD.encode(bytes),
        byte_length: bytes.len(),
    }
}

/// Decode an envelope, verifying the declared length
pub fn from_envelope(envelope: &BinaryEnvelope, limit: usize) -> Result<Vec<u8>, BridgeError> {
    check_size(envelope.byte_length, limit)?;
    // base64 expands 3 bytes to 4 characters; reject before allocating
    let max_encoded = limit.div_ceil(3).saturating_mul(4);
    if envelope.base64.len() > max_encoded {
        return Err(BridgeError::BodyTooLarge {
            size: envelope.base64.len() / 4 * 3,
            limit,
        });
    }

    let bytes = STANDARD
        .decode(envelope.base64.as_bytes())
        .map_err(|e| BridgeError::codec(format!("invalid base64: {}", e)))?;

    if bytes.len() != envelope.byte_length {
        return Err(BridgeError::codec(format!(
            "envelope declares {} bytes but carries {}",
            envelope.byte_length,
            bytes.len()
        )));
    }
    Ok(bytes)
}

/// Encode raw bytes for the wire
pub fn encode_bytes(bytes: &[u8], content_type: Option<&str>, limit: usize) -> Result<WireBody, BridgeError> {
    check_size(bytes.len(), limit)?;
    if content_type.map(is_textual_content_type).unwrap_or(false) {
        if let Ok(text) = std::str::from_utf8(bytes) {
            return Ok(WireBody::Text(text.to_string()));
        }
    }
    Ok(WireBody::Binary(to_envelope(bytes)))
}

/// Decode a wire body back to bytes
pub fn decode_body(body: &WireBody, limit: usize) -> Result<Vec<u8>, BridgeError> {
    match body {
        WireBody::Text(text) => {
            check_size(text.len(), limit)?;
            Ok(text.as_bytes().to_vec())
        }
        WireBody::Binary(envelope) => from_envelope(envelope, limit),
    }
}

/// Encode a response body, choosing text or bytes by content type
pub fn encode_response_body(bytes: &[u8], content_type: Option<&str>, limit: usize) -> Result<ResponseBody, BridgeError> {
    Ok(match encode_bytes(bytes, content_type, limit)? {
        WireBody::Text(text) => ResponseBody::BodyText(text),
        WireBody::Binary(envelope) => ResponseBody::BodyBytes(envelope),
    })
}

pub fn decode_response_body(body: &ResponseBody, limit: usize) -> Result<Vec<u8>, BridgeError> {
    match body {
        ResponseBody::BodyText(text) => {
            check_size(text.len(), limit)?;
            Ok(text.as_bytes().to_vec())
        }
        ResponseBody::BodyBytes(envelope) => from_envelope(envelope, limit),
    }
}

fn multipart_boundary() -> String {
    format!("----FranzaiBridgeBoundary{}", uuid::Uuid::new_v4().simple())
}

/// Serialize form fields as `multipart/form-data`
pub fn encode_multipart(fields: &[FormField], boundary: &str) -> Vec<u8> {
    let mut out = Vec::new();
    for field in fields {
        out.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        match &field.value {
            FormValue::Text(text) => {
                out.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", field.name).as_bytes(),
                );
                out.extend_from_slice(text.as_bytes());
            }
            FormValue::File { filename, mime, bytes } => {
                out.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: {}\r\n\r\n",
                        field.name,
                        filename,
                        mime.as_deref().unwrap_or("application/octet-stream")
                    )
                    .as_bytes(),
                );
                out.extend_from_slice(bytes);
            }
        }
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(format!("--{}--\r\n", boundary).as_bytes());
    out
}

async fn read_stream(source: &Arc<Mutex<Option<BodyStream>>>, limit: usize) -> Result<Vec<u8>, BridgeError> {
    let mut stream = source
        .lock()
        .await
        .take()
        .ok_or_else(|| BridgeError::invalid_state("body stream already consumed"))?;

    let mut buffer = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        check_size(buffer.len() + chunk.len(), limit)?;
        buffer.extend_from_slice(&chunk);
    }
    Ok(buffer)
}

/// Encode any body source for the wire.
///
/// `declared_content_type` is the request's own `Content-Type`, which takes
/// precedence over whatever the source implies.
pub async fn encode_body_source(
    source: &BodySource,
    declared_content_type: Option<&str>,
    limit: usize,
) -> Result<EncodedBody, BridgeError> {
    match source {
        BodySource::Text(text) => {
            check_size(text.len(), limit)?;
            Ok(EncodedBody {
                body: WireBody::Text(text.clone()),
                implied_content_type: Some("text/plain;charset=UTF-8".to_string()),
            })
        }
        BodySource::UrlEncoded(pairs) => {
            let encoded = url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(pairs.iter())
                .finish();
            check_size(encoded.len(), limit)?;
            Ok(EncodedBody {
                body: WireBody::Text(encoded),
                implied_content_type: Some("application/x-www-form-urlencoded;charset=UTF-8".to_string()),
            })
        }
        BodySource::Blob { bytes, mime } => {
            let implied = mime.clone().filter(|m| !m.trim().is_empty());
            let effective = declared_content_type.or(implied.as_deref());
            Ok(EncodedBody {
                body: encode_bytes(bytes, effective, limit)?,
                implied_content_type: implied,
            })
        }
        BodySource::Bytes(bytes) => Ok(EncodedBody {
            body: encode_bytes(bytes, declared_content_type, limit)?,
            implied_content_type: None,
        }),
        BodySource::FormData(fields) => {
            let boundary = multipart_boundary();
            let bytes = encode_multipart(fields, &boundary);
            check_size(bytes.len(), limit)?;
            Ok(EncodedBody {
                body: WireBody::Binary(to_envelope(&bytes)),
                implied_content_type: Some(format!("multipart/form-data; boundary={}", boundary)),
            })
        }
        BodySource::Stream(stream) => {
            let bytes = read_stream(stream, limit).await?;
            Ok(EncodedBody {
                body: encode_bytes(&bytes, declared_content_type, limit)?,
                implied_content_type: None,
            })
        }
    }
}

/// Serde helper carrying `Vec<u8>` fields as base64 strings
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded.as_bytes()).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const LIMIT: usize = 1024;

    #[test]
    fn test_textual_content_types() {
        assert!(is_textual_content_type("text/plain; charset=utf-8"));
        assert!(is_textual_content_type("application/json"));
        assert!(is_textual_content_type("application/vnd.api+json"));
        assert!(is_textual_content_type("application/xml"));
        assert!(is_textual_content_type("application/x-www-form-urlencoded"));
        assert!(!is_textual_content_type("application/octet-stream"));
        assert!(!is_textual_content_type("image/png"));
        assert!(!is_textual_content_type("multipart/form-data; boundary=x"));
    }

    #[test]
    fn test_non_utf8_textual_falls_back_to_binary() {
        let body = encode_bytes(&[0xff, 0xfe, 0x00], Some("text/plain"), LIMIT).unwrap();
        assert!(matches!(body, WireBody::Binary(ref e) if e.byte_length == 3));
    }

    #[test]
    fn test_size_ceiling_boundary() {
        let at_limit = vec![7u8; LIMIT];
        assert!(encode_bytes(&at_limit, None, LIMIT).is_ok());

        let over = vec![7u8; LIMIT + 1];
        let err = encode_bytes(&over, None, LIMIT).unwrap_err();
        assert_eq!(err, BridgeError::BodyTooLarge { size: LIMIT + 1, limit: LIMIT });
    }

    #[test]
    fn test_decode_rejects_oversized_envelope() {
        let envelope = to_envelope(&vec![1u8; LIMIT + 1]);
        let err = from_envelope(&envelope, LIMIT).unwrap_err();
        assert!(matches!(err, BridgeError::BodyTooLarge { .. }));
    }

    #[test]
    fn test_decode_rejects_length_mismatch() {
        let mut envelope = to_envelope(b"hello");
        envelope.byte_length = 4;
        assert!(matches!(from_envelope(&envelope, LIMIT), Err(BridgeError::Codec { .. })));
    }

    #[tokio::test]
    async fn test_url_encoded_source() {
        let source = BodySource::UrlEncoded(vec![
            ("q".to_string(), "a b".to_string()),
            ("x".to_string(), "1&2".to_string()),
        ]);
        let encoded = encode_body_source(&source, None, LIMIT).await.unwrap();
        assert_eq!(encoded.body, WireBody::Text("q=a+b&x=1%262".to_string()));
        assert_eq!(
            encoded.implied_content_type.as_deref(),
            Some("application/x-www-form-urlencoded;charset=UTF-8")
        );
    }

    #[tokio::test]
    async fn test_form_data_is_multipart_binary() {
        let source = BodySource::FormData(vec![
            FormField {
                name: "note".to_string(),
                value: FormValue::Text("hi".to_string()),
            },
            FormField {
                name: "file".to_string(),
                value: FormValue::File {
                    filename: "a.bin".to_string(),
                    mime: None,
                    bytes: Bytes::from_static(&[0, 1, 2]),
                },
            },
        ]);
        let encoded = encode_body_source(&source, None, LIMIT).await.unwrap();
        let content_type = encoded.implied_content_type.unwrap();
        assert!(content_type.starts_with("multipart/form-data; boundary="));

        let bytes = decode_body(&encoded.body, LIMIT).unwrap();
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("name=\"note\""));
        assert!(text.contains("filename=\"a.bin\""));
    }

    #[tokio::test]
    async fn test_stream_source_consumed_once() {
        let chunks = vec![Ok(Bytes::from_static(b"ab")), Ok(Bytes::from_static(b"cd"))];
        let source = BodySource::stream(futures::stream::iter(chunks).boxed());

        let encoded = encode_body_source(&source, Some("text/plain"), LIMIT).await.unwrap();
        assert_eq!(encoded.body, WireBody::Text("abcd".to_string()));

        let again = encode_body_source(&source, Some("text/plain"), LIMIT).await;
        assert!(matches!(again, Err(BridgeError::InvalidState { .. })));
    }

    #[tokio::test]
    async fn test_stream_source_over_limit_is_rejected() {
        let chunks = vec![Ok(Bytes::from(vec![0u8; 600])), Ok(Bytes::from(vec![0u8; 600]))];
        let source = BodySource::stream(futures::stream::iter(chunks).boxed());
        let err = encode_body_source(&source, None, LIMIT).await.unwrap_err();
        assert!(matches!(err, BridgeError::BodyTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_blob_mime_is_implied_but_declared_wins() {
        let source = BodySource::Blob {
            bytes: Bytes::from_static(b"{\"a\":1}"),
            mime: Some("application/json".to_string()),
        };
        let encoded = encode_body_source(&source, None, LIMIT).await.unwrap();
        assert_eq!(encoded.body, WireBody::Text("{\"a\":1}".to_string()));
        assert_eq!(encoded.implied_content_type.as_deref(), Some("application/json"));

        let encoded = encode_body_source(&source, Some("application/octet-stream"), LIMIT)
            .await
            .unwrap();
        assert!(matches!(encoded.body, WireBody::Binary(_)));
    }

    proptest! {
        #[test]
        fn prop_binary_round_trip(bytes in prop::collection::vec(any::<u8>(), 0..LIMIT)) {
            let body = encode_bytes(&bytes, None, LIMIT).unwrap();
            prop_assert_eq!(decode_body(&body, LIMIT).unwrap(), bytes);
        }

        #[test]
        fn prop_text_round_trip(text in ".{0,200}") {
            let body = encode_bytes(text.as_bytes(), Some("application/json"), LIMIT).unwrap();
            prop_assert_eq!(&body, &WireBody::Text(text.clone()));
            prop_assert_eq!(decode_body(&body, LIMIT).unwrap(), text.into_bytes());
        }

        #[test]
        fn prop_response_round_trip(bytes in prop::collection::vec(any::<u8>(), 0..LIMIT), textual in any::<bool>()) {
            let content_type = if textual { Some("text/plain") } else { Some("image/png") };
            let body = encode_response_body(&bytes, content_type, LIMIT).unwrap();
            prop_assert_eq!(decode_response_body(&body, LIMIT).unwrap(), bytes);
        }
    }
}
