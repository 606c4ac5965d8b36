//! Wire-safe records exchanged between tiers

use crate::error::BridgeError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Ordered header list; names keep the caller's casing
pub type HeaderList = Vec<(String, String)>;

/// Whether a call goes through the bridge at all
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeMode {
    /// Bridge only cross-origin requests, fall back to a direct call on failure
    #[default]
    Auto,
    /// Always bridge, never fall back
    Always,
    /// Never bridge
    Off,
}

impl fmt::Display for BridgeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeMode::Auto => write!(f, "auto"),
            BridgeMode::Always => write!(f, "always"),
            BridgeMode::Off => write!(f, "off"),
        }
    }
}

impl FromStr for BridgeMode {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(BridgeMode::Auto),
            "always" => Ok(BridgeMode::Always),
            "off" => Ok(BridgeMode::Off),
            other => Err(BridgeError::invalid_request(format!("unknown bridge mode '{}'", other))),
        }
    }
}

/// Per-call options recognized under `init.bridgeOptions`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<BridgeMode>,
    /// Call timeout in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
}

/// Binary payload carried as base64
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BinaryEnvelope {
    pub base64: String,
    pub byte_length: usize,
}

/// A body as it travels between tiers: UTF-8 text or a binary envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireBody {
    Text(String),
    Binary(BinaryEnvelope),
}

impl WireBody {
    /// Decoded size in bytes
    pub fn byte_len(&self) -> usize {
        match self {
            WireBody::Text(text) => text.len(),
            WireBody::Binary(envelope) => envelope.byte_length,
        }
    }
}

/// Canonical, wire-safe representation of one fetch call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiteRequest {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: HeaderList,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<WireBody>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<BridgeOptions>,
}

impl LiteRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn method(&self) -> &str {
        self.method.as_deref().unwrap_or("GET")
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.header(name).is_some()
    }

    /// Whether the call asked for a progressively readable response
    pub fn wants_stream(&self) -> bool {
        if self.options.as_ref().and_then(|o| o.stream).unwrap_or(false) {
            return true;
        }
        self.header("accept")
            .map(|accept| accept.to_ascii_lowercase().contains("text/event-stream"))
            .unwrap_or(false)
    }
}

/// Response body, text when the content type is textual
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResponseBody {
    BodyText(String),
    BodyBytes(BinaryEnvelope),
}

impl Default for ResponseBody {
    fn default() -> Self {
        ResponseBody::BodyText(String::new())
    }
}

/// Buffered response as produced by the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseRecord {
    pub request_id: String,
    pub ok: bool,
    pub status: u16,
    pub status_text: String,
    pub headers: BTreeMap<String, String>,
    #[serde(flatten)]
    pub body: ResponseBody,
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Correlated reply for one `requestId`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchEnvelope {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<ResponseRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<BridgeError>,
}

impl FetchEnvelope {
    pub fn success(response: ResponseRecord) -> Self {
        Self {
            ok: true,
            response: Some(response),
            error: None,
        }
    }

    pub fn failure(error: BridgeError) -> Self {
        Self {
            ok: false,
            response: None,
            error: Some(error),
        }
    }

    pub fn into_result(self) -> Result<ResponseRecord, BridgeError> {
        match (self.response, self.error) {
            (Some(response), None) => Ok(response),
            (_, Some(error)) => Err(error),
            (None, None) => Err(BridgeError::protocol("fetch envelope carries neither response nor error")),
        }
    }
}

/// Why the bridge is (or is not) enabled for a domain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainSource {
    /// Explicit user preference
    User,
    /// Page opted in with `<meta name="bridge" content="enabled">`
    Meta,
    /// Derived from the allowed origins
    Default,
    #[default]
    None,
}

/// Per-domain bridge status; decides whether hooks are active
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeStatus {
    pub installed: bool,
    pub version: String,
    pub domain_enabled: bool,
    pub domain_source: DomainSource,
    pub origin_allowed: bool,
    pub has_api_keys: bool,
    pub ready: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl BridgeStatus {
    /// Status reported when the privileged tier cannot be reached
    pub fn unreachable(reason: impl Into<String>) -> Self {
        Self {
            installed: false,
            version: crate::constants::BRIDGE_VERSION.to_string(),
            domain_enabled: false,
            domain_source: DomainSource::None,
            origin_allowed: false,
            has_api_keys: false,
            ready: false,
            reason: Some(reason.into()),
        }
    }
}

/// Google account state as exposed to the page
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoogleState {
    pub authenticated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
}
