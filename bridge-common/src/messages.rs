//! Message catalog
//!
//! A closed set of typed envelopes. Page ↔ relay traffic travels on the
//! window bus; relay ↔ engine traffic uses one-shot runtime messages or
//! long-lived ports. Every enum is matched exhaustively by its consumer.

use crate::channel::Port;
use crate::codec::base64_bytes;
use crate::error::BridgeError;
use crate::types::{BridgeStatus, FetchEnvelope, GoogleState, LiteRequest, WireBody};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Google sub-API calls, shared by the page and engine catalogs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "call", rename_all = "camelCase")]
pub enum GoogleCall {
    #[serde(rename_all = "camelCase")]
    Auth { scopes: Vec<String> },
    Logout,
    State,
    #[serde(rename_all = "camelCase")]
    HasScopes { scopes: Vec<String> },
    #[serde(rename_all = "camelCase")]
    Fetch { request_id: String, request: LiteRequest },
}

/// Correlated calls the page asks of the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PageCall {
    Status,
    #[serde(rename_all = "camelCase")]
    KeyCheck { key_name: String },
    KeysList,
    #[serde(rename_all = "camelCase")]
    Fetch { request_id: String, request: LiteRequest },
    Google(GoogleCall),
}

/// Window bus traffic from the page
#[derive(Debug)]
pub enum PageToRelay {
    /// A call expecting exactly one correlated reply
    Request { request_id: String, call: PageCall },
    /// One-way cancellation of an in-flight fetch
    FetchAbort { request_id: String },
    /// Dedicated port for one streaming request
    StreamOpen { port: Port<StreamEvent, StreamCommand> },
    /// Shared port multiplexing every socket of the page
    SocketAttach { port: Port<SocketEvent, SocketCommand> },
}

/// Window bus traffic from the relay
#[derive(Debug, Clone, PartialEq)]
pub enum RelayToPage {
    Reply { request_id: String, reply: RuntimeReply },
}

/// One-shot messages from the relay to the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RuntimeMessage {
    #[serde(rename_all = "camelCase")]
    GetStatus { meta_enabled: bool },
    #[serde(rename_all = "camelCase")]
    KeyCheck { key_name: String },
    KeysList,
    #[serde(rename_all = "camelCase")]
    Fetch { request_id: String, request: LiteRequest },
    #[serde(rename_all = "camelCase")]
    FetchAbort { request_id: String },
    Google(GoogleCall),
}

/// Replies to [`RuntimeMessage`] and [`PageCall`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RuntimeReply {
    Status(BridgeStatus),
    #[serde(rename_all = "camelCase")]
    KeyCheck { is_set: bool },
    KeysList { keys: Vec<String> },
    Fetch(FetchEnvelope),
    GoogleState(GoogleState),
    HasScopes { has: bool },
    Ack,
    Error(BridgeError),
}

/// Page/relay → engine on a stream port
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StreamCommand {
    #[serde(rename_all = "camelCase")]
    Start { request_id: String, request: LiteRequest },
    #[serde(rename_all = "camelCase")]
    Abort { request_id: String },
}

/// Engine → relay/page on a stream port: `Headers`, `Chunk*`, then `End` or `Error`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StreamEvent {
    #[serde(rename_all = "camelCase")]
    Headers {
        status: u16,
        status_text: String,
        headers: BTreeMap<String, String>,
    },
    Chunk {
        #[serde(with = "base64_bytes")]
        bytes: Vec<u8>,
    },
    End,
    Error { error: BridgeError },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::End | StreamEvent::Error { .. })
    }
}

/// Page/relay → engine on the shared socket port
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SocketCommand {
    #[serde(rename_all = "camelCase")]
    Connect {
        socket_id: String,
        url: String,
        #[serde(default)]
        protocols: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    Send { socket_id: String, data: WireBody },
    #[serde(rename_all = "camelCase")]
    Close {
        socket_id: String,
        code: Option<u16>,
        reason: Option<String>,
    },
}

impl SocketCommand {
    pub fn socket_id(&self) -> &str {
        match self {
            SocketCommand::Connect { socket_id, .. }
            | SocketCommand::Send { socket_id, .. }
            | SocketCommand::Close { socket_id, .. } => socket_id,
        }
    }
}

/// Engine → relay/page on the shared socket port
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SocketEvent {
    #[serde(rename_all = "camelCase")]
    Open { socket_id: String, protocol: String },
    #[serde(rename_all = "camelCase")]
    Message { socket_id: String, data: WireBody },
    #[serde(rename_all = "camelCase")]
    Error { socket_id: String, message: String },
    #[serde(rename_all = "camelCase")]
    Closed {
        socket_id: String,
        code: u16,
        reason: String,
        was_clean: bool,
    },
}

impl SocketEvent {
    pub fn socket_id(&self) -> &str {
        match self {
            SocketEvent::Open { socket_id, .. }
            | SocketEvent::Message { socket_id, .. }
            | SocketEvent::Error { socket_id, .. }
            | SocketEvent::Closed { socket_id, .. } => socket_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_message_tags() {
        let msg = RuntimeMessage::KeyCheck {
            key_name: "OPENAI_API_KEY".to_string(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "keyCheck");
        assert_eq!(json["keyName"], "OPENAI_API_KEY");

        let google = RuntimeMessage::Google(GoogleCall::HasScopes {
            scopes: vec!["drive".to_string()],
        });
        let back: RuntimeMessage = serde_json::from_value(serde_json::to_value(&google).unwrap()).unwrap();
        assert_eq!(back, google);
    }

    #[test]
    fn test_stream_chunk_is_base64_on_the_wire() {
        let event = StreamEvent::Chunk { bytes: vec![0, 255, 1] };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["bytes"], "AP8B");
        let back: StreamEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
        assert!(!back.is_terminal());
        assert!(StreamEvent::End.is_terminal());
    }
}
