//! Common types for the Franzai bridge tiers
//!
//! Every tier (page, relay, engine) speaks the types defined here:
//! - the wire-safe request/response records and the body codec,
//! - the closed message catalog exchanged between tiers,
//! - the channel primitives (window bus, ports, runtime channel),
//! - the shared error taxonomy.

pub mod channel;
pub mod codec;
pub mod constants;
pub mod error;
pub mod messages;
pub mod types;

pub use channel::{port_pair, window_pair, Port, PortReceiver, PortSender, RuntimeChannel, SenderInfo, WindowEndpoint, WindowReceiver, WindowSender};
pub use codec::{BodySource, EncodedBody, FormField, FormValue};
pub use error::{BridgeError, PolicyKind};
pub use messages::{
    GoogleCall, PageCall, PageToRelay, RelayToPage, RuntimeMessage, RuntimeReply, SocketCommand, SocketEvent,
    StreamCommand, StreamEvent,
};
pub use types::{
    BinaryEnvelope, BridgeMode, BridgeOptions, BridgeStatus, DomainSource, FetchEnvelope, GoogleState, HeaderList,
    LiteRequest, ResponseBody, ResponseRecord, WireBody,
};

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;
