//! Channel primitives connecting the tiers
//!
//! - [`WindowEndpoint`]: the page ↔ relay bus. Unbounded and fire-and-forget;
//!   a message posted after the far side went away is lost and reported as
//!   [`BridgeError::RelayUnreachable`].
//! - [`Port`]: a long-lived bidirectional queue pair. Bounded, so a slow
//!   consumer suspends the producer.
//! - [`RuntimeChannel`]: what the relay needs from the privileged tier.

use crate::error::BridgeError;
use crate::messages::{RuntimeMessage, RuntimeReply, SocketCommand, SocketEvent, StreamCommand, StreamEvent};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;

/// Identity of the page behind a message, attached by the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SenderInfo {
    pub origin: String,
}

impl SenderInfo {
    pub fn new(origin: impl Into<String>) -> Self {
        Self { origin: origin.into() }
    }

    /// Hostname of the sender's origin, lowercased
    pub fn hostname(&self) -> Option<String> {
        url::Url::parse(&self.origin)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
    }
}

/// Sending half of a [`WindowEndpoint`]
pub struct WindowSender<T> {
    tx: mpsc::UnboundedSender<T>,
}

impl<T> Clone for WindowSender<T> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<T> WindowSender<T> {
    pub fn post(&self, message: T) -> Result<(), BridgeError> {
        self.tx
            .send(message)
            .map_err(|_| BridgeError::unreachable("no listener on the window bus"))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving half of a [`WindowEndpoint`]
pub struct WindowReceiver<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> WindowReceiver<T> {
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }
}

/// One side of the window bus
pub struct WindowEndpoint<Out, In> {
    pub sender: WindowSender<Out>,
    pub receiver: WindowReceiver<In>,
}

impl<Out, In> WindowEndpoint<Out, In> {
    pub fn split(self) -> (WindowSender<Out>, WindowReceiver<In>) {
        (self.sender, self.receiver)
    }
}

/// Create a connected window bus: `(page side, relay side)`
pub fn window_pair<A, B>() -> (WindowEndpoint<A, B>, WindowEndpoint<B, A>) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (
        WindowEndpoint {
            sender: WindowSender { tx: a_tx },
            receiver: WindowReceiver { rx: b_rx },
        },
        WindowEndpoint {
            sender: WindowSender { tx: b_tx },
            receiver: WindowReceiver { rx: a_rx },
        },
    )
}

/// Sending half of a [`Port`]
pub struct PortSender<T> {
    tx: mpsc::Sender<T>,
}

impl<T> Clone for PortSender<T> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<T> PortSender<T> {
    /// Send, waiting for buffer space
    pub async fn send(&self, message: T) -> Result<(), BridgeError> {
        self.tx
            .send(message)
            .await
            .map_err(|_| BridgeError::unreachable("port disconnected"))
    }

    /// Send without waiting; used where the caller cannot suspend
    pub fn try_send(&self, message: T) -> Result<(), BridgeError> {
        self.tx.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => BridgeError::invalid_state("port buffer full"),
            mpsc::error::TrySendError::Closed(_) => BridgeError::unreachable("port disconnected"),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves once the far side has dropped its receiver
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

/// Receiving half of a [`Port`]
pub struct PortReceiver<T> {
    rx: mpsc::Receiver<T>,
}

impl<T> PortReceiver<T> {
    /// `None` once the far side disconnected
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }
}

/// Long-lived bidirectional channel
pub struct Port<Out, In> {
    pub sender: PortSender<Out>,
    pub receiver: PortReceiver<In>,
}

impl<Out, In> Port<Out, In> {
    pub async fn send(&self, message: Out) -> Result<(), BridgeError> {
        self.sender.send(message).await
    }

    pub async fn recv(&mut self) -> Option<In> {
        self.receiver.recv().await
    }

    pub fn split(self) -> (PortSender<Out>, PortReceiver<In>) {
        (self.sender, self.receiver)
    }
}

impl<Out, In> fmt::Debug for Port<Out, In> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Port")
            .field("closed", &self.sender.is_closed())
            .finish()
    }
}

/// Create a connected port pair
pub fn port_pair<A, B>(buffer: usize) -> (Port<A, B>, Port<B, A>) {
    let (a_tx, a_rx) = mpsc::channel(buffer);
    let (b_tx, b_rx) = mpsc::channel(buffer);
    (
        Port {
            sender: PortSender { tx: a_tx },
            receiver: PortReceiver { rx: b_rx },
        },
        Port {
            sender: PortSender { tx: b_tx },
            receiver: PortReceiver { rx: a_rx },
        },
    )
}

/// The privileged runtime as seen from the relay
#[async_trait]
pub trait RuntimeChannel: Send + Sync {
    /// One-shot request/reply
    async fn send_message(&self, sender: &SenderInfo, message: RuntimeMessage) -> Result<RuntimeReply, BridgeError>;

    /// Open a dedicated port for one streaming request
    async fn connect_stream(&self, sender: &SenderInfo) -> Result<Port<StreamCommand, StreamEvent>, BridgeError>;

    /// Open the shared socket port
    async fn connect_socket(&self, sender: &SenderInfo) -> Result<Port<SocketCommand, SocketEvent>, BridgeError>;
}
