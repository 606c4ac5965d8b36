//! WebSocket-compatible object for page code
//!
//! [`BridgeWebSocket`] keeps the browser socket surface: ready state,
//! binary type, the four handlers, `send` and `close`. Behind it sits
//! either the bridge (every socket of the page shares one port, keyed by
//! socket id) or a direct native connection when the domain is not enabled.

use bridge_common::codec::{decode_body, encode_bytes};
use bridge_common::constants::{MAX_BODY_BYTES, PORT_BUFFER};
use bridge_common::{
    port_pair, BridgeError, PageToRelay, PortReceiver, PortSender, SocketCommand, SocketEvent, WindowSender, WireBody,
};
use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

pub const CONNECTING: u8 = 0;
pub const OPEN: u8 = 1;
pub const CLOSING: u8 = 2;
pub const CLOSED: u8 = 3;

const CLOSE_NORMAL: u16 = 1000;
const CLOSE_GOING_AWAY: u16 = 1001;
const CLOSE_NO_STATUS: u16 = 1005;
const CLOSE_ABNORMAL: u16 = 1006;

/// How binary frames are handed to `on_message`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BinaryType {
    #[default]
    Blob,
    ArrayBuffer,
}

/// Payload of a message event, or of `send`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketData {
    Text(String),
    ArrayBuffer(Bytes),
    Blob(Bytes),
}

impl SocketData {
    fn into_wire(self) -> WireBody {
        match self {
            SocketData::Text(text) => WireBody::Text(text),
            SocketData::ArrayBuffer(bytes) | SocketData::Blob(bytes) => WireBody::Binary(bridge_common::codec::to_envelope(&bytes)),
        }
    }
}

impl From<&str> for SocketData {
    fn from(text: &str) -> Self {
        SocketData::Text(text.to_string())
    }
}

impl From<String> for SocketData {
    fn from(text: String) -> Self {
        SocketData::Text(text)
    }
}

impl From<Vec<u8>> for SocketData {
    fn from(bytes: Vec<u8>) -> Self {
        SocketData::ArrayBuffer(Bytes::from(bytes))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseEvent {
    pub code: u16,
    pub reason: String,
    pub was_clean: bool,
}

pub type OpenHandler = Box<dyn FnMut() + Send>;
pub type MessageHandler = Box<dyn FnMut(SocketData) + Send>;
pub type ErrorHandler = Box<dyn FnMut(String) + Send>;
pub type CloseHandler = Box<dyn FnMut(CloseEvent) + Send>;

/// Event waiting for a handler
enum Pending {
    Open,
    Message(SocketData),
    Error(String),
    Close(CloseEvent),
}

#[derive(Default)]
struct Handlers {
    open: Option<OpenHandler>,
    message: Option<MessageHandler>,
    error: Option<ErrorHandler>,
    close: Option<CloseHandler>,
    backlog: VecDeque<Pending>,
}

struct SocketInner {
    id: String,
    url: String,
    state: AtomicU8,
    protocol: Mutex<String>,
    binary_type: Mutex<BinaryType>,
    handlers: Mutex<Handlers>,
    commands: mpsc::UnboundedSender<SocketCommand>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SocketInner {
    fn on_event(&self, event: SocketEvent) {
        match event {
            SocketEvent::Open { protocol, .. } => {
                if self
                    .state
                    .compare_exchange(CONNECTING, OPEN, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    *lock(&self.protocol) = protocol;
                    self.dispatch(Pending::Open);
                }
            }
            SocketEvent::Message { data, .. } => {
                let data = match data {
                    WireBody::Text(text) => SocketData::Text(text),
                    binary => match decode_body(&binary, MAX_BODY_BYTES) {
                        Ok(bytes) => match *lock(&self.binary_type) {
                            BinaryType::ArrayBuffer => SocketData::ArrayBuffer(Bytes::from(bytes)),
                            BinaryType::Blob => SocketData::Blob(Bytes::from(bytes)),
                        },
                        Err(e) => {
                            self.dispatch(Pending::Error(e.to_string()));
                            return;
                        }
                    },
                };
                self.dispatch(Pending::Message(data));
            }
            SocketEvent::Error { message, .. } => self.dispatch(Pending::Error(message)),
            SocketEvent::Closed {
                code, reason, was_clean, ..
            } => {
                if self.state.swap(CLOSED, Ordering::SeqCst) != CLOSED {
                    self.dispatch(Pending::Close(CloseEvent { code, reason, was_clean }));
                }
            }
        }
    }

    /// Run the matching handler outside the lock, or keep the event for later
    fn dispatch(&self, event: Pending) {
        let mut handlers = lock(&self.handlers);
        if !handlers.has_handler(&event) {
            handlers.backlog.push_back(event);
            return;
        }
        drop(handlers);
        self.invoke(event);
    }

    fn invoke(&self, event: Pending) {
        macro_rules! call {
            ($slot:ident, $($arg:expr)?) => {{
                let taken = lock(&self.handlers).$slot.take();
                if let Some(mut handler) = taken {
                    handler($($arg)?);
                    let mut handlers = lock(&self.handlers);
                    if handlers.$slot.is_none() {
                        handlers.$slot = Some(handler);
                    }
                }
            }};
        }
        match event {
            Pending::Open => call!(open,),
            Pending::Message(data) => call!(message, data),
            Pending::Error(message) => call!(error, message),
            Pending::Close(close) => call!(close, close),
        }
    }

    /// Deliver kept events that now have a handler, oldest first
    fn replay(&self) {
        loop {
            let next = {
                let mut handlers = lock(&self.handlers);
                let ready = handlers.backlog.iter().position(|event| handlers.has_handler(event));
                ready.and_then(|index| handlers.backlog.remove(index))
            };
            match next {
                Some(event) => self.invoke(event),
                None => return,
            }
        }
    }
}

impl Handlers {
    fn has_handler(&self, event: &Pending) -> bool {
        match event {
            Pending::Open => self.open.is_some(),
            Pending::Message(_) => self.message.is_some(),
            Pending::Error(_) => self.error.is_some(),
            Pending::Close(_) => self.close.is_some(),
        }
    }
}

/// Drop-in WebSocket object
#[derive(Clone)]
pub struct BridgeWebSocket {
    inner: Arc<SocketInner>,
    bridged: bool,
}

impl fmt::Debug for BridgeWebSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeWebSocket")
            .field("id", &self.inner.id)
            .field("url", &self.inner.url)
            .field("ready_state", &self.ready_state())
            .field("bridged", &self.bridged)
            .finish()
    }
}

impl BridgeWebSocket {
    fn new(
        id: String,
        url: String,
        commands: mpsc::UnboundedSender<SocketCommand>,
        mut events: mpsc::UnboundedReceiver<SocketEvent>,
        bridged: bool,
    ) -> Self {
        let inner = Arc::new(SocketInner {
            id,
            url,
            state: AtomicU8::new(CONNECTING),
            protocol: Mutex::new(String::new()),
            binary_type: Mutex::new(BinaryType::default()),
            handlers: Mutex::new(Handlers::default()),
            commands,
        });

        let weak = Arc::downgrade(&inner);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(inner) = weak.upgrade() else { return };
                let terminal = matches!(event, SocketEvent::Closed { .. });
                inner.on_event(event);
                if terminal {
                    return;
                }
            }
        });

        Self { inner, bridged }
    }

    /// Socket relayed through the bridge
    pub(crate) fn relayed(mux: &SocketMux, url: String, protocols: Vec<String>) -> Result<Self, BridgeError> {
        let id = uuid::Uuid::new_v4().to_string();
        let events = mux.register(&id);
        mux.send(SocketCommand::Connect {
            socket_id: id.clone(),
            url: url.clone(),
            protocols,
        })?;
        Ok(Self::new(id, url, mux.writer.clone(), events, true))
    }

    /// Direct socket, no bridge involved
    pub fn native(url: String, protocols: Vec<String>) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_native(id.clone(), url.clone(), protocols, command_rx, event_tx));
        Self::new(id, url, command_tx, event_rx, false)
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn is_bridged(&self) -> bool {
        self.bridged
    }

    pub fn ready_state(&self) -> u8 {
        self.inner.state.load(Ordering::SeqCst)
    }

    /// Sub-protocol chosen by the server, empty until open
    pub fn protocol(&self) -> String {
        lock(&self.inner.protocol).clone()
    }

    pub fn binary_type(&self) -> BinaryType {
        *lock(&self.inner.binary_type)
    }

    pub fn set_binary_type(&self, binary_type: BinaryType) {
        *lock(&self.inner.binary_type) = binary_type;
    }

    pub fn on_open(&self, handler: impl FnMut() + Send + 'static) {
        lock(&self.inner.handlers).open = Some(Box::new(handler));
        self.inner.replay();
    }

    pub fn on_message(&self, handler: impl FnMut(SocketData) + Send + 'static) {
        lock(&self.inner.handlers).message = Some(Box::new(handler));
        self.inner.replay();
    }

    pub fn on_error(&self, handler: impl FnMut(String) + Send + 'static) {
        lock(&self.inner.handlers).error = Some(Box::new(handler));
        self.inner.replay();
    }

    pub fn on_close(&self, handler: impl FnMut(CloseEvent) + Send + 'static) {
        lock(&self.inner.handlers).close = Some(Box::new(handler));
        self.inner.replay();
    }

    /// Fails unless the socket is open; nothing is queued
    pub fn send(&self, data: impl Into<SocketData>) -> Result<(), BridgeError> {
        match self.ready_state() {
            OPEN => {}
            CONNECTING => return Err(BridgeError::invalid_state("socket is still connecting")),
            _ => return Err(BridgeError::invalid_state("socket is closing or closed")),
        }
        let data = data.into().into_wire();
        if data.byte_len() > MAX_BODY_BYTES {
            return Err(BridgeError::BodyTooLarge {
                size: data.byte_len(),
                limit: MAX_BODY_BYTES,
            });
        }
        self.inner
            .commands
            .send(SocketCommand::Send {
                socket_id: self.inner.id.clone(),
                data,
            })
            .map_err(|_| BridgeError::unreachable("socket channel closed"))
    }

    pub fn close(&self, code: Option<u16>, reason: Option<String>) -> Result<(), BridgeError> {
        if let Some(code) = code {
            if code != CLOSE_NORMAL && !(3000..=4999).contains(&code) {
                return Err(BridgeError::invalid_request(format!("invalid close code {}", code)));
            }
        }
        let previous = self.inner.state.load(Ordering::SeqCst);
        if previous == CLOSING || previous == CLOSED {
            return Ok(());
        }
        self.inner.state.store(CLOSING, Ordering::SeqCst);
        let close = SocketCommand::Close {
            socket_id: self.inner.id.clone(),
            code,
            reason,
        };
        if self.inner.commands.send(close).is_err() {
            self.inner.on_event(SocketEvent::Closed {
                socket_id: self.inner.id.clone(),
                code: CLOSE_ABNORMAL,
                reason: "socket channel closed".to_string(),
                was_clean: false,
            });
        }
        Ok(())
    }
}

/// Shared socket port of one page, demultiplexed by socket id
pub(crate) struct SocketMux {
    writer: mpsc::UnboundedSender<SocketCommand>,
    sinks: Arc<DashMap<String, mpsc::UnboundedSender<SocketEvent>>>,
    alive: Arc<AtomicBool>,
}

impl SocketMux {
    pub(crate) fn attach(window: &WindowSender<PageToRelay>) -> Result<Self, BridgeError> {
        let (page_port, relay_port) = port_pair::<SocketCommand, SocketEvent>(PORT_BUFFER);
        window.post(PageToRelay::SocketAttach { port: relay_port })?;
        let (port_tx, port_rx) = page_port.split();

        let (writer, outgoing) = mpsc::unbounded_channel();
        let sinks = Arc::new(DashMap::new());
        let alive = Arc::new(AtomicBool::new(true));

        tokio::spawn(write_commands(outgoing, port_tx, alive.clone()));
        tokio::spawn(read_events(port_rx, sinks.clone(), alive.clone()));

        Ok(Self { writer, sinks, alive })
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && !self.writer.is_closed()
    }

    fn register(&self, socket_id: &str) -> mpsc::UnboundedReceiver<SocketEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.sinks.insert(socket_id.to_string(), tx);
        rx
    }

    fn send(&self, command: SocketCommand) -> Result<(), BridgeError> {
        self.writer
            .send(command)
            .map_err(|_| BridgeError::unreachable("socket port closed"))
    }
}

async fn write_commands(
    mut outgoing: mpsc::UnboundedReceiver<SocketCommand>,
    port: PortSender<SocketCommand>,
    alive: Arc<AtomicBool>,
) {
    while let Some(command) = outgoing.recv().await {
        if port.send(command).await.is_err() {
            break;
        }
    }
    alive.store(false, Ordering::SeqCst);
}

async fn read_events(
    mut port: PortReceiver<SocketEvent>,
    sinks: Arc<DashMap<String, mpsc::UnboundedSender<SocketEvent>>>,
    alive: Arc<AtomicBool>,
) {
    while let Some(event) = port.recv().await {
        let socket_id = event.socket_id().to_string();
        let terminal = matches!(event, SocketEvent::Closed { .. });
        match sinks.get(&socket_id) {
            Some(sink) => {
                let _ = sink.send(event);
            }
            None => debug!("Event for unknown socket {}", socket_id),
        }
        if terminal {
            sinks.remove(&socket_id);
        }
    }

    alive.store(false, Ordering::SeqCst);
    warn!("Socket port lost, closing {} sockets", sinks.len());
    for entry in sinks.iter() {
        let _ = entry.value().send(SocketEvent::Closed {
            socket_id: entry.key().clone(),
            code: CLOSE_ABNORMAL,
            reason: "bridge disconnected".to_string(),
            was_clean: false,
        });
    }
    sinks.clear();
}

async fn run_native(
    socket_id: String,
    url: String,
    protocols: Vec<String>,
    mut commands: mpsc::UnboundedReceiver<SocketCommand>,
    events: mpsc::UnboundedSender<SocketEvent>,
) {
    let emit = |event: SocketEvent| events.send(event).is_ok();
    let fail = |message: String| {
        let _ = events.send(SocketEvent::Error {
            socket_id: socket_id.clone(),
            message: message.clone(),
        });
        let _ = events.send(SocketEvent::Closed {
            socket_id: socket_id.clone(),
            code: CLOSE_ABNORMAL,
            reason: message,
            was_clean: false,
        });
    };

    let mut request = match url.as_str().into_client_request() {
        Ok(request) => request,
        Err(e) => return fail(format!("invalid socket URL: {}", e)),
    };
    if !protocols.is_empty() {
        match HeaderValue::from_str(&protocols.join(", ")) {
            Ok(value) => {
                request.headers_mut().insert("Sec-WebSocket-Protocol", value);
            }
            Err(_) => return fail("invalid sub-protocol list".to_string()),
        }
    }

    let (stream, response) = tokio::select! {
        connected = tokio_tungstenite::connect_async(request) => match connected {
            Ok(connected) => connected,
            Err(e) => return fail(format!("socket connect failed: {}", e)),
        },
        command = commands.recv() => {
            let (code, reason) = match command {
                Some(SocketCommand::Close { code, reason, .. }) => (code.unwrap_or(CLOSE_NORMAL), reason.unwrap_or_default()),
                _ => (CLOSE_GOING_AWAY, String::new()),
            };
            emit(SocketEvent::Closed { socket_id: socket_id.clone(), code, reason, was_clean: false });
            return;
        }
    };

    let protocol = response
        .headers()
        .get("sec-websocket-protocol")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    if !emit(SocketEvent::Open {
        socket_id: socket_id.clone(),
        protocol,
    }) {
        return;
    }

    let (mut sink, mut incoming) = stream.split();
    let mut closing = false;
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(SocketCommand::Send { data, .. }) => {
                    let message = match decode_body(&data, MAX_BODY_BYTES) {
                        Ok(bytes) => match data {
                            WireBody::Text(text) => Message::Text(text),
                            WireBody::Binary(_) => Message::Binary(bytes),
                        },
                        Err(e) => return fail(e.to_string()),
                    };
                    if let Err(e) = sink.send(message).await {
                        return fail(format!("socket send failed: {}", e));
                    }
                }
                Some(SocketCommand::Close { code, reason, .. }) => {
                    closing = true;
                    let frame = CloseFrame {
                        code: CloseCode::from(code.unwrap_or(CLOSE_NORMAL)),
                        reason: reason.unwrap_or_default().into(),
                    };
                    if sink.send(Message::Close(Some(frame))).await.is_err() {
                        emit(SocketEvent::Closed { socket_id: socket_id.clone(), code: CLOSE_NORMAL, reason: String::new(), was_clean: false });
                        return;
                    }
                }
                Some(SocketCommand::Connect { .. }) => {}
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    return;
                }
            },
            message = incoming.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    emit(SocketEvent::Message { socket_id: socket_id.clone(), data: WireBody::Text(text) });
                }
                Some(Ok(Message::Binary(bytes))) => {
                    let data = match encode_bytes(&bytes, None, MAX_BODY_BYTES) {
                        Ok(data) => data,
                        Err(e) => return fail(e.to_string()),
                    };
                    emit(SocketEvent::Message { socket_id: socket_id.clone(), data });
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.to_string()))
                        .unwrap_or((CLOSE_NO_STATUS, String::new()));
                    emit(SocketEvent::Closed { socket_id: socket_id.clone(), code, reason, was_clean: true });
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(_)) | None if closing => {
                    emit(SocketEvent::Closed { socket_id: socket_id.clone(), code: CLOSE_NORMAL, reason: String::new(), was_clean: false });
                    return;
                }
                Some(Err(e)) => return fail(format!("socket error: {}", e)),
                None => {
                    emit(SocketEvent::Closed { socket_id: socket_id.clone(), code: CLOSE_ABNORMAL, reason: String::new(), was_clean: false });
                    return;
                }
            },
        }
    }
}
