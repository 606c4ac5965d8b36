//! WebSocket connections multiplexed over one port
//!
//! Every socket of a page shares a single port; commands and events carry
//! the socket id. Each id sees `Open`, then `Message`s, then exactly one
//! `Closed` (possibly preceded by `Error`). Dropping the port closes every
//! socket it owns.

use crate::engine::Engine;
use crate::injection::{apply_injection_rules, Injected};
use crate::logs::{redact_query, LogEntry};
use crate::policy::RequestPolicy;
use bridge_common::codec::{from_envelope, to_envelope};
use bridge_common::{BridgeError, HeaderList, Port, PortSender, SenderInfo, SocketCommand, SocketEvent, WireBody};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;

/// Abnormal closure, reported when no close frame was received
pub const CLOSE_ABNORMAL: u16 = 1006;
pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_NORMAL: u16 = 1000;
const CLOSE_NO_STATUS: u16 = 1005;

type SocketTable = Arc<DashMap<String, mpsc::UnboundedSender<SocketCommand>>>;

/// Serve the shared socket port of one page
pub async fn serve_socket_port(engine: Arc<Engine>, sender: SenderInfo, port: Port<SocketEvent, SocketCommand>) {
    let (events, mut commands) = port.split();
    let sockets: SocketTable = Arc::new(DashMap::new());

    while let Some(command) = commands.recv().await {
        match command {
            SocketCommand::Connect { socket_id, url, protocols } => {
                if sockets.contains_key(&socket_id) {
                    warn!("Duplicate socket id {}", socket_id);
                    let _ = events
                        .send(SocketEvent::Error {
                            socket_id,
                            message: "duplicate socket id".to_string(),
                        })
                        .await;
                    continue;
                }
                let (tx, rx) = mpsc::unbounded_channel();
                sockets.insert(socket_id.clone(), tx);
                tokio::spawn(run_socket(
                    engine.clone(),
                    sender.clone(),
                    socket_id,
                    url,
                    protocols,
                    rx,
                    events.clone(),
                    sockets.clone(),
                ));
            }
            other => {
                let socket_id = other.socket_id().to_string();
                match sockets.get(&socket_id) {
                    Some(tx) => {
                        let _ = tx.send(other);
                    }
                    None => debug!("Command for unknown socket {}", socket_id),
                }
            }
        }
    }

    debug!("Socket port from {} closed, dropping {} sockets", sender.origin, sockets.len());
    // Dropping the command senders makes every socket task close
    sockets.clear();
}

/// Policy, injection and the client handshake request
fn prepare_socket(
    settings: &crate::settings::BridgeSettings,
    sender: &SenderInfo,
    raw_url: &str,
    protocols: &[String],
) -> Result<(Url, HeaderList, Injected), BridgeError> {
    let policy = RequestPolicy::from_settings(settings);
    policy.check_origin(&sender.origin)?;

    let mut url = Url::parse(raw_url).map_err(|e| BridgeError::invalid_request(format!("invalid URL '{}': {}", raw_url, e)))?;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(BridgeError::invalid_request(format!("unsupported socket scheme '{}'", url.scheme())));
    }
    policy.check_destination_url(&url)?;

    let mut headers = HeaderList::new();
    if !protocols.is_empty() {
        headers.push(("Sec-WebSocket-Protocol".to_string(), protocols.join(", ")));
    }
    let injected = apply_injection_rules(&settings.injection_rules, &settings.env, &mut url, &mut headers);
    Ok((url, headers, injected))
}

async fn emit(events: &PortSender<SocketEvent>, event: SocketEvent) -> bool {
    events.send(event).await.is_ok()
}

async fn emit_failure(events: &PortSender<SocketEvent>, socket_id: &str, message: String) {
    let _ = events
        .send(SocketEvent::Error {
            socket_id: socket_id.to_string(),
            message: message.clone(),
        })
        .await;
    let _ = events
        .send(SocketEvent::Closed {
            socket_id: socket_id.to_string(),
            code: CLOSE_ABNORMAL,
            reason: message,
            was_clean: false,
        })
        .await;
}

#[allow(clippy::too_many_arguments)]
async fn run_socket(
    engine: Arc<Engine>,
    sender: SenderInfo,
    socket_id: String,
    raw_url: String,
    protocols: Vec<String>,
    mut commands: mpsc::UnboundedReceiver<SocketCommand>,
    events: PortSender<SocketEvent>,
    sockets: SocketTable,
) {
    let started = Instant::now();
    let settings = engine.settings().await;
    let mut entry = LogEntry::new(&socket_id, &sender.origin, "WEBSOCKET", &raw_url);

    let outcome = connect_and_relay(&engine, &settings, &sender, &socket_id, &raw_url, &protocols, &mut commands, &events, &mut entry).await;
    if let Err(e) = outcome {
        warn!("[{}] socket failed: {}", socket_id, e);
        entry.error = Some(e.to_string());
        emit_failure(&events, &socket_id, e.to_string()).await;
    }

    sockets.remove(&socket_id);
    entry.elapsed_ms = Some(started.elapsed().as_millis() as u64);
    // Rejected before connecting: the entry was never pushed
    let finished = entry.clone();
    if !engine.logs().update(&socket_id, |logged| *logged = finished).await {
        engine.logs().push(entry).await;
    }
}

#[allow(clippy::too_many_arguments)]
async fn connect_and_relay(
    engine: &Engine,
    settings: &crate::settings::BridgeSettings,
    sender: &SenderInfo,
    socket_id: &str,
    raw_url: &str,
    protocols: &[String],
    commands: &mut mpsc::UnboundedReceiver<SocketCommand>,
    events: &PortSender<SocketEvent>,
    entry: &mut LogEntry,
) -> Result<(), BridgeError> {
    let (url, headers, injected) = prepare_socket(settings, sender, raw_url, protocols)?;
    *entry = LogEntry::new(socket_id, &sender.origin, "WEBSOCKET", &redact_query(&url, &injected.query))
        .with_request_headers(&headers, |name| injected.is_injected_header(name));
    engine.logs().push(entry.clone()).await;

    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| BridgeError::invalid_request(format!("invalid socket request: {}", e)))?;
    for (name, value) in &headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| BridgeError::invalid_request(format!("invalid header name '{}'", name)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| BridgeError::invalid_request(format!("invalid value for header '{}'", name)))?;
        request.headers_mut().insert(name, value);
    }

    info!("[{}] connecting socket to {}", socket_id, url);
    let timeout = engine.config().fetch_timeout();
    let connect = tokio::time::timeout(timeout, tokio_tungstenite::connect_async(request));

    // A close before the handshake completes cancels the connect
    let (stream, response) = tokio::select! {
        result = connect => match result {
            Err(_) => return Err(BridgeError::timeout("socket connect", timeout.as_millis() as u64)),
            Ok(Err(e)) => return Err(BridgeError::upstream(None, format!("socket connect failed: {}", e))),
            Ok(Ok(connected)) => connected,
        },
        command = commands.recv() => {
            let (code, reason) = match command {
                Some(SocketCommand::Close { code, reason, .. }) => (code.unwrap_or(CLOSE_NORMAL), reason.unwrap_or_default()),
                _ => (CLOSE_GOING_AWAY, String::new()),
            };
            let _ = emit(events, SocketEvent::Closed {
                socket_id: socket_id.to_string(),
                code,
                reason,
                was_clean: false,
            }).await;
            entry.error = Some("closed before open".to_string());
            return Ok(());
        }
    };

    let protocol = response
        .headers()
        .get("sec-websocket-protocol")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    entry.status = Some(response.status().as_u16());
    entry.status_text = response.status().canonical_reason().map(str::to_string);
    let opened = entry.clone();
    engine.logs().update(socket_id, |logged| *logged = opened).await;

    if !emit(events, SocketEvent::Open {
        socket_id: socket_id.to_string(),
        protocol,
    })
    .await
    {
        return Ok(());
    }

    let limit = engine.config().max_body_bytes;
    let (mut sink, mut incoming) = stream.split();
    let mut closing = false;

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(SocketCommand::Send { data, .. }) => {
                    let message = match data {
                        WireBody::Text(text) => Message::Text(text.into()),
                        WireBody::Binary(envelope) => Message::Binary(from_envelope(&envelope, limit)?.into()),
                    };
                    sink.send(message)
                        .await
                        .map_err(|e| BridgeError::upstream(None, format!("socket send failed: {}", e)))?;
                }
                Some(SocketCommand::Close { code, reason, .. }) => {
                    closing = true;
                    let frame = CloseFrame {
                        code: CloseCode::from(code.unwrap_or(CLOSE_NORMAL)),
                        reason: reason.unwrap_or_default().into(),
                    };
                    if sink.send(Message::Close(Some(frame))).await.is_err() {
                        break;
                    }
                }
                Some(SocketCommand::Connect { .. }) => {}
                None => {
                    // Port dropped; nobody is left to tell
                    let _ = sink.send(Message::Close(Some(CloseFrame {
                        code: CloseCode::from(CLOSE_GOING_AWAY),
                        reason: "going away".into(),
                    }))).await;
                    return Ok(());
                }
            },
            message = incoming.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    if !emit(events, SocketEvent::Message {
                        socket_id: socket_id.to_string(),
                        data: WireBody::Text(text.to_string()),
                    }).await {
                        return Ok(());
                    }
                }
                Some(Ok(Message::Binary(bytes))) => {
                    if !emit(events, SocketEvent::Message {
                        socket_id: socket_id.to_string(),
                        data: WireBody::Binary(to_envelope(&bytes)),
                    }).await {
                        return Ok(());
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.to_string()))
                        .unwrap_or((CLOSE_NO_STATUS, String::new()));
                    debug!("[{}] socket closed by peer: {}", socket_id, code);
                    let _ = emit(events, SocketEvent::Closed {
                        socket_id: socket_id.to_string(),
                        code,
                        reason,
                        was_clean: true,
                    }).await;
                    return Ok(());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) if closing => {
                    debug!("[{}] socket error while closing: {}", socket_id, e);
                    let _ = emit(events, SocketEvent::Closed {
                        socket_id: socket_id.to_string(),
                        code: CLOSE_NORMAL,
                        reason: String::new(),
                        was_clean: false,
                    }).await;
                    return Ok(());
                }
                Some(Err(e)) => {
                    return Err(BridgeError::upstream(None, format!("socket error: {}", e)));
                }
                None => {
                    let _ = emit(events, SocketEvent::Closed {
                        socket_id: socket_id.to_string(),
                        code: if closing { CLOSE_NORMAL } else { CLOSE_ABNORMAL },
                        reason: String::new(),
                        was_clean: closing,
                    }).await;
                    return Ok(());
                }
            },
        }
    }

    let _ = emit(events, SocketEvent::Closed {
        socket_id: socket_id.to_string(),
        code: CLOSE_ABNORMAL,
        reason: String::new(),
        was_clean: false,
    })
    .await;
    Ok(())
}
