//! Relay router
//!
//! Sits between the page and the engine. It attaches the page origin to
//! every message, refuses network work for domains that are not enabled
//! and pipes stream and socket ports through to the engine.

use bridge_common::constants::STATUS_CACHE_TTL_MS;
use bridge_common::{
    BridgeError, BridgeStatus, FetchEnvelope, GoogleCall, PageCall, PageToRelay, Port, RelayToPage, RuntimeChannel,
    RuntimeMessage, RuntimeReply, SenderInfo, SocketCommand, SocketEvent, StreamCommand, StreamEvent, WindowEndpoint,
    WindowSender,
};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Close code reported for a socket the relay refused
const CLOSE_ABNORMAL: u16 = 1006;

pub struct RelayRouter {
    runtime: Arc<dyn RuntimeChannel>,
    sender: SenderInfo,
    meta_enabled: bool,
    status_ttl: Duration,
    status: Mutex<Option<(BridgeStatus, Instant)>>,
}

impl RelayRouter {
    pub fn new(runtime: Arc<dyn RuntimeChannel>, sender: SenderInfo, meta_enabled: bool) -> Self {
        Self {
            runtime,
            sender,
            meta_enabled,
            status_ttl: Duration::from_millis(STATUS_CACHE_TTL_MS),
            status: Mutex::new(None),
        }
    }

    pub fn with_status_ttl(mut self, ttl: Duration) -> Self {
        self.status_ttl = ttl;
        self
    }

    pub fn sender(&self) -> &SenderInfo {
        &self.sender
    }

    /// Serve the window bus until the page side goes away
    pub async fn run(self: Arc<Self>, window: WindowEndpoint<RelayToPage, PageToRelay>) {
        let (replies, mut incoming) = window.split();
        info!("Relay listening for {}", self.sender.origin);

        while let Some(message) = incoming.recv().await {
            let router = self.clone();
            let replies = replies.clone();
            tokio::spawn(async move { router.dispatch(message, replies).await });
        }
        debug!("Window bus for {} closed", self.sender.origin);
    }

    async fn dispatch(&self, message: PageToRelay, replies: WindowSender<RelayToPage>) {
        match message {
            PageToRelay::Request { request_id, call } => {
                let reply = self.handle_call(call).await;
                if replies.post(RelayToPage::Reply { request_id, reply }).is_err() {
                    debug!("Page went away before its reply");
                }
            }
            PageToRelay::FetchAbort { request_id } => {
                if let Err(e) = self
                    .runtime
                    .send_message(&self.sender, RuntimeMessage::FetchAbort { request_id })
                    .await
                {
                    debug!("Abort not delivered: {}", e);
                }
            }
            PageToRelay::StreamOpen { port } => self.bridge_stream(port).await,
            PageToRelay::SocketAttach { port } => self.bridge_sockets(port).await,
        }
    }

    /// Fetch the status from the engine, refreshing the local copy
    pub async fn status(&self, force: bool) -> Result<BridgeStatus, BridgeError> {
        if !force {
            if let Ok(cached) = self.status.lock() {
                if let Some((status, at)) = cached.as_ref() {
                    if at.elapsed() < self.status_ttl {
                        return Ok(status.clone());
                    }
                }
            }
        }

        let reply = self
            .runtime
            .send_message(
                &self.sender,
                RuntimeMessage::GetStatus {
                    meta_enabled: self.meta_enabled,
                },
            )
            .await?;
        match reply {
            RuntimeReply::Status(status) => {
                if let Ok(mut cached) = self.status.lock() {
                    *cached = Some((status.clone(), Instant::now()));
                }
                Ok(status)
            }
            RuntimeReply::Error(e) => Err(e),
            other => Err(BridgeError::protocol(format!("unexpected status reply: {:?}", other))),
        }
    }

    /// Network work is only relayed for enabled domains. Always asks the
    /// engine; the cached copy only answers page status queries.
    async fn ensure_enabled(&self) -> Result<(), BridgeError> {
        let status = self.status(true).await?;
        if status.domain_enabled {
            Ok(())
        } else {
            Err(BridgeError::DomainDisabled {
                origin: self.sender.origin.clone(),
            })
        }
    }

    async fn forward(&self, message: RuntimeMessage) -> RuntimeReply {
        self.runtime
            .send_message(&self.sender, message)
            .await
            .unwrap_or_else(RuntimeReply::Error)
    }

    async fn forward_fetch(&self, message: RuntimeMessage) -> RuntimeReply {
        if let Err(e) = self.ensure_enabled().await {
            return RuntimeReply::Fetch(FetchEnvelope::failure(e));
        }
        match self.runtime.send_message(&self.sender, message).await {
            Ok(reply) => reply,
            Err(e) => RuntimeReply::Fetch(FetchEnvelope::failure(e)),
        }
    }

    /// Answer one correlated page call
    pub async fn handle_call(&self, call: PageCall) -> RuntimeReply {
        match call {
            PageCall::Status => match self.status(true).await {
                Ok(status) => RuntimeReply::Status(status),
                Err(e) => {
                    warn!("Engine unreachable: {}", e);
                    RuntimeReply::Error(BridgeError::unreachable(e.to_string()))
                }
            },
            PageCall::KeyCheck { key_name } => self.forward(RuntimeMessage::KeyCheck { key_name }).await,
            PageCall::KeysList => self.forward(RuntimeMessage::KeysList).await,
            PageCall::Fetch { request_id, request } => {
                self.forward_fetch(RuntimeMessage::Fetch { request_id, request }).await
            }
            PageCall::Google(call @ GoogleCall::Fetch { .. }) => self.forward_fetch(RuntimeMessage::Google(call)).await,
            PageCall::Google(call) => self.forward(RuntimeMessage::Google(call)).await,
        }
    }

    async fn bridge_stream(&self, page: Port<StreamEvent, StreamCommand>) {
        let (page_tx, mut page_rx) = page.split();

        let start = match page_rx.recv().await {
            Some(start @ StreamCommand::Start { .. }) => start,
            Some(StreamCommand::Abort { .. }) | None => return,
        };

        if let Err(e) = self.ensure_enabled().await {
            let _ = page_tx.send(StreamEvent::Error { error: e }).await;
            return;
        }

        let engine = match self.runtime.connect_stream(&self.sender).await {
            Ok(port) => port,
            Err(e) => {
                let _ = page_tx.send(StreamEvent::Error { error: e }).await;
                return;
            }
        };
        let (engine_tx, mut engine_rx) = engine.split();
        if let Err(e) = engine_tx.send(start).await {
            let _ = page_tx.send(StreamEvent::Error { error: e }).await;
            return;
        }

        loop {
            tokio::select! {
                command = page_rx.recv() => match command {
                    Some(command) => {
                        if engine_tx.send(command).await.is_err() {
                            break;
                        }
                    }
                    // Dropping the engine port cancels the upstream read
                    None => break,
                },
                event = engine_rx.recv() => match event {
                    Some(event) => {
                        let terminal = event.is_terminal();
                        if page_tx.send(event).await.is_err() || terminal {
                            break;
                        }
                    }
                    None => {
                        let _ = page_tx
                            .send(StreamEvent::Error {
                                error: BridgeError::unreachable("engine closed the stream"),
                            })
                            .await;
                        break;
                    }
                },
            }
        }
    }

    async fn bridge_sockets(&self, page: Port<SocketEvent, SocketCommand>) {
        let (page_tx, mut page_rx) = page.split();

        let engine = match self.runtime.connect_socket(&self.sender).await {
            Ok(port) => Some(port.split()),
            Err(e) => {
                warn!("Socket port unavailable: {}", e);
                None
            }
        };

        let refuse = |socket_id: String, message: String| {
            let page_tx = page_tx.clone();
            async move {
                let _ = page_tx
                    .send(SocketEvent::Error {
                        socket_id: socket_id.clone(),
                        message: message.clone(),
                    })
                    .await;
                let _ = page_tx
                    .send(SocketEvent::Closed {
                        socket_id,
                        code: CLOSE_ABNORMAL,
                        reason: message,
                        was_clean: false,
                    })
                    .await;
            }
        };

        let Some((engine_tx, mut engine_rx)) = engine else {
            while let Some(command) = page_rx.recv().await {
                if let SocketCommand::Connect { socket_id, .. } = command {
                    refuse(socket_id, "bridge unreachable".to_string()).await;
                }
            }
            return;
        };

        loop {
            tokio::select! {
                command = page_rx.recv() => match command {
                    Some(SocketCommand::Connect { socket_id, url, protocols }) => {
                        if let Err(e) = self.ensure_enabled().await {
                            refuse(socket_id, e.to_string()).await;
                            continue;
                        }
                        let connect = SocketCommand::Connect { socket_id: socket_id.clone(), url, protocols };
                        if engine_tx.send(connect).await.is_err() {
                            refuse(socket_id, "bridge unreachable".to_string()).await;
                        }
                    }
                    Some(command) => {
                        let _ = engine_tx.send(command).await;
                    }
                    None => break,
                },
                event = engine_rx.recv() => match event {
                    Some(event) => {
                        if page_tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        warn!("Engine closed the socket port");
                        break;
                    }
                },
            }
        }
    }
}
