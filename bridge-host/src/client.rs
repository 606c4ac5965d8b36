//! Runtime channel backed by a host process
//!
//! Lets a relay talk to an engine that lives on the other end of a frame
//! stream, such as the stdio of a spawned `bridge-host`.

use crate::forward::port_queue;
use crate::frame::{read_frame, write_frame, ClientFrame, ServerFrame};
use async_trait::async_trait;
use bridge_common::constants::PORT_BUFFER;
use bridge_common::{
    port_pair, BridgeError, Port, RuntimeChannel, RuntimeMessage, RuntimeReply, SenderInfo, SocketCommand,
    SocketEvent, StreamCommand, StreamEvent,
};
use bridge_engine::LogEntry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, warn};

const LOG_CAPACITY: usize = 256;

#[derive(Default)]
struct Routes {
    pending: DashMap<u64, oneshot::Sender<RuntimeReply>>,
    streams: DashMap<u64, mpsc::UnboundedSender<StreamEvent>>,
    sockets: DashMap<u64, mpsc::UnboundedSender<SocketEvent>>,
    closed: AtomicBool,
}

impl Routes {
    /// Every waiter and port learns the host is gone
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.pending.clear();
        self.streams.clear();
        self.sockets.clear();
    }
}

pub struct HostClient {
    out: mpsc::Sender<ClientFrame>,
    next_id: AtomicU64,
    routes: Arc<Routes>,
    logs: broadcast::Sender<LogEntry>,
}

impl HostClient {
    /// Start the reader and writer tasks over a connected frame stream
    pub fn connect<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (out, outgoing) = mpsc::channel(PORT_BUFFER);
        let routes = Arc::new(Routes::default());
        let (logs, _) = broadcast::channel(LOG_CAPACITY);

        tokio::spawn(write_frames(writer, outgoing, routes.clone()));
        tokio::spawn(read_frames(reader, routes.clone(), logs.clone()));

        Self {
            out,
            next_id: AtomicU64::new(1),
            routes,
            logs,
        }
    }

    /// Log entries pushed by a host started with log forwarding
    pub fn subscribe_logs(&self) -> broadcast::Receiver<LogEntry> {
        self.logs.subscribe()
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    async fn send_frame(&self, frame: ClientFrame) -> Result<(), BridgeError> {
        self.out
            .send(frame)
            .await
            .map_err(|_| BridgeError::unreachable("host connection closed"))
    }

    /// Pump commands from a local port to the host until either side closes
    fn forward_commands<C>(&self, port_id: u64, mut commands: bridge_common::PortReceiver<C>, wrap: fn(u64, C) -> ClientFrame)
    where
        C: Send + 'static,
    {
        let out = self.out.clone();
        let routes = self.routes.clone();
        tokio::spawn(async move {
            while let Some(command) = commands.recv().await {
                if out.send(wrap(port_id, command)).await.is_err() {
                    break;
                }
            }
            routes.streams.remove(&port_id);
            routes.sockets.remove(&port_id);
            let _ = out.send(ClientFrame::ClosePort { port_id }).await;
        });
    }
}

#[async_trait]
impl RuntimeChannel for HostClient {
    async fn send_message(&self, sender: &SenderInfo, message: RuntimeMessage) -> Result<RuntimeReply, BridgeError> {
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.routes.pending.insert(id, tx);
        if self.routes.closed.load(Ordering::SeqCst) {
            self.routes.pending.remove(&id);
            return Err(BridgeError::unreachable("host connection closed"));
        }
        if let Err(e) = self
            .send_frame(ClientFrame::Message {
                id,
                sender: sender.clone(),
                message,
            })
            .await
        {
            self.routes.pending.remove(&id);
            return Err(e);
        }
        rx.await
            .map_err(|_| BridgeError::unreachable("host exited before replying"))
    }

    async fn connect_stream(&self, sender: &SenderInfo) -> Result<Port<StreamCommand, StreamEvent>, BridgeError> {
        let port_id = self.next_id();
        let (relay_side, local) = port_pair::<StreamCommand, StreamEvent>(PORT_BUFFER);
        let (events, commands) = local.split();
        self.routes.streams.insert(port_id, port_queue(port_id, events));
        self.send_frame(ClientFrame::OpenStream {
            port_id,
            sender: sender.clone(),
        })
        .await?;
        self.forward_commands(port_id, commands, |port_id, command| ClientFrame::Stream { port_id, command });
        Ok(relay_side)
    }

    async fn connect_socket(&self, sender: &SenderInfo) -> Result<Port<SocketCommand, SocketEvent>, BridgeError> {
        let port_id = self.next_id();
        let (relay_side, local) = port_pair::<SocketCommand, SocketEvent>(PORT_BUFFER);
        let (events, commands) = local.split();
        self.routes.sockets.insert(port_id, port_queue(port_id, events));
        self.send_frame(ClientFrame::OpenSocket {
            port_id,
            sender: sender.clone(),
        })
        .await?;
        self.forward_commands(port_id, commands, |port_id, command| ClientFrame::Socket { port_id, command });
        Ok(relay_side)
    }
}

async fn write_frames<W: AsyncWrite + Unpin>(mut writer: W, mut outgoing: mpsc::Receiver<ClientFrame>, routes: Arc<Routes>) {
    while let Some(frame) = outgoing.recv().await {
        if let Err(e) = write_frame(&mut writer, &frame).await {
            warn!("Host write failed: {}", e);
            routes.close();
            return;
        }
    }
}

async fn read_frames<R: AsyncRead + Unpin>(mut reader: R, routes: Arc<Routes>, logs: broadcast::Sender<LogEntry>) {
    loop {
        let frame = match read_frame::<_, ServerFrame>(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                warn!("Host read failed: {}", e);
                break;
            }
        };

        match frame {
            ServerFrame::Reply { id, reply } => match routes.pending.remove(&id) {
                Some((_, tx)) => {
                    let _ = tx.send(reply);
                }
                None => debug!("Reply {} has no waiter", id),
            },
            ServerFrame::Stream { port_id, event } => {
                let delivered = routes.streams.get(&port_id).map(|queue| queue.send(event).is_ok());
                if delivered == Some(false) {
                    routes.streams.remove(&port_id);
                }
            }
            ServerFrame::Socket { port_id, event } => {
                let delivered = routes.sockets.get(&port_id).map(|queue| queue.send(event).is_ok());
                if delivered == Some(false) {
                    routes.sockets.remove(&port_id);
                }
            }
            ServerFrame::PortClosed { port_id } => {
                routes.streams.remove(&port_id);
                routes.sockets.remove(&port_id);
            }
            ServerFrame::Log { entry } => {
                let _ = logs.send(entry);
            }
        }
    }

    routes.close();
}
