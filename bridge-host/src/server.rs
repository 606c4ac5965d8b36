//! Serves the runtime channel of one engine over a frame stream

use crate::error::Result;
use crate::forward::port_queue;
use crate::frame::{read_frame, write_frame, ClientFrame, ServerFrame};
use bridge_common::constants::PORT_BUFFER;
use bridge_common::{RuntimeChannel, RuntimeReply, SocketCommand, StreamCommand};
use bridge_engine::EngineHandle;
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

pub struct HostServer {
    handle: EngineHandle,
    forward_logs: bool,
}

impl HostServer {
    pub fn new(handle: EngineHandle) -> Self {
        Self {
            handle,
            forward_logs: false,
        }
    }

    /// Also push every finished log entry to the client
    pub fn with_log_forwarding(mut self, forward_logs: bool) -> Self {
        self.forward_logs = forward_logs;
        self
    }

    /// Run until the client closes its end
    pub async fn serve<R, W>(&self, mut reader: R, mut writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (out, mut outgoing) = mpsc::channel::<ServerFrame>(PORT_BUFFER);
        let writer_task = tokio::spawn(async move {
            while let Some(frame) = outgoing.recv().await {
                if let Err(e) = write_frame(&mut writer, &frame).await {
                    warn!("Frame write failed: {}", e);
                    break;
                }
            }
        });

        if self.forward_logs {
            tokio::spawn(forward_logs(self.handle.engine().logs().subscribe(), out.clone()));
        }

        let mut streams: HashMap<u64, mpsc::UnboundedSender<StreamCommand>> = HashMap::new();
        let mut sockets: HashMap<u64, mpsc::UnboundedSender<SocketCommand>> = HashMap::new();
        info!("Host serving runtime channel");

        let outcome = loop {
            let frame = match read_frame::<_, ClientFrame>(&mut reader).await {
                Ok(Some(frame)) => frame,
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            };

            match frame {
                ClientFrame::Message { id, sender, message } => {
                    let handle = self.handle.clone();
                    let out = out.clone();
                    tokio::spawn(async move {
                        let reply = handle
                            .send_message(&sender, message)
                            .await
                            .unwrap_or_else(RuntimeReply::Error);
                        let _ = out.send(ServerFrame::Reply { id, reply }).await;
                    });
                }
                ClientFrame::OpenStream { port_id, sender } => match self.handle.connect_stream(&sender).await {
                    Ok(port) => {
                        let (commands, mut events) = port.split();
                        streams.insert(port_id, port_queue(port_id, commands));
                        let out = out.clone();
                        tokio::spawn(async move {
                            while let Some(event) = events.recv().await {
                                if out.send(ServerFrame::Stream { port_id, event }).await.is_err() {
                                    return;
                                }
                            }
                            let _ = out.send(ServerFrame::PortClosed { port_id }).await;
                        });
                    }
                    Err(e) => {
                        warn!("Stream port {} refused: {}", port_id, e);
                        let _ = out.send(ServerFrame::PortClosed { port_id }).await;
                    }
                },
                ClientFrame::OpenSocket { port_id, sender } => match self.handle.connect_socket(&sender).await {
                    Ok(port) => {
                        let (commands, mut events) = port.split();
                        sockets.insert(port_id, port_queue(port_id, commands));
                        let out = out.clone();
                        tokio::spawn(async move {
                            while let Some(event) = events.recv().await {
                                if out.send(ServerFrame::Socket { port_id, event }).await.is_err() {
                                    return;
                                }
                            }
                            let _ = out.send(ServerFrame::PortClosed { port_id }).await;
                        });
                    }
                    Err(e) => {
                        warn!("Socket port {} refused: {}", port_id, e);
                        let _ = out.send(ServerFrame::PortClosed { port_id }).await;
                    }
                },
                ClientFrame::Stream { port_id, command } => {
                    let delivered = match streams.get(&port_id) {
                        Some(queue) => queue.send(command).is_ok(),
                        None => false,
                    };
                    if !delivered {
                        debug!("Stream port {} is gone", port_id);
                        streams.remove(&port_id);
                    }
                }
                ClientFrame::Socket { port_id, command } => {
                    let delivered = match sockets.get(&port_id) {
                        Some(queue) => queue.send(command).is_ok(),
                        None => false,
                    };
                    if !delivered {
                        debug!("Socket port {} is gone", port_id);
                        sockets.remove(&port_id);
                    }
                }
                ClientFrame::ClosePort { port_id } => {
                    // Dropping the sender tells the engine side
                    streams.remove(&port_id);
                    sockets.remove(&port_id);
                }
            }
        };

        info!("Client disconnected, closing {} ports", streams.len() + sockets.len());
        drop(streams);
        drop(sockets);
        drop(out);
        writer_task.abort();
        outcome
    }
}

async fn forward_logs(mut entries: broadcast::Receiver<bridge_engine::LogEntry>, out: mpsc::Sender<ServerFrame>) {
    loop {
        match entries.recv().await {
            Ok(entry) => {
                if out.send(ServerFrame::Log { entry }).await.is_err() {
                    return;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Log forwarding skipped {} entries", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}
