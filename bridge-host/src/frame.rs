//! Host wire format
//!
//! Each frame is a little-endian `u32` byte length followed by that many
//! bytes of JSON, the framing browsers use for native messaging hosts.

use crate::error::{HostError, Result};
use bridge_common::{RuntimeMessage, RuntimeReply, SenderInfo, SocketCommand, SocketEvent, StreamCommand, StreamEvent};
use bridge_engine::LogEntry;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Relay → host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "camelCase")]
pub enum ClientFrame {
    Message {
        id: u64,
        sender: SenderInfo,
        message: RuntimeMessage,
    },
    #[serde(rename_all = "camelCase")]
    OpenStream { port_id: u64, sender: SenderInfo },
    #[serde(rename_all = "camelCase")]
    OpenSocket { port_id: u64, sender: SenderInfo },
    #[serde(rename_all = "camelCase")]
    Stream { port_id: u64, command: StreamCommand },
    #[serde(rename_all = "camelCase")]
    Socket { port_id: u64, command: SocketCommand },
    #[serde(rename_all = "camelCase")]
    ClosePort { port_id: u64 },
}

/// Host → relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "camelCase")]
pub enum ServerFrame {
    Reply { id: u64, reply: RuntimeReply },
    #[serde(rename_all = "camelCase")]
    Stream { port_id: u64, event: StreamEvent },
    #[serde(rename_all = "camelCase")]
    Socket { port_id: u64, event: SocketEvent },
    #[serde(rename_all = "camelCase")]
    PortClosed { port_id: u64 },
    /// A finished request log entry
    Log { entry: LogEntry },
}

/// Read one frame; `None` on a clean end of stream
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut prefix = [0u8; 4];
    match reader.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let size = u32::from_le_bytes(prefix) as usize;
    if size > MAX_FRAME_BYTES {
        return Err(HostError::FrameTooLarge {
            size,
            limit: MAX_FRAME_BYTES,
        });
    }
    let mut payload = vec![0u8; size];
    reader.read_exact(&mut payload).await?;
    Ok(Some(serde_json::from_slice(&payload)?))
}

pub async fn write_frame<W, T>(writer: &mut W, frame: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(frame)?;
    if payload.len() > MAX_FRAME_BYTES {
        return Err(HostError::FrameTooLarge {
            size: payload.len(),
            limit: MAX_FRAME_BYTES,
        });
    }
    writer.write_all(&(payload.len() as u32).to_le_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}
