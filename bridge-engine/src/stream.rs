//! Streaming responses over a dedicated port
//!
//! The first command on the port must be `Start`. The engine answers with
//! `Headers`, any number of `Chunk`s and exactly one `End` or `Error`.
//! Chunk sends wait for port capacity, so a slow reader slows the upstream
//! read instead of growing a buffer.

use crate::engine::{Authorization, Engine};
use crate::executor::{header_map, status_text};
use crate::logs::preview_bytes;
use bridge_common::{BridgeError, Port, PortSender, SenderInfo, StreamCommand, StreamEvent};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct StreamSummary {
    status: u16,
    status_text: String,
    headers: std::collections::BTreeMap<String, String>,
    bytes: usize,
    head: Vec<u8>,
}

/// Serve one streaming request on `port`
pub async fn serve_stream_port(engine: Arc<Engine>, sender: SenderInfo, port: Port<StreamEvent, StreamCommand>) {
    let (events, mut commands) = port.split();

    let (request_id, request) = match commands.recv().await {
        Some(StreamCommand::Start { request_id, request }) => (request_id, request),
        Some(StreamCommand::Abort { request_id }) => {
            debug!("[{}] stream aborted before start", request_id);
            return;
        }
        None => return,
    };

    let started = Instant::now();
    info!("[{}] stream {} {} from {}", request_id, request.method(), request.url, sender.origin);

    let prepared = match engine.prepare(&sender, &request, Authorization::Standard).await {
        Ok(prepared) => prepared,
        Err(e) => {
            warn!("[{}] stream rejected: {}", request_id, e);
            let mut entry = engine.start_entry(&sender, &request_id, &request, None);
            entry.error = Some(e.to_string());
            entry.elapsed_ms = Some(started.elapsed().as_millis() as u64);
            engine.logs().push(entry).await;
            let _ = events.send(StreamEvent::Error { error: e }).await;
            return;
        }
    };

    engine
        .logs()
        .push(engine.start_entry(&sender, &request_id, &request, Some(&prepared)))
        .await;
    let token = engine.aborts().register(&request_id);

    // Abort command or a dropped port cancels the upstream read
    let watcher = tokio::spawn({
        let token = token.clone();
        let request_id = request_id.clone();
        async move {
            loop {
                match commands.recv().await {
                    Some(StreamCommand::Abort { .. }) | None => {
                        debug!("[{}] stream cancelled by reader", request_id);
                        token.cancel();
                        break;
                    }
                    Some(StreamCommand::Start { .. }) => {
                        warn!("[{}] duplicate start ignored", request_id);
                    }
                }
            }
        }
    });

    let result = pump(&engine, &prepared.request, &token, &events).await;
    watcher.abort();
    engine.aborts().release(&request_id);
    let elapsed_ms = started.elapsed().as_millis() as u64;

    match result {
        Ok(summary) => {
            info!("[{}] stream finished: {} bytes", request_id, summary.bytes);
            let preview = preview_bytes(&summary.head, engine.config().preview_limit);
            engine
                .logs()
                .update(&request_id, |entry| {
                    entry.elapsed_ms = Some(elapsed_ms);
                    entry.status = Some(summary.status);
                    entry.status_text = Some(summary.status_text);
                    entry.response_headers = Some(summary.headers);
                    entry.response_body_preview = Some(preview);
                })
                .await;
        }
        Err(e) => {
            if e.is_abort() {
                info!("[{}] stream aborted", request_id);
            } else {
                warn!("[{}] stream failed: {}", request_id, e);
            }
            engine
                .logs()
                .update(&request_id, |entry| {
                    entry.elapsed_ms = Some(elapsed_ms);
                    entry.error = Some(e.to_string());
                })
                .await;
            // The reader may already be gone
            let _ = events.send(StreamEvent::Error { error: e }).await;
        }
    }
}

async fn pump(
    engine: &Engine,
    request: &crate::executor::PreparedRequest,
    token: &CancellationToken,
    events: &PortSender<StreamEvent>,
) -> Result<StreamSummary, BridgeError> {
    let timeout = engine.config().fetch_timeout();
    let response = engine.executor().send(request, token, timeout).await?;
    let status = response.status();
    let headers = header_map(response.headers());

    events
        .send(StreamEvent::Headers {
            status: status.as_u16(),
            status_text: status_text(status),
            headers: headers.clone(),
        })
        .await?;

    let preview_limit = engine.config().preview_limit;
    let mut head = Vec::new();
    let mut bytes = 0usize;
    let mut body = response.bytes_stream();
    loop {
        let next = tokio::select! {
            _ = token.cancelled() => return Err(BridgeError::Aborted),
            next = body.next() => next,
        };
        match next {
            None => break,
            Some(Err(e)) => return Err(BridgeError::upstream(Some(status.as_u16()), format!("stream read failed: {}", e))),
            Some(Ok(chunk)) => {
                bytes += chunk.len();
                if head.len() < preview_limit {
                    let take = (preview_limit - head.len()).min(chunk.len());
                    head.extend_from_slice(&chunk[..take]);
                }
                tokio::select! {
                    _ = token.cancelled() => return Err(BridgeError::Aborted),
                    sent = events.send(StreamEvent::Chunk { bytes: chunk.to_vec() }) => sent?,
                }
            }
        }
    }

    events.send(StreamEvent::End).await?;
    Ok(StreamSummary {
        status: status.as_u16(),
        status_text: status_text(status),
        headers,
        bytes,
        head,
    })
}
