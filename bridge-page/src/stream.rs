//! Page side of the streaming relay
//!
//! Opens a dedicated port per call, waits for `Headers` under its own
//! deadline and then feeds chunks into a [`ResponseStream`].

use crate::response::{Response, ResponseStream};
use crate::signal::{wait_aborted, AbortSignal};
use bridge_common::constants::PORT_BUFFER;
use bridge_common::{
    port_pair, BridgeError, LiteRequest, PageToRelay, PortReceiver, PortSender, StreamCommand, StreamEvent,
    WindowSender,
};
use bytes::Bytes;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Sends at most one `Abort` for a stream, however many paths ask for it
pub struct StreamAborter {
    request_id: String,
    commands: PortSender<StreamCommand>,
    done: AtomicBool,
    token: CancellationToken,
}

impl StreamAborter {
    fn new(request_id: String, commands: PortSender<StreamCommand>) -> Self {
        Self {
            request_id,
            commands,
            done: AtomicBool::new(false),
            token: CancellationToken::new(),
        }
    }

    /// Notify the far side and stop the local pump
    pub fn abort(&self) {
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("[{}] aborting stream", self.request_id);
        let notice = StreamCommand::Abort {
            request_id: self.request_id.clone(),
        };
        if let Err(e) = self.commands.try_send(notice) {
            debug!("[{}] abort notice not sent: {}", self.request_id, e);
        }
        self.token.cancel();
    }

    /// The stream reached its terminal event; later aborts are no-ops
    fn finish(&self) {
        self.done.store(true, Ordering::SeqCst);
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }
}

/// Start a streamed call and resolve once headers arrive
pub async fn open_stream(
    window: &WindowSender<PageToRelay>,
    request_id: String,
    request: LiteRequest,
    signal: Option<AbortSignal>,
    headers_timeout: Duration,
    url: String,
) -> Result<Response, BridgeError> {
    if signal.as_ref().map(AbortSignal::is_aborted).unwrap_or(false) {
        return Err(BridgeError::Aborted);
    }

    let (page_port, relay_port) = port_pair::<StreamCommand, StreamEvent>(PORT_BUFFER);
    window.post(PageToRelay::StreamOpen { port: relay_port })?;
    let (commands, mut events) = page_port.split();
    commands
        .send(StreamCommand::Start {
            request_id: request_id.clone(),
            request,
        })
        .await?;

    let aborter = Arc::new(StreamAborter::new(request_id.clone(), commands));

    let head = tokio::select! {
        event = events.recv() => event,
        _ = tokio::time::sleep(headers_timeout) => {
            aborter.abort();
            return Err(BridgeError::timeout("stream headers", headers_timeout.as_millis() as u64));
        }
        _ = wait_aborted(signal.as_ref()) => {
            aborter.abort();
            return Err(BridgeError::Aborted);
        }
    };

    let (status, status_text, headers) = match head {
        Some(StreamEvent::Headers {
            status,
            status_text,
            headers,
        }) => (status, status_text, headers),
        Some(StreamEvent::Error { error }) => {
            aborter.finish();
            return Err(error);
        }
        Some(other) => {
            aborter.abort();
            return Err(BridgeError::protocol(format!("expected stream headers, got {:?}", other)));
        }
        None => {
            aborter.finish();
            return Err(BridgeError::unreachable("stream port closed before headers"));
        }
    };
    debug!("[{}] stream headers: {}", request_id, status);

    let (body_tx, body_rx) = mpsc::channel(PORT_BUFFER);
    tokio::spawn(pump(events, body_tx, aborter.clone(), signal));

    let body = ResponseStream::new(ReceiverStream::new(body_rx).boxed(), Some(aborter));
    Ok(Response::streaming(status, status_text, headers, url, body))
}

async fn pump(
    mut events: PortReceiver<StreamEvent>,
    body: mpsc::Sender<Result<Bytes, BridgeError>>,
    aborter: Arc<StreamAborter>,
    signal: Option<AbortSignal>,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = aborter.token.cancelled() => return,
            _ = wait_aborted(signal.as_ref()) => {
                aborter.abort();
                let _ = body.send(Err(BridgeError::Aborted)).await;
                return;
            }
            event = events.recv() => event,
        };

        match event {
            Some(StreamEvent::Chunk { bytes }) => {
                let sent = tokio::select! {
                    _ = aborter.token.cancelled() => return,
                    sent = body.send(Ok(Bytes::from(bytes))) => sent,
                };
                if sent.is_err() {
                    // Reader dropped without cancelling
                    aborter.abort();
                    return;
                }
            }
            Some(StreamEvent::End) => {
                aborter.finish();
                return;
            }
            Some(StreamEvent::Error { error }) => {
                aborter.finish();
                let _ = body.send(Err(error)).await;
                return;
            }
            Some(StreamEvent::Headers { .. }) => {
                warn!("[{}] duplicate stream headers ignored", aborter.request_id);
            }
            None => {
                aborter.finish();
                let _ = body
                    .send(Err(BridgeError::unreachable("stream port closed before end")))
                    .await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::AbortController;
    use bridge_common::{window_pair, RelayToPage, WindowEndpoint};
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicUsize;

    /// Relay stand-in: answers with headers and one chunk, then counts aborts
    fn fake_relay(mut relay: WindowEndpoint<RelayToPage, PageToRelay>, aborts: Arc<AtomicUsize>) {
        tokio::spawn(async move {
            let Some(PageToRelay::StreamOpen { mut port }) = relay.receiver.recv().await else {
                return;
            };
            assert!(matches!(port.recv().await, Some(StreamCommand::Start { .. })));
            port.send(StreamEvent::Headers {
                status: 200,
                status_text: "OK".to_string(),
                headers: BTreeMap::new(),
            })
            .await
            .unwrap();
            port.send(StreamEvent::Chunk { bytes: b"data: 1\n\n".to_vec() }).await.unwrap();
            while let Some(command) = port.recv().await {
                if matches!(command, StreamCommand::Abort { .. }) {
                    aborts.fetch_add(1, Ordering::SeqCst);
                }
            }
        });
    }

    #[tokio::test]
    async fn test_abort_after_headers_sends_one_notice() {
        let (page, relay) = window_pair::<PageToRelay, RelayToPage>();
        let aborts = Arc::new(AtomicUsize::new(0));
        fake_relay(relay, aborts.clone());

        let controller = AbortController::new();
        let response = open_stream(
            &page.sender,
            "s1".to_string(),
            LiteRequest::new("https://api.test/sse"),
            Some(controller.signal()),
            Duration::from_secs(2),
            "https://api.test/sse".to_string(),
        )
        .await
        .unwrap();
        assert_eq!(response.status, 200);

        let mut body = response.into_stream();
        assert_eq!(body.next().await.unwrap().unwrap(), Bytes::from_static(b"data: 1\n\n"));

        controller.abort();
        assert_eq!(body.next().await, Some(Err(BridgeError::Aborted)));
        body.cancel();
        drop(body);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(aborts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_headers_timeout() {
        let (page, mut relay) = window_pair::<PageToRelay, RelayToPage>();
        let held = tokio::spawn(async move {
            let open = relay.receiver.recv().await;
            tokio::time::sleep(Duration::from_millis(200)).await;
            drop(open);
        });

        let err = open_stream(
            &page.sender,
            "s2".to_string(),
            LiteRequest::new("https://api.test/slow"),
            None,
            Duration::from_millis(20),
            String::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, BridgeError::Timeout { .. }));
        held.await.unwrap();
    }

    #[tokio::test]
    async fn test_error_before_headers_rejects() {
        let (page, mut relay) = window_pair::<PageToRelay, RelayToPage>();
        tokio::spawn(async move {
            if let Some(PageToRelay::StreamOpen { mut port }) = relay.receiver.recv().await {
                let _ = port.recv().await;
                let _ = port
                    .send(StreamEvent::Error {
                        error: BridgeError::DomainDisabled {
                            origin: "http://x".to_string(),
                        },
                    })
                    .await;
            }
        });

        let err = open_stream(
            &page.sender,
            "s3".to_string(),
            LiteRequest::new("https://api.test/"),
            None,
            Duration::from_secs(1),
            String::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, BridgeError::DomainDisabled { .. }));
    }
}
