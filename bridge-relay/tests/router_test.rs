use async_trait::async_trait;
use bridge_common::constants::PORT_BUFFER;
use bridge_common::{
    port_pair, BridgeError, BridgeStatus, DomainSource, FetchEnvelope, LiteRequest, PageCall, PageToRelay, Port,
    RelayToPage, RuntimeChannel, RuntimeMessage, RuntimeReply, SenderInfo, SocketCommand, SocketEvent, StreamCommand,
    StreamEvent,
};
use bridge_relay::{spawn_relay, RelayRouter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Scripted engine that records what it receives
#[derive(Default)]
struct FakeRuntime {
    enabled: AtomicBool,
    unreachable: bool,
    seen: Mutex<Vec<(SenderInfo, RuntimeMessage)>>,
    stream_ports: Mutex<Vec<Port<StreamEvent, StreamCommand>>>,
    socket_ports: Mutex<Vec<Port<SocketEvent, SocketCommand>>>,
}

impl FakeRuntime {
    fn enabled() -> Arc<Self> {
        Arc::new(Self {
            enabled: AtomicBool::new(true),
            ..Default::default()
        })
    }

    fn disabled() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn seen(&self) -> Vec<RuntimeMessage> {
        self.seen.lock().unwrap().iter().map(|(_, m)| m.clone()).collect()
    }

    fn status(&self, meta_enabled: bool) -> BridgeStatus {
        let enabled = self.enabled.load(Ordering::SeqCst);
        let domain_enabled = enabled || meta_enabled;
        BridgeStatus {
            installed: true,
            version: "test".to_string(),
            domain_enabled,
            domain_source: if enabled {
                DomainSource::Default
            } else if meta_enabled {
                DomainSource::Meta
            } else {
                DomainSource::None
            },
            origin_allowed: enabled,
            has_api_keys: false,
            ready: domain_enabled,
            reason: None,
        }
    }
}

#[async_trait]
impl RuntimeChannel for FakeRuntime {
    async fn send_message(&self, sender: &SenderInfo, message: RuntimeMessage) -> Result<RuntimeReply, BridgeError> {
        if self.unreachable {
            return Err(BridgeError::unreachable("extension reloaded"));
        }
        self.seen.lock().unwrap().push((sender.clone(), message.clone()));
        Ok(match message {
            RuntimeMessage::GetStatus { meta_enabled } => RuntimeReply::Status(self.status(meta_enabled)),
            RuntimeMessage::KeyCheck { .. } => RuntimeReply::KeyCheck { is_set: true },
            RuntimeMessage::KeysList => RuntimeReply::KeysList { keys: vec![] },
            RuntimeMessage::Fetch { .. } => RuntimeReply::Fetch(FetchEnvelope::failure(BridgeError::upstream(None, "fake"))),
            RuntimeMessage::FetchAbort { .. } => RuntimeReply::Ack,
            RuntimeMessage::Google(_) => RuntimeReply::Ack,
        })
    }

    async fn connect_stream(&self, _sender: &SenderInfo) -> Result<Port<StreamCommand, StreamEvent>, BridgeError> {
        let (relay_side, engine_side) = port_pair(PORT_BUFFER);
        self.stream_ports.lock().unwrap().push(engine_side);
        Ok(relay_side)
    }

    async fn connect_socket(&self, _sender: &SenderInfo) -> Result<Port<SocketCommand, SocketEvent>, BridgeError> {
        let (relay_side, engine_side) = port_pair(PORT_BUFFER);
        self.socket_ports.lock().unwrap().push(engine_side);
        Ok(relay_side)
    }
}

const ORIGIN: &str = "http://localhost:5173";

async fn call(window: &mut bridge_common::WindowEndpoint<PageToRelay, RelayToPage>, call: PageCall) -> RuntimeReply {
    window
        .sender
        .post(PageToRelay::Request {
            request_id: "r1".to_string(),
            call,
        })
        .unwrap();
    let RelayToPage::Reply { request_id, reply } = tokio::time::timeout(Duration::from_secs(2), window.receiver.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(request_id, "r1");
    reply
}

#[tokio::test]
async fn test_messages_carry_page_origin() {
    let runtime = FakeRuntime::enabled();
    let mut window = spawn_relay(runtime.clone(), ORIGIN, "<html></html>");

    let reply = call(&mut window, PageCall::KeyCheck { key_name: "K".to_string() }).await;
    assert_eq!(reply, RuntimeReply::KeyCheck { is_set: true });

    let seen = runtime.seen.lock().unwrap().clone();
    assert_eq!(seen[0].0.origin, ORIGIN);
}

#[tokio::test]
async fn test_fetch_refused_for_disabled_domain() {
    let runtime = FakeRuntime::disabled();
    let mut window = spawn_relay(runtime.clone(), ORIGIN, "");

    let reply = call(
        &mut window,
        PageCall::Fetch {
            request_id: "f1".to_string(),
            request: LiteRequest::new("https://api.openai.com/v1"),
        },
    )
    .await;
    let RuntimeReply::Fetch(envelope) = reply else { panic!("expected fetch envelope") };
    assert_eq!(
        envelope.error,
        Some(BridgeError::DomainDisabled {
            origin: ORIGIN.to_string()
        })
    );
    // Only the status lookup reached the engine
    assert!(runtime.seen().iter().all(|m| matches!(m, RuntimeMessage::GetStatus { .. })));
}

#[tokio::test]
async fn test_meta_signal_is_reported_to_engine() {
    let runtime = FakeRuntime::disabled();
    let mut window = spawn_relay(runtime.clone(), ORIGIN, r#"<meta name="bridge" content="enabled">"#);

    let reply = call(&mut window, PageCall::Status).await;
    let RuntimeReply::Status(status) = reply else { panic!("expected status") };
    assert!(status.domain_enabled);
    assert_eq!(status.domain_source, DomainSource::Meta);
    assert_eq!(runtime.seen(), vec![RuntimeMessage::GetStatus { meta_enabled: true }]);
}

#[tokio::test]
async fn test_unreachable_engine_reported_as_error() {
    let runtime = Arc::new(FakeRuntime {
        unreachable: true,
        ..Default::default()
    });
    let router = RelayRouter::new(runtime, SenderInfo::new(ORIGIN), false);
    let reply = router.handle_call(PageCall::Status).await;
    assert!(matches!(reply, RuntimeReply::Error(BridgeError::RelayUnreachable { .. })));
}

#[tokio::test]
async fn test_status_cache_respects_ttl() {
    let runtime = FakeRuntime::enabled();
    let router = RelayRouter::new(runtime.clone(), SenderInfo::new(ORIGIN), false).with_status_ttl(Duration::from_secs(60));
    router.status(false).await.unwrap();
    router.status(false).await.unwrap();
    assert_eq!(runtime.seen().len(), 1);
    router.status(true).await.unwrap();
    assert_eq!(runtime.seen().len(), 2);
}

#[tokio::test]
async fn test_fetch_sees_domain_disabled_after_cached_status() {
    let runtime = FakeRuntime::enabled();
    let router = RelayRouter::new(runtime.clone(), SenderInfo::new(ORIGIN), false).with_status_ttl(Duration::from_secs(60));
    assert!(router.status(false).await.unwrap().domain_enabled);

    runtime.enabled.store(false, Ordering::SeqCst);
    // Cached copy still says enabled
    assert!(router.status(false).await.unwrap().domain_enabled);

    let reply = router
        .handle_call(PageCall::Fetch {
            request_id: "f2".to_string(),
            request: LiteRequest::new("https://api.openai.com/v1"),
        })
        .await;
    let RuntimeReply::Fetch(envelope) = reply else { panic!("expected fetch envelope") };
    assert_eq!(
        envelope.error,
        Some(BridgeError::DomainDisabled {
            origin: ORIGIN.to_string()
        })
    );
    assert!(!runtime.seen().iter().any(|m| matches!(m, RuntimeMessage::Fetch { .. })));
    // The refresh also replaced the cached copy
    assert!(!router.status(false).await.unwrap().domain_enabled);
}

#[tokio::test]
async fn test_abort_is_forwarded() {
    let runtime = FakeRuntime::enabled();
    let window = spawn_relay(runtime.clone(), ORIGIN, "");
    window
        .sender
        .post(PageToRelay::FetchAbort {
            request_id: "f9".to_string(),
        })
        .unwrap();

    for _ in 0..50 {
        if !runtime.seen().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(runtime.seen(), vec![RuntimeMessage::FetchAbort { request_id: "f9".to_string() }]);
}

#[tokio::test]
async fn test_stream_is_piped_both_ways() {
    let runtime = FakeRuntime::enabled();
    let window = spawn_relay(runtime.clone(), ORIGIN, "");

    let (mut page_port, relay_port) = port_pair::<StreamCommand, StreamEvent>(PORT_BUFFER);
    window.sender.post(PageToRelay::StreamOpen { port: relay_port }).unwrap();
    page_port
        .send(StreamCommand::Start {
            request_id: "s1".to_string(),
            request: LiteRequest::new("https://api.openai.com/v1"),
        })
        .await
        .unwrap();

    let mut engine_port = loop {
        if let Some(port) = runtime.stream_ports.lock().unwrap().pop() {
            break port;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };
    assert!(matches!(engine_port.recv().await, Some(StreamCommand::Start { .. })));

    engine_port.send(StreamEvent::Chunk { bytes: b"hi".to_vec() }).await.unwrap();
    assert_eq!(page_port.recv().await, Some(StreamEvent::Chunk { bytes: b"hi".to_vec() }));

    page_port
        .send(StreamCommand::Abort {
            request_id: "s1".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(
        engine_port.recv().await,
        Some(StreamCommand::Abort {
            request_id: "s1".to_string()
        })
    );

    // Page going away releases the engine port
    drop(page_port);
    assert_eq!(tokio::time::timeout(Duration::from_secs(2), engine_port.recv()).await.unwrap(), None);
}

#[tokio::test]
async fn test_socket_connect_refused_when_disabled() {
    let runtime = FakeRuntime::disabled();
    let window = spawn_relay(runtime.clone(), ORIGIN, "");

    let (mut page_port, relay_port) = port_pair::<SocketCommand, SocketEvent>(PORT_BUFFER);
    window.sender.post(PageToRelay::SocketAttach { port: relay_port }).unwrap();
    page_port
        .send(SocketCommand::Connect {
            socket_id: "w1".to_string(),
            url: "wss://example.test/".to_string(),
            protocols: vec![],
        })
        .await
        .unwrap();

    assert!(matches!(page_port.recv().await, Some(SocketEvent::Error { .. })));
    match page_port.recv().await {
        Some(SocketEvent::Closed { socket_id, code, .. }) => {
            assert_eq!(socket_id, "w1");
            assert_eq!(code, 1006);
        }
        other => panic!("unexpected {:?}", other),
    }
}
