use axum::body::Body;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bridge_common::{
    LiteRequest, ResponseBody, RuntimeChannel, RuntimeMessage, RuntimeReply, SenderInfo, StreamCommand, StreamEvent,
};
use bridge_engine::{BridgeSettings, Engine, EngineConfig, EngineHandle, InjectionRule, MemorySettingsStore};
use bridge_host::{HostClient, HostServer};
use futures::StreamExt;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

async fn echo_auth(headers: HeaderMap) -> String {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("<none>")
        .to_string()
}

async fn sse() -> Response {
    let events = futures::stream::iter(0..3).then(|i| async move {
        tokio::time::sleep(Duration::from_millis(5)).await;
        Ok::<_, Infallible>(format!("data: {}\n\n", i))
    });
    ([("content-type", "text/event-stream")], Body::from_stream(events)).into_response()
}

async fn endless() -> Response {
    let chunks = futures::stream::repeat(()).then(|_| async {
        tokio::time::sleep(Duration::from_millis(1)).await;
        Ok::<_, Infallible>(vec![b'x'; 8 * 1024])
    });
    ([("content-type", "text/plain")], Body::from_stream(chunks)).into_response()
}

async fn spawn_upstream() -> String {
    let app = Router::new()
        .route("/auth", get(echo_auth))
        .route("/sse", get(sse))
        .route("/endless", get(endless));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("127.0.0.1:{}", addr.port())
}

async fn engine() -> EngineHandle {
    let mut settings = BridgeSettings::default();
    settings.allowed_destinations.push("127.0.0.1".to_string());
    settings
        .injection_rules
        .push(InjectionRule::header("127.0.0.1", "Authorization", "Bearer ${TEST_KEY}"));
    settings.env.insert("TEST_KEY".to_string(), "sk-host".to_string());
    let store = Arc::new(MemorySettingsStore::new(settings));
    EngineHandle::new(Engine::new(EngineConfig::default(), store).await.unwrap())
}

/// Host server and client joined by an in-memory pipe
async fn connected(forward_logs: bool) -> HostClient {
    let server = HostServer::new(engine().await).with_log_forwarding(forward_logs);
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let (server_read, server_write) = tokio::io::split(server_io);
    tokio::spawn(async move {
        let _ = server.serve(server_read, server_write).await;
    });
    let (client_read, client_write) = tokio::io::split(client_io);
    HostClient::connect(client_read, client_write)
}

fn page() -> SenderInfo {
    SenderInfo::new("http://localhost:5173")
}

#[tokio::test]
async fn test_status_over_host() {
    let client = connected(false).await;
    let reply = client
        .send_message(&page(), RuntimeMessage::GetStatus { meta_enabled: false })
        .await
        .unwrap();
    let RuntimeReply::Status(status) = reply else { panic!("expected status") };
    assert!(status.installed);
    assert!(status.origin_allowed);
}

#[tokio::test]
async fn test_fetch_over_host_injects_secret() {
    let host = spawn_upstream().await;
    let client = connected(true).await;
    let mut logs = client.subscribe_logs();

    let reply = client
        .send_message(
            &page(),
            RuntimeMessage::Fetch {
                request_id: "h1".to_string(),
                request: LiteRequest::new(format!("http://{}/auth", host)),
            },
        )
        .await
        .unwrap();
    let RuntimeReply::Fetch(envelope) = reply else { panic!("expected fetch reply") };
    let record = envelope.into_result().unwrap();
    assert_eq!(record.body, ResponseBody::BodyText("Bearer sk-host".to_string()));

    // Started, then updated once the response is in
    let started = tokio::time::timeout(Duration::from_secs(2), logs.recv()).await.unwrap().unwrap();
    assert_eq!(started.request_id, "h1");
    let finished = tokio::time::timeout(Duration::from_secs(2), logs.recv()).await.unwrap().unwrap();
    assert_eq!(finished.id, started.id);
    assert_eq!(finished.status, Some(200));
}

#[tokio::test]
async fn test_stream_over_host() {
    let host = spawn_upstream().await;
    let client = connected(false).await;

    let mut port = client.connect_stream(&page()).await.unwrap();
    port.send(StreamCommand::Start {
        request_id: "s1".to_string(),
        request: LiteRequest::new(format!("http://{}/sse", host)),
    })
    .await
    .unwrap();

    let mut body = Vec::new();
    let mut saw_headers = false;
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), port.recv()).await.unwrap();
        match event {
            Some(StreamEvent::Headers { status, .. }) => {
                assert_eq!(status, 200);
                saw_headers = true;
            }
            Some(StreamEvent::Chunk { bytes }) => body.extend(bytes),
            Some(StreamEvent::End) => break,
            other => panic!("unexpected {:?}", other),
        }
    }
    assert!(saw_headers);
    assert_eq!(String::from_utf8(body).unwrap(), "data: 0\n\ndata: 1\n\ndata: 2\n\n");
}

#[tokio::test]
async fn test_unread_stream_does_not_stall_replies() {
    let host = spawn_upstream().await;
    let client = connected(false).await;

    let port = client.connect_stream(&page()).await.unwrap();
    port.send(StreamCommand::Start {
        request_id: "idle".to_string(),
        request: LiteRequest::new(format!("http://{}/endless", host)),
    })
    .await
    .unwrap();
    // Far more than the port and pipe buffers hold
    tokio::time::sleep(Duration::from_millis(500)).await;

    for _ in 0..3 {
        let reply = tokio::time::timeout(
            Duration::from_secs(2),
            client.send_message(&page(), RuntimeMessage::GetStatus { meta_enabled: false }),
        )
        .await
        .expect("reply stuck behind unread stream")
        .unwrap();
        assert!(matches!(reply, RuntimeReply::Status(_)));
    }
    drop(port);
}

#[tokio::test]
async fn test_calls_fail_once_host_is_gone() {
    let (client_io, server_io) = tokio::io::duplex(1024);
    let (client_read, client_write) = tokio::io::split(client_io);
    let client = HostClient::connect(client_read, client_write);
    drop(server_io);

    let result = client
        .send_message(&page(), RuntimeMessage::GetStatus { meta_enabled: false })
        .await;
    assert!(matches!(result, Err(bridge_common::BridgeError::RelayUnreachable { .. })));
}
