//! Integration tests for end-to-end WebSocket collaboration.
//!
//! These tests start a real server and connect real clients (or raw
//! sockets speaking the frame protocol), verifying the full pipeline.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tandem_collab::auth::{AccessGrant, DocumentScope, Permissions, StaticTokenAuthenticator};
use tandem_collab::client::{ClientState, SyncClient, SyncEvent};
use tandem_collab::config::ServerConfig;
use tandem_collab::protocol::{AuthRequest, ErrorCode, Frame};
use tandem_collab::server::{ShutdownHandle, SyncServer};
use tandem_collab::session::SessionManager;
use tandem_collab::storage::MemoryStore;
use tandem_core::{DocumentEngine, DocumentId, LocalOp};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type RawSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    url: String,
    manager: Arc<SessionManager>,
    shutdown: ShutdownHandle,
}

/// Start a server on a free port.
async fn start_test_server() -> TestServer {
    let auth = StaticTokenAuthenticator::new()
        .with_token(
            "t-alice",
            AccessGrant::new("alice", Permissions::read_write(DocumentScope::All)),
        )
        .with_token(
            "t-bob",
            AccessGrant::new("bob", Permissions::read_write(DocumentScope::All)),
        )
        .with_token(
            "t-viewer",
            AccessGrant::new("vic", Permissions::read_only(DocumentScope::All)),
        );
    let manager = Arc::new(SessionManager::new(
        ServerConfig::for_testing(),
        Arc::new(auth),
        Arc::new(MemoryStore::new()),
    ));
    let server = SyncServer::bind(manager.clone()).await.unwrap();
    let url = format!("ws://{}", server.local_addr().unwrap());
    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    TestServer {
        url,
        manager,
        shutdown,
    }
}

fn doc1() -> DocumentId {
    DocumentId::new("acme", "doc1").unwrap()
}

fn auth_request(user: &str, token: &str) -> AuthRequest {
    AuthRequest {
        document_id: doc1(),
        user_id: user.into(),
        token: token.into(),
    }
}

async fn wait_for<F>(events: &mut mpsc::Receiver<SyncEvent>, mut pred: F) -> SyncEvent
where
    F: FnMut(&SyncEvent) -> bool,
{
    loop {
        let event = timeout(Duration::from_secs(3), events.recv())
            .await
            .expect("event within timeout")
            .expect("event channel open");
        if pred(&event) {
            return event;
        }
    }
}

/// Connected client that has finished the handshake.
async fn live_client(url: &str, user: &str, token: &str) -> (SyncClient, mpsc::Receiver<SyncEvent>) {
    let mut client = SyncClient::new(url, auth_request(user, token)).unwrap();
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    wait_for(&mut events, |e| *e == SyncEvent::Live).await;
    (client, events)
}

async fn raw_connect(url: &str) -> RawSocket {
    let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    ws
}

async fn raw_send(ws: &mut RawSocket, frame: &Frame) {
    ws.send(Message::Binary(frame.encode().unwrap().into()))
        .await
        .unwrap();
}

/// Next frame, or `None` once the server closed the socket.
async fn raw_recv(ws: &mut RawSocket) -> Option<Frame> {
    loop {
        let msg = timeout(Duration::from_secs(3), ws.next())
            .await
            .expect("frame within timeout")?;
        match msg {
            Ok(Message::Binary(data)) => {
                let bytes: Vec<u8> = data.into();
                return Some(Frame::decode(&bytes).unwrap());
            }
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
}

/// Raw socket through auth and both halves of the sync handshake,
/// positioned after the server's sync-step-2.
async fn raw_live(url: &str, user: &str, token: &str) -> RawSocket {
    let mut ws = raw_connect(url).await;
    raw_send(&mut ws, &Frame::Auth(auth_request(user, token))).await;
    assert!(matches!(raw_recv(&mut ws).await, Some(Frame::Welcome(_))));
    let empty = DocumentEngine::new(doc1()).unwrap();
    raw_send(&mut ws, &Frame::SyncStep1(empty.state_vector())).await;
    loop {
        match raw_recv(&mut ws).await {
            // Writable sessions are asked for their state too.
            Some(Frame::SyncStep1(state_vector)) => {
                let diff = empty.encode_update_since(&state_vector).unwrap();
                raw_send(&mut ws, &Frame::SyncStep2(diff)).await;
            }
            Some(Frame::SyncStep2(_)) => return ws,
            Some(_) => {}
            None => panic!("connection closed during handshake"),
        }
    }
}

/// Poll the server's text until it matches.
async fn wait_for_server_text(manager: &SessionManager, expected: &str) {
    let mut text = String::new();
    for _ in 0..100 {
        text = manager.text(&doc1()).await.unwrap();
        if text == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("server text is {text:?}, expected {expected:?}");
}

// ─── Client handshake & sync ──────────────────────────────────────────────────

#[tokio::test]
async fn test_client_connects_and_goes_live() {
    let server = start_test_server().await;
    let (client, _events) = live_client(&server.url, "alice", "t-alice").await;

    assert_eq!(client.state().await, ClientState::Live);
    let session = client.session().await.expect("welcomed");
    assert_eq!(session.user_id, "alice");
    assert_eq!(server.manager.session_count(&doc1()).await, 1);
}

#[tokio::test]
async fn test_edits_propagate_between_clients() {
    let server = start_test_server().await;
    let (alice, _alice_events) = live_client(&server.url, "alice", "t-alice").await;
    let (bob, mut bob_events) = live_client(&server.url, "bob", "t-bob").await;

    alice.apply_local(&LocalOp::insert(0, "hello")).await.unwrap();
    wait_for(&mut bob_events, |e| matches!(e, SyncEvent::RemoteUpdate(_))).await;

    assert_eq!(bob.text().await, "hello");
    assert_eq!(server.manager.text(&doc1()).await.unwrap(), "hello");
}

#[tokio::test]
async fn test_late_joiner_receives_existing_content() {
    let server = start_test_server().await;
    server
        .manager
        .apply_local(&doc1(), &LocalOp::insert(0, "already here"))
        .await
        .unwrap();

    let (bob, _events) = live_client(&server.url, "bob", "t-bob").await;
    assert_eq!(bob.text().await, "already here");
}

#[tokio::test]
async fn test_offline_edits_replayed_when_live() {
    let server = start_test_server().await;

    let mut client = SyncClient::new(&server.url, auth_request("alice", "t-alice")).unwrap();
    let mut events = client.take_event_rx().unwrap();
    client.apply_local(&LocalOp::insert(0, "written offline")).await.unwrap();
    assert_eq!(client.offline_queue_len().await, 1);

    client.connect().await.unwrap();
    wait_for(&mut events, |e| *e == SyncEvent::Live).await;
    assert_eq!(client.offline_queue_len().await, 0);

    wait_for_server_text(&server.manager, "written offline").await;
}

#[tokio::test]
async fn test_restored_replica_uploads_state_server_lacks() {
    let server = start_test_server().await;
    let (bob, mut bob_events) = live_client(&server.url, "bob", "t-bob").await;

    // Edited in an earlier session and kept only in local storage.
    let mut restored = DocumentEngine::with_client_id(doc1(), 77).unwrap();
    restored.apply_local(&LocalOp::insert(0, "restored")).unwrap();

    let mut alice =
        SyncClient::with_replica(&server.url, auth_request("alice", "t-alice"), restored);
    let mut events = alice.take_event_rx().unwrap();
    alice.connect().await.unwrap();
    wait_for(&mut events, |e| *e == SyncEvent::Live).await;
    wait_for_server_text(&server.manager, "restored").await;

    // Later edits build on the uploaded items and merge on the server.
    alice.apply_local(&LocalOp::insert(8, "!")).await.unwrap();
    wait_for_server_text(&server.manager, "restored!").await;
    assert_eq!(alice.text().await, "restored!");

    // Other sessions receive the uploaded state as well.
    for _ in 0..100 {
        if bob.text().await == "restored!" {
            break;
        }
        wait_for(&mut bob_events, |e| matches!(e, SyncEvent::RemoteUpdate(_))).await;
    }
    assert_eq!(bob.text().await, "restored!");
}

// ─── Peers & presence ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_peer_join_and_leave_events() {
    let server = start_test_server().await;
    let (_alice, mut alice_events) = live_client(&server.url, "alice", "t-alice").await;
    let (mut bob, _bob_events) = live_client(&server.url, "bob", "t-bob").await;
    let bob_session = bob.session().await.unwrap().session_id;

    let joined = wait_for(&mut alice_events, |e| matches!(e, SyncEvent::PeerJoined(_))).await;
    assert!(matches!(joined, SyncEvent::PeerJoined(p) if p.user_id == "bob"));

    bob.disconnect().await;
    let left = wait_for(&mut alice_events, |e| matches!(e, SyncEvent::PeerLeft(_))).await;
    assert_eq!(left, SyncEvent::PeerLeft(bob_session));
}

#[tokio::test]
async fn test_presence_fan_out() {
    let server = start_test_server().await;
    let (alice, _alice_events) = live_client(&server.url, "alice", "t-alice").await;
    let (_bob, mut bob_events) = live_client(&server.url, "bob", "t-bob").await;
    let alice_session = alice.session().await.unwrap().session_id;

    alice
        .set_presence(serde_json::json!({"cursor": 4, "name": "Alice"}))
        .await
        .unwrap();

    let event = wait_for(&mut bob_events, |e| matches!(e, SyncEvent::Presence(_))).await;
    match event {
        SyncEvent::Presence(update) => {
            assert_eq!(update.client_id, alice_session);
            assert_eq!(update.state["cursor"], 4);
        }
        other => panic!("expected presence, got {other:?}"),
    }
    // Presence never touches content.
    assert_eq!(server.manager.load(&doc1()).await.unwrap().version, 0);
}

#[tokio::test]
async fn test_existing_presence_replayed_to_joiner() {
    let server = start_test_server().await;
    let (alice, _alice_events) = live_client(&server.url, "alice", "t-alice").await;
    alice.set_presence(serde_json::json!({"cursor": 9})).await.unwrap();
    for _ in 0..50 {
        if !server.manager.presence_snapshot(&doc1()).await.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let mut bob = SyncClient::new(&server.url, auth_request("bob", "t-bob")).unwrap();
    let mut events = bob.take_event_rx().unwrap();
    bob.connect().await.unwrap();
    let event = wait_for(&mut events, |e| matches!(e, SyncEvent::Presence(_))).await;
    assert!(matches!(event, SyncEvent::Presence(u) if u.state["cursor"] == 9));
}

// ─── Rejections ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_invalid_token_rejected() {
    let server = start_test_server().await;
    let mut ws = raw_connect(&server.url).await;
    raw_send(&mut ws, &Frame::Auth(auth_request("alice", "wrong"))).await;

    match raw_recv(&mut ws).await {
        Some(Frame::Error { code, .. }) => assert_eq!(code, ErrorCode::Unauthorized),
        other => panic!("expected error frame, got {other:?}"),
    }
    assert!(raw_recv(&mut ws).await.is_none(), "connection must close");
    assert_eq!(server.manager.session_count(&doc1()).await, 0);
}

#[tokio::test]
async fn test_first_frame_must_be_auth() {
    let server = start_test_server().await;
    let mut ws = raw_connect(&server.url).await;
    raw_send(&mut ws, &Frame::SyncStep1(Vec::new())).await;

    match raw_recv(&mut ws).await {
        Some(Frame::Error { code, .. }) => assert_eq!(code, ErrorCode::ProtocolViolation),
        other => panic!("expected error frame, got {other:?}"),
    }
    assert!(raw_recv(&mut ws).await.is_none());
}

#[tokio::test]
async fn test_auth_timeout() {
    let server = start_test_server().await;
    let mut ws = raw_connect(&server.url).await;

    match raw_recv(&mut ws).await {
        Some(Frame::Error { code, .. }) => assert_eq!(code, ErrorCode::AuthTimeout),
        other => panic!("expected auth timeout, got {other:?}"),
    }
    assert!(raw_recv(&mut ws).await.is_none());
}

#[tokio::test]
async fn test_malformed_budget_closes_connection() {
    let server = start_test_server().await;
    let mut ws = raw_live(&server.url, "alice", "t-alice").await;
    let budget = server.manager.config().max_malformed_per_session;

    for _ in 0..budget - 1 {
        raw_send(&mut ws, &Frame::Update(vec![0xFF, 0xFF, 0xFF])).await;
        match raw_recv(&mut ws).await {
            Some(Frame::Error { code, .. }) => assert_eq!(code, ErrorCode::MalformedOperation),
            other => panic!("expected malformed error, got {other:?}"),
        }
    }
    // Still usable below the budget.
    raw_send(&mut ws, &Frame::Ping).await;
    assert_eq!(raw_recv(&mut ws).await, Some(Frame::Pong));

    raw_send(&mut ws, &Frame::Update(vec![0xFF, 0xFF, 0xFF])).await;
    assert!(matches!(
        raw_recv(&mut ws).await,
        Some(Frame::Error { code: ErrorCode::MalformedOperation, .. })
    ));
    assert!(matches!(
        raw_recv(&mut ws).await,
        Some(Frame::Error { code: ErrorCode::ProtocolViolation, .. })
    ));
    assert!(raw_recv(&mut ws).await.is_none());
    assert_eq!(server.manager.text(&doc1()).await.unwrap(), "");
}

#[tokio::test]
async fn test_read_only_session_cannot_edit() {
    let server = start_test_server().await;
    let mut ws = raw_live(&server.url, "vic", "t-viewer").await;

    let mut replica = DocumentEngine::new(doc1()).unwrap();
    let update = replica.apply_local(&LocalOp::insert(0, "sneaky")).unwrap();
    raw_send(&mut ws, &Frame::Update(update)).await;

    match raw_recv(&mut ws).await {
        Some(Frame::Error { code, .. }) => assert_eq!(code, ErrorCode::ReadOnly),
        other => panic!("expected read-only error, got {other:?}"),
    }
    assert_eq!(server.manager.text(&doc1()).await.unwrap(), "");
}

#[tokio::test]
async fn test_shutdown_closes_connections() {
    let server = start_test_server().await;
    let mut ws = raw_live(&server.url, "alice", "t-alice").await;

    server.shutdown.shutdown();
    assert!(raw_recv(&mut ws).await.is_none());

    for _ in 0..50 {
        if server.manager.session_count(&doc1()).await == 0
            && server.manager.stats().await.connections_active == 0
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(server.manager.session_count(&doc1()).await, 0);
    assert_eq!(server.manager.stats().await.connections_active, 0);
}
