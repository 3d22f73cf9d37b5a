//! WebSocket sync client.
//!
//! Provides:
//! - Connection lifecycle (auth, sync handshake, live)
//! - A local replica kept in step with the server
//! - Presence updates
//! - Offline queue for edits made while not live
//!
//! ```text
//! connect ──► auth ──► welcome ──► sync-step-1 (replica SV)
//!                         │            │
//!                         │            └──► sync-step-2 ◄── apply, go live, replay queue
//!                         └──► server sync-step-1 ──► sync-step-2 (replica delta)
//! ```
//!
//! Answering the server's sync-step-1 uploads everything the replica holds
//! that the server lacks: edits from a replica restored from local storage,
//! or updates lost in flight when the previous connection dropped.

use std::collections::VecDeque;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tandem_core::{DocumentEngine, DocumentId, EngineError, LocalOp};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::protocol::{AuthRequest, AwarenessUpdate, ErrorCode, Frame, PeerInfo, ProtocolError};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    /// Authenticated, waiting for sync-step-2
    Syncing,
    Live,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Handshake finished; the replica matches the server.
    Live,
    /// A remote update changed the replica.
    RemoteUpdate(Vec<u8>),
    /// Another session's presence changed.
    Presence(AwarenessUpdate),
    PeerJoined(PeerInfo),
    PeerLeft(Uuid),
    /// The server rejected something.
    Error { code: ErrorCode, message: String },
    /// Connection lost or closed.
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("offline queue is full ({0} updates)")]
    QueueFull(usize),
    #[error("not attached to a session")]
    NotAttached,
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Offline queue for edits made while disconnected.
///
/// Queued updates are replayed once the client is live again.
#[derive(Debug)]
pub struct OfflineQueue {
    queue: VecDeque<Vec<u8>>,
    max_size: usize,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue an update. Returns `false` when full.
    pub fn enqueue(&mut self, update: Vec<u8>) -> bool {
        if self.is_full() {
            return false;
        }
        self.queue.push_back(update);
        true
    }

    pub fn drain(&mut self) -> Vec<Vec<u8>> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.queue.len() >= self.max_size
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Total bytes queued.
    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(Vec::len).sum()
    }
}

/// Everything the reader task shares with the client handle.
#[derive(Clone)]
struct Shared {
    replica: Arc<Mutex<DocumentEngine>>,
    state: Arc<RwLock<ClientState>>,
    session: Arc<RwLock<Option<PeerInfo>>>,
    offline_queue: Arc<Mutex<OfflineQueue>>,
    event_tx: mpsc::Sender<SyncEvent>,
}

/// The sync client.
pub struct SyncClient {
    request: AuthRequest,
    server_url: String,
    shared: Shared,
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
}

impl SyncClient {
    pub fn new(server_url: impl Into<String>, request: AuthRequest) -> Result<Self, ClientError> {
        let replica = DocumentEngine::new(request.document_id.clone())?;
        Ok(Self::with_replica(server_url, request, replica))
    }

    /// Use an existing replica, e.g. one restored from local storage.
    pub fn with_replica(
        server_url: impl Into<String>,
        request: AuthRequest,
        replica: DocumentEngine,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            request,
            server_url: server_url.into(),
            shared: Shared {
                replica: Arc::new(Mutex::new(replica)),
                state: Arc::new(RwLock::new(ClientState::Disconnected)),
                session: Arc::new(RwLock::new(None)),
                offline_queue: Arc::new(Mutex::new(OfflineQueue::new(10_000))),
                event_tx,
            },
            outgoing_tx: None,
            event_rx: Some(event_rx),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect, send `auth` and start the reader/writer tasks. The
    /// handshake continues in the background; wait for [`SyncEvent::Live`].
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        *self.shared.state.write().await = ClientState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(self.server_url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                *self.shared.state.write().await = ClientState::Disconnected;
                return Err(ClientError::Connect(e.to_string()));
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    return;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        out_tx
            .send(Frame::Auth(self.request.clone()).encode()?)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;
        // The reader only holds a weak sender so that `disconnect` closes the writer.
        let weak_tx = out_tx.downgrade();
        self.outgoing_tx = Some(out_tx);

        // Reader task: drive the handshake and process incoming frames
        let shared = self.shared.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let Some(out_tx) = weak_tx.upgrade() else { break };
                        let bytes: Vec<u8> = data.into();
                        match Frame::decode(&bytes) {
                            Ok(frame) => {
                                if let Err(e) = shared.handle_frame(frame, &out_tx).await {
                                    log::warn!("Client frame handling failed: {e}");
                                }
                            }
                            Err(e) => log::warn!("Undecodable frame from server: {e}"),
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            *shared.session.write().await = None;
            *shared.state.write().await = ClientState::Disconnected;
            let _ = shared.event_tx.send(SyncEvent::Closed).await;
        });

        Ok(())
    }

    /// Close the connection. Later edits go to the offline queue.
    pub async fn disconnect(&mut self) {
        self.outgoing_tx = None;
        *self.shared.state.write().await = ClientState::Disconnected;
    }

    /// Apply an edit to the replica and send it, or queue it when not live.
    pub async fn apply_local(&self, op: &LocalOp) -> Result<Vec<u8>, ClientError> {
        let mut replica = self.shared.replica.lock().await;
        let mut queue = self.shared.offline_queue.lock().await;
        let live = *self.shared.state.read().await == ClientState::Live;
        if !live && queue.is_full() {
            return Err(ClientError::QueueFull(queue.len()));
        }

        let update = replica.apply_local(op)?;
        drop(replica);

        match (&self.outgoing_tx, live) {
            (Some(tx), true) => {
                let encoded = Frame::Update(update.clone()).encode()?;
                if tx.send(encoded).await.is_err() {
                    queue.enqueue(update.clone());
                }
            }
            _ => {
                queue.enqueue(update.clone());
            }
        }
        Ok(update)
    }

    /// Publish this session's presence. Dropped silently when not live.
    pub async fn set_presence(&self, state: Value) -> Result<(), ClientError> {
        if *self.shared.state.read().await != ClientState::Live {
            return Ok(());
        }
        let session = self
            .shared
            .session
            .read()
            .await
            .as_ref()
            .map(|p| p.session_id)
            .ok_or(ClientError::NotAttached)?;
        let frame = Frame::Awareness(AwarenessUpdate {
            client_id: session,
            state,
        });
        self.send(frame.encode()?).await
    }

    pub async fn send_ping(&self) -> Result<(), ClientError> {
        self.send(Frame::Ping.encode()?).await
    }

    async fn send(&self, bytes: Vec<u8>) -> Result<(), ClientError> {
        let tx = self.outgoing_tx.as_ref().ok_or(ProtocolError::ConnectionClosed)?;
        tx.send(bytes)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;
        Ok(())
    }

    pub async fn state(&self) -> ClientState {
        *self.shared.state.read().await
    }

    /// Own session, once the server has welcomed us.
    pub async fn session(&self) -> Option<PeerInfo> {
        self.shared.session.read().await.clone()
    }

    /// Current text of the replica.
    pub async fn text(&self) -> String {
        self.shared.replica.lock().await.text()
    }

    pub async fn state_vector(&self) -> Vec<u8> {
        self.shared.replica.lock().await.state_vector()
    }

    pub fn document_id(&self) -> &DocumentId {
        &self.request.document_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub async fn offline_queue_len(&self) -> usize {
        self.shared.offline_queue.lock().await.len()
    }
}

impl Shared {
    async fn handle_frame(
        &self,
        frame: Frame,
        out_tx: &mpsc::Sender<Vec<u8>>,
    ) -> Result<(), ClientError> {
        let event = match frame {
            Frame::Welcome(peer) => {
                log::debug!("Welcomed as session {}", peer.session_id);
                *self.session.write().await = Some(peer);
                *self.state.write().await = ClientState::Syncing;
                let sv = self.replica.lock().await.state_vector();
                send(out_tx, &Frame::SyncStep1(sv)).await?;
                None
            }
            Frame::SyncStep2(update) => {
                let outcome = self.replica.lock().await.apply_remote(&update)?;
                if outcome.changed {
                    self.emit(SyncEvent::RemoteUpdate(update)).await;
                }
                let mut queue = self.offline_queue.lock().await;
                if *self.state.read().await == ClientState::Syncing {
                    *self.state.write().await = ClientState::Live;
                    let queued = queue.drain();
                    if !queued.is_empty() {
                        log::info!("Replaying {} queued updates", queued.len());
                    }
                    for update in queued {
                        send(out_tx, &Frame::Update(update)).await?;
                    }
                    drop(queue);
                    Some(SyncEvent::Live)
                } else {
                    None
                }
            }
            Frame::Update(update) => {
                let outcome = self.replica.lock().await.apply_remote(&update)?;
                outcome.changed.then_some(SyncEvent::RemoteUpdate(update))
            }
            Frame::Awareness(update) => Some(SyncEvent::Presence(update)),
            Frame::PeerJoined(peer) => Some(SyncEvent::PeerJoined(peer)),
            Frame::PeerLeft(session_id) => Some(SyncEvent::PeerLeft(session_id)),
            Frame::Ping => {
                send(out_tx, &Frame::Pong).await?;
                None
            }
            Frame::Error { code, message } => {
                log::warn!("Server error {code:?}: {message}");
                Some(SyncEvent::Error { code, message })
            }
            Frame::SyncStep1(state_vector) => {
                let diff = self.replica.lock().await.encode_update_since(&state_vector)?;
                send(out_tx, &Frame::SyncStep2(diff)).await?;
                None
            }
            Frame::Pong => None,
            Frame::Auth(_) => {
                log::warn!("Server sent a client-only frame; ignoring");
                None
            }
        };
        if let Some(event) = event {
            self.emit(event).await;
        }
        Ok(())
    }

    async fn emit(&self, event: SyncEvent) {
        let _ = self.event_tx.send(event).await;
    }
}

async fn send(out_tx: &mpsc::Sender<Vec<u8>>, frame: &Frame) -> Result<(), ClientError> {
    out_tx
        .send(frame.encode()?)
        .await
        .map_err(|_| ProtocolError::ConnectionClosed)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> AuthRequest {
        AuthRequest {
            document_id: "acme/doc1".parse().unwrap(),
            user_id: "alice".into(),
            token: "t-alice".into(),
        }
    }

    #[tokio::test]
    async fn test_client_initial_state() {
        let client = SyncClient::new("ws://127.0.0.1:9", request()).unwrap();
        assert_eq!(client.state().await, ClientState::Disconnected);
        assert_eq!(client.offline_queue_len().await, 0);
        assert!(client.session().await.is_none());
        assert_eq!(client.document_id().to_string(), "acme/doc1");
    }

    #[tokio::test]
    async fn test_offline_edits_queue_and_apply_locally() {
        let client = SyncClient::new("ws://127.0.0.1:9", request()).unwrap();
        client.apply_local(&LocalOp::insert(0, "ab")).await.unwrap();
        client.apply_local(&LocalOp::insert(2, "c")).await.unwrap();

        assert_eq!(client.offline_queue_len().await, 2);
        assert_eq!(client.text().await, "abc");
    }

    #[tokio::test]
    async fn test_invalid_local_edit_not_queued() {
        let client = SyncClient::new("ws://127.0.0.1:9", request()).unwrap();
        let err = client.apply_local(&LocalOp::delete(0, 5)).await.unwrap_err();
        assert!(matches!(err, ClientError::Engine(_)));
        assert_eq!(client.offline_queue_len().await, 0);
    }

    #[tokio::test]
    async fn test_presence_offline_noop() {
        let client = SyncClient::new("ws://127.0.0.1:9", request()).unwrap();
        client
            .set_presence(serde_json::json!({"cursor": 1}))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Nothing listens on the discard port in the test environment.
        let mut client = SyncClient::new("ws://127.0.0.1:9", request()).unwrap();
        assert!(matches!(
            client.connect().await,
            Err(ClientError::Connect(_))
        ));
        assert_eq!(client.state().await, ClientState::Disconnected);
    }

    #[tokio::test]
    async fn test_server_sync_step1_answered_with_replica_delta() {
        let id = request().document_id;
        let mut replica = DocumentEngine::with_client_id(id.clone(), 77).unwrap();
        replica.apply_local(&LocalOp::insert(0, "restored")).unwrap();
        let client = SyncClient::with_replica("ws://127.0.0.1:9", request(), replica);

        let mut server = DocumentEngine::with_client_id(id, 1).unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        client
            .shared
            .handle_frame(Frame::SyncStep1(server.state_vector()), &tx)
            .await
            .unwrap();

        let sent = Frame::decode(&rx.recv().await.unwrap()).unwrap();
        let Frame::SyncStep2(diff) = sent else {
            panic!("expected sync-step-2, got {sent:?}");
        };
        server.apply_remote(&diff).unwrap();
        assert_eq!(server.text(), "restored");
    }

    #[tokio::test]
    async fn test_take_event_rx() {
        let mut client = SyncClient::new("ws://127.0.0.1:9", request()).unwrap();
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }

    #[test]
    fn test_offline_queue() {
        let mut queue = OfflineQueue::new(100);
        assert!(queue.is_empty());

        queue.enqueue(vec![1, 2, 3]);
        queue.enqueue(vec![4, 5, 6, 7]);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.total_bytes(), 7);

        let drained = queue.drain();
        assert_eq!(drained, vec![vec![1, 2, 3], vec![4, 5, 6, 7]]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_offline_queue_capacity() {
        let mut queue = OfflineQueue::new(3);
        assert!(queue.enqueue(vec![1]));
        assert!(queue.enqueue(vec![2]));
        assert!(queue.enqueue(vec![3]));
        assert!(!queue.enqueue(vec![4]));
        assert!(queue.is_full());
        queue.clear();
        assert!(queue.is_empty());
    }
}
