//! WebSocket sync server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                         ┌── DocumentEngine (yrs)
//!            ├── connection task ──► SessionManager ──┤
//! Client B ──┘        │                    │          └── BroadcastGroup ──► other sessions
//!                     │                    └── SnapshotStore (flusher task)
//!                     └── ConnectionState (auth → sync → live)
//! ```
//!
//! One task per connection. The task owns the socket and the session's
//! broadcast receiver; all shared state lives in the [`SessionManager`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::broadcast::SessionReceiver;
use crate::connection::{ConnectionState, ServerAction};
use crate::error::CollabError;
use crate::protocol::{ErrorCode, Frame, ProtocolError};
use crate::session::{Session, SessionManager};
use crate::stats::ServerStats;

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Stops a running [`SyncServer`] and all of its connections.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }
}

/// The sync server.
pub struct SyncServer {
    manager: Arc<SessionManager>,
    listener: TcpListener,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl SyncServer {
    /// Bind to `manager.config().bind_addr`. Port 0 picks a free port.
    pub async fn bind(manager: Arc<SessionManager>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(&manager.config().bind_addr).await?;
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            manager,
            listener,
            shutdown_tx: Arc::new(shutdown_tx),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    /// Accept connections until shut down.
    pub async fn run(self) -> Result<(), BoxError> {
        log::info!("Sync server listening on {}", self.local_addr()?);
        let mut shutdown = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            log::warn!("Accept failed: {e}");
                            continue;
                        }
                    };
                    log::debug!("New TCP connection from {addr}");

                    let manager = self.manager.clone();
                    let shutdown = self.shutdown_tx.subscribe();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, addr, manager, shutdown).await {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }
                _ = shutdown.changed() => {
                    log::info!("Sync server shutting down");
                    return Ok(());
                }
            }
        }
    }
}

/// Handle a single WebSocket connection from upgrade to detach.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    manager: Arc<SessionManager>,
    shutdown: watch::Receiver<bool>,
) -> Result<(), BoxError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (sink, source) = ws_stream.split();
    log::info!("WebSocket connection established from {addr}");

    let stats = manager.counters();
    ServerStats::incr(&stats.connections_total);
    ServerStats::incr(&stats.connections_active);

    let mut conn = Connection {
        state: ConnectionState::new(manager.config().max_malformed_per_session),
        manager: manager.clone(),
        sink,
        source,
        addr,
    };
    let result = conn.serve(shutdown).await;
    conn.state.close();
    let _ = conn.sink.send(Message::Close(None)).await;

    ServerStats::decr(&manager.counters().connections_active);
    log::info!("Connection from {addr} closed");
    result
}

enum Flow {
    Continue,
    Close,
}

struct Connection {
    state: ConnectionState,
    manager: Arc<SessionManager>,
    sink: WsSink,
    source: WsSource,
    addr: SocketAddr,
}

impl Connection {
    async fn serve(&mut self, shutdown: watch::Receiver<bool>) -> Result<(), BoxError> {
        self.state.opened()?;

        let Some((session, receiver)) = self.authenticate().await? else {
            return Ok(());
        };

        let result = self.run_live(&session, receiver, shutdown).await;
        if let Err(e) = self.manager.detach(&session).await {
            log::warn!("Detach of session {} failed: {e}", session.id);
        }
        result
    }

    /// First frame must be `auth`, within the auth timeout.
    async fn authenticate(&mut self) -> Result<Option<(Session, SessionReceiver)>, BoxError> {
        let timeout = self.manager.config().auth_timeout;
        let bytes = match tokio::time::timeout(timeout, self.next_binary()).await {
            Err(_) => {
                log::warn!("{}: no auth frame within {timeout:?}", self.addr);
                ServerStats::incr(&self.manager.counters().auth_failures);
                self.send_error(&CollabError::AuthTimeout).await?;
                return Ok(None);
            }
            Ok(None) => return Ok(None),
            Ok(Some(bytes)) => bytes,
        };

        let frame = match Frame::decode(&bytes) {
            Ok(frame) => frame,
            Err(e) => {
                self.send_error(&CollabError::Protocol(e)).await?;
                return Ok(None);
            }
        };
        let request = match (self.state.server_action(frame.message_type()), frame) {
            (Ok(ServerAction::Authenticate), Frame::Auth(request)) => request,
            (Err(e), _) => {
                self.send_error(&CollabError::Protocol(e)).await?;
                return Ok(None);
            }
            (Ok(_), frame) => {
                let e = ProtocolError::UnexpectedFrame {
                    got: frame.message_type(),
                    state: self.state.phase().as_str(),
                };
                self.send_error(&CollabError::Protocol(e)).await?;
                return Ok(None);
            }
        };

        let attachment = match self
            .manager
            .attach(&request.document_id, &request.user_id, &request.token)
            .await
        {
            Ok(attachment) => attachment,
            Err(e) => {
                log::info!("{}: attach to {} refused: {e}", self.addr, request.document_id);
                self.send_error(&e).await?;
                return Ok(None);
            }
        };

        let session = attachment.session;
        self.send_frame(&Frame::Welcome(session.peer.clone())).await?;
        self.state.authenticated(!session.read_only)?;
        if !session.read_only {
            // Ask for whatever the client has that we lack.
            let state_vector = self.manager.state_vector(&session.document_id).await?;
            self.send_frame(&Frame::SyncStep1(state_vector)).await?;
        }
        Ok(Some((session, attachment.receiver)))
    }

    async fn run_live(
        &mut self,
        session: &Session,
        mut receiver: SessionReceiver,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), BoxError> {
        let config = self.manager.config().clone();
        let liveness = config.liveness_timeout();
        let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
        heartbeat.tick().await;
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                inbound = self.next_binary() => {
                    let Some(bytes) = inbound else { return Ok(()) };
                    last_seen = Instant::now();
                    let stats = self.manager.counters();
                    ServerStats::incr(&stats.messages_received);
                    ServerStats::add(&stats.bytes_received, bytes.len() as u64);

                    if let Flow::Close = self.handle_inbound(session, &bytes).await? {
                        return Ok(());
                    }
                }
                outbound = receiver.recv() => match outbound {
                    Ok(bytes) => self.send_bytes(bytes.as_ref().clone()).await?,
                    Err(RecvError::Lagged(n)) => {
                        log::warn!("Session {} lagged by {n} frames; resyncing", session.id);
                        let snapshot = self.manager.load(&session.document_id).await?;
                        self.send_frame(&Frame::Update(snapshot.state)).await?;
                    }
                    Err(RecvError::Closed) => return Ok(()),
                },
                _ = heartbeat.tick() => {
                    if last_seen.elapsed() > liveness {
                        log::warn!("Session {} silent for {:?}; closing", session.id, last_seen.elapsed());
                        return Ok(());
                    }
                    self.send_frame(&Frame::Ping).await?;
                }
                _ = shutdown.changed() => return Ok(()),
            }
        }
    }

    async fn handle_inbound(&mut self, session: &Session, bytes: &[u8]) -> Result<Flow, BoxError> {
        let frame = match Frame::decode(bytes) {
            Ok(frame) => frame,
            Err(e) => return self.malformed(CollabError::Protocol(e)).await,
        };
        let action = match self.state.server_action(frame.message_type()) {
            Ok(action) => action,
            Err(e) => {
                log::warn!("Session {}: {e}", session.id);
                self.send_error(&CollabError::Protocol(e)).await?;
                return Ok(Flow::Close);
            }
        };

        match (action, frame) {
            (ServerAction::AnswerSyncStep1, Frame::SyncStep1(state_vector)) => {
                let diff = match self.manager.sync_step(session, &state_vector).await {
                    Ok(diff) => diff,
                    Err(e @ CollabError::MalformedOperation(_)) => return self.malformed(e).await,
                    Err(e) => return Err(e.into()),
                };
                self.send_frame(&Frame::SyncStep2(diff)).await?;
                if self.state.answered_sync_step1()? {
                    self.went_live(session).await?;
                }
            }
            (ServerAction::ApplySyncStep2, Frame::SyncStep2(update)) => {
                if let Some(flow) = self.apply_update(session, &update).await? {
                    return Ok(flow);
                }
                if self.state.received_sync_step2()? {
                    self.went_live(session).await?;
                }
            }
            (ServerAction::ApplyUpdate, Frame::Update(update)) => {
                if let Some(flow) = self.apply_update(session, &update).await? {
                    return Ok(flow);
                }
            }
            (ServerAction::SetPresence, Frame::Awareness(update)) => {
                if update.client_id != session.id {
                    let e = CollabError::MalformedOperation(format!(
                        "presence for foreign client {}",
                        update.client_id
                    ));
                    return self.malformed(e).await;
                }
                self.manager.set_presence(session, update.state).await?;
            }
            (ServerAction::Pong, _) => self.send_frame(&Frame::Pong).await?,
            (ServerAction::Heartbeat, _) => {}
            (ServerAction::Reject(reason), _) => {
                return self
                    .malformed(CollabError::MalformedOperation(reason.to_string()))
                    .await;
            }
            (_, frame) => {
                let e = ProtocolError::UnexpectedFrame {
                    got: frame.message_type(),
                    state: self.state.phase().as_str(),
                };
                self.send_error(&CollabError::Protocol(e)).await?;
                return Ok(Flow::Close);
            }
        }
        Ok(Flow::Continue)
    }

    /// Merge a client update. `Some` carries the flow for a rejected update.
    async fn apply_update(
        &mut self,
        session: &Session,
        update: &[u8],
    ) -> Result<Option<Flow>, BoxError> {
        match self.manager.apply_remote(session, update).await {
            Ok(_) => Ok(None),
            Err(e @ CollabError::MalformedOperation(_)) => self.reject(e).await.map(Some),
            Err(e @ CollabError::ReadOnly(_)) => {
                self.send_error(&e).await?;
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn went_live(&mut self, session: &Session) -> Result<(), BoxError> {
        self.replay_room(session).await?;
        log::debug!("Session {} is live", session.id);
        Ok(())
    }

    /// Peers and presence already in the room, sent once the session is live.
    async fn replay_room(&mut self, session: &Session) -> Result<(), BoxError> {
        for peer in self
            .manager
            .peers(&session.document_id, Some(session.id))
            .await
        {
            self.send_frame(&Frame::PeerJoined(peer)).await?;
        }
        for update in self
            .manager
            .presence_updates(&session.document_id, Some(session.id))
            .await
        {
            self.send_frame(&Frame::Awareness(update)).await?;
        }
        Ok(())
    }

    /// Reject one operation; close once the budget is spent.
    async fn malformed(&mut self, error: CollabError) -> Result<Flow, BoxError> {
        log::warn!("{}: rejected operation: {error}", self.addr);
        ServerStats::incr(&self.manager.counters().malformed_operations);
        self.reject(error).await
    }

    /// Like [`Self::malformed`] for rejections the session manager already counted.
    async fn reject(&mut self, error: CollabError) -> Result<Flow, BoxError> {
        let exhausted = self.state.record_malformed();
        let error = if let CollabError::Protocol(e) = error {
            CollabError::MalformedOperation(e.to_string())
        } else {
            error
        };
        self.send_error(&error).await?;
        if exhausted {
            let message = format!(
                "{} malformed operations; closing",
                self.state.malformed_count()
            );
            self.send_frame(&Frame::error(ErrorCode::ProtocolViolation, message))
                .await?;
            return Ok(Flow::Close);
        }
        Ok(Flow::Continue)
    }

    /// Next binary message. `None` when the peer closed or the socket failed.
    async fn next_binary(&mut self) -> Option<Vec<u8>> {
        loop {
            match self.source.next().await {
                Some(Ok(Message::Binary(data))) => return Some(data.into()),
                Some(Ok(Message::Close(_))) | None => return None,
                Some(Ok(Message::Text(_))) => {
                    log::debug!("{}: ignoring text message", self.addr);
                }
                // tungstenite answers transport pings itself
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::debug!("{}: read error: {e}", self.addr);
                    return None;
                }
            }
        }
    }

    async fn send_error(&mut self, error: &CollabError) -> Result<(), BoxError> {
        self.send_frame(&Frame::error(error.code(), error.to_string()))
            .await
    }

    async fn send_frame(&mut self, frame: &Frame) -> Result<(), BoxError> {
        let bytes = frame.encode()?;
        self.send_bytes(bytes).await
    }

    async fn send_bytes(&mut self, bytes: Vec<u8>) -> Result<(), BoxError> {
        let stats = self.manager.counters();
        ServerStats::incr(&stats.messages_sent);
        ServerStats::add(&stats.bytes_sent, bytes.len() as u64);
        self.sink.send(Message::Binary(bytes.into())).await?;
        Ok(())
    }
}
