//! Session/connection manager.
//!
//! Owns every active document:
//!
//! ```text
//! SessionManager
//!   └── rooms: DocumentId → DocumentRoom
//!          ├── engine      tokio Mutex<DocumentEngine>  (the per-document exclusive section)
//!          ├── membership  session id → PeerInfo         (linearizable attach/detach)
//!          ├── presence    PresenceTracker
//!          └── broadcast   BroadcastGroup
//! ```
//!
//! A room is created on first use, loaded from the store, and evicted once
//! it has had no sessions for `eviction_grace` and its state is persisted.
//! Flushing copies a snapshot under the engine lock and writes it after the
//! lock is released, so saves never block incoming operations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, MutexGuard, PoisonError};
use std::time::Instant;

use futures_util::future::join_all;
use serde_json::Value;
use tandem_core::{DocumentEngine, DocumentId, LocalOp, MergeOutcome, Snapshot};
use tokio::sync::{Mutex, Notify, OnceCell, RwLock};
use uuid::Uuid;

use crate::auth::{AccessGrant, Authenticator};
use crate::broadcast::{BroadcastGroup, SessionReceiver};
use crate::config::ServerConfig;
use crate::error::CollabError;
use crate::presence::PresenceTracker;
use crate::protocol::{AwarenessUpdate, Frame, PeerInfo};
use crate::stats::{ServerStats, StatsSnapshot};
use crate::storage::{SnapshotStore, StoreError};

/// Binding of one connection to one document.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub id: Uuid,
    pub document_id: DocumentId,
    pub user_id: String,
    pub read_only: bool,
    pub peer: PeerInfo,
}

/// Result of a successful attach: the session and its broadcast feed.
#[derive(Debug)]
pub struct Attachment {
    pub session: Session,
    pub receiver: SessionReceiver,
}

#[derive(Debug, Default)]
struct Membership {
    sessions: HashMap<Uuid, PeerInfo>,
    /// Set when the last session left (or the room was created empty).
    emptied_at: Option<Instant>,
}

struct DocumentRoom {
    id: DocumentId,
    engine: OnceCell<Mutex<DocumentEngine>>,
    membership: std::sync::Mutex<Membership>,
    presence: std::sync::Mutex<PresenceTracker>,
    broadcast: BroadcastGroup,
    /// Engine version last written to the store.
    persisted_version: AtomicU64,
    /// Serializes flushes of this document.
    flush_lock: Mutex<()>,
    /// Set under the membership lock and the engine lock; an evicted room
    /// accepts nothing and callers retry against a fresh room.
    evicted: AtomicBool,
}

impl DocumentRoom {
    fn new(id: DocumentId, broadcast_capacity: usize) -> Self {
        Self {
            id,
            engine: OnceCell::new(),
            membership: std::sync::Mutex::new(Membership {
                sessions: HashMap::new(),
                emptied_at: Some(Instant::now()),
            }),
            presence: std::sync::Mutex::new(PresenceTracker::new()),
            broadcast: BroadcastGroup::new(broadcast_capacity),
            persisted_version: AtomicU64::new(0),
            flush_lock: Mutex::new(()),
            evicted: AtomicBool::new(false),
        }
    }

    fn membership(&self) -> MutexGuard<'_, Membership> {
        self.membership.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn presence(&self) -> MutexGuard<'_, PresenceTracker> {
        self.presence.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_evicted(&self) -> bool {
        self.evicted.load(Ordering::SeqCst)
    }

    fn has_session(&self, session_id: &Uuid) -> bool {
        self.membership().sessions.contains_key(session_id)
    }

    fn send_frame(&self, frame: &Frame, exclude: Option<Uuid>) -> Result<usize, CollabError> {
        let bytes = frame.encode()?;
        Ok(self.broadcast.send(Arc::new(bytes), exclude))
    }
}

/// Session/connection manager. Share it behind an `Arc`.
pub struct SessionManager {
    config: ServerConfig,
    auth: Arc<dyn Authenticator>,
    store: Arc<dyn SnapshotStore>,
    rooms: RwLock<HashMap<DocumentId, Arc<DocumentRoom>>>,
    stats: ServerStats,
    flush_notify: Notify,
}

impl SessionManager {
    pub fn new(
        config: ServerConfig,
        auth: Arc<dyn Authenticator>,
        store: Arc<dyn SnapshotStore>,
    ) -> Self {
        Self {
            config,
            auth,
            store,
            rooms: RwLock::new(HashMap::new()),
            stats: ServerStats::default(),
            flush_notify: Notify::new(),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub(crate) fn counters(&self) -> &ServerStats {
        &self.stats
    }

    // ─── Attach / detach ─────────────────────────────────────────────

    /// Authenticate, authorize and attach a new session to `document_id`.
    ///
    /// On any error no session exists afterwards.
    pub async fn attach(
        &self,
        document_id: &DocumentId,
        user_id: &str,
        token: &str,
    ) -> Result<Attachment, CollabError> {
        let grant = self.authorize(document_id, user_id, token).await?;

        loop {
            let room = self.room(document_id).await?;
            let session_id = Uuid::new_v4();
            let mut peer = PeerInfo::new(session_id, user_id, grant.display_name());
            peer.read_only = grant.permissions.read_only;

            let receiver = {
                let mut membership = room.membership();
                if room.is_evicted() {
                    continue;
                }
                if membership.sessions.len() >= self.config.max_sessions_per_document {
                    return Err(CollabError::RoomFull {
                        document_id: document_id.clone(),
                        limit: self.config.max_sessions_per_document,
                    });
                }
                // Subscribe before the session becomes visible so no
                // broadcast addressed to it can be missed.
                let receiver = room.broadcast.subscribe(session_id);
                membership.sessions.insert(session_id, peer.clone());
                membership.emptied_at = None;
                receiver
            };

            room.send_frame(&Frame::PeerJoined(peer.clone()), Some(session_id))?;
            log::info!(
                "Session {session_id} ({user_id}) attached to {document_id}{}",
                if peer.read_only { " read-only" } else { "" }
            );

            return Ok(Attachment {
                session: Session {
                    id: session_id,
                    document_id: document_id.clone(),
                    user_id: user_id.to_string(),
                    read_only: peer.read_only,
                    peer,
                },
                receiver,
            });
        }
    }

    async fn authorize(
        &self,
        document_id: &DocumentId,
        user_id: &str,
        token: &str,
    ) -> Result<AccessGrant, CollabError> {
        let verified =
            tokio::time::timeout(self.config.auth_timeout, self.auth.verify_token(token)).await;
        let grant = match verified {
            Err(_) => {
                ServerStats::incr(&self.stats.auth_failures);
                log::warn!("Auth for {user_id} on {document_id} timed out");
                return Err(CollabError::AuthTimeout);
            }
            Ok(Err(e)) => {
                ServerStats::incr(&self.stats.auth_failures);
                log::warn!("Auth for {user_id} on {document_id} rejected: {e}");
                return Err(e.into());
            }
            Ok(Ok(grant)) => grant,
        };

        if grant.user_id != user_id {
            ServerStats::incr(&self.stats.auth_failures);
            log::warn!(
                "Token for {} presented by {user_id} on {document_id}",
                grant.user_id
            );
            return Err(CollabError::Unauthorized(
                "token was issued to a different user".into(),
            ));
        }
        if !grant.permissions.scope.allows(document_id) {
            ServerStats::incr(&self.stats.auth_failures);
            return Err(CollabError::Forbidden {
                user_id: user_id.to_string(),
                document_id: document_id.clone(),
            });
        }
        Ok(grant)
    }

    /// Remove a session. When it was the last one, a flush is scheduled and
    /// the document becomes evictable after the grace period.
    pub async fn detach(&self, session: &Session) -> Result<(), CollabError> {
        let room = self
            .existing_room(&session.document_id)
            .await
            .ok_or(CollabError::SessionNotFound(session.id))?;

        let now_empty = {
            let mut membership = room.membership();
            if membership.sessions.remove(&session.id).is_none() {
                return Err(CollabError::SessionNotFound(session.id));
            }
            if membership.sessions.is_empty() {
                membership.emptied_at = Some(Instant::now());
                true
            } else {
                false
            }
        };

        room.presence().remove(&session.id);
        room.send_frame(&Frame::PeerLeft(session.id), Some(session.id))?;
        log::info!(
            "Session {} ({}) detached from {}",
            session.id,
            session.user_id,
            session.document_id
        );

        if now_empty {
            log::debug!("Last session left {}; flush scheduled", session.document_id);
            self.flush_notify.notify_one();
        }
        Ok(())
    }

    // ─── Document operations ─────────────────────────────────────────

    /// Send an encoded frame to every session on the document except `exclude`.
    pub async fn broadcast(
        &self,
        document_id: &DocumentId,
        payload: Vec<u8>,
        exclude: Option<Uuid>,
    ) -> Result<usize, CollabError> {
        let room = self
            .existing_room(document_id)
            .await
            .ok_or_else(|| CollabError::DocumentNotActive(document_id.clone()))?;
        Ok(room.broadcast.send(Arc::new(payload), exclude))
    }

    /// Merge an update sent by `session` and fan it out to the other sessions.
    ///
    /// What is broadcast is everything the merge integrated, computed from
    /// the state vector before it. That includes blocks that were parked
    /// earlier waiting for a missing dependency. Updates that change nothing
    /// (duplicates, or updates still missing a dependency) are not
    /// broadcast.
    pub async fn apply_remote(
        &self,
        session: &Session,
        update: &[u8],
    ) -> Result<MergeOutcome, CollabError> {
        if session.read_only {
            return Err(CollabError::ReadOnly(session.id));
        }
        let room = self.attached_room(session).await?;
        let engine = room
            .engine
            .get()
            .ok_or(CollabError::SessionNotFound(session.id))?;

        let mut engine = engine.lock().await;
        if room.is_evicted() {
            return Err(CollabError::SessionNotFound(session.id));
        }
        let before = engine.state_vector();
        let outcome = engine.apply_remote(update).map_err(|e| {
            ServerStats::incr(&self.stats.malformed_operations);
            log::warn!(
                "Rejected update from session {} on {}: {e}",
                session.id,
                session.document_id
            );
            CollabError::from(e)
        })?;
        if outcome.changed {
            let integrated = engine.encode_update_since(&before)?;
            // Still under the engine lock: broadcast order == merge order.
            room.send_frame(&Frame::Update(integrated), Some(session.id))?;
        } else {
            log::trace!(
                "Update from session {} on {} changed nothing",
                session.id,
                session.document_id
            );
        }
        Ok(outcome)
    }

    /// Apply an edit originating on the server and broadcast it to every session.
    pub async fn apply_local(
        &self,
        document_id: &DocumentId,
        op: &LocalOp,
    ) -> Result<Vec<u8>, CollabError> {
        loop {
            let room = self.room(document_id).await?;
            let engine = room
                .engine
                .get()
                .ok_or_else(|| CollabError::DocumentNotActive(document_id.clone()))?;
            let mut engine = engine.lock().await;
            if room.is_evicted() {
                continue;
            }
            let update = engine.apply_local(op)?;
            room.send_frame(&Frame::Update(update.clone()), None)?;
            return Ok(update);
        }
    }

    /// Answer a client's sync-step-1: everything the client lacks.
    pub async fn sync_step(
        &self,
        session: &Session,
        state_vector: &[u8],
    ) -> Result<Vec<u8>, CollabError> {
        let room = self.attached_room(session).await?;
        let engine = room
            .engine
            .get()
            .ok_or(CollabError::SessionNotFound(session.id))?;
        let engine = engine.lock().await;
        Ok(engine.encode_update_since(state_vector)?)
    }

    /// Full state of the document, loading it if necessary.
    pub async fn load(&self, document_id: &DocumentId) -> Result<Snapshot, CollabError> {
        self.with_engine(document_id, |engine| Ok(engine.snapshot()))
            .await
    }

    pub async fn state_vector(&self, document_id: &DocumentId) -> Result<Vec<u8>, CollabError> {
        self.with_engine(document_id, |engine| Ok(engine.state_vector()))
            .await
    }

    pub async fn encode_update_since(
        &self,
        document_id: &DocumentId,
        state_vector: &[u8],
    ) -> Result<Vec<u8>, CollabError> {
        self.with_engine(document_id, |engine| {
            Ok(engine.encode_update_since(state_vector)?)
        })
        .await
    }

    /// Current text of the document, loading it if necessary.
    pub async fn text(&self, document_id: &DocumentId) -> Result<String, CollabError> {
        self.with_engine(document_id, |engine| Ok(engine.text()))
            .await
    }

    async fn with_engine<T>(
        &self,
        document_id: &DocumentId,
        f: impl FnOnce(&DocumentEngine) -> Result<T, CollabError>,
    ) -> Result<T, CollabError> {
        let room = self.room(document_id).await?;
        let engine = room
            .engine
            .get()
            .ok_or_else(|| CollabError::DocumentNotActive(document_id.clone()))?;
        let engine = engine.lock().await;
        f(&*engine)
    }

    // ─── Presence ────────────────────────────────────────────────────

    /// Overwrite the session's presence and fan it out. Returns `false`
    /// when the state was unchanged (nothing is sent).
    pub async fn set_presence(&self, session: &Session, state: Value) -> Result<bool, CollabError> {
        let room = self.attached_room(session).await?;
        let changed = room
            .presence()
            .set(session.id, &session.user_id, state.clone());
        if changed {
            let frame = Frame::Awareness(AwarenessUpdate {
                client_id: session.id,
                state,
            });
            room.send_frame(&frame, Some(session.id))?;
        }
        Ok(changed)
    }

    /// `user_id -> presence payload` for the document.
    pub async fn presence_snapshot(&self, document_id: &DocumentId) -> HashMap<String, Value> {
        match self.existing_room(document_id).await {
            Some(room) => room.presence().snapshot(),
            None => HashMap::new(),
        }
    }

    /// Presence of every session except `exclude`, oldest first, as wire updates.
    pub async fn presence_updates(
        &self,
        document_id: &DocumentId,
        exclude: Option<Uuid>,
    ) -> Vec<AwarenessUpdate> {
        let Some(room) = self.existing_room(document_id).await else {
            return Vec::new();
        };
        let entries = room.presence().entries();
        entries
            .into_iter()
            .filter(|e| Some(e.session_id) != exclude)
            .map(|e| AwarenessUpdate {
                client_id: e.session_id,
                state: e.state,
            })
            .collect()
    }

    // ─── Introspection ───────────────────────────────────────────────

    pub async fn session_count(&self, document_id: &DocumentId) -> usize {
        match self.existing_room(document_id).await {
            Some(room) => room.membership().sessions.len(),
            None => 0,
        }
    }

    pub async fn total_sessions(&self) -> usize {
        let rooms = self.rooms.read().await;
        rooms.values().map(|r| r.membership().sessions.len()).sum()
    }

    /// Sessions attached to the document, excluding `exclude`.
    pub async fn peers(&self, document_id: &DocumentId, exclude: Option<Uuid>) -> Vec<PeerInfo> {
        match self.existing_room(document_id).await {
            Some(room) => room
                .membership()
                .sessions
                .values()
                .filter(|p| Some(p.session_id) != exclude)
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    /// Whether the document is currently held in memory.
    pub async fn is_loaded(&self, document_id: &DocumentId) -> bool {
        self.rooms.read().await.contains_key(document_id)
    }

    pub async fn active_documents(&self) -> Vec<DocumentId> {
        self.rooms.read().await.keys().cloned().collect()
    }

    pub async fn stats(&self) -> StatsSnapshot {
        let (sessions, documents) = {
            let rooms = self.rooms.read().await;
            let sessions = rooms.values().map(|r| r.membership().sessions.len()).sum();
            (sessions, rooms.len())
        };
        self.stats.snapshot(sessions, documents)
    }

    // ─── Flush & eviction ────────────────────────────────────────────

    /// Persist the document if it changed since the last flush.
    /// Returns `true` when a snapshot was written.
    pub async fn flush_document(&self, document_id: &DocumentId) -> Result<bool, CollabError> {
        match self.existing_room(document_id).await {
            Some(room) => self.flush_room(&room).await,
            None => Ok(false),
        }
    }

    /// Flush every dirty document concurrently. Returns how many were written.
    pub async fn flush_dirty(&self) -> usize {
        let rooms: Vec<Arc<DocumentRoom>> = self.rooms.read().await.values().cloned().collect();
        let results = join_all(rooms.iter().map(|room| self.flush_room(room))).await;

        let mut flushed = 0;
        for (room, result) in rooms.iter().zip(results) {
            match result {
                Ok(true) => flushed += 1,
                Ok(false) => {}
                Err(e) => log::error!("Flush of {} failed, keeping it in memory: {e}", room.id),
            }
        }
        flushed
    }

    /// Drop documents that have been empty for the grace period and have
    /// nothing left to persist. Returns the evicted ids.
    pub async fn evict_idle(&self) -> Vec<DocumentId> {
        let grace = self.config.eviction_grace;
        let now = Instant::now();
        let mut evicted = Vec::new();

        let mut rooms = self.rooms.write().await;
        rooms.retain(|id, room| {
            let membership = room.membership();
            let idle = membership.sessions.is_empty()
                && membership
                    .emptied_at
                    .is_some_and(|t| now.duration_since(t) >= grace);
            if !idle {
                return true;
            }
            // Hold the engine (if any) while deciding so no edit slips in.
            let _engine = match room.engine.get() {
                None => None,
                Some(cell) => match cell.try_lock() {
                    Err(_) => return true,
                    Ok(engine) => {
                        if engine.version() > room.persisted_version.load(Ordering::SeqCst) {
                            return true;
                        }
                        Some(engine)
                    }
                },
            };
            room.evicted.store(true, Ordering::SeqCst);
            evicted.push(id.clone());
            false
        });
        drop(rooms);

        for id in &evicted {
            log::info!("Evicted idle document {id}");
        }
        evicted
    }

    /// Final flush of every dirty document. Returns how many were written.
    pub async fn shutdown(&self) -> usize {
        let flushed = self.flush_dirty().await;
        log::info!("Session manager shut down after flushing {flushed} documents");
        flushed
    }

    /// Resolves when a detach asked for an early flush.
    pub(crate) async fn flush_requested(&self) {
        self.flush_notify.notified().await
    }

    async fn flush_room(&self, room: &DocumentRoom) -> Result<bool, CollabError> {
        let _flushing = room.flush_lock.lock().await;
        let Some(engine) = room.engine.get() else {
            return Ok(false);
        };

        let snapshot = {
            let mut engine = engine.lock().await;
            if engine.version() <= room.persisted_version.load(Ordering::SeqCst) {
                return Ok(false);
            }
            let mut snapshot = engine.snapshot();
            if snapshot.state.len() > self.config.compaction_threshold_bytes {
                let stats = engine.compact()?;
                log::debug!(
                    "Compacted {} before flush: {} -> {} bytes",
                    room.id,
                    stats.before_bytes,
                    stats.after_bytes
                );
                snapshot = engine.snapshot();
            }
            snapshot
        };

        self.save_with_retry(&snapshot).await?;
        room.persisted_version
            .fetch_max(snapshot.version, Ordering::SeqCst);
        ServerStats::incr(&self.stats.flushes);
        log::info!(
            "Flushed {} at version {} ({} bytes)",
            snapshot.document_id,
            snapshot.version,
            snapshot.state.len()
        );
        Ok(true)
    }

    async fn save_with_retry(&self, snapshot: &Snapshot) -> Result<(), CollabError> {
        let policy = self.config.flush_retry;
        let mut attempt = 1;
        loop {
            let result = self
                .store
                .save_snapshot(&snapshot.document_id, &snapshot.state, snapshot.version)
                .await;
            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                    ServerStats::incr(&self.stats.flush_failures);
                    let delay = policy.backoff(attempt);
                    log::warn!(
                        "Flush of {} failed (attempt {attempt}/{}): {e}; retrying in {delay:?}",
                        snapshot.document_id,
                        policy.max_attempts
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    ServerStats::incr(&self.stats.flush_failures);
                    return Err(e.into());
                }
            }
        }
    }

    // ─── Rooms ───────────────────────────────────────────────────────

    async fn existing_room(&self, document_id: &DocumentId) -> Option<Arc<DocumentRoom>> {
        self.rooms.read().await.get(document_id).cloned()
    }

    async fn attached_room(&self, session: &Session) -> Result<Arc<DocumentRoom>, CollabError> {
        match self.existing_room(&session.document_id).await {
            Some(room) if room.has_session(&session.id) => Ok(room),
            _ => Err(CollabError::SessionNotFound(session.id)),
        }
    }

    /// Get or create the room and make sure its engine is loaded.
    async fn room(&self, document_id: &DocumentId) -> Result<Arc<DocumentRoom>, CollabError> {
        let room = {
            // Fast path: read lock
            let existing = self.rooms.read().await.get(document_id).cloned();
            match existing {
                Some(room) => room,
                None => {
                    let mut rooms = self.rooms.write().await;
                    // Double-check after acquiring write lock
                    rooms
                        .entry(document_id.clone())
                        .or_insert_with(|| {
                            Arc::new(DocumentRoom::new(
                                document_id.clone(),
                                self.config.broadcast_capacity,
                            ))
                        })
                        .clone()
                }
            }
        };

        room.engine
            .get_or_try_init(|| self.load_engine(&room))
            .await?;
        Ok(room)
    }

    async fn load_engine(&self, room: &DocumentRoom) -> Result<Mutex<DocumentEngine>, CollabError> {
        let engine = match self.store.load_snapshot(&room.id).await {
            Ok(stored) => {
                let engine = DocumentEngine::from_snapshot(
                    room.id.clone(),
                    &stored.state,
                    stored.version,
                )
                .map_err(|e| {
                    CollabError::StoreUnavailable(format!("corrupted snapshot for {}: {e}", room.id))
                })?;
                room.persisted_version
                    .store(stored.version, Ordering::SeqCst);
                log::info!("Loaded {} at version {}", room.id, stored.version);
                engine
            }
            Err(StoreError::NotFound(_)) => {
                log::info!("Created new document {}", room.id);
                DocumentEngine::new(room.id.clone())?
            }
            Err(e) => {
                log::error!("Could not load {}: {e}", room.id);
                return Err(e.into());
            }
        };
        Ok(Mutex::new(engine))
    }
}
