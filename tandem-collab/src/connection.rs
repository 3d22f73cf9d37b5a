//! Per-connection lifecycle as an explicit state machine.
//!
//! ```text
//! Connecting ──open──► Authenticating ──auth ok──► Syncing ──step1/step2──► Live
//!      │                     │                        │                      │
//!      └─────────────────────┴────────── close ───────┴──────────────────────┴──► Closed
//! ```
//!
//! The sync handshake runs both ways. The server answers the client's
//! sync-step-1 and, for writable sessions, sends its own sync-step-1 and
//! waits for the client's sync-step-2. `Syncing` ends when both halves are
//! done.
//!
//! Transitions are plain synchronous methods; the async connection handler
//! only drives them. `server_action` tells the handler what an inbound frame
//! means in the current phase.

use crate::protocol::{MessageType, ProtocolError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionPhase {
    Connecting,
    Authenticating,
    Syncing,
    Live,
    Closed,
}

impl ConnectionPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionPhase::Connecting => "connecting",
            ConnectionPhase::Authenticating => "authenticating",
            ConnectionPhase::Syncing => "syncing",
            ConnectionPhase::Live => "live",
            ConnectionPhase::Closed => "closed",
        }
    }
}

impl std::fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the server should do with an inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerAction {
    /// Verify credentials and attach.
    Authenticate,
    /// Reply with the delta since the client's state vector.
    AnswerSyncStep1,
    /// Merge the payload and broadcast it.
    ApplyUpdate,
    /// Merge the client's answer to our sync-step-1.
    ApplySyncStep2,
    /// Store and fan out presence.
    SetPresence,
    /// Reply with `pong`.
    Pong,
    /// Liveness only.
    Heartbeat,
    /// Not allowed yet; counts as a malformed operation but keeps the connection.
    Reject(&'static str),
}

/// Halves of the sync handshake completed so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct SyncProgress {
    answered_step1: bool,
    received_step2: bool,
}

/// Connection state: phase, handshake progress and the malformed-operation budget.
#[derive(Debug, Clone)]
pub struct ConnectionState {
    phase: ConnectionPhase,
    sync: SyncProgress,
    malformed: u32,
    max_malformed: u32,
}

impl ConnectionState {
    pub fn new(max_malformed: u32) -> Self {
        Self {
            phase: ConnectionPhase::Connecting,
            sync: SyncProgress::default(),
            malformed: 0,
            max_malformed,
        }
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    pub fn is_live(&self) -> bool {
        self.phase == ConnectionPhase::Live
    }

    pub fn is_closed(&self) -> bool {
        self.phase == ConnectionPhase::Closed
    }

    /// Transport established.
    pub fn opened(&mut self) -> Result<(), ProtocolError> {
        self.transition(ConnectionPhase::Connecting, ConnectionPhase::Authenticating)
    }

    /// Credentials accepted and session attached. Read-only sessions pass
    /// `false`: they are never asked for their state.
    pub fn authenticated(&mut self, expects_client_state: bool) -> Result<(), ProtocolError> {
        self.transition(ConnectionPhase::Authenticating, ConnectionPhase::Syncing)?;
        self.sync = SyncProgress {
            answered_step1: false,
            received_step2: !expects_client_state,
        };
        Ok(())
    }

    /// The client's sync-step-1 was answered. Returns `true` when this
    /// finished the handshake.
    pub fn answered_sync_step1(&mut self) -> Result<bool, ProtocolError> {
        self.advance_sync(|sync| sync.answered_step1 = true)
    }

    /// The client's sync-step-2 was merged. Returns `true` when this
    /// finished the handshake.
    pub fn received_sync_step2(&mut self) -> Result<bool, ProtocolError> {
        self.advance_sync(|sync| sync.received_step2 = true)
    }

    fn advance_sync(&mut self, step: impl FnOnce(&mut SyncProgress)) -> Result<bool, ProtocolError> {
        match self.phase {
            ConnectionPhase::Syncing => {
                step(&mut self.sync);
                if self.sync.answered_step1 && self.sync.received_step2 {
                    self.phase = ConnectionPhase::Live;
                    return Ok(true);
                }
                Ok(false)
            }
            // Later step-1/step-2 rounds are plain catch-ups.
            ConnectionPhase::Live => Ok(false),
            phase => Err(ProtocolError::InvalidTransition {
                from: phase.as_str(),
                to: ConnectionPhase::Live.as_str(),
            }),
        }
    }

    /// Always allowed; idempotent.
    pub fn close(&mut self) {
        self.phase = ConnectionPhase::Closed;
    }

    fn transition(
        &mut self,
        from: ConnectionPhase,
        to: ConnectionPhase,
    ) -> Result<(), ProtocolError> {
        if self.phase != from {
            return Err(ProtocolError::InvalidTransition {
                from: self.phase.as_str(),
                to: to.as_str(),
            });
        }
        self.phase = to;
        Ok(())
    }

    /// Count a malformed operation. Returns `true` once the budget is spent
    /// and the connection must be closed.
    pub fn record_malformed(&mut self) -> bool {
        self.malformed = self.malformed.saturating_add(1);
        self.malformed >= self.max_malformed
    }

    pub fn malformed_count(&self) -> u32 {
        self.malformed
    }

    /// Classify an inbound frame on the server side. `Err` is a protocol
    /// violation that closes the connection.
    pub fn server_action(&self, msg_type: MessageType) -> Result<ServerAction, ProtocolError> {
        use ConnectionPhase::*;
        use MessageType as M;

        let unexpected = || ProtocolError::UnexpectedFrame {
            got: msg_type,
            state: self.phase.as_str(),
        };

        match (self.phase, msg_type) {
            (Closed, _) => Err(ProtocolError::ConnectionClosed),
            (Connecting, _) => Err(unexpected()),

            (Authenticating, M::Auth) => Ok(ServerAction::Authenticate),
            (Authenticating, _) => Err(unexpected()),

            (Syncing | Live, M::Auth) => Err(unexpected()),
            (Syncing | Live, M::SyncStep1) => Ok(ServerAction::AnswerSyncStep1),
            (Syncing | Live, M::Ping) => Ok(ServerAction::Pong),
            (Syncing | Live, M::Pong) => Ok(ServerAction::Heartbeat),

            (Syncing | Live, M::SyncStep2) => Ok(ServerAction::ApplySyncStep2),

            (Syncing, M::Update) => Ok(ServerAction::Reject("edits before sync")),
            (Syncing, M::Awareness) => Ok(ServerAction::Reject("presence before sync")),

            (Live, M::Update) => Ok(ServerAction::ApplyUpdate),
            (Live, M::Awareness) => Ok(ServerAction::SetPresence),

            // Server-to-client only.
            (Syncing | Live, M::PeerJoined | M::PeerLeft | M::Welcome | M::Error) => {
                Err(unexpected())
            }
        }
    }
}
