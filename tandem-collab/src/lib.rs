//! # tandem-collab: Real-time collaboration server for tandem documents
//!
//! Sessions, presence, the sync protocol and persistence around the
//! [`tandem_core::DocumentEngine`].
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄────────────────► │ SyncServer  │
//! │ (replica)   │    binary frames   │ (per conn)  │
//! └─────────────┘                    └──────┬──────┘
//!                                           │
//!                                    ┌──────▼─────────┐
//!                                    │ SessionManager │──► Authenticator
//!                                    └──────┬─────────┘
//!                          ┌────────────────┼──────────────┐
//!                          ▼                ▼              ▼
//!                   DocumentEngine   PresenceTracker  BroadcastGroup
//!                          │
//!                          ▼  (flusher)
//!                   SnapshotStore (RocksDB / memory)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: binary frames
//! - [`connection`]: per-connection state machine
//! - [`session`]: attach/detach, document rooms, flush and eviction
//! - [`presence`]: ephemeral awareness state
//! - [`broadcast`]: per-document fan-out
//! - [`server`] / [`client`]: WebSocket endpoints
//! - [`storage`]: snapshot stores
//! - [`flush`]: background persistence

pub mod auth;
pub mod broadcast;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod flush;
pub mod presence;
pub mod protocol;
pub mod server;
pub mod session;
pub mod stats;
pub mod storage;

// Re-exports for convenience
pub use auth::{
    AccessGrant, AuthError, Authenticator, DocumentScope, Permissions, StaticTokenAuthenticator,
};
pub use broadcast::{BroadcastGroup, BroadcastStats, SessionReceiver};
pub use client::{ClientError, ClientState, OfflineQueue, SyncClient, SyncEvent};
pub use config::{ConfigError, RetryPolicy, ServerConfig};
pub use connection::{ConnectionPhase, ConnectionState, ServerAction};
pub use error::CollabError;
pub use flush::{spawn_flusher, FlushHandle};
pub use presence::{PresenceEntry, PresenceState, PresenceTracker};
pub use protocol::{
    AuthRequest, AwarenessUpdate, ErrorCode, Frame, MessageType, PeerInfo, ProtocolError,
};
pub use server::{ShutdownHandle, SyncServer};
pub use session::{Attachment, Session, SessionManager};
pub use stats::{ServerStats, StatsSnapshot};
pub use storage::{
    DocumentMetadata, MemoryStore, RocksStore, SnapshotStore, StoreConfig, StoreError,
    StoredSnapshot,
};
