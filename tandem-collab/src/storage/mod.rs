//! Document store adapters.
//!
//! ```text
//! ┌────────────────┐  save_snapshot(id, bytes, version)  ┌──────────────┐
//! │ SessionManager │ ──────────────────────────────────► │ SnapshotStore│
//! │ (flush path)   │ ◄────────────────────────────────── │              │
//! └────────────────┘  load_snapshot(id) | NotFound       └──────┬───────┘
//!                                                               │
//!                                             ┌─────────────────┴──────┐
//!                                             ▼                        ▼
//!                                       MemoryStore               RocksStore
//!                                       (in-process)              (RocksDB, LZ4)
//! ```
//!
//! Stores only ever see full converged states. Presence never reaches them.

pub mod memory;
pub mod rocks;

use async_trait::async_trait;
use tandem_core::DocumentId;

pub use memory::MemoryStore;
pub use rocks::{DocumentMetadata, RocksStore, StoreConfig};

/// A persisted document state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSnapshot {
    /// Full yrs v1 update
    pub state: Vec<u8>,
    pub version: u64,
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("Document not found: {0}")]
    NotFound(DocumentId),
    /// The backend cannot be reached right now; retrying may succeed.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("Database error: {0}")]
    Database(String),
    #[error("Corrupted record: {0}")]
    Corrupted(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Database(_))
    }
}

/// Persistence collaborator.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn load_snapshot(&self, document_id: &DocumentId) -> Result<StoredSnapshot, StoreError>;

    async fn save_snapshot(
        &self,
        document_id: &DocumentId,
        state: &[u8],
        version: u64,
    ) -> Result<(), StoreError>;
}
