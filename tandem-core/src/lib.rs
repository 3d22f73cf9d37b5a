//! # tandem-core: CRDT document engine for Tandem
//!
//! Holds the mergeable state of a single collaborative document and exposes
//! the operations every replica (server or client) needs:
//!
//! ```text
//!   LocalOp ──► DocumentEngine::apply_local ──► update bytes ──► peers
//!                        │
//!   update bytes ──► DocumentEngine::apply_remote ──► MergeOutcome
//!                        │
//!   state vector ──► DocumentEngine::encode_update_since ──► delta
//! ```
//!
//! The merge algorithm is the YATA CRDT provided by `yrs`. Nothing outside
//! [`engine`] touches a `yrs::Doc` directly, so the algorithm stays swappable.
//!
//! This crate does no I/O; sessions, transport and persistence live in
//! `tandem-collab`.

pub mod engine;
pub mod id;

pub use engine::{
    CompactionStats, DocumentEngine, EngineError, LocalOp, MergeOutcome, Snapshot, TEXT_ROOT,
};
pub use id::{DocumentId, IdError};
