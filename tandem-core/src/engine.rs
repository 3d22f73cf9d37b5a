//! CRDT document engine.
//!
//! One [`DocumentEngine`] owns the converged state of one document. The
//! server keeps exactly one per active document behind that document's
//! exclusive section; clients keep one as their local replica.
//!
//! Content is a single shared text rooted at [`TEXT_ROOT`]. Indices are in
//! UTF-16 code units so that browser (Yjs) peers and native peers agree.
//!
//! Merge semantics come from the yrs YATA implementation:
//! - applying updates is commutative, associative and idempotent;
//! - concurrent inserts at the same position are ordered by client id,
//!   lower client id first;
//! - deleted items keep a tombstone (garbage-collected content, retained id
//!   ranges) so late updates still integrate.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Doc, GetString, OffsetKind, Options, ReadTxn, StateVector, Subscription, Text, TextRef,
    Transact, Update,
};

use crate::id::DocumentId;

/// Name of the shared root text every replica edits.
pub const TEXT_ROOT: &str = "content";

/// Engine errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// Update bytes, a state vector, or a local edit that cannot be applied.
    #[error("malformed operation: {0}")]
    MalformedOperation(String),
    /// The underlying document was borrowed while registering observers.
    #[error("document busy: {0}")]
    Busy(String),
}

/// A local edit expressed against the current text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalOp {
    Insert { index: u32, text: String },
    Delete { index: u32, len: u32 },
}

impl LocalOp {
    pub fn insert(index: u32, text: impl Into<String>) -> Self {
        LocalOp::Insert { index, text: text.into() }
    }

    pub fn delete(index: u32, len: u32) -> Self {
        LocalOp::Delete { index, len }
    }
}

/// Result of merging a remote update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeOutcome {
    /// `false` when every block in the update was already integrated
    /// (duplicate delivery) or is still waiting for missing dependencies.
    pub changed: bool,
    /// Logical version after the merge.
    pub version: u64,
}

/// Immutable copy of a document's converged state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub document_id: DocumentId,
    /// Full state encoded as a yrs v1 update.
    pub state: Vec<u8>,
    pub version: u64,
}

/// Size of the encoded state before and after [`DocumentEngine::compact`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionStats {
    pub before_bytes: usize,
    pub after_bytes: usize,
}

/// Mergeable state of one document.
pub struct DocumentEngine {
    id: DocumentId,
    doc: Doc,
    text: TextRef,
    /// Bumped by the update observer once per transaction that changed state.
    version: Arc<AtomicU64>,
    _updates: Subscription,
}

impl DocumentEngine {
    /// Empty document with a random client id.
    pub fn new(id: DocumentId) -> Result<Self, EngineError> {
        Self::build(id, Self::options(None), None, 0)
    }

    /// Empty document with a fixed client id (tie-break order is by client id).
    pub fn with_client_id(id: DocumentId, client_id: u64) -> Result<Self, EngineError> {
        Self::build(id, Self::options(Some(client_id)), None, 0)
    }

    /// Restore a document from a persisted full-state update.
    pub fn from_snapshot(id: DocumentId, state: &[u8], version: u64) -> Result<Self, EngineError> {
        Self::build(id, Self::options(None), Some(state), version)
    }

    fn options(client_id: Option<u64>) -> Options {
        let mut options = Options::default();
        if let Some(client_id) = client_id {
            options.client_id = client_id;
        }
        options.offset_kind = OffsetKind::Utf16;
        options
    }

    fn build(
        id: DocumentId,
        options: Options,
        state: Option<&[u8]>,
        version: u64,
    ) -> Result<Self, EngineError> {
        let doc = Doc::with_options(options);
        let text = doc.get_or_insert_text(TEXT_ROOT);

        // Apply the base state before observing so it does not count as an edit.
        if let Some(state) = state {
            let update = Update::decode_v1(state)
                .map_err(|e| EngineError::MalformedOperation(e.to_string()))?;
            let mut txn = doc.transact_mut();
            txn.apply_update(update)
                .map_err(|e| EngineError::MalformedOperation(e.to_string()))?;
        }

        let version = Arc::new(AtomicU64::new(version));
        let counter = Arc::clone(&version);
        let subscription = doc
            .observe_update_v1(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .map_err(|e| EngineError::Busy(format!("{e:?}")))?;

        Ok(Self {
            id,
            doc,
            text,
            version,
            _updates: subscription,
        })
    }

    /// Apply an edit made on this replica and return the update to broadcast.
    pub fn apply_local(&mut self, op: &LocalOp) -> Result<Vec<u8>, EngineError> {
        let mut txn = self.doc.transact_mut();
        let len = self.text.len(&txn);
        match op {
            LocalOp::Insert { index, text } => {
                if *index > len {
                    return Err(EngineError::MalformedOperation(format!(
                        "insert at {index} beyond end of text ({len})"
                    )));
                }
                self.text.insert(&mut txn, *index, text);
            }
            LocalOp::Delete { index, len: count } => {
                let end = index.checked_add(*count);
                if end.map_or(true, |end| end > len) {
                    return Err(EngineError::MalformedOperation(format!(
                        "delete {count} at {index} beyond end of text ({len})"
                    )));
                }
                self.text.remove_range(&mut txn, *index, *count);
            }
        }
        Ok(txn.encode_update_v1())
    }

    /// Merge an update produced by another replica.
    pub fn apply_remote(&mut self, update: &[u8]) -> Result<MergeOutcome, EngineError> {
        let decoded = Update::decode_v1(update)
            .map_err(|e| EngineError::MalformedOperation(e.to_string()))?;
        let before = self.version();
        {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(decoded)
                .map_err(|e| EngineError::MalformedOperation(e.to_string()))?;
        }
        let version = self.version();
        Ok(MergeOutcome {
            changed: version != before,
            version,
        })
    }

    /// Encoded (v1) state vector of this replica.
    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Everything this replica has that a replica at `remote_state_vector` lacks.
    pub fn encode_update_since(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>, EngineError> {
        let sv = StateVector::decode_v1(remote_state_vector)
            .map_err(|e| EngineError::MalformedOperation(format!("state vector: {e}")))?;
        let txn = self.doc.transact();
        Ok(txn.encode_state_as_update_v1(&sv))
    }

    /// Full state as a single update (equivalent to `encode_update_since(empty)`).
    pub fn encoded_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            document_id: self.id.clone(),
            state: self.encoded_state(),
            version: self.version(),
        }
    }

    /// Rebuild the document from its own encoded state.
    ///
    /// Adjacent blocks are squashed and deleted content stays collected, so
    /// the encoding can only shrink. Text, state vector and client id are
    /// unchanged.
    pub fn compact(&mut self) -> Result<CompactionStats, EngineError> {
        let state = self.encoded_state();
        let client_id = self.doc.client_id();
        let rebuilt = Self::build(
            self.id.clone(),
            Self::options(Some(client_id)),
            Some(&state),
            self.version(),
        )?;
        let after_bytes = rebuilt.encoded_state().len();
        *self = rebuilt;
        log::debug!(
            "Compacted document {}: {} -> {} bytes",
            self.id,
            state.len(),
            after_bytes
        );
        Ok(CompactionStats {
            before_bytes: state.len(),
            after_bytes,
        })
    }

    /// Current text content.
    pub fn text(&self) -> String {
        let txn = self.doc.transact();
        self.text.get_string(&txn)
    }

    /// Text length in UTF-16 code units.
    pub fn len(&self) -> u32 {
        let txn = self.doc.transact();
        self.text.len(&txn)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    pub fn client_id(&self) -> u64 {
        self.doc.client_id()
    }

    pub fn document_id(&self) -> &DocumentId {
        &self.id
    }
}

impl std::fmt::Debug for DocumentEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentEngine")
            .field("id", &self.id)
            .field("client_id", &self.client_id())
            .field("version", &self.version())
            .finish()
    }
}
