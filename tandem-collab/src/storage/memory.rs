//! In-process store for tests and ephemeral deployments.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tandem_core::DocumentId;

use super::{SnapshotStore, StoreError, StoredSnapshot};

/// Snapshot map behind a mutex. Can be switched to "unavailable" to
/// exercise the flush retry path.
#[derive(Debug)]
pub struct MemoryStore {
    snapshots: Mutex<HashMap<DocumentId, StoredSnapshot>>,
    available: AtomicBool,
    saves: AtomicU64,
    failed_saves: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            snapshots: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            saves: AtomicU64::new(0),
            failed_saves: AtomicU64::new(0),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of successful saves.
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::SeqCst)
    }

    /// Number of saves rejected while unavailable.
    pub fn failed_save_count(&self) -> u64 {
        self.failed_saves.load(Ordering::SeqCst)
    }

    /// Current persisted snapshot, without going through the availability switch.
    pub fn get(&self, document_id: &DocumentId) -> Option<StoredSnapshot> {
        self.lock().ok()?.get(document_id).cloned()
    }

    /// Seed a snapshot directly.
    pub fn insert(&self, document_id: DocumentId, state: Vec<u8>, version: u64) {
        if let Ok(mut map) = self.lock() {
            map.insert(document_id, StoredSnapshot { state, version });
        }
    }

    pub fn len(&self) -> usize {
        self.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<DocumentId, StoredSnapshot>>, StoreError> {
        self.snapshots
            .lock()
            .map_err(|_| StoreError::Database("memory store mutex poisoned".into()))
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store switched off".into()))
        }
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn load_snapshot(&self, document_id: &DocumentId) -> Result<StoredSnapshot, StoreError> {
        self.check_available()?;
        self.lock()?
            .get(document_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(document_id.clone()))
    }

    async fn save_snapshot(
        &self,
        document_id: &DocumentId,
        state: &[u8],
        version: u64,
    ) -> Result<(), StoreError> {
        if let Err(e) = self.check_available() {
            self.failed_saves.fetch_add(1, Ordering::SeqCst);
            return Err(e);
        }
        let mut map = self.lock()?;
        // Never let an older flush overwrite a newer one.
        if map.get(document_id).is_some_and(|s| s.version > version) {
            return Ok(());
        }
        map.insert(
            document_id.clone(),
            StoredSnapshot {
                state: state.to_vec(),
                version,
            },
        );
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
