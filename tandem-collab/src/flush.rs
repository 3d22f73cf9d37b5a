//! Background persistence: flushes dirty documents on a timer (and early
//! when a document loses its last session), then evicts idle ones.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::session::SessionManager;

/// Handle to the flusher task.
pub struct FlushHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
    manager: Arc<SessionManager>,
}

impl FlushHandle {
    /// Stop the task and write every remaining dirty document.
    /// Returns how many documents the final pass wrote.
    pub async fn shutdown(self) -> usize {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.task.await {
            log::error!("Flusher task ended abnormally: {e}");
        }
        let flushed = self.manager.flush_dirty().await;
        log::info!("Final flush wrote {flushed} documents");
        flushed
    }
}

/// Spawn the flush/evict loop for `manager`.
pub fn spawn_flusher(manager: Arc<SessionManager>) -> FlushHandle {
    let (stop_tx, mut stop_rx) = watch::channel(false);
    let interval = manager.config().flush_interval;
    let task_manager = manager.clone();

    let task = tokio::spawn(async move {
        let manager = task_manager;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        log::debug!("Flusher started, interval {interval:?}");

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = manager.flush_requested() => {}
                _ = stop_rx.changed() => break,
            }

            let flushed = manager.flush_dirty().await;
            if flushed > 0 {
                log::debug!("Flushed {flushed} documents");
            }
            manager.evict_idle().await;
        }
        log::debug!("Flusher stopped");
    });

    FlushHandle {
        stop_tx,
        task,
        manager,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AccessGrant, DocumentScope, Permissions, StaticTokenAuthenticator};
    use crate::config::ServerConfig;
    use crate::storage::MemoryStore;
    use std::time::Duration;
    use tandem_core::{DocumentId, LocalOp};

    fn setup() -> (Arc<SessionManager>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let auth = StaticTokenAuthenticator::new().with_token(
            "t-alice",
            AccessGrant::new("alice", Permissions::read_write(DocumentScope::All)),
        );
        let manager = SessionManager::new(ServerConfig::for_testing(), Arc::new(auth), store.clone());
        (Arc::new(manager), store)
    }

    #[tokio::test]
    async fn test_periodic_flush() {
        let (manager, store) = setup();
        let id: DocumentId = "acme/doc1".parse().unwrap();
        let handle = spawn_flusher(manager.clone());

        manager.apply_local(&id, &LocalOp::insert(0, "tick")).await.unwrap();
        tokio::time::sleep(manager.config().flush_interval * 4).await;
        assert_eq!(store.get(&id).map(|s| s.version), Some(1));

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_flushes_remaining() {
        let (manager, store) = setup();
        let id: DocumentId = "acme/doc1".parse().unwrap();
        let handle = spawn_flusher(manager.clone());
        // Give the first immediate tick a chance to run on the clean state.
        tokio::time::sleep(Duration::from_millis(5)).await;

        manager.apply_local(&id, &LocalOp::insert(0, "late")).await.unwrap();
        handle.shutdown().await;
        assert!(store.get(&id).is_some());
    }

    #[tokio::test]
    async fn test_idle_document_evicted() {
        let (manager, store) = setup();
        let id: DocumentId = "acme/doc1".parse().unwrap();
        let handle = spawn_flusher(manager.clone());

        let a = manager.attach(&id, "alice", "t-alice").await.unwrap();
        manager.apply_local(&id, &LocalOp::insert(0, "bye")).await.unwrap();
        manager.detach(&a.session).await.unwrap();

        let config = manager.config();
        tokio::time::sleep(config.eviction_grace + config.flush_interval * 4).await;
        assert!(!manager.is_loaded(&id).await);
        assert_eq!(store.get(&id).map(|s| s.version), Some(1));

        handle.shutdown().await;
    }
}
