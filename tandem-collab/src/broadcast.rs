//! Fan-out of encoded frames to every session on one document.
//!
//! One tokio broadcast channel per document; every attached session holds
//! a [`SessionReceiver`]. Frames are encoded once and shared behind an
//! `Arc`. The excluded session (usually the originator) filters its own
//! frames on receive.
//!
//! A receiver that falls more than `capacity` frames behind observes
//! `Lagged`; the connection handler resyncs it with the full state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub receivers: usize,
}

/// Lock-free counters shared by the group and its receivers.
#[derive(Debug, Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// One frame in flight.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Session that must not receive this frame.
    pub exclude: Option<Uuid>,
    pub bytes: Arc<Vec<u8>>,
}

/// A broadcast group for a single document.
#[derive(Debug)]
pub struct BroadcastGroup {
    sender: broadcast::Sender<Envelope>,
    capacity: usize,
    stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    /// `capacity` frames are buffered per receiver before it lags.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity: capacity.max(1),
            stats: Arc::new(AtomicBroadcastStats::default()),
        }
    }

    /// Subscribe a session. Frames sent before this call are not delivered.
    pub fn subscribe(&self, session_id: Uuid) -> SessionReceiver {
        SessionReceiver {
            session_id,
            rx: self.sender.subscribe(),
            stats: Arc::clone(&self.stats),
        }
    }

    /// Send pre-encoded bytes to every receiver except `exclude`.
    /// Returns the number of live receivers (including the excluded one).
    pub fn send(&self, bytes: Arc<Vec<u8>>, exclude: Option<Uuid>) -> usize {
        let count = self.sender.send(Envelope { exclude, bytes }).unwrap_or(0);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            receivers: self.sender.receiver_count(),
        }
    }
}

/// Receiving end held by one session. Dropping it stops delivery at once.
#[derive(Debug)]
pub struct SessionReceiver {
    session_id: Uuid,
    rx: broadcast::Receiver<Envelope>,
    stats: Arc<AtomicBroadcastStats>,
}

impl SessionReceiver {
    /// Next frame addressed to this session.
    ///
    /// `Err(Lagged(n))` means `n` frames were lost; the receiver stays usable.
    /// `Err(Closed)` means the document was dropped.
    pub async fn recv(&mut self) -> Result<Arc<Vec<u8>>, RecvError> {
        loop {
            match self.rx.recv().await {
                Ok(envelope) if envelope.exclude == Some(self.session_id) => continue,
                Ok(envelope) => return Ok(envelope.bytes),
                Err(RecvError::Lagged(n)) => {
                    self.stats.messages_dropped.fetch_add(n, Ordering::Relaxed);
                    return Err(RecvError::Lagged(n));
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }
}
