use std::sync::atomic::{AtomicU64, Ordering};

/// Server-wide counters, updated lock-free on the hot path.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub(crate) connections_total: AtomicU64,
    pub(crate) connections_active: AtomicU64,
    pub(crate) messages_received: AtomicU64,
    pub(crate) messages_sent: AtomicU64,
    pub(crate) bytes_received: AtomicU64,
    pub(crate) bytes_sent: AtomicU64,
    pub(crate) flushes: AtomicU64,
    pub(crate) flush_failures: AtomicU64,
    pub(crate) malformed_operations: AtomicU64,
    pub(crate) auth_failures: AtomicU64,
}

impl ServerStats {
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn decr(counter: &AtomicU64) {
        // Saturate; never wrap below zero.
        let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
            Some(v.saturating_sub(1))
        });
    }

    pub(crate) fn snapshot(&self, sessions_active: usize, documents_active: usize) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            connections_total: load(&self.connections_total),
            connections_active: load(&self.connections_active),
            sessions_active,
            documents_active,
            messages_received: load(&self.messages_received),
            messages_sent: load(&self.messages_sent),
            bytes_received: load(&self.bytes_received),
            bytes_sent: load(&self.bytes_sent),
            flushes: load(&self.flushes),
            flush_failures: load(&self.flush_failures),
            malformed_operations: load(&self.malformed_operations),
            auth_failures: load(&self.auth_failures),
        }
    }
}

/// Point-in-time copy of [`ServerStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub sessions_active: usize,
    pub documents_active: usize,
    pub messages_received: u64,
    pub messages_sent: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub flushes: u64,
    pub flush_failures: u64,
    pub malformed_operations: u64,
    pub auth_failures: u64,
}
