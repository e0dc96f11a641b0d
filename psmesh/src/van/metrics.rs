//! Traffic counters of a van.
//!
//! Counters are updated from several tasks without coordination, so they use
//! `Relaxed` atomics; [`VanMetrics::snapshot`] is only approximately
//! consistent across fields.

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters shared by the van's tasks.
#[derive(Debug, Default)]
pub struct VanMetrics {
    sent_bytes: AtomicU64,
    sent_messages: AtomicU64,
    recv_bytes: AtomicU64,
    recv_messages: AtomicU64,
    dropped: AtomicU64,
    duplicates: AtomicU64,
    resent: AtomicU64,
    send_failures: AtomicU64,
}

impl VanMetrics {
    pub(crate) fn record_send(&self, bytes: usize) {
        self.sent_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.sent_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_recv(&self, bytes: usize) {
        self.recv_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.recv_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_drop(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_resend(&self) {
        self.resent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_send_failure(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the current values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sent_bytes: self.sent_bytes.load(Ordering::Relaxed),
            sent_messages: self.sent_messages.load(Ordering::Relaxed),
            recv_bytes: self.recv_bytes.load(Ordering::Relaxed),
            recv_messages: self.recv_messages.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            resent: self.resent.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`VanMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Bytes handed to connections, loopback included.
    pub sent_bytes: u64,
    /// Messages handed to connections, loopback included.
    pub sent_messages: u64,
    /// Bytes read from peers.
    pub recv_bytes: u64,
    /// Frames read from peers.
    pub recv_messages: u64,
    /// Received messages discarded by the debug drop rate.
    pub dropped: u64,
    /// Received messages discarded as duplicates.
    pub duplicates: u64,
    /// Retransmissions.
    pub resent: u64,
    /// Sends given up after exhausting retries or losing the connection.
    pub send_failures: u64,
}
