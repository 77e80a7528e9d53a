//! Per-peer and transport-wide counters, with plain snapshots for callers.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use shard_core::PeerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

/// Live counters shared between a worker and the transport.
#[derive(Debug, Default)]
pub struct PeerCounters {
    connected: AtomicBool,
    pub(crate) connect_attempts: AtomicU64,
    pub(crate) reconnects: AtomicU64,
    pub(crate) sent: AtomicU64,
    pub(crate) failed: AtomicU64,
    pub(crate) dropped_backoff: AtomicU64,
}

impl PeerCounters {
    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, peer: PeerId) -> PeerStatus {
        PeerStatus {
            peer,
            state: if self.connected.load(Ordering::Relaxed) {
                ConnectionState::Connected
            } else {
                ConnectionState::Disconnected
            },
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped_backoff: self.dropped_backoff.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of one peer worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStatus {
    pub peer: PeerId,
    pub state: ConnectionState,
    /// Connects tried, including the one made when the peer was added.
    pub connect_attempts: u64,
    /// Successful connects made on the send path.
    pub reconnects: u64,
    pub sent: u64,
    /// Envelopes lost to a failed connect or write.
    pub failed: u64,
    /// Envelopes dropped while the reconnect backoff window was open.
    pub dropped_backoff: u64,
}

#[derive(Debug, Default)]
pub struct TransportCounters {
    pub(crate) submitted: AtomicU64,
    pub(crate) routed: AtomicU64,
    pub(crate) dropped_unknown: AtomicU64,
    pub(crate) dropped_closed: AtomicU64,
}

impl TransportCounters {
    pub fn snapshot(&self) -> TransportStats {
        TransportStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            routed: self.routed.load(Ordering::Relaxed),
            dropped_unknown: self.dropped_unknown.load(Ordering::Relaxed),
            dropped_closed: self.dropped_closed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub submitted: u64,
    pub routed: u64,
    /// No worker registered for the recipient.
    pub dropped_unknown: u64,
    /// The recipient's worker had already stopped.
    pub dropped_closed: u64,
}
