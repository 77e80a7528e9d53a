//! Dispatcher — routes submitted envelopes to the recipient's worker queue.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};

use shard_core::Envelope;

use super::status::{PeerCounters, TransportCounters};
use super::PeerTable;

pub struct Dispatcher {
    peers: PeerTable,
    rx: mpsc::UnboundedReceiver<Envelope>,
    counters: Arc<TransportCounters>,
    shutdown: broadcast::Receiver<()>,
}

impl Dispatcher {
    pub fn new(
        peers: PeerTable,
        rx: mpsc::UnboundedReceiver<Envelope>,
        counters: Arc<TransportCounters>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            peers,
            rx,
            counters,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.recv() => {
                    tracing::debug!("dispatcher shutting down");
                    return;
                }

                next = self.rx.recv() => match next {
                    Some(envelope) => self.route(envelope),
                    None => {
                        tracing::debug!("submit channel closed, dispatcher exiting");
                        return;
                    }
                },
            }
        }
    }

    fn route(&self, envelope: Envelope) {
        let recipient = envelope.recipient;
        let Some(handle) = self.peers.get(&recipient) else {
            PeerCounters::bump(&self.counters.dropped_unknown);
            tracing::warn!(peer = recipient, kind = envelope.kind, "no worker for recipient, dropping envelope");
            return;
        };

        if handle.tx.send(envelope).is_err() {
            PeerCounters::bump(&self.counters.dropped_closed);
            tracing::debug!(peer = recipient, "worker already stopped, dropping envelope");
        } else {
            PeerCounters::bump(&self.counters.routed);
        }
    }
}
