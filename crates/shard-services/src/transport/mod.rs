//! Peer transport — one dispatcher plus one worker task per known peer.
//!
//! `submit` feeds a single unbounded queue drained by the [`Dispatcher`],
//! which forwards each envelope to the worker registered for its recipient.
//! Workers keep a lazily (re)opened TCP connection to their peer and write
//! envelopes in FIFO order. Failures are logged and counted, never
//! propagated back to `submit` callers.

mod backoff;
mod dispatch;
pub mod frame;
mod status;
mod worker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

use shard_core::config::TransportSettings;
use shard_core::{Envelope, PeerId, PeerRecord};

pub use backoff::Backoff;
pub use dispatch::Dispatcher;
pub use status::{ConnectionState, PeerCounters, PeerStatus, TransportCounters, TransportStats};
pub use worker::PeerWorker;

/// Runtime transport settings.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub connect_timeout: Duration,
    pub write_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub shutdown_grace: Duration,
}

impl From<&TransportSettings> for TransportConfig {
    fn from(s: &TransportSettings) -> Self {
        Self {
            connect_timeout: s.connect_timeout(),
            write_timeout: s.write_timeout(),
            backoff_base: s.backoff_base(),
            backoff_max: s.backoff_max(),
            shutdown_grace: s.shutdown_grace(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::from(&TransportSettings::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("transport has been shut down")]
    Closed,

    #[error("transport has not been started")]
    NotStarted,
}

/// Registry entry for one running worker.
pub struct PeerHandle {
    pub(crate) tx: mpsc::UnboundedSender<Envelope>,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
    status: Arc<PeerCounters>,
}

impl PeerHandle {
    fn signal_stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

/// Registry of workers, keyed by peer id.
pub type PeerTable = Arc<DashMap<PeerId, PeerHandle>>;

pub struct PeerTransport {
    config: TransportConfig,
    roster: Vec<PeerRecord>,
    peers: PeerTable,
    submit_tx: mpsc::UnboundedSender<Envelope>,
    submit_rx: Mutex<Option<mpsc::UnboundedReceiver<Envelope>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
    counters: Arc<TransportCounters>,
    started: AtomicBool,
    closed: AtomicBool,
}

impl PeerTransport {
    pub fn new(config: TransportConfig, roster: Vec<PeerRecord>) -> Self {
        let (submit_tx, submit_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            roster,
            peers: Arc::new(DashMap::new()),
            submit_tx,
            submit_rx: Mutex::new(Some(submit_rx)),
            dispatcher: Mutex::new(None),
            shutdown_tx,
            counters: Arc::new(TransportCounters::default()),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Add every roster peer and start the dispatcher. Calling it again is a
    /// no-op.
    pub async fn start(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let Some(rx) = self.submit_rx.lock().await.take() else {
            return Ok(());
        };

        for record in self.roster.clone() {
            self.add_peer(record).await?;
        }

        let dispatcher = Dispatcher::new(
            self.peers.clone(),
            rx,
            self.counters.clone(),
            self.shutdown_tx.subscribe(),
        );
        *self.dispatcher.lock().await = Some(tokio::spawn(dispatcher.run()));
        self.started.store(true, Ordering::Release);

        tracing::info!(peers = self.peers.len(), "peer transport started");
        Ok(())
    }

    /// Queue an envelope for delivery. Never blocks.
    pub fn submit(&self, envelope: Envelope) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        if !self.started.load(Ordering::Acquire) {
            return Err(TransportError::NotStarted);
        }
        self.submit_tx
            .send(envelope)
            .map_err(|_| TransportError::Closed)?;
        PeerCounters::bump(&self.counters.submitted);
        Ok(())
    }

    /// Register a peer and start its worker, replacing any worker already
    /// registered under the same id. One connect is attempted immediately;
    /// if it fails the worker starts disconnected.
    pub async fn add_peer(&self, record: PeerRecord) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }

        let status = Arc::new(PeerCounters::default());
        PeerCounters::bump(&status.connect_attempts);
        let conn = match worker::connect(&record, self.config.connect_timeout).await {
            Ok(stream) => {
                tracing::info!(peer = record.id, addr = %record.full_address(), "peer connected");
                Some(stream)
            }
            Err(e) => {
                tracing::warn!(
                    peer = record.id,
                    addr = %record.full_address(),
                    error = %e,
                    "initial connect failed, will retry on next send"
                );
                None
            }
        };
        self.register(record, conn, status)
    }

    /// Spawn the worker for `record` and publish its handle. A shutdown that
    /// ran while the handle was being built has already drained the table,
    /// so the closed flag is checked again once the handle is visible.
    fn register(
        &self,
        record: PeerRecord,
        conn: Option<TcpStream>,
        status: Arc<PeerCounters>,
    ) -> Result<(), TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel();
        let id = record.id;
        let worker = PeerWorker::new(
            record,
            conn,
            rx,
            self.config.clone(),
            status.clone(),
        );
        let task = tokio::spawn(worker.run(stop_rx, self.shutdown_tx.subscribe()));

        let handle = PeerHandle {
            tx,
            stop: Some(stop_tx),
            task,
            status,
        };
        if let Some(mut old) = self.peers.insert(id, handle) {
            tracing::debug!(peer = id, "replacing existing peer worker");
            old.signal_stop();
        }
        if self.closed.load(Ordering::SeqCst) {
            if let Some((_, mut handle)) = self.peers.remove(&id) {
                handle.signal_stop();
            }
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    /// Deregister a peer. Its worker discards anything still queued and
    /// closes its connection. Returns false if the id was unknown.
    pub fn remove_peer(&self, id: PeerId) -> bool {
        match self.peers.remove(&id) {
            Some((_, mut handle)) => {
                handle.signal_stop();
                tracing::info!(peer = id, "peer removed");
                true
            }
            None => false,
        }
    }

    /// Stop the dispatcher and every worker. In-flight deliveries are
    /// cancelled; workers that outlive the grace period are aborted.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(());

        let ids: Vec<PeerId> = self.peers.iter().map(|e| *e.key()).collect();
        let mut tasks = Vec::with_capacity(ids.len() + 1);
        for id in ids {
            if let Some((_, mut handle)) = self.peers.remove(&id) {
                handle.signal_stop();
                tasks.push((Some(id), handle.task));
            }
        }
        if let Some(task) = self.dispatcher.lock().await.take() {
            tasks.push((None, task));
        }

        for (peer, mut task) in tasks {
            if tokio::time::timeout(self.config.shutdown_grace, &mut task)
                .await
                .is_err()
            {
                tracing::warn!(?peer, "task did not stop within grace period, aborting");
                task.abort();
            }
        }
        tracing::info!("peer transport shut down");
    }

    /// Registered peer ids, sorted.
    pub fn peer_ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.peers.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    pub fn peer_status(&self, id: PeerId) -> Option<PeerStatus> {
        self.peers.get(&id).map(|h| h.status.snapshot(id))
    }

    pub fn stats(&self) -> TransportStats {
        self.counters.snapshot()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
