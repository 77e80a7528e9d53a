//! Peer worker — owns one peer's queue and TCP connection.
//!
//! Delivery is at-most-once: an envelope whose connect or write fails is
//! logged, counted and dropped. Nothing is requeued.

use std::io;
use std::mem::MaybeUninit;
use std::sync::Arc;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};

use shard_core::{wire, Envelope, PeerRecord};

use super::backoff::Backoff;
use super::frame;
use super::status::PeerCounters;
use super::TransportConfig;

const KEEPALIVE_IDLE: Duration = Duration::from_secs(30);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

pub struct PeerWorker {
    peer: PeerRecord,
    conn: Option<TcpStream>,
    rx: mpsc::UnboundedReceiver<Envelope>,
    config: TransportConfig,
    backoff: Backoff,
    status: Arc<PeerCounters>,
}

impl PeerWorker {
    pub fn new(
        peer: PeerRecord,
        conn: Option<TcpStream>,
        rx: mpsc::UnboundedReceiver<Envelope>,
        config: TransportConfig,
        status: Arc<PeerCounters>,
    ) -> Self {
        status.set_connected(conn.is_some());
        let backoff = Backoff::new(config.backoff_base, config.backoff_max);
        Self {
            peer,
            conn,
            rx,
            config,
            backoff,
            status,
        }
    }

    /// Deliver queued envelopes in FIFO order until stopped.
    ///
    /// A stop or shutdown signal also cancels a delivery that is in flight.
    pub async fn run(
        mut self,
        mut stop: oneshot::Receiver<()>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            let envelope = tokio::select! {
                biased;
                _ = &mut stop => break,
                _ = shutdown.recv() => break,
                next = self.rx.recv() => match next {
                    Some(envelope) => envelope,
                    None => break,
                },
            };

            tokio::select! {
                biased;
                _ = &mut stop => break,
                _ = shutdown.recv() => break,
                _ = self.deliver(envelope) => {}
            }
        }

        let discarded = self.discard_queue();
        self.close().await;
        tracing::debug!(peer = self.peer.id, discarded, "peer worker stopped");
    }

    async fn deliver(&mut self, envelope: Envelope) {
        if self.conn.as_ref().is_some_and(|c| !is_usable(c)) {
            tracing::debug!(peer = self.peer.id, "connection closed by peer");
            self.close().await;
        }

        if self.conn.is_none() {
            if let Some(left) = self.backoff.remaining() {
                PeerCounters::bump(&self.status.dropped_backoff);
                tracing::debug!(
                    peer = self.peer.id,
                    retry_in_ms = left.as_millis() as u64,
                    "in reconnect backoff, dropping envelope"
                );
                return;
            }

            PeerCounters::bump(&self.status.connect_attempts);
            match connect(&self.peer, self.config.connect_timeout).await {
                Ok(stream) => {
                    tracing::debug!(peer = self.peer.id, addr = %self.peer.full_address(), "connected");
                    self.backoff.reset();
                    PeerCounters::bump(&self.status.reconnects);
                    self.status.set_connected(true);
                    self.conn = Some(stream);
                }
                Err(e) => {
                    let delay = self.backoff.record_failure();
                    PeerCounters::bump(&self.status.failed);
                    tracing::warn!(
                        peer = self.peer.id,
                        addr = %self.peer.full_address(),
                        error = %e,
                        backoff_ms = delay.as_millis() as u64,
                        "connect failed, dropping envelope"
                    );
                    return;
                }
            }
        }

        let encoded = match wire::encode_envelope(&envelope) {
            Ok(encoded) => encoded,
            Err(e) => {
                PeerCounters::bump(&self.status.failed);
                tracing::warn!(peer = self.peer.id, error = %e, "cannot frame envelope, dropping");
                return;
            }
        };

        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        let written =
            tokio::time::timeout(self.config.write_timeout, frame::write_frame(conn, &encoded)).await;
        match written {
            Ok(Ok(())) => {
                PeerCounters::bump(&self.status.sent);
                tracing::trace!(
                    peer = self.peer.id,
                    kind = envelope.kind,
                    len = envelope.payload.len(),
                    "envelope sent"
                );
            }
            Ok(Err(e)) => self.write_failed(&e.to_string()).await,
            Err(_) => self.write_failed("write timed out").await,
        }
    }

    async fn write_failed(&mut self, error: &str) {
        PeerCounters::bump(&self.status.failed);
        tracing::warn!(peer = self.peer.id, error, "write failed, dropping envelope");
        self.close().await;
    }

    fn discard_queue(&mut self) -> usize {
        self.rx.close();
        let mut discarded = 0;
        while self.rx.try_recv().is_ok() {
            discarded += 1;
        }
        discarded
    }

    async fn close(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            let _ = conn.shutdown().await;
        }
        self.status.set_connected(false);
    }
}

/// A connection the peer has not closed. The probe peeks, so any bytes the
/// peer did send stay queued on the socket.
fn is_usable(conn: &TcpStream) -> bool {
    let mut probe = [MaybeUninit::<u8>::uninit(); 1];
    match SockRef::from(conn).peek(&mut probe) {
        Ok(n) => n > 0,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => true,
        Err(_) => false,
    }
}

/// Open a connection to `peer`, bounded by `timeout`, and configure it.
pub(crate) async fn connect(peer: &PeerRecord, timeout: Duration) -> io::Result<TcpStream> {
    let stream = tokio::time::timeout(
        timeout,
        TcpStream::connect((peer.address.as_str(), peer.port)),
    )
    .await
    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;

    stream.set_nodelay(true)?;
    let keepalive = TcpKeepalive::new()
        .with_time(KEEPALIVE_IDLE)
        .with_interval(KEEPALIVE_INTERVAL);
    SockRef::from(&stream).set_tcp_keepalive(&keepalive)?;
    Ok(stream)
}
