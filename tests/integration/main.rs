//! Shard integration test harness.
//!
//! Everything runs in-process over loopback TCP. A `Sink` stands in for a
//! remote peer: it accepts connections and hands every decoded envelope to
//! the test.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};

use shard_core::{Envelope, PeerRecord};
use shard_services::transport::frame;
use shard_services::TransportConfig;

mod store;
mod transport;

// ── Harness ───────────────────────────────────────────────────────────────────

static DIR_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Fresh, empty directory under the system temp dir.
pub fn temp_dir(tag: &str) -> PathBuf {
    let id = DIR_COUNTER.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir().join(format!("shard-it-{tag}-{}-{id}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// Short timeouts so failure paths resolve quickly.
pub fn quick_config() -> TransportConfig {
    TransportConfig {
        connect_timeout: Duration::from_millis(500),
        write_timeout: Duration::from_millis(500),
        backoff_base: Duration::from_millis(10),
        backoff_max: Duration::from_millis(20),
        shutdown_grace: Duration::from_millis(500),
    }
}

/// A port nothing is listening on right now.
pub fn free_port() -> u16 {
    let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    probe.local_addr().unwrap().port()
}

/// Loopback stand-in for a remote peer.
pub struct Sink {
    pub addr: SocketAddr,
    pub rx: mpsc::UnboundedReceiver<Envelope>,
    /// Connections accepted so far.
    pub accepted: Arc<AtomicUsize>,
    /// Connections that ended because the remote side closed them.
    pub closed_by_peer: Arc<AtomicUsize>,
    kick: broadcast::Sender<()>,
}

impl Sink {
    pub async fn bind(port: u16) -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .context("failed to bind sink")?;
        let addr = listener.local_addr()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let (kick, _) = broadcast::channel(4);
        let accepted = Arc::new(AtomicUsize::new(0));
        let closed_by_peer = Arc::new(AtomicUsize::new(0));

        {
            let accepted = accepted.clone();
            let closed_by_peer = closed_by_peer.clone();
            let kick = kick.clone();
            tokio::spawn(async move {
                while let Ok((mut stream, _)) = listener.accept().await {
                    accepted.fetch_add(1, Ordering::SeqCst);
                    let tx = tx.clone();
                    let closed_by_peer = closed_by_peer.clone();
                    let mut kicked = kick.subscribe();
                    tokio::spawn(async move {
                        loop {
                            tokio::select! {
                                _ = kicked.recv() => return,
                                next = frame::read_envelope(&mut stream) => match next {
                                    Ok(Some(env)) => {
                                        let _ = tx.send(env);
                                    }
                                    _ => {
                                        closed_by_peer.fetch_add(1, Ordering::SeqCst);
                                        return;
                                    }
                                },
                            }
                        }
                    });
                }
            });
        }

        Ok(Self {
            addr,
            rx,
            accepted,
            closed_by_peer,
            kick,
        })
    }

    pub async fn any_port() -> Result<Self> {
        Self::bind(0).await
    }

    pub fn record(&self, id: u32) -> PeerRecord {
        PeerRecord::new(id, "127.0.0.1", self.addr.port())
    }

    /// Drop every open connection from the server side.
    pub fn kick(&self) {
        let _ = self.kick.send(());
    }

    pub async fn next(&mut self) -> Option<Envelope> {
        tokio::time::timeout(Duration::from_secs(5), self.rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Nothing more arrives within `window`.
    pub async fn quiet_for(&mut self, window: Duration) -> bool {
        tokio::time::timeout(window, self.rx.recv()).await.is_err()
    }
}

/// Poll `check` until it holds or five seconds pass.
pub async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
