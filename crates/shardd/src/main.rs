//! shardd — Shard chunked file replication daemon.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use shard_core::config::ShardConfig;
use shard_services::{FileLibrary, PeerTransport, ReceiveListener, TransportConfig};

const STATUS_INTERVAL: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    let config = match std::env::args().nth(1).map(PathBuf::from) {
        Some(path) => ShardConfig::load_from(&path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => {
            if let Err(e) = ShardConfig::write_default_if_missing() {
                tracing::warn!(error = %e, "failed to write default config");
            }
            ShardConfig::load().unwrap_or_else(|e| {
                tracing::warn!(error = %e, "failed to load config, using defaults");
                ShardConfig::default()
            })
        }
    };
    tracing::info!(node = config.node.id, peers = config.peers.len(), "shardd starting");

    // Storage
    let library = FileLibrary::new(&config.storage.root)
        .context("failed to open storage root")?
        .with_max_file_size(config.storage.max_file_size);
    let imported = library
        .import_root()
        .await
        .context("failed to scan storage root")?;
    tracing::info!(root = %config.storage.root.display(), imported, "file library ready");

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Transport ────────────────────────────────────────────────────────────
    let transport = Arc::new(PeerTransport::new(
        TransportConfig::from(&config.transport),
        config.peers.clone(),
    ));
    transport
        .start()
        .await
        .context("failed to start peer transport")?;

    // ── Inbound ──────────────────────────────────────────────────────────────
    let listener = ReceiveListener::bind(
        (config.node.listen_addr.as_str(), config.node.listen_port),
        library.clone(),
        shutdown_tx.subscribe(),
    )
    .await
    .with_context(|| {
        format!(
            "failed to bind {}:{}",
            config.node.listen_addr, config.node.listen_port
        )
    })?;
    tracing::info!(addr = %listener.local_addr()?, "listening for peers");
    let listener_task = tokio::spawn(listener.run());

    let status_printer = {
        let transport = transport.clone();
        let library = library.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(STATUS_INTERVAL);
            loop {
                interval.tick().await;
                let stats = transport.stats();
                tracing::info!(
                    submitted = stats.submitted,
                    routed = stats.routed,
                    dropped_unknown = stats.dropped_unknown,
                    dropped_closed = stats.dropped_closed,
                    "transport snapshot"
                );
                for id in transport.peer_ids() {
                    if let Some(s) = transport.peer_status(id) {
                        tracing::info!(
                            peer = s.peer,
                            state = ?s.state,
                            sent = s.sent,
                            failed = s.failed,
                            dropped_backoff = s.dropped_backoff,
                            "  peer"
                        );
                    }
                }
                for p in library.progress().await {
                    tracing::info!(
                        file = %p.file_name,
                        complete = p.complete_chunks,
                        total = p.total_chunks,
                        "  file"
                    );
                }
            }
        })
    };

    // ── Wait for exit ────────────────────────────────────────────────────────
    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv()  => tracing::info!("shutting down"),
        r = listener_task       => tracing::error!("receive listener exited: {:?}", r),
        r = status_printer      => tracing::error!("status printer exited: {:?}", r),
    }

    let _ = shutdown_tx.send(());
    transport.shutdown().await;
    Ok(())
}
