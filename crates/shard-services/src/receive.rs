//! Inbound side — accepts peer connections and applies received envelopes
//! to the local file library.

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::broadcast;

use shard_core::wire::{self, ChunkPayload, WireError, KIND_CHUNK, KIND_FILE_ANNOUNCE};
use shard_core::{ChunkAvailability, Envelope};

use crate::file::{FileLibrary, InsertOutcome, StoreError};
use crate::transport::frame::{self, FrameError};

/// What applying one envelope did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    Announced { file: String },
    Chunk {
        file: String,
        chunk_id: u32,
        outcome: InsertOutcome,
    },
    Ignored { kind: u16 },
}

#[derive(Debug, thiserror::Error)]
pub enum ReceiveError {
    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Apply one envelope to `library`.
///
/// Announcements start tracking the file. A chunk for a file nobody
/// announced is tracked on the spot from the total size it carries.
pub async fn apply(library: &FileLibrary, envelope: Envelope) -> Result<Received, ReceiveError> {
    match envelope.kind {
        KIND_FILE_ANNOUNCE => {
            let meta = wire::decode_announce(&envelope.payload)?;
            let file = meta.file_name.clone();
            library.track(meta).await?;
            Ok(Received::Announced { file })
        }
        KIND_CHUNK => {
            let ChunkPayload { total_size, chunk } = wire::decode_chunk(&envelope.payload)?;
            let file = chunk.file_name().to_string();
            if library.get(&file).is_none() {
                library.check_size(total_size)?;
                library
                    .track(ChunkAvailability::missing(file.clone(), total_size))
                    .await?;
            }
            let chunk_id = chunk.id();
            let outcome = library.insert(chunk).await?;
            Ok(Received::Chunk {
                file,
                chunk_id,
                outcome,
            })
        }
        kind => Ok(Received::Ignored { kind }),
    }
}

pub struct ReceiveListener {
    listener: TcpListener,
    library: FileLibrary,
    shutdown: broadcast::Receiver<()>,
}

impl ReceiveListener {
    pub async fn bind(
        addr: impl ToSocketAddrs,
        library: FileLibrary,
        shutdown: broadcast::Receiver<()>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            library,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until shutdown, one reader task per connection.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("receive listener shutting down");
                    return;
                }

                accepted = self.listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        tracing::debug!(%remote, "inbound connection");
                        tokio::spawn(serve_connection(
                            stream,
                            remote,
                            self.library.clone(),
                            self.shutdown.resubscribe(),
                        ));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                    }
                },
            }
        }
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    remote: SocketAddr,
    library: FileLibrary,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        let next = tokio::select! {
            _ = shutdown.recv() => break,
            next = frame::read_envelope(&mut stream) => next,
        };

        let envelope = match next {
            Ok(Some(envelope)) => envelope,
            Ok(None) => {
                tracing::debug!(%remote, "inbound connection closed");
                break;
            }
            Err(FrameError::Io(e)) => {
                tracing::debug!(%remote, error = %e, "inbound connection failed");
                break;
            }
            Err(FrameError::Wire(e)) => {
                // the stream can no longer be trusted to be frame-aligned
                tracing::warn!(%remote, error = %e, "bad frame, dropping connection");
                break;
            }
        };

        let sender = envelope.sender;
        match apply(&library, envelope).await {
            Ok(Received::Announced { file }) => {
                tracing::info!(peer = sender, file = %file, "file announced");
            }
            Ok(Received::Chunk {
                file,
                chunk_id,
                outcome: InsertOutcome::Completed,
            }) => {
                tracing::info!(peer = sender, file = %file, chunk_id, "file complete");
            }
            Ok(Received::Chunk {
                file,
                chunk_id,
                outcome,
            }) => {
                tracing::debug!(peer = sender, file = %file, chunk_id, ?outcome, "chunk received");
            }
            Ok(Received::Ignored { kind }) => {
                tracing::debug!(peer = sender, kind, "ignoring envelope of unknown kind");
            }
            Err(e) => {
                tracing::warn!(peer = sender, error = %e, "failed to apply envelope");
            }
        }
    }
}
