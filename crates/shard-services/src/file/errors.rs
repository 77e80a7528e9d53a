use std::path::PathBuf;

use shard_core::availability::DecodeError;
use shard_core::ChunkError;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("file at {} does not exist", .0.display())]
    NotFound(PathBuf),

    #[error("i/o on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot decode partial-file metadata in {}: {source}", path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: DecodeError,
    },

    #[error("invalid availability metadata: {0}")]
    InvalidMetadata(String),

    #[error("data region of {} is {actual} bytes, metadata expects {expected}", path.display())]
    DataRegion {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    #[error("chunk id {id} out of range for a file of {count} chunks")]
    ChunkOutOfRange { id: u32, count: usize },

    #[error("chunk {id} is {actual} bytes, expected {expected}")]
    ChunkLength {
        id: u32,
        expected: usize,
        actual: usize,
    },

    #[error("chunk belongs to {actual}, not {expected}")]
    WrongFile { expected: String, actual: String },

    #[error("no tracked file named {0}")]
    UnknownFile(String),

    #[error("file name {0:?} is not a plain file name")]
    InvalidName(String),

    #[error(transparent)]
    Chunk(#[from] ChunkError),

    #[error("blocking store task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| StoreError::Io { path, source }
    }
}
