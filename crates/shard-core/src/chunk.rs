//! Chunks — the fixed-maximum-size unit of a file's content.

use bytes::Bytes;

/// Largest payload a single chunk may carry.
/// Every chunk of a file is exactly this size except possibly the last.
pub const MAX_CHUNK_SIZE: usize = 64 * 1024;

/// A piece of a file, identified by its dense 0-based ordinal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    file_name: String,
    id: u32,
    data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChunkError {
    #[error("chunk payload of {len} bytes exceeds maximum {max}")]
    TooLarge { len: usize, max: usize },
}

impl Chunk {
    /// Build a chunk. Fails if the payload is larger than `MAX_CHUNK_SIZE`.
    pub fn new(
        file_name: impl Into<String>,
        id: u32,
        data: impl Into<Bytes>,
    ) -> Result<Self, ChunkError> {
        let data = data.into();
        if data.len() > MAX_CHUNK_SIZE {
            return Err(ChunkError::TooLarge {
                len: data.len(),
                max: MAX_CHUNK_SIZE,
            });
        }
        Ok(Self {
            file_name: file_name.into(),
            id,
            data,
        })
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
