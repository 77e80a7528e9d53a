//! Chunk availability — which chunks of a logical file are present.
//!
//! This is the metadata record persisted at the head of an incomplete file
//! and carried in file announcements. The bitmap is authoritative: on reload
//! the missing-chunk set is rebuilt from it.

use zerocopy::{AsBytes, FromBytes};

use crate::chunk::MAX_CHUNK_SIZE;
use crate::wire::{PartHeader, PART_FORMAT_VERSION, PART_HEADER_LEN};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkAvailability {
    pub total_size: u64,
    pub file_name: String,
    /// Entry `i` is true iff chunk `i` is present.
    pub bitmap: Vec<bool>,
}

/// Largest file a chunk id can address: `u32::MAX` chunks of `MAX_CHUNK_SIZE`.
pub const MAX_TOTAL_SIZE: u64 = u32::MAX as u64 * MAX_CHUNK_SIZE as u64;

/// Number of chunks a file of `total_size` bytes splits into.
pub fn chunk_count_for(total_size: u64) -> usize {
    total_size.div_ceil(MAX_CHUNK_SIZE as u64) as usize
}

/// Errors decoding a persisted or transmitted availability record.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("metadata truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("unsupported metadata format version {0}")]
    UnsupportedVersion(u8),

    #[error("written with max chunk size {0}, this build uses {MAX_CHUNK_SIZE}")]
    ChunkSizeMismatch(u32),

    #[error("bitmap covers {actual} chunks, total size implies {expected}")]
    BitmapLength { expected: usize, actual: usize },

    #[error("file of {0} bytes exceeds the addressable maximum of {MAX_TOTAL_SIZE}")]
    TooLarge(u64),

    #[error("file name is not valid UTF-8")]
    InvalidName,

    #[error("metadata checksum mismatch")]
    ChecksumMismatch,
}

impl ChunkAvailability {
    /// Record for a file of which no chunk is held yet.
    pub fn missing(file_name: impl Into<String>, total_size: u64) -> Self {
        Self {
            total_size,
            file_name: file_name.into(),
            bitmap: vec![false; chunk_count_for(total_size)],
        }
    }

    /// Record for a fully materialised file.
    pub fn complete(file_name: impl Into<String>, total_size: u64) -> Self {
        Self {
            total_size,
            file_name: file_name.into(),
            bitmap: vec![true; chunk_count_for(total_size)],
        }
    }

    pub fn chunk_count(&self) -> usize {
        self.bitmap.len()
    }

    pub fn present_count(&self) -> usize {
        self.bitmap.iter().filter(|b| **b).count()
    }

    /// True byte length of chunk `id`. Zero for ids past the end.
    pub fn chunk_len(&self, id: usize) -> usize {
        let start = id as u64 * MAX_CHUNK_SIZE as u64;
        if start >= self.total_size {
            return 0;
        }
        (self.total_size - start).min(MAX_CHUNK_SIZE as u64) as usize
    }

    /// Whether the total size is addressable and the bitmap length agrees
    /// with it.
    pub fn is_consistent(&self) -> bool {
        self.total_size <= MAX_TOTAL_SIZE && self.bitmap.len() == chunk_count_for(self.total_size)
    }

    /// Encoded length of this record (header + name + packed bitmap).
    pub fn encoded_len(&self) -> usize {
        PART_HEADER_LEN + self.file_name.len() + packed_len(self.bitmap.len())
    }

    /// Encode as `PartHeader` + file name + LSB-first packed bitmap.
    ///
    /// The name is truncated at a UTF-8 boundary if longer than `u16::MAX` bytes.
    pub fn encode(&self) -> Vec<u8> {
        let name = clamp_name(&self.file_name);
        let bitmap = pack_bitmap(&self.bitmap);

        let mut header = PartHeader::new(
            self.bitmap.len() as u32,
            self.total_size,
            name.len() as u16,
        );
        header.checksum = metadata_checksum(&header, name.as_bytes(), &bitmap);

        let mut out = Vec::with_capacity(PART_HEADER_LEN + name.len() + bitmap.len());
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(&bitmap);
        out
    }

    /// Decode a record from the front of `buf`.
    /// Returns the record and the number of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), DecodeError> {
        let header = PartHeader::read_from_prefix(buf).ok_or(DecodeError::Truncated {
            needed: PART_HEADER_LEN,
            available: buf.len(),
        })?;

        if header.version != PART_FORMAT_VERSION {
            return Err(DecodeError::UnsupportedVersion(header.version));
        }
        let max_chunk_size = header.max_chunk_size.get();
        if max_chunk_size as usize != MAX_CHUNK_SIZE {
            return Err(DecodeError::ChunkSizeMismatch(max_chunk_size));
        }

        let chunk_count = header.chunk_count.get() as usize;
        let total_size = header.total_size.get();
        if total_size > MAX_TOTAL_SIZE {
            return Err(DecodeError::TooLarge(total_size));
        }
        let expected = chunk_count_for(total_size);
        if chunk_count != expected {
            return Err(DecodeError::BitmapLength {
                expected,
                actual: chunk_count,
            });
        }

        let name_len = header.name_len.get() as usize;
        let needed = PART_HEADER_LEN + name_len + packed_len(chunk_count);
        if buf.len() < needed {
            return Err(DecodeError::Truncated {
                needed,
                available: buf.len(),
            });
        }
        let name_bytes = &buf[PART_HEADER_LEN..PART_HEADER_LEN + name_len];
        let bitmap_bytes = &buf[PART_HEADER_LEN + name_len..needed];

        if metadata_checksum(&header, name_bytes, bitmap_bytes) != header.checksum {
            return Err(DecodeError::ChecksumMismatch);
        }

        let file_name = std::str::from_utf8(name_bytes)
            .map_err(|_| DecodeError::InvalidName)?
            .to_string();

        Ok((
            Self {
                total_size,
                file_name,
                bitmap: unpack_bitmap(bitmap_bytes, chunk_count),
            },
            needed,
        ))
    }
}

fn metadata_checksum(header: &PartHeader, name: &[u8], bitmap: &[u8]) -> [u8; 32] {
    let mut unsigned = header.clone();
    unsigned.checksum = [0u8; 32];
    let mut hasher = blake3::Hasher::new();
    hasher.update(unsigned.as_bytes());
    hasher.update(name);
    hasher.update(bitmap);
    *hasher.finalize().as_bytes()
}

fn clamp_name(name: &str) -> &str {
    let max = u16::MAX as usize;
    if name.len() <= max {
        return name;
    }
    let mut end = max;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

fn packed_len(bits: usize) -> usize {
    bits.div_ceil(8)
}

fn pack_bitmap(bits: &[bool]) -> Vec<u8> {
    let mut out = vec![0u8; packed_len(bits.len())];
    for (i, _) in bits.iter().enumerate().filter(|(_, b)| **b) {
        out[i / 8] |= 1 << (i % 8);
    }
    out
}

fn unpack_bitmap(bytes: &[u8], bits: usize) -> Vec<bool> {
    (0..bits).map(|i| bytes[i / 8] & (1 << (i % 8)) != 0).collect()
}
