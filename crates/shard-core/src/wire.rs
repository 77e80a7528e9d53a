//! Shard wire and disk layouts.
//!
//! These types ARE the formats. Every field, every size, every reserved byte
//! is part of what peers exchange and what lands on disk. Changing anything
//! here breaks reading existing partial files and talking to older nodes.
//!
//! All multi-byte integers are little-endian (`zerocopy::byteorder`), so the
//! layouts are identical on every host. Structs are alignment-1 `#[repr(C)]`
//! with zerocopy derives for allocation-free serialization. There is no
//! unsafe code in this module.

use bytes::{BufMut, Bytes, BytesMut};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{LE, U16, U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

use crate::availability::{ChunkAvailability, DecodeError};
use crate::chunk::{Chunk, ChunkError, MAX_CHUNK_SIZE};
use crate::envelope::Envelope;

// ── Partial file header ───────────────────────────────────────────────────────

/// First bytes of every incomplete file. A file is incomplete iff it starts
/// with exactly these nine bytes.
pub const MAGIC: [u8; 9] = *b"TEMPFILE\0";

/// Current partial-file metadata version.
pub const PART_FORMAT_VERSION: u8 = 0x01;

pub const PART_HEADER_LEN: usize = 56;

/// Fixed header of the availability record stored after `MAGIC`.
///
/// Followed by `name_len` bytes of UTF-8 file name and the LSB-first packed
/// bitmap (`ceil(chunk_count / 8)` bytes).
///
/// Wire size: 56 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct PartHeader {
    /// Format version. Currently 0x01.
    pub version: u8,

    /// Reserved, must be zero.
    pub reserved: [u8; 3],

    /// Number of chunks the bitmap covers.
    pub chunk_count: U32<LE>,

    /// Chunk size the data region was laid out with.
    pub max_chunk_size: U32<LE>,

    /// Logical size of the finished file in bytes.
    pub total_size: U64<LE>,

    /// Length of the file name following the header.
    pub name_len: U16<LE>,

    /// Reserved, must be zero.
    pub reserved2: [u8; 2],

    /// BLAKE3 over this header (checksum zeroed), the name, and the bitmap.
    pub checksum: [u8; 32],
}

assert_eq_size!(PartHeader, [u8; PART_HEADER_LEN]);

impl PartHeader {
    pub fn new(chunk_count: u32, total_size: u64, name_len: u16) -> Self {
        Self {
            version: PART_FORMAT_VERSION,
            reserved: [0; 3],
            chunk_count: U32::new(chunk_count),
            max_chunk_size: U32::new(MAX_CHUNK_SIZE as u32),
            total_size: U64::new(total_size),
            name_len: U16::new(name_len),
            reserved2: [0; 2],
            checksum: [0; 32],
        }
    }
}

/// Whether `bytes` begins with the incomplete-file marker.
pub fn has_magic(bytes: &[u8]) -> bool {
    bytes.len() >= MAGIC.len() && bytes[..MAGIC.len()] == MAGIC
}

// ── Envelope frame ────────────────────────────────────────────────────────────

/// Current envelope frame version.
pub const ENVELOPE_VERSION: u8 = 0x01;

pub const ENVELOPE_HEADER_LEN: usize = 48;

/// Largest envelope payload a reader accepts.
/// Leaves room for a full chunk plus its payload header and file name.
pub const MAX_ENVELOPE_PAYLOAD: usize = 2 * MAX_CHUNK_SIZE;

/// Precedes every envelope written to a peer connection.
///
/// Wire size: 48 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct EnvelopeHeader {
    /// Frame version. A reader seeing an unknown version drops the connection.
    pub version: u8,

    /// Reserved, must be zero.
    pub flags: u8,

    /// Application-defined payload kind. The transport does not inspect this.
    pub kind: U16<LE>,

    pub sender: U32<LE>,

    /// Routing key. The receiving node may check it against its own id.
    pub recipient: U32<LE>,

    /// Payload length in bytes, not including this header.
    pub length: U32<LE>,

    /// BLAKE3 of the payload bytes.
    pub checksum: [u8; 32],
}

assert_eq_size!(EnvelopeHeader, [u8; ENVELOPE_HEADER_LEN]);

/// Payload kind: a single chunk (`ChunkPayloadHeader` + name + data).
pub const KIND_CHUNK: u16 = 1;

/// Payload kind: an encoded `ChunkAvailability` announcing a file.
pub const KIND_FILE_ANNOUNCE: u16 = 2;

impl EnvelopeHeader {
    pub fn for_envelope(envelope: &Envelope) -> Self {
        Self {
            version: ENVELOPE_VERSION,
            flags: 0,
            kind: U16::new(envelope.kind),
            sender: U32::new(envelope.sender),
            recipient: U32::new(envelope.recipient),
            length: U32::new(envelope.payload.len() as u32),
            checksum: crate::checksum(&envelope.payload),
        }
    }

    /// Check the fields that can be validated before the payload is read.
    pub fn validate(&self) -> Result<usize, WireError> {
        if self.version != ENVELOPE_VERSION {
            return Err(WireError::UnknownVersion(self.version));
        }
        if self.flags != 0 {
            return Err(WireError::ReservedFlagsSet(self.flags));
        }
        let length = self.length.get() as usize;
        if length > MAX_ENVELOPE_PAYLOAD {
            return Err(WireError::PayloadTooLarge(length));
        }
        Ok(length)
    }

    /// Rebuild the envelope once its payload has been read.
    pub fn into_envelope(self, payload: Bytes) -> Result<Envelope, WireError> {
        if crate::checksum(&payload) != self.checksum {
            return Err(WireError::ChecksumMismatch);
        }
        Ok(Envelope {
            sender: self.sender.get(),
            recipient: self.recipient.get(),
            kind: self.kind.get(),
            payload,
        })
    }
}

/// Frame an envelope: header followed by payload.
pub fn encode_envelope(envelope: &Envelope) -> Result<Bytes, WireError> {
    if envelope.payload.len() > MAX_ENVELOPE_PAYLOAD {
        return Err(WireError::PayloadTooLarge(envelope.payload.len()));
    }
    let header = EnvelopeHeader::for_envelope(envelope);
    let mut buf = BytesMut::with_capacity(ENVELOPE_HEADER_LEN + envelope.payload.len());
    buf.put_slice(header.as_bytes());
    buf.put_slice(&envelope.payload);
    Ok(buf.freeze())
}

/// Decode one complete frame from `buf`.
pub fn decode_envelope(buf: &[u8]) -> Result<Envelope, WireError> {
    let header = EnvelopeHeader::read_from_prefix(buf).ok_or(WireError::Truncated)?;
    let length = header.validate()?;
    let body = buf
        .get(ENVELOPE_HEADER_LEN..ENVELOPE_HEADER_LEN + length)
        .ok_or(WireError::Truncated)?;
    header.into_envelope(Bytes::copy_from_slice(body))
}

// ── Chunk payload ─────────────────────────────────────────────────────────────

pub const CHUNK_PAYLOAD_HEADER_LEN: usize = 16;

/// Precedes the file name and chunk data inside a `KIND_CHUNK` envelope.
///
/// Wire size: 16 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct ChunkPayloadHeader {
    pub chunk_id: U32<LE>,

    /// Logical size of the whole file, so a receiver can size its store.
    pub total_size: U64<LE>,

    pub name_len: U16<LE>,

    /// Reserved, must be zero.
    pub reserved: [u8; 2],
}

assert_eq_size!(ChunkPayloadHeader, [u8; CHUNK_PAYLOAD_HEADER_LEN]);

/// A chunk as carried on the wire, with the size of the file it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPayload {
    pub total_size: u64,
    pub chunk: Chunk,
}

pub fn encode_chunk(chunk: &Chunk, total_size: u64) -> Result<Bytes, WireError> {
    let name = chunk.file_name().as_bytes();
    if name.len() > u16::MAX as usize {
        return Err(WireError::NameTooLong(name.len()));
    }
    let header = ChunkPayloadHeader {
        chunk_id: U32::new(chunk.id()),
        total_size: U64::new(total_size),
        name_len: U16::new(name.len() as u16),
        reserved: [0; 2],
    };
    let mut buf = BytesMut::with_capacity(CHUNK_PAYLOAD_HEADER_LEN + name.len() + chunk.len());
    buf.put_slice(header.as_bytes());
    buf.put_slice(name);
    buf.put_slice(chunk.data());
    Ok(buf.freeze())
}

pub fn decode_chunk(payload: &Bytes) -> Result<ChunkPayload, WireError> {
    let header = ChunkPayloadHeader::read_from_prefix(payload).ok_or(WireError::Truncated)?;
    let name_end = CHUNK_PAYLOAD_HEADER_LEN + header.name_len.get() as usize;
    let name = payload
        .get(CHUNK_PAYLOAD_HEADER_LEN..name_end)
        .ok_or(WireError::Truncated)?;
    let name = std::str::from_utf8(name).map_err(|_| WireError::InvalidName)?;
    let chunk = Chunk::new(name, header.chunk_id.get(), payload.slice(name_end..))?;
    Ok(ChunkPayload {
        total_size: header.total_size.get(),
        chunk,
    })
}

/// Build a file announcement envelope payload.
pub fn encode_announce(meta: &ChunkAvailability) -> Bytes {
    Bytes::from(meta.encode())
}

pub fn decode_announce(payload: &[u8]) -> Result<ChunkAvailability, WireError> {
    Ok(ChunkAvailability::decode(payload)?.0)
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("unknown envelope version: 0x{0:02x}")]
    UnknownVersion(u8),

    #[error("reserved flags are non-zero: 0x{0:02x}")]
    ReservedFlagsSet(u8),

    #[error("payload length {0} exceeds maximum {MAX_ENVELOPE_PAYLOAD}")]
    PayloadTooLarge(usize),

    #[error("frame truncated")]
    Truncated,

    #[error("payload checksum mismatch")]
    ChecksumMismatch,

    #[error("file name of {0} bytes is too long")]
    NameTooLong(usize),

    #[error("file name is not valid UTF-8")]
    InvalidName,

    #[error(transparent)]
    Chunk(#[from] ChunkError),

    #[error("bad file announcement: {0}")]
    Announce(#[from] DecodeError),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
