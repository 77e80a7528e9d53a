//! shard-core — shared types, on-disk and on-wire layouts, configuration.
//! All other Shard crates depend on this one.

pub mod availability;
pub mod chunk;
pub mod config;
pub mod envelope;
pub mod peer;
pub mod wire;

pub use availability::ChunkAvailability;
pub use chunk::{Chunk, ChunkError, MAX_CHUNK_SIZE};
pub use envelope::Envelope;
pub use peer::{PeerId, PeerRecord};

/// BLAKE3 digest used for every checksum Shard persists or transmits.
pub fn checksum(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}
