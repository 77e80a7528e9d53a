//! shard-services — chunked file storage, the per-peer message transport
//! and the inbound receive path.

pub mod file;
pub mod receive;
pub mod transport;

pub use file::{DistributedFile, FileLibrary, FileProgress, InsertOutcome, SharedFile, StoreError};
pub use receive::{ReceiveError, ReceiveListener, Received};
pub use transport::{
    ConnectionState, PeerStatus, PeerTransport, TransportConfig, TransportError, TransportStats,
};
