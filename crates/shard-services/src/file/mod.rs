//! Chunked file storage.
//!
//! A `DistributedFile` is one file held as an ordered array of chunk slots.
//! On disk it is either the finished file (raw bytes) or a self-describing
//! partial file: `MAGIC` + availability record + data region, which can be
//! reopened after a restart and resumed exactly.

pub mod errors;
pub mod library;
pub mod store;

pub use errors::StoreError;
pub use library::{FileLibrary, FileProgress, SharedFile};
pub use store::{DistributedFile, InsertOutcome};
