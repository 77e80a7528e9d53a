//! Distributed file — one file as an array of chunk slots, persisted as
//! either its finished bytes or a resumable partial file.
//!
//! Partial file layout:
//!   [MAGIC]            9 bytes, "TEMPFILE\0"
//!   [PartHeader]       56 bytes, see `shard_core::wire`
//!   [file name]        name_len bytes
//!   [bitmap]           ceil(chunk_count / 8) bytes
//!   [chunk 0 .. N-1]   data only; a missing chunk is zero-filled to its true length
//!
//! The data region is always exactly `total_size` bytes, so chunk `i` lives
//! at `i * MAX_CHUNK_SIZE` within it whether present or not.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use memmap2::Mmap;

use shard_core::availability::chunk_count_for;
use shard_core::wire::{has_magic, MAGIC};
use shard_core::{Chunk, ChunkAvailability, MAX_CHUNK_SIZE};

use super::errors::StoreError;

pub type Result<T> = std::result::Result<T, StoreError>;

static ZEROES: [u8; MAX_CHUNK_SIZE] = [0u8; MAX_CHUNK_SIZE];

/// What an insert did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The slot was already filled; the chunk was discarded.
    Duplicate,
    /// Stored in memory, no snapshot due yet.
    Stored,
    /// Stored and a partial snapshot was written.
    Snapshot,
    /// Stored, the file is now complete and was written in final form.
    Completed,
}

pub struct DistributedFile {
    path: PathBuf,
    file_name: String,
    total_size: u64,
    chunks: Vec<Option<Chunk>>,
    missing: BTreeSet<u32>,
    complete: bool,
    /// Complete-chunk count at the last partial snapshot.
    last_sync: usize,
}

impl DistributedFile {
    /// Create local storage for a file this node does not hold yet,
    /// at the path named by the metadata's file name.
    pub fn new(metadata: &ChunkAvailability) -> Result<Self> {
        Self::new_at(PathBuf::from(&metadata.file_name), metadata)
    }

    /// Create local storage for a file this node does not hold yet.
    ///
    /// Writes the partial header and pre-sizes the data region to
    /// `metadata.total_size`. Whatever the supplied bitmap says, nothing is
    /// held locally, so every chunk starts out missing.
    pub fn new_at(path: impl Into<PathBuf>, metadata: &ChunkAvailability) -> Result<Self> {
        let path = path.into();
        if !metadata.is_consistent() {
            return Err(StoreError::InvalidMetadata(format!(
                "{} bitmap entries for {} bytes, expected {}",
                metadata.chunk_count(),
                metadata.total_size,
                chunk_count_for(metadata.total_size)
            )));
        }

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(StoreError::io(parent))?;
        }

        let chunk_count = metadata.chunk_count();
        let mut this = Self {
            path,
            file_name: metadata.file_name.clone(),
            total_size: metadata.total_size,
            chunks: vec![None; chunk_count],
            missing: (0..chunk_count as u32).collect(),
            complete: chunk_count == 0,
            last_sync: 0,
        };

        if this.complete {
            this.save()?;
            return Ok(this);
        }

        let header = ChunkAvailability::missing(&this.file_name, this.total_size).encode();
        let mut file = File::create(&this.path).map_err(StoreError::io(&this.path))?;
        file.write_all(&MAGIC)
            .and_then(|_| file.write_all(&header))
            .and_then(|_| file.set_len((MAGIC.len() + header.len()) as u64 + this.total_size))
            .and_then(|_| file.sync_all())
            .map_err(StoreError::io(&this.path))?;

        tracing::info!(
            file = %this.file_name,
            path = %this.path.display(),
            bytes = this.total_size,
            chunks = chunk_count,
            "allocated partial file"
        );
        Ok(this)
    }

    /// Import an existing file: a finished file is split into chunks, a
    /// partial file is resumed from its embedded availability record.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(path))
            }
            Err(e) => return Err(StoreError::Io { path, source: e }),
        };
        let len = file.metadata().map_err(StoreError::io(&path))?.len();

        if len == 0 {
            return Ok(Self::from_complete_bytes(path, &[]));
        }

        // Safety: the file is opened read-only and the map is dropped before
        // this function returns; chunk payloads are copied out of it.
        let mmap = unsafe { Mmap::map(&file).map_err(StoreError::io(&path))? };

        if !has_magic(&mmap) {
            let this = Self::from_complete_bytes(path, &mmap);
            tracing::debug!(
                file = %this.file_name,
                chunks = this.chunks.len(),
                "imported complete file"
            );
            return Ok(this);
        }

        let (metadata, used) = ChunkAvailability::decode(&mmap[MAGIC.len()..]).map_err(|source| {
            StoreError::Decode {
                path: path.clone(),
                source,
            }
        })?;
        let data = &mmap[MAGIC.len() + used..];
        if data.len() as u64 != metadata.total_size {
            return Err(StoreError::DataRegion {
                path,
                expected: metadata.total_size,
                actual: data.len() as u64,
            });
        }

        let mut chunks = Vec::with_capacity(metadata.chunk_count());
        let mut missing = BTreeSet::new();
        for (id, present) in metadata.bitmap.iter().enumerate() {
            if *present {
                let start = id * MAX_CHUNK_SIZE;
                let end = start + metadata.chunk_len(id);
                let payload = Bytes::copy_from_slice(&data[start..end]);
                chunks.push(Some(Chunk::new(&metadata.file_name, id as u32, payload)?));
            } else {
                chunks.push(None);
                missing.insert(id as u32);
            }
        }

        let present = chunks.len() - missing.len();
        tracing::info!(
            file = %metadata.file_name,
            present,
            missing = missing.len(),
            "resumed partial file"
        );

        Ok(Self {
            path,
            file_name: metadata.file_name,
            total_size: metadata.total_size,
            complete: missing.is_empty(),
            chunks,
            missing,
            last_sync: present,
        })
    }

    fn from_complete_bytes(path: PathBuf, bytes: &[u8]) -> Self {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let chunks: Vec<Option<Chunk>> = bytes
            .chunks(MAX_CHUNK_SIZE)
            .enumerate()
            .map(|(id, data)| {
                Chunk::new(&file_name, id as u32, Bytes::copy_from_slice(data)).ok()
            })
            .collect();
        Self {
            path,
            file_name,
            total_size: bytes.len() as u64,
            last_sync: chunks.len(),
            chunks,
            missing: BTreeSet::new(),
            complete: true,
        }
    }

    /// Add a chunk. The first chunk seen for an id wins; later arrivals are
    /// discarded. Completing the file writes its final form; otherwise a
    /// partial snapshot is written each time another 20% of chunks arrived.
    pub fn insert(&mut self, chunk: Chunk) -> Result<InsertOutcome> {
        if chunk.file_name() != self.file_name {
            return Err(StoreError::WrongFile {
                expected: self.file_name.clone(),
                actual: chunk.file_name().to_string(),
            });
        }

        let id = chunk.id();
        let count = self.chunks.len();
        let expected = self.chunk_len(id);
        let slot = self
            .chunks
            .get_mut(id as usize)
            .ok_or(StoreError::ChunkOutOfRange { id, count })?;

        if slot.is_some() {
            tracing::trace!(file = %self.file_name, chunk_id = id, "duplicate chunk ignored");
            return Ok(InsertOutcome::Duplicate);
        }
        if chunk.len() != expected {
            return Err(StoreError::ChunkLength {
                id,
                expected,
                actual: chunk.len(),
            });
        }

        *slot = Some(chunk);
        self.missing.remove(&id);
        tracing::debug!(file = %self.file_name, chunk_id = id, "chunk stored");

        if self.missing.is_empty() {
            self.complete = true;
            tracing::info!(file = %self.file_name, path = %self.path.display(), "file complete");
            self.save()?;
            return Ok(InsertOutcome::Completed);
        }

        let complete = self.complete_count();
        if (complete - self.last_sync) * 5 >= count {
            tracing::info!(
                file = %self.file_name,
                percent = complete * 100 / count,
                "flushing partial snapshot"
            );
            self.last_sync = complete;
            self.save()?;
            return Ok(InsertOutcome::Snapshot);
        }

        Ok(InsertOutcome::Stored)
    }

    /// Write the authoritative on-disk form.
    ///
    /// Written to a sibling temp file and renamed over the target, so a
    /// crash mid-save leaves the previous snapshot intact.
    pub fn save(&mut self) -> Result<()> {
        self.complete = self.missing.is_empty();

        let tmp = tmp_path(&self.path);
        let file = File::create(&tmp).map_err(StoreError::io(&tmp))?;
        let mut out = BufWriter::new(file);

        let written = if self.complete {
            self.write_complete(&mut out)
        } else {
            self.write_partial(&mut out)
        };
        written
            .and_then(|_| out.into_inner().map_err(|e| e.into_error()))
            .and_then(|file| file.sync_all())
            .map_err(StoreError::io(&tmp))?;

        fs::rename(&tmp, &self.path).map_err(StoreError::io(&self.path))?;
        tracing::trace!(file = %self.file_name, complete = self.complete, "saved");
        Ok(())
    }

    fn write_complete(&self, out: &mut impl Write) -> std::io::Result<()> {
        for chunk in self.chunks.iter().flatten() {
            out.write_all(chunk.data())?;
        }
        Ok(())
    }

    fn write_partial(&self, out: &mut impl Write) -> std::io::Result<()> {
        out.write_all(&MAGIC)?;
        out.write_all(&self.availability().encode())?;
        for (id, slot) in self.chunks.iter().enumerate() {
            match slot {
                Some(chunk) => out.write_all(chunk.data())?,
                None => out.write_all(&ZEROES[..self.chunk_len(id as u32)])?,
            }
        }
        Ok(())
    }

    /// Availability derived from the current missing set.
    pub fn availability(&self) -> ChunkAvailability {
        ChunkAvailability {
            total_size: self.total_size,
            file_name: self.file_name.clone(),
            bitmap: (0..self.chunks.len() as u32)
                .map(|id| !self.missing.contains(&id))
                .collect(),
        }
    }

    pub fn has_chunk(&self, id: u32) -> bool {
        self.chunk(id).is_some()
    }

    pub fn chunk(&self, id: u32) -> Option<&Chunk> {
        self.chunks.get(id as usize).and_then(Option::as_ref)
    }

    /// Every slot in id order; `None` marks a missing chunk.
    pub fn chunks(&self) -> &[Option<Chunk>] {
        &self.chunks
    }

    pub fn incomplete_ids(&self) -> &BTreeSet<u32> {
        &self.missing
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn complete_count(&self) -> usize {
        self.chunks.len() - self.missing.len()
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn chunk_len(&self, id: u32) -> usize {
        let start = id as u64 * MAX_CHUNK_SIZE as u64;
        self.total_size
            .saturating_sub(start)
            .min(MAX_CHUNK_SIZE as u64) as usize
    }
}

const TEMP_SUFFIX: &str = ".part";

/// Sibling path a save is staged at: `.{name}.{pid}.part`. The leading dot
/// keeps it out of the file-name space peers may use.
fn tmp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.{}{TEMP_SUFFIX}", std::process::id()))
}

/// Whether `name` is a staging file written by `save`.
pub(crate) fn is_temp_name(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(TEMP_SUFFIX)
}
