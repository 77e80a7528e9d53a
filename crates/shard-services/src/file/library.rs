//! File library — the set of files this node stores, keyed by file name.
//!
//! Each file sits behind its own async mutex, so inserts into one file are
//! serialized while different files proceed independently. Disk I/O runs on
//! the blocking pool.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;

use shard_core::availability::MAX_TOTAL_SIZE;
use shard_core::{Chunk, ChunkAvailability};

use super::errors::StoreError;
use super::store::{self, DistributedFile, InsertOutcome};

pub type SharedFile = Arc<Mutex<DistributedFile>>;

/// Point-in-time progress of one tracked file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileProgress {
    pub file_name: String,
    pub complete_chunks: usize,
    pub total_chunks: usize,
    pub complete: bool,
}

#[derive(Clone)]
pub struct FileLibrary {
    root: PathBuf,
    files: Arc<DashMap<String, SharedFile>>,
    /// Held per name while a file is being opened or allocated.
    creating: Arc<DashMap<String, Arc<Mutex<()>>>>,
    max_file_size: u64,
}

impl FileLibrary {
    /// Create a library rooted at the given directory.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(StoreError::io(&root))?;
        Ok(Self {
            root,
            files: Arc::new(DashMap::new()),
            creating: Arc::new(DashMap::new()),
            max_file_size: MAX_TOTAL_SIZE,
        })
    }

    /// Cap the size of files peers may announce or start sending.
    pub fn with_max_file_size(mut self, max_file_size: u64) -> Self {
        self.max_file_size = max_file_size.min(MAX_TOTAL_SIZE);
        self
    }

    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    /// Reject a file size before anything is sized from it.
    pub fn check_size(&self, total_size: u64) -> Result<(), StoreError> {
        if total_size > self.max_file_size {
            return Err(StoreError::InvalidMetadata(format!(
                "file of {total_size} bytes exceeds the limit of {} bytes",
                self.max_file_size
            )));
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where a file of this name is stored. Only plain single-component
    /// names without a leading dot are accepted; names arrive from remote
    /// peers, and dot names are reserved for staging files.
    pub fn path_for(&self, file_name: &str) -> Result<PathBuf, StoreError> {
        let mut components = Path::new(file_name).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) if !file_name.starts_with('.') => {
                Ok(self.root.join(file_name))
            }
            _ => Err(StoreError::InvalidName(file_name.to_string())),
        }
    }

    /// Start tracking a file announced by a peer.
    ///
    /// Already tracked: returns the existing store. Present on disk under the
    /// root: resumes it. Otherwise allocates a fresh partial file.
    pub async fn track(&self, metadata: ChunkAvailability) -> Result<SharedFile, StoreError> {
        if let Some(existing) = self.get(&metadata.file_name) {
            return Ok(existing);
        }
        self.check_size(metadata.total_size)?;
        let path = self.path_for(&metadata.file_name)?;

        let name = metadata.file_name.clone();
        let gate = self
            .creating
            .entry(name.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _creating = gate.lock().await;
        if let Some(existing) = self.get(&name) {
            return Ok(existing);
        }
        let tracked = self.create(path, metadata).await?;
        self.creating.remove(&name);
        Ok(tracked)
    }

    async fn create(
        &self,
        path: PathBuf,
        metadata: ChunkAvailability,
    ) -> Result<SharedFile, StoreError> {
        let file = tokio::task::spawn_blocking(move || {
            if path.exists() {
                let file = DistributedFile::open(&path)?;
                if file.total_size() != metadata.total_size {
                    tracing::warn!(
                        file = %metadata.file_name,
                        on_disk = file.total_size(),
                        announced = metadata.total_size,
                        "announced size differs from stored file, keeping stored file"
                    );
                }
                Ok(file)
            } else {
                DistributedFile::new_at(&path, &metadata)
            }
        })
        .await??;

        Ok(self.register(file))
    }

    /// Register an existing file from any path.
    pub async fn import(&self, path: impl Into<PathBuf>) -> Result<SharedFile, StoreError> {
        let path = path.into();
        let file = tokio::task::spawn_blocking(move || DistributedFile::open(path)).await??;
        Ok(self.register(file))
    }

    /// Import every file already present under the root. Files that fail to
    /// load are logged and skipped. Returns how many were imported.
    pub async fn import_root(&self) -> Result<usize, StoreError> {
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(StoreError::io(&self.root))?;
        let mut imported = 0;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(StoreError::io(&self.root))?
        {
            let path = entry.path();
            let staging = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(store::is_temp_name);
            if !path.is_file() || staging {
                continue;
            }
            match self.import(&path).await {
                Ok(_) => imported += 1,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "failed to import stored file");
                }
            }
        }
        Ok(imported)
    }

    fn register(&self, file: DistributedFile) -> SharedFile {
        let name = file.file_name().to_string();
        self.files
            .entry(name)
            .or_insert_with(|| Arc::new(Mutex::new(file)))
            .clone()
    }

    /// Deliver a received chunk to the file it belongs to.
    pub async fn insert(&self, chunk: Chunk) -> Result<InsertOutcome, StoreError> {
        let file = self
            .get(chunk.file_name())
            .ok_or_else(|| StoreError::UnknownFile(chunk.file_name().to_string()))?;
        let mut guard = file.lock_owned().await;
        tokio::task::spawn_blocking(move || guard.insert(chunk)).await?
    }

    pub fn get(&self, file_name: &str) -> Option<SharedFile> {
        self.files.get(file_name).map(|f| f.value().clone())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.files.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Progress of every tracked file, sorted by name.
    pub async fn progress(&self) -> Vec<FileProgress> {
        let files: Vec<SharedFile> = self.files.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(files.len());
        for file in files {
            let file = file.lock().await;
            out.push(FileProgress {
                file_name: file.file_name().to_string(),
                complete_chunks: file.complete_count(),
                total_chunks: file.chunk_count(),
                complete: file.is_complete(),
            });
        }
        out.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        out
    }
}
