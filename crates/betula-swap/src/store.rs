//! Backing stores for blob-level I/O.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use betula_common::{BetulaError, BlobId, Result};

/// Name of the file holding the persisted root pointer.
const ROOT_FILE: &str = "ROOT";

/// Storage interface the swap space writes objects through.
///
/// A store hands out opaque blob identifiers; blob 0 is reserved and never
/// allocated. The root pointer is the single durable cell the swap space
/// commits checkpoints with: `set_root` must be durable before it returns.
pub trait BackingStore: Send {
    /// Reserves a fresh blob identifier. `size_hint` is the expected
    /// payload size in bytes; stores may ignore it.
    fn allocate(&mut self, size_hint: usize) -> Result<BlobId>;

    /// Releases a blob. Reading it afterwards is undefined.
    fn deallocate(&mut self, id: BlobId) -> Result<()>;

    /// Reads a whole blob.
    fn read(&mut self, id: BlobId) -> Result<Vec<u8>>;

    /// Writes a whole blob. The bytes are durable before this returns.
    fn write(&mut self, id: BlobId, data: &[u8]) -> Result<()>;

    /// Durably replaces the root pointer. This is the commit point for
    /// checkpoints.
    fn set_root(&mut self, id: Option<BlobId>) -> Result<()>;

    /// Reads the current root pointer. `None` means no prior state.
    fn get_root(&mut self) -> Result<Option<BlobId>>;
}

/// Configuration for the file-per-blob store.
#[derive(Debug, Clone)]
pub struct FileStoreConfig {
    /// Base directory for blob files.
    pub dir: PathBuf,
    /// Enable fsync after writes.
    pub fsync_enabled: bool,
}

impl FileStoreConfig {
    /// Creates a configuration for the given directory with fsync enabled.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            fsync_enabled: true,
        }
    }
}

/// File-per-blob backing store.
///
/// Each blob is a file named by its decimal ID inside the configured
/// directory; the root pointer lives in a `ROOT` file that is replaced
/// atomically via a temporary file and rename.
pub struct FileStore {
    config: FileStoreConfig,
    next_id: u64,
}

impl FileStore {
    /// Opens the store, creating the directory if needed. Allocation
    /// resumes past any blob files already present.
    pub fn open(config: FileStoreConfig) -> Result<Self> {
        fs::create_dir_all(&config.dir)?;

        let mut max_id = 0u64;
        for entry in fs::read_dir(&config.dir)? {
            let entry = entry?;
            if let Some(id) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u64>().ok())
            {
                max_id = max_id.max(id);
            }
        }

        Ok(Self {
            config,
            next_id: max_id + 1,
        })
    }

    /// Returns the blob directory path.
    pub fn dir(&self) -> &Path {
        &self.config.dir
    }

    fn blob_path(&self, id: BlobId) -> PathBuf {
        self.config.dir.join(id.get().to_string())
    }
}

impl BackingStore for FileStore {
    fn allocate(&mut self, _size_hint: usize) -> Result<BlobId> {
        let id = BlobId(self.next_id);
        self.next_id += 1;
        // Reserve the name eagerly so a crashed process cannot reuse it.
        let file = File::create(self.blob_path(id))?;
        if self.config.fsync_enabled {
            file.sync_all()?;
        }
        Ok(id)
    }

    fn deallocate(&mut self, id: BlobId) -> Result<()> {
        fs::remove_file(self.blob_path(id))?;
        Ok(())
    }

    fn read(&mut self, id: BlobId) -> Result<Vec<u8>> {
        match fs::read(self.blob_path(id)) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BetulaError::BlobNotFound(id.get()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn write(&mut self, id: BlobId, data: &[u8]) -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.blob_path(id))?;
        file.write_all(data)?;
        if self.config.fsync_enabled {
            file.sync_all()?;
        }
        Ok(())
    }

    fn set_root(&mut self, id: Option<BlobId>) -> Result<()> {
        let tmp = self.config.dir.join("ROOT.tmp");
        let mut file = File::create(&tmp)?;
        file.write_all(&BlobId::encode(id).to_le_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp, self.config.dir.join(ROOT_FILE))?;
        if self.config.fsync_enabled {
            // Make the rename itself durable.
            if let Ok(dir) = File::open(&self.config.dir) {
                let _ = dir.sync_all();
            }
        }
        Ok(())
    }

    fn get_root(&mut self) -> Result<Option<BlobId>> {
        let path = self.config.dir.join(ROOT_FILE);
        match fs::read(&path) {
            Ok(data) => {
                let bytes: [u8; 8] = data.as_slice().try_into().map_err(|_| {
                    BetulaError::corruption(0, "root pointer file is not 8 bytes")
                })?;
                Ok(BlobId::decode(u64::from_le_bytes(bytes)))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory backing store for tests.
#[derive(Default)]
pub struct MemStore {
    blobs: HashMap<BlobId, Vec<u8>>,
    next_id: u64,
    root: Option<BlobId>,
}

impl MemStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            blobs: HashMap::new(),
            next_id: 1,
            root: None,
        }
    }

    /// Returns the number of live blobs.
    pub fn blob_count(&self) -> usize {
        self.blobs.len()
    }
}

impl BackingStore for MemStore {
    fn allocate(&mut self, size_hint: usize) -> Result<BlobId> {
        let id = BlobId(self.next_id);
        self.next_id += 1;
        self.blobs.insert(id, Vec::with_capacity(size_hint));
        Ok(id)
    }

    fn deallocate(&mut self, id: BlobId) -> Result<()> {
        self.blobs
            .remove(&id)
            .ok_or(BetulaError::BlobNotFound(id.get()))?;
        Ok(())
    }

    fn read(&mut self, id: BlobId) -> Result<Vec<u8>> {
        self.blobs
            .get(&id)
            .cloned()
            .ok_or(BetulaError::BlobNotFound(id.get()))
    }

    fn write(&mut self, id: BlobId, data: &[u8]) -> Result<()> {
        let blob = self
            .blobs
            .get_mut(&id)
            .ok_or(BetulaError::BlobNotFound(id.get()))?;
        blob.clear();
        blob.extend_from_slice(data);
        Ok(())
    }

    fn set_root(&mut self, id: Option<BlobId>) -> Result<()> {
        self.root = id;
        Ok(())
    }

    fn get_root(&mut self) -> Result<Option<BlobId>> {
        Ok(self.root)
    }
}
