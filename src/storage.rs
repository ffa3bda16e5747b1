//! Storage abstraction layer for Tessera.
//!
//! The index engine never touches the filesystem directly. Everything goes
//! through the [`Storage`] trait, a flat namespace of named files with:
//!
//! - write-once outputs (creating an existing name is an error)
//! - whole-file random access through [`FileBytes`]
//! - atomic rename, used to publish `segments_N` commit points
//! - explicit durability via [`Storage::sync_files`] and
//!   [`Storage::sync_metadata`]
//! - a named exclusive lock, used for `write.lock`
//!
//! # Storage Types
//!
//! ## FileStorage
//! - Disk-based persistent storage
//! - Memory-mapped reads when `use_mmap` is set
//!
//! ## MemoryStorage
//! - In-memory storage for testing and temporary indexes
//!
//! # Example
//!
//! ```
//! use std::io::Write;
//!
//! use tessera::storage::memory::{MemoryStorage, MemoryStorageConfig};
//! use tessera::storage::Storage;
//!
//! # fn main() -> tessera::error::Result<()> {
//! let storage = MemoryStorage::new(MemoryStorageConfig::default());
//!
//! let mut output = storage.create_output("index.bin")?;
//! output.write_all(b"test data")?;
//! output.close()?;
//!
//! let bytes = storage.open_bytes("index.bin")?;
//! assert_eq!(bytes.as_slice(), b"test data");
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::io::Write;
use std::sync::Arc;

use thiserror::Error;

use crate::error::{Result, TesseraError};

pub mod file;
pub mod memory;
pub mod rate_limited;
pub mod structured;

/// Name of the lock file held by an open index writer.
pub const WRITE_LOCK_NAME: &str = "write.lock";

/// A trait for storage backends that hold the files of one index.
pub trait Storage: Send + Sync + fmt::Debug {
    /// Open the whole content of an existing file for random access.
    fn open_bytes(&self, name: &str) -> Result<FileBytes>;

    /// Create a new file for writing.
    ///
    /// Files are write-once: creating a name that already exists fails.
    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>>;

    /// Check if a file exists.
    fn file_exists(&self, name: &str) -> bool;

    /// Delete a file. Deleting a missing file is a `FileNotFound` error.
    fn delete_file(&self, name: &str) -> Result<()>;

    /// List all files in the storage, sorted by name.
    fn list_files(&self) -> Result<Vec<String>>;

    /// Get the size of a file in bytes.
    fn file_size(&self, name: &str) -> Result<u64>;

    /// Atomically rename a file, replacing nothing: the target must not exist.
    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()>;

    /// Make the content of the named files durable.
    fn sync_files(&self, names: &[String]) -> Result<()>;

    /// Make the directory entries (creations, renames, deletions) durable.
    fn sync_metadata(&self) -> Result<()>;

    /// Obtain the named exclusive lock, failing if it is held.
    fn obtain_lock(&self, name: &str) -> Result<Box<dyn StorageLock>>;
}

/// A trait for writing a new file sequentially.
pub trait StorageOutput: Write + Send + fmt::Debug {
    /// Name of the file being written.
    fn name(&self) -> &str;

    /// Number of bytes written so far.
    fn position(&self) -> u64;

    /// Flush buffered bytes and finish the file.
    fn close(&mut self) -> Result<()>;
}

/// An exclusive lock on a resource in storage, released on drop.
pub trait StorageLock: Send + fmt::Debug {
    /// Get the name of the lock.
    fn name(&self) -> &str;

    /// Release the lock.
    fn release(&mut self) -> Result<()>;

    /// Check if the lock is still held.
    fn is_valid(&self) -> bool;
}

/// Immutable, cheaply clonable view of a whole file.
///
/// Backed either by an owned buffer or a memory map.
#[derive(Clone)]
pub struct FileBytes {
    name: Arc<str>,
    data: Arc<dyn AsRef<[u8]> + Send + Sync>,
}

impl FileBytes {
    /// Wrap any shared byte container.
    pub fn new(name: &str, data: Arc<dyn AsRef<[u8]> + Send + Sync>) -> Self {
        FileBytes {
            name: Arc::from(name),
            data,
        }
    }

    /// Wrap an owned buffer.
    pub fn from_vec(name: &str, data: Vec<u8>) -> Self {
        FileBytes::new(name, Arc::new(data))
    }

    /// Name of the file these bytes came from.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The file content.
    pub fn as_slice(&self) -> &[u8] {
        AsRef::<[u8]>::as_ref(&*self.data)
    }

    /// File length in bytes.
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    /// True for an empty file.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for FileBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileBytes")
            .field("name", &self.name)
            .field("len", &self.len())
            .finish()
    }
}

/// Errors raised by storage backends.
#[derive(Error, Debug)]
pub enum StorageError {
    /// File not found.
    #[error("File not found: {0}")]
    FileNotFound(String),

    /// File already exists.
    #[error("File already exists: {0}")]
    FileExists(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    IoError(String),

    /// Lock acquisition failed.
    #[error("Failed to acquire lock: {0}")]
    LockFailed(String),
}

impl From<StorageError> for TesseraError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::FileNotFound(name) => TesseraError::FileNotFound(name),
            StorageError::LockFailed(name) => TesseraError::LockObtainFailed(name),
            other => TesseraError::storage(other.to_string()),
        }
    }
}

/// Configuration for storage backends.
#[derive(Debug, Clone)]
pub enum StorageConfig {
    /// File-based storage configuration (includes path)
    File(file::FileStorageConfig),

    /// Memory-based storage configuration
    Memory(memory::MemoryStorageConfig),
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Memory(memory::MemoryStorageConfig::default())
    }
}

/// A factory for creating storage instances.
pub struct StorageFactory;

impl StorageFactory {
    /// Create a new storage instance with the given configuration.
    pub fn create(config: StorageConfig) -> Result<Arc<dyn Storage>> {
        match config {
            StorageConfig::Memory(mem_config) => {
                Ok(Arc::new(memory::MemoryStorage::new(mem_config)))
            }
            StorageConfig::File(file_config) => {
                Ok(Arc::new(file::FileStorage::new(file_config)?))
            }
        }
    }
}
