//! In-memory storage implementation for testing and temporary indexes.

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::Result;
use crate::storage::{FileBytes, Storage, StorageError, StorageLock, StorageOutput};

/// Configuration for [`MemoryStorage`].
#[derive(Debug, Clone, Default)]
pub struct MemoryStorageConfig {
    /// Initial capacity hint for the file table.
    pub initial_capacity: usize,
}

type FileTable = Arc<RwLock<HashMap<String, Arc<Vec<u8>>>>>;

/// An in-memory storage implementation.
///
/// A file becomes visible when its output is closed.
#[derive(Debug, Clone)]
pub struct MemoryStorage {
    files: FileTable,
    /// Names currently being written.
    pending: Arc<Mutex<HashSet<String>>>,
    locks: Arc<Mutex<HashSet<String>>>,
}

impl MemoryStorage {
    /// Create a new memory storage.
    pub fn new(config: MemoryStorageConfig) -> Self {
        MemoryStorage {
            files: Arc::new(RwLock::new(HashMap::with_capacity(config.initial_capacity))),
            pending: Arc::new(Mutex::new(HashSet::new())),
            locks: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Get the total size of all files.
    pub fn total_size(&self) -> u64 {
        self.files.read().values().map(|d| d.len() as u64).sum()
    }

    /// Overwrite a byte of an existing file. Used to simulate corruption.
    pub fn corrupt_byte(&self, name: &str, offset: usize) -> Result<()> {
        let mut files = self.files.write();
        let data = files
            .get_mut(name)
            .ok_or_else(|| StorageError::FileNotFound(name.to_string()))?;
        let mut copy = data.to_vec();
        if offset >= copy.len() {
            return Err(StorageError::IoError(format!("offset {offset} beyond {name}")).into());
        }
        copy[offset] ^= 0xFF;
        *data = Arc::new(copy);
        Ok(())
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        MemoryStorage::new(MemoryStorageConfig::default())
    }
}

impl Storage for MemoryStorage {
    fn open_bytes(&self, name: &str) -> Result<FileBytes> {
        let files = self.files.read();
        let data = files
            .get(name)
            .ok_or_else(|| StorageError::FileNotFound(name.to_string()))?;
        Ok(FileBytes::new(name, data.clone()))
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        let mut pending = self.pending.lock();
        if self.files.read().contains_key(name) || pending.contains(name) {
            return Err(StorageError::FileExists(name.to_string()).into());
        }
        pending.insert(name.to_string());

        Ok(Box::new(MemoryOutput {
            name: name.to_string(),
            buffer: Vec::new(),
            files: Arc::clone(&self.files),
            pending: Arc::clone(&self.pending),
            closed: false,
        }))
    }

    fn file_exists(&self, name: &str) -> bool {
        self.files.read().contains_key(name)
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        match self.files.write().remove(name) {
            Some(_) => Ok(()),
            None => Err(StorageError::FileNotFound(name.to_string()).into()),
        }
    }

    fn list_files(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.files.read().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        let files = self.files.read();
        let data = files
            .get(name)
            .ok_or_else(|| StorageError::FileNotFound(name.to_string()))?;
        Ok(data.len() as u64)
    }

    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()> {
        let mut files = self.files.write();
        if files.contains_key(new_name) {
            return Err(StorageError::FileExists(new_name.to_string()).into());
        }
        let data = files
            .remove(old_name)
            .ok_or_else(|| StorageError::FileNotFound(old_name.to_string()))?;
        files.insert(new_name.to_string(), data);
        Ok(())
    }

    fn sync_files(&self, names: &[String]) -> Result<()> {
        let files = self.files.read();
        for name in names {
            if !files.contains_key(name) {
                return Err(StorageError::FileNotFound(name.clone()).into());
            }
        }
        Ok(())
    }

    fn sync_metadata(&self) -> Result<()> {
        Ok(())
    }

    fn obtain_lock(&self, name: &str) -> Result<Box<dyn StorageLock>> {
        let mut locks = self.locks.lock();
        if !locks.insert(name.to_string()) {
            return Err(StorageError::LockFailed(name.to_string()).into());
        }
        Ok(Box::new(MemoryLock {
            name: name.to_string(),
            locks: Arc::clone(&self.locks),
            released: false,
        }))
    }
}

/// A memory-based output; the file appears on close.
#[derive(Debug)]
pub struct MemoryOutput {
    name: String,
    buffer: Vec<u8>,
    files: FileTable,
    pending: Arc<Mutex<HashSet<String>>>,
    closed: bool,
}

impl Write for MemoryOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl StorageOutput for MemoryOutput {
    fn name(&self) -> &str {
        &self.name
    }

    fn position(&self) -> u64 {
        self.buffer.len() as u64
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let data = std::mem::take(&mut self.buffer);
        self.files.write().insert(self.name.clone(), Arc::new(data));
        self.pending.lock().remove(&self.name);
        Ok(())
    }
}

impl Drop for MemoryOutput {
    fn drop(&mut self) {
        if !self.closed {
            self.pending.lock().remove(&self.name);
        }
    }
}

#[derive(Debug)]
struct MemoryLock {
    name: String,
    locks: Arc<Mutex<HashSet<String>>>,
    released: bool,
}

impl StorageLock for MemoryLock {
    fn name(&self) -> &str {
        &self.name
    }

    fn release(&mut self) -> Result<()> {
        if !self.released {
            self.locks.lock().remove(&self.name);
            self.released = true;
        }
        Ok(())
    }

    fn is_valid(&self) -> bool {
        !self.released
    }
}

impl Drop for MemoryLock {
    fn drop(&mut self) {
        let _ = self.release();
    }
}
