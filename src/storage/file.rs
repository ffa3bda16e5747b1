//! File-based storage implementation.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::Mmap;

use crate::error::{Result, TesseraError};
use crate::storage::{FileBytes, Storage, StorageError, StorageLock, StorageOutput};

/// Configuration for [`FileStorage`].
#[derive(Debug, Clone)]
pub struct FileStorageConfig {
    /// Root directory of the index.
    pub path: PathBuf,

    /// Memory-map files opened for reading.
    pub use_mmap: bool,

    /// Write buffer size in bytes.
    pub buffer_size: usize,

    /// Fsync every output when it is closed.
    pub sync_writes: bool,
}

impl FileStorageConfig {
    /// Create a config rooted at `path` with default settings.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        FileStorageConfig {
            path: path.as_ref().to_path_buf(),
            use_mmap: true,
            buffer_size: 64 * 1024,
            sync_writes: false,
        }
    }
}

/// A file-based storage implementation.
#[derive(Debug)]
pub struct FileStorage {
    directory: PathBuf,
    config: FileStorageConfig,
}

impl FileStorage {
    /// Open (creating if needed) a storage directory.
    pub fn new(config: FileStorageConfig) -> Result<Self> {
        let directory = config.path.clone();

        if !directory.exists() {
            std::fs::create_dir_all(&directory)
                .map_err(|e| TesseraError::storage(format!("Failed to create directory: {e}")))?;
        }

        if !directory.is_dir() {
            return Err(TesseraError::storage(format!(
                "Path is not a directory: {}",
                directory.display()
            )));
        }

        Ok(FileStorage { directory, config })
    }

    /// Root directory of this storage.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn file_path(&self, name: &str) -> PathBuf {
        self.directory.join(name)
    }
}

fn map_io(name: &str, e: std::io::Error) -> TesseraError {
    match e.kind() {
        ErrorKind::NotFound => StorageError::FileNotFound(name.to_string()).into(),
        ErrorKind::AlreadyExists => StorageError::FileExists(name.to_string()).into(),
        _ => TesseraError::Io(e),
    }
}

impl Storage for FileStorage {
    fn open_bytes(&self, name: &str) -> Result<FileBytes> {
        let path = self.file_path(name);
        let file = File::open(&path).map_err(|e| map_io(name, e))?;
        let len = file.metadata()?.len();

        if self.config.use_mmap && len > 0 {
            // SAFETY: index files are write-once and never modified after close.
            let mmap = unsafe { Mmap::map(&file) }?;
            return Ok(FileBytes::new(name, Arc::new(mmap)));
        }

        let data = std::fs::read(&path).map_err(|e| map_io(name, e))?;
        Ok(FileBytes::from_vec(name, data))
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.file_path(name))
            .map_err(|e| map_io(name, e))?;

        Ok(Box::new(FileOutput {
            name: name.to_string(),
            writer: Some(BufWriter::with_capacity(self.config.buffer_size, file)),
            position: 0,
            sync_on_close: self.config.sync_writes,
        }))
    }

    fn file_exists(&self, name: &str) -> bool {
        self.file_path(name).exists()
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        std::fs::remove_file(self.file_path(name)).map_err(|e| map_io(name, e))
    }

    fn list_files(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.directory)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        let metadata = std::fs::metadata(self.file_path(name)).map_err(|e| map_io(name, e))?;
        Ok(metadata.len())
    }

    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()> {
        if self.file_exists(new_name) {
            return Err(StorageError::FileExists(new_name.to_string()).into());
        }
        std::fs::rename(self.file_path(old_name), self.file_path(new_name))
            .map_err(|e| map_io(old_name, e))
    }

    fn sync_files(&self, names: &[String]) -> Result<()> {
        for name in names {
            let file = File::open(self.file_path(name)).map_err(|e| map_io(name, e))?;
            file.sync_all()?;
        }
        Ok(())
    }

    fn sync_metadata(&self) -> Result<()> {
        // Directory fsync is not supported everywhere; best effort.
        if let Ok(dir) = File::open(&self.directory) {
            let _ = dir.sync_all();
        }
        Ok(())
    }

    fn obtain_lock(&self, name: &str) -> Result<Box<dyn StorageLock>> {
        let path = self.file_path(name);
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| {
                if e.kind() == ErrorKind::AlreadyExists {
                    StorageError::LockFailed(name.to_string())
                } else {
                    StorageError::IoError(e.to_string())
                }
            })?;

        Ok(Box::new(FileLock {
            name: name.to_string(),
            path,
            _file: Some(file),
            released: false,
        }))
    }
}

/// A buffered file output.
#[derive(Debug)]
pub struct FileOutput {
    name: String,
    writer: Option<BufWriter<File>>,
    position: u64,
    sync_on_close: bool,
}

impl Write for FileOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| std::io::Error::other(format!("{} is closed", self.name)))?;
        let written = writer.write(buf)?;
        self.position += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

impl StorageOutput for FileOutput {
    fn name(&self) -> &str {
        &self.name
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn close(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.take() {
            let file = writer
                .into_inner()
                .map_err(|e| TesseraError::Io(e.into_error()))?;
            if self.sync_on_close {
                file.sync_all()?;
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
struct FileLock {
    name: String,
    path: PathBuf,
    _file: Option<File>,
    released: bool,
}

impl StorageLock for FileLock {
    fn name(&self) -> &str {
        &self.name
    }

    fn release(&mut self) -> Result<()> {
        if !self.released {
            self._file = None;
            std::fs::remove_file(&self.path)
                .map_err(|e| TesseraError::storage(format!("Failed to release lock: {e}")))?;
            self.released = true;
        }
        Ok(())
    }

    fn is_valid(&self) -> bool {
        !self.released && self.path.exists()
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            log::warn!("could not release lock {}: {e}", self.name);
        }
    }
}
