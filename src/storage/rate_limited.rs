//! Storage wrapper that throttles output throughput.
//!
//! Merge threads write through this wrapper when the scheduler has a write
//! ceiling. Reads and metadata operations pass straight through.

use std::io::Write;
use std::sync::Arc;

use crate::error::Result;
use crate::storage::{FileBytes, Storage, StorageLock, StorageOutput};
use crate::util::rate_limiter::RateLimiter;

/// Bytes written between two limiter checks.
const CHECK_BYTES: u64 = 64 * 1024;

/// A storage whose outputs are paced by a shared [`RateLimiter`].
#[derive(Debug)]
pub struct RateLimitedStorage {
    inner: Arc<dyn Storage>,
    limiter: Arc<RateLimiter>,
}

impl RateLimitedStorage {
    /// Wrap `inner`, pacing every output with `limiter`.
    pub fn new(inner: Arc<dyn Storage>, limiter: Arc<RateLimiter>) -> Self {
        RateLimitedStorage { inner, limiter }
    }
}

impl Storage for RateLimitedStorage {
    fn open_bytes(&self, name: &str) -> Result<FileBytes> {
        self.inner.open_bytes(name)
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        let inner = self.inner.create_output(name)?;
        Ok(Box::new(RateLimitedOutput {
            inner,
            limiter: Arc::clone(&self.limiter),
            unpaced: 0,
        }))
    }

    fn file_exists(&self, name: &str) -> bool {
        self.inner.file_exists(name)
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        self.inner.delete_file(name)
    }

    fn list_files(&self) -> Result<Vec<String>> {
        self.inner.list_files()
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        self.inner.file_size(name)
    }

    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()> {
        self.inner.rename_file(old_name, new_name)
    }

    fn sync_files(&self, names: &[String]) -> Result<()> {
        self.inner.sync_files(names)
    }

    fn sync_metadata(&self) -> Result<()> {
        self.inner.sync_metadata()
    }

    fn obtain_lock(&self, name: &str) -> Result<Box<dyn StorageLock>> {
        self.inner.obtain_lock(name)
    }
}

#[derive(Debug)]
struct RateLimitedOutput {
    inner: Box<dyn StorageOutput>,
    limiter: Arc<RateLimiter>,
    unpaced: u64,
}

impl Write for RateLimitedOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.unpaced += written as u64;
        if self.unpaced >= CHECK_BYTES {
            self.limiter.pause(self.unpaced as usize);
            self.unpaced = 0;
        }
        Ok(written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

impl StorageOutput for RateLimitedOutput {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn position(&self) -> u64 {
        self.inner.position()
    }

    fn close(&mut self) -> Result<()> {
        if self.unpaced > 0 {
            self.limiter.pause(self.unpaced as usize);
            self.unpaced = 0;
        }
        self.inner.close()
    }
}
