//! Shared helpers for the integration tests.
#![allow(dead_code)]

use std::io::{self, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use tessera::document::Document;
use tessera::error::{Result, TesseraError};
use tessera::index::merge_scheduler::is_merge_thread;
use tessera::index::{
    DirectoryReader, IndexWriter, IndexWriterConfig, NoMergePolicy, SerialMergeScheduler,
};
use tessera::search::IndexSearcher;
use tessera::storage::memory::MemoryStorage;
use tessera::storage::{FileBytes, Storage, StorageLock, StorageOutput};

/// Storage operations a [`Fault`] can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultPoint {
    CreateOutput,
    Write,
    Rename,
    Sync,
    SyncMetadata,
    Delete,
}

/// One injected failure rule.
#[derive(Debug, Clone)]
pub struct Fault {
    point: FaultPoint,
    name_contains: Option<String>,
    merge_threads_only: bool,
    remaining: Option<usize>,
}

impl Fault {
    pub fn new(point: FaultPoint) -> Self {
        Fault {
            point,
            name_contains: None,
            merge_threads_only: false,
            remaining: None,
        }
    }

    /// Only fail for file names containing `pattern`.
    pub fn on_files(mut self, pattern: &str) -> Self {
        self.name_contains = Some(pattern.to_string());
        self
    }

    /// Only fail when called from a merge thread.
    pub fn on_merge_threads(mut self) -> Self {
        self.merge_threads_only = true;
        self
    }

    /// Fail at most `times` times.
    pub fn times(mut self, times: usize) -> Self {
        self.remaining = Some(times);
        self
    }

    fn matches(&self, point: FaultPoint, name: &str) -> bool {
        self.point == point
            && self.remaining != Some(0)
            && (!self.merge_threads_only || is_merge_thread())
            && self
                .name_contains
                .as_deref()
                .is_none_or(|pattern| name.contains(pattern))
    }
}

#[derive(Debug, Default)]
struct Faults {
    rules: Mutex<Vec<Fault>>,
    triggered: AtomicUsize,
}

impl Faults {
    fn check(&self, point: FaultPoint, name: &str) -> io::Result<()> {
        let mut rules = self.rules.lock();
        for rule in rules.iter_mut() {
            if rule.matches(point, name) {
                if let Some(remaining) = rule.remaining.as_mut() {
                    *remaining -= 1;
                }
                self.triggered.fetch_add(1, Ordering::SeqCst);
                return Err(io::Error::other(format!(
                    "injected {point:?} failure on {name}"
                )));
            }
        }
        Ok(())
    }
}

/// A storage wrapper that fails chosen operations on demand.
#[derive(Debug)]
pub struct FaultyStorage {
    inner: Arc<dyn Storage>,
    faults: Arc<Faults>,
}

impl FaultyStorage {
    pub fn new(inner: Arc<dyn Storage>) -> Self {
        FaultyStorage {
            inner,
            faults: Arc::new(Faults::default()),
        }
    }

    pub fn in_memory() -> Arc<Self> {
        Arc::new(FaultyStorage::new(Arc::new(MemoryStorage::default())))
    }

    pub fn inner(&self) -> &Arc<dyn Storage> {
        &self.inner
    }

    pub fn arm(&self, fault: Fault) {
        self.faults.rules.lock().push(fault);
    }

    pub fn disarm(&self) {
        self.faults.rules.lock().clear();
    }

    /// Failures injected so far.
    pub fn triggered(&self) -> usize {
        self.faults.triggered.load(Ordering::SeqCst)
    }

    fn check(&self, point: FaultPoint, name: &str) -> Result<()> {
        Ok(self.faults.check(point, name)?)
    }
}

impl Storage for FaultyStorage {
    fn open_bytes(&self, name: &str) -> Result<FileBytes> {
        self.inner.open_bytes(name)
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        self.check(FaultPoint::CreateOutput, name)?;
        Ok(Box::new(FaultyOutput {
            inner: self.inner.create_output(name)?,
            faults: Arc::clone(&self.faults),
        }))
    }

    fn file_exists(&self, name: &str) -> bool {
        self.inner.file_exists(name)
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        self.check(FaultPoint::Delete, name)?;
        self.inner.delete_file(name)
    }

    fn list_files(&self) -> Result<Vec<String>> {
        self.inner.list_files()
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        self.inner.file_size(name)
    }

    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()> {
        self.check(FaultPoint::Rename, new_name)?;
        self.inner.rename_file(old_name, new_name)
    }

    fn sync_files(&self, names: &[String]) -> Result<()> {
        for name in names {
            self.check(FaultPoint::Sync, name)?;
        }
        self.inner.sync_files(names)
    }

    fn sync_metadata(&self) -> Result<()> {
        self.check(FaultPoint::SyncMetadata, "")?;
        self.inner.sync_metadata()
    }

    fn obtain_lock(&self, name: &str) -> Result<Box<dyn StorageLock>> {
        self.inner.obtain_lock(name)
    }
}

#[derive(Debug)]
struct FaultyOutput {
    inner: Box<dyn StorageOutput>,
    faults: Arc<Faults>,
}

impl Write for FaultyOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.faults.check(FaultPoint::Write, self.inner.name())?;
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl StorageOutput for FaultyOutput {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn position(&self) -> u64 {
        self.inner.position()
    }

    fn close(&mut self) -> Result<()> {
        self.inner.close()
    }
}

pub fn memory_storage() -> Arc<dyn Storage> {
    Arc::new(MemoryStorage::default())
}

pub fn text_doc(text: &str) -> Document {
    Document::builder().add_text("body", text).build()
}

pub fn id_doc(id: &str, text: &str) -> Document {
    Document::builder()
        .add_keyword("id", id)
        .add_text("body", text)
        .build()
}

/// Deterministic writer config: merges run on the calling thread.
pub fn serial_config() -> IndexWriterConfig {
    IndexWriterConfig::new().with_merge_scheduler(Arc::new(SerialMergeScheduler::new()))
}

/// Config that never merges, so every flush stays its own segment.
pub fn no_merge_config() -> IndexWriterConfig {
    serial_config().with_merge_policy(Arc::new(NoMergePolicy))
}

/// Write `segments` committed segments of `per_segment` docs each.
pub fn build_segments(storage: Arc<dyn Storage>, segments: usize, per_segment: usize) {
    let writer = IndexWriter::open(storage, no_merge_config()).unwrap();
    for s in 0..segments {
        for d in 0..per_segment {
            writer
                .add_document(&id_doc(&format!("{s}-{d}"), &format!("segment{s} doc{d} common")))
                .unwrap();
        }
        writer.flush().unwrap();
    }
    writer.commit().unwrap();
    writer.close().unwrap();
}

/// Stored `id` values of the live documents of the latest commit.
pub fn committed_ids(storage: Arc<dyn Storage>) -> Vec<String> {
    let reader = DirectoryReader::open(storage).unwrap();
    let ids = live_ids(&reader);
    reader.close().unwrap();
    ids
}

/// Stored `id` values of the live documents of `reader`, sorted.
pub fn live_ids(reader: &DirectoryReader) -> Vec<String> {
    let mut ids = Vec::new();
    for segment in reader.leaves() {
        for doc in 0..segment.max_doc() {
            if !segment.is_live(doc) {
                continue;
            }
            for field in segment.document(doc).unwrap() {
                if field.name == "id" {
                    if let Some(text) = field.value.as_text() {
                        ids.push(text.to_string());
                    }
                }
            }
        }
    }
    ids.sort();
    ids
}

/// Number of live documents containing `term` in `body`.
pub fn count_body(reader: DirectoryReader, term: &str) -> usize {
    let searcher = IndexSearcher::new(reader);
    let query = tessera::search::TermQuery::new(tessera::index::Term::new("body", term));
    let count = searcher.count(&query).unwrap();
    searcher.reader().close().unwrap();
    count
}

pub fn is_merge_failure(err: &TesseraError) -> bool {
    matches!(err, TesseraError::MergeFailed(_))
}
