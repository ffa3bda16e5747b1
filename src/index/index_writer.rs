//! The index writer.
//!
//! An [`IndexWriter`] owns the write lock of one index. Documents go into
//! the per-thread buffers of its [`DocumentsWriter`]; deletes and
//! doc-values updates are queued with sequence numbers and applied lazily to
//! the per-segment state in the reader pool. Flushed segments are published
//! into the pool, merges replace groups of them, and [`IndexWriter::commit`]
//! makes the current pool durable as a new `segments_N`.
//!
//! Locks are taken in a fixed order: the commit lock, then the full-flush
//! lock of the documents writer, then the segment state, then the pool lock
//! of the documents writer. None of them is held while a segment is
//! written.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use tessera::document::Document;
//! use tessera::index::{DirectoryReader, IndexWriter, IndexWriterConfig, Term};
//! use tessera::storage::memory::MemoryStorage;
//! use tessera::storage::Storage;
//!
//! # fn main() -> tessera::error::Result<()> {
//! let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::default());
//! let writer = IndexWriter::open(Arc::clone(&storage), IndexWriterConfig::default())?;
//! writer.add_document(&Document::builder().add_text("text", "a b c").build())?;
//! writer.add_document(&Document::builder().add_text("text", "a c e").build())?;
//! writer.commit()?;
//! writer.close()?;
//!
//! let reader = DirectoryReader::open(storage)?;
//! assert_eq!(reader.num_docs(), 2);
//! assert_eq!(reader.doc_freq(&Term::new("text", "a"))?, 2);
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex};

use crate::codec::NumericUpdates;
use crate::document::Document;
use crate::error::{Result, TesseraError};
use crate::index::delete_queue::UpdateOp;
use crate::index::directory_reader::{DirectoryReader, NrtOrigin, NrtSource};
use crate::index::documents_writer::{DocumentsWriter, FlushSettings, FlushTarget};
use crate::index::documents_writer_per_thread::{FlushedSegment, InvertContext};
use crate::index::field_infos::{DocValuesType, FieldNumbers};
use crate::index::file_deleter::FileDeleter;
use crate::index::index_writer_config::{IndexWriterConfig, OpenMode};
use crate::index::merge::{MergeSource, MergeState, OneMerge};
use crate::index::merge_policy::{MergeSpecification, MergeTrigger};
use crate::index::reader_pool::{ReaderPool, ReadersAndUpdates};
use crate::index::segment_info::SegmentCommitInfo;
use crate::index::segment_infos::{SegmentInfos, last_commit_generation};
use crate::index::segment_merger::{
    MergeInput, MergedSegment, SegmentMerger, changed_updates, newly_deleted,
};
use crate::index::segment_reader::{SegmentCoreReaders, SegmentReader};
use crate::index::term::Term;
use crate::search::query::Query;
use crate::storage::{Storage, StorageLock, WRITE_LOCK_NAME};
use crate::util::to_base36;

static NEXT_WRITER_ID: AtomicU64 = AtomicU64::new(1);

/// How often waiters re-check merge progress.
const MERGE_WAIT: Duration = Duration::from_millis(100);

/// Lifecycle of a writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy)]
enum MergeMode {
    Natural(MergeTrigger),
    Forced(usize),
    ForcedDeletes,
}

/// Segment list, file references, commit bookkeeping and merge registry.
struct SegmentsState {
    pool: ReaderPool,
    deleter: FileDeleter,
    counter: u64,
    /// Bumped on every change visible to readers.
    version: u64,
    committed_version: u64,
    last_commit: SegmentInfos,
    /// What a rollback returns to.
    rollback_segments: Vec<SegmentCommitInfo>,
    next_generation: u64,
    /// The next commit writes even without changes.
    commit_pending: bool,
    pending_merges: VecDeque<Arc<OneMerge>>,
    running_merges: Vec<Arc<OneMerge>>,
    next_merge_id: u64,
    merge_failure: Option<String>,
}

impl SegmentsState {
    fn next_segment_name(&mut self) -> String {
        let name = format!("_{}", to_base36(self.counter));
        self.counter += 1;
        name
    }

    fn live_files(&self) -> BTreeSet<String> {
        self.pool.iter().flat_map(|s| s.info().files()).collect()
    }

    fn segment_names(&self) -> Vec<String> {
        self.pool.iter().map(|s| s.name().to_string()).collect()
    }

    /// Record the pool's files with the deleter after a change.
    fn checkpoint(&mut self) {
        let files = self.live_files();
        self.deleter.checkpoint(files);
        self.version += 1;
    }

    fn unmark(&mut self, merge: &OneMerge) {
        for name in merge.segments() {
            if let Some(segment) = self.pool.get_mut(name) {
                segment.set_merging(false);
            }
        }
    }

    fn forget_merge(&mut self, merge: &Arc<OneMerge>) {
        self.pending_merges.retain(|m| !Arc::ptr_eq(m, merge));
        self.running_merges.retain(|m| !Arc::ptr_eq(m, merge));
    }

    /// Register the merges of `spec` whose sources are present and free.
    fn register(&mut self, spec: MergeSpecification) -> usize {
        let mut registered = 0;
        for candidate in spec.merges {
            let available = !candidate.segments.is_empty()
                && candidate
                    .segments
                    .iter()
                    .all(|name| self.pool.get(name).is_some_and(|s| !s.is_merging()));
            if !available {
                debug!("skipping merge of {:?}: sources busy or gone", candidate.segments);
                continue;
            }
            for name in &candidate.segments {
                if let Some(segment) = self.pool.get_mut(name) {
                    segment.set_merging(true);
                }
            }
            let merge = Arc::new(OneMerge::new(self.next_merge_id, candidate));
            self.next_merge_id += 1;
            debug!("registered {merge} ({:?})", merge.reason());
            self.pending_merges.push_back(merge);
            registered += 1;
        }
        registered
    }
}

struct WriterInner {
    id: u64,
    storage: Arc<dyn Storage>,
    config: IndexWriterConfig,
    field_numbers: Arc<FieldNumbers>,
    docs_writer: DocumentsWriter,
    segments: Mutex<SegmentsState>,
    merges_changed: Condvar,
    commit_lock: Mutex<()>,
    lifecycle: Mutex<WriterState>,
    write_lock: Mutex<Option<Box<dyn StorageLock>>>,
    flushed_since_merge: AtomicBool,
    self_ref: Weak<WriterInner>,
}

/// Adds, updates and deletes documents and commits them.
///
/// All methods take `&self`; a writer is shared between indexing threads
/// by reference or in an `Arc`. Dropping an open writer closes it.
pub struct IndexWriter {
    inner: Arc<WriterInner>,
}

impl IndexWriter {
    /// Open a writer on `storage`, obtaining its write lock.
    pub fn open(storage: Arc<dyn Storage>, config: IndexWriterConfig) -> Result<Self> {
        config.validate()?;
        let write_lock = storage.obtain_lock(WRITE_LOCK_NAME)?;
        let exists = SegmentInfos::index_exists(&*storage)?;
        let (last_commit, create) = match (config.open_mode, exists) {
            (OpenMode::Append, false) => {
                return Err(TesseraError::index_not_found(
                    "cannot append: storage holds no commit",
                ));
            }
            (OpenMode::Create, true) => match SegmentInfos::read_latest(&*storage) {
                Ok(infos) => (infos, true),
                Err(e) => {
                    warn!("replacing unreadable index: {e}");
                    let generation = last_commit_generation(&storage.list_files()?[..]).unwrap_or(0);
                    (
                        SegmentInfos {
                            generation,
                            ..SegmentInfos::new()
                        },
                        true,
                    )
                }
            },
            (_, true) => (SegmentInfos::read_latest(&*storage)?, false),
            (_, false) => (SegmentInfos::new(), true),
        };

        let mut pool = ReaderPool::new();
        if !create {
            for info in &last_commit.segments {
                pool.push(ReadersAndUpdates::open(&storage, info.clone(), 0)?);
            }
        }
        let field_numbers = Arc::new(FieldNumbers::from_segments(
            pool.iter().map(|s| &**s.core().field_infos()),
        )?);

        let mut deleter = FileDeleter::new(Arc::clone(&storage), last_commit.files(true));
        deleter.checkpoint(pool.iter().flat_map(|s| s.info().files()).collect());
        deleter.refresh()?;
        let segments = SegmentsState {
            rollback_segments: pool.commit_infos(),
            pool,
            deleter,
            counter: last_commit.counter,
            version: last_commit.version,
            committed_version: last_commit.version,
            next_generation: last_commit.generation + 1,
            commit_pending: create,
            last_commit,
            pending_merges: VecDeque::new(),
            running_merges: Vec::new(),
            next_merge_id: 0,
            merge_failure: None,
        };

        let docs_writer = DocumentsWriter::new(
            Arc::clone(&storage),
            Arc::clone(&config.codec),
            InvertContext {
                analyzer: Arc::clone(&config.analyzer),
                field_numbers: Arc::clone(&field_numbers),
                max_term_length: config.max_term_length,
            },
            FlushSettings {
                ram_budget_bytes: config.ram_budget_bytes(),
                max_buffered_docs: config.max_buffered_docs,
            },
        );
        let id = NEXT_WRITER_ID.fetch_add(1, Ordering::Relaxed);
        info!(
            "opened writer {id}: generation {}, {} segments, create={create}",
            segments.last_commit.generation,
            segments.pool.len()
        );
        let inner = Arc::new_cyclic(|self_ref| WriterInner {
            id,
            storage,
            config,
            field_numbers,
            docs_writer,
            segments: Mutex::new(segments),
            merges_changed: Condvar::new(),
            commit_lock: Mutex::new(()),
            lifecycle: Mutex::new(WriterState::Open),
            write_lock: Mutex::new(Some(write_lock)),
            flushed_since_merge: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        });
        Ok(IndexWriter { inner })
    }

    pub fn config(&self) -> &IndexWriterConfig {
        &self.inner.config
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.inner.storage
    }

    pub fn state(&self) -> WriterState {
        *self.inner.lifecycle.lock()
    }

    pub fn is_open(&self) -> bool {
        self.state() == WriterState::Open
    }

    /// Add one document; returns its sequence number.
    pub fn add_document(&self, doc: &Document) -> Result<u64> {
        self.inner.update_documents(std::slice::from_ref(doc), None)
    }

    /// Add documents as one block with consecutive doc ids and one
    /// sequence number.
    pub fn add_documents(&self, docs: &[Document]) -> Result<u64> {
        self.inner.update_documents(docs, None)
    }

    /// Delete the documents containing `term`, then add `doc`.
    pub fn update_document(&self, term: Term, doc: &Document) -> Result<u64> {
        self.inner
            .update_documents(std::slice::from_ref(doc), Some(UpdateOp::DeleteTerm(term)))
    }

    /// Delete the documents containing `term`, then add `docs` as a block.
    pub fn update_documents(&self, term: Term, docs: &[Document]) -> Result<u64> {
        self.inner
            .update_documents(docs, Some(UpdateOp::DeleteTerm(term)))
    }

    /// Delete every document containing any of `terms`.
    pub fn delete_documents(&self, terms: &[Term]) -> Result<u64> {
        self.inner.ensure_open()?;
        let ops = terms.iter().cloned().map(UpdateOp::DeleteTerm).collect();
        Ok(self.inner.docs_writer.push_ops(ops))
    }

    /// Delete every document matching `query`.
    pub fn delete_documents_query(&self, query: Box<dyn Query>) -> Result<u64> {
        self.inner.ensure_open()?;
        Ok(self.inner.docs_writer.push_op(UpdateOp::DeleteQuery(query)))
    }

    /// Set numeric doc value `field` of every document containing `term`.
    pub fn update_numeric_doc_value(&self, term: Term, field: &str, value: i64) -> Result<u64> {
        self.inner.ensure_open()?;
        match self.inner.field_numbers.get(field) {
            Some(info) if info.doc_values_type == DocValuesType::Numeric => {}
            Some(info) => {
                return Err(TesseraError::illegal_argument(format!(
                    "field '{field}' has {:?} doc values, not numeric",
                    info.doc_values_type
                )));
            }
            None => {
                return Err(TesseraError::illegal_argument(format!(
                    "cannot update unknown field '{field}'"
                )));
            }
        }
        Ok(self.inner.docs_writer.push_op(UpdateOp::NumericUpdate {
            term,
            field: field.to_string(),
            value,
        }))
    }

    /// Delete every document added before this call.
    pub fn delete_all(&self) -> Result<u64> {
        self.inner.ensure_open()?;
        Ok(self.inner.docs_writer.push_op(UpdateOp::DeleteAll))
    }

    /// Make every change up to now durable; returns the cutoff sequence
    /// number. User data of the previous commit is carried over.
    pub fn commit(&self) -> Result<u64> {
        self.inner.ensure_open()?;
        self.inner.commit_internal(None, true)
    }

    /// Commit, recording `user_data` with the commit.
    pub fn commit_with_user_data(&self, user_data: BTreeMap<String, String>) -> Result<u64> {
        self.inner.ensure_open()?;
        self.inner.commit_internal(Some(user_data), true)
    }

    /// Flush every buffered document into segments without committing.
    pub fn flush(&self) -> Result<()> {
        self.inner.ensure_open()?;
        self.inner.flush_internal(true).map(|_| ())
    }

    /// Ask the merge policy for merges and hand them to the scheduler.
    pub fn maybe_merge(&self) -> Result<()> {
        self.inner.ensure_open()?;
        self.inner.check_merge_failures()?;
        self.inner.maybe_merge_internal(MergeTrigger::Explicit)?;
        self.inner.check_merge_failures()
    }

    /// Merge down to at most `max_num_segments` segments, blocking until
    /// done.
    pub fn force_merge(&self, max_num_segments: usize) -> Result<()> {
        if max_num_segments == 0 {
            return Err(TesseraError::illegal_argument(
                "max_num_segments must be at least 1",
            ));
        }
        self.inner.ensure_open()?;
        self.inner.flush_internal(false)?;
        info!("force merging to {max_num_segments} segments");
        self.inner.forced_merge_loop(MergeMode::Forced(max_num_segments))
    }

    /// Merge away deleted documents, blocking until done.
    pub fn force_merge_deletes(&self) -> Result<()> {
        self.inner.ensure_open()?;
        self.inner.flush_internal(false)?;
        info!("force merging deletes");
        self.inner.forced_merge_loop(MergeMode::ForcedDeletes)
    }

    /// Block until no merge is pending or running.
    pub fn wait_for_merges(&self) -> Result<()> {
        self.inner.ensure_open()?;
        self.inner.wait_for_merges_internal()
    }

    /// Raise a failure of a background merge, if one happened.
    pub fn check_merge_failures(&self) -> Result<()> {
        self.inner.check_merge_failures()
    }

    /// Discard everything since the last commit. The writer stays open.
    pub fn rollback(&self) -> Result<()> {
        if self.state() == WriterState::Closed {
            return Err(TesseraError::already_closed("index writer is closed"));
        }
        self.inner.rollback_internal()
    }

    /// Close the writer, committing first when `commit_on_close` is set.
    ///
    /// Closing a closed writer does nothing.
    pub fn close(&self) -> Result<()> {
        self.inner.close()
    }

    /// A near-real-time reader over everything added so far.
    pub fn get_reader(&self) -> Result<DirectoryReader> {
        self.inner
            .nrt_reader(None)?
            .ok_or_else(|| TesseraError::illegal_state("no reader was opened"))
    }

    /// A new near-real-time reader if anything changed since `old`.
    pub fn get_reader_if_changed(&self, old: &DirectoryReader) -> Result<Option<DirectoryReader>> {
        self.inner.nrt_reader(Some(old))
    }

    /// Live documents, buffered ones included.
    pub fn num_docs(&self) -> u64 {
        let flushed: u64 = self
            .inner
            .segments
            .lock()
            .pool
            .iter()
            .map(|s| u64::from(s.num_docs()))
            .sum();
        flushed + u64::from(self.inner.docs_writer.num_buffered_docs())
    }

    /// Documents including deleted ones, buffered ones included.
    pub fn max_doc(&self) -> u64 {
        let flushed: u64 = self
            .inner
            .segments
            .lock()
            .pool
            .iter()
            .map(|s| u64::from(s.max_doc()))
            .sum();
        flushed + u64::from(self.inner.docs_writer.num_buffered_docs())
    }

    /// Names of the writer's segments in index order.
    pub fn segment_names(&self) -> Vec<String> {
        self.inner.segments.lock().segment_names()
    }

    pub fn segment_count(&self) -> usize {
        self.inner.segments.lock().pool.len()
    }

    pub fn pending_merge_count(&self) -> usize {
        self.inner.pending_merge_count()
    }

    pub fn running_merge_count(&self) -> usize {
        self.inner.running_merge_count()
    }

    /// Generation of the last successful commit; 0 before the first.
    pub fn last_commit_generation(&self) -> u64 {
        self.inner.segments.lock().last_commit.generation
    }

    /// User data of the last successful commit.
    pub fn commit_user_data(&self) -> BTreeMap<String, String> {
        self.inner.segments.lock().last_commit.user_data.clone()
    }

    /// True when a commit would change the index.
    pub fn has_uncommitted_changes(&self) -> bool {
        let changed = {
            let seg = self.inner.segments.lock();
            seg.commit_pending
                || seg.version != seg.committed_version
                || seg.pool.iter().any(ReadersAndUpdates::is_dirty)
        };
        changed
            || self.inner.docs_writer.num_buffered_docs() > 0
            || self.inner.docs_writer.queued_ops() > 0
    }

    /// Bytes held by indexing buffers.
    pub fn ram_bytes_used(&self) -> usize {
        self.inner.docs_writer.ram_bytes_used()
    }

    /// Times an indexing thread waited for flushes to catch up.
    pub fn flush_stall_count(&self) -> u64 {
        self.inner.docs_writer.stall_count()
    }

    pub fn field_numbers(&self) -> &Arc<FieldNumbers> {
        &self.inner.field_numbers
    }

    /// Sequence number of the most recent operation.
    pub fn last_sequence_number(&self) -> u64 {
        self.inner.docs_writer.last_seq()
    }
}

impl Drop for IndexWriter {
    fn drop(&mut self) {
        if self.is_open() {
            if let Err(e) = self.close() {
                warn!("closing writer {} on drop failed: {e}", self.inner.id);
            }
        }
    }
}

impl fmt::Debug for IndexWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexWriter")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("segments", &self.segment_count())
            .field("docs_writer", &self.inner.docs_writer)
            .finish()
    }
}

impl WriterInner {
    fn ensure_open(&self) -> Result<()> {
        match *self.lifecycle.lock() {
            WriterState::Open => Ok(()),
            state => Err(TesseraError::already_closed(format!(
                "index writer is {state:?}"
            ))),
        }
    }

    fn update_documents(&self, docs: &[Document], delete: Option<UpdateOp>) -> Result<u64> {
        self.ensure_open()?;
        self.config.merge_scheduler.maybe_stall(self);
        let seq = self.docs_writer.update_documents(docs, delete, self)?;
        if self.flushed_since_merge.swap(false, Ordering::AcqRel) {
            if let Err(e) = self.maybe_merge_internal(MergeTrigger::SegmentFlush) {
                warn!("scheduling merges after a flush failed: {e}");
            }
        }
        Ok(seq)
    }

    fn check_merge_failures(&self) -> Result<()> {
        match self.segments.lock().merge_failure.take() {
            Some(message) => Err(TesseraError::merge_failed(message)),
            None => Ok(()),
        }
    }

    /// Apply queued operations up to `upto` and drop emptied segments.
    fn apply_all_deletes(&self, seg: &mut SegmentsState, upto: u64) -> Result<()> {
        let applied = seg.pool.apply_deletes(&self.docs_writer, upto)?;
        let dropped = seg.pool.drop_fully_deleted();
        if !dropped.is_empty() {
            info!("dropping {} fully deleted segments", dropped.len());
            drop(dropped);
            seg.checkpoint();
        } else if applied.new_deletes > 0 || applied.dv_updates > 0 {
            seg.version += 1;
        }
        self.docs_writer.prune_queue(seg.pool.min_applied_seq());
        Ok(())
    }

    /// Full flush with deletes applied; returns the cutoff.
    fn flush_internal(&self, trigger_merges: bool) -> Result<u64> {
        self.check_merge_failures()?;
        let full_flush = self.docs_writer.flush_all_threads(self)?;
        let cutoff = full_flush.cutoff();
        {
            let mut seg = self.segments.lock();
            self.apply_all_deletes(&mut seg, cutoff)?;
        }
        drop(full_flush);
        if trigger_merges {
            self.maybe_merge_internal(MergeTrigger::FullFlush)?;
        }
        Ok(cutoff)
    }

    fn commit_internal(
        &self,
        user_data: Option<BTreeMap<String, String>>,
        trigger_merges: bool,
    ) -> Result<u64> {
        let _commit = self.commit_lock.lock();
        self.check_merge_failures()?;
        let full_flush = self.docs_writer.flush_all_threads(self)?;
        let cutoff = full_flush.cutoff();

        let (infos, files) = {
            let mut seg = self.segments.lock();
            self.apply_all_deletes(&mut seg, cutoff)?;
            if seg.pool.iter().any(ReadersAndUpdates::is_dirty) {
                seg.pool.write_pending(&*self.storage)?;
                seg.checkpoint();
            }
            if !seg.commit_pending && user_data.is_none() && seg.version == seg.committed_version {
                debug!("nothing changed since generation {}", seg.last_commit.generation);
                return Ok(cutoff);
            }
            let generation = seg.next_generation;
            seg.next_generation += 1;
            let infos = SegmentInfos {
                segments: seg.pool.commit_infos(),
                generation,
                version: seg.version,
                counter: seg.counter,
                user_data: user_data.unwrap_or_else(|| seg.last_commit.user_data.clone()),
            };
            let files = infos.files(false);
            seg.deleter.inc_ref(&files);
            (infos, files)
        };
        drop(full_flush);

        let result = infos
            .write_pending(&*self.storage, infos.generation)
            .and_then(|_| SegmentInfos::finish_commit(&*self.storage, infos.generation, &files));

        {
            let mut seg = self.segments.lock();
            match result {
                Ok(segments_file) => {
                    let mut commit_files = files.clone();
                    commit_files.insert(segments_file);
                    seg.deleter.commit(commit_files);
                    seg.deleter.dec_ref(&files);
                    seg.committed_version = infos.version;
                    seg.commit_pending = false;
                    seg.rollback_segments = infos.segments.clone();
                    info!(
                        "committed generation {} of writer {}: {} segments, {} docs, up to seq {cutoff}",
                        infos.generation,
                        self.id,
                        infos.len(),
                        infos.total_num_docs()
                    );
                    seg.last_commit = infos;
                }
                Err(e) => {
                    seg.deleter.dec_ref(&files);
                    warn!("commit of generation {} failed: {e}", infos.generation);
                    return Err(e);
                }
            }
        }
        if trigger_merges {
            self.maybe_merge_internal(MergeTrigger::FullFlush)?;
        }
        Ok(cutoff)
    }

    fn rollback_internal(&self) -> Result<()> {
        let _commit = self.commit_lock.lock();
        {
            let mut seg = self.segments.lock();
            info!(
                "rolling back writer {} to generation {}",
                self.id, seg.last_commit.generation
            );
            let pending: Vec<_> = seg.pending_merges.drain(..).collect();
            for merge in pending {
                merge.abort();
                merge.set_state(MergeState::Aborted);
                seg.unmark(&merge);
            }
            for merge in &seg.running_merges {
                merge.abort();
            }
        }
        self.docs_writer.abort();

        let mut seg = self.segments.lock();
        while !seg.running_merges.is_empty() {
            self.merges_changed.wait_for(&mut seg, MERGE_WAIT);
        }
        let upto = self.docs_writer.last_seq();
        let old = seg.pool.take_all();
        let mut pool = ReaderPool::new();
        for info in seg.rollback_segments.clone() {
            let previous = old
                .iter()
                .find(|s| s.name() == info.name() && s.core().info().id == info.info.id);
            let segment = match previous {
                Some(previous) => {
                    previous.core().inc_ref()?;
                    ReadersAndUpdates::with_core(&self.storage, Arc::clone(previous.core()), info, upto)?
                }
                None => ReadersAndUpdates::open(&self.storage, info, upto)?,
            };
            pool.push(segment);
        }
        drop(old);
        seg.pool = pool;
        seg.merge_failure = None;
        seg.checkpoint();
        seg.committed_version = seg.version;
        seg.deleter.refresh()?;
        self.merges_changed.notify_all();
        Ok(())
    }

    fn close(&self) -> Result<()> {
        {
            let mut lifecycle = self.lifecycle.lock();
            if *lifecycle != WriterState::Open {
                return Ok(());
            }
            *lifecycle = WriterState::Closing;
        }
        info!("closing writer {}", self.id);
        let result = if self.config.commit_on_close {
            // A failed merge left its sources live; commit them anyway and
            // report the failure afterwards.
            let parked = self.check_merge_failures().err();
            let committed = self
                .flush_internal(false)
                .and_then(|_| self.wait_for_merges_internal())
                .and_then(|()| {
                    let late = self.check_merge_failures().err();
                    self.commit_internal(None, false).map(|_| late)
                });
            match committed {
                Ok(late) => match parked.or(late) {
                    Some(e) => {
                        warn!("writer {} committed on close after a merge failure: {e}", self.id);
                        Err(e)
                    }
                    None => Ok(()),
                },
                Err(e) => {
                    warn!("closing writer {} failed, rolling back: {e}", self.id);
                    if let Err(rollback) = self.rollback_internal() {
                        error!("rollback while closing failed: {rollback}");
                    }
                    Err(e)
                }
            }
        } else {
            self.rollback_internal()
        };
        if let Err(e) = self.config.merge_scheduler.close() {
            warn!("closing merge scheduler: {e}");
        }
        {
            let mut seg = self.segments.lock();
            let leftover: Vec<_> = seg.pending_merges.drain(..).collect();
            for merge in leftover {
                merge.set_state(MergeState::Aborted);
                seg.unmark(&merge);
            }
            drop(seg.pool.take_all());
        }
        if let Some(mut lock) = self.write_lock.lock().take() {
            if let Err(e) = lock.release() {
                warn!("releasing {WRITE_LOCK_NAME}: {e}");
            }
        }
        *self.lifecycle.lock() = WriterState::Closed;
        info!("closed writer {}", self.id);
        result
    }

    fn nrt_reader(&self, old: Option<&DirectoryReader>) -> Result<Option<DirectoryReader>> {
        self.ensure_open()?;
        if let Some(old) = old {
            old.ensure_open()?;
            if old.writer_id() != Some(self.id) {
                return Err(TesseraError::illegal_argument(
                    "reader was not opened from this writer",
                ));
            }
        }
        let full_flush = self.docs_writer.flush_all_threads(self)?;
        let cutoff = full_flush.cutoff();
        let built = {
            let mut seg = self.segments.lock();
            self.apply_all_deletes(&mut seg, cutoff)?;
            let mut readers: Vec<Arc<SegmentReader>> = Vec::with_capacity(seg.pool.len());
            let mut all_shared = old.is_some_and(|o| o.leaves().len() == seg.pool.len());
            for segment in seg.pool.iter() {
                let shared = old.and_then(|o| {
                    o.shareable(segment.core(), segment.live(), segment.dv_updates())
                });
                let next = match shared {
                    Some(shared) => shared.inc_ref().map(|()| Arc::clone(shared)),
                    None => {
                        all_shared = false;
                        segment.reader().map(Arc::new)
                    }
                };
                match next {
                    Ok(reader) => readers.push(reader),
                    Err(e) => {
                        release_readers(&readers);
                        return Err(e);
                    }
                }
            }
            if all_shared {
                release_readers(&readers);
                None
            } else {
                let files = seg.live_files();
                seg.deleter.inc_ref(&files);
                Some((
                    readers,
                    files,
                    seg.version,
                    seg.last_commit.generation,
                    seg.last_commit.user_data.clone(),
                ))
            }
        };
        drop(full_flush);

        let Some((readers, files, version, generation, user_data)) = built else {
            return Ok(None);
        };
        let writer: Weak<dyn NrtSource> = self.self_ref.clone();
        let reader = DirectoryReader::from_parts(
            Arc::clone(&self.storage),
            readers,
            generation,
            version,
            user_data,
            Some(NrtOrigin {
                writer,
                writer_id: self.id,
                seq: cutoff,
                pinned_files: files,
            }),
        );
        debug!(
            "opened NRT reader at version {version}: {} segments, {} docs",
            reader.leaves().len(),
            reader.num_docs()
        );
        if let Err(e) = self.maybe_merge_internal(MergeTrigger::FullFlush) {
            warn!("scheduling merges after opening a reader failed: {e}");
        }
        Ok(Some(reader))
    }

    fn pending_merge_count(&self) -> usize {
        self.segments.lock().pending_merges.len()
    }

    fn running_merge_count(&self) -> usize {
        self.segments.lock().running_merges.len()
    }

    /// Ask the policy for merges and register them; returns how many.
    fn update_pending_merges(&self, mode: MergeMode) -> usize {
        let mut seg = self.segments.lock();
        let infos = seg.pool.size_infos(&*self.storage);
        let policy = &self.config.merge_policy;
        let spec = match mode {
            MergeMode::Natural(trigger) => policy.find_merges(trigger, &infos),
            MergeMode::Forced(max) => policy.find_forced_merges(&infos, max),
            MergeMode::ForcedDeletes => policy.find_forced_deletes_merges(&infos),
        };
        spec.map_or(0, |spec| seg.register(spec))
    }

    fn maybe_merge_internal(&self, trigger: MergeTrigger) -> Result<()> {
        let registered = self.update_pending_merges(MergeMode::Natural(trigger));
        if registered == 0 && self.pending_merge_count() == 0 {
            return Ok(());
        }
        self.run_scheduler(trigger)
    }

    fn run_scheduler(&self, trigger: MergeTrigger) -> Result<()> {
        let Some(source) = self.self_ref.upgrade() else {
            return Ok(());
        };
        let source: Arc<dyn MergeSource> = source;
        match self.config.merge_scheduler.merge(source, trigger) {
            // Parked in the failure slot by the merge itself.
            Err(TesseraError::MergeFailed(_)) | Err(TesseraError::MergeAborted(_)) => Ok(()),
            other => other,
        }
    }

    fn wait_for_merges_internal(&self) -> Result<()> {
        if self.pending_merge_count() > 0 {
            self.run_scheduler(MergeTrigger::Explicit)?;
        }
        let mut seg = self.segments.lock();
        while !seg.pending_merges.is_empty() || !seg.running_merges.is_empty() {
            self.merges_changed.wait_for(&mut seg, MERGE_WAIT);
        }
        Ok(())
    }

    fn forced_merge_loop(&self, mode: MergeMode) -> Result<()> {
        loop {
            self.check_merge_failures()?;
            let before = self.segments.lock().segment_names();
            let registered = self.update_pending_merges(mode);
            if registered > 0 || self.pending_merge_count() > 0 {
                self.run_scheduler(MergeTrigger::Explicit)?;
            }
            self.wait_for_merges_internal()?;
            self.check_merge_failures()?;
            if self.segments.lock().segment_names() == before {
                return Ok(());
            }
        }
    }

    fn execute_merge(&self, merge: &Arc<OneMerge>) -> Result<()> {
        merge.set_state(MergeState::Running);
        let inputs = self.prepare_merge(merge)?;
        let name = self.segments.lock().next_segment_name();
        merge.set_merged_name(&name);
        info!("starting {merge}");

        let storage = self
            .config
            .merge_scheduler
            .wrap_storage(Arc::clone(&self.storage));
        let merged = SegmentMerger::new(
            &inputs,
            storage,
            Arc::clone(&self.config.codec),
            &self.field_numbers,
            merge,
        )
        .merge(&name)?;
        self.commit_merge(merge, &inputs, merged)
    }

    /// Re-validate the sources and snapshot them.
    fn prepare_merge(&self, merge: &OneMerge) -> Result<Vec<MergeInput>> {
        merge.check_aborted()?;
        let mut seg = self.segments.lock();
        let upto = self.docs_writer.applicable_seq();
        let mut inputs = Vec::with_capacity(merge.segments().len());
        for name in merge.segments() {
            let segment = seg
                .pool
                .get_mut(name)
                .filter(|s| s.is_merging())
                .ok_or_else(|| {
                    TesseraError::illegal_state(format!("{merge}: source {name} is not registered"))
                })?;
            let ops = self.docs_writer.ops_in(segment.applied_seq(), upto);
            segment.apply(&ops, upto)?;
            inputs.push(MergeInput::new(
                Arc::clone(segment.core()),
                Arc::clone(segment.live()),
                Arc::clone(segment.dv_updates()),
            )?);
        }
        Ok(inputs)
    }

    /// Replace the sources with the merged segment, carrying over changes
    /// that landed on the sources while merging.
    fn commit_merge(
        &self,
        merge: &Arc<OneMerge>,
        inputs: &[MergeInput],
        merged: MergedSegment,
    ) -> Result<()> {
        let MergedSegment {
            info,
            doc_maps,
            field_infos: _,
        } = merged;
        let info = Arc::new(info);
        let core = if info.max_doc == 0 {
            None
        } else {
            match SegmentCoreReaders::open(Arc::clone(&self.storage), Arc::clone(&info)) {
                Ok(core) => Some(Arc::new(core)),
                Err(e) => {
                    self.segments.lock().deleter.delete_new_files(&info.files);
                    return Err(e);
                }
            }
        };

        let mut seg = self.segments.lock();
        if merge.is_aborted() {
            release_core(core.as_ref());
            seg.deleter.delete_new_files(&info.files);
            return Err(TesseraError::merge_aborted(merge.to_string()));
        }

        let upto = self.docs_writer.applicable_seq();
        let mut carried_deletes = Vec::new();
        let mut carried_updates = NumericUpdates::new();
        let mut doc_seqs: Option<Vec<u64>> = None;
        for ((name, input), doc_map) in merge.segments().iter().zip(inputs).zip(&doc_maps) {
            let Some(source) = seg.pool.get_mut(name) else {
                release_core(core.as_ref());
                seg.deleter.delete_new_files(&info.files);
                return Err(TesseraError::illegal_state(format!(
                    "{merge}: source {name} vanished"
                )));
            };
            let ops = self.docs_writer.ops_in(source.applied_seq(), upto);
            if let Err(e) = source.apply(&ops, upto) {
                release_core(core.as_ref());
                seg.deleter.delete_new_files(&info.files);
                return Err(e);
            }
            carried_deletes.extend(newly_deleted(input.live(), source.live(), doc_map));
            for (field, column) in changed_updates(input.dv_updates(), source.dv_updates(), doc_map) {
                carried_updates.entry(field).or_default().extend(column);
            }
            if let Some(seqs) = source.doc_seqs() {
                let merged_seqs = doc_seqs.get_or_insert_with(|| vec![0; info.max_doc as usize]);
                for (doc, mapped) in doc_map.iter().enumerate() {
                    if let (Some(mapped), Some(seq)) = (mapped, seqs.get(doc)) {
                        merged_seqs[*mapped as usize] = *seq;
                    }
                }
            }
        }

        let position = merge
            .segments()
            .iter()
            .filter_map(|name| seg.pool.position(name))
            .min()
            .unwrap_or(seg.pool.len());
        for name in merge.segments() {
            drop(seg.pool.remove(name));
        }
        let mut kept = false;
        if let Some(core) = core {
            let mut segment =
                ReadersAndUpdates::merged(core, SegmentCommitInfo::new(Arc::clone(&info)), upto, doc_seqs);
            segment.delete_docs(&carried_deletes);
            segment.update_doc_values(&carried_updates);
            if segment.is_fully_deleted() {
                info!("{merge} produced only deleted documents; dropping it");
            } else {
                seg.pool.insert(position, segment);
                kept = true;
            }
        }
        seg.checkpoint();
        if !kept {
            seg.deleter.delete_new_files(&info.files);
        }
        seg.forget_merge(merge);
        merge.set_state(MergeState::Committed);
        info!(
            "{merge} committed in {} ms: {} docs, {} deletes carried over",
            merge.elapsed_ms(),
            info.max_doc,
            carried_deletes.len()
        );

        let infos = seg.pool.size_infos(&*self.storage);
        if let Some(spec) = self
            .config
            .merge_policy
            .find_merges(MergeTrigger::MergeFinished, &infos)
        {
            seg.register(spec);
        }
        drop(seg);
        self.merges_changed.notify_all();
        Ok(())
    }

    fn finish_failed_merge(&self, merge: &Arc<OneMerge>, err: &TesseraError) {
        let mut seg = self.segments.lock();
        seg.unmark(merge);
        seg.forget_merge(merge);
        if merge.is_aborted() || matches!(err, TesseraError::MergeAborted(_)) {
            merge.set_state(MergeState::Aborted);
            info!("{merge} aborted");
        } else {
            merge.set_state(MergeState::Failed);
            error!("{merge} failed: {err}");
            seg.merge_failure
                .get_or_insert_with(|| format!("{merge}: {err}"));
        }
        drop(seg);
        self.merges_changed.notify_all();
    }
}

fn release_core(core: Option<&Arc<SegmentCoreReaders>>) {
    if let Some(core) = core {
        if let Err(e) = core.dec_ref() {
            warn!("releasing core readers of {} failed: {e}", core.info().name);
        }
    }
}

fn release_readers(readers: &[Arc<SegmentReader>]) {
    for reader in readers {
        if let Err(e) = reader.dec_ref() {
            warn!("releasing reader of segment {} failed: {e}", reader.name());
        }
    }
}

impl FlushTarget for WriterInner {
    fn next_segment_name(&self) -> String {
        self.segments.lock().next_segment_name()
    }

    fn publish_flushed(&self, segment: FlushedSegment) -> Result<()> {
        let FlushedSegment {
            info,
            doc_seqs,
            epoch,
            ..
        } = segment;
        let info = Arc::new(info);
        let core = if epoch == self.docs_writer.epoch() {
            match SegmentCoreReaders::open(Arc::clone(&self.storage), Arc::clone(&info)) {
                Ok(core) => Some(Arc::new(core)),
                Err(e) => {
                    self.segments.lock().deleter.delete_new_files(&info.files);
                    return Err(e);
                }
            }
        } else {
            None
        };

        let mut seg = self.segments.lock();
        match core {
            Some(core) if epoch == self.docs_writer.epoch() => {
                seg.pool.push(ReadersAndUpdates::flushed(
                    core,
                    SegmentCommitInfo::new(Arc::clone(&info)),
                    doc_seqs,
                ));
                seg.checkpoint();
                debug!("published segment {} ({} docs)", info.name, info.max_doc);
                self.flushed_since_merge.store(true, Ordering::Release);
            }
            core => {
                release_core(core.as_ref());
                debug!("discarding segment {} flushed before a rollback", info.name);
                seg.deleter.delete_new_files(&info.files);
            }
        }
        Ok(())
    }
}

impl MergeSource for WriterInner {
    fn next_merge(&self) -> Option<Arc<OneMerge>> {
        let mut seg = self.segments.lock();
        let merge = seg.pending_merges.pop_front()?;
        seg.running_merges.push(Arc::clone(&merge));
        Some(merge)
    }

    fn on_merge_abandoned(&self, merge: &Arc<OneMerge>) {
        let mut seg = self.segments.lock();
        seg.unmark(merge);
        seg.forget_merge(merge);
        merge.set_state(MergeState::Aborted);
        drop(seg);
        debug!("{merge} abandoned by the scheduler");
        self.merges_changed.notify_all();
    }

    fn pending_merge_count(&self) -> usize {
        WriterInner::pending_merge_count(self)
    }

    fn running_merge_count(&self) -> usize {
        WriterInner::running_merge_count(self)
    }

    fn run_merge(&self, merge: &Arc<OneMerge>) -> Result<()> {
        match self.execute_merge(merge) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.finish_failed_merge(merge, &e);
                Err(match e {
                    TesseraError::MergeAborted(_) => e,
                    other => TesseraError::merge_failed(format!("{merge}: {other}")),
                })
            }
        }
    }
}

impl NrtSource for WriterInner {
    fn reopen(&self, old: &DirectoryReader) -> Result<Option<DirectoryReader>> {
        self.nrt_reader(Some(old))
    }

    fn is_current(&self, version: u64, seq: u64) -> bool {
        let same_version = self.segments.lock().version == version;
        same_version
            && self.docs_writer.last_seq() == seq
            && self.docs_writer.num_buffered_docs() == 0
    }

    fn release_files(&self, files: &BTreeSet<String>) {
        self.segments.lock().deleter.dec_ref(files);
    }
}
