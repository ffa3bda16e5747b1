//! The writer's live segment list with per-segment pending state.
//!
//! Every segment owned by the writer has a [`ReadersAndUpdates`]: its open
//! core readers, the live docs and numeric doc-values overlay as they stand
//! after every applied delete, and the sequence number those deletes were
//! applied up to. Live docs and the overlay are copy-on-write behind `Arc`s,
//! so readers handed out earlier keep their point-in-time view.

use std::fmt;
use std::sync::Arc;

use bit_vec::BitVec;
use log::{debug, warn};

use crate::codec::NumericUpdates;
use crate::error::Result;
use crate::index::delete_queue::{ApplyResult, QueuedOp, apply_to_segment};
use crate::index::documents_writer::DocumentsWriter;
use crate::index::merge_policy::SegmentSizeInfo;
use crate::index::segment_info::SegmentCommitInfo;
use crate::index::segment_reader::{SegmentCoreReaders, SegmentReader};
use crate::storage::Storage;

/// One segment of the writer and its not yet committed changes.
pub struct ReadersAndUpdates {
    core: Arc<SegmentCoreReaders>,
    info: SegmentCommitInfo,
    live: Arc<BitVec>,
    /// Deletes not yet written to a live docs generation.
    pending_deletes: u32,
    dv: Arc<NumericUpdates>,
    dv_dirty: bool,
    /// Every queued operation up to this sequence number was applied.
    applied_seq: u64,
    /// Sequence numbers of the docs of a freshly flushed segment.
    doc_seqs: Option<Arc<[u64]>>,
    merging: bool,
}

impl ReadersAndUpdates {
    /// Wrap a segment whose live docs and overlay are already loaded.
    ///
    /// Takes over one reference of `core`.
    pub fn new(
        core: Arc<SegmentCoreReaders>,
        info: SegmentCommitInfo,
        live: BitVec,
        dv: NumericUpdates,
        applied_seq: u64,
    ) -> Self {
        ReadersAndUpdates {
            core,
            info,
            live: Arc::new(live),
            pending_deletes: 0,
            dv: Arc::new(dv),
            dv_dirty: false,
            applied_seq,
            doc_seqs: None,
            merging: false,
        }
    }

    /// Open a committed segment.
    pub fn open(storage: &Arc<dyn Storage>, info: SegmentCommitInfo, applied_seq: u64) -> Result<Self> {
        let core = Arc::new(SegmentCoreReaders::open(
            Arc::clone(storage),
            Arc::clone(&info.info),
        )?);
        ReadersAndUpdates::with_core(storage, core, info, applied_seq)
    }

    /// Open a committed generation of a segment on an existing core.
    ///
    /// Takes over one reference of `core`.
    pub fn with_core(
        storage: &Arc<dyn Storage>,
        core: Arc<SegmentCoreReaders>,
        info: SegmentCommitInfo,
        applied_seq: u64,
    ) -> Result<Self> {
        let codec = Arc::clone(core.codec());
        let loaded = codec
            .live_docs_format()
            .read(&**storage, &info)
            .and_then(|live| Ok((live, codec.doc_values_updates_format().read(&**storage, &info)?)));
        match loaded {
            Ok((live, dv)) => Ok(ReadersAndUpdates::new(core, info, live, dv, applied_seq)),
            Err(e) => {
                if let Err(release) = core.dec_ref() {
                    warn!("releasing core readers of {} failed: {release}", info.info.name);
                }
                Err(e)
            }
        }
    }

    /// A freshly flushed segment: every document is live and operations
    /// are filtered by the per-document sequence numbers.
    pub fn flushed(core: Arc<SegmentCoreReaders>, info: SegmentCommitInfo, doc_seqs: Vec<u64>) -> Self {
        let first = doc_seqs.first().copied().unwrap_or(1);
        let mut rau = ReadersAndUpdates::new(
            core,
            info,
            BitVec::from_elem(doc_seqs.len(), true),
            NumericUpdates::new(),
            first.saturating_sub(1),
        );
        rau.doc_seqs = Some(doc_seqs.into());
        rau
    }

    /// A segment written by a merge, its carried-over changes still to be
    /// applied. `doc_seqs` is set when a source still filtered by them.
    pub fn merged(
        core: Arc<SegmentCoreReaders>,
        info: SegmentCommitInfo,
        applied_seq: u64,
        doc_seqs: Option<Vec<u64>>,
    ) -> Self {
        let max_doc = info.max_doc() as usize;
        let mut rau = ReadersAndUpdates::new(
            core,
            info,
            BitVec::from_elem(max_doc, true),
            NumericUpdates::new(),
            applied_seq,
        );
        rau.doc_seqs = doc_seqs.map(Into::into);
        rau
    }

    pub fn name(&self) -> &str {
        self.info.name()
    }

    /// Per-document sequence numbers of a segment still filtered by them.
    pub fn doc_seqs(&self) -> Option<&[u64]> {
        self.doc_seqs.as_deref()
    }

    pub fn core(&self) -> &Arc<SegmentCoreReaders> {
        &self.core
    }

    /// Commit info as of the last written generations.
    pub fn info(&self) -> &SegmentCommitInfo {
        &self.info
    }

    pub fn max_doc(&self) -> u32 {
        self.info.max_doc()
    }

    /// Deleted documents, pending ones included.
    pub fn del_count(&self) -> u32 {
        self.info.del_count + self.pending_deletes
    }

    pub fn num_docs(&self) -> u32 {
        self.max_doc().saturating_sub(self.del_count())
    }

    pub fn is_fully_deleted(&self) -> bool {
        self.num_docs() == 0
    }

    pub fn live(&self) -> &Arc<BitVec> {
        &self.live
    }

    pub fn dv_updates(&self) -> &Arc<NumericUpdates> {
        &self.dv
    }

    pub fn applied_seq(&self) -> u64 {
        self.applied_seq
    }

    pub fn is_merging(&self) -> bool {
        self.merging
    }

    pub fn set_merging(&mut self, merging: bool) {
        self.merging = merging;
    }

    /// True when deletes or updates wait to be written.
    pub fn is_dirty(&self) -> bool {
        self.pending_deletes > 0 || self.dv_dirty
    }

    /// Apply queued operations, all of them up to `upto`.
    pub fn apply(&mut self, ops: &[QueuedOp], upto: u64) -> Result<ApplyResult> {
        if upto <= self.applied_seq {
            return Ok(ApplyResult::default());
        }
        let mut result = ApplyResult::default();
        if !ops.is_empty() {
            let mut live = (*self.live).clone();
            let mut dv = (*self.dv).clone();
            result = apply_to_segment(
                &self.core,
                &self.info,
                self.doc_seqs.as_deref(),
                ops,
                &mut live,
                &mut dv,
            )?;
            if result.new_deletes > 0 {
                self.live = Arc::new(live);
                self.pending_deletes += result.new_deletes;
            }
            if result.dv_updates > 0 {
                self.dv = Arc::new(dv);
                self.dv_dirty = true;
            }
        }
        self.applied_seq = upto;
        if self
            .doc_seqs
            .as_ref()
            .is_some_and(|seqs| seqs.iter().all(|s| *s <= upto))
        {
            self.doc_seqs = None;
        }
        Ok(result)
    }

    /// Mark docs deleted directly; used when carrying deletes into a merge.
    pub fn delete_docs(&mut self, docs: &[u32]) -> u32 {
        let mut live = (*self.live).clone();
        let mut deleted = 0;
        for &doc in docs {
            if live.get(doc as usize) == Some(true) {
                live.set(doc as usize, false);
                deleted += 1;
            }
        }
        if deleted > 0 {
            self.live = Arc::new(live);
            self.pending_deletes += deleted;
        }
        deleted
    }

    /// Set doc values directly; used when carrying updates into a merge.
    pub fn update_doc_values(&mut self, updates: &NumericUpdates) {
        if updates.values().all(|column| column.is_empty()) {
            return;
        }
        let mut dv = (*self.dv).clone();
        for (field, column) in updates {
            dv.entry(field.clone())
                .or_default()
                .extend(column.iter().map(|(doc, value)| (*doc, *value)));
        }
        self.dv = Arc::new(dv);
        self.dv_dirty = true;
    }

    /// Write pending deletes and updates as new generations.
    ///
    /// The generation counters advance even when writing fails so a retry
    /// never reuses a file name.
    pub fn write_pending(&mut self, storage: &dyn Storage) -> Result<()> {
        let codec = Arc::clone(self.core.codec());
        if self.pending_deletes > 0 {
            let generation = self.info.next_write_del_gen;
            self.info.next_write_del_gen += 1;
            let del_count = self.del_count();
            let name = codec
                .live_docs_format()
                .write(storage, &self.info, &self.live, del_count, generation)?;
            self.info.advance_del_gen(generation, del_count);
            self.pending_deletes = 0;
            debug!("wrote {name} ({del_count} deleted)");
        }
        if self.dv_dirty {
            let generation = self.info.next_write_dv_gen;
            self.info.next_write_dv_gen += 1;
            let name = codec
                .doc_values_updates_format()
                .write(storage, &self.info, &self.dv, generation)?;
            self.info.advance_dv_gen(generation);
            self.dv_dirty = false;
            debug!("wrote {name}");
        }
        Ok(())
    }

    /// A reader over the current in-memory state.
    pub fn reader(&self) -> Result<SegmentReader> {
        let mut info = self.info.clone();
        info.del_count = self.del_count();
        SegmentReader::new(
            Arc::clone(&self.core),
            info,
            Arc::clone(&self.live),
            Arc::clone(&self.dv),
        )
    }

    pub fn size_info(&self, storage: &dyn Storage) -> SegmentSizeInfo {
        SegmentSizeInfo {
            name: self.name().to_string(),
            max_doc: self.max_doc(),
            del_count: self.del_count(),
            size_bytes: self.info.size_in_bytes(storage).unwrap_or(0),
            merging: self.merging,
        }
    }
}

impl Drop for ReadersAndUpdates {
    fn drop(&mut self) {
        if let Err(e) = self.core.dec_ref() {
            warn!("releasing core readers of {} failed: {e}", self.info.info.name);
        }
    }
}

impl fmt::Debug for ReadersAndUpdates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadersAndUpdates")
            .field("segment", &self.name())
            .field("max_doc", &self.max_doc())
            .field("del_count", &self.del_count())
            .field("applied_seq", &self.applied_seq)
            .field("merging", &self.merging)
            .finish()
    }
}

/// Ordered list of the writer's segments.
#[derive(Debug, Default)]
pub struct ReaderPool {
    segments: Vec<ReadersAndUpdates>,
}

impl ReaderPool {
    pub fn new() -> Self {
        ReaderPool::default()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReadersAndUpdates> {
        self.segments.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ReadersAndUpdates> {
        self.segments.iter_mut()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.segments.iter().position(|s| s.name() == name)
    }

    pub fn get(&self, name: &str) -> Option<&ReadersAndUpdates> {
        self.segments.iter().find(|s| s.name() == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ReadersAndUpdates> {
        self.segments.iter_mut().find(|s| s.name() == name)
    }

    pub fn push(&mut self, segment: ReadersAndUpdates) {
        self.segments.push(segment);
    }

    pub fn insert(&mut self, index: usize, segment: ReadersAndUpdates) {
        self.segments.insert(index.min(self.segments.len()), segment);
    }

    pub fn remove(&mut self, name: &str) -> Option<ReadersAndUpdates> {
        self.position(name).map(|i| self.segments.remove(i))
    }

    /// Remove every segment, returning them.
    pub fn take_all(&mut self) -> Vec<ReadersAndUpdates> {
        std::mem::take(&mut self.segments)
    }

    /// Commit infos of every segment, as last written.
    pub fn commit_infos(&self) -> Vec<SegmentCommitInfo> {
        self.segments.iter().map(|s| s.info().clone()).collect()
    }

    /// Lowest applied sequence number; `u64::MAX` without segments.
    pub fn min_applied_seq(&self) -> u64 {
        self.segments
            .iter()
            .map(ReadersAndUpdates::applied_seq)
            .min()
            .unwrap_or(u64::MAX)
    }

    /// Apply every queued operation up to `upto` to every segment.
    pub fn apply_deletes(&mut self, writer: &DocumentsWriter, upto: u64) -> Result<ApplyResult> {
        let mut total = ApplyResult::default();
        for segment in &mut self.segments {
            if segment.applied_seq() >= upto {
                continue;
            }
            let ops = writer.ops_in(segment.applied_seq(), upto);
            let result = segment.apply(&ops, upto)?;
            total.new_deletes += result.new_deletes;
            total.dv_updates += result.dv_updates;
        }
        if total.new_deletes > 0 || total.dv_updates > 0 {
            debug!(
                "applied deletes up to seq {upto}: {} docs deleted, {} values updated",
                total.new_deletes, total.dv_updates
            );
        }
        Ok(total)
    }

    /// Remove segments without live documents that no merge is reading.
    pub fn drop_fully_deleted(&mut self) -> Vec<ReadersAndUpdates> {
        let (dropped, kept): (Vec<_>, Vec<_>) = self
            .take_all()
            .into_iter()
            .partition(|s| s.is_fully_deleted() && !s.is_merging());
        self.segments = kept;
        for segment in &dropped {
            debug!("dropping fully deleted segment {}", segment.name());
        }
        dropped
    }

    /// Write the pending deletes and updates of every segment.
    pub fn write_pending(&mut self, storage: &dyn Storage) -> Result<()> {
        for segment in &mut self.segments {
            if segment.is_dirty() {
                segment.write_pending(storage)?;
            }
        }
        Ok(())
    }

    pub fn size_infos(&self, storage: &dyn Storage) -> Vec<SegmentSizeInfo> {
        self.segments.iter().map(|s| s.size_info(storage)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::StandardAnalyzer;
    use crate::document::Document;
    use crate::index::delete_queue::{DeleteQueue, UpdateOp};
    use crate::index::documents_writer_per_thread::{
        DocumentsWriterPerThread, InvertContext, invert_document,
    };
    use crate::index::field_infos::FieldNumbers;
    use crate::index::term::Term;
    use crate::storage::memory::MemoryStorage;

    fn flushed_segment(storage: &Arc<dyn Storage>, texts: &[&str], first_seq: u64) -> ReadersAndUpdates {
        let ctx = InvertContext {
            analyzer: Arc::new(StandardAnalyzer),
            field_numbers: Arc::new(FieldNumbers::new()),
            max_term_length: 255,
        };
        let mut buffer = DocumentsWriterPerThread::new(0, 0, 0);
        for (i, text) in texts.iter().enumerate() {
            let doc = Document::builder()
                .add_text("text", *text)
                .add_numeric("n", 0)
                .build();
            buffer.add(vec![invert_document(&doc, &ctx).unwrap()], first_seq + i as u64);
        }
        let flushed = buffer
            .flush(storage, &crate::codec::default_codec(), "_0")
            .unwrap();
        let info = Arc::new(flushed.info);
        let core = Arc::new(SegmentCoreReaders::open(Arc::clone(storage), Arc::clone(&info)).unwrap());
        ReadersAndUpdates::flushed(core, SegmentCommitInfo::new(info), flushed.doc_seqs)
    }

    #[test]
    fn test_apply_respects_doc_seqs() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::default());
        let mut rau = flushed_segment(&storage, &["a b c", "a c e", "a"], 1);
        assert_eq!(rau.applied_seq(), 0);

        let mut queue = DeleteQueue::new();
        // Seq 3 is the third doc: the delete only sees docs 0 and 1.
        queue.push(3, UpdateOp::DeleteTerm(Term::new("text", "a")));
        let result = rau.apply(&queue.ops_in(0, 3), 3).unwrap();
        assert_eq!(result.new_deletes, 2);
        assert_eq!(rau.num_docs(), 1);
        assert!(rau.is_dirty());
        assert!(rau.live()[2]);

        let before = Arc::clone(rau.live());
        queue.push(4, UpdateOp::NumericUpdate {
            term: Term::new("text", "a"),
            field: "n".to_string(),
            value: 9,
        });
        rau.apply(&queue.ops_in(3, 4), 4).unwrap();
        assert!(Arc::ptr_eq(&before, rau.live()));
        assert_eq!(rau.dv_updates()["n"][&2], 9);

        let reader = rau.reader().unwrap();
        assert_eq!(reader.num_docs(), 1);
        assert_eq!(reader.numeric_doc_value("n", 2).unwrap(), Some(9));
    }

    #[test]
    fn test_write_pending_advances_generations() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::default());
        let mut rau = flushed_segment(&storage, &["x", "y"], 1);
        rau.apply(&[], 2).unwrap();
        assert_eq!(rau.delete_docs(&[0, 0]), 1);
        rau.write_pending(&*storage).unwrap();
        assert!(!rau.is_dirty());
        assert_eq!(rau.info().del_gen, 1);
        assert_eq!(rau.info().del_count, 1);
        let liv = rau.info().live_docs_file().unwrap();
        assert!(storage.file_exists(&liv));

        let reopened = ReadersAndUpdates::open(&storage, rau.info().clone(), 2).unwrap();
        assert_eq!(reopened.num_docs(), 1);
        assert!(!reopened.live()[0]);
    }

    #[test]
    fn test_failed_open_releases_core() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::default());
        let rau = flushed_segment(&storage, &["x", "y"], 1);
        let core = Arc::clone(rau.core());
        core.inc_ref().unwrap();
        let mut info = rau.info().clone();
        // Points at a live docs generation that was never written.
        info.advance_del_gen(7, 1);
        assert!(ReadersAndUpdates::with_core(&storage, Arc::clone(&core), info, 1).is_err());
        assert_eq!(core.ref_count(), 1);
        drop(rau);
        assert_eq!(core.ref_count(), 0);
    }

    #[test]
    fn test_drop_after_core_closed_does_not_panic() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::default());
        let rau = flushed_segment(&storage, &["x"], 1);
        let core = Arc::clone(rau.core());
        core.dec_ref().unwrap();
        assert_eq!(core.ref_count(), 0);
        // The second release fails and is only logged.
        drop(rau);
        assert!(core.dec_ref().is_err());
    }

    #[test]
    fn test_pool_drops_fully_deleted() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::default());
        let mut pool = ReaderPool::new();
        let mut rau = flushed_segment(&storage, &["x"], 1);
        rau.delete_docs(&[0]);
        pool.push(rau);
        assert_eq!(pool.min_applied_seq(), 0);
        pool.get_mut("_0").unwrap().set_merging(true);
        assert!(pool.drop_fully_deleted().is_empty());
        pool.get_mut("_0").unwrap().set_merging(false);
        assert_eq!(pool.drop_fully_deleted().len(), 1);
        assert!(pool.is_empty());
        assert_eq!(pool.min_applied_seq(), u64::MAX);
    }
}
