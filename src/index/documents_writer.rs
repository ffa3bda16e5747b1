//! Buffers documents across a pool of per-thread buffers.
//!
//! A thread checks a buffer out of the pool for the duration of one
//! operation and returns it afterwards, so a buffer is only ever touched by
//! one thread and only one flush can claim it. Sequence numbers come from a
//! single counter guarded by the pool lock, together with the queue of
//! buffered deletes; a delete and its sequence number become visible
//! atomically.
//!
//! A full flush (commit, NRT reader, explicit flush) bumps the flush
//! generation. Idle buffers of the old generation are flushed right away,
//! buffers checked out at that moment are flushed by their thread when it
//! returns them, and the full flush waits for both. Those in-flight
//! operations receive sequence numbers from a gap reserved when the full
//! flush started, so the cutoff cleanly separates old from new operations.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use ahash::AHashMap;
use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::codec::Codec;
use crate::document::Document;
use crate::error::{Result, TesseraError};
use crate::index::delete_queue::{DeleteQueue, QueuedOp, UpdateOp};
use crate::index::documents_writer_per_thread::{
    DocumentsWriterPerThread, FlushedSegment, InvertContext, InvertError, invert_document,
};
use crate::index::flush_control::FlushControl;
use crate::storage::Storage;

/// Where flushed segments go.
pub trait FlushTarget {
    /// Allocate the name of a new segment.
    fn next_segment_name(&self) -> String;

    /// Make a flushed segment part of the index.
    fn publish_flushed(&self, segment: FlushedSegment) -> Result<()>;
}

/// When buffers are flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushSettings {
    pub ram_budget_bytes: Option<usize>,
    pub max_buffered_docs: Option<u32>,
}

#[derive(Debug)]
struct FullFlushState {
    gap_next: u64,
    outstanding_old: usize,
    flushing: usize,
    error: Option<String>,
}

#[derive(Debug)]
struct PoolState {
    next_seq: u64,
    next_buffer_id: u64,
    flush_gen: u64,
    epoch: u64,
    idle: Vec<DocumentsWriterPerThread>,
    /// Checked-out buffer id to its flush generation.
    checked_out: AHashMap<u64, u64>,
    last_used: AHashMap<ThreadId, u64>,
    flush_control: FlushControl,
    queue: DeleteQueue,
    /// First sequence number of every unpublished non-empty buffer.
    barriers: BTreeMap<u64, usize>,
    full_flush: Option<FullFlushState>,
}

impl PoolState {
    fn assign_seq(&mut self, buffer: &DocumentsWriterPerThread) -> u64 {
        if buffer.flush_gen < self.flush_gen {
            if let Some(ff) = self.full_flush.as_mut() {
                let seq = ff.gap_next;
                ff.gap_next += 1;
                return seq;
            }
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Highest sequence number below which every number was handed out.
    fn applicable_seq(&self) -> u64 {
        match &self.full_flush {
            Some(ff) if ff.outstanding_old > 0 => ff.gap_next - 1,
            _ => self.next_seq - 1,
        }
    }

    fn release_barrier(&mut self, first_seq: u64) {
        if let Some(count) = self.barriers.get_mut(&first_seq) {
            *count -= 1;
            if *count == 0 {
                self.barriers.remove(&first_seq);
            }
        }
    }
}

/// The cutoff of a running full flush.
///
/// New buffers do not flush while this guard lives, so every segment
/// published until then holds only operations up to [`FullFlush::cutoff`].
pub struct FullFlush<'a> {
    writer: &'a DocumentsWriter,
    _lock: MutexGuard<'a, ()>,
    cutoff: u64,
}

impl FullFlush<'_> {
    /// Sequence number of the last operation included.
    pub fn cutoff(&self) -> u64 {
        self.cutoff
    }
}

impl Drop for FullFlush<'_> {
    fn drop(&mut self) {
        self.writer.state.lock().full_flush = None;
        self.writer.cond.notify_all();
    }
}

/// Pool of per-thread buffers with flush control.
pub struct DocumentsWriter {
    storage: Arc<dyn Storage>,
    codec: Arc<dyn Codec>,
    context: InvertContext,
    state: Mutex<PoolState>,
    cond: Condvar,
    full_flush_lock: Mutex<()>,
}

impl std::fmt::Debug for DocumentsWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("DocumentsWriter")
            .field("next_seq", &state.next_seq)
            .field("idle", &state.idle.len())
            .field("checked_out", &state.checked_out.len())
            .field("queued_ops", &state.queue.len())
            .finish()
    }
}

impl DocumentsWriter {
    pub fn new(
        storage: Arc<dyn Storage>,
        codec: Arc<dyn Codec>,
        context: InvertContext,
        settings: FlushSettings,
    ) -> Self {
        DocumentsWriter {
            storage,
            codec,
            context,
            state: Mutex::new(PoolState {
                next_seq: 1,
                next_buffer_id: 0,
                flush_gen: 0,
                epoch: 0,
                idle: Vec::new(),
                checked_out: AHashMap::new(),
                last_used: AHashMap::new(),
                flush_control: FlushControl::new(
                    settings.ram_budget_bytes,
                    settings.max_buffered_docs,
                ),
                queue: DeleteQueue::new(),
                barriers: BTreeMap::new(),
                full_flush: None,
            }),
            cond: Condvar::new(),
            full_flush_lock: Mutex::new(()),
        }
    }

    pub fn context(&self) -> &InvertContext {
        &self.context
    }

    /// Add `docs` as one block, optionally deleting what `delete` matches
    /// first. Returns the sequence number of the operation.
    pub fn update_documents(
        &self,
        docs: &[Document],
        delete: Option<UpdateOp>,
        target: &dyn FlushTarget,
    ) -> Result<u64> {
        let mut buffer = self.checkout();
        let mut inverted = Vec::with_capacity(docs.len());
        for doc in docs {
            match invert_document(doc, &self.context) {
                Ok(doc) => inverted.push(doc),
                Err(InvertError::Rejected(e)) => {
                    self.checkin(buffer, target)?;
                    return Err(e);
                }
                Err(InvertError::Aborting(e)) => {
                    warn!(
                        "analysis failed, discarding {} buffered docs: {e}",
                        buffer.num_docs()
                    );
                    self.discard_buffer(buffer);
                    return Err(e);
                }
            }
        }

        let seq = {
            let mut state = self.state.lock();
            if buffer.epoch != state.epoch {
                drop(state);
                self.checkin(buffer, target)?;
                return Err(TesseraError::illegal_state(
                    "indexing buffer was discarded by a rollback",
                ));
            }
            let seq = state.assign_seq(&buffer);
            if buffer.is_empty() && !inverted.is_empty() {
                *state.barriers.entry(seq).or_insert(0) += 1;
            }
            if let Some(op) = delete {
                state.queue.push(seq, op);
            }
            seq
        };
        buffer.add(inverted, seq);
        self.checkin(buffer, target)?;
        Ok(seq)
    }

    /// Queue a delete or update that touches no buffer.
    pub fn push_op(&self, op: UpdateOp) -> u64 {
        let mut state = self.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        debug!("queued {op:?} as seq {seq}");
        state.queue.push(seq, op);
        seq
    }

    /// Queue several operations under one sequence number.
    pub fn push_ops(&self, ops: Vec<UpdateOp>) -> u64 {
        let mut state = self.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        debug!("queued {} ops as seq {seq}", ops.len());
        for op in ops {
            state.queue.push(seq, op);
        }
        seq
    }

    /// Highest sequence number that deletes may be applied up to.
    pub fn applicable_seq(&self) -> u64 {
        self.state.lock().applicable_seq()
    }

    /// Sequence number of the most recently started operation.
    pub fn last_seq(&self) -> u64 {
        self.state.lock().next_seq - 1
    }

    /// Queued operations with `after < seq <= upto`.
    pub fn ops_in(&self, after: u64, upto: u64) -> Vec<QueuedOp> {
        self.state.lock().queue.ops_in(after, upto)
    }

    /// Forget queued operations no segment or buffer still needs.
    ///
    /// `segments_applied` is the lowest sequence number applied by every
    /// published segment.
    pub fn prune_queue(&self, segments_applied: u64) {
        let mut state = self.state.lock();
        let mut upto = segments_applied.min(state.applicable_seq());
        if let Some(first) = state.barriers.keys().next() {
            upto = upto.min(*first);
        }
        state.queue.prune(upto);
    }

    pub fn queued_ops(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Documents buffered in idle buffers.
    pub fn num_buffered_docs(&self) -> u32 {
        self.state.lock().idle.iter().map(|b| b.num_docs()).sum()
    }

    /// RAM held by active and flushing buffers.
    pub fn ram_bytes_used(&self) -> usize {
        let state = self.state.lock();
        state.flush_control.active_bytes() + state.flush_control.flushing_bytes()
    }

    pub fn stall_count(&self) -> u64 {
        self.state.lock().flush_control.stall_count()
    }

    /// Rollback epoch; bumped by [`DocumentsWriter::abort`].
    pub fn epoch(&self) -> u64 {
        self.state.lock().epoch
    }

    /// Flush every buffer holding operations up to now.
    ///
    /// Returns once all of them are published. The returned guard keeps
    /// later buffers from flushing until it is dropped.
    pub fn flush_all_threads(&self, target: &dyn FlushTarget) -> Result<FullFlush<'_>> {
        let lock = self.full_flush_lock.lock();
        let (to_flush, cutoff) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            state.flush_gen += 1;
            let current_gen = state.flush_gen;
            let outstanding_old = state
                .checked_out
                .values()
                .filter(|g| **g < current_gen)
                .count();
            let gap_next = state.next_seq;
            state.next_seq += outstanding_old as u64;
            let cutoff = state.next_seq - 1;

            let mut to_flush = Vec::new();
            for mut buffer in std::mem::take(&mut state.idle) {
                if buffer.is_empty() {
                    buffer.flush_gen = current_gen;
                    state.idle.push(buffer);
                } else {
                    state
                        .flush_control
                        .start_flush(buffer.id(), buffer.bytes_used());
                    to_flush.push(buffer);
                }
            }
            state.full_flush = Some(FullFlushState {
                gap_next,
                outstanding_old,
                flushing: to_flush.len(),
                error: None,
            });
            debug!(
                "full flush up to seq {cutoff}: {} idle buffers, {outstanding_old} in flight",
                to_flush.len()
            );
            (to_flush, cutoff)
        };
        let full_flush = FullFlush {
            writer: self,
            _lock: lock,
            cutoff,
        };

        let mut first_error = None;
        for buffer in to_flush {
            if let Err(e) = self.flush_buffer(buffer, true, target) {
                first_error.get_or_insert(e);
            }
        }

        let mut state = self.state.lock();
        while state
            .full_flush
            .as_ref()
            .is_some_and(|ff| ff.outstanding_old > 0 || ff.flushing > 0)
        {
            self.cond.wait(&mut state);
        }
        let deferred = state.full_flush.as_mut().and_then(|ff| ff.error.take());
        drop(state);

        if let Some(e) = first_error {
            return Err(e);
        }
        if let Some(message) = deferred {
            return Err(TesseraError::illegal_state(format!(
                "flush of an in-flight buffer failed: {message}"
            )));
        }
        Ok(full_flush)
    }

    /// Discard every buffered document and queued operation.
    ///
    /// Buffers checked out or flushing right now are discarded when they
    /// come back.
    pub fn abort(&self) {
        let _lock = self.full_flush_lock.lock();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.epoch += 1;
        let mut discarded = 0;
        for buffer in state.idle.drain(..) {
            discarded += buffer.num_docs();
            state.flush_control.remove_active(buffer.id());
        }
        state.queue.clear();
        state.barriers.clear();
        state.last_used.clear();
        info!(
            "discarded {discarded} buffered docs; epoch is now {}",
            state.epoch
        );
        drop(guard);
        self.cond.notify_all();
    }

    fn checkout(&self) -> DocumentsWriterPerThread {
        let mut state = self.state.lock();
        if state.flush_control.stalled() {
            state.flush_control.record_stall();
            debug!(
                "indexing stalled: {} bytes active, {} bytes flushing",
                state.flush_control.active_bytes(),
                state.flush_control.flushing_bytes()
            );
            while state.flush_control.stalled() {
                self.cond.wait(&mut state);
            }
        }
        let thread = thread::current().id();
        let preferred = state
            .last_used
            .get(&thread)
            .and_then(|id| state.idle.iter().position(|b| b.id() == *id));
        let position = preferred.or_else(|| state.idle.len().checked_sub(1));
        let buffer = match position {
            Some(position) => state.idle.swap_remove(position),
            None => {
                let id = state.next_buffer_id;
                state.next_buffer_id += 1;
                DocumentsWriterPerThread::new(id, state.flush_gen, state.epoch)
            }
        };
        state.checked_out.insert(buffer.id(), buffer.flush_gen);
        state.last_used.insert(thread, buffer.id());
        buffer
    }

    fn checkin(&self, mut buffer: DocumentsWriterPerThread, target: &dyn FlushTarget) -> Result<()> {
        let to_flush = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let id = buffer.id();
            state.checked_out.remove(&id);

            if buffer.epoch != state.epoch {
                state.flush_control.remove_active(id);
                if buffer.flush_gen < state.flush_gen {
                    if let Some(ff) = state.full_flush.as_mut() {
                        ff.outstanding_old -= 1;
                    }
                }
                drop(guard);
                self.cond.notify_all();
                return Ok(());
            }

            let mut part_of_full_flush = false;
            if buffer.flush_gen < state.flush_gen {
                match state.full_flush.as_mut() {
                    Some(ff) => {
                        ff.outstanding_old -= 1;
                        if !buffer.is_empty() {
                            ff.flushing += 1;
                            part_of_full_flush = true;
                        }
                    }
                    None => buffer.flush_gen = state.flush_gen,
                }
            }

            if part_of_full_flush {
                state.flush_control.start_flush(id, buffer.bytes_used());
                Some((buffer, true))
            } else {
                buffer.flush_gen = state.flush_gen;
                state.flush_control.set_active(id, buffer.bytes_used());
                let control = &state.flush_control;
                let wants_flush = state.full_flush.is_none()
                    && (control.doc_limit_reached(buffer.num_docs()) || control.ram_limit_reached());
                let pick = if !wants_flush {
                    None
                } else if control.doc_limit_reached(buffer.num_docs()) {
                    Some(id)
                } else {
                    control.largest_active()
                };
                match pick {
                    Some(pick) if pick == id => {
                        state.flush_control.start_flush(id, buffer.bytes_used());
                        Some((buffer, false))
                    }
                    Some(pick) => {
                        let other = state
                            .idle
                            .iter()
                            .position(|b| b.id() == pick)
                            .map(|position| state.idle.swap_remove(position));
                        state.idle.push(buffer);
                        other.map(|other| {
                            state.flush_control.start_flush(other.id(), other.bytes_used());
                            (other, false)
                        })
                    }
                    None => {
                        state.idle.push(buffer);
                        None
                    }
                }
            }
        };
        self.cond.notify_all();
        match to_flush {
            Some((buffer, part_of_full_flush)) => {
                self.flush_buffer(buffer, part_of_full_flush, target)
            }
            None => Ok(()),
        }
    }

    /// Drop an aborting buffer and everything it held.
    fn discard_buffer(&self, mut buffer: DocumentsWriterPerThread) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let id = buffer.id();
        state.checked_out.remove(&id);
        state.flush_control.remove_active(id);
        if buffer.epoch == state.epoch {
            if let Some(first) = buffer.first_seq() {
                state.release_barrier(first);
            }
        }
        if buffer.flush_gen < state.flush_gen {
            if let Some(ff) = state.full_flush.as_mut() {
                ff.outstanding_old -= 1;
            }
        }
        buffer.abort();
        drop(guard);
        self.cond.notify_all();
    }

    fn flush_buffer(
        &self,
        buffer: DocumentsWriterPerThread,
        part_of_full_flush: bool,
        target: &dyn FlushTarget,
    ) -> Result<()> {
        let bytes = buffer.bytes_used();
        let first_seq = buffer.first_seq();
        let epoch = buffer.epoch;
        let name = target.next_segment_name();
        debug!(
            "flushing buffer {} ({} docs, {bytes} bytes) as {name}",
            buffer.id(),
            buffer.num_docs()
        );
        let result = buffer
            .flush(&self.storage, &self.codec, &name)
            .and_then(|segment| target.publish_flushed(segment));

        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.flush_control.finish_flush(bytes);
        if epoch == state.epoch {
            if let Some(first) = first_seq {
                state.release_barrier(first);
            }
        }
        if part_of_full_flush {
            if let Some(ff) = state.full_flush.as_mut() {
                ff.flushing -= 1;
                if let Err(e) = &result {
                    ff.error.get_or_insert_with(|| e.to_string());
                }
            }
        }
        drop(guard);
        self.cond.notify_all();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    use crate::analysis::StandardAnalyzer;
    use crate::index::field_infos::FieldNumbers;
    use crate::index::term::Term;
    use crate::storage::memory::MemoryStorage;

    #[derive(Default)]
    struct Collect {
        counter: AtomicU64,
        segments: Mutex<Vec<FlushedSegment>>,
    }

    impl FlushTarget for Collect {
        fn next_segment_name(&self) -> String {
            format!("_{}", self.counter.fetch_add(1, Ordering::SeqCst))
        }

        fn publish_flushed(&self, segment: FlushedSegment) -> Result<()> {
            self.segments.lock().push(segment);
            Ok(())
        }
    }

    impl Collect {
        fn total_docs(&self) -> u32 {
            self.segments.lock().iter().map(|s| s.info.max_doc).sum()
        }
    }

    fn writer(max_buffered_docs: Option<u32>) -> DocumentsWriter {
        DocumentsWriter::new(
            Arc::new(MemoryStorage::default()),
            crate::codec::default_codec(),
            InvertContext {
                analyzer: Arc::new(StandardAnalyzer),
                field_numbers: Arc::new(FieldNumbers::new()),
                max_term_length: 255,
            },
            FlushSettings {
                ram_budget_bytes: Some(16 * 1024 * 1024),
                max_buffered_docs,
            },
        )
    }

    fn doc(text: &str) -> Document {
        Document::builder().add_text("body", text).build()
    }

    #[test]
    fn test_sequence_numbers_and_doc_limit_flush() {
        let dw = writer(Some(2));
        let target = Collect::default();
        let s1 = dw.update_documents(&[doc("a")], None, &target).unwrap();
        let s2 = dw.update_documents(&[doc("b")], None, &target).unwrap();
        assert_eq!((s1, s2), (1, 2));
        assert_eq!(target.segments.lock().len(), 1);
        assert_eq!(target.segments.lock()[0].doc_seqs, vec![1, 2]);
        assert_eq!(dw.num_buffered_docs(), 0);

        let s3 = dw.update_documents(&[doc("c"), doc("d")], None, &target).unwrap();
        assert_eq!(s3, 3);
        assert_eq!(target.total_docs(), 4);
    }

    #[test]
    fn test_full_flush_cutoff() {
        let dw = writer(None);
        let target = Collect::default();
        dw.update_documents(&[doc("a")], None, &target).unwrap();
        let seq = dw.push_op(UpdateOp::DeleteTerm(Term::new("body", "a")));
        {
            let full_flush = dw.flush_all_threads(&target).unwrap();
            assert_eq!(full_flush.cutoff(), seq);
            assert_eq!(target.total_docs(), 1);
        }
        assert_eq!(dw.ops_in(0, seq).len(), 1);
        assert_eq!(dw.applicable_seq(), seq);

        // Nothing buffered: the next full flush writes no segment.
        dw.flush_all_threads(&target).unwrap();
        assert_eq!(target.segments.lock().len(), 1);
    }

    #[test]
    fn test_rejected_document_leaves_buffer_untouched() {
        let dw = writer(None);
        let target = Collect::default();
        dw.update_documents(&[doc("a")], None, &target).unwrap();
        let too_long = "x".repeat(300);
        let err = dw
            .update_documents(&[doc("b"), Document::builder().add_keyword("id", too_long).build()], None, &target)
            .unwrap_err();
        assert!(matches!(err, TesseraError::IllegalArgument(_)));
        assert_eq!(dw.num_buffered_docs(), 1);
        assert_eq!(dw.last_seq(), 1);
    }

    #[test]
    fn test_prune_respects_barriers() {
        let dw = writer(None);
        let target = Collect::default();
        let first = dw.push_op(UpdateOp::DeleteAll);
        dw.update_documents(&[doc("a")], None, &target).unwrap();
        let later = dw.push_op(UpdateOp::DeleteTerm(Term::new("body", "a")));
        dw.prune_queue(u64::MAX);
        // The buffered doc still needs the delete queued after it.
        assert_eq!(dw.ops_in(0, u64::MAX).len(), 1);
        assert_eq!(dw.ops_in(first, later)[0].seq, later);

        dw.flush_all_threads(&target).unwrap();
        dw.prune_queue(later);
        assert_eq!(dw.queued_ops(), 0);
    }

    #[test]
    fn test_abort_discards_everything() {
        let dw = writer(None);
        let target = Collect::default();
        dw.update_documents(&[doc("a")], None, &target).unwrap();
        dw.push_op(UpdateOp::DeleteAll);
        let epoch = dw.epoch();
        dw.abort();
        assert_eq!(dw.epoch(), epoch + 1);
        assert_eq!(dw.num_buffered_docs(), 0);
        assert_eq!(dw.queued_ops(), 0);
        dw.flush_all_threads(&target).unwrap();
        assert!(target.segments.lock().is_empty());
    }

    #[test]
    fn test_concurrent_adds_with_full_flush() {
        let dw = Arc::new(writer(Some(7)));
        let target = Arc::new(Collect::default());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let dw = Arc::clone(&dw);
                let target = Arc::clone(&target);
                thread::spawn(move || {
                    for i in 0..50 {
                        dw.update_documents(&[doc(&format!("t{t} d{i}"))], None, &*target)
                            .unwrap();
                    }
                })
            })
            .collect();
        for _ in 0..5 {
            dw.flush_all_threads(&*target).unwrap();
        }
        for handle in handles {
            handle.join().unwrap();
        }
        dw.flush_all_threads(&*target).unwrap();
        assert_eq!(target.total_docs(), 200);
        let mut seqs: Vec<u64> = target
            .segments
            .lock()
            .iter()
            .flat_map(|s| s.doc_seqs.clone())
            .collect();
        seqs.sort_unstable();
        seqs.dedup();
        assert_eq!(seqs.len(), 200);
    }
}
