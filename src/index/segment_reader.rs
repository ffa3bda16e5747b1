//! Read access to one segment.
//!
//! [`SegmentCoreReaders`] holds the immutable per-segment readers (terms,
//! postings, stored fields, doc values, vectors) and is shared by every
//! [`SegmentReader`] opened on the same segment. A `SegmentReader` adds the
//! per-commit state on top: live docs and numeric doc-values updates.
//!
//! Both types carry an explicit reference count next to their `Arc`: a
//! count reaching zero marks the reader closed, after which it refuses new
//! references.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bit_vec::BitVec;
use log::debug;

use crate::codec::{
    self, Codec, DocValuesProducer, FieldsProducer, PostingsEnum, SegmentReadState,
    StoredField, StoredFieldsReader, Terms, VectorsReader, NumericUpdates,
};
use crate::document::VectorValue;
use crate::error::{Result, TesseraError};
use crate::index::field_infos::FieldInfos;
use crate::index::segment_info::{SegmentCommitInfo, SegmentInfo};
use crate::index::term::Term;
use crate::storage::Storage;

/// Increment `count` unless it already reached zero.
pub(crate) fn try_inc_ref(count: &AtomicUsize, what: &str) -> Result<()> {
    let mut current = count.load(Ordering::Acquire);
    loop {
        if current == 0 {
            return Err(TesseraError::already_closed(format!("{what} is closed")));
        }
        match count.compare_exchange_weak(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => return Ok(()),
            Err(actual) => current = actual,
        }
    }
}

/// Decrement `count`; returns true when it reached zero.
pub(crate) fn try_dec_ref(count: &AtomicUsize, what: &str) -> Result<bool> {
    let mut current = count.load(Ordering::Acquire);
    loop {
        if current == 0 {
            return Err(TesseraError::already_closed(format!("{what} is already closed")));
        }
        match count.compare_exchange_weak(current, current - 1, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => return Ok(current == 1),
            Err(actual) => current = actual,
        }
    }
}

/// The immutable readers of one segment.
pub struct SegmentCoreReaders {
    info: Arc<SegmentInfo>,
    codec: Arc<dyn Codec>,
    field_infos: Arc<FieldInfos>,
    postings: Option<Arc<dyn FieldsProducer>>,
    stored_fields: Arc<dyn StoredFieldsReader>,
    doc_values: Option<Arc<dyn DocValuesProducer>>,
    vectors: Option<Arc<dyn VectorsReader>>,
    ref_count: AtomicUsize,
}

impl SegmentCoreReaders {
    /// Open every sub-reader of `info`, verifying each file's checksum.
    pub fn open(storage: Arc<dyn Storage>, info: Arc<SegmentInfo>) -> Result<Self> {
        let codec = codec::for_name(&info.codec)?;
        let field_infos = Arc::new(codec.field_infos_format().read(&*storage, &info)?);
        let state = SegmentReadState::new(storage, &info, Arc::clone(&field_infos));

        let postings = if field_infos.has_postings() {
            Some(codec.postings_format().fields_producer(&state)?)
        } else {
            None
        };
        let stored_fields = codec.stored_fields_format().reader(&state)?;
        let doc_values = if field_infos.has_doc_values() {
            Some(codec.doc_values_format().producer(&state)?)
        } else {
            None
        };
        let vectors = if field_infos.has_vectors() {
            Some(codec.vectors_format().reader(&state)?)
        } else {
            None
        };

        Ok(SegmentCoreReaders {
            info,
            codec,
            field_infos,
            postings,
            stored_fields,
            doc_values,
            vectors,
            ref_count: AtomicUsize::new(1),
        })
    }

    pub fn info(&self) -> &Arc<SegmentInfo> {
        &self.info
    }

    pub fn codec(&self) -> &Arc<dyn Codec> {
        &self.codec
    }

    pub fn field_infos(&self) -> &Arc<FieldInfos> {
        &self.field_infos
    }

    pub fn fields(&self) -> Option<&Arc<dyn FieldsProducer>> {
        self.postings.as_ref()
    }

    pub fn terms(&self, field: &str) -> Option<Arc<dyn Terms>> {
        self.postings.as_ref()?.terms(field)
    }

    pub fn stored_fields(&self) -> &Arc<dyn StoredFieldsReader> {
        &self.stored_fields
    }

    pub fn doc_values(&self) -> Option<&Arc<dyn DocValuesProducer>> {
        self.doc_values.as_ref()
    }

    pub fn vectors(&self) -> Option<&Arc<dyn VectorsReader>> {
        self.vectors.as_ref()
    }

    pub fn inc_ref(&self) -> Result<()> {
        try_inc_ref(&self.ref_count, &format!("segment core {}", self.info.name))
    }

    pub fn dec_ref(&self) -> Result<()> {
        if try_dec_ref(&self.ref_count, &format!("segment core {}", self.info.name))? {
            debug!("closed core readers of segment {}", self.info.name);
        }
        Ok(())
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::Acquire)
    }
}

impl fmt::Debug for SegmentCoreReaders {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentCoreReaders")
            .field("segment", &self.info.name)
            .field("codec", &self.codec.name())
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

/// A point-in-time view of one segment.
pub struct SegmentReader {
    core: Arc<SegmentCoreReaders>,
    commit_info: SegmentCommitInfo,
    live_docs: Arc<BitVec>,
    num_docs: u32,
    dv_updates: Arc<NumericUpdates>,
    ref_count: AtomicUsize,
}

impl SegmentReader {
    /// Open `commit_info` from storage, reading its live docs and updates.
    pub fn open(storage: Arc<dyn Storage>, commit_info: &SegmentCommitInfo) -> Result<Self> {
        let core = Arc::new(SegmentCoreReaders::open(
            Arc::clone(&storage),
            Arc::clone(&commit_info.info),
        )?);
        let reader = SegmentReader::open_with_core(&storage, &core, commit_info);
        // The reader took its own reference.
        core.dec_ref()?;
        reader
    }

    /// Open a new generation of a segment on an existing core.
    pub fn open_with_core(
        storage: &Arc<dyn Storage>,
        core: &Arc<SegmentCoreReaders>,
        commit_info: &SegmentCommitInfo,
    ) -> Result<Self> {
        let live_docs = core
            .codec()
            .live_docs_format()
            .read(&**storage, commit_info)?;
        let dv_updates = core
            .codec()
            .doc_values_updates_format()
            .read(&**storage, commit_info)?;
        SegmentReader::new(
            Arc::clone(core),
            commit_info.clone(),
            Arc::new(live_docs),
            Arc::new(dv_updates),
        )
    }

    /// A reader over in-memory state, as handed out by the writer.
    pub fn new(
        core: Arc<SegmentCoreReaders>,
        commit_info: SegmentCommitInfo,
        live_docs: Arc<BitVec>,
        dv_updates: Arc<NumericUpdates>,
    ) -> Result<Self> {
        if live_docs.len() != core.info().max_doc as usize {
            return Err(TesseraError::illegal_state(format!(
                "live docs of {} cover {} docs, segment has {}",
                core.info().name,
                live_docs.len(),
                core.info().max_doc
            )));
        }
        core.inc_ref()?;
        let num_docs = live_docs.iter().filter(|live| *live).count() as u32;
        Ok(SegmentReader {
            core,
            commit_info,
            live_docs,
            num_docs,
            dv_updates,
            ref_count: AtomicUsize::new(1),
        })
    }

    pub fn name(&self) -> &str {
        &self.core.info().name
    }

    pub fn core(&self) -> &Arc<SegmentCoreReaders> {
        &self.core
    }

    pub fn commit_info(&self) -> &SegmentCommitInfo {
        &self.commit_info
    }

    pub fn field_infos(&self) -> &Arc<FieldInfos> {
        self.core.field_infos()
    }

    pub fn max_doc(&self) -> u32 {
        self.core.info().max_doc
    }

    /// Live (not deleted) documents.
    pub fn num_docs(&self) -> u32 {
        self.num_docs
    }

    pub fn num_deleted_docs(&self) -> u32 {
        self.max_doc() - self.num_docs
    }

    pub fn has_deletions(&self) -> bool {
        self.num_docs < self.max_doc()
    }

    pub fn live_docs(&self) -> &Arc<BitVec> {
        &self.live_docs
    }

    pub fn is_live(&self, doc: u32) -> bool {
        self.live_docs.get(doc as usize).unwrap_or(false)
    }

    pub fn dv_updates(&self) -> &Arc<NumericUpdates> {
        &self.dv_updates
    }

    pub fn terms(&self, field: &str) -> Option<Arc<dyn Terms>> {
        self.core.terms(field)
    }

    /// Postings of `term`, including deleted documents.
    pub fn postings(&self, term: &Term) -> Result<Option<Box<dyn PostingsEnum>>> {
        let Some(terms) = self.terms(&term.field) else {
            return Ok(None);
        };
        let mut terms_enum = terms.iterator()?;
        if terms_enum.seek_exact(&term.bytes)? {
            Ok(Some(terms_enum.postings()?))
        } else {
            Ok(None)
        }
    }

    /// Docs containing `term`, deleted ones included.
    pub fn doc_freq(&self, term: &Term) -> Result<u32> {
        let Some(terms) = self.terms(&term.field) else {
            return Ok(0);
        };
        let mut terms_enum = terms.iterator()?;
        Ok(if terms_enum.seek_exact(&term.bytes)? {
            terms_enum.doc_freq()
        } else {
            0
        })
    }

    pub fn total_term_freq(&self, term: &Term) -> Result<u64> {
        let Some(terms) = self.terms(&term.field) else {
            return Ok(0);
        };
        let mut terms_enum = terms.iterator()?;
        Ok(if terms_enum.seek_exact(&term.bytes)? {
            terms_enum.total_term_freq()
        } else {
            0
        })
    }

    fn check_doc(&self, doc: u32) -> Result<()> {
        if doc >= self.max_doc() {
            return Err(TesseraError::illegal_argument(format!(
                "doc {doc} out of bounds for segment {} with {} docs",
                self.name(),
                self.max_doc()
            )));
        }
        Ok(())
    }

    /// Stored fields of `doc`.
    pub fn document(&self, doc: u32) -> Result<Vec<StoredField>> {
        self.check_doc(doc)?;
        self.core.stored_fields().document(doc)
    }

    /// Numeric doc value, with pending updates applied.
    pub fn numeric_doc_value(&self, field: &str, doc: u32) -> Result<Option<i64>> {
        self.check_doc(doc)?;
        if let Some(value) = self.dv_updates.get(field).and_then(|docs| docs.get(&doc)) {
            return Ok(Some(*value));
        }
        match self.core.doc_values() {
            Some(dv) => dv.numeric(field, doc),
            None => Ok(None),
        }
    }

    pub fn binary_doc_value(&self, field: &str, doc: u32) -> Result<Option<Vec<u8>>> {
        self.check_doc(doc)?;
        match self.core.doc_values() {
            Some(dv) => dv.binary(field, doc),
            None => Ok(None),
        }
    }

    pub fn sorted_doc_value(&self, field: &str, doc: u32) -> Result<Option<Vec<u8>>> {
        self.check_doc(doc)?;
        match self.core.doc_values() {
            Some(dv) => dv.sorted(field, doc),
            None => Ok(None),
        }
    }

    pub fn sorted_set_doc_values(&self, field: &str, doc: u32) -> Result<Vec<Vec<u8>>> {
        self.check_doc(doc)?;
        match self.core.doc_values() {
            Some(dv) => dv.sorted_set(field, doc),
            None => Ok(Vec::new()),
        }
    }

    pub fn vector(&self, field: &str, doc: u32) -> Result<Option<VectorValue>> {
        self.check_doc(doc)?;
        match self.core.vectors() {
            Some(vectors) => vectors.vector(field, doc),
            None => Ok(None),
        }
    }

    /// Nearest live neighbours of `query`, best first.
    pub fn knn(&self, field: &str, query: &[f32], k: usize) -> Result<Vec<(u32, f32)>> {
        match self.core.vectors() {
            Some(vectors) => vectors.search(field, query, k, &|doc| self.is_live(doc)),
            None => Ok(Vec::new()),
        }
    }

    pub fn inc_ref(&self) -> Result<()> {
        try_inc_ref(&self.ref_count, &format!("segment reader {}", self.name()))
    }

    pub fn dec_ref(&self) -> Result<()> {
        if try_dec_ref(&self.ref_count, &format!("segment reader {}", self.name()))? {
            self.core.dec_ref()?;
        }
        Ok(())
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::Acquire)
    }
}

impl Drop for SegmentReader {
    fn drop(&mut self) {
        // Readers dropped without being closed still release their core.
        if self.ref_count.swap(0, Ordering::AcqRel) > 0 {
            let _ = self.core.dec_ref();
        }
    }
}

impl fmt::Debug for SegmentReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentReader")
            .field("segment", &self.name())
            .field("max_doc", &self.max_doc())
            .field("num_docs", &self.num_docs)
            .field("del_gen", &self.commit_info.del_gen)
            .field("ref_count", &self.ref_count())
            .finish()
    }
}
