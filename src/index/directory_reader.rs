//! Point-in-time view over every segment of an index.
//!
//! A [`DirectoryReader`] is opened either on the latest commit in storage
//! or on a writer (near-real-time), and never changes afterwards. Reopening
//! with [`DirectoryReader::open_if_changed`] shares the [`SegmentReader`]s
//! of unchanged segments and reuses the core readers of segments whose
//! deletes changed.
//!
//! Readers carry an explicit reference count. The last
//! [`DirectoryReader::dec_ref`] (or [`DirectoryReader::close`]) releases the
//! segment readers and, for near-real-time readers, the files pinned in the
//! writer.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use bit_vec::BitVec;
use log::debug;

use crate::codec::NumericUpdates;
use crate::error::{Result, TesseraError};
use crate::index::index_writer::IndexWriter;
use crate::index::segment_infos::{SegmentInfos, last_commit_generation};
use crate::index::segment_reader::{SegmentCoreReaders, SegmentReader, try_dec_ref, try_inc_ref};
use crate::index::term::Term;
use crate::storage::Storage;

/// The writer side of a near-real-time reader.
pub(crate) trait NrtSource: Send + Sync {
    /// A new reader if the writer changed since `old` was opened.
    fn reopen(&self, old: &DirectoryReader) -> Result<Option<DirectoryReader>>;

    /// True when nothing happened in the writer since a reader saw
    /// `version` and operations up to `seq`.
    fn is_current(&self, version: u64, seq: u64) -> bool;

    /// Release files pinned for a reader.
    fn release_files(&self, files: &BTreeSet<String>);
}

/// Identifies the writer an NRT reader came from.
pub(crate) struct NrtOrigin {
    pub writer: Weak<dyn NrtSource>,
    pub writer_id: u64,
    /// Last operation included.
    pub seq: u64,
    pub pinned_files: BTreeSet<String>,
}

pub struct DirectoryReader {
    storage: Arc<dyn Storage>,
    segments: Vec<Arc<SegmentReader>>,
    starts: Vec<u32>,
    max_doc: u32,
    num_docs: u32,
    generation: u64,
    version: u64,
    user_data: BTreeMap<String, String>,
    origin: Option<NrtOrigin>,
    ref_count: AtomicUsize,
}

impl DirectoryReader {
    /// Open the latest commit of `storage`.
    pub fn open(storage: Arc<dyn Storage>) -> Result<Self> {
        let infos = SegmentInfos::read_latest(&*storage)?;
        DirectoryReader::open_infos(storage, infos, None)
    }

    /// Open a specific commit generation.
    pub fn open_commit(storage: Arc<dyn Storage>, generation: u64) -> Result<Self> {
        let infos = SegmentInfos::read_commit(&*storage, generation)?;
        DirectoryReader::open_infos(storage, infos, None)
    }

    /// A near-real-time reader over everything `writer` has indexed,
    /// committed or not.
    pub fn open_from_writer(writer: &IndexWriter) -> Result<Self> {
        writer.get_reader()
    }

    /// Reopen `old` through `writer` if anything changed since.
    pub fn open_if_changed_from_writer(
        old: &DirectoryReader,
        writer: &IndexWriter,
    ) -> Result<Option<Self>> {
        writer.get_reader_if_changed(old)
    }

    /// Reopen if the index changed since `old` was opened.
    ///
    /// Returns `None` when `old` is still current. A near-real-time reader
    /// is reopened through its writer while that writer is open.
    pub fn open_if_changed(old: &DirectoryReader) -> Result<Option<Self>> {
        old.ensure_open()?;
        if let Some(origin) = &old.origin {
            if let Some(writer) = origin.writer.upgrade() {
                return writer.reopen(old);
            }
        }
        let files = old.storage.list_files()?;
        match last_commit_generation(&files) {
            Some(generation) if generation != old.generation || old.origin.is_some() => {
                let infos = SegmentInfos::read_commit(&*old.storage, generation)?;
                DirectoryReader::open_infos(Arc::clone(&old.storage), infos, Some(old)).map(Some)
            }
            Some(_) => Ok(None),
            None => Err(TesseraError::index_not_found("no commit found while reopening")),
        }
    }

    fn open_infos(
        storage: Arc<dyn Storage>,
        infos: SegmentInfos,
        old: Option<&DirectoryReader>,
    ) -> Result<Self> {
        let mut segments = Vec::with_capacity(infos.len());
        for info in &infos.segments {
            let previous = old.and_then(|o| o.segments.iter().find(|s| s.name() == info.name()));
            let reader = match previous {
                Some(previous) if previous.commit_info().info.id == info.info.id => {
                    let same_generation = previous.commit_info().del_gen == info.del_gen
                        && previous.commit_info().dv_gen == info.dv_gen
                        && previous.num_deleted_docs() == info.del_count;
                    if same_generation {
                        share(previous, &mut segments)?;
                        continue;
                    }
                    SegmentReader::open_with_core(&storage, previous.core(), info)
                }
                _ => SegmentReader::open(Arc::clone(&storage), info),
            };
            match reader {
                Ok(reader) => segments.push(Arc::new(reader)),
                Err(e) => {
                    release_all(&segments);
                    return Err(e);
                }
            }
        }
        debug!(
            "opened reader on generation {} with {} segments",
            infos.generation,
            segments.len()
        );
        Ok(DirectoryReader::from_parts(
            storage,
            segments,
            infos.generation,
            infos.version,
            infos.user_data,
            None,
        ))
    }

    /// Assemble a reader from segment readers that each hold one reference
    /// for it.
    pub(crate) fn from_parts(
        storage: Arc<dyn Storage>,
        segments: Vec<Arc<SegmentReader>>,
        generation: u64,
        version: u64,
        user_data: BTreeMap<String, String>,
        origin: Option<NrtOrigin>,
    ) -> Self {
        let mut starts = Vec::with_capacity(segments.len());
        let mut max_doc = 0u32;
        let mut num_docs = 0u32;
        for segment in &segments {
            starts.push(max_doc);
            max_doc += segment.max_doc();
            num_docs += segment.num_docs();
        }
        DirectoryReader {
            storage,
            segments,
            starts,
            max_doc,
            num_docs,
            generation,
            version,
            user_data,
            origin,
            ref_count: AtomicUsize::new(1),
        }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Segment readers in index order.
    pub fn leaves(&self) -> &[Arc<SegmentReader>] {
        &self.segments
    }

    /// First global doc id of every segment.
    pub fn doc_starts(&self) -> &[u32] {
        &self.starts
    }

    pub fn max_doc(&self) -> u32 {
        self.max_doc
    }

    pub fn num_docs(&self) -> u32 {
        self.num_docs
    }

    pub fn num_deleted_docs(&self) -> u32 {
        self.max_doc - self.num_docs
    }

    /// Commit generation this reader reflects; the last commit for NRT readers.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn user_data(&self) -> &BTreeMap<String, String> {
        &self.user_data
    }

    /// True for a reader opened on a writer.
    pub fn is_near_real_time(&self) -> bool {
        self.origin.is_some()
    }

    pub(crate) fn writer_id(&self) -> Option<u64> {
        self.origin.as_ref().map(|o| o.writer_id)
    }

    /// Segment index and local doc id of a global doc id.
    pub fn locate(&self, doc: u32) -> Option<(usize, u32)> {
        if doc >= self.max_doc {
            return None;
        }
        let index = self.starts.partition_point(|start| *start <= doc) - 1;
        Some((index, doc - self.starts[index]))
    }

    /// Documents containing `term`, deleted ones included.
    pub fn doc_freq(&self, term: &Term) -> Result<u64> {
        self.ensure_open()?;
        let mut total = 0u64;
        for segment in &self.segments {
            total += u64::from(segment.doc_freq(term)?);
        }
        Ok(total)
    }

    pub fn total_term_freq(&self, term: &Term) -> Result<u64> {
        self.ensure_open()?;
        let mut total = 0u64;
        for segment in &self.segments {
            total += segment.total_term_freq(term)?;
        }
        Ok(total)
    }

    /// True when no newer commit exists; NRT readers ask their writer.
    pub fn is_current(&self) -> Result<bool> {
        self.ensure_open()?;
        if let Some(origin) = &self.origin {
            return match origin.writer.upgrade() {
                Some(writer) => Ok(writer.is_current(self.version, origin.seq)),
                None => Ok(false),
            };
        }
        let files = self.storage.list_files()?;
        Ok(last_commit_generation(&files) == Some(self.generation))
    }

    /// A segment reader of this reader that can be shared by a reader over
    /// the given state.
    pub(crate) fn shareable(
        &self,
        core: &Arc<SegmentCoreReaders>,
        live: &Arc<BitVec>,
        dv: &Arc<NumericUpdates>,
    ) -> Option<&Arc<SegmentReader>> {
        self.segments.iter().find(|s| {
            Arc::ptr_eq(s.core(), core)
                && Arc::ptr_eq(s.live_docs(), live)
                && Arc::ptr_eq(s.dv_updates(), dv)
        })
    }

    pub fn ensure_open(&self) -> Result<()> {
        if self.ref_count.load(Ordering::Acquire) == 0 {
            return Err(TesseraError::already_closed("directory reader is closed"));
        }
        Ok(())
    }

    pub fn inc_ref(&self) -> Result<()> {
        try_inc_ref(&self.ref_count, "directory reader")
    }

    /// Drop one reference; the last one closes the reader.
    pub fn dec_ref(&self) -> Result<()> {
        if try_dec_ref(&self.ref_count, "directory reader")? {
            self.release();
        }
        Ok(())
    }

    /// Same as [`DirectoryReader::dec_ref`]; closing twice is an error.
    pub fn close(&self) -> Result<()> {
        self.dec_ref()
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::Acquire)
    }

    fn release(&self) {
        release_all(&self.segments);
        if let Some(origin) = &self.origin {
            if let Some(writer) = origin.writer.upgrade() {
                writer.release_files(&origin.pinned_files);
            }
        }
    }
}

fn share(reader: &Arc<SegmentReader>, into: &mut Vec<Arc<SegmentReader>>) -> Result<()> {
    if let Err(e) = reader.inc_ref() {
        release_all(into);
        return Err(e);
    }
    into.push(Arc::clone(reader));
    Ok(())
}

fn release_all(segments: &[Arc<SegmentReader>]) {
    for segment in segments {
        if let Err(e) = segment.dec_ref() {
            debug!("releasing segment reader {}: {e}", segment.name());
        }
    }
}

impl Drop for DirectoryReader {
    fn drop(&mut self) {
        if self.ref_count.swap(0, Ordering::AcqRel) > 0 {
            self.release();
        }
    }
}

impl fmt::Debug for DirectoryReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectoryReader")
            .field("generation", &self.generation)
            .field("version", &self.version)
            .field("segments", &self.segments.len())
            .field("max_doc", &self.max_doc)
            .field("num_docs", &self.num_docs)
            .field("nrt", &self.origin.is_some())
            .field("ref_count", &self.ref_count())
            .finish()
    }
}
