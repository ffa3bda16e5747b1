//! Consistency check of the latest commit.
//!
//! [`CheckIndex`] verifies the checksum footer of every file the commit
//! references, then opens each segment and walks its terms, postings,
//! stored fields, doc values, vectors and live docs. Segments are checked
//! in parallel on a rayon pool. Problems are collected per segment rather
//! than returned as errors, so one report covers the whole index.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use log::{info, warn};
use rayon::prelude::*;
use serde::Serialize;

use crate::codec::NO_MORE_DOCS;
use crate::codec::codec_util::verify_footer;
use crate::error::{Result, TesseraError};
use crate::index::field_infos::DocValuesType;
use crate::index::segment_info::SegmentCommitInfo;
use crate::index::segment_infos::{SegmentInfos, segments_file_name};
use crate::index::segment_reader::SegmentReader;
use crate::storage::Storage;

/// What the check found in one segment.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SegmentStatus {
    pub name: String,
    pub codec: String,
    pub max_doc: u32,
    pub num_docs: u32,
    pub del_count: u32,
    pub size_bytes: u64,
    pub num_files: usize,
    pub diagnostics: BTreeMap<String, String>,
    pub fields_with_postings: usize,
    pub terms: u64,
    pub postings: u64,
    pub positions: u64,
    pub stored_docs: u32,
    pub doc_values_fields: usize,
    pub vector_fields: usize,
    pub problems: Vec<String>,
}

impl SegmentStatus {
    pub fn is_clean(&self) -> bool {
        self.problems.is_empty()
    }
}

/// Report over a whole commit.
#[derive(Debug, Clone, Serialize)]
pub struct CheckIndexStatus {
    pub generation: u64,
    pub segments_file: String,
    pub user_data: BTreeMap<String, String>,
    pub total_max_doc: u64,
    pub total_num_docs: u64,
    pub segments: Vec<SegmentStatus>,
    /// Problems not tied to one segment.
    pub problems: Vec<String>,
    pub elapsed_ms: u128,
}

impl CheckIndexStatus {
    pub fn is_clean(&self) -> bool {
        self.problems.is_empty() && self.segments.iter().all(SegmentStatus::is_clean)
    }

    pub fn broken_segments(&self) -> impl Iterator<Item = &SegmentStatus> {
        self.segments.iter().filter(|s| !s.is_clean())
    }
}

pub struct CheckIndex {
    storage: Arc<dyn Storage>,
    threads: Option<usize>,
}

impl CheckIndex {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        CheckIndex {
            storage,
            threads: None,
        }
    }

    /// Check with this many threads instead of rayon's global pool.
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads.max(1));
        self
    }

    /// Check the latest commit.
    ///
    /// Fails only when no commit can be read; everything else is reported
    /// in the returned status.
    pub fn check(&self) -> Result<CheckIndexStatus> {
        let started = Instant::now();
        let infos = SegmentInfos::read_latest(&*self.storage)?;
        let segments_file = segments_file_name(infos.generation);
        let mut problems = Vec::new();
        if let Err(e) = self
            .storage
            .open_bytes(&segments_file)
            .and_then(|bytes| verify_footer(&bytes))
        {
            problems.push(format!("{segments_file}: {e}"));
        }

        let segments = match self.threads {
            Some(threads) => {
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .thread_name(|i| format!("tessera-check-{i}"))
                    .build()
                    .map_err(|e| TesseraError::other(format!("check thread pool: {e}")))?;
                pool.install(|| self.check_segments(&infos.segments))
            }
            None => self.check_segments(&infos.segments),
        };

        let status = CheckIndexStatus {
            generation: infos.generation,
            segments_file,
            total_max_doc: infos.total_max_doc(),
            total_num_docs: infos.total_num_docs(),
            user_data: infos.user_data.clone(),
            segments,
            problems,
            elapsed_ms: started.elapsed().as_millis(),
        };
        if status.is_clean() {
            info!(
                "checked generation {}: {} segments clean in {} ms",
                status.generation,
                status.segments.len(),
                status.elapsed_ms
            );
        } else {
            warn!(
                "checked generation {}: {} of {} segments broken",
                status.generation,
                status.broken_segments().count(),
                status.segments.len()
            );
        }
        Ok(status)
    }

    fn check_segments(&self, segments: &[SegmentCommitInfo]) -> Vec<SegmentStatus> {
        segments
            .par_iter()
            .map(|info| self.check_segment(info))
            .collect()
    }

    fn check_segment(&self, info: &SegmentCommitInfo) -> SegmentStatus {
        let mut status = SegmentStatus {
            name: info.name().to_string(),
            codec: info.info.codec.clone(),
            max_doc: info.max_doc(),
            num_docs: info.num_docs(),
            del_count: info.del_count,
            diagnostics: info.info.diagnostics.clone(),
            ..SegmentStatus::default()
        };

        let files = info.files();
        status.num_files = files.len();
        for file in &files {
            let verified = self.storage.open_bytes(file).and_then(|bytes| {
                verify_footer(&bytes)?;
                Ok(bytes.len() as u64)
            });
            match verified {
                Ok(size) => status.size_bytes += size,
                Err(e) if e.is_not_found() => status.problems.push(format!("missing file {file}")),
                Err(e) => status.problems.push(e.to_string()),
            }
        }
        if !status.is_clean() {
            return status;
        }

        match SegmentReader::open(Arc::clone(&self.storage), info) {
            Ok(reader) => {
                if let Err(e) = walk_segment(&reader, &mut status) {
                    status.problems.push(e.to_string());
                }
            }
            Err(e) => status.problems.push(format!("cannot open segment: {e}")),
        }
        status
    }
}

fn walk_segment(reader: &SegmentReader, status: &mut SegmentStatus) -> Result<()> {
    check_live_docs(reader, status);
    check_postings(reader, status)?;
    check_stored_fields(reader, status)?;
    check_doc_values(reader, status)?;
    check_vectors(reader, status)
}

fn check_live_docs(reader: &SegmentReader, status: &mut SegmentStatus) {
    let live = reader.live_docs();
    if live.len() != reader.max_doc() as usize {
        status.problems.push(format!(
            "live docs cover {} docs, segment has {}",
            live.len(),
            reader.max_doc()
        ));
        return;
    }
    let deleted = live.iter().filter(|bit| !bit).count() as u32;
    if deleted != status.del_count {
        status.problems.push(format!(
            "live docs mark {deleted} deleted, commit records {}",
            status.del_count
        ));
    }
}

fn check_postings(reader: &SegmentReader, status: &mut SegmentStatus) -> Result<()> {
    let Some(fields) = reader.core().fields() else {
        return Ok(());
    };
    let max_doc = reader.max_doc();
    for field in fields.fields() {
        let Some(terms) = fields.terms(&field) else {
            continue;
        };
        let keeps_positions = reader
            .field_infos()
            .field(&field)
            .is_some_and(|info| info.index_options.has_positions());
        let keeps_freqs = reader
            .field_infos()
            .field(&field)
            .is_some_and(|info| info.index_options.has_freqs());
        status.fields_with_postings += 1;

        let mut terms_enum = terms.iterator()?;
        let mut previous: Option<Vec<u8>> = None;
        let mut term_count = 0u64;
        let mut sum_doc_freq = 0u64;
        while terms_enum.next()? {
            let term = terms_enum.term().to_vec();
            if previous.as_ref().is_some_and(|p| *p >= term) {
                status.problems.push(format!("field {field}: terms out of order at {term:?}"));
            }
            let mut postings = terms_enum.postings()?;
            let mut docs = 0u32;
            let mut freqs = 0u64;
            let mut last_doc: Option<u32> = None;
            loop {
                let doc = postings.next_doc()?;
                if doc == NO_MORE_DOCS {
                    break;
                }
                if doc >= max_doc || last_doc.is_some_and(|last| doc <= last) {
                    status.problems.push(format!(
                        "field {field}: doc {doc} out of order or range for term {term:?}"
                    ));
                    break;
                }
                last_doc = Some(doc);
                docs += 1;
                let freq = postings.freq();
                freqs += u64::from(freq);
                if keeps_positions {
                    let mut last_position = 0u32;
                    for i in 0..freq {
                        let position = postings.next_position()?;
                        if i > 0 && position < last_position {
                            status.problems.push(format!(
                                "field {field}: positions go backwards in doc {doc}"
                            ));
                        }
                        last_position = position;
                        status.positions += 1;
                    }
                }
            }
            if docs != terms_enum.doc_freq() {
                status.problems.push(format!(
                    "field {field}: term {term:?} has doc_freq {} but {docs} postings",
                    terms_enum.doc_freq()
                ));
            }
            if keeps_freqs && freqs != terms_enum.total_term_freq() {
                status.problems.push(format!(
                    "field {field}: term {term:?} has total_term_freq {} but {freqs} occurrences",
                    terms_enum.total_term_freq()
                ));
            }
            status.postings += u64::from(docs);
            sum_doc_freq += u64::from(docs);
            term_count += 1;
            previous = Some(term);
        }
        if term_count != terms.size() {
            status.problems.push(format!(
                "field {field}: {term_count} terms enumerated, dictionary says {}",
                terms.size()
            ));
        }
        if sum_doc_freq != terms.sum_doc_freq() {
            status.problems.push(format!(
                "field {field}: sum_doc_freq {} does not match postings {sum_doc_freq}",
                terms.sum_doc_freq()
            ));
        }
        status.terms += term_count;
    }
    Ok(())
}

fn check_stored_fields(reader: &SegmentReader, status: &mut SegmentStatus) -> Result<()> {
    for doc in 0..reader.max_doc() {
        reader.document(doc)?;
        if reader.is_live(doc) {
            status.stored_docs += 1;
        }
    }
    Ok(())
}

fn check_doc_values(reader: &SegmentReader, status: &mut SegmentStatus) -> Result<()> {
    for info in reader.field_infos().iter() {
        if info.doc_values_type == DocValuesType::None {
            continue;
        }
        status.doc_values_fields += 1;
        for doc in 0..reader.max_doc() {
            match info.doc_values_type {
                DocValuesType::Numeric => {
                    reader.numeric_doc_value(&info.name, doc)?;
                }
                DocValuesType::Binary => {
                    reader.binary_doc_value(&info.name, doc)?;
                }
                DocValuesType::Sorted => {
                    reader.sorted_doc_value(&info.name, doc)?;
                }
                DocValuesType::SortedSet => {
                    let values = reader.sorted_set_doc_values(&info.name, doc)?;
                    if values.windows(2).any(|pair| pair[0] >= pair[1]) {
                        status.problems.push(format!(
                            "field {}: sorted set of doc {doc} is not strictly ordered",
                            info.name
                        ));
                    }
                }
                DocValuesType::None => {}
            }
        }
    }
    Ok(())
}

fn check_vectors(reader: &SegmentReader, status: &mut SegmentStatus) -> Result<()> {
    for info in reader.field_infos().iter().filter(|f| f.has_vectors()) {
        status.vector_fields += 1;
        for doc in 0..reader.max_doc() {
            if let Some(vector) = reader.vector(&info.name, doc)? {
                if vector.dimension() != info.vector_dimension as usize {
                    status.problems.push(format!(
                        "field {}: doc {doc} has a vector of dimension {}, expected {}",
                        info.name,
                        vector.dimension(),
                        info.vector_dimension
                    ));
                }
            }
        }
    }
    Ok(())
}
