//! A per-thread document buffer.
//!
//! Adding a document is two-phase. [`invert_document`] analyzes and
//! validates it into an [`InvertedDocument`] without touching any buffer, so
//! a rejected document leaves the buffer as it was. Only then is the
//! inverted form applied with [`DocumentsWriterPerThread::add`]. A buffer is
//! flushed into exactly one new segment.

use std::collections::BTreeMap;
use std::sync::Arc;

use ahash::AHashMap;
use log::{debug, warn};

use crate::analysis::{Analyzer, Token};
use crate::codec::{Codec, DocValuesColumn, SegmentWriteState, segment_file_name};
use crate::document::{Document, Field, FieldValue, StoredValue, VectorValue};
use crate::error::{Result, TesseraError};
use crate::index::field_infos::{
    DocValuesType, FieldInfo, FieldInfos, FieldNumbers, FieldRequirements,
};
use crate::index::segment_info::{SOURCE_FLUSH, SegmentInfo};
use crate::index::terms_hash::{Occurrence, TermsHash};
use crate::storage::Storage;

/// Largest vector dimension accepted.
pub const MAX_VECTOR_DIMENSION: usize = 4096;

/// Bytes of a term prefix quoted in error messages.
const TERM_PREFIX_IN_ERRORS: usize = 30;

/// Why a document could not be inverted.
#[derive(Debug)]
pub enum InvertError {
    /// The document is invalid; nothing was buffered.
    Rejected(TesseraError),
    /// Analysis failed; the buffer must be aborted.
    Aborting(TesseraError),
}

impl InvertError {
    pub fn into_error(self) -> TesseraError {
        match self {
            InvertError::Rejected(e) | InvertError::Aborting(e) => e,
        }
    }
}

/// A single doc value of one field.
#[derive(Debug, Clone, PartialEq)]
pub enum DocValue {
    Numeric(i64),
    Binary(Vec<u8>),
    Sorted(Vec<u8>),
    SortedSet(Vec<Vec<u8>>),
}

/// Inverted terms of one field of one document.
#[derive(Debug, Default)]
struct FieldInversion {
    keep_positions: bool,
    last_position: Option<u32>,
    offset_base: u32,
    terms: AHashMap<Vec<u8>, Vec<Occurrence>>,
}

/// A validated, analyzed document ready to be buffered.
#[derive(Debug, Default)]
pub struct InvertedDocument {
    fields: BTreeMap<u32, FieldInfo>,
    postings: BTreeMap<u32, FieldInversion>,
    stored: Vec<(u32, StoredValue)>,
    doc_values: BTreeMap<u32, DocValue>,
    vectors: BTreeMap<u32, VectorValue>,
}

/// What inversion needs from the writer.
#[derive(Debug, Clone)]
pub struct InvertContext {
    pub analyzer: Arc<dyn Analyzer>,
    pub field_numbers: Arc<FieldNumbers>,
    pub max_term_length: usize,
}

fn requirements(field: &Field) -> FieldRequirements {
    let mut req = FieldRequirements {
        index_options: field.index_options(),
        store_payloads: field.has_payloads(),
        doc_values_type: field.doc_values_type(),
        ..Default::default()
    };
    if let FieldValue::Vector { value, similarity } = &field.value {
        req.vector_dimension = value.dimension() as u32;
        req.vector_encoding = value.encoding();
        req.vector_similarity = *similarity;
    }
    req
}

/// Field info describing only what this document uses of a field.
fn local_info(number: u32, name: &str, req: &FieldRequirements) -> FieldInfo {
    let mut info = FieldInfo::new(name, number);
    info.index_options = req.index_options;
    info.store_payloads = req.store_payloads;
    info.doc_values_type = req.doc_values_type;
    info.vector_dimension = req.vector_dimension;
    info.vector_encoding = req.vector_encoding;
    info.vector_similarity = req.vector_similarity;
    info
}

fn rejected<S: Into<String>>(msg: S) -> InvertError {
    InvertError::Rejected(TesseraError::illegal_argument(msg))
}

/// Analyze and validate `doc`.
pub fn invert_document(
    doc: &Document,
    ctx: &InvertContext,
) -> std::result::Result<InvertedDocument, InvertError> {
    let mut inverted = InvertedDocument::default();

    for field in doc.fields() {
        if let FieldValue::Vector { value, .. } = &field.value {
            if value.dimension() == 0 || value.dimension() > MAX_VECTOR_DIMENSION {
                return Err(rejected(format!(
                    "vector field '{}' has dimension {}, expected 1..={MAX_VECTOR_DIMENSION}",
                    field.name,
                    value.dimension()
                )));
            }
        }
        let req = requirements(field);
        let global = ctx
            .field_numbers
            .register(&field.name, &req)
            .map_err(InvertError::Rejected)?;
        let number = global.number;
        let local = local_info(number, &field.name, &req);
        inverted
            .fields
            .entry(number)
            .and_modify(|existing| existing.merge_from(&local))
            .or_insert(local);

        match &field.value {
            FieldValue::Text { text, stored } => {
                let stream = ctx
                    .analyzer
                    .token_stream(&field.name, text)
                    .map_err(InvertError::Aborting)?;
                let state = inverted.postings.entry(number).or_default();
                state.keep_positions = true;
                let mut max_end = 0u32;
                for token in stream {
                    let token = token.map_err(InvertError::Aborting)?;
                    max_end = max_end.max(token.end_offset as u32);
                    add_token(state, &field.name, &token, ctx.max_term_length)?;
                }
                state.offset_base = state.offset_base.saturating_add(max_end.max(text.len() as u32));
                if *stored {
                    inverted
                        .stored
                        .push((number, StoredValue::Text(text.clone())));
                }
            }
            FieldValue::Keyword { value, stored } => {
                check_term_length(&field.name, value.as_bytes(), ctx.max_term_length)?;
                let state = inverted.postings.entry(number).or_default();
                state
                    .terms
                    .entry(value.as_bytes().to_vec())
                    .or_default()
                    .push(Occurrence {
                        position: 0,
                        start_offset: 0,
                        end_offset: value.len() as u32,
                        payload: None,
                    });
                if *stored {
                    inverted
                        .stored
                        .push((number, StoredValue::Text(value.clone())));
                }
            }
            FieldValue::Tokens(tokens) => {
                let state = inverted.postings.entry(number).or_default();
                state.keep_positions = true;
                let mut max_end = 0u32;
                for token in tokens {
                    max_end = max_end.max(token.end_offset as u32);
                    add_token(state, &field.name, token, ctx.max_term_length)?;
                }
                state.offset_base = state.offset_base.saturating_add(max_end);
            }
            FieldValue::Stored(value) => inverted.stored.push((number, value.clone())),
            FieldValue::NumericDocValue(value) => {
                set_single_value(&mut inverted, number, &field.name, DocValue::Numeric(*value))?
            }
            FieldValue::BinaryDocValue(value) => set_single_value(
                &mut inverted,
                number,
                &field.name,
                DocValue::Binary(value.clone()),
            )?,
            FieldValue::SortedDocValue(value) => set_single_value(
                &mut inverted,
                number,
                &field.name,
                DocValue::Sorted(value.clone()),
            )?,
            FieldValue::SortedSetDocValue(values) => {
                let entry = inverted
                    .doc_values
                    .entry(number)
                    .or_insert_with(|| DocValue::SortedSet(Vec::new()));
                if let DocValue::SortedSet(existing) = entry {
                    existing.extend(values.iter().cloned());
                }
            }
            FieldValue::Vector { value, .. } => {
                if inverted.vectors.insert(number, value.clone()).is_some() {
                    return Err(rejected(format!(
                        "vector field '{}' appears more than once in a document",
                        field.name
                    )));
                }
            }
        }
    }
    Ok(inverted)
}

fn set_single_value(
    inverted: &mut InvertedDocument,
    number: u32,
    name: &str,
    value: DocValue,
) -> std::result::Result<(), InvertError> {
    if inverted.doc_values.insert(number, value).is_some() {
        return Err(rejected(format!(
            "doc values field '{name}' appears more than once in a document"
        )));
    }
    Ok(())
}

fn check_term_length(
    field: &str,
    term: &[u8],
    max_term_length: usize,
) -> std::result::Result<(), InvertError> {
    if term.len() > max_term_length {
        let prefix = String::from_utf8_lossy(&term[..TERM_PREFIX_IN_ERRORS.min(term.len())]);
        return Err(rejected(format!(
            "field '{field}' contains an immense term of {} bytes (max {max_term_length}); \
             the prefix of the first immense term is '{prefix}...'",
            term.len()
        )));
    }
    Ok(())
}

fn add_token(
    state: &mut FieldInversion,
    field: &str,
    token: &Token,
    max_term_length: usize,
) -> std::result::Result<(), InvertError> {
    check_term_length(field, token.text.as_bytes(), max_term_length)?;
    if token.end_offset < token.start_offset {
        return Err(rejected(format!(
            "field '{field}': end offset {} before start offset {} for term '{}'",
            token.end_offset, token.start_offset, token.text
        )));
    }
    let position = match state.last_position {
        None => token.position_increment.saturating_sub(1),
        Some(last) => last.checked_add(token.position_increment).ok_or_else(|| {
            rejected(format!("field '{field}': position overflow"))
        })?,
    };
    state.last_position = Some(position);
    state
        .terms
        .entry(token.text.as_bytes().to_vec())
        .or_default()
        .push(Occurrence {
            position,
            start_offset: state.offset_base.saturating_add(token.start_offset as u32),
            end_offset: state.offset_base.saturating_add(token.end_offset as u32),
            payload: token.payload.clone(),
        });
    Ok(())
}

/// A segment just written by a flush, not yet published.
#[derive(Debug)]
pub struct FlushedSegment {
    pub info: SegmentInfo,
    pub field_infos: Arc<FieldInfos>,
    /// Sequence number of every document, by doc id.
    pub doc_seqs: Vec<u64>,
    /// Writer epoch the buffer belonged to.
    pub epoch: u64,
}

/// Buffers documents of one indexing thread at a time.
#[derive(Debug)]
pub struct DocumentsWriterPerThread {
    id: u64,
    /// Full-flush generation the buffer was created in.
    pub(crate) flush_gen: u64,
    /// Rollback epoch the buffer was created in.
    pub(crate) epoch: u64,
    terms_hash: TermsHash,
    fields: BTreeMap<u32, FieldInfo>,
    stored: Vec<Vec<(u32, StoredValue)>>,
    doc_values: BTreeMap<u32, Vec<(u32, DocValue)>>,
    vectors: BTreeMap<u32, Vec<(u32, VectorValue)>>,
    doc_seqs: Vec<u64>,
    bytes_used: usize,
}

impl DocumentsWriterPerThread {
    pub fn new(id: u64, flush_gen: u64, epoch: u64) -> Self {
        DocumentsWriterPerThread {
            id,
            flush_gen,
            epoch,
            terms_hash: TermsHash::new(),
            fields: BTreeMap::new(),
            stored: Vec::new(),
            doc_values: BTreeMap::new(),
            vectors: BTreeMap::new(),
            doc_seqs: Vec::new(),
            bytes_used: 0,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn num_docs(&self) -> u32 {
        self.doc_seqs.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.doc_seqs.is_empty()
    }

    pub fn bytes_used(&self) -> usize {
        self.bytes_used
    }

    /// Sequence number of the first buffered document.
    pub fn first_seq(&self) -> Option<u64> {
        self.doc_seqs.first().copied()
    }

    /// Buffer inverted documents under sequence number `seq`.
    pub fn add(&mut self, docs: Vec<InvertedDocument>, seq: u64) {
        for doc in docs {
            let doc_id = self.doc_seqs.len() as u32;
            for (number, info) in doc.fields {
                self.fields
                    .entry(number)
                    .and_modify(|existing| existing.merge_from(&info))
                    .or_insert(info);
            }
            for (number, inversion) in doc.postings {
                for (term, occurrences) in inversion.terms {
                    self.bytes_used += self.terms_hash.add(
                        number,
                        doc_id,
                        &term,
                        occurrences,
                        inversion.keep_positions,
                    );
                }
            }
            self.bytes_used += doc
                .stored
                .iter()
                .map(|(_, v)| stored_size(v))
                .sum::<usize>()
                + 24;
            self.stored.push(doc.stored);
            for (number, value) in doc.doc_values {
                self.bytes_used += doc_value_size(&value);
                self.doc_values
                    .entry(number)
                    .or_default()
                    .push((doc_id, value));
            }
            for (number, value) in doc.vectors {
                self.bytes_used += value.dimension() * 4 + 16;
                self.vectors.entry(number).or_default().push((doc_id, value));
            }
            self.doc_seqs.push(seq);
        }
    }

    /// Discard every buffered document.
    pub fn abort(&mut self) {
        debug!("aborting buffer {} with {} docs", self.id, self.num_docs());
        *self = DocumentsWriterPerThread::new(self.id, self.flush_gen, self.epoch);
    }

    /// Write the buffered documents as segment `segment_name`.
    ///
    /// On failure every file written so far is deleted.
    pub fn flush(
        self,
        storage: &Arc<dyn Storage>,
        codec: &Arc<dyn Codec>,
        segment_name: &str,
    ) -> Result<FlushedSegment> {
        let max_doc = self.num_docs();
        if max_doc == 0 {
            return Err(TesseraError::illegal_state("cannot flush an empty buffer"));
        }
        let mut info = SegmentInfo::new(segment_name, max_doc, codec.name());
        info.set_diagnostics(SOURCE_FLUSH);
        let field_infos = Arc::new(FieldInfos::new(self.fields.values().cloned().collect()));
        let state = SegmentWriteState::new(
            Arc::clone(storage),
            segment_name,
            info.id,
            max_doc,
            Arc::clone(&field_infos),
        );
        let si_name = segment_file_name(segment_name, "", codec.segment_info_format().extension());

        let written = self.write_files(codec, &state, &field_infos).and_then(|()| {
            info.files = state.created_files();
            info.files.insert(si_name.clone());
            codec.segment_info_format().write(&**storage, &info)
        });
        if let Err(e) = written {
            warn!("flush of segment {segment_name} failed: {e}");
            state.delete_created_files();
            if storage.file_exists(&si_name) {
                let _ = storage.delete_file(&si_name);
            }
            return Err(e);
        }
        debug!(
            "flushed segment {segment_name}: {max_doc} docs, {} fields, ~{} bytes buffered",
            field_infos.len(),
            self.bytes_used
        );
        Ok(FlushedSegment {
            info,
            field_infos,
            doc_seqs: self.doc_seqs,
            epoch: self.epoch,
        })
    }

    fn write_files(
        &self,
        codec: &Arc<dyn Codec>,
        state: &SegmentWriteState,
        field_infos: &FieldInfos,
    ) -> Result<()> {
        let max_doc = self.num_docs();
        codec.field_infos_format().write(state, field_infos)?;

        if field_infos.has_postings() {
            let mut consumer = codec.postings_format().fields_consumer(state)?;
            self.terms_hash.flush(field_infos, consumer.as_mut())?;
            consumer.finish()?;
        }

        let mut stored = codec.stored_fields_format().writer(state)?;
        for doc in &self.stored {
            stored.start_document()?;
            for (number, value) in doc {
                stored.write_field(field_info(field_infos, *number)?, value)?;
            }
            stored.finish_document()?;
        }
        stored.finish(max_doc)?;

        if field_infos.has_doc_values() {
            let mut consumer = codec.doc_values_format().consumer(state)?;
            for (number, values) in &self.doc_values {
                let info = field_info(field_infos, *number)?;
                consumer.add_field(info, &build_column(info.doc_values_type, values, max_doc))?;
            }
            consumer.finish()?;
        }

        if field_infos.has_vectors() {
            let mut writer = codec.vectors_format().writer(state)?;
            for (number, values) in &self.vectors {
                writer.add_field(field_info(field_infos, *number)?, values)?;
            }
            writer.finish()?;
        }
        Ok(())
    }
}

fn field_info(field_infos: &FieldInfos, number: u32) -> Result<&FieldInfo> {
    field_infos
        .field_by_number(number)
        .ok_or_else(|| TesseraError::illegal_state(format!("unknown field number {number}")))
}

fn stored_size(value: &StoredValue) -> usize {
    match value {
        StoredValue::Text(text) => text.len() + 8,
        StoredValue::Bytes(bytes) => bytes.len() + 8,
        StoredValue::Long(_) | StoredValue::Double(_) => 8,
    }
}

fn doc_value_size(value: &DocValue) -> usize {
    match value {
        DocValue::Numeric(_) => 12,
        DocValue::Binary(b) | DocValue::Sorted(b) => b.len() + 12,
        DocValue::SortedSet(values) => values.iter().map(|v| v.len() + 8).sum::<usize>() + 12,
    }
}

/// Dense column of `max_doc` entries from sparse buffered values.
fn build_column(dv_type: DocValuesType, values: &[(u32, DocValue)], max_doc: u32) -> DocValuesColumn {
    let len = max_doc as usize;
    match dv_type {
        DocValuesType::Numeric => {
            let mut column = vec![None; len];
            for (doc, value) in values {
                if let DocValue::Numeric(v) = value {
                    column[*doc as usize] = Some(*v);
                }
            }
            DocValuesColumn::Numeric(column)
        }
        DocValuesType::Binary | DocValuesType::Sorted => {
            let mut column = vec![None; len];
            for (doc, value) in values {
                if let DocValue::Binary(v) | DocValue::Sorted(v) = value {
                    column[*doc as usize] = Some(v.clone());
                }
            }
            if dv_type == DocValuesType::Binary {
                DocValuesColumn::Binary(column)
            } else {
                DocValuesColumn::Sorted(column)
            }
        }
        DocValuesType::SortedSet | DocValuesType::None => {
            let mut column = vec![Vec::new(); len];
            for (doc, value) in values {
                if let DocValue::SortedSet(v) = value {
                    let mut set = v.clone();
                    set.sort();
                    set.dedup();
                    column[*doc as usize] = set;
                }
            }
            DocValuesColumn::SortedSet(column)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::StandardAnalyzer;
    use crate::codec::SegmentReadState;
    use crate::document::Document;
    use crate::index::field_infos::VectorSimilarity;
    use crate::storage::memory::MemoryStorage;

    fn context(max_term_length: usize) -> InvertContext {
        InvertContext {
            analyzer: Arc::new(StandardAnalyzer),
            field_numbers: Arc::new(FieldNumbers::new()),
            max_term_length,
        }
    }

    #[test]
    fn test_invert_positions_continue_across_values() {
        let ctx = context(100);
        let doc = Document::builder()
            .add_text("body", "a b")
            .add_text("body", "a")
            .build();
        let inverted = invert_document(&doc, &ctx).unwrap();
        let number = ctx.field_numbers.get("body").unwrap().number;
        let occurrences = &inverted.postings[&number].terms[&b"a"[..]];
        let positions: Vec<u32> = occurrences.iter().map(|o| o.position).collect();
        assert_eq!(positions, vec![0, 2]);
        assert_eq!(occurrences[1].start_offset, 3);
    }

    #[test]
    fn test_rejections() {
        let ctx = context(5);
        let doc = Document::builder().add_keyword("id", "much-too-long").build();
        let err = invert_document(&doc, &ctx).unwrap_err();
        assert!(matches!(err, InvertError::Rejected(_)));
        assert!(err.into_error().to_string().contains("immense term"));

        let doc = Document::builder()
            .add_numeric("price", 1)
            .add_numeric("price", 2)
            .build();
        assert!(matches!(
            invert_document(&doc, &ctx),
            Err(InvertError::Rejected(_))
        ));

        let doc = Document::builder()
            .add_float_vector("v", vec![], VectorSimilarity::Cosine)
            .build();
        assert!(matches!(
            invert_document(&doc, &ctx),
            Err(InvertError::Rejected(_))
        ));

        // Schema conflicts are rejected, not aborting.
        let doc = Document::builder().add_binary("price", vec![1]).build();
        assert!(matches!(
            invert_document(&doc, &ctx),
            Err(InvertError::Rejected(_))
        ));
    }

    #[test]
    fn test_flush_writes_readable_segment() {
        let ctx = context(100);
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::default());
        let codec = crate::codec::default_codec();
        let mut dwpt = DocumentsWriterPerThread::new(0, 0, 0);
        for (i, text) in ["a b c", "a c e"].iter().enumerate() {
            let doc = Document::builder()
                .add_text("text", *text)
                .add_numeric("n", i as i64)
                .build();
            dwpt.add(vec![invert_document(&doc, &ctx).unwrap()], i as u64 + 1);
        }
        assert_eq!(dwpt.num_docs(), 2);
        assert!(dwpt.bytes_used() > 0);

        let flushed = dwpt.flush(&storage, &codec, "_0").unwrap();
        assert_eq!(flushed.doc_seqs, vec![1, 2]);
        assert!(flushed.info.files.contains("_0.si"));
        for file in &flushed.info.files {
            assert!(storage.file_exists(file), "{file} missing");
        }

        let state = SegmentReadState::new(Arc::clone(&storage), &flushed.info, flushed.field_infos);
        let fields = codec.postings_format().fields_producer(&state).unwrap();
        let terms = fields.terms("text").unwrap();
        assert_eq!(terms.size(), 4);
        let dv = codec.doc_values_format().producer(&state).unwrap();
        assert_eq!(dv.numeric("n", 1).unwrap(), Some(1));
    }

    #[test]
    fn test_abort_clears_buffer() {
        let ctx = context(100);
        let mut dwpt = DocumentsWriterPerThread::new(3, 0, 0);
        let doc = Document::builder().add_text("t", "x").build();
        dwpt.add(vec![invert_document(&doc, &ctx).unwrap()], 1);
        dwpt.abort();
        assert!(dwpt.is_empty());
        assert_eq!(dwpt.bytes_used(), 0);
        assert_eq!(dwpt.id(), 3);
    }
}
