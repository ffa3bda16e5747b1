//! Pluggable, versioned and checksummed segment file formats.
//!
//! A [`Codec`] bundles one implementation of every sub-format a segment
//! needs: postings with their terms dictionary, stored fields, doc values,
//! vectors, field infos, segment info, live docs and doc-values updates.
//! Segments record the name of the codec that wrote them, and readers resolve
//! it through the registry ([`for_name`]) so older segments stay readable
//! after the default changes.
//!
//! Every file a codec writes starts with a header and ends with a checksum
//! footer (see [`codec_util`]); readers verify both when they open a file.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use bit_vec::BitVec;
use lazy_static::lazy_static;
use parking_lot::{Mutex, RwLock};

use crate::document::{StoredValue, VectorValue};
use crate::error::{Result, TesseraError};
use crate::index::field_infos::{FieldInfo, FieldInfos};
use crate::index::segment_info::{SegmentCommitInfo, SegmentInfo};
use crate::storage::structured::StructWriter;
use crate::storage::{FileBytes, Storage};

pub mod codec_util;
pub mod doc_values;
pub mod dv_updates;
pub mod field_infos_format;
pub mod live_docs;
pub mod postings;
pub mod segment_info_format;
pub mod stored_fields;
pub mod tessera10;
pub mod vectors;

pub use self::postings::{
    NO_MORE_DOCS, PostingsEnum, SeekStatus, TermStats, Terms, TermsEnum,
};
pub use self::stored_fields::StoredField;
pub use self::tessera10::Tessera10Codec;

/// Name of the codec new segments are written with.
pub const DEFAULT_CODEC: &str = "Tessera10";

/// Everything a format needs to write the files of one new segment.
#[derive(Clone)]
pub struct SegmentWriteState {
    pub storage: Arc<dyn Storage>,
    pub segment_name: String,
    pub segment_id: [u8; 16],
    pub max_doc: u32,
    pub field_infos: Arc<FieldInfos>,
    created_files: Arc<Mutex<BTreeSet<String>>>,
}

impl SegmentWriteState {
    pub fn new(
        storage: Arc<dyn Storage>,
        segment_name: &str,
        segment_id: [u8; 16],
        max_doc: u32,
        field_infos: Arc<FieldInfos>,
    ) -> Self {
        SegmentWriteState {
            storage,
            segment_name: segment_name.to_string(),
            segment_id,
            max_doc,
            field_infos,
            created_files: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    /// Name of this segment's file with the given extension.
    pub fn file_name(&self, ext: &str) -> String {
        segment_file_name(&self.segment_name, "", ext)
    }

    /// Create and track a new file of this segment.
    pub fn create_output(&self, ext: &str) -> Result<StructWriter> {
        let name = self.file_name(ext);
        let output = self.storage.create_output(&name)?;
        self.created_files.lock().insert(name);
        Ok(StructWriter::new(output))
    }

    /// Every file created through this state so far.
    pub fn created_files(&self) -> BTreeSet<String> {
        self.created_files.lock().clone()
    }

    /// Best-effort removal of every created file after a failure.
    pub fn delete_created_files(&self) {
        for name in self.created_files.lock().iter() {
            if self.storage.file_exists(name) {
                if let Err(e) = self.storage.delete_file(name) {
                    log::warn!("failed to delete partial file {name}: {e}");
                }
            }
        }
    }
}

impl fmt::Debug for SegmentWriteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentWriteState")
            .field("segment_name", &self.segment_name)
            .field("max_doc", &self.max_doc)
            .finish()
    }
}

/// Everything a format needs to open the files of an existing segment.
#[derive(Clone)]
pub struct SegmentReadState {
    pub storage: Arc<dyn Storage>,
    pub segment_name: String,
    pub segment_id: [u8; 16],
    pub max_doc: u32,
    pub field_infos: Arc<FieldInfos>,
}

impl SegmentReadState {
    pub fn new(storage: Arc<dyn Storage>, info: &SegmentInfo, field_infos: Arc<FieldInfos>) -> Self {
        SegmentReadState {
            storage,
            segment_name: info.name.clone(),
            segment_id: info.id,
            max_doc: info.max_doc,
            field_infos,
        }
    }

    /// Name of this segment's file with the given extension.
    pub fn file_name(&self, ext: &str) -> String {
        segment_file_name(&self.segment_name, "", ext)
    }

    /// Open one of this segment's files.
    pub fn open(&self, ext: &str) -> Result<FileBytes> {
        self.storage.open_bytes(&self.file_name(ext))
    }
}

impl fmt::Debug for SegmentReadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentReadState")
            .field("segment_name", &self.segment_name)
            .field("max_doc", &self.max_doc)
            .finish()
    }
}

/// `_3` + `""` + `tim` → `_3.tim`; with a suffix `_3_5.liv`.
pub fn segment_file_name(segment: &str, suffix: &str, ext: &str) -> String {
    match (suffix.is_empty(), ext.is_empty()) {
        (true, true) => segment.to_string(),
        (true, false) => format!("{segment}.{ext}"),
        (false, true) => format!("{segment}_{suffix}"),
        (false, false) => format!("{segment}_{suffix}.{ext}"),
    }
}

/// Segment name a file belongs to, if it is a segment file.
pub fn parse_segment_name(file_name: &str) -> Option<&str> {
    if !file_name.starts_with('_') {
        return None;
    }
    let rest = &file_name[1..];
    let end = rest.find(['_', '.']).map(|i| i + 1).unwrap_or(file_name.len());
    Some(&file_name[..end])
}

/// Writes the inverted index of a segment, one field at a time.
///
/// Fields must be started in field-number order and terms added in unsigned
/// byte order.
pub trait FieldsConsumer: Send {
    /// Begin writing the terms of `field`.
    fn start_field(&mut self, field: &FieldInfo) -> Result<()>;

    /// Write one term and its postings.
    ///
    /// Returns `None` (and writes nothing) when `postings` yields no
    /// documents, as happens when a merge drops every doc of a term.
    fn add_term(&mut self, term: &[u8], postings: &mut dyn PostingsEnum)
    -> Result<Option<TermStats>>;

    /// Finish the current field.
    fn finish_field(&mut self) -> Result<()>;

    /// Write the index and footers and close every file.
    fn finish(self: Box<Self>) -> Result<()>;
}

/// Read access to the inverted index of a segment.
pub trait FieldsProducer: Send + Sync + fmt::Debug {
    /// Terms of a field, or `None` if the field has no postings.
    fn terms(&self, field: &str) -> Option<Arc<dyn Terms>>;

    /// Names of every field with postings, in field-number order.
    fn fields(&self) -> Vec<String>;
}

/// Postings and terms dictionary format.
pub trait PostingsFormat: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;
    fn fields_consumer(&self, state: &SegmentWriteState) -> Result<Box<dyn FieldsConsumer>>;
    fn fields_producer(&self, state: &SegmentReadState) -> Result<Arc<dyn FieldsProducer>>;
}

/// Writes stored fields document by document, in doc id order.
pub trait StoredFieldsWriter: Send {
    fn start_document(&mut self) -> Result<()>;
    fn write_field(&mut self, field: &FieldInfo, value: &StoredValue) -> Result<()>;
    fn finish_document(&mut self) -> Result<()>;
    /// Close the files; `num_docs` must match the documents written.
    fn finish(self: Box<Self>, num_docs: u32) -> Result<()>;
}

/// Random access to stored fields by doc id.
pub trait StoredFieldsReader: Send + Sync + fmt::Debug {
    fn document(&self, doc: u32) -> Result<Vec<StoredField>>;
}

/// Stored fields format.
pub trait StoredFieldsFormat: Send + Sync + fmt::Debug {
    fn writer(&self, state: &SegmentWriteState) -> Result<Box<dyn StoredFieldsWriter>>;
    fn reader(&self, state: &SegmentReadState) -> Result<Arc<dyn StoredFieldsReader>>;
}

/// One materialized doc values column, indexed by doc id.
#[derive(Debug, Clone, PartialEq)]
pub enum DocValuesColumn {
    Numeric(Vec<Option<i64>>),
    Binary(Vec<Option<Vec<u8>>>),
    Sorted(Vec<Option<Vec<u8>>>),
    SortedSet(Vec<Vec<Vec<u8>>>),
}

impl DocValuesColumn {
    /// Number of documents covered.
    pub fn len(&self) -> usize {
        match self {
            DocValuesColumn::Numeric(v) => v.len(),
            DocValuesColumn::Binary(v) | DocValuesColumn::Sorted(v) => v.len(),
            DocValuesColumn::SortedSet(v) => v.len(),
        }
    }

    /// True when no document is covered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Writes doc values columns.
pub trait DocValuesConsumer: Send {
    fn add_field(&mut self, field: &FieldInfo, column: &DocValuesColumn) -> Result<()>;
    fn finish(self: Box<Self>) -> Result<()>;
}

/// Random access to doc values by doc id.
pub trait DocValuesProducer: Send + Sync + fmt::Debug {
    fn numeric(&self, field: &str, doc: u32) -> Result<Option<i64>>;
    fn binary(&self, field: &str, doc: u32) -> Result<Option<Vec<u8>>>;
    fn sorted(&self, field: &str, doc: u32) -> Result<Option<Vec<u8>>>;
    fn sorted_set(&self, field: &str, doc: u32) -> Result<Vec<Vec<u8>>>;
    /// Read a whole column back, for merging and checking.
    fn column(&self, field: &FieldInfo) -> Result<Option<DocValuesColumn>>;
}

/// Doc values format.
pub trait DocValuesFormat: Send + Sync + fmt::Debug {
    fn consumer(&self, state: &SegmentWriteState) -> Result<Box<dyn DocValuesConsumer>>;
    fn producer(&self, state: &SegmentReadState) -> Result<Arc<dyn DocValuesProducer>>;
}

/// Writes the vectors of each vector field.
pub trait VectorsWriter: Send {
    /// `values` must be in increasing doc id order.
    fn add_field(&mut self, field: &FieldInfo, values: &[(u32, VectorValue)]) -> Result<()>;
    fn finish(self: Box<Self>) -> Result<()>;
}

/// Random access and exact nearest-neighbour search over vectors.
pub trait VectorsReader: Send + Sync + fmt::Debug {
    fn vector(&self, field: &str, doc: u32) -> Result<Option<VectorValue>>;
    /// Doc ids that have a vector in `field`, ascending.
    fn docs(&self, field: &str) -> Vec<u32>;
    /// Top `k` docs by similarity, best first, among docs accepted by `accept`.
    fn search(
        &self,
        field: &str,
        query: &[f32],
        k: usize,
        accept: &dyn Fn(u32) -> bool,
    ) -> Result<Vec<(u32, f32)>>;
}

/// Vectors format.
pub trait VectorsFormat: Send + Sync + fmt::Debug {
    fn writer(&self, state: &SegmentWriteState) -> Result<Box<dyn VectorsWriter>>;
    fn reader(&self, state: &SegmentReadState) -> Result<Arc<dyn VectorsReader>>;
}

/// Field infos format (`.fnm`).
pub trait FieldInfosFormat: Send + Sync + fmt::Debug {
    fn write(&self, state: &SegmentWriteState, infos: &FieldInfos) -> Result<()>;
    fn read(&self, storage: &dyn Storage, info: &SegmentInfo) -> Result<FieldInfos>;
}

/// Segment info format (`.si`).
pub trait SegmentInfoFormat: Send + Sync + fmt::Debug {
    /// File extension of segment info files.
    fn extension(&self) -> &str;
    fn write(&self, storage: &dyn Storage, info: &SegmentInfo) -> Result<()>;
    fn read(&self, storage: &dyn Storage, name: &str, id: [u8; 16]) -> Result<SegmentInfo>;
}

/// Per-generation live docs format (`.liv`).
pub trait LiveDocsFormat: Send + Sync + fmt::Debug {
    /// Write `live` as generation `gen` and return the file name.
    fn write(
        &self,
        storage: &dyn Storage,
        info: &SegmentCommitInfo,
        live: &BitVec,
        del_count: u32,
        generation: i64,
    ) -> Result<String>;
    fn read(&self, storage: &dyn Storage, info: &SegmentCommitInfo) -> Result<BitVec>;
}

/// Numeric doc-values updates, per field then per doc.
pub type NumericUpdates = BTreeMap<String, BTreeMap<u32, i64>>;

/// Per-generation numeric doc-values updates format (`.dvu`).
pub trait DocValuesUpdatesFormat: Send + Sync + fmt::Debug {
    /// Write `updates` as generation `gen` and return the file name.
    fn write(
        &self,
        storage: &dyn Storage,
        info: &SegmentCommitInfo,
        updates: &NumericUpdates,
        generation: i64,
    ) -> Result<String>;
    fn read(&self, storage: &dyn Storage, info: &SegmentCommitInfo) -> Result<NumericUpdates>;
}

/// A named bundle of sub-formats.
pub trait Codec: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;
    fn postings_format(&self) -> &dyn PostingsFormat;
    fn stored_fields_format(&self) -> &dyn StoredFieldsFormat;
    fn doc_values_format(&self) -> &dyn DocValuesFormat;
    fn vectors_format(&self) -> &dyn VectorsFormat;
    fn field_infos_format(&self) -> &dyn FieldInfosFormat;
    fn segment_info_format(&self) -> &dyn SegmentInfoFormat;
    fn live_docs_format(&self) -> &dyn LiveDocsFormat;
    fn doc_values_updates_format(&self) -> &dyn DocValuesUpdatesFormat;
}

lazy_static! {
    static ref CODECS: RwLock<HashMap<String, Arc<dyn Codec>>> = {
        let mut codecs: HashMap<String, Arc<dyn Codec>> = HashMap::new();
        let default: Arc<dyn Codec> = Arc::new(Tessera10Codec::new());
        codecs.insert(default.name().to_string(), default);
        RwLock::new(codecs)
    };
}

/// Make a codec resolvable by name.
pub fn register(codec: Arc<dyn Codec>) {
    CODECS.write().insert(codec.name().to_string(), codec);
}

/// Resolve a codec recorded in segment metadata.
pub fn for_name(name: &str) -> Result<Arc<dyn Codec>> {
    CODECS.read().get(name).cloned().ok_or_else(|| {
        TesseraError::illegal_argument(format!("no codec registered under the name '{name}'"))
    })
}

/// The codec new segments are written with.
pub fn default_codec() -> Arc<dyn Codec> {
    for_name(DEFAULT_CODEC).unwrap_or_else(|_| Arc::new(Tessera10Codec::new()))
}

/// Names of every registered codec, sorted.
pub fn available_codecs() -> Vec<String> {
    let mut names: Vec<String> = CODECS.read().keys().cloned().collect();
    names.sort();
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_file_names() {
        assert_eq!(segment_file_name("_0", "", "tim"), "_0.tim");
        assert_eq!(segment_file_name("_a", "3", "liv"), "_a_3.liv");
        assert_eq!(parse_segment_name("_a_3.liv"), Some("_a"));
        assert_eq!(parse_segment_name("_12.tim"), Some("_12"));
        assert_eq!(parse_segment_name("segments_2"), None);
    }

    #[test]
    fn test_registry_resolves_default() {
        let codec = for_name(DEFAULT_CODEC).unwrap();
        assert_eq!(codec.name(), "Tessera10");
        assert!(for_name("Unknown99").is_err());
        assert!(available_codecs().contains(&"Tessera10".to_string()));
    }

    #[test]
    fn test_write_state_tracks_files() {
        let storage: Arc<dyn Storage> = Arc::new(crate::storage::memory::MemoryStorage::default());
        let state = SegmentWriteState::new(
            storage.clone(),
            "_0",
            [0; 16],
            1,
            Arc::new(FieldInfos::default()),
        );
        let mut out = state.create_output("tim").unwrap();
        out.write_u8(1).unwrap();
        out.close().unwrap();
        assert!(state.created_files().contains("_0.tim"));
        state.delete_created_files();
        assert!(!storage.file_exists("_0.tim"));
    }
}
