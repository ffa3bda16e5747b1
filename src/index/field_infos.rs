//! Per-segment field metadata and the writer-wide field registry.
//!
//! Every field name maps to one stable field number for the lifetime of an
//! index. [`FieldNumbers`] hands those numbers out and rejects documents that
//! try to change how an existing field is indexed.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TesseraError};

/// What is recorded in the postings of a field.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub enum IndexOptions {
    /// Not inverted.
    #[default]
    None,
    /// Doc ids only.
    Docs,
    /// Doc ids and term frequencies.
    DocsAndFreqs,
    /// Doc ids, frequencies and positions.
    DocsAndFreqsAndPositions,
    /// Doc ids, frequencies, positions and offsets.
    DocsAndFreqsAndPositionsAndOffsets,
}

impl IndexOptions {
    /// True when the field is inverted.
    pub fn is_indexed(self) -> bool {
        self != IndexOptions::None
    }

    /// True when term frequencies are recorded.
    pub fn has_freqs(self) -> bool {
        self >= IndexOptions::DocsAndFreqs
    }

    /// True when positions are recorded.
    pub fn has_positions(self) -> bool {
        self >= IndexOptions::DocsAndFreqsAndPositions
    }

    /// True when offsets are recorded.
    pub fn has_offsets(self) -> bool {
        self == IndexOptions::DocsAndFreqsAndPositionsAndOffsets
    }

    pub(crate) fn to_u8(self) -> u8 {
        self as u8
    }

    pub(crate) fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => IndexOptions::None,
            1 => IndexOptions::Docs,
            2 => IndexOptions::DocsAndFreqs,
            3 => IndexOptions::DocsAndFreqsAndPositions,
            4 => IndexOptions::DocsAndFreqsAndPositionsAndOffsets,
            _ => return None,
        })
    }
}

/// Column type of a doc values field.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize,
)]
pub enum DocValuesType {
    /// No doc values.
    #[default]
    None,
    /// One i64 per document.
    Numeric,
    /// One byte string per document.
    Binary,
    /// One deduplicated, ordered byte string per document.
    Sorted,
    /// A set of deduplicated, ordered byte strings per document.
    SortedSet,
}

impl DocValuesType {
    pub(crate) fn to_u8(self) -> u8 {
        self as u8
    }

    pub(crate) fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => DocValuesType::None,
            1 => DocValuesType::Numeric,
            2 => DocValuesType::Binary,
            3 => DocValuesType::Sorted,
            4 => DocValuesType::SortedSet,
            _ => return None,
        })
    }
}

/// Component encoding of a vector field.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize,
)]
pub enum VectorEncoding {
    #[default]
    Float32,
    Byte,
}

/// How two vectors are compared. Higher scores are more similar.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize,
)]
pub enum VectorSimilarity {
    /// `1 / (1 + squared distance)`.
    #[default]
    Euclidean,
    /// Raw dot product.
    DotProduct,
    /// Cosine of the angle.
    Cosine,
}

impl VectorSimilarity {
    /// Similarity score of two equally sized vectors.
    pub fn score(self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            VectorSimilarity::Euclidean => {
                let dist: f32 = a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum();
                1.0 / (1.0 + dist)
            }
            VectorSimilarity::DotProduct => a.iter().zip(b).map(|(x, y)| x * y).sum(),
            VectorSimilarity::Cosine => {
                let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
                let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
                let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
                if na == 0.0 || nb == 0.0 {
                    0.0
                } else {
                    dot / (na * nb)
                }
            }
        }
    }

    pub(crate) fn to_u8(self) -> u8 {
        self as u8
    }

    pub(crate) fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => VectorSimilarity::Euclidean,
            1 => VectorSimilarity::DotProduct,
            2 => VectorSimilarity::Cosine,
            _ => return None,
        })
    }
}

/// Metadata of one field within a segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldInfo {
    pub name: String,
    pub number: u32,
    pub index_options: IndexOptions,
    pub store_payloads: bool,
    pub doc_values_type: DocValuesType,
    /// Zero when the field has no vectors.
    pub vector_dimension: u32,
    pub vector_encoding: VectorEncoding,
    pub vector_similarity: VectorSimilarity,
}

impl FieldInfo {
    /// A field with nothing enabled yet.
    pub fn new<S: Into<String>>(name: S, number: u32) -> Self {
        FieldInfo {
            name: name.into(),
            number,
            index_options: IndexOptions::None,
            store_payloads: false,
            doc_values_type: DocValuesType::None,
            vector_dimension: 0,
            vector_encoding: VectorEncoding::Float32,
            vector_similarity: VectorSimilarity::Euclidean,
        }
    }

    /// True when the field has vectors.
    pub fn has_vectors(&self) -> bool {
        self.vector_dimension > 0
    }

    /// Fold `other` (same field, possibly more features) into this one.
    pub(crate) fn merge_from(&mut self, other: &FieldInfo) {
        if other.index_options > self.index_options {
            self.index_options = other.index_options;
        }
        self.store_payloads |= other.store_payloads;
        if self.doc_values_type == DocValuesType::None {
            self.doc_values_type = other.doc_values_type;
        }
        if self.vector_dimension == 0 && other.vector_dimension > 0 {
            self.vector_dimension = other.vector_dimension;
            self.vector_encoding = other.vector_encoding;
            self.vector_similarity = other.vector_similarity;
        }
    }
}

/// The fields of one segment, ordered by field number.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct FieldInfos {
    fields: Vec<FieldInfo>,
    by_name: HashMap<String, usize>,
}

impl FieldInfos {
    /// Build from a list of infos; duplicate names keep the first entry.
    pub fn new(mut fields: Vec<FieldInfo>) -> Self {
        fields.sort_by_key(|f| f.number);
        let mut by_name = HashMap::with_capacity(fields.len());
        let mut unique = Vec::with_capacity(fields.len());
        for info in fields {
            if !by_name.contains_key(&info.name) {
                by_name.insert(info.name.clone(), unique.len());
                unique.push(info);
            }
        }
        FieldInfos {
            fields: unique,
            by_name,
        }
    }

    /// Look a field up by name.
    pub fn field(&self, name: &str) -> Option<&FieldInfo> {
        self.by_name.get(name).map(|&i| &self.fields[i])
    }

    /// Look a field up by number.
    pub fn field_by_number(&self, number: u32) -> Option<&FieldInfo> {
        self.fields
            .binary_search_by_key(&number, |f| f.number)
            .ok()
            .map(|i| &self.fields[i])
    }

    /// Iterate fields in number order.
    pub fn iter(&self) -> impl Iterator<Item = &FieldInfo> {
        self.fields.iter()
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// True when there are no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// True when any field is inverted.
    pub fn has_postings(&self) -> bool {
        self.fields.iter().any(|f| f.index_options.is_indexed())
    }

    /// True when any field has doc values.
    pub fn has_doc_values(&self) -> bool {
        self.fields
            .iter()
            .any(|f| f.doc_values_type != DocValuesType::None)
    }

    /// True when any field has vectors.
    pub fn has_vectors(&self) -> bool {
        self.fields.iter().any(|f| f.has_vectors())
    }

    /// Union of several segments' field infos.
    pub fn union<'a, I: IntoIterator<Item = &'a FieldInfos>>(all: I) -> FieldInfos {
        let mut merged: BTreeMap<u32, FieldInfo> = BTreeMap::new();
        for infos in all {
            for info in infos.iter() {
                merged
                    .entry(info.number)
                    .and_modify(|existing| existing.merge_from(info))
                    .or_insert_with(|| info.clone());
            }
        }
        FieldInfos::new(merged.into_values().collect())
    }
}

impl fmt::Debug for FieldInfos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.fields.iter()).finish()
    }
}

/// What a document asks of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FieldRequirements {
    pub index_options: IndexOptions,
    pub store_payloads: bool,
    pub doc_values_type: DocValuesType,
    pub vector_dimension: u32,
    pub vector_encoding: VectorEncoding,
    pub vector_similarity: VectorSimilarity,
}

/// Writer-wide registry assigning stable field numbers.
#[derive(Debug, Default)]
pub struct FieldNumbers {
    inner: Mutex<FieldNumbersInner>,
}

#[derive(Debug, Default)]
struct FieldNumbersInner {
    by_name: HashMap<String, FieldInfo>,
    next_number: u32,
}

impl FieldNumbers {
    /// Create an empty registry.
    pub fn new() -> Self {
        FieldNumbers::default()
    }

    /// Seed the registry from existing segments.
    pub fn from_segments<'a, I: IntoIterator<Item = &'a FieldInfos>>(all: I) -> Result<Self> {
        let numbers = FieldNumbers::new();
        {
            let mut inner = numbers.inner.lock();
            for infos in all {
                for info in infos.iter() {
                    match inner.by_name.get_mut(&info.name) {
                        Some(existing) if existing.number != info.number => {
                            return Err(TesseraError::corruption(
                                "field infos",
                                format!(
                                    "field '{}' has numbers {} and {}",
                                    info.name, existing.number, info.number
                                ),
                            ));
                        }
                        Some(existing) => existing.merge_from(info),
                        None => {
                            inner.next_number = inner.next_number.max(info.number + 1);
                            inner.by_name.insert(info.name.clone(), info.clone());
                        }
                    }
                }
            }
        }
        Ok(numbers)
    }

    /// Register `name` with the given requirements, returning its merged info.
    ///
    /// Fails if the requirements conflict with how the field was indexed before.
    pub fn register(&self, name: &str, req: &FieldRequirements) -> Result<FieldInfo> {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.by_name.get_mut(name) {
            check_compatible(existing, req)?;
            apply_requirements(existing, req);
            return Ok(existing.clone());
        }
        let mut info = FieldInfo::new(name, inner.next_number);
        inner.next_number += 1;
        apply_requirements(&mut info, req);
        inner.by_name.insert(name.to_string(), info.clone());
        Ok(info)
    }

    /// Current info for `name`, if registered.
    pub fn get(&self, name: &str) -> Option<FieldInfo> {
        self.inner.lock().by_name.get(name).cloned()
    }

    /// Number of registered fields.
    pub fn len(&self) -> usize {
        self.inner.lock().by_name.len()
    }

    /// True when no field was registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn check_compatible(existing: &FieldInfo, req: &FieldRequirements) -> Result<()> {
    if existing.index_options.is_indexed()
        && req.index_options.is_indexed()
        && existing.index_options != req.index_options
    {
        return Err(TesseraError::illegal_argument(format!(
            "cannot change index options from {:?} to {:?} for field '{}'",
            existing.index_options, req.index_options, existing.name
        )));
    }
    if existing.doc_values_type != DocValuesType::None
        && req.doc_values_type != DocValuesType::None
        && existing.doc_values_type != req.doc_values_type
    {
        return Err(TesseraError::illegal_argument(format!(
            "cannot change doc values type from {:?} to {:?} for field '{}'",
            existing.doc_values_type, req.doc_values_type, existing.name
        )));
    }
    if existing.vector_dimension > 0
        && req.vector_dimension > 0
        && (existing.vector_dimension != req.vector_dimension
            || existing.vector_encoding != req.vector_encoding
            || existing.vector_similarity != req.vector_similarity)
    {
        return Err(TesseraError::illegal_argument(format!(
            "cannot change vector schema of field '{}' from {}x{:?}/{:?} to {}x{:?}/{:?}",
            existing.name,
            existing.vector_dimension,
            existing.vector_encoding,
            existing.vector_similarity,
            req.vector_dimension,
            req.vector_encoding,
            req.vector_similarity
        )));
    }
    Ok(())
}

fn apply_requirements(info: &mut FieldInfo, req: &FieldRequirements) {
    if req.index_options.is_indexed() {
        info.index_options = req.index_options;
    }
    info.store_payloads |= req.store_payloads;
    if req.doc_values_type != DocValuesType::None {
        info.doc_values_type = req.doc_values_type;
    }
    if req.vector_dimension > 0 {
        info.vector_dimension = req.vector_dimension;
        info.vector_encoding = req.vector_encoding;
        info.vector_similarity = req.vector_similarity;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text() -> FieldRequirements {
        FieldRequirements {
            index_options: IndexOptions::DocsAndFreqsAndPositionsAndOffsets,
            ..Default::default()
        }
    }

    #[test]
    fn test_numbers_are_stable() {
        let numbers = FieldNumbers::new();
        let a = numbers.register("a", &text()).unwrap();
        let b = numbers.register("b", &text()).unwrap();
        let a2 = numbers.register("a", &text()).unwrap();
        assert_eq!(a.number, 0);
        assert_eq!(b.number, 1);
        assert_eq!(a2.number, 0);
        assert_eq!(numbers.len(), 2);
    }

    #[test]
    fn test_conflicting_index_options_rejected() {
        let numbers = FieldNumbers::new();
        numbers.register("id", &text()).unwrap();
        let keyword = FieldRequirements {
            index_options: IndexOptions::Docs,
            ..Default::default()
        };
        let err = numbers.register("id", &keyword).unwrap_err();
        assert!(matches!(err, TesseraError::IllegalArgument(_)));
    }

    #[test]
    fn test_doc_values_added_to_indexed_field() {
        let numbers = FieldNumbers::new();
        numbers.register("price", &text()).unwrap();
        let dv = FieldRequirements {
            doc_values_type: DocValuesType::Numeric,
            ..Default::default()
        };
        let info = numbers.register("price", &dv).unwrap();
        assert_eq!(info.doc_values_type, DocValuesType::Numeric);
        assert!(info.index_options.has_offsets());

        let binary = FieldRequirements {
            doc_values_type: DocValuesType::Binary,
            ..Default::default()
        };
        assert!(numbers.register("price", &binary).is_err());
    }

    #[test]
    fn test_vector_dimension_conflict() {
        let numbers = FieldNumbers::new();
        let v4 = FieldRequirements {
            vector_dimension: 4,
            ..Default::default()
        };
        let v8 = FieldRequirements {
            vector_dimension: 8,
            ..Default::default()
        };
        numbers.register("emb", &v4).unwrap();
        assert!(numbers.register("emb", &v8).is_err());
    }

    #[test]
    fn test_field_infos_lookup_and_union() {
        let mut a = FieldInfo::new("a", 0);
        a.index_options = IndexOptions::Docs;
        let mut b = FieldInfo::new("b", 1);
        b.doc_values_type = DocValuesType::Numeric;
        let first = FieldInfos::new(vec![b.clone(), a.clone()]);
        assert_eq!(first.iter().next().unwrap().name, "a");
        assert_eq!(first.field_by_number(1).unwrap().name, "b");
        assert!(first.has_postings());
        assert!(first.has_doc_values());
        assert!(!first.has_vectors());

        let mut c = FieldInfo::new("c", 2);
        c.vector_dimension = 3;
        let second = FieldInfos::new(vec![a, c]);
        let union = FieldInfos::union([&first, &second]);
        assert_eq!(union.len(), 3);
        assert!(union.has_vectors());
    }

    #[test]
    fn test_similarity_scores() {
        let a = [1.0, 0.0];
        let b = [0.0, 1.0];
        assert_eq!(VectorSimilarity::Euclidean.score(&a, &a), 1.0);
        assert_eq!(VectorSimilarity::DotProduct.score(&a, &b), 0.0);
        assert!((VectorSimilarity::Cosine.score(&a, &[2.0, 0.0]) - 1.0).abs() < 1e-6);
    }
}
