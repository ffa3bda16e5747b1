//! Field values and the index features they require.

use serde::{Deserialize, Serialize};

use crate::analysis::token::Token;
use crate::index::field_infos::{DocValuesType, IndexOptions, VectorEncoding, VectorSimilarity};

/// A value kept verbatim in the stored fields of a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StoredValue {
    /// UTF-8 text.
    Text(String),
    /// 64-bit signed integer.
    Long(i64),
    /// 64-bit float.
    Double(f64),
    /// Arbitrary bytes.
    Bytes(Vec<u8>),
}

impl StoredValue {
    /// Get the text value, if this is text.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            StoredValue::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Get the integer value, if this is an integer.
    pub fn as_long(&self) -> Option<i64> {
        match self {
            StoredValue::Long(value) => Some(*value),
            _ => None,
        }
    }
}

/// A dense vector value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum VectorValue {
    /// 32-bit float components.
    Float(Vec<f32>),
    /// Signed byte components.
    Byte(Vec<i8>),
}

impl VectorValue {
    /// Number of dimensions.
    pub fn dimension(&self) -> usize {
        match self {
            VectorValue::Float(v) => v.len(),
            VectorValue::Byte(v) => v.len(),
        }
    }

    /// Component encoding.
    pub fn encoding(&self) -> VectorEncoding {
        match self {
            VectorValue::Float(_) => VectorEncoding::Float32,
            VectorValue::Byte(_) => VectorEncoding::Byte,
        }
    }

    /// Components widened to f32.
    pub fn to_f32(&self) -> Vec<f32> {
        match self {
            VectorValue::Float(v) => v.clone(),
            VectorValue::Byte(v) => v.iter().map(|&b| b as f32).collect(),
        }
    }
}

/// The value carried by a [`Field`].
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// Analyzed text indexed with positions and offsets.
    Text { text: String, stored: bool },

    /// A single untokenized term, indexed with doc ids only.
    Keyword { value: String, stored: bool },

    /// Pre-analyzed tokens indexed with positions, offsets and payloads.
    Tokens(Vec<Token>),

    /// A stored-only value.
    Stored(StoredValue),

    /// Numeric doc value.
    NumericDocValue(i64),

    /// Binary doc value.
    BinaryDocValue(Vec<u8>),

    /// Sorted (deduplicated) binary doc value.
    SortedDocValue(Vec<u8>),

    /// Multi-valued sorted binary doc value.
    SortedSetDocValue(Vec<Vec<u8>>),

    /// Dense vector with the similarity used to compare it.
    Vector {
        value: VectorValue,
        similarity: VectorSimilarity,
    },
}

/// A named field of a document.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    /// Field name.
    pub name: String,
    /// Field value.
    pub value: FieldValue,
}

impl Field {
    /// Create a field.
    pub fn new<S: Into<String>>(name: S, value: FieldValue) -> Self {
        Field {
            name: name.into(),
            value,
        }
    }

    /// Index options this value requires, `None` when not inverted.
    pub fn index_options(&self) -> IndexOptions {
        match &self.value {
            FieldValue::Text { .. } => IndexOptions::DocsAndFreqsAndPositionsAndOffsets,
            FieldValue::Tokens(_) => IndexOptions::DocsAndFreqsAndPositionsAndOffsets,
            FieldValue::Keyword { .. } => IndexOptions::Docs,
            _ => IndexOptions::None,
        }
    }

    /// Doc values type this value requires.
    pub fn doc_values_type(&self) -> DocValuesType {
        match &self.value {
            FieldValue::NumericDocValue(_) => DocValuesType::Numeric,
            FieldValue::BinaryDocValue(_) => DocValuesType::Binary,
            FieldValue::SortedDocValue(_) => DocValuesType::Sorted,
            FieldValue::SortedSetDocValue(_) => DocValuesType::SortedSet,
            _ => DocValuesType::None,
        }
    }

    /// True when pre-analyzed tokens carry payloads.
    pub fn has_payloads(&self) -> bool {
        match &self.value {
            FieldValue::Tokens(tokens) => tokens.iter().any(|t| t.payload.is_some()),
            _ => false,
        }
    }

    /// The value to keep in stored fields, if any.
    pub fn stored_value(&self) -> Option<StoredValue> {
        match &self.value {
            FieldValue::Text { text, stored: true } => Some(StoredValue::Text(text.clone())),
            FieldValue::Keyword {
                value,
                stored: true,
            } => Some(StoredValue::Text(value.clone())),
            FieldValue::Stored(value) => Some(value.clone()),
            _ => None,
        }
    }
}
