//! Documents and their fields.
//!
//! A [`Document`] is an ordered list of [`Field`]s. The same field name may
//! appear several times; the values are indexed in order and positions of a
//! text field continue across values.

pub mod document;
pub mod field;
pub mod json;

pub use document::{Document, DocumentBuilder};
pub use field::{Field, FieldValue, StoredValue, VectorValue};
