//! Conversion from JSON objects to documents.
//!
//! Strings become analyzed stored text (or keywords for the listed fields),
//! integers become numeric doc values plus a stored long, other numbers a
//! stored double, booleans keywords, arrays of strings multi-valued text and
//! arrays of numbers float vectors compared by cosine similarity.

use serde_json::Value;

use crate::document::document::Document;
use crate::document::field::{FieldValue, StoredValue, VectorValue};
use crate::error::{Result, TesseraError};
use crate::index::field_infos::VectorSimilarity;

/// Convert a JSON object into a document.
pub fn document_from_json(value: &Value, keyword_fields: &[String]) -> Result<Document> {
    let object = value
        .as_object()
        .ok_or_else(|| TesseraError::illegal_argument("document must be a JSON object"))?;

    let mut doc = Document::new();
    for (name, value) in object {
        let keyword = keyword_fields.iter().any(|k| k == name);
        match value {
            Value::String(text) if keyword => doc.add_field(
                name.clone(),
                FieldValue::Keyword {
                    value: text.clone(),
                    stored: true,
                },
            ),
            Value::String(text) => doc.add_field(
                name.clone(),
                FieldValue::Text {
                    text: text.clone(),
                    stored: true,
                },
            ),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    doc.add_field(name.clone(), FieldValue::NumericDocValue(i));
                    doc.add_field(name.clone(), FieldValue::Stored(StoredValue::Long(i)));
                } else if let Some(f) = n.as_f64() {
                    doc.add_field(name.clone(), FieldValue::Stored(StoredValue::Double(f)));
                }
            }
            Value::Bool(b) => doc.add_field(
                name.clone(),
                FieldValue::Keyword {
                    value: b.to_string(),
                    stored: true,
                },
            ),
            Value::Array(items) if !items.is_empty() && items.iter().all(Value::is_number) => {
                let vector = items
                    .iter()
                    .map(|v| v.as_f64().unwrap_or_default() as f32)
                    .collect();
                doc.add_field(
                    name.clone(),
                    FieldValue::Vector {
                        value: VectorValue::Float(vector),
                        similarity: VectorSimilarity::Cosine,
                    },
                );
            }
            Value::Array(items) => {
                for item in items {
                    if let Value::String(text) = item {
                        doc.add_field(
                            name.clone(),
                            FieldValue::Text {
                                text: text.clone(),
                                stored: true,
                            },
                        );
                    }
                }
            }
            Value::Null | Value::Object(_) => {}
        }
    }
    Ok(doc)
}
