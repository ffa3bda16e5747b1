//! Document structure.

use crate::analysis::token::Token;
use crate::document::field::{Field, FieldValue, StoredValue, VectorValue};
use crate::index::field_infos::VectorSimilarity;

/// A document represents a single item to be indexed.
///
/// Analyzers are configured on the writer, not per document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Document {
    fields: Vec<Field>,
}

impl Document {
    /// Create a new empty document.
    pub fn new() -> Self {
        Document { fields: Vec::new() }
    }

    /// Add a field.
    pub fn add(&mut self, field: Field) {
        self.fields.push(field);
    }

    /// Add a field value under `name`.
    pub fn add_field<S: Into<String>>(&mut self, name: S, value: FieldValue) {
        self.fields.push(Field::new(name, value));
    }

    /// All fields, in insertion order.
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// First field with the given name.
    pub fn get_field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Number of field values.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// True when the document has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Start building a document.
    pub fn builder() -> DocumentBuilder {
        DocumentBuilder::new()
    }
}

/// Builder for creating documents fluently.
#[derive(Debug, Default)]
pub struct DocumentBuilder {
    document: Document,
}

impl DocumentBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        DocumentBuilder {
            document: Document::new(),
        }
    }

    /// Add analyzed, stored text.
    pub fn add_text<S: Into<String>, T: Into<String>>(mut self, name: S, text: T) -> Self {
        self.document.add_field(
            name,
            FieldValue::Text {
                text: text.into(),
                stored: true,
            },
        );
        self
    }

    /// Add analyzed text that is not stored.
    pub fn add_text_unstored<S: Into<String>, T: Into<String>>(mut self, name: S, text: T) -> Self {
        self.document.add_field(
            name,
            FieldValue::Text {
                text: text.into(),
                stored: false,
            },
        );
        self
    }

    /// Add a stored, untokenized keyword.
    pub fn add_keyword<S: Into<String>, T: Into<String>>(mut self, name: S, value: T) -> Self {
        self.document.add_field(
            name,
            FieldValue::Keyword {
                value: value.into(),
                stored: true,
            },
        );
        self
    }

    /// Add pre-analyzed tokens.
    pub fn add_tokens<S: Into<String>>(mut self, name: S, tokens: Vec<Token>) -> Self {
        self.document.add_field(name, FieldValue::Tokens(tokens));
        self
    }

    /// Add a stored-only value.
    pub fn add_stored<S: Into<String>>(mut self, name: S, value: StoredValue) -> Self {
        self.document.add_field(name, FieldValue::Stored(value));
        self
    }

    /// Add a numeric doc value.
    pub fn add_numeric<S: Into<String>>(mut self, name: S, value: i64) -> Self {
        self.document
            .add_field(name, FieldValue::NumericDocValue(value));
        self
    }

    /// Add a binary doc value.
    pub fn add_binary<S: Into<String>>(mut self, name: S, value: Vec<u8>) -> Self {
        self.document.add_field(name, FieldValue::BinaryDocValue(value));
        self
    }

    /// Add a sorted doc value.
    pub fn add_sorted<S: Into<String>>(mut self, name: S, value: Vec<u8>) -> Self {
        self.document.add_field(name, FieldValue::SortedDocValue(value));
        self
    }

    /// Add a sorted-set doc value.
    pub fn add_sorted_set<S: Into<String>>(mut self, name: S, values: Vec<Vec<u8>>) -> Self {
        self.document
            .add_field(name, FieldValue::SortedSetDocValue(values));
        self
    }

    /// Add a float vector.
    pub fn add_float_vector<S: Into<String>>(
        mut self,
        name: S,
        vector: Vec<f32>,
        similarity: VectorSimilarity,
    ) -> Self {
        self.document.add_field(
            name,
            FieldValue::Vector {
                value: VectorValue::Float(vector),
                similarity,
            },
        );
        self
    }

    /// Add a byte vector.
    pub fn add_byte_vector<S: Into<String>>(
        mut self,
        name: S,
        vector: Vec<i8>,
        similarity: VectorSimilarity,
    ) -> Self {
        self.document.add_field(
            name,
            FieldValue::Vector {
                value: VectorValue::Byte(vector),
                similarity,
            },
        );
        self
    }

    /// Add an arbitrary field value.
    pub fn add_field<S: Into<String>>(mut self, name: S, value: FieldValue) -> Self {
        self.document.add_field(name, value);
        self
    }

    /// Build the document.
    pub fn build(self) -> Document {
        self.document
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let doc = Document::builder()
            .add_keyword("id", "1")
            .add_text("body", "hello world")
            .add_text("body", "second value")
            .add_numeric("price", 42)
            .build();

        assert_eq!(doc.len(), 4);
        assert_eq!(doc.get_field("id").unwrap().stored_value(), Some(StoredValue::Text("1".into())));
        assert_eq!(doc.fields().iter().filter(|f| f.name == "body").count(), 2);
        assert!(doc.get_field("price").unwrap().stored_value().is_none());
    }
}
