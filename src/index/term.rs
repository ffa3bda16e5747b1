//! A term: the unit of indexing and of delete-by-term.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A field name paired with raw term bytes.
///
/// Terms order by field, then by unsigned bytes.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Term {
    pub field: String,
    pub bytes: Vec<u8>,
}

impl Term {
    /// A term from UTF-8 text.
    pub fn new<F: Into<String>, T: AsRef<str>>(field: F, text: T) -> Self {
        Term {
            field: field.into(),
            bytes: text.as_ref().as_bytes().to_vec(),
        }
    }

    /// A term from raw bytes.
    pub fn from_bytes<F: Into<String>>(field: F, bytes: Vec<u8>) -> Self {
        Term {
            field: field.into(),
            bytes,
        }
    }

    /// Term text, lossily decoded.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

impl fmt::Debug for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.field, self.text())
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.field, self.text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_term_order() {
        let a = Term::new("body", "apple");
        let b = Term::new("body", "banana");
        let c = Term::new("id", "0");
        assert!(a < b);
        assert!(b < c);
        assert_eq!(a.to_string(), "body:apple");
        assert_eq!(Term::from_bytes("f", vec![0xff]).bytes, vec![0xff]);
    }
}
