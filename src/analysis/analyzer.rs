//! Analyzer implementations.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use unicode_segmentation::UnicodeSegmentation;

use crate::analysis::token::{Token, TokenStream};
use crate::error::Result;

/// Turns field text into a token stream.
pub trait Analyzer: Send + Sync + Debug {
    /// Analyze `text` of `field`.
    fn token_stream<'a>(&self, field: &str, text: &'a str) -> Result<TokenStream<'a>>;

    /// Get the name of this analyzer.
    fn name(&self) -> &'static str;
}

/// Unicode word segmentation followed by lowercasing.
#[derive(Debug, Clone, Default)]
pub struct StandardAnalyzer;

impl Analyzer for StandardAnalyzer {
    fn token_stream<'a>(&self, _field: &str, text: &'a str) -> Result<TokenStream<'a>> {
        Ok(Box::new(text.unicode_word_indices().map(|(start, word)| {
            Ok(Token::with_offsets(
                word.to_lowercase(),
                start,
                start + word.len(),
            ))
        })))
    }

    fn name(&self) -> &'static str {
        "standard"
    }
}

/// Splits on whitespace, keeping case.
#[derive(Debug, Clone, Default)]
pub struct WhitespaceAnalyzer;

impl Analyzer for WhitespaceAnalyzer {
    fn token_stream<'a>(&self, _field: &str, text: &'a str) -> Result<TokenStream<'a>> {
        let base = text.as_ptr() as usize;
        Ok(Box::new(text.split_whitespace().map(move |word| {
            let start = word.as_ptr() as usize - base;
            Ok(Token::with_offsets(word, start, start + word.len()))
        })))
    }

    fn name(&self) -> &'static str {
        "whitespace"
    }
}

/// Emits the whole input as one token.
#[derive(Debug, Clone, Default)]
pub struct KeywordAnalyzer;

impl Analyzer for KeywordAnalyzer {
    fn token_stream<'a>(&self, _field: &str, text: &'a str) -> Result<TokenStream<'a>> {
        Ok(Box::new(std::iter::once(Ok(Token::with_offsets(
            text,
            0,
            text.len(),
        )))))
    }

    fn name(&self) -> &'static str {
        "keyword"
    }
}

/// Dispatches to a per-field analyzer, falling back to a default.
#[derive(Debug, Clone)]
pub struct PerFieldAnalyzer {
    default: Arc<dyn Analyzer>,
    fields: HashMap<String, Arc<dyn Analyzer>>,
}

impl PerFieldAnalyzer {
    /// Create a per-field analyzer with the given default.
    pub fn new(default: Arc<dyn Analyzer>) -> Self {
        PerFieldAnalyzer {
            default,
            fields: HashMap::new(),
        }
    }

    /// Use `analyzer` for `field`.
    pub fn add_field<S: Into<String>>(mut self, field: S, analyzer: Arc<dyn Analyzer>) -> Self {
        self.fields.insert(field.into(), analyzer);
        self
    }
}

impl Analyzer for PerFieldAnalyzer {
    fn token_stream<'a>(&self, field: &str, text: &'a str) -> Result<TokenStream<'a>> {
        self.fields
            .get(field)
            .unwrap_or(&self.default)
            .token_stream(field, text)
    }

    fn name(&self) -> &'static str {
        "per_field"
    }
}
