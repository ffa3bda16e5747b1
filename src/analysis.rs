//! Text analysis collaborator.
//!
//! The index engine consumes analysis purely through [`Analyzer`], which
//! turns a field's text into a stream of [`Token`]s carrying the term text,
//! a position increment, character offsets and an optional payload.

pub mod analyzer;
pub mod token;

pub use analyzer::{
    Analyzer, KeywordAnalyzer, PerFieldAnalyzer, StandardAnalyzer, WhitespaceAnalyzer,
};
pub use token::{Token, TokenStream};
