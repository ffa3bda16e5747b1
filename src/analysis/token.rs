//! Token types produced by analyzers.
//!
//! # Examples
//!
//! ```
//! use tessera::analysis::token::Token;
//!
//! let token = Token::with_offsets("world", 6, 11).with_payload(vec![1]);
//! assert_eq!(token.text, "world");
//! assert_eq!(token.position_increment, 1);
//! assert_eq!(token.payload.as_deref(), Some(&[1u8][..]));
//! ```

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A single analyzed token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    /// The term text.
    pub text: String,

    /// Distance from the previous token's position; 0 stacks tokens.
    pub position_increment: u32,

    /// Start offset in the original text.
    pub start_offset: usize,

    /// End offset in the original text (exclusive).
    pub end_offset: usize,

    /// Optional per-position payload.
    #[serde(default)]
    pub payload: Option<Vec<u8>>,
}

impl Token {
    /// Create a token with no offsets.
    pub fn new<S: Into<String>>(text: S) -> Self {
        Token {
            text: text.into(),
            position_increment: 1,
            start_offset: 0,
            end_offset: 0,
            payload: None,
        }
    }

    /// Create a token with offsets.
    pub fn with_offsets<S: Into<String>>(text: S, start_offset: usize, end_offset: usize) -> Self {
        Token {
            start_offset,
            end_offset,
            ..Token::new(text)
        }
    }

    /// Set the position increment.
    pub fn with_position_increment(mut self, increment: u32) -> Self {
        self.position_increment = increment;
        self
    }

    /// Attach a payload.
    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// A lazily produced sequence of tokens; an `Err` item aborts analysis.
pub type TokenStream<'a> = Box<dyn Iterator<Item = Result<Token>> + Send + 'a>;
