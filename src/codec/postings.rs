//! Block-tree terms dictionary and block postings.
//!
//! Four files per segment:
//!
//! - `.tim` holds term blocks. Each block stores the shared prefix of its
//!   terms once, then per term the suffix, doc freq, total term freq and the
//!   file pointers of its postings.
//! - `.tip` holds, per field, the statistics of the field and the
//!   front-coded first term of every block with the block's file pointer.
//!   Seeking binary-searches these floor keys, then one decoded block.
//! - `.doc` holds doc deltas (freq folded in) and, after every term with
//!   more than [`BLOCK_SIZE`] docs, a skip table used by `advance`.
//! - `.pos` holds position deltas, payloads and offsets.

use std::fmt;
use std::sync::Arc;

use crate::codec::{
    FieldsConsumer, FieldsProducer, PostingsFormat, SegmentReadState, SegmentWriteState,
};
use crate::error::Result;
use crate::index::field_infos::IndexOptions;

mod reader;
mod writer;

pub use self::reader::BlockTreeFieldsProducer;
pub use self::writer::BlockTreeTermsWriter;

/// Doc id returned once a postings enum is exhausted.
pub const NO_MORE_DOCS: u32 = u32::MAX;

/// Docs per postings block; also the skip interval.
pub const BLOCK_SIZE: u32 = 128;

/// Smallest block the terms writer aims for.
pub const MIN_TERMS_IN_BLOCK: usize = 25;

/// Largest block the terms writer emits.
pub const MAX_TERMS_IN_BLOCK: usize = 48;

pub(crate) const TERMS_CODEC: &str = "BlockTreeTermsDict";
pub(crate) const TERMS_INDEX_CODEC: &str = "BlockTreeTermsIndex";
pub(crate) const DOC_CODEC: &str = "BlockTreePostingsDoc";
pub(crate) const POS_CODEC: &str = "BlockTreePostingsPos";
pub(crate) const VERSION_START: u32 = 0;
pub(crate) const VERSION_CURRENT: u32 = 0;

/// Statistics of one written term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TermStats {
    pub doc_freq: u32,
    pub total_term_freq: u64,
}

/// Dictionary metadata of one term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct TermMeta {
    pub doc_freq: u32,
    pub total_term_freq: u64,
    pub doc_fp: u64,
    pub pos_fp: u64,
    /// Offset of the skip table from `doc_fp`, 0 when there is none.
    pub skip_offset: u64,
}

/// Outcome of [`TermsEnum::seek_ceil`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekStatus {
    /// The exact term was found.
    Found,
    /// Positioned on the smallest term greater than the target.
    NotFound,
    /// No term is greater than or equal to the target.
    End,
}

/// Iterates the postings of one term in increasing doc id order.
///
/// `doc()` is 0 before the first call to `next_doc` or `advance`.
pub trait PostingsEnum: Send {
    /// Current doc id, [`NO_MORE_DOCS`] once exhausted.
    fn doc(&self) -> u32;

    /// Move to the next doc.
    fn next_doc(&mut self) -> Result<u32>;

    /// Move to the first doc `>= target`. `target` must exceed `doc()`.
    fn advance(&mut self, target: u32) -> Result<u32> {
        loop {
            let doc = self.next_doc()?;
            if doc >= target {
                return Ok(doc);
            }
        }
    }

    /// Term frequency in the current doc, 1 when freqs are not indexed.
    fn freq(&self) -> u32;

    /// Next position in the current doc; call at most `freq()` times.
    fn next_position(&mut self) -> Result<u32>;

    /// Offsets of the last position read, if indexed.
    fn offsets(&self) -> Option<(u32, u32)>;

    /// Payload of the last position read, if any.
    fn payload(&self) -> Option<&[u8]>;

    /// Upper bound of the docs this enum visits.
    fn cost(&self) -> u64;
}

/// Ordered access to the terms of one field.
pub trait TermsEnum: Send {
    /// Move to the next term; false once exhausted.
    fn next(&mut self) -> Result<bool>;

    /// Position on `term` if it exists.
    fn seek_exact(&mut self, term: &[u8]) -> Result<bool>;

    /// Position on the smallest term `>= term`.
    fn seek_ceil(&mut self, term: &[u8]) -> Result<SeekStatus>;

    /// Current term bytes.
    fn term(&self) -> &[u8];

    /// Docs containing the current term.
    fn doc_freq(&self) -> u32;

    /// Occurrences of the current term.
    fn total_term_freq(&self) -> u64;

    /// Postings of the current term.
    fn postings(&self) -> Result<Box<dyn PostingsEnum>>;
}

/// The terms of one field of a segment.
pub trait Terms: Send + Sync + fmt::Debug {
    fn iterator(&self) -> Result<Box<dyn TermsEnum>>;
    /// Number of distinct terms.
    fn size(&self) -> u64;
    fn sum_doc_freq(&self) -> u64;
    fn sum_total_term_freq(&self) -> u64;
    /// Docs with at least one term in this field.
    fn doc_count(&self) -> u32;
    fn min_term(&self) -> Option<&[u8]>;
    fn max_term(&self) -> Option<&[u8]>;
    fn index_options(&self) -> IndexOptions;
    fn has_payloads(&self) -> bool;
}

/// The default postings format.
#[derive(Debug, Default)]
pub struct BlockTreePostingsFormat;

impl PostingsFormat for BlockTreePostingsFormat {
    fn name(&self) -> &str {
        "BlockTree10"
    }

    fn fields_consumer(&self, state: &SegmentWriteState) -> Result<Box<dyn FieldsConsumer>> {
        Ok(Box::new(BlockTreeTermsWriter::new(state)?))
    }

    fn fields_producer(&self, state: &SegmentReadState) -> Result<Arc<dyn FieldsProducer>> {
        Ok(Arc::new(BlockTreeFieldsProducer::open(state)?))
    }
}

/// Length of the common prefix of two byte strings.
pub(crate) fn shared_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

/// Sizes of the blocks a field with `pending` remaining terms is split into.
pub(crate) fn tail_block_sizes(pending: usize) -> Vec<usize> {
    match pending {
        0 => vec![],
        n if n <= MAX_TERMS_IN_BLOCK => vec![n],
        n => vec![n.div_ceil(2), n / 2],
    }
}

#[cfg(test)]
mod tests;
