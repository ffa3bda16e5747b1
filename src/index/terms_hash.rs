//! In-memory postings of one per-thread document buffer.
//!
//! Terms are hashed per field number; each term owns a doc-ordered
//! postings buffer. At flush the fields are written in number order and the
//! terms of each field in unsigned byte order.

use ahash::AHashMap;

use crate::codec::{FieldsConsumer, NO_MORE_DOCS, PostingsEnum};
use crate::error::Result;
use crate::index::field_infos::FieldInfos;

/// One occurrence of a term in a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Occurrence {
    pub position: u32,
    pub start_offset: u32,
    pub end_offset: u32,
    pub payload: Option<Vec<u8>>,
}

const TERM_OVERHEAD: usize = 64;
const DOC_ENTRY_BYTES: usize = 8;
const OCCURRENCE_BYTES: usize = 16;

/// Postings of one term, in doc order.
#[derive(Debug, Default)]
struct PostingsBuffer {
    docs: Vec<u32>,
    freqs: Vec<u32>,
    /// Flat occurrences of every doc; empty when positions are not kept.
    occurrences: Vec<Occurrence>,
}

#[derive(Debug, Default)]
pub struct TermsHash {
    fields: AHashMap<u32, AHashMap<Vec<u8>, PostingsBuffer>>,
    bytes_used: usize,
}

impl TermsHash {
    pub fn new() -> Self {
        TermsHash::default()
    }

    /// Add the occurrences of `term` in `doc`; positions are kept only when
    /// `keep_positions` is set. Returns the bytes added.
    pub fn add(
        &mut self,
        field_number: u32,
        doc: u32,
        term: &[u8],
        occurrences: Vec<Occurrence>,
        keep_positions: bool,
    ) -> usize {
        let terms = self.fields.entry(field_number).or_default();
        let mut added = DOC_ENTRY_BYTES;
        if !terms.contains_key(term) {
            added += term.len() + TERM_OVERHEAD;
            terms.insert(term.to_vec(), PostingsBuffer::default());
        }
        let Some(buffer) = terms.get_mut(term) else {
            return 0;
        };
        buffer.docs.push(doc);
        buffer.freqs.push(occurrences.len().max(1) as u32);
        if keep_positions {
            added += occurrences
                .iter()
                .map(|o| OCCURRENCE_BYTES + o.payload.as_ref().map_or(0, Vec::len))
                .sum::<usize>();
            buffer.occurrences.extend(occurrences);
        }
        self.bytes_used += added;
        added
    }

    /// Estimated heap bytes held.
    pub fn bytes_used(&self) -> usize {
        self.bytes_used
    }

    /// Number of distinct terms of a field.
    pub fn num_terms(&self, field_number: u32) -> usize {
        self.fields.get(&field_number).map_or(0, |terms| terms.len())
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Write every buffered field through `consumer`.
    pub fn flush(&self, field_infos: &FieldInfos, consumer: &mut dyn FieldsConsumer) -> Result<()> {
        for info in field_infos.iter().filter(|f| f.index_options.is_indexed()) {
            consumer.start_field(info)?;
            if let Some(terms) = self.fields.get(&info.number) {
                let mut sorted: Vec<(&Vec<u8>, &PostingsBuffer)> = terms.iter().collect();
                sorted.sort_unstable_by(|a, b| a.0.cmp(b.0));
                for (term, buffer) in sorted {
                    let mut postings = BufferedPostingsEnum::new(buffer);
                    consumer.add_term(term, &mut postings)?;
                }
            }
            consumer.finish_field()?;
        }
        Ok(())
    }
}

/// Iterates one in-memory postings buffer.
struct BufferedPostingsEnum<'a> {
    buffer: &'a PostingsBuffer,
    index: Option<usize>,
    occ_start: usize,
    next_occ: usize,
}

impl<'a> BufferedPostingsEnum<'a> {
    fn new(buffer: &'a PostingsBuffer) -> Self {
        BufferedPostingsEnum {
            buffer,
            index: None,
            occ_start: 0,
            next_occ: 0,
        }
    }

    fn current_occurrence(&self) -> Option<&Occurrence> {
        if self.next_occ == 0 {
            return None;
        }
        self.buffer
            .occurrences
            .get(self.occ_start + self.next_occ - 1)
    }
}

impl PostingsEnum for BufferedPostingsEnum<'_> {
    fn doc(&self) -> u32 {
        match self.index {
            None => 0,
            Some(i) => self.buffer.docs.get(i).copied().unwrap_or(NO_MORE_DOCS),
        }
    }

    fn next_doc(&mut self) -> Result<u32> {
        let next = match self.index {
            None => 0,
            Some(i) => {
                if !self.buffer.occurrences.is_empty() {
                    self.occ_start += self.buffer.freqs.get(i).copied().unwrap_or(0) as usize;
                }
                i + 1
            }
        };
        self.index = Some(next.min(self.buffer.docs.len()));
        self.next_occ = 0;
        Ok(self.doc())
    }

    fn freq(&self) -> u32 {
        self.index
            .and_then(|i| self.buffer.freqs.get(i))
            .copied()
            .unwrap_or(0)
    }

    fn next_position(&mut self) -> Result<u32> {
        self.next_occ += 1;
        Ok(self.current_occurrence().map_or(0, |o| o.position))
    }

    fn offsets(&self) -> Option<(u32, u32)> {
        self.current_occurrence()
            .map(|o| (o.start_offset, o.end_offset))
    }

    fn payload(&self) -> Option<&[u8]> {
        self.current_occurrence().and_then(|o| o.payload.as_deref())
    }

    fn cost(&self) -> u64 {
        self.buffer.docs.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn occ(position: u32) -> Occurrence {
        Occurrence {
            position,
            start_offset: position * 2,
            end_offset: position * 2 + 1,
            payload: None,
        }
    }

    #[test]
    fn test_buffered_postings() {
        let mut hash = TermsHash::new();
        let before = hash.bytes_used();
        hash.add(0, 0, b"a", vec![occ(0), occ(3)], true);
        hash.add(0, 2, b"a", vec![occ(1)], true);
        hash.add(0, 2, b"b", vec![occ(0)], true);
        assert!(hash.bytes_used() > before);
        assert_eq!(hash.num_terms(0), 2);
        assert_eq!(hash.num_terms(9), 0);

        let buffer = &hash.fields[&0][&b"a"[..]];
        let mut postings = BufferedPostingsEnum::new(buffer);
        assert_eq!(postings.next_doc().unwrap(), 0);
        assert_eq!(postings.freq(), 2);
        assert_eq!(postings.next_position().unwrap(), 0);
        assert_eq!(postings.next_position().unwrap(), 3);
        assert_eq!(postings.offsets(), Some((6, 7)));
        assert_eq!(postings.next_doc().unwrap(), 2);
        assert_eq!(postings.freq(), 1);
        assert_eq!(postings.next_position().unwrap(), 1);
        assert_eq!(postings.next_doc().unwrap(), NO_MORE_DOCS);
    }

    #[test]
    fn test_positions_skipped_without_reading() {
        let mut hash = TermsHash::new();
        hash.add(1, 0, b"x", vec![occ(0), occ(1)], true);
        hash.add(1, 1, b"x", vec![occ(5)], true);
        let buffer = &hash.fields[&1][&b"x"[..]];
        let mut postings = BufferedPostingsEnum::new(buffer);
        postings.next_doc().unwrap();
        postings.next_doc().unwrap();
        assert_eq!(postings.next_position().unwrap(), 5);
    }

    #[test]
    fn test_docs_only() {
        let mut hash = TermsHash::new();
        hash.add(2, 0, b"id-1", vec![occ(0)], false);
        let buffer = &hash.fields[&2][&b"id-1"[..]];
        assert!(buffer.occurrences.is_empty());
        let mut postings = BufferedPostingsEnum::new(buffer);
        assert_eq!(postings.next_doc().unwrap(), 0);
        assert_eq!(postings.freq(), 1);
    }
}
