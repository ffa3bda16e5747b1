use bit_vec::BitVec;

use super::{
    BLOCK_SIZE, DOC_CODEC, MAX_TERMS_IN_BLOCK, MIN_TERMS_IN_BLOCK, NO_MORE_DOCS, POS_CODEC,
    PostingsEnum, TERMS_CODEC, TERMS_INDEX_CODEC, TermMeta, TermStats, VERSION_CURRENT,
    shared_prefix, tail_block_sizes,
};
use crate::codec::codec_util::{write_footer_and_close, write_header};
use crate::codec::{FieldsConsumer, SegmentWriteState};
use crate::error::{Result, TesseraError};
use crate::index::field_infos::{FieldInfo, IndexOptions};
use crate::storage::structured::StructWriter;

/// A block is written once this many terms are pending, leaving at least
/// [`MIN_TERMS_IN_BLOCK`] behind.
const FLUSH_THRESHOLD: usize = MAX_TERMS_IN_BLOCK + MIN_TERMS_IN_BLOCK;

struct PendingTerm {
    term: Vec<u8>,
    meta: TermMeta,
}

struct BlockIndexEntry {
    first_term: Vec<u8>,
    fp: u64,
}

struct FieldState {
    info: FieldInfo,
    pending: Vec<PendingTerm>,
    blocks: Vec<BlockIndexEntry>,
    num_terms: u64,
    sum_doc_freq: u64,
    sum_total_term_freq: u64,
    docs_seen: BitVec,
    min_term: Option<Vec<u8>>,
    last_term: Option<Vec<u8>>,
}

struct FieldSummary {
    number: u32,
    num_terms: u64,
    sum_doc_freq: u64,
    sum_total_term_freq: u64,
    doc_count: u32,
    min_term: Vec<u8>,
    max_term: Vec<u8>,
    blocks: Vec<BlockIndexEntry>,
}

/// Streams terms into blocks and postings into the doc/pos files.
pub struct BlockTreeTermsWriter {
    max_doc: u32,
    tim: StructWriter,
    tip: StructWriter,
    doc: StructWriter,
    pos: StructWriter,
    current: Option<FieldState>,
    last_field_number: Option<u32>,
    summaries: Vec<FieldSummary>,
    skip_scratch: Vec<(u32, u64, u64)>,
}

impl BlockTreeTermsWriter {
    pub fn new(state: &SegmentWriteState) -> Result<Self> {
        let id = &state.segment_id;
        let mut tim = state.create_output("tim")?;
        write_header(&mut tim, TERMS_CODEC, VERSION_CURRENT, id, "")?;
        let mut tip = state.create_output("tip")?;
        write_header(&mut tip, TERMS_INDEX_CODEC, VERSION_CURRENT, id, "")?;
        let mut doc = state.create_output("doc")?;
        write_header(&mut doc, DOC_CODEC, VERSION_CURRENT, id, "")?;
        let mut pos = state.create_output("pos")?;
        write_header(&mut pos, POS_CODEC, VERSION_CURRENT, id, "")?;
        Ok(BlockTreeTermsWriter {
            max_doc: state.max_doc,
            tim,
            tip,
            doc,
            pos,
            current: None,
            last_field_number: None,
            summaries: Vec::new(),
            skip_scratch: Vec::new(),
        })
    }

    /// Write the postings of one term, returning its metadata.
    fn write_postings(
        &mut self,
        options: IndexOptions,
        has_payloads: bool,
        postings: &mut dyn PostingsEnum,
        docs_seen: &mut BitVec,
    ) -> Result<Option<TermMeta>> {
        let doc_start = self.doc.position();
        let pos_start = self.pos.position();
        let has_freqs = options.has_freqs();
        let has_positions = options.has_positions();
        let has_offsets = options.has_offsets();
        self.skip_scratch.clear();

        let mut doc_freq = 0u32;
        let mut total_term_freq = 0u64;
        let mut last_doc = 0u32;
        loop {
            let doc = postings.next_doc()?;
            if doc == NO_MORE_DOCS {
                break;
            }
            if doc >= self.max_doc || (doc_freq > 0 && doc <= last_doc) {
                return Err(TesseraError::illegal_state(format!(
                    "postings out of order or out of range: doc {doc} after {last_doc}, max_doc {}",
                    self.max_doc
                )));
            }
            let delta = (doc - last_doc) as u64;
            let freq = if has_freqs { postings.freq() } else { 1 };
            if has_freqs {
                if freq == 1 {
                    self.doc.write_varint((delta << 1) | 1)?;
                } else {
                    self.doc.write_varint(delta << 1)?;
                    self.doc.write_varint(freq as u64)?;
                }
            } else {
                self.doc.write_varint(delta)?;
            }

            if has_positions {
                let mut last_position = 0u32;
                let mut last_start = 0u32;
                for _ in 0..freq {
                    let position = postings.next_position()?;
                    let pos_delta = position.checked_sub(last_position).ok_or_else(|| {
                        TesseraError::illegal_state(format!(
                            "positions out of order in doc {doc}: {position} after {last_position}"
                        ))
                    })? as u64;
                    if has_payloads {
                        match postings.payload().filter(|p| !p.is_empty()) {
                            Some(payload) => {
                                self.pos.write_varint((pos_delta << 1) | 1)?;
                                self.pos.write_bytes(payload)?;
                            }
                            None => self.pos.write_varint(pos_delta << 1)?,
                        }
                    } else {
                        self.pos.write_varint(pos_delta)?;
                    }
                    if has_offsets {
                        let (start, end) = postings.offsets().unwrap_or((last_start, last_start));
                        self.pos.write_zigzag(start as i64 - last_start as i64)?;
                        self.pos.write_varint(end.saturating_sub(start) as u64)?;
                        last_start = start;
                    }
                    last_position = position;
                }
            }

            docs_seen.set(doc as usize, true);
            doc_freq += 1;
            total_term_freq += freq as u64;
            last_doc = doc;
            if doc_freq % BLOCK_SIZE == 0 {
                self.skip_scratch.push((
                    doc,
                    self.doc.position() - doc_start,
                    self.pos.position() - pos_start,
                ));
            }
        }
        if doc_freq == 0 {
            return Ok(None);
        }
        // An entry at the very end of the postings never helps advance.
        if doc_freq % BLOCK_SIZE == 0 {
            self.skip_scratch.pop();
        }

        let mut skip_offset = 0;
        if !self.skip_scratch.is_empty() {
            skip_offset = self.doc.position() - doc_start;
            self.doc.write_varint(self.skip_scratch.len() as u64)?;
            let (mut prev_doc, mut prev_doc_fp, mut prev_pos_fp) = (0u32, 0u64, 0u64);
            for &(doc, doc_fp, pos_fp) in &self.skip_scratch {
                self.doc.write_varint((doc - prev_doc) as u64)?;
                self.doc.write_varint(doc_fp - prev_doc_fp)?;
                self.doc.write_varint(pos_fp - prev_pos_fp)?;
                prev_doc = doc;
                prev_doc_fp = doc_fp;
                prev_pos_fp = pos_fp;
            }
        }

        Ok(Some(TermMeta {
            doc_freq,
            total_term_freq: if has_freqs {
                total_term_freq
            } else {
                doc_freq as u64
            },
            doc_fp: doc_start,
            pos_fp: pos_start,
            skip_offset,
        }))
    }
}

/// Write one block of terms to `.tim`, returning its file pointer.
fn write_block(tim: &mut StructWriter, has_freqs: bool, terms: &[PendingTerm]) -> Result<u64> {
    let fp = tim.position();
    let prefix_len = match (terms.first(), terms.last()) {
        (Some(first), Some(last)) => shared_prefix(&first.term, &last.term),
        _ => 0,
    };
    tim.write_varint(terms.len() as u64)?;
    tim.write_bytes(terms.first().map_or(&[][..], |t| &t.term[..prefix_len]))?;
    let (mut prev_doc_fp, mut prev_pos_fp) = (0u64, 0u64);
    for pending in terms {
        let meta = &pending.meta;
        tim.write_bytes(&pending.term[prefix_len..])?;
        tim.write_varint(meta.doc_freq as u64)?;
        if has_freqs {
            tim.write_varint(meta.total_term_freq - meta.doc_freq as u64)?;
        }
        tim.write_varint(meta.doc_fp - prev_doc_fp)?;
        tim.write_varint(meta.pos_fp - prev_pos_fp)?;
        tim.write_varint(meta.skip_offset)?;
        prev_doc_fp = meta.doc_fp;
        prev_pos_fp = meta.pos_fp;
    }
    Ok(fp)
}

fn flush_block(tim: &mut StructWriter, field: &mut FieldState, count: usize) -> Result<()> {
    let block: Vec<PendingTerm> = field.pending.drain(..count).collect();
    let fp = write_block(tim, field.info.index_options.has_freqs(), &block)?;
    if let Some(first) = block.into_iter().next() {
        field.blocks.push(BlockIndexEntry {
            first_term: first.term,
            fp,
        });
    }
    Ok(())
}

impl FieldsConsumer for BlockTreeTermsWriter {
    fn start_field(&mut self, field: &FieldInfo) -> Result<()> {
        if self.current.is_some() {
            return Err(TesseraError::illegal_state(format!(
                "field '{}' started before the previous field finished",
                field.name
            )));
        }
        if self.last_field_number.is_some_and(|n| n >= field.number) {
            return Err(TesseraError::illegal_state(format!(
                "field '{}' (number {}) written out of order",
                field.name, field.number
            )));
        }
        if !field.index_options.is_indexed() {
            return Err(TesseraError::illegal_argument(format!(
                "field '{}' is not indexed",
                field.name
            )));
        }
        self.last_field_number = Some(field.number);
        self.current = Some(FieldState {
            info: field.clone(),
            pending: Vec::with_capacity(FLUSH_THRESHOLD),
            blocks: Vec::new(),
            num_terms: 0,
            sum_doc_freq: 0,
            sum_total_term_freq: 0,
            docs_seen: BitVec::from_elem(self.max_doc as usize, false),
            min_term: None,
            last_term: None,
        });
        Ok(())
    }

    fn add_term(
        &mut self,
        term: &[u8],
        postings: &mut dyn PostingsEnum,
    ) -> Result<Option<TermStats>> {
        let mut field = self
            .current
            .take()
            .ok_or_else(|| TesseraError::illegal_state("no field started"))?;
        if field.last_term.as_deref().is_some_and(|last| last >= term) {
            let name = field.info.name.clone();
            self.current = Some(field);
            return Err(TesseraError::illegal_state(format!(
                "terms of field '{name}' added out of order"
            )));
        }
        let options = field.info.index_options;
        let has_payloads = field.info.store_payloads;
        let meta = self.write_postings(options, has_payloads, postings, &mut field.docs_seen);
        let meta = match meta {
            Ok(Some(meta)) => meta,
            Ok(None) => {
                self.current = Some(field);
                return Ok(None);
            }
            Err(e) => {
                self.current = Some(field);
                return Err(e);
            }
        };

        field.num_terms += 1;
        field.sum_doc_freq += meta.doc_freq as u64;
        field.sum_total_term_freq += meta.total_term_freq;
        if field.min_term.is_none() {
            field.min_term = Some(term.to_vec());
        }
        field.last_term = Some(term.to_vec());
        field.pending.push(PendingTerm {
            term: term.to_vec(),
            meta,
        });
        let result = if field.pending.len() >= FLUSH_THRESHOLD {
            flush_block(&mut self.tim, &mut field, MAX_TERMS_IN_BLOCK)
        } else {
            Ok(())
        };
        self.current = Some(field);
        result?;
        Ok(Some(TermStats {
            doc_freq: meta.doc_freq,
            total_term_freq: meta.total_term_freq,
        }))
    }

    fn finish_field(&mut self) -> Result<()> {
        let mut field = self
            .current
            .take()
            .ok_or_else(|| TesseraError::illegal_state("no field started"))?;
        for size in tail_block_sizes(field.pending.len()) {
            flush_block(&mut self.tim, &mut field, size)?;
        }
        let doc_count = field.docs_seen.iter().filter(|b| *b).count() as u32;
        self.summaries.push(FieldSummary {
            number: field.info.number,
            num_terms: field.num_terms,
            sum_doc_freq: field.sum_doc_freq,
            sum_total_term_freq: field.sum_total_term_freq,
            doc_count,
            min_term: field.min_term.unwrap_or_default(),
            max_term: field.last_term.unwrap_or_default(),
            blocks: field.blocks,
        });
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> Result<()> {
        if self.current.is_some() {
            self.finish_field()?;
        }
        let BlockTreeTermsWriter {
            tim,
            mut tip,
            doc,
            pos,
            summaries,
            ..
        } = *self;

        tip.write_varint(summaries.len() as u64)?;
        for summary in &summaries {
            tip.write_varint(summary.number as u64)?;
            tip.write_varint(summary.num_terms)?;
            tip.write_varint(summary.sum_doc_freq)?;
            tip.write_varint(summary.sum_total_term_freq)?;
            tip.write_varint(summary.doc_count as u64)?;
            tip.write_bytes(&summary.min_term)?;
            tip.write_bytes(&summary.max_term)?;
            tip.write_varint(summary.blocks.len() as u64)?;
            let mut prev_key: &[u8] = &[];
            let mut prev_fp = 0u64;
            for block in &summary.blocks {
                let shared = shared_prefix(prev_key, &block.first_term);
                tip.write_varint(shared as u64)?;
                tip.write_bytes(&block.first_term[shared..])?;
                tip.write_varint(block.fp - prev_fp)?;
                prev_key = &block.first_term;
                prev_fp = block.fp;
            }
        }

        write_footer_and_close(tim)?;
        write_footer_and_close(tip)?;
        write_footer_and_close(doc)?;
        write_footer_and_close(pos)?;
        Ok(())
    }
}
