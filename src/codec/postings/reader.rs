use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::{
    BLOCK_SIZE, DOC_CODEC, NO_MORE_DOCS, POS_CODEC, PostingsEnum, SeekStatus, TERMS_CODEC,
    TERMS_INDEX_CODEC, TermMeta, Terms, TermsEnum, VERSION_CURRENT, VERSION_START,
};
use crate::codec::codec_util::{FOOTER_LENGTH, open_checked};
use crate::codec::{FieldsProducer, SegmentReadState};
use crate::error::{Result, TesseraError};
use crate::index::field_infos::{FieldInfo, IndexOptions};
use crate::storage::FileBytes;
use crate::storage::structured::StructReader;

#[derive(Debug)]
struct PostingsFiles {
    tim: FileBytes,
    doc: FileBytes,
    pos: FileBytes,
}

impl PostingsFiles {
    fn tim_reader(&self, fp: u64) -> StructReader {
        body_reader(&self.tim, fp)
    }
}

fn body_reader(bytes: &FileBytes, fp: u64) -> StructReader {
    let end = bytes.len().saturating_sub(FOOTER_LENGTH);
    StructReader::with_range(bytes.clone(), fp as usize, end)
}

/// In-memory terms index of one field.
struct FieldIndex {
    info: FieldInfo,
    floor_keys: Vec<Vec<u8>>,
    block_fps: Vec<u64>,
    files: Arc<PostingsFiles>,
}

/// The terms of one field.
pub struct FieldTerms {
    index: Arc<FieldIndex>,
    num_terms: u64,
    sum_doc_freq: u64,
    sum_total_term_freq: u64,
    doc_count: u32,
    min_term: Vec<u8>,
    max_term: Vec<u8>,
}

impl fmt::Debug for FieldTerms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldTerms")
            .field("field", &self.index.info.name)
            .field("num_terms", &self.num_terms)
            .field("blocks", &self.index.block_fps.len())
            .finish()
    }
}

impl Terms for FieldTerms {
    fn iterator(&self) -> Result<Box<dyn TermsEnum>> {
        Ok(Box::new(SegmentTermsEnum {
            index: self.index.clone(),
            loaded: None,
            entries: Vec::new(),
            pos: None,
            exhausted: false,
        }))
    }

    fn size(&self) -> u64 {
        self.num_terms
    }

    fn sum_doc_freq(&self) -> u64 {
        self.sum_doc_freq
    }

    fn sum_total_term_freq(&self) -> u64 {
        self.sum_total_term_freq
    }

    fn doc_count(&self) -> u32 {
        self.doc_count
    }

    fn min_term(&self) -> Option<&[u8]> {
        (self.num_terms > 0).then_some(self.min_term.as_slice())
    }

    fn max_term(&self) -> Option<&[u8]> {
        (self.num_terms > 0).then_some(self.max_term.as_slice())
    }

    fn index_options(&self) -> IndexOptions {
        self.index.info.index_options
    }

    fn has_payloads(&self) -> bool {
        self.index.info.store_payloads
    }
}

/// Opens the four postings files and parses the terms index.
pub struct BlockTreeFieldsProducer {
    fields: HashMap<String, Arc<FieldTerms>>,
    order: Vec<String>,
}

impl fmt::Debug for BlockTreeFieldsProducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockTreeFieldsProducer")
            .field("fields", &self.order)
            .finish()
    }
}

impl BlockTreeFieldsProducer {
    pub fn open(state: &SegmentReadState) -> Result<Self> {
        let id = &state.segment_id;
        let check = |ext: &str, codec: &str| -> Result<(FileBytes, StructReader)> {
            let bytes = state.open(ext)?;
            let (reader, _) =
                open_checked(bytes.clone(), codec, VERSION_START, VERSION_CURRENT, id, "")?;
            Ok((bytes, reader))
        };
        let (tim, _) = check("tim", TERMS_CODEC)?;
        let (doc, _) = check("doc", DOC_CODEC)?;
        let (pos, _) = check("pos", POS_CODEC)?;
        let (_, mut tip) = check("tip", TERMS_INDEX_CODEC)?;
        let files = Arc::new(PostingsFiles { tim, doc, pos });

        let num_fields = tip.read_varint()? as usize;
        let mut fields = HashMap::with_capacity(num_fields);
        let mut order = Vec::with_capacity(num_fields);
        for _ in 0..num_fields {
            let number = tip.read_varint_u32()?;
            let info = state.field_infos.field_by_number(number).ok_or_else(|| {
                TesseraError::corruption(tip.name(), format!("unknown field number {number}"))
            })?;
            let num_terms = tip.read_varint()?;
            let sum_doc_freq = tip.read_varint()?;
            let sum_total_term_freq = tip.read_varint()?;
            let doc_count = tip.read_varint_u32()?;
            let min_term = tip.read_bytes()?;
            let max_term = tip.read_bytes()?;
            let num_blocks = tip.read_varint()? as usize;
            if doc_count > state.max_doc || num_blocks as u64 > num_terms {
                return Err(TesseraError::corruption(
                    tip.name(),
                    format!("invalid statistics for field '{}'", info.name),
                ));
            }
            let mut floor_keys = Vec::with_capacity(num_blocks);
            let mut block_fps = Vec::with_capacity(num_blocks);
            let mut prev_key: Vec<u8> = Vec::new();
            let mut prev_fp = 0u64;
            for _ in 0..num_blocks {
                let shared = tip.read_varint()? as usize;
                if shared > prev_key.len() {
                    return Err(TesseraError::corruption(tip.name(), "bad floor key prefix"));
                }
                let mut key = prev_key[..shared].to_vec();
                key.extend_from_slice(&tip.read_bytes()?);
                prev_fp += tip.read_varint()?;
                floor_keys.push(key.clone());
                block_fps.push(prev_fp);
                prev_key = key;
            }
            let terms = FieldTerms {
                index: Arc::new(FieldIndex {
                    info: info.clone(),
                    floor_keys,
                    block_fps,
                    files: files.clone(),
                }),
                num_terms,
                sum_doc_freq,
                sum_total_term_freq,
                doc_count,
                min_term,
                max_term,
            };
            order.push(info.name.clone());
            fields.insert(info.name.clone(), Arc::new(terms));
        }
        if !tip.is_eof() {
            return Err(TesseraError::corruption(tip.name(), "trailing bytes in terms index"));
        }
        Ok(BlockTreeFieldsProducer { fields, order })
    }
}

impl FieldsProducer for BlockTreeFieldsProducer {
    fn terms(&self, field: &str) -> Option<Arc<dyn Terms>> {
        self.fields
            .get(field)
            .map(|terms| terms.clone() as Arc<dyn Terms>)
    }

    fn fields(&self) -> Vec<String> {
        self.order.clone()
    }
}

struct BlockEntry {
    term: Vec<u8>,
    meta: TermMeta,
}

struct SegmentTermsEnum {
    index: Arc<FieldIndex>,
    loaded: Option<usize>,
    entries: Vec<BlockEntry>,
    pos: Option<usize>,
    exhausted: bool,
}

impl SegmentTermsEnum {
    fn load_block(&mut self, block: usize) -> Result<()> {
        if self.loaded == Some(block) {
            return Ok(());
        }
        let has_freqs = self.index.info.index_options.has_freqs();
        let mut input = self.index.files.tim_reader(self.index.block_fps[block]);
        let count = input.read_varint()? as usize;
        if count == 0 {
            return Err(TesseraError::corruption(input.name(), "empty term block"));
        }
        let prefix = input.read_bytes()?;
        self.entries.clear();
        let (mut doc_fp, mut pos_fp) = (0u64, 0u64);
        for _ in 0..count {
            let mut term = prefix.clone();
            term.extend_from_slice(&input.read_bytes()?);
            let doc_freq = input.read_varint_u32()?;
            let total_term_freq = if has_freqs {
                doc_freq as u64 + input.read_varint()?
            } else {
                doc_freq as u64
            };
            doc_fp += input.read_varint()?;
            pos_fp += input.read_varint()?;
            let skip_offset = input.read_varint()?;
            self.entries.push(BlockEntry {
                term,
                meta: TermMeta {
                    doc_freq,
                    total_term_freq,
                    doc_fp,
                    pos_fp,
                    skip_offset,
                },
            });
        }
        self.loaded = Some(block);
        Ok(())
    }

    fn current(&self) -> Option<&BlockEntry> {
        self.pos.and_then(|i| self.entries.get(i))
    }

    fn set_end(&mut self) {
        self.exhausted = true;
        self.pos = None;
    }
}

impl TermsEnum for SegmentTermsEnum {
    fn next(&mut self) -> Result<bool> {
        if self.exhausted {
            return Ok(false);
        }
        if let Some(i) = self.pos {
            if i + 1 < self.entries.len() {
                self.pos = Some(i + 1);
                return Ok(true);
            }
        }
        let next_block = match (self.pos, self.loaded) {
            (Some(_), Some(block)) => block + 1,
            _ => 0,
        };
        if next_block >= self.index.block_fps.len() {
            self.set_end();
            return Ok(false);
        }
        self.load_block(next_block)?;
        self.pos = Some(0);
        Ok(true)
    }

    fn seek_exact(&mut self, term: &[u8]) -> Result<bool> {
        Ok(self.seek_ceil(term)? == SeekStatus::Found)
    }

    fn seek_ceil(&mut self, term: &[u8]) -> Result<SeekStatus> {
        self.exhausted = false;
        let num_blocks = self.index.block_fps.len();
        if num_blocks == 0 {
            self.set_end();
            return Ok(SeekStatus::End);
        }
        let floor = self
            .index
            .floor_keys
            .partition_point(|key| key.as_slice() <= term);
        let block = floor.saturating_sub(1);
        self.load_block(block)?;
        match self
            .entries
            .binary_search_by(|entry| entry.term.as_slice().cmp(term))
        {
            Ok(i) => {
                self.pos = Some(i);
                Ok(SeekStatus::Found)
            }
            Err(i) if i < self.entries.len() => {
                self.pos = Some(i);
                Ok(SeekStatus::NotFound)
            }
            Err(_) if block + 1 < num_blocks => {
                self.load_block(block + 1)?;
                self.pos = Some(0);
                Ok(SeekStatus::NotFound)
            }
            Err(_) => {
                self.set_end();
                Ok(SeekStatus::End)
            }
        }
    }

    fn term(&self) -> &[u8] {
        self.current().map_or(&[], |e| e.term.as_slice())
    }

    fn doc_freq(&self) -> u32 {
        self.current().map_or(0, |e| e.meta.doc_freq)
    }

    fn total_term_freq(&self) -> u64 {
        self.current().map_or(0, |e| e.meta.total_term_freq)
    }

    fn postings(&self) -> Result<Box<dyn PostingsEnum>> {
        let entry = self
            .current()
            .ok_or_else(|| TesseraError::illegal_state("terms enum is not positioned"))?;
        Ok(Box::new(BlockPostingsEnum::new(&self.index, entry.meta)))
    }
}

#[derive(Debug, Clone, Copy)]
struct SkipEntry {
    last_doc: u32,
    doc_fp: u64,
    pos_fp: u64,
}

/// Decodes one term's postings from `.doc` and `.pos`.
struct BlockPostingsEnum {
    doc_in: StructReader,
    pos_in: Option<StructReader>,
    meta: TermMeta,
    options: IndexOptions,
    has_payloads: bool,
    skip: Option<Vec<SkipEntry>>,
    doc: u32,
    last_doc: u32,
    freq: u32,
    docs_read: u32,
    // Positions of earlier docs still to be skipped in `.pos`.
    pos_pending: u64,
    pos_left: u32,
    last_position: u32,
    last_start: u32,
    offsets: Option<(u32, u32)>,
    payload: Option<Vec<u8>>,
}

impl BlockPostingsEnum {
    fn new(index: &FieldIndex, meta: TermMeta) -> Self {
        let options = index.info.index_options;
        let pos_in = options
            .has_positions()
            .then(|| body_reader(&index.files.pos, meta.pos_fp));
        BlockPostingsEnum {
            doc_in: body_reader(&index.files.doc, meta.doc_fp),
            pos_in,
            meta,
            options,
            has_payloads: index.info.store_payloads,
            skip: None,
            doc: 0,
            last_doc: 0,
            freq: 0,
            docs_read: 0,
            pos_pending: 0,
            pos_left: 0,
            last_position: 0,
            last_start: 0,
            offsets: None,
            payload: None,
        }
    }

    fn load_skip(&mut self) -> Result<&[SkipEntry]> {
        if self.skip.is_none() {
            let mut entries = Vec::new();
            if self.meta.skip_offset > 0 {
                let mut input = StructReader::with_range(
                    self.doc_in.bytes().clone(),
                    (self.meta.doc_fp + self.meta.skip_offset) as usize,
                    self.doc_in.end(),
                );
                let count = input.read_varint()? as usize;
                let (mut last_doc, mut doc_fp, mut pos_fp) = (0u32, 0u64, 0u64);
                for _ in 0..count {
                    last_doc += input.read_varint_u32()?;
                    doc_fp += input.read_varint()?;
                    pos_fp += input.read_varint()?;
                    entries.push(SkipEntry {
                        last_doc,
                        doc_fp,
                        pos_fp,
                    });
                }
            }
            self.skip = Some(entries);
        }
        Ok(self.skip.as_deref().unwrap_or(&[]))
    }

    fn read_position(&mut self, keep: bool) -> Result<u32> {
        let has_payloads = self.has_payloads;
        let has_offsets = self.options.has_offsets();
        let input = self
            .pos_in
            .as_mut()
            .ok_or_else(|| TesseraError::illegal_state("positions were not indexed"))?;
        let code = input.read_varint()?;
        let (delta, payload) = if has_payloads {
            let payload = if code & 1 == 1 {
                Some(input.read_bytes()?)
            } else {
                None
            };
            (code >> 1, payload)
        } else {
            (code, None)
        };
        let offsets = if has_offsets {
            let start_delta = input.read_zigzag()?;
            let length = input.read_varint()?;
            let base = if keep { self.last_start } else { 0 };
            let start = (base as i64 + start_delta).max(0) as u32;
            Some((start, start.saturating_add(length as u32)))
        } else {
            None
        };
        if !keep {
            return Ok(0);
        }
        self.last_position = self.last_position.saturating_add(delta as u32);
        if let Some((start, _)) = offsets {
            self.last_start = start;
        }
        self.offsets = offsets;
        self.payload = payload;
        Ok(self.last_position)
    }
}

impl PostingsEnum for BlockPostingsEnum {
    fn doc(&self) -> u32 {
        self.doc
    }

    fn next_doc(&mut self) -> Result<u32> {
        if self.docs_read >= self.meta.doc_freq {
            self.doc = NO_MORE_DOCS;
            return Ok(NO_MORE_DOCS);
        }
        self.pos_pending += self.pos_left as u64;
        let code = self.doc_in.read_varint()?;
        let delta = if self.options.has_freqs() {
            self.freq = if code & 1 == 1 {
                1
            } else {
                self.doc_in.read_varint_u32()?
            };
            code >> 1
        } else {
            self.freq = 1;
            code
        };
        let doc = self.last_doc as u64 + delta;
        if doc >= NO_MORE_DOCS as u64 || (self.docs_read > 0 && delta == 0) {
            return Err(TesseraError::corruption(
                self.doc_in.name(),
                format!("invalid doc delta {delta} after doc {}", self.last_doc),
            ));
        }
        self.doc = doc as u32;
        self.last_doc = self.doc;
        self.docs_read += 1;
        self.pos_left = if self.pos_in.is_some() { self.freq } else { 0 };
        self.last_position = 0;
        self.last_start = 0;
        self.offsets = None;
        self.payload = None;
        Ok(self.doc)
    }

    fn advance(&mut self, target: u32) -> Result<u32> {
        if self.meta.doc_freq > BLOCK_SIZE && self.meta.skip_offset > 0 {
            let skip = self.load_skip()?;
            let blocks = skip.partition_point(|entry| entry.last_doc < target);
            if blocks > 0 {
                let entry = skip[blocks - 1];
                let docs_before = blocks as u32 * BLOCK_SIZE;
                if docs_before > self.docs_read {
                    self.doc_in.seek((self.meta.doc_fp + entry.doc_fp) as usize)?;
                    if let Some(pos_in) = self.pos_in.as_mut() {
                        pos_in.seek((self.meta.pos_fp + entry.pos_fp) as usize)?;
                    }
                    self.docs_read = docs_before;
                    self.last_doc = entry.last_doc;
                    self.doc = entry.last_doc;
                    self.pos_pending = 0;
                    self.pos_left = 0;
                }
            }
        }
        loop {
            let doc = self.next_doc()?;
            if doc >= target {
                return Ok(doc);
            }
        }
    }

    fn freq(&self) -> u32 {
        self.freq
    }

    fn next_position(&mut self) -> Result<u32> {
        while self.pos_pending > 0 {
            self.read_position(false)?;
            self.pos_pending -= 1;
        }
        if self.pos_left == 0 {
            return Err(TesseraError::illegal_state(format!(
                "no positions left in doc {}",
                self.doc
            )));
        }
        self.pos_left -= 1;
        self.read_position(true)
    }

    fn offsets(&self) -> Option<(u32, u32)> {
        self.offsets
    }

    fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }

    fn cost(&self) -> u64 {
        self.meta.doc_freq as u64
    }
}
