use std::sync::Arc;

use super::*;
use crate::codec::{SegmentReadState, SegmentWriteState};
use crate::index::field_infos::{FieldInfo, FieldInfos};
use crate::storage::Storage;
use crate::storage::memory::MemoryStorage;

type Occurrence = (u32, (u32, u32), Option<Vec<u8>>);

struct VecPostings {
    docs: Vec<(u32, Vec<Occurrence>)>,
    index: Option<usize>,
    next_pos: usize,
}

impl VecPostings {
    fn new(docs: Vec<(u32, Vec<Occurrence>)>) -> Self {
        VecPostings {
            docs,
            index: None,
            next_pos: 0,
        }
    }

    fn docs_only(docs: impl IntoIterator<Item = u32>) -> Self {
        VecPostings::new(
            docs.into_iter()
                .map(|d| (d, vec![(0, (0, 1), None)]))
                .collect(),
        )
    }

    fn occurrence(&self) -> Option<&Occurrence> {
        let (_, occ) = &self.docs[self.index?];
        occ.get(self.next_pos.checked_sub(1)?)
    }
}

impl PostingsEnum for VecPostings {
    fn doc(&self) -> u32 {
        match self.index {
            None => 0,
            Some(i) => self.docs.get(i).map_or(NO_MORE_DOCS, |d| d.0),
        }
    }

    fn next_doc(&mut self) -> Result<u32> {
        self.index = Some(self.index.map_or(0, |i| i + 1));
        self.next_pos = 0;
        Ok(self.doc())
    }

    fn freq(&self) -> u32 {
        self.index
            .and_then(|i| self.docs.get(i))
            .map_or(0, |d| d.1.len() as u32)
    }

    fn next_position(&mut self) -> Result<u32> {
        self.next_pos += 1;
        Ok(self.occurrence().map_or(0, |o| o.0))
    }

    fn offsets(&self) -> Option<(u32, u32)> {
        self.occurrence().map(|o| o.1)
    }

    fn payload(&self) -> Option<&[u8]> {
        self.occurrence().and_then(|o| o.2.as_deref())
    }

    fn cost(&self) -> u64 {
        self.docs.len() as u64
    }
}

fn field(name: &str, number: u32, options: IndexOptions, payloads: bool) -> FieldInfo {
    let mut info = FieldInfo::new(name, number);
    info.index_options = options;
    info.store_payloads = payloads;
    info
}

struct Fixture {
    storage: Arc<dyn Storage>,
    infos: Arc<FieldInfos>,
    max_doc: u32,
}

impl Fixture {
    fn new(fields: Vec<FieldInfo>, max_doc: u32) -> Self {
        Fixture {
            storage: Arc::new(MemoryStorage::default()),
            infos: Arc::new(FieldInfos::new(fields)),
            max_doc,
        }
    }

    fn write_state(&self) -> SegmentWriteState {
        SegmentWriteState::new(
            self.storage.clone(),
            "_0",
            [3; 16],
            self.max_doc,
            self.infos.clone(),
        )
    }

    fn open(&self) -> Result<BlockTreeFieldsProducer> {
        BlockTreeFieldsProducer::open(&SegmentReadState {
            storage: self.storage.clone(),
            segment_name: "_0".to_string(),
            segment_id: [3; 16],
            max_doc: self.max_doc,
            field_infos: self.infos.clone(),
        })
    }
}

#[test]
fn test_postings_round_trip_with_positions() {
    let body = field(
        "body",
        0,
        IndexOptions::DocsAndFreqsAndPositionsAndOffsets,
        true,
    );
    let fixture = Fixture::new(vec![body.clone()], 3);
    let mut consumer = BlockTreeTermsWriter::new(&fixture.write_state()).unwrap();
    consumer.start_field(&body).unwrap();
    let mut a = VecPostings::new(vec![
        (0, vec![(0, (0, 1), None)]),
        (1, vec![(0, (0, 1), Some(b"p".to_vec())), (4, (10, 11), None)]),
    ]);
    let stats = consumer.add_term(b"a", &mut a).unwrap().unwrap();
    assert_eq!(stats.doc_freq, 2);
    assert_eq!(stats.total_term_freq, 3);
    let mut c = VecPostings::new(vec![(0, vec![(2, (4, 5), None)]), (2, vec![(7, (20, 25), None)])]);
    consumer.add_term(b"c", &mut c).unwrap();
    let mut empty = VecPostings::new(vec![]);
    assert!(consumer.add_term(b"d", &mut empty).unwrap().is_none());
    consumer.finish_field().unwrap();
    Box::new(consumer).finish().unwrap();

    let producer = fixture.open().unwrap();
    assert_eq!(producer.fields(), vec!["body".to_string()]);
    let terms = producer.terms("body").unwrap();
    assert_eq!(terms.size(), 2);
    assert_eq!(terms.sum_doc_freq(), 4);
    assert_eq!(terms.sum_total_term_freq(), 5);
    assert_eq!(terms.doc_count(), 3);
    assert_eq!(terms.min_term(), Some(&b"a"[..]));
    assert_eq!(terms.max_term(), Some(&b"c"[..]));

    let mut te = terms.iterator().unwrap();
    assert!(te.seek_exact(b"a").unwrap());
    let mut postings = te.postings().unwrap();
    assert_eq!(postings.next_doc().unwrap(), 0);
    assert_eq!(postings.freq(), 1);
    assert_eq!(postings.next_doc().unwrap(), 1);
    assert_eq!(postings.freq(), 2);
    assert_eq!(postings.next_position().unwrap(), 0);
    assert_eq!(postings.payload(), Some(&b"p"[..]));
    assert_eq!(postings.next_position().unwrap(), 4);
    assert_eq!(postings.offsets(), Some((10, 11)));
    assert_eq!(postings.payload(), None);
    assert_eq!(postings.next_doc().unwrap(), NO_MORE_DOCS);

    // Positions of skipped docs are consumed lazily.
    assert!(te.seek_exact(b"c").unwrap());
    let mut postings = te.postings().unwrap();
    postings.next_doc().unwrap();
    assert_eq!(postings.next_doc().unwrap(), 2);
    assert_eq!(postings.next_position().unwrap(), 7);
    assert_eq!(postings.offsets(), Some((20, 25)));
}

#[test]
fn test_many_terms_iterate_and_seek() {
    let info = field("id", 0, IndexOptions::Docs, false);
    let fixture = Fixture::new(vec![info.clone()], 2000);
    let mut consumer = BlockTreeTermsWriter::new(&fixture.write_state()).unwrap();
    consumer.start_field(&info).unwrap();
    let terms: Vec<String> = (0..1000).map(|i| format!("term{i:05}")).collect();
    for (i, term) in terms.iter().enumerate() {
        let mut p = VecPostings::docs_only([i as u32 * 2]);
        consumer.add_term(term.as_bytes(), &mut p).unwrap();
    }
    Box::new(consumer).finish().unwrap();

    let producer = fixture.open().unwrap();
    let field_terms = producer.terms("id").unwrap();
    assert_eq!(field_terms.size(), 1000);
    let mut te = field_terms.iterator().unwrap();
    let mut seen = Vec::new();
    while te.next().unwrap() {
        seen.push(String::from_utf8(te.term().to_vec()).unwrap());
    }
    assert_eq!(seen, terms);

    let mut te = field_terms.iterator().unwrap();
    for (i, term) in terms.iter().enumerate().step_by(37) {
        assert!(te.seek_exact(term.as_bytes()).unwrap());
        let mut p = te.postings().unwrap();
        assert_eq!(p.next_doc().unwrap(), i as u32 * 2);
    }
    assert!(!te.seek_exact(b"term00010x").unwrap());
    assert_eq!(te.seek_ceil(b"term00010x").unwrap(), SeekStatus::NotFound);
    assert_eq!(te.term(), b"term00011");
    assert_eq!(te.seek_ceil(b"a").unwrap(), SeekStatus::NotFound);
    assert_eq!(te.term(), b"term00000");
    assert_eq!(te.seek_ceil(b"zzz").unwrap(), SeekStatus::End);
    assert!(!te.next().unwrap());
    // Iteration continues across block boundaries after a seek.
    assert_eq!(te.seek_ceil(b"term00047").unwrap(), SeekStatus::Found);
    assert!(te.next().unwrap());
    assert_eq!(te.term(), b"term00048");
}

#[test]
fn test_advance_uses_skip_table() {
    let info = field("f", 0, IndexOptions::DocsAndFreqsAndPositions, false);
    let fixture = Fixture::new(vec![info.clone()], 10_000);
    let mut consumer = BlockTreeTermsWriter::new(&fixture.write_state()).unwrap();
    consumer.start_field(&info).unwrap();
    let docs: Vec<u32> = (0..3000).map(|i| i * 3).collect();
    let mut p = VecPostings::new(
        docs.iter()
            .map(|&d| (d, vec![(d % 7, (0, 0), None), (d % 7 + 1, (0, 0), None)]))
            .collect(),
    );
    consumer.add_term(b"x", &mut p).unwrap();
    Box::new(consumer).finish().unwrap();

    let producer = fixture.open().unwrap();
    let mut te = producer.terms("f").unwrap().iterator().unwrap();
    assert!(te.seek_exact(b"x").unwrap());
    for target in [1u32, 500, 501, 3000, 7777, 8997] {
        let mut postings = te.postings().unwrap();
        let doc = postings.advance(target).unwrap();
        let expected = docs.iter().copied().find(|&d| d >= target).unwrap();
        assert_eq!(doc, expected);
        assert_eq!(postings.next_position().unwrap(), expected % 7);
        assert_eq!(postings.next_position().unwrap(), expected % 7 + 1);
    }
    let mut postings = te.postings().unwrap();
    postings.advance(4000).unwrap();
    assert_eq!(postings.advance(8998).unwrap(), NO_MORE_DOCS);
}

#[test]
fn test_field_without_terms_opens() {
    let a = field("a", 0, IndexOptions::Docs, false);
    let b = field("b", 1, IndexOptions::DocsAndFreqs, false);
    let fixture = Fixture::new(vec![a.clone(), b.clone()], 1);
    let mut consumer = BlockTreeTermsWriter::new(&fixture.write_state()).unwrap();
    consumer.start_field(&a).unwrap();
    consumer.finish_field().unwrap();
    consumer.start_field(&b).unwrap();
    consumer
        .add_term(b"t", &mut VecPostings::docs_only([0]))
        .unwrap();
    consumer.finish_field().unwrap();
    Box::new(consumer).finish().unwrap();

    let producer = fixture.open().unwrap();
    let terms = producer.terms("a").unwrap();
    assert_eq!(terms.size(), 0);
    assert_eq!(terms.min_term(), None);
    let mut te = terms.iterator().unwrap();
    assert!(!te.next().unwrap());
    assert_eq!(te.seek_ceil(b"t").unwrap(), SeekStatus::End);
    assert_eq!(producer.terms("b").unwrap().size(), 1);
}

#[test]
fn test_out_of_order_terms_rejected() {
    let info = field("f", 0, IndexOptions::Docs, false);
    let fixture = Fixture::new(vec![info.clone()], 1);
    let mut consumer = BlockTreeTermsWriter::new(&fixture.write_state()).unwrap();
    consumer.start_field(&info).unwrap();
    consumer
        .add_term(b"b", &mut VecPostings::docs_only([0]))
        .unwrap();
    assert!(consumer
        .add_term(b"a", &mut VecPostings::docs_only([0]))
        .is_err());
}

#[test]
fn test_corrupt_terms_file_detected() {
    let info = field("f", 0, IndexOptions::Docs, false);
    let fixture = Fixture::new(vec![info.clone()], 1);
    let mut consumer = BlockTreeTermsWriter::new(&fixture.write_state()).unwrap();
    consumer.start_field(&info).unwrap();
    consumer
        .add_term(b"hello", &mut VecPostings::docs_only([0]))
        .unwrap();
    Box::new(consumer).finish().unwrap();

    let storage = MemoryStorage::default();
    for name in fixture.storage.list_files().unwrap() {
        let data = fixture.storage.open_bytes(&name).unwrap().as_slice().to_vec();
        let mut out = storage.create_output(&name).unwrap();
        std::io::Write::write_all(&mut out, &data).unwrap();
        out.close().unwrap();
    }
    storage.corrupt_byte("_0.tim", 40).unwrap();
    let corrupted = Fixture {
        storage: Arc::new(storage),
        infos: fixture.infos.clone(),
        max_doc: 1,
    };
    assert!(corrupted.open().unwrap_err().is_corruption());
}

#[test]
fn test_tail_block_sizes() {
    assert!(tail_block_sizes(0).is_empty());
    assert_eq!(tail_block_sizes(10), vec![10]);
    assert_eq!(tail_block_sizes(48), vec![48]);
    assert_eq!(tail_block_sizes(72), vec![36, 36]);
    assert_eq!(tail_block_sizes(51), vec![26, 25]);
}
