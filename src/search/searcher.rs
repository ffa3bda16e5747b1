//! Read API over a [`DirectoryReader`] in global doc ids.

use std::cmp::Ordering;
use std::sync::Arc;

use bit_vec::BitVec;
use rayon::prelude::*;

use crate::codec::{NO_MORE_DOCS, PostingsEnum, StoredField};
use crate::document::VectorValue;
use crate::error::{Result, TesseraError};
use crate::index::directory_reader::DirectoryReader;
use crate::index::segment_reader::SegmentReader;
use crate::index::term::Term;
use crate::search::query::Query;

/// Executes lookups and queries against one point-in-time reader.
///
/// Global doc ids are the segment-local ids offset by the doc count of the
/// segments before; they are only meaningful for this reader.
#[derive(Debug, Clone)]
pub struct IndexSearcher {
    reader: Arc<DirectoryReader>,
}

impl IndexSearcher {
    pub fn new(reader: DirectoryReader) -> Self {
        IndexSearcher {
            reader: Arc::new(reader),
        }
    }

    pub fn from_arc(reader: Arc<DirectoryReader>) -> Self {
        IndexSearcher { reader }
    }

    pub fn reader(&self) -> &Arc<DirectoryReader> {
        &self.reader
    }

    /// Documents containing `term`, deleted ones included.
    pub fn doc_freq(&self, term: &Term) -> Result<u64> {
        self.reader.doc_freq(term)
    }

    pub fn total_term_freq(&self, term: &Term) -> Result<u64> {
        self.reader.total_term_freq(term)
    }

    /// Live documents containing `term`, in global doc id order.
    pub fn postings(&self, term: &Term) -> Result<Option<GlobalPostings>> {
        self.reader.ensure_open()?;
        let mut leaves = Vec::new();
        for (segment, base) in self.reader.leaves().iter().zip(self.reader.doc_starts()) {
            if let Some(postings) = segment.postings(term)? {
                leaves.push(LeafPostings {
                    base: *base,
                    max_doc: segment.max_doc(),
                    live: segment.has_deletions().then(|| Arc::clone(segment.live_docs())),
                    postings,
                    doc: None,
                });
            }
        }
        if leaves.is_empty() {
            return Ok(None);
        }
        Ok(Some(GlobalPostings {
            leaves,
            current: 0,
            doc: None,
        }))
    }

    fn leaf(&self, doc: u32) -> Result<(&SegmentReader, u32)> {
        self.reader.ensure_open()?;
        let (index, local) = self.reader.locate(doc).ok_or_else(|| {
            TesseraError::illegal_argument(format!(
                "doc {doc} out of bounds for reader with {} docs",
                self.reader.max_doc()
            ))
        })?;
        Ok((&self.reader.leaves()[index], local))
    }

    /// Stored fields of a document.
    pub fn document(&self, doc: u32) -> Result<Vec<StoredField>> {
        let (segment, local) = self.leaf(doc)?;
        segment.document(local)
    }

    pub fn is_live(&self, doc: u32) -> Result<bool> {
        let (segment, local) = self.leaf(doc)?;
        Ok(segment.is_live(local))
    }

    pub fn numeric_doc_value(&self, field: &str, doc: u32) -> Result<Option<i64>> {
        let (segment, local) = self.leaf(doc)?;
        segment.numeric_doc_value(field, local)
    }

    pub fn binary_doc_value(&self, field: &str, doc: u32) -> Result<Option<Vec<u8>>> {
        let (segment, local) = self.leaf(doc)?;
        segment.binary_doc_value(field, local)
    }

    pub fn sorted_doc_value(&self, field: &str, doc: u32) -> Result<Option<Vec<u8>>> {
        let (segment, local) = self.leaf(doc)?;
        segment.sorted_doc_value(field, local)
    }

    pub fn sorted_set_doc_values(&self, field: &str, doc: u32) -> Result<Vec<Vec<u8>>> {
        let (segment, local) = self.leaf(doc)?;
        segment.sorted_set_doc_values(field, local)
    }

    pub fn vector(&self, field: &str, doc: u32) -> Result<Option<VectorValue>> {
        let (segment, local) = self.leaf(doc)?;
        segment.vector(field, local)
    }

    /// The `k` live documents whose vectors are closest to `query`, best
    /// first.
    pub fn knn(&self, field: &str, query: &[f32], k: usize) -> Result<Vec<(u32, f32)>> {
        self.reader.ensure_open()?;
        let mut hits = Vec::new();
        for (segment, base) in self.reader.leaves().iter().zip(self.reader.doc_starts()) {
            hits.extend(
                segment
                    .knn(field, query, k)?
                    .into_iter()
                    .map(|(doc, score)| (base + doc, score)),
            );
        }
        hits.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        hits.truncate(k);
        Ok(hits)
    }

    /// Live documents matching `query`, in global doc id order.
    ///
    /// Segments are matched in parallel.
    pub fn search(&self, query: &dyn Query) -> Result<Vec<u32>> {
        self.reader.ensure_open()?;
        let per_leaf: Vec<Vec<u32>> = self
            .reader
            .leaves()
            .par_iter()
            .zip(self.reader.doc_starts().par_iter())
            .map(|(segment, base)| {
                let matches = query.matches(segment)?;
                Ok(matches
                    .into_iter()
                    .filter(|doc| segment.is_live(*doc))
                    .map(|doc| base + doc)
                    .collect())
            })
            .collect::<Result<_>>()?;
        Ok(per_leaf.into_iter().flatten().collect())
    }

    /// Number of live documents matching `query`.
    pub fn count(&self, query: &dyn Query) -> Result<usize> {
        self.reader.ensure_open()?;
        self.reader
            .leaves()
            .par_iter()
            .map(|segment| {
                Ok(query
                    .matches(segment)?
                    .into_iter()
                    .filter(|doc| segment.is_live(*doc))
                    .count())
            })
            .sum::<Result<usize>>()
    }
}

struct LeafPostings {
    base: u32,
    max_doc: u32,
    /// Set only for segments with deletions.
    live: Option<Arc<BitVec>>,
    postings: Box<dyn PostingsEnum>,
    doc: Option<u32>,
}

impl LeafPostings {
    fn is_live(&self, doc: u32) -> bool {
        self.live
            .as_ref()
            .is_none_or(|live| live.get(doc as usize).unwrap_or(false))
    }

    /// Skip deleted docs starting at `doc`.
    fn settle(&mut self, mut doc: u32) -> Result<u32> {
        while doc != NO_MORE_DOCS && !self.is_live(doc) {
            doc = self.postings.next_doc()?;
        }
        self.doc = Some(doc);
        Ok(doc)
    }
}

/// Postings of one term across every segment, deleted docs skipped.
pub struct GlobalPostings {
    leaves: Vec<LeafPostings>,
    current: usize,
    doc: Option<u32>,
}

impl GlobalPostings {
    fn exhaust(&mut self) -> u32 {
        self.current = self.leaves.len();
        self.doc = Some(NO_MORE_DOCS);
        NO_MORE_DOCS
    }

    fn current_leaf(&self) -> Option<&LeafPostings> {
        self.doc
            .filter(|doc| *doc != NO_MORE_DOCS)
            .and_then(|_| self.leaves.get(self.current))
    }
}

impl PostingsEnum for GlobalPostings {
    fn doc(&self) -> u32 {
        self.doc.unwrap_or(0)
    }

    fn next_doc(&mut self) -> Result<u32> {
        while let Some(leaf) = self.leaves.get_mut(self.current) {
            let local = leaf.postings.next_doc()?;
            let local = leaf.settle(local)?;
            if local != NO_MORE_DOCS {
                let doc = leaf.base + local;
                self.doc = Some(doc);
                return Ok(doc);
            }
            self.current += 1;
        }
        Ok(self.exhaust())
    }

    fn advance(&mut self, target: u32) -> Result<u32> {
        while let Some(leaf) = self.leaves.get_mut(self.current) {
            if target >= leaf.base + leaf.max_doc {
                self.current += 1;
                continue;
            }
            let local_target = target.saturating_sub(leaf.base);
            let local = match leaf.doc {
                Some(doc) if doc >= local_target => doc,
                _ => leaf.postings.advance(local_target)?,
            };
            let local = leaf.settle(local)?;
            if local != NO_MORE_DOCS {
                let doc = leaf.base + local;
                self.doc = Some(doc);
                return Ok(doc);
            }
            self.current += 1;
        }
        Ok(self.exhaust())
    }

    fn freq(&self) -> u32 {
        self.current_leaf().map_or(0, |leaf| leaf.postings.freq())
    }

    fn next_position(&mut self) -> Result<u32> {
        match self.leaves.get_mut(self.current) {
            Some(leaf) => leaf.postings.next_position(),
            None => Err(TesseraError::illegal_state("postings are exhausted")),
        }
    }

    fn offsets(&self) -> Option<(u32, u32)> {
        self.current_leaf().and_then(|leaf| leaf.postings.offsets())
    }

    fn payload(&self) -> Option<&[u8]> {
        self.current_leaf().and_then(|leaf| leaf.postings.payload())
    }

    fn cost(&self) -> u64 {
        self.leaves.iter().map(|leaf| leaf.postings.cost()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;
    use crate::index::field_infos::VectorSimilarity;
    use crate::index::index_writer::IndexWriter;
    use crate::index::index_writer_config::IndexWriterConfig;
    use crate::index::merge_policy::NoMergePolicy;
    use crate::index::merge_scheduler::SerialMergeScheduler;
    use crate::search::query::{BooleanQuery, MatchAllDocsQuery, NumericRangeQuery, TermQuery};
    use crate::storage::Storage;
    use crate::storage::memory::MemoryStorage;

    fn writer(storage: &Arc<dyn Storage>) -> IndexWriter {
        let config = IndexWriterConfig::new()
            .with_merge_policy(Arc::new(NoMergePolicy))
            .with_merge_scheduler(Arc::new(SerialMergeScheduler::new()));
        IndexWriter::open(Arc::clone(storage), config).unwrap()
    }

    fn doc(id: u32, text: &str) -> Document {
        Document::builder()
            .add_keyword("id", id.to_string())
            .add_text("text", text)
            .add_numeric("rank", i64::from(id))
            .add_float_vector("embedding", vec![id as f32, 1.0], VectorSimilarity::Euclidean)
            .build()
    }

    /// Three segments: ids 0-2, 3-4 and 5, with 1 and 3 deleted.
    fn searcher() -> IndexSearcher {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::default());
        let writer = writer(&storage);
        writer
            .add_documents(&[doc(0, "a b"), doc(1, "a c"), doc(2, "b c")])
            .unwrap();
        writer.commit().unwrap();
        writer.add_documents(&[doc(3, "a"), doc(4, "a b c")]).unwrap();
        writer.commit().unwrap();
        writer.add_document(&doc(5, "c a")).unwrap();
        writer
            .delete_documents(&[Term::new("id", "1"), Term::new("id", "3")])
            .unwrap();
        writer.close().unwrap();
        IndexSearcher::new(DirectoryReader::open(storage).unwrap())
    }

    fn drain(postings: &mut GlobalPostings) -> Vec<u32> {
        let mut docs = Vec::new();
        loop {
            let doc = postings.next_doc().unwrap();
            if doc == NO_MORE_DOCS {
                return docs;
            }
            docs.push(doc);
        }
    }

    #[test]
    fn test_postings_skip_deleted_docs() {
        let searcher = searcher();
        assert_eq!(searcher.reader().leaves().len(), 3);
        let mut postings = searcher.postings(&Term::new("text", "a")).unwrap().unwrap();
        assert_eq!(drain(&mut postings), vec![0, 4, 5]);
        assert_eq!(searcher.doc_freq(&Term::new("text", "a")).unwrap(), 5);
        assert!(searcher.postings(&Term::new("text", "zzz")).unwrap().is_none());
    }

    #[test]
    fn test_postings_advance_across_segments() {
        let searcher = searcher();
        let mut postings = searcher.postings(&Term::new("text", "c")).unwrap().unwrap();
        assert_eq!(postings.advance(2).unwrap(), 2);
        assert_eq!(postings.freq(), 1);
        assert_eq!(postings.advance(3).unwrap(), 4);
        assert_eq!(postings.advance(5).unwrap(), 5);
        assert_eq!(postings.next_doc().unwrap(), NO_MORE_DOCS);
    }

    #[test]
    fn test_search_and_count() {
        let searcher = searcher();
        assert_eq!(searcher.search(&MatchAllDocsQuery).unwrap(), vec![0, 2, 4, 5]);
        assert_eq!(searcher.count(&TermQuery::new(Term::new("text", "b"))).unwrap(), 3);

        let mut query = BooleanQuery::new();
        query.add_must(Box::new(TermQuery::new(Term::new("text", "a"))));
        query.add_must_not(Box::new(NumericRangeQuery::new("rank", Some(5), None)));
        assert_eq!(searcher.search(&query).unwrap(), vec![0, 4]);
    }

    #[test]
    fn test_per_document_lookups() {
        let searcher = searcher();
        assert_eq!(searcher.numeric_doc_value("rank", 4).unwrap(), Some(4));
        assert!(!searcher.is_live(1).unwrap());
        let stored = searcher.document(2).unwrap();
        assert!(stored.iter().any(|f| f.name == "text"));
        assert_eq!(
            searcher.vector("embedding", 5).unwrap(),
            Some(VectorValue::Float(vec![5.0, 1.0]))
        );
        assert!(searcher.document(6).is_err());
    }

    #[test]
    fn test_knn_merges_segments() {
        let searcher = searcher();
        let hits = searcher.knn("embedding", &[3.2, 1.0], 2).unwrap();
        let docs: Vec<u32> = hits.iter().map(|(doc, _)| *doc).collect();
        assert_eq!(docs, vec![4, 2]);
    }
}
