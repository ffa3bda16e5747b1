mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use common::*;
use tessera::analysis::{Analyzer, StandardAnalyzer, TokenStream};
use tessera::document::Document;
use tessera::error::TesseraError;
use tessera::index::{DirectoryReader, IndexWriter, OpenMode, SegmentInfos, Term};
use tessera::search::{IndexSearcher, NumericRangeQuery, TermQuery};

#[test]
fn test_delete_then_reopen_shows_remaining_document() {
    let storage = memory_storage();
    let writer = IndexWriter::open(Arc::clone(&storage), serial_config()).unwrap();
    writer.add_document(&text_doc("a b c")).unwrap();
    writer.add_document(&text_doc("a c e")).unwrap();
    writer.commit().unwrap();

    let reader = DirectoryReader::open(Arc::clone(&storage)).unwrap();
    assert_eq!(reader.num_docs(), 2);
    assert_eq!(reader.doc_freq(&Term::new("body", "a")).unwrap(), 2);
    reader.close().unwrap();

    writer.delete_documents(&[Term::new("body", "b")]).unwrap();
    writer.commit().unwrap();

    let reader = DirectoryReader::open(Arc::clone(&storage)).unwrap();
    assert_eq!(reader.num_docs(), 1);
    assert_eq!(reader.max_doc(), 2);
    let searcher = IndexSearcher::new(reader);
    assert_eq!(searcher.count(&TermQuery::new(Term::new("body", "e"))).unwrap(), 1);
    assert_eq!(searcher.count(&TermQuery::new(Term::new("body", "b"))).unwrap(), 0);
    assert_eq!(searcher.count(&TermQuery::new(Term::new("body", "a"))).unwrap(), 1);
    let hits = searcher.search(&TermQuery::new(Term::new("body", "c"))).unwrap();
    assert_eq!(hits.len(), 1);
    let stored = searcher.document(hits[0]).unwrap();
    assert_eq!(stored[0].value.as_text(), Some("a c e"));
    searcher.reader().close().unwrap();
    writer.close().unwrap();
}

#[test]
fn test_delete_only_affects_earlier_documents() {
    let storage = memory_storage();
    let writer = IndexWriter::open(Arc::clone(&storage), serial_config()).unwrap();
    writer.add_document(&id_doc("1", "old")).unwrap();
    writer.delete_documents(&[Term::new("body", "old")]).unwrap();
    writer.add_document(&id_doc("2", "old")).unwrap();
    writer.commit().unwrap();
    assert_eq!(committed_ids(storage), vec!["2"]);
}

#[test]
fn test_update_document_replaces_by_term() {
    let storage = memory_storage();
    let writer = IndexWriter::open(Arc::clone(&storage), serial_config()).unwrap();
    writer.add_document(&id_doc("1", "first version")).unwrap();
    writer.add_document(&id_doc("2", "other")).unwrap();
    writer.flush().unwrap();
    writer
        .update_document(Term::new("id", "1"), &id_doc("1", "second version"))
        .unwrap();
    writer.commit().unwrap();

    let reader = DirectoryReader::open(Arc::clone(&storage)).unwrap();
    assert_eq!(reader.num_docs(), 2);
    assert_eq!(count_body(reader, "first"), 0);
    let reader = DirectoryReader::open(Arc::clone(&storage)).unwrap();
    assert_eq!(count_body(reader, "second"), 1);
    writer.close().unwrap();
}

#[test]
fn test_update_documents_keeps_block_together() {
    let storage = memory_storage();
    let writer = IndexWriter::open(Arc::clone(&storage), serial_config()).unwrap();
    let block = vec![id_doc("p", "parent"), id_doc("c1", "child"), id_doc("c2", "child")];
    writer.add_documents(&block).unwrap();
    writer.commit().unwrap();

    let replacement = vec![id_doc("p", "parent v2"), id_doc("c3", "child v2")];
    writer
        .update_documents(Term::new("body", "parent"), &replacement)
        .unwrap();
    writer.commit().unwrap();

    let reader = DirectoryReader::open(Arc::clone(&storage)).unwrap();
    assert_eq!(live_ids(&reader), vec!["c1", "c2", "c3", "p"]);
    reader.close().unwrap();
    writer.close().unwrap();
}

#[test]
fn test_delete_by_query() {
    let storage = memory_storage();
    let writer = IndexWriter::open(Arc::clone(&storage), serial_config()).unwrap();
    for i in 0..10 {
        let doc = Document::builder()
            .add_keyword("id", i.to_string())
            .add_numeric("price", i * 10)
            .build();
        writer.add_document(&doc).unwrap();
    }
    writer.commit().unwrap();
    writer
        .delete_documents_query(Box::new(NumericRangeQuery::new("price", Some(30), Some(60))))
        .unwrap();
    writer.commit().unwrap();

    assert_eq!(
        committed_ids(Arc::clone(&storage)),
        vec!["0", "1", "2", "7", "8", "9"]
    );
    writer.close().unwrap();
}

#[test]
fn test_numeric_doc_value_update() {
    let storage = memory_storage();
    let writer = IndexWriter::open(Arc::clone(&storage), serial_config()).unwrap();
    for i in 0..3 {
        let doc = Document::builder()
            .add_keyword("id", i.to_string())
            .add_numeric("rank", i)
            .build();
        writer.add_document(&doc).unwrap();
    }
    writer.commit().unwrap();
    writer
        .update_numeric_doc_value(Term::new("id", "1"), "rank", 100)
        .unwrap();
    writer.commit().unwrap();

    let searcher = IndexSearcher::new(DirectoryReader::open(Arc::clone(&storage)).unwrap());
    let hits = searcher
        .search(&TermQuery::new(Term::new("id", "1")))
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(searcher.numeric_doc_value("rank", hits[0]).unwrap(), Some(100));
    let others = searcher
        .search(&TermQuery::new(Term::new("id", "2")))
        .unwrap();
    assert_eq!(searcher.numeric_doc_value("rank", others[0]).unwrap(), Some(2));
    searcher.reader().close().unwrap();
    writer.close().unwrap();
}

#[test]
fn test_delete_all() {
    let storage = memory_storage();
    let writer = IndexWriter::open(Arc::clone(&storage), serial_config()).unwrap();
    writer.add_document(&text_doc("gone")).unwrap();
    writer.commit().unwrap();
    writer.add_document(&text_doc("gone too")).unwrap();
    writer.delete_all().unwrap();
    writer.add_document(&text_doc("kept")).unwrap();
    writer.commit().unwrap();

    let reader = DirectoryReader::open(Arc::clone(&storage)).unwrap();
    assert_eq!(reader.num_docs(), 1);
    assert_eq!(count_body(reader, "kept"), 1);
    writer.close().unwrap();
}

#[test]
fn test_commit_user_data_is_carried_over() {
    let storage = memory_storage();
    let writer = IndexWriter::open(Arc::clone(&storage), serial_config()).unwrap();
    writer.add_document(&text_doc("x")).unwrap();
    let user_data = BTreeMap::from([("checkpoint".to_string(), "42".to_string())]);
    writer.commit_with_user_data(user_data.clone()).unwrap();
    writer.add_document(&text_doc("y")).unwrap();
    writer.commit().unwrap();

    let infos = SegmentInfos::read_latest(storage.as_ref()).unwrap();
    assert_eq!(infos.generation, 2);
    assert_eq!(infos.user_data, user_data);
    assert_eq!(writer.commit_user_data(), user_data);
    writer.close().unwrap();
}

#[test]
fn test_create_mode_replaces_existing_index() {
    let storage = memory_storage();
    build_segments(Arc::clone(&storage), 2, 3);

    let writer = IndexWriter::open(
        Arc::clone(&storage),
        serial_config().with_open_mode(OpenMode::Create),
    )
    .unwrap();
    assert_eq!(writer.num_docs(), 0);
    // The old commit stays visible until the new one lands.
    assert_eq!(committed_ids(Arc::clone(&storage)).len(), 6);

    writer.add_document(&id_doc("fresh", "new index")).unwrap();
    writer.commit().unwrap();
    assert_eq!(committed_ids(Arc::clone(&storage)), vec!["fresh"]);
    assert!(writer.last_commit_generation() > 1);
    writer.close().unwrap();
}

#[test]
fn test_close_commits_by_default() {
    let storage = memory_storage();
    let writer = IndexWriter::open(Arc::clone(&storage), serial_config()).unwrap();
    writer.add_document(&id_doc("1", "pending")).unwrap();
    writer.close().unwrap();
    assert_eq!(committed_ids(Arc::clone(&storage)), vec!["1"]);

    let writer = IndexWriter::open(
        Arc::clone(&storage),
        serial_config().with_commit_on_close(false),
    )
    .unwrap();
    writer.add_document(&id_doc("2", "discarded")).unwrap();
    writer.close().unwrap();
    assert_eq!(committed_ids(storage), vec!["1"]);
}

#[test]
fn test_flush_by_doc_count_creates_segments() {
    let storage = memory_storage();
    let writer = IndexWriter::open(
        Arc::clone(&storage),
        no_merge_config().with_max_buffered_docs(Some(5)),
    )
    .unwrap();
    for i in 0..23 {
        writer.add_document(&id_doc(&i.to_string(), "doc")).unwrap();
    }
    assert!(writer.segment_count() >= 4);
    assert_eq!(writer.num_docs(), 23);
    writer.commit().unwrap();
    assert_eq!(writer.segment_count(), 5);
    let infos = SegmentInfos::read_latest(storage.as_ref()).unwrap();
    assert_eq!(infos.total_num_docs(), 23);
    writer.close().unwrap();
}

#[test]
fn test_term_length_limit() {
    let storage = memory_storage();
    let writer = IndexWriter::open(storage, serial_config().with_max_term_length(8)).unwrap();
    let doc = Document::builder()
        .add_keyword("id", "much-too-long-keyword")
        .build();
    let err = writer.add_document(&doc).unwrap_err();
    assert!(matches!(err, TesseraError::IllegalArgument(_)));
    // The writer keeps working after a rejected document.
    writer.add_document(&id_doc("ok", "fine")).unwrap();
    writer.commit().unwrap();
    assert_eq!(writer.num_docs(), 1);
    writer.close().unwrap();
}

/// Fails on any text containing "boom".
#[derive(Debug)]
struct FailingAnalyzer;

impl Analyzer for FailingAnalyzer {
    fn token_stream<'a>(&self, field: &str, text: &'a str) -> tessera::Result<TokenStream<'a>> {
        if text.contains("boom") {
            return Err(TesseraError::analysis(format!("cannot analyze {field}")));
        }
        StandardAnalyzer.token_stream(field, text)
    }

    fn name(&self) -> &'static str {
        "failing"
    }
}

#[test]
fn test_analysis_failure_discards_buffered_documents() {
    let storage = memory_storage();
    let writer = IndexWriter::open(
        Arc::clone(&storage),
        serial_config().with_analyzer(Arc::new(FailingAnalyzer)),
    )
    .unwrap();
    writer.add_document(&id_doc("1", "fine")).unwrap();
    let err = writer.add_document(&id_doc("2", "boom")).unwrap_err();
    assert!(matches!(err, TesseraError::Analysis(_)));
    assert!(writer.is_open());
    assert_eq!(writer.num_docs(), 0);

    writer.add_document(&id_doc("3", "fine again")).unwrap();
    writer.commit().unwrap();
    assert_eq!(committed_ids(Arc::clone(&storage)), vec!["3"]);
    writer.close().unwrap();
}
