mod common;

use std::sync::Arc;

use common::*;
use tessera::index::{DirectoryReader, IndexWriter, Term};

#[test]
fn test_nrt_reader_sees_uncommitted_changes() {
    let storage = memory_storage();
    let writer = IndexWriter::open(Arc::clone(&storage), serial_config()).unwrap();
    writer.add_document(&id_doc("1", "visible before commit")).unwrap();

    let reader = DirectoryReader::open_from_writer(&writer).unwrap();
    assert!(reader.is_near_real_time());
    assert_eq!(reader.num_docs(), 1);
    assert!(DirectoryReader::open(Arc::clone(&storage)).is_err());

    writer.delete_documents(&[Term::new("id", "1")]).unwrap();
    let reopened = DirectoryReader::open_if_changed_from_writer(&reader, &writer)
        .unwrap()
        .expect("delete must change the reader");
    assert_eq!(reopened.num_docs(), 0);
    // A segment without live documents is dropped.
    assert_eq!(reopened.max_doc(), 0);
    assert!(reopened.leaves().is_empty());
    // The old view is a point in time.
    assert_eq!(reader.num_docs(), 1);

    reader.close().unwrap();
    reopened.close().unwrap();
    writer.close().unwrap();
}

#[test]
fn test_open_if_changed_returns_none_without_changes() {
    let storage = memory_storage();
    let writer = IndexWriter::open(Arc::clone(&storage), serial_config()).unwrap();
    writer.add_document(&id_doc("1", "x")).unwrap();
    let reader = writer.get_reader().unwrap();
    assert!(writer.get_reader_if_changed(&reader).unwrap().is_none());
    assert!(DirectoryReader::open_if_changed(&reader).unwrap().is_none());
    reader.close().unwrap();
    writer.close().unwrap();
}

#[test]
fn test_open_if_changed_shares_segment_readers() {
    let storage = memory_storage();
    let writer = IndexWriter::open(Arc::clone(&storage), no_merge_config()).unwrap();
    for i in 0..3 {
        writer.add_document(&id_doc(&format!("a{i}"), "first")).unwrap();
    }
    writer.flush().unwrap();
    for i in 0..3 {
        writer.add_document(&id_doc(&format!("b{i}"), "second")).unwrap();
    }
    let first = writer.get_reader().unwrap();
    assert_eq!(first.leaves().len(), 2);

    writer.delete_documents(&[Term::new("id", "b1")]).unwrap();
    writer.add_document(&id_doc("c0", "third")).unwrap();
    let second = DirectoryReader::open_if_changed(&first).unwrap().unwrap();
    assert_eq!(second.leaves().len(), 3);
    assert_eq!(second.num_docs(), 6);

    // Unchanged segment: same reader. Changed segment: new reader, same core.
    assert!(Arc::ptr_eq(&first.leaves()[0], &second.leaves()[0]));
    assert!(!Arc::ptr_eq(&first.leaves()[1], &second.leaves()[1]));
    assert!(Arc::ptr_eq(first.leaves()[1].core(), second.leaves()[1].core()));

    first.close().unwrap();
    assert_eq!(live_ids(&second), vec!["a0", "a1", "a2", "b0", "b2", "c0"]);
    second.close().unwrap();
    writer.close().unwrap();
}

#[test]
fn test_committed_reader_reopens_after_commit() {
    let storage = memory_storage();
    build_segments(Arc::clone(&storage), 2, 2);
    let reader = DirectoryReader::open(Arc::clone(&storage)).unwrap();
    assert!(DirectoryReader::open_if_changed(&reader).unwrap().is_none());

    let writer = IndexWriter::open(Arc::clone(&storage), no_merge_config()).unwrap();
    writer.add_document(&id_doc("new", "x")).unwrap();
    writer.commit().unwrap();

    let reopened = DirectoryReader::open_if_changed(&reader).unwrap().unwrap();
    assert_eq!(reopened.num_docs(), 5);
    assert!(reopened.generation() > reader.generation());
    for (old, new) in reader.leaves().iter().zip(reopened.leaves()) {
        assert!(Arc::ptr_eq(old, new));
    }
    reader.close().unwrap();
    reopened.close().unwrap();
    writer.close().unwrap();
}

#[test]
fn test_reader_survives_merge_and_deletion_of_its_files() {
    let storage = memory_storage();
    build_segments(Arc::clone(&storage), 4, 5);
    let writer = IndexWriter::open(Arc::clone(&storage), serial_config()).unwrap();
    let reader = writer.get_reader().unwrap();

    writer.force_merge(1).unwrap();
    writer.commit().unwrap();

    // Pinned files of the old segments are still readable.
    assert_eq!(live_ids(&reader).len(), 20);
    let files_before_close = storage.list_files().unwrap();
    reader.close().unwrap();
    let files_after_close = storage.list_files().unwrap();
    assert!(files_after_close.len() < files_before_close.len());
    writer.close().unwrap();
}
