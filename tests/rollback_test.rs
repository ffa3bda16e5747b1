mod common;

use std::sync::Arc;

use common::*;
use tessera::index::{DirectoryReader, IndexWriter, SegmentInfos, Term};
use tessera::storage::Storage;

#[test]
fn test_rollback_restores_last_commit() {
    let storage = memory_storage();
    let writer = IndexWriter::open(Arc::clone(&storage), serial_config()).unwrap();
    writer.add_document(&id_doc("1", "kept")).unwrap();
    writer.add_document(&id_doc("2", "kept")).unwrap();
    writer.commit().unwrap();

    writer.add_document(&id_doc("3", "discarded")).unwrap();
    writer.flush().unwrap();
    writer.delete_documents(&[Term::new("id", "1")]).unwrap();
    writer.add_document(&id_doc("4", "discarded")).unwrap();
    assert!(writer.has_uncommitted_changes());

    writer.rollback().unwrap();
    assert!(writer.is_open());
    assert!(!writer.has_uncommitted_changes());
    assert_eq!(writer.num_docs(), 2);

    let reader = writer.get_reader().unwrap();
    assert_eq!(live_ids(&reader), vec!["1", "2"]);
    reader.close().unwrap();

    // The writer keeps working after a rollback.
    writer.add_document(&id_doc("5", "after")).unwrap();
    writer.commit().unwrap();
    assert_eq!(committed_ids(Arc::clone(&storage)), vec!["1", "2", "5"]);
    writer.close().unwrap();
}

#[test]
fn test_rollback_removes_unreferenced_files() {
    let storage = memory_storage();
    let writer = IndexWriter::open(Arc::clone(&storage), serial_config()).unwrap();
    writer.add_document(&id_doc("1", "committed")).unwrap();
    writer.commit().unwrap();
    let committed_files = storage.list_files().unwrap();

    for i in 0..5 {
        writer.add_document(&id_doc(&format!("x{i}"), "flushed")).unwrap();
        writer.flush().unwrap();
    }
    assert!(storage.list_files().unwrap().len() > committed_files.len());

    writer.rollback().unwrap();
    assert_eq!(storage.list_files().unwrap(), committed_files);
    writer.close().unwrap();
}

#[test]
fn test_failed_commit_keeps_previous_commit() {
    let faulty = FaultyStorage::in_memory();
    let storage: Arc<dyn Storage> = faulty.clone();
    let writer = IndexWriter::open(Arc::clone(&storage), serial_config()).unwrap();
    writer.add_document(&id_doc("1", "first")).unwrap();
    writer.commit().unwrap();
    assert_eq!(writer.last_commit_generation(), 1);

    writer.add_document(&id_doc("2", "second")).unwrap();
    faulty.arm(Fault::new(FaultPoint::Rename).on_files("segments_").times(1));
    assert!(writer.commit().is_err());

    // Readers still see generation 1 and no pending commit file lingers.
    let infos = SegmentInfos::read_latest(storage.as_ref()).unwrap();
    assert_eq!(infos.generation, 1);
    assert_eq!(committed_ids(Arc::clone(&storage)), vec!["1"]);
    assert!(
        storage
            .list_files()
            .unwrap()
            .iter()
            .all(|name| !name.starts_with("pending_segments"))
    );
    assert_eq!(writer.last_commit_generation(), 1);

    // Retrying succeeds with the same changes.
    writer.commit().unwrap();
    assert_eq!(committed_ids(Arc::clone(&storage)), vec!["1", "2"]);
    assert!(writer.last_commit_generation() > 1);
    writer.close().unwrap();
}

#[test]
fn test_failed_sync_then_rollback() {
    let faulty = FaultyStorage::in_memory();
    let storage: Arc<dyn Storage> = faulty.clone();
    let writer = IndexWriter::open(Arc::clone(&storage), serial_config()).unwrap();
    writer.add_document(&id_doc("1", "first")).unwrap();
    writer.commit().unwrap();

    writer.add_document(&id_doc("2", "second")).unwrap();
    faulty.arm(Fault::new(FaultPoint::Sync));
    assert!(writer.commit().is_err());
    faulty.disarm();

    writer.rollback().unwrap();
    assert_eq!(writer.num_docs(), 1);
    writer.close().unwrap();
    assert_eq!(committed_ids(storage), vec!["1"]);
}

#[test]
fn test_failed_flush_discards_only_the_buffer() {
    let faulty = FaultyStorage::in_memory();
    let storage: Arc<dyn Storage> = faulty.clone();
    let writer = IndexWriter::open(Arc::clone(&storage), serial_config()).unwrap();
    writer.add_document(&id_doc("1", "committed")).unwrap();
    writer.commit().unwrap();

    writer.add_document(&id_doc("2", "lost")).unwrap();
    faulty.arm(Fault::new(FaultPoint::Write).on_files(".fdt").times(1));
    assert!(writer.flush().is_err());
    faulty.disarm();

    writer.add_document(&id_doc("3", "later")).unwrap();
    writer.commit().unwrap();
    let reader = DirectoryReader::open(Arc::clone(&storage)).unwrap();
    let ids = live_ids(&reader);
    assert!(ids.contains(&"1".to_string()));
    assert!(ids.contains(&"3".to_string()));
    reader.close().unwrap();
    writer.close().unwrap();
}
