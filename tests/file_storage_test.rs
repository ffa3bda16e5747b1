mod common;

use std::sync::Arc;

use tempfile::TempDir;

use common::*;
use tessera::error::TesseraError;
use tessera::index::{CheckIndex, DirectoryReader, IndexWriter, OpenMode, Term};
use tessera::storage::file::FileStorageConfig;
use tessera::storage::{Storage, StorageConfig, StorageFactory, WRITE_LOCK_NAME};

fn open_dir(dir: &TempDir, use_mmap: bool) -> Arc<dyn Storage> {
    let mut config = FileStorageConfig::new(dir.path());
    config.use_mmap = use_mmap;
    StorageFactory::create(StorageConfig::File(config)).unwrap()
}

#[test]
fn test_index_survives_reopen_on_disk() {
    let dir = TempDir::new().unwrap();
    {
        let storage = open_dir(&dir, false);
        let writer = IndexWriter::open(storage, serial_config()).unwrap();
        writer.add_document(&id_doc("1", "a b c")).unwrap();
        writer.add_document(&id_doc("2", "a c e")).unwrap();
        writer.commit().unwrap();
        writer.delete_documents(&[Term::new("body", "b")]).unwrap();
        writer.close().unwrap();
    }

    let storage = open_dir(&dir, true);
    // The closed writer released its lock.
    let mut lock = storage.obtain_lock(WRITE_LOCK_NAME).unwrap();
    lock.release().unwrap();
    let reader = DirectoryReader::open(Arc::clone(&storage)).unwrap();
    assert_eq!(live_ids(&reader), vec!["2"]);
    reader.close().unwrap();

    let status = CheckIndex::new(storage).check().unwrap();
    assert!(status.is_clean(), "{:?}", status.problems);
}

#[test]
fn test_write_lock_is_exclusive_on_disk() {
    let dir = TempDir::new().unwrap();
    let first = IndexWriter::open(open_dir(&dir, false), serial_config()).unwrap();
    let err = IndexWriter::open(open_dir(&dir, false), serial_config()).unwrap_err();
    assert!(matches!(err, TesseraError::LockObtainFailed(_)));
    first.close().unwrap();
    let second = IndexWriter::open(
        open_dir(&dir, false),
        serial_config().with_open_mode(OpenMode::Create),
    )
    .unwrap();
    second.close().unwrap();
}

#[test]
fn test_unreferenced_files_are_removed_on_open() {
    let dir = TempDir::new().unwrap();
    let storage = open_dir(&dir, false);
    build_segments(Arc::clone(&storage), 2, 5);

    // Leftovers of a crashed writer: a flushed segment nobody committed.
    let mut out = storage.create_output("_zz.fdt").unwrap();
    out.close().unwrap();

    let writer = IndexWriter::open(Arc::clone(&storage), serial_config()).unwrap();
    assert!(!storage.file_exists("_zz.fdt"));
    writer.close().unwrap();
    assert_eq!(committed_ids(storage).len(), 10);
}
