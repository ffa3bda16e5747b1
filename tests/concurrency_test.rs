mod common;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use common::*;
use tessera::index::{
    ConcurrentMergeScheduler, ConcurrentMergeSchedulerConfig, DirectoryReader, IndexWriter,
    IndexWriterConfig, Term, TieredMergePolicy,
};

const THREADS: usize = 4;
const DOCS_PER_THREAD: usize = 250;

fn busy_config() -> IndexWriterConfig {
    IndexWriterConfig::new()
        .with_max_buffered_docs(Some(37))
        .with_merge_policy(Arc::new(TieredMergePolicy::new(3, 3, u64::MAX)))
        .with_merge_scheduler(Arc::new(ConcurrentMergeScheduler::new(
            ConcurrentMergeSchedulerConfig {
                max_thread_count: 2,
                max_merge_count: 3,
                io_bytes_per_sec: None,
            },
        )))
}

#[test]
fn test_concurrent_adds_yield_union() {
    let storage = memory_storage();
    let writer = IndexWriter::open(Arc::clone(&storage), busy_config()).unwrap();

    thread::scope(|scope| {
        for t in 0..THREADS {
            let writer = &writer;
            scope.spawn(move || {
                for d in 0..DOCS_PER_THREAD {
                    writer
                        .add_document(&id_doc(&format!("t{t}-{d:03}"), "concurrent add"))
                        .unwrap();
                }
            });
        }
    });
    writer.commit().unwrap();
    writer.close().unwrap();

    let expected: Vec<String> = (0..THREADS)
        .flat_map(|t| (0..DOCS_PER_THREAD).map(move |d| format!("t{t}-{d:03}")))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    assert_eq!(committed_ids(storage), expected);
}

#[test]
fn test_concurrent_updates_leave_one_document_per_id() {
    let storage = memory_storage();
    let writer = IndexWriter::open(Arc::clone(&storage), busy_config()).unwrap();

    thread::scope(|scope| {
        for t in 0..THREADS {
            let writer = &writer;
            scope.spawn(move || {
                for round in 0..5 {
                    for id in 0..40 {
                        let doc = id_doc(&format!("id{id:02}"), &format!("thread{t} round{round}"));
                        writer
                            .update_document(Term::new("id", format!("id{id:02}")), &doc)
                            .unwrap();
                    }
                }
            });
        }
    });
    writer.commit().unwrap();
    writer.wait_for_merges().unwrap();

    let reader = DirectoryReader::open(Arc::clone(&storage)).unwrap();
    let ids = live_ids(&reader);
    assert_eq!(ids.len(), 40);
    assert_eq!(ids.iter().collect::<BTreeSet<_>>().len(), 40);
    reader.close().unwrap();
    writer.close().unwrap();
}

#[test]
fn test_readers_and_commits_during_indexing() {
    let storage = memory_storage();
    let writer = IndexWriter::open(Arc::clone(&storage), busy_config()).unwrap();
    let done = AtomicBool::new(false);

    thread::scope(|scope| {
        let writer = &writer;
        let done = &done;
        let indexers: Vec<_> = (0..2)
            .map(|t| {
                scope.spawn(move || {
                    for d in 0..300 {
                        writer
                            .add_document(&id_doc(&format!("w{t}-{d}"), "indexed while reading"))
                            .unwrap();
                    }
                })
            })
            .collect();
        scope.spawn(move || {
            let mut reader = writer.get_reader().unwrap();
            let mut last = reader.num_docs();
            while !done.load(Ordering::Acquire) {
                if let Some(next) = DirectoryReader::open_if_changed(&reader).unwrap() {
                    // Views only move forward.
                    assert!(next.num_docs() >= last);
                    last = next.num_docs();
                    reader.close().unwrap();
                    reader = next;
                }
                thread::yield_now();
            }
            reader.close().unwrap();
        });
        let committer = scope.spawn(move || {
            for _ in 0..5 {
                writer.commit().unwrap();
                thread::yield_now();
            }
        });
        for indexer in indexers {
            indexer.join().unwrap();
        }
        committer.join().unwrap();
        done.store(true, Ordering::Release);
    });

    writer.commit().unwrap();
    writer.close().unwrap();
    assert_eq!(committed_ids(storage).len(), 600);
}

#[test]
fn test_close_waits_for_indexing_threads_to_finish_merges() {
    let storage = memory_storage();
    let writer = Arc::new(IndexWriter::open(Arc::clone(&storage), busy_config()).unwrap());
    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let writer = Arc::clone(&writer);
            thread::spawn(move || {
                for d in 0..100 {
                    writer
                        .add_document(&id_doc(&format!("c{t}-{d}"), "then close"))
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    writer.close().unwrap();
    assert_eq!(writer.running_merge_count(), 0);
    assert_eq!(committed_ids(storage).len(), THREADS * 100);
}
