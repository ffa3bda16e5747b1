//! Criterion benchmarks for the tessera index engine.
//!
//! Covers the hot paths of the write side (analysis, buffering and
//! flushing, commits, merging) and term lookups on the read side.

use std::hint::black_box;
use std::sync::Arc;

use criterion::{BatchSize, Criterion, Throughput, criterion_group, criterion_main};
use tessera::analysis::{Analyzer, StandardAnalyzer};
use tessera::codec::postings::{NO_MORE_DOCS, PostingsEnum};
use tessera::document::Document;
use tessera::index::{
    DirectoryReader, IndexWriter, IndexWriterConfig, NoMergePolicy, SerialMergeScheduler, Term,
};
use tessera::search::{IndexSearcher, TermQuery};
use tessera::storage::Storage;
use tessera::storage::memory::MemoryStorage;

/// Generate test documents for benchmarking.
fn generate_test_documents(count: usize) -> Vec<String> {
    let words = [
        "segment", "merge", "flush", "commit", "term", "posting", "delete", "reader",
        "writer", "field", "codec", "checksum", "footer", "buffer", "policy", "tier",
        "scheduler", "thread", "sequence", "generation", "snapshot", "storage", "lock",
        "rename",
    ];

    (0..count)
        .map(|i| {
            let doc_length = 50 + (i % 100);
            (0..doc_length)
                .map(|j| words[(i * 7 + j * 13) % words.len()])
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect()
}

fn to_documents(texts: &[String]) -> Vec<Document> {
    texts
        .iter()
        .enumerate()
        .map(|(i, text)| {
            Document::builder()
                .add_keyword("id", i.to_string())
                .add_text("body", text.as_str())
                .add_numeric("length", text.len() as i64)
                .build()
        })
        .collect()
}

fn bench_config() -> IndexWriterConfig {
    IndexWriterConfig::new()
        .with_merge_policy(Arc::new(NoMergePolicy))
        .with_merge_scheduler(Arc::new(SerialMergeScheduler::new()))
}

/// Build an index of `segments` segments holding `docs` in total.
fn build_index(docs: &[Document], segments: usize) -> Arc<dyn Storage> {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::default());
    let writer = IndexWriter::open(Arc::clone(&storage), bench_config()).unwrap();
    let per_segment = docs.len().div_ceil(segments);
    for chunk in docs.chunks(per_segment) {
        writer.add_documents(chunk).unwrap();
        writer.flush().unwrap();
    }
    writer.commit().unwrap();
    writer.close().unwrap();
    storage
}

fn bench_analysis(c: &mut Criterion) {
    let mut group = c.benchmark_group("analysis");
    let analyzer = StandardAnalyzer;
    let texts = generate_test_documents(100);

    group.throughput(Throughput::Elements(100));
    group.bench_function("standard_analyzer_100_docs", |b| {
        b.iter(|| {
            let mut tokens = 0usize;
            for text in &texts {
                tokens += analyzer.token_stream("body", black_box(text)).unwrap().count();
            }
            black_box(tokens)
        })
    });
    group.finish();
}

fn bench_indexing(c: &mut Criterion) {
    let mut group = c.benchmark_group("indexing");
    group.sample_size(20);
    let docs = to_documents(&generate_test_documents(1000));

    group.throughput(Throughput::Elements(docs.len() as u64));
    group.bench_function("add_and_commit_1000_docs", |b| {
        b.iter_batched(
            || Arc::new(MemoryStorage::default()) as Arc<dyn Storage>,
            |storage| {
                let writer = IndexWriter::open(storage, bench_config()).unwrap();
                for doc in &docs {
                    writer.add_document(doc).unwrap();
                }
                writer.commit().unwrap();
                writer.close().unwrap();
            },
            BatchSize::SmallInput,
        )
    });

    group.bench_function("update_by_id_1000_docs", |b| {
        b.iter_batched(
            || build_index(&docs, 1),
            |storage| {
                let writer = IndexWriter::open(storage, bench_config()).unwrap();
                for (i, doc) in docs.iter().enumerate() {
                    writer
                        .update_document(Term::new("id", i.to_string()), doc)
                        .unwrap();
                }
                writer.commit().unwrap();
                writer.close().unwrap();
            },
            BatchSize::SmallInput,
        )
    });
    group.finish();
}

fn bench_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge");
    group.sample_size(10);
    let docs = to_documents(&generate_test_documents(2000));

    group.throughput(Throughput::Elements(docs.len() as u64));
    group.bench_function("force_merge_10_segments", |b| {
        b.iter_batched(
            || build_index(&docs, 10),
            |storage| {
                let config = IndexWriterConfig::new()
                    .with_merge_scheduler(Arc::new(SerialMergeScheduler::new()));
                let writer = IndexWriter::open(storage, config).unwrap();
                writer.force_merge(1).unwrap();
                writer.commit().unwrap();
                writer.close().unwrap();
            },
            BatchSize::LargeInput,
        )
    });
    group.finish();
}

fn bench_search(c: &mut Criterion) {
    let mut group = c.benchmark_group("search");
    let docs = to_documents(&generate_test_documents(5000));
    let storage = build_index(&docs, 5);
    let searcher = IndexSearcher::new(DirectoryReader::open(storage).unwrap());
    let term = Term::new("body", "checksum");

    group.bench_function("doc_freq", |b| {
        b.iter(|| black_box(searcher.doc_freq(black_box(&term)).unwrap()))
    });

    group.bench_function("iterate_postings", |b| {
        b.iter(|| {
            let mut postings = searcher.postings(&term).unwrap().unwrap();
            let mut hits = 0u32;
            while postings.next_doc().unwrap() != NO_MORE_DOCS {
                hits += 1;
            }
            black_box(hits)
        })
    });

    let query = TermQuery::new(term.clone());
    group.bench_function("term_query_count", |b| {
        b.iter(|| black_box(searcher.count(&query).unwrap()))
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_analysis,
    bench_indexing,
    bench_merge,
    bench_search
);
criterion_main!(benches);
