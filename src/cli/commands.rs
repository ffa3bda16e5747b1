//! Command implementations for the tessera CLI.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Instant;

use crossbeam_channel::bounded;
use log::{debug, info, warn};
use serde_json::Value;

use crate::cli::args::*;
use crate::cli::output::*;
use crate::codec::postings::{NO_MORE_DOCS, PostingsEnum};
use crate::document::{Document, StoredValue};
use crate::document::json::document_from_json;
use crate::error::{Result, TesseraError};
use crate::index::{
    CheckIndex, DirectoryReader, IndexWriter, IndexWriterConfig, OpenMode, SegmentInfos, Term,
    WriterSettings,
};
use crate::search::IndexSearcher;
use crate::storage::file::FileStorageConfig;
use crate::storage::{Storage, StorageConfig, StorageFactory};

/// Execute a CLI command.
pub fn execute_command(args: TesseraArgs) -> Result<()> {
    match &args.command {
        Command::Index(index_args) => index_documents(index_args, &args),
        Command::Stats(stats_args) => show_stats(stats_args, &args),
        Command::Check(check_args) => check_index(check_args, &args),
        Command::Merge(merge_args) => merge_index(merge_args, &args),
        Command::Search(search_args) => search_index(search_args, &args),
    }
}

fn open_storage(path: &Path) -> Result<Arc<dyn Storage>> {
    let mut config = FileStorageConfig::new(path);
    config.sync_writes = true;
    StorageFactory::create(StorageConfig::File(config))
}

fn open_existing_storage(path: &Path) -> Result<Arc<dyn Storage>> {
    if !path.is_dir() {
        return Err(TesseraError::index_not_found(format!(
            "no index directory at {}",
            path.display()
        )));
    }
    open_storage(path)
}

fn load_settings(path: Option<&Path>) -> Result<WriterSettings> {
    match path {
        Some(path) => {
            debug!("Loading writer settings from {}", path.display());
            WriterSettings::from_json(&fs::read_to_string(path)?)
        }
        None => Ok(WriterSettings::default()),
    }
}

fn parse_user_data(pairs: &[String]) -> Result<BTreeMap<String, String>> {
    pairs
        .iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .ok_or_else(|| {
                    TesseraError::illegal_argument(format!(
                        "user data must be KEY=VALUE, got {pair:?}"
                    ))
                })
        })
        .collect()
}

/// A parsed input line ready for the writer.
struct PendingDocument {
    line: usize,
    id: Option<Term>,
    doc: Document,
}

fn parse_line(
    line: &str,
    line_number: usize,
    keyword_fields: &[String],
    id_field: Option<&str>,
) -> Result<PendingDocument> {
    let value: Value = serde_json::from_str(line)?;
    let id = match id_field {
        Some(field) => {
            let id = match value.get(field) {
                Some(Value::String(text)) => text.clone(),
                Some(Value::Number(n)) => n.to_string(),
                _ => {
                    return Err(TesseraError::illegal_argument(format!(
                        "missing id field {field:?}"
                    )));
                }
            };
            Some(Term::new(field, id))
        }
        None => None,
    };
    Ok(PendingDocument {
        line: line_number,
        id,
        doc: document_from_json(&value, keyword_fields)?,
    })
}

/// Index JSON-lines documents with a pool of threads sharing one writer.
fn index_documents(args: &IndexArgs, cli_args: &TesseraArgs) -> Result<()> {
    let mut settings = load_settings(args.config.as_deref())?;
    if args.create {
        settings.open_mode = OpenMode::Create;
    }
    let config: IndexWriterConfig = settings.into_config()?;
    let user_data = parse_user_data(&args.user_data)?;

    // Keyword fields keep ids intact for update-by-term.
    let mut keyword_fields = args.keyword_fields.clone();
    if let Some(id_field) = &args.id_field {
        if !keyword_fields.contains(id_field) {
            keyword_fields.push(id_field.clone());
        }
    }

    let storage = open_storage(&args.index_path)?;
    let writer = IndexWriter::open(storage, config)?;
    info!(
        "Indexing {} into {}",
        args.documents.display(),
        args.index_path.display()
    );

    let input: Box<dyn BufRead + Send> = if args.documents.as_os_str() == "-" {
        Box::new(BufReader::new(io::stdin()))
    } else {
        Box::new(BufReader::new(File::open(&args.documents)?))
    };

    let start = Instant::now();
    let added = AtomicU64::new(0);
    let rejected = AtomicU64::new(0);
    let threads = args.threads.max(1);
    let (sender, receiver) = bounded::<PendingDocument>(threads * 64);

    let indexed: Result<()> = thread::scope(|scope| {
        let mut workers = Vec::with_capacity(threads);
        for _ in 0..threads {
            let receiver = receiver.clone();
            let writer = &writer;
            let added = &added;
            workers.push(scope.spawn(move || -> Result<()> {
                for pending in receiver {
                    match &pending.id {
                        Some(id) => writer.update_document(id.clone(), &pending.doc)?,
                        None => writer.add_document(&pending.doc)?,
                    };
                    let count = added.fetch_add(1, Ordering::Relaxed) + 1;
                    if count % 10_000 == 0 {
                        info!("Indexed {count} documents (line {})", pending.line);
                    }
                }
                Ok(())
            }));
        }
        drop(receiver);

        let mut read_result = Ok(());
        for (index, line) in input.lines().enumerate() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    read_result = Err(e.into());
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match parse_line(&line, index + 1, &keyword_fields, args.id_field.as_deref()) {
                Ok(pending) => {
                    // Workers hung up after an indexing error.
                    if sender.send(pending).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Skipping line {}: {e}", index + 1);
                    rejected.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        drop(sender);

        for worker in workers {
            worker
                .join()
                .map_err(|_| TesseraError::other("indexing thread panicked"))??;
        }
        read_result
    });

    if let Err(e) = indexed {
        warn!("Indexing failed, rolling back: {e}");
        writer.rollback()?;
        return Err(e);
    }

    writer.commit_with_user_data(user_data)?;
    let generation = writer.last_commit_generation();
    let segments = writer.segment_count();
    let num_docs = writer.num_docs();
    writer.close()?;

    let duration = start.elapsed();
    let documents_added = added.load(Ordering::Relaxed);
    let seconds = duration.as_secs_f64();
    output_result(
        &IndexingResult {
            documents_added,
            documents_rejected: rejected.load(Ordering::Relaxed),
            generation,
            segments,
            num_docs,
            duration_ms: duration.as_millis(),
            docs_per_second: if seconds > 0.0 {
                documents_added as f64 / seconds
            } else {
                0.0
            },
        },
        cli_args,
    )
}

fn show_stats(args: &StatsArgs, cli_args: &TesseraArgs) -> Result<()> {
    let storage = open_existing_storage(&args.index_path)?;
    let infos = SegmentInfos::read_latest(storage.as_ref())?;

    let mut segments = Vec::with_capacity(infos.len());
    let mut size_bytes = 0;
    for segment in &infos.segments {
        let size = segment.size_in_bytes(storage.as_ref())?;
        size_bytes += size;
        segments.push(SegmentStats {
            name: segment.name().to_string(),
            codec: segment.info.codec.clone(),
            max_doc: segment.max_doc(),
            del_count: segment.del_count,
            size_bytes: size,
            source: segment.info.source().map(str::to_string),
            del_gen: segment.del_gen,
            dv_gen: segment.dv_gen,
            diagnostics: args.diagnostics.then(|| segment.info.diagnostics.clone()),
        });
    }

    output_result(
        &IndexStats {
            generation: infos.generation,
            version: infos.version,
            total_max_doc: infos.total_max_doc(),
            total_num_docs: infos.total_num_docs(),
            size_bytes,
            user_data: infos.user_data.clone(),
            segments,
        },
        cli_args,
    )
}

fn check_index(args: &CheckArgs, cli_args: &TesseraArgs) -> Result<()> {
    let storage = open_existing_storage(&args.index_path)?;
    let mut checker = CheckIndex::new(storage);
    if let Some(threads) = args.threads {
        checker = checker.with_threads(threads);
    }
    let status = checker.check()?;
    output_result(&status, cli_args)?;

    if status.is_clean() {
        Ok(())
    } else {
        Err(TesseraError::corruption(
            status.segments_file.clone(),
            format!(
                "{} problems in {} segments",
                status.problems.len()
                    + status
                        .segments
                        .iter()
                        .map(|s| s.problems.len())
                        .sum::<usize>(),
                status.broken_segments().count()
            ),
        ))
    }
}

fn merge_index(args: &MergeArgs, cli_args: &TesseraArgs) -> Result<()> {
    let mut settings = load_settings(args.config.as_deref())?;
    settings.open_mode = OpenMode::Append;
    let config = settings.into_config()?;

    let storage = open_existing_storage(&args.index_path)?;
    let writer = IndexWriter::open(storage, config)?;
    let segments_before = writer.segment_count();
    let start = Instant::now();

    let merged = if args.only_deletes {
        info!("Merging away deletions in {}", args.index_path.display());
        writer.force_merge_deletes()
    } else {
        info!(
            "Merging {} down to {} segments",
            args.index_path.display(),
            args.max_segments
        );
        writer.force_merge(args.max_segments)
    };
    if let Err(e) = merged.and_then(|_| writer.commit().map(|_| ())) {
        writer.rollback()?;
        return Err(e);
    }

    let result = MergeResult {
        segments_before,
        segments_after: writer.segment_count(),
        num_docs: writer.num_docs(),
        generation: writer.last_commit_generation(),
        duration_ms: start.elapsed().as_millis(),
    };
    writer.close()?;
    output_result(&result, cli_args)
}

fn stored_to_json(value: &StoredValue) -> Value {
    match value {
        StoredValue::Text(text) => Value::String(text.clone()),
        StoredValue::Long(n) => Value::from(*n),
        StoredValue::Double(f) => Value::from(*f),
        StoredValue::Bytes(bytes) => Value::String(
            bytes
                .iter()
                .map(|b| format!("{b:02x}"))
                .collect::<String>(),
        ),
    }
}

fn search_index(args: &SearchArgs, cli_args: &TesseraArgs) -> Result<()> {
    let storage = open_existing_storage(&args.index_path)?;
    let searcher = IndexSearcher::new(DirectoryReader::open(storage)?);
    let start = Instant::now();

    let term = Term::new(args.field.as_str(), &args.term);
    let doc_freq = searcher.doc_freq(&term)?;
    let mut hits = Vec::new();
    let mut total_hits = 0;
    if let Some(mut postings) = searcher.postings(&term)? {
        loop {
            let doc = postings.next_doc()?;
            if doc == NO_MORE_DOCS {
                break;
            }
            total_hits += 1;
            if hits.len() < args.limit {
                let mut fields: BTreeMap<String, Value> = BTreeMap::new();
                for field in searcher.document(doc)? {
                    let value = stored_to_json(&field.value);
                    match fields.remove(&field.name) {
                        Some(Value::Array(mut values)) => {
                            values.push(value);
                            fields.insert(field.name, Value::Array(values));
                        }
                        Some(previous) => {
                            fields.insert(field.name, Value::Array(vec![previous, value]));
                        }
                        None => {
                            fields.insert(field.name, value);
                        }
                    }
                }
                hits.push(SearchHit { doc, fields });
            }
        }
    }

    let results = SearchResults {
        field: args.field.clone(),
        term: args.term.clone(),
        doc_freq,
        total_hits,
        hits,
        duration_ms: start.elapsed().as_millis(),
    };
    searcher.reader().close()?;
    output_result(&results, cli_args)
}
