//! # Tessera
//!
//! A segment-based inverted index engine.
//!
//! Documents are buffered in memory by concurrent indexing threads and
//! flushed into immutable segments. Deletions and doc-value updates are
//! recorded per segment generation, background merges fold small segments
//! into larger ones, and a two-phase commit publishes a new point-in-time
//! view that readers open without blocking the writer.
//!
//! ## Modules
//!
//! - [`storage`]: flat file namespace with atomic rename and a write lock
//! - [`codec`]: on-disk formats with checksummed headers and footers
//! - [`index`]: the writer, the merge machinery and the readers
//! - [`search`]: match-only queries and a searcher over a reader
//! - [`cli`]: the `tessera` command line tool
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use tessera::document::Document;
//! use tessera::index::{DirectoryReader, IndexWriter, IndexWriterConfig, Term};
//! use tessera::search::{IndexSearcher, TermQuery};
//! use tessera::storage::memory::MemoryStorage;
//!
//! let storage = Arc::new(MemoryStorage::default());
//! let writer = IndexWriter::open(storage.clone(), IndexWriterConfig::default()).unwrap();
//! writer
//!     .add_document(&Document::builder().add_text("body", "hello segments").build())
//!     .unwrap();
//! writer.commit().unwrap();
//!
//! let searcher = IndexSearcher::new(DirectoryReader::open(storage).unwrap());
//! let query = TermQuery::new(Term::new("body", "segments"));
//! assert_eq!(searcher.count(&query).unwrap(), 1);
//! writer.close().unwrap();
//! ```

pub mod analysis;
pub mod cli;
pub mod codec;
pub mod document;
pub mod error;
pub mod index;
pub mod search;
pub mod storage;
pub mod util;

pub use error::{Result, TesseraError};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
