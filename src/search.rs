//! Read-side API: queries and the searcher that runs them.
//!
//! Queries only match; there is no scoring. The same query types drive
//! delete-by-query in the writer.

pub mod query;
pub mod searcher;

pub use query::{
    BooleanClause, BooleanQuery, MatchAllDocsQuery, NumericRangeQuery, Occur, Query, TermQuery,
};
pub use searcher::{GlobalPostings, IndexSearcher};
