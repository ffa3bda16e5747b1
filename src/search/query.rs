//! Queries: the matching vocabulary shared by search and delete-by-query.
//!
//! A query evaluates against one segment at a time and returns the
//! segment-local doc ids it matches, ascending. Deleted documents are
//! included; callers filter by live docs where needed.

use std::collections::BTreeMap;
use std::fmt::Debug;

use crate::codec::NO_MORE_DOCS;
use crate::error::Result;
use crate::index::segment_reader::SegmentReader;
use crate::index::term::Term;

/// Trait for search queries.
pub trait Query: Send + Sync + Debug {
    /// Matching segment-local doc ids, ascending.
    fn matches(&self, reader: &SegmentReader) -> Result<Vec<u32>>;

    /// Get a human-readable description of this query.
    fn description(&self) -> String;

    /// Clone this query.
    fn clone_box(&self) -> Box<dyn Query>;
}

impl Clone for Box<dyn Query> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// Matches documents containing a term.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TermQuery {
    term: Term,
}

impl TermQuery {
    pub fn new(term: Term) -> Self {
        TermQuery { term }
    }

    pub fn term(&self) -> &Term {
        &self.term
    }
}

impl Query for TermQuery {
    fn matches(&self, reader: &SegmentReader) -> Result<Vec<u32>> {
        let Some(mut postings) = reader.postings(&self.term)? else {
            return Ok(Vec::new());
        };
        let mut docs = Vec::with_capacity(postings.cost() as usize);
        loop {
            let doc = postings.next_doc()?;
            if doc == NO_MORE_DOCS {
                break;
            }
            docs.push(doc);
        }
        Ok(docs)
    }

    fn description(&self) -> String {
        self.term.to_string()
    }

    fn clone_box(&self) -> Box<dyn Query> {
        Box::new(self.clone())
    }
}

/// Matches every document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MatchAllDocsQuery;

impl Query for MatchAllDocsQuery {
    fn matches(&self, reader: &SegmentReader) -> Result<Vec<u32>> {
        Ok((0..reader.max_doc()).collect())
    }

    fn description(&self) -> String {
        "*:*".to_string()
    }

    fn clone_box(&self) -> Box<dyn Query> {
        Box::new(*self)
    }
}

/// Matches documents whose numeric doc value lies in an inclusive range.
///
/// Updated doc values are honoured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NumericRangeQuery {
    field: String,
    min: Option<i64>,
    max: Option<i64>,
}

impl NumericRangeQuery {
    /// Open bounds are `None`.
    pub fn new<S: Into<String>>(field: S, min: Option<i64>, max: Option<i64>) -> Self {
        NumericRangeQuery {
            field: field.into(),
            min,
            max,
        }
    }

    /// Matches exactly `value`.
    pub fn exact<S: Into<String>>(field: S, value: i64) -> Self {
        NumericRangeQuery::new(field, Some(value), Some(value))
    }

    fn contains(&self, value: i64) -> bool {
        self.min.is_none_or(|min| value >= min) && self.max.is_none_or(|max| value <= max)
    }
}

impl Query for NumericRangeQuery {
    fn matches(&self, reader: &SegmentReader) -> Result<Vec<u32>> {
        let has_field = reader.field_infos().field(&self.field).is_some()
            || reader.dv_updates().contains_key(&self.field);
        if !has_field {
            return Ok(Vec::new());
        }
        let mut docs = Vec::new();
        for doc in 0..reader.max_doc() {
            if let Some(value) = reader.numeric_doc_value(&self.field, doc)? {
                if self.contains(value) {
                    docs.push(doc);
                }
            }
        }
        Ok(docs)
    }

    fn description(&self) -> String {
        let bound = |b: Option<i64>| b.map_or("*".to_string(), |v| v.to_string());
        format!("{}:[{} TO {}]", self.field, bound(self.min), bound(self.max))
    }

    fn clone_box(&self) -> Box<dyn Query> {
        Box::new(self.clone())
    }
}

/// Occurrence requirement of a boolean clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occur {
    /// The clause must match (equivalent to AND).
    Must,
    /// The clause should match (equivalent to OR).
    Should,
    /// The clause must not match (equivalent to NOT).
    MustNot,
}

/// A clause in a boolean query.
#[derive(Debug, Clone)]
pub struct BooleanClause {
    pub query: Box<dyn Query>,
    pub occur: Occur,
}

impl BooleanClause {
    pub fn new(query: Box<dyn Query>, occur: Occur) -> Self {
        BooleanClause { query, occur }
    }
}

/// Combines clauses with boolean logic.
///
/// Without `Must` clauses at least `minimum_should_match` (at least one)
/// `Should` clauses must match. A query made only of `MustNot` clauses
/// matches nothing.
#[derive(Debug, Clone, Default)]
pub struct BooleanQuery {
    clauses: Vec<BooleanClause>,
    minimum_should_match: usize,
}

impl BooleanQuery {
    pub fn new() -> Self {
        BooleanQuery::default()
    }

    pub fn add_clause(&mut self, clause: BooleanClause) {
        self.clauses.push(clause);
    }

    pub fn add_must(&mut self, query: Box<dyn Query>) {
        self.add_clause(BooleanClause::new(query, Occur::Must));
    }

    pub fn add_should(&mut self, query: Box<dyn Query>) {
        self.add_clause(BooleanClause::new(query, Occur::Should));
    }

    pub fn add_must_not(&mut self, query: Box<dyn Query>) {
        self.add_clause(BooleanClause::new(query, Occur::MustNot));
    }

    /// Set the minimum number of should clauses that must match.
    pub fn with_minimum_should_match(mut self, minimum: usize) -> Self {
        self.minimum_should_match = minimum;
        self
    }

    pub fn clauses(&self) -> &[BooleanClause] {
        &self.clauses
    }
}

fn intersect(a: &[u32], b: &[u32]) -> Vec<u32> {
    let (mut i, mut j) = (0, 0);
    let mut out = Vec::with_capacity(a.len().min(b.len()));
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                out.push(a[i]);
                i += 1;
                j += 1;
            }
        }
    }
    out
}

fn subtract(a: &[u32], b: &[u32]) -> Vec<u32> {
    let mut j = 0;
    a.iter()
        .copied()
        .filter(|doc| {
            while j < b.len() && b[j] < *doc {
                j += 1;
            }
            j >= b.len() || b[j] != *doc
        })
        .collect()
}

impl Query for BooleanQuery {
    fn matches(&self, reader: &SegmentReader) -> Result<Vec<u32>> {
        let mut must: Option<Vec<u32>> = None;
        let mut should_counts: BTreeMap<u32, usize> = BTreeMap::new();
        let mut should_clauses = 0;
        let mut excluded: Vec<u32> = Vec::new();

        for clause in &self.clauses {
            let docs = clause.query.matches(reader)?;
            match clause.occur {
                Occur::Must => {
                    must = Some(match must {
                        Some(current) => intersect(&current, &docs),
                        None => docs,
                    });
                }
                Occur::Should => {
                    should_clauses += 1;
                    for doc in docs {
                        *should_counts.entry(doc).or_default() += 1;
                    }
                }
                Occur::MustNot => {
                    excluded.extend(docs);
                }
            }
        }

        let required_should = if must.is_some() {
            self.minimum_should_match
        } else {
            self.minimum_should_match.max(1)
        };
        if required_should > should_clauses {
            return Ok(Vec::new());
        }
        let candidates = match must {
            Some(docs) if required_should == 0 => docs,
            Some(docs) => docs
                .into_iter()
                .filter(|d| should_counts.get(d).is_some_and(|&c| c >= required_should))
                .collect(),
            None => should_counts
                .into_iter()
                .filter(|&(_, count)| count >= required_should)
                .map(|(doc, _)| doc)
                .collect(),
        };
        excluded.sort_unstable();
        excluded.dedup();
        Ok(subtract(&candidates, &excluded))
    }

    fn description(&self) -> String {
        let parts: Vec<String> = self
            .clauses
            .iter()
            .map(|c| {
                let prefix = match c.occur {
                    Occur::Must => "+",
                    Occur::Should => "",
                    Occur::MustNot => "-",
                };
                format!("{prefix}{}", c.query.description())
            })
            .collect();
        format!("({})", parts.join(" "))
    }

    fn clone_box(&self) -> Box<dyn Query> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_operations() {
        assert_eq!(intersect(&[1, 3, 5, 7], &[3, 4, 7]), vec![3, 7]);
        assert_eq!(subtract(&[1, 3, 5, 7], &[3, 4, 7]), vec![1, 5]);
        assert_eq!(subtract(&[1, 2], &[]), vec![1, 2]);
    }

    #[test]
    fn test_descriptions() {
        let mut query = BooleanQuery::new();
        query.add_must(Box::new(TermQuery::new(Term::new("body", "a"))));
        query.add_must_not(Box::new(NumericRangeQuery::new("year", Some(2000), None)));
        assert_eq!(query.description(), "(+body:a -year:[2000 TO *])");
        assert_eq!(MatchAllDocsQuery.description(), "*:*");
    }
}
