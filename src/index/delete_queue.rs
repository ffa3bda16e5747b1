//! Sequence-numbered deletes and doc-values updates.
//!
//! Every delete or update gets a sequence number from the same counter as
//! added documents. An operation with sequence number `s` affects exactly
//! the documents whose sequence number is lower than `s`. Operations are
//! buffered here and applied lazily to each segment's live docs and
//! doc-values overlay; postings are never rewritten.

use std::fmt;
use std::sync::Arc;

use bit_vec::BitVec;

use crate::codec::{NumericUpdates, PostingsEnum, NO_MORE_DOCS};
use crate::error::Result;
use crate::index::segment_reader::{SegmentCoreReaders, SegmentReader};
use crate::index::segment_info::SegmentCommitInfo;
use crate::index::term::Term;
use crate::search::query::Query;

/// One buffered operation.
pub enum UpdateOp {
    /// Delete documents containing the term.
    DeleteTerm(Term),
    /// Delete documents matching the query.
    DeleteQuery(Box<dyn Query>),
    /// Delete every document.
    DeleteAll,
    /// Set a numeric doc value on documents containing the term.
    NumericUpdate { term: Term, field: String, value: i64 },
}

impl fmt::Debug for UpdateOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateOp::DeleteTerm(term) => write!(f, "DeleteTerm({term})"),
            UpdateOp::DeleteQuery(query) => write!(f, "DeleteQuery({})", query.description()),
            UpdateOp::DeleteAll => write!(f, "DeleteAll"),
            UpdateOp::NumericUpdate { term, field, value } => {
                write!(f, "NumericUpdate({term}, {field}={value})")
            }
        }
    }
}

/// An operation and its sequence number.
#[derive(Debug, Clone)]
pub struct QueuedOp {
    pub seq: u64,
    pub op: Arc<UpdateOp>,
}

/// Pending operations ordered by sequence number.
#[derive(Debug, Default)]
pub struct DeleteQueue {
    ops: Vec<QueuedOp>,
}

impl DeleteQueue {
    pub fn new() -> Self {
        DeleteQueue::default()
    }

    /// Buffer `op` under `seq`, keeping the queue ordered.
    pub fn push(&mut self, seq: u64, op: UpdateOp) {
        let at = self.ops.partition_point(|o| o.seq <= seq);
        self.ops.insert(
            at,
            QueuedOp {
                seq,
                op: Arc::new(op),
            },
        );
    }

    /// Operations with `after < seq <= upto`.
    pub fn ops_in(&self, after: u64, upto: u64) -> Vec<QueuedOp> {
        let start = self.ops.partition_point(|o| o.seq <= after);
        self.ops[start..]
            .iter()
            .take_while(|o| o.seq <= upto)
            .cloned()
            .collect()
    }

    /// Forget operations with `seq <= upto`.
    pub fn prune(&mut self, upto: u64) {
        let end = self.ops.partition_point(|o| o.seq <= upto);
        self.ops.drain(..end);
    }

    pub fn clear(&mut self) {
        self.ops.clear();
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// What applying a batch of operations changed in one segment.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ApplyResult {
    /// Documents newly marked deleted.
    pub new_deletes: u32,
    /// Doc-value updates written to the overlay.
    pub dv_updates: u32,
}

/// Apply `ops` to one segment's live docs and doc-values overlay.
///
/// `doc_seqs` holds the sequence number of every document of a freshly
/// flushed segment; without it every document predates the operations.
pub fn apply_to_segment(
    core: &Arc<SegmentCoreReaders>,
    info: &SegmentCommitInfo,
    doc_seqs: Option<&[u64]>,
    ops: &[QueuedOp],
    live: &mut BitVec,
    dv: &mut NumericUpdates,
) -> Result<ApplyResult> {
    let mut result = ApplyResult::default();
    let affects = |doc: u32, seq: u64| doc_seqs.is_none_or(|seqs| seqs[doc as usize] < seq);

    for queued in ops {
        match &*queued.op {
            UpdateOp::DeleteTerm(term) => {
                let reader = view(core, info, live, dv)?;
                if let Some(mut postings) = reader.postings(term)? {
                    for doc in drain(&mut *postings)? {
                        if affects(doc, queued.seq) && live.get(doc as usize) == Some(true) {
                            live.set(doc as usize, false);
                            result.new_deletes += 1;
                        }
                    }
                }
            }
            UpdateOp::DeleteQuery(query) => {
                let reader = view(core, info, live, dv)?;
                for doc in query.matches(&reader)? {
                    if affects(doc, queued.seq) && live.get(doc as usize) == Some(true) {
                        live.set(doc as usize, false);
                        result.new_deletes += 1;
                    }
                }
            }
            UpdateOp::DeleteAll => {
                for doc in 0..live.len() as u32 {
                    if affects(doc, queued.seq) && live.get(doc as usize) == Some(true) {
                        live.set(doc as usize, false);
                        result.new_deletes += 1;
                    }
                }
            }
            UpdateOp::NumericUpdate { term, field, value } => {
                let reader = view(core, info, live, dv)?;
                if let Some(mut postings) = reader.postings(term)? {
                    let docs: Vec<u32> = drain(&mut *postings)?
                        .into_iter()
                        .filter(|&doc| affects(doc, queued.seq))
                        .collect();
                    if !docs.is_empty() {
                        let column = dv.entry(field.clone()).or_default();
                        for doc in docs {
                            column.insert(doc, *value);
                            result.dv_updates += 1;
                        }
                    }
                }
            }
        }
    }
    Ok(result)
}

fn view(
    core: &Arc<SegmentCoreReaders>,
    info: &SegmentCommitInfo,
    live: &BitVec,
    dv: &NumericUpdates,
) -> Result<SegmentReader> {
    SegmentReader::new(
        Arc::clone(core),
        info.clone(),
        Arc::new(live.clone()),
        Arc::new(dv.clone()),
    )
}

fn drain(postings: &mut dyn PostingsEnum) -> Result<Vec<u32>> {
    let mut docs = Vec::new();
    loop {
        let doc = postings.next_doc()?;
        if doc == NO_MORE_DOCS {
            return Ok(docs);
        }
        docs.push(doc);
    }
}
