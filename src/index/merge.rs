//! Registered merges and the interface schedulers run them through.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::error::{Result, TesseraError};
use crate::index::merge_policy::{MergeCandidate, MergeReason};

/// Lifecycle of a registered merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeState {
    /// Registered, waiting for a scheduler.
    Pending,
    /// Running on some thread.
    Running,
    /// Merged segment replaced its sources.
    Committed,
    /// Stopped by rollback, close or delete-all.
    Aborted,
    /// Failed; sources stay live.
    Failed,
}

/// One merge of several segments into a new one.
///
/// The writer marks the sources as merging when it registers the merge and
/// unmarks them when the merge commits, aborts or fails.
pub struct OneMerge {
    id: u64,
    segments: Vec<String>,
    reason: MergeReason,
    estimated_bytes: u64,
    aborted: AtomicBool,
    state: Mutex<MergeState>,
    merged_name: Mutex<Option<String>>,
    started: Mutex<Option<Instant>>,
}

impl OneMerge {
    pub fn new(id: u64, candidate: MergeCandidate) -> Self {
        OneMerge {
            id,
            segments: candidate.segments,
            reason: candidate.reason,
            estimated_bytes: candidate.estimated_size,
            aborted: AtomicBool::new(false),
            state: Mutex::new(MergeState::Pending),
            merged_name: Mutex::new(None),
            started: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Names of the source segments.
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn reason(&self) -> MergeReason {
        self.reason
    }

    /// Estimated live bytes of the sources.
    pub fn estimated_bytes(&self) -> u64 {
        self.estimated_bytes
    }

    /// Ask the merge to stop at its next abort check.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Fail with `MergeAborted` once the merge was aborted.
    pub fn check_aborted(&self) -> Result<()> {
        if self.is_aborted() {
            return Err(TesseraError::merge_aborted(self.to_string()));
        }
        Ok(())
    }

    pub fn state(&self) -> MergeState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: MergeState) {
        if state == MergeState::Running {
            *self.started.lock() = Some(Instant::now());
        }
        *self.state.lock() = state;
    }

    /// Name of the segment being written, once allocated.
    pub fn merged_name(&self) -> Option<String> {
        self.merged_name.lock().clone()
    }

    pub fn set_merged_name(&self, name: &str) {
        *self.merged_name.lock() = Some(name.to_string());
    }

    /// Milliseconds since the merge started running.
    pub fn elapsed_ms(&self) -> u128 {
        self.started
            .lock()
            .map_or(0, |started| started.elapsed().as_millis())
    }
}

impl fmt::Display for OneMerge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "merge#{} [{}]", self.id, self.segments.join(","))?;
        if let Some(name) = self.merged_name.lock().as_deref() {
            write!(f, " -> {name}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for OneMerge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OneMerge")
            .field("id", &self.id)
            .field("segments", &self.segments)
            .field("reason", &self.reason)
            .field("state", &self.state())
            .field("aborted", &self.is_aborted())
            .finish()
    }
}

/// What a merge scheduler pulls merges from; implemented by the writer.
pub trait MergeSource: Send + Sync {
    /// Take the next pending merge, marking it running.
    fn next_merge(&self) -> Option<Arc<OneMerge>>;

    /// Give back a merge that will never run.
    fn on_merge_abandoned(&self, merge: &Arc<OneMerge>);

    fn pending_merge_count(&self) -> usize;

    fn running_merge_count(&self) -> usize;

    /// Execute `merge` on the calling thread and commit it.
    ///
    /// Failures are also recorded by the source itself.
    fn run_merge(&self, merge: &Arc<OneMerge>) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abort_and_display() {
        let merge = OneMerge::new(
            7,
            MergeCandidate {
                segments: vec!["_0".to_string(), "_1".to_string()],
                priority: 1.0,
                estimated_size: 100,
                reason: MergeReason::Tiered,
            },
        );
        assert_eq!(merge.state(), MergeState::Pending);
        assert!(merge.check_aborted().is_ok());
        merge.set_merged_name("_2");
        assert_eq!(merge.to_string(), "merge#7 [_0,_1] -> _2");
        merge.abort();
        assert!(matches!(
            merge.check_aborted(),
            Err(TesseraError::MergeAborted(_))
        ));
    }
}
