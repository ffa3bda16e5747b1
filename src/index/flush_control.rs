//! RAM accounting for the per-thread buffers.
//!
//! Every buffer is either active (accepting documents) or flushing. A buffer
//! is picked for flushing when it reaches the buffered-docs limit or when the
//! active RAM exceeds the budget; indexing stalls while active plus flushing
//! RAM exceeds twice the budget and at least one flush is running.

use ahash::AHashMap;

/// Flush triggers and the RAM of every live buffer.
#[derive(Debug)]
pub struct FlushControl {
    ram_budget_bytes: Option<usize>,
    max_buffered_docs: Option<u32>,
    active: AHashMap<u64, usize>,
    flushing_bytes: usize,
    num_flushing: usize,
    stalls: u64,
}

impl FlushControl {
    pub fn new(ram_budget_bytes: Option<usize>, max_buffered_docs: Option<u32>) -> Self {
        FlushControl {
            ram_budget_bytes,
            max_buffered_docs,
            active: AHashMap::new(),
            flushing_bytes: 0,
            num_flushing: 0,
            stalls: 0,
        }
    }

    /// Record the current size of an active buffer.
    pub fn set_active(&mut self, id: u64, bytes: usize) {
        self.active.insert(id, bytes);
    }

    /// Forget an active buffer, returning its last recorded size.
    pub fn remove_active(&mut self, id: u64) -> usize {
        self.active.remove(&id).unwrap_or(0)
    }

    pub fn active_bytes(&self) -> usize {
        self.active.values().sum()
    }

    pub fn flushing_bytes(&self) -> usize {
        self.flushing_bytes
    }

    pub fn num_flushing(&self) -> usize {
        self.num_flushing
    }

    /// Move a buffer from active to flushing.
    pub fn start_flush(&mut self, id: u64, bytes: usize) {
        self.remove_active(id);
        self.flushing_bytes += bytes;
        self.num_flushing += 1;
    }

    /// A flush of `bytes` finished, successfully or not.
    pub fn finish_flush(&mut self, bytes: usize) {
        self.flushing_bytes = self.flushing_bytes.saturating_sub(bytes);
        self.num_flushing = self.num_flushing.saturating_sub(1);
    }

    /// True when a buffer holding `num_docs` documents must be flushed.
    pub fn doc_limit_reached(&self, num_docs: u32) -> bool {
        self.max_buffered_docs.is_some_and(|max| num_docs >= max)
    }

    /// True when the active buffers exceed the RAM budget.
    pub fn ram_limit_reached(&self) -> bool {
        self.ram_budget_bytes
            .is_some_and(|budget| self.active_bytes() > budget)
    }

    /// Largest active buffer, if any.
    pub fn largest_active(&self) -> Option<u64> {
        self.active
            .iter()
            .filter(|(_, bytes)| **bytes > 0)
            .max_by_key(|(id, bytes)| (**bytes, std::cmp::Reverse(**id)))
            .map(|(id, _)| *id)
    }

    /// True while new additions must wait for a flush to finish.
    pub fn stalled(&self) -> bool {
        match self.ram_budget_bytes {
            Some(budget) => {
                self.num_flushing > 0
                    && self.active_bytes() + self.flushing_bytes > budget.saturating_mul(2)
            }
            None => false,
        }
    }

    pub fn record_stall(&mut self) {
        self.stalls += 1;
    }

    /// Number of times an addition waited on a stall.
    pub fn stall_count(&self) -> u64 {
        self.stalls
    }

    /// Drop every active buffer.
    pub fn clear_active(&mut self) {
        self.active.clear();
    }
}
