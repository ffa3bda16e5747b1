//! Merge schedulers decide which thread runs a registered merge.
//!
//! The writer registers merges proposed by its policy and then hands itself
//! to the scheduler as a [`MergeSource`]. Schedulers pull merges with
//! [`MergeSource::next_merge`] until none are left.

use std::cell::Cell;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};
use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TesseraError};
use crate::index::merge::MergeSource;
use crate::index::merge_policy::MergeTrigger;
use crate::storage::Storage;
use crate::storage::rate_limited::RateLimitedStorage;
use crate::util::rate_limiter::RateLimiter;

thread_local! {
    static MERGE_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// True on a scheduler's merge thread.
pub fn is_merge_thread() -> bool {
    MERGE_THREAD.with(Cell::get)
}

/// Runs merges for a writer.
pub trait MergeScheduler: Send + Sync + fmt::Debug {
    /// Run, or arrange to run, every pending merge of `source`.
    fn merge(&self, source: Arc<dyn MergeSource>, trigger: MergeTrigger) -> Result<()>;

    /// Block an indexing thread while too many merges are backlogged.
    ///
    /// Returns true when the caller waited.
    fn maybe_stall(&self, _source: &dyn MergeSource) -> bool {
        false
    }

    /// Storage that merges write through.
    fn wrap_storage(&self, storage: Arc<dyn Storage>) -> Arc<dyn Storage> {
        storage
    }

    /// Wait until merges started by this scheduler are done.
    fn sync(&self) {}

    /// Stop accepting merges and release threads.
    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Settings of [`ConcurrentMergeScheduler`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrentMergeSchedulerConfig {
    /// Merge threads.
    pub max_thread_count: usize,

    /// Pending plus running merges above which indexing stalls.
    pub max_merge_count: usize,

    /// Write ceiling of merges in bytes per second; unlimited when unset.
    pub io_bytes_per_sec: Option<f64>,
}

impl Default for ConcurrentMergeSchedulerConfig {
    fn default() -> Self {
        let max_thread_count = (num_cpus::get() / 2).clamp(1, 4);
        ConcurrentMergeSchedulerConfig {
            max_thread_count,
            max_merge_count: max_thread_count + 5,
            io_bytes_per_sec: None,
        }
    }
}

#[derive(Debug, Default)]
struct ActiveMerges {
    running: usize,
    queued_tokens: usize,
}

/// Runs merges on a pool of background threads.
pub struct ConcurrentMergeScheduler {
    config: ConcurrentMergeSchedulerConfig,
    sender: Sender<Arc<dyn MergeSource>>,
    receiver: Receiver<Arc<dyn MergeSource>>,
    running: Arc<AtomicBool>,
    closed: AtomicBool,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    active: Arc<(Mutex<ActiveMerges>, Condvar)>,
    rate_limiter: Option<Arc<RateLimiter>>,
    stalls: AtomicU64,
}

impl ConcurrentMergeScheduler {
    pub fn new(config: ConcurrentMergeSchedulerConfig) -> Self {
        let (sender, receiver) = unbounded();
        let rate_limiter = config
            .io_bytes_per_sec
            .map(|rate| Arc::new(RateLimiter::new(rate)));
        ConcurrentMergeScheduler {
            config,
            sender,
            receiver,
            running: Arc::new(AtomicBool::new(true)),
            closed: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
            active: Arc::new((Mutex::new(ActiveMerges::default()), Condvar::new())),
            rate_limiter,
            stalls: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &ConcurrentMergeSchedulerConfig {
        &self.config
    }

    /// Change the merge write ceiling of a scheduler created with one.
    pub fn set_io_bytes_per_sec(&self, bytes_per_sec: f64) {
        if let Some(limiter) = &self.rate_limiter {
            limiter.set_bytes_per_sec(bytes_per_sec);
        }
    }

    /// Merges currently executing on worker threads.
    pub fn running_merges(&self) -> usize {
        self.active.0.lock().running
    }

    /// Times an indexing thread was held back by the merge backlog.
    pub fn stall_count(&self) -> u64 {
        self.stalls.load(Ordering::Relaxed)
    }

    fn ensure_workers(&self) -> Result<()> {
        let mut workers = self.workers.lock();
        while workers.len() < self.config.max_thread_count.max(1) {
            let worker = self.spawn_worker(workers.len())?;
            workers.push(worker);
        }
        Ok(())
    }

    fn spawn_worker(&self, worker_id: usize) -> Result<thread::JoinHandle<()>> {
        let receiver = self.receiver.clone();
        let running = Arc::clone(&self.running);
        let active = Arc::clone(&self.active);

        let handle = thread::Builder::new()
            .name(format!("merge-worker-{worker_id}"))
            .spawn(move || {
                MERGE_THREAD.with(|flag| flag.set(true));
                while running.load(Ordering::Acquire) {
                    match receiver.recv_timeout(Duration::from_secs(1)) {
                        Ok(source) => {
                            {
                                let mut state = active.0.lock();
                                state.queued_tokens = state.queued_tokens.saturating_sub(1);
                            }
                            while running.load(Ordering::Acquire) {
                                let Some(merge) = source.next_merge() else {
                                    break;
                                };
                                active.0.lock().running += 1;
                                if let Err(e) = source.run_merge(&merge) {
                                    debug!("{merge} ended with: {e}");
                                }
                                active.0.lock().running -= 1;
                                active.1.notify_all();
                            }
                            active.1.notify_all();
                        }
                        Err(_) => {
                            // Timeout or channel closed, continue
                        }
                    }
                }
            })?;
        Ok(handle)
    }
}

impl fmt::Debug for ConcurrentMergeScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrentMergeScheduler")
            .field("config", &self.config)
            .field("workers", &self.workers.lock().len())
            .field("running_merges", &self.running_merges())
            .finish()
    }
}

impl MergeScheduler for ConcurrentMergeScheduler {
    fn merge(&self, source: Arc<dyn MergeSource>, trigger: MergeTrigger) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TesseraError::already_closed("merge scheduler is closed"));
        }
        let pending = source.pending_merge_count();
        if pending == 0 {
            return Ok(());
        }
        self.ensure_workers()?;
        debug!("scheduling {pending} merges ({trigger:?})");
        let tokens = pending.min(self.config.max_thread_count.max(1));
        self.active.0.lock().queued_tokens += tokens;
        for _ in 0..tokens {
            self.sender
                .send(Arc::clone(&source))
                .map_err(|_| TesseraError::illegal_state("merge workers are gone"))?;
        }
        Ok(())
    }

    fn maybe_stall(&self, source: &dyn MergeSource) -> bool {
        if is_merge_thread() {
            return false;
        }
        let backlog = || source.pending_merge_count() + source.running_merge_count();
        if backlog() <= self.config.max_merge_count {
            return false;
        }
        self.stalls.fetch_add(1, Ordering::Relaxed);
        info!(
            "too many merges ({} > {}); stalling indexing thread",
            backlog(),
            self.config.max_merge_count
        );
        let (lock, cond) = &*self.active;
        let mut state = lock.lock();
        while backlog() > self.config.max_merge_count
            && self.running.load(Ordering::Acquire)
        {
            cond.wait_for(&mut state, Duration::from_millis(250));
        }
        true
    }

    fn wrap_storage(&self, storage: Arc<dyn Storage>) -> Arc<dyn Storage> {
        match &self.rate_limiter {
            Some(limiter) => Arc::new(RateLimitedStorage::new(storage, Arc::clone(limiter))),
            None => storage,
        }
    }

    fn sync(&self) {
        let (lock, cond) = &*self.active;
        let mut state = lock.lock();
        while state.running > 0 || state.queued_tokens > 0 {
            if self.workers.lock().is_empty() {
                break;
            }
            cond.wait_for(&mut state, Duration::from_millis(100));
        }
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.sync();
        self.running.store(false, Ordering::Release);
        self.active.1.notify_all();

        let mut workers = self.workers.lock();
        while let Some(worker) = workers.pop() {
            if worker.join().is_err() {
                warn!("merge worker panicked");
            }
        }
        drop(workers);

        while let Ok(source) = self.receiver.try_recv() {
            while let Some(merge) = source.next_merge() {
                source.on_merge_abandoned(&merge);
            }
        }
        Ok(())
    }
}

impl Drop for ConcurrentMergeScheduler {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

/// Runs merges one at a time on the thread that triggered them.
#[derive(Debug, Default)]
pub struct SerialMergeScheduler {
    lock: Mutex<()>,
}

impl SerialMergeScheduler {
    pub fn new() -> Self {
        SerialMergeScheduler::default()
    }
}

impl MergeScheduler for SerialMergeScheduler {
    fn merge(&self, source: Arc<dyn MergeSource>, _trigger: MergeTrigger) -> Result<()> {
        let _guard = self.lock.lock();
        let mut first_error = None;
        while let Some(merge) = source.next_merge() {
            if let Err(e) = source.run_merge(&merge) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Never runs merges.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoMergeScheduler;

impl MergeScheduler for NoMergeScheduler {
    fn merge(&self, source: Arc<dyn MergeSource>, _trigger: MergeTrigger) -> Result<()> {
        while let Some(merge) = source.next_merge() {
            source.on_merge_abandoned(&merge);
        }
        Ok(())
    }
}
