//! Configuration of an [`IndexWriter`](crate::index::IndexWriter).
//!
//! [`IndexWriterConfig`] is built in code with `with_*` methods.
//! [`WriterSettings`] is its serializable subset, read from JSON by the
//! command line tool and converted with [`WriterSettings::into_config`].

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::analysis::{Analyzer, StandardAnalyzer};
use crate::codec::{self, Codec};
use crate::error::{Result, TesseraError};
use crate::index::merge_policy::{MergePolicy, NoMergePolicy, TieredMergePolicy};
use crate::index::merge_scheduler::{
    ConcurrentMergeScheduler, ConcurrentMergeSchedulerConfig, MergeScheduler, NoMergeScheduler,
    SerialMergeScheduler,
};

/// Longest term, in bytes, the writer accepts.
pub const DEFAULT_MAX_TERM_LENGTH: usize = 32766;

/// Default indexing RAM budget.
pub const DEFAULT_RAM_BUFFER_SIZE_MB: f64 = 16.0;

/// How the writer treats an existing index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpenMode {
    /// Start empty; the first commit replaces any existing index.
    Create,
    /// Open the existing index; fail if there is none.
    Append,
    /// Append when an index exists, create otherwise.
    #[default]
    CreateOrAppend,
}

/// Settings of one writer.
#[derive(Clone)]
pub struct IndexWriterConfig {
    pub analyzer: Arc<dyn Analyzer>,
    pub codec: Arc<dyn Codec>,
    pub merge_policy: Arc<dyn MergePolicy>,
    pub merge_scheduler: Arc<dyn MergeScheduler>,
    pub open_mode: OpenMode,
    /// Buffered RAM that triggers a flush; `None` disables the RAM trigger.
    pub ram_buffer_size_mb: Option<f64>,
    /// Buffered documents per thread that trigger a flush.
    pub max_buffered_docs: Option<u32>,
    pub max_term_length: usize,
    /// Commit pending changes on close instead of discarding them.
    pub commit_on_close: bool,
}

impl Default for IndexWriterConfig {
    fn default() -> Self {
        IndexWriterConfig {
            analyzer: Arc::new(StandardAnalyzer),
            codec: codec::default_codec(),
            merge_policy: Arc::new(TieredMergePolicy::default()),
            merge_scheduler: Arc::new(ConcurrentMergeScheduler::new(
                ConcurrentMergeSchedulerConfig::default(),
            )),
            open_mode: OpenMode::default(),
            ram_buffer_size_mb: Some(DEFAULT_RAM_BUFFER_SIZE_MB),
            max_buffered_docs: None,
            max_term_length: DEFAULT_MAX_TERM_LENGTH,
            commit_on_close: true,
        }
    }
}

impl fmt::Debug for IndexWriterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexWriterConfig")
            .field("analyzer", &self.analyzer)
            .field("codec", &self.codec.name())
            .field("merge_policy", &self.merge_policy)
            .field("merge_scheduler", &self.merge_scheduler)
            .field("open_mode", &self.open_mode)
            .field("ram_buffer_size_mb", &self.ram_buffer_size_mb)
            .field("max_buffered_docs", &self.max_buffered_docs)
            .field("max_term_length", &self.max_term_length)
            .field("commit_on_close", &self.commit_on_close)
            .finish()
    }
}

impl IndexWriterConfig {
    pub fn new() -> Self {
        IndexWriterConfig::default()
    }

    pub fn with_analyzer(mut self, analyzer: Arc<dyn Analyzer>) -> Self {
        self.analyzer = analyzer;
        self
    }

    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_merge_policy(mut self, policy: Arc<dyn MergePolicy>) -> Self {
        self.merge_policy = policy;
        self
    }

    pub fn with_merge_scheduler(mut self, scheduler: Arc<dyn MergeScheduler>) -> Self {
        self.merge_scheduler = scheduler;
        self
    }

    pub fn with_open_mode(mut self, mode: OpenMode) -> Self {
        self.open_mode = mode;
        self
    }

    pub fn with_ram_buffer_size_mb(mut self, mb: Option<f64>) -> Self {
        self.ram_buffer_size_mb = mb;
        self
    }

    pub fn with_max_buffered_docs(mut self, docs: Option<u32>) -> Self {
        self.max_buffered_docs = docs;
        self
    }

    pub fn with_max_term_length(mut self, length: usize) -> Self {
        self.max_term_length = length;
        self
    }

    pub fn with_commit_on_close(mut self, commit: bool) -> Self {
        self.commit_on_close = commit;
        self
    }

    /// Check the settings before a writer uses them.
    pub fn validate(&self) -> Result<()> {
        if let Some(mb) = self.ram_buffer_size_mb {
            if !(mb > 0.0 && mb.is_finite()) {
                return Err(TesseraError::illegal_argument(format!(
                    "ram_buffer_size_mb must be positive, got {mb}"
                )));
            }
        }
        if self.max_buffered_docs == Some(0) {
            return Err(TesseraError::illegal_argument(
                "max_buffered_docs must be at least 1",
            ));
        }
        if self.ram_buffer_size_mb.is_none() && self.max_buffered_docs.is_none() {
            return Err(TesseraError::illegal_argument(
                "at least one of ram_buffer_size_mb and max_buffered_docs must be set",
            ));
        }
        if self.max_term_length == 0 || self.max_term_length > DEFAULT_MAX_TERM_LENGTH {
            return Err(TesseraError::illegal_argument(format!(
                "max_term_length must be in 1..={DEFAULT_MAX_TERM_LENGTH}, got {}",
                self.max_term_length
            )));
        }
        Ok(())
    }

    pub(crate) fn ram_budget_bytes(&self) -> Option<usize> {
        self.ram_buffer_size_mb
            .map(|mb| (mb * 1024.0 * 1024.0) as usize)
    }
}

/// Merge policy choice of [`WriterSettings`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MergePolicySettings {
    Tiered(TieredMergePolicy),
    None,
}

impl Default for MergePolicySettings {
    fn default() -> Self {
        MergePolicySettings::Tiered(TieredMergePolicy::default())
    }
}

/// Merge scheduler choice of [`WriterSettings`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MergeSchedulerSettings {
    Concurrent(ConcurrentMergeSchedulerConfig),
    Serial,
    None,
}

impl Default for MergeSchedulerSettings {
    fn default() -> Self {
        MergeSchedulerSettings::Concurrent(ConcurrentMergeSchedulerConfig::default())
    }
}

/// Serializable writer settings.
///
/// ```
/// use tessera::index::WriterSettings;
///
/// let settings: WriterSettings =
///     serde_json::from_str(r#"{"max_buffered_docs": 1000, "commit_on_close": false}"#).unwrap();
/// let config = settings.into_config().unwrap();
/// assert_eq!(config.max_buffered_docs, Some(1000));
/// assert!(!config.commit_on_close);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterSettings {
    pub open_mode: OpenMode,
    pub ram_buffer_size_mb: Option<f64>,
    pub max_buffered_docs: Option<u32>,
    pub max_term_length: usize,
    pub commit_on_close: bool,
    /// Registered codec name for new segments.
    pub codec: String,
    pub merge_policy: MergePolicySettings,
    pub merge_scheduler: MergeSchedulerSettings,
}

impl Default for WriterSettings {
    fn default() -> Self {
        WriterSettings {
            open_mode: OpenMode::default(),
            ram_buffer_size_mb: Some(DEFAULT_RAM_BUFFER_SIZE_MB),
            max_buffered_docs: None,
            max_term_length: DEFAULT_MAX_TERM_LENGTH,
            commit_on_close: true,
            codec: codec::DEFAULT_CODEC.to_string(),
            merge_policy: MergePolicySettings::default(),
            merge_scheduler: MergeSchedulerSettings::default(),
        }
    }
}

impl WriterSettings {
    /// Read settings from a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Build a validated config, using the standard analyzer.
    pub fn into_config(self) -> Result<IndexWriterConfig> {
        let merge_policy: Arc<dyn MergePolicy> = match self.merge_policy {
            MergePolicySettings::Tiered(policy) => Arc::new(policy),
            MergePolicySettings::None => Arc::new(NoMergePolicy),
        };
        let merge_scheduler: Arc<dyn MergeScheduler> = match self.merge_scheduler {
            MergeSchedulerSettings::Concurrent(config) => {
                Arc::new(ConcurrentMergeScheduler::new(config))
            }
            MergeSchedulerSettings::Serial => Arc::new(SerialMergeScheduler::new()),
            MergeSchedulerSettings::None => Arc::new(NoMergeScheduler),
        };
        let config = IndexWriterConfig::new()
            .with_codec(codec::for_name(&self.codec)?)
            .with_merge_policy(merge_policy)
            .with_merge_scheduler(merge_scheduler)
            .with_open_mode(self.open_mode)
            .with_ram_buffer_size_mb(self.ram_buffer_size_mb)
            .with_max_buffered_docs(self.max_buffered_docs)
            .with_max_term_length(self.max_term_length)
            .with_commit_on_close(self.commit_on_close);
        config.validate()?;
        Ok(config)
    }
}
