//! Segment-based index engine.
//!
//! Writing goes through [`IndexWriter`]: documents are buffered per thread
//! by the [`DocumentsWriter`](documents_writer::DocumentsWriter), flushed
//! into immutable segments, merged in the background according to a
//! [`MergePolicy`] and a [`MergeScheduler`], and made durable by
//! [`IndexWriter::commit`] as a `segments_N` commit point.
//!
//! Reading goes through [`DirectoryReader`], a point-in-time view over the
//! segments of one commit or, near-real-time, of an open writer.

pub mod check_index;
pub mod delete_queue;
pub mod directory_reader;
pub mod documents_writer;
pub mod documents_writer_per_thread;
pub mod field_infos;
pub mod file_deleter;
pub mod flush_control;
pub mod index_writer;
pub mod index_writer_config;
pub mod merge;
pub mod merge_policy;
pub mod merge_scheduler;
pub mod reader_pool;
pub mod segment_info;
pub mod segment_infos;
pub mod segment_merger;
pub mod segment_reader;
pub mod term;
pub mod terms_hash;

pub use check_index::{CheckIndex, CheckIndexStatus, SegmentStatus};
pub use directory_reader::DirectoryReader;
pub use field_infos::{
    DocValuesType, FieldInfo, FieldInfos, FieldNumbers, IndexOptions, VectorEncoding,
    VectorSimilarity,
};
pub use index_writer::{IndexWriter, WriterState};
pub use index_writer_config::{
    IndexWriterConfig, MergePolicySettings, MergeSchedulerSettings, OpenMode, WriterSettings,
};
pub use merge::{MergeState, OneMerge};
pub use merge_policy::{MergePolicy, MergeTrigger, NoMergePolicy, TieredMergePolicy};
pub use merge_scheduler::{
    ConcurrentMergeScheduler, ConcurrentMergeSchedulerConfig, MergeScheduler, NoMergeScheduler,
    SerialMergeScheduler,
};
pub use segment_info::{SegmentCommitInfo, SegmentInfo};
pub use segment_infos::SegmentInfos;
pub use segment_reader::{SegmentCoreReaders, SegmentReader};
pub use term::Term;
