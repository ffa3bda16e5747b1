//! The commit point: `segments_N`.
//!
//! A commit lists the segments of the index with their delete and
//! doc-values-update generations, the segment name counter and user data.
//! It is written as `pending_segments_N`, fsynced, then atomically renamed to
//! `segments_N`. The highest complete generation is the current commit.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use log::{debug, warn};

use crate::codec::codec_util::{
    open_checked, peek_header_id, write_footer_and_close, write_header,
};
use crate::codec::{self};
use crate::error::{Result, TesseraError};
use crate::index::segment_info::SegmentCommitInfo;
use crate::storage::Storage;
use crate::storage::structured::StructWriter;
use crate::util::{from_base36, to_base36};

pub const SEGMENTS_PREFIX: &str = "segments";
pub const PENDING_SEGMENTS_PREFIX: &str = "pending_segments";

const CODEC: &str = "Segments";
const VERSION: u32 = 0;

/// How often reading the latest commit is retried when a concurrent commit
/// removes the file being read.
const MAX_READ_ATTEMPTS: usize = 5;

/// `segments_N` for generation `N` (base 36).
pub fn segments_file_name(generation: u64) -> String {
    format!("{SEGMENTS_PREFIX}_{}", to_base36(generation))
}

/// `pending_segments_N` for generation `N` (base 36).
pub fn pending_segments_file_name(generation: u64) -> String {
    format!("{PENDING_SEGMENTS_PREFIX}_{}", to_base36(generation))
}

/// Generation of a `segments_N` file name.
pub fn generation_from_file(file_name: &str) -> Option<u64> {
    file_name
        .strip_prefix(SEGMENTS_PREFIX)?
        .strip_prefix('_')
        .and_then(from_base36)
}

/// Highest commit generation among `files`, if any.
pub fn last_commit_generation<S: AsRef<str>>(files: &[S]) -> Option<u64> {
    files
        .iter()
        .filter_map(|f| generation_from_file(f.as_ref()))
        .max()
}

/// The list of segments making up one commit.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SegmentInfos {
    pub segments: Vec<SegmentCommitInfo>,
    /// Generation this commit was read from or last written as; 0 if none.
    pub generation: u64,
    /// Incremented on every change to the segment list.
    pub version: u64,
    /// Next segment name counter.
    pub counter: u64,
    pub user_data: BTreeMap<String, String>,
}

impl SegmentInfos {
    pub fn new() -> Self {
        SegmentInfos::default()
    }

    /// Read the most recent commit of `storage`.
    pub fn read_latest(storage: &dyn Storage) -> Result<Self> {
        let mut last_error = None;
        for attempt in 0..MAX_READ_ATTEMPTS {
            let files = storage.list_files()?;
            let Some(generation) = last_commit_generation(&files) else {
                return Err(TesseraError::index_not_found(format!(
                    "no {SEGMENTS_PREFIX}_N file found in {files:?}"
                )));
            };
            match SegmentInfos::read_commit(storage, generation) {
                Ok(infos) => return Ok(infos),
                Err(e) if e.is_not_found() => {
                    debug!("commit generation {generation} vanished (attempt {attempt}), retrying");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| TesseraError::index_not_found("no readable commit")))
    }

    /// True when `storage` holds at least one commit.
    pub fn index_exists(storage: &dyn Storage) -> Result<bool> {
        Ok(last_commit_generation(&storage.list_files()?).is_some())
    }

    /// Read the commit of a specific generation.
    pub fn read_commit(storage: &dyn Storage, generation: u64) -> Result<Self> {
        let file_name = segments_file_name(generation);
        let bytes = storage.open_bytes(&file_name)?;
        let suffix = to_base36(generation);
        let id = peek_header_id(&bytes)?;
        let (mut input, _) = open_checked(bytes, CODEC, VERSION, VERSION, &id, &suffix)?;

        let version = input.read_u64()?;
        let counter = input.read_varint()?;
        let _written_by = input.read_string()?;
        let count = input.read_varint()? as usize;
        let mut segments = Vec::with_capacity(count.min(1 << 16));
        for _ in 0..count {
            let name = input.read_string()?;
            let mut segment_id = [0u8; 16];
            segment_id.copy_from_slice(input.read_raw(16)?);
            let codec_name = input.read_string()?;
            let del_gen = input.read_zigzag()?;
            let del_count = input.read_varint_u32()?;
            let dv_gen = input.read_zigzag()?;

            let codec = codec::for_name(&codec_name)?;
            let info = codec
                .segment_info_format()
                .read(storage, &name, segment_id)?;
            if del_count > info.max_doc {
                return Err(TesseraError::corruption(
                    file_name.as_str(),
                    format!("segment {name} has {del_count} deletions but {} docs", info.max_doc),
                ));
            }
            let mut commit = SegmentCommitInfo::new(Arc::new(info));
            if del_gen > 0 {
                commit.advance_del_gen(del_gen, del_count);
            }
            if dv_gen > 0 {
                commit.advance_dv_gen(dv_gen);
            }
            segments.push(commit);
        }
        let user_data_len = input.read_varint()?;
        let mut user_data = BTreeMap::new();
        for _ in 0..user_data_len {
            let key = input.read_string()?;
            user_data.insert(key, input.read_string()?);
        }

        Ok(SegmentInfos {
            segments,
            generation,
            version,
            counter,
            user_data,
        })
    }

    /// Write this commit as `pending_segments_N`; returns the file name.
    pub fn write_pending(&self, storage: &dyn Storage, generation: u64) -> Result<String> {
        let file_name = pending_segments_file_name(generation);
        let id = *uuid::Uuid::new_v4().as_bytes();
        let mut out = StructWriter::new(storage.create_output(&file_name)?);
        let result = (|| {
            write_header(&mut out, CODEC, VERSION, &id, &to_base36(generation))?;
            out.write_u64(self.version)?;
            out.write_varint(self.counter)?;
            out.write_string(crate::VERSION)?;
            out.write_varint(self.segments.len() as u64)?;
            for commit in &self.segments {
                out.write_string(commit.name())?;
                out.write_raw(&commit.info.id)?;
                out.write_string(&commit.info.codec)?;
                out.write_zigzag(commit.del_gen)?;
                out.write_varint(commit.del_count as u64)?;
                out.write_zigzag(commit.dv_gen)?;
            }
            out.write_varint(self.user_data.len() as u64)?;
            for (key, value) in &self.user_data {
                out.write_string(key)?;
                out.write_string(value)?;
            }
            Ok(())
        })();
        match result {
            Ok(()) => write_footer_and_close(out)?,
            Err(e) => {
                drop(out);
                delete_quietly(storage, &file_name);
                return Err(e);
            }
        }
        Ok(file_name)
    }

    /// Publish a written pending commit: fsync, rename, fsync metadata.
    ///
    /// On failure the pending file is removed and the previous commit stays
    /// the current one.
    pub fn finish_commit(storage: &dyn Storage, generation: u64, files: &BTreeSet<String>) -> Result<String> {
        let pending = pending_segments_file_name(generation);
        let target = segments_file_name(generation);
        let result = (|| {
            let mut to_sync: Vec<String> = files.iter().cloned().collect();
            to_sync.push(pending.clone());
            storage.sync_files(&to_sync)?;
            storage.rename_file(&pending, &target)?;
            storage.sync_metadata()
        })();
        if let Err(e) = result {
            warn!("commit of generation {generation} failed: {e}");
            delete_quietly(storage, &pending);
            if storage.file_exists(&target) {
                delete_quietly(storage, &target);
            }
            return Err(e);
        }
        Ok(target)
    }

    /// Files referenced by this commit, optionally including `segments_N`.
    pub fn files(&self, include_segments_file: bool) -> BTreeSet<String> {
        let mut files: BTreeSet<String> = self.segments.iter().flat_map(|s| s.files()).collect();
        if include_segments_file && self.generation > 0 {
            files.insert(segments_file_name(self.generation));
        }
        files
    }

    /// Documents including deleted ones.
    pub fn total_max_doc(&self) -> u64 {
        self.segments.iter().map(|s| s.max_doc() as u64).sum()
    }

    /// Live documents.
    pub fn total_num_docs(&self) -> u64 {
        self.segments.iter().map(|s| s.num_docs() as u64).sum()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

fn delete_quietly(storage: &dyn Storage, name: &str) {
    if let Err(e) = storage.delete_file(name) {
        if !e.is_not_found() {
            warn!("failed to delete {name}: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::segment_info::SegmentInfo;
    use crate::storage::memory::MemoryStorage;

    fn write_segment(storage: &dyn Storage, name: &str, max_doc: u32) -> SegmentCommitInfo {
        let mut info = SegmentInfo::new(name, max_doc, codec::DEFAULT_CODEC);
        info.files.insert(format!("{name}.si"));
        codec::default_codec()
            .segment_info_format()
            .write(storage, &info)
            .unwrap();
        SegmentCommitInfo::new(Arc::new(info))
    }

    #[test]
    fn test_file_names() {
        assert_eq!(segments_file_name(1), "segments_1");
        assert_eq!(segments_file_name(36), "segments_10");
        assert_eq!(pending_segments_file_name(2), "pending_segments_2");
        assert_eq!(generation_from_file("segments_10"), Some(36));
        assert_eq!(generation_from_file("pending_segments_2"), None);
        assert_eq!(generation_from_file("segments"), None);
        assert_eq!(
            last_commit_generation(&["segments_2", "segments_a", "_0.si"]),
            Some(10)
        );
    }

    #[test]
    fn test_commit_round_trip() {
        let storage = MemoryStorage::default();
        let mut infos = SegmentInfos::new();
        infos.segments.push(write_segment(&storage, "_0", 10));
        let mut second = write_segment(&storage, "_1", 5);
        let mut live = bit_vec::BitVec::from_elem(5, true);
        live.set(0, false);
        live.set(3, false);
        codec::default_codec()
            .live_docs_format()
            .write(&storage, &second, &live, 2, 3)
            .unwrap();
        second.advance_del_gen(3, 2);
        infos.segments.push(second);
        infos.counter = 2;
        infos.version = 7;
        infos.user_data.insert("checkpoint".into(), "42".into());

        infos.write_pending(&storage, 1).unwrap();
        assert!(!SegmentInfos::index_exists(&storage).unwrap());
        SegmentInfos::finish_commit(&storage, 1, &infos.files(false)).unwrap();
        assert!(storage.file_exists("segments_1"));
        assert!(!storage.file_exists("pending_segments_1"));

        let read = SegmentInfos::read_latest(&storage).unwrap();
        assert_eq!(read.generation, 1);
        assert_eq!(read.version, 7);
        assert_eq!(read.counter, 2);
        assert_eq!(read.segments.len(), 2);
        assert_eq!(read.segments[1].del_gen, 3);
        assert_eq!(read.segments[1].next_write_del_gen, 4);
        assert_eq!(read.segments[1].num_docs(), 3);
        assert_eq!(read.user_data.get("checkpoint").map(String::as_str), Some("42"));
        assert_eq!(read.total_max_doc(), 15);
        assert!(read.files(true).contains("segments_1"));
        assert!(read.files(true).contains("_1_3.liv"));
    }

    #[test]
    fn test_missing_index() {
        let storage = MemoryStorage::default();
        let err = SegmentInfos::read_latest(&storage).unwrap_err();
        assert!(matches!(err, TesseraError::IndexNotFound(_)));
    }

    #[test]
    fn test_corrupt_commit_detected() {
        let storage = MemoryStorage::default();
        let infos = SegmentInfos::new();
        infos.write_pending(&storage, 1).unwrap();
        SegmentInfos::finish_commit(&storage, 1, &BTreeSet::new()).unwrap();
        storage.corrupt_byte("segments_1", 20).unwrap();
        assert!(SegmentInfos::read_latest(&storage).unwrap_err().is_corruption());
    }
}
