//! Metadata of one immutable segment and of its committed generations.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::codec::segment_file_name;
use crate::error::Result;
use crate::storage::Storage;
use crate::util::to_base36;

/// Diagnostics key recording why a segment was created.
pub const SOURCE_KEY: &str = "source";
pub const SOURCE_FLUSH: &str = "flush";
pub const SOURCE_MERGE: &str = "merge";

/// Description of one immutable segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentInfo {
    /// `_` followed by a base-36 counter.
    pub name: String,
    /// Random id, written into every file header of the segment.
    pub id: [u8; 16],
    pub max_doc: u32,
    /// Name of the codec the segment was written with.
    pub codec: String,
    /// Who created the segment, when and why.
    pub diagnostics: BTreeMap<String, String>,
    pub attributes: BTreeMap<String, String>,
    /// Every file of the segment, excluding per-generation files.
    pub files: BTreeSet<String>,
    /// Library version that wrote the segment.
    pub version: String,
}

impl SegmentInfo {
    pub fn new(name: &str, max_doc: u32, codec: &str) -> Self {
        SegmentInfo {
            name: name.to_string(),
            id: *uuid::Uuid::new_v4().as_bytes(),
            max_doc,
            codec: codec.to_string(),
            diagnostics: BTreeMap::new(),
            attributes: BTreeMap::new(),
            files: BTreeSet::new(),
            version: crate::VERSION.to_string(),
        }
    }

    /// Record creation diagnostics.
    pub fn set_diagnostics(&mut self, source: &str) {
        self.diagnostics
            .insert(SOURCE_KEY.to_string(), source.to_string());
        self.diagnostics
            .insert("timestamp".to_string(), chrono::Utc::now().to_rfc3339());
        self.diagnostics
            .insert("os".to_string(), std::env::consts::OS.to_string());
        self.diagnostics
            .insert("version".to_string(), crate::VERSION.to_string());
    }

    /// Why the segment was created, if recorded.
    pub fn source(&self) -> Option<&str> {
        self.diagnostics.get(SOURCE_KEY).map(String::as_str)
    }
}

/// A segment plus the delete and doc-values-update generations visible in
/// one commit.
///
/// Generations only grow. `-1` means no generation was written yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentCommitInfo {
    pub info: Arc<SegmentInfo>,
    pub del_count: u32,
    pub del_gen: i64,
    pub next_write_del_gen: i64,
    pub dv_gen: i64,
    pub next_write_dv_gen: i64,
}

impl SegmentCommitInfo {
    pub fn new(info: Arc<SegmentInfo>) -> Self {
        SegmentCommitInfo {
            info,
            del_count: 0,
            del_gen: -1,
            next_write_del_gen: 1,
            dv_gen: -1,
            next_write_dv_gen: 1,
        }
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn max_doc(&self) -> u32 {
        self.info.max_doc
    }

    /// Live documents in this commit.
    pub fn num_docs(&self) -> u32 {
        self.info.max_doc - self.del_count.min(self.info.max_doc)
    }

    pub fn has_deletions(&self) -> bool {
        self.del_gen > 0
    }

    pub fn has_dv_updates(&self) -> bool {
        self.dv_gen > 0
    }

    /// Live docs file of the current delete generation.
    pub fn live_docs_file(&self) -> Option<String> {
        self.has_deletions()
            .then(|| segment_file_name(self.name(), &to_base36(self.del_gen as u64), "liv"))
    }

    /// Doc-values updates file of the current generation.
    pub fn dv_updates_file(&self) -> Option<String> {
        self.has_dv_updates()
            .then(|| segment_file_name(self.name(), &to_base36(self.dv_gen as u64), "dvu"))
    }

    /// Make `generation` the current delete generation.
    pub fn advance_del_gen(&mut self, generation: i64, del_count: u32) {
        self.del_gen = generation;
        self.del_count = del_count;
        self.next_write_del_gen = self.next_write_del_gen.max(generation + 1);
    }

    /// Make `generation` the current doc-values-update generation.
    pub fn advance_dv_gen(&mut self, generation: i64) {
        self.dv_gen = generation;
        self.next_write_dv_gen = self.next_write_dv_gen.max(generation + 1);
    }

    /// Every file this commit of the segment references.
    pub fn files(&self) -> BTreeSet<String> {
        let mut files = self.info.files.clone();
        files.extend(self.live_docs_file());
        files.extend(self.dv_updates_file());
        files
    }

    /// Total size in bytes of the referenced files.
    pub fn size_in_bytes(&self, storage: &dyn Storage) -> Result<u64> {
        self.files()
            .iter()
            .map(|name| storage.file_size(name))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_files() {
        let mut info = SegmentInfo::new("_4", 10, "Tessera10");
        info.files.insert("_4.si".to_string());
        let mut commit = SegmentCommitInfo::new(Arc::new(info));
        assert!(!commit.has_deletions());
        assert_eq!(commit.live_docs_file(), None);
        assert_eq!(commit.files().len(), 1);

        commit.advance_del_gen(commit.next_write_del_gen, 3);
        assert_eq!(commit.live_docs_file().as_deref(), Some("_4_1.liv"));
        assert_eq!(commit.num_docs(), 7);
        assert_eq!(commit.next_write_del_gen, 2);

        commit.advance_dv_gen(36);
        assert_eq!(commit.dv_updates_file().as_deref(), Some("_4_10.dvu"));
        assert_eq!(commit.files().len(), 3);
    }

    #[test]
    fn test_diagnostics() {
        let mut info = SegmentInfo::new("_0", 1, "Tessera10");
        info.set_diagnostics(SOURCE_MERGE);
        assert_eq!(info.source(), Some("merge"));
        assert!(info.diagnostics.contains_key("timestamp"));
        let other = SegmentInfo::new("_0", 1, "Tessera10");
        assert_ne!(info.id, other.id);
    }
}
