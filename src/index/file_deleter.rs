//! Reference counting of index files.
//!
//! Every file referenced by the last commit, by the writer's in-memory
//! segment list, by a running merge or by an open near-real-time reader
//! holds a reference. A file whose count drops to zero is deleted. Only the
//! last commit is kept.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use log::{debug, warn};

use crate::codec::parse_segment_name;
use crate::error::Result;
use crate::index::segment_infos::{PENDING_SEGMENTS_PREFIX, SEGMENTS_PREFIX};
use crate::storage::{Storage, WRITE_LOCK_NAME};

/// True for files the index owns and may delete.
pub fn is_index_file(name: &str) -> bool {
    name != WRITE_LOCK_NAME
        && (parse_segment_name(name).is_some()
            || name.starts_with(&format!("{SEGMENTS_PREFIX}_"))
            || name.starts_with(&format!("{PENDING_SEGMENTS_PREFIX}_")))
}

#[derive(Debug)]
pub struct FileDeleter {
    storage: Arc<dyn Storage>,
    ref_counts: HashMap<String, usize>,
    checkpoint_files: BTreeSet<String>,
    commit_files: BTreeSet<String>,
    /// Deletions that failed and are retried on the next change.
    retry: BTreeSet<String>,
}

impl FileDeleter {
    /// Start with the files of the last commit referenced.
    pub fn new(storage: Arc<dyn Storage>, commit_files: BTreeSet<String>) -> Self {
        let mut deleter = FileDeleter {
            storage,
            ref_counts: HashMap::new(),
            checkpoint_files: BTreeSet::new(),
            commit_files: BTreeSet::new(),
            retry: BTreeSet::new(),
        };
        deleter.inc_ref(&commit_files);
        deleter.commit_files = commit_files;
        deleter
    }

    /// Record the files of the writer's current segment list.
    pub fn checkpoint(&mut self, files: BTreeSet<String>) {
        self.inc_ref(&files);
        let previous = std::mem::replace(&mut self.checkpoint_files, files);
        self.dec_ref(&previous);
    }

    /// Record a new commit, releasing the previous one.
    pub fn commit(&mut self, files: BTreeSet<String>) {
        self.inc_ref(&files);
        let previous = std::mem::replace(&mut self.commit_files, files);
        self.dec_ref(&previous);
    }

    /// Files of the last commit.
    pub fn commit_files(&self) -> &BTreeSet<String> {
        &self.commit_files
    }

    pub fn inc_ref<'a, I: IntoIterator<Item = &'a String>>(&mut self, files: I) {
        for file in files {
            *self.ref_counts.entry(file.clone()).or_default() += 1;
        }
    }

    pub fn dec_ref<'a, I: IntoIterator<Item = &'a String>>(&mut self, files: I) {
        let mut unreferenced = Vec::new();
        for file in files {
            match self.ref_counts.get_mut(file) {
                Some(count) if *count > 1 => *count -= 1,
                Some(_) => {
                    self.ref_counts.remove(file);
                    unreferenced.push(file.clone());
                }
                None => warn!("reference count of {file} dropped below zero"),
            }
        }
        for file in unreferenced {
            self.delete(&file);
        }
        self.retry_failed();
    }

    pub fn ref_count(&self, file: &str) -> usize {
        self.ref_counts.get(file).copied().unwrap_or(0)
    }

    /// Delete files that were written but never referenced.
    pub fn delete_new_files<'a, I: IntoIterator<Item = &'a String>>(&mut self, files: I) {
        for file in files {
            if self.ref_count(file) == 0 {
                self.delete(file);
            }
        }
    }

    /// Delete every index file in storage that holds no reference.
    ///
    /// Must only run while no flush or merge is writing new files.
    pub fn refresh(&mut self) -> Result<()> {
        for file in self.storage.list_files()? {
            if is_index_file(&file) && self.ref_count(&file) == 0 {
                self.delete(&file);
            }
        }
        Ok(())
    }

    fn delete(&mut self, file: &str) {
        match self.storage.delete_file(file) {
            Ok(()) => {
                debug!("deleted unreferenced file {file}");
                self.retry.remove(file);
            }
            Err(e) if e.is_not_found() => {
                self.retry.remove(file);
            }
            Err(e) => {
                warn!("failed to delete {file}, will retry: {e}");
                self.retry.insert(file.to_string());
            }
        }
    }

    fn retry_failed(&mut self) {
        let pending: Vec<String> = self
            .retry
            .iter()
            .filter(|f| !self.ref_counts.contains_key(*f))
            .cloned()
            .collect();
        for file in pending {
            self.delete(&file);
        }
    }
}
