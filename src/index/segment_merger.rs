//! Writes one segment from the live documents of several others.
//!
//! Deleted documents are dropped through per-source doc maps. Terms of each
//! field are merged with a heap over the sources' term enumerators, and the
//! postings of equal terms are concatenated with their doc ids remapped.
//! Numeric doc-values updates of the sources are folded into the written
//! columns.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};
use std::sync::Arc;

use bit_vec::BitVec;
use log::debug;

use crate::codec::{
    Codec, DocValuesColumn, NO_MORE_DOCS, NumericUpdates, PostingsEnum, SegmentWriteState,
    TermsEnum, segment_file_name,
};
use crate::error::{Result, TesseraError};
use crate::index::field_infos::{DocValuesType, FieldInfo, FieldInfos, FieldNumbers};
use crate::index::merge::OneMerge;
use crate::index::segment_info::{SOURCE_MERGE, SegmentInfo};
use crate::index::segment_reader::SegmentCoreReaders;
use crate::storage::Storage;

/// Documents between abort checks.
const CHECK_ABORT_INTERVAL: u32 = 1000;

/// A point-in-time view of one merge source. Holds a core reference.
pub struct MergeInput {
    core: Arc<SegmentCoreReaders>,
    live: Arc<BitVec>,
    dv_updates: Arc<NumericUpdates>,
}

impl MergeInput {
    pub fn new(
        core: Arc<SegmentCoreReaders>,
        live: Arc<BitVec>,
        dv_updates: Arc<NumericUpdates>,
    ) -> Result<Self> {
        core.inc_ref()?;
        Ok(MergeInput {
            core,
            live,
            dv_updates,
        })
    }

    pub fn name(&self) -> &str {
        &self.core.info().name
    }

    pub fn live(&self) -> &Arc<BitVec> {
        &self.live
    }

    pub fn dv_updates(&self) -> &Arc<NumericUpdates> {
        &self.dv_updates
    }
}

impl Drop for MergeInput {
    fn drop(&mut self) {
        let _ = self.core.dec_ref();
    }
}

/// Old doc id to merged doc id, per source.
pub type DocMap = Vec<Option<u32>>;

/// Result of [`SegmentMerger::merge`].
#[derive(Debug)]
pub struct MergedSegment {
    /// The written segment; `max_doc` is 0 and no file exists when every
    /// source document was deleted.
    pub info: SegmentInfo,
    pub field_infos: Arc<FieldInfos>,
    pub doc_maps: Vec<DocMap>,
}

impl MergedSegment {
    pub fn is_empty(&self) -> bool {
        self.info.max_doc == 0
    }
}

/// Merges [`MergeInput`]s through a codec.
pub struct SegmentMerger<'a> {
    inputs: &'a [MergeInput],
    storage: Arc<dyn Storage>,
    codec: Arc<dyn Codec>,
    field_numbers: &'a FieldNumbers,
    merge: &'a OneMerge,
}

impl<'a> SegmentMerger<'a> {
    pub fn new(
        inputs: &'a [MergeInput],
        storage: Arc<dyn Storage>,
        codec: Arc<dyn Codec>,
        field_numbers: &'a FieldNumbers,
        merge: &'a OneMerge,
    ) -> Self {
        SegmentMerger {
            inputs,
            storage,
            codec,
            field_numbers,
            merge,
        }
    }

    /// Write the merged segment `name`, deleting its files on failure.
    pub fn merge(&self, name: &str) -> Result<MergedSegment> {
        let (doc_maps, max_doc) = build_doc_maps(self.inputs);
        let field_infos = Arc::new(self.merged_field_infos());
        let mut info = SegmentInfo::new(name, max_doc, self.codec.name());
        info.set_diagnostics(SOURCE_MERGE);
        info.diagnostics.insert(
            "merge_sources".to_string(),
            self.inputs
                .iter()
                .map(MergeInput::name)
                .collect::<Vec<_>>()
                .join(","),
        );
        if max_doc == 0 {
            return Ok(MergedSegment {
                info,
                field_infos,
                doc_maps,
            });
        }

        let state = SegmentWriteState::new(
            Arc::clone(&self.storage),
            name,
            info.id,
            max_doc,
            Arc::clone(&field_infos),
        );
        let si_name = segment_file_name(name, "", self.codec.segment_info_format().extension());
        let written = self
            .write_files(&state, &field_infos, &doc_maps)
            .and_then(|()| {
                info.files = state.created_files();
                info.files.insert(si_name.clone());
                self.codec.segment_info_format().write(&*self.storage, &info)
            });
        if let Err(e) = written {
            state.delete_created_files();
            if self.storage.file_exists(&si_name) {
                let _ = self.storage.delete_file(&si_name);
            }
            return Err(e);
        }
        debug!(
            "merged {} segments into {name}: {max_doc} docs, {} fields",
            self.inputs.len(),
            field_infos.len()
        );
        Ok(MergedSegment {
            info,
            field_infos,
            doc_maps,
        })
    }

    fn merged_field_infos(&self) -> FieldInfos {
        let merged = FieldInfos::union(self.inputs.iter().map(|input| &**input.core.field_infos()));
        let mut fields: Vec<FieldInfo> = merged.iter().cloned().collect();
        // Updated doc values of a field the sources never indexed.
        for input in self.inputs {
            for field in input.dv_updates.keys() {
                if fields.iter().any(|f| &f.name == field) {
                    continue;
                }
                if let Some(global) = self.field_numbers.get(field) {
                    let mut info = FieldInfo::new(field.clone(), global.number);
                    info.doc_values_type = DocValuesType::Numeric;
                    fields.push(info);
                }
            }
        }
        FieldInfos::new(fields)
    }

    fn write_files(
        &self,
        state: &SegmentWriteState,
        field_infos: &FieldInfos,
        doc_maps: &[DocMap],
    ) -> Result<()> {
        self.codec.field_infos_format().write(state, field_infos)?;
        self.merge_stored_fields(state, field_infos, doc_maps)?;
        if field_infos.has_postings() {
            self.merge_postings(state, field_infos, doc_maps)?;
        }
        if field_infos.has_doc_values() {
            self.merge_doc_values(state, field_infos, doc_maps)?;
        }
        if field_infos.has_vectors() {
            self.merge_vectors(state, field_infos, doc_maps)?;
        }
        Ok(())
    }

    fn merge_stored_fields(
        &self,
        state: &SegmentWriteState,
        field_infos: &FieldInfos,
        doc_maps: &[DocMap],
    ) -> Result<()> {
        let mut writer = self.codec.stored_fields_format().writer(state)?;
        let mut written = 0u32;
        for (input, doc_map) in self.inputs.iter().zip(doc_maps) {
            let reader = input.core.stored_fields();
            for (doc, mapped) in doc_map.iter().enumerate() {
                if mapped.is_none() {
                    continue;
                }
                if written % CHECK_ABORT_INTERVAL == 0 {
                    self.merge.check_aborted()?;
                }
                writer.start_document()?;
                for field in reader.document(doc as u32)? {
                    let info = field_infos.field(&field.name).ok_or_else(|| {
                        TesseraError::illegal_state(format!("unknown stored field '{}'", field.name))
                    })?;
                    writer.write_field(info, &field.value)?;
                }
                writer.finish_document()?;
                written += 1;
            }
        }
        writer.finish(written)
    }

    fn merge_postings(
        &self,
        state: &SegmentWriteState,
        field_infos: &FieldInfos,
        doc_maps: &[DocMap],
    ) -> Result<()> {
        let mut consumer = self.codec.postings_format().fields_consumer(state)?;
        let mut terms_merged = 0u64;
        for info in field_infos.iter().filter(|f| f.index_options.is_indexed()) {
            consumer.start_field(info)?;

            let mut enums: Vec<Option<Box<dyn TermsEnum>>> = Vec::with_capacity(self.inputs.len());
            let mut heap = BinaryHeap::new();
            for (index, input) in self.inputs.iter().enumerate() {
                let terms_enum = match input.core.terms(&info.name) {
                    Some(terms) => {
                        let mut terms_enum = terms.iterator()?;
                        if terms_enum.next()? {
                            heap.push(Reverse((terms_enum.term().to_vec(), index)));
                            Some(terms_enum)
                        } else {
                            None
                        }
                    }
                    None => None,
                };
                enums.push(terms_enum);
            }

            while let Some(Reverse((term, first))) = heap.pop() {
                let mut sources = vec![first];
                while heap
                    .peek()
                    .is_some_and(|Reverse((next, _))| *next == term)
                {
                    if let Some(Reverse((_, index))) = heap.pop() {
                        sources.push(index);
                    }
                }
                sources.sort_unstable();

                let mut subs = Vec::with_capacity(sources.len());
                for &index in &sources {
                    if let Some(terms_enum) = &enums[index] {
                        subs.push((index, terms_enum.postings()?));
                    }
                }
                let mut merged = MergedPostingsEnum::new(subs, doc_maps);
                consumer.add_term(&term, &mut merged)?;

                for &index in &sources {
                    if let Some(terms_enum) = enums[index].as_mut() {
                        if terms_enum.next()? {
                            heap.push(Reverse((terms_enum.term().to_vec(), index)));
                        }
                    }
                }
                terms_merged += 1;
                if terms_merged % u64::from(CHECK_ABORT_INTERVAL) == 0 {
                    self.merge.check_aborted()?;
                }
            }
            consumer.finish_field()?;
        }
        self.merge.check_aborted()?;
        consumer.finish()
    }

    fn merge_doc_values(
        &self,
        state: &SegmentWriteState,
        field_infos: &FieldInfos,
        doc_maps: &[DocMap],
    ) -> Result<()> {
        let max_doc = state.max_doc as usize;
        let mut consumer = self.codec.doc_values_format().consumer(state)?;
        for info in field_infos
            .iter()
            .filter(|f| f.doc_values_type != DocValuesType::None)
        {
            self.merge.check_aborted()?;
            let mut columns = Vec::with_capacity(self.inputs.len());
            for input in self.inputs {
                let column = match (
                    input.core.doc_values(),
                    input.core.field_infos().field(&info.name),
                ) {
                    (Some(producer), Some(source_info))
                        if source_info.doc_values_type == info.doc_values_type =>
                    {
                        producer.column(source_info)?
                    }
                    _ => None,
                };
                columns.push(column);
            }

            let merged = match info.doc_values_type {
                DocValuesType::Numeric => {
                    let mut out = vec![None; max_doc];
                    for (index, (input, doc_map)) in self.inputs.iter().zip(doc_maps).enumerate() {
                        let base = match &columns[index] {
                            Some(DocValuesColumn::Numeric(values)) => Some(values),
                            _ => None,
                        };
                        let overlay = input.dv_updates.get(&info.name);
                        for (doc, mapped) in doc_map.iter().enumerate() {
                            let Some(mapped) = mapped else { continue };
                            let updated = overlay.and_then(|o| o.get(&(doc as u32)).copied());
                            out[*mapped as usize] =
                                updated.or_else(|| base.and_then(|b| b.get(doc).copied().flatten()));
                        }
                    }
                    DocValuesColumn::Numeric(out)
                }
                DocValuesType::Binary | DocValuesType::Sorted => {
                    let mut out = vec![None; max_doc];
                    for (index, doc_map) in doc_maps.iter().enumerate() {
                        let values = match &columns[index] {
                            Some(DocValuesColumn::Binary(v)) | Some(DocValuesColumn::Sorted(v)) => v,
                            _ => continue,
                        };
                        for (doc, mapped) in doc_map.iter().enumerate() {
                            if let Some(mapped) = mapped {
                                out[*mapped as usize] = values.get(doc).cloned().flatten();
                            }
                        }
                    }
                    if info.doc_values_type == DocValuesType::Binary {
                        DocValuesColumn::Binary(out)
                    } else {
                        DocValuesColumn::Sorted(out)
                    }
                }
                DocValuesType::SortedSet => {
                    let mut out = vec![Vec::new(); max_doc];
                    for (index, doc_map) in doc_maps.iter().enumerate() {
                        let Some(DocValuesColumn::SortedSet(values)) = &columns[index] else {
                            continue;
                        };
                        for (doc, mapped) in doc_map.iter().enumerate() {
                            if let (Some(mapped), Some(set)) = (mapped, values.get(doc)) {
                                out[*mapped as usize] = set.clone();
                            }
                        }
                    }
                    DocValuesColumn::SortedSet(out)
                }
                DocValuesType::None => continue,
            };
            consumer.add_field(info, &merged)?;
        }
        consumer.finish()
    }

    fn merge_vectors(
        &self,
        state: &SegmentWriteState,
        field_infos: &FieldInfos,
        doc_maps: &[DocMap],
    ) -> Result<()> {
        let mut writer = self.codec.vectors_format().writer(state)?;
        for info in field_infos.iter().filter(|f| f.has_vectors()) {
            self.merge.check_aborted()?;
            let mut values = Vec::new();
            for (input, doc_map) in self.inputs.iter().zip(doc_maps) {
                let Some(vectors) = input.core.vectors() else {
                    continue;
                };
                for doc in vectors.docs(&info.name) {
                    let Some(Some(mapped)) = doc_map.get(doc as usize) else {
                        continue;
                    };
                    if let Some(vector) = vectors.vector(&info.name, doc)? {
                        values.push((*mapped, vector));
                    }
                }
            }
            writer.add_field(info, &values)?;
        }
        writer.finish()
    }
}

/// Doc maps dropping deleted documents, and the merged doc count.
pub fn build_doc_maps(inputs: &[MergeInput]) -> (Vec<DocMap>, u32) {
    let mut next = 0u32;
    let maps = inputs
        .iter()
        .map(|input| {
            input
                .live
                .iter()
                .map(|live| {
                    live.then(|| {
                        let doc = next;
                        next += 1;
                        doc
                    })
                })
                .collect()
        })
        .collect();
    (maps, next)
}

/// Concatenates the postings of one term across sources in merged doc order.
struct MergedPostingsEnum<'a> {
    subs: Vec<(usize, Box<dyn PostingsEnum>)>,
    doc_maps: &'a [DocMap],
    current: usize,
    doc: Option<u32>,
    cost: u64,
}

impl<'a> MergedPostingsEnum<'a> {
    fn new(subs: Vec<(usize, Box<dyn PostingsEnum>)>, doc_maps: &'a [DocMap]) -> Self {
        let cost = subs.iter().map(|(_, p)| p.cost()).sum();
        MergedPostingsEnum {
            subs,
            doc_maps,
            current: 0,
            doc: None,
            cost,
        }
    }
}

impl PostingsEnum for MergedPostingsEnum<'_> {
    fn doc(&self) -> u32 {
        self.doc.unwrap_or(0)
    }

    fn next_doc(&mut self) -> Result<u32> {
        while let Some((source, postings)) = self.subs.get_mut(self.current) {
            let doc = postings.next_doc()?;
            if doc == NO_MORE_DOCS {
                self.current += 1;
                continue;
            }
            let mapped = self.doc_maps[*source]
                .get(doc as usize)
                .copied()
                .flatten();
            if let Some(mapped) = mapped {
                self.doc = Some(mapped);
                return Ok(mapped);
            }
        }
        self.doc = Some(NO_MORE_DOCS);
        Ok(NO_MORE_DOCS)
    }

    fn freq(&self) -> u32 {
        self.subs.get(self.current).map_or(0, |(_, p)| p.freq())
    }

    fn next_position(&mut self) -> Result<u32> {
        match self.subs.get_mut(self.current) {
            Some((_, postings)) => postings.next_position(),
            None => Ok(0),
        }
    }

    fn offsets(&self) -> Option<(u32, u32)> {
        self.subs.get(self.current).and_then(|(_, p)| p.offsets())
    }

    fn payload(&self) -> Option<&[u8]> {
        self.subs.get(self.current).and_then(|(_, p)| p.payload())
    }

    fn cost(&self) -> u64 {
        self.cost
    }
}

/// Merged doc ids of the documents deleted in `now` but live in `then`.
pub fn newly_deleted(then: &BitVec, now: &BitVec, doc_map: &DocMap) -> Vec<u32> {
    then.iter()
        .zip(now.iter())
        .enumerate()
        .filter(|(_, (was, is))| *was && !*is)
        .filter_map(|(doc, _)| doc_map.get(doc).copied().flatten())
        .collect()
}

/// Doc-values updates in `now` that differ from `then`, remapped.
pub fn changed_updates(then: &NumericUpdates, now: &NumericUpdates, doc_map: &DocMap) -> NumericUpdates {
    let mut changed: NumericUpdates = BTreeMap::new();
    for (field, column) in now {
        let before = then.get(field);
        for (doc, value) in column {
            if before.and_then(|b| b.get(doc)) == Some(value) {
                continue;
            }
            if let Some(Some(mapped)) = doc_map.get(*doc as usize) {
                changed
                    .entry(field.clone())
                    .or_default()
                    .insert(*mapped, *value);
            }
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::StandardAnalyzer;
    use crate::document::Document;
    use crate::index::documents_writer_per_thread::{
        DocumentsWriterPerThread, InvertContext, invert_document,
    };
    use crate::index::merge_policy::{MergeCandidate, MergeReason};
    use crate::index::segment_reader::SegmentReader;
    use crate::index::segment_info::SegmentCommitInfo;
    use crate::index::term::Term;
    use crate::storage::memory::MemoryStorage;

    fn write_segment(
        storage: &Arc<dyn Storage>,
        ctx: &InvertContext,
        name: &str,
        docs: &[(&str, i64)],
    ) -> Arc<SegmentCoreReaders> {
        let mut buffer = DocumentsWriterPerThread::new(0, 0, 0);
        for (i, (text, n)) in docs.iter().enumerate() {
            let doc = Document::builder()
                .add_text("text", *text)
                .add_numeric("n", *n)
                .build();
            buffer.add(vec![invert_document(&doc, ctx).unwrap()], i as u64 + 1);
        }
        let flushed = buffer
            .flush(storage, &crate::codec::default_codec(), name)
            .unwrap();
        Arc::new(SegmentCoreReaders::open(Arc::clone(storage), Arc::new(flushed.info)).unwrap())
    }

    fn one_merge() -> OneMerge {
        OneMerge::new(
            0,
            MergeCandidate {
                segments: vec!["_0".to_string(), "_1".to_string()],
                priority: 0.0,
                estimated_size: 0,
                reason: MergeReason::Forced,
            },
        )
    }

    #[test]
    fn test_merge_drops_deleted_and_applies_updates() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::default());
        let ctx = InvertContext {
            analyzer: Arc::new(StandardAnalyzer),
            field_numbers: Arc::new(FieldNumbers::new()),
            max_term_length: 255,
        };
        let first = write_segment(&storage, &ctx, "_0", &[("a b c", 1), ("a c e", 2)]);
        let second = write_segment(&storage, &ctx, "_1", &[("b d", 3)]);

        let mut live = BitVec::from_elem(2, true);
        live.set(0, false);
        let mut updates = NumericUpdates::new();
        updates.entry("n".to_string()).or_default().insert(0, 30);
        let inputs = vec![
            MergeInput::new(Arc::clone(&first), Arc::new(live), Arc::new(NumericUpdates::new()))
                .unwrap(),
            MergeInput::new(
                Arc::clone(&second),
                Arc::new(BitVec::from_elem(1, true)),
                Arc::new(updates),
            )
            .unwrap(),
        ];
        let merge = one_merge();
        let merged = SegmentMerger::new(
            &inputs,
            Arc::clone(&storage),
            crate::codec::default_codec(),
            &ctx.field_numbers,
            &merge,
        )
        .merge("_2")
        .unwrap();
        assert_eq!(merged.info.max_doc, 2);
        assert_eq!(merged.doc_maps, vec![vec![None, Some(0)], vec![Some(1)]]);

        let info = Arc::new(merged.info);
        let reader = SegmentReader::open(Arc::clone(&storage), &SegmentCommitInfo::new(info)).unwrap();
        assert_eq!(reader.doc_freq(&Term::new("text", "a")).unwrap(), 1);
        assert_eq!(reader.doc_freq(&Term::new("text", "b")).unwrap(), 1);
        assert_eq!(reader.doc_freq(&Term::new("text", "e")).unwrap(), 1);
        assert_eq!(reader.numeric_doc_value("n", 0).unwrap(), Some(2));
        assert_eq!(reader.numeric_doc_value("n", 1).unwrap(), Some(30));
        let stored = reader.document(1).unwrap();
        assert_eq!(stored[0].value.as_text(), Some("b d"));

        let mut postings = reader.postings(&Term::new("text", "c")).unwrap().unwrap();
        assert_eq!(postings.next_doc().unwrap(), 0);
        assert_eq!(postings.freq(), 1);
        assert_eq!(postings.next_position().unwrap(), 1);
        assert_eq!(postings.next_doc().unwrap(), NO_MORE_DOCS);
    }

    #[test]
    fn test_all_deleted_writes_nothing() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::default());
        let ctx = InvertContext {
            analyzer: Arc::new(StandardAnalyzer),
            field_numbers: Arc::new(FieldNumbers::new()),
            max_term_length: 255,
        };
        let core = write_segment(&storage, &ctx, "_0", &[("x", 1)]);
        let inputs = vec![
            MergeInput::new(core, Arc::new(BitVec::from_elem(1, false)), Arc::default()).unwrap(),
        ];
        let merge = one_merge();
        let merged = SegmentMerger::new(
            &inputs,
            Arc::clone(&storage),
            crate::codec::default_codec(),
            &ctx.field_numbers,
            &merge,
        )
        .merge("_1")
        .unwrap();
        assert!(merged.is_empty());
        assert!(!storage.file_exists("_1.si"));
    }

    #[test]
    fn test_aborted_merge_cleans_up() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::default());
        let ctx = InvertContext {
            analyzer: Arc::new(StandardAnalyzer),
            field_numbers: Arc::new(FieldNumbers::new()),
            max_term_length: 255,
        };
        let core = write_segment(&storage, &ctx, "_0", &[("x", 1)]);
        let before = storage.list_files().unwrap();
        let inputs = vec![
            MergeInput::new(core, Arc::new(BitVec::from_elem(1, true)), Arc::default()).unwrap(),
        ];
        let merge = one_merge();
        merge.abort();
        let err = SegmentMerger::new(
            &inputs,
            Arc::clone(&storage),
            crate::codec::default_codec(),
            &ctx.field_numbers,
            &merge,
        )
        .merge("_1")
        .unwrap_err();
        assert!(matches!(err, TesseraError::MergeAborted(_)));
        assert_eq!(storage.list_files().unwrap(), before);
    }

    #[test]
    fn test_carry_over_helpers() {
        let then = BitVec::from_elem(3, true);
        let mut now = then.clone();
        now.set(2, false);
        let map = vec![Some(5), None, Some(6)];
        assert_eq!(newly_deleted(&then, &now, &map), vec![6]);

        let mut before = NumericUpdates::new();
        before.entry("n".to_string()).or_default().insert(0, 1);
        let mut after = before.clone();
        after.get_mut("n").unwrap().insert(2, 7);
        let changed = changed_updates(&before, &after, &map);
        assert_eq!(changed["n"].len(), 1);
        assert_eq!(changed["n"][&6], 7);
    }
}
