//! Columnar doc values: `.dvm` holds per-field metadata, `.dvd` the packed
//! data.
//!
//! - numeric: presence bitset, minimum, bit-packed deltas from the minimum
//! - binary: presence bitset, packed end offsets, one blob
//! - sorted: sorted deduplicated dictionary, packed per-doc `ord + 1`
//! - sorted set: dictionary, packed per-doc start index, packed ords

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::codec::codec_util::{FOOTER_LENGTH, open_checked, write_footer_and_close, write_header};
use crate::codec::{
    DocValuesColumn, DocValuesConsumer, DocValuesFormat, DocValuesProducer, SegmentReadState,
    SegmentWriteState,
};
use crate::error::{Result, TesseraError};
use crate::index::field_infos::{DocValuesType, FieldInfo};
use crate::storage::FileBytes;
use crate::storage::structured::{StructReader, StructWriter};
use crate::util::packed;

const META_CODEC: &str = "DocValuesMeta";
const DATA_CODEC: &str = "DocValuesData";
const VERSION: u32 = 0;

/// The default doc values format.
#[derive(Debug, Default)]
pub struct PackedDocValuesFormat;

impl DocValuesFormat for PackedDocValuesFormat {
    fn consumer(&self, state: &SegmentWriteState) -> Result<Box<dyn DocValuesConsumer>> {
        let mut meta = state.create_output("dvm")?;
        write_header(&mut meta, META_CODEC, VERSION, &state.segment_id, "")?;
        let mut data = state.create_output("dvd")?;
        write_header(&mut data, DATA_CODEC, VERSION, &state.segment_id, "")?;
        Ok(Box::new(PackedDocValuesConsumer {
            meta,
            data,
            max_doc: state.max_doc,
        }))
    }

    fn producer(&self, state: &SegmentReadState) -> Result<Arc<dyn DocValuesProducer>> {
        Ok(Arc::new(PackedDocValuesProducer::open(state)?))
    }
}

struct PackedDocValuesConsumer {
    meta: StructWriter,
    data: StructWriter,
    max_doc: u32,
}

impl PackedDocValuesConsumer {
    /// Write packed values to `.dvd`, recording bits and pointer in `.dvm`.
    fn write_packed(&mut self, values: &[u64]) -> Result<()> {
        let bits = packed::bits_required(values.iter().copied().max().unwrap_or(0));
        self.meta.write_u8(bits)?;
        self.meta.write_u64(self.data.position())?;
        self.data.write_raw(&packed::pack(values, bits))
    }

    fn write_presence<T>(&mut self, values: &[Option<T>]) -> Result<()> {
        let all_present = values.iter().all(Option::is_some);
        self.meta.write_u8(all_present as u8)?;
        if !all_present {
            let bits: Vec<u64> = values.iter().map(|v| v.is_some() as u64).collect();
            self.meta.write_u64(self.data.position())?;
            self.data.write_raw(&packed::pack(&bits, 1))?;
        }
        Ok(())
    }

    fn write_dictionary(&mut self, dict: &[&[u8]]) -> Result<()> {
        self.meta.write_varint(dict.len() as u64)?;
        let mut ends = Vec::with_capacity(dict.len() + 1);
        ends.push(0u64);
        let mut total = 0u64;
        for value in dict {
            total += value.len() as u64;
            ends.push(total);
        }
        self.write_packed(&ends)?;
        self.meta.write_u64(self.data.position())?;
        for value in dict {
            self.data.write_raw(value)?;
        }
        Ok(())
    }
}

fn ord_of(dict: &[&[u8]], value: &[u8]) -> u64 {
    dict.binary_search(&value).unwrap_or(0) as u64
}

impl DocValuesConsumer for PackedDocValuesConsumer {
    fn add_field(&mut self, field: &FieldInfo, column: &DocValuesColumn) -> Result<()> {
        if column.len() != self.max_doc as usize {
            return Err(TesseraError::illegal_state(format!(
                "doc values column of '{}' covers {} docs, segment has {}",
                field.name,
                column.len(),
                self.max_doc
            )));
        }
        self.meta.write_varint(field.number as u64 + 1)?;
        match column {
            DocValuesColumn::Numeric(values) => {
                self.meta.write_u8(DocValuesType::Numeric.to_u8())?;
                self.write_presence(values)?;
                let min = values.iter().flatten().copied().min().unwrap_or(0);
                self.meta.write_i64(min)?;
                let deltas: Vec<u64> = values
                    .iter()
                    .map(|v| v.map_or(0, |v| v.wrapping_sub(min) as u64))
                    .collect();
                self.write_packed(&deltas)?;
            }
            DocValuesColumn::Binary(values) => {
                self.meta.write_u8(DocValuesType::Binary.to_u8())?;
                self.write_presence(values)?;
                let mut ends = Vec::with_capacity(values.len() + 1);
                ends.push(0u64);
                let mut total = 0u64;
                for value in values {
                    total += value.as_ref().map_or(0, |v| v.len() as u64);
                    ends.push(total);
                }
                self.write_packed(&ends)?;
                self.meta.write_u64(self.data.position())?;
                for value in values.iter().flatten() {
                    self.data.write_raw(value)?;
                }
            }
            DocValuesColumn::Sorted(values) => {
                self.meta.write_u8(DocValuesType::Sorted.to_u8())?;
                let dict: BTreeSet<&[u8]> = values.iter().flatten().map(Vec::as_slice).collect();
                let dict: Vec<&[u8]> = dict.into_iter().collect();
                self.write_dictionary(&dict)?;
                let ords: Vec<u64> = values
                    .iter()
                    .map(|v| v.as_ref().map_or(0, |v| ord_of(&dict, v) + 1))
                    .collect();
                self.write_packed(&ords)?;
            }
            DocValuesColumn::SortedSet(values) => {
                self.meta.write_u8(DocValuesType::SortedSet.to_u8())?;
                let dict: BTreeSet<&[u8]> = values
                    .iter()
                    .flat_map(|set| set.iter().map(Vec::as_slice))
                    .collect();
                let dict: Vec<&[u8]> = dict.into_iter().collect();
                self.write_dictionary(&dict)?;
                let mut starts = Vec::with_capacity(values.len() + 1);
                let mut ords = Vec::new();
                starts.push(0u64);
                for set in values {
                    let mut doc_ords: Vec<u64> = set.iter().map(|v| ord_of(&dict, v)).collect();
                    doc_ords.sort_unstable();
                    doc_ords.dedup();
                    ords.extend(doc_ords);
                    starts.push(ords.len() as u64);
                }
                self.write_packed(&starts)?;
                self.write_packed(&ords)?;
            }
        }
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<()> {
        let PackedDocValuesConsumer { mut meta, data, .. } = *self;
        meta.write_varint(0)?;
        write_footer_and_close(meta)?;
        write_footer_and_close(data)
    }
}

#[derive(Debug, Clone, Copy)]
struct PackedMeta {
    bits: u8,
    fp: u64,
}

#[derive(Debug, Clone, Copy)]
struct DictMeta {
    value_count: u64,
    ends: PackedMeta,
    blob_fp: u64,
}

#[derive(Debug, Clone, Copy)]
enum Entry {
    Numeric {
        presence: Option<u64>,
        min: i64,
        values: PackedMeta,
    },
    Binary {
        presence: Option<u64>,
        ends: PackedMeta,
        blob_fp: u64,
    },
    Sorted {
        dict: DictMeta,
        ords: PackedMeta,
    },
    SortedSet {
        dict: DictMeta,
        starts: PackedMeta,
        ords: PackedMeta,
    },
}

struct PackedDocValuesProducer {
    data: FileBytes,
    body_end: usize,
    max_doc: u32,
    entries: HashMap<String, Entry>,
}

impl fmt::Debug for PackedDocValuesProducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PackedDocValuesProducer")
            .field("file", &self.data.name())
            .field("fields", &self.entries.len())
            .finish()
    }
}

fn read_packed(meta: &mut StructReader) -> Result<PackedMeta> {
    let bits = meta.read_u8()?;
    if bits > 64 {
        return Err(TesseraError::corruption(meta.name(), format!("invalid bit width {bits}")));
    }
    Ok(PackedMeta {
        bits,
        fp: meta.read_u64()?,
    })
}

fn read_presence(meta: &mut StructReader) -> Result<Option<u64>> {
    Ok(if meta.read_u8()? == 1 {
        None
    } else {
        Some(meta.read_u64()?)
    })
}

fn read_dict(meta: &mut StructReader) -> Result<DictMeta> {
    Ok(DictMeta {
        value_count: meta.read_varint()?,
        ends: read_packed(meta)?,
        blob_fp: meta.read_u64()?,
    })
}

impl PackedDocValuesProducer {
    fn open(state: &SegmentReadState) -> Result<Self> {
        let id = &state.segment_id;
        let (mut meta, _) = open_checked(state.open("dvm")?, META_CODEC, VERSION, VERSION, id, "")?;
        let (data, _) = open_checked(state.open("dvd")?, DATA_CODEC, VERSION, VERSION, id, "")?;
        let mut entries = HashMap::new();
        loop {
            let number = meta.read_varint()?;
            if number == 0 {
                break;
            }
            let number = (number - 1) as u32;
            let info = state.field_infos.field_by_number(number).ok_or_else(|| {
                TesseraError::corruption(meta.name(), format!("unknown field number {number}"))
            })?;
            let dv_type = DocValuesType::from_u8(meta.read_u8()?);
            let entry = match dv_type {
                Some(DocValuesType::Numeric) => Entry::Numeric {
                    presence: read_presence(&mut meta)?,
                    min: meta.read_i64()?,
                    values: read_packed(&mut meta)?,
                },
                Some(DocValuesType::Binary) => Entry::Binary {
                    presence: read_presence(&mut meta)?,
                    ends: read_packed(&mut meta)?,
                    blob_fp: meta.read_u64()?,
                },
                Some(DocValuesType::Sorted) => Entry::Sorted {
                    dict: read_dict(&mut meta)?,
                    ords: read_packed(&mut meta)?,
                },
                Some(DocValuesType::SortedSet) => Entry::SortedSet {
                    dict: read_dict(&mut meta)?,
                    starts: read_packed(&mut meta)?,
                    ords: read_packed(&mut meta)?,
                },
                _ => {
                    return Err(TesseraError::corruption(
                        meta.name(),
                        format!("invalid doc values type for field '{}'", info.name),
                    ));
                }
            };
            entries.insert(info.name.clone(), entry);
        }
        let body_end = data.end();
        Ok(PackedDocValuesProducer {
            data: data.bytes().clone(),
            body_end,
            max_doc: state.max_doc,
            entries,
        })
    }

    fn region(&self, fp: u64) -> Result<&[u8]> {
        let fp = fp as usize;
        if fp > self.body_end {
            return Err(TesseraError::corruption(
                self.data.name(),
                format!("pointer {fp} past end of data"),
            ));
        }
        Ok(&self.data.as_slice()[fp..self.body_end])
    }

    fn get(&self, meta: PackedMeta, index: u64) -> Result<u64> {
        Ok(packed::get(self.region(meta.fp)?, meta.bits, index as usize))
    }

    fn present(&self, presence: Option<u64>, doc: u32) -> Result<bool> {
        match presence {
            None => Ok(true),
            Some(fp) => Ok(packed::get(self.region(fp)?, 1, doc as usize) == 1),
        }
    }

    fn blob(&self, blob_fp: u64, start: u64, end: u64) -> Result<Vec<u8>> {
        let region = self.region(blob_fp)?;
        region
            .get(start as usize..end as usize)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| TesseraError::corruption(self.data.name(), "value past end of data"))
    }

    fn lookup_ord(&self, dict: &DictMeta, ord: u64) -> Result<Vec<u8>> {
        if ord >= dict.value_count {
            return Err(TesseraError::corruption(
                self.data.name(),
                format!("ord {ord} out of range {}", dict.value_count),
            ));
        }
        let start = self.get(dict.ends, ord)?;
        let end = self.get(dict.ends, ord + 1)?;
        self.blob(dict.blob_fp, start, end)
    }

    fn check_doc(&self, doc: u32) -> Result<()> {
        if doc >= self.max_doc {
            return Err(TesseraError::illegal_argument(format!(
                "doc {doc} out of range, segment has {} docs",
                self.max_doc
            )));
        }
        Ok(())
    }

    fn entry(&self, field: &str) -> Option<Entry> {
        self.entries.get(field).copied()
    }
}

impl DocValuesProducer for PackedDocValuesProducer {
    fn numeric(&self, field: &str, doc: u32) -> Result<Option<i64>> {
        self.check_doc(doc)?;
        match self.entry(field) {
            Some(Entry::Numeric {
                presence,
                min,
                values,
            }) => {
                if !self.present(presence, doc)? {
                    return Ok(None);
                }
                Ok(Some(min.wrapping_add(self.get(values, doc as u64)? as i64)))
            }
            _ => Ok(None),
        }
    }

    fn binary(&self, field: &str, doc: u32) -> Result<Option<Vec<u8>>> {
        self.check_doc(doc)?;
        match self.entry(field) {
            Some(Entry::Binary {
                presence,
                ends,
                blob_fp,
            }) => {
                if !self.present(presence, doc)? {
                    return Ok(None);
                }
                let start = self.get(ends, doc as u64)?;
                let end = self.get(ends, doc as u64 + 1)?;
                Ok(Some(self.blob(blob_fp, start, end)?))
            }
            _ => Ok(None),
        }
    }

    fn sorted(&self, field: &str, doc: u32) -> Result<Option<Vec<u8>>> {
        self.check_doc(doc)?;
        match self.entry(field) {
            Some(Entry::Sorted { dict, ords }) => match self.get(ords, doc as u64)? {
                0 => Ok(None),
                ord => Ok(Some(self.lookup_ord(&dict, ord - 1)?)),
            },
            _ => Ok(None),
        }
    }

    fn sorted_set(&self, field: &str, doc: u32) -> Result<Vec<Vec<u8>>> {
        self.check_doc(doc)?;
        match self.entry(field) {
            Some(Entry::SortedSet { dict, starts, ords }) => {
                let start = self.get(starts, doc as u64)?;
                let end = self.get(starts, doc as u64 + 1)?;
                (start..end)
                    .map(|i| self.lookup_ord(&dict, self.get(ords, i)?))
                    .collect()
            }
            _ => Ok(Vec::new()),
        }
    }

    fn column(&self, field: &FieldInfo) -> Result<Option<DocValuesColumn>> {
        let Some(entry) = self.entry(&field.name) else {
            return Ok(None);
        };
        let docs = 0..self.max_doc;
        let column = match entry {
            Entry::Numeric { .. } => DocValuesColumn::Numeric(
                docs.map(|d| self.numeric(&field.name, d))
                    .collect::<Result<_>>()?,
            ),
            Entry::Binary { .. } => DocValuesColumn::Binary(
                docs.map(|d| self.binary(&field.name, d))
                    .collect::<Result<_>>()?,
            ),
            Entry::Sorted { .. } => DocValuesColumn::Sorted(
                docs.map(|d| self.sorted(&field.name, d))
                    .collect::<Result<_>>()?,
            ),
            Entry::SortedSet { .. } => DocValuesColumn::SortedSet(
                docs.map(|d| self.sorted_set(&field.name, d))
                    .collect::<Result<_>>()?,
            ),
        };
        Ok(Some(column))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::field_infos::FieldInfos;
    use crate::storage::Storage;
    use crate::storage::memory::MemoryStorage;

    fn dv_field(name: &str, number: u32, dv: DocValuesType) -> FieldInfo {
        let mut info = FieldInfo::new(name, number);
        info.doc_values_type = dv;
        info
    }

    #[test]
    fn test_all_column_types_round_trip() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::default());
        let fields = vec![
            dv_field("price", 0, DocValuesType::Numeric),
            dv_field("blob", 1, DocValuesType::Binary),
            dv_field("color", 2, DocValuesType::Sorted),
            dv_field("tags", 3, DocValuesType::SortedSet),
        ];
        let infos = Arc::new(FieldInfos::new(fields.clone()));
        let columns = vec![
            DocValuesColumn::Numeric(vec![Some(i64::MIN), None, Some(i64::MAX), Some(-3)]),
            DocValuesColumn::Binary(vec![Some(b"xy".to_vec()), Some(vec![]), None, Some(vec![9])]),
            DocValuesColumn::Sorted(vec![
                Some(b"red".to_vec()),
                Some(b"blue".to_vec()),
                None,
                Some(b"red".to_vec()),
            ]),
            DocValuesColumn::SortedSet(vec![
                vec![b"b".to_vec(), b"a".to_vec()],
                vec![],
                vec![b"c".to_vec()],
                vec![b"a".to_vec(), b"a".to_vec()],
            ]),
        ];
        let state = SegmentWriteState::new(storage.clone(), "_2", [2; 16], 4, infos.clone());
        let mut consumer = PackedDocValuesFormat.consumer(&state).unwrap();
        for (field, column) in fields.iter().zip(&columns) {
            consumer.add_field(field, column).unwrap();
        }
        consumer.finish().unwrap();

        let read_state = SegmentReadState {
            storage,
            segment_name: "_2".into(),
            segment_id: [2; 16],
            max_doc: 4,
            field_infos: infos,
        };
        let producer = PackedDocValuesFormat.producer(&read_state).unwrap();
        assert_eq!(producer.numeric("price", 0).unwrap(), Some(i64::MIN));
        assert_eq!(producer.numeric("price", 1).unwrap(), None);
        assert_eq!(producer.numeric("price", 2).unwrap(), Some(i64::MAX));
        assert_eq!(producer.binary("blob", 1).unwrap(), Some(vec![]));
        assert_eq!(producer.binary("blob", 2).unwrap(), None);
        assert_eq!(producer.sorted("color", 1).unwrap(), Some(b"blue".to_vec()));
        assert_eq!(producer.sorted("color", 2).unwrap(), None);
        assert_eq!(
            producer.sorted_set("tags", 0).unwrap(),
            vec![b"a".to_vec(), b"b".to_vec()]
        );
        assert_eq!(producer.sorted_set("tags", 3).unwrap(), vec![b"a".to_vec()]);
        assert_eq!(producer.numeric("missing", 0).unwrap(), None);
        assert!(producer.numeric("price", 4).is_err());

        let column = producer.column(&fields[0]).unwrap().unwrap();
        assert_eq!(column, columns[0]);
        let column = producer.column(&fields[2]).unwrap().unwrap();
        assert_eq!(column, columns[2]);
    }
}
