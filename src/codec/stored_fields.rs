//! Stored fields: `.fdt` holds the typed values of each document, `.fdx`
//! holds one fixed-width pointer per document into `.fdt`.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::codec::codec_util::{FOOTER_LENGTH, open_checked, write_footer_and_close, write_header};
use crate::codec::{
    SegmentReadState, SegmentWriteState, StoredFieldsFormat, StoredFieldsReader,
    StoredFieldsWriter,
};
use crate::document::StoredValue;
use crate::error::{Result, TesseraError};
use crate::index::field_infos::{FieldInfo, FieldInfos};
use crate::storage::FileBytes;
use crate::storage::structured::{StructReader, StructWriter};

const DATA_CODEC: &str = "StoredFieldsData";
const INDEX_CODEC: &str = "StoredFieldsIndex";
const VERSION: u32 = 0;

const TYPE_TEXT: u8 = 0;
const TYPE_LONG: u8 = 1;
const TYPE_DOUBLE: u8 = 2;
const TYPE_BYTES: u8 = 3;

/// One stored value of a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredField {
    pub name: String,
    pub value: StoredValue,
}

/// The default stored fields format.
#[derive(Debug, Default)]
pub struct SimpleStoredFieldsFormat;

impl StoredFieldsFormat for SimpleStoredFieldsFormat {
    fn writer(&self, state: &SegmentWriteState) -> Result<Box<dyn StoredFieldsWriter>> {
        let mut data = state.create_output("fdt")?;
        write_header(&mut data, DATA_CODEC, VERSION, &state.segment_id, "")?;
        let mut index = state.create_output("fdx")?;
        write_header(&mut index, INDEX_CODEC, VERSION, &state.segment_id, "")?;
        Ok(Box::new(SimpleStoredFieldsWriter {
            data,
            index,
            num_docs: 0,
            pending: Vec::new(),
            in_doc: false,
        }))
    }

    fn reader(&self, state: &SegmentReadState) -> Result<Arc<dyn StoredFieldsReader>> {
        let id = &state.segment_id;
        let (data, _) = open_checked(state.open("fdt")?, DATA_CODEC, VERSION, VERSION, id, "")?;
        let (index, _) = open_checked(state.open("fdx")?, INDEX_CODEC, VERSION, VERSION, id, "")?;
        // Pointer table, then the doc count as a trailing u64.
        let pointers_start = index.position();
        let count_at = index.end().checked_sub(8).filter(|&at| at >= pointers_start);
        let count_at = count_at
            .ok_or_else(|| TesseraError::corruption(index.name(), "missing document count"))?;
        let mut trailer = StructReader::with_range(index.bytes().clone(), count_at, index.end());
        let num_docs = trailer.read_u64()?;
        if num_docs != state.max_doc as u64 {
            return Err(TesseraError::corruption(
                index.name(),
                format!("stored fields for {num_docs} docs, segment has {}", state.max_doc),
            ));
        }
        if pointers_start + num_docs as usize * 8 != count_at {
            return Err(TesseraError::corruption(index.name(), "pointer table size mismatch"));
        }
        let num_docs = num_docs as u32;
        Ok(Arc::new(SimpleStoredFieldsReader {
            data: data.bytes().clone(),
            index: index.bytes().clone(),
            pointers_start,
            num_docs,
            field_infos: state.field_infos.clone(),
        }))
    }
}

struct SimpleStoredFieldsWriter {
    data: StructWriter,
    index: StructWriter,
    num_docs: u32,
    pending: Vec<(u32, StoredValue)>,
    in_doc: bool,
}

impl StoredFieldsWriter for SimpleStoredFieldsWriter {
    fn start_document(&mut self) -> Result<()> {
        if self.in_doc {
            return Err(TesseraError::illegal_state("previous document not finished"));
        }
        self.in_doc = true;
        self.pending.clear();
        Ok(())
    }

    fn write_field(&mut self, field: &FieldInfo, value: &StoredValue) -> Result<()> {
        self.pending.push((field.number, value.clone()));
        Ok(())
    }

    fn finish_document(&mut self) -> Result<()> {
        if !self.in_doc {
            return Err(TesseraError::illegal_state("no document started"));
        }
        self.index.write_u64(self.data.position())?;
        self.data.write_varint(self.pending.len() as u64)?;
        for (number, value) in &self.pending {
            self.data.write_varint(*number as u64)?;
            match value {
                StoredValue::Text(text) => {
                    self.data.write_u8(TYPE_TEXT)?;
                    self.data.write_string(text)?;
                }
                StoredValue::Long(v) => {
                    self.data.write_u8(TYPE_LONG)?;
                    self.data.write_zigzag(*v)?;
                }
                StoredValue::Double(v) => {
                    self.data.write_u8(TYPE_DOUBLE)?;
                    self.data.write_f64(*v)?;
                }
                StoredValue::Bytes(bytes) => {
                    self.data.write_u8(TYPE_BYTES)?;
                    self.data.write_bytes(bytes)?;
                }
            }
        }
        self.num_docs += 1;
        self.in_doc = false;
        Ok(())
    }

    fn finish(self: Box<Self>, num_docs: u32) -> Result<()> {
        if num_docs != self.num_docs || self.in_doc {
            return Err(TesseraError::illegal_state(format!(
                "wrote {} stored documents, expected {num_docs}",
                self.num_docs
            )));
        }
        let SimpleStoredFieldsWriter {
            data, mut index, ..
        } = *self;
        index.write_u64(num_docs as u64)?;
        write_footer_and_close(data)?;
        write_footer_and_close(index)
    }
}

struct SimpleStoredFieldsReader {
    data: FileBytes,
    index: FileBytes,
    pointers_start: usize,
    num_docs: u32,
    field_infos: Arc<FieldInfos>,
}

impl fmt::Debug for SimpleStoredFieldsReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimpleStoredFieldsReader")
            .field("file", &self.data.name())
            .field("num_docs", &self.num_docs)
            .finish()
    }
}

impl StoredFieldsReader for SimpleStoredFieldsReader {
    fn document(&self, doc: u32) -> Result<Vec<StoredField>> {
        if doc >= self.num_docs {
            return Err(TesseraError::illegal_argument(format!(
                "doc {doc} out of range, segment has {} docs",
                self.num_docs
            )));
        }
        let mut pointer = StructReader::with_range(
            self.index.clone(),
            self.pointers_start + doc as usize * 8,
            self.index.len() - FOOTER_LENGTH,
        );
        let fp = pointer.read_u64()? as usize;
        let mut input =
            StructReader::with_range(self.data.clone(), fp, self.data.len() - FOOTER_LENGTH);
        let count = input.read_varint()? as usize;
        let mut fields = Vec::with_capacity(count);
        for _ in 0..count {
            let number = input.read_varint_u32()?;
            let name = self
                .field_infos
                .field_by_number(number)
                .map(|f| f.name.clone())
                .ok_or_else(|| {
                    TesseraError::corruption(self.data.name(), format!("unknown field {number}"))
                })?;
            let value = match input.read_u8()? {
                TYPE_TEXT => StoredValue::Text(input.read_string()?),
                TYPE_LONG => StoredValue::Long(input.read_zigzag()?),
                TYPE_DOUBLE => StoredValue::Double(input.read_f64()?),
                TYPE_BYTES => StoredValue::Bytes(input.read_bytes()?),
                other => {
                    return Err(TesseraError::corruption(
                        self.data.name(),
                        format!("unknown stored value type {other}"),
                    ));
                }
            };
            fields.push(StoredField { name, value });
        }
        Ok(fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;
    use crate::storage::memory::MemoryStorage;

    #[test]
    fn test_stored_fields_round_trip() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::default());
        let title = FieldInfo::new("title", 0);
        let price = FieldInfo::new("price", 1);
        let infos = Arc::new(FieldInfos::new(vec![title.clone(), price.clone()]));
        let state = SegmentWriteState::new(storage.clone(), "_1", [1; 16], 3, infos.clone());
        let format = SimpleStoredFieldsFormat;
        let mut writer = format.writer(&state).unwrap();
        writer.start_document().unwrap();
        writer
            .write_field(&title, &StoredValue::Text("hello".into()))
            .unwrap();
        writer.write_field(&price, &StoredValue::Long(-5)).unwrap();
        writer.finish_document().unwrap();
        writer.start_document().unwrap();
        writer.finish_document().unwrap();
        writer.start_document().unwrap();
        writer
            .write_field(&price, &StoredValue::Double(2.5))
            .unwrap();
        writer
            .write_field(&title, &StoredValue::Bytes(vec![0, 1, 2]))
            .unwrap();
        writer.finish_document().unwrap();
        writer.finish(3).unwrap();

        let read_state = SegmentReadState {
            storage,
            segment_name: "_1".into(),
            segment_id: [1; 16],
            max_doc: 3,
            field_infos: infos,
        };
        let reader = format.reader(&read_state).unwrap();
        let doc0 = reader.document(0).unwrap();
        assert_eq!(doc0.len(), 2);
        assert_eq!(doc0[0].name, "title");
        assert_eq!(doc0[0].value, StoredValue::Text("hello".into()));
        assert_eq!(doc0[1].value, StoredValue::Long(-5));
        assert!(reader.document(1).unwrap().is_empty());
        let doc2 = reader.document(2).unwrap();
        assert_eq!(doc2[0].value, StoredValue::Double(2.5));
        assert_eq!(doc2[1].value, StoredValue::Bytes(vec![0, 1, 2]));
        assert!(reader.document(3).is_err());
    }

    #[test]
    fn test_doc_count_mismatch_rejected() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::default());
        let infos = Arc::new(FieldInfos::default());
        let state = SegmentWriteState::new(storage, "_1", [1; 16], 2, infos);
        let mut writer = SimpleStoredFieldsFormat.writer(&state).unwrap();
        writer.start_document().unwrap();
        writer.finish_document().unwrap();
        assert!(writer.finish(2).is_err());
    }
}
