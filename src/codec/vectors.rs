//! Dense vectors (`.vec`): per field the dimension, encoding and similarity,
//! the delta-coded ids of docs with a vector, then the packed values.
//! Nearest-neighbour search is an exact scan.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};

use crate::codec::codec_util::{open_checked, write_footer_and_close, write_header};
use crate::codec::{
    SegmentReadState, SegmentWriteState, VectorsFormat, VectorsReader, VectorsWriter,
};
use crate::document::VectorValue;
use crate::error::{Result, TesseraError};
use crate::index::field_infos::{FieldInfo, VectorEncoding, VectorSimilarity};
use crate::storage::FileBytes;
use crate::storage::structured::StructWriter;

const CODEC: &str = "FlatVectors";
const VERSION: u32 = 0;

/// The default vectors format.
#[derive(Debug, Default)]
pub struct FlatVectorsFormat;

impl VectorsFormat for FlatVectorsFormat {
    fn writer(&self, state: &SegmentWriteState) -> Result<Box<dyn VectorsWriter>> {
        let mut out = state.create_output("vec")?;
        write_header(&mut out, CODEC, VERSION, &state.segment_id, "")?;
        Ok(Box::new(FlatVectorsWriter {
            out,
            max_doc: state.max_doc,
        }))
    }

    fn reader(&self, state: &SegmentReadState) -> Result<Arc<dyn VectorsReader>> {
        Ok(Arc::new(FlatVectorsReader::open(state)?))
    }
}

struct FlatVectorsWriter {
    out: StructWriter,
    max_doc: u32,
}

impl VectorsWriter for FlatVectorsWriter {
    fn add_field(&mut self, field: &FieldInfo, values: &[(u32, VectorValue)]) -> Result<()> {
        let dim = field.vector_dimension as usize;
        let mut last: Option<u32> = None;
        for (doc, value) in values {
            if *doc >= self.max_doc || last.is_some_and(|l| l >= *doc) {
                return Err(TesseraError::illegal_state(format!(
                    "vector docs of field '{}' out of order at doc {doc}",
                    field.name
                )));
            }
            if value.dimension() != dim || value.encoding() != field.vector_encoding {
                return Err(TesseraError::illegal_argument(format!(
                    "vector of field '{}' has dimension {} ({:?}), expected {dim} ({:?})",
                    field.name,
                    value.dimension(),
                    value.encoding(),
                    field.vector_encoding
                )));
            }
            last = Some(*doc);
        }

        self.out.write_varint(field.number as u64 + 1)?;
        self.out.write_u32(field.vector_dimension)?;
        self.out.write_u8(field.vector_encoding as u8)?;
        self.out.write_u8(field.vector_similarity.to_u8())?;
        self.out.write_varint(values.len() as u64)?;
        let mut prev = 0u32;
        for (doc, _) in values {
            self.out.write_varint((doc - prev) as u64)?;
            prev = *doc;
        }
        for (_, value) in values {
            match value {
                VectorValue::Float(v) => {
                    for x in v {
                        self.out.write_f32(*x)?;
                    }
                }
                VectorValue::Byte(v) => {
                    let raw: Vec<u8> = v.iter().map(|b| *b as u8).collect();
                    self.out.write_raw(&raw)?;
                }
            }
        }
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<()> {
        let mut out = self.out;
        out.write_varint(0)?;
        write_footer_and_close(out)
    }
}

struct FieldVectors {
    dimension: usize,
    encoding: VectorEncoding,
    similarity: VectorSimilarity,
    docs: Vec<u32>,
    values_fp: usize,
}

impl FieldVectors {
    fn width(&self) -> usize {
        match self.encoding {
            VectorEncoding::Float32 => 4,
            VectorEncoding::Byte => 1,
        }
    }
}

struct FlatVectorsReader {
    data: FileBytes,
    fields: HashMap<String, FieldVectors>,
}

impl fmt::Debug for FlatVectorsReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlatVectorsReader")
            .field("file", &self.data.name())
            .field("fields", &self.fields.len())
            .finish()
    }
}

impl FlatVectorsReader {
    fn open(state: &SegmentReadState) -> Result<Self> {
        let (mut input, _) = open_checked(
            state.open("vec")?,
            CODEC,
            VERSION,
            VERSION,
            &state.segment_id,
            "",
        )?;
        let mut fields = HashMap::new();
        loop {
            let number = input.read_varint()?;
            if number == 0 {
                break;
            }
            let number = (number - 1) as u32;
            let info = state.field_infos.field_by_number(number).ok_or_else(|| {
                TesseraError::corruption(input.name(), format!("unknown field number {number}"))
            })?;
            let dimension = input.read_u32()? as usize;
            let encoding = match input.read_u8()? {
                0 => VectorEncoding::Float32,
                1 => VectorEncoding::Byte,
                other => {
                    return Err(TesseraError::corruption(
                        input.name(),
                        format!("unknown vector encoding {other}"),
                    ));
                }
            };
            let similarity = VectorSimilarity::from_u8(input.read_u8()?)
                .ok_or_else(|| TesseraError::corruption(input.name(), "unknown similarity"))?;
            let count = input.read_varint()? as usize;
            let mut docs = Vec::with_capacity(count.min(state.max_doc as usize));
            let mut doc = 0u32;
            for _ in 0..count {
                doc += input.read_varint_u32()?;
                if doc >= state.max_doc {
                    return Err(TesseraError::corruption(input.name(), "vector doc out of range"));
                }
                docs.push(doc);
            }
            let field = FieldVectors {
                dimension,
                encoding,
                similarity,
                docs,
                values_fp: input.position(),
            };
            input.skip(count * dimension * field.width())?;
            fields.insert(info.name.clone(), field);
        }
        Ok(FlatVectorsReader {
            data: input.bytes().clone(),
            fields,
        })
    }

    fn value_at(&self, field: &FieldVectors, index: usize) -> VectorValue {
        let size = field.dimension * field.width();
        let start = field.values_fp + index * size;
        let raw = &self.data.as_slice()[start..start + size];
        match field.encoding {
            VectorEncoding::Float32 => {
                let mut values = vec![0f32; field.dimension];
                LittleEndian::read_f32_into(raw, &mut values);
                VectorValue::Float(values)
            }
            VectorEncoding::Byte => VectorValue::Byte(raw.iter().map(|b| *b as i8).collect()),
        }
    }
}

#[derive(PartialEq)]
struct Scored(f32, u32);

impl Eq for Scored {}

impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Reversed so the heap keeps the worst hit on top; ties prefer lower doc ids.
impl Ord for Scored {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .0
            .total_cmp(&self.0)
            .then_with(|| self.1.cmp(&other.1))
    }
}

impl VectorsReader for FlatVectorsReader {
    fn vector(&self, field: &str, doc: u32) -> Result<Option<VectorValue>> {
        let Some(vectors) = self.fields.get(field) else {
            return Ok(None);
        };
        Ok(vectors
            .docs
            .binary_search(&doc)
            .ok()
            .map(|index| self.value_at(vectors, index)))
    }

    fn docs(&self, field: &str) -> Vec<u32> {
        self.fields
            .get(field)
            .map(|f| f.docs.clone())
            .unwrap_or_default()
    }

    fn search(
        &self,
        field: &str,
        query: &[f32],
        k: usize,
        accept: &dyn Fn(u32) -> bool,
    ) -> Result<Vec<(u32, f32)>> {
        let Some(vectors) = self.fields.get(field) else {
            return Ok(Vec::new());
        };
        if query.len() != vectors.dimension {
            return Err(TesseraError::illegal_argument(format!(
                "query vector has dimension {}, field '{field}' has {}",
                query.len(),
                vectors.dimension
            )));
        }
        let mut heap = BinaryHeap::with_capacity(k + 1);
        if k == 0 {
            return Ok(Vec::new());
        }
        for (index, &doc) in vectors.docs.iter().enumerate() {
            if !accept(doc) {
                continue;
            }
            let value = self.value_at(vectors, index).to_f32();
            heap.push(Scored(vectors.similarity.score(query, &value), doc));
            if heap.len() > k {
                heap.pop();
            }
        }
        let mut hits: Vec<(u32, f32)> = heap.into_iter().map(|s| (s.1, s.0)).collect();
        hits.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        Ok(hits)
    }
}
