//! Field infos (`.fnm`).

use crate::codec::codec_util::{open_checked, write_footer_and_close, write_header};
use crate::codec::{FieldInfosFormat, SegmentWriteState, segment_file_name};
use crate::error::{Result, TesseraError};
use crate::index::field_infos::{
    DocValuesType, FieldInfo, FieldInfos, IndexOptions, VectorEncoding, VectorSimilarity,
};
use crate::index::segment_info::SegmentInfo;
use crate::storage::Storage;

const CODEC: &str = "FieldInfos";
const VERSION: u32 = 0;
const EXTENSION: &str = "fnm";

const STORE_PAYLOADS: u8 = 0x1;

/// The default field infos format.
#[derive(Debug, Default)]
pub struct SimpleFieldInfosFormat;

impl FieldInfosFormat for SimpleFieldInfosFormat {
    fn write(&self, state: &SegmentWriteState, infos: &FieldInfos) -> Result<()> {
        let mut out = state.create_output(EXTENSION)?;
        write_header(&mut out, CODEC, VERSION, &state.segment_id, "")?;
        out.write_varint(infos.len() as u64)?;
        for info in infos.iter() {
            out.write_string(&info.name)?;
            out.write_varint(info.number as u64)?;
            out.write_u8(info.index_options.to_u8())?;
            out.write_u8(if info.store_payloads { STORE_PAYLOADS } else { 0 })?;
            out.write_u8(info.doc_values_type.to_u8())?;
            out.write_varint(info.vector_dimension as u64)?;
            out.write_u8(info.vector_encoding as u8)?;
            out.write_u8(info.vector_similarity.to_u8())?;
        }
        write_footer_and_close(out)
    }

    fn read(&self, storage: &dyn Storage, segment: &SegmentInfo) -> Result<FieldInfos> {
        let name = segment_file_name(&segment.name, "", EXTENSION);
        let (mut input, _) =
            open_checked(storage.open_bytes(&name)?, CODEC, VERSION, VERSION, &segment.id, "")?;
        let count = input.read_varint()? as usize;
        let mut fields = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            let field_name = input.read_string()?;
            let number = input.read_varint_u32()?;
            let corrupt = |what: &str| {
                TesseraError::corruption(name.as_str(), format!("invalid {what} for field '{field_name}'"))
            };
            let index_options =
                IndexOptions::from_u8(input.read_u8()?).ok_or_else(|| corrupt("index options"))?;
            let flags = input.read_u8()?;
            let doc_values_type =
                DocValuesType::from_u8(input.read_u8()?).ok_or_else(|| corrupt("doc values type"))?;
            let vector_dimension = input.read_varint_u32()?;
            let vector_encoding = match input.read_u8()? {
                0 => VectorEncoding::Float32,
                1 => VectorEncoding::Byte,
                _ => return Err(corrupt("vector encoding")),
            };
            let vector_similarity = VectorSimilarity::from_u8(input.read_u8()?)
                .ok_or_else(|| corrupt("vector similarity"))?;
            fields.push(FieldInfo {
                name: field_name,
                number,
                index_options,
                store_payloads: flags & STORE_PAYLOADS != 0,
                doc_values_type,
                vector_dimension,
                vector_encoding,
                vector_similarity,
            });
        }
        let infos = FieldInfos::new(fields);
        if infos.len() != count {
            return Err(TesseraError::corruption(name, "duplicate field names"));
        }
        Ok(infos)
    }
}
