//! Numeric doc-values updates (`_N_<gen>.dvu`). Each generation holds every
//! update applied to the segment so far, so readers only load the latest.

use std::collections::BTreeMap;

use crate::codec::codec_util::{open_checked, write_footer_and_close, write_header};
use crate::codec::{DocValuesUpdatesFormat, NumericUpdates, segment_file_name};
use crate::error::{Result, TesseraError};
use crate::index::segment_info::SegmentCommitInfo;
use crate::storage::Storage;
use crate::storage::structured::StructWriter;
use crate::util::to_base36;

const CODEC: &str = "DocValuesUpdates";
const VERSION: u32 = 0;
const EXTENSION: &str = "dvu";

/// The default doc-values updates format.
#[derive(Debug, Default)]
pub struct NumericUpdatesFormat;

impl DocValuesUpdatesFormat for NumericUpdatesFormat {
    fn write(
        &self,
        storage: &dyn Storage,
        info: &SegmentCommitInfo,
        updates: &NumericUpdates,
        generation: i64,
    ) -> Result<String> {
        let suffix = to_base36(generation as u64);
        let name = segment_file_name(info.name(), &suffix, EXTENSION);
        let mut out = StructWriter::new(storage.create_output(&name)?);
        write_header(&mut out, CODEC, VERSION, &info.info.id, &suffix)?;
        out.write_varint(updates.len() as u64)?;
        for (field, values) in updates {
            out.write_string(field)?;
            out.write_varint(values.len() as u64)?;
            let mut prev = 0u32;
            for (&doc, &value) in values {
                out.write_varint((doc - prev) as u64)?;
                out.write_zigzag(value)?;
                prev = doc;
            }
        }
        write_footer_and_close(out)?;
        Ok(name)
    }

    fn read(&self, storage: &dyn Storage, info: &SegmentCommitInfo) -> Result<NumericUpdates> {
        let Some(name) = info.dv_updates_file() else {
            return Ok(NumericUpdates::new());
        };
        let suffix = to_base36(info.dv_gen as u64);
        let (mut input, _) = open_checked(
            storage.open_bytes(&name)?,
            CODEC,
            VERSION,
            VERSION,
            &info.info.id,
            &suffix,
        )?;
        let fields = input.read_varint()?;
        let mut updates = NumericUpdates::new();
        for _ in 0..fields {
            let field = input.read_string()?;
            let count = input.read_varint()?;
            let mut values = BTreeMap::new();
            let mut doc = 0u32;
            for _ in 0..count {
                doc += input.read_varint_u32()?;
                if doc >= info.max_doc() {
                    return Err(TesseraError::corruption(name, format!("doc {doc} out of range")));
                }
                values.insert(doc, input.read_zigzag()?);
            }
            updates.insert(field, values);
        }
        Ok(updates)
    }
}
