//! Segment info (`.si`).

use std::collections::{BTreeMap, BTreeSet};

use crate::codec::codec_util::{open_checked, write_footer_and_close, write_header};
use crate::codec::{SegmentInfoFormat, parse_segment_name, segment_file_name};
use crate::error::{Result, TesseraError};
use crate::index::segment_info::SegmentInfo;
use crate::storage::Storage;
use crate::storage::structured::{StructReader, StructWriter};

const CODEC: &str = "SegmentInfo";
const VERSION: u32 = 0;
const EXTENSION: &str = "si";

/// The default segment info format.
#[derive(Debug, Default)]
pub struct SimpleSegmentInfoFormat;

fn write_map(out: &mut StructWriter, map: &BTreeMap<String, String>) -> Result<()> {
    out.write_varint(map.len() as u64)?;
    for (key, value) in map {
        out.write_string(key)?;
        out.write_string(value)?;
    }
    Ok(())
}

fn read_map(input: &mut StructReader) -> Result<BTreeMap<String, String>> {
    let count = input.read_varint()?;
    let mut map = BTreeMap::new();
    for _ in 0..count {
        let key = input.read_string()?;
        map.insert(key, input.read_string()?);
    }
    Ok(map)
}

impl SegmentInfoFormat for SimpleSegmentInfoFormat {
    fn extension(&self) -> &str {
        EXTENSION
    }

    fn write(&self, storage: &dyn Storage, info: &SegmentInfo) -> Result<()> {
        let name = segment_file_name(&info.name, "", EXTENSION);
        if !info.files.contains(&name) {
            return Err(TesseraError::illegal_state(format!(
                "segment {} does not list its own info file",
                info.name
            )));
        }
        let mut out = StructWriter::new(storage.create_output(&name)?);
        write_header(&mut out, CODEC, VERSION, &info.id, "")?;
        out.write_string(&info.version)?;
        out.write_varint(info.max_doc as u64)?;
        out.write_string(&info.codec)?;
        write_map(&mut out, &info.diagnostics)?;
        write_map(&mut out, &info.attributes)?;
        out.write_varint(info.files.len() as u64)?;
        for file in &info.files {
            out.write_string(file)?;
        }
        write_footer_and_close(out)
    }

    fn read(&self, storage: &dyn Storage, name: &str, id: [u8; 16]) -> Result<SegmentInfo> {
        let file = segment_file_name(name, "", EXTENSION);
        let (mut input, _) = open_checked(storage.open_bytes(&file)?, CODEC, VERSION, VERSION, &id, "")?;
        let version = input.read_string()?;
        let max_doc = input.read_varint_u32()?;
        let codec = input.read_string()?;
        let diagnostics = read_map(&mut input)?;
        let attributes = read_map(&mut input)?;
        let count = input.read_varint()?;
        let mut files = BTreeSet::new();
        for _ in 0..count {
            let file_name = input.read_string()?;
            if parse_segment_name(&file_name) != Some(name) {
                return Err(TesseraError::corruption(
                    file.as_str(),
                    format!("file {file_name} does not belong to segment {name}"),
                ));
            }
            files.insert(file_name);
        }
        Ok(SegmentInfo {
            name: name.to_string(),
            id,
            max_doc,
            codec,
            diagnostics,
            attributes,
            files,
            version,
        })
    }
}
