//! Live docs (`_N_<gen>.liv`): one bit per document, set when live.

use bit_vec::BitVec;

use crate::codec::codec_util::{open_checked, write_footer_and_close, write_header};
use crate::codec::{LiveDocsFormat, segment_file_name};
use crate::error::{Result, TesseraError};
use crate::index::segment_info::SegmentCommitInfo;
use crate::storage::Storage;
use crate::storage::structured::StructWriter;
use crate::util::to_base36;

const CODEC: &str = "LiveDocs";
const VERSION: u32 = 0;
const EXTENSION: &str = "liv";

/// The default live docs format.
#[derive(Debug, Default)]
pub struct BitsLiveDocsFormat;

impl LiveDocsFormat for BitsLiveDocsFormat {
    fn write(
        &self,
        storage: &dyn Storage,
        info: &SegmentCommitInfo,
        live: &BitVec,
        del_count: u32,
        generation: i64,
    ) -> Result<String> {
        let suffix = to_base36(generation as u64);
        let actual = live.iter().filter(|b| !b).count() as u32;
        if live.len() != info.max_doc() as usize || actual != del_count {
            return Err(TesseraError::illegal_state(format!(
                "live docs of {} have {} bits / {actual} deletions, expected {} / {del_count}",
                info.name(),
                live.len(),
                info.max_doc()
            )));
        }
        let name = segment_file_name(info.name(), &suffix, EXTENSION);
        let mut out = StructWriter::new(storage.create_output(&name)?);
        write_header(&mut out, CODEC, VERSION, &info.info.id, &suffix)?;
        out.write_varint(live.len() as u64)?;
        out.write_varint(del_count as u64)?;
        out.write_raw(&live.to_bytes())?;
        write_footer_and_close(out)?;
        Ok(name)
    }

    fn read(&self, storage: &dyn Storage, info: &SegmentCommitInfo) -> Result<BitVec> {
        let Some(name) = info.live_docs_file() else {
            return Ok(BitVec::from_elem(info.max_doc() as usize, true));
        };
        let suffix = to_base36(info.del_gen as u64);
        let (mut input, _) = open_checked(
            storage.open_bytes(&name)?,
            CODEC,
            VERSION,
            VERSION,
            &info.info.id,
            &suffix,
        )?;
        let len = input.read_varint()? as usize;
        let del_count = input.read_varint_u32()?;
        if len != info.max_doc() as usize {
            return Err(TesseraError::corruption(
                name,
                format!("{len} bits for a segment of {} docs", info.max_doc()),
            ));
        }
        let mut live = BitVec::from_bytes(input.read_raw(len.div_ceil(8))?);
        live.truncate(len);
        let actual = live.iter().filter(|b| !b).count() as u32;
        if actual != del_count || del_count != info.del_count {
            return Err(TesseraError::corruption(
                name,
                format!(
                    "{actual} deleted bits, file records {del_count}, commit records {}",
                    info.del_count
                ),
            ));
        }
        Ok(live)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::index::segment_info::SegmentInfo;
    use crate::storage::memory::MemoryStorage;

    #[test]
    fn test_live_docs_round_trip() {
        let storage = MemoryStorage::default();
        let mut commit = SegmentCommitInfo::new(Arc::new(SegmentInfo::new("_0", 11, "Tessera10")));
        assert!(BitsLiveDocsFormat.read(&storage, &commit).unwrap().all());

        let mut live = BitVec::from_elem(11, true);
        live.set(3, false);
        live.set(10, false);
        let generation = commit.next_write_del_gen;
        let name = BitsLiveDocsFormat
            .write(&storage, &commit, &live, 2, generation)
            .unwrap();
        assert_eq!(name, "_0_1.liv");
        commit.advance_del_gen(generation, 2);
        assert_eq!(BitsLiveDocsFormat.read(&storage, &commit).unwrap(), live);

        commit.del_count = 5;
        assert!(BitsLiveDocsFormat.read(&storage, &commit).unwrap_err().is_corruption());
    }
}
