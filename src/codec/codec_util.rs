//! File headers and checksum footers shared by every format.
//!
//! Header: `CODEC_MAGIC` (u32), format name, format version (u32), the
//! 16-byte segment id and a suffix string.
//!
//! Footer: `FOOTER_MAGIC` (u32), checksum algorithm id (u32, 0 = CRC32) and
//! the checksum (u64) of every byte before it.

use crate::error::{Result, TesseraError};
use crate::storage::FileBytes;
use crate::storage::structured::{StructReader, StructWriter};

/// First four bytes of every index file.
pub const CODEC_MAGIC: u32 = 0x3fd7_6c17;

/// First four bytes of every footer.
pub const FOOTER_MAGIC: u32 = !CODEC_MAGIC;

/// Length of the footer in bytes.
pub const FOOTER_LENGTH: usize = 16;

const CHECKSUM_CRC32: u32 = 0;

/// Write a file header.
pub fn write_header(
    out: &mut StructWriter,
    codec: &str,
    version: u32,
    id: &[u8; 16],
    suffix: &str,
) -> Result<()> {
    out.write_u32(CODEC_MAGIC)?;
    out.write_string(codec)?;
    out.write_u32(version)?;
    out.write_raw(id)?;
    out.write_string(suffix)?;
    Ok(())
}

/// Verify a file header and return the format version.
pub fn check_header(
    input: &mut StructReader,
    codec: &str,
    min_version: u32,
    max_version: u32,
    id: &[u8; 16],
    suffix: &str,
) -> Result<u32> {
    let name = input.name().to_string();
    let magic = input.read_u32()?;
    if magic != CODEC_MAGIC {
        return Err(TesseraError::corruption(
            name,
            format!("header magic mismatch: expected {CODEC_MAGIC:#x}, got {magic:#x}"),
        ));
    }
    let actual_codec = input.read_string()?;
    if actual_codec != codec {
        return Err(TesseraError::corruption(
            name,
            format!("format mismatch: expected {codec}, got {actual_codec}"),
        ));
    }
    let version = input.read_u32()?;
    if version < min_version || version > max_version {
        return Err(TesseraError::corruption(
            name,
            format!("unsupported format version {version}, expected {min_version}..={max_version}"),
        ));
    }
    let actual_id = input.read_raw(16)?;
    if actual_id != id {
        return Err(TesseraError::corruption(
            name,
            "segment id mismatch: file belongs to another segment",
        ));
    }
    let actual_suffix = input.read_string()?;
    if actual_suffix != suffix {
        return Err(TesseraError::corruption(
            name,
            format!("suffix mismatch: expected '{suffix}', got '{actual_suffix}'"),
        ));
    }
    Ok(version)
}

/// Read the id stored in a header without verifying anything else.
///
/// Commit files carry their own random id, which a reader learns here
/// before running [`open_checked`].
pub fn peek_header_id(bytes: &FileBytes) -> Result<[u8; 16]> {
    let mut input = StructReader::new(bytes.clone());
    input.read_u32()?;
    input.read_string()?;
    input.read_u32()?;
    let mut id = [0u8; 16];
    id.copy_from_slice(input.read_raw(16)?);
    Ok(id)
}

/// Write the footer and close the file.
pub fn write_footer_and_close(mut out: StructWriter) -> Result<()> {
    out.write_u32(FOOTER_MAGIC)?;
    out.write_u32(CHECKSUM_CRC32)?;
    let checksum = out.checksum() as u64;
    out.write_u64(checksum)?;
    out.close()
}

/// Verify the footer checksum of a whole file.
pub fn verify_footer(bytes: &FileBytes) -> Result<u64> {
    let data = bytes.as_slice();
    if data.len() < FOOTER_LENGTH {
        return Err(TesseraError::corruption(
            bytes.name(),
            format!("file too short for a footer: {} bytes", data.len()),
        ));
    }
    let mut footer = StructReader::with_range(bytes.clone(), data.len() - FOOTER_LENGTH, data.len());
    let magic = footer.read_u32()?;
    if magic != FOOTER_MAGIC {
        return Err(TesseraError::corruption(
            bytes.name(),
            format!("footer magic mismatch: expected {FOOTER_MAGIC:#x}, got {magic:#x}"),
        ));
    }
    let algorithm = footer.read_u32()?;
    if algorithm != CHECKSUM_CRC32 {
        return Err(TesseraError::corruption(
            bytes.name(),
            format!("unknown checksum algorithm {algorithm}"),
        ));
    }
    let expected = footer.read_u64()?;
    let actual = crc32fast::hash(&data[..data.len() - 8]) as u64;
    if expected != actual {
        return Err(TesseraError::corruption(
            bytes.name(),
            format!("checksum mismatch: expected {expected:#x}, actual {actual:#x}"),
        ));
    }
    Ok(actual)
}

/// Verify footer and header, returning a reader positioned after the header
/// and limited to the bytes before the footer, plus the format version.
pub fn open_checked(
    bytes: FileBytes,
    codec: &str,
    min_version: u32,
    max_version: u32,
    id: &[u8; 16],
    suffix: &str,
) -> Result<(StructReader, u32)> {
    verify_footer(&bytes)?;
    let end = bytes.len() - FOOTER_LENGTH;
    let mut reader = StructReader::with_range(bytes, 0, end);
    let version = check_header(&mut reader, codec, min_version, max_version, id, suffix)?;
    Ok((reader, version))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;
    use crate::storage::memory::MemoryStorage;

    fn write_sample(storage: &MemoryStorage, name: &str) {
        let mut out = StructWriter::new(storage.create_output(name).unwrap());
        write_header(&mut out, "Sample", 1, &[7; 16], "").unwrap();
        out.write_varint(42).unwrap();
        write_footer_and_close(out).unwrap();
    }

    #[test]
    fn test_header_footer_round_trip() {
        let storage = MemoryStorage::default();
        write_sample(&storage, "a.bin");
        let bytes = storage.open_bytes("a.bin").unwrap();
        let (mut reader, version) = open_checked(bytes, "Sample", 0, 1, &[7; 16], "").unwrap();
        assert_eq!(version, 1);
        assert_eq!(reader.read_varint().unwrap(), 42);
        assert!(reader.is_eof());
    }

    #[test]
    fn test_every_flipped_byte_is_detected() {
        let storage = MemoryStorage::default();
        write_sample(&storage, "a.bin");
        let len = storage.file_size("a.bin").unwrap() as usize;
        for offset in 0..len {
            let copy = format!("copy{offset}");
            let data = storage.open_bytes("a.bin").unwrap().as_slice().to_vec();
            let mut out = storage.create_output(&copy).unwrap();
            std::io::Write::write_all(&mut out, &data).unwrap();
            out.close().unwrap();
            storage.corrupt_byte(&copy, offset).unwrap();
            let bytes = storage.open_bytes(&copy).unwrap();
            let err = open_checked(bytes, "Sample", 0, 1, &[7; 16], "").unwrap_err();
            assert!(err.is_corruption(), "offset {offset}: {err}");
        }
    }

    #[test]
    fn test_wrong_segment_id() {
        let storage = MemoryStorage::default();
        write_sample(&storage, "a.bin");
        let bytes = storage.open_bytes("a.bin").unwrap();
        let err = open_checked(bytes, "Sample", 0, 1, &[8; 16], "").unwrap_err();
        assert!(err.to_string().contains("segment id mismatch"));
    }
}
