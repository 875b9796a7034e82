//! On-disk IMG archive record layouts (v1 twin-file and v2 single-file) and
//! the XBOX LZO compressed-entry block framing.
//!
//! Grounded on the `CFileSystem.img.serialize.hxx` / `.img.internal.h`
//! layouts, adapted to this crate's `winnow`-based parsing idiom, matching
//! the style of `format/zip.rs` and, further back, `rc-zip`'s `parse`
//! module.

use std::io;

use byteorder::{LittleEndian, WriteBytesExt};
use winnow::binary::{le_u16, le_u32, u8 as le_u8};
use winnow::error::{ContextError, ErrMode};
use winnow::token::{literal, take};
use winnow::{seq, PResult, Parser};

use crate::error::{Error, FormatError};

/// Size in bytes of a single allocation block, for both v1 and v2 archives.
pub const BLOCK_SIZE: u64 = 2048;

/// Fixed width of the on-disk resource name field.
pub const RESOURCE_NAME_LEN: usize = 24;

pub(crate) const V2_MAGIC: [u8; 4] = *b"VER2";

/// A single v1 `.DIR` record (32 bytes): used both for standalone v1
/// archives and reused, byte-for-byte, as the fixed prefix of each v2
/// record (which additionally may carry a streaming-size override).
#[derive(Debug, Clone)]
pub struct DirRecordV1 {
    pub block_offset: u32,
    pub resource_blocks: u32,
    pub resource_name: [u8; RESOURCE_NAME_LEN],
}

fn dir_record_v1(i: &mut &[u8]) -> PResult<DirRecordV1> {
    let block_offset = le_u32.parse_next(i)?;
    let resource_blocks = le_u32.parse_next(i)?;
    let name_bytes = take(RESOURCE_NAME_LEN).parse_next(i)?;
    let mut resource_name = [0u8; RESOURCE_NAME_LEN];
    resource_name.copy_from_slice(name_bytes);
    Ok(DirRecordV1 {
        block_offset,
        resource_blocks,
        resource_name,
    })
}

/// Parses every 32-byte record in a v1 `.DIR` file's contents.
pub fn parse_dir_v1(input: &[u8]) -> crate::error::Result<Vec<DirRecordV1>> {
    if input.len() % 32 != 0 {
        return Err(FormatError::ImgBadMagic.into());
    }
    let mut slice = input;
    let mut out = Vec::with_capacity(input.len() / 32);
    while !slice.is_empty() {
        let rec = dir_record_v1
            .parse_next(&mut slice)
            .map_err(|_: ErrMode<ContextError>| FormatError::ImgBadMagic)?;
        out.push(rec);
    }
    Ok(out)
}

pub fn write_dir_record_v1<W: io::Write>(w: &mut W, rec: &DirRecordV1) -> io::Result<()> {
    w.write_u32::<LittleEndian>(rec.block_offset)?;
    w.write_u32::<LittleEndian>(rec.resource_blocks)?;
    w.write_all(&rec.resource_name)?;
    Ok(())
}

/// v2 single-file header: `"VER2"` followed by a little-endian entry count.
#[derive(Debug, Clone, Copy)]
pub struct HeaderV2 {
    pub entry_count: u32,
}

fn header_v2(i: &mut &[u8]) -> PResult<HeaderV2> {
    seq! {HeaderV2 {
        _: literal(V2_MAGIC),
        entry_count: le_u32,
    }}
    .parse_next(i)
}

pub fn parse_header_v2(input: &[u8]) -> crate::error::Result<(HeaderV2, usize)> {
    let mut slice = input;
    let start_len = slice.len();
    let h = header_v2
        .parse_next(&mut slice)
        .map_err(|_: ErrMode<ContextError>| FormatError::ImgBadMagic)?;
    Ok((h, start_len - slice.len()))
}

pub fn write_header_v2<W: io::Write>(w: &mut W, entry_count: u32) -> io::Result<()> {
    w.write_all(&V2_MAGIC)?;
    w.write_u32::<LittleEndian>(entry_count)?;
    Ok(())
}

/// A single v2 record: `offset_u32 ‖ size_u16 ‖ expanded_size_u16 ‖
/// name[24]`, all in 2048-byte blocks; a non-zero `expanded_size`
/// overrides `size` as the authoritative block count (observed in
/// archives whose content was grown in place without reallocating).
#[derive(Debug, Clone)]
pub struct DirRecordV2 {
    pub block_offset: u32,
    pub size_blocks: u16,
    pub expanded_size_blocks: u16,
    pub resource_name: [u8; RESOURCE_NAME_LEN],
}

impl DirRecordV2 {
    /// The block count actually in effect, honoring the override.
    pub fn effective_blocks(&self) -> u32 {
        if self.expanded_size_blocks != 0 {
            self.expanded_size_blocks as u32
        } else {
            self.size_blocks as u32
        }
    }
}

fn dir_record_v2(i: &mut &[u8]) -> PResult<DirRecordV2> {
    seq! {DirRecordV2 {
        block_offset: le_u32,
        size_blocks: le_u16,
        expanded_size_blocks: le_u16,
        resource_name: take(RESOURCE_NAME_LEN).map(|b: &[u8]| {
            let mut name = [0u8; RESOURCE_NAME_LEN];
            name.copy_from_slice(b);
            name
        }),
    }}
    .parse_next(i)
}

pub fn parse_records_v2(input: &[u8], count: u32) -> crate::error::Result<Vec<DirRecordV2>> {
    let mut slice = input;
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let rec = dir_record_v2
            .parse_next(&mut slice)
            .map_err(|_: ErrMode<ContextError>| FormatError::ImgBadMagic)?;
        out.push(rec);
    }
    Ok(out)
}

pub fn write_dir_record_v2<W: io::Write>(w: &mut W, rec: &DirRecordV2) -> io::Result<()> {
    w.write_u32::<LittleEndian>(rec.block_offset)?;
    w.write_u16::<LittleEndian>(rec.size_blocks)?;
    w.write_u16::<LittleEndian>(rec.expanded_size_blocks)?;
    w.write_all(&rec.resource_name)?;
    Ok(())
}

// ---------------------------------------------------------------------
// XBOX LZO compressed-entry framing
// ---------------------------------------------------------------------

/// Little-endian magic identifying an XBOX-variant LZO compressed stream,
/// as it appears on disk (`0xCEA1A367` is the value once bytes are read as
/// a big-endian-looking constant by the original tooling; here we match the
/// literal byte sequence directly).
pub(crate) const LZO_MAGIC: u32 = 0x67A3_A1CE;

/// Per-stream compression header, preceding the block sequence.
#[derive(Debug, Clone, Copy)]
pub struct LzoStreamHeader {
    pub checksum: u32,
    pub block_size: u32,
}

fn lzo_stream_header(i: &mut &[u8]) -> PResult<LzoStreamHeader> {
    seq! {LzoStreamHeader {
        _: literal(LZO_MAGIC.to_le_bytes()),
        checksum: le_u32,
        block_size: le_u32,
    }}
    .parse_next(i)
}

pub fn parse_lzo_stream_header(input: &[u8]) -> crate::error::Result<(LzoStreamHeader, usize)> {
    let mut slice = input;
    let start_len = slice.len();
    let h = lzo_stream_header
        .parse_next(&mut slice)
        .map_err(|_: ErrMode<ContextError>| FormatError::LzoBadMagic)?;
    Ok((h, start_len - slice.len()))
}

pub fn write_lzo_stream_header<W: io::Write>(w: &mut W, h: &LzoStreamHeader) -> io::Result<()> {
    w.write_all(&LZO_MAGIC.to_le_bytes())?;
    w.write_u32::<LittleEndian>(h.checksum)?;
    w.write_u32::<LittleEndian>(h.block_size)?;
    Ok(())
}

/// Per-block header preceding each compressed chunk. `unknown` is always 4
/// in every corpus sample observed; we preserve it bit-for-bit on both
/// read and write rather than hard-coding an assumption about what it
/// means (see Open Question resolution in the design notes).
#[derive(Debug, Clone, Copy)]
pub struct LzoBlockHeader {
    pub unknown: u32,
    pub uncompressed_size: u32,
    pub compressed_size: u32,
}

fn lzo_block_header(i: &mut &[u8]) -> PResult<LzoBlockHeader> {
    seq! {LzoBlockHeader {
        unknown: le_u32,
        uncompressed_size: le_u32,
        compressed_size: le_u32,
    }}
    .parse_next(i)
}

pub fn parse_lzo_block_header(input: &[u8]) -> crate::error::Result<(LzoBlockHeader, usize)> {
    let mut slice = input;
    let start_len = slice.len();
    let h = lzo_block_header
        .parse_next(&mut slice)
        .map_err(|_: ErrMode<ContextError>| FormatError::LzoBadBlockHeader)?;
    Ok((h, start_len - slice.len()))
}

pub fn write_lzo_block_header<W: io::Write>(w: &mut W, h: &LzoBlockHeader) -> io::Result<()> {
    w.write_u32::<LittleEndian>(h.unknown)?;
    w.write_u32::<LittleEndian>(h.uncompressed_size)?;
    w.write_u32::<LittleEndian>(h.compressed_size)?;
    Ok(())
}

/// Reads a single byte; used when scanning for a block boundary at an
/// arbitrary file offset where a full header parse isn't warranted yet.
pub fn peek_byte(input: &[u8]) -> crate::error::Result<u8> {
    let mut slice = input;
    le_u8
        .parse_next(&mut slice)
        .map_err(|_: ErrMode<ContextError>| Error::Internal("peek_byte on empty slice"))
}
