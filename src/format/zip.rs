//! On-disk ZIP record layouts and their `winnow` parsers.
//!
//! Grounded on `rc-zip`'s `parse` module: the fixed-size record structs and
//! signature constants below mirror `EndOfCentralDirectoryRecord`,
//! `DirectoryHeader` and `LocalFileHeaderRecord`, adapted from `rc-zip`'s
//! incremental `Partial<&[u8]>` parsing style to whole-buffer parsing since
//! this crate always has the full archive file available via `Read + Seek`.

use std::io;

use byteorder::{LittleEndian, WriteBytesExt};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use winnow::binary::{le_u16, le_u32, le_u64};
use winnow::combinator::{opt, preceded};
use winnow::error::{ContextError, ErrMode};
use winnow::token::{literal, take};
use winnow::{seq, PResult, Parser};

use crate::error::{Error, FormatError};

/// Compression method stored in local/central headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum Method {
    /// No compression.
    Store = 0,
    /// DEFLATE.
    Deflate = 8,
}

impl Method {
    pub(crate) fn from_raw(raw: u16) -> crate::error::Result<Self> {
        Method::try_from(raw)
            .map_err(|_| Error::Unsupported(crate::error::UnsupportedError::MethodNotSupported(raw)))
    }
}

pub(crate) const EOCD_SIGNATURE: u32 = 0x0605_4b50;
pub(crate) const EOCD64_LOCATOR_SIGNATURE: u32 = 0x0706_4b50;
pub(crate) const EOCD64_SIGNATURE: u32 = 0x0606_4b50;
pub(crate) const CENTRAL_HEADER_SIGNATURE: u32 = 0x0201_4b50;
pub(crate) const LOCAL_HEADER_SIGNATURE: u32 = 0x0403_4b50;
pub(crate) const DATA_DESCRIPTOR_SIGNATURE: u32 = 0x0807_4b50;

/// Smallest possible EOCD record (no comment).
pub(crate) const EOCD_RECORD_SIZE: usize = 22;
/// Largest comment a EOCD record can carry.
pub(crate) const EOCD_MAX_COMMENT_SIZE: usize = u16::MAX as usize;

#[derive(Debug, Clone)]
pub struct EndOfCentralDirectoryRecord {
    pub disk_nbr: u16,
    pub directory_start_disk_nbr: u16,
    pub directory_records_on_this_disk: u16,
    pub directory_records: u16,
    pub directory_size: u32,
    pub directory_offset: u32,
    pub comment: Vec<u8>,
}

fn eocd_record(i: &mut &[u8]) -> PResult<EndOfCentralDirectoryRecord> {
    let _ = literal(EOCD_SIGNATURE.to_le_bytes()).parse_next(i)?;
    let disk_nbr = le_u16.parse_next(i)?;
    let directory_start_disk_nbr = le_u16.parse_next(i)?;
    let directory_records_on_this_disk = le_u16.parse_next(i)?;
    let directory_records = le_u16.parse_next(i)?;
    let directory_size = le_u32.parse_next(i)?;
    let directory_offset = le_u32.parse_next(i)?;
    let comment_len = le_u16.parse_next(i)?;
    let comment = take(comment_len).parse_next(i)?.to_vec();
    Ok(EndOfCentralDirectoryRecord {
        disk_nbr,
        directory_start_disk_nbr,
        directory_records_on_this_disk,
        directory_records,
        directory_size,
        directory_offset,
        comment,
    })
}

#[derive(Debug, Clone)]
pub struct EndOfCentralDirectory64Locator {
    pub directory_start_disk_nbr: u32,
    pub directory_offset: u64,
    pub total_disks: u32,
}

fn eocd64_locator(i: &mut &[u8]) -> PResult<EndOfCentralDirectory64Locator> {
    seq! {EndOfCentralDirectory64Locator {
        _: literal(EOCD64_LOCATOR_SIGNATURE.to_le_bytes()),
        directory_start_disk_nbr: le_u32,
        directory_offset: le_u64,
        total_disks: le_u32,
    }}
    .parse_next(i)
}

#[derive(Debug, Clone)]
pub struct EndOfCentralDirectory64Record {
    pub record_size: u64,
    pub version_made_by: u16,
    pub version_needed: u16,
    pub disk_nbr: u32,
    pub directory_start_disk_nbr: u32,
    pub directory_records_on_this_disk: u64,
    pub directory_records: u64,
    pub directory_size: u64,
    pub directory_offset: u64,
}

fn eocd64_record(i: &mut &[u8]) -> PResult<EndOfCentralDirectory64Record> {
    seq! {EndOfCentralDirectory64Record {
        _: literal(EOCD64_SIGNATURE.to_le_bytes()),
        record_size: le_u64,
        version_made_by: le_u16,
        version_needed: le_u16,
        disk_nbr: le_u32,
        directory_start_disk_nbr: le_u32,
        directory_records_on_this_disk: le_u64,
        directory_records: le_u64,
        directory_size: le_u64,
        directory_offset: le_u64,
    }}
    .parse_next(i)
}

/// The combination of (optional) zip64 fields and the plain EOCD record,
/// plus the `global_offset` correction for archives with data prepended
/// before the first local header (self-extracting stubs and the like).
#[derive(Debug, Clone)]
pub struct EndOfCentralDirectory {
    pub record: EndOfCentralDirectoryRecord,
    pub eocd64: Option<EndOfCentralDirectory64Record>,
    /// Amount to add to every offset recorded in the archive to get the
    /// real offset in the underlying file.
    pub global_offset: u64,
}

impl EndOfCentralDirectory {
    pub fn directory_offset(&self) -> u64 {
        match &self.eocd64 {
            Some(e) => e.directory_offset,
            None => self.record.directory_offset as u64,
        }
    }

    pub fn directory_records(&self) -> u64 {
        match &self.eocd64 {
            Some(e) => e.directory_records,
            None => self.record.directory_records as u64,
        }
    }

    /// Locate and parse the EOCD (and, if present, zip64 locator/record) by
    /// scanning backwards from the end of `haystack`, which must be the
    /// entire file contents.
    pub fn find(haystack: &[u8]) -> crate::error::Result<Self> {
        let max_scan = EOCD_RECORD_SIZE + EOCD_MAX_COMMENT_SIZE;
        let scan_start = haystack.len().saturating_sub(max_scan.min(haystack.len()));
        let window = &haystack[scan_start..];

        let sig = EOCD_SIGNATURE.to_le_bytes();
        let mut found_at = None;
        // scan from the back: the true EOCD is the last occurrence of the
        // signature, since a comment could coincidentally contain it earlier.
        for start in (0..window.len().saturating_sub(3)).rev() {
            if window[start..start + 4] == sig {
                found_at = Some(scan_start + start);
                break;
            }
        }
        let eocd_offset = found_at.ok_or(FormatError::DirectoryEndSignatureNotFound)?;

        let mut slice = &haystack[eocd_offset..];
        let record = eocd_record
            .parse_next(&mut slice)
            .map_err(|_: ErrMode<ContextError>| FormatError::DirectoryEndSignatureNotFound)?;

        // zip64 locator sits exactly 20 bytes before the EOCD, if present.
        let eocd64 = if eocd_offset >= 20 {
            let mut loc_slice = &haystack[eocd_offset - 20..eocd_offset];
            match eocd64_locator.parse_next(&mut loc_slice) {
                Ok(loc) => {
                    let rec_off = loc.directory_offset as usize;
                    if rec_off < haystack.len() {
                        let mut rec_slice = &haystack[rec_off..];
                        eocd64_record.parse_next(&mut rec_slice).ok()
                    } else {
                        None
                    }
                }
                Err(_) => None,
            }
        } else {
            None
        };

        let recorded_offset = match &eocd64 {
            Some(e) => e.directory_offset,
            None => record.directory_offset as u64,
        };
        let recorded_size = match &eocd64 {
            Some(e) => e.directory_size,
            None => record.directory_size as u64,
        };
        // The archive may have arbitrary bytes prepended (self-extracting
        // stubs). We know the directory must end exactly where the EOCD (or
        // zip64 locator, if present) begins; the difference between that
        // and the recorded offset+size gives the global correction.
        let directory_end_actual = match &eocd64 {
            Some(_) => eocd_offset - 20,
            None => eocd_offset,
        } as u64;
        let global_offset = directory_end_actual.saturating_sub(recorded_offset + recorded_size);

        Ok(Self {
            record,
            eocd64,
            global_offset,
        })
    }
}

/// Fixed-size portion of a central directory file header (46 bytes),
/// followed by variable-length name/extra/comment fields.
#[derive(Debug, Clone)]
pub struct DirectoryHeader {
    pub made_by: u16,
    pub reader_version: u16,
    pub flags: u16,
    pub method: u16,
    pub modified_time: u16,
    pub modified_date: u16,
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub name: Vec<u8>,
    pub extra: Vec<u8>,
    pub comment: Vec<u8>,
    pub disk_nbr_start: u16,
    pub internal_attrs: u16,
    pub external_attrs: u32,
    pub header_offset: u32,
}

impl DirectoryHeader {
    pub fn has_data_descriptor(&self) -> bool {
        self.flags & 0x08 != 0
    }

    pub fn is_non_utf8(&self) -> bool {
        self.flags & 0x800 == 0
    }
}

pub(crate) fn directory_header(i: &mut &[u8]) -> PResult<DirectoryHeader> {
    let _ = literal(CENTRAL_HEADER_SIGNATURE.to_le_bytes()).parse_next(i)?;
    let made_by = le_u16.parse_next(i)?;
    let reader_version = le_u16.parse_next(i)?;
    let flags = le_u16.parse_next(i)?;
    let method = le_u16.parse_next(i)?;
    let modified_time = le_u16.parse_next(i)?;
    let modified_date = le_u16.parse_next(i)?;
    let crc32 = le_u32.parse_next(i)?;
    let compressed_size = le_u32.parse_next(i)?;
    let uncompressed_size = le_u32.parse_next(i)?;
    let name_len = le_u16.parse_next(i)?;
    let extra_len = le_u16.parse_next(i)?;
    let comment_len = le_u16.parse_next(i)?;
    let disk_nbr_start = le_u16.parse_next(i)?;
    let internal_attrs = le_u16.parse_next(i)?;
    let external_attrs = le_u32.parse_next(i)?;
    let header_offset = le_u32.parse_next(i)?;
    let name = take(name_len).parse_next(i)?.to_vec();
    let extra = take(extra_len).parse_next(i)?.to_vec();
    let comment = take(comment_len).parse_next(i)?.to_vec();
    Ok(DirectoryHeader {
        made_by,
        reader_version,
        flags,
        method,
        modified_time,
        modified_date,
        crc32,
        compressed_size,
        uncompressed_size,
        name,
        extra,
        comment,
        disk_nbr_start,
        internal_attrs,
        external_attrs,
        header_offset,
    })
}

/// Parses every central directory header following the given count,
/// starting at `input`.
pub fn parse_central_directory(
    input: &[u8],
    expected_count: u64,
) -> crate::error::Result<Vec<DirectoryHeader>> {
    let mut slice = input;
    let mut out = Vec::with_capacity(expected_count.min(4096) as usize);
    while !slice.is_empty() && (out.len() as u64) < expected_count {
        match directory_header.parse_next(&mut slice) {
            Ok(h) => out.push(h),
            Err(_) => break,
        }
    }
    if out.len() as u64 != expected_count {
        return Err(FormatError::InvalidCentralRecord {
            expected: expected_count,
            actual: out.len() as u64,
        }
        .into());
    }
    Ok(out)
}

/// Fixed-size portion of a local file header (30 bytes).
#[derive(Debug, Clone)]
pub struct LocalFileHeaderRecord {
    pub reader_version: u16,
    pub flags: u16,
    pub method: u16,
    pub modified_time: u16,
    pub modified_date: u16,
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub name: Vec<u8>,
    pub extra: Vec<u8>,
}

pub(crate) fn local_file_header(i: &mut &[u8]) -> PResult<LocalFileHeaderRecord> {
    let _ = literal(LOCAL_HEADER_SIGNATURE.to_le_bytes()).parse_next(i)?;
    let reader_version = le_u16.parse_next(i)?;
    let flags = le_u16.parse_next(i)?;
    let method = le_u16.parse_next(i)?;
    let modified_time = le_u16.parse_next(i)?;
    let modified_date = le_u16.parse_next(i)?;
    let crc32 = le_u32.parse_next(i)?;
    let compressed_size = le_u32.parse_next(i)?;
    let uncompressed_size = le_u32.parse_next(i)?;
    let name_len = le_u16.parse_next(i)?;
    let extra_len = le_u16.parse_next(i)?;
    let name = take(name_len).parse_next(i)?.to_vec();
    let extra = take(extra_len).parse_next(i)?.to_vec();
    Ok(LocalFileHeaderRecord {
        reader_version,
        flags,
        method,
        modified_time,
        modified_date,
        crc32,
        compressed_size,
        uncompressed_size,
        name,
        extra,
    })
}

pub fn parse_local_file_header(
    input: &[u8],
) -> crate::error::Result<(LocalFileHeaderRecord, usize)> {
    let mut slice = input;
    let start_len = slice.len();
    let rec = local_file_header
        .parse_next(&mut slice)
        .map_err(|_: ErrMode<ContextError>| FormatError::InvalidLocalHeader)?;
    Ok((rec, start_len - slice.len()))
}

/// Optional trailer following stored data when bit 3 of the flags is set.
#[derive(Debug, Clone, Copy)]
pub struct DataDescriptorRecord {
    pub crc32: u32,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
}

pub fn parse_data_descriptor(
    input: &[u8],
    is_zip64: bool,
) -> crate::error::Result<(DataDescriptorRecord, usize)> {
    let mut slice = input;
    let start_len = slice.len();
    let _sig = opt(literal(DATA_DESCRIPTOR_SIGNATURE.to_le_bytes())).parse_next(&mut slice);
    let crc32 = le_u32
        .parse_next(&mut slice)
        .map_err(|_: ErrMode<ContextError>| FormatError::InvalidLocalHeader)?;
    let (compressed_size, uncompressed_size) = if is_zip64 {
        let c = le_u64(&mut slice).map_err(|_: ErrMode<ContextError>| FormatError::InvalidLocalHeader)?;
        let u = le_u64(&mut slice).map_err(|_: ErrMode<ContextError>| FormatError::InvalidLocalHeader)?;
        (c, u)
    } else {
        let c = le_u32(&mut slice).map_err(|_: ErrMode<ContextError>| FormatError::InvalidLocalHeader)?;
        let u = le_u32(&mut slice).map_err(|_: ErrMode<ContextError>| FormatError::InvalidLocalHeader)?;
        (c as u64, u as u64)
    };
    Ok((
        DataDescriptorRecord {
            crc32,
            compressed_size,
            uncompressed_size,
        },
        start_len - slice.len(),
    ))
}

/// Serializes a local file header for writing a fresh entry to a new archive.
pub fn write_local_file_header<W: io::Write>(
    w: &mut W,
    name: &[u8],
    method: Method,
    mod_dos_time: u16,
    mod_dos_date: u16,
    crc32: u32,
    compressed_size: u32,
    uncompressed_size: u32,
) -> io::Result<()> {
    w.write_u32::<LittleEndian>(LOCAL_HEADER_SIGNATURE)?;
    w.write_u16::<LittleEndian>(20)?;
    w.write_u16::<LittleEndian>(0x800)?; // always record UTF-8 names
    w.write_u16::<LittleEndian>(method.into())?;
    w.write_u16::<LittleEndian>(mod_dos_time)?;
    w.write_u16::<LittleEndian>(mod_dos_date)?;
    w.write_u32::<LittleEndian>(crc32)?;
    w.write_u32::<LittleEndian>(compressed_size)?;
    w.write_u32::<LittleEndian>(uncompressed_size)?;
    w.write_u16::<LittleEndian>(name.len() as u16)?;
    w.write_u16::<LittleEndian>(0)?;
    w.write_all(name)?;
    Ok(())
}

/// Serializes a central directory file header.
#[allow(clippy::too_many_arguments)]
pub fn write_directory_header<W: io::Write>(
    w: &mut W,
    name: &[u8],
    method: Method,
    mod_dos_time: u16,
    mod_dos_date: u16,
    crc32: u32,
    compressed_size: u32,
    uncompressed_size: u32,
    external_attrs: u32,
    header_offset: u32,
) -> io::Result<()> {
    w.write_u32::<LittleEndian>(CENTRAL_HEADER_SIGNATURE)?;
    w.write_u16::<LittleEndian>(0x031e)?; // made by: unix, 3.0
    w.write_u16::<LittleEndian>(20)?;
    w.write_u16::<LittleEndian>(0x800)?;
    w.write_u16::<LittleEndian>(method.into())?;
    w.write_u16::<LittleEndian>(mod_dos_time)?;
    w.write_u16::<LittleEndian>(mod_dos_date)?;
    w.write_u32::<LittleEndian>(crc32)?;
    w.write_u32::<LittleEndian>(compressed_size)?;
    w.write_u32::<LittleEndian>(uncompressed_size)?;
    w.write_u16::<LittleEndian>(name.len() as u16)?;
    w.write_u16::<LittleEndian>(0)?;
    w.write_u16::<LittleEndian>(0)?;
    w.write_u16::<LittleEndian>(0)?;
    w.write_u16::<LittleEndian>(0)?;
    w.write_u32::<LittleEndian>(external_attrs)?;
    w.write_u32::<LittleEndian>(header_offset)?;
    w.write_all(name)?;
    Ok(())
}

/// Serializes the end of central directory record (never zip64; this crate
/// does not write archives larger than 4 GiB or with more than 65535
/// entries, a documented limitation).
pub fn write_eocd<W: io::Write>(
    w: &mut W,
    entry_count: u16,
    directory_size: u32,
    directory_offset: u32,
) -> io::Result<()> {
    w.write_u32::<LittleEndian>(EOCD_SIGNATURE)?;
    w.write_u16::<LittleEndian>(0)?;
    w.write_u16::<LittleEndian>(0)?;
    w.write_u16::<LittleEndian>(entry_count)?;
    w.write_u16::<LittleEndian>(entry_count)?;
    w.write_u32::<LittleEndian>(directory_size)?;
    w.write_u32::<LittleEndian>(directory_offset)?;
    w.write_u16::<LittleEndian>(0)?;
    Ok(())
}

/// Converts a chrono local datetime into the packed DOS time/date pair used
/// throughout ZIP headers.
pub fn to_dos_datetime(dt: chrono::NaiveDateTime) -> (u16, u16) {
    use chrono::{Datelike, Timelike};
    let time = ((dt.hour() as u16) << 11) | ((dt.minute() as u16) << 5) | ((dt.second() as u16) / 2);
    let year = (dt.year() - 1980).max(0) as u16;
    let date = (year << 9) | ((dt.month() as u16) << 5) | (dt.day() as u16);
    (time, date)
}

/// Converts a packed DOS time/date pair into a chrono datetime, if valid.
pub fn from_dos_datetime(time: u16, date: u16) -> Option<chrono::NaiveDateTime> {
    use chrono::{NaiveDate, NaiveTime};
    let year = 1980 + ((date >> 9) & 0x7f) as i32;
    let month = ((date >> 5) & 0x0f) as u32;
    let day = (date & 0x1f) as u32;
    let hour = ((time >> 11) & 0x1f) as u32;
    let minute = ((time >> 5) & 0x3f) as u32;
    let second = ((time & 0x1f) * 2) as u32;
    let d = NaiveDate::from_ymd_opt(year, month, day)?;
    let t = NaiveTime::from_hms_opt(hour, minute, second)?;
    Some(d.and_time(t))
}
