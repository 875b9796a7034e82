//! Translates a ZIP archive file into a [`crate::vfs::VirtualFs`] tree.
//!
//! Grounded on `rc-zip-sync`'s in-memory `ReadZip`/`SyncArchive` model: the
//! whole archive is read into memory once, the central directory is parsed
//! up front, and entry content is decompressed lazily on first access. This
//! crate goes one step further and allows writing the tree back out, which
//! `rc-zip-sync` does not support — the `save` procedure here is new code,
//! grounded on the directory/local header *writers* in
//! `crate::format::zip` (themselves modeled on the same records
//! `rc-zip`'s `parse` module reads).

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use tracing::{info, instrument, trace};

use crate::codec;
use crate::error::{Error, Result};
use crate::format::zip::{self, Method};
use crate::presence::{FileDataPresence, PresenceOptions, RamBudget};
use crate::stream::{FileOpenFailure, OpenMode, Stats};
use crate::vfs::node::{NodeId, PathProcessMode};
use crate::vfs::VirtualFs;

use super::{ArchiveTranslator, DirIter, OpenedStream};

/// Per-entry metadata kept alongside each file node, mirroring the fields
/// `rc-zip`'s `DirectoryHeader`/`StoredEntry` carry.
#[derive(Debug, Clone)]
pub struct ZipEntryMeta {
    pub method: Method,
    pub crc32: u32,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub dos_time: u16,
    pub dos_date: u16,
    pub external_attrs: u32,
    /// Absolute offset (already corrected by `global_offset`) of the first
    /// byte of this entry's data within the translator's in-memory buffer;
    /// `0` and unused for freshly created entries that have never been
    /// materialized from archive bytes.
    pub data_offset: u64,
    /// Whether `uncompressed_size`/`crc32` have been confirmed against the
    /// actual decompressed bytes (false until the entry has been read or
    /// written at least once since load).
    pub size_real_is_verified: bool,
}

impl Default for ZipEntryMeta {
    fn default() -> Self {
        let now = chrono::Local::now().naive_local();
        let (dos_time, dos_date) = zip::to_dos_datetime(now);
        Self {
            method: Method::Store,
            crc32: 0,
            compressed_size: 0,
            uncompressed_size: 0,
            dos_time,
            dos_date,
            external_attrs: 0,
            data_offset: 0,
            size_real_is_verified: true,
        }
    }
}

pub struct ZipTranslator {
    fs: Arc<VirtualFs<ZipEntryMeta>>,
    archive_bytes: Arc<RwLock<Vec<u8>>>,
    path: PathBuf,
    global_offset: u64,
    budget: Arc<RamBudget>,
    presence_opts: PresenceOptions,
    compression_level: u32,
}

impl ZipTranslator {
    /// Opens an existing ZIP file, parsing its central directory and
    /// populating the virtual tree. Entries stay `Archived` (never
    /// decompressed) until first accessed.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>, budget: Arc<RamBudget>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let bytes = std::fs::read(&path)?;
        let eocd = zip::EndOfCentralDirectory::find(&bytes)?;
        let dir_start = (eocd.directory_offset() + eocd.global_offset) as usize;
        if dir_start > bytes.len() {
            return Err(crate::error::FormatError::DirectoryOffsetPointsOutsideFile.into());
        }
        let headers = zip::parse_central_directory(&bytes[dir_start..], eocd.directory_records())?;

        let all_names: Vec<u8> = headers.iter().flat_map(|h| h.name.iter().copied()).collect();
        let archive_is_utf8 = crate::encoding::archive_looks_utf8(&all_names);

        let fs = VirtualFs::new();
        for h in &headers {
            let name = crate::encoding::decode_name(&h.name, !h.is_non_utf8(), archive_is_utf8);
            let is_dir = name.ends_with('/') || (h.external_attrs >> 16) & 0o040000 != 0;
            let name = name.trim_end_matches('/');
            if name.is_empty() {
                continue;
            }
            if is_dir {
                // directories may already exist implicitly via a file's
                // parent path; ignore the "already exists" case.
                let _ = fs.create_dir(name);
                continue;
            }
            let header_offset = h.header_offset as u64 + eocd.global_offset;
            let local_start = header_offset as usize;
            let (local, consumed) = zip::parse_local_file_header(&bytes[local_start..])?;
            let data_offset = header_offset + consumed as u64;
            let method = Method::from_raw(if h.has_data_descriptor() { local.method } else { h.method })?;

            let meta = ZipEntryMeta {
                method,
                crc32: h.crc32,
                compressed_size: h.compressed_size as u64,
                uncompressed_size: h.uncompressed_size as u64,
                dos_time: h.modified_time,
                dos_date: h.modified_date,
                external_attrs: h.external_attrs,
                data_offset,
                size_real_is_verified: false,
            };
            fs.create_file(name, meta)?;
        }

        info!(entries = headers.len(), "loaded zip archive");

        Ok(Self {
            fs,
            archive_bytes: Arc::new(RwLock::new(bytes)),
            path,
            global_offset: eocd.global_offset,
            budget,
            presence_opts: PresenceOptions::default(),
            compression_level: 6,
        })
    }

    /// Creates a translator around a brand new, empty archive that will be
    /// written to `path` on the first [`ArchiveTranslator::save`].
    pub fn create(path: impl AsRef<Path>, budget: Arc<RamBudget>) -> Self {
        Self {
            fs: VirtualFs::new(),
            archive_bytes: Arc::new(RwLock::new(Vec::new())),
            path: path.as_ref().to_path_buf(),
            global_offset: 0,
            budget,
            presence_opts: PresenceOptions::default(),
            compression_level: 6,
        }
    }

    pub fn set_compression_level(&mut self, level: u32) {
        self.compression_level = level.min(9);
    }

    /// Copies out the raw on-disk bytes for an entry (still compressed, for
    /// `Method::Deflate`), without decoding them.
    fn compressed_bytes(&self, meta: &ZipEntryMeta) -> Result<Vec<u8>> {
        let bytes = self.archive_bytes.read().unwrap();
        let start = meta.data_offset as usize;
        let end = start + meta.compressed_size as usize;
        if end > bytes.len() {
            return Err(crate::error::FormatError::ImgEntryOutOfBounds {
                name: String::new(),
                claimed: end as u64,
                available: bytes.len() as u64,
            }
            .into());
        }
        Ok(bytes[start..end].to_vec())
    }

    fn materialize(&self, meta: &ZipEntryMeta) -> Result<FileDataPresence> {
        if meta.compressed_size == 0 && meta.uncompressed_size == 0 {
            return Ok(FileDataPresence::new(self.budget.clone(), self.presence_opts));
        }
        let slice = self.compressed_bytes(meta)?;
        let decoded = match meta.method {
            Method::Store => slice,
            Method::Deflate => codec::inflate(&slice, meta.uncompressed_size)?,
        };
        FileDataPresence::from_bytes(self.budget.clone(), self.presence_opts, decoded).map_err(Into::into)
    }
}

impl ArchiveTranslator for ZipTranslator {
    fn create_dir(&self, path: &str) -> Result<()> {
        self.fs.create_dir(path).map(|_| ())
    }

    fn open(&self, path: &str, mode: OpenMode) -> Result<OpenedStream> {
        let resolved = self.fs.resolve(path, PathProcessMode::AmbivalentFile);
        let id = match resolved {
            Ok(id) => id,
            Err(_) if mode.contains(OpenMode::CREATE) => self.fs.create_file(path, ZipEntryMeta::default())?,
            Err(_) => return Err(FileOpenFailure::NotFound.into()),
        };
        if self.fs.is_directory(path).unwrap_or(false) {
            return Err(FileOpenFailure::IsDirectory.into());
        }

        let meta = self.fs.with_meta(id, Clone::clone)?;

        // read-only access to an untouched deflated entry is served
        // through a forward-only sector cache rather than inflating the
        // whole entry up front, so random-access reads over large entries
        // don't pay for bytes that are never visited.
        if mode == OpenMode::READ && meta.method == Method::Deflate && self.fs.is_archived(id)? {
            self.fs.lock(id)?;
            let compressed = match self.compressed_bytes(&meta) {
                Ok(b) => b,
                Err(e) => {
                    let _ = self.fs.unlock(id);
                    return Err(e);
                }
            };
            let decoder = codec::DeflateSectorDecoder::new(compressed);
            let inner = crate::stream::chunked::ChunkedStream::new(decoder, meta.uncompressed_size);
            return Ok(Box::new(super::ChunkedEntryStream {
                fs: self.fs.clone(),
                id,
                inner,
            }));
        }

        self.fs.lock(id)?;

        let mut presence = match self.fs.take_data(id, || self.materialize(&meta)) {
            Ok(p) => p,
            Err(e) => {
                let _ = self.fs.unlock(id);
                return Err(e);
            }
        };

        if mode.contains(OpenMode::TRUNCATE) {
            presence.set_len(0).map_err(Error::Io)?;
        }

        Ok(Box::new(super::CheckedOutStream {
            fs: self.fs.clone(),
            id,
            presence: Some(presence),
        }))
    }

    fn exists(&self, path: &str) -> bool {
        self.fs.exists(path)
    }

    fn delete(&self, path: &str) -> Result<()> {
        self.fs.delete(path)
    }

    fn copy(&self, from: &str, to: &str) -> Result<()> {
        let from_id = self.fs.resolve(from, PathProcessMode::AmbivalentFile)?;
        let meta = self.fs.with_meta(from_id, Clone::clone)?;
        let data = self.fs.take_data(from_id, || self.materialize(&meta))?;
        let bytes = {
            let mut d = data;
            use std::io::{Read, Seek, SeekFrom};
            d.seek(SeekFrom::Start(0)).map_err(Error::Io)?;
            let mut buf = Vec::new();
            d.read_to_end(&mut buf).map_err(Error::Io)?;
            self.fs.put_data(from_id, d)?;
            buf
        };
        let to_id = self.fs.create_file(to, meta)?;
        let presence = FileDataPresence::from_bytes(self.budget.clone(), self.presence_opts, bytes)?;
        self.fs.put_data(to_id, presence)?;
        Ok(())
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.fs.rename(from, to)
    }

    fn size(&self, path: &str) -> Result<u64> {
        let id = self.fs.resolve(path, PathProcessMode::AmbivalentFile)?;
        self.fs.with_meta(id, |m| m.uncompressed_size)
    }

    fn query_stats(&self, path: &str) -> Result<Stats> {
        let id = self.fs.resolve(path, PathProcessMode::AmbivalentFile)?;
        let is_dir = self.fs.is_directory(path)?;
        if is_dir {
            return Ok(Stats {
                is_directory: true,
                ..Default::default()
            });
        }
        self.fs.with_meta(id, |m| {
            let mtime = zip::from_dos_datetime(m.dos_time, m.dos_date)
                .map(|dt| dt.and_utc().timestamp())
                .unwrap_or(0);
            Stats {
                size: m.uncompressed_size,
                is_directory: false,
                is_compressed: m.method != Method::Store,
                atime: mtime,
                mtime,
                ctime: mtime,
            }
        })
    }

    fn scan_directory(&self, path: &str, pattern: Option<&str>) -> Result<Vec<String>> {
        self.fs.scan_directory(path, pattern)
    }

    fn begin_directory_listing(&self, path: &str) -> Result<DirIter> {
        let ids = self.fs.begin_directory_listing(path)?;
        let names = ids
            .into_iter()
            .map(|id| self.fs.node_name(id))
            .collect::<Result<Vec<_>>>()?;
        Ok(DirIter {
            names: names.into_iter(),
        })
    }

    fn change_directory(&self, path: &str) -> Result<()> {
        self.fs.change_directory(path)
    }

    /// Rebuilds the archive from scratch: every file is visited in tree
    /// order, its content (re-)compressed if it was touched, and a fresh
    /// local header / central directory / EOCD triple is written. This is
    /// simpler than an in-place patch and matches `rc-zip`'s read-mostly
    /// design, which never attempted in-place mutation either.
    #[instrument(skip_all)]
    fn save(&self) -> Result<()> {
        let mut out = Vec::new();
        let mut central = Vec::new();
        let mut count: u16 = 0;

        for (full_path, id) in self.fs.walk_files()? {
            let name = full_path.trim_start_matches('/');
            let meta = self.fs.with_meta(id, Clone::clone)?;
            let header_offset = out.len() as u32;

            let (content, method) = self.read_entry_bytes_for_save(id, &meta)?;
            let crc = crc32fast::hash(&content);
            let (compressed, method) = match method {
                Method::Store => (content.clone(), Method::Store),
                Method::Deflate => (codec::deflate(&content, self.compression_level)?, Method::Deflate),
            };

            zip::write_local_file_header(
                &mut out,
                name.as_bytes(),
                method,
                meta.dos_time,
                meta.dos_date,
                crc,
                compressed.len() as u32,
                content.len() as u32,
            )?;
            out.extend_from_slice(&compressed);

            zip::write_directory_header(
                &mut central,
                name.as_bytes(),
                method,
                meta.dos_time,
                meta.dos_date,
                crc,
                compressed.len() as u32,
                content.len() as u32,
                meta.external_attrs,
                header_offset,
            )?;
            count += 1;

            self.fs.with_meta_mut(id, |m| {
                m.crc32 = crc;
                m.method = method;
                m.compressed_size = compressed.len() as u64;
                m.uncompressed_size = content.len() as u64;
                m.size_real_is_verified = true;
            })?;
        }

        let directory_offset = out.len() as u32;
        let directory_size = central.len() as u32;
        out.extend_from_slice(&central);
        zip::write_eocd(&mut out, count, directory_size, directory_offset)?;

        std::fs::write(&self.path, &out)?;
        *self.archive_bytes.write().unwrap() = out;
        trace!(entries = count, "zip archive saved");
        Ok(())
    }
}

impl ZipTranslator {
    fn read_entry_bytes_for_save(&self, id: NodeId, meta: &ZipEntryMeta) -> Result<(Vec<u8>, Method)> {
        use std::io::{Read, Seek, SeekFrom};
        if self.fs.is_archived(id)? {
            // never touched since load: copy the compressed bytes through
            // unchanged by decompressing once for the CRC recompute (CRCs
            // are always re-verified on save) and recompressing with this
            // session's configured level.
            let data = self.materialize(meta)?;
            let mut data = data;
            data.seek(SeekFrom::Start(0)).map_err(Error::Io)?;
            let mut buf = Vec::new();
            data.read_to_end(&mut buf).map_err(Error::Io)?;
            return Ok((buf, meta.method));
        }
        let data = self.fs.take_data(id, || self.materialize(meta))?;
        let mut data = data;
        data.seek(SeekFrom::Start(0)).map_err(Error::Io)?;
        let mut buf = Vec::new();
        data.read_to_end(&mut buf).map_err(Error::Io)?;
        self.fs.put_data(id, data)?;
        // content actually touched this session: the method is decided by
        // the translator's configured compression level rather than
        // whatever `meta.method` happened to default/carry over to, so
        // `set_compression_level` has an effect on freshly written entries
        // and not just ones that already arrived compressed.
        let method = if self.compression_level == 0 { Method::Store } else { Method::Deflate };
        Ok((buf, method))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn create_write_save_and_reopen_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = dir.path().join("test.zip");
        let budget = RamBudget::new(16 * 1024 * 1024);

        let t = ZipTranslator::create(&archive_path, budget.clone());
        {
            let mut f = t.open("hello.txt", OpenMode::WRITE | OpenMode::CREATE).unwrap();
            f.write_all(b"hello, world").unwrap();
        }
        t.save().unwrap();

        let t2 = ZipTranslator::open(&archive_path, budget).unwrap();
        assert!(t2.exists("hello.txt"));
        let mut f = t2.open("hello.txt", OpenMode::READ).unwrap();
        let mut out = String::new();
        f.read_to_string(&mut out).unwrap();
        assert_eq!(out, "hello, world");
    }
}
