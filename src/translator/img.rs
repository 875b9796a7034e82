//! Translates a Rockstar IMG archive (v1 twin-file or v2 single-file, with
//! an optional per-entry XBOX LZO compressed variant) into a
//! [`crate::vfs::VirtualFs`] tree.
//!
//! Grounded on `CFileSystem.img.translator.cpp` / `.img.serialize.hxx` (see
//! `original_source/`) for the load/save procedure shape, and on
//! [`crate::alloc::BlockAllocator`] for placement — itself grounded on the
//! same source's free-block-list allocator. IMG archives are flat (no
//! subdirectories on disk); every entry is created directly under the
//! virtual root, matching the original format.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use tracing::{info, instrument, trace, warn};

use crate::alloc::BlockAllocator;
use crate::codec::{self, LzoCodec, LzoSectorDecoder, NullLzoCodec, SectorDecoder, SectorDecoderReader};
use crate::error::{Error, FormatError, Result, UnsupportedError};
use crate::format::img::{self, BLOCK_SIZE, RESOURCE_NAME_LEN};
use crate::presence::{FileDataPresence, PresenceOptions, RamBudget};
use crate::stream::{FileOpenFailure, OpenMode, Stats};
use crate::vfs::node::{NodeId, PathProcessMode};
use crate::vfs::VirtualFs;

use super::{ArchiveTranslator, DirIter, OpenedStream};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImgVersion {
    V1,
    V2,
}

/// Per-entry metadata: the on-disk allocation plus whatever this session
/// has learned about the entry's real (decompressed) size. Block offsets
/// are always absolute from the start of the content file (for v2, that
/// includes the header and record table, which occupy block 0 onward).
#[derive(Debug, Clone)]
pub struct ImgEntryMeta {
    pub block_offset: u32,
    pub resource_blocks: u32,
    pub resource_name: [u8; RESOURCE_NAME_LEN],
    /// Exact content size in bytes, once known precisely (e.g. after a
    /// session materializes the entry); `None` means "fills every
    /// allocated block", matching the on-disk format's block granularity.
    pub expanded_size: Option<u32>,
    /// Whether the on-disk bytes are XBOX-LZO-compressed.
    pub compressed: bool,
}

impl Default for ImgEntryMeta {
    fn default() -> Self {
        Self {
            block_offset: 0,
            resource_blocks: 0,
            resource_name: [0u8; RESOURCE_NAME_LEN],
            expanded_size: Some(0),
            compressed: false,
        }
    }
}

impl ImgEntryMeta {
    fn content_len_bytes(&self) -> u64 {
        self.expanded_size
            .map(|s| s as u64)
            .unwrap_or(self.resource_blocks as u64 * BLOCK_SIZE)
    }
}

pub struct ImgTranslator {
    fs: Arc<VirtualFs<ImgEntryMeta>>,
    version: ImgVersion,
    /// For v1: the separate `.IMG` content path; for v2: the single
    /// archive path (header + records + content all in one file).
    content_path: PathBuf,
    dir_path: Option<PathBuf>,
    content_bytes: Arc<RwLock<Vec<u8>>>,
    /// Always 0: block offsets are absolute from the start of
    /// `content_path` for both versions (for v2 that means block 0 is the
    /// header/record table, reserved in the allocator so entries never
    /// overlap it). Kept as a field rather than a constant so a future
    /// variant with a distinct addressing base has somewhere to put it.
    content_base: u64,
    allocator: RwLock<BlockAllocator>,
    budget: Arc<RamBudget>,
    presence_opts: PresenceOptions,
    lzo_codec: Arc<dyn LzoCodec>,
}

impl ImgTranslator {
    #[instrument(skip_all, fields(dir = %dir_path.as_ref().display(), img = %img_path.as_ref().display()))]
    pub fn open_v1(
        dir_path: impl AsRef<Path>,
        img_path: impl AsRef<Path>,
        budget: Arc<RamBudget>,
    ) -> Result<Self> {
        let dir_bytes = std::fs::read(dir_path.as_ref())?;
        let content_bytes = std::fs::read(img_path.as_ref())?;
        let records = img::parse_dir_v1(&dir_bytes)?;

        let fs = VirtualFs::new();
        let mut allocator = BlockAllocator::new();
        for r in &records {
            let name = decode_resource_name(&r.resource_name);
            if !allocator.obtain_space_at(r.block_offset as u64, r.resource_blocks as u64) {
                warn!(name, "img v1: overlapping directory record, re-placing");
                let new_off = allocator.find_space(r.resource_blocks as u64);
                fs.create_file(
                    &name,
                    ImgEntryMeta {
                        block_offset: new_off as u32,
                        resource_blocks: r.resource_blocks,
                        resource_name: r.resource_name,
                        expanded_size: None,
                        compressed: false,
                    },
                )?;
                continue;
            }
            fs.create_file(
                &name,
                ImgEntryMeta {
                    block_offset: r.block_offset,
                    resource_blocks: r.resource_blocks,
                    resource_name: r.resource_name,
                    expanded_size: None,
                    compressed: false,
                },
            )?;
        }
        detect_compressed_entries(&fs, &content_bytes, 0)?;

        info!(entries = records.len(), "loaded v1 IMG archive");
        Ok(Self {
            fs,
            version: ImgVersion::V1,
            content_path: img_path.as_ref().to_path_buf(),
            dir_path: Some(dir_path.as_ref().to_path_buf()),
            content_bytes: Arc::new(RwLock::new(content_bytes)),
            content_base: 0,
            allocator: RwLock::new(allocator),
            budget,
            presence_opts: PresenceOptions::default(),
            lzo_codec: Arc::new(NullLzoCodec),
        })
    }

    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open_v2(path: impl AsRef<Path>, budget: Arc<RamBudget>) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        let (header, header_len) = img::parse_header_v2(&bytes)?;
        let records_start = header_len;
        let record_size = RESOURCE_NAME_LEN + 8;
        let records_end = records_start + record_size * header.entry_count as usize;
        if records_end > bytes.len() {
            return Err(FormatError::ImgBadMagic.into());
        }
        let records = img::parse_records_v2(&bytes[records_start..records_end], header.entry_count)?;

        let fs = VirtualFs::new();
        let mut allocator = BlockAllocator::new();
        // block 0 onward holds the header + record table, reserved so
        // entries are never placed over it (step 3 of the save procedure
        // reserves the same span when rebuilding).
        let table_blocks = (records_end as u64).div_ceil(BLOCK_SIZE).max(1);
        allocator.obtain_space_at(0, table_blocks);
        for r in &records {
            let name = decode_resource_name(&r.resource_name);
            let resource_blocks = r.effective_blocks();
            if !allocator.obtain_space_at(r.block_offset as u64, resource_blocks as u64) {
                warn!(name, "img v2: overlapping directory record, re-placing");
                let new_off = allocator.find_space(resource_blocks as u64);
                fs.create_file(
                    &name,
                    ImgEntryMeta {
                        block_offset: new_off as u32,
                        resource_blocks,
                        resource_name: r.resource_name,
                        expanded_size: None,
                        compressed: false,
                    },
                )?;
                continue;
            }
            fs.create_file(
                &name,
                ImgEntryMeta {
                    block_offset: r.block_offset,
                    resource_blocks,
                    resource_name: r.resource_name,
                    expanded_size: None,
                    compressed: false,
                },
            )?;
        }
        detect_compressed_entries(&fs, &bytes, 0)?;

        info!(entries = records.len(), "loaded v2 IMG archive");
        Ok(Self {
            fs,
            version: ImgVersion::V2,
            content_path: path.as_ref().to_path_buf(),
            dir_path: None,
            content_bytes: Arc::new(RwLock::new(bytes)),
            content_base: 0,
            allocator: RwLock::new(allocator),
            budget,
            presence_opts: PresenceOptions::default(),
            lzo_codec: Arc::new(NullLzoCodec),
        })
    }

    pub fn create_v2(path: impl AsRef<Path>, budget: Arc<RamBudget>) -> Self {
        Self {
            fs: VirtualFs::new(),
            version: ImgVersion::V2,
            content_path: path.as_ref().to_path_buf(),
            dir_path: None,
            content_bytes: Arc::new(RwLock::new(Vec::new())),
            content_base: 0,
            allocator: RwLock::new(BlockAllocator::new()),
            budget,
            presence_opts: PresenceOptions::default(),
            lzo_codec: Arc::new(NullLzoCodec),
        }
    }

    /// Installs an [`LzoCodec`] implementation, enabling read/write access
    /// to entries compressed with the XBOX LZO variant. Without one, such
    /// entries fail with [`UnsupportedError::LzoCodecNotConfigured`].
    pub fn with_lzo_codec(mut self, codec: Arc<dyn LzoCodec>) -> Self {
        self.lzo_codec = codec;
        self
    }

    fn entry_byte_range(&self, meta: &ImgEntryMeta) -> (u64, u64) {
        let start = self.content_base + meta.block_offset as u64 * BLOCK_SIZE;
        let on_disk_len = meta.resource_blocks as u64 * BLOCK_SIZE;
        (start, on_disk_len)
    }

    fn materialize(&self, meta: &ImgEntryMeta) -> Result<FileDataPresence> {
        let (start, on_disk_len) = self.entry_byte_range(meta);
        let bytes = self.content_bytes.read().unwrap();
        let end = (start + on_disk_len).min(bytes.len() as u64);
        if start > bytes.len() as u64 {
            return Err(FormatError::ImgEntryOutOfBounds {
                name: decode_resource_name(&meta.resource_name),
                claimed: on_disk_len,
                available: bytes.len() as u64,
            }
            .into());
        }
        let slice = &bytes[start as usize..end as usize];

        let decoded = if meta.compressed {
            let (header, consumed) = img::parse_lzo_stream_header(slice)?;
            let mut decoder = LzoSectorDecoder::new(slice[consumed..].to_vec(), self.lzo_codec.clone());
            let mut out = Vec::with_capacity(meta.content_len_bytes() as usize);
            SectorDecoderReader(&mut decoder).read_to_end(&mut out)?;
            if header.checksum != 0 {
                // verification stays opt-in: computed here only for
                // observability, never rejecting on mismatch unless a
                // caller explicitly asks us to.
                let computed = adler32::adler32(std::io::Cursor::new(&out)).unwrap_or(0);
                if computed != header.checksum {
                    trace!(expected = header.checksum, computed, "lzo checksum mismatch (non-fatal)");
                }
            }
            out
        } else {
            let real_len = meta.content_len_bytes().min(slice.len() as u64) as usize;
            slice[..real_len].to_vec()
        };

        FileDataPresence::from_bytes(self.budget.clone(), self.presence_opts, decoded).map_err(Into::into)
    }

    fn name_bytes(name: &str) -> [u8; RESOURCE_NAME_LEN] {
        let mut out = [0u8; RESOURCE_NAME_LEN];
        let bytes = name.as_bytes();
        let n = bytes.len().min(RESOURCE_NAME_LEN - 1);
        out[..n].copy_from_slice(&bytes[..n]);
        out
    }
}

fn decode_resource_name(raw: &[u8; RESOURCE_NAME_LEN]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

/// Scans every entry's first bytes for the XBOX LZO magic and flips
/// `compressed` accordingly; run once right after load since the on-disk
/// directory records themselves carry no explicit compression flag.
fn detect_compressed_entries(
    fs: &Arc<VirtualFs<ImgEntryMeta>>,
    content: &[u8],
    content_base: u64,
) -> Result<()> {
    for (_, id) in fs.walk_files()? {
        fs.with_meta_mut(id, |m| {
            let start = (content_base + m.block_offset as u64 * BLOCK_SIZE) as usize;
            if start + 4 <= content.len() {
                let maybe_magic = u32::from_le_bytes(content[start..start + 4].try_into().unwrap());
                m.compressed = maybe_magic == img::LZO_MAGIC;
            }
        })?;
    }
    Ok(())
}

impl ArchiveTranslator for ImgTranslator {
    fn create_dir(&self, _path: &str) -> Result<()> {
        // IMG archives are flat; subdirectories have no on-disk
        // representation, so this is accepted as a no-op for any path
        // that's effectively the root, and rejected otherwise.
        Err(Error::Unsupported(UnsupportedError::FlatArchiveNoDirectories))
    }

    fn open(&self, path: &str, mode: OpenMode) -> Result<OpenedStream> {
        let resolved = self.fs.resolve(path, PathProcessMode::AmbivalentFile);
        let id = match resolved {
            Ok(id) => id,
            Err(_) if mode.contains(OpenMode::CREATE) => {
                let name = path.trim_start_matches('/');
                let mut meta = ImgEntryMeta::default();
                meta.resource_name = Self::name_bytes(name);
                self.fs.create_file(name, meta)?
            }
            Err(_) => return Err(FileOpenFailure::NotFound.into()),
        };
        if self.fs.is_directory(path).unwrap_or(false) {
            return Err(FileOpenFailure::IsDirectory.into());
        }
        self.fs.lock(id)?;

        let meta = self.fs.with_meta(id, Clone::clone)?;
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
        let id = self.fs.resolve(path, PathProcessMode::AmbivalentFile)?;
        let meta = self.fs.with_meta(id, Clone::clone)?;
        self.fs.delete(path)?;
        self.allocator.write().unwrap().remove_block(meta.block_offset as u64);
        Ok(())
    }

    fn copy(&self, from: &str, to: &str) -> Result<()> {
        let from_id = self.fs.resolve(from, PathProcessMode::AmbivalentFile)?;
        let meta = self.fs.with_meta(from_id, Clone::clone)?;
        let bytes = {
            let mut d = self.fs.take_data(from_id, || self.materialize(&meta))?;
            use std::io::{Read as _, Seek as _, SeekFrom};
            d.seek(SeekFrom::Start(0)).map_err(Error::Io)?;
            let mut buf = Vec::new();
            d.read_to_end(&mut buf).map_err(Error::Io)?;
            self.fs.put_data(from_id, d)?;
            buf
        };
        let name = to.trim_start_matches('/');
        let mut new_meta = ImgEntryMeta::default();
        new_meta.resource_name = Self::name_bytes(name);
        let to_id = self.fs.create_file(name, new_meta)?;
        let presence = FileDataPresence::from_bytes(self.budget.clone(), self.presence_opts, bytes)?;
        self.fs.put_data(to_id, presence)?;
        Ok(())
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.fs.rename(from, to)
    }

    fn size(&self, path: &str) -> Result<u64> {
        let id = self.fs.resolve(path, PathProcessMode::AmbivalentFile)?;
        self.fs.with_meta(id, |m| m.content_len_bytes())
    }

    fn query_stats(&self, path: &str) -> Result<Stats> {
        let id = self.fs.resolve(path, PathProcessMode::AmbivalentFile)?;
        if self.fs.is_directory(path)? {
            return Ok(Stats {
                is_directory: true,
                ..Default::default()
            });
        }
        self.fs.with_meta(id, |m| Stats {
            size: m.content_len_bytes(),
            is_directory: false,
            is_compressed: m.compressed,
            atime: 0,
            mtime: 0,
            ctime: 0,
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

    /// Rebuilds the archive gap-free: every entry is visited, (re-)placed
    /// via best-fit allocation in tree order, and written out back to
    /// back, matching the seven-step save procedure described for IMG
    /// archives (collect entries, allocate, write content, write
    /// directory/header, replace files on disk).
    #[instrument(skip_all)]
    fn save(&self) -> Result<()> {
        let files = self.fs.walk_files()?;
        let mut allocator = BlockAllocator::new();
        if self.version == ImgVersion::V2 {
            let record_size = RESOURCE_NAME_LEN + 8;
            let header_bytes = 8 + record_size * files.len();
            let table_blocks = (header_bytes as u64).div_ceil(BLOCK_SIZE).max(1);
            allocator.obtain_space_at(0, table_blocks);
        }
        let mut placed: Vec<(String, NodeId, ImgEntryMeta, Vec<u8>)> = Vec::new();

        for (full_path, id) in files {
            let name = full_path.trim_start_matches('/').to_string();
            let meta = self.fs.with_meta(id, Clone::clone)?;
            let mut data = self.fs.take_data(id, || self.materialize(&meta))?;
            use std::io::{Read as _, Seek as _, SeekFrom};
            data.seek(SeekFrom::Start(0)).map_err(Error::Io)?;
            let mut buf = Vec::new();
            data.read_to_end(&mut buf).map_err(Error::Io)?;
            self.fs.put_data(id, data)?;

            let on_disk = if meta.compressed {
                let mut out = Vec::new();
                let block_size = 0x8000u32;
                img::write_lzo_stream_header(
                    &mut out,
                    &img::LzoStreamHeader {
                        checksum: adler32::adler32(std::io::Cursor::new(&buf)).unwrap_or(0),
                        block_size,
                    },
                )?;
                for chunk in buf.chunks(block_size as usize) {
                    let compressed = self.lzo_codec.compress_block(chunk)?;
                    img::write_lzo_block_header(
                        &mut out,
                        &img::LzoBlockHeader {
                            unknown: 4,
                            uncompressed_size: chunk.len() as u32,
                            compressed_size: compressed.len() as u32,
                        },
                    )?;
                    out.extend_from_slice(&compressed);
                }
                out
            } else {
                buf.clone()
            };

            let blocks = ((on_disk.len() as u64 + BLOCK_SIZE - 1) / BLOCK_SIZE).max(1);
            let offset = allocator.find_space(blocks);

            let mut new_meta = meta.clone();
            new_meta.block_offset = offset as u32;
            new_meta.resource_blocks = blocks as u32;
            new_meta.expanded_size = Some(buf.len() as u32);
            self.fs.with_meta_mut(id, |m| *m = new_meta.clone())?;

            placed.push((name, id, new_meta, on_disk));
        }

        let total_blocks = allocator.span_size();
        let mut content = vec![0u8; (total_blocks * BLOCK_SIZE) as usize];
        for (_, _, meta, on_disk) in &placed {
            let start = meta.block_offset as u64 * BLOCK_SIZE;
            content[start as usize..start as usize + on_disk.len()].copy_from_slice(on_disk);
        }

        match self.version {
            ImgVersion::V1 => {
                let mut dir_bytes = Vec::new();
                for (_, _, meta, _) in &placed {
                    img::write_dir_record_v1(
                        &mut dir_bytes,
                        &img::DirRecordV1 {
                            block_offset: meta.block_offset,
                            resource_blocks: meta.resource_blocks,
                            resource_name: meta.resource_name,
                        },
                    )?;
                }
                std::fs::write(self.dir_path.as_ref().expect("v1 always has a dir path"), &dir_bytes)?;
                std::fs::write(&self.content_path, &content)?;
            }
            ImgVersion::V2 => {
                // block 0 onward is already reserved (zero-filled) inside
                // `content`; write the header and table directly into that
                // span rather than prepending a second copy of it.
                let mut table = Vec::new();
                img::write_header_v2(&mut table, placed.len() as u32)?;
                for (_, _, meta, _) in &placed {
                    img::write_dir_record_v2(
                        &mut table,
                        &img::DirRecordV2 {
                            block_offset: meta.block_offset,
                            size_blocks: meta.resource_blocks as u16,
                            expanded_size_blocks: 0,
                            resource_name: meta.resource_name,
                        },
                    )?;
                }
                content[..table.len()].copy_from_slice(&table);
                std::fs::write(&self.content_path, &content)?;
            }
        }

        *self.allocator.write().unwrap() = allocator;
        *self.content_bytes.write().unwrap() = content;
        trace!(entries = placed.len(), "img archive saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn v2_create_write_save_and_reopen_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = dir.path().join("test.img");
        let budget = RamBudget::new(16 * 1024 * 1024);

        let t = ImgTranslator::create_v2(&archive_path, budget.clone());
        {
            let mut f = t.open("car.dff", OpenMode::WRITE | OpenMode::CREATE).unwrap();
            f.write_all(b"model bytes go here").unwrap();
        }
        t.save().unwrap();

        let t2 = ImgTranslator::open_v2(&archive_path, budget).unwrap();
        assert!(t2.exists("car.dff"));
        let mut f = t2.open("car.dff", OpenMode::READ).unwrap();
        let mut out = Vec::new();
        f.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"model bytes go here");
    }

    #[test]
    fn flat_archive_rejects_create_dir() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = dir.path().join("test.img");
        let budget = RamBudget::new(16 * 1024 * 1024);
        let t = ImgTranslator::create_v2(&archive_path, budget);
        assert!(matches!(
            t.create_dir("models"),
            Err(Error::Unsupported(UnsupportedError::FlatArchiveNoDirectories))
        ));
    }
}
