//! `FileDataPresence`: a swappable-backing-store data sink that migrates a
//! file's content between RAM and a temporary disk file as it grows, so
//! that many small files stay fast while a handful of huge ones don't blow
//! the process's memory budget.
//!
//! Grounded on `CFileSystem.FileDataPresence.h` (see `original_source/`) and
//! adapted to this crate's `Read + Write + Seek` stream style, using
//! `tempfile::NamedTempFile` for scratch disk storage the same way other
//! archive/extraction tools in this ecosystem do.

use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tempfile::NamedTempFile;
use tracing::{debug, trace};

/// Process-wide (per-[`crate::vfs::VirtualFs`] instance, in practice)
/// accounting of how much file content currently lives in RAM across all
/// open [`FileDataPresence`] sinks.
#[derive(Debug)]
pub struct RamBudget {
    max_quota: u64,
    used: AtomicU64,
}

impl RamBudget {
    pub fn new(max_quota: u64) -> Arc<Self> {
        Arc::new(Self {
            max_quota,
            used: AtomicU64::new(0),
        })
    }

    fn try_reserve(&self, bytes: u64) -> bool {
        loop {
            let current = self.used.load(Ordering::Acquire);
            let next = current + bytes;
            if next > self.max_quota {
                return false;
            }
            if self
                .used
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    fn release(&self, bytes: u64) {
        self.used.fetch_sub(bytes.min(self.used.load(Ordering::Acquire)), Ordering::AcqRel);
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    pub fn max_quota(&self) -> u64 {
        self.max_quota
    }
}

/// Tunables controlling when a presence sink spills from RAM to disk.
#[derive(Debug, Clone, Copy)]
pub struct PresenceOptions {
    /// A single file larger than this many bytes is always disk-backed,
    /// regardless of the shared RAM budget.
    pub file_max_in_ram: u64,
    /// Fraction (0.0-1.0) of `file_max_in_ram` at which point growth makes
    /// the sink start preferring to fade into disk rather than keep
    /// growing its RAM buffer; a smoother transition than a hard cutoff.
    pub perc_file_memory_fade_in: f32,
}

impl Default for PresenceOptions {
    fn default() -> Self {
        Self {
            file_max_in_ram: 8 * 1024 * 1024,
            perc_file_memory_fade_in: 0.75,
        }
    }
}

enum Sink {
    Memory(Cursor<Vec<u8>>),
    Disk { file: NamedTempFile, size: u64 },
}

/// A content sink that starts in RAM and migrates to a temporary file on
/// disk once it outgrows the configured thresholds, or never spills at all
/// for small files. Implements `Read + Write + Seek` so translators can
/// treat it exactly like any other stream.
pub struct FileDataPresence {
    sink: Sink,
    budget: Arc<RamBudget>,
    opts: PresenceOptions,
    ram_reserved: u64,
}

impl FileDataPresence {
    pub fn new(budget: Arc<RamBudget>, opts: PresenceOptions) -> Self {
        Self {
            sink: Sink::Memory(Cursor::new(Vec::new())),
            budget,
            opts,
            ram_reserved: 0,
        }
    }

    /// Seeds the sink directly with bytes already in memory (e.g. content
    /// just decompressed from an archive), choosing RAM or disk up front.
    pub fn from_bytes(budget: Arc<RamBudget>, opts: PresenceOptions, bytes: Vec<u8>) -> io::Result<Self> {
        let mut sink = Self::new(budget, opts);
        sink.write_all(&bytes)?;
        sink.seek(SeekFrom::Start(0))?;
        Ok(sink)
    }

    pub fn is_disk_backed(&self) -> bool {
        matches!(self.sink, Sink::Disk { .. })
    }

    pub fn size(&self) -> u64 {
        match &self.sink {
            Sink::Memory(c) => c.get_ref().len() as u64,
            Sink::Disk { size, .. } => *size,
        }
    }

    fn fade_in_threshold(&self) -> u64 {
        (self.opts.file_max_in_ram as f32 * self.opts.perc_file_memory_fade_in) as u64
    }

    /// Decides, given a prospective new size, whether the sink should be
    /// (or remain) disk-backed. Hysteretic: a file that has already spilled
    /// to disk never migrates back to RAM, avoiding thrashing on a file
    /// that oscillates near the threshold.
    fn wants_disk(&self, prospective_size: u64) -> bool {
        if self.is_disk_backed() {
            return true;
        }
        if prospective_size > self.opts.file_max_in_ram {
            return true;
        }
        if prospective_size > self.fade_in_threshold() {
            // past the fade-in point: only stay in RAM if the shared
            // budget comfortably allows it, otherwise prefer disk early.
            return self.budget.used() + prospective_size > self.budget.max_quota() / 2;
        }
        false
    }

    fn migrate_to_disk(&mut self) -> io::Result<()> {
        let Sink::Memory(cursor) = &self.sink else {
            return Ok(());
        };
        let pos = cursor.position();
        let data = cursor.get_ref().clone();
        let mut file = NamedTempFile::new()?;
        file.write_all(&data)?;
        file.seek(SeekFrom::Start(pos))?;
        let size = data.len() as u64;
        self.budget.release(self.ram_reserved);
        self.ram_reserved = 0;
        debug!(size, "presence sink migrated RAM -> disk");
        self.sink = Sink::Disk { file, size };
        Ok(())
    }

    fn ensure_capacity(&mut self, prospective_size: u64) -> io::Result<()> {
        if matches!(self.sink, Sink::Disk { .. }) {
            return Ok(());
        }
        if self.wants_disk(prospective_size) || !self.budget.try_reserve(prospective_size.saturating_sub(self.ram_reserved)) {
            self.migrate_to_disk()?;
        } else {
            self.ram_reserved = prospective_size.max(self.ram_reserved);
        }
        Ok(())
    }
}

impl Drop for FileDataPresence {
    fn drop(&mut self) {
        self.budget.release(self.ram_reserved);
    }
}

impl Read for FileDataPresence {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.sink {
            Sink::Memory(c) => c.read(buf),
            Sink::Disk { file, .. } => file.read(buf),
        }
    }
}

impl Write for FileDataPresence {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let current_pos = match &mut self.sink {
            Sink::Memory(c) => c.position(),
            Sink::Disk { file, .. } => file.stream_position()?,
        };
        let prospective_size = (current_pos + buf.len() as u64).max(self.size());
        self.ensure_capacity(prospective_size)?;

        let n = match &mut self.sink {
            Sink::Memory(c) => c.write(buf)?,
            Sink::Disk { file, size } => {
                let n = file.write(buf)?;
                *size = (*size).max(current_pos + n as u64);
                n
            }
        };
        trace!(n, prospective_size, "presence sink write");
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.sink {
            Sink::Memory(_) => Ok(()),
            Sink::Disk { file, .. } => file.flush(),
        }
    }
}

impl Seek for FileDataPresence {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match &mut self.sink {
            Sink::Memory(c) => c.seek(pos),
            Sink::Disk { file, .. } => file.seek(pos),
        }
    }
}

impl crate::stream::Stream for FileDataPresence {
    fn get_size(&mut self) -> io::Result<u64> {
        Ok(self.size())
    }

    fn set_size(&mut self, new_size: u64) -> io::Result<()> {
        self.set_len(new_size)
    }
}

impl FileDataPresence {
    /// Truncates or extends the sink to exactly `new_size` bytes, matching
    /// `std::fs::File::set_len` semantics (extension zero-fills).
    pub fn set_len(&mut self, new_size: u64) -> io::Result<()> {
        self.ensure_capacity(new_size)?;
        match &mut self.sink {
            Sink::Memory(c) => {
                c.get_mut().resize(new_size as usize, 0);
            }
            Sink::Disk { file, size } => {
                file.as_file().set_len(new_size)?;
                *size = new_size;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_write_stays_in_ram() {
        let budget = RamBudget::new(1024 * 1024);
        let mut p = FileDataPresence::new(budget, PresenceOptions::default());
        p.write_all(b"hello").unwrap();
        assert!(!p.is_disk_backed());
        assert_eq!(p.size(), 5);
    }

    #[test]
    fn large_write_spills_to_disk() {
        let budget = RamBudget::new(1024 * 1024);
        let opts = PresenceOptions {
            file_max_in_ram: 16,
            perc_file_memory_fade_in: 0.5,
        };
        let mut p = FileDataPresence::new(budget, opts);
        p.write_all(&vec![7u8; 64]).unwrap();
        assert!(p.is_disk_backed());
        p.seek(SeekFrom::Start(0)).unwrap();
        let mut out = Vec::new();
        p.read_to_end(&mut out).unwrap();
        assert_eq!(out, vec![7u8; 64]);
    }

    #[test]
    fn disk_backed_never_migrates_back() {
        let budget = RamBudget::new(1024 * 1024);
        let opts = PresenceOptions {
            file_max_in_ram: 8,
            perc_file_memory_fade_in: 0.5,
        };
        let mut p = FileDataPresence::new(budget, opts);
        p.write_all(&vec![1u8; 32]).unwrap();
        assert!(p.is_disk_backed());
        p.set_len(2).unwrap();
        assert!(p.is_disk_backed());
    }
}
