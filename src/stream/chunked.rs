//! `ChunkedStream`: random access reads over a forward-only decoder
//! (DEFLATE, XBOX LZO), by keeping exactly one decoded sector cached and
//! resetting the decoder whenever a backward seek is requested.
//!
//! Grounded on `CFileSystem.stream.chunkbuf.h`'s sector-cache design,
//! adapted to this crate's [`crate::codec::SectorDecoder`] trait.

use std::io::{self, Read, Seek, SeekFrom, Write};

use tracing::trace;

use crate::codec::SectorDecoder;

use super::Stream;

const SECTOR_SIZE: usize = 32 * 1024;

/// A seekable read-only view over a [`SectorDecoder`]. Writes are rejected;
/// translators that need to mutate compressed content decompress it into a
/// [`crate::presence::FileDataPresence`] first (the "decompress-on-write"
/// rule described for archived entries).
pub struct ChunkedStream<D> {
    decoder: D,
    logical_size: u64,
    position: u64,
    /// Byte offset (relative to the start of the decoded stream) of
    /// `sector`'s first byte.
    sector_offset: u64,
    sector: Vec<u8>,
    sector_valid_len: usize,
    decoder_cursor: u64,
}

impl<D: SectorDecoder> ChunkedStream<D> {
    pub fn new(decoder: D, logical_size: u64) -> Self {
        Self {
            decoder,
            logical_size,
            position: 0,
            sector_offset: 0,
            sector: vec![0u8; SECTOR_SIZE],
            sector_valid_len: 0,
            decoder_cursor: 0,
        }
    }

    fn sector_contains(&self, pos: u64) -> bool {
        pos >= self.sector_offset && pos < self.sector_offset + self.sector_valid_len as u64
    }

    /// Advances the decoder from wherever it currently is up to `target`,
    /// resetting first if `target` lies behind the decoder's current
    /// cursor (a backward seek forces a full re-decode from the start).
    fn transition_seek(&mut self, target: u64) -> io::Result<()> {
        if target < self.decoder_cursor {
            trace!(target, cursor = self.decoder_cursor, "chunked stream: backward seek, resetting decoder");
            self.decoder.reset().map_err(Into::<io::Error>::into)?;
            self.decoder_cursor = 0;
            self.sector_offset = 0;
            self.sector_valid_len = 0;
        }
        let sector_start = (target / SECTOR_SIZE as u64) * SECTOR_SIZE as u64;
        while self.decoder_cursor < sector_start {
            let to_skip = (sector_start - self.decoder_cursor).min(self.sector.len() as u64) as usize;
            let n = self
                .decoder
                .read_decoded(&mut self.sector[..to_skip])
                .map_err(Into::<io::Error>::into)?;
            if n == 0 {
                break;
            }
            self.decoder_cursor += n as u64;
        }
        if self.sector_offset != sector_start || self.sector_valid_len == 0 {
            self.read_to_buffer(sector_start)?;
        }
        Ok(())
    }

    fn read_to_buffer(&mut self, sector_start: u64) -> io::Result<()> {
        let mut filled = 0;
        while filled < self.sector.len() {
            let n = self
                .decoder
                .read_decoded(&mut self.sector[filled..])
                .map_err(Into::<io::Error>::into)?;
            if n == 0 {
                break;
            }
            filled += n;
            self.decoder_cursor += n as u64;
        }
        self.sector_offset = sector_start;
        self.sector_valid_len = filled;
        Ok(())
    }
}

impl<D: SectorDecoder> Read for ChunkedStream<D> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if self.position >= self.logical_size || out.is_empty() {
            return Ok(0);
        }
        if !self.sector_contains(self.position) {
            self.transition_seek(self.position)?;
        }
        if !self.sector_contains(self.position) {
            // reached end of decoded stream before logical_size: treat the
            // remainder as EOF rather than erroring, matching a decoder
            // that ran dry.
            return Ok(0);
        }
        let offset_in_sector = (self.position - self.sector_offset) as usize;
        let avail = self.sector_valid_len - offset_in_sector;
        let capped = avail.min(out.len()).min((self.logical_size - self.position) as usize);
        out[..capped].copy_from_slice(&self.sector[offset_in_sector..offset_in_sector + capped]);
        self.position += capped as u64;
        Ok(capped)
    }
}

impl<D: SectorDecoder> Write for ChunkedStream<D> {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "ChunkedStream is read-only; materialize the entry before writing",
        ))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<D: SectorDecoder> Seek for ChunkedStream<D> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(p) => p,
            SeekFrom::End(delta) => (self.logical_size as i64 + delta).max(0) as u64,
            SeekFrom::Current(delta) => (self.position as i64 + delta).max(0) as u64,
        };
        self.position = new_pos;
        Ok(new_pos)
    }
}

impl<D: SectorDecoder> Stream for ChunkedStream<D> {
    fn get_size(&mut self) -> io::Result<u64> {
        Ok(self.logical_size)
    }

    fn set_size(&mut self, _new_size: u64) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "ChunkedStream is read-only",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DeflateSectorDecoder;

    #[test]
    fn sequential_read_matches_source() {
        let plain = b"the quick brown fox jumps over the lazy dog".repeat(100);
        let compressed = crate::codec::deflate(&plain, 6).unwrap();
        let decoder = DeflateSectorDecoder::new(compressed);
        let mut cs = ChunkedStream::new(decoder, plain.len() as u64);
        let mut out = Vec::new();
        cs.read_to_end(&mut out).unwrap();
        assert_eq!(out, plain);
    }

    #[test]
    fn backward_seek_resets_decoder() {
        let plain = b"abcdefghijklmnopqrstuvwxyz".repeat(4000);
        let compressed = crate::codec::deflate(&plain, 6).unwrap();
        let decoder = DeflateSectorDecoder::new(compressed);
        let mut cs = ChunkedStream::new(decoder, plain.len() as u64);
        cs.seek(SeekFrom::Start(50_000)).unwrap();
        let mut out = vec![0u8; 10];
        cs.read_exact(&mut out).unwrap();
        assert_eq!(&out[..], &plain[50_000..50_010]);

        cs.seek(SeekFrom::Start(100)).unwrap();
        let mut out2 = vec![0u8; 10];
        cs.read_exact(&mut out2).unwrap();
        assert_eq!(&out2[..], &plain[100..110]);
    }
}
