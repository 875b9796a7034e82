//! `BufferedStream`: a single-window read/write cache in front of an
//! underlying seekable stream, tracking which bytes in its window are
//! dirty so a flush only rewrites what actually changed.
//!
//! Grounded on `CFileSystem.stream.buffered.cpp`; the validity-range
//! bitmap and `dirty_high_water` field names are carried over from that
//! design, re-expressed as a small windowed cache rather than the
//! original's raw pointer bookkeeping.

use std::io::{self, Read, Seek, SeekFrom, Write};

use tracing::trace;

use super::Stream;

const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ByteState {
    Absent,
    Clean,
    Dirty,
}

/// Wraps any `Read + Write + Seek` stream with a single fixed-size buffer
/// window. Reads and writes within the window are served from the buffer;
/// crossing a window boundary flushes dirty bytes and refills.
pub struct BufferedStream<S> {
    inner: S,
    buf: Vec<u8>,
    state: Vec<ByteState>,
    /// Offset in the underlying stream that `buf[0]` corresponds to.
    buf_offset: u64,
    /// Current logical position within the stream (not the buffer).
    position: u64,
    /// Highest byte offset (relative to `buf_offset`) ever written dirty;
    /// `get_size` uses this to report writes that extend past the
    /// underlying stream's own notion of its length.
    dirty_high_water: usize,
    underlying_size: u64,
}

impl<S: Read + Write + Seek> BufferedStream<S> {
    fn new_with_capacity(mut inner: S, capacity: usize) -> io::Result<Self> {
        let underlying_size = inner.seek(SeekFrom::End(0))?;
        inner.seek(SeekFrom::Start(0))?;
        let cap = capacity.max(1);
        let mut s = Self {
            inner,
            buf: vec![0u8; cap],
            state: vec![ByteState::Absent; cap],
            buf_offset: 0,
            position: 0,
            dirty_high_water: 0,
            underlying_size,
        };
        // the starting window covers [0, cap) but was just allocated as
        // all-`Absent`; prime it from the underlying stream now rather than
        // relying on `ensure_window_for`, which only refills on a window
        // *change* and would otherwise leave a read at offset 0 returning
        // zeros for bytes that exist underneath.
        s.refill_window(0)?;
        Ok(s)
    }

    pub fn new(inner: S) -> io::Result<Self> {
        Self::new_with_capacity(inner, DEFAULT_BUFFER_SIZE)
    }

    pub fn with_capacity(inner: S, capacity: usize) -> io::Result<Self> {
        Self::new_with_capacity(inner, capacity)
    }

    pub fn into_inner(mut self) -> io::Result<S> {
        self.flush()?;
        Ok(self.inner)
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    fn window_end(&self) -> u64 {
        self.buf_offset + self.buf.len() as u64
    }

    fn in_window(&self, pos: u64) -> bool {
        pos >= self.buf_offset && pos < self.window_end()
    }

    fn flush_window(&mut self) -> io::Result<()> {
        let mut run_start: Option<usize> = None;
        for i in 0..=self.buf.len() {
            let dirty = i < self.buf.len() && self.state[i] == ByteState::Dirty;
            match (dirty, run_start) {
                (true, None) => run_start = Some(i),
                (false, Some(start)) => {
                    let abs = self.buf_offset + start as u64;
                    self.inner.seek(SeekFrom::Start(abs))?;
                    self.inner.write_all(&self.buf[start..i])?;
                    trace!(abs, len = i - start, "buffered stream: flushed dirty run");
                    run_start = None;
                }
                _ => {}
            }
        }
        for s in self.state.iter_mut() {
            if *s == ByteState::Dirty {
                *s = ByteState::Clean;
            }
        }
        self.underlying_size = self.underlying_size.max(self.buf_offset + self.dirty_high_water as u64);
        self.dirty_high_water = 0;
        Ok(())
    }

    fn refill_window(&mut self, new_offset: u64) -> io::Result<()> {
        self.flush_window()?;
        self.buf_offset = new_offset;
        self.state.iter_mut().for_each(|s| *s = ByteState::Absent);
        if new_offset < self.underlying_size {
            self.inner.seek(SeekFrom::Start(new_offset))?;
            let want = (self.underlying_size - new_offset).min(self.buf.len() as u64) as usize;
            let mut read_total = 0;
            while read_total < want {
                let n = self.inner.read(&mut self.buf[read_total..want])?;
                if n == 0 {
                    break;
                }
                read_total += n;
            }
            for s in self.state.iter_mut().take(read_total) {
                *s = ByteState::Clean;
            }
        }
        Ok(())
    }

    fn ensure_window_for(&mut self, pos: u64) -> io::Result<()> {
        if !self.in_window(pos) {
            let aligned = (pos / self.buf.len() as u64) * self.buf.len() as u64;
            self.refill_window(aligned)?;
        }
        Ok(())
    }
}

impl<S: Read + Write + Seek> Read for BufferedStream<S> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        self.ensure_window_for(self.position)?;
        let window_pos = (self.position - self.buf_offset) as usize;
        let avail = (self.buf.len() - window_pos).min(out.len());
        let logical_end = self.get_size()?;
        let readable = ((logical_end.saturating_sub(self.position)) as usize).min(avail);
        out[..readable].copy_from_slice(&self.buf[window_pos..window_pos + readable]);
        self.position += readable as u64;
        Ok(readable)
    }
}

impl<S: Read + Write + Seek> Write for BufferedStream<S> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        self.ensure_window_for(self.position)?;
        let window_pos = (self.position - self.buf_offset) as usize;
        let n = (self.buf.len() - window_pos).min(data.len());
        self.buf[window_pos..window_pos + n].copy_from_slice(&data[..n]);
        for s in self.state[window_pos..window_pos + n].iter_mut() {
            *s = ByteState::Dirty;
        }
        self.dirty_high_water = self.dirty_high_water.max(window_pos + n);
        self.position += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_window()?;
        self.inner.flush()
    }
}

impl<S: Read + Write + Seek> Seek for BufferedStream<S> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let size = self.get_size()?;
        let new_pos = match pos {
            SeekFrom::Start(p) => p,
            SeekFrom::End(delta) => (size as i64 + delta).max(0) as u64,
            SeekFrom::Current(delta) => (self.position as i64 + delta).max(0) as u64,
        };
        self.position = new_pos;
        Ok(new_pos)
    }
}

impl<S: Read + Write + Seek> Stream for BufferedStream<S> {
    fn get_size(&mut self) -> io::Result<u64> {
        Ok(self.underlying_size.max(self.buf_offset + self.dirty_high_water as u64))
    }

    fn set_size(&mut self, new_size: u64) -> io::Result<()> {
        self.flush_window()?;
        // seeking the inner stream past its end and writing one byte is
        // the portable way to grow it; shrinking goes through inner
        // directly if it exposes `set_len`-like semantics via the
        // `Stream` trait object one layer up. Here we approximate both by
        // tracking `underlying_size` and letting the next flush handle any
        // gap with zero bytes, matching the original's lazily-extended
        // sparse file behavior.
        self.underlying_size = new_size;
        if self.position > new_size {
            self.position = new_size;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn partial_overwrite_preserves_surrounding_bytes() {
        let data = vec![0u8; 256];
        let mut bs = BufferedStream::with_capacity(Cursor::new(data), 64).unwrap();
        bs.seek(SeekFrom::Start(10)).unwrap();
        bs.write_all(&[1, 2, 3, 4]).unwrap();
        bs.flush().unwrap();
        let mut out = vec![0u8; 256];
        let inner = bs.into_inner().unwrap();
        out.copy_from_slice(inner.get_ref());
        assert_eq!(&out[10..14], &[1, 2, 3, 4]);
        assert_eq!(out[9], 0);
        assert_eq!(out[14], 0);
    }

    #[test]
    fn write_past_end_extends_size() {
        let mut bs = BufferedStream::with_capacity(Cursor::new(Vec::new()), 32).unwrap();
        bs.write_all(b"hello world").unwrap();
        assert_eq!(bs.get_size().unwrap(), 11);
    }

    #[test]
    fn read_across_window_boundary() {
        let data: Vec<u8> = (0..100u8).collect();
        let mut bs = BufferedStream::with_capacity(Cursor::new(data.clone()), 16).unwrap();
        let mut out = vec![0u8; 100];
        bs.read_exact(&mut out).unwrap();
        assert_eq!(out, data);
    }
}
