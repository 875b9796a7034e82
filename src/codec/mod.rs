//! Compression codecs used by the ZIP and IMG translators.
//!
//! `DeflateCodec` wraps `flate2`'s raw deflate streams, the same way
//! `rc-zip`'s entry FSM dispatches to a `flate2::read::DeflateDecoder` for
//! `Method::Deflate`. The XBOX LZO algorithm itself is treated as an
//! external collaborator (`LzoCodec`): no LZO crate is part of the
//! reference dependency stack, so callers plug in their own implementation
//! through this trait. [`NullLzoCodec`] is provided so the crate still
//! builds and runs end to end against archives that don't use the LZO
//! variant; it returns [`crate::error::UnsupportedError`] if ever asked to
//! actually touch LZO-compressed bytes.

use std::io::{self, Read, Write};

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;

use crate::error::Result;

/// Decompresses a full buffer using raw DEFLATE (no zlib/gzip wrapper),
/// matching the ZIP `Method::Deflate` on-disk framing.
pub fn inflate(input: &[u8], expected_size: u64) -> Result<Vec<u8>> {
    let mut decoder = DeflateDecoder::new(input);
    let mut out = Vec::with_capacity(expected_size.min(64 * 1024 * 1024) as usize);
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

/// Compresses a full buffer using raw DEFLATE at the given level (0-9).
pub fn deflate(input: &[u8], level: u32) -> Result<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::new(level));
    encoder.write_all(input)?;
    Ok(encoder.finish()?)
}

/// A streaming decoder usable as the forward-only data source behind
/// [`crate::stream::chunked::ChunkedStream`].
pub trait SectorDecoder {
    /// Resets the decoder to the very beginning of the logical stream.
    fn reset(&mut self) -> Result<()>;
    /// Reads up to `buf.len()` decoded bytes, returning how many were
    /// produced (0 at end of stream).
    fn read_decoded(&mut self, buf: &mut [u8]) -> Result<usize>;
}

/// Owns a raw-deflate byte buffer and exposes it as a [`SectorDecoder`].
/// Owning (rather than borrowing) the compressed bytes keeps translator
/// `open()` calls free of lifetime parameters, since the returned stream
/// is boxed as `dyn Stream` with no borrow back into the archive file.
pub struct DeflateSectorDecoder {
    source: std::sync::Arc<Vec<u8>>,
    decoder: DeflateDecoder<io::Cursor<std::sync::Arc<Vec<u8>>>>,
}

impl DeflateSectorDecoder {
    pub fn new(source: Vec<u8>) -> Self {
        let source = std::sync::Arc::new(source);
        Self {
            decoder: DeflateDecoder::new(io::Cursor::new(source.clone())),
            source,
        }
    }
}

impl SectorDecoder for DeflateSectorDecoder {
    fn reset(&mut self) -> Result<()> {
        self.decoder = DeflateDecoder::new(io::Cursor::new(self.source.clone()));
        Ok(())
    }

    fn read_decoded(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.decoder.read(buf)?)
    }
}

/// The external LZO compressor/decompressor collaborator. Implementations
/// operate on whole blocks, matching the XBOX per-block framing described
/// in [`crate::format::img`].
pub trait LzoCodec: Send + Sync {
    /// Decompresses one block of known uncompressed size.
    fn decompress_block(&self, input: &[u8], uncompressed_size: usize) -> Result<Vec<u8>>;
    /// Compresses one block, returning the compressed bytes.
    fn compress_block(&self, input: &[u8]) -> Result<Vec<u8>>;
}

/// Placeholder [`LzoCodec`] that always reports the operation as
/// unsupported. Used as the default so the crate is usable without an LZO
/// implementation wired in; swap in a real one via
/// [`crate::translator::img::ImgTranslator::with_lzo_codec`].
#[derive(Debug, Default, Clone, Copy)]
pub struct NullLzoCodec;

impl LzoCodec for NullLzoCodec {
    fn decompress_block(&self, _input: &[u8], _uncompressed_size: usize) -> Result<Vec<u8>> {
        Err(crate::error::UnsupportedError::LzoCodecNotConfigured.into())
    }

    fn compress_block(&self, _input: &[u8]) -> Result<Vec<u8>> {
        Err(crate::error::UnsupportedError::LzoCodecNotConfigured.into())
    }
}

/// A [`SectorDecoder`] over a full XBOX LZO compressed stream (stream
/// header + sequence of per-block headers/data), driven by a pluggable
/// [`LzoCodec`].
pub struct LzoSectorDecoder {
    blocks: Vec<u8>,
    codec: std::sync::Arc<dyn LzoCodec>,
    cursor: usize,
    pending: Vec<u8>,
    pending_pos: usize,
}

impl LzoSectorDecoder {
    /// `blocks` must point right after the stream header (i.e. at the
    /// first per-block header).
    pub fn new(blocks: Vec<u8>, codec: std::sync::Arc<dyn LzoCodec>) -> Self {
        Self {
            blocks,
            codec,
            cursor: 0,
            pending: Vec::new(),
            pending_pos: 0,
        }
    }

    fn advance_block(&mut self) -> Result<bool> {
        if self.cursor >= self.blocks.len() {
            return Ok(false);
        }
        let (header, consumed) =
            crate::format::img::parse_lzo_block_header(&self.blocks[self.cursor..])?;
        self.cursor += consumed;
        let data = &self.blocks[self.cursor..self.cursor + header.compressed_size as usize];
        self.cursor += header.compressed_size as usize;
        self.pending = self
            .codec
            .decompress_block(data, header.uncompressed_size as usize)?;
        self.pending_pos = 0;
        Ok(true)
    }
}

impl SectorDecoder for LzoSectorDecoder {
    fn reset(&mut self) -> Result<()> {
        self.cursor = 0;
        self.pending.clear();
        self.pending_pos = 0;
        Ok(())
    }

    fn read_decoded(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.pending_pos >= self.pending.len() && !self.advance_block()? {
            return Ok(0);
        }
        let avail = &self.pending[self.pending_pos..];
        let n = avail.len().min(buf.len());
        buf[..n].copy_from_slice(&avail[..n]);
        self.pending_pos += n;
        Ok(n)
    }
}

/// Adapts any [`SectorDecoder`] to `std::io::Read`, for callers that just
/// want to drain a whole stream (e.g. the `save` procedures, which
/// decompress an `ARCHIVED` entry wholesale when it must be rewritten).
pub struct SectorDecoderReader<'a, D: SectorDecoder>(pub &'a mut D);

impl<'a, D: SectorDecoder> Read for SectorDecoderReader<'a, D> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read_decoded(buf).map_err(Into::into)
    }
}
