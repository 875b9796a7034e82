//! The `ArchiveTranslator` trait implemented once each by the ZIP and IMG
//! backends: a uniform surface the rest of a filesystem façade could drive
//! without knowing which archive format actually backs a given root.

pub mod img;
pub mod zip;

use std::io::{Read as _, Seek as _, Write as _};
use std::sync::Arc;

use crate::error::Result;
use crate::presence::FileDataPresence;
use crate::stream::{FileOpenFailure, OpenMode, Stats};
use crate::vfs::node::NodeId;
use crate::vfs::VirtualFs;

/// Iterator handle returned by `begin_directory_listing`, yielding entry
/// names in on-disk serialization order.
pub struct DirIter {
    pub(crate) names: std::vec::IntoIter<String>,
}

impl Iterator for DirIter {
    type Item = String;
    fn next(&mut self) -> Option<String> {
        self.names.next()
    }
}

/// A stream handle as returned by `open`, boxed so the trait stays
/// object-safe across the two very different backing implementations.
pub type OpenedStream = Box<dyn crate::stream::Stream>;

/// The uniform surface every archive backend (and, conceptually, the host
/// filesystem translator this crate's `original_source/` counterpart also
/// implements against) exposes to the rest of a filesystem façade.
pub trait ArchiveTranslator {
    fn create_dir(&self, path: &str) -> Result<()>;

    /// Opens a file for reading and/or writing, optionally creating it.
    /// Returns `Err` wrapping a [`FileOpenFailure`] (via
    /// [`crate::error::Error::Open`]) when the path cannot be opened as
    /// requested.
    fn open(&self, path: &str, mode: OpenMode) -> Result<OpenedStream>;

    fn exists(&self, path: &str) -> bool;

    fn delete(&self, path: &str) -> Result<()>;

    fn copy(&self, from: &str, to: &str) -> Result<()>;

    fn rename(&self, from: &str, to: &str) -> Result<()>;

    fn size(&self, path: &str) -> Result<u64>;

    fn query_stats(&self, path: &str) -> Result<Stats>;

    fn scan_directory(&self, path: &str, pattern: Option<&str>) -> Result<Vec<String>>;

    fn begin_directory_listing(&self, path: &str) -> Result<DirIter>;

    fn change_directory(&self, path: &str) -> Result<()>;

    /// Flushes every pending change back to the backing archive file,
    /// rebuilding its header/directory structures as needed. A no-op
    /// translator backed directly by the host filesystem would implement
    /// this as a plain `Ok(())`.
    fn save(&self) -> Result<()>;
}

/// A stream handle checked out of a [`VirtualFs`] tree via
/// [`VirtualFs::take_data`]; restores the sink and releases the node's
/// lock when dropped. Shared by every translator's `open` implementation.
pub(crate) struct CheckedOutStream<M> {
    pub(crate) fs: Arc<VirtualFs<M>>,
    pub(crate) id: NodeId,
    pub(crate) presence: Option<FileDataPresence>,
}

impl<M> std::io::Read for CheckedOutStream<M> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.presence.as_mut().unwrap().read(buf)
    }
}

impl<M> std::io::Write for CheckedOutStream<M> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.presence.as_mut().unwrap().write(buf)
    }
    fn flush(&mut self) -> std::io::Result<()> {
        self.presence.as_mut().unwrap().flush()
    }
}

impl<M> std::io::Seek for CheckedOutStream<M> {
    fn seek(&mut self, pos: std::io::SeekFrom) -> std::io::Result<u64> {
        self.presence.as_mut().unwrap().seek(pos)
    }
}

impl<M> crate::stream::Stream for CheckedOutStream<M> {
    fn get_size(&mut self) -> std::io::Result<u64> {
        crate::stream::Stream::get_size(self.presence.as_mut().unwrap())
    }
    fn set_size(&mut self, new_size: u64) -> std::io::Result<()> {
        crate::stream::Stream::set_size(self.presence.as_mut().unwrap(), new_size)
    }
}

impl<M> Drop for CheckedOutStream<M> {
    fn drop(&mut self) {
        if let Some(p) = self.presence.take() {
            let _ = self.fs.put_data(self.id, p);
        }
        let _ = self.fs.unlock(self.id);
    }
}

/// A read-only stream handle over a still-compressed, untouched entry,
/// decoded on demand through a forward-only
/// [`crate::stream::chunked::ChunkedStream`] sector cache rather than
/// materializing the whole entry into a [`FileDataPresence`] up front.
/// Used for `OpenMode::READ`-only opens of an `Archived` compressed entry;
/// the node's `data_state` is left untouched (still `Archived`) for the
/// duration, so a later write still goes through the usual
/// take_data/materialize path. Only the lock count is held, to keep
/// delete/rename blocked while the stream is open.
pub(crate) struct ChunkedEntryStream<M, D: crate::codec::SectorDecoder> {
    pub(crate) fs: Arc<VirtualFs<M>>,
    pub(crate) id: NodeId,
    pub(crate) inner: crate::stream::chunked::ChunkedStream<D>,
}

impl<M, D: crate::codec::SectorDecoder> std::io::Read for ChunkedEntryStream<M, D> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}

impl<M, D: crate::codec::SectorDecoder> std::io::Write for ChunkedEntryStream<M, D> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner.write(buf)
    }
    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

impl<M, D: crate::codec::SectorDecoder> std::io::Seek for ChunkedEntryStream<M, D> {
    fn seek(&mut self, pos: std::io::SeekFrom) -> std::io::Result<u64> {
        self.inner.seek(pos)
    }
}

impl<M, D: crate::codec::SectorDecoder> crate::stream::Stream for ChunkedEntryStream<M, D> {
    fn get_size(&mut self) -> std::io::Result<u64> {
        crate::stream::Stream::get_size(&mut self.inner)
    }
    fn set_size(&mut self, new_size: u64) -> std::io::Result<()> {
        crate::stream::Stream::set_size(&mut self.inner, new_size)
    }
}

impl<M, D: crate::codec::SectorDecoder> Drop for ChunkedEntryStream<M, D> {
    fn drop(&mut self) {
        let _ = self.fs.unlock(self.id);
    }
}
