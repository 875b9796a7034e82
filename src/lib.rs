//! A filesystem abstraction layer that exposes ZIP archives and Rockstar
//! IMG archives (v1/v2, with an optional XBOX LZO compressed variant)
//! through a single [`translator::ArchiveTranslator`] interface, backed by
//! a shared virtual filesystem tree ([`vfs::VirtualFs`]).
//!
//! The pieces compose roughly like this:
//!
//! - [`vfs`] holds the in-memory directory tree every translator builds
//!   and walks; it is generic over the per-entry metadata each archive
//!   format needs to remember.
//! - [`presence`] and [`alloc`] back the two resource-management problems
//!   every translator faces: where a file's bytes physically live
//!   (`presence`), and where to place them within a content stream
//!   (`alloc`).
//! - [`stream`] wraps raw `Read + Write + Seek` streams with a dirty-range
//!   write-back cache ([`stream::buffered::BufferedStream`]) and a
//!   forward-decoder-backed random access view
//!   ([`stream::chunked::ChunkedStream`]).
//! - [`format`] parses and serializes the on-disk records themselves.
//! - [`codec`] wraps the compression algorithms (`flate2` for DEFLATE; the
//!   XBOX LZO variant is a pluggable collaborator, see
//!   [`codec::LzoCodec`]).
//! - [`translator::zip::ZipTranslator`] and [`translator::img::ImgTranslator`]
//!   tie all of the above together into the two concrete
//!   [`translator::ArchiveTranslator`] implementations.

pub mod alloc;
pub mod codec;
pub mod encoding;
pub mod error;
pub mod format;
pub mod presence;
pub mod stream;
pub mod translator;
pub mod vfs;
pub mod wildcard;

pub use error::{Error, Result};
pub use translator::ArchiveTranslator;
