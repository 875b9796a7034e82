//! Stream abstractions shared by every translator: the common `Stream`
//! trait, file-open semantics, and the two composite stream wrappers
//! ([`buffered::BufferedStream`] and [`chunked::ChunkedStream`]).

pub mod buffered;
pub mod chunked;

use std::io::{Read, Seek, Write};

/// Anything a translator can hand back from `open`: seekable, readable, and
/// (when the entry wasn't opened read-only) writable.
pub trait Stream: Read + Write + Seek {
    /// Current logical size of the stream's content, which may exceed the
    /// amount of data physically backing it (e.g. a `BufferedStream` with
    /// unflushed writes past the underlying file's end).
    fn get_size(&mut self) -> std::io::Result<u64>;

    /// Truncates or extends the stream to exactly `new_size` bytes.
    fn set_size(&mut self, new_size: u64) -> std::io::Result<()>;
}

/// How a file is to be opened; mirrors the combinations a translator must
/// support (read-only vs read-write, truncate-on-open, create).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenMode(u8);

impl OpenMode {
    /// Open for reading.
    pub const READ: OpenMode = OpenMode(0b0001);
    /// Open for writing (content may be mutated/extended).
    pub const WRITE: OpenMode = OpenMode(0b0010);
    /// Truncate existing content to zero bytes on open.
    pub const TRUNCATE: OpenMode = OpenMode(0b0100);
    /// Create the entry if it doesn't already exist.
    pub const CREATE: OpenMode = OpenMode(0b1000);

    pub fn contains(self, other: OpenMode) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_write(self) -> bool {
        self.contains(OpenMode::WRITE)
    }
}

impl std::ops::BitOr for OpenMode {
    type Output = OpenMode;
    fn bitor(self, rhs: OpenMode) -> OpenMode {
        OpenMode(self.0 | rhs.0)
    }
}

/// Why an `open` call failed, distinguishing cases the caller may want to
/// react to differently (e.g. retry with `CREATE` set) from hard errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOpenFailure {
    /// The path does not name an existing node and `CREATE` was not set.
    NotFound,
    /// The path names a directory, not a file.
    IsDirectory,
    /// The entry is locked (open elsewhere) in a mode incompatible with
    /// this request.
    Locked,
    /// The entry is `ARCHIVED` and this translator does not support
    /// opening archived entries for writing without first materializing
    /// them (callers should read first, or accept the implicit
    /// decompress-on-write the translator performs).
    ArchivedReadOnly,
}

impl std::fmt::Display for FileOpenFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FileOpenFailure::NotFound => "file not found",
            FileOpenFailure::IsDirectory => "path is a directory",
            FileOpenFailure::Locked => "file is locked",
            FileOpenFailure::ArchivedReadOnly => "archived entry cannot be opened for writing directly",
        };
        f.write_str(s)
    }
}

impl std::error::Error for FileOpenFailure {}

/// Aggregate statistics reported by `query_stats`, mirroring the subset of
/// metadata every translator (host filesystem, ZIP, IMG) can report
/// uniformly regardless of backing format.
#[derive(Debug, Clone, Copy, Default)]
pub struct Stats {
    pub size: u64,
    pub is_directory: bool,
    pub is_compressed: bool,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
}
