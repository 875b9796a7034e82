//! All error types used in this crate.

use crate::format::zip::Method;

/// Any archive-related error, from invalid archives to resource exhaustion.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Not a valid archive, or a variant that is unsupported.
    #[error("format: {0}")]
    Format(#[from] FormatError),

    /// Something is not supported by this crate.
    #[error("unsupported: {0}")]
    Unsupported(#[from] UnsupportedError),

    /// Invalid UTF-8 or any problem encountered while decoding entry names.
    #[error("encoding: {0}")]
    Encoding(String),

    /// I/O-related error from the underlying stream or host filesystem.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// `open` could not satisfy the requested mode.
    #[error("open failed: {0}")]
    Open(#[from] crate::stream::FileOpenFailure),

    /// Decompression or compression error.
    #[error("{method:?} codec error: {msg}")]
    Codec {
        /// The compression method that failed.
        method: Method,
        /// Additional information.
        msg: String,
    },

    /// A temporary data sink could not be allocated (RAM or disk spillover
    /// both failed, or the disk spillover path could not be created).
    #[error("resources exhausted: {0}")]
    ResourcesExhausted(String),

    /// An operation was attempted against a node with open stream handles,
    /// a rename that would create a cycle, or similar state violations.
    #[error("invariant violated: {0}")]
    InvariantViolation(&'static str),

    /// A condition the implementation believes is unreachable was hit.
    /// Preserved as a variant (rather than a bare panic) so callers always
    /// get a `Result`, even for "fatal" internal errors.
    #[error("internal error: {0}")]
    Internal(&'static str),
}

impl Error {
    /// A path escapes the translator's root and outbreak was not enabled.
    pub fn path_out_of_scope() -> Self {
        Self::InvariantViolation("path resolves outside of translator root")
    }
}

/// Some part of the archive format is not supported by this crate.
#[derive(Debug, thiserror::Error)]
pub enum UnsupportedError {
    /// The compression method is not supported at all.
    #[error("compression method not supported: {0}")]
    MethodNotSupported(u16),

    /// `IMG_VERSION_FASTMAN92` archives are not implemented; see DESIGN.md.
    #[error("fastman92 IMG archives are not supported")]
    Fastman92NotSupported,

    /// Archived-in-place truncation is not implemented; callers must extract
    /// to `PRESENT` first.
    #[error("truncating an ARCHIVED entry in place is not supported")]
    ArchivedTruncateNotSupported,

    /// The archive uses the XBOX LZO variant but no [`crate::codec::LzoCodec`]
    /// implementation was supplied.
    #[error("archive uses LZO-compressed entries but no LzoCodec was configured")]
    LzoCodecNotConfigured,

    /// IMG archives are flat; there is no on-disk representation for a
    /// subdirectory.
    #[error("IMG archives do not support subdirectories")]
    FlatArchiveNoDirectories,
}

/// Specific archive format errors, mostly due to invalid or corrupted
/// archives but that could also stem from implementation shortcomings.
#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    /// The end of central directory record was not found in a ZIP file.
    #[error("end of central directory record not found")]
    DirectoryEndSignatureNotFound,

    /// The zip64 end of central directory record could not be parsed even
    /// though a locator pointed at it.
    #[error("zip64 end of central directory record not found")]
    Directory64EndRecordInvalid,

    /// The offset computed for the central directory points outside the
    /// bounds of the archive file.
    #[error("directory offset points outside of file")]
    DirectoryOffsetPointsOutsideFile,

    /// The end of central directory record disagrees with the number of
    /// headers actually present in the central directory.
    #[error("invalid central record: expected to read {expected} files, got {actual}")]
    InvalidCentralRecord {
        /// expected number of files
        expected: u64,
        /// actual number of files
        actual: u64,
    },

    /// A local file header's signature or fixed fields could not be parsed.
    #[error("invalid local file header")]
    InvalidLocalHeader,

    /// A central directory file header's signature or fixed fields could
    /// not be parsed.
    #[error("invalid central directory file header")]
    InvalidCentralHeader,

    /// The uncompressed size didn't match what was recorded.
    #[error("uncompressed size didn't match: expected {expected}, got {actual}")]
    WrongSize {
        /// expected size in bytes
        expected: u64,
        /// actual size in bytes
        actual: u64,
    },

    /// The CRC-32 checksum didn't match.
    #[error("checksum didn't match: expected {expected:x?}, got {actual:x?}")]
    WrongChecksum {
        /// expected checksum
        expected: u32,
        /// actual checksum
        actual: u32,
    },

    /// An IMG v2 header was missing the `VER2` magic.
    #[error("not a recognized IMG archive (missing VER2 magic and not a valid v1 .DIR)")]
    ImgBadMagic,

    /// An IMG directory record claimed a resource extending past the
    /// content file's end.
    #[error("IMG entry {name:?} claims {claimed} blocks, content file only has {available}")]
    ImgEntryOutOfBounds {
        /// on-disk entry name
        name: String,
        /// blocks claimed by the directory record
        claimed: u64,
        /// blocks actually available in the content stream
        available: u64,
    },

    /// The XBOX LZO compressed-stream magic was missing.
    #[error("not an XBOX LZO compressed stream")]
    LzoBadMagic,

    /// An XBOX LZO per-block header had an unexpected `unknown`/size field.
    #[error("invalid XBOX LZO block header")]
    LzoBadBlockHeader,

    /// The XBOX LZO stream's adler32 checksum did not match (only checked
    /// when verification is enabled; disabled by default per spec).
    #[error("XBOX LZO checksum mismatch: expected {expected:x}, got {actual:x}")]
    LzoChecksumMismatch {
        /// checksum recorded in the stream header
        expected: u32,
        /// checksum actually computed while decoding
        actual: u32,
    },
}

impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(e) => e,
            e => std::io::Error::other(e),
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
