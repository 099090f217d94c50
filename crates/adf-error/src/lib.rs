#![forbid(unsafe_code)]
//! Error types for the adf workspace.
//!
//! [`AdfError`] is the single user-facing error type returned by the
//! node tree, the volume layer and the public API. Parse-level errors
//! from `adf-types` (`NameError`, `ProtectParseError`, `GeometryError`)
//! convert into it at their crate boundaries; this crate depends on no
//! other workspace crate so nothing can cycle back into it.
//!
//! Policy: the node tree and volume layers fail fast: any detected
//! structural violation aborts the operation with the offending block
//! number (and name, where one exists) carried as structured fields.
//! Nothing is repaired silently; exhaustive reporting over corrupted
//! volumes is the validator's job, and the validator records findings
//! instead of returning these errors.

use thiserror::Error;

/// Unified error type for all adf operations.
#[derive(Debug, Error)]
pub enum AdfError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The boot area does not carry a usable `DOS` tag.
    #[error("invalid boot block at {block}: {detail}")]
    InvalidBootBlock { block: u32, detail: String },

    /// The root block fails its type, sub-type or checksum contract.
    #[error("invalid root block at {block}: {detail}")]
    InvalidRootBlock { block: u32, detail: String },

    /// A user directory block fails its structural contract.
    #[error("invalid user directory block at {block}: {detail}")]
    InvalidUserDirBlock { block: u32, detail: String },

    /// A file header block fails its structural contract.
    #[error("invalid file header block at {block}: {detail}")]
    InvalidFileHeaderBlock { block: u32, detail: String },

    /// A file list (extension) block fails its structural contract.
    #[error("invalid file list block at {block}: {detail}")]
    InvalidFileListBlock { block: u32, detail: String },

    /// An OFS file data block fails its structural contract.
    #[error("invalid file data block at {block}: {detail}")]
    InvalidFileDataBlock { block: u32, detail: String },

    /// A bitmap or bitmap extension block fails its contract.
    #[error("invalid bitmap block at {block}: {detail}")]
    InvalidBitmapBlock { block: u32, detail: String },

    /// The bitmap chain holds a different number of blocks than the
    /// device geometry requires.
    #[error("bitmap block count mismatch: expected {expected}, found {actual}")]
    BitmapBlockCountMismatch { expected: u32, actual: u32 },

    /// The concatenated bitmap covers the wrong number of blocks.
    #[error("bitmap size mismatch: expected {expected_bits} bits, found {actual_bits}")]
    BitmapSizeMismatch { expected_bits: u32, actual_bits: u32 },

    /// Allocation failed: fewer free blocks than requested.
    #[error("no free blocks: requested {requested}, {available} available")]
    NoFreeBlocks { requested: u32, available: u32 },

    /// A directory chain references a block kind this implementation
    /// does not support (soft/hard links).
    #[error("unsupported entry block at {block} (sec_type {sec_type})")]
    UnsupportedDirBlock { block: u32, sec_type: i32 },

    /// An entry name fails validation; never silently truncated.
    #[error("invalid file name {name:?}: {reason}")]
    InvalidFileName { name: String, reason: String },

    /// A volume name fails validation.
    #[error("invalid volume name {name:?}: {reason}")]
    InvalidVolumeName { name: String, reason: String },

    /// A case-insensitive match already exists in the target bucket.
    #[error("name already exists: {name:?}")]
    NameAlreadyExists { name: String },

    /// An OFS data block carries the wrong sequence number.
    #[error("invalid sequence number in data block {block}: expected {expected}, got {actual}")]
    InvalidSeqNum {
        block: u32,
        expected: u32,
        actual: u32,
    },

    /// A file's extension chain holds a different number of list blocks
    /// than its byte size requires.
    #[error("file at {block}: expected {expected} list blocks, found {actual}")]
    FileListBlockCountMismatch {
        block: u32,
        expected: u32,
        actual: u32,
    },

    /// A file references a different number of data blocks than its
    /// byte size requires.
    #[error("file at {block}: expected {expected} data blocks, found {actual}")]
    FileDataBlockCountMismatch {
        block: u32,
        expected: u32,
        actual: u32,
    },

    /// Deleting the entry is not permitted (non-empty directory without
    /// `recursive`, or a delete-protected entry).
    #[error("delete not allowed for {name:?}: {reason}")]
    DeleteNotAllowed { name: String, reason: String },

    /// A protection string could not be parsed.
    #[error("invalid protect format: {value:?}")]
    InvalidProtectFormat { value: String },

    /// A path component that should be a directory is not one, or an
    /// entry's parent pointer is inconsistent.
    #[error("invalid parent directory at {block}: {detail}")]
    InvalidParentDirectory { block: u32, detail: String },

    /// Path resolution failed.
    #[error("not found: {path:?}")]
    FileNotFound { path: String },

    /// A block number is outside the device.
    #[error("block {block} out of range (device has {num_blocks} blocks)")]
    BlockOutOfRange { block: u32, num_blocks: u32 },

    /// A write buffer does not match the device block size.
    #[error("write size mismatch: expected {expected} bytes, got {actual}")]
    WriteSizeMismatch { expected: usize, actual: usize },

    /// A write was attempted on a read-only device.
    #[error("device is read-only")]
    ReadOnlyDevice,

    /// An internal invariant was violated; indicates a bug, not bad
    /// input.
    #[error("internal error: {detail}")]
    InternalError { detail: String },
}

/// Result alias using [`AdfError`].
pub type Result<T> = std::result::Result<T, AdfError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_structured_context() {
        let err = AdfError::InvalidRootBlock {
            block: 880,
            detail: "checksum mismatch".into(),
        };
        assert_eq!(
            err.to_string(),
            "invalid root block at 880: checksum mismatch"
        );

        let err = AdfError::NoFreeBlocks {
            requested: 9,
            available: 3,
        };
        assert_eq!(err.to_string(), "no free blocks: requested 9, 3 available");

        let err = AdfError::InvalidSeqNum {
            block: 900,
            expected: 3,
            actual: 7,
        };
        assert!(err.to_string().contains("expected 3, got 7"));

        let err = AdfError::UnsupportedDirBlock {
            block: 42,
            sec_type: -4,
        };
        assert!(err.to_string().contains("sec_type -4"));
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::other("disk fell out");
        let err: AdfError = io.into();
        assert!(matches!(err, AdfError::Io(_)));
    }
}
