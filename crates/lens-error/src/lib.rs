#![forbid(unsafe_code)]
//! Error types for ext2lens.
//!
//! # Error Taxonomy
//!
//! ext2lens uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `lens-types` | On-disk format violations detected during byte parsing |
//! | Runtime | `LensError` | `lens-error` (this crate) | User-facing errors for the CLI and library consumers |
//!
//! `lens-error` does not depend on `lens-types`. The conversion from
//! `ParseError` to `LensError` lives in `lens-core`, which knows the block,
//! inode and byte offset being decoded and attaches them to the message.
//!
//! ## Classes
//!
//! Every variant belongs to exactly one [`ErrorClass`]:
//!
//! | Variant | Class |
//! |---------|-------|
//! | `Io` | `Io` |
//! | `Corruption` | `Corruption` |
//! | `Format`, `Parse`, `InvalidGeometry`, `UnsupportedBlockSize` | `Format` |
//! | `OutOfScope` | `Scope` |
//! | `InvalidInode`, `NotDirectory` | `Usage` |
//!
//! None of them is retried anywhere. An `Io` failure aborts the run; a
//! `Corruption` failure aborts the current traversal.

use thiserror::Error;

/// Unified error type for all ext2lens operations.
#[derive(Debug, Error)]
pub enum LensError {
    /// Operating system I/O error, including short reads of a truncated volume.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Structurally invalid metadata at a known block.
    ///
    /// `detail` names the inode and byte offset when they are known.
    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    /// The image is not an ext2 volume this tool can read (bad magic, bad revision).
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// Parse-layer error with no better context available.
    #[error("parse error: {0}")]
    Parse(String),

    /// Superblock geometry violates a format invariant.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// The block size decodes but is outside the supported range.
    #[error("unsupported block size: {0}")]
    UnsupportedBlockSize(String),

    /// The request needs more than the first block group's metadata.
    #[error("outside supported scope: {0}")]
    OutOfScope(String),

    /// Inode number 0 or beyond `s_inodes_count`.
    #[error("invalid inode number {0}")]
    InvalidInode(u32),

    /// A directory walk was requested on a non-directory inode.
    #[error("inode {0} is not a directory")]
    NotDirectory(u32),
}

/// Coarse classification of a [`LensError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Io,
    Corruption,
    Format,
    Scope,
    Usage,
}

impl LensError {
    /// The class this error belongs to. Exhaustive on purpose.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Io(_) => ErrorClass::Io,
            Self::Corruption { .. } => ErrorClass::Corruption,
            Self::Format(_)
            | Self::Parse(_)
            | Self::InvalidGeometry(_)
            | Self::UnsupportedBlockSize(_) => ErrorClass::Format,
            Self::OutOfScope(_) => ErrorClass::Scope,
            Self::InvalidInode(_) | Self::NotDirectory(_) => ErrorClass::Usage,
        }
    }

    /// Whether the underlying cause is a short read (truncated image).
    #[must_use]
    pub fn is_short_read(&self) -> bool {
        matches!(self, Self::Io(err) if err.kind() == std::io::ErrorKind::UnexpectedEof)
    }
}

/// Result alias using `LensError`.
pub type Result<T> = std::result::Result<T, LensError>;
