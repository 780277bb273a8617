#![forbid(unsafe_code)]
//! On-disk format parsing for ext2 structures.
//!
//! Pure parsing crate: no I/O, no side effects. Decodes byte slices into
//! typed Rust structures for the ext2 superblock, block group descriptors,
//! inode records, and directory records, field by field in little-endian
//! order. Buffers shorter than the decoded span are rejected.

pub mod ext2;

pub use ext2::{
    DirBlockIter, EXT2_FEATURE_INCOMPAT_FILETYPE, Ext2DirEntry, Ext2DirEntryRef, Ext2FileType,
    Ext2GroupDesc, Ext2Inode, Ext2Superblock, SUPERBLOCK_DECODED_LEN, iter_dir_block,
    parse_dir_block,
};
