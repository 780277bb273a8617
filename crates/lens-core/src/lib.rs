#![forbid(unsafe_code)]
//! Opened ext2 volume: geometry context, inode resolution and directory walks.
//!
//! [`Ext2Volume`] bundles the parsed superblock, the first group descriptor,
//! the derived [`Ext2Geometry`] and the block device into one immutable
//! context. Every decoding call takes it by reference; nothing is mutated
//! after open.
//!
//! Only block group 0 is consulted. Inodes that live in any other group are
//! rejected with [`LensError::OutOfScope`] instead of being mis-resolved.

use lens_block::{
    BlockBuf, BlockDevice, ByteBlockDevice, ByteDevice, FileByteDevice, read_superblock_region,
};
use lens_error::{LensError, Result};
use lens_ondisk::{
    DirBlockIter, EXT2_FEATURE_INCOMPAT_FILETYPE, Ext2FileType, Ext2GroupDesc, Ext2Inode,
    Ext2Superblock,
};
use lens_types::{
    BlockNumber, BlockSize, EXT2_NDIR_BLOCKS, GroupNumber, InodeNumber, ParseError, ensure_slice,
    inode_index_in_group, inode_to_group,
};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::Path;
use tracing::{debug, trace, warn};

/// Options controlling how a volume is opened.
///
/// Validation is on by default. Turn it off only to inspect images whose
/// superblock is known to be damaged.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenOptions {
    /// Skip the magic, revision and geometry checks.
    ///
    /// Checks needed to avoid dividing by zero still run.
    pub skip_validation: bool,
}

fn parse_error_to_lens(e: &ParseError) -> LensError {
    match e {
        ParseError::InvalidField { field, reason } => {
            if field.contains("block_size") {
                LensError::UnsupportedBlockSize(format!("{field}: {reason}"))
            } else if field.contains("blocks_per_group")
                || field.contains("inodes_per_group")
                || field.contains("inode_size")
                || field.contains("first_data_block")
                || field.contains("blocks_count")
                || field.contains("inodes_count")
            {
                LensError::InvalidGeometry(format!("{field}: {reason}"))
            } else {
                LensError::Format(e.to_string())
            }
        }
        ParseError::InvalidMagic { .. } => LensError::Format(e.to_string()),
        ParseError::InsufficientData { .. } | ParseError::IntegerConversion { .. } => {
            LensError::Parse(e.to_string())
        }
    }
}

fn corruption(block: BlockNumber, detail: impl Into<String>) -> LensError {
    LensError::Corruption {
        block: block.0,
        detail: detail.into(),
    }
}

// ── Geometry ────────────────────────────────────────────────────────────────

/// Geometry constants derived once from the superblock and the first group
/// descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext2Geometry {
    pub block_size: BlockSize,
    /// Declared volume size in blocks (`s_blocks_count`).
    pub blocks_count: u32,
    pub inodes_count: u32,
    pub inodes_per_group: u32,
    /// Inode record stride in bytes.
    pub inode_size: u16,
    pub inodes_per_block: u32,
    /// First block of group 0's inode table.
    pub inode_table: u32,
}

impl Ext2Geometry {
    pub fn new(sb: &Ext2Superblock, gd: &Ext2GroupDesc) -> Result<Self> {
        let block_size = sb.block_size().map_err(|e| parse_error_to_lens(&e))?;
        Self::from_raw(
            block_size,
            sb.effective_inode_size(),
            sb.inodes_per_group,
            sb.inodes_count,
            sb.blocks_count,
            gd.inode_table,
        )
    }

    /// Build from individual values. Rejects values that would make inode
    /// arithmetic divide by zero.
    pub fn from_raw(
        block_size: BlockSize,
        inode_size: u16,
        inodes_per_group: u32,
        inodes_count: u32,
        blocks_count: u32,
        inode_table: u32,
    ) -> Result<Self> {
        if inodes_per_group == 0 {
            return Err(LensError::InvalidGeometry(
                "s_inodes_per_group: cannot be zero".to_owned(),
            ));
        }
        if inode_size == 0 {
            return Err(LensError::InvalidGeometry(
                "s_inode_size: cannot be zero".to_owned(),
            ));
        }
        let inodes_per_block = block_size.get() / u32::from(inode_size);
        if inodes_per_block == 0 {
            return Err(LensError::InvalidGeometry(format!(
                "s_inode_size: {inode_size} exceeds block size {block_size}"
            )));
        }

        Ok(Self {
            block_size,
            blocks_count,
            inodes_count,
            inodes_per_group,
            inode_size,
            inodes_per_block,
            inode_table,
        })
    }

    /// Number of blocks the group 0 inode table occupies.
    #[must_use]
    pub fn inode_table_blocks(&self) -> u32 {
        self.inodes_per_group.div_ceil(self.inodes_per_block)
    }
}

/// Where an inode record lives on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeLocation {
    pub ino: InodeNumber,
    pub group: GroupNumber,
    /// Index within the group's inode table.
    pub index: u32,
    /// Inode table block holding the record.
    pub block: BlockNumber,
    /// Byte offset of the record within `block`.
    pub offset: usize,
}

/// Compute the on-disk position of inode `ino`.
///
/// `index = (ino - 1) % inodes_per_group`, then the record sits in block
/// `inode_table + index / inodes_per_block` at byte
/// `(index % inodes_per_block) * inode_size`.
pub fn locate_inode(geom: &Ext2Geometry, ino: InodeNumber) -> Result<InodeLocation> {
    if ino.0 == 0 || ino.0 > geom.inodes_count {
        return Err(LensError::InvalidInode(ino.0));
    }

    let group = inode_to_group(ino, geom.inodes_per_group);
    if group.0 != 0 {
        return Err(LensError::OutOfScope(format!(
            "inode {ino} lives in block group {group}; only group 0 is read"
        )));
    }

    let index = inode_index_in_group(ino, geom.inodes_per_group);
    let block = BlockNumber::from(geom.inode_table)
        .checked_add(u64::from(index / geom.inodes_per_block))
        .ok_or_else(|| LensError::InvalidGeometry("inode table block overflows".to_owned()))?;
    let offset = usize::try_from((index % geom.inodes_per_block) * u32::from(geom.inode_size))
        .map_err(|_| LensError::InvalidGeometry("inode offset overflows usize".to_owned()))?;

    Ok(InodeLocation {
        ino,
        group,
        index,
        block,
        offset,
    })
}

// ── Volume ──────────────────────────────────────────────────────────────────

/// An opened ext2 image.
///
/// ```ignore
/// let vol = Ext2Volume::open("/path/to/disk.img")?;
/// let root = vol.root_inode()?;
/// for entry in vol.iter_entries(InodeNumber::ROOT, &root)? {
///     println!("{}", entry?.name_str());
/// }
/// ```
pub struct Ext2Volume {
    superblock: Ext2Superblock,
    group_desc: Ext2GroupDesc,
    geometry: Ext2Geometry,
    dev: ByteBlockDevice<Box<dyn ByteDevice>>,
}

impl std::fmt::Debug for Ext2Volume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ext2Volume")
            .field("geometry", &self.geometry)
            .field("group_desc", &self.group_desc)
            .field("dev_len", &self.device_len())
            .finish_non_exhaustive()
    }
}

impl Ext2Volume {
    /// Open the image at `path` with default options (validation enabled).
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_options(path, &OpenOptions::default())
    }

    pub fn open_with_options(path: impl AsRef<Path>, options: &OpenOptions) -> Result<Self> {
        let dev = FileByteDevice::open(path.as_ref())?;
        Self::from_device(Box::new(dev), options)
    }

    /// Open a volume from an already-opened device.
    pub fn from_device(dev: Box<dyn ByteDevice>, options: &OpenOptions) -> Result<Self> {
        let region = read_superblock_region(&*dev)?;
        let superblock =
            Ext2Superblock::parse_superblock_region(&region).map_err(|e| parse_error_to_lens(&e))?;
        if !options.skip_validation {
            superblock.validate().map_err(|e| parse_error_to_lens(&e))?;
        }

        let block_size = superblock.block_size().map_err(|e| parse_error_to_lens(&e))?;
        let dev = ByteBlockDevice::new(dev, block_size);

        let gd_block = superblock.group_desc_block();
        let buf = dev.read_block(gd_block)?;
        let group_desc = Ext2GroupDesc::parse_from_bytes(buf.as_slice())
            .map_err(|e| corruption(gd_block, format!("group descriptor 0: {e}")))?;

        let geometry = Ext2Geometry::new(&superblock, &group_desc)?;
        if !options.skip_validation {
            validate_inode_table(&geometry)?;
        }

        debug!(
            block_size = block_size.get(),
            blocks_count = superblock.blocks_count,
            inodes_count = superblock.inodes_count,
            inodes_per_group = geometry.inodes_per_group,
            inode_size = geometry.inode_size,
            inode_table = geometry.inode_table,
            rev_level = superblock.rev_level,
            "opened ext2 volume"
        );

        Ok(Self {
            superblock,
            group_desc,
            geometry,
            dev,
        })
    }

    #[must_use]
    pub fn superblock(&self) -> &Ext2Superblock {
        &self.superblock
    }

    /// Descriptor of block group 0.
    #[must_use]
    pub fn group_desc(&self) -> &Ext2GroupDesc {
        &self.group_desc
    }

    #[must_use]
    pub fn geometry(&self) -> &Ext2Geometry {
        &self.geometry
    }

    #[must_use]
    pub fn block_size(&self) -> BlockSize {
        self.geometry.block_size
    }

    /// Device length in bytes.
    #[must_use]
    pub fn device_len(&self) -> u64 {
        self.dev.inner().len_bytes()
    }

    /// Read block `block` from the device. Blocks the backing file cannot
    /// supply in full fail with a short-read I/O error.
    pub fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        self.dev.read_block(block)
    }

    /// Read a block the metadata points at, rejecting pointers at or past
    /// `s_blocks_count` as corruption.
    fn read_metadata_block(
        &self,
        block: BlockNumber,
        what: impl FnOnce() -> String,
    ) -> Result<BlockBuf> {
        if block.0 >= u64::from(self.geometry.blocks_count) {
            return Err(corruption(
                block,
                format!(
                    "{}: block beyond s_blocks_count {}",
                    what(),
                    self.geometry.blocks_count
                ),
            ));
        }
        self.read_block(block)
    }

    /// Read inode `ino`. Inodes are not cached; every call reads the table block.
    pub fn resolve(&self, ino: InodeNumber) -> Result<Ext2Inode> {
        let loc = locate_inode(&self.geometry, ino)?;
        let buf = self.read_metadata_block(loc.block, || format!("inode {ino} table block"))?;

        let inode_size = usize::from(self.geometry.inode_size);
        let inode = ensure_slice(buf.as_slice(), loc.offset, inode_size)
            .and_then(Ext2Inode::parse_from_bytes)
            .map_err(|e| {
                corruption(loc.block, format!("inode {ino} at byte {}: {e}", loc.offset))
            })?;

        trace!(
            ino = ino.0,
            block = loc.block.0,
            offset = loc.offset,
            mode = inode.mode,
            "resolved inode"
        );
        Ok(inode)
    }

    /// The root directory inode (inode 2).
    pub fn root_inode(&self) -> Result<Ext2Inode> {
        self.resolve(InodeNumber::ROOT)
    }

    /// Data blocks of a directory, in slot order.
    ///
    /// The count comes from `i_blocks` converted to filesystem blocks and is
    /// capped at the 12 direct slots. Empty slots are skipped.
    fn dir_blocks(&self, ino: InodeNumber, inode: &Ext2Inode) -> Vec<BlockNumber> {
        let count = usize::try_from(inode.data_block_count(self.geometry.block_size))
            .unwrap_or(usize::MAX);
        if count > EXT2_NDIR_BLOCKS {
            warn!(
                ino = ino.0,
                data_blocks = count,
                "directory extends past the direct block slots; walking the first 12 only"
            );
        }

        let usable = count.min(EXT2_NDIR_BLOCKS);
        inode.direct_blocks()[..usable]
            .iter()
            .filter(|&&ptr| ptr != 0)
            .map(|&ptr| BlockNumber::from(ptr))
            .collect()
    }

    /// Walk the records of directory `ino` (whose inode is `inode`) lazily,
    /// in storage order. Calling again restarts from the first block.
    pub fn iter_entries(&self, ino: InodeNumber, inode: &Ext2Inode) -> Result<DirEntries<'_>> {
        if !inode.is_dir() {
            return Err(LensError::NotDirectory(ino.0));
        }
        let blocks = self.dir_blocks(ino, inode);
        debug!(ino = ino.0, blocks = blocks.len(), "walking directory");
        Ok(DirEntries {
            volume: self,
            dir: ino,
            blocks: blocks.into_iter(),
            pending: VecDeque::new(),
            done: false,
        })
    }

    /// Resolve `ino` and collect every record of the directory.
    pub fn read_dir(&self, ino: InodeNumber) -> Result<Vec<DirEntry>> {
        let inode = self.resolve(ino)?;
        self.iter_entries(ino, &inode)?.collect()
    }
}

fn validate_inode_table(geom: &Ext2Geometry) -> Result<()> {
    let end = u64::from(geom.inode_table) + u64::from(geom.inode_table_blocks());
    if geom.inode_table == 0 || end > u64::from(geom.blocks_count) {
        return Err(LensError::InvalidGeometry(format!(
            "bg_inode_table: blocks {}..{end} outside volume of {} blocks",
            geom.inode_table, geom.blocks_count
        )));
    }
    Ok(())
}

// ── Directory walk ──────────────────────────────────────────────────────────

/// One directory record with its position on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    /// Target inode; 0 for an unused record.
    pub inode: u32,
    pub name: Vec<u8>,
    pub file_type: Ext2FileType,
    pub rec_len: u32,
    pub block: BlockNumber,
    pub offset: usize,
}

impl DirEntry {
    #[must_use]
    pub fn name_str(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.inode != 0
    }

    /// The named inode, or `None` for an unused record.
    #[must_use]
    pub fn inode_number(&self) -> Option<InodeNumber> {
        self.is_live().then_some(InodeNumber(self.inode))
    }
}

/// Lazy walk over a directory's records. Blocks are read one at a time as the
/// iterator advances.
///
/// Unused (`inode == 0`) records are yielded; use [`DirEntries::live`] to drop
/// them. After a corrupt record is reported the iterator is exhausted.
pub struct DirEntries<'a> {
    volume: &'a Ext2Volume,
    dir: InodeNumber,
    blocks: std::vec::IntoIter<BlockNumber>,
    pending: VecDeque<Result<DirEntry>>,
    done: bool,
}

impl std::fmt::Debug for DirEntries<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirEntries")
            .field("dir", &self.dir)
            .field("remaining_blocks", &self.blocks.len())
            .field("pending", &self.pending.len())
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl<'a> DirEntries<'a> {
    /// Directory being walked.
    #[must_use]
    pub fn directory(&self) -> InodeNumber {
        self.dir
    }

    /// Only records that name a live inode.
    pub fn live(self) -> impl Iterator<Item = Result<DirEntry>> + 'a {
        self.filter(|item| !matches!(item, Ok(entry) if !entry.is_live()))
    }

    fn load_block(&mut self, block: BlockNumber) -> Result<()> {
        let dir = self.dir;
        let buf = self
            .volume
            .read_metadata_block(block, || format!("directory inode {dir} data block"))?;

        // Without the filetype feature the type byte is the high half of a
        // 16-bit name length, not a file type.
        let typed = self
            .volume
            .superblock
            .has_incompat(EXT2_FEATURE_INCOMPAT_FILETYPE);
        let mut records = DirBlockIter::new(buf.as_slice());
        loop {
            match records.next() {
                None => break,
                Some(Ok(rec)) => {
                    trace!(
                        dir = dir.0,
                        block = block.0,
                        offset = rec.offset,
                        inode = rec.inode,
                        rec_len = rec.rec_len,
                        "directory record"
                    );
                    self.pending.push_back(Ok(DirEntry {
                        inode: rec.inode,
                        name: rec.name.to_vec(),
                        file_type: if typed {
                            rec.file_type
                        } else {
                            Ext2FileType::Unknown
                        },
                        rec_len: rec.rec_len,
                        block,
                        offset: rec.offset,
                    }));
                }
                Some(Err(err)) => {
                    let at = records.offset();
                    self.pending.push_back(Err(corruption(
                        block,
                        format!("directory inode {dir}: {err} at byte {at}"),
                    )));
                    break;
                }
            }
        }
        Ok(())
    }
}

impl Iterator for DirEntries<'_> {
    type Item = Result<DirEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.pending.pop_front() {
                if item.is_err() {
                    self.done = true;
                    self.pending.clear();
                }
                return Some(item);
            }
            if self.done {
                return None;
            }
            let block = self.blocks.next()?;
            if let Err(err) = self.load_block(block) {
                self.done = true;
                return Some(Err(err));
            }
        }
    }
}
