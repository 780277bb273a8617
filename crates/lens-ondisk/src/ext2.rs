#![forbid(unsafe_code)]

use lens_types::{
    BlockNumber, BlockSize, EXT2_DIR_ENTRY_HEADER_LEN, EXT2_GOOD_OLD_INODE_SIZE,
    EXT2_GOOD_OLD_REV, EXT2_GROUP_DESC_SIZE, EXT2_N_BLOCKS, EXT2_NDIR_BLOCKS, EXT2_SUPER_MAGIC,
    EXT2_SUPERBLOCK_OFFSET, EXT2_SUPERBLOCK_SIZE, ParseError, S_IFBLK, S_IFCHR, S_IFDIR, S_IFIFO,
    S_IFLNK, S_IFMT, S_IFREG, S_IFSOCK, ensure_slice, read_fixed, read_le_u16, read_le_u32,
    read_u8, trim_nul_padded,
};
use serde::{Deserialize, Serialize};

/// Bytes of the superblock region this crate decodes and re-encodes
/// (`s_inodes_count` through `s_algorithm_usage_bitmap`).
pub const SUPERBLOCK_DECODED_LEN: usize = 0xCC;

/// Directory records carry a file type byte.
pub const EXT2_FEATURE_INCOMPAT_FILETYPE: u32 = 0x0002;

/// Highest revision this decoder understands (`EXT2_DYNAMIC_REV`).
const EXT2_DYNAMIC_REV: u32 = 1;

/// Encoded form of a 64 KiB `rec_len` (it does not fit in 16 bits).
const EXT2_MAX_REC_LEN: u16 = u16::MAX;

const INODE_BLOCK_OFFSET: usize = 0x28;

// ── Little-endian writers ───────────────────────────────────────────────────

fn put(out: &mut [u8], offset: usize, bytes: &[u8]) {
    out[offset..offset + bytes.len()].copy_from_slice(bytes);
}

fn ensure_writable(out: &[u8], needed: usize) -> Result<(), ParseError> {
    if out.len() < needed {
        return Err(ParseError::InsufficientData {
            needed,
            offset: 0,
            actual: out.len(),
        });
    }
    Ok(())
}

// ── Superblock ──────────────────────────────────────────────────────────────

/// The ext2 superblock, decoded field by field from the region at byte 1024.
///
/// Fields keep their raw on-disk widths so that [`Ext2Superblock::encode_region`]
/// reproduces the decoded span exactly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext2Superblock {
    // ── Counts ───────────────────────────────────────────────────────────
    pub inodes_count: u32,
    pub blocks_count: u32,
    pub r_blocks_count: u32,
    pub free_blocks_count: u32,
    pub free_inodes_count: u32,

    // ── Geometry ─────────────────────────────────────────────────────────
    pub first_data_block: u32,
    pub log_block_size: u32,
    pub log_frag_size: u32,
    pub blocks_per_group: u32,
    pub frags_per_group: u32,
    pub inodes_per_group: u32,

    // ── Mount state ──────────────────────────────────────────────────────
    pub mtime: u32,
    pub wtime: u32,
    pub mnt_count: u16,
    pub max_mnt_count: u16,
    pub magic: u16,
    pub state: u16,
    pub errors: u16,
    pub minor_rev_level: u16,
    pub lastcheck: u32,
    pub checkinterval: u32,
    pub creator_os: u32,
    pub rev_level: u32,
    pub def_resuid: u16,
    pub def_resgid: u16,

    // ── Dynamic revision fields ──────────────────────────────────────────
    pub first_ino: u32,
    pub inode_size: u16,
    pub block_group_nr: u16,
    pub feature_compat: u32,
    pub feature_incompat: u32,
    pub feature_ro_compat: u32,
    pub uuid: [u8; 16],
    pub volume_name: [u8; 16],
    /// Always 64 bytes when produced by the parser.
    pub last_mounted: Vec<u8>,
    pub algo_bitmap: u32,
}

impl Ext2Superblock {
    /// Parse a superblock from its region (the bytes starting at volume offset 1024).
    pub fn parse_superblock_region(region: &[u8]) -> Result<Self, ParseError> {
        if region.len() < SUPERBLOCK_DECODED_LEN {
            return Err(ParseError::InsufficientData {
                needed: SUPERBLOCK_DECODED_LEN,
                offset: 0,
                actual: region.len(),
            });
        }

        Ok(Self {
            inodes_count: read_le_u32(region, 0x00)?,
            blocks_count: read_le_u32(region, 0x04)?,
            r_blocks_count: read_le_u32(region, 0x08)?,
            free_blocks_count: read_le_u32(region, 0x0C)?,
            free_inodes_count: read_le_u32(region, 0x10)?,

            first_data_block: read_le_u32(region, 0x14)?,
            log_block_size: read_le_u32(region, 0x18)?,
            log_frag_size: read_le_u32(region, 0x1C)?,
            blocks_per_group: read_le_u32(region, 0x20)?,
            frags_per_group: read_le_u32(region, 0x24)?,
            inodes_per_group: read_le_u32(region, 0x28)?,

            mtime: read_le_u32(region, 0x2C)?,
            wtime: read_le_u32(region, 0x30)?,
            mnt_count: read_le_u16(region, 0x34)?,
            max_mnt_count: read_le_u16(region, 0x36)?,
            magic: read_le_u16(region, 0x38)?,
            state: read_le_u16(region, 0x3A)?,
            errors: read_le_u16(region, 0x3C)?,
            minor_rev_level: read_le_u16(region, 0x3E)?,
            lastcheck: read_le_u32(region, 0x40)?,
            checkinterval: read_le_u32(region, 0x44)?,
            creator_os: read_le_u32(region, 0x48)?,
            rev_level: read_le_u32(region, 0x4C)?,
            def_resuid: read_le_u16(region, 0x50)?,
            def_resgid: read_le_u16(region, 0x52)?,

            first_ino: read_le_u32(region, 0x54)?,
            inode_size: read_le_u16(region, 0x58)?,
            block_group_nr: read_le_u16(region, 0x5A)?,
            feature_compat: read_le_u32(region, 0x5C)?,
            feature_incompat: read_le_u32(region, 0x60)?,
            feature_ro_compat: read_le_u32(region, 0x64)?,
            uuid: read_fixed::<16>(region, 0x68)?,
            volume_name: read_fixed::<16>(region, 0x78)?,
            last_mounted: ensure_slice(region, 0x88, 64)?.to_vec(),
            algo_bitmap: read_le_u32(region, 0xC8)?,
        })
    }

    /// Parse from the buffer holding the first 1024-byte-aligned chunk of the
    /// volume (block 0 when the block size is at least 2048).
    pub fn parse_from_block0(block0: &[u8]) -> Result<Self, ParseError> {
        let region = ensure_slice(block0, EXT2_SUPERBLOCK_OFFSET, SUPERBLOCK_DECODED_LEN)?;
        Self::parse_superblock_region(region)
    }

    /// Parse from a full in-memory image.
    pub fn parse_from_image(image: &[u8]) -> Result<Self, ParseError> {
        Self::parse_from_block0(image)
    }

    /// Write the decoded span into `out` (a superblock region). Bytes past
    /// [`SUPERBLOCK_DECODED_LEN`] are left untouched.
    pub fn write_region(&self, out: &mut [u8]) -> Result<(), ParseError> {
        ensure_writable(out, SUPERBLOCK_DECODED_LEN)?;
        if self.last_mounted.len() != 64 {
            return Err(ParseError::InvalidField {
                field: "s_last_mounted",
                reason: "must be exactly 64 bytes",
            });
        }

        put(out, 0x00, &self.inodes_count.to_le_bytes());
        put(out, 0x04, &self.blocks_count.to_le_bytes());
        put(out, 0x08, &self.r_blocks_count.to_le_bytes());
        put(out, 0x0C, &self.free_blocks_count.to_le_bytes());
        put(out, 0x10, &self.free_inodes_count.to_le_bytes());

        put(out, 0x14, &self.first_data_block.to_le_bytes());
        put(out, 0x18, &self.log_block_size.to_le_bytes());
        put(out, 0x1C, &self.log_frag_size.to_le_bytes());
        put(out, 0x20, &self.blocks_per_group.to_le_bytes());
        put(out, 0x24, &self.frags_per_group.to_le_bytes());
        put(out, 0x28, &self.inodes_per_group.to_le_bytes());

        put(out, 0x2C, &self.mtime.to_le_bytes());
        put(out, 0x30, &self.wtime.to_le_bytes());
        put(out, 0x34, &self.mnt_count.to_le_bytes());
        put(out, 0x36, &self.max_mnt_count.to_le_bytes());
        put(out, 0x38, &self.magic.to_le_bytes());
        put(out, 0x3A, &self.state.to_le_bytes());
        put(out, 0x3C, &self.errors.to_le_bytes());
        put(out, 0x3E, &self.minor_rev_level.to_le_bytes());
        put(out, 0x40, &self.lastcheck.to_le_bytes());
        put(out, 0x44, &self.checkinterval.to_le_bytes());
        put(out, 0x48, &self.creator_os.to_le_bytes());
        put(out, 0x4C, &self.rev_level.to_le_bytes());
        put(out, 0x50, &self.def_resuid.to_le_bytes());
        put(out, 0x52, &self.def_resgid.to_le_bytes());

        put(out, 0x54, &self.first_ino.to_le_bytes());
        put(out, 0x58, &self.inode_size.to_le_bytes());
        put(out, 0x5A, &self.block_group_nr.to_le_bytes());
        put(out, 0x5C, &self.feature_compat.to_le_bytes());
        put(out, 0x60, &self.feature_incompat.to_le_bytes());
        put(out, 0x64, &self.feature_ro_compat.to_le_bytes());
        put(out, 0x68, &self.uuid);
        put(out, 0x78, &self.volume_name);
        put(out, 0x88, &self.last_mounted);
        put(out, 0xC8, &self.algo_bitmap.to_le_bytes());
        Ok(())
    }

    /// Encode into a fresh, zero-filled 1024-byte superblock region.
    pub fn encode_region(&self) -> Result<[u8; EXT2_SUPERBLOCK_SIZE], ParseError> {
        let mut region = [0_u8; EXT2_SUPERBLOCK_SIZE];
        self.write_region(&mut region)?;
        Ok(region)
    }

    /// Block size derived from `s_log_block_size`.
    pub fn block_size(&self) -> Result<BlockSize, ParseError> {
        BlockSize::from_log(self.log_block_size)
    }

    /// Fragment size in bytes (`1024 << s_log_frag_size`), if representable.
    #[must_use]
    pub fn frag_size(&self) -> Option<u32> {
        lens_types::block_size_from_log(self.log_frag_size)
    }

    /// Inode record size actually used on disk.
    ///
    /// Revision 0 filesystems do not store it and always use 128 bytes.
    #[must_use]
    pub fn effective_inode_size(&self) -> u16 {
        if self.rev_level == EXT2_GOOD_OLD_REV {
            EXT2_GOOD_OLD_INODE_SIZE
        } else {
            self.inode_size
        }
    }

    /// Number of block groups described by the geometry (0 when it is degenerate).
    #[must_use]
    pub fn groups_count(&self) -> u32 {
        if self.blocks_per_group == 0 {
            return 0;
        }
        self.blocks_count
            .saturating_sub(self.first_data_block)
            .div_ceil(self.blocks_per_group)
    }

    /// The block holding the group descriptor table: the one right after the
    /// superblock's block.
    #[must_use]
    pub fn group_desc_block(&self) -> BlockNumber {
        BlockNumber(u64::from(self.first_data_block) + 1)
    }

    #[must_use]
    pub fn has_incompat(&self, mask: u32) -> bool {
        (self.feature_incompat & mask) != 0
    }

    #[must_use]
    pub fn volume_name_str(&self) -> String {
        trim_nul_padded(&self.volume_name)
    }

    #[must_use]
    pub fn last_mounted_str(&self) -> String {
        trim_nul_padded(&self.last_mounted)
    }

    /// UUID in the canonical 8-4-4-4-12 hex form.
    #[must_use]
    pub fn uuid_string(&self) -> String {
        let hex: String = self.uuid.iter().map(|b| format!("{b:02x}")).collect();
        format!(
            "{}-{}-{}-{}-{}",
            &hex[0..8],
            &hex[8..12],
            &hex[12..16],
            &hex[16..20],
            &hex[20..32]
        )
    }

    /// Check the magic signature and the geometry invariants.
    pub fn validate(&self) -> Result<(), ParseError> {
        if self.magic != EXT2_SUPER_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(EXT2_SUPER_MAGIC),
                actual: u64::from(self.magic),
            });
        }
        if self.rev_level > EXT2_DYNAMIC_REV {
            return Err(ParseError::InvalidField {
                field: "s_rev_level",
                reason: "unknown revision",
            });
        }
        self.validate_geometry()
    }

    /// Validate geometry fields (sizes, bounds, consistency).
    pub fn validate_geometry(&self) -> Result<(), ParseError> {
        let block_size = self.block_size()?.get();

        // ── blocks ──────────────────────────────────────────────────────
        if self.blocks_per_group == 0 {
            return Err(ParseError::InvalidField {
                field: "s_blocks_per_group",
                reason: "cannot be zero",
            });
        }
        if self.first_data_block >= self.blocks_count {
            return Err(ParseError::InvalidField {
                field: "s_first_data_block",
                reason: "must be below s_blocks_count",
            });
        }
        // The superblock shares block 1 with nothing only for 1 KiB blocks.
        let expected_first = u32::from(block_size == 1024);
        if self.first_data_block != expected_first {
            return Err(ParseError::InvalidField {
                field: "s_first_data_block",
                reason: "must be 1 for 1 KiB blocks and 0 otherwise",
            });
        }

        // ── inodes_per_group ────────────────────────────────────────────
        if self.inodes_per_group == 0 {
            return Err(ParseError::InvalidField {
                field: "s_inodes_per_group",
                reason: "cannot be zero",
            });
        }
        if self.inodes_per_group > block_size.saturating_mul(8) {
            return Err(ParseError::InvalidField {
                field: "s_inodes_per_group",
                reason: "exceeds block_size * 8 (inode bitmap capacity)",
            });
        }

        // ── inode_size ──────────────────────────────────────────────────
        let inode_size = self.effective_inode_size();
        if inode_size < EXT2_GOOD_OLD_INODE_SIZE {
            return Err(ParseError::InvalidField {
                field: "s_inode_size",
                reason: "must be >= 128",
            });
        }
        if u32::from(inode_size) > block_size {
            return Err(ParseError::InvalidField {
                field: "s_inode_size",
                reason: "inode_size exceeds block_size",
            });
        }
        Ok(())
    }
}

// ── Block group descriptor ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext2GroupDesc {
    pub block_bitmap: u32,
    pub inode_bitmap: u32,
    pub inode_table: u32,
    pub free_blocks_count: u16,
    pub free_inodes_count: u16,
    pub used_dirs_count: u16,
}

impl Ext2GroupDesc {
    /// Parse the descriptor at the start of `bytes` (the descriptor table block).
    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        if bytes.len() < EXT2_GROUP_DESC_SIZE {
            return Err(ParseError::InsufficientData {
                needed: EXT2_GROUP_DESC_SIZE,
                offset: 0,
                actual: bytes.len(),
            });
        }

        Ok(Self {
            block_bitmap: read_le_u32(bytes, 0x00)?,
            inode_bitmap: read_le_u32(bytes, 0x04)?,
            inode_table: read_le_u32(bytes, 0x08)?,
            free_blocks_count: read_le_u16(bytes, 0x0C)?,
            free_inodes_count: read_le_u16(bytes, 0x0E)?,
            used_dirs_count: read_le_u16(bytes, 0x10)?,
        })
    }

    /// Write this descriptor into the first 32 bytes of `out`.
    pub fn write_to(&self, out: &mut [u8]) -> Result<(), ParseError> {
        ensure_writable(out, EXT2_GROUP_DESC_SIZE)?;
        put(out, 0x00, &self.block_bitmap.to_le_bytes());
        put(out, 0x04, &self.inode_bitmap.to_le_bytes());
        put(out, 0x08, &self.inode_table.to_le_bytes());
        put(out, 0x0C, &self.free_blocks_count.to_le_bytes());
        put(out, 0x0E, &self.free_inodes_count.to_le_bytes());
        put(out, 0x10, &self.used_dirs_count.to_le_bytes());
        Ok(())
    }
}

// ── Inode ───────────────────────────────────────────────────────────────────

/// An ext2 inode record (the 128-byte base layout, Linux `osd2`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext2Inode {
    pub mode: u16,
    /// Owner id (low 16 bits plus the Linux high half).
    pub uid: u32,
    pub size: u32,

    // ── Timestamps (seconds since the epoch) ─────────────────────────────
    pub atime: u32,
    pub ctime: u32,
    pub mtime: u32,
    pub dtime: u32,

    pub gid: u32,
    pub links_count: u16,
    /// Allocated space in 512-byte sectors, not filesystem blocks.
    pub blocks: u32,
    pub flags: u32,
    pub osd1: u32,
    pub block: [u32; EXT2_N_BLOCKS],
    pub generation: u32,
    pub file_acl: u32,
    pub dir_acl: u32,
    pub faddr: u32,
}

impl Ext2Inode {
    /// Parse an inode from the first 128 bytes of `bytes`.
    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        let base = usize::from(EXT2_GOOD_OLD_INODE_SIZE);
        if bytes.len() < base {
            return Err(ParseError::InsufficientData {
                needed: base,
                offset: 0,
                actual: bytes.len(),
            });
        }

        let mut block = [0_u32; EXT2_N_BLOCKS];
        for (i, slot) in block.iter_mut().enumerate() {
            *slot = read_le_u32(bytes, INODE_BLOCK_OFFSET + i * 4)?;
        }

        let uid_lo = u32::from(read_le_u16(bytes, 0x02)?);
        let gid_lo = u32::from(read_le_u16(bytes, 0x18)?);
        let uid_hi = u32::from(read_le_u16(bytes, 0x78)?);
        let gid_hi = u32::from(read_le_u16(bytes, 0x7A)?);

        Ok(Self {
            mode: read_le_u16(bytes, 0x00)?,
            uid: uid_lo | (uid_hi << 16),
            size: read_le_u32(bytes, 0x04)?,
            atime: read_le_u32(bytes, 0x08)?,
            ctime: read_le_u32(bytes, 0x0C)?,
            mtime: read_le_u32(bytes, 0x10)?,
            dtime: read_le_u32(bytes, 0x14)?,
            gid: gid_lo | (gid_hi << 16),
            links_count: read_le_u16(bytes, 0x1A)?,
            blocks: read_le_u32(bytes, 0x1C)?,
            flags: read_le_u32(bytes, 0x20)?,
            osd1: read_le_u32(bytes, 0x24)?,
            block,
            generation: read_le_u32(bytes, 0x64)?,
            file_acl: read_le_u32(bytes, 0x68)?,
            dir_acl: read_le_u32(bytes, 0x6C)?,
            faddr: read_le_u32(bytes, 0x70)?,
        })
    }

    /// Write the 128-byte base record into `out`.
    pub fn write_to(&self, out: &mut [u8]) -> Result<(), ParseError> {
        ensure_writable(out, usize::from(EXT2_GOOD_OLD_INODE_SIZE))?;
        let [uid_lo0, uid_lo1, uid_hi0, uid_hi1] = self.uid.to_le_bytes();
        let [gid_lo0, gid_lo1, gid_hi0, gid_hi1] = self.gid.to_le_bytes();

        put(out, 0x00, &self.mode.to_le_bytes());
        put(out, 0x02, &[uid_lo0, uid_lo1]);
        put(out, 0x04, &self.size.to_le_bytes());
        put(out, 0x08, &self.atime.to_le_bytes());
        put(out, 0x0C, &self.ctime.to_le_bytes());
        put(out, 0x10, &self.mtime.to_le_bytes());
        put(out, 0x14, &self.dtime.to_le_bytes());
        put(out, 0x18, &[gid_lo0, gid_lo1]);
        put(out, 0x1A, &self.links_count.to_le_bytes());
        put(out, 0x1C, &self.blocks.to_le_bytes());
        put(out, 0x20, &self.flags.to_le_bytes());
        put(out, 0x24, &self.osd1.to_le_bytes());
        for (i, ptr) in self.block.iter().enumerate() {
            put(out, INODE_BLOCK_OFFSET + i * 4, &ptr.to_le_bytes());
        }
        put(out, 0x64, &self.generation.to_le_bytes());
        put(out, 0x68, &self.file_acl.to_le_bytes());
        put(out, 0x6C, &self.dir_acl.to_le_bytes());
        put(out, 0x70, &self.faddr.to_le_bytes());
        put(out, 0x78, &[uid_hi0, uid_hi1]);
        put(out, 0x7A, &[gid_hi0, gid_hi1]);
        Ok(())
    }

    // ── File type detection (raw mode bits only) ────────────────────────

    /// Extract the file type bits from the mode field.
    #[must_use]
    pub fn file_type_mode(&self) -> u16 {
        self.mode & S_IFMT
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.file_type_mode() == S_IFDIR
    }

    #[must_use]
    pub fn is_regular(&self) -> bool {
        self.file_type_mode() == S_IFREG
    }

    #[must_use]
    pub fn is_symlink(&self) -> bool {
        self.file_type_mode() == S_IFLNK
    }

    /// Permission bits (lower 12 bits of mode).
    #[must_use]
    pub fn permission_bits(&self) -> u16 {
        self.mode & 0o7777
    }

    /// Whether `i_dtime` records a deletion.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.dtime != 0
    }

    // ── Block pointers ──────────────────────────────────────────────────

    /// The 12 direct block pointer slots.
    #[must_use]
    pub fn direct_blocks(&self) -> &[u32] {
        &self.block[..EXT2_NDIR_BLOCKS]
    }

    /// Data block count derived from `i_blocks`: sectors divided by
    /// `2 << s_log_block_size`.
    #[must_use]
    pub fn data_block_count(&self, block_size: BlockSize) -> u32 {
        self.blocks / block_size.sectors_per_block()
    }
}

// ── Directory entry parsing ─────────────────────────────────────────────────

/// File type tag stored in a directory record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Ext2FileType {
    Unknown = 0,
    RegFile = 1,
    Dir = 2,
    Chrdev = 3,
    Blkdev = 4,
    Fifo = 5,
    Sock = 6,
    Symlink = 7,
}

impl Ext2FileType {
    #[must_use]
    pub fn from_raw(val: u8) -> Self {
        match val {
            1 => Self::RegFile,
            2 => Self::Dir,
            3 => Self::Chrdev,
            4 => Self::Blkdev,
            5 => Self::Fifo,
            6 => Self::Sock,
            7 => Self::Symlink,
            _ => Self::Unknown,
        }
    }

    /// The type implied by an inode's mode bits.
    #[must_use]
    pub fn from_mode(mode: u16) -> Self {
        match mode & S_IFMT {
            S_IFREG => Self::RegFile,
            S_IFDIR => Self::Dir,
            S_IFCHR => Self::Chrdev,
            S_IFBLK => Self::Blkdev,
            S_IFIFO => Self::Fifo,
            S_IFSOCK => Self::Sock,
            S_IFLNK => Self::Symlink,
            _ => Self::Unknown,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::RegFile => "file",
            Self::Dir => "dir",
            Self::Chrdev => "chrdev",
            Self::Blkdev => "blkdev",
            Self::Fifo => "fifo",
            Self::Sock => "sock",
            Self::Symlink => "symlink",
        }
    }
}

/// A parsed, owned ext2 directory record (`ext2_dir_entry_2`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext2DirEntry {
    /// Target inode; 0 marks an unused (deleted or padding) record.
    pub inode: u32,
    pub rec_len: u32,
    pub name_len: u8,
    pub file_type: Ext2FileType,
    pub name: Vec<u8>,
}

impl Ext2DirEntry {
    /// Return the name as a UTF-8 string (lossy).
    #[must_use]
    pub fn name_str(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }

    /// Whether this record names a live inode.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.inode != 0
    }

    #[must_use]
    pub fn is_dot(&self) -> bool {
        self.name == b"."
    }

    #[must_use]
    pub fn is_dotdot(&self) -> bool {
        self.name == b".."
    }
}

/// A borrowed directory record (zero-copy reference into the block buffer).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ext2DirEntryRef<'a> {
    pub inode: u32,
    pub rec_len: u32,
    pub name_len: u8,
    pub file_type: Ext2FileType,
    pub name: &'a [u8],
    /// Byte offset of this record within its block.
    pub offset: usize,
}

impl Ext2DirEntryRef<'_> {
    /// Convert to an owned [`Ext2DirEntry`] (allocates name bytes).
    #[must_use]
    pub fn to_entry(&self) -> Ext2DirEntry {
        Ext2DirEntry {
            inode: self.inode,
            rec_len: self.rec_len,
            name_len: self.name_len,
            file_type: self.file_type,
            name: self.name.to_vec(),
        }
    }

    #[must_use]
    pub fn name_str(&self) -> String {
        String::from_utf8_lossy(self.name).into_owned()
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.inode != 0
    }
}

/// Decode `rec_len` from its on-disk representation.
///
/// A 64 KiB record cannot be stored in 16 bits and is written as `0xFFFF`.
fn rec_len_from_disk(raw: u16, block_len: usize) -> usize {
    if raw == EXT2_MAX_REC_LEN && block_len >= 1 << 16 {
        1 << 16
    } else {
        usize::from(raw)
    }
}

fn read_dirent_header(block: &[u8], at: usize) -> Result<(u32, u16, u8, u8), ParseError> {
    Ok((
        read_le_u32(block, at)?,
        read_le_u16(block, at + 4)?,
        read_u8(block, at + 6)?,
        read_u8(block, at + 7)?,
    ))
}

/// Iterator over every record of one directory block, in storage order.
///
/// Unused records (`inode == 0`) are yielded too, so the walk stays aligned
/// and callers can see them. Iteration ends when the cursor lands exactly on
/// the block end. A record that cannot advance the cursor within the block
/// yields one error and ends the iteration; [`offset`](Self::offset) then
/// points at the offending record.
#[derive(Debug, Clone)]
pub struct DirBlockIter<'a> {
    block: &'a [u8],
    offset: usize,
    done: bool,
}

impl<'a> DirBlockIter<'a> {
    #[must_use]
    pub fn new(block: &'a [u8]) -> Self {
        Self {
            block,
            offset: 0,
            done: false,
        }
    }

    /// Current cursor position within the block.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    fn fail(
        &mut self,
        field: &'static str,
        reason: &'static str,
    ) -> Option<<Self as Iterator>::Item> {
        self.done = true;
        Some(Err(ParseError::InvalidField { field, reason }))
    }
}

impl<'a> Iterator for DirBlockIter<'a> {
    type Item = Result<Ext2DirEntryRef<'a>, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.offset >= self.block.len() {
            return None;
        }

        let start = self.offset;
        if start + EXT2_DIR_ENTRY_HEADER_LEN > self.block.len() {
            return self.fail("de_rec_len", "record header crosses block boundary");
        }

        let (inode, rec_len_raw, name_len, file_type_raw) =
            match read_dirent_header(self.block, start) {
                Ok(header) => header,
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            };

        let rec_len = rec_len_from_disk(rec_len_raw, self.block.len());
        if rec_len == 0 {
            return self.fail("de_rec_len", "rec_len is zero");
        }
        if rec_len < EXT2_DIR_ENTRY_HEADER_LEN {
            return self.fail("de_rec_len", "rec_len < 8");
        }
        let entry_end = match start.checked_add(rec_len) {
            Some(end) if end <= self.block.len() => end,
            _ => return self.fail("de_rec_len", "directory entry extends past block boundary"),
        };
        let name_end = start + EXT2_DIR_ENTRY_HEADER_LEN + usize::from(name_len);
        if name_end > entry_end {
            return self.fail("de_name_len", "name extends past rec_len");
        }

        self.offset = entry_end;
        Some(Ok(Ext2DirEntryRef {
            inode,
            rec_len: u32::try_from(rec_len).unwrap_or(u32::MAX),
            name_len,
            file_type: Ext2FileType::from_raw(file_type_raw),
            name: &self.block[start + EXT2_DIR_ENTRY_HEADER_LEN..name_end],
            offset: start,
        }))
    }
}

/// Create an iterator over the records of a directory block.
#[must_use]
pub fn iter_dir_block(block: &[u8]) -> DirBlockIter<'_> {
    DirBlockIter::new(block)
}

/// Parse every record of a directory block, unused ones included.
pub fn parse_dir_block(block: &[u8]) -> Result<Vec<Ext2DirEntry>, ParseError> {
    iter_dir_block(block)
        .map(|entry| entry.map(|e| e.to_entry()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Helper: a minimal, valid 1 KiB-block superblock region.
    fn make_valid_sb() -> [u8; EXT2_SUPERBLOCK_SIZE] {
        let mut sb = [0_u8; EXT2_SUPERBLOCK_SIZE];
        sb[0x00..0x04].copy_from_slice(&8_u32.to_le_bytes()); // inodes_count
        sb[0x04..0x08].copy_from_slice(&64_u32.to_le_bytes()); // blocks_count
        sb[0x14..0x18].copy_from_slice(&1_u32.to_le_bytes()); // first_data_block
        sb[0x18..0x1C].copy_from_slice(&0_u32.to_le_bytes()); // log_block_size -> 1K
        sb[0x20..0x24].copy_from_slice(&8192_u32.to_le_bytes()); // blocks_per_group
        sb[0x24..0x28].copy_from_slice(&8192_u32.to_le_bytes()); // frags_per_group
        sb[0x28..0x2C].copy_from_slice(&8_u32.to_le_bytes()); // inodes_per_group
        sb[0x38..0x3A].copy_from_slice(&EXT2_SUPER_MAGIC.to_le_bytes());
        sb[0x4C..0x50].copy_from_slice(&1_u32.to_le_bytes()); // rev_level
        sb[0x54..0x58].copy_from_slice(&11_u32.to_le_bytes()); // first_ino
        sb[0x58..0x5A].copy_from_slice(&128_u16.to_le_bytes()); // inode_size
        sb
    }

    fn put_dirent(block: &mut [u8], off: usize, ino: u32, rec_len: u16, ft: u8, name: &[u8]) {
        block[off..off + 4].copy_from_slice(&ino.to_le_bytes());
        block[off + 4..off + 6].copy_from_slice(&rec_len.to_le_bytes());
        block[off + 6] = u8::try_from(name.len()).unwrap();
        block[off + 7] = ft;
        block[off + 8..off + 8 + name.len()].copy_from_slice(name);
    }

    #[test]
    fn parse_superblock_region_smoke() {
        let sb = make_valid_sb();
        let parsed = Ext2Superblock::parse_superblock_region(&sb).expect("superblock parse");
        assert_eq!(parsed.inodes_count, 8);
        assert_eq!(parsed.blocks_count, 64);
        assert_eq!(parsed.block_size().unwrap().get(), 1024);
        assert_eq!(parsed.inodes_per_group, 8);
        assert_eq!(parsed.inode_size, 128);
        assert_eq!(parsed.groups_count(), 1);
        assert_eq!(parsed.group_desc_block(), BlockNumber(2));
        parsed.validate().expect("valid");
    }

    #[test]
    fn superblock_round_trips_decoded_span() {
        // Every byte of the decoded span non-trivial, the rest zero.
        let mut region = [0_u8; EXT2_SUPERBLOCK_SIZE];
        for (i, byte) in region[..SUPERBLOCK_DECODED_LEN].iter_mut().enumerate() {
            *byte = u8::try_from((i * 7 + 3) % 256).unwrap();
        }

        let parsed = Ext2Superblock::parse_superblock_region(&region).expect("parse");
        let encoded = parsed.encode_region().expect("encode");
        assert_eq!(encoded, region);
    }

    #[test]
    fn superblock_write_region_preserves_tail() {
        let mut region = make_valid_sb();
        region[0x200] = 0x5A;
        let parsed = Ext2Superblock::parse_superblock_region(&region).unwrap();
        let mut out = region;
        out[..SUPERBLOCK_DECODED_LEN].fill(0);
        parsed.write_region(&mut out).unwrap();
        assert_eq!(out, region);
    }

    #[test]
    fn superblock_from_block0_reads_at_1024() {
        let mut block0 = vec![0_u8; 4096];
        block0[1024..2048].copy_from_slice(&make_valid_sb());
        let parsed = Ext2Superblock::parse_from_block0(&block0).expect("parse");
        assert_eq!(parsed.magic, EXT2_SUPER_MAGIC);

        let err = Ext2Superblock::parse_from_block0(&block0[..1100]).unwrap_err();
        assert!(matches!(err, ParseError::InsufficientData { .. }));
    }

    #[test]
    fn superblock_rejects_short_region() {
        let err = Ext2Superblock::parse_superblock_region(&[0_u8; 100]).unwrap_err();
        assert_eq!(
            err,
            ParseError::InsufficientData {
                needed: SUPERBLOCK_DECODED_LEN,
                offset: 0,
                actual: 100,
            }
        );
    }

    #[test]
    fn validate_reports_bad_magic_as_recoverable_error() {
        let mut sb = make_valid_sb();
        sb[0x38..0x3A].copy_from_slice(&0x1234_u16.to_le_bytes());
        let parsed = Ext2Superblock::parse_superblock_region(&sb).expect("still decodes");
        assert_eq!(
            parsed.validate(),
            Err(ParseError::InvalidMagic {
                expected: 0xEF53,
                actual: 0x1234,
            })
        );
    }

    #[test]
    fn validate_geometry_catches_bad_values() {
        let sb = make_valid_sb();

        let mut bad = sb;
        bad[0x28..0x2C].copy_from_slice(&0_u32.to_le_bytes());
        let p = Ext2Superblock::parse_superblock_region(&bad).unwrap();
        assert!(matches!(
            p.validate_geometry(),
            Err(ParseError::InvalidField {
                field: "s_inodes_per_group",
                ..
            })
        ));

        let mut bad = sb;
        bad[0x58..0x5A].copy_from_slice(&0_u16.to_le_bytes());
        let p = Ext2Superblock::parse_superblock_region(&bad).unwrap();
        assert!(matches!(
            p.validate_geometry(),
            Err(ParseError::InvalidField {
                field: "s_inode_size",
                ..
            })
        ));

        let mut bad = sb;
        bad[0x18..0x1C].copy_from_slice(&9_u32.to_le_bytes());
        let p = Ext2Superblock::parse_superblock_region(&bad).unwrap();
        assert!(p.validate_geometry().is_err());

        let mut bad = sb;
        bad[0x14..0x18].copy_from_slice(&0_u32.to_le_bytes());
        let p = Ext2Superblock::parse_superblock_region(&bad).unwrap();
        assert!(matches!(
            p.validate_geometry(),
            Err(ParseError::InvalidField {
                field: "s_first_data_block",
                ..
            })
        ));
    }

    #[test]
    fn revision_zero_uses_fixed_inode_size() {
        let mut sb = make_valid_sb();
        sb[0x4C..0x50].copy_from_slice(&0_u32.to_le_bytes());
        sb[0x58..0x5A].copy_from_slice(&0_u16.to_le_bytes());
        let p = Ext2Superblock::parse_superblock_region(&sb).unwrap();
        assert_eq!(p.inode_size, 0);
        assert_eq!(p.effective_inode_size(), 128);
        p.validate().expect("rev 0 image is valid");
    }

    #[test]
    fn identity_strings() {
        let mut sb = make_valid_sb();
        sb[0x68..0x78].copy_from_slice(&[
            0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc, 0xde, 0xf0, 0x01, 0x23, 0x45, 0x67, 0x89, 0xab,
            0xcd, 0xef,
        ]);
        sb[0x78..0x7D].copy_from_slice(b"lens0");
        sb[0x88..0x8B].copy_from_slice(b"/mn");
        let p = Ext2Superblock::parse_superblock_region(&sb).unwrap();
        assert_eq!(p.uuid_string(), "12345678-9abc-def0-0123-456789abcdef");
        assert_eq!(p.volume_name_str(), "lens0");
        assert_eq!(p.last_mounted_str(), "/mn");
    }

    #[test]
    fn groups_count_rounds_up() {
        let mut p = Ext2Superblock::parse_superblock_region(&make_valid_sb()).unwrap();
        p.blocks_count = 8193 + 1;
        assert_eq!(p.groups_count(), 2);
        p.blocks_per_group = 0;
        assert_eq!(p.groups_count(), 0);
    }

    #[test]
    fn group_desc_parse_and_write() {
        let mut bytes = [0_u8; 32];
        bytes[0x00..0x04].copy_from_slice(&3_u32.to_le_bytes());
        bytes[0x04..0x08].copy_from_slice(&4_u32.to_le_bytes());
        bytes[0x08..0x0C].copy_from_slice(&5_u32.to_le_bytes());
        bytes[0x0C..0x0E].copy_from_slice(&40_u16.to_le_bytes());
        bytes[0x0E..0x10].copy_from_slice(&6_u16.to_le_bytes());
        bytes[0x10..0x12].copy_from_slice(&1_u16.to_le_bytes());

        let gd = Ext2GroupDesc::parse_from_bytes(&bytes).expect("gd");
        assert_eq!(gd.block_bitmap, 3);
        assert_eq!(gd.inode_bitmap, 4);
        assert_eq!(gd.inode_table, 5);
        assert_eq!(gd.free_blocks_count, 40);
        assert_eq!(gd.used_dirs_count, 1);

        let mut out = [0_u8; 32];
        gd.write_to(&mut out).unwrap();
        assert_eq!(out, bytes);

        assert!(Ext2GroupDesc::parse_from_bytes(&bytes[..12]).is_err());
    }

    #[test]
    fn inode_parse_fields() {
        let mut raw = [0_u8; 128];
        raw[0x00..0x02].copy_from_slice(&(S_IFDIR | 0o755).to_le_bytes());
        raw[0x02..0x04].copy_from_slice(&1000_u16.to_le_bytes());
        raw[0x04..0x08].copy_from_slice(&1024_u32.to_le_bytes());
        raw[0x08..0x0C].copy_from_slice(&1_700_000_000_u32.to_le_bytes());
        raw[0x1A..0x1C].copy_from_slice(&3_u16.to_le_bytes());
        raw[0x1C..0x20].copy_from_slice(&2_u32.to_le_bytes());
        raw[0x28..0x2C].copy_from_slice(&21_u32.to_le_bytes());
        raw[0x78..0x7A].copy_from_slice(&1_u16.to_le_bytes()); // uid high

        let inode = Ext2Inode::parse_from_bytes(&raw).expect("inode");
        assert!(inode.is_dir());
        assert!(!inode.is_regular());
        assert_eq!(inode.permission_bits(), 0o755);
        assert_eq!(inode.uid, 1000 | (1 << 16));
        assert_eq!(inode.size, 1024);
        assert_eq!(inode.atime, 1_700_000_000);
        assert_eq!(inode.links_count, 3);
        assert_eq!(inode.direct_blocks()[0], 21);
        assert_eq!(inode.data_block_count(BlockSize::new(1024).unwrap()), 1);
        assert!(!inode.is_deleted());

        let mut out = [0_u8; 128];
        inode.write_to(&mut out).unwrap();
        assert_eq!(out, raw);
    }

    #[test]
    fn inode_rejects_short_record() {
        assert!(matches!(
            Ext2Inode::parse_from_bytes(&[0_u8; 127]),
            Err(ParseError::InsufficientData { needed: 128, .. })
        ));
    }

    #[test]
    fn data_block_count_uses_sector_units() {
        let raw = [0_u8; 128];
        let mut inode = Ext2Inode::parse_from_bytes(&raw).unwrap();
        inode.blocks = 24;
        assert_eq!(inode.data_block_count(BlockSize::new(4096).unwrap()), 3);
        assert_eq!(inode.data_block_count(BlockSize::new(1024).unwrap()), 12);
    }

    #[test]
    fn dir_block_dot_dotdot_then_padding() {
        let mut block = vec![0_u8; 1024];
        put_dirent(&mut block, 0, 2, 12, 2, b".");
        put_dirent(&mut block, 12, 2, 12, 2, b"..");
        put_dirent(&mut block, 24, 0, 1000, 0, b"");

        let entries = parse_dir_block(&block).expect("parse");
        assert_eq!(entries.len(), 3);
        assert!(entries[0].is_dot());
        assert_eq!(entries[0].file_type, Ext2FileType::Dir);
        assert!(entries[1].is_dotdot());
        assert!(!entries[2].is_live());

        let total: u32 = entries.iter().map(|e| e.rec_len).sum();
        assert_eq!(total, 1024);
    }

    #[test]
    fn dir_block_keeps_deleted_entries_in_order() {
        let mut block = vec![0_u8; 1024];
        put_dirent(&mut block, 0, 2, 12, 2, b".");
        put_dirent(&mut block, 12, 0, 20, 1, b"gone.txt");
        put_dirent(&mut block, 32, 12, 992, 1, b"kept");

        let names: Vec<(u32, String)> = iter_dir_block(&block)
            .map(|e| e.map(|e| (e.inode, e.name_str())))
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(
            names,
            vec![
                (2, ".".to_owned()),
                (0, "gone.txt".to_owned()),
                (12, "kept".to_owned()),
            ]
        );
    }

    #[test]
    fn dir_block_rejects_zero_rec_len() {
        let mut block = vec![0_u8; 1024];
        put_dirent(&mut block, 0, 2, 12, 2, b".");
        put_dirent(&mut block, 12, 2, 0, 2, b"..");

        let mut iter = iter_dir_block(&block);
        assert!(iter.next().unwrap().is_ok());
        let err = iter.next().unwrap().unwrap_err();
        assert_eq!(
            err,
            ParseError::InvalidField {
                field: "de_rec_len",
                reason: "rec_len is zero",
            }
        );
        assert_eq!(iter.offset(), 12);
        assert!(iter.next().is_none(), "iteration must stop after corruption");
    }

    #[test]
    fn dir_block_rejects_overrun_and_short_records() {
        let mut block = vec![0_u8; 1024];
        put_dirent(&mut block, 0, 2, 2000, 2, b".");
        assert!(parse_dir_block(&block).is_err());

        let mut block = vec![0_u8; 1024];
        put_dirent(&mut block, 0, 2, 4, 2, b"");
        assert!(matches!(
            parse_dir_block(&block),
            Err(ParseError::InvalidField {
                reason: "rec_len < 8",
                ..
            })
        ));

        let mut block = vec![0_u8; 1024];
        put_dirent(&mut block, 0, 11, 12, 1, b"longname");
        assert!(matches!(
            parse_dir_block(&block),
            Err(ParseError::InvalidField {
                field: "de_name_len",
                ..
            })
        ));

        // Tiles to 1020, leaving a 4-byte sliver that cannot hold a header.
        let mut block = vec![0_u8; 1024];
        put_dirent(&mut block, 0, 2, 1020, 2, b".");
        assert!(matches!(
            parse_dir_block(&block),
            Err(ParseError::InvalidField {
                reason: "record header crosses block boundary",
                ..
            })
        ));
    }

    #[test]
    fn file_type_mapping() {
        assert_eq!(Ext2FileType::from_raw(2), Ext2FileType::Dir);
        assert_eq!(Ext2FileType::from_raw(9), Ext2FileType::Unknown);
        assert_eq!(Ext2FileType::from_mode(S_IFLNK | 0o777), Ext2FileType::Symlink);
        assert_eq!(Ext2FileType::from_mode(S_IFREG), Ext2FileType::RegFile);
        assert_eq!(Ext2FileType::Dir.as_str(), "dir");
    }

    #[test]
    fn inode_mode_helpers() {
        let link = Ext2Inode {
            mode: S_IFLNK | 0o777,
            ..Ext2Inode::default()
        };
        assert!(link.is_symlink());
        assert!(!link.is_dir());
        assert!(!link.is_regular());
        assert_eq!(link.permission_bits(), 0o777);

        let file = Ext2Inode {
            mode: S_IFREG | 0o4755,
            ..Ext2Inode::default()
        };
        assert!(file.is_regular());
        assert!(!file.is_symlink());
        assert_eq!(file.permission_bits(), 0o4755);
    }

    #[test]
    fn incompat_feature_mask() {
        let mut sb = Ext2Superblock::parse_superblock_region(&make_valid_sb()).expect("parse");
        sb.feature_incompat = EXT2_FEATURE_INCOMPAT_FILETYPE;
        assert!(sb.has_incompat(EXT2_FEATURE_INCOMPAT_FILETYPE));
        assert!(!sb.has_incompat(0x0004));
        sb.feature_incompat = 0;
        assert!(!sb.has_incompat(EXT2_FEATURE_INCOMPAT_FILETYPE));
    }

    #[test]
    fn large_block_rec_len_encoding() {
        assert_eq!(rec_len_from_disk(0xFFFF, 65536), 65536);
        assert_eq!(rec_len_from_disk(0xFFFF, 4096), 0xFFFF);
        assert_eq!(rec_len_from_disk(12, 1024), 12);
    }
}
