#![forbid(unsafe_code)]
//! Crafted ext2 images for tests and benchmarks.
//!
//! [`ImageBuilder`] lays out a single-group volume (superblock, descriptor
//! table, bitmaps, inode table, then data blocks) and encodes it with the
//! same field layouts the decoders read.

use anyhow::{Context, Result, bail, ensure};
use lens_block::MemByteDevice;
use lens_ondisk::{
    EXT2_FEATURE_INCOMPAT_FILETYPE, Ext2FileType, Ext2GroupDesc, Ext2Inode, Ext2Superblock,
};
use lens_types::{
    BlockSize, EXT2_DIR_ENTRY_HEADER_LEN, EXT2_SECTOR_SIZE, EXT2_SUPER_MAGIC,
    EXT2_SUPERBLOCK_OFFSET, EXT2_SUPERBLOCK_SIZE, S_IFDIR, S_IFREG,
};
use std::collections::BTreeMap;
use std::io::Write;
use tempfile::NamedTempFile;

/// Timestamp stamped on every crafted inode (2001-09-09 01:46:40 UTC).
pub const FIXED_TIME: u32 = 1_000_000_000;

/// First inode number not reserved by the format.
const FIRST_INO: u32 = 11;

const UUID: [u8; 16] = [
    0x6c, 0x65, 0x6e, 0x73, 0x2d, 0x65, 0x78, 0x74, 0x32, 0x2d, 0x74, 0x65, 0x73, 0x74, 0x00, 0x01,
];

/// One record to place in a crafted directory block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirRecord {
    pub inode: u32,
    pub name: Vec<u8>,
    pub file_type: Ext2FileType,
    /// Explicit `rec_len`. When `None` the record gets its aligned minimum,
    /// and the last record stretches to the end of the block.
    pub rec_len: Option<u16>,
}

impl DirRecord {
    #[must_use]
    pub fn new(inode: u32, name: &str, file_type: Ext2FileType) -> Self {
        Self {
            inode,
            name: name.as_bytes().to_vec(),
            file_type,
            rec_len: None,
        }
    }

    #[must_use]
    pub fn with_rec_len(mut self, rec_len: u16) -> Self {
        self.rec_len = Some(rec_len);
        self
    }

    fn min_len(&self) -> usize {
        (EXT2_DIR_ENTRY_HEADER_LEN + self.name.len()).next_multiple_of(4)
    }
}

/// Encode `records` into one directory block of `block_size` bytes.
pub fn encode_dir_block(block_size: usize, records: &[DirRecord]) -> Result<Vec<u8>> {
    let mut block = vec![0_u8; block_size];
    let mut cursor = 0_usize;

    for (i, rec) in records.iter().enumerate() {
        let name_len = u8::try_from(rec.name.len()).context("directory name exceeds 255 bytes")?;
        let rec_len = match rec.rec_len {
            Some(explicit) => usize::from(explicit),
            None if i + 1 == records.len() => block_size
                .checked_sub(cursor)
                .context("records overflow the block")?,
            None => rec.min_len(),
        };

        let name_end = cursor + EXT2_DIR_ENTRY_HEADER_LEN + rec.name.len();
        ensure!(
            name_end <= block_size,
            "record {i} does not fit in a {block_size}-byte block"
        );
        let on_disk = if rec_len == 1 << 16 {
            u16::MAX
        } else {
            u16::try_from(rec_len).context("rec_len exceeds 16 bits")?
        };

        block[cursor..cursor + 4].copy_from_slice(&rec.inode.to_le_bytes());
        block[cursor + 4..cursor + 6].copy_from_slice(&on_disk.to_le_bytes());
        block[cursor + 6] = name_len;
        block[cursor + 7] = rec.file_type as u8;
        block[cursor + EXT2_DIR_ENTRY_HEADER_LEN..name_end].copy_from_slice(&rec.name);
        cursor += rec_len;
    }

    Ok(block)
}

fn set_bit(bitmap: &mut [u8], bit: usize) {
    if let Some(byte) = bitmap.get_mut(bit / 8) {
        *byte |= 1 << (bit % 8);
    }
}

/// Builder for a single-group ext2 image.
///
/// Metadata layout, counted from `s_first_data_block`: superblock, group
/// descriptor table, block bitmap, inode bitmap, inode table. Data blocks
/// are handed out sequentially after the inode table.
#[derive(Debug, Clone)]
pub struct ImageBuilder {
    block_size: u32,
    blocks_count: u32,
    inodes_per_group: u32,
    inode_size: u16,
    volume_name: String,
    inodes: BTreeMap<u32, Ext2Inode>,
    blocks: BTreeMap<u32, Vec<u8>>,
    next_free: u32,
    sb_patches: Vec<fn(&mut Ext2Superblock)>,
    errors: Vec<String>,
}

impl ImageBuilder {
    /// 64 blocks, 32 inodes of 128 bytes, nothing allocated.
    #[must_use]
    pub fn new(block_size: u32) -> Self {
        Self::with_geometry(block_size, 32, 128)
    }

    #[must_use]
    pub fn with_geometry(block_size: u32, inodes_per_group: u32, inode_size: u16) -> Self {
        let mut builder = Self {
            block_size,
            blocks_count: 64,
            inodes_per_group,
            inode_size,
            volume_name: "ext2lens".to_owned(),
            inodes: BTreeMap::new(),
            blocks: BTreeMap::new(),
            next_free: 0,
            sb_patches: Vec::new(),
            errors: Vec::new(),
        };
        builder.next_free = builder.inode_table_block() + builder.inode_table_blocks();
        builder
    }

    /// A small populated volume: `/lost+found` and `/hello.txt`.
    #[must_use]
    pub fn standard(block_size: u32) -> Self {
        let mut builder = Self::new(block_size);
        builder
            .directory(
                2,
                &[
                    DirRecord::new(2, ".", Ext2FileType::Dir),
                    DirRecord::new(2, "..", Ext2FileType::Dir),
                    DirRecord::new(11, "lost+found", Ext2FileType::Dir),
                    DirRecord::new(12, "hello.txt", Ext2FileType::RegFile),
                ],
            )
            .directory(
                11,
                &[
                    DirRecord::new(11, ".", Ext2FileType::Dir),
                    DirRecord::new(2, "..", Ext2FileType::Dir),
                ],
            )
            .file(12, 0o644, b"hello, ext2!\n");
        if let Some(root) = builder.inodes.get_mut(&2) {
            root.links_count = 3;
        }
        builder
    }

    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    #[must_use]
    pub fn first_data_block(&self) -> u32 {
        u32::from(self.block_size == 1024)
    }

    #[must_use]
    pub fn group_desc_block(&self) -> u32 {
        self.first_data_block() + 1
    }

    #[must_use]
    pub fn inode_table_block(&self) -> u32 {
        self.first_data_block() + 4
    }

    fn inode_table_blocks(&self) -> u32 {
        (self.inodes_per_group * u32::from(self.inode_size)).div_ceil(self.block_size.max(1))
    }

    pub fn set_blocks_count(&mut self, blocks_count: u32) -> &mut Self {
        self.blocks_count = blocks_count;
        self
    }

    pub fn set_volume_name(&mut self, name: &str) -> &mut Self {
        name.clone_into(&mut self.volume_name);
        self
    }

    /// Adjust the encoded superblock after the defaults are filled in.
    /// The image layout itself is unaffected.
    pub fn map_superblock(&mut self, patch: fn(&mut Ext2Superblock)) -> &mut Self {
        self.sb_patches.push(patch);
        self
    }

    /// Store `bytes` in the next free block and return its number.
    pub fn data_block(&mut self, bytes: Vec<u8>) -> u32 {
        let block = self.next_free;
        self.next_free += 1;
        self.blocks.insert(block, bytes);
        block
    }

    /// Overwrite block `block` with `bytes`.
    pub fn put_block(&mut self, block: u32, bytes: Vec<u8>) -> &mut Self {
        self.blocks.insert(block, bytes);
        self
    }

    pub fn inode(&mut self, ino: u32, inode: Ext2Inode) -> &mut Self {
        self.inodes.insert(ino, inode);
        self
    }

    /// A directory inode occupying one block, with no block pointer set.
    #[must_use]
    pub fn dir_inode(block_size: u32) -> Ext2Inode {
        Ext2Inode {
            mode: S_IFDIR | 0o755,
            size: block_size,
            atime: FIXED_TIME,
            ctime: FIXED_TIME,
            mtime: FIXED_TIME,
            links_count: 2,
            blocks: block_size / EXT2_SECTOR_SIZE,
            ..Ext2Inode::default()
        }
    }

    /// Add directory `ino` whose single data block holds `records`.
    pub fn directory(&mut self, ino: u32, records: &[DirRecord]) -> &mut Self {
        let block_len = usize::try_from(self.block_size).unwrap_or(0);
        match encode_dir_block(block_len, records) {
            Ok(bytes) => {
                let block = self.data_block(bytes);
                let mut inode = Self::dir_inode(self.block_size);
                inode.block[0] = block;
                self.inodes.insert(ino, inode);
            }
            Err(err) => self.errors.push(format!("directory {ino}: {err:#}")),
        }
        self
    }

    /// Add regular file `ino` with permission bits `perm`. Contents up to one
    /// block are stored in a data block.
    pub fn file(&mut self, ino: u32, perm: u16, contents: &[u8]) -> &mut Self {
        let Ok(size) = u32::try_from(contents.len()) else {
            self.errors.push(format!("file {ino}: contents too large"));
            return self;
        };
        let mut inode = Ext2Inode {
            mode: S_IFREG | (perm & 0o7777),
            size,
            atime: FIXED_TIME,
            ctime: FIXED_TIME,
            mtime: FIXED_TIME,
            links_count: 1,
            ..Ext2Inode::default()
        };
        if !contents.is_empty() {
            inode.block[0] = self.data_block(contents.to_vec());
            inode.blocks = self.block_size / EXT2_SECTOR_SIZE;
        }
        self.inodes.insert(ino, inode);
        self
    }

    /// The superblock this builder encodes.
    #[must_use]
    pub fn superblock(&self) -> Ext2Superblock {
        let mut volume_name = [0_u8; 16];
        let name = self.volume_name.as_bytes();
        let n = name.len().min(volume_name.len());
        volume_name[..n].copy_from_slice(&name[..n]);

        let used_inodes = u32::try_from(self.inodes.len())
            .unwrap_or(u32::MAX)
            .max(FIRST_INO - 1);
        let log = (self.block_size.max(1024) / 1024).trailing_zeros();

        let mut sb = Ext2Superblock {
            inodes_count: self.inodes_per_group,
            blocks_count: self.blocks_count,
            r_blocks_count: self.blocks_count / 20,
            free_blocks_count: self.blocks_count.saturating_sub(self.next_free),
            free_inodes_count: self.inodes_per_group.saturating_sub(used_inodes),
            first_data_block: self.first_data_block(),
            log_block_size: log,
            log_frag_size: log,
            blocks_per_group: self.block_size.saturating_mul(8),
            frags_per_group: self.block_size.saturating_mul(8),
            inodes_per_group: self.inodes_per_group,
            mtime: 0,
            wtime: FIXED_TIME,
            mnt_count: 0,
            max_mnt_count: u16::MAX,
            magic: EXT2_SUPER_MAGIC,
            state: 1,
            errors: 1,
            minor_rev_level: 0,
            lastcheck: FIXED_TIME,
            checkinterval: 0,
            creator_os: 0,
            rev_level: 1,
            def_resuid: 0,
            def_resgid: 0,
            first_ino: FIRST_INO,
            inode_size: self.inode_size,
            block_group_nr: 0,
            feature_compat: 0,
            feature_incompat: EXT2_FEATURE_INCOMPAT_FILETYPE,
            feature_ro_compat: 0,
            uuid: UUID,
            volume_name,
            last_mounted: vec![0_u8; 64],
            algo_bitmap: 0,
        };
        for patch in &self.sb_patches {
            patch(&mut sb);
        }
        sb
    }

    /// Descriptor of the only block group.
    #[must_use]
    pub fn group_desc(&self) -> Ext2GroupDesc {
        let fdb = self.first_data_block();
        let used_dirs = self.inodes.values().filter(|inode| inode.is_dir()).count();
        let free_inodes = self
            .inodes_per_group
            .saturating_sub(u32::try_from(self.inodes.len()).unwrap_or(u32::MAX));
        Ext2GroupDesc {
            block_bitmap: fdb + 2,
            inode_bitmap: fdb + 3,
            inode_table: self.inode_table_block(),
            free_blocks_count: u16::try_from(self.blocks_count.saturating_sub(self.next_free))
                .unwrap_or(u16::MAX),
            free_inodes_count: u16::try_from(free_inodes).unwrap_or(u16::MAX),
            used_dirs_count: u16::try_from(used_dirs).unwrap_or(u16::MAX),
        }
    }

    /// Encode the full image.
    pub fn build(&self) -> Result<Vec<u8>> {
        if !self.errors.is_empty() {
            bail!("image builder errors: {}", self.errors.join("; "));
        }
        let block_size = BlockSize::new(self.block_size).context("invalid block size")?;
        let bs = block_size.as_usize();
        ensure!(
            self.next_free <= self.blocks_count,
            "{} blocks cannot hold the {} metadata and data blocks",
            self.blocks_count,
            self.next_free
        );
        let total = bs
            .checked_mul(usize::try_from(self.blocks_count)?)
            .context("image size overflows usize")?;
        let block_at = |block: u32| -> Result<usize> {
            bs.checked_mul(usize::try_from(block)?)
                .context("block offset overflows usize")
        };

        let mut image = vec![0_u8; total];

        self.superblock()
            .write_region(
                &mut image[EXT2_SUPERBLOCK_OFFSET..EXT2_SUPERBLOCK_OFFSET + EXT2_SUPERBLOCK_SIZE],
            )
            .context("encode superblock")?;

        let gd = self.group_desc();
        let gd_off = block_at(self.group_desc_block())?;
        gd.write_to(&mut image[gd_off..gd_off + bs])
            .context("encode group descriptor")?;

        // Block bitmap: bit i covers block first_data_block + i.
        let fdb = self.first_data_block();
        let bb_off = block_at(gd.block_bitmap)?;
        let bitmap = &mut image[bb_off..bb_off + bs];
        for block in (fdb..self.next_free).chain(self.blocks.keys().copied()) {
            if let Some(bit) = block.checked_sub(fdb) {
                set_bit(bitmap, usize::try_from(bit)?);
            }
        }

        // Inode bitmap: reserved inodes plus everything crafted.
        let ib_off = block_at(gd.inode_bitmap)?;
        let bitmap = &mut image[ib_off..ib_off + bs];
        for ino in (1..FIRST_INO).chain(self.inodes.keys().copied()) {
            set_bit(bitmap, usize::try_from(ino.saturating_sub(1))?);
        }

        let table_off = block_at(gd.inode_table)?;
        let isz = usize::from(self.inode_size);
        for (&ino, inode) in &self.inodes {
            ensure!(
                (1..=self.inodes_per_group).contains(&ino),
                "inode {ino} outside the single group of {} inodes",
                self.inodes_per_group
            );
            let off = table_off + usize::try_from(ino - 1)? * isz;
            inode
                .write_to(&mut image[off..off + isz])
                .with_context(|| format!("encode inode {ino}"))?;
        }

        for (&block, bytes) in &self.blocks {
            ensure!(
                block < self.blocks_count,
                "block {block} outside image of {} blocks",
                self.blocks_count
            );
            ensure!(
                bytes.len() <= bs,
                "block {block} payload of {} bytes exceeds block size {bs}",
                bytes.len()
            );
            let off = block_at(block)?;
            image[off..off + bytes.len()].copy_from_slice(bytes);
        }

        Ok(image)
    }

    pub fn build_device(&self) -> Result<MemByteDevice> {
        Ok(MemByteDevice::new(self.build()?))
    }

    /// Write the image to a temporary file that lives as long as the handle.
    pub fn write_tempfile(&self) -> Result<NamedTempFile> {
        let image = self.build()?;
        let mut tmp = NamedTempFile::new().context("create temp image")?;
        tmp.write_all(&image).context("write temp image")?;
        tmp.flush().context("flush temp image")?;
        Ok(tmp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lens_ondisk::parse_dir_block;

    #[test]
    fn encoded_records_tile_the_block() {
        let block = encode_dir_block(
            1024,
            &[
                DirRecord::new(2, ".", Ext2FileType::Dir),
                DirRecord::new(2, "..", Ext2FileType::Dir),
                DirRecord::new(12, "hello.txt", Ext2FileType::RegFile),
            ],
        )
        .expect("encode");

        let entries = parse_dir_block(&block).expect("parse");
        let lens: Vec<u32> = entries.iter().map(|e| e.rec_len).collect();
        assert_eq!(lens, vec![12, 12, 1000]);
        assert_eq!(entries[2].name_str(), "hello.txt");
    }

    #[test]
    fn sixty_four_k_records_use_the_escape_value() {
        let block = encode_dir_block(65536, &[DirRecord::new(2, ".", Ext2FileType::Dir)])
            .expect("encode");
        assert_eq!(&block[4..6], &u16::MAX.to_le_bytes());
        let entries = parse_dir_block(&block).expect("parse");
        assert_eq!(entries[0].rec_len, 65536);
    }

    #[test]
    fn oversized_records_are_rejected() {
        let long = "x".repeat(300);
        assert!(
            encode_dir_block(1024, &[DirRecord::new(2, &long, Ext2FileType::RegFile)]).is_err()
        );
        assert!(
            encode_dir_block(
                16,
                &[
                    DirRecord::new(2, "abcdefgh", Ext2FileType::RegFile),
                    DirRecord::new(3, "abcdefgh", Ext2FileType::RegFile),
                ]
            )
            .is_err()
        );
    }

    #[test]
    fn standard_image_layout() {
        for bs in [1024_u32, 4096] {
            let builder = ImageBuilder::standard(bs);
            let image = builder.build().expect("build");
            assert_eq!(image.len(), 64 * bs as usize);

            let sb = Ext2Superblock::parse_from_image(&image).expect("superblock");
            sb.validate().expect("valid superblock");
            assert_eq!(sb.block_size().unwrap().get(), bs);
            assert_eq!(sb.first_data_block, u32::from(bs == 1024));
            assert_eq!(sb.inodes_per_group, 32);
            assert_eq!(sb.volume_name_str(), "ext2lens");

            let gd_off = builder.group_desc_block() as usize * bs as usize;
            let gd = Ext2GroupDesc::parse_from_bytes(&image[gd_off..]).expect("gd");
            assert_eq!(gd, builder.group_desc());
            assert_eq!(gd.used_dirs_count, 2);

            let root_off = gd.inode_table as usize * bs as usize + 128;
            let root = Ext2Inode::parse_from_bytes(&image[root_off..]).expect("root");
            assert!(root.is_dir());
            assert_eq!(root.links_count, 3);
        }
    }

    #[test]
    fn superblock_patches_apply_after_defaults() {
        let mut builder = ImageBuilder::new(1024);
        builder.map_superblock(|sb| sb.magic = 0);
        assert_eq!(builder.superblock().magic, 0);
        assert_eq!(builder.superblock().blocks_count, 64);
    }

    #[test]
    fn builder_errors_surface_at_build() {
        let mut builder = ImageBuilder::new(1024);
        builder.directory(2, &[DirRecord::new(2, &"y".repeat(256), Ext2FileType::Dir)]);
        assert!(builder.build().is_err());

        let mut builder = ImageBuilder::new(1024);
        builder.inode(33, Ext2Inode::default());
        assert!(builder.build().is_err());

        let mut builder = ImageBuilder::new(1024);
        builder.set_blocks_count(4);
        assert!(builder.build().is_err());

        assert!(ImageBuilder::new(3000).build().is_err());
    }

    #[test]
    fn volume_name_and_raw_blocks_land_in_the_image() {
        let mut builder = ImageBuilder::new(1024);
        builder
            .set_volume_name("scratch")
            .put_block(40, vec![0xAB; 16]);
        let image = builder.build().expect("build");

        let sb = Ext2Superblock::parse_from_image(&image).expect("superblock");
        assert_eq!(sb.volume_name_str(), "scratch");
        assert_eq!(&image[40 * 1024..40 * 1024 + 16], &[0xAB; 16]);
        assert_eq!(image[40 * 1024 + 16], 0);

        let dev = builder.build_device().expect("device");
        assert_eq!(dev.as_slice(), image.as_slice());
    }

    #[test]
    fn tempfile_holds_the_image() {
        let builder = ImageBuilder::standard(2048);
        let tmp = builder.write_tempfile().expect("tempfile");
        let on_disk = std::fs::read(tmp.path()).expect("read back");
        assert_eq!(on_disk, builder.build().unwrap());
    }
}
