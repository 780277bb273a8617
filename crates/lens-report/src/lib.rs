#![forbid(unsafe_code)]
//! Attribute reporting.
//!
//! Turns decoded inodes and superblocks into flat, serializable records with
//! epoch timestamps rendered as calendar strings. [`describe`] and
//! [`describe_superblock`] are pure and total: every 32-bit epoch value
//! renders, and 0 renders as [`NEVER`].

use chrono::{Local, TimeZone, Utc};
use lens_core::{DirEntry, Ext2Volume};
use lens_error::{ErrorClass, Result};
use lens_ondisk::{Ext2FileType, Ext2GroupDesc, Ext2Inode, Ext2Superblock};
use lens_types::{BlockSize, EXT2_N_BLOCKS, InodeNumber};
use serde::Serialize;
use std::fmt;
use tracing::debug;

/// Rendering of a zero timestamp ("not set", e.g. never deleted).
pub const NEVER: &str = "never";

/// `strftime` pattern used for every rendered timestamp.
///
/// chrono renders `%Z` on [`Local`] as a numeric offset (`+02:00`), not a
/// zone abbreviation such as `CET`. On [`Utc`] it renders `UTC`.
pub const TIMESTAMP_FORMAT: &str = "%a %Y-%m-%d %H:%M:%S %Z";

/// An epoch timestamp together with its calendar rendering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Timestamp {
    pub epoch: u32,
    pub rendered: String,
}

impl Timestamp {
    #[must_use]
    pub fn new<Tz>(epoch: u32, tz: &Tz) -> Self
    where
        Tz: TimeZone,
        Tz::Offset: fmt::Display,
    {
        Self {
            epoch,
            rendered: render_timestamp(epoch, tz),
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.rendered)
    }
}

/// Render `epoch` seconds in `tz`. Zero renders as [`NEVER`].
#[must_use]
pub fn render_timestamp<Tz>(epoch: u32, tz: &Tz) -> String
where
    Tz: TimeZone,
    Tz::Offset: fmt::Display,
{
    if epoch == 0 {
        return NEVER.to_owned();
    }
    // A local-time gap cannot swallow a whole second range, but keep the raw
    // value rather than fail if a zone database disagrees.
    tz.timestamp_opt(i64::from(epoch), 0)
        .earliest()
        .map_or_else(
            || format!("@{epoch}"),
            |dt| dt.format(TIMESTAMP_FORMAT).to_string(),
        )
}

// ── Inode ───────────────────────────────────────────────────────────────────

/// Snapshot of one inode's fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InodeReport {
    pub mode: u16,
    /// Mode as six octal digits, e.g. `040755`.
    pub mode_octal: String,
    pub file_type: Ext2FileType,
    pub uid: u32,
    pub gid: u32,
    pub size: u32,
    pub links_count: u16,
    /// Allocated 512-byte sectors (`i_blocks`).
    pub sectors: u32,
    pub flags: u32,
    pub generation: u32,
    pub file_acl: u32,
    pub dir_acl: u32,
    pub faddr: u32,
    pub atime: Timestamp,
    pub ctime: Timestamp,
    pub mtime: Timestamp,
    pub dtime: Timestamp,
    pub block: [u32; EXT2_N_BLOCKS],
}

/// Describe `inode` with timestamps in the local time zone.
#[must_use]
pub fn describe(inode: &Ext2Inode) -> InodeReport {
    describe_in(inode, &Local)
}

/// Describe `inode` with timestamps in `tz`.
#[must_use]
pub fn describe_in<Tz>(inode: &Ext2Inode, tz: &Tz) -> InodeReport
where
    Tz: TimeZone,
    Tz::Offset: fmt::Display,
{
    InodeReport {
        mode: inode.mode,
        mode_octal: format!("{:06o}", inode.mode),
        file_type: Ext2FileType::from_mode(inode.mode),
        uid: inode.uid,
        gid: inode.gid,
        size: inode.size,
        links_count: inode.links_count,
        sectors: inode.blocks,
        flags: inode.flags,
        generation: inode.generation,
        file_acl: inode.file_acl,
        dir_acl: inode.dir_acl,
        faddr: inode.faddr,
        atime: Timestamp::new(inode.atime, tz),
        ctime: Timestamp::new(inode.ctime, tz),
        mtime: Timestamp::new(inode.mtime, tz),
        dtime: Timestamp::new(inode.dtime, tz),
        block: inode.block,
    }
}

// ── Superblock ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SuperblockReport {
    pub inodes_count: u32,
    pub blocks_count: u32,
    pub r_blocks_count: u32,
    pub free_blocks_count: u32,
    pub free_inodes_count: u32,
    pub first_data_block: u32,
    pub log_block_size: u32,
    /// `None` when `s_log_block_size` is out of range.
    pub block_size: Option<u32>,
    pub log_frag_size: u32,
    pub frag_size: Option<u32>,
    pub blocks_per_group: u32,
    pub frags_per_group: u32,
    pub inodes_per_group: u32,
    /// Raw `s_inode_size` as stored on disk.
    pub inode_size: u16,
    /// Inode record stride actually used: 128 on revision 0, otherwise
    /// `s_inode_size`.
    pub effective_inode_size: u16,
    pub groups_count: u32,
    pub magic: String,
    pub rev_level: u32,
    pub minor_rev_level: u16,
    pub state: String,
    pub errors: String,
    pub creator_os: String,
    pub mnt_count: u16,
    pub max_mnt_count: u16,
    pub mtime: Timestamp,
    pub wtime: Timestamp,
    pub lastcheck: Timestamp,
    pub checkinterval: u32,
    pub first_ino: u32,
    pub def_resuid: u16,
    pub def_resgid: u16,
    pub feature_compat: u32,
    pub feature_incompat: u32,
    pub feature_ro_compat: u32,
    pub uuid: String,
    pub volume_name: String,
    pub last_mounted: String,
}

fn state_name(state: u16) -> String {
    match state {
        1 => "clean".to_owned(),
        2 => "errors".to_owned(),
        3 => "clean with errors".to_owned(),
        other => format!("unknown ({other})"),
    }
}

fn errors_policy_name(errors: u16) -> String {
    match errors {
        1 => "continue".to_owned(),
        2 => "remount-ro".to_owned(),
        3 => "panic".to_owned(),
        other => format!("unknown ({other})"),
    }
}

fn creator_os_name(os: u32) -> String {
    match os {
        0 => "Linux".to_owned(),
        1 => "Hurd".to_owned(),
        2 => "Masix".to_owned(),
        3 => "FreeBSD".to_owned(),
        4 => "Lites".to_owned(),
        other => format!("unknown ({other})"),
    }
}

#[must_use]
pub fn describe_superblock(sb: &Ext2Superblock) -> SuperblockReport {
    describe_superblock_in(sb, &Local)
}

#[must_use]
pub fn describe_superblock_in<Tz>(sb: &Ext2Superblock, tz: &Tz) -> SuperblockReport
where
    Tz: TimeZone,
    Tz::Offset: fmt::Display,
{
    SuperblockReport {
        inodes_count: sb.inodes_count,
        blocks_count: sb.blocks_count,
        r_blocks_count: sb.r_blocks_count,
        free_blocks_count: sb.free_blocks_count,
        free_inodes_count: sb.free_inodes_count,
        first_data_block: sb.first_data_block,
        log_block_size: sb.log_block_size,
        block_size: sb.block_size().ok().map(BlockSize::get),
        log_frag_size: sb.log_frag_size,
        frag_size: sb.frag_size(),
        blocks_per_group: sb.blocks_per_group,
        frags_per_group: sb.frags_per_group,
        inodes_per_group: sb.inodes_per_group,
        inode_size: sb.inode_size,
        effective_inode_size: sb.effective_inode_size(),
        groups_count: sb.groups_count(),
        magic: format!("{:#06x}", sb.magic),
        rev_level: sb.rev_level,
        minor_rev_level: sb.minor_rev_level,
        state: state_name(sb.state),
        errors: errors_policy_name(sb.errors),
        creator_os: creator_os_name(sb.creator_os),
        mnt_count: sb.mnt_count,
        max_mnt_count: sb.max_mnt_count,
        mtime: Timestamp::new(sb.mtime, tz),
        wtime: Timestamp::new(sb.wtime, tz),
        lastcheck: Timestamp::new(sb.lastcheck, tz),
        checkinterval: sb.checkinterval,
        first_ino: sb.first_ino,
        def_resuid: sb.def_resuid,
        def_resgid: sb.def_resgid,
        feature_compat: sb.feature_compat,
        feature_incompat: sb.feature_incompat,
        feature_ro_compat: sb.feature_ro_compat,
        uuid: sb.uuid_string(),
        volume_name: sb.volume_name_str(),
        last_mounted: sb.last_mounted_str(),
    }
}

// ── Whole volume ────────────────────────────────────────────────────────────

/// One root directory record and, when it names a live inode, its attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryReport {
    pub inode: u32,
    pub name: String,
    pub file_type: Ext2FileType,
    pub rec_len: u32,
    pub attributes: Option<InodeReport>,
    /// Why `attributes` is missing for a live record (e.g. the inode lives
    /// outside block group 0).
    pub unresolved: Option<String>,
}

/// Everything the command-line report prints: superblock, group 0
/// descriptor, root inode and root directory records with attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeReport {
    pub superblock: SuperblockReport,
    pub group_desc: Ext2GroupDesc,
    pub root: InodeReport,
    pub entries: Vec<EntryReport>,
}

/// Which root directory records a [`VolumeReport`] lists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EntryFilter {
    /// Every record in storage order, unused ones included.
    #[default]
    All,
    /// Only records naming a live inode.
    Live,
}

/// Build the report for `vol` with timestamps in `tz`.
///
/// Children outside block group 0 are listed without attributes; any other
/// error aborts the report.
pub fn report_volume<Tz>(vol: &Ext2Volume, tz: &Tz, filter: EntryFilter) -> Result<VolumeReport>
where
    Tz: TimeZone,
    Tz::Offset: fmt::Display,
{
    let root = vol.root_inode()?;
    let walk = vol.iter_entries(InodeNumber::ROOT, &root)?;
    let records: Vec<DirEntry> = match filter {
        EntryFilter::All => walk.collect::<Result<_>>()?,
        EntryFilter::Live => walk.live().collect::<Result<_>>()?,
    };

    let mut entries = Vec::with_capacity(records.len());
    for record in records {
        let (attributes, unresolved) = match record.inode_number() {
            None => (None, None),
            Some(ino) => match vol.resolve(ino) {
                Ok(inode) => (Some(describe_in(&inode, tz)), None),
                Err(err) if err.class() == ErrorClass::Scope => {
                    debug!(ino = ino.0, %err, "child inode not resolved");
                    (None, Some(err.to_string()))
                }
                Err(err) => return Err(err),
            },
        };
        entries.push(EntryReport {
            inode: record.inode,
            name: record.name_str(),
            file_type: record.file_type,
            rec_len: record.rec_len,
            attributes,
            unresolved,
        });
    }

    Ok(VolumeReport {
        superblock: describe_superblock_in(vol.superblock(), tz),
        group_desc: *vol.group_desc(),
        root: describe_in(&root, tz),
        entries,
    })
}

/// [`report_volume`] in UTC.
pub fn report_volume_utc(vol: &Ext2Volume, filter: EntryFilter) -> Result<VolumeReport> {
    report_volume(vol, &Utc, filter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lens_core::OpenOptions;
    use lens_harness::{DirRecord, FIXED_TIME, ImageBuilder};
    use lens_types::{S_IFDIR, S_IFREG};

    fn sample_inode() -> Ext2Inode {
        Ext2Inode {
            mode: S_IFREG | 0o644,
            uid: 1000,
            gid: 100,
            size: 4096,
            atime: FIXED_TIME,
            ctime: FIXED_TIME + 60,
            mtime: FIXED_TIME + 3600,
            dtime: 0,
            links_count: 1,
            blocks: 8,
            ..Ext2Inode::default()
        }
    }

    fn open(builder: &ImageBuilder) -> Ext2Volume {
        let dev = builder.build_device().expect("build");
        Ext2Volume::from_device(Box::new(dev), &OpenOptions::default()).expect("open")
    }

    #[test]
    fn zero_renders_as_sentinel() {
        assert_eq!(render_timestamp(0, &Utc), NEVER);
        assert_eq!(render_timestamp(0, &Local), NEVER);
        assert_ne!(render_timestamp(1, &Utc), NEVER);
        assert_eq!(render_timestamp(1, &Utc), "Thu 1970-01-01 00:00:01 UTC");
    }

    #[test]
    fn renders_in_requested_zone() {
        assert_eq!(
            render_timestamp(1_000_000_000, &Utc),
            "Sun 2001-09-09 01:46:40 UTC"
        );
        assert_eq!(
            render_timestamp(u32::MAX, &Utc),
            "Sun 2106-02-07 06:28:15 UTC"
        );
        let east = chrono::FixedOffset::east_opt(2 * 3600).unwrap();
        assert_eq!(
            render_timestamp(1_000_000_000, &east),
            "Sun 2001-09-09 03:46:40 +02:00"
        );
    }

    #[test]
    fn every_epoch_renders() {
        for epoch in [0, 1, 86_399, 0x7FFF_FFFF, 0x8000_0000, u32::MAX] {
            let text = render_timestamp(epoch, &Local);
            assert!(!text.is_empty());
        }
    }

    #[test]
    fn describe_copies_raw_fields() {
        let report = describe_in(&sample_inode(), &Utc);
        assert_eq!(report.mode_octal, "100644");
        assert_eq!(report.file_type, Ext2FileType::RegFile);
        assert_eq!(report.uid, 1000);
        assert_eq!(report.gid, 100);
        assert_eq!(report.size, 4096);
        assert_eq!(report.sectors, 8);
        assert_eq!(report.atime.rendered, "Sun 2001-09-09 01:46:40 UTC");
        assert_eq!(report.mtime.epoch, FIXED_TIME + 3600);
        assert_eq!(report.dtime.rendered, NEVER);
    }

    #[test]
    fn describe_is_pure() {
        let inode = sample_inode();
        assert_eq!(describe_in(&inode, &Utc), describe_in(&inode, &Utc));
        assert_eq!(describe(&inode).mode, inode.mode);
    }

    #[test]
    fn superblock_report_names_fields() {
        let sb = ImageBuilder::standard(1024).superblock();
        let report = describe_superblock_in(&sb, &Utc);
        assert_eq!(report.block_size, Some(1024));
        assert_eq!(report.magic, "0xef53");
        assert_eq!(report.state, "clean");
        assert_eq!(report.errors, "continue");
        assert_eq!(report.creator_os, "Linux");
        assert_eq!(report.groups_count, 1);
        assert_eq!(report.mtime.rendered, NEVER);
        assert_eq!(report.volume_name, "ext2lens");
    }

    #[test]
    fn superblock_report_tolerates_bad_block_size() {
        let mut sb = ImageBuilder::new(1024).superblock();
        sb.log_block_size = 40;
        sb.state = 9;
        let report = describe_superblock_in(&sb, &Utc);
        assert_eq!(report.block_size, None);
        assert_eq!(report.state, "unknown (9)");
    }

    #[test]
    fn superblock_report_keeps_raw_inode_size_on_revision_zero() {
        let mut builder = ImageBuilder::new(1024);
        builder.set_volume_name("old-rev");
        let mut sb = builder.superblock();
        sb.rev_level = 0;
        sb.inode_size = 0;
        let report = describe_superblock_in(&sb, &Utc);
        assert_eq!(report.inode_size, 0);
        assert_eq!(report.effective_inode_size, 128);
        assert_eq!(report.volume_name, "old-rev");

        let current = describe_superblock_in(&builder.superblock(), &Utc);
        assert_eq!(current.inode_size, 128);
        assert_eq!(current.effective_inode_size, 128);
    }

    #[test]
    fn volume_report_lists_root_entries_with_attributes() {
        let vol = open(&ImageBuilder::standard(1024));
        let report = report_volume_utc(&vol, EntryFilter::All).expect("report");

        assert_eq!(report.root.mode, S_IFDIR | 0o755);
        let names: Vec<&str> = report.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec![".", "..", "lost+found", "hello.txt"]);

        let hello = &report.entries[3];
        let attrs = hello.attributes.as_ref().expect("attributes");
        assert_eq!(attrs.size, 13);
        assert_eq!(attrs.file_type, Ext2FileType::RegFile);
        assert_eq!(report.group_desc.used_dirs_count, 2);
    }

    #[test]
    fn volume_report_handles_unused_and_out_of_scope_records() {
        let mut builder = ImageBuilder::new(1024);
        builder
            .directory(
                2,
                &[
                    DirRecord::new(2, ".", Ext2FileType::Dir),
                    DirRecord::new(2, "..", Ext2FileType::Dir),
                    DirRecord::new(0, "deleted", Ext2FileType::RegFile),
                    DirRecord::new(40, "far", Ext2FileType::RegFile),
                ],
            )
            .map_superblock(|sb| sb.inodes_count = 64);
        let vol = open(&builder);

        let report = report_volume_utc(&vol, EntryFilter::All).expect("report");
        assert_eq!(report.entries.len(), 4);
        assert!(report.entries[2].attributes.is_none());
        assert!(report.entries[2].unresolved.is_none());
        assert!(report.entries[3].attributes.is_none());
        assert!(
            report.entries[3]
                .unresolved
                .as_deref()
                .is_some_and(|why| why.contains("group 1"))
        );

        let live = report_volume_utc(&vol, EntryFilter::Live).expect("report");
        assert_eq!(live.entries.len(), 3);
    }

    #[test]
    fn report_serializes_to_json() {
        let vol = open(&ImageBuilder::standard(4096));
        let report = report_volume_utc(&vol, EntryFilter::Live).unwrap();
        let json = serde_json::to_value(&report).expect("json");
        assert_eq!(json["superblock"]["block_size"], 4096);
        assert_eq!(json["entries"][2]["name"], "lost+found");
        assert_eq!(json["entries"][2]["file_type"], "Dir");
        assert_eq!(json["root"]["dtime"]["rendered"], NEVER);
    }
}
