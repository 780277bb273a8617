#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use chrono::{Local, Utc};
use clap::{Parser, ValueEnum};
use lens_core::{Ext2Volume, OpenOptions};
use lens_report::{EntryFilter, InodeReport, VolumeReport, report_volume};
use lens_types::EXT2_NDIR_BLOCKS;
use std::env::VarError;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use tracing::{debug, info_span};
use tracing_subscriber::EnvFilter;

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Human,
    Json,
}

impl LogFormat {
    const ENV_KEY: &'static str = "EXT2LENS_LOG_FORMAT";

    fn parse(raw: &str) -> Result<Self> {
        <Self as ValueEnum>::from_str(raw.trim(), true).map_err(|_| {
            anyhow::anyhow!(
                "invalid {key}={raw:?}; expected one of: human, json",
                key = Self::ENV_KEY
            )
        })
    }

    fn from_env() -> Result<Option<Self>> {
        match std::env::var(Self::ENV_KEY) {
            Ok(value) => Ok(Some(Self::parse(&value)?)),
            Err(VarError::NotPresent) => Ok(None),
            Err(VarError::NotUnicode(_)) => {
                bail!("{key} contains non-UTF-8 bytes", key = Self::ENV_KEY)
            }
        }
    }
}

fn default_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
}

/// Install the global subscriber. Logs go to stderr so stdout carries only
/// the report.
fn init_logging(log_format_override: Option<LogFormat>) -> Result<LogFormat> {
    let format = log_format_override
        .or(LogFormat::from_env()?)
        .unwrap_or(LogFormat::Human);

    match format {
        LogFormat::Human => tracing_subscriber::fmt()
            .with_env_filter(default_env_filter())
            .with_writer(io::stderr)
            .with_target(true)
            .compact()
            .try_init()
            .map_err(|err| anyhow::anyhow!("failed to initialize human logger: {err}"))?,
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .flatten_event(true)
            .with_env_filter(default_env_filter())
            .with_writer(io::stderr)
            .with_target(true)
            .try_init()
            .map_err(|err| anyhow::anyhow!("failed to initialize JSON logger: {err}"))?,
    }

    Ok(format)
}

#[derive(Debug, Parser)]
#[command(
    name = "ext2lens",
    version,
    about = "Read-only ext2 metadata inspector: superblock, root directory and inode attributes"
)]
struct Cli {
    /// Path to the ext2 image or block device (opened read-only).
    image: PathBuf,

    /// Print the report as JSON.
    #[arg(long)]
    json: bool,

    /// Render timestamps in UTC instead of the local time zone.
    #[arg(long)]
    utc: bool,

    /// Skip superblock magic and geometry validation.
    #[arg(long)]
    skip_validation: bool,

    /// Hide unused (inode 0) directory records.
    #[arg(long)]
    live_only: bool,

    /// Log output format (`human` or `json`).
    ///
    /// Precedence: `--log-format` > `EXT2LENS_LOG_FORMAT` > `human`.
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,
}

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format)?;

    let span = info_span!("inspect", image = %cli.image.display());
    let _guard = span.enter();

    let stdout = io::stdout().lock();
    let mut out = BufWriter::new(stdout);
    execute(&cli, &mut out)?;
    out.flush().context("flush report")?;
    Ok(())
}

fn execute(cli: &Cli, out: &mut impl Write) -> Result<()> {
    let options = OpenOptions {
        skip_validation: cli.skip_validation,
    };
    let vol = Ext2Volume::open_with_options(&cli.image, &options)
        .with_context(|| format!("failed to open ext2 image {}", cli.image.display()))?;
    debug!(?options, geometry = ?vol.geometry(), "volume ready");

    let filter = if cli.live_only {
        EntryFilter::Live
    } else {
        EntryFilter::All
    };
    let report = if cli.utc {
        report_volume(&vol, &Utc, filter)
    } else {
        report_volume(&vol, &Local, filter)
    }
    .context("failed to decode root directory")?;

    if cli.json {
        serde_json::to_writer_pretty(&mut *out, &report).context("serialize report")?;
        writeln!(out)?;
    } else {
        render_text(&report, out)?;
    }
    Ok(())
}

// ── Text rendering ──────────────────────────────────────────────────────────

fn render_text(report: &VolumeReport, out: &mut impl Write) -> io::Result<()> {
    let sb = &report.superblock;
    let opt = |value: Option<u32>| value.map_or_else(|| "invalid".to_owned(), |v| v.to_string());

    writeln!(out, "ext2 superblock")?;
    writeln!(out, "  volume_name:       {}", sb.volume_name)?;
    writeln!(out, "  uuid:              {}", sb.uuid)?;
    writeln!(out, "  last_mounted:      {}", sb.last_mounted)?;
    writeln!(out, "  magic:             {}", sb.magic)?;
    writeln!(
        out,
        "  revision:          {}.{}",
        sb.rev_level, sb.minor_rev_level
    )?;
    writeln!(out, "  creator_os:        {}", sb.creator_os)?;
    writeln!(out, "  state:             {}", sb.state)?;
    writeln!(out, "  errors:            {}", sb.errors)?;
    writeln!(out, "  inodes_count:      {}", sb.inodes_count)?;
    writeln!(out, "  blocks_count:      {}", sb.blocks_count)?;
    writeln!(out, "  r_blocks_count:    {}", sb.r_blocks_count)?;
    writeln!(out, "  free_blocks_count: {}", sb.free_blocks_count)?;
    writeln!(out, "  free_inodes_count: {}", sb.free_inodes_count)?;
    writeln!(out, "  first_data_block:  {}", sb.first_data_block)?;
    writeln!(out, "  block_size:        {}", opt(sb.block_size))?;
    writeln!(out, "  frag_size:         {}", opt(sb.frag_size))?;
    writeln!(out, "  blocks_per_group:  {}", sb.blocks_per_group)?;
    writeln!(out, "  frags_per_group:   {}", sb.frags_per_group)?;
    writeln!(out, "  inodes_per_group:  {}", sb.inodes_per_group)?;
    writeln!(
        out,
        "  inode_size:        {} (effective {})",
        sb.inode_size, sb.effective_inode_size
    )?;
    writeln!(out, "  groups_count:      {}", sb.groups_count)?;
    writeln!(out, "  first_ino:         {}", sb.first_ino)?;
    writeln!(
        out,
        "  features:          compat={:#x} incompat={:#x} ro_compat={:#x}",
        sb.feature_compat, sb.feature_incompat, sb.feature_ro_compat
    )?;
    writeln!(
        out,
        "  mounts:            {} of {}",
        sb.mnt_count, sb.max_mnt_count
    )?;
    writeln!(out, "  mtime:             {}", sb.mtime)?;
    writeln!(out, "  wtime:             {}", sb.wtime)?;
    writeln!(out, "  lastcheck:         {}", sb.lastcheck)?;

    let gd = &report.group_desc;
    writeln!(out)?;
    writeln!(out, "block group 0")?;
    writeln!(out, "  block_bitmap:      {}", gd.block_bitmap)?;
    writeln!(out, "  inode_bitmap:      {}", gd.inode_bitmap)?;
    writeln!(out, "  inode_table:       {}", gd.inode_table)?;
    writeln!(out, "  free_blocks:       {}", gd.free_blocks_count)?;
    writeln!(out, "  free_inodes:       {}", gd.free_inodes_count)?;
    writeln!(out, "  used_dirs:         {}", gd.used_dirs_count)?;

    writeln!(out)?;
    writeln!(out, "root directory (inode 2)")?;
    for entry in &report.entries {
        writeln!(
            out,
            "  {:>8}  {:<8} {}",
            entry.inode,
            entry.file_type.as_str(),
            entry.name
        )?;
    }

    for entry in &report.entries {
        writeln!(out)?;
        writeln!(out, "inode {} ({})", entry.inode, entry.name)?;
        match (&entry.attributes, &entry.unresolved) {
            (Some(attrs), _) => render_inode(attrs, out)?,
            (None, Some(why)) => writeln!(out, "  unresolved: {why}")?,
            (None, None) => writeln!(out, "  unused record")?,
        }
    }
    Ok(())
}

fn render_inode(attrs: &InodeReport, out: &mut impl Write) -> io::Result<()> {
    let direct: Vec<String> = attrs.block[..EXT2_NDIR_BLOCKS]
        .iter()
        .filter(|&&b| b != 0)
        .map(u32::to_string)
        .collect();

    writeln!(
        out,
        "  mode:     {} ({})",
        attrs.mode_octal,
        attrs.file_type.as_str()
    )?;
    writeln!(out, "  uid:      {}", attrs.uid)?;
    writeln!(out, "  gid:      {}", attrs.gid)?;
    writeln!(out, "  size:     {}", attrs.size)?;
    writeln!(out, "  links:    {}", attrs.links_count)?;
    writeln!(out, "  sectors:  {}", attrs.sectors)?;
    writeln!(out, "  flags:    {:#x}", attrs.flags)?;
    writeln!(out, "  atime:    {}", attrs.atime)?;
    writeln!(out, "  ctime:    {}", attrs.ctime)?;
    writeln!(out, "  mtime:    {}", attrs.mtime)?;
    writeln!(out, "  dtime:    {}", attrs.dtime)?;
    writeln!(out, "  blocks:   [{}]", direct.join(", "))?;
    Ok(())
}
