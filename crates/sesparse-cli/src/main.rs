//! sesparse CLI - Inspect and extract SESparse snapshot chains.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::stream::{self, StreamExt, TryStreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use sesparse_core::{
    open_chain, read_geometry, BlockDevice, ByteRangeSource, FlatDisk, MmapSource, OpenOptions,
    SlotStats, SparseDiskLayer, ZeroDisk, BLOCK_SIZE,
};
use sha2::{Digest, Sha256};
use tracing::info;
use tracing_subscriber::prelude::*;

/// Read-only tool for SESparse virtual disk deltas.
#[derive(Parser)]
#[command(name = "sesparse")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display the header geometry of a SESparse file.
    Info {
        /// Path to the SESparse file.
        file: PathBuf,
    },

    /// Display which blocks a SESparse file overlays.
    Map {
        /// Path to the SESparse file.
        file: PathBuf,
    },

    /// Extract the disk seen through a chain of deltas as a raw image.
    Extract {
        /// SESparse deltas, oldest first.
        #[arg(required = true)]
        deltas: Vec<PathBuf>,

        /// Output raw image path.
        #[arg(short, long)]
        output: PathBuf,

        /// Raw flat base image. Without it the chain is rooted on zeros.
        #[arg(short, long)]
        base: Option<PathBuf>,

        /// Number of blocks read concurrently.
        #[arg(short, long, default_value = "4")]
        jobs: usize,

        /// Only report blocks held by the newest delta as present.
        #[arg(long)]
        no_parent_lookup: bool,

        /// Suppress progress output.
        #[arg(short, long)]
        quiet: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Info { file } => show_info(&file).await?,
        Commands::Map { file } => show_map(&file).await?,
        Commands::Extract {
            deltas,
            output,
            base,
            jobs,
            no_parent_lookup,
            quiet,
        } => {
            run_extract(&deltas, &output, base.as_deref(), jobs, no_parent_lookup, quiet).await?;
        }
    }

    Ok(())
}

fn open_source(path: &Path) -> Result<Arc<MmapSource>> {
    let source = MmapSource::open(path)
        .with_context(|| format!("Failed to open '{}'", path.display()))?;
    Ok(Arc::new(source))
}

async fn show_info(file: &Path) -> Result<()> {
    let source = open_source(file)?;
    let geometry = read_geometry(source.as_ref()).await?;

    println!("SESparse Information");
    println!("====================");
    println!();
    println!("File:            {}", file.display());
    println!("Disk size:       {}", format_bytes(geometry.disk_size_bytes));
    println!("Blocks (2 MB):   {}", geometry.block_count());
    println!("Grain size:      {}", format_bytes(geometry.grain_size_bytes));
    println!("Flags:           0x{:X}", geometry.flags);
    println!();
    println!(
        "Grain directory: {} entries at offset {}",
        geometry.grain_dir_count, geometry.grain_dir_offset_bytes
    );
    println!(
        "Grain tables:    {} entries each, from offset {}",
        geometry.grain_table_count, geometry.grain_table_offset_bytes
    );
    println!("Grain data:      from offset {}", geometry.grain_offset_bytes);

    Ok(())
}

async fn show_map(file: &Path) -> Result<()> {
    let source = open_source(file)?;
    let geometry = read_geometry(source.as_ref()).await?;
    let parent = Arc::new(ZeroDisk::new(geometry.disk_size_bytes));
    let mut layer = SparseDiskLayer::open(source, parent, OpenOptions::own_blocks_only()).await?;
    layer.build_index().await?;

    let overlay = layer.overlay()?;
    println!(
        "{} of {} blocks have grain tables",
        overlay.len(),
        geometry.block_count()
    );
    println!();
    println!("{:>10}  {:>9}  {:>5}  {:>8}  {:>6}", "block", "allocated", "zero", "unmapped", "parent");

    let mut total = SlotStats::default();
    for block_id in overlay.block_ids() {
        let Some(slots) = overlay.get(block_id) else {
            continue;
        };
        let stats = SlotStats::of(slots);
        if stats.non_allocated == slots.len() {
            continue;
        }
        println!(
            "{:>10}  {:>9}  {:>5}  {:>8}  {:>6}",
            block_id, stats.allocated, stats.zero, stats.unmapped, stats.non_allocated
        );
        total.allocated += stats.allocated;
        total.zero += stats.zero;
        total.unmapped += stats.unmapped;
    }

    println!();
    println!(
        "Allocated grains: {} ({})",
        total.allocated,
        format_bytes(total.allocated as u64 * geometry.grain_size_bytes)
    );
    println!("Zero grains:      {}", total.zero);
    println!("Unmapped grains:  {}", total.unmapped);

    Ok(())
}

async fn run_extract(
    deltas: &[PathBuf],
    output: &Path,
    base: Option<&Path>,
    jobs: usize,
    no_parent_lookup: bool,
    quiet: bool,
) -> Result<()> {
    let sources = deltas
        .iter()
        .map(|path| open_source(path).map(|source| source as Arc<dyn ByteRangeSource>))
        .collect::<Result<Vec<_>>>()?;

    // The oldest delta defines the disk size the base has to provide.
    let oldest = sources.first().context("No SESparse delta given")?;
    let oldest = read_geometry(oldest.as_ref()).await?;
    let base: Arc<dyn BlockDevice> = match base {
        Some(path) => {
            let source = open_source(path)?;
            let size = source.size();
            Arc::new(FlatDisk::new(source, size))
        }
        None => Arc::new(ZeroDisk::new(oldest.disk_size_bytes)),
    };

    let options = OpenOptions {
        look_missing_block_in_parent: !no_parent_lookup,
        ..OpenOptions::default()
    };
    let top = open_chain(sources, base, options).await?;
    let disk_size = top.geometry().disk_size_bytes;
    let block_count = top.geometry().block_count();
    info!(disk_size, block_count, layers = deltas.len(), "extracting disk");

    let progress_bar = if quiet {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new(disk_size);
        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")?
            .progress_chars("#>-");
        pb.set_style(style);
        pb
    };

    let file = File::create(output)
        .with_context(|| format!("Failed to create '{}'", output.display()))?;
    let mut writer = BufWriter::new(file);
    let summary = write_disk(top, disk_size, jobs, &mut writer, &progress_bar).await?;
    progress_bar.finish_with_message("Complete!");

    if !quiet {
        println!();
        println!("Extraction completed successfully: {}", output.display());
        println!("Written:        {}", format_bytes(summary.bytes_written));
        println!("Blocks present: {} of {}", summary.present, block_count);
        println!("SHA256:         {}", summary.sha256);
    }

    Ok(())
}

/// Outcome of writing a disk out as a raw image.
#[derive(Debug)]
struct ExtractSummary {
    /// Bytes written, equal to the disk size.
    bytes_written: u64,
    /// Blocks the device reported as present.
    present: u64,
    /// Lowercase hex SHA-256 of the written bytes.
    sha256: String,
}

/// Reads every block of `device` in order and writes the first `disk_size`
/// bytes to `writer`.
///
/// Up to `jobs` block reads are in flight at once. The last block is cut at
/// the disk size.
async fn write_disk<W: Write>(
    device: Arc<dyn BlockDevice>,
    disk_size: u64,
    jobs: usize,
    writer: &mut W,
    progress_bar: &ProgressBar,
) -> Result<ExtractSummary> {
    let block_count = disk_size.div_ceil(BLOCK_SIZE);
    let mut hasher = Sha256::new();
    let mut present = 0u64;
    let mut bytes_written = 0u64;

    let mut blocks = stream::iter(0..block_count)
        .map(|block_id| {
            let device = Arc::clone(&device);
            async move { device.read_block(block_id).await }
        })
        .buffered(jobs.max(1));

    while let Some(block) = blocks.try_next().await? {
        if device.contains_block(block.id())? {
            present += 1;
        }
        let remaining = disk_size - block.id() * BLOCK_SIZE;
        let data = &block.data()[..remaining.min(BLOCK_SIZE) as usize];
        writer.write_all(data)?;
        hasher.update(data);
        bytes_written += data.len() as u64;
        progress_bar.inc(data.len() as u64);
    }
    writer.flush()?;

    Ok(ExtractSummary {
        bytes_written,
        present,
        sha256: format!("{:x}", hasher.finalize()),
    })
}

/// Format bytes as human-readable string.
fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
