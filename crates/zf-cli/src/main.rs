#![forbid(unsafe_code)]

use std::env;
use std::fs::File;
use std::path::Path;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use zf_disk::{RawDisk, SectorDisk, TrimmableDisk};
use zf_scan::trim_free_space;
use zf_vmdk::{
    copy_disk, rewrite_stream_optimized, CompressionEffort, DiskImageType, FlatImageSink,
    MonolithicSparseSink, RewriteOptions, StreamOptimizedSink, VmdkImage,
};

/// Trim granularity in sectors (4 KiB blocks).
const TRIM_BLOCK_SECTORS: u64 = 8;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    let mut disk_type = DiskImageType::StreamOptimized;
    let mut force_max_compression = false;
    if args.len() == 3 && args[2] == "-max-compression" {
        force_max_compression = true;
    } else if args.len() == 4 && args[2] == "-disk-type" {
        let Some(parsed) = DiskImageType::parse(&args[3]) else {
            bail!("invalid disk-type '{}'", args[3]);
        };
        disk_type = parsed;
    } else if args.len() != 2 {
        print_usage();
        bail!("invalid arguments");
    }

    let input = Path::new(&args[0]);
    let output = Path::new(&args[1]);
    if !input.exists() {
        bail!("input file '{}' does not exist", input.display());
    }

    let started = Instant::now();
    trim_image(input, output, disk_type, force_max_compression)?;

    let input_mib = input.metadata()?.len() / 1024 / 1024;
    let output_mib = output.metadata()?.len() / 1024 / 1024;
    info!(
        elapsed_seconds = started.elapsed().as_secs(),
        input_mib, output_mib, "done"
    );
    println!("Input size: {input_mib} MiB");
    println!("Output size: {output_mib} MiB");
    Ok(())
}

fn trim_image(
    input: &Path,
    output: &Path,
    disk_type: DiskImageType,
    force_max_compression: bool,
) -> Result<()> {
    let image = VmdkImage::open(input)
        .with_context(|| format!("opening input image '{}'", input.display()))?;
    let stream_optimized_input = image.is_stream_optimized();
    let capacity = image.total_sectors();

    let work = TrimmableDisk::new(Box::new(image), TRIM_BLOCK_SECTORS)
        .context("wrapping input with the trim bitmap")?;
    trim_free_space(&work).context("scanning for free space")?;

    let effort = if force_max_compression {
        CompressionEffort::Maximal
    } else {
        CompressionEffort::Fastest
    };
    let dest = File::create(output)
        .with_context(|| format!("creating output image '{}'", output.display()))?;

    match disk_type {
        DiskImageType::StreamOptimized if stream_optimized_input => {
            // Fast path: restructure the source grain stream without
            // decompressing live grains.
            let raw = RawDisk::open(input)?;
            rewrite_stream_optimized(
                &raw,
                &work,
                dest,
                RewriteOptions {
                    force_max_compression,
                },
            )
            .context("rewriting stream-optimized image")?;
        }
        DiskImageType::StreamOptimized => {
            let mut sink = StreamOptimizedSink::create(dest, capacity, effort)?;
            copy_disk(&work, &mut sink).context("writing stream-optimized image")?;
        }
        DiskImageType::MonolithicSparse => {
            let mut sink = MonolithicSparseSink::create(dest, capacity)?;
            copy_disk(&work, &mut sink).context("writing monolithic sparse image")?;
        }
        DiskImageType::MonolithicFlat => {
            let mut sink = FlatImageSink::new(dest);
            copy_disk(&work, &mut sink).context("writing flat image")?;
        }
    }
    Ok(())
}

fn print_usage() {
    println!("vmdk-zerofree");
    println!();
    println!("USAGE:");
    println!("  vmdk-zerofree <input-vmdk-path> <output-vmdk-path> [-disk-type <disk-type>]");
    println!("  vmdk-zerofree <input-vmdk-path> <output-vmdk-path> [-max-compression]");
    println!();
    println!("  Disk types:");
    println!("    monolithic-sparse");
    println!("    monolithic-flat");
    println!("    stream-optimized (default)");
}
