//! Stream-optimized image rewrite engine.
//!
//! Consumes the source image as a raw record stream and the frozen trim
//! bitmap over its virtual contents, and emits a rebuilt image with trimmed
//! grains dropped and freshly computed grain tables and directory. Grain
//! offsets shift as soon as one grain is dropped or resized, so the index
//! structures are always rebuilt, never copied.
//!
//! Three long-lived stages run concurrently, connected by bounded channels:
//! the reader decodes record boundaries, the transformer applies the
//! per-grain policy (the CPU-bound stage, where all (de)compression
//! happens), and the writer appends finished buffers. All stages preserve
//! strict source record order; a failure in any stage tears the whole
//! pipeline down — partial output is never usable.

use std::fs::File;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{debug, info};

use crate::compress::{self, CompressionEffort};
use zf_disk::stream::STREAM_WINDOW_SECTORS;
use zf_disk::{
    SectorDisk, SequentialDiskReader, SequentialImageWriter, TrimState, TrimmableDisk,
};
use zf_error::{Result, ZfError};
use zf_ondisk::vmdk::{build_grain_record, build_metadata_record};
use zf_ondisk::{Marker, SparseExtentHeader};
use zf_types::{
    write_le_u32, BYTES_PER_SECTOR, VMDK_MARKER_EOS, VMDK_MARKER_FOOTER, VMDK_MARKER_GD,
    VMDK_MARKER_GT, VMDK_MARKER_SIZE,
};

/// Depth of the reader → transformer queue. Deep enough to absorb read
/// bursts while the transformer is busy compressing.
const PROCESS_QUEUE_DEPTH: usize = 256;
/// Depth of the transformer → writer queue. Kept shallow; the writer is
/// rarely the bottleneck and buffers are large.
const WRITE_QUEUE_DEPTH: usize = 64;

const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, Default)]
pub struct RewriteOptions {
    /// Recompress even untouched live grains at maximal effort.
    pub force_max_compression: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RewriteSummary {
    /// Live grains copied without touching their payload.
    pub grains_copied: u64,
    /// Grains decompressed and re-emitted (partial trim or forced effort).
    pub grains_rewritten: u64,
    /// Fully trimmable grains omitted from the output.
    pub grains_dropped: u64,
    /// Total sectors written to the destination.
    pub sectors_written: u64,
}

#[derive(Debug, Default)]
struct TransformStats {
    grains_copied: u64,
    grains_rewritten: u64,
    grains_dropped: u64,
}

/// Rewrite `source` (the raw image stream) into `dest`, dropping grains the
/// bitmap in `work` proves trimmable. `work` must wrap the *virtual*
/// contents of the same image, with its scan phase complete.
pub fn rewrite_stream_optimized(
    source: &dyn SectorDisk,
    work: &TrimmableDisk,
    dest: File,
    options: RewriteOptions,
) -> Result<RewriteSummary> {
    let mut reader = SequentialDiskReader::new(source);
    let header_sector = reader.read_sector()?;
    let header = SparseExtentHeader::parse(&header_sector)
        .map_err(|error| ZfError::Format(format!("sparse extent header: {error}")))?;
    if !header.has_compressed_grains() || !header.uses_markers() {
        return Err(ZfError::Unsupported(
            "source image is not stream-optimized".to_owned(),
        ));
    }
    if header.overhead == 0 {
        return Err(ZfError::Format("header declares zero overhead".to_owned()));
    }

    let mut writer = SequentialImageWriter::new(dest);

    // Grain geometry is preserved, so the metadata region stays
    // byte-positionally valid and is copied verbatim.
    writer.write(&header_sector)?;
    let mut remaining = header.overhead - 1;
    while remaining > 0 {
        let chunk = remaining.min(STREAM_WINDOW_SECTORS);
        writer.write(&reader.read_sectors(chunk)?)?;
        remaining -= chunk;
    }

    let (raw_tx, raw_rx) = bounded::<Vec<u8>>(PROCESS_QUEUE_DEPTH);
    let (out_tx, out_rx) = bounded::<Vec<u8>>(WRITE_QUEUE_DEPTH);

    let stats = thread::scope(|scope| -> Result<TransformStats> {
        let reader_handle = scope.spawn(move || read_records(reader, &raw_tx));
        let transform_header = header.clone();
        let transform_handle = scope.spawn(move || {
            transform_records(transform_header, work, options, &raw_rx, &out_tx)
        });

        let mut write_result: Result<()> = Ok(());
        let mut last_report = Instant::now();
        while let Ok(buffer) = out_rx.recv() {
            if let Err(error) = writer.write(&buffer) {
                write_result = Err(error);
                break;
            }
            if last_report.elapsed() >= PROGRESS_INTERVAL {
                info!(
                    mib_written = writer.position() * BYTES_PER_SECTOR as u64 / 1024 / 1024,
                    "rewriting image"
                );
                last_report = Instant::now();
            }
        }
        drop(out_rx);

        let transform_result = transform_handle
            .join()
            .map_err(|_| ZfError::Format("transform stage panicked".to_owned()))?;
        let reader_result = reader_handle
            .join()
            .map_err(|_| ZfError::Format("reader stage panicked".to_owned()))?;

        let stats = transform_result?;
        reader_result?;
        write_result?;
        writer.flush()?;
        Ok(stats)
    })?;

    let summary = RewriteSummary {
        grains_copied: stats.grains_copied,
        grains_rewritten: stats.grains_rewritten,
        grains_dropped: stats.grains_dropped,
        sectors_written: writer.position(),
    };
    info!(
        grains_copied = summary.grains_copied,
        grains_rewritten = summary.grains_rewritten,
        grains_dropped = summary.grains_dropped,
        sectors_written = summary.sectors_written,
        "stream-optimized rewrite complete"
    );
    Ok(summary)
}

/// Reader stage: split the source stream into whole records.
///
/// A record is its 12-byte-marker sector plus the span the marker declares:
/// `ceil((12 + size) / 512)` sectors for grains, `value` payload sectors
/// for metadata markers.
fn read_records(mut reader: SequentialDiskReader<'_>, raw_tx: &Sender<Vec<u8>>) -> Result<()> {
    while reader.position() < reader.total_sectors() {
        let mut record = reader.read_sector()?;
        let marker = Marker::parse(&record)?;
        let additional = if marker.is_grain() {
            Marker::grain_record_sectors(marker.size) - 1
        } else {
            marker.value
        };

        let mut remaining = additional;
        while remaining > 0 {
            let chunk = remaining.min(STREAM_WINDOW_SECTORS);
            record.extend_from_slice(&reader.read_sectors(chunk)?);
            remaining -= chunk;
        }

        if raw_tx.send(record).is_err() {
            // Downstream stage is gone; its error is the one that matters.
            return Ok(());
        }
    }
    Ok(())
}

/// Transformer stage: apply the per-grain policy and rebuild the index.
fn transform_records(
    mut header: SparseExtentHeader,
    work: &TrimmableDisk,
    options: RewriteOptions,
    raw_rx: &Receiver<Vec<u8>>,
    out_tx: &Sender<Vec<u8>>,
) -> Result<TransformStats> {
    let grain_size = header.grain_size;
    let entries_per_table = u64::from(header.num_gtes_per_gt);
    let total_grains = header.total_grains();

    let mut directory =
        vec![
            0_u32;
            usize::try_from(header.grain_table_count())
                .map_err(|_| ZfError::Overflow("grain table count"))?
        ];
    let mut table: Option<Vec<u32>> = None;
    let mut table_index = 0_u64;
    let mut gd_sector = 0_u64;
    let mut position = header.overhead;
    let mut stats = TransformStats::default();

    for record in raw_rx.iter() {
        let marker = Marker::parse(&record)?;
        if marker.is_grain() {
            let lba = marker.value;
            if lba % grain_size != 0 {
                return Err(ZfError::Format(format!(
                    "grain LBA {lba} is not grain-aligned"
                )));
            }
            let grain_index = lba / grain_size;
            if grain_index >= total_grains {
                return Err(ZfError::Format(format!(
                    "grain LBA {lba} lies beyond the declared capacity"
                )));
            }

            let this_table = grain_index / entries_per_table;
            if this_table > table_index {
                if let Some(entries) = table.take() {
                    flush_table(&mut directory, table_index, entries, &mut position, out_tx)?;
                }
                table_index = this_table;
            }

            match work.trim_state(lba, grain_size)? {
                TrimState::AllTrimmable => {
                    // Omitted entirely; an absent grain-table entry already
                    // means "unallocated, reads as zeros".
                    stats.grains_dropped += 1;
                }
                state => {
                    let entry = u32::try_from(position)
                        .map_err(|_| ZfError::Overflow("grain output sector"))?;
                    let entries = table.get_or_insert_with(|| {
                        vec![0_u32; entries_per_table as usize]
                    });
                    entries[(grain_index % entries_per_table) as usize] = entry;

                    let output = if state == TrimState::AllLive && !options.force_max_compression {
                        stats.grains_copied += 1;
                        record
                    } else {
                        stats.grains_rewritten += 1;
                        rewrite_grain(&record, marker, lba, state, work, &header, options)?
                    };
                    position += (output.len() / BYTES_PER_SECTOR) as u64;
                    if out_tx.send(output).is_err() {
                        return Ok(stats);
                    }
                }
            }
        } else {
            match Marker::marker_type(&record)? {
                // Source grain tables are stale the moment a grain moves;
                // ours are emitted as their grain ranges complete.
                VMDK_MARKER_GT => {}
                VMDK_MARKER_GD => {
                    if let Some(entries) = table.take() {
                        flush_table(&mut directory, table_index, entries, &mut position, out_tx)?;
                    }
                    gd_sector = position + 1;
                    let gd_record =
                        build_metadata_record(VMDK_MARKER_GD, &serialize_entries(&directory)?)?;
                    position += (gd_record.len() / BYTES_PER_SECTOR) as u64;
                    debug!(gd_sector, tables = directory.len(), "emitted grain directory");
                    if out_tx.send(gd_record).is_err() {
                        return Ok(stats);
                    }
                }
                VMDK_MARKER_FOOTER => {
                    header
                        .set_gd_offset(gd_sector)
                        .map_err(|error| ZfError::Format(format!("footer patch: {error}")))?;
                    let mut output = record[..BYTES_PER_SECTOR].to_vec();
                    output.extend_from_slice(&header.to_bytes());
                    position += (output.len() / BYTES_PER_SECTOR) as u64;
                    if out_tx.send(output).is_err() {
                        return Ok(stats);
                    }
                }
                VMDK_MARKER_EOS => {
                    position += (record.len() / BYTES_PER_SECTOR) as u64;
                    if out_tx.send(record).is_err() {
                        return Ok(stats);
                    }
                }
                other => {
                    return Err(ZfError::Format(format!(
                        "unexpected marker type {other} in grain stream"
                    )));
                }
            }
        }
    }
    Ok(stats)
}

/// Decompress, zero trimmed sub-ranges (for mixed grains), and recompress.
fn rewrite_grain(
    record: &[u8],
    marker: Marker,
    lba: u64,
    state: TrimState,
    work: &TrimmableDisk,
    header: &SparseExtentHeader,
    options: RewriteOptions,
) -> Result<Vec<u8>> {
    let payload = &record[VMDK_MARKER_SIZE..VMDK_MARKER_SIZE + marker.size as usize];
    let grain_bytes = usize::try_from(header.grain_size * BYTES_PER_SECTOR as u64)
        .map_err(|_| ZfError::Overflow("grain length"))?;

    let mut data = compress::decompress(payload, grain_bytes)?;
    if state == TrimState::Mixed {
        work.apply_trim(&mut data, lba)?;
    }

    let effort = if options.force_max_compression {
        CompressionEffort::Maximal
    } else {
        CompressionEffort::from_zlib_payload(payload)
    };
    let compressed = compress::compress(&data, effort)?;
    Ok(build_grain_record(lba, &compressed)?)
}

/// Emit a finished grain table and point its directory entry one past the
/// table's own marker sector.
fn flush_table(
    directory: &mut [u32],
    table_index: u64,
    entries: Vec<u32>,
    position: &mut u64,
    out_tx: &Sender<Vec<u8>>,
) -> Result<()> {
    let slot = usize::try_from(table_index).map_err(|_| ZfError::Overflow("grain table index"))?;
    let Some(directory_entry) = directory.get_mut(slot) else {
        return Err(ZfError::Format(format!(
            "grain table index {table_index} out of directory range"
        )));
    };
    *directory_entry =
        u32::try_from(*position + 1).map_err(|_| ZfError::Overflow("grain table sector"))?;

    let record = build_metadata_record(VMDK_MARKER_GT, &serialize_entries(&entries)?)?;
    *position += (record.len() / BYTES_PER_SECTOR) as u64;
    // A send failure means the writer is gone; the caller's next send
    // notices and unwinds, so the lost record is irrelevant.
    let _ = out_tx.send(record);
    Ok(())
}

fn serialize_entries(entries: &[u32]) -> Result<Vec<u8>> {
    let mut bytes = vec![0_u8; entries.len() * 4];
    for (index, entry) in entries.iter().enumerate() {
        write_le_u32(&mut bytes, index * 4, *entry)?;
    }
    Ok(bytes)
}
