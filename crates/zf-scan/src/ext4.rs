//! ext4 free-block scanner.
//!
//! Reads the group-descriptor table once, then walks each group's block
//! bitmap. Clear bits are free blocks; maximal runs of free blocks are
//! coalesced per group and handed to the trim bitmap as sector ranges.
//! The filesystem is never mounted and never modified.

use std::time::{Duration, Instant};

use tracing::{debug, info};

use zf_disk::{SectorDisk, TrimmableDisk};
use zf_error::{Result, ZfError};
use zf_ondisk::ext4::parse_group_descriptors;
use zf_ondisk::Ext4Superblock;
use zf_types::{bytes_to_sectors_ceil, SectorRange};

const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

/// Mark every free block of the ext4 filesystem in `volume` as trimmable.
pub fn trim_unused_blocks(
    disk: &TrimmableDisk,
    volume: SectorRange,
    superblock: &Ext4Superblock,
) -> Result<()> {
    let bytes_per_sector = disk.bytes_per_sector() as u64;
    let block_size = u64::from(superblock.block_size);
    if block_size % bytes_per_sector != 0 {
        return Err(ZfError::Unsupported(format!(
            "ext4 block size {block_size} is not a multiple of the sector size"
        )));
    }
    let block_sectors = block_size / bytes_per_sector;

    let corrupt = |detail: String| ZfError::Corrupt {
        volume: volume.to_string(),
        detail,
    };

    let group_count = superblock
        .groups_count()
        .map_err(|error| corrupt(format!("group count: {error}")))?;
    let blocks_in_last_group = superblock
        .blocks_in_last_group()
        .map_err(|error| corrupt(format!("last group size: {error}")))?;
    let desc_size = superblock.group_desc_size();

    // The descriptor table sits in the block after the superblock's block.
    let table_offset_bytes = u64::from(superblock.first_data_block)
        .checked_add(1)
        .and_then(|block| block.checked_mul(block_size))
        .ok_or(ZfError::Overflow("group descriptor table offset"))?;
    let table_bytes = u64::from(group_count)
        .checked_mul(u64::from(desc_size))
        .ok_or(ZfError::Overflow("group descriptor table size"))?;
    let table = disk.read_sectors(
        volume.first_sector + table_offset_bytes / bytes_per_sector,
        bytes_to_sectors_ceil(table_bytes),
    )?;
    let descriptors = parse_group_descriptors(&table, desc_size, group_count)
        .map_err(|error| corrupt(format!("group descriptors: {error}")))?;

    let bitmap_bytes = u64::from(superblock.blocks_per_group).div_ceil(8);
    let bitmap_sectors = bytes_to_sectors_ceil(bitmap_bytes);

    let mut last_report = Instant::now();
    for (group_index, descriptor) in descriptors.iter().enumerate() {
        if last_report.elapsed() >= PROGRESS_INTERVAL {
            info!(
                group = group_index,
                groups = group_count,
                "scanning ext4 block groups"
            );
            last_report = Instant::now();
        }

        let group_index = group_index as u32;
        let blocks_in_group = if group_index + 1 == group_count {
            blocks_in_last_group
        } else {
            superblock.blocks_per_group
        };

        let bitmap_sector = descriptor
            .block_bitmap
            .checked_mul(block_sectors)
            .ok_or(ZfError::Overflow("block bitmap offset"))?;
        let bitmap = disk.read_sectors(volume.first_sector + bitmap_sector, bitmap_sectors)?;

        let group_first_block = u64::from(group_index) * u64::from(superblock.blocks_per_group);
        mark_free_runs(
            disk,
            volume,
            &bitmap,
            blocks_in_group,
            group_first_block,
            block_sectors,
        )?;
        debug!(
            group = group_index,
            blocks = blocks_in_group,
            free = descriptor.free_blocks_count,
            "scanned block group"
        );
    }
    Ok(())
}

/// Walk `blocks_in_group` bits of a group bitmap, marking each maximal run
/// of clear (free) bits trimmable.
fn mark_free_runs(
    disk: &TrimmableDisk,
    volume: SectorRange,
    bitmap: &[u8],
    blocks_in_group: u32,
    group_first_block: u64,
    block_sectors: u64,
) -> Result<()> {
    let mut run_start: Option<u32> = None;
    // One past the end so a run reaching the group boundary is flushed.
    for block in 0..=blocks_in_group {
        let free = block < blocks_in_group && is_block_free(bitmap, block);
        if free {
            run_start.get_or_insert(block);
            continue;
        }
        let Some(start) = run_start.take() else {
            continue;
        };

        let first_block = group_first_block + u64::from(start);
        let first_sector = first_block
            .checked_mul(block_sectors)
            .and_then(|sector| sector.checked_add(volume.first_sector))
            .ok_or(ZfError::Overflow("free run start sector"))?;
        let sector_count = u64::from(block - start)
            .checked_mul(block_sectors)
            .ok_or(ZfError::Overflow("free run sector count"))?;
        disk.mark_trimmable(first_sector, sector_count)?;
    }
    Ok(())
}

/// Bit clear ⇒ block free. Bits are LSB-first within each byte.
fn is_block_free(bitmap: &[u8], block: u32) -> bool {
    let byte = (block / 8) as usize;
    let bit = block % 8;
    byte < bitmap.len() && (bitmap[byte] >> bit) & 1 == 0
}
