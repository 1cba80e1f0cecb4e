//! xfs free-space scanner.
//!
//! For each allocation group, reads the AGF header, descends the by-block
//! free-space B+tree to its leftmost leaf, and walks the leaf chain through
//! the right-sibling pointers. The descent always follows pointer index 0 —
//! valid only because the traversal wants the leftmost leaf and nothing
//! else; this is not a keyed lookup.

use tracing::{debug, info};

use zf_disk::{SectorDisk, TrimmableDisk};
use zf_error::{Result, ZfError};
use zf_ondisk::xfs::{parse_alloc_records, parse_node_pointers};
use zf_ondisk::{XfsAgf, XfsAllocRecord, XfsBtreeHeader, XfsSuperblock};
use zf_types::{ParseError, SectorRange, XFS_NULL_AGBLOCK};

/// Mark every free extent of the xfs filesystem in `volume` as trimmable.
pub fn trim_unused_blocks(
    disk: &TrimmableDisk,
    volume: SectorRange,
    superblock: &XfsSuperblock,
) -> Result<()> {
    let bytes_per_sector = disk.bytes_per_sector() as u64;
    let block_size = u64::from(superblock.block_size);
    if block_size == 0 || block_size % bytes_per_sector != 0 {
        return Err(ZfError::Unsupported(format!(
            "xfs block size {block_size} is not a multiple of the sector size"
        )));
    }
    let sectors_per_block = block_size / bytes_per_sector;
    // The AGF lives in the second filesystem sector of each AG.
    let agf_offset = (u64::from(superblock.sector_size) / bytes_per_sector).max(1);

    for ag_index in 0..superblock.ag_count {
        let ag_start = u64::from(ag_index)
            .checked_mul(u64::from(superblock.ag_blocks))
            .and_then(|blocks| blocks.checked_mul(sectors_per_block))
            .ok_or(ZfError::Overflow("allocation group start"))?;

        let agf_sector = disk.read_sectors(volume.first_sector + ag_start + agf_offset, 1)?;
        let agf = XfsAgf::parse(&agf_sector).map_err(|error| ZfError::Corrupt {
            volume: volume.to_string(),
            detail: format!("AGF of allocation group {ag_index}: {error}"),
        })?;

        let extents = read_free_extents(disk, volume, ag_start, agf.bno_root, superblock)?;
        debug!(
            allocation_group = ag_index,
            extents = extents.len(),
            "collected free extents"
        );

        for extent in &extents {
            let extent_start = u64::from(extent.start_block)
                .checked_mul(sectors_per_block)
                .and_then(|sector| sector.checked_add(ag_start))
                .and_then(|sector| sector.checked_add(volume.first_sector))
                .ok_or(ZfError::Overflow("free extent start sector"))?;
            let sector_count = u64::from(extent.block_count)
                .checked_mul(sectors_per_block)
                .ok_or(ZfError::Overflow("free extent sector count"))?;
            disk.mark_trimmable(extent_start, sector_count)?;
        }
    }

    info!(
        allocation_groups = superblock.ag_count,
        "xfs free-space scan complete"
    );
    Ok(())
}

/// Collect the by-block tree's free extents in ascending start order.
///
/// Descends interior nodes through their first pointer, then scans the leaf
/// chain left to right. The leftmost leaf must have a null left sibling;
/// anything else means the descent landed mid-chain on a damaged tree.
fn read_free_extents(
    disk: &TrimmableDisk,
    volume: SectorRange,
    ag_start: u64,
    root_block: u32,
    superblock: &XfsSuperblock,
) -> Result<Vec<XfsAllocRecord>> {
    let expected_magic = superblock.bno_btree_magic();
    let is_v5 = superblock.is_v5();
    let sectors_per_block = u64::from(superblock.block_size) / disk.bytes_per_sector() as u64;

    let corrupt = |detail: String| ZfError::Corrupt {
        volume: volume.to_string(),
        detail,
    };
    let read_node = |block: u32| -> Result<Vec<u8>> {
        let offset = u64::from(block)
            .checked_mul(sectors_per_block)
            .and_then(|sector| sector.checked_add(ag_start))
            .and_then(|sector| sector.checked_add(volume.first_sector))
            .ok_or(ZfError::Overflow("btree node sector"))?;
        disk.read_sectors(offset, sectors_per_block)
    };
    let parse_header = |node: &[u8]| -> Result<XfsBtreeHeader> {
        XfsBtreeHeader::parse(node, is_v5, expected_magic).map_err(|error| match error {
            ParseError::InvalidMagic { expected, actual } => corrupt(format!(
                "free-space btree node signature {actual:#x} does not match {expected:#x}"
            )),
            other => corrupt(format!("free-space btree node: {other}")),
        })
    };

    let mut node = read_node(root_block)?;
    let mut header = parse_header(&node)?;

    while header.level > 0 {
        let pointers = parse_node_pointers(&node, &header, superblock.block_size)
            .map_err(|error| corrupt(format!("interior node pointers: {error}")))?;
        let Some(&first_child) = pointers.first() else {
            return Err(corrupt("interior btree node with no children".to_owned()));
        };
        node = read_node(first_child)?;
        header = parse_header(&node)?;
    }

    if header.left_sibling != XFS_NULL_AGBLOCK {
        return Err(corrupt(format!(
            "leftmost leaf has left sibling {:#x}",
            header.left_sibling
        )));
    }

    let mut extents =
        parse_alloc_records(&node, &header).map_err(|error| corrupt(format!("leaf records: {error}")))?;
    while header.right_sibling != XFS_NULL_AGBLOCK {
        node = read_node(header.right_sibling)?;
        header = parse_header(&node)?;
        if header.level != 0 {
            return Err(corrupt("leaf chain led to an interior node".to_owned()));
        }
        let mut records = parse_alloc_records(&node, &header)
            .map_err(|error| corrupt(format!("leaf records: {error}")))?;
        extents.append(&mut records);
    }
    Ok(extents)
}
