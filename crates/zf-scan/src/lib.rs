#![forbid(unsafe_code)]
//! Free-space discovery.
//!
//! Walks the partition table, resolves LVM-wrapped volumes to concrete
//! extents, classifies each volume's filesystem by sniffing magics at the
//! known offsets, and runs the matching free-block scanner. Scanners only
//! ever mark the trim bitmap; nothing here modifies the source image.
//!
//! A corrupt filesystem condemns its volume alone — remaining volumes are
//! still scanned. Every other error aborts the run.

pub mod ext4;
pub mod lvm;
pub mod xfs;

use tracing::{debug, info, warn};

use zf_disk::{SectorDisk, TrimmableDisk};
use zf_error::{Result, ZfError};
use zf_ondisk::{Ext4Superblock, MasterBootRecord, XfsSuperblock};
use zf_types::{ParseError, SectorRange, EXT4_SUPERBLOCK_OFFSET};

/// Result of sniffing filesystem magics at the volume's known offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilesystemKind {
    Ext4(Ext4Superblock),
    Xfs(XfsSuperblock),
    Unrecognized,
}

/// Counters for end-of-run reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub volumes_scanned: u32,
    pub volumes_skipped: u32,
    pub volumes_corrupt: u32,
}

/// Classify the filesystem inside `volume` by reading the candidate
/// superblock locations. Magic mismatches mean "not this filesystem", never
/// an error; a valid magic followed by nonsense fields is corruption.
pub fn sniff_filesystem(disk: &dyn SectorDisk, volume: SectorRange) -> Result<FilesystemKind> {
    // ext4: 1024 bytes at byte offset 1024, i.e. sectors 2..4 of the volume.
    let ext4_first = EXT4_SUPERBLOCK_OFFSET / disk.bytes_per_sector() as u64;
    if volume.sector_count >= ext4_first + 2 {
        let region = disk.read_sectors(volume.first_sector + ext4_first, 2)?;
        match Ext4Superblock::parse(&region) {
            Ok(superblock) => return Ok(FilesystemKind::Ext4(superblock)),
            Err(ParseError::InvalidMagic { .. }) => {}
            Err(error) => {
                return Err(ZfError::Corrupt {
                    volume: volume.to_string(),
                    detail: format!("ext4 superblock: {error}"),
                })
            }
        }
    }

    if volume.sector_count >= 1 {
        let sector = disk.read_sectors(volume.first_sector, 1)?;
        match XfsSuperblock::parse(&sector) {
            Ok(superblock) => return Ok(FilesystemKind::Xfs(superblock)),
            Err(ParseError::InvalidMagic { .. }) => {}
            Err(error) => {
                return Err(ZfError::Corrupt {
                    volume: volume.to_string(),
                    detail: format!("xfs superblock: {error}"),
                })
            }
        }
    }

    Ok(FilesystemKind::Unrecognized)
}

/// Scan every Linux volume on `disk` and mark its free space trimmable.
pub fn trim_free_space(disk: &TrimmableDisk) -> Result<ScanSummary> {
    let mut summary = ScanSummary::default();

    let sector0 = disk.read_sectors(0, 1)?;
    let mbr = match MasterBootRecord::parse(&sector0) {
        Ok(mbr) => mbr,
        Err(ParseError::InvalidMagic { .. }) => {
            info!("no MBR partition table; nothing to scan");
            return Ok(summary);
        }
        Err(error) => return Err(error.into()),
    };

    for (index, partition) in mbr.partitions.iter().enumerate() {
        if partition.is_empty() || !partition.is_linux_candidate() {
            continue;
        }
        debug!(
            partition = index,
            partition_type = partition.partition_type,
            range = %partition.range(),
            "inspecting partition"
        );

        for volume in lvm::resolve_volumes(disk, partition)? {
            if volume.is_empty() {
                continue;
            }
            match scan_volume(disk, volume) {
                Ok(true) => summary.volumes_scanned += 1,
                Ok(false) => summary.volumes_skipped += 1,
                Err(error) if error.is_volume_local() => {
                    warn!(volume = %volume, %error, "skipping corrupt volume");
                    summary.volumes_corrupt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }

    info!(
        scanned = summary.volumes_scanned,
        skipped = summary.volumes_skipped,
        corrupt = summary.volumes_corrupt,
        trimmable_blocks = disk.trimmable_block_count(),
        "free-space scan complete"
    );
    Ok(summary)
}

/// Scan one volume; `Ok(true)` if a supported filesystem was found.
fn scan_volume(disk: &TrimmableDisk, volume: SectorRange) -> Result<bool> {
    match sniff_filesystem(disk, volume)? {
        FilesystemKind::Ext4(superblock) => {
            info!(volume = %volume, blocks = superblock.blocks_count, "scanning ext4 volume");
            ext4::trim_unused_blocks(disk, volume, &superblock)?;
            Ok(true)
        }
        FilesystemKind::Xfs(superblock) => {
            info!(
                volume = %volume,
                allocation_groups = superblock.ag_count,
                "scanning xfs volume"
            );
            xfs::trim_unused_blocks(disk, volume, &superblock)?;
            Ok(true)
        }
        FilesystemKind::Unrecognized => {
            debug!(volume = %volume, "unrecognized filesystem, leaving volume untouched");
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zf_disk::MemDisk;
    use zf_types::{BYTES_PER_SECTOR, EXT4_SUPER_MAGIC, XFS_SB_MAGIC};

    fn volume_with_ext4_magic() -> MemDisk {
        let mut bytes = vec![0_u8; 16 * BYTES_PER_SECTOR];
        let sb = 2 * BYTES_PER_SECTOR;
        bytes[sb + 0x38..sb + 0x3A].copy_from_slice(&EXT4_SUPER_MAGIC.to_le_bytes());
        bytes[sb + 0x18..sb + 0x1C].copy_from_slice(&2_u32.to_le_bytes()); // 4K blocks
        bytes[sb + 0x20..sb + 0x24].copy_from_slice(&32768_u32.to_le_bytes());
        bytes[sb + 0x04..sb + 0x08].copy_from_slice(&32768_u32.to_le_bytes());
        MemDisk::new(bytes).expect("disk")
    }

    #[test]
    fn sniff_finds_ext4() {
        let disk = volume_with_ext4_magic();
        let kind = sniff_filesystem(&disk, SectorRange::new(0, 16)).expect("sniff");
        assert!(matches!(kind, FilesystemKind::Ext4(_)));
    }

    #[test]
    fn sniff_finds_xfs() {
        let mut bytes = vec![0_u8; 16 * BYTES_PER_SECTOR];
        bytes[0..4].copy_from_slice(&XFS_SB_MAGIC.to_be_bytes());
        bytes[0x04..0x08].copy_from_slice(&4096_u32.to_be_bytes());
        bytes[0x54..0x58].copy_from_slice(&100_u32.to_be_bytes());
        bytes[0x58..0x5C].copy_from_slice(&1_u32.to_be_bytes());
        let disk = MemDisk::new(bytes).expect("disk");

        let kind = sniff_filesystem(&disk, SectorRange::new(0, 16)).expect("sniff");
        assert!(matches!(kind, FilesystemKind::Xfs(_)));
    }

    #[test]
    fn sniff_unknown_is_not_an_error() {
        let disk = MemDisk::zeroed(16).expect("disk");
        let kind = sniff_filesystem(&disk, SectorRange::new(0, 16)).expect("sniff");
        assert_eq!(kind, FilesystemKind::Unrecognized);
    }

    #[test]
    fn sniff_tiny_volume_is_unrecognized() {
        let disk = MemDisk::zeroed(16).expect("disk");
        let kind = sniff_filesystem(&disk, SectorRange::new(0, 0)).expect("sniff");
        assert_eq!(kind, FilesystemKind::Unrecognized);
    }

    #[test]
    fn valid_magic_with_bad_geometry_is_corruption() {
        let mut bytes = vec![0_u8; 16 * BYTES_PER_SECTOR];
        let sb = 2 * BYTES_PER_SECTOR;
        bytes[sb + 0x38..sb + 0x3A].copy_from_slice(&EXT4_SUPER_MAGIC.to_le_bytes());
        bytes[sb + 0x18..sb + 0x1C].copy_from_slice(&99_u32.to_le_bytes()); // absurd shift
        let disk = MemDisk::new(bytes).expect("disk");

        let error = sniff_filesystem(&disk, SectorRange::new(0, 16)).unwrap_err();
        assert!(matches!(error, ZfError::Corrupt { .. }));
    }

    #[test]
    fn unpartitioned_disk_scans_nothing() {
        let disk = MemDisk::zeroed(64).expect("disk");
        let trim = TrimmableDisk::new(Box::new(disk), 8).expect("trim");
        let summary = trim_free_space(&trim).expect("scan");
        assert_eq!(summary, ScanSummary::default());
        assert_eq!(trim.trimmable_block_count(), 0);
    }
}
