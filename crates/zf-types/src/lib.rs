#![forbid(unsafe_code)]
//! Shared constants, endian helpers, and the parse-layer error type.
//!
//! Pure data crate — no I/O. Every on-disk structure in the workspace is
//! decoded through the bounds-checked readers defined here. Endianness is
//! per-format: VMDK, ext4, MBR, and LVM metadata are little-endian; xfs is
//! big-endian. Both families of helpers live side by side so parsing code
//! states its convention explicitly at every read.

use std::fmt;
use thiserror::Error;

/// Sector size used for all image-level addressing.
pub const BYTES_PER_SECTOR: usize = 512;

// ── ext4 ────────────────────────────────────────────────────────────────────

/// Byte offset of the primary ext4 superblock from the start of the volume.
pub const EXT4_SUPERBLOCK_OFFSET: u64 = 1024;
/// Size of the ext4 superblock structure.
pub const EXT4_SUPERBLOCK_SIZE: usize = 1024;
pub const EXT4_SUPER_MAGIC: u16 = 0xEF53;
/// `s_feature_incompat` bit: 64-bit block counts and wide group descriptors.
pub const EXT4_INCOMPAT_64BIT: u32 = 0x80;
/// Group descriptor size when the 64-bit feature is absent.
pub const EXT4_LEGACY_DESC_SIZE: u16 = 32;

// ── xfs ─────────────────────────────────────────────────────────────────────

/// "XFSB"
pub const XFS_SB_MAGIC: u32 = 0x5846_5342;
/// "XAGF"
pub const XFS_AGF_MAGIC: u32 = 0x5841_4746;
/// "ABTB" — free space by block, v4 nodes.
pub const XFS_ABTB_MAGIC: u32 = 0x4142_5442;
/// "AB3B" — free space by block, v5 nodes.
pub const XFS_ABTB_CRC_MAGIC: u32 = 0x4142_3342;
/// "ABTC" — free space by size, v4 nodes.
pub const XFS_ABTC_MAGIC: u32 = 0x4142_5443;
/// "AB3C" — free space by size, v5 nodes.
pub const XFS_ABTC_CRC_MAGIC: u32 = 0x4142_3343;
/// Null AG-relative block pointer (sibling/terminator sentinel).
pub const XFS_NULL_AGBLOCK: u32 = 0xFFFF_FFFF;

// ── LVM ─────────────────────────────────────────────────────────────────────

/// MD_SB_MAGIC — Linux RAID superblock wrapper around an LVM physical volume.
pub const MD_SB_MAGIC: u32 = 0xA92B_4EFC;
/// "LABELONE" — LVM physical-volume label.
pub const LVM_LABEL_MAGIC: u64 = 0x454E_4F4C_4542_414C;
/// "LVM2 x[5A%r0N*>" metadata-area signature, split into two u64 reads.
pub const LVM2_METADATA_MAGIC_LO: u64 = 0x5B78_2032_4D56_4C20;
pub const LVM2_METADATA_MAGIC_HI: u64 = 0x3E2A_4E30_7225_4135;

// ── MBR ─────────────────────────────────────────────────────────────────────

/// Boot signature at the end of sector 0.
pub const MBR_BOOT_SIGNATURE: u16 = 0xAA55;
pub const MBR_PARTITION_TYPE_LINUX: u8 = 0x83;
pub const MBR_PARTITION_TYPE_LINUX_RAID: u8 = 0xFD;

// ── VMDK ────────────────────────────────────────────────────────────────────

/// "KDMV" as read little-endian from the first four header bytes.
pub const VMDK_SPARSE_MAGIC: u32 = 0x564D_444B;
/// Size of the sparse extent header (one sector).
pub const VMDK_HEADER_SIZE: usize = 512;
/// Marker header: u64 value + u32 size field.
pub const VMDK_MARKER_SIZE: usize = 12;
/// `gdOffset` sentinel meaning "the grain directory lives in the footer".
pub const VMDK_GD_AT_END: u64 = 0xFFFF_FFFF_FFFF_FFFF;

pub const VMDK_MARKER_EOS: u32 = 0;
pub const VMDK_MARKER_GT: u32 = 1;
pub const VMDK_MARKER_GD: u32 = 2;
pub const VMDK_MARKER_FOOTER: u32 = 3;

// ── Parse-layer errors ──────────────────────────────────────────────────────

/// Error produced while decoding on-disk bytes into typed structures.
///
/// Runtime errors (I/O, corruption at a known volume, unsupported
/// configurations) live in `zf-error`; this type only covers byte-level
/// decoding and is converted at crate boundaries.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn read_be_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_be_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_be_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_be_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

fn ensure_slice_mut(data: &mut [u8], offset: usize, len: usize) -> Result<&mut [u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&mut data[offset..end])
}

#[inline]
pub fn write_le_u16(data: &mut [u8], offset: usize, value: u16) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 2)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u32(data: &mut [u8], offset: usize, value: u32) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 4)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u64(data: &mut [u8], offset: usize, value: u64) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 8)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

/// Strip trailing NULs and whitespace from a fixed-width name field.
#[must_use]
pub fn trim_nul_padded(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim().to_owned()
}

/// ext4 block size from `s_log_block_size` (`1024 << log`).
#[must_use]
pub fn ext4_block_size_from_log(log_block_size: u32) -> Option<u32> {
    let shift = 10_u32.checked_add(log_block_size)?;
    1_u32.checked_shl(shift)
}

/// Narrow a `u64` to `usize` with an explicit error path.
pub fn u64_to_usize(value: u64, field: &'static str) -> Result<usize, ParseError> {
    usize::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

/// Narrow a `u64` to `u32` with an explicit error path.
pub fn u64_to_u32(value: u64, field: &'static str) -> Result<u32, ParseError> {
    u32::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

/// Number of sectors needed to hold `bytes` bytes.
#[must_use]
pub fn bytes_to_sectors_ceil(bytes: u64) -> u64 {
    bytes.div_ceil(BYTES_PER_SECTOR as u64)
}

/// A half-open sector range on some disk.
///
/// Used for everything from partitions to LVM-resolved logical volumes; the
/// disk it refers to travels separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectorRange {
    pub first_sector: u64,
    pub sector_count: u64,
}

impl SectorRange {
    #[must_use]
    pub fn new(first_sector: u64, sector_count: u64) -> Self {
        Self {
            first_sector,
            sector_count,
        }
    }

    /// One-past-the-end sector, or `None` on overflow.
    #[must_use]
    pub fn end_sector(self) -> Option<u64> {
        self.first_sector.checked_add(self.sector_count)
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        self.sector_count == 0
    }
}

impl fmt::Display for SectorRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}..+{})",
            self.first_sector, self.sector_count
        )
    }
}
