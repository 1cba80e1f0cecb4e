#![forbid(unsafe_code)]
//! Sector-addressed disk access.
//!
//! Provides the read-only [`SectorDisk`] trait, file- and memory-backed
//! implementations, the [`TrimmableDisk`] decorator that owns the per-block
//! liveness bitmap, and buffered strictly-sequential reader/writer wrappers
//! used by the image rewrite path.
//!
//! The trait is read-only on purpose: every consumer in this workspace
//! classifies or copies data, nothing mutates a source disk. The original
//! write-path escape hatch (a write method that always failed) is therefore
//! expressed at the type level instead.

pub mod stream;
pub mod trim;

pub use stream::{SequentialDiskReader, SequentialImageWriter};
pub use trim::{TrimState, TrimmableDisk};

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

use zf_error::{Result, ZfError};
use zf_types::BYTES_PER_SECTOR;

/// Read-only sector-addressed device.
pub trait SectorDisk: Send + Sync {
    /// Sector size in bytes (512 for every format this tool handles).
    fn bytes_per_sector(&self) -> usize {
        BYTES_PER_SECTOR
    }

    /// Total number of sectors.
    fn total_sectors(&self) -> u64;

    /// Read `sector_count` sectors starting at `first_sector`.
    ///
    /// The returned buffer is exactly `sector_count * bytes_per_sector()`
    /// long; short reads are errors.
    fn read_sectors(&self, first_sector: u64, sector_count: u64) -> Result<Vec<u8>>;
}

/// Compute the byte extent of a sector range, validating it against the
/// device size. Shared by the concrete disk implementations.
pub(crate) fn sector_range_bytes(
    first_sector: u64,
    sector_count: u64,
    total_sectors: u64,
) -> Result<(u64, usize)> {
    let end = first_sector
        .checked_add(sector_count)
        .ok_or(ZfError::Overflow("sector range end"))?;
    if end > total_sectors {
        return Err(ZfError::Format(format!(
            "read out of bounds: sector={first_sector} count={sector_count} total={total_sectors}"
        )));
    }
    let offset = first_sector
        .checked_mul(BYTES_PER_SECTOR as u64)
        .ok_or(ZfError::Overflow("sector byte offset"))?;
    let len = usize::try_from(
        sector_count
            .checked_mul(BYTES_PER_SECTOR as u64)
            .ok_or(ZfError::Overflow("sector byte length"))?,
    )
    .map_err(|_| ZfError::Overflow("read length does not fit usize"))?;
    Ok((offset, len))
}

/// File-backed raw disk using positional reads.
///
/// `read_exact_at` does not touch a shared seek position, so a `RawDisk`
/// can be shared across the pipeline threads without locking.
#[derive(Debug, Clone)]
pub struct RawDisk {
    file: Arc<File>,
    total_sectors: u64,
}

impl RawDisk {
    /// Open a raw image file. The file length must be sector-aligned.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let len = file.metadata()?.len();
        Self::from_file(file, len)
    }

    pub fn from_file(file: File, len_bytes: u64) -> Result<Self> {
        let sector = BYTES_PER_SECTOR as u64;
        if len_bytes % sector != 0 {
            return Err(ZfError::InvalidConfiguration(format!(
                "image length {len_bytes} is not a multiple of the sector size"
            )));
        }
        Ok(Self {
            file: Arc::new(file),
            total_sectors: len_bytes / sector,
        })
    }

    #[must_use]
    pub fn file(&self) -> &Arc<File> {
        &self.file
    }
}

impl SectorDisk for RawDisk {
    fn total_sectors(&self) -> u64 {
        self.total_sectors
    }

    fn read_sectors(&self, first_sector: u64, sector_count: u64) -> Result<Vec<u8>> {
        let (offset, len) = sector_range_bytes(first_sector, sector_count, self.total_sectors)?;
        let mut buf = vec![0_u8; len];
        self.file.read_exact_at(&mut buf, offset)?;
        Ok(buf)
    }
}

/// Memory-backed disk for fixtures and tests.
#[derive(Debug, Clone)]
pub struct MemDisk {
    bytes: Arc<Vec<u8>>,
    total_sectors: u64,
}

impl MemDisk {
    /// Wrap a byte buffer; the length must be sector-aligned.
    pub fn new(bytes: Vec<u8>) -> Result<Self> {
        let sector = BYTES_PER_SECTOR as u64;
        let len = bytes.len() as u64;
        if len % sector != 0 {
            return Err(ZfError::InvalidConfiguration(format!(
                "buffer length {len} is not a multiple of the sector size"
            )));
        }
        Ok(Self {
            bytes: Arc::new(bytes),
            total_sectors: len / sector,
        })
    }

    /// An all-zero disk of the given size.
    pub fn zeroed(total_sectors: u64) -> Result<Self> {
        let len = total_sectors
            .checked_mul(BYTES_PER_SECTOR as u64)
            .and_then(|bytes| usize::try_from(bytes).ok())
            .ok_or(ZfError::Overflow("memory disk length"))?;
        Self::new(vec![0_u8; len])
    }
}

impl SectorDisk for MemDisk {
    fn total_sectors(&self) -> u64 {
        self.total_sectors
    }

    fn read_sectors(&self, first_sector: u64, sector_count: u64) -> Result<Vec<u8>> {
        let (offset, len) = sector_range_bytes(first_sector, sector_count, self.total_sectors)?;
        let offset = usize::try_from(offset).map_err(|_| ZfError::Overflow("memory offset"))?;
        Ok(self.bytes[offset..offset + len].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn mem_disk_rejects_unaligned_length() {
        assert!(MemDisk::new(vec![0_u8; 511]).is_err());
        assert!(MemDisk::new(vec![0_u8; 1024]).is_ok());
    }

    #[test]
    fn mem_disk_reads_expected_range() {
        let mut bytes = vec![0_u8; 4 * BYTES_PER_SECTOR];
        bytes[2 * BYTES_PER_SECTOR] = 0xAB;
        let disk = MemDisk::new(bytes).expect("disk");

        let read = disk.read_sectors(2, 1).expect("read");
        assert_eq!(read.len(), BYTES_PER_SECTOR);
        assert_eq!(read[0], 0xAB);

        assert!(disk.read_sectors(3, 2).is_err());
        assert!(disk.read_sectors(u64::MAX, 1).is_err());
    }

    #[test]
    fn raw_disk_reads_file_contents() {
        let mut tmp = tempfile::NamedTempFile::new().expect("tempfile");
        let mut image = vec![0_u8; 3 * BYTES_PER_SECTOR];
        image[BYTES_PER_SECTOR] = 0x5A;
        tmp.write_all(&image).expect("write");
        tmp.flush().expect("flush");

        let disk = RawDisk::open(tmp.path()).expect("open");
        assert_eq!(disk.total_sectors(), 3);
        let read = disk.read_sectors(1, 1).expect("read");
        assert_eq!(read[0], 0x5A);
    }

    #[test]
    fn raw_disk_rejects_unaligned_file() {
        let mut tmp = tempfile::NamedTempFile::new().expect("tempfile");
        tmp.write_all(&[0_u8; 100]).expect("write");
        tmp.flush().expect("flush");
        assert!(RawDisk::open(tmp.path()).is_err());
    }
}
