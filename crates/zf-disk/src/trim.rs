//! Trimmable-disk decorator.
//!
//! Owns one liveness bitmap over an underlying disk: one bit per trim block
//! (a fixed span of sectors), set once a scanner has proven the block free.
//! Reads delegate to the underlying disk and then zero-fill every fully
//! covered block whose bit is set. The bitmap is mutated only during the
//! single-threaded scan phase; the rewrite pipeline reads it concurrently
//! but never writes, so a plain mutex is enough.

use parking_lot::Mutex;
use tracing::debug;

use crate::SectorDisk;
use zf_error::{Result, ZfError};
use zf_types::BYTES_PER_SECTOR;

/// Classification of a sector range against the trim bitmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrimState {
    /// No trim block overlapping the range is marked.
    AllLive,
    /// Every trim block overlapping the range is marked.
    AllTrimmable,
    /// Some overlapping blocks are marked and some are not.
    Mixed,
}

/// Read-only decorator that surfaces trimmed blocks as zeros.
pub struct TrimmableDisk {
    inner: Box<dyn SectorDisk>,
    trim_block_sectors: u64,
    bitmap: Mutex<Vec<u8>>,
}

impl std::fmt::Debug for TrimmableDisk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrimmableDisk")
            .field("trim_block_sectors", &self.trim_block_sectors)
            .finish_non_exhaustive()
    }
}

impl TrimmableDisk {
    /// Wrap `inner` with a trim bitmap at `trim_block_sectors` granularity.
    ///
    /// The underlying disk's sector count must be divisible by
    /// `trim_block_sectors`.
    pub fn new(inner: Box<dyn SectorDisk>, trim_block_sectors: u64) -> Result<Self> {
        if trim_block_sectors == 0 {
            return Err(ZfError::InvalidConfiguration(
                "trim block size must be non-zero".to_owned(),
            ));
        }
        let total = inner.total_sectors();
        if total % trim_block_sectors != 0 {
            return Err(ZfError::InvalidConfiguration(format!(
                "total sectors {total} not divisible by trim block size {trim_block_sectors}"
            )));
        }

        let block_count = total / trim_block_sectors;
        let bitmap_len = usize::try_from(block_count.div_ceil(8))
            .map_err(|_| ZfError::Overflow("trim bitmap length"))?;
        Ok(Self {
            inner,
            trim_block_sectors,
            bitmap: Mutex::new(vec![0_u8; bitmap_len]),
        })
    }

    #[must_use]
    pub fn trim_block_sectors(&self) -> u64 {
        self.trim_block_sectors
    }

    /// Mark a sector range as trimmable.
    ///
    /// Both bounds must align to the trim-block size; a misaligned call is a
    /// contract violation by the calling scanner, not a recoverable state.
    pub fn mark_trimmable(&self, first_sector: u64, sector_count: u64) -> Result<()> {
        let block = self.trim_block_sectors;
        if first_sector % block != 0 || sector_count % block != 0 {
            return Err(ZfError::Misaligned {
                sector: first_sector,
                count: sector_count,
                trim_block: block,
            });
        }
        let end = first_sector
            .checked_add(sector_count)
            .ok_or(ZfError::Overflow("trim range end"))?;
        if end > self.inner.total_sectors() {
            return Err(ZfError::InvalidConfiguration(format!(
                "trim range {first_sector}+{sector_count} beyond device end"
            )));
        }

        let first_block = first_sector / block;
        let block_count = sector_count / block;
        let mut bitmap = self.bitmap.lock();
        for index in first_block..first_block + block_count {
            set_bit(&mut bitmap, index);
        }
        drop(bitmap);
        debug!(first_sector, sector_count, "marked trimmable");
        Ok(())
    }

    /// Classify the trim blocks overlapping `[first_sector, +sector_count)`.
    pub fn trim_state(&self, first_sector: u64, sector_count: u64) -> Result<TrimState> {
        if sector_count == 0 {
            return Err(ZfError::InvalidConfiguration(
                "trim_state range must be non-empty".to_owned(),
            ));
        }
        let end = first_sector
            .checked_add(sector_count)
            .ok_or(ZfError::Overflow("trim query end"))?;
        if end > self.inner.total_sectors() {
            return Err(ZfError::InvalidConfiguration(format!(
                "trim query {first_sector}+{sector_count} beyond device end"
            )));
        }

        let first_block = first_sector / self.trim_block_sectors;
        let last_block = (end - 1) / self.trim_block_sectors;
        let bitmap = self.bitmap.lock();
        let mut any_set = false;
        let mut any_clear = false;
        for index in first_block..=last_block {
            if get_bit(&bitmap, index) {
                any_set = true;
            } else {
                any_clear = true;
            }
            if any_set && any_clear {
                return Ok(TrimState::Mixed);
            }
        }
        Ok(if any_set {
            TrimState::AllTrimmable
        } else {
            TrimState::AllLive
        })
    }

    /// Zero-fill every trimmed block fully covered by `data`.
    ///
    /// `data` holds the sectors starting at `first_sector`. Blocks only
    /// partially covered at either end are left untouched; callers wanting
    /// fully defined behavior query block-aligned ranges.
    pub fn apply_trim(&self, data: &mut [u8], first_sector: u64) -> Result<()> {
        if data.len() % BYTES_PER_SECTOR != 0 {
            return Err(ZfError::InvalidConfiguration(format!(
                "buffer length {} is not sector-aligned",
                data.len()
            )));
        }
        let sector_count = (data.len() / BYTES_PER_SECTOR) as u64;
        let end = first_sector
            .checked_add(sector_count)
            .ok_or(ZfError::Overflow("trim apply end"))?;

        let block = self.trim_block_sectors;
        let block_bytes = usize::try_from(block)
            .map_err(|_| ZfError::Overflow("trim block bytes"))?
            * BYTES_PER_SECTOR;

        // First block whose start lies within the buffer.
        let mut block_start = first_sector.div_ceil(block) * block;
        let bitmap = self.bitmap.lock();
        while block_start + block <= end {
            if get_bit(&bitmap, block_start / block) {
                let offset = usize::try_from((block_start - first_sector) * BYTES_PER_SECTOR as u64)
                    .map_err(|_| ZfError::Overflow("trim apply offset"))?;
                data[offset..offset + block_bytes].fill(0);
            }
            block_start += block;
        }
        Ok(())
    }

    /// Number of trim blocks currently marked (for end-of-run reporting).
    #[must_use]
    pub fn trimmable_block_count(&self) -> u64 {
        let bitmap = self.bitmap.lock();
        bitmap.iter().map(|byte| u64::from(byte.count_ones())).sum()
    }
}

impl SectorDisk for TrimmableDisk {
    fn total_sectors(&self) -> u64 {
        self.inner.total_sectors()
    }

    fn read_sectors(&self, first_sector: u64, sector_count: u64) -> Result<Vec<u8>> {
        let mut data = self.inner.read_sectors(first_sector, sector_count)?;
        self.apply_trim(&mut data, first_sector)?;
        Ok(data)
    }
}

fn get_bit(bitmap: &[u8], index: u64) -> bool {
    let byte = (index / 8) as usize;
    let bit = index % 8;
    byte < bitmap.len() && (bitmap[byte] >> bit) & 1 == 1
}

fn set_bit(bitmap: &mut [u8], index: u64) {
    let byte = (index / 8) as usize;
    let bit = index % 8;
    if byte < bitmap.len() {
        bitmap[byte] |= 1 << bit;
    }
}
