//! Random-access reading of VMDK images.
//!
//! Presents the virtual disk contents of a flat, monolithic-sparse, or
//! stream-optimized image as a `SectorDisk` so the filesystem scanners can
//! run against it. Grains resolve through the grain directory and grain
//! tables; absent entries read as zeros; compressed payloads are inflated
//! on demand with a one-grain cache (the scanners read mostly forward).

use std::path::Path;

use parking_lot::Mutex;
use tracing::debug;

use crate::compress;
use zf_disk::{RawDisk, SectorDisk};
use zf_error::{Result, ZfError};
use zf_ondisk::vmdk::VMDK_COMPRESSION_DEFLATE;
use zf_ondisk::{Marker, SparseExtentHeader};
use zf_types::{
    bytes_to_sectors_ceil, read_le_u32, ParseError, BYTES_PER_SECTOR, VMDK_GD_AT_END,
    VMDK_MARKER_SIZE,
};

/// A VMDK image opened for random-access virtual reads.
pub enum VmdkImage {
    /// Raw image: virtual contents equal file contents.
    Flat(RawDisk),
    Sparse(SparseImage),
}

impl VmdkImage {
    /// Open an image file, detecting the sub-format from its header.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let raw = RawDisk::open(path.as_ref())?;
        if raw.total_sectors() == 0 {
            return Err(ZfError::Format("image file is empty".to_owned()));
        }

        let first = raw.read_sectors(0, 1)?;
        match SparseExtentHeader::parse(&first) {
            Ok(header) => {
                debug!(path = %path.as_ref().display(), "opening sparse image");
                SparseImage::new(raw, header).map(Self::Sparse)
            }
            Err(ParseError::InvalidMagic { .. }) => {
                debug!(path = %path.as_ref().display(), "opening flat image");
                Ok(Self::Flat(raw))
            }
            Err(error) => Err(error.into()),
        }
    }

    /// True for the compressed, marker-framed stream-optimized sub-format.
    #[must_use]
    pub fn is_stream_optimized(&self) -> bool {
        match self {
            Self::Flat(_) => false,
            Self::Sparse(sparse) => sparse.compressed,
        }
    }

    /// The raw image file, as sectors.
    #[must_use]
    pub fn raw(&self) -> &RawDisk {
        match self {
            Self::Flat(raw) => raw,
            Self::Sparse(sparse) => &sparse.raw,
        }
    }

    /// The sparse header, when the image has one.
    #[must_use]
    pub fn header(&self) -> Option<&SparseExtentHeader> {
        match self {
            Self::Flat(_) => None,
            Self::Sparse(sparse) => Some(&sparse.header),
        }
    }
}

impl SectorDisk for VmdkImage {
    fn total_sectors(&self) -> u64 {
        match self {
            Self::Flat(raw) => raw.total_sectors(),
            Self::Sparse(sparse) => sparse.header.capacity,
        }
    }

    fn read_sectors(&self, first_sector: u64, sector_count: u64) -> Result<Vec<u8>> {
        match self {
            Self::Flat(raw) => raw.read_sectors(first_sector, sector_count),
            Self::Sparse(sparse) => sparse.read_sectors(first_sector, sector_count),
        }
    }
}

/// Sparse image state: header, grain directory, and per-grain resolution.
pub struct SparseImage {
    raw: RawDisk,
    header: SparseExtentHeader,
    /// Grain directory: sector of each grain table, 0 = table absent.
    directory: Vec<u32>,
    compressed: bool,
    /// Most recently used grain table: `(table index, entries)`.
    table_cache: Mutex<Option<(u64, Vec<u32>)>>,
    /// Most recently inflated grain: `(grain index, bytes)`.
    grain_cache: Mutex<Option<(u64, Vec<u8>)>>,
}

impl SparseImage {
    fn new(raw: RawDisk, mut header: SparseExtentHeader) -> Result<Self> {
        if header.gd_offset == VMDK_GD_AT_END {
            // Stream-optimized images keep the authoritative header in the
            // footer: ... GD, footer marker, footer, end-of-stream marker.
            let total = raw.total_sectors();
            if total < 3 {
                return Err(ZfError::Format(
                    "image too short to hold a footer".to_owned(),
                ));
            }
            let footer = raw.read_sectors(total - 2, 1)?;
            header = SparseExtentHeader::parse(&footer)
                .map_err(|error| ZfError::Format(format!("image footer: {error}")))?;
            if header.gd_offset == VMDK_GD_AT_END {
                return Err(ZfError::Format(
                    "footer does not locate the grain directory".to_owned(),
                ));
            }
        }

        let compressed = header.has_compressed_grains();
        if compressed && header.compress_algorithm != VMDK_COMPRESSION_DEFLATE {
            return Err(ZfError::Unsupported(format!(
                "compression algorithm {} (only deflate is supported)",
                header.compress_algorithm
            )));
        }

        let table_count = header.grain_table_count();
        let directory_bytes = raw.read_sectors(
            header.gd_offset,
            bytes_to_sectors_ceil(table_count.checked_mul(4).ok_or(ZfError::Overflow(
                "grain directory size",
            ))?),
        )?;
        let table_count = usize::try_from(table_count)
            .map_err(|_| ZfError::Overflow("grain directory length"))?;
        let mut directory = Vec::with_capacity(table_count);
        for index in 0..table_count {
            directory.push(read_le_u32(&directory_bytes, index * 4)?);
        }

        Ok(Self {
            raw,
            header,
            directory,
            compressed,
            table_cache: Mutex::new(None),
            grain_cache: Mutex::new(None),
        })
    }

    fn read_sectors(&self, first_sector: u64, sector_count: u64) -> Result<Vec<u8>> {
        let end = first_sector
            .checked_add(sector_count)
            .ok_or(ZfError::Overflow("virtual read end"))?;
        if end > self.header.capacity {
            return Err(ZfError::Format(format!(
                "virtual read out of bounds: sector={first_sector} count={sector_count} capacity={}",
                self.header.capacity
            )));
        }

        let mut out = Vec::with_capacity(
            usize::try_from(sector_count * BYTES_PER_SECTOR as u64)
                .map_err(|_| ZfError::Overflow("virtual read length"))?,
        );
        let grain_size = self.header.grain_size;
        let mut sector = first_sector;
        while sector < end {
            let grain_index = sector / grain_size;
            let offset_in_grain = sector % grain_size;
            let take = (grain_size - offset_in_grain).min(end - sector);

            let from = usize::try_from(offset_in_grain * BYTES_PER_SECTOR as u64)
                .map_err(|_| ZfError::Overflow("grain offset"))?;
            let len = usize::try_from(take * BYTES_PER_SECTOR as u64)
                .map_err(|_| ZfError::Overflow("grain slice length"))?;
            match self.grain_data(grain_index)? {
                Some(grain) => out.extend_from_slice(&grain[from..from + len]),
                None => out.resize(out.len() + len, 0),
            }
            sector += take;
        }
        Ok(out)
    }

    /// The full contents of one grain, or `None` when it is unallocated.
    fn grain_data(&self, grain_index: u64) -> Result<Option<Vec<u8>>> {
        {
            let cache = self.grain_cache.lock();
            if let Some((cached_index, bytes)) = cache.as_ref() {
                if *cached_index == grain_index {
                    return Ok(Some(bytes.clone()));
                }
            }
        }

        let Some(grain_sector) = self.locate_grain(grain_index)? else {
            return Ok(None);
        };

        let grain_bytes =
            usize::try_from(self.header.grain_size * BYTES_PER_SECTOR as u64)
                .map_err(|_| ZfError::Overflow("grain length"))?;
        let data = if self.compressed {
            let marker_sector = self.raw.read_sectors(grain_sector, 1)?;
            let marker = Marker::parse(&marker_sector)?;
            if !marker.is_grain() {
                return Err(ZfError::Format(format!(
                    "grain table points at a non-grain record (sector {grain_sector})"
                )));
            }
            let record = self
                .raw
                .read_sectors(grain_sector, Marker::grain_record_sectors(marker.size))?;
            let payload = &record[VMDK_MARKER_SIZE..VMDK_MARKER_SIZE + marker.size as usize];
            compress::decompress(payload, grain_bytes)?
        } else {
            self.raw.read_sectors(grain_sector, self.header.grain_size)?
        };

        let mut cache = self.grain_cache.lock();
        *cache = Some((grain_index, data.clone()));
        drop(cache);
        Ok(Some(data))
    }

    /// Sector of the grain's record (compressed) or data (uncompressed), or
    /// `None` when the directory/table has no entry.
    fn locate_grain(&self, grain_index: u64) -> Result<Option<u64>> {
        let entries_per_table = u64::from(self.header.num_gtes_per_gt);
        let table_index = grain_index / entries_per_table;
        let entry_index = grain_index % entries_per_table;

        let slot =
            usize::try_from(table_index).map_err(|_| ZfError::Overflow("grain table index"))?;
        let table_sector = match self.directory.get(slot).copied() {
            None | Some(0) => return Ok(None),
            Some(sector) => u64::from(sector),
        };

        {
            let cache = self.table_cache.lock();
            if let Some((cached_index, entries)) = cache.as_ref() {
                if *cached_index == table_index {
                    let entry = entries[entry_index as usize];
                    return Ok((entry != 0).then_some(u64::from(entry)));
                }
            }
        }

        let table_bytes = self.raw.read_sectors(
            table_sector,
            bytes_to_sectors_ceil(entries_per_table * 4),
        )?;
        let mut entries = Vec::with_capacity(entries_per_table as usize);
        for index in 0..entries_per_table as usize {
            entries.push(read_le_u32(&table_bytes, index * 4)?);
        }
        let entry = entries[entry_index as usize];

        let mut cache = self.table_cache.lock();
        *cache = Some((table_index, entries));
        drop(cache);
        Ok((entry != 0).then_some(u64::from(entry)))
    }
}
