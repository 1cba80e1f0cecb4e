//! VMDK sparse extent header and grain-stream markers (little-endian).
//!
//! The header keeps its raw sector alongside the parsed fields: the rewrite
//! path re-emits the source header byte-for-byte with only `gdOffset`
//! patched, so reserved/padding bytes must survive untouched.

use zf_types::{
    bytes_to_sectors_ceil, ensure_slice, read_le_u16, read_le_u32, read_le_u64, write_le_u32,
    write_le_u64, ParseError, BYTES_PER_SECTOR, VMDK_HEADER_SIZE, VMDK_MARKER_SIZE,
    VMDK_SPARSE_MAGIC,
};

/// `flags` bit: grain payloads are compressed.
pub const VMDK_FLAG_COMPRESSED: u32 = 0x1_0000;
/// `flags` bit: the data stream uses metadata markers.
pub const VMDK_FLAG_MARKERS: u32 = 0x2_0000;
/// `compressAlgorithm` value for RFC 1950 zlib streams.
pub const VMDK_COMPRESSION_DEFLATE: u16 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SparseExtentHeader {
    pub version: u32,
    pub flags: u32,
    /// Virtual disk capacity in sectors.
    pub capacity: u64,
    /// Grain size in sectors.
    pub grain_size: u64,
    pub descriptor_offset: u64,
    pub descriptor_size: u64,
    pub num_gtes_per_gt: u32,
    pub rgd_offset: u64,
    pub gd_offset: u64,
    /// Metadata region size in sectors; grain data starts here.
    pub overhead: u64,
    pub compress_algorithm: u16,
    raw: [u8; VMDK_HEADER_SIZE],
}

impl SparseExtentHeader {
    /// Parse the header sector.
    pub fn parse(sector: &[u8]) -> Result<Self, ParseError> {
        let magic = read_le_u32(sector, 0x00)?;
        if magic != VMDK_SPARSE_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(VMDK_SPARSE_MAGIC),
                actual: u64::from(magic),
            });
        }
        let bytes = ensure_slice(sector, 0, VMDK_HEADER_SIZE)?;
        let mut raw = [0_u8; VMDK_HEADER_SIZE];
        raw.copy_from_slice(bytes);

        let header = Self {
            version: read_le_u32(sector, 0x04)?,
            flags: read_le_u32(sector, 0x08)?,
            capacity: read_le_u64(sector, 0x0C)?,
            grain_size: read_le_u64(sector, 0x14)?,
            descriptor_offset: read_le_u64(sector, 0x1C)?,
            descriptor_size: read_le_u64(sector, 0x24)?,
            num_gtes_per_gt: read_le_u32(sector, 0x2C)?,
            rgd_offset: read_le_u64(sector, 0x30)?,
            gd_offset: read_le_u64(sector, 0x38)?,
            overhead: read_le_u64(sector, 0x40)?,
            compress_algorithm: read_le_u16(sector, 0x4D)?,
            raw,
        };

        if header.grain_size == 0 {
            return Err(ParseError::InvalidField {
                field: "grainSize",
                reason: "cannot be zero",
            });
        }
        if header.num_gtes_per_gt == 0 {
            return Err(ParseError::InvalidField {
                field: "numGTEsPerGT",
                reason: "cannot be zero",
            });
        }
        Ok(header)
    }

    #[must_use]
    pub fn has_compressed_grains(&self) -> bool {
        self.flags & VMDK_FLAG_COMPRESSED != 0
    }

    #[must_use]
    pub fn uses_markers(&self) -> bool {
        self.flags & VMDK_FLAG_MARKERS != 0
    }

    /// Total number of grains covering the capacity.
    #[must_use]
    pub fn total_grains(&self) -> u64 {
        self.capacity.div_ceil(self.grain_size)
    }

    /// Number of grain tables in the grain directory.
    #[must_use]
    pub fn grain_table_count(&self) -> u64 {
        self.total_grains()
            .div_ceil(u64::from(self.num_gtes_per_gt))
    }

    /// Point `gdOffset` at a new grain-directory sector.
    pub fn set_gd_offset(&mut self, sector: u64) -> Result<(), ParseError> {
        self.gd_offset = sector;
        write_le_u64(&mut self.raw, 0x38, sector)
    }

    /// The header sector, reserved bytes preserved, current field values
    /// patched in.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; VMDK_HEADER_SIZE] {
        self.raw
    }
}

/// The 12-byte record prefix: a u64 value and a u32 payload size.
///
/// `size > 0` means a compressed grain (value = LBA); `size == 0` means a
/// metadata marker (value = payload sector count, type code at offset 12).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Marker {
    pub value: u64,
    pub size: u32,
}

impl Marker {
    pub fn parse(sector: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            value: read_le_u64(sector, 0)?,
            size: read_le_u32(sector, 8)?,
        })
    }

    #[must_use]
    pub fn is_grain(&self) -> bool {
        self.size > 0
    }

    /// Type code of a metadata marker (offset 12 of the marker sector).
    pub fn marker_type(sector: &[u8]) -> Result<u32, ParseError> {
        read_le_u32(sector, 12)
    }

    /// Total sectors spanned by a grain record with `size` payload bytes.
    #[must_use]
    pub fn grain_record_sectors(size: u32) -> u64 {
        bytes_to_sectors_ceil(VMDK_MARKER_SIZE as u64 + u64::from(size))
    }
}

/// Assemble a grain record: 12-byte marker, compressed payload, zero padding
/// to the next sector boundary.
pub fn build_grain_record(lba: u64, compressed: &[u8]) -> Result<Vec<u8>, ParseError> {
    let size = u32::try_from(compressed.len()).map_err(|_| ParseError::IntegerConversion {
        field: "compressed_grain_size",
    })?;
    let total_sectors = Marker::grain_record_sectors(size);
    let total_bytes = usize::try_from(total_sectors * BYTES_PER_SECTOR as u64).map_err(|_| {
        ParseError::IntegerConversion {
            field: "grain_record_bytes",
        }
    })?;

    let mut record = vec![0_u8; total_bytes];
    write_le_u64(&mut record, 0, lba)?;
    write_le_u32(&mut record, 8, size)?;
    record[VMDK_MARKER_SIZE..VMDK_MARKER_SIZE + compressed.len()].copy_from_slice(compressed);
    Ok(record)
}

/// Assemble a metadata marker record: one marker sector followed by the
/// sector-aligned payload.
pub fn build_metadata_record(marker_type: u32, payload: &[u8]) -> Result<Vec<u8>, ParseError> {
    let payload_sectors = bytes_to_sectors_ceil(payload.len() as u64);
    let total_bytes = usize::try_from((1 + payload_sectors) * BYTES_PER_SECTOR as u64).map_err(
        |_| ParseError::IntegerConversion {
            field: "metadata_record_bytes",
        },
    )?;

    let mut record = vec![0_u8; total_bytes];
    write_le_u64(&mut record, 0, payload_sectors)?;
    write_le_u32(&mut record, 12, marker_type)?;
    record[BYTES_PER_SECTOR..BYTES_PER_SECTOR + payload.len()].copy_from_slice(payload);
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use zf_types::{VMDK_MARKER_GD, VMDK_MARKER_GT};

    fn header_sector() -> Vec<u8> {
        let mut sector = vec![0_u8; VMDK_HEADER_SIZE];
        sector[0x00..0x04].copy_from_slice(&VMDK_SPARSE_MAGIC.to_le_bytes());
        sector[0x04..0x08].copy_from_slice(&3_u32.to_le_bytes());
        sector[0x08..0x0C]
            .copy_from_slice(&(VMDK_FLAG_COMPRESSED | VMDK_FLAG_MARKERS | 1).to_le_bytes());
        sector[0x0C..0x14].copy_from_slice(&(409_600_u64).to_le_bytes()); // 200 MiB
        sector[0x14..0x1C].copy_from_slice(&128_u64.to_le_bytes());
        sector[0x2C..0x30].copy_from_slice(&512_u32.to_le_bytes());
        sector[0x38..0x40].copy_from_slice(&u64::MAX.to_le_bytes());
        sector[0x40..0x48].copy_from_slice(&128_u64.to_le_bytes());
        sector[0x4D..0x4F].copy_from_slice(&VMDK_COMPRESSION_DEFLATE.to_le_bytes());
        sector[0x60] = 0x5A; // reserved/padding byte that must survive
        sector
    }

    #[test]
    fn parses_and_preserves_raw() {
        let sector = header_sector();
        let header = SparseExtentHeader::parse(&sector).expect("header");
        assert_eq!(header.capacity, 409_600);
        assert_eq!(header.grain_size, 128);
        assert_eq!(header.num_gtes_per_gt, 512);
        assert_eq!(header.overhead, 128);
        assert!(header.has_compressed_grains());
        assert!(header.uses_markers());
        assert_eq!(header.total_grains(), 3200);
        assert_eq!(header.grain_table_count(), 7);
        assert_eq!(header.to_bytes().to_vec(), sector);
    }

    #[test]
    fn gd_offset_patch_changes_only_that_field() {
        let sector = header_sector();
        let mut header = SparseExtentHeader::parse(&sector).expect("header");
        header.set_gd_offset(0x1234).expect("patch");

        let bytes = header.to_bytes();
        assert_eq!(read_le_u64(&bytes, 0x38).expect("gd"), 0x1234);
        // Everything else, padding included, is untouched.
        for (offset, (patched, original)) in bytes.iter().zip(sector.iter()).enumerate() {
            if !(0x38..0x40).contains(&offset) {
                assert_eq!(patched, original, "byte {offset:#x} changed");
            }
        }
    }

    #[test]
    fn wrong_magic_rejected() {
        let mut sector = header_sector();
        sector[0] = 0;
        assert!(matches!(
            SparseExtentHeader::parse(&sector),
            Err(ParseError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn marker_classification() {
        let mut sector = vec![0_u8; BYTES_PER_SECTOR];
        sector[0..8].copy_from_slice(&2048_u64.to_le_bytes());
        sector[8..12].copy_from_slice(&1000_u32.to_le_bytes());

        let marker = Marker::parse(&sector).expect("marker");
        assert!(marker.is_grain());
        assert_eq!(marker.value, 2048);
        assert_eq!(Marker::grain_record_sectors(marker.size), 2); // 12 + 1000 bytes

        sector[8..12].copy_from_slice(&0_u32.to_le_bytes());
        sector[12..16].copy_from_slice(&VMDK_MARKER_GD.to_le_bytes());
        let marker = Marker::parse(&sector).expect("marker");
        assert!(!marker.is_grain());
        assert_eq!(Marker::marker_type(&sector).expect("type"), VMDK_MARKER_GD);
    }

    #[test]
    fn grain_record_layout() {
        let payload = vec![0xEE_u8; 700];
        let record = build_grain_record(4096, &payload).expect("record");
        assert_eq!(record.len(), 2 * BYTES_PER_SECTOR); // 12 + 700 rounds to 2 sectors
        assert_eq!(read_le_u64(&record, 0).expect("lba"), 4096);
        assert_eq!(read_le_u32(&record, 8).expect("size"), 700);
        assert_eq!(&record[12..712], payload.as_slice());
        assert!(record[712..].iter().all(|b| *b == 0));
    }

    #[test]
    fn metadata_record_layout() {
        let table = vec![0xAB_u8; 2048];
        let record = build_metadata_record(VMDK_MARKER_GT, &table).expect("record");
        assert_eq!(record.len(), 5 * BYTES_PER_SECTOR);
        assert_eq!(read_le_u64(&record, 0).expect("sectors"), 4);
        assert_eq!(read_le_u32(&record, 8).expect("size"), 0);
        assert_eq!(read_le_u32(&record, 12).expect("type"), VMDK_MARKER_GT);
        assert_eq!(&record[BYTES_PER_SECTOR..], table.as_slice());
    }
}
