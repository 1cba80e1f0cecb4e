//! Destination image writers.
//!
//! Every sink accepts the virtual disk contents as a strictly sequential
//! sector stream and materializes one of the three output sub-formats.
//! Zero grains are never stored by the sparse sinks, which is what turns
//! trimmed (zero-read) blocks into reclaimed space.

use std::fs::File;
use std::os::unix::fs::FileExt;

use tracing::debug;

use crate::compress::{self, CompressionEffort};
use zf_disk::SequentialImageWriter;
use zf_error::{Result, ZfError};
use zf_ondisk::vmdk::{
    build_grain_record, build_metadata_record, VMDK_COMPRESSION_DEFLATE, VMDK_FLAG_COMPRESSED,
    VMDK_FLAG_MARKERS,
};
use zf_ondisk::SparseExtentHeader;
use zf_types::{
    bytes_to_sectors_ceil, write_le_u16, write_le_u32, write_le_u64, BYTES_PER_SECTOR,
    VMDK_GD_AT_END, VMDK_HEADER_SIZE, VMDK_MARKER_EOS, VMDK_MARKER_FOOTER, VMDK_MARKER_GD,
    VMDK_MARKER_GT, VMDK_SPARSE_MAGIC,
};

/// Default grain geometry for created images: 64 KiB grains, 512 GTEs.
pub const DEFAULT_GRAIN_SECTORS: u64 = 128;
pub const DEFAULT_GTES_PER_GT: u32 = 512;

/// `flags` bit 0: newline detection sequence is valid.
const FLAG_NEWLINE_VALID: u32 = 0x1;

/// Sequential sector-stream consumer producing a destination image.
pub trait ImageSink {
    /// Append whole sectors of virtual disk content.
    fn write_sectors(&mut self, data: &[u8]) -> Result<()>;

    /// Complete the image (flush data, write metadata). Must be called
    /// exactly once, after all content has been written.
    fn finalize(&mut self) -> Result<()>;

    /// Virtual sectors accepted so far.
    fn position(&self) -> u64;
}

fn is_all_zero(data: &[u8]) -> bool {
    data.iter().all(|byte| *byte == 0)
}

/// Serialize a sparse extent header from scratch.
fn build_sparse_header(
    flags: u32,
    capacity: u64,
    grain_size: u64,
    num_gtes_per_gt: u32,
    gd_offset: u64,
    overhead: u64,
    compress_algorithm: u16,
) -> Result<SparseExtentHeader> {
    let mut sector = vec![0_u8; VMDK_HEADER_SIZE];
    write_le_u32(&mut sector, 0x00, VMDK_SPARSE_MAGIC)?;
    write_le_u32(&mut sector, 0x04, 3)?; // version
    write_le_u32(&mut sector, 0x08, flags)?;
    write_le_u64(&mut sector, 0x0C, capacity)?;
    write_le_u64(&mut sector, 0x14, grain_size)?;
    write_le_u32(&mut sector, 0x2C, num_gtes_per_gt)?;
    write_le_u64(&mut sector, 0x38, gd_offset)?;
    write_le_u64(&mut sector, 0x40, overhead)?;
    sector[0x49] = b'\n';
    sector[0x4A] = b' ';
    sector[0x4B] = b'\r';
    sector[0x4C] = b'\n';
    write_le_u16(&mut sector, 0x4D, compress_algorithm)?;
    Ok(SparseExtentHeader::parse(&sector)?)
}

// ── Flat ────────────────────────────────────────────────────────────────────

/// Writes virtual contents byte-for-byte; trimmed blocks become literal
/// zero sectors in the output file.
pub struct FlatImageSink {
    writer: SequentialImageWriter,
    finalized: bool,
}

impl FlatImageSink {
    #[must_use]
    pub fn new(file: File) -> Self {
        Self {
            writer: SequentialImageWriter::new(file),
            finalized: false,
        }
    }
}

impl ImageSink for FlatImageSink {
    fn write_sectors(&mut self, data: &[u8]) -> Result<()> {
        self.writer.write(data)
    }

    fn finalize(&mut self) -> Result<()> {
        if self.finalized {
            return Err(ZfError::InvalidConfiguration(
                "sink already finalized".to_owned(),
            ));
        }
        self.finalized = true;
        self.writer.flush()
    }

    fn position(&self) -> u64 {
        self.writer.position()
    }
}

// ── Monolithic sparse ───────────────────────────────────────────────────────

/// Monolithic sparse image: metadata region (header, grain directory, and
/// preallocated grain tables) up front, uncompressed grains appended behind
/// it. Grain tables are patched in place during finalize.
pub struct MonolithicSparseSink {
    writer: SequentialImageWriter,
    metadata_file: File,
    header: SparseExtentHeader,
    /// One entry per grain across all tables; 0 = grain absent.
    entries: Vec<u32>,
    /// File sector where the grain-table region starts.
    table_base: u64,
    pending: Vec<u8>,
    next_grain: u64,
    virtual_position: u64,
    finalized: bool,
}

impl MonolithicSparseSink {
    pub fn create(file: File, capacity_sectors: u64) -> Result<Self> {
        let grain_size = DEFAULT_GRAIN_SECTORS;
        let num_gtes = DEFAULT_GTES_PER_GT;
        let total_grains = capacity_sectors.div_ceil(grain_size);
        let table_count = total_grains.div_ceil(u64::from(num_gtes));

        let gd_sectors = bytes_to_sectors_ceil(table_count * 4);
        let table_sectors = bytes_to_sectors_ceil(u64::from(num_gtes) * 4);
        let table_base = 1 + gd_sectors;
        let metadata_end = table_base + table_count * table_sectors;
        // Grain data starts grain-aligned.
        let overhead = metadata_end.div_ceil(grain_size) * grain_size;

        let header = build_sparse_header(
            FLAG_NEWLINE_VALID,
            capacity_sectors,
            grain_size,
            num_gtes,
            1,
            overhead,
            0,
        )?;

        let metadata_file = file.try_clone()?;
        let mut writer = SequentialImageWriter::new(file);
        writer.write(&header.to_bytes())?;

        // The directory is complete at creation: every table slot is
        // preallocated whether or not it ends up holding grains.
        let gd_bytes = usize::try_from(gd_sectors * BYTES_PER_SECTOR as u64)
            .map_err(|_| ZfError::Overflow("grain directory size"))?;
        let mut directory = vec![0_u8; gd_bytes];
        for table in 0..table_count {
            let sector = table_base + table * table_sectors;
            let value = u32::try_from(sector).map_err(|_| ZfError::Overflow("grain table sector"))?;
            let offset = usize::try_from(table * 4)
                .map_err(|_| ZfError::Overflow("grain directory offset"))?;
            write_le_u32(&mut directory, offset, value)?;
        }
        writer.write(&directory)?;

        let tables_and_padding = usize::try_from((overhead - table_base) * BYTES_PER_SECTOR as u64)
            .map_err(|_| ZfError::Overflow("metadata region size"))?;
        writer.write(&vec![0_u8; tables_and_padding])?;

        let entries = vec![
            0_u32;
            usize::try_from(table_count * u64::from(num_gtes))
                .map_err(|_| ZfError::Overflow("grain table entries"))?
        ];

        debug!(capacity_sectors, overhead, table_count, "created monolithic sparse layout");
        Ok(Self {
            writer,
            metadata_file,
            header,
            entries,
            table_base,
            pending: Vec::new(),
            next_grain: 0,
            virtual_position: 0,
            finalized: false,
        })
    }

    fn grain_bytes(&self) -> usize {
        self.header.grain_size as usize * BYTES_PER_SECTOR
    }

    fn flush_full_grains(&mut self) -> Result<()> {
        let grain_bytes = self.grain_bytes();
        while self.pending.len() >= grain_bytes {
            let rest = self.pending.split_off(grain_bytes);
            let grain = std::mem::replace(&mut self.pending, rest);
            self.emit_grain(&grain)?;
        }
        Ok(())
    }

    fn emit_grain(&mut self, grain: &[u8]) -> Result<()> {
        let index = usize::try_from(self.next_grain)
            .map_err(|_| ZfError::Overflow("grain index"))?;
        if index >= self.entries.len() {
            return Err(ZfError::Format(
                "more grains written than the capacity allows".to_owned(),
            ));
        }
        if !is_all_zero(grain) {
            let sector = u32::try_from(self.writer.position())
                .map_err(|_| ZfError::Overflow("grain sector"))?;
            self.entries[index] = sector;
            self.writer.write(grain)?;
        }
        self.next_grain += 1;
        Ok(())
    }
}

impl ImageSink for MonolithicSparseSink {
    fn write_sectors(&mut self, data: &[u8]) -> Result<()> {
        if data.len() % BYTES_PER_SECTOR != 0 {
            return Err(ZfError::InvalidConfiguration(format!(
                "write length {} is not sector-aligned",
                data.len()
            )));
        }
        self.pending.extend_from_slice(data);
        self.virtual_position += (data.len() / BYTES_PER_SECTOR) as u64;
        self.flush_full_grains()
    }

    fn finalize(&mut self) -> Result<()> {
        if self.finalized {
            return Err(ZfError::InvalidConfiguration(
                "sink already finalized".to_owned(),
            ));
        }
        self.finalized = true;

        if !self.pending.is_empty() {
            let grain_bytes = self.grain_bytes();
            let mut last = std::mem::take(&mut self.pending);
            last.resize(grain_bytes, 0);
            self.emit_grain(&last)?;
        }
        self.writer.flush()?;

        // Patch the preallocated grain tables in place.
        let mut table_bytes = vec![0_u8; self.entries.len() * 4];
        for (index, entry) in self.entries.iter().enumerate() {
            write_le_u32(&mut table_bytes, index * 4, *entry)?;
        }
        self.metadata_file
            .write_all_at(&table_bytes, self.table_base * BYTES_PER_SECTOR as u64)?;
        self.metadata_file.sync_all()?;
        Ok(())
    }

    fn position(&self) -> u64 {
        self.virtual_position
    }
}

// ── Stream-optimized ────────────────────────────────────────────────────────

/// Stream-optimized image built grain by grain: compressed grain records,
/// a grain-table marker after each table's grains, then the grain
/// directory, footer, and end-of-stream marker.
pub struct StreamOptimizedSink {
    writer: SequentialImageWriter,
    header: SparseExtentHeader,
    effort: CompressionEffort,
    directory: Vec<u32>,
    table: Vec<u32>,
    current_table: u64,
    pending: Vec<u8>,
    next_grain: u64,
    virtual_position: u64,
    finalized: bool,
}

impl StreamOptimizedSink {
    pub fn create(file: File, capacity_sectors: u64, effort: CompressionEffort) -> Result<Self> {
        let grain_size = DEFAULT_GRAIN_SECTORS;
        let num_gtes = DEFAULT_GTES_PER_GT;
        let overhead = grain_size;

        let header = build_sparse_header(
            FLAG_NEWLINE_VALID | VMDK_FLAG_COMPRESSED | VMDK_FLAG_MARKERS,
            capacity_sectors,
            grain_size,
            num_gtes,
            VMDK_GD_AT_END,
            overhead,
            VMDK_COMPRESSION_DEFLATE,
        )?;

        let mut writer = SequentialImageWriter::new(file);
        writer.write(&header.to_bytes())?;
        let padding = usize::try_from((overhead - 1) * BYTES_PER_SECTOR as u64)
            .map_err(|_| ZfError::Overflow("metadata padding"))?;
        writer.write(&vec![0_u8; padding])?;

        let table_count = usize::try_from(header.grain_table_count())
            .map_err(|_| ZfError::Overflow("grain table count"))?;
        Ok(Self {
            writer,
            header,
            effort,
            directory: vec![0_u32; table_count],
            table: vec![0_u32; num_gtes as usize],
            current_table: 0,
            pending: Vec::new(),
            next_grain: 0,
            virtual_position: 0,
            finalized: false,
        })
    }

    fn grain_bytes(&self) -> usize {
        self.header.grain_size as usize * BYTES_PER_SECTOR
    }

    fn flush_full_grains(&mut self) -> Result<()> {
        let grain_bytes = self.grain_bytes();
        while self.pending.len() >= grain_bytes {
            let rest = self.pending.split_off(grain_bytes);
            let grain = std::mem::replace(&mut self.pending, rest);
            self.emit_grain(&grain)?;
        }
        Ok(())
    }

    fn emit_grain(&mut self, grain: &[u8]) -> Result<()> {
        let table_index = self.next_grain / u64::from(self.header.num_gtes_per_gt);
        if table_index != self.current_table {
            self.flush_table()?;
            self.current_table = table_index;
        }

        if !is_all_zero(grain) {
            let lba = self.next_grain * self.header.grain_size;
            let compressed = compress::compress(grain, self.effort)?;
            let record = build_grain_record(lba, &compressed)?;

            let entry_index = (self.next_grain % u64::from(self.header.num_gtes_per_gt)) as usize;
            self.table[entry_index] = u32::try_from(self.writer.position())
                .map_err(|_| ZfError::Overflow("grain record sector"))?;
            self.writer.write(&record)?;
        }
        self.next_grain += 1;
        Ok(())
    }

    /// Emit the current grain table if it holds any grains, recording its
    /// data sector (one past the marker) in the directory.
    fn flush_table(&mut self) -> Result<()> {
        if self.table.iter().all(|entry| *entry == 0) {
            return Ok(());
        }
        let table_index = usize::try_from(self.current_table)
            .map_err(|_| ZfError::Overflow("grain table index"))?;

        let mut table_bytes = vec![0_u8; self.table.len() * 4];
        for (index, entry) in self.table.iter().enumerate() {
            write_le_u32(&mut table_bytes, index * 4, *entry)?;
        }
        self.directory[table_index] = u32::try_from(self.writer.position() + 1)
            .map_err(|_| ZfError::Overflow("grain table sector"))?;
        self.writer.write(&build_metadata_record(VMDK_MARKER_GT, &table_bytes)?)?;
        self.table.fill(0);
        Ok(())
    }
}

impl ImageSink for StreamOptimizedSink {
    fn write_sectors(&mut self, data: &[u8]) -> Result<()> {
        if data.len() % BYTES_PER_SECTOR != 0 {
            return Err(ZfError::InvalidConfiguration(format!(
                "write length {} is not sector-aligned",
                data.len()
            )));
        }
        self.pending.extend_from_slice(data);
        self.virtual_position += (data.len() / BYTES_PER_SECTOR) as u64;
        self.flush_full_grains()
    }

    fn finalize(&mut self) -> Result<()> {
        if self.finalized {
            return Err(ZfError::InvalidConfiguration(
                "sink already finalized".to_owned(),
            ));
        }
        self.finalized = true;

        if !self.pending.is_empty() {
            let grain_bytes = self.grain_bytes();
            let mut last = std::mem::take(&mut self.pending);
            last.resize(grain_bytes, 0);
            self.emit_grain(&last)?;
        }
        self.flush_table()?;

        let mut directory_bytes = vec![0_u8; self.directory.len() * 4];
        for (index, entry) in self.directory.iter().enumerate() {
            write_le_u32(&mut directory_bytes, index * 4, *entry)?;
        }
        let gd_sector = self.writer.position() + 1;
        self.writer.write(&build_metadata_record(VMDK_MARKER_GD, &directory_bytes)?)?;

        let mut footer = self.header.clone();
        footer.set_gd_offset(gd_sector)?;
        self.writer.write(&build_metadata_record(VMDK_MARKER_FOOTER, &footer.to_bytes())?)?;
        self.writer.write(&build_metadata_record(VMDK_MARKER_EOS, &[])?)?;
        self.writer.flush()
    }

    fn position(&self) -> u64 {
        self.virtual_position
    }
}
