//! Buffered strictly-sequential reader and writer.
//!
//! The rewrite path walks the source image front to back exactly once and
//! appends to the destination exactly once; these wrappers add a sector
//! window on top of that access pattern. Going backwards is a contract
//! violation, not a seek.

use std::fs::File;
use std::io::Write;

use crate::SectorDisk;
use zf_error::{Result, ZfError};
use zf_types::BYTES_PER_SECTOR;

/// Buffer window, in sectors, for both directions (1 MiB).
pub const STREAM_WINDOW_SECTORS: u64 = 2048;

/// Windowed sequential reader over a [`SectorDisk`].
pub struct SequentialDiskReader<'a> {
    disk: &'a dyn SectorDisk,
    position: u64,
    buffer: Vec<u8>,
    buffer_start: u64,
}

impl<'a> SequentialDiskReader<'a> {
    #[must_use]
    pub fn new(disk: &'a dyn SectorDisk) -> Self {
        Self {
            disk,
            position: 0,
            buffer: Vec::new(),
            buffer_start: 0,
        }
    }

    /// Current position in sectors.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.position
    }

    #[must_use]
    pub fn total_sectors(&self) -> u64 {
        self.disk.total_sectors()
    }

    pub fn read_sector(&mut self) -> Result<Vec<u8>> {
        self.read_sectors(1)
    }

    /// Read `count` sectors at the current position, advancing it.
    ///
    /// The window is refilled (or extended at its tail) as needed; requests
    /// larger than the window or past the end of the disk fail.
    pub fn read_sectors(&mut self, count: u64) -> Result<Vec<u8>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        if count > STREAM_WINDOW_SECTORS {
            return Err(ZfError::InvalidConfiguration(format!(
                "sequential read of {count} sectors exceeds the {STREAM_WINDOW_SECTORS}-sector window"
            )));
        }
        if self.position < self.buffer_start {
            return Err(ZfError::InvalidConfiguration(format!(
                "sequential reader moved backwards: position={} window start={}",
                self.position, self.buffer_start
            )));
        }

        let buffered_sectors = (self.buffer.len() / BYTES_PER_SECTOR) as u64;
        let buffer_end = self.buffer_start + buffered_sectors;
        if self.buffer.is_empty() || self.position >= buffer_end {
            self.buffer = self.fill_window(self.position)?;
            self.buffer_start = self.position;
        } else if self.position + count > buffer_end {
            // Keep the unconsumed tail and extend it with the next window.
            let keep_from =
                usize::try_from((self.position - self.buffer_start) * BYTES_PER_SECTOR as u64)
                    .map_err(|_| ZfError::Overflow("reader window offset"))?;
            let mut kept = self.buffer.split_off(keep_from);
            let next = self.fill_window(buffer_end)?;
            kept.extend_from_slice(&next);
            self.buffer = kept;
            self.buffer_start = self.position;
        }

        let offset =
            usize::try_from((self.position - self.buffer_start) * BYTES_PER_SECTOR as u64)
                .map_err(|_| ZfError::Overflow("reader window offset"))?;
        let len = usize::try_from(count * BYTES_PER_SECTOR as u64)
            .map_err(|_| ZfError::Overflow("reader request length"))?;
        let end = offset
            .checked_add(len)
            .ok_or(ZfError::Overflow("reader request end"))?;
        if end > self.buffer.len() {
            return Err(ZfError::Format(format!(
                "read of {count} sectors at {} runs past the end of the image",
                self.position
            )));
        }

        let result = self.buffer[offset..end].to_vec();
        self.position += count;
        Ok(result)
    }

    fn fill_window(&self, start: u64) -> Result<Vec<u8>> {
        let remaining = self.disk.total_sectors().saturating_sub(start);
        if remaining == 0 {
            return Err(ZfError::Format(format!(
                "sequential read at {start} past the end of the image"
            )));
        }
        let to_read = remaining.min(STREAM_WINDOW_SECTORS);
        self.disk.read_sectors(start, to_read)
    }
}

/// Buffered append-only writer for destination image files.
///
/// Data is staged in memory and flushed to the file in window-sized chunks;
/// `position` counts sectors written (staged included) since construction.
pub struct SequentialImageWriter {
    file: File,
    buffer: Vec<u8>,
    position: u64,
}

impl SequentialImageWriter {
    #[must_use]
    pub fn new(file: File) -> Self {
        Self {
            file,
            buffer: Vec::new(),
            position: 0,
        }
    }

    /// Position in sectors, counting buffered data.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Append whole sectors.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        if data.len() % BYTES_PER_SECTOR != 0 {
            return Err(ZfError::InvalidConfiguration(format!(
                "write length {} is not sector-aligned",
                data.len()
            )));
        }
        self.buffer.extend_from_slice(data);
        self.position += (data.len() / BYTES_PER_SECTOR) as u64;
        if self.buffer.len() >= STREAM_WINDOW_SECTORS as usize * BYTES_PER_SECTOR {
            self.flush()?;
        }
        Ok(())
    }

    /// Flush staged sectors to the file.
    pub fn flush(&mut self) -> Result<()> {
        if !self.buffer.is_empty() {
            self.file.write_all(&self.buffer)?;
            self.buffer.clear();
        }
        Ok(())
    }

    /// Flush and hand back the file (for metadata patch-up by the caller).
    pub fn into_file(mut self) -> Result<File> {
        self.flush()?;
        Ok(self.file)
    }
}
