//! Generic trim-aware copy.
//!
//! Reads the virtual disk contents through the trimmable decorator (trimmed
//! blocks surface as zeros) and streams them into an [`ImageSink`]. Used
//! whenever the fast stream-optimized rewrite does not apply — flat and
//! monolithic-sparse outputs, or non-stream-optimized inputs.

use std::time::{Duration, Instant};

use tracing::info;

use crate::sink::ImageSink;
use zf_disk::SectorDisk;
use zf_error::Result;
use zf_types::BYTES_PER_SECTOR;

const COPY_CHUNK_SECTORS: u64 = 2048;
const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

/// Copy every sector of `disk` into `sink` and finalize it.
pub fn copy_disk(disk: &dyn SectorDisk, sink: &mut dyn ImageSink) -> Result<()> {
    let total = disk.total_sectors();
    let mut position = 0_u64;
    let mut last_report = Instant::now();

    while position < total {
        let chunk = COPY_CHUNK_SECTORS.min(total - position);
        let data = disk.read_sectors(position, chunk)?;
        sink.write_sectors(&data)?;
        position += chunk;

        if last_report.elapsed() >= PROGRESS_INTERVAL {
            info!(
                mib_written = position * BYTES_PER_SECTOR as u64 / 1024 / 1024,
                "copying virtual disk"
            );
            last_report = Instant::now();
        }
    }

    sink.finalize()?;
    info!(
        sectors = total,
        "virtual disk copy complete"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use zf_error::ZfError;

    struct CollectingSink {
        bytes: Vec<u8>,
        finalized: bool,
    }

    impl ImageSink for CollectingSink {
        fn write_sectors(&mut self, data: &[u8]) -> Result<()> {
            self.bytes.extend_from_slice(data);
            Ok(())
        }

        fn finalize(&mut self) -> Result<()> {
            if self.finalized {
                return Err(ZfError::InvalidConfiguration("double finalize".to_owned()));
            }
            self.finalized = true;
            Ok(())
        }

        fn position(&self) -> u64 {
            (self.bytes.len() / BYTES_PER_SECTOR) as u64
        }
    }

    #[test]
    fn copies_every_sector_once() {
        let mut bytes = vec![0_u8; 4100 * BYTES_PER_SECTOR];
        for (index, chunk) in bytes.chunks_mut(BYTES_PER_SECTOR).enumerate() {
            chunk.fill((index % 256) as u8);
        }
        let disk = zf_disk::MemDisk::new(bytes.clone()).expect("disk");

        let mut sink = CollectingSink {
            bytes: Vec::new(),
            finalized: false,
        };
        copy_disk(&disk, &mut sink).expect("copy");
        assert_eq!(sink.bytes, bytes);
        assert!(sink.finalized);
    }
}
