#![forbid(unsafe_code)]
//! VMDK image access and the trim-aware rewrite paths.
//!
//! Reading: [`VmdkImage`] opens flat, monolithic-sparse, and
//! stream-optimized images and presents the virtual disk contents as a
//! [`zf_disk::SectorDisk`], resolving grains through the grain directory
//! and inflating compressed payloads on demand.
//!
//! Writing: [`sink::ImageSink`] implementations create flat,
//! monolithic-sparse, and stream-optimized destinations for the generic
//! copy path, while [`rewrite`] holds the stream-optimized fast path that
//! restructures the source grain stream without touching live grains.

pub mod compress;
pub mod copy;
pub mod image;
pub mod rewrite;
pub mod sink;

pub use compress::CompressionEffort;
pub use copy::copy_disk;
pub use image::VmdkImage;
pub use rewrite::{rewrite_stream_optimized, RewriteOptions, RewriteSummary};
pub use sink::{FlatImageSink, ImageSink, MonolithicSparseSink, StreamOptimizedSink};

/// Destination image sub-format selected on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskImageType {
    MonolithicSparse,
    MonolithicFlat,
    StreamOptimized,
}

impl DiskImageType {
    /// Parse the `-disk-type` argument value.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "monolithic-sparse" => Some(Self::MonolithicSparse),
            "monolithic-flat" => Some(Self::MonolithicFlat),
            "stream-optimized" => Some(Self::StreamOptimized),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disk_type_parsing() {
        assert_eq!(
            DiskImageType::parse("monolithic-sparse"),
            Some(DiskImageType::MonolithicSparse)
        );
        assert_eq!(
            DiskImageType::parse("monolithic-flat"),
            Some(DiskImageType::MonolithicFlat)
        );
        assert_eq!(
            DiskImageType::parse("stream-optimized"),
            Some(DiskImageType::StreamOptimized)
        );
        assert_eq!(DiskImageType::parse("vhdx"), None);
    }
}
