//! Grain payload compression.
//!
//! Stream-optimized grains are RFC 1950 zlib streams. Compression is
//! delegated to flate2; this module only fixes the effort mapping and the
//! length checks around it.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use zf_error::{Result, ZfError};

/// Compression effort for rewritten grains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionEffort {
    Fastest,
    Maximal,
}

impl CompressionEffort {
    fn level(self) -> Compression {
        match self {
            Self::Fastest => Compression::fast(),
            Self::Maximal => Compression::best(),
        }
    }

    /// Effort the source encoder used, judged from the zlib FLG byte.
    ///
    /// `0x01` is the FLG value zlib emits for its fastest level; everything
    /// else is treated as maximal so recompression never degrades a grain.
    #[must_use]
    pub fn from_zlib_payload(payload: &[u8]) -> Self {
        if payload.len() >= 2 && payload[1] == 0x01 {
            Self::Fastest
        } else {
            Self::Maximal
        }
    }
}

/// Compress a full grain payload.
pub fn compress(data: &[u8], effort: CompressionEffort) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2), effort.level());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Decompress a grain payload, requiring exactly `expected_len` bytes out.
pub fn decompress(data: &[u8], expected_len: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(expected_len);
    let mut decoder = ZlibDecoder::new(data);
    decoder.read_to_end(&mut out)?;
    if out.len() != expected_len {
        return Err(ZfError::Format(format!(
            "grain decompressed to {} bytes, expected {expected_len}",
            out.len()
        )));
    }
    Ok(out)
}
