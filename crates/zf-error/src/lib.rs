#![forbid(unsafe_code)]
//! Error types for vmdk-zerofree.
//!
//! Two-layer model: byte-level decoding failures are `zf_types::ParseError`;
//! everything user-facing is `ZfError`. An unrecognized filesystem magic is
//! deliberately NOT an error — sniffing reports it as a tagged result and the
//! volume is skipped.
//!
//! Fatality rules:
//! - `Corrupt` aborts the affected volume only; other volumes are still
//!   scanned.
//! - `Io`, `Format`, `Misaligned`, `InvalidConfiguration`, and `Overflow`
//!   abort the whole run — there is no partial-completion recovery, the
//!   operator reruns from the unmodified source image.

use thiserror::Error;
use zf_types::ParseError;

/// Unified error type for all vmdk-zerofree operations.
#[derive(Debug, Error)]
pub enum ZfError {
    /// Operating system I/O error, propagated unchanged.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Byte-level decoding failure surfaced from the parse layer.
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    /// On-disk filesystem metadata violates a structural invariant.
    ///
    /// Fatal for the named volume only; scanning continues with the next
    /// volume.
    #[error("corrupt filesystem on {volume}: {detail}")]
    Corrupt { volume: String, detail: String },

    /// Valid on disk, but outside what this tool handles.
    #[error("unsupported configuration: {0}")]
    Unsupported(String),

    /// Caller-supplied geometry violates a construction contract.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A trim call did not align to the trim-block size.
    #[error(
        "misaligned trim range: sector={sector} count={count} trim_block={trim_block}"
    )]
    Misaligned {
        sector: u64,
        count: u64,
        trim_block: u64,
    },

    /// Malformed image structure (bad marker, size arithmetic mismatch).
    #[error("invalid image format: {0}")]
    Format(String),

    /// Sector arithmetic exceeded the addressable range.
    #[error("sector arithmetic overflow: {0}")]
    Overflow(&'static str),
}

impl ZfError {
    /// True when the error condemns a single volume rather than the run.
    #[must_use]
    pub fn is_volume_local(&self) -> bool {
        matches!(self, Self::Corrupt { .. })
    }
}

/// Result alias using `ZfError`.
pub type Result<T> = std::result::Result<T, ZfError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formatting() {
        let err = ZfError::Corrupt {
            volume: "sda1".into(),
            detail: "leftmost leaf has a left sibling".into(),
        };
        assert_eq!(
            err.to_string(),
            "corrupt filesystem on sda1: leftmost leaf has a left sibling"
        );

        let misaligned = ZfError::Misaligned {
            sector: 7,
            count: 16,
            trim_block: 8,
        };
        assert_eq!(
            misaligned.to_string(),
            "misaligned trim range: sector=7 count=16 trim_block=8"
        );
    }

    #[test]
    fn parse_error_converts() {
        let parse = ParseError::InvalidMagic {
            expected: 0xEF53,
            actual: 0,
        };
        let err = ZfError::from(parse);
        assert!(matches!(err, ZfError::Parse(_)));
        assert!(err.to_string().contains("invalid magic"));
    }

    #[test]
    fn only_corruption_is_volume_local() {
        assert!(
            ZfError::Corrupt {
                volume: "lv0".into(),
                detail: "bad signature".into()
            }
            .is_volume_local()
        );
        assert!(!ZfError::Format("truncated marker".into()).is_volume_local());
        assert!(!ZfError::Overflow("extent sectors").is_volume_local());
    }
}
