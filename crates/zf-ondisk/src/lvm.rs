//! LVM2 wrapper headers and the brace-delimited metadata text.
//!
//! Resolution walks three layers: an outer Linux RAID superblock (the
//! partition-type-0xFD wrapper), the LVM physical-volume label inside its
//! data area, and finally the textual volume-group metadata. The binary
//! headers here use fixed offsets covering the single-data-area,
//! single-metadata-area layout lvm2 writes by default; anything else makes
//! the resolver fall back to treating the partition as one opaque extent.

use zf_types::{
    read_le_u32, read_le_u64, ParseError, LVM2_METADATA_MAGIC_HI, LVM2_METADATA_MAGIC_LO,
    LVM_LABEL_MAGIC, MD_SB_MAGIC,
};

/// Linux RAID (md) superblock fields used to locate the wrapped data area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MdRaidSuperblock {
    pub version: u32,
    /// Data area start, in sectors relative to the partition.
    pub data_offset: u64,
    /// Data area length, in sectors.
    pub data_size: u64,
}

impl MdRaidSuperblock {
    pub fn parse(sector: &[u8]) -> Result<Self, ParseError> {
        let magic = read_le_u32(sector, 0x00)?;
        if magic != MD_SB_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(MD_SB_MAGIC),
                actual: u64::from(magic),
            });
        }
        Ok(Self {
            version: read_le_u32(sector, 0x04)?,
            data_offset: read_le_u64(sector, 0x80)?,
            data_size: read_le_u64(sector, 0x88)?,
        })
    }
}

/// Physical-volume label: device size plus the data and metadata areas.
///
/// All fields are byte offsets/lengths relative to the PV start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PvLabel {
    pub device_size: u64,
    pub data_offset: u64,
    pub metadata_offset: u64,
    pub metadata_size: u64,
}

impl PvLabel {
    /// Parse the "LABELONE" sector (second sector of the PV).
    pub fn parse(sector: &[u8]) -> Result<Self, ParseError> {
        let magic = read_le_u64(sector, 0x00)?;
        if magic != LVM_LABEL_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: LVM_LABEL_MAGIC,
                actual: magic,
            });
        }
        Ok(Self {
            device_size: read_le_u64(sector, 0x40)?,
            data_offset: read_le_u64(sector, 0x48)?,
            metadata_offset: read_le_u64(sector, 0x68)?,
            metadata_size: read_le_u64(sector, 0x70)?,
        })
    }
}

/// Metadata-area header: locates the current metadata text in the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataAreaHeader {
    /// Offset of the metadata text within the area, in bytes.
    pub text_offset: u64,
    /// Length of the metadata text, in bytes.
    pub text_size: u64,
}

impl MetadataAreaHeader {
    pub fn parse(area: &[u8]) -> Result<Self, ParseError> {
        let magic_lo = read_le_u64(area, 0x04)?;
        let magic_hi = read_le_u64(area, 0x0C)?;
        if magic_lo != LVM2_METADATA_MAGIC_LO || magic_hi != LVM2_METADATA_MAGIC_HI {
            return Err(ParseError::InvalidMagic {
                expected: LVM2_METADATA_MAGIC_LO,
                actual: magic_lo,
            });
        }
        Ok(Self {
            text_offset: read_le_u64(area, 0x28)?,
            text_size: read_le_u64(area, 0x30)?,
        })
    }
}

// ── Metadata text mini-language ─────────────────────────────────────────────
//
// The volume-group metadata is a line-oriented tree of `name { ... }` blocks
// and `key = value` assignments. Array values may continue over several
// lines until the closing bracket.

/// Extract the block `name { ... }` (braces included) from `metadata`.
#[must_use]
pub fn object_block(metadata: &str, name: &str) -> Option<String> {
    let open = format!("{name} {{");
    let mut depth = 0_i32;
    let mut object_depth: Option<i32> = None;
    let mut block = String::new();

    for raw_line in metadata.split('\n') {
        let line = raw_line.trim();
        if line.contains('{') {
            if line == open {
                object_depth = Some(depth);
            }
            depth += 1;
        }

        if object_depth.is_some() {
            block.push_str(line);
            block.push('\n');
        }

        if line.contains('}') {
            depth -= 1;
            if object_depth == Some(depth) {
                return Some(block);
            }
        }
    }
    None
}

/// Names of the blocks nested directly under the outermost block.
#[must_use]
pub fn child_objects(metadata: &str) -> Vec<String> {
    let mut depth = 0_i32;
    let mut children = Vec::new();
    for raw_line in metadata.split('\n') {
        let line = raw_line.trim();
        if let Some(brace) = line.find('{') {
            if depth == 1 {
                children.push(line[..brace].trim().to_owned());
            }
            depth += 1;
        } else if line.contains('}') {
            depth -= 1;
        }
    }
    children
}

/// Look up `key = value` at any depth; array values are joined across lines.
#[must_use]
pub fn value(metadata: &str, key: &str) -> Option<String> {
    let prefix = format!("{key} = ");
    let mut lines = metadata.split('\n');
    while let Some(raw_line) = lines.next() {
        let line = raw_line.trim();
        if let Some(rest) = line.strip_prefix(&prefix) {
            let mut result = rest.to_owned();
            if result.starts_with('[') {
                while !result.ends_with(']') {
                    let continuation = lines.next()?;
                    result.push_str(continuation.trim());
                }
            }
            return Some(result);
        }
    }
    None
}

/// A quoted string value with the quotes stripped.
#[must_use]
pub fn string_value(metadata: &str, key: &str) -> Option<String> {
    value(metadata, key).map(|v| v.trim_matches('"').to_owned())
}

/// A `[a, b, ...]` array value split into elements.
#[must_use]
pub fn array_value(metadata: &str, key: &str) -> Option<Vec<String>> {
    let raw = value(metadata, key)?;
    let inner = raw.trim_start_matches('[').trim_end_matches(']');
    Some(
        inner
            .split(',')
            .map(|item| item.trim().to_owned())
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const METADATA: &str = "\
vg0 {
id = \"abc-def\"
seqno = 2
format = \"lvm2\"
extent_size = 8192
physical_volumes {

pv0 {
id = \"pv-uuid\"
dev_size = 167772160
pe_start = 2048
pe_count = 20479
}
}

logical_volumes {

root {
segment_count = 1

segment1 {
start_extent = 0
extent_count = 20479
type = \"striped\"
stripe_count = 1
stripes = [
\"pv0\", 0
]
}
}
}
}
";

    #[test]
    fn object_block_extracts_nested_blocks() {
        let pvs = object_block(METADATA, "physical_volumes").expect("pvs");
        assert!(pvs.contains("pv0 {"));
        assert!(pvs.contains("dev_size = 167772160"));
        assert!(!pvs.contains("logical_volumes"));

        let segment = object_block(METADATA, "segment1").expect("segment");
        assert!(segment.contains("type = \"striped\""));

        assert!(object_block(METADATA, "missing").is_none());
    }

    #[test]
    fn child_objects_lists_depth_one_blocks() {
        let pvs = object_block(METADATA, "physical_volumes").expect("pvs");
        assert_eq!(child_objects(&pvs), vec!["pv0".to_owned()]);

        let lvs = object_block(METADATA, "logical_volumes").expect("lvs");
        assert_eq!(child_objects(&lvs), vec!["root".to_owned()]);
    }

    #[test]
    fn value_lookup_and_quoting() {
        assert_eq!(value(METADATA, "extent_size").as_deref(), Some("8192"));
        assert_eq!(string_value(METADATA, "format").as_deref(), Some("lvm2"));
        assert_eq!(value(METADATA, "no_such_key"), None);
    }

    #[test]
    fn multiline_array_value() {
        let segment = object_block(METADATA, "segment1").expect("segment");
        let stripes = array_value(&segment, "stripes").expect("stripes");
        assert_eq!(stripes, vec!["\"pv0\"".to_owned(), "0".to_owned()]);
    }

    #[test]
    fn md_raid_superblock_fields() {
        let mut sector = vec![0_u8; 512];
        sector[0x00..0x04].copy_from_slice(&MD_SB_MAGIC.to_le_bytes());
        sector[0x04..0x08].copy_from_slice(&1_u32.to_le_bytes());
        sector[0x80..0x88].copy_from_slice(&2048_u64.to_le_bytes());
        sector[0x88..0x90].copy_from_slice(&100_000_u64.to_le_bytes());

        let sb = MdRaidSuperblock::parse(&sector).expect("md superblock");
        assert_eq!(sb.version, 1);
        assert_eq!(sb.data_offset, 2048);
        assert_eq!(sb.data_size, 100_000);

        sector[0] = 0;
        assert!(MdRaidSuperblock::parse(&sector).is_err());
    }

    #[test]
    fn pv_label_fields() {
        let mut sector = vec![0_u8; 512];
        sector[0x00..0x08].copy_from_slice(b"LABELONE");
        sector[0x40..0x48].copy_from_slice(&(80_u64 * 1024 * 1024 * 1024).to_le_bytes());
        sector[0x48..0x50].copy_from_slice(&1_048_576_u64.to_le_bytes());
        sector[0x68..0x70].copy_from_slice(&4096_u64.to_le_bytes());
        sector[0x70..0x78].copy_from_slice(&1_044_480_u64.to_le_bytes());

        let label = PvLabel::parse(&sector).expect("label");
        assert_eq!(label.data_offset, 1_048_576);
        assert_eq!(label.metadata_offset, 4096);
        assert_eq!(label.metadata_size, 1_044_480);
    }

    #[test]
    fn metadata_area_header_magic_pair() {
        let mut area = vec![0_u8; 512];
        area[0x04..0x0C].copy_from_slice(&LVM2_METADATA_MAGIC_LO.to_le_bytes());
        area[0x0C..0x14].copy_from_slice(&LVM2_METADATA_MAGIC_HI.to_le_bytes());
        area[0x28..0x30].copy_from_slice(&512_u64.to_le_bytes());
        area[0x30..0x38].copy_from_slice(&300_u64.to_le_bytes());

        let header = MetadataAreaHeader::parse(&area).expect("header");
        assert_eq!(header.text_offset, 512);
        assert_eq!(header.text_size, 300);

        area[0x0C] ^= 0xFF;
        assert!(MetadataAreaHeader::parse(&area).is_err());
    }
}
