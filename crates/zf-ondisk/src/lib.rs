#![forbid(unsafe_code)]
//! On-disk format parsing.
//!
//! Pure parsing crate — no I/O, no side effects. Decodes byte slices into
//! typed structures for the formats this tool touches: ext4 superblocks and
//! group descriptors (little-endian), xfs superblocks, AGF headers and
//! short-form B+tree nodes (big-endian), MBR partition tables, LVM wrapper
//! headers plus the brace-delimited LVM2 metadata text, and the VMDK sparse
//! extent header and grain-stream markers.

pub mod ext4;
pub mod lvm;
pub mod mbr;
pub mod vmdk;
pub mod xfs;

pub use ext4::{Ext4GroupDesc, Ext4Superblock};
pub use lvm::{MdRaidSuperblock, MetadataAreaHeader, PvLabel};
pub use mbr::{MasterBootRecord, PartitionTableEntry};
pub use vmdk::{Marker, SparseExtentHeader};
pub use xfs::{XfsAgf, XfsAllocRecord, XfsBtreeHeader, XfsSuperblock};
