//! ext4 superblock and group-descriptor parsing (little-endian).
//!
//! Only the fields the free-block scan needs are modeled. The superblock is
//! parsed once per volume from the 1024-byte region at byte offset 1024; a
//! magic mismatch is reported as `ParseError::InvalidMagic` and treated by
//! the sniffing layer as "not ext4", never as corruption.

use zf_types::{
    ensure_slice, ext4_block_size_from_log, read_le_u16, read_le_u32, ParseError,
    EXT4_INCOMPAT_64BIT, EXT4_LEGACY_DESC_SIZE, EXT4_SUPERBLOCK_SIZE, EXT4_SUPER_MAGIC,
};

/// `bg_flags`: block bitmap not initialized (group is fully free on disk).
pub const EXT4_BG_BLOCK_UNINIT: u16 = 0x0002;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ext4Superblock {
    pub inodes_count: u32,
    pub blocks_count: u64,
    pub reserved_blocks_count: u32,
    pub free_blocks_count: u32,
    pub free_inodes_count: u32,
    pub first_data_block: u32,
    pub log_block_size: u32,
    pub block_size: u32,
    pub blocks_per_group: u32,
    pub feature_incompat: u32,
    pub feature_ro_compat: u32,
    pub desc_size: u16,
}

impl Ext4Superblock {
    /// Parse from the 1024-byte superblock region.
    pub fn parse(region: &[u8]) -> Result<Self, ParseError> {
        if region.len() < EXT4_SUPERBLOCK_SIZE {
            return Err(ParseError::InsufficientData {
                needed: EXT4_SUPERBLOCK_SIZE,
                offset: 0,
                actual: region.len(),
            });
        }

        let magic = read_le_u16(region, 0x38)?;
        if magic != EXT4_SUPER_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(EXT4_SUPER_MAGIC),
                actual: u64::from(magic),
            });
        }

        let log_block_size = read_le_u32(region, 0x18)?;
        let Some(block_size) = ext4_block_size_from_log(log_block_size) else {
            return Err(ParseError::InvalidField {
                field: "s_log_block_size",
                reason: "invalid shift",
            });
        };

        let feature_incompat = read_le_u32(region, 0x60)?;
        let blocks_lo = u64::from(read_le_u32(region, 0x04)?);
        let blocks_hi = if feature_incompat & EXT4_INCOMPAT_64BIT != 0 {
            u64::from(read_le_u32(region, 0x150)?)
        } else {
            0
        };

        Ok(Self {
            inodes_count: read_le_u32(region, 0x00)?,
            blocks_count: blocks_lo | (blocks_hi << 32),
            reserved_blocks_count: read_le_u32(region, 0x08)?,
            free_blocks_count: read_le_u32(region, 0x0C)?,
            free_inodes_count: read_le_u32(region, 0x10)?,
            first_data_block: read_le_u32(region, 0x14)?,
            log_block_size,
            block_size,
            blocks_per_group: read_le_u32(region, 0x20)?,
            feature_incompat,
            feature_ro_compat: read_le_u32(region, 0x64)?,
            desc_size: read_le_u16(region, 0xFE)?,
        })
    }

    /// True when block counts and descriptor fields are 64-bit wide.
    #[must_use]
    pub fn is_64bit(&self) -> bool {
        self.feature_incompat & EXT4_INCOMPAT_64BIT != 0
    }

    /// Group descriptor size: superblock-declared when 64-bit, 32 otherwise.
    #[must_use]
    pub fn group_desc_size(&self) -> u16 {
        if self.is_64bit() {
            self.desc_size.max(EXT4_LEGACY_DESC_SIZE)
        } else {
            EXT4_LEGACY_DESC_SIZE
        }
    }

    /// Number of block groups: `ceil(blocks_count / blocks_per_group)`.
    pub fn groups_count(&self) -> Result<u32, ParseError> {
        if self.blocks_per_group == 0 {
            return Err(ParseError::InvalidField {
                field: "s_blocks_per_group",
                reason: "cannot be zero",
            });
        }
        let groups = self.blocks_count.div_ceil(u64::from(self.blocks_per_group));
        u32::try_from(groups).map_err(|_| ParseError::IntegerConversion {
            field: "groups_count",
        })
    }

    /// Block count of the last (possibly truncated) group.
    pub fn blocks_in_last_group(&self) -> Result<u32, ParseError> {
        let groups = u64::from(self.groups_count()?);
        if groups == 0 {
            return Ok(0);
        }
        let full = (groups - 1).saturating_mul(u64::from(self.blocks_per_group));
        u32::try_from(self.blocks_count - full).map_err(|_| ParseError::IntegerConversion {
            field: "blocks_in_last_group",
        })
    }
}

/// Block group descriptor. Fields are 32-bit on disk; with the 64-bit
/// feature the high halves live at fixed offsets past the legacy layout and
/// are OR'd in here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ext4GroupDesc {
    pub block_bitmap: u64,
    pub inode_bitmap: u64,
    pub inode_table: u64,
    pub free_blocks_count: u32,
    pub free_inodes_count: u32,
    pub used_dirs_count: u32,
    pub flags: u16,
}

impl Ext4GroupDesc {
    pub fn parse(bytes: &[u8], desc_size: u16) -> Result<Self, ParseError> {
        let desc_size = usize::from(desc_size);
        if desc_size < usize::from(EXT4_LEGACY_DESC_SIZE) {
            return Err(ParseError::InvalidField {
                field: "s_desc_size",
                reason: "descriptor size must be >= 32",
            });
        }
        ensure_slice(bytes, 0, desc_size)?;

        let block_bitmap_lo = u64::from(read_le_u32(bytes, 0x00)?);
        let inode_bitmap_lo = u64::from(read_le_u32(bytes, 0x04)?);
        let inode_table_lo = u64::from(read_le_u32(bytes, 0x08)?);
        let free_blocks_lo = u32::from(read_le_u16(bytes, 0x0C)?);
        let free_inodes_lo = u32::from(read_le_u16(bytes, 0x0E)?);
        let used_dirs_lo = u32::from(read_le_u16(bytes, 0x10)?);
        let flags = read_le_u16(bytes, 0x12)?;

        if desc_size >= 64 {
            let block_bitmap_hi = u64::from(read_le_u32(bytes, 0x20)?);
            let inode_bitmap_hi = u64::from(read_le_u32(bytes, 0x24)?);
            let inode_table_hi = u64::from(read_le_u32(bytes, 0x28)?);
            let free_blocks_hi = u32::from(read_le_u16(bytes, 0x2C)?);
            let free_inodes_hi = u32::from(read_le_u16(bytes, 0x2E)?);
            let used_dirs_hi = u32::from(read_le_u16(bytes, 0x30)?);

            Ok(Self {
                block_bitmap: block_bitmap_lo | (block_bitmap_hi << 32),
                inode_bitmap: inode_bitmap_lo | (inode_bitmap_hi << 32),
                inode_table: inode_table_lo | (inode_table_hi << 32),
                free_blocks_count: free_blocks_lo | (free_blocks_hi << 16),
                free_inodes_count: free_inodes_lo | (free_inodes_hi << 16),
                used_dirs_count: used_dirs_lo | (used_dirs_hi << 16),
                flags,
            })
        } else {
            Ok(Self {
                block_bitmap: block_bitmap_lo,
                inode_bitmap: inode_bitmap_lo,
                inode_table: inode_table_lo,
                free_blocks_count: free_blocks_lo,
                free_inodes_count: free_inodes_lo,
                used_dirs_count: used_dirs_lo,
                flags,
            })
        }
    }

    #[must_use]
    pub fn block_bitmap_uninit(&self) -> bool {
        self.flags & EXT4_BG_BLOCK_UNINIT != 0
    }
}

/// Parse the whole group-descriptor table out of a contiguous buffer.
pub fn parse_group_descriptors(
    table: &[u8],
    desc_size: u16,
    group_count: u32,
) -> Result<Vec<Ext4GroupDesc>, ParseError> {
    let mut descriptors = Vec::with_capacity(group_count as usize);
    for group in 0..group_count as usize {
        let offset = group
            .checked_mul(usize::from(desc_size))
            .ok_or(ParseError::InvalidField {
                field: "group_desc_table",
                reason: "offset overflow",
            })?;
        let slice = ensure_slice(table, offset, usize::from(desc_size))?;
        descriptors.push(Ext4GroupDesc::parse(slice, desc_size)?);
    }
    Ok(descriptors)
}
