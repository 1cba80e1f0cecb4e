//! LVM volume resolver.
//!
//! Maps a Linux RAID partition to the logical-volume extents inside it:
//! outer md wrapper, then the LVM physical-volume label, then the textual
//! volume-group metadata. Handles the single-PV, single-segment, striped
//! layout; any unmet assumption falls back to returning the whole partition
//! unresolved, so the caller still gets a scannable extent.

use tracing::debug;

use zf_disk::SectorDisk;
use zf_error::Result;
use zf_ondisk::lvm::{array_value, child_objects, object_block, string_value, value};
use zf_ondisk::{MdRaidSuperblock, MetadataAreaHeader, PartitionTableEntry, PvLabel};
use zf_types::{SectorRange, MBR_PARTITION_TYPE_LINUX_RAID};

/// Resolve `partition` into the extents a filesystem scanner should look at.
pub fn resolve_volumes(
    disk: &dyn SectorDisk,
    partition: &PartitionTableEntry,
) -> Result<Vec<SectorRange>> {
    let whole = partition.range();
    if partition.partition_type != MBR_PARTITION_TYPE_LINUX_RAID || whole.sector_count < 9 {
        return Ok(vec![whole]);
    }

    // The md superblock sits 8 sectors into the partition.
    let md_sector = disk.read_sectors(whole.first_sector + 8, 1)?;
    let Ok(md) = MdRaidSuperblock::parse(&md_sector) else {
        return Ok(vec![whole]);
    };
    if md.version != 1 {
        return Ok(vec![whole]);
    }

    let bytes_per_sector = disk.bytes_per_sector() as u64;
    let Some(data_start) = whole.first_sector.checked_add(md.data_offset) else {
        return Ok(vec![whole]);
    };
    let wrapped = SectorRange::new(data_start, md.data_size);

    // LVM label in the second sector of the wrapped data area.
    let label_sector = disk.read_sectors(data_start + 1, 1)?;
    let Ok(label) = PvLabel::parse(&label_sector) else {
        debug!(partition = %whole, "md wrapper without an LVM label");
        return Ok(vec![wrapped]);
    };

    let metadata_sectors = label.metadata_size / bytes_per_sector;
    if metadata_sectors == 0 {
        return Ok(vec![wrapped]);
    }
    let area = disk.read_sectors(
        data_start + label.metadata_offset / bytes_per_sector,
        metadata_sectors,
    )?;
    let Ok(header) = MetadataAreaHeader::parse(&area) else {
        return Ok(vec![wrapped]);
    };

    let Some(text) = metadata_text(&area, &header) else {
        return Ok(vec![wrapped]);
    };

    match resolve_from_metadata(&text, data_start, &label, bytes_per_sector) {
        Some(volumes) if !volumes.is_empty() => {
            debug!(
                partition = %whole,
                volumes = volumes.len(),
                "resolved LVM logical volumes"
            );
            Ok(volumes)
        }
        _ => {
            debug!(partition = %whole, "LVM metadata outside supported layout");
            Ok(vec![whole])
        }
    }
}

fn metadata_text(area: &[u8], header: &MetadataAreaHeader) -> Option<String> {
    let offset = usize::try_from(header.text_offset).ok()?;
    let size = usize::try_from(header.text_size).ok()?;
    let end = offset.checked_add(size)?;
    if end > area.len() {
        return None;
    }
    Some(String::from_utf8_lossy(&area[offset..end]).into_owned())
}

/// Resolve logical volumes from the metadata text, or `None` when any
/// assumption (lvm2 format, one PV, one segment per LV, striped layout,
/// matching device size) does not hold.
fn resolve_from_metadata(
    metadata: &str,
    data_start: u64,
    label: &PvLabel,
    bytes_per_sector: u64,
) -> Option<Vec<SectorRange>> {
    if string_value(metadata, "format")? != "lvm2" {
        return None;
    }
    let extent_size: u64 = value(metadata, "extent_size")?.parse().ok()?;

    let pv_section = object_block(metadata, "physical_volumes")?;
    let pv_names = child_objects(&pv_section);
    let [pv_name] = pv_names.as_slice() else {
        return None;
    };
    let pv_block = object_block(metadata, pv_name)?;
    let dev_size: u64 = value(&pv_block, "dev_size")?.parse().ok()?;
    if dev_size != label.device_size / bytes_per_sector {
        return None;
    }

    let pe_base = data_start.checked_add(label.data_offset / bytes_per_sector)?;

    let lv_section = object_block(metadata, "logical_volumes")?;
    let mut volumes = Vec::new();
    for lv_name in child_objects(&lv_section) {
        let lv_block = object_block(&lv_section, &lv_name)?;
        if value(&lv_block, "segment_count")? != "1" {
            return None;
        }
        let segment = object_block(&lv_block, "segment1")?;
        if string_value(&segment, "type")? != "striped" {
            return None;
        }
        let extent_count: u64 = value(&segment, "extent_count")?.parse().ok()?;
        let stripes = array_value(&segment, "stripes")?;
        let stripe_offset: u64 = stripes.get(1)?.parse().ok()?;

        let first_sector = stripe_offset
            .checked_mul(extent_size)
            .and_then(|offset| offset.checked_add(pe_base))?;
        let sector_count = extent_count.checked_mul(extent_size)?;
        volumes.push(SectorRange::new(first_sector, sector_count));
    }
    Some(volumes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use zf_disk::MemDisk;
    use zf_types::{
        BYTES_PER_SECTOR, LVM2_METADATA_MAGIC_HI, LVM2_METADATA_MAGIC_LO, MD_SB_MAGIC,
    };

    const PART_START: u64 = 2048;
    const PART_SECTORS: u64 = 40960;
    const MD_DATA_OFFSET: u64 = 2048;
    const MD_DATA_SIZE: u64 = 36864;
    const PV_DATA_OFFSET_BYTES: u64 = 2048 * 512;
    const PV_METADATA_OFFSET_BYTES: u64 = 4096;
    const PV_METADATA_SIZE_BYTES: u64 = 8192;

    fn metadata_text_fixture() -> String {
        "vg0 {\n\
         format = \"lvm2\"\n\
         extent_size = 8192\n\
         physical_volumes {\n\
         pv0 {\n\
         dev_size = 36864\n\
         pe_start = 2048\n\
         pe_count = 4\n\
         }\n\
         }\n\
         logical_volumes {\n\
         root {\n\
         segment_count = 1\n\
         segment1 {\n\
         start_extent = 0\n\
         extent_count = 2\n\
         type = \"striped\"\n\
         stripe_count = 1\n\
         stripes = [\n\
         \"pv0\", 0\n\
         ]\n\
         }\n\
         }\n\
         }\n\
         }\n"
            .to_owned()
    }

    fn partition() -> PartitionTableEntry {
        PartitionTableEntry {
            status: 0,
            partition_type: MBR_PARTITION_TYPE_LINUX_RAID,
            first_sector: u32::try_from(PART_START).unwrap(),
            sector_count: u32::try_from(PART_SECTORS).unwrap(),
        }
    }

    fn build_disk(metadata: &str, with_label: bool) -> MemDisk {
        let total = usize::try_from(PART_START + PART_SECTORS).unwrap() * BYTES_PER_SECTOR;
        let mut bytes = vec![0_u8; total];

        let md = usize::try_from(PART_START + 8).unwrap() * BYTES_PER_SECTOR;
        bytes[md..md + 4].copy_from_slice(&MD_SB_MAGIC.to_le_bytes());
        bytes[md + 4..md + 8].copy_from_slice(&1_u32.to_le_bytes());
        bytes[md + 0x80..md + 0x88].copy_from_slice(&MD_DATA_OFFSET.to_le_bytes());
        bytes[md + 0x88..md + 0x90].copy_from_slice(&MD_DATA_SIZE.to_le_bytes());

        let data_start = PART_START + MD_DATA_OFFSET;
        if with_label {
            let label = usize::try_from(data_start + 1).unwrap() * BYTES_PER_SECTOR;
            bytes[label..label + 8].copy_from_slice(b"LABELONE");
            bytes[label + 0x40..label + 0x48]
                .copy_from_slice(&(MD_DATA_SIZE * 512).to_le_bytes());
            bytes[label + 0x48..label + 0x50].copy_from_slice(&PV_DATA_OFFSET_BYTES.to_le_bytes());
            bytes[label + 0x68..label + 0x70]
                .copy_from_slice(&PV_METADATA_OFFSET_BYTES.to_le_bytes());
            bytes[label + 0x70..label + 0x78]
                .copy_from_slice(&PV_METADATA_SIZE_BYTES.to_le_bytes());

            let area =
                usize::try_from(data_start + PV_METADATA_OFFSET_BYTES / 512).unwrap() * BYTES_PER_SECTOR;
            bytes[area + 0x04..area + 0x0C].copy_from_slice(&LVM2_METADATA_MAGIC_LO.to_le_bytes());
            bytes[area + 0x0C..area + 0x14].copy_from_slice(&LVM2_METADATA_MAGIC_HI.to_le_bytes());
            bytes[area + 0x28..area + 0x30].copy_from_slice(&512_u64.to_le_bytes());
            bytes[area + 0x30..area + 0x38]
                .copy_from_slice(&(metadata.len() as u64).to_le_bytes());
            bytes[area + 512..area + 512 + metadata.len()].copy_from_slice(metadata.as_bytes());
        }

        MemDisk::new(bytes).expect("disk")
    }

    #[test]
    fn resolves_single_striped_volume() {
        let disk = build_disk(&metadata_text_fixture(), true);
        let volumes = resolve_volumes(&disk, &partition()).expect("resolve");

        // pe area base: partition + md data offset + pv data offset.
        let expected_first = PART_START + MD_DATA_OFFSET + PV_DATA_OFFSET_BYTES / 512;
        assert_eq!(
            volumes,
            vec![SectorRange::new(expected_first, 2 * 8192)]
        );
    }

    #[test]
    fn non_raid_partition_is_returned_whole() {
        let disk = build_disk(&metadata_text_fixture(), true);
        let mut plain = partition();
        plain.partition_type = 0x83;
        let volumes = resolve_volumes(&disk, &plain).expect("resolve");
        assert_eq!(volumes, vec![SectorRange::new(PART_START, PART_SECTORS)]);
    }

    #[test]
    fn missing_md_magic_is_returned_whole() {
        let disk = MemDisk::zeroed(PART_START + PART_SECTORS).expect("disk");
        let volumes = resolve_volumes(&disk, &partition()).expect("resolve");
        assert_eq!(volumes, vec![SectorRange::new(PART_START, PART_SECTORS)]);
    }

    #[test]
    fn md_wrapper_without_label_falls_back_to_data_area() {
        let disk = build_disk(&metadata_text_fixture(), false);
        let volumes = resolve_volumes(&disk, &partition()).expect("resolve");
        assert_eq!(
            volumes,
            vec![SectorRange::new(PART_START + MD_DATA_OFFSET, MD_DATA_SIZE)]
        );
    }

    #[test]
    fn multiple_physical_volumes_fall_back_to_whole_partition() {
        let metadata = metadata_text_fixture().replace(
            "pv0 {\ndev_size = 36864",
            "pv1 {\ndev_size = 1\n}\npv0 {\ndev_size = 36864",
        );
        let disk = build_disk(&metadata, true);
        let volumes = resolve_volumes(&disk, &partition()).expect("resolve");
        assert_eq!(volumes, vec![SectorRange::new(PART_START, PART_SECTORS)]);
    }

    #[test]
    fn non_striped_segment_falls_back_to_whole_partition() {
        let metadata = metadata_text_fixture().replace("\"striped\"", "\"raid1\"");
        let disk = build_disk(&metadata, true);
        let volumes = resolve_volumes(&disk, &partition()).expect("resolve");
        assert_eq!(volumes, vec![SectorRange::new(PART_START, PART_SECTORS)]);
    }

    #[test]
    fn device_size_mismatch_falls_back_to_whole_partition() {
        let metadata = metadata_text_fixture().replace("dev_size = 36864", "dev_size = 999");
        let disk = build_disk(&metadata, true);
        let volumes = resolve_volumes(&disk, &partition()).expect("resolve");
        assert_eq!(volumes, vec![SectorRange::new(PART_START, PART_SECTORS)]);
    }
}
