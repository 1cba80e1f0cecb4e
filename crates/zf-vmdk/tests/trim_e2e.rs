//! End-to-end: scan an ext4 filesystem inside a stream-optimized image,
//! rewrite, and verify the free space is gone while the filesystem survives.

use std::path::Path;

use zf_disk::{MemDisk, RawDisk, SectorDisk, TrimmableDisk};
use zf_scan::trim_free_space;
use zf_vmdk::{
    copy_disk, rewrite_stream_optimized, CompressionEffort, RewriteOptions, StreamOptimizedSink,
    VmdkImage,
};

const SECTOR: usize = 512;
const PART_START: u64 = 2048;
const BLOCK_SIZE: usize = 4096;
const BLOCK_SECTORS: u64 = 8;
const BLOCKS: u32 = 64;
const CAPACITY: u64 = PART_START + BLOCKS as u64 * BLOCK_SECTORS; // 2560, grain aligned
const USED_BLOCKS: [u32; 4] = [0, 1, 2, 3];

/// Virtual disk: MBR with one Linux partition holding a one-group ext4
/// filesystem (superblock in block 0, descriptors in block 1, block bitmap
/// in block 2). Blocks outside `USED_BLOCKS` are free; their contents are
/// nonzero so trimming is observable.
fn build_virtual_disk() -> Vec<u8> {
    let mut bytes = vec![0_u8; usize::try_from(CAPACITY).unwrap() * SECTOR];

    // MBR: partition 0, type 0x83.
    bytes[446 + 4] = 0x83;
    bytes[446 + 8..446 + 12].copy_from_slice(&u32::try_from(PART_START).unwrap().to_le_bytes());
    bytes[446 + 12..446 + 16]
        .copy_from_slice(&(BLOCKS * u32::try_from(BLOCK_SECTORS).unwrap()).to_le_bytes());
    bytes[510] = 0x55;
    bytes[511] = 0xAA;

    let base = usize::try_from(PART_START).unwrap() * SECTOR;

    // Every data block carries a marker byte so zeroing is visible.
    for block in 0..BLOCKS as usize {
        let offset = base + block * BLOCK_SIZE;
        bytes[offset..offset + BLOCK_SIZE].fill(0xC3);
    }

    // Superblock (block 0, byte offset 1024).
    let sb = base + 1024;
    bytes[sb..sb + BLOCK_SIZE - 1024].fill(0);
    bytes[sb + 0x04..sb + 0x08].copy_from_slice(&BLOCKS.to_le_bytes());
    bytes[sb + 0x18..sb + 0x1C].copy_from_slice(&2_u32.to_le_bytes()); // 4096-byte blocks
    bytes[sb + 0x20..sb + 0x24].copy_from_slice(&BLOCKS.to_le_bytes()); // one group
    bytes[sb + 0x38..sb + 0x3A].copy_from_slice(&0xEF53_u16.to_le_bytes());

    // Group descriptor table (block 1): bitmap lives in block 2.
    let gdt = base + BLOCK_SIZE;
    bytes[gdt..gdt + BLOCK_SIZE].fill(0);
    bytes[gdt..gdt + 4].copy_from_slice(&2_u32.to_le_bytes());

    // Block bitmap (block 2): only USED_BLOCKS allocated.
    let bitmap = base + 2 * BLOCK_SIZE;
    bytes[bitmap..bitmap + BLOCK_SIZE].fill(0);
    for block in USED_BLOCKS {
        bytes[bitmap + (block / 8) as usize] |= 1 << (block % 8);
    }

    bytes
}

fn write_stream_optimized(path: &Path, contents: &[u8]) {
    let disk = MemDisk::new(contents.to_vec()).expect("disk");
    let file = std::fs::File::create(path).expect("create");
    let mut sink =
        StreamOptimizedSink::create(file, CAPACITY, CompressionEffort::Fastest).expect("sink");
    copy_disk(&disk, &mut sink).expect("copy");
}

fn scan_and_rewrite(source: &Path, dest: &Path) -> (u64, zf_vmdk::RewriteSummary) {
    let virtual_view = VmdkImage::open(source).expect("virtual");
    let work = TrimmableDisk::new(Box::new(virtual_view), 8).expect("trimmable");

    let summary = trim_free_space(&work).expect("scan");
    assert_eq!(summary.volumes_scanned, 1);
    assert_eq!(summary.volumes_corrupt, 0);
    let trimmable = work.trimmable_block_count();

    let raw = RawDisk::open(source).expect("raw");
    let dest_file = std::fs::File::create(dest).expect("dest");
    let rewrite =
        rewrite_stream_optimized(&raw, &work, dest_file, RewriteOptions::default()).expect("rewrite");
    (trimmable, rewrite)
}

fn read_all(image: &VmdkImage) -> Vec<u8> {
    let mut out = Vec::new();
    let mut sector = 0;
    while sector < image.total_sectors() {
        let chunk = 1024.min(image.total_sectors() - sector);
        out.extend_from_slice(&image.read_sectors(sector, chunk).expect("read"));
        sector += chunk;
    }
    out
}

#[test]
fn scan_trims_free_blocks_and_rewrite_drops_them() {
    let dir = tempfile::tempdir().expect("tempdir");
    let source = dir.path().join("source.vmdk");
    let dest = dir.path().join("dest.vmdk");
    write_stream_optimized(&source, &build_virtual_disk());

    let (trimmable, rewrite) = scan_and_rewrite(&source, &dest);

    // 60 free 4 KiB blocks, each exactly one 8-sector trim block.
    assert_eq!(trimmable, 60);
    // Partition spans grains 16..20: grain 16 holds the used metadata
    // blocks (mixed), grains 17..20 are pure free space (dropped). Grain 0
    // holds the MBR (copied); grains 1..16 were never stored.
    assert_eq!(rewrite.grains_dropped, 3);
    assert_eq!(rewrite.grains_rewritten, 1);
    assert_eq!(rewrite.grains_copied, 1);

    let output = VmdkImage::open(&dest).expect("open");
    let contents = read_all(&output);

    // MBR and filesystem metadata survive.
    assert_eq!(contents[446 + 4], 0x83);
    let base = usize::try_from(PART_START).unwrap() * SECTOR;
    assert_eq!(contents[base + 1024 + 0x38], 0x53);
    // Used block 3 keeps its payload.
    assert_eq!(contents[base + 3 * BLOCK_SIZE], 0xC3);
    // Every free block reads back as zeros.
    for block in 4..BLOCKS as usize {
        let offset = base + block * BLOCK_SIZE;
        assert!(
            contents[offset..offset + BLOCK_SIZE].iter().all(|b| *b == 0),
            "free block {block} was not zeroed"
        );
    }

    let source_len = std::fs::metadata(&source).expect("metadata").len();
    let dest_len = std::fs::metadata(&dest).expect("metadata").len();
    assert!(dest_len < source_len);
}

#[test]
fn second_pass_finds_nothing_new() {
    let dir = tempfile::tempdir().expect("tempdir");
    let source = dir.path().join("source.vmdk");
    let first = dir.path().join("first.vmdk");
    let second = dir.path().join("second.vmdk");
    write_stream_optimized(&source, &build_virtual_disk());

    let (trimmable_one, rewrite_one) = scan_and_rewrite(&source, &first);
    let (trimmable_two, rewrite_two) = scan_and_rewrite(&first, &second);

    // The filesystem metadata is unchanged, so the second scan proves the
    // same set of blocks free and no additional grains become droppable.
    assert_eq!(trimmable_two, trimmable_one);
    assert_eq!(rewrite_two.grains_dropped, 0);
    assert_eq!(
        rewrite_one.grains_copied + rewrite_one.grains_rewritten,
        rewrite_two.grains_copied + rewrite_two.grains_rewritten
    );

    let first_image = VmdkImage::open(&first).expect("open");
    let second_image = VmdkImage::open(&second).expect("open");
    assert_eq!(read_all(&first_image), read_all(&second_image));
}
