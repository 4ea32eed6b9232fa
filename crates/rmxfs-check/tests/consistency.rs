#![forbid(unsafe_code)]
//! Checker behavior on intact and deliberately corrupted fixtures.

use rmxfs_check::check_image;
use rmxfs_harness::{FNODE_SIZE, FNODE_START, GRAN, build_image};
use rmxfs_image::RmxImage;
use rmxfs_ondisk::Fnode;
use rmxfs_types::FLAG_ALLOCATED;

const VOLMAP_BLOCK: usize = 26;
const FNODEMAP_BLOCK: usize = 27;

fn fnode_range(index: u16) -> std::ops::Range<usize> {
    let start = FNODE_START + usize::from(index) * FNODE_SIZE;
    start..start + FNODE_SIZE
}

/// Flip one volume-map bit in the raw image (bit 0 = allocated).
fn set_block_bit(image: &mut [u8], block: usize, allocated: bool) {
    let offset = VOLMAP_BLOCK * GRAN + block / 8;
    if allocated {
        image[offset] &= !(1 << (block % 8));
    } else {
        image[offset] |= 1 << (block % 8);
    }
}

fn set_fnode_bit(image: &mut [u8], index: usize, allocated: bool) {
    let offset = FNODEMAP_BLOCK * GRAN + index / 8;
    if allocated {
        image[offset] &= !(1 << (index % 8));
    } else {
        image[offset] |= 1 << (index % 8);
    }
}

#[test]
fn intact_fixture_is_clean() {
    let image = RmxImage::from_bytes(build_image()).unwrap();
    let report = check_image(&image).unwrap();
    assert!(report.is_clean(), "findings: {:#?}", report.findings);
    assert_eq!(report.volume_name, "workvol");
}

#[test]
fn long_file_fixture_is_clean() {
    let mut bytes = build_image();
    rmxfs_harness::add_long_file(&mut bytes, "kernel.sys");
    let image = RmxImage::from_bytes(bytes).unwrap();
    let report = check_image(&image).unwrap();
    assert!(report.is_clean(), "findings: {:#?}", report.findings);
}

#[test]
fn orphaned_volume_map_bit_is_an_error() {
    let mut bytes = build_image();
    set_block_bit(&mut bytes, 500, true);
    let image = RmxImage::from_bytes(bytes).unwrap();

    let report = check_image(&image).unwrap();
    assert_eq!(report.error_count(), 1);
    assert!(report.findings[0].message.contains("block 500"));
    assert!(report.findings[0].message.contains("owned by no fnode"));
}

#[test]
fn in_use_block_marked_free_is_an_error() {
    let mut bytes = build_image();
    // Block 28 backs the root directory but now reads as free.
    set_block_bit(&mut bytes, 28, false);
    let image = RmxImage::from_bytes(bytes).unwrap();

    let report = check_image(&image).unwrap();
    assert_eq!(report.error_count(), 2);
    assert!(
        report
            .findings
            .iter()
            .all(|f| f.message.contains("block 28"))
    );
}

#[test]
fn double_allocation_is_reported_per_block() {
    let mut bytes = build_image();
    // Repoint the volume-label file (fnode 5) onto the fnode table's
    // first four blocks: 4..=7 gain two owners, 0..=3 lose theirs.
    let range = fnode_range(5);
    let mut fnode = Fnode::parse(&bytes[range.clone()]).unwrap();
    fnode.pointers[0].block = 4;
    fnode.serialize(&mut bytes[range]).unwrap();
    let image = RmxImage::from_bytes(bytes).unwrap();

    let report = check_image(&image).unwrap();
    let double: Vec<_> = report
        .findings
        .iter()
        .filter(|f| f.message.contains("multiple fnodes"))
        .collect();
    let orphaned: Vec<_> = report
        .findings
        .iter()
        .filter(|f| f.message.contains("owned by no fnode"))
        .collect();
    assert_eq!(double.len(), 4);
    assert_eq!(orphaned.len(), 4);
    assert_eq!(report.error_count(), 8);
}

#[test]
fn referenced_but_unallocated_fnode_is_an_error() {
    let mut bytes = build_image();
    let range = fnode_range(5);
    let mut fnode = Fnode::parse(&bytes[range.clone()]).unwrap();
    fnode.flags &= !FLAG_ALLOCATED;
    fnode.serialize(&mut bytes[range]).unwrap();
    let image = RmxImage::from_bytes(bytes).unwrap();

    let report = check_image(&image).unwrap();
    assert_eq!(report.error_count(), 1);
    assert!(report.findings[0].message.contains("not allocated"));
}

#[test]
fn stray_fnode_map_bits_are_errors_both_ways() {
    let mut bytes = build_image();
    // Fnode 8 claims to be allocated; fnode 6 (the root) claims to be free.
    set_fnode_bit(&mut bytes, 8, true);
    set_fnode_bit(&mut bytes, 6, false);
    let image = RmxImage::from_bytes(bytes).unwrap();

    let report = check_image(&image).unwrap();
    assert_eq!(report.error_count(), 2);
    assert!(
        report
            .findings
            .iter()
            .any(|f| f.message.contains("fnode 8") && f.message.contains("unreferenced"))
    );
    assert!(
        report
            .findings
            .iter()
            .any(|f| f.message.contains("fnode 6") && f.message.contains("in use"))
    );
}

#[test]
fn reserved_placeholder_is_expected_even_when_unreferenced() {
    // Fnode 3 appears in no directory, yet a clean check requires its map
    // bit set: clearing it must produce exactly one finding.
    let mut bytes = build_image();
    set_fnode_bit(&mut bytes, 3, false);
    let image = RmxImage::from_bytes(bytes).unwrap();

    let report = check_image(&image).unwrap();
    assert_eq!(report.error_count(), 1);
    assert!(report.findings[0].message.contains("fnode 3"));
}

#[test]
fn checker_survives_an_unreadable_tree() {
    let mut bytes = build_image();
    // Point the root directory's run far outside the image.
    let range = fnode_range(6);
    let mut fnode = Fnode::parse(&bytes[range.clone()]).unwrap();
    fnode.pointers[0].block = 0xFF_0000;
    fnode.serialize(&mut bytes[range]).unwrap();
    let image = RmxImage::from_bytes(bytes).unwrap();

    // The pass completes and reports rather than propagating the error.
    let report = check_image(&image).unwrap();
    assert!(!report.is_clean());
    assert!(
        report
            .findings
            .iter()
            .any(|f| f.message.contains("unreadable contents"))
    );
}
