#![forbid(unsafe_code)]
//! Load/save pipeline coverage: raw files, byte-swapped files, and IMD
//! containers, round-tripped through the real filesystem.

use rmxfs_harness::{GRAN, VOLUME_SIZE, build_image};
use rmxfs_image::RmxImage;

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 13 % 256) as u8).collect()
}

fn swap_pairs(data: &mut [u8]) {
    for pair in data.chunks_exact_mut(2) {
        pair.swap(0, 1);
    }
}

/// Wrap a flat fixture image in a one-sided IMD container: 32 sectors of
/// 256 bytes per track, as many cylinders as the image needs.
fn wrap_imd(image: &[u8]) -> Vec<u8> {
    const SECTORS: usize = 32;
    let track_bytes = SECTORS * GRAN;
    assert_eq!(image.len() % track_bytes, 0);

    let mut out = Vec::new();
    out.extend_from_slice(b"IMD fixture\x1a");
    for (cyl, track) in image.chunks(track_bytes).enumerate() {
        out.push(0x05); // mode
        out.push(cyl as u8);
        out.push(0); // head
        out.push(SECTORS as u8);
        out.push(1); // 256-byte sectors
        for s in 1..=SECTORS as u8 {
            out.push(s);
        }
        for sector in track.chunks(GRAN) {
            out.push(0x01);
            out.extend_from_slice(sector);
        }
    }
    out
}

#[test]
fn raw_image_round_trips_through_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vol.img");
    std::fs::write(&path, build_image()).unwrap();

    let mut image = RmxImage::load(&path, false).unwrap();
    let root = image.root_fnode().unwrap();
    let data = pattern(1234);
    image.put_file(&root, "saved.txt", &data, false).unwrap();
    image.save().unwrap();

    let reloaded = RmxImage::load(&path, false).unwrap();
    let mut hit = reloaded.lookup(None, "saved.txt").unwrap();
    assert_eq!(reloaded.read_file(&mut hit.fnode).unwrap(), data);
}

#[test]
fn read_only_session_saves_identical_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vol.img");
    let original = build_image();
    std::fs::write(&path, &original).unwrap();

    let mut image = RmxImage::load(&path, false).unwrap();
    image.save().unwrap();

    assert_eq!(std::fs::read(&path).unwrap(), original);
}

#[test]
fn byte_swapped_image_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vol.img");
    let mut swapped = build_image();
    swap_pairs(&mut swapped);
    std::fs::write(&path, &swapped).unwrap();

    // Loading with the swap undoes the pair ordering.
    let mut image = RmxImage::load(&path, true).unwrap();
    assert_eq!(image.bytes(), &build_image()[..]);
    assert_eq!(image.volume_label().unwrap().name, "workvol");

    // Saving re-applies it.
    image.save().unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), swapped);
}

#[test]
fn imd_container_round_trips_through_engine() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vol.imd");
    std::fs::write(&path, wrap_imd(&build_image())).unwrap();

    let mut image = RmxImage::load(&path, false).unwrap();
    assert_eq!(image.bytes().len(), VOLUME_SIZE);
    assert_eq!(image.volume_label().unwrap().name, "workvol");

    let root = image.root_fnode().unwrap();
    let data = pattern(3000);
    image.put_file(&root, "packed.bin", &data, false).unwrap();
    image.save().unwrap();

    // The saved file is a container again, not a flat image.
    let saved = std::fs::read(&path).unwrap();
    assert_eq!(&saved[..4], b"IMD ");

    let reloaded = RmxImage::load(&path, false).unwrap();
    let mut hit = reloaded.lookup(None, "packed.bin").unwrap();
    assert_eq!(reloaded.read_file(&mut hit.fnode).unwrap(), data);
}

#[test]
fn save_without_a_path_is_refused() {
    let mut image = RmxImage::from_bytes(build_image()).unwrap();
    assert!(image.save().is_err());

    // But an explicit target works.
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("explicit.img");
    image.save_as(&path).unwrap();
    assert_eq!(std::fs::read(&path).unwrap().len(), VOLUME_SIZE);
}

#[test]
fn save_replaces_an_existing_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vol.img");
    std::fs::write(&path, b"stale and short").unwrap();

    let mut image = RmxImage::from_bytes(build_image()).unwrap();
    image.save_as(&path).unwrap();
    assert_eq!(std::fs::read(&path).unwrap().len(), VOLUME_SIZE);
}
