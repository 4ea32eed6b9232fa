#![forbid(unsafe_code)]
//! End-to-end engine coverage over synthetic fixture volumes.

use rmxfs_check::check_image;
use rmxfs_error::RmxError;
use rmxfs_harness::{ALLOCATED_BLOCKS, GRAN, TOTAL_BLOCKS, build_image};
use rmxfs_image::RmxImage;
use rmxfs_ondisk::Fnode;

fn fresh() -> RmxImage {
    RmxImage::from_bytes(build_image()).expect("fixture image is valid")
}

fn assert_clean(image: &RmxImage) {
    let report = check_image(image).expect("check runs");
    assert!(
        report.is_clean(),
        "expected a clean check, got: {:#?}",
        report.findings
    );
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 256) as u8).collect()
}

fn root(image: &RmxImage) -> Fnode {
    image.root_fnode().expect("root fnode")
}

#[test]
fn fresh_fixture_passes_chkdsk() {
    let image = fresh();
    assert_clean(&image);

    let counts = image.free_counts().unwrap();
    assert_eq!(counts.blocks, TOTAL_BLOCKS - ALLOCATED_BLOCKS);
    assert_eq!(counts.fnodes, 58); // 64 minus {0, 1, 2, 3, 5, 6}
}

#[test]
fn put_then_get_round_trip() {
    let mut image = fresh();
    let data = pattern(1000);

    let stored = image
        .put_file(&root(&image), "country.txt", &data, false)
        .unwrap();
    assert_eq!(stored.number, 4); // first free fnode on the fixture

    let mut hit = image.lookup(None, "country.txt").unwrap();
    assert_eq!(image.read_file(&mut hit.fnode).unwrap(), data);
    assert_clean(&image);
}

#[test]
fn put_empty_file() {
    let mut image = fresh();
    image.put_file(&root(&image), "empty", &[], false).unwrap();

    let mut hit = image.lookup(None, "empty").unwrap();
    assert_eq!(hit.fnode.total_blocks, 0);
    assert!(image.read_file(&mut hit.fnode).unwrap().is_empty());
    assert_clean(&image);
}

#[test]
fn lookup_is_case_insensitive() {
    let mut image = fresh();
    image
        .put_file(&root(&image), "Country.TXT", &pattern(10), false)
        .unwrap();

    for path in ["country.txt", "COUNTRY.TXT", "/Country.txt"] {
        let hit = image.lookup(None, path).unwrap();
        assert_eq!(hit.fnode.total_size, 10, "lookup failed for {path}");
    }
}

#[test]
fn lookup_rejects_file_mid_path() {
    let mut image = fresh();
    image
        .put_file(&root(&image), "notadir", &pattern(10), false)
        .unwrap();

    assert!(matches!(
        image.lookup(None, "notadir/below"),
        Err(RmxError::NotDirectory(_))
    ));
    assert!(matches!(
        image.lookup(None, "missing"),
        Err(RmxError::NotFound(_))
    ));
}

#[test]
fn empty_path_resolves_to_root() {
    let image = fresh();
    let hit = image.lookup(None, "").unwrap();
    assert!(hit.fnode.is_directory());
    assert!(hit.parent.is_none());

    let slash = image.lookup(None, "/").unwrap();
    assert_eq!(slash.fnode.number, hit.fnode.number);
}

#[test]
fn delete_restores_free_space() {
    let mut image = fresh();
    let before = image.free_counts().unwrap();

    image
        .put_file(&root(&image), "scratch", &pattern(2000), false)
        .unwrap();
    assert_ne!(image.free_counts().unwrap(), before);

    let mut hit = image.lookup(None, "scratch").unwrap();
    let mut dir = hit.parent.take().unwrap();
    image.delete_fnode(&mut hit.fnode, &mut dir).unwrap();

    assert_eq!(image.free_counts().unwrap(), before);
    assert!(matches!(
        image.lookup(None, "scratch"),
        Err(RmxError::NotFound(_))
    ));
    assert_clean(&image);
}

#[test]
fn deleted_entry_slot_is_reused() {
    let mut image = fresh();
    image
        .put_file(&root(&image), "first", &pattern(100), false)
        .unwrap();
    let entries_after_first = image.directory(&root(&image)).unwrap().entries.len();

    let mut hit = image.lookup(None, "first").unwrap();
    let mut dir = hit.parent.take().unwrap();
    image.delete_fnode(&mut hit.fnode, &mut dir).unwrap();

    image
        .put_file(&root(&image), "second", &pattern(100), false)
        .unwrap();
    let dir = image.directory(&root(&image)).unwrap();
    assert_eq!(dir.entries.len(), entries_after_first);
    assert!(dir.find("second").is_some());
}

#[test]
fn contiguous_allocation_yields_one_run() {
    let mut image = fresh();

    // Punch a one-block hole so the low free region cannot satisfy a
    // three-block contiguous request.
    image
        .put_file(&root(&image), "hole", &pattern(GRAN), false)
        .unwrap();
    image
        .put_file(&root(&image), "plug", &pattern(GRAN), false)
        .unwrap();
    let mut hit = image.lookup(None, "hole").unwrap();
    let mut dir = hit.parent.take().unwrap();
    image.delete_fnode(&mut hit.fnode, &mut dir).unwrap();

    let fnode = image
        .put_file(&root(&image), "contig", &pattern(3 * GRAN), true)
        .unwrap();
    let live: Vec<_> = fnode
        .pointers
        .iter()
        .filter(|p| p.num_blocks != 0)
        .collect();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].num_blocks, 3);
    assert_clean(&image);
}

#[test]
fn fragmented_allocation_fills_holes() {
    let mut image = fresh();

    image
        .put_file(&root(&image), "hole", &pattern(GRAN), false)
        .unwrap();
    image
        .put_file(&root(&image), "plug", &pattern(GRAN), false)
        .unwrap();
    let mut hit = image.lookup(None, "hole").unwrap();
    let mut dir = hit.parent.take().unwrap();
    image.delete_fnode(&mut hit.fnode, &mut dir).unwrap();

    let data = pattern(3 * GRAN);
    let fnode = image.put_file(&root(&image), "frag", &data, false).unwrap();
    let live: Vec<_> = fnode
        .pointers
        .iter()
        .filter(|p| p.num_blocks != 0)
        .collect();
    assert_eq!(live.len(), 2, "expected the hole plus a tail run");

    let mut hit = image.lookup(None, "frag").unwrap();
    assert_eq!(image.read_file(&mut hit.fnode).unwrap(), data);
    assert_clean(&image);
}

#[test]
fn nine_fragments_exceed_pointer_slots() {
    let mut image = fresh();

    // Alternate files and spacers, then delete the files: nine
    // single-block holes separated by allocated spacers.
    for i in 0..9 {
        image
            .put_file(&root(&image), &format!("hole{i}"), &pattern(GRAN), false)
            .unwrap();
        image
            .put_file(&root(&image), &format!("spacer{i}"), &pattern(GRAN), false)
            .unwrap();
    }
    for i in 0..9 {
        let mut hit = image.lookup(None, &format!("hole{i}")).unwrap();
        let mut dir = hit.parent.take().unwrap();
        image.delete_fnode(&mut hit.fnode, &mut dir).unwrap();
    }

    let result = image.put_file(&root(&image), "sprawl", &pattern(9 * GRAN), false);
    assert!(matches!(result, Err(RmxError::TooManyRuns(9))));
}

#[test]
fn oversized_requests_fail_cleanly() {
    let mut image = fresh();
    let free = image.free_counts().unwrap().blocks;

    // One past the largest possible run.
    assert!(matches!(
        image.put_file(&root(&image), "big", &pattern((free + 1) * GRAN), true),
        Err(RmxError::NoContiguousRange(_))
    ));
    // And past the total free space without the contiguity requirement.
    assert!(matches!(
        image.put_file(&root(&image), "huge", &pattern((free + 1) * GRAN), false),
        Err(RmxError::NoFreeBlock)
    ));
}

#[test]
fn mkdir_tree_and_nested_puts() {
    let mut image = fresh();

    image.mkdir(&root(&image), "system").unwrap();
    image.mkdir(&root(&image), "user").unwrap();
    let user = image.lookup(None, "user").unwrap();
    image.mkdir(&user.fnode, "world").unwrap();
    image.mkdir(&root(&image), "lang").unwrap();

    let files = [
        ("country.txt", None, 700),
        ("lamb.txt", Some("/system"), 1500),
        ("odyssey.txt", Some("/user/world"), 4096),
        ("scott.txt", Some("/lang"), 333),
    ];
    for (name, dir, len) in files {
        let parent = match dir {
            Some(d) => image.lookup(None, d).unwrap().fnode,
            None => root(&image),
        };
        image.put_file(&parent, name, &pattern(len), false).unwrap();
    }

    for (name, dir, len) in files {
        let path = match dir {
            Some(d) => format!("{d}/{name}"),
            None => name.to_owned(),
        };
        let mut hit = image.lookup(None, &path).unwrap();
        assert_eq!(image.read_file(&mut hit.fnode).unwrap(), pattern(len));
    }
    assert_clean(&image);
}

#[test]
fn wipe_then_refill() {
    let mut image = fresh();
    let before = image.free_counts().unwrap();

    image.mkdir(&root(&image), "system").unwrap();
    let sys = image.lookup(None, "system").unwrap();
    image
        .put_file(&sys.fnode, "rmx86", &pattern(5000), false)
        .unwrap();
    image
        .put_file(&root(&image), "instal.csd", &pattern(300), false)
        .unwrap();

    image.wipe().unwrap();

    assert_eq!(image.free_counts().unwrap(), before);
    assert!(matches!(
        image.lookup(None, "system"),
        Err(RmxError::NotFound(_))
    ));
    assert_clean(&image);

    // The wiped volume accepts a fresh tree.
    image.mkdir(&root(&image), "user").unwrap();
    let user = image.lookup(None, "user").unwrap();
    image
        .put_file(&user.fnode, "odyssey.txt", &pattern(900), false)
        .unwrap();
    let mut hit = image.lookup(None, "user/odyssey.txt").unwrap();
    assert_eq!(image.read_file(&mut hit.fnode).unwrap(), pattern(900));
    assert_clean(&image);
}

#[test]
fn wipe_preserves_system_fnodes() {
    let mut image = fresh();
    image.wipe().unwrap();

    // The bitmap files and the root are still in place.
    for index in [1u16, 2, 6] {
        assert!(image.fnode(index).unwrap().is_allocated());
    }
    let dir = image.directory(&root(&image)).unwrap();
    assert!(dir.find("r?spacemap").is_some());
    assert_clean(&image);
}

#[test]
fn long_file_read_traverses_indirect_blocks() {
    let mut bytes = build_image();
    let expected = rmxfs_harness::add_long_file(&mut bytes, "kernel.sys");
    let image = RmxImage::from_bytes(bytes).unwrap();

    let mut hit = image.lookup(None, "kernel.sys").unwrap();
    assert!(hit.fnode.is_long());
    assert_eq!(image.read_file(&mut hit.fnode).unwrap(), expected);
    assert_eq!(hit.fnode.indirect_blocks, vec![29]);
    assert_eq!(hit.fnode.data_blocks, vec![30, 31, 33]);
    assert_clean(&image);
}

#[test]
fn deleting_long_file_frees_indirect_blocks() {
    let mut bytes = build_image();
    rmxfs_harness::add_long_file(&mut bytes, "kernel.sys");
    let mut image = RmxImage::from_bytes(bytes).unwrap();

    let mut hit = image.lookup(None, "kernel.sys").unwrap();
    let mut dir = hit.parent.take().unwrap();
    image.delete_fnode(&mut hit.fnode, &mut dir).unwrap();

    let counts = image.free_counts().unwrap();
    assert_eq!(counts.blocks, TOTAL_BLOCKS - ALLOCATED_BLOCKS);
    assert_clean(&image);
}

#[test]
fn writing_a_long_fnode_is_refused() {
    let mut bytes = build_image();
    rmxfs_harness::add_long_file(&mut bytes, "kernel.sys");
    let mut image = RmxImage::from_bytes(bytes).unwrap();

    let mut hit = image.lookup(None, "kernel.sys").unwrap();
    assert!(matches!(
        image.put_data(&mut hit.fnode, &pattern(10), false),
        Err(RmxError::LongFileUnsupported)
    ));
}

#[test]
fn grow_fnode_table_in_place() {
    let mut image = fresh();
    image
        .put_file(&root(&image), "keepme", &pattern(777), false)
        .unwrap();
    let free_fnodes_before = image.free_counts().unwrap().fnodes;

    image.grow_fnode_table(128).unwrap();

    let vl = image.volume_label().unwrap();
    assert_eq!(vl.max_fnode, 128);

    // The new slots exist, are unallocated, and are marked free.
    let high = image.fnode(127).unwrap();
    assert!(!high.is_allocated());
    assert_eq!(image.free_counts().unwrap().fnodes, free_fnodes_before + 64);

    // Existing contents survived the table move.
    let mut hit = image.lookup(None, "keepme").unwrap();
    assert_eq!(image.read_file(&mut hit.fnode).unwrap(), pattern(777));
    assert_clean(&image);

    // And the new capacity is actually usable.
    image
        .put_file(&root(&image), "newfile", &pattern(100), false)
        .unwrap();
    assert_clean(&image);
}

#[test]
fn grow_fnode_table_extends_map_backing() {
    let mut image = fresh();
    // 2080 fnodes need 260 bitmap bytes, beyond the map's single block.
    image.grow_fnode_table(2080).unwrap();

    let vl = image.volume_label().unwrap();
    assert_eq!(vl.max_fnode, 2080);
    let map = image.fnode_map().unwrap();
    assert_eq!(map.bits.num_bits(), 2080);
    assert!(map.fnode.total_blocks > 1, "backing file grew");
    assert!(!map.bits.is_alloc(2079));
    assert_clean(&image);
}

#[test]
fn grow_rejects_non_growth() {
    let mut image = fresh();
    assert!(matches!(
        image.grow_fnode_table(64),
        Err(RmxError::InvalidArgument(_))
    ));
    assert!(matches!(
        image.grow_fnode_table(10),
        Err(RmxError::InvalidArgument(_))
    ));
}

#[test]
fn exhausting_fnodes_reports_no_free_fnode() {
    let mut image = fresh();
    let free = image.free_counts().unwrap().fnodes;
    for i in 0..free {
        image
            .put_file(&root(&image), &format!("n{i}"), &pattern(1), false)
            .unwrap();
    }
    assert!(matches!(
        image.put_file(&root(&image), "overflow", &pattern(1), false),
        Err(RmxError::NoFreeFnode)
    ));
}
