#![forbid(unsafe_code)]
//! Synthetic volume fixtures.
//!
//! Builds a small, fully self-consistent volume image in memory: boot and
//! label region owned by a volume-label file, fnode table, both bitmap
//! files, and a root directory listing the system files. The geometry is
//! deliberately tiny so integration suites can exhaust blocks and fnodes
//! quickly, and every allocation invariant holds on the fresh image so a
//! consistency check passes with zero findings.

use rmxfs_ondisk::{DirEntry, Fnode, PointerSlot, VolumeLabel, serialize_dir_entries};
use rmxfs_types::{
    ACCESS_ALL, FLAG_ALLOCATED, FLAG_LONG_FILE, FLAG_PRIMARY, TYPE_ACCOUNT, TYPE_DATA,
    TYPE_DIRECTORY, TYPE_FNODE_MAP, TYPE_FNODE_TABLE, TYPE_VOLUME_LABEL, TYPE_VOLUME_MAP,
    VOLUME_LABEL_OFFSET,
};

/// Block size of the fixture volume.
pub const GRAN: usize = 256;
/// Total bytes on the fixture volume.
pub const VOLUME_SIZE: usize = 262_144;
/// Blocks on the fixture volume.
pub const TOTAL_BLOCKS: usize = VOLUME_SIZE / GRAN;
/// Fnode table capacity.
pub const MAX_FNODE: u16 = 64;
/// Table stride in bytes.
pub const FNODE_SIZE: usize = 87;
/// Byte offset of the fnode table (block 4).
pub const FNODE_START: usize = 1024;
/// Root directory fnode number.
pub const ROOT_FNODE: u16 = 6;

/// Blocks the fresh fixture has allocated: labels, table, bitmap files,
/// and the root directory (0..=28).
pub const ALLOCATED_BLOCKS: usize = 29;

const TABLE_BLOCKS: usize = 22; // ceil(64 * 87 / 256)
const VOLMAP_BLOCK: usize = 26;
const FNODEMAP_BLOCK: usize = 27;
const ROOTDIR_BLOCK: usize = 28;

fn fnode_offset(index: u16) -> usize {
    FNODE_START + usize::from(index) * FNODE_SIZE
}

fn put_fnode_raw(image: &mut [u8], index: u16, fnode: &Fnode) {
    let offset = fnode_offset(index);
    fnode
        .serialize(&mut image[offset..offset + FNODE_SIZE])
        .expect("fixture fnode slot");
}

fn system_fnode(ftype: u8, run: Option<(u16, u32)>, total_size: u32) -> Fnode {
    let mut fnode = Fnode {
        flags: FLAG_ALLOCATED | FLAG_PRIMARY,
        ftype,
        gran: 1,
        total_size,
        ..Fnode::default()
    };
    if let Some((num_blocks, block)) = run {
        fnode.pointers[0] = PointerSlot { num_blocks, block };
        fnode.total_blocks = u32::from(num_blocks);
        fnode.this_size = u32::from(num_blocks) * GRAN as u32;
    }
    fnode.add_accessor(ACCESS_ALL, 0).expect("fixture accessor");
    fnode
}

/// Build the fixture image.
#[must_use]
pub fn build_image() -> Vec<u8> {
    let mut image = vec![0u8; VOLUME_SIZE];

    let label = VolumeLabel {
        name: "workvol".into(),
        fill: 0,
        driver: 4,
        gran: GRAN as u16,
        size: VOLUME_SIZE as u32,
        max_fnode: MAX_FNODE,
        fnode_start: FNODE_START as u32,
        fnode_size: FNODE_SIZE as u16,
        root_fnode: ROOT_FNODE,
    };
    label
        .serialize(&mut image[VOLUME_LABEL_OFFSET..VOLUME_LABEL_OFFSET + 28])
        .expect("fixture label");

    // Informational ISO-style label.
    let iso = &mut image[768..848];
    iso.fill(b' ');
    iso[0..3].copy_from_slice(b"VOL");
    iso[3] = 0;
    iso[4..10].copy_from_slice(b"RMXSYS");
    iso[10] = b'R';
    iso[71] = b'1';
    iso[76] = b'0';
    iso[77] = b'1';
    iso[79] = b'1';

    // System fnodes. The volume-label file owns the boot/label blocks so
    // every allocated block has exactly one owner.
    put_fnode_raw(
        &mut image,
        0,
        &system_fnode(
            TYPE_FNODE_TABLE,
            Some((TABLE_BLOCKS as u16, 4)),
            (usize::from(MAX_FNODE) * FNODE_SIZE) as u32,
        ),
    );
    put_fnode_raw(
        &mut image,
        1,
        &system_fnode(
            TYPE_VOLUME_MAP,
            Some((1, VOLMAP_BLOCK as u32)),
            (TOTAL_BLOCKS / 8) as u32,
        ),
    );
    put_fnode_raw(
        &mut image,
        2,
        &system_fnode(
            TYPE_FNODE_MAP,
            Some((1, FNODEMAP_BLOCK as u32)),
            u32::from(MAX_FNODE / 8),
        ),
    );
    put_fnode_raw(&mut image, 3, &system_fnode(TYPE_ACCOUNT, None, 0));
    put_fnode_raw(
        &mut image,
        5,
        &system_fnode(TYPE_VOLUME_LABEL, Some((4, 0)), 1024),
    );

    let root_entries = vec![
        DirEntry {
            fnode: 1,
            name: "r?spacemap".into(),
        },
        DirEntry {
            fnode: 2,
            name: "r?fnodemap".into(),
        },
        DirEntry {
            fnode: 5,
            name: "r?volumelabel".into(),
        },
    ];
    let root_bytes = serialize_dir_entries(&root_entries);
    put_fnode_raw(
        &mut image,
        ROOT_FNODE,
        &system_fnode(
            TYPE_DIRECTORY,
            Some((1, ROOTDIR_BLOCK as u32)),
            root_bytes.len() as u32,
        ),
    );
    let dir_start = ROOTDIR_BLOCK * GRAN;
    image[dir_start..dir_start + root_bytes.len()].copy_from_slice(&root_bytes);

    // Volume map: blocks 0..=28 allocated (bit 0), the rest free (bit 1).
    let vmap_start = VOLMAP_BLOCK * GRAN;
    for byte in &mut image[vmap_start..vmap_start + TOTAL_BLOCKS / 8] {
        *byte = 0xFF;
    }
    for block in 0..ALLOCATED_BLOCKS {
        image[vmap_start + block / 8] &= !(1 << (block % 8));
    }

    // Fnode map: 0, 1, 2, 3, 5, 6 allocated.
    let fmap_start = FNODEMAP_BLOCK * GRAN;
    for byte in &mut image[fmap_start..fmap_start + usize::from(MAX_FNODE) / 8] {
        *byte = 0xFF;
    }
    for fnode in [0u16, 1, 2, 3, 5, 6] {
        let n = usize::from(fnode);
        image[fmap_start + n / 8] &= !(1 << (n % 8));
    }

    image
}

/// Splice a long (indirect-block) file into a fixture image and return its
/// expected contents.
///
/// The file lands at fnode 7 under the given root-directory name: one
/// indirect block at 29 describing runs `{2, 30}` and `{1, 33}`, 700 bytes
/// of patterned data across those three blocks. Block 32 stays free, so
/// the data runs are genuinely discontiguous.
pub fn add_long_file(image: &mut [u8], name: &str) -> Vec<u8> {
    const INDIRECT: usize = 29;
    const FILE_FNODE: u16 = 7;
    const FILE_SIZE: usize = 700;

    // Indirect block: {count u8, block u24} entries, zero-count skipped.
    let ind = INDIRECT * GRAN;
    image[ind..ind + GRAN].fill(0);
    image[ind] = 2;
    image[ind + 1..ind + 4].copy_from_slice(&[30, 0, 0]);
    // A zero-count hole between the runs.
    image[ind + 8] = 1;
    image[ind + 9..ind + 12].copy_from_slice(&[33, 0, 0]);

    // Patterned contents across blocks 30, 31, 33.
    let full: Vec<u8> = (0..3 * GRAN).map(|i| (i % 251) as u8).collect();
    image[30 * GRAN..32 * GRAN].copy_from_slice(&full[..2 * GRAN]);
    image[33 * GRAN..34 * GRAN].copy_from_slice(&full[2 * GRAN..]);

    let mut fnode = Fnode {
        flags: FLAG_ALLOCATED | FLAG_PRIMARY | FLAG_LONG_FILE,
        ftype: TYPE_DATA,
        gran: 1,
        owner: ROOT_FNODE,
        total_size: FILE_SIZE as u32,
        total_blocks: 4, // three data blocks plus the indirect block
        this_size: 4 * GRAN as u32,
        ..Fnode::default()
    };
    fnode.pointers[0] = PointerSlot {
        num_blocks: 1,
        block: INDIRECT as u32,
    };
    fnode.add_accessor(ACCESS_ALL, 0).expect("fixture accessor");
    put_fnode_raw(image, FILE_FNODE, &fnode);

    // Mark blocks 29, 30, 31, 33 allocated; mark fnode 7 allocated.
    let vmap_start = VOLMAP_BLOCK * GRAN;
    for block in [29usize, 30, 31, 33] {
        image[vmap_start + block / 8] &= !(1 << (block % 8));
    }
    let fmap_start = FNODEMAP_BLOCK * GRAN;
    image[fmap_start + usize::from(FILE_FNODE) / 8] &= !(1 << (usize::from(FILE_FNODE) % 8));

    // Link it under the root and grow the root's size by one entry.
    let root_offset = fnode_offset(ROOT_FNODE);
    let mut root = Fnode::parse(&image[root_offset..root_offset + FNODE_SIZE]).expect("root");
    let entry_offset = ROOTDIR_BLOCK * GRAN + root.total_size as usize;
    let entry = serialize_dir_entries(&[DirEntry {
        fnode: FILE_FNODE,
        name: name.to_owned(),
    }]);
    image[entry_offset..entry_offset + entry.len()].copy_from_slice(&entry);
    root.total_size += 16;
    put_fnode_raw(image, ROOT_FNODE, &root);

    full[..FILE_SIZE].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixture_geometry_is_coherent() {
        let image = build_image();
        assert_eq!(image.len(), VOLUME_SIZE);
        // 22 table blocks really hold 64 records.
        assert!(TABLE_BLOCKS * GRAN >= usize::from(MAX_FNODE) * FNODE_SIZE);

        let label =
            VolumeLabel::parse(&image[VOLUME_LABEL_OFFSET..VOLUME_LABEL_OFFSET + 28]).unwrap();
        assert_eq!(label.name, "workvol");
        assert_eq!(usize::from(label.gran), GRAN);
        assert_eq!(label.block_count(), TOTAL_BLOCKS);
        assert_eq!(label.root_fnode, ROOT_FNODE);
    }

    #[test]
    fn root_directory_lists_system_files() {
        let image = build_image();
        let root_offset = fnode_offset(ROOT_FNODE);
        let root = Fnode::parse(&image[root_offset..root_offset + FNODE_SIZE]).unwrap();
        assert!(root.is_directory());
        assert_eq!(root.total_size, 48);
    }
}
