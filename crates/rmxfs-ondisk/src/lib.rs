#![forbid(unsafe_code)]
//! On-disk records: volume labels, fnodes, and directory entries.
//!
//! Records are short-lived views. Each `parse` reads fresh bytes out of the
//! image buffer and each `serialize` writes the same fixed offsets back;
//! nothing here touches the buffer itself — that is the engine's job.

use rmxfs_error::{Result, RmxError};
use rmxfs_types::{
    DIR_ENTRY_LEN, FLAG_ALLOCATED, FLAG_LONG_FILE, FLAG_NO_DELETE, FLAG_PRIMARY, FLAG_UNMODIFIED,
    NUM_ACCESSORS, NUM_POINTERS, ParseError, TYPE_DIRECTORY, VOLUME_NAME_LEN, ensure_slice,
    read_le_u16, read_le_u24, read_le_u32, str_from_fixed, str_to_fixed, write_le_u16,
    write_le_u24, write_le_u32,
};
use serde::{Deserialize, Serialize};

/// Bytes of one fnode record that carry data (the table stride,
/// `fnode_size`, may be larger).
pub const FNODE_RECORD_LEN: usize = 87;

// ── Volume label ────────────────────────────────────────────────────────────

/// The volume label at byte 384: geometry constants for the whole image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeLabel {
    pub name: String,
    pub fill: u8,
    pub driver: u8,
    /// Block size in bytes (granularity).
    pub gran: u16,
    /// Total volume size in bytes.
    pub size: u32,
    pub max_fnode: u16,
    /// Byte offset of the fnode table.
    pub fnode_start: u32,
    /// Bytes per fnode record (table stride).
    pub fnode_size: u16,
    /// Fnode number of the root directory.
    pub root_fnode: u16,
}

impl VolumeLabel {
    pub fn parse(data: &[u8]) -> std::result::Result<Self, ParseError> {
        Ok(Self {
            name: str_from_fixed(ensure_slice(data, 0, VOLUME_NAME_LEN)?),
            fill: ensure_slice(data, 10, 1)?[0],
            driver: ensure_slice(data, 11, 1)?[0],
            gran: read_le_u16(data, 12)?,
            size: read_le_u32(data, 14)?,
            max_fnode: read_le_u16(data, 18)?,
            fnode_start: read_le_u32(data, 20)?,
            fnode_size: read_le_u16(data, 24)?,
            root_fnode: read_le_u16(data, 26)?,
        })
    }

    pub fn serialize(&self, data: &mut [u8]) -> std::result::Result<(), ParseError> {
        if data.len() < 28 {
            return Err(ParseError::InsufficientData {
                needed: 28,
                offset: 0,
                actual: data.len(),
            });
        }
        str_to_fixed(&mut data[0..VOLUME_NAME_LEN], &self.name);
        data[10] = self.fill;
        data[11] = self.driver;
        write_le_u16(data, 12, self.gran);
        write_le_u32(data, 14, self.size);
        write_le_u16(data, 18, self.max_fnode);
        write_le_u32(data, 20, self.fnode_start);
        write_le_u16(data, 24, self.fnode_size);
        write_le_u16(data, 26, self.root_fnode);
        Ok(())
    }

    /// Number of blocks on the volume.
    #[must_use]
    pub fn block_count(&self) -> usize {
        if self.gran == 0 {
            0
        } else {
            self.size as usize / usize::from(self.gran)
        }
    }
}

// ── ISO-style volume label ──────────────────────────────────────────────────

/// The informational ISO-style label at byte 768.
///
/// Only the byte offsets the original format populates are decoded; the
/// label is written back exactly as read apart from those fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsoVolumeLabel {
    pub label_id: String,
    pub name: String,
    pub structure: char,
    pub side: i32,
    pub interleave: i32,
    pub version: i32,
}

impl IsoVolumeLabel {
    pub fn parse(data: &[u8]) -> std::result::Result<Self, ParseError> {
        let digit = |b: u8| i32::from(b) - i32::from(b'0');
        ensure_slice(data, 0, 80)?;
        Ok(Self {
            label_id: str_from_fixed(&data[0..3]),
            name: str_from_fixed(&data[4..10]),
            structure: char::from(data[10]),
            side: digit(data[71]),
            interleave: digit(data[76]) * 10 + digit(data[77]),
            version: digit(data[79]),
        })
    }

    pub fn serialize(&self, data: &mut [u8]) -> std::result::Result<(), ParseError> {
        if data.len() < 80 {
            return Err(ParseError::InsufficientData {
                needed: 80,
                offset: 0,
                actual: data.len(),
            });
        }
        let id = self.label_id.as_bytes();
        data[0..id.len().min(3)].copy_from_slice(&id[..id.len().min(3)]);
        let name = self.name.as_bytes();
        data[4..4 + name.len().min(6)].copy_from_slice(&name[..name.len().min(6)]);
        data[10] = self.structure as u8;
        #[expect(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        {
            data[71] = (self.side + i32::from(b'0')) as u8;
            data[76] = (self.interleave / 10 + i32::from(b'0')) as u8;
            data[77] = (self.interleave % 10 + i32::from(b'0')) as u8;
            data[79] = (self.version + i32::from(b'0')) as u8;
        }
        Ok(())
    }
}

// ── Fnode ───────────────────────────────────────────────────────────────────

/// One of the eight pointer slots in an fnode.
///
/// For a short file, a non-empty slot names a contiguous run of
/// `num_blocks` data blocks starting at `block`. For a long file the slot
/// names a single indirect block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointerSlot {
    pub num_blocks: u16,
    /// 24-bit block pointer.
    pub block: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Accessor {
    pub access: u8,
    pub id: u16,
}

/// A file-index record: the on-disk descriptor of one file, directory,
/// bitmap, or metadata object.
///
/// The serialized fields live in the fnode table; `number`, `name`, and the
/// resolved block lists are in-memory view state maintained by the engine
/// (`name` by path lookup, the block lists by `read_file`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fnode {
    pub flags: u16,
    pub ftype: u8,
    /// Per-file block-size multiplier.
    pub gran: u8,
    pub owner: u16,
    pub create_time: u32,
    pub access_time: u32,
    pub modify_time: u32,
    pub total_size: u32,
    pub total_blocks: u32,
    pub pointers: [PointerSlot; NUM_POINTERS],
    pub this_size: u32,
    pub reserved_a: u16,
    pub reserved_b: u16,
    pub id_count: u16,
    pub accessors: [Accessor; NUM_ACCESSORS],
    pub parent: u16,

    // View state, never serialized.
    pub number: u16,
    pub name: Option<String>,
    pub data_blocks: Vec<u32>,
    pub indirect_blocks: Vec<u32>,
}

impl Fnode {
    pub fn parse(data: &[u8]) -> std::result::Result<Self, ParseError> {
        ensure_slice(data, 0, FNODE_RECORD_LEN)?;
        let mut fnode = Self {
            flags: read_le_u16(data, 0)?,
            ftype: data[2],
            gran: data[3],
            owner: read_le_u16(data, 4)?,
            create_time: read_le_u32(data, 6)?,
            access_time: read_le_u32(data, 10)?,
            modify_time: read_le_u32(data, 14)?,
            total_size: read_le_u32(data, 18)?,
            total_blocks: read_le_u32(data, 22)?,
            this_size: read_le_u32(data, 66)?,
            reserved_a: read_le_u16(data, 70)?,
            reserved_b: read_le_u16(data, 72)?,
            id_count: read_le_u16(data, 74)?,
            parent: read_le_u16(data, 85)?,
            ..Self::default()
        };
        for (i, slot) in fnode.pointers.iter_mut().enumerate() {
            slot.num_blocks = read_le_u16(data, 26 + i * 5)?;
            slot.block = read_le_u24(data, 28 + i * 5)?;
        }
        for (i, acc) in fnode.accessors.iter_mut().enumerate() {
            acc.access = data[76 + i * 3];
            acc.id = read_le_u16(data, 77 + i * 3)?;
        }
        Ok(fnode)
    }

    pub fn serialize(&self, data: &mut [u8]) -> std::result::Result<(), ParseError> {
        if data.len() < FNODE_RECORD_LEN {
            return Err(ParseError::InsufficientData {
                needed: FNODE_RECORD_LEN,
                offset: 0,
                actual: data.len(),
            });
        }
        write_le_u16(data, 0, self.flags);
        data[2] = self.ftype;
        data[3] = self.gran;
        write_le_u16(data, 4, self.owner);
        write_le_u32(data, 6, self.create_time);
        write_le_u32(data, 10, self.access_time);
        write_le_u32(data, 14, self.modify_time);
        write_le_u32(data, 18, self.total_size);
        write_le_u32(data, 22, self.total_blocks);
        for (i, slot) in self.pointers.iter().enumerate() {
            write_le_u16(data, 26 + i * 5, slot.num_blocks);
            write_le_u24(data, 28 + i * 5, slot.block);
        }
        write_le_u32(data, 66, self.this_size);
        write_le_u16(data, 70, self.reserved_a);
        write_le_u16(data, 72, self.reserved_b);
        write_le_u16(data, 74, self.id_count);
        for (i, acc) in self.accessors.iter().enumerate() {
            data[76 + i * 3] = acc.access;
            write_le_u16(data, 77 + i * 3, acc.id);
        }
        write_le_u16(data, 85, self.parent);
        Ok(())
    }

    #[must_use]
    pub fn is_allocated(&self) -> bool {
        self.flags & FLAG_ALLOCATED != 0
    }

    #[must_use]
    pub fn is_long(&self) -> bool {
        self.flags & FLAG_LONG_FILE != 0
    }

    #[must_use]
    pub fn is_primary(&self) -> bool {
        self.flags & FLAG_PRIMARY != 0
    }

    #[must_use]
    pub fn is_unmodified(&self) -> bool {
        self.flags & FLAG_UNMODIFIED != 0
    }

    #[must_use]
    pub fn is_no_delete(&self) -> bool {
        self.flags & FLAG_NO_DELETE != 0
    }

    #[must_use]
    pub fn is_directory(&self) -> bool {
        self.ftype == TYPE_DIRECTORY
    }

    pub fn set_alloc(&mut self, alloc: bool) {
        if alloc {
            self.flags |= FLAG_ALLOCATED;
        } else {
            self.flags &= !FLAG_ALLOCATED;
        }
    }

    /// Lowest pointer slot with no blocks, if any.
    #[must_use]
    pub fn free_pointer(&self) -> Option<usize> {
        self.pointers.iter().position(|p| p.num_blocks == 0)
    }

    /// Append an accessor slot; at most three fit.
    pub fn add_accessor(&mut self, access: u8, id: u16) -> Result<()> {
        let idx = usize::from(self.id_count);
        if idx >= NUM_ACCESSORS {
            return Err(RmxError::TooManyAccessors);
        }
        self.accessors[idx] = Accessor { access, id };
        self.id_count += 1;
        Ok(())
    }
}

// ── Directory entries ───────────────────────────────────────────────────────

/// One 16-byte directory entry. A zero fnode number marks a free slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub fnode: u16,
    pub name: String,
}

/// Decode as many whole 16-byte entries as `data` holds.
#[must_use]
pub fn parse_dir_entries(data: &[u8]) -> Vec<DirEntry> {
    data.chunks_exact(DIR_ENTRY_LEN)
        .map(|chunk| DirEntry {
            fnode: u16::from_le_bytes([chunk[0], chunk[1]]),
            name: str_from_fixed(&chunk[2..DIR_ENTRY_LEN]),
        })
        .collect()
}

/// Encode an entry list back to its packed form; names truncate to 14 bytes.
#[must_use]
pub fn serialize_dir_entries(entries: &[DirEntry]) -> Vec<u8> {
    let mut out = vec![0u8; entries.len() * DIR_ENTRY_LEN];
    for (chunk, entry) in out.chunks_exact_mut(DIR_ENTRY_LEN).zip(entries) {
        write_le_u16(chunk, 0, entry.fnode);
        str_to_fixed(&mut chunk[2..DIR_ENTRY_LEN], &entry.name);
    }
    out
}
