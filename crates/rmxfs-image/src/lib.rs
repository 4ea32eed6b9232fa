#![forbid(unsafe_code)]
//! The filesystem engine.
//!
//! One [`RmxImage`] owns the image byte buffer for its lifetime; the buffer
//! is both the working state and the persisted artifact. Fnodes,
//! directories, and bitmap files are short-lived views: every accessor
//! deserializes fresh bytes out of the buffer, and every mutation is
//! written back through an explicit engine method before another view of
//! the same region is taken. There is no cross-call caching beyond the
//! block lists `read_file` resolves onto the fnode it was given.

use rmxfs_alloc::{Bitmap, RangeError};
use rmxfs_error::{Result, RmxError};
use rmxfs_imd::ImageDisk;
use rmxfs_ondisk::{DirEntry, Fnode, IsoVolumeLabel, PointerSlot, VolumeLabel};
use rmxfs_ondisk::{parse_dir_entries, serialize_dir_entries};
use rmxfs_types::{
    ACCESS_ALL, DIR_ENTRY_LEN, DIR_NAME_LEN, FLAG_ALLOCATED, FLAG_PRIMARY, ISO_LABEL_LEN,
    ISO_LABEL_OFFSET, MIN_IMAGE_LEN, NUM_POINTERS, TYPE_DIRECTORY, VOLUME_LABEL_OFFSET, blocks_for,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Fnode number of the block (volume) bitmap file.
pub const VOLUME_MAP_FNODE: u16 = 1;
/// Fnode number of the fnode bitmap file.
pub const FNODE_MAP_FNODE: u16 = 2;
/// Highest reserved system fnode; `wipe` never deletes at or below this.
pub const LAST_RESERVED_FNODE: u16 = 6;

// ── Views ───────────────────────────────────────────────────────────────────

/// An allocation bitmap together with the fnode whose file stores it, so
/// writes go back through that fnode's data blocks.
#[derive(Debug, Clone)]
pub struct BitmapFile {
    pub bits: Bitmap,
    pub fnode: Fnode,
}

/// A decoded directory: the entry list plus its backing fnode (with block
/// lists resolved, so the directory can be rewritten in place).
#[derive(Debug, Clone)]
pub struct Directory {
    pub entries: Vec<DirEntry>,
    pub fnode: Fnode,
}

impl Directory {
    /// Find a live entry by name, ASCII case-insensitively.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<u16> {
        self.entries
            .iter()
            .find(|e| e.fnode != 0 && e.name.eq_ignore_ascii_case(name))
            .map(|e| e.fnode)
    }

    /// Clear every entry matching `name`, leaving the slots free for reuse.
    pub fn unlink(&mut self, name: &str) -> Result<()> {
        let mut found = false;
        for entry in &mut self.entries {
            if entry.name.eq_ignore_ascii_case(name) {
                entry.fnode = 0;
                found = true;
            }
        }
        if found {
            Ok(())
        } else {
            Err(RmxError::NotFound(name.to_owned()))
        }
    }

    /// Live entries, in directory order.
    pub fn live_entries(&self) -> impl Iterator<Item = &DirEntry> {
        self.entries.iter().filter(|e| e.fnode != 0)
    }
}

/// The result of a path lookup: the leaf fnode (with its entry name
/// attached) and, unless the path was empty, the directory it was found in.
#[derive(Debug, Clone)]
pub struct Lookup {
    pub fnode: Fnode,
    pub parent: Option<Directory>,
}

/// Free-space totals for the `free` surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FreeCounts {
    pub blocks: usize,
    pub fnodes: usize,
}

// ── Engine ──────────────────────────────────────────────────────────────────

/// A loaded disk image and every operation that mutates it.
#[derive(Debug)]
pub struct RmxImage {
    contents: Vec<u8>,
    byte_swap: bool,
    file_name: Option<PathBuf>,
    imd: Option<ImageDisk>,
}

impl RmxImage {
    /// Load an image from disk.
    ///
    /// Paths with an `.imd` extension (case-insensitive) go through the
    /// container codec; `byte_swap` swaps every adjacent byte pair across
    /// the whole buffer after container decode.
    pub fn load(path: impl AsRef<Path>, byte_swap: bool) -> Result<Self> {
        let path = path.as_ref();
        let (mut contents, imd) = if is_imd_path(path) {
            let imd = ImageDisk::load(path)?;
            let contents = imd.data()?;
            (contents, Some(imd))
        } else {
            (std::fs::read(path)?, None)
        };
        if byte_swap {
            swap_byte_pairs(&mut contents);
        }
        debug!(path = %path.display(), bytes = contents.len(), byte_swap, "loaded image");

        let image = Self {
            contents,
            byte_swap,
            file_name: Some(path.to_path_buf()),
            imd,
        };
        image.validate()?;
        Ok(image)
    }

    /// Wrap an already-decoded flat byte buffer.
    pub fn from_bytes(contents: Vec<u8>) -> Result<Self> {
        let image = Self {
            contents,
            byte_swap: false,
            file_name: None,
            imd: None,
        };
        image.validate()?;
        Ok(image)
    }

    fn validate(&self) -> Result<()> {
        if self.contents.len() < MIN_IMAGE_LEN {
            return Err(RmxError::InvalidImage(format!(
                "image is {} bytes, need at least {MIN_IMAGE_LEN}",
                self.contents.len()
            )));
        }
        let vl = self.volume_label()?;
        let table_end = vl.fnode_start as usize
            + usize::from(vl.max_fnode) * usize::from(vl.fnode_size);
        if vl.fnode_start as usize >= self.contents.len() || table_end > self.contents.len() {
            return Err(RmxError::InvalidImage(format!(
                "fnode table [{}, {table_end}) lies outside the {}-byte image",
                vl.fnode_start,
                self.contents.len()
            )));
        }
        Ok(())
    }

    /// Write the image back to the path it was loaded from.
    pub fn save(&mut self) -> Result<()> {
        let Some(path) = self.file_name.clone() else {
            return Err(RmxError::InvalidImage(
                "no file name associated with this image".into(),
            ));
        };
        self.save_as(&path)
    }

    /// Write the image to `path`, reversing the load pipeline: byte-pair
    /// swap first, then container encode for `.imd` targets.
    ///
    /// The existing file is deleted before the write.
    pub fn save_as(&mut self, path: &Path) -> Result<()> {
        let mut flat = self.contents.clone();
        if self.byte_swap {
            swap_byte_pairs(&mut flat);
        }

        let out = if is_imd_path(path) {
            let imd = self.imd.as_mut().ok_or_else(|| {
                RmxError::Container("image was not loaded from a container".into())
            })?;
            imd.set_data(&flat)?;
            imd.to_bytes()?
        } else {
            flat
        };

        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        std::fs::write(path, out)?;
        debug!(path = %path.display(), "saved image");
        Ok(())
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.contents
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.contents
    }

    fn slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        let end = offset
            .checked_add(len)
            .filter(|&end| end <= self.contents.len())
            .ok_or_else(|| {
                RmxError::InvalidImage(format!(
                    "read of {len} bytes at {offset} exceeds {}-byte image",
                    self.contents.len()
                ))
            })?;
        Ok(&self.contents[offset..end])
    }

    fn slice_mut(&mut self, offset: usize, len: usize) -> Result<&mut [u8]> {
        let end = offset
            .checked_add(len)
            .filter(|&end| end <= self.contents.len())
            .ok_or_else(|| {
                RmxError::InvalidImage(format!(
                    "write of {len} bytes at {offset} exceeds {}-byte image",
                    self.contents.len()
                ))
            })?;
        Ok(&mut self.contents[offset..end])
    }

    // ── Labels ──────────────────────────────────────────────────────────

    pub fn volume_label(&self) -> Result<VolumeLabel> {
        let region = self.slice(VOLUME_LABEL_OFFSET, MIN_IMAGE_LEN - VOLUME_LABEL_OFFSET)?;
        Ok(VolumeLabel::parse(region)?)
    }

    pub fn put_volume_label(&mut self, label: &VolumeLabel) -> Result<()> {
        let region = self.slice_mut(VOLUME_LABEL_OFFSET, MIN_IMAGE_LEN - VOLUME_LABEL_OFFSET)?;
        label.serialize(region)?;
        Ok(())
    }

    pub fn iso_volume_label(&self) -> Result<IsoVolumeLabel> {
        let region = self.slice(ISO_LABEL_OFFSET, ISO_LABEL_LEN)?;
        Ok(IsoVolumeLabel::parse(region)?)
    }

    pub fn put_iso_volume_label(&mut self, label: &IsoVolumeLabel) -> Result<()> {
        let region = self.slice_mut(ISO_LABEL_OFFSET, ISO_LABEL_LEN)?;
        label.serialize(region)?;
        Ok(())
    }

    // ── Fnode table ─────────────────────────────────────────────────────

    fn fnode_slot(&self, vl: &VolumeLabel, index: u16) -> Result<(usize, usize)> {
        if index >= vl.max_fnode {
            return Err(RmxError::InvalidImage(format!(
                "fnode {index} out of range (max {})",
                vl.max_fnode
            )));
        }
        let offset = vl.fnode_start as usize + usize::from(index) * usize::from(vl.fnode_size);
        Ok((offset, usize::from(vl.fnode_size)))
    }

    /// Read fnode `index` from the table.
    pub fn fnode(&self, index: u16) -> Result<Fnode> {
        let vl = self.volume_label()?;
        let (offset, len) = self.fnode_slot(&vl, index)?;
        let mut fnode = Fnode::parse(self.slice(offset, len)?)?;
        fnode.number = index;
        Ok(fnode)
    }

    /// Serialize `fnode` back into its table slot.
    pub fn put_fnode(&mut self, fnode: &Fnode) -> Result<()> {
        let vl = self.volume_label()?;
        let (offset, len) = self.fnode_slot(&vl, fnode.number)?;
        fnode.serialize(self.slice_mut(offset, len)?)?;
        Ok(())
    }

    // ── File contents ───────────────────────────────────────────────────

    /// Read the first `total_size` bytes of a file, resolving the fnode's
    /// data and indirect block lists as a side effect.
    ///
    /// Short files concatenate each pointer slot's contiguous run; long
    /// files treat each slot as one indirect block holding packed
    /// `{count u8, block u24}` run entries.
    pub fn read_file(&self, fnode: &mut Fnode) -> Result<Vec<u8>> {
        let vl = self.volume_label()?;
        let gran = usize::from(vl.gran);
        let effective = gran * usize::from(fnode.gran);

        fnode.data_blocks.clear();
        fnode.indirect_blocks.clear();

        let mut data = Vec::new();
        if fnode.is_long() {
            let mut remaining = i64::from(fnode.total_blocks);
            let pointers = fnode.pointers;
            for slot in pointers.iter().filter(|p| p.num_blocks != 0) {
                fnode.indirect_blocks.push(slot.block);
                // The indirect block itself is part of the block count.
                remaining -= 1;
                let indirect = self.slice(slot.block as usize * gran, effective)?.to_vec();

                let mut off = 0;
                while off + 4 <= indirect.len() && remaining > 0 {
                    let count = indirect[off];
                    let block = u32::from(indirect[off + 1])
                        | (u32::from(indirect[off + 2]) << 8)
                        | (u32::from(indirect[off + 3]) << 16);
                    off += 4;
                    if count == 0 {
                        continue;
                    }
                    for b in 0..u32::from(count) {
                        fnode.data_blocks.push(block + b);
                    }
                    data.extend_from_slice(
                        self.slice(block as usize * gran, usize::from(count) * gran)?,
                    );
                    remaining -= i64::from(count);
                }
            }
        } else {
            let pointers = fnode.pointers;
            for slot in pointers.iter().filter(|p| p.num_blocks != 0) {
                for b in 0..u32::from(slot.num_blocks) {
                    fnode.data_blocks.push(slot.block + b);
                }
                data.extend_from_slice(self.slice(
                    slot.block as usize * gran,
                    usize::from(slot.num_blocks) * effective,
                )?);
            }
        }

        data.truncate(fnode.total_size as usize);
        Ok(data)
    }

    /// Overwrite a file's contents block-by-block through its resolved
    /// data-block list. `read_file` must have populated the list first.
    pub fn update_data_in_place(&mut self, fnode: &Fnode, data: &[u8]) -> Result<()> {
        let vl = self.volume_label()?;
        let gran = usize::from(vl.gran);

        for (index, chunk) in data.chunks(gran).enumerate() {
            let Some(&block) = fnode.data_blocks.get(index) else {
                return Err(RmxError::InvalidImage(format!(
                    "fnode {} holds {} blocks but the rewrite needs more",
                    fnode.number,
                    fnode.data_blocks.len()
                )));
            };
            self.slice_mut(block as usize * gran, chunk.len())?
                .copy_from_slice(chunk);
        }
        Ok(())
    }

    // ── Bitmap files ────────────────────────────────────────────────────

    /// The block bitmap: fnode 1, one bit per block on the volume.
    pub fn volume_map(&self) -> Result<BitmapFile> {
        let vl = self.volume_label()?;
        let mut fnode = self.fnode(VOLUME_MAP_FNODE)?;
        let data = self.read_file(&mut fnode)?;
        Ok(BitmapFile {
            bits: Bitmap::new(data, vl.block_count()),
            fnode,
        })
    }

    /// The fnode bitmap: fnode 2, one bit per table slot.
    pub fn fnode_map(&self) -> Result<BitmapFile> {
        let vl = self.volume_label()?;
        let mut fnode = self.fnode(FNODE_MAP_FNODE)?;
        let data = self.read_file(&mut fnode)?;
        Ok(BitmapFile {
            bits: Bitmap::new(data, usize::from(vl.max_fnode)),
            fnode,
        })
    }

    /// Persist a bitmap through its backing fnode's data blocks.
    pub fn write_bitmap(&mut self, map: &BitmapFile) -> Result<()> {
        self.update_data_in_place(&map.fnode, map.bits.as_bytes())
    }

    /// Grow a file by one block from the volume map, into its next free
    /// pointer slot.
    pub fn expand_fnode(&mut self, fnode: &mut Fnode) -> Result<()> {
        let vl = self.volume_label()?;
        let mut vmap = self.volume_map()?;
        let free = vmap.bits.next_free().ok_or(RmxError::NoFreeBlock)?;
        vmap.bits.set_alloc(free, true);
        self.write_bitmap(&vmap)?;

        let slot = fnode.free_pointer().ok_or(RmxError::NoFreePointer)?;
        let block = u32::try_from(free)
            .map_err(|_| RmxError::InvalidImage("block index overflow".into()))?;
        fnode.pointers[slot] = PointerSlot {
            num_blocks: 1,
            block,
        };
        fnode.this_size += u32::from(vl.gran);
        fnode.total_blocks += 1;
        fnode.data_blocks.push(block);
        self.put_fnode(fnode)
    }

    // ── Directories ─────────────────────────────────────────────────────

    /// Decode the directory stored in `fnode`.
    pub fn directory(&self, fnode: &Fnode) -> Result<Directory> {
        if !fnode.is_directory() {
            return Err(RmxError::NotDirectory(describe(fnode)));
        }
        let mut backing = fnode.clone();
        let data = self.read_file(&mut backing)?;
        Ok(Directory {
            entries: parse_dir_entries(&data),
            fnode: backing,
        })
    }

    /// Link `fnode_index` under `name`, reusing a free slot when one
    /// exists and growing the backing file by a block when it does not.
    pub fn dir_add_entry(
        &mut self,
        dir: &mut Directory,
        fnode_index: u16,
        name: &str,
    ) -> Result<()> {
        let name = truncate_name(name);

        if let Some(slot) = dir.entries.iter_mut().find(|e| e.fnode == 0) {
            slot.fnode = fnode_index;
            slot.name = name;
            return Ok(());
        }

        let entry_len = DIR_ENTRY_LEN as u32;
        if dir.fnode.total_size + entry_len > dir.fnode.this_size {
            self.expand_fnode(&mut dir.fnode)?;
        }

        dir.entries.push(DirEntry {
            fnode: fnode_index,
            name,
        });
        dir.fnode.total_size += entry_len;
        self.put_fnode(&dir.fnode)
    }

    /// Persist a directory's entry list through its backing file.
    pub fn write_directory(&mut self, dir: &Directory) -> Result<()> {
        let data = serialize_dir_entries(&dir.entries);
        self.update_data_in_place(&dir.fnode, &data)
    }

    /// The root directory's fnode, as named by the volume label.
    pub fn root_fnode(&self) -> Result<Fnode> {
        let vl = self.volume_label()?;
        self.fnode(vl.root_fnode)
    }

    // ── Path lookup ─────────────────────────────────────────────────────

    /// Resolve a slash-delimited path, case-insensitively, starting at
    /// `start` (or the root). A leading slash is stripped; the empty path
    /// resolves to the starting directory itself, with no parent attached.
    pub fn lookup(&self, start: Option<&Fnode>, path: &str) -> Result<Lookup> {
        let path = path.strip_prefix('/').unwrap_or(path);
        let base = match start {
            Some(fnode) => fnode.clone(),
            None => self.root_fnode()?,
        };

        if path.is_empty() {
            return Ok(Lookup {
                fnode: base,
                parent: None,
            });
        }

        let dir = self.directory(&base)?;
        let (head, rest) = match path.split_once('/') {
            Some((head, rest)) => (head, Some(rest)),
            None => (path, None),
        };

        let index = dir
            .find(head)
            .ok_or_else(|| RmxError::NotFound(head.to_owned()))?;
        let mut fnode = self.fnode(index)?;
        fnode.name = Some(head.to_owned());

        match rest {
            None => Ok(Lookup {
                fnode,
                parent: Some(dir),
            }),
            Some(rest) if fnode.is_directory() => self.lookup(Some(&fnode), rest),
            Some(_) => Err(RmxError::NotDirectory(head.to_owned())),
        }
    }

    // ── Node creation ───────────────────────────────────────────────────

    /// Create a new fnode of `ftype` under `dir_fnode` and link it.
    ///
    /// The fresh fnode carries `ALLOCATED|PRIMARY`, a block-size multiplier
    /// of one, the parent's number as owner, and the two default accessors
    /// (owner 0 and world 65535, full access). The fnode map is persisted
    /// before the fnode, which is persisted before the parent directory.
    pub fn mknod(&mut self, dir_fnode: &Fnode, name: &str, ftype: u8) -> Result<Fnode> {
        if !dir_fnode.is_directory() {
            return Err(RmxError::NotDirectory(describe(dir_fnode)));
        }

        let mut fnode = Fnode {
            flags: FLAG_ALLOCATED | FLAG_PRIMARY,
            ftype,
            gran: 1,
            owner: dir_fnode.number,
            name: Some(name.to_owned()),
            ..Fnode::default()
        };
        fnode.add_accessor(ACCESS_ALL, 0)?;
        fnode.add_accessor(ACCESS_ALL, 65535)?;

        let mut fmap = self.fnode_map()?;
        let number = fmap.bits.next_free().ok_or(RmxError::NoFreeFnode)?;
        // The map is max_fnode bits wide, so the index always fits.
        fnode.number = u16::try_from(number).map_err(|_| RmxError::NoFreeFnode)?;
        fmap.bits.set_alloc(number, true);
        self.write_bitmap(&fmap)?;

        self.put_fnode(&fnode)?;

        let mut dir = self.directory(dir_fnode)?;
        self.dir_add_entry(&mut dir, fnode.number, name)?;
        self.write_directory(&dir)?;

        debug!(number = fnode.number, name, ftype, "created fnode");
        Ok(fnode)
    }

    /// Create a data file under `dir_fnode` and store `data` in it.
    pub fn put_file(
        &mut self,
        dir_fnode: &Fnode,
        name: &str,
        data: &[u8],
        contig: bool,
    ) -> Result<Fnode> {
        let mut fnode = self.mknod(dir_fnode, name, rmxfs_types::TYPE_DATA)?;
        self.put_data(&mut fnode, data, contig)?;
        Ok(fnode)
    }

    /// Store `data` as the contents of `fnode`.
    ///
    /// Blocks are reserved through the volume map (`contig` demands one
    /// consecutive run), filled in order, and collapsed into pointer runs.
    /// More than eight runs fails with `TooManyRuns` before anything is
    /// persisted; long-file output is not supported.
    pub fn put_data(&mut self, fnode: &mut Fnode, data: &[u8], contig: bool) -> Result<()> {
        if fnode.is_long() {
            return Err(RmxError::LongFileUnsupported);
        }
        let vl = self.volume_label()?;
        let gran = usize::from(vl.gran);

        fnode.total_size = u32::try_from(data.len())
            .map_err(|_| RmxError::InvalidImage("file larger than 4 GiB".into()))?;

        // Mknod may have grown the parent directory, so the map is read
        // only now.
        let mut vmap = self.volume_map()?;

        let block_count = blocks_for(data.len(), gran);
        if block_count == 0 {
            return self.put_fnode(fnode);
        }

        let blocks = vmap.bits.free_range(block_count, contig).map_err(|e| match e {
            RangeError::NoContiguousRun { count } => RmxError::NoContiguousRange(count),
            RangeError::Exhausted { .. } => RmxError::NoFreeBlock,
        })?;
        debug!(
            blocks = block_count,
            gran,
            contig,
            name = fnode.name.as_deref().unwrap_or(""),
            "allocating file blocks"
        );

        let mut runs: Vec<PointerSlot> = Vec::new();
        let mut run_start: Option<u32> = None;
        let mut last: Option<u32> = None;

        for (&block, chunk) in blocks.iter().zip(data.chunks(gran)) {
            #[expect(clippy::cast_possible_truncation)]
            let block = block as u32;

            if last.is_none_or(|l| block != l + 1) {
                if let (Some(start), Some(end)) = (run_start, last) {
                    #[expect(clippy::cast_possible_truncation)]
                    runs.push(PointerSlot {
                        num_blocks: (end - start + 1) as u16,
                        block: start,
                    });
                }
                run_start = Some(block);
            }

            self.slice_mut(block as usize * gran, chunk.len())?
                .copy_from_slice(chunk);
            vmap.bits.set_alloc(block as usize, true);
            fnode.data_blocks.push(block);
            last = Some(block);

            fnode.total_blocks += 1;
            fnode.this_size += u32::from(vl.gran);
        }
        if let (Some(start), Some(end)) = (run_start, last) {
            #[expect(clippy::cast_possible_truncation)]
            runs.push(PointerSlot {
                num_blocks: (end - start + 1) as u16,
                block: start,
            });
        }

        if runs.len() > NUM_POINTERS {
            return Err(RmxError::TooManyRuns(runs.len()));
        }

        self.write_bitmap(&vmap)?;
        for (slot, run) in fnode.pointers.iter_mut().zip(&runs) {
            *slot = *run;
        }
        self.put_fnode(fnode)
    }

    /// Create an empty directory under `parent`; it grows on demand as
    /// entries are added.
    pub fn mkdir(&mut self, parent: &Fnode, name: &str) -> Result<Fnode> {
        self.mknod(parent, name, TYPE_DIRECTORY)
    }

    // ── Truncation and deletion ─────────────────────────────────────────

    /// Free every data and indirect block of `fnode` and zero its sizes
    /// and pointer slots.
    pub fn truncate_fnode(&mut self, fnode: &mut Fnode) -> Result<()> {
        let mut vmap = self.volume_map()?;
        self.read_file(fnode)?;

        for &block in &fnode.data_blocks {
            vmap.bits.set_alloc(block as usize, false);
        }
        for &block in &fnode.indirect_blocks {
            vmap.bits.set_alloc(block as usize, false);
        }
        self.write_bitmap(&vmap)?;

        for slot in &mut fnode.pointers {
            slot.num_blocks = 0;
        }
        fnode.total_size = 0;
        fnode.this_size = 0;
        fnode.total_blocks = 0;
        fnode.data_blocks.clear();
        fnode.indirect_blocks.clear();

        self.put_fnode(fnode)
    }

    /// Delete `fnode`: truncate, free its fnode-map bit, clear the
    /// allocated flag, and unlink it from `dir` (the parent directory a
    /// preceding lookup attached).
    pub fn delete_fnode(&mut self, fnode: &mut Fnode, dir: &mut Directory) -> Result<()> {
        if !fnode.is_allocated() {
            return Err(RmxError::NotAllocated(fnode.number));
        }
        self.truncate_fnode(fnode)?;

        let mut fmap = self.fnode_map()?;
        fmap.bits.set_alloc(usize::from(fnode.number), false);

        fnode.set_alloc(false);
        self.put_fnode(fnode)?;

        let name = fnode
            .name
            .clone()
            .ok_or_else(|| RmxError::NotFound(format!("fnode {} has no entry name", fnode.number)))?;
        dir.unlink(&name)?;
        self.write_directory(dir)?;

        self.write_bitmap(&fmap)?;
        debug!(number = fnode.number, name = name.as_str(), "deleted fnode");
        Ok(())
    }

    /// Delete every file and directory in the tree whose fnode number is
    /// above the reserved range; the system fnodes and the root survive.
    pub fn wipe(&mut self) -> Result<()> {
        let root = self.root_fnode()?;
        self.wipe_below(&root)
    }

    fn wipe_below(&mut self, dir_fnode: &Fnode) -> Result<()> {
        let mut dir = self.directory(dir_fnode)?;
        let live: Vec<DirEntry> = dir.live_entries().cloned().collect();
        for entry in live {
            let mut child = self.fnode(entry.fnode)?;
            child.name = Some(entry.name.clone());
            if child.is_directory() {
                self.wipe_below(&child)?;
            }
            if child.number > LAST_RESERVED_FNODE {
                self.delete_fnode(&mut child, &mut dir)?;
            }
        }
        Ok(())
    }

    // ── Free space and table growth ─────────────────────────────────────

    /// Free block and fnode totals.
    pub fn free_counts(&self) -> Result<FreeCounts> {
        Ok(FreeCounts {
            blocks: self.volume_map()?.bits.free_count(),
            fnodes: self.fnode_map()?.bits.free_count(),
        })
    }

    /// Grow the fnode table to hold `new_max` fnodes.
    ///
    /// The table is relocated to a fresh contiguous block run (the old
    /// blocks are freed), the new tail is zeroed, fnode 0 is repointed,
    /// the volume label's `max_fnode`/`fnode_start` are rewritten, and the
    /// fnode bitmap's backing file is extended with the new indices free.
    pub fn grow_fnode_table(&mut self, new_max: u16) -> Result<()> {
        let mut vl = self.volume_label()?;
        if new_max <= vl.max_fnode {
            return Err(RmxError::InvalidArgument(format!(
                "fnode count {new_max} does not exceed current {}",
                vl.max_fnode
            )));
        }
        let gran = usize::from(vl.gran);
        let fnode_size = usize::from(vl.fnode_size);
        let old_max = usize::from(vl.max_fnode);

        let mut table_fnode = self.fnode(0)?;
        let old_table = self.read_file(&mut table_fnode)?;

        // Free the old span first so the new run may overlap it; the table
        // bytes are already in memory.
        let mut vmap = self.volume_map()?;
        for &block in &table_fnode.data_blocks {
            vmap.bits.set_alloc(block as usize, false);
        }

        let needed_blocks = blocks_for(usize::from(new_max) * fnode_size, gran);
        let new_blocks = vmap
            .bits
            .free_range(needed_blocks, true)
            .map_err(|_| RmxError::NoContiguousRange(needed_blocks))?;
        for &block in &new_blocks {
            vmap.bits.set_alloc(block, true);
        }
        let new_start = new_blocks[0];

        let mut new_table = vec![0u8; needed_blocks * gran];
        let copy_len = old_table.len().min(old_max * fnode_size);
        new_table[..copy_len].copy_from_slice(&old_table[..copy_len]);
        self.slice_mut(new_start * gran, new_table.len())?
            .copy_from_slice(&new_table);

        self.write_bitmap(&vmap)?;

        vl.max_fnode = new_max;
        vl.fnode_start = u32::try_from(new_start * gran)
            .map_err(|_| RmxError::InvalidImage("fnode table offset overflow".into()))?;
        self.put_volume_label(&vl)?;

        // From here on every fnode access goes through the new table.
        #[expect(clippy::cast_possible_truncation)]
        {
            table_fnode.pointers = [PointerSlot::default(); NUM_POINTERS];
            table_fnode.pointers[0] = PointerSlot {
                num_blocks: needed_blocks as u16,
                block: new_start as u32,
            };
            table_fnode.total_size = (usize::from(new_max) * fnode_size) as u32;
            table_fnode.this_size = (needed_blocks * gran) as u32;
            table_fnode.total_blocks = needed_blocks as u32;
            table_fnode.data_blocks = new_blocks.iter().map(|&b| b as u32).collect();
        }
        self.put_fnode(&table_fnode)?;

        // Extend the fnode bitmap's backing file and mark the new indices
        // free.
        let mut map_fnode = self.fnode(FNODE_MAP_FNODE)?;
        let map_data = self.read_file(&mut map_fnode)?;
        let needed_bytes = usize::from(new_max).div_ceil(8);
        while usize::from(map_fnode.gran) * gran * map_fnode.data_blocks.len() < needed_bytes {
            self.expand_fnode(&mut map_fnode)?;
        }

        let mut map_data = map_data;
        map_data.resize(needed_bytes, 0);
        let mut bits = Bitmap::new(map_data, usize::from(new_max));
        for index in old_max..usize::from(new_max) {
            bits.set_alloc(index, false);
        }

        map_fnode.total_size = u32::try_from(needed_bytes)
            .map_err(|_| RmxError::InvalidImage("fnode map size overflow".into()))?;
        self.put_fnode(&map_fnode)?;
        self.write_bitmap(&BitmapFile {
            bits,
            fnode: map_fnode,
        })?;

        debug!(new_max, "grew fnode table");
        Ok(())
    }
}

// ── Helpers ─────────────────────────────────────────────────────────────────

fn is_imd_path(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("imd"))
}

/// Swap each adjacent byte pair in place; a trailing odd byte is left alone.
fn swap_byte_pairs(data: &mut [u8]) {
    for pair in data.chunks_exact_mut(2) {
        pair.swap(0, 1);
    }
}

fn truncate_name(name: &str) -> String {
    if name.len() > DIR_NAME_LEN {
        name[..DIR_NAME_LEN].to_owned()
    } else {
        name.to_owned()
    }
}

fn describe(fnode: &Fnode) -> String {
    fnode
        .name
        .clone()
        .unwrap_or_else(|| format!("fnode {}", fnode.number))
}
