#![forbid(unsafe_code)]
//! ImageDisk (IMD) container codec.
//!
//! IMD files preserve per-sector structure: a comment terminated by 0x1A,
//! then track records carrying mode, geometry, sector numbering, optional
//! per-sector size codes, and typed sector payloads (uniform sectors are
//! stored compressed as a single fill byte).
//!
//! The engine treats this codec as opaque: `parse`/`load` to get an
//! `ImageDisk`, [`ImageDisk::data`] to flatten into a linear image,
//! [`ImageDisk::set_data`] to patch sector payloads back, and
//! [`ImageDisk::to_bytes`] to re-encode.

use rmxfs_error::{Result, RmxError};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

const IMD_MAGIC: &[u8; 4] = b"IMD ";
const COMMENT_TERMINATOR: u8 = 0x1A;

#[derive(Debug, Clone)]
pub struct Sector {
    pub number: u8,
    pub deleted: bool,
    pub bad: bool,
    pub compressed: bool,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct Track {
    pub mode: u8,
    pub cylinder: u8,
    pub head: u8,
    pub sector_count: u8,
    pub sector_size_code: u8,
    pub sector_numbers: Vec<u8>,
    pub sector_size_codes: Vec<u8>,
    pub sectors: BTreeMap<u8, Sector>,
}

/// A fully parsed IMD container.
#[derive(Debug, Clone, Default)]
pub struct ImageDisk {
    comment: Vec<u8>,
    tracks: BTreeMap<(u8, u8), Track>,
    cyl_count: u8,
    head_count: u8,
}

/// Byte-stream cursor with typed errors instead of slice panics.
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(RmxError::Container(format!(
                "truncated container: need {len} bytes at offset {}, have {}",
                self.pos,
                self.remaining()
            )));
        }
        let out = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn byte(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }
}

impl ImageDisk {
    /// Parse an IMD byte stream.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(data);
        let magic = cur.take(4)?;
        if magic != IMD_MAGIC {
            return Err(RmxError::Container(format!(
                "bad magic: expected \"IMD \", got {:?}",
                String::from_utf8_lossy(magic)
            )));
        }

        let mut imd = Self::default();
        loop {
            let b = cur.byte()?;
            imd.comment.push(b);
            if b == COMMENT_TERMINATOR {
                break;
            }
        }

        while cur.remaining() > 0 {
            let track = Self::parse_track(&mut cur)?;
            debug!(
                mode = track.mode,
                cylinder = track.cylinder,
                head = track.head,
                sectors = track.sector_count,
                "parsed track"
            );
            imd.insert_track(track);
        }

        Ok(imd)
    }

    /// Read and parse an IMD file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)?;
        Self::parse(&data)
    }

    fn parse_track(cur: &mut Cursor<'_>) -> Result<Track> {
        let header = cur.take(5)?;
        let mut track = Track {
            mode: header[0],
            cylinder: header[1],
            head: header[2],
            sector_count: header[3],
            sector_size_code: header[4],
            sector_numbers: Vec::new(),
            sector_size_codes: Vec::new(),
            sectors: BTreeMap::new(),
        };
        let count = usize::from(track.sector_count);

        // 0xFF means each sector carries its own size code.
        if track.sector_size_code == 0xFF {
            track.sector_size_codes = cur.take(count)?.to_vec();
        } else {
            track.sector_size_codes = vec![track.sector_size_code; count];
        }

        track.sector_numbers = cur.take(count)?.to_vec();

        for i in 0..count {
            let data_type = cur.byte()?;
            if data_type > 0x08 {
                return Err(RmxError::Container(format!(
                    "invalid sector data type {data_type}"
                )));
            }
            let bad = matches!(data_type, 0x00 | 0x05 | 0x06 | 0x07 | 0x08);
            let deleted = matches!(data_type, 0x03 | 0x04 | 0x07 | 0x08);
            let compressed = matches!(data_type, 0x02 | 0x04 | 0x06 | 0x08);
            let size_code = track.sector_size_codes[i];
            if size_code > 6 {
                return Err(RmxError::Container(format!(
                    "invalid sector size code {size_code}"
                )));
            }
            let sec_size = 128usize << size_code;

            let data = if compressed {
                let fill = cur.byte()?;
                vec![fill; sec_size]
            } else {
                cur.take(sec_size)?.to_vec()
            };

            let number = track.sector_numbers[i];
            track.sectors.insert(
                number,
                Sector {
                    number,
                    deleted,
                    bad,
                    compressed,
                    data,
                },
            );
        }

        Ok(track)
    }

    fn insert_track(&mut self, track: Track) {
        self.cyl_count = self.cyl_count.max(track.cylinder + 1);
        self.head_count = self.head_count.max(track.head + 1);
        self.tracks.insert((track.cylinder, track.head), track);
    }

    fn track(&self, cyl: u8, head: u8) -> Result<&Track> {
        self.tracks
            .get(&(cyl, head))
            .ok_or_else(|| RmxError::Container(format!("missing track cyl={cyl} head={head}")))
    }

    /// Flatten sector payloads into a linear byte image.
    ///
    /// Sectors are emitted in ascending sector-number order starting at 1,
    /// cylinder-major then head.
    pub fn data(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        for cyl in 0..self.cyl_count {
            for head in 0..self.head_count {
                let track = self.track(cyl, head)?;
                for k in 0..track.sector_count {
                    let sector = track.sectors.get(&(k + 1)).ok_or_else(|| {
                        RmxError::Container(format!(
                            "missing sector {} on cyl={cyl} head={head}",
                            k + 1
                        ))
                    })?;
                    out.extend_from_slice(&sector.data);
                }
            }
        }
        Ok(out)
    }

    /// Patch sector payloads from a linear byte image (inverse of [`data`]).
    ///
    /// [`data`]: ImageDisk::data
    pub fn set_data(&mut self, mut data: &[u8]) -> Result<()> {
        for cyl in 0..self.cyl_count {
            for head in 0..self.head_count {
                let track = self
                    .tracks
                    .get_mut(&(cyl, head))
                    .ok_or_else(|| RmxError::Container(format!("missing track cyl={cyl} head={head}")))?;
                for k in 0..track.sector_count {
                    let sector = track.sectors.get_mut(&(k + 1)).ok_or_else(|| {
                        RmxError::Container(format!(
                            "missing sector {} on cyl={cyl} head={head}",
                            k + 1
                        ))
                    })?;
                    let len = sector.data.len();
                    if data.len() < len {
                        return Err(RmxError::Container(
                            "linear image shorter than container geometry".into(),
                        ));
                    }
                    sector.data.copy_from_slice(&data[..len]);
                    data = &data[len..];
                }
            }
        }
        Ok(())
    }

    /// Re-encode the container, preserving deleted/bad markings and
    /// re-compressing uniform sectors.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        out.extend_from_slice(IMD_MAGIC);
        out.extend_from_slice(&self.comment);

        for cyl in 0..self.cyl_count {
            for head in 0..self.head_count {
                let track = self.track(cyl, head)?;
                out.push(track.mode);
                out.push(track.cylinder);
                out.push(track.head);
                out.push(track.sector_count);
                out.push(track.sector_size_code);

                if track.sector_size_code == 0xFF {
                    out.extend_from_slice(&track.sector_size_codes);
                }
                out.extend_from_slice(&track.sector_numbers);

                for k in 0..usize::from(track.sector_count) {
                    let number = track.sector_numbers[k];
                    let sector = track.sectors.get(&number).ok_or_else(|| {
                        RmxError::Container(format!(
                            "missing sector {number} on cyl={cyl} head={head}"
                        ))
                    })?;

                    let mut data_type: u8 = if sector.deleted { 0x03 } else { 0x01 };
                    if sector.bad {
                        data_type |= 0x04;
                    }
                    let uniform = sector.data.windows(2).all(|w| w[0] == w[1]);
                    if uniform {
                        data_type += 1;
                    }

                    out.push(data_type);
                    if uniform {
                        out.push(sector.data.first().copied().unwrap_or(0));
                    } else {
                        out.extend_from_slice(&sector.data);
                    }
                }
            }
        }

        Ok(out)
    }

    #[must_use]
    pub fn comment(&self) -> &[u8] {
        &self.comment
    }

    #[must_use]
    pub fn cyl_count(&self) -> u8 {
        self.cyl_count
    }

    #[must_use]
    pub fn head_count(&self) -> u8 {
        self.head_count
    }
}
