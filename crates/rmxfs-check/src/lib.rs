#![forbid(unsafe_code)]
//! Read-only consistency checking.
//!
//! A single pass walks the reserved fnodes and the directory tree,
//! reconciles both allocation bitmaps against what the walk observed, and
//! reports every mismatch it finds. The checker never mutates the image
//! and never aborts early: individual failures become findings and the
//! pass continues, so one run surfaces every issue.

use rmxfs_error::Result;
use rmxfs_image::RmxImage;
use rmxfs_ondisk::Fnode;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::{debug, info};

/// Fnode that is considered allocated even when nothing references it.
const RESERVED_PLACEHOLDER_FNODE: u16 = 3;

/// One reported inconsistency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    pub message: String,
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// The accumulated result of one checking pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CheckReport {
    pub volume_name: String,
    pub findings: Vec<Finding>,
}

impl CheckReport {
    #[must_use]
    pub fn error_count(&self) -> usize {
        self.findings.len()
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }

    fn report(&mut self, message: String) {
        debug!(finding = message.as_str(), "inconsistency");
        self.findings.push(Finding { message });
    }
}

struct Checker<'a> {
    image: &'a RmxImage,
    /// Block number → fnodes whose walk claimed it.
    claimed: BTreeMap<u32, Vec<u16>>,
    /// Every fnode the walk reached.
    seen: BTreeSet<u16>,
    /// Directories already descended into (cycle guard).
    visited_dirs: BTreeSet<u16>,
    report: CheckReport,
}

/// Run a full consistency pass over `image`.
pub fn check_image(image: &RmxImage) -> Result<CheckReport> {
    let mut checker = Checker {
        image,
        claimed: BTreeMap::new(),
        seen: BTreeSet::new(),
        visited_dirs: BTreeSet::new(),
        report: CheckReport::default(),
    };
    checker.run()?;
    Ok(checker.report)
}

impl Checker<'_> {
    fn run(&mut self) -> Result<()> {
        let vl = self.image.volume_label()?;
        self.report.volume_name = vl.name.clone();
        info!(volume = vl.name.as_str(), "checking volume");

        self.check_fnode(0, "fnode table");
        self.check_fnode(RESERVED_PLACEHOLDER_FNODE, "reserved fnode");
        self.check_fnode(vl.root_fnode, "root directory");

        self.reconcile_blocks();
        self.reconcile_fnodes();
        Ok(())
    }

    fn check_fnode(&mut self, number: u16, name: &str) {
        debug!(number, name, "checking fnode");
        let mut fnode = match self.image.fnode(number) {
            Ok(fnode) => fnode,
            Err(e) => {
                self.report
                    .report(format!("fnode {number} ({name}): unreadable: {e}"));
                return;
            }
        };
        if !fnode.is_allocated() {
            self.report
                .report(format!("fnode {number} ({name}) is not allocated"));
        }
        if let Err(e) = self.image.read_file(&mut fnode) {
            self.report
                .report(format!("fnode {number} ({name}): unreadable contents: {e}"));
            return;
        }
        self.mark_blocks(&fnode);
        if fnode.is_directory() && self.visited_dirs.insert(number) {
            self.check_dir(&fnode, name);
        }
    }

    fn mark_blocks(&mut self, fnode: &Fnode) {
        self.seen.insert(fnode.number);
        for &block in fnode.indirect_blocks.iter().chain(&fnode.data_blocks) {
            self.claimed.entry(block).or_default().push(fnode.number);
        }
    }

    fn check_dir(&mut self, dir_fnode: &Fnode, name: &str) {
        debug!(name, "descending into directory");
        let dir = match self.image.directory(dir_fnode) {
            Ok(dir) => dir,
            Err(e) => {
                self.report
                    .report(format!("directory {name}: unreadable: {e}"));
                return;
            }
        };
        for entry in dir.live_entries() {
            self.check_fnode(entry.fnode, &entry.name);
        }
    }

    fn reconcile_blocks(&mut self) {
        info!("reconciling block allocation");
        let vmap = match self.image.volume_map() {
            Ok(map) => map,
            Err(e) => {
                self.report.report(format!("volume map unreadable: {e}"));
                return;
            }
        };

        let claimed = std::mem::take(&mut self.claimed);
        for (&block, owners) in &claimed {
            if owners.len() > 1 {
                self.report
                    .report(format!("block {block} is claimed by multiple fnodes: {owners:?}"));
            }
            if !vmap.bits.is_alloc(block as usize) {
                self.report
                    .report(format!("block {block} is in use but marked free in the volume map"));
            }
        }

        for block in 0..vmap.bits.num_bits() {
            let claimed = u32::try_from(block).is_ok_and(|b| claimed.contains_key(&b));
            let mapped = vmap.bits.is_alloc(block);
            if mapped && !claimed {
                self.report.report(format!(
                    "block {block} is marked allocated in the volume map but owned by no fnode"
                ));
            } else if !mapped && claimed {
                self.report.report(format!(
                    "block {block} is marked free in the volume map but is in use"
                ));
            }
        }
    }

    fn reconcile_fnodes(&mut self) {
        info!("reconciling fnode allocation");
        let fmap = match self.image.fnode_map() {
            Ok(map) => map,
            Err(e) => {
                self.report.report(format!("fnode map unreadable: {e}"));
                return;
            }
        };

        // The placeholder is allocated by convention, referenced or not.
        self.seen.insert(RESERVED_PLACEHOLDER_FNODE);

        for index in 0..fmap.bits.num_bits() {
            #[expect(clippy::cast_possible_truncation)]
            let number = index as u16;
            let walked = self.seen.contains(&number);
            let mapped = fmap.bits.is_alloc(index);
            if mapped && !walked {
                self.report.report(format!(
                    "fnode {number} is marked allocated in the fnode map but unreferenced"
                ));
            } else if !mapped && walked {
                self.report.report(format!(
                    "fnode {number} is marked free in the fnode map but in use"
                ));
            }
        }
    }
}
