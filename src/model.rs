//! Data model shared by every pipeline component.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Page size shift; page size is fixed at 4096 bytes throughout the pipeline.
pub const PAGE_SHIFT: u32 = 12;
/// Page size in bytes, derived from [`PAGE_SHIFT`].
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// Maximum length in bytes of a [`PackPath::path`], enforced by the pack writer.
pub const PACK_PATH_MAX: usize = 4096;

/// Sentinel `physical_offset` meaning "no known physical location" (non-rotational media).
pub const UNKNOWN_PHYSICAL: u64 = u64::MAX;

/// Sentinel `group_hint` meaning "group unknown".
pub const UNKNOWN_GROUP: i64 = -1;

/// A group with at least this many paths gets its inode table preloaded.
pub const INODE_GROUP_PRELOAD_THRESHOLD: usize = 8;

/// A half-open `[start, end)` range over page indices. Invariant: `start < end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageRange {
    pub start: u64,
    pub end: u64,
}

impl PageRange {
    /// Builds a range from a first page and a last (inclusive) page.
    ///
    /// Returns `None` on `last_page + 1` overflow.
    pub fn from_inclusive(first_page: u64, last_page_inclusive: u64) -> Option<Self> {
        let end = last_page_inclusive.checked_add(1)?;
        if first_page >= end {
            return None;
        }
        Some(Self {
            start: first_page,
            end,
        })
    }

    /// Two ranges are touching-or-overlapping iff `!(a.end < b.start || b.end < a.start)`.
    pub fn touches_or_overlaps(&self, other: &Self) -> bool {
        !(self.end < other.start || other.end < self.start)
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// The set of touched page ranges for one inode: sorted, pairwise non-touching.
#[derive(Debug, Clone, Default)]
pub struct InodeIndex {
    pub inode_id: u64,
    pub ranges: Vec<PageRange>,
    pub display_name: Option<String>,
}

impl InodeIndex {
    pub fn new(inode_id: u64) -> Self {
        Self {
            inode_id,
            ranges: Vec::new(),
            display_name: None,
        }
    }
}

/// Device identifier, `major:minor`.
///
/// The kernel trace subsystem and the `stat(2)` family encode device numbers
/// differently; see [`DeviceId::from_trace_raw`] and [`DeviceId::from_stat_dev`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId {
    pub major: u32,
    pub minor: u32,
}

impl DeviceId {
    /// Decodes a device id as the kernel trace subsystem reports it:
    /// `major = raw >> 20, minor = raw & 0xff`.
    ///
    /// This differs from the standard `MKDEV` split. It is preserved verbatim
    /// because that is how the trace subsystem reports it on the targeted
    /// kernels, not a mistake to be "fixed" into the standard split.
    pub fn from_trace_raw(raw: u64) -> Self {
        Self {
            major: (raw >> 20) as u32,
            minor: (raw & 0xff) as u32,
        }
    }

    /// Decodes a device id from a `stat(2)` `dev_t`, using the standard split.
    pub fn from_stat_dev(dev: libc::dev_t) -> Self {
        Self {
            major: unsafe { libc::major(dev) } as u32,
            minor: unsafe { libc::minor(dev) } as u32,
        }
    }
}

/// Per-device collection of [`InodeIndex`], kept sorted by `inode_id` for
/// binary-search lookup and insertion.
#[derive(Debug, Clone, Default)]
pub struct DeviceIndex {
    pub device_id: DeviceId,
    inodes: Vec<InodeIndex>,
}

impl DeviceIndex {
    pub fn new(device_id: DeviceId) -> Self {
        Self {
            device_id,
            inodes: Vec::new(),
        }
    }

    fn search(&self, inode_id: u64) -> Result<usize, usize> {
        self.inodes.binary_search_by_key(&inode_id, |ii| ii.inode_id)
    }

    pub fn get(&self, inode_id: u64) -> Option<&InodeIndex> {
        self.search(inode_id).ok().map(|i| &self.inodes[i])
    }

    pub fn get_mut(&mut self, inode_id: u64) -> Option<&mut InodeIndex> {
        match self.search(inode_id) {
            Ok(i) => Some(&mut self.inodes[i]),
            Err(_) => None,
        }
    }

    /// Returns the inode's entry, inserting an empty one at the sorted
    /// position if it doesn't exist yet.
    pub fn get_or_insert(&mut self, inode_id: u64) -> &mut InodeIndex {
        match self.search(inode_id) {
            Ok(i) => &mut self.inodes[i],
            Err(i) => {
                self.inodes.insert(i, InodeIndex::new(inode_id));
                &mut self.inodes[i]
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &InodeIndex> {
        self.inodes.iter()
    }

    pub fn len(&self) -> usize {
        self.inodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inodes.is_empty()
    }
}

/// Device id → [`DeviceIndex`] lookup table, owned exclusively by the
/// ingester (C4) for the duration of a trace and read by the reducer (C5).
#[derive(Debug, Clone, Default)]
pub struct DeviceTable {
    devices: HashMap<DeviceId, DeviceIndex>,
}

impl DeviceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&self, device_id: DeviceId, inode_id: u64) -> Option<&InodeIndex> {
        self.devices.get(&device_id).and_then(|d| d.get(inode_id))
    }

    pub fn device(&self, device_id: DeviceId) -> Option<&DeviceIndex> {
        self.devices.get(&device_id)
    }

    pub fn device_mut(&mut self, device_id: DeviceId) -> &mut DeviceIndex {
        self.devices
            .entry(device_id)
            .or_insert_with(|| DeviceIndex::new(device_id))
    }

    pub fn devices(&self) -> impl Iterator<Item = &DeviceIndex> {
        self.devices.values()
    }
}

/// One path entry in a [`PackFile`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackPath {
    pub inode_id: u64,
    /// `-1` ([`UNKNOWN_GROUP`]) means "unknown".
    pub group_hint: i64,
    pub path: String,
}

/// One block entry in a [`PackFile`]; `path_index` references a [`PackPath`]
/// within the same pack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackBlock {
    pub path_index: usize,
    pub logical_offset: u64,
    pub length: u64,
    /// [`UNKNOWN_PHYSICAL`] on non-rotational media.
    pub physical_offset: u64,
}

/// The per-device pack record handed to the (out-of-scope) writer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PackFile {
    pub device_id: DeviceId,
    pub rotational: bool,
    pub paths: Vec<PackPath>,
    pub blocks: Vec<PackBlock>,
    pub groups: Vec<u64>,
}

impl Default for DeviceId {
    fn default() -> Self {
        Self { major: 0, minor: 0 }
    }
}

/// Summary statistics for display by the (out-of-scope) dump/pretty-printer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PackSummary {
    pub path_count: usize,
    pub block_count: usize,
    pub total_bytes: u64,
}

impl PackFile {
    pub fn summary(&self) -> PackSummary {
        PackSummary {
            path_count: self.paths.len(),
            block_count: self.blocks.len(),
            total_bytes: self.blocks.iter().map(|b| b.length).sum(),
        }
    }
}
