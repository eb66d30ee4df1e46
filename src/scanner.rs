//! C3 — File scanner.

use crate::error::CoreError;
use crate::iface::FileSystemProbe;
use crate::model::{DeviceId, PackBlock, PackFile, UNKNOWN_PHYSICAL};
use log::warn;
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::Path;

/// Accumulates paths and candidate blocks for one device across the scan.
#[derive(Debug, Default)]
struct DeviceAccumulator {
    rotational: bool,
    pack: PackFile,
}

/// Scans normalised paths into per-device [`PackFile`] accumulators.
///
/// Owns the "seen inode" set that ensures each underlying inode is scanned
/// at most once across symlink/hardlink aliases; the `PackPath`
/// entry is still added for every alias so replay warms each dentry.
pub struct Scanner<'a, P: FileSystemProbe> {
    probe: &'a P,
    seen_inodes: HashSet<(DeviceId, u64)>,
    devices: HashMap<DeviceId, DeviceAccumulator>,
    force_non_rotational: bool,
}

impl<'a, P: FileSystemProbe> Scanner<'a, P> {
    pub fn new(probe: &'a P, force_non_rotational: bool) -> Self {
        Self {
            probe,
            seen_inodes: HashSet::new(),
            devices: HashMap::new(),
            force_non_rotational,
        }
    }

    pub fn into_packs(self) -> HashMap<DeviceId, PackFile> {
        self.devices
            .into_iter()
            .map(|(id, acc)| (id, acc.pack))
            .collect()
    }

    /// Scans one normalised path through the stat/open/residency/extent procedure.
    ///
    /// Returns the `(device_id, path_index)` of the path entry that was
    /// added, or `None` if the path was skipped (step 1: not a regular
    /// file, or a recoverable per-file error occurred).
    pub fn scan(&mut self, path: &str) -> Option<(DeviceId, usize)> {
        let p = Path::new(path);

        // Step 1: stat without following symlinks; only regular files proceed.
        let identity = match self.probe.stat_no_follow(p) {
            Ok(Some(id)) => id,
            Ok(None) => return None,
            Err(e) => {
                let err = CoreError::RecoverablePerFile {
                    path: path.to_string(),
                    source: io::Error::new(e.kind(), format!("stat failed: {e}")),
                };
                warn!("{err}");
                return None;
            }
        };
        let _ = identity;

        // Step 2: open read-only no-atime; re-stat for authoritative identity.
        let identity = match self.probe.open_identity(p) {
            Ok(id) => id,
            Err(e) => {
                let err = CoreError::RecoverablePerFile {
                    path: path.to_string(),
                    source: io::Error::new(e.kind(), format!("open failed: {e}")),
                };
                warn!("{err}");
                return None;
            }
        };

        let device_id = identity.device_id;
        let key = (device_id, identity.inode_id);
        let already_scanned = !self.seen_inodes.insert(key);

        let rotational = if self.force_non_rotational {
            false
        } else {
            match self.probe.is_rotational(device_id) {
                Ok(r) => r,
                Err(_) => true, // default to rotational, the safer choice for ordering
            }
        };

        let acc = self.devices.entry(device_id).or_insert_with(|| {
            let mut pack = PackFile::default();
            pack.device_id = device_id;
            DeviceAccumulator {
                rotational,
                pack,
            }
        });
        acc.pack.rotational = rotational;

        let path_index = acc.pack.paths.len();
        acc.pack.paths.push(crate::model::PackPath {
            inode_id: identity.inode_id,
            group_hint: crate::model::UNKNOWN_GROUP,
            path: path.to_string(),
        });

        // Step 3: scanned before via a different alias; path-only, no blocks.
        if already_scanned {
            return Some((device_id, path_index));
        }
        // Step 4: empty file; path-only, no blocks.
        if identity.size == 0 {
            return Some((device_id, path_index));
        }

        // Step 5+6: page residency, coalesced into chunks.
        let residency = match self.probe.page_residency(p, identity.size) {
            Ok(r) => r,
            Err(e) => {
                let err = CoreError::RecoverablePerFile {
                    path: path.to_string(),
                    source: io::Error::new(e.kind(), format!("page residency query failed: {e}")),
                };
                warn!("{err}");
                return Some((device_id, path_index));
            }
        };
        let chunks = coalesce_chunks(&residency);

        for (offset, length) in chunks {
            if rotational {
                match self.probe.extents(p, offset, length) {
                    Ok(extents) => {
                        for extent in extents {
                            if !extent.physical_known {
                                continue;
                            }
                            if let Some((int_off, int_len)) = intersect(
                                offset,
                                length,
                                extent.logical_start,
                                extent.logical_length,
                            ) {
                                let physical =
                                    extent.physical_start + (int_off - extent.logical_start);
                                acc.pack.blocks.push(PackBlock {
                                    path_index,
                                    logical_offset: int_off,
                                    length: int_len,
                                    physical_offset: physical,
                                });
                            }
                        }
                    }
                    Err(e) => {
                        let err = CoreError::RecoverablePerFile {
                            path: path.to_string(),
                            source: io::Error::new(e.kind(), format!("extent query failed: {e}")),
                        };
                        warn!("{err}");
                    }
                }
            } else {
                acc.pack.blocks.push(PackBlock {
                    path_index,
                    logical_offset: offset,
                    length,
                    physical_offset: UNKNOWN_PHYSICAL,
                });
            }
        }

        Some((device_id, path_index))
    }
}

/// Coalesces consecutive present pages into `(offset, length)` byte chunks.
fn coalesce_chunks(residency: &[bool]) -> Vec<(u64, u64)> {
    let mut chunks = Vec::new();
    let mut run_start: Option<usize> = None;
    for (i, &present) in residency.iter().enumerate() {
        match (present, run_start) {
            (true, None) => run_start = Some(i),
            (false, Some(start)) => {
                chunks.push(to_byte_chunk(start, i));
                run_start = None;
            }
            _ => {}
        }
    }
    if let Some(start) = run_start {
        chunks.push(to_byte_chunk(start, residency.len()));
    }
    chunks
}

fn to_byte_chunk(start_page: usize, end_page: usize) -> (u64, u64) {
    let offset = (start_page as u64) << crate::model::PAGE_SHIFT;
    let length = ((end_page - start_page) as u64) << crate::model::PAGE_SHIFT;
    (offset, length)
}

/// Intersection of `[a_off, a_off+a_len)` and `[b_off, b_off+b_len)`, if non-empty.
fn intersect(a_off: u64, a_len: u64, b_off: u64, b_len: u64) -> Option<(u64, u64)> {
    let start = a_off.max(b_off);
    let end = (a_off + a_len).min(b_off + b_len);
    if start < end {
        Some((start, end - start))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coalesce_merges_consecutive_pages() {
        let residency = vec![true, true, false, true, true, true, false, true];
        assert_eq!(
            coalesce_chunks(&residency),
            vec![(0, 2 << 12), (3 << 12, 3 << 12), (7 << 12, 1 << 12)]
        );
    }

    #[test]
    fn coalesce_empty_when_nothing_resident() {
        assert_eq!(coalesce_chunks(&[false, false, false]), vec![]);
    }

    #[test]
    fn intersect_overlap_and_disjoint() {
        assert_eq!(intersect(0, 10, 5, 10), Some((5, 5)));
        assert_eq!(intersect(0, 5, 5, 5), None);
        assert_eq!(intersect(0, 5, 10, 5), None);
    }
}
