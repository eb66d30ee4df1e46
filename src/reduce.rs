//! C5 — Block reducer: intersects C3's candidate blocks with C1's touched
//! page ranges to drop untouched residue.

use crate::model::{DeviceTable, PackBlock, PackFile, PAGE_SHIFT};
use std::collections::HashMap;

/// Reduces one device's candidate blocks against `table`, preserving input
/// order within each path and never reordering across paths.
pub fn reduce(pack: &PackFile, table: &DeviceTable) -> PackFile {
    let mut groups: Vec<(usize, Vec<&PackBlock>)> = Vec::new();
    let mut group_index: HashMap<usize, usize> = HashMap::new();
    for block in &pack.blocks {
        let idx = *group_index.entry(block.path_index).or_insert_with(|| {
            groups.push((block.path_index, Vec::new()));
            groups.len() - 1
        });
        groups[idx].1.push(block);
    }

    let device = table.device(pack.device_id);
    let mut out_blocks = Vec::new();

    for (path_index, blocks) in groups {
        let inode_id = pack.paths[path_index].inode_id;
        let ranges = device.and_then(|d| d.get(inode_id)).map(|ii| &ii.ranges[..]);

        let Some(ranges) = ranges else {
            // Sentinel: opened but never read, only dentry access observed.
            out_blocks.push(PackBlock {
                path_index,
                logical_offset: 0,
                length: 0,
                physical_offset: 0,
            });
            continue;
        };

        let mut r = 0usize;
        for block in blocks {
            let block_pages_start = block.logical_offset >> PAGE_SHIFT;
            let block_pages_end = (block.logical_offset + block.length) >> PAGE_SHIFT;

            // Advance `r` past any range fully below this block.
            while r < ranges.len() && ranges[r].end <= block_pages_start {
                r += 1;
            }

            let mut cursor = r;
            while cursor < ranges.len() && ranges[cursor].start < block_pages_end {
                let range = &ranges[cursor];
                let offset = (range.start << PAGE_SHIFT).max(block.logical_offset);
                let end = (range.end << PAGE_SHIFT).min(block.logical_offset + block.length);
                if end > offset {
                    out_blocks.push(PackBlock {
                        path_index,
                        logical_offset: offset,
                        length: end - offset,
                        physical_offset: block.physical_offset + (offset - block.logical_offset),
                    });
                }
                if range.end > block_pages_end {
                    // Keep this range for the next block; don't advance `r`.
                    break;
                }
                cursor += 1;
                r = cursor;
            }
        }
    }

    PackFile {
        device_id: pack.device_id,
        rotational: pack.rotational,
        paths: pack.paths.clone(),
        blocks: out_blocks,
        groups: pack.groups.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DeviceId, PackPath};

    fn dev() -> DeviceId {
        DeviceId { major: 8, minor: 0 }
    }

    #[test]
    fn sentinel_for_unread_inode() {
        let pack = PackFile {
            device_id: dev(),
            rotational: false,
            paths: vec![PackPath {
                inode_id: 2,
                group_hint: -1,
                path: "/a".into(),
            }],
            blocks: vec![
                PackBlock {
                    path_index: 0,
                    logical_offset: 0,
                    length: 4096,
                    physical_offset: 0,
                },
                PackBlock {
                    path_index: 0,
                    logical_offset: 8192,
                    length: 4096,
                    physical_offset: 8192,
                },
                PackBlock {
                    path_index: 0,
                    logical_offset: 16384,
                    length: 4096,
                    physical_offset: 16384,
                },
            ],
            groups: vec![],
        };
        let table = DeviceTable::new();
        let reduced = reduce(&pack, &table);
        assert_eq!(reduced.blocks.len(), 1);
        assert_eq!(
            reduced.blocks[0],
            PackBlock {
                path_index: 0,
                logical_offset: 0,
                length: 0,
                physical_offset: 0,
            }
        );
    }

    #[test]
    fn intersection_arithmetic() {
        let mut table = DeviceTable::new();
        {
            let device = table.device_mut(dev());
            let inode = device.get_or_insert(1);
            for (s, e) in [
                (13u64, 19u64),
                (22, 24),
                (32, 46),
                (52, 54),
                (56, 58),
                (62, 63),
                (69, 70),
            ] {
                inode.ranges.push(crate::model::PageRange { start: s, end: e });
            }
        }

        let mut blocks = Vec::new();
        for start_page in [13u64, 20, 33, 43, 53, 63] {
            blocks.push(PackBlock {
                path_index: 0,
                logical_offset: start_page << PAGE_SHIFT,
                length: 5 << PAGE_SHIFT,
                physical_offset: start_page << PAGE_SHIFT,
            });
        }
        let pack = PackFile {
            device_id: dev(),
            rotational: true,
            paths: vec![PackPath {
                inode_id: 1,
                group_hint: -1,
                path: "/f".into(),
            }],
            blocks,
            groups: vec![],
        };

        let reduced = reduce(&pack, &table);
        let expected: Vec<(u64, u64)> = vec![
            (13 << PAGE_SHIFT, 5 << PAGE_SHIFT),
            (22 << PAGE_SHIFT, 2 << PAGE_SHIFT),
            (33 << PAGE_SHIFT, 5 << PAGE_SHIFT),
            (43 << PAGE_SHIFT, 3 << PAGE_SHIFT),
            (53 << PAGE_SHIFT, 1 << PAGE_SHIFT),
            (56 << PAGE_SHIFT, 2 << PAGE_SHIFT),
        ];
        let got: Vec<(u64, u64)> = reduced
            .blocks
            .iter()
            .map(|b| (b.logical_offset, b.length))
            .collect();
        assert_eq!(got, expected);
        for b in &reduced.blocks {
            assert_eq!(b.physical_offset, b.logical_offset);
        }
    }
}
