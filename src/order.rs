//! C6 — Ordering pass, rotational media only.

use crate::iface::GroupMapper;
use crate::model::{PackFile, UNKNOWN_GROUP};
use crate::model::INODE_GROUP_PRELOAD_THRESHOLD;
use std::collections::HashMap;

/// Applies group-preload hints, block sort, and path sort to a rotational
/// pack. No-op (returns a clone) for non-rotational packs; callers should
/// only invoke this when `pack.rotational` is true.
pub fn order(pack: &PackFile, groups: Option<&dyn GroupMapper>) -> PackFile {
    if !pack.rotational {
        return pack.clone();
    }

    // Resolve each path's group, so the sort and preload-threshold count below can use it.
    let resolved_groups: Vec<i64> = pack
        .paths
        .iter()
        .map(|p| {
            groups
                .and_then(|g| g.group_of(pack.device_id, p.inode_id))
                .map(|g| g as i64)
                .unwrap_or(UNKNOWN_GROUP)
        })
        .collect();

    // Count paths per known group; any group over the threshold is preloaded.
    let mut counts: HashMap<u64, usize> = HashMap::new();
    for &g in &resolved_groups {
        if g != UNKNOWN_GROUP {
            *counts.entry(g as u64).or_insert(0) += 1;
        }
    }
    let mut preload_groups: Vec<u64> = counts
        .into_iter()
        .filter(|&(_, count)| count > INODE_GROUP_PRELOAD_THRESHOLD)
        .map(|(group, _)| group)
        .collect();
    preload_groups.sort_unstable();

    // Block sort: stable by physical_offset ascending.
    let mut blocks = pack.blocks.clone();
    blocks.sort_by_key(|b| b.physical_offset);

    // Path sort: (group asc, unknown last; inode asc; path lex), computing
    // the old->new permutation so block path_index can be rewritten.
    let mut order: Vec<usize> = (0..pack.paths.len()).collect();
    order.sort_by(|&a, &b| {
        let ga = sort_key_group(resolved_groups[a]);
        let gb = sort_key_group(resolved_groups[b]);
        ga.cmp(&gb)
            .then_with(|| pack.paths[a].inode_id.cmp(&pack.paths[b].inode_id))
            .then_with(|| pack.paths[a].path.cmp(&pack.paths[b].path))
    });

    let mut new_index = vec![0usize; pack.paths.len()];
    for (new, &old) in order.iter().enumerate() {
        new_index[old] = new;
    }

    let paths = order
        .iter()
        .map(|&old| {
            let mut p = pack.paths[old].clone();
            p.group_hint = resolved_groups[old];
            p
        })
        .collect();

    for block in &mut blocks {
        block.path_index = new_index[block.path_index];
    }

    PackFile {
        device_id: pack.device_id,
        rotational: true,
        paths,
        blocks,
        groups: preload_groups,
    }
}

/// Unknown groups sort after every known group, ascending within known ones.
fn sort_key_group(group: i64) -> u64 {
    if group == UNKNOWN_GROUP {
        u64::MAX
    } else {
        group as u64
    }
}
