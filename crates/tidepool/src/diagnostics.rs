// Copyright (c) Tidepool Project Contributors.
// Licensed under the MIT License.

use tracing::{Level, event};

use crate::block;
use crate::pool::{self, PoolInner};

/// Process-wide allocation counters, for operators watching a long-running daemon settle into
/// its steady state (where `blocks_reused` grows and `blocks_allocated` stops).
#[derive(Clone, Copy, Debug, Eq, PartialEq, derive_more::Display)]
#[display("{blocks_allocated} blocks malloc'd, {blocks_reused} blocks reused, {free_list_bytes} bytes free")]
pub struct AllocatorStats {
    /// Blocks ever obtained from the system heap.
    pub blocks_allocated: u32,
    /// Block requests served from the free list instead of the heap.
    pub blocks_reused: u32,
    /// Total payload capacity currently parked on the free list.
    pub free_list_bytes: u64,
}

/// Snapshot of the process-wide allocation counters.
#[must_use]
pub fn stats() -> AllocatorStats {
    let (blocks_allocated, blocks_reused, free_list_bytes) = block::registry_snapshot();

    AllocatorStats {
        blocks_allocated,
        blocks_reused,
        free_list_bytes,
    }
}

/// Logs the pool tree from the permanent root - one event per pool with its depth and byte
/// total - followed by the free-list and counter summary. Purely observational; pools are not
/// touched.
pub fn walk_pools() {
    event!(Level::INFO, message = "memory pool allocation");

    let total = pool::permanent_inner().map_or(0, |root| {
        // SAFETY: The permanent tree is live for the life of the process and this walk only
        // reads it.
        unsafe { walk_tree(root, 0) }
    });

    event!(Level::INFO, message = "total bytes allocated", bytes = total);

    let stats = stats();
    if stats.free_list_bytes == 0 {
        event!(Level::INFO, message = "free block list: empty");
    } else {
        event!(
            Level::INFO,
            message = "free block list",
            bytes = stats.free_list_bytes
        );
    }
    event!(
        Level::INFO,
        message = "block traffic",
        mallocs = stats.blocks_allocated,
        reuses = stats.blocks_reused
    );
}

/// Walks `p` and its siblings, logging and summing byte totals, recursing into children.
///
/// # Safety
///
/// `p` must be null or point into a live pool tree that no one mutates during the walk.
unsafe fn walk_tree(mut p: *mut PoolInner, depth: u32) -> u64 {
    let mut total: u64 = 0;

    while !p.is_null() {
        // SAFETY: Caller guarantees a live, quiescent tree.
        unsafe {
            let bytes = block::bytes_in_chain((*p).first);
            total += bytes;

            event!(Level::INFO, message = "pool", depth, bytes);

            if !(*p).sub_pools.is_null() {
                total += walk_tree((*p).sub_pools, depth + 1);
            }

            p = (*p).sub_next;
        }
    }

    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Pool;
    use crate::testing::serialize_global_state;

    #[test]
    fn stats_track_block_traffic() {
        let _guard = serialize_global_state();

        let before = stats();

        let pool = Pool::new();
        let after_create = stats();
        assert_eq!(
            after_create.blocks_allocated + after_create.blocks_reused,
            before.blocks_allocated + before.blocks_reused + 1
        );

        pool.destroy();
        let after_destroy = stats();
        assert!(after_destroy.free_list_bytes > 0);
    }

    #[test]
    fn walk_covers_the_permanent_tree() {
        let _guard = serialize_global_state();

        let child = Pool::permanent().subpool();
        let grandchild = child.subpool();

        // Smoke: the walk must traverse the whole tree without touching it.
        walk_pools();

        drop(grandchild);
        child.destroy();
    }

    #[test]
    fn stats_display_is_operator_friendly() {
        let rendered = AllocatorStats {
            blocks_allocated: 3,
            blocks_reused: 5,
            free_list_bytes: 4096,
        }
        .to_string();

        assert_eq!(rendered, "3 blocks malloc'd, 5 blocks reused, 4096 bytes free");
    }
}
