// Copyright (c) Tidepool Project Contributors.
// Licensed under the MIT License.

use std::alloc::{Layout, alloc, handle_alloc_error};
use std::ptr::{self, NonNull};

use parking_lot::Mutex;
use tracing::{Level, event};

use crate::ThreadSafe;

/// The strictest alignment unit on the target platform, derived from a set of representative
/// machine types. Every block payload starts on a `CLICK` boundary and every allocation size is
/// rounded up to a multiple of it, so any plain-old-data type can live in pool memory.
pub(crate) const CLICK: usize = {
    let mut strictest = align_of::<*const u8>();
    if align_of::<fn()>() > strictest {
        strictest = align_of::<fn()>();
    }
    if align_of::<u64>() > strictest {
        strictest = align_of::<u64>();
    }
    if align_of::<f64>() > strictest {
        strictest = align_of::<f64>();
    }
    strictest
};

/// Granularity of block payloads. Requests are rounded up to a multiple of this, which keeps the
/// free list coarse enough that most block requests are served without touching the system heap.
pub(crate) const BLOCK_MINFREE: usize = 2048;

/// Header size rounded up so the payload that follows stays CLICK-aligned.
const HDR_BYTES: usize = size_of::<BlockHdr>().div_ceil(CLICK) * CLICK;

const _: () = assert!(align_of::<BlockHdr>() <= CLICK);

/// Bookkeeping header at the start of every heap block.
///
/// The payload begins `HDR_BYTES` past the header. A block is always on exactly one singly-linked
/// chain: either some pool's block chain or the process-wide free list.
#[repr(C)]
pub(crate) struct BlockHdr {
    /// One past the last usable payload byte.
    pub(crate) endp: *mut u8,
    /// Next block on whichever chain currently owns this block.
    pub(crate) next: *mut BlockHdr,
    /// Bump pointer: the next unused payload byte. Never exceeds `endp`.
    pub(crate) first_avail: *mut u8,
}

/// First payload byte of `blok`.
///
/// # Safety
///
/// `blok` must point to a live block obtained from this module.
pub(crate) unsafe fn payload_start(blok: *mut BlockHdr) -> *mut u8 {
    // SAFETY: The payload is part of the same heap allocation as the header, so deriving the
    // pointer from the header pointer stays in bounds.
    unsafe { blok.cast::<u8>().add(HDR_BYTES) }
}

/// Unused payload capacity of `blok` in bytes.
///
/// # Safety
///
/// `blok` must point to a live block obtained from this module.
unsafe fn capacity(blok: *mut BlockHdr) -> usize {
    // SAFETY: Caller guarantees a live block, whose invariant is first_avail <= endp.
    unsafe { (*blok).endp.addr() - (*blok).first_avail.addr() }
}

/// Process-wide block state: the free list plus the allocation counters. The mutex keeps the
/// registry itself coherent; the crate's single-threaded discipline is documented on [`crate`].
struct BlockRegistry {
    free_list: ThreadSafe<*mut BlockHdr>,
    stat_malloc: u32,
    stat_freehit: u32,
}

static REGISTRY: Mutex<BlockRegistry> = Mutex::new(BlockRegistry {
    // SAFETY: A null pointer is trivially safe to share; real pointers that replace it are only
    // touched under this mutex.
    free_list: unsafe { ThreadSafe::new(ptr::null_mut()) },
    stat_malloc: 0,
    stat_freehit: 0,
});

/// Returns an empty block whose payload capacity is at least `min_size` bytes (zero rounds up to
/// one grain). The free list is scanned first-fit; only a miss touches the system heap.
///
/// Heap exhaustion is not recoverable: it logs at ERROR level and terminates the process.
pub(crate) fn obtain_block(min_size: usize) -> NonNull<BlockHdr> {
    let size = min_size
        .max(1)
        .div_ceil(BLOCK_MINFREE)
        .checked_mul(BLOCK_MINFREE)
        .expect("rounded block size cannot overflow usize");

    let mut registry = REGISTRY.lock();

    let mut prev: *mut BlockHdr = ptr::null_mut();
    let mut blok = *registry.free_list;

    while !blok.is_null() {
        // SAFETY: Every pointer reachable from the free list head is a live block, and unlinking
        // rewrites only chain pointers owned by this registry.
        unsafe {
            if size <= capacity(blok) {
                if prev.is_null() {
                    *registry.free_list = (*blok).next;
                } else {
                    (*prev).next = (*blok).next;
                }
                (*blok).next = ptr::null_mut();

                registry.stat_freehit += 1;
                return NonNull::new_unchecked(blok);
            }

            prev = blok;
            blok = (*blok).next;
        }
    }

    registry.stat_malloc += 1;
    drop(registry);

    malloc_block(size)
}

fn block_layout(payload_size: usize) -> Layout {
    let total = HDR_BYTES
        .checked_add(payload_size)
        .expect("block size cannot overflow usize");

    Layout::from_size_align(total, CLICK)
        .expect("block layout is always valid for a sane payload size")
}

/// Grabs a completely new block from the system heap.
fn malloc_block(payload_size: usize) -> NonNull<BlockHdr> {
    let layout = block_layout(payload_size);

    // SAFETY: The layout has nonzero size; HDR_BYTES alone guarantees that.
    let raw = unsafe { alloc(layout) };

    let Some(raw) = NonNull::new(raw) else {
        event!(
            Level::ERROR,
            message = "fatal: memory exhausted",
            requested_bytes = layout.size()
        );
        handle_alloc_error(layout);
    };

    let blok = raw.cast::<BlockHdr>();

    // SAFETY: The allocation is HDR_BYTES + payload_size bytes, so the header and both derived
    // payload pointers stay in bounds. Field writes through the raw pointer initialize the
    // header without reading uninitialized memory.
    unsafe {
        let payload = raw.as_ptr().add(HDR_BYTES);
        (*blok.as_ptr()).next = ptr::null_mut();
        (*blok.as_ptr()).first_avail = payload;
        (*blok.as_ptr()).endp = payload.add(payload_size);
    }

    blok
}

/// Prepends an entire chain of blocks to the free list, resetting each block to empty. A null
/// `head` is a no-op.
///
/// Blocks on the free list never return to the system heap; a long-lived daemon reaches a
/// steady state where every block request is a free-list hit.
///
/// # Safety
///
/// Every block reachable from `head` must be a live block owned by the caller's chain and absent
/// from the free list. In debug builds a violation of the latter is detected and fatal.
pub(crate) unsafe fn release_chain(head: *mut BlockHdr) {
    if head.is_null() {
        return;
    }

    let mut registry = REGISTRY.lock();
    let old_head = *registry.free_list;

    // SAFETY: Caller guarantees a live, exclusively owned chain; the old free-list head is only
    // spliced onto the tail after the tail has been reset.
    unsafe {
        let mut blok = head;
        loop {
            assert_not_on_free_list(blok, old_head);
            (*blok).first_avail = payload_start(blok);

            if (*blok).next.is_null() {
                (*blok).next = old_head;
                break;
            }
            blok = (*blok).next;
        }
    }

    *registry.free_list = head;
}

/// Debug guard against releasing a block that is already free. Corrupting the free list would
/// make two pools share storage, so this is fatal rather than recoverable.
#[cfg(debug_assertions)]
unsafe fn assert_not_on_free_list(blok: *mut BlockHdr, mut free: *mut BlockHdr) {
    while !free.is_null() {
        assert!(
            !ptr::eq(free, blok),
            "block released twice: already present on the free list"
        );
        // SAFETY: Caller passes the free-list head; every reachable pointer is a live block.
        free = unsafe { (*free).next };
    }
}

#[cfg(not(debug_assertions))]
unsafe fn assert_not_on_free_list(_blok: *mut BlockHdr, _free: *mut BlockHdr) {}

/// Sums payload capacities over a chain (capacity, not high-water mark).
///
/// # Safety
///
/// Every block reachable from `blok` must be live.
pub(crate) unsafe fn bytes_in_chain(mut blok: *mut BlockHdr) -> u64 {
    let mut total: u64 = 0;

    while !blok.is_null() {
        // SAFETY: Caller guarantees a live chain; endp never precedes the payload start.
        unsafe {
            total += ((*blok).endp.addr() - payload_start(blok).addr()) as u64;
            blok = (*blok).next;
        }
    }

    total
}

/// Snapshot of the process-wide counters: `(blocks_allocated, blocks_reused, free_list_bytes)`.
pub(crate) fn registry_snapshot() -> (u32, u32, u64) {
    let registry = REGISTRY.lock();

    // SAFETY: The free list head is only mutated under the registry lock, which we hold.
    let free_bytes = unsafe { bytes_in_chain(*registry.free_list) };

    (registry.stat_malloc, registry.stat_freehit, free_bytes)
}

/// Abandons the current free list so a test can observe block traffic without interference from
/// whatever earlier tests left behind. The blocks are leaked, which is fine in a test process.
#[cfg(test)]
pub(crate) fn abandon_free_list_for_tests() {
    let mut registry = REGISTRY.lock();
    *registry.free_list = ptr::null_mut();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::serialize_global_state;

    #[test]
    fn rounds_request_to_grain() {
        let _guard = serialize_global_state();
        abandon_free_list_for_tests();

        for (requested, expected) in [
            (0, BLOCK_MINFREE),
            (1, BLOCK_MINFREE),
            (BLOCK_MINFREE, BLOCK_MINFREE),
            (BLOCK_MINFREE + 1, 2 * BLOCK_MINFREE),
            (3 * BLOCK_MINFREE - 7, 3 * BLOCK_MINFREE),
        ] {
            let blok = obtain_block(requested).as_ptr();

            // SAFETY: Freshly obtained block.
            unsafe {
                assert_eq!(capacity(blok), expected, "request of {requested} bytes");
                assert_eq!((*blok).first_avail, payload_start(blok));
                assert!((*blok).next.is_null());

                release_chain(blok);
            }
        }
    }

    #[test]
    fn payload_is_click_aligned() {
        let _guard = serialize_global_state();

        let blok = obtain_block(1).as_ptr();

        // SAFETY: Freshly obtained block.
        unsafe {
            assert_eq!(payload_start(blok).addr() % CLICK, 0);
            release_chain(blok);
        }
    }

    #[test]
    fn free_list_is_reused_first_fit() {
        let _guard = serialize_global_state();
        abandon_free_list_for_tests();

        let small = obtain_block(BLOCK_MINFREE).as_ptr();
        let large = obtain_block(4 * BLOCK_MINFREE).as_ptr();

        // SAFETY: Both blocks are live and owned by this test until released.
        unsafe {
            release_chain(small);
            release_chain(large);
            // LIFO order: the large block is now at the head of the free list.

            let (malloc_before, freehit_before, _) = registry_snapshot();

            // First fit: a small request is served by the head block even though it is larger
            // than necessary.
            let reused = obtain_block(BLOCK_MINFREE).as_ptr();
            assert!(ptr::eq(reused, large));

            let (malloc_after, freehit_after, _) = registry_snapshot();
            assert_eq!(malloc_after, malloc_before);
            assert_eq!(freehit_after, freehit_before + 1);

            // A request too big for the remaining (small) free block must hit the heap.
            let fresh = obtain_block(2 * BLOCK_MINFREE).as_ptr();
            assert!(!ptr::eq(fresh, small));

            let (malloc_final, _, _) = registry_snapshot();
            assert_eq!(malloc_final, malloc_after + 1);

            release_chain(reused);
            release_chain(fresh);
        }
    }

    #[test]
    fn releasing_chain_resets_every_block() {
        let _guard = serialize_global_state();
        abandon_free_list_for_tests();

        let first = obtain_block(BLOCK_MINFREE).as_ptr();
        let second = obtain_block(BLOCK_MINFREE).as_ptr();

        // SAFETY: Both blocks are live; the chain is assembled from exclusively owned blocks.
        unsafe {
            // Consume some payload and chain the blocks together.
            (*first).first_avail = (*first).first_avail.add(CLICK * 4);
            (*first).next = second;
            (*second).first_avail = (*second).endp;

            release_chain(first);

            let (_, _, free_bytes) = registry_snapshot();
            assert_eq!(free_bytes, 2 * BLOCK_MINFREE as u64);

            // Both come back empty.
            let a = obtain_block(BLOCK_MINFREE).as_ptr();
            let b = obtain_block(BLOCK_MINFREE).as_ptr();
            assert_eq!(capacity(a), BLOCK_MINFREE);
            assert_eq!(capacity(b), BLOCK_MINFREE);

            release_chain(a);
            release_chain(b);
        }
    }

    #[test]
    fn bytes_in_chain_sums_capacity() {
        let _guard = serialize_global_state();
        abandon_free_list_for_tests();

        let first = obtain_block(BLOCK_MINFREE).as_ptr();
        let second = obtain_block(3 * BLOCK_MINFREE).as_ptr();

        // SAFETY: Both blocks are live and exclusively owned.
        unsafe {
            (*first).next = second;
            // Consuming payload must not change the reported capacity.
            (*second).first_avail = (*second).endp;

            assert_eq!(bytes_in_chain(first), 4 * BLOCK_MINFREE as u64);

            release_chain(first);
        }
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "block released twice")]
    fn double_release_is_fatal() {
        let _guard = serialize_global_state();

        let blok = obtain_block(BLOCK_MINFREE).as_ptr();

        // SAFETY: The first release is legitimate; the second is the violation under test.
        unsafe {
            release_chain(blok);
            release_chain(blok);
        }
    }
}
