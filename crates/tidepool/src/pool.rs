// Copyright (c) Tidepool Project Contributors.
// Licensed under the MIT License.

use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::ptr::{self, NonNull};
use std::slice;

use once_cell::sync::OnceCell;

use crate::ThreadSafe;
use crate::alarms::AlarmGuard;
use crate::block::{self, BLOCK_MINFREE, BlockHdr, CLICK};
use crate::cleanup::{self, CleanupRec};

/// The pool record. It lives inside the first CLICK-multiples of the pool's own first block, so
/// releasing that block to the free list is what actually ends the pool's life.
#[repr(C)]
pub(crate) struct PoolInner {
    /// Head of the block chain. Never null while the pool exists.
    pub(crate) first: *mut BlockHdr,
    /// Tail of the block chain; allocation always bumps here.
    pub(crate) last: *mut BlockHdr,
    /// LIFO list of registered cleanups.
    pub(crate) cleanups: *mut CleanupRec,
    /// Head of the child list.
    pub(crate) sub_pools: *mut PoolInner,
    /// Next sibling. Null iff this pool is the tail of its parent's child list.
    pub(crate) sub_next: *mut PoolInner,
    /// Previous sibling. Null iff this pool is the head of its parent's child list.
    pub(crate) sub_prev: *mut PoolInner,
    /// Non-owning back-reference; null for root pools.
    pub(crate) parent: *mut PoolInner,
    /// Snapshot of the first block's bump pointer taken at creation; clearing rewinds to here.
    pub(crate) free_first_avail: *mut u8,
}

/// Pool record size rounded up so suballocation after the carve-out stays CLICK-aligned.
const POOL_HDR_BYTES: usize = size_of::<PoolInner>().div_ceil(CLICK) * CLICK;

const _: () = assert!(POOL_HDR_BYTES <= BLOCK_MINFREE);

static PERMANENT: OnceCell<ThreadSafe<Pool<'static>>> = OnceCell::new();

/// A region of memory that is released as a whole.
///
/// Allocations ([`alloc`][Self::alloc], [`strdup`][Pool::strdup], ...) borrow the handle, so the
/// borrow checker guarantees they are not used after the pool is cleared or destroyed. Child
/// pools created with [`subpool`][Self::subpool] borrow their parent the same way: a parent
/// cannot be cleared or destroyed while a child handle is live, and destroying the parent (after
/// the child handles are gone) tears down the children with it.
///
/// Dropping a handle does *not* release the pool; a pool lives until it is destroyed explicitly
/// or its parent is cleared or destroyed. Root pools created with [`Pool::new`] that are never
/// destroyed simply last until process exit, like the permanent pool.
#[derive(derive_more::Debug)]
#[debug("Pool({inner:?})")]
pub struct Pool<'a> {
    inner: NonNull<PoolInner>,
    _parent: PhantomData<&'a PoolInner>,
    // One allocator user per process: handles must not migrate across threads.
    _single_threaded: PhantomData<*const ()>,
}

impl Pool<'static> {
    /// Creates a new root pool with no parent.
    #[must_use]
    pub fn new() -> Self {
        // SAFETY: A freshly created record with no parent.
        unsafe { Self::from_inner(create_pool(ptr::null_mut())) }
    }

    /// The process-wide root pool, parent of everything whose creator does not pass another
    /// parent. Created on first access; subsequent calls return the same pool.
    ///
    /// The permanent pool is handed out by shared reference, so it can allocate and spawn
    /// sub-pools but can never be cleared or destroyed - it lasts until process exit.
    pub fn permanent() -> &'static Self {
        PERMANENT.get_or_init(|| {
            // SAFETY: The handle is published read-only and every operation reachable through a
            // shared reference routes process-wide mutations through the guarded registries.
            // Cross-thread use is excluded by the crate's single-threaded discipline.
            unsafe { ThreadSafe::new(Self::new()) }
        })
    }
}

impl Default for Pool<'static> {
    fn default() -> Self {
        Self::new()
    }
}

impl Pool<'_> {
    /// # Safety
    ///
    /// `inner` must point to a live pool record whose parent (if any) outlives the handle's
    /// lifetime parameter.
    const unsafe fn from_inner(inner: NonNull<PoolInner>) -> Self {
        Self {
            inner,
            _parent: PhantomData,
            _single_threaded: PhantomData,
        }
    }

    pub(crate) fn inner_ptr(&self) -> *mut PoolInner {
        self.inner.as_ptr()
    }

    /// Creates a child pool. The child is destroyed automatically when this pool is cleared or
    /// destroyed; destroying the child first detaches it cleanly.
    #[must_use]
    pub fn subpool(&self) -> Pool<'_> {
        // SAFETY: The record is freshly created; `self` outlives the returned borrow.
        unsafe { Pool::from_inner(create_pool(self.inner.as_ptr())) }
    }

    /// Returns `size` bytes of uninitialized, CLICK-aligned pool memory.
    ///
    /// The fast path is a pointer bump in the tail block; only exhaustion of that block reaches
    /// the block layer. Returned memory stays valid (and never moves) until the pool is cleared
    /// or destroyed, which the returned borrow enforces. A `size` of zero yields an empty slice
    /// without touching the pool.
    #[must_use]
    pub fn alloc(&self, size: usize) -> &mut [MaybeUninit<u8>] {
        if size == 0 {
            return &mut [];
        }

        // SAFETY: The handle keeps the record live, size is nonzero, and the returned region is
        // freshly carved so handing out an exclusive slice over it aliases nothing.
        unsafe {
            let data = palloc_raw(self.inner.as_ptr(), size);
            slice::from_raw_parts_mut(data.cast::<MaybeUninit<u8>>(), size)
        }
    }

    /// [`alloc`][Self::alloc] followed by zero-fill.
    #[must_use]
    pub fn alloc_zeroed(&self, size: usize) -> &mut [u8] {
        if size == 0 {
            return &mut [];
        }

        // SAFETY: As for `alloc`; the region is fully initialized before the slice exists.
        unsafe {
            let data = palloc_raw(self.inner.as_ptr(), size);
            data.write_bytes(0, size);
            slice::from_raw_parts_mut(data, size)
        }
    }

    /// Empties the pool: runs its cleanups in registration (LIFO) order, destroys its sub-pools,
    /// and returns every block except the first to the free list. The pool itself remains usable.
    /// Clearing an already-empty pool is a no-op.
    pub fn clear(&mut self) {
        // SAFETY: `&mut self` proves there are no outstanding borrows of allocations or child
        // handles, so everything torn down here is unreachable.
        unsafe { clear_pool(self.inner.as_ptr()) }
    }

    /// Destroys the pool: detaches it from its parent, clears it, and returns its last block to
    /// the free list. Consumes the handle - the pool record itself lives in that last block.
    pub fn destroy(self) {
        // SAFETY: Consuming the handle proves there are no outstanding borrows; the record and
        // everything reachable from it is exclusively ours to tear down.
        unsafe { destroy_pool(self.inner.as_ptr()) }
    }

    /// Total payload capacity of this pool's own block chain, in bytes. Children are not
    /// included; the debug walker sums the whole tree.
    #[must_use]
    pub fn bytes(&self) -> u64 {
        // SAFETY: The handle keeps the chain live.
        unsafe { block::bytes_in_chain((*self.inner.as_ptr()).first) }
    }
}

/// The permanent pool's record, if the permanent pool has been created.
pub(crate) fn permanent_inner() -> Option<*mut PoolInner> {
    PERMANENT.get().map(|pool| pool.inner.as_ptr())
}

/// Obtains a minimum-size block, carves the zeroed pool record out of its head, and links the
/// pool under `parent` (null for a root pool).
fn create_pool(parent: *mut PoolInner) -> NonNull<PoolInner> {
    let _alarms = AlarmGuard::new();

    let blok = block::obtain_block(0).as_ptr();

    // SAFETY: A fresh block has at least BLOCK_MINFREE bytes of CLICK-aligned payload, which the
    // const assertion above proves is enough for the record; the parent linkage rewrites only
    // pointers owned by the live parent record.
    unsafe {
        let record = (*blok).first_avail.cast::<PoolInner>();
        (*blok).first_avail = (*blok).first_avail.add(POOL_HDR_BYTES);

        record.write(PoolInner {
            first: blok,
            last: blok,
            cleanups: ptr::null_mut(),
            sub_pools: ptr::null_mut(),
            sub_next: ptr::null_mut(),
            sub_prev: ptr::null_mut(),
            parent,
            free_first_avail: (*blok).first_avail,
        });

        if !parent.is_null() {
            (*record).sub_next = (*parent).sub_pools;
            if !(*record).sub_next.is_null() {
                (*(*record).sub_next).sub_prev = record;
            }
            (*parent).sub_pools = record;
        }

        NonNull::new_unchecked(record)
    }
}

/// Bump allocation from `p`, spilling into a fresh block when the tail block is exhausted.
///
/// # Safety
///
/// `p` must point to a live pool record and `reqsize` must be nonzero.
pub(crate) unsafe fn palloc_raw(p: *mut PoolInner, reqsize: usize) -> *mut u8 {
    let size = reqsize
        .div_ceil(CLICK)
        .checked_mul(CLICK)
        .expect("rounded allocation size cannot overflow usize");

    // For performance, see if space is available in the most recently allocated block.
    //
    // SAFETY: Caller guarantees a live record; the tail block is live by the chain invariant and
    // the capacity check keeps the bump inside its payload.
    unsafe {
        let blok = (*p).last;
        let first_avail = (*blok).first_avail;

        if size <= (*blok).endp.addr() - first_avail.addr() {
            (*blok).first_avail = first_avail.add(size);
            return first_avail;
        }
    }

    // Need a new block that is big enough. This path crosses the process-wide free list, so it
    // runs alarm-blocked.
    let _alarms = AlarmGuard::new();

    // SAFETY: The fresh block's capacity is at least `size` by the block layer's contract, and
    // appending rewrites only chain pointers owned by this pool.
    unsafe {
        let blok = block::obtain_block(size).as_ptr();
        (*(*p).last).next = blok;
        (*p).last = blok;

        let first_avail = (*blok).first_avail;
        (*blok).first_avail = first_avail.add(size);
        first_avail
    }
}

/// # Safety
///
/// `p` must point to a live pool record with no outstanding borrows of its memory, its
/// cleanups, or its descendants.
pub(crate) unsafe fn clear_pool(p: *mut PoolInner) {
    let _alarms = AlarmGuard::new();

    // SAFETY: Caller guarantees exclusive access to a live record. Cleanup records and child
    // records live in arena memory that stays valid until the blocks are released below, and the
    // release happens only after both lists have been detached.
    unsafe {
        cleanup::run_plain((*p).cleanups);
        (*p).cleanups = ptr::null_mut();

        // Destroying a child unlinks it from our list, so this drains to null.
        while !(*p).sub_pools.is_null() {
            destroy_pool((*p).sub_pools);
        }

        block::release_chain((*(*p).first).next);
        (*(*p).first).next = ptr::null_mut();

        (*p).last = (*p).first;
        (*(*p).first).first_avail = (*p).free_first_avail;
    }
}

/// # Safety
///
/// As for [`clear_pool`]; additionally `p` is invalid the moment this returns, because the
/// record's own storage goes back to the free list.
pub(crate) unsafe fn destroy_pool(p: *mut PoolInner) {
    let _alarms = AlarmGuard::new();

    // SAFETY: Caller guarantees exclusive access; sibling and parent records are live because
    // the tree only ever drops leaves-first through this very function.
    unsafe {
        let parent = (*p).parent;
        if !parent.is_null() {
            if ptr::eq((*parent).sub_pools, p) {
                (*parent).sub_pools = (*p).sub_next;
            }
            if !(*p).sub_prev.is_null() {
                (*(*p).sub_prev).sub_next = (*p).sub_next;
            }
            if !(*p).sub_next.is_null() {
                (*(*p).sub_next).sub_prev = (*p).sub_prev;
            }
        }

        clear_pool(p);
        block::release_chain((*p).first);
    }
}

#[cfg(test)]
mod tests {
    use static_assertions::assert_not_impl_any;

    use super::*;
    use crate::testing::serialize_global_state;

    assert_not_impl_any!(Pool<'static>: Send, Sync);

    #[test]
    fn alloc_returns_aligned_disjoint_regions() {
        let _guard = serialize_global_state();

        let pool = Pool::new();

        let a = pool.alloc_zeroed(10);
        let b = pool.alloc_zeroed(17);

        assert_eq!(a.as_ptr().addr() % CLICK, 0);
        assert_eq!(b.as_ptr().addr() % CLICK, 0);
        assert_eq!(a.len(), 10);
        assert_eq!(b.len(), 17);

        a.fill(0xAA);
        b.fill(0xBB);
        assert!(a.iter().all(|&byte| byte == 0xAA));
        assert!(b.iter().all(|&byte| byte == 0xBB));

        pool.destroy();
    }

    #[test]
    fn zero_size_alloc_is_empty() {
        let _guard = serialize_global_state();

        let pool = Pool::new();

        assert!(pool.alloc(0).is_empty());
        assert!(pool.alloc_zeroed(0).is_empty());

        pool.destroy();
    }

    #[test]
    fn earlier_allocations_survive_block_spill() {
        let _guard = serialize_global_state();

        let pool = Pool::new();

        let early = pool.alloc_zeroed(10);
        early.fill(0x5A);

        // Far larger than the remaining capacity of the first block: forces a second block.
        let late = pool.alloc_zeroed(2 * BLOCK_MINFREE);

        assert!(early.iter().all(|&byte| byte == 0x5A));
        assert_eq!(late.len(), 2 * BLOCK_MINFREE);
        assert!(pool.bytes() >= (3 * BLOCK_MINFREE) as u64);

        pool.destroy();
    }

    #[test]
    fn oversized_request_gets_single_fitted_block() {
        let _guard = serialize_global_state();
        block::abandon_free_list_for_tests();

        let pool = Pool::new();
        let before = pool.bytes();

        _ = pool.alloc_zeroed(3 * BLOCK_MINFREE + 1);

        // One new block, rounded up to the next grain.
        assert_eq!(pool.bytes(), before + (4 * BLOCK_MINFREE) as u64);

        pool.destroy();
    }

    #[test]
    fn clear_rewinds_to_creation_state() {
        let _guard = serialize_global_state();

        let mut pool = Pool::new();
        let fresh_bytes = pool.bytes();

        _ = pool.alloc_zeroed(100);
        _ = pool.alloc_zeroed(3 * BLOCK_MINFREE);
        assert!(pool.bytes() > fresh_bytes);

        pool.clear();

        // Back to a single block with the record still intact.
        assert_eq!(pool.bytes(), fresh_bytes);

        // SAFETY: The handle keeps the record live.
        unsafe {
            let p = pool.inner_ptr();
            assert!((*p).cleanups.is_null());
            assert!((*p).sub_pools.is_null());
            assert!(ptr::eq((*p).first, (*p).last));
            assert_eq!((*(*p).first).first_avail, (*p).free_first_avail);
        }

        // Idempotent.
        pool.clear();
        assert_eq!(pool.bytes(), fresh_bytes);

        // And the pool is still usable afterwards.
        let data = pool.alloc_zeroed(64);
        assert_eq!(data.len(), 64);

        pool.destroy();
    }

    #[test]
    fn clear_destroys_children() {
        let _guard = serialize_global_state();

        let mut parent = Pool::new();

        {
            let child_a = parent.subpool();
            let child_b = parent.subpool();
            _ = child_a.alloc_zeroed(32);
            _ = child_b.alloc_zeroed(32);
        }

        parent.clear();

        // SAFETY: The handle keeps the record live.
        unsafe {
            assert!((*parent.inner_ptr()).sub_pools.is_null());
        }

        parent.destroy();
    }

    #[test]
    fn destroying_middle_child_patches_sibling_links() {
        let _guard = serialize_global_state();

        let parent = Pool::new();

        let first = parent.subpool();
        let middle = parent.subpool();
        let last = parent.subpool();

        let first_ptr = first.inner_ptr();
        let last_ptr = last.inner_ptr();

        middle.destroy();

        // SAFETY: Handles keep all remaining records live. Creation pushes at the head, so the
        // list order is last, first.
        unsafe {
            let head = (*parent.inner_ptr()).sub_pools;
            assert!(ptr::eq(head, last_ptr));
            assert!((*head).sub_prev.is_null());
            assert!(ptr::eq((*head).sub_next, first_ptr));
            assert!(ptr::eq((*first_ptr).sub_prev, last_ptr));
            assert!((*first_ptr).sub_next.is_null());
        }

        drop(first);
        drop(last);
        parent.destroy();
    }

    #[test]
    fn destroying_subpool_restores_parent_accounting() {
        let _guard = serialize_global_state();

        let parent = Pool::new();
        let before = parent.bytes();

        let child = parent.subpool();
        _ = child.alloc_zeroed(100);
        child.destroy();

        assert_eq!(parent.bytes(), before);

        // SAFETY: The handle keeps the record live.
        unsafe {
            assert!((*parent.inner_ptr()).sub_pools.is_null());
        }

        parent.destroy();
    }

    #[test]
    fn destroy_returns_blocks_for_reuse() {
        let _guard = serialize_global_state();
        block::abandon_free_list_for_tests();

        let pool = Pool::new();
        _ = pool.alloc_zeroed(10);
        // Overflows the first block, so the pool owns at least two.
        _ = pool.alloc_zeroed(2 * BLOCK_MINFREE);

        let (malloc_before, freehit_before, free_before) = block::registry_snapshot();
        pool.destroy();

        let (_, _, free_after) = block::registry_snapshot();
        assert!(free_after >= free_before + (3 * BLOCK_MINFREE) as u64);

        // The next pool reuses a freed block instead of touching the heap.
        let replacement = Pool::new();
        let (malloc_after, freehit_after, _) = block::registry_snapshot();
        assert_eq!(malloc_after, malloc_before);
        assert_eq!(freehit_after, freehit_before + 1);

        replacement.destroy();
    }

    #[test]
    fn permanent_pool_is_created_once() {
        let _guard = serialize_global_state();

        let a = Pool::permanent();
        let b = Pool::permanent();

        assert!(ptr::eq(a.inner_ptr(), b.inner_ptr()));
    }
}
