// Copyright (c) Tidepool Project Contributors.
// Licensed under the MIT License.

use std::ffi::c_void;
use std::ptr;

use crate::Pool;
use crate::alarms::AlarmGuard;
use crate::pool::{self, PoolInner, palloc_raw};

/// A destructor registered against a pool: a plain function pointer taking the opaque data word
/// it was registered with. Callbacks must not panic and have no way to report failure.
pub type CleanupFn = fn(*mut c_void);

/// One registry entry. Records live in the owning pool's arena memory and are reclaimed with the
/// pool, never freed individually.
#[repr(C)]
pub(crate) struct CleanupRec {
    data: *mut c_void,
    plain: CleanupFn,
    child: CleanupFn,
    next: *mut CleanupRec,
}

impl Pool<'_> {
    /// Registers a pair of destructors to run when this pool is cleared or destroyed.
    ///
    /// `plain` runs on clear/destroy; `child` runs instead during [`cleanup_for_exec`], the
    /// post-fork walk where inherited resources must be released without side effects such as
    /// flushing buffered output. Registrations run in LIFO order.
    pub fn register_cleanup(&self, data: *mut c_void, plain: CleanupFn, child: CleanupFn) {
        let p = self.inner_ptr();

        // SAFETY: The handle keeps the record live; the entry's storage comes from the pool
        // itself, so it lives exactly as long as the list that points at it.
        unsafe {
            let rec = palloc_raw(p, size_of::<CleanupRec>()).cast::<CleanupRec>();
            rec.write(CleanupRec {
                data,
                plain,
                child,
                next: (*p).cleanups,
            });
            (*p).cleanups = rec;
        }
    }

    /// Removes the first registration matching `(data, plain)` without running it. Silently does
    /// nothing when no registration matches.
    ///
    /// The child callback does not participate in matching: two registrations that differ only
    /// in their child callback are indistinguishable here.
    pub fn unregister_cleanup(&self, data: *mut c_void, plain: CleanupFn) {
        let p = self.inner_ptr();

        // SAFETY: The handle keeps the record live and every record on the list lives in the
        // pool's arena; splicing rewrites only list pointers owned by this pool.
        unsafe {
            let mut lastp: *mut *mut CleanupRec = &raw mut (*p).cleanups;
            let mut rec = (*p).cleanups;

            while !rec.is_null() {
                if ptr::eq((*rec).data, data) && ptr::fn_addr_eq((*rec).plain, plain) {
                    *lastp = (*rec).next;
                    break;
                }

                lastp = &raw mut (*rec).next;
                rec = (*rec).next;
            }
        }
    }
}

/// Invokes the plain callback of every record, head to tail.
///
/// # Safety
///
/// Every record reachable from `rec` must be live.
pub(crate) unsafe fn run_plain(mut rec: *mut CleanupRec) {
    while !rec.is_null() {
        // SAFETY: Caller guarantees a live list.
        unsafe {
            ((*rec).plain)((*rec).data);
            rec = (*rec).next;
        }
    }
}

/// Runs the child variant of every cleanup in the permanent tree, root to leaves, and empties
/// each pool's registry.
///
/// This is for the window between `fork` and `exec`-or-exit in a daemon's child process: the
/// child inherits descriptors that must be closed, but flushing destructors (the plain variant)
/// would emit buffered output a second time. Does nothing when the permanent pool was never
/// created.
pub fn cleanup_for_exec() {
    let Some(root) = pool::permanent_inner() else {
        return;
    };

    let _alarms = AlarmGuard::new();

    // SAFETY: The permanent tree is live for the life of the process and we only detach cleanup
    // lists, never pool storage.
    unsafe { run_child_in_tree(root) }
}

/// # Safety
///
/// `p` must point to a live pool record.
unsafe fn run_child_in_tree(p: *mut PoolInner) {
    // SAFETY: Caller guarantees a live record; children are live because only clear/destroy
    // detach them and neither runs concurrently with this walk.
    unsafe {
        let mut rec = (*p).cleanups;
        while !rec.is_null() {
            ((*rec).child)((*rec).data);
            rec = (*rec).next;
        }
        (*p).cleanups = ptr::null_mut();

        let mut sub = (*p).sub_pools;
        while !sub.is_null() {
            run_child_in_tree(sub);
            sub = (*sub).sub_next;
        }
    }
}
