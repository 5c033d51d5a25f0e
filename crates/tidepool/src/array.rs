// Copyright (c) Tidepool Project Contributors.
// Licensed under the MIT License.

use std::ptr;
use std::slice;

use crate::Pool;
use crate::block::CLICK;
use crate::pool::palloc_raw;

/// A growable vector whose element storage lives in a pool.
///
/// Growth allocates a doubled buffer from the pool and abandons the old one *in* the pool - the
/// arena has no per-allocation free, so the dead buffer is reclaimed only when the pool is
/// cleared or destroyed. That trade is deliberate: arrays are cheap to grow and their storage
/// never outlives the request or connection they were built for.
///
/// Elements are restricted to plain-old-data (`Copy`), which is what makes the wholesale buffer
/// copies on growth sound.
#[derive(derive_more::Debug)]
#[debug("Array(len = {nelts}, capacity = {nalloc})")]
pub struct Array<'p, T: Copy> {
    pool: &'p Pool<'p>,
    elts: *mut T,
    nelts: usize,
    nalloc: usize,
}

impl<'p, T: Copy> Array<'p, T> {
    /// Creates an array with zeroed storage for `capacity` elements (at least one) in `pool`.
    #[must_use]
    pub fn new(pool: &'p Pool<'p>, capacity: usize) -> Self {
        const {
            assert!(size_of::<T>() != 0, "zero-sized elements have no storage to manage");
            assert!(
                align_of::<T>() <= CLICK,
                "element alignment exceeds what pool memory guarantees"
            );
        }

        let capacity = capacity.max(1);

        Self {
            pool,
            elts: alloc_elts(pool, capacity),
            nelts: 0,
            nalloc: capacity,
        }
    }

    /// Number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nelts
    }

    /// True when the array holds no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nelts == 0
    }

    /// Current element capacity. Growing past it moves the storage, so an element reference
    /// obtained before a push must not be assumed to point into the live buffer afterwards -
    /// which is why [`push`][Self::push] takes `&mut self` and element views borrow the array.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.nalloc
    }

    /// The elements, in insertion order.
    #[must_use]
    pub fn as_slice(&self) -> &[T] {
        // SAFETY: The first `nelts` slots are always initialized, and `&self` prevents any
        // growth from moving the buffer while the slice is live.
        unsafe { slice::from_raw_parts(self.elts, self.nelts) }
    }

    /// Appends `value`, growing (doubling) the storage if the array is full. Returns a reference
    /// to the stored element.
    ///
    /// # Panics
    ///
    /// Panics if the doubled capacity would overflow `usize`.
    pub fn push(&mut self, value: T) -> &mut T {
        if self.nelts == self.nalloc {
            let doubled = self
                .nalloc
                .checked_mul(2)
                .expect("array capacity cannot overflow usize")
                .max(1);
            self.grow(doubled);
        }

        // SAFETY: The slot is within capacity and the write initializes it before the reference
        // exists.
        unsafe {
            let slot = self.elts.add(self.nelts);
            slot.write(value);
            self.nelts += 1;
            &mut *slot
        }
    }

    /// Appends every element of `src`, doubling the capacity until the combined length fits.
    ///
    /// # Panics
    ///
    /// Panics if the combined length or the doubled capacity would overflow `usize`.
    pub fn cat(&mut self, src: &Array<'_, T>) {
        let needed = self
            .nelts
            .checked_add(src.nelts)
            .expect("combined array length cannot overflow usize");

        if needed > self.nalloc {
            let mut new_size = self
                .nalloc
                .checked_mul(2)
                .expect("array capacity cannot overflow usize")
                .max(1);
            while new_size < needed {
                new_size = new_size
                    .checked_mul(2)
                    .expect("array capacity cannot overflow usize");
            }
            self.grow(new_size);
        }

        // SAFETY: Capacity suffices after the growth check. When the two arrays share storage
        // the source prefix [0, src.nelts) and the destination tail starting at self.nelts
        // cannot overlap, because a sharing array never has fewer elements than its shadow.
        unsafe {
            ptr::copy_nonoverlapping(src.elts, self.elts.add(self.nelts), src.nelts);
        }
        self.nelts = needed;
    }

    /// Deep copy into `pool`, preserving capacity.
    #[must_use]
    pub fn copy_to<'q>(&self, pool: &'q Pool<'q>) -> Array<'q, T> {
        let mut result = Array::new(pool, self.nalloc);

        // SAFETY: The fresh buffer holds at least `nalloc >= nelts` elements and is disjoint
        // from the source.
        unsafe {
            ptr::copy_nonoverlapping(self.elts, result.elts, self.nelts);
        }
        result.nelts = self.nelts;

        result
    }

    /// Copies only the bookkeeping into `pool`, sharing the element storage with `self`. The
    /// copy's capacity equals its length, so its first growth copies the elements out - reads
    /// are shared, writes are copy-on-grow.
    ///
    /// The copy keeps `self` borrowed for its own lifetime, which is what makes the sharing
    /// sound: the storage cannot be released or mutated in place underneath it.
    #[must_use]
    pub fn share_to<'q>(&'q self, pool: &'q Pool<'q>) -> Array<'q, T> {
        Array {
            pool,
            elts: self.elts,
            nelts: self.nelts,
            nalloc: self.nelts,
        }
    }

    /// Concatenation of `first` and `second` built in `pool`: shares `first`'s storage and
    /// copies `second` (which forces the copy-out unless `second` is empty).
    #[must_use]
    pub fn append(pool: &'p Pool<'p>, first: &'p Array<'p, T>, second: &Array<'_, T>) -> Self {
        let mut result = first.share_to(pool);
        result.cat(second);
        result
    }

    /// Replaces the storage with a zeroed `new_size`-element buffer, copying the live elements.
    /// The old buffer stays behind in the pool.
    fn grow(&mut self, new_size: usize) {
        let new_elts = alloc_elts(self.pool, new_size);

        // SAFETY: Both buffers hold at least `nelts` elements and the fresh one is disjoint
        // from the old.
        unsafe {
            ptr::copy_nonoverlapping(self.elts, new_elts, self.nelts);
        }

        self.elts = new_elts;
        self.nalloc = new_size;
    }
}

impl<'p> Array<'p, &'p str> {
    /// Deep copy for string arrays: every element is duplicated into `pool` as well.
    #[must_use]
    pub fn copy_str_to<'q>(&self, pool: &'q Pool<'q>) -> Array<'q, &'q str> {
        let mut result = Array::new(pool, self.nalloc);
        for s in self.as_slice() {
            _ = result.push(pool.strdup(s));
        }
        result
    }
}

/// Zeroed element storage for `count` elements from `pool`.
fn alloc_elts<T: Copy>(pool: &Pool<'_>, count: usize) -> *mut T {
    let bytes = count
        .checked_mul(size_of::<T>())
        .expect("array storage size cannot overflow usize");

    // SAFETY: `bytes` is nonzero (count >= 1, T is not zero-sized) and the fresh region is
    // exclusively ours until the caller hands it to an Array.
    unsafe {
        let data = palloc_raw(pool.inner_ptr(), bytes);
        data.write_bytes(0, bytes);
        data.cast::<T>()
    }
}
