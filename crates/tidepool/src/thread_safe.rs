// Copyright (c) Tidepool Project Contributors.
// Licensed under the MIT License.

use std::ops::{Deref, DerefMut};

/// A promise that a value is safe to keep in process-wide state (`Send` and `Sync`) even though
/// its type says otherwise.
///
/// The allocator stores raw block and pool pointers in module-level registries. Those pointers
/// are not thread-safe as far as the compiler is concerned, but the registries themselves are
/// mutex-guarded and the crate's documented discipline is one allocator user per process, so the
/// promise holds in practice.
#[derive(Copy, Clone, derive_more::Debug)]
#[debug("{inner:?}")]
#[repr(transparent)]
pub(crate) struct ThreadSafe<T> {
    inner: T,
}

#[expect(
    clippy::non_send_fields_in_send_ty,
    reason = "this is an escape hatch used internally in this crate, the callers are responsible for ensuring that the inner type is correctly used"
)]
// SAFETY: Forwarding the guarantees received in new().
unsafe impl<T> Send for ThreadSafe<T> {}

// SAFETY: Forwarding the guarantees received in new().
unsafe impl<T> Sync for ThreadSafe<T> {}

impl<T> ThreadSafe<T> {
    /// # Safety
    ///
    /// The caller must ensure that the inner value truly is safe to send to and reference from
    /// other threads under the crate's usage discipline.
    pub(crate) const unsafe fn new(inner: T) -> Self {
        Self { inner }
    }
}

impl<T> Deref for ThreadSafe<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<T> DerefMut for ThreadSafe<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}
