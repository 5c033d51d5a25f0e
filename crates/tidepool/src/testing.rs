// Copyright (c) Tidepool Project Contributors.
// Licensed under the MIT License.

//! Helpers shared by the crate's tests.

use parking_lot::{Mutex, MutexGuard};

static GLOBAL_STATE: Mutex<()> = Mutex::new(());

/// Serializes tests that observe or reshape process-wide allocator state (the free list, the
/// counters, the permanent tree). The registries themselves are lock-protected, but assertions
/// about their contents only hold when no other test is generating block traffic.
pub(crate) fn serialize_global_state() -> MutexGuard<'static, ()> {
    GLOBAL_STATE.lock()
}
