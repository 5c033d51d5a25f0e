// Copyright (c) Tidepool Project Contributors.
// Licensed under the MIT License.

//! Counted bracketing of the timer signal.
//!
//! The hosting daemon drives timeouts from `SIGALRM`, and its signal handlers are allowed to
//! call back into the allocator. Any mutation of the pool tree or the process-wide free list
//! therefore runs inside a bracket during which the signal is masked; the bump-pointer fast path
//! needs no bracket because it touches only pool-local state in a single resumable step.
//!
//! Brackets are counted, so nesting balances: only the outermost [`block_alarms`] masks and only
//! the matching [`unblock_alarms`] unmasks. This is signal-reentrancy protection, not thread
//! synchronization.

use std::cell::Cell;

thread_local! {
    static BLOCK_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Enters an alarm-blocked section. Counted: nested calls are cheap and only the first one
/// touches the signal mask.
///
/// # Panics
///
/// Panics on bracket-depth overflow, which indicates a runaway recursion in the caller.
pub fn block_alarms() {
    BLOCK_DEPTH.with(|depth| {
        let current = depth.get();
        if current == 0 {
            mask_alarm_signal(true);
        }
        depth.set(
            current
                .checked_add(1)
                .expect("alarm bracket depth overflow"),
        );
    });
}

/// Leaves an alarm-blocked section, unmasking the signal when the outermost bracket closes.
///
/// # Panics
///
/// Panics when called without a matching [`block_alarms`].
pub fn unblock_alarms() {
    BLOCK_DEPTH.with(|depth| {
        let current = depth
            .get()
            .checked_sub(1)
            .expect("unblock_alarms without a matching block_alarms");
        depth.set(current);
        if current == 0 {
            mask_alarm_signal(false);
        }
    });
}

// Whether the mask truly toggled is invisible to in-process tests.
#[cfg_attr(test, mutants::skip)]
#[cfg(unix)]
fn mask_alarm_signal(block: bool) {
    let how = if block { libc::SIG_BLOCK } else { libc::SIG_UNBLOCK };

    // SAFETY: The signal set is a locally owned, properly initialized value, and sigprocmask
    // with a null old-set out-pointer has no other preconditions.
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        _ = libc::sigemptyset(&mut set);
        _ = libc::sigaddset(&mut set, libc::SIGALRM);
        _ = libc::sigprocmask(how, &set, std::ptr::null_mut());
    }
}

#[cfg(not(unix))]
fn mask_alarm_signal(_block: bool) {
    // No timer signal to defend against; the bracket still counts for API symmetry.
}

/// RAII form of the bracket used throughout the crate: blocked on construction, unblocked on
/// drop, panic-safe.
#[derive(Debug)]
pub(crate) struct AlarmGuard(());

impl AlarmGuard {
    pub(crate) fn new() -> Self {
        block_alarms();
        Self(())
    }
}

impl Drop for AlarmGuard {
    fn drop(&mut self) {
        unblock_alarms();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn depth() -> u32 {
        BLOCK_DEPTH.with(Cell::get)
    }

    #[test]
    fn brackets_nest_and_balance() {
        assert_eq!(depth(), 0);

        block_alarms();
        block_alarms();
        assert_eq!(depth(), 2);

        unblock_alarms();
        assert_eq!(depth(), 1);

        unblock_alarms();
        assert_eq!(depth(), 0);
    }

    #[test]
    fn guard_restores_depth_on_drop() {
        {
            let _outer = AlarmGuard::new();
            let _inner = AlarmGuard::new();
            assert_eq!(depth(), 2);
        }
        assert_eq!(depth(), 0);
    }

    #[test]
    #[should_panic(expected = "without a matching block_alarms")]
    fn unbalanced_unblock_panics() {
        unblock_alarms();
    }
}
