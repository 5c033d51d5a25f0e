// Copyright (c) Tidepool Project Contributors.
// Licensed under the MIT License.

//! Hierarchical region allocator for long-running, single-threaded daemons.
//!
//! Instead of tracking every small object individually, allocations are grouped into [`Pool`]s
//! arranged in a parent/child tree. An entire pool - all of its memory, its child pools, and any
//! registered cleanup callbacks - is released in one constant-time operation. Pools are the
//! lifetime anchor for per-connection, per-request, and per-configuration state.
//!
//! The allocator is built from two layers:
//!
//! * A raw block layer that obtains fixed-grain memory blocks from the system heap and recycles
//!   them through a process-wide free list, so that steady-state operation performs no heap
//!   traffic at all.
//! * The pool arena: each pool suballocates bumpwise from a chain of blocks. Allocation is a
//!   pointer bump in the common case; clearing or destroying a pool returns its whole chain to
//!   the free list.
//!
//! On top of the arena sit a cleanup registry (per-pool LIFO destructor lists with a separate
//! non-flushing variant for post-fork contexts), pool-bound adapters for file descriptors and
//! buffered stdio streams, and a growable [`Array`] container.
//!
//! ```
//! use tidepool::Pool;
//!
//! let connection = Pool::permanent().subpool();
//! let greeting = connection.strdup("220 ready");
//! assert_eq!(greeting, "220 ready");
//!
//! // One call tears down every allocation, sub-pool and cleanup owned by the pool.
//! connection.destroy();
//! ```
//!
//! # Thread safety
//!
//! The crate targets daemons that are single-threaded per process. [`Pool`] handles are neither
//! [`Send`] nor [`Sync`]; the process-wide block registry is mutex-guarded so that its own
//! bookkeeping can never be corrupted, but no attempt is made to support concurrent allocation.
//! The only asynchronous interleaving the allocator defends against is signal delivery: every
//! mutation of the pool tree or the free list runs with `SIGALRM` masked (see [`block_alarms`]).

mod alarms;
mod array;
mod block;
mod cleanup;
mod diagnostics;
mod error;
mod pool;
mod strings;
mod thread_safe;

#[cfg(unix)]
mod files;

pub(crate) use thread_safe::ThreadSafe;

pub use alarms::{block_alarms, unblock_alarms};
pub use array::Array;
pub use cleanup::{CleanupFn, cleanup_for_exec};
pub use diagnostics::{AllocatorStats, stats, walk_pools};
pub use error::{Error, Result};
pub use pool::Pool;

#[cfg(test)]
mod testing;
