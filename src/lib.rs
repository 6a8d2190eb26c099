//! Three cooperating allocators over mapped virtual memory.
//!
//! Every region comes straight from the page mapper; the system allocator
//! is never on the hot path. Built for workloads that burn through
//! short-lived objects from many threads and want predictable latency and
//! bulk reclamation:
//!
//! - [`Arena`]: a monotone bump allocator over one region. Lock-free
//!   concurrent allocation, reclamation only by whole-arena reset.
//! - [`Pool`]: a fixed-size block pool with an intrusive free list behind
//!   a mutex, with batched alloc/free for amortized lock traffic.
//! - [`Slab`]: a size-classed front end over ten pools. The four smallest
//!   classes are served from per-thread caches with epoch-based
//!   invalidation, so a reset never has to walk threads.
//!
//! Allocation failure is a null pointer, never an error; only construction
//! (a refused page mapping) and teardown (a failed unmap) produce an
//! [`AllocError`].
//!
//! ```
//! use stratum::Slab;
//!
//! let slab = Slab::new()?;
//! let ptr = slab.alloc(24); // served from the 32-byte class
//! assert!(!ptr.is_null());
//! unsafe { slab.free(ptr, 24) };
//! # Ok::<(), stratum::AllocError>(())
//! ```

mod arena;
mod error;
mod os;
mod pool;
mod slab;

pub use arena::Arena;
pub use error::AllocError;
pub use pool::Pool;
pub use slab::Slab;
