//! # skein-core
//!
//! Shared primitives used across this runtime's subsystems: the slot
//! allocator behind the versioned socket pool and timer node pool, the
//! double-buffered command queue (`FlipBuf`) used by every cross-thread
//! command surface, a short-critical-section spinlock, environment
//! variable parsing, and the kernel-style print/log macros.
//!
//! None of this is scheduler or green-thread machinery — every type
//! here is plain data shared by OS threads that talk to each other
//! through command queues rather than shared mutable state.

pub mod env;
pub mod flipbuf;
#[macro_use]
pub mod kprint;
pub mod slot;
pub mod spinlock;

pub use flipbuf::FlipBuf;
pub use slot::{SlotAllocator, SlotError, SlotResult};
pub use spinlock::{SpinLock, SpinLockGuard};
