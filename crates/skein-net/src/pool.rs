//! Versioned socket pool: a fixed-capacity array of slots, each published
//! through an atomic `sid` so any thread can validate a handle without a
//! lock, grounded on `skein-core::SlotAllocator` for the free-stack /
//! fresh-counter allocation shape and on `struct socket`/`struct
//! socket_pool` for the per-slot fields and the optimistic-lock `get()`
//! semantics.
//!
//! Only the reactor thread ever touches a slot's non-`sid` fields after
//! `alloc()` hands it off; concurrency across threads is mediated entirely
//! by `sid`'s acquire/release protocol (a thread validates a handle by
//! reading `sid`, then only ever acts on it by enqueuing a `Command` the
//! reactor re-validates itself).

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use skein_core::SlotAllocator;

use crate::sid::{SocketId, POOL_SIZE};

pub mod state {
    pub const POLLING: u32 = 1 << 0;
    pub const PENDING: u32 = 1 << 1; // connecting or listening, same bit as original
    pub const READING: u32 = 1 << 2;
    pub const WRITING: u32 = 1 << 3;
    pub const CLOSING: u32 = 1 << 4;
    pub const MUTECLOSE: u32 = 1 << 5;
    pub const ZOMBIE: u32 = 1 << 6;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    Reserved,
    TcpListen,
    UdpListen,
    TcpConnection,
    UdpConnection,
    PipeCtrl,
}

impl SocketKind {
    pub fn is_udp(self) -> bool {
        matches!(self, SocketKind::UdpListen | SocketKind::UdpConnection)
    }
}

pub(crate) struct WriteChunk {
    pub data: Vec<u8>,
    pub offset: usize,
    pub addr: Option<SocketAddr>,
}

pub struct SocketSlot {
    sid: AtomicU64,
    version: Cell<u32>,
    pub(crate) fd: Cell<RawFd>,
    pub(crate) kind: Cell<SocketKind>,
    pub(crate) state: AtomicU32,
    pub(crate) wlbytes: AtomicUsize,
    pub(crate) wlist: RefCell<VecDeque<WriteChunk>>,
}

// Only `sid` is touched from outside the reactor thread, and it is always
// accessed through the atomic; the Cell/RefCell fields are effectively
// single-writer state owned by whichever thread runs the reactor loop.
unsafe impl Sync for SocketSlot {}

impl SocketSlot {
    fn blank() -> Self {
        Self {
            sid: AtomicU64::new(SocketId::NONE.raw()),
            version: Cell::new(0),
            fd: Cell::new(-1),
            kind: Cell::new(SocketKind::Reserved),
            state: AtomicU32::new(0),
            wlbytes: AtomicUsize::new(0),
            wlist: RefCell::new(VecDeque::new()),
        }
    }

    #[inline]
    pub fn sid(&self) -> SocketId {
        SocketId(self.sid.load(Ordering::Acquire))
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd.get()
    }

    #[inline]
    pub fn kind(&self) -> SocketKind {
        self.kind.get()
    }

    #[inline]
    pub fn test_state(&self, bits: u32) -> bool {
        self.state.load(Ordering::Relaxed) & bits == bits
    }

    #[inline]
    pub fn set_state(&self, bits: u32) {
        self.state.fetch_or(bits, Ordering::Relaxed);
    }

    #[inline]
    pub fn clr_state(&self, bits: u32) {
        self.state.fetch_and(!bits, Ordering::Relaxed);
    }

    /// Set `bits` and report whether they were already all set beforehand.
    /// Used for the mute-close gate, where the set and the test of the
    /// previous value must be a single atomic step rather than a
    /// `test_state` followed by a separate `set_state`.
    #[inline]
    pub fn test_and_set_state(&self, bits: u32) -> bool {
        self.state.fetch_or(bits, Ordering::Relaxed) & bits == bits
    }

    #[inline]
    pub fn wlbytes(&self) -> usize {
        self.wlbytes.load(Ordering::Relaxed)
    }

    pub fn wlist_empty(&self) -> bool {
        self.wlist.borrow().is_empty()
    }

    fn reset(&self) {
        self.fd.set(-1);
        self.kind.set(SocketKind::Reserved);
        self.state.store(0, Ordering::Relaxed);
        self.wlbytes.store(0, Ordering::Relaxed);
        self.wlist.borrow_mut().clear();
    }
}

pub struct SocketPool {
    slots: Box<[SocketSlot]>,
    allocator: SlotAllocator,
}

impl SocketPool {
    pub fn new() -> Self {
        let slots = (0..POOL_SIZE)
            .map(|_| SocketSlot::blank())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            allocator: SlotAllocator::new(POOL_SIZE),
        }
    }

    /// Allocate a slot for a freshly created `fd`, publishing its new
    /// `sid`. Returns `None` if the pool is exhausted.
    pub fn alloc(&self, fd: RawFd, kind: SocketKind) -> Option<SocketId> {
        let index = self.allocator.allocate().ok()?;
        let slot = &self.slots[index as usize];
        slot.fd.set(fd);
        slot.kind.set(kind);
        let sid = SocketId::pack(slot.version.get(), index);
        slot.sid.store(sid.raw(), Ordering::Release);
        Some(sid)
    }

    /// Look up a slot by `sid`, validating the version. Safe to call
    /// concurrently with the reactor thread's own use of the slot.
    pub fn get(&self, sid: SocketId) -> Option<&SocketSlot> {
        let index = sid.index() as usize;
        let slot = self.slots.get(index)?;
        if slot.sid() == sid {
            Some(slot)
        } else {
            None
        }
    }

    /// Return a slot to the free list. Caller (the reactor thread) must
    /// have already emptied its write list and removed it from the
    /// poller.
    pub fn free(&self, sid: SocketId) {
        let index = sid.index();
        let slot = &self.slots[index as usize];
        debug_assert!(slot.wlist_empty());
        slot.version.set(slot.version.get().wrapping_add(1));
        slot.reset();
        slot.sid.store(SocketId::NONE.raw(), Ordering::Release);
        self.allocator.release(index);
    }

    pub fn allocated_count(&self) -> u32 {
        self.allocator.allocated_count()
    }

    /// Recover the live `sid` for a slot the caller knows by index alone,
    /// e.g. from an epoll event's opaque `data` word. Only meaningful to
    /// the reactor thread, which owns slot identity; returns `None` for an
    /// index that is currently unallocated.
    pub(crate) fn slot_sid_unchecked(&self, index: u32) -> Option<SocketId> {
        let slot = self.slots.get(index as usize)?;
        let sid = slot.sid();
        if sid.is_none() {
            None
        } else {
            Some(sid)
        }
    }
}

impl Default for SocketPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_and_get() {
        let pool = SocketPool::new();
        let sid = pool.alloc(3, SocketKind::TcpConnection).unwrap();
        let slot = pool.get(sid).unwrap();
        assert_eq!(slot.fd(), 3);
        assert_eq!(slot.kind(), SocketKind::TcpConnection);
    }

    #[test]
    fn test_free_bumps_version_invalidates_old_sid() {
        let pool = SocketPool::new();
        let sid = pool.alloc(3, SocketKind::TcpConnection).unwrap();
        pool.free(sid);
        assert!(pool.get(sid).is_none());

        let sid2 = pool.alloc(4, SocketKind::TcpConnection).unwrap();
        assert_eq!(sid2.index(), sid.index());
        assert_ne!(sid2.version(), sid.version());
    }

    #[test]
    fn test_pool_exhaustion() {
        let pool = SocketPool::new();
        for i in 0..POOL_SIZE {
            assert!(pool.alloc(i as RawFd, SocketKind::TcpConnection).is_some());
        }
        assert!(pool.alloc(999_999, SocketKind::TcpConnection).is_none());
    }

    #[test]
    fn test_state_bits() {
        let pool = SocketPool::new();
        let sid = pool.alloc(5, SocketKind::TcpConnection).unwrap();
        let slot = pool.get(sid).unwrap();
        assert!(!slot.test_state(state::READING));
        slot.set_state(state::READING | state::POLLING);
        assert!(slot.test_state(state::READING));
        slot.clr_state(state::READING);
        assert!(!slot.test_state(state::READING));
        assert!(slot.test_state(state::POLLING));
    }

    #[test]
    fn test_and_set_state_fires_once() {
        let pool = SocketPool::new();
        let sid = pool.alloc(5, SocketKind::TcpConnection).unwrap();
        let slot = pool.get(sid).unwrap();
        assert!(!slot.test_and_set_state(state::MUTECLOSE));
        assert!(slot.test_state(state::MUTECLOSE));
        assert!(slot.test_and_set_state(state::MUTECLOSE));
    }
}
