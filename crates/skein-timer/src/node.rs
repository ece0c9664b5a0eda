//! Paged arena allocator for timer wheel nodes.
//!
//! Nodes are never individually freed back to the allocator; instead the
//! wheel recycles cookie slots through a free list once a node has fired
//! or been cancelled, the same shape as the socket pool's slot allocator
//! but specialized to the wheel's own node layout and page-growth policy
//! (new pages double the pool's capacity, matching the arena's own
//! historical growth curve rather than a fixed upper bound).

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::cell::Cell;

use skein_core::SpinLock;

/// Lifecycle state of a wheel node. Mutated both by the owning timer
/// thread (Adding -> Ticking -> Freed) and, for cancellation, by whatever
/// thread calls `cancel` (which only ever reads state, never writes it —
/// the actual unlink happens on the timer thread via a command).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Adding = 0,
    Ticking = 1,
    Cancelled = 2,
    Freed = 3,
}

impl NodeState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => NodeState::Adding,
            1 => NodeState::Ticking,
            2 => NodeState::Cancelled,
            _ => NodeState::Freed,
        }
    }
}

/// Where a node is currently linked: head of a root slot, head of a
/// cascade slot, or nowhere (used as the initial/free state).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadRef {
    None,
    Root(u16),
    Level(u8, u8),
}

/// A single timer wheel entry.
///
/// `version`/`state` are atomic because `cancel()` reads them from
/// arbitrary caller threads without synchronizing with the timer thread;
/// `expire`/`next`/`prev`/`home` are touched only by the timer thread
/// itself (list linkage is single-writer) so plain `Cell`s suffice.
pub struct Node {
    pub version: AtomicU32,
    pub state: AtomicU8,
    pub cookie: u32,
    pub expire: Cell<u32>,
    pub next: Cell<Option<u32>>,
    pub prev: Cell<Option<u32>>,
    pub home: Cell<HeadRef>,
}

impl Node {
    fn blank(cookie: u32) -> Self {
        Self {
            version: AtomicU32::new(0),
            state: AtomicU8::new(NodeState::Freed as u8),
            cookie,
            expire: Cell::new(0),
            next: Cell::new(None),
            prev: Cell::new(None),
            home: Cell::new(HeadRef::None),
        }
    }

    #[inline]
    pub fn state(&self) -> NodeState {
        NodeState::from_u8(self.state.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn set_state(&self, s: NodeState) {
        self.state.store(s as u8, Ordering::Relaxed);
    }

    #[inline]
    pub fn version(&self) -> u32 {
        self.version.load(Ordering::Relaxed)
    }

    /// Pack (version, cookie) into the session handed back to callers.
    #[inline]
    pub fn session(&self) -> u64 {
        (self.version() as u64) << 32 | self.cookie as u64
    }
}

/// Page size chosen so each page occupies roughly 4KiB, matching the
/// arena's historical page-sizing rule.
pub const PAGE_SIZE: usize = 4096 / core::mem::size_of::<Node>();

struct Page {
    nodes: Box<[Node]>,
}

struct PoolInner {
    pages: Vec<Page>,
    /// Free cookie stack, LIFO.
    free: Vec<u32>,
    /// Cookie of the next never-allocated node.
    next_fresh: u32,
}

/// Paged, growable arena of wheel nodes with a spinlock-guarded free list.
///
/// Allocation (`new_node`) may be called from any thread (it's invoked by
/// `timer_after`, itself callable from any thread that schedules a
/// timeout); release (`free_batch`) is only ever called by the owning
/// timer thread once per tick, batched.
pub struct NodePool {
    inner: SpinLock<PoolInner>,
}

impl NodePool {
    pub fn new() -> Self {
        let pool = Self {
            inner: SpinLock::new(PoolInner {
                pages: Vec::new(),
                free: Vec::new(),
                next_fresh: 0,
            }),
        };
        pool.grow_shared();
        pool
    }

    /// Borrow the node for a given cookie. Panics if the cookie was never
    /// allocated by this pool (a logic error, not a runtime condition).
    pub fn node(&self, cookie: u32) -> &Node {
        let page_id = (cookie as usize) / PAGE_SIZE;
        let offset = (cookie as usize) % PAGE_SIZE;
        let inner = self.inner.lock();
        // Safety: pages are never removed or reallocated once pushed, and
        // `Node` itself is interior-mutable, so handing out a reference
        // that outlives the lock guard is sound.
        let node_ptr: *const Node = &inner.pages[page_id].nodes[offset];
        unsafe { &*node_ptr }
    }

    /// Allocate a fresh node, in the `Freed` state, ready for the caller
    /// to transition to `Adding`.
    pub fn allocate(&self) -> &Node {
        loop {
            let cookie = {
                let mut inner = self.inner.lock();
                if let Some(c) = inner.free.pop() {
                    Some(c)
                } else if inner.next_fresh < (inner.pages.len() * PAGE_SIZE) as u32 {
                    let c = inner.next_fresh;
                    inner.next_fresh += 1;
                    Some(c)
                } else {
                    None
                }
            };

            match cookie {
                Some(c) => {
                    let n = self.node(c);
                    debug_assert_eq!(n.state(), NodeState::Freed);
                    return n;
                }
                None => {
                    // Pages are append-only and guarded by the same
                    // spinlock as the free list, so growth is safe to
                    // call from any allocating thread.
                    self.grow_shared();
                }
            }
        }
    }

    fn grow_shared(&self) {
        let mut inner = self.inner.lock();
        let page_id = inner.pages.len() as u32;
        let nodes: Vec<Node> = (0..PAGE_SIZE as u32)
            .map(|i| Node::blank(page_id * PAGE_SIZE as u32 + i))
            .collect();
        inner.pages.push(Page {
            nodes: nodes.into_boxed_slice(),
        });
    }

    /// Release a batch of cookies back to the free list. Bumps each
    /// node's version (invalidating any session holders) and marks it
    /// `Freed`. Only the owning timer thread calls this.
    pub fn free_batch(&self, cookies: &[u32]) {
        if cookies.is_empty() {
            return;
        }
        for &c in cookies {
            let n = self.node(c);
            n.version.fetch_add(1, Ordering::Relaxed);
            n.set_state(NodeState::Freed);
        }
        let mut inner = self.inner.lock();
        inner.free.extend_from_slice(cookies);
    }
}

impl Default for NodePool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_and_session() {
        let pool = NodePool::new();
        let n = pool.allocate();
        n.set_state(NodeState::Adding);
        n.expire.set(100);
        let session = n.session();
        assert_eq!(session & 0xFFFF_FFFF, n.cookie as u64);
    }

    #[test]
    fn test_free_batch_bumps_version() {
        let pool = NodePool::new();
        let n = pool.allocate();
        let cookie = n.cookie;
        let v0 = n.version();
        pool.free_batch(&[cookie]);
        let n2 = pool.node(cookie);
        assert_eq!(n2.version(), v0 + 1);
        assert_eq!(n2.state(), NodeState::Freed);
    }

    #[test]
    fn test_grows_across_pages() {
        let pool = NodePool::new();
        let mut cookies = Vec::new();
        for _ in 0..(PAGE_SIZE * 3) {
            let n = pool.allocate();
            n.set_state(NodeState::Ticking);
            cookies.push(n.cookie);
        }
        cookies.sort();
        cookies.dedup();
        assert_eq!(cookies.len(), PAGE_SIZE * 3);
    }

    #[test]
    fn test_reuse_after_free() {
        let pool = NodePool::new();
        let n1 = pool.allocate();
        let c1 = n1.cookie;
        pool.free_batch(&[c1]);
        let n2 = pool.allocate();
        assert_eq!(n2.cookie, c1);
    }
}
