//! Hierarchical timer wheel: a root ring plus four cascading rings.
//!
//! Ported from the single-threaded wheel algorithm this runtime's timer
//! subsystem has always used: one root ring of 256 slots stepped every
//! tick, and four cascade rings of 64 slots each that re-sort their
//! contents down into the root (or a finer cascade ring) as the root
//! wraps around. Only the owning timer thread walks or mutates the
//! ring contents; every other thread only ever appends a command to
//! `cmdbuf`, which the owner drains once per `update()` call.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use skein_core::{klog_error, klog_warn, FlipBuf};

use crate::node::{HeadRef, NodeState, NodePool};
use crate::session::TimerSession;

pub const SR_BITS: u32 = 8;
pub const SL_BITS: u32 = 6;
pub const SR_SIZE: usize = 1 << SR_BITS;
pub const SL_SIZE: usize = 1 << SL_BITS;
const SR_MASK: u32 = (SR_SIZE as u32) - 1;
const SL_MASK: u32 = (SL_SIZE as u32) - 1;
const LEVELS: usize = 4;

/// Point-in-time counters, safe to sample from any thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimerStat {
    pub scheduled: u64,
    pub pending: u64,
    pub fired: u64,
    pub cancelled: u64,
}

struct Counters {
    scheduled: AtomicU64,
    pending: AtomicU64,
    fired: AtomicU64,
    cancelled: AtomicU64,
}

impl Counters {
    fn new() -> Self {
        Self {
            scheduled: AtomicU64::new(0),
            pending: AtomicU64::new(0),
            fired: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
        }
    }

    fn snapshot(&self) -> TimerStat {
        TimerStat {
            scheduled: self.scheduled.load(Ordering::Relaxed),
            pending: self.pending.load(Ordering::Relaxed),
            fired: self.fired.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
        }
    }
}

enum Command {
    After(u32),
    Cancel(u32, u32),
    Exit,
}

/// Tuning knobs for the wheel; defaults match this runtime's historical
/// millisecond resolution.
#[derive(Debug, Clone, Copy)]
pub struct WheelConfig {
    /// Duration of one tick, in milliseconds.
    pub resolution_ms: u32,
    /// Log a warning if a single `update()` call discovers more than
    /// this many milliseconds of elapsed wall-clock time (a stalled
    /// process catching up on a big backlog of ticks).
    pub delay_warning_ms: u64,
}

impl Default for WheelConfig {
    fn default() -> Self {
        Self {
            resolution_ms: 10,
            delay_warning_ms: 1000,
        }
    }
}

fn monotonic_ms() -> u64 {
    use std::sync::OnceLock;
    use std::time::Instant;
    static START: OnceLock<Instant> = OnceLock::new();
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_millis() as u64
}

fn wall_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// The wheel itself. Timer expiry invokes `on_expire` with the session
/// of whatever just fired; the callback runs on the timer thread, so it
/// must not block (the usual choice is to push a message onto a
/// dispatch queue and return immediately).
pub struct TimerWheel {
    pool: NodePool,
    config: WheelConfig,

    startwall: u64,
    jiffies: AtomicU32,
    ticktime: AtomicU64,
    monotonic: AtomicU64,

    root: Vec<std::cell::Cell<Option<u32>>>,
    levels: [Vec<std::cell::Cell<Option<u32>>>; LEVELS],

    counters: Counters,
    cmdbuf: FlipBuf<Command>,

    on_expire: Box<dyn Fn(TimerSession) + Send + Sync>,
}

// Safety: `root`/`levels` cells are only ever touched by the single
// owning timer thread inside `update()`; every other thread interacts
// exclusively through `cmdbuf` and the atomic counters/clocks.
unsafe impl Sync for TimerWheel {}

impl TimerWheel {
    pub fn new(config: WheelConfig, on_expire: impl Fn(TimerSession) + Send + Sync + 'static) -> Self {
        let now = monotonic_ms();
        let resolution = config.resolution_ms as u64;
        let jiffies = (now / resolution) as u32;

        Self {
            pool: NodePool::new(),
            config,
            startwall: wall_ms(),
            jiffies: AtomicU32::new(jiffies),
            ticktime: AtomicU64::new(jiffies as u64 * resolution),
            monotonic: AtomicU64::new(0),
            root: (0..SR_SIZE).map(|_| std::cell::Cell::new(None)).collect(),
            levels: std::array::from_fn(|_| {
                (0..SL_SIZE).map(|_| std::cell::Cell::new(None)).collect()
            }),
            counters: Counters::new(),
            cmdbuf: FlipBuf::new(),
            on_expire: Box::new(on_expire),
        }
    }

    /// Current wall-clock time in milliseconds (startup wall time plus
    /// elapsed monotonic ticks).
    pub fn now(&self) -> u64 {
        self.startwall + self.monotonic.load(Ordering::Relaxed)
    }

    /// Monotonic time in milliseconds since the wheel was created.
    pub fn monotonic(&self) -> u64 {
        self.monotonic.load(Ordering::Relaxed)
    }

    pub fn stat(&self) -> TimerStat {
        self.counters.snapshot()
    }

    /// Schedule a one-shot timeout `timeout_ms` from now. Callable from
    /// any thread.
    pub fn after(&self, timeout_ms: u32) -> TimerSession {
        self.counters.scheduled.fetch_add(1, Ordering::Relaxed);
        self.counters.pending.fetch_add(1, Ordering::Relaxed);

        let n = self.pool.allocate();
        debug_assert_eq!(n.state(), NodeState::Freed);
        n.set_state(NodeState::Adding);

        let resolution = self.config.resolution_ms as u64;
        let deadline = self.ticktime.load(Ordering::Relaxed) + timeout_ms as u64 + resolution - 1;
        n.expire.set((deadline / resolution) as u32);

        let session = TimerSession::pack(n.version(), n.cookie);
        self.cmdbuf.write(Command::After(n.cookie));
        session
    }

    /// Request cancellation of a previously scheduled session. Callable
    /// from any thread; the actual unlink happens on the next `update()`.
    /// Returns `false` if the session is already stale (fired or
    /// cancelled elsewhere).
    pub fn cancel(&self, session: TimerSession) -> bool {
        let n = self.pool.node(session.cookie());
        let nver = n.version.load(Ordering::Acquire);
        if nver != session.version() {
            klog_warn!("cancel session invalid: version={} cookie={}", session.version(), session.cookie());
            return false;
        }
        self.cmdbuf.write(Command::Cancel(session.cookie(), session.version()));
        true
    }

    /// Request that the owning thread stop after processing the current
    /// batch of commands.
    pub fn request_exit(&self) {
        self.cmdbuf.write(Command::Exit);
    }

    fn link(&self, home: HeadRef, cookie: u32) {
        let head_cell = self.head_cell(home);
        let n = self.pool.node(cookie);
        let old_head = head_cell.get();
        n.next.set(old_head);
        n.prev.set(None);
        n.home.set(home);
        if let Some(old) = old_head {
            self.pool.node(old).prev.set(Some(cookie));
        }
        head_cell.set(Some(cookie));
    }

    fn unlink(&self, cookie: u32) {
        let n = self.pool.node(cookie);
        let prev = n.prev.get();
        let next = n.next.get();
        match prev {
            Some(p) => self.pool.node(p).next.set(next),
            None => self.head_cell(n.home.get()).set(next),
        }
        if let Some(nx) = next {
            self.pool.node(nx).prev.set(prev);
        }
        n.prev.set(None);
        n.next.set(None);
        n.home.set(HeadRef::None);
    }

    fn head_cell(&self, home: HeadRef) -> &std::cell::Cell<Option<u32>> {
        match home {
            HeadRef::Root(i) => &self.root[i as usize],
            HeadRef::Level(l, i) => &self.levels[l as usize][i as usize],
            HeadRef::None => unreachable!("node has no home slot"),
        }
    }

    fn add_node(&self, cookie: u32) {
        let jiffies = self.jiffies.load(Ordering::Relaxed);
        let expire = self.pool.node(cookie).expire.get();
        let idx = expire.wrapping_sub(jiffies) as i32;

        if idx < 0 {
            let i = (jiffies & SR_MASK) as u16;
            self.link(HeadRef::Root(i), cookie);
            return;
        }
        if (idx as u32) < SR_SIZE as u32 {
            let i = (expire & SR_MASK) as u16;
            self.link(HeadRef::Root(i), cookie);
            return;
        }

        for level in 0..3u32 {
            if (idx as u32) < 1u32 << ((level + 1) * SL_BITS + SR_BITS) {
                let slot = ((expire >> (level * SL_BITS + SR_BITS)) & SL_MASK) as u8;
                self.link(HeadRef::Level(level as u8, slot), cookie);
                return;
            }
        }
        let level = 3u32;
        let slot = ((expire >> (level * SL_BITS + SR_BITS)) & SL_MASK) as u8;
        self.link(HeadRef::Level(level as u8, slot), cookie);
    }

    /// Drain one root slot's worth of expired nodes, firing callbacks
    /// and collecting their cookies for batch release.
    fn expire_root_slot(&self, freed: &mut Vec<u32>) {
        let jiffies = self.jiffies.load(Ordering::Relaxed);
        let idx = (jiffies & SR_MASK) as usize;

        let mut cookie = self.root[idx].get();
        self.root[idx].set(None);

        while let Some(c) = cookie {
            let n = self.pool.node(c);
            let next = n.next.get();

            self.counters.pending.fetch_sub(1, Ordering::Relaxed);
            self.counters.fired.fetch_add(1, Ordering::Relaxed);
            let session = TimerSession::pack(n.version(), c);
            (self.on_expire)(session);
            freed.push(c);

            cookie = next;
        }
    }

    fn cascade(&self, level: usize) -> u8 {
        let jiffies = self.jiffies.load(Ordering::Relaxed);
        let idx = ((jiffies >> (level as u32 * SL_BITS + SR_BITS)) & SL_MASK) as u8;

        let mut cookie = self.levels[level][idx as usize].get();
        self.levels[level][idx as usize].set(None);

        while let Some(c) = cookie {
            let n = self.pool.node(c);
            let next = n.next.get();
            n.prev.set(None);
            n.next.set(None);
            n.home.set(HeadRef::None);
            self.add_node(c);
            cookie = next;
        }
        idx
    }

    /// Advance the wheel by exactly one tick.
    fn tick(&self, freed: &mut Vec<u32>) {
        self.expire_root_slot(freed);

        let new_jiffies = self.jiffies.fetch_add(1, Ordering::Relaxed) + 1;
        if new_jiffies & SR_MASK == 0 {
            for level in 0..LEVELS {
                if self.cascade(level) != 0 {
                    break;
                }
            }
        }

        self.expire_root_slot(freed);
    }

    /// Apply queued after/cancel commands. Cancelled cookies are pushed
    /// onto `freed` (released in the same batch as this tick's expired
    /// nodes); returns `true` if an exit command was seen.
    fn process_commands(&self, freed: &mut Vec<u32>) -> bool {
        let mut cancel_count: u64 = 0;
        let mut should_exit = false;

        for cmd in self.cmdbuf.flip() {
            match cmd {
                Command::After(cookie) => {
                    let n = self.pool.node(cookie);
                    debug_assert_eq!(n.state(), NodeState::Adding);
                    n.set_state(NodeState::Ticking);
                    self.add_node(cookie);
                }
                Command::Cancel(cookie, version) => {
                    let n = self.pool.node(cookie);
                    if n.version.load(Ordering::Relaxed) == version {
                        self.unlink(cookie);
                        freed.push(cookie);
                        cancel_count += 1;
                    }
                }
                Command::Exit => should_exit = true,
            }
        }

        if cancel_count > 0 {
            self.counters.pending.fetch_sub(cancel_count, Ordering::Relaxed);
            self.counters.cancelled.fetch_add(cancel_count, Ordering::Relaxed);
        }

        should_exit
    }

    /// Run one update pass: process pending after/cancel commands, then
    /// advance by however many whole ticks have elapsed since the last
    /// call (catch-up replay if the thread was delayed). Returns the
    /// number of milliseconds to sleep before the next call should
    /// happen, or `None` if the wheel has been asked to exit.
    pub fn update(&self) -> Option<u64> {
        let resolution = self.config.resolution_ms as u64;
        let now = monotonic_ms();
        let last = self.ticktime.load(Ordering::Relaxed);

        if now < last + resolution {
            return Some(last + resolution - now);
        }

        if last > now {
            klog_error!("time rewind: from {} to {}", last, now);
        }

        let delta = now - last;
        if delta > self.config.delay_warning_ms {
            klog_warn!("update delta is too big: {} ms", delta);
        }

        let ticks = delta / resolution;
        let tickstep = ticks * resolution;
        self.ticktime.fetch_add(tickstep, Ordering::Relaxed);
        self.monotonic.fetch_add(tickstep, Ordering::Relaxed);

        let mut freed = Vec::new();
        let should_exit = self.process_commands(&mut freed);
        if should_exit {
            self.pool.free_batch(&freed);
            return None;
        }

        for _ in 0..ticks {
            self.tick(&mut freed);
        }
        self.pool.free_batch(&freed);

        Some(resolution - delta % resolution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::Duration;

    fn wheel_with_sink(config: WheelConfig) -> (Arc<TimerWheel>, Arc<Mutex<Vec<TimerSession>>>) {
        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink = fired.clone();
        let wheel = Arc::new(TimerWheel::new(config, move |s| sink.lock().unwrap().push(s)));
        (wheel, fired)
    }

    #[test]
    fn test_one_shot_fires() {
        let (wheel, fired) = wheel_with_sink(WheelConfig {
            resolution_ms: 5,
            delay_warning_ms: 1000,
        });

        let session = wheel.after(10);
        assert_eq!(wheel.stat().scheduled, 1);

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            wheel.update();
            if fired.lock().unwrap().contains(&session) {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "timer never fired");
            thread::sleep(Duration::from_millis(5));
        }

        assert_eq!(wheel.stat().fired, 1);
        assert_eq!(wheel.stat().pending, 0);
    }

    #[test]
    fn test_cancel_before_fire() {
        let (wheel, fired) = wheel_with_sink(WheelConfig {
            resolution_ms: 5,
            delay_warning_ms: 1000,
        });

        let session = wheel.after(500);
        assert!(wheel.cancel(session));

        for _ in 0..10 {
            wheel.update();
            thread::sleep(Duration::from_millis(5));
        }

        assert!(!fired.lock().unwrap().contains(&session));
        assert_eq!(wheel.stat().cancelled, 1);
    }

    #[test]
    fn test_stale_cancel_rejected() {
        let (wheel, _fired) = wheel_with_sink(WheelConfig::default());
        let session = wheel.after(1);
        // Forge a session with a wrong version; should be rejected.
        let stale = TimerSession::pack(session.version().wrapping_add(99), session.cookie());
        assert!(!wheel.cancel(stale));
    }

    #[test]
    fn test_catchup_after_stall() {
        let (wheel, fired) = wheel_with_sink(WheelConfig {
            resolution_ms: 5,
            delay_warning_ms: 1000,
        });

        let session = wheel.after(15);
        // Simulate a stalled owner thread: sleep well past the deadline,
        // then a single update() call must replay every missed tick.
        thread::sleep(Duration::from_millis(60));
        wheel.update();

        assert!(fired.lock().unwrap().contains(&session));
    }

    #[test]
    fn test_many_timers_cancel_race() {
        let (wheel, fired) = wheel_with_sink(WheelConfig {
            resolution_ms: 5,
            delay_warning_ms: 1000,
        });

        let mut sessions = Vec::new();
        for i in 0..100 {
            sessions.push(wheel.after(50 + i));
        }
        for (i, s) in sessions.iter().enumerate() {
            if i % 2 == 0 {
                wheel.cancel(*s);
            }
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while wheel.stat().pending > 0 {
            wheel.update();
            assert!(std::time::Instant::now() < deadline);
            thread::sleep(Duration::from_millis(5));
        }

        let fired = fired.lock().unwrap();
        for (i, s) in sessions.iter().enumerate() {
            if i % 2 == 0 {
                assert!(!fired.contains(s));
            } else {
                assert!(fired.contains(s));
            }
        }
    }
}
