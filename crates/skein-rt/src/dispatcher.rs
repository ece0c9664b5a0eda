//! The Worker: single OS thread that owns the `ScriptContext` and
//! drains the message queue in batches.
//!
//! Grounded on `worker.c::worker_dispatch`/`worker_push`/`worker_alloc_id`
//! and `engine.c::thread_worker`'s mutex+condvar park/wake pattern
//! (`workerstatus` 0 while parked, double-checked backlog before the
//! wait so a message pushed between the check and the wait is never
//! missed).

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use skein_core::{klog_error, klog_warn};
use skein_core::kprint::set_component;

use crate::bus::Message;
use crate::queue::MessageQueue;
use crate::registry::{CallbackRegistry, ScriptContext};

/// Hook the embedding interpreter registers so the Monitor can ask it to
/// print a traceback on the next call/return when the Worker has stalled.
/// Stands in for the original's `lua_sethook`-based `warn_hook`.
pub trait DiagnosticHook: Send + Sync {
    fn on_stall(&self, process_id: u32);
}

pub struct DispatcherConfig {
    pub warning_threshold: usize,
    /// Pin the worker thread to this CPU, if set.
    pub affinity: Option<usize>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            warning_threshold: 64,
            affinity: None,
        }
    }
}

fn pin_to_cpu(cpu: usize) {
    use nix::sched::{sched_setaffinity, CpuSet};
    use nix::unistd::Pid;

    let mut set = CpuSet::new();
    if let Err(err) = set.set(cpu) {
        klog_warn!("invalid worker affinity cpu {}: {}", cpu, err);
        return;
    }
    if let Err(err) = sched_setaffinity(Pid::from_raw(0), &set) {
        klog_warn!("failed to pin worker thread to cpu {}: {}", cpu, err);
    }
}

/// The producer-facing side of the Worker: cheaply cloneable, so the
/// Reactor and Timer threads can each hold their own copy to post
/// messages without reaching into `DispatcherHandle` itself (which owns
/// the join handle and is consumed by `shutdown`).
#[derive(Clone)]
pub struct DispatcherSender {
    queue: Arc<MessageQueue>,
    max_msg: Arc<AtomicUsize>,
    wake: Arc<(Mutex<bool>, Condvar)>,
}

impl DispatcherSender {
    /// Enqueue a message and wake the worker if it's parked. Mirrors
    /// `worker_push`: logs and doubles the warning threshold once the
    /// backlog exceeds it, rather than ever refusing to enqueue.
    pub fn push(&self, msg: Box<dyn Message>) {
        let size = self.queue.push(msg);
        let max = self.max_msg.load(Ordering::Relaxed);
        if size > max {
            klog_warn!("worker queue size {} exceeds threshold {}", size, max);
            self.max_msg.store(max.saturating_mul(2).max(1), Ordering::Relaxed);
        }

        let (lock, cvar) = &*self.wake;
        let mut has_work = lock.lock().unwrap();
        *has_work = true;
        cvar.notify_one();
    }

    pub fn backlog(&self) -> usize {
        self.queue.len()
    }
}

/// Shared side of the Worker: the pieces producer threads (Reactor,
/// Timer, anything else posting onto the bus) and the Monitor touch.
/// The `ScriptContext`/`CallbackRegistry` themselves never leave the
/// worker thread.
pub struct DispatcherHandle {
    sender: DispatcherSender,
    process_id: Arc<AtomicU32>,
    next_id: Arc<AtomicU32>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl DispatcherHandle {
    /// Enqueue a message and wake the worker if it's parked.
    pub fn push(&self, msg: Box<dyn Message>) {
        self.sender.push(msg)
    }

    /// A cloneable handle producer threads (Reactor, Timer) can own
    /// independently of this one, which is consumed by `shutdown`.
    pub fn sender(&self) -> DispatcherSender {
        self.sender.clone()
    }

    /// Monotonic id allocator for whatever the embedding application
    /// needs unique ids for (session handles, object ids, ...). Warns
    /// once on wraparound back to zero, matching `worker_alloc_id`.
    pub fn alloc_id(&self) -> u32 {
        let prev = self.next_id.fetch_add(1, Ordering::Relaxed);
        let id = prev.wrapping_add(1);
        if id == 0 {
            klog_warn!("id allocator wrapped around to 0");
        }
        id
    }

    /// The dispatch-loop generation counter the Monitor samples to
    /// detect a stalled callback.
    pub fn process_id(&self) -> u32 {
        self.process_id.load(Ordering::Relaxed)
    }

    pub fn backlog(&self) -> usize {
        self.sender.backlog()
    }

    /// Request shutdown. The worker drains whatever remains in the
    /// queue before exiting — no in-flight callback is aborted, and no
    /// message already enqueued is dropped.
    pub fn shutdown(mut self) {
        self.running.store(false, Ordering::Release);
        let (lock, cvar) = &*self.sender.wake;
        let mut has_work = lock.lock().unwrap();
        *has_work = true;
        cvar.notify_one();
        drop(has_work);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Spawn the Worker thread. `ctx` is the already-constructed scripting
/// context (bootstrap script loaded, autoload done — see
/// `crate::runtime::Runtime` for that startup choreography);
/// `registry` is the fully populated callback table.
pub fn spawn_dispatcher(
    config: DispatcherConfig,
    registry: CallbackRegistry,
    ctx: Box<dyn ScriptContext>,
) -> DispatcherHandle {
    let queue = Arc::new(MessageQueue::new());
    let process_id = Arc::new(AtomicU32::new(0));
    let next_id = Arc::new(AtomicU32::new(0));
    let max_msg = Arc::new(AtomicUsize::new(config.warning_threshold));
    let running = Arc::new(AtomicBool::new(true));
    let wake = Arc::new((Mutex::new(false), Condvar::new()));

    let queue_clone = queue.clone();
    let process_id_clone = process_id.clone();
    let max_msg_clone = max_msg.clone();
    let running_clone = running.clone();
    let wake_clone = wake.clone();
    let warning_threshold = config.warning_threshold;
    let affinity = config.affinity;

    let handle = thread::Builder::new()
        .name("skein-worker".into())
        .spawn(move || {
            set_component("worker");
            if let Some(cpu) = affinity {
                pin_to_cpu(cpu);
            }
            worker_loop(
                &registry,
                ctx.as_mut(),
                &queue_clone,
                &process_id_clone,
                &max_msg_clone,
                warning_threshold,
                &running_clone,
                &wake_clone,
            );
        })
        .expect("failed to spawn worker thread");

    DispatcherHandle {
        sender: DispatcherSender { queue, max_msg, wake },
        process_id,
        next_id,
        running,
        handle: Some(handle),
    }
}

fn worker_loop(
    registry: &CallbackRegistry,
    ctx: &mut dyn ScriptContext,
    queue: &Arc<MessageQueue>,
    process_id: &Arc<AtomicU32>,
    max_msg: &Arc<AtomicUsize>,
    warning_threshold: usize,
    running: &Arc<AtomicBool>,
    wake: &Arc<(Mutex<bool>, Condvar)>,
) {
    loop {
        {
            let (lock, cvar) = &**wake;
            let mut has_work = lock.lock().unwrap();
            while !*has_work && queue.is_empty() && running.load(Ordering::Acquire) {
                has_work = cvar.wait(has_work).unwrap();
            }
            *has_work = false;
        }

        dispatch_batch(registry, ctx, queue, process_id, max_msg, warning_threshold);

        if !running.load(Ordering::Acquire) && queue.is_empty() {
            break;
        }
    }
}

/// One batch: swap out the whole queue, run every message's callback
/// under a caught error, bump `process_id` before the batch and once
/// more per message, then run the post-batch hooks. Matches
/// `worker_dispatch` exactly.
fn dispatch_batch(
    registry: &CallbackRegistry,
    ctx: &mut dyn ScriptContext,
    queue: &MessageQueue,
    process_id: &AtomicU32,
    max_msg: &AtomicUsize,
    warning_threshold: usize,
) {
    let batch = queue.pop_all();
    if batch.is_empty() {
        ctx.gc_step();
        return;
    }

    process_id.fetch_add(1, Ordering::Relaxed);

    for msg in &batch {
        let type_id = msg.type_id();
        match registry.get(type_id) {
            Some(callback) => {
                if let Err(trace) = callback(ctx, msg.as_ref()) {
                    klog_error!("callback for message type {} failed: {}", type_id, trace);
                }
            }
            None => {
                klog_warn!("dropping message: no callback for type {}", type_id);
            }
        }
        process_id.fetch_add(1, Ordering::Relaxed);
    }

    ctx.dispatch_wakeup();
    max_msg.store(warning_threshold, Ordering::Relaxed);
}

/// Construction helpers for sibling modules' tests that need a
/// `DispatcherSender` without spinning up a whole worker thread.
#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub(crate) fn make_sender(
        queue: Arc<MessageQueue>,
        max_msg: Arc<AtomicUsize>,
        wake: Arc<(Mutex<bool>, Condvar)>,
    ) -> DispatcherSender {
        DispatcherSender { queue, max_msg, wake }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{TimerExpire, TIMER_EXPIRE};
    use crate::registry::RecordingContext;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    #[test]
    fn dispatch_batch_calls_registered_callback_and_advances_process_id() {
        let mut registry = CallbackRegistry::new();
        registry.register(
            TIMER_EXPIRE,
            Box::new(|ctx: &mut dyn ScriptContext, msg: &dyn Message| ctx.call(TIMER_EXPIRE, msg)),
        );

        let queue = MessageQueue::new();
        queue.push(Box::new(TimerExpire { session: 1 }));
        queue.push(Box::new(TimerExpire { session: 2 }));

        let mut ctx = RecordingContext::new();
        let process_id = AtomicU32::new(0);
        let max_msg = AtomicUsize::new(64);

        dispatch_batch(&registry, &mut ctx, &queue, &process_id, &max_msg, 64);

        assert_eq!(ctx.calls, vec![TIMER_EXPIRE, TIMER_EXPIRE]);
        assert_eq!(ctx.wakeups, 1);
        // One increment before the batch, one per message.
        assert_eq!(process_id.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn dispatch_batch_on_empty_queue_runs_gc_step_only() {
        let registry = CallbackRegistry::new();
        let queue = MessageQueue::new();
        let mut ctx = RecordingContext::new();
        let process_id = AtomicU32::new(5);
        let max_msg = AtomicUsize::new(64);

        dispatch_batch(&registry, &mut ctx, &queue, &process_id, &max_msg, 64);

        assert_eq!(ctx.gc_steps, 1);
        assert_eq!(ctx.wakeups, 0);
        assert_eq!(process_id.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn alloc_id_is_monotonic() {
        let handle = spawn_dispatcher(
            DispatcherConfig::default(),
            CallbackRegistry::new(),
            Box::new(RecordingContext::new()),
        );
        assert_eq!(handle.alloc_id(), 1);
        assert_eq!(handle.alloc_id(), 2);
        assert_eq!(handle.alloc_id(), 3);
        handle.shutdown();
    }

    #[test]
    fn push_wakes_worker_and_drains() {
        let seen: Arc<StdMutex<Vec<u32>>> = Arc::new(StdMutex::new(Vec::new()));
        let seen_cb = seen.clone();

        struct CountingContext {
            seen: Arc<StdMutex<Vec<u32>>>,
        }
        impl ScriptContext for CountingContext {
            fn call(&mut self, type_id: u32, _message: &dyn Message) -> Result<(), String> {
                self.seen.lock().unwrap().push(type_id);
                Ok(())
            }
            fn dispatch_wakeup(&mut self) {}
            fn gc_step(&mut self) {}
            fn error_string(&mut self, _code: i32) -> &str {
                "error"
            }
        }

        let mut registry = CallbackRegistry::new();
        registry.register(
            TIMER_EXPIRE,
            Box::new(|ctx: &mut dyn ScriptContext, msg: &dyn Message| ctx.call(TIMER_EXPIRE, msg)),
        );

        let handle = spawn_dispatcher(
            DispatcherConfig::default(),
            registry,
            Box::new(CountingContext { seen: seen_cb }),
        );

        handle.push(Box::new(TimerExpire { session: 1 }));

        let start = std::time::Instant::now();
        while seen.lock().unwrap().is_empty() && start.elapsed() < Duration::from_secs(1) {
            thread::sleep(Duration::from_millis(5));
        }

        assert_eq!(*seen.lock().unwrap(), vec![TIMER_EXPIRE]);
        handle.shutdown();
    }

    #[test]
    fn warning_threshold_doubles_past_backlog() {
        let handle = spawn_dispatcher(
            DispatcherConfig { warning_threshold: 2, affinity: None },
            CallbackRegistry::new(),
            Box::new(RecordingContext::new()),
        );

        // Push faster than the (idle, unregistered-callback) worker can
        // matter for this test — we only care about the threshold
        // bookkeeping on the producer side, so push while the queue is
        // still building up.
        for i in 0..4u64 {
            handle.push(Box::new(TimerExpire { session: i }));
        }

        assert!(handle.sender.max_msg.load(Ordering::Relaxed) >= 2);
        handle.shutdown();
    }
}
