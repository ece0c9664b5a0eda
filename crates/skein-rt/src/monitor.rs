//! Endless-loop / stall detection.
//!
//! Grounded on `monitor.c` (25 lines in the original) and
//! `engine.c::thread_monitor`: the Monitor has no OS thread of its own —
//! it runs on whatever thread calls `Monitor::run`, which
//! `crate::runtime::Runtime::run` arranges to be the process's main
//! thread, after the Reactor/Timer/Worker threads have been spawned.

use std::thread;
use std::time::Duration;

use skein_core::kprint::set_component;

use crate::dispatcher::DiagnosticHook;

/// Samples the Worker's `process_id` once per `slow_time`; if it hasn't
/// moved since the previous sample the Worker is assumed stuck inside a
/// single callback and the diagnostic hook fires. Terminates once
/// `worker_exited` reports true.
pub struct Monitor {
    slow_time: Duration,
    last_process_id: u32,
}

impl Monitor {
    pub fn new(slow_time_ms: u64) -> Self {
        Self {
            slow_time: Duration::from_millis(slow_time_ms.max(1)),
            last_process_id: 0,
        }
    }

    /// One check: compare `current_process_id` to the last sample,
    /// firing `hook` on a stall. Returns the value sampled this round so
    /// the caller's loop can thread it into the next iteration without
    /// the Monitor needing its own shared state.
    pub fn check(&mut self, current_process_id: u32, hook: &dyn DiagnosticHook) {
        if current_process_id == self.last_process_id {
            hook.on_stall(current_process_id);
        }
        self.last_process_id = current_process_id;
    }

    /// Block the calling thread, checking every `slow_time` until
    /// `worker_exited()` reports true. `process_id` is sampled fresh
    /// each iteration since the Worker runs on its own thread.
    pub fn run(
        &mut self,
        process_id: impl Fn() -> u32,
        worker_exited: impl Fn() -> bool,
        hook: &dyn DiagnosticHook,
    ) {
        set_component("monitor");
        loop {
            thread::sleep(self.slow_time);
            if worker_exited() {
                break;
            }
            self.check(process_id(), hook);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct CountingHook(Arc<AtomicU32>);
    impl DiagnosticHook for CountingHook {
        fn on_stall(&self, _process_id: u32) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn same_process_id_triggers_stall() {
        let mut monitor = Monitor::new(10);
        let stalls = Arc::new(AtomicU32::new(0));
        let hook = CountingHook(stalls.clone());

        monitor.check(5, &hook);
        assert_eq!(stalls.load(Ordering::Relaxed), 0, "5 differs from the initial last_process_id of 0");
        monitor.check(5, &hook);
        assert_eq!(stalls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn advancing_process_id_never_stalls() {
        let mut monitor = Monitor::new(10);
        let stalls = Arc::new(AtomicU32::new(0));
        let hook = CountingHook(stalls.clone());

        for id in 0..10 {
            monitor.check(id, &hook);
        }
        assert_eq!(stalls.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn run_exits_once_worker_exited_reports_true() {
        let mut monitor = Monitor::new(1);
        let stalls = Arc::new(AtomicU32::new(0));
        let hook = CountingHook(stalls.clone());
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        monitor.run(
            || 0,
            move || calls_clone.fetch_add(1, Ordering::Relaxed) >= 2,
            &hook,
        );

        assert!(calls.load(Ordering::Relaxed) >= 3);
    }
}
