//! OS thread that owns a `TimerWheel` and drives its `update()` loop.
//!
//! Spawn/shutdown/stats idiom carried over from this runtime's worker
//! thread plumbing: a named `thread::Builder`, an `AtomicBool` shutdown
//! flag, and a join handle that hands back final stats.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use skein_core::kprint::set_component;

use crate::wheel::{TimerStat, TimerWheel};

#[derive(Debug, Clone)]
pub struct TimerThreadConfig {
    pub thread_name: String,
    pub stack_size: Option<usize>,
    /// Pin the timer thread to this CPU, if set.
    pub affinity: Option<usize>,
}

impl Default for TimerThreadConfig {
    fn default() -> Self {
        Self {
            thread_name: "skein-timer".into(),
            stack_size: None,
            affinity: None,
        }
    }
}

fn pin_to_cpu(cpu: usize) {
    use nix::sched::{sched_setaffinity, CpuSet};
    use nix::unistd::Pid;

    let mut set = CpuSet::new();
    if let Err(err) = set.set(cpu) {
        skein_core::klog_warn!("invalid timer affinity cpu {}: {}", cpu, err);
        return;
    }
    if let Err(err) = sched_setaffinity(Pid::from_raw(0), &set) {
        skein_core::klog_warn!("failed to pin timer thread to cpu {}: {}", cpu, err);
    }
}

pub struct TimerThreadHandle {
    handle: Option<JoinHandle<TimerStat>>,
    shutdown: Arc<AtomicBool>,
    wheel: Arc<TimerWheel>,
}

impl TimerThreadHandle {
    /// Current counters, safe to call while the thread is running.
    pub fn stat(&self) -> TimerStat {
        self.wheel.stat()
    }

    /// Schedule `timeout_ms` from now; returns the session used to
    /// cancel it later.
    pub fn after(&self, timeout_ms: u32) -> crate::session::TimerSession {
        self.wheel.after(timeout_ms)
    }

    /// Cancel a previously scheduled session.
    pub fn cancel(&self, session: crate::session::TimerSession) -> bool {
        self.wheel.cancel(session)
    }

    /// Request shutdown and block until the thread has exited, returning
    /// final stats.
    pub fn shutdown(mut self) -> TimerStat {
        self.shutdown.store(true, Ordering::Release);
        self.wheel.request_exit();
        self.handle
            .take()
            .expect("handle already taken")
            .join()
            .expect("timer thread panicked")
    }
}

/// Spawn the timer thread, returning a handle that can schedule/cancel
/// timers and eventually shut the thread down.
pub fn spawn_timer_thread(wheel: Arc<TimerWheel>, config: TimerThreadConfig) -> TimerThreadHandle {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    let wheel_clone = wheel.clone();
    let affinity = config.affinity;

    let mut builder = thread::Builder::new().name(config.thread_name.clone());
    if let Some(stack_size) = config.stack_size {
        builder = builder.stack_size(stack_size);
    }

    let handle = builder
        .spawn(move || timer_loop(wheel_clone, shutdown_clone, affinity))
        .expect("failed to spawn timer thread");

    TimerThreadHandle {
        handle: Some(handle),
        shutdown,
        wheel,
    }
}

fn timer_loop(wheel: Arc<TimerWheel>, shutdown: Arc<AtomicBool>, affinity: Option<usize>) -> TimerStat {
    set_component("timer");
    if let Some(cpu) = affinity {
        pin_to_cpu(cpu);
    }
    while !shutdown.load(Ordering::Relaxed) {
        match wheel.update() {
            Some(sleep_ms) => {
                if sleep_ms > 0 {
                    thread::sleep(Duration::from_millis(sleep_ms));
                }
            }
            None => break,
        }
    }
    wheel.stat()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wheel::WheelConfig;
    use std::sync::Mutex;

    #[test]
    fn test_spawn_fire_and_shutdown() {
        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink = fired.clone();
        let wheel = Arc::new(TimerWheel::new(
            WheelConfig {
                resolution_ms: 5,
                delay_warning_ms: 1000,
            },
            move |s| sink.lock().unwrap().push(s),
        ));

        let handle = spawn_timer_thread(wheel, TimerThreadConfig::default());
        let session = handle.after(20);

        std::thread::sleep(Duration::from_millis(200));

        let stat = handle.shutdown();
        assert!(stat.fired >= 1);
        assert!(fired.lock().unwrap().contains(&session));
    }
}
