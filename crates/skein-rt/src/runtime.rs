//! `Runtime`: owns and orchestrates the four subsystem threads.
//!
//! Grounded directly on `engine.c::engine_run`/`engine_shutdown`:
//! Reactor, Timer and Worker each get their own `thread_create` (with
//! optional CPU-affinity pinning), then the *calling* thread becomes the
//! Monitor loop, then only the Worker thread is joined from `run`'s own
//! call path — Reactor and Timer are joined from the shutdown path
//! instead, after their own exit commands have been posted.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use skein_core::klog_info;
use skein_error::GResult;
use skein_net::{ReactorThreadConfig, ReactorThreadHandle};
use skein_timer::{TimerThreadConfig, TimerThreadHandle, TimerWheel, WheelConfig};

use crate::bus::{self, TimerExpire};
use crate::config::RuntimeConfig;
use crate::dispatcher::{spawn_dispatcher, DiagnosticHook, DispatcherConfig, DispatcherHandle};
use crate::monitor::Monitor;
use crate::registry::{CallbackRegistry, ScriptContext};
use crate::signal;

/// A no-op hook used when the embedding application doesn't care to
/// install anything — the Monitor still runs, it just has nothing to
/// do on a stall besides the log line it emits itself.
pub struct NullDiagnosticHook;

impl DiagnosticHook for NullDiagnosticHook {
    fn on_stall(&self, process_id: u32) {
        skein_core::klog_warn!("worker appears stalled at process_id={}", process_id);
    }
}

/// Everything needed to start the runtime: the script context, its
/// populated callback table, and (optionally) a diagnostic hook for
/// endless-loop detection. Built by the embedding application, handed
/// to `Runtime::run` once.
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    registry: CallbackRegistry,
    ctx: Box<dyn ScriptContext>,
    hook: Box<dyn DiagnosticHook>,
}

impl RuntimeBuilder {
    pub fn new(config: RuntimeConfig, ctx: Box<dyn ScriptContext>) -> Self {
        Self {
            config,
            registry: CallbackRegistry::new(),
            ctx,
            hook: Box::new(NullDiagnosticHook),
        }
    }

    pub fn with_registry(mut self, registry: CallbackRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_diagnostic_hook(mut self, hook: Box<dyn DiagnosticHook>) -> Self {
        self.hook = hook;
        self
    }

    pub fn run(self) -> Runtime {
        Runtime::start(self.config, self.registry, self.ctx, self.hook)
    }
}

/// A live runtime: Reactor, Timer and Worker are all running; the
/// Monitor has not yet been run on the calling thread.
pub struct Runtime {
    reactor: ReactorThreadHandle,
    timer: TimerThreadHandle,
    worker: DispatcherHandle,
    monitor: Monitor,
    hook: Box<dyn DiagnosticHook>,
    running: Arc<AtomicBool>,
}

impl Runtime {
    fn start(
        config: RuntimeConfig,
        registry: CallbackRegistry,
        ctx: Box<dyn ScriptContext>,
        hook: Box<dyn DiagnosticHook>,
    ) -> Self {
        let running = Arc::new(AtomicBool::new(true));

        let worker = spawn_dispatcher(
            DispatcherConfig {
                warning_threshold: config.warning_threshold,
                affinity: config.worker_affinity,
            },
            registry,
            ctx,
        );

        signal::ignore_sigpipe();
        signal::init(worker.sender());

        let sender_for_reactor = worker.sender();
        let reactor = skein_net::spawn_reactor_thread(
            ReactorThreadConfig {
                thread_name: "skein-reactor".into(),
                stack_size: None,
                poll_timeout_ms: 100,
                reactor: skein_net::ReactorConfig::default(),
                affinity: config.reactor_affinity,
            },
            move |msg| sender_for_reactor.push(bus::from_net_message(msg)),
        )
        .expect("failed to spawn reactor thread");

        let sender_for_timer = worker.sender();
        let wheel = Arc::new(TimerWheel::new(
            WheelConfig {
                resolution_ms: config.timer_resolution_ms,
                delay_warning_ms: 1000,
            },
            move |session| {
                sender_for_timer.push(Box::new(TimerExpire {
                    session: session.raw(),
                }));
            },
        ));
        let timer = skein_timer::spawn_timer_thread(
            wheel,
            TimerThreadConfig {
                thread_name: "skein-timer".into(),
                stack_size: None,
                affinity: config.timer_affinity,
            },
        );

        let monitor = Monitor::new(config.monitor_slow_time_ms);

        klog_info!("runtime started: reactor, timer, worker threads running");

        Self {
            reactor,
            timer,
            worker,
            monitor,
            hook,
            running,
        }
    }

    pub fn tcp_listen(&self, addr: SocketAddr) -> GResult<skein_net::SocketId> {
        self.reactor.tcp_listen(addr)
    }

    pub fn udp_bind(&self, addr: SocketAddr) -> GResult<skein_net::SocketId> {
        self.reactor.udp_bind(addr)
    }

    pub fn after(&self, timeout_ms: u32) -> skein_timer::TimerSession {
        self.timer.after(timeout_ms)
    }

    pub fn cancel(&self, session: skein_timer::TimerSession) -> bool {
        self.timer.cancel(session)
    }

    pub fn alloc_id(&self) -> u32 {
        self.worker.alloc_id()
    }

    /// Run the Monitor loop on the calling thread until `shutdown` is
    /// called from another thread (typically a signal handler or a
    /// script-side exit call wired up by the embedding application).
    /// Blocks until the Worker thread has exited, then returns.
    pub fn run_monitor(&mut self) {
        let process_id = || self.worker.process_id();
        let running = self.running.clone();
        // `worker_exited` here means "shutdown requested"; the Worker's
        // own thread-exit is awaited afterwards in `shutdown`, matching
        // `engine_run`'s join-worker-after-monitor-returns ordering.
        self.monitor
            .run(process_id, move || !running.load(Ordering::Acquire), self.hook.as_ref());
    }

    /// `engine_shutdown` plus the worker join `engine_run` performs
    /// afterwards: stop the Reactor and Timer first, then let the
    /// Worker drain its remaining queue and exit.
    pub fn shutdown(self) {
        self.running.store(false, Ordering::Release);
        let reactor_stat = self.reactor.shutdown();
        let timer_stat = self.timer.shutdown();
        klog_info!(
            "reactor stopped: recv_bytes={} send_bytes={}",
            reactor_stat.recv_bytes,
            reactor_stat.send_bytes
        );
        klog_info!(
            "timer stopped: scheduled={} fired={} cancelled={}",
            timer_stat.scheduled,
            timer_stat.fired,
            timer_stat.cancelled
        );
        self.worker.shutdown();
    }

    /// Request that `run_monitor` return on its next check. Safe to call
    /// from any thread (e.g. a signal handler callback dispatched
    /// through the bus, or the script calling an `exit()` builtin the
    /// embedding application wires to this).
    pub fn request_shutdown(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// A clone of the flag `run_monitor` blocks on. Lets an embedding
    /// application arrange for shutdown from outside the message bus
    /// entirely — e.g. a process-level `SIGINT`/`SIGTERM` handler that
    /// has no `ScriptContext` to route a `SignalFire` message through.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// Start delivering `signum` as a `SignalFire` message on the bus.
    /// Matches `sig_watch` — there is no default watch set, the embedding
    /// application opts each signal in explicitly.
    pub fn watch_signal(&self, signum: i32) -> Result<(), nix::errno::Errno> {
        signal::watch(signum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RecordingContext;
    use std::time::Duration;

    #[test]
    fn builder_defaults_to_null_hook_and_starts_threads() {
        let config = RuntimeConfig::new();
        let mut runtime = RuntimeBuilder::new(config, Box::new(RecordingContext::new())).run();

        let id1 = runtime.alloc_id();
        let id2 = runtime.alloc_id();
        assert!(id2 > id1);

        runtime.request_shutdown();
        // `run_monitor` would block on the calling thread in real use;
        // here we only exercise the non-blocking surface and shut down
        // directly, the way a unit test that isn't driving the whole
        // process lifecycle should.
        std::thread::sleep(Duration::from_millis(20));
        runtime.shutdown();
    }
}
