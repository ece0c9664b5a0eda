//! Entry point for `skeind`: parses the boot arguments, optionally
//! daemonizes, then starts the `Runtime` and blocks on its Monitor
//! loop until a shutdown is requested.
//!
//! Grounded directly on `original_source/src/main.c`'s own `main`:
//! `trace_init(); daemon_start(&args); log_init(&args); timer_init();
//! status = engine_run(&args); daemon_stop(&args);` — the daemonize
//! step happens before logging/the runtime ever start, and the pidfile
//! is created and locked in the parent, before the fork, so a second
//! instance fails fast instead of racing the first past `engine_run`.
//!
//! There is no embedded scripting language in this build — `StandinContext`
//! takes the place of the Lua state `worker.c` would otherwise drive,
//! logging every callback instead of invoking script code.

use std::process::exit;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use skein_core::klog_error;
use skein_rt::{
    Callback, CallbackRegistry, Message, NullDiagnosticHook, RuntimeBuilder, RuntimeConfig,
    ScriptContext, SIGNAL_FIRE,
};

mod daemon;
mod opts;

/// Stand-in for the embedding application's interpreter state. Logs
/// every callback it receives at debug level instead of driving a real
/// script; `SIGNAL_FIRE` is handled specially (see
/// `register_shutdown_signal`) so `Ctrl-C`/`SIGTERM` still bring the
/// process down cleanly without a script to route them through.
struct StandinContext;

impl ScriptContext for StandinContext {
    fn call(&mut self, type_id: u32, _message: &dyn Message) -> Result<(), String> {
        skein_core::klog_debug!("dispatch type_id={} (no script loaded)", type_id);
        Ok(())
    }

    fn dispatch_wakeup(&mut self) {}

    fn gc_step(&mut self) {}

    fn error_string(&mut self, code: i32) -> &str {
        match code {
            0 => "ok",
            _ => "error",
        }
    }
}

/// Registers a handler for `SIGNAL_FIRE` that clears `keep_running` for
/// `SIGINT`/`SIGTERM`, the same way a loaded script would call
/// `silly.exit()` from its own signal callback. This flag isn't the one
/// `Runtime::run_monitor` blocks on — that one only exists once the
/// `Runtime` does, after the registry has already been handed over — so
/// `main` bridges the two with a small watcher thread once the runtime
/// is up.
fn register_shutdown_signal(registry: &mut CallbackRegistry, keep_running: Arc<AtomicBool>) {
    let handler: Callback = Box::new(move |_ctx, message| {
        if let Some(fire) = message.as_any().downcast_ref::<skein_rt::SignalFire>() {
            if fire.signum == libc::SIGINT || fire.signum == libc::SIGTERM {
                keep_running.store(false, Ordering::Release);
            }
        }
        Ok(())
    });
    registry.register(SIGNAL_FIRE, handler);
}

fn main() {
    let raw_args: Vec<String> = std::env::args().collect();
    let parsed = opts::parse(&raw_args);

    let parsed = match parsed {
        Ok(p) => p,
        Err(opts::OptError::Help) => {
            opts::print_help(&raw_args[0]);
            exit(0);
        }
        Err(opts::OptError::Version) => {
            println!("v{}", env!("CARGO_PKG_VERSION"));
            exit(0);
        }
        Err(opts::OptError::Invalid(msg)) => {
            eprintln!("skeind: {}", msg);
            exit(1);
        }
    };

    daemon::start(&parsed);

    skein_core::kprint::init();
    skein_core::kprint::set_log_level(parsed.log_level);

    let mut config = RuntimeConfig::from_env()
        .lualib_path(parsed.lualib_path.clone())
        .lualib_cpath(parsed.lualib_cpath.clone())
        .reactor_affinity(parsed.socket_affinity)
        .worker_affinity(parsed.worker_affinity)
        .timer_affinity(parsed.timer_affinity)
        .daemon(parsed.daemon);
    if let Some(path) = &parsed.log_path {
        config = config.log_path(path.clone());
    }
    if let Some(path) = &parsed.pid_file {
        config = config.pid_file(path.clone());
    }
    if let Some(script) = &parsed.bootstrap {
        config = config.bootstrap(script.clone());
    }

    if let Err(err) = config.validate() {
        klog_error!("invalid configuration: {}", err);
        daemon::stop(&parsed);
        exit(1);
    }

    let mut registry = CallbackRegistry::new();
    let keep_running = Arc::new(AtomicBool::new(true));
    register_shutdown_signal(&mut registry, keep_running.clone());

    let mut runtime = RuntimeBuilder::new(config, Box::new(StandinContext))
        .with_registry(registry)
        .with_diagnostic_hook(Box::new(NullDiagnosticHook))
        .run();

    // Bridge the registry-level shutdown flag into the one
    // `run_monitor` actually blocks on, then opt the process-level
    // signals into delivery.
    let monitor_running = runtime.shutdown_handle();
    std::thread::spawn(move || loop {
        if !keep_running.load(Ordering::Acquire) {
            monitor_running.store(false, Ordering::Release);
            return;
        }
        std::thread::sleep(std::time::Duration::from_millis(50));
    });
    if let Err(err) = runtime.watch_signal(libc::SIGINT) {
        klog_error!("failed to watch SIGINT: {}", err);
    }
    if let Err(err) = runtime.watch_signal(libc::SIGTERM) {
        klog_error!("failed to watch SIGTERM: {}", err);
    }

    runtime.run_monitor();
    runtime.shutdown();

    daemon::stop(&parsed);
}
