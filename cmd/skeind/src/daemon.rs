//! Daemonize: create and lock the pidfile in the parent, fork and
//! detach, then write the (now-child's) pid into the pidfile.
//!
//! Grounded directly on `original_source/src/silly_daemon.c`: the
//! pidfile is opened and `flock`'d *before* the fork so a second
//! instance racing the first fails immediately on the lock rather than
//! after paying for a fork; the fd survives the fork (no `O_CLOEXEC`),
//! so the child just truncates and rewrites it with its own pid.

use std::fs::OpenOptions;
use std::io::Write;
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;

use skein_core::klog_error;

use crate::opts::Parsed;

/// None when daemonizing wasn't requested, or the pidfile path was
/// empty — matches `pidfile_create`'s own no-op path.
fn pidfile_create(path: &str) -> Option<std::fs::File> {
    if path.is_empty() {
        return None;
    }
    let file = match OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .mode(0o600)
        .open(path)
    {
        Ok(f) => f,
        Err(err) => {
            klog_error!("[pidfile] create '{}' fail: {}", path, err);
            std::process::exit(1);
        }
    };
    if let Err(err) = nix::fcntl::flock(
        file.as_raw_fd(),
        nix::fcntl::FlockArg::LockExclusiveNonblock,
    ) {
        klog_error!(
            "[pidfile] lock '{}' fail, another instance already running: {}",
            path,
            err
        );
        std::process::exit(1);
    }
    Some(file)
}

fn pidfile_write(file: &mut std::fs::File) {
    let pid = unsafe { libc::getpid() };
    if let Err(err) = file.set_len(0) {
        klog_error!("[pidfile] truncate fail: {}", err);
        std::process::exit(1);
    }
    if let Err(err) = write!(file, "{}\n", pid) {
        klog_error!("[pidfile] write fail: {}", err);
        std::process::exit(1);
    }
}

fn pidfile_delete(path: &str) {
    if path.is_empty() {
        return;
    }
    let _ = std::fs::remove_file(path);
}

/// `daemon_start`: no-op unless `--daemon` was passed.
pub fn start(parsed: &Parsed) {
    if !parsed.daemon {
        return;
    }
    let path = parsed.pid_file.as_deref().unwrap_or("");
    let mut pidfile = pidfile_create(path);

    // `daemon(1, 0)`: keep the current working directory, redirect
    // stdin/stdout/stderr to /dev/null.
    let rc = unsafe { libc::daemon(1, 0) };
    if rc != 0 {
        if let Some(path) = &parsed.pid_file {
            pidfile_delete(path);
        }
        klog_error!("[daemon] fork/detach failed: {}", std::io::Error::last_os_error());
        std::process::exit(1);
    }

    if let Some(file) = pidfile.as_mut() {
        pidfile_write(file);
    }
}

/// `daemon_stop`: removes the pidfile. No-op unless `--daemon` was
/// passed.
pub fn stop(parsed: &Parsed) {
    if !parsed.daemon {
        return;
    }
    if let Some(path) = &parsed.pid_file {
        pidfile_delete(path);
    }
}
