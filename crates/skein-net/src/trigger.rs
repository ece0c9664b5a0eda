//! One-shot wake primitive for the command queue, backed by Linux
//! `eventfd` in place of the original's self-pipe.
//!
//! Preserves `trigger.h`'s exact two-part protocol: `fire()` only stores
//! `fired = true` (release) after the wake write actually lands, and
//! `consume()` fast-paths on an acquire load of `fired` before touching
//! the descriptor at all, so a reactor thread spinning through idle
//! `epoll_wait` wakeups never pays a syscall when nothing fired.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};

pub struct Trigger {
    fd: RawFd,
    fired: AtomicBool,
}

impl Trigger {
    pub fn new() -> std::io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(Self {
            fd,
            fired: AtomicBool::new(false),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Wake the other side. Safe to call from any thread, any number of
    /// times before the wake is consumed — the eventfd counter coalesces
    /// redundant wakes into one readiness event.
    pub fn fire(&self) {
        let val: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.fd,
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            let errno = std::io::Error::last_os_error();
            if errno.raw_os_error() != Some(libc::EAGAIN) {
                skein_core::klog_warn!("trigger fire write failed: {}", errno);
                return;
            }
            // EAGAIN means the 64-bit counter would overflow, i.e. a wake
            // is already outstanding. That's fine, treat it as delivered.
        }
        self.fired.store(true, Ordering::Release);
    }

    /// Drain the eventfd if a wake is outstanding. Returns whether one was
    /// consumed.
    pub fn consume(&self) -> bool {
        if !self.fired.load(Ordering::Acquire) {
            return false;
        }
        let mut val: u64 = 0;
        let ret = unsafe {
            libc::read(
                self.fd,
                &mut val as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            let errno = std::io::Error::last_os_error();
            if errno.raw_os_error() == Some(libc::EAGAIN) {
                return false;
            }
            skein_core::klog_warn!("trigger consume read failed: {}", errno);
            return false;
        }
        self.fired.store(false, Ordering::Relaxed);
        true
    }
}

impl Drop for Trigger {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}

unsafe impl Send for Trigger {}
unsafe impl Sync for Trigger {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fire_then_consume() {
        let t = Trigger::new().unwrap();
        assert!(!t.consume());
        t.fire();
        assert!(t.consume());
        assert!(!t.consume());
    }

    #[test]
    fn test_coalesced_fires() {
        let t = Trigger::new().unwrap();
        t.fire();
        t.fire();
        t.fire();
        assert!(t.consume());
        assert!(!t.consume());
    }
}
