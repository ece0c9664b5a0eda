//! OS signal delivery onto the message bus.
//!
//! Grounded on `sig.c`: `sig_init` ignores `SIGPIPE` process-wide so a
//! write to a closed socket surfaces as an `EPIPE` return rather than
//! killing the process; `sig_watch` installs a raw handler that posts a
//! `SignalFire` message for every signal the embedding application opts
//! into. The original dedupes repeat `sig_watch` calls for the same
//! signal via a bitmask — installing the same handler twice through
//! `sigaction` has no externally observable difference, so that bitmask
//! is not carried forward.

use std::sync::OnceLock;

use nix::sys::signal::{self, SigHandler, Signal};

use crate::bus::SignalFire;
use crate::dispatcher::DispatcherSender;

static SENDER: OnceLock<DispatcherSender> = OnceLock::new();

/// Ignore `SIGPIPE` process-wide. Called once from `Runtime::start`.
pub fn ignore_sigpipe() {
    unsafe {
        let _ = signal::signal(Signal::SIGPIPE, SigHandler::SigIgn);
    }
}

/// Register the queue a watched signal's `SignalFire` message is pushed
/// onto. Must run before any `watch` call; `Runtime::start` does this
/// immediately after spawning the Worker.
pub fn init(sender: DispatcherSender) {
    let _ = SENDER.set(sender);
}

extern "C" fn deliver(signum: i32) {
    if let Some(sender) = SENDER.get() {
        sender.push(Box::new(SignalFire { signum }));
    }
}

/// Start delivering `signum` as `SignalFire` messages on the bus.
/// Matches `sig_watch`'s contract: an embedding application calls this
/// for whichever signals it wants to observe (there is no default set).
pub fn watch(signum: i32) -> Result<(), nix::errno::Errno> {
    let sig = Signal::try_from(signum)?;
    unsafe {
        signal::signal(sig, SigHandler::Handler(deliver))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MessageQueue;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::{Arc, Condvar, Mutex};

    #[test]
    fn watch_rejects_out_of_range_signum() {
        assert!(watch(9999).is_err());
    }

    #[test]
    fn watch_sigusr1_delivers_signal_fire() {
        let queue = Arc::new(MessageQueue::new());
        let max_msg = Arc::new(AtomicUsize::new(64));
        let wake = Arc::new((Mutex::new(false), Condvar::new()));
        let _running = AtomicBool::new(true);

        let sender = crate::dispatcher::test_support::make_sender(
            queue.clone(),
            max_msg,
            wake,
        );
        init(sender);
        watch(libc::SIGUSR1).unwrap();

        unsafe {
            libc::raise(libc::SIGUSR1);
        }
        std::thread::sleep(std::time::Duration::from_millis(50));

        let drained = queue.pop_all();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].type_id(), crate::bus::SIGNAL_FIRE);
    }
}
