//! # skein-timer
//!
//! A hierarchical timer wheel: one root ring of 256 slots stepped every
//! tick, backed by four cascading rings of 64 slots that re-sort their
//! contents down as the root wraps. Scheduling and cancellation are
//! lock-free from the caller's side (a command is appended to a
//! double-buffered queue); only the owning thread walks the wheel
//! itself.
//!
//! Sessions are versioned `(version << 32) | cookie` handles so a stale
//! session from a long-fired timer can never alias a new timer that
//! later reuses the same pool slot.

mod node;
mod session;
mod thread;
mod wheel;

pub use node::{HeadRef, Node, NodeState, NodePool, PAGE_SIZE};
pub use session::TimerSession;
pub use thread::{spawn_timer_thread, TimerThreadConfig, TimerThreadHandle};
pub use wheel::{TimerStat, TimerWheel, WheelConfig, SL_SIZE, SR_SIZE};
