//! # skein-net
//!
//! An epoll-based socket reactor: one thread owns the poller and a
//! versioned, fixed-capacity pool of sockets, reachable from any other
//! thread via a small set of synchronous setup calls (`tcp_listen`,
//! `tcp_connect`, ...) that each return a [`SocketId`] immediately and
//! queue the async half of the work onto the reactor thread.
//!
//! Results come back as [`NetMessage`]s delivered through a callback
//! supplied at construction, rather than a return value, since accept/
//! read/connect-completion all happen on the reactor's own schedule.

mod addr;
mod command;
mod message;
mod pool;
mod reactor;
mod sid;
mod thread;
mod trigger;

pub use command::Command;
pub use message::NetMessage;
pub use pool::{state, SocketKind, SocketPool, SocketSlot};
pub use reactor::{NetStat, Reactor, ReactorConfig};
pub use sid::{SocketId, POOL_SIZE};
pub use thread::{spawn_reactor_thread, ReactorThreadConfig, ReactorThreadHandle};
pub use trigger::Trigger;
