//! The message bus: a dense, dynamically allocated `type_id` space and
//! the concrete payload types each subsystem posts onto it.
//!
//! Grounded on `message.h`'s `enum message_type`/`message_register`:
//! the original's handful of built-in types (`MESSAGE_TIMER_EXPIRE`,
//! `MESSAGE_SIGNAL_FIRE`, ...) plus `MESSAGE_CUSTOM` for anything an
//! embedding script registers later are both just entries in one
//! name -> id table, allocated at process startup rather than fixed
//! constants. `register_message_type` is that table's only write path.

use std::any::Any;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

/// Anything that can sit in the dispatch queue. `type_id` is looked up
/// in the `CallbackRegistry` to find the handler; `as_any` lets that
/// handler downcast to the concrete payload it expects.
pub trait Message: Send {
    fn type_id(&self) -> u32;
    fn as_any(&self) -> &dyn Any;
}

/// Process-wide name -> type_id table. One instance lives on the
/// `Runtime` and is shared (via `Arc`) with every producer thread that
/// needs to stamp outgoing messages with an id.
pub struct MessageTypeRegistry {
    next_id: AtomicU32,
    names: Mutex<Vec<&'static str>>,
}

impl MessageTypeRegistry {
    /// Registers the built-in types up front, in the order `message.h`
    /// declares its enum, so their ids are stable across a process's
    /// lifetime for a given build (nothing outside this process ever
    /// persists an id, so stability only needs to hold within one run).
    pub fn new() -> Self {
        let registry = Self {
            next_id: AtomicU32::new(0),
            names: Mutex::new(Vec::new()),
        };
        for name in BUILTIN_TYPE_NAMES {
            registry.register(name);
        }
        registry
    }

    /// Allocate (or look up) the id for `name`. Matches `message_register`:
    /// registering the same name twice returns the same id rather than
    /// growing the table.
    pub fn register(&self, name: &'static str) -> u32 {
        let mut names = self.names.lock().unwrap();
        if let Some(pos) = names.iter().position(|n| *n == name) {
            return pos as u32;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        names.push(name);
        id
    }

    pub fn name_of(&self, type_id: u32) -> Option<&'static str> {
        self.names.lock().unwrap().get(type_id as usize).copied()
    }

    pub fn count(&self) -> usize {
        self.names.lock().unwrap().len()
    }
}

impl Default for MessageTypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

const BUILTIN_TYPE_NAMES: &[&str] = &[
    "timer-expire",
    "signal-fire",
    "tcp-listen",
    "udp-listen",
    "socket-connect",
    "tcp-accept",
    "tcp-data",
    "udp-data",
    "socket-close",
];

pub const TIMER_EXPIRE: u32 = 0;
pub const SIGNAL_FIRE: u32 = 1;
pub const TCP_LISTEN: u32 = 2;
pub const UDP_LISTEN: u32 = 3;
pub const SOCKET_CONNECT: u32 = 4;
pub const TCP_ACCEPT: u32 = 5;
pub const TCP_DATA: u32 = 6;
pub const UDP_DATA: u32 = 7;
pub const SOCKET_CLOSE: u32 = 8;

macro_rules! message_impl {
    ($name:ident, $type_id:expr) => {
        impl Message for $name {
            fn type_id(&self) -> u32 {
                $type_id
            }
            fn as_any(&self) -> &dyn Any {
                self
            }
        }
    };
}

/// A one-shot timer fired. `session` is the `skein_timer::TimerSession`
/// bits, carried as a plain `u64` here so this crate does not need to
/// re-export the timer crate's handle type into the bus.
#[derive(Debug, Clone)]
pub struct TimerExpire {
    pub session: u64,
}
message_impl!(TimerExpire, TIMER_EXPIRE);

#[derive(Debug, Clone)]
pub struct SignalFire {
    pub signum: i32,
}
message_impl!(SignalFire, SIGNAL_FIRE);

#[derive(Debug, Clone)]
pub struct TcpListenResult {
    pub sid: u64,
    pub err: i32,
}
message_impl!(TcpListenResult, TCP_LISTEN);

#[derive(Debug, Clone)]
pub struct UdpListenResult {
    pub sid: u64,
    pub err: i32,
}
message_impl!(UdpListenResult, UDP_LISTEN);

#[derive(Debug, Clone)]
pub struct SocketConnectResult {
    pub sid: u64,
    pub err: i32,
}
message_impl!(SocketConnectResult, SOCKET_CONNECT);

#[derive(Debug, Clone)]
pub struct TcpAccept {
    pub sid: u64,
    pub listen_sid: u64,
    pub peer: SocketAddr,
}
message_impl!(TcpAccept, TCP_ACCEPT);

#[derive(Debug, Clone)]
pub struct TcpData {
    pub sid: u64,
    pub data: Vec<u8>,
}
message_impl!(TcpData, TCP_DATA);

#[derive(Debug, Clone)]
pub struct UdpData {
    pub sid: u64,
    pub data: Vec<u8>,
    pub peer: SocketAddr,
}
message_impl!(UdpData, UDP_DATA);

#[derive(Debug, Clone)]
pub struct SocketClose {
    pub sid: u64,
    pub err: i32,
}
message_impl!(SocketClose, SOCKET_CLOSE);

/// Convert a `skein_net::NetMessage` (sid-typed, address-typed) into the
/// boxed bus message a `Dispatcher` can queue. Kept here rather than in
/// `skein-net` since the bus's `type_id` space is this crate's concern.
pub fn from_net_message(msg: skein_net::NetMessage) -> Box<dyn Message> {
    use skein_net::NetMessage;
    match msg {
        NetMessage::Listen { sid, err } => Box::new(TcpListenResult {
            sid: u64::from(sid),
            err,
        }),
        NetMessage::Connect { sid, err } => Box::new(SocketConnectResult {
            sid: u64::from(sid),
            err,
        }),
        NetMessage::Accept {
            sid,
            listen_sid,
            peer,
        } => Box::new(TcpAccept {
            sid: u64::from(sid),
            listen_sid: u64::from(listen_sid),
            peer,
        }),
        NetMessage::TcpData { sid, data } => Box::new(TcpData {
            sid: u64::from(sid),
            data,
        }),
        NetMessage::UdpData { sid, data, peer } => Box::new(UdpData {
            sid: u64::from(sid),
            data,
            peer,
        }),
        NetMessage::Close { sid, err } => Box::new(SocketClose {
            sid: u64::from(sid),
            err,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_get_stable_ids() {
        let reg = MessageTypeRegistry::new();
        assert_eq!(reg.register("timer-expire"), TIMER_EXPIRE);
        assert_eq!(reg.register("tcp-data"), TCP_DATA);
        assert_eq!(reg.register("socket-close"), SOCKET_CLOSE);
    }

    #[test]
    fn custom_names_get_fresh_ids() {
        let reg = MessageTypeRegistry::new();
        let before = reg.count();
        let id = reg.register("custom-ping");
        assert_eq!(id, before as u32);
        // Re-registering the same name returns the same id, not a new one.
        assert_eq!(reg.register("custom-ping"), id);
        assert_eq!(reg.count(), before + 1);
    }

    #[test]
    fn message_downcasts_via_any() {
        let msg: Box<dyn Message> = Box::new(TcpData {
            sid: 7,
            data: vec![1, 2, 3],
        });
        assert_eq!(msg.type_id(), TCP_DATA);
        let data = msg.as_any().downcast_ref::<TcpData>().unwrap();
        assert_eq!(data.sid, 7);
        assert_eq!(data.data, vec![1, 2, 3]);
    }
}
