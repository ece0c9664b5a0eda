//! # skein-rt
//!
//! The worker/dispatch engine: a message bus with a dense `type_id`
//! keyed callback table, a single-threaded Worker that drains it in
//! batches against an embedding application's scripting context, a
//! Monitor that watches the Worker's dispatch-generation counter for
//! stalls, and the `Runtime` that spawns all of this alongside the
//! socket reactor and timer wheel from the sibling crates.
//!
//! Everything here assumes an embedding application provides the
//! actual interpreter behind [`ScriptContext`] — this crate only owns
//! the thread choreography, the queue, and the callback dispatch.

mod bus;
mod config;
mod dispatcher;
mod monitor;
mod queue;
mod registry;
mod runtime;
pub mod signal;

pub use bus::{
    from_net_message, Message, MessageTypeRegistry, SignalFire, SocketClose, SocketConnectResult,
    TcpAccept, TcpData, TcpListenResult, TimerExpire, UdpData, UdpListenResult, SIGNAL_FIRE,
    SOCKET_CLOSE, SOCKET_CONNECT, TCP_ACCEPT, TCP_DATA, TCP_LISTEN, TIMER_EXPIRE, UDP_DATA,
    UDP_LISTEN,
};
pub use config::{ConfigError, RuntimeConfig};
pub use dispatcher::{
    spawn_dispatcher, DiagnosticHook, DispatcherConfig, DispatcherHandle, DispatcherSender,
};
pub use monitor::Monitor;
pub use queue::MessageQueue;
pub use registry::{Callback, CallbackRegistry, ScriptContext};
pub use runtime::{NullDiagnosticHook, Runtime, RuntimeBuilder};
