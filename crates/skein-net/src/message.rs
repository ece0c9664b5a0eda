//! Messages the reactor posts to the bus, one per original `message_*`
//! struct. Addresses are plain `std::net::SocketAddr` here instead of the
//! original's `sockaddr_full` byte union — the embedding worker thread
//! wants a typed address, not a buffer it has to `ntop` itself.

use std::net::SocketAddr;

use crate::sid::SocketId;

#[derive(Debug, Clone)]
pub enum NetMessage {
    /// A listening socket finished (or failed) its `listen(2)` setup.
    Listen { sid: SocketId, err: i32 },
    /// A connecting socket finished (or failed) its handshake.
    Connect { sid: SocketId, err: i32 },
    /// A new TCP connection was accepted off a listening socket.
    Accept {
        sid: SocketId,
        listen_sid: SocketId,
        peer: SocketAddr,
    },
    /// Bytes arrived on a TCP connection.
    TcpData { sid: SocketId, data: Vec<u8> },
    /// A UDP datagram arrived.
    UdpData {
        sid: SocketId,
        data: Vec<u8>,
        peer: SocketAddr,
    },
    /// A TCP connection was torn down, with the errno that caused it (0 for
    /// a clean, application-requested close).
    Close { sid: SocketId, err: i32 },
}

impl NetMessage {
    pub fn sid(&self) -> SocketId {
        match self {
            NetMessage::Listen { sid, .. }
            | NetMessage::Connect { sid, .. }
            | NetMessage::Accept { sid, .. }
            | NetMessage::TcpData { sid, .. }
            | NetMessage::UdpData { sid, .. }
            | NetMessage::Close { sid, .. } => *sid,
        }
    }
}
