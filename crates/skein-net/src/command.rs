//! Commands queued from any thread to the reactor thread, one per original
//! `op_*` struct. Every socket syscall itself runs on the reactor thread;
//! callers only ever enqueue a command and (for the synchronous setup
//! calls) get a `SocketId` back immediately, mirroring the original's
//! split between the synchronous `socket_tcp_listen`-style entry points
//! and the asynchronous `op_tcp_listen`-style processing functions.

use std::net::SocketAddr;

use crate::sid::SocketId;

#[derive(Debug)]
pub enum Command {
    TcpListen { sid: SocketId },
    UdpListen { sid: SocketId },
    TcpConnect { sid: SocketId, addr: SocketAddr },
    UdpConnect { sid: SocketId },
    TcpSend { sid: SocketId, data: Vec<u8> },
    UdpSend {
        sid: SocketId,
        data: Vec<u8>,
        addr: Option<SocketAddr>,
    },
    ReadEnable { sid: SocketId, enable: bool },
    Close { sid: SocketId },
    Exit,
}
