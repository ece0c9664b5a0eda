//! The reactor: owns the epoll instance, the socket pool, and the command
//! queue, and is the only thing allowed to touch a socket's fd once it has
//! been handed to the poller. Every public method here may be called from
//! any thread; the actual syscalls run later, on whichever thread drives
//! [`Reactor::run_once`].
//!
//! Grounded on `silly_socket.c`'s `socket_poll`/`op_process` pair: one
//! `epoll_wait`, then drain queued commands, then walk the ready list
//! dispatching accept/read/write/error/eof handling per socket type.

use std::cell::Cell;
use std::net::SocketAddr;
use std::os::fd::{BorrowedFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};

use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};

use skein_core::{klog_error, FlipBuf};
use skein_error::codes::{
    errno_to_global_id, ERR_SKEIN_CLOSED, ERR_SKEIN_CLOSING, ERR_SKEIN_EOF,
    ERR_SKEIN_POOL_EXHAUSTED, SYS_SKEIN_NET, UC_BIND, UC_CLOSE, UC_CONNECT, UC_LISTEN, UC_SEND,
};
use skein_error::{GError, GResult, GlobalId};

use crate::addr;
use crate::command::Command;
use crate::message::NetMessage;
use crate::pool::{state, SocketKind, SocketPool, SocketSlot};
use crate::sid::SocketId;
use crate::trigger::Trigger;

const DEFAULT_EVENT_CAPACITY: usize = 128;
const DEFAULT_READ_BUF_SIZE: usize = 65536;
const MAX_UDP_PACKET: usize = 65507;

#[derive(Debug, Clone, Copy)]
pub struct ReactorConfig {
    pub event_capacity: usize,
    pub read_buf_size: usize,
    pub listen_backlog: i32,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            event_capacity: DEFAULT_EVENT_CAPACITY,
            read_buf_size: DEFAULT_READ_BUF_SIZE,
            listen_backlog: 512,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NetStat {
    pub connecting: u64,
    pub tcp_clients: u64,
    pub recv_bytes: u64,
    pub send_bytes: u64,
    pub op_requested: u64,
    pub op_processed: u64,
}

#[derive(Default)]
struct Counters {
    connecting: AtomicU64,
    tcp_clients: AtomicU64,
    recv_bytes: AtomicU64,
    send_bytes: AtomicU64,
    op_requested: AtomicU64,
    op_processed: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> NetStat {
        NetStat {
            connecting: self.connecting.load(Ordering::Relaxed),
            tcp_clients: self.tcp_clients.load(Ordering::Relaxed),
            recv_bytes: self.recv_bytes.load(Ordering::Relaxed),
            send_bytes: self.send_bytes.load(Ordering::Relaxed),
            op_requested: self.op_requested.load(Ordering::Relaxed),
            op_processed: self.op_processed.load(Ordering::Relaxed),
        }
    }
}

fn os_err(user_code: GlobalId) -> GError {
    let errno = std::io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(0);
    GError::simple(SYS_SKEIN_NET, errno_to_global_id(errno), user_code)
}

fn set_nonblock(fd: RawFd) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
    }
}

fn set_nodelay(fd: RawFd) {
    let on: i32 = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &on as *const _ as *const libc::c_void,
            std::mem::size_of::<i32>() as u32,
        );
    }
}

fn set_keepalive(fd: RawFd) {
    let on: i32 = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_KEEPALIVE,
            &on as *const _ as *const libc::c_void,
            std::mem::size_of::<i32>() as u32,
        );
    }
}

fn set_reuseaddr(fd: RawFd) {
    let on: i32 = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &on as *const _ as *const libc::c_void,
            std::mem::size_of::<i32>() as u32,
        );
    }
}

fn close_fd(fd: RawFd) {
    if fd >= 0 {
        unsafe {
            libc::close(fd);
        }
    }
}

fn new_socket(addr: &SocketAddr, sock_type: i32) -> Result<RawFd, GError> {
    let family = if addr.is_ipv4() {
        libc::AF_INET
    } else {
        libc::AF_INET6
    };
    let fd = unsafe { libc::socket(family, sock_type, 0) };
    if fd < 0 {
        return Err(os_err(UC_BIND));
    }
    Ok(fd)
}

fn bind_fd(fd: RawFd, addr: &SocketAddr) -> Result<(), GError> {
    let (storage, len) = addr::to_raw(addr);
    let ret = unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) };
    if ret != 0 {
        return Err(os_err(UC_BIND));
    }
    Ok(())
}

/// The reactor thread's epoll instance, socket pool and command queue.
/// Owned by an `Arc` shared between the spawning code and the spawned
/// thread; every field is either atomic (`Counters`, the pool's per-slot
/// `sid`) or single-writer, touched only from [`Reactor::run_once`].
pub struct Reactor {
    epoll: Epoll,
    reservefd: Cell<RawFd>,
    pool: SocketPool,
    trigger: Trigger,
    cmdbuf: FlipBuf<Command>,
    counters: Counters,
    config: ReactorConfig,
    on_message: Box<dyn Fn(NetMessage) + Send + Sync>,
}

// `reservefd` is a Cell only ever written by the reactor thread; every
// other field is either atomic or internally synchronized.
unsafe impl Sync for Reactor {}

impl Reactor {
    pub fn new(
        config: ReactorConfig,
        on_message: impl Fn(NetMessage) + Send + Sync + 'static,
    ) -> std::io::Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::empty())?;
        let trigger = Trigger::new()?;
        let pool = SocketPool::new();

        let ctrl_sid = pool
            .alloc(trigger.fd(), SocketKind::PipeCtrl)
            .expect("pool has room for the control socket");
        let ctrl_slot = pool.get(ctrl_sid).expect("just allocated");
        let borrowed = unsafe { BorrowedFd::borrow_raw(trigger.fd()) };
        epoll.add(
            borrowed,
            EpollEvent::new(EpollFlags::EPOLLIN, ctrl_sid.index() as u64),
        )?;
        ctrl_slot.set_state(state::POLLING | state::READING);

        let reservefd = unsafe { libc::open(c"/dev/null".as_ptr(), libc::O_RDONLY) };

        Ok(Self {
            epoll,
            reservefd: Cell::new(reservefd),
            pool,
            trigger,
            cmdbuf: FlipBuf::new(),
            counters: Counters::default(),
            config,
            on_message: Box::new(on_message),
        })
    }

    pub fn stat(&self) -> NetStat {
        self.counters.snapshot()
    }

    fn push(&self, cmd: Command) {
        self.counters.op_requested.fetch_add(1, Ordering::Relaxed);
        if self.cmdbuf.write(cmd) {
            self.trigger.fire();
        }
    }

    fn emit(&self, msg: NetMessage) {
        (self.on_message)(msg);
    }

    // ── Public, any-thread entry points ────────────────────────────

    pub fn tcp_listen(&self, addr: SocketAddr) -> GResult<SocketId> {
        let fd = new_socket(&addr, libc::SOCK_STREAM | libc::SOCK_CLOEXEC)?;
        set_reuseaddr(fd);
        if let Err(e) = bind_fd(fd, &addr) {
            close_fd(fd);
            return Err(e);
        }
        set_nonblock(fd);
        let ret = unsafe { libc::listen(fd, self.config.listen_backlog) };
        if ret != 0 {
            let e = os_err(UC_LISTEN);
            close_fd(fd);
            return Err(e);
        }
        let sid = self.pool.alloc(fd, SocketKind::TcpListen).ok_or_else(|| {
            close_fd(fd);
            GError::simple(SYS_SKEIN_NET, ERR_SKEIN_POOL_EXHAUSTED, UC_LISTEN)
        })?;
        self.pool.get(sid).unwrap().set_state(state::PENDING);
        self.push(Command::TcpListen { sid });
        Ok(sid)
    }

    pub fn udp_bind(&self, addr: SocketAddr) -> GResult<SocketId> {
        let fd = new_socket(&addr, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC)?;
        if let Err(e) = bind_fd(fd, &addr) {
            close_fd(fd);
            return Err(e);
        }
        set_nonblock(fd);
        let sid = self.pool.alloc(fd, SocketKind::UdpListen).ok_or_else(|| {
            close_fd(fd);
            GError::simple(SYS_SKEIN_NET, ERR_SKEIN_POOL_EXHAUSTED, UC_BIND)
        })?;
        self.pool.get(sid).unwrap().set_state(state::PENDING);
        self.push(Command::UdpListen { sid });
        Ok(sid)
    }

    pub fn tcp_connect(&self, addr: SocketAddr, bind_addr: Option<SocketAddr>) -> GResult<SocketId> {
        let fd = new_socket(&addr, libc::SOCK_STREAM | libc::SOCK_CLOEXEC)?;
        if let Some(b) = bind_addr {
            if let Err(e) = bind_fd(fd, &b) {
                close_fd(fd);
                return Err(e);
            }
        }
        let sid = self
            .pool
            .alloc(fd, SocketKind::TcpConnection)
            .ok_or_else(|| {
                close_fd(fd);
                GError::simple(SYS_SKEIN_NET, ERR_SKEIN_POOL_EXHAUSTED, UC_CONNECT)
            })?;
        self.pool.get(sid).unwrap().set_state(state::PENDING);
        self.push(Command::TcpConnect { sid, addr });
        Ok(sid)
    }

    pub fn udp_connect(&self, addr: SocketAddr, bind_addr: Option<SocketAddr>) -> GResult<SocketId> {
        let fd = new_socket(&addr, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC)?;
        if let Some(b) = bind_addr {
            if let Err(e) = bind_fd(fd, &b) {
                close_fd(fd);
                return Err(e);
            }
        }
        let (storage, len) = addr::to_raw(&addr);
        let ret = unsafe { libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len) };
        if ret != 0 {
            let e = os_err(UC_CONNECT);
            close_fd(fd);
            return Err(e);
        }
        let sid = self
            .pool
            .alloc(fd, SocketKind::UdpConnection)
            .ok_or_else(|| {
                close_fd(fd);
                GError::simple(SYS_SKEIN_NET, ERR_SKEIN_POOL_EXHAUSTED, UC_CONNECT)
            })?;
        self.pool.get(sid).unwrap().set_state(state::PENDING);
        self.push(Command::UdpConnect { sid });
        Ok(sid)
    }

    pub fn tcp_send(&self, sid: SocketId, data: Vec<u8>) -> GResult<()> {
        let slot = self
            .pool
            .get(sid)
            .ok_or_else(|| GError::simple(SYS_SKEIN_NET, ERR_SKEIN_CLOSED, UC_SEND))?;
        slot.wlbytes.fetch_add(data.len(), Ordering::Relaxed);
        self.push(Command::TcpSend { sid, data });
        Ok(())
    }

    pub fn udp_send(&self, sid: SocketId, data: Vec<u8>, addr: Option<SocketAddr>) -> GResult<()> {
        let slot = self
            .pool
            .get(sid)
            .ok_or_else(|| GError::simple(SYS_SKEIN_NET, ERR_SKEIN_CLOSED, UC_SEND))?;
        slot.wlbytes.fetch_add(data.len(), Ordering::Relaxed);
        self.push(Command::UdpSend { sid, data, addr });
        Ok(())
    }

    /// The address a listening or connected socket is bound to. Mainly
    /// useful right after `tcp_listen`/`udp_bind` with port `0`, to learn
    /// which ephemeral port the kernel actually assigned.
    pub fn local_addr(&self, sid: SocketId) -> GResult<SocketAddr> {
        let slot = self
            .pool
            .get(sid)
            .ok_or_else(|| GError::simple(SYS_SKEIN_NET, ERR_SKEIN_CLOSED, UC_BIND))?;
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockname(slot.fd(), &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
        };
        if ret != 0 {
            return Err(os_err(UC_BIND));
        }
        addr::from_raw(&storage, len).ok_or_else(|| GError::simple(SYS_SKEIN_NET, ERR_SKEIN_CLOSED, UC_BIND))
    }

    pub fn read_enable(&self, sid: SocketId, enable: bool) {
        if self.pool.get(sid).is_none() {
            return;
        }
        self.push(Command::ReadEnable { sid, enable });
    }

    pub fn close(&self, sid: SocketId) -> GResult<()> {
        let slot = self
            .pool
            .get(sid)
            .ok_or_else(|| GError::simple(SYS_SKEIN_NET, ERR_SKEIN_CLOSED, UC_CLOSE))?;
        if slot.test_state(state::CLOSING) {
            return Err(GError::simple(SYS_SKEIN_NET, ERR_SKEIN_CLOSING, UC_CLOSE));
        }
        slot.set_state(state::CLOSING | state::MUTECLOSE);
        self.push(Command::Close { sid });
        Ok(())
    }

    pub fn request_exit(&self) {
        self.push(Command::Exit);
    }

    // ── Reactor-thread-only loop ────────────────────────────────────

    /// Run one `epoll_wait` cycle plus the command queue it unblocks.
    /// Returns `false` once `Command::Exit` has been processed.
    pub fn run_once(&self, timeout_ms: Option<u16>) -> bool {
        let mut events = vec![EpollEvent::empty(); self.config.event_capacity];
        let timeout = match timeout_ms {
            Some(ms) => EpollTimeout::try_from(ms as i32).unwrap_or(EpollTimeout::NONE),
            None => EpollTimeout::NONE,
        };
        let n = match self.epoll.wait(&mut events, timeout) {
            Ok(n) => n,
            Err(nix::errno::Errno::EINTR) => return true,
            Err(e) => {
                klog_error!("epoll_wait failed: {}", e);
                return true;
            }
        };

        if !self.process_commands() {
            return false;
        }

        let mut readbuf = vec![0u8; self.config.read_buf_size];
        for ev in &events[..n] {
            self.dispatch_event(ev, &mut readbuf);
        }
        true
    }

    fn process_commands(&self) -> bool {
        if !self.trigger.consume() {
            return true;
        }
        for cmd in self.cmdbuf.flip() {
            self.counters.op_processed.fetch_add(1, Ordering::Relaxed);
            match cmd {
                Command::Exit => return false,
                Command::TcpListen { sid } => self.op_tcp_listen(sid),
                Command::UdpListen { sid } => self.op_udp_listen(sid),
                Command::TcpConnect { sid, addr } => self.op_tcp_connect(sid, addr),
                Command::UdpConnect { sid } => self.op_udp_connect(sid),
                Command::TcpSend { sid, data } => self.op_tcp_send(sid, data),
                Command::UdpSend { sid, data, addr } => self.op_udp_send(sid, data, addr),
                Command::ReadEnable { sid, enable } => self.op_read_enable(sid, enable),
                Command::Close { sid } => self.op_close(sid),
            }
        }
        true
    }

    fn add_to_poll(&self, sid: SocketId, fd: RawFd) -> nix::Result<()> {
        let slot = self.pool.get(sid).unwrap();
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        self.epoll
            .add(borrowed, EpollEvent::new(EpollFlags::EPOLLIN, sid.index() as u64))?;
        slot.set_state(state::POLLING | state::READING);
        Ok(())
    }

    fn remove_from_poll(&self, sid: SocketId, fd: RawFd) {
        let slot = self.pool.get(sid).unwrap();
        if !slot.test_state(state::POLLING) {
            return;
        }
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let _ = self.epoll.delete(borrowed);
        slot.clr_state(state::POLLING | state::READING | state::WRITING);
        close_fd(fd);
        slot.fd.set(-1);
    }

    /// Emit a `Close` message at most once per socket, mirroring
    /// `report_close`'s mute-close gate. `op_close` doesn't always free a
    /// slot right away — a socket with a non-empty write list at app-`close()`
    /// time is only stopped from reading, and stays alive until its writes
    /// drain — so without this gate a trailing EOF/error event on that same
    /// socket would report a second, spurious close.
    fn report_close(&self, sid: SocketId, slot: &SocketSlot, err: i32) {
        if slot.test_and_set_state(state::MUTECLOSE) {
            return;
        }
        self.emit(NetMessage::Close { sid, err });
    }

    fn free_socket(&self, sid: SocketId) {
        let fd = self.pool.get(sid).unwrap().fd();
        self.remove_from_poll(sid, fd);
        self.pool.free(sid);
    }

    /// A socket whose peer went away mid-write: stop polling it but keep
    /// the slot (and its pending write-list) alive until the application
    /// explicitly closes it, mirroring `zombine_socket`.
    fn zombify(&self, sid: SocketId) {
        let slot = self.pool.get(sid).unwrap();
        if slot.test_state(state::CLOSING) {
            self.free_socket(sid);
            return;
        }
        let fd = slot.fd();
        self.remove_from_poll(sid, fd);
        slot.set_state(state::ZOMBIE);
    }

    fn rw_enable(&self, sid: SocketId, bits: u32, enable: bool) {
        let slot = self.pool.get(sid).unwrap();
        if slot.test_state(bits) == enable {
            return;
        }
        if enable {
            slot.set_state(bits);
        } else {
            slot.clr_state(bits);
        }
        let mut flags = EpollFlags::empty();
        if slot.test_state(state::READING) {
            flags |= EpollFlags::EPOLLIN;
        }
        if slot.test_state(state::WRITING) {
            flags |= EpollFlags::EPOLLOUT;
        }
        let borrowed = unsafe { BorrowedFd::borrow_raw(slot.fd()) };
        let _ = self
            .epoll
            .modify(borrowed, &mut EpollEvent::new(flags, sid.index() as u64));
    }

    fn write_enable(&self, sid: SocketId, enable: bool) {
        self.rw_enable(sid, state::WRITING, enable);
    }

    fn read_enable_internal(&self, sid: SocketId, enable: bool) {
        self.rw_enable(sid, state::READING, enable);
    }

    fn op_tcp_listen(&self, sid: SocketId) {
        let slot = self.pool.get(sid).unwrap();
        if let Err(e) = self.add_to_poll(sid, slot.fd()) {
            klog_error!("tcp listen add_to_poll failed: {}", e);
            self.emit(NetMessage::Listen {
                sid,
                err: e as i32,
            });
            self.free_socket(sid);
            return;
        }
        slot.clr_state(state::PENDING);
        self.emit(NetMessage::Listen { sid, err: 0 });
    }

    fn op_udp_listen(&self, sid: SocketId) {
        self.op_tcp_listen(sid); // identical add-to-poll/report choreography
    }

    fn op_tcp_connect(&self, sid: SocketId, addr: SocketAddr) {
        let slot = self.pool.get(sid).unwrap();
        let fd = slot.fd();
        set_nonblock(fd);
        set_keepalive(fd);
        set_nodelay(fd);
        let (storage, len) = addr::to_raw(&addr);
        let ret = unsafe { libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len) };
        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        if ret == -1 && errno != libc::EINPROGRESS {
            self.emit(NetMessage::Connect { sid, err: errno });
            self.free_socket(sid);
            return;
        }
        if let Err(e) = self.add_to_poll(sid, fd) {
            self.emit(NetMessage::Connect {
                sid,
                err: e as i32,
            });
            self.free_socket(sid);
            return;
        }
        if ret == 0 {
            slot.clr_state(state::PENDING);
            self.counters.tcp_clients.fetch_add(1, Ordering::Relaxed);
            self.emit(NetMessage::Connect { sid, err: 0 });
            if !slot.wlist_empty() {
                self.write_enable(sid, true);
            }
        } else {
            self.write_enable(sid, true);
            self.counters.connecting.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn op_udp_connect(&self, sid: SocketId) {
        let slot = self.pool.get(sid).unwrap();
        slot.clr_state(state::PENDING);
        if let Err(e) = self.add_to_poll(sid, slot.fd()) {
            self.emit(NetMessage::Connect {
                sid,
                err: e as i32,
            });
            self.free_socket(sid);
            return;
        }
        self.emit(NetMessage::Connect { sid, err: 0 });
    }

    fn op_tcp_send(&self, sid: SocketId, data: Vec<u8>) {
        let slot = match self.pool.get(sid) {
            Some(s) => s,
            None => return,
        };
        let sz = data.len();
        self.counters.send_bytes.fetch_add(sz as u64, Ordering::Relaxed);
        let connecting = slot.test_state(state::PENDING);
        if slot.wlist_empty() && !connecting {
            match send_all_now(slot.fd(), &data) {
                Ok(n) if n == sz => {
                    slot.wlbytes.fetch_sub(sz, Ordering::Relaxed);
                }
                Ok(n) => {
                    slot.wlbytes.fetch_sub(n, Ordering::Relaxed);
                    enqueue_write(slot, data, n, None);
                    self.write_enable(sid, true);
                }
                Err(_) => {
                    slot.wlbytes.fetch_sub(sz, Ordering::Relaxed);
                    let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
                    self.report_close(sid, slot, errno);
                    self.zombify(sid);
                }
            }
        } else {
            enqueue_write(slot, data, 0, None);
        }
    }

    fn op_udp_send(&self, sid: SocketId, data: Vec<u8>, addr: Option<SocketAddr>) {
        let slot = match self.pool.get(sid) {
            Some(s) => s,
            None => return,
        };
        let sz = data.len();
        self.counters.send_bytes.fetch_add(sz as u64, Ordering::Relaxed);
        if slot.wlist_empty() {
            match send_udp_now(slot.fd(), &data, addr.as_ref()) {
                SendUdpResult::Done => {
                    slot.wlbytes.fetch_sub(sz, Ordering::Relaxed);
                }
                SendUdpResult::WouldBlock => {
                    enqueue_write(slot, data, 0, addr);
                    self.write_enable(sid, true);
                }
                SendUdpResult::Error => {
                    slot.wlbytes.fetch_sub(sz, Ordering::Relaxed);
                }
            }
        } else {
            enqueue_write(slot, data, 0, addr);
        }
    }

    fn op_read_enable(&self, sid: SocketId, enable: bool) {
        if self.pool.get(sid).is_none() {
            return;
        }
        self.read_enable_internal(sid, enable);
    }

    fn op_close(&self, sid: SocketId) {
        let slot = match self.pool.get(sid) {
            Some(s) => s,
            None => return,
        };
        if slot.wlist_empty() {
            if slot.kind() == SocketKind::TcpConnection {
                self.counters.tcp_clients.fetch_sub(1, Ordering::Relaxed);
            }
            self.free_socket(sid);
        } else {
            self.read_enable_internal(sid, false);
        }
    }

    fn dispatch_event(&self, ev: &EpollEvent, readbuf: &mut [u8]) {
        let index = ev.data() as u32;
        let sid = match self.pool.slot_sid_unchecked(index) {
            Some(s) => s,
            None => return,
        };
        let slot = match self.pool.get(sid) {
            Some(s) => s,
            None => return,
        };
        if slot.test_state(state::ZOMBIE) {
            return;
        }
        let flags = ev.events();
        match slot.kind() {
            SocketKind::TcpListen => {
                self.exec_accept(sid);
            }
            SocketKind::TcpConnection => {
                self.dispatch_tcp(sid, flags, readbuf);
            }
            SocketKind::UdpListen | SocketKind::UdpConnection => {
                self.dispatch_udp(sid, flags, readbuf);
            }
            SocketKind::PipeCtrl | SocketKind::Reserved => {}
        }
    }

    fn exec_accept(&self, listen_sid: SocketId) {
        let listen_slot = self.pool.get(listen_sid).unwrap();
        let listen_fd = listen_slot.fd();
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let fd = unsafe {
            libc::accept4(
                listen_fd,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        };
        if fd < 0 {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            if errno != libc::EMFILE && errno != libc::ENFILE {
                return;
            }
            // Fd-reservation trick: give up our spare fd so accept() can
            // succeed once more, immediately reject the connection, then
            // reopen the spare so the next exhaustion is also caught.
            close_fd(self.reservefd.get());
            let junk = unsafe { libc::accept(listen_fd, std::ptr::null_mut(), std::ptr::null_mut()) };
            close_fd(junk);
            klog_error!("accept reached the file descriptor limit");
            self.reservefd
                .set(unsafe { libc::open(c"/dev/null".as_ptr(), libc::O_RDONLY) });
            return;
        }
        set_keepalive(fd);
        set_nodelay(fd);
        let sid = match self.pool.alloc(fd, SocketKind::TcpConnection) {
            Some(s) => s,
            None => {
                klog_error!("accept: socket pool exhausted");
                close_fd(fd);
                return;
            }
        };
        if self.add_to_poll(sid, fd).is_err() {
            self.free_socket(sid);
            return;
        }
        let peer = addr::from_raw(&storage, len).unwrap_or_else(|| "0.0.0.0:0".parse().unwrap());
        self.counters.tcp_clients.fetch_add(1, Ordering::Relaxed);
        self.emit(NetMessage::Accept {
            sid,
            listen_sid,
            peer,
        });
    }

    fn dispatch_tcp(&self, sid: SocketId, flags: EpollFlags, readbuf: &mut [u8]) {
        let slot = self.pool.get(sid).unwrap();
        if slot.test_state(state::PENDING) {
            slot.clr_state(state::PENDING);
            self.counters.connecting.fetch_sub(1, Ordering::Relaxed);
            self.check_connected(sid);
            return;
        }

        let mut eof = false;
        let mut err = 0i32;
        let mut has_data = false;

        if flags.contains(EpollFlags::EPOLLIN) {
            match read_tcp(slot.fd(), readbuf) {
                TcpRead::Data(n) => {
                    self.counters.recv_bytes.fetch_add(n as u64, Ordering::Relaxed);
                    self.emit(NetMessage::TcpData {
                        sid,
                        data: readbuf[..n].to_vec(),
                    });
                    has_data = n >= readbuf.len();
                }
                TcpRead::WouldBlock => {}
                TcpRead::Eof => eof = true,
                TcpRead::Error(e) => err = e,
            }
        }
        if flags.contains(EpollFlags::EPOLLOUT) {
            if let Err(e) = self.flush_tcp(sid) {
                err = e;
            }
        }
        if has_data {
            return;
        }
        if err == 0 && flags.contains(EpollFlags::EPOLLERR) {
            err = socket_error(slot.fd());
        }
        if err != 0 {
            self.report_close(sid, slot, err);
            self.zombify(sid);
        } else if eof || flags.contains(EpollFlags::EPOLLHUP) {
            self.report_close(sid, slot, ERR_SKEIN_EOF.code as i32);
            self.read_enable_internal(sid, false);
        }
    }

    fn dispatch_udp(&self, sid: SocketId, flags: EpollFlags, readbuf: &mut [u8]) {
        if flags.contains(EpollFlags::EPOLLIN) {
            self.read_udp_once(sid, readbuf);
        }
        if flags.contains(EpollFlags::EPOLLOUT) {
            let _ = self.flush_udp(sid);
        }
        if flags.contains(EpollFlags::EPOLLERR) {
            let slot = self.pool.get(sid).unwrap();
            let err = socket_error(slot.fd());
            self.report_close(sid, slot, err);
            self.zombify(sid);
        }
    }

    fn check_connected(&self, sid: SocketId) {
        let slot = self.pool.get(sid).unwrap();
        let err = socket_error(slot.fd());
        if err != 0 {
            self.emit(NetMessage::Connect { sid, err });
            self.free_socket(sid);
            return;
        }
        if slot.wlist_empty() {
            self.write_enable(sid, false);
        }
        self.counters.tcp_clients.fetch_add(1, Ordering::Relaxed);
        self.emit(NetMessage::Connect { sid, err: 0 });
    }

    fn flush_tcp(&self, sid: SocketId) -> Result<(), i32> {
        let slot = self.pool.get(sid).unwrap();
        loop {
            let (done, sent) = {
                let mut wlist = slot.wlist.borrow_mut();
                let chunk = match wlist.front_mut() {
                    Some(c) => c,
                    None => return Ok(()),
                };
                match send_all_now(slot.fd(), &chunk.data[chunk.offset..]) {
                    Ok(n) => {
                        chunk.offset += n;
                        slot.wlbytes.fetch_sub(n, Ordering::Relaxed);
                        (chunk.offset >= chunk.data.len(), n)
                    }
                    Err(_) => return Err(std::io::Error::last_os_error().raw_os_error().unwrap_or(0)),
                }
            };
            let _ = sent;
            if !done {
                return Ok(());
            }
            slot.wlist.borrow_mut().pop_front();
            if slot.wlist_empty() {
                self.write_enable(sid, false);
                if slot.test_state(state::CLOSING) {
                    self.counters.tcp_clients.fetch_sub(1, Ordering::Relaxed);
                    self.free_socket(sid);
                }
                return Ok(());
            }
        }
    }

    fn flush_udp(&self, sid: SocketId) -> Result<(), ()> {
        let slot = self.pool.get(sid).unwrap();
        loop {
            let done_all = {
                let mut wlist = slot.wlist.borrow_mut();
                let chunk = match wlist.front() {
                    Some(c) => c,
                    None => return Ok(()),
                };
                match send_udp_now(slot.fd(), &chunk.data, chunk.addr.as_ref()) {
                    SendUdpResult::WouldBlock => return Ok(()),
                    SendUdpResult::Done | SendUdpResult::Error => {
                        slot.wlbytes.fetch_sub(chunk.data.len(), Ordering::Relaxed);
                        true
                    }
                }
            };
            if done_all {
                slot.wlist.borrow_mut().pop_front();
            }
            if slot.wlist_empty() {
                self.write_enable(sid, false);
                if slot.test_state(state::CLOSING) {
                    self.free_socket(sid);
                }
                return Ok(());
            }
        }
    }

    fn read_udp_once(&self, sid: SocketId, buf: &mut [u8]) {
        let slot = self.pool.get(sid).unwrap();
        let cap = buf.len().min(MAX_UDP_PACKET);
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let n = unsafe {
            libc::recvfrom(
                slot.fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                cap,
                0,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        };
        if n < 0 {
            return;
        }
        let peer = match addr::from_raw(&storage, len) {
            Some(p) => p,
            None => return,
        };
        self.counters.recv_bytes.fetch_add(n as u64, Ordering::Relaxed);
        self.emit(NetMessage::UdpData {
            sid,
            data: buf[..n as usize].to_vec(),
            peer,
        });
    }
}

fn socket_error(fd: RawFd) -> i32 {
    let mut err: i32 = 0;
    let mut len = std::mem::size_of::<i32>() as libc::socklen_t;
    unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        );
    }
    err
}

fn send_all_now(fd: RawFd, buf: &[u8]) -> std::io::Result<usize> {
    loop {
        let n = unsafe { libc::send(fd, buf.as_ptr() as *const libc::c_void, buf.len(), 0) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let errno = std::io::Error::last_os_error();
        match errno.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::EAGAIN) => return Ok(0),
            _ => return Err(errno),
        }
    }
}

enum SendUdpResult {
    Done,
    WouldBlock,
    Error,
}

fn send_udp_now(fd: RawFd, buf: &[u8], addr: Option<&SocketAddr>) -> SendUdpResult {
    let (storage, len) = match addr {
        Some(a) => {
            let (s, l) = addr::to_raw(a);
            (Some(s), l)
        }
        None => (None, 0),
    };
    loop {
        let (sa_ptr, sa_len) = match &storage {
            Some(s) => (s as *const _ as *const libc::sockaddr, len),
            None => (std::ptr::null(), 0),
        };
        let n = unsafe {
            libc::sendto(
                fd,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                0,
                sa_ptr,
                sa_len,
            )
        };
        if n >= 0 {
            return SendUdpResult::Done;
        }
        let errno = std::io::Error::last_os_error();
        match errno.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::EAGAIN) => return SendUdpResult::WouldBlock,
            _ => return SendUdpResult::Error,
        }
    }
}

enum TcpRead {
    Data(usize),
    WouldBlock,
    Eof,
    Error(i32),
}

fn read_tcp(fd: RawFd, buf: &mut [u8]) -> TcpRead {
    loop {
        let n = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
        if n < 0 {
            let errno = std::io::Error::last_os_error();
            return match errno.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) => TcpRead::WouldBlock,
                Some(e) => TcpRead::Error(e),
                None => TcpRead::Error(0),
            };
        } else if n == 0 {
            return TcpRead::Eof;
        }
        return TcpRead::Data(n as usize);
    }
}

fn enqueue_write(
    slot: &crate::pool::SocketSlot,
    data: Vec<u8>,
    offset: usize,
    addr: Option<SocketAddr>,
) {
    slot.wlist.borrow_mut().push_back(crate::pool::WriteChunk {
        data,
        offset,
        addr,
    });
}
