//! OS thread that owns a `Reactor` and drives its `run_once()` loop.
//!
//! Mirrors the timer thread's spawn/shutdown/stats idiom: a named
//! `thread::Builder`, an `AtomicBool` shutdown flag, and a join handle
//! that hands back final stats.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use skein_core::kprint::set_component;
use skein_error::GResult;

use crate::message::NetMessage;
use crate::reactor::{NetStat, Reactor, ReactorConfig};
use crate::sid::SocketId;

#[derive(Debug, Clone)]
pub struct ReactorThreadConfig {
    pub thread_name: String,
    pub stack_size: Option<usize>,
    pub poll_timeout_ms: u16,
    pub reactor: ReactorConfig,
    /// Pin the reactor thread to this CPU, if set.
    pub affinity: Option<usize>,
}

impl Default for ReactorThreadConfig {
    fn default() -> Self {
        Self {
            thread_name: "skein-reactor".into(),
            stack_size: None,
            poll_timeout_ms: 100,
            reactor: ReactorConfig::default(),
            affinity: None,
        }
    }
}

/// Pin the calling thread to `cpu`. Errors are logged, not propagated —
/// a missing/invalid CPU id shouldn't take the whole reactor down.
fn pin_to_cpu(cpu: usize) {
    use nix::sched::{sched_setaffinity, CpuSet};
    use nix::unistd::Pid;

    let mut set = CpuSet::new();
    if let Err(err) = set.set(cpu) {
        skein_core::klog_warn!("invalid reactor affinity cpu {}: {}", cpu, err);
        return;
    }
    if let Err(err) = sched_setaffinity(Pid::from_raw(0), &set) {
        skein_core::klog_warn!("failed to pin reactor thread to cpu {}: {}", cpu, err);
    }
}

pub struct ReactorThreadHandle {
    handle: Option<JoinHandle<NetStat>>,
    shutdown: Arc<AtomicBool>,
    reactor: Arc<Reactor>,
}

impl ReactorThreadHandle {
    pub fn stat(&self) -> NetStat {
        self.reactor.stat()
    }

    pub fn tcp_listen(&self, addr: SocketAddr) -> GResult<SocketId> {
        self.reactor.tcp_listen(addr)
    }

    pub fn udp_bind(&self, addr: SocketAddr) -> GResult<SocketId> {
        self.reactor.udp_bind(addr)
    }

    pub fn local_addr(&self, sid: SocketId) -> GResult<SocketAddr> {
        self.reactor.local_addr(sid)
    }

    pub fn tcp_connect(&self, addr: SocketAddr) -> GResult<SocketId> {
        self.reactor.tcp_connect(addr, None)
    }

    pub fn udp_connect(&self, addr: SocketAddr) -> GResult<SocketId> {
        self.reactor.udp_connect(addr, None)
    }

    pub fn tcp_send(&self, sid: SocketId, data: Vec<u8>) -> GResult<()> {
        self.reactor.tcp_send(sid, data)
    }

    pub fn udp_send(&self, sid: SocketId, data: Vec<u8>, addr: Option<SocketAddr>) -> GResult<()> {
        self.reactor.udp_send(sid, data, addr)
    }

    pub fn read_enable(&self, sid: SocketId, enable: bool) {
        self.reactor.read_enable(sid, enable)
    }

    pub fn close(&self, sid: SocketId) -> GResult<()> {
        self.reactor.close(sid)
    }

    /// Request shutdown and block until the thread has exited, returning
    /// final stats.
    pub fn shutdown(mut self) -> NetStat {
        self.shutdown.store(true, Ordering::Release);
        self.reactor.request_exit();
        self.handle
            .take()
            .expect("handle already taken")
            .join()
            .expect("reactor thread panicked")
    }
}

/// Spawn the reactor thread, returning a handle that issues socket
/// commands and eventually shuts the thread down.
pub fn spawn_reactor_thread(
    config: ReactorThreadConfig,
    on_message: impl Fn(NetMessage) + Send + Sync + 'static,
) -> std::io::Result<ReactorThreadHandle> {
    let reactor = Arc::new(Reactor::new(config.reactor, on_message)?);
    let reactor_clone = reactor.clone();
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    let timeout_ms = config.poll_timeout_ms;
    let affinity = config.affinity;

    let mut builder = thread::Builder::new().name(config.thread_name.clone());
    if let Some(stack_size) = config.stack_size {
        builder = builder.stack_size(stack_size);
    }

    let handle = builder
        .spawn(move || reactor_loop(reactor_clone, shutdown_clone, timeout_ms, affinity))
        .expect("failed to spawn reactor thread");

    Ok(ReactorThreadHandle {
        handle: Some(handle),
        shutdown,
        reactor,
    })
}

fn reactor_loop(
    reactor: Arc<Reactor>,
    shutdown: Arc<AtomicBool>,
    timeout_ms: u16,
    affinity: Option<usize>,
) -> NetStat {
    set_component("reactor");
    if let Some(cpu) = affinity {
        pin_to_cpu(cpu);
    }
    while !shutdown.load(Ordering::Relaxed) {
        if !reactor.run_once(Some(timeout_ms)) {
            break;
        }
    }
    reactor.stat()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::sync::Mutex;
    use std::time::Duration;

    fn wait_for<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
        let start = std::time::Instant::now();
        while start.elapsed() < timeout {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_tcp_echo_roundtrip() {
        let accepted: Arc<Mutex<Option<SocketId>>> = Arc::new(Mutex::new(None));
        let received = Arc::new(Mutex::new(Vec::new()));
        let accepted_sink = accepted.clone();
        let received_sink = received.clone();

        let handle = spawn_reactor_thread(ReactorThreadConfig::default(), move |msg| match msg {
            NetMessage::Accept { sid, .. } => *accepted_sink.lock().unwrap() = Some(sid),
            NetMessage::TcpData { data, .. } => received_sink.lock().unwrap().extend(data),
            _ => {}
        })
        .unwrap();

        let listen_sid = handle.tcp_listen("127.0.0.1:0".parse().unwrap()).unwrap();
        assert!(wait_for(|| handle.local_addr(listen_sid).is_ok(), Duration::from_secs(1)));
        let listen_addr = handle.local_addr(listen_sid).unwrap();

        let mut client = TcpStream::connect(listen_addr).unwrap();
        client.write_all(b"ping").unwrap();

        assert!(wait_for(
            || accepted.lock().unwrap().is_some(),
            Duration::from_secs(1)
        ));
        let peer_sid = accepted.lock().unwrap().take().unwrap();

        assert!(wait_for(
            || received.lock().unwrap().as_slice() == b"ping",
            Duration::from_secs(1)
        ));

        handle.tcp_send(peer_sid, b"pong".to_vec()).unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"pong");

        handle.shutdown();
    }

    #[test]
    fn test_udp_roundtrip() {
        let received = Arc::new(Mutex::new(None));
        let sink = received.clone();
        let handle = spawn_reactor_thread(ReactorThreadConfig::default(), move |msg| {
            if let NetMessage::UdpData { data, peer, .. } = msg {
                *sink.lock().unwrap() = Some((data, peer));
            }
        })
        .unwrap();

        let sid = handle.udp_bind("127.0.0.1:0".parse().unwrap()).unwrap();
        assert!(wait_for(|| handle.local_addr(sid).is_ok(), Duration::from_secs(1)));
        let addr = handle.local_addr(sid).unwrap();

        let client = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        client.send_to(b"hello", addr).unwrap();

        assert!(wait_for(
            || received.lock().unwrap().is_some(),
            Duration::from_secs(1)
        ));
        let (data, _peer) = received.lock().unwrap().take().unwrap();
        assert_eq!(data, b"hello");

        handle.shutdown();
    }
}
