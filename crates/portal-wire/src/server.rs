use std::{
    collections::{HashMap, VecDeque},
    io,
    net::SocketAddr,
    sync::Arc,
    thread::JoinHandle,
    time::Duration,
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use mio::{Events, Interest, Poll, Token, Waker, event::Event, net::TcpListener, net::TcpStream};
use portal_utils::safe_panic;
use tracing::{debug, info, warn};

use crate::{
    error::ServerError,
    frame::{FrameError, RecvBuffer, SendBuffer},
    handshake::{HandshakeProgress, HandshakeValidator},
};

const WAKE_TOKEN: Token = Token(usize::MAX);
const LISTENER_TOKEN: Token = Token(usize::MAX - 1);
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Opaque per-connection identifier handed back from [`ServerSocket::recv`]
/// and taken by [`ServerSocket::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(usize);

pub struct ServerOptions {
    pub bind_addr: SocketAddr,
    pub backlog: u32,
    pub max_msg_size: usize,
    pub max_recv_queue: usize,
    pub max_send_queue: usize,
    pub handshake_tag: Vec<u8>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:0".parse().expect("valid default addr"),
            backlog: 8192,
            max_msg_size: crate::frame::DEFAULT_MAX_MSG_SIZE,
            max_recv_queue: 4096,
            max_send_queue: 65536,
            handshake_tag: crate::handshake::DEFAULT_HANDSHAKE_TAG.to_vec(),
        }
    }
}

enum Command {
    Send { client: ClientId, parts: Vec<Vec<u8>> },
    Shutdown,
}

struct Connection {
    stream: TcpStream,
    peer_addr: SocketAddr,
    handshake: Option<HandshakeValidator>,
    recv: RecvBuffer,
    send_queue: VecDeque<SendBuffer>,
    writable_armed: bool,
}

/// Single-I/O-thread, `mio`-driven TCP server. Accepts connections, validates
/// the fixed handshake tag, and exposes a simple `(ClientId, Vec<u8>)` inbound
/// queue plus a `send(ClientId, parts)` call; everything else (protocol,
/// dispatch) lives above this layer.
pub struct ServerSocket {
    local_addr: SocketAddr,
    recv_rx: Receiver<(ClientId, Vec<u8>)>,
    command_tx: Sender<Command>,
    waker: Arc<Waker>,
    handle: Option<JoinHandle<()>>,
    max_send_queue: usize,
    send_queue_used: Arc<std::sync::atomic::AtomicUsize>,
}

impl ServerSocket {
    pub fn bind(options: ServerOptions) -> Result<Self, ServerError> {
        let mut listener = TcpListener::bind(options.bind_addr).map_err(ServerError::Bind)?;
        let local_addr = listener.local_addr().map_err(ServerError::Bind)?;

        let poll = Poll::new().map_err(ServerError::Bind)?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)
            .map_err(ServerError::Bind)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN).map_err(ServerError::Bind)?);

        let (recv_tx, recv_rx) = bounded(options.max_recv_queue);
        let (command_tx, command_rx) = unbounded();
        let send_queue_used = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let max_send_queue = options.max_send_queue;
        let worker = IoThread {
            poll,
            listener,
            conns: HashMap::new(),
            next_token: 0,
            handshake_tag: options.handshake_tag,
            max_msg_size: options.max_msg_size,
            recv_tx,
            command_rx,
            send_queue_used: send_queue_used.clone(),
            shutting_down: false,
        };

        let handle = std::thread::Builder::new()
            .name("portal-server-io".to_string())
            .spawn(move || worker.run())
            .map_err(|e| ServerError::Bind(io::Error::other(e.to_string())))?;

        Ok(Self {
            local_addr,
            recv_rx,
            command_tx,
            waker,
            handle: Some(handle),
            max_send_queue,
            send_queue_used,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Blocks up to `timeout` (None = forever) for the next inbound message.
    pub fn recv(&self, timeout: Option<Duration>) -> Result<(ClientId, Vec<u8>), ServerError> {
        match timeout {
            None => self.recv_rx.recv().map_err(|_| ServerError::Closed),
            Some(timeout) => match self.recv_rx.recv_timeout(timeout) {
                Ok(msg) => Ok(msg),
                Err(RecvTimeoutError::Timeout) => Err(ServerError::Closed),
                Err(RecvTimeoutError::Disconnected) => Err(ServerError::Closed),
            },
        }
    }

    /// Enqueues a frame for `client`; dropped (with a log line) if the
    /// client already disconnected.
    pub fn send(&self, client: ClientId, parts: Vec<Vec<u8>>) -> Result<(), ServerError> {
        if self.send_queue_used.load(std::sync::atomic::Ordering::Relaxed) >= self.max_send_queue {
            return Err(ServerError::SendQueueOverflow);
        }
        self.send_queue_used.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.command_tx
            .send(Command::Send { client, parts })
            .map_err(|_| ServerError::Closed)?;
        self.waker.wake().map_err(|_| ServerError::Closed)
    }

    /// Stops accepting new reads; the I/O thread keeps flushing outbound
    /// queues until `close`.
    pub fn shutdown(&self) {
        let _ = self.command_tx.send(Command::Shutdown);
        let _ = self.waker.wake();
    }

    /// Joins the I/O thread, waiting up to `timeout` (None = forever).
    pub fn close(mut self, timeout: Option<Duration>) {
        self.shutdown();
        if let Some(handle) = self.handle.take() {
            match timeout {
                None => {
                    let _ = handle.join();
                }
                Some(timeout) => {
                    let start = std::time::Instant::now();
                    while !handle.is_finished() && start.elapsed() < timeout {
                        std::thread::sleep(Duration::from_millis(5));
                    }
                    if handle.is_finished() {
                        let _ = handle.join();
                    } else {
                        warn!("server io thread still running at close timeout, detaching");
                    }
                }
            }
        }
    }
}

struct IoThread {
    poll: Poll,
    listener: TcpListener,
    conns: HashMap<Token, Connection>,
    next_token: usize,
    handshake_tag: Vec<u8>,
    max_msg_size: usize,
    recv_tx: Sender<(ClientId, Vec<u8>)>,
    command_rx: Receiver<Command>,
    send_queue_used: Arc<std::sync::atomic::AtomicUsize>,
    shutting_down: bool,
}

impl IoThread {
    fn run(mut self) {
        let mut events = Events::with_capacity(1024);
        loop {
            if let Err(err) = self.poll.poll(&mut events, Some(POLL_INTERVAL)) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                warn!(?err, "server poll failed, stopping io thread");
                return;
            }

            for event in events.iter() {
                match event.token() {
                    WAKE_TOKEN => {}
                    LISTENER_TOKEN => self.accept(),
                    token => self.handle_conn_event(token, event),
                }
            }

            self.drain_commands();

            if self.shutting_down && self.conns.values().all(|c| c.send_queue.is_empty()) {
                return;
            }
        }
    }

    fn accept(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, peer_addr)) => {
                    let token = Token(self.next_token);
                    self.next_token += 1;
                    if let Err(err) = self.poll.registry().register(&mut stream, token, Interest::READABLE) {
                        warn!(?err, "couldn't register accepted connection");
                        continue;
                    }
                    info!(?peer_addr, "client connected");
                    self.conns.insert(
                        token,
                        Connection {
                            stream,
                            peer_addr,
                            handshake: Some(HandshakeValidator::new(self.handshake_tag.clone())),
                            recv: RecvBuffer::new(self.max_msg_size),
                            send_queue: VecDeque::new(),
                            writable_armed: false,
                        },
                    );
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    warn!(?err, "accept failed");
                    return;
                }
            }
        }
    }

    fn handle_conn_event(&mut self, token: Token, event: &Event) {
        let Some(conn) = self.conns.get_mut(&token) else {
            safe_panic!("got event for unknown token");
            return;
        };

        if event.is_readable() && !self.shutting_down {
            if let Err(err) = Self::pump_read(conn, token, &self.recv_tx) {
                debug!(?err, peer = ?conn.peer_addr, "connection read failed, evicting");
                self.evict(token);
                return;
            }
        }

        if event.is_writable() {
            let registry = self.poll.registry();
            let Some(conn) = self.conns.get_mut(&token) else {
                safe_panic!("got writable event for unknown token");
                return;
            };
            if let Err(err) = Self::pump_write(conn, token, registry, &self.send_queue_used) {
                debug!(?err, "connection write failed, evicting");
                self.evict(token);
            }
        }
    }

    fn pump_read(
        conn: &mut Connection,
        token: Token,
        recv_tx: &Sender<(ClientId, Vec<u8>)>,
    ) -> Result<(), FrameError> {
        loop {
            if let Some(handshake) = &mut conn.handshake {
                let mut buf = [0u8; 256];
                let want = handshake.remaining().min(buf.len());
                match io::Read::read(&mut conn.stream, &mut buf[..want]) {
                    Ok(0) => return Err(FrameError::Reset),
                    Ok(n) => match handshake.feed(&buf[..n]) {
                        HandshakeProgress::Complete => conn.handshake = None,
                        HandshakeProgress::Incomplete => return Ok(()),
                        HandshakeProgress::Mismatch => return Err(FrameError::Reset),
                    },
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                    Err(e) => return Err(FrameError::Io(e)),
                }
                continue;
            }

            match conn.recv.recv(&mut conn.stream)? {
                Some(payload) => {
                    let client = ClientId(token.0);
                    if recv_tx.try_send((client, payload)).is_err() {
                        warn!("server recv queue full, dropping socket");
                        return Err(FrameError::Reset);
                    }
                }
                None => return Ok(()),
            }
        }
    }

    fn pump_write(
        conn: &mut Connection,
        token: Token,
        registry: &mio::Registry,
        send_queue_used: &Arc<std::sync::atomic::AtomicUsize>,
    ) -> Result<(), FrameError> {
        while let Some(front) = conn.send_queue.front_mut() {
            front.send(&mut conn.stream)?;
            if front.is_complete() {
                conn.send_queue.pop_front();
                send_queue_used.fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
            } else {
                return Ok(());
            }
        }
        if conn.writable_armed {
            registry.reregister(&mut conn.stream, token, Interest::READABLE).ok();
            conn.writable_armed = false;
        }
        Ok(())
    }

    fn drain_commands(&mut self) {
        while let Ok(command) = self.command_rx.try_recv() {
            match command {
                Command::Send { client, parts } => self.enqueue_send(client, parts),
                Command::Shutdown => self.shutting_down = true,
            }
        }
    }

    fn enqueue_send(&mut self, client: ClientId, parts: Vec<Vec<u8>>) {
        let token = Token(client.0);
        let max_msg_size = self.max_msg_size;
        let registry = self.poll.registry();
        let Some(conn) = self.conns.get_mut(&token) else {
            self.send_queue_used.fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
            warn!(?client, "send to unknown/disconnected client dropped");
            return;
        };
        let frame = match SendBuffer::new(parts, max_msg_size) {
            Ok(frame) => frame,
            Err(err) => {
                self.send_queue_used.fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
                warn!(?err, "dropping oversize/empty frame");
                return;
            }
        };
        conn.send_queue.push_back(frame);
        if !conn.writable_armed {
            if registry
                .reregister(&mut conn.stream, token, Interest::READABLE | Interest::WRITABLE)
                .is_ok()
            {
                conn.writable_armed = true;
            }
        }
    }

    fn evict(&mut self, token: Token) {
        if let Some(mut conn) = self.conns.remove(&token) {
            self.send_queue_used.fetch_sub(conn.send_queue.len(), std::sync::atomic::Ordering::Relaxed);
            let _ = self.poll.registry().deregister(&mut conn.stream);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{io::Write, net::TcpStream as StdTcpStream};

    use super::*;

    #[test]
    fn accepts_handshake_then_delivers_message() {
        let server = ServerSocket::bind(ServerOptions {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        })
        .expect("bind");
        let addr = server.local_addr();

        let mut stream = StdTcpStream::connect(addr).expect("connect");
        stream.write_all(crate::handshake::DEFAULT_HANDSHAKE_TAG).unwrap();
        let mut frame = Vec::new();
        frame.extend_from_slice(&5u32.to_le_bytes());
        frame.extend_from_slice(b"hello");
        stream.write_all(&frame).unwrap();

        let (_client, payload) = server.recv(Some(Duration::from_secs(2))).expect("recv");
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn bad_handshake_is_disconnected() {
        let server = ServerSocket::bind(ServerOptions {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        })
        .expect("bind");
        let addr = server.local_addr();
        let mut stream = StdTcpStream::connect(addr).expect("connect");
        stream.write_all(b"not the right tag!!").unwrap();
        assert!(server.recv(Some(Duration::from_millis(300))).is_err());
    }
}
