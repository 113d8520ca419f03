use std::{
    collections::VecDeque,
    io::{self, Read, Write},
    net::SocketAddr,
    os::fd::AsRawFd,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
    time::Duration,
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use mio::{Events, Interest, Poll, Token, net::TcpStream};
use tracing::{debug, info, warn};

use crate::{
    error::ClientError,
    frame::{FrameError, RecvBuffer, SendBuffer},
    handshake,
};

const STREAM_TOKEN: Token = Token(0);
const POLL_SLICE: Duration = Duration::from_millis(200);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolves `(host, port)` to a possibly different `(host, port)` before
/// each connect attempt. The identity resolver is the default; tests and
/// deployments with service discovery can swap in their own.
pub type Resolver = Arc<dyn Fn(&str, u16) -> (String, u16) + Send + Sync>;

pub struct ClientOptions {
    pub host: String,
    pub port: u16,
    pub autoconn: bool,
    pub connect_wait: Duration,
    pub keepalive_after: Duration,
    pub keepalive_every: Duration,
    pub keepalive_fails: u32,
    pub handshake_tag: Vec<u8>,
    pub max_msg_size: usize,
    pub max_send_queue: usize,
    pub max_recv_queue: usize,
    pub resolver: Resolver,
    pub on_recv: Option<Box<dyn Fn(&[u8]) + Send>>,
    pub on_conn: Option<Box<dyn Fn() + Send>>,
    pub on_disc: Option<Box<dyn Fn() + Send>>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            autoconn: true,
            connect_wait: Duration::from_millis(100),
            keepalive_after: Duration::from_secs(10),
            keepalive_every: Duration::from_secs(5),
            keepalive_fails: 3,
            handshake_tag: handshake::DEFAULT_HANDSHAKE_TAG.to_vec(),
            max_msg_size: crate::frame::DEFAULT_MAX_MSG_SIZE,
            max_send_queue: 4096,
            max_recv_queue: 4096,
            resolver: Arc::new(|host, port| (host.to_string(), port)),
            on_recv: None,
            on_conn: None,
            on_disc: None,
        }
    }
}

enum Command {
    Send { parts: Vec<Vec<u8>> },
    Connect,
    Shutdown,
}

/// Single-I/O-thread TCP client with automatic reconnect. Mirrors the
/// teacher's outbound half of `TcpConnector`, split into its own type per
/// this protocol's client/server asymmetry and with handshake-on-connect
/// added.
pub struct ClientSocket {
    recv_rx: Receiver<Vec<u8>>,
    command_tx: Sender<Command>,
    is_connected: Arc<AtomicBool>,
    send_queue_used: Arc<std::sync::atomic::AtomicUsize>,
    max_send_queue: usize,
    autoconn: bool,
    handle: Option<JoinHandle<()>>,
}

/// Cloneable handle that can enqueue raw frames without waiting on a
/// connection, used by callers (e.g. the RPC client's `on_conn` resend
/// path) that already know the socket just became connected.
#[derive(Clone)]
pub struct RawSender {
    command_tx: Sender<Command>,
    send_queue_used: Arc<std::sync::atomic::AtomicUsize>,
    max_send_queue: usize,
}

impl RawSender {
    pub fn send_raw(&self, parts: Vec<Vec<u8>>) -> Result<(), ClientError> {
        if self.send_queue_used.load(Ordering::Relaxed) >= self.max_send_queue {
            return Err(ClientError::SendQueueFull);
        }
        self.send_queue_used.fetch_add(1, Ordering::Relaxed);
        self.command_tx.send(Command::Send { parts }).map_err(|_| ClientError::Closed)
    }
}

impl ClientSocket {
    pub fn new(options: ClientOptions) -> Self {
        let (recv_tx, recv_rx) = bounded(options.max_recv_queue);
        let (command_tx, command_rx) = unbounded();
        let is_connected = Arc::new(AtomicBool::new(false));
        let send_queue_used = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let max_send_queue = options.max_send_queue;

        let worker = IoThread {
            options,
            poll: Poll::new().expect("failed to create client poll"),
            stream: None,
            recv_buf: None,
            send_queue: VecDeque::new(),
            writable_armed: false,
            recv_tx,
            command_rx,
            is_connected: is_connected.clone(),
            send_queue_used: send_queue_used.clone(),
            want_connect: false,
            shutting_down: false,
        };

        let autoconn = worker.options.autoconn;
        let handle = std::thread::Builder::new()
            .name("portal-client-io".to_string())
            .spawn(move || worker.run())
            .expect("failed to spawn client io thread");

        if autoconn {
            let _ = command_tx.send(Command::Connect);
        }

        Self { recv_rx, command_tx, is_connected, send_queue_used, max_send_queue, autoconn, handle: Some(handle) }
    }

    pub fn is_connected(&self) -> bool {
        self.is_connected.load(Ordering::Acquire)
    }

    pub fn raw_sender(&self) -> RawSender {
        RawSender {
            command_tx: self.command_tx.clone(),
            send_queue_used: self.send_queue_used.clone(),
            max_send_queue: self.max_send_queue,
        }
    }

    /// Returns true iff connected within `timeout`. With `autoconn`, the I/O
    /// thread is already retrying; this just waits. Without it, this call
    /// also kicks off a connect attempt.
    pub fn connect(&self, timeout: Duration) -> bool {
        let _ = self.command_tx.send(Command::Connect);
        let start = std::time::Instant::now();
        while !self.is_connected() {
            if start.elapsed() >= timeout {
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        true
    }

    pub fn send(&self, parts: Vec<Vec<u8>>, timeout: Duration) -> Result<(), ClientError> {
        if !self.connect(timeout) {
            return Err(ClientError::NotConnected);
        }
        if self.send_queue_used.load(Ordering::Relaxed) >= self.max_send_queue {
            return Err(ClientError::SendQueueFull);
        }
        self.send_queue_used.fetch_add(1, Ordering::Relaxed);
        self.command_tx.send(Command::Send { parts }).map_err(|_| ClientError::Closed)
    }

    /// Polls the recv queue in 200 ms slices up to `timeout`, re-checking
    /// the connection on each slice so a disconnect surfaces promptly.
    pub fn recv(&self, timeout: Duration) -> Result<Vec<u8>, ClientError> {
        let start = std::time::Instant::now();
        loop {
            let slice = POLL_SLICE.min(timeout.saturating_sub(start.elapsed()).max(Duration::from_millis(1)));
            match self.recv_rx.recv_timeout(slice) {
                Ok(payload) => return Ok(payload),
                Err(RecvTimeoutError::Disconnected) => return Err(ClientError::Closed),
                Err(RecvTimeoutError::Timeout) => {
                    if start.elapsed() >= timeout {
                        return Err(ClientError::RecvTimeout);
                    }
                    if !self.is_connected() && !self.autoconn {
                        return Err(ClientError::NotConnected);
                    }
                }
            }
        }
    }

    pub fn close(mut self, timeout: Option<Duration>) {
        let _ = self.command_tx.send(Command::Shutdown);
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
                        warn!("client io thread still running at close timeout, detaching");
                    }
                }
            }
        }
    }
}

struct IoThread {
    options: ClientOptions,
    poll: Poll,
    stream: Option<TcpStream>,
    recv_buf: Option<RecvBuffer>,
    send_queue: VecDeque<SendBuffer>,
    writable_armed: bool,
    recv_tx: Sender<Vec<u8>>,
    command_rx: Receiver<Command>,
    is_connected: Arc<AtomicBool>,
    send_queue_used: Arc<std::sync::atomic::AtomicUsize>,
    want_connect: bool,
    shutting_down: bool,
}

impl IoThread {
    fn run(mut self) {
        let mut events = Events::with_capacity(128);
        let mut last_attempt = std::time::Instant::now()
            .checked_sub(self.options.connect_wait)
            .unwrap_or_else(std::time::Instant::now);

        loop {
            self.drain_commands();
            if self.shutting_down {
                return;
            }

            if self.stream.is_none()
                && (self.options.autoconn || self.want_connect)
                && last_attempt.elapsed() >= self.options.connect_wait
            {
                last_attempt = std::time::Instant::now();
                self.try_connect();
            }

            if let Err(err) = self.poll.poll(&mut events, Some(POLL_SLICE)) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                warn!(?err, "client poll failed, stopping io thread");
                return;
            }

            for event in events.iter() {
                if event.token() != STREAM_TOKEN {
                    continue;
                }
                if event.is_readable() {
                    self.pump_read();
                }
                if self.stream.is_some() && event.is_writable() {
                    self.pump_write();
                }
            }
        }
    }

    fn try_connect(&mut self) {
        let (host, port) = (self.options.resolver)(&self.options.host, self.options.port);
        let addr: SocketAddr = match format!("{host}:{port}").parse() {
            Ok(addr) => addr,
            Err(err) => {
                warn!(?err, %host, port, "client resolver produced an unparseable address");
                return;
            }
        };

        let std_stream = match std::net::TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
            Ok(stream) => stream,
            Err(err) => {
                debug!(?err, %addr, "client connect attempt failed");
                return;
            }
        };

        if let Err(err) = std_stream.set_nodelay(true) {
            warn!(?err, "failed to set TCP_NODELAY");
        }
        set_keepalive(&std_stream, &self.options);

        if let Err(err) = std_stream.set_nonblocking(true) {
            warn!(?err, %addr, "failed to set client stream non-blocking");
            return;
        }

        let mut stream = TcpStream::from_std(std_stream);
        if let Err(err) = write_all_nonblocking(&mut stream, &self.options.handshake_tag) {
            warn!(?err, %addr, "failed to send handshake tag");
            return;
        }
        if let Err(err) = self.poll.registry().register(&mut stream, STREAM_TOKEN, Interest::READABLE) {
            warn!(?err, "failed to register client stream");
            return;
        }

        self.stream = Some(stream);
        self.recv_buf = Some(RecvBuffer::new(self.options.max_msg_size));
        self.writable_armed = false;
        self.is_connected.store(true, Ordering::Release);
        info!(%addr, "connected");
        if let Some(on_conn) = &self.options.on_conn {
            on_conn();
        }
    }

    fn pump_read(&mut self) {
        loop {
            let Some(stream) = &mut self.stream else { return };
            let Some(recv_buf) = &mut self.recv_buf else { return };
            match recv_buf.recv(stream) {
                Ok(Some(payload)) => {
                    if let Some(on_recv) = &self.options.on_recv {
                        on_recv(&payload);
                    }
                    if self.recv_tx.try_send(payload).is_err() {
                        warn!("client recv queue full, dropping message");
                    }
                }
                Ok(None) => return,
                Err(err) => {
                    self.handle_disconnect(err);
                    return;
                }
            }
        }
    }

    fn pump_write(&mut self) {
        loop {
            let Some(front) = self.send_queue.front_mut() else { break };
            let Some(stream) = &mut self.stream else { return };
            match front.send(stream) {
                Ok(_) if front.is_complete() => {
                    self.send_queue.pop_front();
                    self.send_queue_used.fetch_sub(1, Ordering::Relaxed);
                }
                Ok(_) => return,
                Err(err) => {
                    self.handle_disconnect(err);
                    return;
                }
            }
        }
        if self.writable_armed
            && let Some(stream) = &mut self.stream
            && self.poll.registry().reregister(stream, STREAM_TOKEN, Interest::READABLE).is_ok()
        {
            self.writable_armed = false;
        }
    }

    fn handle_disconnect(&mut self, err: FrameError) {
        debug!(?err, "client connection lost");
        if let Some(mut stream) = self.stream.take() {
            let _ = self.poll.registry().deregister(&mut stream);
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        self.recv_buf = None;
        self.send_queue.clear();
        self.send_queue_used.store(0, Ordering::Relaxed);
        self.writable_armed = false;
        self.is_connected.store(false, Ordering::Release);
        if let Some(on_disc) = &self.options.on_disc {
            on_disc();
        }
    }

    fn drain_commands(&mut self) {
        while let Ok(command) = self.command_rx.try_recv() {
            match command {
                Command::Connect => self.want_connect = true,
                Command::Shutdown => self.shutting_down = true,
                Command::Send { parts } => {
                    let Some(stream) = &mut self.stream else {
                        self.send_queue_used.fetch_sub(1, Ordering::Relaxed);
                        warn!("dropping send on disconnected client socket");
                        continue;
                    };
                    let frame = match SendBuffer::new(parts, self.options.max_msg_size) {
                        Ok(frame) => frame,
                        Err(err) => {
                            self.send_queue_used.fetch_sub(1, Ordering::Relaxed);
                            warn!(?err, "dropping oversize/empty frame");
                            continue;
                        }
                    };
                    self.send_queue.push_back(frame);
                    if !self.writable_armed {
                        if self
                            .poll
                            .registry()
                            .reregister(stream, STREAM_TOKEN, Interest::READABLE | Interest::WRITABLE)
                            .is_ok()
                        {
                            self.writable_armed = true;
                        }
                    }
                }
            }
        }
    }
}

/// Writes the unframed handshake tag to a non-blocking stream, spinning
/// through `WouldBlock` since this runs once on the I/O thread before the
/// socket is registered with the poller.
fn write_all_nonblocking(stream: &mut TcpStream, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        match stream.write(buf) {
            Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "failed to write handshake tag")),
            Ok(n) => buf = &buf[n..],
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn set_keepalive(stream: &std::net::TcpStream, options: &ClientOptions) {
    let fd = stream.as_raw_fd();
    let idle = options.keepalive_after.as_secs() as libc::c_int;
    let interval = options.keepalive_every.as_secs() as libc::c_int;
    let count = options.keepalive_fails as libc::c_int;
    let enable: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_KEEPALIVE,
            &enable as *const _ as *const libc::c_void,
            core::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_KEEPIDLE,
            &idle as *const _ as *const libc::c_void,
            core::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_KEEPINTVL,
            &interval as *const _ as *const libc::c_void,
            core::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_KEEPCNT,
            &count as *const _ as *const libc::c_void,
            core::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
        let user_timeout_ms: libc::c_int =
            1000 * (options.keepalive_after.as_secs() as i32 + options.keepalive_every.as_secs() as i32 * count);
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_USER_TIMEOUT,
            &user_timeout_ms as *const _ as *const libc::c_void,
            core::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn set_keepalive(stream: &std::net::TcpStream, options: &ClientOptions) {
    let _ = stream.set_nodelay(true);
    let _ = options;
}

#[cfg(test)]
mod tests {
    use std::{
        io::Read as _,
        net::{TcpListener, TcpStream as StdTcpStream},
    };

    use super::*;

    #[test]
    fn connects_and_sends_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().unwrap();

        let client = ClientSocket::new(ClientOptions { host: addr.ip().to_string(), port: addr.port(), ..Default::default() });
        assert!(client.connect(Duration::from_secs(2)));

        let (mut accepted, _) = listener.accept().expect("accept");
        let mut buf = vec![0u8; handshake::DEFAULT_HANDSHAKE_TAG.len()];
        accepted.read_exact(&mut buf).expect("read handshake");
        assert_eq!(buf, handshake::DEFAULT_HANDSHAKE_TAG);

        client.close(Some(Duration::from_secs(1)));
    }

    #[test]
    fn send_then_server_receives_frame() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().unwrap();
        let client = ClientSocket::new(ClientOptions { host: addr.ip().to_string(), port: addr.port(), ..Default::default() });
        assert!(client.connect(Duration::from_secs(2)));

        let (mut accepted, _): (StdTcpStream, _) = listener.accept().expect("accept");
        let mut tag = vec![0u8; handshake::DEFAULT_HANDSHAKE_TAG.len()];
        accepted.read_exact(&mut tag).unwrap();

        client.send(vec![b"ping".to_vec()], Duration::from_secs(1)).expect("send");

        let mut header = [0u8; 4];
        accepted.read_exact(&mut header).unwrap();
        let len = u32::from_le_bytes(header) as usize;
        let mut payload = vec![0u8; len];
        accepted.read_exact(&mut payload).unwrap();
        assert_eq!(payload, b"ping");

        client.close(Some(Duration::from_secs(1)));
    }
}
