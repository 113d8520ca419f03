use std::{
    collections::{HashMap, VecDeque},
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use portal_pack::{Pack, Unpack};
use portal_utils::{CancelToken, JobHandle, ThreadPool};
use portal_wire::{ClientId, ServerError, ServerOptions as WireServerOptions, ServerSocket};
use tracing::{debug, info, warn};

use crate::error::{StatusCode, send_err, send_ok};

const ADMIT_POLL: Duration = Duration::from_micros(100);

pub struct ServerOptions {
    pub bind_addr: SocketAddr,
    pub workers: usize,
    pub errors: bool,
    pub handshake_tag: Vec<u8>,
    pub max_msg_size: usize,
    pub max_recv_queue: usize,
    pub max_send_queue: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:0".parse().expect("valid default addr"),
            workers: 4,
            errors: false,
            handshake_tag: portal_wire::DEFAULT_HANDSHAKE_TAG.to_vec(),
            max_msg_size: portal_wire::DEFAULT_MAX_MSG_SIZE,
            max_recv_queue: 4096,
            max_send_queue: 65536,
        }
    }
}

#[derive(Default)]
pub struct BindOptions {
    pub workers: Option<usize>,
}

/// `(reply_value, post_info)`; `post_info` is `None` unless the method has a
/// `post_fn`, in which case the work closure is expected to always produce
/// one.
type Outcome<V> = Result<(V, Option<V>), String>;
type WorkFn<V> = Arc<dyn Fn(V) -> Outcome<V> + Send + Sync>;
type PostFn<V> = Arc<dyn Fn(V) -> Result<(), String> + Send + Sync>;

struct MethodState<V> {
    work_fn: WorkFn<V>,
    post_fn: Option<PostFn<V>>,
    pool: ThreadPool,
    admission: usize,
    pending: VecDeque<(ClientId, u64, V)>,
}

struct InflightEntry<V> {
    client: ClientId,
    reqnum: u64,
    handle: JobHandle<Outcome<V>>,
    result: Option<Outcome<V>>,
    replied: bool,
}

struct PostOutEntry {
    method: String,
    handle: JobHandle<Result<(), String>>,
}

/// Running send/recv counters, mirroring the original source's
/// `Server.stats()` (`portal/server.py`): `numrecv` counts requests admitted
/// to a known method's queue, `numsend` counts successful replies sent.
#[derive(Default)]
struct StatsInner {
    numsend: AtomicU64,
    numrecv: AtomicU64,
}

/// Snapshot returned by [`RpcServer::stats`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ServerStats {
    pub numsend: u64,
    pub numrecv: u64,
}

/// Accepts bindings before the dispatcher starts. Mirrors the Python
/// source's `Server()` followed by repeated `.bind(name, fn)` calls, prior to
/// `run()`/`start()`.
pub struct RpcServerBuilder<V> {
    socket: Arc<ServerSocket>,
    methods: HashMap<String, MethodState<V>>,
    default_workers: usize,
    errors: bool,
    stats: Arc<StatsInner>,
}

impl<V> RpcServerBuilder<V>
where
    V: Pack + Unpack + Clone + Send + Sync + 'static,
{
    pub fn bind_socket(options: ServerOptions) -> Result<Self, ServerError> {
        let wire_options = WireServerOptions {
            bind_addr: options.bind_addr,
            handshake_tag: options.handshake_tag,
            max_msg_size: options.max_msg_size,
            max_recv_queue: options.max_recv_queue,
            max_send_queue: options.max_send_queue,
            ..Default::default()
        };
        let socket = ServerSocket::bind(wire_options)?;
        Ok(Self {
            socket: Arc::new(socket),
            methods: HashMap::new(),
            default_workers: options.workers,
            errors: options.errors,
            stats: Arc::new(StatsInner::default()),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    /// Binds a plain method with no post-hook.
    pub fn bind(
        &mut self,
        name: impl Into<String>,
        options: BindOptions,
        work_fn: impl Fn(V) -> Result<V, String> + Send + Sync + 'static,
    ) {
        let name = name.into();
        let workers = options.workers.unwrap_or(self.default_workers).max(1);
        let pool = ThreadPool::new(workers, format!("portal-method-{name}"));
        self.methods.insert(
            name,
            MethodState {
                work_fn: Arc::new(move |args| work_fn(args).map(|v| (v, None))),
                post_fn: None,
                pool,
                admission: workers + 1,
                pending: VecDeque::new(),
            },
        );
    }

    /// Binds a method whose `work_fn` also produces a `post_info` value
    /// consumed by `post_fn` once the reply has been sent. `post_fn` calls
    /// for this method run strictly in submission order.
    pub fn bind_with_post(
        &mut self,
        name: impl Into<String>,
        options: BindOptions,
        work_fn: impl Fn(V) -> Result<(V, V), String> + Send + Sync + 'static,
        post_fn: impl Fn(V) -> Result<(), String> + Send + Sync + 'static,
    ) {
        let name = name.into();
        let workers = options.workers.unwrap_or(self.default_workers).max(1);
        let pool = ThreadPool::new(workers, format!("portal-method-{name}"));
        self.methods.insert(
            name,
            MethodState {
                work_fn: Arc::new(move |args| work_fn(args).map(|(v, p)| (v, Some(p)))),
                post_fn: Some(Arc::new(post_fn)),
                pool,
                admission: workers + 1,
                pending: VecDeque::new(),
            },
        );
    }

    pub fn start(self) -> RpcServer<V> {
        let cancel = CancelToken::new();
        let socket = self.socket;
        let local_addr = socket.local_addr();
        let dispatcher = Dispatcher {
            socket: socket.clone(),
            methods: self.methods,
            post_pool: ThreadPool::new(1, "portal-post"),
            post_in: VecDeque::new(),
            plain_inflight: Vec::new(),
            post_out: VecDeque::new(),
            errors: self.errors,
            cancel: cancel.clone(),
            stats: self.stats.clone(),
        };
        let handle = std::thread::Builder::new()
            .name("portal-server-dispatch".to_string())
            .spawn(move || dispatcher.run())
            .expect("failed to spawn dispatcher thread");
        RpcServer {
            local_addr,
            cancel,
            handle: Some(handle),
            socket: Some(socket),
            stats: self.stats,
            _marker: std::marker::PhantomData,
        }
    }
}

/// Running server handle. Dropping without calling `close` leaves the
/// dispatcher and socket threads running; always `close` explicitly.
pub struct RpcServer<V> {
    local_addr: SocketAddr,
    cancel: CancelToken,
    handle: Option<JoinHandle<()>>,
    socket: Option<Arc<ServerSocket>>,
    stats: Arc<StatsInner>,
    _marker: std::marker::PhantomData<V>,
}

impl<V> RpcServer<V> {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Running send/recv counts, mirroring the original source's
    /// `Server.stats()`.
    pub fn stats(&self) -> ServerStats {
        ServerStats {
            numsend: self.stats.numsend.load(Ordering::Relaxed),
            numrecv: self.stats.numrecv.load(Ordering::Relaxed),
        }
    }

    /// Signals the dispatcher to stop, joins it (up to `timeout`), then
    /// closes the underlying socket. Safe to call at most once: the type is
    /// consumed, matching P7 by construction (there is no second `self` to
    /// call it on).
    pub fn close(mut self, timeout: Option<Duration>) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            match timeout {
                None => {
                    let _ = handle.join();
                }
                Some(timeout) => {
                    let start = Instant::now();
                    while !handle.is_finished() && start.elapsed() < timeout {
                        std::thread::sleep(Duration::from_millis(5));
                    }
                    if handle.is_finished() {
                        let _ = handle.join();
                    } else {
                        warn!("dispatcher still running at close timeout, detaching");
                    }
                }
            }
        }
        if let Some(socket) = self.socket.take() {
            match Arc::try_unwrap(socket) {
                Ok(socket) => socket.close(timeout),
                Err(_) => warn!("server socket still referenced at close, leaking io thread"),
            }
        }
    }
}

struct Dispatcher<V> {
    socket: Arc<ServerSocket>,
    methods: HashMap<String, MethodState<V>>,
    post_pool: ThreadPool,
    post_in: VecDeque<(String, InflightEntry<V>)>,
    plain_inflight: Vec<(String, InflightEntry<V>)>,
    post_out: VecDeque<PostOutEntry>,
    errors: bool,
    cancel: CancelToken,
    stats: Arc<StatsInner>,
}

impl<V> Dispatcher<V>
where
    V: Pack + Unpack + Clone + Send + Sync + 'static,
{
    fn run(mut self) {
        while !self.cancel.is_cancelled() {
            self.admit();
            self.dispatch();
            let fatal = self.complete() | self.post_hooks();
            if fatal && self.errors {
                info!("server method raised with errors=true, shutting down");
                self.cancel.cancel();
            }
        }
    }

    fn admit(&mut self) {
        if let Ok((client, bytes)) = self.socket.recv(Some(ADMIT_POLL)) {
            self.handle_request(client, bytes);
        }
    }

    fn handle_request(&mut self, client: ClientId, bytes: Vec<u8>) {
        if bytes.len() < 16 {
            send_err(&self.socket, client, 0, StatusCode::ShortOrMalformed, "short or malformed request");
            return;
        }
        let reqnum = u64::from_le_bytes(bytes[0..8].try_into().expect("8 bytes"));
        let name_len = u64::from_le_bytes(bytes[8..16].try_into().expect("8 bytes")) as usize;
        if bytes.len() < 16 + name_len {
            send_err(&self.socket, client, reqnum, StatusCode::ShortOrMalformed, "short or malformed request");
            return;
        }
        let name = match std::str::from_utf8(&bytes[16..16 + name_len]) {
            Ok(name) => name.to_string(),
            Err(_) => {
                send_err(&self.socket, client, reqnum, StatusCode::DecodeFailure, "method name is not valid utf-8");
                return;
            }
        };
        let args_bytes = &bytes[16 + name_len..];
        let Some(method) = self.methods.get_mut(&name) else {
            send_err(&self.socket, client, reqnum, StatusCode::UnknownMethod, &format!("Unknown method {name}"));
            return;
        };
        match V::unpack(args_bytes) {
            Ok(args) => {
                method.pending.push_back((client, reqnum, args));
                self.stats.numrecv.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => send_err(&self.socket, client, reqnum, StatusCode::DecodeFailure, &err.to_string()),
        }
    }

    fn dispatch(&mut self) {
        for (name, method) in self.methods.iter_mut() {
            while method.admission > 0 {
                let Some((client, reqnum, args)) = method.pending.pop_front() else { break };
                method.admission -= 1;
                let work_fn = method.work_fn.clone();
                match method.pool.submit(move |_cancel| work_fn(args)) {
                    Ok(handle) => {
                        let entry = InflightEntry { client, reqnum, handle, result: None, replied: false };
                        if method.post_fn.is_some() {
                            self.post_in.push_back((name.clone(), entry));
                        } else {
                            self.plain_inflight.push((name.clone(), entry));
                        }
                    }
                    Err(err) => {
                        method.admission += 1;
                        debug!(method = %name, %err, "pool closed, deferring request");
                        break;
                    }
                }
            }
        }
    }

    /// Sends replies for finished jobs (any order). Returns whether a
    /// `work_fn` raised this tick.
    fn complete(&mut self) -> bool {
        let mut fatal = false;
        let mut i = 0;
        while i < self.plain_inflight.len() {
            if self.plain_inflight[i].1.handle.is_done() {
                let (name, entry) = self.plain_inflight.remove(i);
                let result = entry.handle.wait();
                send_outcome(&self.socket, entry.client, entry.reqnum, &result);
                fatal |= result.is_err();
                if result.is_ok() {
                    self.stats.numsend.fetch_add(1, Ordering::Relaxed);
                }
                if let Some(method) = self.methods.get_mut(&name) {
                    method.admission += 1;
                }
            } else {
                i += 1;
            }
        }

        for (_name, entry) in self.post_in.iter_mut() {
            if !entry.replied && entry.handle.is_done() {
                let result = entry.handle.wait();
                send_outcome(&self.socket, entry.client, entry.reqnum, &result);
                fatal |= result.is_err();
                if result.is_ok() {
                    self.stats.numsend.fetch_add(1, Ordering::Relaxed);
                }
                entry.result = Some(result);
                entry.replied = true;
            }
        }
        fatal
    }

    /// Submits `post_fn` for posted methods strictly in submission order,
    /// and drains completed post-hook jobs, restoring admission. Returns
    /// whether a `post_fn` raised this tick.
    fn post_hooks(&mut self) -> bool {
        while self.post_in.front().is_some_and(|(_, entry)| entry.result.is_some()) {
            let (name, mut entry) = self.post_in.pop_front().expect("checked front above");
            match entry.result.take().expect("checked Some above") {
                Ok((_, Some(post_info))) => {
                    let Some(post_fn) = self.methods.get(&name).and_then(|m| m.post_fn.clone()) else {
                        if let Some(method) = self.methods.get_mut(&name) {
                            method.admission += 1;
                        }
                        continue;
                    };
                    match self.post_pool.submit(move |_cancel| post_fn(post_info)) {
                        Ok(handle) => self.post_out.push_back(PostOutEntry { method: name, handle }),
                        Err(_) => {
                            if let Some(method) = self.methods.get_mut(&name) {
                                method.admission += 1;
                            }
                        }
                    }
                }
                Ok((_, None)) => {
                    warn!(method = %name, "post-hooked method returned no post_info");
                    if let Some(method) = self.methods.get_mut(&name) {
                        method.admission += 1;
                    }
                }
                Err(_) => {
                    if let Some(method) = self.methods.get_mut(&name) {
                        method.admission += 1;
                    }
                }
            }
        }

        let mut fatal = false;
        while self.post_out.front().is_some_and(|entry| entry.handle.is_done()) {
            let entry = self.post_out.pop_front().expect("checked front above");
            if let Err(err) = entry.handle.wait() {
                warn!(method = %entry.method, %err, "post_fn raised");
                fatal = true;
            }
            if let Some(method) = self.methods.get_mut(&entry.method) {
                method.admission += 1;
            }
        }
        fatal
    }
}

fn send_outcome<V: Pack>(socket: &ServerSocket, client: ClientId, reqnum: u64, result: &Result<(V, Option<V>), String>) {
    match result {
        Ok((value, _)) => send_ok(socket, client, reqnum, value),
        Err(message) => send_err(socket, client, reqnum, StatusCode::WorkFnException, message),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use portal_pack::Value;
    use portal_wire::{ClientOptions, ClientSocket};

    use super::*;

    fn value_i64(v: i64) -> Value {
        Value::array(portal_pack::Dtype::I64, vec![], v.to_le_bytes().to_vec()).expect("scalar array")
    }

    #[test]
    fn echo_round_trip() {
        let mut builder = RpcServerBuilder::<Value>::bind_socket(ServerOptions {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            workers: 2,
            ..Default::default()
        })
        .expect("bind");
        let addr = builder.local_addr();
        builder.bind("echo", BindOptions::default(), |args| Ok(args));
        let server = builder.start();

        let client = ClientSocket::new(ClientOptions { host: addr.ip().to_string(), port: addr.port(), ..Default::default() });
        assert!(client.connect(Duration::from_secs(2)));

        let mut request = Vec::new();
        request.extend_from_slice(&0u64.to_le_bytes());
        request.extend_from_slice(&4u64.to_le_bytes());
        request.extend_from_slice(b"echo");
        let body = value_i64(7);
        let mut parts = vec![request];
        parts.extend(body.pack());
        client.send(parts, Duration::from_secs(1)).expect("send");

        let reply = client.recv(Duration::from_secs(2)).expect("recv");
        assert_eq!(u64::from_le_bytes(reply[0..8].try_into().unwrap()), 0);
        assert_eq!(u64::from_le_bytes(reply[8..16].try_into().unwrap()), 0);

        client.close(Some(Duration::from_millis(500)));
        server.close(Some(Duration::from_secs(1)));
    }

    #[test]
    fn stats_count_one_recv_and_one_send_per_completed_call() {
        let mut builder = RpcServerBuilder::<Value>::bind_socket(ServerOptions {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        })
        .expect("bind");
        let addr = builder.local_addr();
        builder.bind("double", BindOptions::default(), |args| match args {
            Value::Array { dtype, shape, data } => {
                let n = i64::from_le_bytes(data.as_ref().try_into().unwrap());
                Ok(Value::array(dtype, shape, (n * 2).to_le_bytes().to_vec()).unwrap())
            }
            _ => Err("expected scalar".to_string()),
        });
        let server = builder.start();

        let client = ClientSocket::new(ClientOptions { host: addr.ip().to_string(), port: addr.port(), ..Default::default() });
        assert!(client.connect(Duration::from_secs(2)));

        let mut request = Vec::new();
        request.extend_from_slice(&0u64.to_le_bytes());
        request.extend_from_slice(&6u64.to_le_bytes());
        request.extend_from_slice(b"double");
        let body = value_i64(42);
        let mut parts = vec![request];
        parts.extend(body.pack());
        client.send(parts, Duration::from_secs(1)).expect("send");
        client.recv(Duration::from_secs(2)).expect("recv");

        // Give the dispatcher a tick to record the send before we sample stats.
        std::thread::sleep(Duration::from_millis(50));
        let stats = server.stats();
        assert_eq!(stats.numrecv, 1);
        assert_eq!(stats.numsend, 1);

        client.close(Some(Duration::from_millis(500)));
        server.close(Some(Duration::from_secs(1)));
    }

    #[test]
    fn unknown_method_gets_status_three() {
        let mut builder = RpcServerBuilder::<Value>::bind_socket(ServerOptions {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        })
        .expect("bind");
        let addr = builder.local_addr();
        builder.bind("real", BindOptions::default(), |args| Ok(args));
        let server = builder.start();

        let client = ClientSocket::new(ClientOptions { host: addr.ip().to_string(), port: addr.port(), ..Default::default() });
        assert!(client.connect(Duration::from_secs(2)));
        let mut request = Vec::new();
        request.extend_from_slice(&1u64.to_le_bytes());
        request.extend_from_slice(&7u64.to_le_bytes());
        request.extend_from_slice(b"missing");
        client.send(vec![request], Duration::from_secs(1)).expect("send");

        let reply = client.recv(Duration::from_secs(2)).expect("recv");
        assert_eq!(u64::from_le_bytes(reply[8..16].try_into().unwrap()), StatusCode::UnknownMethod as u64);

        client.close(Some(Duration::from_millis(500)));
        server.close(Some(Duration::from_secs(1)));
    }
}
