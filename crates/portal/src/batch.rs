use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::Arc,
    thread::JoinHandle,
    time::{Duration, Instant},
};

use portal_pack::{Dtype, Value, flatten, map_leaves, unflatten};
use portal_utils::CancelToken;
use portal_wire::{ClientId, ServerError, ServerOptions as WireServerOptions, ServerSocket};
use tracing::warn;

use crate::{
    client::{ClientOptions as RpcClientOptions, RpcClient, RpcFuture},
    context::Context,
    error::{RpcError, StatusCode, send_err, send_ok},
};

const ADMIT_POLL: Duration = Duration::from_micros(100);

pub struct BatchOptions {
    pub bind_addr: SocketAddr,
    pub internal_host: String,
    pub internal_port: u16,
    pub handshake_tag: Vec<u8>,
    pub max_msg_size: usize,
    pub max_recv_queue: usize,
    pub max_send_queue: usize,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:0".parse().expect("valid default addr"),
            internal_host: "127.0.0.1".to_string(),
            internal_port: 0,
            handshake_tag: portal_wire::DEFAULT_HANDSHAKE_TAG.to_vec(),
            max_msg_size: portal_wire::DEFAULT_MAX_MSG_SIZE,
            max_recv_queue: 4096,
            max_send_queue: 65536,
        }
    }
}

/// Batch size bound to a method name. `0` means pass-through.
#[derive(Clone, Copy)]
pub struct BindOptions {
    pub batch_size: usize,
}

impl Default for BindOptions {
    fn default() -> Self {
        Self { batch_size: 0 }
    }
}

struct LeafBuffer {
    dtype: Dtype,
    elem_shape: Vec<u64>,
    elem_bytes: usize,
    data: Vec<u8>,
}

/// In-progress stack for one method, accumulating rows `0..n` before the
/// single inner call is made.
struct ActiveBatch {
    n: usize,
    structure: portal_pack::Structure,
    buffers: Vec<LeafBuffer>,
    client_ids: Vec<ClientId>,
    reqnums: Vec<u64>,
}

impl ActiveBatch {
    fn start(n: usize, args: &Value) -> Result<Self, String> {
        let (leaves, structure) = flatten(args);
        let mut buffers = Vec::with_capacity(leaves.len());
        for leaf in &leaves {
            match leaf {
                Value::Array { dtype, shape, data } => {
                    buffers.push(LeafBuffer {
                        dtype: *dtype,
                        elem_shape: shape.clone(),
                        elem_bytes: data.len(),
                        data: vec![0u8; data.len() * n],
                    });
                }
                _ => return Err("Only array arguments can be batched".to_string()),
            }
        }
        Ok(Self { n, structure, buffers, client_ids: Vec::with_capacity(n), reqnums: Vec::with_capacity(n) })
    }

    /// Copies `args` into the next free row. Returns whether the batch is
    /// now full and should be flushed.
    fn fill(&mut self, args: &Value, client: ClientId, reqnum: u64) -> Result<bool, String> {
        let (leaves, structure) = flatten(args);
        if structure != self.structure {
            return Err("batch structure mismatch".to_string());
        }
        let row = self.client_ids.len();
        for (buf, leaf) in self.buffers.iter_mut().zip(leaves.iter()) {
            let Value::Array { data, .. } = leaf else {
                unreachable!("structure equality already confirmed every leaf is an array")
            };
            let start = row * buf.elem_bytes;
            buf.data[start..start + buf.elem_bytes].copy_from_slice(data);
        }
        self.client_ids.push(client);
        self.reqnums.push(reqnum);
        Ok(self.client_ids.len() == self.n)
    }

    fn finish(self) -> (Value, Vec<ClientId>, Vec<u64>, usize) {
        let leaves: Vec<Value> = self
            .buffers
            .into_iter()
            .map(|buf| {
                let mut shape = vec![self.n as u64];
                shape.extend(buf.elem_shape);
                Value::array(buf.dtype, shape, buf.data).expect("destination buffer matches its own shape")
            })
            .collect();
        (unflatten(&self.structure, &leaves), self.client_ids, self.reqnums, self.n)
    }
}

struct MethodBatch {
    batch_size: usize,
    active: Option<ActiveBatch>,
}

struct PassthroughCall {
    client: ClientId,
    reqnum: u64,
    future: RpcFuture<Value>,
}

struct BatchedCall {
    client_ids: Vec<ClientId>,
    reqnums: Vec<u64>,
    n: usize,
    future: RpcFuture<Value>,
}

/// Builder for the batching gateway: binds its own external listening
/// socket and an [`RpcClient`] to the backing [`RpcServer`](crate::server::RpcServer)
/// on the internal port, per method batch sizes declared with `bind`.
pub struct BatchServerBuilder {
    socket: Arc<ServerSocket>,
    inner_client: RpcClient<Value>,
    methods: HashMap<String, MethodBatch>,
}

impl BatchServerBuilder {
    pub fn bind_external(ctx: &Arc<Context>, options: BatchOptions) -> Result<Self, ServerError> {
        let wire_options = WireServerOptions {
            bind_addr: options.bind_addr,
            handshake_tag: options.handshake_tag.clone(),
            max_msg_size: options.max_msg_size,
            max_recv_queue: options.max_recv_queue,
            max_send_queue: options.max_send_queue,
            ..Default::default()
        };
        let socket = ServerSocket::bind(wire_options)?;
        let inner_client = RpcClient::connect(
            ctx,
            RpcClientOptions {
                host: options.internal_host,
                port: options.internal_port,
                handshake_tag: options.handshake_tag,
                max_msg_size: options.max_msg_size,
                ..Default::default()
            },
        );
        Ok(Self { socket: Arc::new(socket), inner_client, methods: HashMap::new() })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    pub fn bind(&mut self, name: impl Into<String>, options: BindOptions) {
        self.methods.insert(name.into(), MethodBatch { batch_size: options.batch_size, active: None });
    }

    pub fn start(self) -> BatchServer {
        let shutting_down = CancelToken::new();
        let local_addr = self.socket.local_addr();
        let dispatcher = Dispatcher {
            socket: self.socket,
            inner_client: self.inner_client,
            methods: self.methods,
            passthrough: Vec::new(),
            batched: Vec::new(),
            shutting_down: shutting_down.clone(),
        };
        let handle = std::thread::Builder::new()
            .name("portal-batch-dispatch".to_string())
            .spawn(move || dispatcher.run())
            .expect("failed to spawn batch dispatcher thread");
        BatchServer { local_addr, shutting_down, handle: Some(handle) }
    }
}

/// Running batching gateway handle.
pub struct BatchServer {
    local_addr: SocketAddr,
    shutting_down: CancelToken,
    handle: Option<JoinHandle<()>>,
}

impl BatchServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops admitting new requests; already-submitted inner calls (and any
    /// full batch already flushed) are serviced to completion, bounded by
    /// `timeout`. Requests stuck in a partially-filled batch when `close` is
    /// called are dropped without a reply, matching a best-effort shutdown.
    pub fn close(mut self, timeout: Option<Duration>) {
        self.shutting_down.cancel();
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
                        warn!("batch dispatcher still running at close timeout, detaching");
                    }
                }
            }
        }
    }
}

struct Dispatcher {
    socket: Arc<ServerSocket>,
    inner_client: RpcClient<Value>,
    methods: HashMap<String, MethodBatch>,
    passthrough: Vec<PassthroughCall>,
    batched: Vec<BatchedCall>,
    shutting_down: CancelToken,
}

impl Dispatcher {
    fn run(mut self) {
        loop {
            if !self.shutting_down.is_cancelled() {
                self.admit();
            }
            self.complete();
            if self.shutting_down.is_cancelled() && self.passthrough.is_empty() && self.batched.is_empty() {
                break;
            }
        }
        self.inner_client.close(Some(Duration::from_millis(200)));
        if let Ok(socket) = Arc::try_unwrap(self.socket) {
            socket.close(Some(Duration::from_millis(200)));
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
        let args = match Value::unpack(&bytes[16 + name_len..]) {
            Ok(args) => args,
            Err(err) => {
                send_err(&self.socket, client, reqnum, StatusCode::DecodeFailure, &err.to_string());
                return;
            }
        };
        let Some(method) = self.methods.get_mut(&name) else {
            send_err(&self.socket, client, reqnum, StatusCode::UnknownMethod, &format!("Unknown method {name}"));
            return;
        };

        if method.batch_size == 0 {
            let future = match self.inner_client.call(&name, &args, Duration::from_secs(30)) {
                Ok(future) => future,
                Err(err) => {
                    let (status, message) = map_rpc_error(&err);
                    send_err(&self.socket, client, reqnum, status, &message);
                    return;
                }
            };
            self.passthrough.push(PassthroughCall { client, reqnum, future });
            return;
        }

        let flush = match &mut method.active {
            None => match ActiveBatch::start(method.batch_size, &args) {
                Ok(mut batch) => {
                    let full = batch.fill(&args, client, reqnum).expect("freshly started batch always matches");
                    method.active = Some(batch);
                    full
                }
                Err(message) => {
                    send_err(&self.socket, client, reqnum, StatusCode::NonArrayBatchedArg, &message);
                    return;
                }
            },
            Some(batch) => match batch.fill(&args, client, reqnum) {
                Ok(full) => full,
                Err(message) => {
                    send_err(&self.socket, client, reqnum, StatusCode::BatchStructureMismatch, &message);
                    return;
                }
            },
        };

        if flush {
            let batch = method.active.take().expect("just filled it above");
            let (batched_args, client_ids, reqnums, n) = batch.finish();
            match self.inner_client.call(&name, &batched_args, Duration::from_secs(30)) {
                Ok(future) => self.batched.push(BatchedCall { client_ids, reqnums, n, future }),
                Err(err) => {
                    let (status, message) = map_rpc_error(&err);
                    for (client, reqnum) in client_ids.into_iter().zip(reqnums) {
                        send_err(&self.socket, client, reqnum, status, &message);
                    }
                }
            }
        }
    }

    fn complete(&mut self) {
        let mut i = 0;
        while i < self.passthrough.len() {
            if self.passthrough[i].future.done() {
                let call = self.passthrough.swap_remove(i);
                match call.future.result(Some(Duration::ZERO)) {
                    Ok(value) => send_ok(&self.socket, call.client, call.reqnum, &value),
                    Err(err) => {
                        let (status, message) = map_rpc_error(&err);
                        send_err(&self.socket, call.client, call.reqnum, status, &message);
                    }
                }
            } else {
                i += 1;
            }
        }

        let mut i = 0;
        while i < self.batched.len() {
            if self.batched[i].future.done() {
                let call = self.batched.swap_remove(i);
                match call.future.result(Some(Duration::ZERO)) {
                    Ok(value) => {
                        for row in 0..call.n {
                            match unstack_row(&value, row, call.n) {
                                Ok(row_value) => {
                                    send_ok(&self.socket, call.client_ids[row], call.reqnums[row], &row_value);
                                }
                                Err(message) => send_err(
                                    &self.socket,
                                    call.client_ids[row],
                                    call.reqnums[row],
                                    StatusCode::BatchStructureMismatch,
                                    &message,
                                ),
                            }
                        }
                    }
                    Err(err) => {
                        let (status, message) = map_rpc_error(&err);
                        for (client, reqnum) in call.client_ids.into_iter().zip(call.reqnums) {
                            send_err(&self.socket, client, reqnum, status, &message);
                        }
                    }
                }
            } else {
                i += 1;
            }
        }
    }
}

/// Slices row `row` of a batched `(N, *leaf.shape)` result back out, for
/// every leaf, reconstructing the single-caller value.
fn unstack_row(result: &Value, row: usize, n: usize) -> Result<Value, String> {
    let mut error = None;
    let sliced = map_leaves(result, |leaf| match leaf {
        Value::Array { dtype, shape, data } => {
            if shape.first().copied() != Some(n as u64) {
                error = Some("batched result leading axis does not match batch size".to_string());
                return Value::Null;
            }
            let elem_shape = shape[1..].to_vec();
            let elem_bytes = data.len() / n;
            let start = row * elem_bytes;
            match Value::array(*dtype, elem_shape, data[start..start + elem_bytes].to_vec()) {
                Ok(value) => value,
                Err(err) => {
                    error = Some(err.to_string());
                    Value::Null
                }
            }
        }
        other => other.clone(),
    });
    match error {
        Some(message) => Err(message),
        None => Ok(sliced),
    }
}

fn map_rpc_error(err: &RpcError) -> (StatusCode, String) {
    match err {
        RpcError::Remote { status, message } => (*status, message.clone()),
        other => (StatusCode::WorkFnException, other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{context::Context, server::{BindOptions as ServerBindOptions, RpcServerBuilder, ServerOptions as RpcServerOptions}};

    fn scalar(v: i64) -> Value {
        Value::array(Dtype::I64, vec![], v.to_le_bytes().to_vec()).expect("scalar array")
    }

    #[test]
    fn passthrough_forwards_single_call() {
        let ctx = Context::builder().build();
        let mut inner = RpcServerBuilder::<Value>::bind_socket(RpcServerOptions {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        })
        .expect("bind inner");
        let inner_addr = inner.local_addr();
        inner.bind("double", ServerBindOptions::default(), |args| match args {
            Value::Array { dtype, shape, data } => {
                let n = i64::from_le_bytes(data.as_ref().try_into().unwrap());
                Value::array(dtype, shape, (n * 2).to_le_bytes().to_vec()).map_err(|e| e.to_string())
            }
            _ => Err("expected scalar".to_string()),
        });
        let inner_server = inner.start();

        let mut gateway = BatchServerBuilder::bind_external(
            &ctx,
            BatchOptions { internal_host: "127.0.0.1".to_string(), internal_port: inner_addr.port(), ..Default::default() },
        )
        .expect("bind gateway");
        let gateway_addr = gateway.local_addr();
        gateway.bind("double", BindOptions { batch_size: 0 });
        let gateway_server = gateway.start();

        let outer = portal_wire::ClientSocket::new(portal_wire::ClientOptions {
            host: gateway_addr.ip().to_string(),
            port: gateway_addr.port(),
            ..Default::default()
        });
        assert!(outer.connect(Duration::from_secs(2)));
        let mut request = Vec::new();
        request.extend_from_slice(&0u64.to_le_bytes());
        request.extend_from_slice(&6u64.to_le_bytes());
        request.extend_from_slice(b"double");
        let mut parts = vec![request];
        parts.extend(scalar(21).pack());
        outer.send(parts, Duration::from_secs(1)).expect("send");

        let reply = outer.recv(Duration::from_secs(2)).expect("recv");
        assert_eq!(u64::from_le_bytes(reply[8..16].try_into().unwrap()), 0);
        let body = Value::unpack(&reply[16..]).expect("unpack");
        assert_eq!(body, scalar(42));

        outer.close(Some(Duration::from_millis(500)));
        gateway_server.close(Some(Duration::from_secs(1)));
        inner_server.close(Some(Duration::from_secs(1)));
    }
}
