use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Condvar, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use portal_pack::{Pack, PackError, Unpack};
use portal_wire::{ClientOptions as WireClientOptions, ClientSocket, RawSender, Resolver};
use tracing::{debug, warn};

use crate::{
    context::Context,
    error::{RpcError, StatusCode},
};

const ADMISSION_POLL: Duration = Duration::from_millis(200);

pub struct ClientOptions {
    pub host: String,
    pub port: u16,
    pub autoconn: bool,
    pub max_inflight: usize,
    pub max_send_queue: usize,
    pub max_recv_queue: usize,
    pub handshake_tag: Vec<u8>,
    pub max_msg_size: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            autoconn: true,
            max_inflight: 16,
            max_send_queue: 128,
            max_recv_queue: 128,
            handshake_tag: portal_wire::DEFAULT_HANDSHAKE_TAG.to_vec(),
            max_msg_size: portal_wire::DEFAULT_MAX_MSG_SIZE,
        }
    }
}

enum FutureState<V> {
    Pending,
    Resolved(V),
    Failed(RpcError),
}

struct FutureInner<V> {
    state: Mutex<FutureState<V>>,
    done: Condvar,
    /// Set the one time a stored error is actually observed via `result()`,
    /// so a dropped-without-await future still surfaces it exactly once
    /// (via the abandoned-errors deque) instead of twice.
    raised: std::sync::atomic::AtomicBool,
}

/// Handle to one in-flight (or completed) RPC call.
///
/// An explicit `Drop` takes the place of the Python source's
/// `weakref.finalize`: if the future failed and nobody called `result()`
/// before it's dropped, the error is pushed onto the client's abandoned-error
/// deque so the next `call` surfaces it.
pub struct RpcFuture<V> {
    reqnum: u64,
    inner: Arc<FutureInner<V>>,
    abandoned: Arc<Mutex<VecDeque<RpcError>>>,
}

impl<V> RpcFuture<V> {
    pub fn reqnum(&self) -> u64 {
        self.reqnum
    }

    pub fn done(&self) -> bool {
        !matches!(*self.inner.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner), FutureState::Pending)
    }

    /// Blocks up to `timeout` (None = forever); returns whether it finished.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let mut guard = self.inner.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        match timeout {
            None => {
                while matches!(*guard, FutureState::Pending) {
                    guard = self.inner.done.wait(guard).unwrap_or_else(std::sync::PoisonError::into_inner);
                }
                true
            }
            Some(timeout) => {
                let start = std::time::Instant::now();
                while matches!(*guard, FutureState::Pending) {
                    let remaining = timeout.saturating_sub(start.elapsed());
                    if remaining.is_zero() {
                        return false;
                    }
                    let (next, result) = self
                        .inner
                        .done
                        .wait_timeout(guard, remaining)
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                    guard = next;
                    if result.timed_out() && matches!(*guard, FutureState::Pending) {
                        return false;
                    }
                }
                true
            }
        }
    }
}

impl<V: Clone> RpcFuture<V> {
    /// Blocks up to `timeout`, returning the value or raising the stored
    /// error. Raises `RpcError::Timeout` if not done in time. Marks the
    /// error as raised so `Drop` doesn't push it onto the abandoned deque
    /// again.
    pub fn result(&self, timeout: Option<Duration>) -> Result<V, RpcError> {
        if !self.wait(timeout) {
            return Err(RpcError::Timeout);
        }
        self.raised.store(true, Ordering::Release);
        match &*self.inner.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner) {
            FutureState::Resolved(value) => Ok(value.clone()),
            FutureState::Failed(err) => Err(err.clone()),
            FutureState::Pending => unreachable!("wait() returned true"),
        }
    }
}

impl<V> std::ops::Deref for RpcFuture<V> {
    type Target = std::sync::atomic::AtomicBool;

    fn deref(&self) -> &Self::Target {
        &self.inner.raised
    }
}

impl<V> Drop for RpcFuture<V> {
    fn drop(&mut self) {
        if self.raised.load(Ordering::Acquire) {
            return;
        }
        let state = self.inner.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let FutureState::Failed(err) = &*state {
            self.abandoned.lock().unwrap_or_else(std::sync::PoisonError::into_inner).push_back(err.clone());
        }
    }
}

struct PendingCall<V> {
    inner: Arc<FutureInner<V>>,
    resend_bytes: Vec<Vec<u8>>,
    needs_resend: bool,
}

/// Running counters mirroring the original source's `Client.stats()`
/// (`portal/client.py`): send/recv counts and mean time spent blocked on
/// admission before a call's frame is handed to the socket.
#[derive(Default)]
struct StatsInner {
    numsend: AtomicU64,
    numrecv: AtomicU64,
    admission_wait_nanos: AtomicU64,
    admission_samples: AtomicU64,
}

/// Snapshot returned by [`RpcClient::stats`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientStats {
    pub numsend: u64,
    pub numrecv: u64,
    pub mean_admission_wait: Duration,
}

struct Shared<V> {
    futures: Mutex<HashMap<u64, PendingCall<V>>>,
    admission: Condvar,
    abandoned: Arc<Mutex<VecDeque<RpcError>>>,
    max_inflight: usize,
    autoconn: bool,
    raw_sender: Mutex<Option<RawSender>>,
    stats: StatsInner,
}

/// RPC client: numbers calls, caps in-flight count, and resolves responses
/// into [`RpcFuture`]s. Generic over the packing representation so it can
/// be driven by `portal_pack::Value` or any other `Pack + Unpack` type.
pub struct RpcClient<V> {
    socket: ClientSocket,
    reqnum: AtomicU64,
    shared: Arc<Shared<V>>,
}

impl<V> RpcClient<V>
where
    V: Pack + Unpack + Clone + Send + Sync + 'static,
{
    pub fn connect(ctx: &Arc<Context>, options: ClientOptions) -> Self {
        let shared = Arc::new(Shared {
            futures: Mutex::new(HashMap::new()),
            admission: Condvar::new(),
            abandoned: Arc::new(Mutex::new(VecDeque::new())),
            max_inflight: options.max_inflight,
            autoconn: options.autoconn,
            raw_sender: Mutex::new(None),
            stats: StatsInner::default(),
        });

        let recv_shared = shared.clone();
        let disc_shared = shared.clone();
        let conn_shared = shared.clone();
        let resolver: Resolver = ctx.resolver();

        let wire_options = WireClientOptions {
            host: options.host,
            port: options.port,
            autoconn: options.autoconn,
            handshake_tag: options.handshake_tag,
            max_msg_size: options.max_msg_size,
            max_send_queue: options.max_send_queue,
            max_recv_queue: options.max_recv_queue,
            resolver,
            on_recv: Some(Box::new(move |bytes: &[u8]| Self::on_recv(&recv_shared, bytes))),
            on_conn: Some(Box::new(move || Self::on_conn(&conn_shared))),
            on_disc: Some(Box::new(move || Self::on_disc(&disc_shared))),
            ..Default::default()
        };

        let socket = ClientSocket::new(wire_options);
        *shared.raw_sender.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(socket.raw_sender());
        Self { socket, reqnum: AtomicU64::new(0), shared }
    }

    fn on_recv(shared: &Arc<Shared<V>>, bytes: &[u8]) {
        shared.stats.numrecv.fetch_add(1, Ordering::Relaxed);
        if bytes.len() < 16 {
            warn!("response frame shorter than reqnum+status header, dropping");
            return;
        }
        let reqnum = u64::from_le_bytes(bytes[0..8].try_into().expect("8 bytes"));
        let status = u64::from_le_bytes(bytes[8..16].try_into().expect("8 bytes"));
        let body = &bytes[16..];

        let mut futures = shared.futures.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(pending) = futures.remove(&reqnum) else {
            debug!(reqnum, "response for unknown reqnum, ignoring (likely post-reconnect)");
            return;
        };
        drop(futures);

        let resolved = if status == 0 {
            match V::unpack(body) {
                Ok(value) => FutureState::Resolved(value),
                Err(err) => FutureState::Failed(decode_error(err)),
            }
        } else {
            let message = String::from_utf8_lossy(body).to_string();
            let code = StatusCode::from_u64(status).unwrap_or(StatusCode::WorkFnException);
            FutureState::Failed(RpcError::Remote { status: code, message })
        };

        *pending.inner.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = resolved;
        pending.inner.done.notify_all();
        shared.admission.notify_all();
    }

    fn on_conn(shared: &Arc<Shared<V>>) {
        if !shared.autoconn {
            return;
        }
        let Some(sender) = shared.raw_sender.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone()
        else {
            return;
        };
        let mut futures = shared.futures.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        for pending in futures.values_mut() {
            if pending.needs_resend {
                if let Err(err) = sender.send_raw(pending.resend_bytes.clone()) {
                    warn!(?err, "failed to resend in-flight call after reconnect");
                } else {
                    pending.needs_resend = false;
                }
            }
        }
    }

    fn on_disc(shared: &Arc<Shared<V>>) {
        let mut futures = shared.futures.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if shared.autoconn {
            for pending in futures.values_mut() {
                pending.needs_resend = true;
            }
        } else {
            for (_, pending) in futures.drain() {
                *pending.inner.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner) =
                    FutureState::Failed(RpcError::Disconnected);
                pending.inner.done.notify_all();
            }
        }
        shared.admission.notify_all();
    }

    /// Issues `name(args)`. Blocks while `max_inflight` is reached (waking
    /// every 200 ms to re-check the connection), raises any error abandoned
    /// by a previously-dropped future, then hands the frame to the socket.
    pub fn call(&self, name: &str, args: &V, timeout: Duration) -> Result<RpcFuture<V>, RpcError> {
        {
            let mut abandoned = self.shared.abandoned.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(err) = abandoned.pop_front() {
                return Err(err);
            }
        }

        let admission_start = Instant::now();
        {
            let mut futures = self.shared.futures.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            while futures.len() >= self.shared.max_inflight {
                let (next, _) = self
                    .shared
                    .admission
                    .wait_timeout(futures, ADMISSION_POLL)
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                futures = next;
            }
        }
        self.shared.stats.admission_wait_nanos.fetch_add(admission_start.elapsed().as_nanos() as u64, Ordering::Relaxed);
        self.shared.stats.admission_samples.fetch_add(1, Ordering::Relaxed);

        let reqnum = self.reqnum.fetch_add(1, Ordering::Relaxed);
        let parts = encode_request(reqnum, name, args);

        let inner = Arc::new(FutureInner {
            state: Mutex::new(FutureState::Pending),
            done: Condvar::new(),
            raised: std::sync::atomic::AtomicBool::new(false),
        });

        self.socket.send(parts.clone(), timeout).map_err(|_| RpcError::SendQueueFull)?;
        self.shared.stats.numsend.fetch_add(1, Ordering::Relaxed);

        self.shared.futures.lock().unwrap_or_else(std::sync::PoisonError::into_inner).insert(
            reqnum,
            PendingCall { inner: inner.clone(), resend_bytes: parts, needs_resend: false },
        );

        Ok(RpcFuture { reqnum, inner, abandoned: self.shared.abandoned.clone() })
    }

    pub fn close(self, timeout: Option<Duration>) {
        self.socket.close(timeout);
    }

    /// Running send/recv counts and mean time spent blocked on admission,
    /// mirroring the original source's `Client.stats()`.
    pub fn stats(&self) -> ClientStats {
        let samples = self.shared.stats.admission_samples.load(Ordering::Relaxed);
        let mean_admission_wait = if samples == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(self.shared.stats.admission_wait_nanos.load(Ordering::Relaxed) / samples)
        };
        ClientStats {
            numsend: self.shared.stats.numsend.load(Ordering::Relaxed),
            numrecv: self.shared.stats.numrecv.load(Ordering::Relaxed),
            mean_admission_wait,
        }
    }
}

fn encode_request<V: Pack>(reqnum: u64, name: &str, args: &V) -> Vec<Vec<u8>> {
    let name_bytes = name.as_bytes();
    let mut header = Vec::with_capacity(8 + 8 + name_bytes.len());
    header.extend_from_slice(&reqnum.to_le_bytes());
    header.extend_from_slice(&(name_bytes.len() as u64).to_le_bytes());
    header.extend_from_slice(name_bytes);
    let mut parts = vec![header];
    parts.extend(args.pack());
    parts
}

fn decode_error(err: PackError) -> RpcError {
    RpcError::Remote { status: StatusCode::DecodeFailure, message: err.to_string() }
}

#[cfg(test)]
mod tests {
    use portal_pack::Value;

    use super::*;

    #[test]
    fn encodes_request_header_correctly() {
        let parts = encode_request(7, "echo", &Value::Null);
        let header = &parts[0];
        assert_eq!(u64::from_le_bytes(header[0..8].try_into().unwrap()), 7);
        assert_eq!(u64::from_le_bytes(header[8..16].try_into().unwrap()), 4);
        assert_eq!(&header[16..20], b"echo");
    }
}
