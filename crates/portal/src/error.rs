use portal_pack::Pack;
use portal_wire::{ClientId, ServerSocket};
use thiserror::Error;

/// Status codes carried on the wire in a response's `status` field.
/// See the wire protocol's error taxonomy: 0 is success, 1-6 are failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum StatusCode {
    Ok = 0,
    ShortOrMalformed = 1,
    DecodeFailure = 2,
    UnknownMethod = 3,
    WorkFnException = 4,
    NonArrayBatchedArg = 5,
    BatchStructureMismatch = 6,
}

impl StatusCode {
    pub fn from_u64(value: u64) -> Option<Self> {
        Some(match value {
            0 => Self::Ok,
            1 => Self::ShortOrMalformed,
            2 => Self::DecodeFailure,
            3 => Self::UnknownMethod,
            4 => Self::WorkFnException,
            5 => Self::NonArrayBatchedArg,
            6 => Self::BatchStructureMismatch,
            _ => return None,
        })
    }
}

/// Error surfaced to RPC client callers, either from a failed future or
/// raised directly by `call`.
#[derive(Debug, Error, Clone)]
pub enum RpcError {
    #[error("remote error (status {status:?}): {message}")]
    Remote { status: StatusCode, message: String },
    #[error("disconnected")]
    Disconnected,
    #[error("timed out waiting for a response")]
    Timeout,
    #[error("client is closed")]
    Closed,
    #[error("send queue is full")]
    SendQueueFull,
}

/// Wire-level response header shared by the RPC server and the batching
/// gateway: `reqnum:u64 LE ‖ status:u64 LE`.
pub(crate) fn encode_header(reqnum: u64, status: u64) -> Vec<u8> {
    let mut header = Vec::with_capacity(16);
    header.extend_from_slice(&reqnum.to_le_bytes());
    header.extend_from_slice(&status.to_le_bytes());
    header
}

pub(crate) fn send_err(socket: &ServerSocket, client: ClientId, reqnum: u64, status: StatusCode, message: &str) {
    let parts = vec![encode_header(reqnum, status as u64), message.as_bytes().to_vec()];
    let _ = socket.send(client, parts);
}

pub(crate) fn send_ok<V: Pack>(socket: &ServerSocket, client: ClientId, reqnum: u64, value: &V) {
    let mut parts = vec![encode_header(reqnum, StatusCode::Ok as u64)];
    parts.extend(value.pack());
    let _ = socket.send(client, parts);
}
