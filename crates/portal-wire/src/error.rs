use thiserror::Error;

use crate::frame::FrameError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {0}")]
    Bind(std::io::Error),
    #[error("recv queue overflowed max_recv_queue, socket is dead")]
    RecvQueueOverflow,
    #[error("send queue overflowed max_send_queue")]
    SendQueueOverflow,
    #[error("client {0:?} is not connected")]
    UnknownClient(crate::server::ClientId),
    #[error("server socket is closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("not connected")]
    NotConnected,
    #[error("timed out waiting for connection")]
    ConnectTimeout,
    #[error("send queue is full")]
    SendQueueFull,
    #[error("timed out waiting for a response")]
    RecvTimeout,
    #[error("client socket is closed")]
    Closed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<FrameError> for ClientError {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::Io(e) => ClientError::Io(e),
            other => ClientError::Io(std::io::Error::other(other.to_string())),
        }
    }
}
