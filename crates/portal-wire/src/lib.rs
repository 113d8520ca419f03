mod client;
mod error;
mod frame;
mod handshake;
mod server;

pub use client::{ClientOptions, ClientSocket, RawSender, Resolver};
pub use error::{ClientError, ServerError};
pub use frame::{FrameError, RecvBuffer, SendBuffer, DEFAULT_MAX_MSG_SIZE};
pub use handshake::{HandshakeProgress, HandshakeValidator, DEFAULT_HANDSHAKE_TAG};
pub use server::{ClientId, ServerOptions, ServerSocket};
