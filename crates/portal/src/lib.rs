mod batch;
mod client;
mod context;
mod error;
mod server;

pub use batch::{BatchOptions, BatchServer, BatchServerBuilder, BindOptions as BatchBindOptions};
pub use client::{ClientOptions, ClientStats, RpcClient, RpcFuture};
pub use context::{Context, ContextBuilder};
pub use error::{RpcError, StatusCode};
pub use server::{BindOptions, RpcServer, RpcServerBuilder, ServerOptions, ServerStats};

pub use portal_pack;
pub use portal_utils;
pub use portal_wire;

/// Generates typed wrapper methods on [`RpcClient<Value>`](RpcClient),
/// replacing the Python source's dynamic `client.methodname(args)` attribute
/// dispatch with compile-time trait methods that forward to [`RpcClient::call`].
///
/// ```ignore
/// rpc_methods! {
///     impl Calculator for RpcClient<Value> {
///         fn add(args: &Value, timeout: Duration) -> Result<RpcFuture<Value>, RpcError>;
///         fn echo(args: &Value, timeout: Duration) -> Result<RpcFuture<Value>, RpcError>;
///     }
/// }
/// ```
#[macro_export]
macro_rules! rpc_methods {
    (impl $trait_name:ident for RpcClient<$value:ty> {
        $(fn $method:ident(args: &$argty:ty, timeout: std::time::Duration) -> Result<$fut:ty, $err:ty>;)+
    }) => {
        pub trait $trait_name {
            $(fn $method(&self, args: &$argty, timeout: std::time::Duration) -> Result<$fut, $err>;)+
        }

        impl $trait_name for $crate::RpcClient<$value> {
            $(
                fn $method(&self, args: &$argty, timeout: std::time::Duration) -> Result<$fut, $err> {
                    self.call(stringify!($method), args, timeout)
                }
            )+
        }
    };
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use portal_pack::Value;

    use crate::{RpcClient, RpcError, RpcFuture};

    rpc_methods! {
        impl Calculator for RpcClient<Value> {
            fn add(args: &Value, timeout: Duration) -> Result<RpcFuture<Value>, RpcError>;
        }
    }

    // Exercises that the macro's generated `add` compiles down to a `call`
    // forward; connection behavior itself is covered in client.rs/server.rs.
    fn _type_check(client: &RpcClient<Value>) {
        let _: fn(&RpcClient<Value>, &Value, Duration) -> Result<RpcFuture<Value>, RpcError> = Calculator::add;
        let _ = client;
    }
}
