//! rodent-jsonrpc: JSON-RPC Command Surface
//!
//! Provides:
//! - JSON-RPC 2.0 protocol types and error codes
//! - Line-delimited Unix-socket/TCP server with an async handler registry

pub mod protocol;
pub mod server;

pub use protocol::{error_codes, JsonRpcError, JsonRpcRequest, JsonRpcResponse};
pub use server::{HandlerFn, JsonRpcServer, JsonRpcServerConfig};
