//! chainrange-rpc: talking to JSON-RPC endpoints within their limits.
//!
//! - [`LimitationRegistry`] / [`FindingsFile`]: measured limits per endpoint
//!   and the limits derived from them
//! - [`CallThrottle`]: minimum spacing between calls to one endpoint
//! - [`RpcTransport`] / [`HttpTransport`]: the wire
//! - [`LimitedRpcClient`]: batches sized to the endpoint, errors per item
//! - [`RpcError`]: error taxonomy, including pruned-state detection

pub mod client;
pub mod error;
pub mod limitations;
pub mod request;
pub mod throttle;
pub mod transport;

pub use client::{parse_quantity, LimitedRpcClient};
pub use error::RpcError;
pub use limitations::{
    FindingsFile, LimitationRegistry, MinDelay, RawFindings, RpcLimitations, SafetyMargins,
    MAX_RPC_BATCHING_SIZE, MAX_RPC_GETLOGS_SPAN, RPC_SOFT_TIMEOUT,
};
pub use request::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, RpcId, RpcMethod};
pub use throttle::CallThrottle;
pub use transport::{HttpTransport, RpcTransport};
