//! RPC error taxonomy.

use chainrange_fetch::Retryable;
use thiserror::Error;

use crate::request::JsonRpcError;

/// Phrases nodes return when the requested block state was pruned.
const MISSING_STATE_PATTERNS: &[&str] = &[
    "missing trie node",
    "state is not available",
    "state not available",
    "historical state unavailable",
    "historical state not available",
];

/// Phrases of node errors that clear up on their own, e.g. a load-balanced
/// node that has not seen the requested block yet.
const TRANSIENT_NODE_PATTERNS: &[&str] = &["header not found", "unknown block"];

/// Errors that can occur while talking to an RPC endpoint.
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    /// HTTP request failed (non-2xx status, broken response, etc.).
    #[error("HTTP error: {0}")]
    Http(String),

    /// The endpoint could not be reached.
    #[error("Connection error: {0}")]
    Connect(String),

    /// JSON-RPC protocol-level error returned by the node.
    #[error("RPC error {}: {}", .0.code, .0.message)]
    Rpc(JsonRpcError),

    /// The node no longer has the state this call needs.
    #[error("Archive node needed on {chain} ({url}): {message}")]
    ArchiveNodeNeeded {
        chain: String,
        url: String,
        message: String,
    },

    /// Request timed out after the configured duration.
    #[error("Request timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// The batch response did not contain an answer for a request.
    #[error("No response for request id {id}")]
    MissingResponse { id: String },

    /// Response could not be deserialized.
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// No endpoint is registered for this chain.
    #[error("No RPC endpoints known for chain '{0}'")]
    UnknownChain(String),

    /// The limitations findings file could not be read or written.
    #[error("Findings file error: {0}")]
    Findings(String),
}

impl RpcError {
    /// Returns `true` if this error is retryable (transient).
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(_) | Self::Connect(_) | Self::Timeout { .. } | Self::MissingResponse { .. } => true,
            Self::Rpc(error) => matches_any(&error.message, TRANSIENT_NODE_PATTERNS),
            _ => false,
        }
    }

    /// Returns `true` if retrying on a non-archive node can never succeed.
    pub fn is_missing_historical_state(&self) -> bool {
        matches!(self, Self::ArchiveNodeNeeded { .. })
    }

    /// Turn a node error into an [`RpcError`], recognising pruned-state errors.
    pub fn from_node_error(error: JsonRpcError, chain: &str, url: &str) -> Self {
        if matches_any(&error.message, MISSING_STATE_PATTERNS) {
            Self::ArchiveNodeNeeded {
                chain: chain.to_string(),
                url: url.to_string(),
                message: error.message,
            }
        } else {
            Self::Rpc(error)
        }
    }
}

impl Retryable for RpcError {
    fn is_retryable(&self) -> bool {
        RpcError::is_retryable(self)
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(e: serde_json::Error) -> Self {
        Self::Deserialization(e.to_string())
    }
}

fn matches_any(message: &str, patterns: &[&str]) -> bool {
    let message = message.to_lowercase();
    patterns.iter().any(|p| message.contains(p))
}
