//! Limitation-aware JSON-RPC client.
//!
//! Splits request lists into batches no larger than what the endpoint
//! accepts for the method, spaces calls with the [`CallThrottle`] and
//! classifies node errors per item.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::RpcError;
use crate::limitations::{RpcLimitations, RPC_SOFT_TIMEOUT};
use crate::request::{JsonRpcRequest, JsonRpcResponse, RpcId, RpcMethod};
use crate::throttle::CallThrottle;
use crate::transport::RpcTransport;

pub struct LimitedRpcClient {
    chain: String,
    transport: Arc<dyn RpcTransport>,
    limitations: RpcLimitations,
    throttle: Arc<CallThrottle>,
    next_id: AtomicU64,
}

impl LimitedRpcClient {
    /// `limitations` must already be derived (see `LimitationRegistry`).
    pub fn new(
        chain: impl Into<String>,
        transport: Arc<dyn RpcTransport>,
        limitations: RpcLimitations,
        throttle: Arc<CallThrottle>,
    ) -> Self {
        Self {
            chain: chain.into(),
            transport,
            limitations,
            throttle,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn url(&self) -> &str {
        self.transport.url()
    }

    pub fn limitations(&self) -> &RpcLimitations {
        &self.limitations
    }

    /// Call `method` once per params list. Results come back in input order,
    /// one per call; a failed chunk fails every call in it.
    pub async fn call_many(&self, method: RpcMethod, params: Vec<Vec<Value>>) -> Vec<Result<Value, RpcError>> {
        let chunk_size = self.limitations.batch_size(method).unwrap_or(1).max(1);
        let mut results = Vec::with_capacity(params.len());
        let mut params = params.into_iter().peekable();

        while params.peek().is_some() {
            let chunk: Vec<JsonRpcRequest> = params
                .by_ref()
                .take(chunk_size)
                .map(|p| JsonRpcRequest::new(self.next_id.fetch_add(1, Ordering::Relaxed), method, p))
                .collect();
            results.extend(self.send_chunk(method, chunk).await);
        }
        results
    }

    /// Single call convenience over [`call_many`](Self::call_many).
    pub async fn call(&self, method: RpcMethod, params: Vec<Value>) -> Result<Value, RpcError> {
        self.call_many(method, vec![params])
            .await
            .pop()
            .unwrap_or_else(|| Err(RpcError::MissingResponse { id: "none".into() }))
    }

    /// Latest block number of the endpoint.
    pub async fn block_number(&self) -> Result<u64, RpcError> {
        let value = self.call(RpcMethod::BlockNumber, vec![]).await?;
        parse_quantity(&value)
    }

    async fn send_chunk(&self, method: RpcMethod, chunk: Vec<JsonRpcRequest>) -> Vec<Result<Value, RpcError>> {
        let ids: Vec<RpcId> = chunk.iter().map(|r| r.id.clone()).collect();
        let size = chunk.len();
        self.throttle
            .wait_turn(self.url(), self.limitations.min_delay_between_calls)
            .await;

        let started = Instant::now();
        let outcome = if size == 1 {
            match chunk.into_iter().next() {
                Some(req) => self.transport.send(req).await.map(|r| vec![r]),
                None => Ok(vec![]),
            }
        } else {
            self.transport.send_batch(chunk).await
        };
        let elapsed = started.elapsed();
        if elapsed > RPC_SOFT_TIMEOUT {
            warn!(
                url = %self.url(),
                method = %method,
                batch_size = size,
                elapsed_ms = elapsed.as_millis() as u64,
                "rpc call exceeded the soft timeout"
            );
        }

        match outcome {
            Ok(responses) => {
                debug!(url = %self.url(), method = %method, batch_size = size, "rpc batch done");
                self.match_responses(ids, responses)
            }
            Err(e) => {
                warn!(url = %self.url(), method = %method, batch_size = size, error = %e, "rpc batch failed");
                ids.iter().map(|_| Err(e.clone())).collect()
            }
        }
    }

    fn match_responses(&self, ids: Vec<RpcId>, responses: Vec<JsonRpcResponse>) -> Vec<Result<Value, RpcError>> {
        let mut by_id: HashMap<RpcId, JsonRpcResponse> =
            responses.into_iter().map(|r| (r.id.clone(), r)).collect();
        ids.into_iter()
            .map(|id| match by_id.remove(&id) {
                Some(resp) => resp
                    .into_result()
                    .map_err(|e| RpcError::from_node_error(e, &self.chain, self.url())),
                None => Err(RpcError::MissingResponse { id: id.to_string() }),
            })
            .collect()
    }
}

/// Parse a `0x`-prefixed hex quantity.
pub fn parse_quantity(value: &Value) -> Result<u64, RpcError> {
    let text = value
        .as_str()
        .ok_or_else(|| RpcError::Deserialization(format!("expected hex quantity, got {value}")))?;
    let digits = text.strip_prefix("0x").unwrap_or(text);
    u64::from_str_radix(digits, 16)
        .map_err(|e| RpcError::Deserialization(format!("invalid hex quantity '{text}': {e}")))
}
