//! The `RpcTransport` trait and its HTTP implementation.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::RpcError;
use crate::limitations::RPC_SOFT_TIMEOUT;
use crate::request::{JsonRpcRequest, JsonRpcResponse};

/// Sends JSON-RPC requests to one endpoint.
///
/// The trait is object-safe and can be stored as `Arc<dyn RpcTransport>`.
#[async_trait]
pub trait RpcTransport: Send + Sync + 'static {
    /// Send a single JSON-RPC request and return the response.
    async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, RpcError>;

    /// Send a batch of JSON-RPC requests.
    ///
    /// Default implementation sends them sequentially; override for true batching.
    async fn send_batch(&self, reqs: Vec<JsonRpcRequest>) -> Result<Vec<JsonRpcResponse>, RpcError> {
        let mut responses = Vec::with_capacity(reqs.len());
        for req in reqs {
            responses.push(self.send(req).await?);
        }
        Ok(responses)
    }

    /// The endpoint URL.
    fn url(&self) -> &str;
}

/// JSON-RPC over HTTP, backed by `reqwest`.
pub struct HttpTransport {
    url: String,
    http: reqwest::Client,
    request_timeout: Duration,
}

impl HttpTransport {
    pub fn new(url: impl Into<String>, request_timeout: Duration) -> Result<Self, RpcError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| RpcError::Http(format!("failed to build http client: {e}")))?;
        Ok(Self {
            url: url.into(),
            http,
            request_timeout,
        })
    }

    /// Transport whose request timeout is twice the soft timeout.
    pub fn default_for(url: impl Into<String>) -> Result<Self, RpcError> {
        Self::new(url, RPC_SOFT_TIMEOUT * 2)
    }

    async fn post<B, R>(&self, body: &B) -> Result<R, RpcError>
    where
        B: serde::Serialize + ?Sized,
        R: serde::de::DeserializeOwned,
    {
        let resp = self
            .http
            .post(&self.url)
            .json(body)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(RpcError::Http(format!("HTTP {status}: {body}")));
        }

        resp.json::<R>().await.map_err(|e| self.classify(e))
    }

    fn classify(&self, e: reqwest::Error) -> RpcError {
        if e.is_timeout() {
            RpcError::Timeout {
                ms: u64::try_from(self.request_timeout.as_millis()).unwrap_or(u64::MAX),
            }
        } else if e.is_connect() {
            RpcError::Connect(e.to_string())
        } else if e.is_decode() {
            RpcError::Deserialization(e.to_string())
        } else {
            RpcError::Http(e.to_string())
        }
    }
}

#[async_trait]
impl RpcTransport for HttpTransport {
    async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, RpcError> {
        self.post(&req).await
    }

    /// True HTTP batch: all requests as a JSON array in one HTTP call.
    async fn send_batch(&self, reqs: Vec<JsonRpcRequest>) -> Result<Vec<JsonRpcResponse>, RpcError> {
        if reqs.is_empty() {
            return Ok(vec![]);
        }
        self.post(&reqs).await
    }

    fn url(&self) -> &str {
        &self.url
    }
}
