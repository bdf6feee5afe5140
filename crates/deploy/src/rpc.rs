//! Minimal Ethereum JSON-RPC transport.

use std::{
    future::Future,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use anyhow::Context;
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::Value;
use url::Url;

/// Default timeout for a single RPC request.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default interval between polls (readiness, receipts).
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Failure of a JSON-RPC call.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// The node answered with a JSON-RPC error object.
    #[error("RPC error {code}: {message}")]
    Node {
        code: i64,
        message: String,
        data: Option<Value>,
    },
    /// The request never got a well-formed answer.
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

impl RpcError {
    /// Whether the node rejected the call because execution reverted.
    pub fn is_revert(&self) -> bool {
        match self {
            Self::Node { code, message, .. } => *code == 3 || message.contains("revert"),
            Self::Transport(_) => false,
        }
    }
}

#[derive(Deserialize)]
struct ErrorObject {
    code: i64,
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Deserialize)]
struct Response {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<ErrorObject>,
}

/// An HTTP JSON-RPC endpoint.
#[derive(Debug)]
pub struct RpcTransport {
    client: reqwest::Client,
    url: Url,
    next_id: AtomicU64,
}

impl RpcTransport {
    pub fn new(url: Url, request_timeout: Duration) -> Result<Self, anyhow::Error> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            url,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Call `method` and deserialize its result.
    ///
    /// A `null` result deserializes into `T` as well, so polling methods such
    /// as `eth_getTransactionReceipt` should ask for an `Option`.
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<T, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let response: Response = self
            .client
            .post(self.url.clone())
            .json(&serde_json::json!({
                "jsonrpc": "2.0",
                "method": method,
                "params": params,
                "id": id,
            }))
            .send()
            .await
            .with_context(|| format!("Failed to send {method} request"))?
            .json()
            .await
            .with_context(|| format!("Failed to parse {method} response"))?;

        if let Some(error) = response.error {
            return Err(RpcError::Node {
                code: error.code,
                message: error.message,
                data: error.data,
            });
        }

        let result = response.result.unwrap_or(Value::Null);
        serde_json::from_value(result)
            .with_context(|| format!("Failed to deserialize {method} result"))
            .map_err(RpcError::Transport)
    }

    /// Wait until the endpoint answers `eth_chainId`, returning the chain id.
    pub async fn wait_until_ready(&self, timeout: Duration) -> Result<u64, anyhow::Error> {
        let start = std::time::Instant::now();

        loop {
            match self.call::<alloy_core::primitives::U64>("eth_chainId", Vec::new()).await {
                Ok(chain_id) => return Ok(chain_id.to::<u64>()),
                Err(err) => {
                    if start.elapsed() > timeout {
                        return Err(anyhow::Error::new(err)
                            .context(format!("Timeout waiting for RPC endpoint {}", self.url)));
                    }
                    tracing::trace!(error = %err, url = %self.url, "Endpoint not ready, retrying...");
                }
            }

            tokio::time::sleep(DEFAULT_POLL_INTERVAL).await;
        }
    }
}

/// Poll `check` every `interval` until it yields a value.
///
/// There is no deadline here; callers bound the wait when they need to.
pub async fn poll_until<T, E, F, Fut>(interval: Duration, mut check: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    loop {
        if let Some(value) = check().await? {
            return Ok(value);
        }
        tokio::time::sleep(interval).await;
    }
}
