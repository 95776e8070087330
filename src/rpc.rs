//! JSON-RPC transport for Substrate nodes
//!
//! One pooled keep-alive HTTP client per transport. Both single calls and
//! JSON-RPC batches are supported; batch entries carry caller-chosen ids so
//! answers can be mapped back to the request that produced them.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

/// Failure of a single RPC exchange.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("Rate limited by RPC node (429 Too Many Requests)")]
    RateLimited,
    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("Malformed RPC response: {0}")]
    Malformed(String),
}

impl RpcError {
    /// Whether the node asked us to slow down.
    ///
    /// Some nodes report rate limiting inside the JSON-RPC error body rather
    /// than with an HTTP status, so the message is checked as well.
    pub fn is_rate_limited(&self) -> bool {
        match self {
            RpcError::RateLimited => true,
            other => {
                let message = other.to_string();
                message.contains("429") || message.contains("Too Many Requests")
            }
        }
    }
}

/// One entry of a JSON-RPC batch.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcCall {
    pub id: String,
    pub method: &'static str,
    pub params: Value,
}

/// Results of a batch keyed by call id. Ids the node did not answer are absent.
pub type BatchResults = HashMap<String, Result<Value, RpcError>>;

/// The wire seam of the chain client.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    /// Make a single JSON-RPC call and return its `result`.
    async fn request(&self, method: &str, params: Value) -> Result<Value, RpcError>;

    /// Send several calls as one JSON-RPC batch.
    async fn batch(&self, calls: Vec<RpcCall>) -> Result<BatchResults, RpcError>;

    /// Cheap liveness probe.
    async fn is_alive(&self) -> bool;

    /// Drop the current connection pool and start a fresh one.
    async fn reconnect(&self) -> Result<(), RpcError>;
}

/// JSON-RPC 2.0 over HTTP.
pub struct HttpTransport {
    url: String,
    timeout: Duration,
    client: RwLock<reqwest::Client>,
}

impl HttpTransport {
    /// Create a transport for `url`. No request is made until the first call.
    pub fn new(url: String, timeout: Duration) -> Result<Self, RpcError> {
        let client = build_client(timeout)?;
        Ok(Self {
            url,
            timeout,
            client: RwLock::new(client),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    // reqwest::Client is a cheap handle; clone it so no lock is held across I/O
    fn client(&self) -> reqwest::Client {
        self.client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn post(&self, body: &Value) -> Result<Value, RpcError> {
        let response = self.client().post(&self.url).json(body).send().await?;

        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            return Err(RpcError::RateLimited);
        }

        let response = response.error_for_status()?;
        Ok(response.json().await?)
    }
}

fn build_client(timeout: Duration) -> Result<reqwest::Client, RpcError> {
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .tcp_keepalive(Duration::from_secs(30))
        .pool_idle_timeout(Duration::from_secs(90))
        .build()?;
    Ok(client)
}

#[async_trait]
impl RpcTransport for HttpTransport {
    async fn request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let request = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params
        });

        let response = self.post(&request).await?;
        extract_result(&response)
    }

    async fn batch(&self, calls: Vec<RpcCall>) -> Result<BatchResults, RpcError> {
        if calls.is_empty() {
            return Ok(HashMap::new());
        }

        let request: Vec<Value> = calls
            .iter()
            .map(|call| {
                json!({
                    "jsonrpc": "2.0",
                    "id": call.id,
                    "method": call.method,
                    "params": call.params
                })
            })
            .collect();

        let response = self.post(&Value::Array(request)).await?;
        split_batch_response(response)
    }

    async fn is_alive(&self) -> bool {
        self.request("system_health", json!([])).await.is_ok()
    }

    async fn reconnect(&self) -> Result<(), RpcError> {
        let fresh = build_client(self.timeout)?;
        *self.client.write().unwrap_or_else(PoisonError::into_inner) = fresh;
        tracing::info!("Rebuilt RPC connection to {}", self.url);
        Ok(())
    }
}

/// Pull `result` out of a JSON-RPC response object, mapping `error` to [`RpcError::Rpc`].
pub fn extract_result(response: &Value) -> Result<Value, RpcError> {
    if let Some(error) = response.get("error") {
        return Err(RpcError::Rpc {
            code: error.get("code").and_then(Value::as_i64).unwrap_or_default(),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string()),
        });
    }

    response
        .get("result")
        .cloned()
        .ok_or_else(|| RpcError::Malformed("response missing 'result' field".to_string()))
}

/// Split a batch response array into per-id results.
pub fn split_batch_response(response: Value) -> Result<BatchResults, RpcError> {
    let entries = match response {
        Value::Array(entries) => entries,
        // A node rejecting the whole batch answers with a single error object
        other => return Err(extract_result(&other).err().unwrap_or_else(|| {
            RpcError::Malformed("batch response is not an array".to_string())
        })),
    };

    let mut results = HashMap::with_capacity(entries.len());
    for entry in entries {
        let id = match entry.get("id") {
            Some(Value::String(id)) => id.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => {
                tracing::debug!("Skipping batch entry without id: {}", entry);
                continue;
            }
        };
        results.insert(id, extract_result(&entry));
    }
    Ok(results)
}
