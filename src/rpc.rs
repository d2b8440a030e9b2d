/// Chain Client - JSON-RPC Access to the Chain
///
/// Speaks JSON-RPC 2.0 over HTTP to one or more endpoints. The client is
/// stateless per call: every request picks the current endpoint, and any
/// failure rotates to the next one before the error is surfaced so the
/// caller's retry lands somewhere else. Wide log ranges are chunked into
/// pages small enough for provider log-count limits.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::constants::LOG_PAGE_BLOCKS;
use crate::error::Error;

/// Block header fields as returned by eth_getBlockByNumber, still hex text.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawBlock {
    pub number: String,
    pub hash: String,
    pub parent_hash: String,
    pub timestamp: String,
}

/// A log entry as returned by eth_getLogs, still hex text.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawLog {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    pub block_number: Option<String>,
    pub transaction_hash: Option<String>,
    pub log_index: Option<String>,
    /// True when the provider is retracting a log from a reorged block.
    pub removed: Option<bool>,
}

/// Address/topic filter for a log query.
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub address: Option<String>,
    pub topic0: Option<String>,
}

/// Read capability over the chain. The engine only ever sees this trait;
/// tests substitute a scripted implementation.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn head_height(&self) -> Result<u64, Error>;
    async fn chain_id(&self) -> Result<u64, Error>;
    async fn block_by_number(&self, number: u64) -> Result<RawBlock, Error>;
    async fn logs_in_range(
        &self,
        lo: u64,
        hi: u64,
        filter: &LogFilter,
    ) -> Result<Vec<RawLog>, Error>;
}

pub struct RpcClient {
    endpoints: Vec<String>,
    current: AtomicUsize,
    http: reqwest::Client,
}

impl RpcClient {
    pub fn new(endpoints: Vec<String>, timeout: Duration) -> Result<Self, Error> {
        if endpoints.is_empty() {
            return Err(Error::Config("chain client needs at least one endpoint".into()));
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build http client: {e}")))?;
        Ok(Self {
            endpoints,
            current: AtomicUsize::new(0),
            http,
        })
    }

    fn endpoint(&self) -> &str {
        let idx = self.current.load(Ordering::Relaxed) % self.endpoints.len();
        &self.endpoints[idx]
    }

    fn rotate(&self) {
        if self.endpoints.len() > 1 {
            self.current.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// One JSON-RPC round trip. Rotates the endpoint on failure so the next
    /// attempt (the caller retries, not us) hits a different provider.
    async fn call(&self, method: &str, params: Value) -> Result<Value, Error> {
        let url = self.endpoint().to_string();
        let started = Instant::now();
        let result = self.call_endpoint(&url, method, params).await;
        if result.is_err() {
            self.rotate();
        }
        tracing::trace!(
            method,
            elapsed_ms = started.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "rpc call"
        );
        result
    }

    async fn call_endpoint(&self, url: &str, method: &str, params: Value) -> Result<Value, Error> {
        let response = self
            .http
            .post(url)
            .json(&json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": method,
                "params": params,
            }))
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(Error::Rpc {
                method: method.to_string(),
                message: format!("http status {status}"),
                retryable: true,
            });
        }
        if !status.is_success() {
            return Err(Error::Rpc {
                method: method.to_string(),
                message: format!("http status {status}"),
                retryable: false,
            });
        }

        let body: Value = response.json().await.map_err(|e| Error::Malformed {
            method: method.to_string(),
            message: format!("response is not JSON: {e}"),
        })?;

        if let Some(err) = body.get("error").filter(|e| !e.is_null()) {
            let code = err.get("code").and_then(Value::as_i64).unwrap_or(0);
            let message = err
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            // -32600..=-32602 are malformed-request codes: our bug, not theirs.
            let retryable = !(-32602..=-32600).contains(&code);
            return Err(Error::Rpc {
                method: method.to_string(),
                message: format!("code {code}: {message}"),
                retryable,
            });
        }

        body.get("result").cloned().ok_or_else(|| Error::Malformed {
            method: method.to_string(),
            message: "response carries neither result nor error".to_string(),
        })
    }
}

#[async_trait]
impl ChainClient for RpcClient {
    async fn head_height(&self) -> Result<u64, Error> {
        let result = self.call("eth_blockNumber", json!([])).await?;
        let hex = result.as_str().ok_or_else(|| Error::Malformed {
            method: "eth_blockNumber".into(),
            message: format!("expected hex string, got {result}"),
        })?;
        crate::decode::parse_quantity(hex, "eth_blockNumber")
    }

    async fn chain_id(&self) -> Result<u64, Error> {
        let result = self.call("eth_chainId", json!([])).await?;
        let hex = result.as_str().ok_or_else(|| Error::Malformed {
            method: "eth_chainId".into(),
            message: format!("expected hex string, got {result}"),
        })?;
        crate::decode::parse_quantity(hex, "eth_chainId")
    }

    async fn block_by_number(&self, number: u64) -> Result<RawBlock, Error> {
        let tag = format!("0x{number:x}");
        let result = self
            .call("eth_getBlockByNumber", json!([tag, false]))
            .await?;
        if result.is_null() {
            // The head we computed the range from has it; a null here is the
            // provider lagging, so let the retry loop ask again.
            return Err(Error::Rpc {
                method: "eth_getBlockByNumber".into(),
                message: format!("block {number} not available yet"),
                retryable: true,
            });
        }
        serde_json::from_value(result).map_err(|e| Error::Malformed {
            method: "eth_getBlockByNumber".into(),
            message: format!("block {number}: {e}"),
        })
    }

    async fn logs_in_range(
        &self,
        lo: u64,
        hi: u64,
        filter: &LogFilter,
    ) -> Result<Vec<RawLog>, Error> {
        let mut logs = Vec::new();
        for (page_lo, page_hi) in pages(lo, hi, LOG_PAGE_BLOCKS) {
            let mut params = json!({
                "fromBlock": format!("0x{page_lo:x}"),
                "toBlock": format!("0x{page_hi:x}"),
            });
            if let Some(address) = &filter.address {
                params["address"] = json!(address);
            }
            if let Some(topic0) = &filter.topic0 {
                params["topics"] = json!([topic0]);
            }

            let result = self.call("eth_getLogs", json!([params])).await?;
            let page: Vec<RawLog> =
                serde_json::from_value(result).map_err(|e| Error::Malformed {
                    method: "eth_getLogs".into(),
                    message: format!("range {page_lo}..={page_hi}: {e}"),
                })?;
            logs.extend(
                page.into_iter()
                    .filter(|log| !log.removed.unwrap_or(false)),
            );
        }
        Ok(logs)
    }
}

/// Split an inclusive range into pages of at most `step` blocks.
pub fn pages(lo: u64, hi: u64, step: u64) -> Vec<(u64, u64)> {
    if hi < lo || step == 0 {
        return Vec::new();
    }
    let mut out = Vec::new();
    let mut cursor = lo;
    while cursor <= hi {
        let end = cursor.saturating_add(step - 1).min(hi);
        out.push((cursor, end));
        if end == u64::MAX {
            break;
        }
        cursor = end + 1;
    }
    out
}
