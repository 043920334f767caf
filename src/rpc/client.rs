use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{
    HTTP_CONNECT_ATTEMPTS, HTTP_CONNECT_RETRY_DELAY, RPC_MIN_REQUEST_SPACING, RPC_RETRY_ATTEMPTS,
    RPC_RETRY_DELAY_STEP,
};
use crate::error::{AppError, Result};
use crate::rpc::codec::{encode_hex_u64, parse_hex_u64, LogEntry};

// ---------------------------------------------------------------------------
// Rate limiter — fixed minimum spacing between outbound chain requests
// ---------------------------------------------------------------------------

/// Shared limiter every outbound request passes through. Holding the lock
/// across the sleep serializes waiters, which is exactly the point.
pub struct RateLimiter {
    last_request: Mutex<Instant>,
    min_spacing: Duration,
}

impl RateLimiter {
    pub fn new(min_spacing: Duration) -> Self {
        let start = Instant::now()
            .checked_sub(min_spacing)
            .unwrap_or_else(Instant::now);
        Self {
            last_request: Mutex::new(start),
            min_spacing,
        }
    }

    pub async fn acquire(&self) {
        let mut last = self.last_request.lock().await;
        let elapsed = last.elapsed();
        if elapsed < self.min_spacing {
            tokio::time::sleep(self.min_spacing - elapsed).await;
        }
        *last = Instant::now();
    }
}

// ---------------------------------------------------------------------------
// Retry wrapper — linear backoff, final error re-raised
// ---------------------------------------------------------------------------

/// Retry `op` up to [`RPC_RETRY_ATTEMPTS`] times with linearly increasing
/// delay. The last failure is returned to the caller untouched.
pub async fn with_retry<T, F, Fut>(name: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < RPC_RETRY_ATTEMPTS => {
                let delay = RPC_RETRY_DELAY_STEP * attempt;
                warn!("{name} failed (attempt {attempt}/{RPC_RETRY_ATTEMPTS}), retrying in {delay:?}: {e}");
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                error!("{name} failed after {RPC_RETRY_ATTEMPTS} attempts: {e}");
                return Err(e);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// JSON-RPC client
// ---------------------------------------------------------------------------

/// Request/response JSON-RPC client over HTTP with multi-URL failover.
/// The active URL index only moves forward during `connect`; reads always go
/// to the node that last verified healthy.
pub struct RpcClient {
    http: reqwest::Client,
    urls: Vec<String>,
    active: AtomicUsize,
    next_id: AtomicU64,
    limiter: RateLimiter,
}

impl RpcClient {
    pub fn new(urls: Vec<String>, timeout: Duration) -> Result<Self> {
        if urls.is_empty() {
            return Err(AppError::Config("no RPC HTTP URLs configured".to_string()));
        }
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            urls,
            active: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            limiter: RateLimiter::new(RPC_MIN_REQUEST_SPACING),
        })
    }

    pub fn active_url(&self) -> &str {
        &self.urls[self.active.load(Ordering::Relaxed) % self.urls.len()]
    }

    /// Establish the connection: primary URL first, then each backup in
    /// order; per URL up to [`HTTP_CONNECT_ATTEMPTS`] attempts with a fixed
    /// delay; success is a live chain-height query. All URLs exhausted is
    /// fatal to initialization.
    pub async fn connect(&self) -> Result<u64> {
        for (url_index, url) in self.urls.iter().enumerate() {
            for attempt in 1..=HTTP_CONNECT_ATTEMPTS {
                info!(
                    "HTTP RPC connecting to {url} (node {}/{}, attempt {attempt}/{HTTP_CONNECT_ATTEMPTS})",
                    url_index + 1,
                    self.urls.len()
                );
                self.active.store(url_index, Ordering::Relaxed);
                match self.get_block_number().await {
                    Ok(height) => {
                        info!("HTTP RPC connected to {url} at block {height}");
                        return Ok(height);
                    }
                    Err(e) => {
                        warn!("HTTP RPC attempt failed on {url}: {e}");
                        if attempt < HTTP_CONNECT_ATTEMPTS {
                            tokio::time::sleep(HTTP_CONNECT_RETRY_DELAY).await;
                        }
                    }
                }
            }
            warn!("HTTP RPC node {url} exhausted, moving to next URL");
        }
        Err(AppError::Connection(format!(
            "all {} HTTP RPC URLs failed",
            self.urls.len()
        )))
    }

    /// Single JSON-RPC call against the active URL. Every call waits on the
    /// shared rate limiter first.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        self.limiter.acquire().await;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        debug!("rpc {method} -> {}", self.active_url());

        let response: Value = self
            .http
            .post(self.active_url())
            .json(&body)
            .send()
            .await?
            .json()
            .await?;

        if let Some(err) = response.get("error") {
            return Err(AppError::Rpc(format!("{method}: {err}")));
        }
        response
            .get("result")
            .cloned()
            .ok_or_else(|| AppError::Rpc(format!("{method}: response has no result")))
    }

    pub async fn get_block_number(&self) -> Result<u64> {
        let result = self.request("eth_blockNumber", json!([])).await?;
        parse_hex_u64(result.as_str().unwrap_or_default())
    }

    /// Timestamp of block `number`, or None when the node does not have it.
    pub async fn get_block_timestamp(&self, number: u64) -> Result<Option<u64>> {
        let result = self
            .request(
                "eth_getBlockByNumber",
                json!([encode_hex_u64(number), false]),
            )
            .await?;
        if result.is_null() {
            return Ok(None);
        }
        let ts = result
            .get("timestamp")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::Rpc(format!("block {number} has no timestamp")))?;
        Ok(Some(parse_hex_u64(ts)?))
    }

    /// `eth_call` against `to` with pre-encoded calldata, at latest.
    pub async fn call(&self, to: &str, data: String) -> Result<String> {
        let result = self
            .request("eth_call", json!([{ "to": to, "data": data }, "latest"]))
            .await?;
        result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| AppError::Rpc("eth_call returned non-string result".to_string()))
    }

    /// Historical logs for one event signature over an inclusive block range.
    pub async fn get_logs(
        &self,
        address: &str,
        topic0: &str,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<LogEntry>> {
        let result = self
            .request(
                "eth_getLogs",
                json!([{
                    "address": address,
                    "topics": [topic0],
                    "fromBlock": encode_hex_u64(from_block),
                    "toBlock": encode_hex_u64(to_block),
                }]),
            )
            .await?;
        Ok(serde_json::from_value(result)?)
    }
}
