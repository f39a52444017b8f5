use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use base64::Engine;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

const RPC_TIMEOUT_SECS: u64 = 10;
const MAX_RESPONSE_BYTES: usize = 8 * 1024 * 1024;

/// Tip status as reported by `getchaintips`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TipStatus {
    Active,
    ValidFork,
    ValidHeaders,
    HeadersOnly,
    Invalid,
    Unknown,
}

impl TipStatus {
    pub fn parse(value: &str) -> TipStatus {
        match value {
            "active" => TipStatus::Active,
            "valid-fork" => TipStatus::ValidFork,
            "valid-headers" => TipStatus::ValidHeaders,
            "headers-only" => TipStatus::HeadersOnly,
            "invalid" => TipStatus::Invalid,
            _ => TipStatus::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TipStatus::Active => "active",
            TipStatus::ValidFork => "valid-fork",
            TipStatus::ValidHeaders => "valid-headers",
            TipStatus::HeadersOnly => "headers-only",
            TipStatus::Invalid => "invalid",
            TipStatus::Unknown => "unknown",
        }
    }
}

/// One row of the full node's `getchaintips` answer.
#[derive(Clone, Debug, Serialize)]
pub struct ChainTip {
    pub height: i64,
    pub hash: String,
    pub branchlen: u64,
    pub status: TipStatus,
}

/// The full node's own view of its active chain.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ChainSummary {
    pub height: i64,
    pub synced: bool,
    pub tip: Option<String>,
}

/// Thin facade over the external full node.
///
/// Backend dispatch is a plain enum; the crawler only ever needs one of
/// these per process.
pub enum FullNodeAdapter {
    Disabled,
    Rpc(RpcClient),
    Static(StaticNode),
}

impl FullNodeAdapter {
    pub fn disabled() -> Self {
        FullNodeAdapter::Disabled
    }

    pub fn rpc(addr: SocketAddr, auth: Option<(String, String)>) -> Self {
        FullNodeAdapter::Rpc(RpcClient { addr, auth })
    }

    pub fn fixed(node: StaticNode) -> Self {
        FullNodeAdapter::Static(node)
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self, FullNodeAdapter::Disabled)
    }

    /// Verifies the backing node is reachable before the crawler leans on it.
    pub async fn start(&self) -> Result<(), String> {
        match self {
            FullNodeAdapter::Disabled | FullNodeAdapter::Static(_) => Ok(()),
            FullNodeAdapter::Rpc(client) => {
                let height = client.call("getblockcount", json!([])).await?;
                debug!(height = %height, "full node reachable");
                Ok(())
            }
        }
    }

    pub async fn chain(&self) -> Result<ChainSummary, String> {
        match self {
            FullNodeAdapter::Disabled => Ok(ChainSummary::default()),
            FullNodeAdapter::Static(node) => Ok(node.summary()),
            FullNodeAdapter::Rpc(client) => {
                let info = client.call("getblockchaininfo", json!([])).await?;
                let height = info.get("blocks").and_then(Value::as_i64).unwrap_or(0);
                let headers = info.get("headers").and_then(Value::as_i64).unwrap_or(0);
                let tip = info
                    .get("bestblockhash")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                Ok(ChainSummary {
                    height,
                    synced: headers > 0 && height >= headers,
                    tip,
                })
            }
        }
    }

    pub async fn chain_tips(&self) -> Result<Vec<ChainTip>, String> {
        match self {
            FullNodeAdapter::Disabled => Ok(Vec::new()),
            FullNodeAdapter::Static(node) => Ok(node.tips()),
            FullNodeAdapter::Rpc(client) => {
                let rows = client.call("getchaintips", json!([])).await?;
                let rows = rows
                    .as_array()
                    .ok_or_else(|| "getchaintips did not return an array".to_string())?;
                let mut tips = Vec::with_capacity(rows.len());
                for row in rows {
                    let Some(height) = row.get("height").and_then(Value::as_i64) else {
                        continue;
                    };
                    let Some(hash) = row.get("hash").and_then(Value::as_str) else {
                        continue;
                    };
                    let branchlen = row.get("branchlen").and_then(Value::as_u64).unwrap_or(0);
                    let status = row
                        .get("status")
                        .and_then(Value::as_str)
                        .map(TipStatus::parse)
                        .unwrap_or(TipStatus::Unknown);
                    tips.push(ChainTip {
                        height,
                        hash: hash.to_string(),
                        branchlen,
                        status,
                    });
                }
                Ok(tips)
            }
        }
    }
}

/// In-memory backend with preset answers; used by tests and dry runs.
#[derive(Clone, Default)]
pub struct StaticNode {
    inner: Arc<Mutex<StaticState>>,
}

#[derive(Default)]
struct StaticState {
    summary: ChainSummary,
    tips: Vec<ChainTip>,
}

impl StaticNode {
    pub fn new() -> Self {
        StaticNode::default()
    }

    pub fn set_summary(&self, summary: ChainSummary) {
        if let Ok(mut state) = self.inner.lock() {
            state.summary = summary;
        }
    }

    pub fn set_tips(&self, tips: Vec<ChainTip>) {
        if let Ok(mut state) = self.inner.lock() {
            state.tips = tips;
        }
    }

    fn summary(&self) -> ChainSummary {
        self.inner
            .lock()
            .map(|state| state.summary.clone())
            .unwrap_or_default()
    }

    fn tips(&self) -> Vec<ChainTip> {
        self.inner
            .lock()
            .map(|state| state.tips.clone())
            .unwrap_or_default()
    }
}

/// Minimal JSON-RPC-over-HTTP client for a florincoind-compatible node.
pub struct RpcClient {
    addr: SocketAddr,
    auth: Option<(String, String)>,
}

impl RpcClient {
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, String> {
        let request = json!({
            "jsonrpc": "1.0",
            "id": "floscan",
            "method": method,
            "params": params,
        })
        .to_string();

        let mut head = String::with_capacity(256);
        head.push_str("POST / HTTP/1.1\r\n");
        head.push_str(&format!("Host: {}\r\n", self.addr));
        if let Some((user, pass)) = &self.auth {
            let token =
                base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}"));
            head.push_str(&format!("Authorization: Basic {token}\r\n"));
        }
        head.push_str("Content-Type: application/json\r\n");
        head.push_str(&format!("Content-Length: {}\r\n", request.len()));
        head.push_str("Connection: close\r\n\r\n");

        let exchange = async {
            let mut stream = TcpStream::connect(self.addr)
                .await
                .map_err(|err| format!("rpc connect failed: {err}"))?;
            stream
                .write_all(head.as_bytes())
                .await
                .map_err(|err| format!("rpc send failed: {err}"))?;
            stream
                .write_all(request.as_bytes())
                .await
                .map_err(|err| format!("rpc send failed: {err}"))?;

            let mut response = Vec::new();
            let mut buffer = [0u8; 16 * 1024];
            loop {
                let read = stream
                    .read(&mut buffer)
                    .await
                    .map_err(|err| format!("rpc read failed: {err}"))?;
                if read == 0 {
                    break;
                }
                response.extend_from_slice(&buffer[..read]);
                if response.len() > MAX_RESPONSE_BYTES {
                    return Err("rpc response too large".to_string());
                }
            }
            Ok(response)
        };
        let response = tokio::time::timeout(
            std::time::Duration::from_secs(RPC_TIMEOUT_SECS),
            exchange,
        )
        .await
        .map_err(|_| "rpc request timed out".to_string())??;

        let body_start = find_body(&response).ok_or("malformed rpc response")?;
        let body: Value = serde_json::from_slice(&response[body_start..])
            .map_err(|err| format!("rpc body parse failed: {err}"))?;
        if let Some(error) = body.get("error") {
            if !error.is_null() {
                return Err(format!("rpc error from {method}: {error}"));
            }
        }
        body.get("result")
            .cloned()
            .ok_or_else(|| format!("rpc response for {method} had no result"))
    }
}

fn find_body(response: &[u8]) -> Option<usize> {
    response
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|index| index + 4)
}
