#![forbid(unsafe_code)]

use std::env;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use medshare_kernel_contracts::integrity::LedgerRef;
use medshare_kernel_contracts::ledger::{ConnectionStatus, FeeEstimate, SubmitReceipt};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::ledger_memory::MemoryLedgerGateway;
use crate::tx_signer::{LegacyTx, TxSigner};

const LEDGER_REQUEST_TIMEOUT_MS_DEFAULT: u64 = 10_000;
const LEDGER_CONFIRM_TIMEOUT_MS_DEFAULT: u64 = 120_000;
const LEDGER_POLL_INTERVAL_MS_DEFAULT: u64 = 2_000;
const LEDGER_USER_AGENT: &str = "medshare-ledger/1.0";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("ledger submission is not configured")]
    Unconfigured,
    #[error("ledger unavailable: {0}")]
    LedgerUnavailable(String),
    #[error("ledger timeout: {0}")]
    LedgerTimeout(String),
    #[error("ledger submission failed: {0}")]
    SubmissionFailed(String),
    #[error("ledger entry not found")]
    NotFound,
}

/// Remote append-only ledger. `submit` is not idempotent; callers never retry it blindly.
#[async_trait]
pub trait LedgerGateway: Send + Sync {
    /// Never fails: an unreachable node reports `reachable = false`.
    async fn check_connection(&self) -> ConnectionStatus;
    async fn estimate_fee(&self, payload: &[u8]) -> Result<FeeEstimate, LedgerError>;
    async fn submit(&self, payload: &[u8]) -> Result<SubmitReceipt, LedgerError>;
    async fn fetch(&self, ledger_ref: &LedgerRef) -> Result<Value, LedgerError>;
    fn can_submit(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerMode {
    Rpc,
    Memory,
}

impl LedgerMode {
    pub fn as_str(self) -> &'static str {
        match self {
            LedgerMode::Rpc => "rpc",
            LedgerMode::Memory => "memory",
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct LedgerConfig {
    pub mode: LedgerMode,
    pub rpc_url: Option<String>,
    pub chain_id: Option<u64>,
    pub signing_key_hex: Option<String>,
    pub request_timeout_ms: u64,
    pub confirm_timeout_ms: u64,
    pub poll_interval_ms: u64,
}

impl std::fmt::Debug for LedgerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerConfig")
            .field("mode", &self.mode)
            .field("rpc_url", &self.rpc_url)
            .field("chain_id", &self.chain_id)
            .field("signing_key", &self.signing_key_hex.as_ref().map(|_| "<set>"))
            .field("request_timeout_ms", &self.request_timeout_ms)
            .field("confirm_timeout_ms", &self.confirm_timeout_ms)
            .field("poll_interval_ms", &self.poll_interval_ms)
            .finish()
    }
}

impl LedgerConfig {
    pub fn mvp_v1() -> Self {
        Self {
            mode: LedgerMode::Memory,
            rpc_url: None,
            chain_id: None,
            signing_key_hex: None,
            request_timeout_ms: LEDGER_REQUEST_TIMEOUT_MS_DEFAULT,
            confirm_timeout_ms: LEDGER_CONFIRM_TIMEOUT_MS_DEFAULT,
            poll_interval_ms: LEDGER_POLL_INTERVAL_MS_DEFAULT,
        }
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let rpc_url = non_empty("MEDSHARE_LEDGER_RPC_URL");
        let mode = match non_empty("MEDSHARE_LEDGER_MODE")
            .map(|v| v.to_ascii_lowercase())
            .as_deref()
        {
            Some("memory") => LedgerMode::Memory,
            Some("rpc") => LedgerMode::Rpc,
            _ if rpc_url.is_some() => LedgerMode::Rpc,
            _ => LedgerMode::Memory,
        };
        Self {
            mode,
            rpc_url,
            chain_id: non_empty("MEDSHARE_LEDGER_CHAIN_ID").and_then(|v| v.parse::<u64>().ok()),
            signing_key_hex: non_empty("MEDSHARE_LEDGER_SIGNING_KEY"),
            request_timeout_ms: bounded_ms(
                lookup("MEDSHARE_LEDGER_REQUEST_TIMEOUT_MS"),
                100..=60_000,
                LEDGER_REQUEST_TIMEOUT_MS_DEFAULT,
            ),
            confirm_timeout_ms: bounded_ms(
                lookup("MEDSHARE_LEDGER_CONFIRM_TIMEOUT_MS"),
                1_000..=600_000,
                LEDGER_CONFIRM_TIMEOUT_MS_DEFAULT,
            ),
            poll_interval_ms: bounded_ms(
                lookup("MEDSHARE_LEDGER_POLL_INTERVAL_MS"),
                100..=30_000,
                LEDGER_POLL_INTERVAL_MS_DEFAULT,
            ),
        }
    }
}

fn bounded_ms(raw: Option<String>, range: std::ops::RangeInclusive<u64>, default: u64) -> u64 {
    raw.and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|v| range.contains(v))
        .unwrap_or(default)
}

/// Builds the gateway named by `config.mode`.
pub fn build_ledger_gateway(config: &LedgerConfig) -> Result<Arc<dyn LedgerGateway>, LedgerError> {
    match config.mode {
        LedgerMode::Memory => Ok(Arc::new(MemoryLedgerGateway::new())),
        LedgerMode::Rpc => Ok(Arc::new(JsonRpcLedgerGateway::from_config(config)?)),
    }
}

#[derive(Debug)]
enum RpcCallError {
    Transport { kind: &'static str, detail: String },
    Status(u16),
    Rpc { code: i64, message: String },
    Parse,
}

impl RpcCallError {
    fn into_ledger_error(self) -> LedgerError {
        match self {
            RpcCallError::Transport { kind: "timeout", detail } => LedgerError::LedgerTimeout(detail),
            RpcCallError::Transport { kind, .. } => LedgerError::LedgerUnavailable(kind.to_string()),
            RpcCallError::Status(code) => LedgerError::LedgerUnavailable(format!("http_{code}")),
            RpcCallError::Rpc { code, message } => {
                LedgerError::LedgerUnavailable(format!("rpc_error code={code} message={message}"))
            }
            RpcCallError::Parse => LedgerError::LedgerUnavailable("json_parse".to_string()),
        }
    }

    /// A node refusing `eth_sendRawTransaction` is a rejected submission, not an outage.
    fn into_submission_error(self) -> LedgerError {
        match self {
            RpcCallError::Rpc { code, message } => {
                LedgerError::SubmissionFailed(format!("rejected code={code} message={message}"))
            }
            other => other.into_ledger_error(),
        }
    }
}

struct RpcClient {
    endpoint: String,
    agent: ureq::Agent,
    next_id: AtomicU64,
}

impl RpcClient {
    fn call_blocking(&self, method: &str, params: Value) -> Result<Value, RpcCallError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});
        let response = match self
            .agent
            .post(&self.endpoint)
            .set("Content-Type", "application/json")
            .set("Accept", "application/json")
            .send_json(body)
        {
            Ok(resp) => resp,
            Err(ureq::Error::Status(code, _)) => return Err(RpcCallError::Status(code)),
            Err(ureq::Error::Transport(transport)) => {
                let combined = format!("{:?} {}", transport.kind(), transport);
                return Err(RpcCallError::Transport {
                    kind: classify_transport_error_kind(&combined),
                    detail: method.to_string(),
                });
            }
        };
        let mut envelope: Value = response.into_json().map_err(|_| RpcCallError::Parse)?;
        if let Some(err) = envelope.get("error").filter(|e| !e.is_null()) {
            return Err(RpcCallError::Rpc {
                code: err.get("code").and_then(Value::as_i64).unwrap_or_default(),
                message: err
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string(),
            });
        }
        envelope
            .get_mut("result")
            .map(Value::take)
            .ok_or(RpcCallError::Parse)
    }
}

/// Ledger gateway over a JSON-RPC 2.0 node (Ethereum-compatible).
///
/// Entries are zero-value transactions sent to the signer's own address with
/// the payload as calldata. Without a signing key the gateway is read-only:
/// `fetch` and `check_connection` work, `submit` returns `Unconfigured`.
pub struct JsonRpcLedgerGateway {
    client: Arc<RpcClient>,
    signer: Option<TxSigner>,
    chain_id: Option<u64>,
    confirm_timeout: Duration,
    poll_interval: Duration,
    submit_lock: tokio::sync::Mutex<()>,
}

impl JsonRpcLedgerGateway {
    pub fn from_config(config: &LedgerConfig) -> Result<Self, LedgerError> {
        let endpoint = config.rpc_url.clone().ok_or(LedgerError::Unconfigured)?;
        let signer = match config.signing_key_hex.as_deref() {
            Some(hex_key) => Some(TxSigner::from_hex(hex_key).map_err(|_| LedgerError::Unconfigured)?),
            None => None,
        };
        let timeout = Duration::from_millis(config.request_timeout_ms.max(100));
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout_read(timeout)
            .timeout_write(timeout)
            .user_agent(LEDGER_USER_AGENT)
            .build();
        if let Some(s) = &signer {
            info!(target: "medshare::ledger", endpoint = %endpoint, address = %s.address_hex(), "json-rpc ledger gateway configured");
        } else {
            warn!(target: "medshare::ledger", endpoint = %endpoint, "json-rpc ledger gateway is read-only: no signing key");
        }
        Ok(Self {
            client: Arc::new(RpcClient {
                endpoint,
                agent,
                next_id: AtomicU64::new(1),
            }),
            signer,
            chain_id: config.chain_id,
            confirm_timeout: Duration::from_millis(config.confirm_timeout_ms),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            submit_lock: tokio::sync::Mutex::new(()),
        })
    }

    async fn rpc(&self, method: &'static str, params: Value) -> Result<Value, RpcCallError> {
        let client = Arc::clone(&self.client);
        tokio::task::spawn_blocking(move || client.call_blocking(method, params))
            .await
            .map_err(|e| RpcCallError::Transport {
                kind: "transport",
                detail: format!("blocking task failed: {e}"),
            })?
    }

    async fn quantity(&self, method: &'static str, params: Value) -> Result<u128, LedgerError> {
        let v = self
            .rpc(method, params)
            .await
            .map_err(RpcCallError::into_ledger_error)?;
        parse_quantity(&v)
            .ok_or_else(|| LedgerError::LedgerUnavailable(format!("{method}: bad quantity")))
    }

    async fn resolve_chain_id(&self) -> Result<u64, LedgerError> {
        if let Some(id) = self.chain_id {
            return Ok(id);
        }
        let id = self.quantity("eth_chainId", json!([])).await?;
        u64::try_from(id).map_err(|_| LedgerError::LedgerUnavailable("chain id overflow".into()))
    }

    async fn wait_for_receipt(&self, tx_hash: &str) -> Result<Value, LedgerError> {
        let poll = async {
            loop {
                match self
                    .rpc("eth_getTransactionReceipt", json!([tx_hash]))
                    .await
                {
                    Ok(receipt) if !receipt.is_null() => return receipt,
                    Ok(_) => {}
                    Err(err) => {
                        warn!(target: "medshare::ledger", tx_hash, error = ?err, "receipt poll failed; retrying");
                    }
                }
                tokio::time::sleep(self.poll_interval).await;
            }
        };
        tokio::time::timeout(self.confirm_timeout, poll)
            .await
            .map_err(|_| LedgerError::LedgerTimeout(format!("no receipt for {tx_hash}")))
    }
}

#[async_trait]
impl LedgerGateway for JsonRpcLedgerGateway {
    async fn check_connection(&self) -> ConnectionStatus {
        let chain_id = match self.quantity("eth_chainId", json!([])).await {
            Ok(id) => u64::try_from(id).ok(),
            Err(err) => {
                debug!(target: "medshare::ledger", error = %err, "ledger connectivity check failed");
                return ConnectionStatus {
                    reachable: false,
                    chain_id: None,
                    latest_block: None,
                };
            }
        };
        let latest_block = self
            .quantity("eth_blockNumber", json!([]))
            .await
            .ok()
            .and_then(|b| u64::try_from(b).ok());
        ConnectionStatus {
            reachable: true,
            chain_id,
            latest_block,
        }
    }

    async fn estimate_fee(&self, payload: &[u8]) -> Result<FeeEstimate, LedgerError> {
        let data = format!("0x{}", hex::encode(payload));
        let call = match &self.signer {
            Some(s) => {
                let addr = s.address_hex();
                json!({"from": addr, "to": addr, "value": "0x0", "data": data})
            }
            None => json!({"to": format!("0x{}", "00".repeat(20)), "value": "0x0", "data": data}),
        };
        let gas = self.quantity("eth_estimateGas", json!([call])).await?;
        let rate = self.quantity("eth_gasPrice", json!([])).await?;
        Ok(FeeEstimate::with_buffer(
            u64::try_from(gas).unwrap_or(u64::MAX),
            rate,
        ))
    }

    async fn submit(&self, payload: &[u8]) -> Result<SubmitReceipt, LedgerError> {
        let signer = self.signer.as_ref().ok_or(LedgerError::Unconfigured)?;
        let fee = self.estimate_fee(payload).await?;
        let chain_id = self.resolve_chain_id().await?;

        let tx_hash = {
            // Nonce lookup and broadcast must not interleave between submissions.
            let _guard = self.submit_lock.lock().await;
            let nonce = self
                .quantity(
                    "eth_getTransactionCount",
                    json!([signer.address_hex(), "pending"]),
                )
                .await?;
            let tx = LegacyTx {
                nonce: u64::try_from(nonce)
                    .map_err(|_| LedgerError::SubmissionFailed("nonce overflow".into()))?,
                gas_price: fee.fee_rate,
                gas_limit: fee.fee_limit,
                to: signer.address(),
                value: 0,
                data: payload.to_vec(),
                chain_id,
            };
            let raw = signer
                .sign_legacy(&tx)
                .map_err(|e| LedgerError::SubmissionFailed(e.to_string()))?;
            let sent = self
                .rpc(
                    "eth_sendRawTransaction",
                    json!([format!("0x{}", hex::encode(raw))]),
                )
                .await
                .map_err(RpcCallError::into_submission_error)?;
            sent.as_str()
                .map(str::to_string)
                .ok_or_else(|| LedgerError::SubmissionFailed("node returned no tx hash".into()))?
        };
        debug!(target: "medshare::ledger", tx_hash = %tx_hash, "transaction broadcast; awaiting receipt");

        let receipt = self.wait_for_receipt(&tx_hash).await?;
        if receipt.get("status").and_then(parse_quantity) != Some(1) {
            return Err(LedgerError::SubmissionFailed(format!(
                "transaction {tx_hash} reverted"
            )));
        }
        let block_height = receipt
            .get("blockNumber")
            .and_then(parse_quantity)
            .and_then(|b| u64::try_from(b).ok())
            .unwrap_or_default();
        let gas_used = receipt
            .get("gasUsed")
            .and_then(parse_quantity)
            .unwrap_or_default();
        let price = receipt
            .get("effectiveGasPrice")
            .and_then(parse_quantity)
            .unwrap_or(fee.fee_rate);
        let ledger_ref = LedgerRef::new(tx_hash)
            .map_err(|_| LedgerError::SubmissionFailed("node returned an invalid tx hash".into()))?;
        info!(target: "medshare::ledger", ledger_ref = %ledger_ref.as_str(), block_height, "ledger entry confirmed");
        Ok(SubmitReceipt {
            ledger_ref,
            block_height,
            fee_spent: gas_used.saturating_mul(price),
        })
    }

    async fn fetch(&self, ledger_ref: &LedgerRef) -> Result<Value, LedgerError> {
        let tx = self
            .rpc("eth_getTransactionByHash", json!([ledger_ref.as_str()]))
            .await
            .map_err(RpcCallError::into_ledger_error)?;
        if tx.is_null() {
            return Err(LedgerError::NotFound);
        }
        let input = tx
            .get("input")
            .and_then(Value::as_str)
            .ok_or(LedgerError::NotFound)?;
        let bytes = hex::decode(input.trim_start_matches("0x")).map_err(|_| LedgerError::NotFound)?;
        serde_json::from_slice(&bytes).map_err(|_| LedgerError::NotFound)
    }

    fn can_submit(&self) -> bool {
        self.signer.is_some()
    }
}

/// Parses a JSON-RPC hex quantity (`"0x1a"`).
pub fn parse_quantity(v: &Value) -> Option<u128> {
    let s = v.as_str()?.strip_prefix("0x")?;
    if s.is_empty() {
        return Some(0);
    }
    u128::from_str_radix(s, 16).ok()
}

fn classify_transport_error_kind(raw: &str) -> &'static str {
    let lower = raw.to_ascii_lowercase();
    if lower.contains("timeout") || lower.contains("timed out") {
        "timeout"
    } else if lower.contains("tls") || lower.contains("ssl") {
        "tls"
    } else if lower.contains("dns") {
        "dns"
    } else if lower.contains("connection") || lower.contains("connect") {
        "connection"
    } else {
        "transport"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    use medshare_kernel_contracts::ledger::{AnchorEntry, LedgerEnvelope, LedgerPayload};

    const KEY: &str = "4646464646464646464646464646464646464646464646464646464646464646";
    const TX_HASH: &str = "0x5c504ed432cb51138bcf09aa5e8a410dd4a1e204ef84bfed1be16dfba1b22060";

    type Handler = dyn Fn(&str, &Value) -> Result<Value, (i64, String)> + Send + Sync;

    /// Minimal JSON-RPC node over HTTP/1.1 with keep-alive.
    fn spawn_fake_node(handler: Arc<Handler>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let handler = Arc::clone(&handler);
                thread::spawn(move || {
                    let mut writer = stream.try_clone().unwrap();
                    let mut reader = BufReader::new(stream);
                    loop {
                        let mut line = String::new();
                        if reader.read_line(&mut line).unwrap_or(0) == 0 {
                            return;
                        }
                        let mut content_length = 0usize;
                        loop {
                            let mut header = String::new();
                            if reader.read_line(&mut header).unwrap_or(0) == 0 {
                                return;
                            }
                            let header = header.trim_end();
                            if header.is_empty() {
                                break;
                            }
                            if let Some((name, value)) = header.split_once(':') {
                                if name.eq_ignore_ascii_case("content-length") {
                                    content_length = value.trim().parse().unwrap_or(0);
                                }
                            }
                        }
                        let mut body = vec![0u8; content_length];
                        if reader.read_exact(&mut body).is_err() {
                            return;
                        }
                        let req: Value = serde_json::from_slice(&body).unwrap();
                        let method = req["method"].as_str().unwrap_or_default().to_string();
                        let resp = match handler(&method, &req["params"]) {
                            Ok(result) => json!({"jsonrpc": "2.0", "id": req["id"], "result": result}),
                            Err((code, message)) => json!({
                                "jsonrpc": "2.0",
                                "id": req["id"],
                                "error": {"code": code, "message": message}
                            }),
                        };
                        let out = resp.to_string();
                        let http = format!(
                            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
                            out.len(),
                            out
                        );
                        if writer.write_all(http.as_bytes()).is_err() {
                            return;
                        }
                    }
                });
            }
        });
        format!("http://{addr}")
    }

    fn config(url: String, key: Option<&str>) -> LedgerConfig {
        LedgerConfig {
            mode: LedgerMode::Rpc,
            rpc_url: Some(url),
            chain_id: None,
            signing_key_hex: key.map(str::to_string),
            request_timeout_ms: 2_000,
            confirm_timeout_ms: 2_000,
            poll_interval_ms: 10,
        }
    }

    fn happy_node(receipt_after_polls: usize, status: &'static str) -> Arc<Handler> {
        let polls = Arc::new(AtomicUsize::new(0));
        Arc::new(move |method: &str, params: &Value| match method {
            "eth_chainId" => Ok(json!("0x539")),
            "eth_blockNumber" => Ok(json!("0x10")),
            "eth_estimateGas" => Ok(json!("0x5208")),
            "eth_gasPrice" => Ok(json!("0x3b9aca00")),
            "eth_getTransactionCount" => {
                assert_eq!(params[1], json!("pending"));
                Ok(json!("0x7"))
            }
            "eth_sendRawTransaction" => {
                assert!(params[0].as_str().unwrap().starts_with("0xf8"));
                Ok(json!(TX_HASH))
            }
            "eth_getTransactionReceipt" => {
                if polls.fetch_add(1, Ordering::SeqCst) < receipt_after_polls {
                    Ok(Value::Null)
                } else {
                    Ok(json!({
                        "status": status,
                        "blockNumber": "0x11",
                        "gasUsed": "0x5300",
                        "effectiveGasPrice": "0x3b9aca00",
                    }))
                }
            }
            other => Err((-32601, format!("method {other} not found"))),
        })
    }

    #[test]
    fn at_ledger_01_env_config_is_bounded() {
        let env: BTreeMap<&str, &str> = [
            ("MEDSHARE_LEDGER_RPC_URL", "http://node:8545"),
            ("MEDSHARE_LEDGER_REQUEST_TIMEOUT_MS", "5"),
            ("MEDSHARE_LEDGER_CONFIRM_TIMEOUT_MS", "30000"),
            ("MEDSHARE_LEDGER_POLL_INTERVAL_MS", "abc"),
            ("MEDSHARE_LEDGER_CHAIN_ID", "1337"),
        ]
        .into_iter()
        .collect();
        let cfg = LedgerConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.mode, LedgerMode::Rpc);
        assert_eq!(cfg.chain_id, Some(1337));
        assert_eq!(cfg.request_timeout_ms, LEDGER_REQUEST_TIMEOUT_MS_DEFAULT);
        assert_eq!(cfg.confirm_timeout_ms, 30_000);
        assert_eq!(cfg.poll_interval_ms, LEDGER_POLL_INTERVAL_MS_DEFAULT);

        let empty = LedgerConfig::from_lookup(|_| None);
        assert_eq!(empty.mode, LedgerMode::Memory);
        let forced = LedgerConfig::from_lookup(|k| {
            (k == "MEDSHARE_LEDGER_MODE").then(|| "memory".to_string())
        });
        assert_eq!(forced.mode, LedgerMode::Memory);
    }

    #[test]
    fn at_ledger_02_debug_never_prints_signing_key() {
        let mut cfg = LedgerConfig::mvp_v1();
        cfg.signing_key_hex = Some(KEY.to_string());
        assert!(!format!("{cfg:?}").contains(KEY));
    }

    #[test]
    fn at_ledger_03_quantity_and_transport_classification() {
        assert_eq!(parse_quantity(&json!("0x1a")), Some(26));
        assert_eq!(parse_quantity(&json!("0x")), Some(0));
        assert_eq!(parse_quantity(&json!("26")), None);
        assert_eq!(parse_quantity(&json!(26)), None);
        assert_eq!(classify_transport_error_kind("Io operation timed out"), "timeout");
        assert_eq!(classify_transport_error_kind("ConnectionFailed refused"), "connection");
        assert_eq!(classify_transport_error_kind("Dns failed"), "dns");
    }

    #[tokio::test]
    async fn at_ledger_04_unreachable_node_reports_not_reachable() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);
        let gw = JsonRpcLedgerGateway::from_config(&config(url, Some(KEY))).unwrap();
        let status = gw.check_connection().await;
        assert!(!status.reachable);
        assert!(matches!(
            gw.submit(b"{}").await,
            Err(LedgerError::LedgerUnavailable(_) | LedgerError::LedgerTimeout(_))
        ));
    }

    #[tokio::test]
    async fn at_ledger_05_submit_without_key_is_unconfigured() {
        let url = spawn_fake_node(happy_node(0, "0x1"));
        let gw = JsonRpcLedgerGateway::from_config(&config(url, None)).unwrap();
        assert!(!gw.can_submit());
        assert_eq!(gw.submit(b"{}").await, Err(LedgerError::Unconfigured));
        let status = gw.check_connection().await;
        assert!(status.reachable);
        assert_eq!(status.chain_id, Some(1337));
        assert_eq!(status.latest_block, Some(16));
    }

    #[tokio::test]
    async fn at_ledger_06_fee_estimate_adds_buffer() {
        let url = spawn_fake_node(happy_node(0, "0x1"));
        let gw = JsonRpcLedgerGateway::from_config(&config(url, Some(KEY))).unwrap();
        let fee = gw.estimate_fee(b"{\"v\":1}").await.unwrap();
        assert_eq!(fee.fee_limit, 25_200);
        assert_eq!(fee.fee_rate, 1_000_000_000);
    }

    #[tokio::test]
    async fn at_ledger_07_submit_polls_until_receipt() {
        let url = spawn_fake_node(happy_node(2, "0x1"));
        let gw = JsonRpcLedgerGateway::from_config(&config(url, Some(KEY))).unwrap();
        let receipt = gw.submit(b"{\"v\":1}").await.unwrap();
        assert_eq!(receipt.ledger_ref.as_str(), TX_HASH);
        assert_eq!(receipt.block_height, 17);
        assert_eq!(receipt.fee_spent, 0x5300 * 1_000_000_000);
    }

    #[tokio::test]
    async fn at_ledger_08_reverted_and_rejected_submissions_fail() {
        let url = spawn_fake_node(happy_node(0, "0x0"));
        let gw = JsonRpcLedgerGateway::from_config(&config(url, Some(KEY))).unwrap();
        assert!(matches!(
            gw.submit(b"{}").await,
            Err(LedgerError::SubmissionFailed(_))
        ));

        let base = happy_node(0, "0x1");
        let rejecting: Arc<Handler> = Arc::new(move |method: &str, params: &Value| {
            if method == "eth_sendRawTransaction" {
                Err((-32000, "nonce too low".to_string()))
            } else {
                base(method, params)
            }
        });
        let gw = JsonRpcLedgerGateway::from_config(&config(spawn_fake_node(rejecting), Some(KEY)))
            .unwrap();
        match gw.submit(b"{}").await {
            Err(LedgerError::SubmissionFailed(detail)) => assert!(detail.contains("nonce too low")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn at_ledger_09_missing_receipt_times_out() {
        let url = spawn_fake_node(happy_node(usize::MAX, "0x1"));
        let mut cfg = config(url, Some(KEY));
        cfg.confirm_timeout_ms = 100;
        let gw = JsonRpcLedgerGateway::from_config(&cfg).unwrap();
        assert!(matches!(
            gw.submit(b"{}").await,
            Err(LedgerError::LedgerTimeout(_))
        ));
    }

    #[tokio::test]
    async fn at_ledger_10_fetch_decodes_calldata() {
        let envelope = LedgerEnvelope::v1(LedgerPayload::IntegrityAnchor(AnchorEntry {
            subject_id: "patient_1".to_string(),
            record_id: "rec_1".to_string(),
            hash: "ab".repeat(32),
            timestamp_ns: 1,
        }));
        let input = format!("0x{}", hex::encode(envelope.to_json_bytes().unwrap()));
        let node: Arc<Handler> = Arc::new(move |method: &str, params: &Value| match method {
            "eth_getTransactionByHash" if params[0] == json!(TX_HASH) => {
                Ok(json!({"hash": TX_HASH, "input": input}))
            }
            "eth_getTransactionByHash" => Ok(Value::Null),
            _ => Err((-32601, "nope".to_string())),
        });
        let gw = JsonRpcLedgerGateway::from_config(&config(spawn_fake_node(node), None)).unwrap();
        let value = gw.fetch(&LedgerRef::new(TX_HASH).unwrap()).await.unwrap();
        assert_eq!(LedgerEnvelope::from_json_value(&value).unwrap(), envelope);
        assert_eq!(
            gw.fetch(&LedgerRef::new("0xdeadbeef").unwrap()).await,
            Err(LedgerError::NotFound)
        );
    }
}
