//! Minimal Ethereum JSON-RPC client over HTTP.

use crate::abi::{parse_hex_bytes_32, parse_hex_u64};
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("HTTP request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("decode error: {0}")]
    Decode(String),
}

impl RpcError {
    /// Node-reported rejection of an oversize eth_getLogs query.
    pub fn is_range_too_large(&self) -> bool {
        match self {
            RpcError::Rpc { code, message } => {
                let m = message.to_ascii_lowercase();
                *code == -32005
                    || m.contains("query returned more than")
                    || m.contains("block range")
                    || m.contains("range too large")
                    || m.contains("limit exceeded")
                    || m.contains("too many")
            }
            _ => false,
        }
    }

    pub fn message(&self) -> String {
        match self {
            RpcError::Rpc { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

/// Mined transaction receipt (subset).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub tx_hash: [u8; 32],
    pub block_number: u64,
    /// 1 = success, 0 = reverted.
    pub status: u64,
}

/// HTTP JSON-RPC client bound to one endpoint.
#[derive(Debug, Clone)]
pub struct RpcClient {
    client: reqwest::Client,
    url: String,
}

impl RpcClient {
    pub fn new(url: impl Into<String>) -> Result<Self, RpcError> {
        let client = reqwest::Client::builder().no_proxy().build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params
        });
        let resp = self.client.post(&self.url).json(&body).send().await?;
        let v: Value = resp.json().await?;
        if let Some(err) = v.get("error") {
            return Err(RpcError::Rpc {
                code: err.get("code").and_then(|c| c.as_i64()).unwrap_or(0),
                message: err
                    .get("message")
                    .and_then(|m| m.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| err.to_string()),
            });
        }
        v.get("result")
            .cloned()
            .ok_or_else(|| RpcError::Decode("Missing result".into()))
    }

    async fn call_u64(&self, method: &str, params: Value) -> Result<u64, RpcError> {
        let result = self.call(method, params).await?;
        let s = result
            .as_str()
            .ok_or_else(|| RpcError::Decode(format!("{} not string", method)))?;
        parse_hex_u64(s).map_err(|e| RpcError::Decode(e.to_string()))
    }

    pub async fn block_number(&self) -> Result<u64, RpcError> {
        self.call_u64("eth_blockNumber", json!([])).await
    }

    pub async fn chain_id(&self) -> Result<u64, RpcError> {
        self.call_u64("eth_chainId", json!([])).await
    }

    pub async fn gas_price(&self) -> Result<u64, RpcError> {
        self.call_u64("eth_gasPrice", json!([])).await
    }

    /// Nonce for the next transaction from `address` (counts pending transactions).
    pub async fn transaction_count(&self, address: &[u8; 20]) -> Result<u64, RpcError> {
        self.call_u64(
            "eth_getTransactionCount",
            json!([format!("0x{}", hex::encode(address)), "pending"]),
        )
        .await
    }

    pub async fn get_logs(&self, filter: Value) -> Result<Vec<Value>, RpcError> {
        let result = self.call("eth_getLogs", json!([filter])).await?;
        match result {
            Value::Array(arr) => Ok(arr),
            _ => Err(RpcError::Decode("getLogs not array".into())),
        }
    }

    /// Submit a signed transaction; returns the transaction hash reported by the node.
    pub async fn send_raw_transaction(&self, raw_tx: &[u8]) -> Result<[u8; 32], RpcError> {
        let result = self
            .call(
                "eth_sendRawTransaction",
                json!([format!("0x{}", hex::encode(raw_tx))]),
            )
            .await?;
        let s = result
            .as_str()
            .ok_or_else(|| RpcError::Decode("tx hash not string".into()))?;
        parse_hex_bytes_32(s).map_err(|e| RpcError::Decode(e.to_string()))
    }

    /// Receipt for `tx_hash`, or None while the transaction is not yet mined.
    pub async fn transaction_receipt(&self, tx_hash: &[u8; 32]) -> Result<Option<Receipt>, RpcError> {
        let result = self
            .call(
                "eth_getTransactionReceipt",
                json!([format!("0x{}", hex::encode(tx_hash))]),
            )
            .await?;
        if result.is_null() {
            return Ok(None);
        }
        decode_receipt(&result).map(Some)
    }
}

fn decode_receipt(v: &Value) -> Result<Receipt, RpcError> {
    let field = |name: &str| {
        v.get(name)
            .and_then(|x| x.as_str())
            .ok_or_else(|| RpcError::Decode(format!("receipt missing {}", name)))
    };
    let tx_hash =
        parse_hex_bytes_32(field("transactionHash")?).map_err(|e| RpcError::Decode(e.to_string()))?;
    let block_number =
        parse_hex_u64(field("blockNumber")?).map_err(|e| RpcError::Decode(e.to_string()))?;
    // Pre-Byzantium receipts have no status; treat them as success.
    let status = match v.get("status").and_then(|s| s.as_str()) {
        Some(s) => parse_hex_u64(s).map_err(|e| RpcError::Decode(e.to_string()))?,
        None => 1,
    };
    Ok(Receipt {
        tx_hash,
        block_number,
        status,
    })
}
