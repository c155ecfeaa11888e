//! ABI bindings for the PingPong contract.
//!
//! `Ping()` event and `pong(bytes32)` call. Decode from JSON-RPC log shape; encode pong calldata.

use alloy::primitives::B256;
use alloy::sol_types::{SolCall, SolEvent};
use anyhow::{Context, Result};
use serde_json::Value;

alloy::sol! {
    event Ping();
    function pong(bytes32 txHash) external;
}

/// keccak256("Ping()"): topic0 of every Ping log.
pub fn ping_topic0() -> [u8; 32] {
    Ping::SIGNATURE_HASH.0
}

/// Selector for pong(bytes32).
pub fn pong_selector() -> [u8; 4] {
    pongCall::SELECTOR
}

/// ABI-encoded calldata for `pong(tx_hash)`.
pub fn pong_calldata(tx_hash: &[u8; 32]) -> Vec<u8> {
    pongCall {
        txHash: B256::from(*tx_hash),
    }
    .abi_encode()
}

/// One observed Ping occurrence. The emitting transaction hash is the event id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingEvent {
    pub tx_hash: [u8; 32],
    pub block_number: u64,
    pub log_index: u64,
}

impl PingEvent {
    pub fn new(tx_hash: [u8; 32], block_number: u64, log_index: u64) -> Self {
        Self {
            tx_hash,
            block_number,
            log_index,
        }
    }

    /// Dedup id: `0x`-prefixed lowercase transaction hash.
    pub fn id(&self) -> String {
        format!("0x{}", hex::encode(self.tx_hash))
    }
}

/// True if the log's topic0 is the Ping signature hash.
pub fn log_matches_ping(log: &Value) -> bool {
    let t0 = match log
        .get("topics")
        .and_then(|t| t.as_array())
        .and_then(|t| t.first())
        .and_then(|t| t.as_str())
    {
        Some(s) => s,
        None => return false,
    };
    match parse_hex_bytes(t0) {
        Ok(b) => b.as_slice() == ping_topic0(),
        Err(_) => false,
    }
}

/// True if the node flagged the log as removed by a reorg.
pub fn log_is_removed(log: &Value) -> bool {
    log.get("removed").and_then(|r| r.as_bool()).unwrap_or(false)
}

/// Decode a JSON-RPC log (eth_subscription / eth_getLogs result) into a [PingEvent].
pub fn decode_ping_log(log_value: &Value) -> Result<PingEvent> {
    let tx_hash = parse_hex_bytes_32(
        log_value
            .get("transactionHash")
            .and_then(|h| h.as_str())
            .ok_or_else(|| anyhow::anyhow!("Missing transactionHash"))?,
    )?;
    let block_number = parse_hex_u64(
        log_value
            .get("blockNumber")
            .and_then(|n| n.as_str())
            .ok_or_else(|| anyhow::anyhow!("Missing blockNumber"))?,
    )?;
    let log_index = parse_hex_u64(
        log_value
            .get("logIndex")
            .and_then(|n| n.as_str())
            .ok_or_else(|| anyhow::anyhow!("Missing logIndex"))?,
    )?;
    Ok(PingEvent {
        tx_hash,
        block_number,
        log_index,
    })
}

pub(crate) fn parse_hex_u64(s: &str) -> Result<u64> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(s, 16).context("parse hex u64")
}

pub(crate) fn parse_hex_bytes(s: &str) -> Result<Vec<u8>> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    hex::decode(s).context("parse hex bytes")
}

pub(crate) fn parse_hex_bytes_32(s: &str) -> Result<[u8; 32]> {
    let bytes = parse_hex_bytes(s)?;
    if bytes.len() != 32 {
        anyhow::bail!("Expected 32 bytes, got {}", bytes.len());
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}
