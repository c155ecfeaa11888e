//! Responder: submits `pong(txHash)` for one Ping and waits for it to be mined.
//!
//! [PongResponder] signs EIP-155 legacy transactions in-process (k256 + RLP) and sends
//! them with `eth_sendRawTransaction`. It does not dedup; the engine guarantees at most
//! one call per event id.

use crate::abi::{pong_calldata, PingEvent};
use crate::rpc::{RpcClient, RpcError};
use async_trait::async_trait;
use k256::ecdsa::SigningKey;
use rlp::RlpStream;
use sha3::{Digest, Keccak256};
use std::time::Duration;
use thiserror::Error;

/// A mined, successful pong.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirmation {
    pub tx_hash: [u8; 32],
    pub block_number: u64,
}

#[derive(Debug, Error)]
pub enum ResponseError {
    /// Account cannot pay for gas. Retrying is pointless.
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),
    /// Network or timeout; the same event may be retried.
    #[error("transient: {0}")]
    Transient(String),
    /// Submission invalid or reverted.
    #[error("rejected: {0}")]
    Rejected(String),
}

impl ResponseError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ResponseError::InsufficientFunds(_))
    }
}

/// Node messages for a transaction identical to one already in the pool.
fn is_already_known(message: &str) -> bool {
    let m = message.to_ascii_lowercase();
    m.contains("already known") || m.contains("known transaction") || m.contains("already imported")
}

/// Nonce or fee-replacement conflicts: another transaction from this account took the
/// nonce. A rebuild with a fresh pending nonce can succeed.
fn is_nonce_conflict(message: &str) -> bool {
    let m = message.to_ascii_lowercase();
    m.contains("nonce too low")
        || m.contains("nonce too high")
        || m.contains("invalid nonce")
        || m.contains("replacement transaction underpriced")
        || m.contains("replacement fee too low")
}

/// Classify a submission failure reported by the RPC layer.
pub fn classify_submit_error(e: RpcError) -> ResponseError {
    match e {
        RpcError::Transport(err) => ResponseError::Transient(err.to_string()),
        RpcError::Rpc { message, .. } if message.to_ascii_lowercase().contains("insufficient funds") => {
            ResponseError::InsufficientFunds(message)
        }
        RpcError::Rpc { message, .. } if is_nonce_conflict(&message) || is_already_known(&message) => {
            ResponseError::Transient(message)
        }
        RpcError::Rpc { message, .. } => ResponseError::Rejected(message),
        RpcError::Decode(m) => ResponseError::Transient(m),
    }
}

#[async_trait]
pub trait Responder: Send + Sync {
    async fn respond(&self, event: &PingEvent) -> Result<Confirmation, ResponseError>;
}

/// Ethereum address (last 20 bytes of keccak of the uncompressed public key).
pub fn address_of(key: &SigningKey) -> [u8; 20] {
    let point = key.verifying_key().to_encoded_point(false);
    let digest = Keccak256::digest(&point.as_bytes()[1..]);
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest[12..]);
    out
}

/// Parse a hex private key (with or without 0x).
pub fn signing_key_from_hex(s: &str) -> Result<SigningKey, String> {
    let bytes = hex::decode(s.trim().strip_prefix("0x").unwrap_or(s.trim())).map_err(|e| e.to_string())?;
    if bytes.len() != 32 {
        return Err(format!("private key must be 32 bytes, got {}", bytes.len()));
    }
    SigningKey::from_slice(&bytes).map_err(|e| e.to_string())
}

/// Unsigned legacy transaction fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyTx {
    pub nonce: u64,
    pub gas_price: u64,
    pub gas_limit: u64,
    pub to: [u8; 20],
    pub value: u64,
    pub data: Vec<u8>,
    pub chain_id: u64,
}

impl LegacyTx {
    fn append_body(&self, s: &mut RlpStream) {
        s.append(&self.nonce);
        s.append(&self.gas_price);
        s.append(&self.gas_limit);
        let to: &[u8] = &self.to;
        s.append(&to);
        s.append(&self.value);
        s.append(&self.data);
    }

    /// EIP-155 signing payload: [nonce, gas_price, gas_limit, to, value, data, chain_id, 0, 0].
    pub fn signing_payload(&self) -> Vec<u8> {
        let mut s = RlpStream::new();
        s.begin_list(9);
        self.append_body(&mut s);
        s.append(&self.chain_id);
        s.append(&0u8);
        s.append(&0u8);
        s.out().to_vec()
    }

    /// Sign and RLP-encode; returns (raw transaction, transaction hash).
    pub fn sign(&self, key: &SigningKey) -> Result<(Vec<u8>, [u8; 32]), String> {
        let (signature, recovery_id) = key
            .sign_digest_recoverable(Keccak256::new_with_prefix(self.signing_payload()))
            .map_err(|e| format!("sign failed: {}", e))?;
        let v: u64 = self
            .chain_id
            .checked_mul(2)
            .and_then(|x| x.checked_add(35))
            .and_then(|x| x.checked_add(u64::from(recovery_id.to_byte())))
            .ok_or_else(|| "v overflow".to_string())?;

        let sig_bytes = signature.to_bytes();
        let (r, s_val) = sig_bytes.split_at(32);

        let mut s = RlpStream::new();
        s.begin_list(9);
        self.append_body(&mut s);
        s.append(&v);
        s.append(&trim_leading_zeros(r));
        s.append(&trim_leading_zeros(s_val));
        let raw = s.out().to_vec();
        let hash: [u8; 32] = Keccak256::digest(&raw).into();
        Ok((raw, hash))
    }
}

/// RLP integers are minimal big-endian; zero encodes as the empty string.
fn trim_leading_zeros(b: &[u8]) -> &[u8] {
    let first = b.iter().position(|&x| x != 0).unwrap_or(b.len());
    &b[first..]
}

/// Sends pong transactions from one account to the PingPong contract.
pub struct PongResponder {
    rpc: RpcClient,
    key: SigningKey,
    address: [u8; 20],
    contract_address: [u8; 20],
    chain_id: u64,
    gas_limit: u64,
    receipt_poll_interval: Duration,
}

impl PongResponder {
    /// Builds the responder; fetches the chain id from the node.
    pub async fn connect(
        rpc: RpcClient,
        key: SigningKey,
        contract_address: [u8; 20],
        gas_limit: u64,
        receipt_poll_interval: Duration,
    ) -> Result<Self, RpcError> {
        let chain_id = rpc.chain_id().await?;
        let address = address_of(&key);
        tracing::info!(address = %format!("0x{}", hex::encode(address)), chain_id, "responder account");
        Ok(Self {
            rpc,
            key,
            address,
            contract_address,
            chain_id,
            gas_limit,
            receipt_poll_interval,
        })
    }

    pub fn address(&self) -> [u8; 20] {
        self.address
    }

    async fn build_tx(&self, event: &PingEvent) -> Result<LegacyTx, ResponseError> {
        let nonce = self
            .rpc
            .transaction_count(&self.address)
            .await
            .map_err(|e| ResponseError::Transient(e.to_string()))?;
        let gas_price = self
            .rpc
            .gas_price()
            .await
            .map_err(|e| ResponseError::Transient(e.to_string()))?;
        Ok(LegacyTx {
            nonce,
            gas_price,
            gas_limit: self.gas_limit,
            to: self.contract_address,
            value: 0,
            data: pong_calldata(&event.tx_hash),
            chain_id: self.chain_id,
        })
    }

    /// Poll until mined. An accepted transaction is never abandoned: transport errors
    /// while waiting are logged and polling continues.
    async fn wait_for_receipt(&self, tx_hash: &[u8; 32]) -> Result<Confirmation, ResponseError> {
        loop {
            match self.rpc.transaction_receipt(tx_hash).await {
                Ok(Some(receipt)) if receipt.status == 1 => {
                    return Ok(Confirmation {
                        tx_hash: receipt.tx_hash,
                        block_number: receipt.block_number,
                    });
                }
                Ok(Some(receipt)) => {
                    return Err(ResponseError::Rejected(format!(
                        "pong 0x{} reverted in block {}",
                        hex::encode(receipt.tx_hash),
                        receipt.block_number
                    )));
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(reason = %e, tx = %hex::encode(tx_hash), "receipt poll failed, still waiting");
                }
            }
            tokio::time::sleep(self.receipt_poll_interval).await;
        }
    }
}

#[async_trait]
impl Responder for PongResponder {
    async fn respond(&self, event: &PingEvent) -> Result<Confirmation, ResponseError> {
        let tx = self.build_tx(event).await?;
        let (raw, local_hash) = tx.sign(&self.key).map_err(ResponseError::Rejected)?;
        let tx_hash = match self.rpc.send_raw_transaction(&raw).await {
            Ok(hash) => hash,
            // Our exact bytes are already pending; wait on them instead of sending another pong.
            Err(RpcError::Rpc { message, .. }) if is_already_known(&message) => {
                tracing::debug!(ping = %event.id(), pong = %hex::encode(local_hash), "pong already in pool");
                local_hash
            }
            Err(e) => return Err(classify_submit_error(e)),
        };
        if tx_hash != local_hash {
            tracing::warn!(
                node = %hex::encode(tx_hash),
                local = %hex::encode(local_hash),
                "node reported a different tx hash"
            );
        }
        tracing::debug!(ping = %event.id(), pong = %hex::encode(tx_hash), nonce = tx.nonce, "pong submitted, awaiting receipt");
        self.wait_for_receipt(&tx_hash).await
    }
}
