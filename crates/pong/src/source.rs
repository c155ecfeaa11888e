//! Event source: chain height, ranged Ping queries, and the live Ping feed.
//!
//! [EthEventSource] uses HTTP JSON-RPC for height and `eth_getLogs`, and a WebSocket
//! `eth_subscribe("logs")` for the live feed. The feed is a pull-based stream; when the
//! socket drops it yields [SourceError::FeedClosed] instead of going quiet.

use crate::abi::{decode_ping_log, log_is_removed, log_matches_ping, ping_topic0, PingEvent};
use crate::rpc::{RpcClient, RpcError};
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("connectivity: {0}")]
    Connectivity(String),
    #[error("range {from}..={to} too large for one query")]
    RangeTooLarge { from: u64, to: u64 },
    #[error("invalid range {from}..={to}")]
    InvalidRange { from: u64, to: u64 },
    #[error("live feed closed: {0}")]
    FeedClosed(String),
    #[error("malformed event: {0}")]
    MalformedEvent(String),
}

impl From<RpcError> for SourceError {
    fn from(e: RpcError) -> Self {
        SourceError::Connectivity(e.to_string())
    }
}

/// Live Ping feed. Every item is either an event or the terminal error that ended the feed.
pub type EventFeed = BoxStream<'static, Result<PingEvent, SourceError>>;

/// Ledger capability consumed by the reconciliation engine.
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn current_height(&self) -> Result<u64, SourceError>;

    /// Ping events in `from..=to`, ordered by (block_number, log_index).
    async fn events_in_range(&self, from: u64, to: u64) -> Result<Vec<PingEvent>, SourceError>;

    /// Open a fresh live subscription.
    async fn subscribe(&self) -> Result<EventFeed, SourceError>;
}

fn build_logs_filter(address: &[u8; 20], with_topic: bool, from: u64, to: u64) -> Value {
    let mut filter = json!({
        "address": format!("0x{}", hex::encode(address)),
        "fromBlock": format!("0x{:x}", from),
        "toBlock": format!("0x{:x}", to),
    });
    if with_topic {
        filter["topics"] = json!([format!("0x{}", hex::encode(ping_topic0()))]);
    }
    filter
}

fn decode_logs(logs: &[Value]) -> Result<Vec<PingEvent>, SourceError> {
    let mut events = logs
        .iter()
        .filter(|log| log_matches_ping(log) && !log_is_removed(log))
        .map(|log| decode_ping_log(log).map_err(|e| SourceError::MalformedEvent(e.to_string())))
        .collect::<Result<Vec<_>, _>>()?;
    events.sort_by_key(|e| (e.block_number, e.log_index));
    Ok(events)
}

/// HTTP + WebSocket event source for one contract.
pub struct EthEventSource {
    rpc: RpcClient,
    ws_url: String,
    contract_address: [u8; 20],
}

impl EthEventSource {
    pub fn new(rpc: RpcClient, ws_url: impl Into<String>, contract_address: [u8; 20]) -> Self {
        Self {
            rpc,
            ws_url: ws_url.into(),
            contract_address,
        }
    }

    async fn get_logs(&self, filter: Value, from: u64, to: u64) -> Result<Vec<Value>, SourceError> {
        self.rpc.get_logs(filter).await.map_err(|e| {
            if e.is_range_too_large() {
                SourceError::RangeTooLarge { from, to }
            } else {
                SourceError::from(e)
            }
        })
    }
}

#[async_trait]
impl EventSource for EthEventSource {
    async fn current_height(&self) -> Result<u64, SourceError> {
        Ok(self.rpc.block_number().await?)
    }

    async fn events_in_range(&self, from: u64, to: u64) -> Result<Vec<PingEvent>, SourceError> {
        if from > to {
            return Err(SourceError::InvalidRange { from, to });
        }
        let filtered = build_logs_filter(&self.contract_address, true, from, to);
        let logs = match self.get_logs(filtered, from, to).await {
            Ok(l) if !l.is_empty() => l,
            Err(e @ SourceError::RangeTooLarge { .. }) => return Err(e),
            other => {
                // Some nodes reject or ignore the topic filter; retry address-only and filter here.
                if let Err(e) = &other {
                    tracing::debug!(reason = %e, "eth_getLogs with topic filter failed, trying address-only");
                }
                let fallback = build_logs_filter(&self.contract_address, false, from, to);
                match (self.get_logs(fallback, from, to).await, other) {
                    (Ok(raw), _) => raw,
                    (Err(_), Ok(empty)) => empty,
                    (Err(e), Err(_)) => return Err(e),
                }
            }
        };
        let events = decode_logs(&logs)?;
        tracing::debug!(count = events.len(), from, to, "ranged Ping query");
        Ok(events)
    }

    async fn subscribe(&self) -> Result<EventFeed, SourceError> {
        let conn = |e: &dyn std::fmt::Display| SourceError::Connectivity(format!("ws: {}", e));
        let (ws_stream, _) = connect_async(&self.ws_url).await.map_err(|e| conn(&e))?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let topic0 = format!("0x{}", hex::encode(ping_topic0()));
        let filter = json!({
            "address": format!("0x{}", hex::encode(self.contract_address)),
            "topics": [topic0],
        });
        let sub_req = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "eth_subscribe",
            "params": ["logs", filter]
        });
        ws_sender
            .send(Message::Text(sub_req.to_string()))
            .await
            .map_err(|e| conn(&e))?;

        let mut client_filter = false;
        let mut ack = next_text(&mut ws_receiver).await?;
        if let Some(err) = ack.get("error") {
            let msg = err.get("message").and_then(|m| m.as_str()).unwrap_or("");
            if !(msg.contains("data did not match") || msg.contains("variant")) {
                return Err(SourceError::Connectivity(format!("subscribe error: {}", msg)));
            }
            tracing::warn!("RPC does not support logs filter, using client-side filter");
            let unfiltered = json!({
                "jsonrpc": "2.0",
                "id": 2,
                "method": "eth_subscribe",
                "params": ["logs"]
            });
            ws_sender
                .send(Message::Text(unfiltered.to_string()))
                .await
                .map_err(|e| conn(&e))?;
            ack = next_text(&mut ws_receiver).await?;
            client_filter = true;
        }
        let sub_id = ack
            .get("result")
            .and_then(|r| r.as_str())
            .ok_or_else(|| SourceError::Connectivity("subscribe: no subscription id".into()))?
            .to_string();
        tracing::info!(%sub_id, "live Ping subscription open");

        let contract = format!("0x{}", hex::encode(self.contract_address));
        let feed = stream::unfold(
            (ws_sender, ws_receiver, false),
            move |(sender, mut receiver, done)| {
                let contract = contract.clone();
                async move {
                    if done {
                        return None;
                    }
                    loop {
                        let text = match receiver.next().await {
                            Some(Ok(Message::Text(t))) => t,
                            Some(Ok(Message::Close(frame))) => {
                                let reason = frame
                                    .map(|f| f.reason.to_string())
                                    .unwrap_or_else(|| "close frame".into());
                                return Some((Err(SourceError::FeedClosed(reason)), (sender, receiver, true)));
                            }
                            Some(Ok(_)) => continue,
                            Some(Err(e)) => {
                                return Some((
                                    Err(SourceError::FeedClosed(e.to_string())),
                                    (sender, receiver, true),
                                ));
                            }
                            None => {
                                return Some((
                                    Err(SourceError::FeedClosed("stream ended".into())),
                                    (sender, receiver, true),
                                ));
                            }
                        };
                        let v: Value = match serde_json::from_str(&text) {
                            Ok(v) => v,
                            Err(e) => {
                                tracing::debug!(%e, "unparseable ws message skipped");
                                continue;
                            }
                        };
                        if v.get("method").and_then(|m| m.as_str()) != Some("eth_subscription") {
                            continue;
                        }
                        let log = match v.get("params").and_then(|p| p.get("result")) {
                            Some(l) => l,
                            None => continue,
                        };
                        if client_filter {
                            let addr = log.get("address").and_then(|a| a.as_str()).unwrap_or("");
                            if !addr.eq_ignore_ascii_case(&contract) {
                                continue;
                            }
                        }
                        if !log_matches_ping(log) || log_is_removed(log) {
                            continue;
                        }
                        let item = decode_ping_log(log)
                            .map_err(|e| SourceError::MalformedEvent(e.to_string()));
                        return Some((item, (sender, receiver, false)));
                    }
                }
            },
        );
        Ok(feed.boxed())
    }
}

async fn next_text<S>(receiver: &mut S) -> Result<Value, SourceError>
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let msg = timeout(Duration::from_secs(10), receiver.next())
        .await
        .map_err(|_| SourceError::Connectivity("subscribe timeout".into()))?
        .ok_or_else(|| SourceError::Connectivity("ws closed".into()))?
        .map_err(|e| SourceError::Connectivity(format!("ws: {}", e)))?;
    match msg {
        Message::Text(t) => {
            serde_json::from_str(&t).map_err(|e| SourceError::Connectivity(format!("parse sub response: {}", e)))
        }
        _ => Err(SourceError::Connectivity("expected text".into())),
    }
}
