//! Common helpers for integration tests: a scripted in-memory ledger.
//! Some helpers are only used by specific test binaries; allow dead_code to avoid per-binary warnings.
#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use pong::{Confirmation, EventFeed, EventSource, PingEvent, Responder, ResponseError, SourceError};
use std::collections::{HashMap, VecDeque};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};

/// Event whose tx hash is `n` repeated, at `block`.
pub fn ping(n: u8, block: u64) -> PingEvent {
    PingEvent::new([n; 32], block, 0)
}

#[derive(Default)]
struct Ledger {
    height: u64,
    /// Heights returned by successive current_height calls before falling back to `height`.
    growth: VecDeque<u64>,
    events: Vec<PingEvent>,
    /// Queries spanning more blocks than this fail with RangeTooLarge.
    max_span: Option<u64>,
    height_failures: u32,
    subscribe_failures: u32,
    feeds: VecDeque<Vec<Result<PingEvent, SourceError>>>,
    responses: HashMap<String, VecDeque<ResponseError>>,
    queries: Vec<(u64, u64)>,
    respond_calls: Vec<String>,
    confirmed: Vec<String>,
    subscribes: u32,
}

/// In-memory ledger implementing both [EventSource] and [Responder]. Clones share state.
#[derive(Clone, Default)]
pub struct MockLedger {
    inner: Arc<Mutex<Ledger>>,
}

impl MockLedger {
    pub fn new(height: u64) -> Self {
        let ledger = Self::default();
        ledger.lock().height = height;
        ledger
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Ledger> {
        self.inner.lock().unwrap()
    }

    pub fn with_events(self, events: impl IntoIterator<Item = PingEvent>) -> Self {
        self.lock().events.extend(events);
        self
    }

    pub fn set_height(&self, height: u64) {
        self.lock().height = height;
    }

    /// Successive current_height calls return these heights first (new blocks arriving).
    pub fn grow(&self, heights: impl IntoIterator<Item = u64>) {
        let mut l = self.lock();
        l.growth.extend(heights);
    }

    pub fn max_span(&self, span: u64) {
        self.lock().max_span = Some(span);
    }

    pub fn fail_height(&self, times: u32) {
        self.lock().height_failures = times;
    }

    pub fn fail_subscribe(&self, times: u32) {
        self.lock().subscribe_failures = times;
    }

    /// Script one live subscription. Items are delivered in order, then the feed ends.
    pub fn push_feed(&self, items: Vec<Result<PingEvent, SourceError>>) {
        self.lock().feeds.push_back(items);
    }

    /// Fail the next response attempts for `event` with these errors, in order.
    pub fn fail_response(&self, event: &PingEvent, errors: Vec<ResponseError>) {
        self.lock()
            .responses
            .entry(event.id())
            .or_default()
            .extend(errors);
    }

    pub fn clear_failures(&self) {
        self.lock().responses.clear();
    }

    pub fn queries(&self) -> Vec<(u64, u64)> {
        self.lock().queries.clone()
    }

    pub fn respond_calls(&self) -> Vec<String> {
        self.lock().respond_calls.clone()
    }

    pub fn confirmed(&self) -> Vec<String> {
        self.lock().confirmed.clone()
    }

    pub fn subscribes(&self) -> u32 {
        self.lock().subscribes
    }
}

#[async_trait]
impl EventSource for MockLedger {
    async fn current_height(&self) -> Result<u64, SourceError> {
        let mut l = self.lock();
        if l.height_failures > 0 {
            l.height_failures -= 1;
            return Err(SourceError::Connectivity("height: connection refused".into()));
        }
        if let Some(h) = l.growth.pop_front() {
            l.height = h;
        }
        Ok(l.height)
    }

    async fn events_in_range(&self, from: u64, to: u64) -> Result<Vec<PingEvent>, SourceError> {
        if from > to {
            return Err(SourceError::InvalidRange { from, to });
        }
        let mut l = self.lock();
        if let Some(span) = l.max_span {
            if to - from + 1 > span {
                return Err(SourceError::RangeTooLarge { from, to });
            }
        }
        l.queries.push((from, to));
        let mut out: Vec<PingEvent> = l
            .events
            .iter()
            .filter(|e| e.block_number >= from && e.block_number <= to)
            .cloned()
            .collect();
        out.sort_by_key(|e| (e.block_number, e.log_index));
        Ok(out)
    }

    async fn subscribe(&self) -> Result<EventFeed, SourceError> {
        let mut l = self.lock();
        l.subscribes += 1;
        if l.subscribe_failures > 0 {
            l.subscribe_failures -= 1;
            return Err(SourceError::Connectivity("ws: connection refused".into()));
        }
        match l.feeds.pop_front() {
            Some(items) => Ok(stream::iter(items).boxed()),
            None => Ok(stream::pending::<Result<PingEvent, SourceError>>().boxed()),
        }
    }
}

#[async_trait]
impl Responder for MockLedger {
    async fn respond(&self, event: &PingEvent) -> Result<Confirmation, ResponseError> {
        let mut l = self.lock();
        let id = event.id();
        l.respond_calls.push(id.clone());
        if let Some(err) = l.responses.get_mut(&id).and_then(|q| q.pop_front()) {
            return Err(err);
        }
        l.confirmed.push(id);
        let mut tx_hash = event.tx_hash;
        tx_hash[0] ^= 0xff;
        Ok(Confirmation {
            tx_hash,
            block_number: l.height + 1,
        })
    }
}

/// True if `anvil` is in PATH (Foundry toolchain available).
pub fn anvil_available() -> bool {
    Command::new("anvil")
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Spawn Anvil on a dynamic port and wait until ready.
pub async fn spawn_anvil() -> anyhow::Result<(std::process::Child, String)> {
    use anyhow::Context;
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").context("bind for port")?;
        listener.local_addr()?.port()
    };
    let rpc_url = format!("http://127.0.0.1:{}", port);
    let process = Command::new("anvil")
        .arg("--port")
        .arg(port.to_string())
        .arg("--host")
        .arg("127.0.0.1")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("spawn anvil")?;
    let rpc = pong::RpcClient::new(rpc_url.clone())?;
    for _ in 0..30 {
        if rpc.block_number().await.is_ok() {
            return Ok((process, rpc_url));
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
    anyhow::bail!("RPC not ready");
}
