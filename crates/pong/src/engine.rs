//! Reconciler: exactly-once pong for every Ping from the start block onward.
//!
//! One sequential worker owns the [ProgressState]. Each run goes
//! initialize → catch-up → subscribe → handoff catch-up → live, and only returns on error.
//! The dedup set is consulted before every response attempt on both paths.

use crate::abi::PingEvent;
use crate::config::SupervisorConfig;
use crate::responder::{Responder, ResponseError};
use crate::source::{EventFeed, EventSource, SourceError};
use crate::state::{ProgressState, StateError, StateStore};
use futures_util::StreamExt;
use std::convert::Infallible;
use thiserror::Error;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};

/// Process exit status for an exhausted response account.
pub const EXIT_INSUFFICIENT_FUNDS: i32 = 1;
/// Process exit status when progress can no longer be persisted or read.
pub const EXIT_STATE_IO: i32 = 2;
/// Process exit status for ledger input that cannot be processed (e.g. an event without id).
pub const EXIT_BAD_INPUT: i32 = 3;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("out of funds: {0}")]
    InsufficientFunds(String),
    #[error(transparent)]
    State(#[from] StateError),
    #[error("pong for {id} still failing after {attempts} attempts: {reason}")]
    TransientExhausted {
        id: String,
        attempts: u32,
        reason: String,
    },
}

impl EngineError {
    /// Exit status if this error must stop the process; None if a restart can recover.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            EngineError::InsufficientFunds(_) => Some(EXIT_INSUFFICIENT_FUNDS),
            EngineError::State(_) => Some(EXIT_STATE_IO),
            EngineError::Source(SourceError::MalformedEvent(_))
            | EngineError::Source(SourceError::InvalidRange { .. }) => Some(EXIT_BAD_INPUT),
            EngineError::Source(_) | EngineError::TransientExhausted { .. } => None,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.exit_code().is_some()
    }
}

/// What happened to one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    Responded,
    /// Already answered (or permanently rejected); no response sent.
    Skipped,
    Rejected,
}

/// Sequential reconciliation engine over an event source, a responder and a state store.
pub struct Reconciler<S, R, T> {
    source: S,
    responder: R,
    store: T,
    start_block: Option<u64>,
    max_range: u64,
    policy: SupervisorConfig,
    state: ProgressState,
}

impl<S, R, T> Reconciler<S, R, T>
where
    S: EventSource,
    R: Responder,
    T: StateStore,
{
    pub fn new(source: S, responder: R, store: T) -> Self {
        Self {
            source,
            responder,
            store,
            start_block: None,
            max_range: 1000,
            policy: SupervisorConfig::default(),
            state: ProgressState::default(),
        }
    }

    /// Start block used on first run. None: the chain height at first run.
    pub fn start_block(mut self, start: Option<u64>) -> Self {
        self.start_block = start;
        self
    }

    /// Max blocks per ranged query (at least 1).
    pub fn max_range(mut self, blocks: u64) -> Self {
        self.max_range = blocks.max(1);
        self
    }

    pub fn policy(mut self, policy: SupervisorConfig) -> Self {
        self.policy = policy;
        self
    }

    /// In-memory view of the progress record.
    pub fn state(&self) -> &ProgressState {
        &self.state
    }

    pub fn store(&self) -> &T {
        &self.store
    }

    /// Run one full iteration. Returns only when the iteration ends: on a fatal error or on
    /// a retryable one such as loss of the live feed.
    pub async fn run(&mut self) -> Result<Infallible, EngineError> {
        self.initialize().await?;
        self.catch_up().await?;
        let feed = self.source.subscribe().await?;
        // Blocks mined while the subscription was opening are covered here or by the feed.
        self.catch_up().await?;
        tracing::info!(
            last_processed = self.state.last_processed_block,
            "caught up, following live Ping events"
        );
        self.live(feed).await
    }

    /// Load the persisted record and assign the start block on first run.
    pub async fn initialize(&mut self) -> Result<(), EngineError> {
        self.state = self.store.load()?;
        tracing::info!(
            start_block = ?self.state.start_block,
            last_processed = self.state.last_processed_block,
            processed = self.state.processed_txs().len(),
            rejected = self.state.rejected_txs().len(),
            "state loaded"
        );
        if self.state.start_block.is_none() {
            let start = match self.start_block {
                Some(b) => b,
                None => self.source.current_height().await?,
            };
            self.state.assign_start(start);
            self.store.save(&self.state)?;
            tracing::info!(start_block = start, "start block assigned");
        }
        Ok(())
    }

    /// Reconcile every block up to the chain height, re-reading the height after each pass
    /// until nothing is left.
    pub async fn catch_up(&mut self) -> Result<(), EngineError> {
        loop {
            let current = self.source.current_height().await?;
            let last = self.state.last_processed_block;
            if last >= current {
                tracing::debug!(last_processed = last, current, "no catch-up needed");
                return Ok(());
            }
            let from = last + 1;
            tracing::info!(from, to = current, "catching up");
            let (mut found, mut responded) = (0usize, 0usize);
            let mut chunk_from = from;
            while chunk_from <= current {
                let chunk_to = chunk_from.saturating_add(self.max_range - 1).min(current);
                let events = self.fetch_range(chunk_from, chunk_to).await?;
                found += events.len();
                for event in &events {
                    if self.respond_to(event).await? == Handled::Responded {
                        responded += 1;
                    }
                }
                self.state.advance_to(chunk_to);
                self.store.save(&self.state)?;
                chunk_from = chunk_to + 1;
            }
            tracing::info!(from, to = current, found, responded, "catch-up pass complete");
        }
    }

    /// Ranged query that splits on [SourceError::RangeTooLarge]. Sub-ranges are queried
    /// left to right, so the result stays in ascending order.
    async fn fetch_range(&self, from: u64, to: u64) -> Result<Vec<PingEvent>, EngineError> {
        let mut pending = vec![(from, to)];
        let mut out = Vec::new();
        while let Some((a, b)) = pending.pop() {
            match self.source.events_in_range(a, b).await {
                Ok(events) => out.extend(events),
                Err(SourceError::RangeTooLarge { .. }) if a < b => {
                    let mid = a + (b - a) / 2;
                    tracing::debug!(from = a, to = b, mid, "range too large, splitting");
                    pending.push((mid + 1, b));
                    pending.push((a, mid));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(out)
    }

    async fn live(&mut self, mut feed: EventFeed) -> Result<Infallible, EngineError> {
        let mut probe = self.policy.health_check_interval.map(|every| {
            let mut interval = interval_at(Instant::now() + every, every);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        loop {
            let item = match probe.as_mut() {
                Some(interval) => tokio::select! {
                    item = feed.next() => item,
                    _ = interval.tick() => {
                        let height = self.source.current_height().await?;
                        tracing::debug!(height, "connectivity probe ok");
                        continue;
                    }
                },
                None => feed.next().await,
            };
            let event = match item {
                Some(Ok(event)) => event,
                Some(Err(e)) => return Err(e.into()),
                None => return Err(SourceError::FeedClosed("feed ended".into()).into()),
            };
            // The feed is ordered, so every block below this event's block has been delivered.
            let floor = event.block_number.saturating_sub(1);
            let raised = floor > self.state.last_processed_block;
            self.state.advance_to(floor);
            if self.respond_to(&event).await? == Handled::Skipped && raised {
                self.store.save(&self.state)?;
            }
        }
    }

    /// Dedup, respond, classify, persist. Transient failures retry the same event.
    pub async fn respond_to(&mut self, event: &PingEvent) -> Result<Handled, EngineError> {
        let id = event.id();
        if self.state.is_seen(&id) {
            tracing::info!(ping = %id, "skipping already processed tx");
            return Ok(Handled::Skipped);
        }
        if self.state.is_rejected(&id) {
            tracing::debug!(ping = %id, "skipping previously rejected tx");
            return Ok(Handled::Skipped);
        }
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            tracing::info!(ping = %id, block = event.block_number, attempt, "sending pong");
            match self.responder.respond(event).await {
                Ok(confirmation) => {
                    tracing::info!(
                        ping = %id,
                        pong = %format!("0x{}", hex::encode(confirmation.tx_hash)),
                        pong_block = confirmation.block_number,
                        "pong confirmed"
                    );
                    self.state.mark_seen(&id);
                    self.store.save(&self.state)?;
                    return Ok(Handled::Responded);
                }
                Err(ResponseError::InsufficientFunds(reason)) => {
                    tracing::error!(ping = %id, %reason, "responder account out of funds");
                    return Err(EngineError::InsufficientFunds(reason));
                }
                Err(ResponseError::Rejected(reason)) => {
                    tracing::warn!(ping = %id, %reason, "anomaly: pong rejected, skipping event");
                    self.state.mark_rejected(&id);
                    self.store.save(&self.state)?;
                    return Ok(Handled::Rejected);
                }
                Err(ResponseError::Transient(reason)) => {
                    if attempt > self.policy.transient_retries {
                        return Err(EngineError::TransientExhausted {
                            id,
                            attempts: attempt,
                            reason,
                        });
                    }
                    tracing::warn!(ping = %id, %reason, attempt, "pong failed, retrying");
                    sleep(self.policy.transient_retry_delay).await;
                }
            }
        }
    }
}
