//! Off-chain Ping responder: answers every `Ping()` of the PingPong contract with exactly one
//! `pong(txHash)` transaction.
//!
//! - **Reconciler**: persisted progress, gap-free catch-up over historical blocks (HTTP
//!   `eth_getLogs`, split on oversize ranges), then live following over a WebSocket
//!   subscription. Dedup by emitting transaction hash before every response.
//! - **Supervisor**: restarts the reconciler after retryable failures (fixed backoff) and
//!   stops with a distinct exit status on fatal ones (out of funds, state I/O, bad input).
//!
//! Ledger access goes through the [EventSource] and [Responder] capabilities, so tests can
//! drive the reconciler without a node.

pub mod abi;
pub mod config;
pub mod engine;
pub mod responder;
pub mod rpc;
pub mod source;
pub mod state;
pub mod supervisor;

pub use abi::PingEvent;
pub use config::{BotConfig, ConfigError, SupervisorConfig};
pub use engine::{
    EngineError, Handled, Reconciler, EXIT_BAD_INPUT, EXIT_INSUFFICIENT_FUNDS, EXIT_STATE_IO,
};
pub use responder::{Confirmation, PongResponder, Responder, ResponseError};
pub use rpc::{RpcClient, RpcError};
pub use source::{EthEventSource, EventFeed, EventSource, SourceError};
pub use state::{JsonFileStore, MemoryStore, ProgressState, StateError, StateStore};
pub use supervisor::{Exit, Supervisor};
