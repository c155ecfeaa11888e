//! Bot and supervisor configuration.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Default PingPong contract on Sepolia.
pub const DEFAULT_CONTRACT_ADDRESS: &str = "0xa7f42ff7433cb268dd7d59be62b00c30ded28d3d";
pub const DEFAULT_HTTP_URL: &str = "https://rpc.sepolia.org";
pub const DEFAULT_START_BLOCK: u64 = 7_907_600;
pub const DEFAULT_GAS_LIMIT: u64 = 100_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} is invalid: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Connection, contract, and persistence settings.
#[derive(Debug, Clone)]
pub struct BotConfig {
    /// HTTP RPC URL for height, eth_getLogs, and transaction submission.
    pub http_url: String,
    /// WebSocket RPC URL for the live log subscription.
    pub ws_url: String,
    /// PingPong contract address (20 bytes).
    pub contract_address: [u8; 20],
    /// First block to respond to. None: current height at first run.
    pub start_block: Option<u64>,
    /// Path of the persisted progress record.
    pub state_path: PathBuf,
    /// Max block range per eth_getLogs request.
    pub getlogs_max_range: u64,
    pub gas_limit: u64,
    pub receipt_poll_interval: Duration,
}

impl BotConfig {
    pub fn new(http_url: impl Into<String>, contract_address: [u8; 20]) -> Self {
        let http_url = http_url.into();
        Self {
            ws_url: ws_url_for(&http_url),
            http_url,
            contract_address,
            start_block: None,
            state_path: PathBuf::from("state.json"),
            getlogs_max_range: 1000,
            gas_limit: DEFAULT_GAS_LIMIT,
            receipt_poll_interval: Duration::from_secs(2),
        }
    }

    /// Read settings from the process environment, falling back to Sepolia defaults.
    ///
    /// `SEPOLIA_RPC_URL`, `WS_RPC_URL`, `CONTRACT_ADDRESS`, `START_BLOCK`, `STATE_FILE`,
    /// `GETLOGS_MAX_RANGE`, `GAS_LIMIT`. The signing key is not part of this config.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok().filter(|v| !v.is_empty()))
    }

    pub(crate) fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let http_url = get("SEPOLIA_RPC_URL").unwrap_or_else(|| DEFAULT_HTTP_URL.into());
        let contract = get("CONTRACT_ADDRESS").unwrap_or_else(|| DEFAULT_CONTRACT_ADDRESS.into());
        let contract_address = parse_contract_address(&contract).map_err(|reason| ConfigError::Invalid {
            name: "CONTRACT_ADDRESS",
            reason,
        })?;
        let mut config = Self::new(http_url, contract_address);
        if let Some(ws) = get("WS_RPC_URL") {
            config.ws_url = ws;
        }
        config.start_block = Some(match get("START_BLOCK") {
            Some(v) => parse_start_block(&v).map_err(|reason| ConfigError::Invalid {
                name: "START_BLOCK",
                reason,
            })?,
            None => DEFAULT_START_BLOCK,
        });
        if let Some(path) = get("STATE_FILE") {
            config.state_path = PathBuf::from(path);
        }
        if let Some(range) = parse_u64(&get, "GETLOGS_MAX_RANGE")? {
            if range == 0 {
                return Err(ConfigError::Invalid {
                    name: "GETLOGS_MAX_RANGE",
                    reason: "must be at least 1".into(),
                });
            }
            config.getlogs_max_range = range;
        }
        if let Some(gas) = parse_u64(&get, "GAS_LIMIT")? {
            config.gas_limit = gas;
        }
        Ok(config)
    }
}

fn parse_u64(get: &impl Fn(&str) -> Option<String>, name: &'static str) -> Result<Option<u64>, ConfigError> {
    get(name)
        .map(|v| {
            v.trim().parse::<u64>().map_err(|e| ConfigError::Invalid {
                name,
                reason: e.to_string(),
            })
        })
        .transpose()
}

/// First block to answer Pings from. Genesis holds no transactions, so 0 is refused.
pub fn parse_start_block(s: &str) -> Result<u64, String> {
    match s.trim().parse::<u64>() {
        Ok(0) => Err("must be at least 1".into()),
        Ok(n) => Ok(n),
        Err(e) => Err(format!("{:?} is not a block number: {}", s, e)),
    }
}

/// ws:// or wss:// counterpart of an HTTP RPC URL.
pub fn ws_url_for(http_url: &str) -> String {
    http_url
        .replace("http://", "ws://")
        .replace("https://", "wss://")
}

pub fn parse_contract_address(s: &str) -> Result<[u8; 20], String> {
    let addr_hex = s.trim().strip_prefix("0x").unwrap_or(s.trim());
    let addr_bytes = hex::decode(addr_hex).map_err(|e| e.to_string())?;
    if addr_bytes.len() != 20 {
        return Err("contract must be 20 bytes (40 hex chars)".into());
    }
    let mut out = [0u8; 20];
    out.copy_from_slice(&addr_bytes);
    Ok(out)
}

/// Restart and retry policy for the supervisor and engine.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Fixed delay before restarting after a retryable failure.
    pub restart_backoff: Duration,
    /// Extra attempts for one event after a transient response failure.
    pub transient_retries: u32,
    pub transient_retry_delay: Duration,
    /// Live-phase connectivity probe. None disables it.
    pub health_check_interval: Option<Duration>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            restart_backoff: Duration::from_secs(5),
            transient_retries: 3,
            transient_retry_delay: Duration::from_secs(2),
            health_check_interval: Some(Duration::from_secs(30)),
        }
    }
}
