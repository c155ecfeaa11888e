//! Example: run the Ping responder until a fatal error or Ctrl-C.
//!
//! Reads `.env` and the environment (see `BotConfig::from_env`); flags override.
//! `PRIVATE_KEY` holds the responding account's key.
//!
//! Usage:
//!
//!   cargo run -p pong --example pong_bot -- [--http-url URL] [--ws-url WS_URL] [--contract 0x...] [--state PATH] [--start-block N]

use pong::config::{parse_contract_address, parse_start_block};
use pong::responder::signing_key_from_hex;
use pong::{
    BotConfig, EthEventSource, JsonFileStore, PongResponder, Reconciler, RpcClient, Supervisor,
    SupervisorConfig,
};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Invalid configuration or credentials (sysexits EX_CONFIG).
const EXIT_CONFIG: i32 = 78;

fn main() {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let code = match run() {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(reason = %e, "startup failed");
            EXIT_CONFIG
        }
    };
    std::process::exit(code);
}

fn run() -> anyhow::Result<i32> {
    let mut config = BotConfig::from_env()?;
    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--http-url" => {
                i += 1;
                config.http_url = args.get(i).cloned().unwrap_or_default();
                config.ws_url = pong::config::ws_url_for(&config.http_url);
            }
            "--ws-url" => {
                i += 1;
                config.ws_url = args.get(i).cloned().unwrap_or_default();
            }
            "--contract" => {
                i += 1;
                let s = args.get(i).cloned().unwrap_or_default();
                config.contract_address =
                    parse_contract_address(&s).map_err(|e| anyhow::anyhow!("--contract: {}", e))?;
            }
            "--state" => {
                i += 1;
                config.state_path = PathBuf::from(args.get(i).cloned().unwrap_or_default());
            }
            "--start-block" => {
                i += 1;
                let s = args.get(i).cloned().unwrap_or_default();
                config.start_block =
                    Some(parse_start_block(&s).map_err(|e| anyhow::anyhow!("--start-block: {}", e))?);
            }
            "--help" | "-h" => {
                eprintln!(
                    "Usage: pong_bot [--http-url URL] [--ws-url WS_URL] [--contract 0xADDR] [--state PATH] [--start-block N]\n\
                     Answers every Ping() of the contract with one pong(txHash).\n\
                     Environment: PRIVATE_KEY (required), SEPOLIA_RPC_URL, WS_RPC_URL, CONTRACT_ADDRESS,\n\
                     START_BLOCK, STATE_FILE, GETLOGS_MAX_RANGE, GAS_LIMIT. RUST_LOG controls logging."
                );
                return Ok(0);
            }
            _ => {}
        }
        i += 1;
    }

    let private_key = std::env::var("PRIVATE_KEY").unwrap_or_default();
    tracing::info!(set = !private_key.is_empty(), "loaded PRIVATE_KEY");
    let key = signing_key_from_hex(&private_key).map_err(|e| anyhow::anyhow!("PRIVATE_KEY: {}", e))?;
    tracing::info!(http_url = %config.http_url, ws_url = %config.ws_url, "using RPC");

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let rpc = RpcClient::new(config.http_url.clone())?;
        let policy = SupervisorConfig::default();
        let backoff = policy.restart_backoff;
        let responder = loop {
            match PongResponder::connect(
                rpc.clone(),
                key.clone(),
                config.contract_address,
                config.gas_limit,
                config.receipt_poll_interval,
            )
            .await
            {
                Ok(r) => break r,
                Err(e) => {
                    tracing::warn!(reason = %e, "RPC not reachable, retrying");
                    tokio::time::sleep(backoff).await;
                }
            }
        };
        let source = EthEventSource::new(rpc, config.ws_url.clone(), config.contract_address);
        let store = JsonFileStore::new(config.state_path.clone());
        let engine = Reconciler::new(source, responder, store)
            .start_block(config.start_block)
            .max_range(config.getlogs_max_range)
            .policy(policy);
        let mut supervisor = Supervisor::new(engine, backoff);
        let exit = supervisor
            .run_until(async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await;
        if let pong::Exit::Fatal { error: pong::EngineError::InsufficientFunds(_), .. } = &exit {
            tracing::error!("bot out of Sepolia ETH, top up the responder account from a faucet");
        }
        Ok::<i32, anyhow::Error>(exit.code())
    })
}
