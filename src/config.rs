use std::time::Duration;

use crate::error::{AppError, Result};

pub const DEFAULT_RPC_HTTP_URL: &str = "https://bsc-dataseed.binance.org";
pub const DEFAULT_RPC_WS_URL: &str = "wss://bsc-ws-node.nariox.org:443";

/// Treasury fee the contract withholds before paying winners.
pub const TREASURY_FEE_RATE: f64 = 0.03;

/// Chainlink price feeds report with 8 decimals.
pub const PRICE_DECIMALS: u32 = 8;

/// Minimum spacing between outbound chain requests (shared rate limit).
pub const RPC_MIN_REQUEST_SPACING: Duration = Duration::from_millis(10);

/// Retry policy for chain requests: attempt N waits N * RPC_RETRY_DELAY_STEP.
pub const RPC_RETRY_ATTEMPTS: u32 = 3;
pub const RPC_RETRY_DELAY_STEP: Duration = Duration::from_secs(2);

/// Per-URL connection attempts during HTTP RPC bring-up, and the fixed delay
/// between attempts on the same URL.
pub const HTTP_CONNECT_ATTEMPTS: u32 = 3;
pub const HTTP_CONNECT_RETRY_DELAY: Duration = Duration::from_secs(3);

/// WS reconnect backoff: attempts * base, capped. Past MAX_RECONNECT_ATTEMPTS
/// the manager rotates to the next configured node and resets the counter.
pub const WS_RECONNECT_BASE_DELAY: Duration = Duration::from_secs(5);
pub const WS_RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);
pub const WS_MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Periodic full health check (db + http + ws flags).
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Faster watchdog: a WS connection with no frames for this long is presumed
/// silently dead and reconnected even if the socket still looks open.
pub const WS_ACTIVITY_CHECK_INTERVAL: Duration = Duration::from_secs(30);
pub const WS_ACTIVITY_TIMEOUT: Duration = Duration::from_secs(120);

/// Backfill pass: restart cadence and pause between reconstructed epochs.
pub const BACKFILL_RESTART_INTERVAL: Duration = Duration::from_secs(30 * 60);
pub const BACKFILL_EPOCH_PAUSE: Duration = Duration::from_secs(2);

/// Repair pass: start delay, cadence, and how many recent epochs to re-check.
pub const REPAIR_START_DELAY: Duration = Duration::from_secs(5 * 60);
pub const REPAIR_CHECK_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const REPAIR_RECENT_EPOCHS: u64 = 5;
pub const REPAIR_EPOCH_PAUSE: Duration = Duration::from_secs(1);

/// The two most recent epochs are still settling on-chain and are excluded
/// from both passes.
pub const SETTLING_EPOCHS: u64 = 2;

/// Reconstruction failures tolerated before an epoch is quarantined.
pub const MAX_EPOCH_FAILURES: u32 = 3;

/// Listener dedup cache: entries older than the TTL are dropped by a
/// periodic sweep. Session-scoped only; resets on process restart.
pub const BET_DEDUP_TTL: Duration = Duration::from_secs(60 * 60);
pub const BET_DEDUP_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Delay before the listener retries attaching to the event stream when the
/// streaming connection is not up yet.
pub const LISTENER_REATTACH_DELAY: Duration = Duration::from_secs(5);

/// Capacity of the decoded-event broadcast and the realbet writer queue.
pub const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: String,
    /// Primary HTTP RPC URL; backups are tried in order when it fails.
    pub rpc_http_url: String,
    pub rpc_backup_http_urls: Vec<String>,
    /// Primary WS RPC URL; backups joined into the reconnect rotation.
    pub rpc_ws_url: String,
    pub rpc_backup_ws_urls: Vec<String>,
    /// Prediction contract address (0x-prefixed, 20 bytes).
    pub contract_address: String,
    pub rpc_timeout: Duration,
    pub api_port: u16,
    pub log_level: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let contract_address = std::env::var("CONTRACT_ADDRESS")
            .map_err(|_| AppError::Config("CONTRACT_ADDRESS must be set".to_string()))?;
        if !contract_address.starts_with("0x") || contract_address.len() != 42 {
            return Err(AppError::Config(
                "CONTRACT_ADDRESS must be a 0x-prefixed 20-byte hex address".to_string(),
            ));
        }

        Ok(Self {
            db_path: std::env::var("DB_PATH").unwrap_or_else(|_| "archiver.db".to_string()),
            rpc_http_url: std::env::var("RPC_HTTP_URL")
                .unwrap_or_else(|_| DEFAULT_RPC_HTTP_URL.to_string()),
            rpc_backup_http_urls: split_urls(std::env::var("RPC_BACKUP_URLS").unwrap_or_default()),
            rpc_ws_url: std::env::var("RPC_WS_URL")
                .unwrap_or_else(|_| DEFAULT_RPC_WS_URL.to_string()),
            rpc_backup_ws_urls: split_urls(
                std::env::var("RPC_BACKUP_WS_URLS").unwrap_or_default(),
            ),
            contract_address: contract_address.to_lowercase(),
            rpc_timeout: Duration::from_secs(
                std::env::var("RPC_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "60".to_string())
                    .parse::<u64>()
                    .unwrap_or(60),
            ),
            api_port: std::env::var("API_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse::<u16>()
                .map_err(|_| AppError::Config("API_PORT must be a valid port number".to_string()))?,
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

fn split_urls(raw: String) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
