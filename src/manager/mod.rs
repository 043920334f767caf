//! Connection lifecycle for everything the archiver talks to: the SQLite
//! pool, the HTTP RPC endpoint (with backup failover), and the supervised
//! streaming connection. One instance per process; all subsystems borrow
//! their connections from here instead of opening their own.

pub mod ws;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use sqlx::SqlitePool;
use tokio::sync::{broadcast, watch, RwLock};
use tracing::{error, info, warn};

use crate::config::{Config, HEALTH_CHECK_INTERVAL};
use crate::error::{AppError, Result};
use crate::manager::ws::{WsShared, WsSupervisor};
use crate::rpc::{PredictionContract, RpcClient};
use crate::timefmt;
use crate::types::ContractEvent;

/// One live manager per process. Claimed on construction, released on
/// `close` or on a failed bring-up.
static INSTANCE_ACTIVE: AtomicBool = AtomicBool::new(false);

const DB_REINIT_ATTEMPTS: u32 = 3;
const DB_REINIT_DELAY_STEP: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Serialize)]
pub struct ManagerStatus {
    pub db_connected: bool,
    pub http_rpc_url: String,
    pub http_rpc_connected: bool,
    pub ws_connected: bool,
    pub ws_reconnects: u64,
    pub ws_events_decoded: u64,
    pub ws_seconds_since_activity: u64,
    pub last_health_check_ts: Option<String>,
}

/// Dependency health as seen by the periodic check. Starts healthy: both
/// the database and the HTTP RPC were verified during bring-up.
struct HealthFlags {
    db_healthy: AtomicBool,
    rpc_healthy: AtomicBool,
    last_check_unix: AtomicU64,
}

impl HealthFlags {
    fn new() -> Self {
        Self {
            db_healthy: AtomicBool::new(true),
            rpc_healthy: AtomicBool::new(true),
            last_check_unix: AtomicU64::new(0),
        }
    }

    fn record_check(&self, db_ok: bool, rpc_ok: bool) {
        self.db_healthy.store(db_ok, Ordering::Relaxed);
        self.rpc_healthy.store(rpc_ok, Ordering::Relaxed);
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        self.last_check_unix.store(now, Ordering::Relaxed);
    }

    fn db_healthy(&self) -> bool {
        self.db_healthy.load(Ordering::Relaxed)
    }

    fn rpc_healthy(&self) -> bool {
        self.rpc_healthy.load(Ordering::Relaxed)
    }

    /// None before the first periodic check has run.
    fn last_check_ts(&self) -> Option<String> {
        match self.last_check_unix.load(Ordering::Relaxed) {
            0 => None,
            ts => Some(timefmt::format_unix_timestamp(ts)),
        }
    }
}

pub struct ConnectionManager {
    config: Config,
    pool: RwLock<SqlitePool>,
    rpc: Arc<RpcClient>,
    contract: PredictionContract,
    ws: Arc<WsShared>,
    health: HealthFlags,
}

impl ConnectionManager {
    /// Full bring-up: database, then HTTP RPC with per-URL failover, then
    /// the streaming supervisor. Database and HTTP failures are fatal; a
    /// streaming failure is not, the supervisor keeps retrying on its own.
    pub async fn connect(config: Config) -> Result<Arc<Self>> {
        if INSTANCE_ACTIVE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(AppError::Connection(
                "connection manager already initialized".to_string(),
            ));
        }

        match Self::connect_inner(config).await {
            Ok(manager) => Ok(manager),
            Err(e) => {
                INSTANCE_ACTIVE.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    async fn connect_inner(config: Config) -> Result<Arc<Self>> {
        let pool = open_pool(&config.db_path).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("database ready at {}", config.db_path);

        let mut http_urls = vec![config.rpc_http_url.clone()];
        http_urls.extend(config.rpc_backup_http_urls.iter().cloned());
        let rpc = Arc::new(RpcClient::new(http_urls, config.rpc_timeout)?);
        let head = rpc.connect().await?;
        info!("HTTP RPC ready via {} (block {head})", rpc.active_url());

        let contract = PredictionContract::new(Arc::clone(&rpc), config.contract_address.clone());

        let mut ws_urls = vec![config.rpc_ws_url.clone()];
        ws_urls.extend(config.rpc_backup_ws_urls.iter().cloned());
        let supervisor = WsSupervisor::new(ws_urls, config.contract_address.clone())?;
        let ws = supervisor.shared();
        tokio::spawn(supervisor.run());

        let manager = Arc::new(Self {
            config,
            pool: RwLock::new(pool),
            rpc,
            contract,
            ws,
            health: HealthFlags::new(),
        });

        let health = Arc::clone(&manager);
        tokio::spawn(async move { health.health_loop().await });

        Ok(manager)
    }

    /// Pool accessor. A closed pool (dropped file handle, forced close) is
    /// reopened with a short retry ladder before giving up.
    pub async fn db_pool(&self) -> Result<SqlitePool> {
        {
            let pool = self.pool.read().await;
            if !pool.is_closed() {
                return Ok(pool.clone());
            }
        }

        let mut pool = self.pool.write().await;
        if !pool.is_closed() {
            return Ok(pool.clone());
        }

        warn!("database pool is closed, reinitializing");
        let mut last_err: Option<AppError> = None;
        for attempt in 1..=DB_REINIT_ATTEMPTS {
            match open_pool(&self.config.db_path).await {
                Ok(fresh) => {
                    *pool = fresh.clone();
                    info!("database pool reinitialized on attempt {attempt}");
                    return Ok(fresh);
                }
                Err(e) => {
                    warn!("database reinit attempt {attempt} failed: {e}");
                    last_err = Some(e);
                    tokio::time::sleep(DB_REINIT_DELAY_STEP * attempt).await;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            AppError::Connection("database pool could not be reinitialized".to_string())
        }))
    }

    pub fn http_rpc(&self) -> Arc<RpcClient> {
        Arc::clone(&self.rpc)
    }

    pub fn contract(&self) -> &PredictionContract {
        &self.contract
    }

    /// Receiver for decoded contract events from the live streaming
    /// connection. Errors while the stream is down: callers wait for a
    /// reconnect tick and try again instead of holding a dead channel.
    pub fn event_stream(&self) -> Result<broadcast::Receiver<ContractEvent>> {
        self.ws.subscribe()
    }

    /// Ticks once per completed streaming (re)connect.
    pub fn reconnect_watch(&self) -> watch::Receiver<u64> {
        self.ws.generation_watch()
    }

    pub async fn status(&self) -> ManagerStatus {
        let db_connected = !self.pool.read().await.is_closed() && self.health.db_healthy();
        ManagerStatus {
            db_connected,
            http_rpc_url: self.rpc.active_url().to_string(),
            http_rpc_connected: self.health.rpc_healthy(),
            ws_connected: self.ws.is_connected(),
            ws_reconnects: self.ws.reconnect_count(),
            ws_events_decoded: self.ws.events_decoded(),
            ws_seconds_since_activity: self.ws.seconds_since_activity(),
            last_health_check_ts: self.health.last_check_ts(),
        }
    }

    async fn health_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(HEALTH_CHECK_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;

            let db_ok = match self.db_pool().await {
                Ok(pool) => match sqlx::query("SELECT 1").execute(&pool).await {
                    Ok(_) => true,
                    Err(e) => {
                        error!("health check: database query failed: {e}");
                        false
                    }
                },
                Err(e) => {
                    error!("health check: database unavailable: {e}");
                    false
                }
            };

            let rpc_ok = match self.rpc.get_block_number().await {
                Ok(_) => true,
                Err(e) => {
                    error!("health check: HTTP RPC failed via {}: {e}", self.rpc.active_url());
                    false
                }
            };

            self.health.record_check(db_ok, rpc_ok);

            if !self.ws.is_connected() {
                warn!(
                    "health check: streaming connection down ({} reconnects so far)",
                    self.ws.reconnect_count()
                );
            }
        }
    }

    pub async fn close(&self) {
        let pool = self.pool.read().await;
        pool.close().await;
        INSTANCE_ACTIVE.store(false, Ordering::Release);
        info!("connection manager closed");
    }
}

async fn open_pool(db_path: &str) -> Result<SqlitePool> {
    // mode=rwc creates the database file on first run.
    let pool = SqlitePool::connect(&format!("sqlite:{db_path}?mode=rwc")).await?;
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_flags_flip_per_dependency_and_stamp_the_check_time() {
        let flags = HealthFlags::new();
        assert!(flags.db_healthy());
        assert!(flags.rpc_healthy());
        assert!(flags.last_check_ts().is_none());

        flags.record_check(true, false);
        assert!(flags.db_healthy());
        assert!(!flags.rpc_healthy());
        assert!(flags.last_check_ts().is_some());

        flags.record_check(false, true);
        assert!(!flags.db_healthy());
        assert!(flags.rpc_healthy());
    }
}
