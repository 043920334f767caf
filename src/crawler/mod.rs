//! Dual-pass historical reconstruction.
//!
//! The backfill pass sweeps backward from two epochs behind the chain head
//! to epoch 1, filling any hole in canonical history. The repair pass wakes
//! on a short interval and re-checks only the most recent epochs so the
//! tail of history stays current between backfill sweeps. Both passes share
//! one per-epoch reconstruction routine and may race on the same epoch;
//! the conflict-tolerant writes make that harmless.

mod blocks;
mod epoch;

pub use blocks::{find_block_by_timestamp, BlockClock, TimestampCache};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::{
    BACKFILL_EPOCH_PAUSE, BACKFILL_RESTART_INTERVAL, REPAIR_CHECK_INTERVAL, REPAIR_EPOCH_PAUSE,
    REPAIR_RECENT_EPOCHS, REPAIR_START_DELAY, SETTLING_EPOCHS,
};
use crate::db::queries;
use crate::error::Result;
use crate::manager::ConnectionManager;
use crate::rpc::with_retry;

const RESTART_IDLE_POLL: Duration = Duration::from_secs(5);
const RESTART_RESUME_DELAY: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Counters
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct CrawlerStats {
    pub rounds_processed: AtomicU64,
    pub bets_processed: AtomicU64,
    pub claims_processed: AtomicU64,
    pub errors: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CrawlerSnapshot {
    pub rounds_processed: u64,
    pub bets_processed: u64,
    pub claims_processed: u64,
    pub errors: u64,
    pub backfill_active: bool,
    pub pending_failure_counters: usize,
}

// ---------------------------------------------------------------------------
// Crawler
// ---------------------------------------------------------------------------

pub struct Crawler {
    manager: Arc<ConnectionManager>,
    stats: CrawlerStats,
    /// Session-scoped failure counters, cleared on every backfill restart.
    failed_attempts: DashMap<u64, u32>,
    backfill_stop: AtomicBool,
    backfill_busy: AtomicBool,
}

impl Crawler {
    pub fn new(manager: Arc<ConnectionManager>) -> Arc<Self> {
        Arc::new(Self {
            manager,
            stats: CrawlerStats::default(),
            failed_attempts: DashMap::new(),
            backfill_stop: AtomicBool::new(false),
            backfill_busy: AtomicBool::new(false),
        })
    }

    pub(crate) fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    pub(crate) fn stats(&self) -> &CrawlerStats {
        &self.stats
    }

    pub(crate) fn failed_attempts(&self) -> &DashMap<u64, u32> {
        &self.failed_attempts
    }

    pub fn snapshot(&self) -> CrawlerSnapshot {
        CrawlerSnapshot {
            rounds_processed: self.stats.rounds_processed.load(Ordering::Relaxed),
            bets_processed: self.stats.bets_processed.load(Ordering::Relaxed),
            claims_processed: self.stats.claims_processed.load(Ordering::Relaxed),
            errors: self.stats.errors.load(Ordering::Relaxed),
            backfill_active: self.backfill_busy.load(Ordering::Relaxed),
            pending_failure_counters: self.failed_attempts.len(),
        }
    }

    /// Launches both passes. Returns immediately; the passes run for the
    /// life of the process.
    pub fn start(self: &Arc<Self>) {
        let backfill = Arc::clone(self);
        tokio::spawn(async move { backfill.backfill_supervisor().await });

        let repair = Arc::clone(self);
        tokio::spawn(async move { repair.repair_loop().await });
    }

    // -- backfill pass ------------------------------------------------------

    /// Runs one backfill sweep per restart window. The restart is graceful:
    /// the running sweep is asked to stop, polled until it reports idle,
    /// failure counters are cleared, then a fresh sweep starts. Clearing
    /// the counters bounds their growth and gives transiently failing
    /// epochs a clean retry window.
    async fn backfill_supervisor(self: Arc<Self>) {
        loop {
            let pass = Arc::clone(&self);
            tokio::spawn(async move { pass.run_backfill_pass().await });

            tokio::time::sleep(BACKFILL_RESTART_INTERVAL).await;

            info!("backfill restart window reached, stopping current sweep");
            self.backfill_stop.store(true, Ordering::Relaxed);
            while self.backfill_busy.load(Ordering::Relaxed) {
                tokio::time::sleep(RESTART_IDLE_POLL).await;
            }
            self.failed_attempts.clear();
            tokio::time::sleep(RESTART_RESUME_DELAY).await;
        }
    }

    async fn run_backfill_pass(&self) {
        self.backfill_busy.store(true, Ordering::Relaxed);
        self.backfill_stop.store(false, Ordering::Relaxed);

        if let Err(e) = self.backfill_sweep().await {
            error!("backfill sweep aborted: {e}");
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
        }

        self.backfill_busy.store(false, Ordering::Relaxed);
    }

    async fn backfill_sweep(&self) -> Result<()> {
        let contract = self.manager.contract();
        let current = with_retry("current_epoch", || contract.current_epoch()).await?;
        let mut check_epoch = current.saturating_sub(SETTLING_EPOCHS);
        info!("backfill sweep starting from epoch {check_epoch}");

        let pool = self.manager.db_pool().await?;
        let mut skipped: u64 = 0;
        let mut processed: u64 = 0;
        let mut last_log = Instant::now();

        while check_epoch > 0 && !self.backfill_stop.load(Ordering::Relaxed) {
            if queries::has_round(&pool, check_epoch).await? {
                skipped += 1;
                // Skips are the common case deep in history; log in batches.
                if last_log.elapsed() > Duration::from_secs(10) {
                    info!("backfill skipped {skipped} stored epochs, now at {check_epoch}");
                    last_log = Instant::now();
                    skipped = 0;
                }
            } else {
                info!("backfill reconstructing epoch {check_epoch}");
                self.process_epoch(check_epoch).await;
                processed += 1;
                tokio::time::sleep(BACKFILL_EPOCH_PAUSE).await;
            }
            check_epoch -= 1;
        }

        info!("backfill sweep finished: {processed} reconstructed, {skipped} skipped at tail");
        Ok(())
    }

    // -- repair pass --------------------------------------------------------

    async fn repair_loop(self: Arc<Self>) {
        info!(
            "repair pass starts in {}s, then every {}s",
            REPAIR_START_DELAY.as_secs(),
            REPAIR_CHECK_INTERVAL.as_secs()
        );
        tokio::time::sleep(REPAIR_START_DELAY).await;

        let mut ticker = tokio::time::interval(REPAIR_CHECK_INTERVAL);
        loop {
            ticker.tick().await;
            if let Err(e) = self.run_repair_check().await {
                error!("repair check failed: {e}");
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    async fn run_repair_check(&self) -> Result<()> {
        let contract = self.manager.contract();
        let current = with_retry("current_epoch", || contract.current_epoch()).await?;
        let newest = current.saturating_sub(SETTLING_EPOCHS);

        let pool = self.manager.db_pool().await?;
        let mut missing = 0u64;

        for i in 0..REPAIR_RECENT_EPOCHS {
            let Some(epoch) = newest.checked_sub(i) else {
                break;
            };
            if epoch == 0 {
                break;
            }
            if !queries::has_round(&pool, epoch).await? {
                warn!("repair pass filling missing epoch {epoch}");
                self.process_epoch(epoch).await;
                missing += 1;
                tokio::time::sleep(REPAIR_EPOCH_PAUSE).await;
            }
        }

        if missing == 0 {
            info!("repair pass: last {REPAIR_RECENT_EPOCHS} epochs complete");
        } else {
            info!("repair pass filled {missing} missing epochs");
        }
        Ok(())
    }
}
