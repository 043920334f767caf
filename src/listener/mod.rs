//! Realtime bet listener.
//!
//! Consumes decoded contract events from the manager's streaming
//! connection, deduplicates bets by (epoch, wallet), broadcasts to push
//! clients first, and persists to the in-flight table afterwards through a
//! writer task so persistence never delays the broadcast path.

mod suspicion;

pub use suspicion::{SuspicionMonitor, SuspicionReport};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{
    BET_DEDUP_SWEEP_INTERVAL, BET_DEDUP_TTL, CHANNEL_CAPACITY, LISTENER_REATTACH_DELAY,
};
use crate::db::queries;
use crate::fanout::{BetPayload, Hub};
use crate::manager::ConnectionManager;
use crate::timefmt;
use crate::types::ContractEvent;

#[derive(Debug, Clone, Serialize)]
pub struct ListenerSnapshot {
    pub stream_attached: bool,
    pub connected_clients: usize,
    pub messages_broadcast: u64,
    pub bets_processed: u64,
    pub bets_deduplicated: u64,
    pub dedup_entries: usize,
    pub tracked_wallets: usize,
}

// ---------------------------------------------------------------------------
// Event pipeline — dedup, suspicion, broadcast, deferred persist
// ---------------------------------------------------------------------------

/// Everything between a decoded event and its outputs. Holds no connection
/// state so it can be exercised directly in tests.
struct BetPipeline {
    hub: Arc<Hub>,
    /// First bet per (epoch, wallet) this session wins; later deliveries
    /// of the same key are dropped.
    processed_bets: DashMap<(u64, String), Instant>,
    monitor: Mutex<SuspicionMonitor>,
    writer_tx: mpsc::Sender<BetPayload>,
    bets_processed: AtomicU64,
    bets_deduplicated: AtomicU64,
}

impl BetPipeline {
    fn new(hub: Arc<Hub>, writer_tx: mpsc::Sender<BetPayload>) -> Self {
        Self {
            hub,
            processed_bets: DashMap::new(),
            monitor: Mutex::new(SuspicionMonitor::new()),
            writer_tx,
            bets_processed: AtomicU64::new(0),
            bets_deduplicated: AtomicU64::new(0),
        }
    }

    fn handle_event(&self, event: ContractEvent) {
        match event {
            ContractEvent::Bet {
                direction,
                sender,
                epoch,
                amount,
                tx_hash,
                block_number,
            } => {
                let key = (epoch, sender.clone());
                if self.processed_bets.contains_key(&key) {
                    self.bets_deduplicated.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                self.processed_bets.insert(key, Instant::now());

                let suspicious = self
                    .monitor
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .check(&sender);

                let bet = BetPayload {
                    epoch,
                    bet_ts: timefmt::now_formatted(),
                    wallet_address: sender,
                    bet_direction: direction.to_string(),
                    amount,
                    tx_hash,
                    block_number,
                };

                // Broadcast first; persistence happens on the writer task.
                self.hub.broadcast_bet(&bet, &suspicious);
                self.bets_processed.fetch_add(1, Ordering::Relaxed);

                if suspicious.is_suspicious {
                    info!(
                        "suspicious wallet {}: {}",
                        bet.wallet_address,
                        suspicious.flags.join(", ")
                    );
                }
                if let Err(e) = self.writer_tx.try_send(bet) {
                    warn!("realbet writer queue full, dropping persist: {e}");
                }
            }
            ContractEvent::RoundPhase { phase, epoch } => {
                info!("round {epoch} {phase}");
                self.hub.broadcast_round_event(phase, epoch);
            }
            ContractEvent::Claim { .. } => {
                // Claims are reconstructed historically, not streamed live.
            }
        }
    }

    fn sweep_dedup(&self) -> usize {
        let before = self.processed_bets.len();
        self.processed_bets
            .retain(|_, seen| seen.elapsed() < BET_DEDUP_TTL);
        before.saturating_sub(self.processed_bets.len())
    }
}

// ---------------------------------------------------------------------------
// Listener — attaches the pipeline to the manager's event stream
// ---------------------------------------------------------------------------

pub struct Listener {
    manager: Arc<ConnectionManager>,
    pipeline: Arc<BetPipeline>,
}

impl Listener {
    pub fn new(manager: Arc<ConnectionManager>, hub: Arc<Hub>) -> Arc<Self> {
        let (writer_tx, writer_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let pipeline = Arc::new(BetPipeline::new(hub, writer_tx));

        tokio::spawn(realbet_writer(Arc::clone(&manager), writer_rx));

        let sweeper = Arc::clone(&pipeline);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(BET_DEDUP_SWEEP_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = sweeper.sweep_dedup();
                if removed > 0 {
                    info!("dedup sweep dropped {removed} stale entries");
                }
            }
        });

        Arc::new(Self { manager, pipeline })
    }

    pub fn snapshot(&self) -> ListenerSnapshot {
        let tracked_wallets = self
            .pipeline
            .monitor
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .tracked_wallets();
        ListenerSnapshot {
            stream_attached: self.manager.event_stream().is_ok(),
            connected_clients: self.pipeline.hub.client_count(),
            messages_broadcast: self.pipeline.hub.messages_sent(),
            bets_processed: self.pipeline.bets_processed.load(Ordering::Relaxed),
            bets_deduplicated: self.pipeline.bets_deduplicated.load(Ordering::Relaxed),
            dedup_entries: self.pipeline.processed_bets.len(),
            tracked_wallets,
        }
    }

    /// Attach to the event stream and consume until it closes, then attach
    /// again. The stream closes whenever the streaming connection is
    /// replaced; the fresh receiver is bound to the new connection, never
    /// a cached one.
    pub async fn run(self: Arc<Self>) {
        let mut reconnects = self.manager.reconnect_watch();
        loop {
            let mut stream = match self.manager.event_stream() {
                Ok(s) => s,
                Err(_) => {
                    debug!("event stream not available yet, waiting for reconnect");
                    let _ = tokio::time::timeout(LISTENER_REATTACH_DELAY, reconnects.changed())
                        .await;
                    continue;
                }
            };
            info!("listener attached to event stream");

            loop {
                match stream.recv().await {
                    Ok(event) => self.pipeline.handle_event(event),
                    Err(RecvError::Lagged(n)) => {
                        warn!("listener lagged, {n} events dropped");
                    }
                    Err(RecvError::Closed) => {
                        warn!("event stream closed, re-attaching");
                        break;
                    }
                }
            }
        }
    }
}

/// Drains the writer queue into the in-flight table. A duplicate-key race
/// with another delivery path is expected and swallowed; anything else is
/// logged and the loop keeps going.
async fn realbet_writer(manager: Arc<ConnectionManager>, mut rx: mpsc::Receiver<BetPayload>) {
    while let Some(bet) = rx.recv().await {
        let pool = match manager.db_pool().await {
            Ok(p) => p,
            Err(e) => {
                warn!("realbet writer has no database, dropping bet: {e}");
                continue;
            }
        };
        let result = queries::upsert_realbet(
            &pool,
            bet.epoch,
            &bet.bet_ts,
            &bet.wallet_address,
            &bet.bet_direction,
            bet.amount,
        )
        .await;
        match result {
            Ok(()) => {}
            Err(e) if e.is_unique_violation() => {
                debug!(
                    "wallet {} already recorded for epoch {}",
                    bet.wallet_address, bet.epoch
                );
            }
            Err(e) => warn!("realbet persist failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BetDirection, RoundPhase};

    fn pipeline() -> (BetPipeline, mpsc::Receiver<BetPayload>) {
        let (writer_tx, writer_rx) = mpsc::channel(16);
        (BetPipeline::new(Arc::new(Hub::new()), writer_tx), writer_rx)
    }

    fn bet_event(epoch: u64, wallet: &str, tx: &str) -> ContractEvent {
        ContractEvent::Bet {
            direction: BetDirection::Up,
            sender: wallet.to_string(),
            epoch,
            amount: 1.0,
            tx_hash: tx.to_string(),
            block_number: 1,
        }
    }

    #[tokio::test]
    async fn duplicate_bet_broadcasts_and_persists_once() {
        let (pipeline, mut writer_rx) = pipeline();
        let mut push = pipeline.hub.subscribe();

        pipeline.handle_event(bet_event(100, "0xaaa", "0xt1"));
        pipeline.handle_event(bet_event(100, "0xaaa", "0xt1"));

        assert!(push.try_recv().is_ok());
        assert!(push.try_recv().is_err());
        assert!(writer_rx.try_recv().is_ok());
        assert!(writer_rx.try_recv().is_err());
        assert_eq!(pipeline.bets_processed.load(Ordering::Relaxed), 1);
        assert_eq!(pipeline.bets_deduplicated.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn same_wallet_different_epoch_is_not_a_duplicate() {
        let (pipeline, mut writer_rx) = pipeline();

        pipeline.handle_event(bet_event(100, "0xaaa", "0xt1"));
        pipeline.handle_event(bet_event(101, "0xaaa", "0xt2"));

        assert!(writer_rx.try_recv().is_ok());
        assert!(writer_rx.try_recv().is_ok());
        assert_eq!(pipeline.bets_processed.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn round_phase_events_are_rebroadcast_without_persistence() {
        let (pipeline, mut writer_rx) = pipeline();
        let mut push = pipeline.hub.subscribe();

        pipeline.handle_event(ContractEvent::RoundPhase {
            phase: RoundPhase::Start,
            epoch: 200,
        });

        let text = push.try_recv().unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["channel"], "round_event");
        assert_eq!(value["type"], "start");
        assert!(writer_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn sweep_keeps_fresh_entries() {
        let (pipeline, _writer_rx) = pipeline();
        pipeline.handle_event(bet_event(100, "0xaaa", "0xt1"));
        assert_eq!(pipeline.sweep_dedup(), 0);
        assert_eq!(pipeline.processed_bets.len(), 1);
    }
}
