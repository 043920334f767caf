//! Per-epoch reconstruction, shared by both crawler passes.

use std::sync::atomic::Ordering;

use sqlx::SqlitePool;
use tracing::{error, info, warn};

use crate::config::{MAX_EPOCH_FAILURES, TREASURY_FEE_RATE};
use crate::crawler::blocks::{find_block_by_timestamp, TimestampCache};
use crate::crawler::Crawler;
use crate::db::queries;
use crate::error::{AppError, Result};
use crate::rpc::codec::{decode_log, TOPIC_BET_BEAR, TOPIC_BET_BULL, TOPIC_CLAIM};
use crate::rpc::{with_retry, PredictionContract, RawRound};
use crate::timefmt;
use crate::types::{BetDirection, BetOutcome, BetRecord, ClaimRecord, ContractEvent, RoundRecord};

enum Reconstruction {
    Stored { bets: usize, claims: usize },
    Quarantined,
    NotFinished,
}

/// Source of on-chain round data, a seam so the quarantine gate can be
/// exercised without a live node.
trait RoundReader: Sync {
    fn round(&self, epoch: u64) -> impl std::future::Future<Output = Result<RawRound>> + Send;
}

impl RoundReader for PredictionContract {
    fn round(&self, epoch: u64) -> impl std::future::Future<Output = Result<RawRound>> + Send {
        PredictionContract::round(self, epoch)
    }
}

/// Quarantine gate plus the initial round fetch. An epoch at the failure
/// limit is skipped here, before any chain request goes out.
async fn fetch_unless_quarantined<R: RoundReader>(
    pool: &SqlitePool,
    reader: &R,
    epoch: u64,
) -> Result<Option<RawRound>> {
    if queries::failure_count(pool, epoch).await? >= i64::from(MAX_EPOCH_FAILURES) {
        return Ok(None);
    }
    Ok(Some(with_retry("rounds", || reader.round(epoch)).await?))
}

impl Crawler {
    /// Reconstruct one epoch end to end. Never propagates an error: every
    /// failure is absorbed into the per-epoch failure accounting so the
    /// calling pass just moves on to the next epoch.
    pub(crate) async fn process_epoch(&self, epoch: u64) {
        match self.reconstruct(epoch).await {
            Ok(Reconstruction::Stored { bets, claims }) => {
                self.stats().rounds_processed.fetch_add(1, Ordering::Relaxed);
                self.stats()
                    .bets_processed
                    .fetch_add(bets as u64, Ordering::Relaxed);
                self.stats()
                    .claims_processed
                    .fetch_add(claims as u64, Ordering::Relaxed);
                info!("epoch {epoch} stored ({bets} bets, {claims} claims)");
            }
            Ok(Reconstruction::Quarantined) => {
                info!("epoch {epoch} is quarantined, skipping");
            }
            Ok(Reconstruction::NotFinished) => {
                info!("epoch {epoch} has not closed yet, skipping");
            }
            Err(e) => {
                error!("epoch {epoch} reconstruction failed: {e}");
                self.stats().errors.fetch_add(1, Ordering::Relaxed);
                if let Err(e2) = self.handle_epoch_failure(epoch, &e.to_string()).await {
                    error!("failure bookkeeping for epoch {epoch} also failed: {e2}");
                }
            }
        }
    }

    async fn reconstruct(&self, epoch: u64) -> Result<Reconstruction> {
        let pool = self.manager().db_pool().await?;
        let contract = self.manager().contract();
        let Some(raw) = fetch_unless_quarantined(&pool, contract, epoch).await? else {
            return Ok(Reconstruction::Quarantined);
        };
        if !raw.is_finished() {
            return Ok(Reconstruction::NotFinished);
        }
        let round = build_round_record(&raw);

        // The scan range ends where the next round begins, so epoch+1 must
        // already exist on-chain.
        let next = with_retry("rounds", || contract.round(epoch + 1)).await?;
        if next.start_timestamp == 0 {
            return Err(AppError::Reconstruction(format!(
                "epoch {} has not started, cannot bound the scan range",
                epoch + 1
            )));
        }

        let rpc = self.manager().http_rpc();
        let from_block = find_block_by_timestamp(rpc.as_ref(), raw.start_timestamp).await?;
        let to_block = find_block_by_timestamp(rpc.as_ref(), next.start_timestamp).await?;

        let address = contract.address();
        let (bull_logs, bear_logs, claim_logs) = tokio::try_join!(
            with_retry("get_logs BetBull", || rpc.get_logs(
                address,
                TOPIC_BET_BULL,
                from_block,
                to_block
            )),
            with_retry("get_logs BetBear", || rpc.get_logs(
                address,
                TOPIC_BET_BEAR,
                from_block,
                to_block
            )),
            with_retry("get_logs Claim", || rpc.get_logs(
                address,
                TOPIC_CLAIM,
                from_block,
                to_block
            )),
        )?;

        let mut cache = TimestampCache::new();
        let mut bets: Vec<BetRecord> = Vec::new();
        for log in bull_logs.iter().chain(bear_logs.iter()) {
            let event = match decode_log(log) {
                Ok(ev) => ev,
                Err(e) => {
                    warn!("skipping undecodable bet log {}: {e}", log.transaction_hash);
                    continue;
                }
            };
            let ContractEvent::Bet {
                direction,
                sender,
                epoch: event_epoch,
                amount,
                tx_hash,
                block_number,
            } = event
            else {
                continue;
            };
            // The block range brackets the round loosely; keep only this
            // epoch's bets.
            if event_epoch != epoch {
                continue;
            }
            let block_ts = cache.get(rpc.as_ref(), block_number).await?;
            bets.push(BetRecord {
                epoch,
                bet_ts: timefmt::format_unix_timestamp(block_ts),
                wallet_address: sender,
                bet_direction: direction,
                amount,
                result: BetOutcome::from_direction(direction, round.result),
                tx_hash,
            });
        }

        // Claims in this range may settle bets from earlier rounds; they are
        // all kept, tagged with both the scanned epoch and the bet's epoch.
        let mut claims: Vec<ClaimRecord> = Vec::new();
        for log in &claim_logs {
            let event = match decode_log(log) {
                Ok(ev) => ev,
                Err(e) => {
                    warn!("skipping undecodable claim log {}: {e}", log.transaction_hash);
                    continue;
                }
            };
            let ContractEvent::Claim {
                sender,
                epoch: bet_epoch,
                amount,
                block_number,
                ..
            } = event
            else {
                continue;
            };
            let block_ts = cache.get(rpc.as_ref(), block_number).await?;
            claims.push(ClaimRecord {
                epoch,
                claim_ts: timefmt::format_unix_timestamp(block_ts),
                wallet_address: sender,
                claim_amount: amount,
                bet_epoch,
            });
        }

        validate_epoch_data(epoch, &bets, &claims)?;

        queries::persist_epoch(&pool, &round, &bets, &claims).await?;
        let cleared = queries::delete_realbets(&pool, epoch).await?;
        if cleared > 0 {
            info!("cleared {cleared} in-flight rows for finalized epoch {epoch}");
        }
        self.failed_attempts().remove(&epoch);

        Ok(Reconstruction::Stored {
            bets: bets.len(),
            claims: claims.len(),
        })
    }

    /// Below the failure limit, partial rows are deleted so a later pass
    /// retries from scratch. At the limit, the epoch is written to the
    /// persisted failure table and its session counter dropped.
    async fn handle_epoch_failure(&self, epoch: u64, reason: &str) -> Result<()> {
        let attempts = {
            let mut entry = self.failed_attempts().entry(epoch).or_insert(0);
            *entry += 1;
            *entry
        };

        let pool = self.manager().db_pool().await?;
        if attempts >= MAX_EPOCH_FAILURES {
            queries::record_failed_epoch(&pool, epoch, reason).await?;
            self.failed_attempts().remove(&epoch);
            warn!("epoch {epoch} failed {attempts} times this sweep, recorded in failure table");
        } else {
            queries::delete_round(&pool, epoch).await?;
            info!("deleted partial rows for epoch {epoch}, retry {attempts}/{MAX_EPOCH_FAILURES}");
        }
        Ok(())
    }
}

/// A reconstruction is only trustworthy when the scan range demonstrably
/// covered the whole round: bets on both sides and at least one claim.
/// A one-sided round would also divide by zero in the payout math.
fn validate_epoch_data(epoch: u64, bets: &[BetRecord], claims: &[ClaimRecord]) -> Result<()> {
    let has_up = bets.iter().any(|b| b.bet_direction == BetDirection::Up);
    let has_down = bets.iter().any(|b| b.bet_direction == BetDirection::Down);
    if !has_up || !has_down {
        return Err(AppError::Reconstruction(format!(
            "epoch {epoch} is missing UP or DOWN bets"
        )));
    }
    if claims.is_empty() {
        return Err(AppError::Reconstruction(format!(
            "epoch {epoch} has no claim events"
        )));
    }
    Ok(())
}

fn build_round_record(raw: &RawRound) -> RoundRecord {
    let result = if raw.close_price > raw.lock_price {
        BetDirection::Up
    } else {
        BetDirection::Down
    };
    let (up_payout, down_payout) =
        payout_multipliers(raw.total_amount, raw.bull_amount, raw.bear_amount);

    RoundRecord {
        epoch: raw.epoch,
        start_ts: timefmt::format_unix_timestamp(raw.start_timestamp),
        lock_ts: timefmt::format_unix_timestamp(raw.lock_timestamp),
        close_ts: timefmt::format_unix_timestamp(raw.close_timestamp),
        start_ts_unix: raw.start_timestamp,
        lock_price: raw.lock_price,
        close_price: raw.close_price,
        result,
        total_amount: raw.total_amount,
        up_amount: raw.bull_amount,
        down_amount: raw.bear_amount,
        up_payout,
        down_payout,
    }
}

/// Payout multiplier per side: the pot after the treasury fee divided by
/// that side's stake, rounded to 4 decimal places. An empty side pays 0.
fn payout_multipliers(total: f64, up: f64, down: f64) -> (f64, f64) {
    let after_fee = total * (1.0 - TREASURY_FEE_RATE);
    let up_payout = if up > 0.0 { round4(after_fee / up) } else { 0.0 };
    let down_payout = if down > 0.0 { round4(after_fee / down) } else { 0.0 };
    (up_payout, down_payout)
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_pool() -> SqlitePool {
        // One connection: each pooled :memory: connection is its own db.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    /// Stub that fails the test if any chain read slips past the gate.
    struct NoChain;

    impl RoundReader for NoChain {
        fn round(&self, epoch: u64) -> impl std::future::Future<Output = Result<RawRound>> + Send {
            async move { panic!("chain read for quarantined epoch {epoch}") }
        }
    }

    struct FixedRound(RawRound);

    impl RoundReader for FixedRound {
        fn round(&self, _epoch: u64) -> impl std::future::Future<Output = Result<RawRound>> + Send {
            let raw = self.0.clone();
            async move { Ok(raw) }
        }
    }

    fn sample_raw(epoch: u64) -> RawRound {
        RawRound {
            epoch,
            start_timestamp: 1_700_000_000,
            lock_timestamp: 1_700_000_300,
            close_timestamp: 1_700_000_600,
            lock_price: 100.0,
            close_price: 105.0,
            total_amount: 4.0,
            bull_amount: 3.0,
            bear_amount: 1.0,
        }
    }

    #[tokio::test]
    async fn quarantined_epoch_is_skipped_without_chain_reads() {
        let pool = test_pool().await;
        for _ in 0..MAX_EPOCH_FAILURES {
            queries::record_failed_epoch(&pool, 7, "node timeout")
                .await
                .unwrap();
        }

        let fetched = fetch_unless_quarantined(&pool, &NoChain, 7).await.unwrap();
        assert!(fetched.is_none());
    }

    #[tokio::test]
    async fn epoch_below_the_failure_limit_is_still_fetched() {
        let pool = test_pool().await;
        for _ in 0..MAX_EPOCH_FAILURES - 1 {
            queries::record_failed_epoch(&pool, 8, "node timeout")
                .await
                .unwrap();
        }

        let fetched = fetch_unless_quarantined(&pool, &FixedRound(sample_raw(8)), 8)
            .await
            .unwrap();
        assert_eq!(fetched.unwrap().epoch, 8);
    }

    fn bet(direction: BetDirection) -> BetRecord {
        BetRecord {
            epoch: 1,
            bet_ts: String::new(),
            wallet_address: "0xaaa".to_string(),
            bet_direction: direction,
            amount: 1.0,
            result: BetOutcome::Win,
            tx_hash: "0x1".to_string(),
        }
    }

    fn claim() -> ClaimRecord {
        ClaimRecord {
            epoch: 1,
            claim_ts: String::new(),
            wallet_address: "0xaaa".to_string(),
            claim_amount: 1.0,
            bet_epoch: 1,
        }
    }

    #[test]
    fn payouts_round_to_four_decimals() {
        // 4 BNB pot, 3% fee: 3.88 after fee. 3 up / 1 down.
        let (up, down) = payout_multipliers(4.0, 3.0, 1.0);
        assert_eq!(up, 1.2933);
        assert_eq!(down, 3.88);
    }

    #[test]
    fn empty_side_pays_zero() {
        let (up, down) = payout_multipliers(2.0, 2.0, 0.0);
        assert!(up > 0.0);
        assert_eq!(down, 0.0);
    }

    #[test]
    fn validation_requires_both_sides_and_a_claim() {
        let both = vec![bet(BetDirection::Up), bet(BetDirection::Down)];
        assert!(validate_epoch_data(1, &both, &[claim()]).is_ok());

        let one_sided = vec![bet(BetDirection::Up), bet(BetDirection::Up)];
        assert!(validate_epoch_data(1, &one_sided, &[claim()]).is_err());
        assert!(validate_epoch_data(1, &[], &[claim()]).is_err());
        assert!(validate_epoch_data(1, &both, &[]).is_err());
    }

    #[test]
    fn round_record_outcome_follows_prices() {
        let raw = RawRound {
            epoch: 100,
            start_timestamp: 1_700_000_000,
            lock_timestamp: 1_700_000_300,
            close_timestamp: 1_700_000_600,
            lock_price: 100.0,
            close_price: 105.0,
            total_amount: 4.0,
            bull_amount: 3.0,
            bear_amount: 1.0,
        };
        let record = build_round_record(&raw);
        assert_eq!(record.result, BetDirection::Up);
        assert_eq!(record.up_payout, 1.2933);
        assert_eq!(record.down_payout, 3.88);

        let down = build_round_record(&RawRound {
            close_price: 99.0,
            ..raw.clone()
        });
        assert_eq!(down.result, BetDirection::Down);

        // A flat round resolves DOWN, matching the contract's strict
        // greater-than comparison.
        let flat = build_round_record(&RawRound {
            close_price: 100.0,
            ..raw
        });
        assert_eq!(flat.result, BetDirection::Down);
    }
}
