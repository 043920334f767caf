//! All SQL lives here. Writes are conflict-tolerant where the schema allows
//! repeated reconstruction: duplicate round epochs and duplicate bet tx
//! hashes are silently ignored, making per-epoch persistence idempotent.

use sqlx::SqlitePool;

use crate::db::models::{FailedEpochRow, HisBetRow, RoundRow};
use crate::error::Result;
use crate::timefmt;
use crate::types::{BetRecord, ClaimRecord, RoundRecord};

pub async fn has_round(pool: &SqlitePool, epoch: u64) -> Result<bool> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM round WHERE epoch = ?")
        .bind(epoch as i64)
        .fetch_one(pool)
        .await?;
    Ok(count > 0)
}

/// Persist a reconstructed epoch in one transaction: the round row, every
/// bet, every claim. Either all rows commit or none do; the transaction
/// rolls back on drop if any statement fails.
pub async fn persist_epoch(
    pool: &SqlitePool,
    round: &RoundRecord,
    bets: &[BetRecord],
    claims: &[ClaimRecord],
) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO round (epoch, start_ts, lock_ts, close_ts, start_ts_unix,
                           lock_price, close_price, result,
                           total_amount, up_amount, down_amount, up_payout, down_payout)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (epoch) DO NOTHING
        "#,
    )
    .bind(round.epoch as i64)
    .bind(&round.start_ts)
    .bind(&round.lock_ts)
    .bind(&round.close_ts)
    .bind(round.start_ts_unix as i64)
    .bind(round.lock_price)
    .bind(round.close_price)
    .bind(round.result.to_string())
    .bind(round.total_amount)
    .bind(round.up_amount)
    .bind(round.down_amount)
    .bind(round.up_payout)
    .bind(round.down_payout)
    .execute(&mut *tx)
    .await?;

    for bet in bets {
        sqlx::query(
            r#"
            INSERT INTO hisbet (epoch, bet_ts, wallet_address, bet_direction, amount, result, tx_hash)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (tx_hash) DO NOTHING
            "#,
        )
        .bind(bet.epoch as i64)
        .bind(&bet.bet_ts)
        .bind(&bet.wallet_address)
        .bind(bet.bet_direction.to_string())
        .bind(bet.amount)
        .bind(bet.result.to_string())
        .bind(&bet.tx_hash)
        .execute(&mut *tx)
        .await?;
    }

    for claim in claims {
        sqlx::query(
            r#"
            INSERT INTO claim (epoch, claim_ts, wallet_address, claim_amount, bet_epoch)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(claim.epoch as i64)
        .bind(&claim.claim_ts)
        .bind(&claim.wallet_address)
        .bind(claim.claim_amount)
        .bind(claim.bet_epoch as i64)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

/// Drop a partially written round row so a later pass reconstructs it fresh.
pub async fn delete_round(pool: &SqlitePool, epoch: u64) -> Result<()> {
    sqlx::query("DELETE FROM round WHERE epoch = ?")
        .bind(epoch as i64)
        .execute(pool)
        .await?;
    Ok(())
}

/// Clear the in-flight working rows once an epoch has been finalized into
/// canonical history.
pub async fn delete_realbets(pool: &SqlitePool, epoch: u64) -> Result<u64> {
    let result = sqlx::query("DELETE FROM realbet WHERE epoch = ?")
        .bind(epoch as i64)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

/// Listener upsert: at most one row per (epoch, wallet), latest bet wins.
pub async fn upsert_realbet(
    pool: &SqlitePool,
    epoch: u64,
    bet_ts: &str,
    wallet_address: &str,
    bet_direction: &str,
    amount: f64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO realbet (epoch, bet_ts, wallet_address, bet_direction, amount)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT (epoch, wallet_address) DO UPDATE SET
            bet_ts = excluded.bet_ts,
            bet_direction = excluded.bet_direction,
            amount = excluded.amount
        "#,
    )
    .bind(epoch as i64)
    .bind(bet_ts)
    .bind(wallet_address)
    .bind(bet_direction)
    .bind(amount)
    .execute(pool)
    .await?;
    Ok(())
}

/// Record (or bump) the quarantine row for an epoch that keeps failing.
pub async fn record_failed_epoch(pool: &SqlitePool, epoch: u64, error: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO failed_epoch (epoch, error_message, failure_count, last_attempt_ts)
        VALUES (?, ?, 1, ?)
        ON CONFLICT (epoch) DO UPDATE SET
            error_message = excluded.error_message,
            failure_count = failed_epoch.failure_count + 1,
            last_attempt_ts = excluded.last_attempt_ts
        "#,
    )
    .bind(epoch as i64)
    .bind(error)
    .bind(timefmt::now_formatted())
    .execute(pool)
    .await?;
    Ok(())
}

/// Persisted failure count for an epoch (0 when never recorded).
pub async fn failure_count(pool: &SqlitePool, epoch: u64) -> Result<i64> {
    let count: Option<i64> =
        sqlx::query_scalar("SELECT failure_count FROM failed_epoch WHERE epoch = ?")
            .bind(epoch as i64)
            .fetch_optional(pool)
            .await?;
    Ok(count.unwrap_or(0))
}

// ---------------------------------------------------------------------------
// Read surface
// ---------------------------------------------------------------------------

pub async fn recent_rounds(pool: &SqlitePool, limit: i64) -> Result<Vec<RoundRow>> {
    let rows = sqlx::query_as::<_, RoundRow>(
        r#"
        SELECT epoch, start_ts, lock_ts, close_ts, lock_price, close_price, result,
               total_amount, up_amount, down_amount, up_payout, down_payout
        FROM round
        ORDER BY epoch DESC
        LIMIT ?
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn bets_for_epoch(pool: &SqlitePool, epoch: u64) -> Result<Vec<HisBetRow>> {
    let rows = sqlx::query_as::<_, HisBetRow>(
        r#"
        SELECT epoch, bet_ts, wallet_address, bet_direction, amount, result, tx_hash
        FROM hisbet
        WHERE epoch = ?
        ORDER BY bet_ts ASC
        "#,
    )
    .bind(epoch as i64)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn quarantined_epochs(pool: &SqlitePool, limit: i64) -> Result<Vec<FailedEpochRow>> {
    let rows = sqlx::query_as::<_, FailedEpochRow>(
        r#"
        SELECT epoch, error_message, failure_count, last_attempt_ts
        FROM failed_epoch
        ORDER BY epoch DESC
        LIMIT ?
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BetDirection, BetOutcome};

    async fn test_pool() -> SqlitePool {
        // One connection: each pooled :memory: connection is its own db.
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    fn sample_round(epoch: u64) -> RoundRecord {
        RoundRecord {
            epoch,
            start_ts: "2024-01-01 00:00:00".to_string(),
            lock_ts: "2024-01-01 00:05:00".to_string(),
            close_ts: "2024-01-01 00:10:00".to_string(),
            start_ts_unix: 1_704_038_400,
            lock_price: 100.0,
            close_price: 105.0,
            result: BetDirection::Up,
            total_amount: 4.0,
            up_amount: 3.0,
            down_amount: 1.0,
            up_payout: 1.2933,
            down_payout: 3.88,
        }
    }

    fn sample_bet(epoch: u64, wallet: &str, direction: BetDirection, tx: &str) -> BetRecord {
        BetRecord {
            epoch,
            bet_ts: "2024-01-01 00:01:00".to_string(),
            wallet_address: wallet.to_string(),
            bet_direction: direction,
            amount: 1.0,
            result: BetOutcome::from_direction(direction, BetDirection::Up),
            tx_hash: tx.to_string(),
        }
    }

    fn sample_claim(epoch: u64) -> ClaimRecord {
        ClaimRecord {
            epoch,
            claim_ts: "2024-01-01 00:12:00".to_string(),
            wallet_address: "0xaaa".to_string(),
            claim_amount: 1.2933,
            bet_epoch: epoch,
        }
    }

    #[tokio::test]
    async fn persist_epoch_is_idempotent() {
        let pool = test_pool().await;
        let round = sample_round(100);
        let bets = vec![
            sample_bet(100, "0xaaa", BetDirection::Up, "0xt1"),
            sample_bet(100, "0xbbb", BetDirection::Down, "0xt2"),
        ];
        let claims = vec![sample_claim(100)];

        persist_epoch(&pool, &round, &bets, &claims).await.unwrap();
        persist_epoch(&pool, &round, &bets, &claims).await.unwrap();

        let rounds: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM round WHERE epoch = 100")
            .fetch_one(&pool)
            .await
            .unwrap();
        let hisbets: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM hisbet WHERE epoch = 100")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(rounds, 1);
        assert_eq!(hisbets, 2);
    }

    #[tokio::test]
    async fn end_to_end_round_outcome_and_results() {
        let pool = test_pool().await;
        // Epoch 100: lock 100.00, close 105.00 -> UP; 2 UP bets + 1 DOWN bet,
        // total 4.0 BNB at 3% fee -> up_payout 1.2933, down_payout 3.8800.
        let round = sample_round(100);
        let bets = vec![
            sample_bet(100, "0xaaa", BetDirection::Up, "0xt1"),
            sample_bet(100, "0xbbb", BetDirection::Up, "0xt2"),
            sample_bet(100, "0xccc", BetDirection::Down, "0xt3"),
        ];
        persist_epoch(&pool, &round, &bets, &[sample_claim(100)]).await.unwrap();

        let stored = recent_rounds(&pool, 10).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].result, "UP");
        assert!((stored[0].up_payout - 1.2933).abs() < 1e-9);
        assert!((stored[0].down_payout - 3.88).abs() < 1e-9);

        let stored_bets = bets_for_epoch(&pool, 100).await.unwrap();
        assert_eq!(stored_bets.len(), 3);
        let wins = stored_bets.iter().filter(|b| b.result == "WIN").count();
        let losses = stored_bets.iter().filter(|b| b.result == "LOSS").count();
        assert_eq!(wins, 2);
        assert_eq!(losses, 1);
    }

    #[tokio::test]
    async fn failed_epoch_counts_up_to_quarantine() {
        let pool = test_pool().await;
        for _ in 0..3 {
            record_failed_epoch(&pool, 55, "missing claim data").await.unwrap();
        }
        assert_eq!(failure_count(&pool, 55).await.unwrap(), 3);
        assert_eq!(failure_count(&pool, 56).await.unwrap(), 0);

        let rows = quarantined_epochs(&pool, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].failure_count, 3);
        assert_eq!(rows[0].error_message.as_deref(), Some("missing claim data"));
    }

    #[tokio::test]
    async fn realbet_upsert_keeps_one_row_per_wallet() {
        let pool = test_pool().await;
        upsert_realbet(&pool, 101, "2024-01-01 00:01:00", "0xaaa", "UP", 1.0)
            .await
            .unwrap();
        upsert_realbet(&pool, 101, "2024-01-01 00:02:00", "0xaaa", "DOWN", 2.5)
            .await
            .unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM realbet WHERE epoch = 101")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
        let (direction, amount): (String, f64) = sqlx::query_as(
            "SELECT bet_direction, amount FROM realbet WHERE epoch = 101 AND wallet_address = '0xaaa'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(direction, "DOWN");
        assert!((amount - 2.5).abs() < 1e-12);

        let removed = delete_realbets(&pool, 101).await.unwrap();
        assert_eq!(removed, 1);
    }
}
