//! Database row types. Used by sqlx for typed reads on the query surface.

use serde::Serialize;

#[derive(Debug, sqlx::FromRow, Serialize)]
pub struct RoundRow {
    pub epoch: i64,
    pub start_ts: String,
    pub lock_ts: String,
    pub close_ts: String,
    pub lock_price: f64,
    pub close_price: f64,
    pub result: String,
    pub total_amount: f64,
    pub up_amount: f64,
    pub down_amount: f64,
    pub up_payout: f64,
    pub down_payout: f64,
}

#[derive(Debug, sqlx::FromRow, Serialize)]
pub struct HisBetRow {
    pub epoch: i64,
    pub bet_ts: String,
    pub wallet_address: String,
    pub bet_direction: String,
    pub amount: f64,
    pub result: String,
    pub tx_hash: String,
}

#[derive(Debug, sqlx::FromRow, Serialize)]
pub struct FailedEpochRow {
    pub epoch: i64,
    pub error_message: Option<String>,
    pub failure_count: i64,
    pub last_attempt_ts: String,
}
