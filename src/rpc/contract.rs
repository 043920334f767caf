use std::sync::Arc;

use crate::config::PRICE_DECIMALS;
use crate::error::{AppError, Result};
use crate::rpc::client::RpcClient;
use crate::rpc::codec::{
    data_word, encode_word_u64, word_bnb, word_u64, word_units, SEL_CURRENT_EPOCH, SEL_ROUNDS,
};

/// On-chain round state as returned by the contract's `rounds(uint256)` view.
/// Prices are already scaled to floats; amounts are whole BNB.
#[derive(Debug, Clone)]
pub struct RawRound {
    pub epoch: u64,
    pub start_timestamp: u64,
    pub lock_timestamp: u64,
    /// Zero until the round has actually closed on-chain.
    pub close_timestamp: u64,
    pub lock_price: f64,
    pub close_price: f64,
    pub total_amount: f64,
    pub bull_amount: f64,
    pub bear_amount: f64,
}

impl RawRound {
    pub fn is_finished(&self) -> bool {
        self.close_timestamp != 0
    }
}

/// Read-only binding of the prediction contract over the request/response
/// RPC connection.
pub struct PredictionContract {
    rpc: Arc<RpcClient>,
    address: String,
}

impl PredictionContract {
    pub fn new(rpc: Arc<RpcClient>, address: String) -> Self {
        Self { rpc, address }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub async fn current_epoch(&self) -> Result<u64> {
        let data = self.rpc.call(&self.address, SEL_CURRENT_EPOCH.to_string()).await?;
        word_u64(data_word(&data, 0)?)
    }

    pub async fn round(&self, epoch: u64) -> Result<RawRound> {
        let calldata = format!("{SEL_ROUNDS}{}", encode_word_u64(epoch));
        let data = self.rpc.call(&self.address, calldata).await?;
        decode_round(&data)
    }
}

/// Decode the 14-word `rounds(uint256)` return tuple. Word order follows the
/// contract's Round struct; the oracle ids, reward fields and oracleCalled
/// flag are not used by reconstruction.
pub fn decode_round(data: &str) -> Result<RawRound> {
    let digits = data.trim_start_matches("0x");
    if digits.len() < 14 * 64 {
        return Err(AppError::Decode(format!(
            "rounds() return too short: {} hex chars",
            digits.len()
        )));
    }
    Ok(RawRound {
        epoch: word_u64(data_word(data, 0)?)?,
        start_timestamp: word_u64(data_word(data, 1)?)?,
        lock_timestamp: word_u64(data_word(data, 2)?)?,
        close_timestamp: word_u64(data_word(data, 3)?)?,
        lock_price: word_units(data_word(data, 4)?, PRICE_DECIMALS)?,
        close_price: word_units(data_word(data, 5)?, PRICE_DECIMALS)?,
        total_amount: word_bnb(data_word(data, 8)?)?,
        bull_amount: word_bnb(data_word(data, 9)?)?,
        bear_amount: word_bnb(data_word(data, 10)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_return(
        epoch: u64,
        start: u64,
        lock: u64,
        close: u64,
        lock_price_e8: u64,
        close_price_e8: u64,
        total_wei: u128,
        bull_wei: u128,
        bear_wei: u128,
    ) -> String {
        let words = [
            format!("{epoch:064x}"),
            format!("{start:064x}"),
            format!("{lock:064x}"),
            format!("{close:064x}"),
            format!("{lock_price_e8:064x}"),
            format!("{close_price_e8:064x}"),
            format!("{:064x}", 1u64), // lockOracleId
            format!("{:064x}", 2u64), // closeOracleId
            format!("{total_wei:064x}"),
            format!("{bull_wei:064x}"),
            format!("{bear_wei:064x}"),
            format!("{:064x}", 0u64), // rewardBaseCalAmount
            format!("{:064x}", 0u64), // rewardAmount
            format!("{:064x}", 1u64), // oracleCalled
        ];
        format!("0x{}", words.join(""))
    }

    #[test]
    fn decodes_finished_round() {
        let data = round_return(
            100,
            1_700_000_000,
            1_700_000_300,
            1_700_000_600,
            10_000_000_000,       // 100.0 at 8 decimals
            10_500_000_000,       // 105.0
            4_000_000_000_000_000_000, // 4 BNB
            3_000_000_000_000_000_000,
            1_000_000_000_000_000_000,
        );
        let round = decode_round(&data).unwrap();
        assert_eq!(round.epoch, 100);
        assert_eq!(round.start_timestamp, 1_700_000_000);
        assert!(round.is_finished());
        assert!((round.lock_price - 100.0).abs() < 1e-9);
        assert!((round.close_price - 105.0).abs() < 1e-9);
        assert!((round.total_amount - 4.0).abs() < 1e-12);
        assert!((round.bull_amount - 3.0).abs() < 1e-12);
        assert!((round.bear_amount - 1.0).abs() < 1e-12);
    }

    #[test]
    fn unfinished_round_has_zero_close() {
        let data = round_return(101, 1_700_000_300, 1_700_000_600, 0, 0, 0, 0, 0, 0);
        let round = decode_round(&data).unwrap();
        assert!(!round.is_finished());
    }

    #[test]
    fn short_return_is_an_error() {
        assert!(decode_round("0x1234").is_err());
    }
}
