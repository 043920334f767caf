//! Hand-rolled codec for the prediction contract's logs and call data.
//! Everything on the wire is 32-byte big-endian words as 0x-prefixed hex.

use serde::Deserialize;

use crate::error::{AppError, Result};
use crate::types::{BetDirection, ContractEvent, RoundPhase};

// ---------------------------------------------------------------------------
// Event topics and function selectors
// ---------------------------------------------------------------------------

/// keccak256("BetBull(address,uint256,uint256)")
pub const TOPIC_BET_BULL: &str =
    "0x438122d8cff518d18388099a5181f0d17a12b4f1b55faedf6e4a6acee0060c12";
/// keccak256("BetBear(address,uint256,uint256)")
pub const TOPIC_BET_BEAR: &str =
    "0x0d8c1fe3e67ab767116a81f122b83c2557a8c2564019cb7c4f83de1aeb1f1f0d";
/// keccak256("Claim(address,uint256,uint256)")
pub const TOPIC_CLAIM: &str =
    "0x34fcbac0073d7c3d388e51312faf357774904998eeb8fca628b9e6f65ee1cbf7";
/// keccak256("StartRound(uint256)")
pub const TOPIC_START_ROUND: &str =
    "0x939f42374aa9bf1d8d8cd56d8a9110cb040cd8dfeae44080c6fcf2645e51b452";
/// keccak256("LockRound(uint256,uint256,int256)")
pub const TOPIC_LOCK_ROUND: &str =
    "0x482e76a65b448a42deef26e99e58fb20c85e26f075defff8df6aa80459b39006";
/// keccak256("EndRound(uint256,uint256,int256)")
pub const TOPIC_END_ROUND: &str =
    "0xb6ff1fe915db84788cbbbc017f0d2bef9485fad9fd0bd8ce9340fde0d8410dd8";

/// keccak256("currentEpoch()")[..4]
pub const SEL_CURRENT_EPOCH: &str = "0x76671808";
/// keccak256("rounds(uint256)")[..4]
pub const SEL_ROUNDS: &str = "0x8c65c81f";

/// All five topics the streaming subscription filters on.
pub const SUBSCRIBED_TOPICS: [&str; 5] = [
    TOPIC_BET_BULL,
    TOPIC_BET_BEAR,
    TOPIC_START_ROUND,
    TOPIC_LOCK_ROUND,
    TOPIC_END_ROUND,
];

const WEI_PER_BNB: f64 = 1e18;

// ---------------------------------------------------------------------------
// Raw log shape — shared by eth_getLogs and eth_subscribe notifications
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    pub block_number: String,
    pub transaction_hash: String,
}

impl LogEntry {
    pub fn block_number_u64(&self) -> Result<u64> {
        parse_hex_u64(&self.block_number)
    }
}

// ---------------------------------------------------------------------------
// Word-level helpers
// ---------------------------------------------------------------------------

/// Parse a 0x-prefixed hex quantity (arbitrary width up to 64 bits).
pub fn parse_hex_u64(raw: &str) -> Result<u64> {
    let digits = raw.trim_start_matches("0x");
    u64::from_str_radix(digits, 16)
        .map_err(|_| AppError::Decode(format!("bad hex quantity: {raw}")))
}

/// The `i`-th 32-byte word of 0x-prefixed call-return or log data.
pub fn data_word(data: &str, i: usize) -> Result<&str> {
    let digits = data.trim_start_matches("0x");
    let start = i * 64;
    digits
        .get(start..start + 64)
        .ok_or_else(|| AppError::Decode(format!("data too short for word {i}")))
}

/// Word → u64 (reverts when the value needs more than 64 bits).
pub fn word_u64(word: &str) -> Result<u64> {
    let bytes = word_bytes(word)?;
    if bytes[..24].iter().any(|&b| b != 0) {
        return Err(AppError::Decode(format!("word overflows u64: {word}")));
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[24..]);
    Ok(u64::from_be_bytes(buf))
}

/// Word → u128. Large enough for any realistic wei amount.
pub fn word_u128(word: &str) -> Result<u128> {
    let bytes = word_bytes(word)?;
    if bytes[..16].iter().any(|&b| b != 0) {
        return Err(AppError::Decode(format!("word overflows u128: {word}")));
    }
    let mut buf = [0u8; 16];
    buf.copy_from_slice(&bytes[16..]);
    Ok(u128::from_be_bytes(buf))
}

/// Word holding an address-padded value → lower-cased 0x address.
pub fn word_address(word: &str) -> Result<String> {
    let digits = word.trim_start_matches("0x");
    if digits.len() != 64 {
        return Err(AppError::Decode(format!("bad address word: {word}")));
    }
    Ok(format!("0x{}", digits[24..].to_lowercase()))
}

/// Word holding a wei amount → whole BNB.
pub fn word_bnb(word: &str) -> Result<f64> {
    Ok(word_u128(word)? as f64 / WEI_PER_BNB)
}

/// Word holding a fixed-point value → f64 scaled by `decimals`.
pub fn word_units(word: &str, decimals: u32) -> Result<f64> {
    Ok(word_u128(word)? as f64 / 10f64.powi(decimals as i32))
}

/// u64 → minimal 0x-prefixed hex quantity (JSON-RPC block tags).
pub fn encode_hex_u64(value: u64) -> String {
    format!("0x{value:x}")
}

/// u64 → zero-padded 32-byte call argument.
pub fn encode_word_u64(value: u64) -> String {
    format!("{value:064x}")
}

fn word_bytes(word: &str) -> Result<[u8; 32]> {
    let digits = word.trim_start_matches("0x");
    let raw = hex::decode(digits).map_err(|_| AppError::Decode(format!("bad hex word: {word}")))?;
    raw.try_into()
        .map_err(|_| AppError::Decode("hex word is not 32 bytes".to_string()))
}

// ---------------------------------------------------------------------------
// Log decoding
// ---------------------------------------------------------------------------

/// Decode a raw contract log into a [`ContractEvent`].
///
/// Bet/Claim logs carry `sender` and `epoch` as indexed topics and the wei
/// amount as the single data word. Round-phase logs carry the epoch as the
/// first indexed topic; lock/end also carry a price, which the live path does
/// not use.
pub fn decode_log(log: &LogEntry) -> Result<ContractEvent> {
    let topic0 = log
        .topics
        .first()
        .ok_or_else(|| AppError::Decode("log has no topics".to_string()))?;

    let bet = |direction: BetDirection| -> Result<ContractEvent> {
        Ok(ContractEvent::Bet {
            direction,
            sender: word_address(topic_at(log, 1)?)?,
            epoch: word_u64(topic_at(log, 2)?)?,
            amount: word_bnb(data_word(&log.data, 0)?)?,
            tx_hash: log.transaction_hash.clone(),
            block_number: log.block_number_u64()?,
        })
    };

    match topic0.as_str() {
        t if t.eq_ignore_ascii_case(TOPIC_BET_BULL) => bet(BetDirection::Up),
        t if t.eq_ignore_ascii_case(TOPIC_BET_BEAR) => bet(BetDirection::Down),
        t if t.eq_ignore_ascii_case(TOPIC_CLAIM) => Ok(ContractEvent::Claim {
            sender: word_address(topic_at(log, 1)?)?,
            epoch: word_u64(topic_at(log, 2)?)?,
            amount: word_bnb(data_word(&log.data, 0)?)?,
            tx_hash: log.transaction_hash.clone(),
            block_number: log.block_number_u64()?,
        }),
        t if t.eq_ignore_ascii_case(TOPIC_START_ROUND) => Ok(ContractEvent::RoundPhase {
            phase: RoundPhase::Start,
            epoch: word_u64(topic_at(log, 1)?)?,
        }),
        t if t.eq_ignore_ascii_case(TOPIC_LOCK_ROUND) => Ok(ContractEvent::RoundPhase {
            phase: RoundPhase::Lock,
            epoch: word_u64(topic_at(log, 1)?)?,
        }),
        t if t.eq_ignore_ascii_case(TOPIC_END_ROUND) => Ok(ContractEvent::RoundPhase {
            phase: RoundPhase::End,
            epoch: word_u64(topic_at(log, 1)?)?,
        }),
        other => Err(AppError::Decode(format!("unknown event topic: {other}"))),
    }
}

fn topic_at<'a>(log: &'a LogEntry, i: usize) -> Result<&'a str> {
    log.topics
        .get(i)
        .map(String::as_str)
        .ok_or_else(|| AppError::Decode(format!("log missing topic {i}")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use sha3::{Digest, Keccak256};

    fn keccak_topic(signature: &str) -> String {
        let mut hasher = Keccak256::new();
        hasher.update(signature.as_bytes());
        format!("0x{}", hex::encode(hasher.finalize()))
    }

    #[test]
    fn topic_constants_match_signatures() {
        assert_eq!(TOPIC_BET_BULL, keccak_topic("BetBull(address,uint256,uint256)"));
        assert_eq!(TOPIC_BET_BEAR, keccak_topic("BetBear(address,uint256,uint256)"));
        assert_eq!(TOPIC_CLAIM, keccak_topic("Claim(address,uint256,uint256)"));
        assert_eq!(TOPIC_START_ROUND, keccak_topic("StartRound(uint256)"));
        assert_eq!(TOPIC_LOCK_ROUND, keccak_topic("LockRound(uint256,uint256,int256)"));
        assert_eq!(TOPIC_END_ROUND, keccak_topic("EndRound(uint256,uint256,int256)"));
    }

    #[test]
    fn selector_constants_match_signatures() {
        assert_eq!(SEL_CURRENT_EPOCH, &keccak_topic("currentEpoch()")[..10]);
        assert_eq!(SEL_ROUNDS, &keccak_topic("rounds(uint256)")[..10]);
    }

    fn bull_log() -> LogEntry {
        LogEntry {
            address: "0x18b2a687610328590bc8f2e5fedde3b582a49cda".to_string(),
            topics: vec![
                TOPIC_BET_BULL.to_string(),
                // sender, padded to 32 bytes
                "0x000000000000000000000000AbCdEF0123456789abcdef0123456789ABCDEF01"
                    .to_string(),
                // epoch 100
                "0x0000000000000000000000000000000000000000000000000000000000000064"
                    .to_string(),
            ],
            // 1.5 BNB in wei
            data: "0x00000000000000000000000000000000000000000000000014d1120d7b160000"
                .to_string(),
            block_number: "0xf4240".to_string(),
            transaction_hash: "0xdeadbeef".to_string(),
        }
    }

    #[test]
    fn decodes_bull_bet_log() {
        let event = decode_log(&bull_log()).unwrap();
        match event {
            ContractEvent::Bet { direction, sender, epoch, amount, tx_hash, block_number } => {
                assert_eq!(direction, BetDirection::Up);
                assert_eq!(sender, "0xabcdef0123456789abcdef0123456789abcdef01");
                assert_eq!(epoch, 100);
                assert!((amount - 1.5).abs() < 1e-12, "amount={amount}");
                assert_eq!(tx_hash, "0xdeadbeef");
                assert_eq!(block_number, 1_000_000);
            }
            other => panic!("expected Bet, got {other:?}"),
        }
    }

    #[test]
    fn decodes_round_phase_log() {
        let log = LogEntry {
            address: "0x18b2a687610328590bc8f2e5fedde3b582a49cda".to_string(),
            topics: vec![
                TOPIC_LOCK_ROUND.to_string(),
                "0x0000000000000000000000000000000000000000000000000000000000000065"
                    .to_string(),
            ],
            data: "0x".to_string(),
            block_number: "0x1".to_string(),
            transaction_hash: "0x0".to_string(),
        };
        match decode_log(&log).unwrap() {
            ContractEvent::RoundPhase { phase, epoch } => {
                assert_eq!(phase, RoundPhase::Lock);
                assert_eq!(epoch, 101);
            }
            other => panic!("expected RoundPhase, got {other:?}"),
        }
    }

    #[test]
    fn unknown_topic_is_an_error() {
        let mut log = bull_log();
        log.topics[0] = keccak_topic("Transfer(address,address,uint256)");
        assert!(decode_log(&log).is_err());
    }

    #[test]
    fn word_helpers_round_trip() {
        assert_eq!(word_u64(&encode_word_u64(123_456)).unwrap(), 123_456);
        assert_eq!(parse_hex_u64(&encode_hex_u64(98_765)).unwrap(), 98_765);
        // 100.0 at 8 decimals
        let word = format!("{:064x}", 10_000_000_000u64);
        assert!((word_units(&word, 8).unwrap() - 100.0).abs() < 1e-9);
    }
}
