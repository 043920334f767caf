use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Bet direction / outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BetDirection {
    Up,
    Down,
}

impl std::fmt::Display for BetDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BetDirection::Up => write!(f, "UP"),
            BetDirection::Down => write!(f, "DOWN"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BetOutcome {
    Win,
    Loss,
}

impl BetOutcome {
    pub fn from_direction(direction: BetDirection, round_result: BetDirection) -> Self {
        if direction == round_result {
            BetOutcome::Win
        } else {
            BetOutcome::Loss
        }
    }
}

impl std::fmt::Display for BetOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BetOutcome::Win => write!(f, "WIN"),
            BetOutcome::Loss => write!(f, "LOSS"),
        }
    }
}

// ---------------------------------------------------------------------------
// Round lifecycle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoundPhase {
    Start,
    Lock,
    End,
}

impl std::fmt::Display for RoundPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RoundPhase::Start => "start",
            RoundPhase::Lock => "lock",
            RoundPhase::End => "end",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Decoded contract events — fanned out from the streaming connection
// ---------------------------------------------------------------------------

/// One decoded contract log, as delivered by the streaming subscription.
#[derive(Debug, Clone)]
pub enum ContractEvent {
    Bet {
        direction: BetDirection,
        /// Lower-cased 0x wallet address.
        sender: String,
        epoch: u64,
        /// Stake in whole BNB.
        amount: f64,
        tx_hash: String,
        block_number: u64,
    },
    RoundPhase {
        phase: RoundPhase,
        epoch: u64,
    },
    Claim {
        sender: String,
        epoch: u64,
        amount: f64,
        tx_hash: String,
        block_number: u64,
    },
}

// ---------------------------------------------------------------------------
// Reconstruction records — the crawler's persistence shapes
// ---------------------------------------------------------------------------

/// A fully reconstructed round, ready for insert-if-absent into `round`.
#[derive(Debug, Clone)]
pub struct RoundRecord {
    pub epoch: u64,
    pub start_ts: String,
    pub lock_ts: String,
    pub close_ts: String,
    pub start_ts_unix: u64,
    pub lock_price: f64,
    pub close_price: f64,
    pub result: BetDirection,
    pub total_amount: f64,
    pub up_amount: f64,
    pub down_amount: f64,
    pub up_payout: f64,
    pub down_payout: f64,
}

#[derive(Debug, Clone)]
pub struct BetRecord {
    pub epoch: u64,
    pub bet_ts: String,
    pub wallet_address: String,
    pub bet_direction: BetDirection,
    pub amount: f64,
    pub result: BetOutcome,
    pub tx_hash: String,
}

#[derive(Debug, Clone)]
pub struct ClaimRecord {
    /// Epoch whose reconstruction pass observed this claim.
    pub epoch: u64,
    pub claim_ts: String,
    pub wallet_address: String,
    pub claim_amount: f64,
    /// Round the claimed bet was originally placed in.
    pub bet_epoch: u64,
}
