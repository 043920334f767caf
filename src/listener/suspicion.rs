//! In-memory suspicious-wallet heuristic. Advisory only: the report rides
//! along on the broadcast payload and never gates processing.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use serde::Serialize;

/// More than this many bets from one wallet inside the window is flagged.
const MAX_BETS_IN_WINDOW: usize = 10;
const WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SuspicionReport {
    pub is_suspicious: bool,
    pub flags: Vec<String>,
}

pub struct SuspicionMonitor {
    lifetime_counts: HashMap<String, u64>,
    recent_bets: HashMap<String, VecDeque<Instant>>,
}

impl SuspicionMonitor {
    pub fn new() -> Self {
        Self {
            lifetime_counts: HashMap::new(),
            recent_bets: HashMap::new(),
        }
    }

    /// Record one bet from `wallet` and evaluate it against the sliding
    /// 60-second window.
    pub fn check(&mut self, wallet: &str) -> SuspicionReport {
        let now = Instant::now();
        let mut flags = Vec::new();

        *self.lifetime_counts.entry(wallet.to_string()).or_insert(0) += 1;

        let recent = self.recent_bets.entry(wallet.to_string()).or_default();
        while let Some(oldest) = recent.front() {
            if now.duration_since(*oldest) >= WINDOW {
                recent.pop_front();
            } else {
                break;
            }
        }
        recent.push_back(now);

        if recent.len() > MAX_BETS_IN_WINDOW {
            flags.push(format!(
                "High frequency betting: {} bets in the last minute.",
                recent.len()
            ));
        }

        SuspicionReport {
            is_suspicious: !flags.is_empty(),
            flags,
        }
    }

    pub fn tracked_wallets(&self) -> usize {
        self.lifetime_counts.len()
    }
}

impl Default for SuspicionMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn under_the_limit_is_clean() {
        let mut monitor = SuspicionMonitor::new();
        for _ in 0..MAX_BETS_IN_WINDOW {
            let report = monitor.check("0xaaa");
            assert!(!report.is_suspicious);
            assert!(report.flags.is_empty());
        }
        assert_eq!(monitor.tracked_wallets(), 1);
    }

    #[test]
    fn eleventh_bet_in_a_minute_is_flagged() {
        let mut monitor = SuspicionMonitor::new();
        for _ in 0..MAX_BETS_IN_WINDOW {
            monitor.check("0xbbb");
        }
        let report = monitor.check("0xbbb");
        assert!(report.is_suspicious);
        assert_eq!(report.flags.len(), 1);
        assert!(report.flags[0].starts_with("High frequency betting: 11"));
    }

    #[test]
    fn wallets_are_tracked_independently() {
        let mut monitor = SuspicionMonitor::new();
        for _ in 0..=MAX_BETS_IN_WINDOW {
            monitor.check("0xfast");
        }
        let clean = monitor.check("0xslow");
        assert!(!clean.is_suspicious);
        assert_eq!(monitor.tracked_wallets(), 2);
    }
}
