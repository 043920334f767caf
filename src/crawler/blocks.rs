//! Block-by-timestamp resolution.
//!
//! Rounds are defined in wall-clock time while log queries are defined in
//! block numbers, so every reconstruction starts by mapping the round's
//! start time (and the next round's start time) onto block heights.

use std::collections::HashMap;

use crate::error::{AppError, Result};
use crate::rpc::{with_retry, RpcClient};

/// Minimal chain-time view the search needs. Abstracted so the search can
/// be driven by synthetic chains in tests.
pub trait BlockClock {
    fn head(&self) -> impl std::future::Future<Output = Result<u64>> + Send;
    fn timestamp(&self, number: u64) -> impl std::future::Future<Output = Result<u64>> + Send;
}

impl BlockClock for RpcClient {
    async fn head(&self) -> Result<u64> {
        with_retry("get_block_number", || self.get_block_number()).await
    }

    async fn timestamp(&self, number: u64) -> Result<u64> {
        with_retry("get_block_timestamp", || async move {
            self.get_block_timestamp(number)
                .await?
                .ok_or_else(|| AppError::Rpc(format!("block {number} has no timestamp")))
        })
        .await
    }
}

/// Binary search over `[1, head]` for the block whose timestamp is closest
/// to `target`. Block timestamps are monotonic but not unique per second,
/// so a miss resolves to the nearest visited block rather than an error.
pub async fn find_block_by_timestamp<C: BlockClock>(clock: &C, target: u64) -> Result<u64> {
    let head = clock.head().await?;
    if head == 0 {
        return Err(AppError::Rpc("chain reports empty height".to_string()));
    }

    let mut low = 1u64;
    let mut high = head;
    let mut best_block = head;
    let mut best_diff = u64::MAX;

    while low <= high {
        let mid = low + (high - low) / 2;
        let ts = clock.timestamp(mid).await?;
        let diff = ts.abs_diff(target);
        if diff < best_diff {
            best_diff = diff;
            best_block = mid;
        }
        if ts == target {
            return Ok(mid);
        }
        if ts < target {
            low = mid + 1;
        } else {
            high = mid - 1;
        }
    }

    Ok(best_block)
}

/// Per-reconstruction cache for tagging events with their block time. Each
/// epoch touches the same few blocks over and over; one fetch per block.
pub struct TimestampCache {
    cached: HashMap<u64, u64>,
}

impl TimestampCache {
    pub fn new() -> Self {
        Self {
            cached: HashMap::new(),
        }
    }

    pub async fn get<C: BlockClock>(&mut self, clock: &C, number: u64) -> Result<u64> {
        if let Some(ts) = self.cached.get(&number) {
            return Ok(*ts);
        }
        let ts = clock.timestamp(number).await?;
        self.cached.insert(number, ts);
        Ok(ts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Synthetic chain: block n (1-based) has timestamp `timestamps[n-1]`.
    struct FixedChain {
        timestamps: Vec<u64>,
    }

    impl BlockClock for FixedChain {
        async fn head(&self) -> Result<u64> {
            Ok(self.timestamps.len() as u64)
        }

        async fn timestamp(&self, number: u64) -> Result<u64> {
            self.timestamps
                .get(number as usize - 1)
                .copied()
                .ok_or_else(|| AppError::Rpc(format!("no block {number}")))
        }
    }

    fn chain() -> FixedChain {
        // Strictly increasing, irregular 3s spacing.
        FixedChain {
            timestamps: vec![100, 103, 106, 109, 112, 115, 118, 121],
        }
    }

    #[tokio::test]
    async fn exact_timestamp_returns_its_block() {
        let c = chain();
        assert_eq!(find_block_by_timestamp(&c, 109).await.unwrap(), 4);
        assert_eq!(find_block_by_timestamp(&c, 100).await.unwrap(), 1);
        assert_eq!(find_block_by_timestamp(&c, 121).await.unwrap(), 8);
    }

    #[tokio::test]
    async fn misses_resolve_to_closest_block() {
        let c = chain();
        // 110 sits between blocks 4 (109) and 5 (112); 109 is closer.
        assert_eq!(find_block_by_timestamp(&c, 110).await.unwrap(), 4);
        // 111 is closer to 112.
        assert_eq!(find_block_by_timestamp(&c, 111).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn targets_outside_range_clamp_to_ends() {
        let c = chain();
        assert_eq!(find_block_by_timestamp(&c, 1).await.unwrap(), 1);
        assert_eq!(find_block_by_timestamp(&c, 10_000).await.unwrap(), 8);
    }

    #[tokio::test]
    async fn every_in_range_target_finds_the_nearest_timestamp() {
        let c = chain();
        for target in 100..=121u64 {
            let found = find_block_by_timestamp(&c, target).await.unwrap();
            let found_diff = c.timestamps[found as usize - 1].abs_diff(target);
            let true_min = c
                .timestamps
                .iter()
                .map(|t| t.abs_diff(target))
                .min()
                .unwrap();
            assert_eq!(found_diff, true_min, "target {target}");
        }
    }

    #[tokio::test]
    async fn cache_fetches_each_block_once() {
        let c = chain();
        let mut cache = TimestampCache::new();
        assert_eq!(cache.get(&c, 3).await.unwrap(), 106);
        assert_eq!(cache.get(&c, 3).await.unwrap(), 106);
        assert_eq!(cache.cached.len(), 1);
    }
}
