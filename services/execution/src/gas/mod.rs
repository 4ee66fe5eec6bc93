//! # Gas Pricing - Fee Estimation and Profitability Gate
//!
//! ## Purpose
//!
//! Turns live fee history into EIP-1559 fee caps and refuses opportunities
//! whose expected profit cannot cover gas at the lowest viable price. No nonce
//! is reserved for an opportunity this module rejects.
//!
//! ## Architecture Role
//!
//! ```text
//! ChainProvider ──fee_history──→ [GasPriceOracle] ──GasEstimate──→ [GasManager]
//!      ↑                              │ rolling window                 │
//!  background refresher ──────────────┘ (RwLock, read-shared)          ↓
//!                                                       FeeSchedule / Unprofitable
//! ```
//!
//! ## Performance Profile
//!
//! - **Reads**: `get_estimate` clones an `Arc` under a read lock, no RPC on the hot path
//! - **Writes**: one refresher task swaps the window wholesale
//! - **Staleness**: last-known estimate is served marked stale when the source is down

mod manager;
mod oracle;

pub use manager::{FeeSchedule, GasManager};
pub use oracle::GasPriceOracle;

use crate::types::Urgency;
use ethers::types::U256;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

/// Fee estimate derived from the oracle window. Short-lived, recomputed per submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GasEstimate {
    pub urgency: Urgency,
    /// Expected base fee of the next block
    pub base_fee: U256,
    pub priority_fee: U256,
    pub max_fee_per_gas: U256,
    /// Newest block in the window
    pub sampled_block: u64,
    #[serde(skip)]
    pub sample_timestamp: Instant,
    pub stale: bool,
}

impl GasEstimate {
    pub fn age(&self) -> Duration {
        self.sample_timestamp.elapsed()
    }
}

/// Nearest-rank percentile of `values` (sorted in place). `None` when empty.
pub(crate) fn nearest_rank(values: &mut [U256], percentile: f64) -> Option<U256> {
    if values.is_empty() {
        return None;
    }
    values.sort_unstable();
    let n = values.len();
    let rank = ((percentile / 100.0) * n as f64).ceil() as usize;
    let index = rank.clamp(1, n) - 1;
    Some(values[index])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nearest_rank() {
        let mut values: Vec<U256> = (1..=10u64).map(U256::from).collect();
        assert_eq!(nearest_rank(&mut values, 50.0), Some(U256::from(5)));
        assert_eq!(nearest_rank(&mut values, 90.0), Some(U256::from(9)));
        assert_eq!(nearest_rank(&mut values, 99.0), Some(U256::from(10)));
        assert_eq!(nearest_rank(&mut values, 100.0), Some(U256::from(10)));
        assert_eq!(nearest_rank(&mut [], 50.0), None);
    }

    #[test]
    fn test_nearest_rank_unsorted_input() {
        let mut values = vec![U256::from(30), U256::from(10), U256::from(20)];
        assert_eq!(nearest_rank(&mut values, 1.0), Some(U256::from(10)));
        assert_eq!(nearest_rank(&mut values, 66.0), Some(U256::from(20)));
    }
}
