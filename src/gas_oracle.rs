//! Rolling gas-price oracle.
//!
//! Each scanned block contributes its median transaction gas price to a
//! rolling cache; once the cache is full the published price is the median of
//! those medians, rounded up to the configured resolution. The coarse
//! resolution keeps fee reports stable across minor price wobble.

use alloy::primitives::U256;
use tracing::debug;

pub struct GasOracle {
    cache_blocks: usize,
    resolution: u64,
    cache: Vec<U256>,
    price: U256,
}

impl GasOracle {
    pub fn new(cache_blocks: usize, resolution: u64) -> Self {
        Self {
            cache_blocks,
            resolution,
            cache: Vec::with_capacity(cache_blocks),
            price: U256::ZERO,
        }
    }

    /// Feed the gas prices of one block's transactions. Empty blocks leave
    /// the oracle untouched.
    pub fn update_price(&mut self, prices: &[U256]) {
        if prices.is_empty() {
            return;
        }

        let mut sorted = prices.to_vec();
        sorted.sort();
        let block_median = sorted[sorted.len() / 2];

        self.cache.push(block_median);
        if self.cache.len() > self.cache_blocks {
            let excess = self.cache.len() - self.cache_blocks;
            self.cache.drain(..excess);
        }
        // Hold the previous price until a full window of blocks has been seen.
        if self.cache.len() < self.cache_blocks {
            return;
        }

        let mut medians = self.cache.clone();
        medians.sort();
        let median = medians[medians.len() / 2];

        // Round up to the resolution; never publish below one step.
        let resolution = U256::from(self.resolution);
        let rounded = if median.is_zero() {
            resolution
        } else {
            ((median - U256::from(1)) / resolution + U256::from(1)) * resolution
        };
        if rounded != self.price {
            debug!(gas_price = %rounded, "Gas price updated");
        }
        self.price = rounded;
    }

    /// Latest published price in wei; zero until the cache first fills.
    pub fn current_price(&self) -> U256 {
        self.price
    }

    pub fn resolution(&self) -> u64 {
        self.resolution
    }
}
