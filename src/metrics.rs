//! Prometheus metrics for the observer and signer.

#![allow(dead_code)]

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, CounterVec, GaugeVec,
};

lazy_static! {
    // Block scanning metrics
    pub static ref BLOCKS_SCANNED: CounterVec = register_counter_vec!(
        "bridge_blocks_scanned_total",
        "Total number of blocks scanned",
        &["chain"]
    ).unwrap();

    pub static ref LATEST_BLOCK: GaugeVec = register_gauge_vec!(
        "bridge_latest_block",
        "Latest block height scanned",
        &["chain"]
    ).unwrap();

    pub static ref TXS_OBSERVED: CounterVec = register_counter_vec!(
        "bridge_txs_observed_total",
        "Total number of inbound transactions observed",
        &["chain"]
    ).unwrap();

    pub static ref REORGS_DETECTED: CounterVec = register_counter_vec!(
        "bridge_reorgs_detected_total",
        "Total number of chain reorganizations detected",
        &["chain"]
    ).unwrap();

    pub static ref GAS_PRICE: GaugeVec = register_gauge_vec!(
        "bridge_gas_price_wei",
        "Published gas price in wei",
        &["chain"]
    ).unwrap();

    // Outbound metrics
    pub static ref OUTBOUND_SIGNED: CounterVec = register_counter_vec!(
        "bridge_outbound_signed_total",
        "Total number of outbound transactions signed",
        &["chain", "status"]
    ).unwrap();

    pub static ref STUCK_REBROADCASTS: CounterVec = register_counter_vec!(
        "bridge_stuck_rebroadcasts_total",
        "Total number of stuck transactions cancelled by rebroadcast",
        &["chain"]
    ).unwrap();

    // Error metrics
    pub static ref ERRORS: CounterVec = register_counter_vec!(
        "bridge_errors_total",
        "Total number of errors",
        &["chain", "type"]
    ).unwrap();
}

/// Record a scanned block
pub fn record_block_scanned(chain: &str, height: u64) {
    BLOCKS_SCANNED.with_label_values(&[chain]).inc();
    LATEST_BLOCK.with_label_values(&[chain]).set(height as f64);
}

/// Record observed inbound transactions
pub fn record_txs_observed(chain: &str, count: usize) {
    TXS_OBSERVED
        .with_label_values(&[chain])
        .inc_by(count as f64);
}

/// Record a detected reorg
pub fn record_reorg(chain: &str) {
    REORGS_DETECTED.with_label_values(&[chain]).inc();
}

/// Publish the current gas price
pub fn set_gas_price(chain: &str, price_wei: f64) {
    GAS_PRICE.with_label_values(&[chain]).set(price_wei);
}

/// Record an outbound sign attempt
pub fn record_outbound_signed(chain: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    OUTBOUND_SIGNED.with_label_values(&[chain, status]).inc();
}

/// Record a stuck transaction cancellation
pub fn record_stuck_rebroadcast(chain: &str) {
    STUCK_REBROADCASTS.with_label_values(&[chain]).inc();
}

/// Record an error
pub fn record_error(chain: &str, error_type: &str) {
    ERRORS.with_label_values(&[chain, error_type]).inc();
}
