//! Stuck outbound recovery.
//!
//! Every broadcast outbound is recorded with the ledger height it was sent
//! at. A transaction still pending after `tx_wait_blocks` ledger blocks is
//! assumed stuck below the prevailing gas price; it is cancelled with a
//! zero-value self-send at the same nonce so the vault's nonce sequence keeps
//! moving and the ledger can reschedule the payout.

use std::sync::Arc;
use std::time::Duration;

use alloy::consensus::TxLegacy;
use alloy::primitives::{Bytes, TxHash, TxKind, U256};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::bridge::{KeyDirectory, LedgerClient};
use crate::error::{Error, Result};
use crate::metrics;
use crate::rpc::ChainRpc;
use crate::signer::KeySignWrapper;
use crate::store::BlockMetaAccessor;
use crate::types::SignedTxItem;

const CANCEL_GAS_LIMIT: u64 = 21_000;

pub struct UnstuckMonitor {
    chain: String,
    chain_id: u64,
    tx_wait_blocks: u64,
    rpc: Arc<dyn ChainRpc>,
    directory: Arc<dyn KeyDirectory>,
    ledger: Arc<dyn LedgerClient>,
    accessor: BlockMetaAccessor,
    key_sign: Arc<KeySignWrapper>,
}

impl UnstuckMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain: &str,
        chain_id: u64,
        tx_wait_blocks: u64,
        rpc: Arc<dyn ChainRpc>,
        directory: Arc<dyn KeyDirectory>,
        ledger: Arc<dyn LedgerClient>,
        accessor: BlockMetaAccessor,
        key_sign: Arc<KeySignWrapper>,
    ) -> Self {
        Self {
            chain: chain.to_string(),
            chain_id,
            tx_wait_blocks,
            rpc,
            directory,
            ledger,
            accessor,
            key_sign,
        }
    }

    /// Run the monitor until shutdown, sweeping once per ledger block.
    pub async fn run(&self, interval_ms: u64, mut shutdown: mpsc::Receiver<()>) {
        let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(chain = %self.chain, "Stuck-tx monitor started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        error!(error = %e, "Stuck-tx sweep failed");
                        metrics::record_error(&self.chain, "unstuck");
                    }
                }
                _ = shutdown.recv() => {
                    info!(chain = %self.chain, "Stuck-tx monitor shutting down");
                    return;
                }
            }
        }
    }

    /// Inspect every recorded broadcast and resolve the ones that have waited
    /// long enough. Items that fail to resolve stay for the next sweep.
    pub async fn sweep(&self) -> Result<()> {
        let ledger_height = self.ledger.get_block_height().await?;
        for item in self.accessor.get_signed_tx_items().await? {
            if ledger_height.saturating_sub(item.height) <= self.tx_wait_blocks {
                continue;
            }
            match self.resolve(&item).await {
                Ok(()) => {
                    if let Err(e) = self.accessor.remove_signed_tx_item(&item.hash).await {
                        warn!(error = %e, tx = %item.hash, "Failed to drop signed tx item");
                    }
                }
                Err(e) => {
                    error!(error = %e, tx = %item.hash, "Failed to resolve stuck tx");
                }
            }
        }
        Ok(())
    }

    async fn resolve(&self, item: &SignedTxItem) -> Result<()> {
        let hash: TxHash = item
            .hash
            .parse()
            .map_err(|_| Error::Signing(format!("invalid tx hash {}", item.hash)))?;
        let Some((tx, pending)) = self.rpc.get_tx(hash).await? else {
            info!(tx = %item.hash, "Stuck tx no longer known to the node, dropping");
            return Ok(());
        };
        if !pending {
            debug!(tx = %item.hash, "Tx confirmed while waiting, dropping");
            return Ok(());
        }

        let vault = self
            .directory
            .vault_address(&item.vault_pub_key)
            .ok_or_else(|| {
                Error::Config(format!("no vault address for {}", item.vault_pub_key))
            })?;

        // Outbid both the network and the original attempt: double the
        // current oracle price or +10% on the stuck price, whichever is more.
        let oracle = self.accessor.get_gas_price().await?.unwrap_or_default();
        let gas_price = std::cmp::max(oracle.saturating_mul(2), tx.gas_price + tx.gas_price / 10);

        let cancel = TxLegacy {
            chain_id: Some(self.chain_id),
            nonce: tx.nonce,
            gas_price,
            gas_limit: CANCEL_GAS_LIMIT,
            to: TxKind::Call(vault),
            value: U256::ZERO,
            input: Bytes::new(),
        };
        let raw = self.key_sign.sign(&cancel, &item.vault_pub_key).await?;
        match self.rpc.send_raw_tx(&raw).await {
            Ok(cancel_hash) => {
                info!(
                    stuck = %item.hash,
                    cancel = %cancel_hash,
                    nonce = tx.nonce,
                    gas_price,
                    "Cancelled stuck tx"
                );
            }
            // The node may already hold a competing tx at this nonce; the
            // item is dropped either way and the nonce resolves on-chain.
            Err(e) => {
                warn!(error = %e, stuck = %item.hash, "Cancel broadcast rejected");
            }
        }
        metrics::record_stuck_rebroadcast(&self.chain);
        Ok(())
    }
}
