//! Signer cache: remembers which payouts have already been signed so a
//! restart or a repeated ledger instruction never double-spends.
//!
//! Keyed by the payout fingerprint ([`crate::types::TxOutItem::cache_hash`]).
//! A reverse map from broadcast tx hash to fingerprint lets the scanner evict
//! the entry when the broadcast transaction fails on-chain.

use std::sync::Arc;

use tracing::{error, warn};

use crate::error::Result;
use crate::store::KvStore;

const SIGNED_KEY: &str = "signed";
const TX_MAP_KEY: &str = "txmap";

#[derive(Clone)]
pub struct SignerCache {
    store: Arc<dyn KvStore>,
    prefix: String,
}

impl SignerCache {
    pub fn new(store: Arc<dyn KvStore>, chain_prefix: &str) -> Self {
        Self {
            store,
            prefix: chain_prefix.to_lowercase(),
        }
    }

    fn signed_key(&self, cache_hash: &str) -> Vec<u8> {
        format!("{}-{}-{}", self.prefix, SIGNED_KEY, cache_hash).into_bytes()
    }

    fn tx_map_key(&self, tx_hash: &str) -> Vec<u8> {
        format!("{}-{}-{}", self.prefix, TX_MAP_KEY, tx_hash.to_lowercase()).into_bytes()
    }

    /// Mark a payout as signed and remember which broadcast hash it produced.
    pub async fn set_signed(&self, cache_hash: &str, tx_hash: &str) -> Result<()> {
        self.store.set(&self.signed_key(cache_hash), b"1").await?;
        self.store
            .set(&self.tx_map_key(tx_hash), cache_hash.as_bytes())
            .await
    }

    /// Whether the payout was signed before. Store failures read as "not
    /// signed" so a flaky store can at worst cause a duplicate attempt that
    /// the chain nonce rejects.
    pub async fn has_signed(&self, cache_hash: &str) -> bool {
        match self.store.get(&self.signed_key(cache_hash)).await {
            Ok(v) => v.is_some(),
            Err(e) => {
                error!(error = %e, cache_hash, "Failed to read signer cache");
                false
            }
        }
    }

    /// Evict the payout that produced `tx_hash`, so it can be signed again.
    /// Called when the broadcast transaction failed on-chain.
    pub async fn remove_signed(&self, tx_hash: &str) {
        let map_key = self.tx_map_key(tx_hash);
        let cache_hash = match self.store.get(&map_key).await {
            Ok(Some(raw)) => match String::from_utf8(raw) {
                Ok(s) => s,
                Err(_) => {
                    warn!(tx_hash, "Signer cache tx map entry is not valid UTF-8");
                    return;
                }
            },
            Ok(None) => return,
            Err(e) => {
                error!(error = %e, tx_hash, "Failed to read signer cache tx map");
                return;
            }
        };
        if let Err(e) = self.store.remove(&self.signed_key(&cache_hash)).await {
            error!(error = %e, tx_hash, "Failed to remove signer cache entry");
        }
        if let Err(e) = self.store.remove(&map_key).await {
            error!(error = %e, tx_hash, "Failed to remove signer cache tx map entry");
        }
    }
}
