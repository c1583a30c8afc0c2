//! Outbound transaction builder, signer and broadcaster.
//!
//! Payouts are idempotent across restarts: a signer-cache fingerprint stops
//! re-signing of completed payouts, and the account nonce is serialized as a
//! checkpoint before any fallible signing step so retries reuse the same
//! nonce instead of double spending.

use std::sync::Arc;

use alloy::consensus::{SignableTransaction, TxEnvelope, TxLegacy};
use alloy::eips::eip2718::Encodable2718;
use alloy::network::TransactionBuilder;
use alloy::primitives::{Address, Bytes, TxKind, U256};
use alloy::rpc::types::TransactionRequest;
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::SignerSync;
use alloy::sol_types::SolCall;
use tracing::{error, info, warn};

use crate::bridge::{KeyDirectory, LedgerClient, RemoteSigner};
use crate::contracts::BridgeRouter;
use crate::error::{Error, Result};
use crate::memo::Memo;
use crate::metrics;
use crate::rpc::SignerRpc;
use crate::signer_cache::SignerCache;
use crate::store::BlockMetaAccessor;
use crate::tokens::TokenManager;
use crate::types::{
    addr_eq, SignedTxItem, TxOutItem, MAX_CONTRACT_GAS, NATIVE_TOKEN_ADDRESS,
    WEI_TO_CANONICAL_DIVISOR,
};

/// Successful sign attempt. `raw_tx` is `None` when the payout was skipped
/// (already signed, failed estimation, or dropped by validation that the
/// ledger will reschedule).
#[derive(Debug, Default)]
pub struct SignOutput {
    pub raw_tx: Option<Vec<u8>>,
    pub checkpoint: Option<Vec<u8>>,
}

/// Failed sign attempt. The checkpoint, when present, must be persisted into
/// the payout so the retry reuses the same nonce.
#[derive(Debug)]
pub struct SignFailure {
    pub checkpoint: Option<Vec<u8>>,
    pub source: Error,
}

impl SignFailure {
    fn new(source: Error) -> Self {
        Self {
            checkpoint: None,
            source,
        }
    }

    fn with_checkpoint(checkpoint: Vec<u8>, source: Error) -> Self {
        Self {
            checkpoint: Some(checkpoint),
            source,
        }
    }
}

/// Signs transaction digests with the local key when the vault is ours,
/// otherwise through the remote threshold party.
pub struct KeySignWrapper {
    local_signer: PrivateKeySigner,
    local_pub_key: String,
    remote: Option<Arc<dyn RemoteSigner>>,
}

impl KeySignWrapper {
    pub fn new(
        private_key: &str,
        local_pub_key: &str,
        remote: Option<Arc<dyn RemoteSigner>>,
    ) -> Result<Self> {
        let local_signer: PrivateKeySigner = private_key
            .parse()
            .map_err(|_| Error::Config("invalid signer private key".into()))?;
        Ok(Self {
            local_signer,
            local_pub_key: local_pub_key.to_string(),
            remote,
        })
    }

    /// Sign a legacy transaction for the given vault, returning the
    /// EIP-2718 encoded raw transaction.
    pub async fn sign(&self, tx: &TxLegacy, vault_pub_key: &str) -> Result<Vec<u8>> {
        let signature = if vault_pub_key == self.local_pub_key {
            self.local_signer
                .sign_hash_sync(&tx.signature_hash())
                .map_err(|e| Error::Signing(e.to_string()))?
        } else {
            let remote = self
                .remote
                .as_ref()
                .ok_or_else(|| Error::Signing(format!("no remote signer for vault {vault_pub_key}")))?;
            remote
                .sign(tx.signature_hash(), vault_pub_key)
                .await
                .map_err(|blame| Error::KeysignBlame {
                    nodes: blame.blame_nodes,
                    reason: blame.reason,
                })?
        };
        let signed = tx.clone().into_signed(signature);
        Ok(TxEnvelope::Legacy(signed).encoded_2718())
    }
}

/// Gas parameters resolved for one outbound transaction.
#[derive(Debug, PartialEq, Eq)]
struct GasPlan {
    gas_limit: u64,
    gas_price: u128,
    value: U256,
}

/// Apply the outbound gas policy. `max_gas_wei` is the ledger-prescribed
/// MaxGas total; the plan never exceeds it except for vault returns (which
/// deduct the gap from the returned value) and aggregator payouts (capped by
/// `max_gas_limit` units instead).
#[allow(clippy::too_many_arguments)]
fn plan_gas(
    memo: &Memo,
    has_router_updated: bool,
    has_aggregator: bool,
    mut estimated_gas: u64,
    mut gas_price: u128,
    max_gas_wei: u128,
    mut value: U256,
    max_gas_limit: u64,
) -> GasPlan {
    let units = estimated_gas.max(1) as u128;
    if !value.is_zero() {
        let total_gas = units * gas_price;
        if total_gas > max_gas_wei {
            if memo.is_vault_return() {
                if has_router_updated {
                    // Router upgrades need extra room, inflate the estimate.
                    estimated_gas = estimated_gas * 3 / 2;
                }
                let total_gas = estimated_gas.max(1) as u128 * gas_price;
                let gap = total_gas.saturating_sub(max_gas_wei);
                value = value.saturating_sub(U256::from(gap));
            } else if !has_aggregator {
                // Stay within MaxGas by lowering the rate; the tx may take
                // longer to mine.
                gas_price = max_gas_wei / units;
            } else if estimated_gas > max_gas_limit {
                gas_price = (max_gas_limit as u128 * gas_price) / units;
            } else {
                estimated_gas = max_gas_limit;
            }
        } else if gas_price > 0 {
            // Pay out the whole MaxGas allowance as gas limit headroom.
            estimated_gas = (max_gas_wei / gas_price) as u64;
        }
    } else if estimated_gas > max_gas_limit {
        gas_price = (max_gas_limit as u128 * gas_price) / units;
    }
    GasPlan {
        gas_limit: estimated_gas,
        gas_price,
        value,
    }
}

pub struct EvmSigner {
    chain: String,
    chain_id: u64,
    max_gas_limit: u64,
    rpc: Arc<dyn SignerRpc>,
    tokens: Arc<TokenManager>,
    directory: Arc<dyn KeyDirectory>,
    ledger: Arc<dyn LedgerClient>,
    signer_cache: SignerCache,
    accessor: BlockMetaAccessor,
    key_sign: Arc<KeySignWrapper>,
}

impl EvmSigner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain: &str,
        chain_id: u64,
        max_gas_limit: u64,
        rpc: Arc<dyn SignerRpc>,
        tokens: Arc<TokenManager>,
        directory: Arc<dyn KeyDirectory>,
        ledger: Arc<dyn LedgerClient>,
        signer_cache: SignerCache,
        accessor: BlockMetaAccessor,
        key_sign: Arc<KeySignWrapper>,
    ) -> Result<Self> {
        if chain_id == 0 {
            return Err(Error::Config("chain id cannot be zero".into()));
        }
        Ok(Self {
            chain: chain.to_string(),
            chain_id,
            max_gas_limit,
            rpc,
            tokens,
            directory,
            ledger,
            signer_cache,
            accessor,
            key_sign,
        })
    }

    /// Sign a payout. On failure the returned checkpoint, when present, must
    /// be written back into the payout before retrying.
    pub async fn sign_tx(
        &self,
        tx_out: &TxOutItem,
        ledger_height: u64,
    ) -> std::result::Result<SignOutput, SignFailure> {
        if !tx_out.chain.eq_ignore_ascii_case(&self.chain) {
            return Err(SignFailure::new(Error::Signing(format!(
                "chain {} is not handled by this client",
                tx_out.chain
            ))));
        }
        if self.signer_cache.has_signed(&tx_out.cache_hash()).await {
            info!(in_hash = %tx_out.in_hash, memo = %tx_out.memo, "Transaction signed before, ignoring");
            return Ok(SignOutput::default());
        }
        if tx_out.to_address.is_empty() {
            return Err(SignFailure::new(Error::Signing("to address is empty".into())));
        }
        if tx_out.vault_pub_key.is_empty() {
            return Err(SignFailure::new(Error::Signing(
                "vault public key is empty".into(),
            )));
        }
        if tx_out.memo.is_empty() {
            return Err(SignFailure::new(Error::Signing("memo is empty".into())));
        }
        let memo = Memo::parse(&tx_out.memo).map_err(SignFailure::new)?;

        // The nonce is the transaction checkpoint: decode it when present so
        // retries never pick a fresh nonce.
        let nonce = match decode_checkpoint(tx_out.checkpoint.as_deref()).map_err(SignFailure::new)? {
            Some(nonce) => nonce,
            None => {
                let from = self
                    .directory
                    .vault_address(&tx_out.vault_pub_key)
                    .ok_or_else(|| {
                        SignFailure::new(Error::Signing(format!(
                            "no address for vault {}",
                            tx_out.vault_pub_key
                        )))
                    })?;
                self.rpc
                    .get_nonce(from)
                    .await
                    .map_err(SignFailure::new)?
            }
        };
        let checkpoint = encode_checkpoint(nonce).map_err(SignFailure::new)?;

        let legacy_tx = match self
            .build_outbound_tx(tx_out, &memo, nonce)
            .await
            .map_err(|e| SignFailure::with_checkpoint(checkpoint.clone(), e))?
        {
            Some(tx) => tx,
            None => return Ok(SignOutput::default()),
        };

        match self.sign_with_blame(&legacy_tx, tx_out, ledger_height).await {
            Ok(raw) => {
                metrics::record_outbound_signed(&self.chain, true);
                Ok(SignOutput {
                    raw_tx: Some(raw),
                    checkpoint: Some(checkpoint),
                })
            }
            Err(e) => {
                metrics::record_outbound_signed(&self.chain, false);
                Err(SignFailure::with_checkpoint(checkpoint, e))
            }
        }
    }

    /// Sign and, on keysign blame, report the failure to the ledger before
    /// surfacing the error.
    async fn sign_with_blame(
        &self,
        tx: &TxLegacy,
        tx_out: &TxOutItem,
        ledger_height: u64,
    ) -> Result<Vec<u8>> {
        match self.key_sign.sign(tx, &tx_out.vault_pub_key).await {
            Ok(raw) => Ok(raw),
            Err(Error::KeysignBlame { nodes, reason }) if !nodes.is_empty() => {
                let blame = crate::bridge::Blame {
                    blame_nodes: nodes.clone(),
                    reason: reason.clone(),
                };
                if let Err(post_err) = self
                    .ledger
                    .post_keysign_failure(
                        &blame,
                        ledger_height,
                        &tx_out.memo,
                        &tx_out.coins,
                        &tx_out.vault_pub_key,
                    )
                    .await
                {
                    error!(error = %post_err, "Failed to post keysign failure to ledger");
                }
                Err(Error::KeysignBlame { nodes, reason })
            }
            Err(e) => Err(e),
        }
    }

    async fn build_outbound_tx(
        &self,
        tx_out: &TxOutItem,
        memo: &Memo,
        nonce: u64,
    ) -> Result<Option<TxLegacy>> {
        let contract = match self.directory.contract_for_vault(&tx_out.vault_pub_key) {
            Some(addr) => addr,
            None => {
                // Churning from a vault without a contract: for migrations,
                // fall back to the destination vault's contract.
                if memo.is_migrate() {
                    self.contract_by_address(&tx_out.to_address)
                        .ok_or_else(|| Error::Signing("no contract for migration target".into()))?
                } else {
                    return Err(Error::Signing("no contract for vault".into()));
                }
            }
        };

        let built = match self.build_call(tx_out, memo, contract).await? {
            Some(b) => b,
            None => return Ok(None),
        };
        let (data, has_router_updated, evm_value) = built;

        // Never pay less than the chain is currently charging.
        let mut gas_price = tx_out.gas_rate as u128 * WEI_TO_CANONICAL_DIVISOR as u128;
        if let Ok(Some(oracle_price)) = self.accessor.get_gas_price().await {
            if gas_price < oracle_price {
                gas_price = oracle_price;
            }
        }

        let from = self
            .directory
            .vault_address(&tx_out.vault_pub_key)
            .ok_or_else(|| Error::Signing("no address for vault".into()))?;

        // Estimate with a placeholder value: estimating with the real value
        // can fail on transient balance or allowance limits even though the
        // final transaction would succeed.
        let estimate_value = if evm_value.is_zero() {
            U256::ZERO
        } else {
            U256::from(21_000u64)
        };
        let request = TransactionRequest::default()
            .with_from(from)
            .with_to(contract)
            .with_value(estimate_value)
            .with_gas_limit(MAX_CONTRACT_GAS)
            .with_gas_price(gas_price)
            .with_input(data.clone());
        let estimated_gas = match self.rpc.estimate_gas(&request).await {
            Ok(units) => units,
            Err(e) => {
                // Vault may not have the funds yet; skip and let the ledger
                // reschedule the payout.
                error!(error = %e, memo = %tx_out.memo, "Failed to estimate gas, skipping payout");
                return Ok(None);
            }
        };

        let max_gas_wei: u128 = tx_out
            .max_gas
            .iter()
            .map(|c| c.amount.saturating_to::<u128>() * WEI_TO_CANONICAL_DIVISOR as u128)
            .sum();

        let plan = plan_gas(
            memo,
            has_router_updated,
            tx_out.aggregator.is_some(),
            estimated_gas,
            gas_price,
            max_gas_wei,
            evm_value,
            self.max_gas_limit,
        );

        Ok(Some(TxLegacy {
            chain_id: Some(self.chain_id),
            nonce,
            gas_price: plan.gas_price,
            gas_limit: plan.gas_limit,
            to: TxKind::Call(contract),
            value: plan.value,
            input: data,
        }))
    }

    /// Build the router calldata for the payout. Returns the calldata, the
    /// router-updated flag (vault returns only) and the native value carried
    /// by the transaction. `None` drops the payout.
    async fn build_call(
        &self,
        tx_out: &TxOutItem,
        memo: &Memo,
        contract: Address,
    ) -> Result<Option<(Bytes, bool, U256)>> {
        let to: Address = tx_out
            .to_address
            .parse()
            .map_err(|_| Error::Signing(format!("invalid to address {}", tx_out.to_address)))?;

        let mut value = U256::ZERO;
        let mut evm_value = U256::ZERO;
        let mut token_addr = NATIVE_TOKEN_ADDRESS.to_string();
        if tx_out.coins.len() == 1 {
            let coin = &tx_out.coins[0];
            token_addr = coin
                .asset
                .token_address()
                .unwrap_or_else(|| NATIVE_TOKEN_ADDRESS.to_string());
            value = self
                .tokens
                .convert_signing_amount(coin.amount, &token_addr)
                .await?;
            if addr_eq(&token_addr, NATIVE_TOKEN_ADDRESS) {
                evm_value = value;
            }
        }
        let token: Address = token_addr
            .parse()
            .map_err(|_| Error::Signing(format!("invalid token address {token_addr}")))?;

        let data: Bytes = match memo {
            Memo::Outbound { .. } | Memo::Refund { .. } | Memo::Ragnarok { .. } => {
                match &tx_out.aggregator {
                    None => BridgeRouter::transferOutCall {
                        to,
                        asset: token,
                        amount: value,
                        memo: tx_out.memo.clone(),
                    }
                    .abi_encode()
                    .into(),
                    Some(aggregator) => {
                        if !matches!(memo, Memo::Outbound { .. }) {
                            return Err(Error::Signing(
                                "only outbound payouts may use an aggregator".into(),
                            ));
                        }
                        if evm_value.is_zero() {
                            return Err(Error::Signing(
                                "aggregator payouts require a native outbound asset".into(),
                            ));
                        }
                        let target_asset =
                            tx_out.aggregator_target_asset.clone().unwrap_or_default();
                        // Addresses that do not round-trip drop the payout.
                        let Some(agg_addr) = parse_roundtrip(aggregator) else {
                            error!(aggregator = %aggregator, "Aggregator address does not round-trip, dropping payout");
                            return Ok(None);
                        };
                        let Some(target_addr) = parse_roundtrip(&target_asset) else {
                            error!(target = %target_asset, "Aggregator target address does not round-trip, dropping payout");
                            return Ok(None);
                        };
                        let limit = tx_out.aggregator_target_limit.unwrap_or(U256::ZERO);
                        BridgeRouter::transferOutAndCallCall {
                            aggregator: agg_addr,
                            finalToken: target_addr,
                            to,
                            amountOutMin: limit,
                            memo: tx_out.memo.clone(),
                        }
                        .abi_encode()
                        .into()
                    }
                }
            }
            Memo::Migrate { .. } | Memo::VaultFund { .. } => {
                if tx_out.aggregator.is_some() || tx_out.aggregator_target_asset.is_some() {
                    return Err(Error::Signing(
                        "vault management payouts cannot use an aggregator".into(),
                    ));
                }
                if addr_eq(&token_addr, NATIVE_TOKEN_ADDRESS) {
                    BridgeRouter::transferOutCall {
                        to,
                        asset: token,
                        amount: value,
                        memo: tx_out.memo.clone(),
                    }
                    .abi_encode()
                    .into()
                } else {
                    let new_contract = self
                        .contract_by_address(&tx_out.to_address)
                        .ok_or_else(|| Error::Signing("no contract for migration target".into()))?;
                    BridgeRouter::transferAllowanceCall {
                        router: new_contract,
                        newVault: to,
                        asset: token,
                        amount: value,
                        memo: tx_out.memo.clone(),
                    }
                    .abi_encode()
                    .into()
                }
            }
            Memo::VaultReturn { .. } => {
                if tx_out.aggregator.is_some() || tx_out.aggregator_target_asset.is_some() {
                    return Err(Error::Signing(
                        "vault returns cannot use an aggregator".into(),
                    ));
                }
                let new_contract = self
                    .contract_by_address(&tx_out.to_address)
                    .ok_or_else(|| Error::Signing("no contract for vault return target".into()))?;
                let has_router_updated = new_contract != contract;

                let mut coins = Vec::new();
                for coin in &tx_out.coins {
                    let asset_addr = coin
                        .asset
                        .token_address()
                        .unwrap_or_else(|| NATIVE_TOKEN_ADDRESS.to_string());
                    let amount = self
                        .tokens
                        .convert_signing_amount(coin.amount, &asset_addr)
                        .await?;
                    if addr_eq(&asset_addr, NATIVE_TOKEN_ADDRESS) {
                        evm_value = amount;
                        continue;
                    }
                    let asset: Address = asset_addr
                        .parse()
                        .map_err(|_| Error::Signing(format!("invalid token address {asset_addr}")))?;
                    coins.push(BridgeRouter::Coin { asset, amount });
                }
                let data: Bytes = BridgeRouter::returnVaultAssetsCall {
                    router: new_contract,
                    asgard: to,
                    coins,
                    memo: tx_out.memo.clone(),
                }
                .abi_encode()
                .into();
                return Ok(Some((data, has_router_updated, evm_value)));
            }
        };
        Ok(Some((data, false, evm_value)))
    }

    fn contract_by_address(&self, address: &str) -> Option<Address> {
        self.directory.contract_by_address(address)
    }

    /// Broadcast a raw transaction. Send failures are swallowed (the payout
    /// stays uncached and will be retried); post-broadcast bookkeeping
    /// failures never fail the broadcast.
    pub async fn broadcast(&self, tx_out: &TxOutItem, raw: &[u8]) -> Result<Option<String>> {
        let hash = match self.rpc.send_raw_tx(raw).await {
            Ok(hash) => format!("{hash:#x}"),
            Err(e) => {
                error!(error = %e, memo = %tx_out.memo, "Failed to broadcast transaction");
                return Ok(None);
            }
        };
        info!(tx_hash = %hash, memo = %tx_out.memo, "Broadcast transaction");

        if let Err(e) = self
            .signer_cache
            .set_signed(&tx_out.cache_hash(), &hash)
            .await
        {
            error!(error = %e, tx_hash = %hash, "Failed to mark payout as signed");
        }

        match self.ledger.get_block_height().await {
            Ok(height) => {
                let item = SignedTxItem {
                    hash: hash.clone(),
                    height,
                    vault_pub_key: tx_out.vault_pub_key.clone(),
                };
                if let Err(e) = self.accessor.add_signed_tx_item(&item).await {
                    error!(error = %e, tx_hash = %hash, "Failed to record signed tx item");
                }
            }
            Err(e) => {
                // Already broadcast; failing here would re-sign the payout.
                warn!(error = %e, "Failed to get ledger height for signed tx item");
            }
        }
        Ok(Some(hash))
    }
}

/// Parse an address, requiring the textual form to survive the round-trip.
fn parse_roundtrip(s: &str) -> Option<Address> {
    let addr: Address = s.parse().ok()?;
    if addr_eq(&addr.to_string(), s) {
        Some(addr)
    } else {
        None
    }
}

fn decode_checkpoint(raw: Option<&[u8]>) -> Result<Option<u64>> {
    match raw {
        Some(bytes) => {
            let nonce: u64 = serde_json::from_slice(bytes)
                .map_err(|e| Error::Signing(format!("fail to unmarshal checkpoint: {e}")))?;
            Ok(Some(nonce))
        }
        None => Ok(None),
    }
}

fn encode_checkpoint(nonce: u64) -> Result<Vec<u8>> {
    serde_json::to_vec(&nonce).map_err(|e| Error::Signing(format!("fail to marshal nonce: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_round_trip() {
        let encoded = encode_checkpoint(42).unwrap();
        assert_eq!(decode_checkpoint(Some(&encoded)).unwrap(), Some(42));
        assert_eq!(decode_checkpoint(None).unwrap(), None);
        assert!(decode_checkpoint(Some(b"not json")).is_err());
    }

    #[test]
    fn roundtrip_address_parsing() {
        assert!(parse_roundtrip("0x1c7b17362c84287bd1184447e6dfeaf920c31bbe").is_some());
        assert!(parse_roundtrip("not-an-address").is_none());
        assert!(parse_roundtrip("").is_none());
    }

    const GWEI: u128 = 1_000_000_000;

    #[test]
    fn gas_within_max_gets_full_allowance_as_limit() {
        // 50_000 units fit under a 2_000_000 gwei MaxGas at 20 gwei.
        let plan = plan_gas(
            &Memo::parse("OUT:abc").unwrap(),
            false,
            false,
            50_000,
            20 * GWEI,
            2_000_000 * GWEI,
            U256::from(1u64),
            400_000,
        );
        assert_eq!(plan.gas_price, 20 * GWEI);
        assert_eq!(plan.gas_limit, 100_000);
        assert_eq!(plan.value, U256::from(1u64));
    }

    #[test]
    fn over_budget_payout_lowers_the_rate() {
        // 100_000 units at 30 gwei = 3_000_000 gwei, MaxGas only 1_500_000.
        let plan = plan_gas(
            &Memo::parse("OUT:abc").unwrap(),
            false,
            false,
            100_000,
            30 * GWEI,
            1_500_000 * GWEI,
            U256::from(1u64),
            400_000,
        );
        assert_eq!(plan.gas_limit, 100_000);
        assert_eq!(plan.gas_price, 15 * GWEI);
    }

    #[test]
    fn vault_return_deducts_gas_gap_from_value() {
        let value = U256::from(10_000_000 * GWEI);
        // 100_000 units at 30 gwei, MaxGas 1_000_000 gwei: gap 2_000_000 gwei.
        let plan = plan_gas(
            &Memo::parse("VAULT-:9").unwrap(),
            false,
            false,
            100_000,
            30 * GWEI,
            1_000_000 * GWEI,
            value,
            400_000,
        );
        assert_eq!(plan.gas_limit, 100_000);
        assert_eq!(plan.gas_price, 30 * GWEI);
        assert_eq!(plan.value, value - U256::from(2_000_000 * GWEI));
    }

    #[test]
    fn vault_return_with_updated_router_inflates_estimate() {
        let value = U256::from(10_000_000 * GWEI);
        let plan = plan_gas(
            &Memo::parse("VAULT-:9").unwrap(),
            true,
            false,
            100_000,
            30 * GWEI,
            1_000_000 * GWEI,
            value,
            400_000,
        );
        // 150_000 units at 30 gwei = 4_500_000; gap 3_500_000 gwei.
        assert_eq!(plan.gas_limit, 150_000);
        assert_eq!(plan.value, value - U256::from(3_500_000 * GWEI));
    }

    #[test]
    fn aggregator_payout_is_capped_by_unit_ceiling() {
        // Below the ceiling the limit is raised to it.
        let plan = plan_gas(
            &Memo::parse("OUT:abc").unwrap(),
            false,
            true,
            100_000,
            30 * GWEI,
            1_500_000 * GWEI,
            U256::from(1u64),
            400_000,
        );
        assert_eq!(plan.gas_limit, 400_000);
        assert_eq!(plan.gas_price, 30 * GWEI);

        // Above the ceiling the rate comes down instead.
        let plan = plan_gas(
            &Memo::parse("OUT:abc").unwrap(),
            false,
            true,
            800_000,
            30 * GWEI,
            1_500_000 * GWEI,
            U256::from(1u64),
            400_000,
        );
        assert_eq!(plan.gas_limit, 800_000);
        assert_eq!(plan.gas_price, 400_000 * 30 * GWEI / 800_000);
    }

    #[test]
    fn zero_value_tx_caps_rate_by_unit_ceiling() {
        let plan = plan_gas(
            &Memo::parse("MIGRATE:10").unwrap(),
            false,
            false,
            800_000,
            30 * GWEI,
            0,
            U256::ZERO,
            400_000,
        );
        assert_eq!(plan.gas_limit, 800_000);
        assert_eq!(plan.gas_price, 15 * GWEI);

        let plan = plan_gas(
            &Memo::parse("MIGRATE:10").unwrap(),
            false,
            false,
            100_000,
            30 * GWEI,
            0,
            U256::ZERO,
            400_000,
        );
        assert_eq!(plan.gas_limit, 100_000);
        assert_eq!(plan.gas_price, 30 * GWEI);
    }

    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    use alloy::consensus::TxEnvelope;
    use alloy::eips::eip2718::Decodable2718;
    use alloy::primitives::TxHash;
    use async_trait::async_trait;
    use tokio::sync::Mutex;

    use crate::bridge::{Blame, StaticKeyDirectory, VaultEntry};
    use crate::rpc::EthRpc;
    use crate::store::MemoryKvStore;
    use crate::types::{Asset, Coin};

    #[derive(Default)]
    struct MockSignerRpc {
        nonce: u64,
        nonce_queries: AtomicU64,
        sent: Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl SignerRpc for MockSignerRpc {
        async fn get_nonce(&self, _address: Address) -> Result<u64> {
            self.nonce_queries.fetch_add(1, Ordering::SeqCst);
            Ok(self.nonce)
        }

        async fn estimate_gas(&self, _request: &TransactionRequest) -> Result<u64> {
            Ok(21_000)
        }

        async fn send_raw_tx(&self, raw: &[u8]) -> Result<TxHash> {
            self.sent.lock().await.push(raw.to_vec());
            Ok(TxHash::repeat_byte(0xcc))
        }
    }

    struct MockLedger;

    #[async_trait]
    impl crate::bridge::LedgerClient for MockLedger {
        async fn post_network_fee(&self, _: u64, _: &str, _: u64, _: u64) -> Result<()> {
            Ok(())
        }

        async fn post_keysign_failure(
            &self,
            _: &Blame,
            _: u64,
            _: &str,
            _: &[Coin],
            _: &str,
        ) -> Result<()> {
            Ok(())
        }

        async fn get_block_height(&self) -> Result<u64> {
            Ok(42)
        }

        async fn get_outbound_payouts(&self) -> Result<Vec<TxOutItem>> {
            Ok(Vec::new())
        }

        async fn get_vaults(&self) -> Result<Vec<String>> {
            Ok(Vec::new())
        }

        async fn post_solvency(&self, _: u64, _: &str, _: &str, _: &[Coin]) -> Result<()> {
            Ok(())
        }
    }

    fn signer(rpc: Arc<MockSignerRpc>) -> EvmSigner {
        let store: Arc<dyn crate::store::KvStore> = Arc::new(MemoryKvStore::new());
        let directory = Arc::new(
            StaticKeyDirectory::new(
                vec![VaultEntry {
                    pub_key: "vault-1".into(),
                    address: Address::repeat_byte(0x11),
                    router: Address::repeat_byte(0xaa),
                }],
                Address::repeat_byte(0xaa),
                vec![],
            )
            .unwrap(),
        );
        // Token resolution never leaves the whitelist in these tests, so the
        // endpoint is never dialed.
        let eth = EthRpc::new("http://127.0.0.1:9", Duration::from_millis(10)).unwrap();
        let tokens = Arc::new(TokenManager::new(
            eth,
            BlockMetaAccessor::new(store.clone(), "ETH"),
            vec![],
            "ETH",
        ));
        let key_sign = Arc::new(
            KeySignWrapper::new(&format!("0x{}", "11".repeat(32)), "vault-1", None).unwrap(),
        );
        EvmSigner::new(
            "ETH",
            1,
            400_000,
            rpc,
            tokens,
            directory,
            Arc::new(MockLedger),
            SignerCache::new(store.clone(), "ETH"),
            BlockMetaAccessor::new(store, "ETH"),
            key_sign,
        )
        .unwrap()
    }

    fn payout() -> TxOutItem {
        TxOutItem {
            chain: "ETH".into(),
            to_address: "0x1c7b17362c84287bd1184447e6dfeaf920c31bbe".into(),
            vault_pub_key: "vault-1".into(),
            coins: vec![Coin::new(Asset::new("ETH", "ETH"), U256::from(100_000_000u64))],
            memo: "OUT:abc".into(),
            max_gas: vec![Coin::new(Asset::new("ETH", "ETH"), U256::from(100_000u64))],
            gas_rate: 2,
            in_hash: "abc".into(),
            ..Default::default()
        }
    }

    fn decode_nonce(raw: &[u8]) -> u64 {
        let envelope = TxEnvelope::decode_2718(&mut &raw[..]).unwrap();
        let TxEnvelope::Legacy(signed) = envelope else {
            panic!("expected legacy tx");
        };
        signed.tx().nonce
    }

    #[tokio::test]
    async fn resigning_a_broadcast_payout_is_short_circuited() {
        let rpc = Arc::new(MockSignerRpc {
            nonce: 7,
            ..Default::default()
        });
        let signer = signer(rpc.clone());
        let payout = payout();

        let out = signer.sign_tx(&payout, 50).await.unwrap();
        let raw = out.raw_tx.expect("first attempt produces a raw tx");
        assert_eq!(decode_nonce(&raw), 7);
        signer.broadcast(&payout, &raw).await.unwrap();

        // Same payout again: the cache answers before any chain call.
        let again = signer.sign_tx(&payout, 51).await.unwrap();
        assert!(again.raw_tx.is_none());
        assert_eq!(rpc.sent.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn checkpointed_nonce_is_reused_on_retry() {
        let rpc = Arc::new(MockSignerRpc {
            nonce: 99,
            ..Default::default()
        });
        let signer = signer(rpc.clone());
        let mut payout = payout();
        payout.checkpoint = Some(encode_checkpoint(7).unwrap());

        let out = signer.sign_tx(&payout, 50).await.unwrap();
        let raw = out.raw_tx.expect("retry produces a raw tx");

        // The checkpointed nonce wins; the node is never asked for one.
        assert_eq!(decode_nonce(&raw), 7);
        assert_eq!(rpc.nonce_queries.load(Ordering::SeqCst), 0);
        assert_eq!(out.checkpoint, Some(encode_checkpoint(7).unwrap()));
    }
}
