//! Token whitelist, on-chain metadata resolution and amount conversion.
//!
//! All bridge accounting is in canonical 1e8 amounts; tokens carry their own
//! decimals on-chain. Metadata is resolved once per token (symbol and
//! decimals queried from the contract) and persisted, and only whitelisted
//! tokens are ever resolved.

use alloy::primitives::{Address, U256};
use async_trait::async_trait;
use tracing::{info, warn};

use crate::bridge::BalanceSource;
use crate::error::{Error, Result};
use crate::rpc::EthRpc;
use crate::store::BlockMetaAccessor;
use crate::types::{
    addr_eq, Asset, Coin, TokenMeta, CANONICAL_DECIMALS, EVM_DECIMALS, NATIVE_TOKEN_ADDRESS,
};

/// Resolves token contract addresses into bridge assets and converts amounts
/// between token decimals and canonical decimals.
#[async_trait]
pub trait AssetResolver: Send + Sync {
    /// Asset for a token contract address. `NotWhitelisted` when the token is
    /// unknown; the caller decides whether that ignores an event or fails the
    /// transaction.
    async fn get_asset(&self, token_address: &str) -> Result<Asset>;

    /// Decimals recorded on inbound coins, zero when the canonical default
    /// applies (native asset, unknown token, or exactly 8 decimals).
    async fn token_decimals(&self, token_address: &str) -> u8;

    /// Token-native amount to canonical 1e8 amount.
    async fn convert_amount(&self, token_address: &str, amount: U256) -> Result<U256>;
}

/// One whitelist entry from configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct WhitelistToken {
    pub symbol: String,
    pub address: String,
    #[serde(default)]
    pub decimals: Option<u8>,
}

pub struct TokenManager {
    rpc: EthRpc,
    accessor: BlockMetaAccessor,
    whitelist: Vec<WhitelistToken>,
    chain: String,
    gas_asset: Asset,
}

impl TokenManager {
    pub fn new(
        rpc: EthRpc,
        accessor: BlockMetaAccessor,
        whitelist: Vec<WhitelistToken>,
        chain: &str,
    ) -> Self {
        Self {
            rpc,
            accessor,
            whitelist,
            chain: chain.to_string(),
            gas_asset: Asset::new(chain, chain),
        }
    }

    pub fn gas_asset(&self) -> &Asset {
        &self.gas_asset
    }

    fn whitelist_entry(&self, token_address: &str) -> Option<&WhitelistToken> {
        self.whitelist
            .iter()
            .find(|t| addr_eq(&t.address, token_address))
    }

    async fn resolve_meta(&self, token_address: &str) -> Result<TokenMeta> {
        if let Some(meta) = self.accessor.get_token_meta(token_address).await? {
            if !meta.is_empty() {
                return Ok(meta);
            }
        }

        let entry = self
            .whitelist_entry(token_address)
            .ok_or_else(|| Error::NotWhitelisted(token_address.to_string()))?;

        let addr: Address = token_address
            .parse()
            .map_err(|_| Error::NotWhitelisted(token_address.to_string()))?;

        let symbol = match self.rpc.erc20_symbol(addr).await {
            Ok(s) => sanitize_symbol(&s),
            Err(e) => {
                warn!(token = token_address, error = %e, "Failed to query token symbol, using whitelist symbol");
                sanitize_symbol(&entry.symbol)
            }
        };
        let decimals = match self.rpc.erc20_decimals(addr).await {
            Ok(d) => d,
            Err(e) => {
                let fallback = entry.decimals.unwrap_or(EVM_DECIMALS);
                warn!(token = token_address, error = %e, fallback, "Failed to query token decimals, using fallback");
                fallback
            }
        };

        let meta = TokenMeta {
            symbol,
            address: token_address.to_lowercase(),
            decimals,
        };
        self.accessor.save_token_meta(&meta).await?;
        info!(token = token_address, symbol = %meta.symbol, decimals = meta.decimals, "Token metadata resolved");
        Ok(meta)
    }

    /// Canonical amount back to token-native decimals for outbound signing.
    pub async fn convert_signing_amount(&self, amount: U256, token_address: &str) -> Result<U256> {
        if addr_eq(token_address, NATIVE_TOKEN_ADDRESS) {
            return Ok(convert_from_canonical(amount, EVM_DECIMALS));
        }
        let meta = self.resolve_meta(token_address).await?;
        Ok(convert_from_canonical(amount, meta.decimals))
    }

    /// Balance a vault controls for a token: router allowance for contract
    /// tokens, account balance for the native asset.
    pub async fn get_balance(
        &self,
        router: Address,
        vault: Address,
        token_address: &str,
        height: Option<u64>,
    ) -> Result<U256> {
        if addr_eq(token_address, NATIVE_TOKEN_ADDRESS) {
            return self.rpc.get_balance(vault, height).await;
        }
        let token: Address = token_address
            .parse()
            .map_err(|_| Error::NotWhitelisted(token_address.to_string()))?;
        self.rpc.vault_allowance(router, vault, token).await
    }
}

#[async_trait]
impl AssetResolver for TokenManager {
    async fn get_asset(&self, token_address: &str) -> Result<Asset> {
        if addr_eq(token_address, NATIVE_TOKEN_ADDRESS) {
            return Ok(self.gas_asset.clone());
        }
        let meta = self.resolve_meta(token_address).await?;
        Ok(Asset::token(&self.chain, &meta.symbol, token_address))
    }

    async fn token_decimals(&self, token_address: &str) -> u8 {
        if addr_eq(token_address, NATIVE_TOKEN_ADDRESS) {
            return 0;
        }
        match self.accessor.get_token_meta(token_address).await {
            Ok(Some(meta)) if meta.decimals != CANONICAL_DECIMALS => meta.decimals,
            _ => 0,
        }
    }

    async fn convert_amount(&self, token_address: &str, amount: U256) -> Result<U256> {
        if addr_eq(token_address, NATIVE_TOKEN_ADDRESS) {
            return Ok(convert_to_canonical(amount, EVM_DECIMALS));
        }
        let meta = self.resolve_meta(token_address).await?;
        Ok(convert_to_canonical(amount, meta.decimals))
    }
}

#[async_trait]
impl BalanceSource for TokenManager {
    /// Snapshot the vault's holdings in canonical amounts: the account's
    /// native balance plus its router allowance for every whitelisted token.
    async fn vault_coins(&self, router: Address, vault: Address) -> Result<Vec<Coin>> {
        let mut coins = Vec::new();
        let native = self
            .get_balance(router, vault, NATIVE_TOKEN_ADDRESS, None)
            .await?;
        // The gas asset is reported even at zero; an empty vault is exactly
        // what the ledger needs to hear about.
        coins.push(Coin::new(
            self.gas_asset.clone(),
            convert_to_canonical(native, EVM_DECIMALS),
        ));
        for token in &self.whitelist {
            let raw = match self.get_balance(router, vault, &token.address, None).await {
                Ok(v) => v,
                Err(e) => {
                    warn!(token = %token.address, error = %e, "Failed to read vault allowance");
                    continue;
                }
            };
            if raw.is_zero() {
                continue;
            }
            let asset = self.get_asset(&token.address).await?;
            let amount = self.convert_amount(&token.address, raw).await?;
            coins.push(Coin::new(asset, amount));
        }
        Ok(coins)
    }
}

/// Token-native amount to canonical 1e8.
pub fn convert_to_canonical(amount: U256, decimals: u8) -> U256 {
    match decimals.cmp(&CANONICAL_DECIMALS) {
        std::cmp::Ordering::Greater => {
            amount / U256::from(10u64).pow(U256::from(decimals - CANONICAL_DECIMALS))
        }
        std::cmp::Ordering::Less => {
            amount * U256::from(10u64).pow(U256::from(CANONICAL_DECIMALS - decimals))
        }
        std::cmp::Ordering::Equal => amount,
    }
}

/// Canonical 1e8 amount to token-native decimals.
pub fn convert_from_canonical(amount: U256, decimals: u8) -> U256 {
    match decimals.cmp(&CANONICAL_DECIMALS) {
        std::cmp::Ordering::Greater => {
            amount * U256::from(10u64).pow(U256::from(decimals - CANONICAL_DECIMALS))
        }
        std::cmp::Ordering::Less => {
            amount / U256::from(10u64).pow(U256::from(CANONICAL_DECIMALS - decimals))
        }
        std::cmp::Ordering::Equal => amount,
    }
}

/// Replace characters reserved by the asset notation.
pub fn sanitize_symbol(symbol: &str) -> String {
    symbol
        .chars()
        .filter(|c| *c != '\0')
        .map(|c| if c == '.' || c == '-' { '/' } else { c })
        .collect()
}
