//! Core data types shared across the scanner and signer.

use alloy::primitives::{keccak256, U256};
use serde::{Deserialize, Serialize};

/// Canonical amounts carry 8 decimals regardless of token decimals.
pub const CANONICAL_DECIMALS: u8 = 8;
/// Native EVM value decimals (wei).
pub const EVM_DECIMALS: u8 = 18;
/// Divisor taking wei amounts to canonical 1e8 amounts.
pub const WEI_TO_CANONICAL_DIVISOR: u64 = 10_000_000_000;
/// Upper bound on gas paid for a router contract call, in units.
pub const MAX_CONTRACT_GAS: u64 = 80_000;
/// Floor applied to observed gas prices when reporting inbound gas coins.
pub const TEN_GWEI: u128 = 10_000_000_000;
/// Memos longer than this are dropped by the scanner.
pub const MAX_MEMO_SIZE: usize = 250;
/// Zero address, used to denote the chain's native asset.
pub const NATIVE_TOKEN_ADDRESS: &str = "0x0000000000000000000000000000000000000000";

/// A bridge asset, `CHAIN.SYMBOL`. Token symbols carry the contract address
/// suffix, e.g. `ETH.USDT-0XDAC17F958D2EE523A2206206994597C13D831EC7`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Asset {
    pub chain: String,
    pub symbol: String,
}

impl Asset {
    pub fn new(chain: impl Into<String>, symbol: impl Into<String>) -> Self {
        Self {
            chain: chain.into(),
            symbol: symbol.into(),
        }
    }

    /// Asset for a token contract: symbol becomes `SYM-0XADDR`.
    pub fn token(chain: &str, symbol: &str, address: &str) -> Self {
        Self {
            chain: chain.to_string(),
            symbol: format!("{}-{}", symbol, address.to_uppercase()),
        }
    }

    /// Contract address suffix of a token symbol, if any.
    pub fn token_address(&self) -> Option<String> {
        self.symbol
            .split_once('-')
            .map(|(_, addr)| addr.to_lowercase())
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty() && self.symbol.is_empty()
    }
}

impl std::fmt::Display for Asset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.chain, self.symbol)
    }
}

/// An asset amount. `decimals` records the token's native decimals so
/// downstream consumers can reverse the canonical conversion; zero means the
/// canonical default applies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coin {
    pub asset: Asset,
    pub amount: U256,
    #[serde(default)]
    pub decimals: u8,
}

impl Coin {
    pub fn new(asset: Asset, amount: U256) -> Self {
        Self {
            asset,
            amount,
            decimals: 0,
        }
    }

    pub fn with_decimals(asset: Asset, amount: U256, decimals: u8) -> Self {
        Self {
            asset,
            amount,
            decimals,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.amount.is_zero()
    }
}

impl std::fmt::Display for Coin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.amount, self.asset)
    }
}

/// An observed inbound transaction, reconstructed from a block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TxInItem {
    pub block_height: u64,
    /// Transaction hash, lowercase hex without the `0x` prefix.
    pub tx: String,
    pub memo: String,
    pub sender: String,
    pub to: String,
    pub coins: Vec<Coin>,
    pub gas: Vec<Coin>,
    pub aggregator: Option<String>,
    pub aggregator_target: Option<String>,
    pub aggregator_target_limit: Option<U256>,
}

impl TxInItem {
    pub fn is_empty(&self) -> bool {
        self.tx.is_empty() || self.coins.iter().all(Coin::is_empty)
    }
}

/// A payout instruction issued by the ledger.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TxOutItem {
    pub chain: String,
    pub to_address: String,
    pub vault_pub_key: String,
    pub coins: Vec<Coin>,
    pub memo: String,
    pub max_gas: Vec<Coin>,
    /// Gas rate in canonical units per gas.
    pub gas_rate: u64,
    pub in_hash: String,
    pub aggregator: Option<String>,
    pub aggregator_target_asset: Option<String>,
    pub aggregator_target_limit: Option<U256>,
    /// Opaque mid-sign state carried across restarts. Not part of the
    /// payout's identity.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<Vec<u8>>,
}

impl TxOutItem {
    /// Fingerprint of the payout used by the signer cache. Stable across
    /// retries and restarts; excludes checkpoint and gas fields, which may
    /// legitimately differ between attempts.
    pub fn cache_hash(&self) -> String {
        let mut buf = String::new();
        buf.push_str(&self.chain);
        buf.push('|');
        buf.push_str(&self.to_address.to_lowercase());
        buf.push('|');
        buf.push_str(&self.vault_pub_key);
        buf.push('|');
        for coin in &self.coins {
            buf.push_str(&coin.to_string());
            buf.push('|');
        }
        buf.push_str(&self.memo);
        buf.push('|');
        buf.push_str(&self.in_hash);
        hex::encode(keccak256(buf.as_bytes()))
    }
}

/// Per-block record of what the scanner observed, kept for reorg detection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockMeta {
    pub height: u64,
    pub previous_hash: String,
    pub block_hash: String,
    /// Hashes of transactions observed in this block, `0x`-prefixed lowercase.
    #[serde(default)]
    pub transactions: Vec<String>,
}

impl BlockMeta {
    pub fn new(height: u64, previous_hash: String, block_hash: String) -> Self {
        Self {
            height,
            previous_hash,
            block_hash,
            transactions: Vec::new(),
        }
    }

    pub fn add_transaction(&mut self, hash: &str) {
        let hash = normalize_tx_hash(hash);
        if !self.transactions.iter().any(|h| *h == hash) {
            self.transactions.push(hash);
        }
    }

    pub fn remove_transaction(&mut self, hash: &str) {
        let hash = normalize_tx_hash(hash);
        self.transactions.retain(|h| *h != hash);
    }
}

/// Record of a broadcast outbound, pending confirmation or rebroadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTxItem {
    /// Broadcast transaction hash, `0x`-prefixed lowercase.
    pub hash: String,
    /// Ledger height at broadcast time.
    pub height: u64,
    pub vault_pub_key: String,
}

/// Token metadata persisted after first on-chain resolution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenMeta {
    pub symbol: String,
    pub address: String,
    pub decimals: u8,
}

impl TokenMeta {
    pub fn is_empty(&self) -> bool {
        self.symbol.is_empty() && self.address.is_empty()
    }
}

/// Correction for previously observed transactions that vanished in a reorg.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrataBlock {
    pub height: u64,
    pub txs: Vec<ErrataTx>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrataTx {
    pub chain: String,
    /// Transaction hash without the `0x` prefix.
    pub id: String,
}

/// Lowercase a tx hash and make the `0x` prefix canonical.
pub fn normalize_tx_hash(hash: &str) -> String {
    let h = hash.to_lowercase();
    match h.strip_prefix("0x") {
        Some(rest) => format!("0x{rest}"),
        None => format!("0x{h}"),
    }
}

/// Strip the `0x` prefix for ledger-facing tx ids.
pub fn tx_id(hash: &str) -> String {
    hash.to_lowercase().trim_start_matches("0x").to_string()
}

/// Case-insensitive address equality, tolerant of the `0x` prefix.
pub fn addr_eq(a: &str, b: &str) -> bool {
    a.trim_start_matches("0x")
        .eq_ignore_ascii_case(b.trim_start_matches("0x"))
}

/// Gas coin for an observed transaction: price * units, converted from wei to
/// canonical decimals.
pub fn make_evm_gas(gas_asset: &Asset, price_wei: U256, gas_units: u64) -> Coin {
    let total = price_wei * U256::from(gas_units);
    Coin::new(
        gas_asset.clone(),
        total / U256::from(WEI_TO_CANONICAL_DIVISOR),
    )
}
