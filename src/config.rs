#![allow(dead_code)]

use std::env;
use std::fmt;
use std::path::Path;

use eyre::{eyre, Result, WrapErr};
use serde::Deserialize;

use crate::bridge::VaultEntry;
use crate::tokens::WhitelistToken;

/// Main configuration for the observer/signer.
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub chain: ChainConfig,
    pub ledger: LedgerConfig,
    pub signer: SignerConfig,
    pub scanner: ScannerConfig,
    pub registry: Registry,
}

/// Database configuration
#[derive(Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

/// Custom Debug that redacts the database URL (may contain credentials).
impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &"<redacted>")
            .finish()
    }
}

/// Observed chain configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    /// Chain symbol, e.g. `ETH` or `BSC`. Also the native asset symbol and
    /// the store key prefix.
    pub chain: String,
    pub chain_id: u64,
    pub rpc_url: String,
}

/// Ledger client configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    pub base_url: String,
}

/// Signing key configuration
#[derive(Clone, Deserialize)]
pub struct SignerConfig {
    /// Local secp256k1 key, hex with 0x prefix.
    pub private_key: String,
    /// Identifier of the local key in the vault directory. Payouts for other
    /// vaults go to the remote threshold signer.
    pub pub_key: String,
}

/// Custom Debug that redacts private_key to prevent accidental log leakage.
impl fmt::Debug for SignerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignerConfig")
            .field("private_key", &"<redacted>")
            .field("pub_key", &self.pub_key)
            .finish()
    }
}

/// Scanner and signer tuning parameters
#[derive(Debug, Clone, Deserialize)]
pub struct ScannerConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_gas_cache_blocks")]
    pub gas_cache_blocks: usize,
    /// Gas price rounding grid in wei.
    #[serde(default = "default_gas_price_resolution")]
    pub gas_price_resolution: u64,
    /// How close to the tip a scanned block must be before fees and solvency
    /// are reported.
    #[serde(default = "default_observation_flexibility_blocks")]
    pub observation_flexibility_blocks: u64,
    /// How many block metas are retained for reorg detection.
    #[serde(default = "default_block_cache_size")]
    pub block_cache_size: u64,
    /// Gas limit ceiling for aggregator payouts.
    #[serde(default = "default_max_gas_limit")]
    pub max_gas_limit: u64,
    #[serde(default = "default_http_timeout_ms")]
    pub http_timeout_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Ledger block time, the cadence of the stuck-tx monitor.
    #[serde(default = "default_ledger_block_time_ms")]
    pub ledger_block_time_ms: u64,
    /// Ledger blocks a broadcast may stay pending before it is cancelled.
    #[serde(default = "default_tx_wait_blocks")]
    pub tx_wait_blocks: u64,
}

/// Token, aggregator and vault registry, loaded from a JSON file selected by
/// the `REGISTRY_FILE` environment variable.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Registry {
    #[serde(default)]
    pub tokens: Vec<WhitelistToken>,
    #[serde(default)]
    pub aggregators: Vec<String>,
    pub vaults: Vec<VaultEntry>,
    pub current_router: String,
    #[serde(default)]
    pub previous_routers: Vec<String>,
}

fn default_concurrency() -> usize {
    10
}

fn default_gas_cache_blocks() -> usize {
    40
}

fn default_gas_price_resolution() -> u64 {
    10_000_000_000 // 10 gwei
}

fn default_observation_flexibility_blocks() -> u64 {
    10
}

fn default_block_cache_size() -> u64 {
    100
}

fn default_max_gas_limit() -> u64 {
    400_000
}

fn default_http_timeout_ms() -> u64 {
    10_000
}

fn default_poll_interval_ms() -> u64 {
    3_000
}

fn default_ledger_block_time_ms() -> u64 {
    6_000
}

fn default_tx_wait_blocks() -> u64 {
    150
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            gas_cache_blocks: default_gas_cache_blocks(),
            gas_price_resolution: default_gas_price_resolution(),
            observation_flexibility_blocks: default_observation_flexibility_blocks(),
            block_cache_size: default_block_cache_size(),
            max_gas_limit: default_max_gas_limit(),
            http_timeout_ms: default_http_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            ledger_block_time_ms: default_ledger_block_time_ms(),
            tx_wait_blocks: default_tx_wait_blocks(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    /// Loads .env file if present, then reads from environment.
    pub fn load() -> Result<Self> {
        if Path::new(".env").exists() {
            dotenvy::from_filename(".env").wrap_err("Failed to load .env file")?;
        }
        Self::load_from_env()
    }

    fn load_from_env() -> Result<Self> {
        let database = DatabaseConfig {
            url: env::var("DATABASE_URL")
                .map_err(|_| eyre!("DATABASE_URL environment variable is required"))?,
        };

        let chain = ChainConfig {
            chain: env::var("CHAIN").map_err(|_| eyre!("CHAIN environment variable is required"))?,
            chain_id: env::var("CHAIN_ID")
                .map_err(|_| eyre!("CHAIN_ID environment variable is required"))?
                .parse()
                .wrap_err("CHAIN_ID must be a valid u64")?,
            rpc_url: env::var("RPC_URL")
                .map_err(|_| eyre!("RPC_URL environment variable is required"))?,
        };

        let ledger = LedgerConfig {
            base_url: env::var("LEDGER_URL")
                .map_err(|_| eyre!("LEDGER_URL environment variable is required"))?,
        };

        let signer = SignerConfig {
            private_key: env::var("SIGNER_PRIVATE_KEY")
                .map_err(|_| eyre!("SIGNER_PRIVATE_KEY environment variable is required"))?,
            pub_key: env::var("SIGNER_PUB_KEY")
                .map_err(|_| eyre!("SIGNER_PUB_KEY environment variable is required"))?,
        };

        let scanner = ScannerConfig {
            concurrency: env_or("SCAN_CONCURRENCY", default_concurrency()),
            gas_cache_blocks: env_or("GAS_CACHE_BLOCKS", default_gas_cache_blocks()),
            gas_price_resolution: env_or("GAS_PRICE_RESOLUTION", default_gas_price_resolution()),
            observation_flexibility_blocks: env_or(
                "OBSERVATION_FLEXIBILITY_BLOCKS",
                default_observation_flexibility_blocks(),
            ),
            block_cache_size: env_or("BLOCK_CACHE_SIZE", default_block_cache_size()),
            max_gas_limit: env_or("MAX_GAS_LIMIT", default_max_gas_limit()),
            http_timeout_ms: env_or("HTTP_TIMEOUT_MS", default_http_timeout_ms()),
            poll_interval_ms: env_or("POLL_INTERVAL_MS", default_poll_interval_ms()),
            ledger_block_time_ms: env_or("LEDGER_BLOCK_TIME_MS", default_ledger_block_time_ms()),
            tx_wait_blocks: env_or("TX_WAIT_BLOCKS", default_tx_wait_blocks()),
        };

        let registry_path = env::var("REGISTRY_FILE")
            .map_err(|_| eyre!("REGISTRY_FILE environment variable is required"))?;
        let registry = Registry::load(&registry_path)?;

        let config = Config {
            database,
            chain,
            ledger,
            signer,
            scanner,
            registry,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            return Err(eyre!("database.url cannot be empty"));
        }
        if self.chain.chain.is_empty() {
            return Err(eyre!("chain.chain cannot be empty"));
        }
        if self.chain.chain_id == 0 {
            return Err(eyre!("chain.chain_id cannot be zero"));
        }
        if self.chain.rpc_url.is_empty() {
            return Err(eyre!("chain.rpc_url cannot be empty"));
        }
        if self.ledger.base_url.is_empty() {
            return Err(eyre!("ledger.base_url cannot be empty"));
        }
        if self.signer.private_key.len() != 66 || !self.signer.private_key.starts_with("0x") {
            return Err(eyre!(
                "signer.private_key must be 66 chars (0x + 64 hex chars)"
            ));
        }
        if self.signer.pub_key.is_empty() {
            return Err(eyre!("signer.pub_key cannot be empty"));
        }
        if self.scanner.gas_cache_blocks == 0 {
            return Err(eyre!("scanner.gas_cache_blocks cannot be zero"));
        }
        if self.scanner.gas_price_resolution == 0 {
            return Err(eyre!("scanner.gas_price_resolution cannot be zero"));
        }
        if self.scanner.concurrency == 0 {
            return Err(eyre!("scanner.concurrency cannot be zero"));
        }
        if self.scanner.block_cache_size == 0 {
            return Err(eyre!("scanner.block_cache_size cannot be zero"));
        }
        if self.registry.vaults.is_empty() {
            return Err(eyre!("registry must define at least one vault"));
        }
        if self.registry.current_router.parse::<alloy::primitives::Address>().is_err() {
            return Err(eyre!("registry.current_router is not a valid address"));
        }
        Ok(())
    }
}

impl Registry {
    pub fn load(path: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("Failed to read registry file {path}"))?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).wrap_err("Failed to parse registry JSON")
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
