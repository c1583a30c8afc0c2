//! External collaborators, consumed as traits.
//!
//! The scanner and signer never talk to the ledger, the key directory or the
//! threshold-signing party directly; they go through these traits so tests
//! can inject in-memory doubles.

use std::sync::Arc;

use alloy::primitives::{Address, Signature, B256};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::types::{Coin, TxOutItem};

/// Directory of vault keys and their router contracts.
pub trait KeyDirectory: Send + Sync {
    /// All router contracts the bridge has ever used on this chain, newest
    /// first. The scanner treats any of them as an observation target.
    fn contracts(&self) -> Vec<Address>;

    /// Router contract assigned to a vault key.
    fn contract_for_vault(&self, vault_pub_key: &str) -> Option<Address>;

    /// EVM address derived from a vault key.
    fn vault_address(&self, vault_pub_key: &str) -> Option<Address>;

    /// Router contract of the vault that owns the given EVM address.
    fn contract_by_address(&self, address: &str) -> Option<Address>;

    fn is_vault_address(&self, address: &str) -> bool;

    /// Whether the router changed since this vault was assigned its contract.
    fn has_router_updated(&self, vault_pub_key: &str) -> bool;
}

/// Nodes blamed for a failed threshold-signing round.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blame {
    pub blame_nodes: Vec<String>,
    pub reason: String,
}

/// Threshold-signing party. Returns a recoverable secp256k1 signature over
/// the 32-byte digest, or blame identifying the members that failed.
#[async_trait]
pub trait RemoteSigner: Send + Sync {
    async fn sign(
        &self,
        digest: B256,
        vault_pub_key: &str,
    ) -> std::result::Result<Signature, Blame>;
}

/// Client for the bridge ledger.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Report the chain's current fee schedule: a representative transaction
    /// size in gas units and the canonical rate per gas unit.
    async fn post_network_fee(
        &self,
        height: u64,
        chain: &str,
        transaction_size: u64,
        transaction_rate: u64,
    ) -> Result<()>;

    /// Report a failed keysign round so the ledger can penalize the blamed
    /// members and reschedule the payout.
    async fn post_keysign_failure(
        &self,
        blame: &Blame,
        height: u64,
        memo: &str,
        coins: &[Coin],
        vault_pub_key: &str,
    ) -> Result<()>;

    /// Current ledger block height.
    async fn get_block_height(&self) -> Result<u64>;

    /// Payouts queued for this chain, awaiting signature.
    async fn get_outbound_payouts(&self) -> Result<Vec<TxOutItem>>;

    /// Public keys of the active vaults.
    async fn get_vaults(&self) -> Result<Vec<String>>;

    /// Report a vault's on-chain holdings so the ledger can compare them
    /// against its book balance.
    async fn post_solvency(
        &self,
        height: u64,
        chain: &str,
        vault_pub_key: &str,
        coins: &[Coin],
    ) -> Result<()>;
}

/// Hook invoked near the chain tip so the host can report vault solvency.
#[async_trait]
pub trait SolvencyReporter: Send + Sync {
    async fn report(&self, height: u64) -> Result<()>;
}

/// No-op reporter for deployments that skip solvency checks.
pub struct NoopSolvencyReporter;

#[async_trait]
impl SolvencyReporter for NoopSolvencyReporter {
    async fn report(&self, _height: u64) -> Result<()> {
        Ok(())
    }
}

/// Source of a vault's on-chain holdings, in canonical amounts.
#[async_trait]
pub trait BalanceSource: Send + Sync {
    async fn vault_coins(&self, router: Address, vault: Address) -> Result<Vec<Coin>>;
}

/// [`SolvencyReporter`] that snapshots every active vault's holdings and
/// posts them to the ledger. A vault that cannot be resolved or read is
/// skipped rather than blocking the others.
pub struct VaultSolvencyReporter {
    chain: String,
    directory: Arc<dyn KeyDirectory>,
    ledger: Arc<dyn LedgerClient>,
    balances: Arc<dyn BalanceSource>,
}

impl VaultSolvencyReporter {
    pub fn new(
        chain: &str,
        directory: Arc<dyn KeyDirectory>,
        ledger: Arc<dyn LedgerClient>,
        balances: Arc<dyn BalanceSource>,
    ) -> Self {
        Self {
            chain: chain.to_string(),
            directory,
            ledger,
            balances,
        }
    }
}

#[async_trait]
impl SolvencyReporter for VaultSolvencyReporter {
    async fn report(&self, height: u64) -> Result<()> {
        for pub_key in self.ledger.get_vaults().await? {
            let Some(vault) = self.directory.vault_address(&pub_key) else {
                warn!(vault = %pub_key, "Vault has no address on this chain, skipping solvency");
                continue;
            };
            let Some(router) = self.directory.contract_for_vault(&pub_key) else {
                warn!(vault = %pub_key, "Vault has no router contract, skipping solvency");
                continue;
            };
            let coins = match self.balances.vault_coins(router, vault).await {
                Ok(coins) => coins,
                Err(e) => {
                    warn!(error = %e, vault = %pub_key, "Failed to read vault balances");
                    continue;
                }
            };
            self.ledger
                .post_solvency(height, &self.chain, &pub_key, &coins)
                .await?;
            debug!(height, vault = %pub_key, coins = coins.len(), "Reported vault solvency");
        }
        Ok(())
    }
}

/// REST implementation of [`LedgerClient`].
pub struct HttpLedgerClient {
    client: reqwest::Client,
    base_url: String,
    chain: String,
}

#[derive(Serialize)]
struct NetworkFeeRequest<'a> {
    height: u64,
    chain: &'a str,
    transaction_size: u64,
    transaction_rate: u64,
}

#[derive(Serialize)]
struct KeysignFailureRequest<'a> {
    height: u64,
    blame: &'a Blame,
    memo: &'a str,
    coins: &'a [Coin],
    pub_key: &'a str,
}

#[derive(Deserialize)]
struct BlockHeightResponse {
    height: u64,
}

#[derive(Serialize)]
struct SolvencyRequest<'a> {
    height: u64,
    chain: &'a str,
    pub_key: &'a str,
    coins: &'a [Coin],
}

impl HttpLedgerClient {
    pub fn new(base_url: &str, chain: &str, timeout: std::time::Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build ledger http client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            chain: chain.to_string(),
        })
    }
}

#[async_trait]
impl LedgerClient for HttpLedgerClient {
    async fn post_network_fee(
        &self,
        height: u64,
        chain: &str,
        transaction_size: u64,
        transaction_rate: u64,
    ) -> Result<()> {
        let body = NetworkFeeRequest {
            height,
            chain,
            transaction_size,
            transaction_rate,
        };
        let resp = self
            .client
            .post(format!("{}/network_fee", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(Error::rpc)?;
        resp.error_for_status().map_err(Error::rpc)?;
        debug!(height, transaction_rate, "Posted network fee");
        Ok(())
    }

    async fn post_keysign_failure(
        &self,
        blame: &Blame,
        height: u64,
        memo: &str,
        coins: &[Coin],
        vault_pub_key: &str,
    ) -> Result<()> {
        let body = KeysignFailureRequest {
            height,
            blame,
            memo,
            coins,
            pub_key: vault_pub_key,
        };
        let resp = self
            .client
            .post(format!("{}/keysign_failure", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(Error::rpc)?;
        resp.error_for_status().map_err(Error::rpc)?;
        Ok(())
    }

    async fn get_block_height(&self) -> Result<u64> {
        let resp = self
            .client
            .get(format!("{}/chains/{}/height", self.base_url, self.chain))
            .send()
            .await
            .map_err(Error::rpc)?
            .error_for_status()
            .map_err(Error::rpc)?;
        let body: BlockHeightResponse = resp.json().await.map_err(Error::rpc)?;
        Ok(body.height)
    }

    async fn get_outbound_payouts(&self) -> Result<Vec<TxOutItem>> {
        let resp = self
            .client
            .get(format!(
                "{}/chains/{}/queue/outbound",
                self.base_url, self.chain
            ))
            .send()
            .await
            .map_err(Error::rpc)?
            .error_for_status()
            .map_err(Error::rpc)?;
        resp.json().await.map_err(Error::rpc)
    }

    async fn get_vaults(&self) -> Result<Vec<String>> {
        let resp = self
            .client
            .get(format!("{}/vaults", self.base_url))
            .send()
            .await
            .map_err(Error::rpc)?
            .error_for_status()
            .map_err(Error::rpc)?;
        resp.json().await.map_err(Error::rpc)
    }

    async fn post_solvency(
        &self,
        height: u64,
        chain: &str,
        vault_pub_key: &str,
        coins: &[Coin],
    ) -> Result<()> {
        let body = SolvencyRequest {
            height,
            chain,
            pub_key: vault_pub_key,
            coins,
        };
        let resp = self
            .client
            .post(format!("{}/solvency", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(Error::rpc)?;
        resp.error_for_status().map_err(Error::rpc)?;
        Ok(())
    }
}

/// One vault entry in the static key directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultEntry {
    pub pub_key: String,
    pub address: Address,
    /// Router contract assigned when the vault was created.
    pub router: Address,
}

/// Config-supplied [`KeyDirectory`]. Suits single-operator deployments where
/// vault membership changes only with a config rollout.
pub struct StaticKeyDirectory {
    vaults: Vec<VaultEntry>,
    current_router: Address,
    previous_routers: Vec<Address>,
}

impl StaticKeyDirectory {
    pub fn new(
        vaults: Vec<VaultEntry>,
        current_router: Address,
        previous_routers: Vec<Address>,
    ) -> Result<Self> {
        if vaults.is_empty() {
            return Err(Error::Config("key directory has no vaults".into()));
        }
        Ok(Self {
            vaults,
            current_router,
            previous_routers,
        })
    }
}

impl KeyDirectory for StaticKeyDirectory {
    fn contracts(&self) -> Vec<Address> {
        let mut all = vec![self.current_router];
        for r in &self.previous_routers {
            if !all.contains(r) {
                all.push(*r);
            }
        }
        for v in &self.vaults {
            if !all.contains(&v.router) {
                all.push(v.router);
            }
        }
        all
    }

    fn contract_for_vault(&self, vault_pub_key: &str) -> Option<Address> {
        self.vaults
            .iter()
            .find(|v| v.pub_key == vault_pub_key)
            .map(|v| v.router)
    }

    fn vault_address(&self, vault_pub_key: &str) -> Option<Address> {
        self.vaults
            .iter()
            .find(|v| v.pub_key == vault_pub_key)
            .map(|v| v.address)
    }

    fn contract_by_address(&self, address: &str) -> Option<Address> {
        let addr: Address = address.parse().ok()?;
        self.vaults
            .iter()
            .find(|v| v.address == addr)
            .map(|v| v.router)
    }

    fn is_vault_address(&self, address: &str) -> bool {
        match address.parse::<Address>() {
            Ok(addr) => self.vaults.iter().any(|v| v.address == addr),
            Err(_) => false,
        }
    }

    fn has_router_updated(&self, vault_pub_key: &str) -> bool {
        match self.contract_for_vault(vault_pub_key) {
            Some(router) => router != self.current_router,
            None => false,
        }
    }
}
