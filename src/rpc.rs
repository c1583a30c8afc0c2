//! Timeout-bounded wrapper over the alloy HTTP provider.
//!
//! Every call is wrapped in a per-request timeout and mapped into the crate's
//! error taxonomy. No retries live here; the outer poll loops own retry
//! policy.

use std::time::Duration;

use alloy::eips::{BlockId, BlockNumberOrTag};
use alloy::primitives::{Address, Bytes, TxHash, U256};
use alloy::providers::{Provider, ProviderBuilder, RootProvider};
use alloy::rpc::types::{Block, BlockTransactionsKind, Transaction, TransactionReceipt, TransactionRequest};
use alloy::transports::http::{Client, Http};
use async_trait::async_trait;

use crate::contracts::{BridgeRouter, Erc20};
use crate::error::{Error, Result};

/// A transaction as the scanner and stuck-tx monitor see it.
#[derive(Debug, Clone, Default)]
pub struct ChainTx {
    pub hash: TxHash,
    pub from: Address,
    pub to: Option<Address>,
    pub value: U256,
    pub gas: u64,
    pub gas_price: u128,
    pub nonce: u64,
    pub input: Bytes,
}

/// A block reduced to the fields the scanner consumes.
#[derive(Debug, Clone, Default)]
pub struct ChainBlock {
    pub height: u64,
    /// Block hash, `0x`-prefixed lowercase.
    pub hash: String,
    pub parent_hash: String,
    pub txs: Vec<ChainTx>,
}

/// Execution outcome of a mined transaction.
#[derive(Debug, Clone, Default)]
pub struct ReceiptInfo {
    pub success: bool,
    pub gas_used: u64,
    pub logs: Vec<alloy::rpc::types::Log>,
}

/// The chain-read and broadcast surface the scanner and stuck-tx monitor
/// depend on. Tests substitute an in-memory chain.
#[async_trait]
pub trait ChainRpc: Send + Sync {
    async fn get_block(&self, height: u64) -> Result<ChainBlock>;
    async fn get_block_height(&self) -> Result<u64>;
    async fn get_receipt(&self, hash: TxHash) -> Result<Option<ReceiptInfo>>;
    /// Transaction lookup reporting whether it is still pending.
    async fn get_tx(&self, hash: TxHash) -> Result<Option<(ChainTx, bool)>>;
    async fn send_raw_tx(&self, raw: &[u8]) -> Result<TxHash>;
}

/// The nonce, estimation and broadcast surface the outbound signer depends
/// on. Tests substitute an in-memory chain.
#[async_trait]
pub trait SignerRpc: Send + Sync {
    /// Next nonce for the address, pending transactions included.
    async fn get_nonce(&self, address: Address) -> Result<u64>;
    async fn estimate_gas(&self, request: &TransactionRequest) -> Result<u64>;
    async fn send_raw_tx(&self, raw: &[u8]) -> Result<TxHash>;
}

#[derive(Clone)]
pub struct EthRpc {
    provider: RootProvider<Http<Client>>,
    timeout: Duration,
}

impl EthRpc {
    pub fn new(rpc_url: &str, timeout: Duration) -> Result<Self> {
        let url = rpc_url
            .parse()
            .map_err(|e| Error::Config(format!("invalid rpc url {rpc_url}: {e}")))?;
        Ok(Self {
            provider: ProviderBuilder::new().on_http(url),
            timeout,
        })
    }

    pub fn provider(&self) -> &RootProvider<Http<Client>> {
        &self.provider
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = std::result::Result<T, alloy::transports::TransportError>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(Error::rpc(e)),
            Err(_) => Err(Error::Rpc("request timed out".into())),
        }
    }

    pub async fn chain_id(&self) -> Result<u64> {
        self.bounded(async { self.provider.get_chain_id().await }).await
    }

    pub async fn get_block_height(&self) -> Result<u64> {
        self.bounded(async { self.provider.get_block_number().await })
            .await
    }

    /// Full block with transactions. Absent blocks map to the typed
    /// [`Error::UnavailableBlock`] so callers can retry the height later.
    pub async fn get_block(&self, height: u64) -> Result<Block> {
        let block = self
            .bounded(async {
                self.provider
                    .get_block_by_number(
                        BlockNumberOrTag::Number(height),
                        BlockTransactionsKind::Full.into(),
                    )
                    .await
            })
            .await?;
        block.ok_or(Error::UnavailableBlock(height))
    }

    pub async fn get_receipt(&self, hash: TxHash) -> Result<Option<TransactionReceipt>> {
        self.bounded(async { self.provider.get_transaction_receipt(hash).await })
            .await
    }

    /// Transaction lookup reporting whether it is still pending. `None` means
    /// the node does not know the hash at all.
    pub async fn get_tx_by_hash(&self, hash: TxHash) -> Result<Option<(Transaction, bool)>> {
        let tx = self
            .bounded(async { self.provider.get_transaction_by_hash(hash).await })
            .await?;
        Ok(tx.map(|t| {
            let pending = t.block_number.is_none();
            (t, pending)
        }))
    }

    /// Next nonce for the address, pending transactions included.
    pub async fn get_nonce(&self, address: Address) -> Result<u64> {
        self.bounded(async {
            self.provider
                .get_transaction_count(address)
                .pending()
                .await
        })
        .await
    }

    pub async fn get_balance(&self, address: Address, height: Option<u64>) -> Result<U256> {
        self.bounded(async {
            match height {
                Some(h) => {
                    self.provider
                        .get_balance(address)
                        .block_id(BlockId::number(h))
                        .await
                }
                None => self.provider.get_balance(address).await,
            }
        })
        .await
    }

    pub async fn estimate_gas(&self, request: &TransactionRequest) -> Result<u64> {
        self.bounded(async { self.provider.estimate_gas(request).await })
            .await
    }

    pub async fn send_raw_tx(&self, raw: &[u8]) -> Result<TxHash> {
        let pending = self
            .bounded(async { self.provider.send_raw_transaction(raw).await })
            .await?;
        Ok(*pending.tx_hash())
    }

    pub async fn erc20_symbol(&self, token: Address) -> Result<String> {
        let contract = Erc20::new(token, &self.provider);
        let fut = async { contract.symbol().call().await };
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(ret)) => Ok(ret._0),
            Ok(Err(e)) => Err(Error::rpc(e)),
            Err(_) => Err(Error::Rpc("symbol() timed out".into())),
        }
    }

    pub async fn erc20_decimals(&self, token: Address) -> Result<u8> {
        let contract = Erc20::new(token, &self.provider);
        let fut = async { contract.decimals().call().await };
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(ret)) => Ok(ret._0),
            Ok(Err(e)) => Err(Error::rpc(e)),
            Err(_) => Err(Error::Rpc("decimals() timed out".into())),
        }
    }

    /// Token allowance a vault holds inside the router contract.
    pub async fn vault_allowance(
        &self,
        router: Address,
        vault: Address,
        token: Address,
    ) -> Result<U256> {
        let contract = BridgeRouter::new(router, &self.provider);
        let fut = async { contract.vaultAllowance(vault, token).call().await };
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(ret)) => Ok(ret.amount),
            Ok(Err(e)) => Err(Error::rpc(e)),
            Err(_) => Err(Error::Rpc("vaultAllowance() timed out".into())),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

fn view_tx(tx: &Transaction) -> ChainTx {
    ChainTx {
        hash: tx.hash,
        from: tx.from,
        to: tx.to,
        value: tx.value,
        gas: tx.gas as u64,
        gas_price: tx.gas_price.unwrap_or_default(),
        nonce: tx.nonce,
        input: tx.input.clone(),
    }
}

#[async_trait]
impl ChainRpc for EthRpc {
    async fn get_block(&self, height: u64) -> Result<ChainBlock> {
        let block = EthRpc::get_block(self, height).await?;
        let txs = match &block.transactions {
            alloy::rpc::types::BlockTransactions::Full(txs) => txs.iter().map(view_tx).collect(),
            _ => Vec::new(),
        };
        Ok(ChainBlock {
            height: block.header.number,
            hash: format!("{:#x}", block.header.hash),
            parent_hash: format!("{:#x}", block.header.parent_hash),
            txs,
        })
    }

    async fn get_block_height(&self) -> Result<u64> {
        EthRpc::get_block_height(self).await
    }

    async fn get_receipt(&self, hash: TxHash) -> Result<Option<ReceiptInfo>> {
        let receipt = EthRpc::get_receipt(self, hash).await?;
        Ok(receipt.map(|r| ReceiptInfo {
            success: r.status(),
            gas_used: r.gas_used as u64,
            logs: r.inner.logs().to_vec(),
        }))
    }

    async fn get_tx(&self, hash: TxHash) -> Result<Option<(ChainTx, bool)>> {
        let tx = EthRpc::get_tx_by_hash(self, hash).await?;
        Ok(tx.map(|(t, pending)| (view_tx(&t), pending)))
    }

    async fn send_raw_tx(&self, raw: &[u8]) -> Result<TxHash> {
        EthRpc::send_raw_tx(self, raw).await
    }
}

#[async_trait]
impl SignerRpc for EthRpc {
    async fn get_nonce(&self, address: Address) -> Result<u64> {
        EthRpc::get_nonce(self, address).await
    }

    async fn estimate_gas(&self, request: &TransactionRequest) -> Result<u64> {
        EthRpc::estimate_gas(self, request).await
    }

    async fn send_raw_tx(&self, raw: &[u8]) -> Result<TxHash> {
        EthRpc::send_raw_tx(self, raw).await
    }
}

/// Raw bytes helper for calldata-borne memos: many wallets hex-encode the
/// memo into the transaction input; fall back to the raw bytes when the
/// payload is not valid hex.
pub fn decode_memo_bytes(input: &Bytes) -> String {
    let raw = input.as_ref();
    let text = match std::str::from_utf8(raw) {
        Ok(s) => s,
        Err(_) => return String::from_utf8_lossy(raw).into_owned(),
    };
    let stripped = text.strip_prefix("0x").unwrap_or(text);
    match hex::decode(stripped) {
        Ok(decoded) => String::from_utf8_lossy(&decoded).into_owned(),
        Err(_) => text.to_string(),
    }
}
