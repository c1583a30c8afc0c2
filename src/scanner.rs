//! Block scanner: walks the chain one height at a time, reconstructs inbound
//! transactions, detects reorgs, and reports the fee schedule near the tip.

use std::sync::Arc;

use alloy::primitives::{Address, TxHash, U256};
use futures::stream::{self, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::bridge::{KeyDirectory, LedgerClient, SolvencyReporter};
use crate::config::ScannerConfig;
use crate::error::Result;
use crate::gas_oracle::GasOracle;
use crate::metrics;
use crate::parser::{AddressValidator, SmartContractLogParser};
use crate::rpc::{decode_memo_bytes, ChainBlock, ChainRpc, ChainTx};
use crate::signer_cache::SignerCache;
use crate::store::BlockMetaAccessor;
use crate::tokens::AssetResolver;
use crate::types::{
    make_evm_gas, tx_id, Asset, BlockMeta, Coin, ErrataBlock, ErrataTx, TxInItem,
    MAX_CONTRACT_GAS, MAX_MEMO_SIZE, NATIVE_TOKEN_ADDRESS, TEN_GWEI, WEI_TO_CANONICAL_DIVISOR,
};

pub struct EvmScanner {
    chain: String,
    gas_asset: Asset,
    cfg: ScannerConfig,
    rpc: Arc<dyn ChainRpc>,
    resolver: Arc<dyn AssetResolver>,
    parser: SmartContractLogParser,
    directory: Arc<dyn KeyDirectory>,
    ledger: Arc<dyn LedgerClient>,
    solvency: Arc<dyn SolvencyReporter>,
    accessor: BlockMetaAccessor,
    signer_cache: SignerCache,
    gas_oracle: GasOracle,
    errata: mpsc::Sender<ErrataBlock>,
    aggregators: Vec<Address>,
    last_reported_gas_price: u128,
}

impl EvmScanner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain: &str,
        cfg: ScannerConfig,
        rpc: Arc<dyn ChainRpc>,
        resolver: Arc<dyn AssetResolver>,
        directory: Arc<dyn KeyDirectory>,
        ledger: Arc<dyn LedgerClient>,
        solvency: Arc<dyn SolvencyReporter>,
        accessor: BlockMetaAccessor,
        signer_cache: SignerCache,
        errata: mpsc::Sender<ErrataBlock>,
        aggregators: Vec<Address>,
    ) -> Self {
        let gas_asset = Asset::new(chain, chain);
        let dir = directory.clone();
        let whitelist = aggregators.clone();
        let validator: AddressValidator = Box::new(move |addr, include_whitelist| {
            dir.contracts().contains(addr) || (include_whitelist && whitelist.contains(addr))
        });
        let parser = SmartContractLogParser::new(validator, resolver.clone(), gas_asset.clone());
        let gas_oracle = GasOracle::new(cfg.gas_cache_blocks, cfg.gas_price_resolution);
        Self {
            chain: chain.to_string(),
            gas_asset,
            cfg,
            rpc,
            resolver,
            parser,
            directory,
            ledger,
            solvency,
            accessor,
            signer_cache,
            gas_oracle,
            errata,
            aggregators,
            last_reported_gas_price: 0,
        }
    }

    /// Scan one block. `chain_height` is the current tip, used to decide
    /// whether fee and solvency reporting are still worth doing for this
    /// height. Returns the inbound items observed in the block, prepended
    /// with any items recovered by reorg reprocessing.
    pub async fn fetch_txs(&mut self, height: u64, chain_height: u64) -> Result<Vec<TxInItem>> {
        let block = self.rpc.get_block(height).await?;

        let mut items = self.process_reorg(&block).await?;

        let prices: Vec<U256> = block
            .txs
            .iter()
            .map(|t| U256::from(t.gas_price))
            .collect();
        self.gas_oracle.update_price(&prices);
        let price = self.gas_oracle.current_price();
        if !price.is_zero() {
            let wei: u128 = price.saturating_to();
            if let Err(e) = self.accessor.save_gas_price(wei).await {
                warn!(error = %e, "Failed to persist gas price");
            }
            metrics::set_gas_price(&self.chain, wei as f64);
        }

        let mut extracted = self.extract_txs(&block).await;

        let mut meta = BlockMeta::new(height, block.parent_hash.clone(), block.hash.clone());
        for item in &extracted {
            meta.add_transaction(&item.tx);
        }
        self.accessor.save_block_meta(&meta).await?;
        if height > self.cfg.block_cache_size {
            if let Err(e) = self
                .accessor
                .prune_block_metas(height - self.cfg.block_cache_size)
                .await
            {
                warn!(error = %e, "Failed to prune block metas");
            }
        }
        items.append(&mut extracted);

        // Fee and solvency reporting only make sense close to the tip; while
        // catching up after downtime the data would be stale on arrival.
        if chain_height.saturating_sub(height) <= self.cfg.observation_flexibility_blocks {
            if let Err(e) = self.report_network_fee(height).await {
                warn!(error = %e, "Failed to report network fee");
                metrics::record_error(&self.chain, "network_fee");
            }
            if let Err(e) = self.solvency.report(height).await {
                warn!(error = %e, "Failed to report solvency");
            }
        }

        metrics::record_block_scanned(&self.chain, height);
        metrics::record_txs_observed(&self.chain, items.len());
        Ok(items)
    }

    /// Extract inbound items from a block's transactions, bounded by the
    /// configured concurrency. Individually failing transactions are logged
    /// and dropped; they must not stall the scan.
    async fn extract_txs(&self, block: &ChainBlock) -> Vec<TxInItem> {
        if block.txs.is_empty() {
            return Vec::new();
        }
        let results: Mutex<Vec<TxInItem>> = Mutex::new(Vec::new());
        let results_ref = &results;
        stream::iter(&block.txs)
            .for_each_concurrent(self.cfg.concurrency.max(1), |tx| async move {
                if tx.to.is_none() {
                    return;
                }
                let hash = format!("{:#x}", tx.hash);
                // An outbound we broadcast earlier has now been mined.
                if let Err(e) = self.accessor.remove_signed_tx_item(&hash).await {
                    debug!(error = %e, tx = %hash, "Failed to clear signed tx item");
                }
                match self.get_tx_in_item(block.height, tx).await {
                    Ok(Some(item)) => {
                        if item.to.is_empty() || item.memo.len() > MAX_MEMO_SIZE {
                            return;
                        }
                        results_ref.lock().await.push(item);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        error!(error = %e, tx = %hash, "Failed to extract transaction");
                        metrics::record_error(&self.chain, "extract_tx");
                    }
                }
            })
            .await;
        results.into_inner()
    }

    async fn get_tx_in_item(&self, height: u64, tx: &ChainTx) -> Result<Option<TxInItem>> {
        let Some(to) = tx.to else {
            return Ok(None);
        };
        let Some(receipt) = self.rpc.get_receipt(tx.hash).await? else {
            return Ok(None);
        };
        let hash = format!("{:#x}", tx.hash);

        let mut item = if !receipt.success {
            self.signer_cache.remove_signed(&hash).await;
            match self.failed_tx_item(tx, &to) {
                Some(item) => item,
                None => return Ok(None),
            }
        } else if self.is_bridge_contract(&to, true) {
            match self.smart_contract_item(tx, &receipt).await? {
                Some(item) => item,
                None => return Ok(None),
            }
        } else {
            match self.native_item(tx, &to).await? {
                Some(item) => item,
                None => return Ok(None),
            }
        };
        item.block_height = height;
        Ok(Some(item))
    }

    /// A reverted transaction still burnt the vault's gas. Observe a
    /// one-base-unit coin so the ledger can account for the spent fee, but
    /// only when a vault paid for it.
    fn failed_tx_item(&self, tx: &ChainTx, to: &Address) -> Option<TxInItem> {
        let sender = format!("{:#x}", tx.from);
        if !self.directory.is_vault_address(&sender) {
            return None;
        }
        let id = tx_id(&format!("{:#x}", tx.hash));
        let price = U256::from(tx.gas_price.max(TEN_GWEI));
        Some(TxInItem {
            tx: id.clone(),
            memo: format!("OUT:{id}"),
            sender,
            to: format!("{:#x}", to),
            coins: vec![Coin::new(self.gas_asset.clone(), U256::from(1u64))],
            gas: vec![make_evm_gas(&self.gas_asset, price, tx.gas)],
            ..Default::default()
        })
    }

    async fn smart_contract_item(
        &self,
        tx: &ChainTx,
        receipt: &crate::rpc::ReceiptInfo,
    ) -> Result<Option<TxInItem>> {
        let mut item = TxInItem {
            tx: tx_id(&format!("{:#x}", tx.hash)),
            sender: format!("{:#x}", tx.from),
            ..Default::default()
        };
        let is_vault_transfer = self.parser.get_tx_in_item(&receipt.logs, &mut item).await?;

        // A vault migration can carry the native balance as plain call value,
        // which emits no token event. Account for it once.
        if is_vault_transfer && !tx.value.is_zero() {
            let has_gas_coin = item.coins.iter().any(|c| c.asset == self.gas_asset);
            if !has_gas_coin {
                let amount = self
                    .resolver
                    .convert_amount(NATIVE_TOKEN_ADDRESS, tx.value)
                    .await?;
                item.coins.push(Coin::new(self.gas_asset.clone(), amount));
            }
        }

        let price = U256::from(tx.gas_price.max(TEN_GWEI));
        item.gas = vec![make_evm_gas(&self.gas_asset, price, receipt.gas_used)];
        if item.coins.iter().all(Coin::is_empty) {
            return Ok(None);
        }
        Ok(Some(item))
    }

    /// Plain value transfer. Only transfers a vault sends or receives are of
    /// interest; everything else on the chain is noise.
    async fn native_item(&self, tx: &ChainTx, to: &Address) -> Result<Option<TxInItem>> {
        let sender = format!("{:#x}", tx.from);
        let recipient = format!("{:#x}", to);
        if !self.directory.is_vault_address(&sender) && !self.directory.is_vault_address(&recipient)
        {
            return Ok(None);
        }
        let amount = self
            .resolver
            .convert_amount(NATIVE_TOKEN_ADDRESS, tx.value)
            .await?;
        if amount.is_zero() {
            return Ok(None);
        }
        let price = U256::from(tx.gas_price.max(TEN_GWEI));
        Ok(Some(TxInItem {
            tx: tx_id(&format!("{:#x}", tx.hash)),
            memo: decode_memo_bytes(&tx.input),
            sender,
            to: recipient,
            coins: vec![Coin::new(self.gas_asset.clone(), amount)],
            gas: vec![make_evm_gas(&self.gas_asset, price, tx.gas)],
            ..Default::default()
        }))
    }

    fn is_bridge_contract(&self, addr: &Address, include_whitelist: bool) -> bool {
        self.directory.contracts().contains(addr)
            || (include_whitelist && self.aggregators.contains(addr))
    }

    /// Compare the incoming block's parent hash against the stored meta of
    /// the previous height. On a mismatch, re-validate every retained block,
    /// emit errata for transactions that vanished, and re-extract the heights
    /// whose hashes changed.
    async fn process_reorg(&self, block: &ChainBlock) -> Result<Vec<TxInItem>> {
        if block.height == 0 {
            return Ok(Vec::new());
        }
        let Some(prev) = self.accessor.get_block_meta(block.height - 1).await? else {
            return Ok(Vec::new());
        };
        if prev.block_hash.eq_ignore_ascii_case(&block.parent_hash) {
            return Ok(Vec::new());
        }
        info!(
            height = block.height,
            stored = %prev.block_hash,
            parent = %block.parent_hash,
            "Chain reorg detected"
        );
        metrics::record_reorg(&self.chain);

        let mut items = Vec::new();
        for height in self.reprocess_txs().await? {
            let reorged = match self.rpc.get_block(height).await {
                Ok(b) => b,
                Err(e) => {
                    warn!(error = %e, height, "Failed to re-fetch reorged block");
                    continue;
                }
            };
            if reorged.txs.is_empty() {
                continue;
            }
            items.extend(self.extract_txs(&reorged).await);
        }
        Ok(items)
    }

    /// Walk all retained block metas, drop transactions the chain no longer
    /// knows, and return the heights whose block hash changed.
    async fn reprocess_txs(&self) -> Result<Vec<u64>> {
        let mut rescan = Vec::new();
        for mut meta in self.accessor.get_block_metas().await? {
            let mut kept = Vec::new();
            let mut errata = Vec::new();
            for hash in &meta.transactions {
                if self.check_transaction(hash).await {
                    kept.push(hash.clone());
                } else {
                    info!(tx = %hash, height = meta.height, "Tx gone after reorg, issuing errata");
                    errata.push(ErrataTx {
                        chain: self.chain.clone(),
                        id: tx_id(hash),
                    });
                }
            }
            if !errata.is_empty() {
                let block = ErrataBlock {
                    height: meta.height,
                    txs: errata,
                };
                if let Err(e) = self.errata.send(block).await {
                    error!(error = %e, "Failed to deliver errata block");
                }
            }
            let current = match self.rpc.get_block(meta.height).await {
                Ok(b) => b,
                Err(e) => {
                    warn!(error = %e, height = meta.height, "Failed to re-fetch block header");
                    continue;
                }
            };
            if !meta.block_hash.eq_ignore_ascii_case(&current.hash) {
                rescan.push(meta.height);
            }
            meta.previous_hash = current.parent_hash;
            meta.block_hash = current.hash;
            meta.transactions = kept;
            self.accessor.save_block_meta(&meta).await?;
        }
        Ok(rescan)
    }

    /// A transaction survives a reorg if the node still knows it; pending
    /// means it went back to the mempool and may yet confirm again.
    async fn check_transaction(&self, hash: &str) -> bool {
        let Ok(parsed) = hash.parse::<TxHash>() else {
            return false;
        };
        match self.rpc.get_tx(parsed).await {
            Ok(Some((_, pending))) => {
                if pending {
                    debug!(tx = %hash, "Tx back in mempool after reorg, keeping");
                }
                true
            }
            _ => false,
        }
    }

    /// Report the published gas price to the ledger, skipping changes within
    /// one resolution step of the last report.
    async fn report_network_fee(&mut self, height: u64) -> Result<()> {
        let price = self.gas_oracle.current_price();
        if price.is_zero() {
            return Ok(());
        }
        let wei: u128 = price.saturating_to();
        if self.last_reported_gas_price != 0
            && wei.abs_diff(self.last_reported_gas_price) <= self.cfg.gas_price_resolution as u128
        {
            return Ok(());
        }
        let rate = (wei / WEI_TO_CANONICAL_DIVISOR as u128) as u64;
        self.ledger
            .post_network_fee(height, &self.chain, MAX_CONTRACT_GAS, rate)
            .await?;
        debug!(height, rate, "Reported network fee");
        self.last_reported_gas_price = wei;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;

    use alloy::primitives::{Bytes, Log as PrimitiveLog, B256};
    use alloy::rpc::types::Log;
    use alloy::sol_types::SolEvent;
    use async_trait::async_trait;

    use crate::bridge::{Blame, StaticKeyDirectory, VaultEntry};
    use crate::contracts::BridgeRouter;
    use crate::error::Error;
    use crate::rpc::ReceiptInfo;
    use crate::store::{KvStore, MemoryKvStore};
    use crate::tokens::convert_to_canonical;

    const GWEI: u128 = 1_000_000_000;

    fn addr(n: u8) -> Address {
        Address::repeat_byte(n)
    }

    fn vault_addr() -> Address {
        addr(0x11)
    }

    fn router_addr() -> Address {
        addr(0xaa)
    }

    fn directory() -> Arc<StaticKeyDirectory> {
        Arc::new(
            StaticKeyDirectory::new(
                vec![VaultEntry {
                    pub_key: "vault-1".into(),
                    address: vault_addr(),
                    router: router_addr(),
                }],
                router_addr(),
                vec![],
            )
            .unwrap(),
        )
    }

    struct MockResolver;

    #[async_trait]
    impl AssetResolver for MockResolver {
        async fn get_asset(&self, token_address: &str) -> Result<Asset> {
            if crate::types::addr_eq(token_address, NATIVE_TOKEN_ADDRESS) {
                return Ok(Asset::new("ETH", "ETH"));
            }
            Err(Error::NotWhitelisted(token_address.to_string()))
        }

        async fn token_decimals(&self, _token_address: &str) -> u8 {
            18
        }

        async fn convert_amount(&self, token_address: &str, amount: U256) -> Result<U256> {
            if crate::types::addr_eq(token_address, NATIVE_TOKEN_ADDRESS) {
                return Ok(convert_to_canonical(amount, 18));
            }
            Err(Error::NotWhitelisted(token_address.to_string()))
        }
    }

    #[derive(Default)]
    struct MockChain {
        blocks: HashMap<u64, ChainBlock>,
        receipts: HashMap<TxHash, ReceiptInfo>,
        txs: HashMap<TxHash, (ChainTx, bool)>,
    }

    #[async_trait]
    impl ChainRpc for MockChain {
        async fn get_block(&self, height: u64) -> Result<ChainBlock> {
            self.blocks
                .get(&height)
                .cloned()
                .ok_or(Error::UnavailableBlock(height))
        }

        async fn get_block_height(&self) -> Result<u64> {
            Ok(self.blocks.keys().max().copied().unwrap_or_default())
        }

        async fn get_receipt(&self, hash: TxHash) -> Result<Option<ReceiptInfo>> {
            Ok(self.receipts.get(&hash).cloned())
        }

        async fn get_tx(&self, hash: TxHash) -> Result<Option<(ChainTx, bool)>> {
            Ok(self.txs.get(&hash).cloned())
        }

        async fn send_raw_tx(&self, _raw: &[u8]) -> Result<TxHash> {
            Ok(TxHash::default())
        }
    }

    #[derive(Default)]
    struct MockLedger {
        fees: Mutex<Vec<(u64, u64, u64)>>,
    }

    #[async_trait]
    impl LedgerClient for MockLedger {
        async fn post_network_fee(
            &self,
            height: u64,
            _chain: &str,
            transaction_size: u64,
            transaction_rate: u64,
        ) -> Result<()> {
            self.fees
                .lock()
                .await
                .push((height, transaction_size, transaction_rate));
            Ok(())
        }

        async fn post_keysign_failure(
            &self,
            _blame: &Blame,
            _height: u64,
            _memo: &str,
            _coins: &[Coin],
            _vault_pub_key: &str,
        ) -> Result<()> {
            Ok(())
        }

        async fn get_block_height(&self) -> Result<u64> {
            Ok(0)
        }

        async fn get_outbound_payouts(&self) -> Result<Vec<crate::types::TxOutItem>> {
            Ok(Vec::new())
        }

        async fn get_vaults(&self) -> Result<Vec<String>> {
            Ok(Vec::new())
        }

        async fn post_solvency(&self, _: u64, _: &str, _: &str, _: &[Coin]) -> Result<()> {
            Ok(())
        }
    }

    struct Harness {
        scanner: EvmScanner,
        ledger: Arc<MockLedger>,
        errata_rx: mpsc::Receiver<ErrataBlock>,
        store: Arc<dyn KvStore>,
    }

    fn harness(chain: MockChain, cfg: ScannerConfig) -> Harness {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let ledger = Arc::new(MockLedger::default());
        let (errata_tx, errata_rx) = mpsc::channel(16);
        let scanner = EvmScanner::new(
            "ETH",
            cfg,
            Arc::new(chain),
            Arc::new(MockResolver),
            directory(),
            ledger.clone(),
            Arc::new(crate::bridge::NoopSolvencyReporter),
            BlockMetaAccessor::new(store.clone(), "ETH"),
            SignerCache::new(store.clone(), "ETH"),
            errata_tx,
            vec![],
        );
        Harness {
            scanner,
            ledger,
            errata_rx,
            store,
        }
    }

    fn tx_hash(n: u8) -> TxHash {
        B256::repeat_byte(n)
    }

    fn native_tx(hash: TxHash, from: Address, to: Address, value: U256, memo: &str) -> ChainTx {
        ChainTx {
            hash,
            from,
            to: Some(to),
            value,
            gas: 21_000,
            gas_price: GWEI,
            nonce: 0,
            input: Bytes::from(memo.as_bytes().to_vec()),
        }
    }

    fn block(height: u64, parent: &str, hash: &str, txs: Vec<ChainTx>) -> ChainBlock {
        ChainBlock {
            height,
            hash: hash.to_string(),
            parent_hash: parent.to_string(),
            txs,
        }
    }

    fn ok_receipt() -> ReceiptInfo {
        ReceiptInfo {
            success: true,
            gas_used: 21_000,
            logs: vec![],
        }
    }

    #[tokio::test]
    async fn native_transfer_to_vault_is_observed() {
        let h1 = tx_hash(0x01);
        let five_eth = U256::from(5u64) * U256::from(10u64).pow(U256::from(18u64));
        let tx = native_tx(h1, addr(0x77), vault_addr(), five_eth, "ADD:ETH.ETH");
        let mut chain = MockChain::default();
        chain.blocks.insert(100, block(100, "0x00", "0x64", vec![tx]));
        chain.receipts.insert(h1, ok_receipt());

        let mut h = harness(chain, ScannerConfig::default());
        let items = h.scanner.fetch_txs(100, 100).await.unwrap();
        assert_eq!(items.len(), 1);
        let item = &items[0];
        assert_eq!(item.block_height, 100);
        assert_eq!(item.tx, tx_id(&format!("{:#x}", h1)));
        assert_eq!(item.memo, "ADD:ETH.ETH");
        assert_eq!(item.coins[0].amount, U256::from(500_000_000u64));
        // 1 gwei is below the ten-gwei floor: 1e10 * 21000 / 1e10 units.
        assert_eq!(item.gas[0].amount, U256::from(21_000u64));

        // The block meta records the observed hash for reorg tracking.
        let accessor = BlockMetaAccessor::new(h.store.clone(), "ETH");
        let meta = accessor.get_block_meta(100).await.unwrap().unwrap();
        assert_eq!(meta.transactions, vec![format!("{:#x}", h1)]);
    }

    #[tokio::test]
    async fn unrelated_and_zero_value_transfers_are_skipped() {
        let h1 = tx_hash(0x01);
        let h2 = tx_hash(0x02);
        // Neither side is a vault.
        let stranger = native_tx(h1, addr(0x77), addr(0x78), U256::from(1u64), "");
        // Vault recipient but zero value.
        let zero = native_tx(h2, addr(0x77), vault_addr(), U256::ZERO, "");
        let mut chain = MockChain::default();
        chain
            .blocks
            .insert(100, block(100, "0x00", "0x64", vec![stranger, zero]));
        chain.receipts.insert(h1, ok_receipt());
        chain.receipts.insert(h2, ok_receipt());

        let mut h = harness(chain, ScannerConfig::default());
        let items = h.scanner.fetch_txs(100, 100).await.unwrap();
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn failed_vault_tx_subsidizes_burnt_gas() {
        let h1 = tx_hash(0x01);
        let tx = native_tx(h1, vault_addr(), router_addr(), U256::ZERO, "");
        let mut chain = MockChain::default();
        chain.blocks.insert(100, block(100, "0x00", "0x64", vec![tx]));
        chain.receipts.insert(
            h1,
            ReceiptInfo {
                success: false,
                gas_used: 21_000,
                logs: vec![],
            },
        );

        let mut h = harness(chain, ScannerConfig::default());
        let items = h.scanner.fetch_txs(100, 100).await.unwrap();
        assert_eq!(items.len(), 1);
        let id = tx_id(&format!("{:#x}", h1));
        assert_eq!(items[0].memo, format!("OUT:{id}"));
        assert_eq!(items[0].coins[0].amount, U256::from(1u64));
        assert!(!items[0].gas[0].amount.is_zero());
    }

    #[tokio::test]
    async fn router_deposit_event_is_extracted() {
        let h1 = tx_hash(0x01);
        let evt = BridgeRouter::Deposit {
            to: addr(0x55),
            asset: Address::ZERO,
            amount: U256::from(10u64).pow(U256::from(18u64)),
            memo: "ADD:ETH.ETH".into(),
        };
        let log = Log {
            inner: PrimitiveLog {
                address: router_addr(),
                data: evt.encode_log_data(),
            },
            ..Default::default()
        };
        let tx = ChainTx {
            hash: h1,
            from: addr(0x77),
            to: Some(router_addr()),
            value: U256::from(10u64).pow(U256::from(18u64)),
            gas: 90_000,
            gas_price: 20 * GWEI,
            nonce: 0,
            input: Bytes::new(),
        };
        let mut chain = MockChain::default();
        chain.blocks.insert(100, block(100, "0x00", "0x64", vec![tx]));
        chain.receipts.insert(
            h1,
            ReceiptInfo {
                success: true,
                gas_used: 60_000,
                logs: vec![log],
            },
        );

        let mut h = harness(chain, ScannerConfig::default());
        let items = h.scanner.fetch_txs(100, 100).await.unwrap();
        assert_eq!(items.len(), 1);
        let item = &items[0];
        assert_eq!(item.memo, "ADD:ETH.ETH");
        assert_eq!(item.coins[0].amount, U256::from(100_000_000u64));
        // Contract path charges the receipt's gas used at the observed price.
        assert_eq!(
            item.gas[0].amount,
            U256::from(20u128 * GWEI) * U256::from(60_000u64)
                / U256::from(WEI_TO_CANONICAL_DIVISOR)
        );
    }

    #[tokio::test]
    async fn reorg_emits_errata_and_rescans_changed_blocks() {
        let gone = tx_hash(0x0e);
        let h1 = tx_hash(0x01);
        let five_eth = U256::from(5u64) * U256::from(10u64).pow(U256::from(18u64));
        let replacement = native_tx(h1, addr(0x77), vault_addr(), five_eth, "");
        let mut chain = MockChain::default();
        // Block 99 was re-mined with a different hash and different contents.
        chain
            .blocks
            .insert(99, block(99, "0x62", "0x63b", vec![replacement]));
        chain.blocks.insert(100, block(100, "0x63b", "0x64", vec![]));
        chain.receipts.insert(h1, ok_receipt());
        // The vanished tx is unknown to the node; h1 is mined.

        let mut h = harness(chain, ScannerConfig::default());
        let accessor = BlockMetaAccessor::new(h.store.clone(), "ETH");
        let mut old_meta = BlockMeta::new(99, "0x62".into(), "0x63a".into());
        old_meta.add_transaction(&format!("{:#x}", gone));
        accessor.save_block_meta(&old_meta).await.unwrap();

        let items = h.scanner.fetch_txs(100, 100).await.unwrap();

        // The vanished tx is reported as errata at its original height.
        let errata = h.errata_rx.try_recv().unwrap();
        assert_eq!(errata.height, 99);
        assert_eq!(errata.txs[0].id, tx_id(&format!("{:#x}", gone)));

        // The re-mined block was re-extracted.
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].block_height, 99);
        assert_eq!(items[0].tx, tx_id(&format!("{:#x}", h1)));

        // The stored meta now reflects the surviving chain.
        let meta = accessor.get_block_meta(99).await.unwrap().unwrap();
        assert_eq!(meta.block_hash, "0x63b");
        assert!(meta.transactions.is_empty());
    }

    #[tokio::test]
    async fn network_fee_reported_near_tip_with_hysteresis() {
        let h1 = tx_hash(0x01);
        let h2 = tx_hash(0x02);
        let mut tx1 = native_tx(h1, addr(0x77), addr(0x78), U256::from(1u64), "");
        tx1.gas_price = 15 * GWEI;
        let mut tx2 = native_tx(h2, addr(0x77), addr(0x78), U256::from(1u64), "");
        tx2.gas_price = 15 * GWEI;
        let mut chain = MockChain::default();
        chain.blocks.insert(100, block(100, "0x00", "0x64", vec![tx1]));
        chain.blocks.insert(101, block(101, "0x64", "0x65", vec![tx2]));
        chain.receipts.insert(h1, ok_receipt());
        chain.receipts.insert(h2, ok_receipt());

        let cfg = ScannerConfig {
            gas_cache_blocks: 1,
            ..Default::default()
        };
        let mut h = harness(chain, cfg);
        h.scanner.fetch_txs(100, 100).await.unwrap();
        h.scanner.fetch_txs(101, 101).await.unwrap();

        let fees = h.ledger.fees.lock().await;
        // 15 gwei rounds up to the 10 gwei grid: 20 gwei, rate 2. The second
        // block is unchanged and is not re-reported.
        assert_eq!(fees.as_slice(), &[(100, MAX_CONTRACT_GAS, 2)]);
    }
}
