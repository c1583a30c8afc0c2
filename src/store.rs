//! Persistent key-value store and the block-metadata accessor built on it.
//!
//! The store is an ordered byte-key map with prefix iteration. Production
//! deployments back it with PostgreSQL; tests use the in-memory
//! implementation. Values are JSON blobs owned by the accessor layer, and
//! multi-key atomicity is never assumed.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tokio::sync::Mutex;
use tracing::info;

use crate::error::{Error, Result};
use crate::types::{BlockMeta, SignedTxItem, TokenMeta};

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
    async fn set(&self, key: &[u8], value: &[u8]) -> Result<()>;
    async fn remove(&self, key: &[u8]) -> Result<()>;
    /// All entries whose key starts with `prefix`, in key order.
    async fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;
}

/// In-memory store used by tests and local tooling.
#[derive(Default)]
pub struct MemoryKvStore {
    inner: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.inner.lock().await.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    async fn remove(&self, key: &[u8]) -> Result<()> {
        self.inner.lock().await.remove(key);
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let map = self.inner.lock().await;
        Ok(map
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// PostgreSQL-backed store over a single `kv_store` table.
pub struct PgKvStore {
    pool: PgPool,
}

impl PgKvStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(Error::store)?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(Error::store)?;
        info!("Key-value store connected and migrated");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl KvStore for PgKvStore {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let row = sqlx::query("SELECT value FROM kv_store WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::store)?;
        Ok(row.map(|r| r.get::<Vec<u8>, _>("value")))
    }

    async fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        sqlx::query(
            "INSERT INTO kv_store (key, value) VALUES ($1, $2)
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(Error::store)?;
        Ok(())
    }

    async fn remove(&self, key: &[u8]) -> Result<()> {
        sqlx::query("DELETE FROM kv_store WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(Error::store)?;
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        // Key-range scan: [prefix, prefix-with-last-byte-incremented).
        let upper = prefix_upper_bound(prefix);
        let rows = match upper {
            Some(upper) => {
                sqlx::query("SELECT key, value FROM kv_store WHERE key >= $1 AND key < $2 ORDER BY key")
                    .bind(prefix)
                    .bind(upper)
                    .fetch_all(&self.pool)
                    .await
            }
            None => {
                sqlx::query("SELECT key, value FROM kv_store WHERE key >= $1 ORDER BY key")
                    .bind(prefix)
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(Error::store)?;
        Ok(rows
            .into_iter()
            .map(|r| (r.get::<Vec<u8>, _>("key"), r.get::<Vec<u8>, _>("value")))
            .filter(|(k, _)| k.starts_with(prefix))
            .collect())
    }
}

/// Smallest byte string strictly greater than every key with this prefix,
/// or None when no such bound exists (all-0xff prefix).
fn prefix_upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut upper = prefix.to_vec();
    while let Some(last) = upper.pop() {
        if last < 0xff {
            upper.push(last + 1);
            return Some(upper);
        }
    }
    None
}

const BLOCK_META_KEY: &str = "blockmeta";
const SIGNED_TX_KEY: &str = "signedtx";
const TOKEN_META_KEY: &str = "tokenmeta";
const GAS_PRICE_KEY: &str = "gasprice";

/// Typed accessor over the store for everything the scanner, signer and
/// stuck-tx monitor persist. Keys are namespaced by a per-chain prefix so one
/// store can serve several chain clients.
#[derive(Clone)]
pub struct BlockMetaAccessor {
    store: Arc<dyn KvStore>,
    prefix: String,
}

impl BlockMetaAccessor {
    pub fn new(store: Arc<dyn KvStore>, chain_prefix: &str) -> Self {
        Self {
            store,
            prefix: chain_prefix.to_lowercase(),
        }
    }

    fn block_meta_key(&self, height: u64) -> Vec<u8> {
        format!("{}-{}-{}", self.prefix, BLOCK_META_KEY, height).into_bytes()
    }

    fn signed_tx_key(&self, hash: &str) -> Vec<u8> {
        format!("{}-{}-{}", self.prefix, SIGNED_TX_KEY, hash.to_lowercase()).into_bytes()
    }

    fn token_meta_key(&self, address: &str) -> Vec<u8> {
        format!("{}-{}-{}", self.prefix, TOKEN_META_KEY, address.to_uppercase()).into_bytes()
    }

    pub async fn get_block_meta(&self, height: u64) -> Result<Option<BlockMeta>> {
        match self.store.get(&self.block_meta_key(height)).await? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw).map_err(Error::store)?)),
            None => Ok(None),
        }
    }

    pub async fn save_block_meta(&self, meta: &BlockMeta) -> Result<()> {
        let raw = serde_json::to_vec(meta).map_err(Error::store)?;
        self.store.set(&self.block_meta_key(meta.height), &raw).await
    }

    /// All stored block metas, ordered by height.
    pub async fn get_block_metas(&self) -> Result<Vec<BlockMeta>> {
        let prefix = format!("{}-{}-", self.prefix, BLOCK_META_KEY).into_bytes();
        let mut metas = Vec::new();
        for (_, raw) in self.store.scan_prefix(&prefix).await? {
            let meta: BlockMeta = serde_json::from_slice(&raw).map_err(Error::store)?;
            metas.push(meta);
        }
        // Byte-key order is lexicographic, not numeric.
        metas.sort_by_key(|m| m.height);
        Ok(metas)
    }

    /// Drop block metas strictly below `height`.
    pub async fn prune_block_metas(&self, height: u64) -> Result<()> {
        for meta in self.get_block_metas().await? {
            if meta.height < height {
                self.store.remove(&self.block_meta_key(meta.height)).await?;
            }
        }
        Ok(())
    }

    pub async fn add_signed_tx_item(&self, item: &SignedTxItem) -> Result<()> {
        let raw = serde_json::to_vec(item).map_err(Error::store)?;
        self.store.set(&self.signed_tx_key(&item.hash), &raw).await
    }

    pub async fn remove_signed_tx_item(&self, hash: &str) -> Result<()> {
        self.store.remove(&self.signed_tx_key(hash)).await
    }

    pub async fn get_signed_tx_items(&self) -> Result<Vec<SignedTxItem>> {
        let prefix = format!("{}-{}-", self.prefix, SIGNED_TX_KEY).into_bytes();
        let mut items = Vec::new();
        for (_, raw) in self.store.scan_prefix(&prefix).await? {
            items.push(serde_json::from_slice(&raw).map_err(Error::store)?);
        }
        Ok(items)
    }

    pub async fn get_token_meta(&self, address: &str) -> Result<Option<TokenMeta>> {
        match self.store.get(&self.token_meta_key(address)).await? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw).map_err(Error::store)?)),
            None => Ok(None),
        }
    }

    pub async fn save_token_meta(&self, meta: &TokenMeta) -> Result<()> {
        let raw = serde_json::to_vec(meta).map_err(Error::store)?;
        self.store.set(&self.token_meta_key(&meta.address), &raw).await
    }

    /// Latest published gas price in wei, shared with the stuck-tx monitor.
    pub async fn get_gas_price(&self) -> Result<Option<u128>> {
        let key = format!("{}-{}", self.prefix, GAS_PRICE_KEY).into_bytes();
        match self.store.get(&key).await? {
            Some(raw) => {
                let s = String::from_utf8(raw).map_err(Error::store)?;
                Ok(Some(s.parse::<u128>().map_err(Error::store)?))
            }
            None => Ok(None),
        }
    }

    pub async fn save_gas_price(&self, price_wei: u128) -> Result<()> {
        let key = format!("{}-{}", self.prefix, GAS_PRICE_KEY).into_bytes();
        self.store.set(&key, price_wei.to_string().as_bytes()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accessor() -> BlockMetaAccessor {
        BlockMetaAccessor::new(Arc::new(MemoryKvStore::new()), "eth")
    }

    #[tokio::test]
    async fn block_meta_round_trip_and_prune() {
        let acc = accessor();
        for height in [9u64, 10, 11, 100] {
            let meta = BlockMeta::new(height, format!("0x{}", height - 1), format!("0x{height}"));
            acc.save_block_meta(&meta).await.unwrap();
        }
        let metas = acc.get_block_metas().await.unwrap();
        assert_eq!(
            metas.iter().map(|m| m.height).collect::<Vec<_>>(),
            vec![9, 10, 11, 100]
        );

        acc.prune_block_metas(11).await.unwrap();
        let metas = acc.get_block_metas().await.unwrap();
        assert_eq!(
            metas.iter().map(|m| m.height).collect::<Vec<_>>(),
            vec![11, 100]
        );
        assert!(acc.get_block_meta(10).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn signed_tx_items_round_trip() {
        let acc = accessor();
        let item = SignedTxItem {
            hash: "0xABCD".into(),
            height: 42,
            vault_pub_key: "vault-1".into(),
        };
        acc.add_signed_tx_item(&item).await.unwrap();
        let items = acc.get_signed_tx_items().await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].height, 42);

        // Removal is case-insensitive on the hash.
        acc.remove_signed_tx_item("0xabcd").await.unwrap();
        assert!(acc.get_signed_tx_items().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn token_meta_keyed_by_uppercase_address() {
        let acc = accessor();
        let meta = TokenMeta {
            symbol: "USDT".into(),
            address: "0xdac17f958d2ee523a2206206994597c13d831ec7".into(),
            decimals: 6,
        };
        acc.save_token_meta(&meta).await.unwrap();
        let got = acc
            .get_token_meta("0xDAC17F958D2EE523A2206206994597C13D831EC7")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, meta);
    }

    #[tokio::test]
    async fn gas_price_snapshot_round_trip() {
        let acc = accessor();
        assert!(acc.get_gas_price().await.unwrap().is_none());
        acc.save_gas_price(25_000_000_000).await.unwrap();
        assert_eq!(acc.get_gas_price().await.unwrap(), Some(25_000_000_000));
    }

    #[test]
    fn prefix_upper_bound_handles_carry() {
        assert_eq!(prefix_upper_bound(b"abc"), Some(b"abd".to_vec()));
        assert_eq!(prefix_upper_bound(&[0x61, 0xff]), Some(vec![0x62]));
        assert_eq!(prefix_upper_bound(&[0xff, 0xff]), None);
    }
}
