mod bridge;
mod config;
mod contracts;
mod error;
mod gas_oracle;
mod memo;
mod metrics;
mod parser;
mod rpc;
mod scanner;
mod signer;
mod signer_cache;
mod store;
mod tokens;
mod types;
mod unstuck;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use eyre::WrapErr;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::bridge::{HttpLedgerClient, LedgerClient, StaticKeyDirectory, VaultSolvencyReporter};
use crate::config::Config;
use crate::error::Error;
use crate::rpc::{ChainRpc, EthRpc};
use crate::scanner::EvmScanner;
use crate::signer::{EvmSigner, KeySignWrapper};
use crate::signer_cache::SignerCache;
use crate::store::{BlockMetaAccessor, KvStore, PgKvStore};
use crate::tokens::{AssetResolver, TokenManager};
use crate::unstuck::UnstuckMonitor;

fn main() -> eyre::Result<()> {
    color_eyre::install()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> eyre::Result<()> {
    init_logging();

    info!("Starting EVM bridge operator");

    let config = Config::load()?;
    let chain = config.chain.chain.clone();
    info!(
        chain = %chain,
        chain_id = config.chain.chain_id,
        "Configuration loaded"
    );

    let store: Arc<dyn KvStore> = Arc::new(
        PgKvStore::connect(&config.database.url)
            .await
            .wrap_err("Failed to connect to database")?,
    );
    info!("Database connected");

    let timeout = Duration::from_millis(config.scanner.http_timeout_ms);
    let rpc = EthRpc::new(&config.chain.rpc_url, timeout)?;
    let onchain_id = rpc
        .chain_id()
        .await
        .wrap_err("Failed to query chain id")?;
    if onchain_id != config.chain.chain_id {
        eyre::bail!(
            "chain id mismatch: node reports {onchain_id}, configured {}",
            config.chain.chain_id
        );
    }

    let current_router: Address = config
        .registry
        .current_router
        .parse()
        .map_err(|e| eyre::eyre!("invalid current router address: {e}"))?;
    let previous_routers = config
        .registry
        .previous_routers
        .iter()
        .map(|r| {
            r.parse()
                .map_err(|e| eyre::eyre!("invalid previous router address {r}: {e}"))
        })
        .collect::<eyre::Result<Vec<Address>>>()?;
    let directory = Arc::new(StaticKeyDirectory::new(
        config.registry.vaults.clone(),
        current_router,
        previous_routers,
    )?);

    let mut aggregators = Vec::new();
    for agg in &config.registry.aggregators {
        match agg.parse::<Address>() {
            Ok(addr) => aggregators.push(addr),
            Err(e) => warn!(aggregator = %agg, error = %e, "Skipping unparseable aggregator"),
        }
    }

    let ledger: Arc<dyn LedgerClient> = Arc::new(HttpLedgerClient::new(
        &config.ledger.base_url,
        &chain,
        timeout,
    )?);
    let tokens = Arc::new(TokenManager::new(
        rpc.clone(),
        BlockMetaAccessor::new(store.clone(), &chain),
        config.registry.tokens.clone(),
        &chain,
    ));
    let key_sign = Arc::new(KeySignWrapper::new(
        &config.signer.private_key,
        &config.signer.pub_key,
        None,
    )?);

    let (errata_tx, mut errata_rx) = mpsc::channel(100);
    let chain_rpc: Arc<dyn ChainRpc> = Arc::new(rpc.clone());
    let resolver: Arc<dyn AssetResolver> = tokens.clone();
    let scanner = EvmScanner::new(
        &chain,
        config.scanner.clone(),
        chain_rpc.clone(),
        resolver,
        directory.clone(),
        ledger.clone(),
        Arc::new(VaultSolvencyReporter::new(
            &chain,
            directory.clone(),
            ledger.clone(),
            tokens.clone(),
        )),
        BlockMetaAccessor::new(store.clone(), &chain),
        SignerCache::new(store.clone(), &chain),
        errata_tx,
        aggregators,
    );
    let signer = EvmSigner::new(
        &chain,
        config.chain.chain_id,
        config.scanner.max_gas_limit,
        Arc::new(rpc.clone()),
        tokens,
        directory.clone(),
        ledger.clone(),
        SignerCache::new(store.clone(), &chain),
        BlockMetaAccessor::new(store.clone(), &chain),
        key_sign.clone(),
    )?;
    let unstuck = UnstuckMonitor::new(
        &chain,
        config.chain.chain_id,
        config.scanner.tx_wait_blocks,
        chain_rpc.clone(),
        directory,
        ledger.clone(),
        BlockMetaAccessor::new(store.clone(), &chain),
        key_sign,
    );

    // Resume one past the last retained block, or start at the tip.
    let accessor = BlockMetaAccessor::new(store.clone(), &chain);
    let start_height = accessor
        .get_block_metas()
        .await?
        .iter()
        .map(|m| m.height)
        .max()
        .map(|h| h + 1);

    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
    let (shutdown_tx2, shutdown_rx2) = mpsc::channel::<()>(1);
    let (shutdown_tx3, shutdown_rx3) = mpsc::channel::<()>(1);

    let shutdown_tx_signal = shutdown_tx.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = shutdown_tx_signal.send(()).await;
        let _ = shutdown_tx2.send(()).await;
        let _ = shutdown_tx3.send(()).await;
    });

    // In a multi-node deployment errata feed the observation pipeline; the
    // single-operator build surfaces them in the log for manual action.
    tokio::spawn(async move {
        while let Some(block) = errata_rx.recv().await {
            for tx in &block.txs {
                warn!(height = block.height, tx = %tx.id, "Errata: observed tx dropped by reorg");
            }
        }
    });

    let poll = Duration::from_millis(config.scanner.poll_interval_ms);
    let ledger_tick = Duration::from_millis(config.scanner.ledger_block_time_ms);

    tokio::select! {
        result = run_scanner(scanner, chain_rpc, &chain, start_height, poll, shutdown_rx) => {
            if let Err(e) = result {
                error!(error = %e, "Scanner stopped with error");
            }
        }
        _ = run_signer(signer, ledger, ledger_tick, shutdown_rx2) => {}
        _ = unstuck.run(config.scanner.ledger_block_time_ms, shutdown_rx3) => {}
    }

    info!("EVM bridge operator stopped");
    Ok(())
}

/// Sequential scan loop. The scanner owns extraction; this loop owns the
/// retry policy: an unavailable block or transient error waits one poll
/// interval and retries the same height.
async fn run_scanner(
    mut scanner: EvmScanner,
    rpc: Arc<dyn ChainRpc>,
    chain: &str,
    start_height: Option<u64>,
    poll: Duration,
    mut shutdown: mpsc::Receiver<()>,
) -> eyre::Result<()> {
    let mut height = match start_height {
        Some(h) => h,
        None => rpc.get_block_height().await?,
    };
    info!(height, "Scanner started");
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                info!("Scanner shutting down");
                return Ok(());
            }
            next = scan_once(&mut scanner, &rpc, chain, height, poll) => {
                height = next;
            }
        }
    }
}

async fn scan_once(
    scanner: &mut EvmScanner,
    rpc: &Arc<dyn ChainRpc>,
    chain: &str,
    height: u64,
    poll: Duration,
) -> u64 {
    let tip = match rpc.get_block_height().await {
        Ok(tip) => tip,
        Err(e) => {
            warn!(error = %e, "Failed to fetch chain tip");
            tokio::time::sleep(poll).await;
            return height;
        }
    };
    if height > tip {
        tokio::time::sleep(poll).await;
        return height;
    }
    match scanner.fetch_txs(height, tip).await {
        Ok(items) => {
            for item in &items {
                if let Ok(json) = serde_json::to_string(item) {
                    info!(tx_in = %json, "Observed inbound transaction");
                }
            }
            height + 1
        }
        Err(Error::UnavailableBlock(h)) => {
            debug!(height = h, "Block not yet available");
            tokio::time::sleep(poll).await;
            height
        }
        Err(e) => {
            error!(error = %e, height, "Failed to scan block");
            metrics::record_error(chain, "scan");
            tokio::time::sleep(poll).await;
            height
        }
    }
}

/// Poll the ledger's outbound queue and sign what it holds. Checkpoints from
/// failed attempts are re-attached on retry so the nonce is reused.
async fn run_signer(
    signer: EvmSigner,
    ledger: Arc<dyn LedgerClient>,
    tick: Duration,
    mut shutdown: mpsc::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut checkpoints: HashMap<String, Vec<u8>> = HashMap::new();
    info!("Signer started");
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                info!("Signer shutting down");
                return;
            }
            _ = ticker.tick() => {
                sign_pending(&signer, &ledger, &mut checkpoints).await;
            }
        }
    }
}

async fn sign_pending(
    signer: &EvmSigner,
    ledger: &Arc<dyn LedgerClient>,
    checkpoints: &mut HashMap<String, Vec<u8>>,
) {
    let ledger_height = match ledger.get_block_height().await {
        Ok(h) => h,
        Err(e) => {
            warn!(error = %e, "Failed to fetch ledger height");
            return;
        }
    };
    let payouts = match ledger.get_outbound_payouts().await {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, "Failed to fetch outbound queue");
            return;
        }
    };
    for mut payout in payouts {
        let fingerprint = payout.cache_hash();
        if payout.checkpoint.is_none() {
            payout.checkpoint = checkpoints.get(&fingerprint).cloned();
        }
        match signer.sign_tx(&payout, ledger_height).await {
            Ok(out) => {
                checkpoints.remove(&fingerprint);
                if let Some(raw) = out.raw_tx {
                    if let Err(e) = signer.broadcast(&payout, &raw).await {
                        error!(error = %e, memo = %payout.memo, "Broadcast bookkeeping failed");
                    }
                }
            }
            Err(fail) => {
                error!(error = %fail.source, memo = %payout.memo, "Failed to sign payout");
                if let Some(checkpoint) = fail.checkpoint {
                    checkpoints.insert(fingerprint, checkpoint);
                }
            }
        }
    }
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,evm_bridge_operator=debug"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(filter)
        .init();
}

/// Wait for shutdown signals (SIGINT/SIGTERM)
async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown");
        }
    }
}
