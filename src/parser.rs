//! Router event parser.
//!
//! Folds the receipt logs of one transaction into a single inbound item.
//! Events can be forged by arbitrary contracts and a single transaction can
//! carry adversarial combinations, so every branch validates consistency
//! against what earlier events in the same transaction established:
//! conflicting recipients or memos fail the whole transaction, while
//! individually malformed events are skipped.

use std::sync::Arc;

use alloy::primitives::Address;
use alloy::rpc::types::Log;
use alloy::sol_types::SolEvent;
use tracing::{debug, error, warn};

use crate::contracts::BridgeRouter;
use crate::error::{Error, Result};
use crate::memo::Memo;
use crate::tokens::AssetResolver;
use crate::types::{addr_eq, Asset, Coin, TxInItem, NATIVE_TOKEN_ADDRESS};

/// Decides whether a contract address belongs to the bridge. The flag widens
/// the check to the aggregator whitelist.
pub type AddressValidator = Box<dyn Fn(&Address, bool) -> bool + Send + Sync>;

pub struct SmartContractLogParser {
    validator: AddressValidator,
    resolver: Arc<dyn AssetResolver>,
    native_asset: Asset,
}

impl SmartContractLogParser {
    pub fn new(
        validator: AddressValidator,
        resolver: Arc<dyn AssetResolver>,
        native_asset: Asset,
    ) -> Self {
        Self {
            validator,
            resolver,
            native_asset,
        }
    }

    /// Fold router events into `tx_in`. Returns whether the transaction is a
    /// vault transfer, which the scanner post-processes separately.
    pub async fn get_tx_in_item(&self, logs: &[Log], tx_in: &mut TxInItem) -> Result<bool> {
        if logs.is_empty() {
            debug!("tx has no logs");
            return Ok(false);
        }
        let mut is_vault_transfer = false;
        for item in logs {
            // Only events emitted by a bridge router are considered.
            if !(self.validator)(&item.address(), false) {
                continue;
            }
            let Some(topic0) = item.topic0() else {
                continue;
            };
            match *topic0 {
                BridgeRouter::Deposit::SIGNATURE_HASH => {
                    let evt = match BridgeRouter::Deposit::decode_log(&item.inner, true) {
                        Ok(evt) => evt.data,
                        Err(e) => {
                            warn!(error = %e, "Failed to decode deposit event");
                            continue;
                        }
                    };
                    if evt.amount.is_zero() {
                        debug!("deposit amount is zero, ignoring");
                        continue;
                    }
                    let to = evt.to.to_string();
                    if !tx_in.to.is_empty() && !addr_eq(&tx_in.to, &to) {
                        return Err(Error::InvalidEventSequence(
                            "deposit events disagree on recipient".into(),
                        ));
                    }
                    if !tx_in.memo.is_empty() && !tx_in.memo.eq_ignore_ascii_case(&evt.memo) {
                        return Err(Error::InvalidEventSequence(
                            "deposit events disagree on memo".into(),
                        ));
                    }
                    let token = evt.asset.to_string();
                    let asset = match self.resolver.get_asset(&token).await {
                        Ok(asset) => asset,
                        Err(e) => {
                            warn!(error = %e, token = %token, "Failed to resolve deposit asset");
                            continue;
                        }
                    };
                    let amount = match self.resolver.convert_amount(&token, evt.amount).await {
                        Ok(a) => a,
                        Err(e) => {
                            warn!(error = %e, token = %token, "Failed to convert deposit amount");
                            continue;
                        }
                    };
                    tx_in.to = to;
                    tx_in.memo = evt.memo.clone();
                    let decimals = self.resolver.token_decimals(&token).await;
                    tx_in.coins.push(Coin::with_decimals(asset, amount, decimals));
                    is_vault_transfer = false;
                }
                BridgeRouter::TransferOut::SIGNATURE_HASH => {
                    // A transfer out is final; no further events are folded in.
                    let evt = match BridgeRouter::TransferOut::decode_log(&item.inner, true) {
                        Ok(evt) => evt.data,
                        Err(e) => {
                            warn!(error = %e, "Failed to decode transfer out event");
                            continue;
                        }
                    };
                    let memo = match Memo::parse(&evt.memo) {
                        Ok(m) => m,
                        Err(e) => {
                            warn!(error = %e, memo = %evt.memo, "Failed to parse transfer out memo");
                            continue;
                        }
                    };
                    if !memo.is_outbound() && !memo.is_migrate() && !memo.is_vault_fund() {
                        error!(memo = %evt.memo, "Incorrect memo kind for transfer out");
                        continue;
                    }
                    let token = evt.asset.to_string();
                    let asset = self.resolver.get_asset(&token).await?;
                    let amount = self.resolver.convert_amount(&token, evt.amount).await?;
                    let decimals = self.resolver.token_decimals(&token).await;
                    tx_in.to = evt.to.to_string();
                    tx_in.memo = evt.memo.clone();
                    tx_in.coins = vec![Coin::with_decimals(asset, amount, decimals)];
                    return Ok(false);
                }
                BridgeRouter::TransferAllowance::SIGNATURE_HASH => {
                    // The router never legitimately emits more than one of
                    // these; inconsistencies mean a forged sequence and the
                    // event is ignored.
                    let evt = match BridgeRouter::TransferAllowance::decode_log(&item.inner, true) {
                        Ok(evt) => evt.data,
                        Err(e) => {
                            warn!(error = %e, "Failed to decode transfer allowance event");
                            continue;
                        }
                    };
                    if evt.amount.is_zero() {
                        error!("transfer allowance event with zero amount, ignoring");
                        continue;
                    }
                    let old_vault = evt.oldVault.to_string();
                    let new_vault = evt.newVault.to_string();
                    if !tx_in.sender.is_empty() && !addr_eq(&tx_in.sender, &old_vault) {
                        error!("transfer allowance old vault is not the tx sender, ignoring");
                        continue;
                    }
                    if !tx_in.to.is_empty() && !addr_eq(&tx_in.to, &new_vault) {
                        error!("transfer allowance events disagree on recipient, ignoring");
                        continue;
                    }
                    if !tx_in.memo.is_empty() && !tx_in.memo.eq_ignore_ascii_case(&evt.memo) {
                        error!("transfer allowance events disagree on memo, ignoring");
                        continue;
                    }
                    let memo = match Memo::parse(&evt.memo) {
                        Ok(m) => m,
                        Err(e) => {
                            warn!(error = %e, memo = %evt.memo, "Failed to parse transfer allowance memo");
                            continue;
                        }
                    };
                    if !memo.is_migrate() && !memo.is_vault_fund() {
                        error!(memo = %evt.memo, "Incorrect memo kind for transfer allowance");
                        continue;
                    }
                    let token = evt.asset.to_string();
                    let asset = match self.resolver.get_asset(&token).await {
                        Ok(asset) => asset,
                        Err(e) => {
                            warn!(error = %e, token = %token, "Failed to resolve allowance asset");
                            continue;
                        }
                    };
                    let amount = match self.resolver.convert_amount(&token, evt.amount).await {
                        Ok(a) => a,
                        Err(e) => {
                            warn!(error = %e, token = %token, "Failed to convert allowance amount");
                            continue;
                        }
                    };
                    let decimals = self.resolver.token_decimals(&token).await;
                    tx_in.to = new_vault;
                    tx_in.memo = evt.memo.clone();
                    tx_in.coins = vec![Coin::with_decimals(asset, amount, decimals)];
                    is_vault_transfer = false;
                }
                BridgeRouter::VaultTransfer::SIGNATURE_HASH => {
                    let evt = match BridgeRouter::VaultTransfer::decode_log(&item.inner, true) {
                        Ok(evt) => evt.data,
                        Err(e) => {
                            warn!(error = %e, "Failed to decode vault transfer event");
                            continue;
                        }
                    };
                    let old_vault = evt.oldVault.to_string();
                    let new_vault = evt.newVault.to_string();
                    if !tx_in.sender.is_empty() && !addr_eq(&tx_in.sender, &old_vault) {
                        error!("vault transfer old vault is not the tx sender, ignoring");
                        continue;
                    }
                    if !tx_in.to.is_empty() && !addr_eq(&tx_in.to, &new_vault) {
                        error!("vault transfer events disagree on recipient, ignoring");
                        continue;
                    }
                    if !tx_in.memo.is_empty() && !tx_in.memo.eq_ignore_ascii_case(&evt.memo) {
                        error!("vault transfer events disagree on memo, ignoring");
                        continue;
                    }
                    let memo = match Memo::parse(&evt.memo) {
                        Ok(m) => m,
                        Err(e) => {
                            warn!(error = %e, memo = %evt.memo, "Failed to parse vault transfer memo");
                            continue;
                        }
                    };
                    if !memo.is_vault_return() {
                        error!(memo = %evt.memo, "Vault transfer memo is not a vault return");
                        continue;
                    }
                    let mut coins = Vec::new();
                    for coin in &evt.coins {
                        let token = coin.asset.to_string();
                        let asset = match self.resolver.get_asset(&token).await {
                            Ok(asset) => asset,
                            Err(e) => {
                                warn!(error = %e, token = %token, "Failed to resolve vault transfer coin");
                                continue;
                            }
                        };
                        let amount = match self.resolver.convert_amount(&token, coin.amount).await {
                            Ok(a) => a,
                            Err(e) => {
                                warn!(error = %e, token = %token, "Failed to convert vault transfer coin");
                                continue;
                            }
                        };
                        let decimals = self.resolver.token_decimals(&token).await;
                        coins.push(Coin::with_decimals(asset, amount, decimals));
                    }
                    tx_in.to = new_vault;
                    tx_in.memo = evt.memo.clone();
                    tx_in.coins = coins;
                    is_vault_transfer = true;
                }
                BridgeRouter::TransferOutAndCall::SIGNATURE_HASH => {
                    let evt = match BridgeRouter::TransferOutAndCall::decode_log(&item.inner, true)
                    {
                        Ok(evt) => evt.data,
                        Err(e) => {
                            warn!(error = %e, "Failed to decode transfer out and call event");
                            continue;
                        }
                    };
                    let memo = match Memo::parse(&evt.memo) {
                        Ok(m) => m,
                        Err(e) => {
                            warn!(error = %e, memo = %evt.memo, "Failed to parse transfer out and call memo");
                            continue;
                        }
                    };
                    if !matches!(memo, Memo::Outbound { .. }) {
                        error!(memo = %evt.memo, "Transfer out and call memo is not outbound");
                        continue;
                    }
                    let amount = match self
                        .resolver
                        .convert_amount(NATIVE_TOKEN_ADDRESS, evt.amount)
                        .await
                    {
                        Ok(a) => a,
                        Err(e) => {
                            warn!(error = %e, "Failed to convert transfer out and call amount");
                            continue;
                        }
                    };
                    let decimals = self.resolver.token_decimals(NATIVE_TOKEN_ADDRESS).await;
                    tx_in.coins = vec![Coin::with_decimals(
                        self.native_asset.clone(),
                        amount,
                        decimals,
                    )];
                    tx_in.to = evt.to.to_string();
                    tx_in.memo = evt.memo.clone();
                    tx_in.sender = evt.vault.to_string();
                    tx_in.aggregator = Some(evt.target.to_string());
                    tx_in.aggregator_target = Some(evt.finalToken.to_string());
                    tx_in.aggregator_target_limit = if evt.amountOutMin.is_zero() {
                        None
                    } else {
                        Some(evt.amountOutMin)
                    };
                }
                _ => {}
            }
        }
        Ok(is_vault_transfer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{LogData, U256};
    use async_trait::async_trait;

    const ROUTER: Address = Address::repeat_byte(0xaa);
    const USDT: Address = Address::repeat_byte(0x01);
    const UNKNOWN_TOKEN: Address = Address::repeat_byte(0x02);

    /// Whitelists USDT (6 decimals) and the native asset.
    struct MockResolver;

    #[async_trait]
    impl AssetResolver for MockResolver {
        async fn get_asset(&self, token_address: &str) -> Result<Asset> {
            if addr_eq(token_address, NATIVE_TOKEN_ADDRESS) {
                return Ok(Asset::new("ETH", "ETH"));
            }
            if addr_eq(token_address, &USDT.to_string()) {
                return Ok(Asset::token("ETH", "USDT", token_address));
            }
            Err(Error::NotWhitelisted(token_address.to_string()))
        }

        async fn token_decimals(&self, token_address: &str) -> u8 {
            if addr_eq(token_address, &USDT.to_string()) {
                6
            } else {
                0
            }
        }

        async fn convert_amount(
            &self,
            token_address: &str,
            amount: U256,
        ) -> Result<U256> {
            let decimals = if addr_eq(token_address, NATIVE_TOKEN_ADDRESS) {
                18
            } else if addr_eq(token_address, &USDT.to_string()) {
                6
            } else {
                return Err(Error::NotWhitelisted(token_address.to_string()));
            };
            Ok(crate::tokens::convert_to_canonical(amount, decimals))
        }
    }

    fn parser() -> SmartContractLogParser {
        SmartContractLogParser::new(
            Box::new(|addr, _| *addr == ROUTER),
            Arc::new(MockResolver),
            Asset::new("ETH", "ETH"),
        )
    }

    fn router_log(data: LogData) -> Log {
        Log {
            inner: alloy::primitives::Log {
                address: ROUTER,
                data,
            },
            ..Default::default()
        }
    }

    fn deposit(to: Address, asset: Address, amount: u64, memo: &str) -> Log {
        let evt = BridgeRouter::Deposit {
            to,
            asset,
            amount: U256::from(amount),
            memo: memo.to_string(),
        };
        router_log(evt.encode_log_data())
    }

    fn allowance(old: Address, new: Address, asset: Address, amount: u64, memo: &str) -> Log {
        let evt = BridgeRouter::TransferAllowance {
            oldVault: old,
            newVault: new,
            asset,
            amount: U256::from(amount),
            memo: memo.to_string(),
        };
        router_log(evt.encode_log_data())
    }

    const USER: Address = Address::repeat_byte(0x55);
    const VAULT_OLD: Address = Address::repeat_byte(0x66);
    const VAULT_NEW: Address = Address::repeat_byte(0x77);

    #[tokio::test]
    async fn deposits_union_coins_under_one_recipient_and_memo() {
        let p = parser();
        let logs = vec![
            deposit(USER, Address::ZERO, 2_000_000_000_000_000_000, "MIGRATE:10"),
            deposit(USER, USDT, 5_000_000, "migrate:10"),
        ];
        let mut tx_in = TxInItem::default();
        let is_vault_transfer = p.get_tx_in_item(&logs, &mut tx_in).await.unwrap();
        assert!(!is_vault_transfer);
        assert!(addr_eq(&tx_in.to, &USER.to_string()));
        assert_eq!(tx_in.coins.len(), 2);
        assert_eq!(tx_in.coins[0].amount, U256::from(200_000_000u64));
        assert_eq!(tx_in.coins[1].amount, U256::from(500_000_000u64));
        assert_eq!(tx_in.coins[1].decimals, 6);
    }

    #[tokio::test]
    async fn conflicting_deposit_recipients_fail_the_tx() {
        let p = parser();
        let logs = vec![
            deposit(USER, Address::ZERO, 100, "MIGRATE:10"),
            deposit(VAULT_NEW, Address::ZERO, 100, "MIGRATE:10"),
        ];
        let mut tx_in = TxInItem::default();
        let err = p.get_tx_in_item(&logs, &mut tx_in).await.unwrap_err();
        assert!(matches!(err, Error::InvalidEventSequence(_)));
    }

    #[tokio::test]
    async fn conflicting_deposit_memos_fail_the_tx() {
        let p = parser();
        let logs = vec![
            deposit(USER, Address::ZERO, 100, "MIGRATE:10"),
            deposit(USER, Address::ZERO, 100, "MIGRATE:11"),
        ];
        let mut tx_in = TxInItem::default();
        assert!(p.get_tx_in_item(&logs, &mut tx_in).await.is_err());
    }

    #[tokio::test]
    async fn zero_amount_and_unwhitelisted_deposits_are_ignored() {
        let p = parser();
        let logs = vec![
            deposit(USER, Address::ZERO, 0, "MIGRATE:10"),
            deposit(USER, UNKNOWN_TOKEN, 500, "MIGRATE:10"),
        ];
        let mut tx_in = TxInItem::default();
        let is_vault_transfer = p.get_tx_in_item(&logs, &mut tx_in).await.unwrap();
        assert!(!is_vault_transfer);
        assert!(tx_in.coins.is_empty());
        // Neither event established recipient or memo.
        assert!(tx_in.to.is_empty());
        assert!(tx_in.memo.is_empty());
    }

    #[tokio::test]
    async fn events_from_foreign_contracts_are_ignored() {
        let p = parser();
        let evt = BridgeRouter::Deposit {
            to: USER,
            asset: Address::ZERO,
            amount: U256::from(100u64),
            memo: "MIGRATE:10".to_string(),
        };
        let log = Log {
            inner: alloy::primitives::Log {
                address: Address::repeat_byte(0xee),
                data: evt.encode_log_data(),
            },
            ..Default::default()
        };
        let mut tx_in = TxInItem::default();
        p.get_tx_in_item(&[log], &mut tx_in).await.unwrap();
        assert!(tx_in.coins.is_empty());
    }

    #[tokio::test]
    async fn transfer_out_replaces_coins_and_exits_early() {
        let p = parser();
        let out = BridgeRouter::TransferOut {
            vault: VAULT_OLD,
            to: USER,
            asset: Address::ZERO,
            amount: U256::from(3_000_000_000_000_000_000u128),
            memo: "OUT:abc".to_string(),
        };
        let logs = vec![
            deposit(VAULT_NEW, USDT, 5_000_000, "OUT:abc"),
            router_log(out.encode_log_data()),
            // Anything after the transfer out must not be folded in.
            deposit(USER, USDT, 9_000_000, "OUT:zzz"),
        ];
        let mut tx_in = TxInItem::default();
        let is_vault_transfer = p.get_tx_in_item(&logs, &mut tx_in).await.unwrap();
        assert!(!is_vault_transfer);
        assert!(addr_eq(&tx_in.to, &USER.to_string()));
        assert_eq!(tx_in.coins.len(), 1);
        assert_eq!(tx_in.coins[0].amount, U256::from(300_000_000u64));
    }

    #[tokio::test]
    async fn transfer_out_with_unknown_asset_is_a_hard_error() {
        let p = parser();
        let out = BridgeRouter::TransferOut {
            vault: VAULT_OLD,
            to: USER,
            asset: UNKNOWN_TOKEN,
            amount: U256::from(100u64),
            memo: "OUT:abc".to_string(),
        };
        let mut tx_in = TxInItem::default();
        assert!(p
            .get_tx_in_item(&[router_log(out.encode_log_data())], &mut tx_in)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn transfer_out_with_non_outbound_memo_is_skipped() {
        let p = parser();
        let out = BridgeRouter::TransferOut {
            vault: VAULT_OLD,
            to: USER,
            asset: Address::ZERO,
            amount: U256::from(100u64),
            memo: "VAULT-:9".to_string(),
        };
        let mut tx_in = TxInItem::default();
        p.get_tx_in_item(&[router_log(out.encode_log_data())], &mut tx_in)
            .await
            .unwrap();
        assert!(tx_in.coins.is_empty());
    }

    #[tokio::test]
    async fn allowance_then_conflicting_deposit_fails_the_tx() {
        let p = parser();
        let logs = vec![
            allowance(VAULT_OLD, VAULT_NEW, USDT, 5_000_000, "MIGRATE:10"),
            deposit(USER, USDT, 5_000_000, "MIGRATE:10"),
        ];
        let mut tx_in = TxInItem::default();
        tx_in.sender = VAULT_OLD.to_string();
        // The allowance set `to` to the new vault; the forged deposit then
        // disagrees on recipient, failing the whole transaction.
        let err = p.get_tx_in_item(&logs, &mut tx_in).await.unwrap_err();
        assert!(matches!(err, Error::InvalidEventSequence(_)));
    }

    #[tokio::test]
    async fn deposit_then_conflicting_allowance_only_ignores_the_allowance() {
        let p = parser();
        let logs = vec![
            deposit(USER, USDT, 5_000_000, "MIGRATE:10"),
            allowance(VAULT_OLD, VAULT_NEW, USDT, 7_000_000, "MIGRATE:10"),
        ];
        let mut tx_in = TxInItem::default();
        tx_in.sender = VAULT_OLD.to_string();
        let is_vault_transfer = p.get_tx_in_item(&logs, &mut tx_in).await.unwrap();
        assert!(!is_vault_transfer);
        assert!(addr_eq(&tx_in.to, &USER.to_string()));
        assert_eq!(tx_in.coins.len(), 1);
        assert_eq!(tx_in.coins[0].amount, U256::from(500_000_000u64));
    }

    #[tokio::test]
    async fn allowance_from_wrong_sender_is_ignored() {
        let p = parser();
        let logs = vec![allowance(VAULT_OLD, VAULT_NEW, USDT, 5_000_000, "MIGRATE:10")];
        let mut tx_in = TxInItem::default();
        tx_in.sender = USER.to_string();
        p.get_tx_in_item(&logs, &mut tx_in).await.unwrap();
        assert!(tx_in.coins.is_empty());
    }

    #[tokio::test]
    async fn vault_transfer_resolves_coins_individually() {
        let p = parser();
        let evt = BridgeRouter::VaultTransfer {
            oldVault: VAULT_OLD,
            newVault: VAULT_NEW,
            coins: vec![
                BridgeRouter::Coin {
                    asset: USDT,
                    amount: U256::from(5_000_000u64),
                },
                BridgeRouter::Coin {
                    asset: UNKNOWN_TOKEN,
                    amount: U256::from(123u64),
                },
            ],
            memo: "VAULT-:42".to_string(),
        };
        let mut tx_in = TxInItem::default();
        tx_in.sender = VAULT_OLD.to_string();
        let is_vault_transfer = p
            .get_tx_in_item(&[router_log(evt.encode_log_data())], &mut tx_in)
            .await
            .unwrap();
        assert!(is_vault_transfer);
        assert!(addr_eq(&tx_in.to, &VAULT_NEW.to_string()));
        // The unknown token coin is dropped, the whitelisted one survives.
        assert_eq!(tx_in.coins.len(), 1);
        assert_eq!(tx_in.coins[0].amount, U256::from(500_000_000u64));
    }

    #[tokio::test]
    async fn vault_transfer_with_non_return_memo_is_ignored() {
        let p = parser();
        let evt = BridgeRouter::VaultTransfer {
            oldVault: VAULT_OLD,
            newVault: VAULT_NEW,
            coins: vec![],
            memo: "MIGRATE:42".to_string(),
        };
        let mut tx_in = TxInItem::default();
        tx_in.sender = VAULT_OLD.to_string();
        let is_vault_transfer = p
            .get_tx_in_item(&[router_log(evt.encode_log_data())], &mut tx_in)
            .await
            .unwrap();
        assert!(!is_vault_transfer);
    }

    #[tokio::test]
    async fn transfer_out_and_call_populates_aggregator_fields() {
        let p = parser();
        let aggregator = Address::repeat_byte(0x33);
        let final_token = Address::repeat_byte(0x44);
        let evt = BridgeRouter::TransferOutAndCall {
            vault: VAULT_OLD,
            target: aggregator,
            amount: U256::from(1_000_000_000_000_000_000u128),
            finalToken: final_token,
            to: USER,
            amountOutMin: U256::from(777u64),
            memo: "OUT:abc".to_string(),
        };
        let mut tx_in = TxInItem::default();
        p.get_tx_in_item(&[router_log(evt.encode_log_data())], &mut tx_in)
            .await
            .unwrap();
        assert!(addr_eq(&tx_in.sender, &VAULT_OLD.to_string()));
        assert!(addr_eq(&tx_in.to, &USER.to_string()));
        assert!(addr_eq(tx_in.aggregator.as_ref().unwrap(), &aggregator.to_string()));
        assert!(addr_eq(
            tx_in.aggregator_target.as_ref().unwrap(),
            &final_token.to_string()
        ));
        assert_eq!(tx_in.aggregator_target_limit, Some(U256::from(777u64)));
        assert_eq!(tx_in.coins.len(), 1);
        assert_eq!(tx_in.coins[0].amount, U256::from(100_000_000u64));
    }

    #[tokio::test]
    async fn transfer_out_and_call_zero_limit_is_omitted() {
        let p = parser();
        let evt = BridgeRouter::TransferOutAndCall {
            vault: VAULT_OLD,
            target: Address::repeat_byte(0x33),
            amount: U256::from(1_000_000_000_000_000_000u128),
            finalToken: Address::repeat_byte(0x44),
            to: USER,
            amountOutMin: U256::ZERO,
            memo: "OUT:abc".to_string(),
        };
        let mut tx_in = TxInItem::default();
        p.get_tx_in_item(&[router_log(evt.encode_log_data())], &mut tx_in)
            .await
            .unwrap();
        assert_eq!(tx_in.aggregator_target_limit, None);
    }
}
