//! Router and ERC-20 contract ABI definitions.
//!
//! Uses alloy's sol! macro to generate type-safe bindings, including the
//! event signatures the log parser matches on.

#![allow(clippy::too_many_arguments)]

use alloy::sol;

sol! {
    /// Bridge router contract interface. Vaults hold token allowances inside
    /// the router; payouts and vault-management operations all go through it.
    #[sol(rpc)]
    contract BridgeRouter {
        struct Coin {
            address asset;
            uint256 amount;
        }

        /// Inbound deposit into a vault.
        event Deposit(address indexed to, address indexed asset, uint256 amount, string memo);

        /// Outbound payout from a vault to a user.
        event TransferOut(address indexed vault, address indexed to, address asset, uint256 amount, string memo);

        /// Allowance handover between vaults (migration or vault funding).
        event TransferAllowance(address indexed oldVault, address indexed newVault, address asset, uint256 amount, string memo);

        /// Bulk asset return from a retiring vault.
        event VaultTransfer(address indexed oldVault, address indexed newVault, Coin[] coins, string memo);

        /// Payout routed through an external aggregator contract.
        event TransferOutAndCall(address indexed vault, address target, uint256 amount, address finalToken, address to, uint256 amountOutMin, string memo);

        function deposit(address payable vault, address asset, uint256 amount, string memory memo) external payable;

        function transferOut(address payable to, address asset, uint256 amount, string memory memo) external payable;

        function transferOutAndCall(address payable aggregator, address finalToken, address to, uint256 amountOutMin, string memory memo) external payable;

        function transferAllowance(address router, address newVault, address asset, uint256 amount, string memory memo) external;

        function returnVaultAssets(address router, address payable asgard, Coin[] memory coins, string memory memo) external payable;

        /// Token allowance a vault holds inside the router.
        function vaultAllowance(address vault, address token) external view returns (uint256 amount);
    }
}

sol! {
    /// Minimal ERC-20 surface used for token metadata resolution.
    #[sol(rpc)]
    contract Erc20 {
        function symbol() external view returns (string memory);
        function decimals() external view returns (uint8);
    }
}
