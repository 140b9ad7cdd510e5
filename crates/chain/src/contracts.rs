//! Contract interfaces for the collateral-vault protocol stack.
//!
//! All bindings are inline `sol!` definitions with `#[sol(rpc)]` so call
//! sites get typed contract calls against any provider. The collateral vault
//! interface is the superset of both backing protocols: `aToken()` only
//! exists on Aave-backed vaults and doubles as the protocol detection probe.

use alloy::sol;

sol! {
    /// Collateral vault (superset of the Euler- and Aave-backed variants).
    #[sol(rpc)]
    interface ICollateralVault {
        function canLiquidate() external view returns (bool);
        function isExternallyLiquidated() external view returns (bool);
        function maxRelease() external view returns (uint256);
        function maxRepay() external view returns (uint256);
        function totalAssetsDepositedOrReserved() external view returns (uint256);
        function convertToAssets(uint256 shares) external view returns (uint256);
        function collateralForBorrower(uint256 liabilityValue, uint256 collateralValue) external view returns (uint256);
        function balanceOf(address account) external view returns (uint256);
        function asset() external view returns (address);
        function underlyingAsset() external view returns (address);
        function targetAsset() external view returns (address);
        function targetVault() external view returns (address);
        function intermediateVault() external view returns (address);
        function twyneVaultManager() external view returns (address);
        function name() external view returns (string);
        function symbol() external view returns (string);

        // Aave-backed vaults only; reverts on Euler-backed vaults.
        function aToken() external view returns (address);
    }

    /// ERC-4626 vault on the backing Euler deployment.
    #[sol(rpc)]
    interface IEVault {
        function asset() external view returns (address);
        function symbol() external view returns (string);
        function unitOfAccount() external view returns (address);
        function balanceOf(address account) external view returns (uint256);
        function convertToAssets(uint256 shares) external view returns (uint256);
        function convertToShares(uint256 assets) external view returns (uint256);
        function previewMint(uint256 shares) external view returns (uint256);
        function accountLiquidity(address account, bool liquidation) external view returns (uint256 collateralValue, uint256 liabilityValue);
    }

    /// Health-state viewer: both health factors plus liability values,
    /// 1e18-scaled. Values may be negative for broken positions.
    #[sol(rpc)]
    interface IHealthStatViewer {
        function health(address account) external view returns (int256 externalHF, int256 internalHF, int256 externalLiabilityValue, int256 internalLiabilityValue);
    }

    /// Vault manager holding per-asset LTV limits and the oracle router.
    #[sol(rpc)]
    interface IVaultManager {
        function maxTwyneLTVs(address asset) external view returns (uint256);
        function oracleRouter() external view returns (address);
    }

    /// Euler oracle router.
    #[sol(rpc)]
    interface IOracleRouter {
        function getQuote(uint256 inAmount, address base, address quote) external view returns (uint256);
    }

    /// Aave V3 pool (subset used by the Aave-backed adapter).
    #[sol(rpc)]
    interface IAavePool {
        function getUserAccountData(address user) external view returns (
            uint256 totalCollateralBase,
            uint256 totalDebtBase,
            uint256 availableBorrowsBase,
            uint256 currentLiquidationThreshold,
            uint256 ltv,
            uint256 healthFactor
        );
    }

    /// AaveV3 aToken wrapper: ERC-4626 conversions plus its own price feed.
    #[sol(rpc)]
    interface IATokenWrapper {
        function latestAnswer() external view returns (int256);
        function decimals() external view returns (uint8);
        function balanceOf(address account) external view returns (uint256);
        function convertToAssets(uint256 shares) external view returns (uint256);
        function convertToShares(uint256 assets) external view returns (uint256);
        function previewMint(uint256 shares) external view returns (uint256);
    }

    /// On-chain liquidator executor contract.
    #[sol(rpc)]
    interface IVaultLiquidator {
        function liquidateCollateralVault(address collateralVault, uint256 collateralFlashAmount, bytes swapData, uint256 mode) external;
        function liquidateExtLiquidatedCollateralVault(address collateralVault, bytes swapData, uint256 mode) external;
    }

    /// Vault factory. A single factory creates vaults for every backing
    /// protocol; the event carries no protocol tag.
    #[sol(rpc)]
    interface IVaultFactory {
        event T_CollateralVaultCreated(address indexed vault, address indexed creator);
    }

    /// Ethereum Vault Connector (account owner resolution for spy links).
    #[sol(rpc)]
    interface IEvc {
        function getAccountOwner(address account) external view returns (address);
    }

    /// Minimal ERC20.
    #[sol(rpc)]
    interface IERC20 {
        function symbol() external view returns (string);
        function decimals() external view returns (uint8);
        function balanceOf(address account) external view returns (uint256);
        function allowance(address owner, address spender) external view returns (uint256);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{Address, Bytes, B256, U256};
    use alloy::sol_types::{SolCall, SolEvent};

    #[test]
    fn liquidate_calls_encode() {
        let call = IVaultLiquidator::liquidateCollateralVaultCall {
            collateralVault: Address::repeat_byte(1),
            collateralFlashAmount: U256::from(1000u64),
            swapData: Bytes::from(vec![1, 2, 3]),
            mode: U256::from(1u64),
        };
        assert!(!call.abi_encode().is_empty());

        let call = IVaultLiquidator::liquidateExtLiquidatedCollateralVaultCall {
            collateralVault: Address::repeat_byte(1),
            swapData: Bytes::new(),
            mode: U256::ZERO,
        };
        assert!(!call.abi_encode().is_empty());
    }

    #[test]
    fn factory_event_has_signature() {
        assert_ne!(IVaultFactory::T_CollateralVaultCreated::SIGNATURE_HASH, B256::ZERO);
    }
}
