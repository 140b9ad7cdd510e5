//! Aave-backed collateral vault adapter.
//!
//! Same pipeline as the Euler variant, but collateral is priced through the
//! aToken wrapper's own feed (`latestAnswer` / `decimals`) and debt comes
//! from the Aave pool's `getUserAccountData` (base-currency units).

use alloy::network::TransactionBuilder;
use alloy::primitives::{Address, Bytes, I256, U256};
use alloy::providers::Provider;
use alloy::rpc::types::TransactionRequest;
use alloy::sol_types::SolCall;
use anyhow::Context;
use tracing::{error, info, warn};

use liquidator_api::SwapQuoteClient;
use liquidator_chain::contracts::{
    IATokenWrapper, IAavePool, ICollateralVault, IERC20, IVaultLiquidator, IVaultManager,
};

use super::{
    clamp_profit, min_return_shortfall, soft_liquidation_check, LiquidationCheck, Protocol,
    SimulatedLiquidation, VaultDeps, VaultState,
};
use crate::error::LiquidationError;

const MAX_LTV_FACTOR: u64 = 10_000;

pub struct AaveVault {
    pub(crate) state: VaultState,
    pub(crate) deps: VaultDeps,
    /// The aToken wrapper holding the collateral shares.
    pub asset_address: Address,
    pub underlying_asset_address: Address,
    pub atoken_address: Address,
    /// For Aave-backed vaults `targetVault()` is the Aave pool.
    pub aave_pool: Address,
    pub vault_manager: Address,
}

impl AaveVault {
    pub(crate) async fn connect(address: Address, deps: VaultDeps) -> anyhow::Result<Self> {
        let provider = deps.rpc.provider();
        let vault = ICollateralVault::new(address, &provider);

        let asset_address = vault.asset().call().await.context("asset()")?._0;
        let underlying_asset_address =
            vault.underlyingAsset().call().await.context("underlyingAsset()")?._0;
        let atoken_address = vault.aToken().call().await.context("aToken()")?._0;
        let target_asset = vault.targetAsset().call().await.context("targetAsset()")?._0;
        let aave_pool = vault.targetVault().call().await.context("targetVault()")?._0;
        let vault_manager =
            vault.twyneVaultManager().call().await.context("twyneVaultManager()")?._0;
        let balance_of = vault.balanceOf(address).call().await.context("balanceOf()")?._0;

        // The underlying ERC20 symbol, for reports; a failed read leaves it
        // blank rather than mislabeling the position.
        let underlying_asset_symbol = match IERC20::new(underlying_asset_address, &provider)
            .symbol()
            .call()
            .await
        {
            Ok(r) => r._0,
            Err(e) => {
                warn!(vault = %address, error = %e, "Failed to read underlying symbol");
                String::new()
            }
        };

        let mut state = VaultState::new(address, Protocol::Aave, deps.config.chain_id);
        state.underlying_asset_symbol = underlying_asset_symbol;
        state.target_asset = target_asset;
        state.balance_of = balance_of;

        Ok(Self {
            state,
            deps,
            asset_address,
            underlying_asset_address,
            atoken_address,
            aave_pool,
            vault_manager,
        })
    }

    /// Wrapper feed price and its decimals.
    async fn wrapper_price(&self) -> Result<(U256, u8), LiquidationError> {
        let provider = self.deps.rpc.provider();
        let wrapper = IATokenWrapper::new(self.asset_address, &provider);
        let answer = wrapper
            .latestAnswer()
            .call()
            .await
            .map_err(|e| anyhow::Error::from(e).context("latestAnswer"))?
            ._0;
        if answer.is_negative() || answer.is_zero() {
            return Err(LiquidationError::TransactionBuild {
                vault: self.state.address,
                reason: format!("invalid wrapper price: {answer}"),
            });
        }
        let decimals = wrapper
            .decimals()
            .call()
            .await
            .map_err(|e| anyhow::Error::from(e).context("decimals"))?
            ._0;
        Ok((answer.into_raw(), decimals))
    }

    /// Base-currency value of a share amount at the wrapper price.
    fn to_base_value(amount: U256, answer: U256, decimals: u8) -> U256 {
        amount * answer / U256::from(10u64).pow(U256::from(decimals))
    }

    /// Total debt in the pool's base currency.
    async fn pool_debt(&self) -> Result<U256, LiquidationError> {
        let provider = self.deps.rpc.provider();
        let data = IAavePool::new(self.aave_pool, &provider)
            .getUserAccountData(self.state.address)
            .call()
            .await
            .map_err(|e| anyhow::Error::from(e).context("getUserAccountData"))?;
        Ok(data.totalDebtBase)
    }

    async fn collateral_for_borrower(
        &self,
        check: &LiquidationCheck,
    ) -> Result<U256, LiquidationError> {
        let provider = self.deps.rpc.provider();
        let vault = ICollateralVault::new(self.state.address, &provider);

        let debt = self.pool_debt().await?;
        let user_owned = check.total_assets.saturating_sub(check.max_release);
        let (answer, decimals) = self.wrapper_price().await?;
        let collateral_value = Self::to_base_value(user_owned, answer, decimals);

        let c_for_b = vault
            .collateralForBorrower(debt, collateral_value)
            .call()
            .await
            .map_err(|e| anyhow::Error::from(e).context("collateralForBorrower"))?
            ._0;

        info!(
            vault = %self.state.address,
            debt = %debt,
            collateral_value = %collateral_value,
            c_for_b = %c_for_b,
            "collateral_for_borrower"
        );
        Ok(c_for_b)
    }

    pub(crate) async fn simulate(
        &mut self,
    ) -> Result<Option<SimulatedLiquidation>, LiquidationError> {
        let address = self.state.address;
        let config = self.deps.config.clone();

        if self.state.target_asset == config.usds_address {
            info!(vault = %address, "Skipping position with excluded stablecoin debt");
            return Ok(None);
        }

        let check = soft_liquidation_check(&self.deps.rpc, address).await;
        info!(
            vault = %address,
            can_liquidate = check.can_liquidate,
            externally_liquidated = check.externally_liquidated,
            max_release = %check.max_release,
            max_repay = %check.max_repay,
            total_assets = %check.total_assets,
            "Liquidation check"
        );

        if !check.can_liquidate && !check.externally_liquidated {
            return Ok(None);
        }

        let gas_price = self
            .deps
            .sender
            .suggested_gas_price()
            .await
            .map_err(LiquidationError::Rpc)?;
        let nonce = self.deps.sender.next_nonce().await.map_err(LiquidationError::Rpc)?;

        if check.can_liquidate {
            self.build_internal(&check, gas_price, nonce).await
        } else {
            self.build_external(&check, gas_price, nonce).await
        }
    }

    async fn build_internal(
        &self,
        check: &LiquidationCheck,
        gas_price: u128,
        nonce: u64,
    ) -> Result<Option<SimulatedLiquidation>, LiquidationError> {
        let address = self.state.address;
        let config = &self.deps.config;
        let provider = self.deps.rpc.provider();
        let wrapper = IATokenWrapper::new(self.asset_address, &provider);

        let c_for_b = self.collateral_for_borrower(check).await?;
        let c_for_b_underlying = wrapper
            .previewMint(c_for_b)
            .call()
            .await
            .map_err(|e| anyhow::Error::from(e).context("previewMint"))?
            ._0;
        let collateral_flash_amount = c_for_b_underlying * U256::from(3u64);

        let user_owned = check.total_assets.saturating_sub(check.max_release);
        let remaining_shares = user_owned.saturating_sub(c_for_b);
        let amount_in_underlying = wrapper
            .convertToAssets(remaining_shares)
            .call()
            .await
            .map_err(|e| anyhow::Error::from(e).context("convertToAssets"))?
            ._0;
        // 10bp margin against swap rounding.
        let amount_in_underlying =
            amount_in_underlying.saturating_sub(amount_in_underlying / U256::from(1000u64));

        info!(
            vault = %address,
            c_for_b = %c_for_b,
            flash_amount = %collateral_flash_amount,
            swap_amount = %amount_in_underlying,
            "Internal liquidation amounts"
        );

        if amount_in_underlying.is_zero() {
            warn!(vault = %address, "No underlying to swap after liquidation");
            return Ok(None);
        }

        // Gross profit: seized collateral at the wrapper price less debt.
        let (answer, decimals) = self.wrapper_price().await?;
        let seized_value = Self::to_base_value(user_owned, answer, decimals);
        let debt = self.pool_debt().await?;
        let gross_profit = to_signed(seized_value, address)? - to_signed(debt, address)?;

        // A swap-API failure is not an error signal, just no opportunity
        // this pass.
        let swap_tx = match self
            .deps
            .swap
            .swap_transaction(
                self.underlying_asset_address,
                self.state.target_asset,
                amount_in_underlying,
                false,
                SwapQuoteClient::slippage_for(false),
                config.aave_liquidator,
            )
            .await
        {
            Ok(Some(tx)) => tx,
            Ok(None) => return Ok(None),
            Err(e) => {
                error!(vault = %address, error = %e, "Swap quote failed, skipping");
                return Ok(None);
            }
        };

        let calldata: Bytes = IVaultLiquidator::liquidateCollateralVaultCall {
            collateralVault: address,
            collateralFlashAmount: collateral_flash_amount,
            swapData: swap_tx.data,
            mode: U256::from(1u64),
        }
        .abi_encode()
        .into();

        self.finish(calldata, gross_profit, check, gas_price, nonce).await
    }

    async fn build_external(
        &self,
        check: &LiquidationCheck,
        gas_price: u128,
        nonce: u64,
    ) -> Result<Option<SimulatedLiquidation>, LiquidationError> {
        let address = self.state.address;
        let config = &self.deps.config;
        let provider = self.deps.rpc.provider();
        let wrapper = IATokenWrapper::new(self.asset_address, &provider);
        let vault = ICollateralVault::new(address, &provider);

        if check.max_repay.is_zero() {
            // Zero-repay "clear dust" transaction with empty swap calldata.
            info!(vault = %address, "External liquidation with zero debt");
            let calldata: Bytes = IVaultLiquidator::liquidateExtLiquidatedCollateralVaultCall {
                collateralVault: address,
                swapData: Bytes::new(),
                mode: U256::ZERO,
            }
            .abi_encode()
            .into();
            return self.finish(calldata, I256::ZERO, check, gas_price, nonce).await;
        }

        let collateral_balance = wrapper
            .balanceOf(address)
            .call()
            .await
            .map_err(|e| anyhow::Error::from(e).context("collateral balance"))?
            ._0;
        let max_ltv = IVaultManager::new(self.vault_manager, &provider)
            .maxTwyneLTVs(self.asset_address)
            .call()
            .await
            .map_err(|e| anyhow::Error::from(e).context("maxTwyneLTVs"))?
            ._0;
        if max_ltv.is_zero() {
            return Err(LiquidationError::TransactionBuild {
                vault: address,
                reason: "zero max LTV for collateral asset".into(),
            });
        }

        let (answer, decimals) = self.wrapper_price().await?;

        let user_collateral_value = check.max_repay * U256::from(MAX_LTV_FACTOR) / max_ltv;
        let user_collateral_shares =
            user_collateral_value * U256::from(10u64).pow(U256::from(decimals)) / answer;
        let user_collateral_shares = collateral_balance.min(user_collateral_shares);

        let release_amount =
            (collateral_balance - user_collateral_shares).min(check.max_release);
        let c_new = collateral_balance - release_amount;
        let c_new_value = Self::to_base_value(c_new, answer, decimals);

        let debt = self.pool_debt().await?;
        let borrower_claim = vault
            .collateralForBorrower(debt, c_new_value)
            .call()
            .await
            .map_err(|e| anyhow::Error::from(e).context("collateralForBorrower"))?
            ._0;
        let reward_shares = c_new.saturating_sub(borrower_claim);
        let amount_in_underlying = wrapper
            .convertToAssets(reward_shares)
            .call()
            .await
            .map_err(|e| anyhow::Error::from(e).context("reward convertToAssets"))?
            ._0;

        info!(
            vault = %address,
            reward_shares = %reward_shares,
            amount_in_underlying = %amount_in_underlying,
            "External liquidation amounts"
        );

        if amount_in_underlying.is_zero() {
            warn!(vault = %address, "No underlying to swap");
            return Ok(None);
        }

        let reward_value = Self::to_base_value(reward_shares, answer, decimals);
        let gross_profit = to_signed(reward_value, address)? - to_signed(debt, address)?;

        let swap_tx = match self
            .deps
            .swap
            .swap_transaction(
                self.underlying_asset_address,
                self.state.target_asset,
                amount_in_underlying,
                true,
                SwapQuoteClient::slippage_for(true),
                config.aave_liquidator,
            )
            .await
        {
            Ok(Some(tx)) => tx,
            Ok(None) => return Ok(None),
            Err(e) => {
                error!(vault = %address, error = %e, "Swap quote failed, skipping");
                return Ok(None);
            }
        };

        if let Some(shortfall) = min_return_shortfall(&swap_tx.data, check.max_repay) {
            warn!(
                vault = %address,
                max_repay = %check.max_repay,
                shortfall = %shortfall,
                "Unprofitable external liquidation, swap returns too little"
            );
            return Ok(None);
        }

        let calldata: Bytes = IVaultLiquidator::liquidateExtLiquidatedCollateralVaultCall {
            collateralVault: address,
            swapData: swap_tx.data,
            mode: U256::ZERO,
        }
        .abi_encode()
        .into();

        self.finish(calldata, gross_profit, check, gas_price, nonce).await
    }

    /// Common tail: gas-estimate the call and apply the net-profit rules.
    async fn finish(
        &self,
        calldata: Bytes,
        gross_profit: I256,
        check: &LiquidationCheck,
        gas_price: u128,
        nonce: u64,
    ) -> Result<Option<SimulatedLiquidation>, LiquidationError> {
        let address = self.state.address;
        let config = &self.deps.config;

        let mut tx = TransactionRequest::default()
            .with_from(self.deps.sender.address)
            .with_to(config.aave_liquidator)
            .with_input(calldata)
            .with_gas_price(gas_price)
            .with_nonce(nonce)
            .with_chain_id(config.chain_id);

        let provider = self.deps.rpc.provider();
        let estimated_gas = provider
            .estimate_gas(tx.clone())
            .await
            .map_err(|e| LiquidationError::TransactionBuild {
                vault: address,
                reason: format!("gas estimation failed: {e}"),
            })?
            * 2;
        tx.set_gas_limit(estimated_gas);

        let gas_cost = U256::from(estimated_gas) * U256::from(gas_price);
        let mut net_profit = gross_profit - to_signed(gas_cost, address)?;

        info!(
            vault = %address,
            estimated_gas,
            gas_price,
            gross_profit = %gross_profit,
            net_profit = %net_profit,
            "Gas estimate"
        );

        if net_profit <= I256::ZERO && check.can_liquidate {
            info!(vault = %address, "No profit after gas costs, skipping");
            return Ok(None);
        }
        if net_profit < I256::ZERO && check.externally_liquidated {
            net_profit = I256::ZERO;
        }

        Ok(Some(SimulatedLiquidation {
            tx,
            net_profit: clamp_profit(net_profit),
            collateral_vault: address,
            collateral_asset: self.underlying_asset_address,
            max_repay: check.max_repay,
            internal: check.can_liquidate,
        }))
    }
}

fn to_signed(value: U256, vault: Address) -> Result<I256, LiquidationError> {
    I256::try_from(value).map_err(|_| LiquidationError::TransactionBuild {
        vault,
        reason: format!("value out of signed range: {value}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_value_scales_by_feed_decimals() {
        // 2.0 shares at price 3000_00000000 with 8 decimals = 6000 base.
        let amount = U256::from(2u64);
        let answer = U256::from(3000_00000000u64);
        let value = AaveVault::to_base_value(amount, answer, 8);
        assert_eq!(value, U256::from(6000u64));
    }

    #[test]
    fn base_value_zero_amount_is_zero() {
        assert_eq!(
            AaveVault::to_base_value(U256::ZERO, U256::from(12345u64), 8),
            U256::ZERO
        );
    }
}
