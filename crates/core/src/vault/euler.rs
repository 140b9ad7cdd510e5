//! Euler-backed collateral vault adapter.
//!
//! The vault's collateral lives as shares of an ERC-4626 vault; prices are
//! quoted through the protocol's oracle router in the intermediate vault's
//! unit of account, and debt is read from the target vault's
//! `accountLiquidity` view.

use alloy::network::TransactionBuilder;
use alloy::primitives::{Address, Bytes, I256, U256};
use alloy::providers::Provider;
use alloy::rpc::types::TransactionRequest;
use alloy::sol_types::SolCall;
use anyhow::Context;
use tracing::{debug, error, info, warn};

use liquidator_api::SwapQuoteClient;
use liquidator_chain::contracts::{
    ICollateralVault, IEVault, IOracleRouter, IVaultLiquidator, IVaultManager,
};

use super::{
    clamp_profit, min_return_shortfall, soft_liquidation_check, LiquidationCheck, Protocol,
    SimulatedLiquidation, VaultDeps, VaultState,
};
use crate::error::LiquidationError;

const MAX_LTV_FACTOR: u64 = 10_000;

pub struct EulerVault {
    pub(crate) state: VaultState,
    pub(crate) deps: VaultDeps,
    /// ERC-4626 vault holding the collateral shares.
    pub asset_address: Address,
    pub underlying_asset_address: Address,
    pub target_vault: Address,
    pub vault_manager: Address,
    pub oracle_router: Address,
    /// Quote denomination for the oracle router.
    pub unit_of_account: Address,
}

impl EulerVault {
    /// Discover the vault's contract graph and build the adapter.
    pub(crate) async fn connect(address: Address, deps: VaultDeps) -> anyhow::Result<Self> {
        let provider = deps.rpc.provider();
        let vault = ICollateralVault::new(address, &provider);

        let asset_address = vault.asset().call().await.context("asset()")?._0;
        let asset = IEVault::new(asset_address, &provider);
        let underlying_asset_address = asset.asset().call().await.context("underlying asset()")?._0;
        let underlying_asset_symbol = asset.symbol().call().await.context("symbol()")?._0;

        let target_asset = vault.targetAsset().call().await.context("targetAsset()")?._0;
        let target_vault = vault.targetVault().call().await.context("targetVault()")?._0;

        let intermediate_vault =
            vault.intermediateVault().call().await.context("intermediateVault()")?._0;
        let unit_of_account = IEVault::new(intermediate_vault, &provider)
            .unitOfAccount()
            .call()
            .await
            .context("unitOfAccount()")?
            ._0;

        let vault_manager =
            vault.twyneVaultManager().call().await.context("twyneVaultManager()")?._0;
        let oracle_router = IVaultManager::new(vault_manager, &provider)
            .oracleRouter()
            .call()
            .await
            .context("oracleRouter()")?
            ._0;

        let balance_of = vault.balanceOf(address).call().await.context("balanceOf()")?._0;

        let mut state = VaultState::new(address, Protocol::Euler, deps.config.chain_id);
        state.underlying_asset_symbol = underlying_asset_symbol;
        state.target_asset = target_asset;
        state.balance_of = balance_of;

        Ok(Self {
            state,
            deps,
            asset_address,
            underlying_asset_address,
            target_vault,
            vault_manager,
            oracle_router,
            unit_of_account,
        })
    }

    /// Collateral shares reserved for the borrower, from the current
    /// position value and debt.
    async fn collateral_for_borrower(&self) -> anyhow::Result<U256> {
        let provider = self.deps.rpc.provider();
        let vault = ICollateralVault::new(self.state.address, &provider);
        let oracle = IOracleRouter::new(self.oracle_router, &provider);

        let c_native = vault.balanceOf(self.state.address).call().await?._0;
        let c_usd = oracle
            .getQuote(c_native, self.asset_address, self.unit_of_account)
            .call()
            .await?
            ._0;
        let b_usd = IEVault::new(self.target_vault, &provider)
            .accountLiquidity(self.state.address, true)
            .call()
            .await?
            .liabilityValue;
        let c_for_b = vault.collateralForBorrower(b_usd, c_usd).call().await?._0;

        debug!(
            vault = %self.state.address,
            c_native = %c_native,
            c_usd = %c_usd,
            b_usd = %b_usd,
            c_for_b = %c_for_b,
            "collateral_for_borrower"
        );
        Ok(c_for_b)
    }

    /// Simulate a liquidation of this vault.
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
        if check.externally_liquidated && check.max_release.is_zero() {
            info!(vault = %address, "Externally liquidated with no credit reserved, skipping");
            return Ok(None);
        }
        let Some(seized) = check.total_assets.checked_sub(check.max_release) else {
            info!(vault = %address, "No collateral seized, skipping");
            return Ok(None);
        };
        if seized.is_zero() {
            info!(vault = %address, "No collateral seized, skipping");
            return Ok(None);
        }

        let provider = self.deps.rpc.provider();
        let collateral_value = IOracleRouter::new(self.oracle_router, &provider)
            .getQuote(seized, self.asset_address, self.unit_of_account)
            .call()
            .await
            .map_err(|e| anyhow::Error::from(e).context("collateral quote"))?
            ._0;
        let debt_value = IEVault::new(self.target_vault, &provider)
            .accountLiquidity(address, true)
            .call()
            .await
            .map_err(|e| anyhow::Error::from(e).context("accountLiquidity"))?
            .liabilityValue;

        let profit = if check.externally_liquidated {
            self.external_profit(&check, debt_value).await?
        } else {
            to_signed(collateral_value, address)? - to_signed(debt_value, address)?
        };

        if profit <= I256::ZERO && !check.externally_liquidated {
            info!(vault = %address, profit = %profit, "No gross profit, skipping");
            return Ok(None);
        }

        info!(
            vault = %address,
            seized = %seized,
            collateral_value = %collateral_value,
            debt_value = %debt_value,
            profit = %profit,
            "Gross profit computed"
        );

        self.build_liquidation(profit).await
    }

    /// Profit of redeeming an externally-liquidated position: the
    /// liquidator's reward shares valued through the oracle, less the debt.
    async fn external_profit(
        &self,
        check: &LiquidationCheck,
        debt_value: U256,
    ) -> Result<I256, LiquidationError> {
        let address = self.state.address;
        let provider = self.deps.rpc.provider();
        let oracle = IOracleRouter::new(self.oracle_router, &provider);

        let reward_shares = self.liquidator_reward_shares(check, debt_value).await?;
        let reward_usd = oracle
            .getQuote(reward_shares, self.asset_address, self.unit_of_account)
            .call()
            .await
            .map_err(|e| anyhow::Error::from(e).context("reward quote"))?
            ._0;

        let profit = to_signed(reward_usd, address)? - to_signed(debt_value, address)?;
        info!(
            vault = %address,
            reward_shares = %reward_shares,
            reward_usd = %reward_usd,
            debt_value = %debt_value,
            profit = %profit,
            "External liquidation profit"
        );
        Ok(profit)
    }

    /// Shares left for the liquidator after the borrower's claim on the
    /// post-release collateral.
    async fn liquidator_reward_shares(
        &self,
        check: &LiquidationCheck,
        debt_value: U256,
    ) -> Result<U256, LiquidationError> {
        let address = self.state.address;
        let provider = self.deps.rpc.provider();
        let vault = ICollateralVault::new(address, &provider);
        let oracle = IOracleRouter::new(self.oracle_router, &provider);
        let asset = IEVault::new(self.asset_address, &provider);

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

        let user_collateral_underlying = oracle
            .getQuote(
                check.max_repay * U256::from(MAX_LTV_FACTOR) / max_ltv,
                self.state.target_asset,
                self.underlying_asset_address,
            )
            .call()
            .await
            .map_err(|e| anyhow::Error::from(e).context("user collateral quote"))?
            ._0;

        let collateral_balance = asset
            .balanceOf(address)
            .call()
            .await
            .map_err(|e| anyhow::Error::from(e).context("collateral balance"))?
            ._0;
        let user_collateral = collateral_balance.min(
            asset
                .convertToShares(user_collateral_underlying)
                .call()
                .await
                .map_err(|e| anyhow::Error::from(e).context("convertToShares"))?
                ._0,
        );

        let release_amount = (collateral_balance - user_collateral).min(check.max_release);
        let c_new = collateral_balance - release_amount;
        let c_new_usd = oracle
            .getQuote(c_new, self.asset_address, self.unit_of_account)
            .call()
            .await
            .map_err(|e| anyhow::Error::from(e).context("post-release quote"))?
            ._0;
        let borrower_claim = vault
            .collateralForBorrower(debt_value, c_new_usd)
            .call()
            .await
            .map_err(|e| anyhow::Error::from(e).context("collateralForBorrower"))?
            ._0;

        Ok(c_new.saturating_sub(borrower_claim))
    }

    /// Underlying amount to swap into the repayment asset.
    async fn swap_amount(&self, check: &LiquidationCheck) -> Result<I256, LiquidationError> {
        let address = self.state.address;
        let provider = self.deps.rpc.provider();
        let asset = IEVault::new(self.asset_address, &provider);

        if check.can_liquidate {
            let c_for_b = self
                .collateral_for_borrower()
                .await
                .map_err(LiquidationError::Rpc)?;
            let user_owned = check.total_assets.saturating_sub(check.max_release);
            let user_owned_underlying = asset
                .convertToAssets(user_owned)
                .call()
                .await
                .map_err(|e| anyhow::Error::from(e).context("convertToAssets"))?
                ._0;
            let c_for_b_underlying = asset
                .previewMint(c_for_b)
                .call()
                .await
                .map_err(|e| anyhow::Error::from(e).context("previewMint"))?
                ._0;
            // 10bp margin against swap rounding.
            let safety_margin = c_for_b_underlying / U256::from(1000u64);
            return Ok(to_signed(user_owned_underlying, address)?
                - to_signed(c_for_b_underlying, address)?
                - to_signed(safety_margin, address)?);
        }

        if check.externally_liquidated {
            if check.max_repay.is_zero() {
                info!(vault = %address, "External liquidation with zero repay, no swap needed");
                return Ok(I256::ZERO);
            }

            let debt_value = IEVault::new(self.target_vault, &provider)
                .accountLiquidity(address, true)
                .call()
                .await
                .map_err(|e| anyhow::Error::from(e).context("accountLiquidity"))?
                .liabilityValue;
            let reward_shares = self.liquidator_reward_shares(check, debt_value).await?;
            let amount = asset
                .convertToAssets(reward_shares)
                .call()
                .await
                .map_err(|e| anyhow::Error::from(e).context("reward convertToAssets"))?
                ._0;
            info!(vault = %address, amount = %amount, "External liquidation swap amount");
            return to_signed(amount, address);
        }

        Ok(I256::ZERO)
    }

    /// Build the liquidation transaction, estimate gas, and settle net
    /// profit. Returns `None` whenever a guard aborts the opportunity.
    async fn build_liquidation(
        &mut self,
        gross_profit: I256,
    ) -> Result<Option<SimulatedLiquidation>, LiquidationError> {
        let address = self.state.address;
        let config = self.deps.config.clone();

        let gas_price = self
            .deps
            .sender
            .suggested_gas_price()
            .await
            .map_err(LiquidationError::Rpc)?;
        let nonce = self.deps.sender.next_nonce().await.map_err(LiquidationError::Rpc)?;

        // State may have moved since the profit computation.
        let check = soft_liquidation_check(&self.deps.rpc, address).await;

        let amount_in_underlying = self.swap_amount(&check).await?;
        let swap_data: Bytes = if amount_in_underlying <= I256::ZERO {
            debug!(vault = %address, amount = %amount_in_underlying, "No swap needed");
            Bytes::new()
        } else {
            let slippage = SwapQuoteClient::slippage_for(check.externally_liquidated);
            // A swap-API failure is not an error signal, just no
            // opportunity this pass.
            match self
                .deps
                .swap
                .swap_transaction(
                    self.underlying_asset_address,
                    self.state.target_asset,
                    amount_in_underlying.into_raw(),
                    check.externally_liquidated,
                    slippage,
                    config.euler_liquidator,
                )
                .await
            {
                Ok(Some(tx)) => tx.data,
                Ok(None) => return Ok(None),
                Err(e) => {
                    error!(vault = %address, error = %e, "Swap quote failed, skipping");
                    return Ok(None);
                }
            }
        };

        // The swap must produce at least the repayment the vault demands.
        if check.externally_liquidated && !check.max_repay.is_zero() {
            if let Some(shortfall) = min_return_shortfall(&swap_data, check.max_repay) {
                warn!(
                    vault = %address,
                    max_repay = %check.max_repay,
                    shortfall = %shortfall,
                    "Unprofitable external liquidation, swap returns too little"
                );
                return Ok(None);
            }
        }

        let calldata: Bytes = if check.can_liquidate {
            let c_for_b = self
                .collateral_for_borrower()
                .await
                .map_err(LiquidationError::Rpc)?;
            let provider = self.deps.rpc.provider();
            let c_for_b_underlying = IEVault::new(self.asset_address, &provider)
                .previewMint(c_for_b)
                .call()
                .await
                .map_err(|e| anyhow::Error::from(e).context("previewMint"))?
                ._0;
            let collateral_flash_amount = c_for_b_underlying * U256::from(3u64);

            info!(
                vault = %address,
                flash_amount = %collateral_flash_amount,
                swap_bytes = swap_data.len(),
                "Building internal liquidation tx"
            );

            IVaultLiquidator::liquidateCollateralVaultCall {
                collateralVault: address,
                collateralFlashAmount: collateral_flash_amount,
                swapData: swap_data,
                mode: U256::from(1u64),
            }
            .abi_encode()
            .into()
        } else {
            info!(vault = %address, swap_bytes = swap_data.len(), "Building external liquidation tx");
            IVaultLiquidator::liquidateExtLiquidatedCollateralVaultCall {
                collateralVault: address,
                swapData: swap_data,
                mode: U256::ZERO,
            }
            .abi_encode()
            .into()
        };

        let mut tx = TransactionRequest::default()
            .with_from(self.deps.sender.address)
            .with_to(config.euler_liquidator)
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
            // Still submitted: clearing external-liquidation dust beats
            // leaving it on the books.
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
