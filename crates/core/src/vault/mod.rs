//! Protocol-polymorphic collateral vault adapters.
//!
//! A [`CollateralVault`] wraps one on-chain vault address and exposes the
//! uniform operations the scheduler needs: liquidation checks, health
//! refresh, and liquidation simulation. The two backing protocols are a
//! tagged variant over a shared [`VaultState`]; no shared mutable base
//! state exists outside it.

mod aave;
mod euler;
mod registry;

pub use aave::AaveVault;
pub use euler::EulerVault;
pub use registry::{connect_vault, detect_protocol};

use std::sync::Arc;

use alloy::primitives::{Address, I256, U256};
use alloy::rpc::types::TransactionRequest;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use liquidator_api::SwapQuoteClient;
use liquidator_chain::contracts::{ICollateralVault, IHealthStatViewer};
use liquidator_chain::{RpcEndpoint, TransactionSender};

use crate::cadence::{self, CadenceConfig};
use crate::config::ChainConfig;
use crate::error::LiquidationError;
use crate::state::{now_ms, UnixMillis, VaultSnapshot};
use crate::wad::from_wad;

/// Backing protocol tag, fixed at vault creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Euler,
    Aave,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Euler => write!(f, "euler"),
            Protocol::Aave => write!(f, "aave"),
        }
    }
}

/// Shared per-chain handles the adapters need.
#[derive(Clone)]
pub struct VaultDeps {
    pub config: Arc<ChainConfig>,
    pub rpc: Arc<RpcEndpoint>,
    pub swap: Arc<SwapQuoteClient>,
    pub sender: Arc<TransactionSender>,
}

/// Live state shared by both adapter variants.
#[derive(Debug, Clone)]
pub struct VaultState {
    pub address: Address,
    pub protocol: Protocol,
    pub chain_id: u64,
    /// `+inf` means no debt on that side.
    pub internal_health_score: f64,
    pub external_health_score: f64,
    /// 18-decimal USD units.
    pub internal_value_borrowed: U256,
    pub external_value_borrowed: U256,
    pub balance_of: U256,
    pub underlying_asset_symbol: String,
    pub target_asset: Address,
    pub time_of_next_update: UnixMillis,
}

impl VaultState {
    pub fn new(address: Address, protocol: Protocol, chain_id: u64) -> Self {
        Self {
            address,
            protocol,
            chain_id,
            internal_health_score: f64::INFINITY,
            external_health_score: f64::INFINITY,
            internal_value_borrowed: U256::ZERO,
            external_value_borrowed: U256::ZERO,
            balance_of: U256::ZERO,
            underlying_asset_symbol: String::new(),
            target_asset: Address::ZERO,
            time_of_next_update: now_ms(),
        }
    }

    pub fn total_borrowed(&self) -> U256 {
        self.internal_value_borrowed.saturating_add(self.external_value_borrowed)
    }

    pub fn total_borrowed_usd(&self) -> f64 {
        from_wad(self.total_borrowed())
    }

    pub fn min_health_score(&self) -> f64 {
        self.internal_health_score.min(self.external_health_score)
    }

    /// Recompute `time_of_next_update` from the cadence table.
    ///
    /// An already-scheduled earlier time that is still in the future is
    /// kept; the cadence never pushes a pending check further out.
    pub fn schedule_next_update(
        &mut self,
        cadence: &CadenceConfig,
        externally_liquidated: bool,
    ) -> UnixMillis {
        let mut rng = rand::thread_rng();
        let now = now_ms();

        if self.internal_health_score.is_infinite() && self.external_health_score.is_infinite() {
            let gap = cadence::jittered(cadence.max_update_interval_seconds, &mut rng);
            self.time_of_next_update = now + (gap * 1000.0) as u64;
            return self.time_of_next_update;
        }

        let gap = cadence::check_interval_seconds(
            cadence,
            self.internal_health_score,
            self.external_health_score,
            self.total_borrowed_usd(),
            externally_liquidated,
        );
        let candidate = now + (cadence::jittered(gap, &mut rng) * 1000.0) as u64;

        if !(self.time_of_next_update < candidate && self.time_of_next_update > now) {
            self.time_of_next_update = candidate;
        }
        self.time_of_next_update
    }

    pub fn snapshot(&self) -> VaultSnapshot {
        VaultSnapshot {
            address: self.address,
            protocol: self.protocol,
            time_of_next_update: self.time_of_next_update,
            internal_health_score: self.internal_health_score,
            external_health_score: self.external_health_score,
        }
    }

    /// Restore the checkpointed fields; everything else is refreshed from
    /// the chain on the next `update_liquidity`.
    pub fn apply_snapshot(&mut self, snapshot: &VaultSnapshot) {
        self.time_of_next_update = snapshot.time_of_next_update;
        self.internal_health_score = snapshot.internal_health_score;
        self.external_health_score = snapshot.external_health_score;
    }
}

/// Result of the on-chain liquidation check. RPC-failure defaults mean
/// "unknown, recheck later", never a guarantee of health.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LiquidationCheck {
    pub can_liquidate: bool,
    pub externally_liquidated: bool,
    pub max_release: U256,
    pub max_repay: U256,
    pub total_assets: U256,
}

/// Health refresh outcome.
#[derive(Debug, Clone, Copy)]
pub struct HealthUpdate {
    pub internal_health_score: f64,
    pub external_health_score: f64,
    pub externally_liquidated: bool,
}

/// A built, gas-estimated liquidation transaction with its net profit.
#[derive(Debug, Clone)]
pub struct SimulatedLiquidation {
    pub tx: TransactionRequest,
    /// Net of gas, 18-decimal USD. Clamped to zero for external
    /// liquidations that are submitted at a loss to clear the position.
    pub net_profit: U256,
    pub collateral_vault: Address,
    pub collateral_asset: Address,
    pub max_repay: U256,
    /// True for the `can_liquidate` branch (shorter receipt timeout).
    pub internal: bool,
}

/// One monitored collateral vault.
pub enum CollateralVault {
    Euler(EulerVault),
    Aave(AaveVault),
}

impl CollateralVault {
    pub fn state(&self) -> &VaultState {
        match self {
            CollateralVault::Euler(v) => &v.state,
            CollateralVault::Aave(v) => &v.state,
        }
    }

    pub fn state_mut(&mut self) -> &mut VaultState {
        match self {
            CollateralVault::Euler(v) => &mut v.state,
            CollateralVault::Aave(v) => &mut v.state,
        }
    }

    fn deps(&self) -> &VaultDeps {
        match self {
            CollateralVault::Euler(v) => &v.deps,
            CollateralVault::Aave(v) => &v.deps,
        }
    }

    /// Read the liquidation status. On RPC failure returns the all-false
    /// defaults and leaves rechecking to the next pass.
    pub async fn check_liquidation(&self) -> LiquidationCheck {
        soft_liquidation_check(&self.deps().rpc, self.state().address).await
    }

    /// Refresh health scores and borrowed values from the health-state
    /// viewer and recompute the next check time. Any read failure defaults
    /// both scores to `+inf` and the external flag to false.
    pub async fn update_liquidity(&mut self) -> HealthUpdate {
        let viewer = self.deps().config.health_stat_viewer;
        let rpc = self.deps().rpc.clone();
        let cadence = self.deps().config.cadence.clone();
        let address = self.state().address;

        match read_health(&rpc, viewer, address).await {
            Ok(HealthReading { internal_hs, external_hs, internal_borrowed, external_borrowed }) => {
                let state = self.state_mut();
                state.internal_health_score = internal_hs;
                state.external_health_score = external_hs;
                state.internal_value_borrowed = internal_borrowed;
                state.external_value_borrowed = external_borrowed;
                if internal_hs < 1.0 || external_hs < 1.0 {
                    info!(vault = %address, internal_hs, external_hs, "Vault can be liquidated");
                }
            }
            Err(e) => {
                error!(vault = %address, error = %e, "Health read failed, defaulting scores to infinity");
                let state = self.state_mut();
                state.internal_health_score = f64::INFINITY;
                state.external_health_score = f64::INFINITY;
            }
        }

        let externally_liquidated = read_externally_liquidated(&rpc, address).await;
        self.state_mut().schedule_next_update(&cadence, externally_liquidated);

        let state = self.state();
        HealthUpdate {
            internal_health_score: state.internal_health_score,
            external_health_score: state.external_health_score,
            externally_liquidated,
        }
    }

    /// Simulate a liquidation: compute gross profit, fetch the swap quote,
    /// build and gas-estimate the transaction. `Ok(None)` means no
    /// opportunity; `Err` is recoverable and rate-limited by the caller.
    pub async fn simulate_liquidation(
        &mut self,
    ) -> Result<Option<SimulatedLiquidation>, LiquidationError> {
        match self {
            CollateralVault::Euler(v) => v.simulate().await,
            CollateralVault::Aave(v) => v.simulate().await,
        }
    }
}

pub(crate) struct HealthReading {
    pub internal_hs: f64,
    pub external_hs: f64,
    pub internal_borrowed: U256,
    pub external_borrowed: U256,
}

/// Health viewer read with the sign conventions of the on-chain values:
/// zero liability means infinite health on that side; negative values mean
/// a broken position and read as infinite on both.
pub(crate) async fn read_health(
    rpc: &RpcEndpoint,
    viewer: Address,
    vault: Address,
) -> anyhow::Result<HealthReading> {
    let provider = rpc.provider();
    let result = IHealthStatViewer::new(viewer, &provider).health(vault).call().await?;

    if result.internalLiabilityValue.is_negative() || result.externalLiabilityValue.is_negative() {
        error!(
            vault = %vault,
            internal = %result.internalLiabilityValue,
            external = %result.externalLiabilityValue,
            "Negative liability values"
        );
        return Ok(HealthReading {
            internal_hs: f64::INFINITY,
            external_hs: f64::INFINITY,
            internal_borrowed: U256::ZERO,
            external_borrowed: U256::ZERO,
        });
    }

    let internal_borrowed = result.internalLiabilityValue.into_raw();
    let external_borrowed = result.externalLiabilityValue.into_raw();

    // Zero liability overrides the raw factor before the sign check, so a
    // sentinel value on a debt-free side cannot collapse the other side.
    let internal_zero_debt = internal_borrowed.is_zero();
    let external_zero_debt = external_borrowed.is_zero();

    if (!internal_zero_debt && result.internalHF.is_negative())
        || (!external_zero_debt && result.externalHF.is_negative())
    {
        error!(
            vault = %vault,
            internal = %result.internalHF,
            external = %result.externalHF,
            "Negative health factors"
        );
        return Ok(HealthReading {
            internal_hs: f64::INFINITY,
            external_hs: f64::INFINITY,
            internal_borrowed,
            external_borrowed,
        });
    }

    let internal_hs = if internal_zero_debt {
        f64::INFINITY
    } else {
        from_wad(result.internalHF.into_raw())
    };
    let external_hs = if external_zero_debt {
        f64::INFINITY
    } else {
        from_wad(result.externalHF.into_raw())
    };

    Ok(HealthReading { internal_hs, external_hs, internal_borrowed, external_borrowed })
}

pub(crate) async fn read_liquidation_check(
    rpc: &RpcEndpoint,
    vault: Address,
) -> anyhow::Result<LiquidationCheck> {
    let provider = rpc.provider();
    let instance = ICollateralVault::new(vault, &provider);

    let can_liquidate = instance.canLiquidate().call().await?._0;
    let externally_liquidated = instance.isExternallyLiquidated().call().await?._0;
    let max_release = instance.maxRelease().call().await?._0;
    let max_repay = instance.maxRepay().call().await?._0;
    let total_assets = instance.totalAssetsDepositedOrReserved().call().await?._0;

    Ok(LiquidationCheck { can_liquidate, externally_liquidated, max_release, max_repay, total_assets })
}

/// `isExternallyLiquidated` with a safe false default on failure.
pub(crate) async fn read_externally_liquidated(rpc: &RpcEndpoint, vault: Address) -> bool {
    let provider = rpc.provider();
    match ICollateralVault::new(vault, &provider).isExternallyLiquidated().call().await {
        Ok(r) => r._0,
        Err(e) => {
            error!(vault = %vault, error = %e, "isExternallyLiquidated read failed, assuming false");
            false
        }
    }
}

/// Soft variant of the liquidation check used inside the simulation path.
pub(crate) async fn soft_liquidation_check(rpc: &RpcEndpoint, vault: Address) -> LiquidationCheck {
    match read_liquidation_check(rpc, vault).await {
        Ok(check) => check,
        Err(e) => {
            error!(vault = %vault, error = %e, "Liquidation check failed, treating as unknown");
            LiquidationCheck::default()
        }
    }
}

/// Convert a non-negative I256 profit to U256, clamping negatives to zero.
pub(crate) fn clamp_profit(profit: I256) -> U256 {
    if profit.is_negative() {
        U256::ZERO
    } else {
        profit.into_raw()
    }
}

/// Guard for externally-liquidated positions with `max_repay > 0`: the
/// swap's encoded `minReturn` must cover the repayment the vault demands.
/// Returns the shortfall when the transaction must not be submitted;
/// calldata too short to carry `minReturn` is treated as a full shortfall.
pub(crate) fn min_return_shortfall(swap_data: &[u8], max_repay: U256) -> Option<U256> {
    match liquidator_api::decode_min_return(swap_data) {
        Some(min_return) if min_return >= max_repay => None,
        Some(min_return) => Some(max_repay - min_return),
        None => Some(max_repay),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChainConfig;
    use crate::state::now_ms;

    fn test_state() -> VaultState {
        VaultState::new(Address::repeat_byte(1), Protocol::Euler, 8453)
    }

    #[test]
    fn new_state_has_infinite_health() {
        let state = test_state();
        assert!(state.internal_health_score.is_infinite());
        assert!(state.external_health_score.is_infinite());
        assert!(state.min_health_score().is_infinite());
    }

    #[test]
    fn empty_vault_scheduled_near_max_interval() {
        let cfg = ChainConfig::testing();
        let mut state = test_state();

        let now = now_ms();
        let next = state.schedule_next_update(&cfg.cadence, false);

        let max_ms = cfg.cadence.max_update_interval_seconds * 1000.0;
        assert!(next > now);
        assert!((next - now) as f64 >= max_ms * 0.85);
        assert!((next - now) as f64 <= max_ms * 1.15);
    }

    #[test]
    fn schedule_is_always_in_the_future() {
        let cfg = ChainConfig::testing();
        let wad = U256::from(crate::wad::WAD);
        let cases = [
            (f64::INFINITY, f64::INFINITY, U256::ZERO, U256::ZERO, false),
            (1.5, 1.5, wad * U256::from(100u64), U256::ZERO, false),
            (0.95, 1.5, wad * U256::from(100u64), U256::ZERO, false),
            (1.5, 0.95, U256::ZERO, wad * U256::from(100u64), true),
        ];

        for (internal, external, internal_borrowed, external_borrowed, ext_liq) in cases {
            let mut state = test_state();
            state.internal_health_score = internal;
            state.external_health_score = external;
            state.internal_value_borrowed = internal_borrowed;
            state.external_value_borrowed = external_borrowed;

            let now = now_ms();
            let next = state.schedule_next_update(&cfg.cadence, ext_liq);
            assert!(next > now, "internal={internal} external={external}");
        }
    }

    #[test]
    fn schedule_never_exceeds_max_interval_ceiling() {
        let cfg = ChainConfig::testing();
        let mut state = test_state();
        state.internal_health_score = 2.0;
        state.external_health_score = 2.0;
        state.internal_value_borrowed = U256::from(crate::wad::WAD) * U256::from(1000u64);

        let now = now_ms();
        let next = state.schedule_next_update(&cfg.cadence, false);
        let ceiling = cfg.cadence.max_update_interval_seconds * 1.15 * 1000.0;
        assert!((next - now) as f64 <= ceiling);
    }

    #[test]
    fn liquidatable_small_position_scheduled_within_liq_window() {
        // $1000 borrowed (SMALL bucket, liq interval 15 s) with a score
        // below the liquidation threshold: due in roughly [13.5, 16.5] s.
        let cfg = ChainConfig::testing();
        let mut state = test_state();
        state.internal_health_score = 0.99;
        state.external_health_score = 1.5;
        state.internal_value_borrowed = U256::from(crate::wad::WAD) * U256::from(1000u64);

        let now = now_ms();
        let next = state.schedule_next_update(&cfg.cadence, false);
        let gap_s = (next - now) as f64 / 1000.0;
        assert!((13.0..=17.0).contains(&gap_s), "gap was {gap_s}s");
    }

    #[test]
    fn earlier_pending_schedule_is_kept() {
        let cfg = ChainConfig::testing();
        let mut state = test_state();
        state.internal_health_score = 2.0;
        state.external_health_score = 2.0;
        state.internal_value_borrowed = U256::from(crate::wad::WAD) * U256::from(1000u64);

        // Pending check 5 s out; the safe cadence would put it minutes out.
        let soon = now_ms() + 5_000;
        state.time_of_next_update = soon;
        let next = state.schedule_next_update(&cfg.cadence, false);
        assert_eq!(next, soon);
    }

    #[test]
    fn stale_past_schedule_is_replaced() {
        let cfg = ChainConfig::testing();
        let mut state = test_state();
        state.internal_health_score = 2.0;
        state.external_health_score = 2.0;
        state.internal_value_borrowed = U256::from(crate::wad::WAD) * U256::from(1000u64);

        state.time_of_next_update = now_ms().saturating_sub(10_000);
        let next = state.schedule_next_update(&cfg.cadence, false);
        assert!(next > now_ms());
    }

    #[test]
    fn snapshot_roundtrip_restores_checkpointed_fields() {
        let mut state = test_state();
        state.internal_health_score = 1.1;
        state.external_health_score = f64::INFINITY;
        state.time_of_next_update = 1_700_000_000_000;

        let snapshot = state.snapshot();
        let mut restored = test_state();
        restored.apply_snapshot(&snapshot);

        assert_eq!(restored.internal_health_score, 1.1);
        assert!(restored.external_health_score.is_infinite());
        assert_eq!(restored.time_of_next_update, 1_700_000_000_000);
    }

    #[test]
    fn clamp_profit_floors_at_zero() {
        assert_eq!(clamp_profit(I256::try_from(-5i64).unwrap()), U256::ZERO);
        assert_eq!(clamp_profit(I256::try_from(7i64).unwrap()), U256::from(7u64));
    }

    #[test]
    fn min_return_guard_blocks_shortfalls() {
        use liquidator_api::MIN_RETURN_RANGE;

        let calldata_with = |min_return: U256| {
            let mut data = vec![0u8; MIN_RETURN_RANGE.end + 32];
            data[MIN_RETURN_RANGE].copy_from_slice(&min_return.to_be_bytes::<32>());
            data
        };

        let max_repay = U256::from(1_000u64);

        // Swap covers the repayment: submit.
        assert_eq!(min_return_shortfall(&calldata_with(U256::from(1_000u64)), max_repay), None);
        assert_eq!(min_return_shortfall(&calldata_with(U256::from(2_000u64)), max_repay), None);

        // Swap returns too little: never submit.
        assert_eq!(
            min_return_shortfall(&calldata_with(U256::from(900u64)), max_repay),
            Some(U256::from(100u64))
        );

        // Calldata too short to carry minReturn: full shortfall.
        assert_eq!(min_return_shortfall(&[0u8; 64], max_repay), Some(max_repay));
    }

    #[test]
    fn protocol_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Protocol::Euler).unwrap(), "\"euler\"");
        assert_eq!(serde_json::to_string(&Protocol::Aave).unwrap(), "\"aave\"");
        assert_eq!(Protocol::Aave.to_string(), "aave");
    }
}
