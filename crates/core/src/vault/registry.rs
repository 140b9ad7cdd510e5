//! Protocol detection and adapter construction.
//!
//! One factory emits a single vault-created event for every backing
//! protocol, so new vaults are classified with a capability probe: the
//! Aave-only `aToken()` view. A non-zero answer is Aave; a revert or zero
//! address is Euler. The probe is side-effect free and stable.

use alloy::primitives::Address;
use tracing::{debug, info, warn};

use liquidator_chain::contracts::ICollateralVault;
use liquidator_chain::RpcEndpoint;

use super::{AaveVault, CollateralVault, EulerVault, Protocol, VaultDeps};
use crate::error::ProtocolDetectionError;

/// Classify a vault's backing protocol.
pub async fn detect_protocol(address: Address, rpc: &RpcEndpoint) -> Protocol {
    let provider = rpc.provider();
    match ICollateralVault::new(address, &provider).aToken().call().await {
        Ok(r) if r._0 != Address::ZERO => {
            info!(vault = %address, atoken = %r._0, "Detected Aave-backed vault");
            Protocol::Aave
        }
        Ok(_) => {
            info!(vault = %address, "Detected Euler-backed vault (zero aToken)");
            Protocol::Euler
        }
        Err(e) => {
            if matches!(e, alloy::contract::Error::TransportError(_)) {
                // Not the expected revert: the probe itself failed.
                let err = ProtocolDetectionError { address, reason: e.to_string() };
                warn!(error = %err, "Defaulting to Euler-backed");
            } else {
                debug!(vault = %address, error = %e, "aToken() probe reverted, Euler-backed");
            }
            Protocol::Euler
        }
    }
}

/// Construct the adapter for a declared protocol. Performs the full
/// contract-graph discovery; failures surface to the caller's
/// failed-initialization ledger.
pub async fn connect_vault(
    address: Address,
    protocol: Protocol,
    deps: &VaultDeps,
) -> anyhow::Result<CollateralVault> {
    match protocol {
        Protocol::Euler => Ok(CollateralVault::Euler(EulerVault::connect(address, deps.clone()).await?)),
        Protocol::Aave => Ok(CollateralVault::Aave(AaveVault::connect(address, deps.clone()).await?)),
    }
}
