//! Factory listener: discovers vaults and feeds them to the monitor.
//!
//! Startup backfill scans from `max(deployment block, checkpoint cursor)`
//! to head in fixed-size batches, checkpointing between batches. The
//! steady-state loop then polls `(latest_block, head - 1)` every scan
//! interval. A range only advances the cursor after a successful scan.

use std::collections::HashSet;
use std::sync::Arc;

use alloy::primitives::Address;
use tracing::{error, info};

use liquidator_chain::VaultFactory;

use crate::config::ChainConfig;
use crate::monitor::AccountMonitor;
use crate::vault::{detect_protocol, VaultDeps};

const MAX_SCAN_RETRIES: u32 = 3;

pub struct FactoryListener {
    monitor: Arc<AccountMonitor>,
    factory: VaultFactory,
    config: Arc<ChainConfig>,
    deps: VaultDeps,
}

impl FactoryListener {
    pub fn new(monitor: Arc<AccountMonitor>, config: Arc<ChainConfig>, deps: VaultDeps) -> Self {
        let factory = VaultFactory::new(config.collateral_vault_factory, deps.rpc.clone());
        Self { monitor, factory, config, deps }
    }

    /// Steady-state polling loop.
    pub async fn run(&self) {
        info!(factory = %self.factory.address(), "Factory listener starting");

        while self.monitor.is_running() {
            match self.deps.rpc.block_number().await {
                Ok(head) => {
                    let current = head.saturating_sub(1);
                    let latest = self.monitor.latest_block();
                    if latest < current {
                        let mut seen = HashSet::new();
                        self.scan_block_range(latest, current, &mut seen).await;
                    }
                }
                Err(e) => {
                    error!(error = %e, "Failed to read head block");
                }
            }

            tokio::time::sleep(self.config.scanner.scan_interval()).await;
        }

        info!("Factory listener stopped");
    }

    /// Scan one block range, retrying transient failures. The monitor's
    /// cursor advances only after the whole range succeeded.
    pub async fn scan_block_range(
        &self,
        start_block: u64,
        end_block: u64,
        seen: &mut HashSet<Address>,
    ) {
        for attempt in 1..=MAX_SCAN_RETRIES {
            info!(start_block, end_block, "Scanning for vault-created events");

            match self.factory.created_vaults(start_block, end_block).await {
                Ok(vaults) => {
                    for vault in vaults {
                        if !seen.insert(vault) {
                            continue;
                        }

                        let protocol = detect_protocol(vault, &self.deps.rpc).await;
                        info!(%vault, %protocol, "Vault created, triggering monitor update");
                        self.monitor.update_account_on_status_check_event(vault, protocol).await;
                    }

                    info!(start_block, end_block, "Finished scanning range");
                    self.monitor.set_latest_block(end_block);
                    return;
                }
                Err(e) => {
                    error!(
                        start_block,
                        end_block,
                        attempt,
                        max_retries = MAX_SCAN_RETRIES,
                        error = %e,
                        "Range scan failed"
                    );
                    if attempt == MAX_SCAN_RETRIES {
                        error!(start_block, end_block, "Giving up on range after retries");
                    } else {
                        tokio::time::sleep(self.config.scanner.retry_delay()).await;
                    }
                }
            }
        }
    }

    /// Startup backfill in batched windows with a checkpoint save between
    /// batches.
    pub async fn backfill(&self) {
        let start = self
            .config
            .factory_deployment_block
            .max(self.monitor.last_saved_block());

        let head = match self.deps.rpc.block_number().await {
            Ok(head) => head,
            Err(e) => {
                error!(error = %e, "Failed to read head block, skipping backfill");
                return;
            }
        };

        info!(start, head, "Starting batch scan");

        let mut seen = HashSet::new();
        let mut start_block = start;
        while start_block < head && self.monitor.is_running() {
            let end_block = (start_block + self.config.scanner.batch_size).min(head);
            self.scan_block_range(start_block, end_block, &mut seen).await;
            self.monitor.save_state();
            start_block = end_block + 1;
            tokio::time::sleep(self.config.scanner.batch_interval()).await;
        }

        info!(head, "Finished batch scan");
    }
}
