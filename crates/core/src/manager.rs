//! Chain manager: one full monitor/listener stack per configured chain.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};

use liquidator_api::SwapQuoteClient;
use liquidator_chain::{rpc_endpoint, shutdown_endpoints, TransactionSender};

use crate::config::load_chain_config;
use crate::listener::FactoryListener;
use crate::monitor::AccountMonitor;
use crate::notifications::Notifier;
use crate::vault::VaultDeps;

pub struct ChainManager {
    monitors: HashMap<u64, Arc<AccountMonitor>>,
    listeners: HashMap<u64, Arc<FactoryListener>>,
    chain_ids: Vec<u64>,
}

impl ChainManager {
    /// Build the per-chain stacks and load each chain's checkpoint.
    pub async fn new(
        config_path: &Path,
        chain_ids: Vec<u64>,
        notify: bool,
        execute_liquidation: bool,
    ) -> Result<Self> {
        info!(?chain_ids, "Initializing chains");

        let mut monitors = HashMap::new();
        let mut listeners = HashMap::new();

        for &chain_id in &chain_ids {
            let config = Arc::new(
                load_chain_config(config_path, chain_id)
                    .with_context(|| format!("loading config for chain {chain_id}"))?,
            );

            let rpc = rpc_endpoint(&config.rpc_url)?;
            let sender = Arc::new(TransactionSender::new(
                &config.liquidator_private_key,
                rpc.clone(),
                chain_id,
            )?);
            let deps = VaultDeps {
                config: config.clone(),
                rpc,
                swap: Arc::new(SwapQuoteClient::new(config.oneinch_api_key.clone(), chain_id)),
                sender,
            };
            let notifier = Arc::new(Notifier::from_config(&config));

            let monitor =
                AccountMonitor::new(config.clone(), deps.clone(), notifier, notify, execute_liquidation);
            monitor.load_state().await;

            let listener = Arc::new(FactoryListener::new(monitor.clone(), config, deps));

            monitors.insert(chain_id, monitor);
            listeners.insert(chain_id, listener);
        }

        Ok(Self { monitors, listeners, chain_ids })
    }

    pub fn monitor(&self, chain_id: u64) -> Option<Arc<AccountMonitor>> {
        self.monitors.get(&chain_id).cloned()
    }

    pub fn chain_ids(&self) -> &[u64] {
        &self.chain_ids
    }

    /// Backfill historical vaults, then run every monitor and listener
    /// until [`stop`](Self::stop).
    pub async fn start(&self) -> Result<()> {
        for chain_id in &self.chain_ids {
            self.listeners[chain_id].backfill().await;
        }

        let mut handles = Vec::new();
        for chain_id in &self.chain_ids {
            let monitor = self.monitors[chain_id].clone();
            handles.push(tokio::spawn(monitor.run()));

            let listener = self.listeners[chain_id].clone();
            handles.push(tokio::spawn(async move { listener.run().await }));
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Chain task failed");
            }
        }

        Ok(())
    }

    /// Stop every chain: drain workers, write final checkpoints, and tear
    /// down the shared RPC endpoint registry.
    pub async fn stop(&self) {
        for monitor in self.monitors.values() {
            monitor.stop().await;
        }
        shutdown_endpoints();
        info!("All chains stopped");
    }
}
