//! Vault factory log scanner.
//!
//! Reads `T_CollateralVaultCreated` events over bounded block ranges. The
//! factory is protocol-agnostic, so the scanner only yields addresses; the
//! caller probes each vault for its backing protocol.

use alloy::primitives::Address;
use alloy::providers::Provider;
use alloy::rpc::types::{Filter, Log};
use alloy::sol_types::SolEvent;
use anyhow::Result;
use tracing::{debug, warn};

use crate::contracts::IVaultFactory;
use crate::provider::RpcEndpoint;
use std::sync::Arc;

/// Scanner for one factory contract on one chain.
pub struct VaultFactory {
    address: Address,
    rpc: Arc<RpcEndpoint>,
}

impl VaultFactory {
    pub fn new(address: Address, rpc: Arc<RpcEndpoint>) -> Self {
        Self { address, rpc }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// Fetch vault addresses created in `[from_block, to_block]` (inclusive).
    /// Duplicate events within the range are collapsed.
    pub async fn created_vaults(&self, from_block: u64, to_block: u64) -> Result<Vec<Address>> {
        let filter = Filter::new()
            .address(self.address)
            .event_signature(IVaultFactory::T_CollateralVaultCreated::SIGNATURE_HASH)
            .from_block(from_block)
            .to_block(to_block);

        let provider = self.rpc.provider();
        let logs = provider.get_logs(&filter).await?;

        let mut vaults = Vec::with_capacity(logs.len());
        for log in &logs {
            match decode_vault_created(log) {
                Some(vault) => {
                    if !vaults.contains(&vault) {
                        vaults.push(vault);
                    }
                }
                None => {
                    warn!(factory = %self.address, "Skipping malformed vault-created log");
                }
            }
        }

        debug!(
            factory = %self.address,
            from_block,
            to_block,
            found = vaults.len(),
            "Factory range scanned"
        );

        Ok(vaults)
    }
}

/// Decode the vault address out of a `T_CollateralVaultCreated` log.
/// Topics: [signature, vault, creator].
fn decode_vault_created(log: &Log) -> Option<Address> {
    let topics = log.topics();
    if topics.len() < 2 {
        return None;
    }
    Some(Address::from_slice(&topics[1][12..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{LogData, B256};

    fn created_log(vault: Address) -> Log {
        let mut topic = [0u8; 32];
        topic[12..].copy_from_slice(vault.as_slice());
        Log {
            inner: alloy::primitives::Log {
                address: Address::repeat_byte(0xFA),
                data: LogData::new_unchecked(
                    vec![
                        IVaultFactory::T_CollateralVaultCreated::SIGNATURE_HASH,
                        B256::from(topic),
                        B256::ZERO,
                    ],
                    Default::default(),
                ),
            },
            ..Default::default()
        }
    }

    #[test]
    fn decodes_vault_address_from_topic() {
        let vault = Address::repeat_byte(0x42);
        assert_eq!(decode_vault_created(&created_log(vault)), Some(vault));
    }

    #[test]
    fn rejects_log_without_topics() {
        let log = Log::default();
        assert_eq!(decode_vault_created(&log), None);
    }
}
