//! Transaction signing and submission.

use std::sync::Arc;
use std::time::Duration;

use alloy::network::EthereumWallet;
use alloy::primitives::{Address, B256};
use alloy::providers::{Provider, ProviderBuilder};
use alloy::rpc::types::TransactionRequest;
use alloy::signers::local::PrivateKeySigner;
use anyhow::Result;
use tracing::{info, warn};

use crate::provider::RpcEndpoint;

/// Signs prepared transactions and broadcasts them through the chain's
/// shared RPC endpoint.
pub struct TransactionSender {
    rpc: Arc<RpcEndpoint>,
    wallet: EthereumWallet,
    /// Signer address.
    pub address: Address,
    chain_id: u64,
}

impl TransactionSender {
    /// Create a sender from a hex private key (with or without 0x prefix).
    pub fn new(private_key: &str, rpc: Arc<RpcEndpoint>, chain_id: u64) -> Result<Self> {
        let key_str = private_key.trim_start_matches("0x");
        let signer: PrivateKeySigner = key_str.parse()?;
        let address = signer.address();
        let wallet = EthereumWallet::from(signer);

        Ok(Self { rpc, wallet, address, chain_id })
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Pending-inclusive nonce for the signer.
    pub async fn next_nonce(&self) -> Result<u64> {
        Ok(self.rpc.provider().get_transaction_count(self.address).await?)
    }

    /// Gas price for liquidation transactions:
    /// `min(2 * gasPrice, 2 * gasPrice + 2 * maxPriorityFee)`.
    pub async fn suggested_gas_price(&self) -> Result<u128> {
        let provider = self.rpc.provider();
        let base = provider.get_gas_price().await? * 2;
        let priority = provider.get_max_priority_fee_per_gas().await.unwrap_or(0) * 2;
        Ok(base.min(base + priority))
    }

    /// Sign, broadcast, and wait for the receipt.
    ///
    /// Returns the transaction hash on a successful receipt; a reverted
    /// receipt is an error so callers never report a failed liquidation as
    /// completed.
    pub async fn send_and_confirm(
        &self,
        tx: TransactionRequest,
        receipt_timeout: Duration,
    ) -> Result<B256> {
        let provider = ProviderBuilder::new()
            .wallet(self.wallet.clone())
            .on_http(self.rpc.url().clone());

        let pending = provider.send_transaction(tx).await?;
        let tx_hash = *pending.tx_hash();

        info!(tx_hash = %tx_hash, timeout_s = receipt_timeout.as_secs(), "Transaction submitted, waiting for receipt");

        let receipt = pending.with_timeout(Some(receipt_timeout)).get_receipt().await?;

        if receipt.status() {
            info!(
                tx_hash = %tx_hash,
                block = receipt.block_number.unwrap_or(0),
                gas_used = receipt.gas_used,
                "Transaction confirmed"
            );
            Ok(tx_hash)
        } else {
            warn!(tx_hash = %tx_hash, "Transaction reverted");
            anyhow::bail!("transaction reverted: {tx_hash}")
        }
    }

    /// Native balance of the signer.
    pub async fn balance(&self) -> Result<alloy::primitives::U256> {
        Ok(self.rpc.provider().get_balance(self.address).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::rpc_endpoint;

    #[test]
    fn sender_derives_signer_address() {
        // Well-known test key (never used on a live network).
        let key = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
        let rpc = rpc_endpoint("http://localhost:8545").unwrap();
        let sender = TransactionSender::new(key, rpc, 8453).unwrap();

        assert_eq!(
            format!("{:?}", sender.address).to_lowercase(),
            "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266"
        );
        assert_eq!(sender.chain_id(), 8453);
    }

    #[test]
    fn rejects_malformed_key() {
        let rpc = rpc_endpoint("http://localhost:8545").unwrap();
        assert!(TransactionSender::new("0xzz", rpc, 1).is_err());
    }
}
