//! Error kinds for the liquidation bot.
//!
//! Configuration errors are fatal at startup. Everything in
//! [`LiquidationError`] is recoverable: it is caught inside the per-vault
//! pass, counted against the error-notification cooldown, and the vault is
//! rescheduled.

use alloy::primitives::Address;
use thiserror::Error;

/// Fatal startup errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variables: {0}")]
    MissingEnv(String),

    #[error("no configuration found for chain id {0}")]
    UnknownChain(u64),

    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid address for {field}: {value}")]
    InvalidAddress { field: String, value: String },
}

/// Recoverable errors from the simulation/submission pipeline.
#[derive(Debug, Error)]
pub enum LiquidationError {
    #[error("failed to build liquidation transaction for {vault}: {reason}")]
    TransactionBuild { vault: Address, reason: String },

    #[error(transparent)]
    Rpc(#[from] anyhow::Error),
}

/// The protocol probe failed in an unexpected way. Logged by the registry,
/// which then defaults the vault to Euler-backed.
#[derive(Debug, Error)]
#[error("protocol detection failed for {address}: {reason}")]
pub struct ProtocolDetectionError {
    pub address: Address,
    pub reason: String,
}
