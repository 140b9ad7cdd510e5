//! Chain interaction layer for the collateral-vault liquidation bot.
//!
//! This crate provides:
//! - A process-wide RPC endpoint registry keyed by URL
//! - Typed `sol!` bindings for the vault, viewer, oracle, pool, and
//!   liquidator contracts
//! - The factory log scanner for vault discovery
//! - Transaction signing and submission

pub mod contracts;
mod factory;
mod provider;
mod sender;

pub use factory::VaultFactory;
pub use provider::{rpc_endpoint, shutdown_endpoints, RpcEndpoint};
pub use sender::TransactionSender;
