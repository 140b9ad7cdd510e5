//! Core logic for the collateral-vault liquidation bot.
//!
//! This crate provides:
//! - The per-chain account monitor (priority queue, adaptive cadence,
//!   bounded worker pool, checkpointing, maintenance sweeps)
//! - Protocol-polymorphic vault adapters (Euler- and Aave-backed)
//! - The factory listener that discovers vaults
//! - Checkpoint persistence, notifications, and configuration

pub mod cadence;
pub mod config;
mod error;
mod listener;
mod manager;
mod monitor;
mod notifications;
mod state;
mod vault;
pub mod wad;

pub use config::{configured_chain_ids, load_chain_config, ChainConfig};
pub use error::{ConfigError, LiquidationError, ProtocolDetectionError};
pub use listener::FactoryListener;
pub use manager::ChainManager;
pub use monitor::{failed_init_backoff_seconds, AccountMonitor};
pub use notifications::{AccountHealthEntry, ErrorCooldowns, Notifier};
pub use state::{load_state, now_ms, save_state, FailedInit, SavedState, UnixMillis, VaultSnapshot, STATE_VERSION};
pub use vault::{
    connect_vault, detect_protocol, AaveVault, CollateralVault, EulerVault, HealthUpdate,
    LiquidationCheck, Protocol, SimulatedLiquidation, VaultDeps, VaultState,
};
