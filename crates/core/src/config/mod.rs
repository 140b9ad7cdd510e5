//! Chain configuration.
//!
//! The config document is JSON with a `global` section (paths) and a
//! `chains` section keyed by chain id. Secrets (signer key, swap API key,
//! RPC URLs) come from the environment; the document only names the env
//! var that holds each chain's RPC endpoint.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use alloy::primitives::Address;
use serde::{Deserialize, Serialize};

use crate::cadence::{BucketIntervals, CadenceConfig, HealthThresholds, SizeBucketTable};
use crate::error::ConfigError;

/// Env vars required for every chain; the chain's RPC var is added per
/// chain from the document.
const REQUIRED_ENV_VARS: &[&str] = &["LIQUIDATOR_EOA", "LIQUIDATOR_PRIVATE_KEY", "ONEINCH_API_KEY"];

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawConfig {
    pub global: GlobalSection,
    pub chains: HashMap<String, ChainSection>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GlobalSection {
    pub save_state_path: String,
    pub logs_path: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChainSection {
    pub name: String,
    /// Name of the env var holding this chain's JSON-RPC URL.
    pub rpc_env: String,
    #[serde(default)]
    pub explorer_url: String,
    pub contracts: ContractsSection,
    pub cadence: CadenceConfig,
    #[serde(default)]
    pub scanner: ScannerSection,
    #[serde(default = "default_save_interval")]
    pub save_interval_seconds: u64,
    #[serde(default)]
    pub notifications: NotificationSection,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ContractsSection {
    pub collateral_vault_factory: Address,
    pub factory_deployment_block: u64,
    pub evc: Address,
    pub health_stat_viewer: Address,
    pub euler_liquidator: Address,
    pub aave_liquidator: Address,
    /// Positions with this repayment asset are skipped entirely.
    pub usds: Address,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScannerSection {
    #[serde(default = "default_scan_interval")]
    pub scan_interval_seconds: u64,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,
    #[serde(default = "default_batch_interval")]
    pub batch_interval_seconds: u64,
}

fn default_scan_interval() -> u64 {
    10
}
fn default_retry_delay() -> u64 {
    10
}
fn default_batch_size() -> u64 {
    10_000
}
fn default_batch_interval() -> u64 {
    1
}
fn default_save_interval() -> u64 {
    300
}

impl Default for ScannerSection {
    fn default() -> Self {
        Self {
            scan_interval_seconds: default_scan_interval(),
            retry_delay_seconds: default_retry_delay(),
            batch_size: default_batch_size(),
            batch_interval_seconds: default_batch_interval(),
        }
    }
}

impl ScannerSection {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_seconds)
    }
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_seconds)
    }
    pub fn batch_interval(&self) -> Duration {
        Duration::from_secs(self.batch_interval_seconds)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NotificationSection {
    /// Positions borrowing less than this (USD) get throttled notifications.
    #[serde(default = "default_small_position_threshold")]
    pub small_position_threshold_usd: f64,
    #[serde(default = "default_error_cooldown")]
    pub error_cooldown_seconds: u64,
    #[serde(default = "default_small_position_report_interval")]
    pub small_position_report_interval_seconds: u64,
    #[serde(default = "default_low_health_report_interval")]
    pub low_health_report_interval_seconds: u64,
    /// Vaults below this min health score appear in the periodic digest.
    #[serde(default = "default_low_health_report_threshold")]
    pub low_health_report_threshold: f64,
}

fn default_small_position_threshold() -> f64 {
    1000.0
}
fn default_error_cooldown() -> u64 {
    3600
}
fn default_small_position_report_interval() -> u64 {
    43_200
}
fn default_low_health_report_interval() -> u64 {
    43_200
}
fn default_low_health_report_threshold() -> f64 {
    1.25
}

impl Default for NotificationSection {
    fn default() -> Self {
        Self {
            small_position_threshold_usd: default_small_position_threshold(),
            error_cooldown_seconds: default_error_cooldown(),
            small_position_report_interval_seconds: default_small_position_report_interval(),
            low_health_report_interval_seconds: default_low_health_report_interval(),
            low_health_report_threshold: default_low_health_report_threshold(),
        }
    }
}

impl NotificationSection {
    pub fn error_cooldown(&self) -> Duration {
        Duration::from_secs(self.error_cooldown_seconds)
    }
    pub fn small_position_report_interval(&self) -> Duration {
        Duration::from_secs(self.small_position_report_interval_seconds)
    }
    pub fn low_health_report_interval(&self) -> Duration {
        Duration::from_secs(self.low_health_report_interval_seconds)
    }
}

/// Fully resolved per-chain configuration: document values plus secrets
/// from the environment.
#[derive(Debug, Clone)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub chain_name: String,
    pub rpc_url: String,
    pub explorer_url: String,

    pub liquidator_eoa: Address,
    pub liquidator_private_key: String,
    pub oneinch_api_key: String,
    pub notification_url: Option<String>,
    pub mention_ids: Vec<String>,
    /// Vaults always included in the low-health digest.
    pub watchlist_vaults: Vec<Address>,

    pub collateral_vault_factory: Address,
    pub factory_deployment_block: u64,
    pub evc: Address,
    pub health_stat_viewer: Address,
    pub euler_liquidator: Address,
    pub aave_liquidator: Address,
    pub usds_address: Address,

    pub cadence: CadenceConfig,
    pub scanner: ScannerSection,
    pub save_interval_seconds: u64,
    pub notifications: NotificationSection,

    pub save_state_path: PathBuf,
    pub logs_path: PathBuf,
}

impl ChainConfig {
    pub fn save_interval(&self) -> Duration {
        Duration::from_secs(self.save_interval_seconds)
    }

    fn resolve(
        chain_id: u64,
        global: &GlobalSection,
        chain: &ChainSection,
    ) -> Result<Self, ConfigError> {
        let mut required: Vec<&str> = REQUIRED_ENV_VARS.to_vec();
        required.push(&chain.rpc_env);
        let missing: Vec<&str> = required
            .iter()
            .filter(|name| std::env::var(name).map(|v| v.is_empty()).unwrap_or(true))
            .copied()
            .collect();
        if !missing.is_empty() {
            return Err(ConfigError::MissingEnv(missing.join(", ")));
        }

        let eoa_raw = std::env::var("LIQUIDATOR_EOA").unwrap_or_default();
        let liquidator_eoa = eoa_raw.parse().map_err(|_| ConfigError::InvalidAddress {
            field: "LIQUIDATOR_EOA".into(),
            value: eoa_raw.clone(),
        })?;

        let mention_ids = std::env::var("MENTION_IDS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();

        let watchlist_vaults = std::env::var("WATCHLIST_VAULTS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .filter_map(|s| s.parse().ok())
            .collect();

        Ok(Self {
            chain_id,
            chain_name: chain.name.clone(),
            rpc_url: std::env::var(&chain.rpc_env).unwrap_or_default(),
            explorer_url: chain.explorer_url.clone(),
            liquidator_eoa,
            liquidator_private_key: std::env::var("LIQUIDATOR_PRIVATE_KEY").unwrap_or_default(),
            oneinch_api_key: std::env::var("ONEINCH_API_KEY").unwrap_or_default(),
            notification_url: std::env::var("NOTIFICATION_URL").ok().filter(|s| !s.is_empty()),
            mention_ids,
            watchlist_vaults,
            collateral_vault_factory: chain.contracts.collateral_vault_factory,
            factory_deployment_block: chain.contracts.factory_deployment_block,
            evc: chain.contracts.evc,
            health_stat_viewer: chain.contracts.health_stat_viewer,
            euler_liquidator: chain.contracts.euler_liquidator,
            aave_liquidator: chain.contracts.aave_liquidator,
            usds_address: chain.contracts.usds,
            cadence: chain.cadence.clone(),
            scanner: chain.scanner.clone(),
            save_interval_seconds: chain.save_interval_seconds,
            notifications: chain.notifications.clone(),
            save_state_path: Path::new(&global.save_state_path)
                .join(format!("{}_state.json", chain.name)),
            logs_path: Path::new(&global.logs_path).join(format!("{}_monitor.log", chain.name)),
        })
    }

    /// Config for tests: no env vars, no file, placeholder addresses, and
    /// the cadence table the scheduling tests are written against.
    pub fn testing() -> Self {
        Self {
            chain_id: 8453,
            chain_name: "testchain".into(),
            rpc_url: "http://localhost:8545".into(),
            explorer_url: "https://example-explorer.invalid".into(),
            liquidator_eoa: Address::repeat_byte(0xE0),
            liquidator_private_key: String::new(),
            oneinch_api_key: String::new(),
            notification_url: None,
            mention_ids: Vec::new(),
            watchlist_vaults: Vec::new(),
            collateral_vault_factory: Address::repeat_byte(0xFA),
            factory_deployment_block: 1,
            evc: Address::repeat_byte(0xEC),
            health_stat_viewer: Address::repeat_byte(0x15),
            euler_liquidator: Address::repeat_byte(0xE1),
            aave_liquidator: Address::repeat_byte(0xA1),
            usds_address: Address::repeat_byte(0x05),
            cadence: CadenceConfig {
                buckets: SizeBucketTable {
                    teeny_max_usd: 100.0,
                    mini_max_usd: 500.0,
                    small_max_usd: 5_000.0,
                    medium_max_usd: 50_000.0,
                    teeny: BucketIntervals { liq: 60.0, high: 300.0, safe: 3600.0 },
                    mini: BucketIntervals { liq: 30.0, high: 180.0, safe: 1800.0 },
                    small: BucketIntervals { liq: 15.0, high: 120.0, safe: 900.0 },
                    medium: BucketIntervals { liq: 5.0, high: 60.0, safe: 600.0 },
                    large: BucketIntervals { liq: 2.0, high: 30.0, safe: 300.0 },
                },
                thresholds: HealthThresholds { liquidation: 1.0, high_risk: 1.15, safe: 1.5 },
                max_update_interval_seconds: 21_600.0,
            },
            scanner: ScannerSection::default(),
            save_interval_seconds: default_save_interval(),
            notifications: NotificationSection::default(),
            save_state_path: std::env::temp_dir().join("testchain_state.json"),
            logs_path: std::env::temp_dir().join("testchain_monitor.log"),
        }
    }
}

/// Parse the config document.
pub fn parse_config(contents: &str) -> Result<RawConfig, ConfigError> {
    Ok(serde_json::from_str(contents)?)
}

fn read_config(path: &Path) -> Result<RawConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse_config(&contents)
}

/// Load and resolve the configuration for one chain.
pub fn load_chain_config(path: &Path, chain_id: u64) -> Result<ChainConfig, ConfigError> {
    let raw = read_config(path)?;
    let chain = raw
        .chains
        .get(&chain_id.to_string())
        .ok_or(ConfigError::UnknownChain(chain_id))?;
    ChainConfig::resolve(chain_id, &raw.global, chain)
}

/// Every chain id the document configures.
pub fn configured_chain_ids(path: &Path) -> Result<Vec<u64>, ConfigError> {
    let raw = read_config(path)?;
    let mut ids: Vec<u64> = raw.chains.keys().filter_map(|k| k.parse().ok()).collect();
    ids.sort_unstable();
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "global": {"save_state_path": "state", "logs_path": "logs"},
        "chains": {
            "8453": {
                "name": "base",
                "rpc_env": "BASE_RPC_URL",
                "explorer_url": "https://basescan.org",
                "contracts": {
                    "collateral_vault_factory": "0x00000000000000000000000000000000000000fa",
                    "factory_deployment_block": 1234,
                    "evc": "0x00000000000000000000000000000000000000ec",
                    "health_stat_viewer": "0x0000000000000000000000000000000000000015",
                    "euler_liquidator": "0x00000000000000000000000000000000000000e1",
                    "aave_liquidator": "0x00000000000000000000000000000000000000a1",
                    "usds": "0x0000000000000000000000000000000000000005"
                },
                "cadence": {
                    "buckets": {
                        "teeny_max_usd": 100.0,
                        "mini_max_usd": 500.0,
                        "small_max_usd": 5000.0,
                        "medium_max_usd": 50000.0,
                        "teeny": {"liq": 60.0, "high": 300.0, "safe": 3600.0},
                        "mini": {"liq": 30.0, "high": 180.0, "safe": 1800.0},
                        "small": {"liq": 15.0, "high": 120.0, "safe": 900.0},
                        "medium": {"liq": 5.0, "high": 60.0, "safe": 600.0},
                        "large": {"liq": 2.0, "high": 30.0, "safe": 300.0}
                    },
                    "thresholds": {"liquidation": 1.0, "high_risk": 1.15, "safe": 1.5},
                    "max_update_interval_seconds": 21600.0
                }
            }
        }
    }"#;

    #[test]
    fn parses_sample_document() {
        let raw = parse_config(SAMPLE).unwrap();
        let chain = raw.chains.get("8453").unwrap();
        assert_eq!(chain.name, "base");
        assert_eq!(chain.contracts.factory_deployment_block, 1234);
        // Omitted sections fall back to defaults.
        assert_eq!(chain.scanner.batch_size, 10_000);
        assert_eq!(chain.save_interval_seconds, 300);
        assert_eq!(chain.notifications.small_position_threshold_usd, 1000.0);
    }

    #[test]
    fn rejects_malformed_document() {
        assert!(parse_config("{not json").is_err());
    }

    #[test]
    fn testing_config_buckets_match_scheduling_scenarios() {
        let cfg = ChainConfig::testing();
        assert_eq!(cfg.cadence.buckets.small.liq, 15.0);
        assert_eq!(cfg.cadence.buckets.bucket_for(1000.0), crate::cadence::SizeBucket::Small);
    }
}
