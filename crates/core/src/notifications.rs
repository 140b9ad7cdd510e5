//! Operator notifications.
//!
//! A single transport operation: post a message with a title and body to
//! the configured webhook URL. Message formatting for the five streams
//! (unhealthy account, opportunity, completed liquidation, low-health
//! digest, error burst) lives here; throttling state for error bursts is
//! the [`ErrorCooldowns`] ledger.

use alloy::primitives::{Address, U256};
use dashmap::DashMap;
use serde::Serialize;
use tracing::{error, info};

use liquidator_chain::contracts::IEvc;
use liquidator_chain::RpcEndpoint;

use crate::config::{ChainConfig, NotificationSection};
use crate::state::{serde_health, now_ms, UnixMillis};
use crate::wad::from_wad;

/// A vault's health view as exposed to reports and the snapshot endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct AccountHealthEntry {
    pub account_address: Address,
    #[serde(with = "serde_health")]
    pub internal_health_score: f64,
    #[serde(with = "serde_health")]
    pub external_health_score: f64,
    #[serde(with = "serde_health")]
    pub health_score: f64,
    pub balance: U256,
    pub internal_value_borrowed: U256,
    pub external_value_borrowed: U256,
    pub symbol: String,
}

/// Posts title+body messages to the configured notification URL.
/// With no URL configured every post is a logged no-op.
pub struct Notifier {
    client: reqwest::Client,
    url: Option<String>,
    chain_name: String,
    chain_id: u64,
    explorer_url: String,
    mention_ids: Vec<String>,
}

#[derive(Serialize)]
struct NotificationPayload<'a> {
    title: &'a str,
    body: &'a str,
}

impl Notifier {
    pub fn from_config(config: &ChainConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: config.notification_url.clone(),
            chain_name: config.chain_name.clone(),
            chain_id: config.chain_id,
            explorer_url: config.explorer_url.clone(),
            mention_ids: config.mention_ids.clone(),
        }
    }

    /// Post a message. Failures are logged, never propagated; losing a
    /// notification must not disturb the scheduler.
    pub async fn post(&self, title: &str, body: &str) {
        info!(title, "Notification:\n{body}");

        let Some(url) = &self.url else { return };
        let payload = NotificationPayload { title, body };
        if let Err(e) = self
            .client
            .post(url)
            .json(&payload)
            .send()
            .await
            .and_then(|r| r.error_for_status())
        {
            error!(title, error = %e, "Failed to post notification");
        }
    }

    fn mentions(&self) -> String {
        self.mention_ids.iter().map(|id| format!("<@{id}>")).collect::<Vec<_>>().join(" ")
    }

    pub fn unhealthy_account_message(
        &self,
        vault: Address,
        externally_liquidated: bool,
        internal_health_score: f64,
        external_health_score: f64,
        internal_value_borrowed: U256,
        external_value_borrowed: U256,
        spy_link: Option<&str>,
    ) -> String {
        let mut message = format!(
            ":warning: *Unhealthy Account Detected* :warning:\n\n\
             *Vault*: `{vault}`\n\
             *Externally Liquidated*: `{externally_liquidated}`\n\
             *Internal Health Score*: `{internal_health_score:.4}`\n\
             *External Health Score*: `{external_health_score:.4}`\n\
             *Internal Value Borrowed*: `${:.2}`\n\
             *External Value Borrowed*: `${:.2}`\n",
            from_wad(internal_value_borrowed),
            from_wad(external_value_borrowed),
        );
        if let Some(link) = spy_link {
            message.push_str(&format!("*Account*: {link}\n"));
        }
        message.push_str(&format!("Network: `{}` {}\n", self.chain_name, self.mentions()));
        message
    }

    pub fn opportunity_message(
        &self,
        vault: Address,
        net_profit: U256,
        collateral_asset: Address,
    ) -> String {
        format!(
            ":rotating_light: *Profitable Liquidation Opportunity Detected* :rotating_light:\n\n\
             *Vault*: `{vault}`\n\
             *Liquidation Opportunity Details:*\n\
             - Profit: ${:.2}\n\
             - Collateral Asset: `{collateral_asset}`\n\
             Network: `{}` {}",
            from_wad(net_profit),
            self.chain_name,
            self.mentions(),
        )
    }

    pub fn result_message(
        &self,
        vault: Address,
        net_profit: U256,
        collateral_asset: Address,
        tx_hash: alloy::primitives::B256,
    ) -> String {
        format!(
            ":moneybag: *Liquidation Completed* :moneybag:\n\n\
             *Vault*: `{vault}`\n\
             *Liquidation Details:*\n\
             - Profit: ${:.2}\n\
             - Collateral Asset: `{collateral_asset}`\n\
             - Transaction: {}/tx/{tx_hash}\n\
             Network: `{}` {}",
            from_wad(net_profit),
            self.explorer_url,
            self.chain_name,
            self.mentions(),
        )
    }

    /// Digest of vaults below the reporting threshold, plus everything on
    /// the watchlist. Entries must arrive sorted ascending by min health.
    pub fn low_health_report_message(
        &self,
        entries: &[AccountHealthEntry],
        threshold: f64,
        watchlist: &[Address],
    ) -> Option<String> {
        let selected: Vec<&AccountHealthEntry> = entries
            .iter()
            .filter(|e| e.health_score < threshold || watchlist.contains(&e.account_address))
            .collect();

        if selected.is_empty() {
            return None;
        }

        let mut message = format!(
            "*Low Health Account Report* for `{}` ({} accounts)\n",
            self.chain_name,
            selected.len()
        );
        for entry in selected {
            let health = if entry.health_score.is_finite() {
                format!("{:.4}", entry.health_score)
            } else {
                "inf".to_string()
            };
            message.push_str(&format!(
                "`{}` hs={} borrowed=${:.2} {}\n",
                entry.account_address,
                health,
                from_wad(entry.internal_value_borrowed) + from_wad(entry.external_value_borrowed),
                entry.symbol,
            ));
        }
        Some(message)
    }

    /// Spy-mode frontend link for an account, via the EVC owner lookup.
    pub async fn spy_link(&self, rpc: &RpcEndpoint, evc: Address, account: Address) -> Option<String> {
        let provider = rpc.provider();
        let owner = match IEvc::new(evc, &provider).getAccountOwner(account).call().await {
            Ok(r) if r._0 != Address::ZERO => r._0,
            Ok(_) => account,
            Err(_) => return None,
        };

        let account_word = U256::from_be_slice(account.as_slice());
        let owner_word = U256::from_be_slice(owner.as_slice());
        let subaccount = account_word ^ owner_word;

        Some(format!(
            "https://app.twyne.xyz/account/{subaccount}?spy={owner}&chainId={}",
            self.chain_id
        ))
    }
}

/// Per-vault cooldowns for error notifications. Large positions re-post
/// after `error_cooldown`; small ones wait the longer small-position
/// interval.
#[derive(Default)]
pub struct ErrorCooldowns {
    last_posted: DashMap<Address, UnixMillis>,
}

impl ErrorCooldowns {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn should_post(
        &self,
        vault: Address,
        total_borrowed_usd: f64,
        thresholds: &NotificationSection,
    ) -> bool {
        let now = now_ms();
        let last = self.last_posted.get(&vault).map(|v| *v).unwrap_or(0);
        let elapsed_ms = now.saturating_sub(last);

        if total_borrowed_usd > thresholds.small_position_threshold_usd {
            elapsed_ms > thresholds.error_cooldown_seconds * 1000
        } else {
            elapsed_ms > thresholds.small_position_report_interval_seconds * 1000
        }
    }

    pub fn mark_posted(&self, vault: Address) {
        self.last_posted.insert(vault, now_ms());
    }

    /// Evict entries older than the given age. The ledger otherwise grows
    /// monotonically with every vault that ever errored.
    pub fn evict_older_than(&self, max_age_ms: u64) {
        let now = now_ms();
        self.last_posted.retain(|_, posted| now.saturating_sub(*posted) < max_age_ms);
    }

    pub fn len(&self) -> usize {
        self.last_posted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_posted.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wad::WAD;

    fn notifier() -> Notifier {
        let mut config = ChainConfig::testing();
        config.mention_ids = vec!["U123".into()];
        Notifier::from_config(&config)
    }

    fn entry(address: Address, health: f64, borrowed_usd: u64) -> AccountHealthEntry {
        AccountHealthEntry {
            account_address: address,
            internal_health_score: health,
            external_health_score: f64::INFINITY,
            health_score: health,
            balance: U256::ZERO,
            internal_value_borrowed: U256::from(borrowed_usd) * U256::from(WAD),
            external_value_borrowed: U256::ZERO,
            symbol: "WETH".into(),
        }
    }

    #[test]
    fn unhealthy_message_contains_scores_and_mentions() {
        let n = notifier();
        let message = n.unhealthy_account_message(
            Address::repeat_byte(1),
            false,
            0.9876,
            1.5,
            U256::from(1500u64) * U256::from(WAD),
            U256::ZERO,
            None,
        );
        assert!(message.contains("Unhealthy Account Detected"));
        assert!(message.contains("0.9876"));
        assert!(message.contains("$1500.00"));
        assert!(message.contains("<@U123>"));
        assert!(message.contains("testchain"));
    }

    #[test]
    fn result_message_links_explorer() {
        let n = notifier();
        let message = n.result_message(
            Address::repeat_byte(1),
            U256::from(25u64) * U256::from(WAD),
            Address::repeat_byte(2),
            alloy::primitives::B256::repeat_byte(0xAB),
        );
        assert!(message.contains("Liquidation Completed"));
        assert!(message.contains("$25.00"));
        assert!(message.contains("https://example-explorer.invalid/tx/0xab"));
    }

    #[test]
    fn low_health_report_filters_by_threshold_and_watchlist() {
        let n = notifier();
        let risky = Address::repeat_byte(1);
        let healthy = Address::repeat_byte(2);
        let watched = Address::repeat_byte(3);
        let entries = vec![
            entry(risky, 1.05, 1000),
            entry(healthy, 2.5, 1000),
            entry(watched, 3.0, 1000),
        ];

        let message = n.low_health_report_message(&entries, 1.25, &[watched]).unwrap();
        assert!(message.contains(&format!("{risky}")));
        assert!(!message.contains(&format!("{healthy}")));
        assert!(message.contains(&format!("{watched}")));
    }

    #[test]
    fn empty_low_health_report_is_suppressed() {
        let n = notifier();
        let entries = vec![entry(Address::repeat_byte(2), 2.5, 1000)];
        assert!(n.low_health_report_message(&entries, 1.25, &[]).is_none());
    }

    #[test]
    fn error_cooldowns_gate_by_position_size() {
        let thresholds = NotificationSection::default();
        let cooldowns = ErrorCooldowns::new();
        let vault = Address::repeat_byte(1);

        // Nothing posted yet: both sizes may post.
        assert!(cooldowns.should_post(vault, 5000.0, &thresholds));
        assert!(cooldowns.should_post(vault, 10.0, &thresholds));

        cooldowns.mark_posted(vault);
        assert!(!cooldowns.should_post(vault, 5000.0, &thresholds));
        assert!(!cooldowns.should_post(vault, 10.0, &thresholds));
    }

    #[test]
    fn error_cooldowns_evict_old_entries() {
        let cooldowns = ErrorCooldowns::new();
        cooldowns.mark_posted(Address::repeat_byte(1));
        assert_eq!(cooldowns.len(), 1);

        cooldowns.evict_older_than(0);
        assert!(cooldowns.is_empty());
    }
}
