//! Per-chain account monitor: the scheduler at the centre of the bot.
//!
//! Holds the live vault set, a priority queue keyed by next-check time, a
//! bounded worker pool, checkpointing, and the maintenance sweeps. The
//! `processing` set guarantees at most one in-flight worker per vault;
//! duplicate queue entries for an address are dropped at pop time.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{Mutex as AsyncMutex, Notify, Semaphore};
use tracing::{debug, error, info, warn};

use crate::config::ChainConfig;
use crate::notifications::{AccountHealthEntry, ErrorCooldowns, Notifier};
use crate::state::{
    self, now_ms, FailedInit, SavedState, UnixMillis, STATE_VERSION,
};
use crate::vault::{
    connect_vault, CollateralVault, HealthUpdate, Protocol, SimulatedLiquidation, VaultDeps,
    VaultState,
};

/// Bounded parallelism for per-vault passes.
const WORKER_POOL_SIZE: usize = 32;

/// Forced reschedule delay after a failed pass.
const ERROR_RETRY_MS: u64 = 60_000;

/// A vault whose due time is further in the past than this is stale.
const STALE_THRESHOLD_MS: u64 = 3_600_000;

const STALE_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);
const FAILED_INIT_RETRY_INTERVAL: Duration = Duration::from_secs(300);

/// Receipt timeouts per liquidation kind.
const INTERNAL_RECEIPT_TIMEOUT: Duration = Duration::from_secs(20);
const EXTERNAL_RECEIPT_TIMEOUT: Duration = Duration::from_secs(60);

/// Exponential failed-initialization backoff: `min(60 * 2^(k-1), 3600)`
/// seconds after the k-th consecutive failure.
pub fn failed_init_backoff_seconds(attempts: u32) -> u64 {
    if attempts == 0 {
        return 60;
    }
    if attempts >= 7 {
        return 3600;
    }
    60u64 << (attempts - 1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueEntry {
    due: UnixMillis,
    address: Address,
}

/// Outcome of one queue-head inspection.
#[derive(Debug, PartialEq, Eq)]
enum PopOutcome {
    /// Queue is empty; wait for a producer.
    Empty,
    /// Head is not due yet; wait until then (entry pushed back).
    NotDue(UnixMillis),
    /// Address claimed for processing.
    Claimed(Address),
    /// Stale duplicate for an address already in flight; dropped.
    Dropped(Address),
}

pub struct AccountMonitor {
    chain_id: u64,
    config: Arc<ChainConfig>,
    deps: VaultDeps,

    accounts: DashMap<Address, Arc<AsyncMutex<CollateralVault>>>,
    /// Last observed state per vault; feeds checkpoints, reports, and the
    /// snapshot endpoint without locking live adapters.
    views: DashMap<Address, VaultState>,

    queue: Mutex<BinaryHeap<Reverse<QueueEntry>>>,
    queue_notify: Notify,
    processing: DashSet<Address>,
    worker_permits: Arc<Semaphore>,
    active_workers: AtomicUsize,
    drained: Notify,

    failed_initializations: DashMap<Address, FailedInit>,
    recently_posted_low_value: DashMap<Address, UnixMillis>,
    error_cooldowns: ErrorCooldowns,

    latest_block: AtomicU64,
    last_saved_block: AtomicU64,
    running: AtomicBool,

    notifier: Arc<Notifier>,
    notify: bool,
    execute_liquidation: bool,
}

impl AccountMonitor {
    pub fn new(
        config: Arc<ChainConfig>,
        deps: VaultDeps,
        notifier: Arc<Notifier>,
        notify: bool,
        execute_liquidation: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            chain_id: config.chain_id,
            config,
            deps,
            accounts: DashMap::new(),
            views: DashMap::new(),
            queue: Mutex::new(BinaryHeap::new()),
            queue_notify: Notify::new(),
            processing: DashSet::new(),
            worker_permits: Arc::new(Semaphore::new(WORKER_POOL_SIZE)),
            active_workers: AtomicUsize::new(0),
            drained: Notify::new(),
            failed_initializations: DashMap::new(),
            recently_posted_low_value: DashMap::new(),
            error_cooldowns: ErrorCooldowns::new(),
            latest_block: AtomicU64::new(0),
            last_saved_block: AtomicU64::new(0),
            running: AtomicBool::new(true),
            notifier,
            notify,
            execute_liquidation,
        })
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn latest_block(&self) -> u64 {
        self.latest_block.load(Ordering::SeqCst)
    }

    pub fn set_latest_block(&self, block: u64) {
        self.latest_block.store(block, Ordering::SeqCst);
    }

    pub fn last_saved_block(&self) -> u64 {
        self.last_saved_block.load(Ordering::SeqCst)
    }

    pub fn account_count(&self) -> usize {
        self.accounts.len()
    }

    fn push_queue(&self, due: UnixMillis, address: Address) {
        self.queue.lock().push(Reverse(QueueEntry { due, address }));
        self.queue_notify.notify_one();
    }

    fn pop_next(&self, now: UnixMillis) -> PopOutcome {
        let mut queue = self.queue.lock();
        match queue.pop() {
            None => PopOutcome::Empty,
            Some(Reverse(entry)) if entry.due > now => {
                let due = entry.due;
                queue.push(Reverse(entry));
                PopOutcome::NotDue(due)
            }
            Some(Reverse(entry)) => {
                if self.processing.insert(entry.address) {
                    PopOutcome::Claimed(entry.address)
                } else {
                    PopOutcome::Dropped(entry.address)
                }
            }
        }
    }

    /// Main scheduling loop. Spawns the maintenance tasks, then dispatches
    /// due vaults to the worker pool until stopped.
    pub async fn run(self: Arc<Self>) {
        info!(chain_id = self.chain_id, "Account monitor starting");

        tokio::spawn(self.clone().periodic_save());
        tokio::spawn(self.clone().periodic_sweep_stale_accounts());
        tokio::spawn(self.clone().periodic_retry_failed_initializations());
        if self.notify {
            tokio::spawn(self.clone().periodic_report_low_health_accounts());
        }

        while self.is_running() {
            match self.pop_next(now_ms()) {
                PopOutcome::Empty => {
                    tokio::select! {
                        _ = self.queue_notify.notified() => {}
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
                PopOutcome::NotDue(due) => {
                    let wait = Duration::from_millis(due.saturating_sub(now_ms()));
                    tokio::select! {
                        _ = self.queue_notify.notified() => {}
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                PopOutcome::Dropped(address) => {
                    debug!(vault = %address, "Dropped duplicate queue entry");
                }
                PopOutcome::Claimed(address) => {
                    let Ok(permit) = self.worker_permits.clone().acquire_owned().await else {
                        self.processing.remove(&address);
                        break;
                    };
                    let monitor = self.clone();
                    self.active_workers.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(async move {
                        let _permit = permit;
                        monitor.process_account_update(address).await;
                        monitor.processing.remove(&address);
                        if monitor.active_workers.fetch_sub(1, Ordering::SeqCst) == 1 {
                            monitor.drained.notify_waiters();
                        }
                    });
                }
            }
        }

        info!(chain_id = self.chain_id, "Account monitor loop exited");
    }

    /// One worker pass with the catch-all retry: any error forces the
    /// vault back into the queue 60 s out so it cannot be orphaned.
    async fn process_account_update(&self, address: Address) {
        if let Err(e) = self.update_account_liquidity(address).await {
            error!(vault = %address, error = %e, "Account pass failed");
            self.force_retry(address).await;
        }
    }

    async fn force_retry(&self, address: Address) {
        let retry_at = now_ms() + ERROR_RETRY_MS;
        if let Some(entry) = self.accounts.get(&address).map(|e| e.value().clone()) {
            let mut vault = entry.lock().await;
            vault.state_mut().time_of_next_update = retry_at;
            self.views.insert(address, vault.state().clone());
        }
        info!(vault = %address, retry_in_s = ERROR_RETRY_MS / 1000, "Scheduling retry");
        self.push_queue(retry_at, address);
    }

    /// The per-vault pass: refresh health, check liquidatability, run the
    /// pipeline when unhealthy, and re-enqueue.
    pub async fn update_account_liquidity(&self, address: Address) -> anyhow::Result<()> {
        let Some(entry) = self.accounts.get(&address).map(|e| e.value().clone()) else {
            error!(vault = %address, "Not found in account list");
            return Ok(());
        };
        let mut vault = entry.lock().await;

        let prev_scheduled = vault.state().time_of_next_update;
        let health = vault.update_liquidity().await;

        if vault.state().target_asset == self.config.usds_address {
            info!(vault = %address, "Skipping position with excluded stablecoin debt");
            self.views.insert(address, vault.state().clone());
            return Ok(());
        }

        let check = vault.check_liquidation().await;

        if check.can_liquidate
            || (check.externally_liquidated && !check.max_release.is_zero())
            || health.internal_health_score < 1.0
            || health.external_health_score < 1.0
        {
            info!(
                vault = %address,
                internal_hs = health.internal_health_score,
                external_hs = health.external_health_score,
                borrowed_usd = vault.state().total_borrowed_usd(),
                "Unhealthy account, simulating liquidation"
            );
            self.notify_unhealthy(vault.state(), &health, check.externally_liquidated).await;
            self.handle_liquidation(&mut vault).await;
        }

        let next = vault.state().time_of_next_update;
        self.views.insert(address, vault.state().clone());
        drop(vault);

        if next == prev_scheduled {
            info!(vault = %address, due = next, "Next update already scheduled");
            return Ok(());
        }

        self.push_queue(next, address);
        Ok(())
    }

    /// Unhealthy-account notification, throttled for small positions.
    async fn notify_unhealthy(
        &self,
        state: &VaultState,
        health: &HealthUpdate,
        externally_liquidated: bool,
    ) {
        if !self.notify {
            return;
        }

        let address = state.address;
        let total_borrowed_usd = state.total_borrowed_usd();
        let report_interval_ms = self.config.notifications.low_health_report_interval_seconds * 1000;

        if let Some(last) = self.recently_posted_low_value.get(&address).map(|v| *v) {
            if now_ms().saturating_sub(last) < report_interval_ms
                && total_borrowed_usd < self.config.notifications.small_position_threshold_usd
            {
                info!(vault = %address, "Skipping notification, recently posted");
                return;
            }
        }

        let spy_link = self
            .notifier
            .spy_link(&self.deps.rpc, self.config.evc, address)
            .await;
        let message = self.notifier.unhealthy_account_message(
            address,
            externally_liquidated,
            health.internal_health_score,
            health.external_health_score,
            state.internal_value_borrowed,
            state.external_value_borrowed,
            spy_link.as_deref(),
        );
        self.notifier.post("Unhealthy Account Detected", &message).await;

        if total_borrowed_usd < self.config.notifications.small_position_threshold_usd {
            self.recently_posted_low_value.insert(address, now_ms());
        }
    }

    /// Simulate, and when warranted submit, a liquidation. All failures
    /// are contained here; the pass continues to rescheduling regardless.
    async fn handle_liquidation(&self, vault: &mut CollateralVault) {
        let address = vault.state().address;

        let simulated = match vault.simulate_liquidation().await {
            Ok(simulated) => simulated,
            Err(e) => {
                let message = format!("Liquidation simulation failed for {address}: {e}");
                error!(vault = %address, error = %e, "simulate_liquidation failed");
                self.report_error(vault.state(), &message).await;
                return;
            }
        };

        let Some(simulated) = simulated else {
            info!(vault = %address, "Unhealthy but not profitable to liquidate");
            return;
        };

        if self.notify {
            let message = self.notifier.opportunity_message(
                address,
                simulated.net_profit,
                simulated.collateral_asset,
            );
            self.notifier.post("Profitable Liquidation Opportunity Detected", &message).await;
        }

        if self.execute_liquidation {
            self.execute(vault, &simulated).await;
        }
    }

    async fn execute(&self, vault: &mut CollateralVault, simulated: &SimulatedLiquidation) {
        let address = vault.state().address;
        let timeout = if simulated.internal {
            INTERNAL_RECEIPT_TIMEOUT
        } else {
            EXTERNAL_RECEIPT_TIMEOUT
        };

        match self.deps.sender.send_and_confirm(simulated.tx.clone(), timeout).await {
            Ok(tx_hash) => {
                info!(
                    vault = %address,
                    tx_hash = %tx_hash,
                    collateral = %simulated.collateral_asset,
                    "Liquidation executed"
                );
                if self.notify {
                    let message = self.notifier.result_message(
                        address,
                        simulated.net_profit,
                        simulated.collateral_asset,
                        tx_hash,
                    );
                    self.notifier.post("Liquidation Completed", &message).await;
                }
            }
            Err(e) => {
                let message = format!("Failed to execute liquidation for {address}: {e}");
                error!(vault = %address, error = %e, "Liquidation execution failed");
                self.report_error(vault.state(), &message).await;
            }
        }

        // Refresh immediately so the next schedule reflects the new state.
        let _ = vault.update_liquidity().await;
    }

    /// Error notification gated by the per-vault cooldown ledger.
    async fn report_error(&self, state: &VaultState, message: &str) {
        if !self.notify {
            return;
        }
        let address = state.address;
        if self.error_cooldowns.should_post(
            address,
            state.total_borrowed_usd(),
            &self.config.notifications,
        ) {
            self.notifier.post("Liquidation Error", message).await;
            self.error_cooldowns.mark_posted(address);
        }
    }

    /// Listener ingest: a vault surfaced by the factory scan (or a
    /// failed-init retry).
    pub async fn update_account_on_status_check_event(&self, address: Address, protocol: Protocol) {
        if self.accounts.contains_key(&address) {
            info!(vault = %address, "Already in account list");
            if !self.processing.insert(address) {
                debug!(vault = %address, "Worker already in flight, skipping ingest update");
                return;
            }
            self.process_account_update(address).await;
            self.processing.remove(&address);
            return;
        }

        match connect_vault(address, protocol, &self.deps).await {
            Ok(mut vault) => {
                info!(vault = %address, %protocol, "Adding to account list");
                let health = vault.update_liquidity().await;
                let next = vault.state().time_of_next_update;

                self.views.insert(address, vault.state().clone());
                self.accounts.insert(address, Arc::new(AsyncMutex::new(vault)));
                self.push_queue(next, address);

                if self.failed_initializations.remove(&address).is_some() {
                    info!(vault = %address, "Recovered from failed initialization");
                }

                info!(
                    vault = %address,
                    internal_hs = health.internal_health_score,
                    external_hs = health.external_health_score,
                    externally_liquidated = health.externally_liquidated,
                    due = next,
                    "Initialized"
                );
            }
            Err(e) => {
                error!(vault = %address, %protocol, error = %e, "Failed to initialize account");
                self.track_failed_initialization(address, protocol);
            }
        }
    }

    fn track_failed_initialization(&self, address: Address, protocol: Protocol) {
        let now = now_ms();
        let mut entry = self
            .failed_initializations
            .entry(address)
            .or_insert(FailedInit { protocol, retry_at: 0, attempts: 0 });
        entry.attempts += 1;
        let backoff = failed_init_backoff_seconds(entry.attempts);
        entry.retry_at = now + backoff * 1000;
        warn!(
            vault = %address,
            attempts = entry.attempts,
            retry_in_s = backoff,
            "Vault failed initialization"
        );
    }

    /// Retry every failed initialization whose backoff has elapsed.
    /// Returns the number of vaults recovered.
    pub async fn retry_failed_initializations(&self) -> usize {
        let now = now_ms();
        let due: Vec<(Address, Protocol)> = self
            .failed_initializations
            .iter()
            .filter(|e| e.value().retry_at <= now)
            .map(|e| (*e.key(), e.value().protocol))
            .collect();

        if due.is_empty() {
            return 0;
        }

        info!(count = due.len(), "Retrying failed initializations");

        let mut recovered = 0;
        for (address, protocol) in due {
            self.update_account_on_status_check_event(address, protocol).await;
            if self.accounts.contains_key(&address)
                && !self.failed_initializations.contains_key(&address)
            {
                recovered += 1;
            }
        }

        if recovered > 0 {
            info!(recovered, "Previously failed vaults initialized");
        }
        recovered
    }

    async fn periodic_retry_failed_initializations(self: Arc<Self>) {
        while self.is_running() {
            tokio::time::sleep(FAILED_INIT_RETRY_INTERVAL).await;
            if !self.failed_initializations.is_empty() {
                self.retry_failed_initializations().await;
            }
        }
    }

    /// Re-queue vaults whose due time is more than an hour in the past.
    /// Defense in depth against orphaned accounts; spreads the re-checks
    /// over a minute to avoid a thundering herd.
    pub async fn sweep_stale_accounts(&self) -> usize {
        let now = now_ms();
        let stale: Vec<(Address, Arc<AsyncMutex<CollateralVault>>, UnixMillis)> = self
            .accounts
            .iter()
            .filter_map(|entry| {
                let due = self.views.get(entry.key()).map(|v| v.time_of_next_update)?;
                (due < now.saturating_sub(STALE_THRESHOLD_MS))
                    .then(|| (*entry.key(), entry.value().clone(), due))
            })
            .collect();

        let mut swept = 0;
        for (address, vault_arc, due) in stale {
            // A held lock means a worker owns the vault and will reschedule
            // it itself.
            let Ok(mut vault) = vault_arc.try_lock() else { continue };

            let hours_behind = (now - due) as f64 / 3_600_000.0;
            warn!(vault = %address, hours_behind, "Found stale account, re-queueing");

            let new_due = now + rand::thread_rng().gen_range(0..60_000u64);
            vault.state_mut().time_of_next_update = new_due;
            self.views.insert(address, vault.state().clone());
            drop(vault);

            self.push_queue(new_due, address);
            swept += 1;
        }

        if swept > 0 {
            info!(swept, "Stale account sweep re-queued accounts");
        }
        swept
    }

    async fn periodic_sweep_stale_accounts(self: Arc<Self>) {
        while self.is_running() {
            tokio::time::sleep(STALE_SWEEP_INTERVAL).await;
            if !self.is_running() {
                break;
            }
            self.sweep_stale_accounts().await;

            // Keep the throttling ledgers from growing without bound.
            let max_age_ms = self.config.notifications.low_health_report_interval_seconds * 10_000;
            self.recently_posted_low_value
                .retain(|_, posted| now_ms().saturating_sub(*posted) < max_age_ms);
            self.error_cooldowns.evict_older_than(max_age_ms);
        }
    }

    /// Build and atomically write the checkpoint, then advance the saved
    /// cursor.
    pub fn save_state(&self) {
        let mut accounts = BTreeMap::new();
        for view in self.views.iter() {
            accounts.insert(*view.key(), view.value().snapshot());
        }

        let mut queue: Vec<(UnixMillis, Address)> = self
            .queue
            .lock()
            .iter()
            .map(|Reverse(entry)| (entry.due, entry.address))
            .collect();
        queue.sort_unstable();

        let failed_initializations: BTreeMap<Address, FailedInit> = self
            .failed_initializations
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();

        let latest_block = self.latest_block();
        let saved = SavedState {
            version: STATE_VERSION,
            accounts,
            queue,
            last_saved_block: latest_block,
            failed_initializations,
        };

        match state::save_state(&saved, &self.config.save_state_path) {
            Ok(()) => {
                self.last_saved_block.store(latest_block, Ordering::SeqCst);
                info!(block = latest_block, "State saved");
            }
            Err(e) => {
                error!(error = %e, "Failed to save state");
            }
        }
    }

    async fn periodic_save(self: Arc<Self>) {
        loop {
            tokio::time::sleep(self.config.save_interval()).await;
            if !self.is_running() {
                break;
            }
            self.save_state();
        }
    }

    /// Load the checkpoint, reconnect every vault, refresh health against
    /// the live chain, and rebuild the queue from scratch.
    pub async fn load_state(&self) {
        let Some(saved) = state::load_state(&self.config.save_state_path) else {
            return;
        };

        for (address, snapshot) in &saved.accounts {
            match connect_vault(*address, snapshot.protocol, &self.deps).await {
                Ok(mut vault) => {
                    vault.state_mut().apply_snapshot(snapshot);
                    info!(
                        vault = %address,
                        protocol = %snapshot.protocol,
                        internal_hs = snapshot.internal_health_score,
                        external_hs = snapshot.external_health_score,
                        "Account loaded"
                    );
                    self.views.insert(*address, vault.state().clone());
                    self.accounts.insert(*address, Arc::new(AsyncMutex::new(vault)));
                }
                Err(e) => {
                    error!(vault = %address, error = %e, "Failed to reconnect saved account");
                    self.track_failed_initialization(*address, snapshot.protocol);
                }
            }
        }

        for (address, failed) in saved.failed_initializations {
            self.failed_initializations.entry(address).or_insert(failed);
        }

        self.last_saved_block.store(saved.last_saved_block, Ordering::SeqCst);
        self.latest_block.store(saved.last_saved_block, Ordering::SeqCst);

        info!(
            accounts = self.accounts.len(),
            failed = self.failed_initializations.len(),
            from_block = saved.last_saved_block,
            "State loaded"
        );

        self.rebuild_queue().await;
    }

    /// Refresh every loaded account and enqueue it at its due time.
    async fn rebuild_queue(&self) {
        info!("Rebuilding queue from current account health");
        self.queue.lock().clear();

        let entries: Vec<(Address, Arc<AsyncMutex<CollateralVault>>)> = self
            .accounts
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();

        for (address, vault_arc) in entries {
            let mut vault = vault_arc.lock().await;
            let health = vault.update_liquidity().await;
            let next = vault.state().time_of_next_update;
            self.views.insert(address, vault.state().clone());
            drop(vault);

            self.push_queue(next, address);

            if health.internal_health_score.is_infinite()
                && health.external_health_score.is_infinite()
            {
                info!(vault = %address, due = next, "No borrow, scheduled at max interval");
            } else {
                info!(
                    vault = %address,
                    internal_hs = health.internal_health_score,
                    external_hs = health.external_health_score,
                    due = next,
                    "Queued"
                );
            }
        }

        info!(count = self.queue.lock().len(), "Queue rebuilt");
    }

    /// Every account's health view, ascending by min health score with
    /// address ties broken lexically for determinism.
    pub fn accounts_by_health_score(&self) -> Vec<AccountHealthEntry> {
        let mut entries: Vec<AccountHealthEntry> = self
            .views
            .iter()
            .map(|view| {
                let state = view.value();
                AccountHealthEntry {
                    account_address: state.address,
                    internal_health_score: state.internal_health_score,
                    external_health_score: state.external_health_score,
                    health_score: state.min_health_score(),
                    balance: state.balance_of,
                    internal_value_borrowed: state.internal_value_borrowed,
                    external_value_borrowed: state.external_value_borrowed,
                    symbol: state.underlying_asset_symbol.clone(),
                }
            })
            .collect();

        entries.sort_by(|a, b| {
            a.health_score
                .partial_cmp(&b.health_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.account_address.cmp(&b.account_address))
        });
        entries
    }

    async fn periodic_report_low_health_accounts(self: Arc<Self>) {
        let interval = self.config.notifications.low_health_report_interval();
        while self.is_running() {
            let entries = self.accounts_by_health_score();
            if let Some(message) = self.notifier.low_health_report_message(
                &entries,
                self.config.notifications.low_health_report_threshold,
                &self.config.watchlist_vaults,
            ) {
                self.notifier.post("Low Health Account Report", &message).await;
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Stop the scheduler: flip the lifecycle flag, wake every waiter,
    /// drain in-flight workers, and write a final checkpoint.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.queue_notify.notify_waiters();

        while self.active_workers.load(Ordering::SeqCst) > 0 {
            tokio::select! {
                _ = self.drained.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(100)) => {}
            }
        }

        self.save_state();
        info!(chain_id = self.chain_id, "Account monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::EulerVault;
    use liquidator_api::SwapQuoteClient;
    use liquidator_chain::{rpc_endpoint, TransactionSender};

    const TEST_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    fn test_monitor() -> Arc<AccountMonitor> {
        let mut config = ChainConfig::testing();
        config.save_state_path = tempfile::tempdir()
            .unwrap()
            .into_path()
            .join("state.json");
        let config = Arc::new(config);
        let rpc = rpc_endpoint("http://localhost:8545").unwrap();
        let sender = Arc::new(TransactionSender::new(TEST_KEY, rpc.clone(), config.chain_id).unwrap());
        let deps = VaultDeps {
            config: config.clone(),
            rpc,
            swap: Arc::new(SwapQuoteClient::new("", config.chain_id)),
            sender,
        };
        let notifier = Arc::new(Notifier::from_config(&config));
        AccountMonitor::new(config, deps, notifier, false, false)
    }

    fn offline_vault(monitor: &AccountMonitor, address: Address) -> CollateralVault {
        CollateralVault::Euler(EulerVault {
            state: VaultState::new(address, Protocol::Euler, monitor.chain_id()),
            deps: monitor.deps.clone(),
            asset_address: Address::repeat_byte(0xA0),
            underlying_asset_address: Address::repeat_byte(0xA2),
            target_vault: Address::repeat_byte(0xA3),
            vault_manager: Address::repeat_byte(0xA4),
            oracle_router: Address::repeat_byte(0xA5),
            unit_of_account: Address::repeat_byte(0xA6),
        })
    }

    #[test]
    fn backoff_follows_exponential_schedule() {
        assert_eq!(failed_init_backoff_seconds(1), 60);
        assert_eq!(failed_init_backoff_seconds(2), 120);
        assert_eq!(failed_init_backoff_seconds(3), 240);
        assert_eq!(failed_init_backoff_seconds(4), 480);
        assert_eq!(failed_init_backoff_seconds(5), 960);
        assert_eq!(failed_init_backoff_seconds(6), 1920);
        assert_eq!(failed_init_backoff_seconds(7), 3600);
        assert_eq!(failed_init_backoff_seconds(20), 3600);
    }

    #[test]
    fn pops_in_due_time_order_with_address_tiebreak() {
        let monitor = test_monitor();
        let a = Address::repeat_byte(1);
        let b = Address::repeat_byte(2);

        monitor.push_queue(200, b);
        monitor.push_queue(100, a);
        monitor.push_queue(100, b);

        assert_eq!(monitor.pop_next(1000), PopOutcome::Claimed(a));
        assert_eq!(monitor.pop_next(1000), PopOutcome::Claimed(b));
        // Duplicate for b while its worker is in flight: dropped.
        assert_eq!(monitor.pop_next(1000), PopOutcome::Dropped(b));
        assert_eq!(monitor.pop_next(1000), PopOutcome::Empty);
    }

    #[test]
    fn future_head_is_pushed_back() {
        let monitor = test_monitor();
        let a = Address::repeat_byte(1);
        monitor.push_queue(5000, a);

        assert_eq!(monitor.pop_next(1000), PopOutcome::NotDue(5000));
        // Entry stays queued and becomes claimable once due.
        assert_eq!(monitor.pop_next(5000), PopOutcome::Claimed(a));
    }

    #[test]
    fn duplicate_enqueue_dispatches_once() {
        // Insert (t1, A) then (t2 < t1, A): one dispatch at t2, the t1
        // entry dropped on pop.
        let monitor = test_monitor();
        let a = Address::repeat_byte(1);

        monitor.push_queue(2000, a);
        monitor.push_queue(1000, a);

        assert_eq!(monitor.pop_next(3000), PopOutcome::Claimed(a));
        assert_eq!(monitor.pop_next(3000), PopOutcome::Dropped(a));

        // After the worker finishes, the address is claimable again.
        monitor.processing.remove(&a);
        monitor.push_queue(2500, a);
        assert_eq!(monitor.pop_next(3000), PopOutcome::Claimed(a));
    }

    #[test]
    fn failed_init_attempts_accumulate() {
        let monitor = test_monitor();
        let a = Address::repeat_byte(9);

        let before = now_ms();
        monitor.track_failed_initialization(a, Protocol::Aave);
        {
            let entry = monitor.failed_initializations.get(&a).unwrap();
            assert_eq!(entry.attempts, 1);
            assert!(entry.retry_at >= before + 60_000);
            assert!(entry.retry_at <= now_ms() + 61_000);
        }

        monitor.track_failed_initialization(a, Protocol::Aave);
        let entry = monitor.failed_initializations.get(&a).unwrap();
        assert_eq!(entry.attempts, 2);
        assert!(entry.retry_at >= before + 120_000);
    }

    #[tokio::test]
    async fn stale_sweep_requeues_within_one_minute() {
        let monitor = test_monitor();
        let a = Address::repeat_byte(1);

        let mut vault = offline_vault(&monitor, a);
        vault.state_mut().time_of_next_update = now_ms().saturating_sub(STALE_THRESHOLD_MS + 60_000);
        monitor.views.insert(a, vault.state().clone());
        monitor.accounts.insert(a, Arc::new(AsyncMutex::new(vault)));

        let before = now_ms();
        let swept = monitor.sweep_stale_accounts().await;
        assert_eq!(swept, 1);

        let due = monitor.views.get(&a).unwrap().time_of_next_update;
        assert!(due >= before);
        assert!(due <= now_ms() + 60_000);

        // The vault is back in the queue.
        assert!(matches!(monitor.pop_next(due + 1), PopOutcome::Claimed(addr) if addr == a));
    }

    #[tokio::test]
    async fn stale_sweep_ignores_fresh_accounts() {
        let monitor = test_monitor();
        let a = Address::repeat_byte(1);

        let mut vault = offline_vault(&monitor, a);
        vault.state_mut().time_of_next_update = now_ms() + 10_000;
        monitor.views.insert(a, vault.state().clone());
        monitor.accounts.insert(a, Arc::new(AsyncMutex::new(vault)));

        assert_eq!(monitor.sweep_stale_accounts().await, 0);
    }

    #[tokio::test]
    async fn checkpoint_roundtrip_preserves_views_and_queue() {
        let monitor = test_monitor();
        let a = Address::repeat_byte(1);
        let b = Address::repeat_byte(2);

        for (address, hs) in [(a, 1.2), (b, f64::INFINITY)] {
            let mut vault = offline_vault(&monitor, address);
            vault.state_mut().internal_health_score = hs;
            vault.state_mut().external_health_score = hs;
            vault.state_mut().time_of_next_update = now_ms() + 30_000;
            monitor.views.insert(address, vault.state().clone());
            monitor.accounts.insert(address, Arc::new(AsyncMutex::new(vault)));
        }
        monitor.push_queue(now_ms() + 30_000, a);
        monitor.push_queue(now_ms() + 30_000, b);
        monitor.set_latest_block(777);

        monitor.save_state();
        assert_eq!(monitor.last_saved_block(), 777);

        let saved = state::load_state(&monitor.config.save_state_path).unwrap();
        assert_eq!(saved.accounts.len(), 2);
        assert_eq!(saved.queue.len(), 2);
        assert_eq!(saved.last_saved_block, 777);
        assert!(saved.accounts.get(&b).unwrap().internal_health_score.is_infinite());

        // Save -> load -> save produces identical bytes (queue is kept
        // sorted on save).
        let first = std::fs::read(&monitor.config.save_state_path).unwrap();
        monitor.save_state();
        let second = std::fs::read(&monitor.config.save_state_path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn health_view_sorted_ascending_with_infinites_last() {
        let monitor = test_monitor();
        let risky = Address::repeat_byte(1);
        let safe = Address::repeat_byte(2);
        let empty = Address::repeat_byte(3);

        for (address, hs) in [(safe, 2.0), (risky, 1.01), (empty, f64::INFINITY)] {
            let mut state = VaultState::new(address, Protocol::Euler, monitor.chain_id());
            state.internal_health_score = hs;
            state.external_health_score = hs + 0.5;
            monitor.views.insert(address, state);
        }

        let entries = monitor.accounts_by_health_score();
        assert_eq!(entries[0].account_address, risky);
        assert_eq!(entries[1].account_address, safe);
        assert_eq!(entries[2].account_address, empty);
        assert!(entries[2].health_score.is_infinite());
    }
}
