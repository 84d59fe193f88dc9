//! The reconciler: turns ledger lease events into daemon calls and
//! durable lease records, and converges every failure onto a refunded
//! tenant and a re-offerable slot.
//!
//! One task owns this struct. The lease lock serializes the lease-update
//! critical sections (acquire, expiry pass, terminate, prune) against
//! each other; the transaction queue has its own lock. The lease lock is
//! always taken before any queue work, never the other way around.

mod catchup;
mod fix;
mod prune;

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use sashi_core::config::AgentConfig;
use sashi_core::lease::{Lease, LeaseStatus};
use sashi_core::store::{InstanceStore, LeaseStore};
use serde_json::json;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::daemon_client::{DaemonClient, DaemonClientError};
use crate::expiry::{ExpiryEntry, ExpiryTimeline};
use crate::halt::HaltDetector;
use crate::ledger::uri::{self, LeaseUri};
use crate::ledger::{
    amounts_equal, AcquireEvent, ExtendEvent, HookConfig, HostRegistration, LedgerClient,
    TerminateEvent,
};
use crate::locks::SpinLock;
use crate::txqueue::{LedgerAction, QueueContext, TxQueue};

/// Fraction of the acquire window the daemon may stay busy before the
/// acquire is abandoned.
const BUSY_BUDGET_FRACTION: f64 = 0.4;
/// Fraction of the acquire window after which a finished create is
/// still treated as timed out, since the tenant has likely given up.
const CREATE_BUDGET_FRACTION: f64 = 0.8;

/// Reason string reported when an acquire misses its window budget.
pub const SASHI_TIMEOUT_REASON: &str = "sashi_timeout";

/// Everything the reconciler needs at construction.
pub struct ReconcilerDeps {
    /// Agent configuration (rewritten on lease-amount reconciliation).
    pub config: AgentConfig,
    /// Path the configuration is rewritten to.
    pub config_path: PathBuf,
    /// Governance vote file path.
    pub governance_path: PathBuf,
    /// The ledger.
    pub client: Arc<dyn LedgerClient>,
    /// The lifecycle daemon.
    pub daemon: DaemonClient,
    /// Lease store (owned by this service).
    pub store: LeaseStore,
    /// Instance store (read-only here; the daemon owns it).
    pub instance_store: InstanceStore,
    /// This host's registration.
    pub registration: HostRegistration,
    /// Hook parameters at startup.
    pub hook: HookConfig,
}

/// Reconciler state. See the module docs for the concurrency contract.
pub struct Reconciler {
    pub(crate) config: AgentConfig,
    pub(crate) config_path: PathBuf,
    pub(crate) client: Arc<dyn LedgerClient>,
    pub(crate) daemon: DaemonClient,
    pub(crate) store: LeaseStore,
    pub(crate) instance_store: InstanceStore,
    pub(crate) queue: TxQueue,
    pub(crate) queue_ctx: QueueContext,
    pub(crate) timeline: ExpiryTimeline,
    pub(crate) expiration_queue: VecDeque<ExpiryEntry>,
    pub(crate) halt: HaltDetector,
    pub(crate) lease_lock: SpinLock,
    pub(crate) active_count: u64,
    pub(crate) registration: HostRegistration,
    pub(crate) hook: HookConfig,
    /// Pending opportunistic rebate request, de-synchronized across
    /// hosts by a random delay.
    pub(crate) rebate_at: Option<Instant>,
}

impl Reconciler {
    /// Build the reconciler and rehydrate the expiry timeline from the
    /// lease store.
    #[must_use]
    pub fn new(deps: ReconcilerDeps) -> Self {
        let queue_ctx = QueueContext {
            client: Arc::clone(&deps.client),
            store: deps.store.clone(),
            governance_path: deps.governance_path,
        };
        let halt = HaltDetector::new(
            deps.config.scheduler.halt_timeout,
            deps.config.scheduler.halt_threshold,
        );
        let mut reconciler = Self {
            queue: TxQueue::new(deps.config.xrpl.affordable_extra_fee),
            queue_ctx,
            timeline: ExpiryTimeline::new(),
            expiration_queue: VecDeque::new(),
            halt,
            lease_lock: SpinLock::new(),
            active_count: 0,
            config: deps.config,
            config_path: deps.config_path,
            client: deps.client,
            daemon: deps.daemon,
            store: deps.store,
            instance_store: deps.instance_store,
            registration: deps.registration,
            hook: deps.hook,
            rebate_at: None,
        };
        reconciler.rebuild_timeline();
        reconciler
    }

    /// Current wall clock, unix seconds.
    pub(crate) fn now(&self) -> u64 {
        chrono::Utc::now().timestamp().unsigned_abs()
    }

    /// Mirror the `Acquired`/`Extended` lease rows into the in-memory
    /// timeline.
    pub(crate) fn rebuild_timeline(&mut self) {
        self.timeline = ExpiryTimeline::new();
        match self.store.live() {
            Ok(leases) => {
                for lease in &leases {
                    self.timeline.insert(ExpiryEntry {
                        tx_hash: lease.tx_hash.clone(),
                        container_name: lease.container_name.clone(),
                        tenant: lease.tenant_address.clone(),
                        expires_at: lease.timestamp + lease.life_moments * self.hook.moment_size,
                    });
                }
                self.active_count = leases.len() as u64;
            }
            Err(e) => error!("timeline rebuild failed: {e}"),
        }
    }

    /// The scheduler tick: halt check, expiration pass, queue drain.
    pub async fn tick(&mut self) {
        let now = self.now();
        let halted = self.halt.check(now);

        for entry in self.timeline.pop_expired(now) {
            info!(container_name = %entry.container_name, "lease expired");
            self.expiration_queue.push_back(entry);
        }

        if !halted && !self.expiration_queue.is_empty() {
            let guard = self.lease_lock.acquire().await;
            while let Some(entry) = self.expiration_queue.pop_front() {
                self.expire_entry(&entry).await;
                // A halt observed mid-drain parks the rest for the
                // next tick.
                if self.halt.check(self.now()) {
                    break;
                }
            }
            drop(guard);
        }

        if let Some(rebate_at) = self.rebate_at {
            if Instant::now() >= rebate_at {
                self.rebate_at = None;
                self.queue.enqueue(LedgerAction::RequestRebate);
            }
        }

        self.queue.drain(&self.queue_ctx).await;
    }

    /// Destroy one expired lease: container, lease row, counters, and
    /// the re-offer flow. Caller holds the lease lock.
    pub(crate) async fn expire_entry(&mut self, entry: &ExpiryEntry) {
        info!(container_name = %entry.container_name, "expiring instance");

        let lease_uri = self.decode_token_uri(&entry.container_name).await;

        match self.daemon.destroy(&entry.container_name).await {
            Ok(()) => {}
            Err(DaemonClientError::Daemon { reason, .. }) if reason == "no_container" => {
                warn!(container_name = %entry.container_name, "expired instance already gone");
            }
            Err(e) => {
                // Keep going: the slot must be freed on the ledger even
                // when local teardown misbehaves; the pruner retries
                // the container later.
                error!(container_name = %entry.container_name, "destroy failed: {e}");
            }
        }

        if let Err(e) = self.store.update_status(&entry.tx_hash, LeaseStatus::Destroyed) {
            warn!(tx_hash = %entry.tx_hash, "lease row destroy mark failed: {e}");
        }
        self.active_count = self.active_count.saturating_sub(1);

        self.reoffer(&entry.container_name, lease_uri, Some(&entry.tx_hash))
            .await;
        self.enqueue_reg_update();
    }

    /// Fetch and decode a lease token's URI, if the token still exists.
    pub(crate) async fn decode_token_uri(&self, token_id: &str) -> Option<LeaseUri> {
        match self.client.lease_token(token_id).await {
            Ok(Some(token)) => match uri::decode(&token.uri) {
                Ok(lease_uri) => Some(lease_uri),
                Err(e) => {
                    warn!(token_id, "lease token uri undecodable: {e}");
                    None
                }
            }
            Ok(None) => None,
            Err(e) => {
                warn!(token_id, "lease token lookup failed: {e}");
                None
            }
        }
    }

    /// The re-offer flow. Caller holds the lease lock.
    ///
    /// Expires the token when the lease failed short of handover, then
    /// refreshes the hook config (price changes) and offers the slot
    /// again; a successful offer hard-deletes the lease row.
    pub(crate) async fn reoffer(
        &mut self,
        token_id: &str,
        lease_uri: Option<LeaseUri>,
        lease_tx: Option<&str>,
    ) {
        let row = match lease_tx {
            Some(tx_hash) => self.store.get(tx_hash).unwrap_or_default(),
            None => None,
        };

        let needs_expire = match &row {
            None => true,
            Some(lease) => matches!(
                lease.status,
                LeaseStatus::Destroyed | LeaseStatus::Failed | LeaseStatus::SashiTimeout
            ),
        };
        if needs_expire {
            self.queue.enqueue(LedgerAction::ExpireLease {
                token_id: token_id.to_string(),
            });
            if let Some(lease) = &row {
                if let Err(e) = self.store.update_status(&lease.tx_hash, LeaseStatus::Burned) {
                    warn!(tx_hash = %lease.tx_hash, "burn mark failed: {e}");
                }
            }
        }

        // Pick up any price change published since startup.
        match self.client.hook_config().await {
            Ok(hook) => self.hook = hook,
            Err(e) => warn!("hook config refresh failed, using cached: {e}"),
        }

        let Some(lease_uri) = lease_uri else {
            warn!(token_id, "no decodable lease uri, slot not re-offered");
            return;
        };

        self.queue.enqueue(LedgerAction::OfferLease {
            lease_index: lease_uri.lease_index,
            amount: self.config.xrpl.lease_amount,
            tos_hash: self.hook.tos_hash.clone(),
            outbound_ip: lease_uri.outbound_ip,
            delete_lease_tx: lease_tx.map(str::to_string),
        });
    }

    pub fn enqueue_reg_update(&mut self) {
        self.queue.enqueue(LedgerAction::UpdateRegInfo {
            active: self.active_count,
            total: self.config.system.max_instance_count,
        });
    }

    /// Handle an `AcquireLease` event.
    pub async fn handle_acquire(&mut self, event: AcquireEvent) {
        if event.host != self.config.xrpl.address {
            warn!(tx_hash = %event.tx_hash, "acquire for another host ignored");
            return;
        }

        let guard = self.lease_lock.acquire().await;

        // Token ownership and amount validation; failures refund.
        let token = match self.client.lease_token(&event.token_id).await {
            Ok(Some(token)) => token,
            Ok(None) => {
                warn!(token_id = %event.token_id, "acquired token does not exist");
                self.refuse_acquire(&event, "no_lease_token");
                return;
            }
            Err(e) => {
                warn!("token lookup failed: {e}");
                self.refuse_acquire(&event, "lease_validation_failed");
                return;
            }
        };
        if token.owner != event.tenant {
            warn!(token_id = %event.token_id, "acquired token not owned by tenant");
            self.refuse_acquire(&event, "lease_not_owned");
            return;
        }
        let lease_uri = match uri::decode(&token.uri) {
            Ok(lease_uri) => lease_uri,
            Err(e) => {
                warn!(token_id = %event.token_id, "lease uri undecodable: {e}");
                self.refuse_acquire(&event, "lease_uri_invalid");
                return;
            }
        };
        if !amounts_equal(event.amount, lease_uri.lease_amount) {
            warn!(
                paid = event.amount,
                expected = lease_uri.lease_amount,
                "acquire amount mismatch"
            );
            self.refuse_acquire(&event, "amount_mismatch");
            return;
        }

        let now = self.now();
        if let Err(e) = self.store.insert(&Lease {
            tx_hash: event.tx_hash.clone(),
            tenant_address: event.tenant.clone(),
            container_name: event.token_id.clone(),
            life_moments: 1,
            timestamp: now,
            created_on_ledger: event.ledger_index,
            status: LeaseStatus::Acquiring,
        }) {
            // A duplicate acquire replay lands here; nothing to do.
            warn!(tx_hash = %event.tx_hash, "lease row insert failed: {e}");
            return;
        }

        let window = self.hook.lease_acquire_window.max(1);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
        let busy_budget = Duration::from_secs_f64(window as f64 * BUSY_BUDGET_FRACTION);
        let started = Instant::now();

        if let Err(e) = self.daemon.wait_idle(busy_budget).await {
            warn!("daemon busy past acquire budget: {e}");
            self.fail_acquire(&event, Some(lease_uri), LeaseStatus::SashiTimeout, false)
                .await;
            drop(guard);
            return;
        }

        let overrides = if event.payload.config.is_null() {
            json!({})
        } else {
            event.payload.config.clone()
        };
        let create_request = json!({
            "type": "create",
            "container_name": event.token_id,
            "owner_pubkey": event.payload.owner_pubkey,
            "contract_id": event.payload.contract_id,
            "image": event.payload.image,
            "outbound_ipv6": lease_uri.outbound_ip.clone().unwrap_or_default(),
            "outbound_net_interface": self.config.networking.ipv6.interface,
            "config": overrides,
        });

        let instance_info = match self.daemon.create(&create_request).await {
            Ok(info) => info,
            Err(e) => {
                error!(tx_hash = %event.tx_hash, "instance create failed: {e}");
                // initiate_error means the daemon already rolled back.
                let destroy_needed = !matches!(
                    &e,
                    DaemonClientError::Daemon { kind, .. } if kind == "initiate_error" || kind == "create_error"
                );
                self.fail_acquire(&event, Some(lease_uri), LeaseStatus::Failed, destroy_needed)
                    .await;
                drop(guard);
                return;
            }
        };

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
        let create_budget = Duration::from_secs_f64(window as f64 * CREATE_BUDGET_FRACTION);
        if started.elapsed() > create_budget {
            warn!(tx_hash = %event.tx_hash, "create exceeded acquire window, tenant likely gone");
            self.fail_acquire(&event, Some(lease_uri), LeaseStatus::SashiTimeout, true)
                .await;
            drop(guard);
            return;
        }

        let expires_at = now + self.hook.moment_size;
        self.timeline.insert(ExpiryEntry {
            tx_hash: event.tx_hash.clone(),
            container_name: event.token_id.clone(),
            tenant: event.tenant.clone(),
            expires_at,
        });
        self.active_count += 1;

        self.enqueue_reg_update();
        self.queue.enqueue(LedgerAction::AcquireSuccess {
            acquire_tx_hash: event.tx_hash.clone(),
            tenant: event.tenant.clone(),
            instance_info,
        });

        if let Err(e) = self.store.mark_acquired(&event.tx_hash, event.ledger_index, now) {
            error!(tx_hash = %event.tx_hash, "acquired mark failed: {e}");
        }
        info!(
            container_name = %event.token_id,
            tenant = %event.tenant,
            "lease acquired"
        );
        drop(guard);
    }

    /// Reject an acquire before any lease row exists: refund only.
    fn refuse_acquire(&mut self, event: &AcquireEvent, reason: &str) {
        self.queue.enqueue(LedgerAction::AcquireError {
            acquire_tx_hash: event.tx_hash.clone(),
            tenant: event.tenant.clone(),
            amount: event.amount,
            reason: reason.to_string(),
        });
    }

    /// Converge a failed acquire: mark the row, tear down any instance,
    /// free the slot, refund the tenant. Caller holds the lease lock.
    async fn fail_acquire(
        &mut self,
        event: &AcquireEvent,
        lease_uri: Option<LeaseUri>,
        status: LeaseStatus,
        destroy_instance: bool,
    ) {
        if let Err(e) = self.store.update_status(&event.tx_hash, status) {
            warn!(tx_hash = %event.tx_hash, "failure mark failed: {e}");
        }

        if destroy_instance {
            match self.daemon.destroy(&event.token_id).await {
                Ok(()) => {}
                Err(DaemonClientError::Daemon { reason, .. }) if reason == "no_container" => {}
                Err(e) => warn!(container_name = %event.token_id, "failure destroy failed: {e}"),
            }
        }

        self.reoffer(&event.token_id, lease_uri, Some(&event.tx_hash)).await;

        let reason = match status {
            LeaseStatus::SashiTimeout => SASHI_TIMEOUT_REASON.to_string(),
            _ => "acquire_failed".to_string(),
        };
        self.queue.enqueue(LedgerAction::AcquireError {
            acquire_tx_hash: event.tx_hash.clone(),
            tenant: event.tenant.clone(),
            amount: event.amount,
            reason,
        });
    }

    /// Handle an `ExtendLease` event.
    pub async fn handle_extend(&mut self, event: ExtendEvent) {
        if event.host != self.config.xrpl.address {
            warn!(tx_hash = %event.tx_hash, "extend for another host ignored");
            return;
        }

        match self.try_extend(&event).await {
            Ok(expiry_moment) => {
                info!(container_name = %event.token_id, expiry_moment, "lease extended");
                self.queue.enqueue(LedgerAction::ExtendSuccess {
                    extend_tx_hash: event.tx_hash.clone(),
                    tenant: event.tenant.clone(),
                    expiry_moment,
                });
            }
            Err(reason) => {
                warn!(container_name = %event.token_id, reason, "extend refused");
                self.queue.enqueue(LedgerAction::ExtendError {
                    extend_tx_hash: event.tx_hash.clone(),
                    tenant: event.tenant.clone(),
                    reason: reason.to_string(),
                    amount: event.amount,
                });
            }
        }
    }

    async fn try_extend(&mut self, event: &ExtendEvent) -> Result<u64, &'static str> {
        let token = self
            .client
            .lease_token(&event.token_id)
            .await
            .ok()
            .flatten()
            .ok_or("no_lease_token")?;
        if token.owner != event.tenant {
            return Err("lease_not_owned");
        }
        let lease_uri = uri::decode(&token.uri).map_err(|_| "lease_uri_invalid")?;

        // Payment must be a whole multiple of the encoded amount.
        if lease_uri.lease_amount <= 0.0 {
            return Err("lease_uri_invalid");
        }
        let ratio = event.amount / lease_uri.lease_amount;
        let whole = ratio.round();
        if whole < 1.0 || !amounts_equal(ratio, whole) {
            return Err("invalid_amount");
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let extending_moments = whole as u64;

        let entry = self
            .timeline
            .get(&event.token_id)
            .cloned()
            .ok_or("no_active_lease")?;
        let lease = self
            .store
            .get(&entry.tx_hash)
            .map_err(|_| "db_error")?
            .ok_or("no_active_lease")?;

        let new_expiry = self
            .timeline
            .extend(&event.token_id, extending_moments * self.hook.moment_size)
            .ok_or("no_active_lease")?;
        self.store
            .mark_extended(&entry.tx_hash, lease.life_moments + extending_moments)
            .map_err(|_| "db_error")?;

        self.client
            .moment(Some(new_expiry))
            .await
            .map_err(|_| "ledger_error")
    }

    /// Handle a `TerminateLease` event.
    pub async fn handle_terminate(&mut self, event: TerminateEvent) {
        let Some(entry) = self.timeline.get(&event.token_id).cloned() else {
            warn!(token_id = %event.token_id, "terminate for unknown lease ignored");
            return;
        };
        if entry.tenant != event.tenant {
            warn!(token_id = %event.token_id, "terminate by non-tenant ignored");
            return;
        }

        // Pull the entry out of the timeline either way; it now lives
        // in the expiration queue.
        if let Some(entry) = self.timeline.remove(&event.token_id) {
            self.expiration_queue.push_back(entry);
        }

        if self.halt.is_halted() {
            info!(token_id = %event.token_id, "ledger halted, terminate deferred");
            return;
        }

        let guard = self.lease_lock.acquire().await;
        while let Some(entry) = self.expiration_queue.pop_front() {
            self.expire_entry(&entry).await;
        }
        drop(guard);
    }

    /// Queue a rebate request after a random delay so hosts do not
    /// stampede the hook together.
    pub fn schedule_rebate(&mut self) {
        let delay = Duration::from_secs(u64::from(rand::random::<u8>()));
        info!(delay_secs = delay.as_secs(), "rebate request scheduled");
        self.rebate_at = Some(Instant::now() + delay);
    }

    /// Current active-instance counter.
    #[must_use]
    pub fn active_count(&self) -> u64 {
        self.active_count
    }

    /// Immutable view of the expiry timeline.
    #[must_use]
    pub fn timeline(&self) -> &ExpiryTimeline {
        &self.timeline
    }

    /// The halt detector (ticks are fed from the event loop).
    pub fn halt_mut(&mut self) -> &mut HaltDetector {
        &mut self.halt
    }

    /// Drain the queue outside a tick (startup paths).
    pub async fn drain_queue(&mut self) {
        self.queue.drain(&self.queue_ctx).await;
    }

    /// Enqueue the startup account-preparation action.
    pub fn prepare_account(&mut self) {
        self.queue.enqueue(LedgerAction::PrepareAccount);
    }

    /// Enqueue one heartbeat payload with the heartbeat retry policy.
    pub fn enqueue_heartbeat(&mut self, vote: Option<crate::ledger::HeartbeatVote>) {
        self.queue.enqueue_with(
            LedgerAction::Heartbeat { vote },
            crate::heartbeat::HEARTBEAT_MAX_ATTEMPTS,
            crate::heartbeat::HEARTBEAT_RETRY_DELAY,
        );
    }

    /// Read access to queued-action internals for integration tests.
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// This host's ledger account address.
    #[must_use]
    pub fn host_address(&self) -> &str {
        &self.config.xrpl.address
    }

    /// This host's registration as fetched at startup.
    #[must_use]
    pub fn registration(&self) -> &HostRegistration {
        &self.registration
    }

    /// Advance the watched-ledger checkpoint after an event is fully
    /// handled. The stored value never moves backwards.
    pub fn advance_checkpoint(&self, ledger_index: u64) {
        if ledger_index == 0 {
            return;
        }
        if let Err(e) = self.store.set_last_watched_ledger(ledger_index) {
            warn!(ledger_index, "checkpoint advance failed: {e}");
        }
    }
}
