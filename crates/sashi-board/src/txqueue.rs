//! Single-writer queue of ledger-bound actions.
//!
//! The scheduler drains the queue once per tick under the queue's own
//! spin lock; actions complete in enqueue order, one at a time. Each
//! entry carries a [`SubmissionRef`] holding the last submitted tx
//! hash; before any retry the ledger is asked whether that hash already
//! validated, which makes every action at-most-once effective even when
//! the submission path timed out.
//!
//! A `took too long` failure escalates the global fee uplift: on
//! attempt `k` of `N` the uplift becomes `max_extra_fee × k / N` and
//! applies to every subsequent submission until a drain completes an
//! action cleanly, which resets it.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use sashi_core::config::GovernanceFile;
use sashi_core::store::LeaseStore;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::ledger::{HeartbeatVote, LedgerClient, LedgerError, SubmissionRef};
use crate::locks::SpinLock;

/// Default attempt budget for queued actions.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// A ledger-bound action.
#[derive(Debug, Clone)]
pub enum LedgerAction {
    /// Push the active-instance count (and totals) to the registry.
    UpdateRegInfo {
        /// Active instance count.
        active: u64,
        /// Total instance slots.
        total: u64,
    },
    /// Offer a lease slot for sale. On success the named lease row is
    /// hard-deleted.
    OfferLease {
        /// Slot index.
        lease_index: u32,
        /// Offer price.
        amount: f64,
        /// Terms-of-service hash embedded in the offer.
        tos_hash: String,
        /// Outbound IP carried in the URI.
        outbound_ip: Option<String>,
        /// Lease row to delete once the offer validates.
        delete_lease_tx: Option<String>,
    },
    /// Mint a missing slot and offer it.
    OfferMintedLease {
        /// Slot index.
        lease_index: u32,
        /// Offer price.
        amount: f64,
        /// Terms-of-service hash embedded in the offer.
        tos_hash: String,
        /// Outbound IP carried in the URI.
        outbound_ip: Option<String>,
    },
    /// Expire (burn) a sold lease token.
    ExpireLease {
        /// Token to expire.
        token_id: String,
    },
    /// Burn an unsold slot (slot-count fix).
    BurnLease {
        /// Token to burn.
        token_id: String,
    },
    /// Tell the tenant their acquire succeeded.
    AcquireSuccess {
        /// The acquire transaction being answered.
        acquire_tx_hash: String,
        /// Tenant account.
        tenant: String,
        /// Instance connection info.
        instance_info: Value,
    },
    /// Tell the tenant their acquire failed; refunds the payment.
    AcquireError {
        /// The acquire transaction being answered.
        acquire_tx_hash: String,
        /// Tenant account.
        tenant: String,
        /// Amount to refund.
        amount: f64,
        /// Machine-readable reason.
        reason: String,
    },
    /// Tell the tenant their extend succeeded.
    ExtendSuccess {
        /// The extend transaction being answered.
        extend_tx_hash: String,
        /// Tenant account.
        tenant: String,
        /// New expiry moment.
        expiry_moment: u64,
    },
    /// Tell the tenant their extend failed; refunds the payment.
    ExtendError {
        /// The extend transaction being answered.
        extend_tx_hash: String,
        /// Tenant account.
        tenant: String,
        /// Machine-readable reason.
        reason: String,
        /// Amount to refund.
        amount: f64,
    },
    /// Refund a tenant outside the error-response paths.
    RefundTenant {
        /// The transaction being refunded.
        origin_tx_hash: String,
        /// Tenant account.
        tenant: String,
        /// Amount to refund.
        amount: f64,
    },
    /// Host-alive heartbeat, optionally carrying one governance vote.
    Heartbeat {
        /// The vote, if any.
        vote: Option<HeartbeatVote>,
    },
    /// Startup account preparation.
    PrepareAccount,
    /// Registration-fee rebate request.
    RequestRebate,
}

impl LedgerAction {
    fn name(&self) -> &'static str {
        match self {
            Self::UpdateRegInfo { .. } => "updateRegInfo",
            Self::OfferLease { .. } => "offerLease",
            Self::OfferMintedLease { .. } => "offerMintedLease",
            Self::ExpireLease { .. } => "expireLease",
            Self::BurnLease { .. } => "burnLease",
            Self::AcquireSuccess { .. } => "acquireSuccess",
            Self::AcquireError { .. } => "acquireError",
            Self::ExtendSuccess { .. } => "extendSuccess",
            Self::ExtendError { .. } => "extendError",
            Self::RefundTenant { .. } => "refundTenant",
            Self::Heartbeat { .. } => "heartbeat",
            Self::PrepareAccount => "prepareAccount",
            Self::RequestRebate => "requestRebate",
        }
    }
}

#[derive(Debug)]
struct QueueEntry {
    action: LedgerAction,
    sref: SubmissionRef,
    attempts: u32,
    max_attempts: u32,
    delay: Duration,
    not_before: Option<Instant>,
}

/// Everything a drain needs besides the queue itself.
pub struct QueueContext {
    /// The ledger to submit against.
    pub client: Arc<dyn LedgerClient>,
    /// Lease store, for post-offer row deletion.
    pub store: LeaseStore,
    /// Governance file, pruned when votes are rejected.
    pub governance_path: PathBuf,
}

/// The FIFO of pending ledger actions.
pub struct TxQueue {
    entries: VecDeque<QueueEntry>,
    lock: SpinLock,
    max_extra_fee: u64,
    uplift: u64,
}

impl TxQueue {
    /// Queue with the configured fee-escalation ceiling.
    #[must_use]
    pub fn new(max_extra_fee: u64) -> Self {
        Self {
            entries: VecDeque::new(),
            lock: SpinLock::new(),
            max_extra_fee,
            uplift: 0,
        }
    }

    /// Enqueue an action with the default retry budget. Returns its
    /// submission ref.
    pub fn enqueue(&mut self, action: LedgerAction) -> SubmissionRef {
        self.enqueue_with(action, DEFAULT_MAX_ATTEMPTS, Duration::ZERO)
    }

    /// Enqueue with an explicit retry budget and retry delay.
    pub fn enqueue_with(
        &mut self,
        action: LedgerAction,
        max_attempts: u32,
        delay: Duration,
    ) -> SubmissionRef {
        let sref = SubmissionRef::new();
        debug!(action = action.name(), "enqueued ledger action");
        self.entries.push_back(QueueEntry {
            action,
            sref: sref.clone(),
            attempts: 0,
            max_attempts,
            delay,
            not_before: None,
        });
        sref
    }

    /// Pending entry count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drain ready entries in order under the queue lock.
    ///
    /// Stops at the first entry whose retry delay has not elapsed, so
    /// order is preserved; the next tick resumes.
    pub async fn drain(&mut self, ctx: &QueueContext) {
        let _guard = self.lock.acquire().await;
        let now = Instant::now();

        while let Some(front) = self.entries.front() {
            if front.not_before.is_some_and(|t| t > now) {
                break;
            }
            let mut entry = self.entries.pop_front().expect("nonempty");

            // A retry first asks the ledger whether the previous
            // attempt validated after we gave up on it.
            if entry.attempts > 0 {
                if let Some(hash) = entry.sref.last() {
                    match ctx.client.tx_validated(&hash).await {
                        Ok(true) => {
                            info!(
                                action = entry.action.name(),
                                tx_hash = %hash,
                                "previous submission validated, skipping retry"
                            );
                            self.on_success(&entry, ctx);
                            continue;
                        }
                        Ok(false) => {}
                        Err(e) => {
                            warn!("validated-tx check failed, retrying later: {e}");
                            self.requeue(entry);
                            break;
                        }
                    }
                }
            }

            match execute(&entry, ctx).await {
                Ok(()) => self.on_success(&entry, ctx),
                Err(LedgerError::VoteRejected { candidate_id }) => {
                    remove_candidate(&ctx.governance_path, &candidate_id);
                }
                Err(e) => {
                    entry.attempts += 1;
                    if matches!(e, LedgerError::TookTooLong) {
                        self.escalate(&entry, ctx);
                    }
                    if entry.attempts < entry.max_attempts {
                        warn!(
                            action = entry.action.name(),
                            attempts = entry.attempts,
                            "ledger action failed, will retry: {e}"
                        );
                        self.requeue(entry);
                    } else {
                        error!(
                            action = entry.action.name(),
                            attempts = entry.attempts,
                            "ledger action dropped after retries: {e}"
                        );
                    }
                }
            }
        }
    }

    fn requeue(&mut self, mut entry: QueueEntry) {
        entry.not_before = (!entry.delay.is_zero()).then(|| Instant::now() + entry.delay);
        self.entries.push_back(entry);
    }

    fn escalate(&mut self, entry: &QueueEntry, ctx: &QueueContext) {
        let uplift = self.max_extra_fee * u64::from(entry.attempts) / u64::from(entry.max_attempts);
        if uplift != self.uplift {
            info!(uplift, "escalating submission fee uplift");
            self.uplift = uplift;
            ctx.client.set_fee_uplift(uplift);
        }
    }

    fn on_success(&mut self, entry: &QueueEntry, ctx: &QueueContext) {
        if self.uplift != 0 {
            info!("resetting submission fee uplift");
            self.uplift = 0;
            ctx.client.set_fee_uplift(0);
        }
        if let LedgerAction::OfferLease {
            delete_lease_tx: Some(tx_hash),
            ..
        } = &entry.action
        {
            if let Err(e) = ctx.store.delete(tx_hash) {
                warn!(tx_hash = %tx_hash, "offered lease row delete failed: {e}");
            }
        }
    }
}

async fn execute(entry: &QueueEntry, ctx: &QueueContext) -> Result<(), LedgerError> {
    let client = &ctx.client;
    let sref = &entry.sref;
    match &entry.action {
        LedgerAction::UpdateRegInfo { active, total } => {
            client.update_reg_info(*active, *total, sref).await
        }
        LedgerAction::OfferLease {
            lease_index,
            amount,
            tos_hash,
            outbound_ip,
            ..
        } => {
            client
                .offer_lease(*lease_index, *amount, tos_hash, outbound_ip.as_deref(), sref)
                .await
        }
        LedgerAction::OfferMintedLease {
            lease_index,
            amount,
            tos_hash,
            outbound_ip,
        } => {
            client
                .offer_minted_lease(*lease_index, *amount, tos_hash, outbound_ip.as_deref(), sref)
                .await
        }
        LedgerAction::ExpireLease { token_id } => client.expire_lease(token_id, sref).await,
        LedgerAction::BurnLease { token_id } => client.burn_lease(token_id, sref).await,
        LedgerAction::AcquireSuccess {
            acquire_tx_hash,
            tenant,
            instance_info,
        } => {
            client
                .acquire_success(acquire_tx_hash, tenant, instance_info, sref)
                .await
        }
        LedgerAction::AcquireError {
            acquire_tx_hash,
            tenant,
            amount,
            reason,
        } => {
            client
                .acquire_error(acquire_tx_hash, tenant, *amount, reason, sref)
                .await
        }
        LedgerAction::ExtendSuccess {
            extend_tx_hash,
            tenant,
            expiry_moment,
        } => {
            client
                .extend_success(extend_tx_hash, tenant, *expiry_moment, sref)
                .await
        }
        LedgerAction::ExtendError {
            extend_tx_hash,
            tenant,
            reason,
            amount,
        } => {
            client
                .extend_error(extend_tx_hash, tenant, reason, *amount, sref)
                .await
        }
        LedgerAction::RefundTenant {
            origin_tx_hash,
            tenant,
            amount,
        } => client.refund_tenant(origin_tx_hash, tenant, *amount, sref).await,
        LedgerAction::Heartbeat { vote } => client.heartbeat(vote.as_ref(), sref).await,
        LedgerAction::PrepareAccount => client.prepare_account(sref).await,
        LedgerAction::RequestRebate => client.request_rebate(sref).await,
    }
}

fn remove_candidate(governance_path: &Path, candidate_id: &str) {
    match GovernanceFile::from_file(governance_path) {
        Ok(mut gov) => {
            if gov.remove(candidate_id) {
                if let Err(e) = gov.save(governance_path) {
                    warn!(candidate_id, "governance file save failed: {e}");
                } else {
                    info!(candidate_id, "removed rejected governance vote");
                }
            }
        }
        Err(e) => warn!("governance file read failed: {e}"),
    }
}
