//! Ledger client abstraction.
//!
//! The reconciler talks to the ledger through [`LedgerClient`], which
//! hides the wire protocol behind typed queries, typed submissions, and
//! a typed event stream. The production implementation
//! ([`ws::WsLedgerClient`]) speaks JSON-RPC over a websocket; tests use
//! a mock.
//!
//! Every submission takes a [`SubmissionRef`] that receives the
//! submitted transaction hash. The transaction queue consults the
//! recorded hash before any retry so a submission that validated after
//! a local timeout is never repeated.

pub mod mock;
pub mod uri;
pub mod ws;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sashi_core::config::Vote;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors raised by ledger operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LedgerError {
    /// Transport-level failure (socket, serialization).
    #[error("ledger transport: {0}")]
    Transport(String),

    /// The ledger rejected a submission.
    #[error("submission rejected: {0}")]
    Submission(String),

    /// The submission was not validated within the wait window; it may
    /// still validate later.
    #[error("submission took too long")]
    TookTooLong,

    /// The hook rejected a governance vote; the candidate should be
    /// dropped from the governance file.
    #[error("vote rejected for candidate {candidate_id}")]
    VoteRejected {
        /// The candidate whose vote was rejected.
        candidate_id: String,
    },

    /// A queried object does not exist on the ledger.
    #[error("not found: {0}")]
    NotFound(String),

    /// The server reported a state this client cannot reconcile.
    #[error("ledger desynced")]
    Desynced,

    /// The connection is gone.
    #[error("ledger disconnected")]
    Disconnected,

    /// The peer answered with something unintelligible.
    #[error("ledger protocol: {0}")]
    Protocol(String),
}

/// Result alias for ledger operations.
pub type LedgerResult<T> = Result<T, LedgerError>;

/// Compare two ledger amounts with decimal tolerance.
#[must_use]
pub fn amounts_equal(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-6
}

/// Records the hash(es) a queued action submitted, shared between the
/// queue entry and the submission path.
#[derive(Debug, Clone, Default)]
pub struct SubmissionRef {
    hash: Arc<Mutex<Option<String>>>,
}

impl SubmissionRef {
    /// A fresh, empty ref.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the submitted transaction hash.
    pub fn record(&self, tx_hash: &str) {
        *self.hash.lock().expect("submission ref poisoned") = Some(tx_hash.to_string());
    }

    /// The last submitted transaction hash, if any.
    #[must_use]
    pub fn last(&self) -> Option<String> {
        self.hash.lock().expect("submission ref poisoned").clone()
    }
}

/// This host's on-ledger registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostRegistration {
    /// Registration token id (64 hex chars).
    pub token_id: String,
    /// Moment of the last accepted heartbeat.
    pub last_heartbeat_moment: u64,
    /// Active instance count as the ledger last saw it.
    pub active_instances: u64,
    /// Total instance slots registered.
    pub total_instances: u64,
    /// Agent version string recorded at registration.
    pub version: String,
}

/// Protocol-wide parameters published by the ledger hook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookConfig {
    /// Moment length in seconds.
    pub moment_size: u64,
    /// Seconds a tenant waits for `acquireSuccess`.
    pub lease_acquire_window: u64,
    /// Current target price for new lease offers.
    pub purchaser_target_price: f64,
    /// Hash of the terms of service embedded in offers.
    pub tos_hash: String,
}

/// A lease URI token as it exists on the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UriToken {
    /// Token id (64 hex chars); equals the container name.
    pub token_id: String,
    /// Current owner account. The host owns unsold slots.
    pub owner: String,
    /// Raw lease URI; decode with [`uri::decode`].
    pub uri: String,
    /// Whether a sell offer is attached.
    pub has_sell_offer: bool,
}

/// Tenant-supplied instance requirements carried in an acquire.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AcquirePayload {
    /// Tenant public key for the contract.
    #[serde(default)]
    pub owner_pubkey: String,
    /// Contract id to configure.
    #[serde(default)]
    pub contract_id: String,
    /// Requested image.
    #[serde(default)]
    pub image: String,
    /// Contract config overrides, forwarded to the daemon untouched.
    #[serde(default)]
    pub config: serde_json::Value,
}

/// An `AcquireLease` event.
#[derive(Debug, Clone)]
pub struct AcquireEvent {
    /// Tenant account.
    pub tenant: String,
    /// Host account the tenant targeted.
    pub host: String,
    /// The acquire transaction hash (lease row key).
    pub tx_hash: String,
    /// Lease token id (container name).
    pub token_id: String,
    /// Amount the tenant paid.
    pub amount: f64,
    /// Ledger index the acquire validated in.
    pub ledger_index: u64,
    /// Instance requirements.
    pub payload: AcquirePayload,
}

/// An `ExtendLease` event.
#[derive(Debug, Clone)]
pub struct ExtendEvent {
    /// Tenant account.
    pub tenant: String,
    /// Host account the tenant targeted.
    pub host: String,
    /// The extend transaction hash.
    pub tx_hash: String,
    /// Lease token id.
    pub token_id: String,
    /// Amount paid; must be a whole multiple of the lease amount.
    pub amount: f64,
    /// Ledger index the extend validated in.
    pub ledger_index: u64,
}

/// A `TerminateLease` event.
#[derive(Debug, Clone)]
pub struct TerminateEvent {
    /// Tenant account.
    pub tenant: String,
    /// The terminate transaction hash.
    pub tx_hash: String,
    /// Lease token id.
    pub token_id: String,
}

/// Typed events emitted by the ledger client.
#[derive(Debug, Clone)]
pub enum LedgerEvent {
    /// A tenant acquired a lease on this host.
    Acquire(AcquireEvent),
    /// A tenant extended a lease.
    Extend(ExtendEvent),
    /// A tenant terminated a lease.
    Terminate(TerminateEvent),
    /// This host's registration was (re)confirmed on the ledger.
    HostRegistered,
    /// A ledger closed.
    Tick {
        /// Index of the closed ledger.
        ledger_index: u64,
        /// Close time, unix seconds.
        ledger_time: u64,
    },
    /// The connection dropped. Fatal.
    Disconnected,
    /// The server lost sync. Fatal.
    Desynced,
}

/// Lease-relevant transaction classes seen in catch-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxKind {
    /// Tenant acquire.
    Acquire,
    /// Tenant extend.
    Extend,
    /// Tenant terminate.
    Terminate,
    /// This host's acquire success response.
    AcquireSuccess,
    /// This host's acquire error response.
    AcquireError,
    /// This host's extend success response.
    ExtendSuccess,
    /// This host's extend error response.
    ExtendError,
    /// This host's refund to a tenant.
    Refund,
    /// Anything else.
    Other,
}

/// One historical account transaction, as used by startup catch-up.
#[derive(Debug, Clone)]
pub struct AccountTx {
    /// Transaction hash.
    pub tx_hash: String,
    /// Ledger index it validated in.
    pub ledger_index: u64,
    /// Classified kind.
    pub kind: TxKind,
    /// Counterparty tenant, when applicable.
    pub tenant: Option<String>,
    /// Lease token id, when applicable.
    pub token_id: Option<String>,
    /// Amount moved, when applicable.
    pub amount: f64,
    /// For host responses: the tenant transaction they answer.
    pub ref_tx_hash: Option<String>,
}

/// A governance candidate visible on the ledger.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// Candidate id as used in the governance file.
    pub candidate_id: String,
    /// On-ledger ordering index; votes are submitted in this order.
    pub index: u64,
}

/// A vote attached to a heartbeat.
#[derive(Debug, Clone)]
pub struct HeartbeatVote {
    /// Candidate being voted on.
    pub candidate_id: String,
    /// The vote.
    pub vote: Vote,
}

/// Abstraction over the public ledger.
///
/// Submissions record their transaction hash into the given
/// [`SubmissionRef`] even when the call subsequently fails, so retry
/// logic can check whether the attempt validated anyway.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// This host's registration.
    async fn host_registration(&self) -> LedgerResult<HostRegistration>;

    /// Current hook configuration. Re-read before re-offers to pick up
    /// price changes.
    async fn hook_config(&self) -> LedgerResult<HookConfig>;

    /// The moment containing `timestamp` (or the current moment).
    async fn moment(&self, timestamp: Option<u64>) -> LedgerResult<u64>;

    /// Start time of the current moment, unix seconds.
    async fn moment_start_time(&self) -> LedgerResult<u64>;

    /// One lease token by id, or `None` when burned.
    async fn lease_token(&self, token_id: &str) -> LedgerResult<Option<UriToken>>;

    /// Host-owned lease tokens that carry a sell offer.
    async fn lease_offers(&self) -> LedgerResult<Vec<UriToken>>;

    /// Host-owned lease tokens without a sell offer.
    async fn unoffered_leases(&self) -> LedgerResult<Vec<UriToken>>;

    /// Lease-relevant transactions for this host's account from
    /// `from_ledger` forward, in ledger order.
    async fn account_tx(&self, from_ledger: u64) -> LedgerResult<Vec<AccountTx>>;

    /// Whether `tx_hash` is validated and successful on the ledger.
    async fn tx_validated(&self, tx_hash: &str) -> LedgerResult<bool>;

    /// Governance candidates, with their on-ledger index.
    async fn governance_candidates(&self) -> LedgerResult<Vec<Candidate>>;

    /// Set the global fee uplift (drops) applied to subsequent
    /// submissions.
    fn set_fee_uplift(&self, drops: u64);

    /// Update registration info (active instance count and metadata).
    async fn update_reg_info(&self, active: u64, total: u64, sref: &SubmissionRef)
        -> LedgerResult<()>;

    /// Offer a lease slot for sale.
    async fn offer_lease(
        &self,
        lease_index: u32,
        amount: f64,
        tos_hash: &str,
        outbound_ip: Option<&str>,
        sref: &SubmissionRef,
    ) -> LedgerResult<()>;

    /// Mint and offer a lease slot that does not exist yet.
    async fn offer_minted_lease(
        &self,
        lease_index: u32,
        amount: f64,
        tos_hash: &str,
        outbound_ip: Option<&str>,
        sref: &SubmissionRef,
    ) -> LedgerResult<()>;

    /// Expire (burn) a lease token.
    async fn expire_lease(&self, token_id: &str, sref: &SubmissionRef) -> LedgerResult<()>;

    /// Burn an unsold lease slot outright (slot-count fix).
    async fn burn_lease(&self, token_id: &str, sref: &SubmissionRef) -> LedgerResult<()>;

    /// Report a successful acquire to the tenant.
    async fn acquire_success(
        &self,
        acquire_tx_hash: &str,
        tenant: &str,
        instance_info: &serde_json::Value,
        sref: &SubmissionRef,
    ) -> LedgerResult<()>;

    /// Report a failed acquire (carries the refund).
    async fn acquire_error(
        &self,
        acquire_tx_hash: &str,
        tenant: &str,
        amount: f64,
        reason: &str,
        sref: &SubmissionRef,
    ) -> LedgerResult<()>;

    /// Report a successful extend.
    async fn extend_success(
        &self,
        extend_tx_hash: &str,
        tenant: &str,
        expiry_moment: u64,
        sref: &SubmissionRef,
    ) -> LedgerResult<()>;

    /// Report a failed extend (carries the refund).
    async fn extend_error(
        &self,
        extend_tx_hash: &str,
        tenant: &str,
        reason: &str,
        amount: f64,
        sref: &SubmissionRef,
    ) -> LedgerResult<()>;

    /// Refund a tenant outside the acquire/extend error paths.
    async fn refund_tenant(
        &self,
        origin_tx_hash: &str,
        tenant: &str,
        amount: f64,
        sref: &SubmissionRef,
    ) -> LedgerResult<()>;

    /// Submit a heartbeat, optionally carrying one governance vote.
    async fn heartbeat(
        &self,
        vote: Option<&HeartbeatVote>,
        sref: &SubmissionRef,
    ) -> LedgerResult<()>;

    /// Prepare the account (trust lines, flags) at startup.
    async fn prepare_account(&self, sref: &SubmissionRef) -> LedgerResult<()>;

    /// Request a registration-fee rebate.
    async fn request_rebate(&self, sref: &SubmissionRef) -> LedgerResult<()>;
}

/// Sending half of a ledger event channel.
pub type EventSender = mpsc::UnboundedSender<LedgerEvent>;
/// Receiving half of a ledger event channel.
pub type EventReceiver = mpsc::UnboundedReceiver<LedgerEvent>;

/// A fresh event channel.
#[must_use]
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}
