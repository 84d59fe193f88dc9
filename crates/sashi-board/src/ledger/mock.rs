//! In-memory ledger double for the test suites.
//!
//! Records every submission, hands out deterministic tx hashes, and
//! lets tests stage registrations, tokens, historical transactions, and
//! scripted failures.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{
    AccountTx, Candidate, HeartbeatVote, HookConfig, HostRegistration, LedgerClient, LedgerError,
    LedgerResult, SubmissionRef, UriToken,
};

/// One recorded submission.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    /// Method name, e.g. `offer_lease`.
    pub method: String,
    /// Human-readable argument summary.
    pub detail: String,
    /// The tx hash handed out for this submission.
    pub tx_hash: String,
}

#[derive(Debug, Default)]
struct MockState {
    registration: Option<HostRegistration>,
    hook: Option<HookConfig>,
    moment_size: u64,
    now: u64,
    tokens: HashMap<String, UriToken>,
    unoffered: Vec<UriToken>,
    history: Vec<AccountTx>,
    candidates: Vec<Candidate>,
    validated: HashSet<String>,
    calls: Vec<RecordedCall>,
    /// method → remaining scripted failures.
    failures: HashMap<String, (u32, FailureKind)>,
    fee_uplift: u64,
}

/// What a scripted failure should look like.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Generic submission rejection.
    Reject,
    /// Submission wait timeout; triggers fee escalation and may still
    /// validate on the ledger.
    TookTooLong,
    /// Submission wait timeout, but the transaction validated anyway.
    /// Exercises the at-most-once retry guard.
    TookTooLongButValidated,
    /// Hook rejects the attached governance vote.
    RejectVote,
}

/// The mock ledger.
#[derive(Debug, Default)]
pub struct MockLedger {
    state: Mutex<MockState>,
    seq: AtomicU64,
}

impl MockLedger {
    /// A mock with a one-hour moment and empty state.
    #[must_use]
    pub fn new() -> Self {
        let mock = Self::default();
        {
            let mut state = mock.state.lock().unwrap();
            state.moment_size = 3600;
            state.hook = Some(HookConfig {
                moment_size: 3600,
                lease_acquire_window: 60,
                purchaser_target_price: 2.0,
                tos_hash: "TOS".to_string(),
            });
            state.registration = Some(HostRegistration {
                token_id: "AB".repeat(32),
                last_heartbeat_moment: 0,
                active_instances: 0,
                total_instances: 3,
                version: "0.8.2".to_string(),
            });
        }
        mock
    }

    /// Replace the staged hook config.
    pub fn set_hook_config(&self, hook: HookConfig) {
        self.state.lock().unwrap().hook = Some(hook);
    }

    /// Replace the staged registration.
    pub fn set_registration(&self, registration: HostRegistration) {
        self.state.lock().unwrap().registration = Some(registration);
    }

    /// Stage the current ledger time.
    pub fn set_now(&self, now: u64) {
        self.state.lock().unwrap().now = now;
    }

    /// Stage a token (by id).
    pub fn put_token(&self, token: UriToken) {
        self.state
            .lock()
            .unwrap()
            .tokens
            .insert(token.token_id.clone(), token);
    }

    /// Remove a token, as a burn would.
    pub fn drop_token(&self, token_id: &str) {
        self.state.lock().unwrap().tokens.remove(token_id);
    }

    /// Stage the unoffered token list.
    pub fn set_unoffered(&self, tokens: Vec<UriToken>) {
        self.state.lock().unwrap().unoffered = tokens;
    }

    /// Stage historical account transactions for catch-up.
    pub fn set_history(&self, history: Vec<AccountTx>) {
        self.state.lock().unwrap().history = history;
    }

    /// Stage governance candidates.
    pub fn set_candidates(&self, candidates: Vec<Candidate>) {
        self.state.lock().unwrap().candidates = candidates;
    }

    /// Mark a tx hash as validated-and-successful.
    pub fn mark_validated(&self, tx_hash: &str) {
        self.state.lock().unwrap().validated.insert(tx_hash.to_string());
    }

    /// Script `count` failures of `kind` for `method`.
    pub fn fail_next(&self, method: &str, count: u32, kind: FailureKind) {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert(method.to_string(), (count, kind));
    }

    /// Every recorded submission, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Recorded submissions of one method.
    #[must_use]
    pub fn calls_of(&self, method: &str) -> Vec<RecordedCall> {
        self.calls().into_iter().filter(|c| c.method == method).collect()
    }

    /// The current fee uplift.
    #[must_use]
    pub fn fee_uplift(&self) -> u64 {
        self.state.lock().unwrap().fee_uplift
    }

    fn submit(
        &self,
        method: &str,
        detail: String,
        sref: &SubmissionRef,
        validate: bool,
    ) -> LedgerResult<()> {
        let tx_hash = format!("MOCKTX-{}", self.seq.fetch_add(1, Ordering::SeqCst));
        sref.record(&tx_hash);

        let mut state = self.state.lock().unwrap();
        state.calls.push(RecordedCall {
            method: method.to_string(),
            detail: detail.clone(),
            tx_hash: tx_hash.clone(),
        });

        if let Some((remaining, kind)) = state.failures.get_mut(method) {
            if *remaining > 0 {
                *remaining -= 1;
                let kind = *kind;
                return Err(match kind {
                    FailureKind::Reject => LedgerError::Submission("scripted failure".into()),
                    FailureKind::TookTooLong => LedgerError::TookTooLong,
                    FailureKind::TookTooLongButValidated => {
                        state.validated.insert(tx_hash);
                        LedgerError::TookTooLong
                    }
                    FailureKind::RejectVote => LedgerError::VoteRejected {
                        candidate_id: detail_candidate(&detail),
                    },
                });
            }
        }
        if validate {
            state.validated.insert(tx_hash);
        }
        Ok(())
    }
}

/// Pull the candidate id back out of a `vote=<id>:<vote>` detail.
fn detail_candidate(detail: &str) -> String {
    detail
        .strip_prefix("vote=")
        .and_then(|rest| rest.split(':').next())
        .unwrap_or_default()
        .to_string()
}

#[async_trait]
impl LedgerClient for MockLedger {
    async fn host_registration(&self) -> LedgerResult<HostRegistration> {
        self.state
            .lock()
            .unwrap()
            .registration
            .clone()
            .ok_or_else(|| LedgerError::NotFound("registration".into()))
    }

    async fn hook_config(&self) -> LedgerResult<HookConfig> {
        self.state
            .lock()
            .unwrap()
            .hook
            .clone()
            .ok_or_else(|| LedgerError::NotFound("hook config".into()))
    }

    async fn moment(&self, timestamp: Option<u64>) -> LedgerResult<u64> {
        let state = self.state.lock().unwrap();
        Ok(timestamp.unwrap_or(state.now) / state.moment_size.max(1))
    }

    async fn moment_start_time(&self) -> LedgerResult<u64> {
        let state = self.state.lock().unwrap();
        let size = state.moment_size.max(1);
        Ok(state.now / size * size)
    }

    async fn lease_token(&self, token_id: &str) -> LedgerResult<Option<UriToken>> {
        Ok(self.state.lock().unwrap().tokens.get(token_id).cloned())
    }

    async fn lease_offers(&self) -> LedgerResult<Vec<UriToken>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .tokens
            .values()
            .filter(|t| t.has_sell_offer)
            .cloned()
            .collect())
    }

    async fn unoffered_leases(&self) -> LedgerResult<Vec<UriToken>> {
        Ok(self.state.lock().unwrap().unoffered.clone())
    }

    async fn account_tx(&self, from_ledger: u64) -> LedgerResult<Vec<AccountTx>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .history
            .iter()
            .filter(|tx| tx.ledger_index >= from_ledger)
            .cloned()
            .collect())
    }

    async fn tx_validated(&self, tx_hash: &str) -> LedgerResult<bool> {
        Ok(self.state.lock().unwrap().validated.contains(tx_hash))
    }

    async fn governance_candidates(&self) -> LedgerResult<Vec<Candidate>> {
        Ok(self.state.lock().unwrap().candidates.clone())
    }

    fn set_fee_uplift(&self, drops: u64) {
        self.state.lock().unwrap().fee_uplift = drops;
    }

    async fn update_reg_info(
        &self,
        active: u64,
        total: u64,
        sref: &SubmissionRef,
    ) -> LedgerResult<()> {
        self.submit("update_reg_info", format!("active={active} total={total}"), sref, true)
    }

    async fn offer_lease(
        &self,
        lease_index: u32,
        amount: f64,
        _tos_hash: &str,
        outbound_ip: Option<&str>,
        sref: &SubmissionRef,
    ) -> LedgerResult<()> {
        self.submit(
            "offer_lease",
            format!("index={lease_index} amount={amount} ip={outbound_ip:?}"),
            sref,
            true,
        )
    }

    async fn offer_minted_lease(
        &self,
        lease_index: u32,
        amount: f64,
        _tos_hash: &str,
        _outbound_ip: Option<&str>,
        sref: &SubmissionRef,
    ) -> LedgerResult<()> {
        self.submit(
            "offer_minted_lease",
            format!("index={lease_index} amount={amount}"),
            sref,
            true,
        )
    }

    async fn expire_lease(&self, token_id: &str, sref: &SubmissionRef) -> LedgerResult<()> {
        self.submit("expire_lease", format!("token={token_id}"), sref, true)
    }

    async fn burn_lease(&self, token_id: &str, sref: &SubmissionRef) -> LedgerResult<()> {
        self.submit("burn_lease", format!("token={token_id}"), sref, true)
    }

    async fn acquire_success(
        &self,
        acquire_tx_hash: &str,
        tenant: &str,
        _instance_info: &serde_json::Value,
        sref: &SubmissionRef,
    ) -> LedgerResult<()> {
        self.submit(
            "acquire_success",
            format!("acquire={acquire_tx_hash} tenant={tenant}"),
            sref,
            true,
        )
    }

    async fn acquire_error(
        &self,
        acquire_tx_hash: &str,
        tenant: &str,
        amount: f64,
        reason: &str,
        sref: &SubmissionRef,
    ) -> LedgerResult<()> {
        self.submit(
            "acquire_error",
            format!("acquire={acquire_tx_hash} tenant={tenant} amount={amount} reason={reason}"),
            sref,
            true,
        )
    }

    async fn extend_success(
        &self,
        extend_tx_hash: &str,
        tenant: &str,
        expiry_moment: u64,
        sref: &SubmissionRef,
    ) -> LedgerResult<()> {
        self.submit(
            "extend_success",
            format!("extend={extend_tx_hash} tenant={tenant} expiry_moment={expiry_moment}"),
            sref,
            true,
        )
    }

    async fn extend_error(
        &self,
        extend_tx_hash: &str,
        tenant: &str,
        reason: &str,
        amount: f64,
        sref: &SubmissionRef,
    ) -> LedgerResult<()> {
        self.submit(
            "extend_error",
            format!("extend={extend_tx_hash} tenant={tenant} reason={reason} amount={amount}"),
            sref,
            true,
        )
    }

    async fn refund_tenant(
        &self,
        origin_tx_hash: &str,
        tenant: &str,
        amount: f64,
        sref: &SubmissionRef,
    ) -> LedgerResult<()> {
        self.submit(
            "refund_tenant",
            format!("origin={origin_tx_hash} tenant={tenant} amount={amount}"),
            sref,
            true,
        )
    }

    async fn heartbeat(
        &self,
        vote: Option<&HeartbeatVote>,
        sref: &SubmissionRef,
    ) -> LedgerResult<()> {
        let detail = match vote {
            Some(v) => format!("vote={}:{:?}", v.candidate_id, v.vote),
            None => "empty".to_string(),
        };
        self.submit("heartbeat", detail, sref, true)
    }

    async fn prepare_account(&self, sref: &SubmissionRef) -> LedgerResult<()> {
        self.submit("prepare_account", String::new(), sref, true)
    }

    async fn request_rebate(&self, sref: &SubmissionRef) -> LedgerResult<()> {
        self.submit("request_rebate", String::new(), sref, true)
    }
}
