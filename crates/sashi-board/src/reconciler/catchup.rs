//! Startup catch-up: replay lease-relevant account transactions from
//! the persisted checkpoint forward.
//!
//! Catch-up is conservative: a request transaction that already has a
//! response (success, error, or refund) anywhere in the fetched history
//! is skipped, so replaying history after a crash never acts twice.

use sashi_core::lease::LeaseStatus;
use tracing::{info, warn};

use super::Reconciler;
use crate::ledger::{AccountTx, TxKind};
use crate::txqueue::LedgerAction;

/// Whether `history` contains a host response referencing `tx_hash`.
fn already_answered(history: &[AccountTx], tx_hash: &str) -> bool {
    history.iter().any(|tx| {
        matches!(
            tx.kind,
            TxKind::AcquireSuccess
                | TxKind::AcquireError
                | TxKind::ExtendSuccess
                | TxKind::ExtendError
                | TxKind::Refund
        ) && tx.ref_tx_hash.as_deref() == Some(tx_hash)
    })
}

impl Reconciler {
    /// Replay history from `last_watched_ledger` forward.
    ///
    /// Advances the checkpoint monotonically as transactions are
    /// processed.
    pub async fn catch_up(&mut self) {
        let checkpoint = match self.store.last_watched_ledger() {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                warn!("checkpoint read failed, starting catch-up from 0: {e}");
                0
            }
        };

        let history = match self.client.account_tx(checkpoint).await {
            Ok(history) => history,
            Err(e) => {
                warn!("account history fetch failed, catch-up skipped: {e}");
                return;
            }
        };
        info!(checkpoint, transactions = history.len(), "catch-up started");

        for tx in &history {
            if let Err(e) = self.store.set_last_watched_ledger(tx.ledger_index) {
                warn!("checkpoint advance failed: {e}");
            }

            match tx.kind {
                TxKind::Acquire => self.catch_up_acquire(tx, &history).await,
                TxKind::Extend => self.catch_up_extend(tx, &history),
                TxKind::Terminate => self.catch_up_terminate(tx, &history).await,
                _ => {}
            }
        }
        info!("catch-up complete");
    }

    /// An acquire with no local lease row never produced an instance;
    /// free the slot and give the tenant their payment back.
    async fn catch_up_acquire(&mut self, tx: &AccountTx, history: &[AccountTx]) {
        if already_answered(history, &tx.tx_hash) {
            return;
        }
        if self.store.get(&tx.tx_hash).unwrap_or_default().is_some() {
            return;
        }
        let (Some(token_id), Some(tenant)) = (&tx.token_id, &tx.tenant) else {
            return;
        };

        let Ok(Some(token)) = self.client.lease_token(token_id).await else {
            return;
        };
        if token.owner != *tenant {
            return;
        }

        info!(tx_hash = %tx.tx_hash, token_id = %token_id, "unserved acquire found in history");
        let lease_uri = self.decode_token_uri(token_id).await;
        let guard = self.lease_lock.acquire().await;
        self.reoffer(token_id, lease_uri, None).await;
        drop(guard);
        self.queue.enqueue(LedgerAction::RefundTenant {
            origin_tx_hash: tx.tx_hash.clone(),
            tenant: tenant.clone(),
            amount: tx.amount,
        });
    }

    /// An unanswered extend against a live lease is refunded; the
    /// in-memory timeline is deliberately not advanced here.
    fn catch_up_extend(&mut self, tx: &AccountTx, history: &[AccountTx]) {
        if already_answered(history, &tx.tx_hash) {
            return;
        }
        let (Some(token_id), Some(tenant)) = (&tx.token_id, &tx.tenant) else {
            return;
        };
        let lease = match self.store.get_by_container(token_id) {
            Ok(Some(lease)) if lease.status.is_live() => lease,
            _ => return,
        };
        if lease.tenant_address != *tenant {
            return;
        }

        info!(tx_hash = %tx.tx_hash, token_id = %token_id, "unserved extend refunded");
        self.queue.enqueue(LedgerAction::RefundTenant {
            origin_tx_hash: tx.tx_hash.clone(),
            tenant: tenant.clone(),
            amount: tx.amount,
        });
    }

    /// An unanswered terminate runs the expiration path now; a
    /// terminate whose lease is gone but whose token the tenant still
    /// holds gets the slot expired and re-offered.
    async fn catch_up_terminate(&mut self, tx: &AccountTx, history: &[AccountTx]) {
        if already_answered(history, &tx.tx_hash) {
            return;
        }
        let (Some(token_id), Some(tenant)) = (&tx.token_id, &tx.tenant) else {
            return;
        };

        if let Ok(Some(lease)) = self.store.get_by_container(token_id) {
            if lease.status.is_live() && self.timeline.get(token_id).is_some() {
                info!(token_id = %token_id, "unserved terminate expiring now");
                if let Some(entry) = self.timeline.remove(token_id) {
                    let guard = self.lease_lock.acquire().await;
                    self.expire_entry(&entry).await;
                    drop(guard);
                }
                return;
            }
            if lease.status == LeaseStatus::Acquiring {
                // Never completed; treat like an unserved acquire.
                if let Err(e) = self.store.update_status(&lease.tx_hash, LeaseStatus::Destroyed) {
                    warn!(tx_hash = %lease.tx_hash, "terminate catch-up mark failed: {e}");
                }
            }
        }

        let Ok(Some(token)) = self.client.lease_token(token_id).await else {
            return;
        };
        if token.owner == *tenant {
            info!(token_id = %token_id, "terminated slot expired and re-offered");
            let lease_uri = self.decode_token_uri(token_id).await;
            let guard = self.lease_lock.acquire().await;
            self.reoffer(token_id, lease_uri, None).await;
            drop(guard);
        }
    }
}
