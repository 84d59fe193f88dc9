//! Orphan pruning: cross-join the instance and lease stores and tear
//! down anything the normal flows lost track of.
//!
//! Runs once at startup and then on the prune cadence. Refunds are
//! deliberately narrow: only a lease still caught in `Acquiring` whose
//! token the tenant holds is refunded; an `Acquired`/`Extended` orphan
//! had service for some period and is re-offered without refund.

use regex::Regex;
use sashi_core::instance::Instance;
use sashi_core::lease::{Lease, LeaseStatus};
use tracing::{info, warn};

use super::Reconciler;
use crate::daemon_client::DaemonClientError;
use crate::txqueue::LedgerAction;

/// Fraction of twice the acquire window after which an in-flight lease
/// counts as abandoned.
const ORPHAN_AGE_THRESHOLD: f64 = 0.8;

/// Container names minted by the reconciler are lease token ids.
fn is_token_name(name: &str) -> bool {
    Regex::new(r"^[0-9A-Fa-f]{64}$").expect("static pattern").is_match(name)
}

impl Reconciler {
    /// Age (seconds) past which an unfinished lease is an orphan.
    fn orphan_cutoff(&self) -> u64 {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
        let cutoff =
            (2.0 * self.hook.lease_acquire_window as f64 * ORPHAN_AGE_THRESHOLD) as u64;
        cutoff
    }

    /// One full prune pass over both stores.
    pub async fn prune_orphans(&mut self) {
        info!("orphan prune started");
        let now = self.now();
        let cutoff = self.orphan_cutoff();

        let instances = match self.instance_store.list() {
            Ok(instances) => instances,
            Err(e) => {
                warn!("instance store read failed, prune skipped: {e}");
                return;
            }
        };
        let leases = match self.store.list() {
            Ok(leases) => leases,
            Err(e) => {
                warn!("lease store read failed, prune skipped: {e}");
                return;
            }
        };

        let guard = self.lease_lock.acquire().await;

        for instance in &instances {
            if self.instance_is_orphan(instance, &leases, now, cutoff).await {
                self.prune_instance(instance, &leases).await;
            }
        }

        for lease in &leases {
            let has_instance = instances
                .iter()
                .any(|i| i.container_name == lease.container_name);
            if has_instance {
                continue;
            }
            let aged = now.saturating_sub(lease.timestamp) > cutoff;
            let orphan = match lease.status {
                LeaseStatus::Destroyed | LeaseStatus::Burned => true,
                _ => aged,
            };
            if orphan {
                self.prune_lease(lease).await;
            }
        }

        drop(guard);

        // Converge the advertised active count with what survived.
        let active = self.store.live().map(|l| l.len() as u64).unwrap_or(self.active_count);
        if active != self.active_count {
            info!(
                previous = self.active_count,
                active, "active count changed by prune"
            );
            self.active_count = active;
            self.enqueue_reg_update();
        }
        info!("orphan prune complete");
    }

    async fn instance_is_orphan(
        &self,
        instance: &Instance,
        leases: &[Lease],
        now: u64,
        cutoff: u64,
    ) -> bool {
        let lease = leases
            .iter()
            .find(|l| l.container_name == instance.container_name);

        match lease {
            Some(lease) => {
                if now.saturating_sub(lease.timestamp) <= cutoff {
                    return false;
                }
                if matches!(lease.status, LeaseStatus::Acquiring | LeaseStatus::Destroyed) {
                    return true;
                }
                // A live row whose backing token never left the host
                // means the sale never completed.
                matches!(
                    self.client.lease_token(&instance.container_name).await,
                    Ok(Some(token)) if token.owner == self.config.xrpl.address
                )
            }
            // No lease row: only reconciler-minted instances (token-id
            // names) are ours to prune.
            None => is_token_name(&instance.container_name),
        }
    }

    async fn prune_instance(&mut self, instance: &Instance, leases: &[Lease]) {
        info!(container_name = %instance.container_name, "pruning orphan instance");

        let lease = leases
            .iter()
            .find(|l| l.container_name == instance.container_name);
        let lease_uri = self.decode_token_uri(&instance.container_name).await;

        match self.daemon.destroy(&instance.container_name).await {
            Ok(()) => {}
            Err(DaemonClientError::Daemon { reason, .. }) if reason == "no_container" => {}
            Err(e) => {
                warn!(container_name = %instance.container_name, "orphan destroy failed: {e}");
                return;
            }
        }

        if let Some(lease) = lease {
            let was_acquiring = lease.status == LeaseStatus::Acquiring;
            if let Err(e) = self.store.update_status(&lease.tx_hash, LeaseStatus::Destroyed) {
                warn!(tx_hash = %lease.tx_hash, "orphan mark failed: {e}");
            }
            self.timeline.remove(&instance.container_name);

            if was_acquiring && self.token_owned_by(&instance.container_name, &lease.tenant_address).await {
                self.queue.enqueue(LedgerAction::RefundTenant {
                    origin_tx_hash: lease.tx_hash.clone(),
                    tenant: lease.tenant_address.clone(),
                    amount: self.config.xrpl.lease_amount,
                });
            }
            let tx_hash = lease.tx_hash.clone();
            self.reoffer(&instance.container_name, lease_uri, Some(&tx_hash)).await;
        } else {
            self.reoffer(&instance.container_name, lease_uri, None).await;
        }
    }

    async fn prune_lease(&mut self, lease: &Lease) {
        info!(
            tx_hash = %lease.tx_hash,
            container_name = %lease.container_name,
            status = lease.status.as_str(),
            "pruning orphan lease"
        );

        let was_acquiring = lease.status == LeaseStatus::Acquiring;
        if !lease.status.is_terminal() {
            if let Err(e) = self.store.update_status(&lease.tx_hash, LeaseStatus::Destroyed) {
                warn!(tx_hash = %lease.tx_hash, "orphan lease mark failed: {e}");
            }
        }
        self.timeline.remove(&lease.container_name);
        self.active_count = self.active_count.min(
            self.store
                .live()
                .map(|l| l.len() as u64)
                .unwrap_or(self.active_count),
        );

        if was_acquiring && self.token_owned_by(&lease.container_name, &lease.tenant_address).await
        {
            self.queue.enqueue(LedgerAction::RefundTenant {
                origin_tx_hash: lease.tx_hash.clone(),
                tenant: lease.tenant_address.clone(),
                amount: self.config.xrpl.lease_amount,
            });
        }

        let lease_uri = self.decode_token_uri(&lease.container_name).await;
        self.reoffer(&lease.container_name, lease_uri, Some(&lease.tx_hash)).await;
    }

    async fn token_owned_by(&self, token_id: &str, account: &str) -> bool {
        matches!(
            self.client.lease_token(token_id).await,
            Ok(Some(token)) if token.owner == account
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_names_are_64_hex_chars() {
        assert!(is_token_name(&"AB".repeat(32)));
        assert!(is_token_name(&"0f".repeat(32)));
        assert!(!is_token_name("my-container"));
        assert!(!is_token_name(&"AB".repeat(31)));
        assert!(!is_token_name(&"ZZ".repeat(32)));
    }
}
