//! Startup inconsistency fixes: lease amount, slot counts, and
//! unoffered slots.

use std::collections::BTreeSet;

use tracing::{info, warn};

use super::Reconciler;
use crate::ledger::uri;
use crate::ledger::{amounts_equal, UriToken};
use crate::txqueue::LedgerAction;

impl Reconciler {
    /// Run all three fixes in order.
    pub async fn fix_inconsistencies(&mut self) {
        self.fix_lease_amount().await;
        self.fix_slot_counts().await;
        self.offer_unoffered().await;
    }

    /// Config yields to the ledger: if any live offer carries a
    /// different amount, adopt it and rewrite the config file.
    pub async fn fix_lease_amount(&mut self) {
        let offers = match self.client.lease_offers().await {
            Ok(offers) => offers,
            Err(e) => {
                warn!("lease offer fetch failed, amount fix skipped: {e}");
                return;
            }
        };
        let Some(on_ledger) = offers
            .iter()
            .find_map(|token| uri::decode(&token.uri).ok().map(|u| u.lease_amount))
        else {
            return;
        };

        if !amounts_equal(on_ledger, self.config.xrpl.lease_amount) {
            info!(
                configured = self.config.xrpl.lease_amount,
                on_ledger, "lease amount reconciled from ledger"
            );
            self.config.xrpl.lease_amount = on_ledger;
            if let Err(e) = self.config.save(&self.config_path) {
                warn!("config rewrite failed: {e}");
            }
        }
    }

    /// Keep `sold + unsold` equal to the configured slot total: burn
    /// the highest-indexed unsold slots when over, mint offers for the
    /// vacant indices when under.
    pub async fn fix_slot_counts(&mut self) {
        let total = self.config.system.max_instance_count;
        let sold = match self.store.live() {
            Ok(leases) => leases,
            Err(e) => {
                warn!("lease store read failed, slot fix skipped: {e}");
                return;
            }
        };
        let unsold = match self.client.lease_offers().await {
            Ok(offers) => offers,
            Err(e) => {
                warn!("lease offer fetch failed, slot fix skipped: {e}");
                return;
            }
        };

        let sold_count = sold.len() as u64;
        let unsold_count = unsold.len() as u64;

        if sold_count + unsold_count > total {
            let excess = (sold_count + unsold_count - total) as usize;
            let mut by_index: Vec<(u32, &UriToken)> = unsold
                .iter()
                .filter_map(|token| {
                    uri::decode(&token.uri).ok().map(|u| (u.lease_index, token))
                })
                .collect();
            by_index.sort_by_key(|(index, _)| std::cmp::Reverse(*index));
            for (index, token) in by_index.into_iter().take(excess) {
                info!(index, token_id = %token.token_id, "burning excess lease slot");
                self.queue.enqueue(LedgerAction::BurnLease {
                    token_id: token.token_id.clone(),
                });
            }
            return;
        }

        if sold_count + unsold_count < total {
            // Indices currently held: unsold offers plus the tokens of
            // the sold leases.
            let mut held: BTreeSet<u32> = unsold
                .iter()
                .filter_map(|token| uri::decode(&token.uri).ok().map(|u| u.lease_index))
                .collect();
            for lease in &sold {
                if let Some(lease_uri) = self.decode_token_uri(&lease.container_name).await {
                    held.insert(lease_uri.lease_index);
                }
            }

            #[allow(clippy::cast_possible_truncation)]
            for index in (0..total as u32).filter(|i| !held.contains(i)) {
                info!(index, "minting offer for vacant lease slot");
                self.queue.enqueue(LedgerAction::OfferMintedLease {
                    lease_index: index,
                    amount: self.config.xrpl.lease_amount,
                    tos_hash: self.hook.tos_hash.clone(),
                    outbound_ip: None,
                });
            }
        }
    }

    /// Offer every host-owned lease token that has no sell offer and
    /// whose embedded amount matches config.
    pub async fn offer_unoffered(&mut self) {
        let unoffered = match self.client.unoffered_leases().await {
            Ok(tokens) => tokens,
            Err(e) => {
                warn!("unoffered lease fetch failed: {e}");
                return;
            }
        };

        for token in unoffered {
            let Ok(lease_uri) = uri::decode(&token.uri) else {
                continue;
            };
            if !amounts_equal(lease_uri.lease_amount, self.config.xrpl.lease_amount) {
                continue;
            }
            info!(token_id = %token.token_id, index = lease_uri.lease_index, "offering unoffered lease");
            self.queue.enqueue(LedgerAction::OfferLease {
                lease_index: lease_uri.lease_index,
                amount: self.config.xrpl.lease_amount,
                tos_hash: self.hook.tos_hash.clone(),
                outbound_ip: lease_uri.outbound_ip,
                delete_lease_tx: None,
            });
        }
    }
}
