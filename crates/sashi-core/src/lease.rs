//! Lease data model owned by the message-board reconciler.

use serde::{Deserialize, Serialize};

/// Ledger lifecycle states of a lease row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeaseStatus {
    /// Acquire observed, instance not yet confirmed.
    Acquiring,
    /// Instance exists and the success response was submitted.
    Acquired,
    /// Acquire handling failed.
    Failed,
    /// Instance destroyed (expiry, terminate, or prune).
    Destroyed,
    /// Lease token expired on the ledger while awaiting re-offer.
    Burned,
    /// Acquire missed its window budget.
    SashiTimeout,
    /// Lease extended at least once.
    Extended,
}

impl LeaseStatus {
    /// Db string for this status.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Acquiring => "Acquiring",
            Self::Acquired => "Acquired",
            Self::Failed => "Failed",
            Self::Destroyed => "Destroyed",
            Self::Burned => "Burned",
            Self::SashiTimeout => "SashiTimeout",
            Self::Extended => "Extended",
        }
    }

    /// Parse the db string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Acquiring" => Some(Self::Acquiring),
            "Acquired" => Some(Self::Acquired),
            "Failed" => Some(Self::Failed),
            "Destroyed" => Some(Self::Destroyed),
            "Burned" => Some(Self::Burned),
            "SashiTimeout" => Some(Self::SashiTimeout),
            "Extended" => Some(Self::Extended),
            _ => None,
        }
    }

    /// Whether an instance is expected to exist for a row in this state.
    #[must_use]
    pub fn is_live(self) -> bool {
        matches!(self, Self::Acquired | Self::Extended)
    }

    /// Whether the row is in a terminal state.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Failed | Self::Destroyed | Self::Burned | Self::SashiTimeout
        )
    }
}

/// One lease as recorded in the message-board store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    /// Primary key: the ledger transaction that created the lease.
    pub tx_hash: String,
    /// Ledger address of the tenant.
    pub tenant_address: String,
    /// Container name, identical to the lease token id.
    pub container_name: String,
    /// Lease lifetime in moments, accumulated across extends.
    pub life_moments: u64,
    /// Created-at wall clock, unix seconds.
    pub timestamp: u64,
    /// Ledger index at creation.
    pub created_on_ledger: u64,
    /// Current lifecycle status.
    pub status: LeaseStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrip() {
        for s in [
            LeaseStatus::Acquiring,
            LeaseStatus::Acquired,
            LeaseStatus::Failed,
            LeaseStatus::Destroyed,
            LeaseStatus::Burned,
            LeaseStatus::SashiTimeout,
            LeaseStatus::Extended,
        ] {
            assert_eq!(LeaseStatus::parse(s.as_str()), Some(s));
        }
    }

    #[test]
    fn live_and_terminal_partition() {
        assert!(LeaseStatus::Acquired.is_live());
        assert!(LeaseStatus::Extended.is_live());
        assert!(!LeaseStatus::Acquiring.is_live());
        assert!(LeaseStatus::Burned.is_terminal());
        assert!(LeaseStatus::SashiTimeout.is_terminal());
        assert!(!LeaseStatus::Acquiring.is_terminal());
        assert!(!LeaseStatus::Acquired.is_terminal());
    }
}
