//! In-memory expiry timeline.
//!
//! An ordered set of `(expires_at, container)` entries mirroring the
//! `Acquired`/`Extended` subset of the lease store. The scheduler pops
//! due entries in expiry order each tick and hands them to the serial
//! expiration worker.

use std::collections::BTreeMap;

/// One timeline entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiryEntry {
    /// Creating transaction of the lease.
    pub tx_hash: String,
    /// Container (lease token id).
    pub container_name: String,
    /// Tenant address, carried for the refund path.
    pub tenant: String,
    /// Unix seconds at which the lease expires.
    pub expires_at: u64,
}

/// Ordered expiry set keyed by `(expires_at, container_name)`.
#[derive(Debug, Default)]
pub struct ExpiryTimeline {
    entries: BTreeMap<(u64, String), ExpiryEntry>,
}

impl ExpiryTimeline {
    /// Empty timeline.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry, replacing any previous entry for the container.
    pub fn insert(&mut self, entry: ExpiryEntry) {
        self.remove(&entry.container_name);
        self.entries
            .insert((entry.expires_at, entry.container_name.clone()), entry);
    }

    /// Remove and return the entry for `container_name`.
    pub fn remove(&mut self, container_name: &str) -> Option<ExpiryEntry> {
        let key = self
            .entries
            .iter()
            .find(|(_, e)| e.container_name == container_name)
            .map(|(k, _)| k.clone())?;
        self.entries.remove(&key)
    }

    /// Look up the entry for `container_name`.
    #[must_use]
    pub fn get(&self, container_name: &str) -> Option<&ExpiryEntry> {
        self.entries.values().find(|e| e.container_name == container_name)
    }

    /// Push a container's expiry forward by `delta` seconds and return
    /// the new expiry time.
    pub fn extend(&mut self, container_name: &str, delta: u64) -> Option<u64> {
        let mut entry = self.remove(container_name)?;
        entry.expires_at += delta;
        let expires_at = entry.expires_at;
        self.insert(entry);
        Some(expires_at)
    }

    /// Remove and return every entry with `expires_at <= now`, in
    /// expiry order.
    pub fn pop_expired(&mut self, now: u64) -> Vec<ExpiryEntry> {
        let mut due = Vec::new();
        while let Some((&(expires_at, _), _)) = self.entries.iter().next() {
            if expires_at > now {
                break;
            }
            let key = self.entries.keys().next().cloned().expect("nonempty");
            due.push(self.entries.remove(&key).expect("present"));
        }
        due
    }

    /// Number of tracked entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the timeline is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, expires_at: u64) -> ExpiryEntry {
        ExpiryEntry {
            tx_hash: format!("TX-{name}"),
            container_name: name.to_string(),
            tenant: "rTENANT".to_string(),
            expires_at,
        }
    }

    #[test]
    fn pops_in_expiry_order() {
        let mut timeline = ExpiryTimeline::new();
        timeline.insert(entry("b", 200));
        timeline.insert(entry("a", 100));
        timeline.insert(entry("c", 300));

        let due = timeline.pop_expired(250);
        assert_eq!(
            due.iter().map(|e| e.container_name.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );
        assert_eq!(timeline.len(), 1);
        assert!(timeline.pop_expired(250).is_empty());
    }

    #[test]
    fn extend_moves_the_deadline() {
        let mut timeline = ExpiryTimeline::new();
        timeline.insert(entry("a", 100));
        assert_eq!(timeline.extend("a", 7200), Some(7300));
        assert!(timeline.pop_expired(200).is_empty());
        assert_eq!(timeline.pop_expired(7300).len(), 1);
        assert_eq!(timeline.extend("missing", 10), None);
    }

    #[test]
    fn insert_replaces_existing_container_entry() {
        let mut timeline = ExpiryTimeline::new();
        timeline.insert(entry("a", 100));
        timeline.insert(entry("a", 500));
        assert_eq!(timeline.len(), 1);
        assert!(timeline.pop_expired(100).is_empty());
    }

    #[test]
    fn remove_returns_entry() {
        let mut timeline = ExpiryTimeline::new();
        timeline.insert(entry("a", 100));
        let removed = timeline.remove("a").unwrap();
        assert_eq!(removed.tx_hash, "TX-a");
        assert!(timeline.is_empty());
    }
}
