//! `SQLite`-backed stores for instances and leases.
//!
//! Two independent databases live in the data directory: `sa.sqlite`
//! (instances, written only by the lifecycle daemon) and
//! `mb-xahau.sqlite` (leases plus the watched-ledger checkpoint,
//! written only by the reconciler). Either service may read the other's
//! database; reconciliation is how drift between the two is repaired.
//!
//! Connections are opened and closed around each operation so neither
//! service holds a long-lived file lock against the other.

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

use crate::instance::{Instance, InstanceStatus, Ports};
use crate::lease::{Lease, LeaseStatus};

/// Errors raised by store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying `SQLite` error.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A row holds a value the data model cannot represent.
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Key of the watched-ledger checkpoint in `util_data`.
const LAST_WATCHED_LEDGER: &str = "last_watched_ledger";

fn open(path: &Path) -> StoreResult<Connection> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "busy_timeout", 5000)?;
    Ok(conn)
}

/// The instance database (`sa.sqlite`).
#[derive(Debug, Clone)]
pub struct InstanceStore {
    path: PathBuf,
}

impl InstanceStore {
    /// Store handle for the database at `path`. No connection is held.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Create the schema if missing.
    ///
    /// # Errors
    ///
    /// Fails when the database cannot be opened or written.
    pub fn ensure_schema(&self) -> StoreResult<()> {
        let conn = open(&self.path)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS instances (
                container_name TEXT PRIMARY KEY,
                owner_pubkey TEXT NOT NULL,
                contract_id TEXT NOT NULL,
                contract_dir TEXT NOT NULL,
                image_name TEXT NOT NULL,
                peer_port INTEGER NOT NULL,
                user_port INTEGER NOT NULL,
                gp_tcp_port_start INTEGER NOT NULL,
                gp_udp_port_start INTEGER NOT NULL,
                status TEXT NOT NULL,
                pubkey TEXT NOT NULL,
                ip TEXT NOT NULL,
                username TEXT NOT NULL
            )",
            [],
        )?;
        Ok(())
    }

    /// Insert a new instance row.
    ///
    /// # Errors
    ///
    /// Fails on duplicate names or write errors.
    pub fn insert(&self, inst: &Instance) -> StoreResult<()> {
        let conn = open(&self.path)?;
        conn.execute(
            "INSERT INTO instances (container_name, owner_pubkey, contract_id, contract_dir,
                image_name, peer_port, user_port, gp_tcp_port_start, gp_udp_port_start,
                status, pubkey, ip, username)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                inst.container_name,
                inst.owner_pubkey,
                inst.contract_id,
                inst.contract_dir,
                inst.image_name,
                inst.assigned_ports.peer_port,
                inst.assigned_ports.user_port,
                inst.assigned_ports.gp_tcp_port_start,
                inst.assigned_ports.gp_udp_port_start,
                inst.status.as_str(),
                inst.pubkey,
                inst.ip,
                inst.username,
            ],
        )?;
        Ok(())
    }

    /// Fetch one non-destroyed instance by name.
    ///
    /// # Errors
    ///
    /// Fails on read errors or unmappable rows.
    pub fn get(&self, container_name: &str) -> StoreResult<Option<Instance>> {
        let conn = open(&self.path)?;
        conn.query_row(
            "SELECT container_name, owner_pubkey, contract_id, contract_dir, image_name,
                    peer_port, user_port, gp_tcp_port_start, gp_udp_port_start,
                    status, pubkey, ip, username
             FROM instances WHERE container_name = ?1 AND status != 'destroyed'",
            params![container_name],
            row_to_instance,
        )
        .optional()
        .map_err(StoreError::from)
    }

    /// All non-destroyed instances.
    ///
    /// # Errors
    ///
    /// Fails on read errors or unmappable rows.
    pub fn list(&self) -> StoreResult<Vec<Instance>> {
        let conn = open(&self.path)?;
        let mut stmt = conn.prepare(
            "SELECT container_name, owner_pubkey, contract_id, contract_dir, image_name,
                    peer_port, user_port, gp_tcp_port_start, gp_udp_port_start,
                    status, pubkey, ip, username
             FROM instances WHERE status != 'destroyed' ORDER BY peer_port",
        )?;
        let rows = stmt.query_map([], row_to_instance)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }

    /// Number of non-destroyed instances.
    ///
    /// # Errors
    ///
    /// Fails on read errors.
    pub fn count(&self) -> StoreResult<u64> {
        let conn = open(&self.path)?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM instances WHERE status != 'destroyed'",
            [],
            |row| row.get(0),
        )?;
        #[allow(clippy::cast_sign_loss)]
        Ok(count as u64)
    }

    /// Move an instance to a new status.
    ///
    /// # Errors
    ///
    /// Fails when the row is missing or the write fails.
    pub fn update_status(&self, container_name: &str, status: InstanceStatus) -> StoreResult<()> {
        let conn = open(&self.path)?;
        let changed = conn.execute(
            "UPDATE instances SET status = ?2 WHERE container_name = ?1",
            params![container_name, status.as_str()],
        )?;
        if changed == 0 {
            return Err(StoreError::Corrupt(format!(
                "no instance row for {container_name}"
            )));
        }
        Ok(())
    }

    /// Hard-delete an instance row.
    ///
    /// # Errors
    ///
    /// Fails on write errors.
    pub fn delete(&self, container_name: &str) -> StoreResult<()> {
        let conn = open(&self.path)?;
        conn.execute(
            "DELETE FROM instances WHERE container_name = ?1",
            params![container_name],
        )?;
        Ok(())
    }

    /// Port tuple of the instance holding the highest peer port, if any.
    ///
    /// # Errors
    ///
    /// Fails on read errors.
    pub fn max_ports(&self) -> StoreResult<Option<Ports>> {
        let conn = open(&self.path)?;
        conn.query_row(
            "SELECT peer_port, user_port, gp_tcp_port_start, gp_udp_port_start
             FROM instances WHERE status != 'destroyed'
             ORDER BY peer_port DESC LIMIT 1",
            [],
            |row| {
                Ok(Ports {
                    peer_port: row.get(0)?,
                    user_port: row.get(1)?,
                    gp_tcp_port_start: row.get(2)?,
                    gp_udp_port_start: row.get(3)?,
                })
            },
        )
        .optional()
        .map_err(StoreError::from)
    }
}

fn row_to_instance(row: &rusqlite::Row<'_>) -> rusqlite::Result<Instance> {
    let status: String = row.get(9)?;
    Ok(Instance {
        container_name: row.get(0)?,
        owner_pubkey: row.get(1)?,
        contract_id: row.get(2)?,
        contract_dir: row.get(3)?,
        image_name: row.get(4)?,
        assigned_ports: Ports {
            peer_port: row.get(5)?,
            user_port: row.get(6)?,
            gp_tcp_port_start: row.get(7)?,
            gp_udp_port_start: row.get(8)?,
        },
        status: InstanceStatus::parse(&status).unwrap_or(InstanceStatus::Exited),
        pubkey: row.get(10)?,
        ip: row.get(11)?,
        username: row.get(12)?,
    })
}

/// The message-board database (`mb-xahau.sqlite`).
#[derive(Debug, Clone)]
pub struct LeaseStore {
    path: PathBuf,
}

impl LeaseStore {
    /// Store handle for the database at `path`. No connection is held.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Create the schema if missing.
    ///
    /// # Errors
    ///
    /// Fails when the database cannot be opened or written.
    pub fn ensure_schema(&self) -> StoreResult<()> {
        let conn = open(&self.path)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS leases (
                tx_hash TEXT PRIMARY KEY,
                tenant_address TEXT NOT NULL,
                container_name TEXT NOT NULL,
                life_moments INTEGER NOT NULL,
                timestamp INTEGER NOT NULL,
                created_on_ledger INTEGER NOT NULL,
                status TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_leases_container ON leases(container_name)",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS util_data (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
            [],
        )?;
        Ok(())
    }

    /// Insert a new lease row.
    ///
    /// # Errors
    ///
    /// Fails on duplicate tx hashes or write errors.
    pub fn insert(&self, lease: &Lease) -> StoreResult<()> {
        let conn = open(&self.path)?;
        conn.execute(
            "INSERT INTO leases (tx_hash, tenant_address, container_name, life_moments,
                timestamp, created_on_ledger, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                lease.tx_hash,
                lease.tenant_address,
                lease.container_name,
                lease.life_moments,
                lease.timestamp,
                lease.created_on_ledger,
                lease.status.as_str(),
            ],
        )?;
        Ok(())
    }

    /// Fetch one lease by creating tx hash.
    ///
    /// # Errors
    ///
    /// Fails on read errors.
    pub fn get(&self, tx_hash: &str) -> StoreResult<Option<Lease>> {
        let conn = open(&self.path)?;
        conn.query_row(
            "SELECT tx_hash, tenant_address, container_name, life_moments, timestamp,
                    created_on_ledger, status
             FROM leases WHERE tx_hash = ?1",
            params![tx_hash],
            row_to_lease,
        )
        .optional()
        .map_err(StoreError::from)
    }

    /// The latest lease row for a container, preferring non-terminal
    /// rows. At most one non-terminal row exists per container.
    ///
    /// # Errors
    ///
    /// Fails on read errors.
    pub fn get_by_container(&self, container_name: &str) -> StoreResult<Option<Lease>> {
        let conn = open(&self.path)?;
        conn.query_row(
            "SELECT tx_hash, tenant_address, container_name, life_moments, timestamp,
                    created_on_ledger, status
             FROM leases WHERE container_name = ?1
             ORDER BY CASE WHEN status IN ('Acquiring','Acquired','Extended') THEN 0 ELSE 1 END,
                      timestamp DESC
             LIMIT 1",
            params![container_name],
            row_to_lease,
        )
        .optional()
        .map_err(StoreError::from)
    }

    /// All lease rows.
    ///
    /// # Errors
    ///
    /// Fails on read errors.
    pub fn list(&self) -> StoreResult<Vec<Lease>> {
        let conn = open(&self.path)?;
        let mut stmt = conn.prepare(
            "SELECT tx_hash, tenant_address, container_name, life_moments, timestamp,
                    created_on_ledger, status
             FROM leases ORDER BY timestamp",
        )?;
        let rows = stmt.query_map([], row_to_lease)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }

    /// Lease rows in `Acquired` or `Extended`.
    ///
    /// # Errors
    ///
    /// Fails on read errors.
    pub fn live(&self) -> StoreResult<Vec<Lease>> {
        let conn = open(&self.path)?;
        let mut stmt = conn.prepare(
            "SELECT tx_hash, tenant_address, container_name, life_moments, timestamp,
                    created_on_ledger, status
             FROM leases WHERE status IN ('Acquired', 'Extended') ORDER BY timestamp",
        )?;
        let rows = stmt.query_map([], row_to_lease)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }

    /// Move a lease to a new status.
    ///
    /// # Errors
    ///
    /// Fails when the row is missing or the write fails.
    pub fn update_status(&self, tx_hash: &str, status: LeaseStatus) -> StoreResult<()> {
        let conn = open(&self.path)?;
        let changed = conn.execute(
            "UPDATE leases SET status = ?2 WHERE tx_hash = ?1",
            params![tx_hash, status.as_str()],
        )?;
        if changed == 0 {
            return Err(StoreError::Corrupt(format!("no lease row for {tx_hash}")));
        }
        Ok(())
    }

    /// Record an acquire confirmation: status plus the ledger index and
    /// wall clock observed at submission.
    ///
    /// # Errors
    ///
    /// Fails when the row is missing or the write fails.
    pub fn mark_acquired(
        &self,
        tx_hash: &str,
        created_on_ledger: u64,
        timestamp: u64,
    ) -> StoreResult<()> {
        let conn = open(&self.path)?;
        let changed = conn.execute(
            "UPDATE leases SET status = 'Acquired', created_on_ledger = ?2, timestamp = ?3
             WHERE tx_hash = ?1",
            params![tx_hash, created_on_ledger, timestamp],
        )?;
        if changed == 0 {
            return Err(StoreError::Corrupt(format!("no lease row for {tx_hash}")));
        }
        Ok(())
    }

    /// Record a successful extension.
    ///
    /// # Errors
    ///
    /// Fails when the row is missing or the write fails.
    pub fn mark_extended(&self, tx_hash: &str, life_moments: u64) -> StoreResult<()> {
        let conn = open(&self.path)?;
        let changed = conn.execute(
            "UPDATE leases SET status = 'Extended', life_moments = ?2 WHERE tx_hash = ?1",
            params![tx_hash, life_moments],
        )?;
        if changed == 0 {
            return Err(StoreError::Corrupt(format!("no lease row for {tx_hash}")));
        }
        Ok(())
    }

    /// Hard-delete a lease row (after the slot is re-offered).
    ///
    /// # Errors
    ///
    /// Fails on write errors.
    pub fn delete(&self, tx_hash: &str) -> StoreResult<()> {
        let conn = open(&self.path)?;
        conn.execute("DELETE FROM leases WHERE tx_hash = ?1", params![tx_hash])?;
        Ok(())
    }

    /// The watched-ledger checkpoint; 0 when never written.
    ///
    /// # Errors
    ///
    /// Fails on read errors.
    pub fn last_watched_ledger(&self) -> StoreResult<u64> {
        let conn = open(&self.path)?;
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM util_data WHERE key = ?1",
                params![LAST_WATCHED_LEDGER],
                |row| row.get(0),
            )
            .optional()?;
        match value {
            None => Ok(0),
            Some(v) => v
                .parse::<u64>()
                .map_err(|_| StoreError::Corrupt(format!("bad checkpoint value {v}"))),
        }
    }

    /// Advance the watched-ledger checkpoint. The stored value never
    /// moves backwards.
    ///
    /// # Errors
    ///
    /// Fails on write errors.
    pub fn set_last_watched_ledger(&self, index: u64) -> StoreResult<()> {
        let current = self.last_watched_ledger()?;
        if index <= current {
            return Ok(());
        }
        let conn = open(&self.path)?;
        conn.execute(
            "INSERT INTO util_data (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![LAST_WATCHED_LEDGER, index.to_string()],
        )?;
        Ok(())
    }
}

fn row_to_lease(row: &rusqlite::Row<'_>) -> rusqlite::Result<Lease> {
    let status: String = row.get(6)?;
    Ok(Lease {
        tx_hash: row.get(0)?,
        tenant_address: row.get(1)?,
        container_name: row.get(2)?,
        life_moments: row.get(3)?,
        timestamp: row.get(4)?,
        created_on_ledger: row.get(5)?,
        status: LeaseStatus::parse(&status).unwrap_or(LeaseStatus::Failed),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(name: &str, peer: u16) -> Instance {
        Instance {
            container_name: name.to_string(),
            owner_pubkey: "edAA".to_string(),
            contract_id: "7c7e9f51-70fa-4d00-9c6d-51a1f1bd7d2b".to_string(),
            contract_dir: format!("/home/{name}/contract"),
            image_name: "hp.latest-ubt.20.04".to_string(),
            assigned_ports: Ports {
                peer_port: peer,
                user_port: peer + 3340,
                gp_tcp_port_start: peer + 13664,
                gp_udp_port_start: peer + 16203,
            },
            status: InstanceStatus::Created,
            pubkey: "ed1111".to_string(),
            ip: "host.example.net".to_string(),
            username: format!("sashi{peer}"),
        }
    }

    fn lease(tx: &str, container: &str, status: LeaseStatus) -> Lease {
        Lease {
            tx_hash: tx.to_string(),
            tenant_address: "rTENANT".to_string(),
            container_name: container.to_string(),
            life_moments: 1,
            timestamp: 1_700_000_000,
            created_on_ledger: 82_000_001,
            status,
        }
    }

    #[test]
    fn instance_insert_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = InstanceStore::new(dir.path().join("sa.sqlite"));
        store.ensure_schema().unwrap();

        store.insert(&instance("c1", 22861)).unwrap();
        let got = store.get("c1").unwrap().unwrap();
        assert_eq!(got.assigned_ports.peer_port, 22861);
        assert_eq!(got.status, InstanceStatus::Created);

        store.update_status("c1", InstanceStatus::Running).unwrap();
        assert_eq!(store.get("c1").unwrap().unwrap().status, InstanceStatus::Running);

        store.delete("c1").unwrap();
        assert!(store.get("c1").unwrap().is_none());
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn instance_duplicate_name_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = InstanceStore::new(dir.path().join("sa.sqlite"));
        store.ensure_schema().unwrap();
        store.insert(&instance("c1", 22861)).unwrap();
        assert!(store.insert(&instance("c1", 22862)).is_err());
    }

    #[test]
    fn max_ports_tracks_highest_peer() {
        let dir = tempfile::tempdir().unwrap();
        let store = InstanceStore::new(dir.path().join("sa.sqlite"));
        store.ensure_schema().unwrap();
        assert!(store.max_ports().unwrap().is_none());

        store.insert(&instance("c1", 22861)).unwrap();
        store.insert(&instance("c2", 22863)).unwrap();
        store.insert(&instance("c3", 22862)).unwrap();
        assert_eq!(store.max_ports().unwrap().unwrap().peer_port, 22863);
    }

    #[test]
    fn lease_lifecycle_updates() {
        let dir = tempfile::tempdir().unwrap();
        let store = LeaseStore::new(dir.path().join("mb.sqlite"));
        store.ensure_schema().unwrap();

        store.insert(&lease("TX1", "T1", LeaseStatus::Acquiring)).unwrap();
        store.mark_acquired("TX1", 82_000_005, 1_700_000_100).unwrap();
        let got = store.get("TX1").unwrap().unwrap();
        assert_eq!(got.status, LeaseStatus::Acquired);
        assert_eq!(got.created_on_ledger, 82_000_005);

        store.mark_extended("TX1", 3).unwrap();
        let got = store.get("TX1").unwrap().unwrap();
        assert_eq!(got.status, LeaseStatus::Extended);
        assert_eq!(got.life_moments, 3);

        assert_eq!(store.live().unwrap().len(), 1);
        store.update_status("TX1", LeaseStatus::Destroyed).unwrap();
        assert!(store.live().unwrap().is_empty());

        store.delete("TX1").unwrap();
        assert!(store.get("TX1").unwrap().is_none());
    }

    #[test]
    fn get_by_container_prefers_non_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let store = LeaseStore::new(dir.path().join("mb.sqlite"));
        store.ensure_schema().unwrap();

        let mut old = lease("TX1", "T1", LeaseStatus::Destroyed);
        old.timestamp = 1_700_000_500; // newer but terminal
        store.insert(&old).unwrap();
        store.insert(&lease("TX2", "T1", LeaseStatus::Acquired)).unwrap();

        let got = store.get_by_container("T1").unwrap().unwrap();
        assert_eq!(got.tx_hash, "TX2");
    }

    #[test]
    fn checkpoint_is_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let store = LeaseStore::new(dir.path().join("mb.sqlite"));
        store.ensure_schema().unwrap();

        assert_eq!(store.last_watched_ledger().unwrap(), 0);
        store.set_last_watched_ledger(100).unwrap();
        assert_eq!(store.last_watched_ledger().unwrap(), 100);
        store.set_last_watched_ledger(50).unwrap();
        assert_eq!(store.last_watched_ledger().unwrap(), 100);
        store.set_last_watched_ledger(101).unwrap();
        assert_eq!(store.last_watched_ledger().unwrap(), 101);
    }

    #[test]
    fn missing_lease_update_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = LeaseStore::new(dir.path().join("mb.sqlite"));
        store.ensure_schema().unwrap();
        assert!(matches!(
            store.update_status("NOPE", LeaseStatus::Failed),
            Err(StoreError::Corrupt(_))
        ));
    }
}
