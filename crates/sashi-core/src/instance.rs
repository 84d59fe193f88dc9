//! Instance data model owned by the lifecycle daemon.

use serde::{Deserialize, Serialize};

/// The four port allocations held by one instance.
///
/// The two general-purpose values are the first of a consecutive pair
/// each, so one instance actually occupies six host ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Ports {
    /// Mesh peer port (published tcp and udp).
    pub peer_port: u16,
    /// User-facing websocket port.
    pub user_port: u16,
    /// First of two general-purpose tcp ports.
    pub gp_tcp_port_start: u16,
    /// First of two general-purpose udp ports.
    pub gp_udp_port_start: u16,
}

impl Ports {
    /// Advance by one allocation step: +1 on peer and user, +2 on each
    /// general-purpose base.
    #[must_use]
    pub fn next(self) -> Self {
        Self {
            peer_port: self.peer_port + 1,
            user_port: self.user_port + 1,
            gp_tcp_port_start: self.gp_tcp_port_start + 2,
            gp_udp_port_start: self.gp_udp_port_start + 2,
        }
    }
}

/// Lifecycle states of a container instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    /// Container created but never started.
    Created,
    /// Container running.
    Running,
    /// Container stopped by request.
    Stopped,
    /// Row scheduled for hard delete.
    Destroyed,
    /// Container exited on its own.
    Exited,
}

impl InstanceStatus {
    /// Wire/db string for this status.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Destroyed => "destroyed",
            Self::Exited => "exited",
        }
    }

    /// Parse the db string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(Self::Created),
            "running" => Some(Self::Running),
            "stopped" => Some(Self::Stopped),
            "destroyed" => Some(Self::Destroyed),
            "exited" => Some(Self::Exited),
            _ => None,
        }
    }
}

/// One container instance as recorded in the instance store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    /// Primary key. Equals the lease token id when created by the
    /// reconciler.
    pub container_name: String,
    /// Public key of the tenant that owns the instance.
    pub owner_pubkey: String,
    /// Contract id configured into the instance (uuid).
    pub contract_id: String,
    /// Host path of the materialized contract directory.
    pub contract_dir: String,
    /// Docker image the container was created from.
    pub image_name: String,
    /// Ports held by this instance.
    pub assigned_ports: Ports,
    /// Current lifecycle status.
    pub status: InstanceStatus,
    /// Hex-encoded node public key generated at create time.
    pub pubkey: String,
    /// Externally visible address of this host.
    pub ip: String,
    /// OS user the instance runs under.
    pub username: String,
}

/// Per-instance resource quotas, derived by dividing the host maxima by
/// the configured instance count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Resources {
    /// CPU time an instance may consume, in microseconds.
    pub cpu_us: u64,
    /// Memory an instance may allocate, in kilobytes.
    pub mem_kbytes: u64,
    /// Swap an instance may allocate, in kilobytes.
    pub swap_kbytes: u64,
    /// Physical storage an instance may allocate, in kilobytes.
    pub storage_kbytes: u64,
}

impl Resources {
    /// Split the host maxima evenly across `instance_count` slots. Swap
    /// is granted on top of the memory share.
    #[must_use]
    pub fn split(
        max_cpu_us: u64,
        max_mem_kbytes: u64,
        max_swap_kbytes: u64,
        max_storage_kbytes: u64,
        instance_count: u64,
    ) -> Self {
        let mem_kbytes = max_mem_kbytes / instance_count;
        Self {
            cpu_us: max_cpu_us / instance_count,
            mem_kbytes,
            swap_kbytes: mem_kbytes + max_swap_kbytes / instance_count,
            storage_kbytes: max_storage_kbytes / instance_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ports_step_advances_gp_by_two() {
        let p = Ports {
            peer_port: 22861,
            user_port: 26201,
            gp_tcp_port_start: 36525,
            gp_udp_port_start: 39064,
        };
        let n = p.next();
        assert_eq!(n.peer_port, 22862);
        assert_eq!(n.user_port, 26202);
        assert_eq!(n.gp_tcp_port_start, 36527);
        assert_eq!(n.gp_udp_port_start, 39066);
    }

    #[test]
    fn status_roundtrip() {
        for s in [
            InstanceStatus::Created,
            InstanceStatus::Running,
            InstanceStatus::Stopped,
            InstanceStatus::Destroyed,
            InstanceStatus::Exited,
        ] {
            assert_eq!(InstanceStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(InstanceStatus::parse("paused"), None);
    }

    #[test]
    fn resource_split_grants_swap_on_top_of_memory() {
        let r = Resources::split(8_000_000, 4_000_000, 2_000_000, 40_000_000, 4);
        assert_eq!(r.cpu_us, 2_000_000);
        assert_eq!(r.mem_kbytes, 1_000_000);
        assert_eq!(r.swap_kbytes, 1_500_000);
        assert_eq!(r.storage_kbytes, 10_000_000);
    }
}
