//! Instance lifecycle orchestration.
//!
//! All mutations run on the daemon's single dispatch task, so the
//! manager holds its state (port allocator, store handles) without
//! locks. Each operation sequences the external collaborators — install
//! scripts, docker, hpfs — and keeps the instance store truthful,
//! rolling back partial work when a later step fails.

use sashi_core::config::AgentConfig;
use sashi_core::error::AgentError;
use sashi_core::instance::{Instance, InstanceStatus, Resources};
use sashi_core::message::{ConfigOverrides, CreateRequest};
use sashi_core::store::{InstanceStore, LeaseStore, StoreError};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::context::AgentContext;
use crate::contract::{
    apply_overrides, install_contract_dir, read_fs_settings, stage_contract_dir, user_contract_dir,
};
use crate::docker::DockerRunner;
use crate::hpfs;
use crate::ports::PortAllocator;
use crate::users::{install_user, uninstall_user};

fn read_err(e: StoreError) -> AgentError {
    AgentError::DbRead(e.to_string())
}

fn write_err(e: StoreError) -> AgentError {
    AgentError::DbWrite(e.to_string())
}

/// Owns the instance store and drives every lifecycle transition.
pub struct InstanceManager {
    ctx: AgentContext,
    cfg: AgentConfig,
    store: InstanceStore,
    lease_store: LeaseStore,
    docker: DockerRunner,
    allocator: PortAllocator,
    resources: Resources,
}

impl InstanceManager {
    /// Open the instance store and seed the port allocator from it.
    ///
    /// # Errors
    ///
    /// Fails when the store cannot be prepared or scanned.
    pub fn init(ctx: AgentContext, cfg: AgentConfig) -> Result<Self, AgentError> {
        let store = InstanceStore::new(&ctx.db_path);
        store.ensure_schema().map_err(write_err)?;

        let instances = store.list().map_err(read_err)?;
        let init_ports = sashi_core::instance::Ports {
            peer_port: cfg.hp.init_peer_port,
            user_port: cfg.hp.init_user_port,
            gp_tcp_port_start: cfg.hp.init_gp_tcp_port,
            gp_udp_port_start: cfg.hp.init_gp_udp_port,
        };
        let allocator = PortAllocator::new(init_ports, &instances);

        let resources = Resources::split(
            cfg.system.max_cpu_us,
            cfg.system.max_mem_kbytes,
            cfg.system.max_swap_kbytes,
            cfg.system.max_storage_kbytes,
            cfg.system.max_instance_count.max(1),
        );
        info!(
            cpu_us = resources.cpu_us,
            mem_kbytes = resources.mem_kbytes,
            storage_kbytes = resources.storage_kbytes,
            "per-instance resources"
        );

        let docker = DockerRunner::new(&ctx.docker_bin_dir);
        let lease_store = LeaseStore::new(&ctx.mb_db_path);
        Ok(Self {
            ctx,
            cfg,
            store,
            lease_store,
            docker,
            allocator,
            resources,
        })
    }

    /// Create a new instance: user, contract dir, container. Leaves the
    /// instance in `created`; [`Self::initiate`] starts it.
    ///
    /// # Errors
    ///
    /// Any failing step rolls back the earlier ones and reports its
    /// kind.
    pub async fn create(&mut self, req: &CreateRequest) -> Result<Instance, AgentError> {
        if self
            .store
            .get(&req.container_name)
            .map_err(read_err)?
            .is_some()
        {
            error!(container_name = %req.container_name, "instance already exists");
            return Err(AgentError::InstanceAlreadyExists(req.container_name.clone()));
        }

        let allocated = self.store.count().map_err(read_err)?;
        if allocated >= self.cfg.system.max_instance_count {
            error!("max instance count reached");
            return Err(AgentError::MaxAllocReached);
        }

        if uuid::Uuid::parse_str(&req.contract_id).is_err() {
            return Err(AgentError::ContractIdFormat(req.contract_id.clone()));
        }

        if let Some(prefix) = &self.cfg.docker.image_prefix {
            if !req.image.starts_with(prefix.as_str()) {
                return Err(AgentError::DockerImageInvalid(req.image.clone()));
            }
        }

        let ports = self.allocator.peek();

        let user = install_user(
            &self.ctx.user_install_script,
            self.resources,
            &req.container_name,
            ports,
            &req.image,
            &self.cfg.docker.registry_address,
            &req.outbound_ipv6,
            &req.outbound_net_interface,
        )
        .await
        .map_err(AgentError::UserInstall)?;

        let contract_dir = user_contract_dir(&user.username, &req.container_name);
        // Anything after `--` is install-script metadata, not an image.
        let image_name = req
            .image
            .split_once("--")
            .map_or(req.image.as_str(), |(base, _)| base)
            .to_string();

        let keys = match self.build_contract(req, &contract_dir, &user.username, ports).await {
            Ok(keys) => keys,
            Err(e) => {
                error!(container_name = %req.container_name, "contract setup failed: {e}");
                self.rollback_user(&user.username, ports, &req.container_name).await;
                return Err(AgentError::Instance(e));
            }
        };

        if let Err(e) = self
            .docker
            .create(&user.username, &image_name, &req.container_name, &contract_dir, ports)
            .await
        {
            error!(container_name = %req.container_name, "container create failed: {e}");
            self.rollback_user(&user.username, ports, &req.container_name).await;
            return Err(AgentError::Instance(e.to_string()));
        }

        let instance = Instance {
            container_name: req.container_name.clone(),
            owner_pubkey: req.owner_pubkey.clone(),
            contract_id: req.contract_id.clone(),
            contract_dir,
            image_name,
            assigned_ports: ports,
            status: InstanceStatus::Created,
            pubkey: keys,
            ip: self.cfg.hp.host_address.clone(),
            username: user.username.clone(),
        };

        if let Err(e) = self.store.insert(&instance) {
            error!(container_name = %req.container_name, "instance row insert failed: {e}");
            let _ = self.docker.remove(&user.username, &req.container_name).await;
            self.rollback_user(&user.username, ports, &req.container_name).await;
            return Err(write_err(e));
        }

        self.allocator.commit();
        info!(container_name = %req.container_name, "instance created");
        Ok(instance)
    }

    async fn build_contract(
        &self,
        req: &CreateRequest,
        contract_dir: &str,
        username: &str,
        ports: sashi_core::instance::Ports,
    ) -> Result<String, String> {
        let (staging, keys) = stage_contract_dir(
            &self.ctx.contract_template_dir,
            &req.owner_pubkey,
            &req.contract_id,
            ports,
        )
        .map_err(|e| e.to_string())?;
        install_contract_dir(&staging, contract_dir, username)
            .await
            .map_err(|e| e.to_string())?;
        Ok(keys.public_key)
    }

    async fn rollback_user(
        &self,
        username: &str,
        ports: sashi_core::instance::Ports,
        container_name: &str,
    ) {
        if let Err(e) = uninstall_user(
            &self.ctx.user_uninstall_script,
            username,
            ports,
            container_name,
        )
        .await
        {
            warn!(username, "rollback uninstall failed: {e}");
        }
    }

    /// Apply tenant config overrides and start the created instance.
    ///
    /// # Errors
    ///
    /// Reports the failing step; the caller rolls the instance back via
    /// [`Self::destroy`].
    pub async fn initiate(
        &mut self,
        container_name: &str,
        overrides: &ConfigOverrides,
    ) -> Result<(), AgentError> {
        let instance = self
            .store
            .get(container_name)
            .map_err(read_err)?
            .ok_or_else(|| AgentError::NoContainer(container_name.to_string()))?;
        if instance.status != InstanceStatus::Created {
            return Err(AgentError::DupContainer(container_name.to_string()));
        }

        let config_path = format!("{}/cfg/hp.cfg", instance.contract_dir);
        let raw = std::fs::read(&config_path)
            .map_err(|e| AgentError::ConfRead(format!("{config_path}: {e}")))?;
        let mut doc: Value = serde_json::from_slice(&raw)
            .map_err(|e| AgentError::ConfRead(format!("{config_path}: {e}")))?;

        apply_overrides(&mut doc, overrides).map_err(AgentError::ContainerConf)?;
        let (log_level, full_history) = read_fs_settings(&doc).map_err(AgentError::ContainerConf)?;

        std::fs::write(&config_path, serde_json::to_vec_pretty(&doc).unwrap_or_default())
            .map_err(|e| AgentError::ContainerConf(e.to_string()))?;
        hpfs::update_service_conf(&instance.username, &log_level, full_history)
            .map_err(|e| AgentError::ContainerConf(e.to_string()))?;
        hpfs::start(&instance.username)
            .await
            .map_err(|e| AgentError::ContainerConf(e.to_string()))?;

        if let Err(e) = self.docker.start(&instance.username, container_name).await {
            let _ = hpfs::stop(&instance.username).await;
            return Err(AgentError::ContainerStart(e.to_string()));
        }

        if let Err(e) = self.store.update_status(container_name, InstanceStatus::Running) {
            let _ = self.docker.stop(&instance.username, container_name).await;
            let _ = hpfs::stop(&instance.username).await;
            return Err(AgentError::ContainerUpdate(e.to_string()));
        }

        info!(container_name, "instance initiated");
        Ok(())
    }

    /// Start a stopped instance, re-reading its on-disk config first.
    ///
    /// # Errors
    ///
    /// Reports the failing step without altering earlier state.
    pub async fn start(&mut self, container_name: &str) -> Result<(), AgentError> {
        let instance = self
            .store
            .get(container_name)
            .map_err(read_err)?
            .ok_or_else(|| AgentError::NoContainer(container_name.to_string()))?;
        if instance.status != InstanceStatus::Stopped {
            return Err(AgentError::DupContainer(container_name.to_string()));
        }

        let config_path = format!("{}/cfg/hp.cfg", instance.contract_dir);
        let raw = std::fs::read(&config_path)
            .map_err(|e| AgentError::ConfRead(format!("{config_path}: {e}")))?;
        let doc: Value = serde_json::from_slice(&raw)
            .map_err(|e| AgentError::ConfRead(format!("{config_path}: {e}")))?;
        let (log_level, full_history) = read_fs_settings(&doc).map_err(AgentError::ContainerConf)?;

        hpfs::update_service_conf(&instance.username, &log_level, full_history)
            .map_err(|e| AgentError::ContainerConf(e.to_string()))?;
        hpfs::start(&instance.username)
            .await
            .map_err(|e| AgentError::ContainerConf(e.to_string()))?;
        if let Err(e) = self.docker.start(&instance.username, container_name).await {
            let _ = hpfs::stop(&instance.username).await;
            return Err(AgentError::ContainerStart(e.to_string()));
        }

        if let Err(e) = self.store.update_status(container_name, InstanceStatus::Running) {
            let _ = self.docker.stop(&instance.username, container_name).await;
            let _ = hpfs::stop(&instance.username).await;
            return Err(AgentError::ContainerUpdate(e.to_string()));
        }

        info!(container_name, "instance started");
        Ok(())
    }

    /// Stop a running instance and its hpfs services.
    ///
    /// # Errors
    ///
    /// Reports the failing step.
    pub async fn stop(&mut self, container_name: &str) -> Result<(), AgentError> {
        let instance = self
            .store
            .get(container_name)
            .map_err(read_err)?
            .ok_or_else(|| AgentError::NoContainer(container_name.to_string()))?;
        if instance.status != InstanceStatus::Running {
            return Err(AgentError::DupContainer(container_name.to_string()));
        }

        self.docker
            .stop(&instance.username, container_name)
            .await
            .map_err(|e| AgentError::ContainerStart(e.to_string()))?;
        self.store
            .update_status(container_name, InstanceStatus::Stopped)
            .map_err(|e| AgentError::ContainerUpdate(e.to_string()))?;
        hpfs::stop(&instance.username)
            .await
            .map_err(|e| AgentError::ContainerConf(e.to_string()))?;

        info!(container_name, "instance stopped");
        Ok(())
    }

    /// Destroy an instance: stop services, remove the container and
    /// user, hard-delete the row, and free the port tuple.
    ///
    /// # Errors
    ///
    /// Reports the failing step; service and container teardown are
    /// best-effort since the uninstall script removes the user wholesale.
    pub async fn destroy(&mut self, container_name: &str) -> Result<(), AgentError> {
        let instance = self
            .store
            .get(container_name)
            .map_err(read_err)?
            .ok_or_else(|| AgentError::NoContainer(container_name.to_string()))?;

        info!(container_name, "destroying instance");
        if let Err(e) = hpfs::stop(&instance.username).await {
            warn!(container_name, "hpfs stop during destroy failed: {e}");
        }
        if let Err(e) = self.docker.remove(&instance.username, container_name).await {
            warn!(container_name, "container remove during destroy failed: {e}");
        }

        uninstall_user(
            &self.ctx.user_uninstall_script,
            &instance.username,
            instance.assigned_ports,
            container_name,
        )
        .await
        .map_err(AgentError::UserUninstall)?;

        self.store.delete(container_name).map_err(write_err)?;
        self.allocator.release(instance.assigned_ports);
        Ok(())
    }

    /// All non-destroyed instances joined with their lease rows.
    ///
    /// # Errors
    ///
    /// Fails when the instance store cannot be read. A missing or
    /// unreadable message-board database only drops the lease fields.
    pub fn list(&self) -> Result<Vec<Value>, AgentError> {
        let instances = self.store.list().map_err(read_err)?;
        let leases = if self.ctx.mb_db_path.exists() {
            match self.lease_store.list() {
                Ok(leases) => leases,
                Err(e) => {
                    warn!("message-board db read failed, listing without leases: {e}");
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        Ok(instances
            .into_iter()
            .map(|inst| {
                let mut row = serde_json::to_value(&inst).unwrap_or(Value::Null);
                if let Some(lease) = leases.iter().find(|l| l.container_name == inst.container_name)
                {
                    if let Value::Object(map) = &mut row {
                        map.insert("tenant_address".into(), Value::from(lease.tenant_address.clone()));
                        map.insert("timestamp".into(), Value::from(lease.timestamp));
                        map.insert("created_on_ledger".into(), Value::from(lease.created_on_ledger));
                        map.insert("life_moments".into(), Value::from(lease.life_moments));
                    }
                }
                row
            })
            .collect())
    }

    /// One instance row by name.
    ///
    /// # Errors
    ///
    /// `container_not_found` when no such non-destroyed instance exists.
    pub fn inspect(&self, container_name: &str) -> Result<Instance, AgentError> {
        self.store
            .get(container_name)
            .map_err(read_err)?
            .ok_or_else(|| AgentError::ContainerNotFound(container_name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use sashi_core::config::{
        AgentConfig, DockerConfig, HpConfig, Ipv6Config, NetworkingConfig, SchedulerConfig,
        SystemConfig, XrplConfig,
    };
    use sashi_core::lease::{Lease, LeaseStatus};

    use super::*;

    fn test_config() -> AgentConfig {
        AgentConfig {
            version: "0.8.2".into(),
            xrpl: XrplConfig {
                address: "rHOST".into(),
                secret: "sSECRET".into(),
                governor_address: "rGOV".into(),
                network: None,
                rippled_server: None,
                fallback_rippled_servers: Vec::new(),
                lease_amount: 2.0,
                affordable_extra_fee: 0,
                reputation_address: None,
                reputation_secret: None,
            },
            networking: NetworkingConfig {
                ipv6: Ipv6Config {
                    subnet: String::new(),
                    interface: String::new(),
                },
            },
            system: SystemConfig {
                max_instance_count: 3,
                max_cpu_us: 900_000,
                max_mem_kbytes: 3_145_728,
                max_swap_kbytes: 3_145_728,
                max_storage_kbytes: 9_437_184,
            },
            hp: HpConfig {
                init_peer_port: 22861,
                init_user_port: 26201,
                init_gp_tcp_port: 36525,
                init_gp_udp_port: 39064,
                host_address: "host.example.net".into(),
            },
            docker: DockerConfig {
                registry_address: "registry.example.net".into(),
                image_prefix: None,
            },
            scheduler: SchedulerConfig::default(),
        }
    }

    fn manager_in(dir: &std::path::Path) -> InstanceManager {
        let ctx = AgentContext::new(dir.to_path_buf(), dir.join("bin"));
        InstanceManager::init(ctx, test_config()).unwrap()
    }

    fn seeded_instance(name: &str, peer: u16) -> Instance {
        Instance {
            container_name: name.into(),
            owner_pubkey: "edOWNER".into(),
            contract_id: "7c7e9f51-70fa-4d00-9c6d-51a1f1bd7d2b".into(),
            contract_dir: format!("/home/sashi{peer}/{name}/contract"),
            image_name: "hp.latest-ubt.20.04".into(),
            assigned_ports: sashi_core::instance::Ports {
                peer_port: peer,
                user_port: peer + 3340,
                gp_tcp_port_start: peer + 13664,
                gp_udp_port_start: peer + 16203,
            },
            status: InstanceStatus::Running,
            pubkey: "ed11".into(),
            ip: "host.example.net".into(),
            username: format!("sashi{peer}"),
        }
    }

    #[tokio::test]
    async fn create_rejects_bad_contract_id_before_any_side_effect() {
        let dir = tempfile::tempdir().unwrap();
        let mut mgr = manager_in(dir.path());
        let req = CreateRequest {
            container_name: "c1".into(),
            owner_pubkey: "edOWNER".into(),
            contract_id: "not-a-uuid".into(),
            image: "hp.latest-ubt.20.04".into(),
            outbound_ipv6: String::new(),
            outbound_net_interface: String::new(),
            config: ConfigOverrides::default(),
        };
        let err = mgr.create(&req).await.unwrap_err();
        assert_eq!(err.kind(), "contractid_bad_format");
    }

    #[tokio::test]
    async fn create_gates_on_max_instance_count() {
        let dir = tempfile::tempdir().unwrap();
        let mut mgr = manager_in(dir.path());
        for (name, peer) in [("a", 22861), ("b", 22862), ("c", 22863)] {
            mgr.store.insert(&seeded_instance(name, peer)).unwrap();
        }
        let req = CreateRequest {
            container_name: "d".into(),
            owner_pubkey: "edOWNER".into(),
            contract_id: "7c7e9f51-70fa-4d00-9c6d-51a1f1bd7d2b".into(),
            image: "hp.latest-ubt.20.04".into(),
            outbound_ipv6: String::new(),
            outbound_net_interface: String::new(),
            config: ConfigOverrides::default(),
        };
        let err = mgr.create(&req).await.unwrap_err();
        assert_eq!(err.kind(), "max_alloc_reached");
    }

    #[tokio::test]
    async fn create_rejects_duplicate_names() {
        let dir = tempfile::tempdir().unwrap();
        let mut mgr = manager_in(dir.path());
        mgr.store.insert(&seeded_instance("c1", 22861)).unwrap();
        let req = CreateRequest {
            container_name: "c1".into(),
            owner_pubkey: "edOWNER".into(),
            contract_id: "7c7e9f51-70fa-4d00-9c6d-51a1f1bd7d2b".into(),
            image: "hp.latest-ubt.20.04".into(),
            outbound_ipv6: String::new(),
            outbound_net_interface: String::new(),
            config: ConfigOverrides::default(),
        };
        let err = mgr.create(&req).await.unwrap_err();
        assert_eq!(err.kind(), "instance_already_exists");
    }

    #[tokio::test]
    async fn image_prefix_restriction_applies_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = AgentContext::new(dir.path().to_path_buf(), dir.path().join("bin"));
        let mut cfg = test_config();
        cfg.docker.image_prefix = Some("sashimono/".into());
        let mut mgr = InstanceManager::init(ctx, cfg).unwrap();
        let req = CreateRequest {
            container_name: "c1".into(),
            owner_pubkey: "edOWNER".into(),
            contract_id: "7c7e9f51-70fa-4d00-9c6d-51a1f1bd7d2b".into(),
            image: "malicious/image".into(),
            outbound_ipv6: String::new(),
            outbound_net_interface: String::new(),
            config: ConfigOverrides::default(),
        };
        let err = mgr.create(&req).await.unwrap_err();
        assert_eq!(err.kind(), "docker_image_invalid");
    }

    #[tokio::test]
    async fn state_gated_transitions_reject_wrong_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut mgr = manager_in(dir.path());
        let mut inst = seeded_instance("c1", 22861);
        inst.status = InstanceStatus::Running;
        mgr.store.insert(&inst).unwrap();

        // start requires stopped
        let err = mgr.start("c1").await.unwrap_err();
        assert_eq!(err.kind(), "dup_container");
        // initiate requires created
        let err = mgr.initiate("c1", &ConfigOverrides::default()).await.unwrap_err();
        assert_eq!(err.kind(), "dup_container");
        // unknown names
        let err = mgr.stop("zz").await.unwrap_err();
        assert_eq!(err.kind(), "no_container");
    }

    #[tokio::test]
    async fn list_joins_lease_fields() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager_in(dir.path());
        mgr.store.insert(&seeded_instance("T1", 22861)).unwrap();

        std::fs::create_dir_all(dir.path().join("mb-xahau")).unwrap();
        let leases = LeaseStore::new(dir.path().join("mb-xahau/mb-xahau.sqlite"));
        leases.ensure_schema().unwrap();
        leases
            .insert(&Lease {
                tx_hash: "TX1".into(),
                tenant_address: "rTENANT".into(),
                container_name: "T1".into(),
                life_moments: 2,
                timestamp: 1_700_000_000,
                created_on_ledger: 82_000_001,
                status: LeaseStatus::Acquired,
            })
            .unwrap();

        let rows = mgr.list().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["container_name"], "T1");
        assert_eq!(rows[0]["tenant_address"], "rTENANT");
        assert_eq!(rows[0]["life_moments"], 2);
    }

    #[tokio::test]
    async fn inspect_reports_container_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager_in(dir.path());
        let err = mgr.inspect("missing").unwrap_err();
        assert_eq!(err.kind(), "container_not_found");
    }
}
