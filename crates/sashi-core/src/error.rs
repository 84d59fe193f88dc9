//! Error types shared across the agent services.
//!
//! Socket-visible failures carry a machine-readable kind string that is
//! returned verbatim in `*_error` replies; [`AgentError::kind`] is the
//! single mapping from error to wire string.

use thiserror::Error;

/// Errors raised by the lifecycle daemon while mutating instances.
///
/// Every variant maps to one of the stable kind strings the socket
/// protocol exposes, so handlers can reply without re-deriving the
/// failure class.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AgentError {
    /// The inbound message was not a valid JSON envelope.
    #[error("malformed message")]
    Format,

    /// The envelope carried an unrecognized `type`.
    #[error("unknown message type: {0}")]
    UnknownType(String),

    /// Reading from the instance database failed.
    #[error("instance db read failed: {0}")]
    DbRead(String),

    /// Writing to the instance database failed.
    #[error("instance db write failed: {0}")]
    DbWrite(String),

    /// The user install script reported failure.
    #[error("user install failed: {0}")]
    UserInstall(String),

    /// The user uninstall script reported failure.
    #[error("user uninstall failed: {0}")]
    UserUninstall(String),

    /// Contract or container creation failed.
    #[error("instance creation failed: {0}")]
    Instance(String),

    /// The instance's on-disk contract config could not be read.
    #[error("contract config read failed: {0}")]
    ConfRead(String),

    /// Rewriting the contract config or starting hpfs failed.
    #[error("contract config update failed: {0}")]
    ContainerConf(String),

    /// `docker start` (or the surrounding flow) failed.
    #[error("container start failed: {0}")]
    ContainerStart(String),

    /// The instance row could not be moved to its new status.
    #[error("container status update failed: {0}")]
    ContainerUpdate(String),

    /// Container teardown failed.
    #[error("container destroy failed: {0}")]
    ContainerDestroy(String),

    /// No instance row exists for the requested container.
    #[error("no container named {0}")]
    NoContainer(String),

    /// The container is not in the state the operation requires.
    #[error("container {0} is in the wrong state for this operation")]
    DupContainer(String),

    /// The configured maximum instance count has been reached.
    #[error("max instance allocation reached")]
    MaxAllocReached,

    /// The supplied contract id is not a valid UUID.
    #[error("contract id is not a valid uuid: {0}")]
    ContractIdFormat(String),

    /// The supplied docker image is not acceptable.
    #[error("docker image not allowed: {0}")]
    DockerImageInvalid(String),

    /// Lookup by name found nothing.
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// Creation was asked for a name that already has a row.
    #[error("instance already exists: {0}")]
    InstanceAlreadyExists(String),
}

impl AgentError {
    /// The stable machine-readable kind string for this error.
    ///
    /// These strings are part of the socket protocol; they must not
    /// change without coordinating with every client.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Format => "format_error",
            Self::UnknownType(_) => "type_error",
            Self::DbRead(_) => "db_read_error",
            Self::DbWrite(_) => "db_write_error",
            Self::UserInstall(_) => "user_install_error",
            Self::UserUninstall(_) => "user_uninstall_error",
            Self::Instance(_) => "instance_error",
            Self::ConfRead(_) => "conf_read_error",
            Self::ContainerConf(_) => "container_conf_error",
            Self::ContainerStart(_) => "container_start_error",
            Self::ContainerUpdate(_) => "container_update_error",
            Self::ContainerDestroy(_) => "container_destroy_error",
            Self::NoContainer(_) => "no_container",
            Self::DupContainer(_) => "dup_container",
            Self::MaxAllocReached => "max_alloc_reached",
            Self::ContractIdFormat(_) => "contractid_bad_format",
            Self::DockerImageInvalid(_) => "docker_image_invalid",
            Self::ContainerNotFound(_) => "container_not_found",
            Self::InstanceAlreadyExists(_) => "instance_already_exists",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_strings_are_stable() {
        assert_eq!(AgentError::Format.kind(), "format_error");
        assert_eq!(AgentError::MaxAllocReached.kind(), "max_alloc_reached");
        assert_eq!(
            AgentError::ContractIdFormat("x".into()).kind(),
            "contractid_bad_format"
        );
        assert_eq!(
            AgentError::InstanceAlreadyExists("a".into()).kind(),
            "instance_already_exists"
        );
    }

    #[test]
    fn display_carries_detail() {
        let err = AgentError::NoContainer("web1".into());
        assert!(err.to_string().contains("web1"));
    }
}
