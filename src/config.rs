use crate::ip::pool::{ContainerPool, PoolError};
use log::warn;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Directory the daemon creates its socket in unless told otherwise
pub const DEFAULT_SOCKET_DIR: &str = "/run/cni";
/// Driver name, which is also the CNI `ipam.type` the plugin is invoked as
pub const DEFAULT_DRIVER_NAME: &str = "ipam-plugin";
pub const DEFAULT_NETWORK_VIEW: &str = "default";
pub const DEFAULT_NETWORK_CONTAINER: &str = "172.18.0.0/16";
pub const DEFAULT_PREFIX_LENGTH: u8 = 24;
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(60);

/// What to do with an address request that carries no MAC address
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmptyMacPolicy {
    /// Reserve anyway; the directory records the all-zero MAC
    #[default]
    Substitute,
    /// Refuse the request
    Reject,
}

/// Daemon configuration, as read from YAML and overridden from the command line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory holding `<driver_name>.sock`
    pub socket_dir: PathBuf,
    pub driver_name: String,
    /// View used when a request names none
    pub network_view: String,
    /// Comma-separated CIDR list subnets are carved from, in priority order
    pub network_container: String,
    /// Prefix length of carved subnets when a request names none
    pub prefix_length: u8,
    pub empty_mac: EmptyMacPolicy,
    /// Resolve view, subnet and gateway on Allocate (false: reserve directly in the configured subnet)
    pub check_network: bool,
    /// Read/write timeout applied to every client connection
    #[serde(with = "humantime_serde")]
    pub rpc_timeout: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_dir: PathBuf::from(DEFAULT_SOCKET_DIR),
            driver_name: DEFAULT_DRIVER_NAME.to_string(),
            network_view: DEFAULT_NETWORK_VIEW.to_string(),
            network_container: DEFAULT_NETWORK_CONTAINER.to_string(),
            prefix_length: DEFAULT_PREFIX_LENGTH,
            empty_mac: EmptyMacPolicy::default(),
            check_network: true,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            log_level: None,
        }
    }
}

impl DaemonConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.socket_dir.as_os_str().is_empty() {
            return Err(ValidationError::InvalidDriver("socket_dir cannot be empty".to_string()));
        }
        if self.driver_name.is_empty() || self.driver_name.contains('/') {
            return Err(ValidationError::InvalidDriver(format!(
                "driver_name '{}' must be a non-empty file name",
                self.driver_name
            )));
        }
        if self.network_view.is_empty() {
            return Err(ValidationError::InvalidAllocation(
                "network_view cannot be empty".to_string(),
            ));
        }
        if !(1..=32).contains(&self.prefix_length) {
            return Err(ValidationError::InvalidAllocation(format!(
                "prefix_length must be between 1 and 32, got {}",
                self.prefix_length
            )));
        }
        if self.rpc_timeout.is_zero() {
            return Err(ValidationError::InvalidDriver("rpc_timeout cannot be zero".to_string()));
        }

        let pool = self.container_pool()?;
        if pool.is_empty() {
            warn!("No network containers configured; subnets can only be requested by explicit CIDR");
        }
        for status in pool.status() {
            if status.cidr.prefix_len() > self.prefix_length {
                warn!(
                    "Network container {} is smaller than the default /{} and only serves longer prefixes",
                    status.cidr, self.prefix_length
                );
            }
        }

        Ok(())
    }

    /// Build the container pool from `network_container`
    pub fn container_pool(&self) -> Result<ContainerPool, PoolError> {
        ContainerPool::parse(&self.network_container)
    }
}

/// Configuration validation errors
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Invalid driver configuration: {0}")]
    InvalidDriver(String),
    #[error("Invalid allocation configuration: {0}")]
    InvalidAllocation(String),
    #[error(transparent)]
    InvalidPool(#[from] PoolError),
}
