//! CNI network configuration, runtime arguments and result types.
//!
//! The runtime hands the plugin a JSON network configuration on stdin and
//! the container identity through `CNI_*` environment variables. The plugin
//! forwards both to the daemon as [`CmdArgs`]; the daemon parses the
//! configuration again on its side, so both ends agree on one definition.

use crate::ip::allocator::AllocationRequest;
use crate::utils::ip_utils::parse_mac;
use ipnet::{IpNet, Ipv4Net};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

/// CNI versions this plugin can produce results for
pub const SUPPORTED_VERSIONS: &[&str] = &["0.3.0", "0.3.1", "0.4.0"];

/// Version reported when the configuration names none
pub const DEFAULT_CNI_VERSION: &str = "0.4.0";

/// Errors raised while reading a network configuration
#[derive(Debug, thiserror::Error)]
pub enum NetConfError {
    #[error("error parsing netconf: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("netconf has no usable ipam type: '{0}'")]
    InvalidIpamType(String),
}

/// A route handed through to the runtime result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub dst: IpNet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gw: Option<IpAddr>,
}

/// The `ipam` section of a network configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct IpamConfig {
    /// Driver name; the daemon socket is `<socket-dir>/<type>.sock`
    #[serde(rename = "type")]
    pub ipam_type: String,
    #[serde(default)]
    pub socket_dir: Option<PathBuf>,
    #[serde(default)]
    pub network_view: String,
    #[serde(default)]
    pub prefix_length: Option<u8>,
    #[serde(default)]
    pub subnet: Option<Ipv4Net>,
    #[serde(default)]
    pub gateway: Option<IpAddr>,
    #[serde(default)]
    pub routes: Vec<Route>,
    /// Upper bound on the plugin's wait for the daemon
    #[serde(default)]
    pub rpc_timeout_secs: Option<u64>,
}

/// A CNI network configuration. Fields belonging to other plugins are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetConfig {
    #[serde(rename = "cniVersion", default)]
    pub cni_version: String,
    pub name: String,
    /// Main plugin type (`bridge`, `macvlan`, ...)
    #[serde(rename = "type", default)]
    pub plugin_type: String,
    pub ipam: IpamConfig,
}

impl NetConfig {
    pub fn parse(data: &[u8]) -> Result<Self, NetConfError> {
        let conf: NetConfig = serde_json::from_slice(data)?;
        let ipam_type = &conf.ipam.ipam_type;
        if ipam_type.is_empty() || ipam_type.contains('/') {
            return Err(NetConfError::InvalidIpamType(ipam_type.clone()));
        }
        Ok(conf)
    }

    /// CNI version to stamp on results
    pub fn result_version(&self) -> &str {
        if self.cni_version.is_empty() {
            DEFAULT_CNI_VERSION
        } else {
            &self.cni_version
        }
    }

    /// Whether the main plugin derives the interface MAC from the allocated IP
    pub fn is_bridge(&self) -> bool {
        self.plugin_type == "bridge"
    }

    /// Build the engine request for this network and container
    pub fn allocation_request(&self, args: &CmdArgs) -> AllocationRequest {
        AllocationRequest {
            name: self.name.clone(),
            network_view: self.ipam.network_view.clone(),
            explicit_subnet: self.ipam.subnet,
            desired_prefix_length: self.ipam.prefix_length,
            mac: args.if_mac.clone(),
            container_id: args.container_id.clone(),
        }
    }
}

/// Runtime arguments for one ADD/DEL, plus the MAC resolved by the plugin
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CmdArgs {
    pub container_id: String,
    pub netns: String,
    pub if_name: String,
    /// `CNI_ARGS`: `KEY=VALUE` pairs separated by `;`
    #[serde(default)]
    pub args: String,
    #[serde(default)]
    pub path: String,
    /// Raw network configuration read from the plugin's stdin
    pub stdin_data: String,
    #[serde(default)]
    pub if_mac: String,
}

impl CmdArgs {
    /// Value of `key` in `CNI_ARGS`
    pub fn arg(&self, key: &str) -> Option<&str> {
        self.args
            .split(';')
            .filter_map(|pair| pair.split_once('='))
            .find(|(k, _)| k.trim() == key)
            .map(|(_, v)| v.trim())
    }

    /// Pod name when running under Kubernetes, used as the reservation name
    pub fn container_name(&self) -> &str {
        self.arg("K8S_POD_NAME").unwrap_or("")
    }

    /// Caller-supplied MAC (`MAC=` in `CNI_ARGS`), normalised
    pub fn mac_override(&self) -> Option<String> {
        self.arg("MAC").and_then(parse_mac)
    }

    pub fn netconf(&self) -> Result<NetConfig, NetConfError> {
        NetConfig::parse(self.stdin_data.as_bytes())
    }
}

/// One assigned address in a CNI result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpConfig {
    pub version: String,
    /// Host address with the subnet's prefix length, e.g. `10.0.0.2/24`
    pub address: Ipv4Net,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<Ipv4Addr>,
}

/// The structured result printed for the runtime after a successful ADD
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CniResult {
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ips: Vec<IpConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<Route>,
}

impl CniResult {
    /// Result with no addresses, returned when allocation is refused
    pub fn empty(cni_version: &str) -> Self {
        Self {
            cni_version: cni_version.to_string(),
            ..Default::default()
        }
    }
}

/// Error object printed for the runtime when a command fails
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CniError {
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    pub code: u32,
    pub msg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Answer to `CNI_COMMAND=VERSION`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    #[serde(rename = "supportedVersions")]
    pub supported_versions: Vec<String>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            cni_version: DEFAULT_CNI_VERSION.to_string(),
            supported_versions: SUPPORTED_VERSIONS.iter().map(|v| v.to_string()).collect(),
        }
    }
}
