//! Attach/Detach client invoked by the container runtime.
//!
//! One invocation handles one command: the runtime identifies the container
//! through `CNI_*` environment variables and passes the network configuration
//! on stdin. ADD and DEL resolve the interface MAC, dial the daemon socket
//! named by the configuration and make exactly one call. VERSION is answered
//! locally.

pub mod netns;

use crate::daemon::DriverSocket;
use crate::netconf::{
    CmdArgs, CniError, CniResult, NetConfError, NetConfig, VersionInfo, DEFAULT_CNI_VERSION,
};
use crate::rpc::{RpcClient, RpcError, METHOD_ALLOCATE, METHOD_RELEASE};
use log::{debug, warn};
use netns::{absolute_netns, interface_mac};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Call timeout when the configuration sets none
pub const DEFAULT_RPC_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("Required environment variable {0} is not set")]
    MissingEnv(&'static str),

    #[error("Unknown CNI_COMMAND '{0}'")]
    UnknownCommand(String),

    #[error(transparent)]
    NetConf(#[from] NetConfError),

    #[error("Error calling IPAM daemon: {0}")]
    Rpc(#[from] RpcError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to encode result: {0}")]
    Encode(#[from] serde_json::Error),
}

impl PluginError {
    /// Error code reported to the runtime
    pub fn code(&self) -> u32 {
        match self {
            PluginError::MissingEnv(_) | PluginError::UnknownCommand(_) => 4,
            PluginError::Io(_) => 5,
            PluginError::NetConf(NetConfError::Parse(_)) => 6,
            PluginError::NetConf(NetConfError::InvalidIpamType(_)) => 7,
            PluginError::Rpc(RpcError::Connect { .. }) => 11,
            _ => 100,
        }
    }

    /// Convert into the error object printed for the runtime
    pub fn to_cni_error(&self, cni_version: &str) -> CniError {
        CniError {
            cni_version: cni_version.to_string(),
            code: self.code(),
            msg: self.to_string(),
            details: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Add,
    Del,
    Version,
}

impl Command {
    pub fn parse(s: &str) -> Result<Self, PluginError> {
        match s {
            "ADD" => Ok(Command::Add),
            "DEL" => Ok(Command::Del),
            "VERSION" => Ok(Command::Version),
            other => Err(PluginError::UnknownCommand(other.to_string())),
        }
    }
}

/// The runtime's `CNI_*` environment
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PluginEnv {
    pub command: String,
    pub container_id: String,
    pub netns: String,
    pub if_name: String,
    pub args: String,
    pub path: String,
}

impl PluginEnv {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            command: lookup("CNI_COMMAND").unwrap_or_default(),
            container_id: lookup("CNI_CONTAINERID").unwrap_or_default(),
            netns: lookup("CNI_NETNS").unwrap_or_default(),
            if_name: lookup("CNI_IFNAME").unwrap_or_default(),
            args: lookup("CNI_ARGS").unwrap_or_default(),
            path: lookup("CNI_PATH").unwrap_or_default(),
        }
    }

    fn require(&self) -> Result<(), PluginError> {
        if self.container_id.is_empty() {
            return Err(PluginError::MissingEnv("CNI_CONTAINERID"));
        }
        if self.if_name.is_empty() {
            return Err(PluginError::MissingEnv("CNI_IFNAME"));
        }
        Ok(())
    }
}

/// Execute the command named in `env` and return what to print on stdout
pub fn run(env: &PluginEnv, stdin: &str) -> Result<String, PluginError> {
    if env.command.is_empty() {
        return Err(PluginError::MissingEnv("CNI_COMMAND"));
    }
    match Command::parse(&env.command)? {
        Command::Version => Ok(serde_json::to_string(&cmd_version())?),
        Command::Add => Ok(serde_json::to_string(&cmd_add(env, stdin)?)?),
        Command::Del => {
            cmd_del(env, stdin)?;
            Ok(String::new())
        }
    }
}

/// Version to stamp on an error, taken from the configuration when it parses
pub fn error_version(stdin: &str) -> String {
    NetConfig::parse(stdin.as_bytes())
        .map(|conf| conf.result_version().to_string())
        .unwrap_or_else(|_| DEFAULT_CNI_VERSION.to_string())
}

pub fn cmd_add(env: &PluginEnv, stdin: &str) -> Result<CniResult, PluginError> {
    let (conf, args) = prepare(env, stdin)?;
    let mut client = dial(&conf)?;
    Ok(client.call(METHOD_ALLOCATE, &args)?)
}

pub fn cmd_del(env: &PluginEnv, stdin: &str) -> Result<(), PluginError> {
    let (conf, args) = prepare(env, stdin)?;
    let mut client = dial(&conf)?;
    client.call::<_, ()>(METHOD_RELEASE, &args)?;
    Ok(())
}

pub fn cmd_version() -> VersionInfo {
    VersionInfo::default()
}

/// Daemon socket named by the configuration: `<ipam.socket-dir>/<ipam.type>.sock`
pub fn socket_path(conf: &NetConfig) -> PathBuf {
    let dir = conf.ipam.socket_dir.clone().unwrap_or_default();
    DriverSocket::new(dir, &conf.ipam.ipam_type)
        .socket_file()
        .to_path_buf()
}

pub fn rpc_timeout(conf: &NetConfig) -> Duration {
    Duration::from_secs(
        conf.ipam
            .rpc_timeout_secs
            .filter(|&secs| secs > 0)
            .unwrap_or(DEFAULT_RPC_TIMEOUT_SECS),
    )
}

fn dial(conf: &NetConfig) -> Result<RpcClient, PluginError> {
    let path = socket_path(conf);
    debug!("Dialing IPAM daemon at '{}'", path.display());
    Ok(RpcClient::dial(&path, rpc_timeout(conf))?)
}

/// Parse the configuration and build the call arguments, MAC included
fn prepare(env: &PluginEnv, stdin: &str) -> Result<(NetConfig, CmdArgs), PluginError> {
    env.require()?;
    let conf = NetConfig::parse(stdin.as_bytes())?;

    // The daemon runs in a different working directory
    let netns = absolute_netns(&env.netns)?;
    let mut args = CmdArgs {
        container_id: env.container_id.clone(),
        netns: netns
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default(),
        if_name: env.if_name.clone(),
        args: env.args.clone(),
        path: env.path.clone(),
        stdin_data: stdin.to_string(),
        if_mac: String::new(),
    };
    args.if_mac = resolve_mac(&args, netns.as_deref());
    Ok((conf, args))
}

/// MAC from `CNI_ARGS` if given, otherwise from the interface itself.
///
/// A failed lookup is not fatal: DEL in particular often runs after the
/// namespace is gone. The daemon then sees an empty MAC.
fn resolve_mac(args: &CmdArgs, netns: Option<&Path>) -> String {
    if let Some(mac) = args.mac_override() {
        debug!("Using MAC {} from CNI_ARGS", mac);
        return mac;
    }
    match interface_mac(netns, &args.if_name) {
        Ok(mac) => mac,
        Err(e) => {
            warn!("Could not read MAC of '{}': {}", args.if_name, e);
            String::new()
        }
    }
}
