//! # ipamd - IP address management for container networks
//!
//! This library provides the allocation engine, daemon and CNI plugin client
//! of a container IPAM backend.
//!
//! ## Overview
//!
//! A long-lived daemon owns a pool of address-space containers (large CIDR
//! blocks). Container runtimes invoke a short-lived plugin for every network
//! attach and detach; the plugin resolves the interface MAC, calls the daemon
//! over a Unix socket and prints a CNI result. The daemon resolves the
//! network view, reuses or carves the subnet for the named network, reserves
//! the gateway and a fixed address, and releases reservations on detach.
//!
//! ## Key Features
//!
//! - **Pool carving**: first-fit search across ordered containers, two rounds,
//!   exhaustion tracking with a reset between rounds
//! - **Named subnets**: a network name maps to one subnet per view, reused
//!   across containers
//! - **Gateways**: partially written gateways (`0.0.0.1`) are completed from
//!   the subnet and reserved once
//! - **Serialised state**: pool mutation and every check-then-create runs
//!   under the engine's lock
//! - **Tolerant release**: releasing an unknown address is not an error
//!
//! ## Architecture
//!
//! The library is organized into several modules:
//!
//! - `config`: Daemon configuration structures, defaults and validation
//! - `config_loader`: YAML loading, command-line and environment overrides
//! - `directory`: The address directory boundary and its in-memory implementation
//! - `ip`: Container pool and allocation engine
//! - `netconf`: CNI network configuration, arguments and result types
//! - `rpc`: Line-delimited JSON RPC over Unix sockets
//! - `daemon`: Allocate/Release handlers, socket lifecycle and accept loop
//! - `plugin`: The CNI plugin commands and namespace MAC discovery
//! - `utils`: IP and MAC helpers
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use ipamd::config_loader;
//! use ipamd::daemon::{serve, DriverSocket, IpamDaemon};
//! use ipamd::directory::InMemoryDirectory;
//! use ipamd::ip::Allocator;
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! let config = config_loader::load_config(Path::new("ipamd.yaml"))?;
//!
//! let allocator = Allocator::new(
//!     Arc::new(InMemoryDirectory::new()),
//!     config.container_pool()?,
//!     config.network_view.clone(),
//!     config.prefix_length,
//! );
//! let daemon = Arc::new(IpamDaemon::new(allocator, config.check_network));
//!
//! // Serves <socket_dir>/<driver_name>.sock until the process is killed
//! serve(daemon, DriverSocket::new(&config.socket_dir, &config.driver_name), config.rpc_timeout)?;
//! # Ok::<(), color_eyre::eyre::Error>(())
//! ```
//!
//! ## Configuration Format
//!
//! The daemon reads YAML; every field is optional:
//!
//! ```yaml
//! socket_dir: /run/cni
//! driver_name: infoblox
//! network_view: default
//! network_container: "172.18.0.0/16,172.19.0.0/16"
//! prefix_length: 24
//! empty_mac: substitute   # or reject
//! check_network: true
//! rpc_timeout: 60s
//! ```
//!
//! The plugin finds the daemon from its CNI network configuration:
//!
//! ```json
//! {
//!   "cniVersion": "0.3.1",
//!   "name": "ipam-test",
//!   "type": "macvlan",
//!   "ipam": {
//!     "type": "infoblox",
//!     "socket-dir": "/run/cni",
//!     "network-view": "cni_view",
//!     "subnet": "10.0.0.0/24",
//!     "gateway": "10.0.0.1"
//!   }
//! }
//! ```
//!
//! ## Error Handling
//!
//! Library modules return typed `thiserror` errors (`IpamError`,
//! `DirectoryError`, `DaemonError`, `PluginError`, ...). The binaries report
//! through `color_eyre`, except that the plugin prints failures as CNI error
//! objects on stdout.

pub mod config;
pub mod config_loader;
pub mod daemon;
pub mod directory;
pub mod ip;
pub mod netconf;
pub mod plugin;
pub mod rpc;
pub mod utils;
