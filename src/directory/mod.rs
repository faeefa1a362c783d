//! Address directory boundary.
//!
//! The directory is the remote authority that durably stores network views,
//! network containers, networks and fixed addresses. The allocation engine
//! only ever talks to it through [`AddressDirectory`], so the remote client
//! and the in-memory implementation in [`memory`] are interchangeable.
//!
//! Every lookup returns `Ok(None)` when the object does not exist. An `Err`
//! always means the call itself failed (directory unreachable, malformed
//! response, request refused by the directory), never "not found".

pub mod memory;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

pub use memory::{DirectoryCalls, InMemoryDirectory};

/// MAC recorded by the directory when a reservation is made without one
pub const ZERO_MAC: &str = "00:00:00:00:00:00";

/// Whether `mac` carries no identity: empty, or the [`ZERO_MAC`] placeholder
pub fn is_unset_mac(mac: &str) -> bool {
    mac.is_empty() || mac.eq_ignore_ascii_case(ZERO_MAC)
}

/// A named partition of address space
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkView {
    pub reference: String,
    pub name: String,
}

/// A coarse address block from which networks are carved
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkContainer {
    pub reference: String,
    pub network_view: String,
    pub cidr: Ipv4Net,
}

/// A subnet, optionally tagged with the logical network name that owns it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    pub reference: String,
    pub network_view: String,
    pub cidr: Ipv4Net,
    pub name: Option<String>,
}

impl Network {
    /// Whether this network is tagged with exactly `name`
    pub fn is_named(&self, name: &str) -> bool {
        self.name.as_deref() == Some(name)
    }
}

/// An IP-to-MAC binding inside a network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedAddress {
    pub reference: String,
    pub network_view: String,
    pub cidr: Ipv4Net,
    pub ip: Ipv4Addr,
    pub mac: String,
    pub name: String,
    pub vm_id: String,
}

/// Errors returned by an address directory
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DirectoryError {
    #[error("directory unreachable: {0}")]
    Transport(String),

    #[error("directory rejected request: {0}")]
    Rejected(String),

    #[error("directory object not found: {0}")]
    NotFound(String),
}

/// Operations the allocation engine needs from the remote directory.
///
/// Implementations must be safe to share between the daemon's connection
/// threads; they are held behind an `Arc` by the engine.
pub trait AddressDirectory: Send + Sync {
    fn get_network_view(&self, name: &str) -> Result<Option<NetworkView>, DirectoryError>;

    fn create_network_view(&self, name: &str) -> Result<NetworkView, DirectoryError>;

    fn get_network_container(
        &self,
        view: &str,
        cidr: Ipv4Net,
    ) -> Result<Option<NetworkContainer>, DirectoryError>;

    fn create_network_container(
        &self,
        view: &str,
        cidr: Ipv4Net,
    ) -> Result<NetworkContainer, DirectoryError>;

    /// Look up a network by its exact CIDR
    fn get_network(&self, view: &str, cidr: Ipv4Net) -> Result<Option<Network>, DirectoryError>;

    /// Look up a network by the logical name it is tagged with
    fn get_network_by_name(&self, view: &str, name: &str) -> Result<Option<Network>, DirectoryError>;

    fn create_network(&self, view: &str, cidr: Ipv4Net, name: &str) -> Result<Network, DirectoryError>;

    /// Carve the next free `/prefix_len` out of a container.
    ///
    /// `Ok(None)` means the container has no room left for that prefix length.
    fn allocate_network(
        &self,
        view: &str,
        container: Ipv4Net,
        prefix_len: u8,
        name: &str,
    ) -> Result<Option<Network>, DirectoryError>;

    /// Find a reservation. An unset `mac` matches any MAC; a real one never
    /// matches a reservation stored with [`ZERO_MAC`].
    fn get_fixed_address(
        &self,
        view: &str,
        cidr: Ipv4Net,
        ip: Option<Ipv4Addr>,
        mac: &str,
    ) -> Result<Option<FixedAddress>, DirectoryError>;

    /// Reserve `ip`, or the next free address in `cidr` when `ip` is `None`.
    /// An empty `mac` is stored as [`ZERO_MAC`].
    fn allocate_ip(
        &self,
        view: &str,
        cidr: Ipv4Net,
        ip: Option<Ipv4Addr>,
        mac: &str,
        name: &str,
        vm_id: &str,
    ) -> Result<FixedAddress, DirectoryError>;

    fn update_fixed_address(
        &self,
        reference: &str,
        mac: &str,
        name: &str,
        vm_id: &str,
    ) -> Result<FixedAddress, DirectoryError>;

    /// Delete the reservation matching `(view, ip, mac)`, returning its reference.
    ///
    /// Reservations stored without a MAC are matched by `vm_id` instead, and
    /// so is every reservation when `mac` is unset. With no `ip`, no usable
    /// `mac` and no `vm_id` nothing matches.
    fn release_ip(
        &self,
        view: &str,
        ip: Option<Ipv4Addr>,
        mac: &str,
        vm_id: &str,
    ) -> Result<Option<String>, DirectoryError>;
}
