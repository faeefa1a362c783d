//! In-process address directory.
//!
//! Keeps every view, container, network and fixed address in memory behind a
//! single mutex. The daemon uses it as its standalone backend, and the test
//! suites use it as the directory double: it counts every call and can be
//! switched to "unreachable" to simulate transport failures.

use super::{
    is_unset_mac, AddressDirectory, DirectoryError, FixedAddress, Network, NetworkContainer,
    NetworkView, ZERO_MAC,
};
use ipnet::Ipv4Net;
use log::debug;
use std::net::Ipv4Addr;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Number of times each directory operation has been invoked
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectoryCalls {
    pub get_network_view: usize,
    pub create_network_view: usize,
    pub get_network_container: usize,
    pub create_network_container: usize,
    pub get_network: usize,
    pub get_network_by_name: usize,
    pub create_network: usize,
    pub allocate_network: usize,
    pub get_fixed_address: usize,
    pub allocate_ip: usize,
    pub update_fixed_address: usize,
    pub release_ip: usize,
}

impl DirectoryCalls {
    /// Calls that touch the container pool (container resolution and carving)
    pub fn pool_calls(&self) -> usize {
        self.get_network_container + self.create_network_container + self.allocate_network
    }
}

#[derive(Debug, Default)]
struct State {
    next_id: u64,
    unreachable: bool,
    calls: DirectoryCalls,
    views: Vec<NetworkView>,
    containers: Vec<NetworkContainer>,
    networks: Vec<Network>,
    fixed_addresses: Vec<FixedAddress>,
}

impl State {
    fn reachable(&self) -> Result<(), DirectoryError> {
        if self.unreachable {
            Err(DirectoryError::Transport("connection refused".to_string()))
        } else {
            Ok(())
        }
    }

    fn reference(&mut self, kind: &str, key: impl std::fmt::Display, view: &str) -> String {
        self.next_id += 1;
        format!("{}/{:08x}:{}/{}", kind, self.next_id, key, view)
    }

    fn overlaps_existing(&self, view: &str, candidate: &Ipv4Net) -> bool {
        self.networks
            .iter()
            .filter(|n| n.network_view == view)
            .any(|n| n.cidr.contains(candidate) || candidate.contains(&n.cidr))
    }

    fn ip_taken(&self, view: &str, ip: Ipv4Addr) -> bool {
        self.fixed_addresses
            .iter()
            .any(|f| f.network_view == view && f.ip == ip)
    }
}

/// A real MAC only ever matches a reservation holding that same MAC
fn same_mac(stored: &str, wanted: &str) -> bool {
    !is_unset_mac(stored) && stored.eq_ignore_ascii_case(wanted)
}

/// Address directory held entirely in process memory
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    state: Mutex<State>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every subsequent call fail with a transport error (or recover)
    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    /// Snapshot of the call counters
    pub fn calls(&self) -> DirectoryCalls {
        self.lock().calls.clone()
    }

    pub fn networks(&self) -> Vec<Network> {
        self.lock().networks.clone()
    }

    pub fn fixed_addresses(&self) -> Vec<FixedAddress> {
        self.lock().fixed_addresses.clone()
    }
}

impl AddressDirectory for InMemoryDirectory {
    fn get_network_view(&self, name: &str) -> Result<Option<NetworkView>, DirectoryError> {
        let mut state = self.lock();
        state.calls.get_network_view += 1;
        state.reachable()?;
        Ok(state.views.iter().find(|v| v.name == name).cloned())
    }

    fn create_network_view(&self, name: &str) -> Result<NetworkView, DirectoryError> {
        let mut state = self.lock();
        state.calls.create_network_view += 1;
        state.reachable()?;
        if name.is_empty() {
            return Err(DirectoryError::Rejected("network view name is empty".to_string()));
        }
        if state.views.iter().any(|v| v.name == name) {
            return Err(DirectoryError::Rejected(format!("network view '{}' already exists", name)));
        }
        let view = NetworkView {
            reference: state.reference("networkview", name, name),
            name: name.to_string(),
        };
        state.views.push(view.clone());
        Ok(view)
    }

    fn get_network_container(
        &self,
        view: &str,
        cidr: Ipv4Net,
    ) -> Result<Option<NetworkContainer>, DirectoryError> {
        let mut state = self.lock();
        state.calls.get_network_container += 1;
        state.reachable()?;
        let cidr = cidr.trunc();
        Ok(state
            .containers
            .iter()
            .find(|c| c.network_view == view && c.cidr == cidr)
            .cloned())
    }

    fn create_network_container(
        &self,
        view: &str,
        cidr: Ipv4Net,
    ) -> Result<NetworkContainer, DirectoryError> {
        let mut state = self.lock();
        state.calls.create_network_container += 1;
        state.reachable()?;
        let cidr = cidr.trunc();
        if state
            .containers
            .iter()
            .any(|c| c.network_view == view && c.cidr == cidr)
        {
            return Err(DirectoryError::Rejected(format!(
                "network container {} already exists in view '{}'",
                cidr, view
            )));
        }
        let container = NetworkContainer {
            reference: state.reference("networkcontainer", cidr, view),
            network_view: view.to_string(),
            cidr,
        };
        state.containers.push(container.clone());
        Ok(container)
    }

    fn get_network(&self, view: &str, cidr: Ipv4Net) -> Result<Option<Network>, DirectoryError> {
        let mut state = self.lock();
        state.calls.get_network += 1;
        state.reachable()?;
        let cidr = cidr.trunc();
        Ok(state
            .networks
            .iter()
            .find(|n| n.network_view == view && n.cidr == cidr)
            .cloned())
    }

    fn get_network_by_name(&self, view: &str, name: &str) -> Result<Option<Network>, DirectoryError> {
        let mut state = self.lock();
        state.calls.get_network_by_name += 1;
        state.reachable()?;
        Ok(state
            .networks
            .iter()
            .find(|n| n.network_view == view && n.is_named(name))
            .cloned())
    }

    fn create_network(&self, view: &str, cidr: Ipv4Net, name: &str) -> Result<Network, DirectoryError> {
        let mut state = self.lock();
        state.calls.create_network += 1;
        state.reachable()?;
        let cidr = cidr.trunc();
        if state.overlaps_existing(view, &cidr) {
            return Err(DirectoryError::Rejected(format!(
                "network {} overlaps an existing network in view '{}'",
                cidr, view
            )));
        }
        let network = Network {
            reference: state.reference("network", cidr, view),
            network_view: view.to_string(),
            cidr,
            name: (!name.is_empty()).then(|| name.to_string()),
        };
        state.networks.push(network.clone());
        Ok(network)
    }

    fn allocate_network(
        &self,
        view: &str,
        container: Ipv4Net,
        prefix_len: u8,
        name: &str,
    ) -> Result<Option<Network>, DirectoryError> {
        let mut state = self.lock();
        state.calls.allocate_network += 1;
        state.reachable()?;
        let container = container.trunc();
        if !state
            .containers
            .iter()
            .any(|c| c.network_view == view && c.cidr == container)
        {
            return Err(DirectoryError::Rejected(format!(
                "network container {} does not exist in view '{}'",
                container, view
            )));
        }
        if prefix_len < container.prefix_len() {
            return Ok(None);
        }
        let subnets = container
            .subnets(prefix_len)
            .map_err(|_| DirectoryError::Rejected(format!("invalid prefix length /{}", prefix_len)))?;
        let Some(cidr) = subnets.into_iter().find(|s| !state.overlaps_existing(view, s)) else {
            debug!("Container {} in view '{}' has no free /{}", container, view, prefix_len);
            return Ok(None);
        };
        let network = Network {
            reference: state.reference("network", cidr, view),
            network_view: view.to_string(),
            cidr,
            name: (!name.is_empty()).then(|| name.to_string()),
        };
        state.networks.push(network.clone());
        Ok(Some(network))
    }

    fn get_fixed_address(
        &self,
        view: &str,
        cidr: Ipv4Net,
        ip: Option<Ipv4Addr>,
        mac: &str,
    ) -> Result<Option<FixedAddress>, DirectoryError> {
        let mut state = self.lock();
        state.calls.get_fixed_address += 1;
        state.reachable()?;
        let cidr = cidr.trunc();
        Ok(state
            .fixed_addresses
            .iter()
            .find(|f| {
                f.network_view == view
                    && f.cidr == cidr
                    && ip.map_or(true, |ip| f.ip == ip)
                    && (is_unset_mac(mac) || same_mac(&f.mac, mac))
            })
            .cloned())
    }

    fn allocate_ip(
        &self,
        view: &str,
        cidr: Ipv4Net,
        ip: Option<Ipv4Addr>,
        mac: &str,
        name: &str,
        vm_id: &str,
    ) -> Result<FixedAddress, DirectoryError> {
        let mut state = self.lock();
        state.calls.allocate_ip += 1;
        state.reachable()?;
        let cidr = cidr.trunc();
        if !state
            .networks
            .iter()
            .any(|n| n.network_view == view && n.cidr == cidr)
        {
            return Err(DirectoryError::Rejected(format!(
                "network {} does not exist in view '{}'",
                cidr, view
            )));
        }

        let ip = match ip {
            Some(ip) => {
                if !cidr.contains(&ip) {
                    return Err(DirectoryError::Rejected(format!("{} is not inside {}", ip, cidr)));
                }
                if state.ip_taken(view, ip) {
                    return Err(DirectoryError::Rejected(format!("{} is already reserved", ip)));
                }
                ip
            }
            None => cidr
                .hosts()
                .find(|candidate| !state.ip_taken(view, *candidate))
                .ok_or_else(|| DirectoryError::Rejected(format!("no free address in {}", cidr)))?,
        };

        let mac = if mac.is_empty() { ZERO_MAC } else { mac };
        let fixed = FixedAddress {
            reference: state.reference("fixedaddress", ip, view),
            network_view: view.to_string(),
            cidr,
            ip,
            mac: mac.to_string(),
            name: name.to_string(),
            vm_id: vm_id.to_string(),
        };
        state.fixed_addresses.push(fixed.clone());
        Ok(fixed)
    }

    fn update_fixed_address(
        &self,
        reference: &str,
        mac: &str,
        name: &str,
        vm_id: &str,
    ) -> Result<FixedAddress, DirectoryError> {
        let mut state = self.lock();
        state.calls.update_fixed_address += 1;
        state.reachable()?;
        let fixed = state
            .fixed_addresses
            .iter_mut()
            .find(|f| f.reference == reference)
            .ok_or_else(|| DirectoryError::NotFound(reference.to_string()))?;
        if !mac.is_empty() {
            fixed.mac = mac.to_string();
        }
        if !name.is_empty() {
            fixed.name = name.to_string();
        }
        if !vm_id.is_empty() {
            fixed.vm_id = vm_id.to_string();
        }
        Ok(fixed.clone())
    }

    fn release_ip(
        &self,
        view: &str,
        ip: Option<Ipv4Addr>,
        mac: &str,
        vm_id: &str,
    ) -> Result<Option<String>, DirectoryError> {
        let mut state = self.lock();
        state.calls.release_ip += 1;
        state.reachable()?;
        if ip.is_none() && is_unset_mac(mac) && vm_id.is_empty() {
            return Ok(None);
        }
        let by_vm_id = |f: &FixedAddress| !vm_id.is_empty() && f.vm_id == vm_id;
        let identifies = |f: &FixedAddress| {
            if is_unset_mac(mac) {
                vm_id.is_empty() || by_vm_id(f)
            } else {
                same_mac(&f.mac, mac) || (is_unset_mac(&f.mac) && by_vm_id(f))
            }
        };
        let position = state.fixed_addresses.iter().position(|f| {
            f.network_view == view && ip.map_or(true, |ip| f.ip == ip) && identifies(f)
        });
        Ok(position.map(|i| state.fixed_addresses.remove(i).reference))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    #[test]
    fn test_allocate_network_carves_first_free_block() {
        let dir = InMemoryDirectory::new();
        dir.create_network_container("v", net("10.0.0.0/24")).unwrap();

        let first = dir.allocate_network("v", net("10.0.0.0/24"), 26, "a").unwrap().unwrap();
        let second = dir.allocate_network("v", net("10.0.0.0/24"), 26, "b").unwrap().unwrap();

        assert_eq!(first.cidr, net("10.0.0.0/26"));
        assert_eq!(second.cidr, net("10.0.0.64/26"));
        assert!(second.is_named("b"));
    }

    #[test]
    fn test_allocate_network_reports_full_container_as_none() {
        let dir = InMemoryDirectory::new();
        dir.create_network_container("v", net("10.0.0.0/25")).unwrap();
        dir.create_network("v", net("10.0.0.0/25"), "taken").unwrap();

        assert_eq!(dir.allocate_network("v", net("10.0.0.0/25"), 26, "x").unwrap(), None);
        // A prefix wider than the container can never fit
        assert_eq!(dir.allocate_network("v", net("10.0.0.0/25"), 24, "x").unwrap(), None);
    }

    #[test]
    fn test_views_partition_address_space() {
        let dir = InMemoryDirectory::new();
        dir.create_network("red", net("10.1.0.0/24"), "n").unwrap();
        dir.create_network("blue", net("10.1.0.0/24"), "n").unwrap();
        assert!(dir.create_network("red", net("10.1.0.0/25"), "m").is_err());
    }

    #[test]
    fn test_allocate_ip_skips_reserved_addresses() {
        let dir = InMemoryDirectory::new();
        dir.create_network("v", net("10.0.0.0/29"), "n").unwrap();
        let gw = dir
            .allocate_ip("v", net("10.0.0.0/29"), Some("10.0.0.1".parse().unwrap()), "", "gateway", "")
            .unwrap();
        assert_eq!(gw.mac, ZERO_MAC);

        let next = dir.allocate_ip("v", net("10.0.0.0/29"), None, "aa:bb:cc:dd:ee:ff", "c", "id").unwrap();
        assert_eq!(next.ip, "10.0.0.2".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn test_release_requires_some_identity() {
        let dir = InMemoryDirectory::new();
        dir.create_network("v", net("10.0.0.0/29"), "n").unwrap();
        let fixed = dir.allocate_ip("v", net("10.0.0.0/29"), None, "aa:bb:cc:dd:ee:ff", "c", "id").unwrap();

        assert_eq!(dir.release_ip("v", None, "", "").unwrap(), None);
        assert_eq!(dir.release_ip("v", None, ZERO_MAC, "").unwrap(), None);
        assert_eq!(dir.release_ip("v", None, "AA:BB:CC:DD:EE:FF", "").unwrap(), Some(fixed.reference));
        assert_eq!(dir.release_ip("v", None, "aa:bb:cc:dd:ee:ff", "").unwrap(), None);
    }

    #[test]
    fn test_placeholder_reservations_need_more_than_a_mac() {
        let dir = InMemoryDirectory::new();
        dir.create_network("v", net("10.0.0.0/29"), "n").unwrap();
        dir.allocate_ip("v", net("10.0.0.0/29"), Some("10.0.0.1".parse().unwrap()), "", "gateway", "")
            .unwrap();

        assert_eq!(dir.get_fixed_address("v", net("10.0.0.0/29"), None, "00:00:00:00:00:01").unwrap(), None);
        assert_eq!(dir.release_ip("v", None, ZERO_MAC, "").unwrap(), None);
        assert_eq!(dir.release_ip("v", None, ZERO_MAC, "c1").unwrap(), None);
        assert_eq!(dir.fixed_addresses().len(), 1);
    }

    #[test]
    fn test_release_by_vm_id_when_mac_is_unset() {
        let dir = InMemoryDirectory::new();
        dir.create_network("v", net("10.0.0.0/29"), "n").unwrap();
        dir.allocate_ip("v", net("10.0.0.0/29"), Some("10.0.0.1".parse().unwrap()), "", "gateway", "")
            .unwrap();
        let blank = dir.allocate_ip("v", net("10.0.0.0/29"), None, "", "c1", "c1").unwrap();
        let real = dir.allocate_ip("v", net("10.0.0.0/29"), None, "aa:bb:cc:dd:ee:ff", "c2", "c2").unwrap();

        // A real MAC still finds a MAC-less reservation of the same container
        assert_eq!(dir.release_ip("v", None, "11:22:33:44:55:66", "c1").unwrap(), Some(blank.reference));
        // An unset MAC falls back to the container id for any reservation
        assert_eq!(dir.release_ip("v", None, "", "c2").unwrap(), Some(real.reference));
        assert_eq!(dir.release_ip("v", None, "", "c2").unwrap(), None);

        let remaining = dir.fixed_addresses();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].name, "gateway");
    }

    #[test]
    fn test_unreachable_directory_counts_and_fails() {
        let dir = InMemoryDirectory::new();
        dir.set_unreachable(true);

        let err = dir.get_network_view("default").unwrap_err();
        assert!(matches!(err, DirectoryError::Transport(_)));
        assert_eq!(dir.calls().get_network_view, 1);
    }
}
