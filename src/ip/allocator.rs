//! Subnet and address allocation engine.
//!
//! This file contains the core allocation algorithms: resolving network
//! views, reusing or creating named subnets, carving new subnets out of the
//! configured container pool (first fit, at most two rounds), reserving fixed
//! addresses and gateways, and releasing reservations.
//!
//! All durable state lives in the [`AddressDirectory`]. The only state held
//! here is the container pool, which is guarded by a mutex that also
//! serialises every name/CIDR check-then-create sequence. View resolution
//! and address reservation each have a mutex of their own.

use super::pool::{ContainerPool, ContainerStatus};
use crate::config::EmptyMacPolicy;
use crate::directory::{
    is_unset_mac, AddressDirectory, DirectoryError, FixedAddress, Network, NetworkContainer,
    NetworkView, ZERO_MAC,
};
use crate::utils::ip_utils::{complete_gateway, to_ipv4};
use ipnet::Ipv4Net;
use log::{debug, error, info, warn};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Full passes over the container pool before giving up
pub const POOL_ROUNDS: usize = 2;

/// Name recorded on gateway reservations
pub const GATEWAY_NAME: &str = "gateway";

/// Errors surfaced by the allocation engine
#[derive(Debug, thiserror::Error)]
pub enum IpamError {
    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error("Cannot allocate network in address space: no container can supply a /{prefix_len} for '{name}'")]
    AddressSpaceExhausted { prefix_len: u8, name: String },

    #[error("Invalid prefix length /{0}")]
    InvalidPrefixLength(u8),

    #[error("Invalid gateway {gateway}: {reason}")]
    InvalidGateway { gateway: IpAddr, reason: String },

    #[error("Gateway {gateway} is outside subnet {subnet}")]
    GatewayOutsideSubnet { gateway: Ipv4Addr, subnet: Ipv4Net },

    #[error("No candidate subnet supplied for gateway {0}")]
    NoCandidateSubnet(IpAddr),

    #[error("Empty MAC address rejected for container '{0}'")]
    EmptyMac(String),
}

/// What a caller asks for when it needs a subnet (and later an address)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocationRequest {
    /// Logical network name the subnet is tagged with
    pub name: String,
    /// Empty means the daemon's default view
    pub network_view: String,
    pub explicit_subnet: Option<Ipv4Net>,
    /// `None` or `Some(0)` means the daemon's default prefix length
    pub desired_prefix_length: Option<u8>,
    pub mac: String,
    pub container_id: String,
}

/// The allocation engine
pub struct Allocator<D: AddressDirectory> {
    directory: Arc<D>,
    pool: Mutex<ContainerPool>,
    views: Mutex<()>,
    reservations: Mutex<()>,
    default_view: String,
    default_prefix_len: u8,
    empty_mac: EmptyMacPolicy,
}

impl<D: AddressDirectory> Allocator<D> {
    pub fn new(
        directory: Arc<D>,
        pool: ContainerPool,
        default_view: impl Into<String>,
        default_prefix_len: u8,
    ) -> Self {
        Self {
            directory,
            pool: Mutex::new(pool),
            views: Mutex::new(()),
            reservations: Mutex::new(()),
            default_view: default_view.into(),
            default_prefix_len,
            empty_mac: EmptyMacPolicy::default(),
        }
    }

    pub fn with_empty_mac_policy(mut self, policy: EmptyMacPolicy) -> Self {
        self.empty_mac = policy;
        self
    }

    pub fn directory(&self) -> &Arc<D> {
        &self.directory
    }

    pub fn default_view(&self) -> &str {
        &self.default_view
    }

    pub fn default_prefix_len(&self) -> u8 {
        self.default_prefix_len
    }

    /// Snapshot of every container's binding and exhaustion flag
    pub fn pool_status(&self) -> Vec<ContainerStatus> {
        self.lock_pool().status()
    }

    fn lock_pool(&self) -> MutexGuard<'_, ContainerPool> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_views(&self) -> MutexGuard<'_, ()> {
        self.views.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_reservations(&self) -> MutexGuard<'_, ()> {
        self.reservations.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn view_or_default<'a>(&'a self, view: &'a str) -> &'a str {
        if view.is_empty() {
            &self.default_view
        } else {
            view
        }
    }

    /// Resolve a network view by name, creating it when it does not exist.
    ///
    /// An empty name resolves the default view.
    pub fn request_network_view(&self, name: &str) -> Result<String, IpamError> {
        let name = self.view_or_default(name);
        let _guard = self.lock_views();
        let view = match self.directory.get_network_view(name)? {
            Some(view) => view,
            None => self.create_network_view(name)?,
        };
        debug!("RequestNetworkView: resolved '{}' ({})", view.name, view.reference);
        Ok(view.name)
    }

    /// Create a view, settling for the existing one if another client got there first
    fn create_network_view(&self, name: &str) -> Result<NetworkView, DirectoryError> {
        info!("RequestNetworkView: creating network view '{}'", name);
        match self.directory.create_network_view(name) {
            Err(DirectoryError::Rejected(reason)) => {
                debug!("RequestNetworkView: create of '{}' rejected ({}), looking it up again", name, reason);
                self.directory
                    .get_network_view(name)?
                    .ok_or(DirectoryError::Rejected(reason))
            }
            other => other,
        }
    }

    /// Resolve the subnet for a logical network.
    ///
    /// Returns `Ok(None)` when the request is refused because the CIDR or the
    /// name is already bound to something else; the caller must not proceed
    /// but nothing failed.
    pub fn request_network(
        &self,
        request: &AllocationRequest,
        view: &str,
    ) -> Result<Option<Ipv4Net>, IpamError> {
        let view = self.view_or_default(view);
        let mut pool = self.lock_pool();

        if let Some(subnet) = request.explicit_subnet {
            let network = self.request_specific_network(view, subnet.trunc(), &request.name)?;
            return Ok(network.map(|n| n.cidr));
        }

        if let Some(existing) = self.directory.get_network_by_name(view, &request.name)? {
            info!(
                "RequestNetwork: reusing {} for '{}' in view '{}'",
                existing.cidr, request.name, view
            );
            return Ok(Some(existing.cidr));
        }

        let prefix_len = request
            .desired_prefix_length
            .filter(|&p| p != 0)
            .unwrap_or(self.default_prefix_len);
        let network = self.allocate_from_pool(&mut pool, view, prefix_len, &request.name)?;
        Ok(Some(network.cidr))
    }

    fn request_specific_network(
        &self,
        view: &str,
        subnet: Ipv4Net,
        name: &str,
    ) -> Result<Option<Network>, IpamError> {
        if let Some(network) = self.directory.get_network(view, subnet)? {
            if network.is_named(name) {
                debug!("RequestNetwork: {} already belongs to '{}'", subnet, name);
                return Ok(Some(network));
            }
            warn!(
                "RequestNetwork: {} in view '{}' is already used by {:?}, refusing '{}'",
                subnet, view, network.name, name
            );
            return Ok(None);
        }

        if let Some(by_name) = self.directory.get_network_by_name(view, name)? {
            if by_name.cidr != subnet {
                warn!(
                    "RequestNetwork: '{}' is already bound to {} in view '{}', refusing {}",
                    name, by_name.cidr, view, subnet
                );
                return Ok(None);
            }
            return Ok(Some(by_name));
        }

        let network = self.directory.create_network(view, subnet, name)?;
        info!("RequestNetwork: created {} for '{}' in view '{}'", network.cidr, name, view);
        Ok(Some(network))
    }

    fn allocate_from_pool(
        &self,
        pool: &mut ContainerPool,
        view: &str,
        prefix_len: u8,
        name: &str,
    ) -> Result<Network, IpamError> {
        if !(1..=32).contains(&prefix_len) {
            return Err(IpamError::InvalidPrefixLength(prefix_len));
        }
        debug!(
            "allocate_from_pool: view='{}', prefix_len={}, name='{}'",
            view, prefix_len, name
        );

        for round in 1..=POOL_ROUNDS {
            if let Some(network) = self.carve_round(pool, view, prefix_len, name)? {
                info!(
                    "Allocated {} for '{}' in view '{}' (round {})",
                    network.cidr, name, view, round
                );
                return Ok(network);
            }
            if round < POOL_ROUNDS {
                warn!("Every network container is exhausted for /{}, resetting pool and retrying", prefix_len);
                pool.reset();
            }
        }

        error!(
            "Address space exhausted: no container can supply a /{} for '{}' in view '{}'",
            prefix_len, name, view
        );
        Err(IpamError::AddressSpaceExhausted {
            prefix_len,
            name: name.to_string(),
        })
    }

    /// One first-fit pass over the containers not yet exhausted
    fn carve_round(
        &self,
        pool: &mut ContainerPool,
        view: &str,
        prefix_len: u8,
        name: &str,
    ) -> Result<Option<Network>, IpamError> {
        while let Some(container) = pool.next_available() {
            let cidr = container.cidr();
            if !container.is_bound_to(view) {
                let handle = self.resolve_container(view, cidr)?;
                container.bind(view, handle);
            }

            debug!("Allocating network from container {}", cidr);
            match self.directory.allocate_network(view, cidr, prefix_len, name)? {
                Some(network) => return Ok(Some(network)),
                None => {
                    debug!("Container {} has no room for a /{}", cidr, prefix_len);
                    container.mark_exhausted();
                }
            }
        }
        Ok(None)
    }

    fn resolve_container(&self, view: &str, cidr: Ipv4Net) -> Result<NetworkContainer, DirectoryError> {
        match self.directory.get_network_container(view, cidr)? {
            Some(container) => Ok(container),
            None => {
                info!("Creating network container {} in view '{}'", cidr, view);
                self.directory.create_network_container(view, cidr)
            }
        }
    }

    /// Reserve an address in `cidr`, reusing an existing reservation for the same MAC.
    ///
    /// [`ZERO_MAC`] is treated as no MAC at all.
    pub fn request_address(
        &self,
        view: &str,
        cidr: Ipv4Net,
        ip: Option<Ipv4Addr>,
        mac: &str,
        name: &str,
        container_id: &str,
    ) -> Result<Ipv4Addr, IpamError> {
        let view = self.view_or_default(view);
        let mac = if is_unset_mac(mac) { "" } else { mac };
        let _guard = self.lock_reservations();

        if mac.is_empty() {
            match self.empty_mac {
                EmptyMacPolicy::Reject => return Err(IpamError::EmptyMac(container_id.to_string())),
                EmptyMacPolicy::Substitute => warn!(
                    "RequestAddress for container '{}' has an empty MAC address, '{}' will be used",
                    container_id, ZERO_MAC
                ),
            }
        } else if let Some(existing) = self.directory.get_fixed_address(view, cidr, ip, mac)? {
            info!("RequestAddress: reusing {} for MAC {}", existing.ip, mac);
            return Ok(existing.ip);
        }

        let fixed = self
            .directory
            .allocate_ip(view, cidr, ip, mac, name, container_id)?;
        info!(
            "RequestAddress: reserved {} in {} (view '{}', container '{}')",
            fixed.ip, cidr, view, container_id
        );
        Ok(fixed.ip)
    }

    pub fn get_address(
        &self,
        view: &str,
        cidr: Ipv4Net,
        ip: Option<Ipv4Addr>,
        mac: &str,
    ) -> Result<Option<FixedAddress>, IpamError> {
        let view = self.view_or_default(view);
        Ok(self.directory.get_fixed_address(view, cidr, ip, mac)?)
    }

    /// Rebind the identity of an existing reservation
    pub fn update_address(
        &self,
        reference: &str,
        mac: &str,
        name: &str,
        vm_id: &str,
    ) -> Result<FixedAddress, IpamError> {
        let updated = self
            .directory
            .update_fixed_address(reference, mac, name, vm_id)?;
        info!("UpdateAddress: {} is now bound to {}", updated.ip, updated.mac);
        Ok(updated)
    }

    /// Reserve the gateway address of the first candidate subnet.
    ///
    /// Partially specified gateways (`0.0.0.1`) are completed from the
    /// subnet's network address first. The reservation is reused if it
    /// already exists.
    pub fn create_gateway(
        &self,
        candidates: &[Ipv4Net],
        gateway: IpAddr,
        view: &str,
    ) -> Result<FixedAddress, IpamError> {
        let subnet = candidates
            .first()
            .map(Ipv4Net::trunc)
            .ok_or(IpamError::NoCandidateSubnet(gateway))?;
        let gw = resolve_gateway(subnet, gateway)?;

        let view = self.view_or_default(view);
        let _guard = self.lock_reservations();
        if let Some(existing) = self.directory.get_fixed_address(view, subnet, Some(gw), "")? {
            debug!("CreateGateway: {} already reserved ({})", gw, existing.reference);
            return Ok(existing);
        }
        let fixed = self
            .directory
            .allocate_ip(view, subnet, Some(gw), "", GATEWAY_NAME, "")?;
        info!("CreateGateway: reserved {} in {} (view '{}')", gw, subnet, view);
        Ok(fixed)
    }

    /// Release the reservation matching `(view, ip, mac)`.
    ///
    /// Reservations made without a MAC, and every release whose MAC is empty
    /// or [`ZERO_MAC`], are matched by `container_id`. A missing reservation
    /// is logged and reported as `Ok(None)`.
    pub fn release_address(
        &self,
        view: &str,
        ip: Option<Ipv4Addr>,
        mac: &str,
        container_id: &str,
    ) -> Result<Option<String>, IpamError> {
        let view = self.view_or_default(view);
        let mac = if is_unset_mac(mac) { "" } else { mac };
        let released = self.directory.release_ip(view, ip, mac, container_id)?;
        match &released {
            Some(reference) => info!("ReleaseAddress: released {}", reference),
            None => warn!(
                "ReleaseAddress: no reservation for view '{}', ip {:?}, mac '{}', container '{}'",
                view, ip, mac, container_id
            ),
        }
        Ok(released)
    }
}

/// Validate a configured gateway against `subnet` and complete it.
///
/// Partial addresses like `0.0.0.1` take their network bits from `subnet`.
/// The result must be a host address of `subnet`.
pub fn resolve_gateway(subnet: Ipv4Net, gateway: IpAddr) -> Result<Ipv4Addr, IpamError> {
    let subnet = subnet.trunc();
    let gw = to_ipv4(gateway).ok_or_else(|| IpamError::InvalidGateway {
        gateway,
        reason: "not an IPv4 address".to_string(),
    })?;
    if gw.is_unspecified() {
        return Err(IpamError::InvalidGateway {
            gateway,
            reason: "address is unspecified".to_string(),
        });
    }

    let gw = complete_gateway(gw, subnet);
    if !subnet.contains(&gw) {
        return Err(IpamError::GatewayOutsideSubnet { gateway: gw, subnet });
    }
    if subnet.prefix_len() < 31 && (gw == subnet.network() || gw == subnet.broadcast()) {
        return Err(IpamError::InvalidGateway {
            gateway,
            reason: format!("{} is not a host address of {}", gw, subnet),
        });
    }
    Ok(gw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::InMemoryDirectory;
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    fn net(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    fn allocator(containers: &str, view: &str, prefix_len: u8) -> Allocator<InMemoryDirectory> {
        Allocator::new(
            Arc::new(InMemoryDirectory::new()),
            ContainerPool::parse(containers).unwrap(),
            view,
            prefix_len,
        )
    }

    fn named(name: &str, view: &str) -> AllocationRequest {
        AllocationRequest {
            name: name.to_string(),
            network_view: view.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_request_network_view_existing() {
        let ipam = allocator("10.0.0.0/16", "default", 24);
        ipam.directory().create_network_view("test-view").unwrap();

        assert_eq!(ipam.request_network_view("test-view").unwrap(), "test-view");
        assert_eq!(ipam.directory().calls().create_network_view, 1);
    }

    #[test]
    fn test_request_network_view_creates_default() {
        let ipam = allocator("10.0.0.0/16", "default", 24);

        assert_eq!(ipam.request_network_view("").unwrap(), "default");
        let calls = ipam.directory().calls();
        assert_eq!(calls.get_network_view, 1);
        assert_eq!(calls.create_network_view, 1);
    }

    #[test]
    fn test_end_to_end_named_subnet_reuse() {
        let ipam = allocator("192.168.10.0/24", "default", 24);
        let mut request = named("yellow", "test-view");
        request.desired_prefix_length = Some(26);

        let first = ipam.request_network(&request, "test-view").unwrap();
        let second = ipam.request_network(&request, "test-view").unwrap();

        assert_eq!(first, Some(net("192.168.10.0/26")));
        assert_eq!(second, first);
        let calls = ipam.directory().calls();
        assert_eq!(calls.allocate_network, 1);
        assert_eq!(calls.create_network, 0);
    }

    #[test]
    fn test_default_prefix_length_applies() {
        let ipam = allocator("172.18.0.0/16", "default", 24);
        let mut request = named("blue", "");
        request.desired_prefix_length = Some(0);

        assert_eq!(ipam.request_network(&request, "").unwrap(), Some(net("172.18.0.0/24")));
    }

    #[test]
    fn test_first_fit_skips_full_container() {
        let ipam = allocator("10.0.0.0/24,10.0.1.0/24,10.0.2.0/24", "v", 24);
        ipam.directory().create_network("v", net("10.0.0.0/24"), "occupied").unwrap();

        let cidr = ipam.request_network(&named("red", "v"), "v").unwrap();

        assert_eq!(cidr, Some(net("10.0.1.0/24")));
        let status = ipam.pool_status();
        assert!(status[0].exhausted);
        assert!(!status[1].exhausted);
        assert!(!status[2].exhausted);
        assert_eq!(status[2].view, None);
        assert_eq!(ipam.directory().calls().allocate_network, 2);
    }

    #[test]
    fn test_exhausted_flags_persist_between_calls() {
        let ipam = allocator("10.0.0.0/25,10.0.1.0/24", "v", 25);
        let a = ipam.request_network(&named("a", "v"), "v").unwrap();
        let b = ipam.request_network(&named("b", "v"), "v").unwrap();
        let c = ipam.request_network(&named("c", "v"), "v").unwrap();

        assert_eq!(a, Some(net("10.0.0.0/25")));
        assert_eq!(b, Some(net("10.0.1.0/25")));
        assert_eq!(c, Some(net("10.0.1.128/25")));
        // The first container was only tried once after filling up
        assert_eq!(ipam.directory().calls().allocate_network, 4);
    }

    #[test]
    fn test_two_round_exhaustion() {
        let ipam = allocator("10.0.0.0/24,10.0.1.0/24", "v", 24);
        ipam.directory().create_network("v", net("10.0.0.0/24"), "x").unwrap();
        ipam.directory().create_network("v", net("10.0.1.0/24"), "y").unwrap();

        let err = ipam.request_network(&named("z", "v"), "v").unwrap_err();

        assert!(matches!(err, IpamError::AddressSpaceExhausted { prefix_len: 24, .. }));
        let calls = ipam.directory().calls();
        assert_eq!(calls.allocate_network, 2 * POOL_ROUNDS);
        // Bindings are dropped on reset and resolved again in the second round
        assert_eq!(calls.get_network_container, 2 * POOL_ROUNDS);
        assert_eq!(calls.create_network_container, 2);
    }

    #[test]
    fn test_second_round_retries_containers_exhausted_earlier() {
        let ipam = allocator("10.0.0.0/24,10.0.2.0/23", "v", 24);
        let mut a = named("a", "v");
        a.desired_prefix_length = Some(25);
        let mut b = named("b", "v");
        b.desired_prefix_length = Some(23);
        let mut c = named("c", "v");
        c.desired_prefix_length = Some(26);

        assert_eq!(ipam.request_network(&a, "v").unwrap(), Some(net("10.0.0.0/25")));
        // A /23 cannot fit the first container, which stays marked exhausted
        assert_eq!(ipam.request_network(&b, "v").unwrap(), Some(net("10.0.2.0/23")));
        assert!(ipam.pool_status()[0].exhausted);

        // Round one only tries the full second container; round two finds room in the first
        assert_eq!(ipam.request_network(&c, "v").unwrap(), Some(net("10.0.0.128/26")));
        assert_eq!(ipam.directory().calls().allocate_network, 5);
        let status = ipam.pool_status();
        assert!(!status[0].exhausted);
        assert!(!status[1].exhausted);
        assert_eq!(status[0].view.as_deref(), Some("v"));
        assert_eq!(status[1].view, None);
    }

    #[test]
    fn test_explicit_subnet_never_touches_pool() {
        let ipam = allocator("10.0.0.0/16", "default", 24);
        let mut request = named("yellow", "test-view");
        request.explicit_subnet = Some(net("192.168.30.0/24"));

        let cidr = ipam.request_network(&request, "test-view").unwrap();

        assert_eq!(cidr, Some(net("192.168.30.0/24")));
        let calls = ipam.directory().calls();
        assert_eq!(calls.pool_calls(), 0);
        assert_eq!(calls.create_network, 1);
    }

    #[test]
    fn test_explicit_subnet_reused_when_name_matches() {
        let ipam = allocator("10.0.0.0/16", "default", 24);
        ipam.directory().create_network("v", net("192.168.30.0/24"), "yellow").unwrap();
        let mut request = named("yellow", "v");
        request.explicit_subnet = Some(net("192.168.30.0/24"));

        assert_eq!(ipam.request_network(&request, "v").unwrap(), Some(net("192.168.30.0/24")));
        assert_eq!(ipam.directory().calls().create_network, 1);
    }

    #[test]
    fn test_explicit_subnet_taken_by_other_name_is_refused() {
        let ipam = allocator("10.0.0.0/16", "default", 24);
        ipam.directory().create_network("v", net("192.168.30.0/24"), "green").unwrap();
        let mut request = named("yellow", "v");
        request.explicit_subnet = Some(net("192.168.30.0/24"));

        assert_eq!(ipam.request_network(&request, "v").unwrap(), None);
    }

    #[test]
    fn test_name_bound_to_different_cidr_is_refused() {
        let ipam = allocator("10.0.0.0/16", "default", 24);
        ipam.directory().create_network("v", net("192.168.31.0/24"), "yellow").unwrap();
        let mut request = named("yellow", "v");
        request.explicit_subnet = Some(net("192.168.30.0/24"));

        assert_eq!(ipam.request_network(&request, "v").unwrap(), None);
        assert_eq!(ipam.directory().calls().create_network, 1);
    }

    #[test]
    fn test_directory_failure_aborts_without_exhaustion() {
        let ipam = allocator("10.0.0.0/24", "v", 24);
        ipam.directory().set_unreachable(true);

        let err = ipam.request_network(&named("a", "v"), "v").unwrap_err();

        assert!(matches!(err, IpamError::Directory(DirectoryError::Transport(_))));
        assert!(!ipam.pool_status()[0].exhausted);
    }

    #[test]
    fn test_pool_rebinds_per_view() {
        let ipam = allocator("10.0.0.0/16", "default", 24);
        ipam.request_network(&named("a", "red"), "red").unwrap();
        assert_eq!(ipam.pool_status()[0].view.as_deref(), Some("red"));

        let cidr = ipam.request_network(&named("a", "blue"), "blue").unwrap();
        assert_eq!(cidr, Some(net("10.0.0.0/24")));
        assert_eq!(ipam.pool_status()[0].view.as_deref(), Some("blue"));
        assert_eq!(ipam.directory().calls().create_network_container, 2);
    }

    #[test]
    fn test_invalid_prefix_length() {
        let ipam = allocator("10.0.0.0/16", "default", 24);
        let mut request = named("a", "");
        request.desired_prefix_length = Some(33);

        assert!(matches!(
            ipam.request_network(&request, "").unwrap_err(),
            IpamError::InvalidPrefixLength(33)
        ));
    }

    #[test]
    fn test_request_address_reuses_existing_reservation() {
        let ipam = allocator("10.0.0.0/16", "default", 24);
        let dir = ipam.directory();
        dir.create_network("v", net("10.9.0.0/24"), "n").unwrap();

        let first = ipam
            .request_address("v", net("10.9.0.0/24"), None, "11:22:33:44:55:66", "pod", "abc")
            .unwrap();
        let again = ipam
            .request_address("v", net("10.9.0.0/24"), None, "11:22:33:44:55:66", "pod", "abc")
            .unwrap();

        assert_eq!(first, again);
        assert_eq!(dir.calls().allocate_ip, 1);
    }

    #[test]
    fn test_request_address_empty_mac_policies() {
        let ipam = allocator("10.0.0.0/16", "default", 24);
        ipam.directory().create_network("v", net("10.9.0.0/24"), "n").unwrap();

        let ip = ipam.request_address("v", net("10.9.0.0/24"), None, "", "pod", "abc").unwrap();
        assert_eq!(ip, Ipv4Addr::new(10, 9, 0, 1));
        assert_eq!(ipam.directory().calls().get_fixed_address, 0);

        let strict = allocator("10.0.0.0/16", "default", 24).with_empty_mac_policy(EmptyMacPolicy::Reject);
        let err = strict
            .request_address("v", net("10.9.0.0/24"), None, "", "pod", "abc")
            .unwrap_err();
        assert!(matches!(err, IpamError::EmptyMac(ref id) if id == "abc"));
    }

    #[test]
    fn test_create_gateway_completes_partial_address() {
        let ipam = allocator("10.0.0.0/16", "default", 24);
        ipam.directory().create_network("v", net("10.9.0.0/24"), "n").unwrap();

        let gw = ipam
            .create_gateway(&[net("10.9.0.0/24")], "0.0.0.5".parse().unwrap(), "v")
            .unwrap();
        assert_eq!(gw.ip, Ipv4Addr::new(10, 9, 0, 5));

        let again = ipam
            .create_gateway(&[net("10.9.0.0/24")], "10.9.0.5".parse().unwrap(), "v")
            .unwrap();
        assert_eq!(again.reference, gw.reference);
        assert_eq!(ipam.directory().calls().allocate_ip, 1);
    }

    #[test]
    fn test_create_gateway_outside_subnet_is_rejected_before_reservation() {
        let ipam = allocator("10.0.0.0/16", "default", 24);

        let err = ipam
            .create_gateway(&[net("10.9.0.0/24")], "10.8.0.1".parse().unwrap(), "v")
            .unwrap_err();

        assert!(matches!(err, IpamError::GatewayOutsideSubnet { .. }));
        let calls = ipam.directory().calls();
        assert_eq!(calls.get_fixed_address, 0);
        assert_eq!(calls.allocate_ip, 0);
    }

    #[test]
    fn test_create_gateway_rejects_network_address() {
        let ipam = allocator("10.0.0.0/16", "default", 24);
        let err = ipam
            .create_gateway(&[net("10.9.0.0/24")], "10.9.0.0".parse().unwrap(), "v")
            .unwrap_err();
        assert!(matches!(err, IpamError::InvalidGateway { .. }));
    }

    #[test]
    fn test_release_missing_address_is_not_an_error() {
        let ipam = allocator("10.0.0.0/16", "default", 24);

        let released = ipam.release_address("v", None, "11:22:33:44:55:66", "abc").unwrap();

        assert_eq!(released, None);
    }

    #[test]
    fn test_release_then_release_again() {
        let ipam = allocator("10.0.0.0/16", "default", 24);
        ipam.directory().create_network("default", net("10.9.0.0/24"), "n").unwrap();
        ipam.request_address("", net("10.9.0.0/24"), None, "11:22:33:44:55:66", "pod", "abc")
            .unwrap();

        assert!(ipam.release_address("", None, "11:22:33:44:55:66", "abc").unwrap().is_some());
        assert!(ipam.release_address("", None, "11:22:33:44:55:66", "abc").unwrap().is_none());
    }

    #[test]
    fn test_release_without_mac_finds_container_reservation() {
        let ipam = allocator("10.0.0.0/16", "default", 24);
        ipam.directory().create_network("v", net("10.9.0.0/24"), "n").unwrap();
        ipam.create_gateway(&[net("10.9.0.0/24")], "0.0.0.1".parse().unwrap(), "v").unwrap();
        ipam.request_address("v", net("10.9.0.0/24"), None, "", "pod", "abc").unwrap();

        assert!(ipam.release_address("v", None, "", "abc").unwrap().is_some());
        assert!(ipam.release_address("v", None, ZERO_MAC, "abc").unwrap().is_none());

        let remaining = ipam.directory().fixed_addresses();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].name, GATEWAY_NAME);
    }

    #[test]
    fn test_zero_mac_does_not_reuse_gateway() {
        let ipam = allocator("10.0.0.0/16", "default", 24);
        ipam.directory().create_network("v", net("10.9.0.0/24"), "n").unwrap();
        let gw = ipam
            .create_gateway(&[net("10.9.0.0/24")], "0.0.0.1".parse().unwrap(), "v")
            .unwrap();

        let ip = ipam
            .request_address("v", net("10.9.0.0/24"), None, ZERO_MAC, "pod", "abc")
            .unwrap();
        assert_ne!(ip, gw.ip);

        let strict = allocator("10.0.0.0/16", "default", 24).with_empty_mac_policy(EmptyMacPolicy::Reject);
        assert!(matches!(
            strict.request_address("v", net("10.9.0.0/24"), None, "00:00:00:00:00:00", "pod", "abc"),
            Err(IpamError::EmptyMac(_))
        ));
    }

    #[test]
    fn test_resolve_gateway() {
        let subnet = net("10.0.0.0/24");
        assert_eq!(resolve_gateway(subnet, "0.0.0.1".parse().unwrap()).unwrap(), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(resolve_gateway(subnet, "10.0.0.254".parse().unwrap()).unwrap(), Ipv4Addr::new(10, 0, 0, 254));
        assert!(matches!(
            resolve_gateway(subnet, "192.168.1.1".parse().unwrap()),
            Err(IpamError::GatewayOutsideSubnet { .. })
        ));
        assert!(matches!(
            resolve_gateway(subnet, "0.0.0.0".parse().unwrap()),
            Err(IpamError::InvalidGateway { .. })
        ));
        assert!(matches!(
            resolve_gateway(subnet, "::1".parse().unwrap()),
            Err(IpamError::InvalidGateway { .. })
        ));
    }

    /// Directory whose view lookups answer late, widening any get-then-create window
    struct SlowViewDirectory {
        inner: InMemoryDirectory,
        delay: Duration,
    }

    impl AddressDirectory for SlowViewDirectory {
        fn get_network_view(&self, name: &str) -> Result<Option<NetworkView>, DirectoryError> {
            let view = self.inner.get_network_view(name);
            thread::sleep(self.delay);
            view
        }

        fn create_network_view(&self, name: &str) -> Result<NetworkView, DirectoryError> {
            self.inner.create_network_view(name)
        }

        fn get_network_container(&self, view: &str, cidr: Ipv4Net) -> Result<Option<NetworkContainer>, DirectoryError> {
            self.inner.get_network_container(view, cidr)
        }

        fn create_network_container(&self, view: &str, cidr: Ipv4Net) -> Result<NetworkContainer, DirectoryError> {
            self.inner.create_network_container(view, cidr)
        }

        fn get_network(&self, view: &str, cidr: Ipv4Net) -> Result<Option<Network>, DirectoryError> {
            self.inner.get_network(view, cidr)
        }

        fn get_network_by_name(&self, view: &str, name: &str) -> Result<Option<Network>, DirectoryError> {
            self.inner.get_network_by_name(view, name)
        }

        fn create_network(&self, view: &str, cidr: Ipv4Net, name: &str) -> Result<Network, DirectoryError> {
            self.inner.create_network(view, cidr, name)
        }

        fn allocate_network(
            &self,
            view: &str,
            container: Ipv4Net,
            prefix_len: u8,
            name: &str,
        ) -> Result<Option<Network>, DirectoryError> {
            self.inner.allocate_network(view, container, prefix_len, name)
        }

        fn get_fixed_address(
            &self,
            view: &str,
            cidr: Ipv4Net,
            ip: Option<Ipv4Addr>,
            mac: &str,
        ) -> Result<Option<FixedAddress>, DirectoryError> {
            self.inner.get_fixed_address(view, cidr, ip, mac)
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
            self.inner.allocate_ip(view, cidr, ip, mac, name, vm_id)
        }

        fn update_fixed_address(
            &self,
            reference: &str,
            mac: &str,
            name: &str,
            vm_id: &str,
        ) -> Result<FixedAddress, DirectoryError> {
            self.inner.update_fixed_address(reference, mac, name, vm_id)
        }

        fn release_ip(
            &self,
            view: &str,
            ip: Option<Ipv4Addr>,
            mac: &str,
            vm_id: &str,
        ) -> Result<Option<String>, DirectoryError> {
            self.inner.release_ip(view, ip, mac, vm_id)
        }
    }

    #[test]
    fn test_concurrent_first_requests_for_a_view() {
        let directory = Arc::new(SlowViewDirectory {
            inner: InMemoryDirectory::new(),
            delay: Duration::from_millis(20),
        });
        let ipam = Arc::new(Allocator::new(
            Arc::clone(&directory),
            ContainerPool::parse("10.0.0.0/16").unwrap(),
            "default",
            24,
        ));
        let barrier = Arc::new(Barrier::new(4));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ipam = Arc::clone(&ipam);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    ipam.request_network_view("fresh")
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap().unwrap(), "fresh");
        }
        assert_eq!(directory.inner.calls().create_network_view, 1);
    }

    #[test]
    fn test_view_created_elsewhere_is_looked_up_again() {
        let ipam = allocator("10.0.0.0/16", "default", 24);
        ipam.directory().create_network_view("shared").unwrap();

        // Lost race against another client: create is rejected, the view exists
        let view = ipam.create_network_view("shared").unwrap();

        assert_eq!(view.name, "shared");
        assert_eq!(ipam.directory().calls().get_network_view, 1);
    }
}
