//! Network container pool.
//!
//! This file holds the ordered list of configured address blocks subnets are
//! carved from, together with the per-round exhaustion flag and the lazily
//! resolved directory object for each block.

use crate::directory::NetworkContainer;
use ipnet::Ipv4Net;
use serde::Serialize;

/// Errors raised while parsing the configured container list
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("Invalid network container '{entry}': {reason}")]
    InvalidContainer { entry: String, reason: String },
}

/// One configured address block
#[derive(Debug, Clone)]
pub struct AddressSpaceContainer {
    cidr_pool: Ipv4Net,
    view_binding: Option<String>,
    remote_handle: Option<NetworkContainer>,
    exhausted: bool,
}

impl AddressSpaceContainer {
    pub fn new(cidr_pool: Ipv4Net) -> Self {
        Self {
            cidr_pool: cidr_pool.trunc(),
            view_binding: None,
            remote_handle: None,
            exhausted: false,
        }
    }

    pub fn cidr(&self) -> Ipv4Net {
        self.cidr_pool
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Whether the directory object is resolved for `view`
    pub fn is_bound_to(&self, view: &str) -> bool {
        self.remote_handle.is_some() && self.view_binding.as_deref() == Some(view)
    }

    pub fn bind(&mut self, view: &str, handle: NetworkContainer) {
        self.view_binding = Some(view.to_string());
        self.remote_handle = Some(handle);
    }

    pub fn mark_exhausted(&mut self) {
        self.exhausted = true;
    }

    /// Forget the exhaustion flag and the cached directory object
    fn reset(&mut self) {
        self.exhausted = false;
        self.view_binding = None;
        self.remote_handle = None;
    }

    fn status(&self) -> ContainerStatus {
        ContainerStatus {
            cidr: self.cidr_pool,
            view: self.view_binding.clone(),
            exhausted: self.exhausted,
        }
    }
}

/// Point-in-time view of a container, for logging and tests
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerStatus {
    pub cidr: Ipv4Net,
    pub view: Option<String>,
    pub exhausted: bool,
}

/// Ordered container list. Order is allocation priority (first fit).
#[derive(Debug, Clone, Default)]
pub struct ContainerPool {
    containers: Vec<AddressSpaceContainer>,
}

impl ContainerPool {
    pub fn new(cidrs: impl IntoIterator<Item = Ipv4Net>) -> Self {
        Self {
            containers: cidrs.into_iter().map(AddressSpaceContainer::new).collect(),
        }
    }

    /// Parse a comma-separated CIDR list such as `"10.0.0.0/16,10.1.0.0/16"`.
    ///
    /// Blank entries are skipped; anything else must be an IPv4 CIDR.
    pub fn parse(list: &str) -> Result<Self, PoolError> {
        let cidrs = list
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| {
                entry.parse::<Ipv4Net>().map_err(|e| PoolError::InvalidContainer {
                    entry: entry.to_string(),
                    reason: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(cidrs))
    }

    pub fn len(&self) -> usize {
        self.containers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
    }

    /// First container not yet marked exhausted in this round
    pub fn next_available(&mut self) -> Option<&mut AddressSpaceContainer> {
        self.containers.iter_mut().find(|c| !c.exhausted)
    }

    /// Start a new round: clear every exhaustion flag and cached binding
    pub fn reset(&mut self) {
        self.containers.iter_mut().for_each(AddressSpaceContainer::reset);
    }

    pub fn status(&self) -> Vec<ContainerStatus> {
        self.containers.iter().map(AddressSpaceContainer::status).collect()
    }
}
