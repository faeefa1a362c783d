//! The IPAM daemon: Allocate/Release handlers over the allocation engine.
//!
//! [`IpamDaemon`] turns one plugin call ([`CmdArgs`]) into a sequence of
//! engine operations and shapes the reply as a CNI result. The transport
//! lives in [`server`]; the socket path lifecycle in [`socket`].

pub mod server;
pub mod socket;

pub use server::{serve, DaemonState, SocketServer};
pub use socket::DriverSocket;

use crate::directory::AddressDirectory;
use crate::ip::allocator::{resolve_gateway, Allocator, IpamError};
use crate::netconf::{CmdArgs, CniResult, IpConfig, NetConfError, NetConfig};
use crate::rpc::{Request, Response, METHOD_ALLOCATE, METHOD_RELEASE};
use crate::utils::ip_utils::{mac_from_ipv4, to_ipv4};
use ipnet::Ipv4Net;
use log::{error, info, warn};
use serde_json::Value;
use std::net::Ipv4Addr;

/// Errors returned by the daemon's handlers
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error(transparent)]
    NetConf(#[from] NetConfError),

    #[error(transparent)]
    Ipam(#[from] IpamError),

    #[error("Invalid call parameters: {0}")]
    Params(#[from] serde_json::Error),

    #[error("Unknown method '{0}'")]
    UnknownMethod(String),

    #[error("Network '{0}' has no ipam.subnet and network checks are disabled")]
    MissingSubnet(String),

    #[error("Reservation for {ip} in {subnet} disappeared before its MAC could be updated")]
    ReservationMissing { ip: Ipv4Addr, subnet: Ipv4Net },

    #[error(transparent)]
    Prefix(#[from] ipnet::PrefixLenError),
}

/// Request handlers shared by every connection
pub struct IpamDaemon<D: AddressDirectory> {
    allocator: Allocator<D>,
    check_network: bool,
}

impl<D: AddressDirectory> IpamDaemon<D> {
    pub fn new(allocator: Allocator<D>, check_network: bool) -> Self {
        Self {
            allocator,
            check_network,
        }
    }

    pub fn allocator(&self) -> &Allocator<D> {
        &self.allocator
    }

    /// Route one RPC request to its handler and wrap the outcome
    pub fn dispatch(&self, request: Request) -> Response {
        let Request { id, method, params } = request;
        match self.handle(&method, params) {
            Ok(result) => Response::ok(id, result),
            Err(e) => {
                error!("{} failed: {}", method, e);
                Response::err(id, e.to_string())
            }
        }
    }

    fn handle(&self, method: &str, params: Value) -> Result<Value, DaemonError> {
        match method {
            METHOD_ALLOCATE => {
                let args: CmdArgs = serde_json::from_value(params)?;
                Ok(serde_json::to_value(self.allocate(&args)?)?)
            }
            METHOD_RELEASE => {
                let args: CmdArgs = serde_json::from_value(params)?;
                self.release(&args)?;
                Ok(Value::Null)
            }
            other => Err(DaemonError::UnknownMethod(other.to_string())),
        }
    }

    /// Acquire an address for a container.
    ///
    /// With network checks on, the view and subnet are resolved (or created)
    /// first and the configured gateway is reserved. A refusal from the engine
    /// yields a result with no addresses. With checks off, the address is
    /// reserved directly in `ipam.subnet`.
    pub fn allocate(&self, args: &CmdArgs) -> Result<CniResult, DaemonError> {
        info!(
            "Allocate: container '{}', netns '{}', interface '{}', mac '{}'",
            args.container_id, args.netns, args.if_name, args.if_mac
        );
        let conf = args.netconf()?;

        // A bad gateway for an explicit subnet must fail before anything is created
        if self.check_network {
            if let (Some(subnet), Some(gw)) = (conf.ipam.subnet, conf.ipam.gateway) {
                resolve_gateway(subnet, gw)?;
            }
        }

        let (view, subnet, gateway) = if self.check_network {
            let view = self.allocator.request_network_view(&conf.ipam.network_view)?;
            let request = conf.allocation_request(args);
            let Some(subnet) = self.allocator.request_network(&request, &view)? else {
                warn!(
                    "Allocate: no subnet for network '{}' in view '{}', returning an empty result",
                    conf.name, view
                );
                return Ok(CniResult::empty(conf.result_version()));
            };
            let gateway = match conf.ipam.gateway {
                Some(gw) => Some(self.allocator.create_gateway(&[subnet], gw, &view)?.ip),
                None => None,
            };
            (view, subnet, gateway)
        } else {
            let subnet = conf
                .ipam
                .subnet
                .map(|s| s.trunc())
                .ok_or_else(|| DaemonError::MissingSubnet(conf.name.clone()))?;
            let gateway = conf.ipam.gateway.and_then(to_ipv4);
            (conf.ipam.network_view.clone(), subnet, gateway)
        };

        self.reserve(&conf, args, &view, subnet, gateway)
    }

    fn reserve(
        &self,
        conf: &NetConfig,
        args: &CmdArgs,
        view: &str,
        subnet: Ipv4Net,
        gateway: Option<Ipv4Addr>,
    ) -> Result<CniResult, DaemonError> {
        let name = args.container_name();
        let ip = self.allocator.request_address(
            view,
            subnet,
            None,
            &args.if_mac,
            name,
            &args.container_id,
        )?;
        info!("Allocated IP {} for container '{}'", ip, args.container_id);

        // The bridge plugin sets the interface MAC from the IP, so the
        // reservation has to follow.
        if conf.is_bridge() {
            let mac = mac_from_ipv4(ip);
            let fixed = self
                .allocator
                .get_address(view, subnet, Some(ip), "")?
                .ok_or(DaemonError::ReservationMissing { ip, subnet })?;
            self.allocator.update_address(&fixed.reference, &mac, name, "")?;
        }

        let result = CniResult {
            cni_version: conf.result_version().to_string(),
            ips: vec![IpConfig {
                version: "4".to_string(),
                address: Ipv4Net::new(ip, subnet.prefix_len())?,
                gateway,
            }],
            routes: conf.ipam.routes.clone(),
        };
        info!("Allocate result: {:?}", result);
        Ok(result)
    }

    /// Release the container's reservation, matched by view and interface MAC.
    ///
    /// Without a MAC the reservation is found by container id. Nothing to
    /// release is not an error.
    pub fn release(&self, args: &CmdArgs) -> Result<(), DaemonError> {
        info!(
            "Release: container '{}', interface '{}', mac '{}'",
            args.container_id, args.if_name, args.if_mac
        );
        let conf = args.netconf()?;
        self.allocator
            .release_address(&conf.ipam.network_view, None, &args.if_mac, &args.container_id)?;
        Ok(())
    }
}
