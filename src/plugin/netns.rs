//! Interface MAC discovery, optionally inside a container's network namespace.
//!
//! Entering a namespace with `setns` switches only the calling OS thread. The
//! switch is done on a freshly spawned thread that exits when the lookup is
//! over, so no other code ever runs in the container namespace.

use crate::utils::ip_utils::format_mac;
use nix::ifaddrs::getifaddrs;
use nix::sched::{setns, CloneFlags};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;

#[derive(Debug, thiserror::Error)]
pub enum NetnsError {
    #[error("Failed to open network namespace '{path}': {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to enter network namespace '{path}': {source}")]
    Enter {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },

    #[error("Failed to list interfaces: {0}")]
    Query(#[source] nix::Error),

    #[error("Interface '{0}' not found or has no hardware address")]
    InterfaceNotFound(String),

    #[error("Namespace worker failed: {0}")]
    Worker(String),
}

/// Make a namespace path absolute; an empty path means no namespace
pub fn absolute_netns(netns: &str) -> io::Result<Option<PathBuf>> {
    if netns.is_empty() {
        return Ok(None);
    }
    std::path::absolute(netns).map(Some)
}

/// MAC address of `if_name`, looked up inside `netns` when one is given
pub fn interface_mac(netns: Option<&Path>, if_name: &str) -> Result<String, NetnsError> {
    match netns {
        None => lookup_mac(if_name),
        Some(path) => {
            let if_name = if_name.to_string();
            in_namespace(path, move || lookup_mac(&if_name))
        }
    }
}

/// Run `f` on a dedicated thread that has joined the namespace at `path`
pub fn in_namespace<T, F>(path: &Path, f: F) -> Result<T, NetnsError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, NetnsError> + Send + 'static,
{
    let ns = File::open(path).map_err(|source| NetnsError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let ns_path = path.to_path_buf();
    let (tx, rx) = mpsc::channel();

    thread::Builder::new()
        .name("netns".to_string())
        .spawn(move || {
            let result = setns(&ns, CloneFlags::CLONE_NEWNET)
                .map_err(|source| NetnsError::Enter {
                    path: ns_path,
                    source,
                })
                .and_then(|()| f());
            // The receiver only disappears if the caller is gone
            let _ = tx.send(result);
        })
        .map_err(|e| NetnsError::Worker(e.to_string()))?;

    rx.recv()
        .map_err(|_| NetnsError::Worker("exited without a result".to_string()))?
}

fn lookup_mac(if_name: &str) -> Result<String, NetnsError> {
    getifaddrs()
        .map_err(NetnsError::Query)?
        .filter(|ifaddr| ifaddr.interface_name == if_name)
        .find_map(|ifaddr| {
            ifaddr
                .address
                .as_ref()
                .and_then(|addr| addr.as_link_addr())
                .and_then(|link| link.addr())
        })
        .map(|mac| format_mac(&mac))
        .ok_or_else(|| NetnsError::InterfaceNotFound(if_name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_mac_in_current_namespace() {
        assert_eq!(interface_mac(None, "lo").unwrap(), "00:00:00:00:00:00");
    }

    #[test]
    fn test_missing_interface() {
        assert!(matches!(
            interface_mac(None, "no-such-if0"),
            Err(NetnsError::InterfaceNotFound(_))
        ));
    }

    #[test]
    fn test_missing_namespace() {
        let result = interface_mac(Some(Path::new("/nonexistent/ns/net")), "eth0");
        assert!(matches!(result, Err(NetnsError::Open { .. })));
    }

    #[test]
    fn test_absolute_netns() {
        assert_eq!(absolute_netns("").unwrap(), None);
        assert_eq!(
            absolute_netns("/proc/1/ns/net").unwrap(),
            Some(PathBuf::from("/proc/1/ns/net"))
        );
        assert!(absolute_netns("ns/net").unwrap().unwrap().is_absolute());
    }
}
