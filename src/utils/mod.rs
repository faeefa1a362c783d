//! Shared utilities: gateway completion, IPv4 conversion, MAC helpers.

pub mod ip_utils;

pub use ip_utils::{complete_gateway, mac_from_ipv4, parse_mac, to_ipv4};
