//! Subnet and address allocation.
//!
//! `pool` holds the ordered list of address-space containers subnets are
//! carved from; `allocator` is the engine that resolves views, subnets,
//! addresses and gateways against the address directory.

pub mod allocator;
pub mod pool;

// Re-export commonly used types
pub use allocator::{AllocationRequest, Allocator, IpamError};
pub use pool::{AddressSpaceContainer, ContainerPool, ContainerStatus, PoolError};
