//! Allocators for the scarce per-cluster resources a Service can hold:
//! cluster IPs out of a configured CIDR and node ports out of a configured
//! port range.

mod bitmap;
mod error;
pub mod ip;
pub mod operation;
pub mod port;

pub use error::{Error, Result};
pub use ip::{IpAllocator, RangeAllocator};
pub use operation::PortAllocationOperation;
pub use port::{PortAllocator, PortRange, PortRangeAllocator};
