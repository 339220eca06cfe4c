use std::net::IpAddr;
use std::sync::Mutex;

use ipnetwork::IpNetwork;

use crate::bitmap::Bitmap;
use crate::{Error, Result};

/// IPv6 service ranges are capped so the bitmap stays bounded; nobody runs
/// 2^80 services.
const MAX_V6_RANGE: u128 = 1 << 16;

/// Capability surface for a cluster-IP allocator managing one CIDR.
///
/// Implementations must be safe for concurrent use and are treated as
/// durable by callers; persisting reservations is the implementation's
/// problem.
pub trait IpAllocator: Send + Sync {
    /// Reserves a specific IP. Fails if it is outside the range or taken.
    fn allocate(&self, ip: IpAddr) -> Result<()>;

    /// Reserves any free IP.
    fn allocate_next(&self) -> Result<IpAddr>;

    /// Releases an IP. Releasing an unreserved or out-of-range IP is not an
    /// error.
    fn release(&self, ip: IpAddr) -> Result<()>;

    /// The managed range.
    fn cidr(&self) -> IpNetwork;

    fn has(&self, ip: IpAddr) -> bool;
}

/// Bitmap-backed allocator over a CIDR.
///
/// For IPv4 ranges wider than /31 the network and broadcast addresses are
/// excluded. All methods take `&self`; the bitmap sits behind a mutex so a
/// single instance can be shared process-wide.
pub struct RangeAllocator {
    cidr: IpNetwork,
    base: u128,
    size: u128,
    inner: Mutex<Bitmap>,
}

impl RangeAllocator {
    pub fn new(cidr: IpNetwork) -> Self {
        let (base, size) = range_of(&cidr);
        RangeAllocator {
            cidr,
            base,
            size,
            inner: Mutex::new(Bitmap::new(size as usize)),
        }
    }

    /// Number of IPs currently reserved.
    pub fn allocated_count(&self) -> usize {
        self.inner.lock().expect("allocator mutex poisoned").allocated()
    }

    fn offset_of(&self, ip: IpAddr) -> Option<usize> {
        if self.cidr.is_ipv4() != ip.is_ipv4() || !self.cidr.contains(ip) {
            return None;
        }
        let value = ip_to_u128(ip);
        if value < self.base || value - self.base >= self.size {
            return None;
        }
        Some((value - self.base) as usize)
    }

    fn ip_at(&self, offset: usize) -> IpAddr {
        u128_to_ip(self.base + offset as u128, self.cidr.is_ipv4())
    }
}

impl IpAllocator for RangeAllocator {
    fn allocate(&self, ip: IpAddr) -> Result<()> {
        let offset = self
            .offset_of(ip)
            .ok_or(Error::IpNotInRange { ip, cidr: self.cidr })?;
        let mut bitmap = self.inner.lock().expect("allocator mutex poisoned");
        if !bitmap.allocate(offset) {
            return Err(Error::IpAllocated { ip });
        }
        Ok(())
    }

    fn allocate_next(&self) -> Result<IpAddr> {
        let mut bitmap = self.inner.lock().expect("allocator mutex poisoned");
        let offset = bitmap
            .allocate_next()
            .ok_or(Error::IpRangeFull { cidr: self.cidr })?;
        Ok(self.ip_at(offset))
    }

    fn release(&self, ip: IpAddr) -> Result<()> {
        let Some(offset) = self.offset_of(ip) else {
            return Ok(());
        };
        self.inner
            .lock()
            .expect("allocator mutex poisoned")
            .release(offset);
        Ok(())
    }

    fn cidr(&self) -> IpNetwork {
        self.cidr
    }

    fn has(&self, ip: IpAddr) -> bool {
        match self.offset_of(ip) {
            Some(offset) => self.inner.lock().expect("allocator mutex poisoned").has(offset),
            None => false,
        }
    }
}

/// Returns the first allocatable address and the count of allocatable
/// addresses for a CIDR.
fn range_of(cidr: &IpNetwork) -> (u128, u128) {
    let network = ip_to_u128(cidr.network());
    match cidr {
        IpNetwork::V4(net) => {
            let total = 1u128 << (32 - net.prefix());
            if net.prefix() < 31 {
                // skip the network and broadcast addresses
                (network + 1, total - 2)
            } else {
                (network, total)
            }
        }
        IpNetwork::V6(net) => {
            let bits = 128 - u32::from(net.prefix());
            let total = if bits >= 17 {
                MAX_V6_RANGE
            } else {
                (1u128 << bits) - 1
            };
            (network + 1, total)
        }
    }
}

fn ip_to_u128(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u128::from(u32::from(v4)),
        IpAddr::V6(v6) => u128::from(v6),
    }
}

fn u128_to_ip(value: u128, v4: bool) -> IpAddr {
    if v4 {
        IpAddr::V4(std::net::Ipv4Addr::from(value as u32))
    } else {
        IpAddr::V6(std::net::Ipv6Addr::from(value))
    }
}
