use std::net::IpAddr;

use ipnetwork::IpNetwork;
use thiserror::Error;

use crate::port::PortRange;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("IP {ip} is already allocated")]
    IpAllocated { ip: IpAddr },

    #[error("IP {ip} is not in range {cidr}")]
    IpNotInRange { ip: IpAddr, cidr: IpNetwork },

    #[error("no free IPs left in range {cidr}")]
    IpRangeFull { cidr: IpNetwork },

    #[error("port {port} is already allocated")]
    PortAllocated { port: u16 },

    #[error("port {port} is not in range {range}")]
    PortNotInRange { port: u16, range: PortRange },

    #[error("no free ports left in range {range}")]
    PortRangeFull { range: PortRange },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
