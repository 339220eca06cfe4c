//! Typed views over the Option-heavy `k8s_openapi` Service fields.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};

/// Sentinel first cluster IP marking a headless service.
pub const CLUSTER_IP_NONE: &str = "None";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    pub const fn as_str(self) -> &'static str {
        match self {
            IpFamily::V4 => "IPv4",
            IpFamily::V6 => "IPv6",
        }
    }

    pub fn parse(s: &str) -> Option<IpFamily> {
        match s {
            "IPv4" => Some(IpFamily::V4),
            "IPv6" => Some(IpFamily::V6),
            _ => None,
        }
    }

    pub fn of(ip: &IpAddr) -> IpFamily {
        if ip.is_ipv6() { IpFamily::V6 } else { IpFamily::V4 }
    }

    /// The family of a textual IP, if it parses.
    pub fn of_literal(literal: &str) -> Option<IpFamily> {
        literal.parse::<IpAddr>().ok().map(|ip| IpFamily::of(&ip))
    }

    pub const fn complement(self) -> IpFamily {
        match self {
            IpFamily::V4 => IpFamily::V6,
            IpFamily::V6 => IpFamily::V4,
        }
    }
}

impl fmt::Display for IpFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceType {
    ClusterIp,
    NodePort,
    LoadBalancer,
    ExternalName,
}

impl ServiceType {
    /// An absent or unrecognized `type` reads as ClusterIP; validation is
    /// responsible for rejecting unknown values.
    pub fn of(svc: &Service) -> ServiceType {
        match svc.spec.as_ref().and_then(|s| s.type_.as_deref()) {
            Some("NodePort") => ServiceType::NodePort,
            Some("LoadBalancer") => ServiceType::LoadBalancer,
            Some("ExternalName") => ServiceType::ExternalName,
            _ => ServiceType::ClusterIp,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            ServiceType::ClusterIp => "ClusterIP",
            ServiceType::NodePort => "NodePort",
            ServiceType::LoadBalancer => "LoadBalancer",
            ServiceType::ExternalName => "ExternalName",
        }
    }

    pub fn wants_node_ports(self) -> bool {
        matches!(self, ServiceType::NodePort | ServiceType::LoadBalancer)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExternalTrafficPolicy {
    Cluster,
    Local,
}

impl ExternalTrafficPolicy {
    pub fn of(svc: &Service) -> Option<ExternalTrafficPolicy> {
        match svc.spec.as_ref().and_then(|s| s.external_traffic_policy.as_deref()) {
            Some("Cluster") => Some(ExternalTrafficPolicy::Cluster),
            Some("Local") => Some(ExternalTrafficPolicy::Local),
            _ => None,
        }
    }
}

pub fn spec_mut(svc: &mut Service) -> &mut ServiceSpec {
    svc.spec.get_or_insert_with(ServiceSpec::default)
}

pub fn cluster_ips(svc: &Service) -> &[String] {
    svc.spec.as_ref().and_then(|s| s.cluster_ips.as_deref()).unwrap_or(&[])
}

pub fn ip_families(svc: &Service) -> &[String] {
    svc.spec.as_ref().and_then(|s| s.ip_families.as_deref()).unwrap_or(&[])
}

pub fn ip_family_policy(svc: &Service) -> Option<&str> {
    svc.spec.as_ref().and_then(|s| s.ip_family_policy.as_deref())
}

pub fn ports(svc: &Service) -> &[ServicePort] {
    svc.spec.as_ref().and_then(|s| s.ports.as_deref()).unwrap_or(&[])
}

pub fn selector(svc: &Service) -> Option<&BTreeMap<String, String>> {
    svc.spec.as_ref().and_then(|s| s.selector.as_ref())
}

pub fn health_check_node_port(svc: &Service) -> i32 {
    svc.spec.as_ref().and_then(|s| s.health_check_node_port).unwrap_or(0)
}

/// A headless service carries the `"None"` sentinel as its first cluster IP
/// and never holds an allocation.
pub fn is_headless(svc: &Service) -> bool {
    cluster_ips(svc).first().map(String::as_str) == Some(CLUSTER_IP_NONE)
}

/// True iff an external load balancer needs a liveness-probe port: type
/// LoadBalancer with `externalTrafficPolicy: Local`.
pub fn needs_health_check(svc: &Service) -> bool {
    ServiceType::of(svc) == ServiceType::LoadBalancer
        && ExternalTrafficPolicy::of(svc) == Some(ExternalTrafficPolicy::Local)
}

/// All non-zero node ports declared on the service's ports.
pub fn collect_node_ports(svc: &Service) -> Vec<i32> {
    ports(svc)
        .iter()
        .filter_map(|p| p.node_port)
        .filter(|&np| np != 0)
        .collect()
}

pub fn name_of(svc: &Service) -> &str {
    svc.metadata.name.as_deref().unwrap_or_default()
}
