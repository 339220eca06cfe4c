//! Field-level validation for Service objects. Errors carry the offending
//! field path; the REST core wraps them into `Error::Invalid`.

use std::collections::BTreeSet;

use k8s_openapi::api::core::v1::Service;

use crate::error::FieldError;
use crate::service::{
    self, CLUSTER_IP_NONE, ExternalTrafficPolicy, IpFamily, ServiceType, cluster_ips, ip_families,
    ports,
};

const VALID_TYPES: [&str; 4] = ["ClusterIP", "NodePort", "LoadBalancer", "ExternalName"];
const VALID_PROTOCOLS: [&str; 3] = ["TCP", "UDP", "SCTP"];

pub fn validate_service(svc: &Service) -> Vec<FieldError> {
    let mut errs = Vec::new();

    if svc.metadata.name.as_deref().unwrap_or_default().is_empty()
        && svc.metadata.generate_name.as_deref().unwrap_or_default().is_empty()
    {
        errs.push(FieldError::new("metadata.name", "name or generateName is required"));
    }
    if svc.metadata.namespace.as_deref().unwrap_or_default().is_empty() {
        errs.push(FieldError::new("metadata.namespace", "namespace is required"));
    }

    if let Some(t) = svc.spec.as_ref().and_then(|s| s.type_.as_deref())
        && !VALID_TYPES.contains(&t)
    {
        errs.push(FieldError::new("spec.type", format!("unsupported value {t:?}")));
    }

    validate_ports(svc, &mut errs);
    validate_cluster_ip_fields(svc, &mut errs);

    let hcnp = service::health_check_node_port(svc);
    if !(0..=65535).contains(&hcnp) {
        errs.push(FieldError::new(
            "spec.healthCheckNodePort",
            "must be between 1 and 65535",
        ));
    }

    if let Some(etp) = svc.spec.as_ref().and_then(|s| s.external_traffic_policy.as_deref())
        && ExternalTrafficPolicy::of(svc).is_none()
    {
        errs.push(FieldError::new(
            "spec.externalTrafficPolicy",
            format!("unsupported value {etp:?}"),
        ));
    }

    errs
}

fn validate_ports(svc: &Service, errs: &mut Vec<FieldError>) {
    let ports = ports(svc);
    let mut names = BTreeSet::new();
    for (i, port) in ports.iter().enumerate() {
        if !(1..=65535).contains(&port.port) {
            errs.push(FieldError::new(
                format!("spec.ports[{i}].port"),
                "must be between 1 and 65535",
            ));
        }
        if let Some(proto) = port.protocol.as_deref()
            && !VALID_PROTOCOLS.contains(&proto)
        {
            errs.push(FieldError::new(
                format!("spec.ports[{i}].protocol"),
                format!("unsupported value {proto:?}"),
            ));
        }
        if let Some(np) = port.node_port
            && !(0..=65535).contains(&np)
        {
            errs.push(FieldError::new(
                format!("spec.ports[{i}].nodePort"),
                "must be between 1 and 65535",
            ));
        }
        let name = port.name.as_deref().unwrap_or_default();
        if ports.len() > 1 && name.is_empty() {
            errs.push(FieldError::new(
                format!("spec.ports[{i}].name"),
                "required when more than one port is declared",
            ));
        }
        if !name.is_empty() && !names.insert(name) {
            errs.push(FieldError::new(format!("spec.ports[{i}].name"), "duplicate port name"));
        }
    }
}

fn validate_cluster_ip_fields(svc: &Service, errs: &mut Vec<FieldError>) {
    let ips = cluster_ips(svc);
    let families = ip_families(svc);

    if ServiceType::of(svc) == ServiceType::ExternalName {
        if !ips.is_empty() {
            errs.push(FieldError::new(
                "spec.clusterIPs",
                "may not be set for ExternalName services",
            ));
        }
        return;
    }

    if ips.len() > 2 {
        errs.push(FieldError::new("spec.clusterIPs", "may hold at most two IPs"));
    }
    for (i, ip) in ips.iter().enumerate() {
        if ip == CLUSTER_IP_NONE {
            if i != 0 {
                errs.push(FieldError::new(
                    format!("spec.clusterIPs[{i}]"),
                    "\"None\" may only be the first entry",
                ));
            }
            continue;
        }
        // the empty string is a positional placeholder meaning "allocate"
        if !ip.is_empty() && IpFamily::of_literal(ip).is_none() {
            errs.push(FieldError::new(
                format!("spec.clusterIPs[{i}]"),
                format!("{ip:?} is not a valid IP address"),
            ));
        }
    }

    if families.len() > 2 {
        errs.push(FieldError::new("spec.ipFamilies", "may hold at most two families"));
    }
    let mut seen = BTreeSet::new();
    for (i, family) in families.iter().enumerate() {
        match IpFamily::parse(family) {
            None => errs.push(FieldError::new(
                format!("spec.ipFamilies[{i}]"),
                format!("unsupported value {family:?}"),
            )),
            Some(f) => {
                if !seen.insert(f) {
                    errs.push(FieldError::new(
                        format!("spec.ipFamilies[{i}]"),
                        "duplicate IP family",
                    ));
                }
                if let Some(literal_family) =
                    ips.get(i).and_then(|ip| IpFamily::of_literal(ip))
                    && literal_family != f
                {
                    errs.push(FieldError::new(
                        format!("spec.clusterIPs[{i}]"),
                        format!("expected an {f} address"),
                    ));
                }
            }
        }
    }

    if let Some(policy) = service::ip_family_policy(svc)
        && !matches!(policy, "SingleStack" | "PreferDualStack" | "RequireDualStack")
    {
        errs.push(FieldError::new(
            "spec.ipFamilyPolicy",
            format!("unsupported value {policy:?}"),
        ));
    }
}

pub fn validate_service_update(new: &Service, old: &Service) -> Vec<FieldError> {
    let mut errs = validate_service(new);

    if new.metadata.name != old.metadata.name {
        errs.push(FieldError::new("metadata.name", "field is immutable"));
    }
    if new.metadata.namespace != old.metadata.namespace {
        errs.push(FieldError::new("metadata.namespace", "field is immutable"));
    }

    // The primary cluster IP and family are immutable once set, except when
    // the service becomes an ExternalName alias.
    if ServiceType::of(new) != ServiceType::ExternalName {
        let old_ips = cluster_ips(old);
        if let Some(old_primary) = old_ips.first().filter(|ip| !ip.is_empty())
            && cluster_ips(new).first() != Some(old_primary)
        {
            errs.push(FieldError::new(
                "spec.clusterIPs[0]",
                "may not be changed once set",
            ));
        }
        let new_families = ip_families(new);
        if let Some(old_primary) = ip_families(old).first()
            && !new_families.is_empty()
            && new_families.first() != Some(old_primary)
        {
            errs.push(FieldError::new(
                "spec.ipFamilies[0]",
                "may not be changed once set",
            ));
        }
    }

    errs
}

pub fn validate_status_update(_new: &Service, _old: &Service) -> Vec<FieldError> {
    Vec::new()
}

/// The combination rules for the external-traffic fields, checked after all
/// defaulting and allocation ran: the policy only makes sense on services
/// exposed through node ports, and the health-check port only when the
/// policy is Local on a LoadBalancer.
pub fn validate_external_traffic_fields(svc: &Service) -> Vec<FieldError> {
    let mut errs = Vec::new();

    if svc.spec.as_ref().and_then(|s| s.external_traffic_policy.as_ref()).is_some()
        && !ServiceType::of(svc).wants_node_ports()
    {
        errs.push(FieldError::new(
            "spec.externalTrafficPolicy",
            "may only be set for NodePort or LoadBalancer services",
        ));
    }
    if service::health_check_node_port(svc) != 0 && !service::needs_health_check(svc) {
        errs.push(FieldError::new(
            "spec.healthCheckNodePort",
            "may only be set on LoadBalancer services with externalTrafficPolicy: Local",
        ));
    }

    errs
}
