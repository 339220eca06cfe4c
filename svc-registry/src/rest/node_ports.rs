//! Node-port reservation flows over a [`PortAllocationOperation`]: staging
//! for create, reconcile-against-old for update, and the health-check port
//! state machine.

use std::collections::HashMap;

use k8s_openapi::api::core::v1::{Service, ServicePort};
use svc_registry_alloc::PortAllocationOperation;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::service::{
    self, collect_node_ports, health_check_node_port, name_of, needs_health_check, spec_mut,
};

/// Protocol + number pair; two service ports may share a node port number
/// as long as their protocols differ.
#[derive(Clone, Debug, PartialEq, Eq)]
struct ServiceNodePort {
    protocol: String,
    node_port: i32,
}

fn as_port_number(node_port: i32) -> Result<u16, ()> {
    u16::try_from(node_port).map_err(|_| ()).and_then(|p| if p == 0 { Err(()) } else { Ok(p) })
}

/// The first user-provided node port declared for this service port
/// number, or 0.
fn find_requested_node_port(port: i32, ports: &[ServicePort]) -> i32 {
    ports
        .iter()
        .find(|sp| sp.port == port && sp.node_port.unwrap_or(0) != 0)
        .and_then(|sp| sp.node_port)
        .unwrap_or(0)
}

/// Create-time reservation: walk the ports, allocating the requested node
/// port or the next free one, and keep ports sharing a `port` number on
/// the same node port.
pub(crate) fn init_node_ports(
    service: &mut Service,
    op: &mut PortAllocationOperation,
) -> Result<()> {
    let name = name_of(service).to_string();
    let mut node_port_by_svc_port: HashMap<i32, i32> = HashMap::new();

    let Some(ports) = service.spec.as_mut().and_then(|s| s.ports.as_mut()) else {
        return Ok(());
    };
    for i in 0..ports.len() {
        let svc_port = ports[i].port;
        let chosen = node_port_by_svc_port.get(&svc_port).copied().unwrap_or(0);
        if chosen == 0 {
            // scans forward only: earlier matches would already be in the map
            let requested = find_requested_node_port(svc_port, ports);
            if requested != 0 {
                let p = as_port_number(requested).map_err(|()| {
                    Error::invalid_field(
                        &name,
                        format!("spec.ports[{i}].nodePort"),
                        "must be between 1 and 65535",
                    )
                })?;
                op.allocate(p).map_err(|e| {
                    Error::invalid_field(&name, format!("spec.ports[{i}].nodePort"), e.to_string())
                })?;
                ports[i].node_port = Some(requested);
                node_port_by_svc_port.insert(svc_port, requested);
            } else {
                let p = op.allocate_next().map_err(|e| {
                    Error::internal(format!("failed to allocate a node port: {e}"))
                })?;
                ports[i].node_port = Some(i32::from(p));
                node_port_by_svc_port.insert(svc_port, i32::from(p));
            }
        } else {
            let declared = ports[i].node_port.unwrap_or(0);
            if declared == 0 {
                // same service port, share the node port
                ports[i].node_port = Some(chosen);
            } else if declared != chosen {
                // a conflicting explicit request for an already-mapped
                // service port is attempted as-is and fails naturally
                let p = as_port_number(declared).map_err(|()| {
                    Error::invalid_field(
                        &name,
                        format!("spec.ports[{i}].nodePort"),
                        "must be between 1 and 65535",
                    )
                })?;
                op.allocate(p).map_err(|e| {
                    Error::invalid_field(&name, format!("spec.ports[{i}].nodePort"), e.to_string())
                })?;
            }
        }
    }

    Ok(())
}

/// Update-time reconcile: reserve node ports that are new in this spec,
/// allocate fresh ones for zero entries, reject duplicates within the new
/// spec, and schedule deferred releases for ports the old object held but
/// the new one does not.
pub(crate) fn update_node_ports(
    old: &Service,
    service: &mut Service,
    op: &mut PortAllocationOperation,
) -> Result<()> {
    let name = name_of(service).to_string();
    let old_node_ports = collect_node_ports(old);
    let mut new_node_ports: Vec<ServiceNodePort> = Vec::new();

    if let Some(ports) = service.spec.as_mut().and_then(|s| s.ports.as_mut()) {
        for i in 0..ports.len() {
            let protocol = ports[i].protocol.clone().unwrap_or_else(|| "TCP".into());
            let declared = ports[i].node_port.unwrap_or(0);
            let node_port = if declared != 0 {
                let already_staged =
                    new_node_ports.iter().any(|snp| snp.node_port == declared);
                if !old_node_ports.contains(&declared) && !already_staged {
                    let p = as_port_number(declared).map_err(|()| {
                        Error::invalid_field(
                            &name,
                            format!("spec.ports[{i}].nodePort"),
                            "must be between 1 and 65535",
                        )
                    })?;
                    op.allocate(p).map_err(|e| {
                        Error::invalid_field(
                            &name,
                            format!("spec.ports[{i}].nodePort"),
                            e.to_string(),
                        )
                    })?;
                }
                declared
            } else {
                let p = op.allocate_next().map_err(|e| {
                    Error::internal(format!("failed to allocate a node port: {e}"))
                })?;
                ports[i].node_port = Some(i32::from(p));
                i32::from(p)
            };

            let snp = ServiceNodePort { protocol, node_port };
            if new_node_ports.contains(&snp) {
                return Err(Error::invalid_field(
                    &name,
                    format!("spec.ports[{i}].nodePort"),
                    format!("duplicate nodePort {node_port}"),
                ));
            }
            new_node_ports.push(snp);
        }
    }

    let new_numbers = collect_node_ports(service);
    for old_port in old_node_ports {
        if new_numbers.contains(&old_port) {
            continue;
        }
        if let Ok(p) = as_port_number(old_port) {
            op.release_deferred(p);
        }
    }

    Ok(())
}

/// Schedules a deferred release for every node port the service holds.
pub(crate) fn release_node_ports(service: &Service, op: &mut PortAllocationOperation) {
    for node_port in collect_node_ports(service) {
        if let Ok(p) = as_port_number(node_port) {
            op.release_deferred(p);
        }
    }
}

/// Reserves the health-check node port: the user's pick if declared,
/// otherwise the next free one, written back into the spec.
pub(crate) fn allocate_health_check_node_port(
    service: &mut Service,
    op: &mut PortAllocationOperation,
) -> Result<()> {
    let declared = health_check_node_port(service);
    if declared != 0 {
        let p = as_port_number(declared).map_err(|()| {
            Error::internal(format!(
                "failed to allocate requested HealthCheck NodePort {declared}: out of range"
            ))
        })?;
        op.allocate(p).map_err(|e| {
            Error::internal(format!(
                "failed to allocate requested HealthCheck NodePort {declared}: {e}"
            ))
        })?;
        debug!(port = declared, "reserved user-requested health check node port");
    } else {
        let p = op
            .allocate_next()
            .map_err(|e| Error::internal(format!("failed to allocate a HealthCheck NodePort: {e}")))?;
        spec_mut(service).health_check_node_port = Some(i32::from(p));
        debug!(port = p, "reserved allocated health check node port");
    }
    Ok(())
}

/// Health-check node port transitions on update: allocate on gaining the
/// need, release and clear on losing it, and refuse value changes while
/// the port is in use.
pub(crate) fn health_check_node_port_update(
    old: &Service,
    service: &mut Service,
    op: &mut PortAllocationOperation,
) -> Result<()> {
    let needed = needs_health_check(old);
    let needs = needs_health_check(service);
    let old_port = health_check_node_port(old);
    let new_port = health_check_node_port(service);

    match (needed, needs) {
        (false, true) => {
            info!(service = name_of(service), "transition to LoadBalancer with externalTrafficPolicy: Local");
            allocate_health_check_node_port(service, op)?;
        }
        (true, false) => {
            debug!(port = old_port, "releasing health check node port");
            if let Ok(p) = as_port_number(old_port) {
                op.release_deferred(p);
            }
            spec_mut(service).health_check_node_port = None;
        }
        (true, true) => {
            if old_port != new_port {
                return Err(Error::invalid_field(
                    name_of(service),
                    "spec.healthCheckNodePort",
                    "cannot change the health check node port while externalTrafficPolicy is Local",
                ));
            }
        }
        (false, false) => {}
    }
    Ok(())
}

/// `externalTrafficPolicy` stops meaning anything when the service stops
/// being reachable through node ports; it is cleared so a stale value does
/// not confuse readers. Entering NodePort/LoadBalancer sets no default
/// here.
pub(crate) fn external_traffic_policy_update(old: &Service, service: &mut Service) {
    use crate::service::ServiceType;
    let needed = ServiceType::of(old).wants_node_ports();
    let needs = ServiceType::of(service).wants_node_ports();
    if needed && !needs && service::ExternalTrafficPolicy::of(service).is_some() {
        spec_mut(service).external_traffic_policy = None;
    }
}
